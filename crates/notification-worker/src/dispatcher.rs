//! 事件分发器
//!
//! 解码原始消息、渲染通知，然后逐个渠道投递。
//! 解码失败直接返回错误且不触达任何渠道；渠道投递失败只记录日志和指标，
//! 不中断后续渠道，也不影响分发结果。

use std::sync::Arc;

use notify_shared::observability::metrics;
use tracing::{debug, info, warn};

use crate::error::DecodeError;
use crate::events::{EventKind, LibraryEvent};
use crate::sender::{ChannelKind, NotificationSender};
use crate::templates::{self, Notification};

/// 单个渠道的投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        channel: ChannelKind,
        message_id: String,
    },
    Failed {
        channel: ChannelKind,
        reason: String,
    },
}

impl DeliveryOutcome {
    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::Delivered { channel, .. } | Self::Failed { channel, .. } => *channel,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// 一次分发的汇总
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub kind: EventKind,
    pub notification: Notification,
    /// 按渠道注册顺序排列，每个渠道恰好一条
    pub outcomes: Vec<DeliveryOutcome>,
}

impl DispatchReport {
    pub fn delivered_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_delivered()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.delivered_count()
    }
}

/// 事件分发器
///
/// 渠道列表在启动时确定，之后只读，可被多个消费循环共享。
pub struct Dispatcher {
    senders: Vec<Arc<dyn NotificationSender>>,
}

impl Dispatcher {
    pub fn new(senders: Vec<Arc<dyn NotificationSender>>) -> Self {
        Self { senders }
    }

    /// 已注册的渠道
    pub fn channels(&self) -> Vec<ChannelKind> {
        self.senders.iter().map(|s| s.channel()).collect()
    }

    /// 分发一条消息
    ///
    /// 只要解码成功就返回 `Ok`，无论有多少渠道投递失败。
    pub async fn dispatch(
        &self,
        kind: EventKind,
        payload: &[u8],
    ) -> Result<DispatchReport, DecodeError> {
        let event = LibraryEvent::decode(kind, payload)?;
        let notification = templates::render(&event);

        debug!(
            kind = %kind,
            book_id = event.book_id(),
            recipient = %notification.recipient,
            "事件已解码"
        );

        let outcomes = deliver(&self.senders, &notification).await;

        info!(
            kind = %kind,
            book_id = event.book_id(),
            total_channels = outcomes.len(),
            success_count = outcomes.iter().filter(|o| o.is_delivered()).count(),
            "通知分发完成"
        );

        Ok(DispatchReport {
            kind,
            notification,
            outcomes,
        })
    }
}

/// 按注册顺序依次投递到每个渠道
///
/// 单个渠道失败只记录，不会阻止其余渠道的投递。
pub async fn deliver(
    senders: &[Arc<dyn NotificationSender>],
    notification: &Notification,
) -> Vec<DeliveryOutcome> {
    let mut outcomes = Vec::with_capacity(senders.len());

    for sender in senders {
        let channel = sender.channel();
        let outcome = match sender.send(notification).await {
            Ok(result) => DeliveryOutcome::Delivered {
                channel,
                message_id: result.message_id,
            },
            Err(e) => {
                warn!(
                    channel = %channel,
                    recipient = %notification.recipient,
                    error = %e,
                    "渠道发送失败"
                );
                DeliveryOutcome::Failed {
                    channel,
                    reason: e.to_string(),
                }
            }
        };
        metrics::record_delivery(channel.as_str(), outcome.is_delivered());
        outcomes.push(outcome);
    }

    outcomes
}
