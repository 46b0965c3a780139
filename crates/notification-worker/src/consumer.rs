//! 队列消费循环
//!
//! 每个队列一个循环：订阅、逐条接收、同步分发、按分发结果确认或拒绝。
//! 分发在循环内 await 完成后才取下一条，同一订阅上的确认顺序与投递顺序一致。

use std::sync::Arc;
use std::time::Instant;

use notify_shared::broker::{Delivery, MessageBroker, Subscription};
use notify_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::{DecodeError, NotificationError};
use crate::events::EventKind;

/// 单条消息的结算方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    /// 拒绝且不重新入队，毒消息不会被反复投递
    RejectNoRequeue,
}

impl AckDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::RejectNoRequeue => "reject",
        }
    }
}

/// 分发结果到结算方式的映射
///
/// 只有解码失败会拒绝；渠道投递失败不影响确认。
pub fn ack_decision(result: &Result<DispatchReport, DecodeError>) -> AckDecision {
    match result {
        Ok(_) => AckDecision::Ack,
        Err(_) => AckDecision::RejectNoRequeue,
    }
}

/// 单个消费循环的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub rejected: u64,
    /// 结算调用本身失败的次数（broker 侧错误）
    pub settle_failures: u64,
}

/// 循环结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    StreamEnded,
    Shutdown,
}

/// 单队列消费者
pub struct QueueConsumer {
    kind: EventKind,
    prefetch: usize,
    dispatcher: Arc<Dispatcher>,
}

impl QueueConsumer {
    pub fn new(kind: EventKind, prefetch: usize, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            kind,
            prefetch,
            dispatcher,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn queue(&self) -> &'static str {
        self.kind.queue()
    }

    /// 启动消费循环，直到消息流结束或收到 shutdown 信号
    ///
    /// 订阅建立失败时返回错误，只影响本循环。
    pub async fn run(
        &self,
        broker: &dyn MessageBroker,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerStats, NotificationError> {
        let queue = self.queue();
        let mut subscription = broker.subscribe(queue, self.prefetch).await?;

        info!(queue, prefetch = subscription.prefetch(), "队列消费者已启动");

        let mut stats = ConsumerStats::default();
        let reason = self
            .receive(&mut subscription, &mut shutdown, &mut stats)
            .await;

        if let Err(e) = subscription.close().await {
            warn!(queue, error = %e, "关闭订阅失败");
        }

        info!(
            queue,
            reason = ?reason,
            acked = stats.acked,
            rejected = stats.rejected,
            "队列消费者已停止"
        );
        Ok(stats)
    }

    async fn receive(
        &self,
        subscription: &mut Subscription,
        shutdown: &mut watch::Receiver<bool>,
        stats: &mut ConsumerStats,
    ) -> StopReason {
        if *shutdown.borrow() {
            return StopReason::Shutdown;
        }

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // 发送端被丢弃同样视为关闭
                    if changed.is_err() || *shutdown.borrow() {
                        info!(queue = self.queue(), "收到关闭信号，停止接收新消息");
                        return StopReason::Shutdown;
                    }
                }
                delivery = subscription.next() => {
                    let Some(delivery) = delivery else {
                        debug!(queue = self.queue(), "消息流已结束");
                        return StopReason::StreamEnded;
                    };
                    self.handle_delivery(delivery, stats).await;
                }
            }
        }
    }

    /// 处理并结算单条投递
    async fn handle_delivery(&self, delivery: Delivery, stats: &mut ConsumerStats) {
        let started = Instant::now();
        let queue = self.queue();
        let offset = delivery.message().offset;

        let result = self.dispatcher.dispatch(self.kind, delivery.payload()).await;
        let decision = ack_decision(&result);

        if let Err(e) = &result {
            error!(queue, offset, error = %e, "消息解码失败，拒绝且不重新入队");
        }

        let settled = match decision {
            AckDecision::Ack => delivery.ack().await,
            AckDecision::RejectNoRequeue => delivery.reject(false).await,
        };

        match settled {
            Ok(()) => match decision {
                AckDecision::Ack => stats.acked += 1,
                AckDecision::RejectNoRequeue => stats.rejected += 1,
            },
            Err(e) => {
                stats.settle_failures += 1;
                error!(
                    queue,
                    offset,
                    decision = decision.as_str(),
                    error = %e,
                    "消息结算失败"
                );
            }
        }

        metrics::record_message(queue, decision.as_str(), started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{ChannelKind, MockNotificationSender, NotificationSender, SendResult};
    use notify_shared::memory::{InMemoryBroker, SettlementKind};

    fn counting_sender(times: usize) -> Arc<dyn NotificationSender> {
        let mut sender = MockNotificationSender::new();
        sender.expect_channel().return_const(ChannelKind::Email);
        sender.expect_send().times(times).returning(|_| {
            Ok(SendResult {
                channel: ChannelKind::Email,
                message_id: "m-1".to_string(),
            })
        });
        Arc::new(sender)
    }

    #[tokio::test]
    async fn test_ack_decision() {
        let dispatcher = Dispatcher::new(Vec::new());

        let ok = dispatcher.dispatch(EventKind::BookCreated, b"{}").await;
        assert_eq!(ack_decision(&ok), AckDecision::Ack);

        let bad = dispatcher.dispatch(EventKind::BookCreated, b"[1,").await;
        assert_eq!(ack_decision(&bad), AckDecision::RejectNoRequeue);
    }

    #[tokio::test]
    async fn test_run_settles_until_stream_ends() {
        let broker = InMemoryBroker::new();
        let queue = EventKind::BookBorrowed.queue();
        broker.publish(queue, br#"{"book_title":"Dune","member_phone":"+1555"}"#.to_vec());
        broker.publish(queue, b"garbage".to_vec());
        broker.publish(queue, b"{}".to_vec());
        broker.close_queue(queue);

        let dispatcher = Arc::new(Dispatcher::new(vec![counting_sender(2)]));
        let consumer = QueueConsumer::new(EventKind::BookBorrowed, 10, dispatcher);
        let (_tx, rx) = watch::channel(false);

        let stats = consumer.run(&broker, rx).await.unwrap();
        assert_eq!(
            stats,
            ConsumerStats {
                acked: 2,
                rejected: 1,
                settle_failures: 0
            }
        );

        let kinds: Vec<_> = broker
            .settlements_for(queue)
            .into_iter()
            .map(|s| (s.offset, s.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (0, SettlementKind::Ack),
                (1, SettlementKind::Reject { requeue: false }),
                (2, SettlementKind::Ack),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let dispatcher = Arc::new(Dispatcher::new(Vec::new()));
        let consumer = QueueConsumer::new(EventKind::BookCreated, 10, dispatcher);
        let (tx, rx) = watch::channel(false);

        let task_broker = broker.clone();
        let handle = tokio::spawn(async move { consumer.run(task_broker.as_ref(), rx).await });

        tokio::task::yield_now().await;
        tx.send(true).unwrap();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats, ConsumerStats::default());
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_stops_loop() {
        let broker = InMemoryBroker::new();
        let consumer = QueueConsumer::new(
            EventKind::BookReturned,
            10,
            Arc::new(Dispatcher::new(Vec::new())),
        );
        let (tx, rx) = watch::channel(false);
        drop(tx);

        let stats = consumer.run(&broker, rx).await.unwrap();
        assert_eq!(stats.acked, 0);
    }

    #[tokio::test]
    async fn test_subscription_failure_is_returned() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(EventKind::BookCreated.queue());

        let consumer = QueueConsumer::new(
            EventKind::BookCreated,
            10,
            Arc::new(Dispatcher::new(Vec::new())),
        );
        let (_tx, rx) = watch::channel(false);

        let err = consumer.run(&broker, rx).await.unwrap_err();
        assert!(matches!(
            err,
            NotificationError::Shared(notify_shared::error::SharedError::Subscription { .. })
        ));
    }
}
