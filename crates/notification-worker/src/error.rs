//! 通知服务错误类型
//!
//! 区分两类截然不同的失败：消息解码失败（上游契约违规，拒绝且不重投）
//! 与渠道投递失败（外部瞬时故障，只记录不上抛）。

use thiserror::Error;

use crate::events::EventKind;

/// 消息负载与队列对应的事件结构不匹配
#[derive(Debug, Error)]
#[error("事件解码失败: kind={kind}, 原因={source}")]
pub struct DecodeError {
    pub kind: EventKind,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("通知发送失败: 渠道={channel}, 原因={reason}")]
    SendFailed { channel: String, reason: String },

    #[error(transparent)]
    Shared(#[from] notify_shared::error::SharedError),
}
