//! 多渠道通知发送器
//!
//! 通过 `NotificationSender` trait 抽象发送行为，邮件与短信各自提供实现。
//! 当前版本不接入真实服务商（仅记录渲染后的消息），
//! 替换为 SMTP 或短信网关调用时只需实现同一 trait。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use notify_shared::config::{ChannelsConfig, EmailConfig, SmsConfig};
use tracing::info;
use uuid::Uuid;

use crate::error::NotificationError;
use crate::templates::Notification;

/// 投递渠道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Email,
    Sms,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 投递成功的回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub channel: ChannelKind,
    /// 渠道侧的消息标识，用于追踪投递状态
    pub message_id: String,
}

/// 通知发送器 trait，各渠道实现具体的推送逻辑
///
/// 实现必须可以被多个消费循环并发调用。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// 发送通知，`Err` 表示该渠道投递失败
    async fn send(&self, notification: &Notification) -> Result<SendResult, NotificationError>;

    /// 该发送器对应的渠道
    fn channel(&self) -> ChannelKind;
}

// ---------------------------------------------------------------------------
// 邮件发送器
// ---------------------------------------------------------------------------

pub struct EmailSender {
    host: String,
    port: u16,
    user: String,
    pass: String,
    from: String,
}

impl EmailSender {
    pub fn new(config: &EmailConfig) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            user: config.smtp_user.clone(),
            pass: config.smtp_pass.clone(),
            from: config.from.clone(),
        }
    }

    /// SMTP 服务地址
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn compose(notification: &Notification) -> String {
        format!("Subject: {}\n\n{}\n\n", notification.subject, notification.body)
    }
}

#[async_trait]
impl NotificationSender for EmailSender {
    async fn send(&self, notification: &Notification) -> Result<SendResult, NotificationError> {
        let message_id = Uuid::now_v7().to_string();
        let authenticated = !self.user.is_empty() && !self.pass.is_empty();

        info!(
            channel = "EMAIL",
            message_id = %message_id,
            server = %self.address(),
            from = %self.from,
            to = %notification.recipient,
            authenticated,
            message = %Self::compose(notification),
            "Sent Email"
        );

        Ok(SendResult {
            channel: ChannelKind::Email,
            message_id,
        })
    }

    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }
}

// ---------------------------------------------------------------------------
// 短信发送器
// ---------------------------------------------------------------------------

pub struct SmsSender {
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl SmsSender {
    pub fn new(config: &SmsConfig) -> Self {
        Self {
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
        }
    }

    fn compose(notification: &Notification) -> String {
        format!("Subject: {}\n{}\n\n", notification.subject, notification.body)
    }
}

#[async_trait]
impl NotificationSender for SmsSender {
    async fn send(&self, notification: &Notification) -> Result<SendResult, NotificationError> {
        let message_id = Uuid::now_v7().to_string();
        let has_token = !self.auth_token.is_empty();

        info!(
            channel = "SMS",
            message_id = %message_id,
            account = %self.account_sid,
            has_token,
            from = %self.from_number,
            to = %notification.recipient,
            message = %Self::compose(notification),
            "Sent SMS"
        );

        Ok(SendResult {
            channel: ChannelKind::Sms,
            message_id,
        })
    }

    fn channel(&self) -> ChannelKind {
        ChannelKind::Sms
    }
}

/// 按配置注册启用的渠道，顺序即分发时的投递顺序
pub fn build_senders(config: &ChannelsConfig) -> Vec<Arc<dyn NotificationSender>> {
    let mut senders: Vec<Arc<dyn NotificationSender>> = Vec::new();
    if config.email.enabled {
        senders.push(Arc::new(EmailSender::new(&config.email)));
    }
    if config.sms.enabled {
        senders.push(Arc::new(SmsSender::new(&config.sms)));
    }
    senders
}
