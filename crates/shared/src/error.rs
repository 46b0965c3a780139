//! 统一错误处理模块
//!
//! 定义 broker 会话、订阅、消息确认与配置加载等基础设施层的共享错误类型。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum SharedError {
    // ==================== 配置错误 ====================
    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    #[error("配置无效: {field} - {message}")]
    InvalidConfig { field: String, message: String },

    // ==================== Broker 错误 ====================
    #[error("broker 会话建立失败: {0}")]
    Session(String),

    #[error("订阅队列失败: queue={queue}, 原因={reason}")]
    Subscription { queue: String, reason: String },

    #[error("消息确认失败: queue={queue}, offset={offset}, 原因={reason}")]
    Acknowledge {
        queue: String,
        offset: i64,
        reason: String,
    },

    #[error("Kafka 错误: {0}")]
    Kafka(String),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, SharedError>;

impl SharedError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Session(_) => "SESSION_ERROR",
            Self::Subscription { .. } => "SUBSCRIPTION_ERROR",
            Self::Acknowledge { .. } => "ACKNOWLEDGE_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 配置类错误重试也不会成功；会话与订阅错误通常是网络或 broker 暂时不可用。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Session(_) | Self::Subscription { .. } | Self::Kafka(_)
        )
    }
}
