//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::error::{Result, SharedError};

/// 默认 SMTP 端口（STARTTLS）
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// 默认预取上限：单个订阅同时未确认的消息数
pub const DEFAULT_PREFETCH: usize = 10;

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
    /// 被拒绝（不重新入队）的消息转投的 topic，为空时直接丢弃
    pub dead_letter_topic: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "notification-worker".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 10_000,
            dead_letter_topic: None,
        }
    }
}

/// 消费循环配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub prefetch: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

/// 邮件渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub from: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            smtp_host: "localhost".to_string(),
            smtp_port: DEFAULT_SMTP_PORT,
            smtp_user: String::new(),
            smtp_pass: String::new(),
            from: "noreply@library.local".to_string(),
        }
    }
}

/// 短信渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub enabled: bool,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
        }
    }
}

/// 通知渠道配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ChannelsConfig {
    pub email: EmailConfig,
    pub sms: SmsConfig,
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 是否输出 JSON 结构化日志
    pub json_logs: bool,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub kafka: KafkaConfig,
    pub consumer: ConsumerConfig,
    pub channels: ChannelsConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（NOTIFY__ 前缀，如 NOTIFY__KAFKA__BROKERS -> kafka.brokers）
    /// 5. 渠道服务商的传统环境变量（SMTP_HOST、TWILIO_ACCOUNT_SID 等）
    pub fn load(service_name: &str) -> Result<Self> {
        let env = std::env::var("NOTIFY_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("NOTIFY")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// 应用渠道服务商的传统环境变量
    ///
    /// 部署脚本沿用 SMTP_* / EMAIL_FROM / TWILIO_* 变量名，这里映射到对应配置项。
    /// `lookup` 抽象出环境变量读取，便于测试注入。
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let email = &mut self.channels.email;
        if let Some(host) = lookup("SMTP_HOST") {
            email.smtp_host = host;
        }
        if let Some(port) = lookup("SMTP_PORT").filter(|p| !p.is_empty()) {
            email.smtp_port = port.parse().map_err(|e| SharedError::InvalidConfig {
                field: "SMTP_PORT".to_string(),
                message: format!("必须是合法端口号: {e}"),
            })?;
        }
        if let Some(user) = lookup("SMTP_USER") {
            email.smtp_user = user;
        }
        if let Some(pass) = lookup("SMTP_PASS") {
            email.smtp_pass = pass;
        }
        if let Some(from) = lookup("EMAIL_FROM") {
            email.from = from;
        }

        let sms = &mut self.channels.sms;
        if let Some(sid) = lookup("TWILIO_ACCOUNT_SID") {
            sms.account_sid = sid;
        }
        if let Some(token) = lookup("TWILIO_AUTH_TOKEN") {
            sms.auth_token = token;
        }
        if let Some(number) = lookup("TWILIO_FROM_NUMBER") {
            sms.from_number = number;
        }

        Ok(())
    }

    /// 校验启动必需的配置项
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.trim().is_empty() {
            return Err(SharedError::InvalidConfig {
                field: "kafka.brokers".to_string(),
                message: "broker 地址不能为空".to_string(),
            });
        }
        if self.consumer.prefetch == 0 {
            return Err(SharedError::InvalidConfig {
                field: "consumer.prefetch".to_string(),
                message: "预取上限必须大于 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.consumer.prefetch, 10);
        assert_eq!(config.channels.email.smtp_port, 587);
        assert!(config.channels.email.enabled);
        assert!(config.channels.sms.enabled);
        assert!(config.kafka.dead_letter_topic.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("SMTP_HOST", "smtp.library.org"),
            ("SMTP_PORT", "2525"),
            ("EMAIL_FROM", "desk@library.org"),
            ("TWILIO_FROM_NUMBER", "+15550001111"),
        ]);

        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.channels.email.smtp_host, "smtp.library.org");
        assert_eq!(config.channels.email.smtp_port, 2525);
        assert_eq!(config.channels.email.from, "desk@library.org");
        assert_eq!(config.channels.sms.from_number, "+15550001111");
        // 未设置的变量保持原值
        assert_eq!(config.channels.email.smtp_user, "");
    }

    #[test]
    fn test_empty_smtp_port_keeps_default() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|key| (key == "SMTP_PORT").then(String::new))
            .unwrap();
        assert_eq!(config.channels.email.smtp_port, DEFAULT_SMTP_PORT);
    }

    #[test]
    fn test_invalid_smtp_port() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == "SMTP_PORT").then(|| "abc".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_validate_rejects_missing_brokers() {
        let config = AppConfig {
            kafka: KafkaConfig {
                brokers: "  ".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_prefetch() {
        let config = AppConfig {
            consumer: ConsumerConfig { prefetch: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
