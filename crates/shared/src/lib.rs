//! 共享库
//!
//! 包含通知服务共用的配置、错误处理、broker 抽象（Kafka 与内存实现）和可观测性等基础设施代码。

pub mod broker;
pub mod config;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod observability;
