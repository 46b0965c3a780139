//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过 exporter 自带的 HTTP 监听端口暴露，供 Prometheus 抓取。

use std::net::SocketAddr;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::config::ObservabilityConfig;

/// 消费的消息数，按队列和确认结果区分
pub const MESSAGES_TOTAL: &str = "notification_messages_total";
/// 渠道投递次数，按渠道和结果区分
pub const DELIVERIES_TOTAL: &str = "notification_deliveries_total";
/// 单条消息从收到到确认的耗时
pub const MESSAGE_DURATION_SECONDS: &str = "notification_message_duration_seconds";

/// 安装 Prometheus recorder 并启动 `/metrics` 监听
///
/// 必须在 tokio 运行时内调用。
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    register_metrics(service_name);
    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn register_metrics(service_name: &str) {
    metrics::describe_counter!(MESSAGES_TOTAL, "Total number of consumed messages");
    metrics::describe_counter!(
        DELIVERIES_TOTAL,
        "Total number of notification delivery attempts"
    );
    metrics::describe_histogram!(
        MESSAGE_DURATION_SECONDS,
        "Message processing duration in seconds"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 记录一条消息的确认结果
#[inline]
pub fn record_message(queue: &str, decision: &'static str, duration_secs: f64) {
    metrics::counter!(
        MESSAGES_TOTAL,
        "queue" => queue.to_string(),
        "decision" => decision
    )
    .increment(1);

    metrics::histogram!(
        MESSAGE_DURATION_SECONDS,
        "queue" => queue.to_string()
    )
    .record(duration_secs);
}

/// 记录一次渠道投递
#[inline]
pub fn record_delivery(channel: &'static str, success: bool) {
    let status = if success { "delivered" } else { "failed" };
    metrics::counter!(
        DELIVERIES_TOTAL,
        "channel" => channel,
        "status" => status
    )
    .increment(1);
}
