//! 图书馆通知服务
//!
//! 消费图书事件队列，推送邮件与短信通知。

use std::sync::Arc;

use anyhow::{Context, Result};
use notify_shared::{config::AppConfig, kafka::KafkaBroker, observability};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use notification_worker::{
    dispatcher::Dispatcher, sender::build_senders, worker::NotificationWorker,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. .env 文件可选，不存在时只依赖进程环境变量
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        eprintln!("Failed to load .env file: {e}");
    }

    // 2. 加载配置，缺少必要配置时直接退出
    let config = AppConfig::load("notification-worker").context("加载配置失败")?;

    let _guard = observability::init(&config.service_name, &config.observability)?;

    info!("Starting notification-worker...");
    info!(
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        prefetch = config.consumer.prefetch,
        "Configuration loaded"
    );

    // 3. 建立 broker 会话，失败时进程无法工作
    let broker = KafkaBroker::connect(&config.kafka)
        .await
        .inspect_err(|e| error!(error = %e, "Kafka 会话建立失败"))?;

    // 4. 注册渠道
    let senders = build_senders(&config.channels);
    if senders.is_empty() {
        warn!("未启用任何通知渠道，消息将只被确认而不投递");
    }
    let dispatcher = Arc::new(Dispatcher::new(senders));
    info!(channels = ?dispatcher.channels(), "Notification channels configured");

    // 5. 启动消费循环
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = NotificationWorker::new(Arc::new(broker), dispatcher, config.consumer.prefetch);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let report = worker_handle.await.context("通知工作者异常退出")?;

    let failed = report.failed_queues();
    if report.all_failed() {
        error!(failed = ?failed, "所有队列消费循环均失败");
        anyhow::bail!("所有队列消费循环均失败: {}", failed.join(", "));
    }
    if !failed.is_empty() {
        warn!(failed = ?failed, "部分队列消费循环失败");
    }

    info!(
        acked = report.total_acked(),
        rejected = report.total_rejected(),
        "Service shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
