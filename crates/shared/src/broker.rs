//! 消息 broker 抽象
//!
//! 消费侧只依赖三件事：按队列名打开带预取上限的订阅、逐条接收投递、
//! 对每条投递做确认（ack）或拒绝（reject，可选重新入队）。
//! Kafka 与内存两种实现都遵循同一套语义，消费循环对具体 broker 无感知。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, SharedError};
use crate::kafka::ConsumerMessage;

/// 关闭订阅时等待拉取任务自行退出的上限
const PUMP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// MessageBroker: 会话
// ---------------------------------------------------------------------------

/// 已建立的 broker 会话
///
/// 会话本身的建立（拨号、认证）由具体实现的构造函数负责，
/// 到达这里时会话已经可用。
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// 打开一个队列订阅
    ///
    /// 订阅建立后，同时处于"已投递未确认"状态的消息不会超过 `prefetch` 条。
    /// `prefetch` 为 0 时返回订阅错误。
    async fn subscribe(&self, queue: &str, prefetch: usize) -> Result<Subscription>;

    /// 释放会话资源，应在所有订阅关闭之后调用
    async fn close(&self);
}

/// 校验预取上限，供各 broker 实现在建立订阅前调用
pub fn ensure_prefetch(queue: &str, prefetch: usize) -> Result<()> {
    if prefetch == 0 {
        return Err(SharedError::Subscription {
            queue: queue.to_string(),
            reason: "prefetch 必须大于 0".to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Acknowledger: 确认通道
// ---------------------------------------------------------------------------

/// 单个订阅的确认通道，由 broker 实现提供
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, message: &ConsumerMessage) -> Result<()>;

    async fn reject(&self, message: &ConsumerMessage, requeue: bool) -> Result<()>;

    /// 归还一条已预取但从未交给消费者的消息，使其可被下一个订阅重新投递
    ///
    /// broker 自身会重投未确认消息时无需实现。
    async fn release(&self, _message: &ConsumerMessage) -> Result<()> {
        Ok(())
    }

    /// 订阅关闭前调用，用于提交尚未落盘的确认状态
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PrefetchWindow: 预取窗口
// ---------------------------------------------------------------------------

/// 预取窗口
///
/// 每条投递在交给消费者之前必须先拿到一个许可，许可随确认/拒绝一起释放。
/// 许可耗尽时 broker 侧的拉取任务会挂起，从而停止继续投递。
#[derive(Clone)]
pub struct PrefetchWindow {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl PrefetchWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// 等待一个空闲的预取名额
    ///
    /// 只有窗口被关闭时才返回 `None`。
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// 当前已投递但尚未确认的消息数
    pub fn outstanding(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 关闭窗口，唤醒所有等待中的拉取任务
    pub fn close(&self) {
        self.permits.close();
    }
}

// ---------------------------------------------------------------------------
// Delivery: 单条投递
// ---------------------------------------------------------------------------

/// 一条已投递、待确认的消息
///
/// 确认和拒绝都会消费掉 `Delivery`，保证每条消息只被结算一次；
/// 结算完成后预取许可随之释放。
pub struct Delivery {
    message: ConsumerMessage,
    acker: Arc<dyn Acknowledger>,
    _permit: OwnedSemaphorePermit,
}

impl Delivery {
    pub fn new(
        message: ConsumerMessage,
        acker: Arc<dyn Acknowledger>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            message,
            acker,
            _permit: permit,
        }
    }

    pub fn message(&self) -> &ConsumerMessage {
        &self.message
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    /// 放弃投递，取回消息本身；预取许可随之释放
    pub fn into_message(self) -> ConsumerMessage {
        self.message
    }

    /// 正向确认：broker 视为已消费
    pub async fn ack(self) -> Result<()> {
        self.acker.ack(&self.message).await
    }

    /// 负向确认：`requeue` 为 false 时消息被丢弃，不会再次投递
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(&self.message, requeue).await
    }
}

// ---------------------------------------------------------------------------
// Subscription: 队列订阅
// ---------------------------------------------------------------------------

/// 队列订阅
///
/// 内部由 broker 的拉取任务（pump）向有界 channel 推送投递；
/// channel 关闭即代表消息流结束。
pub struct Subscription {
    queue: String,
    window: PrefetchWindow,
    deliveries: mpsc::Receiver<Delivery>,
    acker: Arc<dyn Acknowledger>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        queue: impl Into<String>,
        window: PrefetchWindow,
        deliveries: mpsc::Receiver<Delivery>,
        acker: Arc<dyn Acknowledger>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            queue: queue.into(),
            window,
            deliveries,
            acker,
            pump: Some(pump),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn prefetch(&self) -> usize {
        self.window.limit()
    }

    /// 当前已投递但未确认的消息数
    pub fn outstanding(&self) -> usize {
        self.window.outstanding()
    }

    /// 等待下一条投递，消息流结束时返回 `None`
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// 关闭订阅
    ///
    /// 先停止拉取并等待拉取任务退出，再把已预取但未处理的投递逐条归还给 broker，
    /// 最后提交确认状态。归还的消息既不确认也不拒绝。
    pub async fn close(mut self) -> Result<()> {
        self.window.close();
        self.deliveries.close();
        if let Some(mut pump) = self.pump.take()
            && tokio::time::timeout(PUMP_STOP_TIMEOUT, &mut pump).await.is_err()
        {
            warn!(queue = %self.queue, "拉取任务未能按时退出，强制终止");
            pump.abort();
            let _ = pump.await;
        }

        let mut released = 0usize;
        while let Ok(delivery) = self.deliveries.try_recv() {
            let message = delivery.into_message();
            if let Err(e) = self.acker.release(&message).await {
                warn!(
                    queue = %self.queue,
                    offset = message.offset,
                    error = %e,
                    "归还预取消息失败"
                );
            }
            released += 1;
        }
        debug!(queue = %self.queue, released, "订阅已关闭");
        self.acker.flush().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
