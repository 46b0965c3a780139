//! 内存 broker
//!
//! 进程内实现的 [`MessageBroker`]，与 Kafka 实现遵循相同的预取与确认语义。
//! 记录每条消息的结算结果和每个队列的未确认峰值，供集成测试断言。
//! 订阅关闭时未交给消费者的消息会回到队列头部，下一个订阅按 offset 顺序重新收到。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{
    Acknowledger, Delivery, MessageBroker, PrefetchWindow, Subscription, ensure_prefetch,
};
use crate::error::{Result, SharedError};
use crate::kafka::ConsumerMessage;

type Envelope = (i64, Vec<u8>);
type QueueMap = Arc<Mutex<HashMap<String, QueueSlot>>>;

/// 单条消息的结算方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementKind {
    Ack,
    Reject { requeue: bool },
}

/// 结算记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub queue: String,
    pub offset: i64,
    pub kind: SettlementKind,
}

struct QueueSlot {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
    /// 订阅期间由拉取任务持有，订阅关闭后归还
    rx: Option<mpsc::UnboundedReceiver<Envelope>>,
    /// 被归还的消息，先于 `rx` 中的消息投递，按 offset 升序
    pending: Arc<Mutex<VecDeque<Envelope>>>,
    next_offset: AtomicI64,
    peak_outstanding: Arc<AtomicUsize>,
}

impl QueueSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            next_offset: AtomicI64::new(0),
            peak_outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn restore_pending(pending: &Mutex<VecDeque<Envelope>>, envelope: Envelope) {
    let mut pending = pending.lock();
    let idx = pending.partition_point(|(offset, _)| *offset < envelope.0);
    pending.insert(idx, envelope);
}

/// 内存 broker
#[derive(Default)]
pub struct InMemoryBroker {
    queues: QueueMap,
    settlements: Arc<Mutex<Vec<Settlement>>>,
    unavailable: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 向队列发布一条消息，返回分配的 offset
    ///
    /// 队列发布端已关闭时消息被丢弃并返回 `None`。
    pub fn publish(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Option<i64> {
        let mut queues = self.queues.lock();
        let slot = queues
            .entry(queue.to_string())
            .or_insert_with(QueueSlot::new);
        let Some(tx) = &slot.tx else {
            warn!(queue, "队列发布端已关闭，消息被丢弃");
            return None;
        };
        let offset = slot.next_offset.fetch_add(1, Ordering::SeqCst);
        if tx.send((offset, payload.into())).is_err() {
            warn!(queue, offset, "队列接收端已释放，消息被丢弃");
            return None;
        }
        Some(offset)
    }

    /// 关闭队列的发布端：已发布的消息消费完后消息流结束
    pub fn close_queue(&self, queue: &str) {
        let mut queues = self.queues.lock();
        let slot = queues
            .entry(queue.to_string())
            .or_insert_with(QueueSlot::new);
        slot.tx = None;
    }

    /// 标记队列不可订阅，模拟订阅建立失败
    pub fn set_unavailable(&self, queue: &str) {
        self.unavailable.lock().insert(queue.to_string());
    }

    /// 所有队列的结算记录，按结算发生的先后排列
    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements.lock().clone()
    }

    /// 指定队列的结算记录
    pub fn settlements_for(&self, queue: &str) -> Vec<Settlement> {
        self.settlements
            .lock()
            .iter()
            .filter(|s| s.queue == queue)
            .cloned()
            .collect()
    }

    /// 队列订阅期间观察到的未确认消息峰值
    pub fn peak_outstanding(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map(|slot| slot.peak_outstanding.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn subscribe(&self, queue: &str, prefetch: usize) -> Result<Subscription> {
        let subscription_err = |reason: &str| SharedError::Subscription {
            queue: queue.to_string(),
            reason: reason.to_string(),
        };

        ensure_prefetch(queue, prefetch)?;
        if self.is_closed() {
            return Err(subscription_err("会话已关闭"));
        }
        if self.unavailable.lock().contains(queue) {
            return Err(subscription_err("队列不可用"));
        }

        let (source, requeue_tx, pending, peak) = {
            let mut queues = self.queues.lock();
            let slot = queues
                .entry(queue.to_string())
                .or_insert_with(QueueSlot::new);
            let source = slot
                .rx
                .take()
                .ok_or_else(|| subscription_err("队列已被订阅"))?;
            let requeue_tx = slot.tx.as_ref().map(|tx| tx.downgrade());
            (
                source,
                requeue_tx,
                slot.pending.clone(),
                slot.peak_outstanding.clone(),
            )
        };

        let acker: Arc<dyn Acknowledger> = Arc::new(MemoryAcknowledger {
            settlements: self.settlements.clone(),
            requeue_tx,
            pending: pending.clone(),
        });

        let window = PrefetchWindow::new(prefetch);
        let (tx, rx) = mpsc::channel(prefetch);
        let pump = tokio::spawn(pump_queue(
            PumpSource {
                queue: queue.to_string(),
                queues: self.queues.clone(),
                source,
                pending,
                peak,
            },
            acker.clone(),
            window.clone(),
            tx,
        ));

        debug!(queue, prefetch, "已订阅内存队列");
        Ok(Subscription::new(queue, window, rx, acker, pump))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        info!("内存 broker 会话已关闭");
    }
}

/// 拉取任务独占的队列状态，任务退出时把接收端交还给队列
struct PumpSource {
    queue: String,
    queues: QueueMap,
    source: mpsc::UnboundedReceiver<Envelope>,
    pending: Arc<Mutex<VecDeque<Envelope>>>,
    peak: Arc<AtomicUsize>,
}

impl PumpSource {
    /// 先取被归还的消息，再等待新发布的消息；投递端关闭时返回 `None`
    async fn next(&mut self, tx: &mpsc::Sender<Delivery>) -> Option<Envelope> {
        let restored = self.pending.lock().pop_front();
        if restored.is_some() {
            return restored;
        }
        tokio::select! {
            biased;
            _ = tx.closed() => None,
            envelope = self.source.recv() => envelope,
        }
    }

    fn give_back(self) {
        if let Some(slot) = self.queues.lock().get_mut(&self.queue) {
            slot.rx = Some(self.source);
        }
    }
}

async fn pump_queue(
    mut source: PumpSource,
    acker: Arc<dyn Acknowledger>,
    window: PrefetchWindow,
    tx: mpsc::Sender<Delivery>,
) {
    loop {
        let Some(permit) = window.acquire().await else {
            break;
        };
        let Some((offset, payload)) = source.next(&tx).await else {
            break;
        };

        source
            .peak
            .fetch_max(window.outstanding(), Ordering::SeqCst);

        let msg = ConsumerMessage {
            queue: source.queue.clone(),
            partition: 0,
            offset,
            key: None,
            payload,
            timestamp: Some(Utc::now().timestamp_millis()),
        };
        if let Err(mpsc::error::SendError(delivery)) =
            tx.send(Delivery::new(msg, acker.clone(), permit)).await
        {
            let msg = delivery.into_message();
            restore_pending(&source.pending, (msg.offset, msg.payload));
            break;
        }
    }
    source.give_back();
}

struct MemoryAcknowledger {
    settlements: Arc<Mutex<Vec<Settlement>>>,
    requeue_tx: Option<mpsc::WeakUnboundedSender<Envelope>>,
    pending: Arc<Mutex<VecDeque<Envelope>>>,
}

impl MemoryAcknowledger {
    fn record(&self, message: &ConsumerMessage, kind: SettlementKind) {
        self.settlements.lock().push(Settlement {
            queue: message.queue.clone(),
            offset: message.offset,
            kind,
        });
    }
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self, message: &ConsumerMessage) -> Result<()> {
        self.record(message, SettlementKind::Ack);
        Ok(())
    }

    async fn reject(&self, message: &ConsumerMessage, requeue: bool) -> Result<()> {
        self.record(message, SettlementKind::Reject { requeue });
        if requeue {
            let tx = self
                .requeue_tx
                .as_ref()
                .and_then(|weak| weak.upgrade())
                .ok_or_else(|| SharedError::Acknowledge {
                    queue: message.queue.clone(),
                    offset: message.offset,
                    reason: "队列发布端已关闭，无法重新入队".to_string(),
                })?;
            tx.send((message.offset, message.payload.clone()))
                .map_err(|e| SharedError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn release(&self, message: &ConsumerMessage) -> Result<()> {
        restore_pending(&self.pending, (message.offset, message.payload.clone()));
        Ok(())
    }
}
