//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 适配为 [`MessageBroker`] 语义：
//! 每个队列对应一个 topic 和一个独立的 `StreamConsumer`，
//! ack 存储 offset，reject 丢弃（可选转投死信 topic）或回退重投，
//! 预取上限在客户端拉取下一条记录之前强制执行。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::Offset;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{
    Acknowledger, Delivery, MessageBroker, PrefetchWindow, Subscription, ensure_prefetch,
};
use crate::config::KafkaConfig;
use crate::error::{Result, SharedError};

// ---------------------------------------------------------------------------
// 队列常量
// ---------------------------------------------------------------------------

/// 集中管理所有队列名称，防止字符串散落在各处导致拼写不一致
pub mod queues {
    pub const BOOK_CREATED: &str = "q.book.created";
    pub const BOOK_BORROWED: &str = "q.book.borrowed";
    pub const BOOK_RETURNED: &str = "q.book.returned";
}

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub queue: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        Self {
            queue: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
        }
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// Kafka 生产者
///
/// 会话探活与死信转投共用同一个 `FutureProducer`（内部是 Arc 包装的，可廉价 Clone）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| SharedError::Session(format!("创建生产者失败: {e}")))?;

        Ok(Self { producer })
    }

    /// 拉取集群元数据，验证 broker 可达
    ///
    /// rdkafka 的元数据请求是阻塞调用，放到 blocking 线程池执行。
    pub async fn fetch_broker_count(&self) -> Result<usize> {
        let producer = self.producer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(None, METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| SharedError::Internal(format!("元数据任务异常: {e}")))?
        .map_err(|e| SharedError::Session(format!("获取集群元数据失败: {e}")))?;

        Ok(metadata.brokers().len())
    }

    /// 发送原始字节消息
    pub async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(i32, i64)> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| SharedError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 刷出生产者缓冲区中尚未发送的消息
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| SharedError::Internal(format!("flush 任务异常: {e}")))?
            .map_err(|e| SharedError::Kafka(format!("刷新生产者失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaBroker
// ---------------------------------------------------------------------------

/// 基于 Kafka 的 broker 会话
pub struct KafkaBroker {
    config: KafkaConfig,
    producer: KafkaProducer,
}

impl KafkaBroker {
    /// 建立会话：创建生产者并确认集群可达
    ///
    /// 失败即为会话错误，进程无法进行任何消费。
    pub async fn connect(config: &KafkaConfig) -> Result<Self> {
        let producer = KafkaProducer::new(config)?;
        let broker_count = producer.fetch_broker_count().await?;

        info!(brokers = %config.brokers, broker_count, "Kafka 会话已建立");
        Ok(Self {
            config: config.clone(),
            producer,
        })
    }
}

/// 构造单个队列订阅所用的消费者配置
///
/// offset 由 ack 手动存储，自动提交只负责把已存储的 offset 周期性刷到集群。
fn consumer_client_config(config: &KafkaConfig, queue: &str) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", format!("{}.{}", config.consumer_group, queue))
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false");
    client
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn subscribe(&self, queue: &str, prefetch: usize) -> Result<Subscription> {
        let subscription_err = |reason: String| SharedError::Subscription {
            queue: queue.to_string(),
            reason,
        };
        ensure_prefetch(queue, prefetch)?;

        let consumer: StreamConsumer = consumer_client_config(&self.config, queue)
            .create()
            .map_err(|e| subscription_err(format!("创建消费者失败: {e}")))?;
        consumer
            .subscribe(&[queue])
            .map_err(|e| subscription_err(format!("订阅 topic 失败: {e}")))?;

        let consumer = Arc::new(consumer);
        let dead_letter = self
            .config
            .dead_letter_topic
            .clone()
            .map(|topic| (self.producer.clone(), topic));
        let acker: Arc<dyn Acknowledger> = Arc::new(KafkaAcknowledger {
            consumer: consumer.clone(),
            dead_letter,
        });

        let window = PrefetchWindow::new(prefetch);
        let (tx, rx) = mpsc::channel(prefetch);
        let pump = tokio::spawn(pump_stream(consumer, acker.clone(), window.clone(), tx));

        info!(queue, prefetch, "已订阅 Kafka 队列");
        Ok(Subscription::new(queue, window, rx, acker, pump))
    }

    async fn close(&self) {
        if let Err(e) = self.producer.flush(Duration::from_secs(5)).await {
            warn!(error = %e, "关闭会话时刷新生产者失败");
        }
        info!(brokers = %self.config.brokers, "Kafka 会话已关闭");
    }
}

/// 拉取任务：先占预取名额，再从消息流取下一条记录
///
/// 名额耗尽时不会再从 Kafka 拉取，相当于 broker 暂停投递；
/// 投递端关闭后立即退出，未存储 offset 的记录由下一个消费者重新拉取。
async fn pump_stream(
    consumer: Arc<StreamConsumer>,
    acker: Arc<dyn Acknowledger>,
    window: PrefetchWindow,
    tx: mpsc::Sender<Delivery>,
) {
    use futures::StreamExt;

    let stream = consumer.stream();
    futures::pin_mut!(stream);

    loop {
        let Some(permit) = window.acquire().await else {
            break;
        };

        let next = tokio::select! {
            biased;
            _ = tx.closed() => break,
            next = stream.next() => next,
        };
        let msg = match next {
            Some(Ok(borrowed)) => ConsumerMessage::from_borrowed(&borrowed),
            Some(Err(e)) => {
                error!(error = %e, "接收 Kafka 消息出错");
                continue;
            }
            None => {
                warn!("Kafka 消息流意外结束");
                break;
            }
        };

        debug!(
            queue = %msg.queue,
            partition = msg.partition,
            offset = msg.offset,
            outstanding = window.outstanding(),
            "收到 Kafka 消息"
        );

        if tx.send(Delivery::new(msg, acker.clone(), permit)).await.is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// KafkaAcknowledger
// ---------------------------------------------------------------------------

struct KafkaAcknowledger {
    consumer: Arc<StreamConsumer>,
    dead_letter: Option<(KafkaProducer, String)>,
}

impl KafkaAcknowledger {
    fn store(&self, message: &ConsumerMessage) -> Result<()> {
        self.consumer
            .store_offset(&message.queue, message.partition, message.offset + 1)
            .map_err(|e| ack_error(message, e))
    }
}

fn ack_error(message: &ConsumerMessage, e: KafkaError) -> SharedError {
    SharedError::Acknowledge {
        queue: message.queue.clone(),
        offset: message.offset,
        reason: e.to_string(),
    }
}

#[async_trait]
impl Acknowledger for KafkaAcknowledger {
    async fn ack(&self, message: &ConsumerMessage) -> Result<()> {
        self.store(message)
    }

    async fn reject(&self, message: &ConsumerMessage, requeue: bool) -> Result<()> {
        if requeue {
            // 回退到该 offset，下一次拉取会重新投递这条消息
            return self
                .consumer
                .seek(
                    &message.queue,
                    message.partition,
                    Offset::Offset(message.offset),
                    SEEK_TIMEOUT,
                )
                .map_err(|e| ack_error(message, e));
        }

        if let Some((producer, topic)) = &self.dead_letter {
            let key = message
                .key
                .clone()
                .unwrap_or_else(|| format!("{}-{}", message.partition, message.offset));
            if let Err(e) = producer.send(topic, &key, &message.payload).await {
                error!(
                    queue = %message.queue,
                    offset = message.offset,
                    error = %e,
                    "转投死信 topic 失败，消息将被丢弃"
                );
            }
        }

        self.store(message)
    }

    async fn flush(&self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            // 自上次提交以来没有新的 offset
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(SharedError::Kafka(format!("提交 offset 失败: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_constants() {
        assert_eq!(queues::BOOK_CREATED, "q.book.created");
        assert_eq!(queues::BOOK_BORROWED, "q.book.borrowed");
        assert_eq!(queues::BOOK_RETURNED, "q.book.returned");
    }

    #[test]
    fn test_consumer_client_config() {
        let config = KafkaConfig {
            brokers: "kafka-1:9092,kafka-2:9092".to_string(),
            consumer_group: "notifications".to_string(),
            ..Default::default()
        };

        let client = consumer_client_config(&config, queues::BOOK_BORROWED);

        assert_eq!(
            client.get("bootstrap.servers"),
            Some("kafka-1:9092,kafka-2:9092")
        );
        assert_eq!(client.get("group.id"), Some("notifications.q.book.borrowed"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("session.timeout.ms"), Some("10000"));
        // offset 只能由 ack 存储
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));
    }

    #[test]
    fn test_consumer_message_creation() {
        let msg = ConsumerMessage {
            queue: queues::BOOK_CREATED.to_string(),
            partition: 0,
            offset: 42,
            key: Some("book-1".to_string()),
            payload: b"{\"book_id\":1}".to_vec(),
            timestamp: Some(1_700_000_000_000),
        };

        assert_eq!(msg.queue, "q.book.created");
        assert_eq!(msg.offset, 42);
        assert_eq!(msg.key.as_deref(), Some("book-1"));
    }
}
