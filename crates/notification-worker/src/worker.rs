//! 通知工作者
//!
//! 为每个事件队列启动一个独立的消费循环，等待全部循环退出后关闭 broker 会话。
//! 单个循环失败（订阅失败或 panic）只记录到报告中，其余循环继续运行。

use std::collections::HashMap;
use std::sync::Arc;

use notify_shared::broker::MessageBroker;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::consumer::{ConsumerStats, QueueConsumer};
use crate::dispatcher::Dispatcher;
use crate::events::EventKind;

/// 单个队列的运行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Completed(ConsumerStats),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueReport {
    pub kind: EventKind,
    pub outcome: QueueOutcome,
}

/// 工作者退出时的汇总，按启动顺序排列
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub queues: Vec<QueueReport>,
}

impl WorkerReport {
    pub fn stats(&self, kind: EventKind) -> Option<ConsumerStats> {
        self.queues.iter().find_map(|q| match (&q.outcome, q.kind == kind) {
            (QueueOutcome::Completed(stats), true) => Some(*stats),
            _ => None,
        })
    }

    /// 循环异常退出的队列
    pub fn failed_queues(&self) -> Vec<&'static str> {
        self.queues
            .iter()
            .filter(|q| matches!(q.outcome, QueueOutcome::Failed(_)))
            .map(|q| q.kind.queue())
            .collect()
    }

    /// 每个队列的消费循环都失败，工作者实际上没有消费任何队列
    pub fn all_failed(&self) -> bool {
        !self.queues.is_empty()
            && self
                .queues
                .iter()
                .all(|q| matches!(q.outcome, QueueOutcome::Failed(_)))
    }

    pub fn total_acked(&self) -> u64 {
        self.completed().map(|s| s.acked).sum()
    }

    pub fn total_rejected(&self) -> u64 {
        self.completed().map(|s| s.rejected).sum()
    }

    fn completed(&self) -> impl Iterator<Item = &ConsumerStats> {
        self.queues.iter().filter_map(|q| match &q.outcome {
            QueueOutcome::Completed(stats) => Some(stats),
            QueueOutcome::Failed(_) => None,
        })
    }
}

/// 通知工作者
pub struct NotificationWorker {
    broker: Arc<dyn MessageBroker>,
    dispatcher: Arc<Dispatcher>,
    prefetch: usize,
    kinds: Vec<EventKind>,
}

impl NotificationWorker {
    /// 消费全部三种事件队列
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        dispatcher: Arc<Dispatcher>,
        prefetch: usize,
    ) -> Self {
        Self {
            broker,
            dispatcher,
            prefetch,
            kinds: EventKind::ALL.to_vec(),
        }
    }

    /// 只消费指定的事件队列
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// 运行直到所有消费循环退出
    ///
    /// 收到 shutdown 信号后各循环处理完手头的消息并关闭订阅，
    /// 全部退出后再关闭 broker 会话。
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> WorkerReport {
        let mut tasks = JoinSet::new();
        let mut task_kinds = HashMap::new();

        for kind in &self.kinds {
            let kind = *kind;
            let consumer = QueueConsumer::new(kind, self.prefetch, self.dispatcher.clone());
            let broker = self.broker.clone();
            let shutdown = shutdown.clone();
            let handle = tasks.spawn(async move {
                let result = consumer.run(broker.as_ref(), shutdown).await;
                (kind, result)
            });
            task_kinds.insert(handle.id(), kind);
        }

        info!(
            queues = ?self.kinds.iter().map(|k| k.queue()).collect::<Vec<_>>(),
            prefetch = self.prefetch,
            "通知工作者已启动"
        );

        let mut queues = Vec::with_capacity(self.kinds.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, Ok(stats))) => queues.push(QueueReport {
                    kind,
                    outcome: QueueOutcome::Completed(stats),
                }),
                Ok((kind, Err(e))) => {
                    error!(queue = kind.queue(), error = %e, "队列消费循环失败");
                    queues.push(QueueReport {
                        kind,
                        outcome: QueueOutcome::Failed(e.to_string()),
                    });
                }
                Err(e) => {
                    let Some(kind) = task_kinds.get(&e.id()).copied() else {
                        error!(error = %e, "未知的消费任务异常退出");
                        continue;
                    };
                    error!(queue = kind.queue(), error = %e, "队列消费任务异常退出");
                    queues.push(QueueReport {
                        kind,
                        outcome: QueueOutcome::Failed(e.to_string()),
                    });
                }
            }
        }

        self.broker.close().await;

        queues.sort_by_key(|q| self.kinds.iter().position(|k| *k == q.kind));
        let report = WorkerReport { queues };

        info!(
            acked = report.total_acked(),
            rejected = report.total_rejected(),
            failed = ?report.failed_queues(),
            "通知工作者已停止"
        );
        report
    }
}
