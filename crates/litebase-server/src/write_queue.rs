//! Per-database write serialisation.
//!
//! Every database branch gets one worker task that runs its write jobs one at
//! a time in arrival order. The worker exits after sitting idle and is
//! restarted by the next push.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::query::DatabaseKey;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

type SenderSlot = Arc<Mutex<Option<mpsc::Sender<Job>>>>;

pub struct WriteQueue {
    key: DatabaseKey,
    capacity: usize,
    idle: Duration,
    sender: SenderSlot,
    cancel: CancellationToken,
}

impl WriteQueue {
    pub fn new(key: DatabaseKey, capacity: usize, idle: Duration, cancel: CancellationToken) -> Self {
        Self {
            key,
            capacity,
            idle,
            sender: Arc::new(Mutex::new(None)),
            cancel,
        }
    }

    /// Whether a worker is currently attached.
    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Run `job` after every job queued before it and return its result.
    pub async fn push<F, T>(&self, job: F) -> LbResult<T>
    where
        F: Future<Output = LbResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Box::pin(async move {
            let _ = tx.send(job.await);
        }))?;
        rx.await.map_err(|_| LbError::Cancelled)?
    }

    fn enqueue(&self, job: Job) -> LbResult<()> {
        if self.cancel.is_cancelled() {
            return Err(LbError::Cancelled);
        }
        let mut slot = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let sender = match slot.as_ref() {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let tx = self.spawn_worker();
                *slot = Some(tx.clone());
                tx
            }
        };
        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LbError::WriteQueueFull,
            mpsc::error::TrySendError::Closed(_) => LbError::Cancelled,
        })
    }

    fn spawn_worker(&self) -> mpsc::Sender<Job> {
        let (tx, mut rx) = mpsc::channel::<Job>(self.capacity);
        let slot = self.sender.clone();
        let idle = self.idle;
        let cancel = self.cancel.clone();
        let key = self.key.clone();
        debug!("write queue: starting worker for {}", key);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = tokio::time::timeout(idle, rx.recv()) => match next {
                        Ok(Some(job)) => job.await,
                        Ok(None) => break,
                        Err(_) => {
                            // Pushes take the slot lock, so nothing can arrive
                            // between the check and the detach.
                            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
                            if rx.is_empty() {
                                *slot = None;
                                break;
                            }
                        }
                    },
                }
            }
            debug!("write queue: worker for {} stopped", key);
        });
        tx
    }
}

/// One [`WriteQueue`] per database branch.
pub struct WriteQueueManager {
    queues: DashMap<DatabaseKey, Arc<WriteQueue>>,
    capacity: usize,
    idle: Duration,
    cancel: CancellationToken,
}

impl WriteQueueManager {
    pub fn new(capacity: usize, idle: Duration, cancel: CancellationToken) -> Self {
        Self {
            queues: DashMap::new(),
            capacity,
            idle,
            cancel,
        }
    }

    pub fn queue(&self, key: &DatabaseKey) -> Arc<WriteQueue> {
        self.queues
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(WriteQueue::new(
                    key.clone(),
                    self.capacity,
                    self.idle,
                    self.cancel.child_token(),
                ))
            })
            .value()
            .clone()
    }

    pub async fn push<F, T>(&self, key: &DatabaseKey, job: F) -> LbResult<T>
    where
        F: Future<Output = LbResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.queue(key).push(job).await
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
