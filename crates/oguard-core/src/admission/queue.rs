use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::debug;

/// Exponentially-weighted running mean, guarded by a plain mutex; readers
/// only need an approximate snapshot.
#[derive(Debug, Default)]
struct Ewma {
    value: Mutex<f64>,
}

impl Ewma {
    const ALPHA: f64 = 0.2;

    fn record(&self, sample_ms: f64) {
        if let Ok(mut value) = self.value.lock() {
            *value = if *value == 0.0 {
                sample_ms
            } else {
                Self::ALPHA * sample_ms + (1.0 - Self::ALPHA) * *value
            };
        }
    }

    fn get(&self) -> f64 {
        self.value.lock().map(|value| *value).unwrap_or(0.0)
    }

    fn reset(&self) {
        if let Ok(mut value) = self.value.lock() {
            *value = 0.0;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Both the parallel slots and the wait queue are full.
    QueueFull { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelQueueSnapshot {
    pub model: String,
    pub parallel_limit: u32,
    pub queue_limit: u32,
    pub in_flight: u32,
    pub queue_depth: u32,
    pub total_processed: u64,
    pub total_rejected: u64,
    pub avg_wait_ms: f64,
    pub avg_process_ms: f64,
}

/// Bounded-parallelism state for one model. The tokio semaphore provides the
/// FIFO waiter order and cancel-safe queueing; the counters around it feed
/// the stats surface.
pub struct ModelQueue {
    model: String,
    semaphore: Arc<Semaphore>,
    parallel_limit: AtomicU32,
    queue_limit: AtomicU32,
    queued: AtomicU32,
    in_flight: AtomicU32,
    total_processed: AtomicU64,
    total_rejected: AtomicU64,
    avg_wait: Ewma,
    avg_process: Ewma,
}

impl ModelQueue {
    pub fn new(model: impl Into<String>, parallel_limit: u32, queue_limit: u32) -> Arc<Self> {
        let parallel = parallel_limit.max(1);
        Arc::new(Self {
            model: model.into(),
            semaphore: Arc::new(Semaphore::new(parallel as usize)),
            parallel_limit: AtomicU32::new(parallel),
            queue_limit: AtomicU32::new(queue_limit),
            queued: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            total_processed: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            avg_wait: Ewma::default(),
            avg_process: Ewma::default(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u32 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Acquire a slot: immediately when below the parallel limit, after a
    /// FIFO wait when the queue has room, rejection otherwise. Dropping the
    /// returned future while waiting leaves the queue cleanly (the semaphore
    /// acquire is cancel-safe and the depth guard decrements on drop).
    pub async fn acquire(self: &Arc<Self>) -> Result<AdmissionTicket, Rejection> {
        let wait_start = Instant::now();

        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => {
                unreachable!("model queue semaphore is never closed")
            }
            Err(TryAcquireError::NoPermits) => {
                if self.queued.load(Ordering::Relaxed) >= self.queue_limit.load(Ordering::Relaxed)
                {
                    self.total_rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(Rejection::QueueFull {
                        retry_after_secs: self.retry_after_secs(),
                    });
                }
                self.queued.fetch_add(1, Ordering::Relaxed);
                let depth_guard = QueueDepthGuard(Arc::clone(self));
                let permit = Arc::clone(&self.semaphore)
                    .acquire_owned()
                    .await
                    .expect("model queue semaphore is never closed");
                drop(depth_guard);
                permit
            }
        };

        self.avg_wait
            .record(wait_start.elapsed().as_secs_f64() * 1_000.0);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(AdmissionTicket {
            queue: Arc::clone(self),
            _permit: permit,
            started: Instant::now(),
        })
    }

    /// Suggested client backoff, derived from the recent processing time.
    fn retry_after_secs(&self) -> u64 {
        let avg_ms = self.avg_process.get();
        ((avg_ms / 1_000.0).ceil() as u64).clamp(1, 30)
    }

    /// Adjust limits at runtime. Raising the parallel limit releases new
    /// permits immediately; lowering it retires permits as they free up.
    pub fn update_limits(self: &Arc<Self>, parallel_limit: Option<u32>, queue_limit: Option<u32>) {
        if let Some(limit) = queue_limit {
            self.queue_limit.store(limit, Ordering::Relaxed);
        }
        let Some(new_parallel) = parallel_limit.map(|limit| limit.max(1)) else {
            return;
        };
        let old = self.parallel_limit.swap(new_parallel, Ordering::Relaxed);
        if new_parallel > old {
            self.semaphore.add_permits((new_parallel - old) as usize);
        } else if new_parallel < old {
            let retire = (old - new_parallel) as usize;
            let semaphore = Arc::clone(&self.semaphore);
            let model = self.model.clone();
            tokio::spawn(async move {
                for _ in 0..retire {
                    match Arc::clone(&semaphore).acquire_owned().await {
                        Ok(permit) => permit.forget(),
                        Err(_) => break,
                    }
                }
                debug!(model = %model, retired = retire, "parallel limit lowered");
            });
        }
    }

    pub fn snapshot(&self) -> ModelQueueSnapshot {
        ModelQueueSnapshot {
            model: self.model.clone(),
            parallel_limit: self.parallel_limit.load(Ordering::Relaxed),
            queue_limit: self.queue_limit.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            queue_depth: self.queue_depth(),
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            avg_wait_ms: self.avg_wait.get(),
            avg_process_ms: self.avg_process.get(),
        }
    }

    /// Zero the counters without touching live permits.
    pub fn reset_counters(&self) {
        self.total_processed.store(0, Ordering::Relaxed);
        self.total_rejected.store(0, Ordering::Relaxed);
        self.avg_wait.reset();
        self.avg_process.reset();
    }
}

struct QueueDepthGuard(Arc<ModelQueue>);

impl Drop for QueueDepthGuard {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A counted permit bound to one model queue. Dropping it is the one and only
/// release: the semaphore permit frees the slot (waking the head waiter) and
/// the counters record the processing time.
pub struct AdmissionTicket {
    queue: Arc<ModelQueue>,
    _permit: tokio::sync::OwnedSemaphorePermit,
    started: Instant,
}

impl AdmissionTicket {
    pub fn model(&self) -> &str {
        self.queue.model()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.queue.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.queue.total_processed.fetch_add(1, Ordering::Relaxed);
        self.queue
            .avg_process
            .record(self.started.elapsed().as_secs_f64() * 1_000.0);
    }
}
