pub mod memory;
mod queue;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use oguard_common::{AdmissionConfig, ModelOverride};

pub use queue::{AdmissionTicket, ModelQueue, ModelQueueSnapshot, Rejection};

#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub available_bytes: Option<u64>,
    pub auto_parallel_limit: u32,
}

/// Per-model admission. Queues are created lazily on first admission for a
/// model; defaults come from the config, with `auto` parallelism resolved
/// from available memory once at startup.
pub struct AdmissionController {
    queues: Mutex<HashMap<String, Arc<ModelQueue>>>,
    default_parallel: u32,
    default_queue_limit: u32,
    overrides: BTreeMap<String, ModelOverride>,
    memory: MemorySnapshot,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        let (available_bytes, auto_limit) = memory::detect_parallel_limit();
        let default_parallel = config.default_parallel.fixed().unwrap_or(auto_limit);
        info!(
            default_parallel,
            default_queue_limit = config.default_queue_limit,
            "admission controller ready"
        );
        Self {
            queues: Mutex::new(HashMap::new()),
            default_parallel,
            default_queue_limit: config.default_queue_limit,
            overrides: config.overrides.clone(),
            memory: MemorySnapshot {
                available_bytes,
                auto_parallel_limit: auto_limit,
            },
        }
    }

    fn limits_for(&self, model: &str) -> (u32, u32) {
        let over = self.overrides.get(model);
        (
            over.and_then(|o| o.parallel_limit)
                .unwrap_or(self.default_parallel),
            over.and_then(|o| o.queue_limit)
                .unwrap_or(self.default_queue_limit),
        )
    }

    pub fn queue(&self, model: &str) -> Arc<ModelQueue> {
        let mut queues = match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(queue) = queues.get(model) {
            return Arc::clone(queue);
        }
        let (parallel, queue_limit) = self.limits_for(model);
        let queue = ModelQueue::new(model, parallel, queue_limit);
        queues.insert(model.to_string(), Arc::clone(&queue));
        queue
    }

    pub async fn acquire(&self, model: &str) -> Result<AdmissionTicket, Rejection> {
        self.queue(model).acquire().await
    }

    pub fn snapshots(&self) -> Vec<ModelQueueSnapshot> {
        let queues = match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<ModelQueueSnapshot> =
            queues.values().map(|queue| queue.snapshot()).collect();
        out.sort_by(|a, b| a.model.cmp(&b.model));
        out
    }

    pub fn memory(&self) -> &MemorySnapshot {
        &self.memory
    }

    /// Runtime limit change for one model, creating its queue if needed.
    pub fn update(&self, model: &str, parallel_limit: Option<u32>, queue_limit: Option<u32>) {
        self.queue(model).update_limits(parallel_limit, queue_limit);
    }

    /// Clear counters everywhere and forget idle queues. Queues with live
    /// tickets keep their semaphore so the parallel bound cannot be widened
    /// by a reset.
    pub fn reset(&self) -> usize {
        let mut queues = match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = queues.len();
        for queue in queues.values() {
            queue.reset_counters();
        }
        queues.retain(|_, queue| queue.in_flight() > 0 || queue.queue_depth() > 0);
        before - queues.len()
    }
}
