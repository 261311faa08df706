//! In-memory fakes for the pipeline's capability seams, plus shared fixtures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use altify::db::store::{StoreError, TaskStore};
use altify::services::broker::{
    Broker, BrokerError, DeadLetter, Delivery, Disposition, DLQ,
};
use altify::services::inference::{InferenceError, Inferencer};
use altify::services::storage::{ObjectStore, StorageError};
use altify::models::task::{Task, TaskStatus};

/// Smallest valid transparent PNG (1x1, RGBA).
pub const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

fn injected_redis_error() -> BrokerError {
    BrokerError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "injected broker failure",
    )))
}

/// Task store over a hash map, mirroring the conditional-update semantics of
/// the SQL queries.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
    /// Order in which tasks were claimed for processing.
    pub claim_order: Mutex<Vec<Uuid>>,
    pub fail_insert: AtomicBool,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Shift a row's timestamps into the past (reconciler scenarios).
    pub fn backdate(&self, id: Uuid, age: Duration) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            let age = chrono::Duration::from_std(age).unwrap();
            task.created_at -= age;
            task.updated_at -= age;
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(
        &self,
        id: Uuid,
        image_key: &str,
        context_text: &str,
    ) -> Result<Task, StoreError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected insert failure".into()));
        }
        let now = Utc::now();
        let task = Task {
            id,
            image_key: image_key.to_string(),
            context_text: context_text.to_string(),
            status: TaskStatus::Pending,
            alt1: None,
            alt2: None,
            selected_index: None,
            final_alt: None,
            is_approved: false,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        self.tasks.lock().unwrap().insert(id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.lock().unwrap().get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.tasks.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn claim_for_processing(&self, id: Uuid) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&id) {
            Some(task)
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Processing) =>
            {
                task.status = TaskStatus::Processing;
                task.attempts += 1;
                task.updated_at = Utc::now();
                self.claim_order.lock().unwrap().push(id);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn store_candidates(
        &self,
        id: Uuid,
        alt1: &str,
        alt2: &str,
    ) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Processing => {
                task.alt1 = Some(alt1.to_string());
                task.alt2 = Some(alt2.to_string());
                task.status = TaskStatus::Done;
                task.last_error = None;
                task.updated_at = Utc::now();
                task.finished_at = Some(Utc::now());
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn mark_failed(&self, id: Uuid, last_error: &str) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&id) {
            Some(task)
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Processing) =>
            {
                task.status = TaskStatus::Failed;
                task.last_error = Some(last_error.to_string());
                task.updated_at = Utc::now();
                task.finished_at = Some(Utc::now());
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn reset_for_redrive(&self, id: Uuid) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&id) {
            Some(task)
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Processing) =>
            {
                task.status = TaskStatus::Pending;
                task.updated_at = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn approve(
        &self,
        id: Uuid,
        selected_index: i32,
        final_alt: &str,
        is_approved: bool,
    ) -> Result<Option<Task>, StoreError> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Done => {
                task.selected_index = Some(selected_index);
                task.final_alt = Some(final_alt.to_string());
                task.is_approved = is_approved;
                task.finished_at.get_or_insert_with(Utc::now);
                task.updated_at = Utc::now();
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.lock().unwrap();
        let mut stale: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.updated_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.updated_at);
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Blob store over a hash map.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl ObjectStore for MemoryBlobStore {
    async fn put_if_absent(
        &self,
        key: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        self.objects
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

/// Broker over in-process queues with the same settlement semantics as the
/// Redis implementation. Delayed publishes become visible immediately but
/// every publish is logged with its delay so backoff behavior stays
/// observable to tests.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    unacked: Mutex<HashMap<String, Vec<String>>>,
    pub published: Mutex<Vec<(String, String, Duration)>>,
    pub fail_publish: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Delays recorded for publishes onto the given queue.
    pub fn publish_delays(&self, queue: &str) -> Vec<Duration> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _, _)| q == queue)
            .map(|(_, _, d)| *d)
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, body: &str, delay: Duration) -> Result<(), BrokerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(injected_redis_error());
        }
        self.published
            .lock()
            .unwrap()
            .push((queue.to_string(), body.to_string(), delay));
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push_back(body.to_string());
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        _wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let popped = self
            .queues
            .lock()
            .unwrap()
            .get_mut(queue)
            .and_then(VecDeque::pop_front);

        Ok(popped.map(|payload| {
            self.unacked
                .lock()
                .unwrap()
                .entry(queue.to_string())
                .or_default()
                .push(payload.clone());
            Delivery {
                queue: queue.to_string(),
                payload,
            }
        }))
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> Result<(), BrokerError> {
        {
            let mut unacked = self.unacked.lock().unwrap();
            if let Some(entries) = unacked.get_mut(&delivery.queue) {
                if let Some(pos) = entries.iter().position(|p| p == &delivery.payload) {
                    entries.remove(pos);
                }
            }
        }

        match disposition {
            Disposition::Ack => {}
            Disposition::NackRequeue => {
                self.queues
                    .lock()
                    .unwrap()
                    .entry(delivery.queue.clone())
                    .or_default()
                    .push_front(delivery.payload.clone());
            }
            Disposition::NackDlq { reason } => {
                let envelope = DeadLetter {
                    body: delivery.payload.clone(),
                    reasons: vec![reason],
                    deaths: 1,
                };
                self.queues
                    .lock()
                    .unwrap()
                    .entry(DLQ.to_string())
                    .or_default()
                    .push_back(serde_json::to_string(&envelope).unwrap());
            }
        }
        Ok(())
    }

    async fn queue_depth(
        &self,
        queue: &str,
    ) -> Result<altify::services::broker::QueueDepth, BrokerError> {
        Ok(altify::services::broker::QueueDepth {
            ready: self.ready(queue) as u64,
            unacked: self
                .unacked
                .lock()
                .unwrap()
                .get(queue)
                .map_or(0, Vec::len) as u64,
        })
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Scripted inferencer. Pops one scripted result per call; once the script
/// runs dry every call yields `["A", "B"]`.
pub struct StubInferencer {
    script: Mutex<VecDeque<Result<Vec<String>, InferenceError>>>,
    pub calls: AtomicUsize,
}

impl StubInferencer {
    pub fn ok() -> Self {
        Self::with_script(Vec::new())
    }

    pub fn with_script(script: Vec<Result<Vec<String>, InferenceError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Inferencer for StubInferencer {
    async fn generate(
        &self,
        _image: &[u8],
        _context: &str,
        _k: usize,
    ) -> Result<Vec<String>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec!["A".to_string(), "B".to_string()]))
    }
}
