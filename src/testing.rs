//! In-memory doubles of the Redis and MongoDB collaborators

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;

use crate::crawler::task::{Resource, Task, TaskKind};
use crate::storage::cache::Cache;
use crate::storage::queue::{BusMessage, MessageBus, NEW_ENTRIES};
use crate::storage::tasks::{TaskFilter, TaskStore};

#[derive(Default)]
struct MemoryStream {
    entries: Vec<BusMessage>,
    groups: HashMap<String, MemoryGroup>,
}

#[derive(Default)]
struct MemoryGroup {
    next: usize,
    pending: Vec<BusMessage>,
}

/// Stream bus with one consumer per group
#[derive(Default)]
pub struct MemoryBus {
    streams: Mutex<HashMap<String, MemoryStream>>,
    failing_streams: Mutex<HashSet<String>>,
    failing_publishes: Mutex<HashMap<String, usize>>,
    sequence: AtomicUsize,
}

impl MemoryBus {
    /// Make consumer group creation fail for `stream`
    pub fn fail_group_creation(&self, stream: &str) {
        self.failing_streams.lock().unwrap().insert(stream.to_string());
    }

    /// Make the next `times` publishes to `stream` fail
    pub fn fail_publishes(&self, stream: &str, times: usize) {
        self.failing_publishes.lock().unwrap().insert(stream.to_string(), times);
    }

    pub fn payloads(&self, stream: &str) -> Vec<String> {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.entries.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.groups.contains_key(group))
            .unwrap_or(false)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<()> {
        if self.failing_streams.lock().unwrap().contains(stream) {
            anyhow::bail!("group creation refused for {}", stream);
        }
        self.streams
            .lock()
            .unwrap()
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>> {
        let messages = {
            let mut streams = self.streams.lock().unwrap();
            let state = streams
                .get_mut(stream)
                .ok_or_else(|| anyhow::anyhow!("no such stream {}", stream))?;
            let entries = &state.entries;
            let group = state
                .groups
                .get_mut(group)
                .ok_or_else(|| anyhow::anyhow!("no such group {}", group))?;

            if start == NEW_ENTRIES {
                let end = (group.next + count).min(entries.len());
                let batch: Vec<BusMessage> = entries[group.next..end].to_vec();
                group.next = end;
                group.pending.extend(batch.iter().cloned());
                batch
            } else {
                // pending entries after the `start` id
                let skip = group
                    .pending
                    .iter()
                    .position(|m| m.id == start)
                    .map(|i| i + 1)
                    .unwrap_or(0);
                group.pending.iter().skip(skip).take(count).cloned().collect()
            }
        };

        if messages.is_empty() && start == NEW_ENTRIES {
            tokio::time::sleep(block.min(Duration::from_millis(5))).await;
        }
        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        if let Some(group) = self
            .streams
            .lock()
            .unwrap()
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group.pending.retain(|m| m.id != id);
        }
        Ok(())
    }

    async fn publish(&self, stream: &str, payload: &str) -> Result<()> {
        if let Some(left) = self.failing_publishes.lock().unwrap().get_mut(stream) {
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("publish refused for {}", stream);
            }
        }

        let id = format!("{}-0", self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        self.streams
            .lock()
            .unwrap()
            .entry(stream.to_string())
            .or_default()
            .entries
            .push(BusMessage {
                id,
                payload: payload.to_string(),
            });
        Ok(())
    }
}

/// Task store keeping every collection in a vector
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<TaskKind, Vec<Task>>>,
    fail_reads: AtomicBool,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    /// Store `task` directly, returning its identity
    pub fn insert(&self, task: Task) -> ObjectId {
        let id = task.id().unwrap_or_else(ObjectId::new);
        let task = with_id(task, id);
        self.tasks.lock().unwrap().entry(task.kind()).or_default().push(task);
        id
    }

    pub fn all(&self, kind: TaskKind) -> Vec<Task> {
        self.tasks.lock().unwrap().get(&kind).cloned().unwrap_or_default()
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }

    /// Save attempts, failed ones included
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

fn with_id(task: Task, id: ObjectId) -> Task {
    match task {
        Task::CatalogPage(mut t) => {
            t.id = Some(id);
            Task::CatalogPage(t)
        }
        Task::Novel(mut t) => {
            t.id = Some(id);
            Task::Novel(t)
        }
        Task::Chapter(mut t) => {
            t.id = Some(id);
            Task::Chapter(t)
        }
    }
}

fn matches(task: &Task, filter: &TaskFilter) -> bool {
    match filter {
        TaskFilter::Url(url) => task.url() == url,
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn find_one_by_filter(&self, kind: TaskKind, filter: &TaskFilter) -> Result<Option<Task>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("store unavailable");
        }
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .get(&kind)
            .and_then(|tasks| tasks.iter().find(|t| matches(t, filter)).cloned()))
    }

    async fn save(&self, task: &Task) -> Result<ObjectId> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("store unavailable");
        }
        let mut tasks = self.tasks.lock().unwrap();
        let collection = tasks.entry(task.kind()).or_default();

        match task.id() {
            Some(id) => {
                match collection.iter_mut().find(|t| t.id() == Some(id)) {
                    Some(stored) => *stored = task.clone(),
                    None => collection.push(task.clone()),
                }
                Ok(id)
            }
            None => {
                let id = ObjectId::new();
                collection.push(with_id(task.clone(), id));
                Ok(id)
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
