use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::models::{NewCrawlResult, NewProxy, NewTask, ProductRecord, Proxy, Task};
use super::Repository;
use crate::crawler::task::TaskStatus;
use crate::error::StorageError;

#[derive(Default)]
struct State {
    next_id: i64,
    tasks: HashMap<i64, Task>,
    proxies: HashMap<i64, Proxy>,
    products: HashMap<String, (i64, ProductRecord)>,
    results: Vec<(i64, NewCrawlResult)>,
    overrides: Option<Value>,
    config_writes: Vec<(i64, String)>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local repository for tests and dry runs
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// All stored products, by external id
    pub fn products(&self) -> HashMap<String, ProductRecord> {
        self.with_state(|s| {
            s.products
                .iter()
                .map(|(k, (_, record))| (k.clone(), record.clone()))
                .collect()
        })
    }

    pub fn crawl_results(&self) -> Vec<NewCrawlResult> {
        self.with_state(|s| s.results.iter().map(|(_, r)| r.clone()).collect())
    }

    /// Every config blob written, in order
    pub fn config_writes(&self, task_id: i64) -> Vec<String> {
        self.with_state(|s| {
            s.config_writes
                .iter()
                .filter(|(id, _)| *id == task_id)
                .map(|(_, config)| config.clone())
                .collect()
        })
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create_task(&self, task: NewTask) -> Result<Task, StorageError> {
        Ok(self.with_state(|s| {
            let now = Utc::now();
            let task = Task {
                id: s.next_id(),
                name: task.name,
                url: task.url,
                task_type: task.task_type,
                status: TaskStatus::Pending,
                config: task.config,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            };
            s.tasks.insert(task.id, task.clone());
            task
        }))
    }

    async fn get_task(&self, id: i64) -> Result<Task, StorageError> {
        self.with_state(|s| s.tasks.get(&id).cloned())
            .ok_or(StorageError::NotFound { entity: "task", id })
    }

    async fn list_tasks(&self, limit: i64, offset: i64) -> Result<Vec<Task>, StorageError> {
        Ok(self.with_state(|s| {
            let mut tasks: Vec<Task> = s.tasks.values().cloned().collect();
            tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            tasks
                .into_iter()
                .skip(offset.max(0) as usize)
                .take(limit.max(0) as usize)
                .collect()
        }))
    }

    async fn update_task(&self, task: &Task) -> Result<(), StorageError> {
        self.with_state(|s| {
            let stored = s.tasks.get_mut(&task.id).ok_or(StorageError::NotFound { entity: "task", id: task.id })?;
            stored.name = task.name.clone();
            stored.url = task.url.clone();
            stored.config = task.config.clone();
            stored.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<(), StorageError> {
        self.with_state(|s| {
            let task = s.tasks.get_mut(&id).ok_or(StorageError::NotFound { entity: "task", id })?;
            let now = Utc::now();
            task.status = status;
            task.updated_at = now;
            match status {
                TaskStatus::Running => task.started_at = Some(now),
                TaskStatus::Completed | TaskStatus::Failed => task.completed_at = Some(now),
                _ => {}
            }
            Ok(())
        })
    }

    async fn update_task_config(&self, id: i64, config: &str) -> Result<(), StorageError> {
        self.with_state(|s| {
            let task = s.tasks.get_mut(&id).ok_or(StorageError::NotFound { entity: "task", id })?;
            task.config = config.to_string();
            task.updated_at = Utc::now();
            s.config_writes.push((id, config.to_string()));
            Ok(())
        })
    }

    async fn upsert_product(&self, record: &ProductRecord) -> Result<i64, StorageError> {
        Ok(self.with_state(|s| {
            if let Some((id, stored)) = s.products.get_mut(&record.external_id) {
                *stored = record.clone();
                return *id;
            }
            let id = s.next_id();
            s.products.insert(record.external_id.clone(), (id, record.clone()));
            id
        }))
    }

    async fn count_products(&self) -> Result<i64, StorageError> {
        Ok(self.with_state(|s| s.products.len() as i64))
    }

    async fn get_payload_overrides(&self) -> Result<Value, StorageError> {
        Ok(self.with_state(|s| s.overrides.clone().unwrap_or_else(|| json!({}))))
    }

    async fn update_payload_overrides(&self, overrides: &Value) -> Result<(), StorageError> {
        self.with_state(|s| s.overrides = Some(overrides.clone()));
        Ok(())
    }

    async fn create_proxy(&self, proxy: NewProxy) -> Result<Proxy, StorageError> {
        Ok(self.with_state(|s| {
            let now = Utc::now();
            let proxy = Proxy {
                id: s.next_id(),
                host: proxy.host,
                port: proxy.port,
                proxy_type: proxy.proxy_type,
                username: proxy.username,
                password: proxy.password,
                is_active: true,
                failure_count: 0,
                last_checked: None,
                created_at: now,
                updated_at: now,
            };
            s.proxies.insert(proxy.id, proxy.clone());
            proxy
        }))
    }

    async fn list_proxies(&self) -> Result<Vec<Proxy>, StorageError> {
        Ok(self.with_state(|s| {
            let mut proxies: Vec<Proxy> = s.proxies.values().cloned().collect();
            proxies.sort_by_key(|p| p.id);
            proxies
        }))
    }

    async fn get_active_proxies(&self) -> Result<Vec<Proxy>, StorageError> {
        Ok(self.with_state(|s| {
            let mut proxies: Vec<Proxy> = s.proxies.values().filter(|p| p.is_active).cloned().collect();
            // None sorts before Some, matching NULLS FIRST
            proxies.sort_by(|a, b| {
                a.failure_count
                    .cmp(&b.failure_count)
                    .then(a.last_checked.cmp(&b.last_checked))
                    .then(a.id.cmp(&b.id))
            });
            proxies
        }))
    }

    async fn update_proxy_health(&self, id: i64, healthy: bool) -> Result<Proxy, StorageError> {
        self.with_state(|s| {
            let proxy = s.proxies.get_mut(&id).ok_or(StorageError::NotFound { entity: "proxy", id })?;
            let now = Utc::now();
            if healthy {
                proxy.is_active = true;
                proxy.failure_count = 0;
            } else {
                proxy.failure_count += 1;
            }
            proxy.last_checked = Some(now);
            proxy.updated_at = now;
            Ok(proxy.clone())
        })
    }

    async fn set_proxy_active(&self, id: i64, active: bool) -> Result<(), StorageError> {
        self.with_state(|s| {
            let proxy = s.proxies.get_mut(&id).ok_or(StorageError::NotFound { entity: "proxy", id })?;
            proxy.is_active = active;
            proxy.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn create_crawl_result(&self, result: NewCrawlResult) -> Result<i64, StorageError> {
        Ok(self.with_state(|s| {
            let id = s.next_id();
            s.results.push((id, result));
            id
        }))
    }
}
