//! Per-timeline-item task bookkeeping.
//!
//! A `TaskManager` owns two queues. The `create` queue has one built-in
//! handler that allocates an id, writes the task directory and hands the
//! task to the `execute` queue, where tool handlers pick it up.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::error::{StoreError, TaskError};
use crate::progress::{Progress, ProgressListener, ProgressSnapshot};
use crate::queue::JobQueue;
use crate::store::YamlDocument;
use crate::task::model::{Task, TaskOptions, TaskResult};
use crate::task::state::TaskStatus;

pub const CREATE_CHANNEL: &str = "create";
pub const EXECUTE_CHANNEL: &str = "execute";

/// Key of the next-id counter in the owning item's config.
pub const TASK_INDEX_KEY: &str = "task_index";

const EVENT_CAPACITY: usize = 256;

/// Notifications fanned out to observers.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Created(Arc<Task>),
    Progress {
        task_id: String,
        snapshot: ProgressSnapshot,
    },
    Finished(TaskResult),
}

/// Mirrors progress into the task's state file and re-broadcasts it.
struct TaskProgress {
    task: Arc<Task>,
    events: broadcast::Sender<TaskEvent>,
}

#[async_trait]
impl ProgressListener for TaskProgress {
    async fn on_update(&self, snapshot: &ProgressSnapshot) {
        if let Err(e) = self
            .task
            .update_progress(snapshot.percent, &snapshot.log)
            .await
        {
            warn!(task_id = %self.task.id(), error = %e, "Failed to persist progress");
        }
        // No receivers is fine.
        let _ = self.events.send(TaskEvent::Progress {
            task_id: self.task.id().to_string(),
            snapshot: snapshot.clone(),
        });
    }
}

pub struct TaskManager {
    item_index: usize,
    tasks_path: PathBuf,
    /// Owning item's config; holds `task_index`.
    counter: Arc<YamlDocument>,
    tasks: RwLock<BTreeMap<u64, Arc<Task>>>,
    create_queue: JobQueue<TaskOptions>,
    execute_queue: JobQueue<Arc<Task>>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskManager {
    pub fn new(
        item_index: usize,
        tasks_path: impl Into<PathBuf>,
        counter: Arc<YamlDocument>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let manager = Arc::new(Self {
            item_index,
            tasks_path: tasks_path.into(),
            counter,
            tasks: RwLock::new(BTreeMap::new()),
            create_queue: JobQueue::new(format!("item-{item_index}-create")),
            execute_queue: JobQueue::new(format!("item-{item_index}-execute")),
            events,
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        manager
            .create_queue
            .connect(CREATE_CHANNEL, move |options: TaskOptions| {
                let weak = weak.clone();
                async move {
                    let Some(manager) = weak.upgrade() else {
                        return Ok(());
                    };
                    manager.create_task(options).await?;
                    Ok(())
                }
            });

        manager
    }

    pub fn item_index(&self) -> usize {
        self.item_index
    }

    pub fn tasks_path(&self) -> &Path {
        &self.tasks_path
    }

    /// Queue a new task. The task shows up once the create queue gets to it.
    pub fn submit_task(&self, options: TaskOptions) {
        self.create_queue.add(CREATE_CHANNEL, options);
    }

    /// Allocate an id, write the task directory and enqueue it for execution.
    ///
    /// Ids come from the item's `task_index` counter and are never reused:
    /// the counter only moves forward and never drops below the highest
    /// indexed id plus one. Single writer per item.
    pub async fn create_task(&self, options: TaskOptions) -> Result<Arc<Task>, TaskError> {
        let highest = self.tasks.read().await.keys().next_back().copied();
        let id = self
            .counter
            .update(|doc| {
                let stored = doc.get(TASK_INDEX_KEY).and_then(Value::as_u64).unwrap_or(1);
                let id = highest.map_or(stored, |h| stored.max(h + 1));
                doc.insert(TASK_INDEX_KEY.to_string(), Value::from(id + 1));
                id
            })
            .await?;

        let task_path = self.tasks_path.join(id.to_string());
        fs::create_dir_all(&task_path)
            .await
            .map_err(|source| StoreError::Io {
                path: task_path.clone(),
                source,
            })?;

        let mut options = options;
        options.set("status", TaskStatus::Created.as_str());
        let task = Arc::new(Task::new(task_path, options));
        task.save().await?;
        self.tasks.write().await.insert(id, Arc::clone(&task));

        let tool = task.tool().await;
        info!(item = self.item_index, task_id = %task.id(), tool = %tool, "Task created");
        let _ = self.events.send(TaskEvent::Created(Arc::clone(&task)));

        task.transition(TaskStatus::Queued).await?;
        self.execute_queue.add(EXECUTE_CHANNEL, Arc::clone(&task));
        Ok(task)
    }

    /// Connect an execute-channel handler. Every handler sees every task.
    pub fn connect_execute<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Task>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.execute_queue.connect(EXECUTE_CHANNEL, handler);
    }

    pub fn execute_handler_count(&self) -> usize {
        self.execute_queue.handler_count(EXECUTE_CHANNEL)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// A progress sink that persists `percent`/`log` on every tick and
    /// broadcasts `TaskEvent::Progress`.
    pub fn progress_for(&self, task: &Arc<Task>) -> Progress {
        Progress::with_listener(Arc::new(TaskProgress {
            task: Arc::clone(task),
            events: self.events.clone(),
        }))
    }

    pub fn notify_finished(&self, result: TaskResult) {
        debug!(task_id = %result.task.id(), success = result.result.is_success(), "Task finished");
        let _ = self.events.send(TaskEvent::Finished(result));
    }

    /// Rebuild the index from disk, replacing whatever was there.
    ///
    /// Only purely numeric directory names are tasks. Returns the tasks
    /// most recent first.
    pub async fn load_all_tasks(&self) -> Vec<Arc<Task>> {
        let mut loaded = BTreeMap::new();

        match fs::read_dir(&self.tasks_path).await {
            Ok(mut entries) => loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %self.tasks_path.display(), error = %e, "Error listing tasks");
                        break;
                    }
                };
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if !is_dir || name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                    continue;
                }
                let Ok(id) = name.parse::<u64>() else {
                    continue;
                };
                loaded.insert(id, Arc::new(Task::open(entry.path()).await));
            },
            Err(e) => {
                warn!(path = %self.tasks_path.display(), error = %e, "Tasks directory not readable");
            }
        }

        info!(item = self.item_index, count = loaded.len(), "Tasks loaded");
        let list = loaded.values().rev().cloned().collect();
        *self.tasks.write().await = loaded;
        list
    }

    pub async fn get_task_by_id(&self, task_id: &str) -> Option<Arc<Task>> {
        let id = task_id.parse::<u64>().ok()?;
        self.tasks.read().await.get(&id).cloned()
    }

    /// Most recent first, skipping `start` and returning at most `count`.
    pub async fn get_all_tasks(&self, start: usize, count: Option<usize>) -> Vec<Arc<Task>> {
        self.tasks
            .read()
            .await
            .values()
            .rev()
            .skip(start)
            .take(count.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Load existing tasks and start both queues.
    pub async fn start(&self) {
        self.load_all_tasks().await;
        self.create_queue.start();
        self.execute_queue.start();
    }

    /// Wait until every submitted task has been created and executed.
    ///
    /// With no execute handler connected, only creation is awaited.
    pub async fn join(&self) {
        self.create_queue.join().await;
        if self.execute_handler_count() > 0 {
            self.execute_queue.join().await;
        }
    }

    pub fn stop(&self) {
        self.create_queue.stop();
        self.execute_queue.stop();
    }
}
