//! Task persistence
//!
//! The queue treats its store as a durable log of task entries: add,
//! update, remove and select by id or state. Ids are allocated by the
//! store and only ever increase.

use crate::entry::{TaskId, TaskQueueEntry, TaskState};
use crate::error::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub trait TaskStore: Send + Sync {
    /// Store a new entry and return the id allocated for it
    fn add(&self, entry: &TaskQueueEntry) -> TaskResult<TaskId>;

    fn update(&self, entry: &TaskQueueEntry) -> TaskResult<()>;

    fn remove(&self, id: TaskId) -> TaskResult<()>;

    fn by_id(&self, id: TaskId) -> TaskResult<TaskQueueEntry>;

    fn exists(&self, id: TaskId) -> TaskResult<bool>;

    /// Ids in ascending order, optionally restricted to one state
    fn select_ids(&self, state: Option<TaskState>) -> TaskResult<Vec<TaskId>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TaskTable {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, TaskQueueEntry>,
}

impl TaskTable {
    fn add(&mut self, entry: &TaskQueueEntry) -> TaskId {
        self.next_id += 1;
        let id = self.next_id;
        let mut entry = entry.clone();
        entry.set_id(id);
        self.tasks.insert(id, entry);
        id
    }

    fn update(&mut self, entry: &TaskQueueEntry) -> TaskResult<()> {
        match self.tasks.get_mut(&entry.id) {
            Some(stored) => {
                *stored = entry.clone();
                Ok(())
            }
            None => Err(TaskError::NotFound(entry.id)),
        }
    }

    fn remove(&mut self, id: TaskId) -> TaskResult<()> {
        self.tasks
            .remove(&id)
            .map(|_| ())
            .ok_or(TaskError::NotFound(id))
    }

    fn by_id(&self, id: TaskId) -> TaskResult<TaskQueueEntry> {
        self.tasks.get(&id).cloned().ok_or(TaskError::NotFound(id))
    }

    fn select_ids(&self, state: Option<TaskState>) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|entry| state.map_or(true, |s| entry.state() == s))
            .map(|entry| entry.id)
            .collect()
    }
}

/// Volatile store, for tests and for queues that need no history
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    table: Mutex<TaskTable>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TaskStore for MemoryTaskStore {
    fn add(&self, entry: &TaskQueueEntry) -> TaskResult<TaskId> {
        Ok(self.table().add(entry))
    }

    fn update(&self, entry: &TaskQueueEntry) -> TaskResult<()> {
        self.table().update(entry)
    }

    fn remove(&self, id: TaskId) -> TaskResult<()> {
        self.table().remove(id)
    }

    fn by_id(&self, id: TaskId) -> TaskResult<TaskQueueEntry> {
        self.table().by_id(id)
    }

    fn exists(&self, id: TaskId) -> TaskResult<bool> {
        Ok(self.table().tasks.contains_key(&id))
    }

    fn select_ids(&self, state: Option<TaskState>) -> TaskResult<Vec<TaskId>> {
        Ok(self.table().select_ids(state))
    }
}

/// Store kept in a single JSON document
///
/// The document is rewritten through a temporary file and a rename on
/// every change, so a crash leaves either the old or the new version.
#[derive(Debug)]
pub struct JsonTaskStore {
    path: PathBuf,
    table: Mutex<TaskTable>,
}

impl JsonTaskStore {
    pub fn open(path: impl AsRef<Path>) -> TaskResult<Self> {
        let path = path.as_ref().to_path_buf();
        let table = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| TaskError::Io {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_str(&text)?
        } else {
            TaskTable::default()
        };
        tracing::info!(
            "task store {} opened with {} tasks",
            path.display(),
            table.tasks.len()
        );
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, table: &TaskTable) -> TaskResult<()> {
        let io_error = |source| TaskError::Io {
            path: self.path.display().to_string(),
            source,
        };
        let text = serde_json::to_vec_pretty(table)?;
        let temporary = self.path.with_extension("json.tmp");
        std::fs::write(&temporary, text).map_err(io_error)?;
        std::fs::rename(&temporary, &self.path).map_err(io_error)
    }

    /// Apply a change and write it out; the change is undone if writing fails
    fn modify<T>(&self, change: impl FnOnce(&mut TaskTable) -> TaskResult<T>) -> TaskResult<T> {
        let mut table = self.table();
        let previous = table.clone();
        let result = change(&mut table)?;
        if let Err(e) = self.persist(&table) {
            *table = previous;
            return Err(e);
        }
        Ok(result)
    }
}

impl TaskStore for JsonTaskStore {
    fn add(&self, entry: &TaskQueueEntry) -> TaskResult<TaskId> {
        self.modify(|table| Ok(table.add(entry)))
    }

    fn update(&self, entry: &TaskQueueEntry) -> TaskResult<()> {
        self.modify(|table| table.update(entry))
    }

    fn remove(&self, id: TaskId) -> TaskResult<()> {
        self.modify(|table| table.remove(id))
    }

    fn by_id(&self, id: TaskId) -> TaskResult<TaskQueueEntry> {
        self.table().by_id(id)
    }

    fn exists(&self, id: TaskId) -> TaskResult<bool> {
        Ok(self.table().tasks.contains_key(&id))
    }

    fn select_ids(&self, state: Option<TaskState>) -> TaskResult<Vec<TaskId>> {
        Ok(self.table().select_ids(state))
    }
}
