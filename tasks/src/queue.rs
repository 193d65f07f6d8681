//! Task queue
//!
//! Queue states: `idle → launching ⇄ stopping → stopped → launching`.
//!
//! One mutex guards the queue state and the executor map. Executors
//! report completion through `post`, which persists the terminal state
//! and removes the executor from the map under that mutex. The
//! management thread, woken through `statechange`, joins finished
//! executor threads outside the lock and launches whatever became
//! runnable. Callers blocked in `wait` are woken through `wait_cond`.

use crate::config::QueueConfig;
use crate::entry::{
    TaskId, TaskInfo, TaskMonitorInfo, TaskParameters, TaskQueueEntry, TaskState,
};
use crate::error::{TaskError, TaskResult};
use crate::executor::TaskExecutor;
use crate::exposure::ImageSink;
use crate::store::TaskStore;
use crate::work::{DefaultWorkFactory, DeviceLocator, TaskWorkFactory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Idle,
    Launching,
    Stopping,
    Stopped,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueState::Idle => "idle",
            QueueState::Launching => "launching",
            QueueState::Stopping => "stopping",
            QueueState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Called with the queue lock held on every task state change; must not
/// call back into the queue
pub type TaskMonitor = Arc<dyn Fn(&TaskMonitorInfo) + Send + Sync>;

struct QueueInner {
    state: QueueState,
    executors: BTreeMap<TaskId, TaskExecutor>,
    finished: Vec<JoinHandle<()>>,
    monitor: Option<TaskMonitor>,
}

struct Shared {
    inner: Mutex<QueueInner>,
    statechange: Condvar,
    wait_cond: Condvar,
    store: Arc<dyn TaskStore>,
    factory: Arc<dyn TaskWorkFactory>,
    config: QueueConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut QueueInner, state: QueueState) {
        if inner.state != state {
            tracing::info!("queue state {} -> {}", inner.state, state);
            inner.state = state;
        }
        self.statechange.notify_all();
        self.wait_cond.notify_all();
    }

    fn publish(&self, inner: &QueueInner, info: &TaskInfo) {
        tracing::debug!("task {} is {}", info.id, info.state);
        if let Some(monitor) = &inner.monitor {
            monitor(&TaskMonitorInfo::from(info));
        }
    }

    /// Persist a state change, logging store failures
    fn record(&self, inner: &QueueInner, entry: &TaskQueueEntry) {
        if let Err(e) = self.store.update(entry) {
            tracing::error!("cannot persist task {}: {}", entry.id, e);
        }
        self.publish(inner, &entry.info);
    }

    /// Terminal report from an executor thread
    fn post(&self, entry: TaskQueueEntry) {
        let mut inner = self.lock();
        tracing::info!(
            "task {} {}{}",
            entry.id,
            entry.state(),
            if entry.info.cause.is_empty() {
                String::new()
            } else {
                format!(": {}", entry.info.cause)
            }
        );
        self.record(&inner, &entry);
        if let Some(mut executor) = inner.executors.remove(&entry.id) {
            if let Some(thread) = executor.take_thread() {
                inner.finished.push(thread);
            }
        }
        if inner.state == QueueState::Stopping && inner.executors.is_empty() {
            self.set_state(&mut inner, QueueState::Stopped);
        }
        self.statechange.notify_all();
        self.wait_cond.notify_all();
    }

    /// Launch every pending task not blocked by a running or an earlier
    /// pending task
    fn launch_pending(self: &Arc<Self>, inner: &mut QueueInner) {
        if inner.state != QueueState::Launching {
            return;
        }
        let ids = match self.store.select_ids(Some(TaskState::Pending)) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!("cannot list pending tasks: {}", e);
                return;
            }
        };
        let mut waiting: Vec<TaskQueueEntry> = Vec::new();
        for id in ids {
            if inner.executors.contains_key(&id) {
                continue;
            }
            let entry = match self.store.by_id(id) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!("cannot read task {}: {}", id, e);
                    continue;
                }
            };
            if let Some(running) = inner.executors.values().find(|x| x.blocks(&entry)) {
                tracing::debug!("{} blocks {}", running.id(), entry.id);
                waiting.push(entry);
                continue;
            }
            if let Some(earlier) = waiting.iter().find(|w| w.blocks(&entry)) {
                tracing::debug!("{} blocks {}", earlier.id, entry.id);
                waiting.push(entry);
                continue;
            }
            self.launch(inner, entry);
        }
    }

    fn launch(self: &Arc<Self>, inner: &mut QueueInner, mut entry: TaskQueueEntry) {
        let id = entry.id;
        let work = match self.factory.create(&entry) {
            Ok(work) => work,
            Err(e) => {
                tracing::error!("cannot create work for task {}: {}", id, e);
                entry.set_state(TaskState::Failed, e.to_string());
                self.record(inner, &entry);
                return;
            }
        };
        entry.set_state(TaskState::Executing, "");
        if let Err(e) = self.store.update(&entry) {
            tracing::error!("cannot persist launch of task {}: {}", id, e);
            entry.set_state(TaskState::Failed, format!("cannot persist launch: {}", e));
            self.record(inner, &entry);
            return;
        }
        self.publish(inner, &entry.info);

        let shared = Arc::clone(self);
        match TaskExecutor::launch(entry.clone(), work, self.config.poll_interval(), move |done| {
            shared.post(done)
        }) {
            Ok(executor) => {
                tracing::info!("launched task {}", id);
                inner.executors.insert(id, executor);
            }
            Err(e) => {
                tracing::error!("cannot launch task {}: {}", id, e);
                entry.set_state(TaskState::Failed, e.to_string());
                self.record(inner, &entry);
            }
        }
    }

    /// Body of the management thread
    fn manage(self: Arc<Self>) {
        tracing::debug!("queue management thread started");
        let mut inner = self.lock();
        loop {
            if inner.state == QueueState::Idle {
                break;
            }
            let finished = std::mem::take(&mut inner.finished);
            if !finished.is_empty() {
                drop(inner);
                for thread in finished {
                    if thread.join().is_err() {
                        tracing::error!("executor thread panicked");
                    }
                }
                inner = self.lock();
                continue;
            }
            self.launch_pending(&mut inner);
            inner = self
                .statechange
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        let finished = std::mem::take(&mut inner.finished);
        drop(inner);
        for thread in finished {
            if thread.join().is_err() {
                tracing::error!("executor thread panicked");
            }
        }
        tracing::debug!("queue management thread terminated");
    }
}

pub struct TaskQueue {
    shared: Arc<Shared>,
    management: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        factory: Arc<dyn TaskWorkFactory>,
        config: QueueConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(QueueInner {
                    state: QueueState::Idle,
                    executors: BTreeMap::new(),
                    finished: Vec::new(),
                    monitor: None,
                }),
                statechange: Condvar::new(),
                wait_cond: Condvar::new(),
                store,
                factory,
                config,
            }),
            management: Mutex::new(None),
        }
    }

    /// Queue running exposure and sleep tasks on `devices`, with the
    /// exposure timeouts taken from `config`
    pub fn with_devices(
        store: Arc<dyn TaskStore>,
        devices: Arc<dyn DeviceLocator>,
        sink: Arc<dyn ImageSink>,
        config: QueueConfig,
    ) -> TaskResult<Self> {
        config.validate()?;
        let factory = DefaultWorkFactory::new(devices, sink, config.exposure.clone());
        Ok(Self::new(store, Arc::new(factory), config))
    }

    pub fn set_callback(&self, monitor: Option<TaskMonitor>) {
        self.shared.lock().monitor = monitor;
    }

    pub fn state(&self) -> QueueState {
        self.shared.lock().state
    }

    /// Number of running executors
    pub fn nexecutors(&self) -> usize {
        self.shared.lock().executors.len()
    }

    pub fn submit(&self, parameters: TaskParameters) -> TaskResult<TaskId> {
        let mut inner = self.shared.lock();
        let mut entry = TaskQueueEntry::new(0, parameters);
        let id = self.shared.store.add(&entry)?;
        entry.set_id(id);
        tracing::info!("task {} submitted", id);
        self.shared.publish(&inner, &entry.info);
        self.shared.launch_pending(&mut inner);
        self.shared.statechange.notify_all();
        Ok(id)
    }

    /// Begin launching tasks, starting the management thread if needed
    pub fn start(&self) -> TaskResult<()> {
        let mut management = self.management.lock().unwrap_or_else(|e| e.into_inner());
        let mut inner = self.shared.lock();
        if management.is_none() {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name("task-queue".to_string())
                .spawn(move || shared.manage())
                .map_err(|e| TaskError::Spawn(e.to_string()))?;
            *management = Some(handle);
        }
        self.shared.set_state(&mut inner, QueueState::Launching);
        self.shared.launch_pending(&mut inner);
        Ok(())
    }

    /// Stop launching; running tasks carry on
    pub fn stop(&self) {
        let mut inner = self.shared.lock();
        match inner.state {
            QueueState::Idle | QueueState::Stopped | QueueState::Stopping => {}
            QueueState::Launching => {
                let next = if inner.executors.is_empty() {
                    QueueState::Stopped
                } else {
                    QueueState::Stopping
                };
                self.shared.set_state(&mut inner, next);
            }
        }
    }

    /// Cancel a task
    ///
    /// A running task is asked to cancel and ends up `cancelled` once its
    /// work unwinds. A pending task is cancelled directly. Tasks in a
    /// terminal state are left alone.
    pub fn cancel(&self, id: TaskId) -> TaskResult<()> {
        let inner = self.shared.lock();
        if let Some(executor) = inner.executors.get(&id) {
            executor.cancel();
            return Ok(());
        }
        let mut entry = self.shared.store.by_id(id)?;
        if entry.state() == TaskState::Pending {
            entry.set_state(TaskState::Cancelled, "cancelled before launch");
            self.shared.store.update(&entry)?;
            self.shared.publish(&inner, &entry.info);
            self.shared.statechange.notify_all();
        } else {
            tracing::debug!("task {} is {}, nothing to cancel", id, entry.state());
        }
        Ok(())
    }

    /// Cancel every running task
    pub fn cancel_all(&self) {
        let inner = self.shared.lock();
        for executor in inner.executors.values() {
            executor.cancel();
        }
    }

    /// Block until the task is no longer executing
    pub fn wait_for(&self, id: TaskId) {
        let mut inner = self.shared.lock();
        while inner.executors.contains_key(&id) {
            inner = self
                .shared
                .wait_cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until a stopping queue has stopped
    pub fn wait(&self) -> TaskResult<()> {
        let mut inner = self.shared.lock();
        if matches!(inner.state, QueueState::Idle | QueueState::Launching) {
            return Err(TaskError::BadQueueState {
                state: inner.state.to_string(),
                operation: "wait".to_string(),
            });
        }
        while inner.state == QueueState::Stopping {
            inner = self
                .shared
                .wait_cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        Ok(())
    }

    /// Stop, wait for running tasks and end the management thread
    pub fn shutdown(&self) -> TaskResult<()> {
        let mut management = self.management.lock().unwrap_or_else(|e| e.into_inner());
        if management.is_none() {
            return Ok(());
        }
        self.stop();
        self.wait()?;
        {
            let mut inner = self.shared.lock();
            self.shared.set_state(&mut inner, QueueState::Idle);
        }
        if let Some(handle) = management.take() {
            if handle.join().is_err() {
                tracing::error!("queue management thread panicked");
            }
        }
        Ok(())
    }

    /// Fail tasks left `executing` by a previous process
    pub fn recover(&self) -> TaskResult<usize> {
        let inner = self.shared.lock();
        let mut recovered = 0;
        for id in self.shared.store.select_ids(Some(TaskState::Executing))? {
            if inner.executors.contains_key(&id) {
                continue;
            }
            let mut entry = self.shared.store.by_id(id)?;
            entry.set_state(TaskState::Failed, "server crash");
            self.shared.store.update(&entry)?;
            self.shared.publish(&inner, &entry.info);
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!("recovered {} tasks interrupted by a crash", recovered);
        }
        Ok(recovered)
    }

    /// Delete a task that is not executing
    pub fn remove(&self, id: TaskId) -> TaskResult<()> {
        let inner = self.shared.lock();
        if inner.executors.contains_key(&id) {
            return Err(TaskError::StillExecuting(id));
        }
        let mut info = self.shared.store.by_id(id)?.info;
        self.shared.store.remove(id)?;
        info.state = TaskState::Deleted;
        info.last_change = chrono::Utc::now();
        tracing::info!("task {} removed", id);
        self.shared.publish(&inner, &info);
        Ok(())
    }

    /// Ids of tasks, optionally only those in `state`
    pub fn tasklist(&self, state: Option<TaskState>) -> TaskResult<Vec<TaskId>> {
        self.shared.store.select_ids(state)
    }

    pub fn exists(&self, id: TaskId) -> TaskResult<bool> {
        self.shared.store.exists(id)
    }

    pub fn entry(&self, id: TaskId) -> TaskResult<TaskQueueEntry> {
        self.shared.store.by_id(id)
    }

    pub fn info(&self, id: TaskId) -> TaskResult<TaskInfo> {
        Ok(self.shared.store.by_id(id)?.info)
    }

    pub fn parameters(&self, id: TaskId) -> TaskResult<TaskParameters> {
        Ok(self.shared.store.by_id(id)?.parameters)
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let running = self
            .management
            .lock()
            .map(|m| m.is_some())
            .unwrap_or(false);
        if !running {
            return;
        }
        self.stop();
        self.cancel_all();
        if let Err(e) = self.shutdown() {
            tracing::error!("queue shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use crate::work::{SleepWork, TaskWork};

    struct SleepFactory;

    impl TaskWorkFactory for SleepFactory {
        fn create(&self, entry: &TaskQueueEntry) -> TaskResult<Box<dyn TaskWork>> {
            Ok(Box::new(SleepWork::new(entry.parameters.exposure.exposure_time)))
        }
    }

    fn queue() -> TaskQueue {
        TaskQueue::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(SleepFactory),
            QueueConfig {
                poll_interval_ms: 5,
                ..QueueConfig::default()
            },
        )
    }

    fn sleep_task(secs: f64) -> TaskParameters {
        TaskParameters {
            task_type: crate::entry::TaskType::Sleep,
            exposure: polaris_common::Exposure::with_time(secs),
            ..TaskParameters::default()
        }
    }

    #[test]
    fn test_new_queue_is_idle() {
        let queue = queue();
        assert_eq!(queue.state(), QueueState::Idle);
        assert!(matches!(queue.wait(), Err(TaskError::BadQueueState { .. })));
    }

    #[test]
    fn test_submit_without_start_stays_pending() {
        let queue = queue();
        let id = queue.submit(sleep_task(0.0)).unwrap();
        assert_eq!(queue.info(id).unwrap().state, TaskState::Pending);
        assert_eq!(queue.tasklist(Some(TaskState::Pending)).unwrap(), vec![id]);
        assert_eq!(queue.nexecutors(), 0);
    }

    #[test]
    fn test_stop_without_executors_is_stopped() {
        let queue = queue();
        queue.start().unwrap();
        assert_eq!(queue.state(), QueueState::Launching);
        queue.stop();
        assert_eq!(queue.state(), QueueState::Stopped);
        queue.wait().unwrap();
        queue.shutdown().unwrap();
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[test]
    fn test_shutdown_joins_finished_executors() {
        let queue = queue();
        queue.start().unwrap();
        let ids: Vec<TaskId> = (0..3)
            .map(|_| queue.submit(sleep_task(0.0)).unwrap())
            .collect();
        queue.shutdown().unwrap();
        assert_eq!(queue.state(), QueueState::Idle);
        assert_eq!(queue.nexecutors(), 0);
        assert!(queue.shared.lock().finished.is_empty());
        for id in ids {
            assert_eq!(queue.info(id).unwrap().state, TaskState::Complete);
        }
    }

    #[test]
    fn test_cancel_pending_task() {
        let queue = queue();
        let id = queue.submit(sleep_task(1.0)).unwrap();
        queue.cancel(id).unwrap();
        assert_eq!(queue.info(id).unwrap().state, TaskState::Cancelled);
    }

    #[test]
    fn test_remove_unknown() {
        let queue = queue();
        assert!(matches!(queue.remove(17), Err(TaskError::NotFound(17))));
    }
}
