//! Task executor
//!
//! Carries one task from `executing` to a terminal state on its own
//! thread. The outcome is handed back through the `post` callback, which
//! is the last thing the thread does.

use crate::entry::{TaskId, TaskParameters, TaskQueueEntry, TaskState};
use crate::error::{TaskError, TaskResult};
use crate::work::{TaskWork, WorkContext};
use polaris_common::CancellationToken;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

pub struct TaskExecutor {
    id: TaskId,
    parameters: TaskParameters,
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl TaskExecutor {
    /// Start `work` for `entry`, which should already be `executing`
    pub fn launch<F>(
        entry: TaskQueueEntry,
        mut work: Box<dyn TaskWork>,
        poll: Duration,
        post: F,
    ) -> TaskResult<Self>
    where
        F: FnOnce(TaskQueueEntry) + Send + 'static,
    {
        let id = entry.id;
        let parameters = entry.parameters.clone();
        let token = CancellationToken::new();
        let ctx = WorkContext::new(token.clone(), poll);
        let thread = std::thread::Builder::new()
            .name(format!("task-{}", id))
            .spawn(move || {
                let mut entry = entry;
                let mut info = entry.info.clone();
                let outcome = catch_unwind(AssertUnwindSafe(|| work.run(&ctx, &mut info)));
                entry.info = info;
                match outcome {
                    Ok(Ok(())) => entry.set_state(TaskState::Complete, ""),
                    Ok(Err(TaskError::Cancelled)) => {
                        entry.set_state(TaskState::Cancelled, "cancelled by request")
                    }
                    Ok(Err(e)) => {
                        tracing::error!("task {} failed: {}", entry.id, e);
                        entry.set_state(TaskState::Failed, e.to_string());
                    }
                    Err(_) => {
                        tracing::error!("task {} panicked", entry.id);
                        entry.set_state(TaskState::Failed, "task work panicked");
                    }
                }
                post(entry);
            })
            .map_err(|e| TaskError::Spawn(e.to_string()))?;
        Ok(Self {
            id,
            parameters,
            token,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        tracing::debug!("cancelling task {}", self.id);
        self.token.cancel();
    }

    pub fn blocks(&self, other: &TaskQueueEntry) -> bool {
        self.parameters.blocks(&other.parameters)
    }

    /// Hand over the thread handle, for joining outside any lock
    pub fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }

    /// Block until the executor thread has ended
    pub fn wait(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("executor thread for task {} panicked", self.id);
            }
        }
    }
}
