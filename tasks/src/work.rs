//! Task work
//!
//! The body of a task runs on its executor thread and must cooperate with
//! cancellation: every blocking wait goes through [`WorkContext`], which
//! fails with [`TaskError::Cancelled`] once the task is cancelled.

use crate::config::ExposureWorkConfig;
use crate::entry::{TaskInfo, TaskQueueEntry, TaskType};
use crate::error::{TaskError, TaskResult};
use crate::exposure::{ExposureWork, ImageSink};
use polaris_common::{CancellationToken, DeviceResult, SharedCcd, SharedCooler, SharedFilterWheel};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct WorkContext {
    token: CancellationToken,
    poll: Duration,
}

impl WorkContext {
    pub fn new(token: CancellationToken, poll: Duration) -> Self {
        Self { token, poll }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_cancelled(&self) -> TaskResult<()> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep, waking early with `Cancelled` if the task is cancelled
    pub fn sleep(&self, secs: f64) -> TaskResult<()> {
        if self.token.wait_secs(secs) {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait until `condition` holds
    ///
    /// Returns `Ok(false)` on timeout and `Err(Cancelled)` as soon as
    /// cancellation is seen. Errors from the condition are passed on.
    pub fn wait<F>(&self, timeout: Duration, mut condition: F) -> TaskResult<bool>
    where
        F: FnMut() -> TaskResult<bool>,
    {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            self.check_cancelled()?;
            if condition()? {
                return Ok(true);
            }
            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => return Ok(false),
                Some(deadline) => deadline - now,
                None => self.poll,
            };
            if self.token.wait_timeout(self.poll.min(remaining)) {
                return Err(TaskError::Cancelled);
            }
        }
    }
}

pub trait TaskWork: Send {
    /// Run the task, recording results such as the image filename in `info`
    fn run(&mut self, ctx: &WorkContext, info: &mut TaskInfo) -> TaskResult<()>;
}

/// Builds the work for a task entry
pub trait TaskWorkFactory: Send + Sync {
    fn create(&self, entry: &TaskQueueEntry) -> TaskResult<Box<dyn TaskWork>>;
}

/// Resolves device names to devices
pub trait DeviceLocator: Send + Sync {
    fn ccd(&self, name: &str) -> DeviceResult<SharedCcd>;

    fn cooler(&self, name: &str) -> DeviceResult<SharedCooler>;

    fn filterwheel(&self, name: &str) -> DeviceResult<SharedFilterWheel>;
}

/// Does nothing for the exposure time, used for scheduling tests
pub struct SleepWork {
    secs: f64,
}

impl SleepWork {
    pub fn new(secs: f64) -> Self {
        Self { secs }
    }
}

impl TaskWork for SleepWork {
    fn run(&mut self, ctx: &WorkContext, _info: &mut TaskInfo) -> TaskResult<()> {
        tracing::debug!("sleeping {:.2}s", self.secs);
        ctx.sleep(self.secs)
    }
}

pub struct DefaultWorkFactory {
    devices: Arc<dyn DeviceLocator>,
    sink: Arc<dyn ImageSink>,
    config: ExposureWorkConfig,
}

impl DefaultWorkFactory {
    pub fn new(
        devices: Arc<dyn DeviceLocator>,
        sink: Arc<dyn ImageSink>,
        config: ExposureWorkConfig,
    ) -> Self {
        Self {
            devices,
            sink,
            config,
        }
    }
}

impl TaskWorkFactory for DefaultWorkFactory {
    fn create(&self, entry: &TaskQueueEntry) -> TaskResult<Box<dyn TaskWork>> {
        match entry.parameters.task_type {
            TaskType::Exposure => Ok(Box::new(ExposureWork::new(
                entry.parameters.clone(),
                self.devices.as_ref(),
                self.sink.clone(),
                self.config.clone(),
            )?)),
            TaskType::Sleep => Ok(Box::new(SleepWork::new(
                entry.parameters.exposure.exposure_time,
            ))),
        }
    }
}
