//! Task queue entries
//!
//! An entry is the write-once [`TaskParameters`] given at submission plus
//! the mutable [`TaskInfo`] tracking its lifecycle.

use chrono::{DateTime, Utc};
use polaris_common::device_name::same_device;
use polaris_common::{Exposure, ImageRectangle};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type TaskId = i64;

/// Lifecycle of a task
///
/// `pending → executing → complete | failed | cancelled`; `deleted` is
/// only ever reported to monitors when an entry is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Executing,
    Failed,
    Cancelled,
    Complete,
    Deleted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Failed | TaskState::Cancelled | TaskState::Complete
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Executing => "executing",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Complete => "complete",
            TaskState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Exposure,
    Sleep,
}

/// What a task should do, fixed at submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskParameters {
    pub task_type: TaskType,
    pub instrument: String,
    pub camera: String,
    pub ccd: String,
    pub cooler: String,
    /// Cooler set point in degrees Celsius
    pub ccd_temperature: Option<f64>,
    pub filterwheel: String,
    pub filter: String,
    pub mount: String,
    pub focuser: String,
    pub exposure: Exposure,
    pub project: String,
    pub repository: String,
}

impl Default for TaskParameters {
    fn default() -> Self {
        Self {
            task_type: TaskType::Exposure,
            instrument: String::new(),
            camera: String::new(),
            ccd: String::new(),
            cooler: String::new(),
            ccd_temperature: None,
            filterwheel: String::new(),
            filter: String::new(),
            mount: String::new(),
            focuser: String::new(),
            exposure: Exposure::default(),
            project: String::new(),
            repository: String::new(),
        }
    }
}

impl TaskParameters {
    /// Names of all devices this task uses
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        [
            &self.camera,
            &self.ccd,
            &self.cooler,
            &self.filterwheel,
            &self.mount,
            &self.focuser,
        ]
        .into_iter()
        .map(String::as_str)
        .filter(|name| !name.is_empty())
    }

    /// Whether the two tasks need some of the same hardware
    pub fn blocks(&self, other: &TaskParameters) -> bool {
        self.devices()
            .any(|mine| other.devices().any(|theirs| same_device(mine, theirs)))
    }
}

/// Mutable state of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub state: TaskState,
    pub last_change: DateTime<Utc>,
    /// Diagnostic for failed or cancelled tasks
    pub cause: String,
    pub filename: String,
    pub frame: ImageRectangle,
}

impl TaskInfo {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Pending,
            last_change: Utc::now(),
            cause: String::new(),
            filename: String::new(),
            frame: ImageRectangle::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueEntry {
    pub id: TaskId,
    pub parameters: TaskParameters,
    pub info: TaskInfo,
}

impl TaskQueueEntry {
    pub fn new(id: TaskId, parameters: TaskParameters) -> Self {
        Self {
            id,
            parameters,
            info: TaskInfo::new(id),
        }
    }

    pub fn state(&self) -> TaskState {
        self.info.state
    }

    pub fn set_state(&mut self, state: TaskState, cause: impl Into<String>) {
        self.info.state = state;
        self.info.cause = cause.into();
        self.info.last_change = Utc::now();
    }

    /// Reassign the id, e.g. once the store has allocated one
    pub fn set_id(&mut self, id: TaskId) {
        self.id = id;
        self.info.id = id;
    }

    pub fn blocks(&self, other: &TaskQueueEntry) -> bool {
        self.parameters.blocks(&other.parameters)
    }
}

/// State change notification sent to queue monitors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMonitorInfo {
    pub taskid: TaskId,
    pub state: TaskState,
    pub when: DateTime<Utc>,
}

impl From<&TaskInfo> for TaskMonitorInfo {
    fn from(info: &TaskInfo) -> Self {
        Self {
            taskid: info.id,
            state: info.state,
            when: info.last_change,
        }
    }
}
