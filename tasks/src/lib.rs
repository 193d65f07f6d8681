//! Polaris Tasks
//!
//! A persistent queue of camera tasks. Each runnable task gets its own
//! executor thread; tasks that would contend for the same hardware are
//! run one after the other in submission order.

pub mod config;
pub mod entry;
pub mod error;
pub mod executor;
pub mod exposure;
pub mod queue;
pub mod store;
pub mod work;

pub use config::{ExposureWorkConfig, QueueConfig};
pub use entry::{TaskId, TaskInfo, TaskMonitorInfo, TaskParameters, TaskQueueEntry, TaskState, TaskType};
pub use error::{TaskError, TaskResult};
pub use executor::TaskExecutor;
pub use exposure::{ExposureWork, ImageSink, MemoryImageSink};
pub use queue::{QueueState, TaskMonitor, TaskQueue};
pub use store::{JsonTaskStore, MemoryTaskStore, TaskStore};
pub use work::{DefaultWorkFactory, DeviceLocator, SleepWork, TaskWork, TaskWorkFactory, WorkContext};
