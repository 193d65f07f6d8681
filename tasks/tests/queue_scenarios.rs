//! Scheduling scenarios for the task queue

use polaris_common::simulator::SimCcd;
use polaris_common::{
    Ccd, DeviceError, DeviceResult, Exposure, ExposureStatus, ImagePtr, SharedCcd, SharedCooler,
    SharedFilterWheel,
};
use polaris_tasks::{
    DefaultWorkFactory, DeviceLocator, ExposureWorkConfig, JsonTaskStore, MemoryImageSink,
    MemoryTaskStore, QueueConfig, QueueState, SleepWork, TaskError, TaskId, TaskInfo, TaskMonitor,
    TaskMonitorInfo, TaskParameters, TaskQueue, TaskQueueEntry, TaskResult, TaskState, TaskStore,
    TaskType, TaskWork, TaskWorkFactory, WorkContext,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct SleepFactory;

impl TaskWorkFactory for SleepFactory {
    fn create(&self, entry: &TaskQueueEntry) -> TaskResult<Box<dyn TaskWork>> {
        Ok(Box::new(SleepWork::new(entry.parameters.exposure.exposure_time)))
    }
}

fn config() -> QueueConfig {
    QueueConfig {
        poll_interval_ms: 5,
        ..QueueConfig::default()
    }
}

fn sleep_queue(store: Arc<dyn TaskStore>) -> TaskQueue {
    TaskQueue::new(store, Arc::new(SleepFactory), config())
}

fn sleep_task(ccd: &str, secs: f64) -> TaskParameters {
    TaskParameters {
        task_type: TaskType::Sleep,
        ccd: ccd.to_string(),
        exposure: Exposure::with_time(secs),
        ..TaskParameters::default()
    }
}

type Events = Arc<Mutex<Vec<(TaskId, TaskState)>>>;

fn recorder(queue: &TaskQueue) -> Events {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let monitor: TaskMonitor = Arc::new(move |info: &TaskMonitorInfo| {
        sink.lock().unwrap().push((info.taskid, info.state));
    });
    queue.set_callback(Some(monitor));
    events
}

fn position(events: &Events, id: TaskId, state: TaskState) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .position(|&(i, s)| i == id && s == state)
        .unwrap_or_else(|| panic!("task {} never reached {}", id, state))
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn wait_state(queue: &TaskQueue, id: TaskId, state: TaskState) {
    assert!(
        wait_until(Duration::from_secs(10), || queue.info(id).unwrap().state == state),
        "task {} did not become {}",
        id,
        state
    );
}

#[test]
fn conflicting_tasks_run_in_submission_order() {
    let queue = sleep_queue(Arc::new(MemoryTaskStore::new()));
    let events = recorder(&queue);
    let first = queue.submit(sleep_task("ccd:sim/0/Imaging", 0.2)).unwrap();
    let second = queue.submit(sleep_task("ccd:sim/0", 0.05)).unwrap();
    queue.start().unwrap();

    wait_state(&queue, second, TaskState::Complete);
    assert_eq!(queue.info(first).unwrap().state, TaskState::Complete);
    assert!(
        position(&events, second, TaskState::Executing)
            > position(&events, first, TaskState::Complete)
    );
    queue.shutdown().unwrap();
}

#[test]
fn independent_tasks_run_concurrently() {
    let queue = sleep_queue(Arc::new(MemoryTaskStore::new()));
    let events = recorder(&queue);
    let first = queue.submit(sleep_task("ccd:sim/0", 0.3)).unwrap();
    let second = queue.submit(sleep_task("ccd:sim/1", 0.3)).unwrap();
    queue.start().unwrap();

    wait_state(&queue, first, TaskState::Complete);
    wait_state(&queue, second, TaskState::Complete);
    let first_done = position(&events, first, TaskState::Complete);
    assert!(position(&events, second, TaskState::Executing) < first_done);
    queue.shutdown().unwrap();
}

#[test]
fn cancel_running_task() {
    let queue = sleep_queue(Arc::new(MemoryTaskStore::new()));
    let id = queue.submit(sleep_task("ccd:sim/0", 30.0)).unwrap();
    queue.start().unwrap();
    wait_state(&queue, id, TaskState::Executing);

    assert!(matches!(queue.remove(id), Err(TaskError::StillExecuting(_))));
    queue.cancel(id).unwrap();
    queue.wait_for(id);

    let info = queue.info(id).unwrap();
    assert_eq!(info.state, TaskState::Cancelled);
    assert_eq!(info.cause, "cancelled by request");
    assert_eq!(queue.nexecutors(), 0);

    queue.remove(id).unwrap();
    assert!(!queue.exists(id).unwrap());
    queue.shutdown().unwrap();
}

#[test]
fn recover_fails_interrupted_tasks() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut entry = TaskQueueEntry::new(0, sleep_task("ccd:sim/0", 1.0));
    let id = store.add(&entry).unwrap();
    entry.set_id(id);
    entry.set_state(TaskState::Executing, "");
    store.update(&entry).unwrap();

    let queue = sleep_queue(store);
    assert_eq!(queue.recover().unwrap(), 1);
    let info = queue.info(id).unwrap();
    assert_eq!(info.state, TaskState::Failed);
    assert_eq!(info.cause, "server crash");
    assert_eq!(queue.nexecutors(), 0);
    assert_eq!(queue.recover().unwrap(), 0);
}

#[test]
fn stop_lets_running_tasks_finish() {
    let queue = sleep_queue(Arc::new(MemoryTaskStore::new()));
    let running = queue.submit(sleep_task("ccd:sim/0", 0.3)).unwrap();
    queue.start().unwrap();
    wait_state(&queue, running, TaskState::Executing);

    queue.stop();
    assert_eq!(queue.state(), QueueState::Stopping);
    let held = queue.submit(sleep_task("ccd:sim/1", 0.0)).unwrap();
    queue.wait().unwrap();

    assert_eq!(queue.state(), QueueState::Stopped);
    assert_eq!(queue.info(running).unwrap().state, TaskState::Complete);
    assert_eq!(queue.info(held).unwrap().state, TaskState::Pending);

    queue.start().unwrap();
    wait_state(&queue, held, TaskState::Complete);
    queue.shutdown().unwrap();
    assert_eq!(queue.state(), QueueState::Idle);
}

#[test]
fn failing_factory_marks_task_failed() {
    struct Broken;

    impl TaskWorkFactory for Broken {
        fn create(&self, _entry: &TaskQueueEntry) -> TaskResult<Box<dyn TaskWork>> {
            Err(TaskError::Unsupported("no such work".to_string()))
        }
    }

    let queue = TaskQueue::new(Arc::new(MemoryTaskStore::new()), Arc::new(Broken), config());
    let id = queue.submit(sleep_task("ccd:sim/0", 0.0)).unwrap();
    queue.start().unwrap();
    let info = queue.info(id).unwrap();
    assert_eq!(info.state, TaskState::Failed);
    assert!(info.cause.contains("no such work"));
    queue.shutdown().unwrap();
}

#[test]
fn json_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    let id = {
        let queue = sleep_queue(Arc::new(JsonTaskStore::open(&path).unwrap()));
        let id = queue.submit(sleep_task("ccd:sim/0", 0.0)).unwrap();
        queue.start().unwrap();
        wait_state(&queue, id, TaskState::Complete);
        id
    };

    let queue = sleep_queue(Arc::new(JsonTaskStore::open(&path).unwrap()));
    assert_eq!(queue.info(id).unwrap().state, TaskState::Complete);
    assert_eq!(queue.tasklist(Some(TaskState::Complete)).unwrap(), vec![id]);
}

struct CameraOnly {
    ccd: Arc<SimCcd>,
}

impl DeviceLocator for CameraOnly {
    fn ccd(&self, name: &str) -> DeviceResult<SharedCcd> {
        if name == "ccd:sim/0/Imaging" {
            Ok(self.ccd.clone())
        } else {
            Err(DeviceError::NotFound(name.to_string()))
        }
    }

    fn cooler(&self, name: &str) -> DeviceResult<SharedCooler> {
        Err(DeviceError::NotFound(name.to_string()))
    }

    fn filterwheel(&self, name: &str) -> DeviceResult<SharedFilterWheel> {
        Err(DeviceError::NotFound(name.to_string()))
    }
}

#[test]
fn exposure_task_stores_image() {
    let ccd = Arc::new(SimCcd::new("ccd:sim/0/Imaging"));
    let sink = Arc::new(MemoryImageSink::new());
    let factory = DefaultWorkFactory::new(
        Arc::new(CameraOnly { ccd: ccd.clone() }),
        sink.clone(),
        ExposureWorkConfig::default(),
    );
    let queue = TaskQueue::new(Arc::new(MemoryTaskStore::new()), Arc::new(factory), config());

    let good = queue
        .submit(TaskParameters {
            ccd: "ccd:sim/0/Imaging".to_string(),
            project: "ngc7000".to_string(),
            exposure: Exposure::with_time(0.05),
            ..TaskParameters::default()
        })
        .unwrap();
    let missing = queue
        .submit(TaskParameters {
            ccd: "ccd:sim/9/Imaging".to_string(),
            exposure: Exposure::with_time(0.05),
            ..TaskParameters::default()
        })
        .unwrap();
    queue.start().unwrap();

    wait_state(&queue, good, TaskState::Complete);
    assert_eq!(queue.info(good).unwrap().filename, "ngc7000-00001.fits");
    assert_eq!(queue.info(missing).unwrap().state, TaskState::Failed);
    assert_eq!(ccd.exposure_count(), 1);
    assert_eq!(sink.images().len(), 1);
    queue.shutdown().unwrap();
}

#[test]
fn cancel_all_stops_every_running_task() {
    let queue = sleep_queue(Arc::new(MemoryTaskStore::new()));
    let first = queue.submit(sleep_task("ccd:sim/0", 30.0)).unwrap();
    let second = queue.submit(sleep_task("ccd:sim/1", 30.0)).unwrap();
    queue.start().unwrap();
    wait_state(&queue, first, TaskState::Executing);
    wait_state(&queue, second, TaskState::Executing);
    assert_eq!(queue.nexecutors(), 2);

    let start = Instant::now();
    queue.cancel_all();
    queue.wait_for(first);
    queue.wait_for(second);
    assert!(start.elapsed() < Duration::from_secs(5));

    for id in [first, second] {
        let info = queue.info(id).unwrap();
        assert_eq!(info.state, TaskState::Cancelled);
        assert_eq!(info.cause, "cancelled by request");
    }
    assert_eq!(queue.nexecutors(), 0);
    assert_eq!(queue.state(), QueueState::Launching);
    queue.shutdown().unwrap();
}

#[test]
fn cancel_blocked_task_before_launch() {
    let queue = sleep_queue(Arc::new(MemoryTaskStore::new()));
    let events = recorder(&queue);
    let running = queue.submit(sleep_task("ccd:sim/0", 30.0)).unwrap();
    let blocked = queue.submit(sleep_task("ccd:sim/0/Imaging", 0.0)).unwrap();
    queue.start().unwrap();
    wait_state(&queue, running, TaskState::Executing);
    assert_eq!(queue.info(blocked).unwrap().state, TaskState::Pending);
    assert_eq!(queue.nexecutors(), 1);

    queue.cancel(blocked).unwrap();
    let info = queue.info(blocked).unwrap();
    assert_eq!(info.state, TaskState::Cancelled);
    assert_eq!(info.cause, "cancelled before launch");

    queue.cancel(running).unwrap();
    queue.wait_for(running);
    assert_eq!(queue.info(running).unwrap().state, TaskState::Cancelled);
    assert_eq!(queue.info(blocked).unwrap().state, TaskState::Cancelled);
    assert!(!events
        .lock()
        .unwrap()
        .contains(&(blocked, TaskState::Executing)));
    queue.shutdown().unwrap();
}

struct TrackedFactory {
    alive: Arc<()>,
}

struct TrackedWork {
    sleep: SleepWork,
    _alive: Arc<()>,
}

impl TaskWork for TrackedWork {
    fn run(&mut self, ctx: &WorkContext, info: &mut TaskInfo) -> TaskResult<()> {
        self.sleep.run(ctx, info)
    }
}

impl TaskWorkFactory for TrackedFactory {
    fn create(&self, entry: &TaskQueueEntry) -> TaskResult<Box<dyn TaskWork>> {
        Ok(Box::new(TrackedWork {
            sleep: SleepWork::new(entry.parameters.exposure.exposure_time),
            _alive: self.alive.clone(),
        }))
    }
}

#[test]
fn dropping_queue_cancels_and_joins_running_tasks() {
    let store = Arc::new(MemoryTaskStore::new());
    let alive = Arc::new(());
    let queue = TaskQueue::new(
        store.clone(),
        Arc::new(TrackedFactory {
            alive: alive.clone(),
        }),
        config(),
    );
    let id = queue.submit(sleep_task("ccd:sim/0", 30.0)).unwrap();
    queue.start().unwrap();
    wait_state(&queue, id, TaskState::Executing);
    assert_eq!(Arc::strong_count(&alive), 3);

    let start = Instant::now();
    drop(queue);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(store.by_id(id).unwrap().state(), TaskState::Cancelled);
    assert_eq!(Arc::strong_count(&alive), 1);
}

/// Store whose first attempt to record a launch fails
struct FlakyStore {
    tasks: MemoryTaskStore,
    fail_launch: AtomicBool,
}

impl TaskStore for FlakyStore {
    fn add(&self, entry: &TaskQueueEntry) -> TaskResult<TaskId> {
        self.tasks.add(entry)
    }

    fn update(&self, entry: &TaskQueueEntry) -> TaskResult<()> {
        if entry.state() == TaskState::Executing && self.fail_launch.swap(false, Ordering::SeqCst) {
            return Err(TaskError::Store("disk full".to_string()));
        }
        self.tasks.update(entry)
    }

    fn remove(&self, id: TaskId) -> TaskResult<()> {
        self.tasks.remove(id)
    }

    fn by_id(&self, id: TaskId) -> TaskResult<TaskQueueEntry> {
        self.tasks.by_id(id)
    }

    fn exists(&self, id: TaskId) -> TaskResult<bool> {
        self.tasks.exists(id)
    }

    fn select_ids(&self, state: Option<TaskState>) -> TaskResult<Vec<TaskId>> {
        self.tasks.select_ids(state)
    }
}

#[derive(Default)]
struct CountingFactory {
    created: Mutex<Vec<TaskId>>,
}

impl TaskWorkFactory for CountingFactory {
    fn create(&self, entry: &TaskQueueEntry) -> TaskResult<Box<dyn TaskWork>> {
        self.created.lock().unwrap().push(entry.id);
        Ok(Box::new(SleepWork::new(entry.parameters.exposure.exposure_time)))
    }
}

#[test]
fn unrecorded_launch_fails_task_once() {
    let store = Arc::new(FlakyStore {
        tasks: MemoryTaskStore::new(),
        fail_launch: AtomicBool::new(true),
    });
    let factory = Arc::new(CountingFactory::default());
    let queue = TaskQueue::new(store, factory.clone(), config());
    queue.start().unwrap();

    let first = queue.submit(sleep_task("", 0.5)).unwrap();
    let info = queue.info(first).unwrap();
    assert_eq!(info.state, TaskState::Failed);
    assert!(info.cause.contains("disk full"), "{}", info.cause);
    assert_eq!(queue.nexecutors(), 0);

    let second = queue.submit(sleep_task("", 0.0)).unwrap();
    wait_state(&queue, second, TaskState::Complete);
    assert_eq!(queue.info(first).unwrap().state, TaskState::Failed);
    assert_eq!(*factory.created.lock().unwrap(), vec![first, second]);
    queue.shutdown().unwrap();
}

/// Camera that never finishes an exposure until cancelled
#[derive(Default)]
struct StuckCcd {
    cancelled: AtomicBool,
}

impl Ccd for StuckCcd {
    fn name(&self) -> &str {
        "ccd:stuck/0/Imaging"
    }

    fn start_exposure(&self, _exposure: &Exposure) -> DeviceResult<()> {
        Ok(())
    }

    fn exposure_status(&self) -> DeviceResult<ExposureStatus> {
        if self.cancelled.load(Ordering::SeqCst) {
            Ok(ExposureStatus::Idle)
        } else {
            Ok(ExposureStatus::Exposing)
        }
    }

    fn get_image(&self) -> DeviceResult<ImagePtr> {
        Err(DeviceError::NoImage(self.name().to_string()))
    }

    fn cancel_exposure(&self) -> DeviceResult<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct StuckCamera {
    ccd: Arc<StuckCcd>,
}

impl DeviceLocator for StuckCamera {
    fn ccd(&self, _name: &str) -> DeviceResult<SharedCcd> {
        Ok(self.ccd.clone())
    }

    fn cooler(&self, name: &str) -> DeviceResult<SharedCooler> {
        Err(DeviceError::NotFound(name.to_string()))
    }

    fn filterwheel(&self, name: &str) -> DeviceResult<SharedFilterWheel> {
        Err(DeviceError::NotFound(name.to_string()))
    }
}

#[test]
fn queue_config_sets_exposure_timeouts() {
    let ccd = Arc::new(StuckCcd::default());
    let devices = Arc::new(StuckCamera { ccd: ccd.clone() });
    let queue_config = QueueConfig {
        exposure: ExposureWorkConfig {
            exposure_grace_secs: 0.1,
            cancel_settle_timeout_secs: 1.0,
            ..ExposureWorkConfig::default()
        },
        ..config()
    };
    let queue = TaskQueue::with_devices(
        Arc::new(MemoryTaskStore::new()),
        devices.clone(),
        Arc::new(MemoryImageSink::new()),
        queue_config,
    )
    .unwrap();

    let id = queue
        .submit(TaskParameters {
            ccd: "ccd:stuck/0/Imaging".to_string(),
            exposure: Exposure::with_time(0.0),
            ..TaskParameters::default()
        })
        .unwrap();
    let start = Instant::now();
    queue.start().unwrap();
    wait_state(&queue, id, TaskState::Failed);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(queue.info(id).unwrap().cause.contains("exposure on"));
    assert!(ccd.cancelled.load(Ordering::SeqCst));
    queue.shutdown().unwrap();

    let rejected = TaskQueue::with_devices(
        Arc::new(MemoryTaskStore::new()),
        devices,
        Arc::new(MemoryImageSink::new()),
        QueueConfig {
            exposure: ExposureWorkConfig {
                exposure_grace_secs: -1.0,
                ..ExposureWorkConfig::default()
            },
            ..config()
        },
    );
    assert!(matches!(rejected, Err(TaskError::Config(_))));
}
