use anyhow::{anyhow, bail};
use crossbeam_queue::{ArrayQueue, SegQueue};
use parking_lot::{Condvar, Mutex};
use sluice_types::config::WorkerConfig;
use sluice_types::WorkerThreadId;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type TaskFn = Box<dyn FnOnce(WorkerThreadId) -> anyhow::Result<()> + Send>;

/// A unit of work that runs to completion on one worker thread.
pub struct Task {
    name: String,
    run: TaskFn,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        run: impl FnOnce(WorkerThreadId) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(self, thread: WorkerThreadId) -> anyhow::Result<()> {
        (self.run)(thread)
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.name)
    }
}

/// Bounded admission queue for external work plus an unbounded queue for work created by
/// running tasks. A counting semaphore tracks the queued tasks so idle workers block instead
/// of spinning.
pub struct TaskQueue {
    admission: ArrayQueue<Task>,
    internal: SegQueue<Task>,
    queued: Mutex<usize>,
    available: Condvar,
    stop: CancellationToken,
    poll_interval: Duration,
}

impl TaskQueue {
    pub fn new(admission_queue_size: usize, poll_interval: Duration) -> Self {
        Self {
            admission: ArrayQueue::new(admission_queue_size.max(1)),
            internal: SegQueue::new(),
            queued: Mutex::new(0),
            available: Condvar::new(),
            stop: CancellationToken::new(),
            poll_interval,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.admission_queue_size, config.poll_interval())
    }

    fn signal(&self) {
        *self.queued.lock() += 1;
        self.available.notify_one();
    }

    /// Admits an external task. Fails if the admission queue is full or the queue is stopped.
    pub fn submit(&self, task: Task) -> anyhow::Result<()> {
        if self.stop.is_cancelled() {
            bail!("task queue is stopped; rejecting {}", task.name);
        }
        self.admission
            .push(task)
            .map_err(|t| anyhow!("admission queue is full; rejecting {}", t.name))?;
        self.signal();
        Ok(())
    }

    pub fn submit_internal(&self, task: Task) {
        self.internal.push(task);
        self.signal();
    }

    /// Waits for the next task, preferring internal work. Returns `None` once the stop token
    /// is cancelled; the token is checked at least every poll interval.
    pub fn blocking_read(&self) -> Option<Task> {
        let mut queued = self.queued.lock();
        loop {
            if self.stop.is_cancelled() {
                return None;
            }

            if *queued > 0 {
                *queued -= 1;
                drop(queued);
                return self.internal.pop().or_else(|| self.admission.pop());
            }

            self.available.wait_for(&mut queued, self.poll_interval);
        }
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        *self.queued.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct TaskCounters {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

/// A fixed set of OS threads draining a [`TaskQueue`].
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    counters: Arc<TaskCounters>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(number_of_threads: u64, queue: Arc<TaskQueue>) -> anyhow::Result<Self> {
        let counters = Arc::new(TaskCounters::default());
        let mut handles = vec![];
        for id in 0..number_of_threads {
            let queue = queue.clone();
            let counters = counters.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sluice-worker-{id}"))
                .spawn(move || run_worker(WorkerThreadId(id), &queue, &counters))?;
            handles.push(handle);
        }
        info!("started {} worker threads", number_of_threads);

        Ok(Self {
            queue,
            counters,
            handles,
        })
    }

    /// Starts `[worker] number-of-threads` workers on a new queue sized by the same section.
    pub fn from_config(config: &WorkerConfig) -> anyhow::Result<Self> {
        Self::start(
            config.number_of_threads,
            Arc::new(TaskQueue::from_config(config)),
        )
    }

    pub fn number_of_threads(&self) -> usize {
        self.handles.len()
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn completed_tasks(&self) -> u64 {
        self.counters.completed.load(Ordering::Acquire)
    }

    pub fn failed_tasks(&self) -> u64 {
        self.counters.failed.load(Ordering::Acquire)
    }

    /// Stops the queue and waits for every worker to finish its current task.
    pub fn shutdown(self) {
        self.queue.stop();
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        info!(
            "worker pool stopped after {} completed and {} failed tasks",
            self.counters.completed.load(Ordering::Acquire),
            self.counters.failed.load(Ordering::Acquire)
        );
    }
}

fn run_worker(thread: WorkerThreadId, queue: &TaskQueue, counters: &TaskCounters) {
    debug!("worker {} started", thread);
    while let Some(task) = queue.blocking_read() {
        let name = task.name.clone();
        match task.run(thread) {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => {
                error!("task {} failed on worker {}: {:?}", name, thread, e);
                counters.failed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    debug!("worker {} stopped", thread);
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    fn noop(name: &str) -> Task {
        Task::new(name, |_| Ok(()))
    }

    #[test]
    fn test_pool_from_config() {
        let config = WorkerConfig {
            number_of_threads: 2,
            admission_queue_size: 1,
            poll_interval_ms: 5,
        };
        let queue = TaskQueue::from_config(&config);
        queue.submit(noop("a")).unwrap();
        assert!(queue.submit(noop("b")).is_err());

        let pool = WorkerPool::from_config(&config).unwrap();
        assert_eq!(pool.number_of_threads(), 2);
        pool.queue().submit(noop("c")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.completed_tasks() < 1 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        pool.shutdown();
    }

    #[test]
    fn test_admission_is_bounded() {
        let queue = TaskQueue::new(2, Duration::from_millis(10));
        queue.submit(noop("a")).unwrap();
        queue.submit(noop("b")).unwrap();
        assert!(queue.submit(noop("c")).is_err());
        queue.submit_internal(noop("d"));
        assert_eq!(queue.len(), 3);

        // internal work is taken first
        assert_eq!(queue.blocking_read().unwrap().name(), "d");
        assert_eq!(queue.blocking_read().unwrap().name(), "a");
    }

    #[test]
    fn test_stop_token_releases_blocked_reader() {
        let queue = Arc::new(TaskQueue::new(4, Duration::from_millis(10)));
        let reader = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.blocking_read().is_none())
        };

        std::thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        queue.stop_token().cancel();
        assert!(reader.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(queue.submit(noop("late")).is_err());
    }

    #[test]
    fn test_pool_runs_tasks_and_counts_failures() {
        let queue = Arc::new(TaskQueue::new(16, Duration::from_millis(5)));
        let pool = WorkerPool::start(3, queue.clone()).unwrap();

        for i in 0..10 {
            queue
                .submit(Task::new(format!("task {i}"), move |_| {
                    if i % 5 == 0 {
                        bail!("task {i} failed");
                    }
                    Ok(())
                }))
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.completed_tasks() + pool.failed_tasks() < 10 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.completed_tasks(), 8);
        assert_eq!(pool.failed_tasks(), 2);
        pool.shutdown();
    }
}
