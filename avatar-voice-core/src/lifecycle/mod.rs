//! Named worker threads and the named queues connecting them.
//!
//! ## Lifecycle
//!
//! ```text
//! create_queue("frames")   create_thread("vad", body)
//!                               └─► start("vad")      → OS thread "vad" running body(stop)
//!                                   └─► stop_all(true) → stop.set(), bounded join
//! ```
//!
//! Loop bodies receive a [`StopSignal`] and must poll it; every queue wait in
//! this crate carries a timeout so the signal is observed within one interval.
//! Unknown names never panic: they log an error and return `false` / `None`.

pub mod queue;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

pub use queue::ManagedQueue;
use queue::ErasedQueue;

/// Default bounded wait when joining a stopped worker.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval while waiting on a worker to finish or a stop-aware sleep.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Cooperative stop flag shared between a manager and one worker body.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep for `duration` unless the signal is set first.
    ///
    /// Returns `true` if the signal was set while sleeping.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

type LoopBody = Box<dyn FnOnce(StopSignal) + Send + 'static>;

/// A registered background worker.
pub struct ManagedThread {
    name: String,
    stop: StopSignal,
    body: Option<LoopBody>,
    handle: Option<JoinHandle<()>>,
}

impl ManagedThread {
    fn new(name: String, body: LoopBody) -> Self {
        Self {
            name,
            stop: StopSignal::new(),
            body: Some(body),
            handle: None,
        }
    }

    /// `true` while the OS thread has been spawned and has not returned.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of named workers and named bounded queues.
///
/// `LifecycleManager` is `Send + Sync`; one instance usually backs one
/// pipeline run and is dropped when the run ends (dropping signals every
/// worker to stop without waiting).
pub struct LifecycleManager {
    threads: Mutex<HashMap<String, ManagedThread>>,
    queues: Mutex<HashMap<String, Arc<dyn ErasedQueue>>>,
    join_timeout: Duration,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::with_join_timeout(DEFAULT_JOIN_TIMEOUT)
    }

    pub fn with_join_timeout(join_timeout: Duration) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            join_timeout,
        }
    }

    // ── Queues ───────────────────────────────────────────────────────────────

    /// Register a new empty queue, replacing (with a warning) any queue of the
    /// same name.
    pub fn create_queue<T: Send + 'static>(
        &self,
        name: &str,
        capacity: usize,
    ) -> Arc<ManagedQueue<T>> {
        let queue = Arc::new(ManagedQueue::<T>::new(name, capacity));
        let previous = self
            .queues
            .lock()
            .insert(name.to_string(), Arc::clone(&queue) as Arc<dyn ErasedQueue>);
        if previous.is_some() {
            warn!(queue = name, "queue already exists, replacing it");
        }
        queue
    }

    /// Typed handle to a registered queue.
    ///
    /// Logs an error and returns `None` for unknown names or when `T` does not
    /// match the type the queue was created with.
    pub fn queue<T: Send + 'static>(&self, name: &str) -> Option<Arc<ManagedQueue<T>>> {
        let Some(erased) = self.queues.lock().get(name).cloned() else {
            error!(queue = name, "queue does not exist");
            return None;
        };
        let any: Arc<dyn Any + Send + Sync> = erased.into_any();
        match any.downcast::<ManagedQueue<T>>() {
            Ok(queue) => Some(queue),
            Err(_) => {
                error!(
                    queue = name,
                    expected = std::any::type_name::<T>(),
                    "queue item type mismatch"
                );
                None
            }
        }
    }

    /// Enqueue onto a named queue. See [`ManagedQueue::put`].
    pub fn put<T: Send + 'static>(
        &self,
        queue_name: &str,
        item: T,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> bool {
        match self.queue::<T>(queue_name) {
            Some(queue) => queue.put(item, blocking, timeout),
            None => false,
        }
    }

    /// Dequeue from a named queue, `None` on timeout or unknown queue.
    pub fn get<T: Send + 'static>(&self, queue_name: &str, timeout: Duration) -> Option<T> {
        self.queue::<T>(queue_name)?.get(timeout)
    }

    /// Non-blocking emptiness check. Unknown queues count as empty.
    pub fn is_empty(&self, queue_name: &str) -> bool {
        self.queues
            .lock()
            .get(queue_name)
            .map(|q| q.is_empty())
            .unwrap_or(true)
    }

    pub fn queue_len(&self, queue_name: &str) -> usize {
        self.queues
            .lock()
            .get(queue_name)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Drop every buffered item in every queue, returning how many were discarded.
    pub fn clear_queues(&self) -> usize {
        self.queues.lock().values().map(|q| q.clear()).sum()
    }

    // ── Threads ──────────────────────────────────────────────────────────────

    /// Register a worker. The body receives its stop signal as its argument.
    ///
    /// If a worker with the same name exists it is stopped (bounded join)
    /// before being replaced.
    pub fn create_thread<F>(&self, name: &str, body: F)
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        if self.threads.lock().contains_key(name) {
            warn!(thread = name, "thread already exists, stopping and replacing it");
            self.stop_thread(name, true);
        }
        self.threads
            .lock()
            .insert(name.to_string(), ManagedThread::new(name.to_string(), Box::new(body)));
    }

    /// Spawn the named worker. Idempotent: returns `false` if it is already
    /// running, has already run, or does not exist.
    pub fn start(&self, name: &str) -> bool {
        let mut threads = self.threads.lock();
        let Some(thread) = threads.get_mut(name) else {
            error!(thread = name, "thread does not exist");
            return false;
        };

        if thread.is_running() {
            warn!(thread = name, "thread is already running");
            return false;
        }

        let Some(body) = thread.body.take() else {
            warn!(thread = name, "thread has already run and cannot be restarted");
            return false;
        };

        let stop = thread.stop.clone();
        match std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(stop))
        {
            Ok(handle) => {
                thread.handle = Some(handle);
                info!(thread = name, "thread started");
                true
            }
            Err(e) => {
                error!(thread = name, "failed to spawn thread: {e}");
                false
            }
        }
    }

    /// Signal one worker to stop, optionally waiting (bounded) for it to exit.
    ///
    /// Returns `true` if the worker was running when the signal was sent.
    pub fn stop_thread(&self, name: &str, wait: bool) -> bool {
        let handle = {
            let mut threads = self.threads.lock();
            let Some(thread) = threads.get_mut(name) else {
                error!(thread = name, "thread does not exist");
                return false;
            };
            let was_running = thread.is_running();
            thread.stop.set();
            if !was_running {
                return false;
            }
            if wait {
                thread.handle.take()
            } else {
                None
            }
        };

        if let Some(handle) = handle {
            join_bounded(name, handle, self.join_timeout);
        }
        true
    }

    /// Signal every worker to stop; with `wait`, join each with a bounded timeout.
    pub fn stop_all(&self, wait: bool) {
        let names: Vec<String> = self.threads.lock().keys().cloned().collect();
        for name in &names {
            if let Some(thread) = self.threads.lock().get(name) {
                thread.stop.set();
            }
        }
        if wait {
            for name in &names {
                self.stop_thread(name, true);
            }
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.threads
            .lock()
            .get(name)
            .map(ManagedThread::is_running)
            .unwrap_or(false)
    }

    /// Names of all registered workers, sorted.
    pub fn thread_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.threads.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        for thread in self.threads.get_mut().values() {
            thread.stop.set();
        }
    }
}

/// Join `handle` if it finishes within `timeout`; otherwise detach it.
fn join_bounded(name: &str, handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = name, ?timeout, "thread did not stop in time, detaching it");
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    match handle.join() {
        Ok(()) => info!(thread = name, "thread stopped"),
        Err(_) => error!(thread = name, "thread panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn spin_until_stopped(counter: Arc<AtomicUsize>) -> impl FnOnce(StopSignal) + Send {
        move |stop: StopSignal| {
            while !stop.is_set() {
                counter.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn start_is_idempotent() {
        let mgr = LifecycleManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        mgr.create_thread("worker", spin_until_stopped(Arc::clone(&counter)));

        assert!(mgr.start("worker"));
        assert!(!mgr.start("worker"), "second start must be a no-op");
        assert!(mgr.is_running("worker"));

        mgr.stop_all(true);
        assert!(!mgr.is_running("worker"));
        assert!(!mgr.start("worker"), "a finished worker cannot be restarted");
    }

    #[test]
    fn unknown_names_return_failure_indicators() {
        let mgr = LifecycleManager::new();
        assert!(!mgr.start("ghost"));
        assert!(!mgr.stop_thread("ghost", true));
        assert!(!mgr.put("ghost", 1u32, false, None));
        assert_eq!(mgr.get::<u32>("ghost", Duration::from_millis(1)), None);
        assert!(mgr.is_empty("ghost"));
    }

    #[test]
    fn type_mismatch_is_reported_not_panicked() {
        let mgr = LifecycleManager::new();
        mgr.create_queue::<u32>("numbers", 4);
        assert!(!mgr.put("numbers", "text".to_string(), false, None));
        assert!(mgr.queue::<String>("numbers").is_none());
        assert!(mgr.put("numbers", 7u32, false, None));
        assert_eq!(mgr.get::<u32>("numbers", Duration::from_millis(5)), Some(7));
    }

    #[test]
    fn recreating_queue_replaces_contents() {
        let mgr = LifecycleManager::new();
        mgr.create_queue::<u8>("q", 4);
        assert!(mgr.put("q", 1u8, false, None));
        assert!(!mgr.is_empty("q"));
        mgr.create_queue::<u8>("q", 4);
        assert!(mgr.is_empty("q"));
    }

    #[test]
    fn recreating_thread_stops_previous_worker() {
        let mgr = LifecycleManager::new();
        let first = Arc::new(AtomicUsize::new(0));
        mgr.create_thread("worker", spin_until_stopped(Arc::clone(&first)));
        assert!(mgr.start("worker"));
        std::thread::sleep(Duration::from_millis(10));

        let second = Arc::new(AtomicUsize::new(0));
        mgr.create_thread("worker", spin_until_stopped(Arc::clone(&second)));
        let frozen = first.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(first.load(Ordering::Relaxed), frozen);

        assert!(mgr.start("worker"));
        mgr.stop_all(true);
    }

    #[test]
    fn bounded_join_detaches_stuck_worker() {
        let mgr = LifecycleManager::with_join_timeout(Duration::from_millis(20));
        mgr.create_thread("stuck", |_stop| {
            std::thread::sleep(Duration::from_millis(300));
        });
        assert!(mgr.start("stuck"));

        let started = Instant::now();
        mgr.stop_all(true);
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn stop_signal_sleep_wakes_early() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.set();
        });
        let started = Instant::now();
        assert!(stop.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
        handle.join().expect("setter thread panicked");
    }
}
