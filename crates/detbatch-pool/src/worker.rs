use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use detbatch_core::{DetError, Result};

type Task = Box<dyn FnOnce(usize) + Send + 'static>;

/// A fixed set of long-lived worker threads with stable identities `0..size`.
///
/// Tasks go to whichever worker is free next; a task learns which worker runs
/// it through the identity argument. Per-worker state (such as a detector
/// shard) must be selected from that argument, never from submission order.
pub struct WorkerPool {
    name: String,
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled when a task is queued or the pool shuts down.
    task_ready: Condvar,
    /// Signalled when `outstanding` drops to zero.
    idle: Condvar,
}

struct PoolState {
    tasks: VecDeque<Task>,
    /// Queued plus running tasks.
    outstanding: usize,
    panicked: u64,
    shutdown: bool,
}

impl WorkerPool {
    /// Spawn `size` workers named `{name}-{identity}`.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(DetError::InvalidInput(format!(
                "worker pool '{name}' needs at least one thread"
            )));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                outstanding: 0,
                panicked: 0,
                shutdown: false,
            }),
            task_ready: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut pool = Self {
            name: name.to_string(),
            shared,
            handles: Vec::with_capacity(size),
        };

        for identity in 0..size {
            let shared = Arc::clone(&pool.shared);
            // On error `pool` is dropped, which shuts down the workers spawned so far.
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{identity}"))
                .spawn(move || worker_loop(&shared, identity))?;
            pool.handles.push(handle);
        }

        tracing::debug!(pool = name, workers = size, "spawned worker pool");
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Tasks queued or running right now.
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding
    }

    /// Tasks that panicked since the pool was created.
    pub fn panicked_tasks(&self) -> u64 {
        self.shared.state.lock().panicked
    }

    /// Submit `task` to the next available worker without waiting for it.
    pub fn run<F>(&self, task: F)
    where
        F: FnOnce(usize) + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            state.outstanding += 1;
            state.tasks.push_back(Box::new(task));
        }
        self.shared.task_ready.notify_one();
    }

    /// Block until every submitted task has finished.
    ///
    /// Must not be called from inside one of this pool's own tasks.
    pub fn join(&self) {
        let mut state = self.shared.state.lock();
        self.shared
            .idle
            .wait_while(&mut state, |state| state.outstanding > 0);
    }

    /// Run `f` exactly once on every worker, then [`join`](Self::join).
    ///
    /// Each task holds its worker at a barrier until all workers have picked
    /// one up, so no worker can take two of them.
    pub fn broadcast<F>(&self, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let barrier = Arc::new(Barrier::new(self.size()));
        for _ in 0..self.size() {
            let f = Arc::clone(&f);
            let barrier = Arc::clone(&barrier);
            self.run(move |identity| {
                barrier.wait();
                f(identity);
            });
        }
        self.join();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.task_ready.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!(pool = %self.name, "worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

fn worker_loop(shared: &Shared, identity: usize) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            shared
                .task_ready
                .wait_while(&mut state, |state| state.tasks.is_empty() && !state.shutdown);
            match state.tasks.pop_front() {
                Some(task) => task,
                // Shut down and nothing left to run.
                None => return,
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(identity)));
        if let Err(payload) = &outcome {
            tracing::error!(
                worker = identity,
                reason = panic_message(payload.as_ref()),
                "worker task panicked"
            );
        }

        let mut state = shared.state.lock();
        if outcome.is_err() {
            state.panicked += 1;
        }
        state.outstanding -= 1;
        if state.outstanding == 0 {
            shared.idle.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn rejects_zero_workers() {
        assert!(WorkerPool::new("empty", 0).is_err());
    }

    #[test]
    fn join_waits_for_every_task() {
        let pool = WorkerPool::new("join", 3).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let done = Arc::clone(&done);
            pool.run(move |_| {
                std::thread::sleep(Duration::from_micros(200));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(done.load(Ordering::SeqCst), 50);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn identities_are_stable_and_in_range() {
        let pool = WorkerPool::new("ids", 4).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..100 {
            let seen = Arc::clone(&seen);
            pool.run(move |id| {
                let name = std::thread::current().name().map(str::to_owned);
                seen.lock().push((id, name));
            });
        }
        pool.join();
        for (id, name) in seen.lock().iter() {
            assert!(*id < 4);
            assert_eq!(name.as_deref(), Some(format!("ids-{id}").as_str()));
        }
    }

    #[test]
    fn reusable_across_waves() {
        let pool = WorkerPool::new("waves", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for wave in 1..=3 {
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                pool.run(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            pool.join();
            assert_eq!(counter.load(Ordering::SeqCst), wave * 10);
        }
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new("panics", 1).unwrap();
        pool.run(|_| panic!("boom"));
        pool.join();
        assert_eq!(pool.panicked_tasks(), 1);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        pool.run(move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        pool.join();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broadcast_reaches_each_worker_once() {
        let pool = WorkerPool::new("bcast", 5).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        pool.broadcast(move |id| seen2.lock().push(id));

        let ids = seen.lock().clone();
        assert_eq!(ids.len(), 5);
        let unique: HashSet<usize> = ids.into_iter().collect();
        assert_eq!(unique, (0..5).collect());
    }

    #[test]
    fn drop_runs_queued_tasks() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new("drain", 2).unwrap();
            for _ in 0..20 {
                let done = Arc::clone(&done);
                pool.run(move |_| {
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }
}
