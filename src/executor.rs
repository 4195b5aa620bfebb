//! Auto-scaling worker pool.
//!
//! Workers scale between `low_watermark` and `high_watermark`. The pool
//! grows at submission time, when a task is enqueued and no idle worker
//! was observed waiting; it shrinks when a worker's idle wait times out
//! while the pool is above the floor. `stop` drains the queue before the
//! pool reaches `Stopped`.
//!
//! All pool state sits behind one mutex with two condition variables:
//! one signalled when the queue becomes non-empty (and on stop), one
//! signalled when the last worker exits during shutdown.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Accepting and executing tasks.
    Run,
    /// No new tasks; queued tasks still execute.
    Stopping,
    /// No workers, empty queue.
    Stopped,
}

struct Pool {
    state: State,
    tasks: VecDeque<Task>,
    cur_workers: usize,
    /// Workers currently parked in the timed wait.
    waiters: usize,
    next_worker_id: usize,
}

struct Shared {
    pool: Mutex<Pool>,
    not_empty: Condvar,
    stop_done: Condvar,
    low_watermark: usize,
    high_watermark: usize,
    max_queue_size: usize,
    idle_time: Duration,
}

/// Thread pool with watermark-bounded worker scaling.
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    pub fn new(
        low_watermark: usize,
        high_watermark: usize,
        max_queue_size: usize,
        idle_time: Duration,
    ) -> Self {
        debug_assert!(low_watermark >= 1);
        debug_assert!(low_watermark <= high_watermark);
        Executor {
            shared: Arc::new(Shared {
                pool: Mutex::new(Pool {
                    state: State::Stopped,
                    tasks: VecDeque::new(),
                    cur_workers: 0,
                    waiters: 0,
                    next_worker_id: 0,
                }),
                not_empty: Condvar::new(),
                stop_done: Condvar::new(),
                low_watermark,
                high_watermark,
                max_queue_size,
                idle_time,
            }),
        }
    }

    /// Bring a stopped pool up with `low_watermark` workers.
    pub fn start(&self) {
        let mut pool = self.shared.pool.lock().unwrap();
        if pool.state != State::Stopped {
            return;
        }
        pool.state = State::Run;
        for _ in 0..self.shared.low_watermark {
            spawn_worker(&self.shared, &mut pool);
        }
        debug!(workers = pool.cur_workers, "executor started");
    }

    /// Schedule a task. Returns false when the pool is not running or
    /// the queue is at capacity; the task is dropped in that case.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pool = self.shared.pool.lock().unwrap();
        if pool.state != State::Run || pool.tasks.len() >= self.shared.max_queue_size {
            return false;
        }
        pool.tasks.push_back(Box::new(task));
        if pool.waiters > 0 {
            self.shared.not_empty.notify_one();
        } else if pool.cur_workers < self.shared.high_watermark {
            spawn_worker(&self.shared, &mut pool);
        }
        true
    }

    /// Stop accepting tasks; already queued tasks still run. With
    /// `await_done`, blocks until the last worker has exited.
    /// Idempotent on a stopped pool.
    pub fn stop(&self, await_done: bool) {
        let mut pool = self.shared.pool.lock().unwrap();
        if pool.state == State::Run {
            pool.state = State::Stopping;
            if pool.cur_workers == 0 {
                // No worker left to observe the transition.
                pool.tasks.clear();
                pool.state = State::Stopped;
                self.shared.stop_done.notify_all();
            } else {
                self.shared.not_empty.notify_all();
            }
        }
        if await_done {
            while pool.state != State::Stopped {
                pool = self.shared.stop_done.wait(pool).unwrap();
            }
        }
    }

    /// Occupancy of the worker ceiling, for health signalling.
    pub fn size_ratio(&self) -> f64 {
        let pool = self.shared.pool.lock().unwrap();
        pool.cur_workers as f64 / self.shared.high_watermark as f64
    }

    #[cfg(test)]
    fn current_workers(&self) -> usize {
        self.shared.pool.lock().unwrap().cur_workers
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop(false);
    }
}

fn spawn_worker(shared: &Arc<Shared>, pool: &mut Pool) {
    let id = pool.next_worker_id;
    pool.next_worker_id += 1;
    let shared = Arc::clone(shared);
    let builder = thread::Builder::new().name(format!("pool-worker-{id}"));
    match builder.spawn(move || worker_loop(&shared)) {
        Ok(_) => pool.cur_workers += 1,
        Err(e) => error!(error = %e, "failed to spawn pool worker"),
    }
}

fn worker_loop(shared: &Shared) {
    let mut pool = shared.pool.lock().unwrap();
    loop {
        if let Some(task) = pool.tasks.pop_front() {
            drop(pool);
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                warn!("pool task panicked");
            }
            pool = shared.pool.lock().unwrap();
            continue;
        }
        if pool.state == State::Stopping {
            break;
        }
        pool.waiters += 1;
        let (guard, timeout) = shared
            .not_empty
            .wait_timeout(pool, shared.idle_time)
            .unwrap();
        pool = guard;
        pool.waiters -= 1;
        if timeout.timed_out()
            && pool.tasks.is_empty()
            && pool.state == State::Run
            && pool.cur_workers > shared.low_watermark
        {
            // Idle trim.
            pool.cur_workers -= 1;
            debug!(remaining = pool.cur_workers, "idle worker exiting");
            return;
        }
    }
    // Stopping with an empty queue: this worker is done.
    pool.cur_workers -= 1;
    if pool.cur_workers == 0 {
        pool.state = State::Stopped;
        shared.stop_done.notify_all();
    }
}
