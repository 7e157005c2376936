//! Multi-queue task scheduler: `N` worker threads draining a map of named,
//! capacity-bounded sub-queues in round-robin order.
//!
//! Grounded in `threadpool.c`'s single-queue pool (one mutex, two condvars,
//! a FIFO of tasks, `threadpool_worker`'s wait/pop/run loop), generalised to
//! many named queues so the engine can give each client descriptor its own
//! `cap = 1` queue and get per-connection callback serialisation for free.
//! `request_queue.c`'s standalone FIFO abstraction is the other half of the
//! grounding: a sub-queue here plays the same role one of its queues did.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    cap: u32,
    in_flight: u32,
}

impl Queue {
    fn new(cap: u32) -> Queue {
        Queue {
            tasks: VecDeque::new(),
            cap,
            in_flight: 0,
        }
    }

    fn runnable(&self) -> bool {
        !self.tasks.is_empty() && (self.cap == 0 || self.in_flight < self.cap)
    }

    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.in_flight == 0
    }
}

struct State {
    queues: HashMap<u32, Queue>,
    /// Queue ids in the order queues were created, scanned round-robin from
    /// `rr_cursor`. Kept separate from the `HashMap` because iteration
    /// order there is unspecified.
    order: Vec<u32>,
    rr_cursor: usize,
    accepting: bool,
    shutting_down: bool,
}

impl State {
    fn next_runnable(&mut self) -> Option<(u32, Task)> {
        let n = self.order.len();
        for i in 0..n {
            let idx = (self.rr_cursor + i) % n;
            let qid = self.order[idx];
            let queue = self.queues.get_mut(&qid).expect("order/queues out of sync");
            if queue.runnable() {
                let task = queue.tasks.pop_front().expect("runnable implies non-empty");
                queue.in_flight += 1;
                self.rr_cursor = (idx + 1) % n.max(1);
                return Some((qid, task));
            }
        }
        None
    }

    fn all_idle(&self) -> bool {
        self.queues.values().all(Queue::is_idle)
    }
}

/// Drains the named sub-queues across a fixed pool of worker threads.
pub struct Scheduler {
    state: Arc<Mutex<State>>,
    work_available: Arc<Condvar>,
    idle: Arc<Condvar>,
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Spawns `worker_count` threads and registers the default queue 0.
    /// Surfaces [`Error::WorkerSpawn`] rather than panicking if the OS
    /// refuses to spawn one of them; any workers already spawned are told to
    /// exit and joined before the error is returned, so none are left
    /// running.
    pub fn start(worker_count: usize) -> Result<Scheduler> {
        let state = Arc::new(Mutex::new(State {
            queues: HashMap::from([(0, Queue::new(0))]),
            order: vec![0],
            rr_cursor: 0,
            accepting: true,
            shutting_down: false,
        }));
        let work_available = Arc::new(Condvar::new());
        let idle = Arc::new(Condvar::new());

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for index in 0..worker_count.max(1) {
            let spawn_state = Arc::clone(&state);
            let spawn_work_available = Arc::clone(&work_available);
            let spawn_idle = Arc::clone(&idle);
            let spawned = std::thread::Builder::new()
                .name(format!("ringserver-sched-{index}"))
                .spawn(move || worker_loop(spawn_state, spawn_work_available, spawn_idle));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
                    guard.shutting_down = true;
                    drop(guard);
                    work_available.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(Error::WorkerSpawn(e.to_string()));
                }
            }
        }

        Ok(Scheduler {
            state,
            work_available,
            idle,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Registers a new sub-queue with an in-flight cap (`0` = unbounded).
    pub fn new_queue(&self, qid: u32, cap: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.queues.contains_key(&qid) {
            return Err(Error::QueueExists(qid));
        }
        state.queues.insert(qid, Queue::new(cap));
        state.order.push(qid);
        Ok(())
    }

    /// Removes a sub-queue. Queue 0 is the engine-internal default and
    /// cannot be removed.
    pub fn remove_queue(&self, qid: u32) -> Result<()> {
        if qid == 0 {
            return Err(Error::QueueNotFound(qid));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.queues.remove(&qid).is_none() {
            return Err(Error::QueueNotFound(qid));
        }
        state.order.retain(|&id| id != qid);
        state.rr_cursor %= state.order.len().max(1);
        Ok(())
    }

    /// Enqueues `task` on `qid`. Never blocks.
    pub fn add(&self, qid: u32, task: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.accepting {
            return Err(Error::PoolStopped);
        }
        let queue = state.queues.get_mut(&qid).ok_or(Error::QueueNotFound(qid))?;
        queue.tasks.push_back(Box::new(task));
        drop(state);
        self.work_available.notify_all();
        Ok(())
    }

    /// Blocks until every sub-queue has no queued or in-flight tasks.
    pub fn wait_empty(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .idle
            .wait_while(state, |s| !s.all_idle())
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Refuses new work, drains what's already queued, then joins every
    /// worker thread. Idempotent: a second call observes the pool already
    /// stopped and returns immediately.
    pub fn stop(&self) {
        let mut handles = match self.workers.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(handles) => handles,
            None => return,
        };

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.accepting = false;
        }
        self.wait_empty();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutting_down = true;
        }
        self.work_available.notify_all();

        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(state: Arc<Mutex<State>>, work_available: Arc<Condvar>, idle: Arc<Condvar>) {
    loop {
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        let picked = loop {
            if let Some(picked) = guard.next_runnable() {
                break Some(picked);
            }
            if guard.shutting_down {
                break None;
            }
            guard = work_available
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        };
        drop(guard);

        let (qid, task) = match picked {
            Some(picked) => picked,
            None => return,
        };

        task();

        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(queue) = guard.queues.get_mut(&qid) {
            queue.in_flight = queue.in_flight.saturating_sub(1);
        }
        if guard.all_idle() {
            idle.notify_all();
        }
        drop(guard);
        work_available.notify_all();
    }
}
