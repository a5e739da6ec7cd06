// src/pool.rs
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<Inner>,
    cond: Condvar,
}

struct Inner {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// Fixed-size worker pool over a shared FIFO.
///
/// Submission never blocks (the queue is bounded by memory only); idle
/// workers sleep on a condition variable. Shutdown flips the closed flag and
/// broadcasts; workers drain the remaining queue before exiting.
pub struct ThreadPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Inner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("satie-worker-{}", i))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { shared, handles }
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = lock(&self.shared.queue);
            if inner.closed {
                log::debug!("task submitted after pool shutdown, dropped");
                return;
            }
            inner.tasks.push_back(Box::new(task));
        }
        self.shared.cond.notify_one();
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Close the queue and join every worker after it drains.
    pub fn shutdown(&mut self) {
        {
            let mut inner = lock(&self.shared.queue);
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.shared.cond.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut inner = lock(&shared.queue);
            loop {
                if let Some(task) = inner.tasks.pop_front() {
                    break Some(task);
                }
                if inner.closed {
                    break None;
                }
                inner = match shared.cond.wait(inner) {
                    Ok(g) => g,
                    Err(p) => p.into_inner(),
                };
            }
        };
        match task {
            Some(task) => {
                // A panicking task must not take the worker thread with it.
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    log::error!("worker task panicked");
                }
            }
            None => return,
        }
    }
}

fn lock<'a>(m: &'a Mutex<Inner>) -> std::sync::MutexGuard<'a, Inner> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}
