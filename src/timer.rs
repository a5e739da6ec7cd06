// src/timer.rs
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type TimeoutAction = Box<dyn FnMut() + Send>;

struct TimerNode {
    fd: i32,
    expires: Instant,
    action: TimeoutAction,
}

/// Indexed binary min-heap of per-fd deadlines.
///
/// A parallel `fd -> heap index` map makes `adjust`/`do_work` O(log n); the
/// map is updated inside every swap so heap and index never disagree. Owned
/// and mutated exclusively by the reactor thread.
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<i32, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Register `fd` with a deadline `timeout` from now. An existing node for
    /// the same fd is re-deadlined and its action replaced.
    pub fn add(&mut self, fd: i32, timeout: Duration, action: TimeoutAction) {
        let expires = Instant::now() + timeout;
        match self.index.get(&fd).copied() {
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].action = action;
                self.resift(i);
            }
            None => {
                let i = self.heap.len();
                self.index.insert(fd, i);
                self.heap.push(TimerNode { fd, expires, action });
                self.sift_up(i);
            }
        }
    }

    /// Push an existing fd's deadline to `timeout` from now.
    pub fn adjust(&mut self, fd: i32, timeout: Duration) {
        if let Some(i) = self.index.get(&fd).copied() {
            self.heap[i].expires = Instant::now() + timeout;
            self.resift(i);
        }
    }

    /// Run the fd's expiry action immediately and drop the node.
    pub fn do_work(&mut self, fd: i32) {
        if let Some(i) = self.index.get(&fd).copied() {
            let mut node = self.remove_at(i);
            (node.action)();
        }
    }

    /// Drop the fd's node without running its action (connection closed).
    pub fn cancel(&mut self, fd: i32) {
        if let Some(i) = self.index.get(&fd).copied() {
            self.remove_at(i);
        }
    }

    /// Pop and run every node whose deadline has passed.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(top) = self.heap.first() {
            if top.expires > now {
                break;
            }
            let mut node = self.remove_at(0);
            (node.action)();
        }
    }

    /// Milliseconds until the earliest deadline (after firing anything
    /// already due), or -1 when the heap is empty. Used as the epoll wait
    /// timeout so idle eviction is timely without spurious wakeups.
    pub fn next_tick_ms(&mut self) -> i32 {
        self.tick();
        match self.heap.first() {
            Some(top) => {
                let now = Instant::now();
                if top.expires <= now {
                    0
                } else {
                    (top.expires - now).as_millis() as i32
                }
            }
            None => -1,
        }
    }

    fn remove_at(&mut self, i: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        self.swap_nodes(i, last);
        let node = match self.heap.pop() {
            Some(n) => n,
            None => unreachable!(),
        };
        self.index.remove(&node.fd);
        if i < self.heap.len() {
            self.resift(i);
        }
        node
    }

    fn resift(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns true if the node moved.
    fn sift_down(&mut self, mut i: usize) -> bool {
        let start = i;
        let len = self.heap.len();
        loop {
            let mut child = i * 2 + 1;
            if child >= len {
                break;
            }
            if child + 1 < len && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > start
    }

    /// The one place nodes trade positions; the index map moves with them.
    fn swap_nodes(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].fd, a);
        self.index.insert(self.heap[b].fd, b);
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}
