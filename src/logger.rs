// src/logger.rs
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use chrono::{Local, NaiveDate};
use log::{Level, LevelFilter};

use crate::error::SatieResult;

/// Bounded blocking FIFO with producer/consumer condition variables.
pub struct BlockQueue<T> {
    inner: Mutex<QueueInner<T>>,
    consumer: Condvar,
    producer: Condvar,
}

struct QueueInner<T> {
    deq: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> BlockQueue<T> {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            inner: Mutex::new(QueueInner {
                deq: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            consumer: Condvar::new(),
            producer: Condvar::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        let inner = lock(&self.inner);
        inner.deq.len() >= inner.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).deq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue, blocking while full. Hands the item back if the queue has
    /// been closed.
    pub fn push_back(&self, item: T) -> Result<(), T> {
        let mut inner = lock(&self.inner);
        while inner.deq.len() >= inner.capacity && !inner.closed {
            inner = wait(&self.producer, inner);
        }
        if inner.closed {
            return Err(item);
        }
        inner.deq.push_back(item);
        drop(inner);
        self.consumer.notify_one();
        Ok(())
    }

    /// Dequeue, blocking while empty. Returns `None` only once the queue is
    /// closed *and* drained, so no enqueued item is ever lost.
    pub fn pop(&self) -> Option<T> {
        let mut inner = lock(&self.inner);
        loop {
            if let Some(item) = inner.deq.pop_front() {
                drop(inner);
                self.producer.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = wait(&self.consumer, inner);
        }
    }

    /// Wake the consumer (used by flush).
    pub fn flush(&self) {
        self.consumer.notify_one();
    }

    pub fn close(&self) {
        lock(&self.inner).closed = true;
        self.consumer.notify_all();
        self.producer.notify_all();
    }
}

fn lock<'a, T>(m: &'a Mutex<QueueInner<T>>) -> MutexGuard<'a, QueueInner<T>> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn wait<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, QueueInner<T>>,
) -> MutexGuard<'a, QueueInner<T>> {
    match cv.wait(guard) {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

struct LogFile {
    out: Option<File>,
    line_count: u64,
    day: NaiveDate,
}

struct LogInner {
    dir: PathBuf,
    suffix: String,
    max_lines: u64,
    level: LevelFilter,
    file: Mutex<LogFile>,
    queue: Option<Arc<BlockQueue<String>>>,
}

/// Asynchronous rolling file logger, installed as the `log` crate backend.
///
/// Producers format the line and — under the file mutex — perform the roll
/// check, then enqueue for the consumer thread. When the queue is full (or
/// async is disabled) the producer writes synchronously instead of blocking
/// the worker. Files roll when the local date changes or the per-file line
/// cap is reached; the roll decision uses the local time of the writing call.
pub struct Logger {
    inner: Arc<LogInner>,
    consumer: Option<JoinHandle<()>>,
}

impl Logger {
    /// Open today's log file and start the consumer thread (when
    /// `queue_capacity > 0`). Does not install the `log` facade; call
    /// [`Logger::install`] for that.
    pub fn init(
        dir: &str,
        suffix: &str,
        level: LevelFilter,
        max_lines: u64,
        queue_capacity: usize,
    ) -> SatieResult<Self> {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir)?;

        let today = Local::now().date_naive();
        let inner = Arc::new(LogInner {
            dir,
            suffix: suffix.to_string(),
            max_lines,
            level,
            file: Mutex::new(LogFile {
                out: None,
                line_count: 0,
                day: today,
            }),
            queue: if queue_capacity > 0 {
                Some(Arc::new(BlockQueue::new(queue_capacity)))
            } else {
                None
            },
        });

        {
            let mut file = inner.lock_file();
            let out = inner.open_file(today, 0)?;
            file.out = Some(out);
        }

        let consumer = match &inner.queue {
            Some(queue) => {
                let queue = queue.clone();
                let writer = inner.clone();
                Some(
                    std::thread::Builder::new()
                        .name("satie-log".to_string())
                        .spawn(move || {
                            while let Some(line) = queue.pop() {
                                writer.write_direct(&line);
                            }
                        })
                        .map_err(crate::error::SatieError::Io)?,
                )
            }
            None => None,
        };

        Ok(Self { inner, consumer })
    }

    /// Install this logger as the global `log` backend. Errors if a logger
    /// is already installed (tests construct loggers without installing).
    pub fn install(&self) -> SatieResult<()> {
        log::set_max_level(self.inner.level);
        log::set_boxed_logger(Box::new(Facade {
            inner: self.inner.clone(),
        }))
        .map_err(|e| crate::error::SatieError::Fatal(e.to_string()))
    }

    pub fn flush(&self) {
        if let Some(q) = &self.inner.queue {
            q.flush();
        }
        self.inner.flush_file();
    }

    /// Close the queue, join the consumer after it drains, flush the file.
    pub fn shutdown(&mut self) {
        if let Some(q) = &self.inner.queue {
            q.close();
        }
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
        self.inner.flush_file();
    }

    #[cfg(test)]
    fn write_for_test(&self, level: Level, msg: &str) {
        self.inner.write_line(level, &format_args!("{}", msg));
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LogInner {
    fn lock_file(&self) -> MutexGuard<'_, LogFile> {
        self.file.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn file_name(&self, day: NaiveDate, roll: u64) -> PathBuf {
        let stamp = day.format("%Y_%m_%d");
        if roll == 0 {
            self.dir.join(format!("{}{}", stamp, self.suffix))
        } else {
            self.dir.join(format!("{}.{}{}", stamp, roll, self.suffix))
        }
    }

    fn open_file(&self, day: NaiveDate, roll: u64) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_name(day, roll))
    }

    fn write_line(&self, level: Level, args: &std::fmt::Arguments<'_>) {
        let now = Local::now();
        let line = format!(
            "{} {}{}\n",
            now.format("%Y-%m-%d %H:%M:%S%.6f"),
            level_title(level),
            args
        );

        let mut file = self.lock_file();
        self.roll_if_needed(&mut file, now.date_naive());
        file.line_count += 1;

        if let Some(queue) = &self.queue {
            if !queue.is_full() {
                match queue.push_back(line) {
                    Ok(()) => return,
                    Err(line) => {
                        // Queue closed mid-shutdown: fall through to sync.
                        write_out(&mut file, &line);
                        return;
                    }
                }
            }
            // Full queue: synchronous fallback rather than blocking a worker.
            write_out(&mut file, &line);
            return;
        }
        write_out(&mut file, &line);
    }

    /// Direct write used by the consumer thread.
    fn write_direct(&self, line: &str) {
        let mut file = self.lock_file();
        write_out(&mut file, line);
    }

    fn roll_if_needed(&self, file: &mut LogFile, today: NaiveDate) {
        if file.day != today {
            file.day = today;
            file.line_count = 0;
            match self.open_file(today, 0) {
                Ok(out) => file.out = Some(out),
                Err(e) => eprintln!("log roll failed: {}", e),
            }
        } else if self.max_lines > 0
            && file.line_count > 0
            && file.line_count % self.max_lines == 0
        {
            let roll = file.line_count / self.max_lines;
            match self.open_file(today, roll) {
                Ok(out) => file.out = Some(out),
                Err(e) => eprintln!("log roll failed: {}", e),
            }
        }
    }

    fn flush_file(&self) {
        let mut file = self.lock_file();
        if let Some(out) = file.out.as_mut() {
            let _ = out.flush();
        }
    }
}

fn write_out(file: &mut LogFile, line: &str) {
    if let Some(out) = file.out.as_mut() {
        let _ = out.write_all(line.as_bytes());
    }
}

fn level_title(level: Level) -> &'static str {
    match level {
        Level::Error => "[error]: ",
        Level::Warn => "[warn] : ",
        Level::Info => "[info] : ",
        Level::Debug | Level::Trace => "[debug]: ",
    }
}

/// Map the numeric config level (0..3) onto the facade's filter.
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Debug,
        1 => LevelFilter::Info,
        2 => LevelFilter::Warn,
        _ => LevelFilter::Error,
    }
}

struct Facade {
    inner: Arc<LogInner>,
}

impl log::Log for Facade {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.inner.level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.inner.write_line(record.level(), record.args());
        }
    }

    fn flush(&self) {
        if let Some(q) = &self.inner.queue {
            q.flush();
        }
        self.inner.flush_file();
    }
}
