// src/server.rs
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::Config;
use crate::conn::Connection;
use crate::error::{SatieError, SatieResult};
use crate::pool::ThreadPool;
use crate::sql::UserStore;
use crate::syscalls::{
    self, Epoll, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP,
};
use crate::timer::TimerHeap;

/// Connection table capacity; accepts beyond this are rejected with a
/// 503-style plain-text response.
pub const MAX_FD: usize = 65536;

const BUSY_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\nContent-Length: 12\r\n\r\nServer busy!";

const OP_CLOSE: u32 = 0;
const OP_ARM_READ: u32 = 1;
const OP_ARM_WRITE: u32 = 2;

/// Stable per-connection handle shared with workers. The generation guards
/// against fd reuse: a control message for an old incarnation of the fd is
/// ignored by the reactor.
pub struct ConnHandle {
    fd: i32,
    gen: u64,
    conn: Mutex<Connection>,
}

impl ConnHandle {
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Write end of the reactor's control pipe. Workers and timer callbacks
/// request closure and interest re-arming through it; the reactor is the
/// only thread that touches the epoll set and the connection table.
#[derive(Clone, Copy)]
struct CtrlSender {
    fd: i32,
}

impl CtrlSender {
    fn send(&self, op: u32, fd: i32, gen: u64) {
        let mut frame = [0u8; syscalls::CTRL_FRAME];
        frame[0..4].copy_from_slice(&op.to_ne_bytes());
        frame[4..8].copy_from_slice(&fd.to_ne_bytes());
        frame[8..16].copy_from_slice(&gen.to_ne_bytes());
        if let Err(e) = syscalls::send_frame(self.fd, &frame) {
            log::error!("control pipe write failed: {}", e);
        }
    }

    fn close(&self, fd: i32, gen: u64) {
        self.send(OP_CLOSE, fd, gen);
    }

    fn arm_read(&self, fd: i32, gen: u64) {
        self.send(OP_ARM_READ, fd, gen);
    }

    fn arm_write(&self, fd: i32, gen: u64) {
        self.send(OP_ARM_WRITE, fd, gen);
    }
}

struct CtrlMsg {
    op: u32,
    fd: i32,
    gen: u64,
}

fn decode_frame(frame: [u8; syscalls::CTRL_FRAME]) -> CtrlMsg {
    let mut op = [0u8; 4];
    let mut fd = [0u8; 4];
    let mut gen = [0u8; 8];
    op.copy_from_slice(&frame[0..4]);
    fd.copy_from_slice(&frame[4..8]);
    gen.copy_from_slice(&frame[8..16]);
    CtrlMsg {
        op: u32::from_ne_bytes(op),
        fd: i32::from_ne_bytes(fd),
        gen: u64::from_ne_bytes(gen),
    }
}

/// The reactor: owns the listener, the epoll set, the connection table, and
/// the timer heap. One thread runs the event loop; parsing and response
/// building happen on the worker pool, with one-shot interest guaranteeing a
/// single worker per connection at any instant.
pub struct Server {
    listen_fd: i32,
    port: u16,
    timeout: Option<Duration>,
    listen_event: u32,
    conn_event: u32,
    conn_et: bool,
    src_dir: Arc<str>,
    epoll: Epoll,
    conns: HashMap<i32, Arc<ConnHandle>>,
    timer: TimerHeap,
    pool: ThreadPool,
    store: Arc<dyn UserStore>,
    ctrl_rx: i32,
    ctrl: CtrlSender,
    shutdown: Arc<AtomicBool>,
    next_gen: u64,
}

impl Server {
    pub fn new(cfg: &Config, store: Arc<dyn UserStore>) -> SatieResult<Self> {
        let (listen_event, conn_event) = event_masks(cfg.trigger_mode);

        let listen_fd = syscalls::create_listen_socket(cfg.listen_port, cfg.so_linger)?;
        let port = syscalls::local_port(listen_fd)?;

        let epoll = Epoll::new()?;
        epoll.add(listen_fd, EPOLLIN as u32 | listen_event)?;

        let (ctrl_rx, ctrl_tx) = syscalls::create_pipe()?;
        epoll.add(ctrl_rx, EPOLLIN as u32)?;

        Ok(Self {
            listen_fd,
            port,
            timeout: if cfg.idle_timeout_ms > 0 {
                Some(Duration::from_millis(cfg.idle_timeout_ms))
            } else {
                None
            },
            listen_event,
            conn_event,
            conn_et: cfg.conn_edge_triggered(),
            src_dir: Arc::from(cfg.src_dir.as_str()),
            epoll,
            conns: HashMap::new(),
            timer: TimerHeap::new(),
            pool: ThreadPool::new(cfg.effective_workers()),
            store,
            ctrl_rx,
            ctrl: CtrlSender { fd: ctrl_tx },
            shutdown: Arc::new(AtomicBool::new(false)),
            next_gen: 0,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Flag observed by the event loop; flip it (and wake the loop with a
    /// connection or signal) to stop the server.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn run(&mut self) -> SatieResult<()> {
        log::info!(
            "satie listening on port {} ({} workers, listener {}, connections {})",
            self.port,
            self.pool.thread_count(),
            if self.listen_event & syscalls::EPOLLET as u32 != 0 { "ET" } else { "LT" },
            if self.conn_et { "ET" } else { "LT" },
        );
        let result = self.event_loop();
        self.graceful_shutdown();
        result
    }

    fn event_loop(&mut self) -> SatieResult<()> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 1024];

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout_ms = match self.timeout {
                Some(_) => self.timer.next_tick_ms(),
                None => -1,
            };
            // Epoll failures other than EINTR are fatal for the loop.
            let n = self.epoll.wait(&mut events, timeout_ms)?;

            for event in &events[..n] {
                let fd = event.u64 as i32;
                let mask = event.events;

                if fd == self.listen_fd {
                    self.deal_listen();
                } else if fd == self.ctrl_rx {
                    self.drain_ctrl();
                } else if mask & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
                    self.close(fd);
                } else if mask & EPOLLIN as u32 != 0 {
                    self.dispatch(fd, OP_ARM_READ);
                } else if mask & EPOLLOUT as u32 != 0 {
                    self.dispatch(fd, OP_ARM_WRITE);
                } else {
                    log::error!("unexpected event mask {:#x} on fd {}", mask, fd);
                }
            }
        }
        Ok(())
    }

    /// Accept until the queue is drained (always drained under ET; one per
    /// event under LT, as the original's trigger-mode contract).
    fn deal_listen(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, addr))) => self.add_client(fd, addr),
                Ok(None) => break,
                Err(SatieError::Io(e))
                    if e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    break;
                }
            }
            if self.listen_event & syscalls::EPOLLET as u32 == 0 {
                break;
            }
        }
    }

    fn add_client(&mut self, fd: i32, addr: SocketAddr) {
        if self.conns.len() >= MAX_FD {
            syscalls::write_all(fd, BUSY_RESPONSE);
            syscalls::close_fd(fd);
            log::warn!("connection table full, rejected {}", addr);
            return;
        }

        let gen = self.next_gen;
        self.next_gen += 1;

        let handle = Arc::new(ConnHandle {
            fd,
            gen,
            conn: Mutex::new(Connection::new(fd, addr, self.conn_et, self.src_dir.clone())),
        });
        self.conns.insert(fd, handle);

        if let Some(timeout) = self.timeout {
            let ctrl = self.ctrl;
            self.timer
                .add(fd, timeout, Box::new(move || ctrl.close(fd, gen)));
        }

        if let Err(e) = self.epoll.add(fd, EPOLLIN as u32 | self.conn_event) {
            log::error!("epoll add for {} failed: {}", addr, e);
            self.conns.remove(&fd);
            self.timer.cancel(fd);
            syscalls::close_fd(fd);
            return;
        }

        log::info!("Client[{}]({}) in, {} online", fd, addr, self.conns.len());
    }

    /// Hand the ready connection to a worker; the timer moves with every
    /// piece of activity.
    fn dispatch(&mut self, fd: i32, op: u32) {
        let handle = match self.conns.get(&fd) {
            Some(h) => h.clone(),
            None => return,
        };
        self.bump_timer(fd);

        let store = self.store.clone();
        let ctrl = self.ctrl;
        self.pool.submit(move || {
            if op == OP_ARM_READ {
                on_read(&handle, store.as_ref(), ctrl);
            } else {
                on_write(&handle, store.as_ref(), ctrl);
            }
        });
    }

    fn bump_timer(&mut self, fd: i32) {
        if let Some(timeout) = self.timeout {
            self.timer.adjust(fd, timeout);
        }
    }

    fn drain_ctrl(&mut self) {
        loop {
            match syscalls::recv_frame(self.ctrl_rx) {
                Ok(Some(frame)) => {
                    let msg = decode_frame(frame);
                    match msg.op {
                        OP_CLOSE => self.close_gen(msg.fd, msg.gen),
                        OP_ARM_READ => self.rearm(msg.fd, msg.gen, EPOLLIN as u32),
                        OP_ARM_WRITE => self.rearm(msg.fd, msg.gen, EPOLLOUT as u32),
                        other => log::error!("unknown control op {}", other),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("control pipe read failed: {}", e);
                    break;
                }
            }
        }
    }

    fn rearm(&mut self, fd: i32, gen: u64, interest: u32) {
        match self.conns.get(&fd) {
            Some(handle) if handle.gen == gen => {
                self.bump_timer(fd);
                if let Err(e) = self.epoll.modify(fd, interest | self.conn_event) {
                    log::error!("epoll rearm for fd {} failed: {}", fd, e);
                    self.close(fd);
                }
            }
            _ => {} // stale message for a previous incarnation of the fd
        }
    }

    fn close_gen(&mut self, fd: i32, gen: u64) {
        match self.conns.get(&fd) {
            Some(handle) if handle.gen == gen => self.close(fd),
            _ => {}
        }
    }

    /// The single place connections die: drop from the table, cancel the
    /// timer, deregister, close.
    fn close(&mut self, fd: i32) {
        if let Some(handle) = self.conns.remove(&fd) {
            self.timer.cancel(fd);
            self.epoll.delete(fd).ok();
            {
                let mut conn = handle.lock();
                conn.set_closed();
                log::info!("Client[{}]({}) quit, {} online", fd, conn.addr(), self.conns.len());
            }
            syscalls::close_fd(fd);
        }
    }

    fn graceful_shutdown(&mut self) {
        log::info!("shutting down: {} connections open", self.conns.len());
        self.epoll.delete(self.listen_fd).ok();
        syscalls::close_fd(self.listen_fd);

        // Drain queued work, then join every worker.
        self.pool.shutdown();
        self.drain_ctrl();

        let fds: Vec<i32> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close(fd);
        }

        self.epoll.delete(self.ctrl_rx).ok();
        syscalls::close_fd(self.ctrl_rx);
        syscalls::close_fd(self.ctrl.fd);
        log::logger().flush();
    }
}

/// Trigger-mode decode (0..3): bit 0 = connection ET, bit 1 = listener ET.
fn event_masks(trigger_mode: u8) -> (u32, u32) {
    let et = syscalls::EPOLLET as u32;
    let mut listen_event = EPOLLRDHUP as u32;
    let mut conn_event = (EPOLLONESHOT | EPOLLRDHUP) as u32;
    if trigger_mode & 0b01 != 0 {
        conn_event |= et;
    }
    if trigger_mode & 0b10 != 0 {
        listen_event |= et;
    }
    (listen_event, conn_event)
}

fn on_read(handle: &ConnHandle, store: &dyn UserStore, ctrl: CtrlSender) {
    let mut conn = handle.lock();
    match conn.read() {
        Ok(_) => {
            if conn.peer_closed() {
                ctrl.close(handle.fd, handle.gen);
                return;
            }
            if conn.process(store) {
                ctrl.arm_write(handle.fd, handle.gen);
            } else {
                ctrl.arm_read(handle.fd, handle.gen);
            }
        }
        Err(e) => {
            log::debug!("read on fd {} failed: {}", handle.fd, e);
            ctrl.close(handle.fd, handle.gen);
        }
    }
}

fn on_write(handle: &ConnHandle, store: &dyn UserStore, ctrl: CtrlSender) {
    let mut conn = handle.lock();
    match conn.write() {
        Ok(()) => {
            if conn.to_write_bytes() == 0 {
                if conn.is_keep_alive() {
                    // Response fully sent: restore pristine state and let any
                    // pipelined bytes drive the next request immediately.
                    conn.reset_for_next();
                    if conn.process(store) {
                        ctrl.arm_write(handle.fd, handle.gen);
                    } else {
                        ctrl.arm_read(handle.fd, handle.gen);
                    }
                } else {
                    ctrl.close(handle.fd, handle.gen);
                }
            } else {
                // Short write: wait for the socket to drain.
                ctrl.arm_write(handle.fd, handle.gen);
            }
        }
        Err(e) => {
            log::debug!("write on fd {} failed: {}", handle.fd, e);
            ctrl.close(handle.fd, handle.gen);
        }
    }
}
