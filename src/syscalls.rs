// src/syscalls.rs
use crate::error::SatieResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ptr;

pub use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP};

// ---- Socket Operations ----

/// Create a non-blocking TCP listener with SO_REUSEADDR and (optionally)
/// SO_LINGER. The listener is bound to 0.0.0.0:`port`; a port of 0 lets the
/// kernel pick one (used by tests).
pub fn create_listen_socket(port: u16, linger: bool) -> SatieResult<c_int> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // SO_LINGER with a short timeout drains unsent data on close.
        let lg = libc::linger {
            l_onoff: if linger { 1 } else { 0 },
            l_linger: 1,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &lg as *const _ as *const c_void,
            mem::size_of_val(&lg) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(Ipv4Addr::UNSPECIFIED.octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// The port a bound socket actually listens on (relevant when bound to 0).
pub fn local_port(fd: c_int) -> SatieResult<u16> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        if libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(u16::from_be(sin.sin_port))
    }
}

/// Accept one pending connection. Returns `None` once the accept queue is
/// drained (`EAGAIN`/`EWOULDBLOCK`). The accepted fd is atomically
/// non-blocking via `accept4`.
pub fn accept_connection(listen_fd: c_int) -> SatieResult<Option<(c_int, SocketAddr)>> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut sin as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            let addr = SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            ));
            Ok(Some((fd, addr)))
        }
    }
}

pub fn set_nonblocking(fd: c_int) -> SatieResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll Operations ----

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> SatieResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register a file descriptor. The caller supplies the full interest
    /// mask; trigger mode (ET/LT) and one-shot are configuration, not policy
    /// of this wrapper.
    pub fn add(&self, fd: c_int, events: u32) -> SatieResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&self, fd: c_int, events: u32) -> SatieResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn delete(&self, fd: c_int) -> SatieResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: c_int, events: u32) -> SatieResult<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Wait for events. `timeout_ms < 0` blocks indefinitely. EINTR is
    /// reported as zero events so the caller's loop just re-enters.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> SatieResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Scatter/Gather I/O ----

/// Gather write from multiple regions with one syscall.
pub fn writev(fd: c_int, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iovs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let count = bufs.len().min(2);
    for i in 0..count {
        iovs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }
    unsafe {
        let res = libc::writev(fd, iovs.as_ptr(), count as c_int);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Best-effort blocking write of a short message (accept back-pressure path).
pub fn write_all(fd: c_int, buf: &[u8]) {
    let mut sent = 0;
    while sent < buf.len() {
        unsafe {
            let res = libc::write(
                fd,
                buf[sent..].as_ptr() as *const c_void,
                buf.len() - sent,
            );
            if res <= 0 {
                return;
            }
            sent += res as usize;
        }
    }
}

// ---- Close-Notification Pipe ----
//
// Workers and timer callbacks never close sockets themselves; they push the
// fd through this pipe and the reactor performs the close on its own thread.

/// Create a pipe with a non-blocking read end. Returns (read_fd, write_fd).
pub fn create_pipe() -> SatieResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err.into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Frame size for control messages. Writes up to PIPE_BUF are atomic, so
/// frames never interleave and the reader always sees whole multiples.
pub const CTRL_FRAME: usize = 16;

/// Send one control frame (blocking write).
pub fn send_frame(pipe_write_fd: c_int, frame: &[u8; CTRL_FRAME]) -> SatieResult<()> {
    unsafe {
        let n = libc::write(
            pipe_write_fd,
            frame.as_ptr() as *const c_void,
            CTRL_FRAME,
        );
        if n < 0 {
            Err(io::Error::last_os_error().into())
        } else {
            Ok(())
        }
    }
}

/// Receive one control frame (non-blocking).
pub fn recv_frame(pipe_read_fd: c_int) -> SatieResult<Option<[u8; CTRL_FRAME]>> {
    let mut buf = [0u8; CTRL_FRAME];
    unsafe {
        let n = libc::read(pipe_read_fd, buf.as_mut_ptr() as *mut c_void, CTRL_FRAME);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else if n as usize == CTRL_FRAME {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }
}
