// src/buffer.rs
use std::io;

use libc::c_void;

const INITIAL_SIZE: usize = 1024;
const STACK_SCRATCH: usize = 65536;

/// Growable byte window with a read cursor and a write cursor.
///
/// The readable region is `[read, write)`, the writable region is
/// `[write, capacity)`. Once everything readable has been retrieved both
/// cursors reset to 0 so the whole buffer is reusable without reallocation.
/// Each buffer is owned exclusively by one connection.
pub struct Buffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: vec![0; cap],
            read: 0,
            write: 0,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write - self.read
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// Consume `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        debug_assert!(len <= self.readable_bytes());
        self.read += len;
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    /// Consume readable bytes up to (excluding) offset `end` of the readable
    /// region.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    pub fn retrieve_all(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Copy out everything readable as a `String` (lossy) and reset.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Guarantee at least `len` writable bytes, growing or compacting.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Mark `len` bytes (written directly into the writable region) as used.
    pub fn has_written(&mut self, len: usize) {
        self.write += len;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.write..self.write + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    pub fn append_buffer(&mut self, other: &Buffer) {
        self.append(other.peek());
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.data.resize(self.write + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read..self.write, 0);
            self.read = 0;
            self.write = readable;
        }
    }

    /// Scatter read from `fd`: one `readv` against the writable tail and a
    /// 64 KiB stack scratch. Overflow past the tail is appended, growing the
    /// buffer, so a single call accepts any burst the kernel hands over
    /// without pre-growing for the worst case.
    pub fn read_from_fd(&mut self, fd: i32) -> io::Result<usize> {
        let mut scratch = [0u8; STACK_SCRATCH];
        let writable = self.writable_bytes();

        let iovs = [
            libc::iovec {
                iov_base: unsafe { self.data.as_mut_ptr().add(self.write) } as *mut c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut c_void,
                iov_len: STACK_SCRATCH,
            },
        ];

        let n = unsafe { libc::readv(fd, iovs.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write += n;
        } else {
            self.write = self.data.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd`, consuming whatever the kernel took.
    pub fn write_to_fd(&mut self, fd: i32) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.data[self.read..].as_ptr() as *const c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.retrieve(n as usize);
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
