// src/response.rs
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;

use memmap2::Mmap;

use crate::buffer::Buffer;

const CODE_STATUS: &[(i32, &str)] = &[
    (200, "OK"),
    (400, "Bad Request"),
    (403, "Forbidden"),
    (404, "Not Found"),
    (500, "Internal Server Error"),
];

const CODE_PATH: &[(i32, &str)] = &[
    (400, "/400.html"),
    (403, "/403.html"),
    (404, "/404.html"),
    (500, "/500.html"),
];

const SUFFIX_TYPE: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".word", "application/msword"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "video/mpeg"),
    (".mpg", "video/mpeg"),
    (".avi", "video/x-msvideo"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".css", "text/css"),
    (".js", "text/javascript"),
];

/// Builds one HTTP/1.1 response: status line and headers into the write
/// buffer, body as a read-only private file mapping served through the second
/// iovec. Dropping (or re-initialising) the response releases the mapping.
pub struct Response {
    code: i32,
    path: String,
    src_dir: Arc<str>,
    keep_alive: bool,
    file: Option<Mmap>,
    file_len: u64,
}

impl Response {
    pub fn new() -> Self {
        Self {
            code: -1,
            path: String::new(),
            src_dir: Arc::from(""),
            keep_alive: false,
            file: None,
            file_len: 0,
        }
    }

    /// Prepare for a fresh response; `code` of -1 means "decide from stat".
    pub fn init(&mut self, src_dir: Arc<str>, path: &str, keep_alive: bool, code: i32) {
        self.unmap();
        self.code = code;
        self.path = path.to_string();
        self.src_dir = src_dir;
        self.keep_alive = keep_alive;
        self.file_len = 0;
    }

    /// Emit status line + headers (and, for error fallbacks, an inline body)
    /// into `buf`, and map the file body.
    pub fn make(&mut self, buf: &mut Buffer) {
        // The stat decision overrides whatever code came in: a missing or
        // directory target reads as 404, an unreadable one as 403.
        let full = self.full_path();
        match std::fs::metadata(&full) {
            Err(_) => self.code = 404,
            Ok(meta) if meta.is_dir() => self.code = 404,
            // World-readable bit, as the source checks S_IROTH.
            Ok(meta) if meta.mode() & 0o004 == 0 => self.code = 403,
            Ok(meta) => {
                if self.code == -1 {
                    self.code = 200;
                }
                self.file_len = meta.size();
            }
        }
        self.error_html();
        self.add_state_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    /// Swap in the canonical error page for {400,403,404,500}. A missing
    /// page degrades the code to 404; if that page is absent too, the inline
    /// body takes over at content time.
    fn error_html(&mut self) {
        if let Some(err_path) = lookup(CODE_PATH, self.code) {
            self.path = err_path.to_string();
            let full = self.full_path();
            match std::fs::metadata(&full) {
                Ok(meta) => self.file_len = meta.size(),
                Err(_) => self.code = 404,
            }
        }
    }

    fn full_path(&self) -> String {
        format!("{}{}", self.src_dir, self.path)
    }

    fn add_state_line(&mut self, buf: &mut Buffer) {
        let status = match lookup(CODE_STATUS, self.code) {
            Some(s) => s,
            None => {
                self.code = 400;
                "Bad Request"
            }
        };
        buf.append_str(&format!("HTTP/1.1 {} {}\r\n", self.code, status));
    }

    fn add_headers(&mut self, buf: &mut Buffer) {
        buf.append_str("Connection: ");
        if self.keep_alive {
            buf.append_str("keep-alive\r\n");
            buf.append_str("Keep-Alive: max=6, timeout=120\r\n");
        } else {
            buf.append_str("close\r\n");
        }
        buf.append_str(&format!("Content-Type: {}\r\n", self.file_type()));
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let mapped = File::open(self.full_path())
            .and_then(|f| unsafe { Mmap::map(&f) });
        match mapped {
            Ok(mm) => {
                self.file_len = mm.len() as u64;
                self.file = Some(mm);
                buf.append_str(&format!("Content-Length: {}\r\n\r\n", self.file_len));
            }
            Err(e) => {
                log::warn!("map {} failed: {}", self.full_path(), e);
                self.error_content(buf, "File Not Found!");
            }
        }
    }

    /// Inline HTML error body used when no error page file is servable.
    pub fn error_content(&mut self, buf: &mut Buffer, message: &str) {
        let status = lookup(CODE_STATUS, self.code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>satie</em></body></html>",
            self.code, status, message
        );
        buf.append_str(&format!("Content-Length: {}\r\n", body.len()));
        buf.append_str("Content-Type: text/html\r\n");
        buf.append_str("\r\n");
        buf.append_str(&body);
    }

    fn file_type(&self) -> &'static str {
        if let Some(idx) = self.path.rfind('.') {
            let suffix = &self.path[idx..];
            if let Some(t) = SUFFIX_TYPE.iter().find(|(s, _)| *s == suffix) {
                return t.1;
            }
        }
        "text/plain"
    }

    /// The mapped body, if a file is being served.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_deref()
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn unmap(&mut self) {
        self.file = None;
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup<V: Copy>(table: &[(i32, V)], code: i32) -> Option<V> {
    table.iter().find(|(c, _)| *c == code).map(|(_, v)| *v)
}
