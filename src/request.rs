// src/request.rs
use std::collections::HashMap;

use crate::buffer::Buffer;

/// Last path segments that map to an `.html` page.
const DEFAULT_HTML: &[&str] = &[
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
    "/favicon.ico",
];

/// Form endpoints routed to the user store: (path, is_login).
pub const LOGIN_PAGE: &str = "/login.html";
pub const REGISTER_PAGE: &str = "/register.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// Outcome of one parser step over the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Not enough buffered bytes for the next line/body; nothing consumed.
    NeedMore,
    /// A complete request has been parsed; fields are valid.
    Done,
    /// Malformed request line, unsupported method, or malformed header.
    Error,
}

/// Incrementally parsed HTTP request.
///
/// The parser is a resumable state machine: it can be fed a buffer that grows
/// between calls, consuming full CRLF-framed lines (and exactly
/// `Content-Length` body bytes) as they become available. Fields other than
/// `state` are only meaningful once the state reaches `Finish`.
pub struct Request {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
    body: String,
    content_length: usize,
}

impl Request {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            form: HashMap::new(),
            body: String::new(),
            content_length: 0,
        }
    }

    /// Reset to the pristine pre-request state (keep-alive reuse).
    pub fn init(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.form.clear();
        self.body.clear();
        self.content_length = 0;
    }

    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    /// Advance the state machine as far as the buffered bytes allow.
    pub fn parse(&mut self, buf: &mut Buffer) -> ParseStatus {
        loop {
            match self.state {
                ParseState::RequestLine | ParseState::Headers => {
                    let line = match find_crlf(buf.peek()) {
                        Some(end) => {
                            let line =
                                String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
                            buf.retrieve_until(end + 2);
                            line
                        }
                        None => return ParseStatus::NeedMore,
                    };
                    if self.state == ParseState::RequestLine {
                        if !self.parse_request_line(&line) {
                            return ParseStatus::Error;
                        }
                        self.state = ParseState::Headers;
                    } else if line.is_empty() {
                        // Best-effort numeric parse, as the source's atoi
                        // semantics: garbage reads as zero.
                        let content_length = self
                            .header_value("Content-Length")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0));
                        match content_length {
                            Some(n) if n > 0 => {
                                self.content_length = n;
                                self.state = ParseState::Body;
                            }
                            _ => self.state = ParseState::Finish,
                        }
                    } else if !self.parse_header(&line) {
                        return ParseStatus::Error;
                    }
                }
                ParseState::Body => {
                    if buf.readable_bytes() < self.content_length {
                        return ParseStatus::NeedMore;
                    }
                    self.body =
                        String::from_utf8_lossy(&buf.peek()[..self.content_length])
                            .into_owned();
                    buf.retrieve(self.content_length);
                    self.parse_post();
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => return ParseStatus::Done,
            }
        }
    }

    /// `METHOD SP PATH SP HTTP/VERSION`, method restricted to GET/POST.
    /// Fields are captured before the method check, so a rejected method
    /// still leaves the path available to the error response.
    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split(' ');
        let (method, path, proto) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v)) if parts.next().is_none() => (m, p, v),
            _ => return false,
        };
        let version = match proto.strip_prefix("HTTP/") {
            Some(v) if !v.is_empty() => v,
            _ => return false,
        };
        if path.is_empty() {
            return false;
        }
        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        if method != "GET" && method != "POST" {
            return false;
        }
        self.normalize_path();
        true
    }

    /// `Key: value` with exactly one optional space after the colon. Keys
    /// keep their as-received case.
    fn parse_header(&mut self, line: &str) -> bool {
        let (key, value) = match line.split_once(':') {
            Some((k, v)) if !k.is_empty() => (k, v),
            _ => return false,
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        self.headers.insert(key.to_string(), value.to_string());
        true
    }

    /// `/` becomes the index page; recognised bare segments gain `.html`.
    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if let Some(idx) = self.path.rfind('/') {
            let last = &self.path[idx..];
            if DEFAULT_HTML.contains(&last) {
                self.path.push_str(".html");
            }
        }
    }

    fn parse_post(&mut self) {
        if self.method == "POST"
            && self.header_value("Content-Type").map(|v| v.as_str())
                == Some("application/x-www-form-urlencoded")
        {
            self.parse_urlencoded();
        }
    }

    /// `k=v&k=v`, `+` as space, `%HH` decoded best-effort.
    fn parse_urlencoded(&mut self) {
        for pair in self.body.split('&') {
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((k, v)) => {
                    self.form.insert(url_decode(k), url_decode(v));
                }
                None => {
                    self.form.insert(url_decode(pair), String::new());
                }
            }
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Rewriting hook for the login/register flow.
    pub fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Case-insensitive header lookup (keys are stored as received).
    pub fn header_value(&self, name: &str) -> Option<&String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn form_value(&self, key: &str) -> Option<&String> {
        self.form.get(key)
    }

    /// True when a `..` segment would escape the static root.
    pub fn has_dotdot(&self) -> bool {
        self.path.split('/').any(|seg| seg == "..")
    }

    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header_value("Connection")
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(false)
    }

    /// True when this request should be routed to the user store.
    /// Returns the login flag (`true` = login, `false` = register).
    pub fn auth_tag(&self) -> Option<bool> {
        if self.method != "POST" {
            return None;
        }
        match self.path.as_str() {
            LOGIN_PAGE => Some(true),
            REGISTER_PAGE => Some(false),
            _ => None,
        }
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                match (hex_val(bytes.get(i + 1)), hex_val(bytes.get(i + 2))) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        // Invalid escape: keep the literal percent sign.
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: Option<&u8>) -> Option<u8> {
    match b? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(req: &mut Request, bytes: &[u8]) -> ParseStatus {
        let mut buf = Buffer::new();
        buf.append(bytes);
        req.parse(&mut buf)
    }

    #[test]
    fn parses_basic_get() {
        let mut req = Request::new();
        let status = feed(
            &mut req,
            b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n",
        );
        assert_eq!(status, ParseStatus::Done);
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header_value("host").unwrap(), "localhost");
        assert!(req.is_keep_alive());
    }

    #[test]
    fn normalizes_root_and_known_pages() {
        let mut req = Request::new();
        feed(&mut req, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(req.path(), "/index.html");

        let mut req = Request::new();
        feed(&mut req, b"GET /login HTTP/1.1\r\n\r\n");
        assert_eq!(req.path(), "/login.html");

        let mut req = Request::new();
        feed(&mut req, b"GET /other HTTP/1.1\r\n\r\n");
        assert_eq!(req.path(), "/other");
    }

    #[test]
    fn rejects_unsupported_methods_and_garbage() {
        let mut req = Request::new();
        assert_eq!(
            feed(&mut req, b"DELETE /x HTTP/1.1\r\n\r\n"),
            ParseStatus::Error
        );
        // The path survives the rejection for the error response to use.
        assert_eq!(req.path(), "/x");

        let mut req = Request::new();
        assert_eq!(feed(&mut req, b"not a request line\r\n\r\n"), ParseStatus::Error);

        let mut req = Request::new();
        assert_eq!(
            feed(&mut req, b"GET /x HTTP/1.1\r\nbroken header line\r\n\r\n"),
            ParseStatus::Error
        );
    }

    #[test]
    fn partial_input_is_non_destructive() {
        let mut req = Request::new();
        let mut buf = Buffer::new();
        buf.append(b"GET /index.html HTT");
        assert_eq!(req.parse(&mut buf), ParseStatus::NeedMore);
        // Nothing consumed: the partial line is still in the buffer.
        assert_eq!(buf.peek(), b"GET /index.html HTT");

        buf.append(b"P/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(req.parse(&mut buf), ParseStatus::Done);
        assert_eq!(req.path(), "/index.html");
    }

    #[test]
    fn byte_at_a_time_equals_single_shot() {
        let raw: &[u8] = b"POST /login.html HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 31\r\n\r\nusername=alice&password=secret!";

        let mut whole = Request::new();
        assert_eq!(feed(&mut whole, raw), ParseStatus::Done);

        let mut split = Request::new();
        let mut buf = Buffer::new();
        let mut status = ParseStatus::NeedMore;
        for &b in raw {
            buf.append(&[b]);
            status = split.parse(&mut buf);
            if status == ParseStatus::Done {
                break;
            }
        }
        assert_eq!(status, ParseStatus::Done);
        assert_eq!(split.method(), whole.method());
        assert_eq!(split.path(), whole.path());
        assert_eq!(split.version(), whole.version());
        assert_eq!(split.form_value("username"), whole.form_value("username"));
        assert_eq!(split.form_value("password"), whole.form_value("password"));
    }

    #[test]
    fn body_framing_is_content_length_driven() {
        // Body contains a CRLF; the parser must consume exactly the advertised
        // number of bytes, not a line.
        let mut req = Request::new();
        let mut buf = Buffer::new();
        buf.append(b"POST /register.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 9\r\n\r\na=b\r\nc=d!leftover");
        assert_eq!(req.parse(&mut buf), ParseStatus::Done);
        assert_eq!(req.body(), "a=b\r\nc=d!");
        assert_eq!(buf.peek(), b"leftover");
    }

    #[test]
    fn decodes_urlencoded_forms() {
        let body = b"username=a+b&password=p%40ss%2Fword&flag";
        let mut req = Request::new();
        let mut buf = Buffer::new();
        buf.append(
            format!(
                "POST /login.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        buf.append(body);
        assert_eq!(req.parse(&mut buf), ParseStatus::Done);
        assert_eq!(req.form_value("username").unwrap(), "a b");
        assert_eq!(req.form_value("password").unwrap(), "p@ss/word");
        assert_eq!(req.form_value("flag").unwrap(), "");
    }

    #[test]
    fn invalid_percent_escape_is_kept_literally() {
        assert_eq!(url_decode("100%zz"), "100%zz");
        assert_eq!(url_decode("trailing%2"), "trailing%2");
        assert_eq!(url_decode("ok%41"), "okA");
    }

    #[test]
    fn detects_dotdot_segments() {
        let mut req = Request::new();
        feed(&mut req, b"GET /../etc/passwd HTTP/1.1\r\n\r\n");
        assert!(req.has_dotdot());

        let mut req = Request::new();
        feed(&mut req, b"GET /a..b/x HTTP/1.1\r\n\r\n");
        assert!(!req.has_dotdot());
    }

    #[test]
    fn keep_alive_requires_version_and_header() {
        let mut req = Request::new();
        feed(&mut req, b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(!req.is_keep_alive());

        let mut req = Request::new();
        feed(&mut req, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn auth_tag_routes_login_and_register() {
        let mut req = Request::new();
        feed(&mut req, b"POST /login.html HTTP/1.1\r\n\r\n");
        assert_eq!(req.auth_tag(), Some(true));

        let mut req = Request::new();
        feed(&mut req, b"POST /register.html HTTP/1.1\r\n\r\n");
        assert_eq!(req.auth_tag(), Some(false));

        let mut req = Request::new();
        feed(&mut req, b"GET /login.html HTTP/1.1\r\n\r\n");
        assert_eq!(req.auth_tag(), None);
    }

    #[test]
    fn init_restores_pristine_state() {
        let mut req = Request::new();
        feed(&mut req, b"GET /login HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(req.is_finished());
        req.init();
        assert!(!req.is_finished());
        assert_eq!(req.method(), "");
        assert_eq!(req.path(), "");
        assert!(req.header_value("Host").is_none());
    }
}
