use super::mmap::MappedFile;
use super::response::{canned_body, content_type_for, ResponseHead, EMPTY_PAGE};
use crate::library::db::Context;
use crate::library::network::epoll::{Epoll, EV_READ, EV_WRITE};
use memchr::memchr2;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::{debug, error, trace};

pub const READ_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RequestLine,
    Headers,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full CRLF-terminated line is available.
    Ok,
    /// No terminator yet; await more bytes. Not an error.
    Open,
    /// Structurally broken line, or the buffer filled with no terminator.
    Bad,
}

/// Outcome of driving the parser over the bytes received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Need more data; keep the connection in the read set.
    Incomplete,
    /// Request fully parsed, not yet resolved against the filesystem.
    Complete,
    /// Malformed request, answered with 400.
    Bad,
    /// Target absent, answered with 404.
    NotFound,
    /// Target unreadable or not a regular file, answered with 403.
    Forbidden,
    /// Resolved regular file, body mapped and ready for 200.
    File,
    /// Server-side failure, answered with 500.
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
}

/// Per-connection protocol state machine: consumes bytes, produces a
/// verdict, assembles the response and drives the two-segment send.
///
/// One slot per fd, re-initialized on accept and reused across requests on
/// keep-alive connections. Exactly one thread works a connection at a time;
/// the dispatcher guarantees it never hands the same fd out twice.
pub struct HttpConn {
    fd: RawFd,
    addr: Option<SocketAddr>,
    edge_triggered: bool,

    read_buf: Box<[u8]>,
    read_idx: usize,
    checked_idx: usize,
    line_start: usize,
    line_end: usize,

    phase: Phase,
    method: Method,
    url: String,
    host: String,
    content_length: usize,
    keep_alive: bool,
    cgi: bool,
    body: Vec<u8>,

    path: PathBuf,
    file_len: usize,
    mapped: Option<MappedFile>,

    head: ResponseHead,
    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl Default for HttpConn {
    fn default() -> Self {
        HttpConn {
            fd: -1,
            addr: None,
            edge_triggered: false,
            read_buf: Box::new([]),
            read_idx: 0,
            checked_idx: 0,
            line_start: 0,
            line_end: 0,
            phase: Phase::RequestLine,
            method: Method::Get,
            url: String::new(),
            host: String::new(),
            content_length: 0,
            keep_alive: false,
            cgi: false,
            body: Vec::new(),
            path: PathBuf::new(),
            file_len: 0,
            mapped: None,
            head: ResponseHead::default(),
            bytes_to_send: 0,
            bytes_have_send: 0,
        }
    }
}

impl HttpConn {
    /// Takes ownership of a freshly accepted fd. The read buffer is
    /// allocated on the slot's first use and kept across connections.
    pub fn init(&mut self, fd: RawFd, addr: SocketAddr, edge_triggered: bool) {
        self.fd = fd;
        self.addr = Some(addr);
        self.edge_triggered = edge_triggered;
        if self.read_buf.is_empty() {
            self.read_buf = vec![0u8; READ_BUFFER_SIZE].into_boxed_slice();
        }
        self.reset_for_reuse();
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Unmaps, closes and parks the slot until the fd number is reused.
    pub fn finalize(&mut self) {
        self.mapped = None;
        if self.fd >= 0 {
            trace!("closing fd {}", self.fd);
            unsafe { libc::close(self.fd) };
        }
        self.fd = -1;
        self.addr = None;
    }

    /// Clears parse and response state while keeping the fd, peer address
    /// and trigger mode: the reset between keep-alive requests.
    fn reset_for_reuse(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.line_start = 0;
        self.line_end = 0;
        self.phase = Phase::RequestLine;
        self.method = Method::Get;
        self.url.clear();
        self.host.clear();
        self.content_length = 0;
        self.keep_alive = false;
        self.cgi = false;
        self.body.clear();
        self.path = PathBuf::new();
        self.file_len = 0;
        self.mapped = None;
        self.head.clear();
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
    }

    // ---- receive ----

    /// Pulls bytes off the socket. Level-triggered connections read once
    /// per invocation; edge-triggered ones drain until the kernel reports
    /// would-block, since the edge will not re-fire for buffered data.
    /// Returns false on orderly close or transport failure.
    pub fn read_once(&mut self) -> bool {
        if self.read_idx >= self.read_buf.len() {
            // Full buffer: nothing to read into; the parser turns this
            // into a 400 when no terminator ever showed up.
            return true;
        }
        if !self.edge_triggered {
            let n = self.recv_some();
            if n <= 0 {
                return false;
            }
            self.read_idx += n as usize;
            return true;
        }
        loop {
            if self.read_idx >= self.read_buf.len() {
                return true;
            }
            let n = self.recv_some();
            if n < 0 {
                let err = io::Error::last_os_error();
                return err.raw_os_error() == Some(libc::EAGAIN);
            }
            if n == 0 {
                return false;
            }
            self.read_idx += n as usize;
        }
    }

    fn recv_some(&mut self) -> isize {
        unsafe {
            libc::recv(
                self.fd,
                self.read_buf.as_mut_ptr().add(self.read_idx) as *mut libc::c_void,
                self.read_buf.len() - self.read_idx,
                0,
            )
        }
    }

    // ---- parse ----

    /// Scans from the last consumed offset for a CRLF terminator.
    fn parse_line(&mut self) -> LineStatus {
        let window = &self.read_buf[self.checked_idx..self.read_idx];
        match memchr2(b'\r', b'\n', window) {
            Some(i) => {
                let pos = self.checked_idx + i;
                if self.read_buf[pos] == b'\r' {
                    if pos + 1 == self.read_idx {
                        // CR on the buffer edge: its LF may still arrive,
                        // unless there is no room left for it.
                        if self.read_idx == self.read_buf.len() {
                            return LineStatus::Bad;
                        }
                        return LineStatus::Open;
                    }
                    if self.read_buf[pos + 1] == b'\n' {
                        self.line_end = pos;
                        self.checked_idx = pos + 2;
                        return LineStatus::Ok;
                    }
                    LineStatus::Bad
                } else {
                    // Bare LF; only valid directly after a CR consumed in
                    // an earlier scan.
                    if pos > 0 && self.read_buf[pos - 1] == b'\r' {
                        self.line_end = pos - 1;
                        self.checked_idx = pos + 1;
                        return LineStatus::Ok;
                    }
                    LineStatus::Bad
                }
            }
            None => {
                if self.read_idx == self.read_buf.len() {
                    return LineStatus::Bad;
                }
                LineStatus::Open
            }
        }
    }

    fn current_line(&self) -> &[u8] {
        &self.read_buf[self.line_start..self.line_end]
    }

    fn parse_request_line(&mut self) -> Verdict {
        let line = String::from_utf8_lossy(self.current_line()).into_owned();
        let mut parts = line.split_ascii_whitespace();
        let (Some(method), Some(url), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Verdict::Bad;
        };
        if parts.next().is_some() {
            return Verdict::Bad;
        }
        self.method = match method {
            "GET" => Method::Get,
            "POST" => {
                self.cgi = true;
                Method::Post
            }
            "HEAD" | "PUT" | "DELETE" | "TRACE" | "OPTIONS" | "CONNECT" | "PATCH" => {
                debug!("unsupported method {method}");
                return Verdict::Bad;
            }
            _ => return Verdict::Bad,
        };
        if version != "HTTP/1.1" {
            return Verdict::Bad;
        }
        let mut url: &str = url;
        if let Some(rest) = url.strip_prefix("http://") {
            match rest.find('/') {
                Some(slash) => url = &rest[slash..],
                None => return Verdict::Bad,
            }
        }
        if !url.starts_with('/') {
            return Verdict::Bad;
        }
        self.url = url.to_string();
        if self.url == "/" {
            self.url.push_str("index.html");
        }
        self.phase = Phase::Headers;
        Verdict::Incomplete
    }

    fn parse_header_line(&mut self) -> Verdict {
        let line = String::from_utf8_lossy(self.current_line()).into_owned();
        if line.is_empty() {
            if self.content_length != 0 {
                self.phase = Phase::Body;
                return Verdict::Incomplete;
            }
            return Verdict::Complete;
        }
        let Some((name, value)) = line.split_once(':') else {
            trace!("ignoring header without separator: {line}");
            return Verdict::Incomplete;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("Connection") {
            if value.eq_ignore_ascii_case("keep-alive") {
                self.keep_alive = true;
            }
        } else if name.eq_ignore_ascii_case("Content-Length") {
            self.content_length = value.parse().unwrap_or(0);
            if self.checked_idx + self.content_length > self.read_buf.len() {
                // A body that can never fit the buffer will never parse.
                return Verdict::Bad;
            }
        } else if name.eq_ignore_ascii_case("Host") {
            self.host = value.to_string();
        } else {
            trace!("ignoring header {name}");
        }
        Verdict::Incomplete
    }

    fn parse_body(&mut self) -> Verdict {
        if self.read_idx >= self.checked_idx + self.content_length {
            let start = self.checked_idx;
            self.body = self.read_buf[start..start + self.content_length].to_vec();
            return Verdict::Complete;
        }
        Verdict::Incomplete
    }

    /// Drives the phase machine over everything buffered so far. Safe to
    /// call again after each partial delivery; the verdict for a request
    /// split across any number of reads matches the single-read verdict.
    pub fn process_read(&mut self, ctx: &Context) -> Verdict {
        let mut line_status = LineStatus::Ok;
        loop {
            let line_ready = if self.phase == Phase::Body && line_status == LineStatus::Ok {
                true
            } else {
                line_status = self.parse_line();
                line_status == LineStatus::Ok
            };
            if !line_ready {
                break;
            }
            match self.phase {
                Phase::RequestLine => {
                    let verdict = self.parse_request_line();
                    self.line_start = self.checked_idx;
                    if verdict == Verdict::Bad {
                        return Verdict::Bad;
                    }
                }
                Phase::Headers => {
                    let verdict = self.parse_header_line();
                    self.line_start = self.checked_idx;
                    match verdict {
                        Verdict::Bad => return Verdict::Bad,
                        Verdict::Complete => return self.resolve(ctx),
                        _ => {}
                    }
                }
                Phase::Body => {
                    return match self.parse_body() {
                        Verdict::Complete => self.resolve(ctx),
                        _ => Verdict::Incomplete,
                    };
                }
            }
        }
        match line_status {
            LineStatus::Bad => Verdict::Bad,
            _ => Verdict::Incomplete,
        }
    }

    // ---- resolve ----

    /// Turns a fully parsed request into a response target: credential
    /// routes first, then document-root path resolution and mapping.
    fn resolve(&mut self, ctx: &Context) -> Verdict {
        if self.cgi && (self.url == "/login" || self.url == "/register") {
            let body = String::from_utf8_lossy(&self.body).into_owned();
            let Some((user, password)) = parse_credentials(&body) else {
                return Verdict::Bad;
            };
            let page = if self.url == "/login" {
                if ctx.verify(user, password) {
                    "/welcome.html"
                } else {
                    "/login_error.html"
                }
            } else {
                match ctx.register(user, password) {
                    Ok(true) => "/login.html",
                    Ok(false) => "/register_error.html",
                    Err(e) => {
                        error!("credential store write failed: {e}");
                        return Verdict::Internal;
                    }
                }
            };
            debug!("credential request from {user} -> {page}");
            self.url = page.to_string();
        }

        let rel = self.url.trim_start_matches('/');
        let path = ctx.doc_root.join(rel);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return Verdict::NotFound,
        };
        if meta.permissions().mode() & 0o004 == 0 {
            return Verdict::Forbidden;
        }
        if !meta.is_file() {
            return Verdict::Forbidden;
        }
        self.file_len = meta.len() as usize;
        self.path = path;
        if self.file_len > 0 {
            let file = match File::open(&self.path) {
                Ok(file) => file,
                Err(_) => return Verdict::NotFound,
            };
            match MappedFile::map(&file, self.file_len) {
                Ok(mapped) => self.mapped = Some(mapped),
                Err(e) => {
                    error!("mmap of {:?} failed: {e}", self.path);
                    return Verdict::Internal;
                }
            }
        }
        Verdict::File
    }

    // ---- respond ----

    /// Assembles the response head (and canned body, if any) for the given
    /// verdict. Returns false only when the head overflows its bound, which
    /// tears the connection down.
    pub fn assemble_response(&mut self, verdict: Verdict) -> bool {
        self.head.clear();
        let ok = match verdict {
            Verdict::Bad => self.canned(400),
            Verdict::NotFound => self.canned(404),
            Verdict::Forbidden => self.canned(403),
            Verdict::Internal => self.canned(500),
            Verdict::File => {
                if self.file_len > 0 {
                    self.head.status_line(200)
                        && self.head.content_type(content_type_for(&self.path))
                        && self.head.content_length(self.file_len)
                        && self.head.connection(self.keep_alive)
                        && self.head.blank_line()
                } else {
                    self.head.status_line(200)
                        && self.head.content_type("text/html")
                        && self.head.content_length(EMPTY_PAGE.len())
                        && self.head.connection(self.keep_alive)
                        && self.head.blank_line()
                        && self.head.body(EMPTY_PAGE)
                }
            }
            Verdict::Incomplete | Verdict::Complete => false,
        };
        if !ok {
            return false;
        }
        self.bytes_to_send =
            self.head.len() + self.mapped.as_ref().map(MappedFile::len).unwrap_or(0);
        self.bytes_have_send = 0;
        true
    }

    fn canned(&mut self, code: u16) -> bool {
        let body = canned_body(code);
        self.head.status_line(code)
            && self.head.content_type("text/html")
            && self.head.content_length(body.len())
            && self.head.connection(self.keep_alive)
            && self.head.blank_line()
            && self.head.body(body)
    }

    /// Worker entry point: parse what is buffered, then either re-arm for
    /// more input or stage the response and ask for write readiness.
    /// Returns false when the connection must be torn down.
    pub fn process(&mut self, epoll: &Epoll, ctx: &Context) -> bool {
        let verdict = self.process_read(ctx);
        if verdict == Verdict::Incomplete {
            let _ = epoll.rearm(self.fd, EV_READ, self.edge_triggered);
            return true;
        }
        debug!(
            "fd {} {:?} {} -> {verdict:?}",
            self.fd, self.method, self.url
        );
        if !self.assemble_response(verdict) {
            return false;
        }
        let _ = epoll.rearm(self.fd, EV_WRITE, self.edge_triggered);
        true
    }

    // ---- send ----

    /// Pushes the staged response out with scatter writes across the head
    /// and the mapped body, so file bytes are never copied into userspace
    /// buffers. Returns true while the connection should stay open (still
    /// sending, or reset for the next keep-alive request); false when it
    /// must close (transport failure or linger not requested).
    pub fn write(&mut self, epoll: &Epoll) -> bool {
        if self.bytes_to_send == 0 {
            let _ = epoll.rearm(self.fd, EV_READ, self.edge_triggered);
            self.reset_for_reuse();
            return true;
        }
        loop {
            let head_len = self.head.len();
            let mut iov: [libc::iovec; 2] = unsafe { std::mem::zeroed() };
            let mut iov_count: usize = 0;
            if self.bytes_have_send < head_len {
                let seg = &self.head.as_slice()[self.bytes_have_send..];
                iov[0] = libc::iovec {
                    iov_base: seg.as_ptr() as *mut libc::c_void,
                    iov_len: seg.len(),
                };
                iov_count = 1;
            }
            if let Some(mapped) = &self.mapped {
                let off = self.bytes_have_send.saturating_sub(head_len);
                if off < mapped.len() {
                    let seg = &mapped.as_slice()[off..];
                    iov[iov_count] = libc::iovec {
                        iov_base: seg.as_ptr() as *mut libc::c_void,
                        iov_len: seg.len(),
                    };
                    iov_count += 1;
                }
            }
            let n = unsafe { libc::writev(self.fd, iov.as_ptr(), iov_count as i32) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    let _ = epoll.rearm(self.fd, EV_WRITE, self.edge_triggered);
                    return true;
                }
                trace!("send on fd {} failed: {err}", self.fd);
                self.mapped = None;
                return false;
            }
            let n = n as usize;
            self.bytes_have_send += n;
            self.bytes_to_send = self.bytes_to_send.saturating_sub(n);
            if self.bytes_to_send == 0 {
                self.mapped = None;
                let _ = epoll.rearm(self.fd, EV_READ, self.edge_triggered);
                if self.keep_alive {
                    self.reset_for_reuse();
                    return true;
                }
                return false;
            }
        }
    }

    #[cfg(test)]
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.read_buf.is_empty() {
            self.read_buf = vec![0u8; READ_BUFFER_SIZE].into_boxed_slice();
        }
        let end = (self.read_idx + bytes.len()).min(self.read_buf.len());
        let len = end - self.read_idx;
        self.read_buf[self.read_idx..end].copy_from_slice(&bytes[..len]);
        self.read_idx = end;
    }

    #[cfg(test)]
    pub fn staged_response(&self) -> Vec<u8> {
        let mut out = self.head.as_slice().to_vec();
        if let Some(mapped) = &self.mapped {
            out.extend_from_slice(mapped.as_slice());
        }
        out
    }
}

fn parse_credentials(body: &str) -> Option<(&str, &str)> {
    let mut user = None;
    let mut password = None;
    for pair in body.split('&') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "user" => user = Some(value),
            "password" => password = Some(value),
            _ => {}
        }
    }
    Some((user?, password?))
}
