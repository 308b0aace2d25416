use bytes::{BufMut, BytesMut};
use std::path::Path;

/// Upper bound on the response head (status line + headers + any canned
/// body). A request whose head would overflow this is answered with a
/// connection close instead of a truncated response.
pub const WRITE_HEAD_CAPACITY: usize = 1024;

pub const HTTP_VERSION: &str = "HTTP/1.1";

pub const BODY_400: &[u8] =
    b"Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const BODY_403: &[u8] =
    b"You do not have permission to read this file on the server.\n";
pub const BODY_404: &[u8] = b"The requested file was not found on this server.\n";
pub const BODY_500: &[u8] =
    b"There was an unusual problem serving the requested file.\n";

/// Sent as-is to a connection refused at capacity, before it is ever
/// registered with the multiplexer.
pub const BUSY_RESPONSE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Content-Type: text/html\r\nContent-Length: 13\r\nConnection: close\r\n\r\n\
Server busy.\n";

/// Placeholder body for a 200 against a zero-length file.
pub const EMPTY_PAGE: &[u8] = b"<html><body></body></html>";

pub fn status_title(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Internal Error",
    }
}

pub fn canned_body(code: u16) -> &'static [u8] {
    match code {
        400 => BODY_400,
        403 => BODY_403,
        404 => BODY_404,
        _ => BODY_500,
    }
}

/// Fixed extension table for `Content-Type`. Anything unknown goes out as
/// an opaque byte stream.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "mp4" => "video/mp4",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Owned, capacity-bounded buffer the response head is assembled into.
/// Every append reports whether it fit; an overflow makes the whole
/// response invalid (mapped to a 500-and-close upstream).
pub struct ResponseHead {
    buf: BytesMut,
}

impl Default for ResponseHead {
    fn default() -> Self {
        ResponseHead {
            buf: BytesMut::new(),
        }
    }
}

impl ResponseHead {
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn status_line(&mut self, code: u16) -> bool {
        self.push_str(&format!(
            "{HTTP_VERSION} {code} {}\r\n",
            status_title(code)
        ))
    }

    pub fn content_type(&mut self, mime: &str) -> bool {
        self.push_str(&format!("Content-Type: {mime}\r\n"))
    }

    pub fn content_length(&mut self, len: usize) -> bool {
        self.push_str(&format!("Content-Length: {len}\r\n"))
    }

    pub fn connection(&mut self, keep_alive: bool) -> bool {
        let value = if keep_alive { "keep-alive" } else { "close" };
        self.push_str(&format!("Connection: {value}\r\n"))
    }

    pub fn blank_line(&mut self) -> bool {
        self.push(b"\r\n")
    }

    pub fn body(&mut self, content: &[u8]) -> bool {
        self.push(content)
    }

    fn push_str(&mut self, s: &str) -> bool {
        self.push(s.as_bytes())
    }

    fn push(&mut self, bytes: &[u8]) -> bool {
        if self.buf.len() + bytes.len() > WRITE_HEAD_CAPACITY {
            return false;
        }
        self.buf.put_slice(bytes);
        true
    }
}
