
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::{Error, Result};

/// Value of the `X-Admin-Protocol` header stamped on every response,
/// per GlobalPlatform Amendment B.
pub const ADMIN_PROTOCOL: &str = "globalplatform-remote-admin/1.0";

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy)]
pub struct HttpLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        HttpLimits {
            max_header_bytes: 8192,
            max_body_bytes: 65_536,
        }
    }
}

/// A parsed request. Bodies are opaque binary; the server never interprets
/// them beyond the trailing status word peek.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Canonical wire form: the exact inverse of the parser for
    /// content-length framed requests.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(CRLF);
        }
        out.extend_from_slice(CRLF);
        out.extend_from_slice(&self.body);
        out
    }
}

/// A response frame. Only the handful of statuses the admin dialogue needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    reason: &'static str,
    content_type: Option<String>,
    body: Bytes,
}

impl Response {
    pub fn ok(body: Bytes, content_type: &str) -> Self {
        Response {
            status: 200,
            reason: "OK",
            content_type: Some(content_type.to_owned()),
            body,
        }
    }

    pub fn no_content() -> Self {
        Response {
            status: 204,
            reason: "No Content",
            content_type: None,
            body: Bytes::new(),
        }
    }

    pub fn bad_request() -> Self {
        Response::empty(400, "Bad Request")
    }

    pub fn not_found() -> Self {
        Response::empty(404, "Not Found")
    }

    pub fn method_not_allowed() -> Self {
        Response::empty(405, "Method Not Allowed")
    }

    pub fn payload_too_large() -> Self {
        Response::empty(413, "Payload Too Large")
    }

    pub fn service_unavailable() -> Self {
        Response::empty(503, "Service Unavailable")
    }

    fn empty(status: u16, reason: &'static str) -> Self {
        Response {
            status,
            reason,
            content_type: None,
            body: Bytes::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(CRLF);
        out.extend_from_slice(b"X-Admin-Protocol: ");
        out.extend_from_slice(ADMIN_PROTOCOL.as_bytes());
        out.extend_from_slice(CRLF);
        if let Some(ct) = &self.content_type {
            out.extend_from_slice(b"Content-Type: ");
            out.extend_from_slice(ct.as_bytes());
            out.extend_from_slice(CRLF);
        }
        // 204 carries neither body nor length.
        if self.status != 204 {
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(self.body.len().to_string().as_bytes());
            out.extend_from_slice(CRLF);
        }
        out.extend_from_slice(CRLF);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Framing layer over the post-handshake byte stream.
///
/// Strict HTTP/1.1 subset: request line, headers, then a body delimited by
/// `Content-Length` or `Transfer-Encoding: chunked`. Reads are bounded by
/// two clocks: the idle timeout until the first byte of a request, and the
/// read timeout for receiving the rest of it.
pub struct HttpTransport<S> {
    io: S,
    buf: BytesMut,
    limits: HttpLimits,
}

impl<S: AsyncRead + AsyncWrite + Unpin> HttpTransport<S> {
    pub fn new(io: S, limits: HttpLimits) -> Self {
        HttpTransport {
            io,
            buf: BytesMut::with_capacity(4096),
            limits,
        }
    }

    pub async fn read_request(
        &mut self,
        idle_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Request> {
        // The read deadline starts ticking with the first byte of the
        // request; until then only the idle clock runs.
        let mut deadline: Option<Instant> = if self.buf.is_empty() {
            None
        } else {
            Some(Instant::now() + read_timeout)
        };

        let head_end = loop {
            if let Some(pos) = find_head_end(&self.buf) {
                break pos;
            }
            if self.buf.len() > self.limits.max_header_bytes {
                return Err(Error::ErrHeaderBlockTooLarge);
            }
            let n = match deadline {
                None => match timeout(idle_timeout, self.io.read_buf(&mut self.buf)).await {
                    Err(_) => return Err(Error::ErrIdleTimeout),
                    Ok(r) => {
                        deadline = Some(Instant::now() + read_timeout);
                        r?
                    }
                },
                Some(d) => match timeout_at(d, self.io.read_buf(&mut self.buf)).await {
                    Err(_) => return Err(Error::ErrDeadlineExceeded),
                    Ok(r) => r?,
                },
            };
            if n == 0 {
                return Err(if self.buf.is_empty() {
                    Error::ErrConnClosed
                } else {
                    Error::ErrConnReset
                });
            }
        };

        if head_end > self.limits.max_header_bytes {
            return Err(Error::ErrHeaderBlockTooLarge);
        }

        let head = parse_head(&self.buf[..head_end])?;
        self.buf.advance(head_end + HEAD_END.len());

        let deadline = deadline.unwrap_or_else(|| Instant::now() + read_timeout);
        let body = match body_framing(&head)? {
            BodyFraming::None => Bytes::new(),
            BodyFraming::ContentLength(len) => {
                if len > self.limits.max_body_bytes {
                    return Err(Error::ErrRequestTooLarge);
                }
                self.read_exact_buffered(len, deadline).await?
            }
            BodyFraming::Chunked => self.read_chunked(deadline).await?,
        };

        Ok(Request {
            method: head.method,
            path: head.path,
            headers: head.headers,
            body,
        })
    }

    pub async fn write_response(&mut self, response: &Response) -> Result<()> {
        let bytes = response.encode();
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Flushes and closes the write side (close-notify on a TLS stream).
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.io
    }

    async fn fill(&mut self, deadline: Instant) -> Result<()> {
        let n = match timeout_at(deadline, self.io.read_buf(&mut self.buf)).await {
            Err(_) => return Err(Error::ErrDeadlineExceeded),
            Ok(r) => r?,
        };
        if n == 0 {
            return Err(Error::ErrConnReset);
        }
        Ok(())
    }

    async fn read_exact_buffered(&mut self, len: usize, deadline: Instant) -> Result<Bytes> {
        while self.buf.len() < len {
            self.fill(deadline).await?;
        }
        Ok(self.buf.split_to(len).freeze())
    }

    async fn read_line(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let line = self.buf.split_to(pos).freeze();
                self.buf.advance(CRLF.len());
                return Ok(line.to_vec());
            }
            if self.buf.len() > self.limits.max_header_bytes {
                return Err(Error::ErrMalformedRequest("chunk line too long".to_owned()));
            }
            self.fill(deadline).await?;
        }
    }

    async fn read_chunked(&mut self, deadline: Instant) -> Result<Bytes> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line(deadline).await?;
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                break;
            }
            if body.len() + size > self.limits.max_body_bytes {
                return Err(Error::ErrRequestTooLarge);
            }
            let chunk = self.read_exact_buffered(size, deadline).await?;
            body.extend_from_slice(&chunk);
            let sep = self.read_exact_buffered(2, deadline).await?;
            if &sep[..] != CRLF {
                return Err(Error::ErrMalformedRequest(
                    "chunk data not terminated by CRLF".to_owned(),
                ));
            }
        }
        // Trailer section: accepted, bounded, discarded.
        let mut trailer_bytes = 0usize;
        loop {
            let line = self.read_line(deadline).await?;
            if line.is_empty() {
                break;
            }
            trailer_bytes += line.len() + CRLF.len();
            if trailer_bytes > self.limits.max_header_bytes {
                return Err(Error::ErrHeaderBlockTooLarge);
            }
        }
        Ok(body.freeze())
    }
}

struct Head {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

enum BodyFraming {
    None,
    ContentLength(usize),
    Chunked,
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_END.len()).position(|w| w == HEAD_END)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|w| w == CRLF)
}

fn parse_head(head: &[u8]) -> Result<Head> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::ErrMalformedRequest("header block is not ascii".to_owned()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| Error::ErrMalformedRequest("empty request".to_owned()))?;
    let mut parts = request_line.split(' ');
    let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) if !m.is_empty() && !p.is_empty() => (m, p, v),
        _ => {
            return Err(Error::ErrMalformedRequest(
                "bad request line".to_owned(),
            ))
        }
    };
    if version != "HTTP/1.1" {
        return Err(Error::ErrMalformedRequest(format!(
            "unsupported version {version}"
        )));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Obsolete line folding, rejected outright.
            return Err(Error::ErrMalformedRequest(
                "obsolete header folding".to_owned(),
            ));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::ErrMalformedRequest(format!("bad header line: {line}")))?;
        if name.is_empty() || name.contains(' ') || name.contains('\t') {
            return Err(Error::ErrMalformedRequest(format!(
                "bad header name: {name}"
            )));
        }
        headers.push((name.to_owned(), value.trim().to_owned()));
    }

    Ok(Head {
        method: method.to_owned(),
        path: path.to_owned(),
        headers,
    })
}

fn header<'a>(head: &'a Head, name: &str) -> Option<&'a str> {
    head.headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn body_framing(head: &Head) -> Result<BodyFraming> {
    let te = header(head, "transfer-encoding");
    let cl = header(head, "content-length");
    match (te, cl) {
        (Some(te), None) if te.eq_ignore_ascii_case("chunked") => Ok(BodyFraming::Chunked),
        (Some(te), None) => Err(Error::ErrMalformedRequest(format!(
            "unsupported transfer-encoding {te}"
        ))),
        (Some(_), Some(_)) => Err(Error::ErrMalformedRequest(
            "both content-length and transfer-encoding".to_owned(),
        )),
        (None, Some(cl)) => {
            let len: usize = cl.parse().map_err(|_| {
                Error::ErrMalformedRequest(format!("bad content-length {cl}"))
            })?;
            Ok(BodyFraming::ContentLength(len))
        }
        (None, None) => Ok(BodyFraming::None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::ErrMalformedRequest("chunk size is not ascii".to_owned()))?;
    // Chunk extensions are tolerated and ignored.
    let size_part = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_part, 16)
        .map_err(|_| Error::ErrMalformedRequest(format!("bad chunk size {size_part}")))
}
