// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Just enough HTTP/1.1 to talk to a cluster's management and view ports
//! over a provider-owned stream: request serialization, a resumable
//! response-head parser, and a resumable body decoder for content-length,
//! chunked, and read-to-close framings.

use crate::{
    collections::WatchedValue,
    fail::Fail,
    runtime::{Runtime, StreamHandle},
    topology::config::split_host_port,
};
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use std::time::Instant;

//==============================================================================
// Constants & Structures
//==============================================================================

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Clone, Debug)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Length(usize),
    Chunked,
    /// Body runs until the remote closes the stream.
    Eof,
}

/// Accumulates bytes until the blank line ending the response head.
pub(crate) struct HeadParser {
    buf: BytesMut,
}

#[derive(Clone, Copy)]
enum ChunkState {
    Size,
    Data(usize),
    DataCrlf(usize),
    Trailer,
    Done,
}

/// Resumable body decoder; safe to feed a byte at a time.
pub(crate) struct BodyDecoder {
    framing: BodyFraming,
    remaining: usize,
    chunk: ChunkState,
    line: Vec<u8>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl HttpRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_of(&self.headers, name)
    }
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_of(&self.headers, name)
    }

    pub fn body_framing(&self) -> BodyFraming {
        if let Some(te) = self.header("transfer-encoding") {
            if te.to_ascii_lowercase().contains("chunked") {
                return BodyFraming::Chunked;
            }
        }
        if let Some(cl) = self.header("content-length") {
            if let Ok(n) = cl.trim().parse::<usize>() {
                return BodyFraming::Length(n);
            }
        }
        BodyFraming::Eof
    }
}

fn header_of<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub(crate) fn encode_request(req: &HttpRequest, host: &str, port: u16) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(req.method.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(req.path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    buf.extend_from_slice(format!("Host: {}:{}\r\n", host, port).as_bytes());
    buf.extend_from_slice(b"User-Agent: futon/0.1\r\n");
    for (name, value) in &req.headers {
        buf.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if let Some(body) = &req.body {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    if let Some(body) = &req.body {
        buf.extend_from_slice(body);
    }
    buf.freeze()
}

impl HeadParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Returns the parsed head plus any body bytes received after it.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<(ResponseHead, Bytes)>, Fail> {
        self.buf.extend_from_slice(bytes);
        let end = match find(&self.buf, b"\r\n\r\n") {
            Some(at) => at,
            None => return Ok(None),
        };
        let head = parse_head(&self.buf[..end])?;
        let leftover = self.buf.split_off(end + 4).freeze();
        Ok(Some((head, leftover)))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_head(raw: &[u8]) -> Result<ResponseHead, Fail> {
    let text = std::str::from_utf8(raw).map_err(|_| Fail::Protocol {
        details: "response head is not valid UTF-8",
    })?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or(Fail::Protocol {
        details: "empty response head",
    })?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or(Fail::Protocol {
            details: "malformed status line",
        })?;
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ':');
        let name = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        if name.is_empty() {
            return Err(Fail::Protocol {
                details: "malformed header line",
            });
        }
        headers.push((name.to_string(), value.to_string()));
    }
    Ok(ResponseHead { status, headers })
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        Self {
            framing,
            remaining: match framing {
                BodyFraming::Length(n) => n,
                _ => 0,
            },
            chunk: ChunkState::Size,
            line: Vec::new(),
        }
    }

    /// Appends decoded body bytes to `out`; true once the body is complete.
    /// `Eof`-framed bodies complete only when the stream closes.
    pub fn feed(&mut self, input: &[u8], out: &mut BytesMut) -> Result<bool, Fail> {
        match self.framing {
            BodyFraming::Eof => {
                out.extend_from_slice(input);
                Ok(false)
            }
            BodyFraming::Length(_) => {
                let take = input.len().min(self.remaining);
                out.extend_from_slice(&input[..take]);
                self.remaining -= take;
                Ok(self.remaining == 0)
            }
            BodyFraming::Chunked => self.feed_chunked(input, out),
        }
    }

    pub fn is_done(&self) -> bool {
        match self.framing {
            BodyFraming::Eof => false,
            BodyFraming::Length(_) => self.remaining == 0,
            BodyFraming::Chunked => matches!(self.chunk, ChunkState::Done),
        }
    }

    fn feed_chunked(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<bool, Fail> {
        while !input.is_empty() {
            match self.chunk {
                ChunkState::Size => {
                    if let Some(rest) = self.take_line(&mut input)? {
                        let line = rest;
                        let size_text = line.split(|&b| b == b';').next().unwrap_or(&[]);
                        let size_text =
                            std::str::from_utf8(size_text).map_err(|_| Fail::Protocol {
                                details: "chunk size is not valid UTF-8",
                            })?;
                        let size = usize::from_str_radix(size_text.trim(), 16).map_err(|_| {
                            Fail::Protocol {
                                details: "chunk size is not hexadecimal",
                            }
                        })?;
                        self.chunk = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                }
                ChunkState::Data(remaining) => {
                    let take = input.len().min(remaining);
                    out.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    self.chunk = if remaining == take {
                        ChunkState::DataCrlf(2)
                    } else {
                        ChunkState::Data(remaining - take)
                    };
                }
                ChunkState::DataCrlf(remaining) => {
                    let take = input.len().min(remaining);
                    input = &input[take..];
                    self.chunk = if remaining == take {
                        ChunkState::Size
                    } else {
                        ChunkState::DataCrlf(remaining - take)
                    };
                }
                ChunkState::Trailer => {
                    if let Some(line) = self.take_line(&mut input)? {
                        if line.is_empty() {
                            self.chunk = ChunkState::Done;
                            return Ok(true);
                        }
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
        Ok(matches!(self.chunk, ChunkState::Done))
    }

    /// Consumes up to a CRLF; returns the completed line without it.
    fn take_line(&mut self, input: &mut &[u8]) -> Result<Option<Vec<u8>>, Fail> {
        while let Some((&byte, rest)) = input.split_first() {
            *input = rest;
            if byte == b'\n' {
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                return Ok(Some(std::mem::replace(&mut self.line, Vec::new())));
            }
            self.line.push(byte);
            if self.line.len() > 1024 {
                return Err(Fail::Protocol {
                    details: "chunk header line too long",
                });
            }
        }
        Ok(None)
    }
}

//==============================================================================
// Request Execution
//==============================================================================

fn parse_location(location: &str, host: &str, port: u16) -> (String, u16, String) {
    if let Some(rest) = location.strip_prefix("http://") {
        let mut parts = rest.splitn(2, '/');
        let authority = parts.next().unwrap_or("");
        let path = format!("/{}", parts.next().unwrap_or(""));
        let (new_host, new_port) = split_host_port(authority);
        (new_host.to_string(), new_port.unwrap_or(80), path)
    } else {
        (host.to_string(), port, location.to_string())
    }
}

async fn read_response<S: StreamHandle>(stream: &S) -> Result<(ResponseHead, Bytes), Fail> {
    let mut parser = HeadParser::new();
    let (head, leftover) = loop {
        let buf = stream.pop().await?;
        if buf.is_empty() {
            return Err(Fail::RemoteClosed {});
        }
        if let Some(parsed) = parser.feed(&buf)? {
            break parsed;
        }
    };
    let framing = head.body_framing();
    let mut decoder = BodyDecoder::new(framing);
    let mut out = BytesMut::new();
    let mut done = decoder.feed(&leftover, &mut out)?;
    while !done {
        let buf = stream.pop().await?;
        if buf.is_empty() {
            if framing == BodyFraming::Eof {
                break;
            }
            return Err(Fail::RemoteClosed {});
        }
        done = decoder.feed(&buf, &mut out)?;
    }
    Ok((head, out.freeze()))
}

async fn run_request<RT: Runtime>(
    rt: RT,
    mut host: String,
    mut port: u16,
    req: HttpRequest,
    max_redirects: u32,
) -> Result<HttpResponse, Fail> {
    let mut path = req.path.clone();
    let mut redirects = 0;
    loop {
        let stream = rt.connect(&host, port).await?;
        let mut attempt = req.clone();
        attempt.path = path.clone();
        stream.push(encode_request(&attempt, &host, port)).await?;
        let (head, body) = read_response(&stream).await?;
        stream.close();
        if matches!(head.status, 301 | 302 | 303 | 307 | 308) {
            if let Some(location) = head.header("location") {
                redirects += 1;
                if redirects > max_redirects {
                    return Err(Fail::TooManyRedirects {});
                }
                let (next_host, next_port, next_path) = parse_location(location, &host, port);
                debug!("redirect {} -> {}:{}{}", head.status, next_host, next_port, next_path);
                host = next_host;
                port = next_port;
                path = next_path;
                continue;
            }
        }
        return Ok(HttpResponse {
            status: head.status,
            headers: head.headers,
            body,
        });
    }
}

/// Executes one HTTP request bounded by a deadline and a cancellation cell.
pub(crate) async fn execute<RT: Runtime>(
    rt: RT,
    host: String,
    port: u16,
    req: HttpRequest,
    deadline: Instant,
    max_redirects: u32,
    cancel: WatchedValue<bool>,
) -> Result<HttpResponse, Fail> {
    let work = run_request(rt.clone(), host, port, req, max_redirects).fuse();
    let deadline_fut = rt.wait_until(deadline).fuse();
    let (_, cancel_changed) = cancel.watch();
    let mut cancel_changed = cancel_changed.fuse();
    futures::pin_mut!(work, deadline_fut);
    futures::select_biased! {
        _ = cancel_changed => Err(Fail::Canceled {}),
        _ = deadline_fut => Err(Fail::Timedout {}),
        result = work => result,
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
