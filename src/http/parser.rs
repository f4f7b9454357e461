//! Request and response head parsing
//!
//! Request heads arrive as one complete header block (the stream reads up to
//! the blank line), so request parsing works on whole blocks. Response heads
//! are written by the application in arbitrary pieces and are parsed
//! incrementally by [`ResponseHeadParser`].

use super::{Error, Headers, Method, RequestHead, ResponseHead, Result, Status, Version, CRLF};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// `METHOD target VERSION`, separated by whitespace
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let mut tokens = line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(Error::Parse(format!("malformed request line: {:?}", line)));
    };

    Ok((method.parse()?, target.to_string(), version.parse()?))
}

/// `VERSION code [reason]`; a missing reason takes the standard phrase
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let mut tokens = line.splitn(3, ' ');
    let (Some(version), Some(code)) = (tokens.next(), tokens.next()) else {
        return Err(Error::Parse(format!("malformed status line: {:?}", line)));
    };

    let code: u16 = code
        .parse()
        .map_err(|_| Error::Parse(format!("non-numeric status {:?}", code)))?;
    let status = Status::new(code)?;
    let reason = tokens
        .next()
        .map_or_else(|| status.reason_phrase().to_string(), str::to_string);

    Ok((version.parse()?, status, reason))
}

/// Split a head block into its first line and the header lines after it.
/// Blank lines before the first line are skipped; non-UTF-8 heads are refused.
fn split_head(block: &[u8]) -> Result<(&str, &str)> {
    let text = std::str::from_utf8(block)
        .map_err(|e| Error::Parse(format!("head is not valid UTF-8: {}", e)))?;
    let text = text.trim_start_matches(CRLF);

    let Some((line, rest)) = text.split_once(CRLF) else {
        return Err(Error::Parse("Header block without a start line".to_string()));
    };
    Ok((line, rest))
}

/// Parse a request start line and header block, terminator included
pub fn parse_request_head(block: &[u8]) -> Result<RequestHead> {
    let (line, rest) = split_head(block)?;
    let (method, uri, version) = parse_request_line(line)?;
    let headers = Headers::parse_block(rest)?;

    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
    })
}

/// Parse a status line and header block, terminator included
pub fn parse_response_head(block: &[u8]) -> Result<ResponseHead> {
    let (line, rest) = split_head(block)?;
    let (version, status, reason) = parse_status_line(line)?;
    let headers = Headers::parse_block(rest)?;

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

/// Incremental parser for the response head an application writes.
///
/// Interim (1xx) heads are skipped; the first final head is kept and all
/// later bytes are ignored.
#[derive(Debug)]
pub struct ResponseHeadParser {
    buffer: Vec<u8>,
    head: Option<ResponseHead>,
    failed: bool,
    max_size: usize,
}

impl ResponseHeadParser {
    pub fn new(max_size: usize) -> Self {
        ResponseHeadParser {
            buffer: Vec::new(),
            head: None,
            failed: false,
            max_size,
        }
    }

    /// Feed written bytes
    pub fn feed(&mut self, data: &[u8]) {
        if self.head.is_some() || self.failed {
            return;
        }
        self.buffer.extend_from_slice(data);

        while let Some(end) = find_head_end(&self.buffer) {
            match parse_response_head(&self.buffer[..end]) {
                Ok(head) if head.status.is_informational() => {
                    self.buffer.drain(..end);
                }
                Ok(head) => {
                    self.head = Some(head);
                    self.buffer = Vec::new();
                    return;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "unparseable response head");
                    self.fail();
                    return;
                }
            }
        }

        if self.buffer.len() > self.max_size {
            self.fail();
        }
    }

    fn fail(&mut self) {
        self.failed = true;
        self.buffer = Vec::new();
    }

    /// The final response head, once complete
    pub fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    /// Bytes did not form a response head
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Forget everything for the next response
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.head = None;
        self.failed = false;
    }
}
