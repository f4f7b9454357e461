//! Request and response heads, and the units a request is delivered in
//!
//! The connection builds [`RequestHead`]s and [`RequestUnit`]s for
//! applications. [`ResponseHead`] is both what applications may build their
//! replies with and what the connection parses back out of those replies to
//! decide keep-alive.

use super::{Error, Headers, Result, CRLF};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

const METHOD_NAMES: [(Method, &str); 9] = [
    (Method::Get, "GET"),
    (Method::Head, "HEAD"),
    (Method::Post, "POST"),
    (Method::Put, "PUT"),
    (Method::Delete, "DELETE"),
    (Method::Connect, "CONNECT"),
    (Method::Options, "OPTIONS"),
    (Method::Trace, "TRACE"),
    (Method::Patch, "PATCH"),
];

impl Method {
    pub fn as_str(&self) -> &'static str {
        METHOD_NAMES
            .iter()
            .find(|(method, _)| method == self)
            .map_or("", |(_, name)| *name)
    }
}

fn is_token(text: &str) -> bool {
    !text.is_empty()
        && text
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Method tokens are case-sensitive.
///
/// A well-formed token outside the known set yields
/// [`Error::InvalidMethod`]; anything else is a parse error.
impl FromStr for Method {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self> {
        if !is_token(token) {
            return Err(Error::Parse(format!("malformed method: {:?}", token)));
        }
        METHOD_NAMES
            .iter()
            .find(|(_, name)| *name == token)
            .map(|(method, _)| *method)
            .ok_or_else(|| Error::InvalidMethod(token.to_string()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version from a start line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self> {
        [Version::Http10, Version::Http11]
            .into_iter()
            .find(|version| version.as_str() == token)
            .ok_or_else(|| Error::InvalidVersion(token.to_string()))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-digit response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    pub const CONTINUE: Status = Status { code: 100 };
    pub const OK: Status = Status { code: 200 };
    pub const BAD_REQUEST: Status = Status { code: 400 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const PAYLOAD_TOO_LARGE: Status = Status { code: 413 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
    pub const NOT_IMPLEMENTED: Status = Status { code: 501 };

    /// Accepts 100 through 599
    pub fn new(code: u16) -> Result<Self> {
        match code {
            100..=599 => Ok(Status { code }),
            _ => Err(Error::Parse(format!("status code {} out of range", code))),
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Standard reason phrase, or `"Unknown"`
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            417 => "Expectation Failed",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }

    /// 1xx interim response
    pub fn is_informational(&self) -> bool {
        self.code < 200
    }

    pub fn is_success(&self) -> bool {
        self.code / 100 == 2
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// Start line and headers of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
}

impl RequestHead {
    /// `Transfer-Encoding` lists `chunked`
    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("Transfer-Encoding", "chunked")
    }

    /// Declared body length.
    ///
    /// Each value must be plain ASCII digits once surrounding whitespace is
    /// dropped; signs, conflicting values and overflow are an error.
    pub fn content_length(&self) -> Result<Option<usize>> {
        let mut length = None;
        for value in self.headers.get_all("Content-Length") {
            let digits = value.trim();
            let bad = || Error::InvalidHeader(format!("Bad Content-Length: {:?}", value));
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(bad());
            }
            let parsed: usize = digits.parse().map_err(|_| bad())?;
            if length.is_some_and(|l| l != parsed) {
                return Err(Error::InvalidHeader(
                    "Conflicting Content-Length values".to_string(),
                ));
            }
            length = Some(parsed);
        }
        Ok(length)
    }

    pub fn expects_continue(&self) -> bool {
        self.headers.has_token("Expect", "100-continue")
    }

    /// Client asked for the connection to be closed after this exchange
    pub fn wants_close(&self) -> bool {
        self.headers.has_token("Connection", "close")
    }

    /// A trailer block follows the last chunk
    pub fn declares_trailers(&self) -> bool {
        self.headers.contains("Trailer")
    }
}

/// Status line and headers of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: Version,
    pub status: Status,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// Response with the canonical reason phrase and no headers
    pub fn new(status: Status) -> Self {
        ResponseHead {
            version: Version::Http11,
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::new(),
        }
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Body length is delimited by `Content-Length` or chunked encoding
    pub fn is_framed(&self) -> bool {
        self.headers.contains("Content-Length")
            || self.headers.has_token("Transfer-Encoding", "chunked")
    }

    pub fn wants_close(&self) -> bool {
        self.headers.has_token("Connection", "close")
    }

    /// Status line, headers and the blank line
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(
            format!("{} {} {}", self.version, self.status.code(), self.reason).as_bytes(),
        );
        buf.extend_from_slice(CRLF.as_bytes());
        self.headers.write_to(&mut buf);
        buf.extend_from_slice(CRLF.as_bytes());
        buf
    }
}

/// One parsed chunk of a chunked request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub size: usize,
    /// Text after `;` on the size line
    pub extension: Option<String>,
    /// Chunk payload without the trailing CRLF; `None` for the last chunk
    pub data: Option<Bytes>,
}

/// What a single dispatch delivers to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestUnit {
    /// Non-chunked request; `None` when there was no body
    Full { body: Option<Bytes> },
    /// One data chunk of a chunked body
    Chunk(Chunk),
    /// Zero-size chunk with no trailers
    LastChunk(Chunk),
    /// Trailer headers following the zero-size chunk
    Trailers(Headers),
}

impl RequestUnit {
    /// No further unit follows for the current request
    pub fn is_final(&self) -> bool {
        !matches!(self, RequestUnit::Chunk(_))
    }
}

/// Fixed plain-text response the connection writes on its own
pub fn error_response(status: Status, keep_alive: bool) -> Bytes {
    let body = format!("{}\n", status);
    let mut head = ResponseHead::new(status)
        .header("Content-Type", "text/plain")
        .header("Content-Length", body.len().to_string());
    if !keep_alive {
        head = head.header("Connection", "close");
    }

    let mut wire = head.to_wire();
    wire.extend_from_slice(body.as_bytes());
    Bytes::from(wire)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_with(headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: Method::Post,
            uri: "/".to_string(),
            version: Version::Http11,
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("PATCH".parse::<Method>().unwrap(), Method::Patch);
        assert!(matches!("get".parse::<Method>(), Err(Error::InvalidMethod(_))));
        assert!(matches!("BREW".parse::<Method>(), Err(Error::InvalidMethod(_))));
        assert!(matches!("G(T".parse::<Method>(), Err(Error::Parse(_))));
        assert!(matches!("".parse::<Method>(), Err(Error::Parse(_))));
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!("HTTP/1.1".parse::<Version>().unwrap(), Version::Http11);
        assert_eq!("HTTP/1.0".parse::<Version>().unwrap(), Version::Http10);
        assert!(matches!(
            "HTTP/2.0".parse::<Version>(),
            Err(Error::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_status() {
        assert_eq!(Status::new(413).unwrap(), Status::PAYLOAD_TOO_LARGE);
        assert_eq!(Status::CONTINUE.to_string(), "100 Continue");
        assert!(Status::new(99).is_err());
        assert!(Status::new(600).is_err());
        assert!(Status::CONTINUE.is_informational());
        assert!(Status::OK.is_success());
    }

    #[test]
    fn test_request_framing() {
        let head = head_with(&[("Transfer-Encoding", "gzip, Chunked")]);
        assert!(head.is_chunked());
        assert_eq!(head.content_length().unwrap(), None);

        let head = head_with(&[("Content-Length", "12")]);
        assert!(!head.is_chunked());
        assert_eq!(head.content_length().unwrap(), Some(12));
    }

    #[test]
    fn test_bad_content_length() {
        assert!(head_with(&[("Content-Length", "-1")]).content_length().is_err());
        assert!(head_with(&[("Content-Length", "ten")]).content_length().is_err());
        assert!(head_with(&[("Content-Length", "+5")]).content_length().is_err());
        assert!(head_with(&[("Content-Length", "")]).content_length().is_err());
        assert!(head_with(&[("Content-Length", "5 5")]).content_length().is_err());
        assert!(head_with(&[("Content-Length", "99999999999999999999999")])
            .content_length()
            .is_err());
        // Surrounding whitespace is not part of the value
        assert_eq!(head_with(&[("Content-Length", " 5 ")]).content_length().unwrap(), Some(5));
        assert!(head_with(&[("Content-Length", "1"), ("Content-Length", "2")])
            .content_length()
            .is_err());
        assert_eq!(
            head_with(&[("Content-Length", "3"), ("Content-Length", "3")])
                .content_length()
                .unwrap(),
            Some(3)
        );
    }

    #[test]
    fn test_request_flags() {
        let head = head_with(&[
            ("Expect", "100-continue"),
            ("Connection", "Close"),
            ("Trailer", "X-Sum"),
        ]);
        assert!(head.expects_continue());
        assert!(head.wants_close());
        assert!(head.declares_trailers());
        assert!(!head_with(&[]).wants_close());
    }

    #[test]
    fn test_response_head_wire() {
        let head = ResponseHead::new(Status::OK).header("Content-Length", "0");
        assert_eq!(
            head.to_wire(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()
        );
        assert!(head.is_framed());
        assert!(!head.wants_close());
    }

    #[test]
    fn test_error_response() {
        let wire = error_response(Status::BAD_REQUEST, false);
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Content-Length: 16\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n400 Bad Request\n"));

        let wire = error_response(Status::PAYLOAD_TOO_LARGE, true);
        assert!(!std::str::from_utf8(&wire).unwrap().contains("Connection"));
    }

    #[test]
    fn test_unit_is_final() {
        let chunk = Chunk {
            size: 1,
            extension: None,
            data: Some(Bytes::from_static(b"a")),
        };
        assert!(!RequestUnit::Chunk(chunk.clone()).is_final());
        assert!(RequestUnit::LastChunk(chunk).is_final());
        assert!(RequestUnit::Full { body: None }.is_final());
        assert!(RequestUnit::Trailers(Headers::new()).is_final());
    }
}
