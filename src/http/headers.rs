//! Ordered, case-insensitive header fields
//!
//! Used for request heads, response heads the connection inspects, and
//! chunked trailers. Repeated names are kept as separate fields.

use super::{Error, Result, CRLF, MAX_HEADERS};
use std::fmt;

/// Header fields in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// Append a field; fields beyond [`MAX_HEADERS`] are ignored
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.fields.len() < MAX_HEADERS {
            self.fields.push((name.into(), value.into()));
        }
    }

    fn matching<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value of `name`, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.matching(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when any value of `name` lists `token` (case-insensitive)
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.matching(name)
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    /// Drop every field called `name`, returning how many went
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|(field, _)| !field.eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Split `Name: value` at the first colon, trimming the value
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHeader(format!("missing colon: {:?}", line)))?;

        if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(Error::InvalidHeader(format!("bad field name: {:?}", name)));
        }
        Ok((name.to_string(), value.trim().to_string()))
    }

    /// Parse CRLF-separated field lines.
    ///
    /// A line starting with a space or tab continues the previous field.
    /// Blank lines are skipped.
    pub fn parse_block(block: &str) -> Result<Headers> {
        let mut parsed = Headers::new();

        for line in block.split(CRLF).filter(|line| !line.is_empty()) {
            if line.starts_with([' ', '\t']) {
                parsed.fold_into_last(line)?;
                continue;
            }
            if parsed.len() == MAX_HEADERS {
                return Err(Error::InvalidHeader(format!(
                    "more than {} header fields",
                    MAX_HEADERS
                )));
            }
            let (name, value) = Headers::parse_header_line(line)?;
            parsed.fields.push((name, value));
        }

        Ok(parsed)
    }

    fn fold_into_last(&mut self, line: &str) -> Result<()> {
        let Some((_, value)) = self.fields.last_mut() else {
            return Err(Error::InvalidHeader(format!(
                "continuation before any field: {:?}",
                line
            )));
        };

        let extra = line.trim();
        if extra.is_empty() {
            return Ok(());
        }
        if !value.is_empty() {
            value.push(' ');
        }
        value.push_str(extra);
        Ok(())
    }

    /// Serialize as `Name: value\r\n` lines onto `buf`
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.iter()
            .try_for_each(|(name, value)| writeln!(f, "{}: {}", name, value))
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut collected = Headers::new();
        iter.into_iter()
            .for_each(|(name, value)| collected.insert(name, value));
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_case() {
        let mut fields = Headers::new();
        fields.insert("Content-Type", "text/plain");

        assert_eq!(fields.get("content-type"), Some("text/plain"));
        assert_eq!(fields.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(fields.contains("Content-type"));
        assert_eq!(fields.get("Accept"), None);
    }

    #[test]
    fn test_repeated_fields_keep_order() {
        let mut fields = Headers::new();
        fields.insert("Via", "1.1 a");
        fields.insert("X-Other", "x");
        fields.insert("via", "1.1 b");

        assert_eq!(fields.get_all("VIA").collect::<Vec<_>>(), vec!["1.1 a", "1.1 b"]);
        assert_eq!(fields.get("Via"), Some("1.1 a"));
        assert_eq!(fields.remove("Via"), 2);
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn test_has_token() {
        let mut fields = Headers::new();
        fields.insert("Connection", "keep-alive, Close");
        fields.insert("Transfer-Encoding", "gzip");
        fields.insert("Transfer-Encoding", "chunked");

        assert!(fields.has_token("connection", "close"));
        assert!(fields.has_token("Transfer-Encoding", "chunked"));
        assert!(!fields.has_token("Connection", "upgrade"));
        assert!(!fields.has_token("Expect", "100-continue"));
    }

    #[test]
    fn test_field_line() {
        let (name, value) = Headers::parse_header_line("X-Trace:  abc  ").unwrap();
        assert_eq!((name.as_str(), value.as_str()), ("X-Trace", "abc"));

        let (_, value) = Headers::parse_header_line("Host:").unwrap();
        assert_eq!(value, "");

        // Colons after the first belong to the value
        let (_, value) = Headers::parse_header_line("Host: a:8080").unwrap();
        assert_eq!(value, "a:8080");

        assert!(Headers::parse_header_line("no colon").is_err());
        assert!(Headers::parse_header_line(": empty-name").is_err());
        assert!(Headers::parse_header_line("Two Words: x").is_err());
    }

    #[test]
    fn test_block_with_continuations() {
        let block = "Host: a\r\nX-Long: first\r\n  second\r\n\tthird\r\nAccept: */*\r\n\r\n";
        let fields = Headers::parse_block(block).unwrap();

        assert_eq!(fields.len(), 3);
        assert_eq!(fields.get("X-Long"), Some("first second third"));
        assert_eq!(fields.get("Accept"), Some("*/*"));
    }

    #[test]
    fn test_block_starting_with_continuation() {
        assert!(Headers::parse_block(" folded\r\nHost: a\r\n").is_err());
    }

    #[test]
    fn test_block_field_limit() {
        let block: String = (0..=MAX_HEADERS).map(|i| format!("F{}: v\r\n", i)).collect();
        assert!(matches!(
            Headers::parse_block(&block),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_wire_form() {
        let fields: Headers = [("Content-Length", "2"), ("Connection", "close")]
            .into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();

        let mut buf = Vec::new();
        fields.write_to(&mut buf);
        assert_eq!(buf, b"Content-Length: 2\r\nConnection: close\r\n");
        assert_eq!(fields.to_string(), "Content-Length: 2\nConnection: close\n");
    }
}
