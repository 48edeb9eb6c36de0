use crate::errproto;
use crate::error::{Error, Result};

use std::collections::BTreeMap;
use std::fmt::Display;

/// A peer protocol frame: a method line, a set of name/value headers, and an
/// opaque body. On the wire this is the method line, one `Name: value` line
/// per header, a blank line, then the body. A `Content-Length` header is
/// emitted on serialization so that frames can be concatenated and re-split;
/// synchronize payloads nest whole frames inside the body this way.
///
/// Every outbound frame is stamped with the sender's `CommitCount` and `Hash`
/// (unless already set) before it leaves the node, so any message doubles as
/// a freshness report.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// The method line, e.g. BEGIN_TRANSACTION.
    pub method: String,
    /// Header name → value. Values are textual; numeric fields are parsed
    /// on access via the calc helpers.
    headers: BTreeMap<String, String>,
    /// The opaque body, often SQL text or a nested frame.
    pub body: Vec<u8>,
}

impl Message {
    /// Creates an empty message with the given method.
    pub fn new(method: impl Into<String>) -> Self {
        Message { method: method.into(), headers: BTreeMap::new(), body: Vec::new() }
    }

    /// Sets a header, formatting the value via Display.
    pub fn set(&mut self, name: &str, value: impl Display) {
        self.headers.insert(name.into(), value.to_string());
    }

    /// Builder-style set().
    pub fn with(mut self, name: &str, value: impl Display) -> Self {
        self.set(name, value);
        self
    }

    /// Builder-style body assignment.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Fetches a header value, if set.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    /// Returns true if the header is set (even to an empty string).
    pub fn has(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// Fetches a required header, or errors with a protocol violation.
    pub fn req(&self, name: &str) -> Result<&str> {
        match self.headers.get(name) {
            Some(value) => Ok(value.as_str()),
            None => errproto!("missing {name}"),
        }
    }

    /// Fetches a required numeric header.
    pub fn req_u64(&self, name: &str) -> Result<u64> {
        let value = self.req(name)?;
        value.parse().or_else(|_| errproto!("invalid {name} '{value}'"))
    }

    /// Parses a numeric header, defaulting to 0 when missing or malformed.
    pub fn calc_u64(&self, name: &str) -> u64 {
        self.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// Parses a signed numeric header, defaulting to 0.
    pub fn calc_i64(&self, name: &str) -> i64 {
        self.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// The body as UTF-8 text.
    pub fn body_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).or_else(|e| errproto!("non-UTF-8 body: {e}"))
    }

    /// Serializes the frame. Content-Length is always included, computed from
    /// the body, so the result can be concatenated with other frames.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.extend_from_slice(format!("Content-Length: {}\n", self.body.len()).as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }

    /// Parses one frame from the front of the buffer, returning it and the
    /// number of bytes consumed. Errors if the buffer does not contain a
    /// complete, well-formed frame.
    pub fn parse(data: &[u8]) -> Result<(Message, usize)> {
        /// Takes the next newline-terminated line, advancing the position.
        fn take_line<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a str> {
            let start = *pos;
            let end = data[start..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| start + i)
                .ok_or_else(|| Error::Protocol("truncated frame".into()))?;
            *pos = end + 1;
            std::str::from_utf8(&data[start..end]).or_else(|e| errproto!("non-UTF-8 frame: {e}"))
        }

        let mut pos = 0;
        let method = take_line(data, &mut pos)?;
        if method.is_empty() || method.contains(':') {
            return errproto!("invalid method line '{method}'");
        }

        let mut message = Message::new(method);
        let mut content_length = 0;
        loop {
            let header = take_line(data, &mut pos)?;
            if header.is_empty() {
                break;
            }
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| Error::Protocol(format!("invalid header '{header}'")))?;
            let value = value.trim_start();
            if name == "Content-Length" {
                content_length =
                    value.parse().or_else(|_| errproto!("invalid Content-Length '{value}'"))?;
            } else {
                message.set(name, value);
            }
        }

        if data.len() < pos + content_length {
            return errproto!("truncated body: want {content_length} bytes");
        }
        message.body = data[pos..pos + content_length].to_vec();
        Ok((message, pos + content_length))
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.method)?;
        for (name, value) in &self.headers {
            write!(f, " {name}={value}")?;
        }
        if !self.body.is_empty() {
            write!(f, " [{} byte body]", self.body.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let msg = Message::new("BEGIN_TRANSACTION")
            .with("NewCount", 7)
            .with("NewHash", "a1b2")
            .with("ID", "7")
            .with_body("UPDATE accounts SET balance = 10");
        let bytes = msg.serialize();
        let (parsed, len) = Message::parse(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(parsed, msg);
        assert_eq!(parsed.calc_u64("NewCount"), 7);
        assert_eq!(parsed.body_str().unwrap(), "UPDATE accounts SET balance = 10");
    }

    #[test]
    fn empty_body_roundtrip() {
        let msg = Message::new("SUBSCRIBE");
        let bytes = msg.serialize();
        let (parsed, len) = Message::parse(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn nested_frames() {
        // Synchronize payloads concatenate COMMIT frames inside a body.
        let commit1 = Message::new("COMMIT").with("CommitIndex", 1).with_body("INSERT a");
        let commit2 = Message::new("COMMIT").with("CommitIndex", 2).with_body("INSERT b");
        let mut body = commit1.serialize();
        body.extend(commit2.serialize());
        let outer = Message::new("SYNCHRONIZE_RESPONSE").with("NumCommits", 2).with_body(body);

        let bytes = outer.serialize();
        let (parsed, _) = Message::parse(&bytes).unwrap();
        let (first, consumed) = Message::parse(&parsed.body).unwrap();
        let (second, rest) = Message::parse(&parsed.body[consumed..]).unwrap();
        assert_eq!(first, commit1);
        assert_eq!(second, commit2);
        assert_eq!(consumed + rest, parsed.body.len());
    }

    #[test]
    fn required_headers() {
        let msg = Message::new("STATE").with("State", "WAITING");
        assert_eq!(msg.req("State").unwrap(), "WAITING");
        assert!(msg.req("Priority").is_err());
        assert!(msg.req_u64("State").is_err());
        assert_eq!(msg.calc_u64("Missing"), 0);
        assert_eq!(msg.calc_i64("Missing"), 0);
    }

    #[test]
    fn header_value_with_colon() {
        let msg = Message::new("STANDUP_RESPONSE").with("Reason", "peer 'b' is 'LEADING: busy'");
        let (parsed, _) = Message::parse(&msg.serialize()).unwrap();
        assert_eq!(parsed.get("Reason").unwrap(), "peer 'b' is 'LEADING: busy'");
    }

    #[test]
    fn truncated() {
        let bytes = Message::new("LOGIN").with_body("xyz").serialize();
        assert!(Message::parse(&bytes[..bytes.len() - 1]).is_err());
        assert!(Message::parse(b"LOGIN\nPriority 1\n\n").is_err());
        assert!(Message::parse(b"\n\n").is_err());
    }
}
