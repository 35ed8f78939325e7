//! The SIP message type and its wire codec.
//!
//! Parsing either produces one fully-populated, structurally valid
//! `SipMessage` or fails with `Error::MalformedMessage` — there is no
//! partially-parsed intermediate state for callers to inspect.

use std::collections::HashMap;
use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { status: u16, reason: String },
}

/// A single Via header value, parsed enough to read/rewrite the `received`
/// and `rport` parameters the NAT helper needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub protocol: String,
    pub sent_by: String,
    pub branch: String,
    pub received: Option<String>,
    pub rport: Option<u16>,
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.protocol, self.sent_by)?;
        if let Some(r) = &self.received {
            write!(f, ";received={r}")?;
        }
        if let Some(p) = self.rport {
            write!(f, ";rport={p}")?;
        }
        write!(f, ";branch={}", self.branch)
    }
}

impl ViaHeader {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(2, ' ');
        let proto_part = parts
            .next()
            .ok_or_else(|| Error::malformed("empty Via header"))?;
        let rest = parts
            .next()
            .ok_or_else(|| Error::malformed("Via header missing sent-by"))?;

        let protocol = proto_part
            .rsplit('/')
            .next()
            .ok_or_else(|| Error::malformed("Via header missing transport"))?
            .to_string();

        let mut segments = rest.split(';');
        let sent_by = segments
            .next()
            .ok_or_else(|| Error::malformed("Via header missing sent-by"))?
            .trim()
            .to_string();

        let mut branch = String::new();
        let mut received = None;
        let mut rport = None;
        for seg in segments {
            let seg = seg.trim();
            if let Some(v) = seg.strip_prefix("branch=") {
                branch = v.to_string();
            } else if let Some(v) = seg.strip_prefix("received=") {
                received = Some(v.to_string());
            } else if let Some(v) = seg.strip_prefix("rport=") {
                rport = v.parse().ok();
            } else if seg == "rport" {
                rport = Some(0);
            }
        }

        if branch.is_empty() {
            return Err(Error::malformed("Via header missing branch parameter"));
        }

        Ok(Self {
            protocol,
            sent_by,
            branch,
            received,
            rport,
        })
    }
}

/// A parsed SIP message: request or response, with ordered headers and a raw
/// body. Headers are stored case-insensitively but original casing of the
/// first occurrence is preserved for re-serialization.
#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start_line: StartLine,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SipMessage {
    pub fn new_request(method: &str, uri: &str) -> Self {
        Self {
            start_line: StartLine::Request {
                method: method.to_string(),
                uri: uri.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn new_response(status: u16, reason: &str) -> Self {
        Self {
            start_line: StartLine::Response {
                status,
                reason: reason.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.add_header(name, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn call_id(&self) -> Result<&str> {
        self.header("Call-ID")
            .ok_or_else(|| Error::malformed("missing Call-ID header"))
    }

    pub fn cseq(&self) -> Result<(u32, String)> {
        let raw = self
            .header("CSeq")
            .ok_or_else(|| Error::malformed("missing CSeq header"))?;
        let mut parts = raw.trim().splitn(2, ' ');
        let num: u32 = parts
            .next()
            .ok_or_else(|| Error::malformed("malformed CSeq header"))?
            .parse()
            .map_err(|_| Error::malformed("non-numeric CSeq"))?;
        let method = parts
            .next()
            .ok_or_else(|| Error::malformed("malformed CSeq header"))?
            .to_string();
        Ok((num, method))
    }

    pub fn top_via(&self) -> Result<ViaHeader> {
        let raw = self
            .header("Via")
            .ok_or_else(|| Error::malformed("missing Via header"))?;
        ViaHeader::parse(raw)
    }

    pub fn max_forwards(&self) -> Option<u8> {
        self.header("Max-Forwards").and_then(|v| v.trim().parse().ok())
    }

    pub fn tag_from(header_value: &str) -> Option<String> {
        header_value
            .split(';')
            .find_map(|seg| seg.trim().strip_prefix("tag=").map(|v| v.to_string()))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header("From").and_then(Self::tag_from)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(Self::tag_from)
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::malformed("message is not valid UTF-8"))?;

        let sep = text
            .find("\r\n\r\n")
            .or_else(|| text.find("\n\n"))
            .ok_or_else(|| Error::malformed("missing header/body separator"))?;
        let (head, rest) = text.split_at(sep);
        let body_start = if rest.starts_with("\r\n\r\n") { sep + 4 } else { sep + 2 };
        let body = raw[body_start.min(raw.len())..].to_vec();

        let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));
        let start = lines
            .next()
            .ok_or_else(|| Error::malformed("empty message"))?;

        let start_line = parse_start_line(start)?;

        let mut headers = Vec::new();
        let mut pending: Option<(String, String)> = None;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = pending.as_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((name, value)) = pending.take() {
                headers.push((name, value));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::malformed(format!("malformed header line: {line}")))?;
            pending = Some((expand_compact_name(name.trim()), value.trim().to_string()));
        }
        if let Some((name, value)) = pending {
            headers.push((name, value));
        }

        Ok(Self {
            start_line,
            headers,
            body,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        match &self.start_line {
            StartLine::Request { method, uri } => {
                out.push_str(&format!("{method} {uri} SIP/2.0\r\n"));
            }
            StartLine::Response { status, reason } => {
                out.push_str(&format!("SIP/2.0 {status} {reason}\r\n"));
            }
        }
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let status: u16 = parts
            .next()
            .ok_or_else(|| Error::malformed("missing status code"))?
            .parse()
            .map_err(|_| Error::malformed("non-numeric status code"))?;
        let reason = parts.next().unwrap_or("").to_string();
        return Ok(StartLine::Response { status, reason });
    }

    let mut parts = line.splitn(3, ' ');
    let method = parts
        .next()
        .ok_or_else(|| Error::malformed("empty request line"))?
        .to_string();
    let uri = parts
        .next()
        .ok_or_else(|| Error::malformed("request line missing URI"))?
        .to_string();
    let version = parts.next().unwrap_or("");
    if version != "SIP/2.0" {
        return Err(Error::malformed("unsupported SIP version"));
    }
    Ok(StartLine::Request { method, uri })
}

/// Compact header forms (RFC 3261 §7.3.3) normalized to their long form so
/// `header()` lookups don't need to special-case them.
fn expand_compact_name(name: &str) -> String {
    let expanded = match name {
        "v" => "Via",
        "f" => "From",
        "t" => "To",
        "i" => "Call-ID",
        "m" => "Contact",
        "l" => "Content-Length",
        "c" => "Content-Type",
        "s" => "Subject",
        "k" => "Supported",
        _ => return name.to_string(),
    };
    expanded.to_string()
}

/// Minimal map of header names -> canonical params, used by header builders
/// elsewhere (From/To/Contact construction) to keep tag/parameter syntax in
/// one place rather than scattered string formatting.
pub fn with_param(base: &str, key: &str, value: &str) -> String {
    format!("{base};{key}={value}")
}

pub type HeaderMap = HashMap<String, Vec<String>>;

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_INVITE: &str = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@pc33.atlanta.com>\r\n\
Content-Length: 4\r\n\
\r\n\
abcd";

    #[test]
    fn parses_request_line_and_headers() {
        let msg = SipMessage::parse(SAMPLE_INVITE.as_bytes()).unwrap();
        assert_eq!(msg.method(), Some("INVITE"));
        assert_eq!(msg.request_uri(), Some("sip:bob@biloxi.com"));
        assert_eq!(msg.call_id().unwrap(), "a84b4c76e66710@pc33.atlanta.com");
        assert_eq!(msg.cseq().unwrap(), (314159, "INVITE".to_string()));
        assert_eq!(msg.from_tag(), Some("1928301774".to_string()));
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.body, b"abcd");
    }

    #[test]
    fn parses_via_header_fields() {
        let msg = SipMessage::parse(SAMPLE_INVITE.as_bytes()).unwrap();
        let via = msg.top_via().unwrap();
        assert_eq!(via.protocol, "UDP");
        assert_eq!(via.sent_by, "pc33.atlanta.com");
        assert_eq!(via.branch, "z9hG4bK776asdhds");
    }

    #[test]
    fn rejects_message_without_separator() {
        let err = SipMessage::parse(b"INVITE sip:bob@biloxi.com SIP/2.0\r\nTo: x").unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn round_trips_response() {
        let mut resp = SipMessage::new_response(200, "OK");
        resp.add_header("Call-ID", "abc123");
        let bytes = resp.serialize();
        let reparsed = SipMessage::parse(&bytes).unwrap();
        assert_eq!(reparsed.status(), Some(200));
        assert_eq!(reparsed.call_id().unwrap(), "abc123");
    }

    #[test]
    fn expands_compact_header_names() {
        let raw = "INVITE sip:bob@biloxi.com SIP/2.0\r\ni: cid@x\r\n\r\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.call_id().unwrap(), "cid@x");
    }
}
