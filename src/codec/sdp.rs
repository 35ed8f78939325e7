//! A minimal, structured SDP type: construction either succeeds completely
//! or fails with `MalformedMessage`.
//!
//! Only the fields the B2BUA and media-session layers actually touch are
//! modeled: the session-level connection line, the origin line (for the
//! rewrite-in-place semantics re-INVITEs need), and each media section's
//! `m=`/`c=` pair. Unrecognized lines are preserved verbatim and re-emitted
//! in order, so rewriting never loses attributes (e.g. `a=rtpmap`, `a=ptime`)
//! it doesn't understand.

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLine {
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl ConnectionLine {
    fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let net_type = parts
            .next()
            .ok_or_else(|| Error::malformed("malformed c= line"))?
            .to_string();
        let addr_type = parts
            .next()
            .ok_or_else(|| Error::malformed("malformed c= line"))?
            .to_string();
        let address = parts
            .next()
            .ok_or_else(|| Error::malformed("malformed c= line"))?
            .to_string();
        Ok(Self {
            net_type,
            addr_type,
            address,
        })
    }

    fn render(&self) -> String {
        format!("c={} {} {}", self.net_type, self.addr_type, self.address)
    }
}

#[derive(Debug, Clone)]
pub struct MediaSection {
    /// Raw `m=` line fields: media type, port, proto, format list.
    pub media: String,
    pub port: u16,
    pub proto: String,
    pub formats: String,
    pub connection: Option<ConnectionLine>,
    /// Every other line belonging to this section (`a=`, `b=`, ...), verbatim.
    pub other_lines: Vec<String>,
}

impl MediaSection {
    fn render(&self) -> String {
        let mut out = format!("m={} {} {} {}\r\n", self.media, self.port, self.proto, self.formats);
        if let Some(c) = &self.connection {
            out.push_str(&c.render());
            out.push_str("\r\n");
        }
        for line in &self.other_lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub origin: String,
    pub session_name: String,
    pub session_connection: Option<ConnectionLine>,
    pub time: String,
    pub session_other_lines: Vec<String>,
    pub media: Vec<MediaSection>,
}

impl SessionDescription {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body).map_err(|_| Error::malformed("SDP is not UTF-8"))?;

        let mut origin = None;
        let mut session_name = String::new();
        let mut session_connection = None;
        let mut time = String::new();
        let mut session_other_lines = Vec::new();
        let mut media: Vec<MediaSection> = Vec::new();

        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (tag, value) = line
                .split_once('=')
                .ok_or_else(|| Error::malformed(format!("malformed SDP line: {line}")))?;

            if tag == "m" {
                let mut parts = value.splitn(4, ' ');
                let media_type = parts
                    .next()
                    .ok_or_else(|| Error::malformed("malformed m= line"))?
                    .to_string();
                let port: u16 = parts
                    .next()
                    .ok_or_else(|| Error::malformed("malformed m= line"))?
                    .parse()
                    .map_err(|_| Error::malformed("non-numeric media port"))?;
                let proto = parts
                    .next()
                    .ok_or_else(|| Error::malformed("malformed m= line"))?
                    .to_string();
                let formats = parts.next().unwrap_or("").to_string();
                media.push(MediaSection {
                    media: media_type,
                    port,
                    proto,
                    formats,
                    connection: None,
                    other_lines: Vec::new(),
                });
                continue;
            }

            if let Some(section) = media.last_mut() {
                if tag == "c" {
                    section.connection = Some(ConnectionLine::parse(value)?);
                } else {
                    section.other_lines.push(line.to_string());
                }
                continue;
            }

            match tag {
                "o" => origin = Some(value.to_string()),
                "s" => session_name = value.to_string(),
                "c" => session_connection = Some(ConnectionLine::parse(value)?),
                "t" => time = value.to_string(),
                _ => session_other_lines.push(line.to_string()),
            }
        }

        let origin = origin.ok_or_else(|| Error::malformed("SDP missing o= line"))?;
        if media.is_empty() {
            return Err(Error::malformed("SDP has no media sections"));
        }

        Ok(Self {
            origin,
            session_name,
            session_connection,
            time,
            session_other_lines,
            media,
        })
    }

    pub fn render(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str("v=0\r\n");
        out.push_str(&format!("o={}\r\n", self.origin));
        out.push_str(&format!("s={}\r\n", self.session_name));
        if let Some(c) = &self.session_connection {
            out.push_str(&c.render());
            out.push_str("\r\n");
        }
        out.push_str(&format!("t={}\r\n", self.time));
        for line in &self.session_other_lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        for section in &self.media {
            out.push_str(&section.render());
        }
        out.into_bytes()
    }

    /// Rewrites every connection address (session-level and per-media) in
    /// place to `new_addr`, and every media port to the corresponding entry
    /// in `new_ports` (by media-section index). Used both for NAT rewriting
    /// and for splicing in the RTPProxy-allocated relay address.
    pub fn rewrite_media(&mut self, new_addr: &str, new_ports: &[u16]) {
        if let Some(c) = self.session_connection.as_mut() {
            c.address = new_addr.to_string();
        }
        for (i, section) in self.media.iter_mut().enumerate() {
            if let Some(c) = section.connection.as_mut() {
                c.address = new_addr.to_string();
            }
            if let Some(port) = new_ports.get(i) {
                section.port = *port;
            }
        }
    }

    pub fn first_media_port(&self) -> Option<u16> {
        self.media.first().map(|m| m.port)
    }

    pub fn connection_address(&self) -> Option<&str> {
        self.media
            .first()
            .and_then(|m| m.connection.as_ref())
            .or(self.session_connection.as_ref())
            .map(|c| c.address.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "v=0\r\n\
o=alice 2890844526 2890844526 IN IP4 10.1.1.5\r\n\
s=-\r\n\
c=IN IP4 10.1.1.5\r\n\
t=0 0\r\n\
m=audio 49170 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

    #[test]
    fn parses_session_and_media() {
        let sdp = SessionDescription::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(sdp.connection_address(), Some("10.1.1.5"));
        assert_eq!(sdp.first_media_port(), Some(49170));
        assert_eq!(sdp.media[0].other_lines, vec!["a=rtpmap:0 PCMU/8000"]);
    }

    #[test]
    fn rewrite_media_updates_all_connection_lines() {
        let mut sdp = SessionDescription::parse(SAMPLE.as_bytes()).unwrap();
        sdp.rewrite_media("203.0.113.9", &[40000]);
        assert_eq!(sdp.connection_address(), Some("203.0.113.9"));
        assert_eq!(sdp.first_media_port(), Some(40000));
        let rendered = String::from_utf8(sdp.render()).unwrap();
        assert!(rendered.contains("c=IN IP4 203.0.113.9"));
        assert!(rendered.contains("m=audio 40000 RTP/AVP 0"));
    }

    #[test]
    fn rejects_sdp_without_media() {
        let err = SessionDescription::parse(b"v=0\r\no=a 1 1 IN IP4 1.2.3.4\r\ns=-\r\nt=0 0\r\n")
            .unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }
}
