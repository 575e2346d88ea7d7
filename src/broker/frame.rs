//! STOMP 1.1/1.2 frames and their wire codec.
//!
//! A frame is `COMMAND\n(header:value\n)*\n<body>\0`. Bare EOLs between
//! frames are heart-beats; the decoder swallows them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use secrecy::ExposeSecret;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::BrokerConfig;
use crate::error::{Error, Result};

/// Largest frame accepted from the broker.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// One STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    /// Headers in wire order. Repeated names keep the first occurrence's meaning.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of the named header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn connect(config: &BrokerConfig) -> Self {
        Frame::new("CONNECT")
            .header("accept-version", "1.1,1.2")
            .header("host", &config.vhost)
            .header("login", &config.user)
            .header("passcode", config.password.expose_secret())
            .header("client-id", &config.client_id)
            .header(
                "heart-beat",
                format!("{},{}", config.heartbeat.0, config.heartbeat.1),
            )
    }

    pub fn subscribe(destination: &str, id: &str) -> Self {
        Frame::new("SUBSCRIBE")
            .header("destination", destination)
            .header("id", id)
            .header("ack", "auto")
    }

    pub fn send(destination: &str, body: impl Into<Bytes>) -> Self {
        Frame::new("SEND")
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new("DISCONNECT").header("receipt", receipt)
    }

    /// `(cx, cy)` from a `heart-beat` header; absent or malformed means `(0, 0)`.
    pub fn heart_beat(&self) -> (u64, u64) {
        self.get("heart-beat")
            .and_then(|hb| {
                let (x, y) = hb.split_once(',')?;
                Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
            })
            .unwrap_or((0, 0))
    }

    // CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self.command.as_str(), "CONNECT" | "CONNECTED")
    }
}

/// Interval at which the client must send heart-beats, if any.
///
/// `client` is what we offered in CONNECT, `server` what CONNECTED answered.
pub fn negotiate_send_interval(client: (u64, u64), server: (u64, u64)) -> Option<u64> {
    let (cx, _) = client;
    let (_, sy) = server;
    if cx == 0 || sy == 0 {
        None
    } else {
        Some(cx.max(sy))
    }
}

/// Interval at which the broker must send heart-beats, if any.
pub fn negotiate_receive_interval(client: (u64, u64), server: (u64, u64)) -> Option<u64> {
    let (_, cy) = client;
    let (sx, _) = server;
    if cy == 0 || sx == 0 {
        None
    } else {
        Some(cy.max(sx))
    }
}

/// A bare EOL written to keep the session alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat;

/// Codec for STOMP frames over a byte stream.
///
/// Remembers how far a partial frame has been searched so bytes arriving
/// in pieces are scanned once.
#[derive(Debug, Default)]
pub struct StompCodec {
    /// Bytes of the pending header already searched for its terminator.
    head_scanned: usize,
    /// Bytes of the pending body already searched for NUL.
    body_scanned: usize,
    last_inbound: Option<Instant>,
}

impl StompCodec {
    /// When the decoder last saw any bytes, heart-beats included.
    pub fn last_inbound(&self) -> Option<Instant> {
        self.last_inbound
    }
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if !src.is_empty() {
            self.last_inbound = Some(Instant::now());
        }
        // Heart-beats.
        while let Some(&b) = src.first() {
            match b {
                b'\n' => src.advance(1),
                b'\r' if src.get(1) == Some(&b'\n') => src.advance(2),
                b'\r' if src.len() == 1 => return Ok(None),
                _ => break,
            }
        }
        if src.is_empty() {
            return Ok(None);
        }

        let from = self.head_scanned.min(src.len());
        let Some(head_end) = find(&src[from..], b"\n\n")
            .map(|i| (from + i, 2))
            .into_iter()
            .chain(find(&src[from..], b"\r\n\r\n").map(|i| (from + i, 4)))
            .min_by_key(|(i, _)| *i)
        else {
            if src.len() > MAX_FRAME_BYTES {
                return Err(Error::Broker("frame header too large".to_string()));
            }
            // A terminator may straddle the boundary.
            self.head_scanned = src.len().saturating_sub(3);
            return Ok(None);
        };
        let (head_len, sep_len) = head_end;

        let head = std::str::from_utf8(&src[..head_len])
            .map_err(|_| Error::Broker("frame header is not UTF-8".to_string()))?;
        let mut lines = head.lines();
        let command = lines
            .next()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Broker("frame has no command".to_string()))?
            .to_string();
        let escaped = !matches!(command.as_str(), "CONNECT" | "CONNECTED");

        let mut headers = Vec::new();
        for line in lines {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let Some((k, v)) = line.split_once(':') else {
                return Err(Error::Broker(format!("malformed header line: {line}")));
            };
            if escaped {
                headers.push((unescape(k)?, unescape(v)?));
            } else {
                headers.push((k.to_string(), v.to_string()));
            }
        }

        let body_start = head_len + sep_len;
        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| Error::Broker(format!("bad content-length: {v}")))
            })
            .transpose()?;

        let body_len = match content_length {
            Some(len) => {
                if len > MAX_FRAME_BYTES {
                    return Err(Error::Broker(format!("frame body too large: {len}")));
                }
                if src.len() < body_start + len + 1 {
                    src.reserve(body_start + len + 1 - src.len());
                    return Ok(None);
                }
                if src[body_start + len] != 0 {
                    return Err(Error::Broker("frame body not NUL-terminated".to_string()));
                }
                len
            }
            None => {
                let from = body_start + self.body_scanned.min(src.len() - body_start);
                match src[from..].iter().position(|&b| b == 0) {
                    Some(i) => from + i - body_start,
                    None => {
                        if src.len() > MAX_FRAME_BYTES {
                            return Err(Error::Broker("frame body too large".to_string()));
                        }
                        self.body_scanned = src.len() - body_start;
                        return Ok(None);
                    }
                }
            }
        };
        self.head_scanned = 0;
        self.body_scanned = 0;

        let mut frame_bytes = src.split_to(body_start + body_len + 1);
        frame_bytes.advance(body_start);
        frame_bytes.truncate(body_len);

        Ok(Some(Frame {
            command,
            headers,
            body: frame_bytes.freeze(),
        }))
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let escape_headers = frame.escapes_headers();
        dst.reserve(frame.command.len() + frame.body.len() + 64);
        dst.put_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');
        for (k, v) in &frame.headers {
            if escape_headers {
                dst.put_slice(escape(k).as_bytes());
                dst.put_u8(b':');
                dst.put_slice(escape(v).as_bytes());
            } else {
                dst.put_slice(k.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(v.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        if !frame.body.is_empty() && frame.get("content-length").is_none() {
            dst.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

impl Encoder<HeartBeat> for StompCodec {
    type Error = Error;

    fn encode(&mut self, _: HeartBeat, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(b'\n');
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(Error::Broker(format!(
                    "undefined header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn decodes_message_without_content_length() {
        let frames = decode_all(b"MESSAGE\ndestination:/topic/epictopic\nmessage-id:7\n\n{\"msg_type\":\"stf_gen\"}\0");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, "MESSAGE");
        assert_eq!(frames[0].get("destination"), Some("/topic/epictopic"));
        assert_eq!(frames[0].body_text(), "{\"msg_type\":\"stf_gen\"}");
    }

    #[test]
    fn content_length_allows_embedded_nul() {
        let frames = decode_all(b"MESSAGE\ncontent-length:3\n\na\0b\0");
        assert_eq!(frames[0].body.as_ref(), b"a\0b");
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\ndestination:/q\n\nhal"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"f\0");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.body_text(), "half");
        assert!(buf.is_empty());
    }

    #[test]
    fn heart_beats_between_frames_are_skipped() {
        let frames = decode_all(b"\n\r\n\nRECEIPT\nreceipt-id:1\n\n\0\n\nERROR\nmessage:bad\n\n\0");
        let commands: Vec<_> = frames.iter().map(|f| f.command.as_str()).collect();
        assert_eq!(commands, ["RECEIPT", "ERROR"]);
    }

    #[test]
    fn crlf_frames_decode() {
        let frames = decode_all(b"CONNECTED\r\nversion:1.2\r\nheart-beat:0,5000\r\n\r\n\0");
        assert_eq!(frames[0].get("version"), Some("1.2"));
        assert_eq!(frames[0].heart_beat(), (0, 5000));
    }

    #[test]
    fn header_escapes_survive_the_wire() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame::new("MESSAGE").header("note", "a:b\\c\nd");
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert!(buf.starts_with(b"MESSAGE\nnote:a\\cb\\\\c\\nd\n"));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn connect_headers_are_not_escaped() {
        let mut config = BrokerConfig::local("broker:host", 61612);
        config.client_id = "swf:monitor".to_string();
        let mut buf = BytesMut::new();
        StompCodec::default().encode(Frame::connect(&config), &mut buf).unwrap();
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("CONNECT\naccept-version:1.1,1.2\nhost:broker:host\n"));
        assert!(text.contains("client-id:swf:monitor\n"));
        assert!(text.contains("heart-beat:5000,10000\n"));
    }

    #[test]
    fn send_frames_carry_content_length() {
        let mut buf = BytesMut::new();
        StompCodec::default()
            .encode(Frame::send("/queue/workflow_control", "{}"), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.contains("content-length:2\n\n{}\0"));
    }

    #[test]
    fn undefined_escape_is_rejected() {
        let mut buf = BytesMut::from(&b"MESSAGE\nbad:\\t\n\n\0"[..]);
        assert!(StompCodec::default().decode(&mut buf).is_err());
    }

    #[test]
    fn heart_beat_negotiation() {
        assert_eq!(negotiate_send_interval((5000, 10000), (0, 4000)), Some(5000));
        assert_eq!(negotiate_send_interval((5000, 10000), (0, 8000)), Some(8000));
        assert_eq!(negotiate_send_interval((5000, 10000), (10000, 0)), None);
        assert_eq!(negotiate_send_interval((0, 10000), (0, 8000)), None);

        assert_eq!(negotiate_receive_interval((5000, 10000), (4000, 0)), Some(10000));
        assert_eq!(negotiate_receive_interval((5000, 10000), (15000, 0)), Some(15000));
        assert_eq!(negotiate_receive_interval((5000, 10000), (0, 4000)), None);
        assert_eq!(negotiate_receive_interval((5000, 0), (4000, 0)), None);
    }

    #[test]
    fn frames_split_across_many_reads() {
        let wire: &[u8] = b"MESSAGE\r\ndestination:/topic/epictopic\r\n\r\n{\"filename\":\"a.stf\"}\0RECEIPT\nreceipt-id:9\n\n\0";
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(2) {
            buf.extend_from_slice(chunk);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].get("destination"), Some("/topic/epictopic"));
        assert_eq!(frames[0].body_text(), "{\"filename\":\"a.stf\"}");
        assert_eq!(frames[1].get("receipt-id"), Some("9"));
        assert!(buf.is_empty());
    }

    #[test]
    fn heart_beats_count_as_inbound() {
        let mut codec = StompCodec::default();
        assert!(codec.last_inbound().is_none());
        let mut buf = BytesMut::from(&b"\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert!(codec.last_inbound().is_some());
    }
}
