use bytes::Bytes;

use crate::message::headers::{SipHeaders, hdr};

/// MIME boundary used when serializing multipart bodies.
pub const MULTIPART_BOUNDARY: &str = "uniqueBoundary";

/// The body content types the stack understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyType {
    Sdp,
    SipFrag,
    Dtmf,
    DtmfRelay,
    SimpleMsgSummary,
    Pidf,
    PlainText,
    Isup,
}

impl BodyType {
    /// Maps a `Content-Type` value (without parameters) to a body type.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let bt = match value.trim().to_ascii_lowercase().as_str() {
            "application/sdp" => BodyType::Sdp,
            "message/sipfrag" => BodyType::SipFrag,
            "application/dtmf" => BodyType::Dtmf,
            "application/dtmf-relay" => BodyType::DtmfRelay,
            "application/simple-message-summary" => BodyType::SimpleMsgSummary,
            "application/pidf+xml" => BodyType::Pidf,
            "text/plain" => BodyType::PlainText,
            "application/isup" => BodyType::Isup,
            _ => return None,
        };
        Some(bt)
    }

    pub const fn content_type(&self) -> &'static str {
        match self {
            BodyType::Sdp => "application/sdp",
            BodyType::SipFrag => "message/sipfrag",
            BodyType::Dtmf => "application/dtmf",
            BodyType::DtmfRelay => "application/dtmf-relay",
            BodyType::SimpleMsgSummary => "application/simple-message-summary",
            BodyType::Pidf => "application/pidf+xml",
            BodyType::PlainText => "text/plain",
            BodyType::Isup => "application/isup",
        }
    }
}

/// One part of a (possibly multipart) message body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentPart {
    pub headers: SipHeaders,
    pub bytes: Bytes,
}

impl ContentPart {
    pub fn new(bt: BodyType, bytes: impl Into<Bytes>) -> Self {
        let mut headers = SipHeaders::new();
        headers.add(hdr::CONTENT_TYPE, bt.content_type());
        Self {
            headers,
            bytes: bytes.into(),
        }
    }
}

/// A message body partitioned by MIME type.
///
/// Single-part bodies serialize flat; two or more parts serialize as
/// `multipart/mixed`. A part whose content type was unknown at parse
/// time is not retained, only flagged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBody {
    parts: Vec<(BodyType, ContentPart)>,
    has_unknown_part: bool,
}

impl MessageBody {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(bt: BodyType, bytes: impl Into<Bytes>) -> Self {
        let mut body = Self::default();
        body.insert(bt, ContentPart::new(bt, bytes));
        body
    }

    /// Inserts or replaces the part of the given type.
    pub fn insert(&mut self, bt: BodyType, part: ContentPart) {
        if let Some(slot) = self.parts.iter_mut().find(|(t, _)| *t == bt) {
            slot.1 = part;
        } else {
            self.parts.push((bt, part));
        }
    }

    pub fn get(&self, bt: BodyType) -> Option<&ContentPart> {
        self.parts.iter().find(|(t, _)| *t == bt).map(|(_, p)| p)
    }

    pub fn parts(&self) -> impl Iterator<Item = (BodyType, &ContentPart)> {
        self.parts.iter().map(|(t, p)| (*t, p))
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn contains_sdp(&self) -> bool {
        self.get(BodyType::Sdp).is_some()
    }

    pub fn sdp_bytes(&self) -> Option<&Bytes> {
        self.get(BodyType::Sdp).map(|p| &p.bytes)
    }

    /// Replaces the SDP part payload, keeping the part headers.
    pub fn set_sdp(&mut self, bytes: impl Into<Bytes>) {
        self.insert(BodyType::Sdp, ContentPart::new(BodyType::Sdp, bytes));
    }

    /// Drops every part except `bt`. Returns false when no part of
    /// that type remains afterwards.
    pub fn keep_only(&mut self, bt: BodyType) -> bool {
        self.parts.retain(|(t, _)| *t == bt);
        !self.parts.is_empty()
    }

    pub fn set_unknown_part(&mut self) {
        self.has_unknown_part = true;
    }

    pub fn has_unknown_part(&self) -> bool {
        self.has_unknown_part
    }

    /// Renders the body to wire bytes. Single parts are written flat,
    /// several parts as `multipart/mixed` with the fixed boundary.
    pub fn to_wire(&self) -> Bytes {
        match self.parts.len() {
            0 => Bytes::new(),
            1 => self.parts[0].1.bytes.clone(),
            _ => {
                let mut out = Vec::with_capacity(512);
                for (_, part) in &self.parts {
                    out.extend_from_slice(b"--");
                    out.extend_from_slice(MULTIPART_BOUNDARY.as_bytes());
                    out.extend_from_slice(b"\r\n");
                    for (name, value) in part.headers.iter() {
                        out.extend_from_slice(crate::message::headers::canonical_name(name).as_bytes());
                        out.extend_from_slice(b": ");
                        out.extend_from_slice(value.as_bytes());
                        out.extend_from_slice(b"\r\n");
                    }
                    out.extend_from_slice(b"\r\n");
                    out.extend_from_slice(&part.bytes);
                    out.extend_from_slice(b"\r\n");
                }
                out.extend_from_slice(b"--");
                out.extend_from_slice(MULTIPART_BOUNDARY.as_bytes());
                out.extend_from_slice(b"--\r\n");
                Bytes::from(out)
            }
        }
    }

    /// The `Content-Type` value matching [`Self::to_wire`], if a body
    /// is present at all.
    pub fn wire_content_type(&self) -> Option<String> {
        match self.parts.len() {
            0 => None,
            1 => Some(self.parts[0].0.content_type().to_string()),
            _ => Some(format!("multipart/mixed;boundary={}", MULTIPART_BOUNDARY)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_part_serializes_flat() {
        let body = MessageBody::single(BodyType::Sdp, "v=0\r\n");
        assert_eq!(body.to_wire(), Bytes::from("v=0\r\n"));
        assert_eq!(body.wire_content_type().as_deref(), Some("application/sdp"));
    }

    #[test]
    fn multipart_serializes_with_boundary() {
        let mut body = MessageBody::empty();
        body.insert(BodyType::Sdp, ContentPart::new(BodyType::Sdp, "v=0\r\n"));
        body.insert(BodyType::Isup, ContentPart::new(BodyType::Isup, &b"\x01\x02"[..]));
        let wire = body.to_wire();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("--uniqueBoundary\r\n"));
        assert!(text.ends_with("--uniqueBoundary--\r\n"));
        assert!(text.contains("Content-Type: application/sdp"));
        assert!(
            body.wire_content_type()
                .unwrap()
                .starts_with("multipart/mixed;boundary=")
        );
    }

    #[test]
    fn keep_only_drops_other_parts() {
        let mut body = MessageBody::empty();
        body.insert(BodyType::Sdp, ContentPart::new(BodyType::Sdp, "v=0\r\n"));
        body.insert(BodyType::Isup, ContentPart::new(BodyType::Isup, &b"\x01"[..]));
        assert!(body.keep_only(BodyType::Sdp));
        assert_eq!(body.len(), 1);
        assert!(!body.keep_only(BodyType::Isup));
    }
}
