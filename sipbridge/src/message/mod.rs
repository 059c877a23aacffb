//! SIP message model.
//!
//! [`SipMessage`] carries the parsed start line, the header multimap,
//! the typed body parts and the quick-access fields the dialog layer
//! keeps reaching for (tags, Call-ID, CSeq, topmost Via data).

use std::fmt;
use std::net::SocketAddr;

pub mod body;
pub mod code;
pub mod headers;
pub mod method;
pub mod uri;

pub use body::{BodyType, ContentPart, MessageBody};
pub use headers::{SipHeaders, hdr, reason_headers};
pub use method::SipMethod;
pub use uri::RequestUri;

use crate::message::code::reason_phrase;

/// The start line of a SIP message.
#[derive(Debug, Clone, PartialEq)]
pub enum StartLine {
    Request {
        method: SipMethod,
        /// The raw Request-URI as received or rebuilt.
        ruri: String,
        /// Decomposed URI; populated for INVITE.
        uri: Option<RequestUri>,
    },
    Response { code: u16, reason: String },
}

impl StartLine {
    pub fn wire_line(&self) -> String {
        match self {
            StartLine::Request { method, ruri, .. } => {
                format!("{} {} SIP/2.0\r\n", method.as_str(), ruri)
            }
            StartLine::Response { code, reason } => format!("SIP/2.0 {} {}\r\n", code, reason),
        }
    }
}

/// A parsed or locally built SIP message.
#[derive(Debug, Clone, Default)]
pub struct SipMessage {
    pub start_line: Option<StartLine>,
    pub headers: SipHeaders,
    pub body: MessageBody,

    // Quick-access fields, populated by the parser for incoming
    // messages and partially by the builders for outgoing ones.
    pub from_header: String,
    pub to_header: String,
    pub pai_headers: Vec<String>,
    pub div_headers: Vec<String>,
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
    pub via_branch: String,
    pub via_udp_addr: Option<SocketAddr>,
    pub remote_contact_uri: String,
    pub max_fwds: Option<i64>,
    pub cseq_num: u32,
    pub cseq_method: Option<SipMethod>,
    pub content_length: usize,
}

impl SipMessage {
    /// A new request with a bare `sip:` URI seeded from the userpart.
    /// The host part is filled in by the dialog layer before sending.
    pub fn new_request(method: SipMethod, userpart: &str) -> Self {
        SipMessage {
            start_line: Some(StartLine::Request {
                method,
                ruri: String::new(),
                uri: Some(RequestUri {
                    scheme: "sip".into(),
                    original_userpart: userpart.into(),
                    userpart: userpart.into(),
                    ..Default::default()
                }),
            }),
            cseq_method: Some(method),
            ..Default::default()
        }
    }

    /// A new response; out-of-range codes are replaced by 400 and an
    /// empty reason gets the canonical phrase.
    pub fn new_response(code: u16, reason: &str) -> Self {
        let code = if !(100..=699).contains(&code) {
            tracing::warn!(code, "bad status code for response - replaced by 400");
            400
        } else {
            code
        };
        let reason = if reason.is_empty() {
            reason_phrase(code).to_string()
        } else {
            reason.to_string()
        };
        SipMessage {
            start_line: Some(StartLine::Response { code, reason }),
            ..Default::default()
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, Some(StartLine::Request { .. }))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start_line, Some(StartLine::Response { .. }))
    }

    /// The request method, or the CSeq method for responses.
    pub fn method(&self) -> Option<SipMethod> {
        match &self.start_line {
            Some(StartLine::Request { method, .. }) => Some(*method),
            _ => self.cseq_method,
        }
    }

    /// The response status code; `0` for requests.
    pub fn status_code(&self) -> u16 {
        match &self.start_line {
            Some(StartLine::Response { code, .. }) => *code,
            _ => 0,
        }
    }

    /// Promotes an INVITE carrying a To-tag to a re-INVITE.
    pub fn promote_to_reinvite(&mut self) {
        if let Some(StartLine::Request { method, .. }) = &mut self.start_line {
            if *method == SipMethod::Invite {
                *method = SipMethod::ReInvite;
                self.cseq_method = Some(SipMethod::ReInvite);
            }
        }
    }

    pub fn request_uri(&self) -> Option<&RequestUri> {
        match &self.start_line {
            Some(StartLine::Request { uri, .. }) => uri.as_ref(),
            _ => None,
        }
    }

    pub fn request_uri_mut(&mut self) -> Option<&mut RequestUri> {
        match &mut self.start_line {
            Some(StartLine::Request { uri, .. }) => uri.as_mut(),
            _ => None,
        }
    }

    /// Rebuilds the raw Request-URI string from the decomposed form.
    pub fn rebuild_ruri(&mut self, use_original: bool) {
        if let Some(StartLine::Request { ruri, uri: Some(uri), .. }) = &mut self.start_line {
            *ruri = uri.build(use_original);
        }
    }

    pub fn is_known_ruri_scheme(&self) -> bool {
        match &self.start_line {
            Some(StartLine::Request { uri: Some(uri), .. }) => uri::is_known_scheme(&uri.scheme),
            Some(StartLine::Request { ruri, .. }) => ruri
                .split_once(':')
                .is_some_and(|(scheme, _)| uri::is_known_scheme(scheme)),
            _ => false,
        }
    }

    /// Whether an option tag appears in `Supported` or `Require`.
    pub fn is_option_supported(&self, tag: &str) -> bool {
        self.headers.value_contains(hdr::SUPPORTED, tag) || self.is_option_required(tag)
    }

    /// Whether an option tag appears in `Require`.
    pub fn is_option_required(&self, tag: &str) -> bool {
        self.headers.value_contains(hdr::REQUIRE, tag)
    }

    pub fn contains_sdp(&self) -> bool {
        self.body.contains_sdp()
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    pub fn with_unknown_body_part(&self) -> bool {
        self.body.has_unknown_part()
    }

    /// A request without a To-tag is out-of-dialog.
    pub fn is_out_of_dialog(&self) -> bool {
        self.to_tag.is_empty()
    }

    /// Parses `RAck: <rseq> <cseq> <method>`.
    pub fn rseq_from_rack(&self) -> Option<(u32, u32, SipMethod)> {
        let rack = self.headers.value(hdr::RACK)?;
        let mut it = rack.split_ascii_whitespace();
        let rseq: u32 = it.next()?.parse().ok()?;
        let cseq: u32 = it.next()?.parse().ok()?;
        let method = SipMethod::from_name(it.next()?)?;
        Some((rseq, cseq, method))
    }

    /// Extracts the binding data of a REGISTER request from its
    /// `Contact` header.
    ///
    /// `expires` is negative when the Contact is unusable (no
    /// userpart, or no expiry anywhere on the message).
    pub fn registration_data(&self) -> RegistrationData {
        let contact = self.headers.value(hdr::CONTACT).unwrap_or_default().to_string();

        let Some(ext) = uri::uri_userpart(&contact).map(str::to_string) else {
            return RegistrationData {
                contact,
                expires: -100,
                ..Default::default()
            };
        };
        let Some(hostport) = uri::uri_hostport(&contact).map(str::to_string) else {
            return RegistrationData {
                contact,
                expires: -100,
                ..Default::default()
            };
        };

        let expires = contact
            .split(';')
            .find_map(|p| p.trim().strip_prefix("expires=").map(str::to_string))
            .or_else(|| self.headers.value(hdr::EXPIRES).map(str::to_string))
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(-1);

        RegistrationData {
            ruri: format!("sip:{}@{}", ext, hostport),
            contact,
            ext,
            ipport: hostport,
            expires,
        }
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start_line {
            Some(StartLine::Request { method, .. }) => write!(f, "{}", method),
            Some(StartLine::Response { code, .. }) => match self.cseq_method {
                Some(m) => write!(f, "{}/{}", code, m),
                None => write!(f, "{}", code),
            },
            None => write!(f, "INVALID"),
        }
    }
}

/// Contact binding extracted from a REGISTER.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationData {
    pub contact: String,
    pub ext: String,
    pub ruri: String,
    pub ipport: String,
    pub expires: i64,
}

/// Everything needed to build a stand-alone or in-dialog request.
#[derive(Debug, Clone, Default)]
pub struct RequestPack {
    pub method: Option<SipMethod>,
    pub ruri_userpart: String,
    pub from_userpart: String,
    pub custom_headers: SipHeaders,
    pub max70: bool,
    pub is_probing: bool,
}

impl RequestPack {
    pub fn new(method: SipMethod) -> Self {
        Self {
            method: Some(method),
            ..Default::default()
        }
    }
}

/// Everything needed to build a response on a transaction.
#[derive(Debug, Clone, Default)]
pub struct ResponsePack {
    pub status_code: u16,
    pub reason_phrase: String,
    pub custom_headers: SipHeaders,
    pub contact_header: String,
    /// Pre-created outgoing PRACK transaction on the peer leg that a
    /// reliable 1xx on this leg pairs with.
    pub linked_prack: Option<crate::transaction::Transaction>,
    pub prack_requested: bool,
}

impl ResponsePack {
    pub fn of(status_code: u16) -> Self {
        Self {
            status_code,
            ..Default::default()
        }
    }

    /// A response with a `Warning` diagnostic only.
    pub fn with_warning(status_code: u16, warning: &str) -> Self {
        Self {
            status_code,
            custom_headers: reason_headers(0, warning, ""),
            ..Default::default()
        }
    }

    /// A response carrying both reason phrase and warning text.
    pub fn with_reason_warning(status_code: u16, reason_phrase: &str, warning: &str) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase.into(),
            custom_headers: reason_headers(0, warning, ""),
            ..Default::default()
        }
    }

    /// A response with a Q.850 (or SIP) cause and detail text.
    pub fn with_q850(status_code: u16, cause: u16, details: &str) -> Self {
        Self {
            status_code,
            custom_headers: reason_headers(cause, details, ""),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_code_is_sanitized() {
        let msg = SipMessage::new_response(799, "");
        assert_eq!(msg.status_code(), 400);
        let msg = SipMessage::new_response(487, "");
        assert_matches!(
            msg.start_line,
            Some(StartLine::Response { ref reason, .. }) if reason == "Request Terminated"
        );
    }

    #[test]
    fn registration_data_extraction() {
        let mut msg = SipMessage::default();
        msg.headers.add(
            hdr::CONTACT,
            "<sip:2001@1.2.3.4:5080>;expires=300;+sip.instance=\"<urn:uuid:x>\"",
        );
        let reg = msg.registration_data();
        assert_eq!(reg.ext, "2001");
        assert_eq!(reg.ipport, "1.2.3.4:5080");
        assert_eq!(reg.expires, 300);
        assert_eq!(reg.ruri, "sip:2001@1.2.3.4:5080");
    }

    #[test]
    fn registration_data_without_userpart_is_rejected() {
        let mut msg = SipMessage::default();
        msg.headers.add(hdr::CONTACT, "<sip:172.20.40.132:45076>;transport=UDP");
        assert_eq!(msg.registration_data().expires, -100);
    }

    #[test]
    fn registration_expires_falls_back_to_header() {
        let mut msg = SipMessage::default();
        msg.headers.add(hdr::CONTACT, "<sip:2001@1.2.3.4:5080>");
        msg.headers.add(hdr::EXPIRES, "600");
        assert_eq!(msg.registration_data().expires, 600);
    }

    #[test]
    fn rack_parsing() {
        let mut msg = SipMessage::default();
        msg.headers.add(hdr::RACK, "1 42 INVITE");
        assert_eq!(msg.rseq_from_rack(), Some((1, 42, SipMethod::Invite)));
        msg.headers.set(hdr::RACK, "nonsense");
        assert_eq!(msg.rseq_from_rack(), None);
    }
}
