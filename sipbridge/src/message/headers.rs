use std::fmt;

use crate::message::code::q850;

/// Canonical header names used across the stack. Lookups are
/// case-insensitive; these exist so call sites never typo a name.
pub mod hdr {
    pub const VIA: &str = "Via";
    pub const FROM: &str = "From";
    pub const TO: &str = "To";
    pub const CALL_ID: &str = "Call-ID";
    pub const CSEQ: &str = "CSeq";
    pub const CONTACT: &str = "Contact";
    pub const MAX_FORWARDS: &str = "Max-Forwards";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const MIME_VERSION: &str = "MIME-Version";
    pub const RECORD_ROUTE: &str = "Record-Route";
    pub const ROUTE: &str = "Route";
    pub const EXPIRES: &str = "Expires";
    pub const SUPPORTED: &str = "Supported";
    pub const REQUIRE: &str = "Require";
    pub const RSEQ: &str = "RSeq";
    pub const RACK: &str = "RAck";
    pub const REASON: &str = "Reason";
    pub const WARNING: &str = "Warning";
    pub const RETRY_AFTER: &str = "Retry-After";
    pub const REFER_TO: &str = "Refer-To";
    pub const REFER_SUB: &str = "Refer-Sub";
    pub const REFERRED_BY: &str = "Referred-By";
    pub const USER_AGENT: &str = "User-Agent";
    pub const SERVER: &str = "Server";
    pub const DATE: &str = "Date";
    pub const ALLOW: &str = "Allow";
    pub const P_ASSERTED_IDENTITY: &str = "P-Asserted-Identity";
    pub const DIVERSION: &str = "Diversion";
    pub const EVENT: &str = "Event";
}

/// Identity advertised in `User-Agent`/`Server` headers.
pub const UA_NAME_VERSION: &str = "sipbridge/0.1";

/// A case-insensitive header multimap.
///
/// Keys are stored lower-cased; insertion order is preserved globally,
/// so the values of one name come back in the order they were added
/// (the invariant the Via stack depends on).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SipHeaders {
    entries: Vec<(String, String)>,
}

impl SipHeaders {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// An empty map pre-populated with the identity headers used on
    /// every locally generated message.
    pub fn with_defaults() -> Self {
        let mut headers = Self::new();
        headers.add(hdr::USER_AGENT, UA_NAME_VERSION);
        headers.add(hdr::SERVER, UA_NAME_VERSION);
        headers
    }

    /// Appends a value, preserving any values already present.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_ascii_lowercase(), value.into()));
    }

    /// Appends each of `values` in order.
    pub fn add_values<I, S>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for value in values {
            self.add(name, value);
        }
    }

    /// Replaces all values of `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.delete(name);
        self.add(name, value);
    }

    /// Removes every value of `name`; returns whether any was present.
    pub fn delete(&mut self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != lower);
        self.entries.len() != before
    }

    /// The first value of `name`, if any.
    pub fn value(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.entries.iter().find(|(k, _)| *k == lower).map(|(_, v)| v.as_str())
    }

    /// Every value of `name`, in insertion order.
    pub fn values(&self, name: &str) -> Vec<&str> {
        let lower = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == lower)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn header_count(&self, name: &str) -> usize {
        let lower = name.to_ascii_lowercase();
        self.entries.iter().filter(|(k, _)| *k == lower).count()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.header_count(name) > 0
    }

    /// All entries as `(lowercase-name, value)` pairs, insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose name starts with the given lowercase prefix
    /// (e.g. `"p-"` for the P-header family).
    pub fn with_name_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Case-insensitive substring match over the values of `name`.
    pub fn value_contains(&self, name: &str, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        self.values(name)
            .iter()
            .any(|v| v.to_ascii_lowercase().contains(&needle))
    }

    pub fn contains_to_tag(&self) -> bool {
        self.value_contains(hdr::TO, ";tag=")
    }

    /// Merges every entry of `other` into this map, appending.
    pub fn merge(&mut self, other: &SipHeaders) {
        for (k, v) in other.iter() {
            self.add(k, v);
        }
    }

    /// The mandatory header missing from this map, if any.
    ///
    /// Every message must carry From, To, CSeq, Call-ID and Via; an
    /// INVITE additionally Max-Forwards and Contact.
    pub fn missing_mandatory(&self, is_invite: bool) -> Option<&'static str> {
        const MANDATORY: [&str; 5] = [hdr::FROM, hdr::TO, hdr::CSEQ, hdr::CALL_ID, hdr::VIA];
        for name in MANDATORY {
            if !self.exists(name) {
                return Some(name);
            }
        }
        if is_invite {
            for name in [hdr::MAX_FORWARDS, hdr::CONTACT] {
                if !self.exists(name) {
                    return Some(name);
                }
            }
        }
        None
    }
}

impl fmt::Display for SipHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "{}: {}", canonical_name(name), value)?;
        }
        Ok(())
    }
}

/// Restores the canonical capitalization of a lower-cased header name.
pub fn canonical_name(lower: &str) -> String {
    match lower {
        "call-id" => hdr::CALL_ID.into(),
        "cseq" => hdr::CSEQ.into(),
        "mime-version" => hdr::MIME_VERSION.into(),
        "rseq" => hdr::RSEQ.into(),
        "rack" => hdr::RACK.into(),
        "www-authenticate" => "WWW-Authenticate".into(),
        _ => {
            let mut out = String::with_capacity(lower.len());
            let mut upper_next = true;
            for ch in lower.chars() {
                if upper_next {
                    out.extend(ch.to_uppercase());
                } else {
                    out.push(ch);
                }
                upper_next = ch == '-';
            }
            out
        }
    }
}

/// Builds the diagnostic headers attached to locally generated
/// negative responses.
///
/// `cause == 0` yields only a `Warning` (when details are given);
/// causes up to 127 encode as `Reason: Q.850;cause=N`, larger ones as
/// `Reason: SIP;cause=N`, both with an optional quoted text.
pub fn reason_headers(cause: u16, details: &str, retry_after: &str) -> SipHeaders {
    let mut headers = SipHeaders::new();
    if !retry_after.is_empty() {
        headers.add(hdr::RETRY_AFTER, retry_after);
    }
    if cause == q850::NO_CAUSE {
        if !details.trim().is_empty() {
            headers.add(hdr::WARNING, format!("399 sipbridge \"{}\"", details));
        }
    } else {
        let mut reason = if cause <= 127 {
            format!("Q.850;cause={}", cause)
        } else {
            format!("SIP;cause={}", cause)
        };
        if !details.trim().is_empty() {
            reason.push_str(&format!(";text=\"{}\"", details));
        }
        headers.add(hdr::REASON, reason);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_returns_last_set() {
        let mut h = SipHeaders::new();
        h.add("To", "<sip:a@b>");
        h.set("to", "<sip:c@d>");
        assert_eq!(h.value("TO"), Some("<sip:c@d>"));
        assert_eq!(h.header_count("to"), 1);
    }

    #[test]
    fn add_then_values_preserves_order() {
        let mut h = SipHeaders::new();
        h.add("Via", "SIP/2.0/UDP host1;branch=z9hG4bK1");
        h.add("Via", "SIP/2.0/UDP host2;branch=z9hG4bK2");
        h.add("Record-Route", "<sip:proxy>");
        let vias = h.values("via");
        assert_eq!(vias.len(), 2);
        assert!(vias[0].contains("host1"));
        assert!(vias[1].contains("host2"));
    }

    #[test]
    fn prefix_and_substring_queries() {
        let mut h = SipHeaders::new();
        h.add("P-Asserted-Identity", "<sip:+123@op>");
        h.add("Supported", "100rel, timer");
        assert_eq!(h.with_name_prefix("p-").count(), 1);
        assert!(h.value_contains("supported", "100REL"));
        assert!(!h.value_contains("supported", "norefersub"));
    }

    #[test]
    fn mandatory_header_detection() {
        let mut h = SipHeaders::new();
        h.add("From", "a");
        h.add("To", "b");
        h.add("CSeq", "1 INVITE");
        h.add("Call-ID", "x");
        assert_eq!(h.missing_mandatory(false), Some(hdr::VIA));
        h.add("Via", "SIP/2.0/UDP h");
        assert_eq!(h.missing_mandatory(false), None);
        assert_eq!(h.missing_mandatory(true), Some(hdr::MAX_FORWARDS));
    }

    #[test]
    fn reason_header_encoding() {
        let h = reason_headers(19, "No response from far end", "");
        assert_eq!(
            h.value("reason"),
            Some("Q.850;cause=19;text=\"No response from far end\"")
        );
        let h = reason_headers(480, "", "");
        assert_eq!(h.value("reason"), Some("SIP;cause=480"));
        let h = reason_headers(0, "Competing ReINVITE rejected", "");
        assert!(h.value("warning").unwrap().contains("Competing ReINVITE rejected"));
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_name("max-forwards"), "Max-Forwards");
        assert_eq!(canonical_name("cseq"), "CSeq");
        assert_eq!(canonical_name("call-id"), "Call-ID");
        assert_eq!(canonical_name("p-asserted-identity"), "P-Asserted-Identity");
    }
}
