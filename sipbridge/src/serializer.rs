//! Wire codec, outbound half: renders a [`SipMessage`] to datagram
//! bytes.
//!
//! The body is rendered first so `Content-Type`, `MIME-Version` and
//! `Content-Length` always agree with the bytes actually written.
//! Headers follow a fixed preferred order per request method or
//! response class, with the P-header family last.

use bytes::{BufMut, Bytes, BytesMut};

use crate::message::{SipMessage, SipMethod, StartLine, hdr};

const INVITE_ORDER: &[&str] = &[
    "via",
    "record-route",
    "route",
    "from",
    "to",
    "call-id",
    "cseq",
    "contact",
    "max-forwards",
    "expires",
    "supported",
    "require",
    "rack",
    "diversion",
    "reason",
    "warning",
    "allow",
    "user-agent",
    "date",
];

const ACK_CANCEL_ORDER: &[&str] = &[
    "via",
    "route",
    "from",
    "to",
    "call-id",
    "cseq",
    "max-forwards",
    "reason",
    "user-agent",
    "date",
];

const REQUEST_ORDER: &[&str] = &[
    "via",
    "record-route",
    "route",
    "from",
    "to",
    "call-id",
    "cseq",
    "contact",
    "max-forwards",
    "expires",
    "supported",
    "require",
    "rack",
    "refer-to",
    "referred-by",
    "refer-sub",
    "event",
    "reason",
    "warning",
    "retry-after",
    "allow",
    "user-agent",
    "date",
];

const PROVISIONAL_ORDER: &[&str] = &[
    "via",
    "record-route",
    "from",
    "to",
    "call-id",
    "cseq",
    "contact",
    "rseq",
    "require",
    "supported",
    "refer-sub",
    "reason",
    "warning",
    "allow",
    "server",
    "date",
];

const FINAL_ORDER: &[&str] = &[
    "via",
    "record-route",
    "from",
    "to",
    "call-id",
    "cseq",
    "contact",
    "expires",
    "supported",
    "require",
    "refer-sub",
    "reason",
    "warning",
    "retry-after",
    "allow",
    "server",
    "date",
];

fn preferred_order(start_line: &StartLine) -> &'static [&'static str] {
    match start_line {
        StartLine::Request { method, .. } => match method {
            SipMethod::Invite | SipMethod::ReInvite | SipMethod::Update => INVITE_ORDER,
            SipMethod::Ack | SipMethod::Cancel => ACK_CANCEL_ORDER,
            _ => REQUEST_ORDER,
        },
        StartLine::Response { code, .. } if *code < 200 => PROVISIONAL_ORDER,
        StartLine::Response { .. } => FINAL_ORDER,
    }
}

/// Derived at serialize time, never trusted from the map.
const BODY_HEADERS: [&str; 3] = ["content-type", "mime-version", "content-length"];

/// Renders the message, fixing up the body headers first.
pub fn serialize(msg: &mut SipMessage) -> Bytes {
    let body = msg.body.to_wire();

    match msg.body.wire_content_type() {
        Some(content_type) => {
            let multipart = msg.body.len() > 1;
            msg.headers.set(hdr::CONTENT_TYPE, content_type);
            if multipart {
                msg.headers.set(hdr::MIME_VERSION, "1.0");
            } else {
                msg.headers.delete(hdr::MIME_VERSION);
            }
        }
        None => {
            msg.headers.delete(hdr::CONTENT_TYPE);
            msg.headers.delete(hdr::MIME_VERSION);
        }
    }
    msg.headers.set(hdr::CONTENT_LENGTH, body.len().to_string());

    let start_line = msg.start_line.as_ref().expect("serializing a message without a start line");

    let mut buf = BytesMut::with_capacity(if body.is_empty() { 800 } else { 1500 }).writer();
    use std::io::Write;

    let _ = write!(buf, "{}", start_line.wire_line());

    let order = preferred_order(start_line);
    let mut emitted: Vec<&str> = Vec::with_capacity(msg.headers.len());

    let mut emit = |buf: &mut bytes::buf::Writer<BytesMut>, name: &str, value: &str| {
        if value.is_empty() {
            return;
        }
        let _ = write!(buf, "{}: {}\r\n", crate::message::headers::canonical_name(name), value);
    };

    for &name in order {
        for value in msg.headers.values(name) {
            emit(&mut buf, name, value);
        }
        emitted.push(name);
    }

    // Anything not covered by the preferred order, except the
    // P-family and the body headers which come last.
    for (name, value) in msg.headers.iter() {
        if emitted.contains(&name) || name.starts_with("p-") || BODY_HEADERS.contains(&name) {
            continue;
        }
        emit(&mut buf, name, value);
    }

    for (name, value) in msg.headers.with_name_prefix("p-") {
        emit(&mut buf, name, value);
    }

    for name in BODY_HEADERS {
        for value in msg.headers.values(name) {
            emit(&mut buf, name, value);
        }
    }

    let _ = write!(buf, "\r\n");
    let mut buf = buf.into_inner();
    buf.put_slice(&body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BodyType, ContentPart, MessageBody};
    use crate::parser::parse_datagram;

    fn base_request(method: SipMethod) -> SipMessage {
        let mut msg = SipMessage::new_request(method, "bob");
        if let Some(StartLine::Request { ruri, .. }) = &mut msg.start_line {
            *ruri = "sip:bob@10.0.0.5:5060".into();
        }
        msg.headers.add(hdr::VIA, "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc");
        msg.headers.add(hdr::FROM, "<sip:a@10.0.0.1>;tag=ft");
        msg.headers.add(hdr::TO, "<sip:bob@10.0.0.5>");
        msg.headers.add(hdr::CALL_ID, "cid-1");
        msg.headers.add(hdr::CSEQ, format!("1 {}", method.as_str()));
        msg.headers.add(hdr::MAX_FORWARDS, "70");
        msg.headers.add(hdr::CONTACT, "<sip:a@10.0.0.1:5060>");
        msg
    }

    #[test]
    fn bodyless_request_has_zero_length_and_no_content_type() {
        let mut msg = base_request(SipMethod::Options);
        // A stale Content-Type must not survive serialization.
        msg.headers.add(hdr::CONTENT_TYPE, "application/sdp");
        let wire = serialize(&mut msg);
        let text = String::from_utf8_lossy(&wire);
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(!text.contains("Content-Type"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn content_length_matches_body() {
        let mut msg = base_request(SipMethod::Invite);
        msg.body = MessageBody::single(BodyType::Sdp, "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\n");
        let wire = serialize(&mut msg);
        let text = String::from_utf8_lossy(&wire);
        let body_len = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\n".len();
        assert!(text.contains(&format!("Content-Length: {}\r\n", body_len)));
        assert!(text.contains("Content-Type: application/sdp\r\n"));
        assert!(!text.contains("MIME-Version"));
    }

    #[test]
    fn via_headers_keep_wire_order() {
        let mut msg = base_request(SipMethod::Invite);
        msg.headers.add(hdr::VIA, "SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKdef");
        let wire = serialize(&mut msg);
        let text = String::from_utf8_lossy(&wire);
        let first = text.find("z9hG4bKabc").unwrap();
        let second = text.find("z9hG4bKdef").unwrap();
        assert!(first < second);
    }

    #[test]
    fn p_headers_come_after_the_preferred_block() {
        let mut msg = base_request(SipMethod::Invite);
        msg.headers.add("P-Asserted-Identity", "<sip:+123@op>");
        let wire = serialize(&mut msg);
        let text = String::from_utf8_lossy(&wire);
        let pai = text.find("P-Asserted-Identity").unwrap();
        let contact = text.find("Contact").unwrap();
        assert!(contact < pai);
    }

    #[test]
    fn multipart_round_trip_preserves_parts() {
        let mut msg = base_request(SipMethod::Invite);
        let mut body = MessageBody::empty();
        body.insert(BodyType::Sdp, ContentPart::new(BodyType::Sdp, "v=0"));
        body.insert(BodyType::Isup, ContentPart::new(BodyType::Isup, &b"\x01\x02"[..]));
        msg.body = body.clone();

        let wire = serialize(&mut msg);
        let reparsed = parse_datagram(&wire).unwrap().unwrap().msg;

        let original: Vec<_> = body.parts().map(|(t, p)| (t, p.bytes.clone())).collect();
        let round: Vec<_> = reparsed.body.parts().map(|(t, p)| (t, p.bytes.clone())).collect();
        assert_eq!(original, round);
        assert_eq!(
            reparsed.body.get(BodyType::Sdp).unwrap().headers.value("content-type"),
            Some("application/sdp")
        );
    }

    #[test]
    fn serialized_request_reparses() {
        let mut msg = base_request(SipMethod::Invite);
        msg.body = MessageBody::single(BodyType::Sdp, "v=0\r\n");
        let wire = serialize(&mut msg);
        let reparsed = parse_datagram(&wire).unwrap().unwrap().msg;
        assert_eq!(reparsed.method(), Some(SipMethod::Invite));
        assert_eq!(reparsed.call_id, "cid-1");
        assert_eq!(reparsed.cseq_num, 1);
        assert!(reparsed.contains_sdp());
    }
}
