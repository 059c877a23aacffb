//! Wire codec, inbound half: one UDP datagram in, a populated
//! [`SipMessage`] out, plus the count of consumed bytes so a
//! pipelined follow-on PDU in the same datagram is not lost.

use std::net::SocketAddr;
use std::str;

use crate::error::{Result, SipParseError};
use crate::message::{
    BodyType, ContentPart, MessageBody, RequestUri, SipMessage, SipMethod, StartLine, hdr,
};

/// RFC 3261 Via branch magic cookie.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// Default SIP port assumed when a sent-by has none.
pub const SIP_PORT: u16 = 5060;

const CRLF_CRLF: &[u8] = b"\r\n\r\n";

/// A successfully parsed PDU and how many bytes of the datagram it
/// consumed.
#[derive(Debug)]
pub struct ParsedPdu {
    pub msg: SipMessage,
    pub consumed: usize,
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn err<T>(message: &str) -> Result<T> {
    Err(SipParseError::new(message).into())
}

/// Parses one SIP PDU out of a datagram.
///
/// Returns `Ok(None)` for an empty or keep-alive payload (no header
/// terminator present). Everything structurally wrong is an error and
/// the caller drops the PDU.
pub fn parse_datagram(payload: &[u8]) -> Result<Option<ParsedPdu>> {
    let Some(sep) = find(payload, CRLF_CRLF, 0) else {
        return Ok(None);
    };

    let head = str::from_utf8(&payload[..sep]).map_err(SipParseError::from)?;
    let mut lines = head.split("\r\n");

    let start = lines.next().unwrap_or_default();
    let mut msg = parse_start_line(start)?;

    parse_headers(&mut msg, lines)?;

    let is_invite_class = matches!(
        msg.start_line,
        Some(StartLine::Request {
            method: SipMethod::Invite | SipMethod::ReInvite,
            ..
        })
    );
    if let Some(name) = msg.headers.missing_mandatory(is_invite_class) {
        return err(&format!("missing mandatory header [{}]", name));
    }
    if msg.headers.header_count(hdr::CSEQ) > 1 {
        return err("duplicate CSeq header");
    }
    if msg.headers.header_count(hdr::CONTENT_LENGTH) > 1 {
        return err("duplicate Content-Length header");
    }

    let body_start = sep + CRLF_CRLF.len();
    let available = payload.len() - body_start;

    let content_length = match msg.headers.value(hdr::CONTENT_LENGTH) {
        Some(value) => match value.trim().parse::<usize>() {
            Ok(n) => n,
            Err(_) => return err("bad content-length or fragmented pdu"),
        },
        None => {
            // Deduce and materialize the header the sender omitted.
            if msg.headers.exists(hdr::CONTENT_TYPE) {
                msg.headers.add(hdr::CONTENT_LENGTH, available.to_string());
                available
            } else {
                msg.headers.add(hdr::CONTENT_LENGTH, "0");
                0
            }
        }
    };
    msg.content_length = content_length;

    if content_length == 0 {
        return Ok(Some(ParsedPdu {
            msg,
            consumed: body_start,
        }));
    }
    if available < content_length {
        return err("bad content-length or fragmented pdu");
    }

    let body = &payload[body_start..body_start + content_length];
    let Some(content_type) = msg.headers.value(hdr::CONTENT_TYPE).map(str::to_string) else {
        return err("non-zero Content-Length without Content-Type");
    };

    let (main_type, boundary) = split_content_type(&content_type);
    let mut message_body = MessageBody::empty();

    if main_type.to_ascii_lowercase().contains("multipart") {
        let Some(boundary) = boundary else {
            return err("multipart body without boundary");
        };
        parse_multipart(&mut message_body, body, &boundary);
    } else {
        match BodyType::from_content_type(&main_type) {
            Some(bt) => {
                let mut part = ContentPart::new(bt, body.to_vec());
                part.headers.set(hdr::CONTENT_TYPE, main_type.clone());
                message_body.insert(bt, part);
            }
            None => {
                tracing::warn!(content_type = %main_type, "unknown Content-Type value");
                message_body.set_unknown_part();
            }
        }
    }

    msg.body = message_body;
    Ok(Some(ParsedPdu {
        msg,
        consumed: body_start + content_length,
    }))
}

fn parse_start_line(line: &str) -> Result<SipMessage> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut it = rest.splitn(2, ' ');
        let code: u16 = it
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|_| SipParseError::new("invalid Response status line"))?;
        if !(100..=699).contains(&code) {
            return err("invalid code for Response message");
        }
        let reason = it.next().unwrap_or_default().to_string();
        return Ok(SipMessage {
            start_line: Some(StartLine::Response { code, reason }),
            ..Default::default()
        });
    }

    let mut it = line.split_ascii_whitespace();
    let (Some(name), Some(ruri), Some(version)) = (it.next(), it.next(), it.next()) else {
        return err("invalid message");
    };
    if !version.eq_ignore_ascii_case("SIP/2.0") {
        return err("invalid message");
    }
    let Some(method) = SipMethod::from_name(name) else {
        return err("invalid method for Request message");
    };
    let uri = if method == SipMethod::Invite {
        RequestUri::parse(ruri)
    } else {
        None
    };
    Ok(SipMessage {
        start_line: Some(StartLine::Request {
            method,
            ruri: ruri.to_string(),
            uri,
        }),
        cseq_method: Some(method),
        ..Default::default()
    })
}

fn parse_headers<'a>(msg: &mut SipMessage, lines: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut via_tried = false;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name_lc = name.trim().to_ascii_lowercase();
        let value = value.trim();

        match name_lc.as_str() {
            "from" => {
                if let Some(tag) = extract_tag(value) {
                    msg.from_tag = tag.to_string();
                }
                msg.from_header = value.to_string();
            }
            "to" => {
                if let Some(tag) = extract_tag(value) {
                    if !tag.is_empty() {
                        msg.to_tag = tag.to_string();
                        msg.promote_to_reinvite();
                    }
                }
                msg.to_header = value.to_string();
            }
            "p-asserted-identity" => msg.pai_headers.push(value.to_string()),
            "diversion" => msg.div_headers.push(value.to_string()),
            "call-id" => msg.call_id = value.to_string(),
            "max-forwards" => match value.parse::<i64>() {
                Ok(n) if (0..=255).contains(&n) => msg.max_fwds = Some(n),
                Ok(_) => tracing::warn!(value, "invalid Max-Forwards header - out of range"),
                Err(_) => tracing::warn!(value, "invalid Max-Forwards header"),
            },
            "contact" => {
                msg.remote_contact_uri = extract_uri(value).to_string();
            }
            "cseq" => {
                let mut it = value.split_ascii_whitespace();
                let (Some(num), Some(method)) = (it.next(), it.next()) else {
                    return err("invalid CSeq header");
                };
                let Ok(num) = num.parse::<u32>() else {
                    return err("invalid CSeq header");
                };
                let Some(method) = SipMethod::from_name(method) else {
                    return err("invalid CSeq header");
                };
                msg.cseq_num = num;
                if msg.is_request() {
                    let own = msg.method().expect("request has a method");
                    if !own.same_cseq_space(&method) {
                        tracing::warn!(request = %own, cseq = %method, "request method and CSeq method disagree");
                        return err("invalid CSeq header");
                    }
                    // Keep the (possibly promoted) request method.
                } else {
                    msg.cseq_method = Some(method);
                }
            }
            "via" => {
                if !via_tried {
                    via_tried = true;
                    parse_topmost_via(msg, value);
                }
            }
            _ => {}
        }
        msg.headers.add(&name_lc, value);
    }
    Ok(())
}

fn parse_topmost_via(msg: &mut SipMessage, value: &str) {
    if let Some(sent_by) = value.split(';').next().and_then(|v| v.split_ascii_whitespace().last()) {
        msg.via_udp_addr = parse_socket(sent_by, SIP_PORT);
    }
    if let Some(branch) = param_value(value, "branch") {
        msg.via_branch = branch.to_string();
        if !branch.starts_with(MAGIC_COOKIE) {
            tracing::warn!(%branch, "received message with non-RFC3261 Via branch");
        } else if branch.len() <= MAGIC_COOKIE.len() {
            tracing::warn!(%branch, "received message with too short Via branch");
        }
    }
}

/// Parses `host[:port]` into a socket address when the host is an IP
/// literal.
pub fn parse_socket(hostport: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = hostport.parse::<SocketAddr>() {
        return Some(addr);
    }
    hostport
        .parse::<std::net::IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, default_port))
}

/// The value of `;name=value` inside a header, if present.
pub fn param_value<'a>(header_value: &'a str, name: &str) -> Option<&'a str> {
    for part in header_value.split(';') {
        if let Some((k, v)) = part.split_once('=') {
            if k.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim().trim_matches('"'));
            }
        }
    }
    None
}

fn extract_tag(value: &str) -> Option<&str> {
    let idx = value.find(";tag=")?;
    let tag = &value[idx + 5..];
    Some(match tag.find([';', '>', ' ']) {
        Some(end) => &tag[..end],
        None => tag,
    })
}

/// The URI enclosed in angle brackets, or the value up to its first
/// parameter.
pub fn extract_uri(value: &str) -> &str {
    if let (Some(open), Some(close)) = (value.find('<'), value.rfind('>')) {
        if open < close {
            return &value[open + 1..close];
        }
    }
    match value.find(';') {
        Some(idx) => value[..idx].trim(),
        None => value.trim(),
    }
}

fn split_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let main = parts.next().unwrap_or_default().trim().to_string();
    let boundary = parts
        .find_map(|p| p.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string());
    (main, boundary)
}

fn parse_multipart(body: &mut MessageBody, bytes: &[u8], boundary: &str) {
    let mark = format!("--{}", boundary);
    let mark = mark.as_bytes();
    let mut cursor = 0usize;
    let mut parts_seen = 0usize;
    let mut parts_kept = 0usize;

    while let Some(idx) = find(bytes, mark, cursor) {
        let after_mark = idx + mark.len();
        // Terminating boundary.
        if bytes[after_mark..].starts_with(b"--") {
            break;
        }
        let Some(head_start) = find(bytes, b"\r\n", after_mark).map(|i| i + 2) else {
            break;
        };
        let Some(head_end) = find(bytes, CRLF_CRLF, head_start) else {
            break;
        };
        let Some(next_mark) = find(bytes, mark, head_end) else {
            break;
        };
        parts_seen += 1;

        let mut part = ContentPart::default();
        let mut body_type = None;
        if let Ok(head) = str::from_utf8(&bytes[head_start..head_end]) {
            for line in head.split("\r\n") {
                if let Some((name, value)) = line.split_once(':') {
                    let name = name.trim().to_ascii_lowercase();
                    let value = value.trim();
                    part.headers.add(&name, value);
                    if name == "content-type" {
                        body_type = BodyType::from_content_type(split_content_type(value).0.as_str());
                    }
                }
            }
        }

        // Part bytes run from after the blank line up to the CRLF
        // preceding the next boundary marker.
        let content_start = head_end + CRLF_CRLF.len();
        let content_end = next_mark.saturating_sub(2).max(content_start);
        match body_type {
            Some(bt) => {
                part.bytes = bytes[content_start..content_end].to_vec().into();
                body.insert(bt, part);
                parts_kept += 1;
            }
            None => {
                tracing::warn!("multipart part with missing or unknown Content-Type - skipped");
                body.set_unknown_part();
            }
        }
        cursor = next_mark;
    }

    if parts_kept < parts_seen {
        tracing::warn!(parts_seen, parts_kept, "one or more body parts have been skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:+1.202.555-0101@as.example.net SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.0.2.4:5060;branch=z9hG4bK776asdhds\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:+12025550101@as.example.net>\r\n\
        From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 314159 INVITE\r\n\
        Contact: <sip:alice@192.0.2.4:5060>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 5\r\n\r\nv=0\r\n\0";

    #[test]
    fn parses_invite() {
        let pdu = parse_datagram(INVITE).unwrap().unwrap();
        let msg = pdu.msg;
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(SipMethod::Invite));
        assert_eq!(msg.call_id, "a84b4c76e66710");
        assert_eq!(msg.from_tag, "1928301774");
        assert_eq!(msg.to_tag, "");
        assert_eq!(msg.cseq_num, 314159);
        assert_eq!(msg.via_branch, "z9hG4bK776asdhds");
        assert_eq!(msg.via_udp_addr, Some("192.0.2.4:5060".parse().unwrap()));
        assert_eq!(msg.remote_contact_uri, "sip:alice@192.0.2.4:5060");
        assert_eq!(msg.max_fwds, Some(70));
        assert!(msg.contains_sdp());
        let uri = msg.request_uri().unwrap();
        assert_eq!(uri.userpart, "+12025550101");
        assert_eq!(uri.original_userpart, "+1.202.555-0101");
        // One byte of the datagram was a pipelined follow-on.
        assert_eq!(pdu.consumed, INVITE.len() - 1);
    }

    #[test]
    fn promotes_invite_with_to_tag() {
        let raw = b"INVITE sip:b@h SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK1\r\n\
            Max-Forwards: 70\r\n\
            To: <sip:b@h>;tag=totag\r\n\
            From: <sip:a@h>;tag=fromtag\r\n\
            Call-ID: cid\r\n\
            CSeq: 2 INVITE\r\n\
            Contact: <sip:a@1.2.3.4>\r\n\
            Content-Length: 0\r\n\r\n";
        let pdu = parse_datagram(raw).unwrap().unwrap();
        assert_eq!(pdu.msg.method(), Some(SipMethod::ReInvite));
        assert_eq!(pdu.msg.to_tag, "totag");
    }

    #[test]
    fn parses_response() {
        let raw = b"SIP/2.0 180 Ringing\r\n\
            Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK1\r\n\
            To: <sip:b@h>;tag=tt\r\n\
            From: <sip:a@h>;tag=ft\r\n\
            Call-ID: cid\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        let pdu = parse_datagram(raw).unwrap().unwrap();
        let msg = pdu.msg;
        assert!(msg.is_response());
        assert_eq!(msg.status_code(), 180);
        assert_eq!(msg.method(), Some(SipMethod::Invite));
        assert_eq!(msg.to_tag, "tt");
    }

    #[test]
    fn empty_payload_is_keepalive() {
        assert!(parse_datagram(b"\r\n").unwrap().is_none());
        assert!(parse_datagram(b"").unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_method() {
        let raw = b"NEGOTIATE sip:b@h SIP/2.0\r\n\r\n";
        assert!(parse_datagram(raw).is_err());
    }

    #[test]
    fn rejects_status_out_of_range() {
        let raw = b"SIP/2.0 99 Too Low\r\nVia: v\r\n\r\n";
        assert!(parse_datagram(raw).is_err());
    }

    #[test]
    fn rejects_missing_mandatory_header() {
        let raw = b"OPTIONS sip:b@h SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4;branch=z9hG4bK1\r\n\
            From: <sip:a@h>;tag=ft\r\n\
            Call-ID: cid\r\n\
            CSeq: 1 OPTIONS\r\n\r\n";
        // To header missing.
        assert!(parse_datagram(raw).is_err());
    }

    #[test]
    fn rejects_duplicate_cseq() {
        let raw = b"OPTIONS sip:b@h SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4;branch=z9hG4bK1\r\n\
            To: <sip:b@h>\r\n\
            From: <sip:a@h>;tag=ft\r\n\
            Call-ID: cid\r\n\
            CSeq: 1 OPTIONS\r\n\
            CSeq: 2 OPTIONS\r\n\r\n";
        assert!(parse_datagram(raw).is_err());
    }

    #[test]
    fn rejects_bad_content_length() {
        let raw = b"OPTIONS sip:b@h SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4;branch=z9hG4bK1\r\n\
            To: <sip:b@h>\r\n\
            From: <sip:a@h>;tag=ft\r\n\
            Call-ID: cid\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Type: application/sdp\r\n\
            Content-Length: 999\r\n\r\nv=0\r\n";
        assert!(parse_datagram(raw).is_err());
    }

    #[test]
    fn rejects_mismatched_cseq_method() {
        let raw = b"OPTIONS sip:b@h SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4;branch=z9hG4bK1\r\n\
            To: <sip:b@h>\r\n\
            From: <sip:a@h>;tag=ft\r\n\
            Call-ID: cid\r\n\
            CSeq: 1 BYE\r\n\r\n";
        assert!(parse_datagram(raw).is_err());
    }

    #[test]
    fn parses_multipart_body() {
        let body = b"--bnd\r\n\
            Content-Type: application/sdp\r\n\r\n\
            v=0\r\n\
            --bnd\r\n\
            Content-Type: application/isup\r\n\r\n\
            \x01\x02\r\n\
            --bnd--\r\n";
        let mut raw = format!(
            "INVITE sip:b@h SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK1\r\n\
            Max-Forwards: 70\r\n\
            To: <sip:b@h>\r\n\
            From: <sip:a@h>;tag=ft\r\n\
            Call-ID: cid\r\n\
            CSeq: 1 INVITE\r\n\
            Contact: <sip:a@1.2.3.4>\r\n\
            Content-Type: multipart/mixed;boundary=bnd\r\n\
            Content-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);

        let pdu = parse_datagram(&raw).unwrap().unwrap();
        let parts: Vec<_> = pdu.msg.body.parts().collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(pdu.msg.body.sdp_bytes().unwrap().as_ref(), b"v=0");
        assert_eq!(
            pdu.msg.body.get(BodyType::Isup).unwrap().bytes.as_ref(),
            b"\x01\x02"
        );
        assert!(!pdu.msg.with_unknown_body_part());
    }

    #[test]
    fn multipart_with_unknown_part_keeps_the_rest() {
        let body = b"--bnd\r\n\
            Content-Type: application/sdp\r\n\r\n\
            v=0\r\n\
            --bnd\r\n\
            Content-Type: application/x-nonsense\r\n\r\n\
            zz\r\n\
            --bnd--\r\n";
        let mut raw = format!(
            "INVITE sip:b@h SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK1\r\n\
            Max-Forwards: 70\r\n\
            To: <sip:b@h>\r\n\
            From: <sip:a@h>;tag=ft\r\n\
            Call-ID: cid\r\n\
            CSeq: 1 INVITE\r\n\
            Contact: <sip:a@1.2.3.4>\r\n\
            Content-Type: multipart/mixed;boundary=bnd\r\n\
            Content-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);

        let pdu = parse_datagram(&raw).unwrap().unwrap();
        assert!(pdu.msg.contains_sdp());
        assert!(pdu.msg.with_unknown_body_part());
    }
}
