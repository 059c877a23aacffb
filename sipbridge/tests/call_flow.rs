//! End-to-end call flows over real UDP sockets: a caller and a callee
//! talk to a running stack; the tests play both endpoints.

use std::net::SocketAddr;
use std::time::Duration;

use sipbridge::message::{SipMessage, SipMethod, hdr};
use sipbridge::parser::parse_datagram;
use sipbridge::{Config, SipStack};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use util::DnsResolver;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

struct Peer {
    socket: UdpSocket,
}

impl Peer {
    async fn new() -> Peer {
        Peer {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    async fn send(&self, to: SocketAddr, text: &str) {
        self.socket.send_to(text.as_bytes(), to).await.unwrap();
    }

    async fn recv(&self) -> SipMessage {
        let mut buf = vec![0u8; 8192];
        let (len, _) = timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a SIP message")
            .unwrap();
        parse_datagram(&buf[..len])
            .expect("peer received unparsable message")
            .expect("peer received empty message")
            .msg
    }

    /// Receives until a message of the wanted kind arrives (skipping
    /// retransmissions of earlier messages).
    async fn recv_request(&self, method: SipMethod) -> SipMessage {
        for _ in 0..10 {
            let msg = self.recv().await;
            if msg.is_request() && msg.method() == Some(method) {
                return msg;
            }
        }
        panic!("expected {} request", method);
    }

    async fn recv_response(&self, code: u16) -> SipMessage {
        for _ in 0..10 {
            let msg = self.recv().await;
            if msg.is_response() && msg.status_code() == code {
                return msg;
            }
        }
        panic!("expected {} response", code);
    }
}

async fn start_stack(media_start: u16, media_end: u16, rate_limit: i64) -> SipStack {
    let mut config = Config::for_tests();
    config.media_start_port = media_start;
    config.media_end_port = media_end;
    config.rate_limit = rate_limit;
    SipStack::start_for_tests(config).await.unwrap()
}

async fn load_routing(stack: &SipStack, blob: serde_json::Value) {
    let resolver = DnsResolver::default();
    stack
        .routing_engine()
        .read_config(serde_json::to_vec(&blob).unwrap().as_slice(), &resolver)
        .await;
}

fn sdp_offer(port: u16) -> String {
    format!(
        "v=0\r\no=caller 123 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n\
         m=audio {} RTP/AVP 0 101\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:101 telephone-event/8000\r\n",
        port
    )
}

fn invite(stack: SocketAddr, caller: SocketAddr, call_id: &str, userpart: &str, sdp: &str, extra: &str) -> String {
    format!(
        "INVITE sip:{userpart}@{stack} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {caller};branch=z9hG4bKcaller-{call_id}\r\n\
         Max-Forwards: 70\r\n\
         From: Alice <sip:alice@{caller}>;tag=callertag\r\n\
         To: <sip:{userpart}@{stack}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:alice@{caller}>\r\n\
         {extra}Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n{sdp}",
        len = sdp.len(),
    )
}

/// A response the callee sends on a request it received, echoing the
/// Via set, From, Call-ID and CSeq as a UAS would.
fn callee_response(req: &SipMessage, callee: SocketAddr, code: u16, reason: &str, to_tag: Option<&str>, body: &str, extra: &str) -> String {
    let vias: String = req
        .headers
        .values(hdr::VIA)
        .iter()
        .map(|v| format!("Via: {}\r\n", v))
        .collect();
    let to = match to_tag {
        Some(tag) if !req.to_header.contains(";tag=") => format!("{};tag={}", req.to_header, tag),
        _ => req.to_header.clone(),
    };
    let content_type = if body.is_empty() {
        String::new()
    } else {
        "Content-Type: application/sdp\r\n".to_string()
    };
    format!(
        "SIP/2.0 {code} {reason}\r\n\
         {vias}\
         From: {from}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         Contact: <sip:bob@{callee}>\r\n\
         {extra}{content_type}Content-Length: {len}\r\n\r\n{body}",
        from = req.from_header,
        call_id = req.call_id,
        cseq = req.cseq_num,
        method = req.cseq_method.unwrap().as_str(),
        len = body.len(),
    )
}

fn transparent_routing(callee: SocketAddr) -> serde_json::Value {
    serde_json::json!([
        {
            "userpartPattern": "\\+1(\\d+)",
            "routingRecord": {
                "no18xTimeout": 60,
                "noAnswerTimeout": 120,
                "outRuriUserpart": "1$1",
                "outRuriHostport": callee.to_string(),
                "outCallFlow": "Transparent"
            }
        }
    ])
}

#[test_log::test(tokio::test)]
async fn minimal_call_through_with_clearing() {
    let stack = start_stack(41000, 41003, -1).await;
    let stack_addr = stack.local_addr().unwrap();
    let caller = Peer::new().await;
    let callee = Peer::new().await;
    load_routing(&stack, transparent_routing(callee.addr())).await;

    let offer = sdp_offer(40000);
    caller
        .send(stack_addr, &invite(stack_addr, caller.addr(), "call-1", "+12025550101", &offer, ""))
        .await;

    // Ingress side is acknowledged immediately.
    let trying = caller.recv_response(100).await;
    assert_eq!(trying.cseq_num, 1);

    // The routed leg arrives at the callee with the translated
    // userpart and the caller's SDP.
    let out_invite = callee.recv_request(SipMethod::Invite).await;
    let uri = out_invite.request_uri().unwrap();
    assert_eq!(uri.userpart, "12025550101");
    assert!(out_invite.contains_sdp());
    assert_ne!(out_invite.call_id, "call-1");
    assert_eq!(out_invite.max_fwds, Some(69));

    callee
        .send(stack_addr, &callee_response(&out_invite, callee.addr(), 180, "Ringing", Some("bobtag"), "", ""))
        .await;
    let ringing = caller.recv_response(180).await;
    assert_eq!(ringing.call_id, "call-1");

    let answer = sdp_offer(40002);
    callee
        .send(
            stack_addr,
            &callee_response(&out_invite, callee.addr(), 200, "OK", Some("bobtag"), &answer, ""),
        )
        .await;
    let ok = caller.recv_response(200).await;
    assert!(ok.contains_sdp());
    assert!(!ok.to_tag.is_empty());
    // The SDP session identity is owned by the dialog, not relayed.
    let relayed = String::from_utf8(ok.body.sdp_bytes().unwrap().to_vec()).unwrap();
    assert!(relayed.contains("c=IN IP4 127.0.0.1"));
    assert!(!relayed.contains("o=caller 123 1"));

    // ACK rides through to the callee.
    caller
        .send(
            stack_addr,
            &format!(
                "ACK sip:+12025550101@{stack_addr} SIP/2.0\r\n\
                 Via: SIP/2.0/UDP {caller};branch=z9hG4bKack-call-1\r\n\
                 Max-Forwards: 70\r\n\
                 From: Alice <sip:alice@{caller}>;tag=callertag\r\n\
                 To: <sip:+12025550101@{stack_addr}>;tag={to_tag}\r\n\
                 Call-ID: call-1\r\n\
                 CSeq: 1 ACK\r\n\
                 Content-Length: 0\r\n\r\n",
                caller = caller.addr(),
                to_tag = ok.to_tag,
            ),
        )
        .await;
    let ack = callee.recv_request(SipMethod::Ack).await;
    assert_eq!(ack.cseq_num, out_invite.cseq_num);

    // Caller clears the call: 200 locally, BYE toward the callee.
    caller
        .send(
            stack_addr,
            &format!(
                "BYE sip:+12025550101@{stack_addr} SIP/2.0\r\n\
                 Via: SIP/2.0/UDP {caller};branch=z9hG4bKbye-call-1\r\n\
                 Max-Forwards: 70\r\n\
                 From: Alice <sip:alice@{caller}>;tag=callertag\r\n\
                 To: <sip:+12025550101@{stack_addr}>;tag={to_tag}\r\n\
                 Call-ID: call-1\r\n\
                 CSeq: 2 BYE\r\n\
                 Content-Length: 0\r\n\r\n",
                caller = caller.addr(),
                to_tag = ok.to_tag,
            ),
        )
        .await;
    let bye_ok = caller.recv_response(200).await;
    assert_eq!(bye_ok.cseq_num, 2);

    let bye = callee.recv_request(SipMethod::Bye).await;
    assert!(bye.headers.value(hdr::REASON).is_some());
    callee
        .send(stack_addr, &callee_response(&bye, callee.addr(), 200, "OK", None, "", ""))
        .await;

    // Both legs leave the sessions map.
    for _ in 0..20 {
        if stack.session_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stack.session_count(), 0);
}

#[tokio::test]
async fn prack_round_trip() {
    let stack = start_stack(41010, 41013, -1).await;
    let stack_addr = stack.local_addr().unwrap();
    let caller = Peer::new().await;
    let callee = Peer::new().await;
    load_routing(&stack, transparent_routing(callee.addr())).await;

    let offer = sdp_offer(40010);
    caller
        .send(
            stack_addr,
            &invite(
                stack_addr,
                caller.addr(),
                "call-prack",
                "+12025550102",
                &offer,
                "Supported: 100rel\r\n",
            ),
        )
        .await;
    caller.recv_response(100).await;

    let out_invite = callee.recv_request(SipMethod::Invite).await;
    assert!(out_invite.is_option_supported("100rel"));

    // Reliable 183 from the callee with its own RSeq.
    callee
        .send(
            stack_addr,
            &callee_response(
                &out_invite,
                callee.addr(),
                183,
                "Session Progress",
                Some("bobtag"),
                "",
                "Require: 100rel\r\nRSeq: 5\r\n",
            ),
        )
        .await;

    let progress = caller.recv_response(183).await;
    assert!(progress.is_option_required("100rel"));
    let rseq: u32 = progress.headers.value(hdr::RSEQ).unwrap().parse().unwrap();
    assert!((1..=999).contains(&rseq));

    // The caller PRACKs our reliable 183...
    caller
        .send(
            stack_addr,
            &format!(
                "PRACK sip:+12025550102@{stack_addr} SIP/2.0\r\n\
                 Via: SIP/2.0/UDP {caller};branch=z9hG4bKprack-1\r\n\
                 Max-Forwards: 70\r\n\
                 From: Alice <sip:alice@{caller}>;tag=callertag\r\n\
                 To: <sip:+12025550102@{stack_addr}>;tag={to_tag}\r\n\
                 Call-ID: call-prack\r\n\
                 CSeq: 2 PRACK\r\n\
                 RAck: {rseq} 1 INVITE\r\n\
                 Content-Length: 0\r\n\r\n",
                caller = caller.addr(),
                to_tag = progress.to_tag,
            ),
        )
        .await;

    // ...which is answered locally and mirrored to the callee with
    // the callee's RSeq in the RAck.
    let prack_ok = caller.recv_response(200).await;
    assert_eq!(prack_ok.method(), Some(SipMethod::Prack));

    let out_prack = callee.recv_request(SipMethod::Prack).await;
    let rack = out_prack.headers.value(hdr::RACK).unwrap();
    assert_eq!(rack, format!("5 {} INVITE", out_invite.cseq_num));
    callee
        .send(stack_addr, &callee_response(&out_prack, callee.addr(), 200, "OK", None, "", ""))
        .await;
}

#[tokio::test]
async fn echo_responder_answers_and_reflects_rtp() {
    let stack = start_stack(41020, 41023, -1).await;
    let stack_addr = stack.local_addr().unwrap();
    let caller = Peer::new().await;
    load_routing(
        &stack,
        serde_json::json!([
            {
                "userpartPattern": "^echo$",
                "routingRecord": { "outCallFlow": "EchoResponder" }
            }
        ]),
    )
    .await;

    let rtp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let offer = sdp_offer(rtp_socket.local_addr().unwrap().port());
    caller
        .send(stack_addr, &invite(stack_addr, caller.addr(), "call-echo", "echo", &offer, ""))
        .await;

    caller.recv_response(100).await;
    caller.recv_response(180).await;
    let ok = caller.recv_response(200).await;
    assert!(ok.contains_sdp());

    let answer = String::from_utf8(ok.body.sdp_bytes().unwrap().to_vec()).unwrap();
    let media_addr = sipbridge::sdp::SdpSession::parse(&answer)
        .unwrap()
        .media_endpoint()
        .expect("echo answer advertises a media endpoint");

    // RTP sent to the advertised endpoint bounces straight back.
    rtp_socket.send_to(b"fake-rtp-payload", media_addr).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, from) = timeout(RECV_TIMEOUT, rtp_socket.recv_from(&mut buf))
        .await
        .expect("echo datagram not returned")
        .unwrap();
    assert_eq!(&buf[..len], b"fake-rtp-payload");
    assert_eq!(from, media_addr);
}

#[tokio::test]
async fn registration_refresh_binds_and_unbinds() {
    let stack = start_stack(41030, 41030, -1).await;
    let stack_addr = stack.local_addr().unwrap();
    let phone = Peer::new().await;

    let register = |expires: u32, cseq: u32| {
        format!(
            "REGISTER sip:{stack_addr} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {phone};branch=z9hG4bKreg-{cseq}\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:2001@{stack_addr}>;tag=regtag\r\n\
             To: <sip:2001@{stack_addr}>\r\n\
             Call-ID: call-reg-{cseq}\r\n\
             CSeq: {cseq} REGISTER\r\n\
             Contact: <sip:2001@1.2.3.4:5080>;expires={expires}\r\n\
             Content-Length: 0\r\n\r\n",
            phone = phone.addr(),
        )
    };

    phone.send(stack_addr, &register(300, 1)).await;
    let ok = phone.recv_response(200).await;
    assert!(ok.headers.value(hdr::CONTACT).unwrap().contains("sip:2001@1.2.3.4:5080"));
    assert_eq!(ok.headers.value(hdr::EXPIRES), Some("300"));

    let bound = stack.phones().get("2001").expect("extension registered");
    assert!(bound.is_registered());
    assert_eq!(bound.ua().unwrap().addr(), "1.2.3.4:5080".parse().unwrap());

    phone.send(stack_addr, &register(0, 2)).await;
    phone.recv_response(200).await;
    assert!(!stack.phones().get("2001").unwrap().is_registered());
}

#[tokio::test]
async fn rate_limit_zero_rejects_first_call() {
    let stack = start_stack(41040, 41040, 0).await;
    let stack_addr = stack.local_addr().unwrap();
    let caller = Peer::new().await;

    let offer = sdp_offer(40040);
    caller
        .send(stack_addr, &invite(stack_addr, caller.addr(), "call-limited", "+12025550103", &offer, ""))
        .await;

    let rejected = caller.recv_response(503).await;
    let reason = rejected.headers.value(hdr::REASON).unwrap();
    assert!(reason.contains("Q.850;cause=34"), "reason was {reason:?}");
}

#[tokio::test]
async fn competing_reinvite_is_rejected_with_491() {
    let stack = start_stack(41050, 41053, -1).await;
    let stack_addr = stack.local_addr().unwrap();
    let caller = Peer::new().await;
    let callee = Peer::new().await;
    load_routing(&stack, transparent_routing(callee.addr())).await;

    // Establish the call first.
    let offer = sdp_offer(40050);
    caller
        .send(stack_addr, &invite(stack_addr, caller.addr(), "call-race", "+12025550104", &offer, ""))
        .await;
    caller.recv_response(100).await;
    let out_invite = callee.recv_request(SipMethod::Invite).await;
    callee
        .send(
            stack_addr,
            &callee_response(&out_invite, callee.addr(), 200, "OK", Some("bobtag"), &sdp_offer(40052), ""),
        )
        .await;
    let ok = caller.recv_response(200).await;
    caller
        .send(
            stack_addr,
            &format!(
                "ACK sip:x@{stack_addr} SIP/2.0\r\n\
                 Via: SIP/2.0/UDP {caller};branch=z9hG4bKack-race\r\n\
                 Max-Forwards: 70\r\n\
                 From: Alice <sip:alice@{caller}>;tag=callertag\r\n\
                 To: <sip:+12025550104@{stack_addr}>;tag={to_tag}\r\n\
                 Call-ID: call-race\r\n\
                 CSeq: 1 ACK\r\n\
                 Content-Length: 0\r\n\r\n",
                caller = caller.addr(),
                to_tag = ok.to_tag,
            ),
        )
        .await;
    callee.recv_request(SipMethod::Ack).await;

    // Caller re-INVITEs; the latch is taken while it is in flight.
    caller
        .send(
            stack_addr,
            &format!(
                "INVITE sip:+12025550104@{stack_addr} SIP/2.0\r\n\
                 Via: SIP/2.0/UDP {caller};branch=z9hG4bKreinv-1\r\n\
                 Max-Forwards: 70\r\n\
                 From: Alice <sip:alice@{caller}>;tag=callertag\r\n\
                 To: <sip:+12025550104@{stack_addr}>;tag={to_tag}\r\n\
                 Call-ID: call-race\r\n\
                 CSeq: 2 INVITE\r\n\
                 Contact: <sip:alice@{caller}>\r\n\
                 Content-Type: application/sdp\r\n\
                 Content-Length: {len}\r\n\r\n{offer}",
                caller = caller.addr(),
                to_tag = ok.to_tag,
                len = offer.len(),
            ),
        )
        .await;
    caller.recv_response(100).await;
    let relayed_reinvite = callee.recv_request(SipMethod::ReInvite).await;

    // The callee fires its own re-INVITE before answering: 491.
    callee
        .send(
            stack_addr,
            &format!(
                "INVITE sip:bridge@{stack_addr} SIP/2.0\r\n\
                 Via: SIP/2.0/UDP {callee};branch=z9hG4bKreinv-2\r\n\
                 Max-Forwards: 70\r\n\
                 From: {from}\r\n\
                 To: {to}\r\n\
                 Call-ID: {call_id}\r\n\
                 CSeq: 700 INVITE\r\n\
                 Contact: <sip:bob@{callee}>\r\n\
                 Content-Type: application/sdp\r\n\
                 Content-Length: {len}\r\n\r\n{offer}",
                callee = callee.addr(),
                from = format!("{};tag=bobtag", out_invite.to_header),
                to = out_invite.from_header,
                call_id = out_invite.call_id,
                len = offer.len(),
            ),
        )
        .await;
    let pending = callee.recv_response(491).await;
    assert_eq!(pending.call_id, out_invite.call_id);

    // The winning re-INVITE completes normally.
    callee
        .send(
            stack_addr,
            &callee_response(&relayed_reinvite, callee.addr(), 200, "OK", None, &sdp_offer(40052), ""),
        )
        .await;
    let reinvite_ok = caller.recv_response(200).await;
    assert_eq!(reinvite_ok.cseq_num, 2);
}

#[test_log::test(tokio::test)]
async fn no_18x_timeout_cancels_and_rejects() {
    let stack = start_stack(41060, 41060, -1).await;
    let stack_addr = stack.local_addr().unwrap();
    let caller = Peer::new().await;
    let callee = Peer::new().await;
    load_routing(
        &stack,
        serde_json::json!([
            {
                "userpartPattern": "\\+1(\\d+)",
                "routingRecord": {
                    "no18xTimeout": 1,
                    "noAnswerTimeout": 30,
                    "outRuriUserpart": "1$1",
                    "outRuriHostport": callee.addr().to_string(),
                    "outCallFlow": "Transparent"
                }
            }
        ]),
    )
    .await;

    let offer = sdp_offer(40060);
    caller
        .send(stack_addr, &invite(stack_addr, caller.addr(), "call-silent", "+12025550105", &offer, ""))
        .await;
    caller.recv_response(100).await;

    // The callee answers 100 only and then goes silent.
    let out_invite = callee.recv_request(SipMethod::Invite).await;
    callee
        .send(stack_addr, &callee_response(&out_invite, callee.addr(), 100, "Trying", None, "", ""))
        .await;

    // Ringing supervision fires: CANCEL egress, 487 ingress.
    let cancel = callee.recv_request(SipMethod::Cancel).await;
    assert_eq!(cancel.cseq_num, out_invite.cseq_num);
    assert_eq!(cancel.via_branch, out_invite.via_branch);

    let terminated = caller.recv_response(487).await;
    let reason = terminated.headers.value(hdr::REASON).unwrap();
    assert!(reason.contains("Q.850;cause=19"), "reason was {reason:?}");
    assert!(reason.contains("No response from far end"));
}
