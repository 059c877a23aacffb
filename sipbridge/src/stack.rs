//! The stack dispatcher and B2BUA bridge.
//!
//! One UDP reader feeds a bounded packet queue drained by a worker
//! pool. Each datagram is parsed, matched to (or admitted as) a
//! session, deduplicated at the transaction layer and then driven
//! through the dialog state machine. Cross-leg propagation, the B2BUA
//! part, happens here too: every rule that says "what arrives on one
//! leg causes what on the other" lives in the two dispatch functions
//! below.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use util::{ArcStr, DnsResolver};

use crate::cdr::{CdrRecord, CdrWriter};
use crate::config::Config;
use crate::error::Result;
use crate::media::{self, MediaPool};
use crate::message::code::{is_provisional_18x, q850, status};
use crate::message::{
    MessageBody, RequestPack, ResponsePack, SipMessage, SipMethod, hdr,
};
use crate::metrics::Metrics;
use crate::parser;
use crate::phones::{PhoneRegistry, SipUdpUserAgent};
use crate::ratelimit::CallLimiter;
use crate::routing::{CallFlow, RoutingEngine, RoutingRecord};
use crate::sdp::SdpSession;
use crate::session::{CallNumbers, SessionMode, SessionState, SessionTimer, SipSession};
use crate::transaction::{Direction, PrackStatus, Transaction};

/// Bounded depth of the reader→worker packet queue.
const QUEUE_SIZE: usize = 1024;

/// Largest SIP datagram accepted off the wire.
const PDU_BUFFER_SIZE: usize = 8192;

/// Ringing-to-answer delay of the echo responder.
const ECHO_ANSWER_DELAY: Duration = Duration::from_millis(500);

/// Requests below this Max-Forwards are refused with 483.
const MIN_MAX_FORWARDS: i64 = 0;

/// Admission classification for a PDU entering the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    DuplicateMessage,
    ValidRequest,
    Response,
    CallLegTransactionNotExist,
    UnexpectedMessage,
    InvalidRequest,
    TooLowMaxForwards,
    WithRequireHeader,
    UnsupportedUriScheme,
    UnsupportedBody,
    ExceededCallRate,
}

pub(crate) struct StackInner {
    config: Config,
    socket: Arc<UdpSocket>,
    sessions: RwLock<HashMap<ArcStr, SipSession>>,
    routing: RoutingEngine,
    phones: PhoneRegistry,
    media: MediaPool,
    limiter: CallLimiter,
    metrics: Arc<Metrics>,
    cdr: CdrWriter,
    resolver: DnsResolver,
    as_ua: Option<Arc<SipUdpUserAgent>>,
}

/// Process-wide stack handle.
#[derive(Clone)]
pub struct SipStack(Arc<StackInner>);

impl SipStack {
    /// Binds the SIP socket, loads the routing table and spawns the
    /// reader, the worker pool and the periodic UA probing task.
    pub async fn start(config: Config) -> Result<SipStack> {
        let socket = media::bind_udp(config.server_ipv4, config.sip_udp_port, media::DSCP_AF41)?;
        let socket = Arc::new(socket);
        tracing::info!(addr = %socket.local_addr()?, "SIP UDP transport started");

        let cdr = CdrWriter::start(&config.data_dir).await.unwrap_or_else(|err| {
            tracing::warn!(%err, "CDR writer disabled");
            CdrWriter::disabled()
        });

        let as_ua = config.as_sip.map(|addr| Arc::new(SipUdpUserAgent::new(addr)));

        let inner = Arc::new(StackInner {
            media: MediaPool::new(config.server_ipv4, config.media_start_port, config.media_end_port),
            limiter: CallLimiter::new(config.rate_limit),
            routing: RoutingEngine::new(),
            phones: PhoneRegistry::new(),
            sessions: RwLock::new(HashMap::new()),
            metrics: Arc::new(Metrics::new()),
            resolver: DnsResolver::default(),
            cdr,
            as_ua,
            socket,
            config,
        });
        let stack = SipStack(inner);
        tracing::info!(limiter = %stack.0.limiter, "rate limiter set");

        if stack.0.as_ua.is_none() {
            stack.reload_routing().await;
        }

        stack.spawn_packet_pump();
        stack.spawn_ua_probing();
        Ok(stack)
    }

    /// A stack for tests: loopback socket, no CDR file, no probing.
    pub async fn start_for_tests(config: Config) -> Result<SipStack> {
        let socket = Arc::new(UdpSocket::bind((config.server_ipv4, config.sip_udp_port)).await?);
        let inner = Arc::new(StackInner {
            media: MediaPool::new(config.server_ipv4, config.media_start_port, config.media_end_port),
            limiter: CallLimiter::new(config.rate_limit),
            routing: RoutingEngine::new(),
            phones: PhoneRegistry::new(),
            sessions: RwLock::new(HashMap::new()),
            metrics: Arc::new(Metrics::new()),
            resolver: DnsResolver::default(),
            cdr: CdrWriter::disabled(),
            as_ua: config.as_sip.map(|addr| Arc::new(SipUdpUserAgent::new(addr))),
            socket,
            config,
        });
        let stack = SipStack(inner);
        stack.spawn_packet_pump();
        Ok(stack)
    }

    pub(crate) fn from_inner(inner: Arc<StackInner>) -> SipStack {
        SipStack(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<StackInner> {
        Arc::downgrade(&self.0)
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.0.socket.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.0.socket.local_addr().ok()
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.0.metrics
    }

    pub fn media(&self) -> &MediaPool {
        &self.0.media
    }

    pub fn phones(&self) -> &PhoneRegistry {
        &self.0.phones
    }

    pub fn routing_engine(&self) -> &RoutingEngine {
        &self.0.routing
    }

    pub fn limiter(&self) -> &CallLimiter {
        &self.0.limiter
    }

    pub(crate) fn indialogue_probing_interval(&self) -> u64 {
        self.0.config.indialogue_interval
    }

    /// (Re)loads `rdb.json` from the data directory.
    pub async fn reload_routing(&self) {
        let path = self.0.config.data_dir.join("rdb.json");
        match tokio::fs::read(&path).await {
            Ok(data) => self.0.routing.read_config(&data, &self.0.resolver).await,
            Err(err) => tracing::warn!(path = %path.display(), %err, "routing DB not read"),
        }
    }

    // ---- sessions map ---------------------------------------------

    pub fn find_session(&self, call_id: &str) -> Option<SipSession> {
        self.0.sessions.read().expect("sessions lock").get(call_id).cloned()
    }

    pub(crate) fn add_session(&self, session: &SipSession) {
        self.0
            .sessions
            .write()
            .expect("sessions lock")
            .insert(session.call_id(), session.clone());
        self.0.metrics.inc_sessions();
    }

    pub(crate) fn remove_session(&self, session: &SipSession) {
        let removed = self
            .0
            .sessions
            .write()
            .expect("sessions lock")
            .remove(&*session.call_id());
        if removed.is_some() {
            self.0.metrics.dec_sessions();
        }
        if session.mode() == SessionMode::Multimedia {
            self.push_cdr(session);
        }
    }

    pub fn session_count(&self) -> usize {
        self.0.sessions.read().expect("sessions lock").len()
    }

    pub fn session_summaries(&self) -> Vec<String> {
        self.0
            .sessions
            .read()
            .expect("sessions lock")
            .values()
            .map(|s| s.to_string())
            .collect()
    }

    fn push_cdr(&self, session: &SipSession) {
        let numbers = session.numbers();
        self.0.cdr.push(CdrRecord {
            call_id: session.call_id().to_string(),
            caller_number: numbers.caller,
            called_number: numbers.called,
            translated_called_number: numbers.translated_called,
            start_time: Some(session.created_at()),
            end_time: Some(std::time::SystemTime::now()),
            status: session.get_state().to_string(),
            direction: format!("{:?}", session.direction()),
            caller_ip: session
                .remote_udp()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            termination_cause: numbers.termination_cause,
        });
    }

    // ---- packet pump ----------------------------------------------

    fn spawn_packet_pump(&self) {
        let (tx, rx) = mpsc::channel::<(Bytes, SocketAddr)>(QUEUE_SIZE);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = num_cpus::get().max(1);
        for _ in 0..workers {
            let stack = self.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let packet = { rx.lock().await.recv().await };
                    let Some((payload, from)) = packet else { return };
                    stack.process_datagram(&payload, from).await;
                }
            });
        }

        let stack = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; PDU_BUFFER_SIZE];
            loop {
                match stack.0.socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let payload = Bytes::copy_from_slice(&buf[..len]);
                        if tx.send((payload, from)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, "SIP socket read failed");
                        return;
                    }
                }
            }
        });
    }

    /// Full ingress path for one datagram, including pipelined PDUs.
    pub(crate) async fn process_datagram(&self, payload: &[u8], from: SocketAddr) {
        let mut rest = payload;
        while !rest.is_empty() {
            match parser::parse_datagram(rest) {
                Ok(Some(pdu)) => {
                    let consumed = pdu.consumed.max(1);
                    self.process_message(pdu.msg, from).await;
                    rest = &rest[consumed.min(rest.len())..];
                }
                Ok(None) => return,
                Err(err) => {
                    self.0.metrics.inc_parse_errors();
                    tracing::debug!(%err, %from, "dropping unparsable PDU");
                    return;
                }
            }
        }
    }

    async fn process_message(&self, msg: SipMessage, from: SocketAddr) {
        tracing::debug!(%from, message = %msg, call_id = %msg.call_id, "<= message received");
        let (session, admission) = self.admit(&msg, from).await;
        let Some(session) = session else { return };
        if admission == Admission::DuplicateMessage {
            return;
        }

        session.update_contact_record_route_media(&msg);

        let tx = if msg.is_request() {
            session.add_incoming_request(&msg, None)
        } else {
            session.add_incoming_response(&msg)
        };
        let Some(tx) = tx else {
            tracing::warn!(call_id = %session.call_id(), message = %msg, "message discarded due to transaction violation");
            if session.has_no_transactions() {
                session.drop_me().await;
            }
            return;
        };

        match admission {
            Admission::Response => return,
            Admission::UnexpectedMessage => {
                session.drop_me().await;
                return;
            }
            Admission::TooLowMaxForwards => {
                session
                    .reject_me(Some(&tx), status::TOO_MANY_HOPS, q850::NO_CAUSE, "INVITE with too low MF")
                    .await;
                return;
            }
            Admission::WithRequireHeader => {
                session
                    .reject_me(Some(&tx), status::BAD_EXTENSION, q850::NO_CAUSE, "INVITE with Require header")
                    .await;
                return;
            }
            Admission::UnsupportedUriScheme => {
                session
                    .reject_me(
                        Some(&tx),
                        status::UNSUPPORTED_URI_SCHEME,
                        q850::NO_CAUSE,
                        "URI scheme unsupported",
                    )
                    .await;
                return;
            }
            Admission::UnsupportedBody => {
                session
                    .reject_me(
                        Some(&tx),
                        status::UNSUPPORTED_MEDIA_TYPE,
                        q850::NO_CAUSE,
                        "Message body unsupported",
                    )
                    .await;
                return;
            }
            Admission::ExceededCallRate => {
                session
                    .reject_me(
                        Some(&tx),
                        status::SERVICE_UNAVAILABLE,
                        q850::NO_CIRCUIT_AVAILABLE,
                        "Call rate exceeded",
                    )
                    .await;
                return;
            }
            Admission::InvalidRequest => {
                session.set_state(SessionState::BeingFailed);
                session
                    .send_created_response(Some(&tx), status::SERVICE_UNAVAILABLE, MessageBody::empty())
                    .await;
                session.drop_me().await;
                return;
            }
            Admission::CallLegTransactionNotExist => {
                if msg.method() != Some(SipMethod::Ack) {
                    session.set_state(SessionState::Dropped);
                    session
                        .send_created_response(Some(&tx), status::CALL_DOES_NOT_EXIST, MessageBody::empty())
                        .await;
                }
                session.drop_me().await;
                return;
            }
            Admission::DuplicateMessage | Admission::ValidRequest => {}
        }

        if msg.is_request() {
            self.dispatch_request(&session, &tx, &msg).await;
        } else {
            self.dispatch_response(&session, &tx, &msg).await;
        }
    }

    /// Session lookup / admission: the `sessionGetter` step.
    async fn admit(&self, msg: &SipMessage, from: SocketAddr) -> (Option<SipSession>, Admission) {
        let call_id = msg.call_id.clone();
        if let Some(existing) = self.find_session(&call_id) {
            if existing.is_duplicate_message(msg).await
                || msg.is_request() && msg.method() == Some(SipMethod::Invite) && existing.get_state() != SessionState::Created
            {
                return (Some(existing), Admission::DuplicateMessage);
            }
            return (Some(existing), Admission::ValidRequest);
        }

        if msg.is_response() {
            tracing::debug!(call_id = %call_id, "response without session - discarded");
            return (None, Admission::Response);
        }

        let session = SipSession::new_inbound(msg, self);
        session.set_remote_udp(Some(from));
        self.add_session(&session);

        if !msg.to_tag.is_empty() {
            return (Some(session), Admission::CallLegTransactionNotExist);
        }

        let method = msg.method().expect("requests carry a method");
        match method {
            SipMethod::Invite => {
                session.set_mode(SessionMode::Multimedia);
                session.set_prack_supported(msg.is_option_supported("100rel"));
                session.set_delayed_offer(!msg.contains_sdp());
                session.set_state(SessionState::BeingEstablished);
                if !msg.is_known_ruri_scheme() {
                    return (Some(session), Admission::UnsupportedUriScheme);
                }
                if msg.with_unknown_body_part() {
                    return (Some(session), Admission::UnsupportedBody);
                }
                if msg.headers.exists(hdr::REQUIRE) && !msg.is_option_required("100rel") {
                    return (Some(session), Admission::WithRequireHeader);
                }
                if msg.max_fwds.is_some_and(|mf| mf <= MIN_MAX_FORWARDS) {
                    return (Some(session), Admission::TooLowMaxForwards);
                }
                if !self.0.limiter.accept_new_call() {
                    return (Some(session), Admission::ExceededCallRate);
                }
                self.0.metrics.inc_calls();
                (Some(session), Admission::ValidRequest)
            }
            SipMethod::Message => {
                session.set_mode(SessionMode::Messaging);
                (Some(session), Admission::ValidRequest)
            }
            SipMethod::Subscribe => {
                session.set_mode(SessionMode::Subscription);
                (Some(session), Admission::ValidRequest)
            }
            SipMethod::Options => {
                session.set_mode(SessionMode::KeepAlive);
                (Some(session), Admission::ValidRequest)
            }
            SipMethod::Register => {
                session.set_mode(SessionMode::Registration);
                (Some(session), Admission::ValidRequest)
            }
            SipMethod::Refer
            | SipMethod::Notify
            | SipMethod::Update
            | SipMethod::Prack
            | SipMethod::Info
            | SipMethod::Publish => (Some(session), Admission::InvalidRequest),
            SipMethod::Ack => (Some(session), Admission::UnexpectedMessage),
            _ => (Some(session), Admission::CallLegTransactionNotExist),
        }
    }

    // ---- request dispatch (B2BUA ingress rules) -------------------

    async fn dispatch_request(&self, session: &SipSession, tx: &Transaction, msg: &SipMessage) {
        if msg.with_unknown_body_part() {
            session
                .send_created_response(Some(tx), status::UNSUPPORTED_MEDIA_TYPE, MessageBody::empty())
                .await;
            return;
        }

        let method = msg.method().expect("requests carry a method");
        match method {
            SipMethod::Invite => {
                session
                    .send_created_response(Some(tx), status::TRYING, MessageBody::empty())
                    .await;
                if self.0.config.sipp_testing {
                    session
                        .send_created_response(Some(tx), status::RINGING, MessageBody::empty())
                        .await;
                    session
                        .send_created_response(Some(tx), status::OK, MessageBody::empty())
                        .await;
                    return;
                }
                self.route_request(session, tx, msg).await;
            }
            SipMethod::ReInvite => self.on_reinvite_or_update(session, tx, msg, SipMethod::ReInvite).await,
            SipMethod::Update => {
                if !msg.has_body() {
                    session
                        .send_created_response(Some(tx), status::OK, MessageBody::empty())
                        .await;
                    return;
                }
                self.on_reinvite_or_update(session, tx, msg, SipMethod::Update).await;
            }
            SipMethod::Ack => self.on_ack(session, tx, msg).await,
            SipMethod::Cancel => self.on_cancel(session, tx).await,
            SipMethod::Bye => self.on_bye(session, tx).await,
            SipMethod::Options => {
                if msg.is_out_of_dialog() {
                    session.set_state(SessionState::Probed);
                    session
                        .send_created_response(Some(tx), status::OK, MessageBody::empty())
                        .await;
                    session.drop_me().await;
                    return;
                }
                // In-dialog probes are answered locally.
                session
                    .send_created_response(Some(tx), status::OK, MessageBody::empty())
                    .await;
            }
            SipMethod::Prack => {
                if tx.prack_status() != PrackStatus::Expected {
                    session
                        .send_created_response_detailed(
                            Some(tx),
                            ResponsePack::with_warning(status::BAD_REQUEST, "Bad or missing RAck header"),
                            MessageBody::empty(),
                        )
                        .await;
                    return;
                }
                session
                    .send_created_response(Some(tx), status::OK, MessageBody::empty())
                    .await;
                if let Some(linked) = session.linked_session() {
                    linked
                        .send_created_request(SipMethod::Prack, tx.linked().as_ref(), msg.body.clone())
                        .await;
                }
            }
            SipMethod::Refer => self.on_refer(session, tx, msg).await,
            SipMethod::Notify => {
                session
                    .send_created_response(Some(tx), status::METHOD_NOT_ALLOWED, MessageBody::empty())
                    .await;
            }
            SipMethod::Info => {
                session
                    .send_created_response(Some(tx), status::OK, MessageBody::empty())
                    .await;
                if let Some(linked) = session.linked_session() {
                    linked
                        .send_created_request(SipMethod::Info, Some(tx), msg.body.clone())
                        .await;
                }
            }
            SipMethod::Register => self.on_register(session, tx, msg).await,
            _ => {
                // SUBSCRIBE, MESSAGE, PUBLISH
                session.set_state(SessionState::Dropped);
                session
                    .send_created_response(Some(tx), status::METHOD_NOT_ALLOWED, MessageBody::empty())
                    .await;
                session.drop_me().await;
            }
        }
    }

    async fn on_reinvite_or_update(
        &self,
        session: &SipSession,
        tx: &Transaction,
        msg: &SipMessage,
        method: SipMethod,
    ) {
        if method == SipMethod::ReInvite {
            session
                .send_created_response(Some(tx), status::TRYING, MessageBody::empty())
                .await;
        }

        let Some(linked) = session.linked_session() else {
            // No bridge partner (echo responder leg): answer locally.
            if msg.contains_sdp() {
                self.answer_session_refresh_locally(session, tx, msg).await;
            } else {
                let warning = if method == SipMethod::ReInvite {
                    "Delayed-offer ReINVITE not supported"
                } else {
                    "Not Supported"
                };
                session
                    .send_created_response_detailed(
                        Some(tx),
                        ResponsePack::with_warning(status::NOT_ACCEPTABLE_HERE, warning),
                        MessageBody::empty(),
                    )
                    .await;
            }
            return;
        };

        if !session.check_n_set_dialogue_changing(true) || linked.is_dialogue_changing() {
            let label = if method == SipMethod::ReInvite {
                "Competing ReINVITE rejected"
            } else {
                "Competing Update rejected"
            };
            session
                .send_created_response_detailed(
                    Some(tx),
                    ResponsePack::with_reason_warning(status::REQUEST_PENDING, "Request Pending", label),
                    MessageBody::empty(),
                )
                .await;
            return;
        }

        if method == SipMethod::ReInvite && linked.transform_early_to_final() {
            if msg.contains_sdp() {
                linked
                    .send_created_request(SipMethod::Update, Some(tx), msg.body.clone())
                    .await;
            } else {
                session
                    .send_created_response(Some(tx), status::NOT_ACCEPTABLE_HERE, MessageBody::empty())
                    .await;
            }
            return;
        }

        linked.send_created_request(method, Some(tx), msg.body.clone()).await;
    }

    /// A session refresh on an unbridged leg is answered with a
    /// symmetric SDP answer (echo responder semantics).
    async fn answer_session_refresh_locally(&self, session: &SipSession, tx: &Transaction, msg: &SipMessage) {
        let offer = msg
            .body
            .sdp_bytes()
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|text| SdpSession::parse(text).ok());
        let local = session.media_socket().and_then(|s| s.local_addr().ok());

        match (offer, local) {
            (Some(offer), Some(local)) => match offer.build_echo_answer(local) {
                Some((answer, held)) => {
                    session.set_held(held);
                    let body = MessageBody::single(crate::message::BodyType::Sdp, answer.to_string());
                    session.send_created_response(Some(tx), status::OK, body).await;
                }
                None => {
                    session
                        .send_created_response_detailed(
                            Some(tx),
                            ResponsePack::with_warning(status::NOT_ACCEPTABLE_HERE, "No supported codec in offer"),
                            MessageBody::empty(),
                        )
                        .await;
                }
            },
            _ => {
                session
                    .send_created_response_detailed(
                        Some(tx),
                        ResponsePack::with_warning(status::NOT_ACCEPTABLE_HERE, "Not supported SDP"),
                        MessageBody::empty(),
                    )
                    .await;
            }
        }
    }

    async fn on_ack(&self, session: &SipSession, tx: &Transaction, msg: &SipMessage) {
        if tx.method() == SipMethod::Invite {
            session.finalize_state();
            if !session.is_established() {
                // Call already cleared; clearing was handled locally.
                session.drop_me().await;
                return;
            }
            session.start_max_call_duration();
            session.start_in_dialog_probing();
            if let Some(linked) = session.linked_session() {
                if !linked.transform_early_to_final() {
                    linked.finalize_state();
                    linked
                        .send_created_request(SipMethod::Ack, None, msg.body.clone())
                        .await;
                }
            }
        } else {
            // ACK for a re-INVITE.
            if let Some(linked) = session.linked_session() {
                if let Some(peer_tx) = tx.linked() {
                    if peer_tx.is_final_response_positive() {
                        session.check_n_set_dialogue_changing(false);
                        linked.check_n_set_dialogue_changing(false);
                    }
                    if !linked.transform_early_to_final() {
                        linked
                            .send_created_request(SipMethod::Ack, Some(&peer_tx), msg.body.clone())
                            .await;
                    }
                }
            }
        }
    }

    async fn on_cancel(&self, session: &SipSession, tx: &Transaction) {
        if !session.is_being_established() {
            session
                .send_created_response_detailed(
                    Some(tx),
                    ResponsePack {
                        status_code: status::BAD_REQUEST,
                        reason_phrase: "Incompatible Method With Session State".into(),
                        ..Default::default()
                    },
                    MessageBody::empty(),
                )
                .await;
            return;
        }
        session.set_termination_cause("Caller cancelled the call");
        session.set_state(SessionState::BeingCancelled);
        session
            .send_created_response(Some(tx), status::OK, MessageBody::empty())
            .await;
        if let Some(linked) = session.linked_session() {
            linked.stop_all_out_transactions();
            if !linked.release_me("Caller cleared the call", None).await {
                linked.cancel_me(q850::NO_CAUSE, "").await;
            }
        }
        session
            .send_created_response_detailed(
                None,
                ResponsePack::with_q850(status::REQUEST_TERMINATED, status::REQUEST_TERMINATED, ""),
                MessageBody::empty(),
            )
            .await;
    }

    async fn on_bye(&self, session: &SipSession, tx: &Transaction) {
        if !session.is_established() {
            session
                .send_created_response_detailed(
                    Some(tx),
                    ResponsePack {
                        status_code: status::BAD_REQUEST,
                        reason_phrase: "Incompatible Method With Session State".into(),
                        ..Default::default()
                    },
                    MessageBody::empty(),
                )
                .await;
            return;
        }
        session.set_termination_cause("Caller cleared the call");
        session.set_state(SessionState::Cleared);
        session
            .send_created_response(Some(tx), status::OK, MessageBody::empty())
            .await;
        session.drop_me().await;
        if let Some(linked) = session.linked_session() {
            linked.stop_all_out_transactions();
            if !linked.release_me("Caller cleared the call", Some(tx)).await {
                linked.cancel_me(q850::NORMAL_CLEARING, "Caller cleared the call").await;
            }
        }
    }

    async fn on_refer(&self, session: &SipSession, tx: &Transaction, msg: &SipMessage) {
        let linked = session.linked_session();
        let peer_established = linked.as_ref().is_some_and(|l| l.is_established());
        if !session.is_established() || !peer_established {
            session
                .send_created_response_detailed(
                    Some(tx),
                    ResponsePack::with_warning(
                        status::TEMPORARILY_UNAVAILABLE,
                        "REFER received during early dialogue",
                    ),
                    MessageBody::empty(),
                )
                .await;
            return;
        }
        let Some(refer_to) = msg.headers.value(hdr::REFER_TO).map(str::to_string) else {
            session
                .send_created_response_detailed(
                    Some(tx),
                    ResponsePack::with_warning(status::BAD_REQUEST, "Missing Refer-To header"),
                    MessageBody::empty(),
                )
                .await;
            return;
        };

        // norefersub: the peer asked for no implicit subscription.
        let refer_sub = !msg.headers.value_contains(hdr::REFER_SUB, "false")
            && !msg.is_option_supported("norefersub");
        session.set_refer_subscription(refer_sub);
        session
            .send_created_response(Some(tx), status::ACCEPTED, MessageBody::empty())
            .await;
        tracing::info!(
            call_id = %session.call_id(),
            refer_to = %refer_to,
            "transfer accepted; dialog continues until the transferor clears it"
        );
    }

    async fn on_register(&self, session: &SipSession, tx: &Transaction, msg: &SipMessage) {
        let reg = msg.registration_data();
        if reg.expires < 0 {
            session.set_state(SessionState::Dropped);
            session
                .send_created_response_detailed(
                    Some(tx),
                    ResponsePack::with_warning(status::BAD_REQUEST, "Bad Contact header"),
                    MessageBody::empty(),
                )
                .await;
            session.drop_me().await;
            return;
        }
        let state = self.0.phones.add_or_update(&reg.ext, &reg.ruri, &reg.ipport, reg.expires);
        session.set_state(state);
        let mut pack = ResponsePack {
            status_code: status::OK,
            contact_header: reg.contact,
            ..Default::default()
        };
        pack.custom_headers.set(hdr::EXPIRES, reg.expires.to_string());
        session
            .send_created_response_detailed(Some(tx), pack, MessageBody::empty())
            .await;
        session.drop_me().await;
    }

    // ---- response dispatch (B2BUA egress rules) -------------------

    async fn dispatch_response(&self, session: &SipSession, tx: &Transaction, msg: &SipMessage) {
        let code = msg.status_code();
        if code <= 199 && !tx.method().requires_ack() {
            return;
        }

        if session.linked_session().is_some() {
            self.dispatch_bridged_response(session, tx, msg, code).await;
        } else {
            self.dispatch_unbridged_response(session, tx, code).await;
        }
    }

    async fn dispatch_bridged_response(
        &self,
        session: &SipSession,
        tx: &Transaction,
        msg: &SipMessage,
        code: u16,
    ) {
        let Some(linked) = session.linked_session() else { return };

        if is_provisional_18x(code) {
            if !session.is_being_established() {
                return;
            }
            session.stop_timer(SessionTimer::No18x);

            if session.transform_early_to_final() {
                if msg.contains_sdp() {
                    if !session.received_18x_sdp() {
                        session.set_received_18x_sdp();
                        linked.send_created_response(None, status::OK, msg.body.clone()).await;
                    }
                } else if !session.received_18x_sdp() {
                    linked.send_created_response(None, code, MessageBody::empty()).await;
                }
                return;
            }

            let mut pack = ResponsePack::of(code);
            if msg.is_option_required("100rel") {
                pack.linked_prack = session.generate_outgoing_prack(msg);
                // The PRACK entry lives in this leg's ledger until the
                // peer's PRACK releases it.
                if let Some(prack) = &pack.linked_prack {
                    session.add_transaction(prack.clone());
                }
            }
            if linked.is_being_established() {
                linked
                    .send_created_response_detailed(None, pack, msg.body.clone())
                    .await;
            }
            return;
        }

        if code <= 199 {
            // 100 Trying: (re)arm ringing supervision.
            if session.is_being_established() {
                session.start_timer(SessionTimer::No18x);
                session.start_timer(SessionTimer::NoAnswer);
            }
            return;
        }

        if code <= 299 {
            match tx.method() {
                SipMethod::Invite => {
                    if !session.is_being_established() {
                        // A 2xx landing after CANCEL won the race:
                        // answer it properly, then clear.
                        session.stop_all_out_transactions();
                        session.send_created_request(SipMethod::Ack, Some(tx), MessageBody::empty()).await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        session
                            .send_created_request_detailed(
                                RequestPack {
                                    method: Some(SipMethod::Bye),
                                    custom_headers: crate::message::reason_headers(
                                        status::REQUEST_TERMINATED,
                                        "Call cancelled already",
                                        "",
                                    ),
                                    ..Default::default()
                                },
                                None,
                                MessageBody::empty(),
                            )
                            .await;
                        return;
                    }
                    session.stop_no_timers();
                    if session.transform_early_to_final() {
                        session.set_transform_early_to_final(false);
                        if session.received_18x_sdp() {
                            // The early SDP was already promoted to a
                            // 200 on the ingress leg.
                            session.finalize_state();
                            session
                                .send_created_request(SipMethod::Ack, Some(tx), MessageBody::empty())
                                .await;
                            return;
                        }
                    }
                    linked.send_created_response(None, code, msg.body.clone()).await;
                }
                SipMethod::Cancel | SipMethod::Options | SipMethod::Info => {}
                SipMethod::Update => {
                    session.check_n_set_dialogue_changing(false);
                    linked.check_n_set_dialogue_changing(false);
                    linked
                        .send_created_response(tx.linked().as_ref(), code, msg.body.clone())
                        .await;
                }
                SipMethod::ReInvite => {
                    linked
                        .send_created_response(tx.linked().as_ref(), code, msg.body.clone())
                        .await;
                }
                SipMethod::Bye => {
                    session.stop_all_out_transactions();
                    session.finalize_state();
                    session.drop_me().await;
                }
                SipMethod::Prack => {}
                _ => {}
            }
            return;
        }

        if code <= 399 {
            match tx.method() {
                SipMethod::Invite => {
                    session.stop_no_timers();
                    session.ack_3xx_to_6xx(SessionState::Redirected).await;
                    self.reroute_request(&linked, code).await;
                }
                SipMethod::Cancel | SipMethod::Bye => {
                    tracing::warn!("received 3xx response on non-INVITE message");
                    session.drop_me().await;
                }
                _ => {
                    tracing::warn!("received 3xx response on non-INVITE message");
                    session.finalize_state();
                    session.release_call("Exotic 3xx response received on non-INVITE").await;
                }
            }
            return;
        }

        // 400-699
        match tx.method() {
            SipMethod::Invite => match session.get_state() {
                SessionState::BeingEstablished => {
                    session.stop_no_timers();
                    session.ack_3xx_to_6xx(SessionState::Rejected).await;
                    if session.transform_early_to_final() {
                        session.set_transform_early_to_final(false);
                        linked.stop_all_out_transactions();
                        if !linked.release_me("Called rejected the call", None).await {
                            let peer_tx = linked.get_last_unacked_inv(Direction::Inbound);
                            linked
                                .reject_me(peer_tx.as_ref(), code, q850::NORMAL_UNSPECIFIED, "Called rejected the call")
                                .await;
                        }
                        return;
                    }
                    self.reroute_request(&linked, code).await;
                }
                SessionState::BeingCancelled => {
                    session.ack_3xx_to_6xx_finalize().await;
                }
                _ => {}
            },
            SipMethod::ReInvite | SipMethod::Update => {
                session.check_n_set_dialogue_changing(false);
                linked.check_n_set_dialogue_changing(false);
                linked
                    .send_created_response(tx.linked().as_ref(), code, msg.body.clone())
                    .await;
            }
            SipMethod::Bye => {
                session.stop_all_out_transactions();
                session.finalize_state();
                session.drop_me().await;
            }
            SipMethod::Options => {
                if tx.is_probing() && (code == status::REQUEST_TIMEOUT || code == status::CALL_DOES_NOT_EXIST) {
                    session.release_call("Probing rejected but unexpectedly").await;
                }
            }
            _ => {}
        }
    }

    async fn dispatch_unbridged_response(&self, session: &SipSession, tx: &Transaction, code: u16) {
        match tx.method() {
            SipMethod::Options => {
                if session.mode() == SessionMode::KeepAlive && code >= 200 {
                    session.finalize_state();
                    if let Some(ua) = session.remote_ua() {
                        // Only a positive answer counts as liveness.
                        ua.set_alive(code <= 299);
                    }
                    session.drop_me().await;
                }
            }
            SipMethod::Bye => {
                if code >= 200 {
                    session.stop_all_out_transactions();
                    session.finalize_state();
                    session.drop_me().await;
                }
            }
            SipMethod::Invite if code >= 300 => {
                // Egress leg whose ingress vanished: settle and drop.
                session.stop_no_timers();
                if session.get_state() == SessionState::BeingCancelled {
                    session.ack_3xx_to_6xx_finalize().await;
                } else {
                    session.ack_3xx_to_6xx(SessionState::Rejected).await;
                }
            }
            _ => {}
        }
    }

    // ---- routing ---------------------------------------------------

    /// Routes the first INVITE of a new call: phones first, then the
    /// rule table (or the AS when configured).
    async fn route_request(&self, session: &SipSession, tx: &Transaction, msg: &SipMessage) {
        let userpart = msg
            .request_uri()
            .map(|u| u.userpart.clone())
            .unwrap_or_default();
        session.set_numbers(CallNumbers {
            caller: crate::message::uri::uri_userpart(&msg.from_header).unwrap_or_default().to_string(),
            called: userpart.clone(),
            translated_called: String::new(),
            termination_cause: String::new(),
        });

        if let Some(as_ua) = &self.0.as_ua {
            self.route_via_as(session, tx, msg, as_ua.clone(), &userpart).await;
            return;
        }
        self.route_internal(session, tx, msg, &userpart).await;
    }

    /// AS mode: calls from the AS terminate on registered phones,
    /// everything else goes up to the AS.
    async fn route_via_as(
        &self,
        session: &SipSession,
        tx: &Transaction,
        msg: &SipMessage,
        as_ua: Arc<SipUdpUserAgent>,
        userpart: &str,
    ) {
        let mut record = RoutingRecord::for_as(userpart);
        let mut body = msg.body.clone();
        let from_as = session.remote_udp() == Some(as_ua.addr());

        if from_as {
            let Some(phone) = self.0.phones.get(userpart) else {
                session
                    .reject_me(Some(tx), status::NOT_FOUND, q850::UNALLOCATED_NUMBER, "No target found")
                    .await;
                return;
            };
            if !phone.is_registered() {
                session
                    .reject_me(
                        Some(tx),
                        status::TEMPORARILY_UNAVAILABLE,
                        q850::NO_ANSWER_FROM_USER,
                        "target not registered",
                    )
                    .await;
                return;
            }
            if !phone.is_reachable() {
                session
                    .reject_me(
                        Some(tx),
                        status::DOES_NOT_EXIST_ANYWHERE,
                        q850::NO_ROUTE_TO_DESTINATION,
                        "target not reachable",
                    )
                    .await;
                return;
            }
            let Some(ua) = phone.ua() else {
                session
                    .reject_me(
                        Some(tx),
                        status::DOES_NOT_EXIST_ANYWHERE,
                        q850::NO_ROUTE_TO_DESTINATION,
                        "target not reachable",
                    )
                    .await;
                return;
            };
            record.remote_socket = Some(ua.addr());
            if !body.keep_only(crate::message::BodyType::Sdp) {
                session
                    .reject_me(
                        Some(tx),
                        status::NOT_ACCEPTABLE_HERE,
                        q850::BEARER_CAPABILITY_UNAVAILABLE,
                        "no remaining body",
                    )
                    .await;
                return;
            }
        } else {
            record.remote_socket = Some(as_ua.addr());
        }

        let record = Arc::new(record);
        self.build_egress_leg(session, msg, record, userpart.to_string(), body).await;
    }

    /// Internal routing: registered phones win over the rule table.
    async fn route_internal(&self, session: &SipSession, tx: &Transaction, msg: &SipMessage, userpart: &str) {
        let mut body = msg.body.clone();

        if let Some(phone) = self.0.phones.get(userpart) {
            let mut record = RoutingRecord::for_phone(userpart);
            if !phone.is_registered() {
                session
                    .reject_me(
                        Some(tx),
                        status::TEMPORARILY_UNAVAILABLE,
                        q850::NO_ANSWER_FROM_USER,
                        "target not registered",
                    )
                    .await;
                return;
            }
            if !phone.is_reachable() || phone.ua().is_none() {
                session
                    .reject_me(
                        Some(tx),
                        status::DOES_NOT_EXIST_ANYWHERE,
                        q850::NO_ROUTE_TO_DESTINATION,
                        "target not reachable",
                    )
                    .await;
                return;
            }
            record.remote_socket = phone.ua().map(|ua| ua.addr());
            if !body.keep_only(crate::message::BodyType::Sdp) {
                session
                    .reject_me(
                        Some(tx),
                        status::NOT_ACCEPTABLE_HERE,
                        q850::BEARER_CAPABILITY_UNAVAILABLE,
                        "no remaining body",
                    )
                    .await;
                return;
            }
            let record = Arc::new(record);
            self.build_egress_leg(session, msg, record, userpart.to_string(), body).await;
            return;
        }

        let Some((record, translated)) = self.0.routing.get(userpart) else {
            session
                .reject_me(Some(tx), status::NOT_FOUND, q850::UNALLOCATED_NUMBER, "No target found")
                .await;
            return;
        };

        if record.out_call_flow == CallFlow::TransformEarlyToFinal && session.is_delayed_offer() {
            session
                .reject_me(
                    Some(tx),
                    status::NOT_ACCEPTABLE_HERE,
                    q850::BEARER_CAPABILITY_UNAVAILABLE,
                    "Delayed offer not supported",
                )
                .await;
            return;
        }
        if record.out_call_flow != CallFlow::EchoResponder
            && record.no18x_timeout <= 0
            && record.no_answer_timeout <= 0
        {
            session
                .reject_me(
                    Some(tx),
                    status::SERVICE_UNAVAILABLE,
                    q850::NORMAL_UNSPECIFIED,
                    "Answer and 18x Timeouts cannot be both disabled",
                )
                .await;
            return;
        }

        let mut numbers = session.numbers();
        numbers.translated_called = translated.clone();
        session.set_numbers(numbers);

        if record.out_call_flow == CallFlow::EchoResponder {
            self.run_echo_responder(session, tx, msg, record).await;
            return;
        }

        if record.steer_media {
            let Some(socket) = self.0.media.reserve_socket() else {
                session
                    .reject_me(
                        Some(tx),
                        status::SERVICE_UNAVAILABLE,
                        q850::RESOURCE_UNAVAILABLE,
                        "No media port available for ingress",
                    )
                    .await;
                return;
            };
            session.set_media_socket(socket);
            session.set_routing(record.clone());
            media::spawn_forwarder(session.clone());
            self.0.metrics.set_media_ports_in_use(self.0.media.in_use() as i64);
        }

        self.build_egress_leg(session, msg, record, translated, body).await;
    }

    /// Creates, links and fires the outbound leg.
    async fn build_egress_leg(
        &self,
        ingress: &SipSession,
        msg: &SipMessage,
        record: Arc<RoutingRecord>,
        translated_userpart: String,
        body: MessageBody,
    ) {
        ingress.set_routing(record.clone());

        let egress = SipSession::new(Direction::Outbound, self);
        egress.set_egress_proxy(self.0.config.proxy);
        egress.set_remote_udp(record.remote_socket.or_else(|| ingress.remote_udp()));
        egress.set_routing(record.clone());
        egress.set_delayed_offer(ingress.is_delayed_offer());
        egress.set_prack_supported(
            record.out_call_flow == CallFlow::Transparent && ingress.is_prack_supported(),
        );
        egress.set_numbers(ingress.numbers());

        if record.steer_media {
            let Some(socket) = self.0.media.reserve_socket() else {
                egress.drop_me().await;
                ingress
                    .reject_me(
                        None,
                        status::SERVICE_UNAVAILABLE,
                        q850::RESOURCE_UNAVAILABLE,
                        "No media port available for egress",
                    )
                    .await;
                return;
            };
            egress.set_media_socket(socket);
            media::spawn_forwarder(egress.clone());
            self.0.metrics.set_media_ports_in_use(self.0.media.in_use() as i64);
        }

        let Some(invite) = egress.create_linked_invite(&translated_userpart, msg, body).await else {
            ingress
                .reject_me(None, status::SERVICE_UNAVAILABLE, q850::NORMAL_UNSPECIFIED, "Egress leg build failed")
                .await;
            return;
        };

        egress.set_linked_session(Some(ingress));
        ingress.set_linked_session(Some(&egress));
        egress.set_transform_early_to_final(record.out_call_flow == CallFlow::TransformEarlyToFinal);

        if !ingress.is_being_established() {
            return;
        }

        egress.set_state(SessionState::BeingEstablished);
        self.add_session(&egress);
        egress.send_st_message(&invite).await;
    }

    /// The echo responder flow: no egress leg is built; the stack
    /// rings, answers with a symmetric SDP and reflects RTP.
    async fn run_echo_responder(
        &self,
        session: &SipSession,
        tx: &Transaction,
        msg: &SipMessage,
        record: Arc<RoutingRecord>,
    ) {
        session.set_routing(record);

        let Some(offer) = msg
            .body
            .sdp_bytes()
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|text| SdpSession::parse(text).ok())
        else {
            session
                .reject_me(
                    Some(tx),
                    status::NOT_ACCEPTABLE_HERE,
                    q850::BEARER_CAPABILITY_UNAVAILABLE,
                    "Not supported SDP or delayed offer",
                )
                .await;
            return;
        };

        let Some(socket) = self.0.media.reserve_socket() else {
            session
                .reject_me(
                    Some(tx),
                    status::SERVICE_UNAVAILABLE,
                    q850::RESOURCE_UNAVAILABLE,
                    "No media port available for echo",
                )
                .await;
            return;
        };
        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(_) => {
                session
                    .reject_me(
                        Some(tx),
                        status::SERVICE_UNAVAILABLE,
                        q850::RESOURCE_UNAVAILABLE,
                        "No media port available for echo",
                    )
                    .await;
                return;
            }
        };
        session.set_media_socket(socket);
        self.0.metrics.set_media_ports_in_use(self.0.media.in_use() as i64);

        let Some((answer, held)) = offer.build_echo_answer(local) else {
            session
                .reject_me(
                    Some(tx),
                    status::NOT_ACCEPTABLE_HERE,
                    q850::BEARER_CAPABILITY_UNAVAILABLE,
                    "No supported codec in offer",
                )
                .await;
            return;
        };
        session.set_held(held);

        session
            .send_created_response(Some(tx), status::RINGING, MessageBody::empty())
            .await;

        let session = session.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ECHO_ANSWER_DELAY).await;
            if !session.is_being_established() {
                return;
            }
            let body = MessageBody::single(crate::message::BodyType::Sdp, answer.to_string());
            session.send_created_response(Some(&tx), status::OK, body).await;
            media::spawn_echo(session.clone());
        });
    }

    /// Failure surfaced from the egress leg: present a final to the
    /// ingress leg. No automatic retry.
    async fn reroute_request(&self, ingress: &SipSession, code: u16) {
        let text = match code {
            status::REQUEST_TERMINATED => "NOANSWER",
            status::REQUEST_TIMEOUT => "UNREACHABLE",
            _ => "REJECTED",
        };
        let Some(tx) = ingress.get_last_unacked_inv(Direction::Inbound) else {
            return;
        };
        if ingress.is_being_established() {
            ingress.set_linked_session(None);
            ingress
                .reject_me(Some(&tx), code, q850::NORMAL_UNSPECIFIED, text)
                .await;
        }
    }

    // ---- transaction timeout dispatch ------------------------------

    /// Called when an outbound transaction exhausted its
    /// retransmissions without an answer.
    pub(crate) async fn check_pending_transaction(&self, session: &SipSession, tx: &Transaction) {
        if tx.is_finalized() || session.is_disposed() {
            return;
        }
        tracing::warn!(
            call_id = %session.call_id(),
            method = %tx.method(),
            "transaction timed out"
        );

        if tx.is_probing() {
            if session.mode() == SessionMode::KeepAlive {
                // Out-of-dialog probe: the UA is gone.
                session.finalize_state();
                if let Some(ua) = session.remote_ua() {
                    ua.set_alive(false);
                }
                session.drop_me().await;
            } else {
                session.release_call("In-dialogue probing timeout").await;
            }
            return;
        }

        match tx.method() {
            SipMethod::Invite | SipMethod::ReInvite => {
                if tx.direction() == Direction::Outbound {
                    session.stop_no_timers();
                    session.set_termination_cause("UNREACHABLE");
                    session.set_state(SessionState::TimedOut);
                    let linked = session.linked_session();
                    session.drop_me().await;
                    if let Some(linked) = linked {
                        self.reroute_request(&linked, status::REQUEST_TIMEOUT).await;
                    }
                } else {
                    // Our final was never ACKed.
                    session.finalize_state();
                    session.drop_me().await;
                    if let Some(linked) = session.linked_session() {
                        linked.release_call("No ACK received").await;
                    }
                }
            }
            SipMethod::Bye | SipMethod::Cancel => {
                session.finalize_state();
                session.drop_me().await;
            }
            _ => {
                if session.mode() == SessionMode::KeepAlive {
                    session.finalize_state();
                    if let Some(ua) = session.remote_ua() {
                        ua.set_alive(false);
                    }
                    session.drop_me().await;
                }
            }
        }
    }

    // ---- UA probing ------------------------------------------------

    fn spawn_ua_probing(&self) {
        let stack = self.clone();
        let period = Duration::from_secs(self.0.config.ka_interval.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(as_ua) = stack.0.as_ua.clone() {
                    stack.probe_ua(as_ua).await;
                }
                for phone in stack.0.phones.all() {
                    if phone.is_reachable() && phone.is_registered() {
                        if let Some(ua) = phone.ua() {
                            stack.probe_ua(ua).await;
                        }
                    }
                }
                stack.0.metrics.set_caps(stack.0.limiter.current_caps());
            }
        });
    }

    /// One out-of-dialog OPTIONS probe toward a UA.
    pub(crate) async fn probe_ua(&self, ua: Arc<SipUdpUserAgent>) {
        let session = SipSession::new(Direction::Outbound, self);
        session.set_remote_udp(Some(ua.addr()));
        session.set_remote_ua(ua);
        session.set_state(SessionState::BeingProbed);
        let pack = RequestPack {
            method: Some(SipMethod::Options),
            from_userpart: "probe".into(),
            is_probing: true,
            ..Default::default()
        };
        if session.create_sa_request(pack, MessageBody::empty()).await.is_some() {
            self.add_session(&session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_stack() -> SipStack {
        let mut config = Config::for_tests();
        config.media_start_port = 39200;
        config.media_end_port = 39203;
        SipStack::start_for_tests(config).await.unwrap()
    }

    #[tokio::test]
    async fn drop_me_is_idempotent() {
        let stack = test_stack().await;
        let session = SipSession::new(Direction::Inbound, &stack);
        session.set_call_id("drop-test");
        stack.add_session(&session);
        let media = stack.media().reserve_socket().unwrap();
        session.set_media_socket(media);
        assert_eq!(stack.session_count(), 1);
        assert_eq!(stack.media().in_use(), 1);

        session.drop_me().await;
        session.drop_me().await;
        session.drop_me().await;

        assert_eq!(stack.session_count(), 0);
        assert_eq!(stack.media().in_use(), 0);
        assert!(session.is_disposed());
    }

    #[tokio::test]
    async fn dialogue_changing_latch_is_check_and_set() {
        let stack = test_stack().await;
        let session = SipSession::new(Direction::Inbound, &stack);
        assert!(session.check_n_set_dialogue_changing(true));
        // Second taker loses the race.
        assert!(!session.check_n_set_dialogue_changing(true));
        assert!(session.is_dialogue_changing());
        assert!(session.check_n_set_dialogue_changing(false));
        assert!(!session.is_dialogue_changing());
    }

    #[tokio::test]
    async fn cseq_counters_are_monotonic_and_disjoint() {
        let stack = test_stack().await;
        let session = SipSession::new(Direction::Outbound, &stack);
        let first = session.next_fwd_cseq();
        assert!((1..=500).contains(&first));
        assert_eq!(session.next_fwd_cseq(), first + 1);
        assert_eq!(session.next_fwd_cseq(), first + 2);

        let bwd = session.next_bwd_cseq();
        assert!((600..=1000).contains(&bwd));
        assert_eq!(session.next_bwd_cseq(), bwd + 1);
        assert!(bwd > first + 2);
    }

    #[tokio::test]
    async fn rseq_allocation_is_monotonic() {
        let stack = test_stack().await;
        let session = SipSession::new(Direction::Inbound, &stack);
        let first = session.next_rseq();
        assert!((1..=999).contains(&first));
        assert_eq!(session.next_rseq(), first + 1);
        assert_eq!(session.next_rseq(), first + 2);
    }

    #[tokio::test]
    async fn linked_sessions_resolve_through_the_map() {
        let stack = test_stack().await;
        let a = SipSession::new(Direction::Inbound, &stack);
        a.set_call_id("leg-a");
        let b = SipSession::new(Direction::Outbound, &stack);
        b.set_call_id("leg-b");
        stack.add_session(&a);
        stack.add_session(&b);
        a.set_linked_session(Some(&b));
        b.set_linked_session(Some(&a));

        assert_eq!(&*a.linked_session().unwrap().call_id(), "leg-b");

        // A dropped peer leaves only a dangling handle behind.
        b.drop_me().await;
        assert!(a.linked_session().is_none());
    }
}
