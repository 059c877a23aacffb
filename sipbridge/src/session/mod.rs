//! Dialog (session) layer.
//!
//! A [`SipSession`] is one SIP dialog: its identity triple, state
//! machine, CSeq counters, transaction ledger, timers and (optional)
//! media socket. B2BUA bridging links two sessions through the global
//! sessions map: each leg only keeps the peer's Call-ID and
//! re-validates it through the map before use, so a dropped peer can
//! never be dereferenced.

pub mod state;

mod requests;
mod responses;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};

use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;
use util::ArcStr;

pub use state::{SessionMode, SessionState};

use crate::message::code::q850;
use crate::message::{SipMessage, SipMethod, hdr};
use crate::parser;
use crate::sdp::SdpSession;
use crate::stack::SipStack;
use crate::transaction::{Direction, PrackStatus, Transaction};

/// Session-level timers armed by the dialog layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTimer {
    No18x,
    NoAnswer,
    MaxCallDuration,
}

#[derive(Default)]
struct DialogIds {
    call_id: ArcStr,
    from_tag: String,
    to_tag: String,
    from_header: String,
    to_header: String,
    remote_uri: String,
    remote_contact_uri: String,
}

#[derive(Default)]
struct RemoteAddrs {
    remote_udp: Option<SocketAddr>,
    remote_contact_udp: Option<SocketAddr>,
    egress_proxy: Option<SocketAddr>,
}

#[derive(Default)]
struct SessionFlags {
    is_disposed: bool,
    dialogue_changing: bool,
    transform_early_to_final: bool,
    is_held: bool,
    refer_subscription: bool,
    is_delayed_offer: bool,
    received_18x_sdp: bool,
    is_prack_supported: bool,
}

#[derive(Default)]
struct Timers {
    no18x: Option<CancellationToken>,
    no_answer: Option<CancellationToken>,
    max_duration: Option<CancellationToken>,
    probing: Option<CancellationToken>,
}

#[derive(Default)]
struct CseqCounters {
    fwd: u32,
    bwd: u32,
}

/// Per-dialog SDP bookkeeping: id assigned once, version bumped only
/// when the description actually changes.
#[derive(Default)]
struct SdpState {
    session_id: i64,
    version: i64,
    snapshot: String,
}

/// Names recorded for the call detail record.
#[derive(Default, Clone)]
pub struct CallNumbers {
    pub caller: String,
    pub called: String,
    pub translated_called: String,
    pub termination_cause: String,
}

pub(crate) struct SessionInner {
    direction: Direction,
    stack: Weak<crate::stack::StackInner>,
    created_at: SystemTime,

    ids: RwLock<DialogIds>,
    state: RwLock<SessionState>,
    mode: RwLock<SessionMode>,
    transactions: RwLock<Vec<Transaction>>,
    remote: RwLock<RemoteAddrs>,
    record_routes: RwLock<Vec<String>>,
    linked: RwLock<Option<ArcStr>>,
    routing: RwLock<Option<Arc<crate::routing::RoutingRecord>>>,
    remote_ua: RwLock<Option<Arc<crate::phones::SipUdpUserAgent>>>,

    cseq: Mutex<CseqCounters>,
    rseq: AtomicU32,
    sdp: Mutex<SdpState>,
    flags: Mutex<SessionFlags>,
    timers: Mutex<Timers>,
    numbers: Mutex<CallNumbers>,

    media: Mutex<Option<Arc<UdpSocket>>>,
    remote_media: RwLock<Option<SocketAddr>>,

    /// Closed exactly once on disposal; observed by the prober, the
    /// media loops and the timer tasks.
    done: CancellationToken,
}

/// Shared handle to one dialog.
#[derive(Clone)]
pub struct SipSession(pub(crate) Arc<SessionInner>);

impl SipSession {
    pub(crate) fn new(direction: Direction, stack: &SipStack) -> Self {
        SipSession(Arc::new(SessionInner {
            direction,
            stack: stack.downgrade(),
            created_at: SystemTime::now(),
            ids: RwLock::default(),
            state: RwLock::new(SessionState::Created),
            mode: RwLock::default(),
            transactions: RwLock::default(),
            remote: RwLock::default(),
            record_routes: RwLock::default(),
            linked: RwLock::default(),
            routing: RwLock::default(),
            remote_ua: RwLock::default(),
            cseq: Mutex::default(),
            rseq: AtomicU32::new(0),
            sdp: Mutex::default(),
            flags: Mutex::default(),
            timers: Mutex::default(),
            numbers: Mutex::default(),
            media: Mutex::new(None),
            remote_media: RwLock::default(),
            done: CancellationToken::new(),
        }))
    }

    /// A new inbound dialog seeded from its first request.
    pub(crate) fn new_inbound(msg: &SipMessage, stack: &SipStack) -> Self {
        let session = Self::new(Direction::Inbound, stack);
        {
            let mut ids = session.0.ids.write().expect("ids lock");
            ids.call_id = ArcStr::from(msg.call_id.as_str());
        }
        *session.0.record_routes.write().expect("rr lock") = msg
            .headers
            .values(hdr::RECORD_ROUTE)
            .into_iter()
            .map(str::to_string)
            .collect();
        session
    }

    pub(crate) fn stack(&self) -> Option<SipStack> {
        self.0.stack.upgrade().map(SipStack::from_inner)
    }

    pub fn direction(&self) -> Direction {
        self.0.direction
    }

    pub fn created_at(&self) -> SystemTime {
        self.0.created_at
    }

    pub fn done_token(&self) -> CancellationToken {
        self.0.done.clone()
    }

    // ---- identity -------------------------------------------------

    pub fn call_id(&self) -> ArcStr {
        self.0.ids.read().expect("ids lock").call_id.clone()
    }

    pub fn set_call_id(&self, call_id: &str) {
        self.0.ids.write().expect("ids lock").call_id = ArcStr::from(call_id);
    }

    pub fn from_tag(&self) -> String {
        self.0.ids.read().expect("ids lock").from_tag.clone()
    }

    pub fn to_tag(&self) -> String {
        self.0.ids.read().expect("ids lock").to_tag.clone()
    }

    pub fn from_header(&self) -> String {
        self.0.ids.read().expect("ids lock").from_header.clone()
    }

    pub fn to_header(&self) -> String {
        self.0.ids.read().expect("ids lock").to_header.clone()
    }

    fn with_ids<R>(&self, f: impl FnOnce(&mut DialogIds) -> R) -> R {
        f(&mut self.0.ids.write().expect("ids lock"))
    }

    // ---- state ----------------------------------------------------

    pub fn get_state(&self) -> SessionState {
        *self.0.state.read().expect("state lock")
    }

    /// Linearizable state change; returns the prior state.
    pub fn set_state(&self, state: SessionState) -> SessionState {
        let mut guard = self.0.state.write().expect("state lock");
        std::mem::replace(&mut *guard, state)
    }

    /// Settles a pending state into its terminal form; identity on
    /// terminal states. Returns the prior state.
    pub fn finalize_state(&self) -> SessionState {
        let mut guard = self.0.state.write().expect("state lock");
        let prior = *guard;
        *guard = prior.finalized();
        prior
    }

    pub fn is_established(&self) -> bool {
        self.get_state() == SessionState::Established
    }

    pub fn is_being_established(&self) -> bool {
        self.get_state() == SessionState::BeingEstablished
    }

    // ---- mode, flags ----------------------------------------------

    pub fn mode(&self) -> SessionMode {
        *self.0.mode.read().expect("mode lock")
    }

    pub fn set_mode(&self, mode: SessionMode) {
        *self.0.mode.write().expect("mode lock") = mode;
    }

    fn with_flags<R>(&self, f: impl FnOnce(&mut SessionFlags) -> R) -> R {
        f(&mut self.0.flags.lock().expect("flags lock"))
    }

    pub fn is_prack_supported(&self) -> bool {
        self.with_flags(|f| f.is_prack_supported)
    }

    pub fn set_prack_supported(&self, v: bool) {
        self.with_flags(|f| f.is_prack_supported = v);
    }

    pub fn is_delayed_offer(&self) -> bool {
        self.with_flags(|f| f.is_delayed_offer)
    }

    pub fn set_delayed_offer(&self, v: bool) {
        self.with_flags(|f| f.is_delayed_offer = v);
    }

    pub fn transform_early_to_final(&self) -> bool {
        self.with_flags(|f| f.transform_early_to_final)
    }

    pub fn set_transform_early_to_final(&self, v: bool) {
        self.with_flags(|f| f.transform_early_to_final = v);
    }

    pub fn received_18x_sdp(&self) -> bool {
        self.with_flags(|f| f.received_18x_sdp)
    }

    pub fn set_received_18x_sdp(&self) {
        self.with_flags(|f| f.received_18x_sdp = true);
    }

    pub fn is_held(&self) -> bool {
        self.with_flags(|f| f.is_held)
    }

    pub fn set_held(&self, v: bool) {
        self.with_flags(|f| f.is_held = v);
    }

    pub fn refer_subscription(&self) -> bool {
        self.with_flags(|f| f.refer_subscription)
    }

    pub fn set_refer_subscription(&self, v: bool) {
        self.with_flags(|f| f.refer_subscription = v);
    }

    /// Atomically flips the dialogue-changing latch. Returns false if
    /// the latch was already in the requested position (a competing
    /// re-INVITE lost the race).
    pub fn check_n_set_dialogue_changing(&self, value: bool) -> bool {
        self.with_flags(|f| {
            if f.dialogue_changing == value {
                false
            } else {
                f.dialogue_changing = value;
                true
            }
        })
    }

    pub fn is_dialogue_changing(&self) -> bool {
        self.with_flags(|f| f.dialogue_changing)
    }

    // ---- linked leg -----------------------------------------------

    /// The bridge partner, re-validated through the sessions map.
    pub fn linked_session(&self) -> Option<SipSession> {
        let call_id = self.0.linked.read().expect("linked lock").clone()?;
        self.stack()?.find_session(&call_id)
    }

    pub fn set_linked_session(&self, other: Option<&SipSession>) {
        *self.0.linked.write().expect("linked lock") = other.map(|s| s.call_id());
    }

    // ---- addressing -----------------------------------------------

    pub fn remote_udp(&self) -> Option<SocketAddr> {
        self.0.remote.read().expect("remote lock").remote_udp
    }

    pub fn set_remote_udp(&self, addr: Option<SocketAddr>) {
        self.0.remote.write().expect("remote lock").remote_udp = addr;
    }

    pub fn remote_contact_udp(&self) -> Option<SocketAddr> {
        self.0.remote.read().expect("remote lock").remote_contact_udp
    }

    pub fn egress_proxy(&self) -> Option<SocketAddr> {
        self.0.remote.read().expect("remote lock").egress_proxy
    }

    pub fn set_egress_proxy(&self, addr: Option<SocketAddr>) {
        self.0.remote.write().expect("remote lock").egress_proxy = addr;
    }

    pub fn record_routes(&self) -> Vec<String> {
        self.0.record_routes.read().expect("rr lock").clone()
    }

    pub fn remote_uri(&self) -> String {
        self.0.ids.read().expect("ids lock").remote_uri.clone()
    }

    pub fn remote_contact_uri(&self) -> String {
        self.0.ids.read().expect("ids lock").remote_contact_uri.clone()
    }

    // ---- routing record -------------------------------------------

    pub fn routing(&self) -> Option<Arc<crate::routing::RoutingRecord>> {
        self.0.routing.read().expect("routing lock").clone()
    }

    pub fn set_routing(&self, record: Arc<crate::routing::RoutingRecord>) {
        *self.0.routing.write().expect("routing lock") = Some(record);
    }

    pub fn remote_ua(&self) -> Option<Arc<crate::phones::SipUdpUserAgent>> {
        self.0.remote_ua.read().expect("ua lock").clone()
    }

    pub fn set_remote_ua(&self, ua: Arc<crate::phones::SipUdpUserAgent>) {
        *self.0.remote_ua.write().expect("ua lock") = Some(ua);
    }

    // ---- CDR numbers ----------------------------------------------

    pub fn numbers(&self) -> CallNumbers {
        self.0.numbers.lock().expect("numbers lock").clone()
    }

    pub fn set_numbers(&self, numbers: CallNumbers) {
        *self.0.numbers.lock().expect("numbers lock") = numbers;
    }

    /// First cause wins; later teardown paths keep the original.
    pub fn set_termination_cause(&self, cause: &str) {
        let mut guard = self.0.numbers.lock().expect("numbers lock");
        if guard.termination_cause.is_empty() {
            guard.termination_cause = cause.to_string();
        }
    }

    // ---- media ----------------------------------------------------

    pub fn media_socket(&self) -> Option<Arc<UdpSocket>> {
        self.0.media.lock().expect("media lock").clone()
    }

    pub fn set_media_socket(&self, socket: Arc<UdpSocket>) {
        *self.0.media.lock().expect("media lock") = Some(socket);
    }

    pub fn remote_media(&self) -> Option<SocketAddr> {
        *self.0.remote_media.read().expect("remote media lock")
    }

    pub fn set_remote_media(&self, addr: SocketAddr) {
        *self.0.remote_media.write().expect("remote media lock") = Some(addr);
    }

    // ---- CSeq and RSeq allocation ---------------------------------

    /// The forward counter seeds randomly in 1..=500 and the backward
    /// one in 600..=1000 so the two directions never collide.
    pub(crate) fn next_fwd_cseq(&self) -> u32 {
        let mut guard = self.0.cseq.lock().expect("cseq lock");
        guard.fwd = match guard.fwd {
            0 => rand::random_range(1..=500),
            n => n + 1,
        };
        guard.fwd
    }

    pub(crate) fn next_bwd_cseq(&self) -> u32 {
        let mut guard = self.0.cseq.lock().expect("cseq lock");
        guard.bwd = match guard.bwd {
            0 => rand::random_range(600..=1000),
            n => n + 1,
        };
        guard.bwd
    }

    pub(crate) fn seed_fwd_cseq(&self, value: u32) {
        self.0.cseq.lock().expect("cseq lock").fwd = value;
    }

    /// Monotonic RSeq with a random start in 1..=999.
    pub(crate) fn next_rseq(&self) -> u32 {
        let cur = self.0.rseq.load(Ordering::SeqCst);
        let next = if cur == 0 { rand::random_range(1..=999) } else { cur + 1 };
        self.0.rseq.store(next, Ordering::SeqCst);
        next
    }

    // ---- transaction ledger ---------------------------------------

    pub(crate) fn add_transaction(&self, tx: Transaction) {
        self.0.transactions.write().expect("tx lock").push(tx);
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.0.transactions.read().expect("tx lock").clone()
    }

    pub fn has_no_transactions(&self) -> bool {
        self.0.transactions.read().expect("tx lock").is_empty()
    }

    pub(crate) fn find_transaction_for_response(&self, msg: &SipMessage) -> Option<Transaction> {
        self.0
            .transactions
            .read()
            .expect("tx lock")
            .iter()
            .find(|tx| tx.matches_response(msg))
            .cloned()
    }

    /// The most recent (re)INVITE transaction owning this CSeq.
    pub(crate) fn get_re_or_invite_tx(&self, cseq: u32) -> Option<Transaction> {
        self.0
            .transactions
            .read()
            .expect("tx lock")
            .iter()
            .rev()
            .find(|tx| tx.cseq() == cseq && tx.method().requires_ack())
            .cloned()
    }

    /// The last unACKed (re)INVITE, any direction.
    pub(crate) fn get_unacked_inv_or_reinv(&self) -> Option<Transaction> {
        self.0
            .transactions
            .read()
            .expect("tx lock")
            .iter()
            .rev()
            .find(|tx| tx.method().requires_ack() && !tx.is_acked())
            .cloned()
    }

    pub(crate) fn get_last_unacked_inv(&self, direction: Direction) -> Option<Transaction> {
        self.0
            .transactions
            .read()
            .expect("tx lock")
            .iter()
            .rev()
            .find(|tx| {
                tx.direction() == direction && tx.method().requires_ack() && !tx.is_acked()
            })
            .cloned()
    }

    pub(crate) fn get_prack_tx(&self, rseq: u32, cseq: u32) -> Option<Transaction> {
        self.0
            .transactions
            .read()
            .expect("tx lock")
            .iter()
            .find(|tx| {
                tx.method() == SipMethod::Prack
                    && tx.direction() == Direction::Inbound
                    && tx.prack_status() == PrackStatus::Expected
                    && tx.rseq() == rseq
                    && tx.cseq() == cseq
                    && !tx.is_finalized()
            })
            .cloned()
    }

    pub(crate) fn pending_outgoing_transactions(&self) -> Vec<Transaction> {
        self.0
            .transactions
            .read()
            .expect("tx lock")
            .iter()
            .filter(|tx| tx.direction() == Direction::Outbound && !tx.is_finalized())
            .cloned()
            .collect()
    }

    pub(crate) fn pending_incoming_transactions(&self) -> Vec<Transaction> {
        self.0
            .transactions
            .read()
            .expect("tx lock")
            .iter()
            .filter(|tx| tx.direction() == Direction::Inbound && !tx.is_finalized())
            .cloned()
            .collect()
    }

    pub fn stop_all_out_transactions(&self) {
        for tx in self.pending_outgoing_transactions() {
            tx.stop_retransmit();
        }
    }

    /// Retransmission and duplicate screening for messages arriving on
    /// an existing session. Duplicate inbound requests re-send the
    /// cached response.
    pub(crate) async fn is_duplicate_message(&self, msg: &SipMessage) -> bool {
        if msg.is_request() {
            if msg.method() == Some(SipMethod::Ack) {
                return false;
            }
            let duplicate = self
                .0
                .transactions
                .read()
                .expect("tx lock")
                .iter()
                .find(|tx| tx.matches_request(msg))
                .cloned();
            if let Some(tx) = duplicate {
                tracing::debug!(call_id = %msg.call_id, method = %msg, "duplicate request - retransmitting last response");
                if let Some(bytes) = tx.sent_bytes() {
                    self.send_raw(&bytes, tx.via_udp_addr()).await;
                }
                return true;
            }
            return false;
        }
        match self.find_transaction_for_response(msg) {
            Some(tx) => tx.is_duplicate_response(msg.status_code()),
            None => false,
        }
    }

    pub(crate) fn is_duplicate_invite(&self, msg: &SipMessage) -> bool {
        self.0
            .transactions
            .read()
            .expect("tx lock")
            .iter()
            .any(|tx| {
                tx.direction() == Direction::Inbound
                    && tx.method().requires_ack()
                    && tx.cseq() == msg.cseq_num
                    && tx.via_branch() == msg.via_branch
            })
    }

    // ---- ingress bookkeeping (ledger entry creation) ----------------

    /// Files an incoming request into the ledger. `None` means the
    /// message violates transaction rules and must be discarded.
    pub(crate) fn add_incoming_request(
        &self,
        msg: &SipMessage,
        linked: Option<&Transaction>,
    ) -> Option<Transaction> {
        let method = msg.method()?;

        // A BYE obsoletes every pending exchange on the dialog.
        if method == SipMethod::Bye {
            for pending in self.pending_outgoing_transactions() {
                pending.stop_retransmit();
            }
            for pending in self.pending_incoming_transactions() {
                if pending.method().requires_ack() && pending.is_finalized() && !pending.is_acked() {
                    pending.stop_retransmit();
                    pending.stop_cancel_aux();
                }
            }
        }

        match method {
            SipMethod::Ack => {
                let invite = self.get_re_or_invite_tx(msg.cseq_num)?;
                if invite.is_acked() {
                    tracing::warn!(call_id = %msg.call_id, "received duplicate ACK");
                    return None;
                }
                let same_branch = invite.via_branch() == msg.via_branch;
                if invite.ack_requires_same_branch() == same_branch
                    && invite.request().is_none_or(|r| r.from_tag == msg.from_tag)
                {
                    invite.set_acked();
                    invite.stop_retransmit();
                    invite.stop_cancel_aux();
                    return Some(invite);
                }
                tracing::warn!(call_id = %msg.call_id, "received ACK with improper Via branch");
                None
            }
            SipMethod::Cancel => {
                let invite = self.get_re_or_invite_tx(msg.cseq_num);
                match invite {
                    None => {
                        let tx = Transaction::from_incoming(msg, linked);
                        self.add_transaction(tx.clone());
                        Some(tx)
                    }
                    Some(invite) if invite.via_branch() == msg.via_branch => {
                        let tx = Transaction::from_incoming(msg, Some(&invite));
                        self.add_transaction(tx.clone());
                        Some(tx)
                    }
                    Some(_) => {
                        tracing::warn!(call_id = %msg.call_id, "received CANCEL with improper Via branch");
                        None
                    }
                }
            }
            SipMethod::Prack => {
                let tx = match msg.rseq_from_rack() {
                    Some((rseq, cseq, _)) => match self.get_prack_tx(rseq, cseq) {
                        Some(tx) => tx,
                        None => {
                            tracing::warn!(call_id = %msg.call_id, "no unPRACKed 1xx for incoming PRACK");
                            let tx = Transaction::prack_placeholder(0, 0, PrackStatus::Unexpected);
                            self.add_transaction(tx.clone());
                            tx
                        }
                    },
                    None => {
                        tracing::warn!(call_id = %msg.call_id, "missing or bad RAck header on PRACK");
                        let tx = Transaction::prack_placeholder(0, 0, PrackStatus::MissingBadRack);
                        self.add_transaction(tx.clone());
                        tx
                    }
                };
                tx.stop_retransmit();
                tx.set_request(Arc::new(msg.clone()));
                tx.set_cseq(msg.cseq_num);
                tx.set_via_branch(&msg.via_branch);
                Some(tx)
            }
            _ => {
                if method.requires_ack() && self.is_duplicate_invite(msg) {
                    return None;
                }
                let tx = Transaction::from_incoming(msg, linked);
                if method.is_dialog_creating() && self.0.direction == Direction::Inbound {
                    self.with_ids(|ids| {
                        ids.from_header = msg.from_header.clone();
                        ids.to_header = msg.to_header.clone();
                        ids.from_tag = msg.from_tag.clone();
                    });
                }
                self.add_transaction(tx.clone());
                Some(tx)
            }
        }
    }

    /// Files an incoming response onto its transaction, stopping the
    /// retransmit machinery and driving the cancel-aux timer.
    pub(crate) fn add_incoming_response(&self, msg: &SipMessage) -> Option<Transaction> {
        let tx = self.find_transaction_for_response(msg)?;
        let code = msg.status_code();
        tx.stop_retransmit();
        let newly_final = tx.record_response(code);
        if newly_final {
            match tx.method() {
                SipMethod::Cancel => {
                    // The INVITE this CANCEL covers gets a bounded
                    // grace period to be answered with 487.
                    if let Some(invite) = tx.linked() {
                        self.start_cancel_aux(&invite);
                    }
                }
                SipMethod::Invite | SipMethod::ReInvite => tx.stop_cancel_aux(),
                _ => {}
            }
        }

        if !msg.to_tag.is_empty() && self.0.direction == Direction::Outbound && self.to_tag().is_empty() {
            self.with_ids(|ids| {
                ids.to_tag = msg.to_tag.clone();
                ids.to_header = msg.to_header.clone();
            });
        }
        Some(tx)
    }

    /// Contact, Record-Route and media bookkeeping done for every
    /// message observed on the dialog.
    pub(crate) fn update_contact_record_route_media(&self, msg: &SipMessage) {
        if !msg.remote_contact_uri.is_empty() {
            self.with_ids(|ids| ids.remote_contact_uri = msg.remote_contact_uri.clone());
            if let Some(hostport) = crate::message::uri::uri_hostport(&msg.remote_contact_uri) {
                if let Some(addr) = parser::parse_socket(hostport, parser::SIP_PORT) {
                    self.0.remote.write().expect("remote lock").remote_contact_udp = Some(addr);
                }
            }
        }
        if self.0.direction == Direction::Outbound && msg.is_response() {
            let routes = msg.headers.values(hdr::RECORD_ROUTE);
            if !routes.is_empty() {
                let mut guard = self.0.record_routes.write().expect("rr lock");
                if guard.is_empty() {
                    *guard = routes.into_iter().map(str::to_string).collect();
                }
            }
        }
        if let Some(bytes) = msg.body.sdp_bytes() {
            if let Ok(text) = std::str::from_utf8(bytes) {
                if let Ok(sdp) = SdpSession::parse(text) {
                    if let Some(endpoint) = sdp.media_endpoint() {
                        self.set_remote_media(endpoint);
                    }
                }
            }
        }
    }

    // ---- SDP discipline -------------------------------------------

    /// Applies the per-dialog SDP invariants to an outgoing message:
    /// media steering re-anchors the connection on the relay socket,
    /// the session-id is assigned once and the version only moves when
    /// the description changed.
    pub(crate) fn prepare_outgoing_sdp(&self, msg: &mut SipMessage) {
        let Some(bytes) = msg.body.sdp_bytes().cloned() else {
            return;
        };
        let Ok(text) = std::str::from_utf8(&bytes) else {
            return;
        };
        let Ok(mut sdp) = SdpSession::parse(text) else {
            return;
        };

        let steer = self
            .routing()
            .is_some_and(|r| r.steer_media || r.out_call_flow == crate::routing::CallFlow::EchoResponder);
        if steer {
            if let Some(socket) = self.media_socket() {
                if let Ok(local) = socket.local_addr() {
                    sdp.rewrite_connection(local);
                }
            }
        }

        let mut guard = self.0.sdp.lock().expect("sdp lock");
        if guard.session_id == 0 {
            guard.session_id = rand::random_range(1000..=9000);
            guard.version = 1;
        }
        sdp.session_id = guard.session_id;
        sdp.session_version = guard.version;
        let rendered = sdp.to_string();
        if !guard.snapshot.is_empty() && guard.snapshot != rendered {
            guard.version += 1;
            sdp.session_version = guard.version;
        }
        let rendered = sdp.to_string();
        guard.snapshot = rendered.clone();
        drop(guard);

        msg.body.set_sdp(rendered);
    }

    // ---- wire I/O --------------------------------------------------

    fn sip_socket(&self) -> Option<Arc<UdpSocket>> {
        self.stack().map(|s| s.socket())
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.sip_socket().and_then(|s| s.local_addr().ok())
    }

    pub(crate) fn local_contact(&self) -> String {
        match self.local_addr() {
            Some(addr) => format!("<sip:{}>", addr),
            None => String::new(),
        }
    }

    pub(crate) fn local_via(&self, branch: &str) -> String {
        match self.local_addr() {
            Some(addr) => format!("SIP/2.0/UDP {};branch={}", addr, branch),
            None => String::new(),
        }
    }

    async fn send_raw(&self, bytes: &[u8], dest: Option<SocketAddr>) {
        let Some(socket) = self.sip_socket() else { return };
        let Some(dest) = dest.or_else(|| self.remote_udp()) else {
            tracing::error!(call_id = %self.call_id(), "no destination for outgoing message");
            return;
        };
        if let Err(err) = socket.send_to(bytes, dest).await {
            tracing::warn!(%err, %dest, "failed to send SIP datagram");
        }
    }

    fn request_destination(&self) -> Option<SocketAddr> {
        let remote = self.0.remote.read().expect("remote lock");
        remote
            .egress_proxy
            .or(remote.remote_contact_udp)
            .or(remote.remote_udp)
    }

    /// Serializes and sends the message attached to a transaction,
    /// arming retransmission for outbound requests and reliable 1xx.
    pub(crate) async fn send_st_message(&self, tx: &Transaction) {
        let Some(msg) = tx.sent_message() else {
            tracing::error!(call_id = %self.call_id(), "transaction has no message to send");
            return;
        };
        let mut msg = (*msg).clone();
        self.prepare_outgoing_sdp(&mut msg);
        let bytes = crate::serializer::serialize(&mut msg);
        let is_request = msg.is_request();
        tx.set_sent(Arc::new(msg), bytes.clone());

        let dest = if is_request {
            self.request_destination()
        } else {
            tx.request().and_then(|r| r.via_udp_addr).or_else(|| self.remote_udp())
        };
        self.send_raw(&bytes, dest).await;
        tracing::debug!(call_id = %self.call_id(), tx = %tx.key(), size = bytes.len(), "=> message sent");

        let retransmits =
            is_request && tx.direction() == Direction::Outbound && tx.method() != SipMethod::Ack;
        if retransmits {
            self.spawn_retransmit(tx, bytes, dest);
        }

        if is_request && tx.method().requires_ack() && self.0.direction == Direction::Outbound {
            self.start_timer(SessionTimer::No18x);
            self.start_timer(SessionTimer::NoAnswer);
        }
    }

    fn spawn_retransmit(&self, tx: &Transaction, bytes: bytes::Bytes, dest: Option<SocketAddr>) {
        let token = tx.arm_retransmit();
        let session = self.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut timeout = crate::transaction::T1;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = session.0.done.cancelled() => return,
                    _ = time::sleep(timeout) => {
                        match tx.next_retransmit() {
                            Some(next) => {
                                tracing::debug!(tx = %tx.key(), count = tx.retransmit_count(), "retransmitting");
                                session.send_raw(&bytes, dest).await;
                                timeout = next;
                            }
                            None => {
                                tx.stop_retransmit();
                                if let Some(stack) = session.stack() {
                                    stack.check_pending_transaction(&session, &tx).await;
                                }
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    /// 20×T1 grace period after an INVITE finalizes: if the dialog is
    /// still not settled when it fires, it is torn down.
    pub(crate) fn start_cancel_aux(&self, invite: &Transaction) {
        let Some(token) = invite.arm_cancel_aux() else { return };
        let session = self.clone();
        let invite = invite.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = session.0.done.cancelled() => {}
                _ = time::sleep(crate::transaction::CANCEL_AUX) => {
                    if !session.get_state().is_finalized() {
                        tracing::warn!(call_id = %session.call_id(), "cancel grace timer fired - dropping dialog");
                        session.finalize_state();
                        invite.stop_retransmit();
                        session.drop_me().await;
                    }
                }
            }
        });
    }

    // ---- session timers -------------------------------------------

    fn timer_slot<'a>(timers: &'a mut Timers, which: SessionTimer) -> &'a mut Option<CancellationToken> {
        match which {
            SessionTimer::No18x => &mut timers.no18x,
            SessionTimer::NoAnswer => &mut timers.no_answer,
            SessionTimer::MaxCallDuration => &mut timers.max_duration,
        }
    }

    fn timer_duration(&self, which: SessionTimer) -> Option<Duration> {
        let record = self.routing();
        let secs = match which {
            SessionTimer::No18x => record.as_ref().map_or(60, |r| r.no18x_timeout),
            SessionTimer::NoAnswer => record.as_ref().map_or(180, |r| r.no_answer_timeout),
            SessionTimer::MaxCallDuration => record.as_ref().map_or(0, |r| r.max_call_duration),
        };
        (secs > 0).then(|| Duration::from_secs(secs as u64))
    }

    /// Arms a session timer; arming an armed timer is a no-op.
    pub fn start_timer(&self, which: SessionTimer) {
        let Some(duration) = self.timer_duration(which) else {
            return;
        };
        let token = CancellationToken::new();
        {
            let mut timers = self.0.timers.lock().expect("timers lock");
            let slot = Self::timer_slot(&mut timers, which);
            if slot.is_some() {
                return;
            }
            *slot = Some(token.clone());
        }
        let session = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = session.0.done.cancelled() => {}
                _ = time::sleep(duration) => session.on_timer_fired(which).await,
            }
        });
    }

    pub fn stop_timer(&self, which: SessionTimer) {
        let mut timers = self.0.timers.lock().expect("timers lock");
        if let Some(token) = Self::timer_slot(&mut timers, which).take() {
            token.cancel();
        }
    }

    /// Stops the ringing supervision pair.
    pub fn stop_no_timers(&self) {
        self.stop_timer(SessionTimer::No18x);
        self.stop_timer(SessionTimer::NoAnswer);
    }

    async fn on_timer_fired(&self, which: SessionTimer) {
        match which {
            SessionTimer::No18x | SessionTimer::NoAnswer => {
                if !self.is_being_established() {
                    return;
                }
                let details = match which {
                    SessionTimer::No18x => "No response from far end",
                    _ => "No answer from far end",
                };
                tracing::info!(call_id = %self.call_id(), timer = ?which, "ringing supervision expired");
                self.stop_no_timers();
                self.cancel_me(q850::NO_ANSWER_FROM_USER, details).await;
                if let Some(linked) = self.linked_session() {
                    if linked.is_being_established() {
                        let tx = linked.get_last_unacked_inv(Direction::Inbound);
                        linked.set_linked_session(None);
                        linked
                            .reject_me(
                                tx.as_ref(),
                                crate::message::code::status::REQUEST_TERMINATED,
                                q850::NO_ANSWER_FROM_USER,
                                details,
                            )
                            .await;
                    }
                }
            }
            SessionTimer::MaxCallDuration => {
                tracing::info!(call_id = %self.call_id(), "max call duration reached");
                self.release_call("Max call duration reached").await;
            }
        }
    }

    /// Arms the wall-clock limit once the call is answered.
    pub fn start_max_call_duration(&self) {
        self.start_timer(SessionTimer::MaxCallDuration);
    }

    /// Periodic in-dialog OPTIONS probing; a dead peer tears the call
    /// down. Runs until the dialog is disposed.
    pub fn start_in_dialog_probing(&self) {
        let Some(stack) = self.stack() else { return };
        let interval = stack.indialogue_probing_interval();
        if interval == 0 {
            return;
        }
        {
            let mut timers = self.0.timers.lock().expect("timers lock");
            if timers.probing.is_some() {
                return;
            }
            let token = CancellationToken::new();
            timers.probing = Some(token.clone());
            let session = self.clone();
            tokio::spawn(async move {
                let mut ticker = time::interval(Duration::from_secs(interval));
                ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
                ticker.tick().await; // immediate first tick
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = session.0.done.cancelled() => return,
                        _ = ticker.tick() => {
                            if !session.is_established() {
                                continue;
                            }
                            session.send_in_dialog_options().await;
                        }
                    }
                }
            });
        }
    }

    // ---- disposal --------------------------------------------------

    pub fn is_disposed(&self) -> bool {
        self.with_flags(|f| f.is_disposed)
    }

    /// The single teardown path. Idempotent: any number of calls
    /// releases the media port once and removes the session from the
    /// map once.
    pub async fn drop_me(&self) {
        let first = self.with_flags(|f| {
            if f.is_disposed {
                false
            } else {
                f.is_disposed = true;
                true
            }
        });
        if !first {
            return;
        }

        tracing::debug!(call_id = %self.call_id(), state = %self.get_state(), "dropping session");
        self.0.done.cancel();
        {
            let mut timers = self.0.timers.lock().expect("timers lock");
            for token in [
                timers.no18x.take(),
                timers.no_answer.take(),
                timers.max_duration.take(),
                timers.probing.take(),
            ]
            .into_iter()
            .flatten()
            {
                token.cancel();
            }
        }
        for tx in self.transactions() {
            tx.stop_retransmit();
            tx.stop_cancel_aux();
        }

        if let Some(stack) = self.stack() {
            if let Some(socket) = self.0.media.lock().expect("media lock").take() {
                stack.media().release_socket(&socket);
            }
            stack.remove_session(self);
        }
    }
}

impl std::fmt::Display for SipSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Call-ID: {}, State: {}, Direction: {:?}, Mode: {}",
            self.call_id(),
            self.get_state(),
            self.0.direction,
            self.mode()
        )
    }
}
