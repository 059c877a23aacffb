//! Transaction ledger entries.
//!
//! A [`Transaction`] records one request and everything observed about
//! it: the responses in wire order, ACK/CANCEL/PRACK pairings and the
//! retransmission bookkeeping. Entries live in their dialog's ordered
//! ledger and die with it. The retransmit and cancel-aux timer tasks
//! themselves are spawned by the dialog layer; this module only owns
//! their cancellation handles.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::ids;
use crate::message::code::{is_final, is_positive, is_provisional};
use crate::message::{SipMessage, SipMethod};

/// RFC 3261 T1: retransmission baseline.
pub const T1: Duration = Duration::from_millis(500);

/// Retransmission attempts before a transaction is declared timed out.
pub const RETX_LIMIT: u32 = 7;

/// The cancel-aux timer runs 20×T1 after an INVITE finalizes to catch
/// lost ACKs and stuck CANCEL races.
pub const CANCEL_AUX: Duration = Duration::from_secs(10);

/// Which side created the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// PRACK pairing state of a reliable-1xx placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrackStatus {
    #[default]
    None,
    /// A reliable 1xx went out and its PRACK has not arrived yet.
    Expected,
    /// A PRACK arrived that matches no pending reliable 1xx.
    Unexpected,
    /// A PRACK arrived without a parsable RAck header.
    MissingBadRack,
}

struct TxState {
    cseq: u32,
    via_branch: String,
    rack: String,
    rseq: u32,
    responses: Vec<u16>,
    is_acked: bool,
    is_finalized: bool,
    prack_status: PrackStatus,
    request: Option<Arc<SipMessage>>,
    sent: Option<Arc<SipMessage>>,
    sent_bytes: Option<Bytes>,
    linked: Option<Weak<TxInner>>,
    ack: Option<Weak<TxInner>>,
    via_udp_addr: Option<SocketAddr>,
    use_remote_uri: bool,
    is_probing: bool,
    retx_count: u32,
    retx_timeout: Duration,
}

struct TxInner {
    key: String,
    direction: Direction,
    method: SipMethod,
    state: Mutex<TxState>,
    retx_token: Mutex<Option<CancellationToken>>,
    cancel_aux_token: Mutex<Option<CancellationToken>>,
}

/// A shared handle to one ledger entry.
#[derive(Clone)]
pub struct Transaction(Arc<TxInner>);

impl Transaction {
    fn build(direction: Direction, method: SipMethod, state: TxState) -> Self {
        Transaction(Arc::new(TxInner {
            key: ids::new_key(),
            direction,
            method,
            state: Mutex::new(state),
            retx_token: Mutex::new(None),
            cancel_aux_token: Mutex::new(None),
        }))
    }

    fn default_state() -> TxState {
        TxState {
            cseq: 0,
            via_branch: String::new(),
            rack: String::new(),
            rseq: 0,
            responses: Vec::new(),
            is_acked: false,
            is_finalized: false,
            prack_status: PrackStatus::None,
            request: None,
            sent: None,
            sent_bytes: None,
            linked: None,
            ack: None,
            via_udp_addr: None,
            use_remote_uri: false,
            is_probing: false,
            retx_count: 0,
            retx_timeout: T1,
        }
    }

    /// Ledger entry for a received request.
    pub fn from_incoming(msg: &SipMessage, linked: Option<&Transaction>) -> Self {
        let method = msg.method().expect("incoming request has a method");
        let mut state = Self::default_state();
        state.cseq = msg.cseq_num;
        state.via_branch = msg.via_branch.clone();
        state.via_udp_addr = msg.via_udp_addr;
        state.linked = linked.map(Transaction::downgrade);
        state.request = Some(Arc::new(msg.clone()));
        Self::build(Direction::Inbound, method, state)
    }

    /// Placeholder created when a reliable 1xx is sent; finalized by
    /// the matching PRACK.
    pub fn prack_placeholder(rseq: u32, cseq: u32, status: PrackStatus) -> Self {
        let mut state = Self::default_state();
        state.rseq = rseq;
        state.cseq = cseq;
        state.prack_status = status;
        Self::build(Direction::Inbound, SipMethod::Prack, state)
    }

    /// Pre-created outgoing PRACK mirroring a reliable 1xx received on
    /// this leg. `rack` is the full `RAck` value to send.
    pub fn outgoing_prack(rseq: u32, rack: String) -> Self {
        let mut state = Self::default_state();
        state.rseq = rseq;
        state.rack = rack;
        state.via_branch = ids::new_branch();
        Self::build(Direction::Outbound, SipMethod::Prack, state)
    }

    /// Ledger entry for a locally originated request with a fresh
    /// branch. Links back to `linked` for everything that is not an
    /// ACK or CANCEL pairing.
    pub fn outgoing(cseq: u32, method: SipMethod, linked: Option<&Transaction>) -> Self {
        let mut state = Self::default_state();
        state.cseq = cseq;
        state.via_branch = ids::new_branch();
        state.linked = linked.map(Transaction::downgrade);
        let tx = Self::build(Direction::Outbound, method, state);
        if let Some(linked) = linked {
            if !matches!(method, SipMethod::Ack | SipMethod::Cancel) {
                linked.set_linked(&tx);
            }
        }
        tx
    }

    /// The ACK for this INVITE transaction.
    ///
    /// A negative final reuses the INVITE branch and targets the
    /// original Request-URI; a 2xx gets a fresh branch and targets the
    /// remote Contact (RFC 3261 §17.1.1.3).
    pub fn create_ack(&self) -> Transaction {
        let negative = self.final_response().is_some_and(|c| c >= 300);
        let mut state = Self::default_state();
        {
            let guard = self.0.state.lock().expect("tx lock");
            state.cseq = guard.cseq;
            state.via_branch = if negative {
                guard.via_branch.clone()
            } else {
                ids::new_branch()
            };
            state.use_remote_uri = negative;
        }
        state.linked = Some(self.downgrade());
        let ack = Self::build(Direction::Outbound, SipMethod::Ack, state);
        self.0.state.lock().expect("tx lock").ack = Some(ack.downgrade());
        ack
    }

    /// A CANCEL for this outstanding INVITE: same branch, same CSeq
    /// number, its own ledger entry.
    pub fn create_cancel(&self) -> Transaction {
        let mut state = Self::default_state();
        {
            let guard = self.0.state.lock().expect("tx lock");
            state.cseq = guard.cseq;
            state.via_branch = guard.via_branch.clone();
        }
        state.linked = Some(self.downgrade());
        Self::build(Direction::Outbound, SipMethod::Cancel, state)
    }

    fn downgrade(&self) -> Weak<TxInner> {
        Arc::downgrade(&self.0)
    }

    pub fn key(&self) -> &str {
        &self.0.key
    }

    pub fn direction(&self) -> Direction {
        self.0.direction
    }

    pub fn method(&self) -> SipMethod {
        self.0.method
    }

    pub fn cseq(&self) -> u32 {
        self.0.state.lock().expect("tx lock").cseq
    }

    pub fn set_cseq(&self, cseq: u32) {
        self.0.state.lock().expect("tx lock").cseq = cseq;
    }

    pub fn via_branch(&self) -> String {
        self.0.state.lock().expect("tx lock").via_branch.clone()
    }

    pub fn set_via_branch(&self, branch: &str) {
        self.0.state.lock().expect("tx lock").via_branch = branch.to_string();
    }

    pub fn via_udp_addr(&self) -> Option<SocketAddr> {
        self.0.state.lock().expect("tx lock").via_udp_addr
    }

    pub fn rack(&self) -> String {
        self.0.state.lock().expect("tx lock").rack.clone()
    }

    pub fn rseq(&self) -> u32 {
        self.0.state.lock().expect("tx lock").rseq
    }

    pub fn prack_status(&self) -> PrackStatus {
        self.0.state.lock().expect("tx lock").prack_status
    }

    pub fn set_prack_status(&self, status: PrackStatus) {
        self.0.state.lock().expect("tx lock").prack_status = status;
    }

    pub fn is_probing(&self) -> bool {
        self.0.state.lock().expect("tx lock").is_probing
    }

    pub fn set_probing(&self) {
        self.0.state.lock().expect("tx lock").is_probing = true;
    }

    pub fn use_remote_uri(&self) -> bool {
        self.0.state.lock().expect("tx lock").use_remote_uri
    }

    pub fn is_acked(&self) -> bool {
        self.0.state.lock().expect("tx lock").is_acked
    }

    pub fn set_acked(&self) {
        self.0.state.lock().expect("tx lock").is_acked = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.0.state.lock().expect("tx lock").is_finalized
    }

    /// Marks a locally sent response on this transaction. Returns
    /// false when an 18x should be suppressed by the dedup policy.
    pub fn record_sent_response(
        &self,
        code: u16,
        disallow_similar_18x: bool,
        disallow_different_18x: bool,
        carries_sdp_or_rel: bool,
    ) -> bool {
        let mut guard = self.0.state.lock().expect("tx lock");
        if crate::message::code::is_provisional_18x(code) && !carries_sdp_or_rel {
            let similar = disallow_similar_18x && guard.responses.contains(&code);
            let different = disallow_different_18x
                && guard
                    .responses
                    .iter()
                    .any(|&c| crate::message::code::is_provisional_18x(c) && c != code);
            if similar || different {
                return false;
            }
        }
        guard.responses.push(code);
        guard.is_finalized = guard.is_finalized || is_final(code);
        true
    }

    /// Appends a received response in wire order; returns whether this
    /// finalized the transaction just now.
    pub fn record_response(&self, code: u16) -> bool {
        let mut guard = self.0.state.lock().expect("tx lock");
        guard.responses.push(code);
        let newly_final = !guard.is_finalized && is_final(code);
        guard.is_finalized = guard.is_finalized || is_final(code);
        newly_final
    }

    /// Whether a response with this code would be a retransmission.
    ///
    /// Provisionals are duplicates on an exact repeat; finals once the
    /// transaction already saw a final of the same class.
    pub fn is_duplicate_response(&self, code: u16) -> bool {
        let guard = self.0.state.lock().expect("tx lock");
        if is_provisional(code) {
            guard.responses.contains(&code)
        } else {
            guard.is_finalized && guard.responses.iter().any(|&c| c / 100 == code / 100)
        }
    }

    pub fn responses(&self) -> Vec<u16> {
        self.0.state.lock().expect("tx lock").responses.clone()
    }

    pub fn any_1xx(&self) -> bool {
        self.0
            .state
            .lock()
            .expect("tx lock")
            .responses
            .iter()
            .any(|&c| is_provisional(c))
    }

    pub fn final_response(&self) -> Option<u16> {
        self.0
            .state
            .lock()
            .expect("tx lock")
            .responses
            .iter()
            .copied()
            .find(|&c| is_final(c))
    }

    pub fn is_final_response_positive(&self) -> bool {
        self.final_response().is_some_and(is_positive)
    }

    pub fn linked(&self) -> Option<Transaction> {
        self.0
            .state
            .lock()
            .expect("tx lock")
            .linked
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Transaction)
    }

    pub fn set_linked(&self, other: &Transaction) {
        self.0.state.lock().expect("tx lock").linked = Some(other.downgrade());
    }

    pub fn ack_transaction(&self) -> Option<Transaction> {
        self.0
            .state
            .lock()
            .expect("tx lock")
            .ack
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Transaction)
    }

    pub fn request(&self) -> Option<Arc<SipMessage>> {
        self.0.state.lock().expect("tx lock").request.clone()
    }

    pub fn set_request(&self, msg: Arc<SipMessage>) {
        self.0.state.lock().expect("tx lock").request = Some(msg);
    }

    pub fn sent_message(&self) -> Option<Arc<SipMessage>> {
        self.0.state.lock().expect("tx lock").sent.clone()
    }

    pub fn set_sent(&self, msg: Arc<SipMessage>, bytes: Bytes) {
        let mut guard = self.0.state.lock().expect("tx lock");
        guard.sent = Some(msg);
        guard.sent_bytes = Some(bytes);
    }

    pub fn sent_bytes(&self) -> Option<Bytes> {
        self.0.state.lock().expect("tx lock").sent_bytes.clone()
    }

    /// Bumps the retransmission counter, doubling the timeout.
    /// Returns the new interval, or `None` once the bound is reached.
    pub fn next_retransmit(&self) -> Option<Duration> {
        let mut guard = self.0.state.lock().expect("tx lock");
        if guard.retx_count >= RETX_LIMIT {
            return None;
        }
        guard.retx_count += 1;
        guard.retx_timeout *= 2;
        Some(guard.retx_timeout)
    }

    pub fn retransmit_count(&self) -> u32 {
        self.0.state.lock().expect("tx lock").retx_count
    }

    /// Installs a fresh retransmit cancellation handle, stopping any
    /// previous one.
    pub fn arm_retransmit(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut guard = self.0.retx_token.lock().expect("tx lock");
        if let Some(old) = guard.replace(token.clone()) {
            old.cancel();
        }
        token
    }

    pub fn stop_retransmit(&self) {
        if let Some(token) = self.0.retx_token.lock().expect("tx lock").take() {
            token.cancel();
        }
    }

    pub fn arm_cancel_aux(&self) -> Option<CancellationToken> {
        let mut guard = self.0.cancel_aux_token.lock().expect("tx lock");
        if guard.is_some() {
            // Arming an armed timer is a no-op.
            return None;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        Some(token)
    }

    pub fn stop_cancel_aux(&self) {
        if let Some(token) = self.0.cancel_aux_token.lock().expect("tx lock").take() {
            token.cancel();
        }
    }

    /// ACK must reuse the INVITE branch exactly when the INVITE got a
    /// negative final; a 2xx ACK arrives on its own branch.
    pub fn ack_requires_same_branch(&self) -> bool {
        self.final_response().is_some_and(|c| c >= 300)
    }

    /// Response matching per RFC 3261 §17.1.3 with the re-INVITE
    /// widening: branch + CSeq number + method (or INVITE-class).
    pub fn matches_response(&self, msg: &SipMessage) -> bool {
        if self.0.direction != Direction::Outbound {
            return false;
        }
        let Some(method) = msg.cseq_method else {
            return false;
        };
        let guard = self.0.state.lock().expect("tx lock");
        guard.via_branch == msg.via_branch
            && guard.cseq == msg.cseq_num
            && self.0.method.same_cseq_space(&method)
    }

    /// Matches a retransmitted inbound request.
    pub fn matches_request(&self, msg: &SipMessage) -> bool {
        if self.0.direction != Direction::Inbound {
            return false;
        }
        let Some(method) = msg.method() else {
            return false;
        };
        let guard = self.0.state.lock().expect("tx lock");
        guard.cseq == msg.cseq_num && guard.via_branch == msg.via_branch && self.0.method == method
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.0.state.lock().expect("tx lock");
        f.debug_struct("Transaction")
            .field("key", &self.0.key)
            .field("direction", &self.0.direction)
            .field("method", &self.0.method)
            .field("cseq", &guard.cseq)
            .field("branch", &guard.via_branch)
            .field("responses", &guard.responses)
            .field("finalized", &guard.is_finalized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StartLine;

    fn incoming_invite() -> SipMessage {
        let mut msg = SipMessage::new_request(SipMethod::Invite, "bob");
        if let Some(StartLine::Request { ruri, .. }) = &mut msg.start_line {
            *ruri = "sip:bob@10.0.0.5".into();
        }
        msg.cseq_num = 7;
        msg.via_branch = "z9hG4bKabc".into();
        msg
    }

    #[test]
    fn response_matching_covers_reinvite() {
        let tx = Transaction::outgoing(7, SipMethod::Invite, None);
        let mut rsp = SipMessage::new_response(200, "");
        rsp.cseq_num = 7;
        rsp.cseq_method = Some(SipMethod::ReInvite);
        rsp.via_branch = tx.via_branch();
        assert!(tx.matches_response(&rsp));

        rsp.cseq_method = Some(SipMethod::Bye);
        assert!(!tx.matches_response(&rsp));
    }

    #[test]
    fn duplicate_detection() {
        let tx = Transaction::outgoing(1, SipMethod::Invite, None);
        tx.record_response(100);
        assert!(tx.is_duplicate_response(100));
        assert!(!tx.is_duplicate_response(180));
        tx.record_response(180);
        tx.record_response(487);
        assert!(tx.is_duplicate_response(486));
        assert!(!tx.is_duplicate_response(200));
    }

    #[test]
    fn ack_branch_follows_final_class() {
        let tx = Transaction::from_incoming(&incoming_invite(), None);
        // Outbound variant for ack creation.
        let out = Transaction::outgoing(7, SipMethod::Invite, None);
        out.record_response(486);
        let ack = out.create_ack();
        assert_eq!(ack.via_branch(), out.via_branch());
        assert!(ack.use_remote_uri());

        let out2 = Transaction::outgoing(8, SipMethod::Invite, None);
        out2.record_response(200);
        let ack2 = out2.create_ack();
        assert_ne!(ack2.via_branch(), out2.via_branch());
        assert!(!ack2.use_remote_uri());
        drop(tx);
    }

    #[test]
    fn cancel_shares_branch_and_cseq() {
        let tx = Transaction::outgoing(9, SipMethod::Invite, None);
        let cancel = tx.create_cancel();
        assert_eq!(cancel.via_branch(), tx.via_branch());
        assert_eq!(cancel.cseq(), 9);
        assert_eq!(cancel.method(), SipMethod::Cancel);
    }

    #[test]
    fn retransmit_schedule_doubles_until_bound() {
        let tx = Transaction::outgoing(1, SipMethod::Invite, None);
        let mut last = T1;
        for _ in 0..RETX_LIMIT {
            let next = tx.next_retransmit().unwrap();
            assert_eq!(next, last * 2);
            last = next;
        }
        assert!(tx.next_retransmit().is_none());
    }

    #[test]
    fn sent_18x_dedup_policies() {
        let tx = Transaction::from_incoming(&incoming_invite(), None);
        assert!(tx.record_sent_response(180, true, false, false));
        assert!(!tx.record_sent_response(180, true, false, false));
        assert!(tx.record_sent_response(183, true, false, false));
        assert!(!tx.record_sent_response(181, false, true, false));
        // SDP-bearing 18x bypasses the dedup policy.
        assert!(tx.record_sent_response(180, true, true, true));
    }
}
