//! Outbound request construction for a dialog.

use std::sync::Arc;

use crate::message::code::{q850, status};
use crate::message::{
    MessageBody, RequestPack, ResponsePack, SipMessage, SipMethod, StartLine, hdr, reason_headers,
};
use crate::session::{SessionMode, SessionState, SipSession};
use crate::transaction::{Direction, Transaction};
use crate::{ids, message};

impl SipSession {
    /// Creates the ledger entry for a locally originated request,
    /// allocating the proper CSeq counter.
    ///
    /// The forward counter belongs to the dialog originator, the
    /// backward one to the responder; ACK and CANCEL reuse their
    /// INVITE's number instead.
    pub(crate) async fn add_outgoing_request(
        &self,
        method: SipMethod,
        linked: Option<&Transaction>,
    ) -> Option<Transaction> {
        // Reject whatever is still pending inbound before a BYE.
        if method == SipMethod::Bye {
            for pending in self.pending_incoming_transactions() {
                if pending.method().requires_ack() && !pending.is_finalized() {
                    self.send_created_response_detailed(
                        Some(&pending),
                        ResponsePack {
                            status_code: status::SERVICE_UNAVAILABLE,
                            custom_headers: reason_headers(
                                q850::NORMAL_UNSPECIFIED,
                                "Session being cleared",
                                "",
                            ),
                            ..Default::default()
                        },
                        MessageBody::empty(),
                    )
                    .await;
                }
            }
        }

        match method {
            SipMethod::Ack => {
                let invite = match linked {
                    Some(tx) => tx.clone(),
                    None => self.get_unacked_inv_or_reinv()?,
                };
                invite.set_acked();
                let ack = invite.create_ack();
                self.add_transaction(ack.clone());
                Some(ack)
            }
            SipMethod::Cancel => {
                let invite = match linked {
                    Some(tx) => tx.clone(),
                    None => self.get_last_unacked_inv(Direction::Outbound)?,
                };
                let cancel = invite.create_cancel();
                self.add_transaction(cancel.clone());
                Some(cancel)
            }
            SipMethod::Prack => {
                // The PRACK entry was pre-created (and filed) when the
                // reliable 1xx arrived; it only needs its CSeq now.
                let tx = linked?.clone();
                tx.set_cseq(self.allocate_cseq());
                Some(tx)
            }
            _ => {
                let tx = Transaction::outgoing(self.allocate_cseq(), method, linked);
                self.add_transaction(tx.clone());
                Some(tx)
            }
        }
    }

    fn allocate_cseq(&self) -> u32 {
        match self.direction() {
            Direction::Outbound => self.next_fwd_cseq(),
            Direction::Inbound => self.next_bwd_cseq(),
        }
    }

    /// Builds and sends an in-dialog request.
    pub async fn send_created_request(
        &self,
        method: SipMethod,
        linked: Option<&Transaction>,
        body: MessageBody,
    ) -> Option<Transaction> {
        self.send_created_request_detailed(RequestPack::new(method), linked, body)
            .await
    }

    /// Same as [`Self::send_created_request`] but with custom headers
    /// and flags.
    pub async fn send_created_request_detailed(
        &self,
        pack: RequestPack,
        linked: Option<&Transaction>,
        body: MessageBody,
    ) -> Option<Transaction> {
        let method = pack.method?;
        let tx = self.add_outgoing_request(method, linked).await?;
        if pack.is_probing {
            tx.set_probing();
        }

        let msg = match method {
            SipMethod::Ack => self.build_ack(&tx, body),
            SipMethod::Cancel => self.build_cancel(&tx, &pack),
            _ => self.build_in_dialog_request(&tx, method, &pack, body),
        };

        tx.set_request(Arc::new(msg.clone()));
        tx.set_sent(Arc::new(msg), bytes::Bytes::new());
        self.send_st_message(&tx).await;
        Some(tx)
    }

    /// From/To as seen from this leg: the responder's identities swap.
    fn dialog_identity(&self) -> (String, String) {
        match self.direction() {
            Direction::Outbound => (self.from_header(), self.to_header()),
            Direction::Inbound => (self.to_header(), self.from_header()),
        }
    }

    fn in_dialog_ruri(&self) -> String {
        let contact = self.remote_contact_uri();
        if !contact.is_empty() {
            return contact;
        }
        let remote = self.remote_uri();
        if !remote.is_empty() {
            return remote;
        }
        let (_, to) = self.dialog_identity();
        message::uri::uri_hostport(&to)
            .map(|hp| format!("sip:{}", hp))
            .unwrap_or_default()
    }

    fn build_in_dialog_request(
        &self,
        tx: &Transaction,
        method: SipMethod,
        pack: &RequestPack,
        body: MessageBody,
    ) -> SipMessage {
        let mut msg = SipMessage::new_request(method, "");
        if let Some(StartLine::Request { ruri, uri, .. }) = &mut msg.start_line {
            *ruri = self.in_dialog_ruri();
            *uri = None;
        }

        let mut headers = crate::message::SipHeaders::with_defaults();
        headers.add(hdr::CALL_ID, self.call_id().to_string());
        headers.add(hdr::VIA, self.local_via(&tx.via_branch()));

        let (from, to) = self.dialog_identity();
        headers.add(hdr::FROM, &from);
        headers.add(hdr::TO, &to);
        headers.add(hdr::CSEQ, format!("{} {}", tx.cseq(), method.as_str()));
        headers.set(hdr::CONTACT, self.local_contact());

        let max_fwds = if pack.max70 {
            70
        } else {
            tx.linked()
                .and_then(|lt| lt.request())
                .and_then(|r| r.max_fwds)
                .map_or(70, |mf| (mf - 1).max(0))
        };
        headers.set(hdr::MAX_FORWARDS, max_fwds.to_string());
        msg.max_fwds = Some(max_fwds);

        // The route set pins in-dialog requests through intermediaries,
        // reversed when we originated the dialog.
        let mut routes = self.record_routes();
        if self.direction() == Direction::Outbound {
            routes.reverse();
        }
        headers.add_values(hdr::ROUTE, routes);

        if method == SipMethod::Prack {
            headers.set(hdr::RACK, tx.rack());
        }

        headers.merge(&pack.custom_headers);

        msg.headers = headers;
        msg.call_id = self.call_id().to_string();
        msg.cseq_num = tx.cseq();
        msg.body = body;
        msg
    }

    fn build_ack(&self, tx: &Transaction, body: MessageBody) -> SipMessage {
        let invite = tx.linked();
        let mut msg = SipMessage::new_request(SipMethod::Ack, "");

        let ruri = if tx.use_remote_uri() {
            // Negative finals are ACKed at the original Request-URI.
            invite
                .as_ref()
                .and_then(|inv| inv.sent_message())
                .and_then(|m| match &m.start_line {
                    Some(StartLine::Request { ruri, .. }) => Some(ruri.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| self.in_dialog_ruri())
        } else {
            self.in_dialog_ruri()
        };
        if let Some(StartLine::Request { ruri: slot, uri, .. }) = &mut msg.start_line {
            *slot = ruri;
            *uri = None;
        }

        let mut headers = crate::message::SipHeaders::with_defaults();
        headers.add(hdr::CALL_ID, self.call_id().to_string());
        headers.add(hdr::VIA, self.local_via(&tx.via_branch()));
        let (from, to) = self.dialog_identity();
        headers.add(hdr::FROM, from);
        headers.add(hdr::TO, to);
        headers.add(hdr::CSEQ, format!("{} ACK", tx.cseq()));
        headers.set(hdr::MAX_FORWARDS, "70");

        let mut routes = self.record_routes();
        if self.direction() == Direction::Outbound {
            routes.reverse();
        }
        headers.add_values(hdr::ROUTE, routes);

        msg.headers = headers;
        msg.call_id = self.call_id().to_string();
        msg.cseq_num = tx.cseq();
        msg.body = body;
        msg
    }

    fn build_cancel(&self, tx: &Transaction, pack: &RequestPack) -> SipMessage {
        let invite = tx.linked();
        let mut msg = SipMessage::new_request(SipMethod::Cancel, "");

        let (ruri, from, to) = match invite.as_ref().and_then(|inv| inv.sent_message()) {
            Some(sent) => {
                let ruri = match &sent.start_line {
                    Some(StartLine::Request { ruri, .. }) => ruri.clone(),
                    _ => self.in_dialog_ruri(),
                };
                (
                    ruri,
                    sent.headers.value(hdr::FROM).unwrap_or_default().to_string(),
                    sent.headers.value(hdr::TO).unwrap_or_default().to_string(),
                )
            }
            None => {
                let (from, to) = self.dialog_identity();
                (self.in_dialog_ruri(), from, to)
            }
        };
        if let Some(StartLine::Request { ruri: slot, uri, .. }) = &mut msg.start_line {
            *slot = ruri;
            *uri = None;
        }

        let mut headers = crate::message::SipHeaders::with_defaults();
        headers.add(hdr::CALL_ID, self.call_id().to_string());
        headers.add(hdr::VIA, self.local_via(&tx.via_branch()));
        headers.add(hdr::FROM, from);
        headers.add(hdr::TO, to);
        headers.add(hdr::CSEQ, format!("{} CANCEL", tx.cseq()));
        headers.set(hdr::MAX_FORWARDS, "70");
        headers.merge(&pack.custom_headers);

        msg.headers = headers;
        msg.call_id = self.call_id().to_string();
        msg.cseq_num = tx.cseq();
        msg
    }

    /// Builds the linked outbound INVITE for a routed call. The caller
    /// identity is carried over; Call-ID, tags and branch are fresh.
    pub(crate) async fn create_linked_invite(
        &self,
        userpart: &str,
        inbound_msg: &SipMessage,
        body: MessageBody,
    ) -> Option<Transaction> {
        let cseq = self.next_fwd_cseq();
        let tx = Transaction::outgoing(cseq, SipMethod::Invite, None);
        self.add_transaction(tx.clone());

        self.set_call_id(&ids::new_call_id());
        self.set_mode(SessionMode::Multimedia);

        let local_ip = self.local_addr().map(|a| a.ip().to_string()).unwrap_or_default();
        let remote = self.remote_udp()?;

        let mut msg = SipMessage::new_request(SipMethod::Invite, userpart);
        let ruri = format!("sip:{}@{};user=phone", userpart, remote);
        if let Some(StartLine::Request { ruri: slot, uri, .. }) = &mut msg.start_line {
            *slot = ruri.clone();
            if let Some(uri) = uri {
                uri.hostport = remote.to_string();
                uri.uri_params = vec![("user".into(), Some("phone".into()))];
            }
        }

        let from_tag = ids::new_tag();
        let caller_up = message::uri::uri_userpart(&inbound_msg.from_header).unwrap_or("anonymous");
        let from = format!("<sip:{}@{};user=phone>;tag={}", caller_up, local_ip, from_tag);
        let to = format!("<sip:{}@{};user=phone>", userpart, remote.ip());

        self.with_ids(|idstate| {
            idstate.from_tag = from_tag.clone();
            idstate.from_header = from.clone();
            idstate.to_header = to.clone();
            idstate.remote_uri = ruri.clone();
            idstate.remote_contact_uri = ruri.clone();
        });

        let mut headers = crate::message::SipHeaders::with_defaults();
        headers.add(hdr::CALL_ID, self.call_id().to_string());
        headers.add(hdr::VIA, self.local_via(&tx.via_branch()));
        headers.add(hdr::FROM, &from);
        headers.add(hdr::TO, &to);
        headers.add(hdr::CSEQ, format!("{} INVITE", cseq));
        headers.set(hdr::CONTACT, self.local_contact());

        let max_fwds = inbound_msg.max_fwds.map_or(70, |mf| (mf - 1).max(0));
        headers.set(hdr::MAX_FORWARDS, max_fwds.to_string());

        if self.is_prack_supported() {
            headers.add(hdr::SUPPORTED, "100rel");
        }
        for pai in &inbound_msg.pai_headers {
            headers.add(hdr::P_ASSERTED_IDENTITY, pai);
        }
        for div in &inbound_msg.div_headers {
            headers.add(hdr::DIVERSION, div);
        }

        msg.headers = headers;
        msg.call_id = self.call_id().to_string();
        msg.cseq_num = cseq;
        msg.max_fwds = Some(max_fwds);
        msg.body = body;

        tx.set_request(Arc::new(msg.clone()));
        tx.set_sent(Arc::new(msg), bytes::Bytes::new());
        Some(tx)
    }

    /// Builds a stand-alone (out-of-dialog) request, seeding the
    /// dialog identity from scratch. Used for UA probing.
    pub(crate) async fn create_sa_request(
        &self,
        pack: RequestPack,
        body: MessageBody,
    ) -> Option<Transaction> {
        let method = pack.method?;
        match method {
            SipMethod::Options => {
                self.seed_fwd_cseq(911);
                self.set_mode(SessionMode::KeepAlive);
            }
            SipMethod::Invite => {
                self.set_mode(SessionMode::Multimedia);
                self.seed_fwd_cseq(rand::random_range(1..=500));
            }
            _ => self.seed_fwd_cseq(rand::random_range(1..=500)),
        }
        let cseq = {
            let guard = self.0.cseq.lock().expect("cseq lock");
            guard.fwd
        };
        let tx = Transaction::outgoing(cseq, method, None);
        if pack.is_probing {
            tx.set_probing();
        }
        self.add_transaction(tx.clone());

        let local = self.local_addr()?;
        let remote = self.remote_udp()?;

        self.set_call_id(&ids::new_call_id());
        let from_tag = ids::new_tag();
        let from = format!("<sip:{}@{};user=phone>;tag={}", pack.from_userpart, local.ip(), from_tag);
        let to = if pack.ruri_userpart.is_empty() {
            format!("<sip:{}>", remote.ip())
        } else {
            format!("<sip:{}@{};user=phone>", pack.ruri_userpart, remote.ip())
        };
        let ruri = if pack.ruri_userpart.is_empty() {
            format!("sip:{}", remote)
        } else {
            format!("sip:{}@{}", pack.ruri_userpart, remote)
        };

        self.with_ids(|ids_state| {
            ids_state.from_tag = from_tag.clone();
            ids_state.from_header = from.clone();
            ids_state.to_header = to.clone();
            ids_state.remote_uri = ruri.clone();
            ids_state.remote_contact_uri = ruri.clone();
        });

        let mut msg = SipMessage::new_request(method, &pack.ruri_userpart);
        if let Some(StartLine::Request { ruri: slot, uri, .. }) = &mut msg.start_line {
            *slot = ruri;
            *uri = None;
        }

        let mut headers = crate::message::SipHeaders::with_defaults();
        headers.add(hdr::CALL_ID, self.call_id().to_string());
        headers.add(hdr::VIA, self.local_via(&tx.via_branch()));
        headers.add(hdr::FROM, &from);
        headers.merge(&pack.custom_headers);
        headers.set(hdr::TO, &to);
        headers.add(hdr::CSEQ, format!("{} {}", cseq, method.as_str()));
        headers.set(hdr::CONTACT, self.local_contact());
        headers.set(hdr::MAX_FORWARDS, "70");

        msg.headers = headers;
        msg.call_id = self.call_id().to_string();
        msg.cseq_num = cseq;
        msg.max_fwds = Some(70);
        msg.body = body;

        tx.set_request(Arc::new(msg.clone()));
        tx.set_sent(Arc::new(msg), bytes::Bytes::new());
        self.send_st_message(&tx).await;
        Some(tx)
    }

    /// In-dialog OPTIONS probe; a 408/481 or timeout on it releases
    /// the call.
    pub(crate) async fn send_in_dialog_options(&self) {
        let pack = RequestPack {
            method: Some(SipMethod::Options),
            max70: true,
            is_probing: true,
            ..Default::default()
        };
        self.send_created_request_detailed(pack, None, MessageBody::empty())
            .await;
    }

    /// Pre-creates the outgoing PRACK answering a reliable 1xx
    /// received on this (outbound) leg. Sent later when the peer leg's
    /// PRACK arrives.
    pub(crate) fn generate_outgoing_prack(&self, msg_18x: &SipMessage) -> Option<Transaction> {
        let rseq: u32 = msg_18x.headers.value(hdr::RSEQ)?.trim().parse().ok()?;
        let rack = format!("{} {} {}", rseq, msg_18x.cseq_num, SipMethod::Invite.as_str());
        Some(Transaction::outgoing_prack(rseq, rack))
    }

    /// CANCELs the pending outbound INVITE. Only meaningful while the
    /// egress dialog is being established.
    pub async fn cancel_me(&self, cause: u16, details: &str) {
        if self.direction() != Direction::Outbound || !self.is_being_established() {
            return;
        }
        self.set_termination_cause(details);
        self.set_state(SessionState::BeingCancelled);
        self.stop_all_out_transactions();
        let pack = RequestPack {
            method: Some(SipMethod::Cancel),
            custom_headers: if cause > 0 {
                reason_headers(cause, details, "")
            } else {
                Default::default()
            },
            ..Default::default()
        };
        self.send_created_request_detailed(pack, None, MessageBody::empty())
            .await;
    }

    /// Sends the BYE clearing an established dialog. Returns false
    /// when the dialog is not established (the caller falls back to
    /// CANCEL or reject).
    pub async fn release_me(&self, details: &str, linked: Option<&Transaction>) -> bool {
        if !self.is_established() {
            return false;
        }
        self.set_termination_cause(details);
        self.set_state(SessionState::BeingCleared);
        let pack = RequestPack {
            method: Some(SipMethod::Bye),
            custom_headers: reason_headers(q850::NORMAL_CLEARING, details, ""),
            ..Default::default()
        };
        self.send_created_request_detailed(pack, linked, MessageBody::empty())
            .await;
        true
    }

    /// Tears the whole call down: BYE where established, CANCEL or
    /// reject where still pending, on both legs.
    pub async fn release_call(&self, details: &str) {
        if let Some(linked) = self.linked_session() {
            linked.stop_all_out_transactions();
            if !linked.release_me(details, None).await {
                match linked.direction() {
                    Direction::Outbound => linked.cancel_me(q850::NORMAL_CLEARING, details).await,
                    Direction::Inbound => {
                        let tx = linked.get_last_unacked_inv(Direction::Inbound);
                        linked
                            .reject_me(tx.as_ref(), status::REQUEST_TERMINATED, q850::NORMAL_CLEARING, details)
                            .await;
                    }
                }
            }
        }
        self.stop_all_out_transactions();
        if !self.release_me(details, None).await {
            match self.direction() {
                Direction::Outbound => self.cancel_me(q850::NORMAL_CLEARING, details).await,
                Direction::Inbound => {
                    let tx = self.get_last_unacked_inv(Direction::Inbound);
                    self.reject_me(tx.as_ref(), status::REQUEST_TERMINATED, q850::NORMAL_CLEARING, details)
                        .await;
                }
            }
        }
    }

    /// ACKs a negative final on the outbound INVITE and schedules the
    /// delayed drop of this leg.
    pub(crate) async fn ack_3xx_to_6xx(&self, final_state: SessionState) {
        self.send_created_request(SipMethod::Ack, None, MessageBody::empty())
            .await;
        self.set_state(final_state);
        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            session.drop_me().await;
        });
    }

    /// Negative-final ACK on a dialog that was already being
    /// cancelled: settle and drop immediately.
    pub(crate) async fn ack_3xx_to_6xx_finalize(&self) {
        self.send_created_request(SipMethod::Ack, None, MessageBody::empty())
            .await;
        self.finalize_state();
        self.drop_me().await;
    }
}
