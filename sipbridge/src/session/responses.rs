//! Outbound response construction for a dialog.

use std::sync::Arc;

use crate::message::code::{is_18x_or_positive, is_provisional_18x};
use crate::message::{MessageBody, ResponsePack, SipMessage, hdr};
use crate::session::{SessionState, SipSession};
use crate::ids;
use crate::transaction::{Direction, PrackStatus, Transaction};

impl SipSession {
    /// Sends a plain response on a transaction.
    pub async fn send_created_response(
        &self,
        tx: Option<&Transaction>,
        status_code: u16,
        body: MessageBody,
    ) {
        self.send_created_response_detailed(tx, ResponsePack::of(status_code), body)
            .await;
    }

    /// Builds and sends a response; handles To-tag assignment, the
    /// 18x dedup policies and reliable-1xx (RSeq/PRACK) installation.
    ///
    /// With no transaction given, the response goes out on the last
    /// unACKed inbound INVITE.
    pub async fn send_created_response_detailed(
        &self,
        tx: Option<&Transaction>,
        pack: ResponsePack,
        body: MessageBody,
    ) {
        let tx = match tx {
            Some(tx) => tx.clone(),
            None => match self.get_last_unacked_inv(Direction::Inbound) {
                Some(tx) => tx,
                None => {
                    tracing::error!(
                        call_id = %self.call_id(),
                        code = pack.status_code,
                        "no unACKed INVITE transaction found to send response"
                    );
                    return;
                }
            },
        };

        let code = pack.status_code;
        let (disallow_similar, disallow_different) = self
            .routing()
            .map_or((false, false), |r| (r.disallow_similar_18x, r.disallow_different_18x));
        let carries_sdp_or_rel = pack.linked_prack.is_some() || body.contains_sdp();
        if !tx.record_sent_response(code, disallow_similar, disallow_different, carries_sdp_or_rel) {
            tracing::debug!(call_id = %self.call_id(), code, "18x suppressed by dedup policy");
            return;
        }

        let mut msg = SipMessage::new_response(code, &pack.reason_phrase);
        let prack_placeholder = self.create_headers_for_response(&mut msg, &tx, &pack);
        msg.body = body;

        tx.set_sent(Arc::new(msg.clone()), bytes::Bytes::new());
        self.send_st_message(&tx).await;

        // A final on an INVITE server transaction retransmits until
        // the ACK arrives; a reliable 1xx retransmits until PRACKed.
        if code >= 200 && tx.method().requires_ack() && tx.direction() == Direction::Inbound {
            if let Some(bytes) = tx.sent_bytes() {
                self.spawn_retransmit(&tx, bytes, tx.via_udp_addr());
            }
        }
        if let Some(placeholder) = prack_placeholder {
            if let Some(bytes) = tx.sent_bytes() {
                placeholder.set_sent(
                    tx.sent_message().unwrap_or_else(|| Arc::new(SipMessage::default())),
                    bytes.clone(),
                );
                self.spawn_retransmit(&placeholder, bytes, tx.via_udp_addr());
            }
        }
    }

    /// Populates the response headers from the request transaction.
    /// Returns the reliable-1xx placeholder when one was installed.
    fn create_headers_for_response(
        &self,
        msg: &mut SipMessage,
        tx: &Transaction,
        pack: &ResponsePack,
    ) -> Option<Transaction> {
        let code = pack.status_code;
        let request = tx.request();
        let mut headers = crate::message::SipHeaders::with_defaults();

        if pack.contact_header.is_empty() {
            headers.add(hdr::CONTACT, self.local_contact());
        } else {
            headers.add(hdr::CONTACT, &pack.contact_header);
        }

        headers.add(hdr::CALL_ID, self.call_id().to_string());
        headers.merge(&pack.custom_headers);

        if let Some(request) = request.as_ref() {
            headers.add_values(hdr::VIA, request.headers.values(hdr::VIA));
            headers.add(hdr::FROM, request.headers.value(hdr::FROM).unwrap_or_default());
            headers.add(hdr::TO, request.headers.value(hdr::TO).unwrap_or_default());
            headers.add(hdr::CSEQ, request.headers.value(hdr::CSEQ).unwrap_or_default());
            msg.cseq_num = request.cseq_num;
            msg.cseq_method = request.cseq_method;
        }

        let mut placeholder = None;

        if code > 100 {
            // The UAS assigns its To-tag on the first 18x or 2xx and
            // keeps it for the rest of the dialog.
            if !headers.contains_to_tag() && self.direction() == Direction::Inbound {
                if self.to_tag().is_empty() {
                    if is_18x_or_positive(code) {
                        let tag = ids::new_tag();
                        let to = format!("{};tag={}", headers.value(hdr::TO).unwrap_or_default(), tag);
                        self.with_ids(|ids_state| {
                            ids_state.to_tag = tag.clone();
                            ids_state.to_header = to.clone();
                        });
                    }
                }
                let to = self.to_header();
                if !to.is_empty() {
                    headers.set(hdr::TO, to);
                }
            }

            headers.add_values(hdr::RECORD_ROUTE, self.record_routes());
            if let Some(refer_sub) = request.as_ref().and_then(|r| r.headers.value(hdr::REFER_SUB)) {
                headers.add(hdr::REFER_SUB, refer_sub);
            }

            let prack_requested = pack.prack_requested || pack.linked_prack.is_some();
            if is_provisional_18x(code)
                && self.is_prack_supported()
                && self.direction() == Direction::Inbound
                && prack_requested
            {
                let rseq = self.next_rseq();
                let entry = Transaction::prack_placeholder(rseq, tx.cseq(), PrackStatus::Expected);
                if let Some(linked) = &pack.linked_prack {
                    entry.set_linked(linked);
                }
                self.add_transaction(entry.clone());
                headers.set(hdr::RSEQ, rseq.to_string());
                headers.set(hdr::REQUIRE, "100rel");
                placeholder = Some(entry);
            }
        }

        msg.headers = headers;
        msg.call_id = self.call_id().to_string();
        placeholder
    }

    /// Rejects the pending inbound INVITE with a negative final
    /// carrying a Reason diagnostic. Only valid while the dialog is
    /// being established.
    pub async fn reject_me(&self, tx: Option<&Transaction>, code: u16, cause: u16, details: &str) {
        if self.direction() != Direction::Inbound || !self.is_being_established() {
            tracing::warn!(
                call_id = %self.call_id(),
                code,
                "reject requested outside inbound establishment - ignored"
            );
            return;
        }
        self.set_termination_cause(details);
        self.set_state(SessionState::BeingFailed);
        self.stop_no_timers();
        self.send_created_response_detailed(tx, ResponsePack::with_q850(code, cause, details), MessageBody::empty())
            .await;
    }
}
