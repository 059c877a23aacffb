//! Routing decision core.
//!
//! An ordered rule table matched against the called-party userpart.
//! The first rule whose pattern matches and whose substitution yields
//! a non-empty output wins. The table is loaded from a JSON blob and
//! hot-reloadable behind a writer lock.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use util::{DnsResolver, split_hostport};

use crate::parser::SIP_PORT;

/// How the egress side of a routed call behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallFlow {
    /// Pure bridge: provisionals, PRACK and SDP all propagate.
    #[default]
    Transparent,
    /// The first SDP-bearing 18x is promoted to a 200 on the ingress
    /// leg (fast answer).
    TransformEarlyToFinal,
    /// No egress leg; the stack answers and reflects RTP itself.
    EchoResponder,
}

/// One routing rule.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingRecord {
    #[serde(skip)]
    pub regex: Option<Regex>,
    #[serde(skip)]
    pub remote_socket: Option<SocketAddr>,
    #[serde(skip)]
    pub from_db: bool,

    pub userpart_pattern: String,

    pub no_answer_timeout: i64,
    pub no18x_timeout: i64,
    pub max_call_duration: i64,

    pub disallow_different_18x: bool,
    pub disallow_similar_18x: bool,

    pub steer_media: bool,

    pub out_ruri_userpart: String,
    pub out_ruri_hostport: String,

    pub out_call_flow: CallFlow,
}

impl RoutingRecord {
    /// The built-in defaults used when calls are steered through the
    /// external AS instead of the rule table.
    pub fn for_as(userpart: &str) -> Self {
        RoutingRecord {
            no_answer_timeout: 180,
            no18x_timeout: 60,
            max_call_duration: 0,
            out_ruri_userpart: userpart.to_string(),
            ..Default::default()
        }
    }

    /// Defaults for calls terminating on a registered phone.
    pub fn for_phone(userpart: &str) -> Self {
        RoutingRecord {
            no_answer_timeout: 60,
            no18x_timeout: 30,
            max_call_duration: 7200,
            out_ruri_userpart: userpart.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutingRow {
    userpart_pattern: String,
    routing_record: RoutingRecord,
}

/// The process-wide rule table.
#[derive(Default)]
pub struct RoutingEngine {
    routings: RwLock<Vec<Arc<RoutingRecord>>>,
}

impl RoutingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON rule blob, replacing the table.
    ///
    /// A row is dropped when its regex does not compile, when both
    /// supervision timeouts are disabled on a non-echo flow, or when
    /// its hostport cannot be resolved.
    pub async fn read_config(&self, data: &[u8], resolver: &DnsResolver) {
        let rows: Vec<RoutingRow> = match serde_json::from_slice(data) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!(%err, "routing DB unreadable - table kept");
                return;
            }
        };

        let total = rows.len();
        let mut records = Vec::with_capacity(total);

        for row in rows {
            let mut record = row.routing_record;
            if record.out_call_flow != CallFlow::EchoResponder
                && record.no18x_timeout <= 0
                && record.no_answer_timeout <= 0
            {
                tracing::warn!(pattern = %row.userpart_pattern, "both No18x and NoAnswer timeouts disabled - skipped");
                continue;
            }
            let regex = match Regex::new(&row.userpart_pattern) {
                Ok(regex) => regex,
                Err(err) => {
                    tracing::warn!(pattern = %row.userpart_pattern, %err, "invalid userpart pattern - skipped");
                    continue;
                }
            };
            if !record.out_ruri_hostport.is_empty() {
                match resolve_hostport(&record.out_ruri_hostport, resolver).await {
                    Ok(addr) => record.remote_socket = Some(addr),
                    Err(err) => {
                        tracing::warn!(hostport = %record.out_ruri_hostport, %err, "bad OutRuriHostport - skipped");
                        continue;
                    }
                }
            }
            record.userpart_pattern = row.userpart_pattern;
            record.regex = Some(regex);
            record.from_db = true;
            records.push(Arc::new(record));
        }

        tracing::info!(total, valid = records.len(), "routing DB loaded");
        *self.routings.write().expect("routing lock") = records;
    }

    /// Walks the table in declaration order; returns the first record
    /// whose pattern matches with a non-empty translation, plus the
    /// translated userpart.
    pub fn get(&self, userpart: &str) -> Option<(Arc<RoutingRecord>, String)> {
        let routings = self.routings.read().expect("routing lock");
        for record in routings.iter() {
            let Some(regex) = record.regex.as_ref() else {
                continue;
            };
            if let Some(translated) = translate_pattern(userpart, regex, &record.out_ruri_userpart) {
                return Some((record.clone(), translated));
            }
        }
        None
    }

    pub fn record_count(&self) -> usize {
        self.routings.read().expect("routing lock").len()
    }

    /// The current table as JSON (for the admin surface).
    pub fn to_json(&self) -> serde_json::Result<String> {
        let routings = self.routings.read().expect("routing lock");
        let records: Vec<&RoutingRecord> = routings.iter().map(Arc::as_ref).collect();
        serde_json::to_string(&records)
    }
}

async fn resolve_hostport(
    hostport: &str,
    resolver: &DnsResolver,
) -> std::io::Result<SocketAddr> {
    let (host, port) = split_hostport(hostport, SIP_PORT)?;
    let ip = resolver.resolve(host).await?;
    Ok(SocketAddr::new(ip, port))
}

/// Applies a rule: pattern match plus template substitution.
///
/// An empty template passes the userpart through unchanged.
pub fn translate_pattern(userpart: &str, regex: &Regex, template: &str) -> Option<String> {
    let captures = regex.captures(userpart)?;
    if template.is_empty() {
        return Some(userpart.to_string());
    }
    let out = expand_template(template, &captures);
    (!out.is_empty()).then_some(out)
}

/// Back-reference expansion: `$N` and `${N}` expand capture group N,
/// `$$` is a literal `$`, `${` with no digits is literal `${`, and
/// groups that did not participate stay as `${N}` text.
fn expand_template(template: &str, captures: &regex::Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut digits = String::new();
                while let Some(d) = chars.peek().filter(|c| c.is_ascii_digit()) {
                    digits.push(*d);
                    chars.next();
                }
                if digits.is_empty() {
                    out.push_str("${");
                    continue;
                }
                let closed = chars.peek() == Some(&'}');
                if closed {
                    chars.next();
                }
                push_group(&mut out, captures, &digits, closed);
            }
            Some(d) if d.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().filter(|c| c.is_ascii_digit()) {
                    digits.push(*d);
                    chars.next();
                }
                push_group(&mut out, captures, &digits, true);
            }
            _ => out.push('$'),
        }
    }
    out
}

fn push_group(out: &mut String, captures: &regex::Captures<'_>, digits: &str, closed: bool) {
    let group: usize = digits.parse().unwrap_or(usize::MAX);
    match captures.get(group) {
        Some(m) if closed => out.push_str(m.as_str()),
        _ => {
            out.push_str("${");
            out.push_str(digits);
            if closed {
                out.push('}');
            }
        }
    }
}
