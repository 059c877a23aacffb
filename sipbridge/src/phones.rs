//! Registered UA bookkeeping.
//!
//! The registry maps an extension to its [`IPPhone`] record. Contact
//! bindings come from REGISTER; liveness comes from the periodic
//! OPTIONS probing driven by the stack.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::parser;
use crate::session::SessionState;

/// A remote UDP user agent with a liveness flag.
pub struct SipUdpUserAgent {
    addr: RwLock<SocketAddr>,
    alive: AtomicBool,
}

impl SipUdpUserAgent {
    pub fn new(addr: SocketAddr) -> Self {
        SipUdpUserAgent {
            addr: RwLock::new(addr),
            alive: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        *self.addr.read().expect("ua lock")
    }

    pub fn set_addr(&self, addr: SocketAddr) {
        *self.addr.write().expect("ua lock") = addr;
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

impl std::fmt::Display for SipUdpUserAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UDPAddr: {}, IsAlive: {}", self.addr(), self.is_alive())
    }
}

struct PhoneState {
    ruri: String,
    is_registered: bool,
    is_reachable: bool,
    ua: Option<Arc<SipUdpUserAgent>>,
}

/// One registered endpoint.
pub struct IPPhone {
    extension: String,
    state: RwLock<PhoneState>,
}

/// Snapshot of a phone for the admin surface.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneView {
    pub extension: String,
    pub ruri: String,
    pub is_registered: bool,
    pub is_reachable: bool,
    pub user_agent: Option<String>,
}

impl IPPhone {
    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn is_registered(&self) -> bool {
        self.state.read().expect("phone lock").is_registered
    }

    pub fn is_reachable(&self) -> bool {
        self.state.read().expect("phone lock").is_reachable
    }

    pub fn ua(&self) -> Option<Arc<SipUdpUserAgent>> {
        self.state.read().expect("phone lock").ua.clone()
    }

    pub fn view(&self) -> PhoneView {
        let state = self.state.read().expect("phone lock");
        PhoneView {
            extension: self.extension.clone(),
            ruri: state.ruri.clone(),
            is_registered: state.is_registered,
            is_reachable: state.is_reachable,
            user_agent: state.ua.as_ref().map(|ua| ua.to_string()),
        }
    }
}

impl std::fmt::Display for IPPhone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("phone lock");
        write!(
            f,
            "{} registered={} reachable={}",
            self.extension, state.is_registered, state.is_reachable
        )
    }
}

/// extension → phone table.
#[derive(Default)]
pub struct PhoneRegistry {
    phones: RwLock<HashMap<String, Arc<IPPhone>>>,
}

impl PhoneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_phone_ext(&self, ext: &str) -> bool {
        self.phones.read().expect("registry lock").contains_key(ext)
    }

    pub fn get(&self, ext: &str) -> Option<Arc<IPPhone>> {
        self.phones.read().expect("registry lock").get(ext).cloned()
    }

    /// Creates or refreshes a binding from a REGISTER.
    ///
    /// An unresolvable Contact marks the phone unreachable and clears
    /// its UA; `expires > 0` decides registered vs unregistered.
    pub fn add_or_update(&self, ext: &str, ruri: &str, ipport: &str, expires: i64) -> SessionState {
        let mut phones = self.phones.write().expect("registry lock");
        let phone = phones.entry(ext.to_string()).or_insert_with(|| {
            Arc::new(IPPhone {
                extension: ext.to_string(),
                state: RwLock::new(PhoneState {
                    ruri: ruri.to_string(),
                    is_registered: false,
                    is_reachable: false,
                    ua: None,
                }),
            })
        });

        let mut state = phone.state.write().expect("phone lock");
        state.ruri = ruri.to_string();

        let current = state.ua.as_ref().map(|ua| ua.addr().to_string());
        if current.as_deref() != Some(ipport) {
            match parser::parse_socket(ipport, parser::SIP_PORT) {
                Some(addr) => {
                    state.is_reachable = true;
                    state.ua = Some(Arc::new(SipUdpUserAgent::new(addr)));
                }
                None => {
                    tracing::warn!(ext, ipport, "error resolving Contact address");
                    state.is_reachable = false;
                    state.ua = None;
                }
            }
        }

        state.is_registered = expires > 0;
        tracing::info!(phone = %phone, "registration updated");
        if state.is_registered {
            SessionState::Registered
        } else {
            SessionState::Unregistered
        }
    }

    pub fn remove(&self, ext: &str) {
        self.phones.write().expect("registry lock").remove(ext);
    }

    pub fn all(&self) -> Vec<Arc<IPPhone>> {
        self.phones.read().expect("registry lock").values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_unregister() {
        let registry = PhoneRegistry::new();
        let state = registry.add_or_update("2001", "sip:2001@1.2.3.4:5080", "1.2.3.4:5080", 300);
        assert_eq!(state, SessionState::Registered);
        let phone = registry.get("2001").unwrap();
        assert!(phone.is_registered());
        assert!(phone.is_reachable());
        assert_eq!(phone.ua().unwrap().addr(), "1.2.3.4:5080".parse().unwrap());

        let state = registry.add_or_update("2001", "sip:2001@1.2.3.4:5080", "1.2.3.4:5080", 0);
        assert_eq!(state, SessionState::Unregistered);
        assert!(!registry.get("2001").unwrap().is_registered());
    }

    #[test]
    fn unresolvable_contact_marks_unreachable() {
        let registry = PhoneRegistry::new();
        registry.add_or_update("2002", "sip:2002@nowhere", "not-an-address:xx", 300);
        let phone = registry.get("2002").unwrap();
        assert!(!phone.is_reachable());
        assert!(phone.ua().is_none());
        // expires > 0 still records the binding attempt.
        assert!(phone.is_registered());
    }

    #[test]
    fn rebinding_same_address_keeps_ua() {
        let registry = PhoneRegistry::new();
        registry.add_or_update("2003", "sip:2003@9.9.9.9:5060", "9.9.9.9:5060", 300);
        let ua1 = registry.get("2003").unwrap().ua().unwrap();
        ua1.set_alive(true);
        registry.add_or_update("2003", "sip:2003@9.9.9.9:5060", "9.9.9.9:5060", 600);
        let ua2 = registry.get("2003").unwrap().ua().unwrap();
        assert!(Arc::ptr_eq(&ua1, &ua2));
        assert!(ua2.is_alive());
    }
}
