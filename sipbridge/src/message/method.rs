use std::fmt;

/// A SIP request method.
///
/// `ReInvite` never appears on the wire under that name: an INVITE
/// carrying a To-tag is promoted to `ReInvite` at parse time so the
/// dialog layer can tell the two apart, but it serializes as `INVITE`
/// and matches an `INVITE` CSeq.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    ReInvite,
    Ack,
    Options,
    Bye,
    Cancel,
    Register,
    Info,
    Prack,
    Subscribe,
    Notify,
    Update,
    Message,
    Refer,
    Publish,
}

impl SipMethod {
    /// Looks up a method from its wire name. Unknown names are rejected.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        let method = match name.to_ascii_uppercase().as_str() {
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "OPTIONS" => SipMethod::Options,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "REGISTER" => SipMethod::Register,
            "INFO" => SipMethod::Info,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "UPDATE" => SipMethod::Update,
            "MESSAGE" => SipMethod::Message,
            "REFER" => SipMethod::Refer,
            "PUBLISH" => SipMethod::Publish,
            _ => return None,
        };
        Some(method)
    }

    /// The wire name of the method.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite | SipMethod::ReInvite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Options => "OPTIONS",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Register => "REGISTER",
            SipMethod::Info => "INFO",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Update => "UPDATE",
            SipMethod::Message => "MESSAGE",
            SipMethod::Refer => "REFER",
            SipMethod::Publish => "PUBLISH",
        }
    }

    /// Whether this request opens a dialog or registration binding.
    pub const fn is_dialog_creating(&self) -> bool {
        matches!(
            self,
            SipMethod::Invite
                | SipMethod::Register
                | SipMethod::Subscribe
                | SipMethod::Options
                | SipMethod::Message
        )
    }

    /// INVITE-class transactions are completed by an ACK.
    pub const fn requires_ack(&self) -> bool {
        matches!(self, SipMethod::Invite | SipMethod::ReInvite)
    }

    /// Whether two methods occupy the same CSeq space on the wire.
    pub const fn same_cseq_space(&self, other: &SipMethod) -> bool {
        match (self, other) {
            (SipMethod::Invite | SipMethod::ReInvite, SipMethod::Invite | SipMethod::ReInvite) => true,
            _ => self.const_eq(other),
        }
    }

    const fn const_eq(&self, other: &SipMethod) -> bool {
        *self as u8 == *other as u8
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_methods() {
        assert_eq!(SipMethod::from_name("INVITE"), Some(SipMethod::Invite));
        assert_eq!(SipMethod::from_name("prack"), Some(SipMethod::Prack));
        assert_eq!(SipMethod::from_name("NEGOTIATE"), None);
    }

    #[test]
    fn reinvite_serializes_as_invite() {
        assert_eq!(SipMethod::ReInvite.as_str(), "INVITE");
        assert!(SipMethod::ReInvite.same_cseq_space(&SipMethod::Invite));
        assert!(!SipMethod::Bye.same_cseq_space(&SipMethod::Invite));
    }
}
