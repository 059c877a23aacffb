//! Generation of the random identifiers the protocol needs.

use uuid::Uuid;

use crate::parser::MAGIC_COOKIE;

/// A fresh Call-ID.
pub fn new_call_id() -> String {
    Uuid::new_v4().to_string()
}

fn uuid_suffix() -> String {
    let s = Uuid::new_v4().to_string();
    s[24..].to_string()
}

/// A fresh RFC 3261 Via branch (magic cookie + random suffix).
pub fn new_branch() -> String {
    format!("{}{}", MAGIC_COOKIE, uuid_suffix())
}

/// A fresh From/To tag.
pub fn new_tag() -> String {
    uuid_suffix()
}

/// A fresh opaque transaction key.
pub fn new_key() -> String {
    uuid_suffix()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branches_carry_the_magic_cookie() {
        let b = new_branch();
        assert!(b.starts_with(MAGIC_COOKIE));
        assert!(b.len() > MAGIC_COOKIE.len());
        assert_ne!(new_branch(), b);
    }
}
