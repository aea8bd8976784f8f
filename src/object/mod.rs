pub mod connection;
pub mod meta;
pub mod story;
pub mod traits;

pub use connection::*;
pub use meta::*;
pub use story::*;
pub use traits::*;

use crate::error::Error;

/// Separator inside composite document ids. Never valid inside an id part.
pub const KEY_SEPARATOR: char = '~';

/// Rejects ids that are empty, padded, or would make composite keys ambiguous.
pub fn validate_key(what: &str, key: &str) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::invalid(format!("{} must not be empty", what)));
    }
    if key.contains(KEY_SEPARATOR) || key.chars().any(char::is_whitespace) {
        return Err(Error::invalid(format!("{} is malformed: {:?}", what, key)));
    }
    Ok(())
}

/// Order-independent id of the pair `{a, b}`.
pub fn pair_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}{}{}", lo, KEY_SEPARATOR, hi)
}

/// Id of a highlighted message, shared by both participants.
pub fn content_key(conversation_id: &str, message_id: &str) -> String {
    format!("{}{}{}", conversation_id, KEY_SEPARATOR, message_id)
}

pub fn sorted_pair(a: &str, b: &str) -> [String; 2] {
    if a <= b {
        [a.to_string(), b.to_string()]
    } else {
        [b.to_string(), a.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_order_independent() {
        assert_eq!(pair_key("alice", "bob"), pair_key("bob", "alice"));
        assert_eq!(pair_key("alice", "bob"), "alice~bob");
        assert_eq!(sorted_pair("bob", "alice"), ["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("actor", "u_123").is_ok());
        assert!(validate_key("actor", "").is_err());
        assert!(validate_key("actor", "a~b").is_err());
        assert!(validate_key("actor", "a b").is_err());
    }
}
