//! Contact address canonicalization.
//!
//! Every equality check between two parties goes through [`normalize_address`]:
//! raw input may carry a country prefix, spaces or dashes, but only the trailing
//! digits identify a party.

/// Number of trailing digits that identify a party.
pub const SIGNIFICANT_DIGITS: usize = 10;

const IMPLICIT_CHAT_PREFIX: &str = "chat_";

/// Strip everything but ASCII digits and keep the last [`SIGNIFICANT_DIGITS`].
///
/// Shorter inputs are returned stripped but otherwise unchanged, so `"123"`
/// stays `"123"` and empty input stays empty. Idempotent.
#[uniffi::export]
pub fn normalize_address(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= SIGNIFICANT_DIGITS {
        digits[digits.len() - SIGNIFICANT_DIGITS..].to_string()
    } else {
        digits
    }
}

/// True iff both addresses normalize to the same non-empty key.
#[uniffi::export]
pub fn addresses_match(a: &str, b: &str) -> bool {
    let a = normalize_address(a);
    !a.is_empty() && a == normalize_address(b)
}

/// Validation applied when the user adds a contact by hand.
#[uniffi::export]
pub fn is_valid_contact_address(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.len() == SIGNIFICANT_DIGITS && trimmed.chars().all(|c| c.is_ascii_digit())
}

/// Conversation id used when the first inbound message from an unknown party
/// creates the conversation. Derived from the address so that concurrent
/// first-contact events converge on one conversation.
pub fn implicit_chat_id(normalized: &str) -> String {
    format!("{IMPLICIT_CHAT_PREFIX}{normalized}")
}

pub fn is_implicit_chat_id(chat_id: &str) -> bool {
    chat_id.starts_with(IMPLICIT_CHAT_PREFIX)
}
