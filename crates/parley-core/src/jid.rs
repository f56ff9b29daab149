/// Utilities for addressing recipients on the WhatsApp network

const USER_SUFFIX: &str = "@s.whatsapp.net";
const GROUP_SUFFIX: &str = "@g.us";

/// Resolve a recipient as typed by a tenant into the JID the transport expects.
/// - A full user or group JID is passed through unchanged
/// - Anything else is reduced to its digits (so "+55 (11) 99999-9999" works)
///
/// Returns `None` when no digits are left.
pub fn to_user_jid(recipient: &str) -> Option<String> {
    let recipient = recipient.trim();

    if recipient.ends_with(USER_SUFFIX) || recipient.ends_with(GROUP_SUFFIX) {
        return Some(recipient.to_string());
    }

    let digits: String = recipient.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    Some(format!("{digits}{USER_SUFFIX}"))
}
