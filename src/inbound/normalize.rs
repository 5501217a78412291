//! Sender identity normalization.
//!
//! Identities look like `<user>[:<device>]@<server>`. Personal contacts use
//! `s.whatsapp.net`; internal ids (`lid`) and the legacy `c.us` form are
//! rewritten to it. Group, broadcast and newsletter ids pass through.

use crate::connection::RawInbound;

pub const PERSONAL_SERVER: &str = "s.whatsapp.net";
pub const LEGACY_PERSONAL_SERVER: &str = "c.us";
pub const GROUP_SERVER: &str = "g.us";
pub const INTERNAL_SERVER: &str = "lid";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const NEWSLETTER_SERVER: &str = "newsletter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    /// One-to-one contact, including bare numbers.
    Personal,
    /// Internal id that hides the phone number.
    Internal,
    Group,
    /// Status updates and broadcast lists.
    Broadcast,
    Newsletter,
}

impl IdentityKind {
    pub fn is_channel(self) -> bool {
        matches!(self, Self::Broadcast | Self::Newsletter)
    }
}

pub fn classify(identity: &str) -> IdentityKind {
    let server = identity
        .trim()
        .rsplit_once('@')
        .map_or("", |(_, server)| server);
    match server {
        GROUP_SERVER => IdentityKind::Group,
        INTERNAL_SERVER => IdentityKind::Internal,
        BROADCAST_SERVER => IdentityKind::Broadcast,
        NEWSLETTER_SERVER => IdentityKind::Newsletter,
        _ => IdentityKind::Personal,
    }
}

/// A correction applied to the digits of a personal number.
pub trait NumberRule: Send + Sync {
    fn name(&self) -> &str;

    /// Return the corrected digits, or `None` when the rule does not apply.
    fn apply(&self, digits: &str) -> Option<String>;
}

/// Brazilian mobile numbers gained a leading `9` in the subscriber part.
/// Some identities still carry the old 8-digit form: `55` + 2-digit area
/// code + 8 digits starting with 6-9.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrazilMobileDigitRule;

impl NumberRule for BrazilMobileDigitRule {
    fn name(&self) -> &str {
        "brazil-mobile-ninth-digit"
    }

    fn apply(&self, digits: &str) -> Option<String> {
        if digits.len() != 12 || !digits.starts_with("55") {
            return None;
        }
        let subscriber_lead = digits.as_bytes()[4];
        if !(b'6'..=b'9').contains(&subscriber_lead) {
            return None;
        }
        let mut corrected = String::with_capacity(13);
        corrected.push_str(&digits[..4]);
        corrected.push('9');
        corrected.push_str(&digits[4..]);
        Some(corrected)
    }
}

/// Produces canonical sender identities.
#[derive(Default)]
pub struct SenderNormalizer {
    rules: Vec<Box<dyn NumberRule>>,
}

impl SenderNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_rule(mut self, rule: Box<dyn NumberRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Canonical form of a single identity or bare number.
    ///
    /// Returns `None` when a personal-looking identity has no digits.
    pub fn normalize_identifier(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        match classify(trimmed) {
            IdentityKind::Group | IdentityKind::Broadcast | IdentityKind::Newsletter => {
                Some(trimmed.to_string())
            }
            IdentityKind::Personal | IdentityKind::Internal => {
                let digits = self.apply_rules(numeric_user_part(trimmed)?);
                Some(format!("{digits}@{PERSONAL_SERVER}"))
            }
        }
    }

    /// Pick and normalize the sender of an inbound event.
    ///
    /// Precedence: verified phone number, then group participant, then the
    /// chat identity itself. A candidate that does not normalize yields to
    /// the next one.
    pub fn resolve_sender(&self, raw: &RawInbound) -> Option<String> {
        [
            raw.sender_pn.as_deref(),
            raw.participant.as_deref(),
            Some(raw.remote_jid.as_str()),
        ]
        .into_iter()
        .flatten()
        .find_map(|candidate| self.normalize_identifier(candidate))
    }

    fn apply_rules(&self, digits: String) -> String {
        self.rules
            .iter()
            .find_map(|rule| {
                let corrected = rule.apply(&digits)?;
                tracing::debug!(rule = rule.name(), "Applied number correction");
                Some(corrected)
            })
            .unwrap_or(digits)
    }
}

/// Digits of the user part, ignoring the device suffix and any punctuation.
fn numeric_user_part(identity: &str) -> Option<String> {
    let user = identity
        .split_once('@')
        .map_or(identity, |(user, _)| user);
    let user = user.split_once(':').map_or(user, |(user, _)| user);
    let digits: String = user.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}
