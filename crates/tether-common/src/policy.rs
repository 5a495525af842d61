//! Inbound type gate.
//!
//! Every inbound envelope's type byte is checked here before its body is
//! decoded. The allow-set is closed: anything not explicitly allowed,
//! including bytes that name no known type, is denied.

use crate::envelope::TypeTag;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// Result of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The envelope may be decoded.
    Allow,
    /// The envelope must not be decoded.
    Deny,
}

/// Identity of an inbound type byte, as reported on rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeIdentity {
    /// A recognized envelope type.
    Known(TypeTag),
    /// A byte outside the protocol vocabulary.
    Unrecognized(u8),
}

impl TypeIdentity {
    /// Classifies a wire byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match TypeTag::from_byte(byte) {
            Some(tag) => Self::Known(tag),
            None => Self::Unrecognized(byte),
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Known(tag) => tag.name(),
            Self::Unrecognized(_) => "unrecognized",
        }
    }
}

impl fmt::Display for TypeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(tag) => fmt::Display::fmt(tag, f),
            Self::Unrecognized(byte) => write!(f, "unrecognized type (0x{byte:02x})"),
        }
    }
}

/// One entry of the rejected-type ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedType {
    /// What was rejected.
    pub identity: TypeIdentity,
    /// When it was first rejected.
    pub first_seen: SystemTime,
    /// How many times it has been rejected.
    pub count: u64,
}

/// Closed allow-set over envelope types, plus a ledger of what it denied.
///
/// Clones share the ledger.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    allowed: HashSet<TypeTag>,
    rejected: Arc<Mutex<Vec<RejectedType>>>,
}

impl SecurityPolicy {
    /// Allows exactly the given tags.
    pub fn allow_only(tags: impl IntoIterator<Item = TypeTag>) -> Self {
        Self {
            allowed: tags.into_iter().collect(),
            rejected: Arc::default(),
        }
    }

    /// Allows every recognized tag. Unrecognized bytes are still denied.
    #[must_use]
    pub fn allow_all_known() -> Self {
        Self::allow_only(TypeTag::ALL)
    }

    /// What an agent accepts from its controller.
    #[must_use]
    pub fn agent() -> Self {
        Self::allow_only([
            TypeTag::Text,
            TypeTag::Bytes,
            TypeTag::Ping,
            TypeTag::Pong,
            TypeTag::SetupPing,
            TypeTag::Task,
            TypeTag::Interrupt,
        ])
    }

    /// What a controller accepts from an agent. Agents cannot send tasks.
    #[must_use]
    pub fn controller() -> Self {
        Self::allow_only([
            TypeTag::Text,
            TypeTag::Bytes,
            TypeTag::Ping,
            TypeTag::Pong,
            TypeTag::Outcome,
        ])
    }

    /// Rules on a type byte. A denial is recorded in the ledger.
    pub fn decide(&self, byte: u8) -> Decision {
        let identity = TypeIdentity::from_byte(byte);
        if let TypeIdentity::Known(tag) = identity {
            if self.allowed.contains(&tag) {
                return Decision::Allow;
            }
        }
        self.record(identity);
        Decision::Deny
    }

    /// Whether `tag` is in the allow-set. Does not touch the ledger.
    #[must_use]
    pub fn allows(&self, tag: TypeTag) -> bool {
        self.allowed.contains(&tag)
    }

    /// Everything rejected so far, in first-seen order.
    #[must_use]
    pub fn rejected(&self) -> Vec<RejectedType> {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, identity: TypeIdentity) {
        let mut ledger = self.rejected.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = ledger.iter_mut().find(|e| e.identity == identity) {
            entry.count += 1;
        } else {
            ledger.push(RejectedType {
                identity,
                first_seen: SystemTime::now(),
                count: 1,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{TYPE_OUTCOME, TYPE_SETUP_PING, TYPE_TASK, TYPE_TEXT};

    #[test]
    fn unknown_byte_is_denied_even_when_everything_known_is_allowed() {
        let policy = SecurityPolicy::allow_all_known();
        assert_eq!(policy.decide(0x7F), Decision::Deny);
        assert_eq!(policy.decide(TYPE_TASK), Decision::Allow);
    }

    #[test]
    fn controller_refuses_tasks_from_agents() {
        let policy = SecurityPolicy::controller();
        assert_eq!(policy.decide(TYPE_TASK), Decision::Deny);
        assert_eq!(policy.decide(TYPE_SETUP_PING), Decision::Deny);
        assert_eq!(policy.decide(TYPE_OUTCOME), Decision::Allow);
        assert_eq!(policy.decide(TYPE_TEXT), Decision::Allow);
    }

    #[test]
    fn agent_refuses_outcomes() {
        let policy = SecurityPolicy::agent();
        assert_eq!(policy.decide(TYPE_OUTCOME), Decision::Deny);
        assert!(policy.allows(TypeTag::Task));
    }

    #[test]
    fn ledger_deduplicates_and_counts() {
        let policy = SecurityPolicy::controller();
        policy.decide(TYPE_TASK);
        policy.decide(0x7F);
        policy.decide(TYPE_TASK);

        let ledger = policy.rejected();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].identity, TypeIdentity::Known(TypeTag::Task));
        assert_eq!(ledger[0].count, 2);
        assert_eq!(ledger[1].identity, TypeIdentity::Unrecognized(0x7F));
        assert!(ledger[0].first_seen <= ledger[1].first_seen);
    }

    #[test]
    fn clones_share_the_ledger() {
        let policy = SecurityPolicy::agent();
        let clone = policy.clone();
        clone.decide(TYPE_OUTCOME);
        assert_eq!(policy.rejected().len(), 1);
    }

    #[test]
    fn allowed_types_are_not_recorded() {
        let policy = SecurityPolicy::agent();
        policy.decide(TYPE_TASK);
        assert!(policy.rejected().is_empty());
    }

    #[test]
    fn identity_display_names_the_type() {
        assert_eq!(TypeIdentity::from_byte(TYPE_TASK).to_string(), "task (0x20)");
        assert_eq!(
            TypeIdentity::from_byte(0xEE).to_string(),
            "unrecognized type (0xee)"
        );
    }
}
