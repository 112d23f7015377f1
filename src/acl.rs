//! Access Control List evaluation (C2): ordered allow/deny entries over principals
//! with permission bitmasks, first-match evaluation.

use crate::principal::Principal;
use crate::subject::Subject;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Permissions: u32 {
        const VIEW            = 0b0000_0001;
        const JOIN             = 0b0000_0010;
        const APPROVE_SELF      = 0b0000_0100;
        const APPROVE_OTHERS    = 0b0000_1000;
        const EXPORT            = 0b0001_0000;
        const RECONCILE         = 0b0010_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AceKind {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ace {
    pub kind: AceKind,
    pub principal: Principal,
    pub mask: Permissions,
}

/// Ordered sequence of ACEs. Evaluation is first-match: the first entry whose
/// principal matches one of the subject's valid principals, and whose mask fully
/// covers the requested permissions, decides the outcome. No matching entry denies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Acl {
    pub entries: Vec<Ace>,
}

impl Acl {
    pub fn new(entries: Vec<Ace>) -> Self {
        Acl { entries }
    }

    pub fn is_allowed(&self, subject: &Subject, required: Permissions) -> bool {
        let valid: Vec<&Principal> = subject.valid_principals(chrono::Utc::now());
        for ace in &self.entries {
            if !valid.iter().any(|p| **p == ace.principal) {
                continue;
            }
            if !ace.mask.contains(required) {
                continue;
            }
            return matches!(ace.kind, AceKind::Allow);
        }
        false
    }

    /// Concatenate entries, `self` first then `other` (root-first, leaf-last when
    /// called by `effective_acl`). First-match over the concatenation means an
    /// ancestor entry is tested before a descendant one — ancestors bind unless a
    /// *closer ancestor* ALLOW is placed ahead of a farther descendant DENY.
    pub fn concat(mut self, mut other: Acl) -> Acl {
        self.entries.append(&mut other.entries);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::ExpiringPrincipal;

    fn subject_for(p: Principal) -> Subject {
        Subject {
            user: match &p {
                Principal::EndUser(u) => u.clone(),
                _ => "x@example.com".into(),
            },
            principals: vec![ExpiringPrincipal::permanent(p)],
        }
    }

    #[test]
    fn first_match_wins() {
        let alice = Principal::EndUser("alice@example.com".into());
        let acl = Acl::new(vec![
            Ace { kind: AceKind::Deny, principal: alice.clone(), mask: Permissions::JOIN },
            Ace { kind: AceKind::Allow, principal: alice.clone(), mask: Permissions::JOIN },
        ]);
        assert!(!acl.is_allowed(&subject_for(alice), Permissions::JOIN));
    }

    #[test]
    fn no_match_denies() {
        let acl = Acl::new(vec![]);
        let alice = Principal::EndUser("alice@example.com".into());
        assert!(!acl.is_allowed(&subject_for(alice), Permissions::VIEW));
    }

    #[test]
    fn mask_must_fully_cover_requirement() {
        let alice = Principal::EndUser("alice@example.com".into());
        let acl = Acl::new(vec![Ace {
            kind: AceKind::Allow,
            principal: alice.clone(),
            mask: Permissions::VIEW,
        }]);
        assert!(!acl.is_allowed(&subject_for(alice), Permissions::VIEW | Permissions::JOIN));
    }

    #[test]
    fn acl_monotonicity_deny_before_allow_cannot_relax() {
        let alice = Principal::EndUser("alice@example.com".into());
        let base = Acl::new(vec![Ace { kind: AceKind::Allow, principal: alice.clone(), mask: Permissions::VIEW }]);
        let with_leading_deny = Acl::new(vec![
            Ace { kind: AceKind::Deny, principal: alice.clone(), mask: Permissions::VIEW },
        ])
        .concat(base.clone());
        assert!(base.is_allowed(&subject_for(alice.clone()), Permissions::VIEW));
        assert!(!with_leading_deny.is_allowed(&subject_for(alice), Permissions::VIEW));
    }

    #[test]
    fn first_match_truncation_property() {
        let alice = Principal::EndUser("alice@example.com".into());
        let full = Acl::new(vec![
            Ace { kind: AceKind::Deny, principal: alice.clone(), mask: Permissions::VIEW },
            Ace { kind: AceKind::Allow, principal: alice.clone(), mask: Permissions::VIEW },
        ]);
        let truncated = Acl::new(vec![full.entries[0].clone()]);
        assert_eq!(
            full.is_allowed(&subject_for(alice.clone()), Permissions::VIEW),
            truncated.is_allowed(&subject_for(alice), Permissions::VIEW)
        );
    }
}
