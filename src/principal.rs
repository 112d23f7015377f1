//! Typed principal identifiers (C1).
//!
//! Mirrors the tagged-variant style the policy types use throughout: a sum type with
//! a canonical prefixed string form, parsed back losslessly.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A JIT group identity: the only identifier used both in policy and as a cloud
/// directory group key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JitGroupId {
    pub environment: String,
    pub system: String,
    pub name: String,
}

impl fmt::Display for JitGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.environment, self.system, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    EndUser(String),
    Group(String),
    ServiceAccount(String),
    JitGroup(JitGroupId),
    UserClass(String),
    DirectoryPrincipalSet(String),
}

pub const AUTHENTICATED_USERS: &str = "authenticatedUsers";

impl Principal {
    /// Canonical, case-folded value used for equality and ordering. The identity
    /// system underneath end users, groups and service accounts is case-insensitive
    /// on the local part; user classes and JIT groups are not free text and are left
    /// as-is.
    pub fn value(&self) -> String {
        match self {
            Principal::EndUser(v)
            | Principal::Group(v)
            | Principal::ServiceAccount(v)
            | Principal::DirectoryPrincipalSet(v) => v.to_lowercase(),
            Principal::UserClass(v) => v.clone(),
            Principal::JitGroup(id) => id.to_string(),
        }
    }

    /// Whether this principal variant is IAM-bindable (can appear in cloud IAM
    /// policy bindings). `UserClassId` is not.
    pub fn is_iam_principal(&self) -> bool {
        !matches!(self, Principal::UserClass(_) | Principal::DirectoryPrincipalSet(_))
    }

    /// Stable prefixed string form, e.g. `user:alice@example.com`, `class:authenticatedUsers`.
    pub fn to_canonical_string(&self) -> String {
        match self {
            Principal::EndUser(v) => format!("user:{}", v.to_lowercase()),
            Principal::Group(v) => format!("group:{}", v.to_lowercase()),
            Principal::ServiceAccount(v) => format!("serviceAccount:{}", v.to_lowercase()),
            Principal::JitGroup(id) => format!("jitgroup:{id}"),
            Principal::UserClass(v) => format!("class:{v}"),
            Principal::DirectoryPrincipalSet(v) => format!("domain:{}", v.to_lowercase()),
        }
    }

    /// Parse a prefixed principal string. Prefix is matched case-insensitively;
    /// the local part preserves casing for JIT-group path segments but is folded
    /// to lower-case for identity-backed variants.
    pub fn parse(s: &str) -> Option<Principal> {
        let (prefix, rest) = s.split_once(':')?;
        if rest.is_empty() {
            return None;
        }
        match prefix.to_lowercase().as_str() {
            "user" => Some(Principal::EndUser(rest.to_lowercase())),
            "group" => Some(Principal::Group(rest.to_lowercase())),
            "serviceaccount" => Some(Principal::ServiceAccount(rest.to_lowercase())),
            "class" => Some(Principal::UserClass(rest.to_string())),
            "domain" => Some(Principal::DirectoryPrincipalSet(rest.to_lowercase())),
            "jitgroup" => {
                let mut parts = rest.splitn(3, '/');
                let environment = parts.next()?.to_string();
                let system = parts.next()?.to_string();
                let name = parts.next()?.to_string();
                if environment.is_empty() || system.is_empty() || name.is_empty() {
                    return None;
                }
                Some(Principal::JitGroup(JitGroupId { environment, system, name }))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl PartialOrd for Principal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Principal {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_canonical_string().cmp(&other.to_canonical_string())
    }
}

/// A principal paired with an optional expiry. `expiry == None` means permanent;
/// otherwise the principal is temporary and valid only while `expiry > now`.
/// Temporary principals arise exclusively from JIT-group memberships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiringPrincipal {
    pub principal: Principal,
    pub expiry: Option<chrono::DateTime<chrono::Utc>>,
}

impl ExpiringPrincipal {
    pub fn permanent(principal: Principal) -> Self {
        ExpiringPrincipal { principal, expiry: None }
    }

    pub fn temporary(principal: Principal, expiry: chrono::DateTime<chrono::Utc>) -> Self {
        ExpiringPrincipal { principal, expiry: Some(expiry) }
    }

    pub fn is_valid(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.expiry {
            None => true,
            Some(exp) => exp > now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_forms() {
        assert_eq!(Principal::parse("user:Alice@Example.com"), Some(Principal::EndUser("alice@example.com".into())));
        assert_eq!(Principal::parse("class:authenticatedUsers"), Some(Principal::UserClass("authenticatedUsers".into())));
        assert_eq!(
            Principal::parse("jitgroup:prod/billing/readers"),
            Some(Principal::JitGroup(JitGroupId {
                environment: "prod".into(),
                system: "billing".into(),
                name: "readers".into(),
            }))
        );
        assert_eq!(Principal::parse("bogus"), None);
        assert_eq!(Principal::parse("user:"), None);
    }

    #[test]
    fn round_trips_canonical_string() {
        let p = Principal::EndUser("bob@example.com".into());
        assert_eq!(Principal::parse(&p.to_canonical_string()).unwrap(), p);
    }

    #[test]
    fn user_class_is_not_iam_bindable() {
        assert!(!Principal::UserClass(AUTHENTICATED_USERS.into()).is_iam_principal());
        assert!(Principal::EndUser("a@example.com".into()).is_iam_principal());
    }

    #[test]
    fn expiring_principal_validity() {
        let now = chrono::Utc::now();
        let past = ExpiringPrincipal::temporary(Principal::EndUser("a@example.com".into()), now - chrono::Duration::seconds(1));
        let future = ExpiringPrincipal::temporary(Principal::EndUser("a@example.com".into()), now + chrono::Duration::seconds(1));
        assert!(!past.is_valid(now));
        assert!(future.is_valid(now));
        assert!(ExpiringPrincipal::permanent(Principal::EndUser("a@example.com".into())).is_valid(now));
    }

    #[test]
    fn ordering_is_stable_and_total() {
        let mut v = vec![
            Principal::UserClass("z".into()),
            Principal::EndUser("a@example.com".into()),
            Principal::Group("b".into()),
        ];
        v.sort();
        let mut v2 = v.clone();
        v2.sort();
        assert_eq!(v, v2);
    }
}
