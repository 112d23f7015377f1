//! Subject resolution (C6): expand an authenticated end user into their transitive
//! principal set, including time-bounded JIT-group memberships.

use crate::directory::{Directory, MembershipRole};
use crate::principal::{ExpiringPrincipal, Principal, AUTHENTICATED_USERS};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Subject {
    pub user: String,
    pub principals: Vec<ExpiringPrincipal>,
}

impl Subject {
    pub fn valid_principals(&self, now: DateTime<Utc>) -> Vec<&Principal> {
        self.principals
            .iter()
            .filter(|p| p.is_valid(now))
            .map(|p| &p.principal)
            .collect()
    }
}

struct CacheEntry {
    subject: Subject,
    inserted_at: Instant,
}

/// Resolves subjects and caches them for a bounded TTL keyed by `(user, directory)`.
/// Concurrent loads of the same key may race; first-writer-wins is acceptable, so
/// the cache uses a plain lock rather than per-key in-flight deduplication.
pub struct SubjectResolver {
    directory: Arc<dyn Directory>,
    cache: Mutex<HashMap<(String, String), CacheEntry>>,
    ttl: Duration,
    fanout_limit: usize,
}

impl SubjectResolver {
    pub fn new(directory: Arc<dyn Directory>, ttl: Duration) -> Self {
        SubjectResolver { directory, cache: Mutex::new(HashMap::new()), ttl, fanout_limit: 8 }
    }

    pub async fn resolve(&self, user: &str, directory_domain: &str) -> Subject {
        let key = (user.to_string(), directory_domain.to_string());
        if let Some(entry) = self.cache.lock().get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return entry.subject.clone();
            }
        }
        let subject = self.resolve_uncached(user, directory_domain).await;
        self.cache.lock().insert(key, CacheEntry { subject: subject.clone(), inserted_at: Instant::now() });
        subject
    }

    /// Lists all memberships, then fans out to fetch each JIT membership's detail
    /// with bounded concurrency, accumulating per-entry failures rather than failing
    /// the whole resolution. Unresolved entries are excluded from the result and
    /// logged at WARN rather than surfaced as an error, per the partial-result
    /// contract. Plain directory-group membership carries no expiry of its own and
    /// resolves directly to a permanent principal, no fan-out needed.
    async fn resolve_uncached(&self, user: &str, directory_domain: &str) -> Subject {
        let mut principals = vec![
            ExpiringPrincipal::permanent(Principal::EndUser(user.to_string())),
            ExpiringPrincipal::permanent(Principal::UserClass(AUTHENTICATED_USERS.to_string())),
        ];

        match self.directory.list_group_memberships(user).await {
            Ok(groups) => {
                principals.extend(groups.into_iter().map(|g| ExpiringPrincipal::permanent(Principal::Group(g))));
            }
            Err(e) => {
                tracing::warn!(user, error = %e, "failed to list directory group memberships, excluding them from the subject");
            }
        }

        let memberships = match self.directory.list_memberships(user).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(user, error = %e, "failed to list memberships, returning user-only subject");
                return Subject { user: user.to_string(), principals };
            }
        };

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.fanout_limit));
        let mut tasks = Vec::with_capacity(memberships.len());
        for group in memberships {
            let permit = semaphore.clone();
            let directory = self.directory.clone();
            let group_for_task = group.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore not closed");
                directory.membership_detail(&group_for_task).await.map(|roles| (group_for_task, roles))
            }));
        }

        let mut failures = Vec::new();
        for task in tasks {
            match task.await {
                Ok(Ok((group, roles))) => {
                    match earliest_role_expiry(&roles) {
                        Some(expiry) => {
                            let p = group.to_principal(directory_domain);
                            principals.push(ExpiringPrincipal::temporary(p, expiry));
                        }
                        None => {
                            tracing::warn!(group = %group, "JIT-managed group membership has no role with an expiry, ignoring (OWNER without expiry is a configuration error)");
                        }
                    }
                }
                Ok(Err(e)) => failures.push(e),
                Err(join_err) => failures.push(join_err.to_string()),
            }
        }
        if !failures.is_empty() {
            tracing::warn!(user, failed = failures.len(), "some membership detail lookups failed, excluding those groups");
        }

        Subject { user: user.to_string(), principals }
    }
}

fn earliest_role_expiry(roles: &[MembershipRole]) -> Option<DateTime<Utc>> {
    roles.iter().filter_map(|r| r.expiry).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{GroupMembership, InMemoryDirectory};
    use crate::principal::JitGroupId;

    #[tokio::test]
    async fn includes_user_and_authenticated_class() {
        let dir = Arc::new(InMemoryDirectory::default());
        let resolver = SubjectResolver::new(dir, Duration::from_secs(60));
        let subject = resolver.resolve("alice@example.com", "example.com").await;
        assert!(subject.principals.iter().any(|p| p.principal == Principal::EndUser("alice@example.com".into())));
        assert!(subject.principals.iter().any(|p| p.principal == Principal::UserClass(AUTHENTICATED_USERS.into())));
    }

    #[tokio::test]
    async fn directory_group_resolves_to_permanent_principal() {
        let dir = Arc::new(InMemoryDirectory::default());
        dir.seed_group_membership("alice@example.com", "finance-readers");
        let resolver = SubjectResolver::new(dir, Duration::from_secs(60));
        let subject = resolver.resolve("alice@example.com", "example.com").await;
        let group = subject
            .principals
            .iter()
            .find(|p| p.principal == Principal::Group("finance-readers".into()))
            .expect("directory group should resolve to a Group principal");
        assert!(group.expiry.is_none());
    }

    #[tokio::test]
    async fn jit_group_without_expiry_is_ignored() {
        let dir = Arc::new(InMemoryDirectory::default());
        let group = GroupMembership {
            id: JitGroupId { environment: "prod".into(), system: "billing".into(), name: "readers".into() },
        };
        dir.seed_membership("alice@example.com", group.clone(), vec![MembershipRole { name: "OWNER".into(), expiry: None }]);
        let resolver = SubjectResolver::new(dir, Duration::from_secs(60));
        let subject = resolver.resolve("alice@example.com", "example.com").await;
        assert!(!subject.principals.iter().any(|p| matches!(p.principal, Principal::JitGroup(_))));
    }

    #[tokio::test]
    async fn jit_group_with_expiry_picks_earliest() {
        let dir = Arc::new(InMemoryDirectory::default());
        let group = GroupMembership {
            id: JitGroupId { environment: "prod".into(), system: "billing".into(), name: "readers".into() },
        };
        let now = Utc::now();
        dir.seed_membership(
            "alice@example.com",
            group.clone(),
            vec![
                MembershipRole { name: "MEMBER".into(), expiry: Some(now + chrono::Duration::minutes(30)) },
                MembershipRole { name: "MANAGER".into(), expiry: Some(now + chrono::Duration::minutes(5)) },
            ],
        );
        let resolver = SubjectResolver::new(dir, Duration::from_secs(60));
        let subject = resolver.resolve("alice@example.com", "example.com").await;
        let expiring = subject.principals.iter().find(|p| matches!(p.principal, Principal::JitGroup(_))).unwrap();
        assert_eq!(expiring.expiry.unwrap(), now + chrono::Duration::minutes(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_resolves_of_same_key_are_safe() {
        let dir = Arc::new(InMemoryDirectory::default());
        let resolver = Arc::new(SubjectResolver::new(dir, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let r = resolver.clone();
            handles.push(tokio::spawn(async move { r.resolve("alice@example.com", "example.com").await }));
        }
        for h in handles {
            let subject = h.await.unwrap();
            assert_eq!(subject.user, "alice@example.com");
        }
    }
}
