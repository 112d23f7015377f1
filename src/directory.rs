//! The cloud directory client contract (C6's collaborator).
//!
//! Treated as an external black-box per scope: the real implementation talks to a
//! cloud identity directory API. Only the contract and an in-memory test double
//! live here.

use crate::principal::{JitGroupId, Principal};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupMembership {
    pub id: JitGroupId,
}

impl GroupMembership {
    /// Folds a `JitGroupId` into a principal via the reserved-subdomain group
    /// mapping: `jit-<env>-<system>-<name>@<directory>`.
    pub fn to_principal(&self, _directory_domain: &str) -> Principal {
        Principal::JitGroup(self.id.clone())
    }

    pub fn mapped_address(&self, directory_domain: &str) -> String {
        format!("jit-{}-{}-{}@{}", self.id.environment, self.id.system, self.id.name, directory_domain)
    }
}

#[derive(Debug, Clone)]
pub struct MembershipRole {
    pub name: String,
    pub expiry: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn list_memberships(&self, user: &str) -> Result<Vec<GroupMembership>, String>;
    async fn membership_detail(&self, group: &GroupMembership) -> Result<Vec<MembershipRole>, String>;

    /// Plain directory groups the user belongs to, distinct from JIT-managed groups:
    /// ordinary standing group membership, not fanned out through `membership_detail`
    /// because it carries no role/expiry of its own. Resolves to a permanent
    /// `Principal::Group` rather than a temporary one.
    async fn list_group_memberships(&self, user: &str) -> Result<Vec<String>, String>;

    /// Add or extend a temporary membership. The directory API has no notion of a
    /// future start time, so a provisioner always calls this with `expiry = now +
    /// duration`. Idempotent: an existing membership has its expiry replaced
    /// rather than a second entry accumulating.
    async fn put_temporary_membership(
        &self,
        group: &GroupMembership,
        user: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), String>;
}

/// In-memory double used by tests and local development.
#[derive(Default)]
pub struct InMemoryDirectory {
    memberships: Mutex<HashMap<String, Vec<(GroupMembership, Vec<MembershipRole>)>>>,
    group_memberships: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryDirectory {
    pub fn seed_membership(&self, user: &str, group: GroupMembership, roles: Vec<MembershipRole>) {
        self.memberships.lock().unwrap().entry(user.to_string()).or_default().push((group, roles));
    }

    pub fn seed_group_membership(&self, user: &str, group: &str) {
        self.group_memberships.lock().unwrap().entry(user.to_string()).or_default().push(group.to_string());
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn list_memberships(&self, user: &str) -> Result<Vec<GroupMembership>, String> {
        Ok(self
            .memberships
            .lock()
            .unwrap()
            .get(user)
            .map(|v| v.iter().map(|(g, _)| g.clone()).collect())
            .unwrap_or_default())
    }

    async fn membership_detail(&self, group: &GroupMembership) -> Result<Vec<MembershipRole>, String> {
        let guard = self.memberships.lock().unwrap();
        for memberships in guard.values() {
            if let Some((_, roles)) = memberships.iter().find(|(g, _)| g == group) {
                return Ok(roles.clone());
            }
        }
        Ok(Vec::new())
    }

    async fn list_group_memberships(&self, user: &str) -> Result<Vec<String>, String> {
        Ok(self.group_memberships.lock().unwrap().get(user).cloned().unwrap_or_default())
    }

    async fn put_temporary_membership(
        &self,
        group: &GroupMembership,
        user: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), String> {
        let mut guard = self.memberships.lock().unwrap();
        let entries = guard.entry(user.to_string()).or_default();
        let role = MembershipRole { name: "MEMBER".into(), expiry: Some(expiry) };
        match entries.iter_mut().find(|(g, _)| g == group) {
            Some((_, roles)) => {
                roles.clear();
                roles.push(role);
            }
            None => entries.push((group.clone(), vec![role])),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_temporary_membership_replaces_rather_than_accumulates() {
        let dir = InMemoryDirectory::default();
        let group = GroupMembership {
            id: JitGroupId { environment: "prod".into(), system: "billing".into(), name: "readers".into() },
        };
        let now = Utc::now();
        dir.put_temporary_membership(&group, "alice@example.com", now + chrono::Duration::minutes(5)).await.unwrap();
        dir.put_temporary_membership(&group, "alice@example.com", now + chrono::Duration::minutes(15)).await.unwrap();
        let roles = dir.membership_detail(&group).await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].expiry.unwrap(), now + chrono::Duration::minutes(15));
    }

    #[tokio::test]
    async fn lists_seeded_group_memberships() {
        let dir = InMemoryDirectory::default();
        dir.seed_group_membership("alice@example.com", "finance-readers");
        let groups = dir.list_group_memberships("alice@example.com").await.unwrap();
        assert_eq!(groups, vec!["finance-readers".to_string()]);
    }
}
