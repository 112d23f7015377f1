//! IAM-binding provisioner: adds a conditional role binding for privileges of type
//! `iam-role-binding`.
//!
//! Purges existing temporary bindings for the same principal and role on the same
//! resource first (the platform caps the number of bindings per resource), then
//! writes the new one under optimistic concurrency control, retrying on a
//! precondition-failed response up to four attempts.

use crate::cel::TemporaryIamCondition;
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Marker embedded in the condition title of bindings this provisioner manages, so
/// purging can tell its own temporary grants apart from hand-authored bindings.
pub const CONDITION_TITLE_PREFIX: &str = "accessbroker-jit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamCondition {
    pub title: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamBinding {
    pub role: String,
    pub members: Vec<String>,
    pub condition: Option<IamCondition>,
}

#[derive(Debug, Clone, Default)]
pub struct IamPolicy {
    pub bindings: Vec<IamBinding>,
    /// Opaque version token used for optimistic concurrency control.
    pub version: String,
}

#[derive(Debug, Clone)]
pub enum IamBackendError {
    /// HTTP 412: another writer updated the policy first. Retried by the provisioner.
    PreconditionFailed,
    /// HTTP 400 with a known "role not grantable" fragment.
    RoleNotGrantable(String),
    Transient(String),
}

#[async_trait::async_trait]
pub trait IamBackend: Send + Sync {
    async fn get_policy(&self, resource: &str) -> Result<IamPolicy, IamBackendError>;
    async fn set_policy(&self, resource: &str, policy: &IamPolicy) -> Result<(), IamBackendError>;
}

pub struct IamBindingRequest {
    pub resource: String,
    pub role: String,
    pub member: String,
    pub description: Option<String>,
}

pub struct IamBindingProvisioner {
    backend: Arc<dyn IamBackend>,
    max_attempts: u32,
}

impl IamBindingProvisioner {
    pub fn new(backend: Arc<dyn IamBackend>) -> Self {
        IamBindingProvisioner { backend, max_attempts: 4 }
    }

    /// Whether `resource` currently carries a JIT-managed temporary binding for
    /// `role`, for reconciliation reporting. Does not check the member or the
    /// condition window, only that the declared privilege still has *some*
    /// active grant of this shape — the full drift surface (stale principals,
    /// expired-but-unremoved bindings) is cloud-side state this service does
    /// not mirror.
    pub async fn has_active_binding(&self, resource: &str, role: &str) -> Result<bool, BrokerError> {
        let policy = self.backend.get_policy(resource).await.map_err(|e| match e {
            IamBackendError::Transient(msg) => BrokerError::External(msg),
            IamBackendError::PreconditionFailed => BrokerError::External("precondition failed reading policy".into()),
            IamBackendError::RoleNotGrantable(msg) => BrokerError::AccessDenied(msg),
        })?;
        Ok(policy.bindings.iter().any(|b| {
            b.role == role && b.condition.as_ref().is_some_and(|c| c.title.starts_with(CONDITION_TITLE_PREFIX))
        }))
    }

    /// Provision a single IAM role binding directly (used by the join/approval
    /// engine when the group's privilege is an `IamRoleBinding` rather than a
    /// directory group membership).
    pub async fn provision_binding(
        &self,
        request: &IamBindingRequest,
        start: chrono::DateTime<Utc>,
        duration: chrono::Duration,
    ) -> Result<(), BrokerError> {
        let condition = TemporaryIamCondition::new(start, duration);
        let member = format!("user:{}", request.member.to_lowercase());
        let title = format!("{CONDITION_TITLE_PREFIX}:{}:{}", member, request.role);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut policy = match self.backend.get_policy(&request.resource).await {
                Ok(p) => p,
                Err(IamBackendError::Transient(e)) => return Err(BrokerError::External(e)),
                Err(IamBackendError::RoleNotGrantable(e)) => return Err(BrokerError::AccessDenied(e)),
                Err(IamBackendError::PreconditionFailed) => {
                    if attempt >= self.max_attempts {
                        return Err(BrokerError::External("exhausted retries reading IAM policy".into()));
                    }
                    backoff(attempt).await;
                    continue;
                }
            };

            // Purge existing temporary bindings for this (member, role): the
            // platform caps binding count per resource, so stale JIT grants must
            // not accumulate.
            policy.bindings.retain(|b| {
                !(b.role == request.role
                    && b.members.contains(&member)
                    && b.condition.as_ref().is_some_and(|c| c.title.starts_with(CONDITION_TITLE_PREFIX)))
            });
            policy.bindings.push(IamBinding {
                role: request.role.clone(),
                members: vec![member.clone()],
                condition: Some(IamCondition { title: title.clone(), expression: condition.to_expression() }),
            });

            match self.backend.set_policy(&request.resource, &policy).await {
                Ok(()) => {
                    crate::audit::iam_binding_provisioned(&request.resource, &request.role, &member, condition.end());
                    return Ok(());
                }
                Err(IamBackendError::PreconditionFailed) => {
                    if attempt >= self.max_attempts {
                        return Err(BrokerError::External("exhausted retries writing IAM policy (optimistic concurrency)".into()));
                    }
                    backoff(attempt).await;
                    continue;
                }
                Err(IamBackendError::RoleNotGrantable(e)) => return Err(BrokerError::AccessDenied(e)),
                Err(IamBackendError::Transient(e)) => return Err(BrokerError::External(e)),
            }
        }
    }
}

async fn backoff(attempt: u32) {
    let millis = 50u64 * 2u64.pow(attempt.min(6));
    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
}

/// In-memory stand-in for the real cloud IAM client, mirroring
/// `directory::InMemoryDirectory`: no real `get_policy`/`set_policy` call ever
/// fails, so it never exercises the precondition-retry path. Local development
/// and tests only; a deployment wires a real backend behind the same trait.
#[derive(Default)]
pub struct InMemoryIamBackend {
    policies: parking_lot::Mutex<std::collections::HashMap<String, IamPolicy>>,
}

#[async_trait]
impl IamBackend for InMemoryIamBackend {
    async fn get_policy(&self, resource: &str) -> Result<IamPolicy, IamBackendError> {
        Ok(self.policies.lock().get(resource).cloned().unwrap_or_default())
    }

    async fn set_policy(&self, resource: &str, policy: &IamPolicy) -> Result<(), IamBackendError> {
        self.policies.lock().insert(resource.to_string(), policy.clone());
        Ok(())
    }
}
