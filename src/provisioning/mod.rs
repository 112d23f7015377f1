//! Provisioning adapters (C10): translate a successful join/approval into external
//! cloud IAM/directory mutations. Kept behind a small trait so new privilege
//! variants register their own provisioner without the engine knowing the details.

pub mod group;
pub mod iam;

use crate::error::BrokerError;
use crate::policy::tree::Privilege;
use crate::principal::JitGroupId;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

pub use group::GroupMembershipProvisioner;
pub use iam::{IamBindingProvisioner, IamBindingRequest};

pub struct ProvisionRequest {
    pub group: JitGroupId,
    pub user: String,
    pub start: DateTime<Utc>,
    pub duration: Duration,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<(), BrokerError>;
}

/// Orchestrates the full provisioning side-effect of a successful join or
/// approval: the JIT group itself always gets a temporary directory membership,
/// and every `IamRoleBinding` privilege declared on the group additionally gets a
/// temporary conditional IAM binding. Per-privilege failures are accumulated
/// rather than aborting after the first, since the membership grant (the part the
/// user actually asked for) should not be undone by an unrelated privilege error.
pub async fn provision_group(
    group_provisioner: &GroupMembershipProvisioner,
    iam_provisioner: &IamBindingProvisioner,
    request: &ProvisionRequest,
    privileges: &[Privilege],
) -> Result<(), BrokerError> {
    group_provisioner.provision(request).await?;

    let mut failures = Vec::new();
    for privilege in privileges {
        let Privilege::IamRoleBinding(binding) = privilege;
        let iam_request = IamBindingRequest {
            resource: binding.resource.clone(),
            role: binding.role.clone(),
            member: request.user.clone(),
            description: binding.description.clone(),
        };
        if let Err(e) = iam_provisioner.provision_binding(&iam_request, request.start, request.duration).await {
            failures.push(e.to_string());
        }
    }
    if !failures.is_empty() {
        return Err(BrokerError::Aggregate(failures.len(), privileges.len(), failures));
    }
    Ok(())
}
