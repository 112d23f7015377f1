//! Group-membership provisioner: the JIT-group join path lands here.
//!
//! Adds or extends a temporary directory-group membership whose role carries an
//! expiry. The directory API does not allow a future start time, so `start` is
//! asserted to be `<= now` and `now + duration` is used as the expiry.

use crate::directory::{Directory, GroupMembership};
use crate::error::BrokerError;
use crate::provisioning::{ProvisionRequest, Provisioner};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

pub struct GroupMembershipProvisioner {
    directory: Arc<dyn Directory>,
}

impl GroupMembershipProvisioner {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        GroupMembershipProvisioner { directory }
    }
}

#[async_trait]
impl Provisioner for GroupMembershipProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<(), BrokerError> {
        if request.start > Utc::now() {
            return Err(BrokerError::IllegalArgument("provisioning start time must not be in the future".into()));
        }
        let expiry = request.start + request.duration;
        let membership = GroupMembership { id: request.group.clone() };
        self.directory
            .put_temporary_membership(&membership, &request.user, expiry)
            .await
            .map_err(BrokerError::External)?;
        crate::audit::group_membership_provisioned(&request.group, &request.user, expiry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::principal::JitGroupId;
    use chrono::Duration;

    fn group() -> JitGroupId {
        JitGroupId { environment: "prod".into(), system: "billing".into(), name: "readers".into() }
    }

    #[tokio::test]
    async fn provisions_membership_with_expiry() {
        let directory = Arc::new(InMemoryDirectory::default());
        let provisioner = GroupMembershipProvisioner::new(directory.clone());
        let now = Utc::now();
        let request = ProvisionRequest { group: group(), user: "alice@example.com".into(), start: now, duration: Duration::minutes(15) };
        provisioner.provision(&request).await.unwrap();
        let membership = GroupMembership { id: group() };
        let roles = directory.membership_detail(&membership).await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].expiry.unwrap(), now + Duration::minutes(15));
    }

    #[tokio::test]
    async fn rejects_future_start() {
        let directory = Arc::new(InMemoryDirectory::default());
        let provisioner = GroupMembershipProvisioner::new(directory);
        let request = ProvisionRequest {
            group: group(),
            user: "alice@example.com".into(),
            start: Utc::now() + Duration::minutes(1),
            duration: Duration::minutes(15),
        };
        assert!(provisioner.provision(&request).await.is_err());
    }

    #[tokio::test]
    async fn idempotent_on_repeated_provision() {
        let directory = Arc::new(InMemoryDirectory::default());
        let provisioner = GroupMembershipProvisioner::new(directory.clone());
        let now = Utc::now();
        let request = ProvisionRequest { group: group(), user: "alice@example.com".into(), start: now, duration: Duration::minutes(15) };
        provisioner.provision(&request).await.unwrap();
        provisioner.provision(&request).await.unwrap();
        let membership = GroupMembership { id: group() };
        let roles = directory.membership_detail(&membership).await.unwrap();
        assert_eq!(roles.len(), 1);
    }
}
