//! Approval engine (C8.2), the MPA (multi-party-approval) path. Reuses
//! `join`'s `PolicyAnalysis`/`analyze`/`approve_others_candidates`: the same
//! effective-ACL and effective-constraint machinery governs both paths, the
//! only difference being which constraint class and whose input is bound.

use crate::acl::Permissions;
use crate::cel::CelEngine;
use crate::error::BrokerError;
use crate::join::{self, declared_input, ConstraintMode, JoinExecutionContext, PolicyAnalysis, PropertySlot};
use crate::policy::tree::{Ancestry, ConstraintClass};
use crate::principal::{ExpiringPrincipal, Principal};
use crate::proposal::Proposal;
use crate::provisioning::{self, ProvisionRequest};
use crate::subject::Subject;
use chrono::Utc;
use std::collections::HashMap;

pub enum ApprovalOutcome {
    Executed { principal: ExpiringPrincipal },
}

/// The MPA path: a verified `Proposal` plus the approver's current `Subject`.
/// Consumes both by value, mirroring `JoinOperation`'s consumed-self style.
pub struct ApprovalOperation<'a> {
    pub ancestry: Ancestry<'a>,
    pub proposal: Proposal,
    pub approver: Subject,
    pub cel: &'a CelEngine,
}

impl<'a> ApprovalOperation<'a> {
    pub fn new(ancestry: Ancestry<'a>, proposal: Proposal, approver: Subject, cel: &'a CelEngine) -> Self {
        ApprovalOperation { ancestry, proposal, approver, cel }
    }

    pub fn joining_user(&self) -> &str {
        &self.proposal.proposing_user
    }

    /// Union of the `Property` slots the approver must fill: every CEL
    /// variable declared by an APPROVE-class constraint on the effective group.
    pub fn input(&self) -> Vec<PropertySlot> {
        declared_input(&self.ancestry, &ConstraintClass::Approve)
    }

    /// Binds the approver's `input` and evaluates `effectiveConstraints(APPROVE)`
    /// plus the ACL check, without provisioning anything.
    pub fn dry_run(&self, input: &HashMap<String, serde_json::Value>) -> Result<PolicyAnalysis, BrokerError> {
        join::analyze(&self.ancestry, &self.approver, ConstraintClass::Approve, Permissions::APPROVE_OTHERS, self.cel, ConstraintMode::Enforce, input)
    }

    pub async fn execute(
        self,
        approver_input: HashMap<String, serde_json::Value>,
        ctx: &JoinExecutionContext<'_>,
    ) -> Result<ApprovalOutcome, BrokerError> {
        if self.approver.user == self.proposal.proposing_user {
            return Err(BrokerError::AccessDenied("an approver cannot approve their own proposal".into()));
        }
        if !self.proposal.recipients.iter().any(|r| r == &self.approver.user) {
            return Err(BrokerError::AccessDenied("approver is not in the proposal's recipient set".into()));
        }
        if !self.ancestry.is_access_allowed(&self.approver, Permissions::APPROVE_OTHERS) {
            return Err(BrokerError::AccessDenied("approver no longer holds APPROVE_OTHERS on this group".into()));
        }
        if self.proposal.expiry <= Utc::now() {
            return Err(BrokerError::AccessDenied("proposal has expired".into()));
        }

        let approve_analysis = self.dry_run(&approver_input)?;
        if !approve_analysis.unsatisfied_constraints.is_empty() {
            return Err(BrokerError::AccessDenied(format!(
                "unsatisfied approval constraints: {}",
                approve_analysis.unsatisfied_constraints.join(", ")
            )));
        }

        // Re-evaluate JOIN-class constraints now, against the proposer's recorded
        // input, in case the policy changed between proposal and approval.
        let joining_user_input: HashMap<String, serde_json::Value> =
            self.proposal.joining_user_input.iter().map(|p| (p.name.clone(), p.value.clone())).collect();
        let join_analysis = join::analyze(
            &self.ancestry,
            &self.approver,
            ConstraintClass::Join,
            Permissions::JOIN,
            self.cel,
            ConstraintMode::Enforce,
            &joining_user_input,
        )?;
        if !join_analysis.unsatisfied_constraints.is_empty() {
            return Err(BrokerError::AccessDenied(format!(
                "join constraints no longer satisfied: {}",
                join_analysis.unsatisfied_constraints.join(", ")
            )));
        }

        let group = join::group_id(&self.ancestry);
        let start = Utc::now();
        let request = ProvisionRequest {
            group: group.clone(),
            user: self.proposal.proposing_user.clone(),
            start,
            duration: self.proposal.duration,
        };
        provisioning::provision_group(ctx.group_provisioner, ctx.iam_provisioner, &request, &self.ancestry.group.privileges).await?;
        let expiry = start + self.proposal.duration;

        crate::audit::approval_executed(&group, &self.proposal.proposing_user, &self.approver.user, &self.proposal.id, expiry);

        Ok(ApprovalOutcome::Executed { principal: ExpiringPrincipal::temporary(Principal::JitGroup(group), expiry) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{Ace, AceKind, Acl};
    use crate::cel::CelEngine;
    use crate::directory::InMemoryDirectory;
    use crate::policy::tree::{Constraint, Environment, Group, NodeMetadata, System};
    use crate::proposal::{ProposalHandler, PropertyValue};
    use crate::provisioning::{GroupMembershipProvisioner, IamBindingProvisioner};
    use std::collections::HashMap as Map;
    use std::sync::Arc;

    fn alice() -> Principal {
        Principal::EndUser("alice@example.com".into())
    }

    fn bob() -> Principal {
        Principal::EndUser("bob@example.com".into())
    }

    fn subject_for(p: Principal, user: &str) -> Subject {
        Subject { user: user.into(), principals: vec![ExpiringPrincipal::permanent(p)] }
    }

    fn env_with_group(group: Group) -> (Environment, System) {
        let sys = System {
            name: "sys".into(),
            display_name: None,
            description: None,
            metadata: NodeMetadata::default(),
            acl: None,
            constraints: Map::new(),
            groups: vec![group],
            environment: "env".into(),
        };
        let env = Environment {
            name: "env".into(),
            display_name: None,
            description: None,
            metadata: NodeMetadata::default(),
            acl: None,
            constraints: Map::new(),
            systems: vec![],
        };
        (env, sys)
    }

    fn group_with_acl(aces: Vec<Ace>, expiry_default: i64) -> Group {
        let mut constraints = Map::new();
        constraints.insert(ConstraintClass::Join, vec![Constraint::Expiry { default: Some(expiry_default), min: None, max: None }]);
        Group {
            name: "g".into(),
            display_name: None,
            description: None,
            metadata: NodeMetadata::default(),
            acl: Some(Acl::new(aces)),
            constraints,
            privileges: vec![],
            environment: "env".into(),
            system: "sys".into(),
        }
    }

    fn ctx_parts() -> (ProposalHandler, GroupMembershipProvisioner, IamBindingProvisioner, Arc<InMemoryDirectory>) {
        let proposal_handler = ProposalHandler::new("accessbroker@example.com", "secret", chrono::Duration::hours(1));
        let directory = Arc::new(InMemoryDirectory::default());
        let group_provisioner = GroupMembershipProvisioner::new(directory.clone());
        struct DenyAllIam;
        #[async_trait::async_trait]
        impl crate::provisioning::iam::IamBackend for DenyAllIam {
            async fn get_policy(&self, _r: &str) -> Result<crate::provisioning::iam::IamPolicy, crate::provisioning::iam::IamBackendError> {
                Ok(Default::default())
            }
            async fn set_policy(&self, _r: &str, _p: &crate::provisioning::iam::IamPolicy) -> Result<(), crate::provisioning::iam::IamBackendError> {
                Ok(())
            }
        }
        let iam_provisioner = IamBindingProvisioner::new(Arc::new(DenyAllIam));
        (proposal_handler, group_provisioner, iam_provisioner, directory)
    }

    fn make_proposal(handler: &ProposalHandler, recipients: Vec<String>) -> (String, Proposal) {
        handler
            .propose(
                crate::principal::JitGroupId { environment: "env".into(), system: "sys".into(), name: "g".into() },
                "alice@example.com",
                recipients,
                vec![PropertyValue { name: "reason".into(), value: serde_json::json!("oncall") }],
                chrono::Duration::minutes(15),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn approval_happy_path_executes() {
        let aces = vec![
            Ace { kind: AceKind::Allow, principal: alice(), mask: Permissions::JOIN },
            Ace { kind: AceKind::Allow, principal: bob(), mask: Permissions::APPROVE_OTHERS },
        ];
        let group = group_with_acl(aces, 900);
        let (env, sys) = env_with_group(group.clone());
        let ancestry = Ancestry { environment: &env, system: &sys, group: &group };
        let cel = CelEngine::new();

        let (proposal_handler, group_provisioner, iam_provisioner, _directory) = ctx_parts();
        let (_token, proposal) = make_proposal(&proposal_handler, vec!["bob@example.com".into()]);

        let op = ApprovalOperation::new(ancestry, proposal, subject_for(bob(), "bob@example.com"), &cel);
        let ctx = JoinExecutionContext {
            proposal_handler: &proposal_handler,
            group_provisioner: &group_provisioner,
            iam_provisioner: &iam_provisioner,
        };
        let outcome = op.execute(Map::new(), &ctx).await.unwrap();
        match outcome {
            ApprovalOutcome::Executed { principal } => {
                assert!(matches!(principal.principal, Principal::JitGroup(_)));
                assert!(principal.expiry.is_some());
            }
        }
    }

    #[tokio::test]
    async fn self_approval_is_denied() {
        let aces = vec![Ace { kind: AceKind::Allow, principal: alice(), mask: Permissions::JOIN | Permissions::APPROVE_OTHERS }];
        let group = group_with_acl(aces, 900);
        let (env, sys) = env_with_group(group.clone());
        let ancestry = Ancestry { environment: &env, system: &sys, group: &group };
        let cel = CelEngine::new();

        let (proposal_handler, group_provisioner, iam_provisioner, _directory) = ctx_parts();
        let (_token, proposal) = make_proposal(&proposal_handler, vec!["alice@example.com".into()]);

        let op = ApprovalOperation::new(ancestry, proposal, subject_for(alice(), "alice@example.com"), &cel);
        let ctx = JoinExecutionContext {
            proposal_handler: &proposal_handler,
            group_provisioner: &group_provisioner,
            iam_provisioner: &iam_provisioner,
        };
        let err = op.execute(Map::new(), &ctx).await.unwrap_err();
        assert!(matches!(err, BrokerError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn approver_not_in_recipients_is_denied() {
        let aces = vec![
            Ace { kind: AceKind::Allow, principal: alice(), mask: Permissions::JOIN },
            Ace { kind: AceKind::Allow, principal: bob(), mask: Permissions::APPROVE_OTHERS },
        ];
        let group = group_with_acl(aces, 900);
        let (env, sys) = env_with_group(group.clone());
        let ancestry = Ancestry { environment: &env, system: &sys, group: &group };
        let cel = CelEngine::new();

        let (proposal_handler, group_provisioner, iam_provisioner, _directory) = ctx_parts();
        let (_token, proposal) = make_proposal(&proposal_handler, vec!["carol@example.com".into()]);

        let op = ApprovalOperation::new(ancestry, proposal, subject_for(bob(), "bob@example.com"), &cel);
        let ctx = JoinExecutionContext {
            proposal_handler: &proposal_handler,
            group_provisioner: &group_provisioner,
            iam_provisioner: &iam_provisioner,
        };
        let err = op.execute(Map::new(), &ctx).await.unwrap_err();
        assert!(matches!(err, BrokerError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn expired_proposal_is_denied() {
        let aces = vec![
            Ace { kind: AceKind::Allow, principal: alice(), mask: Permissions::JOIN },
            Ace { kind: AceKind::Allow, principal: bob(), mask: Permissions::APPROVE_OTHERS },
        ];
        let group = group_with_acl(aces, 900);
        let (env, sys) = env_with_group(group.clone());
        let ancestry = Ancestry { environment: &env, system: &sys, group: &group };
        let cel = CelEngine::new();

        let (proposal_handler, group_provisioner, iam_provisioner, _directory) = ctx_parts();
        let (_token, mut proposal) = make_proposal(&proposal_handler, vec!["bob@example.com".into()]);
        proposal.expiry = Utc::now() - chrono::Duration::seconds(1);

        let op = ApprovalOperation::new(ancestry, proposal, subject_for(bob(), "bob@example.com"), &cel);
        let ctx = JoinExecutionContext {
            proposal_handler: &proposal_handler,
            group_provisioner: &group_provisioner,
            iam_provisioner: &iam_provisioner,
        };
        let err = op.execute(Map::new(), &ctx).await.unwrap_err();
        assert!(matches!(err, BrokerError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn revoked_approve_others_is_denied() {
        let aces = vec![Ace { kind: AceKind::Allow, principal: alice(), mask: Permissions::JOIN }];
        let group = group_with_acl(aces, 900);
        let (env, sys) = env_with_group(group.clone());
        let ancestry = Ancestry { environment: &env, system: &sys, group: &group };
        let cel = CelEngine::new();

        let (proposal_handler, group_provisioner, iam_provisioner, _directory) = ctx_parts();
        let (_token, proposal) = make_proposal(&proposal_handler, vec!["bob@example.com".into()]);

        let op = ApprovalOperation::new(ancestry, proposal, subject_for(bob(), "bob@example.com"), &cel);
        let ctx = JoinExecutionContext {
            proposal_handler: &proposal_handler,
            group_provisioner: &group_provisioner,
            iam_provisioner: &iam_provisioner,
        };
        let err = op.execute(Map::new(), &ctx).await.unwrap_err();
        assert!(matches!(err, BrokerError::AccessDenied(_)));
    }
}
