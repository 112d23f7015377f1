//! Join/Approval engine (C8), shared analysis.
//!
//! `PolicyAnalysis` is the result both `JoinOperation` (this module) and
//! `ApprovalOperation` (`approval.rs`) build on: an ACL check plus per-constraint
//! satisfied/unsatisfied classification, declared user-input slots, and — for the
//! JOIN class — the duration resolved from the effective `ExpiryConstraint`.

use crate::acl::Permissions;
use crate::cel::{CelEngine, ConstraintOutcome};
use crate::directory::GroupMembership;
use crate::error::BrokerError;
use crate::policy::tree::{Ancestry, Constraint, ConstraintClass, TypedVariable};
use crate::principal::{ExpiringPrincipal, JitGroupId, Principal};
use crate::proposal::{Proposal, ProposalHandler, PropertyValue};
use crate::provisioning::{self, GroupMembershipProvisioner, IamBindingProvisioner, ProvisionRequest};
use crate::subject::Subject;
use chrono::Utc;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintMode {
    Enforce,
    Ignore,
}

/// A declared CEL input slot the caller must (or may) fill in.
#[derive(Debug, Clone)]
pub struct PropertySlot {
    pub name: String,
    pub variable: TypedVariable,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyAnalysis {
    pub access_allowed: bool,
    pub satisfied_constraints: Vec<String>,
    pub unsatisfied_constraints: Vec<String>,
    pub input: Vec<PropertySlot>,
    pub resolved_duration: Option<chrono::Duration>,
}

impl PolicyAnalysis {
    pub fn is_satisfied(&self) -> bool {
        self.access_allowed && self.unsatisfied_constraints.is_empty()
    }
}

pub(crate) fn declared_input(ancestry: &Ancestry, class: &ConstraintClass) -> Vec<PropertySlot> {
    let mut slots = Vec::new();
    for c in ancestry.effective_constraints(class) {
        if let Constraint::Cel { variables, .. } = c {
            for (name, variable) in variables {
                slots.push(PropertySlot { name, variable });
            }
        }
    }
    slots
}

fn resolve_duration(
    input: &HashMap<String, serde_json::Value>,
    default: Option<i64>,
    min: Option<i64>,
    max: Option<i64>,
) -> Result<chrono::Duration, BrokerError> {
    let requested = input.get("duration").and_then(|v| v.as_i64());
    let seconds = requested
        .or(default)
        .ok_or_else(|| BrokerError::IllegalArgument("no duration supplied and the expiry constraint has no default".into()))?;
    let clamped = match (min, max) {
        (Some(min), Some(max)) => seconds.clamp(min.min(max), max.max(min)),
        (Some(min), None) => seconds.max(min),
        (None, Some(max)) => seconds.min(max),
        (None, None) => seconds,
    };
    Ok(chrono::Duration::seconds(clamped))
}

/// Evaluate `effectiveConstraints(class)` plus the ACL check for `required_perms`.
/// `ConstraintOutcome::Failed` (a configuration problem — bad CEL, undeclared
/// variable) propagates as `BrokerError::ConstraintFailed` rather than being
/// folded into `unsatisfied_constraints`, per the distinction in spec §4.5.
pub(crate) fn analyze(
    ancestry: &Ancestry,
    subject: &Subject,
    class: ConstraintClass,
    required_perms: Permissions,
    cel: &CelEngine,
    mode: ConstraintMode,
    merged_input: &HashMap<String, serde_json::Value>,
) -> Result<PolicyAnalysis, BrokerError> {
    let access_allowed = ancestry.is_access_allowed(subject, required_perms);
    let mut satisfied = Vec::new();
    let mut unsatisfied = Vec::new();
    let mut resolved_duration = None;

    for c in ancestry.effective_constraints(&class) {
        match &c {
            Constraint::Expiry { default, min, max } => {
                resolved_duration = Some(resolve_duration(merged_input, *default, *min, *max)?);
                satisfied.push(c.name().to_string());
            }
            Constraint::Cel { name, expression, .. } => {
                if mode == ConstraintMode::Ignore {
                    satisfied.push(name.clone());
                    continue;
                }
                match cel.check(expression, merged_input) {
                    ConstraintOutcome::Satisfied => satisfied.push(name.clone()),
                    ConstraintOutcome::Unsatisfied(_) => unsatisfied.push(name.clone()),
                    ConstraintOutcome::Failed(reason) => {
                        return Err(BrokerError::ConstraintFailed(format!("{name}: {reason}")));
                    }
                }
            }
        }
    }

    Ok(PolicyAnalysis {
        access_allowed,
        satisfied_constraints: satisfied,
        unsatisfied_constraints: unsatisfied,
        input: declared_input(ancestry, &class),
        resolved_duration,
    })
}

/// Collects the end users who currently hold APPROVE_OTHERS on a group's effective
/// ACL. There is no group-membership-expansion collaborator in scope (directory
/// group fan-out belongs to subject resolution, not recipient discovery), so only
/// individually-named `user:` ACEs are considered candidates; each is re-checked
/// through the same first-match evaluator used everywhere else so DENY entries and
/// ordering are respected exactly as they would be for a real request from that user.
pub(crate) fn approve_others_candidates(ancestry: &Ancestry) -> Vec<String> {
    let acl = ancestry.effective_acl();
    let mut candidates: Vec<String> = acl
        .entries
        .iter()
        .filter_map(|ace| match &ace.principal {
            Principal::EndUser(email) => Some(email.clone()),
            _ => None,
        })
        .collect();
    candidates.sort();
    candidates.dedup();
    candidates
        .into_iter()
        .filter(|email| {
            let probe = Subject {
                user: email.clone(),
                principals: vec![ExpiringPrincipal::permanent(Principal::EndUser(email.clone()))],
            };
            acl.is_allowed(&probe, Permissions::APPROVE_OTHERS)
        })
        .collect()
}

pub fn group_id(ancestry: &Ancestry) -> JitGroupId {
    JitGroupId {
        environment: ancestry.environment.name.clone(),
        system: ancestry.system.name.clone(),
        name: ancestry.group.name.clone(),
    }
}

pub enum JoinOutcome {
    Executed { principal: ExpiringPrincipal },
    Proposed { token: String, proposal: Proposal },
}

/// External collaborators an `execute()` call needs. Bundled so the engine's
/// signatures stay readable as the dependency list grows.
pub struct JoinExecutionContext<'a> {
    pub proposal_handler: &'a ProposalHandler,
    pub group_provisioner: &'a GroupMembershipProvisioner,
    pub iam_provisioner: &'a IamBindingProvisioner,
}

/// The self-join path: `CREATED` -> `DRY_RUN_OK` -> (`EXECUTED` | `PROPOSED`) or a
/// thrown error. Modeled as methods rather than an explicit state enum — Rust's
/// ownership means a consumed `self` after `execute()` already prevents reuse.
pub struct JoinOperation<'a> {
    pub ancestry: Ancestry<'a>,
    pub subject: Subject,
    pub cel: &'a CelEngine,
}

impl<'a> JoinOperation<'a> {
    pub fn new(ancestry: Ancestry<'a>, subject: Subject, cel: &'a CelEngine) -> Self {
        JoinOperation { ancestry, subject, cel }
    }

    /// Union of the `Property` slots the user must fill: every CEL variable
    /// declared by a JOIN-class constraint on the effective group.
    pub fn input(&self) -> Vec<PropertySlot> {
        declared_input(&self.ancestry, &ConstraintClass::Join)
    }

    /// Binds `input` and evaluates `effectiveConstraints(JOIN)` plus the ACL
    /// check, without provisioning anything.
    pub fn dry_run(&self, input: &HashMap<String, serde_json::Value>) -> Result<PolicyAnalysis, BrokerError> {
        analyze(&self.ancestry, &self.subject, ConstraintClass::Join, Permissions::JOIN, self.cel, ConstraintMode::Enforce, input)
    }

    pub async fn execute(
        &self,
        input: HashMap<String, serde_json::Value>,
        ctx: &JoinExecutionContext<'_>,
    ) -> Result<JoinOutcome, BrokerError> {
        if !self.ancestry.is_access_allowed(&self.subject, Permissions::JOIN) {
            return Err(BrokerError::AccessDenied("subject lacks JOIN permission".into()));
        }

        let analysis = self.dry_run(&input)?;
        if !analysis.unsatisfied_constraints.is_empty() {
            return Err(BrokerError::AccessDenied(format!(
                "unsatisfied join constraints: {}",
                analysis.unsatisfied_constraints.join(", ")
            )));
        }
        let duration = analysis
            .resolved_duration
            .ok_or_else(|| BrokerError::ConstraintFailed("no ExpiryConstraint resolved a duration for this group".into()))?;

        let group = group_id(&self.ancestry);

        if self.ancestry.is_access_allowed(&self.subject, Permissions::APPROVE_SELF) {
            let start = Utc::now();
            let request = ProvisionRequest { group: group.clone(), user: self.subject.user.clone(), start, duration };
            provisioning::provision_group(ctx.group_provisioner, ctx.iam_provisioner, &request, &self.ancestry.group.privileges).await?;
            let expiry = start + duration;
            crate::audit::join_executed(&group, &self.subject.user, expiry);
            Ok(JoinOutcome::Executed { principal: ExpiringPrincipal::temporary(Principal::JitGroup(group), expiry) })
        } else {
            let recipients = approve_others_candidates(&self.ancestry);
            if recipients.is_empty() {
                return Err(BrokerError::AccessDenied("group requires approval but has no eligible approver configured".into()));
            }
            let joining_user_input: Vec<PropertyValue> =
                input.into_iter().map(|(name, value)| PropertyValue { name, value }).collect();
            let (token, proposal) =
                ctx.proposal_handler.propose(group.clone(), &self.subject.user, recipients, joining_user_input, duration)?;
            crate::audit::join_proposed(&group, &self.subject.user, &proposal.id, &proposal.recipients);
            Ok(JoinOutcome::Proposed { token, proposal })
        }
    }
}

/// Folds a `JitGroupId` plus directory domain into the directory-facing
/// `GroupMembership` key, mirroring `GroupMapping` in the directory contract.
pub fn membership_for(group: &JitGroupId) -> GroupMembership {
    GroupMembership { id: group.clone() }
}
