//! Structured audit events (§6's "Audit log", §8's testable properties). Every
//! significant state transition gets exactly one call here rather than an
//! inline `tracing::info!` scattered at the call site, so the field names and
//! the `accessbroker::audit` target stay consistent across modules.

use crate::principal::JitGroupId;
use chrono::{DateTime, Utc};

pub fn join_executed(group: &JitGroupId, user: &str, expiry: DateTime<Utc>) {
    tracing::info!(
        target: "accessbroker::audit",
        event = "joinExecuted",
        group = %group,
        user = %user,
        group_expiry = %expiry,
        "self-approval join executed"
    );
}

pub fn join_proposed(group: &JitGroupId, user: &str, proposal_id: &str, recipients: &[String]) {
    tracing::info!(
        target: "accessbroker::audit",
        event = "joinProposed",
        group = %group,
        user = %user,
        proposal_id = %proposal_id,
        recipients = ?recipients,
        "join requires approval, proposal minted"
    );
}

pub fn approval_executed(group: &JitGroupId, user: &str, approver: &str, proposal_id: &str, expiry: DateTime<Utc>) {
    tracing::info!(
        target: "accessbroker::audit",
        event = "joinExecuted",
        group = %group,
        user = %user,
        approver = %approver,
        proposal_id = %proposal_id,
        group_expiry = %expiry,
        "proposal approved, membership provisioned"
    );
}

pub fn group_membership_provisioned(group: &JitGroupId, user: &str, expiry: DateTime<Utc>) {
    tracing::info!(
        target: "accessbroker::audit",
        group = %group,
        user = %user,
        expiry = %expiry,
        "provisioned temporary group membership"
    );
}

pub fn iam_binding_provisioned(resource: &str, role: &str, member: &str, expiry: DateTime<Utc>) {
    tracing::info!(
        target: "accessbroker::audit",
        resource = %resource,
        role = %role,
        member = %member,
        expiry = %expiry,
        "provisioned temporary IAM binding"
    );
}

/// The single ERROR-level audit event for a `ConstraintFailed`: a configuration
/// problem (bad CEL, unknown variable), not a user-facing denial.
pub fn constraint_failed(reason: &str) {
    tracing::error!(target: "accessbroker::audit", reason = %reason, "constraint evaluation failed, denying");
}
