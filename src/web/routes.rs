//! REST handlers and router assembly for the HTTP surface of §6.
//!
//! Every handler resolves the caller's `Subject` first (via the shared
//! `SubjectResolver`, cached per `(user, directory)`), then drives the same
//! `Catalog` / `JoinOperation` / `ApprovalOperation` types the unit tests in
//! `catalog.rs`/`join.rs`/`approval.rs` exercise directly — this module adds no
//! authorization logic of its own, it only wires HTTP onto the engine.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Form, Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;

use crate::acl::Permissions;
use crate::approval::{ApprovalOperation, ApprovalOutcome};
use crate::catalog::Catalog;
use crate::error::{BrokerError, Result};
use crate::join::{group_id, membership_for, JoinExecutionContext, JoinOperation, JoinOutcome, PolicyAnalysis, PropertySlot};
use crate::policy::tree::{Environment, Group, Privilege, System};
use crate::principal::JitGroupId;
use crate::web::context::RequestContext;
use crate::web::health;
use crate::Broker;

pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/health/alive", get(health::alive))
        .route("/health/ready", get(health::ready))
        .route("/api/environments", get(list_environments))
        .route("/api/environments/{env}", get(get_environment))
        .route("/api/environments/{env}/policy", get(export_policy))
        .route("/api/environments/{env}/compliance", get(compliance_status).post(run_compliance))
        .route("/api/environments/{env}/systems/{sys}", get(get_system))
        .route("/api/environments/{env}/systems/{sys}/groups/{group}", get(get_group).post(attempt_join))
        .route("/api/environments/{env}/systems/{sys}/groups/{group}/links/{console}", get(console_link))
        .route("/api/environments/{env}/proposal/{token}", get(inspect_proposal).post(attempt_approve))
        .route("/api/policy/lint", post(lint_policy))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(broker)
}

async fn subject_for(broker: &Broker, ctx: &RequestContext) -> crate::subject::Subject {
    broker.resolver.resolve(&ctx.email, &ctx.user_id_directory).await
}

// --- response bodies --------------------------------------------------------

#[derive(Serialize)]
struct EnvironmentSummary {
    name: String,
    display_name: Option<String>,
    description: Option<String>,
}

impl From<&Environment> for EnvironmentSummary {
    fn from(e: &Environment) -> Self {
        EnvironmentSummary { name: e.name.clone(), display_name: e.display_name.clone(), description: e.description.clone() }
    }
}

#[derive(Serialize)]
struct SystemSummary {
    name: String,
    display_name: Option<String>,
    description: Option<String>,
}

impl From<&System> for SystemSummary {
    fn from(s: &System) -> Self {
        SystemSummary { name: s.name.clone(), display_name: s.display_name.clone(), description: s.description.clone() }
    }
}

#[derive(Serialize)]
struct GroupSummary {
    name: String,
    display_name: Option<String>,
    description: Option<String>,
}

impl From<&Group> for GroupSummary {
    fn from(g: &Group) -> Self {
        GroupSummary { name: g.name.clone(), display_name: g.display_name.clone(), description: g.description.clone() }
    }
}

#[derive(Serialize)]
struct EnvironmentDetail {
    #[serde(flatten)]
    summary: EnvironmentSummary,
    systems: Vec<SystemSummary>,
}

#[derive(Serialize)]
struct SystemDetail {
    #[serde(flatten)]
    summary: SystemSummary,
    groups: Vec<GroupSummary>,
}

#[derive(Serialize)]
struct PropertySlotView {
    name: String,
    variable: crate::policy::tree::TypedVariable,
}

impl From<PropertySlot> for PropertySlotView {
    fn from(s: PropertySlot) -> Self {
        PropertySlotView { name: s.name, variable: s.variable }
    }
}

#[derive(Serialize)]
struct PolicyAnalysisView {
    access_allowed: bool,
    satisfied_constraints: Vec<String>,
    unsatisfied_constraints: Vec<String>,
    input: Vec<PropertySlotView>,
    resolved_duration_secs: Option<i64>,
}

impl From<PolicyAnalysis> for PolicyAnalysisView {
    fn from(a: PolicyAnalysis) -> Self {
        PolicyAnalysisView {
            access_allowed: a.access_allowed,
            satisfied_constraints: a.satisfied_constraints,
            unsatisfied_constraints: a.unsatisfied_constraints,
            input: a.input.into_iter().map(Into::into).collect(),
            resolved_duration_secs: a.resolved_duration.map(|d| d.num_seconds()),
        }
    }
}

#[derive(Serialize)]
struct GroupDetail {
    #[serde(flatten)]
    summary: GroupSummary,
    join_analysis: PolicyAnalysisView,
}

#[derive(Serialize)]
#[serde(tag = "status")]
enum JoinResponse {
    #[serde(rename = "JOIN_COMPLETED")]
    Completed { group: JitGroupId, expiry: chrono::DateTime<chrono::Utc> },
    #[serde(rename = "JOIN_PROPOSED")]
    Proposed { group: JitGroupId, proposal_id: String, proposal_token: String, recipients: Vec<String> },
}

#[derive(Serialize)]
struct ProposalView {
    id: String,
    group: JitGroupId,
    proposing_user: String,
    recipients: Vec<String>,
    expiry: chrono::DateTime<chrono::Utc>,
    approval_analysis: PolicyAnalysisView,
}

#[derive(Serialize)]
#[serde(tag = "status")]
enum ApprovalResponse {
    #[serde(rename = "APPROVAL_COMPLETED")]
    Completed { group: JitGroupId, expiry: chrono::DateTime<chrono::Utc> },
}

#[derive(Serialize)]
struct LintResponse {
    valid: bool,
    issues: Vec<crate::policy::document::Issue>,
}

#[derive(Serialize)]
struct GroupComplianceStatus {
    group: JitGroupId,
    resource: String,
    role: String,
    compliant: bool,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ComplianceReport {
    Pending,
    Checked { checked: usize, non_compliant: Vec<GroupComplianceStatus> },
}

#[derive(Serialize)]
struct LinkResponse {
    url: String,
}

fn form_to_input(form: HashMap<String, String>) -> HashMap<String, serde_json::Value> {
    form.into_iter()
        .map(|(k, v)| {
            let value = if let Ok(b) = v.parse::<bool>() {
                serde_json::Value::Bool(b)
            } else if let Ok(n) = v.parse::<i64>() {
                serde_json::Value::Number(n.into())
            } else {
                serde_json::Value::String(v)
            };
            (k, value)
        })
        .collect()
}

fn execution_context<'a>(broker: &'a Broker) -> JoinExecutionContext<'a> {
    JoinExecutionContext {
        proposal_handler: &broker.proposals,
        group_provisioner: &broker.group_provisioner,
        iam_provisioner: &broker.iam_provisioner,
    }
}

// --- handlers ----------------------------------------------------------------

async fn list_environments(ctx: RequestContext, State(broker): State<Arc<Broker>>) -> Result<Json<Vec<EnvironmentSummary>>> {
    let subject = subject_for(&broker, &ctx).await;
    let tree = broker.policy_tree();
    let catalog = Catalog::new(&subject, &tree);
    Ok(Json(catalog.environments().into_iter().map(Into::into).collect()))
}

async fn get_environment(ctx: RequestContext, State(broker): State<Arc<Broker>>, Path(env): Path<String>) -> Result<Json<EnvironmentDetail>> {
    let subject = subject_for(&broker, &ctx).await;
    let tree = broker.policy_tree();
    let catalog = Catalog::new(&subject, &tree);
    let environment = catalog.environment(&env).ok_or_else(|| BrokerError::ResourceNotFound(env.clone()))?;
    let systems = catalog.systems(&env).into_iter().map(Into::into).collect();
    Ok(Json(EnvironmentDetail { summary: environment.into(), systems }))
}

/// Requires `EXPORT` on the environment; returns the raw policy document shape
/// (summaries only — the ACL/constraint internals stay server-side, matching the
/// rest of this surface never exposing a node the subject may not see in full).
async fn export_policy(ctx: RequestContext, State(broker): State<Arc<Broker>>, Path(env): Path<String>) -> Result<Json<EnvironmentDetail>> {
    let subject = subject_for(&broker, &ctx).await;
    let tree = broker.policy_tree();
    let catalog = Catalog::new(&subject, &tree);
    if !catalog.is_environment_allowed(&env, Permissions::EXPORT) {
        return Err(BrokerError::ResourceNotFound(env.clone()));
    }
    let environment = catalog.environment(&env).ok_or_else(|| BrokerError::ResourceNotFound(env.clone()))?;
    let systems = catalog.systems(&env).into_iter().map(Into::into).collect();
    Ok(Json(EnvironmentDetail { summary: environment.into(), systems }))
}

async fn compliance_status(ctx: RequestContext, State(broker): State<Arc<Broker>>, Path(env): Path<String>) -> Result<Json<ComplianceReport>> {
    let subject = subject_for(&broker, &ctx).await;
    let tree = broker.policy_tree();
    let catalog = Catalog::new(&subject, &tree);
    if !catalog.is_environment_allowed(&env, Permissions::RECONCILE) {
        return Err(BrokerError::ResourceNotFound(env.clone()));
    }
    Ok(Json(ComplianceReport::Pending))
}

async fn run_compliance(ctx: RequestContext, State(broker): State<Arc<Broker>>, Path(env): Path<String>) -> Result<Json<ComplianceReport>> {
    let subject = subject_for(&broker, &ctx).await;
    let tree = broker.policy_tree();
    let catalog = Catalog::new(&subject, &tree);
    if !catalog.is_environment_allowed(&env, Permissions::RECONCILE) {
        return Err(BrokerError::ResourceNotFound(env.clone()));
    }
    let environment = catalog.environment(&env).ok_or_else(|| BrokerError::ResourceNotFound(env.clone()))?;

    let mut checked = 0usize;
    let mut non_compliant = Vec::new();
    for system in &environment.systems {
        for group in &system.groups {
            for privilege in &group.privileges {
                let Privilege::IamRoleBinding(binding) = privilege;
                checked += 1;
                let active = broker.iam_provisioner.has_active_binding(&binding.resource, &binding.role).await?;
                if !active {
                    non_compliant.push(GroupComplianceStatus {
                        group: JitGroupId { environment: env.clone(), system: system.name.clone(), name: group.name.clone() },
                        resource: binding.resource.clone(),
                        role: binding.role.clone(),
                        compliant: false,
                    });
                }
            }
        }
    }
    Ok(Json(ComplianceReport::Checked { checked, non_compliant }))
}

async fn get_system(
    ctx: RequestContext,
    State(broker): State<Arc<Broker>>,
    Path((env, sys)): Path<(String, String)>,
) -> Result<Json<SystemDetail>> {
    let subject = subject_for(&broker, &ctx).await;
    let tree = broker.policy_tree();
    let catalog = Catalog::new(&subject, &tree);
    let groups = catalog.groups(&env, &sys);
    let system = catalog
        .systems(&env)
        .into_iter()
        .find(|s| s.name == sys)
        .ok_or_else(|| BrokerError::ResourceNotFound(format!("{env}/{sys}")))?;
    Ok(Json(SystemDetail { summary: system.into(), groups: groups.into_iter().map(Into::into).collect() }))
}

async fn get_group(
    ctx: RequestContext,
    State(broker): State<Arc<Broker>>,
    Path((env, sys, group)): Path<(String, String, String)>,
) -> Result<Json<GroupDetail>> {
    let subject = subject_for(&broker, &ctx).await;
    let tree = broker.policy_tree();
    let catalog = Catalog::new(&subject, &tree);
    let ancestry = catalog
        .group(&env, &sys, &group)
        .ok_or_else(|| BrokerError::ResourceNotFound(format!("{env}/{sys}/{group}")))?;
    let op = JoinOperation::new(ancestry, subject.clone(), &broker.cel);
    let analysis = op.dry_run(&HashMap::new())?;
    Ok(Json(GroupDetail { summary: op.ancestry.group.into(), join_analysis: analysis.into() }))
}

async fn attempt_join(
    ctx: RequestContext,
    State(broker): State<Arc<Broker>>,
    Path((env, sys, group)): Path<(String, String, String)>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<JoinResponse>> {
    let subject = subject_for(&broker, &ctx).await;
    let tree = broker.policy_tree();
    let catalog = Catalog::new(&subject, &tree);
    let ancestry = catalog
        .group(&env, &sys, &group)
        .ok_or_else(|| BrokerError::ResourceNotFound(format!("{env}/{sys}/{group}")))?;
    let op = JoinOperation::new(ancestry, subject, &broker.cel);
    let exec_ctx = execution_context(&broker);
    match op.execute(form_to_input(form), &exec_ctx).await? {
        JoinOutcome::Executed { principal } => Ok(Json(JoinResponse::Completed {
            group: match principal.principal {
                crate::principal::Principal::JitGroup(id) => id,
                _ => unreachable!("join always grants a JitGroup principal"),
            },
            expiry: principal.expiry.expect("executed join always carries an expiry"),
        })),
        JoinOutcome::Proposed { token, proposal } => Ok(Json(JoinResponse::Proposed {
            group: proposal.group,
            proposal_id: proposal.id,
            proposal_token: token,
            recipients: proposal.recipients,
        })),
    }
}

async fn console_link(
    ctx: RequestContext,
    State(broker): State<Arc<Broker>>,
    Path((env, sys, group, console)): Path<(String, String, String, String)>,
) -> Result<Json<LinkResponse>> {
    let subject = subject_for(&broker, &ctx).await;
    let tree = broker.policy_tree();
    let catalog = Catalog::new(&subject, &tree);
    let ancestry = catalog
        .group(&env, &sys, &group)
        .ok_or_else(|| BrokerError::ResourceNotFound(format!("{env}/{sys}/{group}")))?;

    let url = match console.as_str() {
        "directory" => {
            let membership = membership_for(&group_id(&ancestry));
            format!("https://admin.google.com/ac/groups/{}", membership.mapped_address(&broker.config.directory))
        }
        "iam" => {
            let Privilege::IamRoleBinding(binding) = ancestry
                .group
                .privileges
                .first()
                .ok_or_else(|| BrokerError::ResourceNotFound(format!("{env}/{sys}/{group} has no IAM privilege")))?;
            format!("https://console.cloud.google.com/iam-admin/iam?project={}", binding.resource)
        }
        other => return Err(BrokerError::IllegalArgument(format!("unknown console: {other}"))),
    };
    Ok(Json(LinkResponse { url }))
}

async fn inspect_proposal(
    ctx: RequestContext,
    State(broker): State<Arc<Broker>>,
    Path((env, token)): Path<(String, String)>,
) -> Result<Json<ProposalView>> {
    let proposal = broker.proposals.accept(&token)?;
    if proposal.group.environment != env {
        return Err(BrokerError::AccessDenied("proposal does not belong to this environment".into()));
    }
    let tree = broker.policy_tree();
    let ancestry = tree
        .group(&proposal.group.environment, &proposal.group.system, &proposal.group.name)
        .ok_or_else(|| BrokerError::ResourceNotFound(proposal.group.to_string()))?;
    let approver = subject_for(&broker, &ctx).await;
    let id = proposal.id.clone();
    let group = proposal.group.clone();
    let proposing_user = proposal.proposing_user.clone();
    let recipients = proposal.recipients.clone();
    let expiry = proposal.expiry;
    let op = ApprovalOperation::new(ancestry, proposal, approver, &broker.cel);
    let analysis = op.dry_run(&HashMap::new())?;
    Ok(Json(ProposalView { id, group, proposing_user, recipients, expiry, approval_analysis: analysis.into() }))
}

async fn attempt_approve(
    ctx: RequestContext,
    State(broker): State<Arc<Broker>>,
    Path((env, token)): Path<(String, String)>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<ApprovalResponse>> {
    let proposal = broker.proposals.accept(&token)?;
    if proposal.group.environment != env {
        return Err(BrokerError::AccessDenied("proposal does not belong to this environment".into()));
    }
    let tree = broker.policy_tree();
    let ancestry = tree
        .group(&proposal.group.environment, &proposal.group.system, &proposal.group.name)
        .ok_or_else(|| BrokerError::ResourceNotFound(proposal.group.to_string()))?;
    let approver = subject_for(&broker, &ctx).await;
    let op = ApprovalOperation::new(ancestry, proposal, approver, &broker.cel);
    let exec_ctx = execution_context(&broker);
    match op.execute(form_to_input(form), &exec_ctx).await? {
        ApprovalOutcome::Executed { principal } => Ok(Json(ApprovalResponse::Completed {
            group: match principal.principal {
                crate::principal::Principal::JitGroup(id) => id,
                _ => unreachable!("approval always grants a JitGroup principal"),
            },
            expiry: principal.expiry.expect("executed approval always carries an expiry"),
        })),
    }
}

async fn lint_policy(State(broker): State<Arc<Broker>>, body: String) -> Json<LintResponse> {
    match crate::policy::document::parse(&body, broker.role_resolver(), &broker.cel) {
        Ok(outcome) => {
            let tree_issues = crate::policy::document::validate_tree(&outcome.tree);
            let mut issues = outcome.warnings;
            issues.extend(tree_issues);
            let valid = !issues.iter().any(|i| i.severity == crate::policy::document::Severity::Error);
            Json(LintResponse { valid, issues })
        }
        Err(BrokerError::Syntax(issues)) => Json(LintResponse { valid: false, issues }),
        Err(_) => Json(LintResponse { valid: false, issues: vec![] }),
    }
}
