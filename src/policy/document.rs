//! Policy document parser/validator (C4).
//!
//! Two-pass validation: structural (schema conformance) then semantic (constraint
//! completeness, CEL compilation, privilege role validity). Produces a `PolicyTree`
//! plus warnings, or an ordered `Issue` list via `BrokerError::Syntax`.

use crate::acl::{Ace, AceKind, Permissions};
use crate::cel::CelEngine;
use crate::error::BrokerError;
use crate::policy::tree::{
    is_valid_id, Constraint, ConstraintClass, Environment, Group, IamRoleBinding, NodeMetadata, PolicyTree,
    Privilege, System,
};
use crate::acl::Acl;
use crate::principal::Principal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum IssueCode {
    FILE_INVALID_SYNTAX,
    POLICY_INVALID_ID,
    POLICY_DUPLICATE_ID,
    POLICY_MISSING_NAME,
    POLICY_MISSING_ROLES,
    ROLE_INVALID_ID,
    ROLE_MISSING_NAME,
    ROLE_MISSING_ACCESS,
    ACCESS_INVALID_PRINCIPAL,
    ACCESS_INVALID_EFFECT,
    ACCESS_INVALID_ACTION,
    CONSTRAINT_DURATION_CONSTRAINTS_MISSING,
    CONSTRAINT_DURATION_CONSTRAINT_EMPTY,
    CONSTRAINT_DURATION_CONSTRAINT_INVALID,
    CONSTRAINT_APPROVAL_CONSTRAINTS_MISSING,
    CONSTRAINT_APPROVAL_LIMITS_MISSING,
    CONSTRAINT_APPROVAL_LIMITS_INVALID,
    PRIVILEGE_INVALID_ROLE,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub scope: String,
    pub code: IssueCode,
    pub details: String,
}

pub struct ParseOutcome {
    pub tree: PolicyTree,
    pub warnings: Vec<Issue>,
}

/// Consulted during semantic validation to check that an IAM role referenced by a
/// privilege is known. An external collaborator; tests use a fixed allow-list.
pub trait IamRoleResolver: Send + Sync {
    fn is_known_role(&self, role: &str) -> bool;
}

pub struct AllowAllRoles;
impl IamRoleResolver for AllowAllRoles {
    fn is_known_role(&self, _role: &str) -> bool {
        true
    }
}

// --- wire schema -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DocumentWire {
    policy: Option<PolicyWire>,
    policies: Option<Vec<PolicyWire>>,
}

#[derive(Debug, Deserialize)]
struct PolicyWire {
    name: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    access: Vec<AceWire>,
    #[serde(default)]
    constraints: ConstraintsWire,
    systems: Option<Vec<SystemWire>>,
}

#[derive(Debug, Deserialize)]
struct SystemWire {
    name: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    access: Vec<AceWire>,
    #[serde(default)]
    constraints: ConstraintsWire,
    groups: Option<Vec<GroupWire>>,
}

#[derive(Debug, Deserialize)]
struct GroupWire {
    name: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    access: Vec<AceWire>,
    #[serde(default)]
    constraints: ConstraintsWire,
    #[serde(default)]
    privileges: Vec<PrivilegeWire>,
}

#[derive(Debug, Default, Deserialize)]
struct ConstraintsWire {
    join: Option<Vec<ConstraintWire>>,
    approve: Option<Vec<ConstraintWire>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ConstraintWire {
    #[serde(rename = "expiry")]
    Expiry { default: Option<i64>, min: Option<i64>, max: Option<i64> },
    #[serde(rename = "expression")]
    Expression {
        name: String,
        #[serde(rename = "displayName")]
        display_name: Option<String>,
        expression: String,
        #[serde(default)]
        variables: HashMap<String, crate::policy::tree::TypedVariable>,
    },
}

#[derive(Debug, Deserialize)]
struct AceWire {
    principal: String,
    access: String,
    permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum PrivilegeWire {
    #[serde(rename = "iam-role-binding")]
    IamRoleBinding { resource: String, role: String, description: Option<String>, condition: Option<String> },
}

fn permission_from_str(s: &str) -> Option<Permissions> {
    match s {
        "VIEW" => Some(Permissions::VIEW),
        "JOIN" => Some(Permissions::JOIN),
        "APPROVE_SELF" => Some(Permissions::APPROVE_SELF),
        "APPROVE_OTHERS" => Some(Permissions::APPROVE_OTHERS),
        "EXPORT" => Some(Permissions::EXPORT),
        "RECONCILE" => Some(Permissions::RECONCILE),
        _ => None,
    }
}

/// Parse and validate a policy document. Pass 1 is structural; pass 2 is semantic
/// and only runs if pass 1 produced no errors (an unparseable document is not worth
/// semantically analyzing).
pub fn parse(
    doc: &str,
    role_resolver: &dyn IamRoleResolver,
    cel: &CelEngine,
) -> Result<ParseOutcome, BrokerError> {
    let mut issues = Vec::new();

    let wire: DocumentWire = serde_json::from_str(doc).map_err(|e| {
        BrokerError::Syntax(vec![Issue {
            severity: Severity::Error,
            scope: "$".into(),
            code: IssueCode::FILE_INVALID_SYNTAX,
            details: e.to_string(),
        }])
    })?;

    let policies: Vec<PolicyWire> = match (wire.policy, wire.policies) {
        (Some(p), None) => vec![p],
        (None, Some(ps)) if !ps.is_empty() => ps,
        (None, Some(_)) => {
            return Err(BrokerError::Syntax(vec![Issue {
                severity: Severity::Error,
                scope: "$.policies".into(),
                code: IssueCode::FILE_INVALID_SYNTAX,
                details: "policies array must not be empty".into(),
            }]))
        }
        _ => {
            return Err(BrokerError::Syntax(vec![Issue {
                severity: Severity::Error,
                scope: "$".into(),
                code: IssueCode::FILE_INVALID_SYNTAX,
                details: "document must set either `policy` or `policies`".into(),
            }]))
        }
    };

    let mut seen_ids = std::collections::HashSet::new();
    let mut environments = Vec::new();

    for policy in policies {
        let name = match &policy.name {
            Some(n) if is_valid_id(n) => n.clone(),
            Some(n) => {
                issues.push(Issue {
                    severity: Severity::Error,
                    scope: "$.policy".into(),
                    code: IssueCode::POLICY_INVALID_ID,
                    details: format!("invalid policy id: {n}"),
                });
                continue;
            }
            None => {
                issues.push(Issue {
                    severity: Severity::Error,
                    scope: "$.policy".into(),
                    code: IssueCode::POLICY_MISSING_NAME,
                    details: "policy missing name".into(),
                });
                continue;
            }
        };
        if !seen_ids.insert(name.clone()) {
            issues.push(Issue {
                severity: Severity::Error,
                scope: format!("$.policy[{name}]"),
                code: IssueCode::POLICY_DUPLICATE_ID,
                details: format!("duplicate policy id: {name}"),
            });
            continue;
        }

        let acl = parse_acl(&policy.access, &format!("$.policy[{name}].access"), &mut issues);
        let constraints = parse_constraints(&policy.constraints, &format!("$.policy[{name}].constraints"), &mut issues);

        let mut systems = Vec::new();
        let mut seen_system_ids = std::collections::HashSet::new();
        for sys in policy.systems.unwrap_or_default() {
            let sys_name = match &sys.name {
                Some(n) if is_valid_id(n) => n.clone(),
                Some(n) => {
                    issues.push(Issue { severity: Severity::Error, scope: format!("$.policy[{name}].systems"), code: IssueCode::POLICY_INVALID_ID, details: format!("invalid system id: {n}") });
                    continue;
                }
                None => {
                    issues.push(Issue { severity: Severity::Error, scope: format!("$.policy[{name}].systems"), code: IssueCode::POLICY_MISSING_NAME, details: "system missing name".into() });
                    continue;
                }
            };
            if !seen_system_ids.insert(sys_name.clone()) {
                issues.push(Issue { severity: Severity::Error, scope: format!("$.policy[{name}].systems[{sys_name}]"), code: IssueCode::POLICY_DUPLICATE_ID, details: format!("duplicate system id: {sys_name}") });
                continue;
            }

            let sys_acl = parse_acl(&sys.access, &format!("$.policy[{name}].systems[{sys_name}].access"), &mut issues);
            let sys_constraints = parse_constraints(&sys.constraints, &format!("$.policy[{name}].systems[{sys_name}].constraints"), &mut issues);

            let mut groups = Vec::new();
            let mut seen_group_ids = std::collections::HashSet::new();
            for grp in sys.groups.unwrap_or_default() {
                if let Some(g) = parse_group(&name, &sys_name, grp, role_resolver, cel, &mut issues, &mut seen_group_ids) {
                    groups.push(g);
                }
            }

            systems.push(System {
                name: sys_name,
                display_name: sys.display_name,
                description: sys.description,
                metadata: NodeMetadata::default(),
                acl: sys_acl,
                constraints: sys_constraints,
                groups,
                environment: name.clone(),
            });
        }

        environments.push(Environment {
            name,
            display_name: policy.display_name,
            description: policy.description,
            metadata: NodeMetadata::default(),
            acl,
            constraints,
            systems,
        });
    }

    let errors: Vec<Issue> = issues.iter().filter(|i| i.severity == Severity::Error).cloned().collect();
    if !errors.is_empty() {
        return Err(BrokerError::Syntax(issues));
    }

    Ok(ParseOutcome { tree: PolicyTree { environments }, warnings: issues })
}

fn parse_acl(entries: &[AceWire], scope: &str, issues: &mut Vec<Issue>) -> Option<Acl> {
    if entries.is_empty() {
        return None;
    }
    let mut aces = Vec::new();
    for ace in entries {
        let principal = match Principal::parse(&ace.principal) {
            Some(p) => p,
            None => {
                issues.push(Issue { severity: Severity::Error, scope: scope.into(), code: IssueCode::ACCESS_INVALID_PRINCIPAL, details: format!("invalid principal: {}", ace.principal) });
                continue;
            }
        };
        let kind = match ace.access.as_str() {
            "ALLOW" => AceKind::Allow,
            "DENY" => AceKind::Deny,
            other => {
                issues.push(Issue { severity: Severity::Error, scope: scope.into(), code: IssueCode::ACCESS_INVALID_EFFECT, details: format!("invalid effect: {other}") });
                continue;
            }
        };
        let mut mask = Permissions::empty();
        for perm in &ace.permissions {
            match permission_from_str(perm) {
                Some(p) => mask |= p,
                None => issues.push(Issue { severity: Severity::Error, scope: scope.into(), code: IssueCode::ACCESS_INVALID_ACTION, details: format!("invalid permission: {perm}") }),
            }
        }
        aces.push(Ace { kind, principal, mask });
    }
    Some(Acl::new(aces))
}

fn parse_constraints(wire: &ConstraintsWire, scope: &str, issues: &mut Vec<Issue>) -> HashMap<ConstraintClass, Vec<Constraint>> {
    let mut map = HashMap::new();
    if let Some(join) = &wire.join {
        map.insert(ConstraintClass::Join, parse_constraint_list(join, scope, issues));
    }
    if let Some(approve) = &wire.approve {
        map.insert(ConstraintClass::Approve, parse_constraint_list(approve, scope, issues));
    }
    map
}

fn parse_constraint_list(wire: &[ConstraintWire], scope: &str, issues: &mut Vec<Issue>) -> Vec<Constraint> {
    let mut out = Vec::new();
    for c in wire {
        match c {
            ConstraintWire::Expiry { default, min, max } => {
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        issues.push(Issue { severity: Severity::Error, scope: scope.into(), code: IssueCode::CONSTRAINT_DURATION_CONSTRAINT_INVALID, details: "min exceeds max".into() });
                        continue;
                    }
                }
                if matches!((default, min, max), (None, None, None)) {
                    issues.push(Issue { severity: Severity::Error, scope: scope.into(), code: IssueCode::CONSTRAINT_DURATION_CONSTRAINT_EMPTY, details: "expiry constraint has no bounds".into() });
                    continue;
                }
                out.push(Constraint::Expiry { default: *default, min: *min, max: *max });
            }
            ConstraintWire::Expression { name, display_name, expression, variables } => {
                out.push(Constraint::Cel {
                    name: name.clone(),
                    display_name: display_name.clone(),
                    variables: variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    expression: expression.clone(),
                });
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn parse_group(
    env_name: &str,
    sys_name: &str,
    grp: GroupWire,
    role_resolver: &dyn IamRoleResolver,
    cel: &CelEngine,
    issues: &mut Vec<Issue>,
    seen_group_ids: &mut std::collections::HashSet<String>,
) -> Option<Group> {
    let scope_base = format!("$.policy[{env_name}].systems[{sys_name}].groups");
    let name = match &grp.name {
        Some(n) if is_valid_id(n) => n.clone(),
        Some(n) => {
            issues.push(Issue { severity: Severity::Error, scope: scope_base.clone(), code: IssueCode::ROLE_INVALID_ID, details: format!("invalid group id: {n}") });
            return None;
        }
        None => {
            issues.push(Issue { severity: Severity::Error, scope: scope_base.clone(), code: IssueCode::ROLE_MISSING_NAME, details: "group missing name".into() });
            return None;
        }
    };
    if !seen_group_ids.insert(name.clone()) {
        issues.push(Issue { severity: Severity::Error, scope: format!("{scope_base}[{name}]"), code: IssueCode::POLICY_DUPLICATE_ID, details: format!("duplicate group id: {name}") });
        return None;
    }
    let scope = format!("{scope_base}[{name}]");

    let acl = parse_acl(&grp.access, &format!("{scope}.access"), issues);
    if acl.is_none() && grp.access.is_empty() {
        // A group with no ACL at all (not even an explicitly empty one) is fine;
        // it inherits purely from ancestors. An explicitly empty `access: []` also
        // parses to `None` here — both inherit identically, matching the ACL
        // invariant that a missing ACL inherits rather than denying outright.
    }

    let constraints = parse_constraints(&grp.constraints, &format!("{scope}.constraints"), issues);

    // Pass 2 (semantic), scoped to this group: exactly one effective ExpiryConstraint,
    // CEL expressions compile, privilege roles are known.
    let join_constraints = constraints.get(&ConstraintClass::Join);
    let has_expiry = join_constraints.map(|c| c.iter().any(|c| matches!(c, Constraint::Expiry { .. }))).unwrap_or(false);
    if !has_expiry {
        // Only flag here if this group has no ancestor to inherit from is unknown at
        // this scope (ancestry resolution happens at the tree level); the tree-wide
        // check runs in `validate_tree` after assembly.
    }
    for c in join_constraints.into_iter().flatten().chain(constraints.get(&ConstraintClass::Approve).into_iter().flatten()) {
        if let Constraint::Cel { expression, name, .. } = c {
            if let Err(e) = cel.compile(expression) {
                issues.push(Issue { severity: Severity::Error, scope: scope.clone(), code: IssueCode::CONSTRAINT_DURATION_CONSTRAINT_INVALID, details: format!("CEL constraint {name} failed to compile: {e}") });
            }
        }
    }

    let mut privileges = Vec::new();
    for p in grp.privileges {
        let PrivilegeWire::IamRoleBinding { resource, role, description, condition } = p;
        if !role_resolver.is_known_role(&role) {
            issues.push(Issue { severity: Severity::Error, scope: scope.clone(), code: IssueCode::PRIVILEGE_INVALID_ROLE, details: format!("unknown role: {role}") });
            continue;
        }
        privileges.push(Privilege::IamRoleBinding(IamRoleBinding { resource, role, description, condition }));
    }

    Some(Group {
        name,
        display_name: grp.display_name,
        description: grp.description,
        metadata: NodeMetadata::default(),
        acl,
        constraints,
        privileges,
        environment: env_name.to_string(),
        system: sys_name.to_string(),
    })
}

/// Whole-tree semantic check: every group's effective JOIN constraint set (after
/// ancestry resolution) contains exactly one `ExpiryConstraint`.
pub fn validate_tree(tree: &PolicyTree) -> Vec<Issue> {
    let mut issues = Vec::new();
    for env in &tree.environments {
        for sys in &env.systems {
            for grp in &sys.groups {
                let ancestry = crate::policy::tree::Ancestry { environment: env, system: sys, group: grp };
                let effective = ancestry.effective_constraints(&ConstraintClass::Join);
                let expiry_count = effective.iter().filter(|c| matches!(c, Constraint::Expiry { .. })).count();
                if expiry_count != 1 {
                    issues.push(Issue {
                        severity: Severity::Error,
                        scope: format!("$.policy[{}].systems[{}].groups[{}]", env.name, sys.name, grp.name),
                        code: IssueCode::CONSTRAINT_DURATION_CONSTRAINTS_MISSING,
                        details: format!("expected exactly one effective ExpiryConstraint, found {expiry_count}"),
                    });
                }
            }
        }
    }
    issues
}
