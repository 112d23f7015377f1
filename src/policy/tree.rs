//! Policy tree (C3): environment -> system -> group hierarchy, with per-node ACL,
//! constraints and metadata, and effective-ACL / effective-constraint derivation
//! over ancestry.

use crate::acl::{Acl, Permissions};
use crate::canonical;
use crate::subject::Subject;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const ID_PATTERN_HINT: &str = "^[A-Za-z0-9_-]{1,32}$";

pub fn is_valid_id(s: &str) -> bool {
    !s.is_empty() && s.len() <= 32 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConstraintClass {
    Join,
    Approve,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedVariable {
    Boolean { default: bool },
    String { pattern: Option<String>, default: String },
    Long { min: Option<i64>, max: Option<i64>, default: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Constraint {
    #[serde(rename = "expiry")]
    Expiry { default: Option<i64>, min: Option<i64>, max: Option<i64> },
    #[serde(rename = "expression")]
    Cel { name: String, display_name: Option<String>, variables: Vec<(String, TypedVariable)>, expression: String },
}

impl Constraint {
    pub fn name(&self) -> &str {
        match self {
            Constraint::Expiry { .. } => "expiry",
            Constraint::Cel { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "iam-role-binding")]
pub struct IamRoleBinding {
    pub resource: String,
    pub role: String,
    pub description: Option<String>,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Privilege {
    #[serde(rename = "iam-role-binding")]
    IamRoleBinding(IamRoleBinding),
}

impl Privilege {
    /// Stable CRC32 over the identifying fields, used to detect configuration
    /// drift between the declared policy and the cloud side's actual bindings.
    pub fn checksum(&self) -> u32 {
        let Privilege::IamRoleBinding(b) = self;
        canonical::checksum(&[
            &b.resource,
            &b.role,
            b.condition.as_deref().unwrap_or(""),
            b.description.as_deref().unwrap_or(""),
        ])
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub source: Option<String>,
    pub last_modified: Option<String>,
    pub version: Option<String>,
    pub default_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub metadata: NodeMetadata,
    pub acl: Option<Acl>,
    pub constraints: HashMap<ConstraintClass, Vec<Constraint>>,
    pub privileges: Vec<Privilege>,
    pub environment: String,
    pub system: String,
}

#[derive(Debug, Clone)]
pub struct System {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub metadata: NodeMetadata,
    pub acl: Option<Acl>,
    pub constraints: HashMap<ConstraintClass, Vec<Constraint>>,
    pub groups: Vec<Group>,
    pub environment: String,
}

#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub metadata: NodeMetadata,
    pub acl: Option<Acl>,
    pub constraints: HashMap<ConstraintClass, Vec<Constraint>>,
    pub systems: Vec<System>,
}

/// Immutable snapshot of the full policy tree for one loaded version. The process
/// holds it behind an atomically-swapped `Arc`; every read within a single request
/// sees one consistent version.
#[derive(Debug, Clone, Default)]
pub struct PolicyTree {
    pub environments: Vec<Environment>,
}

/// Ancestry chain for a group, root first: `(environment, system, group)`.
pub struct Ancestry<'a> {
    pub environment: &'a Environment,
    pub system: &'a System,
    pub group: &'a Group,
}

impl PolicyTree {
    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name == name)
    }

    pub fn system<'a>(&'a self, env: &str, sys: &str) -> Option<(&'a Environment, &'a System)> {
        let e = self.environment(env)?;
        let s = e.systems.iter().find(|s| s.name == sys)?;
        Some((e, s))
    }

    pub fn group<'a>(&'a self, env: &str, sys: &str, group: &str) -> Option<Ancestry<'a>> {
        let (e, s) = self.system(env, sys)?;
        let g = s.groups.iter().find(|g| g.name == group)?;
        Some(Ancestry { environment: e, system: s, group: g })
    }
}

impl<'a> Ancestry<'a> {
    /// Root-first, leaf-last concatenation of ACLs. Missing ACLs at a node
    /// contribute nothing (they inherit purely via concatenation order, never by
    /// copying the parent's entries).
    pub fn effective_acl(&self) -> Acl {
        let mut acl = self.environment.acl.clone().unwrap_or_default();
        acl = acl.concat(self.system.acl.clone().unwrap_or_default());
        acl = acl.concat(self.group.acl.clone().unwrap_or_default());
        acl
    }

    pub fn is_access_allowed(&self, subject: &Subject, perms: Permissions) -> bool {
        self.effective_acl().is_allowed(subject, perms)
    }

    /// Effective constraints for a class: root to leaf, with child constraints of
    /// the same name overriding ancestor constraints of that name.
    pub fn effective_constraints(&self, class: &ConstraintClass) -> Vec<Constraint> {
        let mut by_name: HashMap<String, Constraint> = HashMap::new();
        for node_constraints in [
            self.environment.constraints.get(class),
            self.system.constraints.get(class),
            self.group.constraints.get(class),
        ] {
            if let Some(list) = node_constraints {
                for c in list {
                    by_name.insert(c.name().to_string(), c.clone());
                }
            }
        }
        by_name.into_values().collect()
    }
}
