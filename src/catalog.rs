//! Catalog (C7): a read-only, subject-filtered projection over the policy tree.
//! The only surface the HTTP layer uses for listing; it never exposes a node the
//! subject cannot VIEW.

use crate::acl::Permissions;
use crate::policy::tree::{Ancestry, Environment, Group, PolicyTree, System};
use crate::subject::Subject;

pub struct Catalog<'a> {
    subject: &'a Subject,
    tree: &'a PolicyTree,
}

impl<'a> Catalog<'a> {
    pub fn new(subject: &'a Subject, tree: &'a PolicyTree) -> Self {
        Catalog { subject, tree }
    }

    pub fn environments(&self) -> Vec<&'a Environment> {
        self.tree
            .environments
            .iter()
            .filter(|e| self.env_ancestry(e).is_access_allowed(self.subject, Permissions::VIEW))
            .collect()
    }

    pub fn environment(&self, name: &str) -> Option<&'a Environment> {
        let env = self.tree.environment(name)?;
        self.env_ancestry(env)
            .is_access_allowed(self.subject, Permissions::VIEW)
            .then_some(env)
    }

    pub fn systems(&self, env_name: &str) -> Vec<&'a System> {
        let Some(env) = self.environment(env_name) else { return vec![] };
        env.systems
            .iter()
            .filter(|s| self.sys_ancestry(env, s).is_access_allowed(self.subject, Permissions::VIEW))
            .collect()
    }

    pub fn groups(&self, env_name: &str, sys_name: &str) -> Vec<&'a Group> {
        let Some(env) = self.environment(env_name) else { return vec![] };
        let Some(sys) = env.systems.iter().find(|s| s.name == sys_name) else { return vec![] };
        if !self.sys_ancestry(env, sys).is_access_allowed(self.subject, Permissions::VIEW) {
            return vec![];
        }
        sys.groups
            .iter()
            .filter(|g| self.tree.group(env_name, sys_name, &g.name).unwrap().is_access_allowed(self.subject, Permissions::VIEW))
            .collect()
    }

    pub fn group(&self, env_name: &str, sys_name: &str, group_name: &str) -> Option<Ancestry<'a>> {
        let ancestry = self.tree.group(env_name, sys_name, group_name)?;
        ancestry.is_access_allowed(self.subject, Permissions::VIEW).then_some(ancestry)
    }

    fn env_ancestry(&self, env: &'a Environment) -> EnvOnlyView<'a> {
        EnvOnlyView { env }
    }

    fn sys_ancestry(&self, env: &'a Environment, sys: &'a System) -> SysOnlyView<'a> {
        SysOnlyView { env, sys }
    }

    /// Permission check at the environment scope for permissions other than VIEW
    /// (`EXPORT` on the policy-export endpoint, `RECONCILE` on the compliance
    /// endpoints). Returns `false` (not a panic) if the environment isn't even
    /// visible to the subject, so callers can fold both cases into one denial.
    pub fn is_environment_allowed(&self, env_name: &str, perms: Permissions) -> bool {
        let Some(env) = self.tree.environment(env_name) else { return false };
        self.env_ancestry(env).is_access_allowed(self.subject, perms)
    }
}

/// Helper views so VIEW checks at the environment/system level can reuse the same
/// ACL-concatenation logic `Ancestry` uses for groups, without requiring a group to
/// exist.
struct EnvOnlyView<'a> {
    env: &'a Environment,
}

impl EnvOnlyView<'_> {
    fn is_access_allowed(&self, subject: &Subject, perms: Permissions) -> bool {
        self.env.acl.clone().unwrap_or_default().is_allowed(subject, perms)
    }
}

struct SysOnlyView<'a> {
    env: &'a Environment,
    sys: &'a System,
}

impl SysOnlyView<'_> {
    fn is_access_allowed(&self, subject: &Subject, perms: Permissions) -> bool {
        let acl = self.env.acl.clone().unwrap_or_default().concat(self.sys.acl.clone().unwrap_or_default());
        acl.is_allowed(subject, perms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{Ace, AceKind};
    use crate::policy::tree::{ConstraintClass, Constraint, NodeMetadata};
    use crate::principal::{ExpiringPrincipal, Principal};
    use crate::acl::Acl;
    use std::collections::HashMap;

    fn build_tree(viewer_allowed: bool) -> PolicyTree {
        let alice = Principal::EndUser("alice@example.com".into());
        let mut constraints = HashMap::new();
        constraints.insert(ConstraintClass::Join, vec![Constraint::Expiry { default: Some(60), min: None, max: None }]);
        let group = Group {
            name: "g".into(),
            display_name: None,
            description: None,
            metadata: NodeMetadata::default(),
            acl: Some(Acl::new(vec![Ace {
                kind: if viewer_allowed { AceKind::Allow } else { AceKind::Deny },
                principal: alice.clone(),
                mask: Permissions::VIEW,
            }])),
            constraints,
            privileges: vec![],
            environment: "env".into(),
            system: "sys".into(),
        };
        let system = System {
            name: "sys".into(),
            display_name: None,
            description: None,
            metadata: NodeMetadata::default(),
            acl: None,
            constraints: HashMap::new(),
            groups: vec![group],
            environment: "env".into(),
        };
        PolicyTree {
            environments: vec![Environment {
                name: "env".into(),
                display_name: None,
                description: None,
                metadata: NodeMetadata::default(),
                acl: None,
                constraints: HashMap::new(),
                systems: vec![system],
            }],
        }
    }

    #[test]
    fn hides_groups_without_view() {
        let tree = build_tree(false);
        let subject = Subject {
            user: "alice@example.com".into(),
            principals: vec![ExpiringPrincipal::permanent(Principal::EndUser("alice@example.com".into()))],
        };
        let catalog = Catalog::new(&subject, &tree);
        assert!(catalog.groups("env", "sys").is_empty());
        assert!(catalog.group("env", "sys", "g").is_none());
    }

    #[test]
    fn shows_groups_with_view() {
        let tree = build_tree(true);
        let subject = Subject {
            user: "alice@example.com".into(),
            principals: vec![ExpiringPrincipal::permanent(Principal::EndUser("alice@example.com".into()))],
        };
        let catalog = Catalog::new(&subject, &tree);
        assert_eq!(catalog.groups("env", "sys").len(), 1);
        assert!(catalog.group("env", "sys", "g").is_some());
    }
}
