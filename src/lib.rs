//! Access brokerage: policy-gated, time-bounded cloud privilege grants.
//!
//! `Broker` wires together the policy tree, subject resolver, CEL engine,
//! proposal handler and provisioners into the one facade the HTTP layer (`web`)
//! drives. Everything else is a focused module per component of the design.

pub mod acl;
pub mod approval;
pub mod audit;
pub mod canonical;
pub mod catalog;
pub mod cel;
pub mod config;
pub mod directory;
pub mod error;
pub mod join;
pub mod policy;
pub mod principal;
pub mod proposal;
pub mod provisioning;
pub mod subject;
pub mod web;

use crate::cel::CelEngine;
use crate::config::BrokerConfig;
use crate::directory::Directory;
use crate::error::BrokerError;
use crate::policy::document::{IamRoleResolver, Severity};
use crate::policy::tree::PolicyTree;
use crate::provisioning::iam::IamBackend;
use crate::provisioning::{GroupMembershipProvisioner, IamBindingProvisioner};
use crate::proposal::ProposalHandler;
use crate::subject::SubjectResolver;
use parking_lot::RwLock;
use std::sync::Arc;

/// Everything a request handler needs: the current policy tree, the subject
/// resolver and its cache, the CEL engine, the proposal signer, and the
/// provisioning adapters. One instance lives for the process lifetime behind
/// an `Arc`, shared across the axum router's state.
pub struct Broker {
    pub config: BrokerConfig,
    tree: RwLock<Arc<PolicyTree>>,
    pub cel: CelEngine,
    pub resolver: SubjectResolver,
    pub proposals: ProposalHandler,
    pub group_provisioner: GroupMembershipProvisioner,
    pub iam_provisioner: IamBindingProvisioner,
    pub directory: Arc<dyn Directory>,
    role_resolver: Arc<dyn IamRoleResolver>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        directory: Arc<dyn Directory>,
        iam_backend: Arc<dyn IamBackend>,
        role_resolver: Arc<dyn IamRoleResolver>,
    ) -> Result<Self, BrokerError> {
        let cel = CelEngine::new();
        let tree = load_policy_tree(&config, role_resolver.as_ref(), &cel)?;
        let resolver = SubjectResolver::new(directory.clone(), config.subject_cache_ttl());
        let proposals = ProposalHandler::new(
            config.service_identity.clone(),
            config.signing_secret.clone(),
            chrono::Duration::seconds(config.proposal_ttl_secs),
        );
        let group_provisioner = GroupMembershipProvisioner::new(directory.clone());
        let iam_provisioner = IamBindingProvisioner::new(iam_backend);

        Ok(Broker {
            config,
            tree: RwLock::new(Arc::new(tree)),
            cel,
            resolver,
            proposals,
            group_provisioner,
            iam_provisioner,
            directory,
            role_resolver,
        })
    }

    /// A consistent snapshot of the policy tree for the lifetime of one request.
    pub fn policy_tree(&self) -> Arc<PolicyTree> {
        self.tree.read().clone()
    }

    /// The `IamRoleResolver` this broker was constructed with, reused by the
    /// `/api/policy/lint` endpoint so a user-submitted document is checked
    /// against the same known-role set as documents loaded at startup.
    pub fn role_resolver(&self) -> &dyn IamRoleResolver {
        self.role_resolver.as_ref()
    }

    /// Re-reads the configured policy source and swaps the tree atomically.
    /// Not wired to an HTTP endpoint (the surface in scope has none); intended
    /// for an operator-triggered reload path outside this crate, per the
    /// "replaced atomically on reload" design note.
    pub fn reload(&self) -> Result<(), BrokerError> {
        let tree = load_policy_tree(&self.config, self.role_resolver.as_ref(), &self.cel)?;
        *self.tree.write() = Arc::new(tree);
        Ok(())
    }

    /// Self-diagnosable readiness: the policy tree is loaded and non-empty.
    /// Backs `GET /health/ready`.
    pub fn is_ready(&self) -> bool {
        !self.tree.read().environments.is_empty()
    }
}

fn load_policy_tree(config: &BrokerConfig, role_resolver: &dyn IamRoleResolver, cel: &CelEngine) -> Result<PolicyTree, BrokerError> {
    let mut paths: Vec<String> = config.policy_files.clone();
    if let Some(dir) = &config.policy_dir {
        let entries = std::fs::read_dir(dir).map_err(|e| BrokerError::External(format!("failed to read policy dir {dir}: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| BrokerError::External(e.to_string()))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path.to_string_lossy().into_owned());
            }
        }
    }
    if paths.is_empty() {
        return Err(BrokerError::IllegalArgument("no policy files configured (--policy-file or --policy-dir)".into()));
    }

    let mut environments = Vec::new();
    for path in &paths {
        let content = std::fs::read_to_string(path).map_err(|e| BrokerError::External(format!("failed to read policy file {path}: {e}")))?;
        let outcome = policy::document::parse(&content, role_resolver, cel)?;
        environments.extend(outcome.tree.environments);
    }

    let tree = PolicyTree { environments };
    let issues = policy::document::validate_tree(&tree);
    let errors: Vec<_> = issues.into_iter().filter(|i| i.severity == Severity::Error).collect();
    if !errors.is_empty() {
        return Err(BrokerError::Syntax(errors));
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::policy::document::AllowAllRoles;
    use crate::provisioning::iam::{IamBackendError, IamPolicy};
    use std::io::Write;

    struct NoopIam;
    #[async_trait::async_trait]
    impl IamBackend for NoopIam {
        async fn get_policy(&self, _resource: &str) -> Result<IamPolicy, IamBackendError> {
            Ok(IamPolicy::default())
        }
        async fn set_policy(&self, _resource: &str, _policy: &IamPolicy) -> Result<(), IamBackendError> {
            Ok(())
        }
    }

    fn config_with_file(path: &str) -> BrokerConfig {
        BrokerConfig {
            listen_addr: "127.0.0.1:0".into(),
            policy_files: vec![path.to_string()],
            policy_dir: None,
            directory: "example.com".into(),
            request_deadline_secs: 30,
            subject_cache_ttl_secs: 120,
            default_duration_secs: 900,
            proposal_ttl_secs: 3600,
            service_identity: "accessbroker@example.com".into(),
            signing_secret: "test-secret".into(),
            log_json: false,
        }
    }

    #[test]
    fn builds_broker_from_a_valid_policy_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"policy": {{"name": "prod", "systems": [{{"name": "billing", "groups": [{{
                "name": "readers",
                "access": [{{"principal": "user:alice@example.com", "access": "ALLOW", "permissions": ["JOIN", "APPROVE_SELF"]}}],
                "constraints": {{"join": [{{"type": "expiry", "default": 900}}]}}
            }}]}}]}}}}"#
        )
        .unwrap();
        let config = config_with_file(file.path().to_str().unwrap());
        let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::default());
        let broker = Broker::new(config, directory, Arc::new(NoopIam), Arc::new(AllowAllRoles)).unwrap();
        assert!(broker.is_ready());
        assert_eq!(broker.policy_tree().environments.len(), 1);
    }

    #[test]
    fn rejects_a_policy_missing_an_expiry_constraint() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"policy": {{"name": "prod", "systems": [{{"name": "billing", "groups": [{{
                "name": "readers",
                "access": [{{"principal": "user:alice@example.com", "access": "ALLOW", "permissions": ["JOIN"]}}]
            }}]}}]}}}}"#
        )
        .unwrap();
        let config = config_with_file(file.path().to_str().unwrap());
        let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::default());
        let err = Broker::new(config, directory, Arc::new(NoopIam), Arc::new(AllowAllRoles)).unwrap_err();
        assert!(matches!(err, BrokerError::Syntax(_)));
    }

    #[test]
    fn no_policy_source_is_an_illegal_argument() {
        let mut config = config_with_file("unused");
        config.policy_files.clear();
        let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::default());
        let err = Broker::new(config, directory, Arc::new(NoopIam), Arc::new(AllowAllRoles)).unwrap_err();
        assert!(matches!(err, BrokerError::IllegalArgument(_)));
    }

    #[test]
    fn reload_reuses_the_role_resolver_it_was_built_with() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"policy": {{"name": "prod", "systems": [{{"name": "billing", "groups": [{{
                "name": "readers",
                "access": [{{"principal": "user:alice@example.com", "access": "ALLOW", "permissions": ["JOIN", "APPROVE_SELF"]}}],
                "constraints": {{"join": [{{"type": "expiry", "default": 900}}]}}
            }}]}}]}}}}"#
        )
        .unwrap();
        let config = config_with_file(file.path().to_str().unwrap());
        let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::default());
        let broker = Broker::new(config, directory, Arc::new(NoopIam), Arc::new(AllowAllRoles)).unwrap();
        broker.reload().unwrap();
        assert!(broker.is_ready());
        assert!(broker.role_resolver().is_known_role("roles/anything"));
    }
}
