//! Process configuration, parsed from CLI flags with environment-variable fallbacks.

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "accessbroker", about = "Just-in-time access brokerage service")]
pub struct BrokerConfig {
    /// Address the HTTP surface listens on.
    #[arg(long, env = "ACCESSBROKER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// One or more policy documents to load at startup. Repeatable.
    #[arg(long = "policy-file", env = "ACCESSBROKER_POLICY_FILE")]
    pub policy_files: Vec<String>,

    /// Directory to scan for `*.json` policy documents, loaded alongside `--policy-file`.
    #[arg(long, env = "ACCESSBROKER_POLICY_DIR")]
    pub policy_dir: Option<String>,

    /// Tenant directory domain used for subject resolution and JIT-group mapping.
    #[arg(long, env = "ACCESSBROKER_DIRECTORY")]
    pub directory: String,

    /// Deadline applied to every outbound call and cached-subject read (seconds).
    #[arg(long, env = "ACCESSBROKER_REQUEST_DEADLINE_SECS", default_value_t = 30)]
    pub request_deadline_secs: u64,

    /// Subject-cache TTL in seconds.
    #[arg(long, env = "ACCESSBROKER_SUBJECT_CACHE_TTL_SECS", default_value_t = 120)]
    pub subject_cache_ttl_secs: u64,

    /// Default JIT-group join duration used when a policy's `ExpiryConstraint`
    /// omits one, in seconds.
    #[arg(long, env = "ACCESSBROKER_DEFAULT_DURATION_SECS", default_value_t = 900)]
    pub default_duration_secs: i64,

    /// Proposal token lifetime in seconds.
    #[arg(long, env = "ACCESSBROKER_PROPOSAL_TTL_SECS", default_value_t = 3600)]
    pub proposal_ttl_secs: i64,

    /// Service identity used as both `iss` and `aud` on minted proposal tokens.
    #[arg(long, env = "ACCESSBROKER_SERVICE_IDENTITY")]
    pub service_identity: String,

    /// HMAC signing secret for proposal tokens (HS256). An asymmetric signer can be
    /// substituted behind the same `ProposalSigner` trait without changing callers.
    #[arg(long, env = "ACCESSBROKER_SIGNING_SECRET")]
    pub signing_secret: String,

    /// Emit JSON logs instead of human-readable ones.
    #[arg(long, env = "ACCESSBROKER_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl BrokerConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }

    pub fn subject_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.subject_cache_ttl_secs)
    }
}
