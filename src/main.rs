use accessbroker::config::BrokerConfig;
use accessbroker::directory::InMemoryDirectory;
use accessbroker::policy::document::AllowAllRoles;
use accessbroker::provisioning::iam::InMemoryIamBackend;
use accessbroker::web;
use accessbroker::Broker;
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = BrokerConfig::parse();

    // Use JSON logs in production (ACCESSBROKER_LOG_JSON=1), human-readable otherwise.
    let json_logs = config.log_json || std::env::var("ACCESSBROKER_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("accessbroker=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(listen_addr = %config.listen_addr, directory = %config.directory, "starting accessbroker");

    // The real cloud directory and IAM clients are external black boxes; until one
    // is wired in, the in-memory stand-ins let the service start and serve reads
    // against whatever policy documents were configured.
    let directory: Arc<dyn accessbroker::directory::Directory> = Arc::new(InMemoryDirectory::default());
    let iam_backend: Arc<dyn accessbroker::provisioning::iam::IamBackend> = Arc::new(InMemoryIamBackend::default());

    let broker = Arc::new(Broker::new(config.clone(), directory, iam_backend, Arc::new(AllowAllRoles))?);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");
    axum::serve(listener, web::router(broker)).await?;
    Ok(())
}
