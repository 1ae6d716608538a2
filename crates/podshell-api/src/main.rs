//! podshell - browser terminals into Kubernetes pods

use clap::Parser;
use podshell_api::{init_tracing, run, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Backend TLS and the kube client both need a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             Connections to the API server cannot be secured.",
            e
        );
        std::process::exit(1);
    }

    let config = ServerConfig::parse();
    init_tracing(config.log_json)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting podshell");
    run(config).await?;
    Ok(())
}
