//! Server configuration
//!
//! Every flag can also be set through the environment. The kubeconfig is
//! resolved the way kubectl does it: an explicit path, otherwise `KUBECONFIG`
//! / `~/.kube/config`, otherwise the in-cluster service account.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use podshell_exec::ExecutorKind;

use crate::error::{Error, Result};

/// podshell - interactive terminals into Kubernetes pods over websockets
#[derive(Parser, Debug, Clone)]
#[command(name = "podshell", version, about, long_about = None)]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "PODSHELL_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Path to a kubeconfig file
    #[arg(long, env = "PODSHELL_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long, env = "PODSHELL_CONTEXT")]
    pub context: Option<String>,

    /// Directory of static frontend files served at `/`
    #[arg(long, env = "PODSHELL_FRONTEND")]
    pub frontend: Option<PathBuf>,

    /// Time allowed for the client websocket upgrade, in seconds
    #[arg(long, env = "PODSHELL_HANDSHAKE_TIMEOUT_SECS", default_value = "10")]
    pub handshake_timeout_secs: u64,

    /// Executor used when a request does not name one (websocket or multiplexed)
    #[arg(long, env = "PODSHELL_DEFAULT_EXECUTOR")]
    pub default_executor: Option<ExecutorKind>,

    /// Emit logs as JSON
    #[arg(long, env = "PODSHELL_LOG_JSON")]
    pub log_json: bool,
}

impl ServerConfig {
    /// Client upgrade timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Load the Kubernetes client configuration
    pub async fn kube_config(&self) -> Result<kube::Config> {
        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..Default::default()
        };

        let config = match (&self.kubeconfig, &self.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::Config(format!("failed to read kubeconfig {:?}: {}", path, e))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &options).await
            }
            (None, Some(_)) => kube::Config::from_kubeconfig(&options).await,
            (None, None) => {
                return kube::Config::infer()
                    .await
                    .map_err(|e| Error::Config(format!("failed to infer kube config: {}", e)))
            }
        };
        config.map_err(|e| Error::Config(format!("failed to load kubeconfig: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::try_parse_from(["podshell"]).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert!(config.default_executor.is_none());
        assert!(config.frontend.is_none());
        assert!(!config.log_json);
    }

    #[test]
    fn test_flags() {
        let config = ServerConfig::try_parse_from([
            "podshell",
            "--listen",
            "127.0.0.1:9000",
            "--context",
            "staging",
            "--frontend",
            "./frontend",
            "--handshake-timeout-secs",
            "3",
            "--default-executor",
            "spdy",
            "--log-json",
        ])
        .unwrap();

        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.context.as_deref(), Some("staging"));
        assert_eq!(config.frontend, Some(PathBuf::from("./frontend")));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(3));
        assert_eq!(config.default_executor, Some(ExecutorKind::Multiplexed));
        assert!(config.log_json);
    }

    #[test]
    fn test_unknown_executor_rejected() {
        assert!(ServerConfig::try_parse_from(["podshell", "--default-executor", "grpc"]).is_err());
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_is_config_error() {
        let config = ServerConfig::try_parse_from([
            "podshell",
            "--kubeconfig",
            "/nonexistent/podshell/kubeconfig",
        ])
        .unwrap();
        assert!(matches!(config.kube_config().await, Err(Error::Config(_))));
    }
}
