//! Exec eligibility checks
//!
//! Before any transport is opened the target pod's current status is fetched
//! and the container is checked: the pod must exist and still be running,
//! and the container must be a running regular container, not an init
//! container.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use tracing::debug;

use crate::error::{EligibilityError, Result};

/// Pod phases with no process left to attach to
const TERMINAL_PHASES: [&str; 2] = ["Succeeded", "Failed"];

/// Status of one container as reported by the kubelet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// Container name
    pub name: String,
    /// Whether the container is currently running
    pub running: bool,
}

/// The parts of a pod the gate looks at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSnapshot {
    /// Lifecycle phase (Pending, Running, Succeeded, Failed, Unknown)
    pub phase: Option<String>,
    /// Names of the pod's init containers
    pub init_containers: Vec<String>,
    /// Regular container statuses
    pub containers: Vec<ContainerState>,
}

impl From<&Pod> for PodSnapshot {
    fn from(pod: &Pod) -> Self {
        let init_containers = pod
            .spec
            .as_ref()
            .and_then(|s| s.init_containers.as_ref())
            .map(|cs| cs.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default();

        let status = pod.status.as_ref();
        let containers = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|cs| ContainerState {
                        name: cs.name.clone(),
                        running: cs
                            .state
                            .as_ref()
                            .map(|state| state.running.is_some())
                            .unwrap_or(false),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            phase: status.and_then(|s| s.phase.clone()),
            init_containers,
            containers,
        }
    }
}

/// Source of current pod status
///
/// Abstracts the API lookup so the gate can be tested without a cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodStatusSource: Send + Sync {
    /// Fetch the pod, `None` if it does not exist
    async fn pod_status(&self, namespace: &str, pod: &str) -> Result<Option<PodSnapshot>>;
}

/// Pod status read from the Kubernetes API
#[derive(Clone)]
pub struct KubePodStatusSource {
    client: Client,
}

impl KubePodStatusSource {
    /// Create a status source backed by `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodStatusSource for KubePodStatusSource {
    async fn pod_status(&self, namespace: &str, pod: &str) -> Result<Option<PodSnapshot>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods.get_opt(pod).await?;
        Ok(pod.as_ref().map(PodSnapshot::from))
    }
}

/// Pre-flight eligibility check for exec
#[derive(Clone)]
pub struct ExecGate {
    source: Arc<dyn PodStatusSource>,
}

impl ExecGate {
    /// Create a gate reading pod status from `source`
    pub fn new(source: Arc<dyn PodStatusSource>) -> Self {
        Self { source }
    }

    /// Create a gate reading pod status from the Kubernetes API
    pub fn for_client(client: Client) -> Self {
        Self::new(Arc::new(KubePodStatusSource::new(client)))
    }

    /// Check that `container` in `namespace/pod` can be exec'd into
    ///
    /// Has no side effects. Lookup failures are returned as they are.
    pub async fn validate(&self, namespace: &str, pod: &str, container: &str) -> Result<()> {
        let snapshot = self.source.pod_status(namespace, pod).await?;
        check_eligibility(snapshot.as_ref(), namespace, pod, container)?;
        debug!(namespace, pod, container, "exec target eligible");
        Ok(())
    }
}

/// Apply the eligibility rules to a fetched pod
pub fn check_eligibility(
    snapshot: Option<&PodSnapshot>,
    namespace: &str,
    pod: &str,
    container: &str,
) -> std::result::Result<(), EligibilityError> {
    let Some(snapshot) = snapshot else {
        return Err(EligibilityError::NotFound {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
        });
    };

    if let Some(phase) = snapshot
        .phase
        .as_deref()
        .filter(|p| TERMINAL_PHASES.contains(p))
    {
        return Err(EligibilityError::Terminated {
            phase: phase.to_string(),
        });
    }

    if snapshot.init_containers.iter().any(|c| c == container) {
        return Err(EligibilityError::InitContainerTarget {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
        });
    }

    if snapshot
        .containers
        .iter()
        .any(|c| c.name == container && c.running)
    {
        return Ok(());
    }

    Err(EligibilityError::ContainerNotFound {
        namespace: namespace.to_string(),
        pod: pod.to_string(),
        container: container.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        Container, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, PodSpec,
        PodStatus,
    };
    use mockall::predicate::eq;

    use super::*;
    use crate::error::Error;

    fn running_pod() -> PodSnapshot {
        PodSnapshot {
            phase: Some("Running".to_string()),
            init_containers: vec!["setup".to_string()],
            containers: vec![ContainerState {
                name: "app".to_string(),
                running: true,
            }],
        }
    }

    fn gate_with(snapshot: Option<PodSnapshot>) -> ExecGate {
        let mut source = MockPodStatusSource::new();
        source
            .expect_pod_status()
            .with(eq("default"), eq("web-0"))
            .times(1)
            .returning(move |_, _| Ok(snapshot.clone()));
        ExecGate::new(Arc::new(source))
    }

    #[tokio::test]
    async fn test_running_container_is_eligible() {
        let gate = gate_with(Some(running_pod()));
        gate.validate("default", "web-0", "app").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_pod_is_not_found() {
        let gate = gate_with(None);
        let err = gate.validate("default", "web-0", "app").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Eligibility(EligibilityError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_succeeded_pod_is_terminated() {
        let mut pod = running_pod();
        pod.phase = Some("Succeeded".to_string());
        let gate = gate_with(Some(pod));

        let err = gate.validate("default", "web-0", "app").await.unwrap_err();
        match err {
            Error::Eligibility(EligibilityError::Terminated { phase }) => {
                assert_eq!(phase, "Succeeded")
            }
            other => panic!("expected Terminated, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_pod_is_terminated() {
        let mut pod = running_pod();
        pod.phase = Some("Failed".to_string());
        assert!(matches!(
            check_eligibility(Some(&pod), "default", "web-0", "app"),
            Err(EligibilityError::Terminated { .. })
        ));
    }

    #[tokio::test]
    async fn test_init_container_is_rejected() {
        let gate = gate_with(Some(running_pod()));
        let err = gate.validate("default", "web-0", "setup").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Eligibility(EligibilityError::InitContainerTarget { .. })
        ));
    }

    #[test]
    fn test_unknown_container_is_not_found() {
        assert!(matches!(
            check_eligibility(Some(&running_pod()), "default", "web-0", "sidecar"),
            Err(EligibilityError::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn test_waiting_container_is_not_found() {
        let mut pod = running_pod();
        pod.containers[0].running = false;
        assert!(matches!(
            check_eligibility(Some(&pod), "default", "web-0", "app"),
            Err(EligibilityError::ContainerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_lookup_failure_propagates() {
        let mut source = MockPodStatusSource::new();
        source
            .expect_pod_status()
            .returning(|_, _| Err(Error::transport("api", "connection refused")));
        let gate = ExecGate::new(Arc::new(source));

        assert!(matches!(
            gate.validate("default", "web-0", "app").await,
            Err(Error::Transport { .. })
        ));
    }

    #[test]
    fn test_snapshot_from_pod() {
        let pod = Pod {
            spec: Some(PodSpec {
                init_containers: Some(vec![Container {
                    name: "migrate".to_string(),
                    ..Default::default()
                }]),
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![
                    ContainerStatus {
                        name: "app".to_string(),
                        state: Some(k8s_openapi::api::core::v1::ContainerState {
                            running: Some(ContainerStateRunning::default()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ContainerStatus {
                        name: "sidecar".to_string(),
                        state: Some(k8s_openapi::api::core::v1::ContainerState {
                            waiting: Some(ContainerStateWaiting::default()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let snapshot = PodSnapshot::from(&pod);
        assert_eq!(snapshot.phase.as_deref(), Some("Running"));
        assert_eq!(snapshot.init_containers, vec!["migrate".to_string()]);
        assert_eq!(
            snapshot.containers,
            vec![
                ContainerState {
                    name: "app".to_string(),
                    running: true
                },
                ContainerState {
                    name: "sidecar".to_string(),
                    running: false
                },
            ]
        );
        assert!(check_eligibility(Some(&snapshot), "default", "web-0", "app").is_ok());
        assert!(matches!(
            check_eligibility(Some(&snapshot), "default", "web-0", "migrate"),
            Err(EligibilityError::InitContainerTarget { .. })
        ));
    }
}
