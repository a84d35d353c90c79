//! Workload metadata lookup.
//!
//! For KubeVirt the pod is a launcher; the VM name the attachment should
//! be keyed on lives in a pod label.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use ovncni_common::{CniError, CniResult, KubernetesConfig, WorkloadIdentity};
use reqwest::{Certificate, Client, StatusCode};
use serde::Deserialize;

/// Pod labels.
pub type Labels = BTreeMap<String, String>;

/// Read-only source of pod labels.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Labels of pod `name` in `namespace`.
    async fn pod_labels(&self, namespace: &str, name: &str) -> CniResult<Labels>;
}

/// Resolve the workload identity of a pod.
///
/// The logical name comes from `label` when present and non-empty, the pod
/// name otherwise.
///
/// # Errors
///
/// Returns [`CniError::MetadataLookup`] if the labels cannot be read.
pub async fn resolve_workload(
    source: &dyn MetadataSource,
    namespace: &str,
    pod: &str,
    label: &str,
) -> CniResult<WorkloadIdentity> {
    let labels = source.pod_labels(namespace, pod).await?;
    let name = match labels.get(label) {
        Some(name) if !name.is_empty() => name.clone(),
        _ => {
            tracing::debug!(namespace, pod, label, "Workload label absent, using pod name");
            pod.to_string()
        }
    };
    Ok(WorkloadIdentity::new(namespace, name))
}

/// Fixed labels; for tests and clusters without an API server.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    pods: HashMap<(String, String), Labels>,
}

impl StaticMetadata {
    /// No pods; every lookup yields empty labels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register labels for a pod.
    #[must_use]
    pub fn with_pod<'a>(
        mut self,
        namespace: &str,
        name: &str,
        labels: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        self.pods.insert(
            (namespace.to_string(), name.to_string()),
            labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }
}

#[async_trait]
impl MetadataSource for StaticMetadata {
    async fn pod_labels(&self, namespace: &str, name: &str) -> CniResult<Labels> {
        Ok(self
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    labels: Labels,
}

/// Reads pod labels from the Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubeApiMetadata {
    client: Client,
    api_server: String,
    token: Option<String>,
}

impl KubeApiMetadata {
    /// Build a client from the `kubernetes` section of the network config.
    ///
    /// A missing token file means anonymous requests.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Config`] if no API server is configured or the
    /// CA bundle cannot be loaded.
    pub fn from_config(config: &KubernetesConfig, timeout: Duration) -> CniResult<Self> {
        let api_server = config.api_server.clone().ok_or_else(|| CniError::Config {
            message: "kubernetes.apiServer is not set".to_string(),
        })?;

        let mut builder = Client::builder().timeout(timeout);
        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file)?;
            let cert = Certificate::from_pem(&pem).map_err(|e| CniError::Config {
                message: format!("invalid CA bundle {}: {e}", ca_file.display()),
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(|e| CniError::Config {
            message: format!("failed to build HTTP client: {e}"),
        })?;

        let token = std::fs::read_to_string(&config.token_file)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Ok(Self {
            client,
            api_server: api_server.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl MetadataSource for KubeApiMetadata {
    async fn pod_labels(&self, namespace: &str, name: &str) -> CniResult<Labels> {
        let lookup_error = |message: String| CniError::MetadataLookup {
            workload: format!("{namespace}/{name}"),
            message,
        };

        let url = format!("{}/api/v1/namespaces/{namespace}/pods/{name}", self.api_server);
        tracing::debug!(url = %url, "Getting pod");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| lookup_error(format!("request failed: {e}")))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(lookup_error("pod not found".to_string())),
            status => return Err(lookup_error(format!("API server returned {status}"))),
        }

        let pod: Pod = response
            .json()
            .await
            .map_err(|e| lookup_error(format!("undecodable pod: {e}")))?;
        Ok(pod.metadata.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABEL: &str = "vm.kubevirt.io/name";

    #[tokio::test]
    async fn label_names_the_workload() {
        let source = StaticMetadata::new().with_pod("team-a", "virt-launcher-vm-1-x7k2p", [(LABEL, "vm-1")]);
        let identity = resolve_workload(&source, "team-a", "virt-launcher-vm-1-x7k2p", LABEL)
            .await
            .unwrap();
        assert_eq!(identity, WorkloadIdentity::new("team-a", "vm-1"));
    }

    #[tokio::test]
    async fn pod_name_is_the_fallback() {
        let source = StaticMetadata::new().with_pod("team-a", "web-0", [(LABEL, "")]);
        let identity = resolve_workload(&source, "team-a", "web-0", LABEL).await.unwrap();
        assert_eq!(identity.name, "web-0");

        let identity = resolve_workload(&StaticMetadata::new(), "team-a", "web-1", LABEL)
            .await
            .unwrap();
        assert_eq!(identity.to_string(), "team-a/web-1");
    }

    #[test]
    fn api_server_is_required() {
        let err = KubeApiMetadata::from_config(&KubernetesConfig::default(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, CniError::Config { .. }));
    }

    #[test]
    fn pod_labels_decode() {
        let pod: Pod = serde_json::from_str(
            r#"{"kind":"Pod","metadata":{"name":"p","labels":{"vm.kubevirt.io/name":"vm-1"}},"spec":{}}"#,
        )
        .unwrap();
        assert_eq!(pod.metadata.labels.get(LABEL).map(String::as_str), Some("vm-1"));
    }
}
