//! Invocation surface: runtime environment, command dispatch.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ovncni_common::{AttachmentRequest, CniError, CniResult, NetConf, WorkloadIdentity};
use ovncni_network::LinkFabricator;
use ovncni_ovsdb::{Endpoint, JsonRpcClient, OvsdbClient, UnreachableDb};
use serde_json::Value;

use crate::ipam::{AddressBroker, HttpAddressBroker, NoAddressBroker};
use crate::metadata::{MetadataSource, resolve_workload};
use crate::orchestrator::Orchestrator;
use crate::result::{AttachmentResult, ErrorEnvelope, VersionResult};

/// OVN CNI plugin. Parameters come from the runtime's CNI_* variables and
/// the network configuration on stdin.
#[derive(Debug, Clone, Parser)]
#[command(name = "ovn-cni")]
#[command(author, version, about, long_about = None)]
pub struct CniArgs {
    /// Operation requested by the runtime.
    #[arg(long, env = "CNI_COMMAND", value_enum)]
    pub command: CniCommand,

    /// Container ID.
    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path to the network namespace.
    #[arg(long, env = "CNI_NETNS")]
    pub netns: Option<PathBuf>,

    /// Interface name inside the namespace.
    #[arg(long, env = "CNI_IFNAME", default_value = "eth0")]
    pub ifname: String,

    /// Extra `KEY=VALUE` pairs separated by `;`.
    #[arg(long, env = "CNI_ARGS", default_value = "")]
    pub args: String,

    /// Plugin search path.
    #[arg(long, env = "CNI_PATH", default_value = "")]
    pub path: String,
}

/// CNI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CniCommand {
    /// Attach an interface.
    #[value(name = "ADD")]
    Add,
    /// Detach an interface.
    #[value(name = "DEL")]
    Del,
    /// Verify an attachment.
    #[value(name = "CHECK")]
    Check,
    /// Report supported versions.
    #[value(name = "VERSION")]
    Version,
}

/// Pod named in `CNI_ARGS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
}

/// Split `CNI_ARGS` into its pairs.
///
/// # Errors
///
/// Returns [`CniError::Config`] for a piece without `=`.
pub fn parse_cni_args(args: &str) -> CniResult<BTreeMap<String, String>> {
    args.split(';')
        .filter(|piece| !piece.is_empty())
        .map(|piece| {
            piece
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| CniError::Config {
                    message: format!("invalid CNI_ARGS entry {piece:?}"),
                })
        })
        .collect()
}

impl CniArgs {
    /// The pod this invocation is for.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Config`] if `CNI_ARGS` is malformed or lacks
    /// `K8S_POD_NAMESPACE` or `K8S_POD_NAME`.
    pub fn pod(&self) -> CniResult<PodRef> {
        let mut pairs = parse_cni_args(&self.args)?;
        let mut take = |key: &str| {
            pairs
                .remove(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| CniError::Config {
                    message: format!("CNI_ARGS is missing {key}"),
                })
        };
        Ok(PodRef {
            namespace: take("K8S_POD_NAMESPACE")?,
            name: take("K8S_POD_NAME")?,
        })
    }

    fn netns(&self) -> CniResult<PathBuf> {
        self.netns
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| CniError::Config {
                message: "CNI_NETNS is required".to_string(),
            })
    }
}

/// Collaborators for one invocation, built once by the caller.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    /// Address allocator.
    pub broker: &'a dyn AddressBroker,
    /// Kernel link management.
    pub links: &'a dyn LinkFabricator,
    /// Local switch database.
    pub switch_db: &'a dyn OvsdbClient,
    /// Northbound database.
    pub northbound_db: &'a dyn OvsdbClient,
    /// Pod metadata.
    pub metadata: &'a dyn MetadataSource,
}

/// Address broker for `command`. Only ADD allocates, so the endpoint is
/// not looked at otherwise.
///
/// # Errors
///
/// Returns [`CniError::Config`] if ADD has no usable endpoint.
pub fn broker_for(command: CniCommand, conf: &NetConf) -> CniResult<Box<dyn AddressBroker>> {
    if command == CniCommand::Add {
        Ok(Box::new(HttpAddressBroker::new(
            &conf.ipam.endpoint,
            conf.timeouts.database(),
        )?))
    } else {
        Ok(Box::new(NoAddressBroker))
    }
}

/// A database connection for one invocation, or why there is none.
#[derive(Debug)]
pub enum Store {
    /// Connected over JSON-RPC.
    Connected(JsonRpcClient),
    /// The connect failed; every request reports that failure.
    Unreachable(UnreachableDb),
}

impl Store {
    /// Connect to `database` at `endpoint`.
    ///
    /// ADD needs every database, so a failed connect ends it here. Other
    /// commands get an [`UnreachableDb`] instead, which lets DEL still run
    /// the steps that only touch the other database or the kernel.
    ///
    /// # Errors
    ///
    /// Returns the connect error, for ADD only.
    pub async fn connect(
        command: CniCommand,
        endpoint: &str,
        database: &str,
        timeout: Duration,
    ) -> CniResult<Self> {
        let connected = match endpoint.parse::<Endpoint>() {
            Ok(parsed) => JsonRpcClient::connect(parsed, database, timeout).await,
            Err(e) => Err(e),
        };
        match connected {
            Ok(client) => Ok(Self::Connected(client)),
            Err(e) if command == CniCommand::Add => Err(e),
            Err(e) => {
                tracing::warn!(database, endpoint, error = %e, "Database unreachable");
                Ok(Self::Unreachable(UnreachableDb::new(database, &e)))
            }
        }
    }

    /// The client to hand to the orchestrator.
    #[must_use]
    pub fn client(&self) -> &dyn OvsdbClient {
        match self {
            Self::Connected(client) => client,
            Self::Unreachable(db) => db,
        }
    }

    /// Shut a live connection down. Close failures are only logged.
    pub async fn close(&self) {
        if let Self::Connected(client) = self {
            if let Err(e) = client.close().await {
                tracing::warn!(endpoint = %client.endpoint(), error = %e, "Failed to close database connection");
            }
        }
    }
}

/// Run one command.
///
/// Returns the document to print on success (`None` when the command has
/// no output) and the error envelope otherwise. ADD, DEL and CHECK are
/// bounded by the invocation timeout.
///
/// # Errors
///
/// Returns an [`ErrorEnvelope`] describing the failure.
pub async fn execute(
    args: &CniArgs,
    conf: &NetConf,
    services: &Services<'_>,
) -> Result<Option<Value>, ErrorEnvelope> {
    let version = conf.cni_version.as_str();
    if args.command == CniCommand::Version {
        return to_value(version, &VersionResult::default()).map(Some);
    }

    let timeout = conf.timeouts.invocation();
    match tokio::time::timeout(timeout, dispatch(args, conf, services)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ErrorEnvelope::from_error(
            version,
            &CniError::Timeout {
                operation: format!("{:?} of container {}", args.command, args.container_id),
                after: timeout,
            },
        )),
    }
}

async fn dispatch(
    args: &CniArgs,
    conf: &NetConf,
    services: &Services<'_>,
) -> Result<Option<Value>, ErrorEnvelope> {
    let version = conf.cni_version.as_str();
    let envelope = |e: CniError| ErrorEnvelope::from_error(version, &e);

    let identity = workload(args, conf, services).await.map_err(envelope)?;
    let orchestrator = Orchestrator::new(
        conf,
        services.broker,
        services.links,
        services.switch_db,
        services.northbound_db,
    );

    match args.command {
        CniCommand::Add => {
            let request = AttachmentRequest::new(identity, args.netns().map_err(envelope)?, &args.ifname);
            let attachment = orchestrator
                .add(&request)
                .await
                .map_err(|f| ErrorEnvelope::from_attach(version, &f))?;
            let result = AttachmentResult::new(version, &attachment, conf.mtu);
            to_value(version, &result).map(Some)
        }
        CniCommand::Del => {
            orchestrator
                .del(&identity, &args.ifname)
                .await
                .map_err(|f| ErrorEnvelope::from_detach(version, &f))?;
            Ok(None)
        }
        CniCommand::Check => {
            orchestrator
                .check(&identity, &args.ifname)
                .await
                .map_err(envelope)?;
            Ok(None)
        }
        CniCommand::Version => to_value(version, &VersionResult::default()).map(Some),
    }
}

async fn workload(
    args: &CniArgs,
    conf: &NetConf,
    services: &Services<'_>,
) -> CniResult<WorkloadIdentity> {
    let pod = args.pod()?;
    resolve_workload(
        services.metadata,
        &pod.namespace,
        &pod.name,
        &conf.kubernetes.workload_label,
    )
    .await
}

fn to_value<T: serde::Serialize>(version: &str, document: &T) -> Result<Value, ErrorEnvelope> {
    serde_json::to_value(document).map_err(|e| ErrorEnvelope::from_error(version, &CniError::from(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: CniCommand, cni_args: &str) -> CniArgs {
        CniArgs {
            command,
            container_id: "abc".to_string(),
            netns: None,
            ifname: "eth0".to_string(),
            args: cni_args.to_string(),
            path: String::new(),
        }
    }

    #[test]
    fn cni_args_pairs() {
        let pairs = parse_cni_args("IgnoreUnknown=1;K8S_POD_NAMESPACE=team-a;K8S_POD_NAME=web-0").unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs["K8S_POD_NAME"], "web-0");
        assert!(parse_cni_args("").unwrap().is_empty());
        assert!(matches!(parse_cni_args("novalue"), Err(CniError::Config { .. })));
    }

    #[test]
    fn pod_reference() {
        let pod = args(CniCommand::Add, "K8S_POD_NAMESPACE=team-a;K8S_POD_NAME=web-0")
            .pod()
            .unwrap();
        assert_eq!(
            pod,
            PodRef {
                namespace: "team-a".to_string(),
                name: "web-0".to_string()
            }
        );
        assert!(args(CniCommand::Add, "K8S_POD_NAMESPACE=team-a").pod().is_err());
    }

    #[test]
    fn command_names() {
        let parsed = CniArgs::try_parse_from(["ovn-cni", "--command", "DEL"]).unwrap();
        assert_eq!(parsed.command, CniCommand::Del);
        assert_eq!(parsed.ifname, "eth0");
        assert!(CniArgs::try_parse_from(["ovn-cni", "--command", "del"]).is_err());
    }

    #[test]
    fn broker_is_only_built_for_add() {
        let conf = NetConf::default();
        assert!(broker_for(CniCommand::Del, &conf).is_ok());
        assert!(broker_for(CniCommand::Check, &conf).is_ok());
        assert!(matches!(
            broker_for(CniCommand::Add, &conf).err(),
            Some(CniError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_store_only_stops_add() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = format!("unix:{}", dir.path().join("db.sock").display());
        let timeout = Duration::from_secs(1);

        let err = Store::connect(CniCommand::Add, &endpoint, "Open_vSwitch", timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, CniError::Database { .. }));

        let store = Store::connect(CniCommand::Del, &endpoint, "Open_vSwitch", timeout)
            .await
            .unwrap();
        assert!(matches!(store, Store::Unreachable(_)));
        assert_eq!(store.client().database(), "Open_vSwitch");
        assert!(store.client().select("Port", Vec::new()).await.is_err());
        store.close().await;

        let garbled = Store::connect(CniCommand::Del, "ssl:nowhere", "OVN_Northbound", timeout)
            .await
            .unwrap();
        assert!(matches!(garbled, Store::Unreachable(_)));
    }

    #[test]
    fn add_requires_netns() {
        let err = args(CniCommand::Add, "").netns().unwrap_err();
        assert!(matches!(err, CniError::Config { .. }));
    }
}
