//! The plugin manager: resolves pod requests against the current registry
//! and drives attach/detach/status through the plugin-execution engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::{self, NetworkConfig, Registry, DEFAULT_BIN_DIR, DEFAULT_NET_DIR};
use crate::error::{Error, Result};
use crate::exec::{CniDriver, ExecDriver};
use crate::locks::PodLockTable;
use crate::monitor;
use crate::netns::{NetnsInspector, NsenterInspector};
use crate::types::{IpConfig, NetworkInterface, NetworkResult, PodNetwork, RuntimeConf};

/// Stable identifier this plugin reports to the runtime.
pub const CNI_PLUGIN_NAME: &str = "cni";

/// Interface name for the requested network at `index`: "eth0", "eth1", ...
/// Positions start at zero for the first requested network; loopback does
/// not count.
pub fn interface_name(index: usize) -> String {
    format!("eth{}", index)
}

/// Lock-table key for a pod. Namespace and name are joined with a fixed
/// separator, so distinct pods whose components contain '_' can share a
/// key; that only over-serializes them, it is never unsound.
fn pod_key(pod: &PodNetwork) -> String {
    format!("{}_{}", pod.namespace, pod.name)
}

/// Attaches, detaches, and reports on pod networks.
///
/// One operation per pod runs at a time; operations for distinct pods run
/// in parallel. The registry of named networks is reloaded from the config
/// directory by [`resync`](Self::resync) and, while no default network is
/// resolvable, by a background directory watcher.
pub struct PluginManager {
    lo_network: NetworkConfig,
    registry: RwLock<Registry>,
    conf_dir: PathBuf,
    bin_dirs: Vec<PathBuf>,
    vendor_prefix: String,
    driver: Box<dyn CniDriver>,
    inspector: Box<dyn NetnsInspector>,
    pod_locks: PodLockTable,
}

impl PluginManager {
    /// Build a manager over the default exec driver and nsenter inspector.
    ///
    /// `conf_dir` and `bin_dirs` fall back to `/etc/cni/net.d` and
    /// `/opt/cni/bin`. Fails when the config directory does not exist (the
    /// watcher could not watch it) or `nsenter` is not on PATH. When the
    /// initial load yields no usable network the manager still comes up —
    /// with a watcher on the directory — and requests fail until valid
    /// configs appear.
    pub fn init(
        default_network: Option<String>,
        conf_dir: Option<PathBuf>,
        bin_dirs: Vec<PathBuf>,
    ) -> Result<Arc<Self>> {
        let inspector = NsenterInspector::new()?;
        Self::init_with(
            default_network,
            conf_dir,
            bin_dirs,
            Box::new(ExecDriver::new()),
            Box::new(inspector),
        )
    }

    /// Same construction path as [`init`](Self::init), with the engine and
    /// inspector supplied by the caller.
    pub fn init_with(
        default_network: Option<String>,
        conf_dir: Option<PathBuf>,
        bin_dirs: Vec<PathBuf>,
        driver: Box<dyn CniDriver>,
        inspector: Box<dyn NetnsInspector>,
    ) -> Result<Arc<Self>> {
        let conf_dir = conf_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_NET_DIR));
        let bin_dirs = if bin_dirs.is_empty() {
            vec![PathBuf::from(DEFAULT_BIN_DIR)]
        } else {
            bin_dirs
        };
        let vendor_prefix = String::new();

        // The directory watcher cannot watch a missing directory.
        std::fs::metadata(&conf_dir)?;

        let mut registry = Registry {
            networks: HashMap::new(),
            default_name: default_network.filter(|name| !name.is_empty()),
        };
        let loaded = match config::load_networks(&conf_dir, &bin_dirs, &vendor_prefix) {
            Ok((networks, scanned_default)) => {
                if registry.default_name.is_none() {
                    registry.default_name = Some(scanned_default);
                }
                registry.networks = networks;
                true
            }
            Err(e) => {
                error!("Error loading CNI networks: {}", e);
                false
            }
        };

        let plugin = Arc::new(Self {
            lo_network: config::lo_network(&bin_dirs, &vendor_prefix),
            registry: RwLock::new(registry),
            conf_dir,
            bin_dirs,
            vendor_prefix,
            driver,
            inspector,
            pod_locks: PodLockTable::new(),
        });

        if !loaded {
            // No usable default network yet; watch the directory until one
            // shows up. Requests fail in the meantime.
            tokio::spawn(monitor::monitor_conf_dir(
                Arc::downgrade(&plugin),
                plugin.conf_dir.clone(),
            ));
        }

        Ok(plugin)
    }

    /// Stable plugin identifier.
    pub fn plugin_name(&self) -> &'static str {
        CNI_PLUGIN_NAME
    }

    /// Reload the config directory and swap the registry wholesale under
    /// the write lock. The first default name ever established is sticky;
    /// reloads update the network set but never override it.
    pub async fn resync(&self) -> Result<()> {
        let (networks, scanned_default) =
            config::load_networks(&self.conf_dir, &self.bin_dirs, &self.vendor_prefix)?;
        let mut registry = self.registry.write().await;
        if registry.default_name.is_none() {
            registry.default_name = Some(scanned_default);
        }
        registry.networks = networks;
        Ok(())
    }

    /// Snapshot of the named network, or NetworkNotFound.
    pub async fn network(&self, name: &str) -> Result<NetworkConfig> {
        let registry = self.registry.read().await;
        registry
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NetworkNotFound(name.to_string()))
    }

    /// Current default network name, if one was ever established.
    pub async fn default_network_name(&self) -> Option<String> {
        self.registry.read().await.default_name.clone()
    }

    pub(crate) async fn default_network(&self) -> Option<NetworkConfig> {
        let name = self.default_network_name().await?;
        self.network(&name).await.ok()
    }

    async fn check_initialized(&self, pod: &PodNetwork) -> Result<()> {
        if pod.networks.is_empty() && self.default_network().await.is_none() {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    /// NotInitialized unless some network is resolvable.
    pub async fn status(&self) -> Result<()> {
        self.check_initialized(&PodNetwork::default()).await
    }

    /// The network names this request resolves to: the explicit list
    /// verbatim, or a single-element list holding the default name.
    async fn resolved_networks(&self, pod: &PodNetwork) -> Vec<String> {
        if !pod.networks.is_empty() {
            pod.networks.clone()
        } else {
            vec![self.default_network_name().await.unwrap_or_default()]
        }
    }

    /// Attach the pod to loopback and then to each resolved network in
    /// order, with interface names assigned by position.
    ///
    /// The first failure aborts the call. Networks attached before the
    /// failure stay attached: there is no automatic rollback, and cleanup
    /// is the caller's responsibility (via [`tear_down_pod`]).
    ///
    /// Returns one result per requested network, in request order; the
    /// loopback attach is not reported.
    ///
    /// [`tear_down_pod`]: Self::tear_down_pod
    pub async fn set_up_pod(&self, pod: &PodNetwork) -> Result<Vec<NetworkResult>> {
        self.check_initialized(pod).await?;

        let key = pod_key(pod);
        let _guard = self.pod_locks.lock(&key).await;

        let rt = build_runtime_conf(pod, "lo");
        info!(
            "About to add CNI network {} (type={})",
            self.lo_network.list.name,
            plugin_chain_type(&self.lo_network)
        );
        if let Err(e) = self.driver.add_network_list(&self.lo_network, &rt).await {
            error!("Error while adding to cni lo network: {}", e);
            return Err(e);
        }

        let mut results = Vec::new();
        for (i, name) in self.resolved_networks(pod).await.iter().enumerate() {
            let ifname = interface_name(i);
            let network = match self.network(name).await {
                Ok(network) => network,
                Err(e) => {
                    error!("{}", e);
                    return Err(e);
                }
            };
            let rt = build_runtime_conf(pod, &ifname);
            info!(
                "About to add CNI network {} (type={})",
                network.name,
                plugin_chain_type(&network)
            );
            match self.driver.add_network_list(&network, &rt).await {
                Ok(result) => results.push(NetworkResult::from_plugin(network.name.clone(), result)),
                Err(e) => {
                    error!("Error while adding pod to CNI network {:?}: {}", network.name, e);
                    return Err(e);
                }
            }
        }

        Ok(results)
    }

    /// Detach each resolved network in order, using the same resolution and
    /// positional naming as [`set_up_pod`](Self::set_up_pod). Loopback is
    /// never touched. The first failure aborts; there is no retry and no
    /// partial-state repair.
    pub async fn tear_down_pod(&self, pod: &PodNetwork) -> Result<()> {
        self.check_initialized(pod).await?;

        let key = pod_key(pod);
        let _guard = self.pod_locks.lock(&key).await;

        for (i, name) in self.resolved_networks(pod).await.iter().enumerate() {
            let ifname = interface_name(i);
            let network = match self.network(name).await {
                Ok(network) => network,
                Err(e) => {
                    error!("{}", e);
                    return Err(e);
                }
            };
            let rt = build_runtime_conf(pod, &ifname);
            info!(
                "About to del CNI network {} (type={})",
                network.name,
                plugin_chain_type(&network)
            );
            if let Err(e) = self.driver.del_network_list(&network, &rt).await {
                error!(
                    "Error while removing pod from CNI network {:?}: {}",
                    network.name, e
                );
                return Err(e);
            }
        }

        Ok(())
    }

    /// Current IPv4 addressing and hardware address for each resolved
    /// network's interface inside the pod's namespace. Any per-network
    /// inspection failure aborts the call.
    pub async fn pod_network_status(&self, pod: &PodNetwork) -> Result<Vec<NetworkResult>> {
        let key = pod_key(pod);
        let _guard = self.pod_locks.lock(&key).await;

        let mut results = Vec::new();
        for (i, name) in self.resolved_networks(pod).await.iter().enumerate() {
            let ifname = interface_name(i);
            // The name must still resolve, even though only the namespace
            // is queried.
            let network = match self.network(name).await {
                Ok(network) => network,
                Err(e) => {
                    error!("{}", e);
                    return Err(e);
                }
            };
            let details = self
                .inspector
                .interface_details(&pod.netns, &ifname)
                .await?;
            results.push(NetworkResult {
                network: network.name,
                interfaces: vec![NetworkInterface {
                    name: ifname,
                    mac: Some(details.mac),
                    sandbox: Some(pod.netns.clone()),
                }],
                ips: vec![IpConfig {
                    version: "4".to_string(),
                    interface: Some(0),
                    address: details.address,
                    gateway: None,
                }],
            });
        }

        Ok(results)
    }

    /// The per-pod lock table, exposed for observability.
    pub fn pod_locks(&self) -> &PodLockTable {
        &self.pod_locks
    }
}

fn plugin_chain_type(network: &NetworkConfig) -> &str {
    network
        .list
        .plugins
        .first()
        .map(|p| p.plugin_type.as_str())
        .unwrap_or("?")
}

/// Runtime parameters identifying the pod to the plugins.
fn build_runtime_conf(pod: &PodNetwork, ifname: &str) -> RuntimeConf {
    RuntimeConf {
        container_id: pod.id.clone(),
        netns: pod.netns.clone(),
        ifname: ifname.to_string(),
        args: vec![
            ("IgnoreUnknown".to_string(), "1".to_string()),
            ("K8S_POD_NAMESPACE".to_string(), pod.namespace.clone()),
            ("K8S_POD_NAME".to_string(), pod.name.clone()),
            ("K8S_POD_INFRA_CONTAINER_ID".to_string(), pod.id.clone()),
        ],
        port_mappings: pod.port_mappings.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortMapping;

    #[test]
    fn interface_names_are_positional() {
        assert_eq!(interface_name(0), "eth0");
        assert_eq!(interface_name(1), "eth1");
        assert_eq!(interface_name(12), "eth12");
    }

    #[test]
    fn pod_key_joins_namespace_and_name() {
        let pod = PodNetwork {
            namespace: "kube-system".to_string(),
            name: "dns".to_string(),
            ..Default::default()
        };
        assert_eq!(pod_key(&pod), "kube-system_dns");
    }

    #[test]
    fn runtime_conf_carries_pod_identity() {
        let pod = PodNetwork {
            namespace: "default".to_string(),
            name: "web".to_string(),
            id: "ctr-1".to_string(),
            netns: "/var/run/netns/pod".to_string(),
            networks: Vec::new(),
            port_mappings: vec![PortMapping {
                host_port: 8080,
                container_port: 80,
                protocol: "tcp".to_string(),
                host_ip: None,
            }],
        };
        let rt = build_runtime_conf(&pod, "eth0");
        assert_eq!(rt.container_id, "ctr-1");
        assert_eq!(rt.netns, "/var/run/netns/pod");
        assert_eq!(rt.ifname, "eth0");
        assert_eq!(
            rt.args,
            vec![
                ("IgnoreUnknown".to_string(), "1".to_string()),
                ("K8S_POD_NAMESPACE".to_string(), "default".to_string()),
                ("K8S_POD_NAME".to_string(), "web".to_string()),
                ("K8S_POD_INFRA_CONTAINER_ID".to_string(), "ctr-1".to_string()),
            ]
        );
        assert_eq!(rt.port_mappings.len(), 1);
    }
}
