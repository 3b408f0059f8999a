//! Pod descriptors and CNI result types.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Everything the manager needs to know about one pod sandbox.
///
/// `networks` lists the networks to attach, in order; when empty the
/// manager falls back to the current default network.
#[derive(Debug, Clone, Default)]
pub struct PodNetwork {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Infra container ID
    pub id: String,
    /// Network namespace path
    pub netns: String,
    /// Explicit network names, in attach order (may be empty)
    pub networks: Vec<String>,
    /// Port mappings forwarded to plugins that declare the capability
    pub port_mappings: Vec<PortMapping>,
}

/// One host-to-container port mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host
    #[serde(rename = "hostPort")]
    pub host_port: u16,
    /// Port inside the pod
    #[serde(rename = "containerPort")]
    pub container_port: u16,
    /// "tcp" or "udp"
    pub protocol: String,
    /// Host IP to bind, if any
    #[serde(rename = "hostIP", skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

/// Interface descriptor from a CNI result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Interface name
    pub name: String,
    /// Hardware address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Network namespace path for sandbox-side interfaces; `None` for
    /// host-side interfaces (bridges, veth peers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP assignment from a CNI result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    /// "4" or "6"
    #[serde(default)]
    pub version: String,
    /// Index into the result's interface list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// Address with prefix length
    pub address: IpNetwork,
    /// Gateway, if the plugin configured one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

/// Result decoded from a plugin's stdout (CNI 0.3.x wire format).
///
/// All fields are optional on the wire; old plugins (loopback speaks
/// 0.2.0) may reply with an empty object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginResult {
    /// CNI specification version
    #[serde(rename = "cniVersion", default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,
    /// Interfaces created
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<NetworkInterface>,
    /// IP configurations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,
}

/// Per-network outcome returned to the caller by SetUp and Status.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkResult {
    /// Network name the result belongs to
    pub network: String,
    /// Interfaces, in plugin order
    pub interfaces: Vec<NetworkInterface>,
    /// IP configs, each pointing at its owning interface by index
    pub ips: Vec<IpConfig>,
}

impl NetworkResult {
    /// Tag a decoded plugin result with the network it came from.
    pub fn from_plugin(network: impl Into<String>, result: PluginResult) -> Self {
        Self {
            network: network.into(),
            interfaces: result.interfaces,
            ips: result.ips,
        }
    }
}

/// Runtime parameters for one plugin invocation against one pod.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConf {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name to create inside the pod
    pub ifname: String,
    /// CNI_ARGS key/value pairs, in order
    pub args: Vec<(String, String)>,
    /// Port mappings for the `portMappings` capability (may be empty)
    pub port_mappings: Vec<PortMapping>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_result_decodes_minimal_reply() {
        // loopback replies with next to nothing
        let result: PluginResult = serde_json::from_str("{}").unwrap();
        assert!(result.interfaces.is_empty());
        assert!(result.ips.is_empty());
    }

    #[test]
    fn plugin_result_decodes_full_reply() {
        let raw = r#"{
            "cniVersion": "0.3.1",
            "interfaces": [
                {"name": "cni0", "mac": "0a:58:0a:01:00:01"},
                {"name": "eth0", "mac": "0a:58:0a:01:00:05", "sandbox": "/var/run/netns/pod"}
            ],
            "ips": [
                {"version": "4", "interface": 1, "address": "10.1.0.5/16", "gateway": "10.1.0.1"}
            ]
        }"#;
        let result: PluginResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.interfaces.len(), 2);
        assert_eq!(result.interfaces[0].sandbox, None);
        assert_eq!(
            result.interfaces[1].sandbox.as_deref(),
            Some("/var/run/netns/pod")
        );
        assert_eq!(result.ips[0].interface, Some(1));
        assert_eq!(result.ips[0].address.to_string(), "10.1.0.5/16");
    }

    #[test]
    fn port_mapping_serializes_camel_case() {
        let pm = PortMapping {
            host_port: 8080,
            container_port: 80,
            protocol: "tcp".to_string(),
            host_ip: None,
        };
        let json = serde_json::to_string(&pm).unwrap();
        assert_eq!(json, r#"{"hostPort":8080,"containerPort":80,"protocol":"tcp"}"#);
    }
}
