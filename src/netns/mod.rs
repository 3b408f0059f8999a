//! Namespace inspector: reads the current addressing of an interface inside
//! a pod's network namespace, for status queries.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use tokio::process::Command;

use crate::error::{Error, Result};

/// What a status query needs from one interface.
#[derive(Debug, Clone)]
pub struct InterfaceDetails {
    /// Hardware address
    pub mac: String,
    /// Global IPv4 address with prefix length
    pub address: IpNetwork,
}

/// Boundary to whatever can look inside a pod's network namespace.
#[async_trait]
pub trait NetnsInspector: Send + Sync {
    /// IPv4 address and MAC of `ifname` inside `netns`.
    async fn interface_details(&self, netns: &str, ifname: &str) -> Result<InterfaceDetails>;
}

/// Default inspector: enters the namespace with `nsenter` and parses the
/// JSON output of `ip addr show`.
pub struct NsenterInspector {
    nsenter: PathBuf,
}

impl NsenterInspector {
    /// Resolves `nsenter` on PATH once, up front, so a missing binary fails
    /// at init time instead of on the first status query.
    pub fn new() -> Result<Self> {
        let nsenter = lookup_path("nsenter").ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "nsenter not found in PATH",
            ))
        })?;
        Ok(Self { nsenter })
    }
}

#[async_trait]
impl NetnsInspector for NsenterInspector {
    async fn interface_details(&self, netns: &str, ifname: &str) -> Result<InterfaceDetails> {
        let output = Command::new(&self.nsenter)
            .arg(format!("--net={}", netns))
            .arg("-F")
            .arg("--")
            .args(["ip", "-j", "addr", "show", "dev", ifname])
            .output()
            .await
            .map_err(|e| inspection(netns, ifname, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(inspection(netns, ifname, stderr));
        }
        parse_interface_details(netns, ifname, &output.stdout)
    }
}

fn lookup_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

fn inspection(netns: &str, ifname: &str, reason: impl Into<String>) -> Error {
    Error::Inspection {
        netns: netns.to_string(),
        ifname: ifname.to_string(),
        reason: reason.into(),
    }
}

/// One link from `ip -j addr show`.
#[derive(Debug, Deserialize)]
struct LinkAddr {
    /// Hardware address
    address: Option<String>,
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    #[serde(default)]
    family: String,
    #[serde(default)]
    scope: String,
    local: Option<String>,
    prefixlen: Option<u8>,
}

fn parse_interface_details(netns: &str, ifname: &str, stdout: &[u8]) -> Result<InterfaceDetails> {
    let links: Vec<LinkAddr> = serde_json::from_slice(stdout)
        .map_err(|e| inspection(netns, ifname, format!("undecodable ip output: {}", e)))?;
    let link = links
        .into_iter()
        .next()
        .ok_or_else(|| inspection(netns, ifname, "interface not found"))?;
    let mac = link
        .address
        .ok_or_else(|| inspection(netns, ifname, "interface has no hardware address"))?;
    let v4 = link
        .addr_info
        .into_iter()
        .find(|info| info.family == "inet" && info.scope == "global")
        .ok_or_else(|| inspection(netns, ifname, "no global IPv4 address"))?;
    let (local, prefixlen) = match (v4.local, v4.prefixlen) {
        (Some(local), Some(prefixlen)) => (local, prefixlen),
        _ => return Err(inspection(netns, ifname, "incomplete address entry")),
    };
    let address: IpNetwork = format!("{}/{}", local, prefixlen)
        .parse()
        .map_err(|e| inspection(netns, ifname, format!("bad address: {}", e)))?;
    Ok(InterfaceDetails { mac, address })
}
