//! Plugin-execution engine: invokes CNI plugin binaries over the exec
//! protocol (environment variables plus a JSON config on stdin).

use async_trait::async_trait;
use itertools::Itertools;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::{NetworkConfig, NetworkConfigList, PluginSpec};
use crate::error::{Error, Result};
use crate::types::{PluginResult, RuntimeConf};

/// Boundary to whatever executes plugin chains against a namespace. The
/// manager only depends on this trait; tests substitute their own.
#[async_trait]
pub trait CniDriver: Send + Sync {
    /// Run the chain's plugins in order with CNI_COMMAND=ADD, threading each
    /// reply into the next plugin's `prevResult`. Returns the last reply.
    async fn add_network_list(
        &self,
        network: &NetworkConfig,
        rt: &RuntimeConf,
    ) -> Result<PluginResult>;

    /// Run the chain's plugins in reverse order with CNI_COMMAND=DEL.
    async fn del_network_list(&self, network: &NetworkConfig, rt: &RuntimeConf) -> Result<()>;
}

/// Default driver: executes plugin binaries found on the network's search
/// path as child processes.
#[derive(Default)]
pub struct ExecDriver;

impl ExecDriver {
    pub fn new() -> Self {
        Self
    }

    async fn invoke(
        &self,
        command: &str,
        network: &NetworkConfig,
        rt: &RuntimeConf,
        plugin: &PluginSpec,
        stdin_data: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let exe = find_plugin(&plugin.plugin_type, &network.paths).ok_or_else(|| {
            Error::PluginExec {
                plugin: plugin.plugin_type.clone(),
                code: None,
                message: format!(
                    "failed to find plugin {:?} in paths {:?}",
                    plugin.plugin_type, network.paths
                ),
            }
        })?;

        debug!(
            "Executing {} {} for container {} ifname {}",
            command,
            exe.display(),
            rt.container_id,
            rt.ifname
        );

        let mut child = Command::new(&exe)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &rt.container_id)
            .env("CNI_NETNS", &rt.netns)
            .env("CNI_IFNAME", &rt.ifname)
            .env("CNI_ARGS", cni_args(&rt.args))
            .env("CNI_PATH", cni_path(&network.paths))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&stdin_data).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(plugin_failure(
                &plugin.plugin_type,
                &output.stdout,
                &output.stderr,
            ));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl CniDriver for ExecDriver {
    async fn add_network_list(
        &self,
        network: &NetworkConfig,
        rt: &RuntimeConf,
    ) -> Result<PluginResult> {
        let mut prev: Option<Value> = None;
        for plugin in &network.list.plugins {
            let stdin_data = plugin_stdin(&network.list, plugin, rt, prev.as_ref())?;
            let stdout = self.invoke("ADD", network, rt, plugin, stdin_data).await?;
            let reply: Value = serde_json::from_slice(&stdout).map_err(|e| Error::PluginExec {
                plugin: plugin.plugin_type.clone(),
                code: None,
                message: format!("undecodable plugin result: {}", e),
            })?;
            prev = Some(reply);
        }
        let last = prev.ok_or_else(|| Error::PluginExec {
            plugin: network.name.clone(),
            code: None,
            message: "network has no plugins".to_string(),
        })?;
        serde_json::from_value(last).map_err(|e| Error::PluginExec {
            plugin: network.name.clone(),
            code: None,
            message: format!("undecodable plugin result: {}", e),
        })
    }

    async fn del_network_list(&self, network: &NetworkConfig, rt: &RuntimeConf) -> Result<()> {
        for plugin in network.list.plugins.iter().rev() {
            let stdin_data = plugin_stdin(&network.list, plugin, rt, None)?;
            self.invoke("DEL", network, rt, plugin, stdin_data).await?;
        }
        Ok(())
    }
}

/// First `<dir>/<plugin_type>` that exists across the search path.
fn find_plugin(plugin_type: &str, paths: &[PathBuf]) -> Option<PathBuf> {
    paths
        .iter()
        .map(|dir| dir.join(plugin_type))
        .find(|candidate| candidate.is_file())
}

/// `;`-joined `K=V` pairs for CNI_ARGS.
fn cni_args(args: &[(String, String)]) -> String {
    args.iter().map(|(k, v)| format!("{}={}", k, v)).join(";")
}

/// `:`-joined search path for CNI_PATH.
fn cni_path(paths: &[PathBuf]) -> String {
    paths.iter().map(|p| p.display().to_string()).join(":")
}

/// Build the JSON one plugin reads from stdin: its original config object
/// with `name` and `cniVersion` injected from the list, `prevResult` from
/// the preceding plugin (ADD chains only), and `runtimeConfig` for each
/// capability the plugin declares that the runtime supplies.
fn plugin_stdin(
    list: &NetworkConfigList,
    plugin: &PluginSpec,
    rt: &RuntimeConf,
    prev: Option<&Value>,
) -> Result<Vec<u8>> {
    let mut conf = plugin.raw.clone();
    conf.insert("name".to_string(), Value::String(list.name.clone()));
    conf.insert(
        "cniVersion".to_string(),
        Value::String(list.cni_version.clone()),
    );
    if let Some(prev) = prev {
        conf.insert("prevResult".to_string(), prev.clone());
    }

    let mut runtime_config = Map::new();
    if let Some(Value::Object(capabilities)) = plugin.raw.get("capabilities") {
        for (capability, enabled) in capabilities {
            if enabled.as_bool() != Some(true) {
                continue;
            }
            if capability == "portMappings" && !rt.port_mappings.is_empty() {
                let mappings =
                    serde_json::to_value(&rt.port_mappings).map_err(|e| Error::PluginExec {
                        plugin: plugin.plugin_type.clone(),
                        code: None,
                        message: format!("cannot encode port mappings: {}", e),
                    })?;
                runtime_config.insert(capability.clone(), mappings);
            }
        }
    }
    if !runtime_config.is_empty() {
        conf.insert("runtimeConfig".to_string(), Value::Object(runtime_config));
    }

    serde_json::to_vec(&Value::Object(conf)).map_err(|e| Error::PluginExec {
        plugin: plugin.plugin_type.clone(),
        code: None,
        message: format!("cannot encode plugin config: {}", e),
    })
}

/// Error object a plugin prints on stdout when it fails.
#[derive(Debug, Deserialize)]
struct CniErrorMsg {
    code: Option<u64>,
    msg: Option<String>,
    details: Option<String>,
}

/// Turn a failed plugin invocation into a PluginExec error, preferring the
/// structured CNI error object on stdout over raw stderr.
fn plugin_failure(plugin_type: &str, stdout: &[u8], stderr: &[u8]) -> Error {
    if let Ok(decoded) = serde_json::from_slice::<CniErrorMsg>(stdout) {
        if decoded.code.is_some() || decoded.msg.is_some() {
            let mut message = decoded.msg.unwrap_or_default();
            if let Some(details) = decoded.details.filter(|d| !d.is_empty()) {
                if message.is_empty() {
                    message = details;
                } else {
                    message = format!("{}; {}", message, details);
                }
            }
            return Error::PluginExec {
                plugin: plugin_type.to_string(),
                code: decoded.code,
                message,
            };
        }
    }
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    let message = if stderr.is_empty() {
        "plugin exited abnormally".to_string()
    } else {
        stderr
    };
    Error::PluginExec {
        plugin: plugin_type.to_string(),
        code: None,
        message,
    }
}
