//! Network config discovery: scans a directory of CNI config files into a
//! name-indexed registry and builds per-network plugin search paths.

use itertools::Itertools;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Default CNI config directory
pub const DEFAULT_NET_DIR: &str = "/etc/cni/net.d";
/// Default CNI plugin binary directory
pub const DEFAULT_BIN_DIR: &str = "/opt/cni/bin";

/// File extensions recognized as CNI configs
const CONF_EXTENSIONS: [&str; 3] = ["conf", "conflist", "json"];

/// Embedded config for the always-on loopback network
const LO_CONFIG: &str = r#"{
  "cniVersion": "0.2.0",
  "name": "cni-loopback",
  "plugins": [{
    "type": "loopback"
  }]
}"#;

/// One plugin entry from a config file. `raw` keeps the plugin's complete
/// original JSON object so unknown fields survive the trip to the binary.
#[derive(Debug, Clone)]
pub struct PluginSpec {
    /// Plugin type; doubles as the binary name
    pub plugin_type: String,
    /// The plugin's full config object, including `type`
    pub raw: Map<String, Value>,
}

impl PluginSpec {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "plugin entry is not a JSON object".to_string())?;
        let plugin_type = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if plugin_type.is_empty() {
            return Err("no 'type' field".to_string());
        }
        Ok(Self {
            plugin_type,
            raw: obj.clone(),
        })
    }
}

/// Ordered plugin chain making up one attachable network.
#[derive(Debug, Clone)]
pub struct NetworkConfigList {
    /// CNI specification version
    pub cni_version: String,
    /// Network name; defaulted to the file stem when the config omits it
    pub name: String,
    /// Plugins, in invocation order (never empty once loaded)
    pub plugins: Vec<PluginSpec>,
}

/// A named network plus the search path its plugin binaries resolve against.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Network name (registry key)
    pub name: String,
    /// The plugin chain
    pub list: NetworkConfigList,
    /// Binary dirs: caller-supplied base dirs plus one vendor dir per
    /// plugin type
    pub paths: Vec<PathBuf>,
}

/// Name-indexed view of the config directory. Replaced wholesale on every
/// successful resync; never mutated field-by-field while readers can see it.
#[derive(Debug, Default)]
pub struct Registry {
    /// Networks by name
    pub networks: HashMap<String, NetworkConfig>,
    /// Sticky default network name: set once (constructor argument or first
    /// successful load) and never overridden by later reloads
    pub default_name: Option<String>,
}

/// Parse a `.conflist` file: a named, ordered list of plugins.
fn conf_list_from_bytes(bytes: &[u8]) -> std::result::Result<NetworkConfigList, String> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let obj = value
        .as_object()
        .ok_or_else(|| "config is not a JSON object".to_string())?;
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let cni_version = obj
        .get("cniVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let plugins = obj
        .get("plugins")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(PluginSpec::from_value)
                .collect::<std::result::Result<Vec<_>, String>>()
        })
        .unwrap_or_else(|| Ok(Vec::new()))?;
    Ok(NetworkConfigList {
        cni_version,
        name,
        plugins,
    })
}

/// Parse a single-plugin `.conf`/`.json` file and wrap it into a
/// one-element list. Fails when the file declares no plugin type.
fn conf_from_bytes(bytes: &[u8]) -> std::result::Result<NetworkConfigList, String> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let plugin = PluginSpec::from_value(&value)
        .map_err(|_| "no 'type'; perhaps this is a .conflist?".to_string())?;
    let name = plugin
        .raw
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let cni_version = plugin
        .raw
        .get("cniVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(NetworkConfigList {
        cni_version,
        name,
        plugins: vec![plugin],
    })
}

/// Vendor binary dir for one plugin type: `{prefix}/opt/{type}/bin`.
fn vendor_dir(prefix: &str, plugin_type: &str) -> PathBuf {
    PathBuf::from(format!("{}/opt/{}/bin", prefix, plugin_type))
}

fn search_paths(bin_dirs: &[PathBuf], vendor_prefix: &str, list: &NetworkConfigList) -> Vec<PathBuf> {
    let mut paths = bin_dirs.to_vec();
    for plugin in &list.plugins {
        paths.push(vendor_dir(vendor_prefix, &plugin.plugin_type));
    }
    paths
}

/// Config files in `dir` with a recognized extension, sorted
/// lexicographically. The sort order is the tie-break for default-network
/// selection: first valid file wins.
fn conf_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::Config {
        dir: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    let files = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| CONF_EXTENSIONS.contains(&ext))
                .unwrap_or(false)
        })
        .sorted()
        .collect();
    Ok(files)
}

/// Scan `conf_dir` into a registry map. Invalid files are logged and
/// skipped; only zero usable networks is an error. Returns the map and the
/// name of the first valid file's network, the default-network candidate.
pub fn load_networks(
    conf_dir: &Path,
    bin_dirs: &[PathBuf],
    vendor_prefix: &str,
) -> Result<(HashMap<String, NetworkConfig>, String)> {
    let files = conf_files(conf_dir)?;
    if files.is_empty() {
        return Err(Error::Config {
            dir: conf_dir.to_path_buf(),
            reason: "no network config files found".to_string(),
        });
    }

    let mut networks = HashMap::new();
    let mut default_name = String::new();

    for file in files {
        let bytes = match fs::read(&file) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Error reading CNI config file {}: {}", file.display(), e);
                continue;
            }
        };
        let is_list = file.extension().and_then(|e| e.to_str()) == Some("conflist");
        let parsed = if is_list {
            conf_list_from_bytes(&bytes)
        } else {
            conf_from_bytes(&bytes)
        };
        let mut list = match parsed {
            Ok(list) => list,
            Err(reason) => {
                warn!("Error loading CNI config file {}: {}", file.display(), reason);
                continue;
            }
        };
        if list.plugins.is_empty() {
            warn!("CNI config list {} has no plugins, skipping", file.display());
            continue;
        }
        if list.name.is_empty() {
            list.name = file
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
        }

        info!(
            "Found CNI network {} (type={}) at {}",
            list.name, list.plugins[0].plugin_type, file.display()
        );

        let paths = search_paths(bin_dirs, vendor_prefix, &list);
        if default_name.is_empty() {
            default_name = list.name.clone();
        }
        let name = list.name.clone();
        networks.insert(name.clone(), NetworkConfig { name, list, paths });
    }

    if networks.is_empty() {
        return Err(Error::Config {
            dir: conf_dir.to_path_buf(),
            reason: "no valid networks found".to_string(),
        });
    }

    Ok((networks, default_name))
}

/// The always-present loopback pseudo-network, independent of whatever the
/// config directory holds. Named "lo" in the manager, "cni-loopback" on the
/// wire; never enumerable through the registry.
pub fn lo_network(bin_dirs: &[PathBuf], vendor_prefix: &str) -> NetworkConfig {
    let list = conf_list_from_bytes(LO_CONFIG.as_bytes())
        .expect("embedded loopback config is valid");
    let paths = search_paths(bin_dirs, vendor_prefix, &list);
    NetworkConfig {
        name: "lo".to_string(),
        list,
        paths,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NET_A: &str = r#"{
        "cniVersion": "0.3.1",
        "name": "net-a",
        "plugins": [{"type": "bridge", "bridge": "cni0"}, {"type": "portmap", "capabilities": {"portMappings": true}}]
    }"#;
    const BRIDGE_CONF: &str = r#"{"cniVersion": "0.3.1", "type": "bridge", "bridge": "cni0"}"#;

    fn bin_dirs() -> Vec<PathBuf> {
        vec![PathBuf::from("/opt/cni/bin")]
    }

    #[test]
    fn load_skips_invalid_files_and_defaults_names() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.conflist"), NET_A).unwrap();
        fs::write(dir.path().join("b.conf"), BRIDGE_CONF).unwrap();
        fs::write(dir.path().join("c.conflist"), "{not json").unwrap();

        let (networks, default_name) = load_networks(dir.path(), &bin_dirs(), "").unwrap();
        assert_eq!(networks.len(), 2);
        assert!(networks.contains_key("net-a"));
        // name defaulted from the file stem
        assert!(networks.contains_key("b"));
        assert_eq!(default_name, "net-a");
    }

    #[test]
    fn empty_directory_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let err = load_networks(dir.path(), &bin_dirs(), "").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn missing_directory_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("nope");
        let err = load_networks(&gone, &bin_dirs(), "").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn all_files_rejected_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.conf"), r#"{"name": "no-type"}"#).unwrap();
        fs::write(dir.path().join("b.conflist"), r#"{"name": "empty", "plugins": []}"#).unwrap();
        let err = load_networks(dir.path(), &bin_dirs(), "").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn unrecognized_extensions_are_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("README.md"), "not a config").unwrap();
        fs::write(dir.path().join("a.conflist"), NET_A).unwrap();
        let (networks, _) = load_networks(dir.path(), &bin_dirs(), "").unwrap();
        assert_eq!(networks.len(), 1);
    }

    #[test]
    fn default_network_is_first_file_lexicographically() {
        let dir = TempDir::new().unwrap();
        let net = |name: &str| {
            format!(r#"{{"cniVersion": "0.3.1", "name": "{}", "plugins": [{{"type": "bridge"}}]}}"#, name)
        };
        fs::write(dir.path().join("20-b.conflist"), net("net-b")).unwrap();
        fs::write(dir.path().join("10-a.conflist"), net("net-a")).unwrap();
        let (_, default_name) = load_networks(dir.path(), &bin_dirs(), "").unwrap();
        assert_eq!(default_name, "net-a");
    }

    #[test]
    fn vendor_dirs_are_appended_per_plugin_type() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.conflist"), NET_A).unwrap();
        let (networks, _) = load_networks(dir.path(), &bin_dirs(), "").unwrap();
        let paths = &networks["net-a"].paths;
        assert_eq!(
            paths,
            &[
                PathBuf::from("/opt/cni/bin"),
                PathBuf::from("/opt/bridge/bin"),
                PathBuf::from("/opt/portmap/bin"),
            ]
        );
    }

    #[test]
    fn reload_of_unchanged_directory_is_stable() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.conflist"), NET_A).unwrap();
        fs::write(dir.path().join("b.conf"), BRIDGE_CONF).unwrap();

        let (first, first_default) = load_networks(dir.path(), &bin_dirs(), "").unwrap();
        let (second, second_default) = load_networks(dir.path(), &bin_dirs(), "").unwrap();

        assert_eq!(first_default, second_default);
        assert_eq!(
            first.keys().sorted().collect::<Vec<_>>(),
            second.keys().sorted().collect::<Vec<_>>()
        );
        for (name, network) in &first {
            let types: Vec<_> = network.list.plugins.iter().map(|p| &p.plugin_type).collect();
            let other: Vec<_> = second[name].list.plugins.iter().map(|p| &p.plugin_type).collect();
            assert_eq!(types, other);
        }
    }

    #[test]
    fn loopback_network_is_constant() {
        let lo = lo_network(&bin_dirs(), "");
        assert_eq!(lo.name, "lo");
        assert_eq!(lo.list.name, "cni-loopback");
        assert_eq!(lo.list.cni_version, "0.2.0");
        assert_eq!(lo.list.plugins.len(), 1);
        assert_eq!(lo.list.plugins[0].plugin_type, "loopback");
        assert!(lo.paths.contains(&PathBuf::from("/opt/loopback/bin")));
    }
}
