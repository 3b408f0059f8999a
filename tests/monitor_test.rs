//! Hot reload: a manager that came up without a usable default network
//! must pick one up when config files appear in the watched directory.

use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use podcni::config::NetworkConfig;
use podcni::exec::CniDriver;
use podcni::netns::{InterfaceDetails, NetnsInspector};
use podcni::types::{PluginResult, RuntimeConf};
use podcni::{Error, PluginManager, PodNetwork};

struct NoopDriver;

#[async_trait]
impl CniDriver for NoopDriver {
    async fn add_network_list(
        &self,
        _network: &NetworkConfig,
        _rt: &RuntimeConf,
    ) -> podcni::Result<PluginResult> {
        Ok(PluginResult::default())
    }

    async fn del_network_list(
        &self,
        _network: &NetworkConfig,
        _rt: &RuntimeConf,
    ) -> podcni::Result<()> {
        Ok(())
    }
}

struct NoopInspector;

#[async_trait]
impl NetnsInspector for NoopInspector {
    async fn interface_details(&self, netns: &str, ifname: &str) -> podcni::Result<InterfaceDetails> {
        Err(Error::Inspection {
            netns: netns.to_string(),
            ifname: ifname.to_string(),
            reason: "not implemented".to_string(),
        })
    }
}

#[tokio::test]
async fn config_appearing_later_establishes_the_default_network() {
    let dir = TempDir::new().unwrap();
    let plugin = PluginManager::init_with(
        None,
        Some(dir.path().to_path_buf()),
        vec![PathBuf::from("/opt/cni/bin")],
        Box::new(NoopDriver),
        Box::new(NoopInspector),
    )
    .unwrap();

    let pod = PodNetwork {
        namespace: "default".to_string(),
        name: "web".to_string(),
        id: "ctr-1".to_string(),
        netns: "/var/run/netns/web".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        plugin.set_up_pod(&pod).await,
        Err(Error::NotInitialized)
    ));

    fs::write(
        dir.path().join("a.conflist"),
        r#"{"cniVersion": "0.3.1", "name": "net-a", "plugins": [{"type": "bridge"}]}"#,
    )
    .unwrap();

    // The watcher resyncs on the create event; give it a generous deadline.
    let deadline = Instant::now() + Duration::from_secs(10);
    while plugin.default_network_name().await.is_none() {
        assert!(
            Instant::now() < deadline,
            "watcher never picked up the new config"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(plugin.default_network_name().await.as_deref(), Some("net-a"));
    let results = plugin.set_up_pod(&pod).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].network, "net-a");
}
