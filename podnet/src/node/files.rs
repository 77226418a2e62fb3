use std::fs;
use std::path::Path;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use podnet_netutils::generate_default_gateway;

use crate::{Error, Result};

/// Read by the CNI plugin to join containers into the pod network.
pub const NODE_CONFIG_PATH: &str = "/var/run/podnet/nodeConfig.json";

/// Standard CNI net conf picked up by the orchestrator's CNI machinery.
/// Name kept from the system this replaces so existing deployments keep
/// resolving the same file.
pub const CNI_CONFIG_PATH: &str = "/etc/cni/net.d/80-openshift-sdn.conf";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CniNodeConfig {
    pub cluster_network: String,
    pub node_network: String,
    pub node_gateway: String,
    pub mtu: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CniNetConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub master_kube_config: String,
    pub multitenant: bool,
}

/// Writes the node config the CNI plugin reads. Written to a temp file
/// and renamed into place so the plugin never sees a partial file.
pub fn write_node_config(
    path: &Path,
    cluster_network: &str,
    node_network: &str,
    mtu: u32,
) -> Result<()> {
    let subnet: Ipv4Network = node_network
        .parse()
        .map_err(|_| Error::InvalidCidr(node_network.to_owned()))?;
    let config = CniNodeConfig {
        cluster_network: cluster_network.to_owned(),
        node_network: node_network.to_owned(),
        node_gateway: generate_default_gateway(subnet).to_string(),
        mtu,
    };
    write_atomically(path, &serde_json::to_vec(&config)?)
}

pub fn write_cni_config(path: &Path, master_kubeconfig: &str, multitenant: bool) -> Result<()> {
    let config = CniNetConfig {
        name: "openshift-sdn".to_owned(),
        plugin_type: "openshift-sdn".to_owned(),
        master_kube_config: master_kubeconfig.to_owned(),
        multitenant,
    };
    write_atomically(path, &serde_json::to_vec(&config)?)
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Other(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_node_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/nodeConfig.json");

        write_node_config(&path, "10.1.0.0/16", "10.1.3.0/24", 1450).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let config: CniNodeConfig = serde_json::from_str(&contents).unwrap();
        assert_eq!(
            config,
            CniNodeConfig {
                cluster_network: "10.1.0.0/16".into(),
                node_network: "10.1.3.0/24".into(),
                node_gateway: "10.1.3.1".into(),
                mtu: 1450,
            }
        );
        // no leftover temp file
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_node_config_rejects_bad_subnet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodeConfig.json");
        assert!(write_node_config(&path, "10.1.0.0/16", "junk", 1450).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_cni_config_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("80-openshift-sdn.conf");

        write_cni_config(&path, "/etc/podnet/master.kubeconfig", true).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["type"], "openshift-sdn");
        assert_eq!(value["masterKubeConfig"], "/etc/podnet/master.kubeconfig");
        assert_eq!(value["multitenant"], true);
    }
}
