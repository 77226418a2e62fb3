use std::fmt;
use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::{Error, Result};

pub const SINGLE_TENANT_PLUGIN: &str = "single-tenant";
pub const MULTI_TENANT_PLUGIN: &str = "multi-tenant";

#[derive(Parser)]
#[command(version, about = "control plane for the pod overlay network", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the cluster master: subnet and VNID assignment.
    Master(MasterArgs),
    /// Run the per-node agent: datapath programming and watch loops.
    Node(NodeArgs),
}

#[derive(ClapArgs)]
pub struct MasterArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    /// Cluster-wide pod network CIDR
    #[arg(long, env = "PODNET_NETWORK", default_value = "10.1.0.0/16")]
    pub network: String,

    /// Host bits per node subnet (a /24 per node is 8)
    #[arg(long, env = "PODNET_HOST_BITS", default_value_t = 8)]
    pub host_bits: u32,

    /// Network plugin, one of single-tenant or multi-tenant
    #[arg(long, env = "PODNET_PLUGIN", value_parser = parse_plugin, default_value = SINGLE_TENANT_PLUGIN)]
    pub plugin: Plugin,

    /// Namespaces assigned the global VNID, exempt from tenant isolation
    #[arg(long, env = "PODNET_GLOBAL_NAMESPACES", value_delimiter = ',', default_value = "default")]
    pub global_namespaces: Vec<String>,

    /// Minutes between VNID repair passes
    #[arg(long, default_value_t = 15)]
    pub repair_interval_minutes: u64,
}

#[derive(ClapArgs)]
pub struct NodeArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    /// Node name as registered with the cluster; defaults to the hostname
    #[arg(long, env = "PODNET_HOSTNAME")]
    pub hostname: Option<String>,

    /// Node IP; resolved from the hostname when unset
    #[arg(long, env = "PODNET_NODE_IP")]
    pub node_ip: Option<String>,

    /// Network plugin, one of single-tenant or multi-tenant
    #[arg(long, env = "PODNET_PLUGIN", value_parser = parse_plugin, default_value = SINGLE_TENANT_PLUGIN)]
    pub plugin: Plugin,

    /// Services network CIDR, dispatched through the service flow table
    #[arg(long, env = "PODNET_SERVICES_NETWORK", default_value = "172.30.0.0/16")]
    pub services_network: String,

    /// MTU for pod interfaces; leaves room for the VXLAN header
    #[arg(long, env = "PODNET_MTU", default_value_t = 1450)]
    pub mtu: u32,

    /// Kubeconfig handed to the CNI plugin through its net conf
    #[arg(long, env = "PODNET_MASTER_KUBECONFIG", default_value = "/etc/podnet/master.kubeconfig")]
    pub master_kubeconfig: PathBuf,
}

#[derive(ClapArgs)]
pub struct RegistryArgs {
    /// Coordination store endpoints
    #[arg(long, env = "PODNET_ETCD_ENDPOINTS", value_delimiter = ',', default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoints: Vec<String>,

    /// Root prefix for all registry keys
    #[arg(long, env = "PODNET_ETCD_PREFIX", default_value = "/podnet")]
    pub etcd_prefix: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Plugin {
    SingleTenant,
    MultiTenant,
}

impl Plugin {
    pub fn multitenant(&self) -> bool {
        matches!(self, Plugin::MultiTenant)
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plugin::SingleTenant => f.write_str(SINGLE_TENANT_PLUGIN),
            Plugin::MultiTenant => f.write_str(MULTI_TENANT_PLUGIN),
        }
    }
}

fn parse_plugin(s: &str) -> Result<Plugin> {
    match s {
        SINGLE_TENANT_PLUGIN => Ok(Plugin::SingleTenant),
        MULTI_TENANT_PLUGIN => Ok(Plugin::MultiTenant),
        _ => Err(Error::Other(format!("plugin {s:?} not supported"))),
    }
}
