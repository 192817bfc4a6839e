use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Daemon(DaemonArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Uplink interface connecting the node to the overlay
    #[arg(long, default_value = "fabric0")]
    pub overlay_interface: String,

    /// CIDR of the join subnet connecting nodes to the overlay
    #[arg(long, env = "JOIN_CIDR", default_value = "100.64.0.0/16")]
    pub join_cidr: String,

    /// Cluster service CIDRs, comma separated for dual stack
    #[arg(long, env = "SERVICE_CLUSTER_IP_RANGE", default_value = "10.96.0.0/12")]
    pub service_cluster_ip_range: String,

    /// Namespace NAT gateway pods are deployed into
    #[arg(long, env = "GATEWAY_NAMESPACE", default_value = "kube-system")]
    pub gateway_namespace: String,

    /// Full resync period for routes, iptables and ipsets, in seconds
    #[arg(long, default_value_t = 30)]
    pub resync_period: u64,

    /// OVS flow table sync period, in seconds
    #[arg(long, default_value_t = 15)]
    pub flow_sync_period: u64,

    /// OVS forwarding database sync period, in seconds. Kept near the
    /// default OVS FDB aging time so refreshes beat expiry.
    #[arg(long, default_value_t = 300)]
    pub fdb_sync_period: u64,

    /// OVS bridges carrying provider networks, comma separated
    #[arg(long, env = "PROVIDER_BRIDGES", default_value = "br-provider")]
    pub provider_bridges: String,
}

impl DaemonArgs {
    pub fn bridges(&self) -> Vec<String> {
        self.provider_bridges
            .split(',')
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect()
    }

    pub fn service_cidrs(&self) -> Vec<ipnetwork::IpNetwork> {
        self.service_cluster_ip_range
            .split(',')
            .filter_map(|c| c.trim().parse().ok())
            .collect()
    }
}
