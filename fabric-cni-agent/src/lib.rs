pub mod agent;
pub mod config;
pub mod eip;
pub mod fdb;
pub mod ipset;
pub mod kubernetes;
pub mod nat;
pub mod openflow;
pub mod routes;
pub mod trigger;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to create store: {0}")]
    StoreCreation(#[from] fabric_cni_k8s_utils::Error),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("addr parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("invalid ip network: {0}")]
    InvalidIpNetwork(#[from] ipnetwork::IpNetworkError),

    #[error("packet filter error: {0}")]
    PacketFilter(String),

    #[error("ipset error: {0}")]
    Ipset(String),

    #[error("ovs error: {0}")]
    Ovs(String),

    #[error("link {name} not found")]
    LinkNotFound { name: String },

    #[error("task failed: {0}")]
    Task(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
