use std::net::Ipv4Addr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(
    CustomResource, JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug,
)]
#[kube(
    group = "fabric-cni.dev",
    version = "v1alpha1",
    kind = "ElasticIp",
    status = "ElasticIpStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticIpSpec {
    pub v4_ip: String,

    /// External subnet the address is carved from.
    pub external_subnet: String,

    /// NAT gateway deployment owning this address.
    pub nat_gateway: String,
}

#[derive(JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ElasticIpStatus {
    #[serde(default)]
    pub ready: bool,
}

impl ElasticIp {
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }

    pub fn v4_ip(&self) -> Option<Ipv4Addr> {
        self.spec.v4_ip.parse().ok()
    }

    /// Pod carrying the gateway. Gateways run as single-replica
    /// statefulsets, so the pod name is deterministic.
    pub fn gateway_pod_name(&self) -> String {
        format!("{}-0", self.spec.nat_gateway)
    }
}
