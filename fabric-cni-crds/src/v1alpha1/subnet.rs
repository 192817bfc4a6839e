use ipnetwork::IpNetwork;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation carrying the macvlan master interface for external subnets.
pub const MACVLAN_MASTER_ANNOTATION: &str = "fabric-cni.dev/macvlan-master";

/// Name of the join subnet connecting nodes to the overlay.
pub const JOIN_SUBNET: &str = "join";

#[derive(
    CustomResource, JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug,
)]
#[kube(
    group = "fabric-cni.dev",
    version = "v1alpha1",
    kind = "Subnet",
    status = "SubnetStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// CIDR block of the subnet. Dual-stack subnets carry both families
    /// comma separated, IPv4 first.
    pub cidr_block: String,

    #[serde(default)]
    pub gateway: String,

    /// Network provider backing this subnet. Empty means the default
    /// overlay provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,

    #[serde(default)]
    pub nat_outgoing: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nat_outgoing_policy_rules: Vec<NatOutgoingPolicyRule>,

    /// "distributed" or "centralized".
    #[serde(default)]
    pub gateway_type: String,

    /// Node elected to carry centralized gateway traffic.
    #[serde(default)]
    pub gateway_node: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_routing_table_id: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_routing_priority: Option<u32>,

    /// Underlay-to-overlay interconnection.
    #[serde(default)]
    pub u2o_interconnection: bool,
}

#[derive(JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    #[serde(default)]
    pub ready: bool,

    /// Policy rules with their server-assigned ids. The id names the
    /// per-rule ipset pair and the owning NAT sub-chain entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nat_outgoing_policy_rules: Vec<NatOutgoingPolicyRuleStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u2o_interconnection_mac: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NatOutgoingPolicyRule {
    #[serde(rename = "match")]
    pub rule_match: NatPolicyMatch,
    pub action: NatPolicyAction,
}

#[derive(JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NatOutgoingPolicyRuleStatus {
    #[serde(rename = "match")]
    pub rule_match: NatPolicyMatch,
    pub action: NatPolicyAction,
    pub rule_id: String,
}

#[derive(JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NatPolicyMatch {
    #[serde(default)]
    pub src_ips: String,
    #[serde(default)]
    pub dst_ips: String,
}

#[derive(JsonSchema, Serialize, Deserialize, Default, PartialEq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum NatPolicyAction {
    #[default]
    Nat,
    Forward,
}

impl Subnet {
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }

    pub fn is_join(&self) -> bool {
        self.name_any() == JOIN_SUBNET
    }

    /// Parsed CIDRs of the subnet, invalid entries dropped.
    pub fn cidrs(&self) -> Vec<IpNetwork> {
        self.spec
            .cidr_block
            .split(',')
            .filter_map(|c| c.trim().parse().ok())
            .collect()
    }

    pub fn v4_cidr(&self) -> Option<IpNetwork> {
        self.cidrs().into_iter().find(|c| c.is_ipv4())
    }

    pub fn v6_cidr(&self) -> Option<IpNetwork> {
        self.cidrs().into_iter().find(|c| c.is_ipv6())
    }

    pub fn gateways(&self) -> Vec<std::net::IpAddr> {
        self.spec
            .gateway
            .split(',')
            .filter_map(|g| g.trim().parse().ok())
            .collect()
    }

    pub fn is_centralized_gateway(&self) -> bool {
        self.spec.gateway_type == "centralized"
    }

    pub fn policy_routing_enabled(&self) -> bool {
        self.spec.policy_routing_table_id.is_some()
    }

    /// Macvlan master interface for external subnets, carried as an
    /// annotation rather than a spec field so that it can be set per
    /// environment without a spec round-trip.
    pub fn macvlan_master(&self) -> Option<String> {
        self.annotations().get(MACVLAN_MASTER_ANNOTATION).cloned()
    }

    pub fn u2o_mac(&self) -> Option<String> {
        self.status
            .as_ref()
            .and_then(|s| s.u2o_interconnection_mac.clone())
    }
}
