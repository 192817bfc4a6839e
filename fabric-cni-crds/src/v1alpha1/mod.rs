pub mod elasticip;
pub mod subnet;

pub use elasticip::{ElasticIp, ElasticIpSpec, ElasticIpStatus};
pub use subnet::{
    NatOutgoingPolicyRule, NatPolicyAction, NatPolicyMatch, Subnet, SubnetSpec, SubnetStatus,
};
