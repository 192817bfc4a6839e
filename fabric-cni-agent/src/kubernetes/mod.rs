use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use fabric_cni_crds::v1alpha1::{ElasticIp, Subnet};
use fabric_cni_k8s_utils::{create_store_and_events, create_store_and_subscriber};
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::runtime::reflector::{ObjectRef, ReflectHandle, Store};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc::UnboundedSender;

use crate::Result;

/// Overlay addresses assigned to a node, one per family, comma separated.
pub const OVERLAY_IP_ANNOTATION: &str = "fabric-cni.dev/overlay-ip";
/// Overlay gateway a node should route subnet traffic through.
pub const OVERLAY_GATEWAY_ANNOTATION: &str = "fabric-cni.dev/overlay-gateway";
/// Subnet a pod was allocated from.
pub const POD_SUBNET_ANNOTATION: &str = "fabric-cni.dev/subnet";

const STORE_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only snapshot access over the cached cluster objects every
/// reconciler computes desired state from.
#[derive(Clone)]
pub struct Stores {
    pub subnets: Store<Subnet>,
    pub pods: Store<Pod>,
    pub nodes: Store<Node>,
    pub services: Store<Service>,
    pub eips: Store<ElasticIp>,
}

/// Apply-event streams for the resources where applies are enough to
/// kick a resync. Subnets, services and elastic IPs are watched
/// through raw event channels instead: their consumers need
/// deletions, which a shared-store subscriber does not deliver.
pub struct Subscribers {
    pub pods: ReflectHandle<Pod>,
    pub nodes: ReflectHandle<Node>,
}

impl Stores {
    pub async fn try_new(
        client: Client,
        subnet_events: UnboundedSender<watcher::Event<Subnet>>,
        service_events: UnboundedSender<watcher::Event<Service>>,
        eip_events: UnboundedSender<watcher::Event<ElasticIp>>,
    ) -> Result<(Self, Subscribers)> {
        let store_init = tokio::try_join!(
            create_store_and_events(
                Api::<Subnet>::all(client.clone()),
                Some(STORE_READY_TIMEOUT),
                subnet_events,
            ),
            create_store_and_subscriber(
                Api::<Pod>::all(client.clone()),
                Some(STORE_READY_TIMEOUT)
            ),
            create_store_and_subscriber(
                Api::<Node>::all(client.clone()),
                Some(STORE_READY_TIMEOUT)
            ),
            create_store_and_events(
                Api::<Service>::all(client.clone()),
                Some(STORE_READY_TIMEOUT),
                service_events,
            ),
            create_store_and_events(
                Api::<ElasticIp>::all(client),
                Some(STORE_READY_TIMEOUT),
                eip_events,
            ),
        )?;

        let (subnet_store, (pod_store, pod_subscriber), (node_store, node_subscriber), service_store, eip_store) =
            store_init;

        Ok((
            Self {
                subnets: subnet_store,
                pods: pod_store,
                nodes: node_store,
                services: service_store,
                eips: eip_store,
            },
            Subscribers {
                pods: pod_subscriber,
                nodes: node_subscriber,
            },
        ))
    }

    pub fn ready_subnets(&self) -> Vec<Arc<Subnet>> {
        self.subnets
            .state()
            .into_iter()
            .filter(|s| s.is_ready())
            .collect()
    }

    pub fn subnet(&self, name: &str) -> Option<Arc<Subnet>> {
        self.subnets.get(&ObjectRef::new(name))
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(&ObjectRef::new(name))
    }

    pub fn elastic_ip(&self, name: &str) -> Option<Arc<ElasticIp>> {
        self.eips.get(&ObjectRef::new(name))
    }

    pub fn pod(&self, name: &str, namespace: &str) -> Option<Arc<Pod>> {
        self.pods.get(&ObjectRef::new(name).within(namespace))
    }

    /// Running pod IPs allocated from the named subnet.
    pub fn pod_ips_in_subnet(&self, subnet: &str) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self
            .pods
            .state()
            .iter()
            .filter(|p| {
                p.annotations().get(POD_SUBNET_ANNOTATION).map(String::as_str) == Some(subnet)
                    && p.metadata.deletion_timestamp.is_none()
            })
            .flat_map(|p| pod_ips(p.as_ref()))
            .collect();
        ips.sort_unstable();
        ips.dedup();
        ips
    }

    /// Internal and overlay addresses of every node except `own_node`.
    pub fn other_node_addresses(&self, own_node: &str) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self
            .nodes
            .state()
            .iter()
            .filter(|n| n.name_any() != own_node)
            .flat_map(|n| {
                let mut addrs = annotated_ips(n.annotations().get(OVERLAY_IP_ANNOTATION));
                addrs.extend(internal_ips(n.as_ref()));
                addrs
            })
            .collect();
        ips.sort_unstable();
        ips.dedup();
        ips
    }

    pub fn node_internal_ips(&self, node: &str) -> Vec<IpAddr> {
        self.node(node)
            .map(|n| internal_ips(n.as_ref()))
            .unwrap_or_default()
    }

    /// Pods scheduled on `node` carrying the given annotation value.
    pub fn local_pods_with_annotation(
        &self,
        node: &str,
        annotation: &str,
        value: &str,
    ) -> Vec<std::sync::Arc<Pod>> {
        self.pods
            .state()
            .into_iter()
            .filter(|p| {
                p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node)
                    && p.annotations().get(annotation).map(String::as_str) == Some(value)
                    && p.metadata.deletion_timestamp.is_none()
            })
            .collect()
    }

    pub fn node_overlay_ips(&self, node: &str) -> Vec<IpAddr> {
        self.node(node)
            .map(|n| annotated_ips(n.annotations().get(OVERLAY_IP_ANNOTATION)))
            .unwrap_or_default()
    }

    pub fn node_overlay_gateways(&self, node: &str) -> Vec<IpAddr> {
        self.node(node)
            .map(|n| annotated_ips(n.annotations().get(OVERLAY_GATEWAY_ANNOTATION)))
            .unwrap_or_default()
    }

    /// Whether any other subnet still references the macvlan master.
    pub fn master_still_referenced(&self, master: &str, excluding: &str) -> bool {
        self.subnets.state().iter().any(|s| {
            s.name_any() != excluding && s.macvlan_master().as_deref() == Some(master)
        })
    }
}

/// Whether this node is the elected gateway for a centralized subnet.
/// `gatewayNode` entries are either plain node names or `key=value`
/// label selectors.
pub fn is_gateway_node(subnet: &Subnet, node: &Node) -> bool {
    let labels = node.labels();
    subnet
        .spec
        .gateway_node
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .any(|entry| match entry.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => entry == node.name_any(),
        })
}

fn internal_ips(node: &Node) -> Vec<IpAddr> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addrs| {
            addrs
                .iter()
                .filter(|a| a.type_ == "InternalIP")
                .filter_map(|a| a.address.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn pod_ips(pod: &Pod) -> Vec<IpAddr> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ips.as_ref())
        .map(|ips| ips.iter().filter_map(|p| p.ip.parse().ok()).collect())
        .unwrap_or_default()
}

fn annotated_ips(annotation: Option<&String>) -> Vec<IpAddr> {
    annotation
        .map(|a| a.split(',').filter_map(|ip| ip.trim().parse().ok()).collect())
        .unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fabric_cni_crds::v1alpha1::SubnetSpec;
    use k8s_openapi::api::core::v1::{PodIP, PodStatus};
    use kube::api::ObjectMeta;

    use super::*;

    fn make_node(name: &str, labels: BTreeMap<String, String>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_gateway_node_by_name() {
        let subnet = Subnet::new(
            "external",
            SubnetSpec {
                cidr_block: "192.168.0.0/24".into(),
                gateway_node: "node-a, node-b".into(),
                ..Default::default()
            },
        );
        assert!(is_gateway_node(&subnet, &make_node("node-a", BTreeMap::new())));
        assert!(is_gateway_node(&subnet, &make_node("node-b", BTreeMap::new())));
        assert!(!is_gateway_node(&subnet, &make_node("node-c", BTreeMap::new())));
    }

    #[test]
    fn test_gateway_node_by_label() {
        let subnet = Subnet::new(
            "external",
            SubnetSpec {
                cidr_block: "192.168.0.0/24".into(),
                gateway_node: "fabric-cni.dev/gateway=true".into(),
                ..Default::default()
            },
        );
        let mut labels = BTreeMap::new();
        labels.insert("fabric-cni.dev/gateway".to_string(), "true".to_string());
        assert!(is_gateway_node(&subnet, &make_node("node-a", labels)));
        assert!(!is_gateway_node(&subnet, &make_node("node-a", BTreeMap::new())));
    }

    #[test]
    fn test_pod_ips_parsed() {
        let pod = Pod {
            status: Some(PodStatus {
                pod_ips: Some(vec![
                    PodIP {
                        ip: "10.16.0.5".into(),
                    },
                    PodIP {
                        ip: "fd00:10:16::5".into(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(pod_ips(&pod).len(), 2);
    }
}
