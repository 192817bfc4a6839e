pub mod macvlan;
pub mod queue;

use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;
use fabric_cni_crds::v1alpha1::{ElasticIp, Subnet};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DaemonArgs;
use crate::kubernetes::Stores;
use crate::routes::NetlinkClient;
use crate::Result;

use macvlan::{macvlan_name, MacvlanManager};
use queue::{run_worker, work_queue, WorkQueue, WorkReceiver};

/// Events the pipeline reacts to, resolved to a concrete variant at
/// the queue boundary. Payloads never travel as untyped objects.
pub enum EipEvent {
    Upsert(Arc<ElasticIp>),
    Delete(Arc<ElasticIp>),
    GatewayPodChanged(Arc<Pod>),
    SubnetRemoved(Arc<Subnet>),
}

/// Everything needed to install or remove one elastic IP's host
/// route. Immutable once built; relevant events rebuild it from
/// scratch rather than patching fields.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EipRouteInfo {
    pub name: String,
    pub v4_ip: Ipv4Addr,
    pub master: String,
    pub macvlan: String,
}

/// Resolves an elastic IP to its route info through the external
/// subnet's macvlan master. `None` means the object is not routable
/// yet (unresolved subnet, missing master annotation, unparseable
/// address).
pub fn build_route_info(eip: &ElasticIp, stores: &Stores) -> Option<EipRouteInfo> {
    let subnet = stores.subnet(&eip.spec.external_subnet)?;
    let master = subnet.macvlan_master()?;
    let v4_ip = eip.v4_ip()?;
    Some(EipRouteInfo {
        name: eip.name_any(),
        v4_ip,
        macvlan: macvlan_name(&master),
        master,
    })
}

#[derive(PartialEq, Eq, Debug)]
pub(crate) enum SyncAction {
    /// Tombstoned, gone, or not ready: nothing to do.
    Skip,
    /// The gateway pod lives elsewhere: any local route must go.
    RemoveRoute,
    /// The gateway pod is local: the host route belongs here.
    Install,
}

pub(crate) fn sync_action(
    tombstoned: bool,
    eip: Option<&ElasticIp>,
    gateway_node: Option<&str>,
    local_node: &str,
) -> SyncAction {
    if tombstoned {
        return SyncAction::Skip;
    }
    let Some(eip) = eip else {
        return SyncAction::Skip;
    };
    if !eip.is_ready() {
        return SyncAction::Skip;
    }
    if gateway_node != Some(local_node) {
        return SyncAction::RemoveRoute;
    }
    SyncAction::Install
}

/// Per-object elastic IP reconciler: discrete events, two retry
/// queues, and a tombstone map shadowing stale adds that race a
/// delete.
pub struct EipPipeline {
    stores: Stores,
    netlink: NetlinkClient,
    macvlan: MacvlanManager,
    node_name: String,
    gateway_namespace: String,
    deleted: DashMap<String, ()>,
    sync_queue: WorkQueue<String>,
    delete_queue: WorkQueue<EipRouteInfo>,
}

pub struct EipReceivers {
    sync: WorkReceiver<String>,
    delete: WorkReceiver<EipRouteInfo>,
}

impl EipPipeline {
    pub fn new(
        stores: Stores,
        netlink: NetlinkClient,
        args: &DaemonArgs,
    ) -> (Arc<Self>, EipReceivers) {
        let (sync_queue, sync_rx) = work_queue();
        let (delete_queue, delete_rx) = work_queue();
        let pipeline = Arc::new(Self {
            stores,
            macvlan: MacvlanManager::new(netlink.clone()),
            netlink,
            node_name: args.node_name.clone(),
            gateway_namespace: args.gateway_namespace.clone(),
            deleted: DashMap::new(),
            sync_queue,
            delete_queue,
        });
        (
            pipeline,
            EipReceivers {
                sync: sync_rx,
                delete: delete_rx,
            },
        )
    }

    pub async fn run(self: Arc<Self>, receivers: EipReceivers, cancel: CancellationToken) {
        let sync_pipeline = self.clone();
        let sync_worker = run_worker(
            "eip-sync",
            receivers.sync,
            self.sync_queue.clone(),
            cancel.clone(),
            move |name: String| {
                let pipeline = sync_pipeline.clone();
                async move { pipeline.sync_one(&name).await }
            },
        );

        let delete_pipeline = self.clone();
        let delete_worker = run_worker(
            "eip-delete",
            receivers.delete,
            self.delete_queue.clone(),
            cancel,
            move |info: EipRouteInfo| {
                let pipeline = delete_pipeline.clone();
                async move { pipeline.delete_one(&info).await }
            },
        );

        tokio::join!(sync_worker, delete_worker);
    }

    pub async fn handle_event(&self, event: EipEvent) {
        match event {
            EipEvent::Upsert(eip) => {
                let name = eip.name_any();
                // a re-created object with the same name must not be
                // shadowed by the old tombstone
                self.deleted.remove(&name);
                if eip.is_ready() && build_route_info(&eip, &self.stores).is_some() {
                    self.sync_queue.add(name);
                }
            }
            EipEvent::Delete(eip) => {
                let name = eip.name_any();
                // marker first, so an already-queued add observes it
                self.deleted.insert(name.clone(), ());
                match build_route_info(&eip, &self.stores) {
                    Some(info) => self.delete_queue.add(info),
                    None => {
                        // nothing routable was ever installed
                        self.deleted.remove(&name);
                    }
                }
            }
            EipEvent::GatewayPodChanged(pod) => {
                if pod.namespace().as_deref() != Some(&self.gateway_namespace) {
                    return;
                }
                let pod_name = pod.name_any();
                // no reverse index: re-evaluate every elastic IP owned
                // by this gateway
                for eip in self.stores.eips.state() {
                    if eip.gateway_pod_name() == pod_name {
                        self.sync_queue.add(eip.name_any());
                    }
                }
            }
            EipEvent::SubnetRemoved(subnet) => {
                let Some(master) = subnet.macvlan_master() else {
                    return;
                };
                if let Err(e) = self
                    .macvlan
                    .remove_if_unused(&self.stores, &master, &subnet.name_any())
                    .await
                {
                    warn!(%e, master = %master, "failed to remove macvlan sub-interface");
                }
            }
        }
    }

    async fn sync_one(&self, name: &str) -> Result<()> {
        let eip = self.stores.elastic_ip(name);
        let gateway_node = eip.as_ref().and_then(|e| {
            self.stores
                .pod(&e.gateway_pod_name(), &self.gateway_namespace)
                .and_then(|p| p.spec.as_ref().and_then(|s| s.node_name.clone()))
        });

        match sync_action(
            self.deleted.contains_key(name),
            eip.as_deref(),
            gateway_node.as_deref(),
            &self.node_name,
        ) {
            SyncAction::Skip => Ok(()),
            SyncAction::RemoveRoute => {
                let Some(info) = eip.and_then(|e| build_route_info(&e, &self.stores)) else {
                    return Ok(());
                };
                self.netlink.del_host_route(info.v4_ip).await
            }
            SyncAction::Install => {
                let Some(info) = eip.and_then(|e| build_route_info(&e, &self.stores)) else {
                    warn!(eip = %name, "elastic ip is ready but not routable, skipping");
                    return Ok(());
                };
                let (_, index) = self.macvlan.ensure(&info.master).await?;
                info!(eip = %name, ip = %info.v4_ip, link = %info.macvlan, "installing host route");
                self.netlink.replace_host_route(info.v4_ip, index).await
            }
        }
    }

    async fn delete_one(&self, info: &EipRouteInfo) -> Result<()> {
        self.netlink.del_host_route(info.v4_ip).await?;
        info!(eip = %info.name, ip = %info.v4_ip, "removed host route");
        // clearing the tombstone last bounds the marker map: a marker
        // only outlives its object while a delete is still in flight
        self.deleted.remove(&info.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fabric_cni_crds::v1alpha1::subnet::MACVLAN_MASTER_ANNOTATION;
    use fabric_cni_crds::v1alpha1::{ElasticIpSpec, ElasticIpStatus, SubnetSpec};
    use kube::api::ObjectMeta;

    use super::*;
    use crate::kubernetes::test_support::make_stores;

    fn external_subnet(name: &str, master: &str) -> Subnet {
        let mut annotations = BTreeMap::new();
        annotations.insert(MACVLAN_MASTER_ANNOTATION.to_string(), master.to_string());
        let mut subnet = Subnet::new(
            name,
            SubnetSpec {
                cidr_block: "192.168.10.0/24".into(),
                ..Default::default()
            },
        );
        subnet.metadata.annotations = Some(annotations);
        subnet
    }

    fn make_eip(name: &str, ready: bool) -> ElasticIp {
        let mut eip = ElasticIp::new(
            name,
            ElasticIpSpec {
                v4_ip: "192.168.10.20".into(),
                external_subnet: "external".into(),
                nat_gateway: "vpc-gw".into(),
            },
        );
        eip.metadata = ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        };
        eip.status = Some(ElasticIpStatus { ready });
        eip
    }

    #[test]
    fn test_route_info_resolved_through_subnet_master() {
        let stores = make_stores(
            vec![external_subnet("external", "eth1")],
            vec![],
            vec![],
            vec![],
            vec![],
        );
        let info = build_route_info(&make_eip("eip-1", true), &stores).unwrap();
        assert_eq!(info.v4_ip, "192.168.10.20".parse::<Ipv4Addr>().unwrap());
        assert_eq!(info.master, "eth1");
        assert_eq!(info.macvlan, "mcv-eth1");
    }

    #[test]
    fn test_route_info_requires_master_annotation() {
        let mut subnet = external_subnet("external", "eth1");
        subnet.metadata.annotations = None;
        let stores = make_stores(vec![subnet], vec![], vec![], vec![], vec![]);
        assert!(build_route_info(&make_eip("eip-1", true), &stores).is_none());
    }

    #[test]
    fn test_tombstone_shadows_stale_add() {
        // delete raced ahead of a queued add: the add must do nothing
        let eip = make_eip("eip-1", true);
        let action = sync_action(true, Some(&eip), Some("this-node"), "this-node");
        assert_eq!(action, SyncAction::Skip);
    }

    #[test]
    fn test_gateway_elsewhere_removes_route() {
        let eip = make_eip("eip-1", true);
        assert_eq!(
            sync_action(false, Some(&eip), Some("other-node"), "this-node"),
            SyncAction::RemoveRoute
        );
        assert_eq!(
            sync_action(false, Some(&eip), None, "this-node"),
            SyncAction::RemoveRoute
        );
    }

    #[test]
    fn test_local_gateway_installs() {
        let eip = make_eip("eip-1", true);
        assert_eq!(
            sync_action(false, Some(&eip), Some("this-node"), "this-node"),
            SyncAction::Install
        );
    }

    #[test]
    fn test_not_ready_or_missing_is_noop() {
        let eip = make_eip("eip-1", false);
        assert_eq!(
            sync_action(false, Some(&eip), Some("this-node"), "this-node"),
            SyncAction::Skip
        );
        assert_eq!(sync_action(false, None, None, "this-node"), SyncAction::Skip);
    }

    #[test]
    fn test_master_survives_while_still_referenced() {
        // two subnets share eth1; removing one must keep the macvlan
        let stores = make_stores(
            vec![
                external_subnet("external-a", "eth1"),
                external_subnet("external-b", "eth1"),
            ],
            vec![],
            vec![],
            vec![],
            vec![],
        );
        assert!(stores.master_still_referenced("eth1", "external-a"));

        let stores = make_stores(
            vec![external_subnet("external-a", "eth1")],
            vec![],
            vec![],
            vec![],
            vec![],
        );
        assert!(!stores.master_still_referenced("eth1", "external-a"));
    }
}
