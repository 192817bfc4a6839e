pub mod diff;
pub mod netlink;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use fabric_cni_crds::v1alpha1::Subnet;
use ipnetwork::IpNetwork;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use diff::{diff_routes, diff_rules, Family, PolicyRule, Route};
pub use netlink::NetlinkClient;

use crate::config::DaemonArgs;
use crate::kubernetes::{is_gateway_node, Stores};
use crate::trigger::TriggerReceiver;
use crate::Result;

use diff::MAIN_TABLE;

/// Tables the kernel owns that a resync must never touch.
const RESERVED_TABLES: [u32; 4] = [0, 253, 254, 255];

/// Full-resync reconciler for the uplink routes and the policy routing
/// rules derived from subnets.
pub struct RouteReconciler {
    stores: Stores,
    netlink: NetlinkClient,
    node_name: String,
    uplink: String,
    join_cidrs: Vec<IpNetwork>,
    resync: Duration,
}

impl RouteReconciler {
    pub fn new(stores: Stores, netlink: NetlinkClient, args: &DaemonArgs) -> Self {
        let join_cidrs = args
            .join_cidr
            .split(',')
            .filter_map(|c| c.trim().parse().ok())
            .collect();
        Self {
            stores,
            netlink,
            node_name: args.node_name.clone(),
            uplink: args.overlay_interface.clone(),
            join_cidrs,
            resync: Duration::from_secs(args.resync_period),
        }
    }

    pub async fn run(self, mut trigger: TriggerReceiver, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.resync);
        info!("starting route reconciler");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                alive = trigger.triggered() => {
                    if !alive {
                        break;
                    }
                }
            }
            if let Err(e) = self.sync().await {
                error!(%e, "route resync failed, retrying on next tick");
            }
        }
        info!("route reconciler exited");
    }

    pub async fn sync(&self) -> Result<()> {
        let uplink_index = self.netlink.link_index(&self.uplink).await?;
        let expected_src = self.expected_sources();
        let (desired_routes, desired_rules) = self.desired_state(uplink_index, &expected_src);

        let managed_tables: HashSet<u32> = desired_routes
            .iter()
            .map(|r| r.table)
            .filter(|t| !RESERVED_TABLES.contains(t))
            .collect();
        let desired_main: HashSet<IpNetwork> = desired_routes
            .iter()
            .filter(|r| r.table == MAIN_TABLE)
            .map(|r| r.destination)
            .collect();

        let kernel_routes = self.netlink.list_routes().await?;
        let existing: Vec<Route> = kernel_routes
            .iter()
            .map(|k| k.route.clone())
            .filter(|r| {
                if r.table == MAIN_TABLE {
                    // uplink routes are ours; off-uplink routes only
                    // matter when they collide with a desired one
                    return r.link_index == uplink_index
                        || desired_main.contains(&r.destination);
                }
                if RESERVED_TABLES.contains(&r.table) {
                    return false;
                }
                // non-reserved tables: currently desired policy tables,
                // plus uplink leftovers in tables of removed subnets
                managed_tables.contains(&r.table) || r.link_index == uplink_index
            })
            .collect();

        let route_diff = diff_routes(
            &existing,
            &desired_routes,
            uplink_index,
            &self.join_cidrs,
            &expected_src,
        );

        let kernel_rules = self.netlink.list_rules().await?;
        let existing_rules: Vec<PolicyRule> = kernel_rules
            .iter()
            .map(|k| k.rule.clone())
            .filter(|r| !RESERVED_TABLES.contains(&r.table) && r.priority > 0)
            .collect();
        let rule_diff = diff_rules(&existing_rules, &desired_rules);

        // New state goes in before old state goes away, so no desired
        // destination loses its route mid-cycle. Replace/add failures
        // abort the pass; deletions are best effort.
        for route in &route_diff.to_add {
            self.netlink.replace_route(route).await?;
        }
        for rule in &rule_diff.to_add {
            self.netlink.add_rule(rule).await?;
        }
        for rule in &rule_diff.to_del {
            let Some(kernel) = kernel_rules.iter().find(|k| k.rule == *rule) else {
                continue;
            };
            if let Err(e) = self.netlink.del_rule(kernel).await {
                warn!(%e, ?rule, "failed to delete stale policy rule");
            }
        }
        for route in &route_diff.to_del {
            let Some(kernel) = kernel_routes.iter().find(|k| k.route == *route) else {
                continue;
            };
            if let Err(e) = self.netlink.del_route(kernel).await {
                warn!(%e, ?route, "failed to delete stale route");
            }
        }
        Ok(())
    }

    fn expected_sources(&self) -> HashMap<Family, IpAddr> {
        self.stores
            .node_overlay_ips(&self.node_name)
            .into_iter()
            .map(|ip| (Family::of(&ip), ip))
            .collect()
    }

    fn desired_state(
        &self,
        uplink_index: u32,
        expected_src: &HashMap<Family, IpAddr>,
    ) -> (Vec<Route>, Vec<PolicyRule>) {
        let gateways: HashMap<Family, IpAddr> = self
            .stores
            .node_overlay_gateways(&self.node_name)
            .into_iter()
            .map(|ip| (Family::of(&ip), ip))
            .collect();

        let mut routes = Vec::new();
        let mut rules = Vec::new();

        for cidr in &self.join_cidrs {
            routes.push(Route {
                destination: *cidr,
                source: None,
                gateway: None,
                table: MAIN_TABLE,
                link_index: uplink_index,
            });
        }

        let node = self.stores.node(&self.node_name);
        for subnet in self.stores.ready_subnets() {
            if subnet.is_join() || subnet.macvlan_master().is_some() {
                continue;
            }
            let cidrs = subnet.cidrs();
            if cidrs.is_empty() {
                warn!(subnet = %subnet.name_any(), "subnet has no parseable CIDR, skipping");
                continue;
            }
            for cidr in &cidrs {
                let family = Family::of_net(cidr);
                routes.push(Route {
                    destination: *cidr,
                    source: expected_src.get(&family).copied(),
                    gateway: gateways.get(&family).copied(),
                    table: MAIN_TABLE,
                    link_index: uplink_index,
                });
            }
            if subnet.policy_routing_enabled() {
                self.policy_routing_state(
                    &subnet,
                    &cidrs,
                    uplink_index,
                    node.as_deref(),
                    &mut routes,
                    &mut rules,
                );
            }
        }

        (routes, rules)
    }

    fn policy_routing_state(
        &self,
        subnet: &Subnet,
        cidrs: &[IpNetwork],
        uplink_index: u32,
        node: Option<&k8s_openapi::api::core::v1::Node>,
        routes: &mut Vec<Route>,
        rules: &mut Vec<PolicyRule>,
    ) {
        let Some(table) = subnet.spec.policy_routing_table_id else {
            return;
        };
        let Some(priority) = subnet.spec.policy_routing_priority else {
            warn!(
                subnet = %subnet.name_any(),
                "policy routing table set without a priority, skipping"
            );
            return;
        };

        let subnet_gateways: HashMap<Family, IpAddr> = subnet
            .gateways()
            .into_iter()
            .map(|ip| (Family::of(&ip), ip))
            .collect();

        for cidr in cidrs {
            let family = Family::of_net(cidr);
            let Some(gw) = subnet_gateways.get(&family) else {
                warn!(
                    subnet = %subnet.name_any(),
                    "policy routing subnet missing a gateway for its family, skipping"
                );
                continue;
            };
            routes.push(Route {
                destination: default_net(family),
                source: None,
                gateway: Some(*gw),
                table,
                link_index: uplink_index,
            });

            if subnet.is_centralized_gateway() {
                // the CIDR-wide rule only belongs on the elected node
                if node.map(|n| is_gateway_node(subnet, n)).unwrap_or(false) {
                    rules.push(PolicyRule {
                        family,
                        src: Some(*cidr),
                        table,
                        priority,
                    });
                }
            } else {
                for ip in self.stores.pod_ips_in_subnet(&subnet.name_any()) {
                    if Family::of(&ip) != family {
                        continue;
                    }
                    let Ok(src) = IpNetwork::new(ip, host_prefix(family)) else {
                        continue;
                    };
                    rules.push(PolicyRule {
                        family,
                        src: Some(src),
                        table,
                        priority,
                    });
                }
            }
        }
    }
}

fn default_net(family: Family) -> IpNetwork {
    match family {
        Family::V4 => IpNetwork::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).unwrap(),
        Family::V6 => IpNetwork::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).unwrap(),
    }
}

fn host_prefix(family: Family) -> u8 {
    match family {
        Family::V4 => 32,
        Family::V6 => 128,
    }
}
