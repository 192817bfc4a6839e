pub mod backend;
pub mod chains;
pub mod policy;

use std::collections::HashSet;
use std::time::Duration;

use fabric_cni_crds::v1alpha1::Subnet;
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use backend::{detect_mode, FilterMode, IptablesBackend, PacketFilterBackend};
pub use chains::FilterRule;

use crate::config::DaemonArgs;
use crate::ipset::{self, IpsetCli, IpsetSpec, SetKind};
use crate::kubernetes::{is_gateway_node, Stores};
use crate::routes::Family;
use crate::trigger::TriggerReceiver;
use crate::Result;

pub const TABLE_NAT: &str = "nat";
pub const TABLE_MANGLE: &str = "mangle";

pub const CHAIN_PREROUTING: &str = "FAB-PREROUTING";
pub const CHAIN_POSTROUTING: &str = "FAB-POSTROUTING";
pub const CHAIN_MASQUERADE: &str = "FAB-MASQUERADE";
pub const CHAIN_NAT_POLICY: &str = "FAB-NAT-POLICY";
pub const CHAIN_TPROXY: &str = "FAB-TPROXY";

/// Mark carried by packets that must be masqueraded on egress.
const MARK_NAT: u32 = 0x4000;
const MARK_NAT_MASK: u32 = 0x4000;
/// Mark and port of the transparent proxy intercepting probe traffic.
const TPROXY_MARK: &str = "0x90/0x90";
const TPROXY_PORT: &str = "8102";

/// Pods opting into transparent probe proxying.
pub const TPROXY_ANNOTATION: &str = "fabric-cni.dev/tproxy";

/// The kube-proxy masquerade jump our egress jump must outrank, or
/// reply traffic gets double-NATed.
const KUBE_POSTROUTING_MARKER: &str = "KUBE-POSTROUTING";

struct FamilyBackend {
    family: Family,
    backend: Box<dyn PacketFilterBackend>,
}

/// Full-resync reconciler for the managed iptables chains and the
/// classifier sets they reference. Sets are replaced first within a
/// cycle: a rule matching on a set can only be inserted once the set
/// exists.
pub struct NatReconciler {
    stores: Stores,
    ipset: IpsetCli,
    mode: FilterMode,
    node_name: String,
    uplink: String,
    join_cidrs: Vec<IpNetwork>,
    service_cidrs: Vec<IpNetwork>,
    families: Vec<FamilyBackend>,
    resync: Duration,
}

impl NatReconciler {
    pub fn try_new(stores: Stores, args: &DaemonArgs, mode: FilterMode) -> Result<Self> {
        let service_cidrs = args.service_cidrs();
        let join_cidrs: Vec<IpNetwork> = args
            .join_cidr
            .split(',')
            .filter_map(|c| c.trim().parse().ok())
            .collect();

        let mut families = Vec::new();
        for family in [Family::V4, Family::V6] {
            let active = service_cidrs
                .iter()
                .chain(join_cidrs.iter())
                .any(|c| Family::of_net(c) == family);
            if active {
                families.push(FamilyBackend {
                    family,
                    backend: Box::new(IptablesBackend::try_new(family)?),
                });
            }
        }

        Ok(Self {
            stores,
            ipset: IpsetCli,
            mode,
            node_name: args.node_name.clone(),
            uplink: args.overlay_interface.clone(),
            join_cidrs,
            service_cidrs,
            families,
            resync: Duration::from_secs(args.resync_period),
        })
    }

    pub async fn run(self, mut trigger: TriggerReceiver, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.resync);
        info!(mode = ?self.mode, "starting packet filter reconciler");
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
                error!(%e, "packet filter resync failed, retrying on next tick");
            }
        }
        info!("packet filter reconciler exited");
    }

    pub async fn sync(&self) -> Result<()> {
        let subnets = self.stores.ready_subnets();
        let overlay_subnets: Vec<&Subnet> = subnets
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| !s.is_join() && s.macvlan_master().is_none())
            .collect();

        // classifier sets for every active family go in as one batch
        let mut desired_sets = Vec::new();
        let mut per_family_policy: Vec<(Family, Vec<(String, Vec<FilterRule>)>)> = Vec::new();
        for fam in &self.families {
            desired_sets.extend(self.classifier_sets(fam.family, &overlay_subnets));

            let mut policy_chains = Vec::new();
            for subnet in &overlay_subnets {
                let Some(chain) = policy::policy_chain_name(subnet) else {
                    continue;
                };
                let (rules, sets) = policy::policy_chain_state(fam.family, subnet, &chain);
                if rules.is_empty() && sets.is_empty() {
                    continue;
                }
                desired_sets.extend(sets);
                policy_chains.push((chain, rules));
            }
            per_family_policy.push((fam.family, policy_chains));
        }
        self.ipset.sync(&desired_sets).await?;

        for fam in &self.families {
            let policy_chains = per_family_policy
                .iter()
                .find(|(f, _)| *f == fam.family)
                .map(|(_, c)| c.as_slice())
                .unwrap_or_default();
            self.sync_family(fam.family, fam.backend.as_ref(), &overlay_subnets, policy_chains)?;
        }

        if self.mode == FilterMode::Nft {
            self.scrub_legacy_layout().await;
        }
        Ok(())
    }

    fn sync_family(
        &self,
        family: Family,
        backend: &dyn PacketFilterBackend,
        subnets: &[&Subnet],
        policy_chains: &[(String, Vec<FilterRule>)],
    ) -> Result<()> {
        // leaf chains first so jumps into them always have a target
        chains::reconcile_chain_rules(
            backend,
            TABLE_NAT,
            CHAIN_MASQUERADE,
            &[FilterRule::new(TABLE_NAT, CHAIN_MASQUERADE)
                .jump("MASQUERADE")
                .raw(["--random-fully"])],
        )?;

        let mut expected_policy_chains = HashSet::new();
        for (chain, rules) in policy_chains {
            expected_policy_chains.insert(chain.clone());
            chains::reconcile_chain_rules(backend, TABLE_NAT, chain, rules)?;
        }

        let dispatch = self.nat_policy_dispatch(family, subnets, policy_chains);
        chains::reconcile_chain_rules(backend, TABLE_NAT, CHAIN_NAT_POLICY, &dispatch)?;

        let prerouting = self.prerouting_rules(family);
        chains::reconcile_chain_rules(backend, TABLE_NAT, CHAIN_PREROUTING, &prerouting)?;

        let postrouting = self.postrouting_rules(family, subnets);
        chains::reconcile_chain_rules(backend, TABLE_NAT, CHAIN_POSTROUTING, &postrouting)?;

        let tproxy = self.tproxy_rules(family);
        chains::reconcile_chain_rules(backend, TABLE_MANGLE, CHAIN_TPROXY, &tproxy)?;

        chains::ensure_jump_at_head(
            backend,
            &FilterRule::new(TABLE_NAT, "PREROUTING").jump(CHAIN_PREROUTING),
        )?;
        chains::ensure_jump_at_head(
            backend,
            &FilterRule::new(TABLE_MANGLE, "PREROUTING").jump(CHAIN_TPROXY),
        )?;
        // this one has an ordering invariant against kube-proxy
        chains::ensure_rule_above(
            backend,
            TABLE_NAT,
            "POSTROUTING",
            &FilterRule::new(TABLE_NAT, "POSTROUTING").jump(CHAIN_POSTROUTING),
            KUBE_POSTROUTING_MARKER,
        )?;

        policy::gc_policy_chains(backend, &expected_policy_chains);
        Ok(())
    }

    /// The fixed per-family classifier sets.
    fn classifier_sets(&self, family: Family, subnets: &[&Subnet]) -> Vec<IpsetSpec> {
        let of_family = |cidrs: &[IpNetwork]| -> Vec<String> {
            cidrs
                .iter()
                .filter(|c| Family::of_net(c) == family)
                .map(|c| c.to_string())
                .collect()
        };

        let mut subnet_cidrs: Vec<String> = of_family(&self.join_cidrs);
        let mut nat_cidrs = Vec::new();
        let mut distributed_gw_cidrs = Vec::new();
        for subnet in subnets {
            let cidrs = of_family(&subnet.cidrs());
            subnet_cidrs.extend(cidrs.iter().cloned());
            if subnet.spec.nat_outgoing {
                nat_cidrs.extend(cidrs.iter().cloned());
            }
            if !subnet.is_centralized_gateway() {
                distributed_gw_cidrs.extend(cidrs);
            }
        }

        let node_ips: Vec<String> = self
            .stores
            .other_node_addresses(&self.node_name)
            .into_iter()
            .filter(|ip| Family::of(ip) == family)
            .map(|ip| ip.to_string())
            .collect();

        vec![
            IpsetSpec {
                name: ipset::set_name(family, ipset::ROLE_SERVICES),
                family,
                kind: SetKind::HashNet,
                members: of_family(&self.service_cidrs),
            },
            IpsetSpec {
                name: ipset::set_name(family, ipset::ROLE_SUBNETS),
                family,
                kind: SetKind::HashNet,
                members: subnet_cidrs,
            },
            IpsetSpec {
                name: ipset::set_name(family, ipset::ROLE_SUBNETS_NAT),
                family,
                kind: SetKind::HashNet,
                members: nat_cidrs,
            },
            IpsetSpec {
                name: ipset::set_name(family, ipset::ROLE_SUBNETS_DISTRIBUTED_GW),
                family,
                kind: SetKind::HashNet,
                members: distributed_gw_cidrs,
            },
            IpsetSpec {
                name: ipset::set_name(family, ipset::ROLE_OTHER_NODES),
                family,
                kind: SetKind::HashIp,
                members: node_ips,
            },
        ]
    }

    fn prerouting_rules(&self, family: Family) -> Vec<FilterRule> {
        let services = ipset::set_name(family, ipset::ROLE_SERVICES);
        vec![FilterRule::new(TABLE_NAT, CHAIN_PREROUTING)
            .in_iface(&self.uplink)
            .match_set(&services, "dst")
            .set_mark(MARK_NAT, MARK_NAT_MASK)]
    }

    fn postrouting_rules(&self, family: Family, subnets: &[&Subnet]) -> Vec<FilterRule> {
        let subnets_set = ipset::set_name(family, ipset::ROLE_SUBNETS);
        let nat_set = ipset::set_name(family, ipset::ROLE_SUBNETS_NAT);

        let mut rules = vec![
            FilterRule::new(TABLE_NAT, CHAIN_POSTROUTING)
                .match_mark(MARK_NAT, MARK_NAT_MASK)
                .jump(CHAIN_MASQUERADE),
            FilterRule::new(TABLE_NAT, CHAIN_POSTROUTING)
                .match_set(&nat_set, "src")
                .jump(CHAIN_NAT_POLICY),
            FilterRule::new(TABLE_NAT, CHAIN_POSTROUTING)
                .match_set(&nat_set, "src")
                .not_match_set(&subnets_set, "dst")
                .jump(CHAIN_MASQUERADE),
        ];

        // centralized NAT snats through this node's address, one rule
        // per subnet whose election landed here
        let node = self.stores.node(&self.node_name);
        let node_ip = self
            .stores
            .node_internal_ips(&self.node_name)
            .into_iter()
            .find(|ip| Family::of(ip) == family);
        if let (Some(node), Some(node_ip)) = (node, node_ip) {
            for subnet in subnets {
                if !subnet.spec.nat_outgoing
                    || !subnet.is_centralized_gateway()
                    || !is_gateway_node(subnet, &node)
                {
                    continue;
                }
                for cidr in subnet.cidrs() {
                    if Family::of_net(&cidr) != family {
                        continue;
                    }
                    rules.push(
                        FilterRule::new(TABLE_NAT, CHAIN_POSTROUTING)
                            .src(cidr)
                            .not_match_set(&subnets_set, "dst")
                            .raw(["-j", "SNAT", "--to-source", &node_ip.to_string()]),
                    );
                }
            }
        }

        rules
    }

    fn nat_policy_dispatch(
        &self,
        family: Family,
        subnets: &[&Subnet],
        policy_chains: &[(String, Vec<FilterRule>)],
    ) -> Vec<FilterRule> {
        let mut rules = Vec::new();
        for subnet in subnets {
            let Some(chain) = policy::policy_chain_name(subnet) else {
                continue;
            };
            if !policy_chains.iter().any(|(c, _)| *c == chain) {
                continue;
            }
            for cidr in subnet.cidrs() {
                if Family::of_net(&cidr) != family {
                    continue;
                }
                rules.push(
                    FilterRule::new(TABLE_NAT, CHAIN_NAT_POLICY)
                        .src(cidr)
                        .jump(&chain),
                );
            }
        }
        rules
    }

    /// Probe interception for transparent-proxy-eligible pods on this
    /// node: kubelet health checks reach the pod through the proxy
    /// rather than the overlay.
    fn tproxy_rules(&self, family: Family) -> Vec<FilterRule> {
        let mut rules = Vec::new();
        for pod in self
            .stores
            .local_pods_with_annotation(&self.node_name, TPROXY_ANNOTATION, "true")
        {
            let ips: Vec<std::net::IpAddr> = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ips.as_ref())
                .map(|ips| ips.iter().filter_map(|p| p.ip.parse().ok()).collect())
                .unwrap_or_default();
            let ports = probe_ports(&pod);
            for ip in ips.into_iter().filter(|ip| Family::of(ip) == family) {
                for port in &ports {
                    rules.push(
                        FilterRule::new(TABLE_MANGLE, CHAIN_TPROXY)
                            .dst(ip)
                            .protocol("tcp")
                            .dport(*port)
                            .raw([
                                "-j",
                                "TPROXY",
                                "--on-port",
                                TPROXY_PORT,
                                "--tproxy-mark",
                                TPROXY_MARK,
                            ]),
                    );
                }
            }
        }
        rules
    }

    /// Removes the previous-generation rule layout through the other
    /// backend's binaries. Only runs once the current layout is active
    /// in nft mode; both layouts being live at once double-counts
    /// traffic. Best effort throughout.
    async fn scrub_legacy_layout(&self) {
        for fam in &self.families {
            let jump = FilterRule::new(TABLE_NAT, "POSTROUTING").jump(CHAIN_POSTROUTING);
            match fam.backend.exists(TABLE_NAT, "POSTROUTING", &jump.spec()) {
                Ok(true) => {}
                _ => continue,
            }
            let binary = match fam.family {
                Family::V4 => "iptables-legacy",
                Family::V6 => "ip6tables-legacy",
            };
            for args in [
                vec!["-t", TABLE_NAT, "-D", "POSTROUTING", "-j", CHAIN_POSTROUTING],
                vec!["-t", TABLE_NAT, "-D", "PREROUTING", "-j", CHAIN_PREROUTING],
                vec!["-t", TABLE_NAT, "-F", CHAIN_POSTROUTING],
                vec!["-t", TABLE_NAT, "-X", CHAIN_POSTROUTING],
                vec!["-t", TABLE_NAT, "-F", CHAIN_PREROUTING],
                vec!["-t", TABLE_NAT, "-X", CHAIN_PREROUTING],
                vec!["-t", TABLE_NAT, "-F", CHAIN_MASQUERADE],
                vec!["-t", TABLE_NAT, "-X", CHAIN_MASQUERADE],
            ] {
                match tokio::process::Command::new(binary).args(&args).output().await {
                    Ok(output) if output.status.success() => {
                        debug!(binary, ?args, "removed legacy layout entry");
                    }
                    // rules that were never there or a missing legacy
                    // binary are both fine
                    _ => {}
                }
            }
        }
    }
}

fn probe_ports(pod: &Pod) -> Vec<u16> {
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    let mut ports = Vec::new();
    let Some(spec) = pod.spec.as_ref() else {
        return ports;
    };
    for container in &spec.containers {
        for probe in [
            container.liveness_probe.as_ref(),
            container.readiness_probe.as_ref(),
            container.startup_probe.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            let port = probe
                .http_get
                .as_ref()
                .map(|h| &h.port)
                .or_else(|| probe.tcp_socket.as_ref().map(|t| &t.port));
            if let Some(IntOrString::Int(port)) = port {
                match u16::try_from(*port) {
                    Ok(port) => ports.push(port),
                    Err(_) => warn!(port, "ignoring out of range probe port"),
                }
            }
        }
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, HTTPGetAction, PodSpec, Probe};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use super::*;

    #[test]
    fn test_probe_ports_deduplicated() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    liveness_probe: Some(Probe {
                        http_get: Some(HTTPGetAction {
                            port: IntOrString::Int(8080),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    readiness_probe: Some(Probe {
                        http_get: Some(HTTPGetAction {
                            port: IntOrString::Int(8080),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(probe_ports(&pod), vec![8080]);
    }

    #[test]
    fn test_named_probe_ports_ignored() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    liveness_probe: Some(Probe {
                        http_get: Some(HTTPGetAction {
                            port: IntOrString::String("health".into()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(probe_ports(&pod).is_empty());
    }
}
