use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::route::Nla as RouteNla;
use netlink_packet_route::rule::Nla as RuleNla;
use netlink_packet_route::{RouteMessage, RuleMessage, AF_INET, AF_INET6};
use rtnetlink::{Handle, IpVersion};
use tracing::debug;

use crate::routes::diff::{Family, PolicyRule, Route, MAIN_TABLE};
use crate::{Error, Result};

/// FR_ACT_TO_TBL: rule action that resolves via the rule's table.
const RULE_ACTION_LOOKUP: u8 = 1;
/// IFLA_MACVLAN_MODE bridge mode.
const MACVLAN_MODE_BRIDGE: u32 = 4;
const ENOENT: i32 = 2;
const EEXIST: i32 = 17;

/// Thin wrapper over an rtnetlink handle. Parsing and message
/// construction live here so the reconcilers only ever see [`Route`]
/// and [`PolicyRule`] values.
#[derive(Clone)]
pub struct NetlinkClient {
    handle: Handle,
}

/// A kernel route together with the message it was parsed from, kept
/// for deletion without re-deriving netlink attributes.
pub struct KernelRoute {
    pub route: Route,
    pub msg: RouteMessage,
}

pub struct KernelRule {
    pub rule: PolicyRule,
    pub msg: RuleMessage,
}

impl NetlinkClient {
    pub fn try_new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    pub async fn link_index(&self, name: &str) -> Result<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            _ => Err(Error::LinkNotFound { name: name.into() }),
        }
    }

    pub async fn list_routes(&self) -> Result<Vec<KernelRoute>> {
        let mut out = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            let mut stream = self.handle.route().get(version).execute();
            while let Some(msg) = stream.try_next().await? {
                if let Some(route) = parse_route(&msg) {
                    out.push(KernelRoute { route, msg });
                }
            }
        }
        Ok(out)
    }

    /// Idempotent upsert of a route.
    pub async fn replace_route(&self, route: &Route) -> Result<()> {
        debug!(?route, "replacing route");
        match route.destination {
            IpNetwork::V4(net) => {
                let mut req = self
                    .handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(net.ip(), net.prefix())
                    .output_interface(route.link_index);
                if let Some(IpAddr::V4(gw)) = route.gateway {
                    req = req.gateway(gw);
                }
                if let Some(IpAddr::V4(src)) = route.source {
                    req.message_mut()
                        .nlas
                        .push(RouteNla::PrefSource(src.octets().to_vec()));
                }
                set_route_table(req.message_mut(), route.table);
                req.replace().execute().await?;
            }
            IpNetwork::V6(net) => {
                let mut req = self
                    .handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(net.ip(), net.prefix())
                    .output_interface(route.link_index);
                if let Some(IpAddr::V6(gw)) = route.gateway {
                    req = req.gateway(gw);
                }
                if let Some(IpAddr::V6(src)) = route.source {
                    req.message_mut()
                        .nlas
                        .push(RouteNla::PrefSource(src.octets().to_vec()));
                }
                set_route_table(req.message_mut(), route.table);
                req.replace().execute().await?;
            }
        }
        Ok(())
    }

    /// Deletes a previously listed route. Not-found is success.
    pub async fn del_route(&self, kernel: &KernelRoute) -> Result<()> {
        debug!(route = ?kernel.route, "deleting route");
        ignore_not_found(self.handle.route().del(kernel.msg.clone()).execute().await)?;
        Ok(())
    }

    pub async fn list_rules(&self) -> Result<Vec<KernelRule>> {
        let mut out = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            let mut stream = self.handle.rule().get(version.clone()).execute();
            while let Some(msg) = stream.try_next().await? {
                if let Some(rule) = parse_rule(&msg) {
                    out.push(KernelRule { rule, msg });
                }
            }
        }
        Ok(out)
    }

    pub async fn add_rule(&self, rule: &PolicyRule) -> Result<()> {
        debug!(?rule, "adding policy rule");
        let mut req = match rule.family {
            Family::V4 => self.handle.rule().add().v4(),
            Family::V6 => self.handle.rule().add().v6(),
        }
        .table_id(rule.table)
        .priority(rule.priority)
        .action(RULE_ACTION_LOOKUP);
        if let Some(src) = rule.src {
            let msg = req.message_mut();
            msg.header.src_len = src.prefix();
            msg.nlas.push(RuleNla::Source(ip_octets(&src.ip())));
        }
        // adding an already present rule is not an error worth surfacing
        match req.execute().await {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(ref e)) if e.code.abs() == EEXIST => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a previously listed rule. Not-found is success.
    pub async fn del_rule(&self, kernel: &KernelRule) -> Result<()> {
        debug!(rule = ?kernel.rule, "deleting policy rule");
        ignore_not_found(self.handle.rule().del(kernel.msg.clone()).execute().await)?;
        Ok(())
    }

    /// Ensures a macvlan sub-interface of `master` exists and is up,
    /// returning its link index.
    pub async fn ensure_macvlan(&self, name: &str, master: &str) -> Result<u32> {
        if let Ok(index) = self.link_index(name).await {
            self.handle.link().set(index).up().execute().await?;
            return Ok(index);
        }
        let master_index = self.link_index(master).await?;
        self.handle
            .link()
            .add()
            .macvlan(name.to_string(), master_index, MACVLAN_MODE_BRIDGE)
            .execute()
            .await?;
        let index = self.link_index(name).await?;
        self.handle.link().set(index).up().execute().await?;
        Ok(index)
    }

    /// Deletes a link by name. Not-found is success.
    pub async fn del_link(&self, name: &str) -> Result<()> {
        let index = match self.link_index(name).await {
            Ok(index) => index,
            Err(Error::LinkNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        ignore_not_found(self.handle.link().del(index).execute().await)?;
        Ok(())
    }

    /// Installs a host-scoped route for `ip` through the given link,
    /// replacing whatever route previously claimed the destination.
    pub async fn replace_host_route(&self, ip: Ipv4Addr, link_index: u32) -> Result<()> {
        let route = Route {
            destination: IpNetwork::V4(ipnetwork::Ipv4Network::new(ip, 32)?),
            source: None,
            gateway: None,
            table: MAIN_TABLE,
            link_index,
        };
        self.replace_route(&route).await
    }

    /// Removes the host route for `ip` if one exists.
    pub async fn del_host_route(&self, ip: Ipv4Addr) -> Result<()> {
        let target = IpNetwork::V4(ipnetwork::Ipv4Network::new(ip, 32)?);
        for kernel in self.list_routes().await? {
            if kernel.route.destination == target && kernel.route.table == MAIN_TABLE {
                self.del_route(&kernel).await?;
            }
        }
        Ok(())
    }
}

fn set_route_table(msg: &mut RouteMessage, table: u32) {
    if table > u8::MAX as u32 {
        msg.header.table = 0;
        msg.nlas.push(RouteNla::Table(table));
    } else {
        msg.header.table = table as u8;
    }
}

fn ignore_not_found(res: Result<(), rtnetlink::Error>) -> Result<(), rtnetlink::Error> {
    match res {
        Err(rtnetlink::Error::NetlinkError(ref e)) if e.code.abs() == ENOENT => Ok(()),
        other => other,
    }
}

fn ip_octets(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn ip_from_octets(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(octets.into()))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(octets.into()))
        }
        _ => None,
    }
}

fn parse_route(msg: &RouteMessage) -> Option<Route> {
    let prefix = msg.header.destination_prefix_length;
    let mut destination = None;
    let mut source = None;
    let mut gateway = None;
    let mut link_index = 0;
    let mut table = msg.header.table as u32;

    for nla in &msg.nlas {
        match nla {
            RouteNla::Destination(bytes) => {
                destination = ip_from_octets(bytes)
                    .and_then(|ip| IpNetwork::new(ip, prefix).ok());
            }
            RouteNla::PrefSource(bytes) => source = ip_from_octets(bytes),
            RouteNla::Gateway(bytes) => gateway = ip_from_octets(bytes),
            RouteNla::Oif(index) => link_index = *index,
            RouteNla::Table(t) => table = *t,
            _ => {}
        }
    }

    // a default route has no destination attribute
    let destination = match destination {
        Some(d) => d,
        None if prefix == 0 => {
            let ip = match msg.header.address_family as u16 {
                AF_INET => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                AF_INET6 => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                _ => return None,
            };
            IpNetwork::new(ip, 0).ok()?
        }
        None => return None,
    };

    Some(Route {
        destination,
        source,
        gateway,
        table,
        link_index,
    })
}

fn parse_rule(msg: &RuleMessage) -> Option<PolicyRule> {
    let family = match msg.header.family as u16 {
        AF_INET => Family::V4,
        AF_INET6 => Family::V6,
        _ => return None,
    };
    let mut table = msg.header.table as u32;
    let mut priority = 0;
    let mut src = None;

    for nla in &msg.nlas {
        match nla {
            RuleNla::Table(t) => table = *t,
            RuleNla::Priority(p) => priority = *p,
            RuleNla::Source(bytes) => {
                src = ip_from_octets(bytes)
                    .and_then(|ip| IpNetwork::new(ip, msg.header.src_len).ok());
            }
            _ => {}
        }
    }

    Some(PolicyRule {
        family,
        src,
        table,
        priority,
    })
}
