use std::collections::HashMap;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

/// Address family of a route, rule or classifier set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Family {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn of_net(net: &IpNetwork) -> Family {
        match net {
            IpNetwork::V4(_) => Family::V4,
            IpNetwork::V6(_) => Family::V6,
        }
    }
}

pub const MAIN_TABLE: u32 = 254;

/// One kernel route as the reconciler sees it. Transient: rebuilt from
/// cluster state on every cycle, compared against a kernel dump.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Route {
    pub destination: IpNetwork,
    pub source: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub table: u32,
    pub link_index: u32,
}

/// One policy routing rule. Two rules are the same rule iff family,
/// table, priority and source all match; comparing any subset lets
/// stale rules survive a resync.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PolicyRule {
    pub family: Family,
    pub src: Option<IpNetwork>,
    pub table: u32,
    pub priority: u32,
}

#[derive(Default, Debug)]
pub struct RouteDiff {
    pub to_add: Vec<Route>,
    pub to_del: Vec<Route>,
}

#[derive(Default, Debug)]
pub struct RuleDiff {
    pub to_add: Vec<PolicyRule>,
    pub to_del: Vec<PolicyRule>,
}

pub fn is_link_local(net: &IpNetwork) -> bool {
    match net {
        IpNetwork::V4(n) => n.ip().is_link_local(),
        IpNetwork::V6(n) => (n.ip().segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Computes the route delta for the uplink interface.
///
/// An existing route is kept when its destination is desired and, for
/// non-join destinations, its source matches the expected per-family
/// source. Join destinations match on destination alone. A desired
/// destination held by a different link is a conflict and is always
/// deleted. Link-local destinations are never touched in either
/// direction.
pub fn diff_routes(
    existing: &[Route],
    desired: &[Route],
    uplink_index: u32,
    join_cidrs: &[IpNetwork],
    expected_src: &HashMap<Family, IpAddr>,
) -> RouteDiff {
    let desired_keys: Vec<(u32, IpNetwork)> =
        desired.iter().map(|r| (r.table, r.destination)).collect();

    let mut diff = RouteDiff::default();
    let mut kept: Vec<(u32, IpNetwork)> = Vec::new();

    for route in existing {
        if is_link_local(&route.destination) {
            continue;
        }
        if !desired_keys.contains(&(route.table, route.destination)) {
            diff.to_del.push(route.clone());
            continue;
        }
        if route.link_index != uplink_index {
            // desired destination held by another link: conflict
            diff.to_del.push(route.clone());
            continue;
        }
        if join_cidrs.contains(&route.destination) {
            kept.push((route.table, route.destination));
            continue;
        }
        let family = Family::of_net(&route.destination);
        if route.source == expected_src.get(&family).copied() {
            kept.push((route.table, route.destination));
        } else {
            diff.to_del.push(route.clone());
        }
    }

    for route in desired {
        if is_link_local(&route.destination) {
            continue;
        }
        if !kept.contains(&(route.table, route.destination)) {
            diff.to_add.push(route.clone());
        }
    }

    diff
}

/// Set difference over the full four-field rule identity.
pub fn diff_rules(existing: &[PolicyRule], desired: &[PolicyRule]) -> RuleDiff {
    RuleDiff {
        to_add: desired
            .iter()
            .filter(|r| !existing.contains(r))
            .cloned()
            .collect(),
        to_del: existing
            .iter()
            .filter(|r| !desired.contains(r))
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPLINK: u32 = 7;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn route(dst: &str, src: Option<&str>, link: u32) -> Route {
        Route {
            destination: net(dst),
            source: src.map(|s| s.parse().unwrap()),
            gateway: None,
            table: MAIN_TABLE,
            link_index: link,
        }
    }

    fn node_src() -> HashMap<Family, IpAddr> {
        let mut src = HashMap::new();
        src.insert(Family::V4, "10.16.0.2".parse().unwrap());
        src
    }

    #[test]
    fn test_add_and_delete_disjoint() {
        let existing = vec![
            route("10.0.0.0/16", Some("10.16.0.2"), UPLINK),
            route("10.2.0.0/16", Some("10.16.0.2"), UPLINK),
        ];
        let desired = vec![
            route("10.0.0.0/16", Some("10.16.0.2"), UPLINK),
            route("10.1.0.0/16", Some("10.16.0.2"), UPLINK),
        ];
        let diff = diff_routes(&existing, &desired, UPLINK, &[], &node_src());
        assert_eq!(diff.to_add.len(), 1);
        assert_eq!(diff.to_add[0].destination, net("10.1.0.0/16"));
        assert_eq!(diff.to_del.len(), 1);
        assert_eq!(diff.to_del[0].destination, net("10.2.0.0/16"));
    }

    #[test]
    fn test_source_mismatch_replaces_route() {
        let existing = vec![route("10.0.0.0/16", Some("10.16.0.99"), UPLINK)];
        let desired = vec![route("10.0.0.0/16", Some("10.16.0.2"), UPLINK)];
        let diff = diff_routes(&existing, &desired, UPLINK, &[], &node_src());
        assert_eq!(diff.to_del.len(), 1);
        assert_eq!(diff.to_add.len(), 1);
    }

    #[test]
    fn test_join_route_matches_on_destination_only() {
        let join = net("100.64.0.0/16");
        let existing = vec![route("100.64.0.0/16", Some("100.64.0.2"), UPLINK)];
        let desired = vec![route("100.64.0.0/16", None, UPLINK)];
        let diff = diff_routes(&existing, &desired, UPLINK, &[join], &node_src());
        assert!(diff.to_add.is_empty());
        assert!(diff.to_del.is_empty());
    }

    #[test]
    fn test_link_conflict_always_deleted() {
        let existing = vec![route("10.0.0.0/16", Some("10.16.0.2"), 3)];
        let desired = vec![route("10.0.0.0/16", Some("10.16.0.2"), UPLINK)];
        let diff = diff_routes(&existing, &desired, UPLINK, &[], &node_src());
        assert_eq!(diff.to_del.len(), 1);
        assert_eq!(diff.to_del[0].link_index, 3);
        assert_eq!(diff.to_add.len(), 1);
    }

    #[test]
    fn test_link_local_skipped() {
        let existing = vec![route("169.254.0.0/16", None, UPLINK)];
        let desired = vec![route("10.0.0.0/16", Some("10.16.0.2"), UPLINK)];
        let diff = diff_routes(&existing, &desired, UPLINK, &[], &node_src());
        assert_eq!(diff.to_del.len(), 0);
        assert_eq!(diff.to_add.len(), 1);

        let existing = vec![];
        let desired = vec![route("fe80::/10", None, UPLINK)];
        let diff = diff_routes(&existing, &desired, UPLINK, &[], &HashMap::new());
        assert!(diff.to_add.is_empty());
    }

    #[test]
    fn test_idempotent_second_pass() {
        let desired = vec![
            route("10.0.0.0/16", Some("10.16.0.2"), UPLINK),
            route("10.1.0.0/16", Some("10.16.0.2"), UPLINK),
        ];
        let diff = diff_routes(&desired, &desired, UPLINK, &[], &node_src());
        assert!(diff.to_add.is_empty());
        assert!(diff.to_del.is_empty());
    }

    fn rule(src: Option<&str>, table: u32, priority: u32) -> PolicyRule {
        PolicyRule {
            family: Family::V4,
            src: src.map(|s| s.parse().unwrap()),
            table,
            priority,
        }
    }

    #[test]
    fn test_rule_diff_full_identity() {
        // same src and table, different priority: still a different rule
        let existing = vec![rule(Some("10.16.0.5/32"), 100, 2000)];
        let desired = vec![rule(Some("10.16.0.5/32"), 100, 2001)];
        let diff = diff_rules(&existing, &desired);
        assert_eq!(diff.to_add.len(), 1);
        assert_eq!(diff.to_del.len(), 1);
    }

    #[test]
    fn test_rule_diff_completeness() {
        let existing = vec![
            rule(Some("10.16.0.5/32"), 100, 2000),
            rule(Some("10.16.0.6/32"), 100, 2000),
        ];
        let desired = vec![
            rule(Some("10.16.0.6/32"), 100, 2000),
            rule(Some("10.16.0.7/32"), 100, 2000),
        ];
        let diff = diff_rules(&existing, &desired);

        // existing \ to_del ∪ to_add == desired
        let mut result: Vec<PolicyRule> = existing
            .iter()
            .filter(|r| !diff.to_del.contains(r))
            .cloned()
            .collect();
        result.extend(diff.to_add.clone());
        assert_eq!(result, desired);
    }
}
