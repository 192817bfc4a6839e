use std::collections::HashSet;
use std::net::IpAddr;

use fabric_cni_crds::v1alpha1::subnet::NatOutgoingPolicyRuleStatus;
use fabric_cni_crds::v1alpha1::{NatPolicyAction, Subnet};
use ipnetwork::IpNetwork;
use kube::ResourceExt;
use tracing::warn;

use super::backend::PacketFilterBackend;
use super::chains::FilterRule;
use super::{CHAIN_MASQUERADE, TABLE_NAT};
use crate::ipset::{set_prefix, IpsetSpec, SetKind};
use crate::routes::Family;

/// Reserved prefix of per-subnet NAT policy chains; the suffix is the
/// truncated owner id used for garbage collection.
pub const POLICY_CHAIN_PREFIX: &str = "FAB-NAT-PST-";

const ID_LEN: usize = 12;

/// Deterministic chain name from the subnet's unique id, so rule
/// content changes reuse the chain and only subnet disappearance
/// removes it.
pub fn policy_chain_name(subnet: &Subnet) -> Option<String> {
    let uid = subnet.metadata.uid.as_deref()?;
    let id: String = uid
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(ID_LEN)
        .collect::<String>()
        .to_uppercase();
    if id.is_empty() {
        return None;
    }
    Some(format!("{POLICY_CHAIN_PREFIX}{id}"))
}

fn truncated_rule_id(rule_id: &str) -> String {
    rule_id.chars().take(ID_LEN).collect()
}

pub fn rule_set_name(family: Family, rule_id: &str, direction: &str) -> String {
    format!(
        "{}natpr-{}-{}",
        set_prefix(family),
        truncated_rule_id(rule_id),
        direction
    )
}

enum MatchFamilies {
    Empty,
    Single(Family),
    Mixed,
}

fn classify_match(ips: &str) -> MatchFamilies {
    let mut families = HashSet::new();
    for entry in ips.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let family = entry
            .parse::<IpNetwork>()
            .map(|n| Family::of_net(&n))
            .or_else(|_| entry.parse::<IpAddr>().map(|ip| Family::of(&ip)));
        match family {
            Ok(f) => {
                families.insert(f);
            }
            Err(_) => return MatchFamilies::Mixed,
        }
    }
    match (families.contains(&Family::V4), families.contains(&Family::V6)) {
        (false, false) => MatchFamilies::Empty,
        (true, false) => MatchFamilies::Single(Family::V4),
        (false, true) => MatchFamilies::Single(Family::V6),
        (true, true) => MatchFamilies::Mixed,
    }
}

/// Family a policy rule belongs to, validated across both match sides.
/// `Ok(None)` means the rule is family-agnostic; `Err` marks a rule
/// whose matches disagree, which must not be keyed into either
/// family's classifier sets.
fn rule_family(rule: &NatOutgoingPolicyRuleStatus) -> Result<Option<Family>, ()> {
    let src = classify_match(&rule.rule_match.src_ips);
    let dst = classify_match(&rule.rule_match.dst_ips);
    match (src, dst) {
        (MatchFamilies::Mixed, _) | (_, MatchFamilies::Mixed) => Err(()),
        (MatchFamilies::Empty, MatchFamilies::Empty) => Ok(None),
        (MatchFamilies::Single(f), MatchFamilies::Empty) => Ok(Some(f)),
        (MatchFamilies::Empty, MatchFamilies::Single(f)) => Ok(Some(f)),
        (MatchFamilies::Single(s), MatchFamilies::Single(d)) if s == d => Ok(Some(s)),
        _ => Err(()),
    }
}

/// Ordered rules of one subnet's policy chain for one family, plus the
/// per-rule classifier sets those rules reference.
pub fn policy_chain_state(
    family: Family,
    subnet: &Subnet,
    chain: &str,
) -> (Vec<FilterRule>, Vec<IpsetSpec>) {
    let mut rules = Vec::new();
    let mut sets = Vec::new();

    let Some(status) = subnet.status.as_ref() else {
        return (rules, sets);
    };

    for policy_rule in &status.nat_outgoing_policy_rules {
        match rule_family(policy_rule) {
            Err(()) => {
                warn!(
                    subnet = %subnet.name_any(),
                    rule_id = %policy_rule.rule_id,
                    "policy rule mixes address families, skipping"
                );
                continue;
            }
            Ok(Some(f)) if f != family => continue,
            Ok(_) => {}
        }

        let mut rule = FilterRule::new(TABLE_NAT, chain);
        if !policy_rule.rule_match.src_ips.is_empty() {
            let set = rule_set_name(family, &policy_rule.rule_id, "src");
            sets.push(IpsetSpec {
                name: set.clone(),
                family,
                kind: SetKind::HashNet,
                members: members_of(&policy_rule.rule_match.src_ips),
            });
            rule = rule.match_set(&set, "src");
        }
        if !policy_rule.rule_match.dst_ips.is_empty() {
            let set = rule_set_name(family, &policy_rule.rule_id, "dst");
            sets.push(IpsetSpec {
                name: set.clone(),
                family,
                kind: SetKind::HashNet,
                members: members_of(&policy_rule.rule_match.dst_ips),
            });
            rule = rule.match_set(&set, "dst");
        }
        rule = match policy_rule.action {
            NatPolicyAction::Nat => rule.jump(CHAIN_MASQUERADE),
            NatPolicyAction::Forward => rule.jump("RETURN"),
        };
        rules.push(rule);
    }

    (rules, sets)
}

fn members_of(ips: &str) -> Vec<String> {
    ips.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

/// Live rule ids of a subnet's status, for classifier-set GC.
pub fn live_rule_ids(subnet: &Subnet) -> Vec<String> {
    subnet
        .status
        .as_ref()
        .map(|s| {
            s.nat_outgoing_policy_rules
                .iter()
                .map(|r| truncated_rule_id(&r.rule_id))
                .collect()
        })
        .unwrap_or_default()
}

/// Deletes policy chains carrying the reserved prefix whose owner id is
/// no longer expected. Deletion failures are logged and skipped; the
/// next pass retries.
pub fn gc_policy_chains(
    backend: &dyn PacketFilterBackend,
    expected: &HashSet<String>,
) {
    let chains = match backend.list_chains(TABLE_NAT) {
        Ok(chains) => chains,
        Err(e) => {
            warn!(%e, "failed to list chains for policy chain gc");
            return;
        }
    };
    for chain in chains {
        if !chain.starts_with(POLICY_CHAIN_PREFIX) || expected.contains(&chain) {
            continue;
        }
        if let Err(e) = backend.delete_chain(TABLE_NAT, &chain) {
            warn!(%e, chain = %chain, "failed to delete orphaned policy chain");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use fabric_cni_crds::v1alpha1::subnet::{NatPolicyMatch, SubnetStatus};
    use fabric_cni_crds::v1alpha1::SubnetSpec;
    use kube::api::ObjectMeta;

    use super::super::chains::tests::FakeFilter;
    use super::*;

    fn make_subnet(rules: Vec<NatOutgoingPolicyRuleStatus>) -> Subnet {
        let mut subnet = Subnet::new(
            "ovn-default",
            SubnetSpec {
                cidr_block: "10.16.0.0/16".into(),
                ..Default::default()
            },
        );
        subnet.metadata = ObjectMeta {
            name: Some("ovn-default".into()),
            uid: Some("8f14e45f-ceea-467f-a8d9-9f5f2f3c1a77".into()),
            ..Default::default()
        };
        subnet.status = Some(SubnetStatus {
            ready: true,
            nat_outgoing_policy_rules: rules,
            ..Default::default()
        });
        subnet
    }

    fn policy_rule(id: &str, src: &str, dst: &str, action: NatPolicyAction) -> NatOutgoingPolicyRuleStatus {
        NatOutgoingPolicyRuleStatus {
            rule_match: NatPolicyMatch {
                src_ips: src.into(),
                dst_ips: dst.into(),
            },
            action,
            rule_id: id.into(),
        }
    }

    #[test]
    fn test_chain_name_deterministic_and_truncated() {
        let subnet = make_subnet(vec![]);
        let name = policy_chain_name(&subnet).unwrap();
        assert_eq!(name, "FAB-NAT-PST-8F14E45FCEEA");
        assert_eq!(policy_chain_name(&subnet).unwrap(), name);
    }

    #[test]
    fn test_rules_built_in_order_with_sets() {
        let subnet = make_subnet(vec![
            policy_rule("aaaabbbbcccc", "10.16.0.0/24", "", NatPolicyAction::Forward),
            policy_rule("ddddeeeeffff", "10.16.1.0/24", "8.8.8.0/24", NatPolicyAction::Nat),
        ]);
        let (rules, sets) = policy_chain_state(Family::V4, &subnet, "FAB-NAT-PST-X");
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules[0].spec(),
            "-m set --match-set fab4-natpr-aaaabbbbcccc-src src -j RETURN"
        );
        assert_eq!(
            rules[1].spec(),
            "-m set --match-set fab4-natpr-ddddeeeeffff-src src \
             -m set --match-set fab4-natpr-ddddeeeeffff-dst dst -j FAB-MASQUERADE"
        );
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0].members, vec!["10.16.0.0/24"]);
    }

    #[test]
    fn test_other_family_rule_excluded() {
        let subnet = make_subnet(vec![policy_rule(
            "aaaabbbbcccc",
            "fd00::/64",
            "",
            NatPolicyAction::Nat,
        )]);
        let (rules, sets) = policy_chain_state(Family::V4, &subnet, "X");
        assert!(rules.is_empty());
        assert!(sets.is_empty());

        let (rules, _) = policy_chain_state(Family::V6, &subnet, "X");
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_mixed_family_rule_rejected_everywhere() {
        // src is v4 while dst is v6: keyed to neither family
        let subnet = make_subnet(vec![policy_rule(
            "aaaabbbbcccc",
            "10.16.0.0/24",
            "fd00::/64",
            NatPolicyAction::Nat,
        )]);
        let (v4_rules, _) = policy_chain_state(Family::V4, &subnet, "X");
        let (v6_rules, _) = policy_chain_state(Family::V6, &subnet, "X");
        assert!(v4_rules.is_empty());
        assert!(v6_rules.is_empty());
    }

    #[test]
    fn test_matchless_rule_applies_to_both_families() {
        let subnet = make_subnet(vec![policy_rule(
            "aaaabbbbcccc",
            "",
            "",
            NatPolicyAction::Forward,
        )]);
        let (v4_rules, v4_sets) = policy_chain_state(Family::V4, &subnet, "X");
        let (v6_rules, _) = policy_chain_state(Family::V6, &subnet, "X");
        assert_eq!(v4_rules[0].spec(), "-j RETURN");
        assert_eq!(v6_rules.len(), 1);
        assert!(v4_sets.is_empty());
    }

    #[test]
    fn test_gc_removes_only_orphaned_prefixed_chains() {
        let fake = FakeFilter::default()
            .with_chain(TABLE_NAT, "FAB-NAT-PST-DEAD00000000", &["-j RETURN"])
            .with_chain(TABLE_NAT, "FAB-NAT-PST-LIVE00000000", &["-j RETURN"])
            .with_chain(TABLE_NAT, "KUBE-POSTROUTING", &["-j RETURN"]);

        let expected: HashSet<String> = ["FAB-NAT-PST-LIVE00000000".to_string()].into();
        gc_policy_chains(&fake, &expected);

        let chains = fake.list_chains(TABLE_NAT).unwrap();
        assert!(chains.contains(&"FAB-NAT-PST-LIVE00000000".to_string()));
        assert!(chains.contains(&"KUBE-POSTROUTING".to_string()));
        assert!(!chains.contains(&"FAB-NAT-PST-DEAD00000000".to_string()));
    }
}
