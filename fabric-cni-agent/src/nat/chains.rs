use tracing::{debug, warn};

use super::backend::PacketFilterBackend;
use crate::Result;

/// One desired packet-filter rule. Policy logic builds these through
/// the typed methods; the flat argument vector only materializes at
/// the backend boundary via [`FilterRule::spec`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FilterRule {
    pub table: &'static str,
    pub chain: String,
    args: Vec<String>,
}

impl FilterRule {
    pub fn new(table: &'static str, chain: impl Into<String>) -> Self {
        Self {
            table,
            chain: chain.into(),
            args: Vec::new(),
        }
    }

    pub fn src(self, cidr: impl std::fmt::Display) -> Self {
        self.raw(["-s", &cidr.to_string()])
    }

    pub fn dst(self, cidr: impl std::fmt::Display) -> Self {
        self.raw(["-d", &cidr.to_string()])
    }

    pub fn in_iface(self, iface: &str) -> Self {
        self.raw(["-i", iface])
    }

    pub fn protocol(self, proto: &str) -> Self {
        self.raw(["-p", proto])
    }

    pub fn dport(self, port: u16) -> Self {
        self.raw(["--dport", &port.to_string()])
    }

    pub fn match_set(self, set: &str, direction: &str) -> Self {
        self.raw(["-m", "set", "--match-set", set, direction])
    }

    pub fn not_match_set(self, set: &str, direction: &str) -> Self {
        self.raw(["-m", "set", "!", "--match-set", set, direction])
    }

    pub fn match_mark(self, mark: u32, mask: u32) -> Self {
        self.raw(["-m", "mark", "--mark", &format!("{mark:#x}/{mask:#x}")])
    }

    pub fn set_mark(self, mark: u32, mask: u32) -> Self {
        self.raw(["-j", "MARK", "--set-xmark", &format!("{mark:#x}/{mask:#x}")])
    }

    pub fn jump(self, target: &str) -> Self {
        self.raw(["-j", target])
    }

    pub fn raw<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn spec(&self) -> String {
        self.args.join(" ")
    }
}

/// Forces a managed chain to hold exactly `desired`, in order.
///
/// Walks the chain position by position. A position already holding the
/// desired rule costs nothing. A position holding a rule that is still
/// wanted further down gets the desired rule inserted above it; a
/// position holding a stale rule is overwritten in place. Whatever
/// trails the desired list afterwards is deleted from the tail
/// backward. Any insert/replace failure aborts immediately: applying a
/// chain out of order can open a transient accept-all or drop-all
/// window.
pub fn reconcile_chain_rules(
    backend: &dyn PacketFilterBackend,
    table: &str,
    chain: &str,
    desired: &[FilterRule],
) -> Result<()> {
    backend.ensure_chain(table, chain)?;
    let mut existing = backend.list_rules(table, chain)?;

    for (i, rule) in desired.iter().enumerate() {
        let spec = rule.spec();
        match existing.get(i) {
            Some(current) if *current == spec => {}
            Some(current) => {
                let wanted_later = desired[i + 1..].iter().any(|d| d.spec() == *current);
                if wanted_later {
                    debug!(table, chain, pos = i + 1, rule = %spec, "inserting rule");
                    backend.insert(table, chain, &spec, i + 1)?;
                    existing.insert(i, spec);
                } else {
                    debug!(table, chain, pos = i + 1, rule = %spec, "replacing rule");
                    backend.replace(table, chain, &spec, i + 1)?;
                    existing[i] = spec;
                }
            }
            None => {
                debug!(table, chain, rule = %spec, "appending rule");
                backend.append(table, chain, &spec)?;
                existing.push(spec);
            }
        }
    }

    for spec in existing.split_off(desired.len()).iter().rev() {
        backend.delete(table, chain, spec)?;
    }
    Ok(())
}

/// Ensures a jump from a built-in chain exists, inserting at the head
/// when missing. Built-in chains are shared with unrelated rules, so
/// they are never positionally reconciled.
pub fn ensure_jump_at_head(
    backend: &dyn PacketFilterBackend,
    rule: &FilterRule,
) -> Result<()> {
    let spec = rule.spec();
    if backend.exists(rule.table, &rule.chain, &spec)? {
        return Ok(());
    }
    backend.insert(rule.table, &rule.chain, &spec, 1)
}

/// Keeps `rule` ranked above the first rule containing `below_marker`
/// in a shared chain, pruning duplicate copies of `rule` so only the
/// highest occurrence survives.
pub fn ensure_rule_above(
    backend: &dyn PacketFilterBackend,
    table: &str,
    chain: &str,
    rule: &FilterRule,
    below_marker: &str,
) -> Result<()> {
    let spec = rule.spec();
    let existing = backend.list_rules(table, chain)?;

    let copies = existing.iter().filter(|r| **r == spec).count();
    let our_pos = existing.iter().position(|r| *r == spec);
    let marker_pos = existing.iter().position(|r| r.contains(below_marker));

    let ranked_ok = match (our_pos, marker_pos) {
        (Some(ours), Some(marker)) => ours < marker,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if copies == 1 && ranked_ok {
        return Ok(());
    }

    if copies > 1 {
        warn!(table, chain, copies, rule = %spec, "pruning duplicate rule copies");
    }
    // delete-by-spec removes the first match, so repositioning has to
    // drop every copy before re-inserting the single surviving one
    for _ in 0..copies {
        backend.delete(table, chain, &spec)?;
    }
    backend.insert(table, chain, &spec, 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::Result;

    #[derive(Clone, PartialEq, Eq, Debug)]
    pub enum Op {
        Insert(String, usize),
        Replace(String, usize),
        Append(String),
        Delete(String),
    }

    /// In-memory packet filter recording every mutation.
    #[derive(Default)]
    pub struct FakeFilter {
        pub chains: Mutex<HashMap<(String, String), Vec<String>>>,
        pub ops: Mutex<Vec<Op>>,
    }

    impl FakeFilter {
        pub fn with_chain(self, table: &str, chain: &str, rules: &[&str]) -> Self {
            self.chains.lock().unwrap().insert(
                (table.into(), chain.into()),
                rules.iter().map(|r| r.to_string()).collect(),
            );
            self
        }

        pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
            self.chains
                .lock()
                .unwrap()
                .get(&(table.into(), chain.into()))
                .cloned()
                .unwrap_or_default()
        }

        pub fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }
    }

    impl PacketFilterBackend for FakeFilter {
        fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>> {
            Ok(self.rules(table, chain))
        }

        fn insert(&self, table: &str, chain: &str, rule: &str, pos: usize) -> Result<()> {
            let mut chains = self.chains.lock().unwrap();
            let rules = chains.entry((table.into(), chain.into())).or_default();
            rules.insert((pos - 1).min(rules.len()), rule.into());
            self.ops
                .lock()
                .unwrap()
                .push(Op::Insert(rule.into(), pos));
            Ok(())
        }

        fn replace(&self, table: &str, chain: &str, rule: &str, pos: usize) -> Result<()> {
            let mut chains = self.chains.lock().unwrap();
            let rules = chains.entry((table.into(), chain.into())).or_default();
            rules[pos - 1] = rule.into();
            self.ops
                .lock()
                .unwrap()
                .push(Op::Replace(rule.into(), pos));
            Ok(())
        }

        fn append(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
            let mut chains = self.chains.lock().unwrap();
            chains
                .entry((table.into(), chain.into()))
                .or_default()
                .push(rule.into());
            self.ops.lock().unwrap().push(Op::Append(rule.into()));
            Ok(())
        }

        fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
            let mut chains = self.chains.lock().unwrap();
            if let Some(rules) = chains.get_mut(&(table.into(), chain.into())) {
                if let Some(pos) = rules.iter().position(|r| r == rule) {
                    rules.remove(pos);
                    self.ops.lock().unwrap().push(Op::Delete(rule.into()));
                }
            }
            Ok(())
        }

        fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool> {
            Ok(self.rules(table, chain).iter().any(|r| r == rule))
        }

        fn ensure_chain(&self, table: &str, chain: &str) -> Result<()> {
            self.chains
                .lock()
                .unwrap()
                .entry((table.into(), chain.into()))
                .or_default();
            Ok(())
        }

        fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
            self.chains
                .lock()
                .unwrap()
                .remove(&(table.into(), chain.into()));
            Ok(())
        }

        fn list_chains(&self, table: &str) -> Result<Vec<String>> {
            Ok(self
                .chains
                .lock()
                .unwrap()
                .keys()
                .filter(|(t, _)| t == table)
                .map(|(_, c)| c.clone())
                .collect())
        }
    }

    fn rule(spec: &str) -> FilterRule {
        FilterRule::new("nat", "TEST").raw(spec.split(' '))
    }

    #[test]
    fn test_stale_infix_replaced_with_single_trim() {
        let fake = FakeFilter::default().with_chain("nat", "TEST", &["R1", "R2", "R3"]);
        let desired = vec![rule("R1"), rule("R4")];
        reconcile_chain_rules(&fake, "nat", "TEST", &desired).unwrap();

        assert_eq!(fake.rules("nat", "TEST"), vec!["R1", "R4"]);
        assert_eq!(
            fake.ops(),
            vec![
                Op::Replace("R4".into(), 2),
                Op::Delete("R3".into()),
            ]
        );
    }

    #[test]
    fn test_infix_insert_pushes_existing_down() {
        let fake = FakeFilter::default().with_chain("nat", "TEST", &["R1", "R3"]);
        let desired = vec![rule("R1"), rule("R2"), rule("R3")];
        reconcile_chain_rules(&fake, "nat", "TEST", &desired).unwrap();

        assert_eq!(fake.rules("nat", "TEST"), vec!["R1", "R2", "R3"]);
        assert_eq!(fake.ops(), vec![Op::Insert("R2".into(), 2)]);
    }

    #[test]
    fn test_empty_chain_populated_in_order() {
        let fake = FakeFilter::default();
        let desired = vec![rule("R1"), rule("R2")];
        reconcile_chain_rules(&fake, "nat", "TEST", &desired).unwrap();
        assert_eq!(fake.rules("nat", "TEST"), vec!["R1", "R2"]);
    }

    #[test]
    fn test_converged_chain_is_untouched() {
        let fake = FakeFilter::default().with_chain("nat", "TEST", &["R1", "R2"]);
        let desired = vec![rule("R1"), rule("R2")];
        reconcile_chain_rules(&fake, "nat", "TEST", &desired).unwrap();
        assert!(fake.ops().is_empty());
    }

    #[test]
    fn test_trailing_rules_trimmed_from_tail() {
        let fake =
            FakeFilter::default().with_chain("nat", "TEST", &["R1", "R2", "X1", "X2"]);
        let desired = vec![rule("R1"), rule("R2")];
        reconcile_chain_rules(&fake, "nat", "TEST", &desired).unwrap();
        assert_eq!(fake.rules("nat", "TEST"), vec!["R1", "R2"]);
        assert_eq!(
            fake.ops(),
            vec![Op::Delete("X2".into()), Op::Delete("X1".into())]
        );
    }

    #[test]
    fn test_jump_inserted_at_head_once() {
        let fake =
            FakeFilter::default().with_chain("nat", "POSTROUTING", &["-j OTHER"]);
        let jump = FilterRule::new("nat", "POSTROUTING").jump("FAB-POSTROUTING");
        ensure_jump_at_head(&fake, &jump).unwrap();
        assert_eq!(
            fake.rules("nat", "POSTROUTING"),
            vec!["-j FAB-POSTROUTING", "-j OTHER"]
        );

        ensure_jump_at_head(&fake, &jump).unwrap();
        assert_eq!(fake.ops().len(), 1);
    }

    #[test]
    fn test_rule_reinserted_above_marker() {
        let fake = FakeFilter::default().with_chain(
            "nat",
            "POSTROUTING",
            &["-j KUBE-POSTROUTING", "-j FAB-POSTROUTING"],
        );
        let ours = FilterRule::new("nat", "POSTROUTING").jump("FAB-POSTROUTING");
        ensure_rule_above(&fake, "nat", "POSTROUTING", &ours, "KUBE-POSTROUTING").unwrap();
        assert_eq!(
            fake.rules("nat", "POSTROUTING"),
            vec!["-j FAB-POSTROUTING", "-j KUBE-POSTROUTING"]
        );
    }

    #[test]
    fn test_duplicate_copies_pruned_keeping_head() {
        let fake = FakeFilter::default().with_chain(
            "nat",
            "POSTROUTING",
            &[
                "-j FAB-POSTROUTING",
                "-j KUBE-POSTROUTING",
                "-j FAB-POSTROUTING",
            ],
        );
        let ours = FilterRule::new("nat", "POSTROUTING").jump("FAB-POSTROUTING");
        ensure_rule_above(&fake, "nat", "POSTROUTING", &ours, "KUBE-POSTROUTING").unwrap();
        assert_eq!(
            fake.rules("nat", "POSTROUTING"),
            vec!["-j FAB-POSTROUTING", "-j KUBE-POSTROUTING"]
        );
    }
}
