use std::collections::HashMap;
use std::time::Duration;

use fabric_cni_crds::v1alpha1::Subnet;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kubernetes::Stores;
use crate::trigger::TriggerReceiver;
use crate::{Error, Result};

/// One static forwarding entry the agent wants present. Identity is
/// (vlan, mac); the port is the value side of the comparison.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FdbEntry {
    pub vlan: u16,
    pub mac: String,
    pub port: String,
}

/// A static entry parsed out of an fdb dump, still keyed by ofport.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RawFdbEntry {
    pub port_no: u32,
    pub vlan: u16,
    pub mac: String,
}

/// Parses `fdb/show` output, keeping static entries only. A static
/// entry carries the literal `static` in the age column; anything
/// numeric there is a learned entry aging out on its own and is none
/// of our business.
pub fn parse_fdb_show(output: &str) -> Vec<RawFdbEntry> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [port, vlan, mac, age] = fields.as_slice() else {
                return None;
            };
            if *age != "static" {
                return None;
            }
            Some(RawFdbEntry {
                port_no: port.parse().ok()?,
                vlan: vlan.parse().ok()?,
                mac: mac.to_lowercase(),
            })
        })
        .collect()
}

#[derive(Default, Debug)]
pub struct FdbDiff {
    pub to_add: Vec<FdbEntry>,
    pub to_del: Vec<(u16, String)>,
}

/// Compares the dumped static entries on the patch ports against the
/// desired list. Whatever stays in the index after every desired entry
/// has claimed its match is unexpected and gets deleted.
pub fn diff_fdb(
    dumped: &[RawFdbEntry],
    desired: &[FdbEntry],
    patch_ofports: &HashMap<String, u32>,
) -> FdbDiff {
    let managed: Vec<u32> = patch_ofports.values().copied().collect();
    let mut index: HashMap<(u16, String), u32> = dumped
        .iter()
        .filter(|e| managed.contains(&e.port_no))
        .map(|e| ((e.vlan, e.mac.clone()), e.port_no))
        .collect();

    let mut diff = FdbDiff::default();
    for entry in desired {
        let key = (entry.vlan, entry.mac.to_lowercase());
        let Some(want_ofport) = patch_ofports.get(&entry.port) else {
            warn!(port = %entry.port, "desired fdb port is not a known patch port");
            continue;
        };
        match index.remove(&key) {
            Some(ofport) if ofport == *want_ofport => {}
            Some(_) => {
                // present on the wrong port: replace
                diff.to_del.push(key.clone());
                diff.to_add.push(entry.clone());
            }
            None => diff.to_add.push(entry.clone()),
        }
    }
    diff.to_del.extend(index.into_keys());
    diff
}

/// OVS command surface for the forwarding database and port layout.
#[derive(Clone, Default)]
pub struct OvsCtl;

impl OvsCtl {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(Error::Ovs(format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub async fn fdb_show(&self, bridge: &str) -> Result<String> {
        self.run("ovs-appctl", &["fdb/show", bridge]).await
    }

    pub async fn fdb_add(&self, bridge: &str, port: &str, vlan: u16, mac: &str) -> Result<()> {
        self.run(
            "ovs-appctl",
            &["fdb/add", bridge, port, &vlan.to_string(), mac],
        )
        .await
        .map(|_| ())
    }

    pub async fn fdb_del(&self, bridge: &str, vlan: u16, mac: &str) -> Result<()> {
        match self
            .run("ovs-appctl", &["fdb/del", bridge, &vlan.to_string(), mac])
            .await
        {
            Ok(_) => Ok(()),
            // an entry that already aged out or was removed is fine
            Err(Error::Ovs(msg)) if msg.contains("no such entry") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Patch ports of a bridge with their ofport numbers.
    pub async fn patch_ports(&self, bridge: &str) -> Result<HashMap<String, u32>> {
        let ports = self.run("ovs-vsctl", &["list-ports", bridge]).await?;
        let mut out = HashMap::new();
        for port in ports.lines().map(str::trim).filter(|p| !p.is_empty()) {
            let kind = self.run("ovs-vsctl", &["get", "Interface", port, "type"]).await?;
            if kind.trim().trim_matches('"') != "patch" {
                continue;
            }
            let ofport = self
                .run("ovs-vsctl", &["get", "Interface", port, "ofport"])
                .await?;
            if let Ok(ofport) = ofport.trim().parse() {
                out.insert(port.to_string(), ofport);
            }
        }
        Ok(out)
    }
}

/// Bridge the subnet's provider network hangs off.
pub fn bridge_for_subnet(subnet: &Subnet) -> Option<String> {
    subnet.spec.provider.as_ref().map(|p| format!("br-{p}"))
}

/// Static-FDB reconciler for every provider bridge. One desired entry
/// per subnet with underlay-to-overlay interconnection and a resolved
/// MAC: the interconnection address must egress through the patch port
/// into the overlay.
pub struct FdbReconciler {
    stores: Stores,
    ovs: OvsCtl,
    bridges: Vec<String>,
    period: Duration,
    /// Serializes whole sync passes; overlapping triggers must not
    /// race their external commands against each other.
    sync_lock: Mutex<()>,
}

impl FdbReconciler {
    pub fn new(stores: Stores, bridges: Vec<String>, period: Duration) -> Self {
        Self {
            stores,
            ovs: OvsCtl,
            bridges,
            period,
            sync_lock: Mutex::new(()),
        }
    }

    pub async fn run(self, mut trigger: TriggerReceiver, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        info!(bridges = ?self.bridges, "starting fdb reconciler");
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
                error!(%e, "fdb sync failed, retrying on next tick");
            }
        }
        info!("fdb reconciler exited");
    }

    pub async fn sync(&self) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        for bridge in &self.bridges {
            let patch_ofports = self.ovs.patch_ports(bridge).await?;
            if patch_ofports.is_empty() {
                debug!(bridge, "no patch ports, skipping fdb sync");
                continue;
            }
            // the overlay-facing patch port; bridges here carry exactly
            // one, picking deterministically covers the exotic case
            let patch_port = {
                let mut names: Vec<&String> = patch_ofports.keys().collect();
                names.sort();
                names[0].clone()
            };

            let desired: Vec<FdbEntry> = self
                .stores
                .ready_subnets()
                .iter()
                .filter(|s| s.spec.u2o_interconnection)
                .filter(|s| bridge_for_subnet(s).as_deref() == Some(bridge.as_str()))
                .filter_map(|s| {
                    Some(FdbEntry {
                        vlan: s.spec.vlan_id.unwrap_or(0),
                        mac: s.u2o_mac()?,
                        port: patch_port.clone(),
                    })
                })
                .collect();

            let dumped = parse_fdb_show(&self.ovs.fdb_show(bridge).await?);
            let diff = diff_fdb(&dumped, &desired, &patch_ofports);

            for entry in &diff.to_add {
                self.ovs
                    .fdb_add(bridge, &entry.port, entry.vlan, &entry.mac)
                    .await?;
            }
            for (vlan, mac) in &diff.to_del {
                if let Err(e) = self.ovs.fdb_del(bridge, *vlan, mac).await {
                    warn!(%e, bridge, vlan, mac, "failed to delete stale fdb entry");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = " port  VLAN  MAC                Age\n\
                           1     0  36:b9:df:32:bb:c6    2\n\
                           2    10  00:11:22:33:44:55  static\n\
                           3    20  AA:BB:CC:DD:EE:FF  static\n";

    #[test]
    fn test_parse_keeps_static_entries_only() {
        let entries = parse_fdb_show(DUMP);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].port_no, 2);
        assert_eq!(entries[0].vlan, 10);
        assert_eq!(entries[1].mac, "aa:bb:cc:dd:ee:ff");
    }

    fn ofports(pairs: &[(&str, u32)]) -> HashMap<String, u32> {
        pairs.iter().map(|(n, p)| (n.to_string(), *p)).collect()
    }

    #[test]
    fn test_missing_entry_installed() {
        let desired = vec![FdbEntry {
            vlan: 10,
            mac: "00:11:22:33:44:55".into(),
            port: "patch-overlay".into(),
        }];
        let diff = diff_fdb(&[], &desired, &ofports(&[("patch-overlay", 2)]));
        assert_eq!(diff.to_add, desired);
        assert!(diff.to_del.is_empty());
    }

    #[test]
    fn test_matching_entry_untouched_and_leftover_deleted() {
        let dumped = vec![
            RawFdbEntry {
                port_no: 2,
                vlan: 10,
                mac: "00:11:22:33:44:55".into(),
            },
            RawFdbEntry {
                port_no: 2,
                vlan: 30,
                mac: "de:ad:be:ef:00:01".into(),
            },
        ];
        let desired = vec![FdbEntry {
            vlan: 10,
            mac: "00:11:22:33:44:55".into(),
            port: "patch-overlay".into(),
        }];
        let diff = diff_fdb(&dumped, &desired, &ofports(&[("patch-overlay", 2)]));
        assert!(diff.to_add.is_empty());
        assert_eq!(diff.to_del, vec![(30, "de:ad:be:ef:00:01".to_string())]);
    }

    #[test]
    fn test_entries_on_foreign_ports_ignored() {
        // static entry on a non-patch port: not ours, never deleted
        let dumped = vec![RawFdbEntry {
            port_no: 7,
            vlan: 10,
            mac: "00:11:22:33:44:55".into(),
        }];
        let diff = diff_fdb(&dumped, &[], &ofports(&[("patch-overlay", 2)]));
        assert!(diff.to_del.is_empty());
    }

    #[test]
    fn test_wrong_port_replaced() {
        let dumped = vec![RawFdbEntry {
            port_no: 3,
            vlan: 10,
            mac: "00:11:22:33:44:55".into(),
        }];
        let desired = vec![FdbEntry {
            vlan: 10,
            mac: "00:11:22:33:44:55".into(),
            port: "patch-overlay".into(),
        }];
        let diff = diff_fdb(
            &dumped,
            &desired,
            &ofports(&[("patch-overlay", 2), ("patch-other", 3)]),
        );
        assert_eq!(diff.to_add.len(), 1);
        assert_eq!(diff.to_del, vec![(10, "00:11:22:33:44:55".to_string())]);
    }
}
