use std::io::ErrorKind;

use tracing::{info, warn};

use crate::kubernetes::Stores;
use crate::routes::NetlinkClient;
use crate::Result;

/// IFNAMSIZ minus the NUL leaves 15 characters for a link name.
const MAX_IFNAME: usize = 15;

/// Name of the shared macvlan sub-interface for a master. One
/// sub-interface per physical or bonded master, shared by every
/// elastic IP resolving to it.
pub fn macvlan_name(master: &str) -> String {
    let mut name = format!("mcv-{master}");
    name.truncate(MAX_IFNAME);
    name
}

/// Lifecycle of the shared per-master macvlan sub-interfaces.
pub struct MacvlanManager {
    netlink: NetlinkClient,
}

impl MacvlanManager {
    pub fn new(netlink: NetlinkClient) -> Self {
        Self { netlink }
    }

    /// Lazily creates the sub-interface for `master`, returning its
    /// name and link index.
    pub async fn ensure(&self, master: &str) -> Result<(String, u32)> {
        let name = macvlan_name(master);
        let index = self.netlink.ensure_macvlan(&name, master).await?;
        tune_sysctls(&name);
        Ok((name, index))
    }

    /// Removes the sub-interface for `master` unless another subnet
    /// still references the master. `removed_subnet` is the subnet
    /// being torn down and never counts as a reference.
    pub async fn remove_if_unused(
        &self,
        stores: &Stores,
        master: &str,
        removed_subnet: &str,
    ) -> Result<()> {
        if stores.master_still_referenced(master, removed_subnet) {
            return Ok(());
        }
        let name = macvlan_name(master);
        info!(link = %name, master, "removing unreferenced macvlan sub-interface");
        self.netlink.del_link(&name).await
    }
}

/// Host-side tuning for a macvlan carrying elastic IP traffic. The
/// agent may run without CAP_SYS_ADMIN on the sysctl tree; the feature
/// degrades instead of failing the pipeline.
fn tune_sysctls(iface: &str) {
    for (key, value) in [("arp_ignore", "1"), ("rp_filter", "0")] {
        let path = format!("/proc/sys/net/ipv4/conf/{iface}/{key}");
        match std::fs::write(&path, value) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!(path = %path, "no permission to tune sysctl, continuing without");
            }
            Err(e) => {
                warn!(%e, path = %path, "failed to tune sysctl");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macvlan_name_shared_per_master() {
        assert_eq!(macvlan_name("eth1"), "mcv-eth1");
        assert_eq!(macvlan_name("eth1"), macvlan_name("eth1"));
    }

    #[test]
    fn test_macvlan_name_fits_ifnamsiz() {
        let name = macvlan_name("bond0.4094-long");
        assert!(name.len() <= MAX_IFNAME);
        assert_eq!(name, "mcv-bond0.4094-");
    }
}
