use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::routes::Family;
use crate::{Error, Result};

pub const SET_PREFIX_V4: &str = "fab4-";
pub const SET_PREFIX_V6: &str = "fab6-";

pub const ROLE_SERVICES: &str = "services";
pub const ROLE_SUBNETS: &str = "subnets";
pub const ROLE_SUBNETS_NAT: &str = "subnets-nat";
pub const ROLE_SUBNETS_DISTRIBUTED_GW: &str = "subnets-distributed-gw";
pub const ROLE_OTHER_NODES: &str = "other-node-ips";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SetKind {
    HashNet,
    HashIp,
}

impl SetKind {
    fn as_str(&self) -> &'static str {
        match self {
            SetKind::HashNet => "hash:net",
            SetKind::HashIp => "hash:ip",
        }
    }
}

/// Desired state of one named classifier set: replaced wholesale on
/// every cycle, never incrementally edited.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IpsetSpec {
    pub name: String,
    pub family: Family,
    pub kind: SetKind,
    pub members: Vec<String>,
}

pub fn set_prefix(family: Family) -> &'static str {
    match family {
        Family::V4 => SET_PREFIX_V4,
        Family::V6 => SET_PREFIX_V6,
    }
}

pub fn set_name(family: Family, role: &str) -> String {
    format!("{}{}", set_prefix(family), role)
}

fn restore_family(family: Family) -> &'static str {
    match family {
        Family::V4 => "inet",
        Family::V6 => "inet6",
    }
}

/// Renders the whole replacement batch as one `ipset restore` script.
/// Each set is filled into a scratch copy and swapped in, so readers
/// never observe a half-filled set.
pub fn build_restore_script(sets: &[IpsetSpec]) -> String {
    let mut script = String::new();
    for set in sets {
        let tmp = format!("{}-tmp", set.name);
        let header = format!(
            "{} family {}",
            set.kind.as_str(),
            restore_family(set.family)
        );
        script.push_str(&format!("create {} {} -exist\n", set.name, header));
        script.push_str(&format!("create {tmp} {header} -exist\n"));
        script.push_str(&format!("flush {tmp}\n"));
        for member in &set.members {
            script.push_str(&format!("add {tmp} {member} -exist\n"));
        }
        script.push_str(&format!("swap {tmp} {}\n", set.name));
        script.push_str(&format!("destroy {tmp}\n"));
    }
    script
}

/// Names of managed sets present on the host but absent from the
/// desired batch.
pub fn orphan_sets(installed: &[String], desired: &[IpsetSpec]) -> Vec<String> {
    installed
        .iter()
        .filter(|name| {
            (name.starts_with(SET_PREFIX_V4) || name.starts_with(SET_PREFIX_V6))
                && !name.ends_with("-tmp")
                && !desired.iter().any(|s| s.name == **name)
        })
        .cloned()
        .collect()
}

/// Applies classifier state through the ipset binary.
#[derive(Clone, Default)]
pub struct IpsetCli;

impl IpsetCli {
    pub async fn restore(&self, script: &str) -> Result<()> {
        debug!(bytes = script.len(), "applying ipset restore batch");
        let mut child = Command::new("ipset")
            .arg("restore")
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Ipset(format!(
                "ipset restore failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    pub async fn list_set_names(&self) -> Result<Vec<String>> {
        let output = Command::new("ipset").args(["list", "-n"]).output().await?;
        if !output.status.success() {
            return Err(Error::Ipset(format!(
                "ipset list failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    pub async fn destroy(&self, name: &str) -> Result<()> {
        let output = Command::new("ipset")
            .args(["destroy", name])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // a set that is already gone is a success
            if stderr.contains("does not exist") {
                return Ok(());
            }
            return Err(Error::Ipset(format!("ipset destroy {name} failed: {stderr}")));
        }
        Ok(())
    }

    /// Replaces every desired set as one batch, then applies pending
    /// deletions separately. Deletion failures (a set still referenced
    /// by a not-yet-trimmed rule) are retried on the next cycle.
    pub async fn sync(&self, desired: &[IpsetSpec]) -> Result<()> {
        self.restore(&build_restore_script(desired)).await?;
        let installed = self.list_set_names().await?;
        for orphan in orphan_sets(&installed, desired) {
            if let Err(e) = self.destroy(&orphan).await {
                warn!(%e, set = %orphan, "failed to destroy orphaned ipset");
            }
        }
        Ok(())
    }
}
