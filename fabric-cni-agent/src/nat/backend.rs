use std::path::{Path, PathBuf};

use tracing::info;

use crate::routes::Family;
use crate::{Error, Result};

/// Which iptables backend the host is wired for. Both layouts being
/// active at once double-counts traffic, so the agent has to know which
/// one it is driving before touching any chain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FilterMode {
    Legacy,
    Nft,
}

/// Boundary to the packet filter. Rule specs are flat argument strings
/// by the time they reach this trait; everything above it works with
/// typed [`super::chains::FilterRule`] values.
pub trait PacketFilterBackend: Send + Sync {
    /// Rule specs of a chain in order, without the `-A <chain>` prefix.
    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>>;
    /// Inserts at a 1-based position.
    fn insert(&self, table: &str, chain: &str, rule: &str, pos: usize) -> Result<()>;
    /// Replaces the rule at a 1-based position.
    fn replace(&self, table: &str, chain: &str, rule: &str, pos: usize) -> Result<()>;
    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<()>;
    /// Deletes by spec. Not-found is success.
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<()>;
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool>;
    fn ensure_chain(&self, table: &str, chain: &str) -> Result<()>;
    /// Flushes and deletes a chain. Not-found is success.
    fn delete_chain(&self, table: &str, chain: &str) -> Result<()>;
    fn list_chains(&self, table: &str) -> Result<Vec<String>>;
}

/// Detects the active backend by resolving the `iptables` binary the
/// way the distribution wired it. Failure is fatal for the agent:
/// guessing wrong would silently stop enforcing policy.
pub fn detect_mode() -> Result<FilterMode> {
    let binary = resolve_binary("iptables")?;
    let canonical = std::fs::canonicalize(&binary).unwrap_or(binary);
    let name = canonical
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let mode = if name.ends_with("-nft") {
        FilterMode::Nft
    } else if name.ends_with("-legacy") {
        FilterMode::Legacy
    } else {
        return Err(Error::PacketFilter(format!(
            "cannot determine iptables mode from binary {}",
            canonical.display()
        )));
    };
    info!(?mode, binary = %canonical.display(), "detected packet filter mode");
    Ok(mode)
}

fn resolve_binary(name: &str) -> Result<PathBuf> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    // the usual sbin locations are not always on PATH in a container
    for dir in ["/usr/sbin", "/sbin"] {
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(Error::PacketFilter(format!("binary {name} not found")))
}

/// Packet filter driven through the system iptables binaries.
pub struct IptablesBackend {
    ipt: iptables::IPTables,
}

impl IptablesBackend {
    pub fn try_new(family: Family) -> Result<Self> {
        let ipt = iptables::new(family == Family::V6)
            .map_err(|e| Error::PacketFilter(e.to_string()))?;
        Ok(Self { ipt })
    }
}

fn filter_err(e: Box<dyn std::error::Error>) -> Error {
    Error::PacketFilter(e.to_string())
}

impl PacketFilterBackend for IptablesBackend {
    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        let prefix = format!("-A {chain} ");
        let lines = self.ipt.list(table, chain).map_err(filter_err)?;
        Ok(lines
            .iter()
            .filter_map(|l| l.strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }

    fn insert(&self, table: &str, chain: &str, rule: &str, pos: usize) -> Result<()> {
        self.ipt
            .insert(table, chain, rule, pos as i32)
            .map_err(filter_err)
    }

    fn replace(&self, table: &str, chain: &str, rule: &str, pos: usize) -> Result<()> {
        self.ipt
            .replace(table, chain, rule, pos as i32)
            .map_err(filter_err)
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        self.ipt.append(table, chain, rule).map_err(filter_err)
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        match self.ipt.exists(table, chain, rule) {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) => return Err(filter_err(e)),
        }
        self.ipt.delete(table, chain, rule).map_err(filter_err)
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool> {
        self.ipt.exists(table, chain, rule).map_err(filter_err)
    }

    fn ensure_chain(&self, table: &str, chain: &str) -> Result<()> {
        match self.ipt.chain_exists(table, chain) {
            Ok(true) => Ok(()),
            Ok(false) => self.ipt.new_chain(table, chain).map_err(filter_err),
            Err(e) => Err(filter_err(e)),
        }
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        match self.ipt.chain_exists(table, chain) {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) => return Err(filter_err(e)),
        }
        self.ipt.flush_chain(table, chain).map_err(filter_err)?;
        self.ipt.delete_chain(table, chain).map_err(filter_err)
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        self.ipt.list_chains(table).map_err(filter_err)
    }
}
