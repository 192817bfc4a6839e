use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::trigger::TriggerReceiver;
use crate::{Error, Result};

/// Services redirected to their local backends on the underlay bridge.
pub const UNDERLAY_REDIRECT_ANNOTATION: &str = "fabric-cni.dev/underlay-redirect";

/// Cookies owned by this agent, one per feature and family. A flow in
/// a dump carrying any other cookie belongs to someone else and is
/// carried through every resync untouched.
pub const COOKIE_SVC_REDIRECT_V4: u64 = 0x9001;
pub const COOKIE_SVC_REDIRECT_V6: u64 = 0x9002;
pub const MANAGED_COOKIES: [u64; 2] = [COOKIE_SVC_REDIRECT_V4, COOKIE_SVC_REDIRECT_V6];

const FEATURE_SVC_REDIRECT: &str = "svc-redirect";

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FlowKey {
    pub feature: &'static str,
    pub addr: IpAddr,
    pub protocol: String,
    pub port: u16,
}

/// In-memory desired flow state per bridge. Feature handlers mutate it
/// under the lock and then kick the sync trigger; the lock is never
/// held across an external call.
#[derive(Default)]
pub struct FlowCache {
    inner: Mutex<HashMap<String, HashMap<FlowKey, String>>>,
}

impl FlowCache {
    pub fn set(&self, bridge: &str, key: FlowKey, flow: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(bridge.to_string()).or_default().insert(key, flow);
    }

    pub fn remove(&self, bridge: &str, key: &FlowKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(flows) = inner.get_mut(bridge) {
            flows.remove(key);
        }
    }

    /// Swaps in the full entry list of one feature on one bridge.
    pub fn replace_feature(
        &self,
        bridge: &str,
        feature: &'static str,
        entries: Vec<(FlowKey, String)>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let flows = inner.entry(bridge.to_string()).or_default();
        flows.retain(|k, _| k.feature != feature);
        flows.extend(entries);
    }

    pub fn snapshot(&self, bridge: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut flows: Vec<String> = inner
            .get(bridge)
            .map(|f| f.values().cloned().collect())
            .unwrap_or_default();
        flows.sort_unstable();
        flows
    }
}

fn parse_cookie(line: &str) -> Option<u64> {
    let value = line.trim_start().strip_prefix("cookie=0x")?;
    let end = value.find([',', ' '])?;
    u64::from_str_radix(&value[..end], 16).ok()
}

/// Strips the dump-only counters from a flow line so it can be fed
/// back through replace-flows.
fn normalize_flow(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || !line.starts_with("cookie=") {
        return None;
    }
    let fields: Vec<&str> = line
        .split(", ")
        .filter(|f| {
            !f.starts_with("duration=")
                && !f.starts_with("n_packets=")
                && !f.starts_with("n_bytes=")
                && !f.starts_with("idle_age=")
                && !f.starts_with("hard_age=")
        })
        .collect();
    Some(fields.join(", "))
}

/// The resync merge: foreign flows from the dump survive verbatim,
/// the managed partition is discarded and rebuilt from the cache.
pub fn merge_flows(dumped: &[String], cache_flows: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = dumped
        .iter()
        .filter_map(|l| normalize_flow(l))
        .filter(|l| match parse_cookie(l) {
            Some(cookie) => !MANAGED_COOKIES.contains(&cookie),
            None => true,
        })
        .collect();
    result.extend(cache_flows);
    result
}

/// Builds the redirect flows for one underlay service, keyed per
/// cluster IP and port.
pub fn underlay_service_flows(svc: &Service) -> Vec<(FlowKey, String)> {
    let mut flows = Vec::new();
    let Some(spec) = svc.spec.as_ref() else {
        return flows;
    };
    let cluster_ips: Vec<IpAddr> = spec
        .cluster_ips
        .as_ref()
        .map(|ips| ips.iter().filter_map(|ip| ip.parse().ok()).collect())
        .unwrap_or_default();
    let ports = spec.ports.as_deref().unwrap_or_default();

    for ip in cluster_ips {
        for svc_port in ports {
            let Ok(port) = u16::try_from(svc_port.port) else {
                continue;
            };
            let protocol = svc_port
                .protocol
                .as_deref()
                .unwrap_or("TCP")
                .to_lowercase();
            let (cookie, match_proto, dst_field) = match ip {
                IpAddr::V4(_) => (COOKIE_SVC_REDIRECT_V4, protocol.clone(), "nw_dst"),
                IpAddr::V6(_) => (COOKIE_SVC_REDIRECT_V6, format!("{protocol}6"), "ipv6_dst"),
            };
            let flow = format!(
                "cookie={cookie:#x}, table=0, priority=200,{match_proto},{dst_field}={ip},tp_dst={port} actions=LOCAL"
            );
            flows.push((
                FlowKey {
                    feature: FEATURE_SVC_REDIRECT,
                    addr: ip,
                    protocol,
                    port,
                },
                flow,
            ));
        }
    }
    flows
}

/// Recomputes the service-redirect feature's cache slice from the
/// current service snapshot. Returns true when the cache changed.
pub fn apply_underlay_services(
    cache: &FlowCache,
    bridges: &[String],
    services: &[Arc<Service>],
) -> bool {
    let mut entries = Vec::new();
    for svc in services {
        if svc
            .annotations()
            .get(UNDERLAY_REDIRECT_ANNOTATION)
            .map(String::as_str)
            != Some("true")
        {
            continue;
        }
        entries.extend(underlay_service_flows(svc));
    }
    let mut changed = false;
    for bridge in bridges {
        let before = cache.snapshot(bridge);
        cache.replace_feature(bridge, FEATURE_SVC_REDIRECT, entries.clone());
        if cache.snapshot(bridge) != before {
            changed = true;
        }
    }
    changed
}

/// Text-based OpenFlow control surface of the software switch.
#[derive(Clone, Default)]
pub struct OvsOfctl;

impl OvsOfctl {
    pub async fn dump_flows(&self, bridge: &str) -> Result<Vec<String>> {
        let output = Command::new("ovs-ofctl")
            .args(["dump-flows", bridge])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Ovs(format!(
                "ovs-ofctl dump-flows {bridge} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Atomically replaces the bridge's whole flow table.
    pub async fn replace_flows(&self, bridge: &str, flows: &[String]) -> Result<()> {
        let mut child = Command::new("ovs-ofctl")
            .args(["replace-flows", bridge, "-"])
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(flows.join("\n").as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Ovs(format!(
                "ovs-ofctl replace-flows {bridge} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Periodic and on-demand flow table sync for every provider bridge.
pub struct FlowSyncEngine {
    cache: Arc<FlowCache>,
    ovs: OvsOfctl,
    bridges: Vec<String>,
    period: Duration,
}

impl FlowSyncEngine {
    pub fn new(cache: Arc<FlowCache>, bridges: Vec<String>, period: Duration) -> Self {
        Self {
            cache,
            ovs: OvsOfctl,
            bridges,
            period,
        }
    }

    pub async fn run(self, mut trigger: TriggerReceiver, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        info!(bridges = ?self.bridges, "starting flow sync engine");
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
                error!(%e, "flow sync failed, retrying on next tick");
            }
        }
        info!("flow sync engine exited");
    }

    pub async fn sync(&self) -> Result<()> {
        for bridge in &self.bridges {
            let dumped = self.ovs.dump_flows(bridge).await?;
            let desired = merge_flows(&dumped, self.cache.snapshot(bridge));
            debug!(bridge, flows = desired.len(), "replacing bridge flows");
            self.ovs.replace_flows(bridge, &desired).await?;
        }
        Ok(())
    }
}
