use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use fabric_cni_crds::v1alpha1::{ElasticIp, Subnet};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::runtime::reflector::ReflectHandle;
use kube::runtime::watcher;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DaemonArgs;
use crate::eip::{EipEvent, EipPipeline};
use crate::fdb::FdbReconciler;
use crate::kubernetes::Stores;
use crate::nat::NatReconciler;
use crate::openflow::{apply_underlay_services, FlowCache, FlowSyncEngine};
use crate::routes::{NetlinkClient, RouteReconciler};
use crate::trigger::{trigger, Trigger};
use crate::Result;

/// Wires the stores, triggers, reconcilers and event fan-out together
/// and runs until cancelled. Failing to reach the kernel, the packet
/// filter or the apiserver here is fatal: an agent that cannot enforce
/// policy must not pretend to.
pub async fn start(args: DaemonArgs, cancel: CancellationToken) -> Result<()> {
    let mode = crate::nat::detect_mode()?;
    let netlink = NetlinkClient::try_new()?;
    let client = kube::Client::try_default().await?;

    let (subnet_tx, subnet_rx) = mpsc::unbounded_channel();
    let (service_tx, service_rx) = mpsc::unbounded_channel();
    let (eip_tx, eip_rx) = mpsc::unbounded_channel();
    let (stores, subscribers) = Stores::try_new(client, subnet_tx, service_tx, eip_tx).await?;

    let (route_trigger, route_rx) = trigger();
    let (nat_trigger, nat_rx) = trigger();
    let (flow_trigger, flow_rx) = trigger();
    let (fdb_trigger, fdb_rx) = trigger();

    let flow_cache = Arc::new(FlowCache::default());
    let bridges = args.bridges();

    let route_reconciler = RouteReconciler::new(stores.clone(), netlink.clone(), &args);
    let nat_reconciler = NatReconciler::try_new(stores.clone(), &args, mode)?;
    let flow_engine = FlowSyncEngine::new(
        flow_cache.clone(),
        bridges.clone(),
        Duration::from_secs(args.flow_sync_period),
    );
    let fdb_reconciler = FdbReconciler::new(
        stores.clone(),
        bridges.clone(),
        Duration::from_secs(args.fdb_sync_period),
    );
    let (pipeline, eip_receivers) = EipPipeline::new(stores.clone(), netlink, &args);

    let tasks: Vec<(&str, JoinHandle<()>)> = vec![
        (
            "routes",
            tokio::spawn(route_reconciler.run(route_rx, cancel.child_token())),
        ),
        (
            "packet-filter",
            tokio::spawn(nat_reconciler.run(nat_rx, cancel.child_token())),
        ),
        (
            "flow-sync",
            tokio::spawn(flow_engine.run(flow_rx, cancel.child_token())),
        ),
        (
            "fdb",
            tokio::spawn(fdb_reconciler.run(fdb_rx, cancel.child_token())),
        ),
        (
            "eip-pipeline",
            tokio::spawn(pipeline.clone().run(eip_receivers, cancel.child_token())),
        ),
        (
            "subnet-events",
            tokio::spawn(subnet_event_loop(
                subnet_rx,
                pipeline.clone(),
                vec![route_trigger.clone(), nat_trigger.clone(), fdb_trigger.clone()],
                cancel.child_token(),
            )),
        ),
        (
            "eip-events",
            tokio::spawn(eip_event_loop(eip_rx, pipeline.clone(), cancel.child_token())),
        ),
        (
            "pod-events",
            tokio::spawn(pod_event_loop(
                subscribers.pods,
                pipeline,
                vec![route_trigger.clone(), nat_trigger.clone()],
                cancel.child_token(),
            )),
        ),
        (
            "node-events",
            tokio::spawn(node_event_loop(
                subscribers.nodes,
                vec![route_trigger, nat_trigger],
                cancel.child_token(),
            )),
        ),
        (
            "service-events",
            tokio::spawn(service_event_loop(
                service_rx,
                stores,
                flow_cache,
                bridges,
                flow_trigger,
                cancel.child_token(),
            )),
        ),
    ];

    info!("agent started");
    cancel.cancelled().await;
    for (name, handle) in tasks {
        match handle.await {
            Ok(()) => info!("{name} exited"),
            Err(e) => error!("{name} task failed to complete: {e}"),
        }
    }
    Ok(())
}

async fn subnet_event_loop(
    mut rx: UnboundedReceiver<watcher::Event<Subnet>>,
    pipeline: Arc<EipPipeline>,
    triggers: Vec<Trigger>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        match event {
            watcher::Event::Apply(_) | watcher::Event::InitApply(_) => {
                kick_all(&triggers);
            }
            watcher::Event::Delete(subnet) => {
                kick_all(&triggers);
                pipeline
                    .handle_event(EipEvent::SubnetRemoved(Arc::new(subnet)))
                    .await;
            }
            _ => {}
        }
    }
}

async fn eip_event_loop(
    mut rx: UnboundedReceiver<watcher::Event<ElasticIp>>,
    pipeline: Arc<EipPipeline>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        match event {
            watcher::Event::Apply(eip) | watcher::Event::InitApply(eip) => {
                pipeline.handle_event(EipEvent::Upsert(Arc::new(eip))).await;
            }
            watcher::Event::Delete(eip) => {
                pipeline.handle_event(EipEvent::Delete(Arc::new(eip))).await;
            }
            _ => {}
        }
    }
}

async fn pod_event_loop(
    subscriber: ReflectHandle<Pod>,
    pipeline: Arc<EipPipeline>,
    triggers: Vec<Trigger>,
    cancel: CancellationToken,
) {
    let mut stream = pin!(subscriber);
    loop {
        let pod = tokio::select! {
            _ = cancel.cancelled() => break,
            pod = stream.next() => pod,
        };
        let Some(pod) = pod else {
            break;
        };
        kick_all(&triggers);
        pipeline.handle_event(EipEvent::GatewayPodChanged(pod)).await;
    }
}

async fn node_event_loop(
    subscriber: ReflectHandle<Node>,
    triggers: Vec<Trigger>,
    cancel: CancellationToken,
) {
    let mut stream = pin!(subscriber);
    loop {
        let node = tokio::select! {
            _ = cancel.cancelled() => break,
            node = stream.next() => node,
        };
        if node.is_none() {
            break;
        }
        kick_all(&triggers);
    }
}

async fn service_event_loop(
    mut rx: UnboundedReceiver<watcher::Event<Service>>,
    stores: Stores,
    flow_cache: Arc<FlowCache>,
    bridges: Vec<String>,
    flow_trigger: Trigger,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        if matches!(event, watcher::Event::Init | watcher::Event::InitDone) {
            continue;
        }
        // recompute the whole feature slice from the store snapshot;
        // per-event patching would have to reconstruct delete diffs
        let services = stores.services.state();
        if apply_underlay_services(&flow_cache, &bridges, &services) {
            flow_trigger.kick();
        }
    }
}

fn kick_all(triggers: &[Trigger]) {
    for trigger in triggers {
        trigger.kick();
    }
}
