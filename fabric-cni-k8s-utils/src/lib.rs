use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::reflector::{ReflectHandle, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Resource};
use thiserror::Error;
use tracing::{error, trace};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

const STORE_BUFFER_SIZE: usize = 1000;

/// Builds a shared reflector store for `api` plus a subscriber handle for
/// event consumers. The watch task is spawned here and lives for the
/// process lifetime; callers only hold the read side.
pub async fn create_store_and_subscriber<K>(
    api: Api<K>,
    timeout: Option<Duration>,
) -> Result<(Store<K>, ReflectHandle<K>)>
where
    K: Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Send + DeserializeOwned + Hash + Clone,
{
    let (store, writer) = reflector::store_shared(STORE_BUFFER_SIZE);
    let subscriber: ReflectHandle<K> = writer
        .subscribe()
        .ok_or_else(|| Error::StoreCreation("failed to create subscriber".into()))?;

    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect_shared(writer)
        .for_each(|res| async move {
            match res {
                Ok(ev) => trace!("received event: {:?}", ev),
                Err(e) => {
                    error!(%e, "unexpected error with stream")
                }
            }
        });

    tokio::spawn(stream);
    wait_ready(&store, timeout).await?;
    Ok((store, subscriber))
}

/// Like [`create_store_and_subscriber`], but forwards the raw watcher
/// events to `events` instead of handing out a subscriber. Needed by
/// consumers that care about deletions, which a shared-store
/// subscriber does not deliver.
pub async fn create_store_and_events<K>(
    api: Api<K>,
    timeout: Option<Duration>,
    events: tokio::sync::mpsc::UnboundedSender<watcher::Event<K>>,
) -> Result<Store<K>>
where
    K: Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Send + DeserializeOwned + Hash + Clone,
{
    let (store, writer) = reflector::store();

    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .for_each(move |res| {
            let events = events.clone();
            async move {
                match res {
                    Ok(ev) => {
                        if events.send(ev).is_err() {
                            error!("event receiver dropped, events no longer forwarded");
                        }
                    }
                    Err(e) => {
                        error!(%e, "unexpected error with stream")
                    }
                }
            }
        });

    tokio::spawn(stream);
    wait_ready(&store, timeout).await?;
    Ok(store)
}

async fn wait_ready<K>(store: &Store<K>, timeout: Option<Duration>) -> Result<()>
where
    K: Resource + Clone + 'static,
    <K as Resource>::DynamicType: Eq + Hash + Clone,
{
    let wait = store.wait_until_ready();
    if let Some(timeout) = timeout {
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::StoreCreation("timed out waiting for store".into()))?
            .map_err(|e| Error::StoreCreation(e.to_string()))?;
    } else {
        wait.await
            .map_err(|e| Error::StoreCreation(e.to_string()))?;
    }
    Ok(())
}
