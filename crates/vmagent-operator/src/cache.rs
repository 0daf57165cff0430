//! Watch caches for scrape target objects and namespaces
//!
//! Selector resolution reads only from these caches, never from the API
//! server. The production cache is backed by kube reflector stores.

use crate::crd::{VMPodScrape, VMProbe, VMServiceScrape};
use crate::error::{OperatorError, Result};
use crate::selector::{ScrapeTarget, TargetKind};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{error, info, warn};

/// Namespace name with its labels
pub type NamespaceLabels = (String, BTreeMap<String, String>);

/// Read access to the current set of namespaces and scrape target objects
pub trait TargetCache: Send + Sync {
    /// Snapshot of every namespace and its labels
    fn namespaces(&self) -> Vec<NamespaceLabels>;

    /// Snapshot of every object of one kind
    fn targets(&self, kind: TargetKind) -> Vec<ScrapeTarget>;
}

/// Cache backed by cluster-wide reflectors
#[derive(Clone)]
pub struct ClusterCache {
    namespaces: reflector::Store<Namespace>,
    service_scrapes: reflector::Store<VMServiceScrape>,
    pod_scrapes: reflector::Store<VMPodScrape>,
    probes: reflector::Store<VMProbe>,
}

impl ClusterCache {
    /// Start the reflectors and wait for their initial sync
    pub async fn start(client: Client, sync_timeout: Duration) -> Result<Self> {
        let cache = Self {
            namespaces: spawn_reflector(Api::all(client.clone())),
            service_scrapes: spawn_reflector(Api::all(client.clone())),
            pod_scrapes: spawn_reflector(Api::all(client.clone())),
            probes: spawn_reflector(Api::all(client)),
        };

        let ready = async {
            cache.namespaces.wait_until_ready().await?;
            cache.service_scrapes.wait_until_ready().await?;
            cache.pod_scrapes.wait_until_ready().await?;
            cache.probes.wait_until_ready().await
        };
        match tokio::time::timeout(sync_timeout, ready).await {
            Ok(Ok(())) => {
                info!("Scrape target caches synced");
                Ok(cache)
            }
            Ok(Err(e)) => Err(OperatorError::Timeout(format!(
                "cache writer dropped before sync: {}",
                e
            ))),
            Err(_) => Err(OperatorError::Timeout(format!(
                "caches not synced within {}s",
                sync_timeout.as_secs()
            ))),
        }
    }
}

/// Spawn a reflector that keeps `Store<K>` up to date until the process exits
fn spawn_reflector<K>(api: Api<K>) -> reflector::Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default())).default_backoff();

    tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        loop {
            match stream.try_next().await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(kind = %kind, "Reflector stream ended");
                    break;
                }
                Err(e) => {
                    error!(kind = %kind, error = %e, "Reflector error");
                }
            }
        }
    });

    reader
}

impl TargetCache for ClusterCache {
    fn namespaces(&self) -> Vec<NamespaceLabels> {
        self.namespaces
            .state()
            .iter()
            .map(|ns| (ns.name_any(), ns.labels().clone()))
            .collect()
    }

    fn targets(&self, kind: TargetKind) -> Vec<ScrapeTarget> {
        match kind {
            TargetKind::Service => self
                .service_scrapes
                .state()
                .into_iter()
                .map(ScrapeTarget::Service)
                .collect(),
            TargetKind::Pod => self
                .pod_scrapes
                .state()
                .into_iter()
                .map(ScrapeTarget::Pod)
                .collect(),
            TargetKind::Probe => self
                .probes
                .state()
                .into_iter()
                .map(ScrapeTarget::Probe)
                .collect(),
        }
    }
}

/// Fixed in-memory cache
///
/// Useful for driving the synthesis pipeline without a cluster.
#[derive(Debug, Clone, Default)]
pub struct StaticCache {
    namespaces: Vec<NamespaceLabels>,
    targets: Vec<ScrapeTarget>,
}

impl StaticCache {
    pub fn add_namespace(&mut self, name: &str, labels: BTreeMap<String, String>) {
        self.namespaces.push((name.to_string(), labels));
    }

    pub fn add_target(&mut self, target: ScrapeTarget) {
        self.targets.push(target);
    }
}

impl TargetCache for StaticCache {
    fn namespaces(&self) -> Vec<NamespaceLabels> {
        self.namespaces.clone()
    }

    fn targets(&self, kind: TargetKind) -> Vec<ScrapeTarget> {
        self.targets
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }
}
