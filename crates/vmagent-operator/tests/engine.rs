//! End-to-end engine tests
//!
//! Drives selector resolution, normalization, bundling, synthesis and
//! convergence through the public API with in-memory collaborators.
//!
//! Run with: cargo test -p vmagent-operator --test engine

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use vmagent_operator::crd::{NamespaceScope, SecretKeyRef};
use vmagent_operator::prelude::*;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Credential source backed by a mutable map
#[derive(Default)]
struct FakeSource {
    entries: Mutex<HashMap<CredentialRef, Vec<u8>>>,
}

impl FakeSource {
    async fn put(&self, reference: CredentialRef, value: &str) {
        self.entries
            .lock()
            .await
            .insert(reference, value.as_bytes().to_vec());
    }

    async fn delete(&self, reference: &CredentialRef) {
        self.entries.lock().await.remove(reference);
    }
}

#[async_trait]
impl CredentialSource for FakeSource {
    async fn fetch(&self, reference: &CredentialRef) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(reference).cloned())
    }
}

/// Applier that only counts calls
#[derive(Default)]
struct CountingApplier {
    config_writes: AtomicU64,
    workload_writes: AtomicU64,
    observations: AtomicU64,
}

#[async_trait]
impl WorkloadApplier for CountingApplier {
    async fn apply_config(&self, _agent: &VMAgent, _config: &SynthesizedConfig) -> Result<()> {
        self.config_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_workload(
        &self,
        agent: &VMAgent,
        _config: &SynthesizedConfig,
    ) -> Result<ObservedReplicas> {
        self.workload_writes.fetch_add(1, Ordering::SeqCst);
        Ok(ObservedReplicas {
            replicas: agent.replicas(),
            updated_replicas: agent.replicas(),
            ..Default::default()
        })
    }

    async fn observe(&self, agent: &VMAgent) -> Result<ObservedReplicas> {
        self.observations.fetch_add(1, Ordering::SeqCst);
        Ok(ObservedReplicas {
            replicas: agent.replicas(),
            updated_replicas: agent.replicas(),
            available_replicas: agent.replicas(),
            unavailable_replicas: 0,
        })
    }
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn agent(namespace: &str, spec: VMAgentSpec) -> VMAgent {
    VMAgent {
        metadata: ObjectMeta {
            name: Some("main".to_string()),
            namespace: Some(namespace.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

fn remote_write(url: &str) -> RemoteWriteSpec {
    RemoteWriteSpec {
        url: url.to_string(),
        ..Default::default()
    }
}

fn service_scrape(namespace: &str, name: &str, obj_labels: &[(&str, &str)]) -> ScrapeTarget {
    ScrapeTarget::Service(Arc::new(VMServiceScrape {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(obj_labels)),
            ..Default::default()
        },
        spec: VMServiceScrapeSpec {
            selector: Selector {
                match_labels: labels(&[("app", name)]),
                ..Default::default()
            },
            namespace_selector: NamespaceScope::default(),
            endpoints: vec![ScrapeEndpoint {
                port: Some("http".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        },
    }))
}

fn selecting_agent(namespace: &str) -> VMAgent {
    agent(
        namespace,
        VMAgentSpec {
            service_scrape_selector: Some(Selector {
                match_labels: labels(&[("app", "foo")]),
                ..Default::default()
            }),
            remote_write: vec![remote_write("http://a:8429/api/v1/write")],
            ..Default::default()
        },
    )
}

fn cache(targets: Vec<ScrapeTarget>) -> StaticCache {
    let mut cache = StaticCache::default();
    cache.add_namespace("ns1", labels(&[("team", "a")]));
    cache.add_namespace("ns2", labels(&[("team", "b")]));
    for target in targets {
        cache.add_target(target);
    }
    cache
}

#[tokio::test]
async fn test_synthesis_is_idempotent_under_permutation() {
    let agent = selecting_agent("ns1");
    let source = FakeSource::default();

    let forward = cache(vec![
        service_scrape("ns1", "web", &[("app", "foo")]),
        service_scrape("ns1", "api", &[("app", "foo")]),
    ]);
    let reversed = cache(vec![
        service_scrape("ns1", "api", &[("app", "foo")]),
        service_scrape("ns1", "web", &[("app", "foo")]),
    ]);

    let first = pipeline::run(&forward, &source, &agent, TIMEOUT).await.unwrap();
    let second = pipeline::run(&forward, &source, &agent, TIMEOUT).await.unwrap();
    let permuted = pipeline::run(&reversed, &source, &agent, TIMEOUT).await.unwrap();

    assert_eq!(first.hash, second.hash);
    assert_eq!(first.hash, permuted.hash);
    assert_eq!(first.scrape_config, permuted.scrape_config);
    assert_eq!(first.job_count, 2);
}

#[tokio::test]
async fn test_targets_unmanaged_without_selectors() {
    let agent = agent(
        "ns1",
        VMAgentSpec {
            remote_write: vec![remote_write("http://a:8429/api/v1/write")],
            ..Default::default()
        },
    );
    let cache = cache(vec![service_scrape("ns1", "web", &[("app", "foo")])]);

    let plan = pipeline::plan(&cache, &agent).unwrap();
    assert_eq!(plan.targets, 0);
    assert!(plan.jobs.is_empty());
}

#[tokio::test]
async fn test_label_selector_stays_in_own_namespace() {
    let agent = selecting_agent("ns1");
    let cache = cache(vec![
        service_scrape("ns1", "local", &[("app", "foo")]),
        service_scrape("ns2", "remote", &[("app", "foo")]),
        service_scrape("ns1", "other", &[("app", "bar")]),
    ]);

    let config = pipeline::run(&cache, &FakeSource::default(), &agent, TIMEOUT)
        .await
        .unwrap();
    assert!(config.scrape_config.contains("VMServiceScrape/ns1/local/0"));
    assert!(!config.scrape_config.contains("VMServiceScrape/ns2/remote/0"));
    assert!(!config.scrape_config.contains("VMServiceScrape/ns1/other/0"));
}

#[tokio::test]
async fn test_namespace_selector_reaches_other_namespaces() {
    let mut agent = selecting_agent("ns1");
    agent.spec.service_scrape_namespace_selector = Some(Selector {
        match_labels: labels(&[("team", "b")]),
        ..Default::default()
    });
    let cache = cache(vec![
        service_scrape("ns1", "local", &[("app", "foo")]),
        service_scrape("ns2", "remote", &[("app", "foo")]),
    ]);

    let config = pipeline::run(&cache, &FakeSource::default(), &agent, TIMEOUT)
        .await
        .unwrap();
    assert!(config.scrape_config.contains("VMServiceScrape/ns2/remote/0"));
    assert!(!config.scrape_config.contains("VMServiceScrape/ns1/local/0"));
}

#[tokio::test]
async fn test_bundling_is_all_or_nothing() {
    let mut agent = selecting_agent("ns1");
    let present = SecretKeyRef {
        name: "rw-a".to_string(),
        key: "token".to_string(),
    };
    let missing = SecretKeyRef {
        name: "rw-b".to_string(),
        key: "token".to_string(),
    };
    agent.spec.remote_write = vec![
        RemoteWriteSpec {
            bearer_token_secret: Some(present.clone()),
            ..remote_write("http://a:8429/api/v1/write")
        },
        RemoteWriteSpec {
            bearer_token_secret: Some(missing),
            ..remote_write("http://b:8429/api/v1/write")
        },
    ];
    let source = FakeSource::default();
    source
        .put(CredentialRef::secret("ns1", &present), "t0k3n")
        .await;

    let err = pipeline::run(&cache(vec![]), &source, &agent, TIMEOUT)
        .await
        .unwrap_err();
    match err {
        OperatorError::UnresolvedReference { references } => {
            assert_eq!(references, vec!["secret/ns1/rw-b/token".to_string()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_override_honor_labels_wins() {
    let mut agent = selecting_agent("ns1");
    agent.spec.override_honor_labels = true;

    let mut target = VMServiceScrape {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("ns1".to_string()),
            labels: Some(labels(&[("app", "foo")])),
            ..Default::default()
        },
        spec: VMServiceScrapeSpec {
            endpoints: vec![ScrapeEndpoint {
                port: Some("http".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        },
    };
    target.spec.endpoints[0].settings.honor_labels = true;
    let cache = cache(vec![ScrapeTarget::Service(Arc::new(target))]);

    let config = pipeline::run(&cache, &FakeSource::default(), &agent, TIMEOUT)
        .await
        .unwrap();
    assert!(config.scrape_config.contains("honor_labels: false"));
    assert!(!config.scrape_config.contains("honor_labels: true"));
}

#[tokio::test]
async fn test_remote_write_buffers_are_distinct_and_stable() {
    let mut agent = selecting_agent("ns1");
    agent.spec.remote_write = vec![
        remote_write("http://a:8429/api/v1/write"),
        remote_write("http://b:8429/api/v1/write"),
    ];
    let source = FakeSource::default();

    let paths = |config: &SynthesizedConfig| -> Vec<String> {
        let arg = config
            .remote_write_args
            .iter()
            .find_map(|a| a.strip_prefix("-remoteWrite.tmpDataPath="))
            .unwrap()
            .to_string();
        arg.split(',').map(str::to_string).collect()
    };

    let first = pipeline::run(&cache(vec![]), &source, &agent, TIMEOUT)
        .await
        .unwrap();
    let second = pipeline::run(&cache(vec![]), &source, &agent, TIMEOUT)
        .await
        .unwrap();

    let first_paths = paths(&first);
    assert_eq!(first_paths.len(), 2);
    assert_ne!(first_paths[0], first_paths[1]);
    assert_eq!(first_paths, paths(&second));
    assert!(first_paths[0].starts_with("/tmp/vmagent-remotewrite-data/0-a-8429-"));
    assert!(first_paths[1].starts_with("/tmp/vmagent-remotewrite-data/1-b-8429-"));
}

#[tokio::test]
async fn test_convergence_skips_unchanged_configuration() {
    let agent = selecting_agent("ns1");
    let cache = cache(vec![service_scrape("ns1", "web", &[("app", "foo")])]);
    let source = FakeSource::default();
    let applier = CountingApplier::default();
    let convergence = Convergence {
        cache: &cache,
        source: &source,
        applier: &applier,
        attempt_timeout: TIMEOUT,
    };

    let mut state = ConvergenceState::default();
    let first = convergence.converge(&mut state, &agent).await.unwrap();
    assert_eq!(
        first,
        ApplyOutcome::Applied {
            config: true,
            workload: true
        }
    );
    assert_eq!(state.phase, AgentPhase::Steady);

    let second = convergence.converge(&mut state, &agent).await.unwrap();
    assert_eq!(second, ApplyOutcome::Skipped);
    assert_eq!(applier.config_writes.load(Ordering::SeqCst), 1);
    assert_eq!(applier.workload_writes.load(Ordering::SeqCst), 1);
    assert_eq!(applier.observations.load(Ordering::SeqCst), 1);
    assert_eq!(state.observed.available_replicas, 1);
}

#[tokio::test]
async fn test_missing_bearer_secret_keeps_previous_hash() {
    let mut agent = selecting_agent("ns1");
    let token = SecretKeyRef {
        name: "rw-token".to_string(),
        key: "token".to_string(),
    };
    agent.spec.remote_write[0].bearer_token_secret = Some(token.clone());
    let reference = CredentialRef::secret("ns1", &token);

    let cache = cache(vec![service_scrape("ns1", "web", &[("app", "foo")])]);
    let source = FakeSource::default();
    source.put(reference.clone(), "t0k3n").await;
    let applier = CountingApplier::default();
    let convergence = Convergence {
        cache: &cache,
        source: &source,
        applier: &applier,
        attempt_timeout: TIMEOUT,
    };

    let mut state = ConvergenceState::default();
    convergence.converge(&mut state, &agent).await.unwrap();
    let applied = state.last_applied_hash.clone();
    assert!(applied.is_some());

    source.delete(&reference).await;
    let err = convergence.converge(&mut state, &agent).await.unwrap_err();
    assert!(matches!(err, OperatorError::UnresolvedReference { .. }));
    assert!(err.is_retryable());
    assert_eq!(state.phase, AgentPhase::Failed);
    assert_eq!(state.last_applied_hash, applied);
    assert!(state.references.contains(&reference));
    assert_eq!(applier.config_writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_spec_change_rewrites_workload_only() {
    let mut agent = selecting_agent("ns1");
    let cache = cache(vec![service_scrape("ns1", "web", &[("app", "foo")])]);
    let source = FakeSource::default();
    let applier = CountingApplier::default();
    let convergence = Convergence {
        cache: &cache,
        source: &source,
        applier: &applier,
        attempt_timeout: TIMEOUT,
    };

    let mut state = ConvergenceState::default();
    convergence.converge(&mut state, &agent).await.unwrap();

    agent.spec.replica_count = Some(3);
    let outcome = convergence.converge(&mut state, &agent).await.unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            config: false,
            workload: true
        }
    );
    assert_eq!(applier.config_writes.load(Ordering::SeqCst), 1);
    assert_eq!(applier.workload_writes.load(Ordering::SeqCst), 2);
    assert_eq!(state.observed.replicas, 3);
}

#[test]
fn test_crds_are_constructed_values() {
    let crds = crds();
    let names: Vec<String> = crds
        .iter()
        .map(|crd| crd.metadata.name.clone().unwrap_or_default())
        .collect();
    assert_eq!(
        names,
        vec![
            "vmagents.operator.victoriametrics.com",
            "vmservicescrapes.operator.victoriametrics.com",
            "vmpodscrapes.operator.victoriametrics.com",
            "vmprobes.operator.victoriametrics.com",
        ]
    );
}
