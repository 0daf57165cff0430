//! Convergence of one agent towards its synthesized configuration
//!
//! Each pass moves an agent through
//! `Pending -> Synthesizing -> Applying -> Steady`, or to `Failed` when
//! synthesis or an apply step fails. Mutations are skipped entirely when
//! neither the configuration hash nor the workload hash changed.

use crate::cache::TargetCache;
use crate::credentials::{CredentialRef, CredentialSource};
use crate::crd::{AgentPhase, VMAgent, VMAgentStatus};
use crate::error::{OperatorError, Result};
use crate::pipeline;
use crate::synthesizer::SynthesizedConfig;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive unresolved passes before the warning condition is raised
pub const UNRESOLVED_WARNING_THRESHOLD: u32 = 5;

/// Replica counters read from the workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservedReplicas {
    pub replicas: i32,
    pub updated_replicas: i32,
    pub available_replicas: i32,
    pub unavailable_replicas: i32,
}

/// Writes the agent's generated objects
#[async_trait]
pub trait WorkloadApplier: Send + Sync {
    /// Write the config and credential bundle secrets
    async fn apply_config(&self, agent: &VMAgent, config: &SynthesizedConfig) -> Result<()>;

    /// Write the deployment and service
    async fn apply_workload(
        &self,
        agent: &VMAgent,
        config: &SynthesizedConfig,
    ) -> Result<ObservedReplicas>;

    /// Read the replica counters without mutating anything
    async fn observe(&self, agent: &VMAgent) -> Result<ObservedReplicas>;
}

/// Last error of a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub reason: &'static str,
    pub message: String,
    pub retryable: bool,
}

/// Per-agent convergence state, owned by the worker reconciling the agent
#[derive(Debug, Clone, Default)]
pub struct ConvergenceState {
    pub phase: AgentPhase,
    pub observed: ObservedReplicas,
    pub last_applied_hash: Option<String>,
    pub last_applied_workload_hash: Option<String>,
    /// Config was applied but the workload step has not succeeded since
    pub workload_pending: bool,
    pub last_error: Option<LastError>,
    pub consecutive_failures: u32,
    pub consecutive_unresolved: u32,
    /// References planned by the last pass
    pub references: BTreeSet<CredentialRef>,
}

impl ConvergenceState {
    /// Seed state from a persisted status after a restart
    pub fn from_status(status: Option<&VMAgentStatus>) -> Self {
        let mut state = Self::default();
        if let Some(status) = status {
            state.last_applied_hash = status.last_applied_hash.clone();
            // The workload hash is not persisted; the next pass re-applies
            state.workload_pending = status.last_applied_hash.is_some();
        }
        state
    }

    /// Record a failed pass
    pub fn record_failure(&mut self, err: &OperatorError) {
        self.phase = AgentPhase::Failed;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if matches!(err, OperatorError::UnresolvedReference { .. }) {
            self.consecutive_unresolved = self.consecutive_unresolved.saturating_add(1);
        } else {
            self.consecutive_unresolved = 0;
        }
        self.last_error = Some(LastError {
            reason: err.reason(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        });
    }

    fn record_success(&mut self) {
        self.phase = AgentPhase::Steady;
        self.consecutive_failures = 0;
        self.consecutive_unresolved = 0;
        self.last_error = None;
    }

    /// Whether references have stayed unresolved long enough to warn
    pub fn references_unresolved(&self) -> bool {
        self.consecutive_unresolved >= UNRESOLVED_WARNING_THRESHOLD
    }
}

/// What an apply step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing changed, no mutation was issued
    Skipped,
    /// Objects were written
    Applied { config: bool, workload: bool },
}

/// Fingerprint of everything that shapes the workload objects
pub fn workload_hash(agent: &VMAgent, config: &SynthesizedConfig) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&agent.spec)?);
    hasher.update(serde_json::to_vec(&agent.metadata.labels)?);
    hasher.update(serde_json::to_vec(&agent.metadata.annotations)?);
    hasher.update(config.hash.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Drives one agent pass with its collaborators
pub struct Convergence<'a> {
    pub cache: &'a dyn TargetCache,
    pub source: &'a dyn CredentialSource,
    pub applier: &'a dyn WorkloadApplier,
    pub attempt_timeout: Duration,
}

impl Convergence<'_> {
    /// Synthesize and apply
    ///
    /// A synthesis failure leaves the recorded hashes untouched, so the
    /// last applied configuration stays in force.
    pub async fn converge(
        &self,
        state: &mut ConvergenceState,
        agent: &VMAgent,
    ) -> Result<ApplyOutcome> {
        state.phase = AgentPhase::Synthesizing;
        let config = match self.synthesize(state, agent).await {
            Ok(config) => config,
            Err(e) => {
                state.record_failure(&e);
                return Err(e);
            }
        };
        self.apply(state, agent, &config).await
    }

    async fn synthesize(
        &self,
        state: &mut ConvergenceState,
        agent: &VMAgent,
    ) -> Result<SynthesizedConfig> {
        let plan = pipeline::plan(self.cache, agent)?;
        state.references = plan.references.clone();
        pipeline::execute(plan, agent, self.source, self.attempt_timeout).await
    }

    /// Apply a synthesized configuration
    ///
    /// When the config was written but the workload step failed, the
    /// config hash stays recorded and only the workload step is retried.
    pub async fn apply(
        &self,
        state: &mut ConvergenceState,
        agent: &VMAgent,
        config: &SynthesizedConfig,
    ) -> Result<ApplyOutcome> {
        state.phase = AgentPhase::Applying;
        let result = self.apply_steps(state, agent, config).await;
        match result {
            Ok(outcome) => {
                state.record_success();
                Ok(outcome)
            }
            Err(e) => {
                state.record_failure(&e);
                Err(e)
            }
        }
    }

    async fn apply_steps(
        &self,
        state: &mut ConvergenceState,
        agent: &VMAgent,
        config: &SynthesizedConfig,
    ) -> Result<ApplyOutcome> {
        let workload_hash = workload_hash(agent, config)?;
        let config_changed = state.last_applied_hash.as_deref() != Some(config.hash.as_str());
        let workload_changed =
            state.last_applied_workload_hash.as_deref() != Some(workload_hash.as_str());

        if !config_changed && !workload_changed && !state.workload_pending {
            debug!(hash = %config.hash, "Configuration unchanged, skipping apply");
            state.observed = self
                .timed("observing workload", self.applier.observe(agent))
                .await?;
            return Ok(ApplyOutcome::Skipped);
        }

        if config_changed {
            self.timed("applying config", self.applier.apply_config(agent, config))
                .await?;
            state.last_applied_hash = Some(config.hash.clone());
            state.workload_pending = true;
            info!(hash = %config.hash, jobs = config.job_count, "Applied configuration");
        }

        state.workload_pending = true;
        match self
            .timed("applying workload", self.applier.apply_workload(agent, config))
            .await
        {
            Ok(observed) => {
                state.observed = observed;
                state.last_applied_workload_hash = Some(workload_hash);
                state.workload_pending = false;
            }
            Err(e) => {
                warn!(error = %e, "Workload update failed, will retry the workload step");
                return Err(e);
            }
        }

        Ok(ApplyOutcome::Applied {
            config: config_changed,
            workload: true,
        })
    }

    async fn timed<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.attempt_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(OperatorError::Timeout(format!(
                "{} exceeded {}s",
                what,
                self.attempt_timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StaticCache;
    use crate::credentials::CredentialBundle;
    use crate::crd::{RemoteWriteSpec, VMAgentSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeApplier {
        config_calls: AtomicU64,
        workload_calls: AtomicU64,
        observe_calls: AtomicU64,
        fail_workload: Mutex<u32>,
        hang_config: Mutex<bool>,
    }

    #[async_trait]
    impl WorkloadApplier for FakeApplier {
        async fn apply_config(&self, _agent: &VMAgent, _config: &SynthesizedConfig) -> Result<()> {
            self.config_calls.fetch_add(1, Ordering::SeqCst);
            if *self.hang_config.lock().await {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }

        async fn apply_workload(
            &self,
            agent: &VMAgent,
            _config: &SynthesizedConfig,
        ) -> Result<ObservedReplicas> {
            self.workload_calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.fail_workload.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(OperatorError::ApplyError("quota exceeded".to_string()));
            }
            Ok(ObservedReplicas {
                replicas: agent.replicas(),
                ..Default::default()
            })
        }

        async fn observe(&self, agent: &VMAgent) -> Result<ObservedReplicas> {
            self.observe_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ObservedReplicas {
                replicas: agent.replicas(),
                available_replicas: agent.replicas(),
                ..Default::default()
            })
        }
    }

    struct NoSource;

    #[async_trait]
    impl CredentialSource for NoSource {
        async fn fetch(&self, _reference: &CredentialRef) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn agent() -> VMAgent {
        VMAgent {
            metadata: ObjectMeta {
                name: Some("main".to_string()),
                namespace: Some("monitoring".to_string()),
                ..Default::default()
            },
            spec: VMAgentSpec {
                remote_write: vec![RemoteWriteSpec {
                    url: "http://a:8429/api/v1/write".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        }
    }

    fn config(hash: &str) -> SynthesizedConfig {
        SynthesizedConfig {
            scrape_config: String::new(),
            remote_write_args: vec![],
            relabel_files: BTreeMap::new(),
            bundle: CredentialBundle::default(),
            job_count: 0,
            hash: hash.to_string(),
        }
    }

    fn convergence<'a>(
        cache: &'a StaticCache,
        applier: &'a FakeApplier,
    ) -> Convergence<'a> {
        Convergence {
            cache,
            source: &NoSource,
            applier,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_short_circuit_on_unchanged_hash() {
        let cache = StaticCache::default();
        let applier = FakeApplier::default();
        let conv = convergence(&cache, &applier);
        let agent = agent();
        let mut state = ConvergenceState::default();

        let first = conv.apply(&mut state, &agent, &config("h1")).await.unwrap();
        assert_eq!(
            first,
            ApplyOutcome::Applied {
                config: true,
                workload: true
            }
        );
        let second = conv.apply(&mut state, &agent, &config("h1")).await.unwrap();
        assert_eq!(second, ApplyOutcome::Skipped);

        assert_eq!(applier.config_calls.load(Ordering::SeqCst), 1);
        assert_eq!(applier.workload_calls.load(Ordering::SeqCst), 1);
        assert_eq!(applier.observe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.phase, AgentPhase::Steady);
        assert_eq!(state.observed.available_replicas, 1);
    }

    #[tokio::test]
    async fn test_spec_change_updates_workload_only() {
        let cache = StaticCache::default();
        let applier = FakeApplier::default();
        let conv = convergence(&cache, &applier);
        let mut agent = agent();
        let mut state = ConvergenceState::default();

        conv.apply(&mut state, &agent, &config("h1")).await.unwrap();
        agent.spec.replica_count = Some(3);
        let outcome = conv.apply(&mut state, &agent, &config("h1")).await.unwrap();

        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                config: false,
                workload: true
            }
        );
        assert_eq!(applier.config_calls.load(Ordering::SeqCst), 1);
        assert_eq!(applier.workload_calls.load(Ordering::SeqCst), 2);
        assert_eq!(state.observed.replicas, 3);
    }

    #[tokio::test]
    async fn test_partial_failure_retries_workload_only() {
        let cache = StaticCache::default();
        let applier = FakeApplier::default();
        *applier.fail_workload.lock().await = 1;
        let conv = convergence(&cache, &applier);
        let agent = agent();
        let mut state = ConvergenceState::default();

        let err = conv.apply(&mut state, &agent, &config("h1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(state.phase, AgentPhase::Failed);
        assert_eq!(state.last_applied_hash.as_deref(), Some("h1"));
        assert!(state.workload_pending);
        assert_eq!(state.consecutive_failures, 1);

        let outcome = conv.apply(&mut state, &agent, &config("h1")).await.unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                config: false,
                workload: true
            }
        );
        assert_eq!(applier.config_calls.load(Ordering::SeqCst), 1);
        assert_eq!(applier.workload_calls.load(Ordering::SeqCst), 2);
        assert!(!state.workload_pending);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_timeout_is_retryable() {
        let cache = StaticCache::default();
        let applier = FakeApplier::default();
        *applier.hang_config.lock().await = true;
        let conv = convergence(&cache, &applier);
        let mut state = ConvergenceState::default();

        let err = conv.apply(&mut state, &agent(), &config("h1")).await.unwrap_err();
        assert!(matches!(err, OperatorError::Timeout(_)));
        assert!(state.last_applied_hash.is_none());
        assert_eq!(applier.workload_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_converge_without_targets() {
        let cache = StaticCache::default();
        let applier = FakeApplier::default();
        let conv = convergence(&cache, &applier);
        let mut state = ConvergenceState::default();

        let outcome = conv.converge(&mut state, &agent()).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        assert!(state.last_applied_hash.is_some());
        assert!(state.references.is_empty());
    }

    #[test]
    fn test_unresolved_warning_threshold() {
        let mut state = ConvergenceState::default();
        let err = OperatorError::UnresolvedReference {
            references: vec!["secret/ns/a/b".to_string()],
        };
        for _ in 0..UNRESOLVED_WARNING_THRESHOLD - 1 {
            state.record_failure(&err);
        }
        assert!(!state.references_unresolved());
        state.record_failure(&err);
        assert!(state.references_unresolved());

        state.record_failure(&OperatorError::ApplyError("x".to_string()));
        assert!(!state.references_unresolved());
        assert_eq!(state.consecutive_failures, UNRESOLVED_WARNING_THRESHOLD + 1);
    }

    #[test]
    fn test_from_status() {
        let status = VMAgentStatus {
            last_applied_hash: Some("abc".to_string()),
            ..Default::default()
        };
        let state = ConvergenceState::from_status(Some(&status));
        assert_eq!(state.last_applied_hash.as_deref(), Some("abc"));
        assert!(state.workload_pending);
        assert_eq!(state.phase, AgentPhase::Pending);

        let fresh = ConvergenceState::from_status(None);
        assert!(fresh.last_applied_hash.is_none());
        assert!(!fresh.workload_pending);
    }

    #[test]
    fn test_workload_hash_tracks_spec_and_config() {
        let agent_a = agent();
        let mut agent_b = agent();
        agent_b.spec.replica_count = Some(2);
        let h = |a: &VMAgent, c: &str| workload_hash(a, &config(c)).unwrap();
        assert_eq!(h(&agent_a, "x"), h(&agent_a, "x"));
        assert_ne!(h(&agent_a, "x"), h(&agent_b, "x"));
        assert_ne!(h(&agent_a, "x"), h(&agent_a, "y"));
    }
}
