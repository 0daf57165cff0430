//! VMAgent Controller
//!
//! This module wires the convergence engine into a kube-rs controller. It
//! watches VMAgent resources and everything their configuration depends
//! on, and reconciles the generated workload to the synthesized
//! configuration.

use crate::cache::{ClusterCache, TargetCache};
use crate::convergence::{
    ApplyOutcome, Convergence, ConvergenceState, ObservedReplicas, WorkloadApplier,
};
use crate::credentials::{CredentialRef, CredentialSource, KubeCredentialSource, RefKind};
use crate::crd::{AgentCondition, AgentPhase, VMAgent, VMAgentStatus, VMPodScrape, VMProbe, VMServiceScrape};
use crate::error::{OperatorError, Result};
use crate::resources::ResourceBuilder;
use crate::synthesizer::SynthesizedConfig;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::finalizer::{self, finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Finalizer name for cleanup operations
pub const FINALIZER_NAME: &str = "operator.victoriametrics.com/vmagent-finalizer";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "vmagent-operator";

/// Value of the `managed-by` label on generated objects
const MANAGED_BY: &str = "vm-operator";

/// Default periodic resync interval
const DEFAULT_RESYNC_SECONDS: u64 = 300;

/// Runtime settings for the controller
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch agents in, `None` for cluster-wide
    pub namespace: Option<String>,
    /// Agents reconciled concurrently
    pub workers: usize,
    /// Timeout of each fetch or apply attempt
    pub attempt_timeout: Duration,
    /// Requeue interval after a successful pass
    pub resync_interval: Duration,
    /// How long to wait for the watch caches on startup
    pub cache_sync_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 4,
            attempt_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_SECONDS),
            cache_sync_timeout: Duration::from_secs(120),
        }
    }
}

/// Maps referenced Secrets and ConfigMaps to the agents that use them
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    by_object: DashMap<ObjectKey, BTreeSet<AgentKey>>,
    by_agent: DashMap<AgentKey, BTreeSet<ObjectKey>>,
}

type ObjectKey = (RefKind, String, String);
type AgentKey = (String, String);

impl ReferenceIndex {
    /// Replace the references recorded for an agent
    pub fn update(&self, namespace: &str, name: &str, refs: &BTreeSet<CredentialRef>) {
        let agent = (namespace.to_string(), name.to_string());
        let objects: BTreeSet<ObjectKey> = refs
            .iter()
            .map(|r| (r.kind, r.namespace.clone(), r.name.clone()))
            .collect();

        self.unlink(&agent);
        for object in &objects {
            self.by_object
                .entry(object.clone())
                .or_default()
                .insert(agent.clone());
        }
        if !objects.is_empty() {
            self.by_agent.insert(agent, objects);
        }
    }

    /// Forget an agent
    pub fn remove(&self, namespace: &str, name: &str) {
        self.unlink(&(namespace.to_string(), name.to_string()));
    }

    fn unlink(&self, agent: &AgentKey) {
        let Some((_, previous)) = self.by_agent.remove(agent) else {
            return;
        };
        for object in previous {
            if let Some(mut agents) = self.by_object.get_mut(&object) {
                agents.remove(agent);
            }
            self.by_object.remove_if(&object, |_, agents| agents.is_empty());
        }
    }

    /// Agents referencing a Secret or ConfigMap
    pub fn agents_for(&self, kind: RefKind, namespace: &str, name: &str) -> Vec<ObjectRef<VMAgent>> {
        self.by_object
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|agents| {
                agents
                    .iter()
                    .map(|(ns, name)| ObjectRef::new(name).within(ns))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Runtime settings
    pub config: OperatorConfig,
    /// Scrape target and namespace caches
    pub cache: Arc<dyn TargetCache>,
    /// Credential reader
    pub source: Arc<dyn CredentialSource>,
    /// Workload writer
    pub applier: Arc<dyn WorkloadApplier>,
    /// Per-agent convergence state keyed by `namespace/name`
    pub states: DashMap<String, ConvergenceState>,
    /// Per-agent error retry counts for exponential backoff
    pub error_counts: DashMap<String, u32>,
    /// Secrets and ConfigMaps referenced by each agent
    pub references: Arc<ReferenceIndex>,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Counter for workload writes
    pub workload_updates: metrics::Counter,
    /// Counter for passes that found nothing to change
    pub skipped_applies: metrics::Counter,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("vmagent_operator_reconciliations_total"),
            errors: metrics::counter!("vmagent_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("vmagent_operator_reconciliation_duration_seconds"),
            workload_updates: metrics::counter!("vmagent_operator_workload_updates_total"),
            skipped_applies: metrics::counter!("vmagent_operator_skipped_applies_total"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn agent_key(agent: &VMAgent) -> String {
    format!(
        "{}/{}",
        agent.namespace().unwrap_or_else(|| "default".to_string()),
        agent.name_any()
    )
}

/// Agents that select scrape targets; the others ignore target changes
fn managed_agents(agents: &[Arc<VMAgent>]) -> Vec<ObjectRef<VMAgent>> {
    agents
        .iter()
        .filter(|agent| agent.has_managed_scrapes())
        .map(|agent| ObjectRef::from_obj(agent.as_ref()))
        .collect()
}

/// Agents owning an object or referencing one of its keys
fn referencing_agents<K: Resource>(
    index: &ReferenceIndex,
    kind: RefKind,
    obj: &K,
) -> Vec<ObjectRef<VMAgent>> {
    let namespace = obj.meta().namespace.clone().unwrap_or_default();
    let name = obj.meta().name.clone().unwrap_or_default();
    let mut agents = index.agents_for(kind, &namespace, &name);
    for owner in obj.meta().owner_references.iter().flatten() {
        if owner.kind == "VMAgent" && owner.api_version.starts_with("operator.victoriametrics.com/")
        {
            agents.push(ObjectRef::new(&owner.name).within(&namespace));
        }
    }
    agents
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Start the VMAgent controller
pub async fn run_controller(client: Client, config: OperatorConfig) -> Result<()> {
    let namespace = config.namespace.clone();
    let ns = namespace.as_deref();

    let cache = ClusterCache::start(client.clone(), config.cache_sync_timeout).await?;
    let references = Arc::new(ReferenceIndex::default());

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        metrics: Some(ControllerMetrics::new()),
        config: config.clone(),
        cache: Arc::new(cache),
        source: Arc::new(KubeCredentialSource::new(client.clone())),
        applier: Arc::new(KubeWorkloadApplier::new(client.clone())),
        states: DashMap::new(),
        error_counts: DashMap::new(),
        references: references.clone(),
    });

    info!(
        namespace = ns.unwrap_or("all"),
        workers = config.workers,
        "Starting VMAgent controller"
    );

    let controller = Controller::new(scoped_api::<VMAgent>(&client, ns), Config::default())
        .with_config(
            ControllerConfig::default().concurrency(config.workers.min(u16::MAX as usize) as u16),
        );
    let store = controller.store();

    let target_store = store.clone();
    let pod_store = store.clone();
    let probe_store = store.clone();
    let namespace_store = store;
    let secret_index = references.clone();
    let config_map_index = references;

    // Secrets and ConfigMaps referenced from scrape targets can live in
    // any namespace, so they are always watched cluster-wide.
    controller
        .owns(scoped_api::<Deployment>(&client, ns), Config::default())
        .owns(scoped_api::<Service>(&client, ns), Config::default())
        .watches(
            Api::<VMServiceScrape>::all(client.clone()),
            Config::default(),
            move |_| managed_agents(&target_store.state()),
        )
        .watches(
            Api::<VMPodScrape>::all(client.clone()),
            Config::default(),
            move |_| managed_agents(&pod_store.state()),
        )
        .watches(
            Api::<VMProbe>::all(client.clone()),
            Config::default(),
            move |_| managed_agents(&probe_store.state()),
        )
        .watches(
            Api::<Namespace>::all(client.clone()),
            Config::default(),
            move |_| managed_agents(&namespace_store.state()),
        )
        .watches(
            Api::<Secret>::all(client.clone()),
            Config::default(),
            move |secret| referencing_agents(&secret_index, RefKind::Secret, &secret),
        )
        .watches(
            Api::<ConfigMap>::all(client),
            Config::default(),
            move |cm| referencing_agents(&config_map_index, RefKind::ConfigMap, &cm),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(agent, ctx), fields(name = %agent.name_any(), namespace = agent.namespace()))]
async fn reconcile(agent: Arc<VMAgent>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = agent.namespace().unwrap_or_else(|| "default".to_string());
    let key = agent_key(&agent);
    let agents: Api<VMAgent> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&agents, FINALIZER_NAME, agent, |event| async {
        match event {
            FinalizerEvent::Apply(agent) => apply_agent(agent, ctx.clone()).await,
            FinalizerEvent::Cleanup(agent) => cleanup_agent(agent, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    // Reset error backoff counter on success
    if result.is_ok() {
        ctx.error_counts.remove(&key);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        match e {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
            other => OperatorError::FinalizerError(other.to_string()),
        }
    })
}

/// Converge one agent and publish its status
#[instrument(skip(agent, ctx))]
async fn apply_agent(agent: Arc<VMAgent>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let name = agent.name_any();
    let namespace = agent.namespace().unwrap_or_else(|| "default".to_string());
    let key = agent_key(&agent);

    info!(name = %name, namespace = %namespace, "Reconciling VMAgent");

    // The state is taken out of the map for the duration of the pass so no
    // shard lock is held across an await.
    let mut state = ctx
        .states
        .remove(&key)
        .map(|(_, state)| state)
        .unwrap_or_else(|| ConvergenceState::from_status(agent.status.as_ref()));

    let result = match validate_agent(&agent) {
        Ok(()) => {
            let convergence = Convergence {
                cache: ctx.cache.as_ref(),
                source: ctx.source.as_ref(),
                applier: ctx.applier.as_ref(),
                attempt_timeout: ctx.config.attempt_timeout,
            };
            convergence.converge(&mut state, &agent).await
        }
        Err(e) => {
            state.record_failure(&e);
            Err(e)
        }
    };

    ctx.references.update(&namespace, &name, &state.references);

    if let Some(ref metrics) = ctx.metrics {
        match &result {
            Ok(ApplyOutcome::Skipped) => metrics.skipped_applies.increment(1),
            Ok(ApplyOutcome::Applied { workload: true, .. }) => {
                metrics.workload_updates.increment(1)
            }
            _ => {}
        }
    }

    let now = Utc::now().to_rfc3339();
    let status = build_status(&agent, &state, &now);
    ctx.states.insert(key, state);

    let published = if status_changed(agent.status.as_ref(), &status) {
        update_status(&ctx.client, &namespace, &name, &status).await
    } else {
        Ok(())
    };

    match result {
        Ok(outcome) => {
            published?;
            info!(name = %name, ?outcome, phase = %status.phase, "Reconciliation complete");
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        Err(e) => {
            if let Err(status_err) = published {
                warn!(name = %name, error = %status_err, "Failed to publish failure status");
            }
            Err(e)
        }
    }
}

/// Validate the agent spec before any work is done
fn validate_agent(agent: &VMAgent) -> Result<()> {
    let name = agent.name_any();

    if let Err(errors) = agent.spec.validate() {
        let error_msg = format_validation_errors(&errors);
        warn!(name = %name, errors = %error_msg, "Agent spec validation failed");
        return Err(OperatorError::InvalidConfig(error_msg));
    }

    for (i, rw) in agent.spec.remote_write.iter().enumerate() {
        if rw.basic_auth.is_some() && rw.bearer_token_secret.is_some() {
            return Err(OperatorError::InvalidConfig(format!(
                "remoteWrite[{}]: basicAuth and bearerTokenSecret are mutually exclusive",
                i
            )));
        }
    }

    if agent.replicas() == 0 {
        warn!(name = %name, "Agent scaled to zero replicas, nothing will be scraped");
    }

    Ok(())
}

/// Flatten nested validation errors into `path: message` pairs
fn format_validation_errors(errors: &ValidationErrors) -> String {
    fn walk(prefix: &str, errors: &ValidationErrors, out: &mut Vec<String>) {
        for (field, kind) in errors.errors() {
            let path = if prefix.is_empty() {
                field.to_string()
            } else {
                format!("{}.{}", prefix, field)
            };
            match kind {
                ValidationErrorsKind::Field(errs) => {
                    for e in errs {
                        let message = e
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| e.code.to_string());
                        out.push(format!("{}: {}", path, message));
                    }
                }
                ValidationErrorsKind::Struct(inner) => walk(&path, inner, out),
                ValidationErrorsKind::List(items) => {
                    for (i, inner) in items {
                        walk(&format!("{}[{}]", path, i), inner, out);
                    }
                }
            }
        }
    }

    let mut out = Vec::new();
    walk("", errors, &mut out);
    out.sort();
    out.join("; ")
}

/// Forget an agent when it is deleted
#[instrument(skip(agent, ctx))]
async fn cleanup_agent(agent: Arc<VMAgent>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let name = agent.name_any();
    let namespace = agent.namespace().unwrap_or_else(|| "default".to_string());
    let key = agent_key(&agent);

    info!(name = %name, namespace = %namespace, "Cleaning up VMAgent");

    // Generated objects carry owner references and are garbage-collected
    ctx.states.remove(&key);
    ctx.error_counts.remove(&key);
    ctx.references.remove(&namespace, &name);

    Ok(Action::await_change())
}

fn condition(
    previous: Option<&VMAgentStatus>,
    condition_type: &str,
    active: bool,
    reason: &str,
    message: Option<String>,
    now: &str,
) -> AgentCondition {
    let status = if active { "True" } else { "False" };
    // Transition time only moves when the status flips
    let last_transition_time = previous
        .and_then(|p| {
            p.conditions
                .iter()
                .find(|c| c.condition_type == condition_type && c.status == status)
        })
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.to_string());

    AgentCondition {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message,
        last_transition_time: Some(last_transition_time),
    }
}

/// Build the agent status from its convergence state
fn build_status(agent: &VMAgent, state: &ConvergenceState, now: &str) -> VMAgentStatus {
    let previous = agent.status.as_ref();
    let observed = state.observed;
    let desired = agent.replicas();

    let mut conditions = Vec::new();

    match state.last_error {
        None => conditions.push(condition(
            previous,
            "Ready",
            state.phase == AgentPhase::Steady,
            "Converged",
            Some(format!(
                "{}/{} replicas available",
                observed.available_replicas, desired
            )),
            now,
        )),
        Some(ref err) => {
            conditions.push(condition(
                previous,
                "Ready",
                false,
                err.reason,
                Some(err.message.clone()),
                now,
            ));
            conditions.push(condition(
                previous,
                "Failed",
                true,
                err.reason,
                Some(if err.retryable {
                    format!("{} (retrying)", err.message)
                } else {
                    format!("{} (waiting for a spec change)", err.message)
                }),
                now,
            ));
        }
    }

    if state.references_unresolved() {
        let detail = state
            .last_error
            .as_ref()
            .map(|e| e.message.as_str())
            .unwrap_or_default();
        conditions.push(condition(
            previous,
            "ReferencesUnresolved",
            true,
            "UnresolvedReference",
            Some(format!(
                "unresolved for {} consecutive passes: {}",
                state.consecutive_unresolved, detail
            )),
            now,
        ));
    }

    VMAgentStatus {
        replicas: observed.replicas,
        updated_replicas: observed.updated_replicas,
        available_replicas: observed.available_replicas,
        unavailable_replicas: observed.unavailable_replicas,
        phase: state.phase,
        last_applied_hash: state.last_applied_hash.clone(),
        observed_generation: agent.metadata.generation.unwrap_or(0),
        conditions,
        last_updated: Some(now.to_string()),
    }
}

/// Whether a status differs from the published one beyond its timestamp
fn status_changed(previous: Option<&VMAgentStatus>, next: &VMAgentStatus) -> bool {
    match previous {
        None => true,
        Some(previous) => {
            let mut candidate = next.clone();
            candidate.last_updated = previous.last_updated.clone();
            &candidate != previous
        }
    }
}

/// Update the agent status subresource
async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &VMAgentStatus,
) -> Result<()> {
    let api: Api<VMAgent> = Api::namespaced(client.clone(), namespace);

    debug!(name = %name, phase = %status.phase, "Updating agent status");

    let patch = serde_json::json!({
        "status": status
    });

    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Requeue decision after `retries` consecutive failures
fn backoff_action(error: &OperatorError, retries: u32) -> Action {
    match error.requeue_delay(retries) {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

/// Error policy for the controller with exponential backoff
fn error_policy(agent: Arc<VMAgent>, error: &OperatorError, ctx: Arc<ControllerContext>) -> Action {
    let key = agent_key(&agent);
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let action = backoff_action(error, retries);
    if error.is_retryable() {
        warn!(
            error = %error,
            retry = retries,
            "Reconciliation error for '{}', will retry",
            key
        );
    } else {
        warn!(
            error = %error,
            reason = error.reason(),
            "Reconciliation error for '{}', waiting for a spec change",
            key
        );
    }
    action
}

/// Verify the operator still owns a resource before force-applying
///
/// An existing object labelled as managed by another controller is left
/// alone rather than silently taken over.
fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get("managed-by"));
    match managed_by {
        Some(manager) if manager != MANAGED_BY => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::Conflict(format!(
                "resource '{}' is managed by '{}', not {}; refusing to force-apply",
                name, manager, MANAGED_BY
            )))
        }
        _ => Ok(()),
    }
}

/// Apply a namespaced object using server-side apply
async fn apply_resource<K>(client: &Client, namespace: &str, obj: K) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let kind = K::kind(&());
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let name = obj.meta().name.clone().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("{} missing metadata.name", kind))
    })?;

    debug!(kind = %kind, name = %name, "Applying resource");

    if let Some(existing) = api.get_opt(&name).await? {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&name, &patch_params, &Patch::Apply(&obj))
        .await
        .map_err(|e| OperatorError::ApplyError(format!("{} {}: {}", kind, name, e)))
}

fn observed_from(status: Option<DeploymentStatus>) -> ObservedReplicas {
    status
        .map(|s| ObservedReplicas {
            replicas: s.replicas.unwrap_or(0),
            updated_replicas: s.updated_replicas.unwrap_or(0),
            available_replicas: s.available_replicas.unwrap_or(0),
            unavailable_replicas: s.unavailable_replicas.unwrap_or(0),
        })
        .unwrap_or_default()
}

/// Writes generated objects with server-side apply
#[derive(Clone)]
pub struct KubeWorkloadApplier {
    client: Client,
}

impl KubeWorkloadApplier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadApplier for KubeWorkloadApplier {
    async fn apply_config(&self, agent: &VMAgent, config: &SynthesizedConfig) -> Result<()> {
        let builder = ResourceBuilder::new(agent)?;
        let namespace = agent.namespace().unwrap_or_else(|| "default".to_string());

        // Credentials first so the reloader never sees a config pointing
        // at files that are not mounted yet.
        apply_resource(&self.client, &namespace, builder.build_tls_assets_secret(config)).await?;
        apply_resource(&self.client, &namespace, builder.build_config_secret(config)).await?;
        Ok(())
    }

    async fn apply_workload(
        &self,
        agent: &VMAgent,
        config: &SynthesizedConfig,
    ) -> Result<ObservedReplicas> {
        let builder = ResourceBuilder::new(agent)?;
        let namespace = agent.namespace().unwrap_or_else(|| "default".to_string());

        apply_resource(&self.client, &namespace, builder.build_service()).await?;
        let deployment =
            apply_resource(&self.client, &namespace, builder.build_deployment(config)).await?;
        Ok(observed_from(deployment.status))
    }

    async fn observe(&self, agent: &VMAgent) -> Result<ObservedReplicas> {
        let namespace = agent.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let deployment = api.get_opt(&agent.prefixed_name()).await?;
        Ok(observed_from(deployment.and_then(|d| d.status)))
    }
}
