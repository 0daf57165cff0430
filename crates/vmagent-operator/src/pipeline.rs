//! One synthesis pass: resolve, normalize, bundle, synthesize
//!
//! Planning is synchronous and reads only the watch cache. Execution
//! fetches credentials and renders the configuration.

use crate::cache::TargetCache;
use crate::credentials::{bundle, collect_refs, CredentialRef, CredentialSource};
use crate::crd::VMAgent;
use crate::error::Result;
use crate::normalize::{normalize, NormalizeContext, ScrapeJob};
use crate::selector::resolve_for_agent;
use crate::synthesizer::{synthesize, SynthesizedConfig};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, instrument};

/// Jobs and references of an agent, before any credential is fetched
#[derive(Debug, Clone)]
pub struct SynthesisPlan {
    pub jobs: Vec<ScrapeJob>,
    pub references: BTreeSet<CredentialRef>,
    /// Number of selected target objects
    pub targets: usize,
}

/// Resolve and normalize the targets of an agent and collect its references
pub fn plan(cache: &dyn TargetCache, agent: &VMAgent) -> Result<SynthesisPlan> {
    let mut targets = resolve_for_agent(cache, agent);
    targets.sort_by_key(|t| t.identity());

    let ctx = NormalizeContext::from_spec(&agent.spec);
    let mut jobs = Vec::new();
    for target in &targets {
        jobs.extend(normalize(target, &ctx)?);
    }
    let references = collect_refs(&jobs, agent)?;

    debug!(
        targets = targets.len(),
        jobs = jobs.len(),
        references = references.len(),
        "Planned synthesis"
    );
    Ok(SynthesisPlan {
        jobs,
        references,
        targets: targets.len(),
    })
}

/// Fetch the plan's credentials and synthesize
pub async fn execute(
    plan: SynthesisPlan,
    agent: &VMAgent,
    source: &dyn CredentialSource,
    attempt_timeout: Duration,
) -> Result<SynthesizedConfig> {
    let bundle = bundle(source, &plan.references, attempt_timeout).await?;
    synthesize(plan.jobs, agent, &bundle)
}

/// Plan and execute in one step
#[instrument(skip_all, fields(agent = %agent.metadata.name.as_deref().unwrap_or_default()))]
pub async fn run(
    cache: &dyn TargetCache,
    source: &dyn CredentialSource,
    agent: &VMAgent,
    attempt_timeout: Duration,
) -> Result<SynthesizedConfig> {
    let plan = plan(cache, agent)?;
    execute(plan, agent, source, attempt_timeout).await
}
