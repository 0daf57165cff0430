//! Selector resolution over the watched scrape target objects
//!
//! An agent selects scrape objects with a pair of selectors per kind: one
//! over namespace labels and one over object labels. A kind with neither
//! selector set is unmanaged and contributes nothing.

use crate::cache::TargetCache;
use crate::crd::{
    Selector, SelectorOperator, SelectorRequirement, VMAgent, VMPodScrape, VMProbe,
    VMServiceScrape,
};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The three kinds of scrape target objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKind {
    Service,
    Pod,
    Probe,
}

impl TargetKind {
    /// All kinds in synthesis order
    pub const ALL: [TargetKind; 3] = [TargetKind::Service, TargetKind::Pod, TargetKind::Probe];

    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Service => "VMServiceScrape",
            TargetKind::Pod => "VMPodScrape",
            TargetKind::Probe => "VMProbe",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scrape target object read from the cache
#[derive(Debug, Clone)]
pub enum ScrapeTarget {
    Service(Arc<VMServiceScrape>),
    Pod(Arc<VMPodScrape>),
    Probe(Arc<VMProbe>),
}

impl ScrapeTarget {
    pub fn kind(&self) -> TargetKind {
        match self {
            ScrapeTarget::Service(_) => TargetKind::Service,
            ScrapeTarget::Pod(_) => TargetKind::Pod,
            ScrapeTarget::Probe(_) => TargetKind::Probe,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ScrapeTarget::Service(o) => o.name_any(),
            ScrapeTarget::Pod(o) => o.name_any(),
            ScrapeTarget::Probe(o) => o.name_any(),
        }
    }

    pub fn namespace(&self) -> String {
        let ns = match self {
            ScrapeTarget::Service(o) => o.namespace(),
            ScrapeTarget::Pod(o) => o.namespace(),
            ScrapeTarget::Probe(o) => o.namespace(),
        };
        ns.unwrap_or_default()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            ScrapeTarget::Service(o) => o.labels(),
            ScrapeTarget::Pod(o) => o.labels(),
            ScrapeTarget::Probe(o) => o.labels(),
        }
    }

    /// `<kind>/<namespace>/<name>`
    pub fn identity(&self) -> String {
        format!("{}/{}/{}", self.kind(), self.namespace(), self.name())
    }
}

impl SelectorRequirement {
    /// Check a single requirement against a label set
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => !value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

impl Selector {
    /// Check if the selector matches a label set
    ///
    /// Every `matchLabels` entry and every expression must match. The empty
    /// selector matches everything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }
}

/// Resolve the target objects of one kind
///
/// - both selectors absent: unmanaged, nothing is returned
/// - only the label selector: objects in `own_namespace`
/// - namespace selector set: objects in every namespace whose labels match,
///   filtered by the label selector when present
pub fn resolve(
    cache: &dyn TargetCache,
    kind: TargetKind,
    namespace_selector: Option<&Selector>,
    label_selector: Option<&Selector>,
    own_namespace: &str,
) -> Vec<ScrapeTarget> {
    if namespace_selector.is_none() && label_selector.is_none() {
        return Vec::new();
    }

    let namespaces: BTreeSet<String> = match namespace_selector {
        None => BTreeSet::from([own_namespace.to_string()]),
        Some(sel) => cache
            .namespaces()
            .into_iter()
            .filter(|(_, labels)| sel.matches(labels))
            .map(|(name, _)| name)
            .collect(),
    };

    let selected: Vec<ScrapeTarget> = cache
        .targets(kind)
        .into_iter()
        .filter(|t| namespaces.contains(&t.namespace()))
        .filter(|t| label_selector.map_or(true, |sel| sel.matches(t.labels())))
        .collect();

    debug!(
        kind = %kind,
        namespaces = namespaces.len(),
        selected = selected.len(),
        "Resolved scrape targets"
    );
    selected
}

/// Resolve every kind for an agent
pub fn resolve_for_agent(cache: &dyn TargetCache, agent: &VMAgent) -> Vec<ScrapeTarget> {
    let own_namespace = agent.namespace().unwrap_or_default();
    let spec = &agent.spec;
    TargetKind::ALL
        .iter()
        .flat_map(|&kind| {
            let (ns_sel, label_sel) = match kind {
                TargetKind::Service => (
                    spec.service_scrape_namespace_selector.as_ref(),
                    spec.service_scrape_selector.as_ref(),
                ),
                TargetKind::Pod => (
                    spec.pod_scrape_namespace_selector.as_ref(),
                    spec.pod_scrape_selector.as_ref(),
                ),
                TargetKind::Probe => (
                    spec.probe_namespace_selector.as_ref(),
                    spec.probe_selector.as_ref(),
                ),
            };
            resolve(cache, kind, ns_sel, label_sel, &own_namespace)
        })
        .collect()
}
