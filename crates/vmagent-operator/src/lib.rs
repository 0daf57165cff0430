//! # VMAgent Kubernetes Operator
//!
//! Kubernetes operator that discovers scrape targets through label and
//! namespace selectors and keeps a metrics agent deployment converged to
//! the resulting scrape configuration.
//!
//! ## Features
//!
//! - **Custom Resource Definitions**: `VMAgent`, `VMServiceScrape`,
//!   `VMPodScrape` and `VMProbe`
//! - **Selector-based discovery**: targets are unmanaged until an agent
//!   sets a label or namespace selector for their kind
//! - **Deterministic synthesis**: identical inputs always render the same
//!   scrape document and the same content hash
//! - **All-or-nothing credentials**: every referenced Secret or ConfigMap
//!   key is bundled, or the pass fails and the previous configuration
//!   stays in force
//! - **Hash-gated apply**: no write is issued when nothing changed
//! - **Observability**: Prometheus-compatible operator metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vmagent_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, OperatorConfig::default()).await
//! }
//! ```
//!
//! The synthesis pipeline also runs without a cluster:
//!
//! ```rust,ignore
//! use vmagent_operator::prelude::*;
//!
//! let cache = StaticCache::default();
//! let config = pipeline::run(&cache, &source, &agent, Duration::from_secs(10)).await?;
//! println!("{}", config.scrape_config);
//! ```
//!
//! ## Architecture
//!
//! Each pass for one agent runs these stages:
//!
//! 1. **Resolve** ([`selector`]): select target objects from the watch
//!    caches ([`cache`])
//! 2. **Normalize** ([`normalize`]): turn each target into scrape jobs
//! 3. **Bundle** ([`credentials`]): fetch every referenced credential
//! 4. **Synthesize** ([`synthesizer`]): render the scrape document,
//!    remote-write arguments and content hash
//! 5. **Converge** ([`convergence`]): apply the config and the workload
//!    ([`resources`]) when the hashes changed
//!
//! [`controller`] drives these passes from kube-rs watches.
//!
//! ## Custom Resource Definitions
//!
//! ### VMAgent
//!
//! ```yaml
//! apiVersion: operator.victoriametrics.com/v1beta1
//! kind: VMAgent
//! metadata:
//!   name: main
//!   namespace: monitoring
//! spec:
//!   replicaCount: 1
//!   serviceScrapeSelector:
//!     matchLabels:
//!       team: web
//!   serviceScrapeNamespaceSelector: {}
//!   remoteWrite:
//!     - url: http://vminsert:8480/insert/0/prometheus/api/v1/write
//!       bearerTokenSecret:
//!         name: remote-write
//!         key: token
//! ```
//!
//! ### VMServiceScrape
//!
//! ```yaml
//! apiVersion: operator.victoriametrics.com/v1beta1
//! kind: VMServiceScrape
//! metadata:
//!   name: web
//!   namespace: shop
//!   labels:
//!     team: web
//! spec:
//!   selector:
//!     matchLabels:
//!       app: web
//!   endpoints:
//!     - port: http
//!       interval: 15s
//! ```
//!
//! ### VMProbe
//!
//! ```yaml
//! apiVersion: operator.victoriametrics.com/v1beta1
//! kind: VMProbe
//! metadata:
//!   name: uptime
//! spec:
//!   module: http_2xx
//!   vmProberSpec:
//!     url: blackbox-exporter:9115
//!   targets:
//!     - targets: ["https://example.com"]
//! ```
//!
//! ## Security
//!
//! Generated pods run as non-root with a read-only root filesystem, all
//! capabilities dropped and the RuntimeDefault seccomp profile.
//!
//! ## Metrics
//!
//! - `vmagent_operator_reconciliations_total` - Reconciliation attempts
//! - `vmagent_operator_reconciliation_errors_total` - Reconciliation errors
//! - `vmagent_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `vmagent_operator_workload_updates_total` - Workload writes
//! - `vmagent_operator_skipped_applies_total` - Passes with nothing to change

pub mod cache;
pub mod controller;
pub mod convergence;
pub mod crd;
pub mod credentials;
pub mod error;
pub mod normalize;
pub mod pipeline;
pub mod resources;
pub mod selector;
pub mod synthesizer;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::cache::{ClusterCache, StaticCache, TargetCache};
    pub use crate::controller::{
        run_controller, ControllerContext, ControllerMetrics, KubeWorkloadApplier,
        OperatorConfig, ReferenceIndex,
    };
    pub use crate::convergence::{
        ApplyOutcome, Convergence, ConvergenceState, ObservedReplicas, WorkloadApplier,
    };
    pub use crate::crd::{
        crds, AgentCondition, AgentPhase, RemoteWriteSpec, ScrapeEndpoint, Selector, VMAgent,
        VMAgentSpec, VMAgentStatus, VMPodScrape, VMPodScrapeSpec, VMProbe, VMProbeSpec,
        VMServiceScrape, VMServiceScrapeSpec,
    };
    pub use crate::credentials::{
        CredentialBundle, CredentialRef, CredentialSource, KubeCredentialSource,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::normalize::{IntoScrapeJobs, ScrapeJob};
    pub use crate::pipeline;
    pub use crate::resources::ResourceBuilder;
    pub use crate::selector::{ScrapeTarget, TargetKind};
    pub use crate::synthesizer::{synthesize, SynthesizedConfig};
}
