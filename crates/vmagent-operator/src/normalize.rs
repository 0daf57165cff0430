//! Conversion of scrape target objects into canonical scrape jobs
//!
//! Every target kind becomes one or more [`ScrapeJob`]s. Jobs carry
//! credential references, not credential bytes; the synthesizer turns
//! them into file paths once the bundle has been fetched.

use crate::credentials::CredentialRef;
use crate::crd::{
    EndpointAuth, NamespaceScope, RelabelConfig, ScrapeEndpoint, ScrapeSettings, Selector,
    SelectorOperator, SecretOrConfigMap, TlsConfig, VMAgentSpec, VMPodScrape, VMProbe,
    VMServiceScrape,
};
use crate::error::{OperatorError, Result};
use crate::selector::{ScrapeTarget, TargetKind};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relabel actions understood by the agent
const RELABEL_ACTIONS: &[&str] = &[
    "replace",
    "keep",
    "drop",
    "hashmod",
    "labelmap",
    "labeldrop",
    "labelkeep",
    "replace_all",
    "keep_if_equal",
    "drop_if_equal",
    "labelmap_all",
    "lowercase",
    "uppercase",
];

/// Where a job came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOrigin {
    pub kind: TargetKind,
    pub namespace: String,
    pub name: String,
}

/// Kubernetes service discovery role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdRole {
    Endpoints,
    Pod,
}

/// How the agent finds the job's targets
#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
    /// Kubernetes service discovery; empty `namespaces` means all
    Kubernetes {
        role: SdRole,
        namespaces: Vec<String>,
    },
    /// Fixed target list
    Static {
        targets: Vec<String>,
        labels: BTreeMap<String, String>,
    },
}

/// A relabeling rule in the agent's configuration format
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelabelRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulus: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl RelabelRule {
    fn keep(source: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            source_labels: vec![source.into()],
            regex: Some(regex.into()),
            action: Some("keep".to_string()),
            ..Default::default()
        }
    }

    fn drop(source: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            source_labels: vec![source.into()],
            regex: Some(regex.into()),
            action: Some("drop".to_string()),
            ..Default::default()
        }
    }

    fn copy(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_labels: vec![source.into()],
            target_label: Some(target.into()),
            ..Default::default()
        }
    }

    /// Set `target` to a fixed value
    pub fn set(target: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            target_label: Some(target.into()),
            replacement: Some(value.into()),
            ..Default::default()
        }
    }

    /// Reject unknown actions and normalize the action's case
    pub fn validated(mut self, object: &str) -> Result<Self> {
        if let Some(action) = self.action.take() {
            let lower = action.to_lowercase();
            if !RELABEL_ACTIONS.contains(&lower.as_str()) {
                return Err(OperatorError::malformed(
                    object,
                    format!("unknown relabel action '{}'", action),
                ));
            }
            self.action = Some(lower);
        }
        Ok(self)
    }
}

impl From<&RelabelConfig> for RelabelRule {
    fn from(c: &RelabelConfig) -> Self {
        Self {
            source_labels: c.source_labels.clone(),
            separator: c.separator.clone(),
            target_label: c.target_label.clone(),
            regex: c.regex.clone(),
            modulus: c.modulus,
            replacement: c.replacement.clone(),
            action: c.action.clone(),
        }
    }
}

/// Secret material referenced by a job
#[derive(Debug, Clone, PartialEq)]
pub enum SecretSource {
    /// Bundled from a Secret or ConfigMap
    Bundled(CredentialRef),
    /// A file that already exists in the agent container
    File(String),
}

/// TLS settings of a job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobTls {
    pub ca: Option<SecretSource>,
    pub cert: Option<SecretSource>,
    pub key: Option<SecretSource>,
    pub server_name: Option<String>,
    pub insecure_skip_verify: bool,
}

/// Basic auth of a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobBasicAuth {
    pub username: CredentialRef,
    pub password: CredentialRef,
}

/// Authentication of a job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobAuth {
    pub bearer_token: Option<SecretSource>,
    pub basic_auth: Option<JobBasicAuth>,
    pub tls: Option<JobTls>,
}

/// Canonical scrape job
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeJob {
    pub job_name: String,
    pub origin: JobOrigin,
    pub honor_labels: bool,
    pub honor_timestamps: Option<bool>,
    pub scrape_interval: Option<String>,
    pub scrape_timeout: Option<String>,
    pub metrics_path: Option<String>,
    pub scheme: Option<String>,
    pub params: BTreeMap<String, Vec<String>>,
    pub discovery: Discovery,
    pub relabel_configs: Vec<RelabelRule>,
    pub metric_relabel_configs: Vec<RelabelRule>,
    /// ConfigMap key with extra relabel rules, appended after the inline ones
    pub relabel_config_ref: Option<CredentialRef>,
    pub auth: JobAuth,
    pub sample_limit: Option<u64>,
}

/// Agent-wide settings that influence normalization
#[derive(Debug, Clone, Default)]
pub struct NormalizeContext {
    pub ignore_namespace_selectors: bool,
    pub deny_fs_access: bool,
}

impl NormalizeContext {
    pub fn from_spec(spec: &VMAgentSpec) -> Self {
        Self {
            ignore_namespace_selectors: spec.ignore_namespace_selectors,
            deny_fs_access: spec.arbitrary_fs_access_through_sms.deny,
        }
    }
}

/// Conversion of one target object into scrape jobs
pub trait IntoScrapeJobs {
    fn into_scrape_jobs(&self, ctx: &NormalizeContext) -> Result<Vec<ScrapeJob>>;
}

/// Normalize one selected target
pub fn normalize(target: &ScrapeTarget, ctx: &NormalizeContext) -> Result<Vec<ScrapeJob>> {
    target.into_scrape_jobs(ctx)
}

impl IntoScrapeJobs for ScrapeTarget {
    fn into_scrape_jobs(&self, ctx: &NormalizeContext) -> Result<Vec<ScrapeJob>> {
        match self {
            ScrapeTarget::Service(o) => o.into_scrape_jobs(ctx),
            ScrapeTarget::Pod(o) => o.into_scrape_jobs(ctx),
            ScrapeTarget::Probe(o) => o.into_scrape_jobs(ctx),
        }
    }
}

/// Meta label prefixes of one discovery role
struct RoleLabels {
    role: SdRole,
    label: &'static str,
    label_present: &'static str,
}

const ENDPOINTS_ROLE: RoleLabels = RoleLabels {
    role: SdRole::Endpoints,
    label: "__meta_kubernetes_service_label_",
    label_present: "__meta_kubernetes_service_labelpresent_",
};

const POD_ROLE: RoleLabels = RoleLabels {
    role: SdRole::Pod,
    label: "__meta_kubernetes_pod_label_",
    label_present: "__meta_kubernetes_pod_labelpresent_",
};

/// Replace every character that is invalid in a label name
pub fn sanitize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Relabel rules that keep only targets matching `selector`
fn selector_relabelings(selector: &Selector, role: &RoleLabels) -> Vec<RelabelRule> {
    let mut rules: Vec<RelabelRule> = selector
        .match_labels
        .iter()
        .map(|(k, v)| {
            RelabelRule::keep(
                format!("{}{}", role.label, sanitize_label_name(k)),
                regex::escape(v),
            )
        })
        .collect();

    for req in &selector.match_expressions {
        let key = sanitize_label_name(&req.key);
        let alternatives = || {
            let escaped: Vec<String> = req.values.iter().map(|v| regex::escape(v)).collect();
            escaped.join("|")
        };
        rules.push(match req.operator {
            SelectorOperator::In => {
                RelabelRule::keep(format!("{}{}", role.label, key), alternatives())
            }
            SelectorOperator::NotIn => {
                RelabelRule::drop(format!("{}{}", role.label, key), alternatives())
            }
            SelectorOperator::Exists => {
                RelabelRule::keep(format!("{}{}", role.label_present, key), "true")
            }
            SelectorOperator::DoesNotExist => {
                RelabelRule::drop(format!("{}{}", role.label_present, key), "true")
            }
        });
    }
    rules
}

/// Relabel rules that keep only the endpoint's port
fn port_relabelings(endpoint: &ScrapeEndpoint, role: SdRole) -> Vec<RelabelRule> {
    if let Some(ref port) = endpoint.port {
        let source = match role {
            SdRole::Endpoints => "__meta_kubernetes_endpoint_port_name",
            SdRole::Pod => "__meta_kubernetes_pod_container_port_name",
        };
        return vec![RelabelRule::keep(source, regex::escape(port))];
    }
    match endpoint.target_port {
        Some(ref tp) if tp.parse::<u16>().is_ok() => vec![RelabelRule::keep(
            "__meta_kubernetes_pod_container_port_number",
            tp.clone(),
        )],
        Some(ref tp) => vec![RelabelRule::keep(
            "__meta_kubernetes_pod_container_port_name",
            regex::escape(tp),
        )],
        None => Vec::new(),
    }
}

/// Namespaces a service or pod job discovers in
fn discovery_namespaces(scope: &NamespaceScope, own: &str, ctx: &NormalizeContext) -> Vec<String> {
    if ctx.ignore_namespace_selectors {
        return vec![own.to_string()];
    }
    if scope.any {
        return Vec::new();
    }
    if scope.match_names.is_empty() {
        return vec![own.to_string()];
    }
    let mut names = scope.match_names.clone();
    names.sort();
    names.dedup();
    names
}

fn secret_source(
    object: &str,
    namespace: &str,
    field: &str,
    source: Option<&SecretOrConfigMap>,
) -> Result<Option<SecretSource>> {
    let Some(source) = source else {
        return Ok(None);
    };
    match (&source.secret, &source.config_map) {
        (Some(s), None) => Ok(Some(SecretSource::Bundled(CredentialRef::secret(namespace, s)))),
        (None, Some(c)) => Ok(Some(SecretSource::Bundled(CredentialRef::config_map(
            namespace, c,
        )))),
        (None, None) => Ok(None),
        (Some(_), Some(_)) => Err(OperatorError::malformed(
            object,
            format!("{} must reference either a secret or a configMap, not both", field),
        )),
    }
}

/// Convert TLS settings, rejecting container files when access is denied
pub fn job_tls(
    object: &str,
    namespace: &str,
    tls: &TlsConfig,
    deny_fs_access: bool,
) -> Result<JobTls> {
    if deny_fs_access {
        let files = [&tls.ca_file, &tls.cert_file, &tls.key_file];
        if let Some(path) = files.into_iter().flatten().next() {
            return Err(OperatorError::malformed(
                object,
                format!("file access is denied, cannot use '{}'", path),
            ));
        }
    }

    let ca = secret_source(object, namespace, "tlsConfig.ca", tls.ca.as_ref())?
        .or_else(|| tls.ca_file.clone().map(SecretSource::File));
    let cert = secret_source(object, namespace, "tlsConfig.cert", tls.cert.as_ref())?
        .or_else(|| tls.cert_file.clone().map(SecretSource::File));
    let key = match tls.key_secret {
        Some(ref s) => Some(SecretSource::Bundled(CredentialRef::secret(namespace, s))),
        None => tls.key_file.clone().map(SecretSource::File),
    };

    Ok(JobTls {
        ca,
        cert,
        key,
        server_name: tls.server_name.clone(),
        insecure_skip_verify: tls.insecure_skip_verify,
    })
}

fn job_auth(object: &str, namespace: &str, auth: &EndpointAuth, ctx: &NormalizeContext) -> Result<JobAuth> {
    let has_bearer = auth.bearer_token_secret.is_some() || auth.bearer_token_file.is_some();
    if has_bearer && auth.basic_auth.is_some() {
        return Err(OperatorError::malformed(
            object,
            "bearer token and basic auth are mutually exclusive",
        ));
    }
    if ctx.deny_fs_access {
        if let Some(ref path) = auth.bearer_token_file {
            return Err(OperatorError::malformed(
                object,
                format!("file access is denied, cannot use '{}'", path),
            ));
        }
    }

    let bearer_token = match auth.bearer_token_secret {
        Some(ref s) => Some(SecretSource::Bundled(CredentialRef::secret(namespace, s))),
        None => auth.bearer_token_file.clone().map(SecretSource::File),
    };
    let basic_auth = auth.basic_auth.as_ref().map(|b| JobBasicAuth {
        username: CredentialRef::secret(namespace, &b.username),
        password: CredentialRef::secret(namespace, &b.password),
    });
    let tls = auth
        .tls_config
        .as_ref()
        .map(|t| job_tls(object, namespace, t, ctx.deny_fs_access))
        .transpose()?;

    Ok(JobAuth {
        bearer_token,
        basic_auth,
        tls,
    })
}

fn user_relabelings(object: &str, rules: &[RelabelConfig]) -> Result<Vec<RelabelRule>> {
    rules
        .iter()
        .map(|r| RelabelRule::from(r).validated(object))
        .collect()
}

/// Build a job skeleton from the settings shared by every kind
fn base_job(
    job_name: String,
    origin: JobOrigin,
    settings: &ScrapeSettings,
    discovery: Discovery,
    ctx: &NormalizeContext,
) -> Result<ScrapeJob> {
    let object = format!("{}/{}/{}", origin.kind, origin.namespace, origin.name);
    let auth = job_auth(&object, &origin.namespace, &settings.auth, ctx)?;
    let metric_relabel_configs = user_relabelings(&object, &settings.metric_relabel_configs)?;
    let relabel_config_ref = settings
        .relabel_config_ref
        .as_ref()
        .map(|r| CredentialRef::config_map(&origin.namespace, r));

    Ok(ScrapeJob {
        job_name,
        honor_labels: settings.honor_labels,
        honor_timestamps: settings.honor_timestamps,
        scrape_interval: settings.interval.clone(),
        scrape_timeout: settings.scrape_timeout.clone(),
        metrics_path: None,
        scheme: None,
        params: BTreeMap::new(),
        discovery,
        relabel_configs: Vec::new(),
        metric_relabel_configs,
        relabel_config_ref,
        auth,
        sample_limit: None,
        origin,
    })
}

/// Shared conversion of service and pod endpoints
struct EndpointJobs<'a> {
    kind: TargetKind,
    namespace: String,
    name: String,
    role: &'a RoleLabels,
    selector: &'a Selector,
    scope: &'a NamespaceScope,
    job_label: Option<&'a str>,
    target_labels: &'a [String],
    pod_target_labels: &'a [String],
    sample_limit: Option<u64>,
}

impl EndpointJobs<'_> {
    fn object(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }

    fn build(&self, endpoints: &[ScrapeEndpoint], ctx: &NormalizeContext) -> Result<Vec<ScrapeJob>> {
        let object = self.object();
        if endpoints.is_empty() {
            return Err(OperatorError::malformed(&object, "no endpoints declared"));
        }
        let namespaces = discovery_namespaces(self.scope, &self.namespace, ctx);

        endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                if endpoint.port.is_none() && endpoint.target_port.is_none() {
                    return Err(OperatorError::malformed(
                        &object,
                        format!("endpoint {} has neither port nor targetPort", index),
                    ));
                }
                let origin = JobOrigin {
                    kind: self.kind,
                    namespace: self.namespace.clone(),
                    name: self.name.clone(),
                };
                let discovery = Discovery::Kubernetes {
                    role: self.role.role,
                    namespaces: namespaces.clone(),
                };
                let mut job = base_job(
                    format!("{}/{}", object, index),
                    origin,
                    &endpoint.settings,
                    discovery,
                    ctx,
                )?;
                job.metrics_path = endpoint.path.clone();
                job.scheme = endpoint.scheme.clone();
                job.params = endpoint.params.clone();
                job.sample_limit = self.sample_limit;
                job.relabel_configs = self.relabelings(endpoint, &object)?;
                Ok(job)
            })
            .collect()
    }

    fn relabelings(&self, endpoint: &ScrapeEndpoint, object: &str) -> Result<Vec<RelabelRule>> {
        let mut rules = selector_relabelings(self.selector, self.role);
        rules.extend(port_relabelings(endpoint, self.role.role));

        rules.push(RelabelRule::copy("__meta_kubernetes_namespace", "namespace"));
        if self.role.role == SdRole::Endpoints {
            rules.push(RelabelRule::copy("__meta_kubernetes_service_name", "service"));
        }
        rules.push(RelabelRule::copy("__meta_kubernetes_pod_name", "pod"));
        rules.push(RelabelRule::copy("__meta_kubernetes_pod_container_name", "container"));

        for label in self.target_labels {
            rules.push(RelabelRule::copy(
                format!("__meta_kubernetes_service_label_{}", sanitize_label_name(label)),
                sanitize_label_name(label),
            ));
        }
        for label in self.pod_target_labels {
            rules.push(RelabelRule::copy(
                format!("__meta_kubernetes_pod_label_{}", sanitize_label_name(label)),
                sanitize_label_name(label),
            ));
        }

        match self.role.role {
            SdRole::Endpoints => {
                rules.push(RelabelRule::copy("__meta_kubernetes_service_name", "job"))
            }
            SdRole::Pod => rules.push(RelabelRule::set(
                "job",
                format!("{}/{}", self.namespace, self.name),
            )),
        }
        if let Some(job_label) = self.job_label {
            rules.push(RelabelRule {
                source_labels: vec![format!(
                    "{}{}",
                    self.role.label,
                    sanitize_label_name(job_label)
                )],
                target_label: Some("job".to_string()),
                regex: Some("(.+)".to_string()),
                replacement: Some("${1}".to_string()),
                ..Default::default()
            });
        }
        if let Some(ref port) = endpoint.port {
            rules.push(RelabelRule::set("endpoint", port.clone()));
        }

        rules.extend(user_relabelings(object, &endpoint.settings.relabel_configs)?);
        Ok(rules)
    }
}

impl IntoScrapeJobs for VMServiceScrape {
    fn into_scrape_jobs(&self, ctx: &NormalizeContext) -> Result<Vec<ScrapeJob>> {
        EndpointJobs {
            kind: TargetKind::Service,
            namespace: self.namespace().unwrap_or_default(),
            name: self.name_any(),
            role: &ENDPOINTS_ROLE,
            selector: &self.spec.selector,
            scope: &self.spec.namespace_selector,
            job_label: self.spec.job_label.as_deref(),
            target_labels: &self.spec.target_labels,
            pod_target_labels: &self.spec.pod_target_labels,
            sample_limit: self.spec.sample_limit,
        }
        .build(&self.spec.endpoints, ctx)
    }
}

impl IntoScrapeJobs for VMPodScrape {
    fn into_scrape_jobs(&self, ctx: &NormalizeContext) -> Result<Vec<ScrapeJob>> {
        EndpointJobs {
            kind: TargetKind::Pod,
            namespace: self.namespace().unwrap_or_default(),
            name: self.name_any(),
            role: &POD_ROLE,
            selector: &self.spec.selector,
            scope: &self.spec.namespace_selector,
            job_label: self.spec.job_label.as_deref(),
            target_labels: &[],
            pod_target_labels: &self.spec.pod_target_labels,
            sample_limit: self.spec.sample_limit,
        }
        .build(&self.spec.pod_metrics_endpoints, ctx)
    }
}

impl IntoScrapeJobs for VMProbe {
    fn into_scrape_jobs(&self, ctx: &NormalizeContext) -> Result<Vec<ScrapeJob>> {
        let namespace = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let object = format!("{}/{}/{}", TargetKind::Probe, namespace, name);
        let spec = &self.spec;

        if spec.prober.url.is_empty() {
            return Err(OperatorError::malformed(&object, "prober url is empty"));
        }
        if spec.targets.is_empty() {
            return Err(OperatorError::malformed(&object, "no targets declared"));
        }
        let user_rules = user_relabelings(&object, &spec.settings.relabel_configs)?;
        let single = spec.targets.len() == 1;

        spec.targets
            .iter()
            .enumerate()
            .map(|(index, group)| {
                if group.targets.is_empty() {
                    return Err(OperatorError::malformed(
                        &object,
                        format!("target group {} has an empty target list", index),
                    ));
                }
                let module = group.module.as_deref().unwrap_or(&spec.module);
                if module.is_empty() {
                    return Err(OperatorError::malformed(
                        &object,
                        format!("target group {} has no prober module", index),
                    ));
                }

                let job_name = match spec.job_name {
                    Some(ref j) if single => j.clone(),
                    Some(ref j) => format!("{}/{}", j, index),
                    None => format!("{}/{}", object, index),
                };
                let mut targets = group.targets.clone();
                targets.sort();
                targets.dedup();
                let discovery = Discovery::Static {
                    targets,
                    labels: group.labels.clone(),
                };
                let origin = JobOrigin {
                    kind: TargetKind::Probe,
                    namespace: namespace.clone(),
                    name: name.clone(),
                };

                let mut job = base_job(job_name, origin, &spec.settings, discovery, ctx)?;
                job.metrics_path = Some(
                    spec.prober
                        .path
                        .clone()
                        .unwrap_or_else(|| "/probe".to_string()),
                );
                job.scheme = spec.prober.scheme.clone();
                job.params = BTreeMap::from([("module".to_string(), vec![module.to_string()])]);

                let mut rules = vec![
                    RelabelRule::copy("__address__", "__param_target"),
                    RelabelRule::copy("__param_target", "instance"),
                    RelabelRule::set("__address__", spec.prober.url.clone()),
                ];
                rules.extend(user_rules.iter().cloned());
                job.relabel_configs = rules;
                Ok(job)
            })
            .collect()
    }
}

/// Set `label` to the origin namespace on every job and every sample
pub fn enforce_namespace_label(jobs: &mut [ScrapeJob], label: &str) {
    for job in jobs.iter_mut() {
        let rule = RelabelRule::set(label, job.origin.namespace.clone());
        job.relabel_configs.push(rule.clone());
        job.metric_relabel_configs.push(rule);
    }
}

/// Apply the agent-wide honor overrides
pub fn apply_global_overrides(jobs: &mut [ScrapeJob], override_labels: bool, override_timestamps: bool) {
    for job in jobs.iter_mut() {
        if override_labels {
            job.honor_labels = false;
        }
        if override_timestamps {
            job.honor_timestamps = Some(false);
        }
    }
}
