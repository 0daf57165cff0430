//! Configuration synthesis
//!
//! Merges normalized scrape jobs, agent-wide settings and the credential
//! bundle into the scrape document and remote write flags consumed by the
//! agent. Synthesis is a pure function of its inputs: the same inputs in
//! any order produce the same document and hash.

use crate::credentials::{CredentialBundle, CredentialRef};
use crate::crd::{RemoteWriteSpec, VMAgent, DEFAULT_SCRAPE_INTERVAL};
use crate::error::{OperatorError, Result};
use crate::normalize::{
    apply_global_overrides, enforce_namespace_label, job_tls, Discovery, JobTls, RelabelRule,
    ScrapeJob, SdRole, SecretSource,
};
use kube::ResourceExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Directory the config secret is mounted at in the agent container
pub const CONFIG_MOUNT_PATH: &str = "/etc/vmagent/config";

/// Key of the scrape document in the config secret
pub const SCRAPE_CONFIG_KEY: &str = "vmagent.yaml";

/// Root of derived remote write buffer directories
pub const DEFAULT_TMP_DATA_ROOT: &str = "/tmp/vmagent-remotewrite-data";

/// Extra arg overriding [`DEFAULT_TMP_DATA_ROOT`]
pub const TMP_DATA_PATH_ARG: &str = "remoteWrite.tmpDataPath";

const DEFAULT_FLUSH_INTERVAL: &str = "1s";
const DEFAULT_SEND_TIMEOUT: &str = "1m";
const DEFAULT_EXTERNAL_LABEL_NAME: &str = "prometheus";
const GLOBAL_RELABEL_FILE: &str = "global_relabel.yaml";

/// Output of one synthesis pass
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedConfig {
    /// Rendered scrape document (YAML)
    pub scrape_config: String,
    /// Remote write flags, in target order
    pub remote_write_args: Vec<String>,
    /// Relabeling files stored next to the scrape document
    pub relabel_files: BTreeMap<String, String>,
    /// Credential files mounted into the agent
    pub bundle: CredentialBundle,
    /// Number of generated jobs
    pub job_count: usize,
    /// Hex SHA-256 over everything above
    pub hash: String,
}

impl SynthesizedConfig {
    /// Data of the config secret
    pub fn config_secret_data(&self) -> BTreeMap<String, String> {
        let mut data = self.relabel_files.clone();
        data.insert(SCRAPE_CONFIG_KEY.to_string(), self.scrape_config.clone());
        data
    }
}

#[derive(Debug, Serialize)]
struct ScrapeDocument {
    global: GlobalSection,
    scrape_configs: Vec<serde_yaml::Value>,
}

#[derive(Debug, Serialize)]
struct GlobalSection {
    scrape_interval: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    external_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct JobConfig {
    job_name: String,
    honor_labels: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    honor_timestamps: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scrape_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scrape_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheme: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    kubernetes_sd_configs: Vec<KubernetesSdConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    static_configs: Vec<StaticConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bearer_token_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    basic_auth: Option<BasicAuthConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_config: Option<TlsFiles>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    relabel_configs: Vec<RelabelRule>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    metric_relabel_configs: Vec<RelabelRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct KubernetesSdConfig {
    role: SdRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespaces: Option<NamespaceNames>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct NamespaceNames {
    names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct StaticConfig {
    targets: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct BasicAuthConfig {
    username: String,
    password_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct TlsFiles {
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cert_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_name: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    insecure_skip_verify: bool,
}

fn source_path(source: &SecretSource) -> String {
    match source {
        SecretSource::Bundled(r) => CredentialBundle::path_for(r),
        SecretSource::File(path) => path.clone(),
    }
}

fn tls_files(tls: &JobTls) -> TlsFiles {
    TlsFiles {
        ca_file: tls.ca.as_ref().map(source_path),
        cert_file: tls.cert.as_ref().map(source_path),
        key_file: tls.key.as_ref().map(source_path),
        server_name: tls.server_name.clone(),
        insecure_skip_verify: tls.insecure_skip_verify,
    }
}

/// Parse a YAML list of relabel rules
fn parse_relabel_rules(object: &str, content: &str) -> Result<Vec<RelabelRule>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rules: Vec<RelabelRule> = serde_yaml::from_str(content).map_err(|e| {
        OperatorError::malformed(object, format!("invalid relabel rules: {}", e))
    })?;
    rules.into_iter().map(|r| r.validated(object)).collect()
}

fn bundled_relabel_rules(bundle: &CredentialBundle, reference: &CredentialRef) -> Result<Vec<RelabelRule>> {
    let content = bundle.get_str(reference)?;
    parse_relabel_rules(&reference.to_string(), content)
}

fn render_job(job: &ScrapeJob, bundle: &CredentialBundle) -> Result<JobConfig> {
    let (kubernetes_sd_configs, static_configs) = match job.discovery {
        Discovery::Kubernetes {
            role,
            ref namespaces,
        } => {
            let namespaces = (!namespaces.is_empty()).then(|| NamespaceNames {
                names: namespaces.clone(),
            });
            (vec![KubernetesSdConfig { role, namespaces }], Vec::new())
        }
        Discovery::Static {
            ref targets,
            ref labels,
        } => (
            Vec::new(),
            vec![StaticConfig {
                targets: targets.clone(),
                labels: labels.clone(),
            }],
        ),
    };

    let basic_auth = job
        .auth
        .basic_auth
        .as_ref()
        .map(|b| -> Result<BasicAuthConfig> {
            Ok(BasicAuthConfig {
                username: bundle.get_str(&b.username)?.to_string(),
                password_file: CredentialBundle::path_for(&b.password),
            })
        })
        .transpose()?;

    Ok(JobConfig {
        job_name: job.job_name.clone(),
        honor_labels: job.honor_labels,
        honor_timestamps: job.honor_timestamps,
        scrape_interval: job.scrape_interval.clone(),
        scrape_timeout: job.scrape_timeout.clone(),
        metrics_path: job.metrics_path.clone(),
        scheme: job.scheme.clone(),
        params: job.params.clone(),
        kubernetes_sd_configs,
        static_configs,
        bearer_token_file: job.auth.bearer_token.as_ref().map(source_path),
        basic_auth,
        tls_config: job.auth.tls.as_ref().map(tls_files),
        relabel_configs: job.relabel_configs.clone(),
        metric_relabel_configs: job.metric_relabel_configs.clone(),
        sample_limit: job.sample_limit,
    })
}

/// Sort jobs by name, collapse identical duplicates, reject differing ones
fn merge_jobs(mut jobs: Vec<(ScrapeJob, JobConfig)>) -> Result<Vec<JobConfig>> {
    jobs.sort_by(|a, b| a.1.job_name.cmp(&b.1.job_name));
    let mut merged: Vec<(ScrapeJob, JobConfig)> = Vec::with_capacity(jobs.len());
    for (job, config) in jobs {
        match merged.last() {
            Some((prev_job, prev)) if prev.job_name == config.job_name => {
                if *prev != config {
                    return Err(OperatorError::Conflict(format!(
                        "job '{}' is defined differently by {}/{}/{} and {}/{}/{}",
                        config.job_name,
                        prev_job.origin.kind,
                        prev_job.origin.namespace,
                        prev_job.origin.name,
                        job.origin.kind,
                        job.origin.namespace,
                        job.origin.name
                    )));
                }
            }
            _ => merged.push((job, config)),
        }
    }
    Ok(merged.into_iter().map(|(_, c)| c).collect())
}

/// Host part of a URL, reduced to `[A-Za-z0-9.-]` for directory names
fn url_host(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    // Bracketed IPv6 literals keep their colons inside the brackets
    let (address, port) = match host.rsplit_once(':') {
        Some((a, p)) if !p.contains(']') => (a, Some(p)),
        _ => (host, None),
    };
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    match port {
        Some(port) => format!("{}-{}", sanitize(address), sanitize(port)),
        None => sanitize(address),
    }
}

/// Root of the derived buffer directories
pub fn tmp_data_root(agent: &VMAgent) -> &str {
    agent
        .spec
        .extra_args
        .get(TMP_DATA_PATH_ARG)
        .map(String::as_str)
        .unwrap_or(DEFAULT_TMP_DATA_ROOT)
}

/// Whether `path` lies inside the directory `root`
pub fn is_under(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

/// Buffer directory of one remote write target
pub fn tmp_data_path(root: &str, index: usize, rw: &RemoteWriteSpec) -> String {
    if let Some(ref path) = rw.tmp_data_path {
        return path.clone();
    }
    let digest = hex::encode(Sha256::digest(rw.url.as_bytes()));
    format!(
        "{}/{}-{}-{}",
        root.trim_end_matches('/'),
        index,
        url_host(&rw.url),
        &digest[..8]
    )
}

/// Emit `-remoteWrite.<flag>=v1,v2,...` when any target sets the flag
fn push_array(args: &mut Vec<String>, flag: &str, values: Vec<Option<String>>) {
    if values.iter().all(Option::is_none) {
        return;
    }
    let joined: Vec<String> = values.into_iter().map(Option::unwrap_or_default).collect();
    args.push(format!("-remoteWrite.{}={}", flag, joined.join(",")));
}

struct RemoteWriteOutput {
    args: Vec<String>,
    relabel_files: BTreeMap<String, String>,
}

fn render_rules(rules: &[RelabelRule]) -> Result<String> {
    Ok(serde_yaml::to_string(rules)?)
}

fn remote_write_args(agent: &VMAgent, bundle: &CredentialBundle) -> Result<RemoteWriteOutput> {
    let namespace = agent.namespace().unwrap_or_default();
    let spec = &agent.spec;
    let root = tmp_data_root(agent);

    let mut args = Vec::new();
    let mut relabel_files = BTreeMap::new();

    let targets = &spec.remote_write;
    let mut paths = Vec::with_capacity(targets.len());
    let mut seen = BTreeSet::new();
    for (index, rw) in targets.iter().enumerate() {
        let path = tmp_data_path(root, index, rw);
        if !seen.insert(path.clone()) {
            return Err(OperatorError::Conflict(format!(
                "remote write targets share the buffer directory '{}'",
                path
            )));
        }
        paths.push(path);
    }

    let mut tls = Vec::with_capacity(targets.len());
    let mut url_relabel = Vec::with_capacity(targets.len());
    let mut usernames = Vec::with_capacity(targets.len());
    for (index, rw) in targets.iter().enumerate() {
        let object = format!(
            "VMAgent/{}/{}/remoteWrite/{}",
            namespace,
            agent.name_any(),
            index
        );
        args.push(format!("-remoteWrite.url={}", rw.url));

        tls.push(
            rw.tls_config
                .as_ref()
                .map(|t| job_tls(&object, &namespace, t, false).map(|t| tls_files(&t)))
                .transpose()?,
        );

        let mut rules = match rw.url_relabel_config {
            Some(ref r) => bundled_relabel_rules(bundle, &CredentialRef::config_map(&namespace, r))?,
            None => Vec::new(),
        };
        rules.extend(rw.labels.iter().map(|(k, v)| RelabelRule::set(k.clone(), v.clone())));
        if rules.is_empty() {
            url_relabel.push(None);
        } else {
            let file = format!("url_relabel_{}.yaml", index);
            relabel_files.insert(file.clone(), render_rules(&rules)?);
            url_relabel.push(Some(format!("{}/{}", CONFIG_MOUNT_PATH, file)));
        }

        usernames.push(
            rw.basic_auth
                .as_ref()
                .map(|b| -> Result<String> {
                    let user = bundle
                        .get_str(&CredentialRef::secret(&namespace, &b.username))?
                        .to_string();
                    if user.contains(',') {
                        return Err(OperatorError::malformed(
                            &object,
                            "basic auth username must not contain ','",
                        ));
                    }
                    Ok(user)
                })
                .transpose()?,
        );
    }

    push_array(&mut args, "tmpDataPath", paths.into_iter().map(Some).collect());
    push_array(
        &mut args,
        "flushInterval",
        targets
            .iter()
            .map(|rw| {
                Some(
                    rw.flush_interval
                        .clone()
                        .unwrap_or_else(|| DEFAULT_FLUSH_INTERVAL.to_string()),
                )
            })
            .collect(),
    );
    push_array(
        &mut args,
        "sendTimeout",
        targets
            .iter()
            .map(|rw| {
                Some(
                    rw.send_timeout
                        .clone()
                        .unwrap_or_else(|| DEFAULT_SEND_TIMEOUT.to_string()),
                )
            })
            .collect(),
    );
    push_array(
        &mut args,
        "maxBlockSize",
        targets.iter().map(|rw| rw.max_block_size.map(|v| v.to_string())).collect(),
    );
    push_array(
        &mut args,
        "maxDiskUsagePerURL",
        targets
            .iter()
            .map(|rw| rw.max_disk_usage_per_url.map(|v| v.to_string()))
            .collect(),
    );
    push_array(
        &mut args,
        "queues",
        targets.iter().map(|rw| rw.queues.map(|v| v.to_string())).collect(),
    );
    push_array(
        &mut args,
        "showURL",
        targets.iter().map(|rw| rw.show_url.map(|v| v.to_string())).collect(),
    );
    push_array(&mut args, "urlRelabelConfig", url_relabel);
    push_array(&mut args, "basicAuth.username", usernames);
    push_array(
        &mut args,
        "basicAuth.passwordFile",
        targets
            .iter()
            .map(|rw| {
                rw.basic_auth.as_ref().map(|b| {
                    CredentialBundle::path_for(&CredentialRef::secret(&namespace, &b.password))
                })
            })
            .collect(),
    );
    push_array(
        &mut args,
        "bearerTokenFile",
        targets
            .iter()
            .map(|rw| {
                rw.bearer_token_secret
                    .as_ref()
                    .map(|t| CredentialBundle::path_for(&CredentialRef::secret(&namespace, t)))
            })
            .collect(),
    );
    push_array(
        &mut args,
        "tlsCAFile",
        tls.iter().map(|t| t.as_ref().and_then(|t| t.ca_file.clone())).collect(),
    );
    push_array(
        &mut args,
        "tlsCertFile",
        tls.iter().map(|t| t.as_ref().and_then(|t| t.cert_file.clone())).collect(),
    );
    push_array(
        &mut args,
        "tlsKeyFile",
        tls.iter().map(|t| t.as_ref().and_then(|t| t.key_file.clone())).collect(),
    );
    push_array(
        &mut args,
        "tlsServerName",
        tls.iter().map(|t| t.as_ref().and_then(|t| t.server_name.clone())).collect(),
    );
    push_array(
        &mut args,
        "tlsInsecureSkipVerify",
        tls.iter()
            .map(|t| {
                t.as_ref()
                    .filter(|t| t.insecure_skip_verify)
                    .map(|_| "true".to_string())
            })
            .collect(),
    );

    if let Some(ref r) = spec.relabel_config {
        let rules = bundled_relabel_rules(bundle, &CredentialRef::config_map(&namespace, r))?;
        relabel_files.insert(GLOBAL_RELABEL_FILE.to_string(), render_rules(&rules)?);
        args.push(format!(
            "-remoteWrite.relabelConfig={}/{}",
            CONFIG_MOUNT_PATH, GLOBAL_RELABEL_FILE
        ));
    }

    Ok(RemoteWriteOutput {
        args,
        relabel_files,
    })
}

fn external_labels(agent: &VMAgent) -> BTreeMap<String, String> {
    let mut labels = agent.spec.external_labels.clone();
    let name = agent
        .spec
        .vm_agent_external_label_name
        .as_deref()
        .unwrap_or(DEFAULT_EXTERNAL_LABEL_NAME);
    if !name.is_empty() {
        labels.insert(
            name.to_string(),
            format!("{}/{}", agent.namespace().unwrap_or_default(), agent.name_any()),
        );
    }
    labels
}

/// Raw scrape configs appended after the generated jobs
fn additional_scrape_configs(agent: &VMAgent, bundle: &CredentialBundle) -> Result<Vec<serde_yaml::Value>> {
    let Some(ref extra) = agent.spec.additional_scrape_configs else {
        return Ok(Vec::new());
    };
    let reference = CredentialRef::secret(&agent.namespace().unwrap_or_default(), extra);
    let content = bundle.get_str(&reference)?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(content).map_err(|e| {
        OperatorError::malformed(
            reference.to_string(),
            format!("additionalScrapeConfigs is not a YAML list: {}", e),
        )
    })
}

/// Synthesize the agent configuration
///
/// Merge order, lowest to highest: per-job settings, namespace
/// enforcement, global honor overrides, raw additional scrape configs.
pub fn synthesize(
    mut jobs: Vec<ScrapeJob>,
    agent: &VMAgent,
    bundle: &CredentialBundle,
) -> Result<SynthesizedConfig> {
    let spec = &agent.spec;

    for job in jobs.iter_mut() {
        if let Some(ref reference) = job.relabel_config_ref {
            let rules = bundled_relabel_rules(bundle, reference)?;
            job.relabel_configs.extend(rules);
        }
    }
    if let Some(label) = spec.enforced_namespace_label.as_deref().filter(|l| !l.is_empty()) {
        enforce_namespace_label(&mut jobs, label);
    }
    apply_global_overrides(
        &mut jobs,
        spec.override_honor_labels,
        spec.override_honor_timestamps,
    );

    let rendered = jobs
        .into_iter()
        .map(|job| render_job(&job, bundle).map(|config| (job, config)))
        .collect::<Result<Vec<_>>>()?;
    let merged = merge_jobs(rendered)?;
    let job_count = merged.len();

    let mut scrape_configs = merged
        .iter()
        .map(serde_yaml::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    scrape_configs.extend(additional_scrape_configs(agent, bundle)?);

    let document = ScrapeDocument {
        global: GlobalSection {
            scrape_interval: spec
                .scrape_interval
                .clone()
                .unwrap_or_else(|| DEFAULT_SCRAPE_INTERVAL.to_string()),
            external_labels: external_labels(agent),
        },
        scrape_configs,
    };
    let scrape_config = serde_yaml::to_string(&document)?;
    let remote_write = remote_write_args(agent, bundle)?;

    let mut hasher = Sha256::new();
    hasher.update(scrape_config.as_bytes());
    hasher.update([0u8]);
    for arg in &remote_write.args {
        hasher.update(arg.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update([0u8]);
    for (name, content) in &remote_write.relabel_files {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
    }
    hasher.update([0u8]);
    bundle.digest_into(&mut hasher);
    let hash = hex::encode(hasher.finalize());

    debug!(
        jobs = job_count,
        remote_write = spec.remote_write.len(),
        hash = %hash,
        "Synthesized configuration"
    );

    Ok(SynthesizedConfig {
        scrape_config,
        remote_write_args: remote_write.args,
        relabel_files: remote_write.relabel_files,
        bundle: bundle.clone(),
        job_count,
        hash,
    })
}
