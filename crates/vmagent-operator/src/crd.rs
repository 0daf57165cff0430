//! Custom Resource Definitions for the VMAgent operator
//!
//! This module defines the `VMAgent` CRD (the desired state of one metrics
//! collection agent) and the three scrape target kinds it discovers:
//! `VMServiceScrape`, `VMPodScrape` and `VMProbe`.

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResource, CustomResourceExt, ResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group shared by every CRD in this module
pub const API_GROUP: &str = "operator.victoriametrics.com";

/// Default vmagent image repository
pub const DEFAULT_IMAGE_REPOSITORY: &str = "victoriametrics/vmagent";

/// Default vmagent image tag
pub const DEFAULT_IMAGE_TAG: &str = "v1.93.5";

/// Default config reloader sidecar image
pub const DEFAULT_CONFIG_RELOAD_IMAGE: &str = "jimmidyson/configmap-reload:v0.3.0";

/// Default HTTP listen port of the agent
pub const DEFAULT_PORT: &str = "8429";

/// Default global scrape interval
pub const DEFAULT_SCRAPE_INTERVAL: &str = "30s";

/// Extra arg that prefixes every HTTP path served by the agent
pub const PATH_PREFIX_ARG: &str = "http.pathPrefix";

const HEALTH_PATH: &str = "/health";
const RELOAD_PATH: &str = "/-/reload";

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for agent durations (e.g. "500ms", "30s", "1m")
static DURATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+(ms|s|m|h))+$").unwrap());

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed (uses default)
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate a TCP port given as a string
fn validate_port(value: &str) -> Result<(), ValidationError> {
    match value.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(ValidationError::new("invalid_port")
            .with_message(format!("'{}' is not a valid port", value).into())),
    }
}

/// Validate a Kubernetes name (RFC 1123 subdomain)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed for optional fields
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a list of Kubernetes names
fn validate_k8s_names(values: &[String]) -> Result<(), ValidationError> {
    values.iter().try_for_each(|v| validate_k8s_name(v))
}

/// Validate an agent duration string
fn validate_duration(duration: &str) -> Result<(), ValidationError> {
    if !DURATION_REGEX.is_match(duration) {
        return Err(ValidationError::new("invalid_duration").with_message(
            format!("'{}' is not a valid duration (e.g., 30s, 1m)", duration).into(),
        ));
    }
    Ok(())
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message("pullPolicy must be Always, IfNotPresent, or Never".into())),
    }
}

/// Validate agent log level
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level {
        "INFO" | "WARN" | "ERROR" | "FATAL" | "PANIC" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")
            .with_message("logLevel must be one of INFO, WARN, ERROR, FATAL, PANIC".into())),
    }
}

/// Validate agent log format
fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format {
        "default" | "json" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_format")
            .with_message("logFormat must be default or json".into())),
    }
}

/// Validate environment variables
fn validate_env_vars(vars: &[k8s_openapi::api::core::v1::EnvVar]) -> Result<(), ValidationError> {
    const MAX_ENV_VARS: usize = 100;
    if vars.len() > MAX_ENV_VARS {
        return Err(ValidationError::new("too_many_env_vars").with_message(
            format!("maximum {} environment variables allowed", MAX_ENV_VARS).into(),
        ));
    }
    let forbidden_names = [
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "DYLD_INSERT_LIBRARIES",
        "DYLD_LIBRARY_PATH",
    ];
    for var in vars {
        if var.name.is_empty() || var.name.len() > 256 {
            return Err(ValidationError::new("invalid_env_name")
                .with_message("environment variable name must be 1-256 characters".into()));
        }
        if forbidden_names.contains(&var.name.as_str()) && var.value.is_some() {
            return Err(ValidationError::new("forbidden_env_var").with_message(
                format!(
                    "environment variable '{}' is not allowed for security",
                    var.name
                )
                .into(),
            ));
        }
    }
    Ok(())
}

/// Validate pod labels
fn validate_labels(labels: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if labels.len() > 20 {
        return Err(ValidationError::new("too_many_labels")
            .with_message("maximum 20 labels allowed".into()));
    }
    for (key, value) in labels {
        if key.len() > 253 || value.len() > 63 {
            return Err(ValidationError::new("label_too_long")
                .with_message("label key max 253 chars, value max 63 chars".into()));
        }
        // Pod labels must not shadow the selector labels
        if key.starts_with("app.kubernetes.io/") || key == "managed-by" {
            return Err(ValidationError::new("reserved_label").with_message(
                format!("label '{}' is reserved for the operator", key).into(),
            ));
        }
    }
    Ok(())
}

/// Validate pod annotations
fn validate_annotations(annotations: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if annotations.len() > 50 {
        return Err(ValidationError::new("too_many_annotations")
            .with_message("maximum 50 annotations allowed".into()));
    }
    for (key, value) in annotations {
        if key.len() > 253 {
            return Err(ValidationError::new("annotation_key_too_long")
                .with_message(format!("annotation key '{}' exceeds 253 characters", key).into()));
        }
        if value.len() > 262144 {
            return Err(ValidationError::new("annotation_value_too_long")
                .with_message(format!("annotation '{}' value exceeds 256KB", key).into()));
        }
    }
    Ok(())
}

/// Validate extra args passed to the agent
///
/// Flags that carry synthesized state cannot be overridden.
fn validate_extra_args(args: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    let reserved = ["promscrape.config", "httpListenAddr"];
    for key in args.keys() {
        let flag = key.trim_start_matches('-');
        if reserved.contains(&flag) || (flag.starts_with("remoteWrite.") && flag != "remoteWrite.tmpDataPath") {
            return Err(ValidationError::new("reserved_extra_arg").with_message(
                format!("extra arg '{}' is managed by the operator", key).into(),
            ));
        }
    }
    Ok(())
}

/// Validate a remote write URL
fn validate_remote_write_url(url: &str) -> Result<(), ValidationError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) || url.len() > 2048 {
        return Err(ValidationError::new("invalid_url").with_message(
            format!("'{}' must be an http(s) URL of at most 2048 characters", url).into(),
        ));
    }
    if url.contains(',') {
        return Err(ValidationError::new("invalid_url")
            .with_message("remote write URL must not contain ','".into()));
    }
    Ok(())
}

// ============================================================================
// Shared reference and selector types
// ============================================================================

/// Reference to one key of a Secret in the referencing object's namespace
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,
    /// Key inside the secret data
    #[validate(length(min = 1, max = 253))]
    pub key: String,
}

/// Reference to one key of a ConfigMap in the referencing object's namespace
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapKeyRef {
    /// ConfigMap name
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,
    /// Key inside the config map data
    #[validate(length(min = 1, max = 253))]
    pub key: String,
}

/// Either a Secret key or a ConfigMap key
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretOrConfigMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapKeyRef>,
}

/// Basic authentication credentials
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    /// Secret key holding the username
    pub username: SecretKeyRef,
    /// Secret key holding the password
    pub password: SecretKeyRef,
}

/// TLS settings for a scrape endpoint or remote write target
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// CA certificate used to verify the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<SecretOrConfigMap>,
    /// Path to a CA file inside the agent container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    /// Client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<SecretOrConfigMap>,
    /// Path to a client certificate file inside the agent container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    /// Secret key holding the client private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<SecretKeyRef>,
    /// Path to a client key file inside the agent container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Server name used for SNI and verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Disable target certificate validation
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Operator of a label selector requirement
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One label selector requirement
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    /// Label key the requirement applies to
    pub key: String,
    /// Relationship between the key and the values
    pub operator: SelectorOperator,
    /// Values for In/NotIn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Kubernetes-style label selector
///
/// An empty selector `{}` matches everything.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Exact label matches; all must match
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements; all must match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<SelectorRequirement>,
}

/// Namespaces a scrape object discovers endpoints in
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceScope {
    /// Discover in every namespace
    #[serde(default)]
    pub any: bool,
    /// Discover in the listed namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_names: Vec<String>,
}

/// A relabeling rule as written in a scrape object
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelabelConfig {
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
    /// replace, keep, drop, hashmod, labelmap, labeldrop, labelkeep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// Authentication settings shared by every scrape kind
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAuth {
    /// TLS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,
    /// File to read the bearer token from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token_file: Option<String>,
    /// Secret key holding the bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token_secret: Option<SecretKeyRef>,
    /// Basic authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
}

/// Relabeling and honor settings shared by every scrape kind
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeSettings {
    /// Scrape interval (defaults to the agent's scrapeInterval)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Scrape timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_timeout: Option<String>,
    /// Keep labels from the scraped data on collision
    #[serde(default)]
    pub honor_labels: bool,
    /// Keep timestamps from the scraped data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub honor_timestamps: Option<bool>,
    /// Relabelings applied before scraping
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relabel_configs: Vec<RelabelConfig>,
    /// Relabelings applied to scraped samples
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_relabel_configs: Vec<RelabelConfig>,
    /// ConfigMap key holding extra relabel rules (YAML list)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relabel_config_ref: Option<ConfigMapKeyRef>,
    /// Authentication
    #[serde(flatten)]
    pub auth: EndpointAuth,
}

/// One scrape endpoint of a service or pod scrape object
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeEndpoint {
    /// Name of the port to scrape
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Number or name of the target port (when `port` is not set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<String>,
    /// HTTP path to scrape (default /metrics)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// HTTP scheme
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// URL parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Vec<String>>,
    /// Shared scrape settings
    #[serde(flatten)]
    pub settings: ScrapeSettings,
}

// ============================================================================
// VMAgent CRD
// ============================================================================

/// VMAgent custom resource definition
///
/// A metrics collection agent that scrapes discovered targets and pushes
/// samples to one or more remote write destinations.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "operator.victoriametrics.com",
    version = "v1beta1",
    kind = "VMAgent",
    plural = "vmagents",
    shortname = "vma",
    namespaced,
    status = "VMAgentStatus",
    printcolumn = r#"{"name":"ReplicaCount", "type":"integer", "jsonPath":".spec.replicaCount"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VMAgentSpec {
    /// Labels and annotations propagated to the agent pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub pod_metadata: Option<PodMetadata>,

    /// Agent image settings
    #[serde(default)]
    #[validate(nested)]
    pub image: ImageSpec,

    /// Image of the config reloader sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image"))]
    pub config_reload_image: Option<String>,

    /// Image pull secrets in the agent namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(length(max = 10), custom(function = "validate_k8s_names"))]
    pub image_pull_secrets: Vec<String>,

    /// Secrets mounted at /etc/vm/secrets/<name>
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(custom(function = "validate_k8s_names"))]
    pub secrets: Vec<String>,

    /// ConfigMaps mounted at /etc/vm/configs/<name>
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(custom(function = "validate_k8s_names"))]
    pub config_maps: Vec<String>,

    /// Agent log level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: Option<String>,

    /// Agent log format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_log_format"))]
    pub log_format: Option<String>,

    /// Desired number of agent pods (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, max = 100, message = "replicaCount must be between 0 and 100"))]
    pub replica_count: Option<i32>,

    /// Additional volumes for the agent pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(skip)]
    pub volumes: Vec<k8s_openapi::api::core::v1::Volume>,

    /// Additional volume mounts for the agent container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(skip)]
    pub volume_mounts: Vec<k8s_openapi::api::core::v1::VolumeMount>,

    /// Resource requirements (CPU, memory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub resources: Option<ResourceRequirements>,

    /// Pod affinity/anti-affinity rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub affinity: Option<k8s_openapi::api::core::v1::Affinity>,

    /// Tolerations for pod scheduling
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(skip)]
    pub tolerations: Vec<k8s_openapi::api::core::v1::Toleration>,

    /// Security context for pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub security_context: Option<k8s_openapi::api::core::v1::PodSecurityContext>,

    /// Service account the agent runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub service_account_name: Option<String>,

    /// Priority class of the agent pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Run the pod in the node network namespace
    #[serde(default)]
    pub host_network: bool,

    /// DNS policy of the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,

    /// Default scrape interval (default 30s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_duration"))]
    pub scrape_interval: Option<String>,

    /// Force honor_labels=false for every job
    #[serde(default)]
    pub override_honor_labels: bool,

    /// Force honor_timestamps=false for every job
    #[serde(default)]
    pub override_honor_timestamps: bool,

    /// Ignore the namespaceSelector of scrape objects
    #[serde(default)]
    pub ignore_namespace_selectors: bool,

    /// Label set to the origin namespace on every scraped series
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforced_namespace_label: Option<String>,

    /// External label carrying `<namespace>/<name>` (default `prometheus`, empty disables)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_agent_external_label_name: Option<String>,

    /// Labels added to every series sent to remote storage
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub external_labels: BTreeMap<String, String>,

    /// Remote write destinations, in queue order
    #[serde(default)]
    #[validate(
        length(min = 1, message = "at least one remoteWrite target is required"),
        nested
    )]
    pub remote_write: Vec<RemoteWriteSpec>,

    /// Global relabeling applied before remote write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relabel_config: Option<ConfigMapKeyRef>,

    /// Selects VMServiceScrape objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_scrape_selector: Option<Selector>,

    /// Namespaces to select VMServiceScrape objects from (own namespace if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_scrape_namespace_selector: Option<Selector>,

    /// Selects VMPodScrape objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_scrape_selector: Option<Selector>,

    /// Namespaces to select VMPodScrape objects from (own namespace if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_scrape_namespace_selector: Option<Selector>,

    /// Selects VMProbe objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_selector: Option<Selector>,

    /// Namespaces to select VMProbe objects from (own namespace if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_namespace_selector: Option<Selector>,

    /// Secret key with raw scrape configs appended to the generated ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_scrape_configs: Option<SecretKeyRef>,

    /// Whether scrape objects may reference files in the agent container
    #[serde(default, rename = "arbitraryFSAccessThroughSMs")]
    pub arbitrary_fs_access_through_sms: ArbitraryFsAccess,

    /// HTTP listen port (default 8429)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_port"))]
    pub port: Option<String>,

    /// Extra `-key=value` flags passed to the agent
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_extra_args"))]
    pub extra_args: BTreeMap<String, String>,

    /// Extra environment variables for the agent container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(skip)]
    #[validate(custom(function = "validate_env_vars"))]
    pub extra_envs: Vec<k8s_openapi::api::core::v1::EnvVar>,
}

/// Labels and annotations for the agent pods
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PodMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_labels"))]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_annotations"))]
    pub annotations: BTreeMap<String, String>,
}

/// Container image settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image"))]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 128))]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub pull_policy: Option<String>,
}

/// File system access policy for scrape objects
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArbitraryFsAccess {
    /// Reject scrape objects that reference container files
    #[serde(default)]
    pub deny: bool,
}

/// One remote write destination
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWriteSpec {
    /// Endpoint URL, e.g. http://vmsingle:8429/api/v1/write
    #[validate(custom(function = "validate_remote_write_url"))]
    pub url: String,

    /// Basic authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,

    /// Secret key holding a bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token_secret: Option<SecretKeyRef>,

    /// Flush interval (default 1s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_duration"))]
    pub flush_interval: Option<String>,

    /// Labels added to every series sent to this URL
    #[serde(default, rename = "label", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Maximum size in bytes of an unpacked request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub max_block_size: Option<i64>,

    /// Maximum on-disk buffer size in bytes
    #[serde(default, rename = "maxDiskUsagePerURL", skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub max_disk_usage_per_url: Option<i64>,

    /// Number of concurrent queues
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, max = 256))]
    pub queues: Option<i32>,

    /// Relabeling applied only to this destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_relabel_config: Option<ConfigMapKeyRef>,

    /// Timeout for one request (default 1m)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_duration"))]
    pub send_timeout: Option<String>,

    /// Show the URL in exported metrics
    #[serde(default, rename = "showURL", skip_serializing_if = "Option::is_none")]
    pub show_url: Option<bool>,

    /// On-disk buffer directory (derived from the target when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmp_data_path: Option<String>,

    /// TLS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,
}

/// Status of a VMAgent resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VMAgentStatus {
    /// Non-terminated pods targeted by the agent deployment
    #[serde(default)]
    pub replicas: i32,

    /// Pods that run the desired pod template
    #[serde(default)]
    pub updated_replicas: i32,

    /// Pods ready for at least minReadySeconds
    #[serde(default)]
    pub available_replicas: i32,

    /// Pods that are not yet available
    #[serde(default)]
    pub unavailable_replicas: i32,

    /// Convergence phase
    #[serde(default)]
    pub phase: AgentPhase,

    /// Hash of the last configuration applied to the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_hash: Option<String>,

    /// Generation the status reflects
    #[serde(default)]
    pub observed_generation: i64,

    /// Conditions describing the agent state
    #[serde(default)]
    pub conditions: Vec<AgentCondition>,

    /// Last time the status was updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Convergence phase of an agent
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AgentPhase {
    /// Not yet processed
    #[default]
    Pending,
    /// Resolving targets and building the configuration
    Synthesizing,
    /// Pushing configuration and workload
    Applying,
    /// Workload matches the synthesized configuration
    Steady,
    /// Last pass failed
    Failed,
}

impl std::fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Synthesizing => write!(f, "Synthesizing"),
            Self::Applying => write!(f, "Applying"),
            Self::Steady => write!(f, "Steady"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition describing an aspect of agent state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Reason for the condition
    pub reason: Option<String>,

    /// Human-readable message
    pub message: Option<String>,

    /// Last transition time
    pub last_transition_time: Option<String>,
}

impl VMAgent {
    /// Name shared by the deployment, service and config secret
    pub fn prefixed_name(&self) -> String {
        format!("vmagent-{}", self.name_any())
    }

    /// Name of the secret holding bundled credential files
    pub fn tls_asset_name(&self) -> String {
        format!("tls-assets-vmagent-{}", self.name_any())
    }

    /// Desired replica count
    pub fn replicas(&self) -> i32 {
        self.spec.replica_count.unwrap_or(1)
    }

    /// HTTP listen port
    pub fn port(&self) -> &str {
        self.spec.port.as_deref().unwrap_or(DEFAULT_PORT)
    }

    /// Full container image reference
    pub fn image(&self) -> String {
        format!(
            "{}:{}",
            self.spec
                .image
                .repository
                .as_deref()
                .unwrap_or(DEFAULT_IMAGE_REPOSITORY),
            self.spec.image.tag.as_deref().unwrap_or(DEFAULT_IMAGE_TAG)
        )
    }

    /// Config reloader sidecar image
    pub fn config_reload_image(&self) -> &str {
        self.spec
            .config_reload_image
            .as_deref()
            .unwrap_or(DEFAULT_CONFIG_RELOAD_IMAGE)
    }

    /// Labels that select the agent pods
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), "vmagent".to_string()),
            ("app.kubernetes.io/instance".to_string(), self.name_any()),
            (
                "app.kubernetes.io/component".to_string(),
                "monitoring".to_string(),
            ),
            ("managed-by".to_string(), "vm-operator".to_string()),
        ])
    }

    /// Labels for the pod template
    pub fn pod_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        if let Some(ref meta) = self.spec.pod_metadata {
            labels.extend(meta.labels.clone());
        }
        labels
    }

    /// Labels for the generated objects
    pub fn final_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.extend(self.labels().clone());
        labels
    }

    /// Annotations for the pod template
    pub fn pod_annotations(&self) -> BTreeMap<String, String> {
        self.spec
            .pod_metadata
            .as_ref()
            .map(|m| m.annotations.clone())
            .unwrap_or_default()
    }

    /// Annotations copied from the CR, without kubectl bookkeeping
    pub fn final_annotations(&self) -> BTreeMap<String, String> {
        self.annotations()
            .iter()
            .filter(|(k, _)| !k.starts_with("kubectl.kubernetes.io/"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Health check path, honoring `http.pathPrefix`
    pub fn health_path(&self) -> String {
        self.prefixed_path(HEALTH_PATH)
    }

    /// Local reload URL, honoring `http.pathPrefix`
    pub fn reload_url(&self) -> String {
        format!(
            "http://localhost:{}{}",
            self.port(),
            self.prefixed_path(RELOAD_PATH)
        )
    }

    fn prefixed_path(&self, path: &str) -> String {
        match self.spec.extra_args.get(PATH_PREFIX_ARG) {
            Some(prefix) => format!("{}{}", prefix.trim_end_matches('/'), path),
            None => path.to_string(),
        }
    }

    /// Whether any scrape kind is managed by selectors
    pub fn has_managed_scrapes(&self) -> bool {
        let s = &self.spec;
        s.service_scrape_selector.is_some()
            || s.service_scrape_namespace_selector.is_some()
            || s.pod_scrape_selector.is_some()
            || s.pod_scrape_namespace_selector.is_some()
            || s.probe_selector.is_some()
            || s.probe_namespace_selector.is_some()
    }
}

// ============================================================================
// Scrape target CRDs
// ============================================================================

/// VMServiceScrape scrapes endpoints behind the Services matched by `selector`
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.victoriametrics.com",
    version = "v1beta1",
    kind = "VMServiceScrape",
    plural = "vmservicescrapes",
    shortname = "vmss",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VMServiceScrapeSpec {
    /// Service label whose value becomes the `job` label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_label: Option<String>,
    /// Service labels copied onto the series
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_labels: Vec<String>,
    /// Pod labels copied onto the series
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_target_labels: Vec<String>,
    /// Endpoints to scrape
    #[serde(default)]
    pub endpoints: Vec<ScrapeEndpoint>,
    /// Selects the Services
    #[serde(default)]
    pub selector: Selector,
    /// Namespaces to discover Services in
    #[serde(default)]
    pub namespace_selector: NamespaceScope,
    /// Per-scrape sample limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_limit: Option<u64>,
}

/// VMPodScrape scrapes pods matched by `selector`
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.victoriametrics.com",
    version = "v1beta1",
    kind = "VMPodScrape",
    plural = "vmpodscrapes",
    shortname = "vmps",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VMPodScrapeSpec {
    /// Pod label whose value becomes the `job` label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_label: Option<String>,
    /// Pod labels copied onto the series
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_target_labels: Vec<String>,
    /// Pod endpoints to scrape
    #[serde(default)]
    pub pod_metrics_endpoints: Vec<ScrapeEndpoint>,
    /// Selects the pods
    #[serde(default)]
    pub selector: Selector,
    /// Namespaces to discover pods in
    #[serde(default)]
    pub namespace_selector: NamespaceScope,
    /// Per-scrape sample limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_limit: Option<u64>,
}

/// VMProbe probes static targets through a prober (e.g. blackbox exporter)
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.victoriametrics.com",
    version = "v1beta1",
    kind = "VMProbe",
    plural = "vmprobes",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VMProbeSpec {
    /// Explicit job name (defaults to the object identity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    /// Default prober module
    #[serde(default)]
    pub module: String,
    /// Prober endpoint
    #[serde(rename = "vmProberSpec")]
    pub prober: ProberSpec,
    /// Target groups, one job each
    #[serde(default)]
    pub targets: Vec<ProbeTargetGroup>,
    /// Shared scrape settings
    #[serde(flatten)]
    pub settings: ScrapeSettings,
}

/// Address of the prober
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProberSpec {
    /// host:port of the prober
    pub url: String,
    /// HTTP scheme (default http)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// Probe path (default /probe)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A group of static targets probed with one module
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeTargetGroup {
    /// Module override for this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Targets to probe
    #[serde(default)]
    pub targets: Vec<String>,
    /// Labels attached to every target of the group
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Every CRD served by the operator
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        VMAgent::crd(),
        VMServiceScrape::crd(),
        VMPodScrape::crd(),
        VMProbe::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn create_test_agent() -> VMAgent {
        VMAgent {
            metadata: ObjectMeta {
                name: Some("main".to_string()),
                namespace: Some("monitoring".to_string()),
                ..Default::default()
            },
            spec: VMAgentSpec {
                remote_write: vec![RemoteWriteSpec {
                    url: "http://vmsingle:8429/api/v1/write".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_naming_conventions() {
        let agent = create_test_agent();
        assert_eq!(agent.prefixed_name(), "vmagent-main");
        assert_eq!(agent.tls_asset_name(), "tls-assets-vmagent-main");
    }

    #[test]
    fn test_defaults() {
        let agent = create_test_agent();
        assert_eq!(agent.replicas(), 1);
        assert_eq!(agent.port(), "8429");
        assert_eq!(agent.image(), "victoriametrics/vmagent:v1.93.5");
        assert!(!agent.has_managed_scrapes());
    }

    #[test]
    fn test_paths_without_prefix() {
        let agent = create_test_agent();
        assert_eq!(agent.health_path(), "/health");
        assert_eq!(agent.reload_url(), "http://localhost:8429/-/reload");
    }

    #[test]
    fn test_paths_with_prefix() {
        let mut agent = create_test_agent();
        agent
            .spec
            .extra_args
            .insert(PATH_PREFIX_ARG.to_string(), "/vmagent/".to_string());
        assert_eq!(agent.health_path(), "/vmagent/health");
        assert_eq!(agent.reload_url(), "http://localhost:8429/vmagent/-/reload");
    }

    #[test]
    fn test_labels() {
        let mut agent = create_test_agent();
        agent.metadata.labels = Some(BTreeMap::from([("team".to_string(), "obs".to_string())]));
        agent.spec.pod_metadata = Some(PodMetadata {
            labels: BTreeMap::from([("tier".to_string(), "agent".to_string())]),
            annotations: BTreeMap::new(),
        });

        let selector = agent.selector_labels();
        assert_eq!(selector.get("app.kubernetes.io/instance"), Some(&"main".to_string()));
        assert_eq!(selector.get("managed-by"), Some(&"vm-operator".to_string()));

        assert_eq!(agent.pod_labels().get("tier"), Some(&"agent".to_string()));
        assert!(agent.pod_labels().get("team").is_none());
        assert_eq!(agent.final_labels().get("team"), Some(&"obs".to_string()));
    }

    #[test]
    fn test_annotations_drop_kubectl() {
        let mut agent = create_test_agent();
        agent.metadata.annotations = Some(BTreeMap::from([
            (
                "kubectl.kubernetes.io/last-applied-configuration".to_string(),
                "{}".to_string(),
            ),
            ("owner".to_string(), "sre".to_string()),
        ]));
        let annotations = agent.final_annotations();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations.get("owner"), Some(&"sre".to_string()));
    }

    #[test]
    fn test_validation_accepts_defaults() {
        let agent = create_test_agent();
        assert!(agent.spec.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut agent = create_test_agent();
        agent.spec.scrape_interval = Some("thirty seconds".to_string());
        assert!(agent.spec.validate().is_err());

        let mut agent = create_test_agent();
        agent.spec.remote_write[0].url = "ftp://storage".to_string();
        assert!(agent.spec.validate().is_err());

        let mut agent = create_test_agent();
        agent.spec.log_level = Some("DEBUG".to_string());
        assert!(agent.spec.validate().is_err());

        let mut agent = create_test_agent();
        agent
            .spec
            .extra_args
            .insert("remoteWrite.url".to_string(), "http://x".to_string());
        assert!(agent.spec.validate().is_err());

        let mut agent = create_test_agent();
        agent.spec.replica_count = Some(-1);
        assert!(agent.spec.validate().is_err());

        let mut agent = create_test_agent();
        agent.spec.port = Some("http".to_string());
        assert!(agent.spec.validate().is_err());

        let mut agent = create_test_agent();
        agent.spec.remote_write.clear();
        assert!(agent.spec.validate().is_err());
    }

    #[test]
    fn test_tmp_data_path_extra_arg_allowed() {
        let mut agent = create_test_agent();
        agent
            .spec
            .extra_args
            .insert("remoteWrite.tmpDataPath".to_string(), "/data".to_string());
        assert!(agent.spec.validate().is_ok());
    }

    #[test]
    fn test_remote_write_field_names() {
        let json = serde_json::json!({
            "url": "http://a:8429/api/v1/write",
            "showURL": true,
            "maxDiskUsagePerURL": 1024,
            "label": {"dc": "eu"}
        });
        let rw: RemoteWriteSpec = serde_json::from_value(json).unwrap();
        assert_eq!(rw.show_url, Some(true));
        assert_eq!(rw.max_disk_usage_per_url, Some(1024));
        assert_eq!(rw.labels.get("dc"), Some(&"eu".to_string()));
    }

    #[test]
    fn test_service_scrape_deserialize() {
        let json = serde_json::json!({
            "selector": {"matchLabels": {"app": "web"}},
            "namespaceSelector": {"matchNames": ["prod"]},
            "endpoints": [{
                "port": "http",
                "honorLabels": true,
                "bearerTokenSecret": {"name": "tok", "key": "token"}
            }]
        });
        let spec: VMServiceScrapeSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.endpoints.len(), 1);
        let ep = &spec.endpoints[0];
        assert!(ep.settings.honor_labels);
        assert_eq!(
            ep.settings.auth.bearer_token_secret.as_ref().map(|s| s.name.as_str()),
            Some("tok")
        );
        assert_eq!(spec.namespace_selector.match_names, vec!["prod".to_string()]);
    }

    #[test]
    fn test_crds() {
        let crds = crds();
        assert_eq!(crds.len(), 4);
        assert!(crds.iter().all(|c| c.spec.group == API_GROUP));
    }

    #[test]
    fn test_agent_phase_default() {
        assert_eq!(AgentPhase::default(), AgentPhase::Pending);
        assert_eq!(AgentPhase::Steady.to_string(), "Steady");
    }
}
