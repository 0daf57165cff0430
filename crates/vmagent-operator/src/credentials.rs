//! Credential bundling
//!
//! Every Secret and ConfigMap key referenced by an agent or by one of its
//! scrape jobs is fetched into a [`CredentialBundle`] before synthesis. A
//! pass either resolves every reference or fails as a whole.

use crate::crd::{ConfigMapKeyRef, SecretKeyRef, VMAgent};
use crate::error::{OperatorError, Result};
use crate::normalize::{job_tls, JobTls, ScrapeJob, SecretSource};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::{Api, Client, ResourceExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Directory the bundle secret is mounted at in the agent container
pub const BUNDLE_MOUNT_PATH: &str = "/etc/vmagent-tls/certs";

/// Longest key allowed in Secret data
const MAX_DATA_KEY_LEN: usize = 253;

/// Maximum number of concurrent fetches in one pass
const MAX_CONCURRENT_FETCHES: usize = 8;

/// Kind of object a credential lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefKind {
    Secret,
    ConfigMap,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Secret => "secret",
            RefKind::ConfigMap => "configmap",
        }
    }
}

/// Identity of one referenced key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialRef {
    pub kind: RefKind,
    pub namespace: String,
    pub name: String,
    pub key: String,
}

impl CredentialRef {
    pub fn secret(namespace: &str, r: &SecretKeyRef) -> Self {
        Self {
            kind: RefKind::Secret,
            namespace: namespace.to_string(),
            name: r.name.clone(),
            key: r.key.clone(),
        }
    }

    pub fn config_map(namespace: &str, r: &ConfigMapKeyRef) -> Self {
        Self {
            kind: RefKind::ConfigMap,
            namespace: namespace.to_string(),
            name: r.name.clone(),
            key: r.key.clone(),
        }
    }

    /// File name inside the bundle directory
    ///
    /// Names longer than a Secret data key allows are cut and suffixed with
    /// a digest of the full name.
    pub fn file_name(&self) -> String {
        let full = format!(
            "{}_{}_{}_{}",
            self.kind.as_str(),
            self.namespace,
            self.name,
            self.key
        );
        if full.len() <= MAX_DATA_KEY_LEN {
            return full;
        }
        let digest = hex::encode(Sha256::digest(full.as_bytes()));
        let suffix = &digest[..16];
        let prefix: String = full
            .chars()
            .take(MAX_DATA_KEY_LEN - suffix.len() - 1)
            .collect();
        format!("{}_{}", prefix, suffix)
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.kind.as_str(),
            self.namespace,
            self.name,
            self.key
        )
    }
}

/// Resolved credential content for one synthesis pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialBundle {
    entries: BTreeMap<CredentialRef, Vec<u8>>,
}

impl CredentialBundle {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, reference: &CredentialRef) -> Option<&[u8]> {
        self.entries.get(reference).map(Vec::as_slice)
    }

    /// Content of a reference that must be present and valid UTF-8
    pub fn get_str(&self, reference: &CredentialRef) -> Result<&str> {
        let bytes = self
            .get(reference)
            .ok_or_else(|| OperatorError::UnresolvedReference {
                references: vec![reference.to_string()],
            })?;
        std::str::from_utf8(bytes).map_err(|_| {
            OperatorError::malformed(reference.to_string(), "content is not valid UTF-8")
        })
    }

    /// Path of a reference inside the agent container
    pub fn path_for(reference: &CredentialRef) -> String {
        format!("{}/{}", BUNDLE_MOUNT_PATH, reference.file_name())
    }

    /// Feed the bundle content into a hasher
    pub fn digest_into(&self, hasher: &mut Sha256) {
        for (reference, content) in &self.entries {
            hasher.update(reference.file_name().as_bytes());
            hasher.update([0u8]);
            hasher.update((content.len() as u64).to_be_bytes());
            hasher.update(content);
        }
    }

    /// Data of the bundle secret
    pub fn to_secret_data(&self) -> BTreeMap<String, ByteString> {
        self.entries
            .iter()
            .map(|(r, content)| (r.file_name(), ByteString(content.clone())))
            .collect()
    }
}

impl FromIterator<(CredentialRef, Vec<u8>)> for CredentialBundle {
    fn from_iter<I: IntoIterator<Item = (CredentialRef, Vec<u8>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Source of credential content
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Read one key; `Ok(None)` when the object or the key does not exist
    async fn fetch(&self, reference: &CredentialRef) -> Result<Option<Vec<u8>>>;
}

/// Reads Secrets and ConfigMaps from the API server
#[derive(Clone)]
pub struct KubeCredentialSource {
    client: Client,
}

impl KubeCredentialSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialSource for KubeCredentialSource {
    async fn fetch(&self, reference: &CredentialRef) -> Result<Option<Vec<u8>>> {
        match reference.kind {
            RefKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), &reference.namespace);
                let secret = api.get_opt(&reference.name).await?;
                Ok(secret
                    .and_then(|s| s.data)
                    .and_then(|mut d| d.remove(&reference.key))
                    .map(|b| b.0))
            }
            RefKind::ConfigMap => {
                let api: Api<ConfigMap> =
                    Api::namespaced(self.client.clone(), &reference.namespace);
                let Some(cm) = api.get_opt(&reference.name).await? else {
                    return Ok(None);
                };
                let text = cm
                    .data
                    .and_then(|mut d| d.remove(&reference.key))
                    .map(String::into_bytes);
                Ok(text.or_else(|| {
                    cm.binary_data
                        .and_then(|mut d| d.remove(&reference.key))
                        .map(|b| b.0)
                }))
            }
        }
    }
}

/// A certificate needs its key and a key needs its certificate
fn check_tls_pair(object: &str, tls: &JobTls) -> Result<()> {
    match (&tls.cert, &tls.key) {
        (Some(_), None) => Err(OperatorError::malformed(
            object,
            "TLS certificate configured without a key",
        )),
        (None, Some(_)) => Err(OperatorError::malformed(
            object,
            "TLS key configured without a certificate",
        )),
        _ => Ok(()),
    }
}

fn add_tls_refs(object: &str, tls: &JobTls, refs: &mut BTreeSet<CredentialRef>) -> Result<()> {
    check_tls_pair(object, tls)?;
    for source in [&tls.ca, &tls.cert, &tls.key].into_iter().flatten() {
        if let SecretSource::Bundled(r) = source {
            refs.insert(r.clone());
        }
    }
    Ok(())
}

/// Collect every reference an agent and its jobs need
///
/// Fails with `MalformedTarget` on a certificate/key mismatch before
/// anything is fetched.
pub fn collect_refs(jobs: &[ScrapeJob], agent: &VMAgent) -> Result<BTreeSet<CredentialRef>> {
    let mut refs = BTreeSet::new();

    for job in jobs {
        if let Some(SecretSource::Bundled(ref r)) = job.auth.bearer_token {
            refs.insert(r.clone());
        }
        if let Some(ref basic) = job.auth.basic_auth {
            refs.insert(basic.username.clone());
            refs.insert(basic.password.clone());
        }
        if let Some(ref tls) = job.auth.tls {
            add_tls_refs(&job.job_name, tls, &mut refs)?;
        }
        if let Some(ref r) = job.relabel_config_ref {
            refs.insert(r.clone());
        }
    }

    let namespace = agent.namespace().unwrap_or_default();
    let spec = &agent.spec;
    for (index, rw) in spec.remote_write.iter().enumerate() {
        let object = format!("VMAgent/{}/{}/remoteWrite/{}", namespace, agent.name_any(), index);
        if let Some(ref basic) = rw.basic_auth {
            refs.insert(CredentialRef::secret(&namespace, &basic.username));
            refs.insert(CredentialRef::secret(&namespace, &basic.password));
        }
        if let Some(ref token) = rw.bearer_token_secret {
            refs.insert(CredentialRef::secret(&namespace, token));
        }
        if let Some(ref tls) = rw.tls_config {
            let tls = job_tls(&object, &namespace, tls, false)?;
            add_tls_refs(&object, &tls, &mut refs)?;
        }
        if let Some(ref relabel) = rw.url_relabel_config {
            refs.insert(CredentialRef::config_map(&namespace, relabel));
        }
    }
    if let Some(ref relabel) = spec.relabel_config {
        refs.insert(CredentialRef::config_map(&namespace, relabel));
    }
    if let Some(ref extra) = spec.additional_scrape_configs {
        refs.insert(CredentialRef::secret(&namespace, extra));
    }

    Ok(refs)
}

/// Fetch every reference, all or nothing
///
/// Fetches run concurrently with a per-attempt timeout. Any missing,
/// unreadable or timed out reference fails the whole pass with
/// `UnresolvedReference` naming every failed reference.
pub async fn bundle(
    source: &dyn CredentialSource,
    references: &BTreeSet<CredentialRef>,
    attempt_timeout: Duration,
) -> Result<CredentialBundle> {
    let results: Vec<(CredentialRef, Option<Vec<u8>>)> = stream::iter(references.iter().cloned())
        .map(|reference| async move {
            let content = match tokio::time::timeout(attempt_timeout, source.fetch(&reference)).await
            {
                Ok(Ok(Some(content))) => Some(content),
                Ok(Ok(None)) => {
                    warn!(reference = %reference, "Referenced key not found");
                    None
                }
                Ok(Err(e)) => {
                    warn!(reference = %reference, error = %e, "Failed to read reference");
                    None
                }
                Err(_) => {
                    warn!(reference = %reference, "Timed out reading reference");
                    None
                }
            };
            (reference, content)
        })
        .buffer_unordered(MAX_CONCURRENT_FETCHES)
        .collect()
        .await;

    let mut unresolved = Vec::new();
    let mut entries = BTreeMap::new();
    for (reference, content) in results {
        match content {
            Some(content) => {
                entries.insert(reference, content);
            }
            None => unresolved.push(reference),
        }
    }

    if !unresolved.is_empty() {
        unresolved.sort();
        return Err(OperatorError::UnresolvedReference {
            references: unresolved.iter().map(ToString::to_string).collect(),
        });
    }

    debug!(references = entries.len(), "Bundled credentials");
    Ok(CredentialBundle { entries })
}
