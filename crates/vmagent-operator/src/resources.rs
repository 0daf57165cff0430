//! Kubernetes Resource Builders
//!
//! This module generates the objects that run an agent (Deployment,
//! Service and the config/credential Secrets) from a VMAgent and its
//! synthesized configuration.

use crate::credentials::BUNDLE_MOUNT_PATH;
use crate::crd::{VMAgent, API_GROUP};
use crate::error::{OperatorError, Result};
use crate::synthesizer::{
    is_under, tmp_data_root, SynthesizedConfig, CONFIG_MOUNT_PATH, SCRAPE_CONFIG_KEY,
    TMP_DATA_PATH_ARG,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    HTTPGetAction, LocalObjectReference, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    SeccompProfile, Secret, SecretVolumeSource, SecurityContext, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use std::collections::{BTreeMap, BTreeSet};

/// Deployment annotation carrying the applied configuration hash
pub const CONFIG_HASH_ANNOTATION: &str = "operator.victoriametrics.com/last-applied-hash";

const AGENT_CONTAINER: &str = "vmagent";
const RELOADER_CONTAINER: &str = "config-reloader";
const CONFIG_VOLUME: &str = "config";
const TLS_ASSETS_VOLUME: &str = "tls-assets";
const QUEUE_VOLUME: &str = "persistent-queue-data";

/// Builder for generating Kubernetes resources from a VMAgent
pub struct ResourceBuilder<'a> {
    agent: &'a VMAgent,
    name: String,
    namespace: String,
    port: i32,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(agent: &'a VMAgent) -> Result<Self> {
        let name = agent
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("agent name is required".to_string()))?;

        let namespace = agent
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let port = agent.port().parse::<u16>().map_err(|_| {
            OperatorError::InvalidConfig(format!("'{}' is not a valid port", agent.port()))
        })?;

        Ok(Self {
            agent,
            name,
            namespace,
            port: i32::from(port),
        })
    }

    /// Get owner reference for managed resources
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: format!("{}/v1beta1", API_GROUP),
            kind: "VMAgent".to_string(),
            name: self.name.clone(),
            uid: self.agent.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn object_meta(&self, name: String) -> ObjectMeta {
        let annotations = self.agent.final_annotations();
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.agent.final_labels()),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Secret holding the scrape document and relabeling files
    pub fn build_config_secret(&self, config: &SynthesizedConfig) -> Secret {
        let data = config
            .config_secret_data()
            .into_iter()
            .map(|(k, v)| (k, ByteString(v.into_bytes())))
            .collect();
        Secret {
            metadata: self.object_meta(self.agent.prefixed_name()),
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Secret holding the bundled credential files
    pub fn build_tls_assets_secret(&self, config: &SynthesizedConfig) -> Secret {
        Secret {
            metadata: self.object_meta(self.agent.tls_asset_name()),
            data: Some(config.bundle.to_secret_data()),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Agent command line
    fn build_args(&self, config: &SynthesizedConfig) -> Vec<String> {
        let spec = &self.agent.spec;
        let mut args = vec![
            format!(
                "-promscrape.config={}/{}",
                CONFIG_MOUNT_PATH, SCRAPE_CONFIG_KEY
            ),
            format!("-httpListenAddr=:{}", self.port),
        ];
        if let Some(ref level) = spec.log_level {
            args.push(format!("-loggerLevel={}", level));
        }
        if let Some(ref format) = spec.log_format {
            args.push(format!("-loggerFormat={}", format));
        }
        args.extend(config.remote_write_args.iter().cloned());
        for (key, value) in &spec.extra_args {
            let flag = key.trim_start_matches('-');
            // Consumed as the root of the per-target buffer directories
            if flag == TMP_DATA_PATH_ARG {
                continue;
            }
            args.push(format!("-{}={}", flag, value));
        }
        args
    }

    fn build_volumes(&self) -> (Vec<Volume>, Vec<VolumeMount>) {
        let spec = &self.agent.spec;
        let mut volumes = vec![
            Volume {
                name: CONFIG_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.agent.prefixed_name()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: TLS_ASSETS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.agent.tls_asset_name()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: QUEUE_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ];
        let mut mounts = vec![
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: TLS_ASSETS_VOLUME.to_string(),
                mount_path: BUNDLE_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: QUEUE_VOLUME.to_string(),
                mount_path: tmp_data_root(self.agent).to_string(),
                ..Default::default()
            },
        ];

        // Explicit buffer directories outside the root need their own
        // writable volume, the root filesystem is read-only
        let root = tmp_data_root(self.agent);
        let mut extra_queues = BTreeSet::new();
        for (index, rw) in spec.remote_write.iter().enumerate() {
            let Some(ref path) = rw.tmp_data_path else {
                continue;
            };
            if is_under(path, root) || !extra_queues.insert(path.clone()) {
                continue;
            }
            let volume = format!("{}-{}", QUEUE_VOLUME, index);
            volumes.push(Volume {
                name: volume.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: volume,
                mount_path: path.clone(),
                ..Default::default()
            });
        }

        for secret in &spec.secrets {
            let volume = format!("secret-{}", secret);
            volumes.push(Volume {
                name: volume.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: volume,
                mount_path: format!("/etc/vm/secrets/{}", secret),
                read_only: Some(true),
                ..Default::default()
            });
        }
        for cm in &spec.config_maps {
            let volume = format!("configmap-{}", cm);
            volumes.push(Volume {
                name: volume.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: cm.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: volume,
                mount_path: format!("/etc/vm/configs/{}", cm),
                read_only: Some(true),
                ..Default::default()
            });
        }

        volumes.extend(spec.volumes.iter().cloned());
        mounts.extend(spec.volume_mounts.iter().cloned());
        (volumes, mounts)
    }

    fn http_probe(&self, initial_delay: i32) -> Probe {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some(self.agent.health_path()),
                port: IntOrString::String("http".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(initial_delay),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        }
    }

    fn container_security_context() -> SecurityContext {
        SecurityContext {
            allow_privilege_escalation: Some(false),
            read_only_root_filesystem: Some(true),
            run_as_non_root: Some(true),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_container(&self, config: &SynthesizedConfig, mounts: Vec<VolumeMount>) -> Container {
        let spec = &self.agent.spec;
        Container {
            name: AGENT_CONTAINER.to_string(),
            image: Some(self.agent.image()),
            image_pull_policy: spec.image.pull_policy.clone(),
            args: Some(self.build_args(config)),
            env: (!spec.extra_envs.is_empty()).then(|| spec.extra_envs.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: self.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: spec.resources.clone(),
            liveness_probe: Some(self.http_probe(30)),
            readiness_probe: Some(self.http_probe(5)),
            volume_mounts: Some(mounts),
            security_context: Some(Self::container_security_context()),
            ..Default::default()
        }
    }

    fn build_reloader(&self) -> Container {
        Container {
            name: RELOADER_CONTAINER.to_string(),
            image: Some(self.agent.config_reload_image().to_string()),
            args: Some(vec![
                format!("-webhook-url={}", self.agent.reload_url()),
                format!("-volume-dir={}", CONFIG_MOUNT_PATH),
                format!("-volume-dir={}", BUNDLE_MOUNT_PATH),
            ]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: CONFIG_VOLUME.to_string(),
                    mount_path: CONFIG_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
                VolumeMount {
                    name: TLS_ASSETS_VOLUME.to_string(),
                    mount_path: BUNDLE_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
            ]),
            security_context: Some(Self::container_security_context()),
            ..Default::default()
        }
    }

    /// Build the agent Deployment
    pub fn build_deployment(&self, config: &SynthesizedConfig) -> Deployment {
        let spec = &self.agent.spec;
        let (volumes, mounts) = self.build_volumes();

        let mut meta = self.object_meta(self.agent.prefixed_name());
        meta.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(CONFIG_HASH_ANNOTATION.to_string(), config.hash.clone());

        let pod_annotations = self.agent.pod_annotations();

        // Apply secure defaults for pod security context if not specified
        let pod_security_context = spec.security_context.clone().or_else(|| {
            Some(PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(65534),
                run_as_group: Some(65534),
                fs_group: Some(65534),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            })
        });

        let pod_spec = PodSpec {
            containers: vec![self.build_container(config, mounts), self.build_reloader()],
            volumes: Some(volumes),
            affinity: spec.affinity.clone(),
            tolerations: (!spec.tolerations.is_empty()).then(|| spec.tolerations.clone()),
            security_context: pod_security_context,
            service_account_name: spec.service_account_name.clone(),
            priority_class_name: spec.priority_class_name.clone(),
            host_network: spec.host_network.then_some(true),
            dns_policy: spec.dns_policy.clone(),
            image_pull_secrets: (!spec.image_pull_secrets.is_empty()).then(|| {
                spec.image_pull_secrets
                    .iter()
                    .map(|name| LocalObjectReference { name: name.clone() })
                    .collect()
            }),
            ..Default::default()
        };

        Deployment {
            metadata: meta,
            spec: Some(DeploymentSpec {
                replicas: Some(self.agent.replicas()),
                selector: LabelSelector {
                    match_labels: Some(self.agent.selector_labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.agent.pod_labels()),
                        annotations: (!pod_annotations.is_empty()).then_some(pod_annotations),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the Service exposing the agent's HTTP port
    pub fn build_service(&self) -> Service {
        Service {
            metadata: self.object_meta(self.agent.prefixed_name()),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.agent.selector_labels()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: self.port,
                    target_port: Some(IntOrString::String("http".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialBundle, CredentialRef};
    use crate::crd::{PodMetadata, SecretKeyRef, VMAgentSpec};

    fn create_test_agent(name: &str) -> VMAgent {
        VMAgent {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("monitoring".to_string()),
                uid: Some("test-uid-123".to_string()),
                ..Default::default()
            },
            spec: VMAgentSpec::default(),
            status: None,
        }
    }

    fn test_config() -> SynthesizedConfig {
        let token = CredentialRef::secret(
            "ns1",
            &SecretKeyRef {
                name: "tok".to_string(),
                key: "token".to_string(),
            },
        );
        SynthesizedConfig {
            scrape_config: "global: {}\n".to_string(),
            remote_write_args: vec![
                "-remoteWrite.url=http://a:8429/api/v1/write".to_string(),
                "-remoteWrite.tmpDataPath=/tmp/vmagent-remotewrite-data/0-a-8429-12345678"
                    .to_string(),
            ],
            relabel_files: BTreeMap::from([("url_relabel_0.yaml".to_string(), "[]\n".to_string())]),
            bundle: [(token, b"t0k3n".to_vec())].into_iter().collect::<CredentialBundle>(),
            job_count: 0,
            hash: "abc123".to_string(),
        }
    }

    fn container<'d>(deployment: &'d Deployment, name: &str) -> &'d Container {
        deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .unwrap()
    }

    #[test]
    fn test_build_deployment() {
        let agent = create_test_agent("main");
        let builder = ResourceBuilder::new(&agent).unwrap();
        let deployment = builder.build_deployment(&test_config());

        assert_eq!(deployment.metadata.name, Some("vmagent-main".to_string()));
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));
        assert_eq!(
            deployment
                .metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(CONFIG_HASH_ANNOTATION),
            Some(&"abc123".to_string())
        );

        let agent_container = container(&deployment, AGENT_CONTAINER);
        let args = agent_container.args.as_ref().unwrap();
        assert_eq!(args[0], "-promscrape.config=/etc/vmagent/config/vmagent.yaml");
        assert!(args.contains(&"-httpListenAddr=:8429".to_string()));
        assert!(args.contains(&"-remoteWrite.url=http://a:8429/api/v1/write".to_string()));
        assert_eq!(
            agent_container.image,
            Some("victoriametrics/vmagent:v1.93.5".to_string())
        );
    }

    #[test]
    fn test_deployment_mounts_config_and_bundle() {
        let agent = create_test_agent("main");
        let deployment = ResourceBuilder::new(&agent)
            .unwrap()
            .build_deployment(&test_config());
        let mounts = container(&deployment, AGENT_CONTAINER)
            .volume_mounts
            .as_ref()
            .unwrap();
        let paths: Vec<&str> = mounts.iter().map(|m| m.mount_path.as_str()).collect();
        assert!(paths.contains(&"/etc/vmagent/config"));
        assert!(paths.contains(&"/etc/vmagent-tls/certs"));
        assert!(paths.contains(&"/tmp/vmagent-remotewrite-data"));
    }

    #[test]
    fn test_reloader_uses_reload_url() {
        let mut agent = create_test_agent("main");
        agent
            .spec
            .extra_args
            .insert("http.pathPrefix".to_string(), "/agent".to_string());
        let deployment = ResourceBuilder::new(&agent)
            .unwrap()
            .build_deployment(&test_config());
        let reloader = container(&deployment, RELOADER_CONTAINER);
        assert!(reloader
            .args
            .as_ref()
            .unwrap()
            .contains(&"-webhook-url=http://localhost:8429/agent/-/reload".to_string()));

        let probe = container(&deployment, AGENT_CONTAINER)
            .liveness_probe
            .as_ref()
            .unwrap();
        assert_eq!(
            probe.http_get.as_ref().unwrap().path,
            Some("/agent/health".to_string())
        );
    }

    #[test]
    fn test_extra_args_and_user_mounts() {
        let mut agent = create_test_agent("main");
        agent
            .spec
            .extra_args
            .insert("promscrape.maxScrapeSize".to_string(), "32MB".to_string());
        agent
            .spec
            .extra_args
            .insert(TMP_DATA_PATH_ARG.to_string(), "/data".to_string());
        agent.spec.secrets = vec!["etcd-certs".to_string()];
        agent.spec.config_maps = vec!["rules".to_string()];
        agent.spec.log_level = Some("WARN".to_string());

        let deployment = ResourceBuilder::new(&agent)
            .unwrap()
            .build_deployment(&test_config());
        let c = container(&deployment, AGENT_CONTAINER);
        let args = c.args.as_ref().unwrap();
        assert!(args.contains(&"-promscrape.maxScrapeSize=32MB".to_string()));
        assert!(args.contains(&"-loggerLevel=WARN".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("-remoteWrite.tmpDataPath=/data")));

        let paths: Vec<&str> = c
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert!(paths.contains(&"/etc/vm/secrets/etcd-certs"));
        assert!(paths.contains(&"/etc/vm/configs/rules"));
        assert!(paths.contains(&"/data"));
    }

    #[test]
    fn test_every_buffer_directory_is_writable() {
        use crate::crd::RemoteWriteSpec;
        use crate::synthesizer::synthesize;

        let target = |url: &str, path: Option<&str>| RemoteWriteSpec {
            url: url.to_string(),
            tmp_data_path: path.map(str::to_string),
            ..Default::default()
        };
        let mut agent = create_test_agent("main");
        agent.spec.remote_write = vec![
            target("http://a:8429/api/v1/write", Some("/data/q")),
            target("http://b:8429/api/v1/write", None),
            target("http://c:8429/api/v1/write", Some("/tmp/vmagent-remotewrite-data/c")),
        ];
        let config = synthesize(vec![], &agent, &CredentialBundle::default()).unwrap();
        let deployment = ResourceBuilder::new(&agent)
            .unwrap()
            .build_deployment(&config);

        let c = container(&deployment, AGENT_CONTAINER);
        let flag = format!("-{}=", TMP_DATA_PATH_ARG);
        let buffers: Vec<&str> = c
            .args
            .as_ref()
            .unwrap()
            .iter()
            .find_map(|a| a.strip_prefix(flag.as_str()))
            .unwrap()
            .split(',')
            .collect();
        assert_eq!(buffers.len(), 3);

        let mounts = c.volume_mounts.as_ref().unwrap();
        for buffer in buffers {
            assert!(
                mounts
                    .iter()
                    .any(|m| m.read_only != Some(true) && is_under(buffer, &m.mount_path)),
                "no writable mount for {}",
                buffer
            );
        }
        // Paths under the root share the root volume
        let queues: Vec<&VolumeMount> = mounts
            .iter()
            .filter(|m| m.name.starts_with(QUEUE_VOLUME))
            .collect();
        assert_eq!(queues.len(), 2);

        let volumes = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        for mount in queues {
            let volume = volumes.iter().find(|v| v.name == mount.name).unwrap();
            assert!(volume.empty_dir.is_some());
        }
    }

    #[test]
    fn test_pod_metadata() {
        let mut agent = create_test_agent("main");
        agent.spec.pod_metadata = Some(PodMetadata {
            labels: BTreeMap::from([("tier".to_string(), "agent".to_string())]),
            annotations: BTreeMap::from([("sidecar".to_string(), "off".to_string())]),
        });
        let deployment = ResourceBuilder::new(&agent)
            .unwrap()
            .build_deployment(&test_config());
        let template = &deployment.spec.as_ref().unwrap().template;
        let meta = template.metadata.as_ref().unwrap();
        assert_eq!(
            meta.labels.as_ref().unwrap().get("tier"),
            Some(&"agent".to_string())
        );
        assert_eq!(
            meta.annotations.as_ref().unwrap().get("sidecar"),
            Some(&"off".to_string())
        );
        let selector = deployment.spec.as_ref().unwrap().selector.match_labels.as_ref().unwrap();
        assert!(selector.get("tier").is_none());
    }

    #[test]
    fn test_secure_defaults() {
        let agent = create_test_agent("main");
        let deployment = ResourceBuilder::new(&agent)
            .unwrap()
            .build_deployment(&test_config());
        let pod = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(
            pod.security_context.as_ref().unwrap().run_as_non_root,
            Some(true)
        );
        let c = container(&deployment, AGENT_CONTAINER);
        assert_eq!(
            c.security_context.as_ref().unwrap().read_only_root_filesystem,
            Some(true)
        );
    }

    #[test]
    fn test_build_service() {
        let mut agent = create_test_agent("main");
        agent.spec.port = Some("9429".to_string());
        let svc = ResourceBuilder::new(&agent).unwrap().build_service();
        assert_eq!(svc.metadata.name, Some("vmagent-main".to_string()));
        assert_eq!(svc.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port, 9429);
    }

    #[test]
    fn test_build_secrets() {
        let agent = create_test_agent("main");
        let builder = ResourceBuilder::new(&agent).unwrap();
        let config = test_config();

        let cfg = builder.build_config_secret(&config);
        assert_eq!(cfg.metadata.name, Some("vmagent-main".to_string()));
        let data = cfg.data.as_ref().unwrap();
        assert!(data.contains_key("vmagent.yaml"));
        assert!(data.contains_key("url_relabel_0.yaml"));

        let tls = builder.build_tls_assets_secret(&config);
        assert_eq!(tls.metadata.name, Some("tls-assets-vmagent-main".to_string()));
        assert_eq!(
            tls.data.as_ref().unwrap().get("secret_ns1_tok_token"),
            Some(&ByteString(b"t0k3n".to_vec()))
        );
    }

    #[test]
    fn test_owner_references() {
        let agent = create_test_agent("main");
        let svc = ResourceBuilder::new(&agent).unwrap().build_service();
        let owners = svc.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "VMAgent");
        assert_eq!(owners[0].uid, "test-uid-123");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_invalid_port() {
        let mut agent = create_test_agent("main");
        agent.spec.port = Some("http".to_string());
        assert!(ResourceBuilder::new(&agent).is_err());
    }
}
