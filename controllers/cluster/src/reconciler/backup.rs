//! Backup Sidecar Injector
//!
//! Attaches the backup tooling to every eligible datacenter:
//! - a `medusa-restore` init container and a `medusa` gRPC sidecar in the
//!   datacenter pod template, sharing the database config and data volumes
//! - a standalone backup Deployment and Service in the datacenter's context
//! - the `<cluster>-medusa` ConfigMap holding the rendered backup config
//!
//! The pod template functions are pure and idempotent: injecting twice
//! yields the same template as injecting once.

use super::Reconciler;
use crate::reconcile_helpers::{ensure_object, metadata_drifted};
use context_client::{ClusterKey, ContextClientTrait, ContextError, ObjectKind};
use crds::{
    BackupPolicy, DatacenterTemplate, INJECTED_SECRETS_ANNOTATION, ProbeSettings,
    StandaloneBackupStatus, sanitize_name,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, DownwardAPIVolumeFile,
    DownwardAPIVolumeSource, EnvVar, GRPCAction, ObjectFieldSelector, PodSpec, PodTemplateSpec,
    Probe, ResourceRequirements, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const MEDUSA_CONTAINER: &str = "medusa";
pub const MEDUSA_RESTORE_CONTAINER: &str = "medusa-restore";
pub const SERVER_CONFIG_INIT_CONTAINER: &str = "server-config-init";
pub const MEDUSA_GRPC_PORT: i32 = 50051;

const SERVER_CONFIG_VOLUME: &str = "server-config";
const SERVER_DATA_VOLUME: &str = "server-data";
const PODINFO_VOLUME: &str = "podinfo";
const MEDUSA_CONFIG_KEY: &str = "medusa.ini";

/// Name of the standalone backup Deployment
pub fn standalone_deployment_name(cluster: &str, datacenter: &str) -> String {
    sanitize_name(&format!("{}-{}-medusa-standalone", cluster, datacenter))
}

/// Name of the standalone backup Service
pub fn standalone_service_name(cluster: &str, datacenter: &str) -> String {
    sanitize_name(&format!("{}-{}-medusa-service", cluster, datacenter))
}

/// Name of the backup ConfigMap, shared by every datacenter of a context
pub fn config_map_name(cluster: &str) -> String {
    sanitize_name(&format!("{}-medusa", cluster))
}

/// Secrets mounted into the backup containers
pub fn injected_secret_names(policy: &BackupPolicy) -> Vec<String> {
    vec![policy.credentials_secret_ref.name.clone()]
}

/// Secrets that must exist in every datacenter context before sequencing
pub fn required_secret_names(policy: &BackupPolicy) -> Vec<String> {
    let mut names = vec![
        policy.credentials_secret_ref.name.clone(),
        policy.storage_properties.storage_secret_ref.name.clone(),
    ];
    names.retain(|n| !n.is_empty());
    names.sort();
    names.dedup();
    names
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn resolve_ip_addresses(policy: &BackupPolicy) -> &'static str {
    if policy.resolve_ip_addresses.unwrap_or(false) { "True" } else { "False" }
}

fn medusa_env(mode: &str, policy: &BackupPolicy) -> Vec<EnvVar> {
    vec![
        env("MEDUSA_MODE", mode),
        env("MEDUSA_TMP_DIR", ""),
        env("MEDUSA_RESOLVE_IP_ADDRESSES", resolve_ip_addresses(policy)),
    ]
}

fn grpc_probe(settings: Option<&ProbeSettings>) -> Option<Probe> {
    let settings = settings?;
    Some(Probe {
        grpc: Some(GRPCAction {
            port: MEDUSA_GRPC_PORT,
            service: None,
        }),
        initial_delay_seconds: settings.initial_delay_seconds,
        timeout_seconds: settings.timeout_seconds,
        period_seconds: settings.period_seconds,
        success_threshold: settings.success_threshold,
        failure_threshold: settings.failure_threshold,
        ..Default::default()
    })
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().map(|(k, v)| (k.clone(), Quantity(v.clone()))).collect())
}

fn resources(policy: &BackupPolicy) -> Option<ResourceRequirements> {
    let settings = policy.resources.as_ref()?;
    Some(ResourceRequirements {
        limits: quantities(&settings.limits),
        requests: quantities(&settings.requests),
        ..Default::default()
    })
}

fn pod_volume_mounts(cluster: &str, policy: &BackupPolicy) -> Vec<VolumeMount> {
    vec![
        mount(SERVER_CONFIG_VOLUME, "/etc/cassandra"),
        mount(SERVER_DATA_VOLUME, "/var/lib/cassandra"),
        mount(PODINFO_VOLUME, "/etc/podinfo"),
        mount(&policy.credentials_secret_ref.name, "/etc/medusa-secrets"),
        mount(&config_map_name(cluster), "/etc/medusa"),
    ]
}

/// Backup container for the datacenter pods
fn medusa_container(name: &str, mode: &str, cluster: &str, policy: &BackupPolicy) -> Container {
    let is_sidecar = name == MEDUSA_CONTAINER;
    Container {
        name: name.to_string(),
        image: Some(policy.container_image.reference()),
        image_pull_policy: policy.container_image.pull_policy.clone(),
        env: Some(medusa_env(mode, policy)),
        volume_mounts: Some(pod_volume_mounts(cluster, policy)),
        ports: is_sidecar.then(|| {
            vec![ContainerPort {
                name: Some("grpc".to_string()),
                container_port: MEDUSA_GRPC_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]
        }),
        readiness_probe: if is_sidecar {
            grpc_probe(policy.readiness_probe.as_ref())
        } else {
            None
        },
        liveness_probe: if is_sidecar { grpc_probe(policy.liveness_probe.as_ref()) } else { None },
        resources: resources(policy),
        ..Default::default()
    }
}

fn upsert_container(containers: &mut Vec<Container>, container: Container) {
    match containers.iter_mut().find(|c| c.name == container.name) {
        Some(existing) => *existing = container,
        None => containers.push(container),
    }
}

fn upsert_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}

fn podinfo_volume() -> Volume {
    Volume {
        name: PODINFO_VOLUME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(vec![DownwardAPIVolumeFile {
                path: "labels".to_string(),
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.labels".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(secret: &str) -> Volume {
    Volume {
        name: secret.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn config_map_volume(cluster: &str) -> Volume {
    let name = config_map_name(cluster);
    Volume {
        name: name.clone(),
        config_map: Some(ConfigMapVolumeSource {
            name,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Injects the backup init container, sidecar, volumes and secret annotation
pub fn inject_backup_sidecars(
    template: &mut PodTemplateSpec,
    cluster: &str,
    policy: &BackupPolicy,
) {
    let spec = template.spec.get_or_insert_with(PodSpec::default);

    let init_containers = spec.init_containers.get_or_insert_with(Vec::new);
    let config_init = match init_containers
        .iter()
        .position(|c| c.name == SERVER_CONFIG_INIT_CONTAINER)
    {
        Some(index) => index,
        None => {
            // Placeholder the lifecycle operator fills in; never modified afterwards
            init_containers.insert(
                0,
                Container {
                    name: SERVER_CONFIG_INIT_CONTAINER.to_string(),
                    ..Default::default()
                },
            );
            0
        }
    };
    init_containers.retain(|c| c.name != MEDUSA_RESTORE_CONTAINER);
    // Removing an entry before the config init container shifts it left
    let config_init = init_containers
        .iter()
        .position(|c| c.name == SERVER_CONFIG_INIT_CONTAINER)
        .unwrap_or(config_init);
    init_containers.insert(
        config_init + 1,
        medusa_container(MEDUSA_RESTORE_CONTAINER, "RESTORE", cluster, policy),
    );

    upsert_container(
        &mut spec.containers,
        medusa_container(MEDUSA_CONTAINER, "GRPC", cluster, policy),
    );

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    upsert_volume(volumes, podinfo_volume());
    for secret in injected_secret_names(policy) {
        upsert_volume(volumes, secret_volume(&secret));
    }
    upsert_volume(volumes, config_map_volume(cluster));

    let metadata = template.metadata.get_or_insert_with(ObjectMeta::default);
    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            INJECTED_SECRETS_ANNOTATION.to_string(),
            injected_secret_names(policy).join(","),
        );
}

/// Whether both backup containers are present in a pod template
pub fn has_backup_sidecars(template: Option<&PodTemplateSpec>) -> bool {
    let Some(spec) = template.and_then(|t| t.spec.as_ref()) else {
        return false;
    };
    let has_init = spec
        .init_containers
        .as_ref()
        .is_some_and(|c| c.iter().any(|c| c.name == MEDUSA_RESTORE_CONTAINER));
    has_init && spec.containers.iter().any(|c| c.name == MEDUSA_CONTAINER)
}

/// Renders the backup tool configuration
pub fn render_backup_config(cluster: &str, policy: &BackupPolicy) -> String {
    let storage = &policy.storage_properties;
    let mut ini = String::new();
    ini.push_str("[cassandra]\n");
    ini.push_str("use_sudo = False\n");
    ini.push('\n');
    ini.push_str("[storage]\n");
    ini.push_str(&format!(
        "storage_provider = {}\n",
        storage.storage_provider.as_deref().unwrap_or("local")
    ));
    ini.push_str(&format!(
        "bucket_name = {}\n",
        storage.bucket_name.as_deref().unwrap_or(cluster)
    ));
    if let Some(prefix) = storage.prefix.as_deref() {
        ini.push_str(&format!("prefix = {}\n", prefix));
    }
    ini.push_str("key_file = /etc/medusa-secrets/credentials\n");
    ini.push('\n');
    ini.push_str("[grpc]\n");
    ini.push_str("enabled = 1\n");
    ini.push('\n');
    ini.push_str("[logging]\n");
    ini.push_str("level = INFO\n");
    ini
}

fn object_meta(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

pub fn desired_config_map(cluster: &str, namespace: &str, policy: &BackupPolicy) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(
            &config_map_name(cluster),
            namespace,
            crds::cluster_labels(cluster, namespace),
        ),
        data: Some(BTreeMap::from([(
            MEDUSA_CONFIG_KEY.to_string(),
            render_backup_config(cluster, policy),
        )])),
        ..Default::default()
    }
}

fn standalone_labels(cluster: &str, namespace: &str, datacenter: &str) -> BTreeMap<String, String> {
    let mut labels = crds::datacenter_labels(cluster, namespace, datacenter);
    labels.insert("app".to_string(), standalone_deployment_name(cluster, datacenter));
    labels
}

pub fn desired_standalone_deployment(
    cluster: &str,
    namespace: &str,
    datacenter: &str,
    policy: &BackupPolicy,
) -> Deployment {
    let name = standalone_deployment_name(cluster, datacenter);
    let labels = standalone_labels(cluster, namespace, datacenter);
    let selector = BTreeMap::from([("app".to_string(), name.clone())]);

    let container = Container {
        name: name.clone(),
        image: Some(policy.container_image.reference()),
        image_pull_policy: policy.container_image.pull_policy.clone(),
        env: Some(medusa_env("GRPC", policy)),
        ports: Some(vec![ContainerPort {
            name: Some("grpc".to_string()),
            container_port: MEDUSA_GRPC_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            mount(&policy.credentials_secret_ref.name, "/etc/medusa-secrets"),
            mount(&config_map_name(cluster), "/etc/medusa"),
        ]),
        readiness_probe: grpc_probe(policy.readiness_probe.as_ref()),
        liveness_probe: grpc_probe(policy.liveness_probe.as_ref()),
        resources: resources(policy),
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(&name, namespace, labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(policy.standalone_replicas.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![
                        secret_volume(&policy.credentials_secret_ref.name),
                        config_map_volume(cluster),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn desired_standalone_service(cluster: &str, namespace: &str, datacenter: &str) -> Service {
    Service {
        metadata: object_meta(
            &standalone_service_name(cluster, datacenter),
            namespace,
            crds::datacenter_labels(cluster, namespace, datacenter),
        ),
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                standalone_deployment_name(cluster, datacenter),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("grpc".to_string()),
                port: MEDUSA_GRPC_PORT,
                target_port: Some(IntOrString::Int(MEDUSA_GRPC_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `readyReplicas >= replicas`
pub fn standalone_ready(deployment: &Deployment) -> bool {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready >= desired
}

// Drift is judged on the fields the controller sets; server defaults are ignored

fn containers_drifted(current: &[Container], desired: &[Container]) -> bool {
    desired.iter().any(|want| {
        current.iter().find(|c| c.name == want.name).is_none_or(|have| {
            have.image != want.image
                || have.env != want.env
                || have.ports != want.ports
                || have.volume_mounts != want.volume_mounts
                || have.resources != want.resources
        })
    })
}

fn deployment_drifted(current: &Deployment, desired: &Deployment) -> bool {
    let (Some(have), Some(want)) = (current.spec.as_ref(), desired.spec.as_ref()) else {
        return true;
    };
    let have_pod = have.template.spec.as_ref();
    let want_pod = want.template.spec.as_ref();
    metadata_drifted(current.metadata.labels.as_ref(), desired.metadata.labels.as_ref())
        || have.replicas != want.replicas
        || have.selector != want.selector
        || containers_drifted(
            have_pod.map(|p| p.containers.as_slice()).unwrap_or_default(),
            want_pod.map(|p| p.containers.as_slice()).unwrap_or_default(),
        )
}

fn service_drifted(current: &Service, desired: &Service) -> bool {
    let (Some(have), Some(want)) = (current.spec.as_ref(), desired.spec.as_ref()) else {
        return true;
    };
    let ports = |s: &ServiceSpec| {
        s.ports
            .as_ref()
            .map(|ports| ports.iter().map(|p| (p.port, p.target_port.clone())).collect::<Vec<_>>())
    };
    metadata_drifted(current.metadata.labels.as_ref(), desired.metadata.labels.as_ref())
        || have.selector != want.selector
        || ports(have) != ports(want)
}

fn config_map_drifted(current: &ConfigMap, desired: &ConfigMap) -> bool {
    metadata_drifted(current.metadata.labels.as_ref(), desired.metadata.labels.as_ref())
        || current.data != desired.data
}

impl Reconciler {
    /// Ensures the backup ConfigMap, standalone Deployment and Service for one datacenter
    ///
    /// Never fails the pass: errors are recorded on the returned fact and retried next pass.
    pub(crate) async fn ensure_standalone_backup(
        &self,
        cluster: &str,
        namespace: &str,
        template: &DatacenterTemplate,
        policy: &BackupPolicy,
    ) -> StandaloneBackupStatus {
        match self.try_ensure_standalone_backup(cluster, namespace, template, policy).await {
            Ok(ready) => StandaloneBackupStatus {
                deployed: true,
                ready,
                error: None,
            },
            Err(e) => {
                warn!(
                    "Standalone backup for datacenter {} of {}/{} not reconciled: {}",
                    template.name, namespace, cluster, e
                );
                StandaloneBackupStatus {
                    deployed: false,
                    ready: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_ensure_standalone_backup(
        &self,
        cluster: &str,
        namespace: &str,
        template: &DatacenterTemplate,
        policy: &BackupPolicy,
    ) -> Result<bool, ContextError> {
        let base = ClusterKey::new(&template.k8s_context, namespace, "");

        let config_map = desired_config_map(cluster, namespace, policy);
        let cm_key = base.with_name(config_map_name(cluster));
        ensure_object(
            ObjectKind::ConfigMap,
            &cm_key,
            || self.client.get_config_map(&cm_key),
            |current| config_map_drifted(current, &config_map),
            self.client.create_config_map(&cm_key, &config_map),
            self.client.patch_config_map(&cm_key, &config_map),
        )
        .await?;

        let deployment = desired_standalone_deployment(cluster, namespace, &template.name, policy);
        let deploy_key = base.with_name(standalone_deployment_name(cluster, &template.name));
        let live = ensure_object(
            ObjectKind::Deployment,
            &deploy_key,
            || self.client.get_deployment(&deploy_key),
            |current| deployment_drifted(current, &deployment),
            self.client.create_deployment(&deploy_key, &deployment),
            self.client.patch_deployment(&deploy_key, &deployment),
        )
        .await?
        .into_inner();

        let service = desired_standalone_service(cluster, namespace, &template.name);
        let svc_key = base.with_name(standalone_service_name(cluster, &template.name));
        ensure_object(
            ObjectKind::Service,
            &svc_key,
            || self.client.get_service(&svc_key),
            |current| service_drifted(current, &service),
            self.client.create_service(&svc_key, &service),
            self.client.patch_service(&svc_key, &service),
        )
        .await?;

        let ready = standalone_ready(&live);
        debug!("Standalone backup {} ready: {}", deploy_key, ready);
        Ok(ready)
    }
}

#[cfg(test)]
#[path = "backup_test.rs"]
mod backup_test;
