use std::collections::HashMap;
use std::hash::Hash;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{
    CreateImageOptions, ListImagesOptions, PruneImagesOptions, RemoveImageOptions, TagImageOptions,
};
use bollard::models::{
    EndpointPortConfig, EndpointPortConfigProtocolEnum, EndpointSpec, HostConfig, Mount,
    MountTypeEnum, NetworkAttachmentConfig, RestartPolicy, RestartPolicyNameEnum, ServiceSpecMode,
    ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec, TaskState,
};
use bollard::network::CreateNetworkOptions;
use bollard::service::{InspectServiceOptions, ListServicesOptions};
use bollard::task::ListTasksOptions;
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    cpu_percent, ContainerPort, ContainerSpec, ContainerStats, ContainerSummary, DockerError,
    ImageSummary, LabelFilters, NetworkSummary, RegistryCredentials, ServiceHealth, ServiceSpec,
    ServiceSummary, VolumeSummary,
};

const STOP_GRACE_SECONDS: i64 = 10;
const LOG_CHANNEL_CAPACITY: usize = 256;

/// [`ContainerPort`] backed by the Docker Engine API.
#[derive(Clone, Debug)]
pub struct DaemonContainers {
    docker: Docker,
}

impl DaemonContainers {
    #[must_use]
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn classify(error: BollardError) -> DockerError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => DockerError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 304 | 409,
            message,
        } => DockerError::Conflict(message),
        other => DockerError::Infrastructure(other.to_string()),
    }
}

fn to_hash_map<K: Clone + Eq + Hash, V: Clone>(map: &std::collections::BTreeMap<K, V>) -> HashMap<K, V> {
    map.iter().map(|(key, value)| (key.clone(), value.clone())).collect()
}

fn env_list(env: &std::collections::BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(key, value)| format!("{key}={value}")).collect()
}

fn summary_from_list(container: bollard::models::ContainerSummary) -> ContainerSummary {
    let name = container
        .names
        .and_then(|names| names.into_iter().next())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default();

    ContainerSummary {
        id: container.id.unwrap_or_default(),
        name,
        image: container.image.unwrap_or_default(),
        state: container.state.unwrap_or_default(),
        status: container.status.unwrap_or_default(),
        labels: container.labels.unwrap_or_default().into_iter().collect(),
    }
}

#[async_trait]
impl ContainerPort for DaemonContainers {
    async fn list_containers(&self, filters: &LabelFilters) -> Result<Vec<ContainerSummary>, DockerError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: to_hash_map(filters),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;
        Ok(containers.into_iter().map(summary_from_list).collect())
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerSummary, DockerError> {
        let response = self
            .docker
            .inspect_container(id_or_name, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;

        let config = response.config.unwrap_or_default();
        let state = response.state.unwrap_or_default();
        Ok(ContainerSummary {
            id: response.id.unwrap_or_default(),
            name: response
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.image.unwrap_or_default(),
            state: state.status.map(|status| status.to_string()).unwrap_or_default(),
            status: state.error.unwrap_or_default(),
            labels: config.labels.unwrap_or_default().into_iter().collect(),
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let exposed_ports = spec.exposed_port.map(|port| {
            HashMap::from([(format!("{port}/tcp"), HashMap::<(), ()>::new())])
        });
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env_list(&spec.env)),
            labels: Some(to_hash_map(&spec.labels)),
            exposed_ports,
            cmd: spec.command.clone(),
            working_dir: spec.working_dir.clone(),
            host_config: Some(HostConfig {
                network_mode: spec.network.clone(),
                binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(classify)?;
        debug!(container = %spec.name, id = %response.id, "created container");
        Ok(response.id)
    }

    async fn start_container(&self, id_or_name: &str) -> Result<(), DockerError> {
        self.docker
            .start_container::<String>(id_or_name, None)
            .await
            .map_err(classify)
    }

    async fn stop_container(&self, id_or_name: &str) -> Result<(), DockerError> {
        self.docker
            .stop_container(id_or_name, Some(StopContainerOptions { t: STOP_GRACE_SECONDS }))
            .await
            .map_err(classify)
    }

    async fn restart_container(&self, id_or_name: &str) -> Result<(), DockerError> {
        self.docker
            .restart_container(
                id_or_name,
                Some(RestartContainerOptions {
                    t: isize::try_from(STOP_GRACE_SECONDS).unwrap_or(10),
                }),
            )
            .await
            .map_err(classify)
    }

    async fn remove_container(&self, id_or_name: &str) -> Result<(), DockerError> {
        self.docker
            .remove_container(
                id_or_name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: false,
                    link: false,
                }),
            )
            .await
            .map_err(classify)
    }

    async fn container_logs(
        &self,
        id_or_name: &str,
        tail: u32,
        follow: bool,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, DockerError> {
        // Surfaces NotFound before the stream starts.
        self.inspect_container(id_or_name).await?;

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            tail: tail.to_string(),
            timestamps: false,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id_or_name, Some(options));
        let (sender, receiver) = mpsc::channel(LOG_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(output)) => {
                        let line = output.to_string();
                        if sender.send(line.trim_end().to_string()).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        debug!(%error, "container log stream ended with error");
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(receiver)
    }

    async fn container_stats(&self, id_or_name: &str) -> Result<ContainerStats, DockerError> {
        let mut stream = self.docker.stats(
            id_or_name,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(error)) => return Err(classify(error)),
            None => return Err(DockerError::NotFound(id_or_name.to_string())),
        };

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let (network_rx_bytes, network_tx_bytes) = stats
            .networks
            .unwrap_or_default()
            .values()
            .fold((0_u64, 0_u64), |(rx, tx), network| {
                (rx.saturating_add(network.rx_bytes), tx.saturating_add(network.tx_bytes))
            });

        Ok(ContainerStats {
            id: stats.id,
            name: stats.name.trim_start_matches('/').to_string(),
            cpu_percent: cpu_percent(cpu_delta, system_delta, stats.cpu_stats.online_cpus.unwrap_or(1)),
            memory_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
            network_rx_bytes,
            network_tx_bytes,
        })
    }

    async fn exec(&self, id_or_name: &str, command: &[String]) -> Result<String, DockerError> {
        let created = self
            .docker
            .create_exec(
                id_or_name,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&created.id, None).await.map_err(classify)?
        {
            while let Some(chunk) = output.next().await {
                collected.push_str(&chunk.map_err(classify)?.to_string());
            }
        }
        Ok(collected)
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, DockerError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                id: image.id,
                tags: image.repo_tags,
                size_bytes: image.size,
            })
            .collect())
    }

    async fn pull_image(&self, image: &str, credentials: Option<&RegistryCredentials>) -> Result<(), DockerError> {
        let credentials = credentials.map(|credentials| DockerCredentials {
            username: Some(credentials.username.clone()),
            password: Some(credentials.password.clone()),
            serveraddress: Some(credentials.server.clone()),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            credentials,
        );
        while let Some(progress) = stream.next().await {
            progress.map_err(classify)?;
        }
        Ok(())
    }

    async fn tag_image(&self, source: &str, repository: &str, tag: &str) -> Result<(), DockerError> {
        self.docker
            .tag_image(
                source,
                Some(TagImageOptions {
                    repo: repository.to_string(),
                    tag: tag.to_string(),
                }),
            )
            .await
            .map_err(classify)
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        match self.docker.inspect_image(image).await.map_err(classify) {
            Ok(_) => Ok(true),
            Err(DockerError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn remove_image(&self, image: &str) -> Result<(), DockerError> {
        self.docker
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: false,
                    noprune: false,
                }),
                None,
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn prune_dangling_images(&self) -> Result<u64, DockerError> {
        let filters = HashMap::from([("dangling".to_string(), vec!["true".to_string()])]);
        let response = self
            .docker
            .prune_images(Some(PruneImagesOptions { filters }))
            .await
            .map_err(classify)?;
        Ok(response
            .space_reclaimed
            .and_then(|reclaimed| u64::try_from(reclaimed).ok())
            .unwrap_or(0))
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, DockerError> {
        let mounts = spec
            .binds
            .iter()
            .map(|(source, target)| Mount {
                source: Some(source.clone()),
                target: Some(target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            })
            .collect();
        let service = bollard::models::ServiceSpec {
            name: Some(spec.name.clone()),
            labels: Some(to_hash_map(&spec.labels)),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(spec.image.clone()),
                    env: Some(env_list(&spec.env)),
                    labels: Some(to_hash_map(&spec.labels)),
                    command: spec.command.clone(),
                    dir: spec.working_dir.clone(),
                    mounts: Some(mounts),
                    ..Default::default()
                }),
                networks: spec.network.as_ref().map(|network| {
                    vec![NetworkAttachmentConfig {
                        target: Some(network.clone()),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
                ..Default::default()
            }),
            endpoint_spec: spec.published_port.map(|published| EndpointSpec {
                ports: Some(vec![EndpointPortConfig {
                    target_port: Some(i64::from(spec.target_port)),
                    published_port: Some(i64::from(published)),
                    protocol: Some(EndpointPortConfigProtocolEnum::TCP),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_service(service, None)
            .await
            .map_err(classify)?;
        Ok(response.id.unwrap_or_else(|| spec.name.clone()))
    }

    async fn list_services(&self, filters: &LabelFilters) -> Result<Vec<ServiceSummary>, DockerError> {
        let services = self
            .docker
            .list_services(Some(ListServicesOptions::<String> {
                filters: to_hash_map(filters),
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        Ok(services
            .into_iter()
            .map(|service| {
                let spec = service.spec.unwrap_or_default();
                ServiceSummary {
                    id: service.id.unwrap_or_default(),
                    name: spec.name.unwrap_or_default(),
                    labels: spec.labels.unwrap_or_default().into_iter().collect(),
                }
            })
            .collect())
    }

    async fn service_health(&self, name: &str) -> Result<ServiceHealth, DockerError> {
        let service = self
            .docker
            .inspect_service(name, Some(InspectServiceOptions { insert_defaults: true }))
            .await
            .map_err(classify)?;
        let desired = service
            .spec
            .and_then(|spec| spec.mode)
            .and_then(|mode| mode.replicated)
            .and_then(|replicated| replicated.replicas)
            .and_then(|replicas| u64::try_from(replicas).ok())
            .unwrap_or(1);

        let filters = HashMap::from([
            ("service".to_string(), vec![name.to_string()]),
            ("desired-state".to_string(), vec!["running".to_string()]),
        ]);
        let tasks = self
            .docker
            .list_tasks(Some(ListTasksOptions { filters }))
            .await
            .map_err(classify)?;
        let running = tasks
            .iter()
            .filter(|task| {
                task.status
                    .as_ref()
                    .and_then(|status| status.state.as_ref())
                    .is_some_and(|state| *state == TaskState::RUNNING)
            })
            .count();

        Ok(ServiceHealth {
            running: u64::try_from(running).unwrap_or(u64::MAX),
            desired,
        })
    }

    async fn remove_service(&self, name: &str) -> Result<(), DockerError> {
        self.docker.delete_service(name).await.map_err(classify)
    }

    async fn create_network(&self, name: &str) -> Result<(), DockerError> {
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, DockerError> {
        let networks = self
            .docker
            .list_networks::<String>(None)
            .await
            .map_err(classify)?;
        Ok(networks
            .into_iter()
            .map(|network| NetworkSummary {
                id: network.id.unwrap_or_default(),
                name: network.name.unwrap_or_default(),
                driver: network.driver.unwrap_or_default(),
            })
            .collect())
    }

    async fn remove_network(&self, name: &str) -> Result<(), DockerError> {
        self.docker.remove_network(name).await.map_err(classify)
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeSummary, DockerError> {
        let volume = self
            .docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                driver: "local".to_string(),
                ..Default::default()
            })
            .await
            .map_err(classify)?;
        Ok(VolumeSummary {
            name: volume.name,
            driver: volume.driver,
            mountpoint: volume.mountpoint,
        })
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>, DockerError> {
        let response = self
            .docker
            .list_volumes::<String>(None)
            .await
            .map_err(classify)?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| VolumeSummary {
                name: volume.name,
                driver: volume.driver,
                mountpoint: volume.mountpoint,
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), DockerError> {
        self.docker.remove_volume(name, None).await.map_err(classify)
    }
}
