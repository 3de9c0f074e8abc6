//! In-memory doubles for the host, container, source and probe ports.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::{
    new_id, ApplicationRecord, BuildPack, DbClient, Environment, HealthcheckKind, NewApplication,
    NewAuditLog, NewUser, OrganizationRecord, StringMap, UserType,
};
use crate::docker::{
    ContainerPort, ContainerRuntime, ContainerSpec, ContainerStats, ContainerSummary, DockerError,
    ImageSummary, LabelFilters, NetworkSummary, RegistryCredentials, ServiceHealth, ServiceSpec,
    ServiceSummary, VolumeSummary,
};
use crate::healthcheck::{ProbeOutcome, Prober};
use crate::host::{
    CommandOutput, Host, HostError, HostProvider, ShellProcess, SystemReader, SystemSnapshot,
};
use crate::repository::{FetchRequest, FetchedSource, RepoError, SourceFetcher};

pub async fn temp_db() -> DbClient {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("control-plane.db");
    std::mem::forget(tempdir);

    DbClient::initialize(&db_path.to_string_lossy())
        .await
        .expect("db init")
}

pub async fn seed_user(db: &DbClient, username: &str, user_type: UserType) -> String {
    let user_id = new_id();
    db.insert_user(&NewUser {
        id: user_id.clone(),
        external_id: format!("local:{username}"),
        email: format!("{username}@example.test"),
        username: username.to_string(),
        password_hash: "not-a-real-hash".to_string(),
        user_type,
    })
    .await
    .expect("insert user");
    user_id
}

pub fn audit(actor: &str, organization_id: &str, resource: &str, action: &str) -> NewAuditLog {
    NewAuditLog {
        actor_user_id: actor.to_string(),
        organization_id: organization_id.to_string(),
        resource: resource.to_string(),
        action: action.to_string(),
        target_id: None,
        payload_snapshot: serde_json::json!({}),
    }
}

pub fn new_application(organization_id: &str, user_id: &str, name: &str) -> NewApplication {
    NewApplication {
        id: new_id(),
        organization_id: organization_id.to_string(),
        user_id: user_id.to_string(),
        family_id: None,
        name: name.to_string(),
        repository: "https://github.com/acme/api".to_string(),
        branch: "main".to_string(),
        build_pack: BuildPack::Dockerfile,
        dockerfile_path: None,
        base_path: None,
        port: 8080,
        domain: Some(format!("{name}.example.test")),
        environment: Environment::Production,
        framework: None,
        pre_run_command: String::new(),
        post_run_command: String::new(),
        build_variables: StringMap::default(),
        environment_variables: StringMap::default(),
        labels: StringMap::default(),
    }
}

/// Owner user, organization `acme` and one application built from `application`.
pub async fn seed_tenant(
    db: &DbClient,
    application: impl FnOnce(&str, &str) -> NewApplication,
) -> (String, OrganizationRecord, ApplicationRecord) {
    let user_id = seed_user(db, "owner", UserType::Admin).await;
    let organization = db
        .create_organization("Acme", "acme", "", &user_id)
        .await
        .expect("create org");
    let new_application = application(&organization.id, &user_id);
    let record = db
        .create_application(
            &new_application,
            &audit(&user_id, &organization.id, "deploy", "create"),
        )
        .await
        .expect("create application");
    (user_id, organization, record)
}

#[derive(Default)]
struct FakeHostState {
    commands: Vec<String>,
    responses: Vec<(String, CommandOutput)>,
    files: BTreeMap<String, Vec<u8>>,
    modes: BTreeMap<String, u32>,
    dirs: BTreeSet<String>,
    fail_writes: usize,
}

/// Host that records commands and keeps files in memory. Commands answer
/// with the first scripted response whose pattern they contain, or succeed
/// with empty output.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeHostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeHostState> {
        self.state.lock().expect("fake host state")
    }

    /// Non-zero exits put `output` on stderr, zero exits on stdout.
    pub fn respond(&self, pattern: &str, output: &str, exit_code: i32) {
        let output = if exit_code == 0 {
            CommandOutput {
                stdout: output.to_string(),
                stderr: String::new(),
                exit_code,
            }
        } else {
            CommandOutput {
                stdout: String::new(),
                stderr: output.to_string(),
                exit_code,
            }
        };
        self.state().responses.push((pattern.to_string(), output));
    }

    pub fn put_file(&self, path: &str, contents: &[u8]) {
        self.state().files.insert(path.to_string(), contents.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn file_mode(&self, path: &str) -> Option<u32> {
        self.state().modes.get(path).copied()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.state().fail_writes = count;
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn execute(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, HostError> {
        let mut state = self.state();
        state.commands.push(command.to_string());
        let response = state
            .responses
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone());
        Ok(response.unwrap_or_default())
    }

    async fn write_file(&self, path: &str, contents: &[u8], mode: u32) -> Result<(), HostError> {
        let mut state = self.state();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(HostError::File(format!("injected write failure for {path}")));
        }
        state.files.insert(path.to_string(), contents.to_vec());
        state.modes.insert(path.to_string(), mode);
        if let Some(parent) = crate::host::parent_dir(path) {
            state.dirs.insert(parent.to_string());
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, HostError> {
        self.state()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| HostError::File(format!("{path}: no such file")))
    }

    async fn remove_file(&self, path: &str) -> Result<(), HostError> {
        let mut state = self.state();
        state.files.remove(path);
        state.modes.remove(path);
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), HostError> {
        self.state().dirs.insert(path.to_string());
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), HostError> {
        let mut state = self.state();
        let contents = state
            .files
            .remove(from)
            .ok_or_else(|| HostError::File(format!("{from}: no such file")))?;
        state.files.insert(to.to_string(), contents);
        if let Some(mode) = state.modes.remove(from) {
            state.modes.insert(to.to_string(), mode);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, HostError> {
        let state = self.state();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(state.files.contains_key(path)
            || state.dirs.contains(path)
            || state.files.keys().any(|file| file.starts_with(&prefix)))
    }

    /// A shell that echoes its input back.
    async fn open_shell(&self) -> Result<ShellProcess, HostError> {
        let (client_in, mut shell_in) = tokio::io::duplex(4096);
        let (mut shell_out, client_out) = tokio::io::duplex(4096);
        let echo = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut shell_in, &mut shell_out).await;
        });
        Ok(ShellProcess {
            stdin: Box::new(client_in),
            stdout: Box::new(client_out),
            guard: Box::new(AbortOnDrop(echo)),
        })
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct StaticSystemReader(pub SystemSnapshot);

#[async_trait]
impl SystemReader for StaticSystemReader {
    async fn snapshot(&self) -> Result<SystemSnapshot, HostError> {
        Ok(self.0.clone())
    }
}

/// Every tenant gets the same [`FakeHost`].
pub struct FakeHostProvider {
    pub host: Arc<FakeHost>,
    pub snapshot: SystemSnapshot,
    released: Mutex<Vec<String>>,
}

impl FakeHostProvider {
    pub fn new(host: Arc<FakeHost>) -> Self {
        Self {
            host,
            snapshot: SystemSnapshot {
                hostname: "fake-host".to_string(),
                ..SystemSnapshot::default()
            },
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().expect("released").clone()
    }
}

#[async_trait]
impl HostProvider for FakeHostProvider {
    async fn host_for(&self, _organization_id: &str) -> Result<Arc<dyn Host>, HostError> {
        Ok(self.host.clone())
    }

    async fn system_reader_for(
        &self,
        _organization_id: &str,
    ) -> Result<Arc<dyn SystemReader>, HostError> {
        Ok(Arc::new(StaticSystemReader(self.snapshot.clone())))
    }

    async fn release_tenant(&self, organization_id: &str) {
        self.released
            .lock()
            .expect("released")
            .push(organization_id.to_string());
    }
}

#[derive(Default)]
struct FakeDocker {
    next_id: usize,
    containers: BTreeMap<String, ContainerSummary>,
    created: Vec<ContainerSpec>,
    removed: Vec<String>,
    images: BTreeSet<String>,
    services: BTreeMap<String, (ServiceSpec, ServiceHealth)>,
    service_creates: usize,
    networks: BTreeSet<String>,
    volumes: BTreeSet<String>,
    fail_creates: usize,
    fail_service_creates: usize,
    unhealthy_services: bool,
}

impl FakeDocker {
    fn find(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .values()
            .find(|container| container.id == id_or_name)
            .map(|container| container.name.clone())
    }
}

fn matches_labels(labels: &BTreeMap<String, String>, filters: &LabelFilters) -> bool {
    filters.get("label").is_none_or(|wanted| {
        wanted.iter().all(|pair| match pair.split_once('=') {
            Some((key, value)) => labels.get(key).is_some_and(|actual| actual == value),
            None => labels.contains_key(pair),
        })
    })
}

/// Container daemon held in memory.
#[derive(Default)]
pub struct FakeContainers {
    state: Mutex<FakeDocker>,
}

impl FakeContainers {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeDocker> {
        self.state.lock().expect("fake docker state")
    }

    pub fn add_image(&self, image: &str) {
        self.state().images.insert(image.to_string());
    }

    pub fn add_container(&self, name: &str, image: &str, labels: BTreeMap<String, String>, running: bool) {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            name.to_string(),
            ContainerSummary {
                id,
                name: name.to_string(),
                image: image.to_string(),
                state: if running { "running" } else { "exited" }.to_string(),
                status: String::new(),
                labels,
            },
        );
    }

    pub fn container(&self, name: &str) -> Option<ContainerSummary> {
        self.state().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state().images.contains(image)
    }

    pub fn service(&self, name: &str) -> Option<ServiceSpec> {
        self.state().services.get(name).map(|(spec, _)| spec.clone())
    }

    pub fn service_creates(&self) -> usize {
        self.state().service_creates
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.state().fail_creates = count;
    }

    pub fn fail_next_service_creates(&self, count: usize) {
        self.state().fail_service_creates = count;
    }

    pub fn set_services_unhealthy(&self, unhealthy: bool) {
        self.state().unhealthy_services = unhealthy;
    }
}

#[async_trait]
impl ContainerPort for FakeContainers {
    async fn list_containers(&self, filters: &LabelFilters) -> Result<Vec<ContainerSummary>, DockerError> {
        Ok(self
            .state()
            .containers
            .values()
            .filter(|container| matches_labels(&container.labels, filters))
            .cloned()
            .collect())
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerSummary, DockerError> {
        let state = self.state();
        state
            .find(id_or_name)
            .and_then(|name| state.containers.get(&name).cloned())
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let mut state = self.state();
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(DockerError::Infrastructure("injected create failure".to_string()));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(DockerError::Conflict(format!("name {} in use", spec.name)));
        }
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            spec.name.clone(),
            ContainerSummary {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: "created".to_string(),
                status: String::new(),
                labels: spec.labels.clone(),
            },
        );
        state.created.push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id_or_name: &str) -> Result<(), DockerError> {
        let mut state = self.state();
        let name = state
            .find(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?;
        if let Some(container) = state.containers.get_mut(&name) {
            if container.is_running() {
                return Err(DockerError::Conflict("already started".to_string()));
            }
            container.state = "running".to_string();
        }
        Ok(())
    }

    async fn stop_container(&self, id_or_name: &str) -> Result<(), DockerError> {
        let mut state = self.state();
        let name = state
            .find(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?;
        if let Some(container) = state.containers.get_mut(&name) {
            if !container.is_running() {
                return Err(DockerError::Conflict("already stopped".to_string()));
            }
            container.state = "exited".to_string();
        }
        Ok(())
    }

    async fn restart_container(&self, id_or_name: &str) -> Result<(), DockerError> {
        let mut state = self.state();
        let name = state
            .find(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?;
        if let Some(container) = state.containers.get_mut(&name) {
            container.state = "running".to_string();
        }
        Ok(())
    }

    async fn remove_container(&self, id_or_name: &str) -> Result<(), DockerError> {
        let mut state = self.state();
        let name = state
            .find(id_or_name)
            .ok_or_else(|| DockerError::NotFound(id_or_name.to_string()))?;
        state.containers.remove(&name);
        state.removed.push(name);
        Ok(())
    }

    async fn container_logs(
        &self,
        id_or_name: &str,
        tail: u32,
        _follow: bool,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, DockerError> {
        self.inspect_container(id_or_name).await?;
        let (sender, receiver) = mpsc::channel(16);
        for line in 0..tail.min(3) {
            let _ = sender.try_send(format!("{id_or_name} line {line}"));
        }
        Ok(receiver)
    }

    async fn container_stats(&self, id_or_name: &str) -> Result<ContainerStats, DockerError> {
        let container = self.inspect_container(id_or_name).await?;
        Ok(ContainerStats {
            id: container.id,
            name: container.name,
            cpu_percent: 1.5,
            memory_bytes: 64 * 1024 * 1024,
            memory_limit_bytes: 1024 * 1024 * 1024,
            ..ContainerStats::default()
        })
    }

    async fn exec(&self, id_or_name: &str, command: &[String]) -> Result<String, DockerError> {
        self.inspect_container(id_or_name).await?;
        Ok(command.join(" "))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, DockerError> {
        Ok(self
            .state()
            .images
            .iter()
            .map(|image| ImageSummary {
                id: format!("sha256:{image}"),
                tags: vec![image.clone()],
                size_bytes: 0,
            })
            .collect())
    }

    async fn pull_image(&self, image: &str, _credentials: Option<&RegistryCredentials>) -> Result<(), DockerError> {
        self.add_image(image);
        Ok(())
    }

    async fn tag_image(&self, source: &str, repository: &str, tag: &str) -> Result<(), DockerError> {
        let mut state = self.state();
        if !state.images.contains(source) {
            return Err(DockerError::NotFound(source.to_string()));
        }
        state.images.insert(format!("{repository}:{tag}"));
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        Ok(self.has_image(image))
    }

    async fn remove_image(&self, image: &str) -> Result<(), DockerError> {
        if self.state().images.remove(image) {
            Ok(())
        } else {
            Err(DockerError::NotFound(image.to_string()))
        }
    }

    async fn prune_dangling_images(&self) -> Result<u64, DockerError> {
        Ok(0)
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, DockerError> {
        let mut state = self.state();
        state.service_creates += 1;
        if state.fail_service_creates > 0 {
            state.fail_service_creates -= 1;
            return Err(DockerError::Infrastructure("injected service failure".to_string()));
        }
        if state.services.contains_key(&spec.name) {
            return Err(DockerError::Conflict(format!("service {} exists", spec.name)));
        }
        let health = if state.unhealthy_services {
            ServiceHealth { running: 0, desired: 1 }
        } else {
            ServiceHealth { running: 1, desired: 1 }
        };
        state.services.insert(spec.name.clone(), (spec.clone(), health));
        Ok(format!("service-{}", spec.name))
    }

    async fn list_services(&self, filters: &LabelFilters) -> Result<Vec<ServiceSummary>, DockerError> {
        Ok(self
            .state()
            .services
            .values()
            .filter(|(spec, _)| matches_labels(&spec.labels, filters))
            .map(|(spec, _)| ServiceSummary {
                id: format!("service-{}", spec.name),
                name: spec.name.clone(),
                labels: spec.labels.clone(),
            })
            .collect())
    }

    async fn service_health(&self, name: &str) -> Result<ServiceHealth, DockerError> {
        self.state()
            .services
            .get(name)
            .map(|(_, health)| *health)
            .ok_or_else(|| DockerError::NotFound(name.to_string()))
    }

    async fn remove_service(&self, name: &str) -> Result<(), DockerError> {
        self.state()
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DockerError::NotFound(name.to_string()))
    }

    async fn create_network(&self, name: &str) -> Result<(), DockerError> {
        if self.state().networks.insert(name.to_string()) {
            Ok(())
        } else {
            Err(DockerError::Conflict(format!("network {name} exists")))
        }
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, DockerError> {
        Ok(self
            .state()
            .networks
            .iter()
            .map(|name| NetworkSummary {
                id: name.clone(),
                name: name.clone(),
                driver: "bridge".to_string(),
            })
            .collect())
    }

    async fn remove_network(&self, name: &str) -> Result<(), DockerError> {
        if self.state().networks.remove(name) {
            Ok(())
        } else {
            Err(DockerError::NotFound(name.to_string()))
        }
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeSummary, DockerError> {
        self.state().volumes.insert(name.to_string());
        Ok(VolumeSummary {
            name: name.to_string(),
            driver: "local".to_string(),
            mountpoint: format!("/var/lib/docker/volumes/{name}/_data"),
        })
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>, DockerError> {
        Ok(self
            .state()
            .volumes
            .iter()
            .map(|name| VolumeSummary {
                name: name.clone(),
                driver: "local".to_string(),
                mountpoint: format!("/var/lib/docker/volumes/{name}/_data"),
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), DockerError> {
        if self.state().volumes.remove(name) {
            Ok(())
        } else {
            Err(DockerError::NotFound(name.to_string()))
        }
    }
}

pub struct FakeRuntime {
    pub containers: Arc<FakeContainers>,
}

impl FakeRuntime {
    pub fn new(containers: Arc<FakeContainers>) -> Self {
        Self { containers }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn containers_for(&self, _organization_id: &str) -> Result<Arc<dyn ContainerPort>, DockerError> {
        Ok(self.containers.clone())
    }

    async fn release_tenant(&self, _organization_id: &str) {}
}

/// Checks out a fixed commit, optionally failing first.
pub struct FakeFetcher {
    commit: Mutex<String>,
    failures: Mutex<VecDeque<RepoError>>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new(commit: &str) -> Self {
        Self {
            commit: Mutex::new(commit.to_string()),
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_commit(&self, commit: &str) {
        *self.commit.lock().expect("commit") = commit.to_string();
    }

    pub fn fail_with(&self, error: RepoError) {
        self.failures.lock().expect("failures").push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, host: &dyn Host, request: &FetchRequest) -> Result<FetchedSource, RepoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().expect("failures").pop_front() {
            return Err(error);
        }
        host.create_dir_all(&request.checkout_dir).await?;
        Ok(FetchedSource {
            commit_hash: request
                .target_commit
                .clone()
                .unwrap_or_else(|| self.commit.lock().expect("commit").clone()),
        })
    }
}

/// Answers probes from a script, then with `fallback`.
pub struct ScriptedProber {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    targets: Mutex<Vec<String>>,
}

impl ScriptedProber {
    pub fn always(ok: bool) -> Self {
        Self::scripted(&[], ok)
    }

    pub fn scripted(script: &[bool], fallback: bool) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
            fallback,
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().expect("targets").clone()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, _kind: HealthcheckKind, target: &str, _timeout: Duration) -> ProbeOutcome {
        self.targets.lock().expect("targets").push(target.to_string());
        let ok = self
            .script
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or(self.fallback);
        ProbeOutcome {
            ok,
            latency_ms: 1,
            detail: if ok { "ok".to_string() } else { "connection refused".to_string() },
        }
    }
}
