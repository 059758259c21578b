//! Session lifecycle controller.
//!
//! Drives one session through `Requested -> Authorizing -> Provisioning ->
//! Running` on start and `Running -> Stopping -> Reclaimed` on stop. Any
//! failure before the container exists ends in `Aborted` with no container
//! created.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{SpawnError, SpawnResult};
use super::models::{Interface, Session, SessionOptions, SessionState, UserIdentity};
use super::options::{FormData, SessionOptionsParser};
use crate::auth::{AccessToken, AuthResult, Authorizer};
use crate::config::{ContainerSettings, HubConfig};
use crate::container::{ContainerConfig, ContainerRuntimeApi, PullPolicy};
use crate::materializer::{ArtifactMaterializer, Materialized};
use crate::workspace::WorkspaceManager;

/// Environment variable selecting the single-user application class.
pub const SINGLEUSER_APP_ENV: &str = "JUPYTERHUB_SINGLEUSER_APP";

/// Container label naming the session's user.
pub const USER_LABEL: &str = "reprohub.user";
/// Container label naming the session's artifact.
pub const ARTIFACT_LABEL: &str = "reprohub.artifact";

/// A session start request from the front-end.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub identity: UserIdentity,
    pub token: AccessToken,
    pub form: FormData,
}

/// What a stop request did.
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    /// The tracked session, if this controller started it.
    pub session: Option<Session>,
    pub container_stopped: bool,
    /// Whether an artifact subtree was removed.
    pub reclaimed: bool,
}

/// Everything decided during provisioning, before the container starts.
struct Prepared {
    options: SessionOptions,
    auth: AuthResult,
    materialized: Materialized,
}

/// Releases a user's start or stop reservation when dropped.
struct Reservation<'a> {
    in_flight: &'a DashMap<String, ()>,
    key: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Coordinates authorization, provisioning and the container for each user.
pub struct SessionController {
    container: ContainerSettings,
    host_root: PathBuf,
    authorizer: Arc<dyn Authorizer>,
    options_parser: Arc<dyn SessionOptionsParser>,
    workspaces: Arc<WorkspaceManager>,
    materializer: Arc<ArtifactMaterializer>,
    runtime: Arc<dyn ContainerRuntimeApi>,
    /// Running sessions by escaped user name.
    sessions: DashMap<String, Session>,
    /// Shell command reporting the last activity inside a session.
    activity_command: Option<String>,
    /// Users with a start or stop in flight.
    in_flight: DashMap<String, ()>,
}

impl SessionController {
    pub fn new(
        config: &HubConfig,
        authorizer: Arc<dyn Authorizer>,
        options_parser: Arc<dyn SessionOptionsParser>,
        workspaces: Arc<WorkspaceManager>,
        materializer: Arc<ArtifactMaterializer>,
        runtime: Arc<dyn ContainerRuntimeApi>,
    ) -> Self {
        Self {
            container: config.container.clone(),
            host_root: config.workspace.host_root().clone(),
            authorizer,
            options_parser,
            workspaces,
            materializer,
            runtime,
            activity_command: config.sessions.activity_command.clone(),
            sessions: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Deterministic container name for a user.
    pub fn container_name(&self, identity: &UserIdentity) -> String {
        format!("{}{}", self.container.name_prefix, identity.escaped_name)
    }

    /// Start a session for the user.
    pub async fn start_session(&self, request: SpawnRequest) -> SpawnResult<Session> {
        let SpawnRequest {
            identity,
            token,
            form,
        } = request;

        let _reservation = self.reserve(&identity)?;
        let container_name = self.container_name(&identity);
        self.ensure_no_running_container(&identity, &container_name)
            .await?;

        let mut state = SessionState::Requested;
        advance(&identity, &mut state, SessionState::Authorizing);

        let Prepared {
            options,
            auth,
            materialized,
        } = self
            .prepare(&identity, &token, &form, &mut state)
            .await
            .map_err(|e| abort(&identity, &mut state, e))?;

        let (config, workdir, startup_args) = self
            .launch_config(&identity, &options, &materialized, &container_name)
            .map_err(|e| abort(&identity, &mut state, e))?;
        let container_id = self
            .launch(&config)
            .await
            .map_err(|e| abort(&identity, &mut state, e))?;
        advance(&identity, &mut state, SessionState::Running);

        self.run_post_start(&container_id, &workdir).await;

        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            identity: identity.clone(),
            options,
            auth,
            state,
            container_id,
            container_name,
            mount_path: mount_source(&config),
            workdir,
            startup_args,
            created_at: now,
            last_activity_at: now,
        };

        info!(
            "Session {} running for {} (artifact: {}, interface: {}, admin: {})",
            session.id,
            identity.login,
            materialized.artifact.id,
            session.options.interface,
            auth.is_admin
        );
        self.sessions
            .insert(identity.escaped_name.clone(), session.clone());
        Ok(session)
    }

    fn reserve(&self, identity: &UserIdentity) -> SpawnResult<Reservation<'_>> {
        if self.sessions.contains_key(&identity.escaped_name) {
            return Err(SpawnError::AlreadyRunning(identity.login.clone()));
        }
        self.reserve_slot(identity)
    }

    /// Starts and stops of one user exclude each other.
    fn reserve_slot(&self, identity: &UserIdentity) -> SpawnResult<Reservation<'_>> {
        let key = identity.escaped_name.clone();
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => Err(SpawnError::InProgress(identity.login.clone())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Reservation {
                    in_flight: &self.in_flight,
                    key,
                })
            }
        }
    }

    /// Refuse to start while the user's container runs; clear a stopped one
    /// that would block the name.
    async fn ensure_no_running_container(
        &self,
        identity: &UserIdentity,
        container_name: &str,
    ) -> SpawnResult<()> {
        match self.runtime.container_state_status(container_name).await? {
            Some(status) if status == "running" => {
                Err(SpawnError::AlreadyRunning(identity.login.clone()))
            }
            Some(status) => {
                debug!(
                    "Removing leftover container {} (status: {})",
                    container_name, status
                );
                if let Err(e) = self.runtime.remove_container(container_name, true).await {
                    warn!(
                        "Failed to remove leftover container {}: {:?}",
                        container_name, e
                    );
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Authorizing and Provisioning phases.
    async fn prepare(
        &self,
        identity: &UserIdentity,
        token: &AccessToken,
        form: &FormData,
        state: &mut SessionState,
    ) -> SpawnResult<Prepared> {
        let options = self.options_parser.parse(form)?;
        let auth = self.authorizer.authorize(identity, token).await?;

        advance(identity, state, SessionState::Provisioning);
        self.workspaces.ensure_root(identity).await?;

        let artifact = options
            .artifact
            .as_deref()
            .ok_or(SpawnError::MissingArtifact)?;
        let materialized = self.materializer.materialize(identity, artifact).await?;

        Ok(Prepared {
            options,
            auth,
            materialized,
        })
    }

    /// Container config, working directory and startup arguments.
    fn launch_config(
        &self,
        identity: &UserIdentity,
        options: &SessionOptions,
        materialized: &Materialized,
        container_name: &str,
    ) -> SpawnResult<(ContainerConfig, String, Vec<String>)> {
        let settings = &self.container;
        let mount_point = settings.mount_point.trim_end_matches('/');
        let workdir = format!("{}/{}", mount_point, materialized.subpath);
        let host_dir = self.host_root.join(self.workspaces.dir_name(identity)?);

        let mut startup_args = vec![format!("--notebook-dir={}", workdir)];
        let mut config = ContainerConfig::new(settings.image.clone())
            .name(container_name)
            .volume(host_dir.to_string_lossy(), settings.mount_point.clone())
            .workdir(workdir.clone())
            .remove_on_stop(settings.remove)
            .label(USER_LABEL, identity.escaped_name.clone())
            .label(ARTIFACT_LABEL, materialized.artifact.id.clone());

        if let Some(ref network) = settings.network {
            config = config.network(network.clone());
        }

        if options.interface == Interface::Classic {
            config = config.env(SINGLEUSER_APP_ENV, settings.classic_app.clone());
            if let Some(file) = materialized.entry_file() {
                startup_args.push(format!(
                    "--NotebookApp.default_url={}/{}",
                    settings.classic_url_prefix.trim_end_matches('/'),
                    encode_url_path(file)
                ));
            }
        }

        let config = config
            .args(settings.command.iter().cloned())
            .args(startup_args.iter().cloned());
        Ok((config, workdir, startup_args))
    }

    /// Apply the pull policy and start the container.
    async fn launch(&self, config: &ContainerConfig) -> SpawnResult<String> {
        config.validate()?;

        match self.container.pull_policy {
            PullPolicy::Always => self.runtime.pull_image(&config.image).await?,
            PullPolicy::IfNotPresent => {
                if !self.runtime.image_exists(&config.image).await? {
                    self.runtime.pull_image(&config.image).await?;
                }
            }
            PullPolicy::Never => {}
        }

        Ok(self.runtime.create_container(config).await?)
    }

    /// Run the configured post-start command. Failures are only logged.
    async fn run_post_start(&self, container_id: &str, workdir: &str) {
        let Some(ref command) = self.container.post_start_command else {
            return;
        };

        match self
            .runtime
            .exec_output(container_id, Some(workdir), &["sh", "-c", command.as_str()])
            .await
        {
            Ok(_) => debug!("Post-start command finished in {}", container_id),
            Err(e) => warn!("Post-start command failed in {}: {:?}", container_id, e),
        }
    }

    /// Stop the user's container and reclaim the artifact's workspace.
    ///
    /// `artifact` overrides the artifact recorded for a tracked session. A
    /// session started by another process is found by its container name
    /// and its artifact is read from the container's label. Neither a failed
    /// container stop nor a failed reclaim blocks the stop. Fails only while
    /// a start or stop for the same user is still running.
    pub async fn stop_session(
        &self,
        identity: &UserIdentity,
        artifact: Option<&str>,
    ) -> SpawnResult<StopOutcome> {
        let _reservation = self.reserve_slot(identity)?;
        let mut session = self
            .sessions
            .remove(&identity.escaped_name)
            .map(|(_, session)| session);

        let target = session
            .as_ref()
            .map(|s| s.container_id.clone())
            .unwrap_or_else(|| self.container_name(identity));
        let mut artifact = artifact
            .map(str::to_string)
            .or_else(|| session.as_ref().and_then(|s| s.options.artifact.clone()));
        if artifact.is_none() {
            artifact = self.labelled_artifact(&target).await;
        }

        let mut state = SessionState::Running;
        advance(identity, &mut state, SessionState::Stopping);

        let container_stopped = match self
            .runtime
            .stop_container(&target, Some(self.container.stop_timeout_seconds))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to stop container {}: {:?}", target, e);
                false
            }
        };

        let reclaimed = match artifact {
            Some(ref artifact) => match self.workspaces.reclaim(identity, artifact).await {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(
                        "Failed to reclaim workspace of {} for artifact {}: {}",
                        identity.login, artifact, e
                    );
                    false
                }
            },
            None => false,
        };

        advance(identity, &mut state, SessionState::Reclaimed);
        if let Some(ref mut session) = session {
            session.state = state;
        }
        info!("Session for {} stopped", identity.login);

        Ok(StopOutcome {
            session,
            container_stopped,
            reclaimed,
        })
    }

    /// Artifact recorded on the container at launch, if it still exists.
    async fn labelled_artifact(&self, container: &str) -> Option<String> {
        match self.runtime.container_label(container, ARTIFACT_LABEL).await {
            Ok(label) => label,
            Err(e) => {
                warn!("Failed to read artifact label of {}: {:?}", container, e);
                None
            }
        }
    }

    /// Record activity for the user's session. Returns false if none runs.
    pub fn touch_activity(&self, identity: &UserIdentity) -> bool {
        match self.sessions.get_mut(&identity.escaped_name) {
            Some(mut session) => {
                session.last_activity_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Pull the last activity reported inside each running container.
    ///
    /// Timestamps only ever move forward. Sessions whose report fails keep
    /// their previous timestamp.
    pub async fn refresh_activity(&self) {
        let Some(ref command) = self.activity_command else {
            return;
        };

        let targets: Vec<(String, String, String)> = self
            .sessions
            .iter()
            .map(|s| (s.key().clone(), s.container_id.clone(), s.workdir.clone()))
            .collect();

        for (key, container_id, workdir) in targets {
            let reported = match self
                .runtime
                .exec_output(
                    &container_id,
                    Some(workdir.as_str()),
                    &["sh", "-c", command.as_str()],
                )
                .await
            {
                Ok(stdout) => parse_activity(&stdout),
                Err(e) => {
                    debug!("Activity query failed in {}: {:?}", container_id, e);
                    None
                }
            };

            let Some(at) = reported else {
                continue;
            };
            if let Some(mut session) = self
                .sessions
                .get_mut(&key)
                .filter(|s| at > s.last_activity_at)
            {
                session.last_activity_at = at.min(Utc::now());
            }
        }
    }

    /// Stop sessions without activity for at least `idle_timeout`.
    ///
    /// Activity is refreshed from the containers first. Returns the number
    /// of sessions stopped.
    pub async fn stop_idle_sessions(&self, idle_timeout: Duration) -> usize {
        self.refresh_activity().await;

        let now = Utc::now();
        let idle: Vec<(UserIdentity, chrono::DateTime<Utc>)> = self
            .sessions
            .iter()
            .filter(|entry| {
                (now - entry.last_activity_at)
                    .to_std()
                    .is_ok_and(|idle_for| idle_for >= idle_timeout)
            })
            .map(|entry| (entry.identity.clone(), entry.last_activity_at))
            .collect();

        let mut stopped = 0;
        for (identity, last_activity_at) in idle {
            info!(
                "Stopping idle session of {} (last activity: {}, idle > {}s)",
                identity.login,
                last_activity_at,
                idle_timeout.as_secs()
            );
            match self.stop_session(&identity, None).await {
                Ok(_) => stopped += 1,
                Err(e) => warn!("Idle stop of {} skipped: {}", identity.login, e),
            }
        }

        if stopped > 0 {
            info!("Stopped {} idle session(s)", stopped);
        }

        stopped
    }

    /// Start a background task that periodically stops idle sessions.
    pub fn start_idle_cleanup_task(
        self: Arc<Self>,
        check_interval: Duration,
        idle_timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting idle session cleanup task (check every {}s, timeout {}s)",
            check_interval.as_secs(),
            idle_timeout.as_secs()
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);

            loop {
                interval.tick().await;
                self.stop_idle_sessions(idle_timeout).await;
            }
        })
    }

    /// Running sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn get_session(&self, identity: &UserIdentity) -> Option<Session> {
        self.sessions
            .get(&identity.escaped_name)
            .map(|s| s.clone())
    }
}

fn advance(identity: &UserIdentity, state: &mut SessionState, next: SessionState) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal session transition {} -> {}",
        state,
        next
    );
    debug!("Session of {}: {} -> {}", identity.login, state, next);
    *state = next;
}

/// Move to `Aborted` and hand the error back.
fn abort(identity: &UserIdentity, state: &mut SessionState, err: SpawnError) -> SpawnError {
    advance(identity, state, SessionState::Aborted);
    warn!("Session start for {} aborted: {}", identity.login, err);
    err
}

/// Percent-encode each segment of a relative path for use in a URL.
fn encode_url_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Last non-empty line of an activity report, as RFC 3339 or Unix seconds.
fn parse_activity(stdout: &str) -> Option<DateTime<Utc>> {
    let line = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())?;

    if let Ok(at) = DateTime::parse_from_rfc3339(line) {
        return Some(at.with_timezone(&Utc));
    }

    let seconds: f64 = line.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp(seconds.trunc() as i64, (seconds.fract() * 1e9) as u32)
}

fn mount_source(config: &ContainerConfig) -> String {
    config
        .volumes
        .first()
        .map(|(host, _)| host.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FileArtifactRegistry;
    use crate::auth::AuthError;
    use crate::container::{ContainerError, ContainerResult};
    use crate::materializer::{MaterializeError, RepositoryFetcher};
    use crate::session::options::{FormOptionsParser, form_from_pairs};
    use crate::workspace::tests::RecordingFixer;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRuntime {
        created: Mutex<Vec<ContainerConfig>>,
        pulled: Mutex<Vec<String>>,
        stopped: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
        execs: Mutex<Vec<Vec<String>>>,
        states: Mutex<std::collections::HashMap<String, String>>,
        /// Printed by every exec after the post-start command.
        exec_stdout: Mutex<String>,
        fail_create: bool,
        fail_stop: bool,
        fail_exec: bool,
    }

    #[async_trait]
    impl ContainerRuntimeApi for FakeRuntime {
        async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
            if self.fail_create {
                return Err(ContainerError::CommandFailed {
                    command: "run".to_string(),
                    message: "no space left on device".to_string(),
                });
            }
            self.created.lock().unwrap().push(config.clone());
            Ok(format!("cid-{}", self.created.lock().unwrap().len()))
        }

        async fn stop_container(
            &self,
            container_id: &str,
            _timeout_seconds: Option<u32>,
        ) -> ContainerResult<()> {
            self.stopped.lock().unwrap().push(container_id.to_string());
            if self.fail_stop {
                return Err(ContainerError::CommandFailed {
                    command: "stop".to_string(),
                    message: "no such container".to_string(),
                });
            }
            Ok(())
        }

        async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
            self.removed.lock().unwrap().push(container_id.to_string());
            Ok(())
        }

        async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
            Ok(self.states.lock().unwrap().get(id_or_name).cloned())
        }

        async fn container_label(
            &self,
            id_or_name: &str,
            key: &str,
        ) -> ContainerResult<Option<String>> {
            let created = self.created.lock().unwrap();
            Ok(created
                .iter()
                .enumerate()
                .find(|(i, c)| {
                    c.name.as_deref() == Some(id_or_name) || format!("cid-{}", i + 1) == id_or_name
                })
                .and_then(|(_, c)| c.labels.get(key).cloned()))
        }

        async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
            Ok(true)
        }

        async fn pull_image(&self, image: &str) -> ContainerResult<()> {
            self.pulled.lock().unwrap().push(image.to_string());
            Ok(())
        }

        async fn exec_output(
            &self,
            _container_id: &str,
            _workdir: Option<&str>,
            command: &[&str],
        ) -> ContainerResult<String> {
            self.execs
                .lock()
                .unwrap()
                .push(command.iter().map(|s| s.to_string()).collect());
            if self.fail_exec {
                return Err(ContainerError::CommandFailed {
                    command: "exec".to_string(),
                    message: "environment.yml not found".to_string(),
                });
            }
            Ok(self.exec_stdout.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct FakeFetcher {
        clones: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RepositoryFetcher for FakeFetcher {
        async fn clone_recursive(&self, url: &str, dest: &Path) -> Result<(), MaterializeError> {
            self.clones.lock().unwrap().push(url.to_string());
            std::fs::create_dir_all(dest).unwrap();
            Ok(())
        }
    }

    struct FakeAuthorizer {
        result: Result<bool, ()>,
        calls: Mutex<usize>,
    }

    impl FakeAuthorizer {
        fn admin(is_admin: bool) -> Self {
            Self {
                result: Ok(is_admin),
                calls: Mutex::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                result: Err(()),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Authorizer for FakeAuthorizer {
        async fn authorize(
            &self,
            _identity: &UserIdentity,
            _token: &AccessToken,
        ) -> Result<AuthResult, AuthError> {
            *self.calls.lock().unwrap() += 1;
            match self.result {
                Ok(is_admin) => Ok(AuthResult { is_admin }),
                Err(()) => Err(AuthError::UnexpectedStatus {
                    org: "diverse-team".to_string(),
                    status: 502,
                    message: "bad gateway".to_string(),
                }),
            }
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        runtime: Arc<FakeRuntime>,
        fetcher: Arc<FakeFetcher>,
        authorizer: Arc<FakeAuthorizer>,
        controller: SessionController,
    }

    const REGISTRY: &str = r#"{
        "demo": {"url": "https://example.com/org/repo.git", "file": "index.ipynb"},
        "plain": "https://example.com/org/plain.git"
    }"#;

    fn harness(runtime: FakeRuntime, authorizer: FakeAuthorizer) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("artifacts.json");
        std::fs::write(&registry_path, REGISTRY).unwrap();

        let mut config = HubConfig::default();
        config.workspace.local_root = dir.path().join("notebooks");
        config.workspace.host_root = Some(PathBuf::from("/srv/host/notebooks"));
        config.container.image = "jupyter/scipy-notebook:latest".to_string();
        config.container.network = Some("hub".to_string());

        let runtime = Arc::new(runtime);
        let fetcher = Arc::new(FakeFetcher::default());
        let authorizer = Arc::new(authorizer);
        let workspaces = Arc::new(WorkspaceManager::new(
            &config.workspace,
            Arc::new(RecordingFixer::default()),
        ));
        let materializer = Arc::new(ArtifactMaterializer::new(
            Arc::new(FileArtifactRegistry::new(registry_path)),
            workspaces.clone(),
            fetcher.clone(),
        ));
        let controller = SessionController::new(
            &config,
            authorizer.clone(),
            Arc::new(FormOptionsParser),
            workspaces,
            materializer,
            runtime.clone(),
        );

        Harness {
            dir,
            runtime,
            fetcher,
            authorizer,
            controller,
        }
    }

    fn request(pairs: &[(&str, &str)]) -> SpawnRequest {
        SpawnRequest {
            identity: UserIdentity::new("alice", "alice"),
            token: AccessToken::new("gho_token"),
            form: form_from_pairs(pairs.iter().copied()),
        }
    }

    fn alice() -> UserIdentity {
        UserIdentity::new("alice", "alice")
    }

    #[tokio::test]
    async fn lab_session_mounts_workspace_and_sets_workdir() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(true));

        let session = h
            .controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();

        assert_eq!(session.state, SessionState::Running);
        assert!(session.is_admin());
        assert_eq!(session.workdir, "/workspace/demo/repo");
        assert_eq!(session.mount_path, "/srv/host/notebooks/jupyterhub-user-alice");

        let created = h.runtime.created.lock().unwrap();
        let config = &created[0];
        assert_eq!(config.name.as_deref(), Some("reprohub-alice"));
        assert_eq!(config.network.as_deref(), Some("hub"));
        assert!(config.remove);
        assert_eq!(
            config.volumes,
            vec![(
                "/srv/host/notebooks/jupyterhub-user-alice".to_string(),
                "/workspace".to_string()
            )]
        );
        assert!(!config.env.contains_key(SINGLEUSER_APP_ENV));
        assert!(!config.command.iter().any(|a| a.contains("default_url")));
        assert_eq!(
            *h.runtime.pulled.lock().unwrap(),
            vec!["jupyter/scipy-notebook:latest".to_string()]
        );
        assert!(
            h.dir
                .path()
                .join("notebooks/jupyterhub-user-alice/demo/repo")
                .is_dir()
        );
    }

    #[tokio::test]
    async fn classic_interface_switches_entry_point_and_default_url() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));

        let session = h
            .controller
            .start_session(request(&[("artifact", "demo"), ("lab", "0")]))
            .await
            .unwrap();

        let created = h.runtime.created.lock().unwrap();
        assert_eq!(
            created[0].env.get(SINGLEUSER_APP_ENV).map(String::as_str),
            Some("notebook.notebookapp.NotebookApp")
        );
        assert!(
            created[0]
                .command
                .contains(&"--NotebookApp.default_url=/notebooks/index.ipynb".to_string())
        );
        assert_eq!(created[0].command[0], "start-singleuser.sh");
        assert!(
            session
                .startup_args
                .contains(&"--notebook-dir=/workspace/demo/repo".to_string())
        );
    }

    #[tokio::test]
    async fn classic_interface_without_entry_file_adds_no_default_url() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));

        h.controller
            .start_session(request(&[("artifact", "plain"), ("lab", "false")]))
            .await
            .unwrap();

        let created = h.runtime.created.lock().unwrap();
        assert!(created[0].env.contains_key(SINGLEUSER_APP_ENV));
        assert!(!created[0].command.iter().any(|a| a.contains("default_url")));
    }

    #[tokio::test]
    async fn missing_artifact_aborts_without_clone_or_container() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));

        let err = h
            .controller
            .start_session(request(&[("lab", "1")]))
            .await
            .unwrap_err();

        assert!(matches!(err, SpawnError::MissingArtifact));
        assert!(h.fetcher.clones.lock().unwrap().is_empty());
        assert!(h.runtime.created.lock().unwrap().is_empty());
        assert!(h.controller.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn authorization_failure_aborts_before_provisioning() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::failing());

        let err = h
            .controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap_err();

        assert!(matches!(err, SpawnError::AuthorizationFailure(_)));
        assert!(h.runtime.created.lock().unwrap().is_empty());
        assert!(!h.dir.path().join("notebooks").exists());
    }

    #[tokio::test]
    async fn authorization_runs_on_every_start() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(true));

        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();
        h.controller.stop_session(&alice(), None).await.unwrap();
        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();

        assert_eq!(*h.authorizer.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_artifact_is_reported_as_such() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));

        let err = h
            .controller
            .start_session(request(&[("artifact", "nope")]))
            .await
            .unwrap_err();

        assert!(matches!(err, SpawnError::UnknownArtifact(ref id) if id == "nope"));
        assert!(h.runtime.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn container_failure_aborts_and_allows_retry() {
        let runtime = FakeRuntime {
            fail_create: true,
            ..Default::default()
        };
        let h = harness(runtime, FakeAuthorizer::admin(false));

        let err = h
            .controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::Container(_)));
        assert!(h.controller.list_sessions().is_empty());

        // The reservation was released; the checkout is reused.
        let err = h
            .controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::Container(_)));
        assert_eq!(h.fetcher.clones.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_start_for_same_user_is_rejected() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));

        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();
        let err = h
            .controller
            .start_session(request(&[("artifact", "plain")]))
            .await
            .unwrap_err();

        assert!(matches!(err, SpawnError::AlreadyRunning(_)));
        assert_eq!(h.runtime.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn running_container_from_elsewhere_blocks_start() {
        let runtime = FakeRuntime::default();
        runtime
            .states
            .lock()
            .unwrap()
            .insert("reprohub-alice".to_string(), "running".to_string());
        let h = harness(runtime, FakeAuthorizer::admin(false));

        let err = h
            .controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn leftover_stopped_container_is_removed_before_start() {
        let runtime = FakeRuntime::default();
        runtime
            .states
            .lock()
            .unwrap()
            .insert("reprohub-alice".to_string(), "exited".to_string());
        let h = harness(runtime, FakeAuthorizer::admin(false));

        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();
        assert_eq!(
            *h.runtime.removed.lock().unwrap(),
            vec!["reprohub-alice".to_string()]
        );
    }

    #[tokio::test]
    async fn post_start_failure_does_not_fail_the_spawn() {
        let runtime = FakeRuntime {
            fail_exec: true,
            ..Default::default()
        };
        let h = harness(runtime, FakeAuthorizer::admin(false));

        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();

        let execs = h.runtime.execs.lock().unwrap();
        assert_eq!(execs.len(), 1);
        assert_eq!(
            execs[0],
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "conda env update --name base --file environment.yml".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn stop_reclaims_artifact_workspace_even_if_container_stop_fails() {
        let runtime = FakeRuntime {
            fail_stop: true,
            ..Default::default()
        };
        let h = harness(runtime, FakeAuthorizer::admin(false));
        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();
        let root = h.dir.path().join("notebooks/jupyterhub-user-alice");
        std::fs::create_dir_all(root.join("other/repo")).unwrap();

        let outcome = h.controller.stop_session(&alice(), None).await.unwrap();

        assert!(!outcome.container_stopped);
        assert!(outcome.reclaimed);
        assert_eq!(
            outcome.session.map(|s| s.state),
            Some(SessionState::Reclaimed)
        );
        assert!(!root.join("demo").exists());
        assert!(root.join("other/repo").exists());
        assert!(h.controller.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn stop_of_untracked_session_uses_container_name() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));

        let outcome = h
            .controller
            .stop_session(&alice(), Some("demo"))
            .await
            .unwrap();

        assert!(outcome.session.is_none());
        assert!(!outcome.reclaimed);
        assert_eq!(
            *h.runtime.stopped.lock().unwrap(),
            vec!["reprohub-alice".to_string()]
        );
    }

    #[tokio::test]
    async fn stop_from_another_process_reclaims_the_labelled_artifact() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));
        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();
        let root = h.dir.path().join("notebooks/jupyterhub-user-alice");
        assert!(root.join("demo/repo").is_dir());

        // A fresh controller knows nothing about the running session.
        h.controller.sessions.clear();
        let outcome = h.controller.stop_session(&alice(), None).await.unwrap();

        assert!(outcome.session.is_none());
        assert!(outcome.container_stopped);
        assert!(outcome.reclaimed);
        assert!(!root.join("demo").exists());
        assert_eq!(
            *h.runtime.stopped.lock().unwrap(),
            vec!["reprohub-alice".to_string()]
        );
    }

    #[tokio::test]
    async fn stop_is_refused_while_a_start_is_in_flight() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));
        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();
        let held = h.controller.reserve_slot(&alice()).unwrap();

        let err = h
            .controller
            .stop_session(&alice(), Some("demo"))
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::InProgress(_)));
        assert!(h.runtime.stopped.lock().unwrap().is_empty());
        assert!(
            h.dir
                .path()
                .join("notebooks/jupyterhub-user-alice/demo/repo")
                .is_dir()
        );
        assert!(h.controller.get_session(&alice()).is_some());

        drop(held);
        assert!(h.controller.stop_session(&alice(), None).await.unwrap().reclaimed);
    }

    #[tokio::test]
    async fn start_is_refused_while_a_stop_is_in_flight() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));
        let _held = h.controller.reserve_slot(&alice()).unwrap();

        let err = h
            .controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::InProgress(_)));
        assert!(h.fetcher.clones.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reported_activity_keeps_a_session_alive() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));
        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();
        let stale = Utc::now() - chrono::Duration::hours(2);
        h.controller
            .sessions
            .get_mut("alice")
            .unwrap()
            .last_activity_at = stale;
        let recent = Utc::now() - chrono::Duration::minutes(5);
        *h.runtime.exec_stdout.lock().unwrap() = format!("{}.25\n", recent.timestamp());

        assert_eq!(
            h.controller
                .stop_idle_sessions(Duration::from_secs(3600))
                .await,
            0
        );
        let session = h.controller.get_session(&alice()).unwrap();
        assert!(session.last_activity_at > stale);

        let execs = h.runtime.execs.lock().unwrap();
        assert_eq!(execs.len(), 2);
        assert!(execs[1][2].starts_with("find ."));
    }

    #[tokio::test]
    async fn older_activity_reports_do_not_rewind_the_clock() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));
        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();
        let before = h.controller.get_session(&alice()).unwrap().last_activity_at;
        *h.runtime.exec_stdout.lock().unwrap() = "2001-01-01T00:00:00Z\n".to_string();

        h.controller.refresh_activity().await;
        assert_eq!(
            h.controller.get_session(&alice()).unwrap().last_activity_at,
            before
        );
    }

    #[test]
    fn activity_reports_accept_rfc3339_and_unix_seconds() {
        let at = parse_activity("2024-05-01T12:00:00+02:00\n").unwrap();
        assert_eq!(at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(parse_activity("1714557600.5\n").unwrap().timestamp(), 1714557600);
        assert_eq!(parse_activity("noise\n1714557600\n\n").unwrap().timestamp(), 1714557600);
        assert!(parse_activity("").is_none());
        assert!(parse_activity("yesterday").is_none());
        assert!(parse_activity("-5").is_none());
    }

    #[test]
    fn entry_file_segments_are_percent_encoded() {
        assert_eq!(encode_url_path("index.ipynb"), "index.ipynb");
        assert_eq!(
            encode_url_path("notebooks/Analysis 1#draft.ipynb"),
            "notebooks/Analysis%201%23draft.ipynb"
        );
    }

    #[tokio::test]
    async fn idle_sessions_are_stopped_and_active_ones_kept() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));
        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();

        assert_eq!(
            h.controller
                .stop_idle_sessions(Duration::from_secs(3600))
                .await,
            0
        );

        h.controller
            .sessions
            .get_mut("alice")
            .unwrap()
            .last_activity_at = Utc::now() - chrono::Duration::hours(2);
        assert_eq!(
            h.controller
                .stop_idle_sessions(Duration::from_secs(3600))
                .await,
            1
        );
        assert!(h.controller.list_sessions().is_empty());
        assert!(!h.controller.touch_activity(&alice()));
    }

    #[tokio::test]
    async fn touch_activity_refreshes_timestamp() {
        let h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));
        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();
        let stale = Utc::now() - chrono::Duration::hours(2);
        h.controller
            .sessions
            .get_mut("alice")
            .unwrap()
            .last_activity_at = stale;

        assert!(h.controller.touch_activity(&alice()));
        let session = h.controller.get_session(&alice()).unwrap();
        assert!(session.last_activity_at > stale);
    }

    #[tokio::test]
    async fn if_not_present_skips_pull_for_local_images() {
        let mut h = harness(FakeRuntime::default(), FakeAuthorizer::admin(false));
        h.controller.container.pull_policy = PullPolicy::IfNotPresent;

        h.controller
            .start_session(request(&[("artifact", "demo")]))
            .await
            .unwrap();
        assert!(h.runtime.pulled.lock().unwrap().is_empty());
    }
}
