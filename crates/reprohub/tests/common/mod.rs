//! Shared fixtures for session lifecycle tests.
//!
//! Wires the real registry, workspace manager, materializer and GitHub
//! client together. Only the container engine, git and chown are faked,
//! and GitHub is a local axum server.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::extract::Path as UrlPath;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;

use reprohub::artifacts::FileArtifactRegistry;
use reprohub::auth::{AccessToken, GitHubMembershipClient, OrgMembershipAuthorizer};
use reprohub::config::HubConfig;
use reprohub::container::{ContainerConfig, ContainerResult, ContainerRuntimeApi};
use reprohub::materializer::{ArtifactMaterializer, MaterializeError, RepositoryFetcher};
use reprohub::session::{FormOptionsParser, SessionController, SpawnRequest, UserIdentity, form_from_pairs};
use reprohub::workspace::{Ownership, OwnershipFixer, WorkspaceManager, WorkspaceResult};

pub const TOKEN: &str = "gho_valid";

pub const REGISTRY: &str = r#"{
    "demo": {"url": "https://github.com/diverse-project/repo.git", "file": "index.ipynb"},
    "plain": "https://github.com/diverse-project/plain"
}"#;

/// Answers `GET /orgs/{org}/members/{user}` like GitHub does for a token
/// that can see private memberships.
async fn membership(
    UrlPath((org, user)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> axum::response::Response {
    let expected = format!("Bearer {TOKEN}");
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match (org.as_str(), user.as_str()) {
        ("diverse-project", "alice") => StatusCode::NO_CONTENT.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn spawn_fake_github() -> String {
    let app = Router::new().route("/orgs/{org}/members/{user}", get(membership));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Records every launch; containers are never actually started.
#[derive(Default)]
pub struct RecordingRuntime {
    pub created: Mutex<Vec<ContainerConfig>>,
    pub stopped: Mutex<Vec<String>>,
    pub execs: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ContainerRuntimeApi for RecordingRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let mut created = self.created.lock().unwrap();
        created.push(config.clone());
        Ok(format!("container-{}", created.len()))
    }

    async fn stop_container(&self, container_id: &str, _timeout: Option<u32>) -> ContainerResult<()> {
        self.stopped.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn remove_container(&self, _container_id: &str, _force: bool) -> ContainerResult<()> {
        Ok(())
    }

    async fn container_state_status(&self, _id_or_name: &str) -> ContainerResult<Option<String>> {
        Ok(None)
    }

    async fn container_label(
        &self,
        id_or_name: &str,
        key: &str,
    ) -> ContainerResult<Option<String>> {
        let created = self.created.lock().unwrap();
        Ok(created
            .iter()
            .rev()
            .find(|c| c.name.as_deref() == Some(id_or_name))
            .and_then(|c| c.labels.get(key).cloned()))
    }

    async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> ContainerResult<()> {
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
        Ok(String::new())
    }
}

/// Produces a checkout with a README and a nested submodule directory.
#[derive(Default)]
pub struct FakeGit {
    pub clones: Mutex<Vec<(String, PathBuf)>>,
}

#[async_trait]
impl RepositoryFetcher for FakeGit {
    async fn clone_recursive(&self, url: &str, dest: &Path) -> Result<(), MaterializeError> {
        self.clones
            .lock()
            .unwrap()
            .push((url.to_string(), dest.to_path_buf()));
        std::fs::create_dir_all(dest.join("vendor/submodule")).unwrap();
        std::fs::write(dest.join("README.md"), "# demo\n").unwrap();
        Ok(())
    }
}

#[derive(Default)]
pub struct OwnershipLog {
    pub calls: Mutex<Vec<(PathBuf, Ownership)>>,
}

#[async_trait]
impl OwnershipFixer for OwnershipLog {
    async fn chown_recursive(&self, path: &Path, owner: Ownership) -> WorkspaceResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), owner));
        Ok(())
    }
}

pub struct Hub {
    pub dir: tempfile::TempDir,
    pub notebooks: PathBuf,
    pub runtime: Arc<RecordingRuntime>,
    pub git: Arc<FakeGit>,
    pub ownership: Arc<OwnershipLog>,
    pub controller: SessionController,
}

pub async fn hub() -> Hub {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("artifacts.json");
    std::fs::write(&registry_path, REGISTRY).unwrap();

    let mut config = HubConfig::default();
    config.workspace.local_root = dir.path().join("notebooks");
    config.auth.api_url = spawn_fake_github().await;
    config.auth.admin_organizations = vec![
        "diverse-team".to_string(),
        "diverse-project".to_string(),
    ];

    let runtime = Arc::new(RecordingRuntime::default());
    let git = Arc::new(FakeGit::default());
    let ownership = Arc::new(OwnershipLog::default());

    let workspaces = Arc::new(WorkspaceManager::new(&config.workspace, ownership.clone()));
    let materializer = Arc::new(ArtifactMaterializer::new(
        Arc::new(FileArtifactRegistry::new(registry_path)),
        workspaces.clone(),
        git.clone(),
    ));
    let github = GitHubMembershipClient::new(&config.auth).unwrap();
    let authorizer = OrgMembershipAuthorizer::new(
        Arc::new(github),
        config.auth.admin_organizations.clone(),
    );

    let controller = SessionController::new(
        &config,
        Arc::new(authorizer),
        Arc::new(FormOptionsParser),
        workspaces,
        materializer,
        runtime.clone(),
    );

    Hub {
        notebooks: dir.path().join("notebooks"),
        dir,
        runtime,
        git,
        ownership,
        controller,
    }
}

/// A second controller over the same workspace, registry and engine, as a
/// separate CLI invocation would build it.
pub fn fresh_controller(hub: &Hub) -> SessionController {
    let mut config = HubConfig::default();
    config.workspace.local_root = hub.notebooks.clone();
    config.auth.api_url = "http://127.0.0.1:9".to_string();

    let workspaces = Arc::new(WorkspaceManager::new(&config.workspace, hub.ownership.clone()));
    let materializer = Arc::new(ArtifactMaterializer::new(
        Arc::new(FileArtifactRegistry::new(hub.dir.path().join("artifacts.json"))),
        workspaces.clone(),
        hub.git.clone(),
    ));
    let github = GitHubMembershipClient::new(&config.auth).unwrap();
    let authorizer = OrgMembershipAuthorizer::new(Arc::new(github), Vec::new());

    SessionController::new(
        &config,
        Arc::new(authorizer),
        Arc::new(FormOptionsParser),
        workspaces,
        materializer,
        hub.runtime.clone(),
    )
}

pub fn user(login: &str) -> UserIdentity {
    UserIdentity::new(login, login)
}

pub fn spawn_request(login: &str, pairs: &[(&str, &str)]) -> SpawnRequest {
    SpawnRequest {
        identity: user(login),
        token: AccessToken::new(TOKEN),
        form: form_from_pairs(pairs.iter().copied()),
    }
}
