use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};

use reprohub::artifacts::{ArtifactRegistry, FileArtifactRegistry};
use reprohub::auth::{AccessToken, Authorizer, GitHubMembershipClient, OrgMembershipAuthorizer};
use reprohub::config::{
    ArtifactsConfig, AuthConfig, ContainerSettings, GitConfig, HubConfig, SessionsConfig,
    WorkspaceConfig,
};
use reprohub::container::{ContainerRuntime, RuntimeType};
use reprohub::materializer::{ArtifactMaterializer, GitCli};
use reprohub::session::{
    FormData, FormOptionsParser, SessionController, SpawnRequest, UserIdentity,
};
use reprohub::workspace::{ChownCommand, WorkspaceManager};

const APP_NAME: &str = "reprohub";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Spawn(cmd) => handle_spawn(&ctx, cmd).await,
        Command::Stop(cmd) => handle_stop(&ctx, cmd).await,
        Command::Authorize(cmd) => handle_authorize(&ctx, cmd).await,
        Command::Artifacts { command } => handle_artifacts(&ctx, command).await,
        Command::Workspace { command } => handle_workspace(&ctx, command).await,
        _ => Err(anyhow!("command does not need the async runtime")),
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        command => async_main(ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "ReproHub - per-user artifact sessions with organization-based admin rights.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a session for a user
    Spawn(SpawnCommand),
    /// Stop a user's session and reclaim the artifact workspace
    Stop(StopCommand),
    /// Show the privileges a user would get
    Authorize(AuthorizeCommand),
    /// Inspect the artifact registry
    Artifacts {
        #[command(subcommand)]
        command: ArtifactsCommand,
    },
    /// Manage user workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
    /// Create the config file
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct UserArgs {
    /// Login name at the identity provider
    #[arg(long = "user", value_name = "LOGIN")]
    login: String,
    /// Filesystem-safe user name (defaults to the login)
    #[arg(long, value_name = "NAME")]
    escaped_name: Option<String>,
}

impl UserArgs {
    fn identity(&self) -> UserIdentity {
        let escaped = self
            .escaped_name
            .clone()
            .unwrap_or_else(|| self.login.clone());
        UserIdentity::new(self.login.clone(), escaped)
    }
}

#[derive(Debug, Clone, Args)]
struct TokenArgs {
    /// Access token from the identity-provider login
    #[arg(long, env = "REPROHUB_ACCESS_TOKEN", hide_env_values = true)]
    token: String,
}

#[derive(Debug, Clone, Args)]
struct SpawnCommand {
    #[command(flatten)]
    user: UserArgs,
    #[command(flatten)]
    token: TokenArgs,
    /// Spawn option as KEY=VALUE (repeatable, e.g. -o artifact=demo -o lab=0)
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    options: Vec<(String, String)>,
    /// Stay attached, stop idle sessions and stop the session on Ctrl-C
    #[arg(long)]
    attach: bool,
}

#[derive(Debug, Clone, Args)]
struct StopCommand {
    #[command(flatten)]
    user: UserArgs,
    /// Artifact whose workspace should be reclaimed
    #[arg(long)]
    artifact: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct AuthorizeCommand {
    #[command(flatten)]
    user: UserArgs,
    #[command(flatten)]
    token: TokenArgs,
}

#[derive(Debug, Subcommand)]
enum ArtifactsCommand {
    /// List all registered artifacts
    List,
    /// Show one artifact
    Show { id: String },
}

#[derive(Debug, Subcommand)]
enum WorkspaceCommand {
    /// Create a user's workspace root and fix its ownership
    Ensure {
        #[command(flatten)]
        user: UserArgs,
    },
    /// Remove one artifact's subtree from a user's workspace
    Reclaim {
        #[command(flatten)]
        user: UserArgs,
        #[arg(long)]
        artifact: String,
    },
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            return Ok(());
        }

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::TRACE
        } else if self.common.debug {
            LevelFilter::DEBUG
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::INFO),
                1 => LevelFilter::DEBUG,
                _ => LevelFilter::TRACE,
            }
        }
    }

    /// Print a value as JSON/YAML when requested, otherwise as `human`.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            human()
        };
        println!("{output}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: {}", self.config_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    workspace: WorkspaceConfig,
    artifacts: ArtifactsConfig,
    auth: AuthConfig,
    git: GitConfig,
    container: ContainerSettings,
    sessions: SessionsConfig,
}

impl AppConfig {
    fn hub(&self) -> HubConfig {
        HubConfig {
            workspace: self.workspace.clone(),
            artifacts: self.artifacts.clone(),
            auth: self.auth.clone(),
            git: self.git.clone(),
            container: self.container.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Fully wired session components.
struct Hub {
    config: HubConfig,
    registry: Arc<FileArtifactRegistry>,
    workspaces: Arc<WorkspaceManager>,
    chown: ChownCommand,
    controller: Arc<SessionController>,
}

fn build_authorizer(config: &HubConfig) -> Result<OrgMembershipAuthorizer> {
    let github =
        GitHubMembershipClient::new(&config.auth).context("creating GitHub membership client")?;
    Ok(OrgMembershipAuthorizer::new(
        Arc::new(github),
        config.auth.admin_organizations.clone(),
    ))
}

fn build_runtime(settings: &ContainerSettings) -> ContainerRuntime {
    match (settings.runtime, settings.binary.as_ref()) {
        (Some(runtime_type), Some(binary)) => ContainerRuntime::with_binary(runtime_type, binary),
        (Some(runtime_type), None) => ContainerRuntime::with_type(runtime_type),
        (None, Some(binary)) => ContainerRuntime::with_binary(RuntimeType::default(), binary),
        (None, None) => ContainerRuntime::new(),
    }
}

fn build_hub(config: HubConfig) -> Result<Hub> {
    let chown = ChownCommand::from_config(&config.workspace);
    let registry = Arc::new(FileArtifactRegistry::new(
        config.artifacts.registry_path.clone(),
    ));
    let workspaces = Arc::new(WorkspaceManager::new(
        &config.workspace,
        Arc::new(chown.clone()),
    ));
    let materializer = Arc::new(ArtifactMaterializer::new(
        registry.clone(),
        workspaces.clone(),
        Arc::new(GitCli::from_config(&config.git)),
    ));
    let runtime = build_runtime(&config.container);
    info!("Using container runtime: {}", runtime.runtime_type());

    let controller = Arc::new(SessionController::new(
        &config,
        Arc::new(build_authorizer(&config)?),
        Arc::new(FormOptionsParser),
        workspaces.clone(),
        materializer,
        Arc::new(runtime),
    ));

    Ok(Hub {
        config,
        registry,
        workspaces,
        chown,
        controller,
    })
}

impl Hub {
    fn warn_on_missing_privileges(&self) {
        if let Err(e) = self.chown.check_privileges(self.workspaces.owner()) {
            warn!("{e}");
        }
    }
}

async fn handle_spawn(ctx: &RuntimeContext, cmd: SpawnCommand) -> Result<()> {
    let hub = build_hub(ctx.config.hub())?;
    let identity = cmd.user.identity();

    if ctx.common.dry_run {
        info!("dry-run: would start a session for {}", identity.login);
        return Ok(());
    }
    hub.warn_on_missing_privileges();

    let mut form = FormData::new();
    for (key, value) in cmd.options {
        form.entry(key).or_default().push(value);
    }

    let session = hub
        .controller
        .start_session(SpawnRequest {
            identity: identity.clone(),
            token: AccessToken::new(cmd.token.token),
            form,
        })
        .await
        .map_err(|e| {
            error!("{e}");
            anyhow!("{}", e.user_message())
        })?;

    ctx.emit(&session, || {
        format!(
            "Session {} running in container {} (workdir {}, admin: {})",
            session.id,
            session.container_name,
            session.workdir,
            session.is_admin()
        )
    })?;

    if !cmd.attach {
        return Ok(());
    }

    let sessions = &hub.config.sessions;
    let cleanup = hub
        .controller
        .clone()
        .start_idle_cleanup_task(sessions.idle_check_interval(), sessions.idle_timeout());

    info!("Attached; press Ctrl-C to stop the session");
    let mut poll = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                let outcome = hub
                    .controller
                    .stop_session(&identity, None)
                    .await
                    .map_err(|e| anyhow!("{}", e.user_message()))?;
                debug!("stop outcome: {:?}", outcome);
                break;
            }
            _ = poll.tick() => {
                if hub.controller.get_session(&identity).is_none() {
                    info!("Session of {} ended", identity.login);
                    break;
                }
            }
        }
    }

    cleanup.abort();
    Ok(())
}

async fn handle_stop(ctx: &RuntimeContext, cmd: StopCommand) -> Result<()> {
    let hub = build_hub(ctx.config.hub())?;
    let identity = cmd.user.identity();

    if ctx.common.dry_run {
        info!(
            "dry-run: would stop {} and reclaim {:?}",
            hub.controller.container_name(&identity),
            cmd.artifact
        );
        return Ok(());
    }

    let outcome = hub
        .controller
        .stop_session(&identity, cmd.artifact.as_deref())
        .await
        .map_err(|e| {
            error!("{e}");
            anyhow!("{}", e.user_message())
        })?;
    ctx.emit(&outcome, || {
        format!(
            "Stopped session of {} (container stopped: {}, workspace reclaimed: {})",
            identity.login, outcome.container_stopped, outcome.reclaimed
        )
    })
}

async fn handle_authorize(ctx: &RuntimeContext, cmd: AuthorizeCommand) -> Result<()> {
    let config = ctx.config.hub();
    let authorizer = build_authorizer(&config)?;
    let identity = cmd.user.identity();

    let result = authorizer
        .authorize(&identity, &AccessToken::new(cmd.token.token))
        .await
        .context("checking organization membership")?;

    ctx.emit(&result, || {
        format!("{}: admin = {}", identity.login, result.is_admin)
    })
}

async fn handle_artifacts(ctx: &RuntimeContext, command: ArtifactsCommand) -> Result<()> {
    let registry = FileArtifactRegistry::new(ctx.config.artifacts.registry_path.clone());

    match command {
        ArtifactsCommand::List => {
            let records = registry.list().await?;
            ctx.emit(&records, || {
                records
                    .iter()
                    .map(|r| match r.file {
                        Some(ref file) => format!("{}\t{}\t{}", r.id, r.url, file),
                        None => format!("{}\t{}", r.id, r.url),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        ArtifactsCommand::Show { id } => {
            let record = registry.resolve(&id).await?;
            ctx.emit(&record, || format!("{:#?}", record))
        }
    }
}

async fn handle_workspace(ctx: &RuntimeContext, command: WorkspaceCommand) -> Result<()> {
    let hub = build_hub(ctx.config.hub())?;

    match command {
        WorkspaceCommand::Ensure { user } => {
            let identity = user.identity();
            if ctx.common.dry_run {
                info!(
                    "dry-run: would ensure {}",
                    hub.workspaces.root_for(&identity)?.display()
                );
                return Ok(());
            }
            hub.warn_on_missing_privileges();
            let root = hub.workspaces.ensure_root(&identity).await?;
            println!("{}", root.display());
            Ok(())
        }
        WorkspaceCommand::Reclaim { user, artifact } => {
            let identity = user.identity();
            if ctx.common.dry_run {
                info!(
                    "dry-run: would remove {}",
                    hub.workspaces.artifact_dir(&identity, &artifact)?.display()
                );
                return Ok(());
            }
            let removed = hub.workspaces.reclaim(&identity, &artifact).await?;
            if removed {
                println!("removed {artifact} for {}", identity.login);
            } else {
                println!("nothing to remove");
            }
            Ok(())
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.emit(&ctx.config, || format!("{:#?}", ctx.config)),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix.as_str())
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("auth.admin_organizations")
                .with_list_parse_key("container.command"),
        )
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    config.workspace.local_root = expand_path(config.workspace.local_root)?;
    if let Some(host_root) = config.workspace.host_root.take() {
        config.workspace.host_root = Some(expand_path(host_root)?);
    }
    config.artifacts.registry_path = expand_path(config.artifacts.registry_path)?;

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Environment overrides: REPROHUB_<SECTION>__<KEY>, e.g. REPROHUB_AUTH__ADMIN_ORGANIZATIONS=org-a,org-b\n");
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
