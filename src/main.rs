use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::LevelFilter;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod api;
mod container;
mod db;
mod sandbox;
mod session;
mod settings;

use api::{AppState, LogMenuSink};
use container::{ContainerRuntime, ContainerRuntimeApi};
use sandbox::local::{LocalBackend, LocalExecutorConfig};
use sandbox::manager::{ContainerManager, ContainerManagerConfig};
use sandbox::ports::PortAllocator;
use sandbox::proxy::{ChatProxy, ChatProxyConfig};
use sandbox::registry::{SandboxBackend, SessionRegistry};
use sandbox::supervisor::{self, SupervisorConfig};
use sandbox::workspace::WorkspaceProvisioner;
use sandbox::ChatBackend;
use session::SessionRepository;
use session::models::BackendKind;
use settings::Settings;

const APP_NAME: &str = "crucible";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.common)?;

    match cli.command {
        Command::Serve(cmd) => run_serve(cli.common, cmd),
        Command::Config { command } => handle_config(&cli.common, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[tokio::main]
async fn run_serve(common: CommonOpts, cmd: ServeCommand) -> Result<()> {
    handle_serve(common, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Crucible - sandboxed agent session executor.",
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
    /// Output machine readable JSON logs
    #[arg(long, global = true)]
    json: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Inspect configuration
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
struct ServeCommand {
    /// Override the host address to bind to
    #[arg(long)]
    host: Option<String>,
    /// Override the port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Override the container image
    #[arg(long)]
    image: Option<String>,
    /// Run without containers, spawning the agent in-process
    #[arg(long = "local-mode")]
    local_mode: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Validate the configuration and exit
    Check,
}

fn init_logging(common: &CommonOpts) -> Result<()> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    if common.quiet {
        log::set_max_level(LevelFilter::Off);
        return Ok(());
    }

    let level = if common.trace {
        "trace"
    } else if common.debug || common.verbose == 1 {
        "debug"
    } else if common.verbose >= 2 {
        "trace"
    } else {
        "info"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}")));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        let force_color = matches!(common.color, ColorOption::Always)
            || std::env::var_os("FORCE_COLOR").is_some();
        let disable_color = matches!(common.color, ColorOption::Never)
            || std::env::var_os("NO_COLOR").is_some()
            || (!force_color && !io::stderr().is_terminal());

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
            .try_init()
            .ok();
    }

    // Compatibility init for dependencies using the log facade
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init()
        .ok();

    Ok(())
}

fn load_settings(common: &CommonOpts) -> Result<Settings> {
    let path = common.config.as_deref();
    if let Some(path) = path {
        if !path.exists() {
            return Err(anyhow!("config file not found: {}", path.display()));
        }
    }
    Settings::load(path)
}

fn handle_config(common: &CommonOpts, command: ConfigCommand) -> Result<()> {
    let settings = load_settings(common)?;

    match command {
        ConfigCommand::Show => {
            if common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&settings).context("serializing config")?
                );
            } else {
                println!(
                    "{}",
                    serde_yaml::to_string(&settings).context("serializing config")?
                );
            }
        }
        ConfigCommand::Check => {
            settings.validate()?;
            println!("configuration ok");
        }
    }

    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

/// Refuse to operate when the workspace root is not writable.
fn ensure_workspace_root(settings: &Settings) -> Result<PathBuf> {
    let root = settings.workspace_root();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("creating workspace root {}", root.display()))?;

    let probe = root.join(".write-probe");
    std::fs::write(&probe, b"ok")
        .with_context(|| format!("workspace root {} is not writable", root.display()))?;
    let _ = std::fs::remove_file(&probe);

    Ok(root)
}

async fn handle_serve(common: CommonOpts, cmd: ServeCommand) -> Result<()> {
    let mut settings = load_settings(&common)?;

    // CLI overrides
    if let Some(host) = cmd.host {
        settings.server.host = host;
    }
    if let Some(port) = cmd.port {
        settings.server.port = port;
    }
    if let Some(image) = cmd.image {
        settings.container.image = image;
    }
    if cmd.local_mode {
        settings.backend.mode = BackendKind::Local;
    }

    info!("starting {APP_NAME} in {} mode", settings.backend.mode);

    let workspace_root = ensure_workspace_root(&settings)?;

    let database = db::Database::new(&settings.database_path()).await?;
    let repo = SessionRepository::new(database.pool().clone());
    let registry = Arc::new(SessionRegistry::new(repo));

    let workspaces = WorkspaceProvisioner::new(
        workspace_root,
        settings.template_dir(),
        settings.git.token.clone(),
    );

    let proxy_config = ChatProxyConfig {
        request_timeout: settings.request_timeout(),
        stream_timeout: settings.stream_timeout(),
    };

    let backend: Arc<dyn ChatBackend> = match settings.backend.mode {
        BackendKind::Sandbox => {
            let runtime = match (settings.container.runtime, &settings.container.binary) {
                (Some(rt), Some(binary)) => ContainerRuntime::with_binary(rt, binary.clone()),
                (Some(rt), None) => ContainerRuntime::with_type(rt),
                (None, _) => ContainerRuntime::new(),
            };

            match runtime.health_check().await {
                Ok(_) => info!("container runtime ({}) is available", runtime.runtime_type()),
                Err(e) => warn!(
                    "container runtime health check failed: {e:?}; container operations may fail"
                ),
            }

            // Images are pulled out-of-band; refuse to start without one
            match runtime.image_exists(&settings.container.image).await {
                Ok(true) => info!("container image '{}' found", settings.container.image),
                Ok(false) => {
                    error!(
                        "container image '{}' not found; pull or build it first",
                        settings.container.image
                    );
                    anyhow::bail!(
                        "required container image '{}' not found",
                        settings.container.image
                    );
                }
                Err(e) => warn!(
                    "could not check image '{}': {e:?}; container operations may fail",
                    settings.container.image
                ),
            }

            let host_loopback = settings.host_loopback()?;

            let allocator = Arc::new(PortAllocator::new(
                settings.ports.api_range,
                settings.ports.code_range,
            ));

            let manager = ContainerManager::new(
                Arc::new(runtime),
                allocator,
                ContainerManagerConfig {
                    image: settings.container.image.clone(),
                    mem_limit: settings.container.mem_limit.clone(),
                    cpu_limit: settings.container.cpu_limit,
                    host_loopback,
                    agent_api_key: settings.agent.api_key.clone(),
                    agent_base_url: settings.agent.base_url.clone(),
                    agent_model: settings.agent.model.clone(),
                    health_check_timeout: settings.health_check_timeout(),
                },
            );

            let backend = SandboxBackend::new(
                registry,
                workspaces,
                manager,
                ChatProxy::new(proxy_config),
                settings.lifecycle.turn_policy,
                settings.lifecycle.degraded_threshold,
            );

            let reaped = backend.startup_cleanup().await;
            if reaped > 0 {
                info!(reaped, "removed orphan containers from a previous run");
            }

            Arc::new(backend)
        }
        BackendKind::Local => {
            info!(
                "local mode: agent binary '{}', no container isolation",
                settings.agent.binary
            );
            Arc::new(LocalBackend::new(
                registry,
                workspaces,
                LocalExecutorConfig {
                    agent_binary: settings.agent.binary.clone(),
                    agent_model: settings.agent.model.clone(),
                    agent_api_key: settings.agent.api_key.clone(),
                    agent_base_url: settings.agent.base_url.clone(),
                    request_timeout: settings.request_timeout(),
                    stream_timeout: settings.stream_timeout(),
                },
                settings.lifecycle.turn_policy,
            ))
        }
    };

    let supervisor_handle = supervisor::start(
        backend.clone(),
        SupervisorConfig {
            idle_timeout: settings.idle_timeout(),
            sweep_interval: settings.sweep_interval(),
        },
    );

    let state = AppState::new(backend.clone(), Arc::new(LogMenuSink));
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("parsing bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    // Orderly teardown so ports and containers are released before exit
    supervisor_handle.abort();
    for record in backend.list_sessions().await {
        if let Err(e) = backend.close_session(&record.id, "shutdown").await {
            warn!(session_id = %record.id, error = %e, "failed to close session at shutdown");
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
