use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use parley::agent::{CliAgentBackend, CliAgentConfig};
use parley::api::{self, AppState};
use parley::client::{ChatClient, ChatSession};
use parley::config::{self, APP_NAME, AppConfig, AppPaths};
use parley::narration::{ActorCache, NarrationClient};
use parley::session::SessionRegistry;
use parley_protocol::{SessionSnapshot, actors_from_catalog};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => run_async(handle_serve(&ctx, cmd)),
        Command::Chat(cmd) => run_async(handle_chat(&ctx, cmd)),
        Command::Sessions { command } => run_async(handle_sessions(&ctx, command)),
        Command::Actors(cmd) => run_async(handle_actors(&ctx, cmd)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

fn run_async<F: Future<Output = Result<()>>>(future: F) -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?
        .block_on(future)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "parley - narrated multi-turn chat with a coding agent.",
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
    #[arg(short = 'y', long = "yes", global = true)]
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
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Chat with the agent interactively
    Chat(ChatCommand),
    /// Inspect sessions on a running server
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// List the narration voice actors
    Actors(ActorsCommand),
    /// Create config directories and default files
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
struct ServeCommand {
    /// Host address to bind to (defaults to server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (defaults to server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct ChatCommand {
    /// Server URL (defaults to client.server_url)
    #[arg(long, env = "PARLEY_SERVER_URL")]
    server: Option<String>,
    /// Continue an existing server session
    #[arg(long, value_name = "ID")]
    session: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SessionsCommand {
    /// List sessions
    List(ServerArg),
    /// Show one session's messages
    Show {
        id: String,
        #[command(flatten)]
        server: ServerArg,
    },
    /// Abort a session's in-flight stream
    Abort {
        id: String,
        #[command(flatten)]
        server: ServerArg,
    },
}

#[derive(Debug, Clone, Args)]
struct ServerArg {
    /// Server URL (defaults to client.server_url)
    #[arg(long, env = "PARLEY_SERVER_URL")]
    server: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ActorsCommand {
    /// Ignore the cached catalog
    #[arg(long)]
    refresh: bool,
    /// Server URL (defaults to client.server_url)
    #[arg(long, env = "PARLEY_SERVER_URL")]
    server: Option<String>,
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

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = config::load_or_init(&paths, common.dry_run)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = self.effective_log_level();
        let name = level.as_str().to_ascii_lowercase();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("parley={name},tower_http={name}")));

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

        // log-crate users fall back to env_logger when no tracing bridge took them
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(level);
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn server_url(&self, flag: Option<String>) -> String {
        flag.unwrap_or_else(|| self.config.client.server_url.clone())
    }

    fn print<T: Serialize>(&self, value: &T) -> Result<bool> {
        if self.common.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("serializing output to JSON")?
            );
        } else if self.common.yaml {
            println!(
                "{}",
                serde_yaml::to_string(value).context("serializing output to YAML")?
            );
        } else {
            return Ok(false);
        }
        Ok(true)
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let config = &ctx.config;
    let host = cmd.host.unwrap_or_else(|| config.server.host.clone());
    let port = cmd.port.unwrap_or(config.server.port);

    let backend = Arc::new(CliAgentBackend::new(CliAgentConfig::from(&config.agent)));
    let registry = Arc::new(SessionRegistry::new(backend));
    let narration =
        NarrationClient::upstream(&config.narration).context("building narration client")?;
    let state = AppState::new(Arc::clone(&registry), narration, config);
    let app = api::create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;
    info!(
        "Listening on http://{} (agent: {}, environment: {:?})",
        addr, config.agent.binary, config.server.environment
    );

    let stop_reaper = CancellationToken::new();
    let reaper = tokio::spawn(run_reaper(
        Arc::clone(&registry),
        config.sessions.placeholder_ttl(),
        config.sessions.reap_interval(),
        stop_reaper.clone(),
    ));

    let shutdown_registry = Arc::clone(&registry);
    let shutdown_signal = async move {
        wait_for_signal().await;
        info!("Shutdown signal received, cancelling in-flight streams...");
        let cancelled = shutdown_registry.shutdown();
        info!("Cancelled {} stream(s)", cancelled);
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server");

    stop_reaper.cancel();
    if let Err(e) = reaper.await {
        warn!("orphan reaper ended abnormally: {}", e);
    }
    info!("Shutdown complete");
    served
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Periodically drop placeholder sessions that never received an identity.
async fn run_reaper(
    registry: Arc<SessionRegistry>,
    ttl: Duration,
    every: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let reaped = registry.reap_orphans(ttl);
                if reaped > 0 {
                    info!("reaped {} orphaned session(s)", reaped);
                }
            }
        }
    }
}

async fn handle_chat(ctx: &RuntimeContext, cmd: ChatCommand) -> Result<()> {
    let mut config = ctx.config.clone();
    config.client.server_url = ctx.server_url(cmd.server);

    let mut chat = ChatSession::new(&config)?;
    if let Some(id) = cmd.session {
        chat.resume(&id).await?;
    }
    chat.run().await
}

async fn handle_sessions(ctx: &RuntimeContext, command: SessionsCommand) -> Result<()> {
    match command {
        SessionsCommand::List(server) => {
            let client = ChatClient::new(&ctx.server_url(server.server));
            let sessions = client.sessions().await.context("listing sessions")?;
            if ctx.print(&sessions)? {
                return Ok(());
            }
            println!(
                "{:<40} {:<10} {:>8} {:<20}",
                "ID", "STATUS", "MESSAGES", "UPDATED"
            );
            println!("{}", "-".repeat(82));
            for session in &sessions {
                println!(
                    "{:<40} {:<10} {:>8} {:<20}",
                    session.id,
                    status_label(session),
                    session.messages.len(),
                    session.updated_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        SessionsCommand::Show { id, server } => {
            let client = ChatClient::new(&ctx.server_url(server.server));
            let session = client
                .session(&id)
                .await
                .context("fetching session")?
                .ok_or_else(|| anyhow!("session {} not found", id))?;
            if ctx.print(&session)? {
                return Ok(());
            }
            println!("Session: {}", session.id);
            println!("  Status: {}", status_label(&session));
            println!("  Created: {}", session.created_at);
            println!("  Updated: {}", session.updated_at);
            for message in &session.messages {
                match message.assistant_text() {
                    Some(text) if !text.is_empty() => println!("  [assistant] {}", text),
                    _ => println!("  [{}]", message.kind()),
                }
            }
        }
        SessionsCommand::Abort { id, server } => {
            let client = ChatClient::new(&ctx.server_url(server.server));
            if !client.abort(&id).await.context("aborting session")? {
                bail!("Failed to abort session: {} not found or already completed", id);
            }
            println!("Session {} aborted", id);
        }
    }
    Ok(())
}

fn status_label(session: &SessionSnapshot) -> String {
    if session.streaming {
        format!("{}*", session.status)
    } else {
        session.status.to_string()
    }
}

async fn handle_actors(ctx: &RuntimeContext, cmd: ActorsCommand) -> Result<()> {
    let api_key = ctx
        .config
        .client
        .narration_api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| anyhow!("client.narration_api_key is not configured"))?;
    let client = NarrationClient::proxy(&ctx.server_url(cmd.server), &ctx.config.narration)
        .context("building narration client")?;
    let cache = ActorCache::new(
        ctx.paths.actor_cache_file(),
        Duration::from_secs(ctx.config.client.actor_cache_ttl_secs),
    );

    let actors = cache
        .get_or_fetch(cmd.refresh, || async {
            let catalog = client
                .list_actors(&api_key)
                .await
                .context("fetching voice actors")?;
            Ok::<_, anyhow::Error>(actors_from_catalog(&catalog))
        })
        .await?;

    if ctx.print(&actors)? {
        return Ok(());
    }
    println!("{:<38} {:<24} {:>6}", "ID", "NAME", "STYLES");
    println!("{}", "-".repeat(70));
    for actor in &actors {
        println!(
            "{:<38} {:<24} {:>6}",
            actor.id,
            actor.name,
            actor.styles.len()
        );
    }
    Ok(())
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

    config::write_default(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if !ctx.print(&ctx.config)? {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
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
            config::write_default(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
