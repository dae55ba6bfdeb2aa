use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use codehost::api;
use codehost::auth::TokenCodec;
use codehost::db::Database;
use codehost::monitor::{IdleMonitor, MonitorConfig};
use codehost::ports::PortAllocator;
use codehost::proxy;
use codehost::runtime::{ContainerRuntime, RuntimeDriver, RuntimeType, WorkloadConfig};
use codehost::store::SessionStore;

const APP_NAME: &str = "codehost";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Codehost - ephemeral browser-IDE session broker.",
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
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
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
    /// Start the broker (admission API, proxy and idle monitor)
    Serve(ServeCommand),
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
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port for the admission API
    #[arg(short, long, default_value = "8080")]
    port: u16,
    /// Port for the public data-plane proxy
    #[arg(long, default_value = "5000")]
    proxy_port: u16,
    /// Override the workload container image
    #[arg(long)]
    image: Option<String>,
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
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("codehost={level},tower_http={level}")));

        // Use JSON output if --json flag is set, otherwise pretty format
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
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
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
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
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
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

        let data_dir = default_data_dir()?;
        let state_dir = default_state_dir()?;

        Ok(Self {
            config_file,
            data_dir,
            state_dir,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    paths: PathsConfig,
    broker: BrokerConfig,
    ports: PortRangeConfig,
    monitor: MonitorSectionConfig,
    runtime: RuntimeSectionConfig,
    proxy: ProxySectionConfig,
    auth: AuthConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            paths: PathsConfig::default(),
            broker: BrokerConfig::default(),
            ports: PortRangeConfig::default(),
            monitor: MonitorSectionConfig::default(),
            runtime: RuntimeSectionConfig::default(),
            proxy: ProxySectionConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
    file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
    state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct BrokerConfig {
    /// Hostname embedded in session URLs returned by /start
    public_host: String,
    /// Session TTL in seconds
    session_ttl_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            session_ttl_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PortRangeConfig {
    /// First port of the session pool
    first: u16,
    /// Number of ports in the pool
    count: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            first: 3001,
            count: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct MonitorSectionConfig {
    /// Seconds between reclamation ticks
    interval_secs: u64,
    /// Grace period after last activity, in seconds
    idle_offset_secs: u64,
    /// Bounded wait for container stop before killing, in seconds
    stop_timeout_secs: u64,
    /// Containers inspected concurrently per tick
    fan_out: usize,
}

impl Default for MonitorSectionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            idle_offset_secs: 5 * 60,
            stop_timeout_secs: 10,
            fan_out: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RuntimeSectionConfig {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    binary: Option<String>,
    /// Session workload settings
    workload: WorkloadConfig,
}

impl Default for RuntimeSectionConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            workload: WorkloadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ProxySectionConfig {
    /// Fixed port of the shared static-asset backend
    static_asset_port: u16,
    /// Host the session backends listen on
    target_host: String,
}

impl Default for ProxySectionConfig {
    fn default() -> Self {
        Self {
            static_asset_port: 3000,
            target_host: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AuthConfig {
    /// Shared secret for signing session tokens
    secret: String,
    /// Shared key the operator front-end presents to the admission API
    operator_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: "change-me".to_string(),
            operator_key: "change-me".to_string(),
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting session broker...");
    let cfg = &ctx.config;

    if cfg.auth.secret == AuthConfig::default().secret {
        warn!("auth.secret is the built-in default; set a real secret before exposing the proxy");
    }
    if cfg.auth.operator_key == AuthConfig::default().operator_key {
        warn!("auth.operator_key is the built-in default; set a real key for the admission API");
    }

    // Initialize database
    let db_path = ctx.paths.data_dir.join("state.db");
    info!("Database path: {}", db_path.display());
    let database = Database::new(&db_path).await?;

    let store = SessionStore::new(database.pool().clone());
    let ports = PortAllocator::new(database.pool().clone());

    // The static-asset backend port must never enter the session pool.
    let last = cfg
        .ports
        .first
        .checked_add(cfg.ports.count.saturating_sub(1))
        .context("port range overflows u16")?;
    let range = cfg.ports.first..=last;
    if range.contains(&cfg.proxy.static_asset_port) {
        anyhow::bail!(
            "static asset port {} must not be inside the session port range {}-{}",
            cfg.proxy.static_asset_port,
            cfg.ports.first,
            last
        );
    }
    ports.initialize(range).await?;
    info!(
        first = cfg.ports.first,
        count = cfg.ports.count,
        "port pool initialized"
    );

    // Initialize the container runtime
    let workload = match cmd.image {
        Some(image) => WorkloadConfig {
            image,
            ..cfg.runtime.workload.clone()
        },
        None => cfg.runtime.workload.clone(),
    };
    let runtime = match (&cfg.runtime.runtime, &cfg.runtime.binary) {
        (Some(rt), Some(binary)) => ContainerRuntime::with_binary(*rt, binary.clone(), workload),
        (Some(rt), None) => ContainerRuntime::with_type(*rt, workload),
        (None, _) => ContainerRuntime::new(workload),
    };
    match runtime.health_check().await {
        Ok(_) => info!(
            "Container runtime ({}) is available",
            runtime.runtime_type()
        ),
        Err(e) => warn!(
            "Container runtime health check failed: {:?}. Container operations may fail.",
            e
        ),
    }
    let runtime: Arc<dyn RuntimeDriver> = Arc::new(runtime);

    ensure_static_backend(runtime.as_ref(), cfg.proxy.static_asset_port).await;

    let tokens = Arc::new(TokenCodec::new(&cfg.auth.secret));
    let session_ttl = Duration::from_secs(cfg.broker.session_ttl_secs);

    // Start the idle monitor
    let monitor = IdleMonitor::new(
        runtime.clone(),
        store.clone(),
        ports.clone(),
        MonitorConfig {
            interval: Duration::from_secs(cfg.monitor.interval_secs),
            idle_offset: Duration::from_secs(cfg.monitor.idle_offset_secs),
            session_ttl,
            stop_timeout: Duration::from_secs(cfg.monitor.stop_timeout_secs),
            fan_out: cfg.monitor.fan_out,
            static_asset_port: cfg.proxy.static_asset_port,
        },
    );
    tokio::spawn(monitor.run());

    // Admission API
    let admission_state = api::AppState::new(
        store.clone(),
        ports.clone(),
        runtime.clone(),
        tokens.clone(),
        api::AdmissionSettings {
            public_host: cfg.broker.public_host.clone(),
            proxy_port: cmd.proxy_port,
            session_ttl,
            operator_key: cfg.auth.operator_key.clone(),
        },
    );
    let admission_app = api::create_router(admission_state);

    // Data-plane proxy
    let proxy_state = proxy::ProxyState::new(
        store,
        tokens,
        proxy::ProxySettings {
            target_host: cfg.proxy.target_host.clone(),
            static_asset_port: cfg.proxy.static_asset_port,
        },
    );
    let proxy_app = proxy::create_router(proxy_state);

    // Bind and serve both surfaces
    let admission_addr: SocketAddr = format!("{}:{}", cmd.host, cmd.port)
        .parse()
        .context("invalid admission address")?;
    let proxy_addr: SocketAddr = format!("{}:{}", cmd.host, cmd.proxy_port)
        .parse()
        .context("invalid proxy address")?;

    let admission_listener = TcpListener::bind(admission_addr)
        .await
        .context("binding admission address")?;
    let proxy_listener = TcpListener::bind(proxy_addr)
        .await
        .context("binding proxy address")?;

    info!("Admission API on http://{admission_addr}, proxy on http://{proxy_addr}");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let mut admission_shutdown = shutdown_rx.clone();
    let mut proxy_shutdown = shutdown_rx;

    let admission_server = axum::serve(admission_listener, admission_app)
        .with_graceful_shutdown(async move {
            let _ = admission_shutdown.changed().await;
        });
    let proxy_server =
        axum::serve(proxy_listener, proxy_app).with_graceful_shutdown(async move {
            let _ = proxy_shutdown.changed().await;
        });

    tokio::try_join!(
        async move { admission_server.await },
        async move { proxy_server.await },
    )
    .context("running servers")?;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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

/// Start the shared static-asset backend if nothing serves its port yet.
async fn ensure_static_backend(runtime: &dyn RuntimeDriver, port: u16) {
    match runtime.find_container_by_port(port).await {
        Ok(Some(_)) => debug!("static asset backend already running on port {port}"),
        Ok(None) => match runtime.start_session_container(port).await {
            Ok(container_id) => {
                info!(container = %container_id, port, "started static asset backend");
            }
            Err(err) => {
                warn!("starting static asset backend failed: {err}; static routes will 502");
            }
        },
        Err(err) => warn!("checking static asset backend failed: {err}"),
    }
}

fn load_or_init_config(paths: &mut AppPaths, _common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path)?;
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> Result<String> {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    Ok(buffer)
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

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
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

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}
