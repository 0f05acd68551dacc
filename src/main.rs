mod config;
mod control;
mod countries;
mod error;
mod events;
mod model;
mod orchestrator;
mod proxy;
mod store;
#[cfg(test)]
mod testing;
mod toggle;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::{
    default_config_path, load_config, parse_country_codes, save_config, ClientConfig,
    ProfileConfig,
};
use control::{
    ControlClient, ControlPlane, ControlSettings, DEFAULT_LOG_LINES, DEFAULT_REQUEST_TIMEOUT,
};
use error::ControlError;
use events::{LogObserver, SessionEvent, SessionObserver};
use model::{format_bytes, format_uptime, Node, Strategy};
use orchestrator::NodeOrchestrator;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use store::{default_store_path, SessionStore, DEFAULT_CACHE_TTL};
use time::OffsetDateTime;
use toggle::{quick_toggle, ToggleOutcome};

const COUNTRIES_CACHE_KEY: &str = "available-countries";
const CREDENTIALS_HINT: &str =
    "control plane rejected the credentials; check --username/--password";

#[derive(Parser, Debug)]
#[command(name = "exitctl", about = "Control a fleet of country-keyed VPN exit nodes")]
struct Args {
    #[arg(long, default_value = "default")]
    profile: String,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    store: Option<PathBuf>,
    #[arg(long, env = "EXITCTL_API_URL", value_name = "URL")]
    api_url: Option<String>,
    #[arg(long, env = "EXITCTL_USERNAME")]
    username: Option<String>,
    #[arg(long, env = "EXITCTL_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    #[arg(long)]
    tls_pin: Option<String>,
    /// Send progress and failure notices to the log instead of the terminal
    #[arg(long)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save API settings for the selected profile
    Init {
        #[arg(value_name = "URL")]
        api_url: String,
        #[arg(long)]
        refresh_interval: Option<u64>,
        #[arg(long, value_name = "CODES", value_delimiter = ',')]
        favorites: Vec<String>,
        #[arg(long)]
        save_password: bool,
    },
    /// List nodes, running first
    Nodes,
    /// Keep refreshing the node list until interrupted
    Watch {
        #[arg(long, value_name = "SECONDS")]
        interval: Option<u64>,
    },
    Start {
        country: String,
        #[arg(long)]
        server: Option<String>,
    },
    /// Stop a node by id or country code
    Stop { target: String },
    /// Restart a node by id or country code
    Restart { target: String },
    /// Stop the country's node if it is running, otherwise start it
    Toggle { country: String },
    Details { target: String },
    Logs {
        target: String,
        #[arg(long, default_value_t = DEFAULT_LOG_LINES)]
        lines: u32,
    },
    Countries {
        #[arg(long)]
        refresh: bool,
        /// List the built-in catalog instead of what the control plane offers
        #[arg(long)]
        catalog: bool,
    },
    Proxies {
        #[arg(long)]
        country: Option<String>,
        #[arg(long)]
        usage: bool,
    },
    Strategy {
        #[command(subcommand)]
        command: StrategyCommand,
    },
    SpeedTest {
        target: String,
        #[arg(long)]
        history: bool,
    },
    Stats,
    Servers { country: Option<String> },
    BestNode { country: String },
    Recent,
    ClearCache,
}

#[derive(Subcommand, Debug)]
enum StrategyCommand {
    Get,
    Set { strategy: StrategyArg },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    RoundRobin,
    LeastConnections,
    WeightedLatency,
    Random,
    HealthScore,
}

impl From<StrategyArg> for Strategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::RoundRobin => Strategy::RoundRobin,
            StrategyArg::LeastConnections => Strategy::LeastConnections,
            StrategyArg::WeightedLatency => Strategy::WeightedLatency,
            StrategyArg::Random => Strategy::Random,
            StrategyArg::HealthScore => Strategy::HealthScore,
        }
    }
}

/// Prints session events, or forwards them to the log with `--quiet`.
///
/// Remembers the last failure it showed so `main` does not print the same error again.
struct ConsoleObserver {
    quiet: bool,
    last_failure: Mutex<Option<String>>,
}

impl ConsoleObserver {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            last_failure: Mutex::new(None),
        }
    }

    /// True when `err` is the control-plane error the last failure event already reported.
    fn already_reported(&self, err: &anyhow::Error) -> bool {
        let Some(err) = err.downcast_ref::<ControlError>() else {
            return false;
        };
        let last = self.last_failure.lock().unwrap_or_else(|err| err.into_inner());
        last.as_deref() == Some(err.to_string().as_str())
    }
}

impl SessionObserver for ConsoleObserver {
    fn on_event(&self, event: &SessionEvent) {
        if let SessionEvent::Failure { message, .. } = event {
            let mut last = self.last_failure.lock().unwrap_or_else(|err| err.into_inner());
            *last = Some(message.clone());
        }
        if self.quiet {
            LogObserver.on_event(event);
            return;
        }
        match event {
            SessionEvent::Progress { title } => eprintln!("{}...", title),
            SessionEvent::Success { title, message } => match message {
                Some(message) => println!("{}: {}", title, message),
                None => println!("{}", title),
            },
            SessionEvent::Failure { title, message } => eprintln!("{}: {}", title, message),
        }
    }
}

struct Session {
    profile: ProfileConfig,
    store: SessionStore,
    observer: Arc<ConsoleObserver>,
    orchestrator: Arc<NodeOrchestrator<ControlClient>>,
}

impl Session {
    fn client(&self) -> &ControlClient {
        self.orchestrator.client()
    }

    /// Finds a node by id, falling back to its country code.
    async fn resolve_node(&self, target: &str) -> Result<Node> {
        let nodes = self.orchestrator.refresh().await?;
        nodes
            .iter()
            .find(|node| node.id == target)
            .cloned()
            .or_else(|| {
                self.orchestrator
                    .node_for_country(&target.trim().to_lowercase())
            })
            .ok_or_else(|| anyhow!("no node matches {}", target))
    }

    async fn available_countries(&self, force: bool) -> Result<Vec<String>> {
        if !force {
            if let Some(cached) = self
                .store
                .get_cached::<Vec<String>>(COUNTRIES_CACHE_KEY, DEFAULT_CACHE_TTL)
            {
                return Ok(cached);
            }
        }
        let fetched = self
            .client()
            .available_countries()
            .await
            .context("failed to load countries")?;
        if let Err(err) = self.store.set_cached(COUNTRIES_CACHE_KEY, &fetched) {
            log::warn!("failed to cache countries: {}", err);
        }
        Ok(fetched)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if matches!(args.command, Command::Init { .. }) {
        run_init(&args)?;
        return Ok(ExitCode::SUCCESS);
    }

    let session = open_session(&args)?;
    let result = run(&args, &session).await;
    session.orchestrator.shutdown();
    let Err(err) = result else {
        return Ok(ExitCode::SUCCESS);
    };
    let rejected = matches!(
        err.downcast_ref::<ControlError>().and_then(ControlError::status),
        Some(401) | Some(403)
    );
    if session.observer.already_reported(&err) {
        if rejected {
            eprintln!("{}", CREDENTIALS_HINT);
        }
        log::debug!("exiting after reported failure: {:#}", err);
        return Ok(ExitCode::FAILURE);
    }
    if rejected {
        return Err(err.context(CREDENTIALS_HINT));
    }
    Err(err)
}

fn run_init(args: &Args) -> Result<()> {
    let Command::Init {
        api_url,
        refresh_interval,
        favorites,
        save_password,
    } = &args.command
    else {
        return Ok(());
    };
    let config_path = resolve_config_path(args)?;
    let mut config = load_config(&config_path)?;
    let profile = config.profiles.entry(args.profile.clone()).or_default();
    profile.api_url = Some(api_url.trim().to_string());
    if let Some(username) = &args.username {
        profile.api_username = Some(username.clone());
    }
    if *save_password {
        profile.api_password = args.password.clone();
    }
    if let Some(interval) = refresh_interval {
        if *interval == 0 {
            return Err(anyhow!("refresh interval must be > 0"));
        }
        profile.refresh_interval_seconds = *interval;
    }
    if !favorites.is_empty() {
        profile.favorite_countries = parse_country_codes(favorites);
    }
    if let Some(pin) = &args.tls_pin {
        profile.tls_pinned_sha256 = Some(pin.clone());
    }
    save_config(&config_path, &config)?;
    println!("saved config for profile {}", args.profile);
    Ok(())
}

async fn run(args: &Args, session: &Session) -> Result<()> {
    let orchestrator = &session.orchestrator;
    match &args.command {
        Command::Init { .. } => return run_init(args),
        Command::Nodes => {
            orchestrator.refresh().await?;
            print_nodes(&orchestrator.sorted_snapshot());
            println!("{} running", orchestrator.running_count());
        }
        Command::Watch { interval } => {
            let period = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| orchestrator.poll_interval());
            if period.is_zero() {
                return Err(anyhow!("interval must be > 0"));
            }
            if let Err(err) = orchestrator.refresh().await {
                eprintln!("initial refresh failed: {}", err);
            }
            print_nodes(&orchestrator.sorted_snapshot());
            let poller = orchestrator.spawn_polling();
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            let mut last_seen = orchestrator.last_fetched_at();
            let mut shutdown = Box::pin(wait_for_shutdown_signal());
            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        println!("shutdown signal received, stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let fetched = orchestrator.last_fetched_at();
                        if fetched != last_seen {
                            last_seen = fetched;
                            println!();
                            print_nodes(&orchestrator.sorted_snapshot());
                        } else if let Some(err) = orchestrator.last_error() {
                            eprintln!("showing last known state: {}", err);
                        }
                    }
                }
            }
            orchestrator.shutdown();
            poller.await.context("polling task failed")?;
        }
        Command::Start { country, server } => {
            let country = country.trim().to_lowercase();
            let server = server
                .clone()
                .or_else(|| session.store.last_used_server(&country));
            if let Some(server) = &server {
                println!("using server {}", server);
            }
            let node = orchestrator.start(&country, server.as_deref()).await?;
            println!("node {} status={}", node.id, node.status);
        }
        Command::Stop { target } => {
            let node = session.resolve_node(target).await?;
            orchestrator.stop(&node).await?;
        }
        Command::Restart { target } => {
            let node = session.resolve_node(target).await?;
            orchestrator.restart(&node).await?;
        }
        Command::Toggle { country } => match quick_toggle(orchestrator, country).await? {
            ToggleOutcome::Started { country, node } => {
                println!("started {} {} ({})", country.flag, country.name, node.id);
            }
            ToggleOutcome::Stopped {
                country,
                node_id,
                response,
            } => {
                println!(
                    "stopped {} {} ({}, {})",
                    country.flag, country.name, node_id, response.status
                );
            }
        },
        Command::Details { target } => {
            let node = session.resolve_node(target).await?;
            let details = session.client().node_details(&node.id).await?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        Command::Logs { target, lines } => {
            let node = session.resolve_node(target).await?;
            let logs = orchestrator.logs(&node, *lines).await?;
            print!("{}", logs.logs);
            if !logs.logs.ends_with('\n') {
                println!();
            }
        }
        Command::Countries { refresh, catalog } => {
            let available = if *catalog {
                countries::catalog().into_iter().map(|country| country.code).collect()
            } else {
                session.available_countries(*refresh).await?
            };
            let favorites = &session.profile.favorite_countries;
            let sorted = countries::sort_by_favorites(&available, favorites);
            let recent = session.store.recent_countries();
            for code in sorted {
                let mut tags = Vec::new();
                if favorites.contains(&code) {
                    tags.push("favorite");
                }
                if recent.contains(&code) {
                    tags.push("recent");
                }
                if tags.is_empty() {
                    println!("{:<4} {}", code, countries::display(&code));
                } else {
                    println!(
                        "{:<4} {} [{}]",
                        code,
                        countries::display(&code),
                        tags.join(",")
                    );
                }
            }
        }
        Command::Proxies { country, usage } => {
            orchestrator.refresh().await?;
            let mut available = session.available_countries(false).await?;
            if let Some(country) = country {
                let code = country.trim().to_lowercase();
                available.retain(|entry| *entry == code);
                if available.is_empty() {
                    return Err(anyhow!(
                        "country {} is not offered by the control plane",
                        code
                    ));
                }
            }
            for endpoint in orchestrator.proxy_endpoints(&available) {
                println!(
                    "{} [{}] http={} socks5={}{}",
                    countries::display(&endpoint.country),
                    if endpoint.is_active() { "active" } else { "inactive" },
                    endpoint.http_proxy,
                    endpoint.socks5_proxy,
                    endpoint
                        .node_id
                        .as_ref()
                        .map(|id| format!(" node={}", id))
                        .unwrap_or_default()
                );
                if *usage {
                    println!("{}", endpoint.usage());
                }
            }
        }
        Command::Strategy { command } => {
            let current = match command {
                StrategyCommand::Get => session.client().load_balancer_strategy().await?,
                StrategyCommand::Set { strategy } => {
                    session
                        .client()
                        .set_load_balancer_strategy((*strategy).into())
                        .await?
                }
            };
            println!("strategy: {}", current.strategy.as_str());
        }
        Command::SpeedTest { target, history } => {
            let node = session.resolve_node(target).await?;
            if *history {
                let results = session.client().speed_test_results(Some(&node.id)).await?;
                for result in results {
                    println!(
                        "{} ↓ {:.1} Mbps ↑ {:.1} Mbps {}ms",
                        result.tested_at,
                        result.download_mbps,
                        result.upload_mbps,
                        result.latency_ms
                    );
                }
            } else {
                orchestrator.speed_test(&node).await?;
            }
        }
        Command::Stats => {
            let stats = session.client().dashboard_stats().await?;
            println!("nodes: {} ({} active)", stats.total_nodes, stats.active_nodes);
            println!("connected clients: {}", stats.connected_clients);
            println!("total traffic: {}", format_bytes(stats.total_traffic));
        }
        Command::Servers { country } => match country {
            Some(country) => {
                let code = country.trim().to_lowercase();
                for server in session.client().country_servers(&code).await? {
                    println!("{}", server);
                }
            }
            None => {
                let mut all: Vec<_> = session
                    .client()
                    .all_servers()
                    .await?
                    .into_iter()
                    .collect();
                all.sort_by(|a, b| a.0.cmp(&b.0));
                for (code, servers) in all {
                    println!("{} ({} servers)", countries::display(&code), servers.len());
                }
            }
        },
        Command::BestNode { country } => {
            let code = country.trim().to_lowercase();
            match session.client().best_node(&code).await? {
                Some(node) => print_nodes(std::slice::from_ref(&node)),
                None => println!("no healthy node for {}", countries::display(&code)),
            }
        }
        Command::Recent => {
            for code in session.store.recent_countries() {
                match session.store.last_used_server(&code) {
                    Some(server) => {
                        println!("{} (last server {})", countries::display(&code), server)
                    }
                    None => println!("{}", countries::display(&code)),
                }
            }
        }
        Command::ClearCache => {
            session.store.clear_cache()?;
            println!("cache cleared");
        }
    }
    Ok(())
}

fn print_nodes(nodes: &[Node]) {
    if nodes.is_empty() {
        println!("no nodes");
        return;
    }
    let now = OffsetDateTime::now_utc();
    for node in nodes {
        let mut line = format!(
            "{} {:<10} {}",
            countries::display(&node.country),
            node.status,
            node.server.as_deref().unwrap_or(&node.id)
        );
        if let Some(metrics) = &node.metrics {
            line.push_str(&format!(
                " cpu={:.1}% ram={}MB rx={} tx={} clients={}",
                metrics.cpu_percent,
                metrics.memory_mb,
                format_bytes(metrics.network_rx),
                format_bytes(metrics.network_tx),
                metrics.connected_clients
            ));
        }
        if node.is_running() {
            line.push_str(&format!(" up {}", format_uptime(node.uptime(now))));
        }
        println!("{}", line);
    }
}

fn open_session(args: &Args) -> Result<Session> {
    let config = load_optional_config(args)?;
    let profile = config
        .as_ref()
        .and_then(|config| config.profiles.get(&args.profile).cloned())
        .unwrap_or_default();

    let api_url = args
        .api_url
        .clone()
        .or_else(|| profile.api_url.clone())
        .ok_or_else(|| anyhow!("API URL not set; use --api-url or init the profile"))?;
    let username = args
        .username
        .clone()
        .or_else(|| profile.api_username.clone())
        .unwrap_or_default();
    let password = args
        .password
        .clone()
        .or_else(|| profile.api_password.clone())
        .unwrap_or_default();
    let timeout = profile
        .request_timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

    let client = ControlClient::new(ControlSettings {
        api_url,
        username,
        password,
        tls_pin: args.tls_pin.clone().or_else(|| profile.tls_pinned_sha256.clone()),
        timeout,
    })?;
    log::debug!("using control plane {}", client.base_url());

    let store = SessionStore::new(resolve_store_path(args, &profile)?);
    log::debug!("session store {}", store.path().display());
    let observer = Arc::new(ConsoleObserver::new(args.quiet));
    let orchestrator = Arc::new(NodeOrchestrator::new(
        Arc::new(client),
        Some(store.clone()),
        observer.clone(),
        Duration::from_secs(profile.refresh_interval_seconds),
    ));
    Ok(Session {
        profile,
        store,
        observer,
        orchestrator,
    })
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            return;
        }
    }

    let _ = tokio::signal::ctrl_c().await;
}

fn resolve_config_path(args: &Args) -> Result<PathBuf> {
    args.config
        .clone()
        .or_else(default_config_path)
        .ok_or_else(|| anyhow!("no default config path available"))
}

fn load_optional_config(args: &Args) -> Result<Option<ClientConfig>> {
    let config_path = match args.config.clone().or_else(default_config_path) {
        Some(path) => path,
        None => return Ok(None),
    };
    Ok(Some(load_config(&config_path)?))
}

fn resolve_store_path(args: &Args, profile: &ProfileConfig) -> Result<PathBuf> {
    if let Some(path) = args.store.clone().or_else(|| profile.store_path.clone()) {
        return Ok(path);
    }
    default_store_path(&args.profile).ok_or_else(|| anyhow!("no default store path available"))
}
