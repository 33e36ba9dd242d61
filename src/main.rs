use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use sonicline::config::file;
use sonicline::transport::generate_device_id;
use sonicline::{
    ActionRegistry, BackendClient, Config, DetectorRegistry, DeviceSession, HistoryPoller,
    HttpAgentBackend, HubServer, SessionUpdate, SyncChannel, WebSocketConnector,
};

/// SonicLine - multi-device session sync for the assistant
#[derive(Parser)]
#[command(name = "sonicline", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (defaults to ~/.config/sonicline/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hub WebSocket URL
    #[arg(long)]
    hub_url: Option<String>,

    /// Agent/action backend URL
    #[arg(long)]
    backend_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay hub
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Join a session as an interactive device (reads stdin)
    Join {
        /// Session to join
        session: String,
        /// Device id (random if omitted)
        #[arg(long)]
        device_id: Option<String>,
    },
    /// Run the promise detectors on a line of assistant text
    Detect {
        /// Assistant utterance
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,sonicline=info",
        1 => "info,sonicline=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            Config::from_sources(file::load_from(path), |key| std::env::var(key).ok())?
        }
        None => Config::load()?,
    };

    if let Some(url) = &cli.hub_url {
        config.transport.url.clone_from(url);
    }
    if let Some(url) = &cli.backend_url {
        config.backend.url.clone_from(url);
    }
    if let Command::Serve { port: Some(port) } = cli.command {
        config.hub.port = port;
    }

    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Serve { .. } => serve(&config).await,
        Command::Join { session, device_id } => join(&config, &session, device_id).await,
        Command::Detect { text } => detect(&config, &text),
    }
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    tracing::info!(
        port = config.hub.port,
        history_cap = config.hub.history_cap,
        "starting relay hub"
    );

    HubServer::new(config.hub_settings(), config.hub.port)
        .run()
        .await?;
    Ok(())
}

async fn join(config: &Config, session_id: &str, device_id: Option<String>) -> anyhow::Result<()> {
    let device_id = device_id.unwrap_or_else(generate_device_id);
    let connector = Arc::new(WebSocketConnector::new(
        &config.transport.url,
        config.transport.connect_timeout,
    ));
    let channel = SyncChannel::new(&device_id, connector, config.reconnect_policy());

    let backend = BackendClient::new(&config.backend.url);
    let agent = HttpAgentBackend::new(&config.backend.url);
    let session = DeviceSession::new(
        channel,
        ActionRegistry::with_backend(&backend),
        config.session_options(),
    );

    let mut updates = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            match update {
                SessionUpdate::Message(m) => {
                    let who = if m.is_user { "you" } else { "assistant" };
                    let origin = m.device_id.as_deref().unwrap_or("-");
                    let flag = if m.is_error { " (error)" } else { "" };
                    println!("[{who}@{origin}]{flag} {}", m.text);
                    if let Some(url) = m.image_url {
                        println!("    image: {url}");
                    }
                }
                SessionUpdate::Action(a) => println!("* {}: {}", a.name, a.description),
            }
        }
    });

    if !session.open(session_id).await {
        anyhow::bail!(
            "could not connect to {} for session {session_id}",
            config.transport.url
        );
    }
    tracing::info!(session_id, device_id = %device_id, "joined session");

    session.spawn_sweeper(config.arbitration.sweep_interval);
    let poller = config.polling.enabled.then(|| {
        HistoryPoller::new(&config.transport.url).spawn(
            session.clone(),
            session_id.to_string(),
            config.polling.interval,
        )
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }
        if let Err(e) = session.converse(&agent, text).await {
            tracing::warn!(error = %e, "turn failed");
        }
    }

    if let Some(poller) = poller {
        poller.abort();
    }
    session.close();
    printer.abort();
    Ok(())
}

fn detect(config: &Config, text: &str) -> anyhow::Result<()> {
    let detectors = DetectorRegistry::with_defaults(config.arbitration.tier_policy);
    let mut candidates = detectors.detect_all(text);
    candidates.sort_by(|a, b| b.probability.total_cmp(&a.probability));

    println!("{}", serde_json::to_string_pretty(&candidates)?);
    Ok(())
}
