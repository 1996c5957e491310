//! bx-pull - Bitrix24 Pull client
//!
//! Connects to a portal's Pull server with a captured credential bundle
//! and prints realtime events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bx_pull::auth::filter_cookies;
use bx_pull::{
    ClientSettings, ConfigResolver, ConnectionState, CredentialBundle, PullClient, PullEvent,
    RestClient,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ONLINE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "bx-pull")]
#[command(about = "Bitrix24 Pull realtime client")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "BX_PULL_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print events until Ctrl-C
    Run {
        /// Credential bundle (JSON)
        #[arg(short, long, env = "BX_PULL_BUNDLE")]
        bundle: PathBuf,

        /// Client settings (TOML)
        #[arg(short, long, env = "BX_PULL_SETTINGS")]
        settings: Option<PathBuf>,

        /// Authenticate with an API token
        #[arg(long)]
        token_mode: bool,
    },

    /// Print the resolved Pull configuration
    Resolve {
        /// Credential bundle (JSON)
        #[arg(short, long, env = "BX_PULL_BUNDLE")]
        bundle: PathBuf,

        /// Client settings (TOML)
        #[arg(short, long, env = "BX_PULL_SETTINGS")]
        settings: Option<PathBuf>,
    },

    /// Publish one chat message
    Send {
        /// Credential bundle (JSON)
        #[arg(short, long, env = "BX_PULL_BUNDLE")]
        bundle: PathBuf,

        /// Client settings (TOML)
        #[arg(short, long, env = "BX_PULL_SETTINGS")]
        settings: Option<PathBuf>,

        /// Chat id
        #[arg(long)]
        chat: u64,

        /// Message text
        #[arg(long)]
        text: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("bx_pull=info".parse()?);
    tracing_subscriber::registry()
        .with(cli.json_logs.then(|| fmt::layer().json()))
        .with((!cli.json_logs).then(fmt::layer))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            bundle,
            settings,
            token_mode,
        } => {
            let mut settings = load_settings(settings.as_deref())?;
            settings.use_api_token |= token_mode;
            run(settings, &bundle).await?;
        }

        Commands::Resolve { bundle, settings } => {
            let settings = load_settings(settings.as_deref())?;
            let bundle = CredentialBundle::from_file(&bundle)?;
            let resolved = ConfigResolver::from_settings(&settings).resolve(&bundle);
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }

        Commands::Send {
            bundle,
            settings,
            chat,
            text,
        } => {
            let settings = load_settings(settings.as_deref())?;
            send(settings, &bundle, chat, &text).await?;
        }
    }

    Ok(())
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let settings = match path {
        Some(path) => ClientSettings::from_file(path)?,
        None => ClientSettings::default(),
    };
    settings.validate()?;
    Ok(settings)
}

fn build_client(settings: ClientSettings, bundle_path: &Path) -> anyhow::Result<PullClient> {
    let bundle = CredentialBundle::from_file(bundle_path)
        .with_context(|| format!("loading {}", bundle_path.display()))?;

    let rest = match settings.rest_url.as_deref() {
        Some(url) => {
            let cookies = filter_cookies(&bundle.cookies);
            Some(RestClient::new(url, cookies.as_deref(), &settings.user_agent)?)
        }
        None => None,
    };
    if settings.use_api_token && rest.is_none() {
        warn!("token mode requested without rest_url, falling back to cookies");
    }

    let client = PullClient::new(settings, bundle);
    Ok(match rest {
        Some(rest) => client.with_token_source(Arc::new(rest)),
        None => client,
    })
}

async fn run(settings: ClientSettings, bundle_path: &Path) -> anyhow::Result<()> {
    let client = build_client(settings, bundle_path)?;
    let mut events = client.start();
    info!(user_id = client.user_id(), "client started, press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("interrupted");
                break;
            }
        }
    }

    client.stop();
    println!("{}", serde_json::to_string_pretty(&client.debug_info())?);
    Ok(())
}

async fn send(settings: ClientSettings, bundle_path: &Path, chat: u64, text: &str) -> anyhow::Result<()> {
    let client = build_client(settings, bundle_path)?;
    let mut events = client.start();

    let online = tokio::time::timeout(ONLINE_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                PullEvent::Status { connected: true, .. } => return true,
                PullEvent::AuthenticationFailed { reason } => {
                    warn!(reason = %reason, "authentication failed");
                    return false;
                }
                PullEvent::ReconnectExhausted { .. } => return false,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if !online || client.state() != ConnectionState::Online {
        client.stop();
        anyhow::bail!("could not connect to the pull server");
    }

    let sent = client.send(chat, text).await;
    client.stop();
    anyhow::ensure!(sent, "message was not sent");
    info!(chat, "message sent");
    Ok(())
}

fn print_event(event: &PullEvent) {
    match event {
        PullEvent::Message(message) => match serde_json::to_string(message) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!(error = %e, "cannot print message"),
        },
        PullEvent::Rpc { method, params } => println!("rpc {method}: {params}"),
        PullEvent::Status { connected, message } => println!("status connected={connected}: {message}"),
        PullEvent::Reconnecting { attempt, delay } => println!("reconnecting (attempt {attempt}) in {delay:?}"),
        PullEvent::ReconnectExhausted { attempts } => println!("gave up after {attempts} attempts"),
        PullEvent::AuthenticationFailed { reason } => println!("authentication failed: {reason}"),
        PullEvent::Debug(text) => println!("debug: {text}"),
    }
}
