use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use vocals::{AudioConfig, Settings, TokenProvider, VocalsClient, tls};

/// Vocals - Real-time voice streaming client
#[derive(Parser, Debug)]
#[command(name = "vocals")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch a transport token and print it
    Token,

    /// Stream the microphone to the service and play the replies
    Stream {
        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(short = 's', long = "seconds")]
        seconds: Option<u64>,

        /// Log received segments instead of playing them
        #[arg(long = "no-playback")]
        no_playback: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Initialize crypto provider for TLS connections
    tls::ensure_crypto_provider();

    let cli = Cli::parse();

    // Load configuration from file or environment
    let settings = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        Settings::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        Settings::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    match cli.command {
        Commands::Token => print_token(&settings).await,
        Commands::Stream {
            seconds,
            no_playback,
        } => stream(settings, seconds.map(Duration::from_secs), no_playback).await,
    }
}

async fn print_token(settings: &Settings) -> anyhow::Result<()> {
    let provider = TokenProvider::new(settings)?;
    let token = provider.fetch().await?;

    let remaining = token
        .expires_at
        .duration_since(SystemTime::now())
        .unwrap_or_default();
    println!("{}", token.token);
    info!(
        endpoint = %provider.url(),
        expires_in_secs = remaining.as_secs(),
        "Token fetched"
    );
    Ok(())
}

async fn stream(
    settings: Settings,
    limit: Option<Duration>,
    no_playback: bool,
) -> anyhow::Result<()> {
    let audio = AudioConfig {
        auto_playback: !no_playback,
        ..Default::default()
    };
    let client = VocalsClient::new(settings, audio)?;

    client.on_connection_change(|state| info!(state = %state, "Connection state changed"));
    client.on_error(|err| warn!(kind = %err.kind(), "{err}"));
    client.on_message(|msg| {
        if !msg.is_audio() {
            info!(message_type = %msg.message_type, data = ?msg.data, "Message");
        }
    });

    client.connect().await?;
    if let Err(e) = client.start_recording().await {
        error!("Could not start recording: {e}");
        client.disconnect().await;
        return Err(e.into());
    }
    info!("Streaming, press Ctrl-C to stop");

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut deadline => {
                info!("Time limit reached");
                break;
            }
            _ = ticker.tick() => {
                if no_playback {
                    client.process_audio_queue(
                        |segment| {
                            info!(
                                sentence_number = segment.sentence_number,
                                text = %segment.text,
                                "Segment received"
                            )
                        },
                        true,
                    );
                }
            }
        }
    }

    client.stop_audio().await;
    client.disconnect().await;
    Ok(())
}
