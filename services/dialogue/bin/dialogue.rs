//! Main entrypoint for the voice role-play client.
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Wiring the session service, speaker, WAV recorder and LLM together.
//! 3. Running the dialogue until the user leaves or presses Ctrl+C.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use clap::{Parser, Subcommand};
use iflytek_tts::ClientConfig;
use secrecy::ExposeSecret;
use std::{path::Path, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use wavecraft_core::{
    HttpSessionNegotiator, OpenAICompatibleClient, TurnConfig, TurnManager, TurnRequest,
};
use wavecraft_dialogue::{Config, Dialogue};
use wavecraft_native_utils::{SpeakerOutput, WavRecorder};

const ENV_FILE: &str = ".env";

#[derive(Parser)]
#[command(version, about = "Talk to an AI character that answers out loud")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a role-play dialogue (the default).
    Play {
        /// Character setting; asked for interactively when omitted.
        #[arg(long)]
        character: Option<String>,
        /// Do not write WAV recordings of the replies.
        #[arg(long)]
        no_record: bool,
    },
    /// Revoke a session that was acquired but never used.
    Cancel {
        #[arg(long)]
        session_id: String,
    },
    /// Write a .env template to the current directory.
    Init,
}

fn write_env_template() -> anyhow::Result<()> {
    let path = Path::new(ENV_FILE);
    if path.exists() {
        println!("{ENV_FILE} already exists; leaving it untouched.");
        return Ok(());
    }
    std::fs::write(path, Config::env_template()).context("Failed to write .env template")?;
    println!("Created {ENV_FILE}. Fill in your keys and run `dialogue play`.");
    Ok(())
}

/// Reads stdin on a plain thread so a pending read never holds up shutdown.
fn stdin_lines() -> ReceiverStream<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    ReceiverStream::new(rx)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Play {
        character: None,
        no_record: false,
    });
    if let Command::Init = command {
        return write_env_template();
    }

    // --- 1. Load Configuration ---
    let config = Config::from_env()
        .context("Failed to load configuration (run `dialogue init` to create a .env template)")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded.");

    // --- 3. Initialize Services ---
    let negotiator = Arc::new(
        HttpSessionNegotiator::new(
            &config.api_base_url,
            config.auth_token,
            config.negotiation_timeout,
        )
        .context("Failed to build the session service client")?,
    );
    let turns = TurnManager::new(
        negotiator,
        Arc::new(SpeakerOutput::default()),
        TurnConfig {
            client: ClientConfig::new(config.iflytek_app_id),
            request: TurnRequest::from_voice(&config.voice),
        },
    );

    match command {
        Command::Cancel { session_id } => {
            turns
                .cancel_session(&session_id)
                .await
                .with_context(|| format!("Failed to cancel session {session_id}"))?;
            println!("Session {session_id} cancelled.");
        }
        Command::Play {
            character,
            no_record,
        } => {
            let turns = if no_record {
                turns
            } else {
                info!(dir = %config.audio_output_dir.display(), "Recording replies.");
                turns.with_recorder(Arc::new(WavRecorder::new(config.audio_output_dir)))
            };

            let interrupt = turns.interrupt_token();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Received Ctrl+C. Stopping...");
                        interrupt.cancel();
                    }
                    Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler."),
                }
            });

            let openai_config = OpenAIConfig::new()
                .with_api_key(config.openai_api_key.expose_secret())
                .with_api_base(&config.openai_base_url);
            let llm = Arc::new(OpenAICompatibleClient::new(openai_config, config.chat_model));

            let dialogue = Dialogue::new(llm, turns);
            let mut stdout = tokio::io::stdout();
            dialogue.run(character, stdin_lines(), &mut stdout).await?;
        }
        Command::Init => {}
    }

    Ok(())
}
