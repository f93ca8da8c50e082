use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use polyglot_caller::api_key::{
    clear_api_key, get_api_key, mask_key, resolve_api_key, store_api_key,
};
use polyglot_caller::audio::CpalBackend;
use polyglot_caller::streaming::LiveClient;
use polyglot_caller::{
    load_settings, CallConfiguration, CallController, CallError, CallEvents, Language, Scenario,
    TranscriptItem,
};

#[derive(Parser)]
#[command(name = "polyglot-caller", version, about = "Practice phone calls in a foreign language")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call
    Call {
        /// Language the agent speaks, e.g. "Spanish"
        #[arg(long)]
        language: String,
        /// Language code, e.g. "es-ES" (defaults to the language name)
        #[arg(long)]
        language_code: Option<String>,
        /// Short title of the scenario, e.g. "Restaurant"
        #[arg(long)]
        scenario: String,
        /// Who the agent is and what the call is about
        #[arg(long)]
        prompt: String,
        /// Prebuilt voice, overrides the settings file
        #[arg(long)]
        voice: Option<String>,
        /// Settings file (defaults to the user config directory)
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Store the API key in the system keyring
    SetKey { key: String },
    /// Remove the stored API key
    ClearKey,
    /// Show the API key in use, masked
    ShowKey,
}

/// How a call ended, as seen by the terminal
enum CallEnd {
    Disconnected,
    Failed(CallError),
}

/// Prints the transcript and forwards the end of the call to `main`
struct ConsoleEvents {
    ended: mpsc::UnboundedSender<CallEnd>,
}

impl CallEvents for ConsoleEvents {
    fn on_disconnect(&self) {
        let _ = self.ended.send(CallEnd::Disconnected);
    }

    fn on_error(&self, error: &CallError) {
        let _ = self.ended.send(CallEnd::Failed(error.clone()));
    }

    fn on_volume(&self, level: f32) {
        log::trace!("Console: mic level {:.3}", level);
    }

    fn on_transcript(&self, item: TranscriptItem) {
        println!(
            "[{}] {}: {}",
            item.timestamp.format("%H:%M:%S"),
            item.sender.label(),
            item.text
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Several rustls providers may be linked in; pick one for the process
    let _ = rustls::crypto::ring::default_provider().install_default();

    match Cli::parse().command {
        Commands::Call {
            language,
            language_code,
            scenario,
            prompt,
            voice,
            settings,
        } => {
            let config = CallConfiguration {
                language: Language {
                    wire_code: language_code.unwrap_or_else(|| language.clone()),
                    display_name: language,
                },
                scenario: Scenario {
                    title: scenario,
                    system_prompt: prompt,
                },
            };
            run_call(config, voice, settings).await
        }
        Commands::SetKey { key } => match store_api_key(&key) {
            Ok(()) => {
                println!("API key stored");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        },
        Commands::ClearKey => match clear_api_key() {
            Ok(true) => {
                println!("API key removed");
                ExitCode::SUCCESS
            }
            Ok(false) => {
                println!("No stored API key");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        },
        Commands::ShowKey => match resolve_api_key() {
            Some((key, source)) => {
                println!("{} (from {})", mask_key(&key), source);
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("No API key configured");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run_call(
    config: CallConfiguration,
    voice: Option<String>,
    settings_path: Option<PathBuf>,
) -> ExitCode {
    let mut settings = load_settings(settings_path.as_deref());
    if let Some(voice) = voice {
        settings.voice_name = voice;
    }

    let client = match LiveClient::new(
        settings.endpoint.clone(),
        get_api_key().unwrap_or_default(),
        settings.connect_timeout(),
        settings.outbound_queue_capacity,
    ) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let events = Arc::new(ConsoleEvents { ended: ended_tx });
    let controller = CallController::new(client, CpalBackend, settings, events);

    eprintln!(
        "Calling: {} ({}). Press Ctrl-C to hang up.",
        config.scenario.title, config.language.display_name
    );

    if let Err(e) = controller.start_call(config).await {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    tokio::select! {
        end = ended_rx.recv() => match end {
            Some(CallEnd::Failed(e)) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
            Some(CallEnd::Disconnected) | None => {
                eprintln!("Call ended");
                ExitCode::SUCCESS
            }
        },
        _ = tokio::signal::ctrl_c() => {
            controller.stop_call().await;
            eprintln!("Hung up");
            ExitCode::SUCCESS
        }
    }
}
