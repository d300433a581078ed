//! Headless driver for the session engine.
//!
//! Commands arrive as JSON objects on stdin, one per line; session events
//! leave as JSON objects on stdout, one per line. Logs go to stderr so the
//! stdout stream stays machine-readable.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};

use dikte::audio_toolkit::list_input_devices;
use dikte::corrections::CorrectionStore;
use dikte::engines::EngineDeps;
use dikte::events::{EventBus, SessionEvent, StopReason};
use dikte::managers::{SessionManager, SessionServices, SessionTrigger};
use dikte::services::{current_month, HistoryStore, MemorySettings, TextProcessing, UsageLedger};
use dikte::settings::{get_default_settings, load_settings_file};
use dikte::text::TextProcessor;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "dikte", about = "Dikte - speech session engine")]
struct CliArgs {
    /// Path to a JSON settings file
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Directory for history, usage and correction records
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// List available input devices as JSON and exit
    #[arg(long)]
    list_devices: bool,

    /// Enable debug mode with verbose logging
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Command {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "stop")]
    Stop,
    /// Immediate teardown, for hosts that need the microphone back.
    #[serde(rename = "force_stop")]
    ForceStop,
    #[serde(rename = "enable_wake_word")]
    EnableWakeWord,
    #[serde(rename = "disable_wake_word")]
    DisableWakeWord,
    #[serde(rename = "update_wake_word")]
    UpdateWakeWord { phrase: String },
    #[serde(rename = "shutdown")]
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .format_target(false)
        .init();

    if args.list_devices {
        let names: Vec<String> = list_input_devices()?
            .into_iter()
            .map(|device| device.name)
            .collect();
        println!("{}", serde_json::to_string(&names)?);
        return Ok(());
    }

    let settings = match &args.settings {
        Some(path) => load_settings_file(path)?,
        None => get_default_settings(),
    };

    let usage_path = args.data_dir.as_ref().map(|dir| dir.join("usage.json"));
    let mut usage = usage_path
        .as_ref()
        .map(UsageLedger::load)
        .unwrap_or_default();
    usage.reset_if_new_month(&current_month());

    let history = match &args.data_dir {
        Some(dir) => HistoryStore::open(dir.join("history.json")),
        None => HistoryStore::in_memory(),
    };

    let mut processor = TextProcessor::from_settings(&settings);
    if let Some(dir) = &args.data_dir {
        let path = dir.join("corrections.json");
        if path.exists() {
            match CorrectionStore::load(&path) {
                Ok(store) => processor = processor.with_corrections(store.active_map()),
                Err(e) => warn!("Could not load corrections: {e:#}"),
            }
        }
    }

    let services = SessionServices {
        processor: Some(Arc::new(processor) as Arc<dyn TextProcessing>),
        history,
        usage,
        ..Default::default()
    };

    let bus = EventBus::new();
    let settings_provider = Arc::new(MemorySettings::new(settings.clone()));
    let manager = SessionManager::new(
        settings_provider.clone(),
        EngineDeps::default(),
        services,
        bus,
    );

    // Event printer. Usage is flushed to disk after every completed
    // session so a crash loses at most the running one.
    let mut events = manager.subscribe();
    let usage_handle = manager.usage();
    let usage_save_path = usage_path.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let completed = matches!(event, SessionEvent::Completed { .. });
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            println!("{json}");
                            let _ = io::stdout().flush();
                        }
                        Err(e) => warn!("Could not serialize event: {e}"),
                    }
                    if completed {
                        if let Some(path) = &usage_save_path {
                            if let Err(e) = usage_handle.lock().unwrap().save(path) {
                                warn!("Could not save usage: {e:#}");
                            }
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event stream lagged, {n} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Blocking stdin reader feeding the async command loop.
    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if stdin_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Failed to read stdin: {e}");
                    break;
                }
            }
        }
    });

    info!("dikte engine ready ({})", settings.transcription_engine);
    if settings.voice_activation {
        manager.enable_wake_word().await;
    }

    while let Some(line) = stdin_rx.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let command: Command = match serde_json::from_str(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring invalid command: {e}");
                continue;
            }
        };
        match command {
            Command::Start => manager.start(SessionTrigger::Manual).await,
            Command::Stop => manager.stop().await,
            Command::ForceStop => manager.force_stop(StopReason::Takeover).await,
            Command::EnableWakeWord => manager.enable_wake_word().await,
            Command::DisableWakeWord => manager.disable_wake_word(),
            Command::UpdateWakeWord { phrase } => {
                settings_provider.update(|s| s.wake_word = phrase.clone());
                manager.update_wake_word(&phrase);
            }
            Command::Shutdown => break,
        }
    }

    info!("Shutting down");
    manager.disable_wake_word();
    if manager.is_active() {
        manager.force_stop(StopReason::Takeover).await;
    }
    if let Some(path) = &usage_path {
        if let Err(e) = manager.usage().lock().unwrap().save(path) {
            warn!("Could not save usage: {e:#}");
        }
    }
    Ok(())
}
