use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use colored::*;
use keystroke_recorder::input::{KeyEventKind, RdevInjector, RdevKeySource, VirtualKeyboard};
use keystroke_recorder::keycode;
use keystroke_recorder::storage::{export_script_file, import_script_file};
use keystroke_recorder::{
    config, ActionKind, Engine, EngineEvent, EventBus, HotkeyDispatcher, JsonFileStore, KsrError,
    PlaybackSettings, Player, Recorder, RepeatMode, Sequence, SequenceStore, Settings,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::io::BufRead;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ksr", version, about = "Record and replay keyboard input")]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record keystrokes until Enter or Ctrl+C
    Record {
        /// Name stored inside the sequence
        #[arg(long)]
        name: Option<String>,

        /// Save the recording under this name
        #[arg(long)]
        save: Option<String>,
    },

    /// Play a saved sequence or a script file
    #[command(group(ArgGroup::new("source").required(true).args(["name", "script"])))]
    Play {
        /// Saved sequence name
        name: Option<String>,

        /// Script file to play instead of a saved sequence
        #[arg(long)]
        script: Option<PathBuf>,

        /// Number of repetitions
        #[arg(short, long, conflicts_with = "forever")]
        repeat: Option<u32>,

        /// Repeat until Ctrl+C
        #[arg(long)]
        forever: bool,

        /// Delay between keys and repetitions (e.g. 200ms, 1s)
        #[arg(short, long, value_parser = parse_duration_arg)]
        delay: Option<Duration>,

        /// Print the keys instead of sending them
        #[arg(long)]
        dry_run: bool,
    },

    /// List saved sequences
    List,

    /// Delete a saved sequence
    Delete { name: String },

    /// Export a saved sequence as a script file
    Export { name: String, out: PathBuf },

    /// Import a script file
    Import {
        file: PathBuf,

        /// Save the imported sequence under this name
        #[arg(long)]
        save: Option<String>,
    },

    /// Check a script file for errors
    Check { file: PathBuf },

    /// Listen for the global hotkeys until Ctrl+C
    Run,
}

fn parse_duration_arg(value: &str) -> std::result::Result<Duration, String> {
    config::parse_duration(value).map_err(|e| e.to_string())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = Settings::load_or_default(path).context("Failed to load settings")?;
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = load_settings(cli.config.as_deref())?;
    let store = JsonFileStore::new(settings.storage_dir());

    match cli.command {
        Command::Record { name, save } => record(&store, name, save).await,
        Command::Play {
            name,
            script,
            repeat,
            forever,
            delay,
            dry_run,
        } => {
            let sequence = match (name, script) {
                (_, Some(path)) => import_script_file(&path)
                    .with_context(|| format!("Failed to read script {}", path.display()))?,
                (Some(name), None) => store
                    .load(&name)
                    .with_context(|| format!("Failed to load sequence '{name}'"))?,
                (None, None) => bail!("Nothing to play"),
            };

            let mut playback = settings.playback_settings();
            if let Some(delay) = delay {
                playback.set_inter_key_delay_ms(delay.as_millis().try_into().unwrap_or(u64::MAX));
            }
            if let Some(count) = repeat {
                playback.set_repeat_count(count);
            }
            if forever {
                playback.set_repeat_forever(true);
            }
            play(sequence, playback, settings.countdown, dry_run).await
        }
        Command::List => list(&store),
        Command::Delete { name } => {
            store
                .delete(&name)
                .with_context(|| format!("Failed to delete '{name}'"))?;
            println!("{} Deleted '{}'", "✓".green(), name);
            Ok(())
        }
        Command::Export { name, out } => {
            let sequence = store
                .load(&name)
                .with_context(|| format!("Failed to load sequence '{name}'"))?;
            export_script_file(&sequence, &out)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!(
                "{} Exported '{}' to {}",
                "✓".green(),
                name,
                out.display().to_string().cyan()
            );
            Ok(())
        }
        Command::Import { file, save } => {
            let sequence = import_script_file(&file)
                .with_context(|| format!("Failed to import {}", file.display()))?;
            print_sequence(&sequence);
            if let Some(target) = save {
                store.save(&sequence, &target)?;
                println!("{} Saved as '{}'", "✓".green(), target);
            }
            Ok(())
        }
        Command::Check { file } => check(&file),
        Command::Run => run(&settings).await,
    }
}

async fn record(store: &JsonFileStore, name: Option<String>, save: Option<String>) -> Result<()> {
    let recorder = Arc::new(Recorder::new(Arc::new(RdevKeySource), EventBus::default()));
    recorder.start().context("Failed to start recording")?;

    println!("{}", "● Recording. Press Enter or Ctrl+C to stop.".red().bold());

    let enter = wait_for_line(std::io::BufReader::new(std::io::stdin()))?;
    tokio::select! {
        _ = enter => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    let stopper = Arc::clone(&recorder);
    let mut sequence = tokio::task::spawn_blocking(move || stopper.stop()).await?;
    if let Some(name) = name {
        sequence.name = name;
    }

    print_sequence(&sequence);
    if let Some(target) = save {
        store.save(&sequence, &target)?;
        println!(
            "{} Saved as '{}' in {}",
            "✓".green(),
            target,
            store.dir().display()
        );
    }
    Ok(())
}

/// Resolves once `reader` yields a line or hits EOF.
///
/// The read runs on a detached thread so a pending read never holds up
/// runtime shutdown.
fn wait_for_line<R>(mut reader: R) -> Result<tokio::sync::oneshot::Receiver<()>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("stdin-line".into())
        .spawn(move || {
            let mut line = String::new();
            let _ = reader.read_line(&mut line);
            let _ = tx.send(());
        })
        .context("Failed to start stdin reader")?;
    Ok(rx)
}

async fn play(
    sequence: Sequence,
    playback: PlaybackSettings,
    countdown: Duration,
    dry_run: bool,
) -> Result<()> {
    let keyboard = VirtualKeyboard::new();
    let events = EventBus::default();
    let player = if dry_run {
        Player::new(Arc::new(keyboard.clone()), events.clone())
    } else {
        Player::new(Arc::new(RdevInjector), events.clone())
    };
    player.set_settings(playback);
    let player = Arc::new(player);

    let repeat = match playback.repeat() {
        RepeatMode::Count(n) => format!("{n}x"),
        RepeatMode::Forever => "forever".to_string(),
    };
    println!(
        "▶ Playing '{}' ({} keys, {}, {}ms spacing)",
        sequence.name.cyan(),
        sequence.key_press_count(),
        repeat,
        playback.inter_key_delay_ms()
    );

    let countdown_secs = countdown.as_secs();
    for remaining in (1..=countdown_secs).rev() {
        println!("  starting in {}...", remaining.to_string().yellow());
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    tokio::time::sleep(countdown - Duration::from_secs(countdown_secs)).await;

    let mut rx = events.subscribe();
    player.start(&sequence).context("Failed to start playback")?;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(EngineEvent::PlaybackProgress { current, total }) => {
                    println!("  repetition {current}/{total}");
                }
                Ok(EngineEvent::PlaybackStopped { completed }) => {
                    if completed {
                        println!("{} Playback finished", "✓".green());
                    } else {
                        println!("{} Playback stopped", "■".yellow());
                    }
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                let stopper = Arc::clone(&player);
                if !tokio::task::spawn_blocking(move || stopper.stop()).await? {
                    println!("{} Playback thread is still finishing", "!".yellow());
                }
            }
        }
    }

    if dry_run {
        for event in keyboard.injected() {
            let arrow = match event.kind {
                KeyEventKind::Down => "↓".green(),
                KeyEventKind::Up => "↑".dimmed(),
            };
            println!("  {} {}", arrow, keycode::display_name(event.key));
        }
    }
    Ok(())
}

fn list(store: &JsonFileStore) -> Result<()> {
    let summaries = store.list()?;
    if summaries.is_empty() {
        println!("No saved sequences in {}", store.dir().display());
        return Ok(());
    }
    println!("{}", format!("Saved sequences ({})", store.dir().display()).bold());
    for summary in summaries {
        println!(
            "  {:<30} {:>6} actions   {}",
            summary.name.cyan(),
            summary.action_count,
            summary
                .modified_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
                .dimmed()
        );
    }
    Ok(())
}

fn check(file: &Path) -> Result<()> {
    match import_script_file(file) {
        Ok(sequence) => {
            println!(
                "{} {} is valid ({} keys, {} delays)",
                "✓".green(),
                file.display(),
                sequence.key_press_count(),
                sequence
                    .actions()
                    .iter()
                    .filter(|a| a.kind == ActionKind::Delay)
                    .count()
            );
            Ok(())
        }
        Err(KsrError::Parse { kind, line }) => {
            println!(
                "{} {}:{}: {}",
                "✗".red(),
                file.display(),
                line,
                kind.to_string().red()
            );
            bail!("script has errors")
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", file.display())),
    }
}

async fn run(settings: &Settings) -> Result<()> {
    let events = EventBus::default();
    let mut engine = Engine::new(Arc::new(RdevKeySource), Arc::new(RdevInjector), events.clone());
    engine.apply_settings(settings);

    let dispatcher = HotkeyDispatcher::with_global_hotkeys(events.clone())
        .context("Failed to start the hotkey service")?;
    let mut rx = events.subscribe();
    engine
        .attach_hotkeys(dispatcher, settings)
        .context("Failed to register hotkeys")?;

    println!("{}", "Keystroke recorder is running".bold());
    println!(
        "  {} start/stop recording",
        binding_label(&settings.start_stop_hotkey)
    );
    println!("  {} play/stop playback", binding_label(&settings.play_hotkey));
    println!("  Ctrl+C to quit");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tokio::task::spawn_blocking(move || engine.shutdown()).await?;
    println!("Bye");
    Ok(())
}

fn binding_label(spec: &str) -> ColoredString {
    match keystroke_recorder::hotkey::normalize_hotkey(spec) {
        Ok(Some(normalized)) => normalized.yellow().bold(),
        _ => "(unbound)".dimmed(),
    }
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::RecordingStarted => println!("{}", "● Recording".red().bold()),
        EngineEvent::KeyRecorded(action) => {
            if let Some(key) = &action.key {
                println!("  {} {}", format!("{:>7.3}s", action.timestamp).dimmed(), key.display_name());
            }
        }
        EngineEvent::RecordingStopped { actions } => {
            println!("{} Recording stopped ({actions} actions)", "■".yellow());
        }
        EngineEvent::PlaybackStarted { repetitions } => match repetitions {
            Some(n) => println!("▶ Playing ({n}x)"),
            None => println!("▶ Playing (forever)"),
        },
        EngineEvent::PlaybackProgress { current, total } => {
            println!("  repetition {current}/{total}");
        }
        EngineEvent::PlaybackStopped { completed } => {
            if *completed {
                println!("{} Playback finished", "✓".green());
            } else {
                println!("{} Playback stopped", "■".yellow());
            }
        }
        EngineEvent::HotkeysChanged { active } => {
            if !active {
                println!("{} Hotkeys are inactive", "!".yellow());
            }
        }
        EngineEvent::Error(message) => println!("{} {}", "✗".red(), message),
    }
}

fn print_sequence(sequence: &Sequence) {
    println!(
        "{} '{}': {} actions, {} key presses, {:.2}s",
        "Sequence".bold(),
        sequence.name.cyan(),
        sequence.len(),
        sequence.key_press_count(),
        sequence.duration()
    );
}
