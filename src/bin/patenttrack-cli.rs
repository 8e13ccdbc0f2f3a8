//! PatentTrack CLI - USPTO application status tracker
//!
//! Provides command-line access to:
//! - Tracking and untracking applications
//! - On-demand and scheduled syncs against the USPTO API
//! - The stored prosecution event ledger
//! - API key management
//!
//! Usage:
//!   patenttrack-cli add <APP_NUMBER>
//!   patenttrack-cli sync [APP_NUMBER]
//!   patenttrack-cli watch [--interval <MINUTES>]
//!   patenttrack-cli key set <API_KEY>

use std::env;
use std::process::ExitCode;

use patenttrack::credentials::Credentials;
use patenttrack::db::Database;
use patenttrack::poller::{PollNotice, Poller, PollerConfig};
use patenttrack::sync::SyncEngine;
use patenttrack::uspto::{
    format_app_number, is_significant_event, UsptoClient, UsptoClientConfig,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const INTERVAL_SETTING: &str = "poll_interval_minutes";

#[derive(Debug)]
enum Command {
    Add { app_number: String },
    Remove { app_number: String },
    List,
    Events { app_number: String },
    Seen { app_number: String },
    Recent { days: u32, significant: bool },
    Sync { app_number: Option<String> },
    Watch { interval: Option<u64> },
    Key(KeyCommand),
    Help,
    Version,
}

#[derive(Debug)]
enum KeyCommand {
    Set { api_key: String },
    Clear,
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("patenttrack=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    match parse_args(&args) {
        Ok(cmd) => match run_command(cmd).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "version" | "--version" | "-V" => Ok(Command::Version),

        "add" => {
            let app_number = args.get(2).ok_or("Missing application number")?.clone();
            Ok(Command::Add { app_number })
        }
        "remove" => {
            let app_number = args.get(2).ok_or("Missing application number")?.clone();
            Ok(Command::Remove { app_number })
        }
        "list" => Ok(Command::List),
        "events" => {
            let app_number = args.get(2).ok_or("Missing application number")?.clone();
            Ok(Command::Events { app_number })
        }
        "seen" => {
            let app_number = args.get(2).ok_or("Missing application number")?.clone();
            Ok(Command::Seen { app_number })
        }
        "recent" => {
            let days = args
                .get(2)
                .filter(|a| !a.starts_with('-'))
                .and_then(|d| d.parse().ok())
                .unwrap_or(30);
            let significant = args.iter().any(|a| a == "--significant" || a == "-s");
            Ok(Command::Recent { days, significant })
        }
        "sync" => Ok(Command::Sync {
            app_number: args.get(2).cloned(),
        }),
        "watch" => {
            let interval = args
                .get(2)
                .filter(|a| *a == "--interval" || *a == "-i")
                .and_then(|_| args.get(3))
                .and_then(|n| n.parse().ok());
            Ok(Command::Watch { interval })
        }

        "key" => {
            if args.len() < 3 {
                return Err("Missing key subcommand. Use: set, clear, status".to_string());
            }
            match args[2].as_str() {
                "set" => {
                    let api_key = args.get(3).ok_or("Missing API key value")?.clone();
                    Ok(Command::Key(KeyCommand::Set { api_key }))
                }
                "clear" => Ok(Command::Key(KeyCommand::Clear)),
                "status" => Ok(Command::Key(KeyCommand::Status)),
                _ => Err(format!("Unknown key subcommand: {}", args[2])),
            }
        }

        _ => Err(format!("Unknown command: {}", args[1])),
    }
}

async fn run_command(cmd: Command) -> Result<(), String> {
    match cmd {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Version => {
            println!("patenttrack-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Add { app_number } => run_add(&app_number).await,
        Command::Remove { app_number } => run_remove(&app_number),
        Command::List => run_list(),
        Command::Events { app_number } => run_events(&app_number),
        Command::Seen { app_number } => run_seen(&app_number),
        Command::Recent { days, significant } => run_recent(days, significant),
        Command::Sync { app_number } => run_sync(app_number.as_deref()).await,
        Command::Watch { interval } => run_watch(interval).await,
        Command::Key(key_cmd) => run_key_command(key_cmd).await,
    }
}

fn print_help() {
    println!(
        r#"PatentTrack CLI - USPTO application status tracker

USAGE:
    patenttrack-cli <COMMAND> [OPTIONS]

COMMANDS:
    add <APP_NUMBER>        Track an application and run its first sync
    remove <APP_NUMBER>     Stop tracking an application
    list                    List tracked applications

    events <APP_NUMBER>     Show the stored event ledger, newest first
    seen <APP_NUMBER>       Mark all events of an application as seen
    recent [DAYS]           Show events from the last DAYS days (default: 30)
        --significant, -s   Only significant prosecution milestones

    sync [APP_NUMBER]       Sync one application, or all if none is given

    watch                   Poll all applications in the background
        --interval, -i      Minutes between syncs (persisted; default: 30)

    key set <API_KEY>       Store the USPTO API key in the system keychain
    key clear               Remove the stored API key
    key status              Check whether an API key is stored

    help                    Show this help message
    version                 Show version information

EXAMPLES:
    patenttrack-cli add 17/940,142
    patenttrack-cli sync
    patenttrack-cli recent 7 --significant
    patenttrack-cli watch --interval 60
"#
    );
}

fn open_database() -> Result<Database, String> {
    let path = Database::default_path().map_err(|e| e.to_string())?;
    let db = Database::new(path);
    db.initialize()
        .map_err(|e| format!("Failed to initialize database: {}", e))?;
    Ok(db)
}

fn build_engine() -> Result<SyncEngine<UsptoClient>, String> {
    let db = open_database()?;
    let client = UsptoClient::new(UsptoClientConfig::default()).map_err(|e| e.to_string())?;
    Ok(SyncEngine::new(db, client))
}

async fn run_add(app_number: &str) -> Result<(), String> {
    let engine = build_engine()?;
    let (_, outcome) = engine
        .track_new(app_number)
        .await
        .map_err(|e| e.to_string())?;

    println!(
        "Tracking {}: {}",
        format_app_number(app_number),
        outcome.metadata.title
    );
    println!("Status: {}", outcome.metadata.current_status);
    println!(
        "Events: {} ({} recorded)",
        outcome.total_events,
        outcome.new_events.len()
    );
    Ok(())
}

fn run_remove(app_number: &str) -> Result<(), String> {
    let db = open_database()?;
    let norm = patenttrack::uspto::normalize_app_number(app_number);
    let patent = db
        .get_patent(&norm)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Application not tracked: {}", format_app_number(&norm)))?;
    db.remove_patent(patent.id).map_err(|e| e.to_string())?;
    println!("Removed {}", format_app_number(&norm));
    Ok(())
}

fn run_list() -> Result<(), String> {
    let db = open_database()?;
    let patents = db.list_patents().map_err(|e| e.to_string())?;

    if patents.is_empty() {
        println!("No applications tracked. Use: patenttrack-cli add <APP_NUMBER>");
        return Ok(());
    }

    println!(
        "{:<12} {:<36} {:<28} {:<6}",
        "APP #", "TITLE", "STATUS", "NEW"
    );
    println!("{}", "-".repeat(84));
    for p in patents {
        let new_count = db.count_new_events(p.id).unwrap_or(0);
        let title: String = p.title.chars().take(34).collect();
        let status: String = p.current_status.chars().take(26).collect();
        println!(
            "{:<12} {:<36} {:<28} {:<6}",
            format_app_number(&p.app_number),
            title,
            status,
            if new_count > 0 {
                new_count.to_string()
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

fn run_events(app_number: &str) -> Result<(), String> {
    let db = open_database()?;
    let norm = patenttrack::uspto::normalize_app_number(app_number);
    let patent = db
        .get_patent(&norm)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Application not tracked: {}", format_app_number(&norm)))?;

    let events = db.events_for_patent(patent.id).map_err(|e| e.to_string())?;
    if events.is_empty() {
        println!("No events stored. Run: patenttrack-cli sync {}", norm);
        return Ok(());
    }

    for e in events {
        let marker = if e.is_new { "*" } else { " " };
        println!("{} {:<12} {:<8} {}", marker, e.date, e.code, e.description);
    }
    Ok(())
}

fn run_seen(app_number: &str) -> Result<(), String> {
    let db = open_database()?;
    let norm = patenttrack::uspto::normalize_app_number(app_number);
    let patent = db
        .get_patent(&norm)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Application not tracked: {}", format_app_number(&norm)))?;
    let cleared = db.mark_events_seen(patent.id).map_err(|e| e.to_string())?;
    println!("Marked {} events as seen", cleared);
    Ok(())
}

fn run_recent(days: u32, significant: bool) -> Result<(), String> {
    let db = open_database()?;
    let events = db.recent_events(days, None).map_err(|e| e.to_string())?;
    let events: Vec<_> = events
        .into_iter()
        .filter(|e| !significant || is_significant_event(&e.code))
        .collect();

    if events.is_empty() {
        println!("No events in the last {} days.", days);
        return Ok(());
    }
    for e in events {
        println!(
            "{:<12} {:<12} {:<8} {}",
            e.date,
            format_app_number(&e.app_number),
            e.code,
            e.description
        );
    }
    Ok(())
}

async fn run_sync(app_number: Option<&str>) -> Result<(), String> {
    let engine = build_engine()?;

    match app_number {
        Some(app) => {
            let outcome = engine.sync_record(app).await.map_err(|e| e.to_string())?;
            println!(
                "Synced {}: {} new of {} events",
                format_app_number(app),
                outcome.new_events.len(),
                outcome.total_events
            );
            for e in &outcome.new_events {
                println!("  {} {:<8} {}", e.date, e.code, e.description);
            }
        }
        None => {
            let batch = engine.sync_all().await.map_err(|e| e.to_string())?;
            println!(
                "Synced {} applications, {} new events, {} errors",
                batch.updated,
                batch.new_events.len(),
                batch.errors.len()
            );
            for n in &batch.new_events {
                println!(
                    "  {} {} {:<8} {}",
                    format_app_number(&n.app_number),
                    n.event.date,
                    n.event.code,
                    n.event.description
                );
            }
            for f in &batch.errors {
                eprintln!("  {} failed: {}", format_app_number(&f.app_number), f.error);
            }
            if !batch.success {
                return Err("every application failed to sync".to_string());
            }
        }
    }
    Ok(())
}

async fn run_watch(interval: Option<u64>) -> Result<(), String> {
    let engine = std::sync::Arc::new(build_engine()?);

    // A --interval flag becomes the new persisted default.
    let interval = match interval {
        Some(minutes) => {
            engine
                .db()
                .set_setting(INTERVAL_SETTING, &minutes.to_string())
                .map_err(|e| e.to_string())?;
            minutes
        }
        None => engine
            .db()
            .get_setting(INTERVAL_SETTING)
            .map_err(|e| e.to_string())?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(30),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let poller = Poller::new(engine, PollerConfig::default(), tx);
    poller.start(interval);
    println!("Polling every {} minutes. Press Ctrl-C to stop.", interval);

    loop {
        tokio::select! {
            notice = rx.recv() => match notice {
                Some(PollNotice::NewEvents(events)) => {
                    for n in events {
                        println!(
                            "{} {} {:<8} {}",
                            format_app_number(&n.app_number),
                            n.event.date,
                            n.event.code,
                            n.event.description
                        );
                    }
                }
                Some(PollNotice::Errors(errors)) => {
                    for f in errors {
                        eprintln!("{} failed: {}", format_app_number(&f.app_number), f.error);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Stopping...");
    poller.stop().await;
    if let Some(at) = poller.last_sync_time() {
        println!("Last sync: {}", at.to_rfc3339());
    }
    Ok(())
}

async fn run_key_command(cmd: KeyCommand) -> Result<(), String> {
    match cmd {
        KeyCommand::Set { api_key } => {
            let client =
                UsptoClient::new(UsptoClientConfig::default()).map_err(|e| e.to_string())?;
            if client.validate_api_key(&api_key).await {
                println!("API key validated against the USPTO API.");
            } else {
                eprintln!("Warning: could not validate the key (stored anyway).");
            }
            Credentials::store_api_key(&api_key).map_err(|e| e.to_string())?;
            println!("API key stored in the system keychain.");
            Ok(())
        }
        KeyCommand::Clear => {
            Credentials::delete_api_key().map_err(|e| e.to_string())?;
            println!("API key removed.");
            Ok(())
        }
        KeyCommand::Status => {
            if Credentials::has_api_key() {
                println!("An API key is stored.");
            } else {
                println!("No API key stored. Use: patenttrack-cli key set <API_KEY>");
            }
            Ok(())
        }
    }
}
