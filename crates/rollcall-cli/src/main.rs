use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::store::load_roster;
use rollcall_core::{
    cancel_pair, spawn_detector, AttendanceSheet, CancelToken, IdentityId, Orchestrator, Roster,
    SessionEvent, SessionState, TemplateStore,
};
use rollcall_store::SqliteTemplateStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod replay;

use config::Config;
use replay::Recording;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face enrollment and attendance matching")]
struct Cli {
    /// TOML file overriding ROLLCALL_* settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from a recorded capture session
    Enroll {
        /// Identity to enroll (re-enrolling replaces the stored template)
        #[arg(short, long)]
        identity: String,
        /// JSON recording of frames and detected faces
        #[arg(short, long)]
        replay: PathBuf,
    },
    /// Take attendance from a recorded class session
    Recognize {
        /// JSON recording of frames and detected faces
        #[arg(short, long)]
        replay: PathBuf,
        /// Flip these identities' status after scanning
        #[arg(long = "toggle")]
        toggle: Vec<String>,
        /// Roster to check (default: every enrolled identity)
        identities: Vec<String>,
    },
    /// List enrolled templates
    List,
    /// Print one template as JSON
    Show {
        identity: String,
    },
    /// Remove an enrolled template
    Remove {
        identity: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { identity, replay } => enroll(&config, identity, &replay).await,
        Commands::Recognize {
            replay,
            toggle,
            identities,
        } => recognize(&config, &replay, &identities, &toggle).await,
        Commands::List => {
            let store = open_store(&config).await?;
            let templates = store.list().await?;
            if templates.is_empty() {
                println!("No templates enrolled");
            }
            for t in templates {
                println!(
                    "{}\t{} dims\t{} captures\t{}",
                    t.identity_id,
                    t.descriptor.len(),
                    t.source_capture_count,
                    t.created_at.to_rfc3339()
                );
            }
            Ok(())
        }
        Commands::Show { identity } => {
            let store = open_store(&config).await?;
            let Some(template) = store.get(&IdentityId::new(identity.clone())).await? else {
                bail!("no template enrolled for {identity}");
            };
            println!("{}", serde_json::to_string_pretty(&template)?);
            Ok(())
        }
        Commands::Remove { identity } => {
            let store = open_store(&config).await?;
            if !store.remove(&IdentityId::new(identity.clone())).await? {
                bail!("no template enrolled for {identity}");
            }
            tracing::info!(identity = %identity, "template removed");
            println!("Removed {identity}");
            Ok(())
        }
        Commands::Config => {
            println!("db_path = {:?}", config.db_path.display().to_string());
            println!();
            println!("[session]");
            print!("{}", toml::to_string_pretty(&config.session)?);
            Ok(())
        }
    }
}

async fn open_store(config: &Config) -> Result<Arc<SqliteTemplateStore>> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(Arc::new(SqliteTemplateStore::open(&config.db_path).await?))
}

/// Cancel token tripped by Ctrl-C.
fn cancel_on_ctrl_c() -> CancelToken {
    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted; cancelling");
            handle.cancel();
        }
    });
    token
}

async fn orchestrator(config: &Config, recording: Recording) -> Result<(Orchestrator, replay::ReplayFrames)> {
    let store = open_store(config).await?;
    let (frames, detector) = recording.split();
    let detector = spawn_detector(detector)?;
    let orch = Orchestrator::new(config.session.clone(), Arc::new(detector), store)?;
    Ok((orch, frames))
}

async fn enroll(config: &Config, identity: String, replay: &std::path::Path) -> Result<()> {
    let recording = Recording::load(replay)?;
    let (orch, mut frames) = orchestrator(config, recording).await?;
    tracing::info!(identity = %identity, frames = frames.frame_count(), "enrolling from recording");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Prompt { text, .. } => eprintln!("> {text}"),
                SessionEvent::Captured { count, target } => eprintln!("  captured {count}/{target}"),
                SessionEvent::AttemptRejected { reason } => eprintln!("  retrying: {reason}"),
                SessionEvent::Started { .. } | SessionEvent::Finished { .. } => {}
            }
        }
    });

    let outcome = orch
        .enroll(IdentityId::new(identity), &mut frames, cancel_on_ctrl_c(), Some(tx))
        .await;
    // Sender went away with the session; drain what is left.
    let _ = progress.await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    match outcome.state {
        SessionState::Complete => Ok(()),
        SessionState::Failed(reason) => bail!("enrollment failed: {reason}"),
        other => bail!("enrollment ended in state {other:?}"),
    }
}

async fn recognize(
    config: &Config,
    replay: &std::path::Path,
    identities: &[String],
    toggle: &[String],
) -> Result<()> {
    let recording = Recording::load(replay)?;
    let (orch, mut frames) = orchestrator(config, recording).await?;

    let roster: Roster = if identities.is_empty() {
        orch.store().list().await?.into_iter().collect()
    } else {
        let ids: Vec<IdentityId> = identities.iter().cloned().map(IdentityId::new).collect();
        let (roster, missing) = load_roster(orch.store().as_ref(), &ids).await?;
        for id in &missing {
            tracing::warn!(identity = %id, "not enrolled; leaving off the roster");
        }
        roster
    };
    if roster.is_empty() {
        tracing::warn!("roster is empty; every face will be unknown");
    }

    let decisions = orch.scan_class(&mut frames, &roster, cancel_on_ctrl_c()).await?;
    let mut sheet = AttendanceSheet::from_decisions(&roster, &decisions);
    for id in toggle {
        if sheet.toggle(&IdentityId::new(id.clone())).is_none() {
            tracing::warn!(identity = %id, "cannot toggle; not on the roster");
        }
    }

    tracing::info!(
        present = sheet.present_count(),
        absent = sheet.absent_count(),
        unknown = sheet.unknown_faces,
        "attendance taken"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "present": sheet.present_count(),
            "absent": sheet.absent_count(),
            "total": sheet.total(),
            "sheet": sheet,
            "decisions": decisions,
        }))?
    );
    Ok(())
}
