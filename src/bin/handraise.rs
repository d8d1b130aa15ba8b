use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use handraise::clock::SystemClock;
use handraise::identify::PrecomputedFaces;
use handraise::persistence::{AttendanceLedger, MemoryLedger, SqliteLedger};
use handraise::replay::{self, ReplayReader, RosterFile};
use handraise::roster::MemoryRosterStore;
use handraise::{Collaborators, Config, Session, SessionInfo};
use log::info;

#[derive(Parser)]
#[command(
    name = "handraise",
    about = "Replay a recorded class session through the hand-raise tracker",
    version
)]
struct Args {
    /// Roster JSON: {"date", "course_id", "session_count", "students": [...]}
    #[arg(short, long)]
    roster: PathBuf,

    /// JSON-lines stream of frames with pose and face observations
    #[arg(short, long)]
    frames: PathBuf,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database for attendance (overrides the config)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Print one JSON report per frame
    #[arg(short, long)]
    telemetry: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    let roster = RosterFile::from_file(&args.roster)
        .with_context(|| format!("loading roster {}", args.roster.display()))?;

    let database = args
        .database
        .clone()
        .or_else(|| config.database_path.as_ref().map(PathBuf::from));
    let ledger: Arc<dyn AttendanceLedger> = match database {
        Some(path) => Arc::new(SqliteLedger::open(&path)?),
        None => Arc::new(MemoryLedger::new()),
    };

    let collaborators = Collaborators {
        store: Arc::new(MemoryRosterStore::new()),
        analyzer: Arc::new(PrecomputedFaces),
        ledger,
        clock: Box::new(SystemClock),
    };
    let info = SessionInfo {
        course_id: roster.course_id,
        session_count: roster.session_count,
        date: roster.date.clone(),
    };
    let mut session = Session::new(config, info, &roster.students, collaborators)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let telemetry = args.telemetry;
    let processed = replay::replay_into(&mut session, ReplayReader::open(&args.frames)?, |report| {
        if telemetry {
            serde_json::to_writer(&mut out, report)?;
            writeln!(out)?;
        }
        Ok(())
    })?;

    info!("Processed {} frames", processed);
    let entries = session.finish()?;
    serde_json::to_writer_pretty(&mut out, &entries)?;
    writeln!(out)?;
    Ok(())
}
