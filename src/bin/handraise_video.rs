use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use handraise::clock::SystemClock;
use handraise::detection::TorchPoseEstimator;
use handraise::opencv_backend::{self, OpenCvFaceAnalyzer};
use handraise::persistence::{AttendanceLedger, MemoryLedger, SqliteLedger};
use handraise::replay::RosterFile;
use handraise::roster::MemoryRosterStore;
use handraise::visualization;
use handraise::{Collaborators, Config, Session, SessionInfo};
use log::{info, warn};
use opencv::{
    core::Size,
    highgui,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};

#[derive(Parser)]
#[command(
    name = "handraise_video",
    about = "Run the hand-raise tracker on a video with pose and face models",
    version
)]
struct Args {
    /// Path to video file
    #[arg(short, long)]
    input: PathBuf,

    /// Roster JSON with face templates
    #[arg(short, long)]
    roster: PathBuf,

    /// Path to configuration file (model paths are read from here)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Annotated output video (.mp4)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Show frames in a window
    #[arg(short, long)]
    visualize: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let roster = RosterFile::from_file(&args.roster)?;

    let pose_model = config.pose_model_path.clone().ok_or_else(|| anyhow!("pose_model_path is not set"))?;
    let face_detector = config.face_detector_path.clone().ok_or_else(|| anyhow!("face_detector_path is not set"))?;
    let face_recognizer = config
        .face_recognizer_path
        .clone()
        .ok_or_else(|| anyhow!("face_recognizer_path is not set"))?;

    let estimator = TorchPoseEstimator::new(&pose_model, &config.device, (640, 640))?;
    let analyzer = OpenCvFaceAnalyzer::new(&face_detector, &face_recognizer)?;
    let ledger: Arc<dyn AttendanceLedger> = match &config.database_path {
        Some(path) => Arc::new(SqliteLedger::open(path)?),
        None => Arc::new(MemoryLedger::new()),
    };

    let collaborators = Collaborators {
        store: Arc::new(MemoryRosterStore::new()),
        analyzer: Arc::new(analyzer),
        ledger,
        clock: Box::new(SystemClock),
    };
    let info = SessionInfo {
        course_id: roster.course_id,
        session_count: roster.session_count,
        date: roster.date.clone(),
    };
    let mut session = Session::new(config, info, &roster.students, collaborators)?;

    let mut cap = VideoCapture::from_file(&args.input.to_string_lossy(), videoio::CAP_ANY)?;
    if !cap.is_opened()? {
        return Err(anyhow!("Failed to open video file: {:?}", args.input));
    }
    let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
    let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
    let fps = cap.get(videoio::CAP_PROP_FPS)?;

    let mut writer = match &args.output {
        Some(path) => {
            let fourcc = VideoWriter::fourcc('a', 'v', 'c', '1')?;
            let writer = VideoWriter::new(&path.to_string_lossy(), fourcc, fps, Size::new(width, height), true)?;
            if !writer.is_opened()? {
                warn!("Failed to open video writer at {:?}", path);
                None
            } else {
                Some(writer)
            }
        }
        None => None,
    };
    if args.visualize {
        highgui::named_window("handraise", highgui::WINDOW_NORMAL)?;
        highgui::resize_window("handraise", width, height)?;
    }

    let mut mat = Mat::default();
    while cap.read(&mut mat)? {
        if mat.empty() {
            break;
        }
        let frame = match opencv_backend::mat_to_frame(&mat) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Skipping frame: {}", e);
                continue;
            }
        };
        let report = session.process_with(frame, &estimator)?;

        if writer.is_some() || args.visualize {
            visualization::draw_candidates(&mut mat, &report.candidates)?;
            visualization::draw_frame_info(&mut mat, report.frame_index, report.candidates.len())?;
        }
        if let Some(writer) = writer.as_mut() {
            writer.write(&mat)?;
        }
        if args.visualize {
            highgui::imshow("handraise", &mat)?;
            if highgui::wait_key(1)? == 27 {
                break;
            }
        }
    }

    info!("Processed {} frames", session.frame_count());
    let entries = session.finish()?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}
