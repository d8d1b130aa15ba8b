use std::path::PathBuf;

use clap::Parser;
use handraise::geometry::{self, ArmGates};
use handraise::keypoint::{FilteredPose, KeypointFilter};
use handraise::replay::ReplayReader;

/// Print the arm-raise geometry of every person in a replay stream.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// JSON-lines stream of frames
    #[arg(long)]
    frames: PathBuf,
    /// Keypoint confidence cutoff
    #[arg(long, default_value_t = 0.60)]
    threshold: f32,
}

fn describe(gates: Option<ArmGates>) -> String {
    match gates {
        Some(g) => format!(
            "elbow={} shoulder={:.1} raised={}",
            g.elbow_angle.map_or("n/a".to_string(), |a| format!("{:.1}", a)),
            g.shoulder_angle,
            g.raised()
        ),
        None => "incomplete".to_string(),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let filter = KeypointFilter::new(args.threshold);

    for (frame_idx, item) in ReplayReader::open(&args.frames)?.enumerate() {
        let frame = item?;
        for (person_idx, person) in frame.persons.iter().enumerate() {
            let pose = FilteredPose::from_keypoints(&person.keypoints, &filter);
            let analysis = geometry::analyze(&pose);
            println!(
                "frame {} person {} face={:?} left[{}] right[{}] signal={:?}",
                frame_idx + 1,
                person_idx,
                analysis.face_center.map(|p| (p.x, p.y)),
                describe(analysis.left),
                describe(analysis.right),
                analysis.signal,
            );
        }
    }
    Ok(())
}
