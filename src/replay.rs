//! Recorded session input: a roster file and a JSON-lines stream of frames
//! with their pose and face observations already extracted.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use log::warn;
use serde::Deserialize;

use crate::detection::PersonObservation;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::identify::FaceObservation;
use crate::roster::StudentRecord;
use crate::session::{FrameReport, Session};

/// Course information sent at the start of a session.
#[derive(Debug, Clone, Deserialize)]
pub struct RosterFile {
    pub date: String,
    #[serde(default)]
    pub course_id: u64,
    #[serde(default = "default_session_count")]
    pub session_count: u64,
    pub students: Vec<StudentRecord>,
}

fn default_session_count() -> u64 {
    1
}

impl RosterFile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayFrame {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub persons: Vec<PersonObservation>,
    #[serde(default)]
    pub faces: Vec<FaceObservation>,
}

impl ReplayFrame {
    pub fn into_parts(self) -> (Frame, Vec<PersonObservation>) {
        (Frame::annotated(self.width, self.height, self.faces), self.persons)
    }
}

/// Iterates the frames of a JSON-lines stream, skipping blank lines.
pub struct ReplayReader<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl<R: BufRead> ReplayReader<R> {
    pub fn new(reader: R) -> Self {
        ReplayReader { lines: reader.lines(), line_no: 0 }
    }
}

impl ReplayReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> Iterator for ReplayReader<R> {
    type Item = Result<ReplayFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| {
                Error::InvalidFrame(format!("line {}: {}", self.line_no, e))
            }));
        }
    }
}

/// Feed every well-formed frame of `frames` through `session`.
///
/// Malformed frames are logged and skipped without touching the session, so
/// they do not advance the frame count. Read errors abort the replay.
/// Returns the number of frames processed.
pub fn replay_into<I, F>(session: &mut Session, frames: I, mut on_report: F) -> Result<usize>
where
    I: IntoIterator<Item = Result<ReplayFrame>>,
    F: FnMut(&FrameReport) -> Result<()>,
{
    let mut processed = 0;
    for item in frames {
        let replay_frame = match item {
            Ok(frame) => frame,
            Err(Error::InvalidFrame(msg)) => {
                warn!("Skipping frame: {}", msg);
                continue;
            }
            Err(e) => return Err(e),
        };
        let (frame, persons) = replay_frame.into_parts();
        let report = session.process_frame(frame, &persons)?;
        on_report(&report)?;
        processed += 1;
    }
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const FRAME: &str = r#"{"width":640,"height":480,
        "persons":[{"keypoints":[[90,120,0.9],[0,0,0],[0,0,0],[0,0,0],[0,0,0],[100,200,0.9],[0,0,0],[120,150,0.9],[0,0,0],[125,90,0.9],[0,0,0]],
                    "bbox":[20.7,40.2,180.9,400.0]}],
        "faces":[{"bbox":[60,90,120,150],"embedding":[0.1,0.2]}]}"#;

    #[test]
    fn test_reads_frames_and_skips_blank_lines() {
        let input = format!("{}\n\n{}\n", FRAME.replace('\n', ""), FRAME.replace('\n', ""));
        let frames: Vec<_> = ReplayReader::new(Cursor::new(input)).collect::<Result<_>>().unwrap();
        assert_eq!(frames.len(), 2);

        let (frame, persons) = frames[0].clone().into_parts();
        assert_eq!((frame.width(), frame.height()), (640, 480));
        assert_eq!(frame.faces().len(), 1);
        assert_eq!(persons[0].bbox, crate::detection::BBox::new(20, 40, 180, 400));
        assert_eq!(persons[0].keypoints[9].y, 90.0);
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let input = "\n{\"width\": 1}\n";
        let err = ReplayReader::new(Cursor::new(input)).next().unwrap().unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(msg) if msg.starts_with("line 2")));
    }

    #[test]
    fn test_malformed_frame_skipped_without_advancing() {
        let frame = FRAME.replace('\n', "");
        let input = format!("{}\n{{\"width\": \"wide\"}}\nnot json\n{}\n", frame, frame);
        let students = vec![StudentRecord {
            id: "1".into(),
            name: "Ada".into(),
            email: String::new(),
            template: Some(vec![0.1, 0.2]),
        }];
        let info = crate::session::SessionInfo { course_id: 1, session_count: 1, date: "2024-05-02".into() };
        let mut session =
            Session::new(crate::config::Config::default(), info, &students, crate::session::Collaborators::default())
                .unwrap();

        let mut indices = Vec::new();
        let processed = replay_into(&mut session, ReplayReader::new(Cursor::new(input)), |report| {
            indices.push(report.frame_index);
            Ok(())
        })
        .unwrap();

        assert_eq!(processed, 2);
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(session.frame_count(), 2);
        session.finish().unwrap();
    }

    #[test]
    fn test_replay_stops_on_read_error() {
        let mut session = Session::new(
            crate::config::Config::default(),
            crate::session::SessionInfo { course_id: 1, session_count: 1, date: "d".into() },
            &[StudentRecord { id: "1".into(), name: "Ada".into(), email: String::new(), template: None }],
            crate::session::Collaborators::default(),
        )
        .unwrap();
        let frames = vec![Err(Error::Io(std::io::Error::other("disk gone")))];
        let result = replay_into(&mut session, frames, |_| Ok(()));
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(session.frame_count(), 0);
    }

    #[test]
    fn test_roster_file_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"date":"2024-05-02","students":[{{"id":"1","name":"Ada"}}]}}"#).unwrap();
        let roster = RosterFile::from_file(file.path()).unwrap();
        assert_eq!(roster.session_count, 1);
        assert_eq!(roster.course_id, 0);
        assert_eq!(roster.students[0].template, None);
    }
}
