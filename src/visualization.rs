use opencv::{
    core::{Point, Rect, Scalar},
    imgproc,
    prelude::*,
};

use crate::track::{CandidateState, DetectionRecord, Resolution};

/// BGR colour for a candidate's lifecycle state.
pub fn state_color(state: &CandidateState) -> Scalar {
    match state {
        CandidateState::Tracking { .. } => Scalar::new(0.0, 255.0, 255.0, 0.0), // Yellow
        CandidateState::AwaitingIdentification { .. } => Scalar::new(0.0, 165.0, 255.0, 0.0), // Orange
        CandidateState::Identified
        | CandidateState::Completed { outcome: Resolution::Identified } => Scalar::new(0.0, 255.0, 0.0, 0.0),
        CandidateState::Rejected
        | CandidateState::Completed { outcome: Resolution::NotAStudent } => Scalar::new(0.0, 0.0, 255.0, 0.0),
    }
}

fn label(record: &DetectionRecord) -> String {
    match record.arm_raised_counter() {
        Some(counter) => format!("{} raise {}", record.id, counter),
        None if record.face_scanned() => format!("{} student", record.id),
        None => format!("{} unknown", record.id),
    }
}

pub fn draw_candidate(frame: &mut Mat, record: &DetectionRecord) -> opencv::Result<()> {
    let color = state_color(&record.state);
    let b = record.bbox;
    let rect = Rect::new(b.x_min, b.y_min, b.width(), b.height());
    imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_8, 0)?;

    let text = label(record);
    let mut baseline = 0;
    let text_size = imgproc::get_text_size(&text, imgproc::FONT_HERSHEY_SIMPLEX, 0.5, 1, &mut baseline)?;
    let bg_rect = Rect::new(
        b.x_min,
        b.y_min.saturating_sub(text_size.height + 5),
        text_size.width,
        text_size.height + 5,
    );
    imgproc::rectangle(frame, bg_rect, Scalar::new(0.0, 0.0, 0.0, 0.0), -1, imgproc::LINE_8, 0)?;
    imgproc::put_text(
        frame,
        &text,
        Point::new(b.x_min, b.y_min.saturating_sub(5)),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        color,
        1,
        imgproc::LINE_8,
        false,
    )?;

    if let Some(face) = record.face_center {
        imgproc::circle(frame, Point::new(face.x, face.y), 4, color, -1, imgproc::LINE_8, 0)?;
    }
    Ok(())
}

pub fn draw_candidates(frame: &mut Mat, records: &[DetectionRecord]) -> opencv::Result<()> {
    for record in records {
        draw_candidate(frame, record)?;
    }
    Ok(())
}

pub fn draw_frame_info(frame: &mut Mat, frame_id: u64, active: usize) -> opencv::Result<()> {
    let text = format!("Frame: {} Candidates: {}", frame_id, active);
    imgproc::put_text(
        frame,
        &text,
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.6,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
        2,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}
