//! Angle-based raised-arm classifier.
//!
//! All thresholds are hand-tuned constants in degrees. The right side mirrors
//! the left side: horizontal comparisons flip and shoulder-angle bounds change
//! sign.

use nalgebra::Vector2;
use serde::Serialize;

use crate::keypoint::{Arm, FilteredPose, Point, Side};

/// Elbow angles above this are treated as a straight-ish, non-raised arm.
const MAX_ELBOW_ANGLE: f64 = 130.0;
const WRIST_OVER_HEAD_ELBOW_ANGLE: f64 = 70.0;
const WRIST_ELBOW_SIDE_ELBOW_ANGLE: f64 = 50.0;
const ANGLED_OUTSIDE_SHOULDER_BOUND: f64 = 60.0;
const LOWER_BENT_SHOULDER_BOUND: f64 = 70.0;
const UPPER_BENT_SHOULDER_BOUND: f64 = 50.0;
const MAX_SHOULDER_BOUND: f64 = 100.0;

/// Integer mean of all present facial points, `None` when none are present.
pub fn face_center(points: &[Option<Point>]) -> Option<Point> {
    let (sum_x, sum_y, count) = points
        .iter()
        .flatten()
        .fold((0i64, 0i64, 0i64), |(sx, sy, n), p| {
            (sx + i64::from(p.x), sy + i64::from(p.y), n + 1)
        });
    if count == 0 {
        return None;
    }
    Some(Point::new(
        sum_x.div_euclid(count) as i32,
        sum_y.div_euclid(count) as i32,
    ))
}

/// Angle in degrees between the shoulder→elbow and elbow→wrist vectors.
///
/// Returns `None` if either vector has zero length.
pub fn elbow_angle(upper: Vector2<f64>, lower: Vector2<f64>) -> Option<f64> {
    let magnitude = upper.norm() * lower.norm();
    if magnitude == 0.0 {
        return None;
    }
    let cos = (upper.dot(&lower) / magnitude).clamp(-1.0, 1.0);
    Some(cos.acos().to_degrees())
}

/// Signed lean of the wrist relative to the shoulder, in `[-180, 180]`.
/// Zero means the wrist is straight above the shoulder.
pub fn shoulder_angle(shoulder: Point, wrist: Point) -> f64 {
    let dx = f64::from(wrist.x) - f64::from(shoulder.x);
    let dy = f64::from(shoulder.y) - f64::from(wrist.y);
    dx.atan2(dy).to_degrees()
}

fn vector(from: Point, to: Point) -> Vector2<f64> {
    Vector2::new(f64::from(to.x) - f64::from(from.x), f64::from(to.y) - f64::from(from.y))
}

/// Intermediate values of the classifier, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ArmGates {
    pub elbow_angle: Option<f64>,
    pub shoulder_angle: f64,
    pub accepted_angles: bool,
    pub wrist_over_shoulder: bool,
    pub lower_bent_arm: bool,
    pub upper_bent_arm: bool,
    pub wrist_over_face: bool,
    pub wrist_over_head: bool,
    pub wrist_elbow_side_of_shoulder: bool,
    pub angled_outside_arm: bool,
    pub diagonal_arm: bool,
    pub within_shoulder_bound: bool,
}

impl ArmGates {
    pub fn raised(&self) -> bool {
        self.diagonal_arm
            && self.accepted_angles
            && self.wrist_over_shoulder
            && self.wrist_over_head
            && self.wrist_elbow_side_of_shoulder
            && self.within_shoulder_bound
            && self.wrist_over_face
    }
}

/// Evaluate every gate for one arm. `None` when a joint is missing.
pub fn arm_gates(arm: &Arm, face_center: Option<Point>, side: Side) -> Option<ArmGates> {
    let (shoulder, elbow, wrist) = (arm.shoulder?, arm.elbow?, arm.wrist?);

    let elbow_angle = elbow_angle(vector(shoulder, elbow), vector(elbow, wrist));
    let shoulder_angle = shoulder_angle(shoulder, wrist);

    // NaN-like: a degenerate elbow angle fails every angle comparison
    let angle_at_least = |bound: f64| elbow_angle.is_some_and(|a| a >= bound);

    let accepted_angles = elbow_angle.is_some_and(|a| (0.0..=MAX_ELBOW_ANGLE).contains(&a));
    let wrist_over_shoulder = wrist.y < elbow.y;
    let lower_bent_arm = shoulder.y < elbow.y && elbow.y > wrist.y;
    let upper_bent_arm = shoulder.y > elbow.y && elbow.y > wrist.y;
    let wrist_over_face = face_center.is_some_and(|c| wrist.y < c.y);

    // Horizontal "outward" direction: +x for the left arm, -x for the right.
    let outward = |a: i32, b: i32| match side {
        Side::Left => a < b,
        Side::Right => a > b,
    };
    // Shoulder-angle bound in the same orientation.
    let within = |bound: f64| match side {
        Side::Left => shoulder_angle <= bound,
        Side::Right => shoulder_angle >= -bound,
    };

    let wrist_over_head =
        !(outward(wrist.x, shoulder.x) && angle_at_least(WRIST_OVER_HEAD_ELBOW_ANGLE));
    let wrist_elbow_side_of_shoulder = !(outward(wrist.x, elbow.x)
        && outward(elbow.x, shoulder.x)
        && angle_at_least(WRIST_ELBOW_SIDE_ELBOW_ANGLE));
    let angled_outside_arm = outward(shoulder.x, elbow.x) && outward(elbow.x, wrist.x);
    let diagonal_arm = (angled_outside_arm && within(ANGLED_OUTSIDE_SHOULDER_BOUND))
        || (lower_bent_arm && within(LOWER_BENT_SHOULDER_BOUND))
        || (upper_bent_arm && within(UPPER_BENT_SHOULDER_BOUND));

    Some(ArmGates {
        elbow_angle,
        shoulder_angle,
        accepted_angles,
        wrist_over_shoulder,
        lower_bent_arm,
        upper_bent_arm,
        wrist_over_face,
        wrist_over_head,
        wrist_elbow_side_of_shoulder,
        angled_outside_arm,
        diagonal_arm,
        within_shoulder_bound: within(MAX_SHOULDER_BOUND),
    })
}

/// Whether `arm` is raised. Absent joints fail closed.
pub fn is_arm_raised(arm: &Arm, face_center: Option<Point>, side: Side) -> bool {
    arm_gates(arm, face_center, side).is_some_and(|g| g.raised())
}

/// Combined per-person arm signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmSignal {
    Neither,
    Left,
    Right,
    Both,
}

impl ArmSignal {
    pub fn from_sides(left: bool, right: bool) -> Self {
        match (left, right) {
            (false, false) => ArmSignal::Neither,
            (true, false) => ArmSignal::Left,
            (false, true) => ArmSignal::Right,
            (true, true) => ArmSignal::Both,
        }
    }

    /// Exactly one arm up. Two raised arms count as no signal.
    pub fn is_active(&self) -> bool {
        matches!(self, ArmSignal::Left | ArmSignal::Right)
    }
}

/// Geometry derived from one person's filtered pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoseAnalysis {
    pub face_center: Option<Point>,
    pub left: Option<ArmGates>,
    pub right: Option<ArmGates>,
    pub signal: ArmSignal,
}

pub fn analyze(pose: &FilteredPose) -> PoseAnalysis {
    let center = face_center(&pose.face);
    let left = arm_gates(&pose.left_arm, center, Side::Left);
    let right = arm_gates(&pose.right_arm, center, Side::Right);
    let signal = ArmSignal::from_sides(
        left.is_some_and(|g| g.raised()),
        right.is_some_and(|g| g.raised()),
    );
    PoseAnalysis { face_center: center, left, right, signal }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn arm(s: (i32, i32), e: (i32, i32), w: (i32, i32)) -> Arm {
        Arm {
            shoulder: Some(Point::new(s.0, s.1)),
            elbow: Some(Point::new(e.0, e.1)),
            wrist: Some(Point::new(w.0, w.1)),
        }
    }

    fn mirror(arm: &Arm, axis: i32) -> Arm {
        let m = |p: Option<Point>| p.map(|p| Point::new(2 * axis - p.x, p.y));
        Arm { shoulder: m(arm.shoulder), elbow: m(arm.elbow), wrist: m(arm.wrist) }
    }

    #[test]
    fn test_face_center_empty_is_absent() {
        assert_eq!(face_center(&[None, None, None, None, None]), None);
        assert_eq!(face_center(&[]), None);
    }

    #[test]
    fn test_face_center_integer_mean_order_independent() {
        let a = [Some(Point::new(10, 10)), None, Some(Point::new(13, 21)), Some(Point::new(1, 0)), None];
        let b = [None, Some(Point::new(1, 0)), None, Some(Point::new(13, 21)), Some(Point::new(10, 10))];
        assert_eq!(face_center(&a), Some(Point::new(8, 10)));
        assert_eq!(face_center(&a), face_center(&b));
    }

    #[test]
    fn test_elbow_angle_range() {
        let right = elbow_angle(Vector2::new(1.0, 0.0), Vector2::new(0.0, 1.0)).unwrap();
        assert_relative_eq!(right, 90.0, epsilon = 1e-9);
        let straight = elbow_angle(Vector2::new(3.0, 4.0), Vector2::new(6.0, 8.0)).unwrap();
        assert_relative_eq!(straight, 0.0, epsilon = 1e-6);
        let folded = elbow_angle(Vector2::new(3.0, 4.0), Vector2::new(-6.0, -8.0)).unwrap();
        assert_relative_eq!(folded, 180.0, epsilon = 1e-6);
        assert_eq!(elbow_angle(Vector2::zeros(), Vector2::new(1.0, 1.0)), None);

        for (x1, y1, x2, y2) in [(5.0, -3.0, -2.0, 7.0), (-1.0, -1.0, -1.0, 2.0), (100.0, 1.0, 1.0, -100.0)] {
            let a = elbow_angle(Vector2::new(x1, y1), Vector2::new(x2, y2)).unwrap();
            assert!((0.0..=180.0).contains(&a));
        }
    }

    #[test]
    fn test_shoulder_angle_sign_and_range() {
        let s = Point::new(100, 100);
        assert_relative_eq!(shoulder_angle(s, Point::new(100, 50)), 0.0);
        assert_relative_eq!(shoulder_angle(s, Point::new(150, 50)), 45.0, epsilon = 1e-9);
        assert_relative_eq!(shoulder_angle(s, Point::new(50, 50)), -45.0, epsilon = 1e-9);
        assert_relative_eq!(shoulder_angle(s, Point::new(100, 150)), 180.0, epsilon = 1e-9);
        for (x, y) in [(0, 0), (200, 200), (0, 200), (101, 99)] {
            let a = shoulder_angle(s, Point::new(x, y));
            assert!((-180.0..=180.0).contains(&a));
        }
    }

    #[test]
    fn test_missing_joint_is_never_raised() {
        let full = arm((100, 200), (120, 150), (125, 90));
        let face = Some(Point::new(90, 120));
        assert!(is_arm_raised(&full, face, Side::Left));

        for side in [Side::Left, Side::Right] {
            let mut a = full;
            a.shoulder = None;
            assert!(!is_arm_raised(&a, face, side));
            let mut a = full;
            a.elbow = None;
            assert!(!is_arm_raised(&a, face, side));
            let mut a = full;
            a.wrist = None;
            assert!(!is_arm_raised(&a, face, side));
        }
    }

    #[test]
    fn test_upright_left_arm_raised() {
        // shoulder below elbow below wrist, slightly outward
        let a = arm((100, 200), (120, 150), (125, 90));
        let gates = arm_gates(&a, Some(Point::new(90, 120)), Side::Left).unwrap();
        assert!(gates.angled_outside_arm);
        assert!(gates.upper_bent_arm);
        assert!(gates.accepted_angles);
        assert!(gates.raised());
    }

    #[test]
    fn test_wrist_below_face_not_raised() {
        let a = arm((100, 200), (120, 150), (125, 90));
        assert!(!is_arm_raised(&a, Some(Point::new(90, 80)), Side::Left));
        assert!(!is_arm_raised(&a, None, Side::Left));
    }

    #[test]
    fn test_hanging_arm_not_raised() {
        let a = arm((100, 100), (105, 160), (108, 220));
        assert!(!is_arm_raised(&a, Some(Point::new(90, 60)), Side::Left));
        assert!(!is_arm_raised(&mirror(&a, 100), Some(Point::new(110, 60)), Side::Right));
    }

    #[test]
    fn test_mirror_symmetry() {
        let arms = [
            arm((100, 200), (120, 150), (125, 90)),
            arm((100, 200), (140, 210), (150, 120)),
            arm((100, 200), (90, 150), (95, 80)),
            arm((100, 200), (160, 170), (230, 120)),
            arm((100, 200), (110, 120), (80, 60)),
            arm((100, 100), (105, 160), (108, 220)),
        ];
        let faces = [Some(Point::new(80, 110)), Some(Point::new(80, 40)), None];
        let axis = 90;
        for a in &arms {
            for face in faces {
                let mirrored_face = face.map(|p| Point::new(2 * axis - p.x, p.y));
                let m = mirror(a, axis);
                assert_eq!(
                    is_arm_raised(a, face, Side::Left),
                    is_arm_raised(&m, mirrored_face, Side::Right),
                    "left {:?} vs mirrored right",
                    a
                );
                assert_eq!(
                    is_arm_raised(a, face, Side::Right),
                    is_arm_raised(&m, mirrored_face, Side::Left),
                    "right {:?} vs mirrored left",
                    a
                );
            }
        }
    }

    #[test]
    fn test_extreme_keypoints_do_not_overflow() {
        let wide = arm((-2_000_000_000, 200), (0, 150), (2_000_000_000, 200));
        assert!(!is_arm_raised(&wide, Some(Point::new(0, 120)), Side::Left));
        assert!(!is_arm_raised(&wide, Some(Point::new(0, 120)), Side::Right));
        assert_relative_eq!(shoulder_angle(Point::new(-2_000_000_000, 0), Point::new(2_000_000_000, 0)), 90.0);

        let tall = arm((0, i32::MAX), (0, 0), (0, i32::MIN));
        let gates = arm_gates(&tall, Some(Point::new(0, 0)), Side::Left).unwrap();
        assert!(gates.shoulder_angle.is_finite());
        assert_relative_eq!(gates.elbow_angle.unwrap(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_arm_signal() {
        assert!(ArmSignal::from_sides(true, false).is_active());
        assert!(ArmSignal::from_sides(false, true).is_active());
        assert!(!ArmSignal::from_sides(true, true).is_active());
        assert!(!ArmSignal::from_sides(false, false).is_active());
        assert_eq!(ArmSignal::from_sides(true, true), ArmSignal::Both);
    }
}
