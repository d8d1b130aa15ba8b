use crate::detection::BBox;

/// Perform non-max suppression on boxes & scores, return indices to keep.
pub fn nms(boxes: &[BBox], scores: &[f32], iou_thresh: f32) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..boxes.len()).collect();
    idxs.sort_unstable_by(|&i, &j| scores[j].total_cmp(&scores[i]));
    let mut keep = Vec::new();
    while let Some(&i) = idxs.first() {
        keep.push(i);
        idxs = idxs
            .into_iter()
            .skip(1)
            .filter(|&j| compute_iou(&boxes[i], &boxes[j]) < iou_thresh)
            .collect();
    }
    keep
}

/// IoU between two corner-format boxes. Degenerate unions yield 0.
pub fn compute_iou(a: &BBox, b: &BBox) -> f32 {
    let x1 = a.x_min.max(b.x_min);
    let y1 = a.y_min.max(b.y_min);
    let x2 = a.x_max.min(b.x_max);
    let y2 = a.y_max.min(b.y_max);

    let extent = |lo: i32, hi: i32| (f64::from(hi) - f64::from(lo)).max(0.0);
    let area = |b: &BBox| extent(b.x_min, b.x_max) * extent(b.y_min, b.y_max);

    let inter_area = extent(x1, x2) * extent(y1, y2);
    let union = area(a) + area(b) - inter_area;

    if union <= 0.0 {
        return 0.0;
    }

    (inter_area / union) as f32
}

/// Squared Euclidean distance between two pixel points.
pub fn distance_sq(a: crate::keypoint::Point, b: crate::keypoint::Point) -> i64 {
    let dx = i64::from(a.x) - i64::from(b.x);
    let dy = i64::from(a.y) - i64::from(b.y);
    dx.saturating_mul(dx).saturating_add(dy.saturating_mul(dy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_iou() {
        let a = BBox::new(0, 0, 10, 10);
        let b = BBox::new(5, 0, 15, 10);
        assert_relative_eq!(compute_iou(&a, &a), 1.0);
        assert_relative_eq!(compute_iou(&a, &b), 50.0 / 150.0);
        assert_eq!(compute_iou(&a, &BBox::new(20, 20, 30, 30)), 0.0);
        assert_eq!(compute_iou(&BBox::new(3, 3, 3, 3), &BBox::new(3, 3, 3, 3)), 0.0);
    }

    #[test]
    fn test_extreme_boxes_do_not_overflow() {
        let full = BBox::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
        assert_relative_eq!(compute_iou(&full, &full), 1.0);
        let right_half = BBox::new(0, i32::MIN, i32::MAX, i32::MAX);
        assert_relative_eq!(compute_iou(&full, &right_half), 0.5, epsilon = 1e-6);
        assert_eq!(compute_iou(&full, &BBox::new(0, 0, 0, 0)), 0.0);

        let low = crate::keypoint::Point::new(i32::MIN, 0);
        let origin = crate::keypoint::Point::new(0, 0);
        let high = crate::keypoint::Point::new(i32::MAX, i32::MAX);
        assert_eq!(distance_sq(low, origin), 1_i64 << 62);
        assert_eq!(distance_sq(low, high), i64::MAX);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let boxes = [
            BBox::new(0, 0, 10, 10),
            BBox::new(1, 1, 11, 11),
            BBox::new(50, 50, 60, 60),
        ];
        let keep = nms(&boxes, &[0.6, 0.9, 0.5], 0.45);
        assert_eq!(keep, vec![1, 2]);
    }
}
