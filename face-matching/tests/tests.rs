use approx::assert_relative_eq;

use face_matching::{
    adaptive_iou_threshold, centroid_distance, distance_threshold, face_quality, iou_mean_area,
};
use facegate_types::{Bbox, Landmarks};

#[test]
fn iou_of_identical_boxes_is_one() {
    let b = Bbox::new(100, 100, 200, 200);
    assert_relative_eq!(iou_mean_area(&b, &b), 1.0);
}

#[test]
fn iou_is_symmetric() {
    let a = Bbox::new(100, 100, 200, 200);
    let b = Bbox::new(150, 150, 260, 240);
    assert_relative_eq!(iou_mean_area(&a, &b), iou_mean_area(&b, &a));
}

#[test]
fn iou_of_disjoint_boxes_is_zero() {
    let a = Bbox::new(0, 0, 10, 10);
    let b = Bbox::new(100, 100, 110, 110);
    assert_eq!(iou_mean_area(&a, &b), 0.0);
}

#[test]
fn iou_with_degenerate_box_is_zero() {
    let a = Bbox::new(0, 0, 10, 10);
    let z = Bbox::new(5, 5, 5, 5);
    assert_eq!(iou_mean_area(&a, &z), 0.0);
}

#[test]
fn iou_uses_mean_area_denominator() {
    // Intersection 50x100 = 5000; areas 10000 and 5000, mean 7500.
    let a = Bbox::new(0, 0, 100, 100);
    let b = Bbox::new(50, 0, 100, 100);
    assert_relative_eq!(iou_mean_area(&a, &b), 5000.0 / 7500.0);
    // The union denominator would give 0.5 here.
}

#[test]
fn centroid_distance_is_symmetric_and_zero_for_identical() {
    let a = Bbox::new(100, 100, 200, 200);
    let b = Bbox::new(500, 500, 600, 600);
    assert_relative_eq!(centroid_distance(&a, &a), 0.0);
    assert_relative_eq!(centroid_distance(&a, &b), centroid_distance(&b, &a));
    // Centers (150,150) and (550,550).
    assert_relative_eq!(centroid_distance(&a, &b), (2.0f64 * 400.0 * 400.0).sqrt());
}

#[test]
fn iou_threshold_tracks_resolution() {
    assert_relative_eq!(adaptive_iou_threshold(640, 480), 0.20);
    assert_relative_eq!(adaptive_iou_threshold(1280, 720), 0.15);
    assert_relative_eq!(adaptive_iou_threshold(1920, 1080), 0.12);
    assert_relative_eq!(adaptive_iou_threshold(3840, 2160), 0.10);
    // Max dimension governs, not width alone.
    assert_relative_eq!(adaptive_iou_threshold(480, 1920), 0.12);
}

#[test]
fn distance_threshold_is_fraction_of_diagonal() {
    let t = distance_threshold(1920, 1080, 0.07);
    let diag = (1920.0f64 * 1920.0 + 1080.0 * 1080.0).sqrt();
    assert_relative_eq!(t, diag * 0.07);
}

#[test]
fn quality_monotone_in_confidence() {
    let b = Bbox::new(100, 100, 200, 200);
    let lm = Landmarks::empty();
    let mut prev = -1.0f32;
    for conf in [0.0, 0.25, 0.5, 0.75, 1.0] {
        let q = face_quality(&b, conf, 1920, 1080, &lm);
        assert!(q >= prev, "quality decreased at conf={conf}");
        prev = q;
    }
}

#[test]
fn quality_monotone_in_area_until_saturation() {
    let lm = Landmarks::empty();
    let mut prev = -1.0f32;
    for side in [20, 50, 100, 200, 400, 800] {
        let b = Bbox::new(0, 0, side, side);
        let q = face_quality(&b, 0.5, 1920, 1080, &lm);
        assert!(q >= prev, "quality decreased at side={side}");
        prev = q;
    }
    // Past saturation the size term is pinned.
    let big = face_quality(&Bbox::new(0, 0, 800, 800), 0.5, 1920, 1080, &lm);
    let bigger = face_quality(&Bbox::new(0, 0, 1600, 1000), 0.5, 1920, 1080, &lm);
    assert_relative_eq!(big, bigger);
}

#[test]
fn quality_rises_with_landmarks_inside_bbox() {
    let b = Bbox::new(100, 100, 200, 200);
    let none = face_quality(&b, 0.8, 1920, 1080, &Landmarks::empty());
    let five = face_quality(
        &b,
        0.8,
        1920,
        1080,
        &Landmarks::new(vec![
            (120.0, 130.0),
            (180.0, 130.0),
            (150.0, 150.0),
            (130.0, 180.0),
            (170.0, 180.0),
        ]),
    );
    assert!(five > none);
    // Points outside the bbox contribute nothing.
    let outside = face_quality(
        &b,
        0.8,
        1920,
        1080,
        &Landmarks::new(vec![(10.0, 10.0), (500.0, 500.0)]),
    );
    assert_relative_eq!(outside, none);
}

#[test]
fn quality_zero_for_degenerate_bbox() {
    let z = Bbox::new(50, 50, 50, 120);
    assert_eq!(face_quality(&z, 1.0, 1920, 1080, &Landmarks::empty()), 0.0);
}

#[test]
fn quality_bounded_and_deterministic() {
    let b = Bbox::new(0, 0, 1920, 1080);
    let lm = Landmarks::new(vec![(10.0, 10.0); 20]);
    let q1 = face_quality(&b, 1.0, 1920, 1080, &lm);
    let q2 = face_quality(&b.clone(), 1.0, 1920, 1080, &lm.clone());
    assert!(q1 <= 1.0);
    assert_eq!(q1.to_bits(), q2.to_bits());
}
