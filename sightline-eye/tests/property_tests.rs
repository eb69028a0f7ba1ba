use chrono::Utc;
use proptest::prelude::*;
use sightline_eye::processing::{
    letterbox_geometry, non_max_suppression, softmax, BoundingBox, Detection, DetectionPostprocessor,
    TemporalBuffer,
};
use sightline_eye::{LabelTable, LetterboxTransform, ObjectConfig, Tensor};

fn transform_for(width: u32, height: u32, size: u32) -> LetterboxTransform {
    let g = letterbox_geometry(width, height, size).unwrap();
    LetterboxTransform {
        scale: g.scale,
        pad_x: (size - g.resized_width) as f32 / 2.0,
        pad_y: (size - g.resized_height) as f32 / 2.0,
        source_width: width,
        source_height: height,
    }
}

fn prediction() -> impl Strategy<Value = Vec<f32>> {
    (
        -100.0f32..740.0,
        -100.0f32..740.0,
        0.0f32..400.0,
        0.0f32..400.0,
        prop::collection::vec(0.0f32..1.0, 3),
    )
        .prop_map(|(cx, cy, w, h, scores)| {
            let mut row = vec![cx, cy, w, h];
            row.extend(scores);
            row
        })
}

proptest! {
    #[test]
    fn test_detections_inside_frame(
        width in 16u32..2560,
        height in 16u32..2560,
        predictions in prop::collection::vec(prediction(), 1..60),
    ) {
        let transform = transform_for(width, height, 640);
        let post = DetectionPostprocessor::new(
            LabelTable::parse("a\nb\nc"),
            &ObjectConfig::default(),
        );
        let raw: Vec<f32> = predictions.into_iter().flatten().collect();

        for d in post.postprocess(&raw, &transform) {
            prop_assert!(d.bbox.left <= d.bbox.right);
            prop_assert!(d.bbox.top <= d.bbox.bottom);
            prop_assert!(d.bbox.left >= 0.0 && d.bbox.right <= width as f32);
            prop_assert!(d.bbox.top >= 0.0 && d.bbox.bottom <= height as f32);
            prop_assert!(d.confidence >= 0.5);
        }
    }

    #[test]
    fn test_nms_leaves_no_overlap(
        boxes in prop::collection::vec(
            (0.0f32..500.0, 0.0f32..500.0, 1.0f32..120.0, 1.0f32..120.0, 0.0f32..1.0),
            0..80,
        ),
        threshold in 0.1f32..0.9,
    ) {
        let candidates: Vec<Detection> = boxes
            .into_iter()
            .map(|(x, y, w, h, confidence)| Detection {
                class_id: 0,
                label: "a".to_string(),
                confidence,
                bbox: BoundingBox::new(x, y, x + w, y + h),
            })
            .collect();

        let kept = non_max_suppression(candidates, threshold, 100);
        prop_assert!(kept.len() <= 100);
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                prop_assert!(a.bbox.iou(&b.bbox) <= threshold);
                prop_assert!(a.confidence >= b.confidence);
            }
        }
    }

    #[test]
    fn test_softmax_normalized(logits in prop::collection::vec(-1000.0f32..1000.0, 1..64)) {
        let p = softmax(&logits).unwrap();
        prop_assert!(p.iter().all(|v| v.is_finite() && *v >= 0.0));
        let sum: f32 = p.iter().sum();
        prop_assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_buffer_keeps_last_n(capacity in 1usize..32, extra in 0usize..10) {
        let mut buffer = TemporalBuffer::new(capacity);
        let pushes = capacity + extra;
        for i in 0..pushes {
            buffer.push(Tensor::new(vec![i as f32; 3], 3, 1, 1).unwrap(), Utc::now());
            prop_assert!(buffer.len() <= capacity);
        }

        let window = buffer.snapshot().unwrap();
        let tags: Vec<f32> = window.entries().iter().map(|e| e.tensor.data()[0]).collect();
        let expected: Vec<f32> = (pushes - capacity..pushes).map(|i| i as f32).collect();
        prop_assert_eq!(tags, expected);
    }

    #[test]
    fn test_letterbox_center_round_trip(width in 16u32..2048, height in 16u32..2048) {
        let transform = transform_for(width, height, 640);
        let (fx, fy) = transform.to_frame(320.0, 320.0);
        prop_assert!((fx - width as f32 / 2.0).abs() <= 1.0);
        prop_assert!((fy - height as f32 / 2.0).abs() <= 1.0);

        let (mx, my) = transform.to_model(width as f32 / 3.0, height as f32 / 3.0);
        let (bx, by) = transform.to_frame(mx, my);
        prop_assert!((bx - width as f32 / 3.0).abs() <= 1.0);
        prop_assert!((by - height as f32 / 3.0).abs() <= 1.0);
    }
}
