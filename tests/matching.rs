//! Extractor and matcher behaviour on synthetic prints.

mod common;

use chrono::Utc;
use common::finger_frame;
use fingertime::core::{preprocess, DescriptorExtractor, DescriptorSet, Matcher};
use fingertime::sensor::Frame;
use fingertime::storage::{GalleryEntry, Template};
use fingertime::Config;

fn entry(id: &str, name: &str, descriptors: DescriptorSet) -> GalleryEntry {
    GalleryEntry {
        identity_id: id.to_string(),
        display_name: name.to_string(),
        template: Template {
            identity_id: id.to_string(),
            descriptors,
            created_at: Utc::now(),
        },
    }
}

#[test]
fn rotation_variants_follow_config_and_include_upright() {
    let config = Config::default();
    let extractor = DescriptorExtractor::new(config.extractor.clone());
    let frame = finger_frame(3, 0);

    let variants = extractor.extract_rotations(&frame);
    assert_eq!(variants.len(), config.extractor.rotation_angles.len());

    let upright = config
        .extractor
        .rotation_angles
        .iter()
        .position(|&a| a == 0.0)
        .unwrap();
    assert_eq!(variants[upright], extractor.extract(&frame));
}

#[test]
fn rotated_probe_is_recovered_by_rotation_variants() {
    let config = Config::default();
    let extractor = DescriptorExtractor::new(config.extractor.clone());
    let matcher = Matcher::new(config.matcher.clone());

    let enrolled = finger_frame(4, 0);
    let template = extractor.extract(&enrolled);

    let mut improved = 0;
    for angle in [-10.0f32, -5.0, 5.0, 10.0] {
        let probe = Frame::from_image(preprocess::rotate(enrolled.image(), angle));
        let upright = matcher.score_pair(&extractor.extract(&probe), &template);
        let tolerant = matcher.score_template(&extractor.extract_rotations(&probe), &template);

        assert!(tolerant >= upright, "{} deg: tolerant {} < upright {}", angle, tolerant, upright);
        if tolerant > upright {
            improved += 1;
        }
    }
    assert!(improved > 0, "no rotation variant beat the upright probe");
}

#[test]
fn self_match_counts_distinct_descriptors() {
    let config = Config::default();
    let extractor = DescriptorExtractor::new(config.extractor.clone());
    let matcher = Matcher::new(config.matcher);

    let set = extractor.extract(&finger_frame(8, 0));
    let score = matcher.score_pair(&set, &set);
    assert!(score as usize <= set.len());
    assert!(score >= config.attendance.score_accept);
}

#[test]
fn sets_below_minimum_size_score_zero() {
    let config = Config::default();
    let extractor = DescriptorExtractor::new(config.extractor.clone());
    let matcher = Matcher::new(config.matcher.clone());

    let full = extractor.extract(&finger_frame(9, 0));
    let small = DescriptorSet::new(full.iter().take(config.matcher.min_descriptors - 1).copied().collect());

    assert_eq!(matcher.score_pair(&small, &full), 0);
    assert_eq!(matcher.score_pair(&full, &small), 0);
    assert_eq!(matcher.score_pair(&DescriptorSet::default(), &full), 0);
}

#[test]
fn identify_picks_the_enrolled_print() {
    let config = Config::default();
    let extractor = DescriptorExtractor::new(config.extractor.clone());
    let matcher = Matcher::new(config.matcher);

    let gallery = vec![
        entry("A", "Alice", extractor.extract(&finger_frame(30, 0))),
        entry("B", "Bob", extractor.extract(&finger_frame(31, 0))),
    ];

    let probes = extractor.extract_rotations(&finger_frame(31, 2));
    let id = matcher.identify(&probes, &gallery);
    assert_eq!(id.identity_id.as_deref(), Some("B"));
    assert_eq!(id.display_name.as_deref(), Some("Bob"));

    let other = matcher.score_template(&probes, &gallery[0].template.descriptors);
    assert!(other < id.score, "cross score {} vs {}", other, id.score);

    let matrix = matcher.score_matrix(&gallery);
    assert_eq!(matrix.len(), 2);
    assert_eq!(matrix[0][1], matrix[1][0]);
}
