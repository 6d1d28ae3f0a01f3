//! Derived training columns, computed in-process from the raw sample.
//! Bucket bounds and the recall-source codes are part of the dataset
//! contract with the model trainer; changing them invalidates old exports.

use crate::models::training::{DerivedFeatures, TrainingSampleRow};

const RECALL_SOURCE_CODES: &[(&str, u8)] = &[
    ("", 0),
    ("graph", 1),
    ("trending", 2),
    ("personalized", 3),
    ("item_cf", 4),
    ("user_cf", 5),
];

/// Encodes the upstream recall mechanism; unknown sources map to 0.
pub fn encode_recall_source(source: &str) -> u8 {
    RECALL_SOURCE_CODES
        .iter()
        .find(|(name, _)| *name == source)
        .map(|(_, code)| *code)
        .unwrap_or(0)
}

/// Buckets a feed position: [0,3], (3,10], (10,30], (30,100], (100,..).
pub fn position_bucket(position: u32) -> u8 {
    match position {
        0..=3 => 0,
        4..=10 => 1,
        11..=30 => 2,
        31..=100 => 3,
        _ => 4,
    }
}

/// Buckets a completion rate: [0,0.25], (0.25,0.5], (0.5,0.75],
/// (0.75,0.9], (0.9,..).
pub fn completion_bucket(rate: f64) -> u8 {
    match rate {
        r if r <= 0.25 => 0,
        r if r <= 0.5 => 1,
        r if r <= 0.75 => 2,
        r if r <= 0.9 => 3,
        _ => 4,
    }
}

/// All derived columns for one sample. Day-of-week is ISO (1 = Monday),
/// hour-of-day is 0..=23.
pub fn derive_features(sample: &TrainingSampleRow) -> DerivedFeatures {
    DerivedFeatures {
        is_weekend: u8::from(sample.day_of_week == 6 || sample.day_of_week == 7),
        is_morning: u8::from((6..=11).contains(&sample.hour_of_day)),
        is_evening: u8::from((18..=23).contains(&sample.hour_of_day)),
        is_night: u8::from(sample.hour_of_day <= 5),
        position_bucket: position_bucket(sample.position_in_feed),
        completion_bucket: completion_bucket(sample.completion_rate),
        recall_source_encoded: encode_recall_source(&sample.recall_source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sample() -> TrainingSampleRow {
        TrainingSampleRow {
            user_id: "u1".to_string(),
            post_id: "p1".to_string(),
            author_id: "a1".to_string(),
            label: 1,
            label_type: "click".to_string(),
            impression_time: 1_700_000_000,
            click_time: Some(1_700_000_030),
            watch_duration_ms: 12_000,
            content_duration_ms: 30_000,
            completion_rate: 0.4,
            recall_source: "graph".to_string(),
            position_in_feed: 2,
            session_id: "s1".to_string(),
            device_type: "ios".to_string(),
            hour_of_day: 10,
            day_of_week: 3,
            event_date: "2024-01-15".to_string(),
        }
    }

    #[test]
    fn test_position_bucket_bounds() {
        let cases = [
            (0, 0),
            (3, 0),
            (4, 1),
            (10, 1),
            (11, 2),
            (30, 2),
            (31, 3),
            (100, 3),
            (101, 4),
        ];
        for (position, bucket) in cases {
            assert_eq!(
                position_bucket(position),
                bucket,
                "position {position} should land in bucket {bucket}"
            );
        }
    }

    #[test]
    fn test_completion_bucket_bounds() {
        let cases = [
            (0.0, 0),
            (0.25, 0),
            (0.26, 1),
            (0.5, 1),
            (0.75, 2),
            (0.9, 3),
            (0.91, 4),
            (1.0, 4),
        ];
        for (rate, bucket) in cases {
            assert_eq!(
                completion_bucket(rate),
                bucket,
                "rate {rate} should land in bucket {bucket}"
            );
        }
    }

    #[test]
    fn test_recall_source_codes() {
        assert_eq!(encode_recall_source(""), 0);
        assert_eq!(encode_recall_source("graph"), 1);
        assert_eq!(encode_recall_source("trending"), 2);
        assert_eq!(encode_recall_source("personalized"), 3);
        assert_eq!(encode_recall_source("item_cf"), 4);
        assert_eq!(encode_recall_source("user_cf"), 5);
        assert_eq!(encode_recall_source("never_heard_of_it"), 0);
    }

    #[test]
    fn test_time_flags() {
        let mut sample = make_sample();

        sample.day_of_week = 6;
        assert_eq!(derive_features(&sample).is_weekend, 1);
        sample.day_of_week = 5;
        assert_eq!(derive_features(&sample).is_weekend, 0);

        sample.hour_of_day = 5;
        let d = derive_features(&sample);
        assert_eq!((d.is_night, d.is_morning), (1, 0));

        sample.hour_of_day = 6;
        let d = derive_features(&sample);
        assert_eq!((d.is_night, d.is_morning), (0, 1));

        sample.hour_of_day = 11;
        assert_eq!(derive_features(&sample).is_morning, 1);
        sample.hour_of_day = 12;
        let d = derive_features(&sample);
        assert_eq!((d.is_morning, d.is_evening), (0, 0));

        sample.hour_of_day = 18;
        assert_eq!(derive_features(&sample).is_evening, 1);
        sample.hour_of_day = 23;
        assert_eq!(derive_features(&sample).is_evening, 1);
    }

    #[test]
    fn test_derive_combines_sample_fields() {
        let sample = make_sample();
        let derived = derive_features(&sample);
        assert_eq!(derived.position_bucket, 0);
        assert_eq!(derived.completion_bucket, 1);
        assert_eq!(derived.recall_source_encoded, 1);
    }
}
