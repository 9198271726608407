//! Raw row normalization and fingerprinting
//!
//! Relative ages like "12 sec" drift between polls, so the identity of a
//! sighting is `range|call|cli|bucket` where `bucket` quantizes the estimated
//! origin instant into 120s slots.

use super::types::{KeyOutcome, NormalizedRecord, RawRecord};
use std::collections::HashSet;

/// Width of a fingerprint time bucket
pub const TIME_BUCKET_SECS: i64 = 120;

/// Age assigned to anything we cannot parse; larger than any staleness cutoff
pub const UNPARSEABLE_AGE_SECS: i64 = 999_999;

/// Parse a relative age string into seconds
///
/// - contains "now" or "moment" → 0
/// - leading integer + unit: "sec" → n, "min" → n*60, "hour"/"hr" → n*3600
/// - anything else, or a value that overflows, → `UNPARSEABLE_AGE_SECS`
pub fn parse_age_seconds(relative_age: &str) -> i64 {
    let lower = relative_age.trim().to_lowercase();

    if lower.contains("now") || lower.contains("moment") {
        return 0;
    }

    let digits: String = lower.chars().take_while(|c| c.is_ascii_digit()).collect();
    let value: i64 = match digits.parse() {
        Ok(v) => v,
        Err(_) => return UNPARSEABLE_AGE_SECS,
    };

    let scaled = if lower.contains("sec") {
        Some(value)
    } else if lower.contains("min") {
        value.checked_mul(60)
    } else if lower.contains("hour") || lower.contains("hr") {
        value.checked_mul(3600)
    } else {
        None
    };
    scaled.unwrap_or(UNPARSEABLE_AGE_SECS)
}

/// Bucket index for an origin instant given in Unix seconds
pub fn time_bucket(origin_secs: i64) -> i64 {
    origin_secs.div_euclid(TIME_BUCKET_SECS)
}

pub fn fingerprint(range: &str, call: &str, cli: &str, bucket: i64) -> String {
    format!("{}|{}|{}|{}", range, call, cli, bucket)
}

/// Fingerprint for a sighting whose estimated origin is `origin_secs`
pub fn fingerprint_at(range: &str, call: &str, cli: &str, origin_secs: i64) -> String {
    fingerprint(range, call, cli, time_bucket(origin_secs))
}

/// Normalize one raw row polled at `poll_time_ms`
///
/// Returns `None` when the row is older than `staleness_cutoff_secs`.
pub fn normalize(
    source_key: &str,
    raw: &RawRecord,
    poll_time_ms: i64,
    staleness_cutoff_secs: i64,
) -> Option<NormalizedRecord> {
    let age_seconds = parse_age_seconds(&raw.relative_age);
    if age_seconds > staleness_cutoff_secs {
        return None;
    }

    let range = raw.range.trim();
    let call = raw.call.trim();
    let cli = raw.cli.trim();
    if range.is_empty() {
        return None;
    }

    let poll_time_secs = poll_time_ms.div_euclid(1000);
    let origin_secs = poll_time_secs - age_seconds;

    Some(NormalizedRecord {
        range: range.to_string(),
        call: call.to_string(),
        cli: cli.to_string(),
        source_key: source_key.to_string(),
        observed_at_ms: poll_time_ms - age_seconds * 1000,
        age_seconds,
        fingerprint: fingerprint_at(range, call, cli, origin_secs),
    })
}

/// Normalize every row of a batch of fetch outcomes
pub fn normalize_outcomes(
    outcomes: &[KeyOutcome],
    poll_time_ms: i64,
    staleness_cutoff_secs: i64,
) -> Vec<NormalizedRecord> {
    outcomes
        .iter()
        .flat_map(|o| {
            o.outcome
                .records
                .iter()
                .filter_map(move |raw| normalize(&o.key, raw, poll_time_ms, staleness_cutoff_secs))
        })
        .collect()
}

/// Collapse duplicate fingerprints inside one batch (first occurrence wins)
pub fn dedup_within_batch(records: &[NormalizedRecord]) -> Vec<NormalizedRecord> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| seen.insert(r.fingerprint.as_str()))
        .cloned()
        .collect()
}
