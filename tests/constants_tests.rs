// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for constants module

use camera_service::constants::{self, capture, ring, timing};
use camera_service::ring::HEADER_SIZE;

#[test]
fn test_header_is_six_words() {
    // write_index, read_index, unit_size, meta_size, unit_num, mark
    assert_eq!(HEADER_SIZE, 6 * ring::LENGTH_CELL);
}

#[test]
fn test_default_counts_within_limits() {
    assert!(capture::DEFAULT_BUFFER_COUNT >= 1);
    assert!(capture::DEFAULT_BUFFER_COUNT <= capture::MAX_BUFFER_COUNT);
    assert!(ring::DEFAULT_UNIT_NUM >= 1);
}

#[test]
fn test_default_backend_is_registered() {
    assert!(
        camera_service::backends::camera::BACKEND_NAMES.contains(&capture::DEFAULT_BACKEND),
        "Default backend must be creatable"
    );
}

#[test]
fn test_timeouts_match_millisecond_constants() {
    assert_eq!(
        constants::dequeue_timeout().as_millis() as u64,
        timing::DEQUEUE_TIMEOUT_MS
    );
    assert_eq!(
        constants::reader_timeout().as_millis() as u64,
        timing::READER_TIMEOUT_MS
    );
}

#[test]
fn test_version_not_empty() {
    assert!(!constants::app_info::version().is_empty());
}
