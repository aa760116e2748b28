//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use a2_engine::param::is_param_valid;

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// True if `value` is `expected` plus a dither in `[0, 1)`.
pub fn dcmp(value: f64, expected: f64) -> bool {
    is_param_valid(value) && expected <= value && value < expected + 1.0
}

/// Encode replay records as the little-endian stream read by `a2-replay`.
pub fn encode_stream(records: &[(u32, u32, &[u32])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (event, module, words) in records {
        out.extend_from_slice(&event.to_le_bytes());
        out.extend_from_slice(&module.to_le_bytes());
        out.extend_from_slice(&(words.len() as u32).to_le_bytes());
        for w in *words {
            out.extend_from_slice(&w.to_le_bytes());
        }
    }
    out
}
