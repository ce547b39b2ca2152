//! UTF-8 validation for text messages and close reasons
//!
//! Delegates to `simdutf8`, which picks SSE4.2/AVX2/NEON at runtime and falls
//! back to the standard library elsewhere.

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}
