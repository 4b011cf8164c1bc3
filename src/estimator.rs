//! Fallback token estimation.
//!
//! The pool calls a [`FallbackEstimator`] synchronously whenever a precise
//! worker count is unavailable: oversized input, a full queue, a timeout, a
//! crashed worker, or a pool with no live workers left.

/// Cheap, deterministic text → approximate token count.
pub trait FallbackEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

impl<F> FallbackEstimator for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn estimate(&self, text: &str) -> usize {
        self(text)
    }
}

/// Estimates one token per `chars_per_token` characters, rounded up.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            4.0
        };
        Self { chars_per_token }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4.0)
    }
}

impl FallbackEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars as f64 / self.chars_per_token).ceil() as usize
    }
}
