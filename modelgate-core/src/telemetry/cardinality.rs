//! Cardinality limiter for metric names and labels.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Value returned once the limit is reached.
pub const OVERFLOW_VALUE: &str = "__other__";

/// Bounds the number of distinct values a label (or custom metric key)
/// may take. New values past `max_values` resolve to `"__other__"`.
#[derive(Debug)]
pub struct CardinalityLimiter {
    known: Mutex<HashSet<String>>,
    max_values: usize,
}

impl CardinalityLimiter {
    pub fn new(max_values: usize) -> Self {
        Self {
            known: Mutex::new(HashSet::new()),
            max_values,
        }
    }

    /// Known values and new values under the limit pass through.
    pub fn resolve<'a>(&self, value: &'a str) -> &'a str {
        let mut known = self.known.lock();
        if known.contains(value) {
            value
        } else if known.len() < self.max_values {
            known.insert(value.to_string());
            value
        } else {
            OVERFLOW_VALUE
        }
    }

    pub fn count(&self) -> usize {
        self.known.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_overflows_to_other() {
        let limiter = CardinalityLimiter::new(2);
        assert_eq!(limiter.resolve("drift-a"), "drift-a");
        assert_eq!(limiter.resolve("drift-b"), "drift-b");
        assert_eq!(limiter.resolve("drift-c"), OVERFLOW_VALUE);
        assert_eq!(limiter.count(), 2);
    }

    #[test]
    fn test_limiter_remembers_known_values() {
        let limiter = CardinalityLimiter::new(1);
        assert_eq!(limiter.resolve("x"), "x");
        assert_eq!(limiter.resolve("y"), OVERFLOW_VALUE);
        assert_eq!(limiter.resolve("x"), "x");
    }
}
