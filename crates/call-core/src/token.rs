//! Opaque tokens for calls and connections
//!
//! A token is `<prefix char><8 hex random><monotonic counter>`, unique
//! within a manager. Callers must treat the content as opaque.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// Token prefix for calls
pub const CALL_TOKEN_PREFIX: char = 'C';

/// Token prefix for connections
pub const CONNECTION_TOKEN_PREFIX: char = 'X';

/// Generates process-unique tokens
#[derive(Debug, Default)]
pub struct TokenGenerator {
    counter: AtomicU64,
}

impl TokenGenerator {
    /// Fresh generator starting at counter 1
    pub fn new() -> Self {
        Self { counter: AtomicU64::new(0) }
    }

    /// Next token with the given prefix character
    pub fn next(&self, prefix: char) -> String {
        let count = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{:08x}{}", prefix, rand::thread_rng().gen::<u32>(), count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tokens_unique_and_shaped() {
        let generator = TokenGenerator::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let token = generator.next(CALL_TOKEN_PREFIX);
            assert!(token.starts_with('C'));
            assert!(token.len() >= 10);
            assert!(seen.insert(token));
        }
    }

    #[test]
    fn test_counter_advances() {
        let generator = TokenGenerator::new();
        let a = generator.next(CONNECTION_TOKEN_PREFIX);
        let b = generator.next(CONNECTION_TOKEN_PREFIX);
        // Counter suffix differs even if the random part collided
        assert_ne!(a, b);
    }
}
