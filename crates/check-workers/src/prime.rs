//! Primality check.
//!
//! Numbers are arbitrary precision. The check is probabilistic: 61
//! Miller-Rabin rounds plus a Baillie-PSW test, which is exact below 2^64.

use crate::{WorkerError, WorkerResult};
use num_bigint_dig::prime::probably_prime;
use num_bigint_dig::BigUint;
use std::str::FromStr;

/// Miller-Rabin rounds used by [`ProbablePrime::default`].
pub const DEFAULT_ROUNDS: usize = 61;

/// A parsed `number_text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Number {
    /// Zero or positive.
    Natural(BigUint),
    /// Below zero, never prime.
    Negative,
}

/// Decides primality for the prime-check worker.
pub trait PrimeCalculator: Send + Sync {
    fn is_prime(&self, n: &BigUint) -> bool;

    /// Parse `number_text` and check it.
    fn check(&self, number_text: &str) -> WorkerResult<bool> {
        match parse_number(number_text)? {
            Number::Natural(n) => Ok(self.is_prime(&n)),
            Number::Negative => Ok(false),
        }
    }
}

/// Parse a base-10 integer of any size, with an optional sign.
pub fn parse_number(number_text: &str) -> WorkerResult<Number> {
    let invalid = |reason: &str| WorkerError::InvalidNumber {
        number_text: number_text.to_string(),
        reason: reason.to_string(),
    };

    let text = number_text.trim();
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    if digits.is_empty() {
        return Err(invalid("no digits"));
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("not a base-10 integer"));
    }

    let n = BigUint::from_str(digits).map_err(|e| invalid(&e.to_string()))?;
    if negative && n != BigUint::from(0u32) {
        Ok(Number::Negative)
    } else {
        Ok(Number::Natural(n))
    }
}

/// Probabilistic primality test over arbitrary-precision integers.
#[derive(Debug, Clone, Copy)]
pub struct ProbablePrime {
    rounds: usize,
}

impl ProbablePrime {
    pub fn new(rounds: usize) -> Self {
        Self { rounds }
    }
}

impl Default for ProbablePrime {
    fn default() -> Self {
        Self::new(DEFAULT_ROUNDS)
    }
}

impl PrimeCalculator for ProbablePrime {
    fn is_prime(&self, n: &BigUint) -> bool {
        probably_prime(n, self.rounds)
    }
}
