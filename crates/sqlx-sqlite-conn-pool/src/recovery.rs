//! Failure classification for the recovery policy
//!
//! Transient storage failures (a locked or busy database, a disk I/O error)
//! are worth one close-and-reopen pass over the pool. Everything else is
//! reported to the caller as-is.

use std::sync::LazyLock;

use regex::Regex;

static RECOVERABLE: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"(?i)locked|busy|i/o error").expect("recoverable-error pattern is valid")
});

/// How the pool reacts to a storage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
   /// Locked, busy or I/O failure: close and reopen the pool once
   Recoverable,
   /// Anything else
   Fatal,
}

/// Classify an engine error message.
pub fn classify(message: &str) -> ErrorClass {
   if RECOVERABLE.is_match(message) {
      ErrorClass::Recoverable
   } else {
      ErrorClass::Fatal
   }
}
