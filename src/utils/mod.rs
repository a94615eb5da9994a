//! Cross-cutting utilities: backoff policy, filesystem helpers, path parsing.

pub mod backoff;
pub mod fs;
pub mod paths;
