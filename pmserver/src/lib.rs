pub mod hosts;
pub mod metrics;
pub mod mirror;
pub mod range;
pub mod registry;
pub mod tracker;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

use regex::Regex;

// filters match against the reference identifier, e.g. docker.io/library/busybox:latest
pub fn filtered(filters: &[Regex], identifier: &str) -> bool {
    filters.iter().any(|f| f.is_match(identifier))
}
