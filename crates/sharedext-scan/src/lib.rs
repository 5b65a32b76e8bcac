#![forbid(unsafe_code)]
//! Streaming shared-extent resolution over `btrfs inspect-internal
//! dump-tree -t extent` output.
//!
//! The dump is treated as an opaque line-oriented text stream; this crate
//! never touches on-disk structures. A single-pass state machine
//! ([`TreeDumpScanner`]) groups the stream into extent-item blocks, uses
//! [`BackrefParser`] to recognize the backref lines inside a block, and
//! asks an injected [`LogicalResolver`] for the file paths behind every
//! item the inspected file turns out to share with at least one owner not
//! seen earlier in the scan.
//!
//! I/O-agnostic: the scanner consumes any `BufRead`, so tests drive it
//! with `std::io::Cursor` over canned dumps instead of a subprocess.

mod backref;
mod resolve;
mod scanner;

pub use backref::BackrefParser;
pub use resolve::{LogicalResolver, ResolveError};
pub use scanner::{ScanError, TreeDumpScanner};

/// Scan configuration, threaded into the parser and scanner constructors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanConfig {
    /// Report each backref-shaped line that fails to parse. Diagnostics go
    /// to the `sharedext::scan` tracing target at debug level.
    pub verbose: bool,
}
