//! Logical-address resolution seam.
//!
//! The scanner decides *when* to resolve; *how* is injected through
//! [`LogicalResolver`]. The production implementation wraps
//! `btrfs inspect-internal logical-resolve`; tests substitute canned
//! responses.

use thiserror::Error;

/// Resolves one extent's logical address to the file paths currently
/// referencing it.
///
/// `logical_addr` is the verbatim token captured from the item header;
/// it is never interpreted here. Returned lines are kept exactly as the
/// resolver emitted them, trailing newline included.
pub trait LogicalResolver {
    fn resolve(&mut self, logical_addr: &str) -> Result<Vec<String>, ResolveError>;
}

impl<T: LogicalResolver + ?Sized> LogicalResolver for &mut T {
    fn resolve(&mut self, logical_addr: &str) -> Result<Vec<String>, ResolveError> {
        (**self).resolve(logical_addr)
    }
}

/// Failure while resolving a logical address.
///
/// Every variant is fatal to the scan: a skipped resolution would
/// silently understate sharing, which is worse than aborting.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The resolver process could not be launched.
    #[error("failed to launch logical-resolve: {0}")]
    Launch(#[source] std::io::Error),

    /// Reading the resolver's output, or reaping the process, failed.
    #[error("logical-resolve I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The resolver process was terminated by a signal.
    #[error("logical-resolve was killed by signal {signal}")]
    Killed { signal: i32 },

    /// The resolver process exited with a non-zero status.
    #[error("logical-resolve exited with status {status}")]
    ExitStatus { status: i32 },
}
