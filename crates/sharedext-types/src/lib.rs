#![forbid(unsafe_code)]
//! Domain identifiers for shared-extent scanning.
//!
//! An extent in a btrfs extent tree is referenced by zero or more
//! *backreferences*, each naming one (subvolume, inode) pair. [`OwnerId`]
//! is that pair; two owners are the same file iff both fields match, so
//! the derived structural equality and hash are the dedup key used by the
//! scanner's visited set.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Inode number within one subvolume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// btrfs subvolume id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubvolId(pub u64);

impl SubvolId {
    /// The top-level subvolume. Tree-dump text spells this one `FS_ROOT`
    /// instead of `5` in backref lines.
    pub const FS_ROOT: Self = Self(5);
}

/// One owning file of an extent reference: (subvolume, inode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId {
    pub subvol: SubvolId,
    pub inode: InodeNumber,
}

impl OwnerId {
    #[must_use]
    pub const fn new(subvol: SubvolId, inode: InodeNumber) -> Self {
        Self { subvol, inode }
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SubvolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root {} objectid {}", self.subvol, self.inode)
    }
}
