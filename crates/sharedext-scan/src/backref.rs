//! Owner identity extraction from `extent data backref` lines.

use crate::ScanConfig;
use regex::Regex;
use sharedext_types::{InodeNumber, OwnerId, SubvolId};
use tracing::debug;

/// Spelling the dump uses for the top-level subvolume in backref lines.
const FS_ROOT_TOKEN: &str = "FS_ROOT";

/// Extracts owner identities from extent-data backref lines.
///
/// A backref line carries `extent data backref root <SUBVOL> objectid
/// <INODE>` somewhere in it, where `<SUBVOL>` is a decimal subvolume id
/// or the `FS_ROOT` token (subvolume 5) and `<INODE>` is a decimal inode
/// number.
pub struct BackrefParser {
    pattern: Regex,
    verbose: bool,
}

impl BackrefParser {
    #[must_use]
    pub fn new(config: ScanConfig) -> Self {
        Self {
            pattern: Regex::new(r"extent data backref root (\S+) objectid (\d+)")
                .expect("backref pattern is valid"),
            verbose: config.verbose,
        }
    }

    /// Attempt to extract an owner identity from one dump line.
    ///
    /// Returns `None` for every line that is not a well-formed backref
    /// line. A line with the backref shape but an unparseable subvolume
    /// or inode token is a soft failure: it is skipped, and reported at
    /// debug level when verbose is enabled.
    #[must_use]
    pub fn extract(&self, line: &str) -> Option<OwnerId> {
        let captures = self.pattern.captures(line)?;
        let subvol_token = &captures[1];
        let subvol = if subvol_token == FS_ROOT_TOKEN {
            SubvolId::FS_ROOT
        } else {
            match subvol_token.parse::<u64>() {
                Ok(id) => SubvolId(id),
                Err(_) => {
                    if self.verbose {
                        debug!(
                            target: "sharedext::scan",
                            line,
                            "skipping backref line with unparseable subvolume token"
                        );
                    }
                    return None;
                }
            }
        };
        match captures[2].parse::<u64>() {
            Ok(inode) => Some(OwnerId::new(subvol, InodeNumber(inode))),
            Err(_) => {
                if self.verbose {
                    debug!(
                        target: "sharedext::scan",
                        line,
                        "skipping backref line with out-of-range inode"
                    );
                }
                None
            }
        }
    }
}
