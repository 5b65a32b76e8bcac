//! Line-driven state machine over an extent-tree dump.

use crate::ScanConfig;
use crate::backref::BackrefParser;
use crate::resolve::{LogicalResolver, ResolveError};
use sharedext_types::OwnerId;
use std::collections::{BTreeSet, HashSet};
use std::io::BufRead;
use thiserror::Error;
use tracing::debug;

/// Token that opens a new tree item. Also present in `leaf ... items N`
/// node headers, which likewise terminate the current block.
const ITEM_MARKER: &str = "item";

/// The logical address of an item follows this token in its header line.
const KEY_OPEN: &str = "key (";

/// Errors that abort a scan.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The tree-dump stream could not be read.
    #[error("failed to read tree-dump stream: {0}")]
    Stream(#[from] std::io::Error),

    /// A logical-address resolution failed. The sharing report would be
    /// incomplete without it, so the whole scan aborts.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between blocks, or inside a block ruled out for this scan.
    Prestart,
    /// An item header line is being examined.
    Start,
    /// Expecting the item's reference-count line.
    Refline,
    /// Collecting backref owners; the target is not yet confirmed for
    /// this item.
    BackrefSpeculative,
    /// Target confirmed as an owner of this item.
    Backref,
}

/// Single-pass scanner for `dump-tree -t extent` output.
///
/// Backref lines within one extent item are not guaranteed to list the
/// inspected file first, so owners seen before the target's own line are
/// buffered speculatively and only promoted to the durable visited set
/// once the target is confirmed to share the item. When a confirmed item
/// contributed at least one owner new to the whole scan, its logical
/// address is handed to the resolver and the returned paths accumulate
/// in the result set.
pub struct TreeDumpScanner<R> {
    target: OwnerId,
    parser: BackrefParser,
    resolver: R,
    state: State,
    /// Captured verbatim from the item header; only ever passed through
    /// to the resolver.
    logical_addr: Option<String>,
    /// Every distinct non-target owner confirmed to share an extent item
    /// with the target, across the whole scan.
    visited: HashSet<OwnerId>,
    /// Owners seen in the current block before the target was.
    speculative: Vec<OwnerId>,
    /// Size of `visited` when the current block started.
    baseline: usize,
    paths: BTreeSet<String>,
}

impl<R: LogicalResolver> TreeDumpScanner<R> {
    #[must_use]
    pub fn new(target: OwnerId, config: ScanConfig, resolver: R) -> Self {
        Self {
            target,
            parser: BackrefParser::new(config),
            resolver,
            state: State::Prestart,
            logical_addr: None,
            visited: HashSet::new(),
            speculative: Vec::new(),
            baseline: 0,
            paths: BTreeSet::new(),
        }
    }

    /// Consume the dump stream to completion and return the deduplicated
    /// set of resolved paths, each line verbatim as the resolver emitted
    /// it.
    pub fn scan(mut self, input: impl BufRead) -> Result<BTreeSet<String>, ScanError> {
        for line in input.lines() {
            let line = line?;
            self.step(&line)?;
        }
        // No trailing header arrives at end of stream; close out the
        // pending block through the same boundary logic.
        self.finalize_block()?;
        Ok(self.paths)
    }

    fn step(&mut self, line: &str) -> Result<(), ScanError> {
        if line.contains(ITEM_MARKER) {
            self.finalize_block()?;
            self.speculative.clear();
            self.logical_addr = None;
            self.baseline = self.visited.len();
            self.state = State::Start;
        }
        match self.state {
            State::Prestart => {}
            State::Start => match parse_item_address(line) {
                Some(addr) => {
                    self.logical_addr = Some(addr);
                    self.state = State::Refline;
                }
                // Not an item header we recognize (`leaf ... items N` and
                // friends): abandon the block.
                None => self.state = State::Prestart,
            },
            State::Refline => {
                self.state = match parse_ref_count(line) {
                    Some(refs) if refs > 1 => State::BackrefSpeculative,
                    // Single-owner item, or not an extent item at all.
                    _ => State::Prestart,
                };
            }
            State::BackrefSpeculative => match self.parser.extract(line) {
                None => {}
                Some(owner) if owner == self.target => {
                    self.visited.extend(self.speculative.drain(..));
                    self.state = State::Backref;
                }
                Some(owner) => self.speculative.push(owner),
            },
            State::Backref => {
                if let Some(owner) = self.parser.extract(line) {
                    // The target itself can reappear at another file
                    // offset; it never counts as its own sharer.
                    if owner != self.target {
                        self.visited.insert(owner);
                    }
                }
            }
        }
        Ok(())
    }

    /// Close out the current block: if the target was confirmed as an
    /// owner and the block recorded at least one owner new to the whole
    /// scan, resolve the block's logical address and accumulate the
    /// returned paths.
    fn finalize_block(&mut self) -> Result<(), ScanError> {
        if self.state != State::Backref || self.visited.len() <= self.baseline {
            return Ok(());
        }
        let Some(addr) = self.logical_addr.as_deref() else {
            return Ok(());
        };
        debug!(
            target: "sharedext::scan",
            logical_addr = addr,
            new_owners = self.visited.len() - self.baseline,
            "resolving shared extent item"
        );
        for path in self.resolver.resolve(addr)? {
            self.paths.insert(path);
        }
        Ok(())
    }
}

fn parse_item_address(line: &str) -> Option<String> {
    let start = line.find(KEY_OPEN)? + KEY_OPEN.len();
    let token: String = line[start..]
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ')')
        .collect();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn parse_ref_count(line: &str) -> Option<u64> {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("refs") {
        return None;
    }
    tokens.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharedext_types::{InodeNumber, SubvolId};

    struct NoopResolver;

    impl LogicalResolver for NoopResolver {
        fn resolve(&mut self, _logical_addr: &str) -> Result<Vec<String>, ResolveError> {
            Ok(Vec::new())
        }
    }

    fn target() -> OwnerId {
        OwnerId::new(SubvolId(256), InodeNumber(257))
    }

    fn scanner() -> TreeDumpScanner<NoopResolver> {
        TreeDumpScanner::new(target(), ScanConfig::default(), NoopResolver)
    }

    fn backref(subvol: &str, inode: u64) -> String {
        format!("\t\textent data backref root {subvol} objectid {inode} offset 0 count 1")
    }

    #[test]
    fn item_address_comes_after_key_open() {
        assert_eq!(
            parse_item_address(
                "\titem 0 key (13631488 EXTENT_ITEM 8192) itemoff 16198 itemsize 85"
            ),
            Some("13631488".to_owned())
        );
        assert_eq!(
            parse_item_address("leaf 30785536 items 4 free space 15670 generation 11"),
            None
        );
        assert_eq!(parse_item_address("\titem 3 key ("), None);
    }

    #[test]
    fn ref_count_is_the_second_token() {
        assert_eq!(parse_ref_count("\t\trefs 2 gen 7 flags DATA"), Some(2));
        assert_eq!(parse_ref_count("\t\trefs 1 gen 9 flags DATA"), Some(1));
        assert_eq!(
            parse_ref_count("\t\tblock group used 4194304 chunk_objectid 256"),
            None
        );
        assert_eq!(parse_ref_count("\t\trefs many"), None);
    }

    #[test]
    fn header_line_enters_refline_with_captured_address() {
        let mut scanner = scanner();
        scanner
            .step("\titem 0 key (13631488 EXTENT_ITEM 8192) itemoff 16198 itemsize 85")
            .unwrap();
        assert_eq!(scanner.state, State::Refline);
        assert_eq!(scanner.logical_addr.as_deref(), Some("13631488"));
    }

    #[test]
    fn unrecognized_header_abandons_the_block() {
        let mut scanner = scanner();
        scanner
            .step("leaf 30785536 items 4 free space 15670 generation 11 owner EXTENT_TREE")
            .unwrap();
        assert_eq!(scanner.state, State::Prestart);
        assert_eq!(scanner.logical_addr, None);
    }

    #[test]
    fn single_reference_items_are_ignored() {
        let mut scanner = scanner();
        scanner
            .step("\titem 1 key (13639680 EXTENT_ITEM 4096) itemoff 16145 itemsize 53")
            .unwrap();
        scanner.step("\t\trefs 1 gen 9 flags DATA").unwrap();
        assert_eq!(scanner.state, State::Prestart);
        scanner.step(&backref("256", 257)).unwrap();
        assert!(scanner.visited.is_empty());
        assert!(scanner.speculative.is_empty());
    }

    #[test]
    fn owners_before_target_are_buffered_then_promoted() {
        let mut scanner = scanner();
        scanner
            .step("\titem 0 key (13631488 EXTENT_ITEM 8192) itemoff 16198 itemsize 85")
            .unwrap();
        scanner.step("\t\trefs 3 gen 9 flags DATA").unwrap();
        scanner.step(&backref("256", 260)).unwrap();
        assert_eq!(scanner.state, State::BackrefSpeculative);
        assert_eq!(scanner.speculative.len(), 1);
        assert!(scanner.visited.is_empty());

        scanner.step(&backref("256", 257)).unwrap();
        assert_eq!(scanner.state, State::Backref);
        assert!(scanner.speculative.is_empty());
        assert_eq!(scanner.visited.len(), 1);
    }

    #[test]
    fn unconfirmed_speculative_owners_are_discarded_at_block_boundary() {
        let mut scanner = scanner();
        scanner
            .step("\titem 0 key (13631488 EXTENT_ITEM 8192) itemoff 16198 itemsize 85")
            .unwrap();
        scanner.step("\t\trefs 2 gen 9 flags DATA").unwrap();
        scanner.step(&backref("256", 260)).unwrap();

        // Target never appears; next header drops the buffered owner.
        scanner
            .step("\titem 1 key (13639680 EXTENT_ITEM 4096) itemoff 16145 itemsize 53")
            .unwrap();
        assert!(scanner.speculative.is_empty());
        assert!(scanner.visited.is_empty());
    }

    #[test]
    fn target_is_never_recorded_as_its_own_sharer() {
        let mut scanner = scanner();
        scanner
            .step("\titem 0 key (13631488 EXTENT_ITEM 8192) itemoff 16198 itemsize 85")
            .unwrap();
        scanner.step("\t\trefs 2 gen 9 flags DATA").unwrap();
        scanner.step(&backref("256", 257)).unwrap();
        // Same inode again at another file offset.
        scanner
            .step("\t\textent data backref root 256 objectid 257 offset 8192 count 1")
            .unwrap();
        assert_eq!(scanner.state, State::Backref);
        assert!(scanner.visited.is_empty());
    }

    #[test]
    fn fs_root_target_matches_fs_root_token() {
        let fs_root_target = OwnerId::new(SubvolId::FS_ROOT, InodeNumber(257));
        let mut scanner =
            TreeDumpScanner::new(fs_root_target, ScanConfig::default(), NoopResolver);
        scanner
            .step("\titem 0 key (13631488 EXTENT_ITEM 8192) itemoff 16198 itemsize 85")
            .unwrap();
        scanner.step("\t\trefs 2 gen 9 flags DATA").unwrap();
        scanner.step(&backref("FS_ROOT", 257)).unwrap();
        assert_eq!(scanner.state, State::Backref);
    }

    #[test]
    fn malformed_backref_line_does_not_disturb_the_block() {
        let mut scanner = scanner();
        scanner
            .step("\titem 0 key (13631488 EXTENT_ITEM 8192) itemoff 16198 itemsize 85")
            .unwrap();
        scanner.step("\t\trefs 3 gen 9 flags DATA").unwrap();
        scanner.step(&backref("256", 257)).unwrap();
        scanner.step(&backref("garbage", 260)).unwrap();
        assert_eq!(scanner.state, State::Backref);
        assert!(scanner.visited.is_empty());
        scanner.step(&backref("256", 261)).unwrap();
        assert_eq!(scanner.visited.len(), 1);
    }
}
