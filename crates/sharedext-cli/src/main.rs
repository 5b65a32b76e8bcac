#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use rustix::fs::{AtFlags, FileType, StatxFlags};
use serde::Serialize;
use sharedext_scan::{LogicalResolver, ResolveError, ScanConfig, TreeDumpScanner};
use sharedext_types::{InodeNumber, OwnerId, SubvolId};
use std::collections::BTreeSet;
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let options = match parse_args(env::args().skip(1)) {
        Ok(Some(options)) => options,
        Ok(None) => {
            print_usage();
            return Ok(());
        }
        Err(error) => {
            print_usage();
            return Err(error);
        }
    };
    init_logging(options.verbose)?;

    let target = query_target_identity(&options.file)?;
    debug!(target: "sharedext::cli", owner = %target, "established target identity");

    let dir = containing_dir(&options.file);
    let device = locate_device(&dir)?;
    info!(
        target: "sharedext::cli",
        device = %device.display(),
        "scanning extent tree"
    );

    let paths = scan_device(&device, &dir, target, options.verbose)?;
    render_report(options.json, &paths)
}

fn print_usage() {
    println!("sharedext — report btrfs files sharing extents with <file>\n");
    println!("USAGE:");
    println!("  sharedext [-d] [--json] <file>\n");
    println!("OPTIONS:");
    println!("  -d          enable verbose scan diagnostics");
    println!("  --json      emit a machine-readable report");
    println!("  -h, --help  show this help");
}

// ── Argument handling ───────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
struct Options {
    verbose: bool,
    json: bool,
    file: PathBuf,
}

/// Parse the argument list. `Ok(None)` means help was requested.
fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Option<Options>> {
    let mut verbose = false;
    let mut json = false;
    let mut file = None;
    for arg in args {
        match arg.as_str() {
            "-d" => verbose = true,
            "--json" => json = true,
            "-h" | "--help" => return Ok(None),
            _ if arg.starts_with('-') && arg.len() > 1 => bail!("unknown flag: {arg}"),
            _ => {
                if file.replace(PathBuf::from(&arg)).is_some() {
                    bail!("expected exactly one <file> argument");
                }
            }
        }
    }
    let Some(file) = file else {
        bail!("missing <file> argument");
    };
    Ok(Some(Options { verbose, json, file }))
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    // stdout carries only the result lines; everything else is stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("failed to initialize logger: {err}"))
}

// ── External collaborators ──────────────────────────────────────────────────

/// Query the inspected file's identity: inode number, subvolume id, and
/// file type.
///
/// The containing filesystem is synced first so delalloc extents reach
/// the extent tree before it is dumped.
fn query_target_identity(path: &Path) -> Result<OwnerId> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    rustix::fs::syncfs(&file).with_context(|| {
        format!("failed to sync the filesystem containing {}", path.display())
    })?;

    // `STATX_SUBVOL` (0x8000) is not exposed as a named constant by this
    // rustix version; build it from its kernel value via the bitflags
    // externally-defined-flags escape hatch.
    let subvol = StatxFlags::from_bits_retain(0x8000);
    let wanted = StatxFlags::TYPE | StatxFlags::INO | subvol;
    let stx = rustix::fs::statx(&file, "", AtFlags::EMPTY_PATH, wanted)
        .with_context(|| format!("statx failed for {}", path.display()))?;
    if !StatxFlags::from_bits_retain(stx.stx_mask).contains(wanted) {
        bail!("statx did not report type, inode, and subvolume id (kernel 6.10+ required)");
    }
    if FileType::from_raw_mode(u32::from(stx.stx_mode)) != FileType::RegularFile {
        bail!("{} is not a regular file", path.display());
    }
    Ok(OwnerId::new(SubvolId(stx.stx_subvol), InodeNumber(stx.stx_ino)))
}

/// Directory containing `path`, with dirname semantics: a bare filename
/// resolves to `.`.
fn containing_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Find the block device backing the filesystem mounted at `dir`.
///
/// `btrfs device stats` prints one counter per line as
/// `[<device>].<counter> <n>`; the first bracketed token names the
/// device.
fn locate_device(dir: &Path) -> Result<PathBuf> {
    let output = Command::new("btrfs")
        .args(["device", "stats"])
        .arg(dir)
        .stdin(Stdio::null())
        .output()
        .context("failed to run `btrfs device stats` (is btrfs-progs installed?)")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "`btrfs device stats` failed for {}: {}",
            dir.display(),
            stderr.trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let Some(device) = first_bracketed_token(&stdout) else {
        bail!(
            "cannot find the device that contains the filesystem at {}",
            dir.display()
        );
    };
    Ok(PathBuf::from(device))
}

fn first_bracketed_token(text: &str) -> Option<&str> {
    let start = text.find('[')? + 1;
    let len = text[start..].find(']')?;
    let token = &text[start..start + len];
    (!token.is_empty()).then_some(token)
}

/// Dump the extent tree of `device` and run the sharing scan over it.
fn scan_device(
    device: &Path,
    dir: &Path,
    target: OwnerId,
    verbose: bool,
) -> Result<BTreeSet<String>> {
    let mut child = Command::new("btrfs")
        .args(["inspect-internal", "dump-tree", "-t", "extent"])
        .arg(device)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
        .context("failed to launch `btrfs inspect-internal dump-tree`")?;
    let stdout = child
        .stdout
        .take()
        .context("dump-tree stdout was not captured")?;

    let scanner = TreeDumpScanner::new(
        target,
        ScanConfig { verbose },
        BtrfsLogicalResolver::new(dir),
    );
    let paths = scanner.scan(BufReader::new(stdout))?;

    let status = child.wait().context("failed to wait for dump-tree")?;
    check_subprocess("btrfs inspect-internal dump-tree", &status)?;
    Ok(paths)
}

fn check_subprocess(name: &str, status: &ExitStatus) -> Result<()> {
    if let Some(signal) = status.signal() {
        bail!("{name} was killed by signal {signal}");
    }
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => bail!("{name} exited with status {code}"),
        None => bail!("{name} ended without an exit status"),
    }
}

/// Production resolver: wraps `btrfs inspect-internal logical-resolve`.
///
/// One child per qualifying extent item, launched, fully drained, and
/// awaited before the tree-dump stream is read further.
struct BtrfsLogicalResolver {
    dir: PathBuf,
}

impl BtrfsLogicalResolver {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl LogicalResolver for BtrfsLogicalResolver {
    fn resolve(&mut self, logical_addr: &str) -> Result<Vec<String>, ResolveError> {
        let mut child = Command::new("btrfs")
            .args(["inspect-internal", "logical-resolve"])
            .arg(logical_addr)
            .arg(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(ResolveError::Launch)?;
        let Some(stdout) = child.stdout.take() else {
            return Err(ResolveError::Launch(std::io::Error::other(
                "stdout was not captured",
            )));
        };

        // Lines are kept verbatim, trailing newline included.
        let mut paths = Vec::new();
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            paths.push(line.clone());
        }

        let status = child.wait()?;
        if let Some(signal) = status.signal() {
            return Err(ResolveError::Killed { signal });
        }
        match status.code() {
            Some(0) => Ok(paths),
            Some(status) => Err(ResolveError::ExitStatus { status }),
            None => Err(ResolveError::ExitStatus { status: -1 }),
        }
    }
}

// ── Rendering ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ShareReport {
    exclusive: bool,
    paths: Vec<String>,
}

fn render_report(json: bool, paths: &BTreeSet<String>) -> Result<()> {
    if json {
        let report = ShareReport {
            exclusive: paths.is_empty(),
            paths: paths
                .iter()
                .map(|path| path.strip_suffix('\n').unwrap_or(path).to_owned())
                .collect(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
        return Ok(());
    }
    if paths.is_empty() {
        println!("This file has only exclusive extents.");
    } else {
        println!("Extents shared among:");
        for path in paths {
            // Entries carry their own newline when the resolver emitted
            // one.
            print!("{path}");
            if !path.ends_with('\n') {
                println!();
            }
        }
    }
    Ok(())
}
