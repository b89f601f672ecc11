//! Output collection: captures files left behind by a script
//!
//! After a local create/update the working directory is walked once, and the
//! `assetPaths` and `archivePaths` rule sets each pick their own subset of the
//! regular files found. Paths are always `/`-separated and relative to the
//! working directory.
//!
//! Files may disappear between the directory listing and hashing (the script
//! that just ran is free to clean up after itself); such files are skipped.

use crate::error::{CommandError, Result};
use crate::glob::RuleSet;
use crate::models::{Archive, Asset};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path};
use tar::{Builder, Header};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Files captured by one collection pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedOutputs {
    pub assets: BTreeMap<String, Asset>,
    pub archive: Option<Archive>,
}

/// Walks a working directory and evaluates asset/archive rule sets
#[derive(Debug, Clone, Default)]
pub struct OutputCollector;

impl OutputCollector {
    pub fn new() -> Self {
        Self
    }

    /// Collect assets and the archive under `dir`.
    ///
    /// Returns empty outputs without touching the filesystem when both rule
    /// sets are empty.
    pub fn collect<S: AsRef<str>>(
        &self,
        dir: &Path,
        asset_paths: &[S],
        archive_paths: &[S],
    ) -> Result<CollectedOutputs> {
        let asset_rules = RuleSet::parse(asset_paths)?;
        let archive_rules = RuleSet::parse(archive_paths)?;

        if asset_rules.is_empty() && archive_rules.is_empty() {
            return Ok(CollectedOutputs::default());
        }

        let files = list_files(dir)?;
        debug!("Found {} candidate files under {}", files.len(), dir.display());

        let assets = select(dir, &files, &asset_rules)?;
        let archived = select(dir, &files, &archive_rules)?;
        let archive = if archived.is_empty() {
            None
        } else {
            Some(Archive::new(archived))
        };

        info!(
            "Collected {} asset(s) and {} archived file(s) from {}",
            assets.len(),
            archive.as_ref().map_or(0, |a| a.assets.len()),
            dir.display()
        );

        Ok(CollectedOutputs { assets, archive })
    }
}

impl OutputCollector {
    /// Content digest of a file, or of every regular file under a directory.
    ///
    /// A directory digest covers relative paths and file contents, the same
    /// way an [`Archive`] digest does.
    pub fn digest_path(&self, path: &Path) -> Result<String> {
        let copy_error = |message: String| CommandError::Copy {
            path: path.display().to_string(),
            message,
        };
        let metadata = std::fs::metadata(path).map_err(|e| copy_error(e.to_string()))?;

        if metadata.is_dir() {
            let files = list_files(path)?;
            let everything = RuleSet::parse(&["**"])?;
            Ok(Archive::new(select(path, &files, &everything)?).sha256)
        } else {
            hash_file(path)
                .map(|(sha256, _)| sha256)
                .map_err(|e| copy_error(e.to_string()))
        }
    }
}

/// Every regular file under `dir`, as sorted relative `/`-separated paths
fn list_files(dir: &Path) -> Result<Vec<String>> {
    let collection_error = |message: String| CommandError::Collection {
        path: dir.display().to_string(),
        message,
    };

    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() > 0 && is_not_found(&e) => {
                debug!("Skipping vanished entry: {}", e);
                continue;
            }
            Err(e) => return Err(collection_error(e.to_string())),
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| collection_error(e.to_string()))?;
        let relative = to_slash_path(relative);
        if !relative.is_empty() {
            files.push(relative);
        }
    }

    Ok(files)
}

fn is_not_found(e: &walkdir::Error) -> bool {
    e.io_error()
        .is_some_and(|io| io.kind() == io::ErrorKind::NotFound)
}

pub(crate) fn to_slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn select(dir: &Path, files: &[String], rules: &RuleSet) -> Result<BTreeMap<String, Asset>> {
    let mut assets = BTreeMap::new();
    if rules.is_empty() {
        return Ok(assets);
    }

    for path in files.iter().filter(|p| rules.selects(p)) {
        let source = dir.join(path);
        match hash_file(&source) {
            Ok((sha256, size)) => {
                assets.insert(
                    path.clone(),
                    Asset {
                        path: path.clone(),
                        source: source.display().to_string(),
                        sha256,
                        size,
                    },
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Skipping file removed during collection: {}", path);
            }
            Err(e) => {
                return Err(CommandError::Collection {
                    path: source.display().to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    Ok(assets)
}

fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

impl Archive {
    /// Bundle `assets` and compute the archive digest
    pub fn new(assets: BTreeMap<String, Asset>) -> Self {
        let mut hasher = Sha256::new();
        for (path, asset) in &assets {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(asset.sha256.as_bytes());
            hasher.update([b'\n']);
        }
        Self {
            assets,
            sha256: hex::encode(hasher.finalize()),
        }
    }

    /// Write the bundle as a canonical tar stream.
    ///
    /// Entries are sorted by path with zeroed mtime/uid/gid and normalized
    /// 0644/0755 modes, so identical contents produce identical bytes.
    pub fn write_tar<W: Write>(&self, out: W) -> Result<()> {
        let mut builder = Builder::new(out);

        for (path, asset) in &self.assets {
            let source = Path::new(&asset.source);
            let mut contents = Vec::new();
            File::open(source)?.read_to_end(&mut contents)?;

            let mut header = Header::new_gnu();
            header.set_path(path)?;
            header.set_size(contents.len() as u64);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(if is_executable(source) { 0o755 } else { 0o644 });
            header.set_cksum();

            builder.append(&header, contents.as_slice())?;
        }

        builder.into_inner()?.flush()?;
        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}
