//! Named pipes connecting the capture process to its downstream readers.
//!
//! A topology is a keyed set of FIFO paths, one per downstream role. The
//! command builder and the supervisor both look paths up here instead of
//! formatting them at each call site.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A downstream consumer fed through its own FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeRole {
    LossyEncode,
    Recognition,
    LosslessRecord,
}

impl PipeRole {
    pub const ALL: [PipeRole; 3] = [
        PipeRole::LossyEncode,
        PipeRole::Recognition,
        PipeRole::LosslessRecord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipeRole::LossyEncode => "lossy-encode",
            PipeRole::Recognition => "recognition",
            PipeRole::LosslessRecord => "lossless-record",
        }
    }
}

impl fmt::Display for PipeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeTopology {
    paths: BTreeMap<PipeRole, PathBuf>,
}

impl PipeTopology {
    /// Lay out one FIFO per role under `dir`, namespaced by device so two
    /// devices never share a path.
    pub fn new(dir: impl AsRef<Path>, device: &str) -> Self {
        let dir = dir.as_ref();
        let slug = device_slug(device);

        let paths = PipeRole::ALL
            .iter()
            .map(|role| (*role, dir.join(format!("{}-{}.fifo", slug, role.as_str()))))
            .collect();

        Self { paths }
    }

    /// Path for a role. Every role in [`PipeRole::ALL`] has one.
    pub fn path(&self, role: PipeRole) -> &Path {
        &self.paths[&role]
    }

    pub fn iter(&self) -> impl Iterator<Item = (PipeRole, &Path)> {
        self.paths.iter().map(|(role, path)| (*role, path.as_path()))
    }

    /// Remove any stale FIFOs and create fresh ones.
    ///
    /// Recreating on every session start guarantees a reader never sees bytes
    /// written during a previous session.
    pub fn create(&self) -> Result<()> {
        for (role, path) in self.iter() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create pipe directory {:?}", parent))?;
            }

            remove_if_present(path)
                .with_context(|| format!("Failed to remove stale pipe {:?}", path))?;

            mkfifo(path).with_context(|| format!("Failed to create {} pipe {:?}", role, path))?;
            debug!("Created {} pipe at {}", role, path.display());
        }

        info!("Pipe topology created ({} pipes)", self.paths.len());
        Ok(())
    }

    /// Delete every FIFO. Missing files are fine; other failures are logged
    /// and the remaining pipes are still removed.
    pub fn remove(&self) {
        for (role, path) in self.iter() {
            if let Err(e) = remove_if_present(path) {
                warn!("Failed to remove {} pipe {}: {}", role, path.display(), e);
            }
        }
    }

    pub fn all_exist(&self) -> bool {
        self.iter().all(|(_, path)| is_fifo(path))
    }

    pub fn none_exist(&self) -> bool {
        self.iter().all(|(_, path)| !path.exists())
    }
}

pub fn is_fifo(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn mkfifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .context("Pipe path contains an interior NUL byte")?;

    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        bail!("mkfifo failed: {}", err);
    }

    Ok(())
}

/// Filesystem-safe name for a device. The readable part is lossy, so a hash
/// of the raw name keeps distinct devices apart.
pub(crate) fn device_slug(device: &str) -> String {
    let readable: String = device
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let readable = if readable.is_empty() { "default" } else { readable.as_str() };

    format!("{}-{:08x}", readable, fnv1a(device.as_bytes()))
}

/// 32-bit FNV-1a; stable across builds and platforms.
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}
