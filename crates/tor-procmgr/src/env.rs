//! Environment identity: where one daemon instance lives on disk.

use std::fmt::{self, Display};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::err::ProcError;

/// How many bytes of the digest make up a fid.
const FID_LEN: usize = 6;

/// A stable short identifier for one environment.
///
/// Two environments collide iff any of their directories alias; the fid
/// is the process-wide key for the supervisor keeper and the runtime
/// singleton map.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Fid(String);

impl Fid {
    /// Derive the fid for a pair of directories.
    fn derive(work_dir: &Path, cache_dir: &Path) -> Self {
        let mut hash = Sha256::new();
        hash.update(work_dir.as_os_str().as_encoded_bytes());
        hash.update([0_u8]);
        hash.update(cache_dir.as_os_str().as_encoded_bytes());
        let digest = hash.finalize();
        Fid(hex::encode(&digest[..FID_LEN]))
    }

    /// The fid as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One daemon instance's place on disk: a work directory for runtime
/// state and a cache directory for downloaded data.
///
/// Both directories are created (mode `700` on unix) when the
/// environment is built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TorEnv {
    /// Runtime state: torrc, control files, data directory.
    work_dir: PathBuf,
    /// Cached network documents.
    cache_dir: PathBuf,
    /// The derived identity.
    fid: Fid,
}

impl TorEnv {
    /// Build an environment rooted at the two directories, creating them
    /// if needed.
    pub fn new(
        work_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self, ProcError> {
        let work_dir = absolutize(work_dir.into()).map_err(ProcError::io)?;
        let cache_dir = absolutize(cache_dir.into()).map_err(ProcError::io)?;
        create_dir_700(&work_dir).map_err(ProcError::io)?;
        create_dir_700(&cache_dir).map_err(ProcError::io)?;
        let fid = Fid::derive(&work_dir, &cache_dir);
        Ok(TorEnv {
            work_dir,
            cache_dir,
            fid,
        })
    }

    /// The work directory.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The environment's identity.
    pub fn fid(&self) -> &Fid {
        &self.fid
    }

    /// `DataDirectory`.
    pub fn data_dir(&self) -> PathBuf {
        self.work_dir.join("data")
    }

    /// The (possibly empty) torrc file passed with `-f`.
    pub fn torrc_file(&self) -> PathBuf {
        self.work_dir.join("torrc")
    }

    /// The defaults file passed with `--defaults-torrc`.
    pub fn torrc_defaults_file(&self) -> PathBuf {
        self.work_dir.join("torrc-defaults")
    }

    /// `ControlPortWriteToFile`.
    pub fn control_port_file(&self) -> PathBuf {
        self.work_dir.join("control.txt")
    }

    /// `CookieAuthFile`.
    pub fn cookie_auth_file(&self) -> PathBuf {
        self.work_dir.join("control_auth_cookie")
    }

    /// The unix control socket, where supported.
    pub fn control_socket(&self) -> PathBuf {
        self.work_dir.join("control.sock")
    }

    /// The directory for one named hidden service.
    pub fn hidden_service_dir(&self, name: &str) -> PathBuf {
        self.work_dir.join("hidden_services").join(name)
    }
}

/// Resolve a possibly-relative path against the current directory.
fn absolutize(path: PathBuf) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Create a directory (and its parents) owner-only.
pub(crate) fn create_dir_700(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Create a file owner-only if it does not exist.
pub(crate) fn create_file_600(file: &Path) -> io::Result<()> {
    if file.exists() {
        return Ok(());
    }
    fs::write(file, b"")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(file, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
