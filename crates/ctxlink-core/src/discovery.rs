use crate::token::AuthToken;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LOCK_EXTENSION: &str = "lock";
pub const TRANSPORT_WS: &str = "ws";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to write discovery record {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to read discovery record {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("discovery record {path} is malformed: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("failed to remove discovery record {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

/// What the agent process reads to find and authenticate to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub port: u16,
    #[serde(rename = "pid")]
    pub owner_pid: u32,
    #[serde(rename = "workspaceFolders")]
    pub workspace_folders: Vec<String>,
    #[serde(rename = "ideName")]
    pub ide_name: String,
    pub transport: String,
    #[serde(rename = "authToken")]
    pub auth_token: AuthToken,
}

impl DiscoveryRecord {
    pub fn new(port: u16, token: AuthToken, workspace: &Path, ide_name: &str) -> Self {
        Self {
            port,
            owner_pid: std::process::id(),
            workspace_folders: vec![workspace.display().to_string()],
            ide_name: ide_name.to_string(),
            transport: TRANSPORT_WS.to_string(),
            auth_token: token,
        }
    }
}

/// Persistence for discovery records, keyed by port.
pub trait DiscoveryStore: Send + Sync {
    /// Persist the record and return the token a concurrent reader observes.
    fn create(&self, record: &DiscoveryRecord) -> Result<AuthToken, DiscoveryError>;

    fn remove(&self, port: u16) -> Result<(), DiscoveryError>;
}

/// One `<port>.lock` JSON file per running server inside a private directory.
#[derive(Debug, Clone)]
pub struct LockFileStore {
    dir: PathBuf,
}

impl LockFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, port: u16) -> PathBuf {
        self.dir.join(format!("{port}.{LOCK_EXTENSION}"))
    }

    pub fn read(&self, port: u16) -> Result<DiscoveryRecord, DiscoveryError> {
        read_record(&self.path_for(port))
    }

    /// All parseable records in the directory, ordered by port.
    pub fn list(&self) -> Result<Vec<DiscoveryRecord>, DiscoveryError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(DiscoveryError::Read {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut records = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some(LOCK_EXTENSION))
            .filter_map(|path| read_record(&path).ok())
            .collect::<Vec<_>>();
        records.sort_by_key(|record| record.port);
        Ok(records)
    }

    fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

impl DiscoveryStore for LockFileStore {
    fn create(&self, record: &DiscoveryRecord) -> Result<AuthToken, DiscoveryError> {
        let path = self.path_for(record.port);
        let write_err = |source| DiscoveryError::Write {
            path: path.clone(),
            source,
        };
        self.ensure_dir().map_err(write_err)?;
        let payload = serde_json::to_vec_pretty(record)
            .map_err(|err| write_err(io::Error::new(io::ErrorKind::InvalidData, err)))?;
        publish(&path, &payload)
    }

    fn remove(&self, port: u16) -> Result<(), DiscoveryError> {
        let path = self.path_for(port);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DiscoveryError::Remove { path, source }),
        }
    }
}

fn read_record(path: &Path) -> Result<DiscoveryRecord, DiscoveryError> {
    let raw = fs::read(path).map_err(|source| DiscoveryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|err| DiscoveryError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Write the record and read it back. A record that cannot be read back is
/// deleted so no agent picks up a half-published file.
fn publish(path: &Path, payload: &[u8]) -> Result<AuthToken, DiscoveryError> {
    write_atomic(path, payload).map_err(|source| DiscoveryError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    match read_record(path) {
        Ok(echoed) => Ok(echoed.auth_token),
        Err(err) => {
            let _ = fs::remove_file(path);
            Err(err)
        }
    }
}

fn write_atomic(path: &Path, payload: &[u8]) -> io::Result<()> {
    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!(".{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };

    fs::write(&temp_path, payload)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))?;
    }
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    Ok(())
}

/// `$CTXLINK_DISCOVERY_DIR`, else `~/.ctxlink/ide`.
pub fn default_discovery_dir() -> PathBuf {
    if let Ok(value) = std::env::var("CTXLINK_DISCOVERY_DIR") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".ctxlink").join("ide"))
        .unwrap_or_else(|| std::env::temp_dir().join("ctxlink").join("ide"))
}
