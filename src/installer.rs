//! Fetch, validate, back up and atomically install the server binary.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::task;

use crate::config::Config;

const BACKUP_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("download of {url} failed: {message}")]
    DownloadFailed { url: String, message: String },
    #[error("source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),
    #[error("source is not a valid executable ({reason})")]
    InvalidArtifact { reason: String },
    #[error("failed to {action} '{}': {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("install task aborted: {0}")]
    Aborted(String),
}

impl InstallError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| InstallError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    pub installed: PathBuf,
    pub format: &'static str,
    pub backup: Option<BackupEntry>,
}

#[derive(Debug)]
enum Artifact {
    Local(PathBuf),
    Downloaded(NamedTempFile),
}

impl Artifact {
    fn path(&self) -> &Path {
        match self {
            Artifact::Local(path) => path,
            Artifact::Downloaded(file) => file.path(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BinaryInstaller {
    binary_path: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
    client: reqwest::Client,
}

impl BinaryInstaller {
    pub fn new(
        binary_path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        max_backups: usize,
        download_timeout: Duration,
    ) -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .timeout(download_timeout)
            .build()
            .map_err(|error| InstallError::DownloadFailed {
                url: String::new(),
                message: error.to_string(),
            })?;
        Ok(Self {
            binary_path: binary_path.into(),
            backup_dir: backup_dir.into(),
            max_backups,
            client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, InstallError> {
        Self::new(
            &config.server.binary_path,
            &config.backup.dir,
            config.backup.max_backups,
            config.deploy.download_timeout,
        )
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Installs `source`, a local path or an http(s) URL, over the live
    /// binary. The live binary is only touched once the artifact validated.
    pub async fn install(&self, source: &str) -> Result<InstallOutcome, InstallError> {
        let artifact = if is_url(source) {
            Artifact::Downloaded(self.download(source).await?)
        } else {
            let path = PathBuf::from(source);
            if !path.is_file() {
                return Err(InstallError::SourceNotFound(path));
            }
            Artifact::Local(path)
        };

        let installer = self.clone();
        task::spawn_blocking(move || installer.install_artifact(artifact.path()))
            .await
            .map_err(|error| InstallError::Aborted(error.to_string()))?
    }

    async fn download(&self, url: &str) -> Result<NamedTempFile, InstallError> {
        let failed = |message: String| InstallError::DownloadFailed {
            url: url.to_string(),
            message,
        };
        tracing::info!(%url, "downloading artifact");

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| failed(error.to_string()))?;

        let mut file = NamedTempFile::new().map_err(|error| failed(error.to_string()))?;
        let mut written = 0usize;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|error| failed(error.to_string()))?
        {
            file.write_all(&chunk)
                .map_err(|error| failed(error.to_string()))?;
            written += chunk.len();
        }
        file.flush().map_err(|error| failed(error.to_string()))?;

        tracing::info!(%url, bytes = written, "artifact downloaded");
        Ok(file)
    }

    fn install_artifact(&self, artifact: &Path) -> Result<InstallOutcome, InstallError> {
        let format = validate_executable(artifact)?;

        let backup = match self.backup_current(artifact) {
            Ok(backup) => backup,
            Err(error) => {
                tracing::warn!(%error, "backup of current binary failed; continuing install");
                None
            }
        };
        if backup.is_some() {
            if let Err(error) = self.rotate() {
                tracing::warn!(%error, "failed to rotate backups");
            }
        }

        self.place(artifact)?;
        tracing::info!(
            path = %self.binary_path.display(),
            format,
            backup = ?backup.as_ref().map(|entry| entry.path.display().to_string()),
            "binary installed"
        );
        Ok(InstallOutcome {
            installed: self.binary_path.clone(),
            format,
            backup,
        })
    }

    fn backup_current(&self, replacement: &Path) -> Result<Option<BackupEntry>, InstallError> {
        if !self.binary_path.is_file() {
            tracing::info!(path = %self.binary_path.display(), "no installed binary to back up");
            return Ok(None);
        }
        if files_identical(&self.binary_path, replacement)
            .map_err(InstallError::io("compare", &self.binary_path))?
        {
            tracing::info!("installed binary is identical to the artifact; skipping backup");
            return Ok(None);
        }

        fs::create_dir_all(&self.backup_dir)
            .map_err(InstallError::io("create backup directory", &self.backup_dir))?;

        let mut created_at = Utc::now();
        let mut path = self.backup_path(created_at);
        while path.exists() {
            created_at += chrono::Duration::microseconds(1);
            path = self.backup_path(created_at);
        }
        fs::copy(&self.binary_path, &path).map_err(InstallError::io("back up binary to", &path))?;

        tracing::info!(backup = %path.display(), "backed up current binary");
        Ok(Some(BackupEntry { path, created_at }))
    }

    fn backup_prefix(&self) -> String {
        let name = self
            .binary_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "binary".to_string());
        format!("{name}_")
    }

    fn backup_path(&self, created_at: DateTime<Utc>) -> PathBuf {
        self.backup_dir.join(format!(
            "{}{}",
            self.backup_prefix(),
            created_at.format(BACKUP_STAMP_FORMAT)
        ))
    }

    /// Backups of this binary, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>, InstallError> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(InstallError::io("read", &self.backup_dir)(error)),
        };

        let prefix = self.backup_prefix();
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(InstallError::io("read", &self.backup_dir))?;
            let name = entry.file_name();
            let Some(stamp) = name.to_str().and_then(|name| name.strip_prefix(&prefix)) else {
                continue;
            };
            let Some(created_at) = parse_backup_stamp(stamp) else {
                continue;
            };
            backups.push(BackupEntry {
                path: entry.path(),
                created_at,
            });
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Deletes backups beyond the retention limit, oldest first.
    fn rotate(&self) -> Result<usize, InstallError> {
        let backups = self.list_backups()?;
        let mut removed = 0;
        for stale in backups.iter().skip(self.max_backups) {
            fs::remove_file(&stale.path).map_err(InstallError::io("remove backup", &stale.path))?;
            tracing::debug!(backup = %stale.path.display(), "removed old backup");
            removed += 1;
        }
        Ok(removed)
    }

    pub async fn restore_backup(&self, entry: &BackupEntry) -> Result<(), InstallError> {
        let installer = self.clone();
        let source = entry.path.clone();
        task::spawn_blocking(move || {
            validate_executable(&source)?;
            installer.place(&source)?;
            tracing::info!(backup = %source.display(), "restored binary from backup");
            Ok(())
        })
        .await
        .map_err(|error| InstallError::Aborted(error.to_string()))?
    }

    /// Copies next to the destination, marks it executable, then renames over
    /// the live path so it never holds a partial file.
    fn place(&self, artifact: &Path) -> Result<(), InstallError> {
        if let Some(parent) = self.binary_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(InstallError::io("create", parent))?;
            }
        }
        let mut partial = self.binary_path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let result = fs::copy(artifact, &partial)
            .map_err(InstallError::io("copy artifact to", &partial))
            .and_then(|_| {
                fs::set_permissions(&partial, fs::Permissions::from_mode(0o755))
                    .map_err(InstallError::io("chmod", &partial))
            })
            .and_then(|()| {
                fs::rename(&partial, &self.binary_path)
                    .map_err(InstallError::io("rename into", &self.binary_path))
            });
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }
}

pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Checks the leading magic bytes and returns the detected format name.
pub fn validate_executable(path: &Path) -> Result<&'static str, InstallError> {
    let mut header = [0u8; 4];
    let mut file = File::open(path).map_err(|error| match error.kind() {
        io::ErrorKind::NotFound => InstallError::SourceNotFound(path.to_path_buf()),
        _ => InstallError::io("open", path)(error),
    })?;
    let read = read_up_to(&mut file, &mut header).map_err(InstallError::io("read", path))?;
    detect_format(&header[..read]).ok_or_else(|| InstallError::InvalidArtifact {
        reason: if read == 0 {
            "file is empty".to_string()
        } else {
            format!("unrecognized header {}", hex(&header[..read]))
        },
    })
}

fn detect_format(header: &[u8]) -> Option<&'static str> {
    match header {
        [0x7f, b'E', b'L', b'F', ..] => Some("elf"),
        [0xfe, 0xed, 0xfa, 0xce, ..]
        | [0xce, 0xfa, 0xed, 0xfe, ..]
        | [0xfe, 0xed, 0xfa, 0xcf, ..]
        | [0xcf, 0xfa, 0xed, 0xfe, ..] => Some("mach-o"),
        [0xca, 0xfe, 0xba, 0xbe, ..] => Some("mach-o universal"),
        [b'M', b'Z', ..] => Some("pe"),
        _ => None,
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(filled)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn files_identical(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    Ok(fs::read(a)? == fs::read(b)?)
}

fn parse_backup_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    let (seconds, micros) = stamp.rsplit_once('_')?;
    if micros.len() != 6 {
        return None;
    }
    let micros: u32 = micros.parse().ok()?;
    let naive = NaiveDateTime::parse_from_str(seconds, "%Y%m%d_%H%M%S").ok()?;
    let naive = naive.with_nanosecond(micros * 1_000)?;
    Some(naive.and_utc())
}
