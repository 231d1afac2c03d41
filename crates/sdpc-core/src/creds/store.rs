//! Atomic credential rotation.
//!
//! A received bundle lands in four places, in fixed order: the TLS
//! certificate file, the TLS key file, the SPA key values in the client
//! config, and the SPA key values in the fwknop rc file. Each target is
//! backed up on disk before it is touched; any failure restores the
//! already-written targets in reverse order, so the four files are
//! always observed either all-old or all-new. Backups are discarded only
//! once the whole rotation has succeeded, and only then are the
//! in-memory SPA keys in the transport swapped.

use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::keyfile;
use crate::com::ControlChannel;
use crate::error::{Error, Result};
use crate::protocol::CredentialBundle;

/// The four rotation targets plus the fwknoprc stanza scoping the keys.
#[derive(Debug, Clone)]
pub struct CredFilePaths {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub config_file: PathBuf,
    pub fwknoprc_file: PathBuf,
    pub ctrl_stanza: String,
}

/// Apply a credential bundle to disk, then swap the in-memory SPA keys
/// in the transport.
///
/// A transport-side failure after the files are consistent is reported
/// as a warning only; the next restart re-reads the files.
pub fn apply<C: ControlChannel>(
    paths: &CredFilePaths,
    bundle: &CredentialBundle,
    com: &mut C,
) -> Result<()> {
    let mut applied: Vec<FileBackup> = Vec::with_capacity(4);

    let result = (|| -> Result<()> {
        debug!(path = %paths.cert_file.display(), "storing client certificate");
        applied.push(FileBackup::create(&paths.cert_file)?);
        write_private(&paths.cert_file, bundle.tls_client_cert.as_bytes())?;

        debug!(path = %paths.key_file.display(), "storing client key");
        applied.push(FileBackup::create(&paths.key_file)?);
        write_private(&paths.key_file, bundle.tls_client_key.as_bytes())?;

        debug!(path = %paths.config_file.display(), "storing SPA keys in client config");
        applied.push(FileBackup::create(&paths.config_file)?);
        keyfile::replace_client_spa_keys(
            &paths.config_file,
            &bundle.spa_encryption_key,
            &bundle.spa_hmac_key,
        )?;

        debug!(path = %paths.fwknoprc_file.display(), "storing SPA keys in fwknop config");
        applied.push(FileBackup::create(&paths.fwknoprc_file)?);
        keyfile::replace_fwknop_spa_keys(
            &paths.fwknoprc_file,
            &paths.ctrl_stanza,
            &bundle.spa_encryption_key,
            &bundle.spa_hmac_key,
        )?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            for backup in applied {
                backup.discard();
            }
            debug!("all new credentials stored");

            if let Err(e) = com.set_spa_keys(&bundle.spa_encryption_key, &bundle.spa_hmac_key) {
                warn!(error = %e, "failed to install SPA keys in transport; files are consistent");
            }
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "credential rotation failed, restoring previous files");
            for backup in applied.into_iter().rev() {
                backup.restore();
            }
            Err(e)
        }
    }
}

/// Write `contents` to `path` with owner-only permissions via a sibling
/// temp file and rename, so a target is never observed half-written.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = sibling(path, ".tmp");

    let io_result = (|| -> std::io::Result<()> {
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    io_result.map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::Filesystem {
            path: path.display().to_string(),
            message: format!("write failed: {e}"),
        }
    })
}

/// On-disk backup of one rotation target.
struct FileBackup {
    original: PathBuf,
    /// None when the original did not exist yet (first provisioning).
    backup: Option<PathBuf>,
}

impl FileBackup {
    fn create(path: &Path) -> Result<Self> {
        let original = path.to_path_buf();

        if !path.exists() {
            return Ok(Self {
                original,
                backup: None,
            });
        }

        let backup = sibling(path, ".bak");
        fs::copy(path, &backup).map_err(|e| Error::Filesystem {
            path: path.display().to_string(),
            message: format!("failed to back up: {e}"),
        })?;

        Ok(Self {
            original,
            backup: Some(backup),
        })
    }

    /// Put the previous content back. Failures are logged; rollback
    /// keeps going for the remaining targets.
    fn restore(self) {
        match self.backup {
            Some(backup) => {
                if let Err(e) = fs::rename(&backup, &self.original) {
                    warn!(
                        path = %self.original.display(),
                        error = %e,
                        "failed to restore backup"
                    );
                }
            }
            None => {
                let _ = fs::remove_file(&self.original);
            }
        }
    }

    fn discard(self) {
        if let Some(backup) = self.backup {
            let _ = fs::remove_file(backup);
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}
