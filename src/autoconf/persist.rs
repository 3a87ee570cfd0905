//! Persistence of the last good bootstrap response
//!
//! The response is stored as JSON at a well-known filename inside the data
//! directory. Absence is normal for a fresh agent; a corrupt file is
//! recoverable by re-bootstrapping, so callers treat decode failures like
//! absence after logging them. Writes go to a temporary sibling first and
//! are renamed into place.

use std::path::{Path, PathBuf};

use palisade_proto::AutoConfigResponse;

use crate::error::Error;

/// Name of the persisted file inside the data directory.
pub const FILE_NAME: &str = "auto-config.json";

/// Full path of the persisted file for a given data directory.
pub fn file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(FILE_NAME)
}

/// Read the persisted response. `Ok(None)` means no file exists.
pub(crate) async fn read(data_dir: &Path) -> crate::Result<Option<AutoConfigResponse>> {
    let path = file_path(data_dir);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&data).map(Some).map_err(|e| {
        Error::CorruptPersistence(format!("{}: {}", path.display(), e))
    })
}

/// Write the response, replacing any previous file.
///
/// The serialized form never contains the leaf private key; see
/// `palisade_proto::IssuedCert`.
pub(crate) async fn write(data_dir: &Path, response: &AutoConfigResponse) -> crate::Result<()> {
    let path = file_path(data_dir);
    let tmp = data_dir.join(format!("{FILE_NAME}.tmp"));

    let data = serde_json::to_vec_pretty(response)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    tokio::fs::write(&tmp, &data).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}
