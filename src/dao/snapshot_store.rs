use std::{io::ErrorKind, path::PathBuf};

use futures::future::BoxFuture;
use tracing::debug;

use crate::{
    dao::storage::{StorageError, StorageResult},
    state::session::Session,
};

/// Persistence boundary around the session aggregate.
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot; `None` clears it.
    fn save(&self, session: Option<Session>) -> BoxFuture<'static, StorageResult<()>>;
    /// Read back the last stored snapshot, if any.
    fn load(&self) -> BoxFuture<'static, StorageResult<Option<Session>>>;
}

/// Stores the session as a JSON document on local disk.
///
/// Writes go to a sibling temporary file that is renamed over the target, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Store snapshots at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "session.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, session: Option<Session>) -> BoxFuture<'static, StorageResult<()>> {
        let path = self.path.clone();
        let temp = self.temp_path();
        Box::pin(async move {
            let Some(session) = session else {
                return match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                    Err(err) => Err(StorageError::unavailable(
                        format!("failed to remove snapshot {}", path.display()),
                        err,
                    )),
                };
            };

            let bytes = serde_json::to_vec_pretty(&session).map_err(|err| {
                StorageError::corrupt("failed to encode session snapshot".into(), err)
            })?;

            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    StorageError::unavailable(
                        format!("failed to create {}", parent.display()),
                        err,
                    )
                })?;
            }
            tokio::fs::write(&temp, &bytes).await.map_err(|err| {
                StorageError::unavailable(format!("failed to write {}", temp.display()), err)
            })?;
            tokio::fs::rename(&temp, &path).await.map_err(|err| {
                StorageError::unavailable(format!("failed to replace {}", path.display()), err)
            })?;

            debug!(path = %path.display(), bytes = bytes.len(), "session snapshot written");
            Ok(())
        })
    }

    fn load(&self) -> BoxFuture<'static, StorageResult<Option<Session>>> {
        let path = self.path.clone();
        Box::pin(async move {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(StorageError::unavailable(
                        format!("failed to read {}", path.display()),
                        err,
                    ));
                }
            };

            serde_json::from_slice(&bytes).map(Some).map_err(|err| {
                StorageError::corrupt(format!("failed to decode {}", path.display()), err)
            })
        })
    }
}
