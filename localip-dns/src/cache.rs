//! File-backed storage for the two PEM blobs that make up the serving
//! certificate, so a restart does not always have to hit the ACME
//! directory.

use std::error;
use std::fmt;
use std::path::{Path, PathBuf};

use tokio::fs;

#[derive(Debug)]
pub enum Error {
    NotFound { key: String },
    Io { key: String, source: std::io::Error },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound { key } => write!(f, "cache entry {key:?} not found"),
            Error::Io { key, source } => write!(f, "cache entry {key:?}: {source}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::NotFound { .. } => None,
            Error::Io { source, .. } => Some(source),
        }
    }
}

/// A place to persist opaque, named blobs of data.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, Error>;
    async fn put(&self, key: &str, payload: &[u8]) -> Result<(), Error>;
}

/// A cache backed by a directory on disk, one file per key.
///
/// The directory is created with mode 0700 on first write, and every
/// file is written with mode 0600: the cached blobs are a private key
/// and a certificate, neither of which should be world-readable.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl Cache for FileCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        let path = self.dir.join(key);
        fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound {
                    key: key.to_string(),
                }
            } else {
                Error::Io {
                    key: key.to_string(),
                    source,
                }
            }
        })
    }

    async fn put(&self, key: &str, payload: &[u8]) -> Result<(), Error> {
        create_dir(&self.dir).await.map_err(|source| Error::Io {
            key: key.to_string(),
            source,
        })?;

        let path = self.dir.join(key);
        write_file(&path, payload)
            .await
            .map_err(|source| Error::Io {
                key: key.to_string(),
                source,
            })
    }
}

#[cfg(unix)]
async fn create_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match fs::create_dir_all(dir).await {
        Ok(()) => {
            fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(not(unix))]
async fn create_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir).await
}

#[cfg(unix)]
async fn write_file(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, payload).await?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn write_file(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    fs::write(path, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_a_value() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());

        cache.put("cert.pem", b"hello").await.unwrap();
        let got = cache.get("cert.pem").await.unwrap();
        assert_eq!(b"hello".to_vec(), got);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());

        let err = cache.get("cert.pem").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sets_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("nested"));
        cache.put("key.pem", b"secret").await.unwrap();

        let file_perms = fs::metadata(dir.path().join("nested").join("key.pem"))
            .await
            .unwrap()
            .permissions();
        assert_eq!(0o600, file_perms.mode() & 0o777);

        let dir_perms = fs::metadata(dir.path().join("nested"))
            .await
            .unwrap()
            .permissions();
        assert_eq!(0o700, dir_perms.mode() & 0o777);
    }
}
