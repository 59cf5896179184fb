//! Unpacking artifacts onto the local filesystem

use crate::error::{GantryError, GantryResult};
use crate::exec::{ArtifactDestination, ByteStream};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio_util::io::SyncIoBridge;
use tracing::debug;

/// Destination unpacking tar streams under a root directory
#[derive(Debug, Clone)]
pub struct DirectoryDestination {
    root: PathBuf,
}

impl DirectoryDestination {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` under the root, refusing to climb out of it
    fn target(&self, path: &str) -> GantryResult<PathBuf> {
        let relative = Path::new(path);
        let mut target = self.root.clone();
        for component in relative.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => target.push(part),
                _ => {
                    return Err(GantryError::User(format!(
                        "destination path must stay inside {}: {}",
                        self.root.display(),
                        path
                    )))
                }
            }
        }
        Ok(target)
    }
}

#[async_trait]
impl ArtifactDestination for DirectoryDestination {
    async fn stream_in(&self, path: &str, source: Box<dyn ByteStream>) -> GantryResult<()> {
        let target = match self.target(path) {
            Ok(target) => target,
            Err(e) => {
                let mut source = source;
                let _ = source.close();
                return Err(e);
            }
        };
        debug!("Unpacking into {}", target.display());
        let unpack_to = target.clone();
        let bridge = SyncIoBridge::new(source);
        let (unpacked, closed) = tokio::task::spawn_blocking(move || {
            let mut archive = tar::Archive::new(bridge);
            let unpacked =
                std::fs::create_dir_all(&unpack_to).and_then(|()| archive.unpack(&unpack_to));
            let mut source = archive.into_inner().into_inner();
            (unpacked, source.close())
        })
        .await
        .map_err(|e| GantryError::Internal(format!("unpack task failed: {}", e)))?;

        unpacked.map_err(|e| GantryError::io(format!("unpacking into {}", target.display()), e))?;
        closed.map_err(|e| GantryError::Stream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fakes::TrackedStream;
    use crate::exec::MemoryStream;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(content.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn unpacks_under_root() {
        let dir = TempDir::new().unwrap();
        let destination = DirectoryDestination::new(dir.path().join("out"));

        let bytes = archive(&[("README", "hello"), ("src/main.rs", "fn main() {}")]);
        destination
            .stream_in(".", Box::new(MemoryStream::new(bytes)))
            .await
            .unwrap();

        let out = dir.path().join("out");
        assert_eq!(std::fs::read_to_string(out.join("README")).unwrap(), "hello");
        assert_eq!(
            std::fs::read_to_string(out.join("src/main.rs")).unwrap(),
            "fn main() {}"
        );
    }

    #[tokio::test]
    async fn unpacks_into_subdirectory() {
        let dir = TempDir::new().unwrap();
        let destination = DirectoryDestination::new(dir.path());

        destination
            .stream_in("nested/dir", Box::new(MemoryStream::new(archive(&[("f", "x")]))))
            .await
            .unwrap();

        assert!(dir.path().join("nested/dir/f").is_file());
    }

    #[tokio::test]
    async fn refuses_paths_outside_root() {
        let dir = TempDir::new().unwrap();
        let destination = DirectoryDestination::new(dir.path());

        let err = destination
            .stream_in("../escape", Box::new(MemoryStream::new(vec![])))
            .await
            .unwrap_err();
        assert!(matches!(err, GantryError::User(_)));
    }

    #[tokio::test]
    async fn streams_large_archive_and_closes_source_once() {
        let dir = TempDir::new().unwrap();
        let destination = DirectoryDestination::new(dir.path());

        let big = "x".repeat(4 * 1024 * 1024);
        let source = TrackedStream::new(archive(&[("big", &big)]));
        let closes = source.close_counter();

        destination.stream_in(".", Box::new(source)).await.unwrap();

        let unpacked = std::fs::metadata(dir.path().join("big")).unwrap();
        assert_eq!(unpacked.len(), big.len() as u64);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
