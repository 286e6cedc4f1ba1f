use super::{ByteRange, ObjectInfo, ObjectReader, ObjectStore, is_data_key};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

/// A local directory used as an object store. Keys are `/`-separated paths
/// relative to the root.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidInput(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(relative))
    }

    async fn open_file(&self, key: &str) -> Result<fs::File> {
        let path = self.object_path(key)?;
        fs::File::open(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::ObjectNotFound(key.to_string()),
            _ => Error::ObjectStore(format!("open {key}: {e}")),
        })
    }
}

#[async_trait]
impl ObjectStore for LocalStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        // Walk from the deepest directory the prefix names.
        let dir_part = match prefix.rfind('/') {
            Some(i) => &prefix[..i],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.object_path(dir_part)?
        };

        let mut objects = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::ObjectStore(format!("list {}: {e}", dir.display()))),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if key.starts_with(prefix) && is_data_key(&key) {
                    let size = entry.metadata().await?.len();
                    objects.push(ObjectInfo { key, size });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn open_at(&self, key: &str, offset: u64) -> Result<ObjectReader> {
        let mut file = self.open_file(key).await?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(Box::pin(BufReader::new(file)))
    }

    async fn read_range(&self, key: &str, range: ByteRange) -> Result<Bytes> {
        let mut file = self.open_file(key).await?;
        file.seek(std::io::SeekFrom::Start(range.offset)).await?;

        let mut buf = vec![0u8; range.length as usize];
        file.read_exact(&mut buf).await.map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::ObjectStore(format!(
                "{key}: range {}+{} is past the end of the object",
                range.offset, range.length
            )),
            _ => Error::Io(e),
        })?;

        Ok(Bytes::from(buf))
    }
}
