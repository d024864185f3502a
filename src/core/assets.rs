//! Uploaded images (post thumbnails and avatars) on local disk.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use uuid::Uuid;

/// A file received from a multipart form. `size` counts every byte the
/// client sent, even when `bytes` was capped while reading.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub size: usize,
}

impl Upload {
    #[cfg(test)]
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        Self {
            file_name: file_name.into(),
            bytes,
            size,
        }
    }
}

/// Builds `<base><uuid>.<ext>` from a client supplied name.
///
/// The base is everything before the first `.` and the extension everything
/// after the last one, so `a.b.c.png` becomes `a<uuid>.png`. Directory
/// components are dropped first. A name without any `.` gets no extension.
pub fn unique_filename(original: &str) -> String {
    let name = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let token = Uuid::new_v4();

    match (name.split('.').next(), name.rsplit_once('.')) {
        (Some(base), Some((_, ext))) => format!("{}{}.{}", base, token, ext),
        _ => format!("{}{}", name, token),
    }
}

#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create uploads dir {}", root.display()))?;
        Ok(Self { root })
    }

    /// Resolves a stored filename, refusing anything that could escape the
    /// uploads directory.
    pub fn path_for(&self, name: &str) -> Option<PathBuf> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        plain.then(|| self.root.join(name))
    }

    pub fn save(&self, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self
            .path_for(name)
            .ok_or_else(|| anyhow::anyhow!("invalid asset name {name:?}"))?;
        fs::write(&path, bytes).with_context(|| format!("failed to write asset {name}"))
    }

    /// Removes an asset. An asset that is already gone counts as deleted.
    pub fn delete(&self, name: &str) -> anyhow::Result<()> {
        let path = self
            .path_for(name)
            .ok_or_else(|| anyhow::anyhow!("invalid asset name {name:?}"))?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete asset {name}")),
        }
    }

    pub fn read(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(path) = self.path_for(name) else {
            return Ok(None);
        };
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read asset {name}")),
        }
    }

    #[cfg(test)]
    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_some_and(|p| p.is_file())
    }
}
