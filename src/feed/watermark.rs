//! File-backed watermark persistence.
//!
//! One file per scope and entity type:
//! ```text
//! <DATA_DIR>/
//!   watermarks/
//!     <scope>/
//!       <entity>.watermark
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::error::SourceError;
use crate::model::Watermark;

const WATERMARK_DIR: &str = "watermarks";
const EXTENSION: &str = "watermark";

#[derive(Debug, Clone)]
pub struct WatermarkStore {
    data_dir: PathBuf,
}

impl WatermarkStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Rejects keys that could escape the watermark directory.
    fn validate_key(key: &str) -> Result<(), SourceError> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.contains("..")
            || key.starts_with('.')
        {
            return Err(SourceError::InvalidWatermarkKey(key.to_string()));
        }
        Ok(())
    }

    fn scope_dir(&self, scope_key: &str) -> PathBuf {
        self.data_dir.join(WATERMARK_DIR).join(scope_key)
    }

    fn path(&self, scope_key: &str, entity_type: &str) -> Result<PathBuf, SourceError> {
        Self::validate_key(scope_key)?;
        Self::validate_key(entity_type)?;
        Ok(self
            .scope_dir(scope_key)
            .join(format!("{}.{}", entity_type, EXTENSION)))
    }

    /// Returns `Ok(None)` if no watermark has been stored yet.
    pub fn load(
        &self,
        scope_key: &str,
        entity_type: &str,
    ) -> Result<Option<Watermark>, SourceError> {
        let path = self.path(scope_key, entity_type)?;
        match fs::read_to_string(&path) {
            Ok(token) if token.trim().is_empty() => Ok(None),
            Ok(token) => Ok(Some(Watermark::new(token.trim()))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SourceError::Watermark(path, e)),
        }
    }

    /// Replaces the stored watermark.
    pub fn save(
        &self,
        scope_key: &str,
        entity_type: &str,
        watermark: &Watermark,
    ) -> Result<(), SourceError> {
        let path = self.path(scope_key, entity_type)?;
        let dir = self.scope_dir(scope_key);
        fs::create_dir_all(&dir).map_err(|e| SourceError::Watermark(dir.clone(), e))?;

        // Write atomically using temp file + rename
        let temp_path = path.with_extension("watermark.tmp");
        let mut file =
            fs::File::create(&temp_path).map_err(|e| SourceError::Watermark(temp_path.clone(), e))?;
        file.write_all(watermark.as_str().as_bytes())
            .map_err(|e| SourceError::Watermark(temp_path.clone(), e))?;
        file.sync_all()
            .map_err(|e| SourceError::Watermark(temp_path.clone(), e))?;

        fs::rename(&temp_path, &path).map_err(|e| SourceError::Watermark(path, e))?;
        Ok(())
    }

    /// Forgets the stored watermark so the next session starts from scratch.
    pub fn clear(&self, scope_key: &str, entity_type: &str) -> Result<(), SourceError> {
        let path = self.path(scope_key, entity_type)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SourceError::Watermark(path, e)),
        }
    }
}
