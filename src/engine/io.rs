// src/engine/io.rs
//
// I/O operations: Source enum, original-file metadata, output naming, atomic writes.

use crate::error::MonotoneError;
use crate::ops::OutputFormat;
use memmap2::Mmap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Image source - in-memory bytes, a memory-mapped file, or a path loaded on demand
#[derive(Clone, Debug)]
pub enum Source {
    /// In-memory image data
    Memory(Arc<Vec<u8>>),
    /// Memory-mapped file (zero-copy access)
    Mapped(Arc<Mmap>),
    /// File path for lazy loading (data is read only when needed)
    Path(PathBuf),
}

impl Source {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Source::Memory(Arc::new(bytes.into()))
    }

    /// Memory-map `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, MonotoneError> {
        let path = path.as_ref();
        let display = path.to_string_lossy().to_string();
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MonotoneError::file_not_found(display.clone())
            } else {
                MonotoneError::file_read_failed(display.clone(), e)
            }
        })?;
        // Safety: the file must not be truncated while mapped. A concurrent
        // writer can make decoding fail or fault; callers own that contract.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| MonotoneError::file_read_failed(display, e))?;
        Ok(Source::Mapped(Arc::new(mmap)))
    }

    /// Load the bytes. Path sources are read here; others are cheap clones.
    pub fn load(&self) -> Result<Arc<Vec<u8>>, MonotoneError> {
        match self {
            Source::Memory(data) => Ok(Arc::clone(data)),
            // Copies the mapping; prefer `as_bytes` when the slice is enough
            Source::Mapped(mmap) => Ok(Arc::new(mmap.as_ref().to_vec())),
            Source::Path(path) => std::fs::read(path).map(Arc::new).map_err(|e| {
                MonotoneError::file_read_failed(path.to_string_lossy().to_string(), e)
            }),
        }
    }

    /// Get the bytes directly. None only for Path sources, which need `load()`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Source::Memory(data) => Some(data.as_slice()),
            Source::Mapped(mmap) => Some(mmap.as_ref()),
            Source::Path(_) => None,
        }
    }

    /// Byte length, 0 for Path sources until loaded.
    pub fn len(&self) -> usize {
        match self {
            Source::Memory(data) => data.len(),
            Source::Mapped(mmap) => mmap.len(),
            Source::Path(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the source bytes, loading Path sources first.
    pub fn with_bytes<T>(
        &self,
        f: impl FnOnce(&[u8]) -> Result<T, MonotoneError>,
    ) -> Result<T, MonotoneError> {
        match self.as_bytes() {
            Some(bytes) => f(bytes),
            None => {
                let loaded = self.load()?;
                f(loaded.as_slice())
            }
        }
    }
}

/// What the user uploaded: used for output naming and size budgeting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginalFileInfo {
    pub name: String,
    pub base_name: String,
    /// Lowercase, without the dot. Empty when the name has none.
    pub extension: String,
    pub mime_type: String,
    pub size: u64,
}

impl OriginalFileInfo {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let (base_name, extension) = split_name(&name);
        Self {
            base_name: base_name.to_string(),
            extension: extension.to_ascii_lowercase(),
            name,
            mime_type: mime_type.into(),
            size,
        }
    }

    /// Name and size from the filesystem; MIME guessed from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, MonotoneError> {
        let path = path.as_ref();
        let display = path.to_string_lossy().to_string();
        let meta = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MonotoneError::file_not_found(display.clone())
            } else {
                MonotoneError::file_read_failed(display.clone(), e)
            }
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let (_, ext) = split_name(&name);
        let mime = OutputFormat::from_name(ext)
            .map(|f| f.mime_type())
            .unwrap_or("application/octet-stream");
        Ok(Self::new(name, mime, meta.len()))
    }

    /// Supported format this file was uploaded as, by MIME then extension.
    pub fn source_format(&self) -> Option<OutputFormat> {
        OutputFormat::from_mime(&self.mime_type)
            .or_else(|| OutputFormat::from_name(&self.extension).ok())
    }

    /// Same format as the upload, or PNG when the upload's is not writable.
    pub fn default_output_format(&self) -> OutputFormat {
        self.source_format().unwrap_or(OutputFormat::Png)
    }
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(i) => (&name[..i], &name[i + 1..]),
    }
}

/// Download name for a processed image: `<sanitized base>-bw.<ext>`.
///
/// Runs of characters outside `[A-Za-z0-9_]` become one `-`, edge dashes are
/// trimmed, and an empty result falls back to `image`.
pub fn output_filename(base_name: &str, format: OutputFormat) -> String {
    let mut cleaned = String::with_capacity(base_name.len());
    let mut pending_dash = false;
    for c in base_name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !cleaned.is_empty() {
                cleaned.push('-');
            }
            pending_dash = false;
            cleaned.push(c);
        } else {
            pending_dash = true;
        }
    }
    if cleaned.is_empty() {
        cleaned.push_str("image");
    }
    format!("{cleaned}-bw.{}", format.extension())
}

/// Write `data` to `path` via a temp file in the same directory, fsync, rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), MonotoneError> {
    let display = path.to_string_lossy().to_string();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    // Same directory as the target so the rename never crosses filesystems
    let mut temp = NamedTempFile::new_in(dir)
        .map_err(|e| MonotoneError::file_write_failed(dir.to_string_lossy().to_string(), e))?;
    temp.write_all(data)
        .map_err(|e| MonotoneError::file_write_failed(display.clone(), e))?;
    temp.as_file_mut()
        .sync_all()
        .map_err(|e| MonotoneError::file_write_failed(display.clone(), e))?;
    temp.persist(path)
        .map_err(|e| MonotoneError::file_write_failed(display, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_collapses_punctuation_runs() {
        assert_eq!(output_filename("My Photo!!", OutputFormat::WebP), "My-Photo-bw.webp");
        assert_eq!(output_filename("a  b--c", OutputFormat::Png), "a-b-c-bw.png");
        assert_eq!(output_filename("snake_case_1", OutputFormat::Jpeg), "snake_case_1-bw.jpg");
    }

    #[test]
    fn filename_trims_edges_and_falls_back() {
        assert_eq!(output_filename("  (copy) ", OutputFormat::Png), "copy-bw.png");
        assert_eq!(output_filename("!!!", OutputFormat::Jpeg), "image-bw.jpg");
        assert_eq!(output_filename("", OutputFormat::WebP), "image-bw.webp");
        assert_eq!(output_filename("café", OutputFormat::Png), "caf-bw.png");
    }

    #[test]
    fn file_info_splits_name() {
        let info = OriginalFileInfo::new("Holiday.Beach.JPG", "image/jpeg", 1234);
        assert_eq!(info.base_name, "Holiday.Beach");
        assert_eq!(info.extension, "jpg");
        assert_eq!(info.source_format(), Some(OutputFormat::Jpeg));

        let dotfile = OriginalFileInfo::new(".hidden", "", 1);
        assert_eq!(dotfile.base_name, ".hidden");
        assert_eq!(dotfile.extension, "");
    }

    #[test]
    fn unsupported_source_defaults_to_png() {
        let info = OriginalFileInfo::new("scan.tiff", "image/tiff", 10);
        assert_eq!(info.source_format(), None);
        assert_eq!(info.default_output_format(), OutputFormat::Png);

        // MIME wins, extension is the fallback
        let info = OriginalFileInfo::new("upload.bin", "image/webp", 10);
        assert_eq!(info.default_output_format(), OutputFormat::WebP);
        let info = OriginalFileInfo::new("photo.jpeg", "", 10);
        assert_eq!(info.default_output_format(), OutputFormat::Jpeg);
    }

    #[test]
    fn source_from_path_maps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");
        std::fs::write(&path, b"hello").unwrap();

        let source = Source::from_path(&path).unwrap();
        assert!(matches!(source, Source::Mapped(_)));
        assert_eq!(source.as_bytes(), Some(&b"hello"[..]));
        assert_eq!(source.len(), 5);

        let info = OriginalFileInfo::from_path(&path).unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.name, "input.bin");
    }

    #[test]
    fn missing_file_is_file_not_found() {
        let err = Source::from_path("/definitely/not/here.png").unwrap_err();
        assert!(matches!(err, MonotoneError::FileNotFound { .. }));
    }

    #[test]
    fn path_source_loads_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deferred.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let source = Source::Path(path);
        assert_eq!(source.as_bytes(), None);
        let total = source.with_bytes(|b| Ok(b.iter().map(|&x| x as u32).sum::<u32>())).unwrap();
        assert_eq!(total, 6);
    }

    #[test]
    fn write_atomic_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        std::fs::write(&path, b"old").unwrap();
        write_atomic(&path, b"new contents").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new contents");
    }
}
