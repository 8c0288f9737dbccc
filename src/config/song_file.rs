//! `.arpmini` song files: the raw 288-byte slot content, no header.
use std::path::Path;

use crate::serial::protocol::{SongBlob, SONG_SIZE};

pub const SONG_FILE_EXTENSION: &str = "arpmini";

#[derive(Debug, thiserror::Error)]
pub enum SongFileError {
    #[error("Song file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file size: {actual} bytes (must be exactly 288)")]
    InvalidSize { actual: usize },
}

pub fn read_song_file(path: &Path) -> Result<SongBlob, SongFileError> {
    let data = std::fs::read(path)?;
    SongBlob::from_bytes(&data).map_err(|_| SongFileError::InvalidSize { actual: data.len() })
}

/// Write `blob` to `path`, adding the `.arpmini` extension when there is none.
pub fn write_song_file(path: &Path, blob: &SongBlob) -> Result<std::path::PathBuf, SongFileError> {
    let path = if path.extension().is_none() {
        path.with_extension(SONG_FILE_EXTENSION)
    } else {
        path.to_path_buf()
    };
    std::fs::write(&path, blob.as_bytes())?;
    log::info!("Wrote {} bytes to {}", SONG_SIZE, path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let bytes: Vec<u8> = (0..SONG_SIZE).map(|i| (i % 251) as u8).collect();
        let blob = SongBlob::from_bytes(&bytes).unwrap();

        let written = write_song_file(&dir.path().join("bassline"), &blob).unwrap();
        assert_eq!(written.extension().and_then(|e| e.to_str()), Some("arpmini"));
        assert_eq!(read_song_file(&written).unwrap(), blob);
    }

    #[test]
    fn test_wrong_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.arpmini");
        std::fs::write(&path, [0u8; 100]).unwrap();
        assert!(matches!(read_song_file(&path), Err(SongFileError::InvalidSize { actual: 100 })));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(read_song_file(&dir.path().join("nope.arpmini")), Err(SongFileError::Io(_))));
    }
}
