use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info};

/// One step of a chunked app upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadChunk {
    Begin,
    Data(Vec<u8>),
    End,
}

impl UploadChunk {
    pub fn parse(raw: &str) -> Result<Self, hex::FromHexError> {
        match raw {
            "BEGIN" => Ok(UploadChunk::Begin),
            "END" => Ok(UploadChunk::End),
            data => Ok(UploadChunk::Data(hex::decode(data.trim())?)),
        }
    }
}

/// Archive location for an upload and the directory it unpacks into.
pub fn upload_paths(base: &Path, filename: &str) -> (PathBuf, PathBuf) {
    let archive = base.join("APP").join(filename);
    let stem = filename.split('.').next().unwrap_or(filename);
    (archive, base.join("APP").join(stem))
}

/// Apply a chunk to the archive at `archive`; `End` unpacks the gzip tarball
/// into `target` and removes the archive.
pub fn apply_chunk(archive: &Path, target: &Path, chunk: UploadChunk) -> io::Result<()> {
    match chunk {
        UploadChunk::Begin => {
            info!(archive = %archive.display(), "upload started");
            remove_if_exists(archive)?;
            if let Some(parent) = archive.parent() {
                fs::create_dir_all(parent)?;
            }
            Ok(())
        }
        UploadChunk::Data(bytes) => {
            let mut file = OpenOptions::new().create(true).append(true).open(archive)?;
            file.write_all(&bytes)?;
            debug!(archive = %archive.display(), written = bytes.len(), "upload chunk");
            Ok(())
        }
        UploadChunk::End => {
            if target.exists() {
                fs::remove_dir_all(target)?;
            }
            let file = fs::File::open(archive)?;
            tar::Archive::new(GzDecoder::new(file)).unpack(target)?;
            fs::remove_file(archive)?;
            info!(target = %target.display(), "upload unpacked");
            Ok(())
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
