//! File upload and download
//!
//! Plain filesystem I/O anchored at a shell's current working directory.
//! Content travels as base64 by default, or as UTF-8 text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Errors raised by file transfers
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid {encoding} content: {reason}")]
    InvalidEncoding {
        encoding: ContentEncoding,
        reason: String,
    },

    #[error("File too large: {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result type for file transfers
pub type TransferResult<T> = Result<T, TransferError>;

/// How file content is carried in messages
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Base64,
    Utf8,
}

impl std::fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentEncoding::Base64 => write!(f, "base64"),
            ContentEncoding::Utf8 => write!(f, "utf8"),
        }
    }
}

/// A completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    pub path: PathBuf,
    pub size: u64,
}

/// A completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub content: String,
    pub size: u64,
    pub encoding: ContentEncoding,
}

/// Resolve `path` against `cwd` unless it is already absolute
pub fn resolve_path(cwd: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Decode message content into file bytes
pub fn decode_content(content: &str, encoding: ContentEncoding) -> TransferResult<Vec<u8>> {
    match encoding {
        ContentEncoding::Base64 => {
            STANDARD
                .decode(content.trim())
                .map_err(|e| TransferError::InvalidEncoding {
                    encoding,
                    reason: e.to_string(),
                })
        }
        ContentEncoding::Utf8 => Ok(content.as_bytes().to_vec()),
    }
}

/// Encode file bytes as message content
pub fn encode_content(bytes: Vec<u8>, encoding: ContentEncoding) -> TransferResult<String> {
    match encoding {
        ContentEncoding::Base64 => Ok(STANDARD.encode(bytes)),
        ContentEncoding::Utf8 => String::from_utf8(bytes).map_err(|e| TransferError::InvalidEncoding {
            encoding,
            reason: e.to_string(),
        }),
    }
}

/// Write `content` to `path`, creating parent directories as needed
pub async fn upload(
    cwd: &Path,
    path: &str,
    content: &str,
    encoding: ContentEncoding,
    max_size: u64,
) -> TransferResult<Uploaded> {
    let target = resolve_path(cwd, path);
    let bytes = decode_content(content, encoding)?;
    let size = bytes.len() as u64;
    if size > max_size {
        return Err(TransferError::TooLarge {
            size,
            max: max_size,
        });
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| TransferError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    fs::write(&target, bytes)
        .await
        .map_err(|source| TransferError::Io {
            path: target.clone(),
            source,
        })?;

    debug!(path = %target.display(), size, "File uploaded");
    Ok(Uploaded { path: target, size })
}

/// Read `path` and encode its content
pub async fn download(
    cwd: &Path,
    path: &str,
    encoding: ContentEncoding,
    max_size: u64,
) -> TransferResult<Downloaded> {
    let target = resolve_path(cwd, path);
    let io_error = |source: std::io::Error| match source.kind() {
        ErrorKind::NotFound => TransferError::NotFound(target.clone()),
        _ => TransferError::Io {
            path: target.clone(),
            source,
        },
    };

    let metadata = fs::metadata(&target).await.map_err(io_error)?;
    if !metadata.is_file() {
        return Err(TransferError::NotFound(target.clone()));
    }
    if metadata.len() > max_size {
        return Err(TransferError::TooLarge {
            size: metadata.len(),
            max: max_size,
        });
    }

    let bytes = fs::read(&target).await.map_err(io_error)?;
    let size = bytes.len() as u64;
    let content = encode_content(bytes, encoding)?;

    debug!(path = %target.display(), size, "File downloaded");
    Ok(Downloaded {
        content,
        size,
        encoding,
    })
}
