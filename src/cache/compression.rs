//! Source Image Decompression
//!
//! Cloud images are often published compressed. The algorithm is chosen
//! from the file name and the payload is streamed file-to-file, so large
//! images never sit in memory.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// Algorithm Detection
// =============================================================================

/// Compression algorithm of a source image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    None,
    Gzip,
    Xz,
    Zstd,
    Lz4,
}

impl CompressionAlgorithm {
    /// Detect the algorithm from a file name suffix
    pub fn detect(file_name: &str) -> Self {
        let lower = file_name.to_ascii_lowercase();
        if lower.ends_with(".gz") || lower.ends_with(".tgz") {
            CompressionAlgorithm::Gzip
        } else if lower.ends_with(".xz") {
            CompressionAlgorithm::Xz
        } else if lower.ends_with(".zst") || lower.ends_with(".zstd") {
            CompressionAlgorithm::Zstd
        } else if lower.ends_with(".lz4") {
            CompressionAlgorithm::Lz4
        } else {
            CompressionAlgorithm::None
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, CompressionAlgorithm::None)
    }

    /// Get algorithm name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Xz => "xz",
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Decompression
// =============================================================================

fn decoder(algorithm: CompressionAlgorithm, input: BufReader<File>) -> io::Result<Box<dyn Read>> {
    Ok(match algorithm {
        CompressionAlgorithm::None => Box::new(input),
        CompressionAlgorithm::Gzip => Box::new(flate2::read::MultiGzDecoder::new(input)),
        CompressionAlgorithm::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(input)),
        CompressionAlgorithm::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(input)?),
        CompressionAlgorithm::Lz4 => Box::new(lz4::Decoder::new(input)?),
    })
}

/// Decompress `source` into `dest` (blocking). Returns bytes written.
pub fn decompress_file(algorithm: CompressionAlgorithm, source: &Path, dest: &Path) -> Result<u64> {
    let wrap = |e: io::Error| Error::Decompression {
        path: source.display().to_string(),
        reason: format!("{}: {}", algorithm, e),
    };

    let input = BufReader::new(File::open(source).map_err(wrap)?);
    let mut reader = decoder(algorithm, input).map_err(wrap)?;
    let mut output = BufWriter::new(File::create(dest)?);

    let written = io::copy(&mut reader, &mut output).map_err(wrap)?;
    output.flush()?;
    output.get_ref().sync_all()?;

    if written == 0 {
        return Err(Error::Decompression {
            path: source.display().to_string(),
            reason: "decompressed to an empty file".into(),
        });
    }

    Ok(written)
}

/// Decompress `source` next to itself if its name says it is compressed.
/// Returns the path of the usable image; the compressed file is removed.
pub async fn decompress_if_needed(source: PathBuf, file_name: &str) -> Result<PathBuf> {
    let algorithm = CompressionAlgorithm::detect(file_name);
    if !algorithm.is_compressed() {
        return Ok(source);
    }

    let dest = source.with_extension("img");
    info!(path = %source.display(), algorithm = %algorithm, "Decompressing source image");

    let (src, dst) = (source.clone(), dest.clone());
    let written = tokio::task::spawn_blocking(move || decompress_file(algorithm, &src, &dst))
        .await
        .map_err(|e| Error::Internal(format!("decompression task failed: {}", e)))??;

    debug!(path = %dest.display(), bytes = written, "Decompressed source image");
    let _ = tokio::fs::remove_file(&source).await;
    Ok(dest)
}
