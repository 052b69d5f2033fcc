//! Message body compression.
//!
//! A compressed frame keeps its 14 byte header uncompressed, with the compression status set to
//! [`CompressionStatus::Compressed`] and the size field holding the compressed frame size. The body
//! is the big-endian `u32` size of the uncompressed frame followed by the compressed bytes of
//! everything after the header.

use std::{fmt, io};

use bytes::{BufMut, BytesMut};

use crate::{
    error::{Error, Result},
    protocol::{read_i32, CompressionStatus, Header, HEADER_SIZE},
};

/// Compresses and decompresses message bodies.
pub trait Compressor: fmt::Debug + Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Compresses `input`.
    fn compress(&self, input: &[u8]) -> io::Result<Vec<u8>>;

    /// Decompresses `input`, which must expand to exactly `uncompressed_len` bytes.
    fn decompress(&self, input: &[u8], uncompressed_len: usize) -> io::Result<Vec<u8>>;
}

/// Raw deflate compression backed by `flate2`.
#[cfg(feature = "deflate")]
#[derive(Clone, Copy, Debug)]
pub struct Deflate {
    level: flate2::Compression,
}

#[cfg(feature = "deflate")]
impl Deflate {
    /// A deflate compressor at `level`, clamped to 0 through 9.
    pub fn new(level: u32) -> Self {
        Deflate {
            level: flate2::Compression::new(level.min(9)),
        }
    }
}

#[cfg(feature = "deflate")]
impl Default for Deflate {
    fn default() -> Self {
        Deflate {
            level: flate2::Compression::default(),
        }
    }
}

#[cfg(feature = "deflate")]
impl Compressor for Deflate {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
        use std::io::Write;

        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::with_capacity(input.len() / 2), self.level);
        encoder.write_all(input)?;
        encoder.finish()
    }

    fn decompress(&self, input: &[u8], uncompressed_len: usize) -> io::Result<Vec<u8>> {
        use std::io::Read;

        // Read one byte past the announced size so an oversized stream is detected without
        // inflating all of it.
        let mut decoder = flate2::read::DeflateDecoder::new(input).take(uncompressed_len as u64 + 1);
        let mut output = Vec::with_capacity(uncompressed_len);
        decoder.read_to_end(&mut output)?;
        if output.len() != uncompressed_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "decompressed {} bytes, expected {uncompressed_len}",
                    output.len()
                ),
            ));
        }
        Ok(output)
    }
}

/// Returns the compressor used when none is configured explicitly.
pub fn default_compressor() -> Option<std::sync::Arc<dyn Compressor>> {
    #[cfg(feature = "deflate")]
    {
        Some(std::sync::Arc::new(Deflate::default()))
    }
    #[cfg(not(feature = "deflate"))]
    {
        None
    }
}

/// Compresses an encoded frame.
///
/// Returns `None` when the compressed frame would not be smaller than the original, in which case the
/// frame should be sent as is.
pub fn compress_frame(compressor: &dyn Compressor, frame: &[u8]) -> Result<Option<BytesMut>> {
    let compressed = compressor
        .compress(&frame[HEADER_SIZE..])
        .map_err(|err| Error::Protocol(format!("{} compression failed: {err}", compressor.name())))?;

    let size = HEADER_SIZE + 4 + compressed.len();
    if size >= frame.len() {
        return Ok(None);
    }

    let mut out = BytesMut::with_capacity(size);
    out.put_slice(&frame[..HEADER_SIZE]);
    Header::rewrite(&mut out[..HEADER_SIZE], CompressionStatus::Compressed, size);
    out.put_u32(frame.len() as u32);
    out.put_slice(&compressed);
    Ok(Some(out))
}

/// Expands a compressed frame back into its uncompressed form.
///
/// The restored header carries [`CompressionStatus::Supported`], since the peer compressed its message
/// and therefore understands compressed replies.
pub fn decompress_frame(
    compressor: Option<&dyn Compressor>,
    frame: &[u8],
    max_message_size: usize,
) -> Result<BytesMut> {
    let Some(compressor) = compressor else {
        return Err(Error::FeatureNotSupported(
            "received a compressed message but compression is not available".into(),
        ));
    };

    let uncompressed = read_i32(frame, HEADER_SIZE)
        .ok_or_else(|| Error::Protocol("compressed message is missing its size".into()))?
        as u32 as usize;
    if uncompressed <= HEADER_SIZE {
        return Err(Error::IllegalMessageSize(uncompressed as i32));
    }
    if uncompressed > max_message_size {
        return Err(Error::MessageTooLarge {
            size: uncompressed,
            max: max_message_size,
        });
    }

    let body = compressor
        .decompress(&frame[HEADER_SIZE + 4..], uncompressed - HEADER_SIZE)
        .map_err(|err| {
            Error::Protocol(format!("{} decompression failed: {err}", compressor.name()))
        })?;

    let mut out = BytesMut::with_capacity(uncompressed);
    out.put_slice(&frame[..HEADER_SIZE]);
    Header::rewrite(&mut out[..HEADER_SIZE], CompressionStatus::Supported, uncompressed);
    out.put_slice(&body);
    Ok(out)
}
