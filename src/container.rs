//! Patch container codec.
//!
//! Byte layout: `b"PATCH"` ‖ `u8 compression selector` ‖ compressed{
//! `u24-BE metadata length` ‖ metadata JSON ‖ payload₁ ‖ payload₂ ‖ … }.
//! Payloads are concatenated in operation order, each exactly
//! `payload.length` bytes; the stream is not seekable, so consumption is
//! strictly sequential. Metadata is fully buffered and validated before any
//! file mutation starts.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::cancel::CancelToken;
use crate::error::{PatchError, Result};
use crate::model::PatchDescriptor;

pub const MAGIC: &[u8; 5] = b"PATCH";
pub const MAX_METADATA_LEN: usize = 16 * 1024 * 1024;

const CHUNK: usize = 64 * 1024;

/// Selector byte: `0` = general-purpose stream compressor (gzip),
/// `1` = higher-ratio block compressor (zstd).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
}

impl Compression {
    pub fn selector(self) -> u8 {
        match self {
            Compression::Gzip => 0,
            Compression::Zstd => 1,
        }
    }

    fn from_selector(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Compression::Gzip),
            1 => Ok(Compression::Zstd),
            other => Err(PatchError::Format(format!(
                "unrecognized compression selector {other}"
            ))),
        }
    }
}

/// Streaming reader over one container: decodes the descriptor eagerly,
/// then hands out payload bytes in operation order.
pub struct ContainerReader {
    decoder: Box<dyn Read + Send>,
    descriptor: PatchDescriptor,
}

impl ContainerReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 6];
        reader
            .read_exact(&mut header)
            .map_err(|_| PatchError::Format("truncated container header".into()))?;
        if &header[..5] != MAGIC {
            return Err(PatchError::Format("missing PATCH magic".into()));
        }
        let compression = Compression::from_selector(header[5])?;

        let mut decoder: Box<dyn Read + Send> = match compression {
            Compression::Gzip => Box::new(GzDecoder::new(reader)),
            Compression::Zstd => Box::new(zstd::Decoder::new(reader)?),
        };

        let mut prefix = [0u8; 3];
        decoder
            .read_exact(&mut prefix)
            .map_err(|_| PatchError::Format("truncated metadata length prefix".into()))?;
        let len = u32::from_be_bytes([0, prefix[0], prefix[1], prefix[2]]) as usize;
        if len == 0 || len > MAX_METADATA_LEN {
            return Err(PatchError::Format(format!(
                "metadata length {len} out of range"
            )));
        }

        let mut metadata = vec![0u8; len];
        decoder
            .read_exact(&mut metadata)
            .map_err(|_| PatchError::Format("truncated metadata".into()))?;
        let descriptor: PatchDescriptor = serde_json::from_slice(&metadata)
            .map_err(|e| PatchError::Format(format!("metadata: {e}")))?;
        descriptor.validate()?;

        Ok(Self { decoder, descriptor })
    }

    pub fn descriptor(&self) -> &PatchDescriptor {
        &self.descriptor
    }

    /// Limited reader over the next `len` payload bytes. The caller must
    /// consume it fully to keep the stream aligned.
    pub fn payload_reader(&mut self, len: u64) -> io::Take<&mut (dyn Read + Send + 'static)> {
        (&mut *self.decoder).take(len)
    }

    /// Copy exactly `len` payload bytes into `out`, checking the
    /// cancellation token per chunk.
    pub fn copy_payload(
        &mut self,
        len: u64,
        out: &mut impl Write,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.drain(len, Some(out), cancel)
    }

    /// Discard exactly `len` payload bytes. Used when an operation is
    /// skipped on resume or short-circuited: the stream is not seekable, so
    /// alignment must be preserved by reading anyway.
    pub fn skip_payload(&mut self, len: u64, cancel: &CancelToken) -> Result<()> {
        self.drain::<io::Sink>(len, None, cancel)
    }

    fn drain<W: Write>(
        &mut self,
        len: u64,
        mut out: Option<&mut W>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut remaining = len;
        let mut buf = vec![0u8; CHUNK];
        while remaining > 0 {
            cancel.checkpoint()?;
            let want = remaining.min(CHUNK as u64) as usize;
            self.decoder
                .read_exact(&mut buf[..want])
                .map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => {
                        PatchError::Format("truncated payload stream".into())
                    }
                    _ => PatchError::Io(e),
                })?;
            if let Some(out) = out.as_mut() {
                out.write_all(&buf[..want])?;
            }
            remaining -= want as u64;
        }
        Ok(())
    }
}

enum Encoder {
    Gzip(GzEncoder<BufWriter<File>>),
    Zstd(zstd::Encoder<'static, BufWriter<File>>),
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

impl Encoder {
    fn finish(self) -> io::Result<BufWriter<File>> {
        match self {
            Encoder::Gzip(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
        }
    }
}

/// Assemble a container from a descriptor and one payload byte vector per
/// operation, fixing up each operation's payload position/length.
pub fn write_container(
    path: &Path,
    descriptor: &mut PatchDescriptor,
    payloads: &[Vec<u8>],
    compression: Compression,
) -> Result<()> {
    if payloads.len() != descriptor.operations.len() {
        return Err(PatchError::Format(format!(
            "{} payloads supplied for {} operations",
            payloads.len(),
            descriptor.operations.len()
        )));
    }
    let mut position = 0u64;
    for (op, payload) in descriptor.operations.iter_mut().zip(payloads) {
        op.payload.position = position;
        op.payload.length = payload.len() as u64;
        position += payload.len() as u64;
    }
    descriptor.validate()?;

    let metadata = serde_json::to_vec(descriptor)
        .map_err(|e| PatchError::Format(format!("metadata: {e}")))?;
    if metadata.len() > MAX_METADATA_LEN || metadata.len() > 0xFF_FFFF {
        return Err(PatchError::Format(format!(
            "metadata of {} bytes exceeds the 16 MiB limit",
            metadata.len()
        )));
    }

    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(MAGIC)?;
    file.write_all(&[compression.selector()])?;

    let mut encoder = match compression {
        Compression::Gzip => Encoder::Gzip(GzEncoder::new(file, flate2::Compression::default())),
        Compression::Zstd => Encoder::Zstd(zstd::Encoder::new(file, 3)?),
    };
    let len = metadata.len() as u32;
    encoder.write_all(&len.to_be_bytes()[1..])?;
    encoder.write_all(&metadata)?;
    for payload in payloads {
        encoder.write_all(payload)?;
    }
    encoder.finish()?.flush()?;
    Ok(())
}
