//! Raw file access: the single I/O primitive layer the decoders build on.
//!
//! Everything here reads fixed byte ranges and converts them into samples or
//! strings; no format-generation knowledge lives at this level.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::types::AbfError;

/// Number of bytes probed for format detection. Both header generations are
/// at least this long (the ABF2 file-info block is exactly 512 bytes, ABF1
/// headers are 2048).
pub(crate) const HEADER_PROBE_LEN: usize = 512;

/// Storage width of on-disk samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleFormat {
    Int16,
    Float32,
}

impl SampleFormat {
    /// Bytes per stored sample.
    pub(crate) fn width(self) -> u64 {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Float32 => 4,
        }
    }
}

/// Opens the file, reads the fixed-size detection probe and closes the
/// handle again. Short files fail here with an open error.
pub(crate) fn read_probe(path: &Path) -> Result<[u8; HEADER_PROBE_LEN], AbfError> {
    let open_err = |source| AbfError::Open {
        path: path.display().to_string(),
        source,
    };

    let mut file = File::open(path).map_err(open_err)?;
    let mut probe = [0u8; HEADER_PROBE_LEN];
    file.read_exact(&mut probe).map_err(open_err)?;
    Ok(probe)
}

/// Decodes a fixed-width byte field into a string, stopping at the first
/// NUL. The trailing space padding convention is left alone; it is trimmed
/// later when the recording is built.
pub(crate) fn fixed_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Reads up to `mux_count` multiplexed samples starting `mux_start` samples
/// into the data section.
///
/// Returns the raw (unscaled) values actually available; a file that ends
/// early yields a shorter vector rather than an error, so that the caller
/// can compare requested against returned counts.
pub(crate) fn read_mux_block(
    reader: &mut BufReader<File>,
    data_offset: u64,
    mux_start: u64,
    mux_count: usize,
    format: SampleFormat,
) -> Result<Vec<f64>, AbfError> {
    let read_err = |source| AbfError::Read {
        what: "sample data",
        source,
    };

    let width = format.width();
    reader
        .seek(SeekFrom::Start(data_offset + mux_start * width))
        .map_err(read_err)?;

    let mut buffer = vec![0u8; mux_count * width as usize];
    let mut filled = 0usize;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).map_err(read_err)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    // Discard a trailing partial sample from a torn write.
    let filled = filled - filled % width as usize;

    let mut samples = Vec::with_capacity(filled / width as usize);
    match format {
        SampleFormat::Int16 => {
            for chunk in buffer[..filled].chunks_exact(2) {
                samples.push(i16::from_le_bytes([chunk[0], chunk[1]]) as f64);
            }
        }
        SampleFormat::Float32 => {
            for chunk in buffer[..filled].chunks_exact(4) {
                samples.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64);
            }
        }
    }

    Ok(samples)
}

/// Selects one channel's samples out of an interleaved block: every
/// `channel_count`-th value, offset by the channel's position in the
/// sampling sequence.
pub(crate) fn deinterleave(block: &[f64], position: usize, channel_count: usize) -> Vec<f64> {
    block
        .iter()
        .skip(position)
        .step_by(channel_count)
        .copied()
        .collect()
}
