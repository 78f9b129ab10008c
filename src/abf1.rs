//! Decoder for first-generation ABF files.
//!
//! The whole header is one fixed 2048-byte little-endian layout; field
//! positions below are the documented byte offsets. Sample data follows in
//! 512-byte blocks, interleaved across channels in sampling-sequence order.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

use crate::raw::{self, SampleFormat};
use crate::reader::FormatReader;
use crate::types::{AbfError, DecodedHeader};

const ABF1_SIGNATURE: &[u8; 4] = b"ABF ";
const ABF1_HEADER_LEN: usize = 2048;
const MAX_ADC_CHANNELS: usize = 16;
const BLOCK_LEN: u64 = 512;
const OPERATION_MODE_GAPFREE: i16 = 3;

// Fixed header offsets.
const OFFSET_OPERATION_MODE: u64 = 8;
const OFFSET_ACTUAL_ACQ_LENGTH: u64 = 10;
const OFFSET_ACTUAL_EPISODES: u64 = 16;
const OFFSET_FILE_START_DATE: u64 = 20;
const OFFSET_FILE_START_TIME: u64 = 24;
const OFFSET_DATA_SECTION_PTR: u64 = 40;
const OFFSET_DATA_FORMAT: u64 = 100;
const OFFSET_ADC_NUM_CHANNELS: u64 = 120;
const OFFSET_ADC_SAMPLE_INTERVAL: u64 = 122;
const OFFSET_SAMPLES_PER_EPISODE: u64 = 138;
const OFFSET_ADC_RANGE: u64 = 244;
const OFFSET_ADC_RESOLUTION: u64 = 252;
const OFFSET_CREATOR_INFO: u64 = 294;
const OFFSET_ADC_SAMPLING_SEQ: u64 = 410;
const OFFSET_ADC_CHANNEL_NAME: u64 = 442;
const OFFSET_ADC_UNITS: u64 = 602;
const OFFSET_ADC_PROGRAMMABLE_GAIN: u64 = 666;
const OFFSET_INSTRUMENT_SCALE_FACTOR: u64 = 922;
const OFFSET_INSTRUMENT_OFFSET: u64 = 986;
const OFFSET_SIGNAL_GAIN: u64 = 1050;
const OFFSET_SIGNAL_OFFSET: u64 = 1114;

const CHANNEL_NAME_LEN: usize = 10;
const UNITS_LEN: usize = 8;
const CREATOR_INFO_LEN: usize = 16;

/// Linear transform from raw integer samples to physical units.
#[derive(Debug, Clone, Copy)]
struct ChannelScale {
    factor: f64,
    offset: f64,
}

/// Reader for one open first-generation file.
pub(crate) struct Abf1Reader {
    reader: BufReader<File>,
    header: DecodedHeader,
    data_offset: u64,
    sample_format: SampleFormat,
    /// Scale per logical channel, in sampling-sequence order
    scales: Vec<ChannelScale>,
}

impl Abf1Reader {
    /// Opens the file and decodes the fixed header.
    pub(crate) fn open(path: &Path) -> Result<Abf1Reader, AbfError> {
        let file = File::open(path).map_err(|source| AbfError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let mut reader = BufReader::with_capacity(65536, file);

        let mut raw_header = vec![0u8; ABF1_HEADER_LEN];
        reader
            .read_exact(&mut raw_header)
            .map_err(|source| AbfError::Read {
                what: "file header",
                source,
            })?;

        let (header, data_offset, sample_format, scales) = decode_header(&raw_header)?;

        // The declared episode count must fit into the declared acquisition
        // length; anything beyond it could never be read back.
        let available = max_episodes(header.total_samples, header.samples_per_episode);
        if header.episode_count > available {
            return Err(AbfError::TooManyEpisodes {
                declared: header.episode_count,
                available,
            });
        }

        Ok(Abf1Reader {
            reader,
            header,
            data_offset,
            sample_format,
            scales,
        })
    }
}

impl FormatReader for Abf1Reader {
    fn header(&self) -> &DecodedHeader {
        &self.header
    }

    fn samples_for_episode(&mut self, episode: u32) -> Result<usize, AbfError> {
        let h = &self.header;
        if episode == 0 || episode > h.episode_count {
            return Err(AbfError::SampleCountQuery {
                episode,
                reason: format!("episode index out of range 1..={}", h.episode_count),
            });
        }
        let start = (episode as u64 - 1) * h.samples_per_episode as u64;
        if start >= h.total_samples {
            return Err(AbfError::SampleCountQuery {
                episode,
                reason: "episode lies beyond the acquisition length".to_string(),
            });
        }
        let mux = (h.total_samples - start).min(h.samples_per_episode as u64);
        Ok(mux as usize / h.channel_count)
    }

    fn read_sweep(
        &mut self,
        channel: usize,
        episode: u32,
        count: usize,
    ) -> Result<Vec<f64>, AbfError> {
        let h = &self.header;
        let mux_start = (episode as u64 - 1) * h.samples_per_episode as u64;
        let mux_count = count * h.channel_count;

        let block = raw::read_mux_block(
            &mut self.reader,
            self.data_offset,
            mux_start,
            mux_count,
            self.sample_format,
        )?;

        let scale = self.scales[channel];
        let mut samples = raw::deinterleave(&block, channel, h.channel_count);
        for s in &mut samples {
            *s = *s * scale.factor + scale.offset;
        }
        Ok(samples)
    }
}

/// Maximum number of episodes the declared acquisition length can hold.
fn max_episodes(total_samples: u64, samples_per_episode: u32) -> u32 {
    if samples_per_episode == 0 {
        return 0;
    }
    total_samples.div_ceil(samples_per_episode as u64) as u32
}

/// Parses the raw 2048-byte header into the shared header record plus the
/// format-private reading parameters.
fn decode_header(
    raw_header: &[u8],
) -> Result<(DecodedHeader, u64, SampleFormat, Vec<ChannelScale>), AbfError> {
    if &raw_header[..4] != ABF1_SIGNATURE {
        return Err(AbfError::Decode(
            "unrecognised file signature (expected \"ABF \")".to_string(),
        ));
    }

    let read_err = |source| AbfError::Read {
        what: "file header",
        source,
    };

    let mut cursor = Cursor::new(raw_header);

    cursor.set_position(OFFSET_OPERATION_MODE);
    let operation_mode = cursor.read_i16::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_ACTUAL_ACQ_LENGTH);
    let acq_length = cursor.read_i32::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_ACTUAL_EPISODES);
    let episodes = cursor.read_i32::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_FILE_START_DATE);
    let start_date = cursor.read_i32::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_FILE_START_TIME);
    let start_time = cursor.read_i32::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_DATA_SECTION_PTR);
    let data_section_ptr = cursor.read_i32::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_DATA_FORMAT);
    let data_format = cursor.read_i16::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_ADC_NUM_CHANNELS);
    let channel_count = cursor.read_i16::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_ADC_SAMPLE_INTERVAL);
    let sample_interval_us = cursor.read_f32::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_SAMPLES_PER_EPISODE);
    let samples_per_episode = cursor.read_i32::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_ADC_RANGE);
    let adc_range = cursor.read_f32::<LittleEndian>().map_err(read_err)?;

    cursor.set_position(OFFSET_ADC_RESOLUTION);
    let adc_resolution = cursor.read_i32::<LittleEndian>().map_err(read_err)?;

    if channel_count <= 0 || channel_count as usize > MAX_ADC_CHANNELS {
        return Err(AbfError::Decode(format!(
            "invalid channel count {} (expected 1..={})",
            channel_count, MAX_ADC_CHANNELS
        )));
    }
    if episodes < 0 || acq_length < 0 || samples_per_episode <= 0 || data_section_ptr < 0 {
        return Err(AbfError::Decode(
            "negative size field in file header".to_string(),
        ));
    }

    let sample_format = match data_format {
        0 => SampleFormat::Int16,
        1 => SampleFormat::Float32,
        other => {
            return Err(AbfError::Decode(format!(
                "unsupported data format {other} (expected 0 or 1)"
            )))
        }
    };

    let channel_count = channel_count as usize;

    // Per-ADC arrays, indexed by physical ADC number.
    let mut sampling_seq = [0i16; MAX_ADC_CHANNELS];
    cursor.set_position(OFFSET_ADC_SAMPLING_SEQ);
    for entry in &mut sampling_seq {
        *entry = cursor.read_i16::<LittleEndian>().map_err(read_err)?;
    }

    let mut programmable_gain = [0f32; MAX_ADC_CHANNELS];
    cursor.set_position(OFFSET_ADC_PROGRAMMABLE_GAIN);
    for entry in &mut programmable_gain {
        *entry = cursor.read_f32::<LittleEndian>().map_err(read_err)?;
    }
    let mut instrument_scale = [0f32; MAX_ADC_CHANNELS];
    cursor.set_position(OFFSET_INSTRUMENT_SCALE_FACTOR);
    for entry in &mut instrument_scale {
        *entry = cursor.read_f32::<LittleEndian>().map_err(read_err)?;
    }
    let mut instrument_offset = [0f32; MAX_ADC_CHANNELS];
    cursor.set_position(OFFSET_INSTRUMENT_OFFSET);
    for entry in &mut instrument_offset {
        *entry = cursor.read_f32::<LittleEndian>().map_err(read_err)?;
    }
    let mut signal_gain = [0f32; MAX_ADC_CHANNELS];
    cursor.set_position(OFFSET_SIGNAL_GAIN);
    for entry in &mut signal_gain {
        *entry = cursor.read_f32::<LittleEndian>().map_err(read_err)?;
    }
    let mut signal_offset = [0f32; MAX_ADC_CHANNELS];
    cursor.set_position(OFFSET_SIGNAL_OFFSET);
    for entry in &mut signal_offset {
        *entry = cursor.read_f32::<LittleEndian>().map_err(read_err)?;
    }

    let creator = raw::fixed_string(
        &raw_header[OFFSET_CREATOR_INFO as usize..OFFSET_CREATOR_INFO as usize + CREATOR_INFO_LEN],
    );

    // Resolve each logical channel through the sampling sequence: position c
    // in the sequence names the physical ADC whose samples sit at frame
    // offset c.
    let mut channel_names = Vec::with_capacity(channel_count);
    let mut channel_units = Vec::with_capacity(channel_count);
    let mut scales = Vec::with_capacity(channel_count);
    for c in 0..channel_count {
        let adc = sampling_seq[c];
        if adc < 0 || adc as usize >= MAX_ADC_CHANNELS {
            return Err(AbfError::Decode(format!(
                "sampling sequence entry {c} names ADC {adc}, outside 0..{MAX_ADC_CHANNELS}"
            )));
        }
        let adc = adc as usize;

        let name_start = OFFSET_ADC_CHANNEL_NAME as usize + adc * CHANNEL_NAME_LEN;
        channel_names.push(raw::fixed_string(
            &raw_header[name_start..name_start + CHANNEL_NAME_LEN],
        ));
        let units_start = OFFSET_ADC_UNITS as usize + adc * UNITS_LEN;
        channel_units.push(raw::fixed_string(
            &raw_header[units_start..units_start + UNITS_LEN],
        ));

        scales.push(channel_scale(
            sample_format,
            adc_range,
            adc_resolution,
            instrument_scale[adc],
            signal_gain[adc],
            programmable_gain[adc],
            instrument_offset[adc],
            signal_offset[adc],
        ));
    }

    // First-generation files store the sampling interval per multiplexed
    // frame; the true per-channel interval is that times the channel count.
    let sample_interval =
        sample_interval_us as f64 * channel_count as f64 / 1_000_000.0;

    let header = DecodedHeader {
        channel_count,
        episode_count: episodes as u32,
        samples_per_episode: samples_per_episode as u32,
        total_samples: acq_length as u64,
        gapfree: operation_mode == OPERATION_MODE_GAPFREE,
        sample_interval,
        creator,
        start_date: start_date.max(0) as u32,
        start_time: start_time.max(0) as u32,
        channel_names,
        channel_units,
    };

    let data_offset = data_section_ptr as u64 * BLOCK_LEN;

    Ok((header, data_offset, sample_format, scales))
}

/// Builds the raw-to-physical transform for one channel. Float data is
/// stored already scaled; integer data goes through the gain chain.
#[allow(clippy::too_many_arguments)]
fn channel_scale(
    sample_format: SampleFormat,
    adc_range: f32,
    adc_resolution: i32,
    instrument_scale: f32,
    signal_gain: f32,
    programmable_gain: f32,
    instrument_offset: f32,
    signal_offset: f32,
) -> ChannelScale {
    if sample_format == SampleFormat::Float32 {
        return ChannelScale {
            factor: 1.0,
            offset: 0.0,
        };
    }

    let mut divisor =
        adc_resolution as f64 * instrument_scale as f64 * signal_gain as f64 * programmable_gain as f64;
    if divisor == 0.0 {
        divisor = adc_resolution as f64;
    }
    if divisor == 0.0 {
        divisor = 1.0;
    }
    ChannelScale {
        factor: adc_range as f64 / divisor,
        offset: instrument_offset as f64 - signal_offset as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_signature_is_rejected() {
        let raw = vec![0xAAu8; ABF1_HEADER_LEN];
        match decode_header(&raw) {
            Err(AbfError::Decode(msg)) => assert!(msg.contains("signature")),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn zero_channel_header_is_rejected() {
        let mut raw = vec![0u8; ABF1_HEADER_LEN];
        raw[..4].copy_from_slice(ABF1_SIGNATURE);
        match decode_header(&raw) {
            Err(AbfError::Decode(msg)) => assert!(msg.contains("channel count")),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn max_episodes_rounds_the_tail_up() {
        assert_eq!(max_episodes(1000, 400), 3);
        assert_eq!(max_episodes(1200, 400), 3);
        assert_eq!(max_episodes(0, 400), 0);
        assert_eq!(max_episodes(1000, 0), 0);
    }

    #[test]
    fn float_data_is_not_rescaled() {
        let scale = channel_scale(SampleFormat::Float32, 10.0, 32768, 0.5, 1.0, 2.0, 1.5, 0.5);
        assert_eq!(scale.factor, 1.0);
        assert_eq!(scale.offset, 0.0);
    }

    #[test]
    fn integer_scale_applies_the_gain_chain() {
        let scale = channel_scale(SampleFormat::Int16, 10.0, 1000, 0.5, 1.0, 2.0, 1.5, 0.5);
        assert!((scale.factor - 0.01).abs() < 1e-12);
        assert!((scale.offset - 1.0).abs() < 1e-12);
    }
}
