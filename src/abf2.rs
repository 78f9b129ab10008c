//! Decoder for second-generation ABF files.
//!
//! The header is a 512-byte file-info block followed by a map of sections,
//! each living at a 512-byte block boundary. Only the sections the importer
//! consumes are decoded: protocol, ADC configuration, the string table, the
//! data section and (when present) the synch array that carries per-episode
//! lengths for variable-length acquisitions.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use crate::raw::{self, SampleFormat, HEADER_PROBE_LEN};
use crate::reader::FormatReader;
use crate::types::{AbfError, DecodedHeader};

pub(crate) const ABF2_SIGNATURE: &[u8; 4] = b"ABF2";
const BLOCK_LEN: u64 = 512;
const MAX_ADC_CHANNELS: usize = 16;
const OPERATION_MODE_GAPFREE: i16 = 3;

// File-info field offsets.
const OFFSET_ACTUAL_EPISODES: u64 = 12;
const OFFSET_FILE_START_DATE: u64 = 16;
const OFFSET_FILE_START_TIME_MS: u64 = 20;
const OFFSET_DATA_FORMAT: u64 = 30;
const OFFSET_CREATOR_NAME_INDEX: u64 = 60;

// Section map: 16-byte entries starting at offset 76, in canonical order.
const SECTION_MAP_OFFSET: usize = 76;
const SECTION_ENTRY_LEN: usize = 16;
const SECTION_COUNT: usize = 18;
const SECTION_PROTOCOL: usize = 0;
const SECTION_ADC: usize = 1;
const SECTION_STRINGS: usize = 9;
const SECTION_DATA: usize = 10;
const SECTION_SYNCH_ARRAY: usize = 15;

// Protocol section field offsets.
const PROTOCOL_OPERATION_MODE: usize = 0;
const PROTOCOL_SEQUENCE_INTERVAL: usize = 2;
const PROTOCOL_SAMPLES_PER_EPISODE: usize = 22;
const PROTOCOL_ADC_RANGE: usize = 110;
const PROTOCOL_ADC_RESOLUTION: usize = 118;
const PROTOCOL_MIN_LEN: usize = 122;

// ADC section per-entry field offsets. Entries are stored in
// sampling-sequence order, one per logical channel.
const ADC_PROGRAMMABLE_GAIN: usize = 28;
const ADC_INSTRUMENT_SCALE: usize = 40;
const ADC_INSTRUMENT_OFFSET: usize = 44;
const ADC_SIGNAL_GAIN: usize = 48;
const ADC_SIGNAL_OFFSET: usize = 52;
const ADC_CHANNEL_NAME_INDEX: usize = 74;
const ADC_UNITS_INDEX: usize = 78;
const ADC_ENTRY_MIN_LEN: usize = 82;

/// Location and shape of one section from the file-info map.
#[derive(Debug, Clone, Copy, Default)]
struct SectionInfo {
    block_index: u32,
    entry_bytes: u32,
    entry_count: i64,
}

impl SectionInfo {
    fn file_offset(&self) -> u64 {
        self.block_index as u64 * BLOCK_LEN
    }

    fn is_present(&self) -> bool {
        self.block_index != 0 && self.entry_count > 0
    }
}

/// Linear transform from raw integer samples to physical units.
#[derive(Debug, Clone, Copy)]
struct ChannelScale {
    factor: f64,
    offset: f64,
}

/// Reader for one open second-generation file.
pub(crate) struct Abf2Reader {
    reader: BufReader<File>,
    header: DecodedHeader,
    data_offset: u64,
    sample_format: SampleFormat,
    /// Scale per logical channel, in sampling-sequence order
    scales: Vec<ChannelScale>,
    /// Multiplexed episode start offsets and lengths from the synch array,
    /// present only for variable-length acquisitions
    episode_table: Option<Vec<(u64, u64)>>,
}

impl Abf2Reader {
    /// Opens the file, walks the section map and decodes the header.
    pub(crate) fn open(path: &Path) -> Result<Abf2Reader, AbfError> {
        let file = File::open(path).map_err(|source| AbfError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let mut reader = BufReader::with_capacity(65536, file);

        let read_err = |what| move |source| AbfError::Read { what, source };

        let mut info_block = [0u8; HEADER_PROBE_LEN];
        reader
            .read_exact(&mut info_block)
            .map_err(read_err("file info block"))?;

        if &info_block[..4] != ABF2_SIGNATURE {
            return Err(AbfError::Decode(
                "unrecognised file signature (expected \"ABF2\")".to_string(),
            ));
        }

        let mut cursor = Cursor::new(&info_block[..]);
        cursor.set_position(OFFSET_ACTUAL_EPISODES);
        let episodes = cursor
            .read_u32::<LittleEndian>()
            .map_err(read_err("file info block"))?;
        cursor.set_position(OFFSET_FILE_START_DATE);
        let start_date = cursor
            .read_u32::<LittleEndian>()
            .map_err(read_err("file info block"))?;
        cursor.set_position(OFFSET_FILE_START_TIME_MS);
        let start_time_ms = cursor
            .read_u32::<LittleEndian>()
            .map_err(read_err("file info block"))?;
        cursor.set_position(OFFSET_DATA_FORMAT);
        let data_format = cursor
            .read_i16::<LittleEndian>()
            .map_err(read_err("file info block"))?;
        cursor.set_position(OFFSET_CREATOR_NAME_INDEX);
        let creator_name_index = cursor
            .read_u32::<LittleEndian>()
            .map_err(read_err("file info block"))?;

        let sample_format = match data_format {
            0 => SampleFormat::Int16,
            1 => SampleFormat::Float32,
            other => {
                return Err(AbfError::Decode(format!(
                    "unsupported data format {other} (expected 0 or 1)"
                )))
            }
        };

        let sections = parse_section_map(&info_block)?;

        let protocol = sections[SECTION_PROTOCOL];
        if !protocol.is_present() || (protocol.entry_bytes as usize) < PROTOCOL_MIN_LEN {
            return Err(AbfError::Decode("missing protocol section".to_string()));
        }
        let protocol_bytes =
            read_section_bytes(&mut reader, &protocol, protocol.entry_bytes as usize)
                .map_err(read_err("protocol section"))?;
        let operation_mode = i16_at(&protocol_bytes, PROTOCOL_OPERATION_MODE);
        let sequence_interval_us = f32_at(&protocol_bytes, PROTOCOL_SEQUENCE_INTERVAL);
        let samples_per_episode = i32_at(&protocol_bytes, PROTOCOL_SAMPLES_PER_EPISODE);
        let adc_range = f32_at(&protocol_bytes, PROTOCOL_ADC_RANGE);
        let adc_resolution = i32_at(&protocol_bytes, PROTOCOL_ADC_RESOLUTION);

        if samples_per_episode <= 0 {
            return Err(AbfError::Decode(
                "non-positive samples-per-episode in protocol section".to_string(),
            ));
        }

        let adc = sections[SECTION_ADC];
        if !adc.is_present() || (adc.entry_bytes as usize) < ADC_ENTRY_MIN_LEN {
            return Err(AbfError::Decode("missing ADC section".to_string()));
        }
        if adc.entry_count > MAX_ADC_CHANNELS as i64 {
            return Err(AbfError::Decode(format!(
                "invalid channel count {} (expected 1..={})",
                adc.entry_count, MAX_ADC_CHANNELS
            )));
        }
        let channel_count = adc.entry_count as usize;

        let strings = sections[SECTION_STRINGS];
        let string_table = if strings.is_present() {
            let blob = read_section_bytes(&mut reader, &strings, strings.entry_bytes as usize)
                .map_err(read_err("strings section"))?;
            split_string_table(&blob)
        } else {
            Vec::new()
        };

        let entry_len = adc.entry_bytes as usize;
        let mut channel_names = Vec::with_capacity(channel_count);
        let mut channel_units = Vec::with_capacity(channel_count);
        let mut scales = Vec::with_capacity(channel_count);
        for c in 0..channel_count {
            reader
                .seek(SeekFrom::Start(adc.file_offset() + (c * entry_len) as u64))
                .map_err(read_err("ADC section"))?;
            let mut entry = vec![0u8; entry_len];
            reader
                .read_exact(&mut entry)
                .map_err(read_err("ADC section"))?;

            let name_index = i32_at(&entry, ADC_CHANNEL_NAME_INDEX);
            let units_index = i32_at(&entry, ADC_UNITS_INDEX);
            channel_names.push(resolve_string(&string_table, name_index));
            channel_units.push(resolve_string(&string_table, units_index));

            scales.push(channel_scale(
                sample_format,
                adc_range,
                adc_resolution,
                f32_at(&entry, ADC_INSTRUMENT_SCALE),
                f32_at(&entry, ADC_SIGNAL_GAIN),
                f32_at(&entry, ADC_PROGRAMMABLE_GAIN),
                f32_at(&entry, ADC_INSTRUMENT_OFFSET),
                f32_at(&entry, ADC_SIGNAL_OFFSET),
            ));
        }

        let data = sections[SECTION_DATA];
        if !data.is_present() {
            return Err(AbfError::Decode("missing data section".to_string()));
        }
        let total_samples = data.entry_count as u64;

        // A synch array with one entry per episode carries the multiplexed
        // length of each (variable-length) episode.
        let synch = sections[SECTION_SYNCH_ARRAY];
        let episode_table = if synch.is_present() && synch.entry_count as u64 == episodes as u64 {
            let entries =
                read_synch_array(&mut reader, &synch).map_err(read_err("synch array section"))?;
            let mut table = Vec::with_capacity(entries.len());
            let mut offset = 0u64;
            for length in entries {
                table.push((offset, length));
                offset += length;
            }
            if offset > total_samples {
                return Err(AbfError::TooManyEpisodes {
                    declared: episodes,
                    available: max_full_episodes(total_samples, &table),
                });
            }
            Some(table)
        } else {
            let available = if samples_per_episode > 0 {
                total_samples.div_ceil(samples_per_episode as u64) as u32
            } else {
                0
            };
            if episodes > available {
                return Err(AbfError::TooManyEpisodes {
                    declared: episodes,
                    available,
                });
            }
            None
        };

        let header = DecodedHeader {
            channel_count,
            episode_count: episodes,
            samples_per_episode: samples_per_episode as u32,
            total_samples,
            gapfree: operation_mode == OPERATION_MODE_GAPFREE,
            // Second-generation files store the per-channel interval
            // directly; no multiplexing correction here.
            sample_interval: sequence_interval_us as f64 / 1_000_000.0,
            creator: resolve_string(&string_table, creator_name_index as i32),
            start_date,
            // Stored in milliseconds since midnight; the decode below works
            // in whole seconds.
            start_time: start_time_ms / 1000,
            channel_names,
            channel_units,
        };

        Ok(Abf2Reader {
            reader,
            header,
            data_offset: data.file_offset(),
            sample_format,
            scales,
            episode_table,
        })
    }
}

impl FormatReader for Abf2Reader {
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
        if let Some(table) = &self.episode_table {
            let (_, length) = table[episode as usize - 1];
            return Ok(length as usize / h.channel_count);
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
        let mux_start = match &self.episode_table {
            Some(table) => table[episode as usize - 1].0,
            None => (episode as u64 - 1) * h.samples_per_episode as u64,
        };
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

/// Parses the 18-entry section map out of the file-info block.
fn parse_section_map(info_block: &[u8]) -> Result<[SectionInfo; SECTION_COUNT], AbfError> {
    let mut sections = [SectionInfo::default(); SECTION_COUNT];
    let mut cursor = Cursor::new(info_block);
    let read_err = |source| AbfError::Read {
        what: "section map",
        source,
    };
    for (i, section) in sections.iter_mut().enumerate() {
        cursor.set_position((SECTION_MAP_OFFSET + i * SECTION_ENTRY_LEN) as u64);
        section.block_index = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        section.entry_bytes = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        section.entry_count = cursor.read_i64::<LittleEndian>().map_err(read_err)?;
        if section.entry_count < 0 {
            return Err(AbfError::Decode(
                "negative entry count in section map".to_string(),
            ));
        }
    }
    Ok(sections)
}

fn read_section_bytes(
    reader: &mut BufReader<File>,
    section: &SectionInfo,
    len: usize,
) -> std::io::Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(section.file_offset()))?;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_synch_array(
    reader: &mut BufReader<File>,
    section: &SectionInfo,
) -> std::io::Result<Vec<u64>> {
    reader.seek(SeekFrom::Start(section.file_offset()))?;
    let mut lengths = Vec::with_capacity(section.entry_count as usize);
    for _ in 0..section.entry_count {
        let _start = reader.read_u32::<LittleEndian>()?;
        let length = reader.read_u32::<LittleEndian>()?;
        lengths.push(length as u64);
    }
    Ok(lengths)
}

/// Number of leading episodes from the table that fit into the data section.
fn max_full_episodes(total_samples: u64, table: &[(u64, u64)]) -> u32 {
    table
        .iter()
        .take_while(|(start, length)| start + length <= total_samples)
        .count() as u32
}

/// Splits the strings section blob into its NUL-terminated entries.
fn split_string_table(blob: &[u8]) -> Vec<String> {
    blob.split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Resolves a 1-based string-table index; 0 and out-of-range indices give
/// the empty string.
fn resolve_string(table: &[String], index: i32) -> String {
    if index <= 0 {
        return String::new();
    }
    table
        .get(index as usize - 1)
        .cloned()
        .unwrap_or_default()
}

fn i16_at(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn i32_at(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn f32_at(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
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

    let mut divisor = adc_resolution as f64
        * instrument_scale as f64
        * signal_gain as f64
        * programmable_gain as f64;
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
