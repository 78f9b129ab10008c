//! Synthesized ABF byte images for the integration tests.
//!
//! Both builders write float-format data sections so that sample values
//! round-trip exactly without going through the integer gain chain.

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const BLOCK_LEN: usize = 512;

pub fn put_i16(buf: &mut [u8], offset: usize, value: i16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_f32(buf: &mut [u8], offset: usize, value: f32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_bytes(buf: &mut [u8], offset: usize, value: &[u8]) {
    buf[offset..offset + value.len()].copy_from_slice(value);
}

/// Shape of a first-generation fixture file.
pub struct Abf1Config {
    pub channels: i16,
    pub episodes: i32,
    /// Multiplexed samples per episode
    pub samples_per_episode: i32,
    /// Multiplexed samples for the whole acquisition
    pub acq_length: i32,
    pub gapfree: bool,
    /// Microseconds per multiplexed sample
    pub sample_interval_us: f32,
    pub start_date: i32,
    pub start_time: i32,
}

impl Default for Abf1Config {
    fn default() -> Self {
        Abf1Config {
            channels: 2,
            episodes: 3,
            samples_per_episode: 8,
            acq_length: 24,
            gapfree: false,
            sample_interval_us: 50.0,
            start_date: 20080116,
            start_time: 37805,
        }
    }
}

/// Builds a first-generation header. Channel names and units are laid out
/// per physical ADC number; the sampling sequence is the identity over the
/// configured channel count.
pub fn abf1_header(cfg: &Abf1Config) -> Vec<u8> {
    let mut h = vec![0u8; 2048];
    put_bytes(&mut h, 0, b"ABF ");
    put_f32(&mut h, 4, 1.83);
    put_i16(&mut h, 8, if cfg.gapfree { 3 } else { 5 });
    put_i32(&mut h, 10, cfg.acq_length);
    put_i32(&mut h, 16, cfg.episodes);
    put_i32(&mut h, 20, cfg.start_date);
    put_i32(&mut h, 24, cfg.start_time);
    put_i32(&mut h, 40, 4); // data section at block 4, right after the header
    put_i16(&mut h, 100, 1); // float samples
    put_i16(&mut h, 120, cfg.channels);
    put_f32(&mut h, 122, cfg.sample_interval_us);
    put_i32(&mut h, 138, cfg.samples_per_episode);
    put_f32(&mut h, 244, 10.0);
    put_i32(&mut h, 252, 32768);
    put_bytes(&mut h, 294, b"Clampex");

    for c in 0..cfg.channels as usize {
        put_i16(&mut h, 410 + c * 2, c as i16);
        let name = format!("AI #{}  pad", c);
        put_bytes(&mut h, 442 + c * 10, &name.as_bytes()[..10]);
        put_bytes(&mut h, 602 + c * 8, b"mV     x");
    }
    h
}

/// Writes a complete first-generation file: header plus the multiplexed
/// float sample stream.
pub fn write_abf1(path: &Path, cfg: &Abf1Config, samples: &[f32]) {
    let mut bytes = abf1_header(cfg);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    File::create(path).unwrap().write_all(&bytes).unwrap();
}

/// Shape of a second-generation fixture file.
pub struct Abf2Config {
    pub channels: usize,
    pub episodes: u32,
    /// Multiplexed samples per episode
    pub samples_per_episode: i32,
    pub gapfree: bool,
    /// Microseconds per channel sample (stored directly, no multiplexing
    /// correction)
    pub sequence_interval_us: f32,
    pub start_date: u32,
    pub start_time_ms: u32,
    /// Per-episode multiplexed lengths; fills the synch array when set
    pub episode_lengths: Option<Vec<u32>>,
}

impl Default for Abf2Config {
    fn default() -> Self {
        Abf2Config {
            channels: 2,
            episodes: 3,
            samples_per_episode: 8,
            gapfree: false,
            sequence_interval_us: 100.0,
            start_date: 20080116,
            start_time_ms: 37_805_000,
            episode_lengths: None,
        }
    }
}

/// Writes a complete second-generation file: file-info block, protocol,
/// ADC entries, string table, optional synch array and the data section.
///
/// Block layout: 0 info, 1 protocol, 2 ADC, 3 strings, 4 synch array,
/// 5.. data.
pub fn write_abf2(path: &Path, cfg: &Abf2Config, samples: &[f32]) {
    let mut info = vec![0u8; BLOCK_LEN];
    put_bytes(&mut info, 0, b"ABF2");
    put_u32(&mut info, 4, 0x0002_0000);
    put_u32(&mut info, 8, BLOCK_LEN as u32);
    put_u32(&mut info, 12, cfg.episodes);
    put_u32(&mut info, 16, cfg.start_date);
    put_u32(&mut info, 20, cfg.start_time_ms);
    put_i16(&mut info, 30, 1); // float samples
    put_u32(&mut info, 60, 1); // creator string index

    // Strings: creator, then per-channel name/units pairs.
    let mut strings: Vec<u8> = Vec::new();
    strings.extend_from_slice(b"Clampex\0");
    for c in 0..cfg.channels {
        strings.extend_from_slice(format!("AI #{}  pad\0", c).as_bytes());
        strings.extend_from_slice(b"mV\0");
    }
    let string_count = 1 + 2 * cfg.channels;

    let section = |info: &mut [u8], index: usize, block: u32, bytes: u32, count: i64| {
        let at = 76 + index * 16;
        put_u32(info, at, block);
        put_u32(info, at + 4, bytes);
        put_bytes(info, at + 8, &count.to_le_bytes());
    };

    section(&mut info, 0, 1, BLOCK_LEN as u32, 1); // protocol
    section(&mut info, 1, 2, 128, cfg.channels as i64); // ADC
    section(&mut info, 9, 3, strings.len() as u32, string_count as i64); // strings
    section(&mut info, 10, 5, 4, samples.len() as i64); // data
    if let Some(lengths) = &cfg.episode_lengths {
        section(&mut info, 15, 4, 8, lengths.len() as i64); // synch array
    }

    let mut protocol = vec![0u8; BLOCK_LEN];
    put_i16(&mut protocol, 0, if cfg.gapfree { 3 } else { 5 });
    put_f32(&mut protocol, 2, cfg.sequence_interval_us);
    put_i32(&mut protocol, 22, cfg.samples_per_episode);
    put_f32(&mut protocol, 110, 10.0);
    put_i32(&mut protocol, 118, 32768);

    let mut adc = vec![0u8; BLOCK_LEN];
    for c in 0..cfg.channels {
        let at = c * 128;
        put_i16(&mut adc, at, c as i16);
        put_i32(&mut adc, at + 74, (2 + 2 * c) as i32); // name index
        put_i32(&mut adc, at + 78, (3 + 2 * c) as i32); // units index
    }

    let mut strings_block = vec![0u8; BLOCK_LEN];
    put_bytes(&mut strings_block, 0, &strings);

    let mut synch_block = vec![0u8; BLOCK_LEN];
    if let Some(lengths) = &cfg.episode_lengths {
        let mut start = 0u32;
        for (i, len) in lengths.iter().enumerate() {
            put_u32(&mut synch_block, i * 8, start);
            put_u32(&mut synch_block, i * 8 + 4, *len);
            start += len;
        }
    }

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&info);
    bytes.extend_from_slice(&protocol);
    bytes.extend_from_slice(&adc);
    bytes.extend_from_slice(&strings_block);
    bytes.extend_from_slice(&synch_block);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    File::create(path).unwrap().write_all(&bytes).unwrap();
}

/// Multiplexed test pattern: the sample of channel `c` at per-channel index
/// `k` is `(100 * c + k)`, interleaved frame by frame.
pub fn interleaved_pattern(channels: usize, per_channel: usize) -> Vec<f32> {
    let mut samples = Vec::with_capacity(channels * per_channel);
    for k in 0..per_channel {
        for c in 0..channels {
            samples.push((100 * c + k) as f32);
        }
    }
    samples
}
