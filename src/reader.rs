use log::warn;
use std::path::Path;

use crate::abf1::Abf1Reader;
use crate::abf2::{Abf2Reader, ABF2_SIGNATURE};
use crate::raw;
use crate::types::{AbfError, Channel, ProgressReporter, Recording, Section};

/// The two on-disk header generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileFormat {
    Abf1,
    Abf2,
}

/// Capability interface over one open file of either format generation:
/// decoded header access, the authoritative per-episode sample count, and
/// de-interleaved per-channel sweep reads.
pub(crate) trait FormatReader {
    fn header(&self) -> &crate::types::DecodedHeader;

    /// Per-channel sample count for the given 1-based episode.
    fn samples_for_episode(&mut self, episode: u32) -> Result<usize, AbfError>;

    /// Reads up to `count` samples of one channel from one episode. Returns
    /// fewer samples when the file ends early; the caller decides whether
    /// that is tolerable.
    fn read_sweep(&mut self, channel: usize, episode: u32, count: usize)
        -> Result<Vec<f64>, AbfError>;
}

/// Decides which decoder applies from the raw header bytes. Only the
/// second-generation signature is checked; everything else is handed to the
/// first-generation decoder, which performs its own validation.
pub(crate) fn detect_format(probe: &[u8]) -> FileFormat {
    if probe.len() >= 4 && &probe[..4] == ABF2_SIGNATURE {
        FileFormat::Abf2
    } else {
        FileFormat::Abf1
    }
}

/// How a gapfree channel is stored in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GapfreeLayout {
    /// One reassembled section of the given per-channel length
    Single(usize),
    /// Fall back to one bounded section per chunk
    Chunked,
}

/// Largest per-channel buffer a single section may hold.
fn max_section_len() -> u64 {
    isize::MAX as u64 / std::mem::size_of::<f64>() as u64
}

/// Decides whether a gapfree channel fits into one section or must be
/// downgraded to chunked storage.
fn gapfree_layout(per_channel_total: u64) -> GapfreeLayout {
    if per_channel_total == 0 || per_channel_total >= max_section_len() {
        GapfreeLayout::Chunked
    } else {
        GapfreeLayout::Single(per_channel_total as usize)
    }
}

/// Percentage for the (channel, episode) progress unit: the channel
/// contribution plus the episode's share of one channel's slice.
fn progress_percent(channel: usize, channel_count: usize, episode: u32, episode_count: u32) -> u32 {
    (channel as f64 / channel_count as f64 * 100.0
        + (episode as f64 - 1.0) / episode_count as f64 * (100.0 / channel_count as f64)) as u32
}

/// Decodes a packed YYYYMMDD date integer.
fn date_to_str(date: u32) -> String {
    let year = date / 10000;
    let month = (date % 10000) / 100;
    let day = date % 100;
    format!("{year}/{month}/{day}")
}

/// Decodes seconds-since-midnight into `H:MM:SS`.
fn time_to_str(time: u32) -> String {
    let hours = time / 3600;
    let minutes = (time % 3600) / 60;
    let seconds = time % 60;
    format!("{hours}:{minutes:02}:{seconds:02}")
}

/// Cuts a fixed-width field at the first run of two consecutive spaces.
/// This is the documented padding convention, not a general whitespace trim.
fn trim_padding(field: &str) -> String {
    match field.find("  ") {
        Some(pos) => field[..pos].to_string(),
        None => field.to_string(),
    }
}

/// Imports one file: detects the format generation, decodes its header and
/// streams every channel and sweep into a fresh recording.
///
/// On any failure the error is returned and nothing else escapes; the
/// partially built recording is dropped and the file handle is released when
/// the format reader goes out of scope, whichever path returns.
pub(crate) fn load_file(
    path: &Path,
    progress: &mut dyn ProgressReporter,
) -> Result<Recording, AbfError> {
    let probe = raw::read_probe(path)?;

    match detect_format(&probe) {
        FileFormat::Abf2 => {
            let mut format = Abf2Reader::open(path)?;
            import_channels(&mut format, path, progress)
        }
        FileFormat::Abf1 => {
            let mut format = Abf1Reader::open(path)?;
            import_channels(&mut format, path, progress)
        }
    }
}

/// The shared orchestration loop: outer loop over channels, inner loop over
/// episodes, gapfree reassembly where the header asks for it, and recording
/// metadata assignment at the end.
fn import_channels(
    format: &mut dyn FormatReader,
    path: &Path,
    progress: &mut dyn ProgressReporter,
) -> Result<Recording, AbfError> {
    let header = format.header().clone();
    let channel_count = header.channel_count;
    let episode_count = header.episode_count;
    let chunk_size = header.samples_per_episode as usize / channel_count;

    let mut recording = Recording::new();

    for channel_index in 0..channel_count {
        let base_percent = (channel_index as f64 / channel_count as f64 * 100.0) as u32;
        if !progress.update(base_percent, "Memory allocation") {
            return Err(AbfError::Aborted);
        }

        let mut gapfree = header.gapfree;
        let mut final_sections = if gapfree { 1 } else { episode_count as usize };
        let mut grand_size = chunk_size;

        if gapfree {
            let per_channel_total = header.total_samples / channel_count as u64;
            match gapfree_layout(per_channel_total) {
                GapfreeLayout::Single(len) => grand_size = len,
                GapfreeLayout::Chunked => {
                    warn!(
                        "gapfree channel #{} is too large for a single section ({} samples); \
                         falling back to segmented storage",
                        channel_index + 1,
                        per_channel_total
                    );
                    if !progress.update(
                        base_percent,
                        "Gapfree file is too large for a single section. \
                         It will be segmented.\nFile opening may be very slow.",
                    ) {
                        return Err(AbfError::Aborted);
                    }
                    gapfree = false;
                    final_sections = episode_count as usize;
                }
            }
        }

        let mut channel = Channel::with_sections(final_sections);
        channel.name = trim_padding(&header.channel_names[channel_index]);
        channel.units = trim_padding(&header.channel_units[channel_index]);

        let mut grand_section = if gapfree {
            Section::zeros(grand_size, section_label(path, None))
        } else {
            Section::default()
        };

        for episode in 1..=episode_count {
            let percent =
                progress_percent(channel_index, channel_count, episode, episode_count);
            let message = format!(
                "Reading channel #{} of {}, Section #{} of {}",
                channel_index + 1,
                channel_count,
                episode,
                episode_count
            );
            if !progress.update(percent, &message) {
                return Err(AbfError::Aborted);
            }

            // The tail chunk is whatever the chunked episodes leave over; a
            // header whose episode count does not match the acquisition
            // length (possible in variable-length files opened as gapfree)
            // would make this negative.
            let requested = if gapfree {
                if episode == episode_count {
                    match grand_size.checked_sub((episode as usize - 1) * chunk_size) {
                        Some(tail) => tail,
                        None => {
                            return Err(AbfError::Decode(format!(
                                "gapfree episode layout ({episode_count} episodes of {chunk_size} \
                                 samples) exceeds the {grand_size}-sample acquisition"
                            )))
                        }
                    }
                } else {
                    chunk_size
                }
            } else {
                format.samples_for_episode(episode)?
            };

            let samples = format.read_sweep(channel_index, episode, requested)?;

            // A short read is the designed tail of a gapfree acquisition;
            // everywhere else it is a hard failure.
            let short_read_allowed = gapfree && episode == episode_count;
            if samples.len() != requested && !short_read_allowed {
                return Err(AbfError::SampleCountMismatch {
                    channel: channel_index,
                    episode,
                    requested,
                    read: samples.len(),
                });
            }

            if gapfree {
                let offset = (episode as usize - 1) * chunk_size;
                if offset + samples.len() <= grand_section.len() {
                    for (i, value) in samples.iter().enumerate() {
                        grand_section.data[offset + i] = *value;
                    }
                } else {
                    warn!(
                        "dropping gapfree chunk #{} of channel #{}: \
                         {} samples at offset {} overflow the {}-sample section",
                        episode,
                        channel_index + 1,
                        samples.len(),
                        offset,
                        grand_section.len()
                    );
                }
            } else {
                let label = section_label(path, Some(episode));
                channel.insert_section(episode as usize - 1, Section::new(samples, label));
            }
        }

        if gapfree {
            channel.insert_section(0, grand_section);
        }

        recording.insert_channel(channel_index, channel);

        let done_percent = ((channel_index + 1) as f64 / channel_count as f64 * 100.0) as u32;
        if !progress.update(done_percent, "Completing channel reading") {
            return Err(AbfError::Aborted);
        }
    }

    recording.sample_interval = header.sample_interval;
    recording.comment = format!("Created with {}", header.creator);
    recording.date = date_to_str(header.start_date);
    recording.time = time_to_str(header.start_time);

    Ok(recording)
}

/// Section label: episodic sections carry their episode number, gapfree
/// channels get a single combined label.
fn section_label(path: &Path, episode: Option<u32>) -> String {
    match episode {
        Some(n) => format!("{}, Section # {}", path.display(), n),
        None => format!("{}, gapfree section", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_second_generation_signature() {
        let mut probe = [0u8; 512];
        probe[..4].copy_from_slice(b"ABF2");
        assert_eq!(detect_format(&probe), FileFormat::Abf2);
    }

    #[test]
    fn anything_else_falls_back_to_first_generation() {
        assert_eq!(detect_format(b"ABF "), FileFormat::Abf1);
        assert_eq!(detect_format(&[0xFF; 512]), FileFormat::Abf1);
        assert_eq!(detect_format(b"AB"), FileFormat::Abf1);
    }

    #[test]
    fn date_decoding_uses_integer_division() {
        assert_eq!(date_to_str(20080116), "2008/1/16");
        assert_eq!(date_to_str(19991231), "1999/12/31");
    }

    #[test]
    fn time_decoding_zero_pads_minutes_and_seconds() {
        assert_eq!(time_to_str(37805), "10:30:05");
        assert_eq!(time_to_str(3605), "1:00:05");
        assert_eq!(time_to_str(0), "0:00:00");
    }

    #[test]
    fn padding_trim_cuts_at_the_first_double_space() {
        assert_eq!(trim_padding("Vm  (padding)"), "Vm");
        assert_eq!(trim_padding("IN 0      "), "IN 0");
        assert_eq!(trim_padding("mV"), "mV");
    }

    #[test]
    fn single_spaces_survive_the_trim() {
        assert_eq!(trim_padding("patch current"), "patch current");
    }

    #[test]
    fn gapfree_layout_downgrades_oversized_channels() {
        assert_eq!(gapfree_layout(1024), GapfreeLayout::Single(1024));
        assert_eq!(gapfree_layout(0), GapfreeLayout::Chunked);
        assert_eq!(gapfree_layout(u64::MAX), GapfreeLayout::Chunked);
        assert_eq!(gapfree_layout(max_section_len()), GapfreeLayout::Chunked);
    }

    #[test]
    fn progress_interpolates_channel_and_episode_shares() {
        // Channel 0 of 2, episode 1 of 4: nothing done yet.
        assert_eq!(progress_percent(0, 2, 1, 4), 0);
        // Channel 1 of 2, episode 3 of 4: 50 + (2/4) * 50.
        assert_eq!(progress_percent(1, 2, 3, 4), 75);
        assert_eq!(progress_percent(1, 2, 1, 4), 50);
    }
}
