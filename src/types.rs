use ndarray::Array1;
use std::io;
use std::ops::Index;
use thiserror::Error;

/// One sweep (or "episode") of samples from a single channel.
///
/// The sample buffer is sized at construction and never resized in place.
/// The label records where the section came from, e.g.
/// `"recording.abf, Section # 3"`.
#[derive(Debug, Clone, Default)]
pub struct Section {
    /// Samples in physical units (e.g. mV or pA, see the channel's units)
    pub data: Array1<f64>,
    /// Human-readable origin of this section
    pub label: String,
}

impl Section {
    /// Creates a section from a sample vector and a label.
    pub fn new(samples: Vec<f64>, label: impl Into<String>) -> Self {
        Section {
            data: Array1::from_vec(samples),
            label: label.into(),
        }
    }

    /// Creates a zero-filled section of the given length.
    pub fn zeros(len: usize, label: impl Into<String>) -> Self {
        Section {
            data: Array1::zeros(len),
            label: label.into(),
        }
    }

    /// Number of samples in this section.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the section holds no samples.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One logical signal source spanning all sweeps of a recording.
///
/// In episodic files every channel of a recording has the same number of
/// sections; in gapfree files a channel holds exactly one section unless the
/// import had to fall back to segmented storage.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    sections: Vec<Section>,
    /// Display name of the channel (e.g. "Vm")
    pub name: String,
    /// Physical unit string (e.g. "mV")
    pub units: String,
}

impl Channel {
    /// Creates a channel pre-sized to hold `n_sections` empty sections.
    pub fn with_sections(n_sections: usize) -> Self {
        Channel {
            sections: vec![Section::default(); n_sections],
            name: String::new(),
            units: String::new(),
        }
    }

    /// Places a section at the given index, growing the channel if needed.
    pub fn insert_section(&mut self, index: usize, section: Section) {
        if self.sections.len() <= index {
            self.sections.resize(index + 1, Section::default());
        }
        self.sections[index] = section;
    }

    /// All sections of this channel, in sweep order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Number of sections in this channel.
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Returns true if the channel holds no sections.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

impl Index<usize> for Channel {
    type Output = Section;

    fn index(&self, index: usize) -> &Section {
        &self.sections[index]
    }
}

/// The complete decoded result of one file import.
///
/// Holds all channels with all of their sweeps plus recording-level
/// metadata. A recording returned by [`crate::load`] always has exactly as
/// many channels as the file declared; a failed import never hands back a
/// partially populated recording.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    channels: Vec<Channel>,
    /// Time per sample in seconds, already corrected for multiplexing
    pub sample_interval: f64,
    /// Free-text comment, typically `"Created with <acquisition software>"`
    pub comment: String,
    /// Acquisition start date as `"YYYY/M/D"`
    pub date: String,
    /// Acquisition start time as `"H:MM:SS"`
    pub time: String,
}

impl Recording {
    /// Creates an empty recording.
    pub fn new() -> Self {
        Recording::default()
    }

    /// Places a channel at the given index, growing the recording first if
    /// it holds fewer slots than the index requires.
    pub fn insert_channel(&mut self, index: usize, channel: Channel) {
        if self.channels.len() <= index {
            self.channels.resize(index + 1, Channel::default());
        }
        self.channels[index] = channel;
    }

    /// All channels of this recording.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Number of channels in this recording.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if the recording holds no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Duration of the recording in seconds, taken from the first section
    /// of the first channel. Returns 0.0 for an empty recording.
    pub fn duration(&self) -> f64 {
        match self.channels.first().and_then(|ch| ch.sections().first()) {
            Some(section) => section.len() as f64 * self.sample_interval,
            None => 0.0,
        }
    }
}

impl Index<usize> for Recording {
    type Output = Channel;

    fn index(&self, index: usize) -> &Channel {
        &self.channels[index]
    }
}

/// Header metadata shared by both ABF format generations.
///
/// Transient: built once per import from the format-specific byte layout and
/// discarded after the recording is populated. Channel names and units are
/// already resolved through the file's sampling sequence but still carry the
/// fixed-width field padding; trimming happens when the recording is built.
#[derive(Debug, Clone)]
pub struct DecodedHeader {
    /// Number of logical channels in the file
    pub channel_count: usize,
    /// Number of episodes (sweeps); for gapfree files, the number of
    /// fixed-size chunks the acquisition was stored as
    pub episode_count: u32,
    /// Multiplexed samples per episode (all channels interleaved)
    pub samples_per_episode: u32,
    /// Total multiplexed samples of the whole acquisition
    pub total_samples: u64,
    /// True for continuous (gapfree) acquisition
    pub gapfree: bool,
    /// Time per sample in seconds for one channel
    pub sample_interval: f64,
    /// Name of the acquisition software that wrote the file
    pub creator: String,
    /// Start date packed as YYYYMMDD
    pub start_date: u32,
    /// Start time in seconds since midnight
    pub start_time: u32,
    /// Channel names in sampling-sequence order, padding untrimmed
    pub channel_names: Vec<String>,
    /// Channel unit strings in sampling-sequence order, padding untrimmed
    pub channel_units: Vec<String>,
}

/// Receives import progress as a percentage plus a status message.
///
/// The importer calls [`update`](ProgressReporter::update) once per
/// (channel, sweep) unit and at a few coarser milestones. Returning `false`
/// asks the importer to stop; the import then fails with
/// [`AbfError::Aborted`] and no recording is returned.
pub trait ProgressReporter {
    /// Reports `percent` (0..=100) and a human-readable status line.
    /// Returns `true` to continue the import.
    fn update(&mut self, percent: u32, message: &str) -> bool;
}

/// A reporter that discards all updates and never aborts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn update(&mut self, _percent: u32, _message: &str) -> bool {
        true
    }
}

/// Error conditions that may occur while importing an ABF file.
#[derive(Debug, Error)]
pub enum AbfError {
    /// The file could not be opened or its header probe could not be read
    #[error("error while opening {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    /// An I/O failure while reading a specific part of the file
    #[error("error while reading {what}: {source}")]
    Read {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// The header could not be decoded into a consistent description
    #[error("error while decoding file header: {0}")]
    Decode(String),

    /// The header declares more episodes than the data section can hold
    #[error("declared episode count {declared} exceeds the {available} episodes present in the data section")]
    TooManyEpisodes { declared: u32, available: u32 },

    /// The per-episode sample count could not be determined
    #[error("couldn't determine sample count for episode # {episode}: {reason}")]
    SampleCountQuery { episode: u32, reason: String },

    /// A sweep read returned a different number of samples than requested
    #[error("sample count mismatch while reading channel #{channel} episode # {episode}: requested {requested}, read {read}")]
    SampleCountMismatch {
        channel: usize,
        episode: u32,
        requested: usize,
        read: usize,
    },

    /// The progress callback requested an early stop
    #[error("import aborted by progress callback")]
    Aborted,
}
