mod abf1;
mod abf2;
mod raw;
mod reader;
pub mod types;

use std::path::Path;

// Re-export types
pub use types::*;

/// Loads an ABF file of either format generation and returns the decoded
/// recording.
///
/// # Examples
///
/// ```no_run
/// use abf_importer::load;
///
/// let result = load("path/to/your/file.abf");
/// match result {
///     Ok(recording) => println!(
///         "{} channels, {} s per sample",
///         recording.len(),
///         recording.sample_interval
///     ),
///     Err(e) => println!("Error loading file: {}", e),
/// }
/// ```
pub fn load<P: AsRef<Path>>(file_path: P) -> Result<Recording, AbfError> {
    reader::load_file(file_path.as_ref(), &mut NoProgress)
}

/// Loads an ABF file while reporting progress through the given reporter.
///
/// The reporter receives a percentage and a status message once per
/// (channel, sweep) unit; returning `false` from
/// [`ProgressReporter::update`] aborts the import.
pub fn load_with_progress<P: AsRef<Path>>(
    file_path: P,
    progress: &mut dyn ProgressReporter,
) -> Result<Recording, AbfError> {
    reader::load_file(file_path.as_ref(), progress)
}
