pub mod file;
pub mod settings;

pub use self::{file::File, settings::*};

use anyhow::Context;
use std::path::Path;

/// Reads the config file at `path`, falling back to an empty file if there
/// is none.
pub fn read_config(path: Option<&Path>) -> anyhow::Result<File> {
    match path {
        Some(path) => File::read(path)
            .with_context(|| format!("failed to read config file {}", path.display())),
        None => Ok(File::default()),
    }
}
