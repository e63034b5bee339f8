//! Declared failure kinds of the data layer.
//!
//! Functions in this crate return `anyhow::Result` and attach `.context(..)`
//! breadcrumbs as errors travel upwards. The kinds below are the ones a caller
//! may want to react to; recover them with `err.downcast_ref::<DataError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    /// An annotation file, image file or directory does not exist.
    #[error("path not found: {path}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An annotation file exists but cannot be parsed or is inconsistent.
    #[error("malformed annotation file {path}: {reason}")]
    MalformedAnnotation { path: PathBuf, reason: String },

    /// A configuration file or value cannot be interpreted.
    #[error("malformed configuration: {0}")]
    MalformedConfig(String),

    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("unsupported data backend '{0}' (expected 'pytorch', 'dali-gpu' or 'dali-mlu')")]
    UnsupportedBackend(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A pipeline stage was invoked out of order.
    #[error("pipeline stage '{stage}' called in state '{state}'")]
    PipelineState {
        stage: &'static str,
        state: &'static str,
    },
}

impl DataError {
    /// Maps an I/O failure on `path` to `NotFound` when the file is missing,
    /// and to `MalformedAnnotation` otherwise.
    pub(crate) fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            DataError::NotFound { path, source }
        } else {
            DataError::MalformedAnnotation {
                path,
                reason: source.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_missing_file_maps_to_not_found() {
        let err = DataError::from_io(
            "/nope/instances_val2017.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, DataError::NotFound { .. }));
        assert!(err.to_string().contains("instances_val2017.json"));
    }

    #[test]
    fn test_kind_survives_anyhow_context() {
        let err = anyhow!(DataError::UnsupportedBackend("dali-tpu".into()))
            .context("while building the train loader");
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::UnsupportedBackend(name)) if name == "dali-tpu"
        ));
    }
}
