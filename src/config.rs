//! Pipeline configuration and layered loading.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::chunker::{TextBounds, DEFAULT_MAX_TEXT_CHARS, DEFAULT_MIN_TEXT_CHARS};
use crate::client::RetryPolicy;

pub const ENV_PREFIX: &str = "GLOSSATOR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotatorConfig {
    /// Upper bound on chunk length, in chars.
    pub max_chunk_size: usize,
    /// Chars each chunk re-reads from the end of the previous one.
    pub chunk_overlap: usize,
    /// How far before the hard cut to look for a paragraph or sentence break.
    /// Defaults to a quarter of `max_chunk_size`.
    pub boundary_lookback: Option<usize>,
    pub min_text_chars: usize,
    pub max_text_chars: usize,
    /// Calls allowed in flight at once against the annotation service.
    pub max_concurrency: usize,
    /// Pause between texts in a batch.
    pub inter_request_delay_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 3000,
            chunk_overlap: 0,
            boundary_lookback: None,
            min_text_chars: DEFAULT_MIN_TEXT_CHARS,
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
            max_concurrency: 4,
            inter_request_delay_ms: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

impl AnnotatorConfig {
    pub fn text_bounds(&self) -> TextBounds {
        TextBounds {
            min_chars: self.min_text_chars,
            max_chars: self.max_text_chars,
        }
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }
}

/// Defaults, then the optional settings file, then `GLOSSATOR__*` variables
/// (`GLOSSATOR__RETRY__MAX_ATTEMPTS=5`).
pub fn load(settings: Option<&Path>) -> Result<AnnotatorConfig, config::ConfigError> {
    let mut builder = Config::builder();
    if let Some(path) = settings {
        builder = builder.add_source(File::from(path).required(true));
    }
    builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
