//! Prompt token estimation.
//!
//! The count feeds `hard_cap - prompt_tokens`, so it must come from the same
//! vocabulary the serving model uses. An estimate that disagrees with the
//! server either wastes budget or truncates generations.

use std::path::Path;

use tokenizers::Tokenizer;
use tracing::debug;

use crate::errors::GenerationError;

/// Returns how many model tokens a text blob will consume.
///
/// Implementations are synchronous and CPU-bound; async callers run them on
/// the blocking pool.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> Result<usize, GenerationError>;
}

/// Estimator backed by a HuggingFace `tokenizer.json`.
pub struct HfTokenEstimator {
    tokenizer: Tokenizer,
}

impl HfTokenEstimator {
    /// Load the tokenizer artifact. A missing or unreadable file is fatal
    /// for the run: there is no fallback estimator.
    pub fn from_file(path: &Path) -> Result<Self, GenerationError> {
        if !path.exists() {
            return Err(GenerationError::ResourceUnavailable(format!(
                "tokenizer not found at {} (set TESTGEN_TOKENIZER or --tokenizer)",
                path.display()
            )));
        }

        // Units already run in parallel; keep each encode single-threaded.
        if !tokenizers::utils::parallelism::is_parallelism_configured() {
            tokenizers::utils::parallelism::set_parallelism(false);
        }

        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            GenerationError::ResourceUnavailable(format!(
                "tokenizer load failed for {}: {e}",
                path.display()
            ))
        })?;

        debug!(path = %path.display(), vocab = tokenizer.get_vocab_size(true), "tokenizer loaded");
        Ok(Self { tokenizer })
    }
}

impl TokenEstimator for HfTokenEstimator {
    fn estimate(&self, text: &str) -> Result<usize, GenerationError> {
        // Special tokens included: the server counts the BOS token too.
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(encode_failed)?;
        Ok(encoding.len())
    }
}

/// The tokenizer itself loaded fine, so a failed encode only sinks the unit
/// whose text it was.
fn encode_failed(err: impl std::fmt::Display) -> GenerationError {
    GenerationError::Internal(format!("tokenizer encode failed: {err}"))
}

/// Remaining completion budget. Non-positive means the prompt alone already
/// fills the cap.
pub fn remaining_budget(hard_cap: usize, prompt_tokens: usize) -> i64 {
    hard_cap as i64 - prompt_tokens as i64
}
