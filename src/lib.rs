//! Inference driver for Whisper-style speech recognition models.
//!
//! The crate orchestrates encoder/decoder execution to turn precomputed
//! log-mel features into token sequences, and ranks language identities
//! from the same features. The transformer networks themselves are
//! supplied by the embedding application through the [`layers::Encoder`]
//! and [`layers::Decoder`] traits; the driver owns prompt analysis, the
//! timestamp rules applied during sampling, no-speech probability
//! extraction, language detection and the replica-pool service.

pub mod config;
pub mod decoding;
pub mod detect;
pub mod driver;
pub mod error;
pub mod layers;
pub mod model;
pub mod processors;
pub mod prompt;
pub mod service;
pub mod vocabulary;

pub use config::ModelConfig;
pub use driver::{WhisperDriver, WhisperGenerationResult, WhisperOptions};
pub use error::{Error, Result};
pub use model::{create_model, register_model, Model, WhisperModel};
pub use service::WhisperService;
pub use vocabulary::{Vocabulary, WhisperVocabulary};

// Input feature geometry.
pub const N_MELS: usize = 80;
pub const N_FRAMES: usize = 3000;

// Tokenizer dependent bits.
pub const SOT_TOKEN: &str = "<|startoftranscript|>";
pub const EOT_TOKEN: &str = "<|endoftext|>";
pub const UNK_TOKEN: &str = "<|endoftext|>";
pub const NO_TIMESTAMPS_TOKEN: &str = "<|notimestamps|>";
pub const NO_SPEECH_TOKENS: [&str; 2] = ["<|nospeech|>", "<|nocaptions|>"];

/// Vocabulary size of the multilingual checkpoints; English-only models
/// ship a smaller vocabulary.
pub const MULTILINGUAL_VOCAB_SIZE: usize = 51865;

/// Name under which the driver registers itself in the model registry.
pub const SPEC_NAME: &str = "WhisperSpec";
/// Revision of the on-disk model representation.
pub const SPEC_REVISION: u32 = 3;
