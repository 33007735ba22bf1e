//! Token vocabulary and the Whisper-specific token identifiers resolved
//! from it.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::{
    EOT_TOKEN, MULTILINGUAL_VOCAB_SIZE, NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, SOT_TOKEN,
    UNK_TOKEN,
};

/// An index <-> string bijection with reserved BOS, EOS and UNK entries.
///
/// The on-disk representation is `vocabulary.txt`: one token per line,
/// UTF-8, ordered by id.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    ids: HashMap<String, u32>,
    bos_id: u32,
    eos_id: u32,
    unk_id: u32,
}

impl Vocabulary {
    pub fn from_tokens(tokens: Vec<String>) -> Result<Self> {
        let mut ids = HashMap::with_capacity(tokens.len());
        for (id, token) in tokens.iter().enumerate() {
            ids.entry(token.clone()).or_insert(id as u32);
        }
        let lookup = |token: &str| {
            ids.get(token)
                .copied()
                .ok_or_else(|| Error::invalid_argument(format!("vocabulary is missing {token}")))
        };
        let bos_id = lookup(SOT_TOKEN)?;
        let eos_id = lookup(EOT_TOKEN)?;
        let unk_id = lookup(UNK_TOKEN)?;
        Ok(Self {
            tokens,
            ids,
            bos_id,
            eos_id,
            unk_id,
        })
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let tokens = reader.lines().collect::<std::io::Result<Vec<_>>>()?;
        Self::from_tokens(tokens)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn unk_id(&self) -> u32 {
        self.unk_id
    }

    /// Looks up a token string, falling back to the UNK id.
    pub fn to_id(&self, token: &str) -> u32 {
        self.ids.get(token).copied().unwrap_or(self.unk_id)
    }

    pub fn to_token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    pub fn to_ids(&self, batch: &[Vec<String>]) -> Vec<Vec<u32>> {
        batch
            .iter()
            .map(|tokens| tokens.iter().map(|t| self.to_id(t)).collect())
            .collect()
    }

    pub fn to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .map(|&id| {
                self.to_token(id)
                    .unwrap_or_else(|| &self.tokens[self.unk_id as usize])
                    .to_string()
            })
            .collect()
    }
}

/// The Whisper special-token identifiers resolved once from a loaded
/// vocabulary, shared read-only across replicas.
#[derive(Debug, Clone)]
pub struct WhisperVocabulary {
    vocabulary: Arc<Vocabulary>,
    sot_id: u32,
    eot_id: u32,
    no_timestamps_id: u32,
    no_speech_id: u32,
    timestamp_begin_id: u32,
    timestamp_end_id: u32,
    multilingual: bool,
}

impl WhisperVocabulary {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        let sot_id = vocabulary.bos_id();
        let eot_id = vocabulary.eos_id();
        let no_timestamps_id = vocabulary.to_id(NO_TIMESTAMPS_TOKEN);
        let mut no_speech_id = vocabulary.to_id(NO_SPEECH_TOKENS[0]);
        if no_speech_id == vocabulary.unk_id() {
            no_speech_id = vocabulary.to_id(NO_SPEECH_TOKENS[1]);
        }
        let timestamp_begin_id = no_timestamps_id + 1;
        let timestamp_end_id = vocabulary.len() as u32 - 1;
        let multilingual = vocabulary.len() == MULTILINGUAL_VOCAB_SIZE;
        Self {
            vocabulary,
            sot_id,
            eot_id,
            no_timestamps_id,
            no_speech_id,
            timestamp_begin_id,
            timestamp_end_id,
            multilingual,
        }
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    pub fn sot_id(&self) -> u32 {
        self.sot_id
    }

    pub fn eot_id(&self) -> u32 {
        self.eot_id
    }

    pub fn no_timestamps_id(&self) -> u32 {
        self.no_timestamps_id
    }

    pub fn no_speech_id(&self) -> u32 {
        self.no_speech_id
    }

    pub fn timestamp_begin_id(&self) -> u32 {
        self.timestamp_begin_id
    }

    pub fn timestamp_end_id(&self) -> u32 {
        self.timestamp_end_id
    }

    pub fn is_multilingual(&self) -> bool {
        self.multilingual
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tokens(no_speech: &str) -> Vec<String> {
        let mut tokens: Vec<String> = (0..10).map(|i| format!("tok{i}")).collect();
        tokens.push(EOT_TOKEN.to_string());
        tokens.push(SOT_TOKEN.to_string());
        tokens.push("<|en|>".to_string());
        tokens.push("<|de|>".to_string());
        tokens.push("<|transcribe|>".to_string());
        tokens.push(no_speech.to_string());
        tokens.push(NO_TIMESTAMPS_TOKEN.to_string());
        for i in 0..15 {
            tokens.push(format!("<|{}.{:02}|>", i / 50, 2 * (i % 50)));
        }
        tokens
    }

    #[test]
    fn special_token_resolution() -> crate::Result<()> {
        let vocab = Arc::new(Vocabulary::from_tokens(small_tokens("<|nospeech|>"))?);
        let whisper = WhisperVocabulary::new(vocab.clone());
        assert_eq!(whisper.sot_id(), 11);
        assert_eq!(whisper.eot_id(), 10);
        assert_eq!(whisper.no_timestamps_id(), 16);
        assert_eq!(whisper.no_speech_id(), 15);
        assert_eq!(whisper.timestamp_begin_id(), 17);
        assert_eq!(whisper.timestamp_end_id(), vocab.len() as u32 - 1);
        assert!(!whisper.is_multilingual());
        Ok(())
    }

    #[test]
    fn no_speech_falls_back_to_nocaptions() -> crate::Result<()> {
        let vocab = Arc::new(Vocabulary::from_tokens(small_tokens("<|nocaptions|>"))?);
        let whisper = WhisperVocabulary::new(vocab);
        assert_eq!(whisper.no_speech_id(), 15);
        Ok(())
    }

    #[test]
    fn unknown_token_maps_to_unk() -> crate::Result<()> {
        let vocab = Vocabulary::from_tokens(small_tokens("<|nospeech|>"))?;
        assert_eq!(vocab.to_id("never-seen"), vocab.unk_id());
        assert_eq!(vocab.to_id("tok3"), 3);
        Ok(())
    }

    #[test]
    fn missing_reserved_token_is_rejected() {
        let tokens = vec!["a".to_string(), "b".to_string()];
        assert!(matches!(
            Vocabulary::from_tokens(tokens),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn roundtrip_ids_and_tokens() -> crate::Result<()> {
        let vocab = Vocabulary::from_tokens(small_tokens("<|nospeech|>"))?;
        let ids = vocab.to_ids(&[vec![SOT_TOKEN.to_string(), "tok4".to_string()]]);
        assert_eq!(ids, vec![vec![11, 4]]);
        assert_eq!(vocab.to_tokens(&[11, 4]), vec![SOT_TOKEN, "tok4"]);
        Ok(())
    }
}
