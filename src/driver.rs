//! The request-level orchestrator: encode, prefill, decode, post-process.

use std::sync::{Arc, Mutex};

use candle::Tensor;

use crate::decoding::{self, DecodingOptions};
use crate::detect;
use crate::error::{Error, Result};
use crate::layers::{make_sequence_inputs, Decoder, Encoder, MEMORY};
use crate::model::{Model, WhisperModel};
use crate::processors::{no_speech_probs_from_logits, NoSpeechProbs, TimestampRules};
use crate::prompt;

/// Generation options. The defaults match the public surface of the
/// original OpenAI release.
#[derive(Debug, Clone)]
pub struct WhisperOptions {
    /// Beam width; 1 for greedy search.
    pub beam_size: usize,
    /// Decoding continues until `beam_size * patience` hypotheses finish.
    pub patience: f32,
    /// Exponential length normalization applied to hypothesis scores.
    pub length_penalty: f32,
    /// Penalty applied to the score of previously generated tokens.
    pub repetition_penalty: f32,
    /// Prevents repetitions of n-grams of this size (0 disables).
    pub no_repeat_ngram_size: usize,
    /// Total length cap, prompt prefill included.
    pub max_length: usize,
    /// Randomly sample from the top K candidates (1 disables sampling).
    pub sampling_topk: usize,
    pub sampling_temperature: f32,
    pub num_hypotheses: usize,
    pub return_scores: bool,
    pub return_attention: bool,
    pub return_no_speech_prob: bool,
    /// Maximum index of the first predicted timestamp.
    pub max_initial_timestamp_index: u32,
    /// Suppress blank outputs at the beginning of the sampling.
    pub suppress_blank: bool,
    /// Ids to forbid throughout; `-1` expands to the model's default
    /// suppression set.
    pub suppress_tokens: Vec<i32>,
}

impl Default for WhisperOptions {
    fn default() -> Self {
        Self {
            beam_size: 5,
            patience: 1.0,
            length_penalty: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            max_length: 448,
            sampling_topk: 1,
            sampling_temperature: 1.0,
            num_hypotheses: 1,
            return_scores: false,
            return_attention: false,
            return_no_speech_prob: false,
            max_initial_timestamp_index: 50,
            suppress_blank: true,
            suppress_tokens: vec![-1],
        }
    }
}

/// Generation output for one batch item.
#[derive(Debug, Clone, Default)]
pub struct WhisperGenerationResult {
    /// Token strings of each hypothesis.
    pub sequences: Vec<Vec<String>>,
    /// Token ids of each hypothesis.
    pub sequences_ids: Vec<Vec<u32>>,
    /// Hypothesis scores, empty unless `return_scores`.
    pub scores: Vec<f32>,
    /// Per-token scores of each hypothesis, empty unless `return_scores`.
    pub token_scores: Vec<Vec<f32>>,
    /// Cross-attention per hypothesis and token, empty unless
    /// `return_attention`.
    pub attention: Vec<Vec<Vec<f32>>>,
    /// Probability of the no-speech token, present when
    /// `return_no_speech_prob` was set.
    pub no_speech_prob: Option<f32>,
}

/// One replica of the model: owns the layer implementations and serves one
/// request at a time.
pub struct WhisperDriver {
    model: Arc<WhisperModel>,
    encoder: Box<dyn Encoder>,
    decoder: Box<dyn Decoder>,
    generate_span: tracing::Span,
    detect_span: tracing::Span,
}

impl WhisperDriver {
    pub fn new(
        model: Arc<WhisperModel>,
        encoder: Box<dyn Encoder>,
        decoder: Box<dyn Decoder>,
    ) -> Self {
        Self {
            model,
            encoder,
            decoder,
            generate_span: tracing::span!(tracing::Level::TRACE, "whisper-generate"),
            detect_span: tracing::span!(tracing::Level::TRACE, "whisper-detect-language"),
        }
    }

    /// Builds a driver from a registry-created model, failing when the
    /// model is not a Whisper model.
    pub fn create_from_model(
        model: &Arc<dyn Model>,
        encoder: Box<dyn Encoder>,
        decoder: Box<dyn Decoder>,
    ) -> Result<Self> {
        let whisper = model
            .as_any()
            .downcast_ref::<WhisperModel>()
            .ok_or_else(|| Error::invalid_argument("the model is not a Whisper model"))?;
        Ok(Self::new(Arc::new(whisper.clone()), encoder, decoder))
    }

    pub fn model(&self) -> &Arc<WhisperModel> {
        &self.model
    }

    pub fn is_multilingual(&self) -> bool {
        self.model.is_multilingual()
    }

    /// Moves the features to the encoder's device and dtype if needed and
    /// runs the encoder. The output stays on device.
    pub fn encode(&self, features: &Tensor) -> Result<Tensor> {
        let device = self.encoder.device();
        let dtype = self.encoder.output_dtype();
        if features.device().same_device(device) && features.dtype() == dtype {
            self.encoder.forward(features)
        } else {
            self.encoder
                .forward(&features.to_device(device)?.to_dtype(dtype)?)
        }
    }

    /// Resolves token-string prompts through the vocabulary and generates.
    pub fn generate_from_tokens(
        &mut self,
        features: &Tensor,
        prompts: &[Vec<String>],
        options: &WhisperOptions,
    ) -> Result<Vec<WhisperGenerationResult>> {
        let prompts = self.model.vocabulary().to_ids(prompts);
        self.generate(features, &prompts, options)
    }

    pub fn generate(
        &mut self,
        features: &Tensor,
        prompts: &[Vec<u32>],
        options: &WhisperOptions,
    ) -> Result<Vec<WhisperGenerationResult>> {
        let _enter = self.generate_span.enter();
        if prompts.is_empty() {
            return Ok(Vec::new());
        }

        let special = self.model.whisper_vocabulary().clone();
        let shape = prompt::analyze(prompts, special.sot_id(), special.no_timestamps_id())?;
        let sot_is_start_token = shape.sot_index == shape.prompt_length - 1;

        let mut state = self.decoder.initial_state();
        state.insert(MEMORY.to_string(), self.encode(features)?);
        self.decoder
            .update_output_layer(self.model.preferred_size_multiple())?;

        let start_tokens: Vec<Vec<u32>>;
        let mut no_speech_probs: Vec<f32> = Vec::new();
        let mut start_step = 0;

        if shape.prompt_length == 1 {
            start_tokens = prompts.to_vec();
        } else {
            let split = shape.prompt_length - 1;
            let prompt_tokens: Vec<Vec<u32>> =
                prompts.iter().map(|p| p[..split].to_vec()).collect();
            start_tokens = prompts.iter().map(|p| p[split..].to_vec()).collect();

            let inputs = make_sequence_inputs(&prompt_tokens, self.decoder.device())?;
            if !options.return_no_speech_prob || sot_is_start_token {
                self.decoder.forward_prompt(&inputs, &mut state, false)?;
            } else {
                // The probability of the no-speech token is read at the
                // start-of-transcript step of the prefill.
                let hidden = self
                    .decoder
                    .forward_prompt(&inputs, &mut state, true)?
                    .ok_or_else(|| {
                        Error::runtime("the decoder did not return hidden states for the prompt")
                    })?;
                let columns = Tensor::full(
                    shape.sot_index as u32,
                    inputs.dim(0)?,
                    self.decoder.device(),
                )?;
                let logits = self.decoder.compute_logits_for_steps(&hidden, &columns)?;
                no_speech_probs = no_speech_probs_from_logits(&logits, special.no_speech_id())?;
            }
            start_step = inputs.dim(1)?;
        }
        tracing::debug!(
            start_step,
            sot_is_start_token,
            batch_size = prompts.len(),
            "prompt prefill done"
        );

        let total_max_length = options.max_length;
        let mut decoding = DecodingOptions {
            start_step,
            beam_size: options.beam_size,
            patience: options.patience,
            length_penalty: options.length_penalty,
            repetition_penalty: options.repetition_penalty,
            no_repeat_ngram_size: options.no_repeat_ngram_size,
            max_length: usize::min(
                total_max_length / 2,
                total_max_length.saturating_sub(start_step),
            ),
            sampling_topk: options.sampling_topk,
            sampling_temperature: options.sampling_temperature,
            num_hypotheses: options.num_hypotheses,
            return_scores: options.return_scores,
            return_attention: options.return_attention,
            include_eos_in_hypotheses: false,
            ..DecodingOptions::default()
        };

        for &id in &options.suppress_tokens {
            if id >= 0 {
                decoding.disable_ids.push(id as u32);
            } else if id == -1 {
                decoding
                    .disable_ids
                    .extend_from_slice(&self.model.config().suppress_ids);
            }
        }
        if options.suppress_blank {
            decoding
                .disable_ids_begin
                .extend_from_slice(&self.model.config().suppress_ids_begin);
        }

        let mut no_speech_handle: Option<Arc<Mutex<Vec<f32>>>> = None;
        if options.return_no_speech_prob && sot_is_start_token {
            // With the start-of-transcript token feeding the decoding loop,
            // the probability is captured in the first decoding step.
            let processor = NoSpeechProbs::new(special.no_speech_id());
            no_speech_handle = Some(processor.probs());
            decoding.logits_processors.push(Box::new(processor));
        }
        if prompts[0][shape.prompt_length - 1] != special.no_timestamps_id() {
            decoding.logits_processors.push(Box::new(TimestampRules::new(
                special.eot_id(),
                special.no_timestamps_id(),
                special.timestamp_begin_id(),
                special.timestamp_end_id(),
                special.timestamp_begin_id() + options.max_initial_timestamp_index,
            )));
        }

        let results = decoding::decode(
            self.decoder.as_mut(),
            state,
            &start_tokens,
            special.eot_id(),
            decoding,
        )?;

        if let Some(handle) = no_speech_handle {
            no_speech_probs = handle.lock().unwrap().clone();
        }

        let vocabulary = special.vocabulary();
        let mut final_results = Vec::with_capacity(results.len());
        for (i, result) in results.into_iter().enumerate() {
            final_results.push(WhisperGenerationResult {
                sequences: result
                    .hypotheses
                    .iter()
                    .map(|ids| vocabulary.to_tokens(ids))
                    .collect(),
                sequences_ids: result.hypotheses,
                scores: result.scores,
                token_scores: result.token_scores,
                attention: result.attention,
                no_speech_prob: if options.return_no_speech_prob {
                    no_speech_probs.get(i).copied()
                } else {
                    None
                },
            });
        }
        Ok(final_results)
    }

    /// Ranks the configured languages by probability for each batch item.
    pub fn detect_language(&mut self, features: &Tensor) -> Result<Vec<Vec<(String, f32)>>> {
        let _enter = self.detect_span.enter();
        if !self.is_multilingual() {
            return Err(Error::runtime(
                "detect_language can only be called on multilingual models",
            ));
        }
        let memory = self.encode(features)?;
        let special = self.model.whisper_vocabulary();
        detect::language_probs(
            self.decoder.as_mut(),
            memory,
            special.vocabulary(),
            &self.model.config().lang_ids,
            special.sot_id(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_the_reference_surface() {
        let options = WhisperOptions::default();
        assert_eq!(options.beam_size, 5);
        assert_eq!(options.max_length, 448);
        assert_eq!(options.max_initial_timestamp_index, 50);
        assert_eq!(options.suppress_tokens, [-1]);
        assert!(options.suppress_blank);
        assert!(!options.return_no_speech_prob);
    }
}
