//! Prompt validation and the prefill/generation split point.
//!
//! A well-formed prompt is optional context tokens, one start-of-transcript
//! token, then task control tokens whose ids sit in the contiguous range
//! `[sot_id, no_timestamps_id]`. Generation starts at the first token after
//! that range.

use crate::error::{Error, Result};

/// Indices common to every prompt of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptShape {
    /// Position of the start-of-transcript token.
    pub sot_index: usize,
    /// Smallest index at or after `sot_index` holding a token outside the
    /// task control range, or the prompt length.
    pub prompt_length: usize,
}

fn sot_index(prompt: &[u32], sot_id: u32) -> Result<usize> {
    prompt.iter().position(|&t| t == sot_id).ok_or_else(|| {
        Error::invalid_argument("the <|startoftranscript|> token was not found in the prompt")
    })
}

fn prompt_length(prompt: &[u32], sot_index: usize, sot_id: u32, no_timestamps_id: u32) -> usize {
    let mut index = sot_index;
    while index < prompt.len() && prompt[index] >= sot_id && prompt[index] <= no_timestamps_id {
        index += 1;
    }
    index
}

/// Validates a batch of prompts and returns their common shape.
///
/// Fails when any prompt lacks the start-of-transcript token or when two
/// prompts disagree on the start-of-transcript position or on the number of
/// task control tokens. The text suffix after the control tokens may differ
/// freely between prompts.
pub fn analyze(prompts: &[Vec<u32>], sot_id: u32, no_timestamps_id: u32) -> Result<PromptShape> {
    let mut shape = None;
    for prompt in prompts {
        let batch_sot_index = sot_index(prompt, sot_id)?;
        let batch_prompt_length = prompt_length(prompt, batch_sot_index, sot_id, no_timestamps_id);
        match shape {
            None => {
                shape = Some(PromptShape {
                    sot_index: batch_sot_index,
                    prompt_length: batch_prompt_length,
                })
            }
            Some(shape) if batch_sot_index != shape.sot_index => {
                return Err(Error::invalid_argument(
                    "generation requires the <|startoftranscript|> token to be at the same \
                     position in all batches; adapt the number of previous text tokens in \
                     each batch to work around this limitation",
                ));
            }
            Some(shape) if batch_prompt_length != shape.prompt_length => {
                return Err(Error::invalid_argument(
                    "generation requires each batch to have the same number of task tokens \
                     after <|startoftranscript|>",
                ));
            }
            Some(_) => {}
        }
    }
    shape.ok_or_else(|| Error::invalid_argument("the prompt batch is empty"))
}
