//! Contracts of the transformer layers consumed by the driver.
//!
//! The encoder/decoder networks are supplied by the embedding application;
//! the driver only relies on the interfaces below. Decoder cache tensors
//! live in a [`DecoderState`] owned by the driver for the duration of one
//! request, keyed by layer identifier plus the `"memory"` sentinel holding
//! the encoder output.

use std::collections::HashMap;

use candle::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Sentinel state key holding the encoder output.
pub const MEMORY: &str = "memory";

pub type DecoderState = HashMap<String, Tensor>;

/// Output of one autoregressive decoder step.
pub struct StepOutput {
    /// Logits over the vocabulary, shape `[rows, vocab]`.
    pub logits: Tensor,
    /// Cross-attention weights for this step, shape `[rows, frames]`,
    /// present when requested.
    pub attention: Option<Tensor>,
}

pub trait Encoder: Send {
    fn device(&self) -> &Device;
    fn output_dtype(&self) -> DType;
    /// Runs the encoder over features of shape `[batch, mels, frames]`
    /// already placed on `device` with `output_dtype`.
    fn forward(&self, features: &Tensor) -> Result<Tensor>;
}

pub trait Decoder: Send {
    fn device(&self) -> &Device;
    fn output_dtype(&self) -> DType;

    fn initial_state(&self) -> DecoderState;

    /// Single batched pass over a prompt prefix of shape `[batch, len]`,
    /// populating the state cache. Returns the hidden states
    /// `[batch, len, hidden]` when `want_hidden` is set.
    fn forward_prompt(
        &mut self,
        tokens: &Tensor,
        state: &mut DecoderState,
        want_hidden: bool,
    ) -> Result<Option<Tensor>>;

    /// Projects hidden states to logits at one column per row: `columns`
    /// has shape `[batch]` and the result `[batch, vocab]`.
    fn compute_logits_for_steps(&self, hidden: &Tensor, columns: &Tensor) -> Result<Tensor>;

    /// One decoding step over all beam rows; `input_ids` has shape `[rows]`.
    fn forward_step(
        &mut self,
        step: usize,
        input_ids: &Tensor,
        state: &mut DecoderState,
        want_attention: bool,
    ) -> Result<StepOutput>;

    /// Lets the decoder pad its output layer to a size multiple preferred
    /// by the compute backend.
    fn update_output_layer(&mut self, _size_multiple: usize) -> Result<()> {
        Ok(())
    }
}

/// Packs equal-length token rows into a `[batch, len]` tensor.
pub fn make_sequence_inputs(sequences: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let batch = sequences.len();
    let len = sequences.first().map_or(0, Vec::len);
    if sequences.iter().any(|s| s.len() != len) {
        return Err(Error::invalid_argument(
            "sequence rows must all have the same length",
        ));
    }
    let mut flat = Vec::with_capacity(batch * len);
    for sequence in sequences {
        flat.extend_from_slice(sequence);
    }
    Ok(Tensor::from_vec(flat, (batch, len), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_inputs_pack_rows() -> Result<()> {
        let t = make_sequence_inputs(&[vec![1, 2, 3], vec![4, 5, 6]], &Device::Cpu)?;
        assert_eq!(t.dims(), [2, 3]);
        assert_eq!(t.to_vec2::<u32>()?, [[1, 2, 3], [4, 5, 6]]);
        Ok(())
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = make_sequence_inputs(&[vec![1], vec![2, 3]], &Device::Cpu);
        assert!(matches!(err, Err(Error::InvalidArgument(_))));
    }
}
