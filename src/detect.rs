//! Language identification from encoder output.

use candle::{DType, Device, Tensor, D};

use crate::error::Result;
use crate::layers::{Decoder, DecoderState, MEMORY};
use crate::vocabulary::Vocabulary;

/// Runs a single decoder step on the start-of-transcript token and ranks
/// the configured language tokens by probability, best first, one list per
/// batch item.
pub fn language_probs(
    decoder: &mut dyn Decoder,
    memory: Tensor,
    vocabulary: &Vocabulary,
    lang_ids: &[u32],
    sot_id: u32,
) -> Result<Vec<Vec<(String, f32)>>> {
    let batch_size = memory.dim(0)?;
    if lang_ids.is_empty() {
        return Ok(vec![Vec::new(); batch_size]);
    }

    let device = decoder.device().clone();
    let mut state: DecoderState = decoder.initial_state();
    state.insert(MEMORY.to_string(), memory);

    let start_ids = Tensor::full(sot_id, batch_size, &device)?;
    let output = decoder.forward_step(0, &start_ids, &mut state, false)?;

    let score_ids = Tensor::new(lang_ids, &device)?;
    let lang_logits = output.logits.index_select(&score_ids, 1)?;
    let probs = candle_nn::ops::softmax(&lang_logits, D::Minus1)?
        .to_dtype(DType::F32)?
        .to_device(&Device::Cpu)?
        .to_vec2::<f32>()?;

    let mut results = Vec::with_capacity(batch_size);
    for row in probs {
        let mut ranked: Vec<(String, f32)> = lang_ids
            .iter()
            .zip(row)
            .map(|(&id, prob)| {
                let token = vocabulary.to_token(id).unwrap_or_default().to_string();
                (token, prob)
            })
            .collect();
        ranked.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
        results.push(ranked);
    }
    Ok(results)
}
