//! Generic beam-search decoding over a [`Decoder`].
//!
//! The driver consumes this module through [`decode`] and the option and
//! result types; everything else is loop machinery. Each batch item is
//! advanced independently: its beams share one decoder invocation per step
//! but candidate selection, forced-prefix handling and stopping are per
//! batch.

use candle::Tensor;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::layers::{Decoder, DecoderState};
use crate::processors::{log_softmax, sample_begin, DisableTokens, Logits, LogitsProcessor};

const DEFAULT_SAMPLING_SEED: u64 = 299792458;

pub struct DecodingOptions {
    /// Absolute position of the first decoded step (the prefill length).
    pub start_step: usize,
    pub beam_size: usize,
    /// Decoding continues until `beam_size * patience` hypotheses finish.
    pub patience: f32,
    /// Hypothesis scores are divided by `len^length_penalty`.
    pub length_penalty: f32,
    pub repetition_penalty: f32,
    /// 0 disables n-gram blocking.
    pub no_repeat_ngram_size: usize,
    /// Maximum number of output tokens per row, forced prefix included.
    pub max_length: usize,
    /// 1 selects the best candidates deterministically.
    pub sampling_topk: usize,
    pub sampling_temperature: f32,
    pub sampling_seed: u64,
    pub num_hypotheses: usize,
    pub return_scores: bool,
    pub return_attention: bool,
    pub include_eos_in_hypotheses: bool,
    /// Ids masked at every step.
    pub disable_ids: Vec<u32>,
    /// Ids masked at the first sampled step of each row.
    pub disable_ids_begin: Vec<u32>,
    pub logits_processors: Vec<Box<dyn LogitsProcessor>>,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        Self {
            start_step: 0,
            beam_size: 1,
            patience: 1.0,
            length_penalty: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            max_length: 256,
            sampling_topk: 1,
            sampling_temperature: 1.0,
            sampling_seed: DEFAULT_SAMPLING_SEED,
            num_hypotheses: 1,
            return_scores: false,
            return_attention: false,
            include_eos_in_hypotheses: true,
            disable_ids: Vec::new(),
            disable_ids_begin: Vec::new(),
            logits_processors: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DecodingResult {
    pub hypotheses: Vec<Vec<u32>>,
    pub scores: Vec<f32>,
    pub token_scores: Vec<Vec<f32>>,
    pub attention: Vec<Vec<Vec<f32>>>,
}

struct SuppressTokens {
    ids: Vec<u32>,
}

impl LogitsProcessor for SuppressTokens {
    fn apply(
        &mut self,
        _step: usize,
        logits: &mut Logits,
        disable: &mut DisableTokens,
        _sequences: &[Vec<u32>],
        _batch_offset: &[usize],
        _prefix: Option<&[Vec<u32>]>,
    ) -> Result<()> {
        for row in 0..logits.rows() {
            for &id in &self.ids {
                disable.add(row, id);
            }
        }
        Ok(())
    }
}

struct SuppressTokensBegin {
    ids: Vec<u32>,
}

impl LogitsProcessor for SuppressTokensBegin {
    fn apply(
        &mut self,
        step: usize,
        logits: &mut Logits,
        disable: &mut DisableTokens,
        _sequences: &[Vec<u32>],
        batch_offset: &[usize],
        prefix: Option<&[Vec<u32>]>,
    ) -> Result<()> {
        let rows = logits.rows();
        for row in 0..rows {
            if step == sample_begin(rows, row, batch_offset, prefix) {
                for &id in &self.ids {
                    disable.add(row, id);
                }
            }
        }
        Ok(())
    }
}

struct RepetitionPenalty {
    penalty: f32,
}

impl LogitsProcessor for RepetitionPenalty {
    fn apply(
        &mut self,
        _step: usize,
        logits: &mut Logits,
        _disable: &mut DisableTokens,
        sequences: &[Vec<u32>],
        _batch_offset: &[usize],
        _prefix: Option<&[Vec<u32>]>,
    ) -> Result<()> {
        for (row, sequence) in sequences.iter().enumerate() {
            let values = logits.row_mut(row);
            let mut seen = sequence.to_vec();
            seen.sort_unstable();
            seen.dedup();
            for id in seen {
                let logit = values[id as usize];
                values[id as usize] = if logit > 0.0 {
                    logit / self.penalty
                } else {
                    logit * self.penalty
                };
            }
        }
        Ok(())
    }
}

struct NoRepeatNgram {
    size: usize,
}

impl LogitsProcessor for NoRepeatNgram {
    fn apply(
        &mut self,
        _step: usize,
        _logits: &mut Logits,
        disable: &mut DisableTokens,
        sequences: &[Vec<u32>],
        _batch_offset: &[usize],
        _prefix: Option<&[Vec<u32>]>,
    ) -> Result<()> {
        let n = self.size;
        for (row, sequence) in sequences.iter().enumerate() {
            if sequence.len() < n {
                continue;
            }
            let tail = &sequence[sequence.len() - (n - 1)..];
            for start in 0..=sequence.len() - n {
                if &sequence[start..start + n - 1] == tail {
                    disable.add(row, sequence[start + n - 1]);
                }
            }
        }
        Ok(())
    }
}

/// Runs `apply_first` processors first, then the built-in penalties and
/// suppressions, then the remaining processors, each group in installation
/// order.
fn order_processors(
    external: Vec<Box<dyn LogitsProcessor>>,
    internal: Vec<Box<dyn LogitsProcessor>>,
) -> Vec<Box<dyn LogitsProcessor>> {
    let mut chain = Vec::with_capacity(external.len() + internal.len());
    let mut rest = Vec::new();
    for processor in external {
        if processor.apply_first() {
            chain.push(processor);
        } else {
            rest.push(processor);
        }
    }
    chain.extend(internal);
    chain.extend(rest);
    chain
}

#[derive(Debug, Clone, Default)]
struct Beam {
    tokens: Vec<u32>,
    cum_log_prob: f32,
    token_log_probs: Vec<f32>,
    attention: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    score: f32,
    token_log_probs: Vec<f32>,
    attention: Vec<Vec<f32>>,
}

fn normalized_score(cum_log_prob: f32, len: usize, length_penalty: f32) -> f32 {
    cum_log_prob / (len.max(1) as f32).powf(length_penalty)
}

fn finish_beam(beam: &Beam, length_penalty: f32) -> Hypothesis {
    Hypothesis {
        score: normalized_score(beam.cum_log_prob, beam.tokens.len(), length_penalty),
        tokens: beam.tokens.clone(),
        token_log_probs: beam.token_log_probs.clone(),
        attention: beam.attention.clone(),
    }
}

/// Best candidate tokens of one row: deterministic top picks when
/// `sampling_topk` is 1, otherwise temperature-weighted draws from the top
/// `sampling_topk` tokens.
fn pick_candidates(
    log_probs: &[f32],
    count: usize,
    sampling_topk: usize,
    temperature: f32,
    rng: &mut StdRng,
) -> Result<Vec<(u32, f32)>> {
    let mut by_score: Vec<usize> = (0..log_probs.len()).collect();
    by_score.sort_unstable_by(|&a, &b| log_probs[b].total_cmp(&log_probs[a]));

    if sampling_topk <= 1 {
        return Ok(by_score
            .into_iter()
            .take(count)
            .map(|i| (i as u32, log_probs[i]))
            .collect());
    }

    by_score.truncate(sampling_topk.min(log_probs.len()));
    let weights: Vec<f32> = by_score
        .iter()
        .map(|&i| (log_probs[i] / temperature).exp())
        .collect();
    let mut picks: Vec<(u32, f32)> = Vec::with_capacity(count);
    if let Ok(dist) = WeightedIndex::new(&weights) {
        for _ in 0..count * 4 {
            if picks.len() == count {
                break;
            }
            let i = by_score[dist.sample(rng)];
            if !picks.iter().any(|(t, _)| *t == i as u32) {
                picks.push((i as u32, log_probs[i]));
            }
        }
    }
    // Top up deterministically when sampling could not produce enough
    // distinct candidates (fully masked rows included).
    for &i in &by_score {
        if picks.len() == count {
            break;
        }
        if !picks.iter().any(|(t, _)| *t == i as u32) {
            picks.push((i as u32, log_probs[i]));
        }
    }
    Ok(picks)
}

/// Replicates every state tensor from `batch` to `batch * beam_size` rows,
/// keeping the beams of one batch item contiguous.
fn expand_state(state: &mut DecoderState, beam_size: usize) -> Result<()> {
    if beam_size == 1 {
        return Ok(());
    }
    for tensor in state.values_mut() {
        let batch = tensor.dim(0)?;
        let mut rows = Vec::with_capacity(batch * beam_size);
        for i in 0..batch {
            rows.extend(std::iter::repeat(i as u32).take(beam_size));
        }
        let index = Tensor::from_vec(rows, batch * beam_size, tensor.device())?;
        *tensor = tensor.index_select(&index, 0)?;
    }
    Ok(())
}

fn reorder_state(state: &mut DecoderState, parents: &[usize]) -> Result<()> {
    let rows: Vec<u32> = parents.iter().map(|&p| p as u32).collect();
    for tensor in state.values_mut() {
        let index = Tensor::from_vec(rows.clone(), rows.len(), tensor.device())?;
        *tensor = tensor.index_select(&index, 0)?;
    }
    Ok(())
}

/// Decodes one batch of start token rows into ranked hypotheses.
///
/// The first token of each row is the initial decoder input; the remaining
/// tokens are forced outputs. Results preserve the batch order.
pub fn decode(
    decoder: &mut dyn Decoder,
    mut state: DecoderState,
    start_tokens: &[Vec<u32>],
    eot_id: u32,
    mut options: DecodingOptions,
) -> Result<Vec<DecodingResult>> {
    let batch_size = start_tokens.len();
    if batch_size == 0 {
        return Ok(Vec::new());
    }
    if start_tokens.iter().any(Vec::is_empty) {
        return Err(Error::invalid_argument(
            "each batch requires at least one start token",
        ));
    }

    let beam_size = options.beam_size.max(1);
    let rows = batch_size * beam_size;
    let prefix: Vec<Vec<u32>> = start_tokens.iter().map(|t| t[1..].to_vec()).collect();
    let prefix_arg: Option<&[Vec<u32>]> = if prefix.iter().any(|p| !p.is_empty()) {
        Some(prefix.as_slice())
    } else {
        None
    };

    expand_state(&mut state, beam_size)?;
    let batch_offset: Vec<usize> = (0..batch_size).collect();

    let mut chain = {
        let external = std::mem::take(&mut options.logits_processors);
        let mut internal: Vec<Box<dyn LogitsProcessor>> = Vec::new();
        if options.repetition_penalty != 1.0 {
            internal.push(Box::new(RepetitionPenalty {
                penalty: options.repetition_penalty,
            }));
        }
        if options.no_repeat_ngram_size > 0 {
            internal.push(Box::new(NoRepeatNgram {
                size: options.no_repeat_ngram_size,
            }));
        }
        if !options.disable_ids.is_empty() {
            internal.push(Box::new(SuppressTokens {
                ids: options.disable_ids.clone(),
            }));
        }
        if !options.disable_ids_begin.is_empty() {
            internal.push(Box::new(SuppressTokensBegin {
                ids: options.disable_ids_begin.clone(),
            }));
        }
        order_processors(external, internal)
    };

    let mut rng = StdRng::seed_from_u64(options.sampling_seed);
    let allowed_hypotheses = ((beam_size as f32) * options.patience).round().max(1.0) as usize;
    let device = decoder.device().clone();

    let mut beams: Vec<Beam> = vec![Beam::default(); rows];
    let mut finished: Vec<Vec<Hypothesis>> = vec![Vec::new(); batch_size];
    let mut done = vec![false; batch_size];

    let mut step = 0;
    while step < options.max_length && done.iter().any(|d| !d) {
        let inputs: Vec<u32> = beams
            .iter()
            .enumerate()
            .map(|(row, beam)| {
                if step == 0 {
                    start_tokens[row / beam_size][0]
                } else {
                    *beam.tokens.last().unwrap_or(&eot_id)
                }
            })
            .collect();
        let input_ids = Tensor::from_vec(inputs, rows, &device)?;
        let output = decoder.forward_step(
            options.start_step + step,
            &input_ids,
            &mut state,
            options.return_attention,
        )?;
        let mut logits = Logits::from_tensor(&output.logits)?;
        let attention_rows = match output.attention {
            Some(attention) if options.return_attention => {
                Some(attention.to_dtype(candle::DType::F32)?.to_vec2::<f32>()?)
            }
            _ => None,
        };

        let sequences: Vec<Vec<u32>> = beams.iter().map(|b| b.tokens.clone()).collect();
        let mut disable = DisableTokens::default();
        for processor in chain.iter_mut() {
            processor.apply(
                step,
                &mut logits,
                &mut disable,
                &sequences,
                &batch_offset,
                prefix_arg,
            )?;
        }
        disable.apply(&mut logits);

        let mut parents: Vec<usize> = (0..rows).collect();
        let mut reordered = false;

        for i in 0..batch_size {
            if done[i] {
                continue;
            }
            let base = i * beam_size;

            if step < prefix[i].len() {
                // Forced output, identical across the beams of this item.
                let token = prefix[i][step];
                for row in base..base + beam_size {
                    let log_prob = if options.return_scores {
                        log_softmax(logits.row(row))[token as usize]
                    } else {
                        0.0
                    };
                    let beam = &mut beams[row];
                    beam.tokens.push(token);
                    beam.cum_log_prob += log_prob;
                    if options.return_scores {
                        beam.token_log_probs.push(log_prob);
                    }
                    if let Some(attention) = &attention_rows {
                        beam.attention.push(attention[row].clone());
                    }
                }
                continue;
            }

            // All beams are still identical at the first sampled step; only
            // the first row proposes candidates then.
            let sources: Vec<usize> = if step == prefix[i].len() {
                vec![base]
            } else {
                (base..base + beam_size).collect()
            };
            let mut candidates: Vec<(f32, usize, u32, f32)> = Vec::new();
            for row in sources {
                let log_probs = log_softmax(logits.row(row));
                for (token, log_prob) in pick_candidates(
                    &log_probs,
                    beam_size,
                    options.sampling_topk,
                    options.sampling_temperature,
                    &mut rng,
                )? {
                    candidates.push((
                        beams[row].cum_log_prob + log_prob,
                        row,
                        token,
                        log_prob,
                    ));
                }
            }
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

            let mut next: Vec<(usize, u32, f32)> = Vec::new();
            for (total, row, token, log_prob) in candidates {
                if token == eot_id {
                    if finished[i].len() < allowed_hypotheses {
                        let mut hypothesis = finish_beam(&beams[row], options.length_penalty);
                        if options.include_eos_in_hypotheses {
                            hypothesis.tokens.push(eot_id);
                            if options.return_scores {
                                hypothesis.token_log_probs.push(log_prob);
                            }
                            hypothesis.score = normalized_score(
                                total,
                                hypothesis.tokens.len(),
                                options.length_penalty,
                            );
                        }
                        finished[i].push(hypothesis);
                    }
                } else if next.len() < beam_size {
                    next.push((row, token, log_prob));
                }
            }

            if finished[i].len() >= allowed_hypotheses || next.is_empty() {
                done[i] = true;
                continue;
            }
            while next.len() < beam_size {
                // Tiny vocabularies can run out of distinct continuations.
                next.push(next[next.len() - 1]);
            }

            let advanced: Vec<Beam> = next
                .iter()
                .map(|&(row, token, log_prob)| {
                    let mut beam = beams[row].clone();
                    beam.tokens.push(token);
                    beam.cum_log_prob += log_prob;
                    if options.return_scores {
                        beam.token_log_probs.push(log_prob);
                    }
                    if let Some(attention) = &attention_rows {
                        beam.attention.push(attention[row].clone());
                    }
                    beam
                })
                .collect();
            for (b, beam) in advanced.into_iter().enumerate() {
                let row = base + b;
                if parents[row] != next[b].0 {
                    parents[row] = next[b].0;
                    reordered = true;
                }
                beams[row] = beam;
            }
        }

        if reordered {
            reorder_state(&mut state, &parents)?;
        }
        step += 1;
    }

    tracing::debug!(steps = step, "decoding finished");

    let mut results = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let mut hypotheses = std::mem::take(&mut finished[i]);
        if hypotheses.len() < options.num_hypotheses {
            // Ran out of budget before enough beams finished.
            let base = i * beam_size;
            let mut rows: Vec<usize> = (base..base + beam_size).collect();
            rows.sort_by(|&a, &b| beams[b].cum_log_prob.total_cmp(&beams[a].cum_log_prob));
            for row in rows {
                if hypotheses.len() >= options.num_hypotheses {
                    break;
                }
                if !beams[row].tokens.is_empty() {
                    hypotheses.push(finish_beam(&beams[row], options.length_penalty));
                }
            }
        }
        hypotheses.sort_by(|a, b| b.score.total_cmp(&a.score));
        hypotheses.truncate(options.num_hypotheses);

        let mut result = DecodingResult::default();
        for hypothesis in hypotheses {
            result.hypotheses.push(hypothesis.tokens);
            if options.return_scores {
                result.scores.push(hypothesis.score);
                result.token_scores.push(hypothesis.token_log_probs);
            }
            if options.return_attention {
                result.attention.push(hypothesis.attention);
            }
        }
        results.push(result);
    }
    Ok(results)
}
