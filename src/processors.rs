//! Logits processors run inside the decoding loop.
//!
//! Each step the beam decoder materializes the decoder logits as a host
//! matrix, lets the processor chain inspect and mask them, then samples.
//! Masking goes through [`DisableTokens`], an accumulator of `(row, id)`
//! pairs flushed as `-inf` writes; processors that need the masked
//! distribution (the timestamp mass check) flush it themselves.

use std::sync::{Arc, Mutex};

use candle::{Tensor, D};

use crate::error::Result;

/// Decoder logits for one step, one row per beam, on the host in `f32`.
pub struct Logits {
    data: Vec<f32>,
    vocab_size: usize,
}

impl Logits {
    pub fn new(data: Vec<f32>, vocab_size: usize) -> Self {
        debug_assert!(vocab_size > 0 && data.len() % vocab_size == 0);
        Self { data, vocab_size }
    }

    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (_, vocab_size) = tensor.dims2()?;
        let data = tensor
            .to_dtype(candle::DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self::new(data, vocab_size))
    }

    pub fn rows(&self) -> usize {
        self.data.len() / self.vocab_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.vocab_size..(row + 1) * self.vocab_size]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [f32] {
        &mut self.data[row * self.vocab_size..(row + 1) * self.vocab_size]
    }
}

/// Per-step accumulator of forbidden token ids.
#[derive(Default)]
pub struct DisableTokens {
    pending: Vec<(usize, u32)>,
}

impl DisableTokens {
    pub fn add(&mut self, row: usize, id: u32) {
        self.pending.push((row, id));
    }

    /// Writes the pending ids as `-inf` into the logits and clears the
    /// accumulator.
    pub fn apply(&mut self, logits: &mut Logits) {
        for (row, id) in self.pending.drain(..) {
            logits.row_mut(row)[id as usize] = f32::NEG_INFINITY;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A transform applied to the logits before each sampling step.
pub trait LogitsProcessor: Send {
    /// Processors returning true run before all others, in installation
    /// order, ahead of any masking.
    fn apply_first(&self) -> bool {
        false
    }

    /// `sequences` holds the output tokens of each beam row so far (the
    /// forced prefix included), `batch_offset` maps the current batch to
    /// the original batch, and `prefix` holds the forced start tokens per
    /// original batch item.
    fn apply(
        &mut self,
        step: usize,
        logits: &mut Logits,
        disable: &mut DisableTokens,
        sequences: &[Vec<u32>],
        batch_offset: &[usize],
        prefix: Option<&[Vec<u32>]>,
    ) -> Result<()>;
}

/// Index at which sampled output starts for a beam row: the length of the
/// forced prefix of its batch item.
pub fn sample_begin(
    rows: usize,
    row: usize,
    batch_offset: &[usize],
    prefix: Option<&[Vec<u32>]>,
) -> usize {
    match prefix {
        None => 0,
        Some(prefix) => {
            let beams = rows / batch_offset.len();
            prefix[batch_offset[row / beams]].len()
        }
    }
}

pub(crate) fn softmax(xs: &[f32]) -> Vec<f32> {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = xs.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

pub(crate) fn logsumexp(xs: &[f32]) -> f32 {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f32>().ln()
}

pub(crate) fn log_softmax(xs: &[f32]) -> Vec<f32> {
    let lse = logsumexp(xs);
    xs.iter().map(|x| x - lse).collect()
}

/// Softmax probability of the no-speech token for each row of a standalone
/// logits tensor of shape `[rows, vocab]`, downcast to `f32` on the host.
pub fn no_speech_probs_from_logits(logits: &Tensor, no_speech_id: u32) -> Result<Vec<f32>> {
    let probs = candle_nn::ops::softmax(logits, D::Minus1)?;
    let rows = probs.dim(0)?;
    let ids = Tensor::full(no_speech_id, (rows, 1), probs.device())?;
    let probs = probs
        .gather(&ids, 1)?
        .squeeze(1)?
        .to_dtype(candle::DType::F32)?;
    Ok(probs.to_vec1()?)
}

/// Captures the no-speech probability during the first decoding step, used
/// when the start-of-transcript token is the first token fed to the
/// decoding loop. Never modifies the logits.
pub struct NoSpeechProbs {
    no_speech_id: u32,
    probs: Arc<Mutex<Vec<f32>>>,
}

impl NoSpeechProbs {
    pub fn new(no_speech_id: u32) -> Self {
        Self {
            no_speech_id,
            probs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle the driver keeps to read the captured vector once decoding
    /// returns. One processor instance serves one request, so the lock is
    /// never contended.
    pub fn probs(&self) -> Arc<Mutex<Vec<f32>>> {
        self.probs.clone()
    }
}

impl LogitsProcessor for NoSpeechProbs {
    fn apply_first(&self) -> bool {
        true
    }

    fn apply(
        &mut self,
        step: usize,
        logits: &mut Logits,
        _disable: &mut DisableTokens,
        _sequences: &[Vec<u32>],
        batch_offset: &[usize],
        _prefix: Option<&[Vec<u32>]>,
    ) -> Result<()> {
        if step != 0 {
            return Ok(());
        }
        let batch_size = batch_offset.len();
        let beam_size = logits.rows() / batch_size;
        let mut probs = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            let row = softmax(logits.row(i * beam_size));
            probs.push(row[self.no_speech_id as usize]);
        }
        *self.probs.lock().unwrap() = probs;
        Ok(())
    }
}

/// Enforces the structural rules on timestamp tokens during sampling:
/// timestamps open and close in pairs, never decrease, the first sampled
/// token is a timestamp bounded by the initial-timestamp cap, and when the
/// probability mass over timestamps outweighs the best text token the next
/// token must be a timestamp.
pub struct TimestampRules {
    eot_id: u32,
    no_timestamps_id: u32,
    timestamp_begin_id: u32,
    timestamp_end_id: u32,
    max_initial_timestamp_id: u32,
}

impl TimestampRules {
    pub fn new(
        eot_id: u32,
        no_timestamps_id: u32,
        timestamp_begin_id: u32,
        timestamp_end_id: u32,
        max_initial_timestamp_id: u32,
    ) -> Self {
        Self {
            eot_id,
            no_timestamps_id,
            timestamp_begin_id,
            timestamp_end_id,
            max_initial_timestamp_id: max_initial_timestamp_id.min(timestamp_end_id),
        }
    }

    fn prefers_timestamp(&self, log_probs: &[f32]) -> bool {
        let begin = self.timestamp_begin_id as usize;
        let end = self.timestamp_end_id as usize;
        let max_text_log_prob = log_probs[..begin]
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        let timestamp_log_prob = logsumexp(&log_probs[begin..=end]);
        timestamp_log_prob > max_text_log_prob
    }
}

impl LogitsProcessor for TimestampRules {
    fn apply(
        &mut self,
        step: usize,
        logits: &mut Logits,
        disable: &mut DisableTokens,
        sequences: &[Vec<u32>],
        batch_offset: &[usize],
        prefix: Option<&[Vec<u32>]>,
    ) -> Result<()> {
        let rows = logits.rows();
        let mut check_timestamp_prob = Vec::new();

        for row in 0..rows {
            let begin = sample_begin(rows, row, batch_offset, prefix);
            let sequence = &sequences[row];
            if sequence.len() < step {
                // Row no longer advancing.
                continue;
            }

            disable.add(row, self.no_timestamps_id);

            if step == begin {
                // The first sampled token has to be a timestamp, bounded by
                // the initial-timestamp cap.
                for id in 0..self.timestamp_begin_id {
                    disable.add(row, id);
                }
                for id in self.max_initial_timestamp_id + 1..=self.timestamp_end_id {
                    disable.add(row, id);
                }
            } else if step > begin {
                // Timestamps have to appear in pairs, except directly
                // before the end of transcription.
                let last = sequence[step - 1];
                if last >= self.timestamp_begin_id {
                    let penultimate = if step - 1 > begin {
                        sequence[step - 2]
                    } else {
                        last
                    };
                    if penultimate >= self.timestamp_begin_id {
                        // A pair just closed: next has to be non-timestamp.
                        for id in self.timestamp_begin_id..=self.timestamp_end_id {
                            disable.add(row, id);
                        }
                    } else {
                        // Inside an open pair: next cannot be plain text.
                        for id in 0..self.eot_id {
                            disable.add(row, id);
                        }
                        check_timestamp_prob.push(row);
                    }
                } else {
                    check_timestamp_prob.push(row);
                }

                // Timestamps may not decrease: forbid anything below the
                // most recent one.
                for t in (begin..step).rev() {
                    let token = sequence[t];
                    if token >= self.timestamp_begin_id {
                        for id in self.timestamp_begin_id..token {
                            disable.add(row, id);
                        }
                        break;
                    }
                }
            }
        }

        if !check_timestamp_prob.is_empty() {
            // The masked ids must not contaminate the normalization.
            disable.apply(logits);
            for row in check_timestamp_prob {
                let log_probs = log_softmax(logits.row(row));
                if self.prefers_timestamp(&log_probs) {
                    for id in 0..self.timestamp_begin_id {
                        disable.add(row, id);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vocabulary layout: text 0..=9, eot 10, control 11..=16
    // (no_timestamps at 16), timestamps 17..=31.
    const VOCAB: usize = 32;
    const EOT: u32 = 10;
    const NO_TIMESTAMPS: u32 = 16;
    const TS_BEGIN: u32 = 17;
    const TS_END: u32 = 31;

    fn rules(max_initial_index: u32) -> TimestampRules {
        TimestampRules::new(
            EOT,
            NO_TIMESTAMPS,
            TS_BEGIN,
            TS_END,
            TS_BEGIN + max_initial_index,
        )
    }

    fn uniform_logits(rows: usize) -> Logits {
        Logits::new(vec![0.0; rows * VOCAB], VOCAB)
    }

    fn masked(
        mut rules: TimestampRules,
        step: usize,
        sequences: &[Vec<u32>],
        mut logits: Logits,
        prefix: Option<&[Vec<u32>]>,
    ) -> Vec<Vec<f32>> {
        let batch_offset: Vec<usize> = (0..sequences.len()).collect();
        let mut disable = DisableTokens::default();
        rules
            .apply(step, &mut logits, &mut disable, sequences, &batch_offset, prefix)
            .unwrap();
        disable.apply(&mut logits);
        (0..logits.rows()).map(|r| logits.row(r).to_vec()).collect()
    }

    fn allowed(row: &[f32]) -> Vec<u32> {
        row.iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .map(|(i, _)| i as u32)
            .collect()
    }

    #[test]
    fn first_step_forces_bounded_timestamp() {
        let rows = masked(rules(3), 0, &[vec![]], uniform_logits(1), None);
        assert_eq!(allowed(&rows[0]), vec![17, 18, 19, 20]);
    }

    #[test]
    fn initial_cap_is_clamped_to_timestamp_range() {
        let rows = masked(rules(1000), 0, &[vec![]], uniform_logits(1), None);
        assert_eq!(allowed(&rows[0]), (17..=31).collect::<Vec<u32>>());
    }

    #[test]
    fn first_step_honors_forced_prefix() {
        let prefix = vec![vec![5, 6]];
        // Two forced tokens already emitted; step 2 is the first sampled one.
        let rows = masked(
            rules(2),
            2,
            &[vec![5, 6]],
            uniform_logits(1),
            Some(&prefix),
        );
        assert_eq!(allowed(&rows[0]), vec![17, 18, 19]);
    }

    #[test]
    fn closed_pair_forbids_timestamps() {
        let rows = masked(rules(5), 2, &[vec![19, 19]], uniform_logits(1), None);
        let allowed = allowed(&rows[0]);
        assert!(allowed.iter().all(|&id| id < TS_BEGIN));
        assert!(allowed.contains(&EOT));
        assert!(!allowed.contains(&NO_TIMESTAMPS));
    }

    #[test]
    fn single_timestamp_counts_as_closed_pair() {
        // The penultimate lookup reads the last token itself when the pair
        // opened at the very first sampled position.
        let rows = masked(rules(5), 1, &[vec![19]], uniform_logits(1), None);
        assert!(allowed(&rows[0]).iter().all(|&id| id < TS_BEGIN));
    }

    #[test]
    fn open_pair_forbids_text() {
        let mut logits = uniform_logits(1);
        // Strong end-of-text candidate so the mass check does not also
        // fire; plain text is already masked by the open pair.
        logits.row_mut(0)[EOT as usize] = 8.0;
        let rows = masked(rules(5), 2, &[vec![3, 19]], logits, None);
        let allowed = allowed(&rows[0]);
        assert!(!allowed.contains(&3));
        assert!(allowed.contains(&EOT));
        // Monotonicity keeps 17/18 out, the open pair allows 19 and above.
        assert!(!allowed.contains(&17));
        assert!(allowed.contains(&19));
        assert!(allowed.contains(&TS_END));
    }

    #[test]
    fn timestamps_do_not_decrease_after_text() {
        let mut logits = uniform_logits(1);
        logits.row_mut(0)[4] = 8.0;
        let rows = masked(rules(5), 2, &[vec![20, 4]], logits, None);
        let allowed = allowed(&rows[0]);
        assert!(!allowed.contains(&17));
        assert!(!allowed.contains(&19));
        assert!(allowed.contains(&20));
        assert!(allowed.contains(&4));
    }

    #[test]
    fn timestamp_mass_forces_timestamp() {
        // Every timestamp is individually weaker than the best text token
        // but their total mass wins.
        let mut logits = uniform_logits(1);
        logits.row_mut(0)[4] = 1.0;
        for id in TS_BEGIN..=TS_END {
            logits.row_mut(0)[id as usize] = 0.5;
        }
        let rows = masked(rules(5), 1, &[vec![4]], logits, None);
        assert!(allowed(&rows[0]).iter().all(|&id| id >= TS_BEGIN));
    }

    #[test]
    fn strong_text_survives_mass_check() {
        let mut logits = uniform_logits(1);
        logits.row_mut(0)[4] = 10.0;
        let rows = masked(rules(5), 1, &[vec![4]], logits, None);
        assert!(allowed(&rows[0]).contains(&4));
    }

    #[test]
    fn no_speech_probs_capture_first_step_only() -> Result<()> {
        let mut processor = NoSpeechProbs::new(2);
        let handle = processor.probs();
        // Two batch items, two beams each.
        let mut data = vec![0.0; 4 * 4];
        data[2] = 1.0; // row 0, id 2
        data[4 * 2 + 2] = 3.0; // row 2, id 2
        let mut logits = Logits::new(data.clone(), 4);
        let mut disable = DisableTokens::default();
        let sequences = vec![vec![]; 4];
        processor.apply(0, &mut logits, &mut disable, &sequences, &[0, 1], None)?;
        let probs = handle.lock().unwrap().clone();
        assert_eq!(probs.len(), 2);
        assert!((probs[0] - softmax(&data[0..4])[2]).abs() < 1e-6);
        assert!((probs[1] - softmax(&data[8..12])[2]).abs() < 1e-6);
        assert!(disable.is_empty());

        // Later steps leave the captured values alone.
        processor.apply(1, &mut logits, &mut disable, &sequences, &[0, 1], None)?;
        assert_eq!(handle.lock().unwrap().clone(), probs);
        Ok(())
    }

    #[test]
    fn tensor_path_matches_host_softmax() -> Result<()> {
        let logits = Tensor::new(&[[0.0f32, 1.0, 2.0, 0.5], [1.0, 1.0, 1.0, 1.0]], &candle::Device::Cpu)?;
        let probs = no_speech_probs_from_logits(&logits, 2)?;
        assert!((probs[0] - softmax(&[0.0, 1.0, 2.0, 0.5])[2]).abs() < 1e-6);
        assert!((probs[1] - 0.25).abs() < 1e-6);
        Ok(())
    }
}
