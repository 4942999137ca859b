//! Greedy CTC decoding and subword detokenization.

use ndarray::ArrayView2;

use crate::vocab::Vocabulary;

/// SentencePiece word-start marker U+2581 as UTF-8 bytes.
const WORD_BOUNDARY: &[u8] = "\u{2581}".as_bytes();

/// Output of a greedy CTC pass over one log-prob matrix.
#[derive(Debug, Clone)]
pub struct DecodedTokens {
    pub ids: Vec<usize>,
    /// Mean of `exp(max logprob)` over the decoded frames. A stable proxy for
    /// certainty, not a calibrated probability.
    pub confidence: f32,
}

/// Greedy CTC decode: per-frame argmax, collapse adjacent duplicates, drop
/// blanks. Only the first `valid_len` frames are considered.
pub fn greedy_decode(
    log_probs: ArrayView2<f32>,
    valid_len: usize,
    blank_id: usize,
) -> DecodedTokens {
    let frames = log_probs.nrows().min(valid_len);
    let vocab_size = log_probs.ncols();

    let mut ids = Vec::new();
    let mut prev: Option<usize> = None;
    let mut prob_sum = 0.0f32;

    for t in 0..frames {
        let mut best_id = 0usize;
        let mut best_val = f32::NEG_INFINITY;
        for v in 0..vocab_size {
            let val = log_probs[[t, v]];
            if val > best_val {
                best_val = val;
                best_id = v;
            }
        }

        prob_sum += best_val.exp();

        if best_id != blank_id && Some(best_id) != prev {
            ids.push(best_id);
        }
        prev = Some(best_id);
    }

    let confidence = if frames > 0 {
        prob_sum / frames as f32
    } else {
        1.0
    };

    DecodedTokens { ids, confidence }
}

/// Assemble token ids into text.
///
/// SentencePiece tokens prefixed with `▁` start a new word; BERT-style `##`
/// tokens continue the previous one. Ids past the vocabulary are a decoder
/// logic error: they trip a debug assertion, and in release builds are
/// rendered as `[UNK:<id>]`.
pub fn detokenize(ids: &[usize], vocab: &Vocabulary) -> String {
    let mut text = String::new();

    for &id in ids {
        let token = match vocab.token(id) {
            Some(token) => token,
            None => {
                debug_assert!(false, "token id {} out of range ({})", id, vocab.len());
                log::error!("token id {} exceeds vocabulary size {}", id, vocab.len());
                text.push_str(&format!("[UNK:{}]", id));
                continue;
            }
        };

        let bytes = token.as_bytes();
        if bytes.starts_with(WORD_BOUNDARY) {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&token[WORD_BOUNDARY.len()..]);
        } else if let Some(rest) = token.strip_prefix("##") {
            text.push_str(rest);
        } else {
            text.push_str(token);
        }
    }

    text
}

/// Convenience: decode log-probs straight to text plus confidence.
pub fn decode_to_text(
    log_probs: ArrayView2<f32>,
    valid_len: usize,
    vocab: &Vocabulary,
) -> (String, f32) {
    let decoded = greedy_decode(log_probs, valid_len, vocab.blank_id());
    let text = detokenize(&decoded.ids, vocab);
    (text, decoded.confidence)
}
