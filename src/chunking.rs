//! Content chunking and hashing.
//!
//! Large documents are split into overlapping character windows before they
//! are embedded and stored; each chunk carries a content hash so duplicate
//! slices can be detected cheaply. Token counts are estimated at 4 chars per
//! token, which is close enough for a soft limit.

/// Estimated token count for a piece of text (4 characters per token,
/// rounded up).
#[must_use]
pub fn estimated_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Whether content exceeds the soft token limit and should be chunked.
#[must_use]
pub fn needs_chunking(content: &str, soft_token_limit: usize) -> bool {
    estimated_tokens(content) > soft_token_limit
}

/// Stable FNV-1a hash over the given parts, hex-encoded.
///
/// Used both for per-chunk dedup hashes and for deriving document ids when
/// the source does not supply one. Parts are length-prefixed so that
/// `["ab", "c"]` and `["a", "bc"]` hash differently.
#[must_use]
pub fn content_hash(parts: &[&str]) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    let mut step = |byte: u8| {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    };
    for part in parts {
        for byte in (part.len() as u64).to_le_bytes() {
            step(byte);
        }
        for byte in part.bytes() {
            step(byte);
        }
    }
    format!("{hash:016x}")
}

/// Splits content into overlapping windows of `window` characters with
/// `overlap` characters shared between consecutive chunks.
///
/// Boundaries prefer whitespace near the window edge so words are not cut
/// mid-token. Content at or below the window size is returned as a single
/// chunk. The overlap is clamped below the window so the split always makes
/// forward progress.
#[must_use]
pub fn split_into_chunks(content: &str, window: usize, overlap: usize) -> Vec<String> {
    let window = window.max(1);
    let overlap = overlap.min(window - 1);

    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= window {
        return vec![content.to_string()];
    }

    // Look back at most a tenth of the window for a whitespace boundary.
    let lookback = (window / 10).max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let hard_end = (start + window).min(chars.len());
        let end = if hard_end == chars.len() {
            hard_end
        } else {
            chars[start..hard_end]
                .iter()
                .rposition(|c| c.is_whitespace())
                .filter(|pos| hard_end - (start + pos) <= lookback)
                .map_or(hard_end, |pos| start + pos + 1)
        };

        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    chunks
}
