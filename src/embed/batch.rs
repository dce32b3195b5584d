//! Splitting embedding requests under item and token limits.

use std::ops::Range;

const CHARS_PER_TOKEN: usize = 4;

/// Rough token estimate used for provider budgets: one token per four chars.
pub fn estimate_tokens(text: &str) -> usize {
    tokens_for_chars(text.chars().count())
}

/// Estimated tokens of a text with `chars` characters.
pub(crate) fn tokens_for_chars(chars: usize) -> usize {
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Split `texts` into contiguous ranges that respect both limits.
///
/// Greedy packing: each range grows until adding the next text would exceed
/// `max_items` or `max_tokens`. For an order-preserving split this yields the
/// fewest ranges.
///
/// Every text must fit `max_tokens` on its own. The provider guarantees this
/// by truncating to `max_text_chars`, which config validation ties to the
/// token limit. A text that does not fit still gets a range of its own.
pub fn plan_batches<S: AsRef<str>>(
    texts: &[S],
    max_items: usize,
    max_tokens: usize,
) -> Vec<Range<usize>> {
    let max_items = max_items.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut tokens = 0usize;

    for (i, text) in texts.iter().enumerate() {
        let t = estimate_tokens(text.as_ref());
        let items = i - start;
        let over_items = items + 1 > max_items;
        let over_tokens = items > 0 && tokens + t > max_tokens;
        if over_items || over_tokens {
            ranges.push(start..i);
            start = i;
            tokens = 0;
        }
        tokens += t;
    }
    if start < texts.len() {
        ranges.push(start..texts.len());
    }
    ranges
}
