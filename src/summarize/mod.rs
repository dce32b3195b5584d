//! Summarization for hierarchical abstraction.
//!
//! A parent node's text is a summary of its children. The summary itself comes
//! from an injected [`Summarizer`] (usually an LLM call); this module decides
//! what the summarizer gets to see.
//!
//! ## Context assembly
//!
//! [`bounded_context`] joins child texts with blank lines, stopping before the
//! token budget is exceeded:
//!
//! ```text
//!   child 3 ──┐
//!   child 7 ──┼── "c3\n\nc7\n\nc9"   (≤ max_tokens)
//!   child 9 ──┘
//!   child 12     (does not fit: dropped, and so is everything after it)
//! ```
//!
//! If even the first child is over budget, its longest fitting prefix is used
//! so the summarizer never sees an empty context.

mod tokenizer;

pub use tokenizer::{CharRatioTokenizer, Tokenizer, WhitespaceTokenizer};

use crate::error::ProviderError;

/// Separator placed between children in a summarization context.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// Trait for summarization strategies.
///
/// Implementors condense a context into at most roughly `max_output_tokens`
/// tokens. `layer` is the layer the summary will live on (1 for summaries of
/// leaves), so prompts can vary with abstraction level.
pub trait Summarizer {
    /// Summarize `context` for a node on `layer`.
    fn summarize(
        &self,
        context: &str,
        layer: usize,
        max_output_tokens: usize,
    ) -> Result<String, ProviderError>;
}

impl<S: Summarizer + ?Sized> Summarizer for &S {
    fn summarize(
        &self,
        context: &str,
        layer: usize,
        max_output_tokens: usize,
    ) -> Result<String, ProviderError> {
        (**self).summarize(context, layer, max_output_tokens)
    }
}

/// A simple concatenation summarizer (for testing).
///
/// Collapses the children of a context onto one line and truncates to about
/// four characters per allowed token.
#[derive(Debug, Clone)]
pub struct ConcatSummarizer {
    /// Separator between children.
    pub separator: String,
}

impl Default for ConcatSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcatSummarizer {
    /// Create a new concatenation summarizer.
    pub fn new() -> Self {
        Self {
            separator: " | ".to_string(),
        }
    }

    /// Set separator.
    pub fn with_separator(mut self, sep: impl Into<String>) -> Self {
        self.separator = sep.into();
        self
    }
}

impl Summarizer for ConcatSummarizer {
    fn summarize(
        &self,
        context: &str,
        _layer: usize,
        max_output_tokens: usize,
    ) -> Result<String, ProviderError> {
        let joined = context
            .split(CONTEXT_SEPARATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(&self.separator);

        let max_chars = max_output_tokens.saturating_mul(4);
        if joined.chars().count() <= max_chars {
            return Ok(joined);
        }
        let mut truncated: String = joined.chars().take(max_chars.saturating_sub(3)).collect();
        truncated.push_str("...");
        Ok(truncated)
    }
}

/// A function-based summarizer.
#[derive(Clone)]
pub struct FnSummarizer<F> {
    f: F,
}

impl<F> FnSummarizer<F> {
    /// Create a summarizer from a function.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Summarizer for FnSummarizer<F>
where
    F: Fn(&str, usize, usize) -> Result<String, ProviderError>,
{
    fn summarize(
        &self,
        context: &str,
        layer: usize,
        max_output_tokens: usize,
    ) -> Result<String, ProviderError> {
        (self.f)(context, layer, max_output_tokens)
    }
}

/// Create a summarizer from a closure.
pub fn from_fn<F>(f: F) -> FnSummarizer<F>
where
    F: Fn(&str, usize, usize) -> Result<String, ProviderError>,
{
    FnSummarizer::new(f)
}

/// Join `texts` with blank lines without exceeding `max_tokens`.
///
/// Whole texts are added in order while they fit; assembly stops at the first
/// text that does not. An over-budget first text contributes its longest
/// fitting prefix.
pub fn bounded_context<S: AsRef<str>>(
    texts: &[S],
    tokenizer: &dyn Tokenizer,
    max_tokens: usize,
) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut used = 0usize;

    for text in texts {
        let text = text.as_ref();
        let tokens = tokenizer.count_tokens(text);
        if used + tokens <= max_tokens {
            parts.push(text);
            used += tokens;
            continue;
        }
        if parts.is_empty() {
            parts.push(longest_prefix(text, tokenizer, max_tokens));
        }
        break;
    }

    parts.join(CONTEXT_SEPARATOR)
}

/// Longest prefix of `text` (on a char boundary) within `max_tokens`.
fn longest_prefix<'a>(text: &'a str, tokenizer: &dyn Tokenizer, max_tokens: usize) -> &'a str {
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .skip(1)
        .chain(std::iter::once(text.len()))
        .collect();

    // Binary search for the last boundary whose prefix still fits.
    let (mut lo, mut hi) = (0usize, boundaries.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        if tokenizer.count_tokens(&text[..boundaries[mid]]) <= max_tokens {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    match lo {
        0 => "",
        n => &text[..boundaries[n - 1]],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_summarizer() {
        let summarizer = ConcatSummarizer::new().with_separator(", ");
        let summary = summarizer.summarize("a\n\nb\n\nc", 1, 100).unwrap();
        assert_eq!(summary, "a, b, c");
    }

    #[test]
    fn test_concat_summarizer_truncates_to_budget() {
        let summarizer = ConcatSummarizer::new();
        let summary = summarizer.summarize(&"x".repeat(100), 1, 5).unwrap();
        assert_eq!(summary.chars().count(), 20);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_fn_summarizer() {
        let summarizer = from_fn(|ctx: &str, layer: usize, _max: usize| {
            Ok(format!("L{layer}: {}", ctx.len()))
        });
        assert_eq!(summarizer.summarize("abcd", 2, 10).unwrap(), "L2: 4");
    }

    #[test]
    fn test_bounded_context_stops_at_first_misfit() {
        let texts = ["one two", "three four five", "six", "seven"];
        // 2 + 3 fit in 5; "six" would make 6.
        let ctx = bounded_context(&texts, &WhitespaceTokenizer, 5);
        assert_eq!(ctx, "one two\n\nthree four five");
    }

    #[test]
    fn test_bounded_context_truncates_oversized_first_child() {
        let texts = ["a b c d e f g h", "i"];
        let ctx = bounded_context(&texts, &WhitespaceTokenizer, 3);
        assert_eq!(WhitespaceTokenizer.count_tokens(&ctx), 3);
        assert!(ctx.starts_with("a b c"));
        assert!(!ctx.contains('i'));
    }

    #[test]
    fn test_bounded_context_respects_char_boundaries() {
        let texts = ["héllo wörld ünïcode"];
        let ctx = bounded_context(&texts, &CharRatioTokenizer::new(1), 7);
        assert_eq!(ctx, "héllo w");
    }

    #[test]
    fn test_bounded_context_empty() {
        let texts: [&str; 0] = [];
        assert_eq!(bounded_context(&texts, &WhitespaceTokenizer, 10), "");
    }
}
