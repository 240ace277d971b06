use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use braid_core::types::Turn;

/// The cl100k_base tokenizer, or `None` if it failed to load.
fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| tiktoken_rs::cl100k_base().ok())
        .as_ref()
}

/// BPE token count, falling back to a 4-chars-per-token estimate.
pub fn estimate_tokens(text: &str) -> usize {
    match tokenizer() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.len().div_ceil(4),
    }
}

/// Tokens for one turn, including tool-call arguments and 4 tokens of framing.
pub fn estimate_turn_tokens(turn: &Turn) -> usize {
    let calls: usize = turn
        .tool_calls
        .iter()
        .map(|c| estimate_tokens(&c.name) + estimate_tokens(&c.arguments.to_string()))
        .sum();
    estimate_tokens(&turn.content) + calls + 4
}

pub fn estimate_history_tokens(turns: &[Turn]) -> usize {
    turns.iter().map(estimate_turn_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimates_grow_with_text() {
        let short = estimate_tokens("hello");
        let long = estimate_tokens(&"hello world ".repeat(50));
        assert!(short >= 1);
        assert!(long > short * 10);
    }

    #[test]
    fn test_turn_overhead() {
        let turns = vec![Turn::user(""), Turn::assistant("")];
        assert_eq!(estimate_history_tokens(&turns), 8);
    }
}
