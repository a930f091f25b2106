//! Model pricing table.
//!
//! Prices are USD per million tokens (input, output). Entries are matched in
//! order, so more specific names must come before their prefixes.

/// How a table entry matches a model identifier.
#[derive(Debug, Clone, Copy)]
enum Match {
    Prefix,
    Contains,
}

const PRICING: &[(&str, Match, f64, f64)] = &[
    // OpenAI chat
    ("gpt-5-nano", Match::Prefix, 0.05, 0.40),
    ("gpt-5-mini", Match::Prefix, 0.25, 2.00),
    ("gpt-5", Match::Prefix, 1.25, 10.00),
    ("gpt-4.1-nano", Match::Prefix, 0.10, 0.40),
    ("gpt-4.1-mini", Match::Prefix, 0.40, 1.60),
    ("gpt-4.1", Match::Prefix, 2.00, 8.00),
    ("gpt-4o-mini", Match::Prefix, 0.15, 0.60),
    ("gpt-4o", Match::Prefix, 2.50, 10.00),
    ("gpt-4-turbo", Match::Prefix, 10.0, 30.0),
    ("gpt-3.5-turbo", Match::Prefix, 0.50, 1.50),
    ("o4-mini", Match::Prefix, 1.10, 4.40),
    ("o3-mini", Match::Prefix, 1.10, 4.40),
    ("o3", Match::Prefix, 2.00, 8.00),
    // OpenAI embeddings (input only)
    ("text-embedding-3-small", Match::Prefix, 0.02, 0.0),
    ("text-embedding-3-large", Match::Prefix, 0.13, 0.0),
    ("text-embedding-ada-002", Match::Prefix, 0.10, 0.0),
    // Anthropic, dated suffixes ignored by substring match
    ("claude-opus-4-5", Match::Contains, 5.00, 25.00),
    ("claude-opus-4", Match::Contains, 15.0, 75.0),
    ("claude-3-opus", Match::Contains, 15.0, 75.0),
    ("claude-sonnet-4", Match::Contains, 3.0, 15.0),
    ("claude-3-5-sonnet", Match::Contains, 3.0, 15.0),
    ("claude-haiku-4-5", Match::Contains, 1.00, 5.00),
    ("claude-3-5-haiku", Match::Contains, 0.80, 4.0),
    ("claude-3-haiku", Match::Contains, 0.25, 1.25),
];

/// Local model families served at zero cost.
const LOCAL_PREFIXES: &[&str] = &[
    "qwen", "llama", "mistral", "mixtral", "deepseek", "phi-", "gemma", "mock",
];

/// Pricing per million tokens, `None` for unknown models.
pub fn model_pricing(model: &str) -> Option<(f64, f64)> {
    let normalized = model.to_lowercase();

    let hit = PRICING.iter().find(|(name, kind, _, _)| match kind {
        Match::Prefix => normalized.starts_with(name),
        Match::Contains => normalized.contains(name),
    });
    if let Some((_, _, input, output)) = hit {
        return Some((*input, *output));
    }

    LOCAL_PREFIXES
        .iter()
        .any(|prefix| normalized.starts_with(prefix))
        .then_some((0.0, 0.0))
}

/// Per-token (input, output) rates; unknown models are free.
pub fn per_token_rates(model: &str) -> (f64, f64) {
    model_pricing(model)
        .map(|(i, o)| (i / 1_000_000.0, o / 1_000_000.0))
        .unwrap_or((0.0, 0.0))
}
