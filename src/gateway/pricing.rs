//! Per-token prices for the models a run is likely to use.
//!
//! Costs are in nanodollars (1e-9 USD). Dated snapshots such as
//! `openai/gpt-4o-mini-2024-07-18` are priced as their base model.

/// Price of one model, per token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    /// From USD per million tokens, the unit providers publish.
    const fn per_million(input_cents: i64, output_cents: i64) -> Self {
        Self {
            input_nanos_per_token: input_cents * 10,
            output_nanos_per_token: output_cents * 10,
        }
    }

    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        input_tokens as i64 * self.input_nanos_per_token
            + output_tokens as i64 * self.output_nanos_per_token
    }
}

// Prices in cents per 1M tokens (input, output). Verify against OpenRouter
// model pages when adding entries.
const PRICES: &[(&str, ModelPricing)] = &[
    ("anthropic/claude-3-5-haiku", ModelPricing::per_million(80, 400)),
    ("anthropic/claude-3-5-sonnet", ModelPricing::per_million(300, 1_500)),
    ("anthropic/claude-sonnet-4.5", ModelPricing::per_million(300, 1_500)),
    ("anthropic/claude-opus-4.5", ModelPricing::per_million(500, 2_500)),
    ("openai/gpt-4o-mini", ModelPricing::per_million(15, 60)),
    ("openai/gpt-5-mini", ModelPricing::per_million(25, 200)),
    ("openai/gpt-5.2-chat", ModelPricing::per_million(175, 1_400)),
    ("google/gemini-2.5-flash", ModelPricing::per_million(30, 250)),
    ("moonshotai/kimi-k2-0905", ModelPricing::per_million(39, 190)),
];

/// Unlisted models are billed as a mid-range model so budgets still bite.
pub const FALLBACK_PRICING: ModelPricing = ModelPricing::per_million(100, 500);

/// Strip a trailing `-YYYYMMDD` or `-YYYY-MM-DD` snapshot suffix.
fn base_model(model_id: &str) -> &str {
    let is_date = |s: &str| {
        let digits: String = s.chars().filter(|c| *c != '-').collect();
        digits.len() == 8 && digits.chars().all(|c| c.is_ascii_digit())
    };
    for suffix_len in [9, 11] {
        let Some(split) = model_id.len().checked_sub(suffix_len) else {
            continue;
        };
        if !model_id.is_char_boundary(split) {
            continue;
        }
        let (base, date) = model_id.split_at(split);
        if let Some(date) = date.strip_prefix('-') {
            if is_date(date) {
                return base;
            }
        }
    }
    model_id
}

pub fn pricing_for(model_id: &str) -> Option<ModelPricing> {
    let lookup = |id: &str| PRICES.iter().find(|(name, _)| *name == id).map(|(_, p)| *p);
    lookup(model_id).or_else(|| lookup(base_model(model_id)))
}

/// Cost of one call in nanodollars.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    pricing_for(model)
        .unwrap_or(FALLBACK_PRICING)
        .cost(input_tokens, output_tokens)
}

/// Nanodollars as a dollar string for summaries, e.g. `$0.0048`.
pub fn format_usd(nanodollars: i64) -> String {
    format!("${:.4}", nanodollars as f64 / 1_000_000_000.0)
}
