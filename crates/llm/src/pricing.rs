//! Token pricing.

use pipeline::reasoning::ReasoningUsage;
use pipeline::TokenCost;

/// Price of a model in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        }
    }
}

impl Pricing {
    /// Cost of one call with `usage`.
    pub fn cost(&self, usage: ReasoningUsage) -> TokenCost {
        let usd = usage.input_tokens.as_u64() as f64 / 1_000_000.0 * self.input_per_mtok
            + usage.output_tokens.as_u64() as f64 / 1_000_000.0 * self.output_per_mtok;
        TokenCost::new(usd).unwrap_or_default()
    }
}
