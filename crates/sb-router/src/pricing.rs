use std::collections::HashMap;

use sb_core::types::ModelDescriptor;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ModelPrice {
    pub per_1k_input: f64,
    pub per_1k_output: f64,
}

impl ModelPrice {
    pub fn of(descriptor: &ModelDescriptor) -> Self {
        Self {
            per_1k_input: descriptor.cost_per_1k_input,
            per_1k_output: descriptor.cost_per_1k_output,
        }
    }

    pub fn is_free(&self) -> bool {
        self.per_1k_input <= 0.0 && self.per_1k_output <= 0.0
    }

    /// Cost in USD, rounded half-up to 6 decimals.
    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        let raw = tokens_in as f64 / 1000.0 * self.per_1k_input
            + tokens_out as f64 / 1000.0 * self.per_1k_output;
        round_half_up_6(raw)
    }
}

/// Static USD-per-1k-token prices keyed by model key.
///
/// Adapter keys (`base+adapter`) resolve to their base model. Keys with no
/// entry are priced at zero: anything not in the paid catalog runs locally.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn from_catalog(models: &[ModelDescriptor]) -> Self {
        let prices = models
            .iter()
            .map(|m| (m.model_id.clone(), ModelPrice::of(m)))
            .collect();
        Self { prices }
    }

    pub fn insert(&mut self, model_key: impl Into<String>, price: ModelPrice) {
        self.prices.insert(model_key.into(), price);
    }

    /// The table entry for `model_key`, or for its base model if it is an
    /// adapter key.
    pub fn lookup(&self, model_key: &str) -> Option<ModelPrice> {
        if let Some(p) = self.prices.get(model_key) {
            return Some(*p);
        }
        let (base, _) = model_key.split_once('+')?;
        self.prices.get(base).copied()
    }

    pub fn price_of(&self, model_key: &str) -> ModelPrice {
        self.lookup(model_key).unwrap_or_else(|| {
            debug!(model = model_key, "no price entry, treating as free");
            ModelPrice::default()
        })
    }

    pub fn cost(&self, model_key: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        self.price_of(model_key).cost(tokens_in, tokens_out)
    }
}

/// Half-up rounding to 6 decimals for non-negative amounts.
///
/// The nudge is a few ULPs of the scaled value: enough to lift a true half
/// that binary stored just below it (0.0000025 rounds to 0.000003), too small
/// to move anything genuinely below a half, at any magnitude.
pub fn round_half_up_6(amount: f64) -> f64 {
    if amount <= 0.0 {
        return 0.0;
    }
    let scaled = amount * 1_000_000.0;
    let nudge = scaled * 4.0 * f64::EPSILON;
    (scaled + nudge + 0.5).floor() / 1_000_000.0
}
