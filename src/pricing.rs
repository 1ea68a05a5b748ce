//! Model price table for usage cost accounting
//!
//! Built once at startup (built-in prices, optionally overlaid from the
//! config file) and shared read-only with the usage ledger.

use std::collections::HashMap;

use serde::Deserialize;

/// Price of a model in USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    #[must_use]
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost of a single call
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64).mul_add(
            self.input_per_million,
            output_tokens as f64 * self.output_per_million,
        ) / 1_000_000.0
    }
}

/// Price charged for models missing from the table
pub const FALLBACK_PRICE: ModelPrice = ModelPrice::new(1.0, 3.0);

const BUILTIN_PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4o-mini", ModelPrice::new(0.15, 0.60)),
    ("gpt-4o", ModelPrice::new(2.50, 10.0)),
    ("gpt-4.1-nano", ModelPrice::new(0.10, 0.40)),
    ("gpt-4.1-mini", ModelPrice::new(0.40, 1.60)),
    ("gpt-4.1", ModelPrice::new(2.0, 8.0)),
    ("claude-3-5-haiku", ModelPrice::new(0.80, 4.0)),
    ("claude-haiku-4-5", ModelPrice::new(1.0, 5.0)),
    ("claude-sonnet-4", ModelPrice::new(3.0, 15.0)),
];

/// Lookup table from model name to price
#[derive(Debug, Clone)]
pub struct PriceTable {
    models: HashMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            models: BUILTIN_PRICES
                .iter()
                .map(|(name, price)| ((*name).to_string(), *price))
                .collect(),
            fallback: FALLBACK_PRICE,
        }
    }
}

impl PriceTable {
    /// Built-in prices with `overrides` layered on top
    #[must_use]
    pub fn with_overrides(overrides: HashMap<String, ModelPrice>) -> Self {
        let mut table = Self::default();
        table.models.extend(overrides);
        table
    }

    /// Resolve the price for `model`
    ///
    /// A `provider/` prefix is ignored, and dated snapshots such as
    /// `gpt-4o-mini-2024-07-18` resolve to the longest matching family name.
    #[must_use]
    pub fn price(&self, model: &str) -> ModelPrice {
        let name = model.rsplit('/').next().unwrap_or(model);

        if let Some(price) = self.models.get(name) {
            return *price;
        }

        self.models
            .iter()
            .filter(|(family, _)| name.starts_with(family.as_str()))
            .max_by_key(|(family, _)| family.len())
            .map_or(self.fallback, |(_, price)| *price)
    }

    /// Cost of a call to `model`
    #[must_use]
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.price(model).cost(input_tokens, output_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_model_price() {
        let table = PriceTable::default();
        let cost = table.cost("gpt-4o-mini", 1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn dated_snapshot_uses_longest_family() {
        let table = PriceTable::default();
        // Must pick gpt-4o-mini, not gpt-4o
        assert_eq!(
            table.price("gpt-4o-mini-2024-07-18"),
            table.price("gpt-4o-mini")
        );
        assert_eq!(table.price("openai/gpt-4.1-mini"), ModelPrice::new(0.40, 1.60));
    }

    #[test]
    fn unknown_model_uses_fallback() {
        let table = PriceTable::default();
        assert_eq!(table.price("mystery-model"), FALLBACK_PRICE);
    }

    #[test]
    fn overrides_replace_builtin() {
        let mut overrides = HashMap::new();
        overrides.insert("gpt-4o-mini".to_string(), ModelPrice::new(0.0, 0.0));
        let table = PriceTable::with_overrides(overrides);
        assert!(table.cost("gpt-4o-mini", 5000, 5000).abs() < f64::EPSILON);
    }
}
