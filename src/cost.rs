use crate::error::{ErrorKind, ProviderError, Result};
use crate::model::{Message, TokenUsage, conversation_char_count};
use crate::pricing::{PricingTable, PricingUnit};
use serde::{Deserialize, Serialize};

/// Characters of text per estimated token. Rough English-prose average;
/// the estimate path is documented as approximate and never used for
/// billing reconciliation.
pub const CHARS_PER_TOKEN: usize = 4;

/// Assumed output-to-input token ratio when estimating before a call.
const ESTIMATED_OUTPUT_FRACTION: f64 = 0.5;

/// Deterministic cost report echoing its own inputs, so a caller can audit
/// the arithmetic without re-resolving the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub model: String,
    pub matched_entry: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_rate_per_1k: f64,
    pub output_rate_per_1k: f64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub currency: String,
    /// True when token counts were derived from text length, not reported
    /// by the backend.
    pub estimated: bool,
}

/// Pure cost arithmetic over an injected [`PricingTable`].
#[derive(Debug, Clone)]
pub struct CostCalculator {
    provider: String,
}

impl CostCalculator {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }

    /// Exact cost for a finished exchange:
    /// `(input/1000) * input_rate + (output/1000) * output_rate`.
    pub fn calculate(
        &self,
        table: &PricingTable,
        usage: TokenUsage,
        model: &str,
    ) -> Result<CostBreakdown> {
        let entry = table.resolve(&self.provider, model).ok_or_else(|| {
            ProviderError::new(
                ErrorKind::ValidationError,
                self.provider.clone(),
                format!("no pricing entry for model {model}"),
            )
        })?;

        let (input_cost, output_cost) = match entry.unit {
            PricingUnit::PerThousandTokens => {
                #[allow(clippy::cast_precision_loss)]
                let input = usage.input_tokens() as f64 / 1_000.0 * entry.input_per_1k;
                #[allow(clippy::cast_precision_loss)]
                let output = usage.output_tokens() as f64 / 1_000.0 * entry.output_per_1k;
                (input, output)
            }
            PricingUnit::PerRequest => (entry.input_per_1k, 0.0),
        };

        Ok(CostBreakdown {
            model: model.to_string(),
            matched_entry: entry.model.clone(),
            input_tokens: usage.input_tokens(),
            output_tokens: usage.output_tokens(),
            input_rate_per_1k: entry.input_per_1k,
            output_rate_per_1k: entry.output_per_1k,
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            currency: entry.currency.clone(),
            estimated: false,
        })
    }

    /// Pre-flight estimate from conversation text length. Token counts are
    /// `chars / 4` with an assumed output share; treat the result as an
    /// order-of-magnitude figure only.
    pub fn estimate(
        &self,
        table: &PricingTable,
        messages: &[Message],
        model: &str,
    ) -> Result<CostBreakdown> {
        let chars = conversation_char_count(messages);
        let input_tokens = u64::try_from(chars / CHARS_PER_TOKEN).unwrap_or(u64::MAX);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let output_tokens = (input_tokens as f64 * ESTIMATED_OUTPUT_FRACTION) as u64;

        let mut breakdown =
            self.calculate(table, TokenUsage::new(input_tokens, output_tokens), model)?;
        breakdown.estimated = true;
        Ok(breakdown)
    }
}
