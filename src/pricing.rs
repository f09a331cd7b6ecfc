use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─── Pricing entries ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingUnit {
    PerThousandTokens,
    PerRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCategory {
    PayPerUse,
    FreeTier,
    Tiered,
}

/// One row of the injected pricing table. Rates are USD per 1K tokens for
/// token-unit entries; `input_per_1k` doubles as the flat price for
/// per-request entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub model: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub unit: PricingUnit,
    pub currency: String,
    pub category: BillingCategory,
    pub effective_date: NaiveDate,
}

impl PricingEntry {
    pub fn per_1k_tokens(
        model: impl Into<String>,
        input_per_1k: f64,
        output_per_1k: f64,
        effective_date: NaiveDate,
    ) -> Self {
        Self {
            model: model.into(),
            input_per_1k,
            output_per_1k,
            unit: PricingUnit::PerThousandTokens,
            currency: "USD".to_string(),
            category: BillingCategory::PayPerUse,
            effective_date,
        }
    }
}

// ─── Model-id normalization ──────────────────────────────────────────────────

/// Canonicalize a model id for pricing lookup: lowercase, drop any
/// `provider/` prefix, and strip `-latest`, `-preview…`, and trailing
/// date stamps (`-2024-08-06`, `-20250514`).
pub fn normalize_model_id(model: &str) -> String {
    let mut id = model.to_ascii_lowercase();
    if let Some((_, rest)) = id.split_once('/') {
        id = rest.to_string();
    }
    if let Some(stripped) = id.strip_suffix("-latest") {
        id = stripped.to_string();
    }
    if let Some(position) = id.find("-preview") {
        id.truncate(position);
    }
    strip_date_suffix(&mut id);
    id
}

fn strip_date_suffix(id: &mut String) {
    // `-YYYY-MM-DD` tail
    if id.len() > 11 && dashed_date_tail(id) {
        id.truncate(id.len() - 11);
        return;
    }
    // `-YYYYMMDD` tail
    if let Some(dash) = id.rfind('-') {
        let tail = &id[dash + 1..];
        if tail.len() == 8 && tail.bytes().all(|b| b.is_ascii_digit()) {
            id.truncate(dash);
        }
    }
}

// True when the id ends in `-YYYY-MM-DD`.
fn dashed_date_tail(id: &str) -> bool {
    let parts: Vec<&str> = id.rsplitn(4, '-').collect();
    parts.len() == 4
        && parts[0].len() == 2
        && parts[1].len() == 2
        && parts[2].len() == 4
        && parts[..3]
            .iter()
            .all(|part| part.bytes().all(|b| b.is_ascii_digit()))
}

// ─── Pricing table ───────────────────────────────────────────────────────────

/// Injected, swappable pricing data. Lookup is exact match on the
/// normalized id, then longest normalized prefix, then the provider's
/// default entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    pub entries: Vec<PricingEntry>,
    /// Provider name → model id of the fallback entry.
    #[serde(default)]
    pub provider_defaults: HashMap<String, String>,
}

impl PricingTable {
    pub fn new(entries: Vec<PricingEntry>) -> Self {
        Self {
            entries,
            provider_defaults: HashMap::new(),
        }
    }

    pub fn with_provider_default(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        self.provider_defaults.insert(provider.into(), model.into());
        self
    }

    pub fn resolve(&self, provider: &str, model: &str) -> Option<&PricingEntry> {
        let normalized = normalize_model_id(model);

        if let Some(entry) = self
            .entries
            .iter()
            .find(|entry| normalize_model_id(&entry.model) == normalized)
        {
            return Some(entry);
        }

        let prefix_match = self
            .entries
            .iter()
            .filter(|entry| {
                let entry_id = normalize_model_id(&entry.model);
                normalized.starts_with(&entry_id)
            })
            .max_by_key(|entry| normalize_model_id(&entry.model).len());
        if let Some(entry) = prefix_match {
            return Some(entry);
        }

        let default_model = self.provider_defaults.get(provider)?;
        self.entries.iter().find(|entry| &entry.model == default_model)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        default_table()
    }
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

/// Built-in table for the stock backends. Callers with negotiated rates
/// inject their own.
pub fn default_table() -> PricingTable {
    let entries = vec![
        PricingEntry::per_1k_tokens("claude-sonnet-4", 0.003, 0.015, date(2025, 5, 14)),
        PricingEntry::per_1k_tokens("claude-3-5-sonnet", 0.003, 0.015, date(2024, 10, 22)),
        PricingEntry::per_1k_tokens("claude-3-5-haiku", 0.000_8, 0.004, date(2024, 11, 4)),
        PricingEntry::per_1k_tokens("claude-3-opus", 0.015, 0.075, date(2024, 2, 29)),
        PricingEntry::per_1k_tokens("gpt-4o", 0.002_5, 0.01, date(2024, 8, 6)),
        PricingEntry::per_1k_tokens("gpt-4o-mini", 0.000_15, 0.000_6, date(2024, 7, 18)),
        PricingEntry::per_1k_tokens("gpt-4.1", 0.002, 0.008, date(2025, 4, 14)),
        PricingEntry::per_1k_tokens("gemini-2.0-flash", 0.000_1, 0.000_4, date(2025, 2, 5)),
        PricingEntry::per_1k_tokens("gemini-1.5-pro", 0.001_25, 0.005, date(2024, 9, 24)),
        PricingEntry {
            model: "ollama-local".to_string(),
            input_per_1k: 0.0,
            output_per_1k: 0.0,
            unit: PricingUnit::PerThousandTokens,
            currency: "USD".to_string(),
            category: BillingCategory::FreeTier,
            effective_date: date(2024, 1, 1),
        },
    ];

    PricingTable::new(entries)
        .with_provider_default("openai", "gpt-4o-mini")
        .with_provider_default("anthropic", "claude-3-5-haiku")
        .with_provider_default("gemini", "gemini-2.0-flash")
        .with_provider_default("ollama", "ollama-local")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_dates_and_suffixes() {
        assert_eq!(normalize_model_id("gpt-4o-2024-08-06"), "gpt-4o");
        assert_eq!(
            normalize_model_id("claude-sonnet-4-20250514"),
            "claude-sonnet-4"
        );
        assert_eq!(normalize_model_id("gemini-1.5-pro-latest"), "gemini-1.5-pro");
        assert_eq!(normalize_model_id("o1-preview-2024-09-12"), "o1");
        assert_eq!(normalize_model_id("GPT-4o"), "gpt-4o");
    }

    #[test]
    fn normalization_drops_provider_prefix() {
        assert_eq!(
            normalize_model_id("anthropic/claude-3-5-sonnet-20241022"),
            "claude-3-5-sonnet"
        );
    }

    #[test]
    fn exact_match_wins() {
        let table = default_table();
        let entry = table.resolve("openai", "gpt-4o").expect("gpt-4o priced");
        assert!((entry.input_per_1k - 0.002_5).abs() < f64::EPSILON);
    }

    #[test]
    fn dated_variant_resolves_to_base_entry() {
        let table = default_table();
        let entry = table
            .resolve("anthropic", "claude-sonnet-4-20250514")
            .expect("dated claude priced");
        assert_eq!(entry.model, "claude-sonnet-4");
    }

    #[test]
    fn longest_prefix_wins_over_shorter() {
        let table = PricingTable::new(vec![
            PricingEntry::per_1k_tokens("gpt-4o", 0.002_5, 0.01, date(2024, 8, 6)),
            PricingEntry::per_1k_tokens("gpt-4o-mini", 0.000_15, 0.000_6, date(2024, 7, 18)),
        ]);
        let entry = table
            .resolve("openai", "gpt-4o-mini-custom")
            .expect("prefix match");
        assert_eq!(entry.model, "gpt-4o-mini");
    }

    #[test]
    fn unknown_model_falls_back_to_provider_default() {
        let table = default_table();
        let entry = table
            .resolve("openai", "some-experimental-model")
            .expect("provider default");
        assert_eq!(entry.model, "gpt-4o-mini");
    }

    #[test]
    fn unknown_model_and_provider_resolves_to_none() {
        let table = default_table();
        assert!(table.resolve("acme", "frontier-1").is_none());
    }

    #[test]
    fn table_round_trips_through_toml() {
        let table = default_table();
        let text = toml::to_string(&table).unwrap();
        let back: PricingTable = toml::from_str(&text).unwrap();
        assert_eq!(back.entries.len(), table.entries.len());
        assert!(back.resolve("gemini", "gemini-2.0-flash").is_some());
    }
}
