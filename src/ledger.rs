//! Append-only ledger of per-call spend and savings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::persist::KvStore;

/// Ledger configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Write entries through to the configured store
    pub persist: bool,
    /// Default feature tag for entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
}

/// Dollars saved by each pipeline stage for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SavingsBreakdown {
    pub context: f64,
    pub router: f64,
    pub prefix: f64,
    pub cache_hit: f64,
}

impl SavingsBreakdown {
    pub fn total(&self) -> f64 {
        self.context + self.router + self.prefix + self.cache_hit
    }

    pub fn add(&mut self, other: &SavingsBreakdown) {
        self.context += other.context;
        self.router += other.router;
        self.prefix += other.prefix;
        self.cache_hit += other.cache_hit;
    }
}

/// One settled call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Model the call actually used
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Input tokens before context trimming
    pub original_input_tokens: u64,
    /// Model requested before routing
    pub original_model: String,
    /// Dollar cost of the call
    pub cost: f64,
    /// Per-stage savings
    pub savings: SavingsBreakdown,
    /// Optional feature tag for attribution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate usage for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Summary derived from the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total_calls: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
    pub total_saved: f64,
    pub savings: SavingsBreakdown,
    pub by_model: HashMap<String, ModelUsage>,
}

/// Append-only record of spend and savings.
pub struct CostLedger {
    entries: Mutex<Vec<LedgerEntry>>,
    feature: Option<String>,
    persist: bool,
    store: Option<Arc<dyn KvStore>>,
}

impl CostLedger {
    pub fn new(feature: Option<String>, persist: bool) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            feature,
            persist,
            store: None,
        }
    }

    /// Attach a persistent store for entry write-through.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The configured feature tag applied to entries without one.
    pub fn feature(&self) -> Option<&str> {
        self.feature.as_deref()
    }

    /// Append an entry. Persistence is best-effort.
    pub fn record(&self, mut entry: LedgerEntry) {
        if entry.feature.is_none() {
            entry.feature = self.feature.clone();
        }

        let index = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.push(entry.clone());
            entries.len() - 1
        };

        if self.persist {
            if let Some(store) = self.store.clone() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        match serde_json::to_string(&entry) {
                            Ok(json) => {
                                let key = format!("ledger:{index:012}");
                                if let Err(err) = store.set(&key, &json).await {
                                    tracing::debug!(%err, "ledger persist failed");
                                }
                            }
                            Err(err) => tracing::debug!(%err, "ledger entry serialize failed"),
                        }
                    });
                }
            }
        }
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Aggregate totals across all entries.
    pub fn summary(&self) -> LedgerSummary {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut summary = LedgerSummary::default();

        for entry in entries.iter() {
            summary.total_calls += 1;
            summary.total_input_tokens += entry.input_tokens;
            summary.total_output_tokens += entry.output_tokens;
            summary.total_cost += entry.cost;
            summary.total_saved += entry.savings.total();
            summary.savings.add(&entry.savings);

            let usage = summary.by_model.entry(entry.model.clone()).or_default();
            usage.calls += 1;
            usage.input_tokens += entry.input_tokens;
            usage.output_tokens += entry.output_tokens;
            usage.cost += entry.cost;
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(model: &str, cost: f64, savings: SavingsBreakdown) -> LedgerEntry {
        LedgerEntry {
            model: model.to_string(),
            input_tokens: 100,
            output_tokens: 50,
            original_input_tokens: 120,
            original_model: "gpt-4o".to_string(),
            cost,
            savings,
            feature: None,
            latency_ms: 250,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_record_and_summarize() {
        let ledger = CostLedger::new(None, false);
        ledger.record(entry(
            "gpt-4o-mini",
            0.001,
            SavingsBreakdown {
                router: 0.004,
                ..Default::default()
            },
        ));
        ledger.record(entry(
            "gpt-4o",
            0.01,
            SavingsBreakdown {
                context: 0.002,
                cache_hit: 0.0,
                ..Default::default()
            },
        ));

        let summary = ledger.summary();
        assert_eq!(summary.total_calls, 2);
        assert_eq!(summary.total_input_tokens, 200);
        assert_eq!(summary.total_output_tokens, 100);
        assert!((summary.total_cost - 0.011).abs() < 1e-12);
        assert!((summary.total_saved - 0.006).abs() < 1e-12);
        assert!((summary.savings.router - 0.004).abs() < 1e-12);
        assert_eq!(summary.by_model.len(), 2);
        assert_eq!(summary.by_model["gpt-4o-mini"].calls, 1);
    }

    #[test]
    fn test_feature_tag_applied_as_default() {
        let ledger = CostLedger::new(Some("checkout".to_string()), false);
        ledger.record(entry("gpt-4o", 0.01, SavingsBreakdown::default()));

        let mut tagged = entry("gpt-4o", 0.01, SavingsBreakdown::default());
        tagged.feature = Some("search".to_string());
        ledger.record(tagged);

        let entries = ledger.entries();
        assert_eq!(entries[0].feature.as_deref(), Some("checkout"));
        assert_eq!(entries[1].feature.as_deref(), Some("search"));
    }

    #[test]
    fn test_savings_breakdown_total() {
        let savings = SavingsBreakdown {
            context: 0.1,
            router: 0.2,
            prefix: 0.3,
            cache_hit: 0.4,
        };
        assert!((savings.total() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_entries_are_append_only_in_order() {
        let ledger = CostLedger::new(None, false);
        for i in 0..5 {
            let mut e = entry("gpt-4o", 0.001, SavingsBreakdown::default());
            e.latency_ms = i;
            ledger.record(e);
        }
        let latencies: Vec<u64> = ledger.entries().iter().map(|e| e.latency_ms).collect();
        assert_eq!(latencies, vec![0, 1, 2, 3, 4]);
    }
}
