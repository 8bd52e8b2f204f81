use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use nrega_core::{
    ConflictPolicy, DistrictMonthPerformance, NaturalKey, RawFact, StateMonthAverages,
    StateMonthKey, StoredRawFact,
};
use tokio::sync::Mutex;

use crate::{
    plan_aggregation, AggregationMode, AggregationSummary, IngestOutcome, PipelineStore,
    StoreError, TableCounts,
};

/// The three tables of the in-memory backend, keyed the way the database
/// enforces uniqueness.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTables {
    pub raw: BTreeMap<NaturalKey, StoredRawFact>,
    pub districts: BTreeMap<NaturalKey, DistrictMonthPerformance>,
    pub states: BTreeMap<StateMonthKey, StateMonthAverages>,
}

/// In-process [`PipelineStore`] used by tests and local runs without a
/// database. A failing write leaves every table untouched.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    fail_next_write: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }

    /// Makes the next write fail with [`StoreError::Unavailable`].
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    fn check_injected_failure(&self) -> Result<(), StoreError> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn insert_raw_facts(
        &self,
        facts: &[RawFact],
        policy: ConflictPolicy,
    ) -> Result<IngestOutcome, StoreError> {
        self.check_injected_failure()?;
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let mut outcome = IngestOutcome {
            received: facts.len(),
            ..IngestOutcome::default()
        };

        for fact in facts {
            match (tables.raw.get_mut(&fact.key), policy) {
                (Some(_), ConflictPolicy::Skip) => outcome.skipped += 1,
                (Some(stored), ConflictPolicy::Replace) => {
                    // Names stay as first ingested.
                    stored.fact.measures = fact.measures;
                    stored.fact.remarks = fact.remarks.clone();
                    stored.updated_at = now;
                    outcome.updated += 1;
                }
                (None, _) => {
                    tables.raw.insert(
                        fact.key.clone(),
                        StoredRawFact {
                            fact: fact.clone(),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    outcome.inserted += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn aggregate(&self, mode: AggregationMode) -> Result<AggregationSummary, StoreError> {
        self.check_injected_failure()?;
        let mut tables = self.tables.lock().await;
        let raw: Vec<StoredRawFact> = tables.raw.values().cloned().collect();
        let existing = match mode {
            AggregationMode::Full => Vec::new(),
            AggregationMode::Incremental => tables.districts.values().cloned().collect(),
        };

        let plan = plan_aggregation(&raw, existing, mode);
        let summary = plan.summary(mode);
        if mode == AggregationMode::Full {
            tables.districts.clear();
            tables.states.clear();
        }
        for row in plan.district_rows {
            tables.districts.insert(row.key.clone(), row);
        }
        for row in plan.state_rows {
            tables.states.insert(row.key.clone(), row);
        }
        Ok(summary)
    }

    async fn table_counts(&self) -> Result<TableCounts, StoreError> {
        let tables = self.tables.lock().await;
        Ok(TableCounts {
            raw_rows: tables.raw.len() as i64,
            district_rows: tables.districts.len() as i64,
            state_rows: tables.states.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest_records;
    use nrega_core::RawRecord;
    use serde_json::json;

    fn page(households: &str) -> Vec<RawRecord> {
        ["1701", "1702"]
            .iter()
            .map(|code| {
                serde_json::from_value(json!({
                    "fin_year": "2023-24", "month": "Apr",
                    "state_code": "17", "state_name": "MP",
                    "district_code": code, "district_name": format!("District {code}"),
                    "Total_Households_Worked": households,
                    "Remarks": "NA"
                }))
                .expect("record json")
            })
            .collect()
    }

    #[tokio::test]
    async fn replace_ingestion_is_idempotent() {
        let store = MemoryStore::new();
        let first = ingest_records(&store, &page("10"), ConflictPolicy::Replace)
            .await
            .expect("first");
        assert_eq!(first.inserted, 2);

        let again = ingest_records(&store, &page("10"), ConflictPolicy::Replace)
            .await
            .expect("again");
        assert_eq!(again.inserted, 0);
        assert_eq!(again.updated, 2);
        assert_eq!(store.table_counts().await.expect("counts").raw_rows, 2);
    }

    #[tokio::test]
    async fn replace_keeps_creation_time_and_overwrites_measures() {
        let store = MemoryStore::new();
        ingest_records(&store, &page("10"), ConflictPolicy::Replace)
            .await
            .expect("first");
        let before = store.snapshot().await;
        ingest_records(&store, &page("25"), ConflictPolicy::Replace)
            .await
            .expect("second");
        let after = store.snapshot().await;

        for (key, old) in &before.raw {
            let new = &after.raw[key];
            assert_eq!(new.created_at, old.created_at);
            assert!(new.updated_at >= old.updated_at);
            assert_eq!(new.fact.measures.total_households_worked, Some(25.0));
        }
    }

    #[tokio::test]
    async fn skip_policy_leaves_existing_rows_alone() {
        let store = MemoryStore::new();
        ingest_records(&store, &page("10"), ConflictPolicy::Skip)
            .await
            .expect("first");
        let outcome = ingest_records(&store, &page("99"), ConflictPolicy::Skip)
            .await
            .expect("second");
        assert_eq!(outcome.skipped, 2);
        let tables = store.snapshot().await;
        assert!(tables
            .raw
            .values()
            .all(|row| row.fact.measures.total_households_worked == Some(10.0)));
    }

    #[tokio::test]
    async fn failed_write_leaves_tables_untouched() {
        let store = MemoryStore::new();
        ingest_records(&store, &page("10"), ConflictPolicy::Skip)
            .await
            .expect("seed");
        let before = store.snapshot().await;

        store.fail_next_write();
        let err = ingest_records(&store, &page("20"), ConflictPolicy::Replace).await;
        assert!(matches!(err, Err(StoreError::Unavailable(_))));
        assert_eq!(store.snapshot().await, before);

        store.fail_next_write();
        assert!(store.aggregate(AggregationMode::Full).await.is_err());
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn repeated_aggregation_is_identical() {
        let store = MemoryStore::new();
        ingest_records(&store, &page("10"), ConflictPolicy::Skip)
            .await
            .expect("seed");

        store.aggregate(AggregationMode::Full).await.expect("full");
        let once = store.snapshot().await;
        store.aggregate(AggregationMode::Full).await.expect("full again");
        assert_eq!(store.snapshot().await, once);

        let summary = store
            .aggregate(AggregationMode::Incremental)
            .await
            .expect("incremental");
        assert_eq!(store.snapshot().await, once);
        assert_eq!(summary.district_rows, 2);
        assert_eq!(summary.state_rows, 1);
        assert_eq!(summary.latest_rows, 2);
    }
}
