use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nrega_core::{
    ConflictPolicy, DistrictKpis, DistrictMonthPerformance, NaturalKey, RawFact, RawMeasures,
    StateMonthAverages, StoredRawFact,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{info, warn};

use crate::{
    plan_aggregation, AggregationMode, AggregationSummary, DatabaseConfig, IngestOutcome,
    PipelineStore, StoreError, TableCounts,
};

const RAW_TABLE: &str = "mgnrega_data";
const DISTRICT_TABLE: &str = "district_monthly_performance";
const STATE_TABLE: &str = "state_monthly_averages";

const KEY_COLUMNS: &str = "fin_year, month, state_code, district_code";

// Postgres caps a statement at 65535 bind parameters.
const RAW_CHUNK_ROWS: usize = 1_000;
const DISTRICT_CHUNK_ROWS: usize = 2_000;
const STATE_CHUNK_ROWS: usize = 2_000;

const KPI_COLUMNS: [&str; 11] = [
    "families_worked",
    "total_person_days",
    "on_time_payment_percent",
    "total_expenditure",
    "completed_works",
    "ongoing_works",
    "hundred_day_completion_rate",
    "households_completed_100_days",
    "percent_women",
    "percent_sc",
    "percent_st",
];

const STATE_AVG_COLUMNS: [&str; 11] = [
    "avg_families_worked",
    "avg_total_person_days",
    "avg_on_time_payment_percent",
    "avg_total_expenditure",
    "avg_completed_works",
    "avg_ongoing_works",
    "avg_hundred_day_completion_rate",
    "avg_households_completed_100_days",
    "avg_percent_women",
    "avg_percent_sc",
    "avg_percent_st",
];

/// Postgres-backed [`PipelineStore`] over a shared, explicitly constructed
/// connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn insert_raw_facts(
        &self,
        facts: &[RawFact],
        policy: ConflictPolicy,
    ) -> Result<IngestOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        match insert_raw_chunks(&mut tx, facts, policy).await {
            Ok((inserted, updated)) => {
                tx.commit().await?;
                Ok(IngestOutcome {
                    received: facts.len(),
                    inserted,
                    updated,
                    skipped: facts.len().saturating_sub(inserted + updated),
                    malformed: 0,
                })
            }
            Err(err) => {
                rollback(tx, "raw batch insert").await;
                Err(err.into())
            }
        }
    }

    async fn aggregate(&self, mode: AggregationMode) -> Result<AggregationSummary, StoreError> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;
        match recompute(&mut tx, mode).await {
            Ok(summary) => {
                tx.commit().await?;
                info!(
                    ?mode,
                    district_rows = summary.district_rows,
                    state_rows = summary.state_rows,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "aggregation committed"
                );
                Ok(summary)
            }
            Err(err) => {
                rollback(tx, "aggregation").await;
                Err(err.into())
            }
        }
    }

    async fn table_counts(&self) -> Result<TableCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM mgnrega_data) AS raw_rows,
                   (SELECT COUNT(*) FROM district_monthly_performance) AS district_rows,
                   (SELECT COUNT(*) FROM state_monthly_averages) AS state_rows
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(TableCounts {
            raw_rows: row.try_get("raw_rows")?,
            district_rows: row.try_get("district_rows")?,
            state_rows: row.try_get("state_rows")?,
        })
    }
}

async fn rollback(tx: Transaction<'static, Postgres>, step: &str) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, step, "rollback failed; connection will be discarded");
    }
}

fn raw_columns() -> Vec<&'static str> {
    let mut columns = vec![
        "fin_year",
        "month",
        "state_code",
        "state_name",
        "district_code",
        "district_name",
    ];
    columns.extend_from_slice(RawMeasures::COLUMNS);
    columns.push("remarks");
    columns
}

/// Conflict handling for the raw insert. Replace touches the measures,
/// `remarks` and `updated_at`; names and `created_at` keep their first value.
fn raw_conflict_clause(policy: ConflictPolicy) -> String {
    match policy {
        ConflictPolicy::Skip => format!(" ON CONFLICT ({KEY_COLUMNS}) DO NOTHING"),
        ConflictPolicy::Replace => {
            let mut updated: Vec<&str> = RawMeasures::COLUMNS.to_vec();
            updated.push("remarks");
            format!(
                " ON CONFLICT ({KEY_COLUMNS}) DO UPDATE SET updated_at = NOW(), {}",
                update_set(&updated)
            )
        }
    }
}

fn raw_insert_query(chunk: &[RawFact], policy: ConflictPolicy) -> QueryBuilder<'static, Postgres> {
    let mut qb: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("INSERT INTO {RAW_TABLE} ({}) ", raw_columns().join(", ")));
    qb.push_values(chunk, |mut row, fact| {
        row.push_bind(fact.key.fin_year.clone())
            .push_bind(fact.key.month.clone())
            .push_bind(fact.key.state_code.clone())
            .push_bind(fact.state_name.clone())
            .push_bind(fact.key.district_code.clone())
            .push_bind(fact.district_name.clone());
        for value in fact.measures.values() {
            row.push_bind(value);
        }
        row.push_bind(fact.remarks.clone());
    });
    qb.push(raw_conflict_clause(policy));
    // DO NOTHING returns only inserted rows; xmax = 0 tells inserts from updates.
    qb.push(" RETURNING (xmax = 0) AS inserted");
    qb
}

async fn insert_raw_chunks(
    tx: &mut Transaction<'static, Postgres>,
    facts: &[RawFact],
    policy: ConflictPolicy,
) -> Result<(usize, usize), sqlx::Error> {
    let mut inserted = 0usize;
    let mut updated = 0usize;
    for chunk in facts.chunks(RAW_CHUNK_ROWS) {
        let mut qb = raw_insert_query(chunk, policy);
        let rows = qb.build().fetch_all(&mut **tx).await?;
        for row in &rows {
            if row.try_get::<bool, _>("inserted")? {
                inserted += 1;
            } else {
                updated += 1;
            }
        }
    }
    Ok((inserted, updated))
}

async fn recompute(
    tx: &mut Transaction<'static, Postgres>,
    mode: AggregationMode,
) -> Result<AggregationSummary, sqlx::Error> {
    let raw = load_raw_facts(tx).await?;
    let existing = match mode {
        AggregationMode::Full => {
            sqlx::query(&format!("TRUNCATE TABLE {DISTRICT_TABLE}, {STATE_TABLE} RESTART IDENTITY"))
                .execute(&mut **tx)
                .await?;
            Vec::new()
        }
        AggregationMode::Incremental => load_district_rows(tx).await?,
    };

    let plan = plan_aggregation(&raw, existing, mode);
    upsert_district_rows(tx, &plan.district_rows).await?;
    upsert_state_rows(tx, &plan.state_rows).await?;
    Ok(plan.summary(mode))
}

async fn load_raw_facts(tx: &mut Transaction<'static, Postgres>) -> Result<Vec<StoredRawFact>, sqlx::Error> {
    let query = format!(
        "SELECT {}, created_at, updated_at FROM {RAW_TABLE} ORDER BY {KEY_COLUMNS}",
        raw_columns().join(", ")
    );
    let rows = sqlx::query(&query).fetch_all(&mut **tx).await?;
    rows.iter().map(raw_fact_from_row).collect()
}

fn raw_fact_from_row(row: &PgRow) -> Result<StoredRawFact, sqlx::Error> {
    let mut values = Vec::with_capacity(RawMeasures::COLUMNS.len());
    for column in RawMeasures::COLUMNS {
        values.push(row.try_get::<Option<f64>, _>(*column)?);
    }
    Ok(StoredRawFact {
        fact: RawFact {
            key: key_from_row(row)?,
            state_name: row.try_get("state_name")?,
            district_name: row.try_get("district_name")?,
            measures: RawMeasures::from_values(&values),
            remarks: row.try_get("remarks")?,
        },
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn key_from_row(row: &PgRow) -> Result<NaturalKey, sqlx::Error> {
    Ok(NaturalKey {
        fin_year: row.try_get("fin_year")?,
        month: row.try_get("month")?,
        state_code: row.try_get("state_code")?,
        district_code: row.try_get("district_code")?,
    })
}

async fn load_district_rows(
    tx: &mut Transaction<'static, Postgres>,
) -> Result<Vec<DistrictMonthPerformance>, sqlx::Error> {
    let query = format!(
        "SELECT {KEY_COLUMNS}, state_name, district_name, {}, is_latest_month, created_at \
         FROM {DISTRICT_TABLE} ORDER BY {KEY_COLUMNS}",
        KPI_COLUMNS.join(", ")
    );
    let rows = sqlx::query(&query).fetch_all(&mut **tx).await?;
    rows.iter()
        .map(|row| {
            Ok(DistrictMonthPerformance {
                key: key_from_row(row)?,
                state_name: row.try_get("state_name")?,
                district_name: row.try_get("district_name")?,
                kpis: DistrictKpis {
                    families_worked: row.try_get("families_worked")?,
                    total_person_days: row.try_get("total_person_days")?,
                    on_time_payment_percent: row.try_get("on_time_payment_percent")?,
                    total_expenditure: row.try_get("total_expenditure")?,
                    completed_works: row.try_get("completed_works")?,
                    ongoing_works: row.try_get("ongoing_works")?,
                    hundred_day_completion_rate: row.try_get("hundred_day_completion_rate")?,
                    households_completed_100_days: row.try_get("households_completed_100_days")?,
                    percent_women: row.try_get("percent_women")?,
                    percent_sc: row.try_get("percent_sc")?,
                    percent_st: row.try_get("percent_st")?,
                },
                is_latest_month: row.try_get("is_latest_month")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

fn update_set(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn upsert_district_rows(
    tx: &mut Transaction<'static, Postgres>,
    rows: &[DistrictMonthPerformance],
) -> Result<(), sqlx::Error> {
    let mut updatable = vec!["state_name", "district_name"];
    updatable.extend_from_slice(&KPI_COLUMNS);
    updatable.extend_from_slice(&["is_latest_month", "created_at"]);
    let conflict_clause = format!(" ON CONFLICT ({KEY_COLUMNS}) DO UPDATE SET {}", update_set(&updatable));

    for chunk in rows.chunks(DISTRICT_CHUNK_ROWS) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {DISTRICT_TABLE} ({KEY_COLUMNS}, state_name, district_name, {}, is_latest_month, created_at) ",
            KPI_COLUMNS.join(", ")
        ));
        qb.push_values(chunk, |mut b, row| {
            let k = &row.kpis;
            b.push_bind(row.key.fin_year.clone())
                .push_bind(row.key.month.clone())
                .push_bind(row.key.state_code.clone())
                .push_bind(row.key.district_code.clone())
                .push_bind(row.state_name.clone())
                .push_bind(row.district_name.clone())
                .push_bind(k.families_worked)
                .push_bind(k.total_person_days)
                .push_bind(k.on_time_payment_percent)
                .push_bind(k.total_expenditure)
                .push_bind(k.completed_works)
                .push_bind(k.ongoing_works)
                .push_bind(k.hundred_day_completion_rate)
                .push_bind(k.households_completed_100_days)
                .push_bind(k.percent_women)
                .push_bind(k.percent_sc)
                .push_bind(k.percent_st)
                .push_bind(row.is_latest_month)
                .push_bind(row.created_at);
        });
        qb.push(&conflict_clause);
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn upsert_state_rows(
    tx: &mut Transaction<'static, Postgres>,
    rows: &[StateMonthAverages],
) -> Result<(), sqlx::Error> {
    let mut updatable = vec!["state_name", "district_count"];
    updatable.extend_from_slice(&STATE_AVG_COLUMNS);
    let conflict_clause = format!(
        " ON CONFLICT (fin_year, month, state_code) DO UPDATE SET {}",
        update_set(&updatable)
    );

    for chunk in rows.chunks(STATE_CHUNK_ROWS) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {STATE_TABLE} (fin_year, month, state_code, state_name, district_count, {}) ",
            STATE_AVG_COLUMNS.join(", ")
        ));
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.key.fin_year.clone())
                .push_bind(row.key.month.clone())
                .push_bind(row.key.state_code.clone())
                .push_bind(row.state_name.clone())
                .push_bind(i32::try_from(row.district_count).unwrap_or(i32::MAX))
                .push_bind(row.avg_families_worked)
                .push_bind(row.avg_total_person_days)
                .push_bind(row.avg_on_time_payment_percent)
                .push_bind(row.avg_total_expenditure)
                .push_bind(row.avg_completed_works)
                .push_bind(row.avg_ongoing_works)
                .push_bind(row.avg_hundred_day_completion_rate)
                .push_bind(row.avg_households_completed_100_days)
                .push_bind(row.avg_percent_women)
                .push_bind(row.avg_percent_sc)
                .push_bind(row.avg_percent_st);
        });
        qb.push(&conflict_clause);
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_column_list_matches_bind_order() {
        let columns = raw_columns();
        assert_eq!(columns.len(), 36);
        assert_eq!(columns[0], "fin_year");
        assert_eq!(columns[6], RawMeasures::COLUMNS[0]);
        assert_eq!(columns.last(), Some(&"remarks"));
        assert!(RAW_CHUNK_ROWS * columns.len() < u16::MAX as usize);
    }

    #[test]
    fn derived_chunks_stay_under_the_bind_limit() {
        assert!(DISTRICT_CHUNK_ROWS * (4 + 2 + KPI_COLUMNS.len() + 2) < u16::MAX as usize);
        assert!(STATE_CHUNK_ROWS * (3 + 2 + STATE_AVG_COLUMNS.len()) < u16::MAX as usize);
    }

    fn fact(district_code: &str) -> RawFact {
        RawFact {
            key: NaturalKey {
                fin_year: "2024-2025".into(),
                month: "Aug".into(),
                state_code: "33".into(),
                district_code: district_code.into(),
            },
            state_name: Some("TAMIL NADU".into()),
            district_name: None,
            measures: RawMeasures::default(),
            remarks: None,
        }
    }

    #[test]
    fn skip_insert_leaves_existing_rows_alone() {
        let clause = raw_conflict_clause(ConflictPolicy::Skip);
        assert_eq!(
            clause,
            " ON CONFLICT (fin_year, month, state_code, district_code) DO NOTHING"
        );
    }

    #[test]
    fn replace_insert_overwrites_measures_but_not_identity() {
        let clause = raw_conflict_clause(ConflictPolicy::Replace);
        assert!(clause.contains("DO UPDATE SET updated_at = NOW(), "));
        for column in RawMeasures::COLUMNS {
            assert!(clause.contains(&format!("{column} = EXCLUDED.{column}")), "{column}");
        }
        assert!(clause.ends_with("remarks = EXCLUDED.remarks"));
        for kept in ["state_name", "district_name", "created_at"] {
            assert!(!clause.contains(&format!("{kept} = ")), "{kept}");
        }
    }

    #[test]
    fn raw_insert_reports_inserted_flag_per_row() {
        let facts = vec![fact("3301"), fact("3302")];
        let qb = raw_insert_query(&facts, ConflictPolicy::Replace);
        let sql = qb.sql();
        assert!(sql.starts_with("INSERT INTO mgnrega_data (fin_year, month, state_code, state_name,"));
        assert!(sql.ends_with(" RETURNING (xmax = 0) AS inserted"));
        // 36 columns per row, two rows.
        assert!(sql.contains("$72"));
        assert!(!sql.contains("$73"));
    }

    #[test]
    fn upsert_clause_covers_every_listed_column() {
        let clause = update_set(&["a", "b"]);
        assert_eq!(clause, "a = EXCLUDED.a, b = EXCLUDED.b");
    }
}
