//! KPI arithmetic for the two derived layers.
//!
//! Every store calls into these functions; none of them recomputes KPIs on
//! its own, so the full rebuild and the incremental upsert cannot drift.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::{
    fiscal_sort_key, DistrictKpis, DistrictMonthPerformance, NaturalKey, RawMeasures,
    StateMonthAverages, StateMonthKey, StoredRawFact,
};

pub const PERCENT_CEILING: f64 = 100.0;

/// Measures arrive as `f64`; ratios and means are taken on their shortest
/// decimal rendering so half-cent ties round like `ROUND(x::NUMERIC, 2)`.
fn decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

/// Rounds half away from zero.
fn round_to(value: Decimal, places: u32) -> Decimal {
    value.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero)
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() || value <= 0.0 {
        0.0
    } else {
        value.min(PERCENT_CEILING)
    }
}

fn or_zero(value: Option<f64>) -> f64 {
    value.unwrap_or(0.0)
}

/// `part / whole * 100`, rounded and clamped; 0 when `whole` is missing or
/// not positive.
fn share_percent(part: Option<f64>, whole: Option<f64>) -> f64 {
    match whole {
        Some(whole) if whole > 0.0 => {
            let ratio = decimal(or_zero(part))
                .checked_div(decimal(whole))
                .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
                .unwrap_or(Decimal::ONE_HUNDRED);
            clamp_percent(round_to(ratio, 2).to_f64().unwrap_or_default())
        }
        _ => 0.0,
    }
}

/// Pure per-row KPI derivation.
pub fn district_kpis(m: &RawMeasures) -> DistrictKpis {
    DistrictKpis {
        families_worked: or_zero(m.total_households_worked),
        total_person_days: or_zero(m.persondays_of_central_liability_so_far),
        on_time_payment_percent: clamp_percent(or_zero(
            m.percentage_payments_gererated_within_15_days,
        )),
        total_expenditure: or_zero(m.total_exp),
        completed_works: or_zero(m.number_of_completed_works),
        ongoing_works: or_zero(m.number_of_ongoing_works),
        hundred_day_completion_rate: share_percent(
            m.total_no_of_hhs_completed_100_days_of_wage_employment,
            m.total_households_worked,
        ),
        households_completed_100_days: or_zero(
            m.total_no_of_hhs_completed_100_days_of_wage_employment,
        ),
        percent_women: share_percent(m.women_persondays, m.persondays_of_central_liability_so_far),
        percent_sc: share_percent(m.sc_persondays, m.persondays_of_central_liability_so_far),
        percent_st: share_percent(m.st_persondays, m.persondays_of_central_liability_so_far),
    }
}

/// District row for one stored raw fact. The latest-month flag starts out
/// false; [`mark_latest_months`] owns it.
pub fn derive_district_row(raw: &StoredRawFact) -> DistrictMonthPerformance {
    DistrictMonthPerformance {
        key: raw.fact.key.clone(),
        state_name: raw.fact.state_name.clone(),
        district_name: raw.fact.district_name.clone(),
        kpis: district_kpis(&raw.fact.measures),
        is_latest_month: false,
        created_at: raw.created_at,
    }
}

/// Keys of the newest row per `district_code`.
///
/// Newest means greatest creation timestamp; rows created in the same
/// instant are ordered by financial year and fiscal month, then by key.
pub fn latest_month_keys(rows: &[DistrictMonthPerformance]) -> BTreeSet<NaturalKey> {
    let mut newest: BTreeMap<&str, &DistrictMonthPerformance> = BTreeMap::new();
    for row in rows {
        let slot = newest.entry(row.key.district_code.as_str()).or_insert(row);
        if recency(row) > recency(*slot) {
            *slot = row;
        }
    }
    newest.into_values().map(|row| row.key.clone()).collect()
}

fn recency(
    row: &DistrictMonthPerformance,
) -> (chrono::DateTime<chrono::Utc>, (Option<i32>, Option<u8>), &NaturalKey) {
    (
        row.created_at,
        fiscal_sort_key(&row.key.fin_year, &row.key.month),
        &row.key,
    )
}

/// Sets `is_latest_month` on exactly one row per district and clears it on
/// every other row.
pub fn mark_latest_months(rows: &mut [DistrictMonthPerformance]) {
    let latest = latest_month_keys(rows);
    for row in rows.iter_mut() {
        row.is_latest_month = latest.contains(&row.key);
    }
}

/// Unweighted mean of every district row sharing (fin_year, month,
/// state_code). Output is ordered by that key.
pub fn state_averages(rows: &[DistrictMonthPerformance]) -> Vec<StateMonthAverages> {
    let mut groups: BTreeMap<StateMonthKey, Vec<&DistrictMonthPerformance>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.key.state_month()).or_default().push(row);
    }

    groups
        .into_iter()
        .map(|(key, mut members)| {
            // Summation order is fixed so reruns are bit-identical.
            members.sort_by(|a, b| a.key.district_code.cmp(&b.key.district_code));
            let count = Decimal::from(members.len());
            let mean = |pick: fn(&DistrictKpis) -> f64| {
                let total = members
                    .iter()
                    .fold(Decimal::ZERO, |sum, row| sum.saturating_add(decimal(pick(&row.kpis))));
                total.checked_div(count).unwrap_or_default()
            };
            let mean2 = |pick: fn(&DistrictKpis) -> f64| {
                round_to(mean(pick), 2).to_f64().unwrap_or_default()
            };
            StateMonthAverages {
                state_name: members.iter().find_map(|row| row.state_name.clone()),
                district_count: members.len(),
                avg_families_worked: mean2(|k| k.families_worked),
                avg_total_person_days: round_to(mean(|k| k.total_person_days), 0)
                    .to_i64()
                    .unwrap_or_default(),
                avg_on_time_payment_percent: mean2(|k| k.on_time_payment_percent),
                avg_total_expenditure: mean2(|k| k.total_expenditure),
                avg_completed_works: mean2(|k| k.completed_works),
                avg_ongoing_works: mean2(|k| k.ongoing_works),
                avg_hundred_day_completion_rate: mean2(|k| k.hundred_day_completion_rate),
                avg_households_completed_100_days: mean2(|k| k.households_completed_100_days),
                avg_percent_women: mean2(|k| k.percent_women),
                avg_percent_sc: mean2(|k| k.percent_sc),
                avg_percent_st: mean2(|k| k.percent_st),
                key,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RawFact, RawRecord};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn stored(value: serde_json::Value, created_secs: i64) -> StoredRawFact {
        let record: RawRecord = serde_json::from_value(value).expect("record json");
        let at = Utc.timestamp_opt(created_secs, 0).single().expect("ts");
        StoredRawFact {
            fact: record.normalize().expect("normalizes"),
            created_at: at,
            updated_at: at,
        }
    }

    fn district(district_code: &str, fin_year: &str, month: &str, created_secs: i64) -> DistrictMonthPerformance {
        derive_district_row(&stored(
            json!({
                "fin_year": fin_year, "month": month,
                "state_code": "17", "district_code": district_code
            }),
            created_secs,
        ))
    }

    #[test]
    fn all_na_record_yields_zero_kpis() {
        let mut fields = serde_json::Map::new();
        for key in ["fin_year", "month", "state_code", "district_code"] {
            fields.insert(key.into(), json!("x"));
        }
        for name in RawMeasures::UPSTREAM_FIELDS {
            fields.insert((*name).into(), json!("NA"));
        }
        let fact: RawFact = RawRecord::new(fields).normalize().expect("normalizes");
        let kpis = district_kpis(&fact.measures);
        assert_eq!(kpis, DistrictKpis::default());
    }

    #[test]
    fn inconsistent_denominators_are_clamped() {
        let row = stored(
            json!({
                "fin_year": "2023-24", "month": "Apr", "state_code": "17", "district_code": "1701",
                "Persondays_of_Central_Liability_so_far": "1000",
                "Women_Persondays": "2500",
                "SC_persondays": "-40",
                "Total_Households_Worked": "10",
                "Total_No_of_HHs_completed_100_Days_of_Wage_Employment": "12",
                "percentage_payments_gererated_within_15_days": "140.2"
            }),
            0,
        );
        let kpis = district_kpis(&row.fact.measures);
        assert_eq!(kpis.percent_women, 100.0);
        assert_eq!(kpis.percent_sc, 0.0);
        assert_eq!(kpis.hundred_day_completion_rate, 100.0);
        assert_eq!(kpis.on_time_payment_percent, 100.0);
    }

    #[test]
    fn ratios_round_to_two_decimals() {
        let row = stored(
            json!({
                "fin_year": "2023-24", "month": "Apr", "state_code": "17", "district_code": "1701",
                "Persondays_of_Central_Liability_so_far": 3,
                "Women_Persondays": 1,
                "ST_persondays": 2,
                "Total_Households_Worked": 0,
                "Total_No_of_HHs_completed_100_Days_of_Wage_Employment": 5
            }),
            0,
        );
        let kpis = district_kpis(&row.fact.measures);
        assert_eq!(kpis.percent_women, 33.33);
        assert_eq!(kpis.percent_st, 66.67);
        assert_eq!(kpis.percent_sc, 0.0);
        assert_eq!(kpis.hundred_day_completion_rate, 0.0);
        assert_eq!(kpis.households_completed_100_days, 5.0);
    }

    #[test]
    fn half_cent_ratios_round_away_from_zero() {
        let row = stored(
            json!({
                "fin_year": "2023-24", "month": "Apr", "state_code": "17", "district_code": "1701",
                "Persondays_of_Central_Liability_so_far": 800,
                "Women_Persondays": 29,
                "SC_persondays": 57,
                "ST_persondays": 113,
                "Total_Households_Worked": 8,
                "Total_No_of_HHs_completed_100_Days_of_Wage_Employment": 1
            }),
            0,
        );
        let kpis = district_kpis(&row.fact.measures);
        assert_eq!(kpis.percent_women, 3.63);
        assert_eq!(kpis.percent_sc, 7.13);
        assert_eq!(kpis.percent_st, 14.13);
        assert_eq!(kpis.hundred_day_completion_rate, 12.5);
    }

    #[test]
    fn state_means_round_half_cents_up() {
        let mut rows: Vec<_> = (1..=8)
            .map(|n| district(&format!("17{n:02}"), "2023-24", "Apr", 0))
            .collect();
        rows[0].kpis.total_expenditure = 29.0;
        rows[0].kpis.total_person_days = 12.0;

        let averages = state_averages(&rows);
        assert_eq!(averages[0].district_count, 8);
        assert_eq!(averages[0].avg_total_expenditure, 3.63);
        assert_eq!(averages[0].avg_total_person_days, 2);
    }

    #[test]
    fn state_average_is_unweighted_mean() {
        let mut a = district("1701", "2023-24", "Apr", 0);
        let mut b = district("1702", "2023-24", "Apr", 0);
        a.kpis.families_worked = 100.0;
        b.kpis.families_worked = 300.0;
        a.kpis.total_person_days = 10.0;
        b.kpis.total_person_days = 15.0;
        a.kpis.percent_women = 33.0;
        b.kpis.percent_women = 50.5;

        let averages = state_averages(&[a, b]);
        assert_eq!(averages.len(), 1);
        assert_eq!(averages[0].avg_families_worked, 200.0);
        assert_eq!(averages[0].avg_total_person_days, 13);
        assert_eq!(averages[0].avg_percent_women, 41.75);
        assert_eq!(averages[0].district_count, 2);
    }

    #[test]
    fn state_averages_group_by_state_and_month() {
        let rows = vec![
            district("1701", "2023-24", "Apr", 0),
            district("1702", "2023-24", "Apr", 0),
            district("1701", "2023-24", "May", 0),
        ];
        let averages = state_averages(&rows);
        assert_eq!(averages.len(), 2);
        assert_eq!(averages[0].key.month, "Apr");
        assert_eq!(averages[0].district_count, 2);
        assert_eq!(averages[1].district_count, 1);
    }

    #[test]
    fn latest_month_follows_creation_time_not_calendar() {
        let mut rows = vec![
            district("1701", "2024-25", "May", 100),
            // Correction reload of an older month, ingested later.
            district("1701", "2023-24", "Jan", 200),
            district("1702", "2023-24", "Jan", 50),
        ];
        mark_latest_months(&mut rows);
        assert!(!rows[0].is_latest_month);
        assert!(rows[1].is_latest_month);
        assert!(rows[2].is_latest_month);
    }

    #[test]
    fn creation_ties_fall_back_to_fiscal_order() {
        let mut rows = vec![
            district("1701", "2023-24", "Mar", 100),
            district("1701", "2023-24", "Apr", 100),
            district("1701", "2023-24", "Dec", 100),
        ];
        mark_latest_months(&mut rows);
        let flagged: Vec<_> = rows.iter().filter(|r| r.is_latest_month).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].key.month, "Mar");
    }
}
