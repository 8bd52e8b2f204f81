//! Core domain model for the MGNREGA ingestion pipeline: upstream records,
//! normalized raw facts, derived KPI rows, and the normalizers shared by
//! every layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod kpi;

pub use kpi::{derive_district_row, district_kpis, mark_latest_months, state_averages};

pub const CRATE_NAME: &str = "nrega-core";

/// Sentinel the upstream feed uses for "not available".
pub const NOT_AVAILABLE: &str = "NA";

/// Numeric Normalizer.
///
/// Maps an upstream scalar to a finite number or `None`. Absent values, empty
/// strings, the `"NA"` sentinel, garbage text, non-finite numbers and
/// non-scalar JSON all become `None`. Zero-coalescing is left to the KPI
/// arithmetic.
pub fn parse_number(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() || text.eq_ignore_ascii_case(NOT_AVAILABLE) {
                None
            } else {
                text.parse::<f64>().ok()
            }
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

struct MonthName {
    canonical: &'static str,
    full: &'static str,
    aliases: &'static [&'static str],
    fiscal_ordinal: u8,
}

// Fiscal order: April opens the financial year, March closes it.
const MONTHS: [MonthName; 12] = [
    MonthName { canonical: "Apr", full: "April", aliases: &[], fiscal_ordinal: 1 },
    MonthName { canonical: "May", full: "May", aliases: &[], fiscal_ordinal: 2 },
    MonthName { canonical: "Jun", full: "June", aliases: &[], fiscal_ordinal: 3 },
    MonthName { canonical: "July", full: "July", aliases: &["Jul"], fiscal_ordinal: 4 },
    MonthName { canonical: "Aug", full: "August", aliases: &[], fiscal_ordinal: 5 },
    MonthName { canonical: "Sep", full: "September", aliases: &["Sept"], fiscal_ordinal: 6 },
    MonthName { canonical: "Oct", full: "October", aliases: &[], fiscal_ordinal: 7 },
    MonthName { canonical: "Nov", full: "November", aliases: &[], fiscal_ordinal: 8 },
    MonthName { canonical: "Dec", full: "December", aliases: &[], fiscal_ordinal: 9 },
    MonthName { canonical: "Jan", full: "January", aliases: &[], fiscal_ordinal: 10 },
    MonthName { canonical: "Feb", full: "February", aliases: &[], fiscal_ordinal: 11 },
    MonthName { canonical: "Mar", full: "March", aliases: &[], fiscal_ordinal: 12 },
];

fn lookup_month(token: &str) -> Option<&'static MonthName> {
    let token = token.trim();
    MONTHS.iter().find(|m| {
        token.eq_ignore_ascii_case(m.full)
            || token.eq_ignore_ascii_case(m.canonical)
            || m.aliases.iter().any(|alias| token.eq_ignore_ascii_case(alias))
    })
}

/// Month Normalizer. Unrecognized tokens pass through unchanged.
pub fn normalize_month(token: &str) -> String {
    match lookup_month(token) {
        Some(month) => month.canonical.to_string(),
        None => token.to_string(),
    }
}

/// Position of a month inside the financial year (April = 1 ... March = 12).
///
/// This is the only month ordering in the workspace; anything that sorts or
/// compares months goes through here.
pub fn fiscal_month_ordinal(month: &str) -> Option<u8> {
    lookup_month(month).map(|m| m.fiscal_ordinal)
}

/// Opening calendar year of a financial year label such as `"2023-24"`.
pub fn fin_year_start(fin_year: &str) -> Option<i32> {
    fin_year.trim().split('-').next()?.trim().parse().ok()
}

/// Chronological sort key for a (financial year, month) pair. Unparseable
/// parts sort before every valid one.
pub fn fiscal_sort_key(fin_year: &str, month: &str) -> (Option<i32>, Option<u8>) {
    (fin_year_start(fin_year), fiscal_month_ordinal(month))
}

/// Natural key shared by the raw table and the district table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub fin_year: String,
    pub month: String,
    pub state_code: String,
    pub district_code: String,
}

impl NaturalKey {
    pub fn state_month(&self) -> StateMonthKey {
        StateMonthKey {
            fin_year: self.fin_year.clone(),
            month: self.month.clone(),
            state_code: self.state_code.clone(),
        }
    }
}

/// Natural key of the state averages table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateMonthKey {
    pub fin_year: String,
    pub month: String,
    pub state_code: String,
}

macro_rules! raw_measures {
    ($($column:ident => $upstream:literal),+ $(,)?) => {
        /// Normalized measure columns of one raw observation.
        #[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
        pub struct RawMeasures {
            $(pub $column: Option<f64>,)+
        }

        impl RawMeasures {
            /// Database column names, in bind order.
            pub const COLUMNS: &'static [&'static str] = &[$(stringify!($column)),+];

            /// Upstream field names, same order as [`RawMeasures::COLUMNS`].
            /// These are case-sensitive and must stay verbatim.
            pub const UPSTREAM_FIELDS: &'static [&'static str] = &[$($upstream),+];

            pub fn values(&self) -> Vec<Option<f64>> {
                vec![$(self.$column),+]
            }

            /// Rebuilds measures from values in [`RawMeasures::COLUMNS`] order.
            pub fn from_values(values: &[Option<f64>]) -> Self {
                let mut values = values.iter().copied();
                Self {
                    $($column: values.next().flatten(),)+
                }
            }

            fn from_upstream(fields: &Map<String, Value>) -> Self {
                Self {
                    $($column: parse_number(fields.get($upstream)),)+
                }
            }
        }
    };
}

raw_measures! {
    approved_labour_budget => "Approved_Labour_Budget",
    average_wage_rate_per_day_per_person => "Average_Wage_rate_per_day_per_person",
    average_days_of_employment_provided_per_household => "Average_days_of_employment_provided_per_Household",
    differently_abled_persons_worked => "Differently_abled_persons_worked",
    material_and_skilled_wages => "Material_and_skilled_Wages",
    number_of_completed_works => "Number_of_Completed_Works",
    number_of_ongoing_works => "Number_of_Ongoing_Works",
    number_of_gps_with_nil_exp => "Number_of_GPs_with_NIL_exp",
    persondays_of_central_liability_so_far => "Persondays_of_Central_Liability_so_far",
    sc_persondays => "SC_persondays",
    sc_workers_against_active_workers => "SC_workers_against_active_workers",
    st_persondays => "ST_persondays",
    st_workers_against_active_workers => "ST_workers_against_active_workers",
    total_adm_expenditure => "Total_Adm_Expenditure",
    total_exp => "Total_Exp",
    total_households_worked => "Total_Households_Worked",
    total_individuals_worked => "Total_Individuals_Worked",
    total_no_of_active_job_cards => "Total_No_of_Active_Job_Cards",
    total_no_of_active_workers => "Total_No_of_Active_Workers",
    total_no_of_hhs_completed_100_days_of_wage_employment => "Total_No_of_HHs_completed_100_Days_of_Wage_Employment",
    total_no_of_jobcards_issued => "Total_No_of_JobCards_issued",
    total_no_of_workers => "Total_No_of_Workers",
    total_no_of_works_takenup => "Total_No_of_Works_Takenup",
    wages => "Wages",
    women_persondays => "Women_Persondays",
    percent_of_category_b_works => "percent_of_Category_B_Works",
    percent_of_expenditure_on_agriculture_allied_works => "percent_of_Expenditure_on_Agriculture_Allied_Works",
    percent_of_nrm_expenditure => "percent_of_NRM_Expenditure",
    percentage_payments_gererated_within_15_days => "percentage_payments_gererated_within_15_days",
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("upstream record is missing `{0}`")]
    MissingField(&'static str),
}

/// One record exactly as the upstream API returned it.
///
/// Kept as the raw JSON object so that field names survive verbatim and a
/// badly typed field never fails decoding of the whole record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    pub fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Text view of a field; numbers are rendered, blanks become `None`.
    pub fn text(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn required_text(&self, name: &'static str) -> Result<String, RecordError> {
        self.text(name).ok_or(RecordError::MissingField(name))
    }

    /// Applies the Month and Numeric Normalizers and produces the row that
    /// the Raw Record Store persists.
    pub fn normalize(&self) -> Result<RawFact, RecordError> {
        let key = NaturalKey {
            fin_year: self.required_text("fin_year")?,
            month: normalize_month(&self.required_text("month")?),
            state_code: self.required_text("state_code")?,
            district_code: self.required_text("district_code")?,
        };
        Ok(RawFact {
            key,
            state_name: self.text("state_name"),
            district_name: self.text("district_name"),
            measures: RawMeasures::from_upstream(&self.fields),
            remarks: self.text("Remarks"),
        })
    }
}

/// Normalized raw observation, ready to be written to `mgnrega_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFact {
    pub key: NaturalKey,
    pub state_name: Option<String>,
    pub district_name: Option<String>,
    pub measures: RawMeasures,
    pub remarks: Option<String>,
}

/// A raw fact as stored, with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRawFact {
    pub fact: RawFact,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The eleven per-district KPI columns.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DistrictKpis {
    pub families_worked: f64,
    pub total_person_days: f64,
    pub on_time_payment_percent: f64,
    pub total_expenditure: f64,
    pub completed_works: f64,
    pub ongoing_works: f64,
    pub hundred_day_completion_rate: f64,
    pub households_completed_100_days: f64,
    pub percent_women: f64,
    pub percent_sc: f64,
    pub percent_st: f64,
}

/// Row of `district_monthly_performance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistrictMonthPerformance {
    pub key: NaturalKey,
    pub state_name: Option<String>,
    pub district_name: Option<String>,
    pub kpis: DistrictKpis,
    pub is_latest_month: bool,
    /// Creation time of the raw row this was derived from.
    pub created_at: DateTime<Utc>,
}

/// Row of `state_monthly_averages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMonthAverages {
    pub key: StateMonthKey,
    pub state_name: Option<String>,
    pub district_count: usize,
    pub avg_families_worked: f64,
    pub avg_total_person_days: i64,
    pub avg_on_time_payment_percent: f64,
    pub avg_total_expenditure: f64,
    pub avg_completed_works: f64,
    pub avg_ongoing_works: f64,
    pub avg_hundred_day_completion_rate: f64,
    pub avg_households_completed_100_days: f64,
    pub avg_percent_women: f64,
    pub avg_percent_sc: f64,
    pub avg_percent_st: f64,
}

/// What to do when a raw row's natural key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// `ON CONFLICT DO NOTHING`: first-seen data stays authoritative.
    Skip,
    /// `ON CONFLICT DO UPDATE`: overwrite every measure and bump `updated_at`.
    Replace,
}

impl ConflictPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip" | "do-nothing" | "do_nothing" | "nothing" => Some(Self::Skip),
            "replace" | "do-update" | "do_update" | "update" => Some(Self::Replace),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        serde_json::from_value(value).expect("record json")
    }

    #[test]
    fn numeric_normalizer_handles_every_upstream_shape() {
        assert_eq!(parse_number(None), None);
        assert_eq!(parse_number(Some(&json!(null))), None);
        assert_eq!(parse_number(Some(&json!(""))), None);
        assert_eq!(parse_number(Some(&json!("NA"))), None);
        assert_eq!(parse_number(Some(&json!("  42.5 "))), Some(42.5));
        assert_eq!(parse_number(Some(&json!(17))), Some(17.0));
        assert_eq!(parse_number(Some(&json!("-3"))), Some(-3.0));
        assert_eq!(parse_number(Some(&json!("12 lakh"))), None);
        assert_eq!(parse_number(Some(&json!("NaN"))), None);
        assert_eq!(parse_number(Some(&json!("inf"))), None);
        assert_eq!(parse_number(Some(&json!(true))), None);
        assert_eq!(parse_number(Some(&json!({"nested": 1}))), None);
    }

    #[test]
    fn zero_is_a_value_not_a_missing_marker() {
        assert_eq!(parse_number(Some(&json!("0"))), Some(0.0));
        assert_eq!(parse_number(Some(&json!(0))), Some(0.0));
    }

    #[test]
    fn month_normalizer_maps_spellings_to_one_form() {
        assert_eq!(normalize_month("January"), "Jan");
        assert_eq!(normalize_month("january"), "Jan");
        assert_eq!(normalize_month("JAN"), "Jan");
        assert_eq!(normalize_month("June"), "Jun");
        assert_eq!(normalize_month("July"), "July");
        assert_eq!(normalize_month("jul"), "July");
        assert_eq!(normalize_month("Sept"), "Sep");
        assert_eq!(normalize_month("may"), "May");
    }

    #[test]
    fn unknown_month_passes_through_unchanged() {
        assert_eq!(normalize_month("Month-13"), "Month-13");
        assert_eq!(normalize_month(""), "");
        assert_eq!(fiscal_month_ordinal("Month-13"), None);
    }

    #[test]
    fn fiscal_ordinal_starts_in_april() {
        assert_eq!(fiscal_month_ordinal("April"), Some(1));
        assert_eq!(fiscal_month_ordinal("Dec"), Some(9));
        assert_eq!(fiscal_month_ordinal("march"), Some(12));
        assert!(fiscal_sort_key("2023-24", "Mar") > fiscal_sort_key("2023-24", "Apr"));
        assert!(fiscal_sort_key("2024-25", "Apr") > fiscal_sort_key("2023-24", "Mar"));
        assert_eq!(fin_year_start("2023-24"), Some(2023));
        assert_eq!(fin_year_start("unknown"), None);
    }

    #[test]
    fn measure_tables_stay_aligned() {
        assert_eq!(RawMeasures::COLUMNS.len(), 29);
        assert_eq!(RawMeasures::UPSTREAM_FIELDS.len(), RawMeasures::COLUMNS.len());
        assert_eq!(RawMeasures::default().values().len(), RawMeasures::COLUMNS.len());
    }

    #[test]
    fn normalize_maps_upstream_names_verbatim() {
        let rec = record(json!({
            "fin_year": "2023-24",
            "month": "october",
            "state_code": "17",
            "state_name": "MADHYA PRADESH",
            "district_code": 1701,
            "district_name": "BHOPAL",
            "Total_Households_Worked": "1200",
            "Women_Persondays": 300,
            "Total_Exp": "NA",
            "percentage_payments_gererated_within_15_days": "98.5",
            "Remarks": ""
        }));
        let fact = rec.normalize().expect("normalizes");
        assert_eq!(fact.key.month, "Oct");
        assert_eq!(fact.key.district_code, "1701");
        assert_eq!(fact.measures.total_households_worked, Some(1200.0));
        assert_eq!(fact.measures.women_persondays, Some(300.0));
        assert_eq!(fact.measures.total_exp, None);
        assert_eq!(fact.measures.percentage_payments_gererated_within_15_days, Some(98.5));
        assert_eq!(fact.remarks, None);
    }

    #[test]
    fn normalize_rejects_records_without_a_natural_key() {
        let rec = record(json!({"fin_year": "2023-24", "month": "Apr", "state_code": "17"}));
        assert_eq!(rec.normalize(), Err(RecordError::MissingField("district_code")));
    }

    #[test]
    fn measures_round_trip_through_column_order() {
        let rec = record(json!({
            "fin_year": "2023-24", "month": "Apr", "state_code": "1", "district_code": "2",
            "Approved_Labour_Budget": 5, "percentage_payments_gererated_within_15_days": 7
        }));
        let measures = rec.normalize().expect("normalizes").measures;
        assert_eq!(RawMeasures::from_values(&measures.values()), measures);
    }

    #[test]
    fn conflict_policy_parses_config_spellings() {
        assert_eq!(ConflictPolicy::parse("skip"), Some(ConflictPolicy::Skip));
        assert_eq!(ConflictPolicy::parse("DO_UPDATE"), Some(ConflictPolicy::Replace));
        assert_eq!(ConflictPolicy::parse("sometimes"), None);
    }
}
