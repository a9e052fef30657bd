//! Hiring-funnel, unit, sourcing-channel and churn figures over cleaned sheets.
//!
//! Everything here is pure. Absent columns degrade to empty results instead of errors.

use std::collections::HashMap;

use pgd_adapters::{categorize, normalize_text};
use pgd_core::{columns, Cell, CleanedTable, SheetId, UNKNOWN};
use serde::Serialize;

pub const STATUS_HIRED: &str = "استخدام شد";
pub const STATUS_REJECTED: &str = "رد شد";
pub const STATUS_WITHDREW: &str = "انصراف داد";
pub const GENDER_MALE: &str = "مرد";
pub const GENDER_FEMALE: &str = "زن";
/// Start-date marker for candidates that were not taken on.
pub const NOT_HIRED_MARKER: &str = "عدم استخدام";

/// Minimum volume before a unit or channel is ranked on its rate.
pub const MIN_RANKED_VOLUME: usize = 3;

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn cell_text(table: &CleanedTable, row: usize, column: &str) -> Option<String> {
    table.cell(row, column).map(Cell::display)
}

/// Counts per distinct value, most frequent first; ties keep first-seen order.
fn value_counts(values: impl Iterator<Item = String>) -> Vec<(String, usize)> {
    let mut order: Vec<(String, usize)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for value in values {
        match index.get(&value) {
            Some(&i) => order[i].1 += 1,
            None => {
                index.insert(value.clone(), order.len());
                order.push((value, 1));
            }
        }
    }
    order.sort_by(|a, b| b.1.cmp(&a.1));
    order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Hired,
    Rejected,
    Withdrew,
    Undecided,
}

impl FinalStatus {
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            STATUS_HIRED => FinalStatus::Hired,
            STATUS_REJECTED => FinalStatus::Rejected,
            STATUS_WITHDREW => FinalStatus::Withdrew,
            _ => FinalStatus::Undecided,
        }
    }
}

fn final_status(table: &CleanedTable, row: usize) -> FinalStatus {
    cell_text(table, row, columns::FINAL_STATUS)
        .map(|s| FinalStatus::parse(&s))
        .unwrap_or(FinalStatus::Undecided)
}

/// Hired by start date: the column exists and carries a real date.
pub fn started_work(table: &CleanedTable, row: usize) -> bool {
    match table.cell(row, columns::START_DATE) {
        None | Some(Cell::Missing) => false,
        Some(cell) => {
            let text = cell.display();
            !text.contains(NOT_HIRED_MARKER) && !text.contains(UNKNOWN)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenderSplit {
    pub male: usize,
    pub female: usize,
    pub male_percent: u32,
    pub female_percent: u32,
}

/// `None` when the table has no gender column or `rows` is empty.
pub fn gender_split(table: &CleanedTable, rows: &[usize]) -> Option<GenderSplit> {
    if rows.is_empty() || !table.has_column(columns::GENDER) {
        return None;
    }
    let count = |gender: &str| {
        rows.iter()
            .filter(|&&r| table.text(r, columns::GENDER) == Some(gender))
            .count()
    };
    let male = count(GENDER_MALE);
    let female = count(GENDER_FEMALE);
    Some(GenderSplit {
        male,
        female,
        male_percent: percent(male, rows.len()) as u32,
        female_percent: percent(female, rows.len()) as u32,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusBucket {
    pub count: usize,
    pub gender: Option<GenderSplit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitHighlight {
    pub unit: String,
    pub count: usize,
    pub percent: f64,
    pub gender: Option<GenderSplit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HiringFunnel {
    pub total_candidates: usize,
    pub candidates: StatusBucket,
    pub hired: StatusBucket,
    pub rejected: StatusBucket,
    pub withdrew: StatusBucket,
    pub undecided: StatusBucket,
    pub conversion_rate: f64,
    pub rejection_rate: f64,
    pub withdrawal_rate: f64,
    /// `1:N` interviews per hire, or `0` when nobody was hired.
    pub selection_ratio: String,
    pub health_score: i32,
    pub top_interview_unit: Option<UnitHighlight>,
    pub top_hired_unit: Option<UnitHighlight>,
}

fn top_unit(table: &CleanedTable, rows: &[usize], total: usize) -> Option<UnitHighlight> {
    if !table.has_column(columns::UNIT) {
        return None;
    }
    let counts = value_counts(
        rows.iter()
            .filter_map(|&r| cell_text(table, r, columns::UNIT)),
    );
    let (unit, count) = counts.into_iter().next()?;
    let unit_rows: Vec<usize> = rows
        .iter()
        .copied()
        .filter(|&r| cell_text(table, r, columns::UNIT).as_deref() == Some(unit.as_str()))
        .collect();
    Some(UnitHighlight {
        gender: gender_split(table, &unit_rows),
        percent: round1(percent(count, total)),
        unit,
        count,
    })
}

pub fn hiring_funnel(employment: &CleanedTable) -> HiringFunnel {
    let all: Vec<usize> = (0..employment.len()).collect();
    let mut by_status: HashMap<FinalStatus, Vec<usize>> = HashMap::new();
    for &row in &all {
        by_status.entry(final_status(employment, row)).or_default().push(row);
    }
    let bucket = |status: FinalStatus| {
        let rows = by_status.get(&status).map(Vec::as_slice).unwrap_or(&[]);
        StatusBucket {
            count: rows.len(),
            gender: gender_split(employment, rows),
        }
    };

    let total = all.len();
    let hired = bucket(FinalStatus::Hired);
    let rejected = bucket(FinalStatus::Rejected);
    let withdrew = bucket(FinalStatus::Withdrew);
    let undecided = bucket(FinalStatus::Undecided);

    let conversion_rate = percent(hired.count, total);
    let rejection_rate = percent(rejected.count, total);
    let withdrawal_rate = percent(withdrew.count, total);

    let selection_ratio = if hired.count > 0 {
        format!("1:{}", total / hired.count)
    } else {
        "0".to_string()
    };

    let mut health_score = 100;
    if withdrawal_rate > 20.0 {
        health_score -= 30;
    }
    if conversion_rate < 5.0 {
        health_score -= 20;
    }
    if conversion_rate > 50.0 {
        health_score -= 10;
    }

    let hired_rows = by_status.get(&FinalStatus::Hired).cloned().unwrap_or_default();

    HiringFunnel {
        total_candidates: total,
        candidates: StatusBucket {
            count: total,
            gender: gender_split(employment, &all),
        },
        top_interview_unit: top_unit(employment, &all, total),
        top_hired_unit: top_unit(employment, &hired_rows, hired_rows.len()),
        hired,
        rejected,
        withdrew,
        undecided,
        conversion_rate: round1(conversion_rate),
        rejection_rate: round1(rejection_rate),
        withdrawal_rate: round1(withdrawal_rate),
        selection_ratio,
        health_score,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitConversion {
    pub unit: String,
    pub interviewed: usize,
    pub hired: usize,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitConversionReport {
    /// Highest interview volume first.
    pub units: Vec<UnitConversion>,
    pub average_conversion: f64,
    pub interviews_per_hire: f64,
    pub best: Option<UnitConversion>,
    pub worst: Option<UnitConversion>,
}

/// Interview-to-hire conversion per unit, hires judged by start date.
pub fn unit_conversion(employment: &CleanedTable) -> UnitConversionReport {
    let mut units = Vec::new();
    if employment.has_column(columns::UNIT) {
        let counts = value_counts(
            (0..employment.len()).filter_map(|r| cell_text(employment, r, columns::UNIT)),
        );
        let mut hired: HashMap<String, usize> = HashMap::new();
        for row in (0..employment.len()).filter(|&r| started_work(employment, r)) {
            if let Some(unit) = cell_text(employment, row, columns::UNIT) {
                *hired.entry(unit).or_default() += 1;
            }
        }
        units = counts
            .into_iter()
            .map(|(unit, interviewed)| {
                let hired = hired.get(&unit).copied().unwrap_or(0);
                UnitConversion {
                    rate: round1(percent(hired, interviewed)),
                    unit,
                    interviewed,
                    hired,
                }
            })
            .collect();
    }

    let total_interviewed: usize = units.iter().map(|u| u.interviewed).sum();
    let total_hired: usize = units.iter().map(|u| u.hired).sum();
    let interviews_per_hire = if total_hired > 0 {
        total_interviewed as f64 / total_hired as f64
    } else {
        total_interviewed as f64
    };

    let qualified: Vec<&UnitConversion> = units
        .iter()
        .filter(|u| u.interviewed >= MIN_RANKED_VOLUME)
        .collect();
    let (best, worst) = if qualified.is_empty() {
        (units.first().cloned(), units.first().cloned())
    } else {
        let mut best = qualified[0];
        let mut worst = qualified[0];
        for &unit in &qualified[1..] {
            if unit.rate > best.rate {
                best = unit;
            }
            if unit.rate < worst.rate {
                worst = unit;
            }
        }
        (Some(best.clone()), Some(worst.clone()))
    };

    UnitConversionReport {
        average_conversion: round1(percent(total_hired, total_interviewed)),
        interviews_per_hire: round1(interviews_per_hire),
        best,
        worst,
        units,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelPerformance {
    pub channel: String,
    pub referred: usize,
    pub hired: usize,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourcingReport {
    /// Highest referral volume first.
    pub channels: Vec<ChannelPerformance>,
    pub top_volume: Option<ChannelPerformance>,
    pub top_quality: Option<ChannelPerformance>,
}

/// Referral channels ranked by volume, plus the best-converting channel.
pub fn sourcing_channels(employment: &CleanedTable) -> SourcingReport {
    if !employment.has_column(columns::REFERRER) {
        return SourcingReport {
            channels: Vec::new(),
            top_volume: None,
            top_quality: None,
        };
    }
    let referrer = |r: usize| cell_text(employment, r, columns::REFERRER).unwrap_or_else(|| UNKNOWN.to_string());
    let counts = value_counts((0..employment.len()).map(referrer));
    let mut hired: HashMap<String, usize> = HashMap::new();
    for row in (0..employment.len()).filter(|&r| started_work(employment, r)) {
        *hired.entry(referrer(row)).or_default() += 1;
    }
    let channels: Vec<ChannelPerformance> = counts
        .into_iter()
        .map(|(channel, referred)| {
            let hired = hired.get(&channel).copied().unwrap_or(0);
            ChannelPerformance {
                conversion_rate: round1(percent(hired, referred)),
                channel,
                referred,
                hired,
            }
        })
        .collect();

    let top_volume = channels.first().cloned();
    let mut top_quality: Option<&ChannelPerformance> = None;
    for channel in channels.iter().filter(|c| c.referred >= MIN_RANKED_VOLUME) {
        if top_quality.map_or(true, |best| channel.conversion_rate > best.conversion_rate) {
            top_quality = Some(channel);
        }
    }
    let top_quality = top_quality.cloned().or_else(|| top_volume.clone());

    SourcingReport {
        channels,
        top_volume,
        top_quality,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasonCount {
    pub category: String,
    pub count: usize,
    pub percent: f64,
    pub cumulative_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChurnReport {
    pub total: usize,
    /// Pareto order: most frequent category first.
    pub by_category: Vec<ReasonCount>,
}

/// Rejected and withdrawn candidates grouped by categorized reason.
pub fn churn_breakdown(employment: &CleanedTable) -> ChurnReport {
    let churned: Vec<usize> = (0..employment.len())
        .filter(|&r| {
            matches!(
                final_status(employment, r),
                FinalStatus::Rejected | FinalStatus::Withdrew
            )
        })
        .collect();

    let category_of = |row: usize| -> String {
        if let Some(label) = employment.text(row, columns::CATEGORIZED_REASON) {
            return label.to_string();
        }
        match cell_text(employment, row, columns::REJECTION_REASON) {
            Some(reason) if reason.trim() != "-" => categorize(&reason).label().to_string(),
            _ => UNKNOWN.to_string(),
        }
    };

    let counts = value_counts(churned.iter().map(|&r| category_of(r)));
    let total = churned.len();
    let mut running = 0;
    let by_category = counts
        .into_iter()
        .map(|(category, count)| {
            running += count;
            ReasonCount {
                category,
                count,
                percent: round1(percent(count, total)),
                cumulative_percent: round1(percent(running, total)),
            }
        })
        .collect();

    ChurnReport { total, by_category }
}

/// Value counts of one column (unit, subgroup, gender ...), most frequent first.
pub fn headcount_by(table: &CleanedTable, column: &str) -> Vec<(String, usize)> {
    if !table.has_column(column) {
        return Vec::new();
    }
    value_counts((0..table.len()).filter_map(|r| cell_text(table, r, column)))
}

/// Left join of monthly attendance rows with personnel details on an employee key.
///
/// Personnel columns already present on the monthly side are not duplicated.
/// Unmatched rows get [`UNKNOWN`]. When either side lacks `key` the monthly
/// table is returned as it is.
pub fn join_monthly_with_personnel(
    monthly: &CleanedTable,
    personnel: &CleanedTable,
    key: &str,
) -> CleanedTable {
    let (Some(monthly_key), Some(personnel_key)) =
        (monthly.column_index(key), personnel.column_index(key))
    else {
        return monthly.clone();
    };

    let join_key = |cell: &Cell| normalize_text(&cell.display());
    let mut lookup: HashMap<String, usize> = HashMap::new();
    for (idx, row) in personnel.rows.iter().enumerate() {
        lookup.entry(join_key(&row[personnel_key])).or_insert(idx);
    }

    let extra: Vec<usize> = personnel
        .columns
        .iter()
        .enumerate()
        .filter(|(_, name)| !monthly.has_column(name))
        .map(|(idx, _)| idx)
        .collect();

    let mut joined = CleanedTable {
        sheet: SheetId::MonthlyList,
        columns: monthly.columns.clone(),
        rows: Vec::with_capacity(monthly.len()),
    };
    joined
        .columns
        .extend(extra.iter().map(|&idx| personnel.columns[idx].clone()));

    for row in &monthly.rows {
        let matched = lookup.get(&join_key(&row[monthly_key])).map(|&i| &personnel.rows[i]);
        let mut out = row.clone();
        out.extend(extra.iter().map(|&idx| match matched {
            Some(p) => p[idx].clone(),
            None => Cell::text(UNKNOWN),
        }));
        joined.rows.push(out);
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgd_adapters::clean_sheet;
    use serde_json::json;

    fn employment(rows: serde_json::Value) -> CleanedTable {
        clean_sheet(SheetId::Employment, &serde_json::from_value(rows).unwrap())
    }

    fn candidate(unit: &str, gender: &str, status: &str, start: &str, referrer: &str, reason: &str) -> serde_json::Value {
        json!({
            "واحد": unit,
            "جنسیت": gender,
            "وضعیت نهایی": status,
            "تاریخ شروع بکار": start,
            "معرف": referrer,
            "علت نپذیرفتن": reason,
        })
    }

    fn sample() -> CleanedTable {
        employment(json!([
            candidate("فروش", "مرد", "استخدام شد", "1403/01/15", "دیوار", ""),
            candidate("فروش", "زن", "رد شد", "عدم استخدام", "دیوار", "سابقه کافی نداشت"),
            candidate("فروش", "مرد", "انصراف داد", "عدم استخدام", "جابینجا", "حقوق کم بود"),
            candidate("تولید", "مرد", "استخدام شد", "1403/02/01", "معرفی پرسنل", ""),
            candidate("تولید", "زن", "", "", "دیوار", ""),
            candidate("تولید", "مرد", "انصراف داد", "عدم استخدام", "جابینجا", "مسیر دور است"),
            candidate("انبار", "مرد", "رد شد", "عدم استخدام", "جابینجا", "حقوق"),
        ]))
    }

    #[test]
    fn funnel_counts_rates_and_score() {
        let funnel = hiring_funnel(&sample());
        assert_eq!(funnel.total_candidates, 7);
        assert_eq!(funnel.hired.count, 2);
        assert_eq!(funnel.rejected.count, 2);
        assert_eq!(funnel.withdrew.count, 2);
        assert_eq!(funnel.undecided.count, 1);
        assert_eq!(funnel.conversion_rate, 28.6);
        assert_eq!(funnel.withdrawal_rate, 28.6);
        assert_eq!(funnel.selection_ratio, "1:3");
        // Withdrawal above 20% costs 30 points.
        assert_eq!(funnel.health_score, 70);
        let hired_gender = funnel.hired.gender.unwrap();
        assert_eq!((hired_gender.male, hired_gender.female), (2, 0));
        assert_eq!(hired_gender.male_percent, 100);
        let top = funnel.top_interview_unit.unwrap();
        assert_eq!((top.unit.as_str(), top.count), ("فروش", 3));
        assert_eq!(funnel.top_hired_unit.unwrap().unit, "فروش");
    }

    #[test]
    fn funnel_on_empty_table_is_all_zero() {
        let funnel = hiring_funnel(&employment(json!([])));
        assert_eq!(funnel.total_candidates, 0);
        assert_eq!(funnel.conversion_rate, 0.0);
        assert_eq!(funnel.selection_ratio, "0");
        assert_eq!(funnel.health_score, 80);
        assert!(funnel.top_interview_unit.is_none());
        assert!(funnel.candidates.gender.is_none());
    }

    #[test]
    fn unit_conversion_ranks_units_with_enough_interviews() {
        let report = unit_conversion(&sample());
        let names: Vec<_> = report.units.iter().map(|u| u.unit.as_str()).collect();
        assert_eq!(names, vec!["فروش", "تولید", "انبار"]);
        assert_eq!(report.units[0].hired, 1);
        assert_eq!(report.units[0].rate, 33.3);
        assert_eq!(report.units[2].hired, 0);
        assert_eq!(report.average_conversion, 28.6);
        assert_eq!(report.interviews_per_hire, 3.5);
        // Only فروش and تولید have three interviews; both convert 1 of 3.
        assert_eq!(report.best.unwrap().unit, "فروش");
        assert_eq!(report.worst.unwrap().unit, "فروش");
    }

    #[test]
    fn blank_start_date_is_not_a_hire() {
        let table = sample();
        assert!(started_work(&table, 0));
        assert!(!started_work(&table, 1));
        assert!(!started_work(&table, 4));
    }

    #[test]
    fn sourcing_channels_volume_and_quality() {
        let report = sourcing_channels(&sample());
        let volume = report.top_volume.unwrap();
        assert_eq!(volume.channel, "دیوار");
        assert_eq!(volume.referred, 3);
        assert_eq!(volume.hired, 1);
        let quality = report.top_quality.unwrap();
        assert_eq!(quality.channel, "دیوار");
        assert_eq!(report.channels.len(), 3);
        let personal = report.channels.iter().find(|c| c.channel == "معرفی پرسنل").unwrap();
        assert_eq!(personal.conversion_rate, 100.0);
    }

    #[test]
    fn sourcing_without_referrer_column_is_empty() {
        let table = employment(json!([{"واحد": "فروش"}]));
        let report = sourcing_channels(&table);
        assert!(report.channels.is_empty());
        assert!(report.top_quality.is_none());
    }

    #[test]
    fn churn_is_a_pareto_of_categorized_reasons() {
        let report = churn_breakdown(&sample());
        assert_eq!(report.total, 4);
        assert_eq!(report.by_category[0].category, "حقوق");
        assert_eq!(report.by_category[0].count, 2);
        assert_eq!(report.by_category[0].percent, 50.0);
        assert_eq!(report.by_category.last().unwrap().cumulative_percent, 100.0);
        let categories: Vec<_> = report.by_category.iter().map(|c| c.category.as_str()).collect();
        assert!(categories.contains(&"عدم تایید فنی"));
        assert!(categories.contains(&"مسیر و سرویس"));
    }

    #[test]
    fn churn_falls_back_to_raw_reason_when_not_enriched() {
        let mut table = sample();
        let idx = table.column_index(columns::CATEGORIZED_REASON).unwrap();
        table.columns.remove(idx);
        for row in &mut table.rows {
            row.remove(idx);
        }
        let report = churn_breakdown(&table);
        assert_eq!(report.by_category[0].category, "حقوق");
    }

    #[test]
    fn headcount_counts_values() {
        let counts = headcount_by(&sample(), columns::GENDER);
        assert_eq!(counts, vec![("مرد".to_string(), 5), ("زن".to_string(), 2)]);
        assert!(headcount_by(&sample(), "ستون ناموجود").is_empty());
    }

    #[test]
    fn personnel_headcount_by_unit_and_subgroup() {
        let personnel = clean_sheet(
            SheetId::Personnel,
            &serde_json::from_value(json!([
                {"شماره پرسنلی": 1, "واحد": "تولید", "زیرگروه": "خط مونتاژ"},
                {"شماره پرسنلی": 2, "واحد": "تولید", "زیرگروه": "کنترل كيفيت"},
                {"شماره پرسنلی": 3, "واحد": "فروش", "زیرگروه": "خط مونتاژ"},
                {"شماره پرسنلی": 4, "واحد": "تولید", "زیرگروه": ""}
            ]))
            .unwrap(),
        );
        assert_eq!(
            headcount_by(&personnel, columns::SUBGROUP),
            vec![
                ("خط مونتاژ".to_string(), 2),
                ("کنترل کیفیت".to_string(), 1),
                (UNKNOWN.to_string(), 1),
            ]
        );
        assert_eq!(
            headcount_by(&personnel, columns::UNIT),
            vec![("تولید".to_string(), 3), ("فروش".to_string(), 1)]
        );
    }

    #[test]
    fn monthly_join_tolerates_missing_matches_and_keys() {
        let monthly = clean_sheet(
            SheetId::MonthlyList,
            &serde_json::from_value(json!([
                {"شماره پرسنلی": 101, "ماه": "مهر", "کارکرد": 22},
                {"شماره پرسنلی": 999, "ماه": "مهر", "کارکرد": 20}
            ]))
            .unwrap(),
        );
        let personnel = clean_sheet(
            SheetId::Personnel,
            &serde_json::from_value(json!([
                {"شماره پرسنلی": 101, "واحد": "تولید", "ماه": "ignored"}
            ]))
            .unwrap(),
        );
        let joined = join_monthly_with_personnel(&monthly, &personnel, columns::EMPLOYEE_ID);
        assert_eq!(joined.columns, vec!["شماره پرسنلی", "ماه", "کارکرد", "واحد"]);
        assert_eq!(joined.text(0, "واحد"), Some("تولید"));
        assert_eq!(joined.text(1, "واحد"), Some(UNKNOWN));

        let no_key = clean_sheet(SheetId::Personnel, &serde_json::from_value(json!([{"واحد": "x"}])).unwrap());
        assert_eq!(join_monthly_with_personnel(&monthly, &no_key, columns::EMPLOYEE_ID), monthly);
    }
}
