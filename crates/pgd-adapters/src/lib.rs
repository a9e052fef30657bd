//! Cleaning pipeline: Persian text normalization, rejection-reason categories,
//! raw-row to table reconciliation and the per-sheet transforms.

use std::cmp::Reverse;

use pgd_core::{columns, Cell, CleanedTable, RawRecordSet, SheetId, UNKNOWN};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

pub const CRATE_NAME: &str = "pgd-adapters";

/// Arabic letterforms and invisible characters mapped to their canonical Persian form.
const CHAR_SUBSTITUTIONS: &[(char, Option<char>)] = &[
    ('ي', Some('ی')),
    ('ك', Some('ک')),
    ('ى', Some('ی')),
    ('ة', Some('ه')),
    ('أ', Some('ا')),
    ('إ', Some('ا')),
    ('آ', Some('ا')),
    ('\u{200c}', Some(' ')),
    ('¬', None),
];

const NULL_TOKENS: &[&str] = &["nan", "none", "null"];

/// Persian calendar months in calendar order.
pub const PERSIAN_MONTHS: [&str; 12] = [
    "فروردین",
    "اردیبهشت",
    "خرداد",
    "تیر",
    "مرداد",
    "شهریور",
    "مهر",
    "آبان",
    "آذر",
    "دی",
    "بهمن",
    "اسفند",
];

fn is_null_token(text: &str) -> bool {
    text.is_empty() || NULL_TOKENS.iter().any(|t| text.eq_ignore_ascii_case(t))
}

fn substitute_chars(text: &str) -> String {
    text.chars()
        .filter_map(|ch| {
            match CHAR_SUBSTITUTIONS.iter().find(|(from, _)| *from == ch) {
                Some((_, to)) => *to,
                None => Some(ch),
            }
        })
        .collect()
}

/// Canonical form of a string; blank and null-like input becomes [`UNKNOWN`].
pub fn normalize_text(text: &str) -> String {
    let trimmed = text.trim();
    if is_null_token(trimmed) {
        return UNKNOWN.to_string();
    }
    let substituted = substitute_chars(trimmed);
    let cleaned = substituted.trim();
    if is_null_token(cleaned) {
        return UNKNOWN.to_string();
    }
    cleaned.to_string()
}

/// Normalizes any JSON scalar; non-strings are stringified first.
pub fn normalize(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => UNKNOWN.to_string(),
        Some(JsonValue::String(s)) => normalize_text(s),
        Some(other) => normalize_text(&other.to_string()),
    }
}

/// Fixed taxonomy for free-text rejection and withdrawal reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    Compensation,
    OvertimeSchedule,
    CommuteAndMeals,
    NoResponse,
    TechnicalRejection,
    WorkplaceCulture,
    Other,
    Unknown,
}

impl ReasonCategory {
    /// Label stored in the categorized-reason column.
    pub fn label(self) -> &'static str {
        match self {
            ReasonCategory::Compensation => "حقوق",
            ReasonCategory::OvertimeSchedule => "مشکل اضافه کاری",
            ReasonCategory::CommuteAndMeals => "مسیر و سرویس",
            ReasonCategory::NoResponse => "عدم مراجعه",
            ReasonCategory::TechnicalRejection => "عدم تایید فنی",
            ReasonCategory::WorkplaceCulture => "محیط کاری",
            ReasonCategory::Other => "سایر موارد",
            ReasonCategory::Unknown => UNKNOWN,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        REASON_RULES
            .iter()
            .map(|(category, _)| *category)
            .chain([ReasonCategory::Other, ReasonCategory::Unknown])
            .find(|c| c.label() == label)
    }
}

/// Checked top to bottom; the first category with a matching keyword wins.
pub const REASON_RULES: &[(ReasonCategory, &[&str])] = &[
    (
        ReasonCategory::Compensation,
        &["حقوق", "تومان", "مبلغ", "پول", "درامد", "مزایا", "پایه"],
    ),
    (
        ReasonCategory::OvertimeSchedule,
        &["اضافه", "ساعت", "شیفت", "تایم", "تعطیل", "پنجشنبه"],
    ),
    (
        ReasonCategory::CommuteAndMeals,
        &["ناهار", "سرویس", "غذا", "مسیر", "راه", "تردد", "دور", "مسافت"],
    ),
    (
        ReasonCategory::NoResponse,
        &["مراجعه", "انصراف", "نیامد", "پاسخ", "گوشی", "تماس", "جواب"],
    ),
    (
        ReasonCategory::TechnicalRejection,
        &["تایید", "رد", "فنی", "قبول", "شرایط", "سن", "مهارت", "سابقه"],
    ),
    (
        ReasonCategory::WorkplaceCulture,
        &["محیط", "برخورد", "فرهنگ", "جو", "اخلاق"],
    ),
];

pub fn categorize(text: &str) -> ReasonCategory {
    let normalized = normalize_text(text);
    if normalized == UNKNOWN {
        return ReasonCategory::Unknown;
    }
    let compact: String = normalized.chars().filter(|c| !c.is_whitespace()).collect();
    REASON_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| compact.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(ReasonCategory::Other)
}

/// Zero-based calendar position of a month name, after normalization.
pub fn month_index(name: &str) -> Option<usize> {
    let needle = normalize_text(name);
    PERSIAN_MONTHS
        .iter()
        .position(|m| normalize_text(m) == needle)
}

/// Distinct recognised months of a table, in calendar order, canonical spelling.
pub fn months_in_calendar_order(table: &CleanedTable) -> Vec<&'static str> {
    let mut seen = [false; 12];
    for cell in table.column(columns::MONTH) {
        if let Some(idx) = cell.as_text().and_then(month_index) {
            seen[idx] = true;
        }
    }
    PERSIAN_MONTHS
        .iter()
        .zip(seen)
        .filter_map(|(name, present)| present.then_some(*name))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Numeric,
    Textual,
}

fn column_kind<'a>(values: impl Iterator<Item = Option<&'a JsonValue>>) -> ColumnKind {
    let mut saw_number = false;
    for value in values {
        match value {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::Number(_)) => saw_number = true,
            Some(_) => return ColumnKind::Textual,
        }
    }
    if saw_number {
        ColumnKind::Numeric
    } else {
        ColumnKind::Textual
    }
}

/// Reconciles heterogeneous raw rows into one normalized table.
///
/// Columns are the union of trimmed keys in first-seen order. Keys that only
/// differ by surrounding whitespace share a column; the first non-null value wins.
pub fn build_table(sheet: SheetId, raw: &RawRecordSet) -> CleanedTable {
    let mut columns: Vec<String> = Vec::new();
    let mut merged: Vec<Vec<Option<&JsonValue>>> = Vec::with_capacity(raw.len());

    for record in raw {
        let mut row: Vec<Option<&JsonValue>> = vec![None; columns.len()];
        for (key, value) in record {
            let name = key.trim();
            let idx = match columns.iter().position(|c| c == name) {
                Some(idx) => idx,
                None => {
                    columns.push(name.to_string());
                    columns.len() - 1
                }
            };
            if row.len() <= idx {
                row.resize(idx + 1, None);
            }
            if matches!(row[idx], None | Some(JsonValue::Null)) {
                row[idx] = Some(value);
            }
        }
        merged.push(row);
    }

    let kinds: Vec<ColumnKind> = (0..columns.len())
        .map(|idx| column_kind(merged.iter().map(|row| row.get(idx).copied().flatten())))
        .collect();

    let rows = merged
        .into_iter()
        .map(|row| {
            kinds
                .iter()
                .enumerate()
                .map(|(idx, kind)| {
                    let value = row.get(idx).copied().flatten();
                    match (kind, value) {
                        (ColumnKind::Numeric, Some(JsonValue::Number(n))) => Cell::Number(n.clone()),
                        (ColumnKind::Numeric, _) => Cell::Missing,
                        (ColumnKind::Textual, value) => Cell::Text(normalize(value)),
                    }
                })
                .collect()
        })
        .collect();

    CleanedTable {
        sheet,
        columns,
        rows,
    }
}

/// Sheet-specific enrichment applied after every cell has been normalized.
pub fn transform(mut table: CleanedTable) -> CleanedTable {
    match table.sheet {
        SheetId::Employment => {
            let categories = match table.column_index(columns::REJECTION_REASON) {
                Some(idx) => table
                    .rows
                    .iter()
                    .map(|row| {
                        let reason = row[idx].display();
                        Cell::text(categorize(&reason).label())
                    })
                    .collect(),
                None => vec![Cell::text(UNKNOWN); table.len()],
            };
            table.set_column(columns::CATEGORIZED_REASON, categories);
        }
        SheetId::MonthlyList => {
            if let Some(idx) = table.column_index(columns::MONTH) {
                // Stable, most recent month first, unrecognised months last.
                table.rows.sort_by_key(|row| {
                    Reverse(row[idx].as_text().and_then(month_index).map(|m| m as i64).unwrap_or(-1))
                });
            }
        }
        SheetId::Personnel => table.reverse_columns(),
    }
    table
}

/// Full cleaning pipeline for one fetch result.
pub fn clean_sheet(sheet: SheetId, raw: &RawRecordSet) -> CleanedTable {
    let table = transform(build_table(sheet, raw));
    debug!(sheet = %sheet, rows = table.len(), columns = table.columns.len(), "sheet cleaned");
    table
}
