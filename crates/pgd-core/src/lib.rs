//! Core data model shared by the fetch, cleaning, cache and access layers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "pgd-core";

/// Placeholder written into every textual cell that carried no value ("unspecified").
pub const UNKNOWN: &str = "نامشخص";

/// Column names as they appear in the organization's spreadsheets.
pub mod columns {
    pub const REJECTION_REASON: &str = "علت نپذیرفتن";
    pub const CATEGORIZED_REASON: &str = "علت_دسته_بندی_شده";
    pub const MONTH: &str = "ماه";
    pub const FINAL_STATUS: &str = "وضعیت نهایی";
    pub const START_DATE: &str = "تاریخ شروع بکار";
    pub const UNIT: &str = "واحد";
    pub const GENDER: &str = "جنسیت";
    pub const REFERRER: &str = "معرف";
    pub const EMPLOYEE_ID: &str = "شماره پرسنلی";
    pub const SUBGROUP: &str = "زیرگروه";
}

/// Logical name of one remote dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetId {
    Personnel,
    Employment,
    MonthlyList,
}

impl SheetId {
    pub const ALL: [SheetId; 3] = [SheetId::Personnel, SheetId::Employment, SheetId::MonthlyList];

    /// Value sent as the `sheet` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            SheetId::Personnel => "personnel",
            SheetId::Employment => "employment",
            SheetId::MonthlyList => "monthlylist",
        }
    }
}

impl fmt::Display for SheetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sheet identifier `{0}` (expected personnel, employment or monthlylist)")]
pub struct ParseSheetIdError(pub String);

impl FromStr for SheetId {
    type Err = ParseSheetIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "personnel" => Ok(SheetId::Personnel),
            "employment" => Ok(SheetId::Employment),
            "monthlylist" => Ok(SheetId::MonthlyList),
            other => Err(ParseSheetIdError(other.to_string())),
        }
    }
}

/// One upstream row: column name (untrimmed) to scalar value.
pub type RawRecord = JsonMap<String, JsonValue>;

/// Rows exactly as returned by the spreadsheet endpoint.
pub type RawRecordSet = Vec<RawRecord>;

/// A single value of a cleaned table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Text(String),
    Number(Number),
    Missing,
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => n.as_f64(),
            Cell::Text(s) => s.trim().parse().ok(),
            Cell::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }

    /// Display form used for grouping and joins; missing cells map to [`UNKNOWN`].
    pub fn display(&self) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => n.to_string(),
            Cell::Missing => UNKNOWN.to_string(),
        }
    }
}

/// Normalized, enriched table for one sheet. Every row has `columns.len()` cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedTable {
    pub sheet: SheetId,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl CleanedTable {
    pub fn empty(sheet: SheetId) -> Self {
        Self {
            sheet,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    pub fn text(&self, row: usize, column: &str) -> Option<&str> {
        self.cell(row, column).and_then(Cell::as_text)
    }

    /// All cells of one column in row order; empty when the column is absent.
    pub fn column(&self, name: &str) -> Vec<&Cell> {
        match self.column_index(name) {
            Some(idx) => self.rows.iter().filter_map(|r| r.get(idx)).collect(),
            None => Vec::new(),
        }
    }

    /// Appends a column, or overwrites it when a column of that name already exists.
    pub fn set_column(&mut self, name: &str, values: Vec<Cell>) {
        debug_assert_eq!(values.len(), self.rows.len());
        match self.column_index(name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(name.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
    }

    pub fn reverse_columns(&mut self) {
        self.columns.reverse();
        for row in &mut self.rows {
            row.reverse();
        }
    }

    /// New table with the same columns holding only the rows accepted by `keep`.
    pub fn filter_rows(&self, mut keep: impl FnMut(&CleanedTable, usize) -> bool) -> CleanedTable {
        let rows = (0..self.rows.len())
            .filter(|&i| keep(self, i))
            .map(|i| self.rows[i].clone())
            .collect();
        CleanedTable {
            sheet: self.sheet,
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Rows as ordered JSON objects, the shape the presentation layer renders.
    pub fn to_records(&self) -> Vec<JsonMap<String, JsonValue>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(name, cell)| {
                        let value = match cell {
                            Cell::Text(s) => JsonValue::String(s.clone()),
                            Cell::Number(n) => JsonValue::Number(n.clone()),
                            Cell::Missing => JsonValue::Null,
                        };
                        (name.clone(), value)
                    })
                    .collect()
            })
            .collect()
    }
}

/// A cleaned table plus the moment it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTable {
    pub table: CleanedTable,
    pub fetched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CleanedTable {
        CleanedTable {
            sheet: SheetId::Personnel,
            columns: vec!["a".into(), "b".into()],
            rows: vec![
                vec![Cell::text("x"), Cell::Number(1.into())],
                vec![Cell::text("y"), Cell::Missing],
            ],
        }
    }

    #[test]
    fn sheet_ids_round_trip_through_query_names() {
        for sheet in SheetId::ALL {
            assert_eq!(sheet.as_str().parse::<SheetId>().unwrap(), sheet);
        }
        assert_eq!(" MonthlyList ".parse::<SheetId>().unwrap(), SheetId::MonthlyList);
        assert!("payroll".parse::<SheetId>().is_err());
    }

    #[test]
    fn reversing_columns_keeps_rows_aligned() {
        let mut table = sample();
        table.reverse_columns();
        assert_eq!(table.columns, vec!["b", "a"]);
        assert_eq!(table.text(0, "a"), Some("x"));
        assert_eq!(table.cell(1, "b"), Some(&Cell::Missing));
    }

    #[test]
    fn set_column_appends_then_overwrites() {
        let mut table = sample();
        table.set_column("c", vec![Cell::text("1"), Cell::text("2")]);
        assert_eq!(table.columns.len(), 3);
        table.set_column("c", vec![Cell::text("3"), Cell::text("4")]);
        assert_eq!(table.columns.len(), 3);
        assert_eq!(table.text(1, "c"), Some("4"));
    }

    #[test]
    fn records_serialize_missing_as_null() {
        let records = sample().to_records();
        assert_eq!(records[1]["b"], JsonValue::Null);
        assert_eq!(records[0].keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
        let json = serde_json::to_value(Cell::Missing).unwrap();
        assert!(json.is_null());
    }
}
