use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result row as returned by the remote service, keyed by column name.
pub type Row = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Declared engine type (`double`, `varchar`, `decimal(38,0)`, ...), when known.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: Option<&str>) -> Self {
        Self { name: name.into(), kind: kind.map(str::to_string) }
    }

    /// `Some(true)` for numeric engine types, `Some(false)` for any other
    /// declared type, `None` when the type is unknown.
    pub fn declared_numeric(&self) -> Option<bool> {
        let kind = self.kind.as_deref()?.trim().to_ascii_lowercase();
        if kind.is_empty() {
            return None;
        }
        let base = kind.split('(').next().unwrap_or_default().trim();
        Some(matches!(
            base,
            "double"
                | "real"
                | "float"
                | "decimal"
                | "numeric"
                | "integer"
                | "int"
                | "bigint"
                | "smallint"
                | "tinyint"
                | "int256"
                | "uint256"
        ))
    }
}

/// A page of rows fetched from a completed execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RowBatch {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    /// Offset of the next page, `None` when this page is the last.
    pub next_offset: Option<u64>,
    pub total_row_count: Option<u64>,
}
