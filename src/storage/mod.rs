//! Durable storage for a finished session.
//!
//! The flush writes named *series* (column-oriented numeric or label data)
//! and named *objects* (JSON documents). Backends only need to persist them;
//! they never see the acquisition buffers directly.

pub mod directory;
pub mod memory;

pub use directory::DirectoryStorage;
pub use memory::{MemoryStorage, StoredSeries};

use crate::error::DaqResult;

/// One column of a series.
#[derive(Debug, Clone, PartialEq)]
pub enum Column<'a> {
    /// Floating-point samples.
    F64(&'a [f64]),
    /// Digital samples.
    U8(&'a [u8]),
    /// Counters and sequence numbers.
    U64(&'a [u64]),
    /// Labels.
    Text(Vec<&'a str>),
}

impl Column<'_> {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Column::F64(v) => v.len(),
            Column::U8(v) => v.len(),
            Column::U64(v) => v.len(),
            Column::Text(v) => v.len(),
        }
    }

    /// Whether the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row `index` rendered as text.
    pub fn cell(&self, index: usize) -> String {
        match self {
            Column::F64(v) => v[index].to_string(),
            Column::U8(v) => v[index].to_string(),
            Column::U64(v) => v[index].to_string(),
            Column::Text(v) => v[index].to_string(),
        }
    }
}

/// Named, equal-length columns borrowed from the session buffers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series<'a> {
    columns: Vec<(String, Column<'a>)>,
}

impl<'a> Series<'a> {
    /// Empty series.
    pub fn new() -> Self {
        Self::default()
    }

    /// Series with one column.
    pub fn single(label: impl Into<String>, column: Column<'a>) -> Self {
        Self::new().with_column(label, column)
    }

    /// Add a column.
    pub fn with_column(mut self, label: impl Into<String>, column: Column<'a>) -> Self {
        self.columns.push((label.into(), column));
        self
    }

    /// Columns in order.
    pub fn columns(&self) -> &[(String, Column<'a>)] {
        &self.columns
    }

    /// Column labels.
    pub fn labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(|(label, _)| label.as_str())
    }

    /// Number of rows (that of the first column).
    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |(_, c)| c.len())
    }

    /// Whether every column has the same length.
    pub fn is_rectangular(&self) -> bool {
        let rows = self.rows();
        self.columns.iter().all(|(_, c)| c.len() == rows)
    }
}

/// Destination for a session's data.
pub trait SessionStorage: Send {
    /// Where the session lands, for logs and reports.
    fn location(&self) -> String;

    /// Persist a named series.
    fn write_series(&mut self, name: &str, series: &Series<'_>) -> DaqResult<()>;

    /// Persist a named JSON document.
    fn write_object(&mut self, name: &str, object: &serde_json::Value) -> DaqResult<()>;
}

impl<S: SessionStorage + ?Sized> SessionStorage for Box<S> {
    fn location(&self) -> String {
        (**self).location()
    }

    fn write_series(&mut self, name: &str, series: &Series<'_>) -> DaqResult<()> {
        (**self).write_series(name, series)
    }

    fn write_object(&mut self, name: &str, object: &serde_json::Value) -> DaqResult<()> {
        (**self).write_object(name, object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_reports_shape() {
        let a = [1.0, 2.0, 3.0];
        let b = [0u8, 1, 0];
        let series = Series::new()
            .with_column("force", Column::F64(&a))
            .with_column("gate", Column::U8(&b));
        assert_eq!(series.rows(), 3);
        assert!(series.is_rectangular());
        assert_eq!(series.labels().collect::<Vec<_>>(), vec!["force", "gate"]);
        assert_eq!(series.columns()[1].1.cell(1), "1");

        let ragged = series.with_column("short", Column::U64(&[1]));
        assert!(!ragged.is_rectangular());
    }
}
