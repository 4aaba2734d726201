//! In-memory storage, for tests and dry runs.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{DaqError, DaqResult};
use crate::storage::{Series, SessionStorage};

/// Owned copy of a written series; every cell rendered as text.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSeries {
    /// Column labels.
    pub labels: Vec<String>,
    /// Columns of cells.
    pub columns: Vec<Vec<String>>,
}

impl StoredSeries {
    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    /// Column by label.
    pub fn column(&self, label: &str) -> Option<&[String]> {
        let index = self.labels.iter().position(|l| l == label)?;
        Some(&self.columns[index])
    }
}

#[derive(Debug, Default)]
struct Contents {
    series: BTreeMap<String, StoredSeries>,
    objects: BTreeMap<String, serde_json::Value>,
    order: Vec<String>,
}

/// Storage that keeps everything in memory.
///
/// Clones share contents, so a test can keep one clone and hand the other
/// to a session.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    contents: Arc<Mutex<Contents>>,
    fail_on: Option<String>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with `Serialization` when `name` is written.
    pub fn failing_on(mut self, name: impl Into<String>) -> Self {
        self.fail_on = Some(name.into());
        self
    }

    /// A written series.
    pub fn series(&self, name: &str) -> Option<StoredSeries> {
        self.contents.lock().series.get(name).cloned()
    }

    /// A written object.
    pub fn object(&self, name: &str) -> Option<serde_json::Value> {
        self.contents.lock().objects.get(name).cloned()
    }

    /// Names in write order.
    pub fn written(&self) -> Vec<String> {
        self.contents.lock().order.clone()
    }

    fn check(&self, name: &str) -> DaqResult<()> {
        if self.fail_on.as_deref() == Some(name) {
            return Err(DaqError::Serialization(format!("injected failure writing '{name}'")));
        }
        Ok(())
    }
}

impl SessionStorage for MemoryStorage {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn write_series(&mut self, name: &str, series: &Series<'_>) -> DaqResult<()> {
        self.check(name)?;
        let stored = StoredSeries {
            labels: series.labels().map(str::to_string).collect(),
            columns: series
                .columns()
                .iter()
                .map(|(_, column)| (0..column.len()).map(|i| column.cell(i)).collect())
                .collect(),
        };
        let mut contents = self.contents.lock();
        contents.series.insert(name.to_string(), stored);
        contents.order.push(name.to_string());
        Ok(())
    }

    fn write_object(&mut self, name: &str, object: &serde_json::Value) -> DaqResult<()> {
        self.check(name)?;
        let mut contents = self.contents.lock();
        contents.objects.insert(name.to_string(), object.clone());
        contents.order.push(name.to_string());
        Ok(())
    }
}
