//! Session directory backend.
//!
//! Each session gets `<data_root>/<animal_id>_<YYYYmmdd_HHMMSS>/`; series are
//! written as `<name>.csv` with a header row and objects as pretty-printed
//! `<name>.json`. The session directory must not exist beforehand so a run
//! can never overwrite an earlier one.

use std::path::{Path, PathBuf};

use crate::error::{DaqError, DaqResult};
use crate::storage::{Series, SessionStorage};

/// Writes a session into its own directory.
#[derive(Debug)]
pub struct DirectoryStorage {
    dir: PathBuf,
}

impl DirectoryStorage {
    /// Create `<data_root>/<animal_id>_<timestamp>/`.
    pub fn create(data_root: &Path, animal_id: &str) -> DaqResult<Self> {
        let name = format!(
            "{}_{}",
            animal_id,
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        Self::create_at(data_root.join(name))
    }

    /// Use exactly `dir`, which must not exist yet.
    pub fn create_at(dir: impl Into<PathBuf>) -> DaqResult<Self> {
        let dir = dir.into();
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = dir;
            return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        {
            if dir.exists() {
                return Err(DaqError::InvalidConfiguration(format!(
                    "session directory '{}' already exists",
                    dir.display()
                )));
            }
            std::fs::create_dir_all(&dir)?;
            tracing::info!(path = %dir.display(), "Session directory created");
            Ok(Self { dir })
        }
    }

    /// The session directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SessionStorage for DirectoryStorage {
    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    fn write_series(&mut self, name: &str, series: &Series<'_>) -> DaqResult<()> {
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = (name, series);
            return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        {
            if !series.is_rectangular() {
                return Err(DaqError::Serialization(format!(
                    "series '{name}' has columns of different lengths"
                )));
            }
            let path = self.dir.join(format!("{name}.csv"));
            let mut writer = csv::Writer::from_path(&path).map_err(DaqError::serialization)?;
            writer
                .write_record(series.labels())
                .map_err(DaqError::serialization)?;

            let columns = series.columns();
            let mut record = Vec::with_capacity(columns.len());
            for row in 0..series.rows() {
                record.clear();
                record.extend(columns.iter().map(|(_, column)| column.cell(row)));
                writer
                    .write_record(&record)
                    .map_err(DaqError::serialization)?;
            }
            writer.flush().map_err(DaqError::serialization)?;
            tracing::debug!(path = %path.display(), rows = series.rows(), "Series written");
            Ok(())
        }
    }

    fn write_object(&mut self, name: &str, object: &serde_json::Value) -> DaqResult<()> {
        let path = self.dir.join(format!("{name}.json"));
        let text = serde_json::to_string_pretty(object).map_err(DaqError::serialization)?;
        std::fs::write(&path, text).map_err(DaqError::serialization)?;
        tracing::debug!(path = %path.display(), "Object written");
        Ok(())
    }
}
