//! Training history logging.

use crate::common::*;

/// Appends epoch summaries to a CSV file.
#[derive(Debug)]
pub struct HistoryWriter {
    writer: csv::Writer<fs::File>,
}

impl HistoryWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create '{}'", path.display()))?;
        Ok(Self { writer })
    }

    pub fn append(&mut self, summary: &EpochSummary) -> Result<()> {
        self.writer.serialize(summary)?;
        self.writer.flush()?;
        Ok(())
    }
}
