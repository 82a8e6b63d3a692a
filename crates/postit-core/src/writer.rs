use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

struct Sink {
    writer: csv::Writer<Box<dyn Write + Send>>,
    width: Option<usize>,
}

/// Append-only CSV sink shared by every worker. The first row written is the
/// header; every later row must have the same number of columns.
pub struct ResultWriter {
    sink: Mutex<Sink>,
}

impl ResultWriter {
    pub fn new(output: Box<dyn Write + Send>) -> Self {
        let writer = csv::WriterBuilder::new()
            .flexible(false)
            .from_writer(output);
        Self {
            sink: Mutex::new(Sink {
                writer,
                width: None,
            }),
        }
    }

    /// Create (or truncate) `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;
        Ok(Self::new(Box::new(file)))
    }

    /// Write the header row. Only the first call succeeds.
    pub fn write_header(&self, header: &[String]) -> Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if sink.width.is_some() {
            anyhow::bail!("output header already written");
        }
        sink.writer
            .write_record(header)
            .context("Failed to write output header")?;
        sink.writer.flush().context("Failed to flush output")?;
        sink.width = Some(header.len());
        Ok(())
    }

    pub fn write(&self, row: &[String]) -> Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        match sink.width {
            None => anyhow::bail!("output header must be written before rows"),
            Some(width) if width != row.len() => {
                anyhow::bail!("row has {} columns, header has {}", row.len(), width)
            }
            Some(_) => {}
        }
        sink.writer
            .write_record(row)
            .context("Failed to write output row")?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.writer.flush().context("Failed to flush output")?;
        Ok(())
    }
}
