//! Append-only regression history in `REGRESSION_LOG.md`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

const HEADER: &str = "# Regression Log\n\n";

/// Append one entry: `- <ISO-8601> <test-id>: <detail>`. Creates the file
/// with a header on first use. Entries are never rewritten.
pub fn append_entry(path: &Path, test_id: &str, detail: &str) -> Result<()> {
    let is_new = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    if is_new {
        file.write_all(HEADER.as_bytes())
            .with_context(|| format!("write header {}", path.display()))?;
    }
    let line = format!("- {} {test_id}: {detail}\n", Utc::now().to_rfc3339());
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    Ok(())
}
