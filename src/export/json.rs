use anyhow::Result;
use serde::Serialize;
use std::io::Write;

/// Export items as JSON lines
pub fn export_json<T: Serialize, W: Write>(items: &[T], mut writer: W) -> Result<()> {
    for item in items {
        serde_json::to_writer(&mut writer, item)?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}
