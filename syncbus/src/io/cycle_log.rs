//! Cycle audit log (`logs/cycles.jsonl`): one JSON object per finished cycle.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

/// Append `record` as a single line. Each line is written with one `write`
/// call on an append-mode handle, so concurrent appenders do not interleave.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("serialize cycle record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

/// All records, oldest first. Unparseable lines (a torn final write) are
/// skipped.
pub fn read_records(path: &Path) -> Result<Vec<Value>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

pub fn last_record(path: &Path) -> Result<Option<Value>> {
    Ok(read_records(path)?.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appends_one_line_per_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs").join("cycles.jsonl");

        append_record(&path, &json!({"changed": true})).expect("first");
        append_record(&path, &json!({"changed": false})).expect("second");

        assert_eq!(fs::read_to_string(&path).expect("read").lines().count(), 2);
        let last = last_record(&path).expect("last").expect("record");
        assert_eq!(last["changed"], json!(false));
    }

    #[test]
    fn torn_lines_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cycles.jsonl");
        fs::write(&path, "{\"ok\":1}\n{\"trunc").expect("write");
        assert_eq!(read_records(&path).expect("read"), vec![json!({"ok": 1})]);
        let absent = temp.path().join("absent");
        assert!(read_records(&absent).expect("read").is_empty());
    }
}
