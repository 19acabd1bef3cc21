//! Append-only CSV log of per-file ingestion failures.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

const HEADER: &str = "timestamp,path,cause\n";

/// Failure log at a fixed path. Rows are `timestamp,path,cause`; the header
/// is written when the file is created.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(HEADER.as_bytes())?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row per `(path, cause)`, all stamped with the current time.
    pub fn record_all<'a, I>(&self, failures: I) -> std::io::Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let stamp = Utc::now().to_rfc3339();
        let mut buf = String::new();
        for (path, cause) in failures {
            buf.push_str(&csv_field(&stamp));
            buf.push(',');
            buf.push_str(&csv_field(path));
            buf.push(',');
            buf.push_str(&csv_field(cause));
            buf.push('\n');
        }
        if buf.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(buf.as_bytes())
    }
}

/// Quote a field if it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("/plain/path.jpg"), "/plain/path.jpg");
        assert_eq!(csv_field("a,b.jpg"), "\"a,b.jpg\"");
        assert_eq!(csv_field("say \"cheese\""), "\"say \"\"cheese\"\"\"");
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("ingest_errors.csv");

        let log = AuditLog::open(&path).unwrap();
        log.record_all([("/a.jpg", "no_face")]).unwrap();
        let log = AuditLog::open(&path).unwrap();
        log.record_all([("/b,c.jpg", "unreadable_image"), ("/d.jpg", "runtime_fault")])
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "timestamp,path,cause");
        assert!(lines[1].ends_with(",/a.jpg,no_face"));
        assert!(lines[2].ends_with(",\"/b,c.jpg\",unreadable_image"));
        assert!(lines[3].ends_with(",/d.jpg,runtime_fault"));
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.csv");
        let log = AuditLog::open(&path).unwrap();
        log.record_all(std::iter::empty()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), HEADER);
    }
}
