//! Append-only `knowledge.jsonl` output.
//!
//! One [`Fact`] per line. Lines are only ever appended; nothing rewrites
//! or truncates the file.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::models::Fact;

/// What a scan of an existing log found.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogScan {
    pub facts: u64,
    pub hashes: BTreeSet<String>,
    pub malformed_lines: u64,
}

#[derive(Debug, Clone)]
pub struct KnowledgeLog {
    path: PathBuf,
}

impl KnowledgeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `facts` and flush to disk before returning.
    pub fn append(&self, facts: &[Fact]) -> std::io::Result<()> {
        if facts.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut buf = Vec::new();
        // A crash can leave a torn last line; start on a fresh one.
        if !ends_with_newline(&self.path)? {
            buf.push(b'\n');
        }
        for fact in facts {
            serde_json::to_writer(&mut buf, fact)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read back every fact hash. A missing file scans as empty.
    pub fn scan(&self) -> std::io::Result<LogScan> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogScan::default()),
            Err(e) => return Err(e),
        };

        let mut scan = LogScan::default();
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut lineno = 0usize;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            lineno += 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            // A torn append can split a multi-byte character; treat it like any other bad line.
            match serde_json::from_slice::<Fact>(&line) {
                Ok(fact) => {
                    scan.facts += 1;
                    scan.hashes.insert(fact.hash);
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = lineno,
                        error = %e,
                        "skipping malformed knowledge line"
                    );
                    scan.malformed_lines += 1;
                }
            }
        }
        Ok(scan)
    }
}

/// True for a missing or empty file, or one whose last byte is `\n`.
fn ends_with_newline(path: &Path) -> std::io::Result<bool> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FactMeta, SourceRef};
    use tempfile::TempDir;

    fn fact(statement: &str, hash: &str) -> Fact {
        Fact {
            statement: statement.to_string(),
            sources: vec![SourceRef {
                source_id: "msg:1".to_string(),
                quote: "q".to_string(),
            }],
            category: None,
            hash: hash.to_string(),
            meta: FactMeta {
                ts: "2026-01-01T00:00:00+00:00".to_string(),
                source_ids_csv: "1".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn append_accumulates_lines() {
        let tmp = TempDir::new().unwrap();
        let log = KnowledgeLog::new(tmp.path().join("out/knowledge.jsonl"));
        log.append(&[fact("a", "h1")]).unwrap();
        log.append(&[fact("b", "h2"), fact("c", "h3")]).unwrap();
        log.append(&[]).unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 3);
        let scan = log.scan().unwrap();
        assert_eq!(scan.facts, 3);
        assert!(scan.hashes.contains("h2"));
    }

    #[test]
    fn scan_skips_torn_lines() {
        let tmp = TempDir::new().unwrap();
        let log = KnowledgeLog::new(tmp.path().join("knowledge.jsonl"));
        log.append(&[fact("a", "h1")]).unwrap();
        let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
        f.write_all(b"{\"statement\": \"half").unwrap();

        let scan = log.scan().unwrap();
        assert_eq!(scan.facts, 1);
        assert_eq!(scan.malformed_lines, 1);

        log.append(&[fact("b", "h2")]).unwrap();
        let scan = log.scan().unwrap();
        assert_eq!(scan.facts, 2);
        assert_eq!(scan.malformed_lines, 1);
    }

    #[test]
    fn scan_skips_torn_multibyte_tail() {
        let tmp = TempDir::new().unwrap();
        let log = KnowledgeLog::new(tmp.path().join("knowledge.jsonl"));
        log.append(&[fact("Релиз в пятницу", "h1")]).unwrap();

        let torn = "{\"statement\":\"С".as_bytes();
        let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
        f.write_all(&torn[..torn.len() - 1]).unwrap();
        assert!(std::fs::read_to_string(log.path()).is_err());

        let scan = log.scan().unwrap();
        assert_eq!(scan.facts, 1);
        assert_eq!(scan.malformed_lines, 1);
        assert!(scan.hashes.contains("h1"));

        log.append(&[fact("Бэкапы хранятся 30 дней", "h2")]).unwrap();
        let scan = log.scan().unwrap();
        assert_eq!(scan.facts, 2);
        assert_eq!(scan.malformed_lines, 1);
    }

    #[test]
    fn missing_log_scans_empty() {
        let tmp = TempDir::new().unwrap();
        let scan = KnowledgeLog::new(tmp.path().join("none.jsonl")).scan().unwrap();
        assert_eq!(scan.facts, 0);
        assert!(scan.hashes.is_empty());
    }
}
