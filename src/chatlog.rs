//! Append-only log of chat turns, one JSON object per line.
//!
//! The log is write-mostly: the assistant appends every answered turn, and
//! [`ChatLogger::load_interactions`] exists for offline tooling that wants to
//! read the turns back.

use crate::chatbot::ChatError;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// One logged turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    /// What the user said.
    pub input: String,
    /// What the assistant answered.
    pub output: String,
}

/// Appends [`Interaction`]s to a JSON-lines file.
#[derive(Debug)]
pub struct ChatLogger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ChatLogger {
    /// A logger writing to `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one turn.
    ///
    /// # Errors
    /// [`ChatError::Io`] if the file cannot be opened or written,
    /// [`ChatError::Json`] if encoding fails.
    pub fn log_interaction(&self, input: &str, output: &str) -> Result<(), ChatError> {
        let mut line = serde_json::to_string(&Interaction {
            input: input.to_string(),
            output: output.to_string(),
        })?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        debug!(path = %self.path.display(), "logged interaction");
        Ok(())
    }

    /// Reads every logged turn; a missing file yields an empty list.
    ///
    /// # Errors
    /// [`ChatError::Io`] on read failure, [`ChatError::LogRecord`] naming the
    /// first malformed line.
    pub fn load_interactions(&self) -> Result<Vec<Interaction>, ChatError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut interactions = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| ChatError::LogRecord {
                line: index + 1,
                source,
            })?;
            interactions.push(record);
        }
        Ok(interactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let logger = ChatLogger::new(dir.path().join("absent.jsonl"));
        assert!(logger.load_interactions().unwrap().is_empty());
    }

    #[test]
    fn appends_one_line_per_turn() {
        let dir = TempDir::new().unwrap();
        let logger = ChatLogger::new(dir.path().join("log.jsonl"));
        logger.log_interaction("How do I reset my password?", "Why?").unwrap();
        logger.log_interaction("labas", "Hello!").unwrap();

        let raw = fs::read_to_string(logger.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert_eq!(
            raw.lines().next().unwrap(),
            r#"{"input":"How do I reset my password?","output":"Why?"}"#
        );

        let turns = logger.load_interactions().unwrap();
        assert_eq!(turns[1], Interaction {
            input: "labas".into(),
            output: "Hello!".into(),
        });
    }

    #[test]
    fn malformed_line_reports_its_number() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        fs::write(&path, "{\"input\":\"a\",\"output\":\"b\"}\nnot json\n").unwrap();
        let err = ChatLogger::new(&path).load_interactions().unwrap_err();
        assert!(matches!(err, ChatError::LogRecord { line: 2, .. }));
    }
}
