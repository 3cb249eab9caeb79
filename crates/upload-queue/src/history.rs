use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A completed upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub file_name: String,
    pub size: u64,
    pub completed_at: DateTime<Utc>,
    pub resource_url: String,
}

impl HistoryEntry {
    /// Creates an entry stamped with the current time.
    pub fn now(file_name: impl Into<String>, size: u64, resource_url: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            size,
            completed_at: Utc::now(),
            resource_url: resource_url.into(),
        }
    }
}

/// Completed uploads, newest first. Entries are never modified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.entries.insert(0, entry);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes delivered.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Serializes the log as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_first() {
        let mut log = HistoryLog::new();
        log.record(HistoryEntry::now("a.txt", 1, "u/1"));
        log.record(HistoryEntry::now("b.txt", 2, "u/2"));

        let names: Vec<_> = log.entries().iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, ["b.txt", "a.txt"]);
        assert_eq!(log.len(), 2);
        assert_eq!(log.total_bytes(), 3);
    }

    #[test]
    fn serializes_as_array() {
        let mut log = HistoryLog::new();
        log.record(HistoryEntry::now("a.txt", 10, "memory://uploads/1"));

        let json = log.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["fileName"], "a.txt");
        assert_eq!(value[0]["size"], 10);
        assert_eq!(value[0]["resourceUrl"], "memory://uploads/1");
        assert!(value[0]["completedAt"].is_string());

        let parsed: HistoryLog = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, log);
    }
}
