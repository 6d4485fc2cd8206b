//! Append-only JSONL sink for persisted entities

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::entity::Entity;

/// One line of the entity log
#[derive(Debug, Serialize)]
pub struct EntityRecord<'a> {
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub entity: &'a Entity,
}

pub struct EntityLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl EntityLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Entity log initialized to {}", path.display());
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entity; failures are logged, never propagated
    pub fn append(&self, entity: &Entity) {
        let record = EntityRecord {
            recorded_at: Utc::now(),
            entity,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize {} entity: {}", entity.kind(), e);
                return;
            }
        };

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(writer, "{}", line) {
            error!("Failed to write entity: {}", e);
        }
        if let Err(e) = writer.flush() {
            error!("Failed to flush entity log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Waypoint;

    #[test]
    fn test_appends_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.jsonl");
        let log = EntityLog::open(&path).unwrap();

        let entity = Entity::Waypoint(Waypoint {
            external_id: "stop-1".into(),
            lat: 40.0,
            lon: -105.0,
        });
        log.append(&entity);
        log.append(&entity);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["type"], "waypoint");
        assert_eq!(parsed["external_id"], "stop-1");
        assert!(parsed.get("recorded_at").is_some());
    }
}
