//! Work-Order Store (`spec.md` §4.1): one JSON file per work order under
//! `<data_dir>/work-orders/<id>.json`. Modelled on the teacher's
//! append-per-record style persistence, but file-backed rather than
//! in-memory so the crate's on-disk layout (`spec.md` §6) is real.

use crate::error::{AgentGateError, Result};
use crate::models::{WorkOrder, WorkOrderStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Filter used by `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<WorkOrderStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// One category of corruption found by `validate_storage`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ValidationIssue {
    JsonParse { file: String, message: String },
    SchemaInvalid { file: String, missing_field: String },
    IoError { file: String, message: String },
}

const REQUIRED_FIELDS: &[&str] = &[
    "id",
    "taskPrompt",
    "workspaceSource",
    "status",
    "createdAt",
    "maxIterations",
    "maxWallClockSeconds",
];

/// Per-id mutual exclusion so "only the Engine owning a run mutates that
/// file during execution" holds even if two callers race (`spec.md` §5).
pub struct WorkOrderStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl WorkOrderStore {
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let root = data_dir.into().join("work-orders");
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    pub async fn save(&self, work_order: &WorkOrder) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&work_order.id);
        let json = serde_json::to_string_pretty(work_order)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<WorkOrder> {
        let path = self.path_for(id);
        let bytes = fs::read(&path)
            .await
            .map_err(|_| AgentGateError::NotFound(id.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| AgentGateError::Corrupt(format!("{id}: {e}")))
    }

    pub async fn exists(&self, id: &str) -> bool {
        fs::metadata(self.path_for(id)).await.is_ok()
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        fs::remove_file(self.path_for(id))
            .await
            .map_err(|_| AgentGateError::NotFound(id.to_string()))
    }

    pub async fn update_status(&self, id: &str, status: WorkOrderStatus) -> Result<WorkOrder> {
        let _guard = self.write_lock.lock().await;
        let mut work_order = self.load_unlocked(id).await?;
        work_order.status = status;
        if status.is_terminal() {
            work_order.completed_at = Some(Utc::now());
        }
        let json = serde_json::to_string_pretty(&work_order)?;
        fs::write(self.path_for(id), json).await?;
        Ok(work_order)
    }

    async fn load_unlocked(&self, id: &str) -> Result<WorkOrder> {
        let bytes = fs::read(self.path_for(id))
            .await
            .map_err(|_| AgentGateError::NotFound(id.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| AgentGateError::Corrupt(format!("{id}: {e}")))
    }

    pub async fn get_all_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(".json") {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Newest-first by `created_at`, optionally filtered and paginated.
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<WorkOrder>> {
        let ids = self.get_all_ids().await?;
        let mut all = Vec::new();
        for id in ids {
            if let Ok(wo) = self.load(&id).await {
                if filter.status.map(|s| s == wo.status).unwrap_or(true) {
                    all.push(wo);
                }
            }
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.min(all.len());
        let end = match filter.limit {
            Some(limit) => (offset + limit).min(all.len()),
            None => all.len(),
        };
        Ok(all[offset..end].to_vec())
    }

    pub async fn count(&self, status: Option<WorkOrderStatus>) -> Result<usize> {
        Ok(self
            .list(ListFilter {
                status,
                limit: None,
                offset: 0,
            })
            .await?
            .len())
    }

    /// Deletes records matching the filters, or only reports what would be
    /// deleted when `dry_run` is set.
    pub async fn purge(
        &self,
        statuses: Option<&[WorkOrderStatus]>,
        older_than: Option<DateTime<Utc>>,
        dry_run: bool,
    ) -> Result<Vec<String>> {
        let ids = self.get_all_ids().await?;
        let mut purged = Vec::new();
        for id in ids {
            let Ok(wo) = self.load(&id).await else { continue };
            let status_match = statuses.map(|s| s.contains(&wo.status)).unwrap_or(true);
            let age_match = older_than.map(|cutoff| wo.created_at < cutoff).unwrap_or(true);
            if status_match && age_match {
                if !dry_run {
                    self.delete(&id).await?;
                }
                purged.push(id);
            }
        }
        Ok(purged)
    }

    /// Startup validation: every file on disk is classified as valid or
    /// attributed to one of the three issue categories (`spec.md` §4.1).
    /// Corrupt files are listed, never deleted.
    pub async fn validate_storage(&self) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) => {
                issues.push(ValidationIssue::IoError {
                    file: self.root.display().to_string(),
                    message: e.to_string(),
                });
                return Ok(issues);
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("<unknown>")
                .to_string();
            match fs::read(&path).await {
                Err(e) => issues.push(ValidationIssue::IoError {
                    file: file_name,
                    message: e.to_string(),
                }),
                Ok(bytes) => {
                    self.validate_one(&file_name, &bytes, &mut issues);
                }
            }
        }
        Ok(issues)
    }

    fn validate_one(&self, file_name: &str, bytes: &[u8], issues: &mut Vec<ValidationIssue>) {
        let value: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                issues.push(ValidationIssue::JsonParse {
                    file: file_name.to_string(),
                    message: e.to_string(),
                });
                return;
            }
        };
        let Some(obj) = value.as_object() else {
            issues.push(ValidationIssue::SchemaInvalid {
                file: file_name.to_string(),
                missing_field: "<root is not an object>".to_string(),
            });
            return;
        };
        for field in REQUIRED_FIELDS {
            if !obj.contains_key(*field) {
                issues.push(ValidationIssue::SchemaInvalid {
                    file: file_name.to_string(),
                    missing_field: (*field).to_string(),
                });
                return;
            }
        }
        if let Some(created_at) = obj.get("createdAt").and_then(|v| v.as_str()) {
            if DateTime::parse_from_rfc3339(created_at).is_err() {
                issues.push(ValidationIssue::SchemaInvalid {
                    file: file_name.to_string(),
                    missing_field: "createdAt (unparsable instant)".to_string(),
                });
                return;
            }
        }
        if serde_json::from_value::<WorkOrder>(value).is_err() {
            issues.push(ValidationIssue::SchemaInvalid {
                file: file_name.to_string(),
                missing_field: "<full deserialisation failed>".to_string(),
            });
        }
    }
}

impl WorkOrderStore {
    pub fn root_dir(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentType, WorkspaceSource};

    fn sample() -> WorkOrder {
        WorkOrder::new(
            "Add a hello world function".to_string(),
            WorkspaceSource::Local { path: "/tmp/ws".to_string() },
            AgentType::ClaudeCodeSubscription,
            3,
            3600,
        )
    }

    #[tokio::test]
    async fn round_trips_byte_for_byte_up_to_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkOrderStore::new(dir.path()).await.unwrap();
        let wo = sample();
        store.save(&wo).await.unwrap();
        let loaded = store.load(&wo.id).await.unwrap();
        assert_eq!(serde_json::to_value(&wo).unwrap(), serde_json::to_value(&loaded).unwrap());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkOrderStore::new(dir.path()).await.unwrap();
        for i in 0..5 {
            let mut wo = sample();
            wo.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.save(&wo).await.unwrap();
        }
        let page = store
            .list(ListFilter { status: None, limit: Some(2), offset: 0 })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].created_at > page[1].created_at);
    }

    #[tokio::test]
    async fn validate_storage_flags_corrupt_files_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkOrderStore::new(dir.path()).await.unwrap();
        let bad_path = store.root_dir().join("broken.json");
        fs::write(&bad_path, b"{ not json").await.unwrap();
        let issues = store.validate_storage().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert!(matches!(issues[0], ValidationIssue::JsonParse { .. }));
        assert!(fs::metadata(&bad_path).await.is_ok());
    }

    #[tokio::test]
    async fn validate_storage_passes_a_freshly_saved_work_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkOrderStore::new(dir.path()).await.unwrap();
        store.save(&sample()).await.unwrap();
        let issues = store.validate_storage().await.unwrap();
        assert!(issues.is_empty(), "expected no issues, got: {issues:?}");
    }

    #[tokio::test]
    async fn purge_dry_run_reports_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkOrderStore::new(dir.path()).await.unwrap();
        let wo = sample();
        store.save(&wo).await.unwrap();
        let purged = store
            .purge(Some(&[WorkOrderStatus::Pending]), None, true)
            .await
            .unwrap();
        assert_eq!(purged, vec![wo.id.clone()]);
        assert!(store.exists(&wo.id).await);
    }
}
