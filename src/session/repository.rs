//! Session database repository.
//!
//! The relational store is collaborator-owned; the core only persists session
//! rows through this narrow interface so sessions survive restarts for
//! diagnostics and reconciliation.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{SessionRecord, SessionStatus};

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a session row.
    pub async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, name, backend, status, container_id, container_name,
                api_port, code_port, workspace_path, repo_url, branch,
                created_at, last_activity_at, stopped_at, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                backend = excluded.backend,
                status = excluded.status,
                container_id = excluded.container_id,
                container_name = excluded.container_name,
                api_port = excluded.api_port,
                code_port = excluded.code_port,
                workspace_path = excluded.workspace_path,
                repo_url = excluded.repo_url,
                branch = excluded.branch,
                last_activity_at = excluded.last_activity_at,
                stopped_at = excluded.stopped_at,
                error_message = excluded.error_message
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.backend.to_string())
        .bind(record.status.to_string())
        .bind(&record.container_id)
        .bind(&record.container_name)
        .bind(record.api_port)
        .bind(record.code_port)
        .bind(&record.workspace_path)
        .bind(&record.repo_url)
        .bind(&record.branch)
        .bind(&record.created_at)
        .bind(&record.last_activity_at)
        .bind(&record.stopped_at)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .context("upserting session")?;

        Ok(())
    }

    /// Get a session row by ID.
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, name, backend, status, container_id, container_name,
                   api_port, code_port, workspace_path, repo_url, branch,
                   created_at, last_activity_at, stopped_at, error_message
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(record)
    }

    /// List all session rows, newest first.
    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        let records = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, name, backend, status, container_id, container_name,
                   api_port, code_port, workspace_path, repo_url, branch,
                   created_at, last_activity_at, stopped_at, error_message
            FROM sessions
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        Ok(records)
    }

    /// Update status only.
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;

        Ok(())
    }

    /// Update the last-activity timestamp.
    pub async fn touch(&self, id: &str, at: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_activity_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touching session")?;

        Ok(())
    }

    /// Mark stopped with a timestamp.
    pub async fn mark_stopped(&self, id: &str, at: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = 'stopped', stopped_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("marking session stopped")?;

        Ok(())
    }

    /// Mark failed with an error cause.
    pub async fn mark_failed(&self, id: &str, at: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = 'failed', stopped_at = ?, error_message = ? WHERE id = ?",
        )
        .bind(at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session failed")?;

        Ok(())
    }

    /// Delete a session row.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::session::models::BackendKind;

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            name: format!("session {id}"),
            backend: BackendKind::Sandbox,
            status: SessionStatus::Provisioning,
            container_id: None,
            container_name: None,
            api_port: Some(10001),
            code_port: Some(20001),
            workspace_path: format!("/tmp/workspaces/{id}"),
            repo_url: None,
            branch: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            last_activity_at: "2026-01-01T00:00:00Z".to_string(),
            stopped_at: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        repo.upsert(&record("s1")).await.unwrap();
        let fetched = repo.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "s1");
        assert_eq!(fetched.status, SessionStatus::Provisioning);
        assert_eq!(fetched.api_port, Some(10001));

        // Upsert again with a new status; row count stays one
        let mut updated = record("s1");
        updated.status = SessionStatus::Ready;
        repo.upsert(&updated).await.unwrap();
        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn test_status_transitions_persist() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        repo.upsert(&record("s2")).await.unwrap();

        repo.update_status("s2", SessionStatus::Ready).await.unwrap();
        assert_eq!(
            repo.get("s2").await.unwrap().unwrap().status,
            SessionStatus::Ready
        );

        repo.mark_failed("s2", "2026-01-01T01:00:00Z", "health check failed")
            .await
            .unwrap();
        let failed = repo.get("s2").await.unwrap().unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("health check failed"));

        repo.delete("s2").await.unwrap();
        assert!(repo.get("s2").await.unwrap().is_none());
    }
}
