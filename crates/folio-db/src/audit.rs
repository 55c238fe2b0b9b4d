//! Append-only operational audit repository.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use serde_json::Value as JsonValue;

use folio_core::{new_v7, AuditEvent, AuditEventKind, AuditRepository, Error, Result};

/// PostgreSQL implementation of [`AuditRepository`].
#[derive(Clone)]
pub struct PgAuditRepository {
    pool: Pool<Postgres>,
}

impl PgAuditRepository {
    /// Create a new audit repository.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    async fn append(&self, kind: AuditEventKind, job_name: &str, detail: JsonValue) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingest_audit (id, kind, job_name, detail, created_at)
             VALUES ($1, $2, $3, $4, NOW())",
        )
        .bind(new_v7())
        .bind(kind.as_str())
        .bind(job_name)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn list(
        &self,
        kind: Option<AuditEventKind>,
        job_name: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let mut conditions = Vec::new();
        let mut param_idx = 1;

        if kind.is_some() {
            conditions.push(format!("kind = ${param_idx}"));
            param_idx += 1;
        }
        if job_name.is_some() {
            conditions.push(format!("job_name = ${param_idx}"));
            param_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT id, kind, job_name, detail, created_at
             FROM ingest_audit
             {where_clause}
             ORDER BY created_at DESC
             LIMIT ${param_idx}"
        );

        let mut q = sqlx::query(&query);
        if let Some(k) = kind {
            q = q.bind(k.as_str());
        }
        if let Some(name) = job_name {
            q = q.bind(name.to_string());
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await.map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| {
                let kind_str: String = row.get("kind");
                Ok(AuditEvent {
                    id: row.get("id"),
                    kind: AuditEventKind::parse(&kind_str)
                        .ok_or_else(|| Error::Internal(format!("unknown audit kind: {kind_str}")))?,
                    job_name: row.get("job_name"),
                    detail: row.get("detail"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}
