//! Quarantine repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use folio_core::{
    new_v7, payload_fingerprint, Error, NewQuarantineEntry, QuarantineEntry, QuarantineReason,
    QuarantineRepository, ResolutionAction, Result,
};

/// PostgreSQL implementation of [`QuarantineRepository`].
#[derive(Clone)]
pub struct PgQuarantineRepository {
    pool: Pool<Postgres>,
}

const QUARANTINE_COLUMNS: &str = "id, entity_type, entity_ref, reason, payload, \
     competing_values, duplicate_candidates, fingerprint, resolved, action, notes, \
     resolved_by, created_at, resolved_at";

impl PgQuarantineRepository {
    /// Create a new quarantine repository.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> Result<QuarantineEntry> {
        let reason_str: String = row.get("reason");
        let action_str: Option<String> = row.get("action");

        Ok(QuarantineEntry {
            id: row.get("id"),
            entity_type: row.get("entity_type"),
            entity_ref: row.get("entity_ref"),
            reason: QuarantineReason::parse(&reason_str)
                .ok_or_else(|| Error::Internal(format!("unknown quarantine reason: {reason_str}")))?,
            payload: row.get("payload"),
            competing_values: row.get("competing_values"),
            duplicate_candidates: row.get("duplicate_candidates"),
            fingerprint: row.get("fingerprint"),
            resolved: row.get("resolved"),
            action: action_str.as_deref().and_then(ResolutionAction::parse),
            notes: row.get("notes"),
            resolved_by: row.get("resolved_by"),
            created_at: row.get("created_at"),
            resolved_at: row.get("resolved_at"),
        })
    }
}

#[async_trait]
impl QuarantineRepository for PgQuarantineRepository {
    async fn push_deduplicated(&self, entry: NewQuarantineEntry) -> Result<Option<Uuid>> {
        let id = new_v7();
        let fingerprint = payload_fingerprint(&entry.payload);

        // Atomic check-and-insert so concurrent runners quarantining the
        // same payload produce one review item, not many.
        let inserted: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO quarantine_entry
                 (id, entity_type, entity_ref, reason, payload, competing_values,
                  duplicate_candidates, fingerprint, created_at)
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, NOW()
             WHERE NOT EXISTS (
                 SELECT 1 FROM quarantine_entry
                 WHERE fingerprint = $8 AND resolved = FALSE
             )
             RETURNING id",
        )
        .bind(id)
        .bind(&entry.entity_type)
        .bind(&entry.entity_ref)
        .bind(entry.reason.as_str())
        .bind(&entry.payload)
        .bind(&entry.competing_values)
        .bind(&entry.duplicate_candidates)
        .bind(&fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(inserted)
    }

    async fn resolve(
        &self,
        id: Uuid,
        action: ResolutionAction,
        actor: &str,
        notes: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE quarantine_entry
             SET resolved = TRUE, action = $1, resolved_by = $2, notes = $3,
                 resolved_at = NOW()
             WHERE id = $4 AND resolved = FALSE",
        )
        .bind(action.as_str())
        .bind(actor)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_pending(&self, limit: i64, offset: i64) -> Result<Vec<QuarantineEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {QUARANTINE_COLUMNS} FROM quarantine_entry
             WHERE resolved = FALSE
             ORDER BY created_at
             LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_row).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<QuarantineEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {QUARANTINE_COLUMNS} FROM quarantine_entry WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_row).transpose()
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM quarantine_entry WHERE resolved = FALSE")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count)
    }
}
