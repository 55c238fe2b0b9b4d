//! Field provenance repository implementation.
//!
//! Tracks, per mutable field of a merged entity, which source last wrote
//! it, with what confidence and trust, and whether it is locked against
//! further automated writes. The lock is enforced in the upsert statement
//! itself, so a locked field is a no-op regardless of caller behavior.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use folio_core::{new_v7, Error, FieldProvenance, FieldWrite, ProvenanceRepository, Result};

/// PostgreSQL implementation of [`ProvenanceRepository`].
#[derive(Clone)]
pub struct PgProvenanceRepository {
    pool: Pool<Postgres>,
}

const PROVENANCE_COLUMNS: &str = "id, entity_type, entity_id, field_name, source_name, \
     source_record_id, source_url, confidence, trust_weight, license, locked, locked_by, \
     lock_reason, fetched_at, updated_at";

impl PgProvenanceRepository {
    /// Create a new provenance repository.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> FieldProvenance {
        FieldProvenance {
            id: row.get("id"),
            entity_type: row.get("entity_type"),
            entity_id: row.get("entity_id"),
            field_name: row.get("field_name"),
            source_name: row.get("source_name"),
            source_record_id: row.get("source_record_id"),
            source_url: row.get("source_url"),
            confidence: row.get("confidence"),
            trust_weight: row.get("trust_weight"),
            license: row.get("license"),
            locked: row.get("locked"),
            locked_by: row.get("locked_by"),
            lock_reason: row.get("lock_reason"),
            fetched_at: row.get("fetched_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl ProvenanceRepository for PgProvenanceRepository {
    async fn upsert(&self, write: &FieldWrite) -> Result<bool> {
        let applied: Option<sqlx::types::Uuid> = sqlx::query_scalar(
            "INSERT INTO field_provenance
                 (id, entity_type, entity_id, field_name, source_name, source_record_id,
                  source_url, confidence, trust_weight, license, fetched_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
             ON CONFLICT (entity_type, entity_id, field_name) DO UPDATE
             SET source_name = $5, source_record_id = $6, source_url = $7,
                 confidence = $8, trust_weight = $9, license = $10,
                 fetched_at = NOW(), updated_at = NOW()
             WHERE field_provenance.locked = FALSE
             RETURNING id",
        )
        .bind(new_v7())
        .bind(&write.entity_type)
        .bind(&write.entity_id)
        .bind(&write.field_name)
        .bind(&write.source_name)
        .bind(&write.source_record_id)
        .bind(&write.source_url)
        .bind(write.confidence)
        .bind(write.trust_weight)
        .bind(&write.license)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(applied.is_some())
    }

    async fn get(
        &self,
        entity_type: &str,
        entity_id: &str,
        field_name: &str,
    ) -> Result<Option<FieldProvenance>> {
        let row = sqlx::query(&format!(
            "SELECT {PROVENANCE_COLUMNS} FROM field_provenance
             WHERE entity_type = $1 AND entity_id = $2 AND field_name = $3"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .bind(field_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_row))
    }

    async fn for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<FieldProvenance>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROVENANCE_COLUMNS} FROM field_provenance
             WHERE entity_type = $1 AND entity_id = $2
             ORDER BY field_name"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }

    async fn by_source(&self, source_name: &str, limit: i64) -> Result<Vec<FieldProvenance>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROVENANCE_COLUMNS} FROM field_provenance
             WHERE source_name = $1
             ORDER BY updated_at DESC
             LIMIT $2"
        ))
        .bind(source_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }

    async fn lock(
        &self,
        entity_type: &str,
        entity_id: &str,
        field_name: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE field_provenance
             SET locked = TRUE, locked_by = $1, lock_reason = $2, updated_at = NOW()
             WHERE entity_type = $3 AND entity_id = $4 AND field_name = $5",
        )
        .bind(actor)
        .bind(reason)
        .bind(entity_type)
        .bind(entity_id)
        .bind(field_name)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "provenance {entity_type}/{entity_id}/{field_name}"
            )));
        }
        Ok(())
    }

    async fn unlock(&self, entity_type: &str, entity_id: &str, field_name: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE field_provenance
             SET locked = FALSE, locked_by = NULL, lock_reason = NULL, updated_at = NOW()
             WHERE entity_type = $1 AND entity_id = $2 AND field_name = $3",
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(field_name)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "provenance {entity_type}/{entity_id}/{field_name}"
            )));
        }
        Ok(())
    }
}
