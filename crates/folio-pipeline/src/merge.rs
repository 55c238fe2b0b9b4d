//! Merge policy: decide, per record and per field, what gets written,
//! what gets skipped, and what goes to quarantine.
//!
//! Correctness is prioritized over throughput: a merge the policy cannot
//! justify is quarantined for asynchronous curation, never silently
//! applied and never silently dropped.
//!
//! Planning is a pure function over the normalized record and the
//! entity's current provenance rows, so the policy is unit-testable
//! without any store.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use tracing::warn;

use folio_core::{
    defaults, EntityStore, FieldProvenance, FieldValue, FieldWrite, NewQuarantineEntry,
    NormalizedRecord, ProvenanceRepository, QuarantineReason, QuarantineRepository, Result,
    SourceMeta,
};

use crate::stores::StoreHandles;

/// Thresholds steering the merge policy.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Records below this overall confidence are quarantined.
    pub min_confidence: f32,
    /// Duplicate-candidate score band treated as a fuzzy match.
    pub fuzzy_low: f32,
    pub fuzzy_high: f32,
    /// Trust weight at which a source counts as "trusted" for conflict
    /// detection.
    pub trusted_weight: f32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            min_confidence: defaults::MERGE_MIN_CONFIDENCE,
            fuzzy_low: defaults::FUZZY_MATCH_LOW,
            fuzzy_high: defaults::FUZZY_MATCH_HIGH,
            trusted_weight: defaults::TRUSTED_SOURCE_WEIGHT,
        }
    }
}

impl MergeConfig {
    pub fn with_min_confidence(mut self, threshold: f32) -> Self {
        self.min_confidence = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_fuzzy_band(mut self, low: f32, high: f32) -> Self {
        self.fuzzy_low = low.clamp(0.0, 1.0);
        self.fuzzy_high = high.clamp(self.fuzzy_low, 1.0);
        self
    }

    pub fn with_trusted_weight(mut self, weight: f32) -> Self {
        self.trusted_weight = weight.clamp(0.0, 1.0);
        self
    }
}

/// The planned handling of one normalized record.
#[derive(Debug, Default)]
pub struct MergePlan {
    /// Fields to write to the entity store (and record provenance for).
    pub apply: HashMap<String, FieldValue>,
    /// Fields skipped because their provenance row is locked.
    pub skipped_locked: Vec<String>,
    /// Fields skipped because the incumbent value outranks the incoming
    /// one and the incoming source is not trusted enough to conflict.
    pub skipped_outranked: Vec<String>,
    /// Quarantine entry to raise instead of (or alongside) the writes.
    pub quarantine: Option<NewQuarantineEntry>,
}

/// Plan the merge of one normalized record against the entity's current
/// provenance.
pub fn plan_merge(
    record: &NormalizedRecord,
    source: &SourceMeta,
    existing: &[FieldProvenance],
    config: &MergeConfig,
) -> MergePlan {
    let mut plan = MergePlan::default();

    // A record the source itself barely believes in is reviewed, not merged.
    let overall = record.overall_confidence();
    if overall < config.min_confidence {
        plan.quarantine = Some(NewQuarantineEntry {
            entity_type: record.entity_type.clone(),
            entity_ref: record.entity_ref.clone(),
            reason: QuarantineReason::LowConfidence,
            payload: record_payload(record),
            competing_values: None,
            duplicate_candidates: None,
        });
        return plan;
    }

    // A duplicate candidate in the fuzzy band is neither a safe match nor
    // a clearly distinct record; a human decides.
    let fuzzy: Vec<_> = record
        .duplicate_candidates
        .iter()
        .filter(|c| c.score >= config.fuzzy_low && c.score < config.fuzzy_high)
        .collect();
    if !fuzzy.is_empty() {
        plan.quarantine = Some(NewQuarantineEntry {
            entity_type: record.entity_type.clone(),
            entity_ref: record.entity_ref.clone(),
            reason: QuarantineReason::FuzzyMatch,
            payload: record_payload(record),
            competing_values: None,
            duplicate_candidates: serde_json::to_value(&fuzzy).ok(),
        });
        return plan;
    }

    let by_field: HashMap<&str, &FieldProvenance> = existing
        .iter()
        .map(|row| (row.field_name.as_str(), row))
        .collect();

    let mut conflicts: HashMap<String, JsonValue> = HashMap::new();

    for (field_name, value) in &record.fields {
        let Some(incumbent) = by_field.get(field_name.as_str()) else {
            plan.apply.insert(field_name.clone(), value.clone());
            continue;
        };

        if incumbent.locked {
            plan.skipped_locked.push(field_name.clone());
            continue;
        }

        // Same source refreshing its own value is always allowed.
        if incumbent.source_name == source.name {
            plan.apply.insert(field_name.clone(), value.clone());
            continue;
        }

        let incoming_score = value.confidence * source.trust_weight;
        if incoming_score >= incumbent.effective_score() {
            plan.apply.insert(field_name.clone(), value.clone());
            continue;
        }

        // The incumbent outranks the incoming value. Two trusted sources
        // disagreeing is a conflict for review; an untrusted source is
        // simply prevented from clobbering the verified value.
        if source.trust_weight >= config.trusted_weight
            && incumbent.trust_weight >= config.trusted_weight
        {
            conflicts.insert(
                field_name.clone(),
                json!({
                    "incoming": {
                        "source": source.name,
                        "value": value.value,
                        "score": incoming_score,
                    },
                    "incumbent": {
                        "source": incumbent.source_name,
                        "score": incumbent.effective_score(),
                        "fetched_at": incumbent.fetched_at,
                    },
                }),
            );
        } else {
            plan.skipped_outranked.push(field_name.clone());
        }
    }

    if !conflicts.is_empty() {
        plan.quarantine = Some(NewQuarantineEntry {
            entity_type: record.entity_type.clone(),
            entity_ref: record.entity_ref.clone(),
            reason: QuarantineReason::Conflict,
            payload: record_payload(record),
            competing_values: serde_json::to_value(&conflicts).ok(),
            duplicate_candidates: None,
        });
    }

    plan
}

fn record_payload(record: &NormalizedRecord) -> JsonValue {
    serde_json::to_value(record).unwrap_or_else(|_| json!({"entity_ref": record.entity_ref}))
}

/// Outcome of applying one normalized record through the merge policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyOutcome {
    /// Fields written to the entity store.
    pub applied_fields: usize,
    /// Whether a quarantine entry was raised.
    pub quarantined: bool,
}

/// Plan and execute the merge of one normalized record: quarantine what
/// the policy cannot justify, upsert the rest into the entity store, and
/// record provenance for every written field.
///
/// Shared by the page loop and the DLQ replay path.
pub async fn apply_record(
    stores: &StoreHandles,
    entity_store: &Arc<dyn EntityStore>,
    source: &SourceMeta,
    config: &MergeConfig,
    record: &NormalizedRecord,
) -> Result<ApplyOutcome> {
    let existing = stores
        .provenance
        .for_entity(&record.entity_type, &record.entity_ref)
        .await?;

    let plan = plan_merge(record, source, &existing, config);
    let mut outcome = ApplyOutcome::default();

    if let Some(entry) = plan.quarantine {
        stores.quarantine.push_deduplicated(entry).await?;
        outcome.quarantined = true;
    }

    if plan.apply.is_empty() {
        return Ok(outcome);
    }

    let fields: HashMap<String, JsonValue> = plan
        .apply
        .iter()
        .map(|(name, fv)| (name.clone(), fv.value.clone()))
        .collect();

    entity_store
        .upsert(&record.entity_type, &record.entity_ref, &fields)
        .await?;
    outcome.applied_fields = plan.apply.len();

    for (field_name, value) in &plan.apply {
        let write = FieldWrite {
            entity_type: record.entity_type.clone(),
            entity_id: record.entity_ref.clone(),
            field_name: field_name.clone(),
            source_name: source.name.clone(),
            source_record_id: None,
            source_url: None,
            confidence: value.confidence,
            trust_weight: source.trust_weight,
            license: source.license.clone(),
        };
        // The upsert itself refuses locked rows; a lock raced in after
        // planning is simply a no-op here.
        if let Err(e) = stores.provenance.upsert(&write).await {
            warn!(
                entity_ref = %record.entity_ref,
                field = %field_name,
                error = %e,
                "provenance write failed"
            );
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use folio_core::DuplicateCandidate;
    use uuid::Uuid;

    fn record(fields: Vec<(&str, JsonValue, f32)>) -> NormalizedRecord {
        NormalizedRecord {
            entity_type: "edition".to_string(),
            entity_ref: "isbn:9780786915606".to_string(),
            fields: fields
                .into_iter()
                .map(|(name, value, conf)| (name.to_string(), FieldValue::new(value, conf)))
                .collect(),
            duplicate_candidates: vec![],
        }
    }

    fn provenance(field: &str, source: &str, confidence: f32, trust: f32) -> FieldProvenance {
        FieldProvenance {
            id: Uuid::new_v4(),
            entity_type: "edition".to_string(),
            entity_id: "isbn:9780786915606".to_string(),
            field_name: field.to_string(),
            source_name: source.to_string(),
            source_record_id: None,
            source_url: None,
            confidence,
            trust_weight: trust,
            license: None,
            locked: false,
            locked_by: None,
            lock_reason: None,
            fetched_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn locked(mut row: FieldProvenance) -> FieldProvenance {
        row.locked = true;
        row.locked_by = Some("curator".to_string());
        row
    }

    #[test]
    fn test_fresh_fields_are_applied() {
        let source = SourceMeta::new("pricewatch", 0.8);
        let rec = record(vec![("market_price", json!(12.5), 0.9)]);

        let plan = plan_merge(&rec, &source, &[], &MergeConfig::default());
        assert_eq!(plan.apply.len(), 1);
        assert!(plan.quarantine.is_none());
    }

    #[test]
    fn test_low_confidence_record_is_quarantined_wholesale() {
        let source = SourceMeta::new("scrapey", 0.4);
        let rec = record(vec![
            ("title", json!("Drgons of Atumn"), 0.3),
            ("author", json!("M. Wies"), 0.2),
        ]);

        let plan = plan_merge(&rec, &source, &[], &MergeConfig::default());
        assert!(plan.apply.is_empty());
        let q = plan.quarantine.expect("low confidence must quarantine");
        assert_eq!(q.reason, QuarantineReason::LowConfidence);
    }

    #[test]
    fn test_fuzzy_duplicate_is_quarantined() {
        let source = SourceMeta::new("bibliodata", 0.9);
        let mut rec = record(vec![("title", json!("Dragons of Autumn Twilight"), 0.95)]);
        rec.duplicate_candidates = vec![DuplicateCandidate {
            entity_ref: "isbn:9780880381734".to_string(),
            score: 0.8,
        }];

        let plan = plan_merge(&rec, &source, &[], &MergeConfig::default());
        assert!(plan.apply.is_empty());
        let q = plan.quarantine.unwrap();
        assert_eq!(q.reason, QuarantineReason::FuzzyMatch);
        assert!(q.duplicate_candidates.is_some());
    }

    #[test]
    fn test_clear_duplicate_scores_do_not_quarantine() {
        let source = SourceMeta::new("bibliodata", 0.9);
        let mut rec = record(vec![("title", json!("Dragons of Autumn Twilight"), 0.95)]);
        // Above the band: safe automatic match. Below: clearly distinct.
        rec.duplicate_candidates = vec![
            DuplicateCandidate {
                entity_ref: "isbn:9780880381734".to_string(),
                score: 0.99,
            },
            DuplicateCandidate {
                entity_ref: "isbn:9780140187394".to_string(),
                score: 0.1,
            },
        ];

        let plan = plan_merge(&rec, &source, &[], &MergeConfig::default());
        assert_eq!(plan.apply.len(), 1);
        assert!(plan.quarantine.is_none());
    }

    #[test]
    fn test_locked_field_is_skipped() {
        let source = SourceMeta::new("pricewatch", 0.9);
        let rec = record(vec![("market_price", json!(9.99), 0.99)]);
        let existing = vec![locked(provenance("market_price", "curator", 1.0, 1.0))];

        let plan = plan_merge(&rec, &source, &existing, &MergeConfig::default());
        assert!(plan.apply.is_empty());
        assert_eq!(plan.skipped_locked, vec!["market_price".to_string()]);
        assert!(plan.quarantine.is_none());
    }

    #[test]
    fn test_same_source_refresh_is_applied() {
        let source = SourceMeta::new("pricewatch", 0.3);
        let rec = record(vec![("market_price", json!(11.0), 0.5)]);
        let existing = vec![provenance("market_price", "pricewatch", 0.9, 0.3)];

        let plan = plan_merge(&rec, &source, &existing, &MergeConfig::default());
        assert_eq!(plan.apply.len(), 1);
    }

    #[test]
    fn test_higher_score_wins() {
        let source = SourceMeta::new("bibliodata", 0.9);
        let rec = record(vec![("page_count", json!(448), 0.9)]);
        let existing = vec![provenance("page_count", "scrapey", 0.9, 0.2)];

        let plan = plan_merge(&rec, &source, &existing, &MergeConfig::default());
        assert_eq!(plan.apply.len(), 1);
        assert!(plan.quarantine.is_none());
    }

    #[test]
    fn test_low_trust_source_cannot_clobber() {
        let source = SourceMeta::new("scrapey", 0.2);
        let rec = record(vec![("page_count", json!(9000), 0.9)]);
        let existing = vec![provenance("page_count", "bibliodata", 0.9, 0.9)];

        let plan = plan_merge(&rec, &source, &existing, &MergeConfig::default());
        assert!(plan.apply.is_empty());
        assert_eq!(plan.skipped_outranked, vec!["page_count".to_string()]);
        assert!(plan.quarantine.is_none(), "untrusted loser is not a conflict");
    }

    #[test]
    fn test_trusted_disagreement_is_a_conflict() {
        let source = SourceMeta::new("fandom", 0.8);
        let rec = record(vec![("affiliation", json!("red robes"), 0.7)]);
        let existing = vec![provenance("affiliation", "wikia", 0.95, 0.9)];

        let plan = plan_merge(&rec, &source, &existing, &MergeConfig::default());
        assert!(plan.apply.is_empty());
        let q = plan.quarantine.unwrap();
        assert_eq!(q.reason, QuarantineReason::Conflict);
        let competing = q.competing_values.unwrap();
        assert!(competing.get("affiliation").is_some());
    }

    #[test]
    fn test_mixed_plan_applies_and_conflicts_independently() {
        let source = SourceMeta::new("fandom", 0.8);
        let rec = record(vec![
            ("affiliation", json!("red robes"), 0.7), // conflicts
            ("home", json!("Palanthas"), 0.9),        // fresh, applies
        ]);
        let existing = vec![provenance("affiliation", "wikia", 0.95, 0.9)];

        let plan = plan_merge(&rec, &source, &existing, &MergeConfig::default());
        assert_eq!(plan.apply.len(), 1);
        assert!(plan.apply.contains_key("home"));
        assert!(plan.quarantine.is_some());
    }
}
