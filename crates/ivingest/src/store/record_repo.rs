//! Canonical inspection records produced by the persist stage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::model::{
    Finding, FindingCategory, FindingSeverity, InspectionRecord, InspectorRecord, PropertyRecord,
    ResultSummary,
};
use crate::store::{parse_ts, ts, Database, StoreError};

/// A persisted inspection with its rollups.
#[derive(Debug, Clone)]
pub struct StoredInspection {
    pub id: String,
    pub job_id: String,
    pub tenant: String,
    pub record: InspectionRecord,
    pub summary: ResultSummary,
    pub created_at: DateTime<Utc>,
}

pub struct RecordRepo {
    db: Arc<Database>,
}

impl RecordRepo {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Writes the inspection row and all findings in one transaction: either
    /// the full record lands or nothing does.
    pub fn insert(
        &self,
        job_id: &str,
        tenant: &str,
        record: &InspectionRecord,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let inspection_id = uuid::Uuid::new_v4().to_string();
        let summary = record.summary();

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO inspections (id, job_id, tenant, property_json, inspector_json,
                     findings_count, critical_findings, major_findings, minor_findings,
                     informational_findings, estimated_cost, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    inspection_id,
                    job_id,
                    tenant,
                    serde_json::to_string(&record.property)?,
                    serde_json::to_string(&record.inspector)?,
                    summary.findings_count,
                    summary.critical_findings,
                    summary.major_findings,
                    summary.minor_findings,
                    summary.informational_findings,
                    summary.estimated_cost,
                    ts(now),
                ],
            )?;

            for finding in &record.findings {
                tx.execute(
                    "INSERT INTO findings (id, inspection_id, category, severity, title,
                         description, location, recommendation, estimated_cost, priority)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        finding.id,
                        inspection_id,
                        finding.category.as_str(),
                        finding.severity.as_str(),
                        finding.title,
                        finding.description,
                        finding.location,
                        finding.recommendation,
                        finding.estimated_cost,
                        finding.priority,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(inspection_id)
        })
    }

    pub fn get_by_job(&self, job_id: &str) -> Result<Option<StoredInspection>, StoreError> {
        self.db.with_conn(|conn| {
            let header: Option<(String, String, String, String, String)> = conn
                .query_row(
                    "SELECT id, tenant, property_json, inspector_json, created_at
                     FROM inspections WHERE job_id = ?1",
                    params![job_id],
                    |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                    },
                )
                .optional()?;

            let Some((id, tenant, property_json, inspector_json, created_at)) = header else {
                return Ok(None);
            };

            let property: PropertyRecord = serde_json::from_str(&property_json)?;
            let inspector: InspectorRecord = serde_json::from_str(&inspector_json)?;

            let mut stmt = conn.prepare(
                "SELECT id, category, severity, title, description, location,
                        recommendation, estimated_cost, priority
                 FROM findings WHERE inspection_id = ?1 ORDER BY priority DESC, id ASC",
            )?;
            let findings = stmt
                .query_map(params![id], |r| {
                    let category: String = r.get(1)?;
                    let severity: String = r.get(2)?;
                    Ok(Finding {
                        id: r.get(0)?,
                        category: FindingCategory::parse(&category)
                            .unwrap_or(FindingCategory::Other),
                        severity: FindingSeverity::parse(&severity)
                            .unwrap_or(FindingSeverity::Informational),
                        title: r.get(3)?,
                        description: r.get(4)?,
                        location: r.get(5)?,
                        recommendation: r.get(6)?,
                        estimated_cost: r.get(7)?,
                        priority: r.get::<_, u32>(8)? as u8,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let record = InspectionRecord {
                property,
                inspector,
                findings,
            };
            let summary = record.summary();

            Ok(Some(StoredInspection {
                id,
                job_id: job_id.to_string(),
                tenant,
                record,
                summary,
                created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
            }))
        })
    }
}
