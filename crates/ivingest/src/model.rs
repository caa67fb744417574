//! Domain types shared across the ingestion core.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::blob::BlobRef;

/// Lifecycle state of an ingestion job.
///
/// `Completed`, `Failed` and `Dead` are terminal; a job never leaves a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared kind of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Doc,
    Docx,
    Xls,
    Xlsx,
    Csv,
    Jpg,
    Jpeg,
    Png,
    Tiff,
    Bmp,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Doc => "doc",
            FileKind::Docx => "docx",
            FileKind::Xls => "xls",
            FileKind::Xlsx => "xlsx",
            FileKind::Csv => "csv",
            FileKind::Jpg => "jpg",
            FileKind::Jpeg => "jpeg",
            FileKind::Png => "png",
            FileKind::Tiff => "tiff",
            FileKind::Bmp => "bmp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileKind::Pdf),
            "doc" => Some(FileKind::Doc),
            "docx" => Some(FileKind::Docx),
            "xls" => Some(FileKind::Xls),
            "xlsx" => Some(FileKind::Xlsx),
            "csv" => Some(FileKind::Csv),
            "jpg" => Some(FileKind::Jpg),
            "jpeg" => Some(FileKind::Jpeg),
            "png" => Some(FileKind::Png),
            "tiff" => Some(FileKind::Tiff),
            "bmp" => Some(FileKind::Bmp),
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self,
            FileKind::Jpg | FileKind::Jpeg | FileKind::Png | FileKind::Tiff | FileKind::Bmp
        )
    }

    pub fn is_spreadsheet(&self) -> bool {
        matches!(self, FileKind::Xls | FileKind::Xlsx | FileKind::Csv)
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate-limit tier of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

/// Category of an inspection finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingCategory {
    Electrical,
    Plumbing,
    Structural,
    Hvac,
    Roofing,
    Interior,
    Exterior,
    Safety,
    Other,
}

impl FindingCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingCategory::Electrical => "electrical",
            FindingCategory::Plumbing => "plumbing",
            FindingCategory::Structural => "structural",
            FindingCategory::Hvac => "hvac",
            FindingCategory::Roofing => "roofing",
            FindingCategory::Interior => "interior",
            FindingCategory::Exterior => "exterior",
            FindingCategory::Safety => "safety",
            FindingCategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "electrical" => Some(FindingCategory::Electrical),
            "plumbing" => Some(FindingCategory::Plumbing),
            "structural" => Some(FindingCategory::Structural),
            "hvac" => Some(FindingCategory::Hvac),
            "roofing" => Some(FindingCategory::Roofing),
            "interior" => Some(FindingCategory::Interior),
            "exterior" => Some(FindingCategory::Exterior),
            "safety" => Some(FindingCategory::Safety),
            "other" => Some(FindingCategory::Other),
            _ => None,
        }
    }
}

/// Severity of an inspection finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Critical,
    Major,
    Minor,
    Informational,
}

impl FindingSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingSeverity::Critical => "critical",
            FindingSeverity::Major => "major",
            FindingSeverity::Minor => "minor",
            FindingSeverity::Informational => "informational",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(FindingSeverity::Critical),
            "major" => Some(FindingSeverity::Major),
            "minor" => Some(FindingSeverity::Minor),
            "informational" => Some(FindingSeverity::Informational),
            _ => None,
        }
    }

    /// Priority on the 1-10 scale used by downstream consumers.
    pub fn priority(&self) -> u8 {
        match self {
            FindingSeverity::Critical => 9,
            FindingSeverity::Major => 6,
            FindingSeverity::Minor => 3,
            FindingSeverity::Informational => 1,
        }
    }
}

/// Property classification recognized during field extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Residential,
    Commercial,
    Industrial,
}

/// A single extracted defect or observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: String,
    pub category: FindingCategory,
    pub severity: FindingSeverity,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    /// Priority level 1-10, derived from severity.
    pub priority: u8,
}

/// Property details extracted from an inspection report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_line1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_type: Option<PropertyType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub square_footage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_built: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bathrooms: Option<f32>,
}

/// Inspector details extracted from an inspection report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectorRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspection_date: Option<NaiveDate>,
}

/// The canonical record the pipeline persists for a completed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionRecord {
    pub property: PropertyRecord,
    pub inspector: InspectorRecord,
    pub findings: Vec<Finding>,
}

impl InspectionRecord {
    pub fn summary(&self) -> ResultSummary {
        let mut summary = ResultSummary {
            findings_count: self.findings.len() as u32,
            ..Default::default()
        };
        for finding in &self.findings {
            match finding.severity {
                FindingSeverity::Critical => summary.critical_findings += 1,
                FindingSeverity::Major => summary.major_findings += 1,
                FindingSeverity::Minor => summary.minor_findings += 1,
                FindingSeverity::Informational => summary.informational_findings += 1,
            }
            if let Some(cost) = finding.estimated_cost {
                summary.estimated_cost += cost;
            }
        }
        summary
    }
}

/// By-severity rollup attached to a completed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub findings_count: u32,
    pub critical_findings: u32,
    pub major_findings: u32,
    pub minor_findings: u32,
    pub informational_findings: u32,
    pub estimated_cost: f64,
}

/// Terminal error payload carried by failed and dead jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// An ingestion job as held by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub tenant: String,
    pub blob: BlobRef,
    pub kind: FileKind,
    /// Higher priority jobs are dequeued first.
    pub priority: i32,
    pub state: JobState,
    /// Progress percent in 0..=100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}
