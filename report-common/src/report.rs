//! # Report
//!
//! Types describing a citizen sanitation report and the enrichment attributes derived from it.
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Enumeration of parsing errors for report attributes.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0} is not a valid PipelineStatus")]
    ParsePipelineStatusError(String),
    #[error("{0} is not a valid RiskLevel")]
    ParseRiskLevelError(String),
}

/// The closed set of issue categories a report can be classified as.
/// Serializes as snake_case and deserializes any label through `Category::normalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    GarbageDump,
    DustbinNotCleaned,
    BurningGarbage,
    OpenManhole,
    StagnantWater,
    DeadAnimal,
    SewageOverflow,
    SweepingNotDone,
    Other,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::GarbageDump,
        Category::DustbinNotCleaned,
        Category::BurningGarbage,
        Category::OpenManhole,
        Category::StagnantWater,
        Category::DeadAnimal,
        Category::SewageOverflow,
        Category::SweepingNotDone,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::GarbageDump => "garbage_dump",
            Category::DustbinNotCleaned => "dustbin_not_cleaned",
            Category::BurningGarbage => "burning_garbage",
            Category::OpenManhole => "open_manhole",
            Category::StagnantWater => "stagnant_water",
            Category::DeadAnimal => "dead_animal",
            Category::SewageOverflow => "sewage_overflow",
            Category::SweepingNotDone => "sweeping_not_done",
            Category::Other => "other",
        }
    }

    /// Map a free-form label, as returned by a model or stored by a client, onto a `Category`.
    /// Case, surrounding whitespace, and space or hyphen separators are ignored.
    /// Anything unrecognized becomes `Category::Other`.
    pub fn normalize(label: &str) -> Category {
        let normalized = label.trim().to_lowercase().replace([' ', '-'], "_");

        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .unwrap_or(Category::Other)
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let label = String::deserialize(deserializer)?;
        Ok(Category::normalize(&label))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumeration of the enrichment pipeline states of a report.
/// Pending: Submitted, not yet picked up by the enricher.
/// Processing: An enrichment attempt is underway.
/// Completed: Enrichment attributes were written. Terminal.
/// Failed: The last enrichment attempt failed. Only an explicit re-enrichment moves it forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "pipeline_status", rename_all = "lowercase")]
pub enum PipelineStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Processing => "processing",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }
}

impl FromStr for PipelineStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PipelineStatus::Pending),
            "processing" => Ok(PipelineStatus::Processing),
            "completed" => Ok(PipelineStatus::Completed),
            "failed" => Ok(PipelineStatus::Failed),
            invalid => Err(ParseError::ParsePipelineStatusError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "risk_level", rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl FromStr for RiskLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            invalid => Err(ParseError::ParseRiskLevelError(invalid.to_owned())),
        }
    }
}

/// Resolution status, owned by the staff workflow. The enricher only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "report_status", rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    InProgress,
    Resolved,
    Duplicate,
}

/// Output of the rule engine. Pure data: no timestamps, so identical inputs compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub severity: u8,
    pub risk_level: RiskLevel,
    pub health_hazard: bool,
    pub environment_hazard: bool,
    pub ward: String,
    pub department: String,
}

/// Enrichment attributes as persisted on a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    #[serde(flatten)]
    pub result: EnrichmentResult,
    pub enriched_at: DateTime<Utc>,
}

/// Attributes written by the staff workflow and citizen feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub status: ReportStatus,
    pub assigned_at: Option<DateTime<Utc>>,
    pub in_progress_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub image_after_url: Option<String>,
    pub citizen_verified: Option<bool>,
    pub citizen_feedback: Option<String>,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            status: ReportStatus::Pending,
            assigned_at: None,
            in_progress_at: None,
            resolved_at: None,
            image_after_url: None,
            citizen_verified: None,
            citizen_feedback: None,
        }
    }
}

/// A citizen submitted report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    /// Category hint provided at submission, if any.
    pub category: Option<Category>,
    /// Confidence in the category hint, within [0, 1].
    pub confidence: Option<f64>,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    /// Reference to the "before" photo: a data URI or a URL.
    pub image_before_url: String,
    pub created_at: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    /// Present if and only if enrichment completed.
    pub enrichment: Option<Enrichment>,
    pub pipeline_status: PipelineStatus,
    pub pipeline_updated_at: DateTime<Utc>,
    pub resolution: Resolution,
}

impl Report {
    /// A freshly submitted report, as a citizen submission would create it.
    pub fn new(latitude: f64, longitude: f64, image_before_url: &str) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::now_v7(),
            category: None,
            confidence: None,
            latitude,
            longitude,
            address: None,
            image_before_url: image_before_url.to_owned(),
            created_at: now,
            user_id: None,
            enrichment: None,
            pipeline_status: PipelineStatus::Pending,
            pipeline_updated_at: now,
            resolution: Resolution::default(),
        }
    }

    pub fn with_classification(mut self, category: Category, confidence: f64) -> Self {
        self.category = Some(category);
        self.confidence = Some(confidence);
        self
    }

    /// The classification submitted along with this report, if both halves are present.
    pub fn submitted_classification(&self) -> Option<Classification> {
        match (self.category, self.confidence) {
            (Some(category), Some(confidence)) => Some(Classification {
                category,
                confidence,
                description: String::new(),
            }),
            _ => None,
        }
    }
}

/// The output of a vision classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
}

/// An image to classify.
#[derive(Debug, Clone, PartialEq)]
pub enum ImagePayload {
    /// Raw image bytes.
    Bytes(Bytes),
    /// An already encoded `data:` URI.
    DataUri(String),
    /// A remotely hosted image the model can fetch on its own.
    Url(url::Url),
}

impl ImagePayload {
    /// Build a payload from a stored image reference.
    /// References starting with `data:` are used as is; anything else must parse as a URL.
    pub fn from_reference(reference: &str) -> Option<ImagePayload> {
        let reference = reference.trim();

        if reference.is_empty() {
            None
        } else if reference.starts_with("data:") {
            Some(ImagePayload::DataUri(reference.to_owned()))
        } else {
            url::Url::parse(reference).ok().map(ImagePayload::Url)
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ImagePayload::Bytes(bytes) => bytes.is_empty(),
            ImagePayload::DataUri(uri) => uri
                .split_once(',')
                .map(|(_, data)| data.trim().is_empty())
                .unwrap_or(true),
            ImagePayload::Url(_) => false,
        }
    }

    /// Render this payload as a string a vision model accepts: either a URL or a data URI.
    /// Raw bytes are assumed to be JPEG encoded.
    pub fn to_model_input(&self) -> String {
        match self {
            ImagePayload::Bytes(bytes) => format!(
                "data:image/jpeg;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(bytes)
            ),
            ImagePayload::DataUri(uri) => uri.to_owned(),
            ImagePayload::Url(url) => url.to_string(),
        }
    }
}
