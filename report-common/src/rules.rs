//! # Rules
//!
//! The enrichment rule engine: a pure, total mapping from a report's classification and location
//! to a severity score, hazard flags, and organizational routing.
//!
//! Evaluation has no I/O and no hidden state, so re-running it on the same inputs always produces
//! the same `EnrichmentResult`. Enrichment retries rely on that.
use crate::report::{Category, EnrichmentResult, RiskLevel};

pub const MIN_SEVERITY: u8 = 1;
pub const MAX_SEVERITY: u8 = 5;

pub const ZONE_NORTH: &str = "Zone North";
pub const ZONE_SOUTH: &str = "Zone South";

pub const DEPARTMENT_HEALTH: &str = "Health & Sanitation";
pub const DEPARTMENT_SOLID_WASTE: &str = "Solid Waste Management";

/// Categories that raise severity on their own.
pub const HIGH_RISK_CATEGORIES: [Category; 4] = [
    Category::BurningGarbage,
    Category::SewageOverflow,
    Category::DeadAnimal,
    Category::OpenManhole,
];

/// Categories that are a health hazard regardless of severity.
pub const HEALTH_HAZARD_CATEGORIES: [Category; 3] = [
    Category::SewageOverflow,
    Category::DeadAnimal,
    Category::StagnantWater,
];

/// Weights and thresholds used to score a report.
///
/// The default high-risk weight is 3, so that a high-risk category above the confidence
/// threshold reaches the maximum severity of 5. A high-risk category alone therefore scores 4,
/// which makes it high risk and a health hazard: an `open_manhole` at confidence 0.5 is routed to
/// `DEPARTMENT_HEALTH` rather than `DEPARTMENT_SOLID_WASTE`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    /// Severity every report starts at.
    pub base_severity: u8,
    /// Added when the category is in `HIGH_RISK_CATEGORIES`.
    pub high_risk_weight: u8,
    /// Added when confidence is strictly greater than `confidence_threshold`.
    pub confidence_weight: u8,
    pub confidence_threshold: f64,
    /// Reports strictly north of this latitude are routed to `ZONE_NORTH`.
    pub ward_split_latitude: f64,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            base_severity: 1,
            high_risk_weight: 3,
            confidence_weight: 1,
            confidence_threshold: 0.85,
            ward_split_latitude: 18.52,
        }
    }
}

impl RuleSet {
    pub fn with_ward_split_latitude(mut self, latitude: f64) -> Self {
        self.ward_split_latitude = latitude;
        self
    }

    /// Score and route a report.
    pub fn evaluate(&self, category: Category, confidence: f64, latitude: f64) -> EnrichmentResult {
        let mut severity = self.base_severity;

        if HIGH_RISK_CATEGORIES.contains(&category) {
            severity = severity.saturating_add(self.high_risk_weight);
        }

        // NaN never clears the threshold.
        if confidence > self.confidence_threshold {
            severity = severity.saturating_add(self.confidence_weight);
        }

        let severity = severity.clamp(MIN_SEVERITY, MAX_SEVERITY);

        let risk_level = match severity {
            4..=MAX_SEVERITY => RiskLevel::High,
            2..=3 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        };

        // The severity disjunct may set this alongside `environment_hazard` (e.g. burning garbage
        // reported with high confidence). Both flags are kept as computed.
        let health_hazard = HEALTH_HAZARD_CATEGORIES.contains(&category) || severity >= 4;
        let environment_hazard = category == Category::BurningGarbage;

        let ward = if latitude > self.ward_split_latitude {
            ZONE_NORTH
        } else {
            ZONE_SOUTH
        };

        let department = if health_hazard {
            DEPARTMENT_HEALTH
        } else {
            DEPARTMENT_SOLID_WASTE
        };

        EnrichmentResult {
            severity,
            risk_level,
            health_hazard,
            environment_hazard,
            ward: ward.to_owned(),
            department: department.to_owned(),
        }
    }
}

/// Evaluate the default `RuleSet`.
pub fn enrich(category: Category, confidence: f64, latitude: f64) -> EnrichmentResult {
    RuleSet::default().evaluate(category, confidence, latitude)
}
