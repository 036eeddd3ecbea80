use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Classification ────────────────────────────────────────────────────────────

/// School program tag shown on the detail page ("PEI", "EE", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Classification {
    Pei,
    Ee,
    Other(String),
    Unknown,
}

impl Classification {
    pub fn from_text(text: &str) -> Self {
        let text = text.trim().to_uppercase();
        match text.as_str() {
            "" => Classification::Unknown,
            "PEI" => Classification::Pei,
            "EE" => Classification::Ee,
            _ => Classification::Other(text),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Classification::Pei => "PEI",
            Classification::Ee => "EE",
            Classification::Other(s) => s,
            Classification::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Extracted profile ─────────────────────────────────────────────────────────

/// Student counts per age bracket for one school segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgeBrackets {
    pub age_06_10: Option<u32>,
    pub age_11_14: Option<u32>,
    pub age_15_17: Option<u32>,
    pub age_18_plus: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scores {
    pub ideb_final_years: Option<f64>,
    pub idesp_final_years: Option<f64>,
    pub ideb_high_school: Option<f64>,
    pub idesp_high_school: Option<f64>,
}

impl Scores {
    pub fn is_empty(&self) -> bool {
        *self == Scores::default()
    }
}

/// Everything a successful detail page yields. Missing markup leaves the
/// field empty (`None` / ""), never zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SchoolProfile {
    pub name: String,
    pub classification: Classification,
    pub teaching_directorate: String,
    pub neighborhood: String,
    pub municipality: String,
    pub phone: String,
    pub email: String,
    pub scores: Scores,
    pub total_students: Option<u32>,
    pub final_years: AgeBrackets,
    pub high_school: AgeBrackets,
    pub total_classes: Option<u32>,
    pub classes_final_years: Option<u32>,
    pub classes_high_school: Option<u32>,
    pub total_classrooms: Option<u32>,
}

impl Default for SchoolProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            classification: Classification::Unknown,
            teaching_directorate: String::new(),
            neighborhood: String::new(),
            municipality: String::new(),
            phone: String::new(),
            email: String::new(),
            scores: Scores::default(),
            total_students: None,
            final_years: AgeBrackets::default(),
            high_school: AgeBrackets::default(),
            total_classes: None,
            classes_final_years: None,
            classes_high_school: None,
            total_classrooms: None,
        }
    }
}

// ── School record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(SchoolProfile),
    Failure { error: String },
}

/// One row per detail page attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SchoolRecord {
    pub page: u32,
    pub detail_url: String,
    pub extracted_at: DateTime<Utc>,
    pub outcome: Outcome,
}

impl SchoolRecord {
    pub fn success(page: u32, detail_url: impl Into<String>, profile: SchoolProfile) -> Self {
        Self {
            page,
            detail_url: detail_url.into(),
            extracted_at: Utc::now(),
            outcome: Outcome::Success(profile),
        }
    }

    pub fn failure(page: u32, detail_url: impl Into<String>, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown error".to_string();
        }
        Self {
            page,
            detail_url: detail_url.into(),
            extracted_at: Utc::now(),
            outcome: Outcome::Failure { error },
        }
    }

    pub fn status(&self) -> Status {
        match self.outcome {
            Outcome::Success(_) => Status::Success,
            Outcome::Failure { .. } => Status::Failure,
        }
    }

    pub fn profile(&self) -> Option<&SchoolProfile> {
        match &self.outcome {
            Outcome::Success(p) => Some(p),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success(_) => None,
            Outcome::Failure { error } => Some(error),
        }
    }
}

// ── CSV row ───────────────────────────────────────────────────────────────────

/// Flat output row; field order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvRow {
    pub school_name: String,
    pub classification: String,
    pub detail_url: String,
    pub extraction_timestamp: String,
    pub status: Status,
    pub teaching_directorate: String,
    pub neighborhood: String,
    pub municipality: String,
    pub phone: String,
    pub email: String,
    pub ideb_score_final_years: Option<f64>,
    pub idesp_score_final_years: Option<f64>,
    pub ideb_score_high_school: Option<f64>,
    pub idesp_score_high_school: Option<f64>,
    pub total_students: Option<u32>,
    pub age_06_10_final_years: Option<u32>,
    pub age_11_14_final_years: Option<u32>,
    pub age_15_17_final_years: Option<u32>,
    pub age_18_plus_final_years: Option<u32>,
    pub age_06_10_high_school: Option<u32>,
    pub age_11_14_high_school: Option<u32>,
    pub age_15_17_high_school: Option<u32>,
    pub age_18_plus_high_school: Option<u32>,
    pub total_classes: Option<u32>,
    pub classes_final_years: Option<u32>,
    pub classes_high_school: Option<u32>,
    pub total_classrooms: Option<u32>,
    pub error_message: String,
}

pub const COLUMNS: [&str; 28] = [
    "school_name",
    "classification",
    "detail_url",
    "extraction_timestamp",
    "status",
    "teaching_directorate",
    "neighborhood",
    "municipality",
    "phone",
    "email",
    "ideb_score_final_years",
    "idesp_score_final_years",
    "ideb_score_high_school",
    "idesp_score_high_school",
    "total_students",
    "age_06_10_final_years",
    "age_11_14_final_years",
    "age_15_17_final_years",
    "age_18_plus_final_years",
    "age_06_10_high_school",
    "age_11_14_high_school",
    "age_15_17_high_school",
    "age_18_plus_high_school",
    "total_classes",
    "classes_final_years",
    "classes_high_school",
    "total_classrooms",
    "error_message",
];

impl From<&SchoolRecord> for CsvRow {
    fn from(record: &SchoolRecord) -> Self {
        let empty = SchoolProfile::default();
        let p = record.profile().unwrap_or(&empty);

        CsvRow {
            school_name: p.name.clone(),
            classification: p.classification.to_string(),
            detail_url: record.detail_url.clone(),
            extraction_timestamp: record
                .extracted_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            status: record.status(),
            teaching_directorate: p.teaching_directorate.clone(),
            neighborhood: p.neighborhood.clone(),
            municipality: p.municipality.clone(),
            phone: p.phone.clone(),
            email: p.email.clone(),
            ideb_score_final_years: p.scores.ideb_final_years,
            idesp_score_final_years: p.scores.idesp_final_years,
            ideb_score_high_school: p.scores.ideb_high_school,
            idesp_score_high_school: p.scores.idesp_high_school,
            total_students: p.total_students,
            age_06_10_final_years: p.final_years.age_06_10,
            age_11_14_final_years: p.final_years.age_11_14,
            age_15_17_final_years: p.final_years.age_15_17,
            age_18_plus_final_years: p.final_years.age_18_plus,
            age_06_10_high_school: p.high_school.age_06_10,
            age_11_14_high_school: p.high_school.age_11_14,
            age_15_17_high_school: p.high_school.age_15_17,
            age_18_plus_high_school: p.high_school.age_18_plus,
            total_classes: p.total_classes,
            classes_final_years: p.classes_final_years,
            classes_high_school: p.classes_high_school,
            total_classrooms: p.total_classrooms,
            error_message: record.error_message().unwrap_or_default().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_keeps_unrecognised_tags() {
        assert_eq!(Classification::from_text(" pei "), Classification::Pei);
        assert_eq!(Classification::from_text("EE"), Classification::Ee);
        assert_eq!(Classification::from_text(""), Classification::Unknown);
        assert_eq!(
            Classification::from_text("Escola Tecnica"),
            Classification::Other("ESCOLA TECNICA".into())
        );
        assert_eq!(Classification::Unknown.to_string(), "UNKNOWN");
    }

    #[test]
    fn failure_iff_error_message() {
        let ok = SchoolRecord::success(1, "u1", SchoolProfile::default());
        let bad = SchoolRecord::failure(2, "u2", "HTTP 500");
        let blank = SchoolRecord::failure(3, "u3", "  ");

        assert_eq!(ok.status(), Status::Success);
        assert!(ok.error_message().is_none());
        assert_eq!(bad.status(), Status::Failure);
        assert_eq!(bad.error_message(), Some("HTTP 500"));
        assert_eq!(blank.error_message(), Some("unknown error"));
    }

    #[test]
    fn failure_row_carries_no_measurements() {
        let row = CsvRow::from(&SchoolRecord::failure(4, "u4", "boom"));
        assert_eq!(row.status, Status::Failure);
        assert_eq!(row.error_message, "boom");
        assert_eq!(row.classification, "UNKNOWN");
        assert_eq!(row.detail_url, "u4");
        assert!(row.ideb_score_final_years.is_none());
        assert!(row.total_students.is_none());
        assert!(row.total_classrooms.is_none());
    }

    #[test]
    fn zero_is_kept_distinct_from_missing() {
        let profile = SchoolProfile {
            total_classrooms: Some(0),
            ..Default::default()
        };
        let row = CsvRow::from(&SchoolRecord::success(1, "u", profile));
        assert_eq!(row.total_classrooms, Some(0));
        assert_eq!(row.total_classes, None);
        assert!(row.error_message.is_empty());
    }
}
