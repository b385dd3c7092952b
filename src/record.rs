//! Typed view of application records
//!
//! The store and replication treat bodies as opaque JSON. This module is the
//! application boundary: it reads a body as a tagged [`RecordKind`], checks
//! the structure of occurrence records and lists them the way the field UI
//! shows them.

use std::sync::Arc;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::store::{Document, Order, Partition, DESIGN_ID_PREFIX, LOCAL_ID_PREFIX};

/// A document body, discriminated by its `type` field
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordKind {
    Occurrence(Box<OccurrenceRecord>),
    #[serde(other)]
    Other,
}

impl RecordKind {
    /// Parse a body; anything that is not a well-formed known record is `Other`.
    pub fn from_body(body: &Value) -> Self {
        serde_json::from_value(body.clone()).unwrap_or(RecordKind::Other)
    }

    pub fn as_occurrence(&self) -> Option<&OccurrenceRecord> {
        match self {
            RecordKind::Occurrence(record) => Some(record),
            RecordKind::Other => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OccurrenceData {
    pub individual_id: Option<String>,
    pub lifestage: Option<String>,
    pub sex: Option<String>,
    pub body_length: Option<f64>,
    pub note: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Classification {
    pub kingdom: Option<String>,
    pub phylum: Option<String>,
    pub class: Option<String>,
    pub order: Option<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
    pub species: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationData {
    pub class_classification: Classification,
}

/// An occurrence: one observed individual with its classification, place
/// and any number of attached sub-records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OccurrenceRecord {
    /// Numeric on the backend, a string in older clients
    pub workstation_id: Option<Value>,
    pub user_id: Option<i64>,
    pub project_id: Option<String>,
    pub created_at: Option<String>,
    pub timezone: Option<String>,
    pub occurrence_data: OccurrenceData,
    pub classification_data: ClassificationData,
    pub place_data: Option<Value>,
    pub specimens: Vec<Value>,
    pub identifications: Vec<Value>,
    pub observations: Vec<Value>,
    pub attachments: Vec<Value>,
    /// Fields this version does not model, preserved as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Clone, Debug)]
pub struct ValidationIssue {
    pub field: Option<String>,
    pub severity: IssueSeverity,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            field: None,
            severity: IssueSeverity::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            field: None,
            severity: IssueSeverity::Warning,
            message: message.into(),
        }
    }

    pub fn for_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl OccurrenceRecord {
    /// Structural checks only; no taxonomic or geospatial validation.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        match &self.workstation_id {
            None | Some(Value::Null) => {
                issues.push(ValidationIssue::error("workstation is required").for_field("workstation_id"))
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                issues.push(ValidationIssue::error("workstation is empty").for_field("workstation_id"))
            }
            Some(Value::String(_)) | Some(Value::Number(_)) => {}
            Some(_) => issues.push(
                ValidationIssue::error("workstation must be a number or string").for_field("workstation_id"),
            ),
        }

        if let Some(created_at) = &self.created_at {
            if DateTime::parse_from_rfc3339(created_at).is_err() {
                issues.push(
                    ValidationIssue::error(format!("not an RFC 3339 timestamp: {}", created_at))
                        .for_field("created_at"),
                );
            }
        }

        if let Some(length) = self.occurrence_data.body_length {
            if !length.is_finite() || length < 0.0 {
                issues.push(
                    ValidationIssue::error(format!("body length {} is not a non-negative number", length))
                        .for_field("occurrence_data.body_length"),
                );
            }
        }

        let taxon = &self.classification_data.class_classification;
        if taxon.species.is_some() && taxon.genus.is_none() {
            issues.push(
                ValidationIssue::warning("species given without genus")
                    .for_field("classification_data.class_classification.genus"),
            );
        }

        for (name, items) in [
            ("specimens", &self.specimens),
            ("identifications", &self.identifications),
            ("observations", &self.observations),
            ("attachments", &self.attachments),
        ] {
            for (i, item) in items.iter().enumerate() {
                if !item.is_object() {
                    issues.push(ValidationIssue::error("entry must be an object").for_field(format!("{}[{}]", name, i)));
                }
            }
        }

        issues
    }

    pub fn is_valid(&self) -> bool {
        !self.validate().iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// `"Genus species"`, or whichever part is known
    pub fn scientific_name(&self) -> Option<String> {
        let taxon = &self.classification_data.class_classification;
        match (&taxon.genus, &taxon.species) {
            (Some(genus), Some(species)) => Some(format!("{} {}", genus, species)),
            (Some(genus), None) => Some(genus.clone()),
            (None, Some(species)) => Some(species.clone()),
            (None, None) => None,
        }
    }
}

/// A fresh document id for a new record
pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

/// Occurrence documents in a partition, highest id first. Local and design
/// documents are skipped.
pub fn occurrences(partition: &Arc<Partition>) -> Vec<(Document, OccurrenceRecord)> {
    partition
        .all_documents(Order::Descending)
        .filter(|doc| !doc.id.starts_with(LOCAL_ID_PREFIX) && !doc.id.starts_with(DESIGN_ID_PREFIX))
        .filter_map(|doc| match RecordKind::from_body(&doc.body) {
            RecordKind::Occurrence(record) => Some((doc, *record)),
            RecordKind::Other => None,
        })
        .collect()
}
