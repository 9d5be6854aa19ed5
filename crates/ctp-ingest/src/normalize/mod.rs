//! Normalization of nested study records into relational tables
//!
//! Each record's protocol section yields one `study` row plus zero or more
//! sponsors, conditions, interventions and sites. Entities are keyed by
//! [`surrogate_key`] over their natural attributes and emitted once per run;
//! every occurrence still produces a relationship row linking it to the
//! study. A final per-table dedup runs before the tables are returned.
//!
//! Records without an identifier, or whose protocol section is not a JSON
//! object, are logged and skipped.

pub mod lookup;
pub mod tables;

pub use tables::{
    ConditionRow, InterventionRow, NormalizedTables, SiteRow, SponsorRow, StudyConditionRow,
    StudyInterventionRow, StudyRow, StudySiteRow, StudySponsorRow, TableBatch, LOAD_ORDER,
};

use crate::error::{IngestError, Result};
use crate::shard::PROTOCOL_SECTION;
use arrow::array::{Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use ctp_common::surrogate_key;
use lookup::{
    lookup, lookup_array, lookup_bool, lookup_f64, lookup_i64, lookup_name, lookup_str,
    parse_age_years,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

const ROLE_LEAD: &str = "lead";
const ROLE_COLLABORATOR: &str = "collab";

/// Counters for one normalization run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub records: usize,
    pub studies: usize,
    pub skipped_missing_id: usize,
    pub skipped_invalid: usize,
    pub duplicates_removed: usize,
}

/// Accumulates relational rows across records
#[derive(Debug, Default)]
pub struct Normalizer {
    tables: NormalizedTables,
    seen_sponsors: HashSet<String>,
    seen_conditions: HashSet<String>,
    seen_interventions: HashSet<String>,
    seen_sites: HashSet<String>,
    stats: NormalizeStats,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize already-parsed protocol sections
    pub fn flatten_records<I>(records: I) -> (NormalizedTables, NormalizeStats)
    where
        I: IntoIterator<Item = Value>,
    {
        let mut normalizer = Self::new();
        for (index, protocol) in records.into_iter().enumerate() {
            normalizer.push_record(index, &protocol);
        }
        normalizer.finish()
    }

    /// Normalize the protocol sections stored in a consolidated file
    pub fn flatten_file(path: &Path) -> Result<(NormalizedTables, NormalizeStats)> {
        info!(path = %path.display(), "Reading consolidated file");

        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        let column = builder.schema().index_of(PROTOCOL_SECTION).map_err(|_| {
            IngestError::Schema(format!(
                "{} has no '{}' column",
                path.display(),
                PROTOCOL_SECTION
            ))
        })?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [column]);
        let reader = builder.with_projection(mask).build()?;

        let mut normalizer = Self::new();
        let mut index = 0;
        for batch in reader {
            let batch = batch?;
            let values = cast(batch.column(0), &DataType::Utf8)?;
            let values = values
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| IngestError::Schema(format!("'{}' is not text", PROTOCOL_SECTION)))?;

            for row in 0..values.len() {
                let raw = (!values.is_null(row)).then(|| values.value(row));
                normalizer.push_raw(index, raw);
                index += 1;
            }
        }

        Ok(normalizer.finish())
    }

    /// Parse and normalize one JSON-encoded protocol section
    pub fn push_raw(&mut self, index: usize, raw: Option<&str>) {
        let Some(raw) = raw else {
            self.stats.records += 1;
            self.stats.skipped_invalid += 1;
            warn!(index, "Record has no protocol section, skipping");
            return;
        };

        match serde_json::from_str::<Value>(raw) {
            Ok(protocol) => self.push_record(index, &protocol),
            Err(e) => {
                self.stats.records += 1;
                self.stats.skipped_invalid += 1;
                warn!(index, error = %e, "Could not parse protocol section, skipping");
            },
        }
    }

    /// Normalize one protocol section
    pub fn push_record(&mut self, index: usize, protocol: &Value) {
        self.stats.records += 1;

        if !protocol.is_object() {
            self.stats.skipped_invalid += 1;
            warn!(index, "Protocol section is not an object, skipping");
            return;
        }

        let Some(nct_id) = lookup_name(protocol, &["identificationModule", "nctId"]) else {
            self.stats.skipped_missing_id += 1;
            warn!(index, "Study missing NCT ID, skipping");
            return;
        };

        let study_key = surrogate_key(&[Some(nct_id.as_str())]);
        debug!(index, %nct_id, %study_key, "Flattening study");

        self.push_sponsors(protocol, &study_key);
        self.push_conditions(protocol, &study_key);
        self.push_interventions(protocol, &study_key);
        self.push_sites(protocol, &study_key);
        self.tables.study.push(study_row(protocol, study_key, nct_id));
        self.stats.studies += 1;
    }

    /// Run the final dedup and hand back the tables
    pub fn finish(mut self) -> (NormalizedTables, NormalizeStats) {
        self.stats.duplicates_removed = self.tables.dedup();

        info!(
            records = self.stats.records,
            studies = self.stats.studies,
            skipped_missing_id = self.stats.skipped_missing_id,
            skipped_invalid = self.stats.skipped_invalid,
            duplicates_removed = self.stats.duplicates_removed,
            "Normalization complete"
        );
        for (table, rows) in self.tables.counts() {
            debug!(table, rows, "Table rows");
        }

        (self.tables, self.stats)
    }

    fn push_sponsors(&mut self, protocol: &Value, study_key: &str) {
        let Some(module) = lookup(protocol, &["sponsorCollaboratorsModule"]) else {
            return;
        };

        if let Some(lead) = lookup(module, &["leadSponsor"]) {
            self.push_sponsor(lead, study_key, ROLE_LEAD);
        }
        for collaborator in lookup_array(module, &["collaborators"]) {
            self.push_sponsor(collaborator, study_key, ROLE_COLLABORATOR);
        }
    }

    fn push_sponsor(&mut self, sponsor: &Value, study_key: &str, role: &str) {
        let Some(name) = lookup_name(sponsor, &["name"]) else {
            return;
        };
        let sponsor_key = surrogate_key(&[Some(name.as_str())]);

        if self.seen_sponsors.insert(sponsor_key.clone()) {
            self.tables.sponsor.push(SponsorRow {
                sponsor_key: sponsor_key.clone(),
                sponsor_name: name,
                sponsor_class: lookup_str(sponsor, &["class"]),
            });
        }

        let is_lead = role == ROLE_LEAD;
        self.tables.study_sponsor.push(StudySponsorRow {
            study_sponsor_key: surrogate_key(&[Some(study_key), Some(sponsor_key.as_str()), Some(role)]),
            study_key: study_key.to_string(),
            sponsor_key,
            is_lead,
            is_collaborator: !is_lead,
        });
    }

    fn push_conditions(&mut self, protocol: &Value, study_key: &str) {
        for condition in lookup_array(protocol, &["conditionsModule", "conditions"]) {
            let Some(name) = condition.as_str().filter(|s| !s.trim().is_empty()) else {
                continue;
            };
            let condition_key = surrogate_key(&[Some(name)]);

            if self.seen_conditions.insert(condition_key.clone()) {
                self.tables.condition.push(ConditionRow {
                    condition_key: condition_key.clone(),
                    condition_name: name.to_string(),
                });
            }

            self.tables.study_condition.push(StudyConditionRow {
                study_condition_key: surrogate_key(&[Some(study_key), Some(condition_key.as_str())]),
                study_key: study_key.to_string(),
                condition_key,
            });
        }
    }

    fn push_interventions(&mut self, protocol: &Value, study_key: &str) {
        for intervention in lookup_array(protocol, &["armsInterventionsModule", "interventions"]) {
            let Some(name) = lookup_name(intervention, &["name"]) else {
                continue;
            };
            let kind = lookup_str(intervention, &["type"]);
            let intervention_key = surrogate_key(&[kind.as_deref(), Some(name.as_str())]);

            if self.seen_interventions.insert(intervention_key.clone()) {
                self.tables.intervention.push(InterventionRow {
                    intervention_key: intervention_key.clone(),
                    intervention_type: kind,
                    intervention_name: name,
                    intervention_description: lookup_str(intervention, &["description"]),
                });
            }

            self.tables.study_intervention.push(StudyInterventionRow {
                study_intervention_key: surrogate_key(&[Some(study_key), Some(intervention_key.as_str())]),
                study_key: study_key.to_string(),
                intervention_key,
            });
        }
    }

    fn push_sites(&mut self, protocol: &Value, study_key: &str) {
        for location in lookup_array(protocol, &["contactsLocationsModule", "locations"]) {
            let facility = lookup_name(location, &["facility"]);
            let city = lookup_name(location, &["city"]);
            if facility.is_none() && city.is_none() {
                continue;
            }
            let country = lookup_str(location, &["country"]);
            let site_key = surrogate_key(&[facility.as_deref(), city.as_deref(), country.as_deref()]);

            if self.seen_sites.insert(site_key.clone()) {
                self.tables.site.push(SiteRow {
                    site_key: site_key.clone(),
                    facility_name: facility,
                    city,
                    state: lookup_str(location, &["state"]),
                    zip: lookup_str(location, &["zip"]),
                    country,
                    latitude: lookup_f64(location, &["geoPoint", "lat"]),
                    longitude: lookup_f64(location, &["geoPoint", "lon"]),
                });
            }

            self.tables.study_site.push(StudySiteRow {
                study_site_key: surrogate_key(&[Some(study_key), Some(site_key.as_str())]),
                study_key: study_key.to_string(),
                site_key,
            });
        }
    }
}

fn study_row(p: &Value, study_key: String, nct_id: String) -> StudyRow {
    const ID: &str = "identificationModule";
    const DESC: &str = "descriptionModule";
    const STATUS: &str = "statusModule";
    const DESIGN: &str = "designModule";
    const ELIGIBILITY: &str = "eligibilityModule";
    const OVERSIGHT: &str = "oversightModule";

    StudyRow {
        study_key,
        nct_id,

        brief_title: lookup_str(p, &[ID, "briefTitle"]),
        official_title: lookup_str(p, &[ID, "officialTitle"]),
        acronym: lookup_str(p, &[ID, "acronym"]),
        org_study_id: lookup_str(p, &[ID, "orgStudyIdInfo", "id"]),

        brief_summary: lookup_str(p, &[DESC, "briefSummary"]),
        detailed_description: lookup_str(p, &[DESC, "detailedDescription"]),

        overall_status: lookup_str(p, &[STATUS, "overallStatus"]),
        status_verified_date: lookup_str(p, &[STATUS, "statusVerifiedDate"]),
        start_date: lookup_str(p, &[STATUS, "startDateStruct", "date"]),
        start_date_type: lookup_str(p, &[STATUS, "startDateStruct", "type"]),
        completion_date: lookup_str(p, &[STATUS, "completionDateStruct", "date"]),
        completion_date_type: lookup_str(p, &[STATUS, "completionDateStruct", "type"]),
        primary_completion_date: lookup_str(p, &[STATUS, "primaryCompletionDateStruct", "date"]),
        primary_completion_date_type: lookup_str(p, &[STATUS, "primaryCompletionDateStruct", "type"]),
        why_stopped: lookup_str(p, &[STATUS, "whyStopped"]),
        has_expanded_access: lookup_bool(p, &[STATUS, "expandedAccessInfo", "hasExpandedAccess"]),
        source_last_updated_date: lookup_str(p, &[STATUS, "lastUpdatePostDateStruct", "date"]),
        source_last_updated_date_type: lookup_str(p, &[STATUS, "lastUpdatePostDateStruct", "type"]),

        study_type: lookup_str(p, &[DESIGN, "studyType"]),
        enrollment_count: lookup_i64(p, &[DESIGN, "enrollmentInfo", "count"]),
        enrollment_type: lookup_str(p, &[DESIGN, "enrollmentInfo", "type"]),
        allocation: lookup_str(p, &[DESIGN, "designInfo", "allocation"]),
        intervention_model: lookup_str(p, &[DESIGN, "designInfo", "interventionModel"]),
        primary_purpose: lookup_str(p, &[DESIGN, "designInfo", "primaryPurpose"]),
        masking: lookup_str(p, &[DESIGN, "designInfo", "maskingInfo", "masking"]),
        masking_description: lookup_str(p, &[DESIGN, "designInfo", "maskingInfo", "maskingDescription"]),
        patient_registry: lookup_bool(p, &[DESIGN, "patientRegistry"]),
        target_duration: lookup_str(p, &[DESIGN, "targetDuration"]),

        eligibility_criteria: lookup_str(p, &[ELIGIBILITY, "eligibilityCriteria"]),
        healthy_volunteers: lookup_bool(p, &[ELIGIBILITY, "healthyVolunteers"]),
        sex: lookup_str(p, &[ELIGIBILITY, "sex"]),
        minimum_age_years: parse_age_years(lookup(p, &[ELIGIBILITY, "minimumAge"])),
        maximum_age_years: parse_age_years(lookup(p, &[ELIGIBILITY, "maximumAge"])),

        has_dmc: lookup_bool(p, &[OVERSIGHT, "oversightHasDmc"]),
        is_fda_regulated_drug: lookup_bool(p, &[OVERSIGHT, "isFdaRegulatedDrug"]),
        is_fda_regulated_device: lookup_bool(p, &[OVERSIGHT, "isFdaRegulatedDevice"]),
    }
}
