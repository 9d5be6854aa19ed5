//! Relational row types and the table set produced by normalization

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::info;

pub const STUDY: &str = "study";
pub const SPONSOR: &str = "sponsor";
pub const CONDITION: &str = "condition";
pub const INTERVENTION: &str = "intervention";
pub const SITE: &str = "site";
pub const STUDY_SPONSOR: &str = "study_sponsor";
pub const STUDY_CONDITION: &str = "study_condition";
pub const STUDY_INTERVENTION: &str = "study_intervention";
pub const STUDY_SITE: &str = "study_site";

/// Entities before the relationship tables that reference them
pub const LOAD_ORDER: [&str; 9] = [
    STUDY,
    SPONSOR,
    CONDITION,
    INTERVENTION,
    SITE,
    STUDY_SPONSOR,
    STUDY_CONDITION,
    STUDY_INTERVENTION,
    STUDY_SITE,
];

/// Row identified by a single surrogate key column
pub trait Keyed {
    fn key(&self) -> &str;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyRow {
    pub study_key: String,
    pub nct_id: String,

    pub brief_title: Option<String>,
    pub official_title: Option<String>,
    pub acronym: Option<String>,
    pub org_study_id: Option<String>,

    pub brief_summary: Option<String>,
    pub detailed_description: Option<String>,

    pub overall_status: Option<String>,
    pub status_verified_date: Option<String>,
    pub start_date: Option<String>,
    pub start_date_type: Option<String>,
    pub completion_date: Option<String>,
    pub completion_date_type: Option<String>,
    pub primary_completion_date: Option<String>,
    pub primary_completion_date_type: Option<String>,
    pub why_stopped: Option<String>,
    pub has_expanded_access: Option<bool>,
    pub source_last_updated_date: Option<String>,
    pub source_last_updated_date_type: Option<String>,

    pub study_type: Option<String>,
    pub enrollment_count: Option<i64>,
    pub enrollment_type: Option<String>,
    pub allocation: Option<String>,
    pub intervention_model: Option<String>,
    pub primary_purpose: Option<String>,
    pub masking: Option<String>,
    pub masking_description: Option<String>,
    pub patient_registry: Option<bool>,
    pub target_duration: Option<String>,

    pub eligibility_criteria: Option<String>,
    pub healthy_volunteers: Option<bool>,
    pub sex: Option<String>,
    pub minimum_age_years: Option<i32>,
    pub maximum_age_years: Option<i32>,

    pub has_dmc: Option<bool>,
    pub is_fda_regulated_drug: Option<bool>,
    pub is_fda_regulated_device: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SponsorRow {
    pub sponsor_key: String,
    pub sponsor_name: String,
    pub sponsor_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRow {
    pub condition_key: String,
    pub condition_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRow {
    pub intervention_key: String,
    pub intervention_type: Option<String>,
    pub intervention_name: String,
    pub intervention_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRow {
    pub site_key: String,
    pub facility_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySponsorRow {
    pub study_sponsor_key: String,
    pub study_key: String,
    pub sponsor_key: String,
    pub is_lead: bool,
    pub is_collaborator: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConditionRow {
    pub study_condition_key: String,
    pub study_key: String,
    pub condition_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyInterventionRow {
    pub study_intervention_key: String,
    pub study_key: String,
    pub intervention_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySiteRow {
    pub study_site_key: String,
    pub study_key: String,
    pub site_key: String,
}

macro_rules! keyed {
    ($($row:ty => $field:ident),* $(,)?) => {
        $(impl Keyed for $row {
            fn key(&self) -> &str {
                &self.$field
            }
        })*
    };
}

keyed! {
    StudyRow => study_key,
    SponsorRow => sponsor_key,
    ConditionRow => condition_key,
    InterventionRow => intervention_key,
    SiteRow => site_key,
    StudySponsorRow => study_sponsor_key,
    StudyConditionRow => study_condition_key,
    StudyInterventionRow => study_intervention_key,
    StudySiteRow => study_site_key,
}

/// Named rows handed to a loader
#[derive(Debug, Clone, PartialEq)]
pub struct TableBatch {
    pub name: &'static str,
    pub rows: Vec<Value>,
}

impl TableBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Output of one normalization run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedTables {
    pub study: Vec<StudyRow>,
    pub sponsor: Vec<SponsorRow>,
    pub condition: Vec<ConditionRow>,
    pub intervention: Vec<InterventionRow>,
    pub site: Vec<SiteRow>,
    pub study_sponsor: Vec<StudySponsorRow>,
    pub study_condition: Vec<StudyConditionRow>,
    pub study_intervention: Vec<StudyInterventionRow>,
    pub study_site: Vec<StudySiteRow>,
}

fn dedup_by_key<T: Keyed>(table: &'static str, rows: &mut Vec<T>) -> usize {
    let before = rows.len();
    let mut seen = HashSet::with_capacity(before);
    rows.retain(|row| seen.insert(row.key().to_string()));

    let removed = before - rows.len();
    if removed > 0 {
        info!(table, removed, "Removed duplicate rows");
    }
    removed
}

fn to_batch<T: Serialize>(name: &'static str, rows: Vec<T>) -> Result<TableBatch> {
    let rows = rows
        .into_iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(TableBatch { name, rows })
}

impl NormalizedTables {
    /// Drop later rows whose key was already seen, per table.
    ///
    /// Returns the number of rows removed across all tables.
    pub fn dedup(&mut self) -> usize {
        dedup_by_key(STUDY, &mut self.study)
            + dedup_by_key(SPONSOR, &mut self.sponsor)
            + dedup_by_key(CONDITION, &mut self.condition)
            + dedup_by_key(INTERVENTION, &mut self.intervention)
            + dedup_by_key(SITE, &mut self.site)
            + dedup_by_key(STUDY_SPONSOR, &mut self.study_sponsor)
            + dedup_by_key(STUDY_CONDITION, &mut self.study_condition)
            + dedup_by_key(STUDY_INTERVENTION, &mut self.study_intervention)
            + dedup_by_key(STUDY_SITE, &mut self.study_site)
    }

    /// Append every row of `other`; call [`dedup`](Self::dedup) afterwards
    pub fn extend(&mut self, other: NormalizedTables) {
        self.study.extend(other.study);
        self.sponsor.extend(other.sponsor);
        self.condition.extend(other.condition);
        self.intervention.extend(other.intervention);
        self.site.extend(other.site);
        self.study_sponsor.extend(other.study_sponsor);
        self.study_condition.extend(other.study_condition);
        self.study_intervention.extend(other.study_intervention);
        self.study_site.extend(other.study_site);
    }

    /// Row count per table, in load order
    pub fn counts(&self) -> [(&'static str, usize); 9] {
        [
            (STUDY, self.study.len()),
            (SPONSOR, self.sponsor.len()),
            (CONDITION, self.condition.len()),
            (INTERVENTION, self.intervention.len()),
            (SITE, self.site.len()),
            (STUDY_SPONSOR, self.study_sponsor.len()),
            (STUDY_CONDITION, self.study_condition.len()),
            (STUDY_INTERVENTION, self.study_intervention.len()),
            (STUDY_SITE, self.study_site.len()),
        ]
    }

    pub fn total_rows(&self) -> usize {
        self.counts().iter().map(|(_, n)| n).sum()
    }

    /// Convert into loader batches ordered by [`LOAD_ORDER`]
    pub fn into_batches(self) -> Result<Vec<TableBatch>> {
        Ok(vec![
            to_batch(STUDY, self.study)?,
            to_batch(SPONSOR, self.sponsor)?,
            to_batch(CONDITION, self.condition)?,
            to_batch(INTERVENTION, self.intervention)?,
            to_batch(SITE, self.site)?,
            to_batch(STUDY_SPONSOR, self.study_sponsor)?,
            to_batch(STUDY_CONDITION, self.study_condition)?,
            to_batch(STUDY_INTERVENTION, self.study_intervention)?,
            to_batch(STUDY_SITE, self.study_site)?,
        ])
    }
}
