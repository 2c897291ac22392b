use std::collections::{BTreeSet, HashMap};

use crate::error::{ImportError, Result};
use crate::schema::{activity_label, flow_label};

/// Region entity. Ids are assigned 1..=L over the sorted distinct region
/// names so reruns are reproducible regardless of label order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub id: u32,
    pub name: String,
}

/// Product flow entity, one per technosphere row label, id = 1-based source
/// position. The (name, location) pair is the identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub id: u32,
    pub name: String,
    pub unit: String,
    pub location_id: u32,
    pub code_1: String,
    pub code_2: String,
}

/// Productive-unit entity, one per technosphere column label. Each activity
/// supplies exactly one reference product, the flow at the same position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub id: u32,
    pub name: String,
    pub location_id: u32,
    pub reference_flow_id: u32,
    pub code_1: String,
    pub code_2: String,
}

/// Everything the persistence boundary needs to create one version's
/// entities in bulk.
#[derive(Debug, Clone)]
pub struct EntityBundle {
    pub collection: String,
    pub geocollection: String,
    pub locations: Vec<Location>,
    pub flows: Vec<Flow>,
    pub activities: Vec<Activity>,
}

/// Identity mapping tables for one import run: entity records plus
/// (name, location) → matrix index lookups. Built once, never mutated.
#[derive(Debug)]
pub struct EntityMap {
    pub locations: Vec<Location>,
    pub flows: Vec<Flow>,
    pub activities: Vec<Activity>,
    rows: HashMap<(String, String), usize>,
    cols: HashMap<(String, String), usize>,
}

fn required<'a>(row: &'a [String], index: usize, what: &str) -> Result<&'a str> {
    match row.get(index).map(String::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ImportError::Structural(format!(
            "label row {row:?} is missing its {what} field"
        ))),
    }
}

fn optional(row: &[String], index: usize) -> String {
    row.get(index).cloned().unwrap_or_default()
}

impl EntityMap {
    /// Assign identities from the technosphere label sets.
    ///
    /// Fails with a structural-inconsistency error on any violated
    /// invariant: unequal flow/activity counts, duplicate (name, location)
    /// keys, or a flow region absent from the activity regions. Matrix
    /// dimensions derive from these counts, so there is no partial recovery.
    pub fn build(flow_labels: &[Vec<String>], activity_labels: &[Vec<String>]) -> Result<Self> {
        if flow_labels.len() != activity_labels.len() {
            return Err(ImportError::Structural(format!(
                "{} flows vs {} activities; the technosphere must be square",
                flow_labels.len(),
                activity_labels.len()
            )));
        }

        let mut regions = BTreeSet::new();
        for row in activity_labels {
            regions.insert(required(row, activity_label::REGION, "region")?.to_string());
        }
        let locations: Vec<Location> = regions
            .into_iter()
            .enumerate()
            .map(|(i, name)| Location {
                id: i as u32 + 1,
                name,
            })
            .collect();
        let location_ids: HashMap<&str, u32> = locations
            .iter()
            .map(|l| (l.name.as_str(), l.id))
            .collect();

        let mut rows = HashMap::new();
        let mut flows = Vec::with_capacity(flow_labels.len());
        for (i, row) in flow_labels.iter().enumerate() {
            let region = required(row, flow_label::REGION, "region")?;
            let name = required(row, flow_label::NAME, "name")?;
            let location_id = *location_ids.get(region).ok_or_else(|| {
                ImportError::Structural(format!(
                    "flow '{name}' references unknown location '{region}'"
                ))
            })?;
            if rows
                .insert((name.to_string(), region.to_string()), i)
                .is_some()
            {
                return Err(ImportError::Structural(format!(
                    "duplicate flow key ({name}, {region})"
                )));
            }
            flows.push(Flow {
                id: i as u32 + 1,
                name: name.to_string(),
                unit: optional(row, flow_label::UNIT),
                location_id,
                code_1: optional(row, flow_label::CODE_1),
                code_2: optional(row, flow_label::CODE_2),
            });
        }

        let mut cols = HashMap::new();
        let mut activities = Vec::with_capacity(activity_labels.len());
        for (i, row) in activity_labels.iter().enumerate() {
            let region = required(row, activity_label::REGION, "region")?;
            let name = required(row, activity_label::NAME, "name")?;
            if cols
                .insert((name.to_string(), region.to_string()), i)
                .is_some()
            {
                return Err(ImportError::Structural(format!(
                    "duplicate activity key ({name}, {region})"
                )));
            }
            activities.push(Activity {
                id: i as u32 + 1,
                name: name.to_string(),
                location_id: location_ids[region],
                reference_flow_id: i as u32 + 1,
                code_1: optional(row, activity_label::CODE_1),
                code_2: optional(row, activity_label::CODE_2),
            });
        }

        Ok(Self {
            locations,
            flows,
            activities,
            rows,
            cols,
        })
    }

    /// The square matrix dimension.
    pub fn size(&self) -> usize {
        self.flows.len()
    }

    pub fn row_index(&self, name: &str, location: &str) -> Option<usize> {
        self.rows
            .get(&(name.to_string(), location.to_string()))
            .copied()
    }

    pub fn col_index(&self, name: &str, location: &str) -> Option<usize> {
        self.cols
            .get(&(name.to_string(), location.to_string()))
            .copied()
    }

    pub fn bundle(&self, collection: &str, geocollection: &str) -> EntityBundle {
        EntityBundle {
            collection: collection.to_string(),
            geocollection: geocollection.to_string(),
            locations: self.locations.clone(),
            flows: self.flows.clone(),
            activities: self.activities.clone(),
        }
    }
}
