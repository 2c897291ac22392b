use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::entities::EntityBundle;
use crate::error::{ImportError, Result};

/// A persisted flow or activity, re-queryable by (name, location).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub id: u32,
    pub name: String,
    pub location: String,
}

/// A persisted biosphere flow of the target taxonomy, keyed by
/// (name, categories).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiosphereFlowRef {
    pub id: u32,
    pub name: String,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub collection: String,
    pub path: PathBuf,
}

/// The entity persistence boundary. The import core depends only on bulk
/// creation plus the ability to re-query created entities with their stable
/// ids afterwards; queries against unknown collections return empty rather
/// than failing, matching a taxonomy that simply does not define a flow.
pub trait EntityStore {
    fn has_collection(&self, name: &str) -> Result<bool>;
    fn create_entities(&mut self, bundle: &EntityBundle) -> Result<()>;
    fn product_flows(&self, collection: &str) -> Result<Vec<EntityRef>>;
    fn activities(&self, collection: &str) -> Result<Vec<EntityRef>>;
    fn biosphere_flows(&self, collection: &str) -> Result<Vec<BiosphereFlowRef>>;
    fn record_package(&mut self, collection: &str, path: &Path) -> Result<()>;
}

/// In-memory store. Backs the tests and small standalone runs; seed it with
/// a target biosphere taxonomy before importing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    flows: BTreeMap<String, Vec<EntityRef>>,
    activities: BTreeMap<String, Vec<EntityRef>>,
    biosphere: BTreeMap<String, Vec<BiosphereFlowRef>>,
    packages: Vec<PackageRef>,
}

impl MemoryStore {
    pub fn add_biosphere_flow(&mut self, collection: &str, name: &str, categories: &[&str], id: u32) {
        self.biosphere
            .entry(collection.to_string())
            .or_default()
            .push(BiosphereFlowRef {
                id,
                name: name.to_string(),
                categories: categories.iter().map(|s| s.to_string()).collect(),
            });
    }

    pub fn packages(&self) -> &[PackageRef] {
        &self.packages
    }
}

impl EntityStore for MemoryStore {
    fn has_collection(&self, name: &str) -> Result<bool> {
        Ok(self.flows.contains_key(name) || self.biosphere.contains_key(name))
    }

    fn create_entities(&mut self, bundle: &EntityBundle) -> Result<()> {
        if self.has_collection(&bundle.collection)? {
            return Err(ImportError::Store(format!(
                "collection '{}' already exists",
                bundle.collection
            )));
        }
        let location_names: HashMap<u32, &str> = bundle
            .locations
            .iter()
            .map(|l| (l.id, l.name.as_str()))
            .collect();
        let resolve = |location_id: u32| -> Result<String> {
            location_names
                .get(&location_id)
                .map(|name| name.to_string())
                .ok_or_else(|| {
                    ImportError::Store(format!("unknown location id {location_id} in bundle"))
                })
        };

        let mut flows = Vec::with_capacity(bundle.flows.len());
        for flow in &bundle.flows {
            flows.push(EntityRef {
                id: flow.id,
                name: flow.name.clone(),
                location: resolve(flow.location_id)?,
            });
        }
        let mut activities = Vec::with_capacity(bundle.activities.len());
        for activity in &bundle.activities {
            activities.push(EntityRef {
                id: activity.id,
                name: activity.name.clone(),
                location: resolve(activity.location_id)?,
            });
        }

        self.flows.insert(bundle.collection.clone(), flows);
        self.activities.insert(bundle.collection.clone(), activities);
        Ok(())
    }

    fn product_flows(&self, collection: &str) -> Result<Vec<EntityRef>> {
        Ok(self.flows.get(collection).cloned().unwrap_or_default())
    }

    fn activities(&self, collection: &str) -> Result<Vec<EntityRef>> {
        Ok(self.activities.get(collection).cloned().unwrap_or_default())
    }

    fn biosphere_flows(&self, collection: &str) -> Result<Vec<BiosphereFlowRef>> {
        Ok(self.biosphere.get(collection).cloned().unwrap_or_default())
    }

    fn record_package(&mut self, collection: &str, path: &Path) -> Result<()> {
        self.packages.push(PackageRef {
            collection: collection.to_string(),
            path: path.to_path_buf(),
        });
        Ok(())
    }
}
