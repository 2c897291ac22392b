use std::collections::HashMap;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::extension_label;

/// One source biosphere flow as described by an extension-table row label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFlow {
    pub name: String,
    pub unit: String,
    /// Source compartment, if the table carries one. Resource and land rows
    /// have none.
    pub categories: Option<Vec<String>>,
}

impl SourceFlow {
    pub fn from_label(row: &[String]) -> Self {
        Self {
            name: row
                .get(extension_label::NAME)
                .cloned()
                .unwrap_or_default(),
            unit: row
                .get(extension_label::UNIT)
                .cloned()
                .unwrap_or_default(),
            categories: row
                .get(extension_label::COMPARTMENT)
                .filter(|c| !c.is_empty())
                .map(|c| vec![c.clone()]),
        }
    }
}

/// One target share of a disaggregated source flow. `categories == None`
/// means the target taxonomy has no equivalent classification and the share
/// is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSplit {
    pub name: String,
    pub categories: Option<Vec<String>>,
    pub amount: f64,
}

/// The external rule-engine boundary: one source flow in, zero or more
/// proportional target shares out. The shares are authoritative and
/// unvalidated here; whatever they sum to is what gets emitted.
pub trait Disaggregation {
    fn disaggregate(&self, source: &SourceFlow) -> Vec<FlowSplit>;
}

/// A flat disaggregation rule set keyed by source flow name, loadable from
/// JSON. Stands in for the full migration engine when a static mapping is
/// all a taxonomy pair needs; unknown names disaggregate to nothing.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: HashMap<String, Vec<FlowSplit>>,
}

impl RuleSet {
    pub fn from_json<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn insert(&mut self, source_name: &str, splits: Vec<FlowSplit>) {
        self.rules.insert(source_name.to_string(), splits);
    }
}

impl Disaggregation for RuleSet {
    fn disaggregate(&self, source: &SourceFlow) -> Vec<FlowSplit> {
        self.rules.get(&source.name).cloned().unwrap_or_default()
    }
}
