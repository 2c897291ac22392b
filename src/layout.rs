use std::collections::BTreeMap;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};

/// Where numeric data begins inside one converted worksheet.
///
/// `filename` is the workbook directory under the converted-data dir;
/// `worksheet` names the CSV dump inside it. Offsets left unset are filled
/// by heuristic detection at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    pub filename: String,
    pub worksheet: String,
    #[serde(default)]
    pub row_offset: Option<usize>,
    #[serde(default)]
    pub col_offset: Option<usize>,
}

impl TableLayout {
    pub fn new(filename: &str, worksheet: &str, row_offset: usize, col_offset: usize) -> Self {
        Self {
            filename: filename.to_string(),
            worksheet: worksheet.to_string(),
            row_offset: Some(row_offset),
            col_offset: Some(col_offset),
        }
    }
}

/// What a worksheet means to the assembled matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SemanticRole {
    Technosphere,
    Production,
    BiosphereEmissions,
    BiosphereResources,
    BiosphereLand,
}

/// Emission order of the extension tables in the assembled biosphere stream.
pub const BIOSPHERE_ROLES: [SemanticRole; 3] = [
    SemanticRole::BiosphereEmissions,
    SemanticRole::BiosphereResources,
    SemanticRole::BiosphereLand,
];

/// Role → worksheet layouts for one dataset version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionLayout {
    tables: BTreeMap<SemanticRole, Vec<TableLayout>>,
}

impl VersionLayout {
    pub fn insert(&mut self, role: SemanticRole, table: TableLayout) {
        self.tables.entry(role).or_default().push(table);
    }

    pub fn tables(&self, role: SemanticRole) -> &[TableLayout] {
        self.tables.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The single table a role must provide, or a layout error naming it.
    pub fn required_table(&self, role: SemanticRole) -> Result<&TableLayout> {
        self.tables(role)
            .first()
            .ok_or_else(|| ImportError::Layout(format!("no table configured for {role:?}")))
    }

    pub fn all_tables(&self) -> impl Iterator<Item = &TableLayout> {
        self.tables.values().flatten()
    }
}

/// Declarative per-version table registry. Adding a dataset version is one
/// more descriptor entry, in code via [`LayoutRegistry::insert`] or loaded
/// from JSON; no branching on version strings anywhere else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayoutRegistry {
    versions: BTreeMap<String, VersionLayout>,
}

impl LayoutRegistry {
    /// Registry entries for the dataset versions this crate ships support
    /// for out of the box.
    pub fn builtin() -> Self {
        let mut layout = VersionLayout::default();
        layout.insert(
            SemanticRole::Technosphere,
            TableLayout::new("Exiobase_MR_HIOT_2011_v3_3_17_by_prod_tech", "HIOT", 4, 5),
        );
        layout.insert(
            SemanticRole::Production,
            TableLayout::new(
                "Exiobase_MR_HIOT_2011_v3_3_17_by_prod_tech",
                "Principal_production_vector",
                8,
                1,
            ),
        );
        layout.insert(
            SemanticRole::BiosphereResources,
            TableLayout::new("MR_HIOT_2011_v3_3_17_extensions", "resource_act", 4, 2),
        );
        layout.insert(
            SemanticRole::BiosphereLand,
            TableLayout::new("MR_HIOT_2011_v3_3_17_extensions", "Land_act", 4, 2),
        );
        layout.insert(
            SemanticRole::BiosphereEmissions,
            TableLayout::new("MR_HIOT_2011_v3_3_17_extensions", "Emiss_act", 4, 3),
        );

        let mut registry = Self::default();
        registry.insert("3.3.17 hybrid", layout);
        registry
    }

    pub fn insert(&mut self, version: &str, layout: VersionLayout) {
        self.versions.insert(version.to_string(), layout);
    }

    pub fn from_json<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn version(&self, version: &str) -> Result<&VersionLayout> {
        self.versions
            .get(version)
            .ok_or_else(|| ImportError::VersionNotConfigured(version.to_string()))
    }
}
