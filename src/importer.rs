use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use tracing::info;

use crate::assemble::{technosphere_stream, BiosphereTable, DisaggregationStats, TargetLookup};
use crate::entities::EntityMap;
use crate::error::{ImportError, Result};
use crate::grid::{open_table, read_labels, resolved_offsets, table_cells, Cell, TableLabels};
use crate::layout::{LayoutRegistry, SemanticRole, VersionLayout, BIOSPHERE_ROLES};
use crate::migrate::Disaggregation;
use crate::package::{
    License, MatrixResource, MatrixRole, PackageMetadata, PackageSpec, PackageWriter, ResourceSpec,
};
use crate::store::{EntityRef, EntityStore};

/// Explicit run configuration. Every path is threaded through here; nothing
/// is read from process-wide state.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Converted worksheet dumps, one subdirectory per workbook.
    pub data_dir: PathBuf,
    /// Where calculation packages are published.
    pub output_dir: PathBuf,
    /// Dataset family name, prefixed to the version for collection names.
    pub dataset_name: String,
    /// Existing collection holding the target biosphere taxonomy.
    pub biosphere_collection: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    Imported {
        path: PathBuf,
        stats: DisaggregationStats,
    },
    /// The idempotency guard found the collection already present; nothing
    /// was read or written.
    AlreadyImported { collection: String },
}

/// The import pipeline, generic over its three external boundaries.
pub struct Importer<S, W, D> {
    config: ImportConfig,
    registry: LayoutRegistry,
    store: S,
    writer: W,
    disaggregation: D,
}

fn index_ids(
    entities: Vec<EntityRef>,
    size: usize,
    index_of: impl Fn(&str, &str) -> Option<usize>,
) -> Result<Vec<u32>> {
    let mut ids = vec![0u32; size];
    for entity in entities {
        let index = index_of(&entity.name, &entity.location).ok_or_else(|| {
            ImportError::Structural(format!(
                "store returned unknown entity ({}, {})",
                entity.name, entity.location
            ))
        })?;
        ids[index] = entity.id;
    }
    // Entity ids are 1-based, so an untouched slot means a missing entity.
    if let Some(index) = ids.iter().position(|&id| id == 0) {
        return Err(ImportError::Structural(format!(
            "no persisted entity covers matrix index {index}"
        )));
    }
    Ok(ids)
}

impl<S, W, D> Importer<S, W, D>
where
    S: EntityStore,
    W: PackageWriter,
    D: Disaggregation,
{
    pub fn new(
        config: ImportConfig,
        registry: LayoutRegistry,
        store: S,
        writer: W,
        disaggregation: D,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            writer,
            disaggregation,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Import one dataset version: check the idempotency guard, build
    /// entity identities, stream both matrices into a calculation package,
    /// register it with the store.
    pub fn run(&mut self, version: &str) -> Result<ImportOutcome> {
        let collection = format!("{} {}", self.config.dataset_name, version);
        if self.store.has_collection(&collection)? {
            info!(collection = %collection, "version already imported; skipping");
            return Ok(ImportOutcome::AlreadyImported { collection });
        }
        let layout = self.registry.version(version)?.clone();

        info!(version, "reading row and column labels for all inputs");
        let labels = self.read_all_labels(&layout)?;

        let technosphere_table = layout.required_table(SemanticRole::Technosphere)?;
        let technosphere_labels = labels.get(&technosphere_table.worksheet).ok_or_else(|| {
            ImportError::Layout(format!(
                "no labels read for {}",
                technosphere_table.worksheet
            ))
        })?;
        let map = EntityMap::build(
            &technosphere_labels.row_labels,
            &technosphere_labels.col_labels,
        )?;
        let size = map.size();

        let major = version.split(['.', ' ']).next().unwrap_or(version);
        let geocollection = format!("{} {}", self.config.dataset_name, major);
        info!(
            locations = map.locations.len(),
            flows = size,
            "writing activity and flow data"
        );
        self.store
            .create_entities(&map.bundle(&collection, &geocollection))?;

        let row_ids = index_ids(self.store.product_flows(&collection)?, size, |name, loc| {
            map.row_index(name, loc)
        })?;
        let col_ids = index_ids(self.store.activities(&collection)?, size, |name, loc| {
            map.col_index(name, loc)
        })?;

        let mut targets = TargetLookup::new();
        for flow in self
            .store
            .biosphere_flows(&self.config.biosphere_collection)?
        {
            targets.insert((flow.name, flow.categories), flow.id);
        }

        let technosphere = technosphere_stream(
            self.role_cells(&layout, SemanticRole::Technosphere)?,
            self.role_cells(&layout, SemanticRole::Production)?,
            &row_ids,
            &col_ids,
        );

        let stats = Rc::new(RefCell::new(DisaggregationStats::default()));
        let mut extension_tables = Vec::new();
        for role in BIOSPHERE_ROLES {
            for table in layout.tables(role) {
                let table_labels = labels.get(&table.worksheet).ok_or_else(|| {
                    ImportError::Layout(format!("no labels read for {}", table.worksheet))
                })?;
                extension_tables.push(BiosphereTable::new(
                    table_cells(&self.config.data_dir, table)?,
                    &table_labels.row_labels,
                    &self.disaggregation,
                    &targets,
                    &col_ids,
                    Rc::clone(&stats),
                ));
            }
        }
        let biosphere = extension_tables.into_iter().flatten();

        let spec = PackageSpec {
            name: format!("{}.lci", collection.replace(' ', "")),
            metadata: PackageMetadata {
                importer: concat!(env!("CARGO_PKG_NAME"), "::Importer").to_string(),
                licenses: vec![License::cc_by_sa_4()],
            },
        };
        let resources = vec![
            MatrixResource {
                spec: ResourceSpec::new(
                    &format!("{collection} technosphere"),
                    &format!("{collection}.technosphere.csv.gz"),
                    MatrixRole::Technosphere,
                    Some([size as u64, size as u64]),
                ),
                records: Box::new(technosphere),
            },
            MatrixResource {
                spec: ResourceSpec::new(
                    &format!("{collection} biosphere"),
                    &format!("{collection}.biosphere.csv.gz"),
                    MatrixRole::Biosphere,
                    None,
                ),
                records: Box::new(biosphere),
            },
        ];
        info!("writing matrices");
        let path = self.writer.write_package(&spec, resources)?;
        self.store.record_package(&collection, &path)?;

        let stats = *stats.borrow();
        info!(
            dropped_no_category = stats.dropped_no_category,
            dropped_unmapped_target = stats.dropped_unmapped_target,
            "import finished"
        );
        Ok(ImportOutcome::Imported { path, stats })
    }

    fn read_all_labels(&self, layout: &VersionLayout) -> Result<HashMap<String, TableLabels>> {
        let mut labels = HashMap::new();
        for table in layout.all_tables() {
            let (row_offset, col_offset) = resolved_offsets(&self.config.data_dir, table)?;
            let reader = open_table(&self.config.data_dir, table)?;
            labels.insert(
                table.worksheet.clone(),
                read_labels(reader, row_offset, col_offset)?,
            );
        }
        Ok(labels)
    }

    fn role_cells(
        &self,
        layout: &VersionLayout,
        role: SemanticRole,
    ) -> Result<impl Iterator<Item = Result<Cell>>> {
        let mut streams = Vec::new();
        for table in layout.tables(role) {
            streams.push(table_cells(&self.config.data_dir, table)?);
        }
        Ok(streams.into_iter().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::CoefficientRecord;
    use crate::layout::TableLayout;
    use crate::migrate::{FlowSplit, RuleSet};
    use crate::package::{FsPackageWriter, Manifest};
    use crate::store::MemoryStore;
    use flate2::read::GzDecoder;
    use std::fs::{self, File};
    use std::path::Path;

    fn write_dataset(dir: &Path) {
        let book = dir.join("book");
        fs::create_dir_all(&book).unwrap();
        fs::write(
            book.join("tech.csv"),
            ",,DE,FR\n,,steel,bread\nDE,steel,2,0.5\nFR,bread,,0.3\n",
        )
        .unwrap();
        fs::write(book.join("prod.csv"), ",production\n,7\n").unwrap();
        fs::write(
            book.join("emiss.csv"),
            ",,DE,FR\nCO2,kg,10,4\nCH4,kg,,2\n",
        )
        .unwrap();
    }

    fn registry() -> LayoutRegistry {
        let mut layout = VersionLayout::default();
        layout.insert(
            SemanticRole::Technosphere,
            TableLayout::new("book", "tech", 2, 2),
        );
        layout.insert(
            SemanticRole::Production,
            TableLayout::new("book", "prod", 1, 1),
        );
        layout.insert(
            SemanticRole::BiosphereEmissions,
            TableLayout::new("book", "emiss", 1, 2),
        );
        registry_with(layout)
    }

    fn registry_with(layout: VersionLayout) -> LayoutRegistry {
        let mut registry = LayoutRegistry::default();
        registry.insert("1.0 test", layout);
        registry
    }

    fn rules() -> RuleSet {
        let mut rules = RuleSet::default();
        rules.insert(
            "CO2",
            vec![FlowSplit {
                name: "Carbon dioxide".to_string(),
                categories: Some(vec!["air".to_string()]),
                amount: 1.0,
            }],
        );
        rules.insert(
            "CH4",
            vec![
                FlowSplit {
                    name: "Methane".to_string(),
                    categories: Some(vec!["air".to_string()]),
                    amount: 0.5,
                },
                FlowSplit {
                    name: "Methane, fossil".to_string(),
                    categories: None,
                    amount: 0.5,
                },
            ],
        );
        rules
    }

    fn store() -> MemoryStore {
        let mut store = MemoryStore::default();
        store.add_biosphere_flow("target bio", "Carbon dioxide", &["air"], 101);
        store.add_biosphere_flow("target bio", "Methane", &["air"], 102);
        store
    }

    fn importer(dir: &Path) -> Importer<MemoryStore, FsPackageWriter, RuleSet> {
        let config = ImportConfig {
            data_dir: dir.join("data"),
            output_dir: dir.join("processed"),
            dataset_name: "Dataset".to_string(),
            biosphere_collection: "target bio".to_string(),
        };
        write_dataset(&config.data_dir);
        let writer = FsPackageWriter::new(&config.output_dir);
        Importer::new(config, registry(), store(), writer, rules())
    }

    fn read_records(path: &Path) -> Vec<CoefficientRecord> {
        let mut reader = csv::Reader::from_reader(GzDecoder::new(File::open(path).unwrap()));
        reader
            .deserialize()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn imports_a_full_dataset_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut importer = importer(dir.path());

        let outcome = importer.run("1.0 test").unwrap();
        let (path, stats) = match outcome {
            ImportOutcome::Imported { path, stats } => (path, stats),
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(path, dir.path().join("processed").join("Dataset1.0test.lci"));

        let manifest: Manifest =
            serde_json::from_reader(File::open(path.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.resources.len(), 2);
        assert_eq!(manifest.resources[0].records, 5);
        assert_eq!(manifest.resources[1].records, 3);

        let technosphere = read_records(&path.join("Dataset 1.0 test.technosphere.csv.gz"));
        assert_eq!(
            technosphere,
            vec![
                CoefficientRecord::new(1, 1, 2.0, true),
                CoefficientRecord::new(1, 2, 0.5, true),
                CoefficientRecord::new(2, 2, 0.3, true),
                // Production covers column 0; column 1 is unit fill-in.
                CoefficientRecord::new(1, 1, 7.0, false),
                CoefficientRecord::new(2, 2, 1.0, false),
            ]
        );

        let biosphere = read_records(&path.join("Dataset 1.0 test.biosphere.csv.gz"));
        assert_eq!(
            biosphere,
            vec![
                CoefficientRecord::new(101, 1, 10.0, false),
                CoefficientRecord::new(101, 2, 4.0, false),
                CoefficientRecord::new(102, 2, 1.0, false),
            ]
        );

        assert_eq!(stats.dropped_no_category, 1);
        assert_eq!(stats.dropped_unmapped_target, 0);

        assert_eq!(importer.store().packages().len(), 1);
        assert_eq!(importer.store().packages()[0].collection, "Dataset 1.0 test");
    }

    #[test]
    fn second_run_short_circuits_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut importer = importer(dir.path());

        importer.run("1.0 test").unwrap();
        let outcome = importer.run("1.0 test").unwrap();
        assert_eq!(
            outcome,
            ImportOutcome::AlreadyImported {
                collection: "Dataset 1.0 test".to_string()
            }
        );

        assert_eq!(importer.store().packages().len(), 1);
        assert_eq!(fs::read_dir(dir.path().join("processed")).unwrap().count(), 1);
    }

    #[test]
    fn unknown_version_aborts_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut importer = importer(dir.path());

        let err = importer.run("2.0 draft").unwrap_err();
        assert!(matches!(err, ImportError::VersionNotConfigured(_)));
        assert!(!dir.path().join("processed").exists());
    }

    #[test]
    fn corrupt_cell_aborts_and_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut importer = importer(dir.path());
        fs::write(
            dir.path().join("data").join("book").join("prod.csv"),
            ",production\n,seven\n",
        )
        .unwrap();

        let err = importer.run("1.0 test").unwrap_err();
        assert!(matches!(err, ImportError::MalformedCell { .. }));
        assert_eq!(fs::read_dir(dir.path().join("processed")).unwrap().count(), 0);
        assert!(importer.store().packages().is_empty());
    }
}
