use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::assemble::CoefficientRecord;
use crate::error::Result;
use crate::schema::record_dtype;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixRole {
    Technosphere,
    Biosphere,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub name: String,
    pub path: String,
    pub title: String,
}

impl License {
    /// The license the source dataset family is distributed under.
    pub fn cc_by_sa_4() -> Self {
        Self {
            name: "CC-BY-SA-4.0".to_string(),
            path: "https://creativecommons.org/licenses/by-sa/4.0/".to_string(),
            title: "Creative Commons Attribution-ShareAlike 4.0 International".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub importer: String,
    #[serde(default)]
    pub licenses: Vec<License>,
}

#[derive(Debug, Clone)]
pub struct PackageSpec {
    pub name: String,
    pub metadata: PackageMetadata,
}

/// Descriptor of one matrix resource inside a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub path: String,
    pub matrix: MatrixRole,
    pub dtype: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<[u64; 2]>,
}

impl ResourceSpec {
    pub fn new(name: &str, path: &str, matrix: MatrixRole, shape: Option<[u64; 2]>) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            matrix,
            dtype: record_dtype(),
            shape,
        }
    }
}

/// One matrix resource: its descriptor plus the lazy record stream. The
/// stream is one-pass; the writer is its only consumer.
pub struct MatrixResource<'a> {
    pub spec: ResourceSpec,
    pub records: Box<dyn Iterator<Item = Result<CoefficientRecord>> + 'a>,
}

/// The package persistence boundary: consume the record streams, produce a
/// versioned artifact, return its path.
pub trait PackageWriter {
    fn write_package(&self, spec: &PackageSpec, resources: Vec<MatrixResource<'_>>)
        -> Result<PathBuf>;
}

#[derive(Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub id: Uuid,
    pub profile: String,
    pub created: String,
    pub importer: String,
    pub licenses: Vec<License>,
    pub resources: Vec<ManifestResource>,
}

#[derive(Serialize, Deserialize)]
pub struct ManifestResource {
    #[serde(flatten)]
    pub spec: ResourceSpec,
    pub records: u64,
}

/// Filesystem writer: each resource becomes a gzip-compressed CSV of
/// coefficient records next to a `manifest.json`. Everything is staged in a
/// uniquely-named directory and published with a single rename, so a failed
/// run leaves no partial artifact behind.
#[derive(Debug, Clone)]
pub struct FsPackageWriter {
    output_dir: PathBuf,
}

impl FsPackageWriter {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
        }
    }

    fn write_staged(
        &self,
        staging: &Path,
        spec: &PackageSpec,
        resources: Vec<MatrixResource<'_>>,
    ) -> Result<()> {
        let mut described = Vec::with_capacity(resources.len());
        for resource in resources {
            let file = File::create(staging.join(&resource.spec.path))?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            let mut records = 0u64;
            {
                let mut writer = csv::Writer::from_writer(&mut encoder);
                for record in resource.records {
                    writer.serialize(record?)?;
                    records += 1;
                }
                writer.flush()?;
            }
            encoder.try_finish()?;
            debug!(resource = %resource.spec.name, records, "resource staged");
            described.push(ManifestResource {
                spec: resource.spec,
                records,
            });
        }

        let manifest = Manifest {
            name: spec.name.clone(),
            id: Uuid::new_v4(),
            profile: "calculation-package".to_string(),
            created: Utc::now().to_rfc3339(),
            importer: spec.metadata.importer.clone(),
            licenses: spec.metadata.licenses.clone(),
            resources: described,
        };
        serde_json::to_writer_pretty(File::create(staging.join("manifest.json"))?, &manifest)?;
        Ok(())
    }
}

impl PackageWriter for FsPackageWriter {
    fn write_package(
        &self,
        spec: &PackageSpec,
        resources: Vec<MatrixResource<'_>>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;
        let staging = self
            .output_dir
            .join(format!(".staging-{}", Uuid::new_v4()));
        fs::create_dir(&staging)?;

        if let Err(e) = self.write_staged(&staging, spec, resources) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let target = self.output_dir.join(&spec.name);
        if let Err(e) = fs::rename(&staging, &target) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        info!(package = %target.display(), "calculation package published");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportError;
    use flate2::read::GzDecoder;

    fn spec() -> PackageSpec {
        PackageSpec {
            name: "Dataset1.0.lci".to_string(),
            metadata: PackageMetadata {
                importer: "mrio_lcikit".to_string(),
                licenses: vec![License::cc_by_sa_4()],
            },
        }
    }

    fn resource<'a>(records: Vec<Result<CoefficientRecord>>) -> MatrixResource<'a> {
        MatrixResource {
            spec: ResourceSpec::new(
                "Dataset 1.0 technosphere",
                "Dataset 1.0.technosphere.csv.gz",
                MatrixRole::Technosphere,
                Some([2, 2]),
            ),
            records: Box::new(records.into_iter()),
        }
    }

    #[test]
    fn publishes_manifest_and_readable_resources() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsPackageWriter::new(dir.path());

        let records = vec![
            Ok(CoefficientRecord::new(1, 2, 5.0, true)),
            Ok(CoefficientRecord::new(2, 2, 1.0, false)),
        ];
        let path = writer
            .write_package(&spec(), vec![resource(records)])
            .unwrap();
        assert_eq!(path, dir.path().join("Dataset1.0.lci"));

        let manifest: Manifest =
            serde_json::from_reader(File::open(path.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.name, "Dataset1.0.lci");
        assert_eq!(manifest.profile, "calculation-package");
        assert_eq!(manifest.resources.len(), 1);
        assert_eq!(manifest.resources[0].records, 2);
        assert_eq!(manifest.resources[0].spec.shape, Some([2, 2]));

        let gz = GzDecoder::new(File::open(path.join("Dataset 1.0.technosphere.csv.gz")).unwrap());
        let mut reader = csv::Reader::from_reader(gz);
        let rows: Vec<CoefficientRecord> = reader
            .deserialize()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount, 5.0);
        assert!(rows[0].flip);

        // No staging leftovers after publication.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failed_stream_leaves_no_partial_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsPackageWriter::new(dir.path());

        let records = vec![
            Ok(CoefficientRecord::new(1, 1, 1.0, false)),
            Err(ImportError::Structural("broken stream".to_string())),
        ];
        let err = writer
            .write_package(&spec(), vec![resource(records)])
            .unwrap_err();
        assert!(matches!(err, ImportError::Structural(_)));

        assert!(!dir.path().join("Dataset1.0.lci").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
