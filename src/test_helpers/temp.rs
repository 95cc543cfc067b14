use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use zip::write::FileOptions;
use zip::ZipWriter;

/// Test context with temporary directory management.
/// Automatically cleans up when dropped.
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a new test context with a fresh temporary directory
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Get the root path of the temporary directory
    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Build `package.zip` holding an optional manifest.json plus the given files
    pub fn create_package(&self, manifest: Option<&str>, files: &[(&str, &[u8])]) -> PathBuf {
        let path = self.root().join("package.zip");
        let file = fs::File::create(&path).expect("Failed to create zip");
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        if let Some(manifest) = manifest {
            zip.start_file("manifest.json", options)
                .expect("Failed to start manifest");
            zip.write_all(manifest.as_bytes())
                .expect("Failed to write manifest");
        }
        for (name, data) in files {
            zip.start_file(*name, options).expect("Failed to start file");
            zip.write_all(data).expect("Failed to write file");
        }

        zip.finish().expect("Failed to finish zip");
        path
    }

    /// Build a single-application package in the layout nrfutil produces
    pub fn create_app_package(&self, init: &[u8], image: &[u8]) -> PathBuf {
        let manifest = r#"{
            "manifest": {
                "application": { "bin_file": "app.bin", "dat_file": "app.dat" }
            }
        }"#;
        self.create_package(Some(manifest), &[("app.bin", image), ("app.dat", init)])
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
