use std::path::{Path, PathBuf};

use log::{debug, info};
use walkdir::WalkDir;

use crate::error::WorkerError;

const PDF_MIME: &str = "application/pdf";

/// Finds the PDF files a batch should ingest.
pub struct DirectoryScanner {
    input_path: PathBuf,
}

impl DirectoryScanner {
    pub fn new<P: AsRef<Path>>(input_path: P) -> Self {
        Self {
            input_path: input_path.as_ref().to_path_buf(),
        }
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    /// A file is taken as given. A directory yields its top-level PDFs by
    /// MIME type guessed from the extension, in file-name order.
    pub fn scan(&self) -> Result<Vec<PathBuf>, WorkerError> {
        if !self.input_path.exists() {
            return Err(WorkerError::MissingInput(self.input_path.clone()));
        }
        if self.input_path.is_file() {
            return Ok(vec![self.input_path.clone()]);
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.input_path)
            .min_depth(1)
            .max_depth(1) // Only scan top level
            .sort_by_file_name()
        {
            let entry = entry.map_err(|source| WorkerError::ScanFailed {
                path: self.input_path.clone(),
                source,
            })?;
            let path = entry.path();

            if !entry.file_type().is_file() {
                continue;
            }

            if is_pdf(path) {
                debug!("Found document: {}", path.display());
                paths.push(path.to_path_buf());
            }
        }

        info!(
            "Scanned {} documents in {}",
            paths.len(),
            self.input_path.display()
        );
        Ok(paths)
    }
}

fn is_pdf(path: &Path) -> bool {
    mime_guess::from_path(path)
        .iter()
        .any(|mime| mime.essence_str() == PDF_MIME)
}
