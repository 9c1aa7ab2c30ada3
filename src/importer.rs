//! Bulk import of analysis worker output into the database.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::analysis::{AnalysisError, TrackAnalysis};
use crate::db::Database;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("{path}: {source}")]
    File {
        path: String,
        #[source]
        source: AnalysisError,
    },
}

#[derive(Debug, Default, PartialEq)]
pub struct ImportResult {
    pub files: u64,
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub errors: u64,
}

/// A worker file holds either one record or a batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum AnalysisFile {
    Batch(Vec<TrackAnalysis>),
    One(Box<TrackAnalysis>),
}

/// Collect `*.json` files under the given paths, sorted for stable output.
pub fn find_analysis_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = paths
        .iter()
        .flat_map(|root| {
            WalkDir::new(root)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| {
                    e.path()
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
                })
                .map(|e| e.into_path())
        })
        .collect();
    files.sort();
    files.dedup();
    files
}

/// Read and validate one file.
pub fn read_analysis_file(path: &Path) -> Result<Vec<TrackAnalysis>, ImportError> {
    let wrap = |source: AnalysisError| ImportError::File {
        path: path.display().to_string(),
        source,
    };
    let contents = std::fs::read_to_string(path).map_err(|e| wrap(e.into()))?;
    let records = match serde_json::from_str(&contents).map_err(|e| wrap(e.into()))? {
        AnalysisFile::Batch(records) => records,
        AnalysisFile::One(record) => vec![*record],
    };
    for record in &records {
        record.validate().map_err(wrap)?;
    }
    Ok(records)
}

/// Import every analysis file under `paths`. Files are parsed in parallel and
/// written in a single transaction; a bad file is logged and counted, not
/// fatal.
pub fn import(db: &Database, paths: &[PathBuf], force: bool) -> Result<ImportResult, ImportError> {
    let files = find_analysis_files(paths);
    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    pb.set_message("Reading analyses...");

    let parsed: Vec<(&PathBuf, Result<Vec<TrackAnalysis>, ImportError>)> = files
        .par_iter()
        .map(|path| {
            let result = read_analysis_file(path);
            pb.inc(1);
            (path, result)
        })
        .collect();

    let mut result = ImportResult {
        files: files.len() as u64,
        ..Default::default()
    };

    let tx = db.conn.unchecked_transaction().map_err(crate::db::DbError::from)?;
    for (path, records) in parsed {
        let records = match records {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Skipping {e}");
                result.errors += 1;
                continue;
            }
        };
        let source = path.to_string_lossy();
        for record in records {
            match db.get_analysis(&record.track_id)? {
                Some(existing) if existing == record && !force => {
                    result.unchanged += 1;
                    continue;
                }
                Some(_) => result.updated += 1,
                None => result.new += 1,
            }
            db.upsert_analysis(&record, Some(&source))?;
        }
    }
    tx.commit().map_err(crate::db::DbError::from)?;

    pb.finish_with_message(format!(
        "Done: {} new, {} updated, {} unchanged, {} errors",
        result.new, result.updated, result.unchanged, result.errors
    ));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camelot::CamelotKey;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    fn record_json(id: &str, bpm: f64) -> String {
        serde_json::to_string(&TrackAnalysis::new(id, bpm, CamelotKey::parse("8A"), 0.5)).unwrap()
    }

    #[test]
    fn test_finds_json_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write(dir.path(), "a.json", "{}");
        write(&dir.path().join("nested"), "b.JSON", "{}");
        write(dir.path(), "notes.txt", "");
        let files = find_analysis_files(&[dir.path().to_path_buf()]);
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_import_counts() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "t1.json", &record_json("t1", 126.0));
        write(
            dir.path(),
            "batch.json",
            &format!("[{}, {}]", record_json("t2", 125.0), record_json("t3", 140.0)),
        );
        write(dir.path(), "broken.json", "{ not json");
        write(dir.path(), "bad_bpm.json", &record_json("t4", -1.0));

        let db = Database::open_in_memory().unwrap();
        let roots = [dir.path().to_path_buf()];
        let first = import(&db, &roots, false).unwrap();
        assert_eq!(first.files, 4);
        assert_eq!(first.new, 3);
        assert_eq!(first.errors, 2);
        assert_eq!(db.list_analyses().unwrap().len(), 3);

        let again = import(&db, &roots, false).unwrap();
        assert_eq!(again.new, 0);
        assert_eq!(again.unchanged, 3);

        write(dir.path(), "t1.json", &record_json("t1", 128.0));
        let changed = import(&db, &roots, false).unwrap();
        assert_eq!(changed.updated, 1);
        assert_eq!(db.get_analysis("t1").unwrap().unwrap().bpm, 128.0);

        let forced = import(&db, &roots, true).unwrap();
        assert_eq!(forced.updated, 3);
    }
}
