//! Persists every output format of a run into one directory.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::OutputError;
use crate::result::AnnotationResult;

use super::{to_inline_markup, to_record, to_rows, write_parquet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub markup: PathBuf,
    pub parquet: PathBuf,
    pub rows: PathBuf,
    pub record: PathBuf,
    pub statistics: PathBuf,
}

/// Writes `<base>.xml`, `<base>.parquet`, `<base>.rows.json`, `<base>.json`
/// and `<base>.stats.json` under `dir`, creating it if needed.
pub fn write_outputs(
    result: &AnnotationResult,
    dir: impl AsRef<Path>,
    base: &str,
) -> Result<OutputPaths, OutputError> {
    let dir = dir.as_ref();
    if base.is_empty() || base.contains(['/', '\\']) || base == "." || base == ".." {
        return Err(OutputError::InvalidBaseName(base.to_string()));
    }
    fs::create_dir_all(dir).map_err(|source| OutputError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let paths = OutputPaths {
        markup: dir.join(format!("{base}.xml")),
        parquet: dir.join(format!("{base}.parquet")),
        rows: dir.join(format!("{base}.rows.json")),
        record: dir.join(format!("{base}.json")),
        statistics: dir.join(format!("{base}.stats.json")),
    };

    write_file(&paths.markup, to_inline_markup(result).as_bytes())?;
    let rows = to_rows(result);
    write_parquet(&rows, &paths.parquet)?;
    write_json(&paths.rows, &rows)?;
    write_json(&paths.record, &to_record(result))?;
    write_json(&paths.statistics, result.statistics())?;

    info!(
        dir = %dir.display(),
        base,
        annotations = result.total_annotations(),
        "wrote annotation outputs"
    );
    Ok(paths)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), OutputError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_file(path, &bytes)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), OutputError> {
    let io_err = |source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::create(path).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)
}
