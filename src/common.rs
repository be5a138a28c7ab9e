use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::error::{PipelineError, Result};

pub fn sql_escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "''")
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| PipelineError::write_failure(path, err))?;
    }
    Ok(())
}

pub fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or("output");
    path.with_file_name(format!("{file_name}.tmp"))
}

/// Writes through a sibling `.tmp` file so a failed run never leaves a torn artifact.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path);
    fs::write(&tmp_path, contents).map_err(|err| PipelineError::write_failure(path, err))?;
    finish_atomic(&tmp_path, path)
}

pub fn finish_atomic(tmp_path: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp_path, path).map_err(|err| {
        let _ = fs::remove_file(tmp_path);
        PipelineError::write_failure(path, err)
    })
}

pub fn to_io_error(err: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::other(err)
}

/// `<dir>/<stem><suffix>` next to `path`, e.g. `report.json` -> `report-discards.csv`.
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|x| x.to_str())
        .unwrap_or("payment-influence");
    path.with_file_name(format!("{stem}{suffix}"))
}

pub fn cents_from_dollars(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

pub fn dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub fn round_cents(value: f64) -> f64 {
    round_to(value, 2)
}

/// Percentage of `part` in `whole`, or `None` when the whole is zero.
pub fn pct(part: f64, whole: f64) -> Option<f64> {
    if whole == 0.0 {
        None
    } else {
        Some(round_to(part * 100.0 / whole, 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_path_replaces_extension() {
        let p = Path::new("/tmp/out/report.json");
        assert_eq!(
            sibling_path(p, "-discards.csv"),
            PathBuf::from("/tmp/out/report-discards.csv")
        );
        assert_eq!(sibling_path(p, ".md"), PathBuf::from("/tmp/out/report.md"));
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_cents(26727.996), 26728.0);
        assert_eq!(round_to(3.231_531, 2), 3.23);
        assert_eq!(cents_from_dollars(10.005_000_1), 1001);
        assert_eq!(dollars(123_456), 1234.56);
        assert_eq!(pct(1.0, 3.0), Some(33.33));
        assert_eq!(pct(1.0, 0.0), None);
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(sql_escape_path(Path::new("/x/o'brien.csv")), "/x/o''brien.csv");
    }

    #[test]
    fn write_atomic_reports_unwritable_parent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let target = blocker.join("report.json");
        let err = write_atomic(&target, "{}").unwrap_err();
        match err {
            PipelineError::WriteFailure { path, .. } => assert_eq!(path, target),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn write_atomic_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("out.md");
        write_atomic(&target, "# ok\n").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "# ok\n");
        assert!(!tmp_path_for(&target).exists());
    }
}
