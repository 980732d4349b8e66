//! Compiled-function CSVs.
//!
//! Each pass that transforms functions appends their symbol names to a
//! one-column CSV. Subsequent invocations read the file to avoid
//! re-transforming and to redirect cross-module calls to `_original` /
//! `_dup` variants. Files are opened, written and closed in a tight scope.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write as _};
use std::path::Path;

pub const EDDI_CSV: &str = "compiled_eddi_functions.csv";
pub const RASM_CSV: &str = "compiled_rasm_functions.csv";
pub const RACFED_CSV: &str = "compiled_racfed_functions.csv";

const HEADER: &str = "fn_name";

/// Writes the compiled-function list, one symbol per line under a `fn_name`
/// header.
pub fn persist_compiled_functions(
    dir: &Path,
    filename: &str,
    names: &BTreeSet<String>,
) -> io::Result<()> {
    let mut file = fs::File::create(dir.join(filename))?;
    writeln!(file, "{HEADER}")?;
    for name in names {
        writeln!(file, "{name}")?;
    }
    Ok(())
}

/// Reads a compiled-function list. A missing file is an empty set, so first
/// runs need no setup.
pub fn read_compiled_functions(dir: &Path, filename: &str) -> io::Result<BTreeSet<String>> {
    let text = match fs::read_to_string(dir.join(filename)) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(e),
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != HEADER)
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let names: BTreeSet<String> = ["main", "fact_ret", "fact_ret_dup"]
            .into_iter()
            .map(String::from)
            .collect();
        persist_compiled_functions(dir.path(), EDDI_CSV, &names).unwrap();
        let back = read_compiled_functions(dir.path(), EDDI_CSV).unwrap();
        assert_eq!(back, names);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let set = read_compiled_functions(dir.path(), RASM_CSV).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_header_is_written_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let names: BTreeSet<String> = ["f"].into_iter().map(String::from).collect();
        persist_compiled_functions(dir.path(), RACFED_CSV, &names).unwrap();
        let text = fs::read_to_string(dir.path().join(RACFED_CSV)).unwrap();
        assert!(text.starts_with("fn_name\n"));
        let back = read_compiled_functions(dir.path(), RACFED_CSV).unwrap();
        assert!(!back.contains("fn_name"));
    }
}
