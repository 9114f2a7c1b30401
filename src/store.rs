//! Atomic JSON documents under the installation state directory.
//!
//! Every write goes to a sibling `.tmp` file that is then renamed over the
//! target, so readers never observe a half-written document.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::error::StoreError;

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_err(path: &Path, source: serde_json::Error) -> StoreError {
    StoreError::Json {
        path: path.display().to_string(),
        source,
    }
}

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let data = serde_json::to_vec_pretty(value).map_err(|e| json_err(path, e))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);
    fs::write(tmp, data).map_err(|e| io_err(tmp, e))?;
    fs::rename(tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Read a JSON document. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|e| json_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        write_json_atomic(&path, &serde_json::json!({"k": [1, 2, 3]})).unwrap();
        let back: serde_json::Value = read_json(&path).unwrap().unwrap();
        assert_eq!(back["k"][2], 3);

        // No temp file left behind
        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let got: Option<Vec<u32>> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{oops").unwrap();
        let got: Result<Option<Vec<u32>>, _> = read_json(&path);
        assert!(matches!(got, Err(StoreError::Json { .. })));
    }
}
