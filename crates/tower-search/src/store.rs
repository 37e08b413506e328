//! Content-addressed storage for accepted towers.
//!
//! Every artifact is written as canonical JSON (sorted keys, four-space
//! indent, shortest round-trip floats) to `<dir>/<sha256>.json`, where the
//! digest is taken over exactly those bytes. Equal results therefore always
//! land on the same path, and a directory listing is enough to rebuild the set
//! of finished slots after a restart.

use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::trial::TrialResult;
use crate::{atomic_write_bytes, ensure_dir};

const ARTIFACT_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        ContentHash(hex::encode(Sha256::digest(bytes)))
    }

    pub fn parse(s: &str) -> Option<Self> {
        let well_formed = s.len() == 64
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| ContentHash(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    // Round-trip through `Value` so every map, including flattened ones, is
    // re-emitted in key order.
    let value = serde_json::to_value(value)?;
    let mut out = Vec::new();
    let mut ser = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut ser)?;
    Ok(out)
}

pub fn compute_hash(result: &TrialResult) -> Result<ContentHash, StoreError> {
    Ok(ContentHash::of_bytes(&canonical_json_bytes(result)?))
}

pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        ensure_dir(dir).map_err(|e| StoreError::io(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hash.as_str(), ARTIFACT_EXTENSION))
    }

    pub fn persist(&self, result: &TrialResult, hash: &ContentHash) -> Result<PathBuf, StoreError> {
        let bytes = canonical_json_bytes(result)?;
        let path = self.path_for(hash);
        atomic_write_bytes(&path, &bytes).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }

    pub fn discard(&self, hash: &ContentHash) -> Result<(), StoreError> {
        let path = self.path_for(hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.path_for(hash).is_file()
    }

    /// Lists valid artifacts already in the directory, in file-name order.
    ///
    /// A file counts only if it is named `<hash>.json` and its bytes still
    /// hash to that name; anything else is skipped with a warning.
    pub fn scan(&self) -> Result<Vec<ContentHash>, StoreError> {
        let mut found = Vec::new();
        let walker = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.dir).to_path_buf();
                StoreError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|s| s.to_str()) != Some(ARTIFACT_EXTENSION)
            {
                continue;
            }
            let Some(named) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(ContentHash::parse)
            else {
                debug!(path = %path.display(), "ignoring file not named by content hash");
                continue;
            };
            let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
            if ContentHash::of_bytes(&bytes) != named {
                warn!(path = %path.display(), "ignoring artifact whose content does not match its name");
                continue;
            }
            found.push(named);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::Stats;
    use chrono::Utc;
    use serde_json::json;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tower_store_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn result(blocks: u64) -> TrialResult {
        TrialResult {
            structure: json!({ "blocks": blocks, "base": [2, 2] }),
            stats: Stats::new(0.0, 0.125),
            trace: json!({ "0": { "position": [0.0, 1.5, 0.25] } }),
        }
    }

    #[test]
    fn equal_results_hash_equal_and_different_results_differ() {
        let a = compute_hash(&result(1)).expect("hash");
        let b = compute_hash(&result(1)).expect("hash");
        let c = compute_hash(&result(2)).expect("hash");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn canonical_form_sorts_keys_and_indents_four_spaces() {
        let mut r = result(3);
        r.stats.extra.insert("alpha".to_string(), json!(1));
        let text = String::from_utf8(canonical_json_bytes(&r).expect("bytes")).expect("utf8");
        let alpha = text.find("\"alpha\"").expect("alpha");
        let instability = text.find("\"instability\"").expect("instability");
        assert!(alpha < instability, "keys must be sorted:\n{}", text);
        assert!(text.find("\"stats\"") < text.find("\"struct\""));
        assert!(text.contains("\n    \"stats\""));
    }

    #[test]
    fn hash_survives_a_parse_and_reserialize() {
        let original = result(4);
        let bytes = canonical_json_bytes(&original).expect("bytes");
        let parsed: TrialResult = serde_json::from_slice(&bytes).expect("parse");
        assert_eq!(compute_hash(&parsed).expect("hash"), ContentHash::of_bytes(&bytes));
    }

    #[test]
    fn parse_rejects_malformed_hashes() {
        let good = ContentHash::of_bytes(b"tower");
        assert_eq!(ContentHash::parse(good.as_str()), Some(good.clone()));
        assert!(ContentHash::parse("abc").is_none());
        assert!(ContentHash::parse(&good.as_str().to_uppercase()).is_none());
    }

    #[test]
    fn persist_then_scan_finds_artifacts() {
        let dir = temp_dir("scan");
        let store = ResultStore::open(&dir).expect("open");
        let mut expected = Vec::new();
        for n in 0..3 {
            let r = result(n);
            let hash = compute_hash(&r).expect("hash");
            let path = store.persist(&r, &hash).expect("persist");
            assert_eq!(path, dir.join(format!("{}.json", hash)));
            expected.push(hash);
        }
        expected.sort();
        assert_eq!(store.scan().expect("scan"), expected);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn scan_skips_foreign_and_tampered_files() {
        let dir = temp_dir("tamper");
        let store = ResultStore::open(&dir).expect("open");
        let r = result(7);
        let hash = compute_hash(&r).expect("hash");
        store.persist(&r, &hash).expect("persist");

        fs::write(dir.join("notes.json"), b"{}").expect("foreign");
        fs::write(dir.join("readme.txt"), b"hello").expect("text");
        let forged = ContentHash::of_bytes(b"something else");
        fs::write(store.path_for(&forged), b"{\"tampered\": true}").expect("forged");
        ensure_dir(&dir.join("renders")).expect("subdir");

        assert_eq!(store.scan().expect("scan"), vec![hash]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn discard_removes_and_tolerates_missing() {
        let dir = temp_dir("discard");
        let store = ResultStore::open(&dir).expect("open");
        let r = result(9);
        let hash = compute_hash(&r).expect("hash");
        store.persist(&r, &hash).expect("persist");
        assert!(store.contains(&hash));
        store.discard(&hash).expect("discard");
        assert!(!store.contains(&hash));
        store.discard(&hash).expect("second discard is a no-op");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn persist_reports_io_failure() {
        let dir = temp_dir("blocked");
        let store = ResultStore::open(&dir).expect("open");
        let r = result(11);
        let hash = compute_hash(&r).expect("hash");
        ensure_dir(&store.path_for(&hash)).expect("directory in the way");
        match store.persist(&r, &hash) {
            Err(StoreError::Io { path, .. }) => assert_eq!(path, store.path_for(&hash)),
            other => panic!("expected io failure, got {:?}", other.map(|_| ())),
        }
        let _ = fs::remove_dir_all(dir);
    }
}
