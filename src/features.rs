//! Feature-file store: append-only outputs from scanners.
//!
//! Scanners record `(position, feature)` pairs into named feature files.
//! The store serializes writes per feature file, keeps per-name counts, and
//! can dump name/count statistics into the run report. Formats beyond the
//! tab-separated append contract are the consumers' concern.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use ahash::AHashMap;

use crate::pos0::Pos0;
use crate::report::ReportSink;

enum RecorderOut {
    Memory(Vec<u8>),
    File(BufWriter<File>),
}

struct Recorder {
    out: RecorderOut,
    count: u64,
}

struct StoreInner {
    dir: Option<PathBuf>,
    files: AHashMap<String, Recorder>,
}

/// Append-only store of named feature files.
pub struct FeatureStore {
    inner: Mutex<StoreInner>,
}

impl FeatureStore {
    /// Store keeping every feature file in memory (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                dir: None,
                files: AHashMap::new(),
            }),
        }
    }

    /// Store writing `<name>.txt` files under `dir`.
    pub fn at_dir(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: Mutex::new(StoreInner {
                dir: Some(dir),
                files: AHashMap::new(),
            }),
        })
    }

    /// Append one feature line: `pos0 \t feature \n`, with tab, newline,
    /// backslash, and non-printable feature bytes escaped as `\xNN`.
    pub fn record(&self, name: &str, pos0: &Pos0, feature: &[u8]) {
        let mut line = Vec::with_capacity(feature.len() + 24);
        line.extend_from_slice(pos0.to_string().as_bytes());
        line.push(b'\t');
        for &b in feature {
            match b {
                b'\\' => line.extend_from_slice(b"\\\\"),
                b'\t' => line.extend_from_slice(b"\\t"),
                b'\n' => line.extend_from_slice(b"\\n"),
                b'\r' => line.extend_from_slice(b"\\r"),
                0x20..=0x7e => line.push(b),
                other => {
                    line.extend_from_slice(format!("\\x{other:02X}").as_bytes());
                }
            }
        }
        line.push(b'\n');

        let mut g = self.inner.lock().expect("feature store mutex poisoned");
        if !g.files.contains_key(name) {
            let out = match &g.dir {
                None => RecorderOut::Memory(Vec::new()),
                Some(dir) => {
                    let path = dir.join(format!("{name}.txt"));
                    match File::create(&path) {
                        Ok(f) => RecorderOut::File(BufWriter::new(f)),
                        Err(e) => {
                            eprintln!("cannot create feature file {}: {e}", path.display());
                            RecorderOut::Memory(Vec::new())
                        }
                    }
                }
            };
            g.files.insert(name.to_string(), Recorder { out, count: 0 });
        }
        let recorder = g.files.get_mut(name).expect("feature recorder just inserted");

        recorder.count += 1;
        match &mut recorder.out {
            RecorderOut::Memory(buf) => buf.extend_from_slice(&line),
            RecorderOut::File(w) => {
                if let Err(e) = w.write_all(&line) {
                    eprintln!("feature file {name} write failed: {e}");
                }
            }
        }
    }

    /// Number of features recorded under `name`.
    pub fn count(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .expect("feature store mutex poisoned")
            .files
            .get(name)
            .map_or(0, |r| r.count)
    }

    /// Snapshot of an in-memory feature file's contents.
    pub fn memory_contents(&self, name: &str) -> Option<Vec<u8>> {
        let g = self.inner.lock().expect("feature store mutex poisoned");
        match g.files.get(name).map(|r| &r.out) {
            Some(RecorderOut::Memory(buf)) => Some(buf.clone()),
            _ => None,
        }
    }

    /// Emit `<feature_files>` statistics into the report.
    pub fn dump_stats(&self, report: &dyn ReportSink) {
        let mut names: Vec<(String, u64)> = {
            let g = self.inner.lock().expect("feature store mutex poisoned");
            g.files.iter().map(|(n, r)| (n.clone(), r.count)).collect()
        };
        names.sort();

        report.push("feature_files", &[]);
        for (name, count) in names {
            report.xmlout("feature_file", &name, &[("count", &count.to_string())], true);
        }
        report.pop();
    }

    /// Flush file-backed recorders.
    pub fn flush(&self) {
        let mut g = self.inner.lock().expect("feature store mutex poisoned");
        for (name, recorder) in g.files.iter_mut() {
            if let RecorderOut::File(w) = &mut recorder.out {
                if let Err(e) = w.flush() {
                    eprintln!("feature file {name} flush failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::BufferReport;

    #[test]
    fn records_and_counts() {
        let store = FeatureStore::in_memory();
        store.record("email", &Pos0::at(100), b"alice@example.com");
        store.record("email", &Pos0::at(200).child("GZIP"), b"bob@example.com");
        store.record("url", &Pos0::at(300), b"http://example.com/");

        assert_eq!(store.count("email"), 2);
        assert_eq!(store.count("url"), 1);
        assert_eq!(store.count("none"), 0);

        let email = String::from_utf8(store.memory_contents("email").unwrap()).unwrap();
        assert!(email.contains("100\talice@example.com\n"));
        assert!(email.contains("200-GZIP-0\tbob@example.com\n"));
    }

    #[test]
    fn escapes_binary_features() {
        let store = FeatureStore::in_memory();
        store.record("bin", &Pos0::at(0), b"a\tb\nc\\d\x01");
        let got = String::from_utf8(store.memory_contents("bin").unwrap()).unwrap();
        assert_eq!(got, "0\ta\\tb\\nc\\\\d\\x01\n");
    }

    #[test]
    fn dump_stats_lists_sorted_names() {
        let store = FeatureStore::in_memory();
        store.record("url", &Pos0::at(0), b"u");
        store.record("email", &Pos0::at(0), b"e");
        store.record("email", &Pos0::at(4096), b"e2");

        let report = BufferReport::new();
        store.dump_stats(&report);
        let doc = report.contents();
        assert!(doc.contains("<feature_files>"));
        assert!(doc.contains("<feature_file count='2'>email</feature_file>"));
        assert!(doc.contains("<feature_file count='1'>url</feature_file>"));
        let email_at = doc.find("email").unwrap();
        let url_at = doc.find("url").unwrap();
        assert!(email_at < url_at);
    }

    #[test]
    fn dir_backed_store_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::at_dir(dir.path()).unwrap();
        store.record("email", &Pos0::at(7), b"x@y.z");
        store.flush();

        let contents = std::fs::read_to_string(dir.path().join("email.txt")).unwrap();
        assert_eq!(contents, "7\tx@y.z\n");
    }
}
