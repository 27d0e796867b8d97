//! Identity registry: enrolled faces, rebuilt wholesale from a directory of
//! reference images.
//!
//! Readers pin an `Arc<Registry>` snapshot for the lifetime of a request.
//! Writers build a complete replacement off to the side and publish it with a
//! single `ArcSwap` store, so no reader ever sees a partially loaded registry.
//! Writers are serialized among themselves by a mutex.

use crate::extractor::EmbeddingExtractor;
use crate::types::IdentityRecord;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Extensions considered reference images (case-insensitive).
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Extension given to newly registered reference images.
pub const REFERENCE_EXTENSION: &str = "jpg";

/// Longest accepted identity name, in bytes. Leaves room for the staging and
/// reference suffixes within a 255-byte file name.
pub const MAX_NAME_BYTES: usize = 128;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("cannot read reference directory {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid identity name {0:?}")]
    InvalidName(String),
    #[error("no face detected in reference image")]
    NoFaceDetected,
    #[error("unknown identity {0:?}")]
    NotFound(String),
}

/// Immutable snapshot of enrolled identities, in load order.
#[derive(Debug, Default)]
pub struct Registry {
    records: Vec<IdentityRecord>,
    by_name: HashMap<String, usize>,
}

impl Registry {
    /// Build a snapshot from records. A record whose name is already present
    /// replaces the earlier one in place.
    pub fn from_records(records: impl IntoIterator<Item = IdentityRecord>) -> Self {
        let mut registry = Self::default();
        for record in records {
            registry.insert(record);
        }
        registry
    }

    /// Load every reference image in `dir`.
    ///
    /// Files are visited in filename order. Files without a usable face are
    /// skipped with a warning. Only an unreadable directory is an error.
    ///
    /// Two files with the same stem (`alice.jpg`, `alice.png`) yield one
    /// identity: the later file in filename order wins.
    pub fn load(dir: &Path, extractor: &EmbeddingExtractor) -> Result<Self, RegistryError> {
        let entries = fs::read_dir(dir).map_err(|source| RegistryError::Unreadable {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => paths.push(entry.path()),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable entry")
                }
            }
        }
        paths.sort();

        let mut registry = Self::default();
        for path in paths {
            let Some(name) = reference_name(&path) else {
                continue;
            };
            if !path.is_file() {
                continue;
            }

            match extractor.extract_file(&path) {
                Some(embedding) => {
                    tracing::info!(name = %name, path = %path.display(), "face loaded");
                    registry.insert(IdentityRecord {
                        name,
                        embedding,
                        source_path: path,
                    });
                }
                None => {
                    tracing::warn!(
                        path = %path.display(),
                        "no face detected in reference image, skipping"
                    );
                }
            }
        }

        tracing::info!(dir = %dir.display(), count = registry.len(), "registry loaded");
        Ok(registry)
    }

    fn insert(&mut self, record: IdentityRecord) {
        match self.by_name.get(&record.name) {
            Some(&idx) => {
                tracing::warn!(
                    name = %record.name,
                    replaced = %self.records[idx].source_path.display(),
                    by = %record.source_path.display(),
                    "duplicate identity name, later file wins"
                );
                self.records[idx] = record;
            }
            None => {
                self.by_name.insert(record.name.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[IdentityRecord] {
        &self.records
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&IdentityRecord> {
        self.by_name.get(name).map(|&idx| &self.records[idx])
    }
}

/// Identity name for a reference image path: the file stem, if the extension
/// is a recognized image extension.
fn reference_name(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Normalize a display name into an identity key: trimmed, with every
/// whitespace character replaced by `_`, at most [`MAX_NAME_BYTES`] long.
pub fn sanitize_name(raw: &str) -> Result<String, RegistryError> {
    let name: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();

    let invalid = name.is_empty()
        || name.len() > MAX_NAME_BYTES
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(RegistryError::InvalidName(raw.to_string()));
    }
    Ok(name)
}

/// Raw bytes of an enrolled reference image.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl ReferenceImage {
    /// MIME type sniffed from the content.
    pub fn content_type(&self) -> &'static str {
        image::guess_format(&self.bytes)
            .map(|f| f.to_mime_type())
            .unwrap_or("application/octet-stream")
    }
}

/// Owner of the reference directory and the currently published snapshot.
pub struct IdentityStore {
    dir: PathBuf,
    extractor: Arc<EmbeddingExtractor>,
    current: ArcSwap<Registry>,
    writer: Mutex<()>,
}

impl IdentityStore {
    /// Create the directory if needed and load the initial snapshot.
    pub fn open(
        dir: impl Into<PathBuf>,
        extractor: Arc<EmbeddingExtractor>,
    ) -> Result<Self, RegistryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RegistryError::Unreadable {
            path: dir.clone(),
            source,
        })?;

        let registry = Registry::load(&dir, &extractor)?;
        Ok(Self {
            dir,
            extractor,
            current: ArcSwap::from_pointee(registry),
            writer: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The currently published snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<Registry> {
        self.current.load_full()
    }

    /// Rebuild the registry from disk and publish it.
    pub fn reload(&self) -> Result<Arc<Registry>, RegistryError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.reload_locked()
    }

    fn reload_locked(&self) -> Result<Arc<Registry>, RegistryError> {
        let registry = Arc::new(Registry::load(&self.dir, &self.extractor)?);
        self.current.store(Arc::clone(&registry));
        Ok(registry)
    }

    /// Enroll `image` under the sanitized form of `raw_name`.
    ///
    /// The upload is staged in a hidden file and only moved to
    /// `<name>.jpg` once a face was found in it, so a rejected upload leaves
    /// the directory untouched. A successful registration replaces any
    /// existing reference image of the same name and republishes the registry.
    pub fn register(&self, raw_name: &str, image: &[u8]) -> Result<String, RegistryError> {
        let name = sanitize_name(raw_name)?;
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let staged = self.dir.join(format!(".{name}.upload"));
        fs::write(&staged, image).map_err(|source| RegistryError::Io {
            path: staged.clone(),
            source,
        })?;

        if self.extractor.extract_file(&staged).is_none() {
            if let Err(e) = fs::remove_file(&staged) {
                tracing::warn!(
                    path = %staged.display(),
                    error = %e,
                    "failed to remove rejected upload"
                );
            }
            tracing::info!(name = %name, "registration rejected: no face detected");
            return Err(RegistryError::NoFaceDetected);
        }

        let target = self.dir.join(format!("{name}.{REFERENCE_EXTENSION}"));
        fs::rename(&staged, &target).map_err(|source| RegistryError::Io {
            path: target.clone(),
            source,
        })?;
        self.remove_siblings(&name, &target);

        let registry = self.reload_locked()?;
        tracing::info!(name = %name, known = registry.len(), "face registered");
        Ok(name)
    }

    /// Remove other reference images with the same stem so the new file is
    /// the only one backing `name`.
    fn remove_siblings(&self, name: &str, keep: &Path) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for path in entries.filter_map(|e| e.ok().map(|e| e.path())) {
            if path == keep || reference_name(&path).as_deref() != Some(name) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "replaced reference image removed")
                }
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to remove replaced reference image"
                ),
            }
        }
    }

    /// Reference image of an enrolled identity in the current snapshot.
    pub fn reference_image(&self, name: &str) -> Result<ReferenceImage, RegistryError> {
        let snapshot = self.snapshot();
        let record = snapshot
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        match fs::read(&record.source_path) {
            Ok(bytes) => Ok(ReferenceImage {
                path: record.source_path.clone(),
                bytes,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(RegistryError::NotFound(name.to_string()))
            }
            Err(source) => Err(RegistryError::Io {
                path: record.source_path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{decide, MatchConfig};
    use crate::testing::{self, BrightRegionDetector, MeanColorEmbedder};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    const RED: [u8; 3] = [200, 0, 0];
    const GREEN: [u8; 3] = [0, 200, 0];
    const BLUE: [u8; 3] = [0, 0, 200];

    fn extractor() -> Arc<EmbeddingExtractor> {
        Arc::new(EmbeddingExtractor::new(
            Arc::new(BrightRegionDetector::default()),
            Arc::new(MeanColorEmbedder),
        ))
    }

    fn write_face(dir: &Path, file: &str, color: [u8; 3]) {
        fs::write(dir.join(file), testing::encode_png(&testing::face_image(color))).unwrap();
    }

    /// (file name → bytes) for everything in `dir`.
    fn dir_contents(dir: &Path) -> BTreeMap<String, Vec<u8>> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.file_name().to_string_lossy().into_owned(), fs::read(e.path()).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_load_skips_faceless_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "bob.png", GREEN);
        write_face(dir.path(), "alice.JPG", RED);
        let blank = testing::encode_png(&testing::blank_image());
        fs::write(dir.path().join("empty.jpg"), blank).unwrap();
        fs::write(dir.path().join("notes.txt"), b"not an image").unwrap();
        write_face(dir.path(), "carol.gif", BLUE);
        fs::create_dir(dir.path().join("nested.jpg")).unwrap();

        let registry = Registry::load(dir.path(), &extractor()).unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(registry.get("alice").unwrap().source_path, dir.path().join("alice.JPG"));
        assert!(registry.get("empty").is_none());
    }

    #[test]
    fn test_load_unreadable_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            Registry::load(&missing, &extractor()),
            Err(RegistryError::Unreadable { .. })
        ));
    }

    #[test]
    fn test_load_same_stem_later_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice.jpg", RED);
        write_face(dir.path(), "alice.png", GREEN);
        write_face(dir.path(), "bob.jpg", BLUE);

        let registry = Registry::load(dir.path(), &extractor()).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["alice", "bob"]);
        let alice = registry.get("alice").unwrap();
        assert_eq!(alice.source_path, dir.path().join("alice.png"));
        assert_eq!(alice.embedding.values, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice.jpg", RED);
        write_face(dir.path(), "bob.jpg", GREEN);
        let extractor = extractor();

        let pairs = |r: &Registry| -> Vec<(String, Vec<f32>)> {
            r.records().iter().map(|r| (r.name.clone(), r.embedding.values.clone())).collect()
        };

        let first = Registry::load(dir.path(), &extractor).unwrap();
        let second = Registry::load(dir.path(), &extractor).unwrap();
        assert_eq!(pairs(&first), pairs(&second));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("  Ada Lovelace ").unwrap(), "Ada_Lovelace");
        assert_eq!(sanitize_name("a\tb").unwrap(), "a_b");
        for bad in ["", "   ", "..", ".hidden", "a/b", "a\\b"] {
            assert!(
                matches!(sanitize_name(bad), Err(RegistryError::InvalidName(_))),
                "{bad:?}"
            );
        }

        let longest = "é".repeat(MAX_NAME_BYTES / 2);
        assert_eq!(sanitize_name(&longest).unwrap(), longest);
        assert!(matches!(
            sanitize_name(&"a".repeat(MAX_NAME_BYTES + 1)),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn test_register_publishes_new_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::open(dir.path(), extractor()).unwrap();
        let before = store.snapshot();
        assert!(before.is_empty());

        let image = testing::encode_png(&testing::face_image(RED));
        let name = store.register("  Ada Lovelace ", &image).unwrap();

        assert_eq!(name, "Ada_Lovelace");
        assert_eq!(fs::read(dir.path().join("Ada_Lovelace.jpg")).unwrap(), image);
        assert_eq!(store.snapshot().names().collect::<Vec<_>>(), vec!["Ada_Lovelace"]);
        // A snapshot pinned before the registration is unaffected.
        assert!(before.is_empty());
        // No staging leftovers.
        assert_eq!(dir_contents(dir.path()).len(), 1);
    }

    #[test]
    fn test_register_replaces_same_stem_reference() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice.png", RED);
        let store = IdentityStore::open(dir.path(), extractor()).unwrap();

        store
            .register("alice", &testing::encode_png(&testing::face_image(GREEN)))
            .unwrap();

        assert_eq!(dir_contents(dir.path()).keys().collect::<Vec<_>>(), vec!["alice.jpg"]);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("alice").unwrap().embedding.values, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_register_faceless_image_leaves_directory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice.jpg", RED);
        let store = IdentityStore::open(dir.path(), extractor()).unwrap();
        let before_files = dir_contents(dir.path());
        let before = store.snapshot();

        let blank = testing::encode_png(&testing::blank_image());
        assert!(matches!(store.register("bob", &blank), Err(RegistryError::NoFaceDetected)));
        // Same name as an enrolled identity: the existing reference survives.
        assert!(matches!(store.register("alice", &blank), Err(RegistryError::NoFaceDetected)));
        assert!(matches!(store.register("carol", b"garbage"), Err(RegistryError::NoFaceDetected)));

        assert_eq!(dir_contents(dir.path()), before_files);
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[test]
    fn test_register_invalid_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::open(dir.path(), extractor()).unwrap();
        let image = testing::encode_png(&testing::face_image(RED));
        assert!(matches!(
            store.register("../evil", &image),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            store.register(&"x".repeat(300), &image),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(dir_contents(dir.path()).is_empty());
    }

    #[test]
    fn test_registered_image_matches_itself() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = extractor();
        let store = IdentityStore::open(dir.path(), Arc::clone(&extractor)).unwrap();

        let faces = [("alice", RED), ("bob", GREEN), ("carol", BLUE)];
        for (name, color) in faces {
            store.register(name, &testing::encode_png(&testing::face_image(color))).unwrap();
        }

        let snapshot = store.snapshot();
        for (name, color) in faces {
            let query = extractor
                .extract_bytes(&testing::encode_png(&testing::face_image(color)))
                .unwrap()
                .unwrap();
            let decision = decide(&query, &snapshot, &MatchConfig::default());
            assert!(decision.authorized, "{name}");
            assert_eq!(decision.name.as_deref(), Some(name));
        }
    }

    #[test]
    fn test_reference_image_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice.png", RED);
        let store = IdentityStore::open(dir.path(), extractor()).unwrap();

        let image = store.reference_image("alice").unwrap();
        assert_eq!(image.bytes, fs::read(dir.path().join("alice.png")).unwrap());
        assert_eq!(image.content_type(), "image/png");

        assert!(matches!(store.reference_image("bob"), Err(RegistryError::NotFound(_))));
        assert!(matches!(store.reference_image("../alice"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_reload_is_never_observed_half_done() {
        let dir = tempfile::tempdir().unwrap();
        let colors = [
            [200, 0, 0], [0, 200, 0], [0, 0, 200],
            [200, 200, 0], [0, 200, 200], [200, 0, 200],
        ];
        for (i, color) in colors[..3].iter().enumerate() {
            write_face(dir.path(), &format!("old{i}.png"), *color);
        }
        let store = Arc::new(IdentityStore::open(dir.path(), extractor()).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while !done.load(Ordering::Acquire) {
                        let snapshot = store.snapshot();
                        let new = snapshot.names().filter(|n| n.starts_with("new")).count();
                        seen.push((snapshot.len(), new));
                    }
                    seen
                })
            })
            .collect();

        for (i, color) in colors[3..].iter().enumerate() {
            write_face(dir.path(), &format!("new{i}.png"), *color);
        }
        store.reload().unwrap();
        store.reload().unwrap();
        done.store(true, Ordering::Release);

        for reader in readers {
            for (len, new) in reader.join().unwrap() {
                assert!(
                    (len, new) == (3, 0) || (len, new) == (6, 3),
                    "saw {len} records, {new} new"
                );
            }
        }
        assert_eq!(store.snapshot().len(), 6);
    }
}
