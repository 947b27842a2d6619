//! On-disk project slots.
//!
//! ```text
//! storage_dir/
//!   default/            bundled bootstrap project, never touched by clients
//!   current/            replaced wholesale by `update`
//!   .staging-<uuid>/    extraction target, renamed into place
//!   .retired-<uuid>/    previous `current` while a non-exchange swap runs
//! ```
//!
//! `current` is always either absent/empty or a complete, validated project.

use std::{
    collections::HashSet,
    fs,
    io::{self, Cursor, Read},
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
};

use botlink_ipc::ErrorCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::config::StoreLimits;

pub const DEFAULT_ENTRY: &str = "main.rhai";
pub const MANIFEST: &str = "project.toml";

const ALLOWED_EXTENSIONS: &[&str] = &[
    "rhai", "txt", "md", "json", "toml", "yaml", "yml", "ini", "cfg", "csv",
];

const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// Bundled into the binary so a fresh deploy always has something to run.
pub const BUNDLED_DEFAULT_ENTRY: &str =
    include_str!("../assets/default_project/main.rhai");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid project: {0}")]
    InvalidProject(String),
    #[error("archive rejected, {} problem(s): {}", .0.len(), .0.join("; "))]
    SecurityViolation(Vec<String>),
    #[error("storage error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::InvalidProject(_) => ErrorCode::InvalidProject,
            StoreError::SecurityViolation(_) => ErrorCode::SecurityViolation,
            StoreError::Io { .. } => ErrorCode::UploadFailed,
        }
    }
}

trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T, StoreError>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    project: ManifestProject,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestProject {
    name: Option<String>,
    entry: Option<String>,
}

/// A structurally valid project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    pub root: PathBuf,
    pub entry: PathBuf,
    pub name: Option<String>,
}

impl ProjectLayout {
    /// Check that `root` holds a project: the manifest (if any) parses and
    /// the entry file it names, or `main.rhai`, exists inside `root`.
    pub fn inspect(root: &Path) -> Result<Self, StoreError> {
        let manifest_path = root.join(MANIFEST);
        let manifest = if manifest_path.is_file() {
            let text = fs::read_to_string(&manifest_path).at(&manifest_path)?;
            toml::from_str::<Manifest>(&text).map_err(|e| {
                StoreError::InvalidProject(format!("bad {MANIFEST}: {e}"))
            })?
        } else {
            Manifest::default()
        };

        let entry_name = manifest
            .project
            .entry
            .unwrap_or_else(|| DEFAULT_ENTRY.to_string());
        let rel = Path::new(&entry_name);
        if !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::InvalidProject(format!(
                "entry {entry_name:?} must be a relative path inside the project"
            )));
        }
        let entry = root.join(rel);
        if !entry.is_file() {
            return Err(StoreError::InvalidProject(format!(
                "entry file {entry_name} not found"
            )));
        }

        Ok(Self {
            root: root.to_path_buf(),
            entry,
            name: manifest.project.name,
        })
    }
}

/// Extracted archive awaiting `replace_current`. Removed on drop unless it
/// was swapped into place.
#[derive(Debug)]
pub struct StagedProject {
    path: PathBuf,
    armed: bool,
}

impl StagedProject {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagedProject {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
    limits: StoreLimits,
}

impl ProjectStore {
    pub fn open(
        root: impl Into<PathBuf>,
        limits: StoreLimits,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).at(&root)?;
        info!("project store at {}", root.display());
        Ok(Self { root, limits })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_dir(&self) -> PathBuf {
        self.root.join("default")
    }

    pub fn current_dir(&self) -> PathBuf {
        self.root.join("current")
    }

    fn sibling(&self, prefix: &str) -> PathBuf {
        self.root.join(format!("{prefix}{}", Uuid::new_v4().simple()))
    }

    pub fn current_is_empty(&self) -> bool {
        dir_is_empty(&self.current_dir())
    }

    pub fn current_layout(&self) -> Result<ProjectLayout, StoreError> {
        ProjectLayout::inspect(&self.current_dir())
    }

    /// Validate and unpack `archive` into a staging directory next to
    /// `current`. Nothing outside the staging directory is touched.
    pub fn extract(&self, archive: &[u8]) -> Result<StagedProject, StoreError> {
        let limits = &self.limits;
        if archive.len() as u64 > limits.max_archive_bytes {
            return Err(StoreError::InvalidProject(format!(
                "archive is {} bytes, limit is {}",
                archive.len(),
                limits.max_archive_bytes
            )));
        }

        let mut zip = ZipArchive::new(Cursor::new(archive)).map_err(|e| {
            StoreError::InvalidProject(format!("corrupt archive: {e}"))
        })?;

        let files = audit_entries(&mut zip, limits)?;

        let staged = StagedProject::new(self.sibling(STAGING_PREFIX));
        fs::create_dir(staged.path()).at(staged.path())?;

        let mut budget = limits.max_uncompressed_bytes;
        for (index, rel) in files {
            let mut entry = zip.by_index(index).map_err(|e| {
                StoreError::InvalidProject(format!("corrupt archive: {e}"))
            })?;
            let target = staged.path().join(&rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).at(parent)?;
            }

            // declared sizes are untrusted; cap what we actually write
            let mut out = fs::File::create(&target).at(&target)?;
            let written = io::copy(&mut (&mut entry).take(budget + 1), &mut out)
                .map_err(|e| {
                    StoreError::InvalidProject(format!(
                        "cannot unpack {}: {e}",
                        rel.display()
                    ))
                })?;
            if written > budget {
                return Err(StoreError::InvalidProject(format!(
                    "archive expands beyond {} bytes",
                    limits.max_uncompressed_bytes
                )));
            }
            budget -= written;

            if let Some(mode) = entry.unix_mode().map(|m| m & 0o777)
                && mode != 0
            {
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .at(&target)?;
            }
        }

        let staged = self.hoist_single_dir(staged)?;
        ProjectLayout::inspect(staged.path())?;
        debug!("staged project at {}", staged.path().display());
        Ok(staged)
    }

    /// Archives zipped from a parent directory contain one top-level folder;
    /// treat that folder as the project root.
    fn hoist_single_dir(
        &self,
        staged: StagedProject,
    ) -> Result<StagedProject, StoreError> {
        if ProjectLayout::inspect(staged.path()).is_ok() {
            return Ok(staged);
        }
        let children: Vec<_> = fs::read_dir(staged.path())
            .at(staged.path())?
            .collect::<io::Result<_>>()
            .at(staged.path())?;
        let [only] = children.as_slice() else {
            return Ok(staged);
        };
        if !only.file_type().at(&only.path())?.is_dir() {
            return Ok(staged);
        }
        let hoisted = StagedProject::new(self.sibling(STAGING_PREFIX));
        fs::rename(only.path(), hoisted.path()).at(hoisted.path())?;
        drop(staged);
        Ok(hoisted)
    }

    /// Swap `staged` into `current`. The previous tree is deleted only once
    /// the new one is in place.
    pub fn replace_current(
        &self,
        staged: StagedProject,
    ) -> Result<PathBuf, StoreError> {
        let current = self.current_dir();
        let staged_path = staged.disarm();

        if !current.exists() {
            fs::rename(&staged_path, &current).at(&current)?;
            info!("installed project at {}", current.display());
            return Ok(current);
        }

        #[cfg(target_os = "linux")]
        {
            use rustix::fs::{CWD, RenameFlags, renameat_with};
            match renameat_with(
                CWD,
                &staged_path,
                CWD,
                &current,
                RenameFlags::EXCHANGE,
            ) {
                Ok(()) => {
                    // staged_path now holds the old tree
                    remove_tree(&staged_path);
                    info!("swapped in new project at {}", current.display());
                    return Ok(current);
                }
                Err(e) => {
                    debug!("exchange rename unavailable ({e}), using two renames");
                }
            }
        }

        let retired = self.sibling(RETIRED_PREFIX);
        fs::rename(&current, &retired).at(&current)?;
        if let Err(source) = fs::rename(&staged_path, &current) {
            // put the old project back before reporting
            let _ = fs::rename(&retired, &current);
            remove_tree(&staged_path);
            return Err(StoreError::Io {
                path: current,
                source,
            });
        }
        remove_tree(&retired);
        info!("replaced project at {}", current.display());
        Ok(current)
    }

    /// Repair what an interrupted swap can leave behind.
    pub fn recover(&self) -> Result<(), StoreError> {
        let current = self.current_dir();
        let mut retired = Vec::new();
        for entry in fs::read_dir(&self.root).at(&self.root)? {
            let entry = entry.at(&self.root)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STAGING_PREFIX) {
                debug!("removing leftover {name}");
                remove_tree(&entry.path());
            } else if name.starts_with(RETIRED_PREFIX) {
                retired.push(entry.path());
            }
        }

        for path in retired {
            if current.exists() {
                remove_tree(&path);
            } else {
                warn!(
                    "restoring {} as current after an interrupted swap",
                    path.display()
                );
                fs::rename(&path, &current).at(&current)?;
            }
        }
        Ok(())
    }

    /// Write the bundled project into `default/` if it has nothing yet.
    pub fn ensure_default_seeded(&self) -> Result<bool, StoreError> {
        let default = self.default_dir();
        if !dir_is_empty(&default) {
            return Ok(false);
        }
        let staged = StagedProject::new(self.sibling(STAGING_PREFIX));
        fs::create_dir(staged.path()).at(staged.path())?;
        let entry = staged.path().join(DEFAULT_ENTRY);
        fs::write(&entry, BUNDLED_DEFAULT_ENTRY).at(&entry)?;

        if default.exists() {
            fs::remove_dir(&default).at(&default)?;
        }
        let staged_path = staged.disarm();
        fs::rename(&staged_path, &default).at(&default)?;
        info!("seeded default project at {}", default.display());
        Ok(true)
    }

    /// Copy `default/` into an empty `current/`. Returns whether it did.
    pub fn bootstrap_current(&self) -> Result<bool, StoreError> {
        if !self.current_is_empty() {
            return Ok(false);
        }
        let default = self.default_dir();
        ProjectLayout::inspect(&default)?;

        let staged = StagedProject::new(self.sibling(STAGING_PREFIX));
        copy_tree(&default, staged.path())?;
        if self.current_dir().exists() {
            // empty directory left by an operator
            fs::remove_dir(self.current_dir()).at(&self.current_dir())?;
        }
        self.replace_current(staged)?;
        info!("bootstrapped current project from default");
        Ok(true)
    }

    /// Operator "restore to default": the next start bootstraps again.
    pub fn clear_current(&self) -> Result<(), StoreError> {
        let current = self.current_dir();
        if current.exists() {
            fs::remove_dir_all(&current).at(&current)?;
            info!("cleared current project");
        }
        Ok(())
    }
}

/// Validate every entry before anything is written. Returns the file
/// entries to extract as `(index, relative path)`.
fn audit_entries(
    zip: &mut ZipArchive<Cursor<&[u8]>>,
    limits: &StoreLimits,
) -> Result<Vec<(usize, PathBuf)>, StoreError> {
    let allowed: HashSet<&str> = ALLOWED_EXTENSIONS.iter().copied().collect();
    let mut violations = Vec::new();
    let mut files = Vec::new();
    let mut total: u64 = 0;

    for index in 0..zip.len() {
        let entry = zip.by_index_raw(index).map_err(|e| {
            StoreError::InvalidProject(format!("corrupt archive: {e}"))
        })?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        total = total.saturating_add(entry.size());

        if let Some(problem) = unsafe_path_reason(&name) {
            violations.push(format!("{name}: {problem}"));
            continue;
        }
        let Some(rel) = entry.enclosed_name() else {
            violations.push(format!("{name}: path escapes the project"));
            continue;
        };
        if let Some(ext) = rel.extension() {
            let ext = ext.to_string_lossy().to_lowercase();
            if !allowed.contains(ext.as_str()) {
                violations.push(format!("{name}: file type .{ext} not allowed"));
                continue;
            }
        }
        let compressed = entry.compressed_size();
        if compressed > 0 && entry.size() / compressed > limits.max_compression_ratio
        {
            violations.push(format!(
                "{name}: compression ratio {}:1 is suspicious",
                entry.size() / compressed
            ));
            continue;
        }
        files.push((index, rel));
    }

    if files.len() + violations.len() > limits.max_files {
        return Err(StoreError::InvalidProject(format!(
            "archive holds {} files, limit is {}",
            files.len() + violations.len(),
            limits.max_files
        )));
    }
    if total > limits.max_uncompressed_bytes {
        return Err(StoreError::InvalidProject(format!(
            "archive expands to {total} bytes, limit is {}",
            limits.max_uncompressed_bytes
        )));
    }
    if !violations.is_empty() {
        return Err(StoreError::SecurityViolation(violations));
    }
    Ok(files)
}

fn unsafe_path_reason(name: &str) -> Option<&'static str> {
    if name.starts_with('/') || name.starts_with('\\') {
        return Some("absolute path");
    }
    if name.contains("..") {
        return Some("parent directory reference");
    }
    if name.contains('$') {
        return Some("variable expansion character");
    }
    if name.split(['/', '\\']).any(|part| part.starts_with('~')) {
        return Some("home directory reference");
    }
    None
}

fn dir_is_empty(path: &Path) -> bool {
    fs::read_dir(path).map_or(true, |mut d| d.next().is_none())
}

fn remove_tree(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        warn!("could not remove {}: {e}", path.display());
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), StoreError> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| StoreError::Io {
            path: from.to_path_buf(),
            source: e.into(),
        })?;
        let rel = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).at(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).at(&target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use zip::{ZipWriter, write::SimpleFileOptions};

    use super::*;

    /// Build an in-memory zip from `(name, contents, mode)`.
    pub(crate) fn zip_bytes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents, mode) in entries {
            let opts = SimpleFileOptions::default().unix_permissions(*mode);
            zip.start_file(*name, opts).unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn store() -> (tempfile::TempDir, ProjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ProjectStore::open(dir.path().join("projects"), StoreLimits::default())
                .unwrap();
        (dir, store)
    }

    fn leftovers(store: &ProjectStore) -> Vec<String> {
        fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with('.'))
            .collect()
    }

    #[test]
    fn extract_and_replace_installs_project() {
        let (_dir, store) = store();
        let archive = zip_bytes(&[
            ("main.rhai", b"let robot = #{ hi: || 1 };", 0o644),
            ("tool.rhai", b"fn go() { 1 }", 0o755),
        ]);

        let staged = store.extract(&archive).unwrap();
        let current = store.replace_current(staged).unwrap();

        assert!(current.join("main.rhai").is_file());
        let mode = fs::metadata(current.join("tool.rhai"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(leftovers(&store).is_empty());
    }

    #[test]
    fn replace_swaps_out_previous_project() {
        let (_dir, store) = store();
        let first = zip_bytes(&[("main.rhai", b"// one", 0o644)]);
        let second = zip_bytes(&[("main.rhai", b"// two", 0o644)]);

        store.replace_current(store.extract(&first).unwrap()).unwrap();
        store.replace_current(store.extract(&second).unwrap()).unwrap();

        let text = fs::read_to_string(store.current_dir().join("main.rhai")).unwrap();
        assert_eq!(text, "// two");
        assert!(leftovers(&store).is_empty());
    }

    #[test]
    fn traversal_is_rejected_and_current_untouched() {
        let (_dir, store) = store();
        store.ensure_default_seeded().unwrap();
        store.bootstrap_current().unwrap();
        let before = fs::read(store.current_dir().join(DEFAULT_ENTRY)).unwrap();

        let archive = zip_bytes(&[
            ("main.rhai", b"// fine", 0o644),
            ("../escape.rhai", b"// evil", 0o644),
            ("~/.bashrc.txt", b"evil", 0o644),
            ("run.sh", b"#!/bin/sh", 0o755),
        ]);
        let err = store.extract(&archive).unwrap_err();
        let StoreError::SecurityViolation(problems) = &err else {
            panic!("expected a security violation, got {err:?}");
        };
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert_eq!(err.code(), ErrorCode::SecurityViolation);

        assert_eq!(
            fs::read(store.current_dir().join(DEFAULT_ENTRY)).unwrap(),
            before
        );
        assert!(!store.root().join("escape.rhai").exists());
        assert!(leftovers(&store).is_empty());
    }

    #[test]
    fn corrupt_archive_is_invalid_project() {
        let (_dir, store) = store();
        let err = store.extract(b"PK\x03\x04 definitely not a zip").unwrap_err();
        assert!(matches!(err, StoreError::InvalidProject(_)), "{err:?}");
        assert_eq!(err.code(), ErrorCode::InvalidProject);
    }

    #[test]
    fn limits_are_enforced() {
        let (_dir, store) = store();
        let many: Vec<(String, Vec<u8>)> = (0..11)
            .map(|i| (format!("f{i}.txt"), b"x".to_vec()))
            .collect();
        let entries: Vec<(&str, &[u8], u32)> = many
            .iter()
            .map(|(n, c)| (n.as_str(), c.as_slice(), 0o644))
            .collect();
        let err = store.extract(&zip_bytes(&entries)).unwrap_err();
        assert!(err.to_string().contains("limit is 10"), "{err}");

        let zeros = vec![0u8; 1024 * 1024];
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        zip.start_file("main.rhai", opts).unwrap();
        zip.write_all(&zeros).unwrap();
        let bomb = zip.finish().unwrap().into_inner();
        let err = store.extract(&bomb).unwrap_err();
        assert!(matches!(err, StoreError::SecurityViolation(_)), "{err:?}");
    }

    #[test]
    fn missing_entry_is_invalid_project() {
        let (_dir, store) = store();
        let archive = zip_bytes(&[("README.md", b"# nothing here", 0o644)]);
        let err = store.extract(&archive).unwrap_err();
        assert!(matches!(err, StoreError::InvalidProject(_)), "{err:?}");
        assert!(leftovers(&store).is_empty());
    }

    #[test]
    fn single_top_level_dir_is_hoisted() {
        let (_dir, store) = store();
        let archive = zip_bytes(&[
            ("demo/main.rhai", b"// hoisted", 0o644),
            ("demo/lib/util.rhai", b"fn f() {}", 0o644),
        ]);
        let current = store.replace_current(store.extract(&archive).unwrap()).unwrap();
        assert!(current.join("main.rhai").is_file());
        assert!(current.join("lib/util.rhai").is_file());
    }

    #[test]
    fn manifest_names_the_entry() {
        let (_dir, store) = store();
        let archive = zip_bytes(&[
            ("project.toml", b"[project]\nname = \"arm\"\nentry = \"app.rhai\"\n", 0o644),
            ("app.rhai", b"// app", 0o644),
        ]);
        store.replace_current(store.extract(&archive).unwrap()).unwrap();
        let layout = store.current_layout().unwrap();
        assert_eq!(layout.name.as_deref(), Some("arm"));
        assert!(layout.entry.ends_with("app.rhai"));

        let escaping = zip_bytes(&[
            ("project.toml", b"[project]\nentry = \"/etc/passwd\"\n", 0o644),
            ("main.rhai", b"// app", 0o644),
        ]);
        assert!(store.extract(&escaping).is_err());
    }

    #[test]
    fn bootstrap_and_clear_never_touch_default() {
        let (_dir, store) = store();
        assert!(store.ensure_default_seeded().unwrap());
        assert!(!store.ensure_default_seeded().unwrap());
        let default_entry = store.default_dir().join(DEFAULT_ENTRY);
        let pristine = fs::read(&default_entry).unwrap();

        assert!(store.bootstrap_current().unwrap());
        assert!(!store.bootstrap_current().unwrap());

        let upload = zip_bytes(&[("main.rhai", b"// uploaded", 0o644)]);
        store.replace_current(store.extract(&upload).unwrap()).unwrap();
        store.clear_current().unwrap();
        assert!(store.current_is_empty());

        assert!(store.bootstrap_current().unwrap());
        assert_eq!(fs::read(store.current_dir().join(DEFAULT_ENTRY)).unwrap(), pristine);
        assert_eq!(fs::read(&default_entry).unwrap(), pristine);
    }

    #[test]
    fn recover_restores_interrupted_swap() {
        let (_dir, store) = store();
        store.ensure_default_seeded().unwrap();
        store.bootstrap_current().unwrap();

        // crash between the two renames of a fallback swap
        let retired = store.root().join(format!("{RETIRED_PREFIX}abc"));
        fs::rename(store.current_dir(), &retired).unwrap();
        fs::create_dir(store.root().join(format!("{STAGING_PREFIX}xyz"))).unwrap();

        store.recover().unwrap();
        assert!(store.current_dir().join(DEFAULT_ENTRY).is_file());
        assert!(leftovers(&store).is_empty());
    }
}
