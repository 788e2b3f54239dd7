//! In-memory backend with an operation log.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use treemirror_core::{DirEntry, FileAttributes, FileEntry, FileSystem, SyncError};

/// A mutation applied to a [`MemoryFs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOp {
    CreateDir(PathBuf),
    DeleteFile(PathBuf),
    DeleteDir(PathBuf),
    Copy { src: PathBuf, dst: PathBuf },
    SetAttributes(PathBuf, FileAttributes),
}

impl FsOp {
    /// The path that was mutated.
    pub fn path(&self) -> &Path {
        match self {
            Self::CreateDir(path)
            | Self::DeleteFile(path)
            | Self::DeleteDir(path)
            | Self::SetAttributes(path, _) => path,
            Self::Copy { dst, .. } => dst,
        }
    }
}

#[derive(Debug, Clone)]
struct MemFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
    attributes: FileAttributes,
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(MemFile),
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<PathBuf, Node>,
    ops: Vec<FsOp>,
    listed: Vec<PathBuf>,
    failures: HashSet<PathBuf>,
}

impl State {
    fn children(&self, dir: &Path) -> impl Iterator<Item = (&PathBuf, &Node)> {
        self.nodes
            .range(dir.to_path_buf()..)
            .take_while(move |(path, _)| path.starts_with(dir))
            .filter(move |(path, _)| path.parent() == Some(dir))
    }

    fn require_dir(&self, path: &Path) -> Result<(), SyncError> {
        match self.nodes.get(path) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(io_error(path, io::ErrorKind::NotADirectory)),
            None => Err(io_error(path, io::ErrorKind::NotFound)),
        }
    }

    fn file(&self, path: &Path) -> Result<&MemFile, SyncError> {
        match self.nodes.get(path) {
            Some(Node::File(file)) => Ok(file),
            Some(Node::Dir) => Err(io_error(path, io::ErrorKind::IsADirectory)),
            None => Err(io_error(path, io::ErrorKind::NotFound)),
        }
    }

    fn check_fault(&self, path: &Path) -> Result<(), SyncError> {
        if self.failures.contains(path) {
            return Err(SyncError::io(path, io::Error::other("injected failure")));
        }
        Ok(())
    }

    fn insert_parents(&mut self, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            self.nodes.entry(ancestor.to_path_buf()).or_insert(Node::Dir);
        }
    }
}

fn io_error(path: &Path, kind: io::ErrorKind) -> SyncError {
    SyncError::io(path, io::Error::from(kind))
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// [`FileSystem`] kept entirely in memory.
///
/// Paths are compared exactly (case-sensitive). Every successful mutation
/// is appended to an operation log and every listing is recorded, so
/// tests can assert on what a replication run touched and in which order.
#[derive(Debug, Default)]
pub struct MemoryFs {
    state: Mutex<State>,
}

impl MemoryFs {
    /// Create an empty filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a directory and all of its ancestors.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut state = self.lock();
        state.insert_parents(path);
        state.nodes.insert(path.to_path_buf(), Node::Dir);
    }

    /// Create or replace a file, creating missing ancestors.
    pub fn add_file(&self, path: impl AsRef<Path>, data: impl AsRef<[u8]>, modified: DateTime<Utc>) {
        self.add_file_with_attributes(path, data, modified, FileAttributes::NONE);
    }

    /// Create or replace a file with explicit attributes.
    pub fn add_file_with_attributes(
        &self,
        path: impl AsRef<Path>,
        data: impl AsRef<[u8]>,
        modified: DateTime<Utc>,
        attributes: FileAttributes,
    ) {
        let path = path.as_ref();
        let mut state = self.lock();
        state.insert_parents(path);
        state.nodes.insert(
            path.to_path_buf(),
            Node::File(MemFile {
                data: data.as_ref().to_vec(),
                modified,
                attributes,
            }),
        );
    }

    /// Make every mutation or listing of `path` fail.
    pub fn fail_on(&self, path: impl AsRef<Path>) {
        self.lock().failures.insert(path.as_ref().to_path_buf());
    }

    /// Check whether anything exists at `path`.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.lock().nodes.contains_key(path.as_ref())
    }

    /// Check whether `path` is a directory.
    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        matches!(self.lock().nodes.get(path.as_ref()), Some(Node::Dir))
    }

    /// Contents of the file at `path`.
    pub fn read(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        match self.lock().nodes.get(path.as_ref()) {
            Some(Node::File(file)) => Some(file.data.clone()),
            _ => None,
        }
    }

    /// Listing entry for the file at `path`.
    pub fn file_entry(&self, path: impl AsRef<Path>) -> Option<FileEntry> {
        let path = path.as_ref();
        match self.lock().nodes.get(path) {
            Some(Node::File(file)) => Some(FileEntry::new(
                name_of(path),
                path,
                file.data.len() as u64,
                file.modified,
                file.attributes,
            )),
            _ => None,
        }
    }

    /// Every entry below `root`, keyed by relative path. Directories map to `None`.
    pub fn snapshot(&self, root: impl AsRef<Path>) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
        let root = root.as_ref();
        self.lock()
            .nodes
            .iter()
            .filter(|(path, _)| path.as_path() != root)
            .filter_map(|(path, node)| {
                let rel = path.strip_prefix(root).ok()?.to_path_buf();
                let data = match node {
                    Node::Dir => None,
                    Node::File(file) => Some(file.data.clone()),
                };
                Some((rel, data))
            })
            .collect()
    }

    /// Mutations applied so far, in order.
    pub fn ops(&self) -> Vec<FsOp> {
        self.lock().ops.clone()
    }

    /// Forget the operation and listing logs.
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.ops.clear();
        state.listed.clear();
    }

    /// Directories listed so far, in order.
    pub fn listed(&self) -> Vec<PathBuf> {
        self.lock().listed.clone()
    }
}

impl FileSystem for MemoryFs {
    fn list_dirs(&self, path: &Path) -> Result<Vec<DirEntry>, SyncError> {
        let mut state = self.lock();
        state.check_fault(path)?;
        state.require_dir(path)?;
        state.listed.push(path.to_path_buf());

        Ok(state
            .children(path)
            .filter(|(_, node)| matches!(node, Node::Dir))
            .map(|(child, _)| DirEntry::new(name_of(child), child.clone()))
            .collect())
    }

    fn list_files(&self, path: &Path) -> Result<Vec<FileEntry>, SyncError> {
        let mut state = self.lock();
        state.check_fault(path)?;
        state.require_dir(path)?;
        state.listed.push(path.to_path_buf());

        Ok(state
            .children(path)
            .filter_map(|(child, node)| match node {
                Node::File(file) => Some(FileEntry::new(
                    name_of(child),
                    child.clone(),
                    file.data.len() as u64,
                    file.modified,
                    file.attributes,
                )),
                Node::Dir => None,
            })
            .collect())
    }

    fn create_dir(&self, path: &Path) -> Result<(), SyncError> {
        let mut state = self.lock();
        state.check_fault(path)?;
        match state.nodes.get(path) {
            Some(Node::Dir) => return Ok(()),
            Some(Node::File(_)) => return Err(io_error(path, io::ErrorKind::AlreadyExists)),
            None => {}
        }
        if let Some(parent) = path.parent() {
            state.require_dir(parent)?;
        }

        state.nodes.insert(path.to_path_buf(), Node::Dir);
        state.ops.push(FsOp::CreateDir(path.to_path_buf()));
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> Result<(), SyncError> {
        let mut state = self.lock();
        state.check_fault(path)?;
        state.file(path)?;

        state.nodes.remove(path);
        state.ops.push(FsOp::DeleteFile(path.to_path_buf()));
        Ok(())
    }

    fn delete_empty_dir(&self, path: &Path) -> Result<(), SyncError> {
        let mut state = self.lock();
        state.check_fault(path)?;
        state.require_dir(path)?;
        if state.children(path).next().is_some() {
            return Err(io_error(path, io::ErrorKind::DirectoryNotEmpty));
        }

        state.nodes.remove(path);
        state.ops.push(FsOp::DeleteDir(path.to_path_buf()));
        Ok(())
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> Result<u64, SyncError> {
        let mut state = self.lock();
        state.check_fault(src)?;
        state.check_fault(dst)?;
        let file = state.file(src)?.clone();
        if let Some(parent) = dst.parent() {
            state.require_dir(parent)?;
        }
        if matches!(state.nodes.get(dst), Some(Node::Dir)) {
            return Err(io_error(dst, io::ErrorKind::IsADirectory));
        }

        let len = file.data.len() as u64;
        state.nodes.insert(dst.to_path_buf(), Node::File(file));
        state.ops.push(FsOp::Copy {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
        Ok(len)
    }

    fn set_attributes(&self, path: &Path, attributes: FileAttributes) -> Result<(), SyncError> {
        let mut state = self.lock();
        state.check_fault(path)?;
        match state.nodes.get_mut(path) {
            Some(Node::File(file)) => file.attributes = attributes,
            Some(Node::Dir) => return Err(io_error(path, io::ErrorKind::IsADirectory)),
            None => return Err(io_error(path, io::ErrorKind::NotFound)),
        }

        state.ops.push(FsOp::SetAttributes(path.to_path_buf(), attributes));
        Ok(())
    }

    fn read_small_text(&self, path: &Path) -> Result<String, SyncError> {
        let state = self.lock();
        state.check_fault(path)?;
        let file = state.file(path)?;
        String::from_utf8(file.data.clone())
            .map_err(|e| SyncError::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}
