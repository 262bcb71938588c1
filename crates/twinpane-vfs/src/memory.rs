//! In-memory backend.
//!
//! Stands in for remote-style backends in tests and in the self-test suite:
//! every call can be slowed down with an injected latency, items can be
//! marked read-only or locked, and link support can be switched off to model
//! a destination that cannot represent reparse points.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};

use twinpane_core::{
    FileAttributes, FileBasicInfo, FsError, FsResult, ItemInfo, ItemKind, LinkInfo, LinkKind,
    OperationFlags, Timestamps,
};

use crate::fs::{
    DirectoryOperations, DirectoryReader, DirectoryWatch, FileIo, FileReader, FileSystem,
    FileWriter, ReparseLink, WriteOptions,
};
use crate::watch::{ChangeKind, WatchId, WatchRegistry, WatchSubscription};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

const TEMP_SUFFIX: &str = "twinpane-partial";

#[derive(Debug, Clone)]
enum Content {
    Bytes(Arc<Vec<u8>>),
    /// Generated on read; only the length is stored.
    Synthetic(u64),
}

impl Content {
    fn len(&self) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::Synthetic(len) => *len,
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let len = self.len();
        if offset >= len {
            return 0;
        }
        let n = buf.len().min((len - offset) as usize);
        match self {
            Self::Bytes(bytes) => {
                let start = offset as usize;
                buf[..n].copy_from_slice(&bytes[start..start + n]);
            }
            Self::Synthetic(_) => {
                for (i, byte) in buf[..n].iter_mut().enumerate() {
                    *byte = synthetic_byte(offset + i as u64);
                }
            }
        }
        n
    }
}

/// Byte at `offset` of a synthetic file.
pub fn synthetic_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

#[derive(Debug, Clone)]
enum Entry {
    File(Content),
    Directory,
    Link(LinkInfo),
}

#[derive(Debug, Clone)]
struct Node {
    entry: Entry,
    basic: FileBasicInfo,
    locked: bool,
}

impl Node {
    fn new(entry: Entry) -> Self {
        Self {
            entry,
            basic: FileBasicInfo {
                timestamps: Timestamps::with_modified(SystemTime::now()),
                attributes: FileAttributes::empty(),
            },
            locked: false,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.entry, Entry::Directory)
    }

    fn to_item(&self, path: &Path) -> ItemInfo {
        let (kind, size) = match &self.entry {
            Entry::File(content) => (ItemKind::File, content.len()),
            Entry::Directory => (ItemKind::Directory, 0),
            Entry::Link(link) => (ItemKind::Link(link.clone()), 0),
        };
        ItemInfo::new(path, kind, size, self.basic)
    }
}

type Tree = BTreeMap<PathBuf, Node>;

fn not_found(path: &Path) -> FsError {
    FsError::NotFound {
        path: path.to_path_buf(),
    }
}

/// Descendants of `dir`, in path order.
fn descendants<'a>(tree: &'a Tree, dir: &'a Path) -> impl Iterator<Item = (&'a PathBuf, &'a Node)> {
    tree.range::<Path, _>((Bound::Excluded(dir), Bound::Unbounded))
        .take_while(move |(p, _)| p.starts_with(dir))
}

fn require_parent_dir(tree: &Tree, path: &Path) -> FsResult<()> {
    let parent = path.parent().ok_or_else(|| not_found(path))?;
    match tree.get(parent) {
        Some(node) if node.is_dir() => Ok(()),
        _ => Err(not_found(parent)),
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    id: String,
    tree: RwLock<Tree>,
    latency: Duration,
    link_support: bool,
    recycle_bin: Mutex<Vec<PathBuf>>,
    watchers: WatchRegistry,
    temp_counter: AtomicU64,
}

impl Inner {
    fn pause(&self) {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
    }
}

/// A synthetic backend holding its whole tree in memory.
#[derive(Debug, Clone)]
pub struct InMemoryFileSystem {
    inner: Arc<Inner>,
}

impl InMemoryFileSystem {
    /// Create an empty backend containing only `/`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), Duration::ZERO, true)
    }

    fn build(name: String, latency: Duration, link_support: bool) -> Self {
        let id = format!("memory-{}", NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed));
        let mut tree = Tree::new();
        tree.insert(PathBuf::from("/"), Node::new(Entry::Directory));
        Self {
            inner: Arc::new(Inner {
                name,
                id,
                tree: RwLock::new(tree),
                latency,
                link_support,
                recycle_bin: Mutex::new(Vec::new()),
                watchers: WatchRegistry::new(),
                temp_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Delay every backend call (and every written chunk) by `latency`.
    /// Must be applied before the backend is shared.
    pub fn with_latency(self, latency: Duration) -> Self {
        let link_support = self.inner.link_support;
        self.rebuild(latency, link_support)
    }

    /// Toggle the [`ReparseLink`] capability.
    pub fn with_link_support(self, enabled: bool) -> Self {
        let latency = self.inner.latency;
        self.rebuild(latency, enabled)
    }

    fn rebuild(self, latency: Duration, link_support: bool) -> Self {
        let fresh = Self::build(self.inner.name.clone(), latency, link_support);
        *fresh.inner.tree.write() = self.inner.tree.read().clone();
        fresh
    }

    fn insert(&self, path: &Path, entry: Entry) -> FsResult<()> {
        self.ensure_dirs(path.parent().ok_or_else(|| not_found(path))?);
        self.inner
            .tree
            .write()
            .insert(path.to_path_buf(), Node::new(entry));
        self.inner.watchers.notify(path, ChangeKind::Added);
        Ok(())
    }

    fn ensure_dirs(&self, dir: &Path) {
        let mut tree = self.inner.tree.write();
        for ancestor in dir.ancestors().collect::<Vec<_>>().into_iter().rev() {
            tree.entry(ancestor.to_path_buf())
                .or_insert_with(|| Node::new(Entry::Directory));
        }
    }

    /// Create a directory and any missing ancestors.
    pub fn add_dir(&self, path: impl AsRef<Path>) -> FsResult<()> {
        self.ensure_dirs(path.as_ref());
        Ok(())
    }

    /// Create a file with the given bytes.
    pub fn add_file(&self, path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>) -> FsResult<()> {
        self.insert(
            path.as_ref(),
            Entry::File(Content::Bytes(Arc::new(bytes.into()))),
        )
    }

    /// Create a file of `size` generated bytes (see [`synthetic_byte`]).
    pub fn add_synthetic_file(&self, path: impl AsRef<Path>, size: u64) -> FsResult<()> {
        self.insert(path.as_ref(), Entry::File(Content::Synthetic(size)))
    }

    /// Create a link node, regardless of link support.
    pub fn add_link(
        &self,
        path: impl AsRef<Path>,
        kind: LinkKind,
        target: impl Into<PathBuf>,
    ) -> FsResult<()> {
        self.insert(
            path.as_ref(),
            Entry::Link(LinkInfo {
                kind,
                target: target.into(),
            }),
        )
    }

    fn update(&self, path: &Path, f: impl FnOnce(&mut Node)) -> FsResult<()> {
        let mut tree = self.inner.tree.write();
        let node = tree.get_mut(path).ok_or_else(|| not_found(path))?;
        f(node);
        drop(tree);
        self.inner.watchers.notify(path, ChangeKind::Modified);
        Ok(())
    }

    pub fn set_read_only(&self, path: impl AsRef<Path>, read_only: bool) -> FsResult<()> {
        self.update(path.as_ref(), |node| {
            node.basic
                .attributes
                .set(FileAttributes::READ_ONLY, read_only)
        })
    }

    /// Simulate another process holding the item open.
    pub fn set_locked(&self, path: impl AsRef<Path>, locked: bool) -> FsResult<()> {
        self.update(path.as_ref(), |node| node.locked = locked)
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.inner.tree.read().contains_key(path.as_ref())
    }

    /// Size of a file, `None` for anything else.
    pub fn file_size(&self, path: impl AsRef<Path>) -> Option<u64> {
        match &self.inner.tree.read().get(path.as_ref())?.entry {
            Entry::File(content) => Some(content.len()),
            _ => None,
        }
    }

    /// Full contents of a file.
    pub fn read_file(&self, path: impl AsRef<Path>) -> FsResult<Vec<u8>> {
        let path = path.as_ref();
        let content = match &self.inner.tree.read().get(path).ok_or_else(|| not_found(path))?.entry
        {
            Entry::File(content) => content.clone(),
            _ => {
                return Err(FsError::backend(path, "not a file"));
            }
        };
        let mut out = vec![0; content.len() as usize];
        content.read_at(0, &mut out);
        Ok(out)
    }

    /// Names of the entries in `dir`.
    pub fn list_names(&self, dir: impl AsRef<Path>) -> Vec<String> {
        let dir = dir.as_ref();
        let tree = self.inner.tree.read();
        descendants(&tree, dir)
            .filter(|(p, _)| p.parent() == Some(dir))
            .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect()
    }

    /// Items that were sent to the recycle bin, in deletion order.
    pub fn recycle_bin(&self) -> Vec<PathBuf> {
        self.inner.recycle_bin.lock().clone()
    }

    /// Whether `name` is an in-progress writer's temp file.
    pub fn is_temp_name(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
    }

    fn remove_subtree(tree: &mut Tree, path: &Path) {
        let doomed: Vec<PathBuf> = descendants(tree, path).map(|(p, _)| p.clone()).collect();
        for p in doomed {
            tree.remove(&p);
        }
        tree.remove(path);
    }
}

impl FileSystem for InMemoryFileSystem {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn id(&self) -> &str {
        &self.inner.id
    }

    fn reader(&self) -> Option<&dyn DirectoryReader> {
        Some(self)
    }

    fn io(&self) -> Option<&dyn FileIo> {
        Some(self)
    }

    fn operations(&self) -> Option<&dyn DirectoryOperations> {
        Some(self)
    }

    fn watch(&self) -> Option<&dyn DirectoryWatch> {
        Some(self)
    }

    fn links(&self) -> Option<&dyn ReparseLink> {
        if self.inner.link_support {
            Some(self)
        } else {
            None
        }
    }
}

impl DirectoryReader for InMemoryFileSystem {
    fn read_directory_info(&self, path: &Path) -> FsResult<Vec<ItemInfo>> {
        self.inner.pause();
        let tree = self.inner.tree.read();
        match tree.get(path) {
            Some(node) if node.is_dir() => {}
            Some(_) => return Err(FsError::backend(path, "not a directory")),
            None => return Err(not_found(path)),
        }
        Ok(descendants(&tree, path)
            .filter(|(p, _)| p.parent() == Some(path))
            .map(|(p, node)| node.to_item(p))
            .collect())
    }

    fn get_attributes(&self, path: &Path) -> FsResult<ItemInfo> {
        self.inner.pause();
        let tree = self.inner.tree.read();
        let node = tree.get(path).ok_or_else(|| not_found(path))?;
        Ok(node.to_item(path))
    }
}

struct MemoryFileReader {
    content: Content,
    offset: u64,
}

impl FileReader for MemoryFileReader {
    fn read_chunk(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let n = self.content.read_at(self.offset, buf);
        self.offset += n as u64;
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.content.len()
    }
}

struct MemoryFileWriter {
    fs: InMemoryFileSystem,
    target: PathBuf,
    temp: PathBuf,
    buffer: Vec<u8>,
    options: WriteOptions,
    finished: bool,
}

impl MemoryFileWriter {
    fn discard(&mut self) {
        self.finished = true;
        let removed = self.fs.inner.tree.write().remove(&self.temp).is_some();
        if removed {
            self.fs.inner.watchers.notify(&self.temp, ChangeKind::Removed);
        }
    }
}

fn check_target(tree: &Tree, path: &Path, options: WriteOptions) -> FsResult<()> {
    let Some(node) = tree.get(path) else {
        return Ok(());
    };
    if !options.overwrite {
        return Err(FsError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    // A file never replaces a directory, even with overwrite on.
    if node.is_dir() {
        return Err(FsError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    if node.locked {
        return Err(FsError::SharingViolation {
            path: path.to_path_buf(),
        });
    }
    if node.basic.is_read_only() && !options.replace_read_only {
        return Err(FsError::ReadOnly {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

impl FileWriter for MemoryFileWriter {
    fn write_chunk(&mut self, data: &[u8]) -> FsResult<()> {
        self.fs.inner.pause();
        self.buffer.extend_from_slice(data);
        let mut tree = self.fs.inner.tree.write();
        let node = tree.get_mut(&self.temp).ok_or_else(|| not_found(&self.temp))?;
        node.entry = Entry::File(Content::Synthetic(self.buffer.len() as u64));
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> FsResult<()> {
        let mut tree = self.fs.inner.tree.write();
        if let Err(err) = check_target(&tree, &self.target, self.options) {
            drop(tree);
            self.discard();
            return Err(err);
        }
        tree.remove(&self.temp);
        let content = Content::Bytes(Arc::new(std::mem::take(&mut self.buffer)));
        tree.insert(self.target.clone(), Node::new(Entry::File(content)));
        drop(tree);

        self.finished = true;
        self.fs.inner.watchers.notify(&self.temp, ChangeKind::Removed);
        self.fs.inner.watchers.notify(&self.target, ChangeKind::Added);
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.discard();
    }
}

impl Drop for MemoryFileWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}

impl FileIo for InMemoryFileSystem {
    fn create_file_reader(&self, path: &Path) -> FsResult<Box<dyn FileReader>> {
        self.inner.pause();
        let tree = self.inner.tree.read();
        match &tree.get(path).ok_or_else(|| not_found(path))?.entry {
            Entry::File(content) => Ok(Box::new(MemoryFileReader {
                content: content.clone(),
                offset: 0,
            })),
            _ => Err(FsError::backend(path, "not a file")),
        }
    }

    fn create_file_writer(
        &self,
        path: &Path,
        options: WriteOptions,
    ) -> FsResult<Box<dyn FileWriter>> {
        self.inner.pause();
        let n = self.inner.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = path.with_file_name(format!(".{name}.{n}.{TEMP_SUFFIX}"));

        let mut tree = self.inner.tree.write();
        require_parent_dir(&tree, path)?;
        check_target(&tree, path, options)?;
        tree.insert(temp.clone(), Node::new(Entry::File(Content::Synthetic(0))));
        drop(tree);
        self.inner.watchers.notify(&temp, ChangeKind::Added);

        Ok(Box::new(MemoryFileWriter {
            fs: self.clone(),
            target: path.to_path_buf(),
            temp,
            buffer: Vec::new(),
            options,
            finished: false,
        }))
    }

    fn get_file_basic_information(&self, path: &Path) -> FsResult<FileBasicInfo> {
        let tree = self.inner.tree.read();
        Ok(tree.get(path).ok_or_else(|| not_found(path))?.basic)
    }

    fn set_file_basic_information(&self, path: &Path, info: &FileBasicInfo) -> FsResult<()> {
        let info = *info;
        self.update(path, |node| node.basic = info)
    }
}

impl DirectoryOperations for InMemoryFileSystem {
    fn create_directory(&self, path: &Path) -> FsResult<()> {
        self.inner.pause();
        let mut tree = self.inner.tree.write();
        require_parent_dir(&tree, path)?;
        if tree.contains_key(path) {
            return Err(FsError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        tree.insert(path.to_path_buf(), Node::new(Entry::Directory));
        drop(tree);
        self.inner.watchers.notify(path, ChangeKind::Added);
        Ok(())
    }

    fn delete_item(&self, path: &Path, flags: OperationFlags) -> FsResult<()> {
        self.inner.pause();
        let mut tree = self.inner.tree.write();
        let node = tree.get(path).ok_or_else(|| not_found(path))?;

        if node.locked {
            return Err(FsError::SharingViolation {
                path: path.to_path_buf(),
            });
        }
        let is_link = matches!(node.entry, Entry::Link(_));
        if !is_link
            && node.basic.is_read_only()
            && !flags.contains(OperationFlags::ALLOW_REPLACE_READONLY)
        {
            return Err(FsError::ReadOnly {
                path: path.to_path_buf(),
            });
        }

        if flags.contains(OperationFlags::USE_RECYCLE_BIN) {
            Self::remove_subtree(&mut tree, path);
            drop(tree);
            self.inner.recycle_bin.lock().push(path.to_path_buf());
            self.inner.watchers.notify(path, ChangeKind::Removed);
            return Ok(());
        }

        if node.is_dir()
            && !flags.contains(OperationFlags::RECURSIVE)
            && descendants(&tree, path).next().is_some()
        {
            return Err(FsError::DirectoryNotEmpty {
                path: path.to_path_buf(),
            });
        }

        Self::remove_subtree(&mut tree, path);
        drop(tree);
        self.inner.watchers.notify(path, ChangeKind::Removed);
        Ok(())
    }

    fn rename_item(&self, from: &Path, to: &Path, flags: OperationFlags) -> FsResult<()> {
        self.inner.pause();
        let mut tree = self.inner.tree.write();
        let node = tree.get(from).ok_or_else(|| not_found(from))?;
        if node.locked {
            return Err(FsError::SharingViolation {
                path: from.to_path_buf(),
            });
        }
        require_parent_dir(&tree, to)?;
        if tree.contains_key(to) {
            if !flags.contains(OperationFlags::ALLOW_OVERWRITE) {
                return Err(FsError::AlreadyExists {
                    path: to.to_path_buf(),
                });
            }
            Self::remove_subtree(&mut tree, to);
        }

        let moved: Vec<PathBuf> = std::iter::once(from.to_path_buf())
            .chain(descendants(&tree, from).map(|(p, _)| p.clone()))
            .collect();
        for old in moved {
            if let Some(node) = tree.remove(&old) {
                let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
                let new = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                tree.insert(new, node);
            }
        }
        drop(tree);

        self.inner.watchers.notify(from, ChangeKind::Removed);
        self.inner.watchers.notify(to, ChangeKind::Added);
        Ok(())
    }

    fn supports_recycle_bin(&self) -> bool {
        true
    }
}

impl DirectoryWatch for InMemoryFileSystem {
    fn watch_directory(&self, path: &Path, capacity: usize) -> FsResult<WatchSubscription> {
        let tree = self.inner.tree.read();
        match tree.get(path) {
            Some(node) if node.is_dir() => Ok(self.inner.watchers.watch(path, capacity)),
            Some(_) => Err(FsError::backend(path, "not a directory")),
            None => Err(not_found(path)),
        }
    }

    fn unwatch_directory(&self, id: WatchId) -> FsResult<()> {
        if self.inner.watchers.unwatch(id) {
            Ok(())
        } else {
            Err(FsError::backend("", format!("unknown watch {}", id.0)))
        }
    }
}

impl ReparseLink for InMemoryFileSystem {
    fn read_link(&self, path: &Path) -> FsResult<Option<LinkInfo>> {
        let tree = self.inner.tree.read();
        match &tree.get(path).ok_or_else(|| not_found(path))?.entry {
            Entry::Link(link) => Ok(Some(link.clone())),
            _ => Ok(None),
        }
    }

    fn create_link(&self, path: &Path, kind: LinkKind, target: &Path) -> FsResult<()> {
        let mut tree = self.inner.tree.write();
        require_parent_dir(&tree, path)?;
        if tree.contains_key(path) {
            return Err(FsError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        let link = LinkInfo {
            kind,
            target: target.to_path_buf(),
        };
        tree.insert(path.to_path_buf(), Node::new(Entry::Link(link)));
        drop(tree);
        self.inner.watchers.notify(path, ChangeKind::Added);
        Ok(())
    }
}
