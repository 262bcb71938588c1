//! Generic directory sizing over [`DirectoryReader`].

use std::path::{Path, PathBuf};

use twinpane_core::{FsError, FsResult, ItemKind, SizeTotals};

use crate::fs::DirectoryReader;

/// Entries between two progress callbacks.
pub const PROGRESS_INTERVAL: u64 = 256;

/// Cooperative stop and progress hooks for a sizing walk.
#[derive(Default, Clone, Copy)]
pub struct WalkControl<'a> {
    should_stop: Option<&'a (dyn Fn() -> bool + Sync)>,
    on_progress: Option<&'a (dyn Fn(&SizeTotals) + Sync)>,
}

impl<'a> WalkControl<'a> {
    /// A walk that is never stopped and reports nothing.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_stop(mut self, should_stop: &'a (dyn Fn() -> bool + Sync)) -> Self {
        self.should_stop = Some(should_stop);
        self
    }

    pub fn with_progress(mut self, on_progress: &'a (dyn Fn(&SizeTotals) + Sync)) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    /// Returns `Err(Cancelled)` once the stop hook fires.
    pub fn checkpoint(&self) -> FsResult<()> {
        match self.should_stop {
            Some(stop) if stop() => Err(FsError::Cancelled),
            _ => Ok(()),
        }
    }

    pub fn report(&self, totals: &SizeTotals) {
        if let Some(progress) = self.on_progress {
            progress(totals);
        }
    }
}

impl std::fmt::Debug for WalkControl<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalkControl")
            .field("should_stop", &self.should_stop.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Size `root` through listings only. Used by backends without a native
/// sizing call.
pub fn walk_size<R: DirectoryReader + ?Sized>(
    reader: &R,
    root: &Path,
    control: &WalkControl<'_>,
) -> FsResult<SizeTotals> {
    let root_item = reader.get_attributes(root)?;
    match root_item.kind {
        ItemKind::File => return Ok(SizeTotals::single_file(root_item.size)),
        ItemKind::Link(_) => return Ok(SizeTotals::single_file(0)),
        ItemKind::Directory => {}
    }

    let mut totals = SizeTotals::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    let mut seen: u64 = 0;

    while let Some(dir) = pending.pop() {
        control.checkpoint()?;
        for entry in reader.read_directory_info(&dir)? {
            match entry.kind {
                ItemKind::Directory => {
                    totals.record_dir();
                    pending.push(entry.path);
                }
                ItemKind::File => totals.record_file(entry.size),
                ItemKind::Link(_) => totals.record_file(0),
            }
            seen += 1;
            if seen % PROGRESS_INTERVAL == 0 {
                control.checkpoint()?;
                control.report(&totals);
            }
        }
    }

    control.report(&totals);
    Ok(totals)
}
