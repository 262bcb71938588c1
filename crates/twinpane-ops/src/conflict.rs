//! Conflict classification and the actions each conflict offers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use twinpane_core::{FsError, ResultCode};

/// Kind of recoverable per-item failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
pub enum ConflictBucket {
    /// The destination already exists and overwriting is off.
    Exists,
    /// The item to replace or delete is read-only.
    ReadOnly,
    /// The item is locked by another process.
    SharingViolation,
    /// A link the destination or the current policy cannot reproduce.
    UnsupportedReparse,
}

/// A user's answer to a conflict prompt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
pub enum ConflictAction {
    /// Replace the existing item.
    Overwrite,
    /// Write the incoming item under a fresh name.
    KeepBoth,
    /// Replace or delete the item even though it is read-only.
    ReplaceReadOnly,
    /// Leave this item alone.
    Skip,
    /// Leave this and every later item of the same kind alone.
    SkipAll,
    /// Try the same item again.
    Retry,
    /// Cancel the whole task.
    Cancel,
}

impl ConflictAction {
    /// Whether the action leaves the item untouched.
    pub fn is_skip(self) -> bool {
        matches!(self, Self::Skip | Self::SkipAll)
    }
}

impl ConflictBucket {
    /// Every action the bucket can offer, in display order.
    pub fn actions(self) -> &'static [ConflictAction] {
        use ConflictAction::*;
        match self {
            Self::Exists => &[Overwrite, KeepBoth, Skip, SkipAll, Cancel],
            Self::ReadOnly => &[ReplaceReadOnly, Skip, SkipAll, Cancel],
            Self::SharingViolation => &[Retry, Skip, SkipAll, Cancel],
            Self::UnsupportedReparse => &[Skip, SkipAll, Cancel],
        }
    }

    /// Actions offered for one prompt.
    ///
    /// `retry_failed` withholds Retry after a Retry of the same item failed.
    /// `capped` is the cached action that just failed; it is withheld along
    /// with Retry.
    pub fn legal_actions(
        self,
        retry_failed: bool,
        capped: Option<ConflictAction>,
    ) -> Vec<ConflictAction> {
        self.actions()
            .iter()
            .copied()
            .filter(|action| match action {
                ConflictAction::Retry => !retry_failed && capped.is_none(),
                other => Some(*other) != capped,
            })
            .collect()
    }

    /// Terminal code of a task that cannot resolve this conflict.
    pub fn abort_code(self) -> ResultCode {
        match self {
            Self::Exists => ResultCode::AlreadyExists,
            Self::ReadOnly => ResultCode::AccessDenied,
            Self::SharingViolation => ResultCode::SharingViolation,
            Self::UnsupportedReparse => ResultCode::NotSupported,
        }
    }

    /// Short text for prompts and reports.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Exists => "An item with the same name already exists",
            Self::ReadOnly => "The item is read-only",
            Self::SharingViolation => "The item is in use by another process",
            Self::UnsupportedReparse => "The link cannot be reproduced at the destination",
        }
    }
}

/// Map a backend failure to a conflict bucket; `None` means the failure is
/// not recoverable by asking the user.
pub fn classify(err: &FsError) -> Option<ConflictBucket> {
    match err {
        FsError::AlreadyExists { .. } => Some(ConflictBucket::Exists),
        FsError::ReadOnly { .. } => Some(ConflictBucket::ReadOnly),
        FsError::SharingViolation { .. } => Some(ConflictBucket::SharingViolation),
        FsError::UnsupportedReparse { .. } => Some(ConflictBucket::UnsupportedReparse),
        _ => None,
    }
}

/// Generate a name next to `path` that `exists` reports as free.
///
/// For "file.txt", tries "file (1).txt", "file (2).txt", etc.
pub fn unique_name(path: &Path, exists: impl Fn(&Path) -> bool) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    for i in 1..1000 {
        let new_name = match &extension {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };

        let new_path = parent.join(&new_name);
        if !exists(&new_path) {
            return new_path;
        }
    }

    // Fallback: use timestamp
    let timestamp = chrono::Utc::now().timestamp_millis();
    let new_name = match &extension {
        Some(ext) => format!("{stem}_{timestamp}.{ext}"),
        None => format!("{stem}_{timestamp}"),
    };

    parent.join(&new_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name() {
        let path = PathBuf::from("/tmp/test.txt");
        let renamed = unique_name(&path, |p| p.ends_with("test (1).txt"));
        assert_eq!(renamed, PathBuf::from("/tmp/test (2).txt"));
    }

    #[test]
    fn test_unique_name_no_extension() {
        let path = PathBuf::from("/tmp/testfile");
        let renamed = unique_name(&path, |_| false);
        assert_eq!(renamed, PathBuf::from("/tmp/testfile (1)"));
    }

    #[test]
    fn test_classify() {
        let exists = FsError::AlreadyExists { path: "/a".into() };
        assert_eq!(classify(&exists), Some(ConflictBucket::Exists));
        assert_eq!(classify(&FsError::backend("/a", "reset")), None);
        assert_eq!(classify(&FsError::Cancelled), None);
    }

    #[test]
    fn test_retry_withheld_after_failed_retry() {
        let fresh = ConflictBucket::SharingViolation.legal_actions(false, None);
        assert!(fresh.contains(&ConflictAction::Retry));

        let again = ConflictBucket::SharingViolation.legal_actions(true, None);
        assert!(!again.contains(&ConflictAction::Retry));
        assert!(again.contains(&ConflictAction::Skip));
    }

    #[test]
    fn test_capped_prompt_drops_cached_action() {
        let actions = ConflictBucket::Exists.legal_actions(false, Some(ConflictAction::Overwrite));
        assert!(!actions.contains(&ConflictAction::Overwrite));
        assert!(actions.contains(&ConflictAction::Skip));
        assert!(actions.contains(&ConflictAction::SkipAll));
    }

    #[test]
    fn test_unsupported_reparse_only_skips() {
        let actions = ConflictBucket::UnsupportedReparse.legal_actions(false, None);
        assert_eq!(
            actions,
            vec![
                ConflictAction::Skip,
                ConflictAction::SkipAll,
                ConflictAction::Cancel
            ]
        );
    }
}
