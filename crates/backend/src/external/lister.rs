//! Directory listing for directory-mode batch runs.
//!
//! Uses the `ignore` crate's walker so `.gitignore` rules apply, with the
//! configured include/exclude globs layered on top as overrides.

use std::path::{Path, PathBuf};

use ignore::{
  Match, WalkBuilder,
  overrides::{Override, OverrideBuilder},
};
use tracing::{debug, trace, warn};

/// Errors that can occur while listing files
#[derive(Debug, thiserror::Error)]
pub enum ListError {
  #[error("Not a directory: {0}")]
  NotADirectory(PathBuf),
  #[error("Invalid pattern: {0}")]
  Pattern(#[source] ignore::Error),
}

/// Resolves a directory and glob patterns into a list of files
pub trait FileLister: Send + Sync {
  fn list(&self, root: &Path, patterns: &[String], exclude: &[String]) -> Result<Vec<PathBuf>, ListError>;
}

// ============================================================================
// Path Filter
// ============================================================================

/// Include/exclude matcher rooted at a directory.
///
/// Excludes win over includes. An exclude glob also excludes everything below
/// a matching directory.
#[derive(Debug, Clone)]
pub struct PathFilter {
  root: PathBuf,
  overrides: Override,
}

impl PathFilter {
  pub fn new(root: &Path, patterns: &[String], exclude: &[String]) -> Result<Self, ListError> {
    let mut builder = OverrideBuilder::new(root);

    for pattern in patterns {
      builder.add(pattern).map_err(ListError::Pattern)?;
    }
    // Later globs take precedence, so excludes go last
    for pattern in exclude {
      let pattern = pattern.trim_end_matches('/');
      builder.add(&format!("!{pattern}")).map_err(ListError::Pattern)?;
      builder.add(&format!("!{pattern}/**")).map_err(ListError::Pattern)?;
    }

    let overrides = builder.build().map_err(ListError::Pattern)?;

    Ok(Self {
      root: root.to_path_buf(),
      overrides,
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// True if `path` lives under this filter's root
  pub fn covers(&self, path: &Path) -> bool {
    path.starts_with(&self.root)
  }

  /// Check a path against the include/exclude globs
  pub fn accepts(&self, path: &Path, is_dir: bool) -> bool {
    !matches!(self.overrides.matched(path, is_dir), Match::Ignore(_))
  }

  fn overrides(&self) -> Override {
    self.overrides.clone()
  }
}

// ============================================================================
// Walk Lister
// ============================================================================

/// Default [`FileLister`] backed by `ignore::WalkBuilder`
#[derive(Debug, Clone, Default)]
pub struct WalkLister {
  /// Follow symlinks while walking (default: false)
  pub follow_links: bool,
}

impl FileLister for WalkLister {
  fn list(&self, root: &Path, patterns: &[String], exclude: &[String]) -> Result<Vec<PathBuf>, ListError> {
    if !root.is_dir() {
      return Err(ListError::NotADirectory(root.to_path_buf()));
    }

    let filter = PathFilter::new(root, patterns, exclude)?;

    let walker = WalkBuilder::new(root)
      .overrides(filter.overrides())
      .follow_links(self.follow_links)
      .require_git(false)
      .build();

    let mut files = Vec::new();
    for entry in walker {
      let entry = match entry {
        Ok(entry) => entry,
        Err(e) => {
          warn!(error = %e, "Skipping unreadable entry");
          continue;
        }
      };

      if !entry.file_type().is_some_and(|t| t.is_file()) {
        continue;
      }

      trace!(path = %entry.path().display(), "Listed file");
      files.push(entry.into_path());
    }

    files.sort();
    debug!(root = %root.display(), count = files.len(), "Directory listed");
    Ok(files)
  }
}
