//! Collaborators the pipeline consumes but does not implement.
//!
//! - [`Analyzer`]: turns one file into structured facts
//! - [`FileLister`]: resolves a root and glob patterns into a path list
//! - [`ChangeSource`]: OS-level change notifications
//!
//! Default implementations are provided for listing ([`WalkLister`]) and
//! change notification ([`NotifySource`]).

mod analyzer;
mod lister;
mod source;

pub use analyzer::Analyzer;
pub use lister::{FileLister, ListError, PathFilter, WalkLister};
pub use source::{ChangeSource, ChangeStream, NotifySource, WatcherError};
