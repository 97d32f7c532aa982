//! Regular file opener and file-spec resolution.
//!
//! A file specification may be a plain path, a glob pattern, a `file:` URL
//! (hierarchical `file:///...` or opaque `file:/...` form), a Windows drive
//! path, or a UNC path. Resolution expands globs and yields openers sorted
//! lexicographically by resolved path.

use async_trait::async_trait;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

use super::{Opener, SourceStream};
use crate::error::{
    BadPatternSnafu, FileOpenSnafu, GlobEntrySnafu, InvalidFileUrlSnafu, NoMatchSnafu, OpenerError,
    UnsupportedSchemeSnafu,
};

/// An [`Opener`] backed by a regular file.
///
/// The display name is the path the opener was constructed with.
#[derive(Debug, Clone)]
pub struct FileOpener {
    path: PathBuf,
    name: String,
}

impl FileOpener {
    /// Create an opener for a single file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    /// The filesystem path this opener reads from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Opener for FileOpener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<SourceStream, OpenerError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|_| FileOpenSnafu {
                path: self.name.clone(),
            })?;
        Ok(Box::new(file))
    }
}

/// Resolve a file specification into an ordered list of [`FileOpener`]s.
///
/// Globs are expanded and the result is sorted lexicographically by path.
/// A specification that matches no file is an error, as is any URL scheme
/// other than `file:`.
pub fn resolve_file_spec(spec: &str) -> Result<Vec<FileOpener>, OpenerError> {
    let pattern = normalize_file_spec(spec)?;

    let entries = glob::glob(&pattern).context(BadPatternSnafu { spec })?;
    let mut paths = Vec::new();
    for entry in entries {
        paths.push(entry.context(GlobEntrySnafu { spec })?);
    }
    ensure!(!paths.is_empty(), NoMatchSnafu { spec });

    paths.sort();
    debug!("Resolved {:?} to {} file(s)", spec, paths.len());
    Ok(paths.into_iter().map(FileOpener::new).collect())
}

/// Convert a user-facing file specification into a glob pattern.
fn normalize_file_spec(spec: &str) -> Result<String, OpenerError> {
    let spec = spec.trim();

    if let Some(scheme) = scheme_of(spec) {
        if !scheme.eq_ignore_ascii_case("file") {
            return UnsupportedSchemeSnafu {
                scheme: scheme.to_string(),
                spec,
            }
            .fail();
        }
    }

    if spec.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("file:")) {
        return normalize_file_url(spec);
    }

    // Windows drive and UNC paths pass through untouched.
    Ok(spec.to_string())
}

/// Decode a `file:` URL (hierarchical or opaque) into a filesystem path.
fn normalize_file_url(spec: &str) -> Result<String, OpenerError> {
    let url = Url::parse(spec)
        .ok()
        .context(InvalidFileUrlSnafu { spec })?;
    let path = url
        .to_file_path()
        .ok()
        .context(InvalidFileUrlSnafu { spec })?;
    Ok(path.display().to_string())
}

/// Extract the scheme before `://`, if any.
///
/// Windows drive paths (`C:\...`) contain no `://` and are not treated as
/// URLs here; the single-colon `file:` opaque form is handled separately.
fn scheme_of(spec: &str) -> Option<&str> {
    spec.find("://").map(|idx| &spec[..idx])
}
