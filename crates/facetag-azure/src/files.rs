//! Resolution of stream URIs (`public://people/jane.jpeg`) to local files.

use facetag_core::ServiceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// URI scheme → directory the scheme is rooted at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRoots(BTreeMap<String, PathBuf>);

impl FileRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, scheme: &str, dir: impl Into<PathBuf>) -> Self {
        self.0.insert(scheme.to_string(), dir.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Local path for `uri`. Plain absolute paths pass through; relative
    /// parts may not climb out of their root.
    pub fn resolve(&self, uri: &str) -> Result<PathBuf, ServiceError> {
        let fail = |reason: &str| ServiceError::Image {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let Some((scheme, rest)) = uri.split_once("://") else {
            let path = Path::new(uri);
            if path.is_absolute() {
                return Ok(path.to_path_buf());
            }
            return Err(fail("not a stream URI or absolute path"));
        };
        let root = self
            .0
            .get(scheme)
            .ok_or_else(|| fail(&format!("no file root configured for scheme {scheme:?}")))?;

        let relative = Path::new(rest.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(fail("path escapes its root"));
        }
        Ok(root.join(relative))
    }

    pub fn read(&self, uri: &str) -> Result<Vec<u8>, ServiceError> {
        let path = self.resolve(uri)?;
        std::fs::read(&path).map_err(|e| ServiceError::Image {
            uri: uri.to_string(),
            reason: format!("{}: {e}", path.display()),
        })
    }
}
