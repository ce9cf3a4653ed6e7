use crate::WatchError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Component, Path};

/// Decides which files under a watched directory are tracked.
///
/// A file qualifies when its extension is listed and no ignore pattern
/// matches either its path relative to the watched root or any single
/// segment of that relative path (so `node_modules` excludes a whole
/// directory tree).
#[derive(Debug, Clone)]
pub struct PathFilter {
    extensions: HashSet<String>,
    ignored: GlobSet,
}

impl PathFilter {
    pub fn new<E, P>(extensions: E, ignored: P) -> Result<Self, WatchError>
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_string())
            .collect();

        let mut builder = GlobSetBuilder::new();
        for pattern in ignored {
            builder.add(Glob::new(pattern.as_ref())?);
        }

        Ok(Self {
            extensions,
            ignored: builder.build()?,
        })
    }

    pub fn has_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.contains(ext))
    }

    /// `path` is ignored relative to `root`.
    pub fn is_ignored(&self, path: &Path, root: &Path) -> bool {
        let relative = path.strip_prefix(root).unwrap_or(path);
        if self.ignored.is_match(relative) {
            return true;
        }
        relative.components().any(|component| match component {
            Component::Normal(segment) => self.ignored.is_match(Path::new(segment)),
            _ => false,
        })
    }

    pub fn accepts(&self, path: &Path, root: &Path) -> bool {
        self.has_extension(path) && !self.is_ignored(path, root)
    }
}
