//! Collaborators of the controller: cached entities and the file system view

use crate::Result;
use crate::snapshot::{FileSystemSnapshot, TreeType};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Something whose outputs can be cached
pub trait CacheableEntity {
    /// Kind of entity, recorded in the manifest for diagnostics
    fn entity_type(&self) -> &str;

    /// Which entity this is, recorded in the manifest for diagnostics
    fn identity(&self) -> &str;

    /// Call `visitor` with the name, declared type and root of every output property
    ///
    /// # Errors
    ///
    /// Returns the first error returned by `visitor`
    fn visit_output_trees(
        &self,
        visitor: &mut dyn FnMut(&str, TreeType, &Path) -> Result<()>,
    ) -> Result<()>;
}

/// Cached view of the file system that must be kept consistent with outputs
pub trait FileSystemView: Send + Sync {
    /// `paths` are about to be overwritten
    fn invalidate(&self, paths: &[PathBuf]);

    /// `snapshot` is now the state of the output `property`
    fn record(&self, property: &str, snapshot: &FileSystemSnapshot);
}

/// View that keeps nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFileSystemView;

impl FileSystemView for NoopFileSystemView {
    fn invalidate(&self, _paths: &[PathBuf]) {}

    fn record(&self, _property: &str, _snapshot: &FileSystemSnapshot) {}
}

/// A plain set of named output trees
///
/// Properties are visited in name order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTreeSet {
    entity_type: String,
    identity: String,
    trees: BTreeMap<String, (TreeType, PathBuf)>,
}

impl OutputTreeSet {
    /// Create an empty set for the given entity
    #[must_use]
    pub fn new(entity_type: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            identity: identity.into(),
            trees: BTreeMap::new(),
        }
    }

    /// Declare a single file output
    #[must_use]
    pub fn file(self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.with_tree(name, TreeType::File, root)
    }

    /// Declare a directory output
    #[must_use]
    pub fn directory(self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.with_tree(name, TreeType::Directory, root)
    }

    /// Declare an output of the given type, replacing any output with the same name
    #[must_use]
    pub fn with_tree(
        mut self,
        name: impl Into<String>,
        tree_type: TreeType,
        root: impl Into<PathBuf>,
    ) -> Self {
        self.trees.insert(name.into(), (tree_type, root.into()));
        self
    }

    /// Declared outputs by name
    pub fn trees(&self) -> impl Iterator<Item = (&str, TreeType, &Path)> {
        self.trees
            .iter()
            .map(|(name, (tree_type, root))| (name.as_str(), *tree_type, root.as_path()))
    }
}

impl CacheableEntity for OutputTreeSet {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn visit_output_trees(
        &self,
        visitor: &mut dyn FnMut(&str, TreeType, &Path) -> Result<()>,
    ) -> Result<()> {
        for (name, tree_type, root) in self.trees() {
            visitor(name, tree_type, root)?;
        }
        Ok(())
    }
}
