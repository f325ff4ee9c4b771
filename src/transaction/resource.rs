// Hierarchical resource names.
//
// A resource is identified by the ordered path of (label, id) pairs leading
// from the database root down to it, e.g. database#0/table#2/page#4. Two
// contexts name the same resource exactly when their full paths are equal.

use std::fmt;

/// One step of a resource path.
pub type NameSegment = (String, u64);

/// Non-empty path of (label, id) pairs from the database root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    path: Vec<NameSegment>,
}

impl ResourceName {
    /// Creates a root-level resource name.
    pub fn new(label: &str, id: u64) -> Self {
        Self {
            path: vec![(label.to_string(), id)],
        }
    }

    /// Creates the name of a child resource one level below this one.
    pub fn child(&self, label: &str, id: u64) -> Self {
        let mut path = self.path.clone();
        path.push((label.to_string(), id));
        Self { path }
    }

    /// The name one level up, or `None` at the root.
    pub fn parent(&self) -> Option<ResourceName> {
        if self.path.len() <= 1 {
            return None;
        }
        Some(Self {
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &ResourceName) -> bool {
        other.path.len() > self.path.len() && other.path[..self.path.len()] == self.path[..]
    }

    /// Label of the final path segment.
    pub fn label(&self) -> &str {
        &self.path.last().expect("resource paths are non-empty").0
    }

    /// Id of the final path segment.
    pub fn id(&self) -> u64 {
        self.path.last().expect("resource paths are non-empty").1
    }

    /// Number of segments in the path.
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// The full path, root first.
    pub fn segments(&self) -> &[NameSegment] {
        &self.path
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (label, id)) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{label}#{id}")?;
        }
        Ok(())
    }
}
