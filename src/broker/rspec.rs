//! Resource descriptions exchanged with aggregates.
//!
//! The broker never interprets resource elements. It only needs to merge
//! documents of one dialect and re-tag a document for another dialect; both
//! are behind [`RspecMerger`] so a testbed can plug in a real schema-aware
//! implementation.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct RspecVersion {
    pub kind: String,
    pub version: String,
}

impl RspecVersion {
    pub fn new(kind: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            version: version.into(),
        }
    }

    pub fn geni_v3() -> Self {
        Self::new("GENI", "3")
    }
}

impl Default for RspecVersion {
    fn default() -> Self {
        Self::geni_v3()
    }
}

impl fmt::Display for RspecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.version)
    }
}

/// An advertisement, request or manifest document. `resources` holds the
/// opaque top level elements.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Rspec {
    pub version: RspecVersion,
    pub resources: Vec<String>,
}

impl Rspec {
    pub fn new(version: RspecVersion, resources: Vec<String>) -> Self {
        Self { version, resources }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Renders the document body. An empty document renders as the empty
    /// string.
    pub fn to_document(&self) -> String {
        if self.resources.is_empty() {
            return String::new();
        }
        let mut doc = format!("<rspec type=\"{}\">", self.version);
        for element in &self.resources {
            doc.push_str(element);
        }
        doc.push_str("</rspec>");
        doc
    }
}

pub trait RspecMerger: Send + Sync {
    /// Merges documents that share `version`. Must be order independent.
    fn merge(&self, version: &RspecVersion, docs: Vec<Rspec>) -> Rspec;

    /// Re-expresses `doc` in dialect `to`.
    fn translate(&self, doc: Rspec, to: &RspecVersion) -> Rspec;
}

/// Union of resource elements, sorted so the result does not depend on the
/// order aggregates answered in. Translation only re-tags the document.
#[derive(Default, Clone, Copy, Debug)]
pub struct ElementMerger;

impl RspecMerger for ElementMerger {
    fn merge(&self, version: &RspecVersion, docs: Vec<Rspec>) -> Rspec {
        let mut resources: Vec<String> = docs.into_iter().flat_map(|d| d.resources).collect();
        resources.sort();
        Rspec::new(version.clone(), resources)
    }

    fn translate(&self, doc: Rspec, to: &RspecVersion) -> Rspec {
        Rspec::new(to.clone(), doc.resources)
    }
}
