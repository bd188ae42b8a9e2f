//! Longest-prefix resolution of HRNs to their owning authority.
//!
//! The trie is built once from the federation's authority table and then
//! shared read-only (behind an `Arc`) by every broker task. Adding an
//! authority means building a new trie.

use hashbrown::HashMap;

use super::hrn::Hrn;

#[derive(Default, Debug)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// Some known authority's HRN ends at this node.
    terminal: bool,
}

#[derive(Default, Debug)]
pub struct AuthorityTrie {
    root: TrieNode,
    len: usize,
}

impl AuthorityTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_authorities<'a, I>(authorities: I) -> Self
    where
        I: IntoIterator<Item = &'a Hrn>,
    {
        let mut trie = Self::new();
        for authority in authorities {
            trie.insert(authority);
        }
        trie
    }

    pub fn insert(&mut self, authority: &Hrn) {
        let mut node = &mut self.root;
        for component in authority.components() {
            node = node.children.entry(component.to_string()).or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    /// The deepest known authority that is a prefix of (or equal to)
    /// `target`, or `None` if the walk never touched a terminal node.
    pub fn best_match(&self, target: &Hrn) -> Option<Hrn> {
        let components = target.components();
        let mut node = &self.root;
        let mut deepest = None;
        for (depth, component) in components.iter().enumerate() {
            match node.children.get(*component) {
                Some(child) => {
                    node = child;
                    if node.terminal {
                        deepest = Some(depth + 1);
                    }
                }
                None => break,
            }
        }
        deepest.map(|depth| Hrn::from_components(&components[..depth]))
    }

    /// Number of distinct authorities inserted.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
