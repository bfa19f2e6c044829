//! A concurrent store for fixed-length ids addressable by unique prefixes.

use crate::error::IndexError;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use uuid::Uuid;

type Result<T> = std::result::Result<T, IndexError>;

/// Generate a fresh 64 character hexadecimal identifier.
pub fn generate_id() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().to_simple(),
        Uuid::new_v4().to_simple()
    )
}

/// A thread-safe `{id → item}` map which resolves lookups by the shortest
/// unambiguous id prefix.
///
/// Backed by a character trie over the id alphabet; all mutations take the
/// writer lock, lookups and iteration take the reader lock.
#[derive(Debug)]
pub struct TruncIndex<T> {
    inner: RwLock<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    items: HashMap<String, Arc<T>>,
    trie: Node,
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<char, Node>,
    /// Number of ids terminating in this subtree.
    count: usize,
    terminal: bool,
}

impl<T> Default for TruncIndex<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: HashMap::new(),
                trie: Node::default(),
            }),
        }
    }
}

impl<T> TruncIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `item` under `id`.
    pub fn add(&self, id: &str, item: Arc<T>) -> Result<()> {
        validate_id(id)?;
        let mut guard = self.inner.write().expect("poisoned index lock");
        let inner = &mut *guard;
        if inner.items.contains_key(id) {
            return Err(IndexError::Conflict(id.into()));
        }

        let mut node = &mut inner.trie;
        node.count += 1;
        for c in id.chars() {
            node = node.children.entry(c).or_insert_with(Node::default);
            node.count += 1;
        }
        node.terminal = true;

        inner.items.insert(id.into(), item);
        Ok(())
    }

    /// Look up the item whose id is the only one extending `prefix`.
    pub fn get(&self, prefix: &str) -> Result<Arc<T>> {
        if prefix.is_empty() {
            return Err(IndexError::EmptyPrefix);
        }
        let inner = self.inner.read().expect("poisoned index lock");

        let mut node = &inner.trie;
        for c in prefix.chars() {
            node = node
                .children
                .get(&c)
                .ok_or_else(|| IndexError::NotFound(prefix.into()))?;
        }
        match node.count {
            0 => Err(IndexError::NotFound(prefix.into())),
            1 => {
                let id = complete_id(prefix, node);
                Ok(inner.items[&id].clone())
            }
            _ => Err(IndexError::AmbiguousPrefix(prefix.into())),
        }
    }

    /// Remove `id` from the index.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut guard = self.inner.write().expect("poisoned index lock");
        let inner = &mut *guard;
        if inner.items.remove(id).is_none() {
            return Err(IndexError::NotFound(id.into()));
        }

        inner.trie.count -= 1;
        let mut node = &mut inner.trie;
        for c in id.chars() {
            let child = node.children.get_mut(&c).expect("trie out of sync");
            child.count -= 1;
            if child.count == 0 {
                node.children.remove(&c);
                return Ok(());
            }
            node = node.children.get_mut(&c).expect("trie out of sync");
        }
        node.terminal = false;
        Ok(())
    }

    /// Invoke `f` for every entry present when iteration started.
    ///
    /// The snapshot is taken under the reader lock; entries deleted
    /// concurrently may or may not be observed.
    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<T>),
    {
        let snapshot: Vec<(String, Arc<T>)> = {
            let inner = self.inner.read().expect("poisoned index lock");
            inner
                .items
                .iter()
                .map(|(id, item)| (id.clone(), item.clone()))
                .collect()
        };
        for (id, item) in &snapshot {
            f(id, item);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("poisoned index lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(IndexError::EmptyPrefix);
    }
    if id.contains(char::is_whitespace) {
        return Err(IndexError::IllegalChar(id.into()));
    }
    Ok(())
}

/// Descend from the node reached via `prefix` to the single id below it.
fn complete_id(prefix: &str, mut node: &Node) -> String {
    let mut id = String::from(prefix);
    loop {
        if node.terminal {
            return id;
        }
        let (c, child) = node
            .children
            .iter()
            .find(|(_, n)| n.count > 0)
            .expect("trie out of sync");
        id.push(*c);
        node = child;
    }
}
