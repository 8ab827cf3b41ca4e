use std::fmt;

use crate::any::AnyTensorDict;
use crate::base::{TensorDictBase, NESTED_KEY_SEP};
use crate::entry::Entry;

/// Restartable view over a container's keys, in insertion order.
///
/// Every call to [`iter`](Self::iter) re-reads the container, so keys added
/// after the view was created are seen. With
/// [`include_nested`](Self::include_nested) the keys of nested containers
/// are yielded as dotted paths after their parent key.
#[derive(Clone)]
pub struct KeysView {
    td: AnyTensorDict,
    include_nested: bool,
    leaves_only: bool,
}

impl KeysView {
    pub fn new(td: AnyTensorDict) -> Self {
        Self {
            td,
            include_nested: false,
            leaves_only: false,
        }
    }

    pub fn include_nested(mut self) -> Self {
        self.include_nested = true;
        self
    }

    /// Skip keys holding nested containers.
    pub fn leaves_only(mut self) -> Self {
        self.leaves_only = true;
        self
    }

    pub fn iter(&self) -> KeysIter {
        let mut keys = Vec::new();
        self.walk(&self.td, "", &mut keys);
        KeysIter {
            inner: keys.into_iter(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.iter().any(|k| k == key)
    }

    pub fn len(&self) -> usize {
        self.iter().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn walk(&self, td: &AnyTensorDict, prefix: &str, out: &mut Vec<String>) {
        for key in td.key_list() {
            let path = format!("{prefix}{key}");
            match td.get(&key) {
                Ok(Entry::Nested(nested)) => {
                    if !self.leaves_only {
                        out.push(path.clone());
                    }
                    if self.include_nested {
                        self.walk(&nested, &format!("{path}{NESTED_KEY_SEP}"), out);
                    }
                }
                _ => out.push(path),
            }
        }
    }
}

impl<'a> IntoIterator for &'a KeysView {
    type Item = String;
    type IntoIter = KeysIter;

    fn into_iter(self) -> KeysIter {
        self.iter()
    }
}

impl fmt::Debug for KeysView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over a snapshot of the keys.
pub struct KeysIter {
    inner: std::vec::IntoIter<String>,
}

impl Iterator for KeysIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for KeysIter {}
