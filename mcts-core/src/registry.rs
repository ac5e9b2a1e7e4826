use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared token vocabulary: a thread-safe string-to-index registry.
///
/// Cloning yields another handle onto the same table. Indices are dense and
/// assigned in first-registration order, so they can address vector slots.
#[derive(Clone, Debug, Default)]
pub struct Vocabulary {
    inner: Arc<RwLock<VocabularyTable>>,
}

#[derive(Debug, Default)]
struct VocabularyTable {
    ids: HashMap<String, usize>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `token`, registering it if unseen.
    pub fn intern(&self, token: &str) -> usize {
        if let Some(id) = self.get(token) {
            return id;
        }
        let mut table = match self.inner.write() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = table.ids.len();
        *table.ids.entry(token.to_string()).or_insert(next)
    }

    pub fn get(&self, token: &str) -> Option<usize> {
        let table = match self.inner.read() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.ids.get(token).copied()
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(table) => table.ids.len(),
            Err(poisoned) => poisoned.into_inner().ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
