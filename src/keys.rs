use std::collections::HashMap;

use crate::record::KeyRow;

/// Surrogate IDs for attribute names, handed out in first-seen order.
///
/// IDs start at 1 and are never reused, so the final contents are exactly
/// the `keys` relation. Owned by the sink; not shared between tasks.
#[derive(Debug, Default)]
pub struct KeyDictionary {
    ids: HashMap<String, i64>,
    names: Vec<String>,
}

impl KeyDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// ID for `name` (whitespace-trimmed), assigning the next one if new.
    pub fn intern(&mut self, name: &str) -> i64 {
        let name = name.trim();
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        self.names.push(name.to_string());
        let id = self.names.len() as i64;
        self.ids.insert(name.to_string(), id);
        id
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<i64> {
        self.ids.get(name.trim()).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// All keys in ID order.
    pub fn rows(&self) -> Vec<KeyRow> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| KeyRow {
                id: i as i64 + 1,
                name: name.clone(),
            })
            .collect()
    }
}
