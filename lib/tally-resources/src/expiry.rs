use tally_common::collections::FastIndexSet;

/// Allocation IDs of a single resource, in the order they were recorded.
///
/// Allocations can carry different TTLs, so recording order says nothing about expiry order: anything looking for
/// lapsed allocations has to walk every entry.
#[derive(Clone, Debug, Default)]
pub struct ExpiryIndex {
    ids: FastIndexSet<String>,
}

impl ExpiryIndex {
    pub fn push(&mut self, id: String) {
        self.ids.insert(id);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.ids.shift_remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

impl FromIterator<String> for ExpiryIndex {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}
