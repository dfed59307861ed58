//! Session-scoped type descriptor cache.
//!
//! The first time an object type crosses the wire its descriptor (type name
//! plus property names) is sent inline and both sides remember the numeric
//! id assigned to it. Subsequent objects of that type reference the id only.
//! The table lives for one connection session and is cleared when a session
//! is (re)established, so both sides always agree on the id space.

use std::collections::HashMap;

use tracing::warn;

/// Set on the descriptor id when the descriptor body (or a back-reference)
/// follows.
pub const NEW_OBJECT_MASK: u16 = 0x8000;

/// Masks the descriptor id out of the leading short.
pub const INFO_ID_MASK: u16 = 0x7fff;

/// One known object type within a session.
#[derive(Debug, Clone, Default)]
pub struct TypeDescriptor {
    pub name: String,
    /// Id this side assigned when it first encoded the type; 0 = not yet
    /// assigned.
    pub local_id: u16,
    /// Id the remote side assigned when it first sent the type; 0 = never
    /// received.
    pub remote_id: u16,
    /// Property names in encoding order, fixed at first encode.
    pub props: Vec<String>,
    /// Property index to name mapping learned from the remote descriptor.
    pub remote_props: HashMap<i16, String>,
    /// Property count the remote descriptor declared.
    pub remote_prop_count: usize,
}

/// All descriptors seen during the current session.
#[derive(Debug, Default)]
pub struct TypeTable {
    entries: Vec<TypeDescriptor>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every descriptor. Called when a connection session starts so
    /// stale ids from a previous peer cannot be misread.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position_by_name(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Descriptor for an encoded type, creating it with the given property
    /// list on first use. Returns the index plus whether the descriptor
    /// still needs a local id (first emission).
    pub fn store_local(&mut self, name: &str, props: impl FnOnce() -> Vec<String>) -> usize {
        if let Some(index) = self.position_by_name(name) {
            return index;
        }
        self.entries.push(TypeDescriptor {
            name: name.to_owned(),
            props: props(),
            ..Default::default()
        });
        self.entries.len() - 1
    }

    /// Assign the next free local id to the descriptor at `index`.
    pub fn assign_local_id(&mut self, index: usize) -> u16 {
        let next = self
            .entries
            .iter()
            .map(|e| e.local_id)
            .max()
            .unwrap_or(0)
            + 1;
        self.entries[index].local_id = next;
        next
    }

    /// Register a descriptor announced by the remote side. An existing entry
    /// with the same name takes over the remote id; a colliding remote id on
    /// a different name is replaced with a warning.
    pub fn store_remote(&mut self, name: &str, remote_id: u16) -> usize {
        if let Some(index) = self.position_by_name(name) {
            self.entries[index].remote_id = remote_id;
            return index;
        }

        if let Some(stale) = self
            .entries
            .iter_mut()
            .find(|e| e.remote_id == remote_id && remote_id != 0)
        {
            warn!(
                old = %stale.name,
                new = %name,
                remote_id,
                "remote descriptor id reassigned"
            );
            stale.remote_id = 0;
        }

        self.entries.push(TypeDescriptor {
            name: name.to_owned(),
            remote_id,
            ..Default::default()
        });
        self.entries.len() - 1
    }

    pub fn find_remote(&self, remote_id: u16) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.remote_id == remote_id && remote_id != 0)
    }

    pub fn get(&self, index: usize) -> &TypeDescriptor {
        &self.entries[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut TypeDescriptor {
        &mut self.entries[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ids_start_at_one() {
        let mut table = TypeTable::new();
        let a = table.store_local("A", || vec!["x".into()]);
        assert_eq!(table.get(a).local_id, 0);
        assert_eq!(table.assign_local_id(a), 1);

        let b = table.store_local("B", Vec::new);
        assert_eq!(table.assign_local_id(b), 2);

        // Re-storing an existing name returns the same entry.
        assert_eq!(table.store_local("a", Vec::new), a);
        assert_eq!(table.get(a).props, vec!["x".to_owned()]);
    }

    #[test]
    fn test_remote_registration_and_lookup() {
        let mut table = TypeTable::new();
        let a = table.store_remote("A", 1);
        assert_eq!(table.find_remote(1), Some(a));
        assert_eq!(table.find_remote(2), None);

        // Same name again just refreshes the id.
        assert_eq!(table.store_remote("a", 5), a);
        assert_eq!(table.find_remote(5), Some(a));
    }

    #[test]
    fn test_colliding_remote_id_replaced() {
        let mut table = TypeTable::new();
        table.store_remote("A", 3);
        let b = table.store_remote("B", 3);
        assert_eq!(table.find_remote(3), Some(b));
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut table = TypeTable::new();
        table.store_remote("A", 1);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.find_remote(1), None);
    }
}
