//! Name→id assignment for datasets.
//!
//! Ids are handed out in observation order starting at zero, but
//! [`Registry::snapshot`] walks the set in name order: clients terminate a
//! catalog listing by comparing against the registry's size, and iterating
//! by id would expose gaps if ids were ever non-contiguous. Sorting by name
//! is a stable, human-meaningful order; ids are carried explicitly per entry
//! so clients key off the id, never the position.

use std::collections::BTreeMap;

use crate::{error::RegistryFull, protocol::{DatasetId, MAX_DATASETS}};

#[derive(Debug, Default)]
pub struct Registry {
    // A BTreeMap keyed by name gives us both the name->id lookup and a
    // name-sorted snapshot for free.
    by_name: BTreeMap<String, DatasetId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Returns the existing id for `name`, or assigns the next id in
    /// insertion order if this is the first time `name` has been seen.
    ///
    /// # Errors
    /// [`RegistryFull`] once 64 distinct names have already been assigned.
    pub fn lookup_or_assign(&mut self, name: &str) -> Result<DatasetId, RegistryFull> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        if self.by_name.len() >= MAX_DATASETS {
            return Err(RegistryFull);
        }
        // Safe: guarded by the length check above.
        let id = DatasetId::new(self.by_name.len() as u8).expect("len() < MAX_DATASETS");
        self.by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Yields `(id, name)` pairs in name order — the catalog order clients
    /// must see, not id order.
    pub fn snapshot(&self) -> impl Iterator<Item = (DatasetId, &str)> {
        self.by_name.iter().map(|(name, &id)| (id, name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_ids_in_observation_order() {
        let mut reg = Registry::new();
        assert_eq!(reg.lookup_or_assign("beta").unwrap().get(), 0);
        assert_eq!(reg.lookup_or_assign("alpha").unwrap().get(), 1);
        // Repeat lookups return the same id, not a fresh one.
        assert_eq!(reg.lookup_or_assign("beta").unwrap().get(), 0);
    }

    #[test]
    fn bijection_holds_for_many_names() {
        let mut reg = Registry::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..40 {
            let id = reg.lookup_or_assign(&format!("ds{i}")).unwrap();
            assert!(seen.insert(id), "id {id:?} reused across distinct names");
        }
    }

    #[test]
    fn snapshot_is_sorted_by_name_not_id() {
        let mut reg = Registry::new();
        reg.lookup_or_assign("beta").unwrap();
        reg.lookup_or_assign("alpha").unwrap();
        let snap: Vec<_> = reg.snapshot().collect();
        assert_eq!(snap, vec![(DatasetId::new(1).unwrap(), "alpha"), (DatasetId::new(0).unwrap(), "beta")]);
    }

    #[test]
    fn full_registry_rejects_new_names() {
        let mut reg = Registry::new();
        for i in 0..MAX_DATASETS {
            reg.lookup_or_assign(&format!("ds{i}")).unwrap();
        }
        assert_eq!(reg.lookup_or_assign("one-too-many"), Err(RegistryFull));
        // Existing names still resolve fine.
        assert!(reg.lookup_or_assign("ds0").is_ok());
    }
}
