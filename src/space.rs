// Spaces: named tables of tuples.
//
// A space owns up to MAX_IDX indexes over one shared set of tuples.
// Index 0 is the primary: unique, and the holder of the references
// that keep tuples alive. Secondary indexes carry the same Rc handles
// but are rebuilt from the primary's contents on recovery. The
// per-space latch guards the window between staging a replace in the
// primary and committing it to the secondaries.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::config::SpaceConfig;
use crate::error::{DbError, Result};
use crate::fiber::ipc::Latch;
use crate::index::{build_index, Index, Key};
use crate::tuple::TupleRef;

pub const MAX_IDX: usize = 10;

pub struct Space {
    pub id: u32,
    pub enabled: bool,
    /// Declared field count; 0 = variable.
    pub cardinality: u32,
    indexes: Vec<RefCell<Box<dyn Index>>>,
    latch: Latch,
}

impl Space {
    pub fn new(config: &SpaceConfig) -> Rc<Space> {
        assert!(!config.indexes.is_empty() && config.indexes.len() <= MAX_IDX);
        Rc::new(Space {
            id: config.id,
            enabled: config.enabled,
            cardinality: config.cardinality,
            indexes: config.indexes.iter().map(|c| RefCell::new(build_index(c))).collect(),
            latch: Latch::new(),
        })
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    pub fn index(&self, n: u32) -> Result<&RefCell<Box<dyn Index>>> {
        self.indexes.get(n as usize).ok_or(DbError::NoSuchIndex {
            space: self.id,
            index: n,
        })
    }

    pub fn primary(&self) -> &RefCell<Box<dyn Index>> {
        &self.indexes[0]
    }

    /// Secondary indexes, if any.
    pub fn secondaries(&self) -> impl Iterator<Item = &RefCell<Box<dyn Index>>> {
        self.indexes.iter().skip(1)
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    /// Primary key of a tuple that belongs to this space.
    pub fn primary_key(&self, tuple: &TupleRef) -> Result<Key> {
        self.primary().borrow().key_def().key_from_tuple(tuple)
    }

    /// Enforce the declared cardinality on an incoming tuple.
    pub fn check_cardinality(&self, tuple: &TupleRef) -> Result<()> {
        if self.cardinality != 0 && tuple.field_count() != self.cardinality {
            return Err(DbError::IllegalParams("tuple field count must match space cardinality"));
        }
        Ok(())
    }

    pub fn tuple_count(&self) -> usize {
        self.primary().borrow().len()
    }
}

/// Process-wide space registry.
pub struct SpaceSet {
    spaces: RefCell<BTreeMap<u32, Rc<Space>>>,
}

impl SpaceSet {
    pub fn from_config(configs: &[SpaceConfig]) -> SpaceSet {
        let spaces = configs.iter().map(|c| (c.id, Space::new(c))).collect();
        SpaceSet {
            spaces: RefCell::new(spaces),
        }
    }

    pub fn get(&self, id: u32) -> Result<Rc<Space>> {
        let space = self
            .spaces
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(DbError::NoSuchSpace(id))?;
        if !space.enabled {
            return Err(DbError::NoSuchSpace(id));
        }
        Ok(space)
    }

    /// Every space, enabled or not; snapshot and recovery walk all.
    pub fn all(&self) -> Vec<Rc<Space>> {
        self.spaces.borrow().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, IndexStructure, KeyType};
    use crate::tuple::TupleBuilder;

    fn space_config(id: u32, cardinality: u32) -> SpaceConfig {
        SpaceConfig {
            id,
            enabled: true,
            cardinality,
            indexes: vec![IndexConfig {
                key_field: 0,
                key_type: KeyType::Num,
                unique: true,
                structure: IndexStructure::Hash,
            }],
        }
    }

    fn tuple(key: u32) -> TupleRef {
        let mut b = TupleBuilder::new();
        b.add_field(&key.to_le_bytes());
        b.add_field(b"payload");
        b.finish()
    }

    #[test]
    fn registry_lookup() {
        let set = SpaceSet::from_config(&[space_config(0, 0), space_config(5, 0)]);
        assert!(set.get(0).is_ok());
        assert!(set.get(5).is_ok());
        assert!(matches!(set.get(1), Err(DbError::NoSuchSpace(1))));
    }

    #[test]
    fn disabled_space_hidden() {
        let mut config = space_config(3, 0);
        config.enabled = false;
        let set = SpaceSet::from_config(&[config]);
        assert!(matches!(set.get(3), Err(DbError::NoSuchSpace(3))));
        assert_eq!(set.all().len(), 1);
    }

    #[test]
    fn cardinality_enforced() {
        let set = SpaceSet::from_config(&[space_config(0, 2)]);
        let space = set.get(0).unwrap();
        assert!(space.check_cardinality(&tuple(1)).is_ok());
        let mut b = TupleBuilder::new();
        b.add_field(&1u32.to_le_bytes());
        assert!(space.check_cardinality(&b.finish()).is_err());
    }

    #[test]
    fn primary_holds_tuples() {
        let set = SpaceSet::from_config(&[space_config(0, 0)]);
        let space = set.get(0).unwrap();
        let t = tuple(42);
        space.primary().borrow_mut().replace(None, Some(&t)).unwrap();
        let key = space.primary_key(&t).unwrap();
        assert!(space.primary().borrow().find(&key).is_some());
        assert_eq!(space.tuple_count(), 1);
    }
}
