// Index contract plus the in-memory reference implementations.
//
// An index maps a key extracted from one tuple field to the tuple.
// Keys are either unsigned integers (4- or 8-byte little-endian
// fields) or opaque byte strings. `replace` is the only mutation and
// is atomic: it either unlinks the old tuple and links the new one, or
// reports a uniqueness violation and leaves the index unchanged.
//
// The hash structure answers point queries only; the tree structure
// answers the full iterator family. Iterators walk a snapshot of the
// matching keys: a caller that yields between advances may see tuples
// removed under it, but never a torn index.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::rc::Rc;

use crate::config::{IndexConfig, IndexStructure, KeyType};
use crate::error::{DbError, Result};
use crate::tuple::TupleRef;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Num(u64),
    Str(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct KeyDef {
    pub field: u32,
    pub key_type: KeyType,
    pub unique: bool,
}

impl KeyDef {
    pub fn from_config(config: &IndexConfig) -> KeyDef {
        KeyDef {
            field: config.key_field,
            key_type: config.key_type,
            unique: config.unique,
        }
    }

    /// Key from a raw field body.
    pub fn key_from_field(&self, body: &[u8]) -> Result<Key> {
        match self.key_type {
            KeyType::Num => match body.len() {
                4 => Ok(Key::Num(u64::from(u32::from_le_bytes(
                    body.try_into().unwrap(),
                )))),
                8 => Ok(Key::Num(u64::from_le_bytes(body.try_into().unwrap()))),
                _ => Err(DbError::IllegalParams(
                    "numeric key field must be 4 or 8 bytes",
                )),
            },
            KeyType::Str => Ok(Key::Str(body.to_vec())),
        }
    }

    /// Key from the indexed field of a stored tuple.
    pub fn key_from_tuple(&self, tuple: &TupleRef) -> Result<Key> {
        let body = tuple
            .field(self.field)
            .ok_or(DbError::IllegalParams("tuple misses the indexed field"))?;
        self.key_from_field(body)
    }
}

/// Iterator semantics over an ordered index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorType {
    Eq,
    /// Matching tuples in reverse insertion order.
    REq,
    All,
    Lt,
    Le,
    Ge,
    Gt,
}

pub trait Index {
    fn key_def(&self) -> &KeyDef;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, key: &Key) -> Option<TupleRef>;

    /// Unlink `old` and link `new` atomically. Uniqueness violations
    /// leave the index untouched.
    fn replace(&mut self, old: Option<&TupleRef>, new: Option<&TupleRef>) -> Result<()>;

    /// A pseudo-random resident tuple; used by expiry-style scans.
    fn random(&self, seed: u64) -> Option<TupleRef>;

    fn iterate(&self, ty: IteratorType, key: Option<&Key>) -> Result<Vec<TupleRef>>;
}

pub fn build_index(config: &IndexConfig) -> Box<dyn Index> {
    let def = KeyDef::from_config(config);
    match config.structure {
        IndexStructure::Hash => Box::new(HashIndex::new(def)),
        IndexStructure::Tree => Box::new(TreeIndex::new(def)),
    }
}

// Bucket helpers shared by both structures. A bucket is the list of
// tuples under one key; length one for unique indexes.

fn bucket_remove(bucket: &mut Vec<TupleRef>, old: &TupleRef) {
    bucket.retain(|t| !Rc::ptr_eq(t, old));
}

fn check_unique(
    def: &KeyDef,
    existing: Option<&Vec<TupleRef>>,
    old: Option<&TupleRef>,
) -> Result<()> {
    if !def.unique {
        return Ok(());
    }
    if let Some(bucket) = existing {
        let conflict = bucket.iter().any(|t| match old {
            Some(old) => !Rc::ptr_eq(t, old),
            None => true,
        });
        if conflict {
            return Err(DbError::IndexViolation);
        }
    }
    Ok(())
}

pub struct HashIndex {
    def: KeyDef,
    map: HashMap<Key, Vec<TupleRef>>,
}

impl HashIndex {
    pub fn new(def: KeyDef) -> HashIndex {
        HashIndex {
            def,
            map: HashMap::new(),
        }
    }
}

impl Index for HashIndex {
    fn key_def(&self) -> &KeyDef {
        &self.def
    }

    fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    fn find(&self, key: &Key) -> Option<TupleRef> {
        self.map.get(key).and_then(|b| b.first().cloned())
    }

    fn replace(&mut self, old: Option<&TupleRef>, new: Option<&TupleRef>) -> Result<()> {
        if let Some(new) = new {
            let new_key = self.def.key_from_tuple(new)?;
            check_unique(&self.def, self.map.get(&new_key), old)?;
        }
        if let Some(old) = old {
            let old_key = self.def.key_from_tuple(old)?;
            if let Some(bucket) = self.map.get_mut(&old_key) {
                bucket_remove(bucket, old);
                if bucket.is_empty() {
                    self.map.remove(&old_key);
                }
            }
        }
        if let Some(new) = new {
            let new_key = self.def.key_from_tuple(new)?;
            self.map.entry(new_key).or_default().push(new.clone());
        }
        Ok(())
    }

    fn random(&self, seed: u64) -> Option<TupleRef> {
        if self.map.is_empty() {
            return None;
        }
        let nth = seed as usize % self.map.len();
        self.map
            .values()
            .nth(nth)
            .and_then(|b| b.first())
            .cloned()
    }

    fn iterate(&self, ty: IteratorType, key: Option<&Key>) -> Result<Vec<TupleRef>> {
        match ty {
            IteratorType::Eq | IteratorType::REq => {
                let key = key.ok_or(DbError::IllegalParams("iterator needs a key"))?;
                let mut out = self.map.get(key).cloned().unwrap_or_default();
                if ty == IteratorType::REq {
                    out.reverse();
                }
                Ok(out)
            }
            IteratorType::All => Ok(self.map.values().flatten().cloned().collect()),
            _ => Err(DbError::IllegalParams(
                "hash index supports only EQ and ALL iteration",
            )),
        }
    }
}

pub struct TreeIndex {
    def: KeyDef,
    map: BTreeMap<Key, Vec<TupleRef>>,
}

impl TreeIndex {
    pub fn new(def: KeyDef) -> TreeIndex {
        TreeIndex {
            def,
            map: BTreeMap::new(),
        }
    }

    fn collect<'a>(iter: impl Iterator<Item = &'a Vec<TupleRef>>) -> Vec<TupleRef> {
        iter.flatten().cloned().collect()
    }
}

impl Index for TreeIndex {
    fn key_def(&self) -> &KeyDef {
        &self.def
    }

    fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    fn find(&self, key: &Key) -> Option<TupleRef> {
        self.map.get(key).and_then(|b| b.first().cloned())
    }

    fn replace(&mut self, old: Option<&TupleRef>, new: Option<&TupleRef>) -> Result<()> {
        if let Some(new) = new {
            let new_key = self.def.key_from_tuple(new)?;
            check_unique(&self.def, self.map.get(&new_key), old)?;
        }
        if let Some(old) = old {
            let old_key = self.def.key_from_tuple(old)?;
            if let Some(bucket) = self.map.get_mut(&old_key) {
                bucket_remove(bucket, old);
                if bucket.is_empty() {
                    self.map.remove(&old_key);
                }
            }
        }
        if let Some(new) = new {
            let new_key = self.def.key_from_tuple(new)?;
            self.map.entry(new_key).or_default().push(new.clone());
        }
        Ok(())
    }

    fn random(&self, seed: u64) -> Option<TupleRef> {
        if self.map.is_empty() {
            return None;
        }
        let nth = seed as usize % self.map.len();
        self.map
            .values()
            .nth(nth)
            .and_then(|b| b.first())
            .cloned()
    }

    // LT/LE walk away from the key, so they yield in descending key
    // order; GE/GT ascend.
    fn iterate(&self, ty: IteratorType, key: Option<&Key>) -> Result<Vec<TupleRef>> {
        let need_key = || key.cloned().ok_or(DbError::IllegalParams("iterator needs a key"));
        Ok(match ty {
            IteratorType::Eq => self.map.get(&need_key()?).cloned().unwrap_or_default(),
            IteratorType::REq => {
                let mut out = self.map.get(&need_key()?).cloned().unwrap_or_default();
                out.reverse();
                out
            }
            IteratorType::All => Self::collect(self.map.values()),
            IteratorType::Lt => Self::collect(
                self.map
                    .range((Bound::Unbounded, Bound::Excluded(need_key()?)))
                    .rev()
                    .map(|(_, b)| b),
            ),
            IteratorType::Le => Self::collect(
                self.map
                    .range((Bound::Unbounded, Bound::Included(need_key()?)))
                    .rev()
                    .map(|(_, b)| b),
            ),
            IteratorType::Ge => Self::collect(self.map.range(need_key()?..).map(|(_, b)| b)),
            IteratorType::Gt => Self::collect(
                self.map
                    .range((Bound::Excluded(need_key()?), Bound::Unbounded))
                    .map(|(_, b)| b),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::TupleBuilder;

    fn num_tuple(key: u32, value: &[u8]) -> TupleRef {
        let mut b = TupleBuilder::new();
        b.add_field(&key.to_le_bytes());
        b.add_field(value);
        b.finish()
    }

    fn unique_num_def() -> KeyDef {
        KeyDef {
            field: 0,
            key_type: KeyType::Num,
            unique: true,
        }
    }

    #[test]
    fn hash_find_and_replace() {
        let mut idx = HashIndex::new(unique_num_def());
        let a = num_tuple(1, b"a");
        let b = num_tuple(2, b"b");
        idx.replace(None, Some(&a)).unwrap();
        idx.replace(None, Some(&b)).unwrap();
        assert_eq!(idx.len(), 2);
        assert!(Rc::ptr_eq(&idx.find(&Key::Num(1)).unwrap(), &a));

        // Same key: must pass the old tuple to displace it.
        let a2 = num_tuple(1, b"a2");
        assert!(matches!(
            idx.replace(None, Some(&a2)),
            Err(DbError::IndexViolation)
        ));
        // Violation left the index unchanged.
        assert!(Rc::ptr_eq(&idx.find(&Key::Num(1)).unwrap(), &a));
        idx.replace(Some(&a), Some(&a2)).unwrap();
        assert!(Rc::ptr_eq(&idx.find(&Key::Num(1)).unwrap(), &a2));
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn hash_remove() {
        let mut idx = HashIndex::new(unique_num_def());
        let a = num_tuple(1, b"a");
        idx.replace(None, Some(&a)).unwrap();
        idx.replace(Some(&a), None).unwrap();
        assert!(idx.find(&Key::Num(1)).is_none());
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn non_unique_bucket_holds_many() {
        let def = KeyDef {
            field: 1,
            key_type: KeyType::Str,
            unique: false,
        };
        let mut idx = TreeIndex::new(def);
        let a = num_tuple(1, b"dup");
        let b = num_tuple(2, b"dup");
        idx.replace(None, Some(&a)).unwrap();
        idx.replace(None, Some(&b)).unwrap();
        let hits = idx
            .iterate(IteratorType::Eq, Some(&Key::Str(b"dup".to_vec())))
            .unwrap();
        assert_eq!(hits.len(), 2);
        let rhits = idx
            .iterate(IteratorType::REq, Some(&Key::Str(b"dup".to_vec())))
            .unwrap();
        assert!(Rc::ptr_eq(&rhits[0], &hits[1]));
    }

    #[test]
    fn tree_range_iteration() {
        let mut idx = TreeIndex::new(unique_num_def());
        for k in [10u32, 20, 30, 40] {
            idx.replace(None, Some(&num_tuple(k, b"v"))).unwrap();
        }
        let keys = |tuples: Vec<TupleRef>| -> Vec<u32> {
            tuples
                .iter()
                .map(|t| u32::from_le_bytes(t.field(0).unwrap().try_into().unwrap()))
                .collect()
        };
        let k = Key::Num(20);
        assert_eq!(keys(idx.iterate(IteratorType::Ge, Some(&k)).unwrap()), [20, 30, 40]);
        assert_eq!(keys(idx.iterate(IteratorType::Gt, Some(&k)).unwrap()), [30, 40]);
        assert_eq!(keys(idx.iterate(IteratorType::Le, Some(&k)).unwrap()), [20, 10]);
        assert_eq!(keys(idx.iterate(IteratorType::Lt, Some(&k)).unwrap()), [10]);
        assert_eq!(keys(idx.iterate(IteratorType::All, None).unwrap()), [10, 20, 30, 40]);
    }

    #[test]
    fn hash_rejects_range_iteration() {
        let idx = HashIndex::new(unique_num_def());
        assert!(idx.iterate(IteratorType::Gt, Some(&Key::Num(1))).is_err());
    }

    #[test]
    fn numeric_key_width() {
        let def = unique_num_def();
        assert_eq!(def.key_from_field(&7u32.to_le_bytes()).unwrap(), Key::Num(7));
        assert_eq!(
            def.key_from_field(&0xdead_beef_0000_0001u64.to_le_bytes()).unwrap(),
            Key::Num(0xdead_beef_0000_0001)
        );
        assert!(def.key_from_field(b"abc").is_err());
    }

    #[test]
    fn random_picks_resident() {
        let mut idx = HashIndex::new(unique_num_def());
        assert!(idx.random(17).is_none());
        for k in 0..5u32 {
            idx.replace(None, Some(&num_tuple(k, b"v"))).unwrap();
        }
        for seed in 0..20u64 {
            assert!(idx.random(seed).is_some());
        }
    }
}
