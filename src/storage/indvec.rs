//! Indirection vector: stable slot IDs over variable-sized payloads.
//!
//! The B+ tree wants fixed-size entries per node, so variable-sized values
//! go through one level of indirection: the tree stores a dense [`SlotId`]
//! and this vector resolves it to a `(position, size)` record pointing into
//! the pager's inner region.
//!
//! Removing a slot compacts the record vector, so IDs *after* the removed
//! slot shift down by one. Callers must treat slot IDs as stable only
//! between removals; [`SlotTree`] repairs its stored IDs after every
//! compacting removal and is the intended way to combine both structures.
//!
//! # On-disk layout
//!
//! For a database named `<name>`, the record vector persists to the
//! `<name>-indvector` sidecar and the slot pager's backing file is
//! `<name>-indvector-header`.

use std::{
    fs::{File, OpenOptions},
    io::{BufReader, Write},
    marker::PhantomData,
    path::PathBuf,
};

use bincode::{Decode, Encode};
use log::{debug, trace};

use crate::compression::{compress_bytes, decompress_bytes};
use crate::config::{OpenMode, TreeOptions};

use super::{
    CodecConfig, ReadError, StorageError, WriteError,
    btree::{Btree, InsertOutcome, RemoveOutcome},
    codec_config,
    node::{Key, Value},
    page::{PAGE_HEADER_SIZE, PAGE_SIZE},
    pager::{Pager, sidecar_path},
    position::Position,
};

/// Dense identifier of a live slot.
pub type SlotId = u64;

/// A `(position, size)` record locating one payload in the inner region.
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct Slot {
    pub pos: u64,
    pub size: u32,
}

/// Mapping from slot IDs to slot records.
pub struct IndirectionVector<V> {
    identifier: PathBuf,
    slots: Vec<Slot>,
    pager: Pager,
    compress: bool,
    config: CodecConfig,
    _marker: PhantomData<V>,
}

impl<V: Value> IndirectionVector<V> {
    /// Opens the vector for the database named `name`.
    pub fn open(
        name: impl Into<PathBuf>,
        mode: OpenMode,
        opts: &TreeOptions,
    ) -> Result<Self, StorageError> {
        let identifier = sidecar_path(&name.into(), "-indvector");
        let pager_file = sidecar_path(&identifier, "-header");
        let pager = Pager::open(pager_file, &opts.pager_options())?;

        let mut vector = Self {
            identifier,
            slots: Vec::new(),
            pager,
            compress: opts.apply_compression,
            config: codec_config(),
            _marker: PhantomData,
        };
        if mode == OpenMode::Load {
            vector.load()?;
        }
        Ok(vector)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Serializes `val` into a fresh inner range and appends its record,
    /// returning the new slot's ID.
    pub fn set(&mut self, val: &V) -> Result<SlotId, StorageError> {
        let data = self.encode_value(val)?;
        let pos = self.pager.alloc_inner(data.len() as u32)?;
        self.pager.place_inner(pos, &data)?;

        self.slots.push(Slot {
            pos: pos.raw(),
            size: data.len() as u32,
        });
        let id = self.slots.len() as SlotId - 1;
        trace!("slot {id} set at inner position {pos}");
        Ok(id)
    }

    /// Resolves a slot ID back into a value.
    pub fn get(&mut self, id: SlotId) -> Result<V, StorageError> {
        let slot = *self
            .slots
            .get(id as usize)
            .ok_or(ReadError::MissingSlot(id))?;
        let data = self.pager.get_inner(Position::new(slot.pos), slot.size)?;
        self.decode_value(&data)
    }

    /// Rewrites a slot with a new value, re-allocating its inner range.
    pub fn replace(&mut self, id: SlotId, val: &V) -> Result<(), StorageError> {
        let old = *self
            .slots
            .get(id as usize)
            .ok_or(ReadError::MissingSlot(id))?;

        let data = self.encode_value(val)?;
        let pos = self.pager.alloc_inner(data.len() as u32)?;
        self.pager.free_inner(Position::new(old.pos), old.size);
        self.pager.place_inner(pos, &data)?;

        self.slots[id as usize] = Slot {
            pos: pos.raw(),
            size: data.len() as u32,
        };
        Ok(())
    }

    /// Frees a slot's inner range and compacts the record vector. Slot IDs
    /// after `id` shift down by one.
    pub fn remove(&mut self, id: SlotId) -> Result<(), StorageError> {
        if id as usize >= self.slots.len() {
            return Err(ReadError::MissingSlot(id).into());
        }
        let slot = self.slots.remove(id as usize);
        self.pager.free_inner(Position::new(slot.pos), slot.size);
        trace!("slot {id} removed; {} slots shift down", self.len() as u64 - id);
        Ok(())
    }

    /// Persists the record vector to its sidecar and recursively saves the
    /// pager.
    pub fn save(&mut self) -> Result<(), StorageError> {
        self.pager.save()?;

        let identifier = self.identifier.display().to_string();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.identifier)
            .map_err(WriteError::Io)?;
        let record = bincode::encode_to_vec((&identifier, &self.slots), self.config)
            .map_err(WriteError::Encode)?;
        file.write_all(&record).map_err(WriteError::Io)?;
        debug!("indirection vector saved: {} slots", self.slots.len());
        Ok(())
    }

    /// Restores the record vector, verifying that every record still lies
    /// within the pager's inner region.
    pub fn load(&mut self) -> Result<(), StorageError> {
        let file = File::open(&self.identifier).map_err(ReadError::Io)?;
        let mut reader = BufReader::new(file);
        let (identifier, slots): (String, Vec<Slot>) =
            bincode::decode_from_reader(&mut reader, self.config).map_err(ReadError::Decode)?;

        if identifier != self.identifier.display().to_string() {
            return Err(StorageError::BadIndVector {
                reason: format!("identifier {identifier:?} does not name this vector"),
            });
        }
        for (id, slot) in slots.iter().enumerate() {
            let offset = slot.pos as usize % PAGE_SIZE;
            if offset < PAGE_HEADER_SIZE || offset + slot.size as usize > PAGE_SIZE {
                return Err(StorageError::BadIndVector {
                    reason: format!("slot {id} escapes the inner region"),
                });
            }
        }

        self.pager.load()?;
        self.slots = slots;
        debug!("indirection vector loaded: {} slots", self.slots.len());
        Ok(())
    }

    fn encode_value(&self, val: &V) -> Result<Vec<u8>, StorageError> {
        let data = bincode::encode_to_vec(val, self.config).map_err(WriteError::Encode)?;
        if self.compress {
            compress_bytes(&data)
        } else {
            Ok(data)
        }
    }

    fn decode_value(&self, data: &[u8]) -> Result<V, StorageError> {
        let raw;
        let data = if self.compress {
            raw = decompress_bytes(data)?;
            &raw[..]
        } else {
            data
        };
        let (val, _) = bincode::decode_from_slice(data, self.config).map_err(ReadError::Decode)?;
        Ok(val)
    }
}

/// A B+ tree over variable-sized values: keys index slot IDs, the
/// indirection vector resolves them to payloads.
pub struct SlotTree<K, V> {
    tree: Btree<K, SlotId>,
    slots: IndirectionVector<V>,
}

impl<K: Key, V: Value> SlotTree<K, V> {
    pub fn open(
        path: impl Into<PathBuf>,
        mode: OpenMode,
        opts: TreeOptions,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let slots = IndirectionVector::open(&path, mode, &opts)?;
        let tree = Btree::open(path, mode, opts)?;
        Ok(Self { tree, slots })
    }

    pub fn size(&self) -> u64 {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn insert(&mut self, key: K, val: &V) -> Result<InsertOutcome, StorageError> {
        let id = self.slots.set(val)?;
        match self.tree.insert(key, id)? {
            outcome @ InsertOutcome::Inserted(_) => Ok(outcome),
            outcome @ InsertOutcome::InsertedNothing(_) => {
                // The freshly appended slot is the last one, so dropping it
                // shifts nothing.
                self.slots.remove(id)?;
                Ok(outcome)
            }
        }
    }

    pub fn get(&mut self, key: &K) -> Result<Option<V>, StorageError> {
        match self.tree.get(key)? {
            Some(id) => Ok(Some(self.slots.get(id)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&mut self, key: &K) -> Result<bool, StorageError> {
        self.tree.contains(key)
    }

    pub fn update(&mut self, key: &K, val: &V) -> Result<(), StorageError> {
        let id = self.tree.get(key)?.ok_or(StorageError::NoSuchEntry)?;
        self.slots.replace(id, val)
    }

    /// Removes the entry and its payload. Slot IDs stored in the tree above
    /// the removed one are walked down to match the compacted vector.
    pub fn remove(&mut self, key: &K) -> Result<RemoveOutcome<V>, StorageError> {
        let id = match self.tree.remove(key)? {
            RemoveOutcome::RemovedNothing => return Ok(RemoveOutcome::RemovedNothing),
            RemoveOutcome::Removed(id) => id,
        };
        let val = self.slots.get(id)?;
        self.slots.remove(id)?;

        let stale: Vec<(K, SlotId)> = self
            .tree
            .scan()?
            .filter(|entry| entry.as_ref().map(|(_, sid)| *sid > id).unwrap_or(true))
            .collect::<Result<_, _>>()?;
        for (key, sid) in stale {
            self.tree.update(&key, sid - 1)?;
        }
        Ok(RemoveOutcome::Removed(val))
    }

    pub fn save(&mut self) -> Result<(), StorageError> {
        self.tree.save()?;
        self.slots.save()
    }

    pub fn load(&mut self) -> Result<(), StorageError> {
        self.tree.load()?;
        self.slots.load()
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    fn opts() -> TreeOptions {
        TreeOptions::default()
    }

    #[test]
    fn slots_round_trip_values() {
        let temp = TempDir::new("IndVector").unwrap();
        let mut vector: IndirectionVector<String> =
            IndirectionVector::open(temp.path().join("floe.db"), OpenMode::Bare, &opts()).unwrap();

        let a = vector.set(&"first".to_string()).unwrap();
        let b = vector.set(&"second".to_string()).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(vector.get(a).unwrap(), "first");
        assert_eq!(vector.get(b).unwrap(), "second");
    }

    #[test]
    fn missing_slots_surface_bad_reads() {
        let temp = TempDir::new("IndVector").unwrap();
        let mut vector: IndirectionVector<String> =
            IndirectionVector::open(temp.path().join("floe.db"), OpenMode::Bare, &opts()).unwrap();

        assert!(matches!(
            vector.get(0),
            Err(StorageError::BadRead {
                cause: ReadError::MissingSlot(0)
            })
        ));
    }

    #[test]
    fn replace_rewrites_a_slot_in_place() {
        let temp = TempDir::new("IndVector").unwrap();
        let mut vector: IndirectionVector<String> =
            IndirectionVector::open(temp.path().join("floe.db"), OpenMode::Bare, &opts()).unwrap();

        let id = vector.set(&"short".to_string()).unwrap();
        vector
            .replace(id, &"a noticeably longer payload".to_string())
            .unwrap();
        assert_eq!(vector.get(id).unwrap(), "a noticeably longer payload");
        assert_eq!(vector.len(), 1);
    }

    #[test]
    fn remove_shifts_subsequent_ids() {
        let temp = TempDir::new("IndVector").unwrap();
        let mut vector: IndirectionVector<String> =
            IndirectionVector::open(temp.path().join("floe.db"), OpenMode::Bare, &opts()).unwrap();

        vector.set(&"zero".to_string()).unwrap();
        vector.set(&"one".to_string()).unwrap();
        vector.set(&"two".to_string()).unwrap();

        vector.remove(1).unwrap();
        assert_eq!(vector.len(), 2);
        assert_eq!(vector.get(0).unwrap(), "zero");
        // "two" slid into the removed slot's ID.
        assert_eq!(vector.get(1).unwrap(), "two");
    }

    #[test]
    fn vector_state_survives_save_and_load() {
        let temp = TempDir::new("IndVector").unwrap();
        let path = temp.path().join("floe.db");

        let mut vector: IndirectionVector<String> =
            IndirectionVector::open(&path, OpenMode::Bare, &opts()).unwrap();
        let a = vector.set(&"persisted".to_string()).unwrap();
        vector.set(&"also persisted".to_string()).unwrap();
        vector.save().unwrap();
        drop(vector);

        let mut reloaded: IndirectionVector<String> =
            IndirectionVector::open(&path, OpenMode::Load, &opts()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get(a).unwrap(), "persisted");
        assert_eq!(reloaded.get(1).unwrap(), "also persisted");
    }

    #[test]
    fn compressed_vectors_round_trip() {
        let temp = TempDir::new("IndVector").unwrap();
        let opts = TreeOptions {
            apply_compression: true,
            ..TreeOptions::default()
        };
        let mut vector: IndirectionVector<String> =
            IndirectionVector::open(temp.path().join("floe.db"), OpenMode::Bare, &opts).unwrap();

        let payload = "a payload with plenty of repetition repetition repetition".to_string();
        let id = vector.set(&payload).unwrap();
        assert_eq!(vector.get(id).unwrap(), payload);
    }

    #[test]
    fn slot_tree_round_trips_variable_values() {
        let temp = TempDir::new("SlotTree").unwrap();
        let mut tree: SlotTree<i32, String> =
            SlotTree::open(temp.path().join("floe.db"), OpenMode::Bare, opts()).unwrap();

        for key in 0..50 {
            let val = format!("value-{key}").repeat(key as usize % 7 + 1);
            assert!(matches!(
                tree.insert(key, &val).unwrap(),
                InsertOutcome::Inserted(_)
            ));
        }
        assert_eq!(tree.size(), 50);
        for key in 0..50 {
            let expected = format!("value-{key}").repeat(key as usize % 7 + 1);
            assert_eq!(tree.get(&key).unwrap(), Some(expected));
        }
    }

    #[test]
    fn slot_tree_update_and_duplicate_insert() {
        let temp = TempDir::new("SlotTree").unwrap();
        let mut tree: SlotTree<i32, String> =
            SlotTree::open(temp.path().join("floe.db"), OpenMode::Bare, opts()).unwrap();

        tree.insert(1, &"one".to_string()).unwrap();
        assert!(matches!(
            tree.insert(1, &"clobber".to_string()).unwrap(),
            InsertOutcome::InsertedNothing(_)
        ));
        assert_eq!(tree.get(&1).unwrap(), Some("one".to_string()));

        tree.update(&1, &"uno".to_string()).unwrap();
        assert_eq!(tree.get(&1).unwrap(), Some("uno".to_string()));
    }

    #[test]
    fn slot_tree_remove_repairs_shifted_ids() {
        let temp = TempDir::new("SlotTree").unwrap();
        let mut tree: SlotTree<i32, String> =
            SlotTree::open(temp.path().join("floe.db"), OpenMode::Bare, opts()).unwrap();

        for key in 0..10 {
            tree.insert(key, &format!("value-{key}")).unwrap();
        }
        assert_eq!(
            tree.remove(&3).unwrap(),
            RemoveOutcome::Removed("value-3".to_string())
        );
        assert_eq!(tree.size(), 9);

        for key in (0..10).filter(|k| *k != 3) {
            assert_eq!(tree.get(&key).unwrap(), Some(format!("value-{key}")));
        }
        assert_eq!(tree.remove(&3).unwrap(), RemoveOutcome::RemovedNothing);
    }

    #[test]
    fn slot_tree_persists() {
        let temp = TempDir::new("SlotTree").unwrap();
        let path = temp.path().join("floe.db");

        let mut tree: SlotTree<i32, String> =
            SlotTree::open(&path, OpenMode::Bare, opts()).unwrap();
        for key in 0..20 {
            tree.insert(key, &format!("value-{key}")).unwrap();
        }
        tree.save().unwrap();
        drop(tree);

        let mut reloaded: SlotTree<i32, String> =
            SlotTree::open(&path, OpenMode::Load, opts()).unwrap();
        assert_eq!(reloaded.size(), 20);
        for key in 0..20 {
            assert_eq!(reloaded.get(&key).unwrap(), Some(format!("value-{key}")));
        }
    }
}
