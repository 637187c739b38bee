//! Open-addressing hash table
//!
//! Linear probing over a power-of-two capacity, resizing at a 0.75 load
//! factor. Deleted entries become tombstones (`empty` key, `true` value) so
//! probe chains stay intact; a tombstone being reused must not grow the
//! count, and `count` includes tombstones so the load factor bounds the
//! probe length.
//!
//! Keys are arbitrary [`Value`]s. Each entry caches its key's hash: the
//! callers (which have heap access for string hashes) hash once per
//! operation, and resizing stays heap-independent.

use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub key: Value,
    pub value: Value,
    pub hash: u32,
}

impl Entry {
    fn vacant() -> Entry {
        Entry {
            key: Value::EMPTY,
            value: Value::NIL,
            hash: 0,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_empty() && !self.value.is_nil()
    }
}

#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Index of the slot `key` occupies or would occupy: the entry itself,
    /// the first tombstone on its probe chain, or the first vacant slot.
    fn find_entry(entries: &[Entry], key: Value, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.key.is_empty() {
                if entry.value.is_nil() {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return index;
            }
            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::vacant(); capacity];
        self.count = 0;
        for entry in &self.entries {
            if entry.key.is_empty() {
                continue;
            }
            let dest = Table::find_entry(&entries, entry.key, entry.hash);
            entries[dest] = *entry;
            self.count += 1;
        }
        self.entries = entries;
    }

    pub fn get(&self, key: Value, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Table::find_entry(&self.entries, key, hash);
        let entry = &self.entries[index];
        if entry.key.is_empty() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Insert or overwrite. Returns `true` when the key was not present.
    pub fn set(&mut self, key: Value, hash: u32, value: Value) -> bool {
        if self.count + 1 > (self.entries.len() as f64 * TABLE_MAX_LOAD) as usize {
            let capacity = if self.entries.is_empty() {
                8
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(capacity);
        }

        let index = Table::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_empty();
        // Reusing a tombstone keeps the count: the tombstone was already in it.
        if is_new_key && entry.value.is_nil() {
            self.count += 1;
        }
        *entry = Entry { key, value, hash };
        is_new_key
    }

    /// Convert the entry to a tombstone. Returns `false` if absent.
    pub fn delete(&mut self, key: Value, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Table::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_empty() {
            return false;
        }
        entry.key = Value::EMPTY;
        entry.value = Value::TRUE;
        entry.hash = 0;
        true
    }

    /// Copy every live entry of `from` into this table.
    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if !entry.key.is_empty() {
                self.set(entry.key, entry.hash, entry.value);
            }
        }
    }

    /// Number of live entries (tombstones excluded).
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.key.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.key.is_empty())
            .map(|e| (e.key, e.value))
    }

    /// Raw slot view, used by the interner and the collector's
    /// white-string removal.
    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Delete every live entry whose key fails `keep`. Used by the
    /// collector to drop unmarked strings from the intern table.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(Value) -> bool) {
        for entry in &mut self.entries {
            if !entry.key.is_empty() && !keep(entry.key) {
                entry.key = Value::EMPTY;
                entry.value = Value::TRUE;
                entry.hash = 0;
            }
        }
    }

    /// Approximate heap footprint of the entry array, for GC accounting.
    pub fn footprint(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::number(n)
    }

    fn hash(n: f64) -> u32 {
        let bits = n.to_bits();
        (bits as u32) ^ ((bits >> 32) as u32)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut table = Table::new();
        for i in 0..100 {
            let fresh = table.set(num(i as f64), hash(i as f64), num(i as f64 * 2.0));
            assert!(fresh);
        }
        for i in 0..100 {
            assert_eq!(table.get(num(i as f64), hash(i as f64)), Some(num(i as f64 * 2.0)));
        }
        assert_eq!(table.get(num(100.0), hash(100.0)), None);
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn test_overwrite_is_not_new() {
        let mut table = Table::new();
        assert!(table.set(num(1.0), hash(1.0), Value::TRUE));
        assert!(!table.set(num(1.0), hash(1.0), Value::FALSE));
        assert_eq!(table.get(num(1.0), hash(1.0)), Some(Value::FALSE));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_leaves_probe_chain_intact() {
        let mut table = Table::new();
        // Three keys with identical hashes collide into one probe chain.
        for i in 0..3 {
            table.set(num(i as f64), 42, Value::TRUE);
        }
        assert!(table.delete(num(1.0), 42));
        // The key past the tombstone is still reachable.
        assert_eq!(table.get(num(2.0), 42), Some(Value::TRUE));
        assert_eq!(table.get(num(1.0), 42), None);
    }

    #[test]
    fn test_tombstone_reuse_does_not_grow_count() {
        let mut table = Table::new();
        table.set(num(1.0), 7, Value::TRUE);
        let before = table.count;
        table.delete(num(1.0), 7);
        // New key lands in the tombstone; the bookkeeping count must not grow.
        assert!(table.set(num(2.0), 7, Value::TRUE));
        assert_eq!(table.count, before);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_survives_resize() {
        let mut table = Table::new();
        for i in 0..1000 {
            table.set(num(i as f64), hash(i as f64), num(-(i as f64)));
        }
        assert!(table.capacity().is_power_of_two());
        for i in (0..1000).step_by(3) {
            table.delete(num(i as f64), hash(i as f64));
        }
        for i in 0..1000 {
            let expect = if i % 3 == 0 { None } else { Some(num(-(i as f64))) };
            assert_eq!(table.get(num(i as f64), hash(i as f64)), expect);
        }
    }

    #[test]
    fn test_add_all() {
        let mut a = Table::new();
        a.set(num(1.0), hash(1.0), num(10.0));
        a.set(num(2.0), hash(2.0), num(20.0));
        let mut b = Table::new();
        b.set(num(2.0), hash(2.0), num(99.0));
        a.add_all(&b);
        assert_eq!(a.get(num(1.0), hash(1.0)), Some(num(10.0)));
        assert_eq!(a.get(num(2.0), hash(2.0)), Some(num(99.0)));
    }
}
