//! Hash table objects.
//!
//! Open-addressed table with per-node collision chains (relative `next`
//! offsets) and Brent-style insertion: a colliding node that is not in its
//! main position is evicted to a free slot so every key remains reachable
//! from its main position. An empty node array doubles as the "dummy"
//! representation, so no access path needs a presence check.
//!
//! The value of a node is `Option<Value>`; `None` is the empty slot. A key
//! whose value slot is empty may be turned into a dead key by the collector,
//! keeping the collision chain intact while the key object is reclaimed.

use crate::error::{VmError, VmResult};
use crate::gc::{GcRef, GcStr, GcTable, Heap};
use crate::value::{flt_to_int, F2I, Value};

/// Minimum non-zero size of the node array.
pub const MIN_TABLE_SIZE: usize = 4;

/// Largest allowed node-array size (power of two).
pub const MAX_TABLE_SIZE: usize = 1 << 26;

bitflags::bitflags! {
    /// Cached *absence* of the fast-access metamethods, plus nothing else:
    /// a set bit means the table, used as a metatable, is known not to have
    /// the corresponding event field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TableFlags: u8 {
        const NO_GETIDX = 1 << 0;
        const NO_SETIDX = 1 << 1;
        const NO_GC     = 1 << 2;
        const NO_CALL   = 1 << 3;
        const NO_EQ     = 1 << 4;
        const NO_NAME   = 1 << 5;
        const NO_INIT   = 1 << 6;
    }
}

/// Mask with every fast-access absence bit set (fresh tables have no
/// metamethod fields).
pub const MASK_MM_FLAGS: u8 = 0x7f;

/// Key stored in a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeKey {
    /// Never used; the slot is free.
    Nil,
    /// Dead key: the collectable key was reclaimed, identity retained for
    /// chain traversal.
    Dead(GcRef),
    /// A live key (never `Value::Nil`).
    Key(Value),
}

/// One slot of the node array.
#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub key: NodeKey,
    /// `None` is the empty value slot.
    pub val: Option<Value>,
    /// Relative offset to the next node in this collision chain; 0 ends it.
    pub next: i32,
}

impl Node {
    const FREE: Node = Node {
        key: NodeKey::Nil,
        val: None,
        next: 0,
    };
}

/// A table object.
#[derive(Debug, Default)]
pub struct TableObj {
    /// Hash part; empty vector is the size-0 (dummy) representation.
    pub(crate) nodes: Vec<Node>,
    /// Free-slot search cursor; all positions at or above it were checked.
    pub(crate) lastfree: usize,
    /// Metamethod-absence cache ([`TableFlags`]).
    pub flags: u8,
}

impl TableObj {
    pub(crate) fn new() -> Self {
        TableObj {
            nodes: Vec::new(),
            lastfree: 0,
            flags: MASK_MM_FLAGS,
        }
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_dummy(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Clear the whole metamethod cache (any write may add an event field).
    pub fn invalidate_mm_cache(&mut self) {
        self.flags &= !MASK_MM_FLAGS;
    }
}

/// Result of a pre-set: either the write completed, or the caller must
/// validate the key and call [`Heap::table_finish_set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pset {
    /// Existing value overwritten.
    Ok,
    /// No slot with that key.
    NotFound,
    /// Slot with that key but an empty value; encoded node index.
    Slot(usize),
}

#[derive(Debug, Clone, Copy)]
enum Probe {
    Absent,
    At(usize),
}

/// Split an f64 into (mantissa in ±[0.5, 1), binary exponent).
fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let raw_exp = ((bits >> 52) & 0x7ff) as i32;
    if raw_exp == 0 {
        // subnormal: rescale into the normal range first
        let (m, e) = frexp(x * 2f64.powi(64));
        return (m, e - 64);
    }
    let e = raw_exp - 1022;
    let m = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (m, e)
}

/// Hash for floats: combine frexp mantissa and exponent so integral floats
/// and their neighbours spread well. Infinities and NaN hash to 0.
fn hash_float(f: f64) -> u32 {
    let (m, e) = frexp(f);
    let n = m * -(i32::MIN as f64);
    if !n.is_finite() || n.abs() >= 2f64.powi(63) {
        return 0;
    }
    let u = (e as u32).wrapping_add(n as i64 as u32);
    if u <= i32::MAX as u32 {
        u
    } else {
        !u
    }
}

impl Heap {
    /// Create a new empty table.
    pub fn table_new(&mut self) -> GcTable {
        self.alloc_table(TableObj::new())
    }

    /// Main position of `key` within the node array of `tb`.
    ///
    /// Long-string keys must already carry their hash (see `prepare_key`).
    fn main_position(&self, tb: &TableObj, key: &Value) -> usize {
        let size = tb.nodes.len();
        debug_assert!(size.is_power_of_two());
        let mask = size - 1;
        // for non-power-friendly hashes, avoid modulo by a power of two
        let oddmod = |n: u64| (n % ((mask | 1) as u64)) as usize;
        match key {
            Value::Int(i) => {
                let ui = *i as u64;
                if ui <= i32::MAX as u64 {
                    (ui as usize) % (mask | 1)
                } else {
                    oddmod(ui)
                }
            }
            Value::Float(f) => hash_float(*f) as usize & mask,
            Value::Bool(b) => (*b as usize) & mask,
            Value::Str(s) => {
                let so = self.str(*s);
                debug_assert!(so.short || so.has_hash);
                so.hash as usize & mask
            }
            Value::Native(f) => oddmod(*f as usize as u64),
            Value::LightUserData(p) => oddmod(*p as u64),
            other => {
                let r = other.as_gc_ref().expect("nil cannot be a table key");
                oddmod(r.index() as u64)
            }
        }
    }

    /// Main position of an already-stored node key (dead keys hash by the
    /// retained object identity).
    fn main_position_of_node(&self, tb: &TableObj, key: &NodeKey) -> usize {
        match key {
            NodeKey::Key(v) => self.main_position(tb, v),
            NodeKey::Dead(r) => {
                let mask = tb.nodes.len() - 1;
                (r.index() as u64 % ((mask | 1) as u64)) as usize
            }
            NodeKey::Nil => unreachable!("free slot has no main position"),
        }
    }

    /// Raw key equality between a stored node key and a probe key. Floats
    /// with integral values were normalised to integers beforehand, so an
    /// integer never equals a float here. `deadok` accepts dead keys whose
    /// retained identity matches a collectable probe.
    fn node_key_eq(&self, stored: &NodeKey, key: &Value, deadok: bool) -> bool {
        match stored {
            NodeKey::Nil => false,
            NodeKey::Dead(r) => deadok && key.as_gc_ref() == Some(*r),
            NodeKey::Key(s) => match (s, key) {
                (Value::Int(a), Value::Int(b)) => a == b,
                (Value::Float(a), Value::Float(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
                (Value::Native(a), Value::Native(b)) => *a as usize == *b as usize,
                (Value::Str(a), Value::Str(b)) => self.str_eq(*a, *b),
                _ => {
                    s.type_tag() == key.type_tag() && s.as_gc_ref().is_some()
                        && s.as_gc_ref() == key.as_gc_ref()
                }
            },
        }
    }

    /// Normalise a probe key: integral floats become integers, long-string
    /// hashes are forced.
    fn prepare_key(&mut self, key: Value) -> Value {
        match key {
            Value::Float(f) => match flt_to_int(f, F2I::Exact) {
                Some(i) => Value::Int(i),
                None => key,
            },
            Value::Str(s) => {
                if !self.str(s).short {
                    self.str_force_hash(s);
                }
                key
            }
            _ => key,
        }
    }

    fn probe(&self, tb: &TableObj, key: &Value, deadok: bool) -> Probe {
        if tb.nodes.is_empty() {
            return Probe::Absent;
        }
        let mut i = self.main_position(tb, key);
        loop {
            let n = &tb.nodes[i];
            if self.node_key_eq(&n.key, key, deadok) {
                return Probe::At(i);
            }
            if n.next == 0 {
                return Probe::Absent;
            }
            i = (i as i64 + n.next as i64) as usize;
        }
    }

    /// Raw lookup. Returns `None` for both absent keys and empty slots.
    pub fn table_get(&mut self, t: GcTable, key: Value) -> Option<Value> {
        if key.is_nil() {
            return None;
        }
        let key = self.prepare_key(key);
        match self.probe(self.table(t), &key, false) {
            Probe::At(i) => self.table(t).nodes[i].val,
            Probe::Absent => None,
        }
    }

    /// Lookup with an interned short-string key; no mutation needed.
    pub fn table_get_str(&self, t: GcTable, key: GcStr) -> Option<Value> {
        debug_assert!(self.str(key).short);
        match self.probe(self.table(t), &Value::Str(key), false) {
            Probe::At(i) => self.table(t).nodes[i].val,
            Probe::Absent => None,
        }
    }

    /// Pre-set: overwrite an existing value (`Pset::Ok`), or tell the caller
    /// how to complete the insertion once the key is validated.
    pub fn table_pset(&mut self, t: GcTable, key: Value, val: Value) -> Pset {
        if key.is_nil() {
            return Pset::NotFound;
        }
        let key = self.prepare_key(key);
        match self.probe(self.table(t), &key, false) {
            Probe::Absent => Pset::NotFound,
            Probe::At(i) => {
                if self.table(t).nodes[i].val.is_some() {
                    // storing nil empties the slot but keeps the key
                    self.table_mut(t).nodes[i].val =
                        if val.is_nil() { None } else { Some(val) };
                    Pset::Ok
                } else {
                    Pset::Slot(i)
                }
            }
        }
    }

    /// Complete a set whose pre-set did not succeed. Validates the key
    /// (nil and NaN are rejected), inserts, and rehashes when full.
    ///
    /// The caller is responsible for the value write barrier and, when the
    /// table may be a metatable, for invalidating its metamethod cache.
    pub fn table_finish_set(
        &mut self,
        t: GcTable,
        key: Value,
        val: Value,
        code: Pset,
    ) -> VmResult<()> {
        match code {
            Pset::Ok => Ok(()),
            Pset::Slot(i) => {
                self.table_mut(t).nodes[i].val =
                    if val.is_nil() { None } else { Some(val) };
                Ok(())
            }
            Pset::NotFound => {
                let key = match key {
                    Value::Nil => return Err(VmError::runtime("table index is nil")),
                    Value::Float(f) if f.is_nan() => {
                        return Err(VmError::runtime("table index is NaN"))
                    }
                    other => self.prepare_key(other),
                };
                if val.is_nil() {
                    return Ok(()); // never insert nil values
                }
                if !self.table_insert(t, key, val) {
                    self.table_rehash(t)?;
                    let done = self.table_insert(t, key, val);
                    debug_assert!(done);
                }
                if key.is_collectable() {
                    self.barrier_back(t.raw());
                }
                Ok(())
            }
        }
    }

    /// Raw set: pre-set then finish.
    pub fn table_set(&mut self, t: GcTable, key: Value, val: Value) -> VmResult<()> {
        match self.table_pset(t, key, val) {
            Pset::Ok => Ok(()),
            code => self.table_finish_set(t, key, val, code),
        }
    }

    /// Find a never-used slot, scanning the free cursor downward.
    fn table_free_pos(&mut self, t: GcTable) -> Option<usize> {
        let tb = self.table_mut(t);
        while tb.lastfree > 0 {
            tb.lastfree -= 1;
            let i = tb.lastfree;
            if matches!(tb.nodes[i].key, NodeKey::Nil) {
                return Some(i);
            }
        }
        None
    }

    /// Insert a key known to be absent. Returns false when no free slot
    /// remains and the caller must rehash.
    fn table_insert(&mut self, t: GcTable, key: Value, val: Value) -> bool {
        if self.table(t).is_dummy() {
            return false;
        }
        let mp = self.main_position(self.table(t), &key);
        let occupied = self.table(t).nodes[mp].val.is_some();
        if occupied {
            let Some(f) = self.table_free_pos(t) else {
                return false;
            };
            let colliding = self.table(t).nodes[mp].key;
            let othern = self.main_position_of_node(self.table(t), &colliding);
            if othern != mp {
                // colliding node is astray: evict it to the free slot
                let mut prev = othern;
                loop {
                    let next = self.table(t).nodes[prev].next;
                    let target = (prev as i64 + next as i64) as usize;
                    if target == mp {
                        break;
                    }
                    prev = target;
                }
                let tb = self.table_mut(t);
                tb.nodes[prev].next = (f as i64 - prev as i64) as i32;
                let mut moved = tb.nodes[mp];
                if moved.next != 0 {
                    moved.next += (mp as i64 - f as i64) as i32;
                }
                tb.nodes[f] = moved;
                tb.nodes[mp] = Node {
                    key: NodeKey::Key(key),
                    val: Some(val),
                    next: 0,
                };
            } else {
                // colliding node owns its main position: chain after it
                let tb = self.table_mut(t);
                let mp_next = tb.nodes[mp].next;
                if mp_next != 0 {
                    tb.nodes[f].next = ((mp as i64 + mp_next as i64) - f as i64) as i32;
                } else {
                    debug_assert_eq!(tb.nodes[f].next, 0);
                }
                tb.nodes[mp].next = (f as i64 - mp as i64) as i32;
                tb.nodes[f].key = NodeKey::Key(key);
                tb.nodes[f].val = Some(val);
            }
        } else {
            // main position has an empty value: reuse it, keeping the chain
            let tb = self.table_mut(t);
            tb.nodes[mp].key = NodeKey::Key(key);
            tb.nodes[mp].val = Some(val);
        }
        true
    }

    /// Grow to hold the current population plus one.
    fn table_rehash(&mut self, t: GcTable) -> VmResult<()> {
        let count = self.table_len(t) + 1;
        self.table_resize(t, count)
    }

    /// Resize the node array to a power of two holding at least `want`
    /// entries, reinserting every non-empty node.
    pub fn table_resize(&mut self, t: GcTable, want: usize) -> VmResult<()> {
        let new_size = if want == 0 {
            0
        } else {
            let sz = want.max(MIN_TABLE_SIZE).next_power_of_two();
            if sz > MAX_TABLE_SIZE {
                return Err(VmError::runtime("table overflow"));
            }
            sz
        };
        let old_nodes = {
            let tb = self.table_mut(t);
            let old = std::mem::take(&mut tb.nodes);
            tb.nodes = vec![Node::FREE; new_size];
            tb.lastfree = new_size;
            old
        };
        self.account(
            new_size as isize * std::mem::size_of::<Node>() as isize
                - old_nodes.len() as isize * std::mem::size_of::<Node>() as isize,
        );
        for n in &old_nodes {
            if let Some(v) = n.val {
                let NodeKey::Key(k) = n.key else {
                    unreachable!("non-empty node with dead or free key");
                };
                let done = self.table_insert(t, k, v);
                debug_assert!(done);
            }
        }
        Ok(())
    }

    /// Number of key-(non-nil)value fields.
    pub fn table_len(&self, t: GcTable) -> usize {
        self.table(t).nodes.iter().filter(|n| n.val.is_some()).count()
    }

    /// Insert all non-empty fields of `src` into `dst` (shallow). The caller
    /// invalidates the destination's metamethod cache.
    pub fn table_copy(&mut self, dst: GcTable, src: GcTable) -> VmResult<()> {
        let need = self.table_len(src);
        if self.table(dst).size() < need {
            self.table_resize(dst, need)?;
        }
        let size = self.table(src).size();
        for i in 0..size {
            let n = self.table(src).nodes[i];
            if let (NodeKey::Key(k), Some(v)) = (n.key, n.val) {
                self.table_set(dst, k, v)?;
                self.barrier_back(dst.raw());
            }
        }
        Ok(())
    }

    /// Iteration step. `key` nil starts the traversal; otherwise it must be
    /// a key previously returned (dead keys are accepted as anchors).
    pub fn table_next(&mut self, t: GcTable, key: Value) -> VmResult<Option<(Value, Value)>> {
        let start = if key.is_nil() {
            0
        } else {
            let key = self.prepare_key(key);
            match self.probe(self.table(t), &key, true) {
                Probe::At(i) => i + 1,
                Probe::Absent => {
                    return Err(VmError::runtime("invalid key passed to 'next'"));
                }
            }
        };
        let tb = self.table(t);
        for i in start..tb.nodes.len() {
            if let Some(v) = tb.nodes[i].val {
                let NodeKey::Key(k) = tb.nodes[i].key else {
                    unreachable!("non-empty node with dead or free key");
                };
                return Ok(Some((k, v)));
            }
        }
        Ok(None)
    }
}
