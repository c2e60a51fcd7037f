//! Arena heap and incremental garbage collector.
//!
//! Collectable objects live in arena slots addressed by typed handles; the
//! collector is an incremental tri-colour mark-and-sweep with two alternating
//! white bits, a finaliser queue and an emergency full-collection path.
//! Gray sets are plain vectors of handles rather than intrusive lists, and
//! open upvalues reference stack slots by index, so reallocating the value
//! stack never invalidates them.
//!
//! States cycle `Pause -> Propagate -> EnterAtomic -> Atomic -> SweepAll ->
//! SweepFin -> SweepToFin -> SweepEnd -> CallFin -> Pause`. Allocations add
//! their byte estimate to a signed debt counter; when the debt turns
//! positive a step runs at the next safe point and pays it off in units of
//! bytes visited.

use std::collections::VecDeque;

use crate::error::{VmError, VmResult};
use crate::meta::Mm;
use crate::object::string::{FIRST_LF_TAG, FIRST_MM_TAG, MAX_SHORT_LEN};
use crate::object::{
    ClassObj, ClosureObj, InstanceObj, ListObj, MethodObj, NativeClosureObj, NodeKey, StrObj,
    TableObj, UpvalObj, UpvalState, UserDataObj,
};
use crate::proto::Proto;
use crate::state::State;
use crate::value::Value;

/* {====================================================================
** Handles
** ==================================================================== */

/// Untyped handle to an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef(u32);

impl GcRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

macro_rules! typed_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) GcRef);

        impl $name {
            /// Underlying untyped handle.
            pub fn raw(self) -> GcRef {
                self.0
            }
        }
    };
}

typed_handle!(/** Handle to a string object. */ GcStr);
typed_handle!(/** Handle to a table object. */ GcTable);
typed_handle!(/** Handle to a list object. */ GcList);
typed_handle!(/** Handle to a class object. */ GcClass);
typed_handle!(/** Handle to an instance object. */ GcInstance);
typed_handle!(/** Handle to a bound-method object. */ GcMethod);
typed_handle!(/** Handle to a script closure. */ GcClosure);
typed_handle!(/** Handle to a native closure. */ GcNativeClosure);
typed_handle!(/** Handle to a userdata object. */ GcUserData);
typed_handle!(/** Handle to an upvalue object. */ GcUpval);
typed_handle!(/** Handle to a function prototype. */ GcProto);
typed_handle!(/** Handle to a thread object. */ GcThread);

/* }==================================================================== */

/* {====================================================================
** Object storage
** ==================================================================== */

/// Payload of an arena slot.
#[derive(Debug)]
pub(crate) enum ObjData {
    Str(StrObj),
    Table(TableObj),
    List(ListObj),
    Class(ClassObj),
    Instance(InstanceObj),
    Method(MethodObj),
    Closure(ClosureObj),
    NativeClosure(NativeClosureObj),
    UserData(UserDataObj),
    Upval(UpvalObj),
    Proto(Proto),
    Thread,
}

// mark-byte bits
const WHITE0: u8 = 1 << 0;
const WHITE1: u8 = 1 << 1;
const BLACK: u8 = 1 << 2;
/// Object has a pending finaliser registration.
const FINALIZER: u8 = 1 << 3;
/// Object is queued for finalisation.
const PENDING: u8 = 1 << 4;
/// Object is never collected (reserved names, the memory-error string).
const FIXED: u8 = 1 << 5;

const WHITE_BITS: u8 = WHITE0 | WHITE1;
const COLOR_BITS: u8 = WHITE_BITS | BLACK;

#[derive(Debug)]
pub(crate) struct GcObj {
    pub(crate) mark: u8,
    pub(crate) data: ObjData,
}

/// Collector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    EnterAtomic,
    Atomic,
    SweepAll,
    SweepFin,
    SweepToFin,
    SweepEnd,
    CallFin,
}

bitflags::bitflags! {
    /// Why the collector is not running.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcStop: u8 {
        /// Stopped by the collector itself (during finalisers).
        const SELF = 1 << 0;
        /// Stopped by the host.
        const USER = 1 << 1;
    }
}

/// Default pause: start a new cycle when memory doubles (percent).
pub const GC_PAUSE: u32 = 200;
/// Default step multiplier (percent).
pub const GC_STEP_MUL: u32 = 100;
/// Default log2 of the step size in bytes (4 KiB).
pub const GC_STEP_SIZE_LOG2: u32 = 12;

/// Finalisers run per `CallFin` step.
const FINALIZERS_PER_STEP: usize = 4;

/// Rows in the direct-mapped string cache.
const STR_CACHE_N: usize = 53;
/// Ways per row.
const STR_CACHE_M: usize = 2;

/// Initial bucket count of the string intern table.
const MIN_STRTAB_SIZE: usize = 64;
/// Bucket-count ceiling.
const MAX_STRTAB_SIZE: usize = 1 << 24;

#[derive(Debug, Default)]
pub(crate) struct StringTable {
    pub(crate) buckets: Vec<Vec<GcStr>>,
    pub(crate) nuse: usize,
}

/* }==================================================================== */

/// The object arena plus all collector bookkeeping shared by a state.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<GcObj>>,
    free: Vec<u32>,

    // collector
    white: u8,
    pub(crate) state: GcState,
    pub(crate) stop: GcStop,
    pub(crate) emergency: bool,
    gray: Vec<GcRef>,
    grayagain: Vec<GcRef>,
    fin: Vec<GcRef>,
    tobefin: VecDeque<GcRef>,
    sweep_pos: usize,

    // accounting
    pub(crate) debt: isize,
    total: usize,
    estimate: usize,
    pub(crate) pause: u32,
    pub(crate) step_mul: u32,
    pub(crate) step_size_log2: u32,
    pub(crate) memory_limit: Option<usize>,

    // strings
    pub(crate) seed: u64,
    strings: StringTable,
    cache: [[Option<GcStr>; STR_CACHE_M]; STR_CACHE_N],
    pub(crate) memerr: Option<GcStr>,
    pub(crate) mm_names: Vec<GcStr>,
    pub(crate) lf_names: Vec<GcStr>,
}

impl Heap {
    /// Create an empty heap. `seed` randomises string hashing.
    pub fn new(seed: u64) -> Self {
        let mut heap = Heap {
            slots: Vec::new(),
            free: Vec::new(),
            white: WHITE0,
            state: GcState::Pause,
            stop: GcStop::empty(),
            emergency: false,
            gray: Vec::new(),
            grayagain: Vec::new(),
            fin: Vec::new(),
            tobefin: VecDeque::new(),
            sweep_pos: 0,
            debt: 0,
            total: 0,
            estimate: 0,
            pause: GC_PAUSE,
            step_mul: GC_STEP_MUL,
            step_size_log2: GC_STEP_SIZE_LOG2,
            memory_limit: None,
            seed,
            strings: StringTable {
                buckets: vec![Vec::new(); MIN_STRTAB_SIZE],
                nuse: 0,
            },
            cache: [[None; STR_CACHE_M]; STR_CACHE_N],
            memerr: None,
            mm_names: Vec::new(),
            lf_names: Vec::new(),
        };
        let memerr = heap.new_string(b"out of memory");
        heap.fix_object(memerr.raw());
        heap.memerr = Some(memerr);
        heap.cache = [[Some(memerr); STR_CACHE_M]; STR_CACHE_N];
        heap
    }

    /// Intern the metamethod and list-field names and tag their `extra`
    /// bytes. Idempotent.
    pub fn init_reserved_names(&mut self) {
        if !self.mm_names.is_empty() {
            return;
        }
        for (i, name) in Mm::NAMES.iter().enumerate() {
            let s = self.new_string(name.as_bytes());
            self.str_mut(s).extra = FIRST_MM_TAG + i as u8;
            self.fix_object(s.raw());
            self.mm_names.push(s);
        }
        for (i, name) in crate::object::list::LIST_FIELD_NAMES.iter().enumerate() {
            let s = self.new_string(name.as_bytes());
            self.str_mut(s).extra = FIRST_LF_TAG + i as u8;
            self.fix_object(s.raw());
            self.lf_names.push(s);
        }
    }

    /* {================================================================
    ** Accessors
    ** ================================================================ */

    pub(crate) fn obj(&self, r: GcRef) -> &GcObj {
        self.slots[r.index()].as_ref().expect("dangling gc handle")
    }

    pub(crate) fn obj_mut(&mut self, r: GcRef) -> &mut GcObj {
        self.slots[r.index()].as_mut().expect("dangling gc handle")
    }

    pub(crate) fn contains(&self, r: GcRef) -> bool {
        self.slots.get(r.index()).map_or(false, Option::is_some)
    }

    /* }================================================================ */

    fn alloc(&mut self, data: ObjData) -> GcRef {
        let size = obj_size(&data);
        self.account(size as isize);
        let obj = GcObj {
            mark: self.white,
            data,
        };
        match self.free.pop() {
            Some(i) => {
                debug_assert!(self.slots[i as usize].is_none());
                self.slots[i as usize] = Some(obj);
                GcRef(i)
            }
            None => {
                self.slots.push(Some(obj));
                GcRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Adjust the byte accounting by `delta` (object growth or shrink).
    pub(crate) fn account(&mut self, delta: isize) {
        self.total = (self.total as isize + delta).max(0) as usize;
        self.debt += delta;
    }

    /// Total bytes currently accounted to the heap.
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Set the debt directly (used when scheduling the next cycle).
    pub(crate) fn set_debt(&mut self, debt: isize) {
        self.debt = debt;
    }

    fn free_object(&mut self, r: GcRef) {
        let obj = self.slots[r.index()].take().expect("double free");
        // interned strings leave the intern table with their object
        if let ObjData::Str(ref s) = obj.data {
            if s.short {
                let mask = self.strings.buckets.len() - 1;
                let bucket = &mut self.strings.buckets[(s.hash as usize) & mask];
                if let Some(pos) = bucket.iter().position(|&h| h.raw() == r) {
                    bucket.swap_remove(pos);
                    self.strings.nuse -= 1;
                }
            }
        }
        self.account(-(obj_size(&obj.data) as isize));
        self.free.push(r.index() as u32);
    }

    /* {================================================================
    ** Colors and barriers
    ** ================================================================ */

    fn other_white(&self) -> u8 {
        self.white ^ WHITE_BITS
    }

    pub(crate) fn is_white(&self, r: GcRef) -> bool {
        self.obj(r).mark & WHITE_BITS != 0
    }

    pub(crate) fn is_black(&self, r: GcRef) -> bool {
        self.obj(r).mark & BLACK != 0
    }

    pub(crate) fn is_gray(&self, r: GcRef) -> bool {
        self.obj(r).mark & COLOR_BITS == 0
    }

    /// Dead-white in the current cycle: carries the non-current white bit.
    pub(crate) fn is_dead(&self, r: GcRef) -> bool {
        self.obj(r).mark & self.other_white() != 0
    }

    fn make_current_white(&mut self, r: GcRef) {
        let w = self.white;
        let m = &mut self.obj_mut(r).mark;
        *m = (*m & !COLOR_BITS) | w;
    }

    /// Pin an object: never collected, never recolored.
    pub(crate) fn fix_object(&mut self, r: GcRef) {
        let m = &mut self.obj_mut(r).mark;
        *m = (*m & !COLOR_BITS) | FIXED;
    }

    /// True while the invariant "black never points to white" must hold.
    fn keep_invariant(&self) -> bool {
        matches!(
            self.state,
            GcState::Pause | GcState::Propagate | GcState::EnterAtomic | GcState::Atomic
        )
    }

    /// Forward barrier: a black object is about to reference `v`.
    pub(crate) fn barrier(&mut self, owner: GcRef, v: Value) {
        if let Some(child) = v.as_gc_ref() {
            self.obj_barrier(owner, child);
        }
    }

    /// Forward barrier on an object edge.
    pub(crate) fn obj_barrier(&mut self, owner: GcRef, child: GcRef) {
        if self.is_black(owner) && self.is_white(child) {
            if self.keep_invariant() {
                self.mark_object(child);
            } else {
                // in a sweep phase: sweep the source back to current white
                self.make_current_white(owner);
            }
        }
    }

    /// Back barrier: re-queue a heavily mutated black object for remarking.
    pub(crate) fn barrier_back(&mut self, owner: GcRef) {
        if self.is_black(owner) {
            self.obj_mut(owner).mark &= !COLOR_BITS; // black to gray
            self.grayagain.push(owner);
        }
    }

    /* }================================================================ */

    /* {================================================================
    ** Marking
    ** ================================================================ */

    pub(crate) fn mark_value(&mut self, v: Value) {
        if let Some(r) = v.as_gc_ref() {
            self.mark_object(r);
        }
    }

    /// Mark an object reachable: leaves turn black immediately, aggregates
    /// go gray onto the work list.
    pub(crate) fn mark_object(&mut self, r: GcRef) {
        if !self.is_white(r) {
            return;
        }
        // leaves turn black at once; an upvalue carries at most one child
        let leaf: Option<Option<GcRef>> = match &self.obj(r).data {
            ObjData::Str(_) | ObjData::Thread => Some(None),
            ObjData::Upval(uv) => Some(match uv.state {
                UpvalState::Closed(v) => v.as_gc_ref(),
                UpvalState::Open(_) => None,
            }),
            _ => None,
        };
        match leaf {
            Some(child) => {
                let m = &mut self.obj_mut(r).mark;
                *m = (*m & !COLOR_BITS) | BLACK;
                if let Some(c) = child {
                    self.mark_object(c);
                }
            }
            None => {
                self.obj_mut(r).mark &= !COLOR_BITS; // gray
                self.gray.push(r);
            }
        }
    }

    /// Traverse one gray object, blackening it. Returns a work estimate.
    fn propagate_one(&mut self) -> usize {
        let Some(r) = self.gray.pop() else {
            return 0;
        };
        if !self.is_gray(r) {
            return 1;
        }
        self.obj_mut(r).mark |= BLACK;
        let work = obj_size(&self.obj(r).data);
        if matches!(self.obj(r).data, ObjData::Table(_)) {
            self.traverse_table(r);
            return work;
        }
        // collect the children under a shared borrow, then mark them
        let mut children: Vec<GcRef> = Vec::new();
        match &self.obj(r).data {
            ObjData::List(l) => {
                children.extend(l.arr.iter().filter_map(Value::as_gc_ref));
            }
            ObjData::Class(c) => {
                children.extend(
                    [
                        c.superclass.map(GcClass::raw),
                        c.metatable.map(GcTable::raw),
                        c.methods.map(GcTable::raw),
                    ]
                    .into_iter()
                    .flatten(),
                );
            }
            ObjData::Instance(i) => {
                children.push(i.class.raw());
                children.push(i.fields.raw());
            }
            ObjData::Method(m) => {
                children.extend(m.receiver.as_value().as_gc_ref());
                children.extend(m.method.as_gc_ref());
            }
            ObjData::Closure(c) => {
                children.push(c.proto.raw());
                children.extend(c.upvals.iter().map(|u| u.raw()));
            }
            ObjData::NativeClosure(c) => {
                children.extend(c.upvals.iter().filter_map(Value::as_gc_ref));
            }
            ObjData::UserData(u) => {
                children.extend(u.metatable.map(GcTable::raw));
                children.extend(u.uservalues.iter().filter_map(Value::as_gc_ref));
            }
            ObjData::Proto(p) => {
                children.extend(p.consts.iter().filter_map(Value::as_gc_ref));
                children.extend(p.protos.iter().map(|pr| pr.raw()));
                children.extend(p.source.map(GcStr::raw));
                children.extend(p.upvals.iter().filter_map(|u| u.name.map(GcStr::raw)));
                children.extend(p.locals.iter().map(|l| l.name.raw()));
            }
            ObjData::Table(_) | ObjData::Str(_) | ObjData::Upval(_) | ObjData::Thread => {
                unreachable!("leaf on the gray list")
            }
        }
        for c in children {
            self.mark_object(c);
        }
        work
    }

    /// Mark a table's entries. Empty-valued nodes with collectable keys are
    /// turned into dead keys so the chain survives while the key may be
    /// reclaimed.
    fn traverse_table(&mut self, r: GcRef) {
        let t = GcTable(r);
        let size = self.table(t).nodes.len();
        for i in 0..size {
            let node = self.table(t).nodes[i];
            match node.val {
                None => {
                    if let NodeKey::Key(k) = node.key {
                        if let Some(kr) = k.as_gc_ref() {
                            self.table_mut(t).nodes[i].key = NodeKey::Dead(kr);
                        }
                    }
                }
                Some(v) => {
                    if let NodeKey::Key(k) = node.key {
                        self.mark_value(k);
                    }
                    self.mark_value(v);
                }
            }
        }
    }

    /* }================================================================ */

    /* {================================================================
    ** Finalisers
    ** ================================================================ */

    /// Register `obj` for finalisation if `metatable` defines `__gc` and the
    /// object was not registered before.
    pub(crate) fn check_fin(&mut self, obj: GcRef, metatable: Option<GcTable>) {
        let Some(mt) = metatable else { return };
        if self.obj(obj).mark & FINALIZER != 0 {
            return;
        }
        let gc_name = self.mm_names[Mm::Gc as usize];
        if self.table_get_str(mt, gc_name).is_some() {
            self.obj_mut(obj).mark |= FINALIZER;
            self.fin.push(obj);
        }
    }

    /// At the end of atomic: unreachable finalisable objects move to the
    /// pending queue and are resurrected.
    fn separate_tobefin(&mut self) {
        let mut keep = Vec::with_capacity(self.fin.len());
        let fin = std::mem::take(&mut self.fin);
        for r in fin {
            if self.is_white(r) {
                self.obj_mut(r).mark = (self.obj(r).mark & !COLOR_BITS) | FINALIZER | PENDING;
                self.mark_object_for_fin(r);
                self.tobefin.push_back(r);
            } else {
                keep.push(r);
            }
        }
        self.fin = keep;
    }

    fn mark_object_for_fin(&mut self, r: GcRef) {
        // resurrect: the object and everything it references must survive
        // until the finaliser runs
        self.obj_mut(r).mark &= !COLOR_BITS;
        self.gray.push(r);
        while self.propagate_one() > 0 {}
    }

    /// Next object awaiting finalisation, if any.
    pub(crate) fn pop_tobefin(&mut self) -> Option<GcRef> {
        let r = self.tobefin.pop_front()?;
        // finalisers run once: drop both pending and registration bits
        self.obj_mut(r).mark &= !(PENDING | FINALIZER);
        Some(r)
    }

    /* }================================================================ */

    /* {================================================================
    ** Sweeping
    ** ================================================================ */

    /// Sweep up to `limit` slots; true when the pass completed.
    fn sweep_slots(&mut self, limit: usize) -> (bool, usize) {
        let end = (self.sweep_pos + limit).min(self.slots.len());
        let mut work = 0;
        for i in self.sweep_pos..end {
            let r = GcRef(i as u32);
            let Some(obj) = &self.slots[i] else { continue };
            work += 1;
            let mark = obj.mark;
            if mark & FIXED != 0 || mark & (FINALIZER | PENDING) != 0 {
                continue; // finalisable objects are swept in their own phase
            }
            if mark & self.other_white() != 0 {
                self.free_object(r);
            } else {
                self.make_current_white(r);
            }
        }
        self.sweep_pos = end;
        (end == self.slots.len(), work)
    }

    fn sweep_list(&mut self, which: &[GcRef]) {
        for &r in which {
            if self.contains(r) && self.obj(r).mark & FIXED == 0 {
                self.make_current_white(r);
            }
        }
    }

    /// Shrink auxiliary storage between cycles.
    fn sweep_end(&mut self) {
        let size = self.strings.buckets.len();
        if size > MIN_STRTAB_SIZE && self.strings.nuse < size / 4 {
            self.resize_string_table(size / 2);
            log::debug!("string table shrunk to {} buckets", size / 2);
        }
    }

    /* }================================================================ */

    /* {================================================================
    ** String interning
    ** ==================================================================*/

    /// Create (or find) a string. Short contents intern; long contents get
    /// a fresh object with a lazily-computed hash.
    pub fn new_string(&mut self, bytes: &[u8]) -> GcStr {
        if bytes.len() <= MAX_SHORT_LEN {
            self.intern_short(bytes)
        } else {
            GcStr(self.alloc(ObjData::Str(StrObj {
                bytes: bytes.into(),
                hash: 0,
                has_hash: false,
                short: false,
                extra: 0,
            })))
        }
    }

    fn intern_short(&mut self, bytes: &[u8]) -> GcStr {
        let hash = xxhash_rust::xxh3::xxh3_64_with_seed(bytes, self.seed);
        let mask = self.strings.buckets.len() - 1;
        let idx = (hash as usize) & mask;
        for k in 0..self.strings.buckets[idx].len() {
            let h = self.strings.buckets[idx][k];
            if self.str(h).bytes.as_ref() == bytes {
                if self.is_dead(h.raw()) {
                    // resurrect a string the current cycle already condemned
                    self.make_current_white(h.raw());
                }
                return h;
            }
        }
        if self.strings.nuse >= self.strings.buckets.len()
            && self.strings.buckets.len() < MAX_STRTAB_SIZE
        {
            let new_size = self.strings.buckets.len() * 2;
            self.resize_string_table(new_size);
        }
        let s = GcStr(self.alloc(ObjData::Str(StrObj {
            bytes: bytes.into(),
            hash,
            has_hash: true,
            short: true,
            extra: 0,
        })));
        let mask = self.strings.buckets.len() - 1;
        self.strings.buckets[(hash as usize) & mask].push(s);
        self.strings.nuse += 1;
        s
    }

    fn resize_string_table(&mut self, new_size: usize) {
        let old = std::mem::take(&mut self.strings.buckets);
        self.strings.buckets = vec![Vec::new(); new_size];
        let mask = new_size - 1;
        for bucket in old {
            for h in bucket {
                let idx = (self.str(h).hash as usize) & mask;
                self.strings.buckets[idx].push(h);
            }
        }
    }

    /// Number of interned short strings.
    pub fn string_table_len(&self) -> usize {
        self.strings.nuse
    }

    /// Cached lookup for host-supplied string slices, keyed by the slice's
    /// data address: hot for repeated lookups of the same literal.
    pub fn new_string_cached(&mut self, s: &str) -> GcStr {
        let key = s.as_ptr() as usize;
        let row = key % STR_CACHE_N;
        for way in 0..STR_CACHE_M {
            if let Some(h) = self.cache[row][way] {
                if self.contains(h.raw()) && self.str_bytes(h) == s.as_bytes() {
                    return h;
                }
            }
        }
        let h = self.new_string(s.as_bytes());
        self.cache[row].rotate_right(1);
        self.cache[row][0] = Some(h);
        h
    }

    /// Replace dead cache entries with the out-of-memory string so the
    /// cache never holds a condemned handle (run during atomic).
    fn scrub_string_cache(&mut self) {
        let memerr = self.memerr.expect("heap initialised");
        for row in 0..STR_CACHE_N {
            for way in 0..STR_CACHE_M {
                if let Some(h) = self.cache[row][way] {
                    if !self.contains(h.raw()) || self.is_white(h.raw()) {
                        self.cache[row][way] = Some(memerr);
                    }
                }
            }
        }
    }

    /* }================================================================ */

    /* {================================================================
    ** Typed constructors and accessors
    ** ==================================================================*/

    pub(crate) fn alloc_table(&mut self, t: TableObj) -> GcTable {
        GcTable(self.alloc(ObjData::Table(t)))
    }

    pub(crate) fn alloc_list(&mut self, l: ListObj) -> GcList {
        GcList(self.alloc(ObjData::List(l)))
    }

    pub(crate) fn alloc_class(&mut self, c: ClassObj) -> GcClass {
        GcClass(self.alloc(ObjData::Class(c)))
    }

    pub(crate) fn alloc_instance(&mut self, i: InstanceObj) -> GcInstance {
        GcInstance(self.alloc(ObjData::Instance(i)))
    }

    pub(crate) fn alloc_method(&mut self, m: MethodObj) -> GcMethod {
        GcMethod(self.alloc(ObjData::Method(m)))
    }

    pub(crate) fn alloc_closure(&mut self, c: ClosureObj) -> GcClosure {
        GcClosure(self.alloc(ObjData::Closure(c)))
    }

    pub(crate) fn alloc_native_closure(&mut self, c: NativeClosureObj) -> GcNativeClosure {
        GcNativeClosure(self.alloc(ObjData::NativeClosure(c)))
    }

    pub(crate) fn alloc_userdata(&mut self, u: UserDataObj) -> GcUserData {
        GcUserData(self.alloc(ObjData::UserData(u)))
    }

    pub(crate) fn alloc_upval(&mut self, u: UpvalObj) -> GcUpval {
        GcUpval(self.alloc(ObjData::Upval(u)))
    }

    /// Register an immutable prototype with the heap.
    pub fn alloc_proto(&mut self, p: Proto) -> GcProto {
        GcProto(self.alloc(ObjData::Proto(p)))
    }

    pub(crate) fn alloc_thread(&mut self) -> GcThread {
        GcThread(self.alloc(ObjData::Thread))
    }

    /* }================================================================ */
}

macro_rules! accessors {
    ($($get:ident, $get_mut:ident, $handle:ty, $obj:ty, $variant:ident;)*) => {
        impl Heap {
            $(
                #[doc = concat!("Borrow the object behind a `", stringify!($handle), "`.")]
                pub fn $get(&self, h: $handle) -> &$obj {
                    match &self.obj(h.raw()).data {
                        ObjData::$variant(o) => o,
                        other => panic!(
                            "handle type mismatch: expected {}, found {:?}",
                            stringify!($variant),
                            std::mem::discriminant(other)
                        ),
                    }
                }

                pub(crate) fn $get_mut(&mut self, h: $handle) -> &mut $obj {
                    match &mut self.obj_mut(h.raw()).data {
                        ObjData::$variant(o) => o,
                        _ => panic!("handle type mismatch: {}", stringify!($variant)),
                    }
                }
            )*
        }
    };
}

accessors! {
    str, str_mut, GcStr, StrObj, Str;
    table, table_mut, GcTable, TableObj, Table;
    list, list_mut, GcList, ListObj, List;
    class, class_mut, GcClass, ClassObj, Class;
    instance, instance_mut, GcInstance, InstanceObj, Instance;
    method, method_mut, GcMethod, MethodObj, Method;
    closure, closure_mut, GcClosure, ClosureObj, Closure;
    native_closure, native_closure_mut, GcNativeClosure, NativeClosureObj, NativeClosure;
    userdata, userdata_mut, GcUserData, UserDataObj, UserData;
    upval, upval_mut, GcUpval, UpvalObj, Upval;
    proto, proto_mut, GcProto, Proto, Proto;
}

/// Byte-size estimate of an object for debt accounting.
fn obj_size(data: &ObjData) -> usize {
    let base = std::mem::size_of::<GcObj>();
    base + match data {
        ObjData::Str(s) => s.bytes.len(),
        ObjData::Table(t) => t.nodes.len() * std::mem::size_of::<crate::object::Node>(),
        ObjData::List(l) => l.size * std::mem::size_of::<Value>(),
        ObjData::Closure(c) => c.upvals.len() * std::mem::size_of::<GcUpval>(),
        ObjData::NativeClosure(c) => c.upvals.len() * std::mem::size_of::<Value>(),
        ObjData::UserData(u) => {
            u.payload.len() + u.uservalues.len() * std::mem::size_of::<Value>()
        }
        ObjData::Proto(p) => {
            p.consts.len() * std::mem::size_of::<Value>()
                + p.code.len()
                + p.line_info.len()
                + p.inst_pc.len() * 4
        }
        _ => 0,
    }
}

/* {====================================================================
** Collection driver (needs the roots owned by the state)
** ==================================================================== */

impl State {
    /// True when the collector is allowed to make progress.
    pub fn gc_running(&self) -> bool {
        self.heap.stop.is_empty()
    }

    /// Safe point: run a collector step when the debt is positive, then
    /// enforce the soft memory limit (with an emergency collection before
    /// giving up).
    pub(crate) fn check_gc(&mut self) -> VmResult<()> {
        if self.heap.debt > 0 && self.gc_running() {
            self.gc_step()?;
        }
        if let Some(limit) = self.heap.memory_limit {
            if self.heap.total_bytes() > limit {
                self.gc_emergency();
                if self.heap.total_bytes() > limit {
                    return Err(VmError::Memory);
                }
            }
        }
        Ok(())
    }

    fn mark_roots(&mut self) {
        for i in 0..self.top {
            let v = self.stack[i];
            self.heap.mark_value(v);
        }
        for uv in self.open_upvals.clone() {
            self.heap.mark_object(uv.raw());
        }
        let (cl, ct, mt) = (self.c_list, self.c_table, self.main_thread);
        self.heap.mark_object(cl.raw());
        self.heap.mark_object(ct.raw());
        self.heap.mark_object(mt.raw());
    }

    /// One incremental step, bounded by the configured step size.
    pub fn gc_step(&mut self) -> VmResult<()> {
        let budget =
            ((1usize << self.heap.step_size_log2) * self.heap.step_mul as usize / 100).max(1);
        let mut work = 0usize;
        loop {
            match self.heap.state {
                GcState::Pause => {
                    log::trace!("gc cycle start ({} bytes)", self.heap.total_bytes());
                    self.mark_roots();
                    self.heap.state = GcState::Propagate;
                }
                GcState::Propagate => {
                    if self.heap.gray.is_empty() {
                        self.heap.state = GcState::EnterAtomic;
                    } else {
                        work += self.heap.propagate_one();
                    }
                }
                GcState::EnterAtomic | GcState::Atomic => {
                    work += self.gc_atomic();
                    self.heap.state = GcState::SweepAll;
                    self.heap.sweep_pos = 0;
                }
                GcState::SweepAll => {
                    let (done, w) = self.heap.sweep_slots(budget.saturating_sub(work).max(16));
                    work += w;
                    if done {
                        self.heap.state = GcState::SweepFin;
                    }
                }
                GcState::SweepFin => {
                    let fin = self.heap.fin.clone();
                    self.heap.sweep_list(&fin);
                    self.heap.state = GcState::SweepToFin;
                }
                GcState::SweepToFin => {
                    let tbf: Vec<GcRef> = self.heap.tobefin.iter().copied().collect();
                    self.heap.sweep_list(&tbf);
                    self.heap.state = GcState::SweepEnd;
                }
                GcState::SweepEnd => {
                    self.heap.sweep_end();
                    self.heap.state = if self.heap.tobefin.is_empty() {
                        GcState::Pause
                    } else {
                        GcState::CallFin
                    };
                }
                GcState::CallFin => {
                    if self.heap.tobefin.is_empty() || self.heap.emergency {
                        self.heap.state = GcState::Pause;
                    } else {
                        for _ in 0..FINALIZERS_PER_STEP {
                            if !self.run_one_finalizer()? {
                                break;
                            }
                            work += 1 << 6; // per-call charge
                        }
                    }
                }
            }
            if self.heap.state == GcState::Pause {
                self.gc_set_pause();
                log::trace!(
                    "gc cycle end ({} bytes live)",
                    self.heap.total_bytes()
                );
                break;
            }
            if work >= budget {
                self.heap.set_debt(-((1 << self.heap.step_size_log2) as isize));
                break;
            }
        }
        Ok(())
    }

    /// Atomic phase: remark roots and again-gray objects, scrub caches,
    /// separate pending finalisers, flip whites.
    fn gc_atomic(&mut self) -> usize {
        self.heap.state = GcState::Atomic;
        let mut work = 0;
        // thread stacks carry no write barriers; remark them here
        self.mark_roots();
        while !self.heap.gray.is_empty() {
            work += self.heap.propagate_one();
        }
        let again = std::mem::take(&mut self.heap.grayagain);
        for r in again {
            if self.heap.is_gray(r) {
                self.heap.gray.push(r);
            }
        }
        while !self.heap.gray.is_empty() {
            work += self.heap.propagate_one();
        }
        self.heap.scrub_string_cache();
        self.heap.separate_tobefin();
        while !self.heap.gray.is_empty() {
            work += self.heap.propagate_one();
        }
        // dead stack slots must not retain references
        for i in self.top..self.stack.len() {
            self.stack[i] = Value::Nil;
        }
        self.shrink_stack();
        self.heap.white = self.heap.other_white();
        self.heap.estimate = self.heap.total_bytes();
        work
    }

    /// Give back value-stack slack when usage dropped well below the
    /// allocation, keeping every frame ceiling addressable.
    fn shrink_stack(&mut self) {
        let needed = self
            .frames
            .iter()
            .map(|f| f.top)
            .max()
            .unwrap_or(0)
            .max(self.top)
            + crate::state::EXTRA_STACK;
        let floor = needed.max(crate::state::INIT_STACK_SIZE);
        if self.stack.len() > floor * 4 {
            self.stack.truncate(floor * 2);
            self.stack.shrink_to_fit();
        }
    }

    fn gc_set_pause(&mut self) {
        let threshold = self
            .heap
            .estimate
            .saturating_mul(self.heap.pause as usize)
            / 100;
        self.heap
            .set_debt(self.heap.total_bytes() as isize - threshold as isize);
    }

    /// Run a full collection cycle to completion.
    pub fn gc_full(&mut self) {
        if self.heap.state != GcState::Pause {
            self.gc_run_until_pause(); // finish the cycle in flight
        }
        self.gc_run_until_pause();
    }

    fn gc_run_until_pause(&mut self) {
        loop {
            let _ = self.gc_step();
            if self.heap.state == GcState::Pause {
                break;
            }
        }
    }

    /// Emergency collection: one full cycle with finalisers disabled,
    /// followed by releasing capacity slack from surviving lists.
    pub fn gc_emergency(&mut self) {
        log::debug!("emergency collection at {} bytes", self.heap.total_bytes());
        self.heap.emergency = true;
        self.gc_full();
        let lists: Vec<GcList> = (0..self.heap.slots.len() as u32)
            .filter(|&i| {
                matches!(
                    self.heap.slots[i as usize],
                    Some(GcObj {
                        data: ObjData::List(_),
                        ..
                    })
                )
            })
            .map(|i| GcList(GcRef(i)))
            .collect();
        for l in lists {
            self.heap.list_shrink(l);
        }
        self.heap.emergency = false;
    }

    /// Run one pending finaliser as a protected call with the collector
    /// paused; failures are reported to the warn hook.
    fn run_one_finalizer(&mut self) -> VmResult<bool> {
        let Some(r) = self.heap.pop_tobefin() else {
            return Ok(false);
        };
        let mt = match &self.heap.obj(r).data {
            ObjData::Instance(i) => self.heap.class(i.class).metatable,
            ObjData::UserData(u) => u.metatable,
            _ => None,
        };
        let Some(mt) = mt else { return Ok(true) };
        let gc_name = self.heap.mm_names[Mm::Gc as usize];
        let Some(f) = self.heap.table_get_str(mt, gc_name) else {
            return Ok(true);
        };
        let obj_value = match &self.heap.obj(r).data {
            ObjData::Instance(_) => Value::Instance(GcInstance(r)),
            ObjData::UserData(_) => Value::UserData(GcUserData(r)),
            _ => return Ok(true),
        };
        let prev_stop = self.heap.stop;
        self.heap.stop |= GcStop::SELF;
        self.push(f);
        self.push(obj_value);
        let status = self.protected_call_args(1, 0);
        self.heap.stop = prev_stop;
        if status != crate::error::Status::Ok {
            let msg = self.describe_top_error();
            self.pop_n(1);
            self.warn(&format!("error in __gc metamethod ({msg})"));
        }
        Ok(true)
    }
}

/* }==================================================================== */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_objects_are_current_white() {
        let mut heap = Heap::new(1);
        let t = heap.table_new();
        assert!(heap.is_white(t.raw()));
        assert!(!heap.is_dead(t.raw()));
    }

    #[test]
    fn test_fixed_objects_never_look_dead() {
        let mut heap = Heap::new(1);
        let memerr = heap.memerr.unwrap();
        assert!(!heap.is_dead(memerr.raw()));
        assert!(!heap.is_white(memerr.raw()));
    }

    #[test]
    fn test_accounting_tracks_alloc_and_free() {
        let mut heap = Heap::new(1);
        let before = heap.total_bytes();
        let s = heap.new_string(&[b'q'; 100]); // long, not interned
        assert!(heap.total_bytes() >= before + 100);
        heap.free_object(s.raw());
        assert_eq!(heap.total_bytes(), before);
    }

    #[test]
    fn test_string_table_usage_counts_shorts_only() {
        let mut heap = Heap::new(1);
        let n0 = heap.string_table_len();
        heap.new_string(b"short");
        heap.new_string(b"short"); // same object
        heap.new_string(&[b'l'; 60]); // long: not interned
        assert_eq!(heap.string_table_len(), n0 + 1);
    }
}
