//! Stack-oriented host API.
//!
//! Hosts talk to a state by pushing values, indexing the stack (positive
//! indices count from the current function's base, negative ones from the
//! top, pseudo indices reach the reserved list/table and native upvalues)
//! and invoking calls. Allocating entry points are collector safe points.

use crate::error::{VmError, VmResult};
use crate::gc::{GcStop, GcUserData};
use crate::proto::Proto;
use crate::state::State;
use crate::value::{NativeFn, TypeTag, Value};

/// Pseudo index of the reserved list.
pub const RESERVED_LIST_INDEX: i64 = -1_000_000;
/// Pseudo index of the reserved table.
pub const RESERVED_TABLE_INDEX: i64 = -1_000_001;

/// Pseudo index of native upvalue `i`.
pub fn upvalue_index(i: u32) -> i64 {
    RESERVED_TABLE_INDEX - 1 - i as i64
}

impl State {
    /* {================================================================
    ** Index resolution
    ** ================================================================ */

    fn api_base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.base())
    }

    /// Resolve an API index to a value.
    pub fn value_at(&self, idx: i64) -> Value {
        if idx <= RESERVED_LIST_INDEX {
            return match idx {
                RESERVED_LIST_INDEX => Value::List(self.c_list),
                RESERVED_TABLE_INDEX => Value::Table(self.c_table),
                _ => {
                    let i = (RESERVED_TABLE_INDEX - 1 - idx) as usize;
                    match self.frames.last().map(|f| self.stack[f.func]) {
                        Some(Value::NativeClosure(nc)) => self
                            .heap
                            .native_closure(nc)
                            .upvals
                            .get(i)
                            .copied()
                            .unwrap_or(Value::Nil),
                        _ => Value::Nil,
                    }
                }
            };
        }
        let abs = self.resolve_index(idx);
        match abs {
            Some(i) if i < self.top => self.stack[i],
            _ => Value::Nil,
        }
    }

    fn resolve_index(&self, idx: i64) -> Option<usize> {
        if idx >= 0 {
            Some(self.api_base() + idx as usize)
        } else {
            self.top.checked_sub(idx.unsigned_abs() as usize)
        }
    }

    /// Number of values above the current base.
    pub fn api_top(&self) -> usize {
        self.top - self.api_base()
    }

    /* }================================================================ */

    /* {================================================================
    ** Pushing
    ** ================================================================ */

    pub fn push_nil(&mut self) {
        self.push(Value::Nil);
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push(Value::Bool(b));
    }

    pub fn push_int(&mut self, i: i64) {
        self.push(Value::Int(i));
    }

    pub fn push_float(&mut self, f: f64) {
        self.push(Value::Float(f));
    }

    pub fn push_light_userdata(&mut self, p: usize) {
        self.push(Value::LightUserData(p));
    }

    /// Push a string (interning applies); the address-keyed cache makes
    /// repeated pushes of one literal cheap.
    pub fn push_string(&mut self, s: &str) -> VmResult<()> {
        self.check_gc()?;
        let h = self.heap.new_string_cached(s);
        self.push(Value::Str(h));
        Ok(())
    }

    /// Push arbitrary bytes as a string (embedded NULs preserved).
    pub fn push_bytes(&mut self, bytes: &[u8]) -> VmResult<()> {
        self.check_gc()?;
        let h = self.heap.new_string(bytes);
        self.push(Value::Str(h));
        Ok(())
    }

    /// Push a rendered format string.
    pub fn push_fmt(&mut self, args: std::fmt::Arguments<'_>) -> VmResult<()> {
        let s = args.to_string();
        self.push_bytes(s.as_bytes())
    }

    /// Push a light native function.
    pub fn push_native(&mut self, f: NativeFn) {
        self.push(Value::Native(f));
    }

    /// Pop `nup` values into the upvalues of a new native closure.
    pub fn push_native_closure(&mut self, f: NativeFn, nup: usize) -> VmResult<()> {
        self.check_gc()?;
        debug_assert!(self.api_top() >= nup);
        let first = self.top - nup;
        let upvals = self.stack[first..self.top].to_vec();
        self.pop_n(nup);
        let nc = self.heap.native_closure_new(f, upvals);
        self.push(Value::NativeClosure(nc));
        Ok(())
    }

    /// Push a new table with a capacity hint.
    pub fn push_table(&mut self, capacity: usize) -> VmResult<()> {
        self.check_gc()?;
        let t = self.heap.table_new();
        self.push(Value::Table(t));
        if capacity > 0 {
            self.heap.table_resize(t, capacity)?;
        }
        Ok(())
    }

    /// Push a new list with a capacity hint.
    pub fn push_list(&mut self, capacity: usize) -> VmResult<()> {
        self.check_gc()?;
        let l = self.heap.list_new();
        self.push(Value::List(l));
        if capacity > 0 {
            self.heap.list_ensure(l, capacity);
        }
        Ok(())
    }

    /// Push a new class (no metatable, no methods).
    pub fn push_class(&mut self) -> VmResult<()> {
        self.check_gc()?;
        let c = self.heap.class_new();
        self.push(Value::Class(c));
        Ok(())
    }

    /// Push an instance of the class at `class_idx`.
    pub fn push_instance(&mut self, class_idx: i64) -> VmResult<()> {
        self.check_gc()?;
        let Value::Class(cls) = self.value_at(class_idx) else {
            return Err(VmError::runtime("expected a class"));
        };
        let mt = self.heap.class(cls).metatable;
        let ins = self.heap.instance_new(cls);
        self.heap.check_fin(ins.raw(), mt);
        self.push(Value::Instance(ins));
        Ok(())
    }

    /// Pop a value into the method table of the class at `class_idx`,
    /// creating the table on first use.
    pub fn class_add_method(&mut self, class_idx: i64, name: &str) -> VmResult<()> {
        let Value::Class(cls) = self.value_at(class_idx) else {
            return Err(VmError::runtime("expected a class"));
        };
        let key = Value::Str(self.heap.new_string_cached(name));
        let v = self.pop();
        let methods = match self.heap.class(cls).methods {
            Some(t) => t,
            None => {
                let t = self.heap.table_new();
                self.heap.class_mut(cls).methods = Some(t);
                self.heap.obj_barrier(cls.raw(), t.raw());
                t
            }
        };
        self.heap.table_set(methods, key, v)?;
        self.heap.barrier_back(methods.raw());
        self.heap.table_mut(methods).invalidate_mm_cache();
        Ok(())
    }

    /// Pop a value into the metatable of the class at `class_idx`,
    /// creating the metatable on first use. Registers the class's future
    /// instances for finalisation when `name` is `__gc`.
    pub fn class_set_metafield(&mut self, class_idx: i64, name: &str) -> VmResult<()> {
        let Value::Class(cls) = self.value_at(class_idx) else {
            return Err(VmError::runtime("expected a class"));
        };
        let key = Value::Str(self.heap.new_string_cached(name));
        let v = self.pop();
        let mt = match self.heap.class(cls).metatable {
            Some(t) => t,
            None => {
                let t = self.heap.table_new();
                self.heap.class_mut(cls).metatable = Some(t);
                self.heap.obj_barrier(cls.raw(), t.raw());
                t
            }
        };
        self.heap.table_set(mt, key, v)?;
        self.heap.barrier_back(mt.raw());
        self.heap.table_mut(mt).invalidate_mm_cache();
        Ok(())
    }

    /// Push userdata with a zeroed payload and `nuv` user values.
    pub fn push_userdata(&mut self, size: usize, nuv: u16) -> VmResult<GcUserData> {
        self.check_gc()?;
        let u = self.heap.userdata_new(size, nuv);
        self.push(Value::UserData(u));
        Ok(u)
    }

    /// Pop a value into user-value slot `n` of the userdata at `idx`.
    pub fn set_uservalue(&mut self, idx: i64, n: u16) -> VmResult<()> {
        let Value::UserData(u) = self.value_at(idx) else {
            return Err(VmError::runtime("expected userdata"));
        };
        let v = self.pop();
        let slot = self
            .heap
            .userdata_mut(u)
            .uservalues
            .get_mut(n as usize)
            .ok_or_else(|| VmError::runtime("user value index out of range"))?;
        *slot = v;
        self.heap.barrier_back(u.raw());
        Ok(())
    }

    /// Push user-value slot `n` of the userdata at `idx`.
    pub fn get_uservalue(&mut self, idx: i64, n: u16) -> VmResult<()> {
        let Value::UserData(u) = self.value_at(idx) else {
            return Err(VmError::runtime("expected userdata"));
        };
        let v = self
            .heap
            .userdata(u)
            .uservalues
            .get(n as usize)
            .copied()
            .ok_or_else(|| VmError::runtime("user value index out of range"))?;
        self.push(v);
        Ok(())
    }

    /// Pop a table into the metatable slot of the userdata at `idx`,
    /// registering it for finalisation when the table defines `__gc`.
    pub fn set_userdata_metatable(&mut self, idx: i64) -> VmResult<()> {
        let Value::UserData(u) = self.value_at(idx) else {
            return Err(VmError::runtime("expected userdata"));
        };
        let mt = match self.pop() {
            Value::Table(t) => Some(t),
            Value::Nil => None,
            _ => return Err(VmError::runtime("expected a table or nil")),
        };
        self.heap.userdata_mut(u).metatable = mt;
        if let Some(t) = mt {
            self.heap.obj_barrier(u.raw(), t.raw());
            self.heap.check_fin(u.raw(), Some(t));
        }
        Ok(())
    }

    /// Push the metatable of the userdata at `idx` (or nil).
    pub fn get_userdata_metatable(&mut self, idx: i64) -> VmResult<()> {
        let Value::UserData(u) = self.value_at(idx) else {
            return Err(VmError::runtime("expected userdata"));
        };
        let v = match self.heap.userdata(u).metatable {
            Some(t) => Value::Table(t),
            None => Value::Nil,
        };
        self.push(v);
        Ok(())
    }

    /// Register a prototype and push its closure.
    ///
    /// The safe point comes after the push: constants the host created
    /// while assembling the prototype become reachable through it before
    /// the collector may step.
    pub fn push_proto(&mut self, proto: Proto) -> VmResult<()> {
        let nup = proto.upvals.len();
        let p = self.heap.alloc_proto(proto);
        let cl = self.heap.closure_new(p, nup);
        self.push(Value::Closure(cl));
        self.check_gc()
    }

    /// Push a copy of the value at `idx`.
    pub fn push_value(&mut self, idx: i64) {
        let v = self.value_at(idx);
        self.push(v);
    }

    /// Pop `n` values.
    pub fn pop_values(&mut self, n: usize) {
        self.pop_n(n);
    }

    /* }================================================================ */

    /* {================================================================
    ** Reading
    ** ================================================================ */

    pub fn type_of(&self, idx: i64) -> TypeTag {
        self.value_at(idx).type_tag()
    }

    pub fn is_nil(&self, idx: i64) -> bool {
        self.value_at(idx).is_nil()
    }

    pub fn to_bool(&self, idx: i64) -> bool {
        !self.value_at(idx).is_falsey()
    }

    pub fn to_int(&self, idx: i64) -> Option<i64> {
        crate::vm::to_integer(&self.heap, self.value_at(idx))
    }

    pub fn to_float(&self, idx: i64) -> Option<f64> {
        crate::vm::to_float(&self.heap, self.value_at(idx))
    }

    /// String contents, without coercion.
    pub fn to_str(&self, idx: i64) -> Option<String> {
        match self.value_at(idx) {
            Value::Str(s) => Some(self.heap.str_display(s).into_owned()),
            _ => None,
        }
    }

    /// Render the value at `idx` for display: numbers format, strings pass
    /// through, other values show their type name.
    pub fn stringify(&mut self, idx: i64) -> String {
        let v = self.value_at(idx);
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(_) | Value::Float(_) => {
                crate::strings::number_to_string(v).expect("number")
            }
            Value::Str(s) => self.heap.str_display(s).into_owned(),
            other => {
                let name = self.heap.type_name_of(other);
                format!("<{name}>")
            }
        }
    }

    /* }================================================================ */

    /* {================================================================
    ** Globals, fields and iteration
    ** ================================================================ */

    /// Push the global named `name`.
    pub fn get_global(&mut self, name: &str) -> VmResult<()> {
        let g = self.globals();
        let key = self.heap.new_string_cached(name);
        let v = self.heap.table_get(g, Value::Str(key)).unwrap_or(Value::Nil);
        self.push(v);
        Ok(())
    }

    /// Pop a value and store it as the global named `name`.
    pub fn set_global(&mut self, name: &str) -> VmResult<()> {
        let g = self.globals();
        let key = self.heap.new_string_cached(name);
        let v = self.pop();
        self.heap.table_set(g, Value::Str(key), v)?;
        self.heap.barrier_back(g.raw());
        Ok(())
    }

    /// Push `collection[key]` where the key is on top (replaced in place),
    /// honouring metamethods.
    pub fn get_index(&mut self, idx: i64) -> VmResult<()> {
        let obj = self.value_at(idx);
        let key = self.pop();
        let v = self.index_get(obj, key)?;
        self.push(v);
        Ok(())
    }

    /// `collection[key] = value` with key and value on top (both popped),
    /// honouring metamethods.
    pub fn set_index(&mut self, idx: i64) -> VmResult<()> {
        let obj = self.value_at(idx);
        let v = self.pop();
        let key = self.pop();
        self.index_set(obj, key, v)
    }

    /// Field read by name, honouring metamethods.
    pub fn get_field(&mut self, idx: i64, name: &str) -> VmResult<()> {
        let obj = self.value_at(idx);
        let key = Value::Str(self.heap.new_string_cached(name));
        let v = self.index_get(obj, key)?;
        self.push(v);
        Ok(())
    }

    /// Field write by name; the value is popped.
    pub fn set_field(&mut self, idx: i64, name: &str) -> VmResult<()> {
        let obj = self.value_at(idx);
        let key = Value::Str(self.heap.new_string_cached(name));
        let v = self.pop();
        self.index_set(obj, key, v)
    }

    /// Table iteration step: pops a key, pushes the next key/value pair and
    /// returns true, or pushes nothing at the end.
    pub fn next_field(&mut self, idx: i64) -> VmResult<bool> {
        let Value::Table(t) = self.value_at(idx) else {
            return Err(VmError::runtime("expected a table"));
        };
        let key = self.pop();
        match self.heap.table_next(t, key)? {
            Some((k, v)) => {
                self.push(k);
                self.push(v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Length of the value at `idx`: string bytes, list length, table
    /// population.
    pub fn length_of(&mut self, idx: i64) -> VmResult<i64> {
        match self.value_at(idx) {
            Value::Str(s) => Ok(self.heap.str(s).len() as i64),
            Value::List(l) => Ok(self.heap.list(l).len() as i64),
            Value::Table(t) => Ok(self.heap.table_len(t) as i64),
            other => {
                let tn = self.heap.type_name_of(other);
                Err(VmError::runtime(format!(
                    "attempt to get length of a {tn} value"
                )))
            }
        }
    }

    /// Concatenate the top `n` values, leaving one.
    pub fn concat_values(&mut self, n: usize) -> VmResult<()> {
        if n == 0 {
            return self.push_bytes(b"");
        }
        self.concat(n)?;
        self.check_gc()
    }

    /* }================================================================ */

    /* {================================================================
    ** Collector control
    ** ================================================================ */

    pub fn gc_stop(&mut self) {
        self.heap.stop |= GcStop::USER;
    }

    pub fn gc_restart(&mut self) {
        self.heap.stop.remove(GcStop::USER);
    }

    pub fn gc_is_running(&self) -> bool {
        self.gc_running()
    }

    /// Run the collector for roughly `kbytes` of work (0 = one basic step).
    pub fn gc_step_kbytes(&mut self, kbytes: usize) -> VmResult<()> {
        let saved = self.heap.debt;
        self.heap.set_debt((kbytes.max(1) * 1024) as isize);
        let r = self.gc_step();
        if self.heap.debt > 0 {
            self.heap.set_debt(saved.min(0));
        }
        r
    }

    /// Run a full collection cycle.
    pub fn gc_collect(&mut self) {
        self.gc_full();
    }

    /// Total bytes the collector accounts to this state.
    pub fn gc_count_bytes(&self) -> usize {
        self.heap.total_bytes()
    }

    /// Set the pause / step-multiplier / step-size parameters, returning
    /// the previous values as `(pause, step_mul, step_size_log2)`.
    pub fn gc_set_params(
        &mut self,
        pause: Option<u32>,
        step_mul: Option<u32>,
        step_size_log2: Option<u32>,
    ) -> (u32, u32, u32) {
        let prev = (
            self.heap.pause,
            self.heap.step_mul,
            self.heap.step_size_log2,
        );
        if let Some(p) = pause {
            self.heap.pause = p;
        }
        if let Some(m) = step_mul {
            self.heap.step_mul = m;
        }
        if let Some(s) = step_size_log2 {
            self.heap.step_size_log2 = s;
        }
        prev
    }

    /// Soft memory limit for the emergency-collection path (`None` lifts
    /// it).
    pub fn gc_set_memory_limit(&mut self, limit: Option<usize>) {
        self.heap.memory_limit = limit;
    }

    /* }================================================================ */

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;

    #[test]
    fn test_push_and_index() {
        let mut st = State::new();
        st.push_int(10);
        st.push_string("hi").unwrap();
        assert_eq!(st.to_int(0), Some(10));
        assert_eq!(st.to_str(-1).as_deref(), Some("hi"));
        assert_eq!(st.type_of(1), TypeTag::Str);
        assert_eq!(st.type_of(99), TypeTag::Nil);
    }

    #[test]
    fn test_globals_roundtrip() {
        let mut st = State::new();
        st.push_int(5);
        st.set_global("x").unwrap();
        st.get_global("x").unwrap();
        assert_eq!(st.to_int(-1), Some(5));
    }

    #[test]
    fn test_reserved_pseudo_indices() {
        let st = State::new();
        assert_eq!(st.type_of(RESERVED_LIST_INDEX), TypeTag::List);
        assert_eq!(st.type_of(RESERVED_TABLE_INDEX), TypeTag::Table);
    }

    #[test]
    fn test_table_field_access() {
        let mut st = State::new();
        st.push_table(0).unwrap();
        st.push_int(1);
        st.set_field(0, "a").unwrap();
        st.get_field(0, "a").unwrap();
        assert_eq!(st.to_int(-1), Some(1));
    }

    #[test]
    fn test_native_closure_upvalues() {
        fn get_upvalue(st: &mut State) -> crate::error::VmResult<u32> {
            let v = st.value_at(upvalue_index(0));
            st.push(v);
            Ok(1)
        }
        let mut st = State::new();
        st.push_int(77);
        st.push_native_closure(get_upvalue, 1).unwrap();
        let status = st.pcall(0);
        assert_eq!(status, Status::Ok);
        assert_eq!(st.to_int(-1), Some(77));
    }

    #[test]
    fn test_stringify_numbers() {
        let mut st = State::new();
        st.push_float(2.0);
        assert_eq!(st.stringify(-1), "2.0");
        st.push_int(3);
        assert_eq!(st.stringify(-1), "3");
    }

    #[test]
    fn test_next_field_iterates() {
        let mut st = State::new();
        st.push_table(0).unwrap();
        for (k, v) in [("a", 1), ("b", 2)] {
            st.push_int(v);
            st.set_field(0, k).unwrap();
        }
        st.push_nil();
        let mut count = 0;
        while st.next_field(0).unwrap() {
            count += 1;
            st.pop_n(1); // drop the value, keep the key for the next step
        }
        assert_eq!(count, 2);
    }
}
