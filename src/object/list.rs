//! List objects.
//!
//! A list is a sequence whose length is the count of non-nil values from
//! index 0. Storing at the current length appends (nil appends are no-ops);
//! storing nil in bounds truncates the length to that index; storing past
//! the length is an error. Filling a gap between two former sequences
//! increments the length by exactly one — sequences do not fuse.
//!
//! The named fields `len`, `size`, `last`, `x`, `y`, `z` are recognised by
//! the short-string `extra` tag; `len` and `size` are read-only.

use crate::error::{VmError, VmResult};
use crate::gc::{GcList, GcStr, Heap};
use crate::object::string::FIRST_LF_TAG;
use crate::value::Value;

/// Minimum non-zero capacity; capacities are powers of two.
pub const MIN_LIST_SIZE: usize = 4;

/// Named list fields, in `extra`-tag order.
pub const LIST_FIELD_NAMES: [&str; 6] = ["len", "size", "last", "x", "y", "z"];

const LF_LEN: u8 = 0;
const LF_SIZE: u8 = 1;
const LF_LAST: u8 = 2;
const LF_X: u8 = 3;

/// A list object. The vector length is the list length; the tracked
/// capacity only grows in powers of two.
#[derive(Debug, Default)]
pub struct ListObj {
    pub(crate) arr: Vec<Value>,
    /// Reported capacity: 0 or a power of two >= 4.
    pub(crate) size: usize,
}

impl ListObj {
    pub fn len(&self) -> usize {
        self.arr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arr.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// List-field index of a short string, if its `extra` byte tags one.
fn list_field(extra: u8) -> Option<u8> {
    let lf = extra.wrapping_sub(FIRST_LF_TAG);
    (extra >= FIRST_LF_TAG && (lf as usize) < LIST_FIELD_NAMES.len()).then_some(lf)
}

impl Heap {
    /// Create a new empty list.
    pub fn list_new(&mut self) -> GcList {
        self.alloc_list(ListObj::default())
    }

    /// Grow the reported capacity to hold at least `need` values.
    pub fn list_ensure(&mut self, l: GcList, need: usize) {
        let lo = self.list_mut(l);
        if need > lo.size {
            let new_size = need.max(MIN_LIST_SIZE).next_power_of_two();
            lo.arr.reserve(new_size - lo.arr.len());
            let delta =
                (new_size as isize - lo.size as isize) * std::mem::size_of::<Value>() as isize;
            lo.size = new_size;
            self.account(delta);
        }
    }

    /// Shrink capacity back to the next power of two covering the length.
    /// Returns true when memory was released.
    pub(crate) fn list_shrink(&mut self, l: GcList) -> bool {
        let lo = self.list_mut(l);
        if lo.len() < lo.size {
            let fit = lo.len().max(MIN_LIST_SIZE).next_power_of_two();
            let fit = if lo.arr.is_empty() { 0 } else { fit };
            if fit < lo.size {
                lo.arr.shrink_to(fit);
                let delta =
                    (lo.size as isize - fit as isize) * std::mem::size_of::<Value>() as isize;
                lo.size = fit;
                self.account(-delta);
                return true;
            }
        }
        false
    }

    /// Indexed read: in-bounds yields the slot, past the length yields nil.
    pub fn list_get_index(&self, l: GcList, i: i64) -> Value {
        let lo = self.list(l);
        if (0..lo.len() as i64).contains(&i) {
            lo.arr[i as usize]
        } else {
            Value::Nil
        }
    }

    fn list_set_in_bounds(&mut self, l: GcList, i: usize, v: Value) {
        debug_assert!(i <= self.list(l).len());
        if !v.is_nil() {
            let append = i == self.list(l).len();
            if append {
                self.list_ensure(l, i + 1);
                self.list_mut(l).arr.push(v);
            } else {
                self.list_mut(l).arr[i] = v;
            }
            self.barrier_back(l.raw());
        } else if i < self.list(l).len() {
            // nil truncates the sequence at this index
            self.list_mut(l).arr.truncate(i);
        } // appending nil is a no-op
    }

    /// Indexed write with the append/truncate rules above.
    pub fn list_set_index(&mut self, l: GcList, i: i64, v: Value) -> VmResult<()> {
        if (0..=self.list(l).len() as i64).contains(&i) {
            self.list_set_in_bounds(l, i as usize, v);
            Ok(())
        } else {
            Err(VmError::runtime(format!(
                "list index {i} out of bounds (len {})",
                self.list(l).len()
            )))
        }
    }

    /// Read of a named field. Unknown string keys raise.
    pub fn list_get_str(&self, l: GcList, key: GcStr) -> VmResult<Value> {
        let Some(lf) = list_field(self.str(key).extra) else {
            return Err(self.unknown_list_field(key));
        };
        let lo = self.list(l);
        Ok(match lf {
            LF_LEN => Value::Int(lo.len() as i64),
            LF_SIZE => Value::Int(lo.size() as i64),
            LF_LAST => {
                if lo.is_empty() {
                    Value::Nil
                } else {
                    lo.arr[lo.len() - 1]
                }
            }
            _ => {
                let i = (lf - LF_X) as usize;
                if i < lo.len() {
                    lo.arr[i]
                } else {
                    Value::Nil
                }
            }
        })
    }

    /// Write of a named field; `len` and `size` are not assignable.
    pub fn list_set_str(&mut self, l: GcList, key: GcStr, v: Value) -> VmResult<()> {
        let Some(lf) = list_field(self.str(key).extra) else {
            return Err(self.unknown_list_field(key));
        };
        match lf {
            LF_LEN | LF_SIZE => Err(VmError::runtime(format!(
                "list field '{}' is read-only",
                LIST_FIELD_NAMES[lf as usize]
            ))),
            LF_LAST => {
                let len = self.list(l).len();
                self.list_set_in_bounds(l, len.saturating_sub(1), v);
                Ok(())
            }
            _ => {
                let i = (lf - LF_X) as i64;
                self.list_set_index(l, i, v)
            }
        }
    }

    /// Generic read: integer-convertible keys index, string keys name fields.
    pub fn list_get(&mut self, l: GcList, key: Value) -> VmResult<Value> {
        match self.to_integer_key(key) {
            Some(i) => Ok(self.list_get_index(l, i)),
            None => match key {
                Value::Str(s) => self.list_get_str(l, s),
                _ => Err(self.invalid_list_index(key)),
            },
        }
    }

    /// Generic write.
    pub fn list_set(&mut self, l: GcList, key: Value, v: Value) -> VmResult<()> {
        match self.to_integer_key(key) {
            Some(i) => self.list_set_index(l, i, v),
            None => match key {
                Value::Str(s) => self.list_set_str(l, s, v),
                _ => Err(self.invalid_list_index(key)),
            },
        }
    }

    fn to_integer_key(&self, key: Value) -> Option<i64> {
        match key {
            Value::Int(i) => Some(i),
            Value::Float(f) => crate::value::flt_to_int(f, crate::value::F2I::Exact),
            _ => None,
        }
    }

    fn unknown_list_field(&self, key: GcStr) -> VmError {
        VmError::runtime(format!(
            "unknown list field '{}'",
            self.str_display(key)
        ))
    }

    fn invalid_list_index(&self, key: Value) -> VmError {
        VmError::runtime(format!(
            "invalid list index ({} value)",
            key.type_tag().name()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    fn setup() -> (Heap, GcList) {
        let mut h = Heap::new(3);
        h.init_reserved_names();
        let l = h.list_new();
        (h, l)
    }

    #[test]
    fn test_append_and_read() {
        let (mut h, l) = setup();
        h.list_set_index(l, 0, Value::Int(10)).unwrap();
        h.list_set_index(l, 1, Value::Int(20)).unwrap();
        assert_eq!(h.list(l).len(), 2);
        assert_eq!(h.list_get_index(l, 0), Value::Int(10));
        assert_eq!(h.list_get_index(l, 5), Value::Nil);
    }

    #[test]
    fn test_write_past_length_errors() {
        let (mut h, l) = setup();
        let err = h.list_set_index(l, 3, Value::Int(1)).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn test_nil_truncates_and_nil_append_is_noop() {
        let (mut h, l) = setup();
        for i in 0..4 {
            h.list_set_index(l, i, Value::Int(i)).unwrap();
        }
        h.list_set_index(l, 4, Value::Nil).unwrap(); // append nil: no-op
        assert_eq!(h.list(l).len(), 4);
        h.list_set_index(l, 1, Value::Nil).unwrap(); // truncate
        assert_eq!(h.list(l).len(), 1);
        assert_eq!(h.list_get_index(l, 0), Value::Int(0));
    }

    #[test]
    fn test_capacity_invariant() {
        let (mut h, l) = setup();
        assert_eq!(h.list(l).size(), 0);
        for i in 0..9 {
            h.list_set_index(l, i, Value::Int(i)).unwrap();
        }
        let size = h.list(l).size();
        assert!(size.is_power_of_two() && size >= 9);
        assert!(h.list(l).len() <= size);
    }

    #[test]
    fn test_named_fields() {
        let (mut h, l) = setup();
        h.list_set_index(l, 0, Value::Int(7)).unwrap();
        h.list_set_index(l, 1, Value::Int(8)).unwrap();
        let len = h.new_string(b"len");
        let last = h.new_string(b"last");
        let x = h.new_string(b"x");
        assert_eq!(h.list_get_str(l, len).unwrap(), Value::Int(2));
        assert_eq!(h.list_get_str(l, last).unwrap(), Value::Int(8));
        assert_eq!(h.list_get_str(l, x).unwrap(), Value::Int(7));
        // writing through 'last' replaces the final element
        h.list_set_str(l, last, Value::Int(9)).unwrap();
        assert_eq!(h.list_get_index(l, 1), Value::Int(9));
    }

    #[test]
    fn test_len_and_size_read_only() {
        let (mut h, l) = setup();
        let len = h.new_string(b"len");
        let size = h.new_string(b"size");
        assert!(h.list_set_str(l, len, Value::Int(3)).is_err());
        assert!(h.list_set_str(l, size, Value::Int(3)).is_err());
    }

    #[test]
    fn test_unknown_field_raises() {
        let (mut h, l) = setup();
        let bogus = h.new_string(b"bogus");
        assert!(h.list_get_str(l, bogus).is_err());
        assert!(h.list_set_str(l, bogus, Value::Int(1)).is_err());
    }
}
