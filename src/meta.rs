//! Metamethod events and dispatch.
//!
//! Events are looked up by interned name in the receiver's metatable
//! (class metatable for instances, own metatable for userdata). The first
//! seven events have a per-table absence cache in the table's flag byte;
//! a successful lookup clears the corresponding bit and any table write
//! invalidates the whole cache.

use crate::error::VmError;
use crate::gc::{GcTable, Heap};
use crate::value::Value;

/// Tag-method events, in dispatch order. Everything up to and including
/// `Init` has a fast-access absence bit in table flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mm {
    GetIdx = 0,
    SetIdx,
    Gc,
    Call,
    Eq,
    Name,
    Init,
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Shl,
    Shr,
    BAnd,
    BOr,
    BXor,
    Concat,
    Unm,
    BNot,
    Lt,
    Le,
    Close,
}

impl Mm {
    /// Number of events.
    pub const COUNT: usize = 25;

    /// Last event with a fast-access cache bit.
    pub const LAST_FAST: Mm = Mm::Init;

    /// Event names, in order.
    pub const NAMES: [&'static str; Mm::COUNT] = [
        "__getidx", "__setidx", "__gc", "__call", "__eq", "__name", "__init", "__add", "__sub",
        "__mul", "__div", "__idiv", "__mod", "__pow", "__shl", "__shr", "__band", "__bor",
        "__bxor", "__concat", "__unm", "__bnot", "__lt", "__le", "__close",
    ];

    /// Event name without the leading underscores.
    pub fn bare_name(self) -> &'static str {
        &Mm::NAMES[self as usize][2..]
    }

    /// All events, in order.
    pub const ALL: [Mm; Mm::COUNT] = [
        Mm::GetIdx,
        Mm::SetIdx,
        Mm::Gc,
        Mm::Call,
        Mm::Eq,
        Mm::Name,
        Mm::Init,
        Mm::Add,
        Mm::Sub,
        Mm::Mul,
        Mm::Div,
        Mm::IDiv,
        Mm::Mod,
        Mm::Pow,
        Mm::Shl,
        Mm::Shr,
        Mm::BAnd,
        Mm::BOr,
        Mm::BXor,
        Mm::Concat,
        Mm::Unm,
        Mm::BNot,
        Mm::Lt,
        Mm::Le,
        Mm::Close,
    ];

    pub fn from_u8(v: u8) -> Option<Mm> {
        Mm::ALL.get(v as usize).copied()
    }

    fn has_fast_bit(self) -> bool {
        (self as u8) <= (Mm::LAST_FAST as u8)
    }
}

impl Heap {
    /// Look up `event` in a metatable, maintaining the absence cache.
    pub fn get_mm(&mut self, mt: Option<GcTable>, event: Mm) -> Option<Value> {
        let mt = mt?;
        let bit = 1u8 << (event as u8);
        if event.has_fast_bit() && self.table(mt).flags & bit != 0 {
            return None; // cached absence
        }
        let name = self.mm_names[event as usize];
        match self.table_get_str(mt, name) {
            Some(v) => Some(v),
            None => {
                if event.has_fast_bit() {
                    self.table_mut(mt).flags |= bit;
                }
                None
            }
        }
    }

    /// Metatable of a value: instances go through their class.
    pub fn value_metatable(&self, v: Value) -> Option<GcTable> {
        match v {
            Value::Instance(i) => self.class(self.instance(i).class).metatable,
            Value::UserData(u) => self.userdata(u).metatable,
            _ => None,
        }
    }

    /// Look up `event` for a receiver value.
    pub fn get_obj_mm(&mut self, v: Value, event: Mm) -> Option<Value> {
        let mt = self.value_metatable(v);
        self.get_mm(mt, event)
    }

    /// Dynamic type name of a value, preferring a string `__name` metafield.
    pub fn type_name_of(&mut self, v: Value) -> String {
        if let Some(Value::Str(s)) = self.get_obj_mm(v, Mm::Name) {
            return self.str_display(s).into_owned();
        }
        v.type_tag().name().to_string()
    }
}

/// Arithmetic/bitwise/comparison events raised by `MBIN` and the slow
/// paths; errors name the event without its underscores.
pub(crate) fn binop_error(
    heap: &mut Heap,
    v1: Value,
    v2: Value,
    event: Mm,
) -> VmError {
    let kind = match event {
        Mm::BAnd | Mm::BOr | Mm::BXor | Mm::Shl | Mm::Shr | Mm::BNot => {
            "perform bitwise operation on"
        }
        Mm::Concat => "concatenate",
        Mm::Lt | Mm::Le => "compare",
        _ => "perform arithmetic on",
    };
    let offender = if matches!(
        event,
        Mm::BAnd | Mm::BOr | Mm::BXor | Mm::Shl | Mm::Shr | Mm::BNot
    ) {
        // the non-integer operand is at fault
        if crate::vm::to_integer(heap, v1).is_none() {
            v1
        } else {
            v2
        }
    } else if crate::vm::to_number(heap, v1).is_none() {
        v1
    } else {
        v2
    };
    let tn = heap.type_name_of(offender);
    VmError::runtime(format!("attempt to {kind} a {tn} value"))
}

/// Error for an ordering between values with no order metamethod.
pub(crate) fn order_error(heap: &mut Heap, v1: Value, v2: Value) -> VmError {
    let t1 = heap.type_name_of(v1);
    let t2 = heap.type_name_of(v2);
    if t1 == t2 {
        VmError::runtime(format!("attempt to compare two {t1} values"))
    } else {
        VmError::runtime(format!("attempt to compare {t1} with {t2}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::table::MASK_MM_FLAGS;

    #[test]
    fn test_event_names_align() {
        assert_eq!(Mm::NAMES[Mm::Gc as usize], "__gc");
        assert_eq!(Mm::NAMES[Mm::Close as usize], "__close");
        assert_eq!(Mm::Init.bare_name(), "init");
        assert_eq!(Mm::from_u8(Mm::Le as u8), Some(Mm::Le));
        assert_eq!(Mm::from_u8(200), None);
    }

    #[test]
    fn test_absence_cache_records_misses() {
        let mut heap = Heap::new(5);
        heap.init_reserved_names();
        let mt = heap.table_new();
        heap.table_mut(mt).flags = 0;
        assert_eq!(heap.get_mm(Some(mt), Mm::Call), None);
        assert_ne!(heap.table(mt).flags & (1 << Mm::Call as u8), 0);
        // a write invalidates the cache and the event becomes visible
        let name = heap.mm_names[Mm::Call as usize];
        heap.table_set(mt, Value::Str(name), Value::Int(1)).unwrap();
        heap.table_mut(mt).invalidate_mm_cache();
        assert_eq!(heap.get_mm(Some(mt), Mm::Call), Some(Value::Int(1)));
    }

    #[test]
    fn test_fresh_tables_cache_all_absent() {
        let heap = {
            let mut h = Heap::new(5);
            h.init_reserved_names();
            h
        };
        let _ = heap;
        assert_eq!(MASK_MM_FLAGS, 0x7f);
    }
}
