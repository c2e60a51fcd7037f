//! Tagged value representation for the Toku VM.
//!
//! Every script value is a small copyable enum; collectable payloads are
//! typed handles into the [`Heap`](crate::gc::Heap) arena. The nil variants
//! used internally by the table (empty slot, absent key) are not public
//! values; they are expressed through `Option` and node-key sentinels in the
//! table implementation.

use crate::error::VmResult;
use crate::gc::{
    GcClass, GcClosure, GcInstance, GcList, GcMethod, GcNativeClosure, GcRef, GcStr, GcTable,
    GcThread, GcUserData, Heap,
};
use crate::state::State;

/// Signature of a light native function or the function part of a native
/// closure. Returns the number of results left on the stack.
pub type NativeFn = fn(&mut State) -> VmResult<u32>;

/// A script value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// The nil value.
    Nil,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// An interned short string or a long string.
    Str(GcStr),
    /// A dense length-tracked list.
    List(GcList),
    /// A hash table.
    Table(GcTable),
    /// A class.
    Class(GcClass),
    /// An instance of a class.
    Instance(GcInstance),
    /// A bound method (receiver + method value).
    Method(GcMethod),
    /// A script closure.
    Closure(GcClosure),
    /// A native closure carrying upvalues.
    NativeClosure(GcNativeClosure),
    /// A light native function (no upvalues, compared by pointer).
    Native(NativeFn),
    /// Full userdata with metatable and user values.
    UserData(GcUserData),
    /// A bare host pointer, compared by identity.
    LightUserData(usize),
    /// A thread of execution (only the main thread exists).
    Thread(GcThread),
}

/// Dynamic type of a value, used for type names and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Nil = 0,
    Bool,
    Number,
    UserData,
    LightUserData,
    Str,
    List,
    Table,
    Function,
    Method,
    Class,
    Instance,
    Thread,
}

impl TypeTag {
    /// Standard name of the type.
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Nil => "nil",
            TypeTag::Bool => "boolean",
            TypeTag::Number => "number",
            TypeTag::UserData => "userdata",
            TypeTag::LightUserData => "light userdata",
            TypeTag::Str => "string",
            TypeTag::List => "list",
            TypeTag::Table => "table",
            TypeTag::Function => "function",
            TypeTag::Method => "bound method",
            TypeTag::Class => "class",
            TypeTag::Instance => "instance",
            TypeTag::Thread => "thread",
        }
    }
}

impl Value {
    /// Dynamic type of this value.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Nil => TypeTag::Nil,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) | Value::Float(_) => TypeTag::Number,
            Value::Str(_) => TypeTag::Str,
            Value::List(_) => TypeTag::List,
            Value::Table(_) => TypeTag::Table,
            Value::Class(_) => TypeTag::Class,
            Value::Instance(_) => TypeTag::Instance,
            Value::Method(_) => TypeTag::Method,
            Value::Closure(_) | Value::NativeClosure(_) | Value::Native(_) => TypeTag::Function,
            Value::UserData(_) => TypeTag::UserData,
            Value::LightUserData(_) => TypeTag::LightUserData,
            Value::Thread(_) => TypeTag::Thread,
        }
    }

    /// Only nil and false are falsey.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    /// True if the value is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// True if the payload is a collectable heap object.
    pub fn is_collectable(&self) -> bool {
        self.as_gc_ref().is_some()
    }

    /// Underlying heap reference, if the payload is collectable.
    pub fn as_gc_ref(&self) -> Option<GcRef> {
        match self {
            Value::Str(h) => Some(h.raw()),
            Value::List(h) => Some(h.raw()),
            Value::Table(h) => Some(h.raw()),
            Value::Class(h) => Some(h.raw()),
            Value::Instance(h) => Some(h.raw()),
            Value::Method(h) => Some(h.raw()),
            Value::Closure(h) => Some(h.raw()),
            Value::NativeClosure(h) => Some(h.raw()),
            Value::UserData(h) => Some(h.raw()),
            Value::Thread(h) => Some(h.raw()),
            _ => None,
        }
    }

    /// True if the value can be entered into a call without metamethods.
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Closure(_)
                | Value::NativeClosure(_)
                | Value::Native(_)
                | Value::Class(_)
                | Value::Method(_)
        )
    }
}

/// Rounding mode for float-to-integer conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum F2I {
    /// Accept only exact integral floats (equality rounding mode).
    Exact,
    /// Round toward negative infinity.
    Floor,
    /// Round toward positive infinity.
    Ceil,
}

/// Convert a float to an integer under the given rounding mode.
///
/// Fails for NaN, infinities and values outside the i64 range.
pub fn flt_to_int(f: f64, mode: F2I) -> Option<i64> {
    let r = match mode {
        F2I::Exact => {
            let t = f.floor();
            if t != f {
                return None;
            }
            t
        }
        F2I::Floor => f.floor(),
        F2I::Ceil => f.ceil(),
    };
    // i64::MIN has an exact f64 representation; i64::MAX does not.
    if (-9.223_372_036_854_776E18..9.223_372_036_854_776E18).contains(&r) {
        Some(r as i64)
    } else {
        None
    }
}

impl Heap {
    /// Raw equality: variant-sensitive, never invokes metamethods. Mixed
    /// int/float compares equal only when the float is exactly integral.
    /// Short strings compare by identity, long strings by contents, bound
    /// methods structurally, everything else by object identity.
    pub fn raw_eq(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x == y,
            (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
                flt_to_int(y, F2I::Exact) == Some(x)
            }
            (Value::Str(x), Value::Str(y)) => self.str_eq(x, y),
            (Value::Method(x), Value::Method(y)) => self.method_eq(x, y),
            (Value::Native(x), Value::Native(y)) => x as usize == y as usize,
            (Value::LightUserData(x), Value::LightUserData(y)) => x == y,
            (x, y) => x.as_gc_ref().is_some() && x.as_gc_ref() == y.as_gc_ref(),
        }
    }
}

/// Number of mantissa bits in an f64; integers up to 2^53 convert exactly.
pub const FLT_MANT_DIG: u32 = 53;

/// True if `i` converts to f64 without rounding.
pub fn int_fits_flt(i: i64) -> bool {
    let limit: u64 = 1u64 << FLT_MANT_DIG;
    (i.unsigned_abs()) <= limit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Int(0).is_falsey());
        assert!(!Value::Float(0.0).is_falsey());
    }

    #[test]
    fn test_flt_to_int_exact() {
        assert_eq!(flt_to_int(3.0, F2I::Exact), Some(3));
        assert_eq!(flt_to_int(3.5, F2I::Exact), None);
        assert_eq!(flt_to_int(-2.0, F2I::Exact), Some(-2));
        assert_eq!(flt_to_int(f64::NAN, F2I::Exact), None);
        assert_eq!(flt_to_int(f64::INFINITY, F2I::Floor), None);
    }

    #[test]
    fn test_flt_to_int_rounding() {
        assert_eq!(flt_to_int(3.7, F2I::Floor), Some(3));
        assert_eq!(flt_to_int(3.2, F2I::Ceil), Some(4));
        assert_eq!(flt_to_int(-3.7, F2I::Floor), Some(-4));
        assert_eq!(flt_to_int(-3.2, F2I::Ceil), Some(-3));
    }

    #[test]
    fn test_int_float_roundtrip_fits() {
        assert!(int_fits_flt(1 << 53));
        assert!(int_fits_flt(-(1 << 53)));
        assert!(!int_fits_flt((1 << 53) + 1));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Nil.type_tag().name(), "nil");
        assert_eq!(Value::Int(1).type_tag().name(), "number");
        assert_eq!(Value::Float(1.0).type_tag().name(), "number");
    }
}
