//! Closures, native closures and upvalues.

use crate::gc::{GcProto, GcUpval, Heap};
use crate::value::{NativeFn, Value};

/// State of an upvalue: open upvalues point at a live stack slot of the
/// owning thread; closed upvalues embed their value.
#[derive(Debug, Clone, Copy)]
pub enum UpvalState {
    /// Index of the captured stack slot.
    Open(usize),
    /// The migrated value.
    Closed(Value),
}

/// An upvalue object.
#[derive(Debug)]
pub struct UpvalObj {
    pub state: UpvalState,
}

impl UpvalObj {
    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalState::Open(_))
    }

    /// Stack level of an open upvalue.
    pub fn level(&self) -> Option<usize> {
        match self.state {
            UpvalState::Open(i) => Some(i),
            UpvalState::Closed(_) => None,
        }
    }
}

/// A script closure: prototype plus captured upvalues.
#[derive(Debug)]
pub struct ClosureObj {
    pub proto: GcProto,
    pub upvals: Vec<GcUpval>,
}

/// A native closure: function pointer plus inline upvalue values
/// (directly tagged, not indirected through upvalue objects).
#[derive(Debug)]
pub struct NativeClosureObj {
    pub func: NativeFn,
    pub upvals: Vec<Value>,
}

impl Heap {
    /// Allocate a script closure with `nup` empty upvalue slots; the caller
    /// fills them under a write barrier.
    pub fn closure_new(&mut self, proto: GcProto, nup: usize) -> crate::gc::GcClosure {
        let upvals = (0..nup)
            .map(|_| {
                self.alloc_upval(UpvalObj {
                    state: UpvalState::Closed(Value::Nil),
                })
            })
            .collect();
        self.alloc_closure(ClosureObj { proto, upvals })
    }

    /// Allocate a native closure owning `upvals`.
    pub fn native_closure_new(
        &mut self,
        func: NativeFn,
        upvals: Vec<Value>,
    ) -> crate::gc::GcNativeClosure {
        self.alloc_native_closure(NativeClosureObj { func, upvals })
    }

    /// Allocate a fresh open upvalue at the given stack level.
    pub(crate) fn upval_new_open(&mut self, level: usize) -> GcUpval {
        self.alloc_upval(UpvalObj {
            state: UpvalState::Open(level),
        })
    }

    /// Value currently held by an upvalue; open ones read through the stack.
    pub(crate) fn upval_get(&self, uv: GcUpval, stack: &[Value]) -> Value {
        match self.upval(uv).state {
            UpvalState::Open(i) => stack[i],
            UpvalState::Closed(v) => v,
        }
    }
}
