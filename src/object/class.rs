//! Classes, instances and bound methods.

use crate::gc::{GcClass, GcInstance, GcTable, GcUserData, Heap};
use crate::value::Value;

/// A class: optional superclass, optional metatable, optional method table.
/// There is no per-class instance shape; instances carry their own fields.
#[derive(Debug)]
pub struct ClassObj {
    pub superclass: Option<GcClass>,
    pub metatable: Option<GcTable>,
    pub methods: Option<GcTable>,
}

/// An instance: its class and a lazily-created field table.
#[derive(Debug)]
pub struct InstanceObj {
    pub class: GcClass,
    pub fields: GcTable,
}

/// Receiver of a bound method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
    Instance(GcInstance),
    UserData(GcUserData),
}

impl Receiver {
    pub fn as_value(self) -> Value {
        match self {
            Receiver::Instance(i) => Value::Instance(i),
            Receiver::UserData(u) => Value::UserData(u),
        }
    }
}

/// A bound method: a method value closed over its receiver. Equality is
/// structural on receiver identity and raw method equality.
#[derive(Debug)]
pub struct MethodObj {
    pub receiver: Receiver,
    pub method: Value,
}

impl Heap {
    /// Allocate a bare class (no superclass, metatable or methods).
    pub fn class_new(&mut self) -> GcClass {
        self.alloc_class(ClassObj {
            superclass: None,
            metatable: None,
            methods: None,
        })
    }

    /// Allocate an instance of `class` with a fresh field table.
    ///
    /// The field table is created after the instance so a collection
    /// triggered by it cannot see a half-built object; the caller anchors
    /// the instance to the stack.
    pub fn instance_new(&mut self, class: GcClass) -> GcInstance {
        let fields = self.table_new();
        self.alloc_instance(InstanceObj { class, fields })
    }

    /// Allocate a bound method.
    pub fn method_new(&mut self, receiver: Receiver, method: Value) -> crate::gc::GcMethod {
        self.alloc_method(MethodObj { receiver, method })
    }

    /// Structural equality of two bound methods.
    pub(crate) fn method_eq(&self, a: crate::gc::GcMethod, b: crate::gc::GcMethod) -> bool {
        if a == b {
            return true;
        }
        let (ma, mb) = (self.method(a), self.method(b));
        ma.receiver == mb.receiver && self.raw_eq(ma.method, mb.method)
    }
}
