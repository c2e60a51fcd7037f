//! Classes, instances, bound methods and inheritance.

use toku_vm::{Mm, OpCode, ProtoBuilder, State, Status, TypeTag, Value, VmResult};

fn answer_method(st: &mut State) -> VmResult<u32> {
    // bound-method calls prepend the receiver
    assert_eq!(st.type_of(0), TypeTag::Instance);
    st.push_int(42);
    Ok(1)
}

/// Method lookup on an instance materialises a bound method; calling it
/// prepends the receiver.
#[test]
fn test_instance_method_binds_receiver() {
    let mut st = State::new();
    st.push_class().unwrap();
    st.push_native(answer_method);
    st.class_add_method(0, "answer").unwrap();
    st.push_instance(0).unwrap(); // index 1

    st.get_field(1, "answer").unwrap();
    assert_eq!(st.type_of(-1), TypeTag::Method);
    assert_eq!(st.pcall(0), Status::Ok);
    assert_eq!(st.to_int(-1), Some(42));
}

/// Instance fields shadow class methods; missing lookups yield nil.
#[test]
fn test_field_shadows_method() {
    let mut st = State::new();
    st.push_class().unwrap();
    st.push_native(answer_method);
    st.class_add_method(0, "answer").unwrap();
    st.push_instance(0).unwrap();

    st.push_int(7);
    st.set_field(1, "answer").unwrap();
    st.get_field(1, "answer").unwrap();
    assert_eq!(st.to_int(-1), Some(7));
    st.pop_values(1);

    st.get_field(1, "missing").unwrap();
    assert!(st.is_nil(-1));
}

/// Calling a class allocates an instance; `__init` rewrites the call.
#[test]
fn test_class_call_runs_init() {
    fn init(st: &mut State) -> VmResult<u32> {
        // self, then the constructor argument
        assert_eq!(st.type_of(0), TypeTag::Instance);
        st.push_value(1);
        st.set_field(0, "seed").unwrap();
        st.push_value(0); // return self
        Ok(1)
    }
    let mut st = State::new();
    st.push_class().unwrap();
    st.push_native(init);
    st.class_set_metafield(0, "__init").unwrap();

    st.push_value(0); // the class as callee
    st.push_int(31);
    assert_eq!(st.pcall(1), Status::Ok);
    assert_eq!(st.type_of(-1), TypeTag::Instance);
    st.get_field(-1, "seed").unwrap();
    assert_eq!(st.to_int(-1), Some(31));
}

/// Calling a class without `__init` just returns the fresh instance.
#[test]
fn test_class_call_without_init() {
    let mut st = State::new();
    st.push_class().unwrap();
    st.push_value(0);
    assert_eq!(st.pcall(0), Status::Ok);
    assert_eq!(st.type_of(-1), TypeTag::Instance);
}

/// INHERIT copies the superclass's method table; subclass instances see
/// inherited methods, and SUPER reaches the superclass.
#[test]
fn test_inheritance_and_super() {
    let mut st = State::new();
    st.push_class().unwrap(); // 0: superclass
    st.push_native(answer_method);
    st.class_add_method(0, "answer").unwrap();
    st.push_class().unwrap(); // 1: subclass

    // fn(sub, sup) { inherit sub from sup; return sub; }
    let mut b = ProtoBuilder::new(2, 8);
    b.emit_il(OpCode::GETLOCAL, 0);
    b.emit_il(OpCode::GETLOCAL, 1);
    b.emit_i(OpCode::INHERIT);
    b.ret(2, Some(1), false);
    st.push_proto(b.build()).unwrap();
    st.push_value(1);
    st.push_value(0);
    assert_eq!(st.pcall(2), Status::Ok);
    st.pop_values(1);

    st.push_instance(1).unwrap(); // instance of the subclass
    st.get_field(-1, "answer").unwrap();
    assert_eq!(st.type_of(-1), TypeTag::Method);
    assert_eq!(st.pcall(0), Status::Ok);
    assert_eq!(st.to_int(-1), Some(42));
    st.pop_values(1);

    // SUPER replaces self with its superclass
    let mut s = ProtoBuilder::new(1, 4);
    s.emit_il(OpCode::GETLOCAL, 0);
    s.emit_i(OpCode::SUPER);
    s.ret(1, Some(1), false);
    st.push_proto(s.build()).unwrap();
    st.push_value(-2); // the subclass instance
    assert_eq!(st.pcall(1), Status::Ok);
    assert_eq!(st.type_of(-1), TypeTag::Class);
}

/// `__eq` fires only for instances of the same class.
#[test]
fn test_instance_equality_metamethod() {
    fn always_equal(st: &mut State) -> VmResult<u32> {
        st.push_bool(true);
        Ok(1)
    }
    let mut st = State::new();
    st.push_class().unwrap(); // 0
    st.push_native(always_equal);
    st.class_set_metafield(0, "__eq").unwrap();
    st.push_class().unwrap(); // 1: unrelated class

    let mut b = ProtoBuilder::new(2, 8);
    b.emit_il(OpCode::GETLOCAL, 0);
    b.emit_il(OpCode::GETLOCAL, 1);
    b.emit_is(OpCode::EQ, 1);
    b.ret(2, Some(1), false);
    st.push_proto(b.build()).unwrap();
    let eq_fn = st.api_top() - 1;

    // same class: the metamethod answers
    st.push_value(eq_fn as i64);
    st.push_instance(0).unwrap();
    st.push_instance(0).unwrap();
    assert_eq!(st.pcall(2), Status::Ok);
    assert_eq!(st.to_bool(-1), true);
    st.pop_values(1);

    // different classes: identity, no metamethod
    st.push_value(eq_fn as i64);
    st.push_instance(0).unwrap();
    st.push_instance(1).unwrap();
    assert_eq!(st.pcall(2), Status::Ok);
    assert_eq!(st.to_bool(-1), false);
}

/// Bound methods compare structurally: same receiver and method.
#[test]
fn test_bound_method_equality() {
    let mut st = State::new();
    st.push_class().unwrap();
    st.push_native(answer_method);
    st.class_add_method(0, "answer").unwrap();
    st.push_instance(0).unwrap(); // 1

    st.get_field(1, "answer").unwrap(); // 2
    st.get_field(1, "answer").unwrap(); // 3: distinct object, same shape
    let (a, b) = (st.value_at(2), st.value_at(3));
    assert_ne!(a, b, "distinct bound-method objects expected");
    assert!(st.heap().raw_eq(a, b));
}

/// Classes created from bytecode honour the metatable bit and size hints.
#[test]
fn test_newclass_opcode_metatable_bit() {
    let mut st = State::new();
    let key = st.heap_mut().new_string(b"greet");

    // class with a metatable and one method stored through METHOD
    let mut b = ProtoBuilder::new(1, 8);
    let k = b.add_const(Value::Str(key));
    b.emit_is(OpCode::NEWCLASS, 0x81);
    b.emit_il(OpCode::LOAD, 1); // copy of the class for METHOD
    b.emit_il(OpCode::GETLOCAL, 0); // the method value (an argument)
    b.emit_il(OpCode::METHOD, k);
    b.ret(1, Some(1), false);

    st.push_proto(b.build()).unwrap();
    st.push_native(answer_method);
    assert_eq!(st.pcall(1), Status::Ok);
    assert_eq!(st.type_of(-1), TypeTag::Class);

    // instantiate and call the stored method
    st.push_instance(-1).unwrap();
    st.get_field(-1, "greet").unwrap();
    assert_eq!(st.pcall(0), Status::Ok);
    assert_eq!(st.to_int(-1), Some(42));
}
