//! End-to-end interpreter tests: prototypes are assembled with the builder
//! and run through the protected-call entry points.

use toku_vm::{Mm, OpCode, ProtoBuilder, State, Status, Value, VmResult};

/// fn f() { local x = 1; return x + 2; } return f();
#[test]
fn test_local_and_return() {
    let mut inner = ProtoBuilder::new(0, 8);
    inner.load_int(1); // local x
    inner.emit_il(OpCode::GETLOCAL, 0);
    inner.load_int(2);
    inner.binary_op(OpCode::ADD, Mm::Add, false);
    inner.ret(1, Some(1), false);

    let mut st = State::new();
    let inner_ref = st.heap_mut().alloc_proto(inner.build());

    let mut outer = ProtoBuilder::new(0, 8);
    outer.add_proto(inner_ref);
    outer.emit_il(OpCode::CLOSURE, 0);
    outer.emit_ill(OpCode::CALL, 0, 2);
    outer.ret(0, Some(1), false);

    st.push_proto(outer.build()).unwrap();
    assert_eq!(st.pcall(0), Status::Ok);
    assert_eq!(st.to_int(-1), Some(3));
}

fn add99(st: &mut State) -> VmResult<u32> {
    st.push_int(99);
    Ok(1)
}

/// Instances of a class with `__add` returning 99: `a + b` is 99.
#[test]
fn test_class_add_metamethod() {
    let mut st = State::new();
    st.push_class().unwrap(); // index 0
    st.push_native(add99);
    st.class_set_metafield(0, "__add").unwrap();

    let mut b = ProtoBuilder::new(2, 8);
    b.emit_il(OpCode::GETLOCAL, 0);
    b.emit_il(OpCode::GETLOCAL, 1);
    b.binary_op(OpCode::ADD, Mm::Add, false);
    b.ret(2, Some(1), false);

    st.push_proto(b.build()).unwrap();
    st.push_instance(0).unwrap();
    st.push_instance(0).unwrap();
    assert_eq!(st.pcall(2), Status::Ok);
    assert_eq!(st.to_int(-1), Some(99));
}

fn list_iter(st: &mut State) -> VmResult<u32> {
    // iterator over a list: args are (state, control)
    let i = match st.to_int(1) {
        Some(n) => n + 1,
        None => 0,
    };
    let len = st.length_of(0)?;
    if i >= len {
        st.push_nil();
        return Ok(1);
    }
    st.push_int(i); // new control variable
    st.push_int(i);
    st.get_index(0)?; // the element
    Ok(2)
}

/// Generic for over the list [10, 20, 30], accumulating the sum.
#[test]
fn test_generic_for_over_list() {
    let mut b = ProtoBuilder::new(0, 16);
    b.load_int(0); // slot 0: sum
    b.load_const(Value::Native(list_iter)); // slot 1: iterator
    b.emit_is(OpCode::NEWLIST, 0); // slot 2: state
    b.load_int(10);
    b.load_int(20);
    b.load_int(30);
    b.emit_ills(OpCode::SETLIST, 2, 0, 3);
    b.emit_il(OpCode::NIL, 1); // slot 3: control
    b.emit_i(OpCode::FALSE); // slot 4: nothing to close
    let prep = b.emit_ill(OpCode::FORPREP, 1, 0);
    let body = b.here();
    b.emit_il(OpCode::GETLOCAL, 0);
    b.emit_il(OpCode::GETLOCAL, 6); // current value
    b.binary_op(OpCode::ADD, Mm::Add, false);
    b.emit_il(OpCode::SETLOCAL, 0);
    let call = b.emit_ill(OpCode::FORCALL, 1, 2);
    let looppc = b.emit_illl(OpCode::FORLOOP, 1, 0, 2);
    b.patch_long_arg(prep, 1, (call - (prep + OpCode::FORPREP.size())) as u32);
    b.patch_long_arg(
        looppc,
        1,
        ((looppc + OpCode::FORLOOP.size()) - body) as u32,
    );
    b.emit_il(OpCode::GETLOCAL, 0);
    b.ret(5, Some(1), false);

    let mut st = State::new();
    st.push_proto(b.build()).unwrap();
    assert_eq!(st.pcall(0), Status::Ok);
    assert_eq!(st.to_int(-1), Some(60));
}

/// pcall(fn() { nil + 1; }) reports an arithmetic error on nil and
/// restores the stack to the pre-call level plus the error object.
#[test]
fn test_protected_arithmetic_error() {
    let mut b = ProtoBuilder::new(0, 8);
    b.emit_il(OpCode::NIL, 1);
    b.load_int(1);
    b.binary_op(OpCode::ADD, Mm::Add, false);
    b.ret(0, Some(1), false);

    let mut st = State::new();
    st.push_int(1234); // ballast that must survive
    let before = st.api_top();
    st.push_proto(b.build()).unwrap();
    let status = st.pcall(0);
    assert_eq!(status, Status::Runtime);
    assert_eq!(st.api_top(), before + 1);
    let msg = st.to_str(-1).expect("string error object");
    assert!(msg.contains("arithmetic"), "unexpected message: {msg}");
    assert!(msg.contains("nil"), "unexpected message: {msg}");
    st.pop_values(1);
    assert_eq!(st.to_int(-1), Some(1234));
}

/// Arithmetic errors name the offending variable when debug info allows.
#[test]
fn test_arithmetic_error_names_local() {
    let mut st = State::new();
    let name = st.heap_mut().new_string(b"x");

    let mut b = ProtoBuilder::new(0, 8);
    b.emit_il(OpCode::NIL, 1); // local x = nil
    b.emit_il(OpCode::GETLOCAL, 0);
    b.load_int(1);
    b.binary_op(OpCode::ADD, Mm::Add, false);
    b.ret(0, Some(1), false);
    b.add_local(name, 4, 64);

    st.push_proto(b.build()).unwrap();
    assert_eq!(st.pcall(0), Status::Runtime);
    let msg = st.to_str(-1).unwrap();
    assert!(
        msg.contains("local 'x'"),
        "expected the local to be named: {msg}"
    );
}

fn mark_closed(st: &mut State) -> VmResult<u32> {
    st.push_bool(true);
    st.set_global("closed")?;
    Ok(0)
}

/// A to-be-closed variable runs `__close` even when the body raises.
#[test]
fn test_tbc_closes_on_error() {
    let mut st = State::new();
    st.push_class().unwrap(); // index 0
    st.push_native(mark_closed);
    st.class_set_metafield(0, "__close").unwrap();

    let mut b = ProtoBuilder::new(1, 8);
    b.emit_il(OpCode::TBC, 0); // the argument is to-be-closed
    b.emit_il(OpCode::NIL, 1);
    b.load_int(1);
    b.binary_op(OpCode::ADD, Mm::Add, false); // raises
    b.ret(0, Some(1), false);

    st.push_proto(b.build()).unwrap();
    st.push_instance(0).unwrap();
    let status = st.pcall(1);
    assert_eq!(status, Status::Runtime);
    st.pop_values(1); // the error object
    st.get_global("closed").unwrap();
    assert_eq!(st.to_bool(-1), true);
}

/// Closures capture locals as upvalues; returning closes them.
#[test]
fn test_closure_captures_and_closes_upvalue() {
    let mut inner = ProtoBuilder::new(0, 4);
    inner.emit_il(OpCode::GETUVAL, 0);
    inner.ret(0, Some(1), false);
    inner.add_upvalue(None, 0, true, toku_vm::VarKind::Regular);

    let mut st = State::new();
    let inner_ref = st.heap_mut().alloc_proto(inner.build());

    let mut outer = ProtoBuilder::new(0, 8);
    outer.add_proto(inner_ref);
    outer.load_int(5); // the captured local
    outer.emit_il(OpCode::CLOSURE, 0);
    outer.ret(1, Some(1), true); // close upvalues on the way out

    st.push_proto(outer.build()).unwrap();
    assert_eq!(st.pcall(0), Status::Ok);
    // the closure survived its defining scope; call it
    assert_eq!(st.pcall(0), Status::Ok);
    assert_eq!(st.to_int(-1), Some(5));
}

/// Vararg functions see their extra arguments through VARARG.
#[test]
fn test_vararg_sum() {
    let mut b = ProtoBuilder::new(0, 12).vararg();
    b.emit_il(OpCode::VARARGPREP, 0);
    b.emit_il(OpCode::VARARG, 4); // push exactly three
    b.emit_il(OpCode::GETLOCAL, 0);
    b.emit_il(OpCode::GETLOCAL, 1);
    b.binary_op(OpCode::ADD, Mm::Add, false);
    b.emit_il(OpCode::GETLOCAL, 2);
    b.binary_op(OpCode::ADD, Mm::Add, false);
    b.ret(3, Some(1), false);

    let mut st = State::new();
    st.push_proto(b.build()).unwrap();
    st.push_int(1);
    st.push_int(2);
    st.push_int(3);
    assert_eq!(st.pcall(3), Status::Ok);
    assert_eq!(st.to_int(-1), Some(6));
}

/// Tables built and indexed from bytecode.
#[test]
fn test_table_property_roundtrip() {
    let mut st = State::new();
    let key = st.heap_mut().new_string(b"answer");

    let mut b = ProtoBuilder::new(0, 8);
    let k = b.add_const(Value::Str(key));
    b.emit_is(OpCode::NEWTABLE, 0); // slot 0
    b.load_int(7);
    b.emit_ill(OpCode::SETPROPERTY, 1, k); // t.answer = 7
    b.emit_il(OpCode::GETLOCAL, 0);
    b.emit_il(OpCode::GETPROPERTY, k); // t.answer
    b.ret(1, Some(1), false);

    st.push_proto(b.build()).unwrap();
    assert_eq!(st.pcall(0), Status::Ok);
    assert_eq!(st.to_int(-1), Some(7));
}

/// Conditional jumps: TESTPOP consumes the condition and skips the jump
/// when the truth does not match.
#[test]
fn test_conditional_jump() {
    // return (10 < 20) ? 111 : 222
    let mut b = ProtoBuilder::new(0, 8);
    b.load_int(10);
    b.load_int(20);
    b.emit_is(OpCode::LT, 0);
    b.emit_is(OpCode::TESTPOP, 1); // jump taken when true
    let jmp = b.jump_forward();
    b.load_int(222); // not-taken side
    let done = b.jump_forward();
    b.patch_jump_here(jmp);
    b.load_int(111); // taken side
    b.patch_jump_here(done);
    b.ret(0, Some(1), false);

    let mut st = State::new();
    st.push_proto(b.build()).unwrap();
    assert_eq!(st.pcall(0), Status::Ok);
    assert_eq!(st.to_int(-1), Some(111));
}

/// Integer division and modulo boundary semantics surface through the VM.
#[test]
fn test_idiv_by_zero_raises() {
    let mut b = ProtoBuilder::new(0, 8);
    b.load_int(1);
    b.load_int(0);
    b.binary_op(OpCode::IDIV, Mm::IDiv, false);
    b.ret(0, Some(1), false);

    let mut st = State::new();
    st.push_proto(b.build()).unwrap();
    assert_eq!(st.pcall(0), Status::Runtime);
    let msg = st.to_str(-1).unwrap();
    assert!(msg.contains("zero"), "unexpected message: {msg}");
}

/// Calling a non-callable value reports its type.
#[test]
fn test_call_non_callable() {
    let mut b = ProtoBuilder::new(0, 8);
    b.load_int(5);
    b.emit_ill(OpCode::CALL, 0, 1);
    b.ret(0, Some(0), false);

    let mut st = State::new();
    st.push_proto(b.build()).unwrap();
    assert_eq!(st.pcall(0), Status::Runtime);
    let msg = st.to_str(-1).unwrap();
    assert!(msg.contains("call"), "unexpected message: {msg}");
    assert!(msg.contains("number"), "unexpected message: {msg}");
}

/// Tail calls reuse the frame: deep self-recursion neither grows the
/// frame list nor trips the nested-call guard.
#[test]
fn test_tail_call_reuses_frame() {
    use toku_vm::builder::encode_simm_l;

    // fn f(f, n) { if n > 0 { return f(f, n - 1); } return n; }
    let mut b = ProtoBuilder::new(2, 8);
    b.emit_il(OpCode::GETLOCAL, 1);
    b.emit_il(OpCode::GTI, encode_simm_l(0).unwrap());
    b.emit_is(OpCode::TESTPOP, 1);
    let recurse = b.jump_forward();
    b.emit_il(OpCode::GETLOCAL, 1); // base case: return n
    b.ret(2, Some(1), false);
    b.patch_jump_here(recurse);
    b.emit_il(OpCode::GETLOCAL, 0); // callee
    b.emit_il(OpCode::GETLOCAL, 0); // passes itself along
    b.emit_il(OpCode::GETLOCAL, 1);
    b.emit_il(OpCode::ADDI, encode_simm_l(-1).unwrap());
    b.emit_ill(OpCode::TAILCALL, 2, 2);
    b.ret(2, Some(1), false);

    let mut st = State::new();
    st.push_proto(b.build()).unwrap();
    st.push_value(0);
    st.push_int(50_000);
    assert_eq!(st.pcall(2), Status::Ok);
    assert_eq!(st.to_int(-1), Some(0));
    assert_eq!(st.call_depth(), 0);
}

/// String concatenation through CONCAT, with interning of the result.
#[test]
fn test_concat_strings() {
    let mut st = State::new();
    let hello = st.heap_mut().new_string(b"hello ");
    let world = st.heap_mut().new_string(b"world");

    let mut b = ProtoBuilder::new(0, 8);
    b.load_const(Value::Str(hello));
    b.load_const(Value::Str(world));
    b.emit_il(OpCode::CONCAT, 2);
    b.ret(0, Some(1), false);

    st.push_proto(b.build()).unwrap();
    assert_eq!(st.pcall(0), Status::Ok);
    assert_eq!(st.to_str(-1).as_deref(), Some("hello world"));
}
