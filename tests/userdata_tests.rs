//! Userdata: payloads, user values, metatables and metamethod dispatch.

use toku_vm::{State, TypeTag, VmResult};

#[test]
fn test_payload_and_uservalues() {
    let mut st = State::new();
    let u = st.push_userdata(16, 3).unwrap();
    assert_eq!(st.heap().userdata(u).payload.len(), 16);

    st.push_int(11);
    st.set_uservalue(0, 1).unwrap();
    st.get_uservalue(0, 1).unwrap();
    assert_eq!(st.to_int(-1), Some(11));
    st.pop_values(1);

    st.get_uservalue(0, 2).unwrap();
    assert!(st.is_nil(-1));
    st.pop_values(1);

    st.push_int(1);
    assert!(st.set_uservalue(0, 3).is_err()); // out of range
}

fn double_key(st: &mut State) -> VmResult<u32> {
    // __getidx(obj, key) -> key * 2
    let k = st.to_int(1).unwrap_or(0);
    st.push_int(k * 2);
    Ok(1)
}

#[test]
fn test_getidx_metamethod_dispatch() {
    let mut st = State::new();
    st.push_userdata(0, 0).unwrap(); // index 0
    st.push_table(0).unwrap(); // its metatable
    st.push_native(double_key);
    st.set_field(1, "__getidx").unwrap();
    st.set_userdata_metatable(0).unwrap();

    st.push_int(21);
    st.get_index(0).unwrap();
    assert_eq!(st.to_int(-1), Some(42));
}

fn equal_payload_len(st: &mut State) -> VmResult<u32> {
    // __eq on userdata: compare payload sizes
    let a = st.value_at(0);
    let b = st.value_at(1);
    let eq = match (a, b) {
        (toku_vm::Value::UserData(x), toku_vm::Value::UserData(y)) => {
            st.heap().userdata(x).payload.len() == st.heap().userdata(y).payload.len()
        }
        _ => false,
    };
    st.push_bool(eq);
    Ok(1)
}

#[test]
fn test_userdata_eq_metamethod() {
    let mut st = State::new();
    st.push_userdata(8, 0).unwrap(); // 0
    st.push_userdata(8, 0).unwrap(); // 1
    st.push_table(0).unwrap(); // 2: shared metatable
    st.push_native(equal_payload_len);
    st.set_field(2, "__eq").unwrap();
    st.push_value(2);
    st.set_userdata_metatable(0).unwrap();
    st.push_value(2);
    st.set_userdata_metatable(1).unwrap();

    let a = st.value_at(0);
    let b = st.value_at(1);
    assert!(!st.heap().raw_eq(a, b)); // raw equality is identity
    assert_eq!(st.value_eq(a, b).unwrap(), true); // __eq compares sizes
    assert_eq!(st.type_of(0), TypeTag::UserData);
}

#[test]
fn test_userdata_finalizer() {
    fn mark(st: &mut State) -> VmResult<u32> {
        st.push_bool(true);
        st.set_global("ud_finalized")?;
        Ok(0)
    }
    let mut st = State::new();
    st.push_userdata(4, 0).unwrap();
    st.push_table(0).unwrap();
    st.push_native(mark);
    st.set_field(1, "__gc").unwrap();
    st.set_userdata_metatable(0).unwrap();
    st.pop_values(1); // drop the userdata
    st.gc_collect();
    st.get_global("ud_finalized").unwrap();
    assert_eq!(st.to_bool(-1), true);
}
