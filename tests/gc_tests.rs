//! Collector behaviour observed through the public API.

use toku_vm::{State, Status, Value, VmResult};

/// Allocating many short strings and dropping every reference returns the
/// string table to its baseline and releases the accounted bytes.
#[test]
fn test_string_churn_collects_back_to_baseline() {
    let mut st = State::new();
    st.gc_collect();
    let baseline_strings = st.heap().string_table_len();
    let baseline_bytes = st.gc_count_bytes();

    st.gc_stop();
    for i in 0..10_000 {
        st.push_bytes(format!("unique-{i}").as_bytes()).unwrap();
        st.pop_values(1);
    }
    let high_water = st.gc_count_bytes();
    assert!(high_water > baseline_bytes + 10_000 * 16);
    assert_eq!(st.heap().string_table_len(), baseline_strings + 10_000);

    st.gc_restart();
    st.gc_collect();
    assert_eq!(st.heap().string_table_len(), baseline_strings);
    assert!(st.gc_count_bytes() + 10_000 * 16 <= high_water);
    assert!(st.gc_count_bytes() <= baseline_bytes + 1024);
}

/// Values on the stack survive any number of collections.
#[test]
fn test_rooted_values_survive() {
    let mut st = State::new();
    st.push_bytes(b"keep me around").unwrap();
    st.push_table(0).unwrap();
    st.push_int(7);
    st.set_field(1, "k").unwrap();
    for _ in 0..3 {
        st.gc_collect();
    }
    assert_eq!(st.to_str(0).as_deref(), Some("keep me around"));
    st.get_field(1, "k").unwrap();
    assert_eq!(st.to_int(-1), Some(7));
}

/// Globals are roots through the reserved list.
#[test]
fn test_globals_survive_collection() {
    let mut st = State::new();
    st.push_bytes(b"global payload").unwrap();
    st.set_global("payload").unwrap();
    st.gc_collect();
    st.gc_collect();
    st.get_global("payload").unwrap();
    assert_eq!(st.to_str(-1).as_deref(), Some("global payload"));
}

fn count_finalized(st: &mut State) -> VmResult<u32> {
    st.get_global("finalized")?;
    let n = st.to_int(-1).unwrap_or(0);
    st.pop_values(1);
    st.push_int(n + 1);
    st.set_global("finalized")?;
    Ok(0)
}

/// `__gc` runs exactly once for an unreachable instance.
#[test]
fn test_finalizer_runs_once() {
    let mut st = State::new();
    st.push_class().unwrap();
    st.push_native(count_finalized);
    st.class_set_metafield(0, "__gc").unwrap();

    st.push_instance(0).unwrap();
    st.pop_values(1); // the instance is now garbage
    st.gc_collect();
    st.get_global("finalized").unwrap();
    assert_eq!(st.to_int(-1), Some(1));
    st.pop_values(1);

    // later cycles must not run it again
    st.gc_collect();
    st.gc_collect();
    st.get_global("finalized").unwrap();
    assert_eq!(st.to_int(-1), Some(1));
}

/// A failing finaliser is reported to the warn hook, not propagated.
#[test]
fn test_finalizer_error_goes_to_warn() {
    fn failing_gc(_st: &mut State) -> VmResult<u32> {
        Err(toku_vm::VmError::runtime("finaliser exploded"))
    }
    use std::cell::RefCell;
    use std::rc::Rc;
    let warnings: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = warnings.clone();

    let mut st = State::new();
    st.set_warn_fn(Some(Box::new(move |msg| {
        sink.borrow_mut().push(msg.to_string());
    })));
    st.push_class().unwrap();
    st.push_native(failing_gc);
    st.class_set_metafield(0, "__gc").unwrap();
    st.push_instance(0).unwrap();
    st.pop_values(1);
    st.gc_collect();

    let seen = warnings.borrow();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("__gc"), "warning was: {}", seen[0]);
}

/// The soft memory limit triggers an emergency collection before failing.
#[test]
fn test_memory_limit_emergency_collection() {
    let mut st = State::new();
    st.gc_collect();
    let baseline = st.gc_count_bytes();
    st.gc_set_memory_limit(Some(baseline + 200 * 1024));
    // garbage that an emergency pass can reclaim; the loop only survives
    // the limit because emergency collections keep freeing it
    for i in 0..20_000 {
        st.push_bytes(format!("transient-{i}").as_bytes()).unwrap();
        st.pop_values(1);
    }
    st.gc_collect();
    assert!(st.gc_count_bytes() <= baseline + 200 * 1024);
    st.gc_set_memory_limit(None);
}

/// Incremental stepping makes progress without a full collection.
#[test]
fn test_incremental_steps_reclaim() {
    let mut st = State::new();
    st.gc_collect();
    let baseline = st.gc_count_bytes();
    st.gc_stop();
    for i in 0..5_000 {
        st.push_bytes(format!("step-{i}").as_bytes()).unwrap();
        st.pop_values(1);
    }
    st.gc_restart();
    let high = st.gc_count_bytes();
    for _ in 0..10_000 {
        st.gc_step_kbytes(64).unwrap();
        if st.gc_count_bytes() < high / 2 {
            break;
        }
    }
    assert!(st.gc_count_bytes() < high, "steps made no progress");
    assert!(st.gc_count_bytes() >= baseline.min(high));
}

/// Protected errors do not leak stack values to the collector.
#[test]
fn test_error_unwind_then_collect() {
    fn boom(_st: &mut State) -> VmResult<u32> {
        Err(toku_vm::VmError::runtime("boom"))
    }
    let mut st = State::new();
    for _ in 0..100 {
        st.push_native(boom);
        st.push_bytes(b"argument string").unwrap();
        assert_eq!(st.protected_call_args(1, 0), Status::Runtime);
        st.pop_values(1);
    }
    st.gc_collect();
    // the state is still fully functional
    st.push_int(5);
    assert_eq!(st.value_at(-1), Value::Int(5));
}
