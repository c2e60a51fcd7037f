//! Bytecode interpreter.
//!
//! A tight match-based dispatch loop with frame-local pc; collector steps
//! run between instructions at allocation points. Binary operators with
//! stack operands are followed in the code stream by an `MBIN` fallback
//! carrying the metamethod event; fast paths skip it by advancing the pc.

use crate::error::{VmError, VmResult};
use crate::frame::{Frame, FrameStatus, MULTRET};
use crate::gc::{GcClass, GcProto, Heap};
use crate::meta::{binop_error, order_error, Mm};
use crate::object::{Pset, Receiver};
use crate::op_code::{OpCode, LONG_IMM_OFFSET, SHORT_IMM_OFFSET};
use crate::state::State;
use crate::strings::str_to_number;
use crate::value::{flt_to_int, int_fits_flt, F2I, Value};

/// Minimum free slots guaranteed to a native function.
pub const MIN_NATIVE_STACK: usize = 20;

/* {====================================================================
** Coercions
** ==================================================================== */

/// Coerce to a number value (strings that parse as numbers count).
pub(crate) fn to_number(heap: &Heap, v: Value) -> Option<Value> {
    match v {
        Value::Int(_) | Value::Float(_) => Some(v),
        Value::Str(s) => {
            let text = std::str::from_utf8(heap.str_bytes(s)).ok()?;
            str_to_number(text).map(|(n, _)| n)
        }
        _ => None,
    }
}

/// Coerce to a float.
pub(crate) fn to_float(heap: &Heap, v: Value) -> Option<f64> {
    match to_number(heap, v)? {
        Value::Int(i) => Some(i as f64),
        Value::Float(f) => Some(f),
        _ => unreachable!(),
    }
}

/// Coerce to an integer under the equality rounding mode.
pub(crate) fn to_integer(heap: &Heap, v: Value) -> Option<i64> {
    match to_number(heap, v)? {
        Value::Int(i) => Some(i),
        Value::Float(f) => flt_to_int(f, F2I::Exact),
        _ => unreachable!(),
    }
}

/* }==================================================================== */

/* {====================================================================
** Raw arithmetic
** ==================================================================== */

/// Floored integer division; division by zero raises, `MIN / -1` wraps.
pub fn int_div(x: i64, y: i64) -> VmResult<i64> {
    if y == 0 {
        return Err(VmError::runtime("divide by zero"));
    }
    if y == -1 {
        return Ok(x.wrapping_neg());
    }
    let mut q = x / y;
    if (x ^ y) < 0 && x % y != 0 {
        q -= 1; // floor the quotient
    }
    Ok(q)
}

/// Floored integer modulo; the result takes the divisor's sign.
pub fn int_mod(x: i64, y: i64) -> VmResult<i64> {
    if y == 0 {
        return Err(VmError::runtime("attempt to perform 'n%0'"));
    }
    if y == -1 {
        return Ok(0);
    }
    let mut r = x % y;
    if r != 0 && (r ^ y) < 0 {
        r += y;
    }
    Ok(r)
}

/// Float modulo with the divisor's sign.
pub fn flt_mod(x: f64, y: f64) -> f64 {
    let mut r = x % y;
    if r != 0.0 && (r < 0.0) != (y < 0.0) {
        r += y;
    }
    r
}

/// Shift left; negative amounts shift right, |n| >= 64 yields 0.
pub fn shift_left(x: i64, n: i64) -> i64 {
    if n < 0 {
        shift_right(x, n.wrapping_neg())
    } else if n >= 64 {
        0
    } else {
        ((x as u64) << n) as i64
    }
}

/// Logical shift right; negative amounts shift left.
pub fn shift_right(x: i64, n: i64) -> i64 {
    if n < 0 {
        shift_left(x, n.wrapping_neg())
    } else if n >= 64 {
        0
    } else {
        ((x as u64) >> n) as i64
    }
}

/// Binary arithmetic/bitwise operator selector shared by the K/I/stack
/// opcode flavours; the discriminant matches the opcode group order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
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
}

impl ArithOp {
    fn event(self) -> Mm {
        match self {
            ArithOp::Add => Mm::Add,
            ArithOp::Sub => Mm::Sub,
            ArithOp::Mul => Mm::Mul,
            ArithOp::Div => Mm::Div,
            ArithOp::IDiv => Mm::IDiv,
            ArithOp::Mod => Mm::Mod,
            ArithOp::Pow => Mm::Pow,
            ArithOp::Shl => Mm::Shl,
            ArithOp::Shr => Mm::Shr,
            ArithOp::BAnd => Mm::BAnd,
            ArithOp::BOr => Mm::BOr,
            ArithOp::BXor => Mm::BXor,
        }
    }

    fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::Shl | ArithOp::Shr | ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor
        )
    }

    /// Division, modulo and pow never take the integer fast path wholesale;
    /// `Div` and `Pow` always produce floats.
    fn float_only(self) -> bool {
        matches!(self, ArithOp::Div | ArithOp::Pow)
    }
}

/// Raw arithmetic on two values, without metamethods. `None` means the
/// operands do not coerce and a metamethod should be sought.
fn raw_arith(heap: &Heap, op: ArithOp, a: Value, b: Value) -> Option<VmResult<Value>> {
    if op.is_bitwise() {
        let (x, y) = (to_integer(heap, a)?, to_integer(heap, b)?);
        let r = match op {
            ArithOp::Shl => shift_left(x, y),
            ArithOp::Shr => shift_right(x, y),
            ArithOp::BAnd => x & y,
            ArithOp::BOr => x | y,
            ArithOp::BXor => x ^ y,
            _ => unreachable!(),
        };
        return Some(Ok(Value::Int(r)));
    }
    if !op.float_only() {
        if let (Value::Int(x), Value::Int(y)) = (a, b) {
            let r = match op {
                ArithOp::Add => Ok(x.wrapping_add(y)),
                ArithOp::Sub => Ok(x.wrapping_sub(y)),
                ArithOp::Mul => Ok(x.wrapping_mul(y)),
                ArithOp::IDiv => int_div(x, y),
                ArithOp::Mod => int_mod(x, y),
                _ => unreachable!(),
            };
            return Some(r.map(Value::Int));
        }
    }
    let (x, y) = (to_float(heap, a)?, to_float(heap, b)?);
    let r = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::IDiv => (x / y).floor(),
        ArithOp::Mod => flt_mod(x, y),
        ArithOp::Pow => x.powf(y),
        _ => unreachable!(),
    };
    Some(Ok(Value::Float(r)))
}

/* }==================================================================== */

/* {====================================================================
** Ordering
** ==================================================================== */

fn int_lt_flt(i: i64, f: f64) -> bool {
    if int_fits_flt(i) {
        (i as f64) < f
    } else {
        match flt_to_int(f, F2I::Ceil) {
            Some(fi) => i < fi,
            None => f > 0.0,
        }
    }
}

fn flt_lt_int(f: f64, i: i64) -> bool {
    if int_fits_flt(i) {
        f < i as f64
    } else {
        match flt_to_int(f, F2I::Floor) {
            Some(fi) => fi < i,
            None => f < 0.0,
        }
    }
}

fn int_le_flt(i: i64, f: f64) -> bool {
    if int_fits_flt(i) {
        (i as f64) <= f
    } else {
        match flt_to_int(f, F2I::Floor) {
            Some(fi) => i <= fi,
            None => f > 0.0,
        }
    }
}

fn flt_le_int(f: f64, i: i64) -> bool {
    if int_fits_flt(i) {
        f <= i as f64
    } else {
        match flt_to_int(f, F2I::Ceil) {
            Some(fi) => fi <= i,
            None => f < 0.0,
        }
    }
}

/// `<` on two number values (NaN compares false).
pub(crate) fn num_lt(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x < y,
        (Value::Float(x), Value::Float(y)) => x < y,
        (Value::Int(x), Value::Float(y)) => int_lt_flt(x, y),
        (Value::Float(x), Value::Int(y)) => flt_lt_int(x, y),
        _ => unreachable!("number ordering on non-numbers"),
    }
}

/// `<=` on two number values.
pub(crate) fn num_le(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x <= y,
        (Value::Float(x), Value::Float(y)) => x <= y,
        (Value::Int(x), Value::Float(y)) => int_le_flt(x, y),
        (Value::Float(x), Value::Int(y)) => flt_le_int(x, y),
        _ => unreachable!("number ordering on non-numbers"),
    }
}

fn is_number(v: Value) -> bool {
    matches!(v, Value::Int(_) | Value::Float(_))
}

/* }==================================================================== */

impl State {
    /* {================================================================
    ** Equality and ordering with metamethods
    ** ================================================================ */

    /// Full equality: raw rules, then `__eq` for userdata pairs and for
    /// instances of the same class.
    pub fn value_eq(&mut self, a: Value, b: Value) -> VmResult<bool> {
        let mm = match (a, b) {
            (Value::UserData(u1), Value::UserData(u2)) => {
                if u1 == u2 {
                    return Ok(true);
                }
                let mt1 = self.heap.userdata(u1).metatable;
                let mt2 = self.heap.userdata(u2).metatable;
                match self.heap.get_mm(mt1, Mm::Eq) {
                    Some(f) => Some(f),
                    None => self.heap.get_mm(mt2, Mm::Eq),
                }
            }
            (Value::Instance(i1), Value::Instance(i2)) => {
                if i1 == i2 {
                    return Ok(true);
                }
                if self.heap.instance(i1).class != self.heap.instance(i2).class {
                    return Ok(false);
                }
                let mt = self.heap.class(self.heap.instance(i1).class).metatable;
                self.heap.get_mm(mt, Mm::Eq)
            }
            _ => return Ok(self.heap.raw_eq(a, b)),
        };
        match mm {
            None => Ok(self.heap.raw_eq(a, b)),
            Some(f) => {
                let r = self.call_mm_binres(f, a, b)?;
                Ok(!r.is_falsey())
            }
        }
    }

    /// `<` with string ordering and the `__lt` metamethod.
    pub fn value_lt(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if is_number(a) && is_number(b) {
            return Ok(num_lt(a, b));
        }
        if let (Value::Str(x), Value::Str(y)) = (a, b) {
            return Ok(self.heap.str_cmp(x, y) == std::cmp::Ordering::Less);
        }
        self.order_mm(a, b, Mm::Lt)
    }

    /// `<=` with string ordering and the `__le` metamethod; `<=` never
    /// falls back to `not (b < a)`.
    pub fn value_le(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if is_number(a) && is_number(b) {
            return Ok(num_le(a, b));
        }
        if let (Value::Str(x), Value::Str(y)) = (a, b) {
            return Ok(self.heap.str_cmp(x, y) != std::cmp::Ordering::Greater);
        }
        self.order_mm(a, b, Mm::Le)
    }

    fn order_mm(&mut self, a: Value, b: Value, event: Mm) -> VmResult<bool> {
        let f = self
            .heap
            .get_obj_mm(a, event)
            .or_else(|| self.heap.get_obj_mm(b, event));
        match f {
            Some(f) => {
                let r = self.call_mm_binres(f, a, b)?;
                Ok(!r.is_falsey())
            }
            None => Err(order_error(&mut self.heap, a, b)),
        }
    }

    /* }================================================================ */

    /* {================================================================
    ** Metamethod invocation helpers (use the scratch area above the top)
    ** ================================================================ */

    /// Call `f(a, b)` expecting one result.
    pub(crate) fn call_mm_binres(&mut self, f: Value, a: Value, b: Value) -> VmResult<Value> {
        self.ensure_stack(3)?;
        let func = self.top;
        self.push(f);
        self.push(a);
        self.push(b);
        self.call_value(func, 1)?;
        Ok(self.pop())
    }

    /// Call `f(obj, key)` expecting one result (`__getidx`).
    fn call_mm_getres(&mut self, f: Value, obj: Value, key: Value) -> VmResult<Value> {
        self.call_mm_binres(f, obj, key)
    }

    /// Call `f(obj, key, v)` expecting no results (`__setidx`).
    fn call_mm_set(&mut self, f: Value, obj: Value, key: Value, v: Value) -> VmResult<()> {
        self.ensure_stack(4)?;
        let func = self.top;
        self.push(f);
        self.push(obj);
        self.push(key);
        self.push(v);
        self.call_value(func, 0)
    }

    /// Binary operator fallback: left operand's metamethod, then right's.
    /// Instances of one shared class get a single lookup.
    pub(crate) fn try_bin_mm(&mut self, a: Value, b: Value, event: Mm) -> VmResult<Value> {
        let f = match (a, b) {
            (Value::Instance(i1), Value::Instance(i2))
                if self.heap.instance(i1).class == self.heap.instance(i2).class =>
            {
                self.heap.get_obj_mm(a, event)
            }
            _ => self
                .heap
                .get_obj_mm(a, event)
                .or_else(|| self.heap.get_obj_mm(b, event)),
        };
        match f {
            Some(f) => self.call_mm_binres(f, a, b),
            None => Err(binop_error(&mut self.heap, a, b, event)),
        }
    }

    /// Unary operator fallback; the operand doubles as both arguments.
    fn try_unary_mm(&mut self, v: Value, event: Mm) -> VmResult<Value> {
        match self.heap.get_obj_mm(v, event) {
            Some(f) => self.call_mm_binres(f, v, v),
            None => Err(binop_error(&mut self.heap, v, v, event)),
        }
    }

    /* }================================================================ */

    /* {================================================================
    ** Indexed access
    ** ================================================================ */

    /// Raw indexed read on lists, tables and instances (instance misses
    /// fall back to the class method table, materialising a bound method).
    pub fn raw_index_get(&mut self, obj: Value, key: Value) -> VmResult<Value> {
        match obj {
            Value::List(l) => self.heap.list_get(l, key),
            Value::Table(t) => Ok(self.heap.table_get(t, key).unwrap_or(Value::Nil)),
            Value::Instance(i) => {
                let fields = self.heap.instance(i).fields;
                if let Some(v) = self.heap.table_get(fields, key) {
                    return Ok(v);
                }
                let class = self.heap.instance(i).class;
                if let Some(methods) = self.heap.class(class).methods {
                    if let Some(m) = self.heap.table_get(methods, key) {
                        let bm = self.heap.method_new(Receiver::Instance(i), m);
                        return Ok(Value::Method(bm));
                    }
                }
                Ok(Value::Nil)
            }
            _ => Err(self.index_type_error(obj)),
        }
    }

    /// Indexed read dispatching `__getidx` when present.
    pub fn index_get(&mut self, obj: Value, key: Value) -> VmResult<Value> {
        match self.heap.get_obj_mm(obj, Mm::GetIdx) {
            Some(f) => self.call_mm_getres(f, obj, key),
            None => self.raw_index_get(obj, key),
        }
    }

    /// Raw indexed write; table writes go through the pre-set protocol and
    /// maintain barriers and the metamethod cache.
    pub fn raw_index_set(&mut self, obj: Value, key: Value, v: Value) -> VmResult<()> {
        let table = match obj {
            Value::List(l) => {
                self.heap.list_set(l, key, v)?;
                return Ok(());
            }
            Value::Table(t) => t,
            Value::Instance(i) => self.heap.instance(i).fields,
            _ => return Err(self.index_type_error(obj)),
        };
        match self.heap.table_pset(table, key, v) {
            Pset::Ok => {}
            code => {
                self.heap.table_finish_set(table, key, v, code)?;
                self.heap.table_mut(table).invalidate_mm_cache();
            }
        }
        self.heap.barrier_back(table.raw());
        Ok(())
    }

    /// Indexed write dispatching `__setidx` when present.
    pub fn index_set(&mut self, obj: Value, key: Value, v: Value) -> VmResult<()> {
        match self.heap.get_obj_mm(obj, Mm::SetIdx) {
            Some(f) => self.call_mm_set(f, obj, key, v),
            None => self.raw_index_set(obj, key, v),
        }
    }

    fn index_type_error(&mut self, obj: Value) -> VmError {
        let tn = self.heap.type_name_of(obj);
        VmError::runtime(format!("attempt to index a {tn} value"))
    }

    /* }================================================================ */

    /* {================================================================
    ** Concatenation
    ** ================================================================ */

    /// Concatenate the top `total` values into one, right to left.
    pub(crate) fn concat(&mut self, total: usize) -> VmResult<()> {
        let mut left = total;
        while left > 1 {
            let b = self.peek(0);
            let a = self.peek(1);
            let result = match (a, b) {
                (Value::Str(x), Value::Str(y)) => {
                    if self.heap.str(y).is_empty() {
                        a
                    } else if self.heap.str(x).is_empty() {
                        b
                    } else {
                        let mut bytes =
                            Vec::with_capacity(self.heap.str(x).len() + self.heap.str(y).len());
                        bytes.extend_from_slice(self.heap.str_bytes(x));
                        bytes.extend_from_slice(self.heap.str_bytes(y));
                        Value::Str(self.heap.new_string(&bytes))
                    }
                }
                _ => self.try_bin_mm(a, b, Mm::Concat)?,
            };
            self.set_peek(1, result);
            self.pop_n(1);
            left -= 1;
        }
        Ok(())
    }

    /* }================================================================ */

    /* {================================================================
    ** Calls
    ** ================================================================ */

    /// Move `nres` results sitting at the stack top to `res`, adjusting
    /// for the caller's expectation.
    fn move_results(&mut self, res: usize, nres: usize, wanted: i32) {
        let wanted = if wanted == MULTRET {
            nres
        } else {
            wanted as usize
        };
        let first = self.top - nres;
        let moved = nres.min(wanted);
        for i in 0..moved {
            self.stack[res + i] = self.stack[first + i];
        }
        for i in moved..wanted {
            self.stack[res + i] = Value::Nil;
        }
        self.top = res + wanted;
    }

    /// Finish a call: move results into the function slot and unlink the
    /// frame.
    fn poscall(&mut self, nres: usize) {
        let frame = self.frames.pop().expect("active frame");
        self.move_results(frame.func, nres, frame.nresults);
    }

    /// Prepare a call to the value at `func`. Native callees run to
    /// completion and return `false`; a script callee pushes a frame and
    /// returns `true` so the interpreter can enter it.
    fn precall(&mut self, func: usize, nresults: i32) -> VmResult<bool> {
        loop {
            match self.stack[func] {
                Value::Closure(cl) => {
                    let proto = self.heap.closure(cl).proto;
                    let (arity, max_stack, is_vararg) = {
                        let p = self.heap.proto(proto);
                        (p.arity as usize, p.max_stack as usize, p.is_vararg)
                    };
                    let mut nargs = self.top - func - 1;
                    self.ensure_stack(max_stack)?;
                    self.frames.push(Frame {
                        func,
                        top: func + 1 + max_stack,
                        pc: 0,
                        nresults,
                        status: FrameStatus::empty(),
                        nvarargs: 0,
                    });
                    while nargs < arity {
                        self.push(Value::Nil);
                        nargs += 1;
                    }
                    if !is_vararg {
                        self.top = func + 1 + arity; // drop extra arguments
                    }
                    return Ok(true);
                }
                Value::Native(f) => {
                    return self.call_native(func, nresults, f).map(|_| false);
                }
                Value::NativeClosure(nc) => {
                    let f = self.heap.native_closure(nc).func;
                    return self.call_native(func, nresults, f).map(|_| false);
                }
                Value::Class(cls) => {
                    let mt = self.heap.class(cls).metatable;
                    let ins = self.heap.instance_new(cls);
                    self.heap.check_fin(ins.raw(), mt);
                    self.stack[func] = Value::Instance(ins);
                    if let Some(init) = self.heap.get_mm(mt, Mm::Init) {
                        self.insert_at(func, init)?;
                        continue; // call __init with the instance first
                    }
                    self.top = func + 1; // drop the arguments
                    self.move_results(func, 1, nresults);
                    return Ok(false);
                }
                Value::Method(bm) => {
                    let (recv, method) = {
                        let m = self.heap.method(bm);
                        (m.receiver.as_value(), m.method)
                    };
                    self.insert_at(func, method)?;
                    self.stack[func + 1] = recv;
                    continue;
                }
                other => match self.heap.get_obj_mm(other, Mm::Call) {
                    Some(f) => {
                        self.insert_at(func, f)?;
                        continue;
                    }
                    None => {
                        let tn = self.heap.type_name_of(other);
                        let name = self.callee_name(func);
                        return Err(VmError::runtime(match name {
                            Some(n) => format!("attempt to call a {tn} value ({n})"),
                            None => format!("attempt to call a {tn} value"),
                        }));
                    }
                },
            }
        }
    }

    /// Shift the stack up one slot from `func` and insert `v` there.
    fn insert_at(&mut self, func: usize, v: Value) -> VmResult<()> {
        self.ensure_stack(1)?;
        let mut p = self.top;
        while p > func {
            self.stack[p] = self.stack[p - 1];
            p -= 1;
        }
        self.top += 1;
        self.stack[func] = v;
        Ok(())
    }

    fn call_native(
        &mut self,
        func: usize,
        nresults: i32,
        f: crate::value::NativeFn,
    ) -> VmResult<()> {
        self.ensure_stack(MIN_NATIVE_STACK)?;
        self.frames.push(Frame {
            func,
            top: self.top + MIN_NATIVE_STACK,
            pc: 0,
            nresults,
            status: FrameStatus::NATIVE,
            nvarargs: 0,
        });
        let n = f(self)? as usize;
        debug_assert!(n <= self.top - func);
        self.poscall(n);
        Ok(())
    }

    /// Call the value at stack slot `func` with the arguments above it.
    pub fn call_value(&mut self, func: usize, nresults: i32) -> VmResult<()> {
        if self.n_calls >= crate::state::MAX_NESTED_CALLS {
            return Err(VmError::runtime("native call stack overflow"));
        }
        self.n_calls += 1;
        let result = (|| -> VmResult<()> {
            if self.precall(func, nresults)? {
                let idx = self.frames.len() - 1;
                self.frames[idx].status |= FrameStatus::FRESH;
                self.execute()?;
            }
            Ok(())
        })();
        self.n_calls -= 1;
        result
    }

    /* }================================================================ */

    /* {================================================================
    ** Vararg handling
    ** ================================================================ */

    /// Rotate the function and its fixed parameters above the varargs.
    fn adjust_varargs(&mut self, arity: usize) -> VmResult<()> {
        let frame_idx = self.frames.len() - 1;
        let func = self.frames[frame_idx].func;
        let actual = self.top - func - 1;
        let extra = actual.saturating_sub(arity);
        let max_stack = {
            let Value::Closure(cl) = self.stack[func] else {
                unreachable!("vararg prep outside a script frame")
            };
            self.heap.proto(self.heap.closure(cl).proto).max_stack as usize
        };
        self.frames[frame_idx].nvarargs = extra;
        self.ensure_stack(max_stack + 1)?;
        let fv = self.stack[func];
        self.push(fv);
        for i in 1..=arity {
            let v = self.stack[func + i];
            self.push(v);
            self.stack[func + i] = Value::Nil; // old copies die to the GC
        }
        self.frames[frame_idx].func += actual + 1;
        self.frames[frame_idx].top += actual + 1;
        Ok(())
    }

    /// Push `wanted` varargs (MULTRET = all of them).
    fn push_varargs(&mut self, wanted: i32) -> VmResult<()> {
        let frame = self.frames.last().expect("active frame").clone();
        let have = frame.nvarargs;
        let wanted = if wanted < 0 {
            self.ensure_stack(have)?;
            have
        } else {
            wanted as usize
        };
        for i in 0..wanted {
            if i < have {
                let v = self.stack[frame.func - have + i];
                self.push(v);
            } else {
                self.push(Value::Nil);
            }
        }
        Ok(())
    }

    /* }================================================================ */

    /* {================================================================
    ** Scope closing
    ** ================================================================ */

    /// Close upvalues and to-be-closed variables down to `level`,
    /// calling `__close(value, errobj)` in reverse declaration order.
    pub(crate) fn close_scopes(&mut self, level: usize, errobj: Value) -> VmResult<()> {
        self.close_upvalues(level);
        while let Some(&tbc_level) = self.tbc.last() {
            if tbc_level < level {
                break;
            }
            self.tbc.pop();
            let v = self.stack[tbc_level];
            let f = self
                .heap
                .get_obj_mm(v, Mm::Close)
                .expect("TBC registration verified __close");
            self.ensure_stack(3)?;
            let func = self.top;
            self.push(f);
            self.push(v);
            self.push(errobj);
            self.call_value(func, 0)?;
        }
        Ok(())
    }

    /* }================================================================ */

    /* {================================================================
    ** Fetch helpers
    ** ================================================================ */

    #[inline]
    fn code_u8(&self, p: GcProto, pc: &mut usize) -> u8 {
        let b = self.heap.proto(p).code[*pc];
        *pc += 1;
        b
    }

    #[inline]
    fn code_u24(&self, p: GcProto, pc: &mut usize) -> u32 {
        let code = &self.heap.proto(p).code;
        let v = code[*pc] as u32 | (code[*pc + 1] as u32) << 8 | (code[*pc + 2] as u32) << 16;
        *pc += 3;
        v
    }

    fn konst(&self, p: GcProto, idx: usize) -> Value {
        self.heap.proto(p).consts[idx]
    }

    /* }================================================================ */

    /// Interpreter loop. Runs the topmost frame (and everything it calls)
    /// until that frame returns.
    pub(crate) fn execute(&mut self) -> VmResult<()> {
        'reentry: loop {
            let frame_idx = self.frames.len() - 1;
            let Value::Closure(cl) = self.stack[self.frames[frame_idx].func] else {
                unreachable!("interpreter entered on a non-closure")
            };
            let proto = self.heap.closure(cl).proto;
            let mut base = self.frames[frame_idx].base();
            let mut pc = self.frames[frame_idx].pc;

            macro_rules! save_pc {
                ($inst_start:expr) => {
                    self.frames[frame_idx].pc = $inst_start
                };
            }

            loop {
                let inst_start = pc;
                if self.heap.debt > 0 && self.gc_running() {
                    save_pc!(inst_start);
                    self.check_gc()?;
                }
                let op = OpCode::from_u8(self.code_u8(proto, &mut pc))
                    .expect("codegen emits valid opcodes");
                match op {
                    OpCode::TRUE => self.push(Value::Bool(true)),
                    OpCode::FALSE => self.push(Value::Bool(false)),
                    OpCode::NIL => {
                        let n = self.code_u24(proto, &mut pc) as usize;
                        self.ensure_stack(n)?;
                        for _ in 0..n {
                            self.push(Value::Nil);
                        }
                    }
                    OpCode::SUPER => {
                        save_pc!(inst_start);
                        let v = self.peek(0);
                        let Value::Instance(ins) = v else {
                            return Err(VmError::runtime("local 'self' is not an instance"));
                        };
                        let class = self.heap.instance(ins).class;
                        let sup = match self.heap.class(class).superclass {
                            Some(s) => Value::Class(s),
                            None => Value::Nil,
                        };
                        self.set_peek(0, sup);
                    }
                    OpCode::LOAD | OpCode::GETLOCAL => {
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let v = self.stack[base + i];
                        self.push(v);
                    }
                    OpCode::SETLOCAL => {
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let v = self.pop();
                        self.stack[base + i] = v;
                    }
                    OpCode::CONST => {
                        let i = self.code_u8(proto, &mut pc) as usize;
                        let k = self.konst(proto, i);
                        self.push(k);
                    }
                    OpCode::CONSTL => {
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let k = self.konst(proto, i);
                        self.push(k);
                    }
                    OpCode::CONSTI => {
                        let raw = self.code_u8(proto, &mut pc);
                        self.push(Value::Int(raw as i64 - SHORT_IMM_OFFSET));
                    }
                    OpCode::CONSTIL => {
                        let raw = self.code_u24(proto, &mut pc);
                        self.push(Value::Int(raw as i64 - LONG_IMM_OFFSET));
                    }
                    OpCode::CONSTF => {
                        let raw = self.code_u8(proto, &mut pc);
                        self.push(Value::Float((raw as i64 - SHORT_IMM_OFFSET) as f64));
                    }
                    OpCode::CONSTFL => {
                        let raw = self.code_u24(proto, &mut pc);
                        self.push(Value::Float((raw as i64 - LONG_IMM_OFFSET) as f64));
                    }
                    OpCode::VARARGPREP => {
                        save_pc!(inst_start);
                        let arity = self.code_u24(proto, &mut pc) as usize;
                        self.adjust_varargs(arity)?;
                        base = self.frames[frame_idx].base();
                        self.frames[frame_idx].pc = pc;
                    }
                    OpCode::VARARG => {
                        save_pc!(inst_start);
                        let wanted = self.code_u24(proto, &mut pc) as i32 - 1;
                        self.push_varargs(wanted)?;
                    }
                    OpCode::CLOSURE => {
                        save_pc!(inst_start);
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let sub = self.heap.proto(proto).protos[i];
                        self.push_closure(sub, cl, base)?;
                    }
                    OpCode::NEWLIST => {
                        save_pc!(inst_start);
                        let b = self.code_u8(proto, &mut pc) as usize;
                        let l = self.heap.list_new();
                        self.push(Value::List(l));
                        if b > 0 {
                            self.heap.list_ensure(l, 1 << (b - 1));
                        }
                    }
                    OpCode::NEWCLASS => {
                        save_pc!(inst_start);
                        let mut b = self.code_u8(proto, &mut pc) as usize;
                        let cls = self.heap.class_new();
                        self.push(Value::Class(cls));
                        if b & 0x80 != 0 {
                            let mt = self.heap.table_new();
                            self.heap.class_mut(cls).metatable = Some(mt);
                            b &= 0x7f;
                        }
                        if b > 0 {
                            let ms = self.heap.table_new();
                            self.heap.table_resize(ms, 1 << (b - 1))?;
                            self.heap.class_mut(cls).methods = Some(ms);
                        }
                    }
                    OpCode::NEWTABLE => {
                        save_pc!(inst_start);
                        let b = self.code_u8(proto, &mut pc) as usize;
                        let t = self.heap.table_new();
                        self.push(Value::Table(t));
                        if b > 0 {
                            self.heap.table_resize(t, 1 << (b - 1))?;
                        }
                    }
                    OpCode::METHOD => {
                        save_pc!(inst_start);
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let key = self.konst(proto, i);
                        let Value::Class(cls) = self.peek(1) else {
                            unreachable!("METHOD below a non-class")
                        };
                        let f = self.peek(0);
                        let methods = match self.heap.class(cls).methods {
                            Some(t) => t,
                            None => {
                                let t = self.heap.table_new();
                                self.heap.class_mut(cls).methods = Some(t);
                                self.heap.obj_barrier(cls.raw(), t.raw());
                                t
                            }
                        };
                        self.heap.table_set(methods, key, f)?;
                        self.heap.barrier_back(methods.raw());
                        self.heap.table_mut(methods).invalidate_mm_cache();
                        self.pop_n(2);
                    }
                    OpCode::SETTM => {
                        save_pc!(inst_start);
                        let ev = Mm::from_u8(self.code_u8(proto, &mut pc))
                            .expect("codegen emits valid events");
                        let key = Value::Str(self.heap.mm_names[ev as usize]);
                        self.set_class_metafield(key)?;
                    }
                    OpCode::SETMT => {
                        save_pc!(inst_start);
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let key = self.konst(proto, i);
                        self.set_class_metafield(key)?;
                    }
                    OpCode::POP => {
                        let n = self.code_u24(proto, &mut pc) as usize;
                        self.pop_n(n);
                    }
                    OpCode::MBIN => {
                        save_pc!(inst_start);
                        let ev = Mm::from_u8(self.code_u8(proto, &mut pc))
                            .expect("codegen emits valid events");
                        let v1 = self.peek(1);
                        let v2 = self.peek(0);
                        let r = self
                            .try_bin_mm(v1, v2, ev)
                            .map_err(|e| self.name_offending_operand(e, v1, v2))?;
                        self.set_peek(1, r);
                        self.pop_n(1);
                    }
                    // arithmetic/bitwise, constant operand
                    OpCode::ADDK
                    | OpCode::SUBK
                    | OpCode::MULK
                    | OpCode::DIVK
                    | OpCode::IDIVK
                    | OpCode::MODK
                    | OpCode::POWK
                    | OpCode::BSHLK
                    | OpCode::BSHRK
                    | OpCode::BANDK
                    | OpCode::BORK
                    | OpCode::BXORK => {
                        save_pc!(inst_start);
                        let aop = arith_of(op);
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let lk = self.konst(proto, i);
                        let v = self.peek(0);
                        match raw_arith(&self.heap, aop, v, lk) {
                            Some(r) => self.set_peek(0, r?),
                            None => {
                                return Err(binop_error(&mut self.heap, v, lk, aop.event()))
                            }
                        }
                    }
                    // arithmetic/bitwise, immediate operand
                    OpCode::ADDI
                    | OpCode::SUBI
                    | OpCode::MULI
                    | OpCode::DIVI
                    | OpCode::IDIVI
                    | OpCode::MODI
                    | OpCode::POWI
                    | OpCode::BSHLI
                    | OpCode::BSHRI
                    | OpCode::BANDI
                    | OpCode::BORI
                    | OpCode::BXORI => {
                        save_pc!(inst_start);
                        let aop = arith_of(op);
                        let raw = self.code_u24(proto, &mut pc);
                        let imm = Value::Int(raw as i64 - LONG_IMM_OFFSET);
                        let v = self.peek(0);
                        match raw_arith(&self.heap, aop, v, imm) {
                            Some(r) => self.set_peek(0, r?),
                            None => {
                                return Err(binop_error(&mut self.heap, v, imm, aop.event()))
                            }
                        }
                    }
                    // arithmetic/bitwise, stack operands with MBIN fallback
                    OpCode::ADD
                    | OpCode::SUB
                    | OpCode::MUL
                    | OpCode::DIV
                    | OpCode::IDIV
                    | OpCode::MOD
                    | OpCode::POW
                    | OpCode::BSHL
                    | OpCode::BSHR
                    | OpCode::BAND
                    | OpCode::BOR
                    | OpCode::BXOR => {
                        save_pc!(inst_start);
                        let aop = arith_of(op);
                        let swap = self.code_u8(proto, &mut pc) != 0;
                        let (mut v1, mut v2) = (self.peek(1), self.peek(0));
                        if swap {
                            std::mem::swap(&mut v1, &mut v2);
                        }
                        match raw_arith(&self.heap, aop, v1, v2) {
                            Some(r) => {
                                self.set_peek(1, r?);
                                self.pop_n(1);
                                pc += OpCode::MBIN.size(); // skip the fallback
                            }
                            None => {
                                // fall through to MBIN; make the stack
                                // reflect the semantic operand order
                                if swap {
                                    self.set_peek(1, v1);
                                    self.set_peek(0, v2);
                                }
                            }
                        }
                    }
                    OpCode::CONCAT => {
                        save_pc!(inst_start);
                        let total = self.code_u24(proto, &mut pc) as usize;
                        self.concat(total)?;
                        self.check_gc()?;
                    }
                    OpCode::EQK => {
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let expected = self.code_u8(proto, &mut pc) != 0;
                        let vk = self.konst(proto, i);
                        let v = self.peek(0);
                        let cond = self.heap.raw_eq(v, vk);
                        self.set_peek(0, Value::Bool(cond == expected));
                    }
                    OpCode::EQI => {
                        let raw = self.code_u24(proto, &mut pc);
                        let expected = self.code_u8(proto, &mut pc) != 0;
                        let imm = raw as i64 - LONG_IMM_OFFSET;
                        let cond = match self.peek(0) {
                            Value::Int(i) => i == imm,
                            Value::Float(f) => f == imm as f64,
                            _ => false,
                        };
                        self.set_peek(0, Value::Bool(cond == expected));
                    }
                    OpCode::LTI | OpCode::LEI | OpCode::GTI | OpCode::GEI => {
                        save_pc!(inst_start);
                        let raw = self.code_u24(proto, &mut pc);
                        let imm = raw as i64 - LONG_IMM_OFFSET;
                        let v = self.peek(0);
                        let cond = match v {
                            Value::Int(i) => match op {
                                OpCode::LTI => i < imm,
                                OpCode::LEI => i <= imm,
                                OpCode::GTI => i > imm,
                                _ => i >= imm,
                            },
                            Value::Float(f) => match op {
                                OpCode::LTI => f < imm as f64,
                                OpCode::LEI => f <= imm as f64,
                                OpCode::GTI => f > imm as f64,
                                _ => f >= imm as f64,
                            },
                            _ => {
                                return Err(order_error(&mut self.heap, v, Value::Int(imm)));
                            }
                        };
                        self.set_peek(0, Value::Bool(cond));
                    }
                    OpCode::EQ => {
                        save_pc!(inst_start);
                        let expected = self.code_u8(proto, &mut pc) != 0;
                        let (v1, v2) = (self.peek(1), self.peek(0));
                        let cond = self.value_eq(v1, v2)?;
                        self.set_peek(1, Value::Bool(cond == expected));
                        self.pop_n(1);
                    }
                    OpCode::LT | OpCode::LE => {
                        save_pc!(inst_start);
                        let swap = self.code_u8(proto, &mut pc) != 0;
                        let (mut v1, mut v2) = (self.peek(1), self.peek(0));
                        if swap {
                            std::mem::swap(&mut v1, &mut v2);
                        }
                        let cond = if op == OpCode::LT {
                            self.value_lt(v1, v2)?
                        } else {
                            self.value_le(v1, v2)?
                        };
                        self.set_peek(1, Value::Bool(cond));
                        self.pop_n(1);
                    }
                    OpCode::EQPRESERVE => {
                        save_pc!(inst_start);
                        let (v1, v2) = (self.peek(1), self.peek(0));
                        let cond = self.value_eq(v1, v2)?;
                        self.set_peek(0, Value::Bool(cond));
                    }
                    OpCode::NOT => {
                        let v = self.peek(0);
                        self.set_peek(0, Value::Bool(v.is_falsey()));
                    }
                    OpCode::UNM => {
                        save_pc!(inst_start);
                        let v = self.peek(0);
                        let r = match v {
                            Value::Int(i) => Value::Int(i.wrapping_neg()),
                            Value::Float(f) => Value::Float(-f),
                            _ => self.try_unary_mm(v, Mm::Unm)?,
                        };
                        self.set_peek(0, r);
                    }
                    OpCode::BNOT => {
                        save_pc!(inst_start);
                        let v = self.peek(0);
                        let r = match v {
                            Value::Int(i) => Value::Int(!i),
                            _ => self.try_unary_mm(v, Mm::BNot)?,
                        };
                        self.set_peek(0, r);
                    }
                    OpCode::JMP => {
                        let off = self.code_u24(proto, &mut pc) as usize;
                        pc += off;
                    }
                    OpCode::JMPS => {
                        let off = self.code_u24(proto, &mut pc) as usize;
                        pc -= off;
                    }
                    OpCode::TEST | OpCode::TESTPOP => {
                        let expected = self.code_u8(proto, &mut pc) != 0;
                        let v = self.peek(0);
                        if op == OpCode::TESTPOP {
                            self.pop_n(1);
                        }
                        if !v.is_falsey() != expected {
                            // not taken: skip the unconditional jump
                            pc += OpCode::JMP.size();
                        }
                    }
                    OpCode::CALL => {
                        let func = base + self.code_u24(proto, &mut pc) as usize;
                        let nres = self.code_u24(proto, &mut pc) as i32 - 1;
                        self.frames[frame_idx].pc = pc; // resume after the call
                        if self.precall(func, nres)? {
                            continue 'reentry;
                        }
                    }
                    OpCode::CLOSE => {
                        save_pc!(inst_start);
                        let level = base + self.code_u24(proto, &mut pc) as usize;
                        self.close_scopes(level, Value::Nil)?;
                    }
                    OpCode::TBC => {
                        save_pc!(inst_start);
                        let level = base + self.code_u24(proto, &mut pc) as usize;
                        self.new_tbc(level)?;
                    }
                    OpCode::CHECKADJ => {
                        save_pc!(inst_start);
                        let first = base + self.code_u24(proto, &mut pc) as usize;
                        let nres1 = self.code_u24(proto, &mut pc) as usize;
                        debug_assert!(nres1 >= 1, "CHECKADJ takes a fixed count");
                        let target = first + nres1.saturating_sub(1);
                        self.ensure_stack(target.saturating_sub(self.top))?;
                        for i in self.top..target {
                            self.stack[i] = Value::Nil;
                        }
                        self.top = target;
                    }
                    OpCode::GETUVAL => {
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let uv = self.heap.closure(cl).upvals[i];
                        let v = self.heap.upval_get(uv, &self.stack);
                        self.push(v);
                    }
                    OpCode::SETUVAL => {
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let uv = self.heap.closure(cl).upvals[i];
                        let v = self.pop();
                        match self.heap.upval(uv).state {
                            crate::object::UpvalState::Open(level) => self.stack[level] = v,
                            crate::object::UpvalState::Closed(_) => {
                                self.heap.upval_mut(uv).state =
                                    crate::object::UpvalState::Closed(v);
                            }
                        }
                        self.heap.barrier(uv.raw(), v);
                    }
                    OpCode::SETLIST => {
                        save_pc!(inst_start);
                        let sl = base + self.code_u24(proto, &mut pc) as usize;
                        let len = self.code_u24(proto, &mut pc) as usize;
                        let mut n = self.code_u8(proto, &mut pc) as usize;
                        let Value::List(l) = self.stack[sl] else {
                            unreachable!("SETLIST on a non-list")
                        };
                        if self.heap.list(l).len() == len {
                            if n == 0 {
                                n = self.top - sl - 1;
                            }
                            self.heap.list_ensure(l, len + n);
                            for i in 0..n {
                                let v = self.stack[sl + i + 1];
                                if v.is_nil() {
                                    break; // a hole ends the batch
                                }
                                self.heap.list_set_index(l, (len + i) as i64, v)?;
                            }
                        }
                        self.top = sl + 1;
                    }
                    OpCode::SETPROPERTY | OpCode::SETINDEXSTR => {
                        save_pc!(inst_start);
                        let depth = self.code_u24(proto, &mut pc) as usize;
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let key = self.konst(proto, i);
                        let v = self.peek(0);
                        let o = self.peek(depth);
                        self.index_set(o, key, v)?;
                        self.pop_n(1);
                    }
                    OpCode::GETPROPERTY | OpCode::GETINDEXSTR => {
                        save_pc!(inst_start);
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let key = self.konst(proto, i);
                        let o = self.peek(0);
                        let r = self.index_get(o, key)?;
                        self.set_peek(0, r);
                    }
                    OpCode::GETINDEX => {
                        save_pc!(inst_start);
                        let key = self.peek(0);
                        let o = self.peek(1);
                        let r = self.index_get(o, key)?;
                        self.set_peek(1, r);
                        self.pop_n(1);
                    }
                    OpCode::SETINDEX => {
                        save_pc!(inst_start);
                        let depth = self.code_u24(proto, &mut pc) as usize;
                        let v = self.peek(0);
                        let os = self.top - 1 - depth;
                        let o = self.stack[os];
                        let key = self.stack[os + 1];
                        self.index_set(o, key, v)?;
                        self.pop_n(1);
                    }
                    OpCode::GETINDEXINT => {
                        save_pc!(inst_start);
                        let raw = self.code_u8(proto, &mut pc);
                        let key = Value::Int(raw as i64 - SHORT_IMM_OFFSET);
                        let o = self.peek(0);
                        let r = self.index_get(o, key)?;
                        self.set_peek(0, r);
                    }
                    OpCode::GETINDEXINTL => {
                        save_pc!(inst_start);
                        let raw = self.code_u24(proto, &mut pc);
                        let key = Value::Int(raw as i64 - LONG_IMM_OFFSET);
                        let o = self.peek(0);
                        let r = self.index_get(o, key)?;
                        self.set_peek(0, r);
                    }
                    OpCode::SETINDEXINT => {
                        save_pc!(inst_start);
                        let depth = self.code_u24(proto, &mut pc) as usize;
                        let raw = self.code_u8(proto, &mut pc);
                        let key = Value::Int(raw as i64 - SHORT_IMM_OFFSET);
                        let v = self.peek(0);
                        let o = self.peek(depth);
                        self.index_set(o, key, v)?;
                        self.pop_n(1);
                    }
                    OpCode::SETINDEXINTL => {
                        save_pc!(inst_start);
                        let depth = self.code_u24(proto, &mut pc) as usize;
                        let raw = self.code_u24(proto, &mut pc);
                        let key = Value::Int(raw as i64 - LONG_IMM_OFFSET);
                        let v = self.peek(0);
                        let o = self.peek(depth);
                        self.index_set(o, key, v)?;
                        self.pop_n(1);
                    }
                    OpCode::GETSUP => {
                        save_pc!(inst_start);
                        let i = self.code_u24(proto, &mut pc) as usize;
                        let key = self.konst(proto, i);
                        let o = self.peek(0);
                        let r = self.super_lookup(o, key)?;
                        self.set_peek(0, r);
                    }
                    OpCode::GETSUPIDX => {
                        save_pc!(inst_start);
                        let key = self.peek(0);
                        let o = self.peek(1);
                        let r = self.super_lookup(o, key)?;
                        self.set_peek(1, r);
                        self.pop_n(1);
                    }
                    OpCode::INHERIT => {
                        save_pc!(inst_start);
                        let sup = self.peek(0);
                        let Value::Class(cls) = self.peek(1) else {
                            unreachable!("INHERIT below a non-class")
                        };
                        let Value::Class(supcls) = sup else {
                            let tn = self.heap.type_name_of(sup);
                            return Err(VmError::runtime(format!(
                                "cannot inherit from a {tn} value"
                            )));
                        };
                        self.inherit(cls, supcls)?;
                        self.pop_n(1);
                        self.check_gc()?;
                    }
                    OpCode::FORPREP => {
                        save_pc!(inst_start);
                        let stk = base + self.code_u24(proto, &mut pc) as usize;
                        self.new_tbc(stk + 3)?; // the loop's to-be-closed slot
                        let off = self.code_u24(proto, &mut pc) as usize;
                        pc += off; // lands on FORCALL
                    }
                    OpCode::FORCALL => {
                        save_pc!(inst_start);
                        let stk = base + self.code_u24(proto, &mut pc) as usize;
                        let nres = self.code_u24(proto, &mut pc) as i32;
                        self.ensure_stack(7)?;
                        for i in 0..3 {
                            let v = self.stack[stk + i];
                            self.stack[stk + 4 + i] = v;
                        }
                        self.top = stk + 4 + 3;
                        self.frames[frame_idx].pc = pc;
                        self.call_value(stk + 4, nres)?;
                        // next instruction is FORLOOP
                    }
                    OpCode::FORLOOP => {
                        let stk = base + self.code_u24(proto, &mut pc) as usize;
                        let off = self.code_u24(proto, &mut pc) as usize;
                        let nvars = self.code_u24(proto, &mut pc) as usize;
                        if !self.stack[stk + 4].is_nil() {
                            // continue: first result becomes the control var
                            self.stack[stk + 2] = self.stack[stk + 4];
                            pc -= off;
                        } else {
                            self.pop_n(nvars); // leave the loop
                        }
                    }
                    OpCode::TAILCALL => {
                        save_pc!(inst_start);
                        let func = base + self.code_u24(proto, &mut pc) as usize;
                        let _ = self.code_u24(proto, &mut pc); // results follow the caller
                        // codegen suppresses tail calls in scopes with live
                        // TBC variables; open upvalues still close here
                        self.close_scopes(base, Value::Nil)?;
                        let cur = self.frames[frame_idx].clone();
                        let mut dst = cur.func;
                        if self.heap.proto(proto).is_vararg {
                            dst -= cur.nvarargs + self.heap.proto(proto).arity as usize + 1;
                        }
                        let moved = self.top - func;
                        for i in 0..moved {
                            let v = self.stack[func + i];
                            self.stack[dst + i] = v;
                        }
                        self.top = dst + moved;
                        self.frames.pop();
                        if self.precall(dst, cur.nresults)? {
                            let idx = self.frames.len() - 1;
                            if cur.status.contains(FrameStatus::FRESH) {
                                self.frames[idx].status |= FrameStatus::FRESH;
                            }
                            continue 'reentry;
                        }
                        // a native (or class) callee already completed the
                        // whole call: unwind as RETURN would
                        if cur.status.contains(FrameStatus::FRESH) {
                            return Ok(());
                        }
                        continue 'reentry;
                    }
                    OpCode::RETURN => {
                        save_pc!(inst_start);
                        let stk = base + self.code_u24(proto, &mut pc) as usize;
                        let mut nres = self.code_u24(proto, &mut pc) as i32 - 1;
                        let close = self.code_u8(proto, &mut pc) != 0;
                        if nres < 0 {
                            nres = (self.top - stk) as i32;
                        }
                        if close {
                            self.close_scopes(base, Value::Nil)?;
                        }
                        if self.heap.proto(proto).is_vararg {
                            let f = &mut self.frames[frame_idx];
                            f.func -= f.nvarargs + self.heap.proto(proto).arity as usize + 1;
                        }
                        self.top = stk + nres as usize;
                        let fresh = self.frames[frame_idx]
                            .status
                            .contains(FrameStatus::FRESH);
                        self.poscall(nres as usize);
                        if fresh {
                            return Ok(());
                        }
                        continue 'reentry;
                    }
                }
            }
        }
    }

    /* {================================================================
    ** Interpreter helpers
    ** ================================================================ */

    /// Build a closure for a nested prototype, capturing upvalues from the
    /// enclosing frame.
    fn push_closure(
        &mut self,
        sub: GcProto,
        enclosing: crate::gc::GcClosure,
        base: usize,
    ) -> VmResult<()> {
        let descs = self.heap.proto(sub).upvals.clone();
        let cl = self.heap.closure_new(sub, descs.len());
        self.push(Value::Closure(cl));
        for (i, d) in descs.iter().enumerate() {
            let uv = if d.on_stack {
                self.find_upval(base + d.index as usize)
            } else {
                self.heap.closure(enclosing).upvals[d.index as usize]
            };
            self.heap.closure_mut(cl).upvals[i] = uv;
            self.heap.obj_barrier(cl.raw(), uv.raw());
        }
        self.check_gc()
    }

    /// Store the value below the top into the class metatable two below.
    fn set_class_metafield(&mut self, key: Value) -> VmResult<()> {
        let Value::Class(cls) = self.peek(1) else {
            unreachable!("metafield store below a non-class")
        };
        let v = self.peek(0);
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
        self.pop_n(2);
        Ok(())
    }

    /// Method lookup through the superclass of `self`'s class; methods
    /// always materialise as bound methods. Fields do not inherit.
    fn super_lookup(&mut self, o: Value, key: Value) -> VmResult<Value> {
        let Value::Instance(ins) = o else {
            return Err(VmError::runtime("local 'self' is not an instance"));
        };
        let class = self.heap.instance(ins).class;
        let Some(sup) = self.heap.class(class).superclass else {
            return Err(VmError::runtime("class instance has no superclass"));
        };
        if let Some(methods) = self.heap.class(sup).methods {
            if let Some(m) = self.heap.table_get(methods, key) {
                let bm = self.heap.method_new(Receiver::Instance(ins), m);
                return Ok(Value::Method(bm));
            }
        }
        Ok(Value::Nil)
    }

    /// Copy the superclass's method table and metatable into `cls` and set
    /// the superclass pointer.
    pub(crate) fn inherit(&mut self, cls: GcClass, supcls: GcClass) -> VmResult<()> {
        debug_assert_ne!(cls, supcls);
        if let Some(sms) = self.heap.class(supcls).methods {
            let dest = match self.heap.class(cls).methods {
                Some(t) => t,
                None => {
                    let t = self.heap.table_new();
                    self.heap.class_mut(cls).methods = Some(t);
                    t
                }
            };
            self.heap.table_copy(dest, sms)?;
            self.heap.table_mut(dest).invalidate_mm_cache();
            self.heap.obj_barrier(cls.raw(), dest.raw());
        }
        if let Some(smt) = self.heap.class(supcls).metatable {
            let dest = match self.heap.class(cls).metatable {
                Some(t) => t,
                None => {
                    let t = self.heap.table_new();
                    self.heap.class_mut(cls).metatable = Some(t);
                    t
                }
            };
            self.heap.table_copy(dest, smt)?;
            self.heap.table_mut(dest).invalidate_mm_cache();
            self.heap.obj_barrier(cls.raw(), dest.raw());
        }
        self.heap.class_mut(cls).superclass = Some(supcls);
        Ok(())
    }

    /// Best-effort symbolic name of the callee for call errors.
    fn callee_name(&self, func: usize) -> Option<String> {
        let frame = self.current_script_frame()?;
        if func < frame.base() {
            return None;
        }
        crate::trace::slot_origin(self, frame, func)
    }

    /// Append the symbolic origin of the operand at fault to a binary
    /// operator error, when the bytecode scan can recover one.
    fn name_offending_operand(&self, e: VmError, v1: Value, v2: Value) -> VmError {
        let VmError::Runtime { message } = &e else {
            return e;
        };
        if !message.starts_with("attempt to") || message.ends_with(')') {
            return e;
        }
        let Some(frame) = self.current_script_frame() else {
            return e;
        };
        // the operands sit in the two slots below the top
        let slot = if to_number(&self.heap, v1).is_none() {
            self.top - 2
        } else if to_number(&self.heap, v2).is_none() {
            self.top - 1
        } else {
            return e;
        };
        match crate::trace::slot_origin(self, frame, slot) {
            Some(origin) => VmError::runtime(format!("{message} ({origin})")),
            None => e,
        }
    }

    /* }================================================================ */
}

/// Map an arithmetic opcode (any flavour) to its operator.
fn arith_of(op: OpCode) -> ArithOp {
    match op {
        OpCode::ADD | OpCode::ADDK | OpCode::ADDI => ArithOp::Add,
        OpCode::SUB | OpCode::SUBK | OpCode::SUBI => ArithOp::Sub,
        OpCode::MUL | OpCode::MULK | OpCode::MULI => ArithOp::Mul,
        OpCode::DIV | OpCode::DIVK | OpCode::DIVI => ArithOp::Div,
        OpCode::IDIV | OpCode::IDIVK | OpCode::IDIVI => ArithOp::IDiv,
        OpCode::MOD | OpCode::MODK | OpCode::MODI => ArithOp::Mod,
        OpCode::POW | OpCode::POWK | OpCode::POWI => ArithOp::Pow,
        OpCode::BSHL | OpCode::BSHLK | OpCode::BSHLI => ArithOp::Shl,
        OpCode::BSHR | OpCode::BSHRK | OpCode::BSHRI => ArithOp::Shr,
        OpCode::BAND | OpCode::BANDK | OpCode::BANDI => ArithOp::BAnd,
        OpCode::BOR | OpCode::BORK | OpCode::BORI => ArithOp::BOr,
        OpCode::BXOR | OpCode::BXORK | OpCode::BXORI => ArithOp::BXor,
        _ => unreachable!("not an arithmetic opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_div_boundaries() {
        assert_eq!(int_div(7, 2).unwrap(), 3);
        assert_eq!(int_div(-7, 2).unwrap(), -4); // floored
        assert_eq!(int_div(i64::MIN, -1).unwrap(), i64::MIN); // wraps
        assert!(int_div(1, 0).is_err());
    }

    #[test]
    fn test_int_mod_sign() {
        assert_eq!(int_mod(7, 3).unwrap(), 1);
        assert_eq!(int_mod(-7, 3).unwrap(), 2); // divisor's sign
        assert_eq!(int_mod(7, -3).unwrap(), -2);
        assert_eq!(int_mod(i64::MIN, -1).unwrap(), 0);
        assert!(int_mod(1, 0).is_err());
    }

    #[test]
    fn test_float_mod_sign() {
        assert_eq!(flt_mod(5.5, 2.0), 1.5);
        assert_eq!(flt_mod(-5.5, 2.0), 0.5);
        assert_eq!(flt_mod(5.5, -2.0), -0.5);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(shift_left(1, 4), 16);
        assert_eq!(shift_left(1, 64), 0);
        assert_eq!(shift_left(16, -4), 1);
        assert_eq!(shift_right(-1, 1), i64::MAX); // logical shift
        assert_eq!(shift_right(16, 4), 1);
    }

    #[test]
    fn test_nan_never_orders() {
        let nan = Value::Float(f64::NAN);
        assert!(!num_lt(nan, Value::Float(1.0)));
        assert!(!num_le(nan, Value::Float(1.0)));
        assert!(!num_lt(Value::Float(1.0), nan));
        assert!(!num_le(Value::Int(1), nan));
    }

    #[test]
    fn test_mixed_ordering_at_mantissa_edge() {
        // 2^53 + 1 is not representable; ordering must stay exact
        let big = (1i64 << 53) + 1;
        assert!(num_lt(Value::Float((1i64 << 53) as f64), Value::Int(big)));
        assert!(!num_lt(Value::Int(big), Value::Float((1i64 << 53) as f64)));
    }

    #[test]
    fn test_string_coercion_in_arith() {
        let heap = {
            let mut h = Heap::new(1);
            h.init_reserved_names();
            h
        };
        assert_eq!(to_number(&heap, Value::Int(3)), Some(Value::Int(3)));
        assert_eq!(to_integer(&heap, Value::Float(4.0)), Some(4));
        assert_eq!(to_integer(&heap, Value::Float(4.5)), None);
    }
}
