//! Prototype builder.
//!
//! Assembles bytecode and the side tables of a [`Proto`] programmatically:
//! the seam between the code generator (an external collaborator) and the
//! VM, and the way tests construct runnable functions. Emitters are typed
//! per instruction format, so operand widths always match the opcode table.

use hashbrown::HashMap;

use crate::gc::{GcProto, GcStr};
use crate::op_code::{OpCode, OpFormat, LONG_IMM_OFFSET, SHORT_IMM_OFFSET};
use crate::proto::{AbsLine, LocalVar, Proto, UpvalDesc, VarKind, ABS_LINE_MARK, MAX_INST_WITHOUT_ABS};
use crate::value::Value;

/// Hashable identity of a constant for pool deduplication (floats dedup
/// by bit pattern, so 0.0 and -0.0 stay distinct entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Nil,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(GcStr),
    Other(crate::gc::GcRef),
    Native(usize),
    Light(usize),
}

impl ConstKey {
    fn of(v: Value) -> ConstKey {
        match v {
            Value::Nil => ConstKey::Nil,
            Value::Bool(b) => ConstKey::Bool(b),
            Value::Int(i) => ConstKey::Int(i),
            Value::Float(f) => ConstKey::Float(f.to_bits()),
            Value::Str(s) => ConstKey::Str(s),
            Value::Native(f) => ConstKey::Native(f as usize),
            Value::LightUserData(p) => ConstKey::Light(p),
            other => ConstKey::Other(other.as_gc_ref().expect("collectable constant")),
        }
    }
}

/// Incrementally builds a [`Proto`].
#[derive(Debug, Default)]
pub struct ProtoBuilder {
    arity: u32,
    is_vararg: bool,
    max_stack: u32,
    consts: Vec<Value>,
    const_index: HashMap<ConstKey, u32>,
    protos: Vec<GcProto>,
    code: Vec<u8>,
    upvals: Vec<UpvalDesc>,
    locals: Vec<LocalVar>,
    inst_pc: Vec<u32>,
    line_info: Vec<i8>,
    abs_lines: Vec<AbsLine>,
    source: Option<GcStr>,
    current_line: u32,
    last_line: u32,
    since_abs: usize,
}

impl ProtoBuilder {
    /// Start a prototype with `arity` fixed parameters and `max_stack`
    /// reserved slots.
    pub fn new(arity: u32, max_stack: u32) -> Self {
        ProtoBuilder {
            arity,
            max_stack,
            current_line: 1,
            ..Default::default()
        }
    }

    /// Mark the function as vararg.
    pub fn vararg(mut self) -> Self {
        self.is_vararg = true;
        self
    }

    /// Record the source name.
    pub fn source(mut self, name: GcStr) -> Self {
        self.source = Some(name);
        self
    }

    /// Source line for subsequently emitted instructions.
    pub fn at_line(&mut self, line: u32) -> &mut Self {
        self.current_line = line;
        self
    }

    /// Add a constant, reusing an existing identical entry.
    pub fn add_const(&mut self, v: Value) -> u32 {
        let key = ConstKey::of(v);
        if let Some(&i) = self.const_index.get(&key) {
            return i;
        }
        let i = self.consts.len() as u32;
        self.consts.push(v);
        self.const_index.insert(key, i);
        i
    }

    /// Add a nested prototype.
    pub fn add_proto(&mut self, p: GcProto) -> u32 {
        self.protos.push(p);
        (self.protos.len() - 1) as u32
    }

    /// Describe an upvalue.
    pub fn add_upvalue(&mut self, name: Option<GcStr>, index: u32, on_stack: bool, kind: VarKind) {
        self.upvals.push(UpvalDesc {
            name,
            index,
            on_stack,
            kind,
        });
    }

    /// Describe a local variable for debug information. `start`/`end` are
    /// byte pcs delimiting its live range.
    pub fn add_local(&mut self, name: GcStr, start_pc: u32, end_pc: u32) {
        self.locals.push(LocalVar {
            name,
            start_pc,
            end_pc,
        });
    }

    /// Byte pc the next instruction will be emitted at.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    fn record_inst(&mut self) {
        self.inst_pc.push(self.code.len() as u32);
        let delta = self.current_line as i64 - self.last_line as i64;
        if self.since_abs >= MAX_INST_WITHOUT_ABS || delta < i8::MIN as i64 + 1 || delta > i8::MAX as i64
        {
            self.line_info.push(ABS_LINE_MARK);
            self.abs_lines.push(AbsLine {
                index: (self.inst_pc.len() - 1) as u32,
                line: self.current_line,
            });
            self.since_abs = 0;
        } else {
            self.line_info.push(delta as i8);
            self.since_abs += 1;
        }
        self.last_line = self.current_line;
    }

    fn arg_s(&mut self, v: u8) {
        self.code.push(v);
    }

    fn arg_l(&mut self, v: u32) {
        debug_assert!(v < 1 << 24, "long argument overflow");
        self.code.push(v as u8);
        self.code.push((v >> 8) as u8);
        self.code.push((v >> 16) as u8);
    }

    /// Emit a bare opcode.
    pub fn emit_i(&mut self, op: OpCode) -> usize {
        debug_assert_eq!(op.format(), OpFormat::I);
        let pc = self.here();
        self.record_inst();
        self.code.push(op as u8);
        pc
    }

    /// Emit opcode + short argument.
    pub fn emit_is(&mut self, op: OpCode, s: u8) -> usize {
        debug_assert_eq!(op.format(), OpFormat::IS);
        let pc = self.here();
        self.record_inst();
        self.code.push(op as u8);
        self.arg_s(s);
        pc
    }

    /// Emit opcode + long argument.
    pub fn emit_il(&mut self, op: OpCode, l: u32) -> usize {
        debug_assert_eq!(op.format(), OpFormat::IL);
        let pc = self.here();
        self.record_inst();
        self.code.push(op as u8);
        self.arg_l(l);
        pc
    }

    /// Emit opcode + long + short.
    pub fn emit_ils(&mut self, op: OpCode, l: u32, s: u8) -> usize {
        debug_assert_eq!(op.format(), OpFormat::ILS);
        let pc = self.here();
        self.record_inst();
        self.code.push(op as u8);
        self.arg_l(l);
        self.arg_s(s);
        pc
    }

    /// Emit opcode + two longs.
    pub fn emit_ill(&mut self, op: OpCode, l1: u32, l2: u32) -> usize {
        debug_assert_eq!(op.format(), OpFormat::ILL);
        let pc = self.here();
        self.record_inst();
        self.code.push(op as u8);
        self.arg_l(l1);
        self.arg_l(l2);
        pc
    }

    /// Emit opcode + two longs + short.
    pub fn emit_ills(&mut self, op: OpCode, l1: u32, l2: u32, s: u8) -> usize {
        debug_assert_eq!(op.format(), OpFormat::ILLS);
        let pc = self.here();
        self.record_inst();
        self.code.push(op as u8);
        self.arg_l(l1);
        self.arg_l(l2);
        self.arg_s(s);
        pc
    }

    /// Emit opcode + three longs.
    pub fn emit_illl(&mut self, op: OpCode, l1: u32, l2: u32, l3: u32) -> usize {
        debug_assert_eq!(op.format(), OpFormat::ILLL);
        let pc = self.here();
        self.record_inst();
        self.code.push(op as u8);
        self.arg_l(l1);
        self.arg_l(l2);
        self.arg_l(l3);
        pc
    }

    /* {================================================================
    ** Convenience emitters
    ** ================================================================ */

    /// Push a constant, choosing the short or long form.
    pub fn load_const(&mut self, v: Value) -> usize {
        let k = self.add_const(v);
        if k <= u8::MAX as u32 {
            self.emit_is(OpCode::CONST, k as u8)
        } else {
            self.emit_il(OpCode::CONSTL, k)
        }
    }

    /// Push an integer, preferring the immediate forms.
    pub fn load_int(&mut self, i: i64) -> usize {
        if let Some(s) = encode_simm_s(i) {
            self.emit_is(OpCode::CONSTI, s)
        } else if let Some(l) = encode_simm_l(i) {
            self.emit_il(OpCode::CONSTIL, l)
        } else {
            self.load_const(Value::Int(i))
        }
    }

    /// Emit a stack binary operator together with its MBIN fallback.
    pub fn binary_op(&mut self, op: OpCode, event: crate::meta::Mm, swap: bool) -> usize {
        let pc = self.emit_is(op, swap as u8);
        self.emit_is(OpCode::MBIN, event as u8);
        pc
    }

    /// Emit a forward jump to be patched later.
    pub fn jump_forward(&mut self) -> usize {
        self.emit_il(OpCode::JMP, 0)
    }

    /// Patch a forward jump to land at the current position.
    pub fn patch_jump_here(&mut self, jmp_pc: usize) {
        let target = self.here();
        let after = jmp_pc + OpCode::JMP.size();
        let off = (target - after) as u32;
        self.code[jmp_pc + 1] = off as u8;
        self.code[jmp_pc + 2] = (off >> 8) as u8;
        self.code[jmp_pc + 3] = (off >> 16) as u8;
    }

    /// Overwrite long argument `arg` (0-based) of the instruction at
    /// `inst_pc`; used to fix up forward offsets once targets are known.
    pub fn patch_long_arg(&mut self, inst_pc: usize, arg: usize, v: u32) {
        debug_assert!(v < 1 << 24, "long argument overflow");
        let at = inst_pc + 1 + arg * 3;
        self.code[at] = v as u8;
        self.code[at + 1] = (v >> 8) as u8;
        self.code[at + 2] = (v >> 16) as u8;
    }

    /// Emit a backward jump to `target`.
    pub fn jump_back(&mut self, target: usize) -> usize {
        let pc = self.here();
        let off = (pc + OpCode::JMPS.size() - target) as u32;
        self.emit_il(OpCode::JMPS, off)
    }

    /// Emit the final return of `count` values starting at slot `base_slot`
    /// (`None` = all values down to it).
    pub fn ret(&mut self, base_slot: u32, count: Option<u32>, close: bool) -> usize {
        let nres1 = count.map_or(0, |c| c + 1);
        self.emit_ills(OpCode::RETURN, base_slot, nres1, close as u8)
    }

    /* }================================================================ */

    /// Finish the prototype. The code must end in a RETURN.
    pub fn build(self) -> Proto {
        debug_assert_eq!(
            self.code.last().map(|_| {
                let last = *self.inst_pc.last().expect("non-empty code") as usize;
                self.code[last]
            }),
            Some(OpCode::RETURN as u8),
            "prototypes end in RETURN"
        );
        Proto {
            arity: self.arity,
            is_vararg: self.is_vararg,
            max_stack: self.max_stack,
            consts: self.consts,
            protos: self.protos,
            code: self.code,
            upvals: self.upvals,
            line_info: self.line_info,
            abs_lines: self.abs_lines,
            inst_pc: self.inst_pc,
            locals: self.locals,
            source: self.source,
        }
    }
}

/// Encode a short signed immediate, if it fits.
pub fn encode_simm_s(v: i64) -> Option<u8> {
    let raw = v + SHORT_IMM_OFFSET;
    (0..=u8::MAX as i64).contains(&raw).then(|| raw as u8)
}

/// Encode a long signed immediate, if it fits.
pub fn encode_simm_l(v: i64) -> Option<u32> {
    let raw = v + LONG_IMM_OFFSET;
    (0..(1 << 24)).contains(&raw).then(|| raw as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_sizes() {
        let mut b = ProtoBuilder::new(0, 4);
        b.emit_i(OpCode::TRUE);
        b.emit_il(OpCode::POP, 1);
        b.ret(0, Some(0), false);
        let p = b.build();
        assert_eq!(p.inst_pc, vec![0, 1, 5]);
        assert_eq!(p.code.len(), 5 + OpCode::RETURN.size());
    }

    #[test]
    fn test_const_dedup() {
        let mut b = ProtoBuilder::new(0, 4);
        let a = b.add_const(Value::Int(7));
        let c = b.add_const(Value::Int(7));
        let d = b.add_const(Value::Int(8));
        assert_eq!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_immediate_encoding() {
        assert_eq!(encode_simm_s(0), Some(128));
        assert_eq!(encode_simm_s(-128), Some(0));
        assert_eq!(encode_simm_s(127), Some(255));
        assert_eq!(encode_simm_s(128), None);
        assert_eq!(encode_simm_l(0), Some(1 << 23));
        assert_eq!(encode_simm_l(-(1 << 23)), Some(0));
        assert_eq!(encode_simm_l(1 << 23), None);
    }

    #[test]
    fn test_jump_patching() {
        let mut b = ProtoBuilder::new(0, 4);
        let j = b.jump_forward();
        b.emit_i(OpCode::TRUE);
        b.patch_jump_here(j);
        b.ret(0, Some(0), false);
        let p = b.build();
        // offset skips exactly the TRUE instruction
        let off = p.code[j + 1] as u32;
        assert_eq!(off, OpCode::TRUE.size() as u32);
    }

    #[test]
    fn test_line_info_absolute_anchor_emitted() {
        let mut b = ProtoBuilder::new(0, 2);
        b.at_line(1);
        b.emit_i(OpCode::TRUE);
        b.at_line(100_000); // delta overflows a signed byte
        b.emit_il(OpCode::POP, 1);
        b.ret(0, Some(0), false);
        let p = b.build();
        assert_eq!(p.line_info[1], ABS_LINE_MARK);
        assert_eq!(p.abs_lines.len(), 1);
        assert_eq!(p.line_of_inst(1), Some(100_000));
        assert_eq!(p.line_of_inst(0), Some(1));
    }
}
