//! Symbolic recovery of variable names for error messages.
//!
//! Walks the active prototype's code up to the current pc, tracking the
//! stack height and which instruction last produced each slot. The walk is
//! linear (branches are approximated by dropping attributions at jumps) and
//! resynchronises at instructions with a statically known resulting height,
//! so a failed lookup degrades to an unnamed error rather than a wrong one.

use crate::frame::Frame;
use crate::gc::GcProto;
use crate::op_code::OpCode;
use crate::state::State;
use crate::value::Value;

/// What produced a stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local(u32),
    Upvalue(u32),
    Field(u32),
    Method(u32),
    Constant,
}

struct Walk {
    /// Producers per relative slot, valid when `height` is known.
    origins: Vec<Option<Origin>>,
    height: Option<usize>,
}

impl Walk {
    fn push(&mut self, o: Option<Origin>) {
        if let Some(h) = self.height {
            if self.origins.len() <= h {
                self.origins.resize(h + 1, None);
            }
            self.origins[h] = o;
            self.height = Some(h + 1);
        }
    }

    fn pop(&mut self, n: usize) {
        if let Some(h) = self.height {
            self.height = h.checked_sub(n);
            if self.height.is_none() {
                self.origins.clear();
            }
        }
    }

    fn replace_top(&mut self, o: Option<Origin>) {
        if let Some(h) = self.height {
            if h > 0 && h <= self.origins.len() {
                self.origins[h - 1] = o;
            }
        }
    }

    fn resync(&mut self, height: usize) {
        self.origins.clear();
        self.origins.resize(height, None);
        self.height = Some(height);
    }

    fn forget(&mut self) {
        self.origins.iter_mut().for_each(|o| *o = None);
    }
}

/// Symbolic description of the value at absolute stack slot `slot` of
/// `frame`, e.g. `local 'x'` or `field 'name'`.
pub(crate) fn slot_origin(state: &State, frame: &Frame, slot: usize) -> Option<String> {
    let Value::Closure(cl) = state.stack[frame.func] else {
        return None;
    };
    let proto = state.heap.closure(cl).proto;
    let rel = slot.checked_sub(frame.base())?;
    let origin = walk_to(state, proto, frame.pc, rel)?;
    describe(state, proto, frame.pc, origin)
}

fn walk_to(state: &State, proto: GcProto, end_pc: usize, slot: usize) -> Option<Origin> {
    let p = state.heap.proto(proto);
    let code = &p.code;
    let mut w = Walk {
        origins: vec![None; p.arity as usize],
        height: Some(p.arity as usize),
    };
    let mut pc = 0usize;
    while pc < end_pc && pc < code.len() {
        let op = OpCode::from_u8(code[pc])?;
        let a1 = arg_l(code, pc, 0);
        let a2 = arg_l(code, pc, 1);
        match op {
            OpCode::TRUE
            | OpCode::FALSE
            | OpCode::CLOSURE
            | OpCode::NEWLIST
            | OpCode::NEWCLASS
            | OpCode::NEWTABLE => w.push(None),
            OpCode::NIL => {
                for _ in 0..a1.unwrap_or(0) {
                    w.push(None);
                }
            }
            OpCode::LOAD | OpCode::GETLOCAL => w.push(a1.map(Origin::Local)),
            OpCode::SETLOCAL => w.pop(1),
            OpCode::CONST
            | OpCode::CONSTL
            | OpCode::CONSTI
            | OpCode::CONSTIL
            | OpCode::CONSTF
            | OpCode::CONSTFL => w.push(Some(Origin::Constant)),
            OpCode::VARARGPREP | OpCode::SUPER => {}
            OpCode::VARARG => match a1 {
                Some(n) if n > 0 => {
                    for _ in 0..n - 1 {
                        w.push(None);
                    }
                }
                _ => {
                    w.height = None;
                    w.origins.clear();
                }
            },
            OpCode::METHOD | OpCode::SETTM | OpCode::SETMT => w.pop(2),
            OpCode::POP => w.pop(a1.unwrap_or(0) as usize),
            OpCode::MBIN
            | OpCode::EQ
            | OpCode::LT
            | OpCode::LE
            | OpCode::GETINDEX
            | OpCode::SETINDEX
            | OpCode::INHERIT
            | OpCode::TESTPOP
            | OpCode::SETUVAL
            | OpCode::GETSUPIDX => {
                w.pop(1);
                if matches!(op, OpCode::GETINDEX | OpCode::GETSUPIDX) {
                    w.replace_top(None);
                }
            }
            // stack binary operators leave the pop to their MBIN fallback
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
            | OpCode::BXOR => {}
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
            | OpCode::BXORK
            | OpCode::ADDI
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
            | OpCode::BXORI
            | OpCode::EQK
            | OpCode::EQI
            | OpCode::LTI
            | OpCode::LEI
            | OpCode::GTI
            | OpCode::GEI
            | OpCode::NOT
            | OpCode::UNM
            | OpCode::BNOT
            | OpCode::EQPRESERVE
            | OpCode::GETINDEXINT
            | OpCode::GETINDEXINTL => w.replace_top(None),
            OpCode::CONCAT => {
                w.pop(a1.unwrap_or(1) as usize - 1);
                w.replace_top(None);
            }
            OpCode::JMP | OpCode::JMPS => w.forget(),
            OpCode::TEST | OpCode::CLOSE | OpCode::TBC | OpCode::FORPREP => {}
            OpCode::CALL => match (a1, a2) {
                (Some(f), Some(nres1)) if nres1 > 0 => {
                    w.resync(f as usize + (nres1 - 1) as usize);
                }
                _ => {
                    w.height = None;
                    w.origins.clear();
                }
            },
            OpCode::CHECKADJ => {
                if let (Some(f), Some(nres1)) = (a1, a2) {
                    if nres1 > 0 {
                        w.resync(f as usize + (nres1 - 1) as usize);
                    }
                }
            }
            OpCode::GETUVAL => w.push(a1.map(Origin::Upvalue)),
            OpCode::SETLIST => {
                if let Some(f) = a1 {
                    w.resync(f as usize + 1);
                }
            }
            OpCode::SETPROPERTY | OpCode::SETINDEXSTR | OpCode::SETINDEXINT
            | OpCode::SETINDEXINTL => w.pop(1),
            OpCode::GETPROPERTY | OpCode::GETINDEXSTR => {
                w.replace_top(a1.map(Origin::Field));
            }
            OpCode::GETSUP => w.replace_top(a1.map(Origin::Method)),
            OpCode::FORCALL => {
                if let (Some(f), Some(n)) = (a1, a2) {
                    w.resync(f as usize + 4 + n as usize);
                }
            }
            OpCode::FORLOOP => {
                let nvars = arg_l(code, pc, 2).unwrap_or(0) as usize;
                w.pop(nvars);
            }
            OpCode::RETURN | OpCode::TAILCALL => break,
        }
        pc += op.size();
    }
    w.height?;
    w.origins.get(slot).copied().flatten()
}

/// Long argument `n` of the instruction at `pc`, when its format has one.
fn arg_l(code: &[u8], pc: usize, n: usize) -> Option<u32> {
    let at = pc + 1 + n * 3;
    if at + 2 < code.len() {
        Some(code[at] as u32 | (code[at + 1] as u32) << 8 | (code[at + 2] as u32) << 16)
    } else {
        None
    }
}

fn describe(state: &State, proto: GcProto, pc: usize, origin: Origin) -> Option<String> {
    let p = state.heap.proto(proto);
    match origin {
        Origin::Local(i) => {
            let name = p.local_name(i + 1, pc as u32)?;
            Some(format!("local '{}'", state.heap.str_display(name)))
        }
        Origin::Upvalue(i) => {
            let name = p.upvals.get(i as usize)?.name?;
            Some(format!("upvalue '{}'", state.heap.str_display(name)))
        }
        Origin::Field(k) => {
            let v = p.consts.get(k as usize)?;
            match v {
                Value::Str(s) => Some(format!("field '{}'", state.heap.str_display(*s))),
                _ => None,
            }
        }
        Origin::Method(k) => {
            let v = p.consts.get(k as usize)?;
            match v {
                Value::Str(s) => Some(format!("method '{}'", state.heap.str_display(*s))),
                _ => None,
            }
        }
        Origin::Constant => Some("constant".to_string()),
    }
}
