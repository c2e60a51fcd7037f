//! Function prototypes.
//!
//! A prototype is immutable after code generation: bytecode, constant pool,
//! nested prototypes, upvalue descriptors and the debug side tables. Line
//! information is delta-encoded per opcode with sparse absolute anchors; the
//! per-opcode pc table maps an opcode index to its byte position in
//! logarithmic time (instructions are variable length).

use crate::gc::{GcProto, GcStr};
use crate::value::Value;

/// Sentinel delta meaning "consult the absolute line table".
pub const ABS_LINE_MARK: i8 = i8::MIN;

/// Maximum number of opcodes between two absolute line anchors.
pub const MAX_INST_WITHOUT_ABS: usize = 128;

/// Kind of a captured variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Regular,
    /// Declared final (assign-once).
    Final,
    /// Declared to-be-closed.
    Tbc,
}

/// Descriptor of one upvalue of a prototype.
#[derive(Debug, Clone, Copy)]
pub struct UpvalDesc {
    pub name: Option<GcStr>,
    /// Stack slot (when `on_stack`) or enclosing-upvalue index.
    pub index: u32,
    pub on_stack: bool,
    pub kind: VarKind,
}

/// Debug descriptor of a local variable.
#[derive(Debug, Clone, Copy)]
pub struct LocalVar {
    pub name: GcStr,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Absolute line anchor.
#[derive(Debug, Clone, Copy)]
pub struct AbsLine {
    /// Opcode index (not byte pc).
    pub index: u32,
    pub line: u32,
}

/// A function prototype.
#[derive(Debug, Default)]
pub struct Proto {
    /// Number of fixed parameters.
    pub arity: u32,
    pub is_vararg: bool,
    /// Stack slots this function may use.
    pub max_stack: u32,
    pub consts: Vec<Value>,
    pub protos: Vec<GcProto>,
    /// Byte-addressed code, terminated by a RETURN opcode.
    pub code: Vec<u8>,
    pub upvals: Vec<UpvalDesc>,
    /// Per-opcode line delta from the previous opcode; [`ABS_LINE_MARK`]
    /// redirects to `abs_lines`.
    pub line_info: Vec<i8>,
    pub abs_lines: Vec<AbsLine>,
    /// Byte pc of each opcode, in order.
    pub inst_pc: Vec<u32>,
    pub locals: Vec<LocalVar>,
    pub source: Option<GcStr>,
}

impl Proto {
    /// Opcode index covering byte position `pc` (last opcode at or before).
    pub fn inst_index(&self, pc: usize) -> usize {
        match self.inst_pc.binary_search(&(pc as u32)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    /// Source line of the opcode at `index`, from the nearest absolute
    /// anchor plus accumulated deltas.
    pub fn line_of_inst(&self, index: usize) -> Option<u32> {
        if self.line_info.is_empty() {
            return None;
        }
        let anchor = match self
            .abs_lines
            .binary_search_by_key(&(index as u32), |a| a.index)
        {
            Ok(i) => i as isize,
            Err(0) => -1,
            Err(i) => i as isize - 1,
        };
        let (mut i, mut line) = if anchor < 0 {
            (0usize, 0i64)
        } else {
            let a = self.abs_lines[anchor as usize];
            (a.index as usize, a.line as i64)
        };
        if anchor < 0 && self.line_info[0] == ABS_LINE_MARK {
            return None;
        }
        if anchor < 0 {
            line += self.line_info[0] as i64;
        }
        while i < index {
            i += 1;
            match self.line_info.get(i) {
                Some(&d) if d != ABS_LINE_MARK => line += d as i64,
                // a mark not present in abs_lines cannot happen for
                // well-formed prototypes
                _ => return None,
            }
        }
        u32::try_from(line).ok()
    }

    /// Source line covering byte position `pc`.
    pub fn line_of_pc(&self, pc: usize) -> Option<u32> {
        self.line_of_inst(self.inst_index(pc))
    }

    /// Name of the `n`-th local variable alive at opcode `pc`, if recorded.
    pub fn local_name(&self, mut n: u32, pc: u32) -> Option<GcStr> {
        for lv in &self.locals {
            if lv.start_pc > pc {
                break;
            }
            if pc < lv.end_pc {
                n = n.saturating_sub(1);
                if n == 0 {
                    return Some(lv.name);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inst_index_maps_variable_width() {
        let p = Proto {
            inst_pc: vec![0, 1, 5, 9],
            ..Default::default()
        };
        assert_eq!(p.inst_index(0), 0);
        assert_eq!(p.inst_index(1), 1);
        assert_eq!(p.inst_index(4), 1);
        assert_eq!(p.inst_index(5), 2);
        assert_eq!(p.inst_index(100), 3);
    }

    #[test]
    fn test_line_info_deltas_and_anchor() {
        let p = Proto {
            inst_pc: vec![0, 1, 2, 3],
            line_info: vec![1, 0, 2, ABS_LINE_MARK],
            abs_lines: vec![AbsLine { index: 3, line: 40 }],
            ..Default::default()
        };
        assert_eq!(p.line_of_inst(0), Some(1));
        assert_eq!(p.line_of_inst(1), Some(1));
        assert_eq!(p.line_of_inst(2), Some(3));
        assert_eq!(p.line_of_inst(3), Some(40));
    }
}
