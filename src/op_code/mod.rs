//! Opcode definitions for the Toku VM.
//!
//! Code is byte-addressed: the first byte is the opcode, followed by its
//! arguments per format. A short argument (`S`) is one byte, a long
//! argument (`L`) is three bytes little-endian. Signed immediates are
//! excess-encoded (see [`SHORT_IMM_OFFSET`] / [`LONG_IMM_OFFSET`]).

mod properties;

pub use properties::OpFormat;

/// Excess offset of short signed immediates.
pub const SHORT_IMM_OFFSET: i64 = 128;
/// Excess offset of long signed immediates.
pub const LONG_IMM_OFFSET: i64 = 1 << 23;

/// Byte size of a short argument.
pub const SIZE_ARG_S: usize = 1;
/// Byte size of a long argument.
pub const SIZE_ARG_L: usize = 3;

/// Represents the opcode of an instruction in the Toku Virtual Machine.
///
/// Binary arithmetic, bitwise and ordering opcodes that take two stack
/// operands carry a swap flag and are always followed in the code stream by
/// an [`OpCode::MBIN`] fallback instruction; fast paths skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Constants and simple pushes
    TRUE = 0x00,
    FALSE = 0x01,
    /// Push `L` nils.
    NIL = 0x02,
    /// Replace `self` on top with its superclass (or nil).
    SUPER = 0x03,
    /// Push a copy of stack slot `L`.
    LOAD = 0x04,
    /// Push constant `S`.
    CONST = 0x05,
    /// Push constant `L`.
    CONSTL = 0x06,
    /// Push short signed integer immediate.
    CONSTI = 0x07,
    /// Push long signed integer immediate.
    CONSTIL = 0x08,
    /// Push short signed immediate as a float.
    CONSTF = 0x09,
    /// Push long signed immediate as a float.
    CONSTFL = 0x0A,
    /// Rotate fixed parameters above the varargs; `L` is the arity.
    VARARGPREP = 0x0B,
    /// Push `L - 1` varargs (0 means all).
    VARARG = 0x0C,
    /// Build a closure from nested prototype `L`.
    CLOSURE = 0x0D,
    /// Push a new list; `S` is a size hint (log2 + 1).
    NEWLIST = 0x0E,
    /// Push a new class; `S` is a methods size hint, bit 0x80 requests a
    /// metatable.
    NEWCLASS = 0x0F,
    /// Push a new table; `S` is a size hint (log2 + 1).
    NEWTABLE = 0x10,
    /// Store method (top) under constant name `L` in class at top-1.
    METHOD = 0x11,
    /// Store metamethod (top) for event `S` in class metatable at top-1.
    SETTM = 0x12,
    /// Store metafield (top) under constant name `L` in class metatable.
    SETMT = 0x13,
    /// Pop `L` values.
    POP = 0x14,
    /// Binary metamethod fallback for event `S`.
    MBIN = 0x15,

    // Arithmetic/bitwise with constant operand
    ADDK = 0x16,
    SUBK = 0x17,
    MULK = 0x18,
    DIVK = 0x19,
    IDIVK = 0x1A,
    MODK = 0x1B,
    POWK = 0x1C,
    BSHLK = 0x1D,
    BSHRK = 0x1E,
    BANDK = 0x1F,
    BORK = 0x20,
    BXORK = 0x21,

    // Arithmetic/bitwise with long signed immediate
    ADDI = 0x22,
    SUBI = 0x23,
    MULI = 0x24,
    DIVI = 0x25,
    IDIVI = 0x26,
    MODI = 0x27,
    POWI = 0x28,
    BSHLI = 0x29,
    BSHRI = 0x2A,
    BANDI = 0x2B,
    BORI = 0x2C,
    BXORI = 0x2D,

    // Arithmetic/bitwise with stack operands (S = swap flag)
    ADD = 0x2E,
    SUB = 0x2F,
    MUL = 0x30,
    DIV = 0x31,
    IDIV = 0x32,
    MOD = 0x33,
    POW = 0x34,
    BSHL = 0x35,
    BSHR = 0x36,
    BAND = 0x37,
    BOR = 0x38,
    BXOR = 0x39,

    /// Concatenate the top `L` values.
    CONCAT = 0x3A,

    // Equality and ordering
    /// Compare top with constant `L`; `S` is the expected truth.
    EQK = 0x3B,
    /// Compare top with immediate `L`; `S` is the expected truth.
    EQI = 0x3C,
    LTI = 0x3D,
    LEI = 0x3E,
    GTI = 0x3F,
    GEI = 0x40,
    /// Generic equality; `S` is the expected truth.
    EQ = 0x41,
    LT = 0x42,
    LE = 0x43,
    /// Equality that preserves the left operand (used by switch).
    EQPRESERVE = 0x44,

    NOT = 0x45,
    UNM = 0x46,
    BNOT = 0x47,

    /// Jump forward by `L`.
    JMP = 0x48,
    /// Jump backward by `L`.
    JMPS = 0x49,
    /// Conditional skip (non-popping); followed by a JMP.
    TEST = 0x4A,
    /// Conditional skip, popping the tested value.
    TESTPOP = 0x4B,

    /// Call function at slot `L1` expecting `L2 - 1` results.
    CALL = 0x4C,
    /// Close upvalues and TBC variables down to slot `L`.
    CLOSE = 0x4D,
    /// Mark slot `L` as to-be-closed.
    TBC = 0x4E,
    /// Adjust the stack top to `L1 + (L2 - 1)` values.
    CHECKADJ = 0x4F,

    GETLOCAL = 0x50,
    SETLOCAL = 0x51,
    GETUVAL = 0x52,
    SETUVAL = 0x53,

    /// Bulk-store `S` values (0 = up to top) into the list at slot `L1`
    /// holding `L2` elements already.
    SETLIST = 0x54,
    /// `o[K[L2]] = top` where `o` is `L1` slots below the value.
    SETPROPERTY = 0x55,
    /// `top = top[K[L]]`.
    GETPROPERTY = 0x56,
    /// Generic indexed get.
    GETINDEX = 0x57,
    /// Generic indexed set; `L` locates the collection below the top.
    SETINDEX = 0x58,
    GETINDEXSTR = 0x59,
    SETINDEXSTR = 0x5A,
    /// Indexed get with short integer immediate.
    GETINDEXINT = 0x5B,
    GETINDEXINTL = 0x5C,
    SETINDEXINT = 0x5D,
    SETINDEXINTL = 0x5E,
    /// Superclass method get by constant name `L`.
    GETSUP = 0x5F,
    /// Superclass method get by the key on top.
    GETSUPIDX = 0x60,
    /// Copy superclass method table and metatable into the class below.
    INHERIT = 0x61,

    /// Create the loop TBC variable at `L1 + 3` and jump `L2` to FORCALL.
    FORPREP = 0x62,
    /// Call the iterator at slot `L1` expecting `L2` results.
    FORCALL = 0x63,
    /// Test the control variable at `L1`, loop back `L2`, drop `L3` vars.
    FORLOOP = 0x64,

    /// Return `L2 - 1` results starting at slot `L1`; `S` = close frame.
    RETURN = 0x65,
    /// Call the function at slot `L1` reusing the current frame; results
    /// go straight to this frame's caller. Emitted only for frames with no
    /// live to-be-closed variables.
    TAILCALL = 0x66,
}

/// Number of opcodes.
pub const OP_COUNT: usize = OpCode::TAILCALL as usize + 1;

impl OpCode {
    /// Decode a byte into an opcode.
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        properties::ALL.get(byte as usize).copied()
    }

    /// Instruction format of this opcode.
    pub fn format(self) -> OpFormat {
        properties::format_of(self)
    }

    /// Total instruction size in bytes, opcode byte included.
    pub fn size(self) -> usize {
        self.format().size()
    }

    /// Mnemonic.
    pub fn mnemonic(self) -> &'static str {
        properties::mnemonic_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_opcodes() {
        for byte in 0..OP_COUNT as u8 {
            let op = OpCode::from_u8(byte).expect("contiguous opcode space");
            assert_eq!(op as u8, byte);
        }
        assert_eq!(OpCode::from_u8(OP_COUNT as u8), None);
        assert_eq!(OpCode::from_u8(0xFF), None);
    }

    #[test]
    fn test_formats_and_sizes() {
        assert_eq!(OpCode::TRUE.size(), 1);
        assert_eq!(OpCode::CONST.size(), 2);
        assert_eq!(OpCode::CONSTL.size(), 4);
        assert_eq!(OpCode::EQK.size(), 5); // opcode + L + S
        assert_eq!(OpCode::CALL.size(), 7); // opcode + L + L
        assert_eq!(OpCode::SETLIST.size(), 8); // opcode + L + L + S
        assert_eq!(OpCode::FORLOOP.size(), 10); // opcode + L + L + L
        assert_eq!(OpCode::MBIN.size(), 2);
        // tail calls rewrite in place over plain calls
        assert_eq!(OpCode::TAILCALL.size(), OpCode::CALL.size());
    }

    #[test]
    fn test_binary_fast_paths_know_mbin_size() {
        // the interpreter skips the trailing MBIN on fast paths
        assert_eq!(OpCode::ADD.format(), OpFormat::IS);
        assert_eq!(OpCode::BXOR.format(), OpFormat::IS);
        assert_eq!(OpCode::MBIN.format(), OpFormat::IS);
    }
}
