//! Per-opcode property tables: formats, sizes and mnemonics.

use super::{OpCode, SIZE_ARG_L, SIZE_ARG_S};

/// Instruction formats: `I` is the bare opcode byte, `S` a one-byte
/// argument, `L` a three-byte little-endian argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFormat {
    I,
    IS,
    ISS,
    IL,
    ILS,
    ILL,
    ILLS,
    ILLL,
}

impl OpFormat {
    /// Total encoded size in bytes, opcode byte included.
    pub fn size(self) -> usize {
        1 + match self {
            OpFormat::I => 0,
            OpFormat::IS => SIZE_ARG_S,
            OpFormat::ISS => 2 * SIZE_ARG_S,
            OpFormat::IL => SIZE_ARG_L,
            OpFormat::ILS => SIZE_ARG_L + SIZE_ARG_S,
            OpFormat::ILL => 2 * SIZE_ARG_L,
            OpFormat::ILLS => 2 * SIZE_ARG_L + SIZE_ARG_S,
            OpFormat::ILLL => 3 * SIZE_ARG_L,
        }
    }
}

macro_rules! op_table {
    ($($op:ident => $fmt:ident;)*) => {
        /// All opcodes in discriminant order.
        pub(super) const ALL: [OpCode; super::OP_COUNT] = [$(OpCode::$op),*];

        pub(super) fn format_of(op: OpCode) -> OpFormat {
            match op {
                $(OpCode::$op => OpFormat::$fmt,)*
            }
        }

        pub(super) fn mnemonic_of(op: OpCode) -> &'static str {
            match op {
                $(OpCode::$op => stringify!($op),)*
            }
        }
    };
}

op_table! {
    TRUE => I;
    FALSE => I;
    NIL => IL;
    SUPER => I;
    LOAD => IL;
    CONST => IS;
    CONSTL => IL;
    CONSTI => IS;
    CONSTIL => IL;
    CONSTF => IS;
    CONSTFL => IL;
    VARARGPREP => IL;
    VARARG => IL;
    CLOSURE => IL;
    NEWLIST => IS;
    NEWCLASS => IS;
    NEWTABLE => IS;
    METHOD => IL;
    SETTM => IS;
    SETMT => IL;
    POP => IL;
    MBIN => IS;
    ADDK => IL;
    SUBK => IL;
    MULK => IL;
    DIVK => IL;
    IDIVK => IL;
    MODK => IL;
    POWK => IL;
    BSHLK => IL;
    BSHRK => IL;
    BANDK => IL;
    BORK => IL;
    BXORK => IL;
    ADDI => IL;
    SUBI => IL;
    MULI => IL;
    DIVI => IL;
    IDIVI => IL;
    MODI => IL;
    POWI => IL;
    BSHLI => IL;
    BSHRI => IL;
    BANDI => IL;
    BORI => IL;
    BXORI => IL;
    ADD => IS;
    SUB => IS;
    MUL => IS;
    DIV => IS;
    IDIV => IS;
    MOD => IS;
    POW => IS;
    BSHL => IS;
    BSHR => IS;
    BAND => IS;
    BOR => IS;
    BXOR => IS;
    CONCAT => IL;
    EQK => ILS;
    EQI => ILS;
    LTI => IL;
    LEI => IL;
    GTI => IL;
    GEI => IL;
    EQ => IS;
    LT => IS;
    LE => IS;
    EQPRESERVE => I;
    NOT => I;
    UNM => I;
    BNOT => I;
    JMP => IL;
    JMPS => IL;
    TEST => IS;
    TESTPOP => IS;
    CALL => ILL;
    CLOSE => IL;
    TBC => IL;
    CHECKADJ => ILL;
    GETLOCAL => IL;
    SETLOCAL => IL;
    GETUVAL => IL;
    SETUVAL => IL;
    SETLIST => ILLS;
    SETPROPERTY => ILL;
    GETPROPERTY => IL;
    GETINDEX => I;
    SETINDEX => IL;
    GETINDEXSTR => IL;
    SETINDEXSTR => ILL;
    GETINDEXINT => IS;
    GETINDEXINTL => IL;
    SETINDEXINT => ILS;
    SETINDEXINTL => ILL;
    GETSUP => IL;
    GETSUPIDX => I;
    INHERIT => I;
    FORPREP => ILL;
    FORCALL => ILL;
    FORLOOP => ILLL;
    RETURN => ILLS;
    TAILCALL => ILL;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_in_discriminant_order() {
        for (i, op) in ALL.iter().enumerate() {
            assert_eq!(*op as usize, i, "{op:?} out of order");
        }
    }

    #[test]
    fn test_every_format_size() {
        assert_eq!(OpFormat::I.size(), 1);
        assert_eq!(OpFormat::IS.size(), 2);
        assert_eq!(OpFormat::ISS.size(), 3);
        assert_eq!(OpFormat::IL.size(), 4);
        assert_eq!(OpFormat::ILS.size(), 5);
        assert_eq!(OpFormat::ILL.size(), 7);
        assert_eq!(OpFormat::ILLS.size(), 8);
        assert_eq!(OpFormat::ILLL.size(), 10);
    }
}
