//! # Toku Virtual Machine
//!
//! The runtime core of the Toku scripting language: a stack-based bytecode
//! virtual machine with a class-based object model, interned strings, an
//! incremental tri-colour garbage collector and a stack-oriented host API.
//!
//! ## Architecture
//!
//! - **State**: a thread of execution plus the state-global resources
//!   (heap, string table, reserved list/table, hooks)
//! - **Heap**: arena of collectable objects addressed by typed handles,
//!   with the incremental mark-and-sweep collector built in
//! - **Value**: 16-byte tagged values; collectable payloads are handles
//! - **OpCode / ProtoBuilder**: byte-addressed instruction set and the
//!   assembler producing runnable prototypes
//! - **Table / List / Class / Instance**: the data structures the VM
//!   dispatches on, with metamethod fallbacks cached per metatable
//!
//! ## Example
//!
//! ```
//! use toku_vm::{OpCode, ProtoBuilder, State, Value};
//!
//! // fn() { return 1 + 2; }
//! let mut b = ProtoBuilder::new(0, 4);
//! b.load_int(1);
//! b.load_int(2);
//! b.binary_op(OpCode::ADD, toku_vm::Mm::Add, false);
//! b.ret(0, Some(1), false);
//!
//! let mut state = State::new();
//! state.push_proto(b.build()).unwrap();
//! assert_eq!(state.pcall(0), toku_vm::Status::Ok);
//! assert_eq!(state.to_int(-1), Some(3));
//! ```

pub mod api;
pub mod builder;
pub mod error;
pub mod frame;
pub mod gc;
pub mod meta;
pub mod object;
pub mod op_code;
pub mod proto;
pub mod protected;
pub mod state;
pub mod strings;
pub mod trace;
pub mod value;
pub mod vm;

pub use api::{upvalue_index, RESERVED_LIST_INDEX, RESERVED_TABLE_INDEX};
pub use builder::ProtoBuilder;
pub use error::{Status, VmError, VmResult};
pub use frame::MULTRET;
pub use gc::{GcState, Heap};
pub use meta::Mm;
pub use op_code::{OpCode, OpFormat};
pub use proto::{Proto, UpvalDesc, VarKind};
pub use state::State;
pub use value::{NativeFn, TypeTag, Value};
