//! Full userdata objects.

use crate::gc::{GcTable, GcUserData, Heap};
use crate::value::Value;

/// Userdata: optional metatable, up to 65535 user values, opaque payload.
#[derive(Debug)]
pub struct UserDataObj {
    pub metatable: Option<GcTable>,
    pub uservalues: Vec<Value>,
    pub payload: Box<[u8]>,
}

impl Heap {
    /// Allocate userdata with a zeroed payload of `size` bytes and `nuv`
    /// nil user values.
    pub fn userdata_new(&mut self, size: usize, nuv: u16) -> GcUserData {
        self.alloc_userdata(UserDataObj {
            metatable: None,
            uservalues: vec![Value::Nil; nuv as usize],
            payload: vec![0u8; size].into_boxed_slice(),
        })
    }
}
