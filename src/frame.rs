//! Call frames.

bitflags::bitflags! {
    /// Call status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameStatus: u8 {
        /// Frame is running a native function.
        const NATIVE = 1 << 0;
        /// First frame of a reentrant interpreter invocation; returning
        /// from it returns to the host rather than to a caller frame.
        const FRESH = 1 << 1;
        /// Frame is running a finaliser.
        const FINALIZER = 1 << 3;
    }
}

/// Wanted-results value meaning "all results".
pub const MULTRET: i32 = -1;

/// Per-call activation record. The function value lives on the value stack
/// at `func`; locals start at `func + 1`.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Stack index of the function slot. Vararg calls move it above the
    /// varargs; RETURN restores the virtual slot.
    pub func: usize,
    /// Stack ceiling for this call.
    pub top: usize,
    /// Current byte pc into the prototype's code (script frames).
    pub pc: usize,
    /// Number of results the caller expects ([`MULTRET`] = all).
    pub nresults: i32,
    pub status: FrameStatus,
    /// Number of extra arguments captured by a vararg call.
    pub nvarargs: usize,
}

impl Frame {
    /// First local slot.
    pub fn base(&self) -> usize {
        self.func + 1
    }

    pub fn is_native(&self) -> bool {
        self.status.contains(FrameStatus::NATIVE)
    }
}
