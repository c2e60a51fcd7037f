//! Protected calls and the error model.
//!
//! Errors unwind as `Err` values. A protected call records the frame count
//! and stack level, runs the callee, and on error: invokes the message
//! handler at the throw point (the erroring frames are still live), closes
//! to-be-closed scopes above the saved level (a failing `__close` replaces
//! the error object), restores the stack and leaves the normalised error
//! object on top. An unprotected error reaches the panic hook; with no
//! hook installed the host aborts.

use crate::error::{Status, VmError, VmResult};
use crate::frame::MULTRET;
use crate::state::State;
use crate::value::Value;

/// Error object used when none was supplied.
pub const NO_ERROR_OBJECT: &str = "<no error object>";

impl State {
    /// Normalise an unwound error into a script value. Memory errors reuse
    /// the preallocated message so this never grows the heap under
    /// pressure.
    pub(crate) fn error_object(&mut self, e: &VmError) -> Value {
        match e {
            VmError::Thrown { value } => *value,
            VmError::Memory => Value::Str(self.heap.memerr.expect("state initialised")),
            VmError::ErrorHandler => {
                Value::Str(self.heap.new_string(b"error in error handling"))
            }
            VmError::Runtime { message } => Value::Str(self.heap.new_string(message.as_bytes())),
        }
    }

    /// Run `f` under a protection boundary, translating an unwind into a
    /// status code. The callback owns any stack repair it needs.
    pub fn raw_call(&mut self, f: impl FnOnce(&mut State) -> VmResult<()>) -> Status {
        match f(self) {
            Ok(()) => Status::Ok,
            Err(e) => e.status(),
        }
    }

    /// Close scopes above `level`, feeding `__close` failures back into the
    /// error object until the closing completes.
    fn close_protected(&mut self, level: usize, mut errobj: Value) -> Value {
        loop {
            match self.close_scopes(level, errobj) {
                Ok(()) => return errobj,
                Err(e) => {
                    // each failed __close was already popped; progress is
                    // guaranteed
                    errobj = self.error_object(&e);
                }
            }
        }
    }

    /// Protected call. The function and its `nargs` arguments are on top of
    /// the stack; `handler` optionally names the stack slot of a message
    /// handler pushed earlier.
    ///
    /// On success the results replace the function and arguments. On error
    /// the stack is restored to the pre-call level plus the error object.
    pub fn protected_call(
        &mut self,
        nargs: usize,
        nresults: i32,
        handler: Option<usize>,
    ) -> Status {
        debug_assert!(self.top > nargs);
        let func = self.top - nargs - 1;
        debug_assert!(handler.map_or(true, |h| h < func));
        let saved_frames = self.frames.len();
        let saved_calls = self.n_calls;
        let saved_errfunc = self.errfunc;
        self.errfunc = handler;
        let result = self.call_value(func, nresults);
        self.errfunc = saved_errfunc;
        match result {
            Ok(()) => Status::Ok,
            Err(e) => {
                let mut status = e.status();
                let mut errobj = self.error_object(&e);
                if let Some(h) = handler {
                    // the handler observes the erroring frames
                    let hf = self.stack[h];
                    let call_handler = |st: &mut State| -> VmResult<()> {
                        st.ensure_stack(2)?;
                        let at = st.top;
                        st.push(hf);
                        st.push(errobj);
                        st.call_value(at, 1)
                    };
                    match call_handler(self) {
                        Ok(()) => errobj = self.pop(),
                        Err(_) => {
                            status = Status::ErrorHandler;
                            errobj = self.error_object(&VmError::ErrorHandler);
                        }
                    }
                }
                errobj = self.close_protected(func, errobj);
                self.frames.truncate(saved_frames);
                self.n_calls = saved_calls;
                self.top = func;
                self.push(errobj);
                status
            }
        }
    }

    /// Protected call without a message handler.
    pub fn protected_call_args(&mut self, nargs: usize, nresults: i32) -> Status {
        self.protected_call(nargs, nresults, None)
    }

    /// Unprotected call: an error invokes the panic hook with the error
    /// object on top; returning from the hook (or having none) aborts.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> usize {
        debug_assert!(self.top > nargs);
        let func = self.top - nargs - 1;
        match self.call_value(func, nresults) {
            Ok(()) => self.top - func,
            Err(e) => {
                let errobj = self.error_object(&e);
                self.push(errobj);
                if let Some(panic) = self.panic_fn {
                    panic(self);
                }
                std::process::abort();
            }
        }
    }

    /// Throw the value on top of the stack as an error object.
    pub fn throw_top(&mut self) -> VmError {
        let value = if self.top == 0 {
            Value::Str(self.heap.new_string(NO_ERROR_OBJECT.as_bytes()))
        } else {
            self.pop()
        };
        VmError::Thrown { value }
    }

    /// Call with all results kept (convenience for hosts and tests).
    pub fn pcall(&mut self, nargs: usize) -> Status {
        self.protected_call(nargs, MULTRET, None)
    }

    /// Continuation-style protected call. Execution never suspends, so the
    /// continuation is invoked with the finished status before returning.
    pub fn pcallk(
        &mut self,
        nargs: usize,
        nresults: i32,
        handler: Option<usize>,
        continuation: fn(&mut State, Status) -> VmResult<()>,
    ) -> Status {
        let status = self.protected_call(nargs, nresults, handler);
        match continuation(self, status) {
            Ok(()) => status,
            Err(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmResult;
    use crate::state::State;
    use crate::value::Value;

    fn native_ok(st: &mut State) -> VmResult<u32> {
        st.push(Value::Int(7));
        Ok(1)
    }

    fn native_fail(_st: &mut State) -> VmResult<u32> {
        Err(VmError::runtime("deliberate failure"))
    }

    #[test]
    fn test_protected_native_success() {
        let mut st = State::new();
        st.push(Value::Native(native_ok));
        let status = st.pcall(0);
        assert_eq!(status, Status::Ok);
        assert_eq!(st.pop(), Value::Int(7));
    }

    #[test]
    fn test_protected_error_restores_stack_plus_object() {
        let mut st = State::new();
        st.push(Value::Int(1)); // ballast below the call
        let before = st.top;
        st.push(Value::Native(native_fail));
        st.push(Value::Int(42)); // argument
        let status = st.protected_call_args(1, 0);
        assert_eq!(status, Status::Runtime);
        assert_eq!(st.top, before + 1); // pre-call top plus the error object
        match st.pop() {
            Value::Str(s) => {
                assert!(st.heap().str_display(s).contains("deliberate failure"));
            }
            other => panic!("expected string error object, got {other:?}"),
        }
    }

    #[test]
    fn test_handler_transforms_error_object() {
        fn handler(st: &mut State) -> VmResult<u32> {
            // receives the error object, returns a replacement
            st.push(Value::Int(99));
            Ok(1)
        }
        let mut st = State::new();
        st.push(Value::Native(handler));
        let h = st.top - 1;
        st.push(Value::Native(native_fail));
        let status = st.protected_call(0, 0, Some(h));
        assert_eq!(status, Status::Runtime);
        assert_eq!(st.pop(), Value::Int(99));
    }

    #[test]
    fn test_raw_call_reports_status() {
        let mut st = State::new();
        let status = st.raw_call(|_| Err(VmError::Memory));
        assert_eq!(status, Status::Memory);
        let status = st.raw_call(|_| Ok(()));
        assert_eq!(status, Status::Ok);
    }
}
