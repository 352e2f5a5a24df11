use crate::error::ContainerError;
use std::ffi::{CStr, CString, c_char};

/// NULL-terminated argument vector handed to `execve(2)`.
///
/// Slot 0 is the program path, followed by the arguments, followed by the
/// terminating null pointer.
#[derive(Debug)]
pub struct ExecArgv {
    args: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl ExecArgv {
    pub fn new(path: &str, params: &[String]) -> Result<Self, ContainerError> {
        // Frame limits should make this unreachable; reaching it means an
        // unbounded peer-supplied list got through.
        let Some(slots) = params.len().checked_add(2) else {
            tracing::error!(count = params.len(), "exec argument count overflows argv");
            std::process::abort();
        };

        let mut args = Vec::with_capacity(slots - 1);
        for arg in std::iter::once(path).chain(params.iter().map(String::as_str)) {
            let arg = CString::new(arg).map_err(|_| {
                ContainerError::InvalidArgument(format!("exec argument contains NUL: {:?}", arg))
            })?;
            args.push(arg);
        }

        let ptrs: Vec<*const c_char> = args
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        debug_assert_eq!(ptrs.len(), slots);

        Ok(Self { args, ptrs })
    }

    pub fn program(&self) -> &CStr {
        &self.args[0]
    }

    /// Program path and arguments, without the terminator.
    pub fn args(&self) -> &[CString] {
        &self.args
    }

    /// Number of slots including the terminator.
    pub fn slots(&self) -> usize {
        self.ptrs.len()
    }

    /// Pointer suitable for the `argv` parameter of `execve(2)`; valid for
    /// as long as `self` is alive.
    pub fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }

    /// Every slot as an owned string, `None` marking the terminator.
    pub fn to_vec_lossy(&self) -> Vec<Option<String>> {
        self.args
            .iter()
            .map(|s| Some(s.to_string_lossy().into_owned()))
            .chain(std::iter::once(None))
            .collect()
    }
}
