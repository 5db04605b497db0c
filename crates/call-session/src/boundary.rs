//! Fixed-size buffers for handing call data across a C boundary
//!
//! Hosts written in other languages receive call snapshots as NUL-terminated
//! byte arrays of fixed length. Longer strings are truncated, never
//! overflowed, and always cut on a UTF-8 character boundary.

use std::ffi::CStr;

use crate::call::{CallData, CallId};

/// Size of the id and URI fields, terminator included
pub const URI_BUFFER_LEN: usize = 128;
/// Size of the state field, terminator included
pub const STATE_BUFFER_LEN: usize = 64;

/// C-layout mirror of [`CallData`]
#[repr(C)]
#[derive(Clone, PartialEq, Eq)]
pub struct CallDataBuffer {
    pub call_id: [u8; URI_BUFFER_LEN],
    pub remote_uri: [u8; URI_BUFFER_LEN],
    pub local_uri: [u8; URI_BUFFER_LEN],
    pub actual_state: [u8; STATE_BUFFER_LEN],
}

impl Default for CallDataBuffer {
    fn default() -> Self {
        Self {
            call_id: [0; URI_BUFFER_LEN],
            remote_uri: [0; URI_BUFFER_LEN],
            local_uri: [0; URI_BUFFER_LEN],
            actual_state: [0; STATE_BUFFER_LEN],
        }
    }
}

impl CallDataBuffer {
    pub fn fill(&mut self, data: &CallData) {
        copy_truncated(&mut self.call_id, &data.call_id);
        copy_truncated(&mut self.remote_uri, &data.remote_uri);
        copy_truncated(&mut self.local_uri, &data.local_uri);
        copy_truncated(&mut self.actual_state, &data.actual_state);
    }

    /// Read the buffer back, lossily for any field that is not valid UTF-8
    pub fn to_call_data(&self) -> CallData {
        CallData {
            call_id: read_c_str(&self.call_id),
            remote_uri: read_c_str(&self.remote_uri),
            local_uri: read_c_str(&self.local_uri),
            actual_state: read_c_str(&self.actual_state),
        }
    }
}

impl From<&CallData> for CallDataBuffer {
    fn from(data: &CallData) -> Self {
        let mut buffer = Self::default();
        buffer.fill(data);
        buffer
    }
}

impl std::fmt::Debug for CallDataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CallDataBuffer").field(&self.to_call_data()).finish()
    }
}

/// Copy `src` into `dst`, truncating so a NUL terminator always fits
///
/// Bytes after the terminator are zeroed. Returns the number of string bytes
/// copied. An empty `dst` is left untouched.
pub fn copy_truncated(dst: &mut [u8], src: &str) -> usize {
    let Some(capacity) = dst.len().checked_sub(1) else {
        return 0;
    };
    let mut len = src.len().min(capacity);
    while !src.is_char_boundary(len) {
        len -= 1;
    }
    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
    dst[len..].fill(0);
    len
}

/// Write a call id into a caller-provided out buffer
pub fn write_call_id(dst: &mut [u8], call_id: &CallId) -> usize {
    copy_truncated(dst, call_id.as_str())
}

fn read_c_str(buffer: &[u8]) -> String {
    match CStr::from_bytes_until_nul(buffer) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(buffer).into_owned(),
    }
}
