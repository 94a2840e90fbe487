//! Error handling and C-ABI error codes for lpm24

use std::cell::RefCell;
use std::fmt;
use std::os::raw::c_char;

/// Failures reported by table operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed depth, next hop, name or capacity.
    InvalidArgument(&'static str),
    /// A table with this name is already registered.
    AlreadyExists,
    /// No such table or rule.
    NotFound,
    /// Rule store full, or no extension group could be allocated.
    OutOfSpace,
    /// A reclamation binding is already attached to the table.
    AlreadyBound,
    /// The defer queue is full and nothing could be reclaimed.
    ReclamationUnavailable,
    /// Writer-state lock poisoned by a panicking writer.
    Lock(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::AlreadyExists => write!(f, "a table with this name already exists"),
            Error::NotFound => write!(f, "not found"),
            Error::OutOfSpace => write!(f, "out of space"),
            Error::AlreadyBound => write!(f, "reclamation already bound to this table"),
            Error::ReclamationUnavailable => {
                write!(f, "defer queue full and no group could be reclaimed")
            }
            Error::Lock(msg) => write!(f, "lock error: {msg}"),
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidArgument = 1,
    AlreadyExists = 2,
    NotFound = 3,
    OutOfSpace = 4,
    AlreadyBound = 5,
    ReclamationUnavailable = 6,
    InvalidHandle = 7,
    Utf8Error = 8,
    LockFailed = 9,
    Unknown = 255,
}

impl ErrorCode {
    /// NUL-terminated so the same bytes can cross the C ABI.
    pub fn as_cstr(self) -> &'static [u8] {
        match self {
            ErrorCode::Success => b"Success\0",
            ErrorCode::InvalidArgument => b"Invalid argument\0",
            ErrorCode::AlreadyExists => b"Already exists\0",
            ErrorCode::NotFound => b"Not found\0",
            ErrorCode::OutOfSpace => b"Out of space\0",
            ErrorCode::AlreadyBound => b"Reclamation already bound\0",
            ErrorCode::ReclamationUnavailable => b"Reclamation unavailable\0",
            ErrorCode::InvalidHandle => b"Invalid handle\0",
            ErrorCode::Utf8Error => b"UTF-8 conversion error\0",
            ErrorCode::LockFailed => b"Lock failed\0",
            ErrorCode::Unknown => b"Unknown error\0",
        }
    }

    pub fn as_str(self) -> &'static str {
        let bytes = self.as_cstr();
        // Every literal above is ASCII.
        std::str::from_utf8(&bytes[..bytes.len() - 1]).unwrap_or("Unknown error")
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

#[no_mangle]
pub extern "C" fn lpm_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn lpm_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr() as *const c_char
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    match e {
        Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
        Error::AlreadyExists => ErrorCode::AlreadyExists,
        Error::NotFound => ErrorCode::NotFound,
        Error::OutOfSpace => ErrorCode::OutOfSpace,
        Error::AlreadyBound => ErrorCode::AlreadyBound,
        Error::ReclamationUnavailable => ErrorCode::ReclamationUnavailable,
        Error::Lock(_) => ErrorCode::LockFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_have_terminated_names() {
        for code in [
            ErrorCode::Success,
            ErrorCode::OutOfSpace,
            ErrorCode::ReclamationUnavailable,
            ErrorCode::Unknown,
        ] {
            assert_eq!(code.as_cstr().last(), Some(&0));
            assert!(!code.as_str().is_empty());
        }
        assert_eq!(ErrorCode::NotFound.as_str(), "Not found");
    }

    #[test]
    fn last_error_is_per_thread() {
        set_last_error(ErrorCode::OutOfSpace);
        assert_eq!(get_last_error(), ErrorCode::OutOfSpace);
        std::thread::spawn(|| assert_eq!(get_last_error(), ErrorCode::Success))
            .join()
            .unwrap();
        set_last_error(ErrorCode::Success);
    }
}
