//! Utility functions shared by the spawn engines.

use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;

use crate::errors::{SpawnError, SpawnResult};

/// Convert a string to a C-compatible string
pub(crate) fn to_cstring(s: &str) -> SpawnResult<CString> {
    CString::new(s).map_err(|_| SpawnError::InvalidConfig(format!("NUL byte in {s:?}")))
}

/// Convert an OS string (path, environment value) to a C string
pub(crate) fn os_to_cstring(s: &OsStr) -> SpawnResult<CString> {
    CString::new(s.as_bytes())
        .map_err(|_| SpawnError::InvalidConfig(format!("NUL byte in {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_cstring() {
        assert_eq!(to_cstring("ls").unwrap().as_bytes(), b"ls");
        assert!(to_cstring("bad\0input").is_err());
    }

    #[test]
    fn test_os_to_cstring() {
        assert!(os_to_cstring(OsStr::new("/tmp")).is_ok());
        assert!(os_to_cstring(OsStr::new("bad\0path")).is_err());
    }
}
