//! Bounds-checked reads from guest linear memory.
//!
//! Guests pass strings as `(ptr, len)` pairs into their own exported
//! memory. Out-of-bounds ranges and invalid UTF-8 are rejected.

use crate::error::SandboxError;

/// Read `len` bytes from guest memory at `ptr`.
pub fn read_bytes(mem: &[u8], ptr: i32, len: i32) -> Result<&[u8], SandboxError> {
    validate_range(mem.len(), ptr, len)?;
    let start = ptr as usize;
    Ok(&mem[start..start + len as usize])
}

/// Read a UTF-8 string from guest memory.
pub fn read_str(mem: &[u8], ptr: i32, len: i32) -> Result<String, SandboxError> {
    let bytes = read_bytes(mem, ptr, len)?;
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| SandboxError::BadPointer(format!("invalid utf-8 at {}: {}", ptr, e)))
}

/// Validate that a pointer range `[ptr, ptr+len)` is within memory bounds.
pub fn validate_range(mem_size: usize, ptr: i32, len: i32) -> Result<(), SandboxError> {
    if ptr < 0 || len < 0 {
        return Err(SandboxError::BadPointer(format!("negative range {}+{}", ptr, len)));
    }
    let end = (ptr as usize)
        .checked_add(len as usize)
        .ok_or_else(|| SandboxError::BadPointer(format!("range overflow {}+{}", ptr, len)))?;
    if end > mem_size {
        return Err(SandboxError::BadPointer(format!(
            "range {}..{} exceeds memory size {}",
            ptr, end, mem_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bytes_basic() {
        let mem = vec![10, 20, 30, 40, 50];
        let result = read_bytes(&mem, 1, 3).unwrap();
        assert_eq!(result, &[20, 30, 40]);
    }

    #[test]
    fn test_read_bytes_out_of_bounds() {
        let mem = vec![10, 20, 30];
        assert!(read_bytes(&mem, 1, 3).is_err());
        assert!(read_bytes(&mem, -1, 1).is_err());
        assert!(read_bytes(&mem, 0, -1).is_err());
    }

    #[test]
    fn test_read_str() {
        let mem = b"xxhello".to_vec();
        assert_eq!(read_str(&mem, 2, 5).unwrap(), "hello");
        assert_eq!(read_str(&mem, 0, 0).unwrap(), "");
    }

    #[test]
    fn test_read_str_invalid_utf8() {
        let mem = vec![0xff, 0xfe];
        let err = read_str(&mem, 0, 2).unwrap_err();
        assert!(matches!(err, SandboxError::BadPointer(_)));
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(100, 0, 100).is_ok());
        assert!(validate_range(100, 0, 101).is_err());
        assert!(validate_range(100, -1, 1).is_err());
        assert!(validate_range(100, 50, -1).is_err());
    }
}
