use crate::error::CoreError;

/* =========================
Numeric safety helpers

Every persisted counter is a SQL integer column (i64/i32) backing an unsigned domain quantity
(image counts, chunk indices). These convert at the repository boundary and reject anything
a correctly-running system should never produce.
========================= */

pub fn i64_to_u32(v: i64) -> Result<u32, CoreError> {
    if v < 0 || v > u32::MAX as i64 {
        return Err(CoreError::external(format!("out of range for u32: {v}")));
    }
    Ok(v as u32)
}

pub fn i64_to_u64(v: i64) -> Result<u64, CoreError> {
    if v < 0 {
        return Err(CoreError::external(format!(
            "negative i64 where u64 expected: {v}"
        )));
    }
    Ok(v as u64)
}

pub fn i64_to_u8(v: i64) -> Result<u8, CoreError> {
    if v < 0 || v > u8::MAX as i64 {
        return Err(CoreError::external(format!("out of range for u8: {v}")));
    }
    Ok(v as u8)
}

pub fn u64_to_i64(v: u64) -> Result<i64, CoreError> {
    if v > i64::MAX as u64 {
        return Err(CoreError::external(format!("u64 too large for i64: {v}")));
    }
    Ok(v as i64)
}

pub fn u32_to_i32(v: u32) -> Result<i32, CoreError> {
    if v > i32::MAX as u32 {
        return Err(CoreError::external(format!("u32 too large for i32: {v}")));
    }
    Ok(v as i32)
}

pub fn i32_to_u32(v: i32) -> Result<u32, CoreError> {
    if v < 0 {
        return Err(CoreError::external(format!(
            "negative i32 where u32 expected: {v}"
        )));
    }
    Ok(v as u32)
}
