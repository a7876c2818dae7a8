//! Small validation helpers shared by the command encoder, the manual frame parser and
//! the export target check.
use std::ops::RangeInclusive;
use std::path::Path;

/// Validates if a given value is within a specified numeric range.
///
/// # Arguments
///
/// * `value` - The value to validate.
/// * `range` - The inclusive range to validate against.
///
/// # Returns
///
/// * `Ok(())` if the value is within the range.
/// * `Err(&'static str)` if the value is outside the range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates if a given string is a usable file path.
///
/// # Arguments
///
/// * `path` - The string to validate.
///
/// # Returns
///
/// * `Ok(())` if the file path is valid.
/// * `Err(&'static str)` if the file path is invalid.
pub fn is_valid_path(path: &str) -> Result<(), &'static str> {
    if path.trim().is_empty() {
        return Err("File path cannot be empty");
    }
    if path.contains('\0') {
        return Err("File path cannot contain null bytes");
    }
    Ok(())
}

/// Checks that a file can be created at `path`: the path is well formed, does not name
/// an existing directory, and its parent directory exists.
pub fn is_writable_target(path: &Path) -> Result<(), &'static str> {
    let text = path.to_str().ok_or("File path is not valid UTF-8")?;
    is_valid_path(text)?;
    if path.is_dir() {
        return Err("File path names a directory");
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            Err("Parent directory does not exist")
        }
        _ => Ok(()),
    }
}

/// Validates that `value` is made of at most `max_digits` hexadecimal digits.
///
/// An empty string is accepted; callers decide what it means.
pub fn is_hex_field(value: &str, max_digits: usize) -> Result<(), &'static str> {
    if value.len() > max_digits {
        return Err("Too many hexadecimal digits");
    }
    if value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err("Not a hexadecimal value")
    }
}
