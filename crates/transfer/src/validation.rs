use dropstream_protocol::MAX_FILE_NAME_LEN;

use crate::TransferError;

/// Turns a client-declared file name into a safe name inside the upload
/// directory.
///
/// Only the final path component is kept (either separator counts). Within
/// it, `< > : " / \ | ? *` and control characters become `_`.
///
/// Rejects:
/// - Empty names (or names that are empty after taking the last component)
/// - `.` and `..`
/// - Names longer than [`MAX_FILE_NAME_LEN`] bytes
pub fn sanitize_file_name(declared: &str) -> Result<String, TransferError> {
    let last = declared
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(declared);

    let name: String = last
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if name.is_empty() {
        return Err(TransferError::InvalidName(format!(
            "empty file name: {declared:?}"
        )));
    }
    if name == "." || name == ".." {
        return Err(TransferError::InvalidName(format!(
            "reserved file name: {declared:?}"
        )));
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(TransferError::InvalidName(format!(
            "file name is {} bytes, limit is {MAX_FILE_NAME_LEN}",
            name.len()
        )));
    }

    Ok(name)
}
