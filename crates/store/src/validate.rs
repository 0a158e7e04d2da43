use crate::StoreError;

/// Validates a client-supplied identifier used as a single path component
/// (fingerprint or artifact name).
///
/// Identifiers become directory or file names under the storage roots, so
/// anything that could escape them is rejected before any filesystem call.
pub fn validate_identifier(value: &str, field: &'static str) -> Result<(), StoreError> {
    if value.is_empty() {
        return Err(StoreError::MissingIdentifier(field));
    }

    if value == "." || value == ".." {
        return Err(StoreError::InvalidIdentifier(format!(
            "{field} may not be a dot component: {value}"
        )));
    }

    if value.contains('/') || value.contains('\\') {
        return Err(StoreError::InvalidIdentifier(format!(
            "{field} may not contain path separators: {value}"
        )));
    }

    if value.contains('\0') {
        return Err(StoreError::InvalidIdentifier(format!(
            "{field} may not contain NUL bytes"
        )));
    }

    // Windows drive prefixes sneak past the separator check ("C:").
    if value.len() >= 2 && value.as_bytes()[1] == b':' {
        return Err(StoreError::InvalidIdentifier(format!(
            "{field} may not contain a drive prefix: {value}"
        )));
    }

    Ok(())
}
