//! Content digest grammar.

/// `algorithm:encoded`, e.g. `sha256:e3b0c4...`.
///
/// Neither part can hold a `/` or be `.`/`..`, so a valid digest always
/// maps to a path inside the blob directory.
pub fn is_digest(value: &str) -> bool {
    let Some((algorithm, encoded)) = value.split_once(':') else {
        return false;
    };
    !algorithm.is_empty()
        && !encoded.is_empty()
        && algorithm.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-')
        })
        && algorithm.chars().next().map_or(false, |c| c.is_ascii_alphanumeric())
        && encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '=' | '_' | '-'))
}
