/// Parse a boolean environment value.
///
/// Accepts the usual spellings; anything else is `None` so the caller can
/// reject it instead of silently defaulting.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
