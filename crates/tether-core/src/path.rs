/// Canonical registry key for a working directory.
///
/// Trailing separators are dropped. Paths that look Windows-like (a drive
/// letter or any backslash) switch to forward slashes and are lower-cased;
/// POSIX paths keep their case.
pub fn normalize(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        return String::new();
    }

    if looks_windows(path) {
        let converted = path.replace('\\', "/").to_lowercase();
        return trim_trailing(&converted, '/');
    }

    trim_trailing(path, '/')
}

fn looks_windows(path: &str) -> bool {
    if path.contains('\\') {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn trim_trailing(path: &str, separator: char) -> String {
    let trimmed = path.trim_end_matches(separator);
    if trimmed.is_empty() {
        // the root itself
        return separator.to_string();
    }
    // "c:" stays a drive root rather than a relative drive reference
    if trimmed.len() == 2 && trimmed.ends_with(':') && path.len() > 2 {
        return format!("{trimmed}{separator}");
    }
    trimmed.to_string()
}

/// Last path segment, used to name a project in user-facing messages.
pub fn display_name(path: &str) -> String {
    let normalized = path.trim().replace('\\', "/");
    normalized
        .trim_end_matches('/')
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(path)
        .to_string()
}
