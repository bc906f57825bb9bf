// Upload name handling: sanitizing client file names and the extension allow-list

use unicode_normalization::UnicodeNormalization;

pub const ALLOWED_EXTENSIONS: &[&str] = &["mp4"];

/// Reduce a client-supplied file name to a safe single path component.
///
/// Accented letters are folded to their ASCII base (NFKD), path separators
/// and whitespace become `_`, anything else outside `[A-Za-z0-9._-]` is
/// dropped, and leading/trailing dots and underscores are trimmed. May return
/// an empty string.
pub fn secure_filename(name: &str) -> String {
    let spaced: String = name
        .nfkd()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}

pub fn is_allowed_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false)
}

/// The stored job key for an uploaded file, or `None` if it must be rejected.
pub fn accept_upload_name(raw: &str) -> Option<String> {
    if raw.is_empty() || !is_allowed_file(raw) {
        return None;
    }
    let name = secure_filename(raw);
    (!name.is_empty() && is_allowed_file(&name)).then_some(name)
}
