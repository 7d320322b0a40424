use std::path::Path;

/// Quote `s` for a POSIX shell by wrapping it in single quotes.
///
/// A single quote inside the string closes the quoted segment, emits an
/// escaped quote and reopens: `it's` becomes `'it'\''s'`.
pub(crate) fn shell_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len() + 2);
    escaped.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Quoted form of a path inside the sandbox.
pub(crate) fn shell_path(path: &Path) -> String {
    shell_escape(&path.to_string_lossy())
}

/// `/bin/sh -c <script>` as an exec argv.
pub(crate) fn sh_command(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}
