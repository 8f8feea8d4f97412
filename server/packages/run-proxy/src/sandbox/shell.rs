//! Shell quoting. Every token that ends up inside a generated script goes
//! through one of these two functions.

/// POSIX single-quote `value` so `sh` reads it back byte for byte.
pub fn sh_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Bash ANSI-C string (`$'...'`). Control characters are always escaped, so
/// a value can never inject a newline into the surrounding script.
pub fn ansi_c_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 3);
    out.push_str("$'");
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str(r"\\"),
            '\'' => out.push_str(r"\'"),
            '\n' => out.push_str(r"\n"),
            '\r' => out.push_str(r"\r"),
            '\t' => out.push_str(r"\t"),
            ch if (ch as u32) < 0x20 || ch as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", ch as u32));
            }
            ch => out.push(ch),
        }
    }
    out.push('\'');
    out
}

/// `^[A-Za-z_][A-Za-z0-9_]*$`
pub fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

pub fn join_quoted<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|token| sh_quote(token.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_quotes_survive_posix_quoting() {
        assert_eq!(sh_quote("plain/path-1.txt"), "plain/path-1.txt");
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("it's here"), r"'it'\''s here'");
        assert_eq!(sh_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn ansi_c_escapes_control_characters() {
        assert_eq!(ansi_c_quote("a\nb"), r"$'a\nb'");
        assert_eq!(ansi_c_quote("tab\there"), r"$'tab\there'");
        assert_eq!(ansi_c_quote("q'uote\\"), r"$'q\'uote\\'");
        assert_eq!(ansi_c_quote("bell\u{7}del\u{7f}"), r"$'bell\x07del\x7f'");
    }

    #[test]
    fn env_names_follow_shell_identifier_rules() {
        assert!(is_env_name("HOME"));
        assert!(is_env_name("_private9"));
        assert!(!is_env_name("9LIVES"));
        assert!(!is_env_name("A-B"));
        assert!(!is_env_name(""));
        assert!(!is_env_name("X;rm"));
    }
}
