//! Small shared parser helpers

/// Characters allowed inside a SIP token
pub fn token(c: char) -> bool {
    c.is_ascii_alphanumeric() | matches!(c, '-' | '.' | '!' | '%' | '*' | '_' | '+' | '`' | '\'' | '~')
}

/// Linear whitespace
pub fn whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t')
}
