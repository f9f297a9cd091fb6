//! Statement splitting and classification for migration bodies.
//!
//! Migration files are trusted, file-origin SQL and are executed verbatim.
//! Engines that cannot run a multi-statement body in one call (or whose DDL
//! commits implicitly) use [`split_statements_with`] and [`is_ddl`] to decide
//! how to run them.

/// Leading keywords of statements that change schema.
const DDL_KEYWORDS: &[&str] = &[
    "CREATE", "ALTER", "DROP", "TRUNCATE", "RENAME", "COMMENT", "GRANT", "REVOKE",
];

/// Lexical rules that differ between engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Postgres: doubled quotes escape, `$tag$` bodies.
    #[default]
    Standard,
    /// MySQL: backslash escapes in quoted text, `#` line comments.
    MySql,
    /// Spanner GoogleSQL: backslash escapes in quoted text, `#` line comments.
    GoogleSql,
}

impl Dialect {
    fn backslash_escapes(self) -> bool {
        matches!(self, Self::MySql | Self::GoogleSql)
    }

    fn hash_comments(self) -> bool {
        matches!(self, Self::MySql | Self::GoogleSql)
    }

    fn dollar_quotes(self) -> bool {
        matches!(self, Self::Standard)
    }
}

/// Splits a SQL body on top-level `;` using [`Dialect::Standard`] rules.
pub fn split_statements(sql: &str) -> Vec<String> {
    split_statements_with(sql, Dialect::Standard)
}

/// Splits a SQL body on top-level `;`.
///
/// Semicolons inside comments, quoted text and (for Postgres) `$tag$`
/// dollar-quoted bodies do not split. Statements consisting only of
/// whitespace and comments are dropped; the rest are returned trimmed with
/// their comments intact.
pub fn split_statements_with(sql: &str, dialect: Dialect) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;

    let mut push = |piece: &str| {
        let piece_bytes = piece.as_bytes();
        if skip_trivia(piece_bytes, 0, dialect.hash_comments()) < piece_bytes.len() {
            statements.push(piece.trim().to_string());
        }
    };

    while i < bytes.len() {
        match bytes[i] {
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line_comment(bytes, i),
            b'#' if dialect.hash_comments() => i = skip_line_comment(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            quote @ (b'\'' | b'"') => {
                i = skip_quoted(bytes, i, quote, dialect.backslash_escapes())
            }
            b'`' => i = skip_quoted(bytes, i, b'`', false),
            b'$' if dialect.dollar_quotes() => match dollar_tag_end(bytes, i) {
                Some(tag_end) => {
                    let tag = &bytes[i..tag_end];
                    i = find(bytes, tag_end, tag).map_or(bytes.len(), |pos| pos + tag.len());
                }
                None => i += 1,
            },
            b';' => {
                push(&sql[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    push(&sql[start..]);

    statements
}

/// True when `sql` contains nothing but whitespace and comments.
pub fn is_blank(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    skip_trivia(bytes, 0, false) >= bytes.len()
}

/// The first keyword of a statement, upper-cased, ignoring leading comments
/// of any dialect.
pub fn leading_keyword(statement: &str) -> Option<String> {
    let bytes = statement.as_bytes();
    let start = skip_trivia(bytes, 0, true);
    let end = bytes[start..]
        .iter()
        .position(|b| !b.is_ascii_alphabetic())
        .map_or(bytes.len(), |len| start + len);
    (end > start).then(|| statement[start..end].to_ascii_uppercase())
}

/// True when the statement changes schema rather than data.
pub fn is_ddl(statement: &str) -> bool {
    leading_keyword(statement).is_some_and(|keyword| DDL_KEYWORDS.contains(&keyword.as_str()))
}

fn skip_trivia(bytes: &[u8], mut i: usize, hash_comments: bool) -> usize {
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        match (bytes.get(i), bytes.get(i + 1)) {
            (Some(b'-'), Some(b'-')) => i = skip_line_comment(bytes, i),
            (Some(b'#'), _) if hash_comments => i = skip_line_comment(bytes, i),
            (Some(b'/'), Some(b'*')) => i = skip_block_comment(bytes, i),
            _ => return i,
        }
    }
}

fn skip_line_comment(bytes: &[u8], i: usize) -> usize {
    bytes[i..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(bytes.len(), |pos| i + pos + 1)
}

fn skip_block_comment(bytes: &[u8], i: usize) -> usize {
    find(bytes, i + 2, b"*/").map_or(bytes.len(), |pos| pos + 2)
}

/// Skips a quoted run starting at `i`. A doubled quote is an escaped quote,
/// and so is a backslash-escaped one when `backslash` is set.
fn skip_quoted(bytes: &[u8], i: usize, quote: u8, backslash: bool) -> usize {
    let mut j = i + 1;
    while j < bytes.len() {
        if backslash && bytes[j] == b'\\' {
            j += 2;
            continue;
        }
        if bytes[j] == quote {
            if bytes.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    bytes.len()
}

/// If a dollar-quote tag (`$$` or `$name$`) starts at `i`, returns the index
/// just past it. `$1` style parameters are not tags.
fn dollar_tag_end(bytes: &[u8], i: usize) -> Option<usize> {
    let mut j = i + 1;
    match bytes.get(j) {
        Some(b'$') => return Some(j + 1),
        Some(b) if b.is_ascii_alphabetic() || *b == b'_' => {}
        _ => return None,
    }
    while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
        j += 1;
    }
    (bytes.get(j) == Some(&b'$')).then_some(j + 1)
}

fn find(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| from + pos)
}
