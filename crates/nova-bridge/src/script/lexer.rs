use crate::provider::CompileError;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TokenKind {
    Number(f64),
    BigInt(i64),
    Str(String),
    Ident(String),
    Punct(Punct),
    Eof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Dot,
    Question,
    Colon,
    Arrow,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Eq,
    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Nullish,
    OptionalDot,
}

impl Punct {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Punct::LParen => "(",
            Punct::RParen => ")",
            Punct::LBrace => "{",
            Punct::RBrace => "}",
            Punct::LBracket => "[",
            Punct::RBracket => "]",
            Punct::Comma => ",",
            Punct::Semi => ";",
            Punct::Dot => ".",
            Punct::Question => "?",
            Punct::Colon => ":",
            Punct::Arrow => "=>",
            Punct::Plus => "+",
            Punct::Minus => "-",
            Punct::Star => "*",
            Punct::Slash => "/",
            Punct::Percent => "%",
            Punct::Bang => "!",
            Punct::Eq => "=",
            Punct::EqEq => "==",
            Punct::EqEqEq => "===",
            Punct::NotEq => "!=",
            Punct::NotEqEq => "!==",
            Punct::Lt => "<",
            Punct::LtEq => "<=",
            Punct::Gt => ">",
            Punct::GtEq => ">=",
            Punct::AndAnd => "&&",
            Punct::OrOr => "||",
            Punct::Nullish => "??",
            Punct::OptionalDot => "?.",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) offset: usize,
}

// Longest first so `===` wins over `==` and `=`.
const PUNCTS: &[(&str, Punct)] = &[
    ("===", Punct::EqEqEq),
    ("!==", Punct::NotEqEq),
    ("=>", Punct::Arrow),
    ("==", Punct::EqEq),
    ("!=", Punct::NotEq),
    ("<=", Punct::LtEq),
    (">=", Punct::GtEq),
    ("&&", Punct::AndAnd),
    ("||", Punct::OrOr),
    ("??", Punct::Nullish),
    ("?.", Punct::OptionalDot),
    ("(", Punct::LParen),
    (")", Punct::RParen),
    ("{", Punct::LBrace),
    ("}", Punct::RBrace),
    ("[", Punct::LBracket),
    ("]", Punct::RBracket),
    (",", Punct::Comma),
    (";", Punct::Semi),
    (".", Punct::Dot),
    ("?", Punct::Question),
    (":", Punct::Colon),
    ("+", Punct::Plus),
    ("-", Punct::Minus),
    ("*", Punct::Star),
    ("/", Punct::Slash),
    ("%", Punct::Percent),
    ("!", Punct::Bang),
    ("=", Punct::Eq),
    ("<", Punct::Lt),
    (">", Punct::Gt),
];

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];

        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        if source[pos..].starts_with("//") {
            pos = source[pos..].find('\n').map_or(bytes.len(), |end| pos + end);
            continue;
        }
        if source[pos..].starts_with("/*") {
            let end = source[pos + 2..]
                .find("*/")
                .ok_or_else(|| CompileError::at(pos, "unterminated block comment"))?;
            pos += 2 + end + 2;
            continue;
        }

        let start = pos;
        let kind = if c.is_ascii_digit() || (c == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) {
            let (kind, end) = lex_number(source, pos)?;
            pos = end;
            kind
        } else if c == b'"' || c == b'\'' {
            let (text, end) = lex_string(source, pos)?;
            pos = end;
            TokenKind::Str(text)
        } else if c == b'_' || c == b'$' || c.is_ascii_alphabetic() {
            let end = source[pos..]
                .find(|ch: char| !(ch == '_' || ch == '$' || ch.is_ascii_alphanumeric()))
                .map_or(bytes.len(), |len| pos + len);
            let ident = source[pos..end].to_owned();
            pos = end;
            TokenKind::Ident(ident)
        } else {
            let rest = &source[pos..];
            // `?.` followed by a digit is a conditional with a decimal literal (`a?.5:1`).
            let matched = PUNCTS.iter().find(|(text, punct)| {
                rest.starts_with(text)
                    && !(*punct == Punct::OptionalDot
                        && bytes.get(pos + 2).is_some_and(u8::is_ascii_digit))
            });
            match matched {
                Some((text, punct)) => {
                    pos += text.len();
                    TokenKind::Punct(*punct)
                }
                None => {
                    let ch = rest.chars().next().unwrap_or('?');
                    return Err(CompileError::at(pos, format!("unexpected character `{ch}`")));
                }
            }
        };
        tokens.push(Token { kind, offset: start });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: bytes.len(),
    });
    Ok(tokens)
}

fn lex_number(source: &str, start: usize) -> Result<(TokenKind, usize), CompileError> {
    let bytes = source.as_bytes();
    let rest = &source[start..];

    for (prefix, radix) in [("0x", 16), ("0X", 16), ("0b", 2), ("0B", 2), ("0o", 8), ("0O", 8)] {
        if let Some(digits) = rest.strip_prefix(prefix) {
            let len = digits
                .find(|ch: char| !ch.is_digit(radix))
                .unwrap_or(digits.len());
            let text = &digits[..len];
            let value = u64::from_str_radix(text, radix)
                .map_err(|_| CompileError::at(start, "invalid numeric literal"))?;
            let mut end = start + prefix.len() + len;
            if bytes.get(end) == Some(&b'n') {
                end += 1;
                let value = i64::try_from(value)
                    .map_err(|_| CompileError::at(start, "BigInt literal out of 64-bit range"))?;
                return Ok((TokenKind::BigInt(value), end));
            }
            return Ok((TokenKind::Number(value as f64), end));
        }
    }

    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if bytes.get(end) == Some(&b'n') {
        let value = source[start..end]
            .parse::<i64>()
            .map_err(|_| CompileError::at(start, "BigInt literal out of 64-bit range"))?;
        return Ok((TokenKind::BigInt(value), end + 1));
    }
    if bytes.get(end) == Some(&b'.') {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        if bytes.get(exp).is_some_and(u8::is_ascii_digit) {
            end = exp;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }
    }
    let value = source[start..end]
        .parse::<f64>()
        .map_err(|_| CompileError::at(start, "invalid numeric literal"))?;
    Ok((TokenKind::Number(value), end))
}

fn lex_string(source: &str, start: usize) -> Result<(String, usize), CompileError> {
    let mut chars = source[start..].char_indices();
    let (_, quote) = chars.next().unwrap_or((0, '"'));
    let mut out = String::new();

    while let Some((i, ch)) = chars.next() {
        match ch {
            c if c == quote => return Ok((out, start + i + 1)),
            '\n' => break,
            '\\' => {
                let Some((_, esc)) = chars.next() else { break };
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    'b' => out.push('\u{8}'),
                    'f' => out.push('\u{c}'),
                    'v' => out.push('\u{b}'),
                    'u' => {
                        let hex: String = chars.by_ref().take(4).map(|(_, c)| c).collect();
                        let ch = u32::from_str_radix(&hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| CompileError::at(start + i, "invalid unicode escape"))?;
                        out.push(ch);
                    }
                    'x' => {
                        let hex: String = chars.by_ref().take(2).map(|(_, c)| c).collect();
                        let ch = u32::from_str_radix(&hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| CompileError::at(start + i, "invalid hex escape"))?;
                        out.push(ch);
                    }
                    // Line continuation.
                    '\n' => {}
                    other => out.push(other),
                }
            }
            other => out.push(other),
        }
    }

    Err(CompileError::at(start, "unterminated string literal"))
}
