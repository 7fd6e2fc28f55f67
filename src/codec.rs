//! # Escaping Codec
//!
//! Every native string that ends up inside a generated call-out snippet goes
//! through [`escape`]. The output is a literal *body*: wrapping it in either
//! single or double quotes yields a literal that evaluates back to the input
//! and cannot close early or smuggle in extra statements.
//!
//! The decoding half ([`parse_literal`], [`unescape`]) implements the string
//! literal grammar of the page's script language, which lets the headless
//! script environment evaluate snippets without a real page engine.

use std::{fmt::Write, iter::Peekable, str::CharIndices};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("expected a string literal at offset {0}")]
    ExpectedLiteral(usize),
    #[error("unterminated string literal")]
    Unterminated,
    #[error("line terminator inside string literal at offset {0}")]
    LineTerminator(usize),
    #[error("invalid escape sequence at offset {0}")]
    InvalidEscape(usize),
    #[error("escape at offset {0} is not a Unicode scalar value")]
    InvalidCodePoint(usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

type Chars<'a> = Peekable<CharIndices<'a>>;

/// Escapes `input` so it can be placed between `'...'` or `"..."`.
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + input.len() / 8 + 2);
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{b}' => out.push_str("\\v"),
            '\u{c}' => out.push_str("\\f"),
            // Older engines end a literal at these.
            '\u{2028}' | '\u{2029}' => push_unicode_escape(&mut out, ch),
            c if c.is_control() => push_unicode_escape(&mut out, c),
            c => out.push(c),
        }
    }
    out
}

/// Escapes `input` and wraps it in double quotes.
pub fn quote(input: &str) -> String {
    format!("\"{}\"", escape(input))
}

fn push_unicode_escape(out: &mut String, ch: char) {
    // Every char routed here is in the BMP.
    let _ = write!(out, "\\u{:04X}", ch as u32);
}

/// Decodes a literal body (the text between the quotes).
pub fn unescape(body: &str) -> CodecResult<String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.char_indices().peekable();
    while let Some((offset, ch)) = chars.next() {
        match ch {
            '\\' => decode_escape(&mut chars, offset, &mut out)?,
            '\n' | '\r' => return Err(CodecError::LineTerminator(offset)),
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Parses one quoted literal at the start of `source`.
///
/// Returns the decoded value and the unconsumed remainder.
pub fn parse_literal(source: &str) -> CodecResult<(String, &str)> {
    let mut chars = source.char_indices().peekable();
    let quote = match chars.next() {
        Some((_, q @ ('"' | '\''))) => q,
        _ => return Err(CodecError::ExpectedLiteral(0)),
    };

    let mut out = String::new();
    while let Some((offset, ch)) = chars.next() {
        match ch {
            c if c == quote => return Ok((out, &source[offset + c.len_utf8()..])),
            '\\' => decode_escape(&mut chars, offset, &mut out)?,
            '\n' | '\r' => return Err(CodecError::LineTerminator(offset)),
            c => out.push(c),
        }
    }
    Err(CodecError::Unterminated)
}

fn decode_escape(chars: &mut Chars<'_>, offset: usize, out: &mut String) -> CodecResult<()> {
    let Some((_, ch)) = chars.next() else {
        return Err(CodecError::Unterminated);
    };
    match ch {
        'n' => out.push('\n'),
        'r' => out.push('\r'),
        't' => out.push('\t'),
        'b' => out.push('\u{8}'),
        'v' => out.push('\u{b}'),
        'f' => out.push('\u{c}'),
        '0' if !matches!(chars.peek(), Some((_, d)) if d.is_ascii_digit()) => out.push('\0'),
        // Legacy octal escapes are rejected, strict mode does the same.
        '0'..='9' => return Err(CodecError::InvalidEscape(offset)),
        'x' => {
            let code = read_hex(chars, 2, offset)?;
            push_code_point(out, code, offset)?;
        }
        'u' => {
            let unit = read_unicode_escape(chars, offset)?;
            if (0xD800..0xDC00).contains(&unit) {
                let low = read_low_surrogate(chars, offset)?;
                let code = 0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00);
                push_code_point(out, code, offset)?;
            } else {
                push_code_point(out, unit, offset)?;
            }
        }
        // Line continuations contribute nothing.
        '\r' => {
            if matches!(chars.peek(), Some((_, '\n'))) {
                chars.next();
            }
        }
        '\n' | '\u{2028}' | '\u{2029}' => {}
        other => out.push(other),
    }
    Ok(())
}

fn read_hex(chars: &mut Chars<'_>, digits: usize, offset: usize) -> CodecResult<u32> {
    let mut value = 0u32;
    for _ in 0..digits {
        let digit = chars
            .next()
            .and_then(|(_, c)| c.to_digit(16))
            .ok_or(CodecError::InvalidEscape(offset))?;
        value = value * 16 + digit;
    }
    Ok(value)
}

fn read_unicode_escape(chars: &mut Chars<'_>, offset: usize) -> CodecResult<u32> {
    if !matches!(chars.peek(), Some((_, '{'))) {
        return read_hex(chars, 4, offset);
    }
    chars.next();

    let mut value = 0u32;
    let mut digits = 0;
    loop {
        match chars.next() {
            Some((_, '}')) if digits > 0 => break,
            Some((_, c)) => {
                let digit = c.to_digit(16).ok_or(CodecError::InvalidEscape(offset))?;
                digits += 1;
                if digits > 6 {
                    return Err(CodecError::InvalidEscape(offset));
                }
                value = value * 16 + digit;
            }
            None => return Err(CodecError::Unterminated),
        }
    }
    if value > 0x10FFFF {
        return Err(CodecError::InvalidCodePoint(offset));
    }
    Ok(value)
}

fn read_low_surrogate(chars: &mut Chars<'_>, offset: usize) -> CodecResult<u32> {
    match (chars.next(), chars.next()) {
        (Some((_, '\\')), Some((_, 'u'))) => {}
        _ => return Err(CodecError::InvalidCodePoint(offset)),
    }
    let low = read_unicode_escape(chars, offset)?;
    if !(0xDC00..0xE000).contains(&low) {
        return Err(CodecError::InvalidCodePoint(offset));
    }
    Ok(low)
}

fn push_code_point(out: &mut String, code: u32, offset: usize) -> CodecResult<()> {
    let ch = char::from_u32(code).ok_or(CodecError::InvalidCodePoint(offset))?;
    out.push(ch);
    Ok(())
}
