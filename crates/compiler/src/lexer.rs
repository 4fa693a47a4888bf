//! Lexer
//!
//! Turns a character buffer into a token stream with source locations.
//! Character-level contracts:
//!
//! - Backslash-newline is elided wherever it appears, joining physical
//!   lines into one logical line; `at_bol` stays false across the join.
//! - Whitespace is skipped and recorded as the *preceded-by-whitespace*
//!   flag on the following token; a newline additionally sets `at_bol`,
//!   which is what lets the preprocessor recognize directives.
//! - Keyword recognition is table-driven and standard-gated: a plain-word
//!   spelling whose feature is off degrades to an identifier with a
//!   warning, while reserved `_Foo` spellings stay keywords so the parser
//!   can report a precise conformance error.
//! - String/character prefixes (`u`, `U`, `L`, `u8`) are recognized when
//!   such an identifier is immediately followed by a quote.

use crate::diag::{Diagnostics, SourceLoc};
use crate::standard::{keyword_policy, Feature, KeywordPolicy, Standard};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Auto,
    Break,
    Case,
    Char,
    Const,
    Continue,
    Default,
    Do,
    Double,
    Else,
    Enum,
    Extern,
    Float,
    For,
    Goto,
    If,
    Inline,
    Int,
    Long,
    Register,
    Restrict,
    Return,
    Short,
    Signed,
    Sizeof,
    Static,
    Struct,
    Switch,
    Typedef,
    Union,
    Unsigned,
    Void,
    Volatile,
    While,
    Bool,
    StaticAssert,
    Atomic,
    Generic,
    Noreturn,
    Alignas,
    Alignof,
    Typeof,
    True,
    False,
    Nullptr,
    Constexpr,
}

/// Keyword table: spelling, keyword, gating feature (`None` = every
/// standard).
static KEYWORDS: &[(&str, Keyword, Option<Feature>)] = &[
    ("auto", Keyword::Auto, None),
    ("break", Keyword::Break, None),
    ("case", Keyword::Case, None),
    ("char", Keyword::Char, None),
    ("const", Keyword::Const, None),
    ("continue", Keyword::Continue, None),
    ("default", Keyword::Default, None),
    ("do", Keyword::Do, None),
    ("double", Keyword::Double, None),
    ("else", Keyword::Else, None),
    ("enum", Keyword::Enum, None),
    ("extern", Keyword::Extern, None),
    ("float", Keyword::Float, None),
    ("for", Keyword::For, None),
    ("goto", Keyword::Goto, None),
    ("if", Keyword::If, None),
    ("inline", Keyword::Inline, Some(Feature::Inline)),
    ("int", Keyword::Int, None),
    ("long", Keyword::Long, None),
    ("register", Keyword::Register, None),
    ("restrict", Keyword::Restrict, Some(Feature::Restrict)),
    ("return", Keyword::Return, None),
    ("short", Keyword::Short, None),
    ("signed", Keyword::Signed, None),
    ("sizeof", Keyword::Sizeof, None),
    ("static", Keyword::Static, None),
    ("struct", Keyword::Struct, None),
    ("switch", Keyword::Switch, None),
    ("typedef", Keyword::Typedef, None),
    ("union", Keyword::Union, None),
    ("unsigned", Keyword::Unsigned, None),
    ("void", Keyword::Void, None),
    ("volatile", Keyword::Volatile, None),
    ("while", Keyword::While, None),
    ("_Bool", Keyword::Bool, Some(Feature::Bool)),
    ("_Static_assert", Keyword::StaticAssert, Some(Feature::StaticAssert)),
    ("_Atomic", Keyword::Atomic, Some(Feature::Atomic)),
    ("_Generic", Keyword::Generic, Some(Feature::Generic)),
    ("_Noreturn", Keyword::Noreturn, Some(Feature::Noreturn)),
    ("_Alignas", Keyword::Alignas, Some(Feature::Alignas)),
    ("_Alignof", Keyword::Alignof, Some(Feature::Alignof)),
    ("typeof", Keyword::Typeof, Some(Feature::Typeof)),
    ("true", Keyword::True, Some(Feature::TrueFalse)),
    ("false", Keyword::False, Some(Feature::TrueFalse)),
    ("nullptr", Keyword::Nullptr, Some(Feature::Nullptr)),
    ("constexpr", Keyword::Constexpr, Some(Feature::Constexpr)),
];

/// Look up a spelling in the keyword table.
pub fn keyword_entry(spelling: &str) -> Option<(Keyword, Option<Feature>)> {
    KEYWORDS
        .iter()
        .find(|(s, _, _)| *s == spelling)
        .map(|(_, kw, feat)| (*kw, *feat))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Punct {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Semi,
    Comma,
    Dot,
    Arrow,
    PlusPlus,
    MinusMinus,
    Amp,
    Star,
    Plus,
    Minus,
    Tilde,
    Bang,
    Slash,
    Percent,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    Caret,
    Pipe,
    AmpAmp,
    PipePipe,
    Question,
    Colon,
    Eq,
    StarEq,
    SlashEq,
    PercentEq,
    PlusEq,
    MinusEq,
    ShlEq,
    ShrEq,
    AmpEq,
    CaretEq,
    PipeEq,
    Hash,
    HashHash,
    Ellipsis,
}

/// Integer literal suffix metadata (`u`, `l`, `ll`, and combinations).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntSuffix {
    pub unsigned: bool,
    /// 0 = none, 1 = `l`, 2 = `ll`.
    pub long: u8,
}

/// String/character literal prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrPrefix {
    #[default]
    None,
    Wide,
    Utf8,
    Utf16,
    Utf32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident,
    Keyword(Keyword),
    Int {
        value: u64,
        suffix: IntSuffix,
        /// Decimal literals may not silently wrap to unsigned.
        decimal: bool,
    },
    Float {
        value: f64,
        is_f32: bool,
    },
    Char {
        value: i64,
        prefix: StrPrefix,
    },
    Str {
        bytes: Vec<u8>,
        prefix: StrPrefix,
    },
    Punct(Punct),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw spelling, used by the preprocessor and `-E` output.
    pub text: String,
    pub loc: SourceLoc,
    /// Preceded by whitespace on the same logical line.
    pub ws_before: bool,
    /// First token of a logical line.
    pub at_bol: bool,
}

impl Token {
    pub fn is_ident(&self, name: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == name
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    file: Rc<str>,
    line: u32,
    col: u32,
    std: Standard,
    at_bol: bool,
    ws_before: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(file: &str, src: &'a str, std: Standard) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            file: Rc::from(file),
            line: 1,
            col: 1,
            std,
            at_bol: true,
            ws_before: false,
        }
    }

    /// Lex the whole buffer into a token list terminated by an EOF token.
    pub fn run(mut self, diags: &mut Diagnostics) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token(diags);
            let eof = tok.is_eof();
            tokens.push(tok);
            if eof {
                break;
            }
        }
        tokens
    }

    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.file.clone(), self.line, self.col)
    }

    /// Elide backslash-newline sequences at the cursor.
    fn skip_continuations(&mut self) {
        loop {
            if self.src.get(self.pos) == Some(&b'\\') {
                match (self.src.get(self.pos + 1), self.src.get(self.pos + 2)) {
                    (Some(b'\n'), _) => {
                        self.pos += 2;
                        self.line += 1;
                        self.col = 1;
                        continue;
                    }
                    (Some(b'\r'), Some(b'\n')) => {
                        self.pos += 3;
                        self.line += 1;
                        self.col = 1;
                        continue;
                    }
                    _ => {}
                }
            }
            break;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_continuations();
        self.src.get(self.pos).copied()
    }

    fn peek_at(&mut self, offset: usize) -> Option<u8> {
        self.skip_continuations();
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        self.skip_continuations();
        let c = self.src.get(self.pos).copied()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Skip whitespace and comments, updating the pending token flags.
    fn skip_trivia(&mut self, diags: &mut Diagnostics) {
        loop {
            match self.peek() {
                Some(b'\n') => {
                    self.bump();
                    self.at_bol = true;
                    self.ws_before = false;
                }
                Some(b' ') | Some(b'\t') | Some(b'\x0b') | Some(b'\x0c') | Some(b'\r') => {
                    self.bump();
                    self.ws_before = true;
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let start = self.loc();
                    self.bump();
                    self.bump();
                    let mut closed = false;
                    while let Some(c) = self.bump() {
                        if c == b'*' && self.peek() == Some(b'/') {
                            self.bump();
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        diags.error_at(&start, "unterminated comment");
                    }
                    self.ws_before = true;
                }
                Some(b'/')
                    if self.peek_at(1) == Some(b'/')
                        && crate::standard::has_feature(self.std, Feature::LineComment) =>
                {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                    self.ws_before = true;
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self, diags: &mut Diagnostics) -> Token {
        self.skip_trivia(diags);
        let loc = self.loc();
        let at_bol = self.at_bol;
        let ws_before = self.ws_before;
        self.at_bol = false;
        self.ws_before = false;

        let make = |kind: TokenKind, text: String| Token {
            kind,
            text,
            loc: loc.clone(),
            ws_before,
            at_bol,
        };

        let c = match self.peek() {
            Some(c) => c,
            None => return make(TokenKind::Eof, String::new()),
        };

        if c.is_ascii_alphabetic() || c == b'_' {
            return self.lex_ident_or_keyword(loc, ws_before, at_bol, diags);
        }
        if c.is_ascii_digit() || (c == b'.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
        {
            return self.lex_number(loc, ws_before, at_bol, diags);
        }
        if c == b'\'' {
            return self.lex_char(StrPrefix::None, loc, ws_before, at_bol, diags);
        }
        if c == b'"' {
            return self.lex_string(StrPrefix::None, loc, ws_before, at_bol, diags);
        }

        let punct = self.lex_punct(diags, &loc);
        match punct {
            Some((p, text)) => make(TokenKind::Punct(p), text),
            None => {
                // Unknown byte: report once and skip it.
                self.bump();
                diags.error_at(&loc, format!("stray character '{}'", c as char));
                self.next_token(diags)
            }
        }
    }

    fn lex_ident_or_keyword(
        &mut self,
        loc: SourceLoc,
        ws_before: bool,
        at_bol: bool,
        diags: &mut Diagnostics,
    ) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                text.push(c as char);
                self.bump();
            } else {
                break;
            }
        }

        // Literal prefix: u8"..." u"..." U"..." L"..." and char forms.
        let prefix = match text.as_str() {
            "L" => Some(StrPrefix::Wide),
            "u8" => Some(StrPrefix::Utf8),
            "u" => Some(StrPrefix::Utf16),
            "U" => Some(StrPrefix::Utf32),
            _ => None,
        };
        if let Some(prefix) = prefix {
            if self.peek() == Some(b'"') {
                let mut tok = self.lex_string(prefix, loc, ws_before, at_bol, diags);
                tok.text = format!("{}{}", text, tok.text);
                return tok;
            }
            if self.peek() == Some(b'\'') && prefix != StrPrefix::Utf8 {
                let mut tok = self.lex_char(prefix, loc, ws_before, at_bol, diags);
                tok.text = format!("{}{}", text, tok.text);
                return tok;
            }
        }

        let kind = match keyword_entry(&text) {
            Some((kw, None)) => TokenKind::Keyword(kw),
            Some((kw, Some(feat))) => match keyword_policy(self.std, &text, feat) {
                KeywordPolicy::Keyword | KeywordPolicy::KeywordWithDeferredError => {
                    TokenKind::Keyword(kw)
                }
                KeywordPolicy::IdentifierWithWarning => {
                    diags.warn(
                        "keyword-as-identifier",
                        &loc,
                        format!("'{}' is a keyword in a later C standard; treated as an identifier in {}", text, self.std),
                    );
                    TokenKind::Ident
                }
            },
            None => TokenKind::Ident,
        };
        Token {
            kind,
            text,
            loc,
            ws_before,
            at_bol,
        }
    }

    fn lex_number(
        &mut self,
        loc: SourceLoc,
        ws_before: bool,
        at_bol: bool,
        diags: &mut Diagnostics,
    ) -> Token {
        let mut text = String::new();
        // Grab the whole preprocessing-number spelling first.
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'.' || c == b'_' {
                text.push(c as char);
                self.bump();
                // Exponent sign belongs to the number.
                if (c == b'e' || c == b'E' || c == b'p' || c == b'P')
                    && matches!(self.peek(), Some(b'+') | Some(b'-'))
                {
                    text.push(self.bump().unwrap() as char);
                }
            } else {
                break;
            }
        }

        let kind = parse_number(&text).unwrap_or_else(|msg| {
            diags.error_at(&loc, msg);
            TokenKind::Int {
                value: 0,
                suffix: IntSuffix::default(),
                decimal: true,
            }
        });
        Token {
            kind,
            text,
            loc,
            ws_before,
            at_bol,
        }
    }

    fn lex_escape(&mut self, diags: &mut Diagnostics, loc: &SourceLoc) -> i64 {
        match self.bump() {
            Some(b'n') => b'\n' as i64,
            Some(b't') => b'\t' as i64,
            Some(b'r') => b'\r' as i64,
            Some(b'a') => 0x07,
            Some(b'b') => 0x08,
            Some(b'f') => 0x0c,
            Some(b'v') => 0x0b,
            Some(first @ b'0'..=b'7') => {
                // Octal escape, up to three digits (first already consumed).
                let mut value = (first - b'0') as i64;
                for _ in 0..2 {
                    match self.peek() {
                        Some(c @ b'0'..=b'7') => {
                            value = value * 8 + (c - b'0') as i64;
                            self.bump();
                        }
                        _ => break,
                    }
                }
                value
            }
            Some(b'x') => {
                let mut value: i64 = 0;
                let mut any = false;
                while let Some(c) = self.peek() {
                    let digit = match c {
                        b'0'..=b'9' => c - b'0',
                        b'a'..=b'f' => c - b'a' + 10,
                        b'A'..=b'F' => c - b'A' + 10,
                        _ => break,
                    };
                    value = value.wrapping_mul(16).wrapping_add(digit as i64);
                    any = true;
                    self.bump();
                }
                if !any {
                    diags.error_at(loc, "\\x used with no following hex digits");
                }
                value
            }
            Some(b'\\') => b'\\' as i64,
            Some(b'\'') => b'\'' as i64,
            Some(b'"') => b'"' as i64,
            Some(b'?') => b'?' as i64,
            Some(other) => {
                diags.error_at(loc, format!("unknown escape sequence '\\{}'", other as char));
                other as i64
            }
            None => {
                diags.error_at(loc, "unexpected end of file in escape sequence");
                0
            }
        }
    }

    fn lex_char(
        &mut self,
        prefix: StrPrefix,
        loc: SourceLoc,
        ws_before: bool,
        at_bol: bool,
        diags: &mut Diagnostics,
    ) -> Token {
        let start = self.pos;
        self.bump(); // opening quote
        let mut value: i64 = 0;
        let mut count = 0;
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    diags.error_at(&loc, "unterminated character constant");
                    break;
                }
                Some(b'\'') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    value = (value << 8) | (self.lex_escape(diags, &loc) & 0xff);
                    count += 1;
                }
                Some(c) => {
                    self.bump();
                    value = (value << 8) | c as i64;
                    count += 1;
                }
            }
        }
        if count == 0 {
            diags.error_at(&loc, "empty character constant");
        }
        // Plain single-character constants are sign-extended chars.
        if count == 1 && prefix == StrPrefix::None {
            value = value as i8 as i64;
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        Token {
            kind: TokenKind::Char { value, prefix },
            text,
            loc,
            ws_before,
            at_bol,
        }
    }

    fn lex_string(
        &mut self,
        prefix: StrPrefix,
        loc: SourceLoc,
        ws_before: bool,
        at_bol: bool,
        diags: &mut Diagnostics,
    ) -> Token {
        let start = self.pos;
        self.bump(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    diags.error_at(&loc, "unterminated string literal");
                    break;
                }
                Some(b'"') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    bytes.push(self.lex_escape(diags, &loc) as u8);
                }
                Some(c) => {
                    self.bump();
                    bytes.push(c);
                }
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        Token {
            kind: TokenKind::Str { bytes, prefix },
            text,
            loc,
            ws_before,
            at_bol,
        }
    }

    fn lex_punct(&mut self, _diags: &mut Diagnostics, _loc: &SourceLoc) -> Option<(Punct, String)> {
        use Punct::*;
        let c = self.peek()?;
        let (p, len) = match c {
            b'(' => (LParen, 1),
            b')' => (RParen, 1),
            b'[' => (LBracket, 1),
            b']' => (RBracket, 1),
            b'{' => (LBrace, 1),
            b'}' => (RBrace, 1),
            b';' => (Semi, 1),
            b',' => (Comma, 1),
            b'?' => (Question, 1),
            b'~' => (Tilde, 1),
            b'.' => {
                if self.peek_at(1) == Some(b'.') && self.peek_at(2) == Some(b'.') {
                    (Ellipsis, 3)
                } else {
                    (Dot, 1)
                }
            }
            b'-' => match self.peek_at(1) {
                Some(b'>') => (Arrow, 2),
                Some(b'-') => (MinusMinus, 2),
                Some(b'=') => (MinusEq, 2),
                _ => (Minus, 1),
            },
            b'+' => match self.peek_at(1) {
                Some(b'+') => (PlusPlus, 2),
                Some(b'=') => (PlusEq, 2),
                _ => (Plus, 1),
            },
            b'&' => match self.peek_at(1) {
                Some(b'&') => (AmpAmp, 2),
                Some(b'=') => (AmpEq, 2),
                _ => (Amp, 1),
            },
            b'|' => match self.peek_at(1) {
                Some(b'|') => (PipePipe, 2),
                Some(b'=') => (PipeEq, 2),
                _ => (Pipe, 1),
            },
            b'*' => match self.peek_at(1) {
                Some(b'=') => (StarEq, 2),
                _ => (Star, 1),
            },
            b'/' => match self.peek_at(1) {
                Some(b'=') => (SlashEq, 2),
                _ => (Slash, 1),
            },
            b'%' => match self.peek_at(1) {
                Some(b'=') => (PercentEq, 2),
                _ => (Percent, 1),
            },
            b'^' => match self.peek_at(1) {
                Some(b'=') => (CaretEq, 2),
                _ => (Caret, 1),
            },
            b'!' => match self.peek_at(1) {
                Some(b'=') => (Ne, 2),
                _ => (Bang, 1),
            },
            b'=' => match self.peek_at(1) {
                Some(b'=') => (EqEq, 2),
                _ => (Eq, 1),
            },
            b'<' => match (self.peek_at(1), self.peek_at(2)) {
                (Some(b'<'), Some(b'=')) => (ShlEq, 3),
                (Some(b'<'), _) => (Shl, 2),
                (Some(b'='), _) => (Le, 2),
                _ => (Lt, 1),
            },
            b'>' => match (self.peek_at(1), self.peek_at(2)) {
                (Some(b'>'), Some(b'=')) => (ShrEq, 3),
                (Some(b'>'), _) => (Shr, 2),
                (Some(b'='), _) => (Ge, 2),
                _ => (Gt, 1),
            },
            b':' => (Colon, 1),
            b'#' => match self.peek_at(1) {
                Some(b'#') => (HashHash, 2),
                _ => (Hash, 1),
            },
            _ => return None,
        };
        let mut text = String::new();
        for _ in 0..len {
            text.push(self.bump().unwrap() as char);
        }
        Some((p, text))
    }
}

/// Parse a preprocessing-number spelling into an integer or float token
/// kind. Returns a diagnostic message on malformed spellings.
fn parse_number(text: &str) -> Result<TokenKind, String> {
    let is_float = {
        let body = text.trim_start_matches("0x").trim_start_matches("0X");
        body.contains('.')
            || (!text.starts_with("0x")
                && !text.starts_with("0X")
                && (body.contains('e') || body.contains('E')))
    };
    if is_float {
        let mut body = text;
        let mut is_f32 = false;
        if body.ends_with('f') || body.ends_with('F') {
            is_f32 = true;
            body = &body[..body.len() - 1];
        } else if body.ends_with('l') || body.ends_with('L') {
            // long double treated as double on both targets
            body = &body[..body.len() - 1];
        }
        let value: f64 = body
            .parse()
            .map_err(|_| format!("invalid floating constant '{}'", text))?;
        return Ok(TokenKind::Float { value, is_f32 });
    }

    // Split the suffix.
    let mut end = text.len();
    let bytes = text.as_bytes();
    while end > 0 && matches!(bytes[end - 1], b'u' | b'U' | b'l' | b'L') {
        end -= 1;
    }
    let (body, suffix_text) = text.split_at(end);
    let mut suffix = IntSuffix::default();
    let lower = suffix_text.to_ascii_lowercase();
    match lower.as_str() {
        "" => {}
        "u" => suffix.unsigned = true,
        "l" => suffix.long = 1,
        "ll" => suffix.long = 2,
        "ul" | "lu" => {
            suffix.unsigned = true;
            suffix.long = 1;
        }
        "ull" | "llu" => {
            suffix.unsigned = true;
            suffix.long = 2;
        }
        _ => return Err(format!("invalid integer suffix '{}'", suffix_text)),
    }

    let (digits, radix, decimal) = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        (hex, 16, false)
    } else if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        (bin, 2, false)
    } else if body.len() > 1 && body.starts_with('0') {
        (&body[1..], 8, false)
    } else {
        (body, 10, true)
    };
    if digits.is_empty() {
        return Err(format!("invalid integer constant '{}'", text));
    }
    let value = u64::from_str_radix(digits, radix)
        .map_err(|_| format!("integer constant '{}' out of range", text))?;
    Ok(TokenKind::Int {
        value,
        suffix,
        decimal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> (Vec<Token>, Diagnostics) {
        let mut diags = Diagnostics::new(false, false, false);
        let tokens = Lexer::new("t.c", src, Standard::C99).run(&mut diags);
        (tokens, diags)
    }

    fn lex_std(src: &str, std: Standard) -> (Vec<Token>, Diagnostics) {
        let mut diags = Diagnostics::new(false, false, false);
        let tokens = Lexer::new("t.c", src, std).run(&mut diags);
        (tokens, diags)
    }

    #[test]
    fn test_keywords_and_idents() {
        let (tokens, diags) = lex("int main(void)");
        assert!(!diags.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Int));
        assert_eq!(tokens[1].kind, TokenKind::Ident);
        assert_eq!(tokens[1].text, "main");
        assert_eq!(tokens[2].kind, TokenKind::Punct(Punct::LParen));
        assert_eq!(tokens[3].kind, TokenKind::Keyword(Keyword::Void));
        assert!(tokens.last().unwrap().is_eof());
    }

    #[test]
    fn test_line_and_column_tracking() {
        let (tokens, _) = lex("a\n  b");
        assert_eq!((tokens[0].loc.line, tokens[0].loc.col), (1, 1));
        assert_eq!((tokens[1].loc.line, tokens[1].loc.col), (2, 3));
        assert!(tokens[1].at_bol);
        assert!(tokens[1].ws_before);
    }

    #[test]
    fn test_line_continuation_joins_lines() {
        let (tokens, diags) = lex("ab\\\ncd");
        assert!(!diags.has_errors());
        assert_eq!(tokens[0].text, "abcd");
        // The continuation does not start a new logical line.
        assert_eq!(tokens.len(), 2);
        let (tokens, _) = lex("x\\\r\ny");
        assert_eq!(tokens[0].text, "xy");
    }

    #[test]
    fn test_at_bol_survives_only_real_newlines() {
        let (tokens, _) = lex("#define X\n# if");
        assert!(tokens[0].at_bol);
        assert_eq!(tokens[0].kind, TokenKind::Punct(Punct::Hash));
        // after the newline the '#' is at bol again
        let hash2 = tokens.iter().filter(|t| t.kind == TokenKind::Punct(Punct::Hash)).nth(1).unwrap();
        assert!(hash2.at_bol);
    }

    #[test]
    fn test_integer_literals() {
        let (tokens, _) = lex("42 0x2a 052 0 1u 2l 3ull");
        let vals: Vec<u64> = tokens
            .iter()
            .filter_map(|t| match t.kind {
                TokenKind::Int { value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(vals, vec![42, 42, 42, 0, 1, 2, 3]);
        match tokens[6].kind {
            TokenKind::Int { suffix, .. } => {
                assert!(suffix.unsigned);
                assert_eq!(suffix.long, 2);
            }
            _ => panic!("expected integer"),
        }
    }

    #[test]
    fn test_float_literals() {
        let (tokens, _) = lex("1.5 2e3 7.0f");
        match tokens[0].kind {
            TokenKind::Float { value, is_f32 } => {
                assert_eq!(value, 1.5);
                assert!(!is_f32);
            }
            _ => panic!("expected float"),
        }
        match tokens[1].kind {
            TokenKind::Float { value, .. } => assert_eq!(value, 2000.0),
            _ => panic!("expected float"),
        }
        match tokens[2].kind {
            TokenKind::Float { is_f32, .. } => assert!(is_f32),
            _ => panic!("expected float"),
        }
    }

    #[test]
    fn test_char_and_string_escapes() {
        let (tokens, diags) = lex(r#"'a' '\n' '\x41' "hi\tthere\0""#);
        assert!(!diags.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::Char { value: 97, prefix: StrPrefix::None });
        assert_eq!(tokens[1].kind, TokenKind::Char { value: 10, prefix: StrPrefix::None });
        assert_eq!(tokens[2].kind, TokenKind::Char { value: 65, prefix: StrPrefix::None });
        match &tokens[3].kind {
            TokenKind::Str { bytes, .. } => assert_eq!(bytes, b"hi\tthere\0"),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn test_string_prefixes() {
        let (tokens, _) = lex(r#"L"wide" u8"utf" L'c'"#);
        match &tokens[0].kind {
            TokenKind::Str { prefix, .. } => assert_eq!(*prefix, StrPrefix::Wide),
            _ => panic!("expected string"),
        }
        match &tokens[1].kind {
            TokenKind::Str { prefix, .. } => assert_eq!(*prefix, StrPrefix::Utf8),
            _ => panic!("expected string"),
        }
        match &tokens[2].kind {
            TokenKind::Char { prefix, .. } => assert_eq!(*prefix, StrPrefix::Wide),
            _ => panic!("expected char"),
        }
        // A lone L is still an identifier.
        let (tokens, _) = lex("L + 1");
        assert_eq!(tokens[0].kind, TokenKind::Ident);
    }

    #[test]
    fn test_standard_gated_keywords() {
        // inline is a keyword in C99...
        let (tokens, _) = lex_std("inline", Standard::C99);
        assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Inline));
        // ...but a warned identifier in C89.
        let (tokens, diags) = lex_std("inline", Standard::C89);
        assert_eq!(tokens[0].kind, TokenKind::Ident);
        assert_eq!(diags.warning_count(), 1);
        // Reserved spellings stay keywords even out of standard.
        let (tokens, diags) = lex_std("_Bool", Standard::C89);
        assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Bool));
        assert_eq!(diags.warning_count(), 0);
    }

    #[test]
    fn test_punctuators() {
        let (tokens, _) = lex("a >>= b ... c->d ## e");
        let puncts: Vec<Punct> = tokens
            .iter()
            .filter_map(|t| match t.kind {
                TokenKind::Punct(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(
            puncts,
            vec![Punct::ShrEq, Punct::Ellipsis, Punct::Arrow, Punct::HashHash]
        );
    }

    #[test]
    fn test_comments() {
        let (tokens, diags) = lex("a /* comment */ b // rest\nc");
        assert!(!diags.has_errors());
        let names: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Ident)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        // Line comments are not available in strict C89.
        let (tokens, _) = lex_std("a // b\nc", Standard::C89);
        let slashes = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Punct(Punct::Slash))
            .count();
        assert_eq!(slashes, 2);
    }

    #[test]
    fn test_unterminated_diagnostics() {
        let (_, diags) = lex("\"abc");
        assert!(diags.contains("unterminated string"));
        let (_, diags) = lex("/* abc");
        assert!(diags.contains("unterminated comment"));
    }

    #[test]
    fn test_out_of_range_literal() {
        let (_, diags) = lex("99999999999999999999999999");
        assert!(diags.contains("out of range"));
    }
}
