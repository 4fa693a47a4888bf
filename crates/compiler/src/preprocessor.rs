//! Preprocessor
//!
//! Consumes the lexer's token stream and hands the parser a directive-free
//! token list terminated by an EOF token. Implements object- and
//! function-like macros (with `#` stringize and `##` paste), `#include`
//! resolution against the include path list, the conditional directives
//! (`#if` expressions run through a small constant evaluator after
//! `defined` processing and macro expansion), `#error`, and the built-in
//! macros (`__FILE__`, `__LINE__`, `__STDC__`, `__STDC_VERSION__`,
//! `__DATE__`, `__TIME__`).
//!
//! Sources are looked up first in the virtual overlay (in-memory files the
//! driver and the tests register), then on the filesystem.

use crate::diag::{Diagnostics, SourceLoc};
use crate::lexer::{Lexer, Punct, StrPrefix, Token, TokenKind};
use crate::standard::Standard;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Nesting limit for includes and macro rescans.
const MAX_INCLUDE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
enum Macro {
    Object(Vec<Token>),
    Function {
        params: Vec<String>,
        variadic: bool,
        body: Vec<Token>,
    },
    /// Expanded from the use site: `__FILE__`, `__LINE__`.
    BuiltinFile,
    BuiltinLine,
}

pub struct Preprocessor {
    std: Standard,
    include_paths: Vec<PathBuf>,
    macros: HashMap<String, Macro>,
    virtual_files: HashMap<String, String>,
}

impl Preprocessor {
    pub fn new(std: Standard) -> Self {
        Preprocessor {
            std,
            include_paths: Vec::new(),
            macros: HashMap::new(),
            virtual_files: HashMap::new(),
        }
    }

    pub fn add_include_path(&mut self, path: impl Into<PathBuf>) {
        self.include_paths.push(path.into());
    }

    /// Register an in-memory source file, shadowing the filesystem.
    pub fn add_virtual_file(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.virtual_files.insert(name.into(), content.into());
    }

    /// `-D name[=value]`: define an object-like macro from the command
    /// line. A missing value defines the name as `1`.
    pub fn define(&mut self, name: &str, value: Option<&str>, diags: &mut Diagnostics) {
        let value = value.unwrap_or("1");
        let mut tokens = Lexer::new("<command-line>", value, self.std).run(diags);
        tokens.pop(); // drop EOF
        self.macros.insert(name.to_string(), Macro::Object(tokens));
    }

    /// Install the built-in macros.
    pub fn define_builtins(&mut self, diags: &mut Diagnostics) {
        self.macros.insert("__FILE__".into(), Macro::BuiltinFile);
        self.macros.insert("__LINE__".into(), Macro::BuiltinLine);
        self.define("__STDC__", Some("1"), diags);
        if let Some(version) = self.std.stdc_version() {
            self.define("__STDC_VERSION__", Some(&format!("{}L", version)), diags);
        }
        let (date, time) = build_timestamp();
        self.define("__DATE__", Some(&format!("\"{}\"", date)), diags);
        self.define("__TIME__", Some(&format!("\"{}\"", time)), diags);
    }

    /// Preprocess `filename` into a parser-ready token list.
    pub fn run(&mut self, filename: &str, diags: &mut Diagnostics) -> Result<Vec<Token>, String> {
        let source = self
            .load(filename, None)
            .ok_or_else(|| diags.fatal(format!("cannot open '{}'", filename)))?;
        let tokens = Lexer::new(filename, &source.0, self.std).run(diags);
        let mut out = self.process(tokens, diags, 0);
        // Terminate with a fresh EOF for the parser.
        let loc = out
            .last()
            .map(|t| t.loc.clone())
            .unwrap_or_else(SourceLoc::builtin);
        out.push(Token {
            kind: TokenKind::Eof,
            text: String::new(),
            loc,
            ws_before: false,
            at_bol: true,
        });
        Ok(out)
    }

    /// Resolve an include/source name to its content.
    ///
    /// Quoted includes search the including file's directory first, then
    /// the `-I` paths; angle includes search only the `-I` paths.
    fn load(&self, name: &str, relative_to: Option<&str>) -> Option<(String, String)> {
        if let Some(content) = self.virtual_files.get(name) {
            return Some((content.clone(), name.to_string()));
        }
        let mut candidates = Vec::new();
        if let Some(from) = relative_to {
            if let Some(dir) = Path::new(from).parent() {
                candidates.push(dir.join(name));
            }
        } else {
            candidates.push(PathBuf::from(name));
        }
        for dir in &self.include_paths {
            candidates.push(dir.join(name));
        }
        for path in candidates {
            if let Some(content) = self.virtual_files.get(path.to_string_lossy().as_ref()) {
                return Some((content.clone(), path.to_string_lossy().into_owned()));
            }
            if let Ok(content) = std::fs::read_to_string(&path) {
                return Some((content, path.to_string_lossy().into_owned()));
            }
        }
        None
    }

    fn process(&mut self, tokens: Vec<Token>, diags: &mut Diagnostics, depth: usize) -> Vec<Token> {
        let mut out = Vec::new();
        // (parent_active, branch_active, some_branch_taken, seen_else)
        let mut conds: Vec<(bool, bool, bool, bool)> = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let tok = &tokens[i];
            if tok.is_eof() {
                break;
            }
            let active = conds.iter().all(|c| c.1);
            if tok.at_bol && tok.kind == TokenKind::Punct(Punct::Hash) {
                // Collect the logical directive line.
                let mut j = i + 1;
                while j < tokens.len() && !tokens[j].at_bol && !tokens[j].is_eof() {
                    j += 1;
                }
                let line = &tokens[i + 1..j];
                self.directive(line, &tok.loc, &mut conds, active, &mut out, diags, depth);
                i = j;
                continue;
            }
            if !active {
                i += 1;
                continue;
            }
            i += self.expand_at(&tokens, i, &mut Vec::new(), &mut out, diags);
        }
        if !conds.is_empty() {
            let loc = tokens
                .last()
                .map(|t| t.loc.clone())
                .unwrap_or_else(SourceLoc::builtin);
            diags.error_at(&loc, "unterminated #if");
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn directive(
        &mut self,
        line: &[Token],
        loc: &SourceLoc,
        conds: &mut Vec<(bool, bool, bool, bool)>,
        active: bool,
        out: &mut Vec<Token>,
        diags: &mut Diagnostics,
        depth: usize,
    ) {
        let name = match line.first() {
            Some(t) => t.text.as_str(),
            None => return, // null directive
        };
        match name {
            "if" | "ifdef" | "ifndef" => {
                let branch = if !active {
                    false
                } else {
                    match name {
                        "if" => self.eval_condition(&line[1..], loc, diags),
                        "ifdef" => self.defined_operand(&line[1..], loc, diags),
                        _ => !self.defined_operand(&line[1..], loc, diags),
                    }
                };
                conds.push((active, branch, branch, false));
            }
            "elif" => match conds.last_mut() {
                Some(c) => {
                    if c.3 {
                        diags.error_at(loc, "#elif after #else");
                    }
                    let parent = c.0;
                    if !parent || c.2 {
                        c.1 = false;
                    } else {
                        let branch = self.eval_condition(&line[1..], loc, diags);
                        c.1 = branch;
                        c.2 |= branch;
                    }
                }
                None => diags.error_at(loc, "#elif without #if"),
            },
            "else" => match conds.last_mut() {
                Some(c) => {
                    if c.3 {
                        diags.error_at(loc, "#else after #else");
                    }
                    c.3 = true;
                    c.1 = c.0 && !c.2;
                    c.2 = true;
                }
                None => diags.error_at(loc, "#else without #if"),
            },
            "endif" => {
                if conds.pop().is_none() {
                    diags.error_at(loc, "#endif without #if");
                }
            }
            _ if !active => {}
            "include" => self.include(&line[1..], loc, out, diags, depth),
            "define" => self.parse_define(&line[1..], loc, diags),
            "undef" => match line.get(1) {
                Some(t) => {
                    self.macros.remove(&t.text);
                }
                None => diags.error_at(loc, "macro name missing after #undef"),
            },
            "error" => {
                let text: Vec<&str> = line[1..].iter().map(|t| t.text.as_str()).collect();
                diags.error_at(loc, format!("#error {}", text.join(" ")));
            }
            "line" | "pragma" => {} // accepted and ignored
            _ => diags.error_at(loc, format!("unknown preprocessing directive '#{}'", name)),
        }
    }

    fn defined_operand(&self, line: &[Token], loc: &SourceLoc, diags: &mut Diagnostics) -> bool {
        match line.first() {
            Some(t) if matches!(t.kind, TokenKind::Ident | TokenKind::Keyword(_)) => {
                self.macros.contains_key(&t.text)
            }
            _ => {
                diags.error_at(loc, "macro name missing in conditional directive");
                false
            }
        }
    }

    fn include(
        &mut self,
        line: &[Token],
        loc: &SourceLoc,
        out: &mut Vec<Token>,
        diags: &mut Diagnostics,
        depth: usize,
    ) {
        if depth >= MAX_INCLUDE_DEPTH {
            diags.error_at(loc, "#include nested too deeply");
            return;
        }
        let (name, quoted) = match line.first() {
            Some(Token {
                kind: TokenKind::Str { bytes, .. },
                ..
            }) => (String::from_utf8_lossy(bytes).into_owned(), true),
            Some(Token {
                kind: TokenKind::Punct(Punct::Lt),
                ..
            }) => {
                let mut name = String::new();
                for tok in &line[1..] {
                    if tok.kind == TokenKind::Punct(Punct::Gt) {
                        break;
                    }
                    name.push_str(&tok.text);
                }
                (name, false)
            }
            _ => {
                diags.error_at(loc, "expected \"FILENAME\" or <FILENAME> after #include");
                return;
            }
        };
        let relative = quoted.then(|| loc.file.as_ref());
        let (content, resolved) = match self.load(&name, relative) {
            Some(found) => found,
            None => {
                diags.error_at(loc, format!("'{}' file not found", name));
                return;
            }
        };
        let tokens = Lexer::new(&resolved, &content, self.std).run(diags);
        let included = self.process(tokens, diags, depth + 1);
        out.extend(included);
    }

    fn parse_define(&mut self, line: &[Token], loc: &SourceLoc, diags: &mut Diagnostics) {
        let name = match line.first() {
            Some(t) if matches!(t.kind, TokenKind::Ident | TokenKind::Keyword(_)) => t.text.clone(),
            _ => {
                diags.error_at(loc, "macro name missing after #define");
                return;
            }
        };
        // Function-like only when '(' immediately follows the name.
        let function_like = matches!(
            line.get(1),
            Some(Token {
                kind: TokenKind::Punct(Punct::LParen),
                ws_before: false,
                ..
            })
        );
        if !function_like {
            self.macros
                .insert(name, Macro::Object(line[1..].to_vec()));
            return;
        }
        let mut params = Vec::new();
        let mut variadic = false;
        let mut i = 2;
        loop {
            match line.get(i) {
                Some(t) if t.kind == TokenKind::Punct(Punct::RParen) => {
                    i += 1;
                    break;
                }
                Some(t) if t.kind == TokenKind::Punct(Punct::Ellipsis) => {
                    variadic = true;
                    i += 1;
                }
                Some(t) if matches!(t.kind, TokenKind::Ident | TokenKind::Keyword(_)) => {
                    params.push(t.text.clone());
                    i += 1;
                }
                Some(t) if t.kind == TokenKind::Punct(Punct::Comma) => i += 1,
                _ => {
                    diags.error_at(loc, "malformed macro parameter list");
                    return;
                }
            }
        }
        self.macros.insert(
            name,
            Macro::Function {
                params,
                variadic,
                body: line[i..].to_vec(),
            },
        );
    }

    /// Expand the macro (if any) at `tokens[i]`, appending the result to
    /// `out`. Returns how many input tokens were consumed.
    fn expand_at(
        &self,
        tokens: &[Token],
        i: usize,
        hide: &mut Vec<String>,
        out: &mut Vec<Token>,
        diags: &mut Diagnostics,
    ) -> usize {
        let tok = &tokens[i];
        let is_name = matches!(tok.kind, TokenKind::Ident | TokenKind::Keyword(_));
        if !is_name || hide.contains(&tok.text) {
            out.push(tok.clone());
            return 1;
        }
        let mac = match self.macros.get(&tok.text) {
            Some(m) => m.clone(),
            None => {
                out.push(tok.clone());
                return 1;
            }
        };
        match mac {
            Macro::BuiltinFile => {
                out.push(Token {
                    kind: TokenKind::Str {
                        bytes: tok.loc.file.as_bytes().to_vec(),
                        prefix: StrPrefix::None,
                    },
                    text: format!("\"{}\"", tok.loc.file),
                    loc: tok.loc.clone(),
                    ws_before: tok.ws_before,
                    at_bol: tok.at_bol,
                });
                1
            }
            Macro::BuiltinLine => {
                out.push(Token {
                    kind: TokenKind::Int {
                        value: tok.loc.line as u64,
                        suffix: Default::default(),
                        decimal: true,
                    },
                    text: tok.loc.line.to_string(),
                    loc: tok.loc.clone(),
                    ws_before: tok.ws_before,
                    at_bol: tok.at_bol,
                });
                1
            }
            Macro::Object(body) => {
                hide.push(tok.text.clone());
                let expanded = self.expand_list(&body, &tok.loc, hide, diags);
                hide.pop();
                splice(expanded, tok, out);
                1
            }
            Macro::Function {
                params,
                variadic,
                body,
            } => {
                // Without an argument list the name is ordinary text.
                if tokens.get(i + 1).map(|t| &t.kind) != Some(&TokenKind::Punct(Punct::LParen)) {
                    out.push(tok.clone());
                    return 1;
                }
                let (args, consumed) = match collect_args(tokens, i + 1) {
                    Some(found) => found,
                    None => {
                        diags.error_at(&tok.loc, "unterminated macro argument list");
                        out.push(tok.clone());
                        return 1;
                    }
                };
                if args.len() < params.len() || (!variadic && args.len() > params.len() && !(params.is_empty() && args.len() == 1 && args[0].is_empty())) {
                    diags.error_at(
                        &tok.loc,
                        format!(
                            "macro '{}' expects {} argument(s), got {}",
                            tok.text,
                            params.len(),
                            args.len()
                        ),
                    );
                }
                let substituted =
                    self.substitute(&body, &params, variadic, &args, &tok.loc, hide, diags);
                hide.push(tok.text.clone());
                let expanded = self.expand_list(&substituted, &tok.loc, hide, diags);
                hide.pop();
                splice(expanded, tok, out);
                1 + consumed
            }
        }
    }

    /// Fully expand a token list.
    fn expand_list(
        &self,
        tokens: &[Token],
        loc: &SourceLoc,
        hide: &mut Vec<String>,
        diags: &mut Diagnostics,
    ) -> Vec<Token> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            i += self.expand_at(tokens, i, hide, &mut out, diags);
        }
        // Expanded tokens report the use site.
        for tok in &mut out {
            tok.loc = loc.clone();
        }
        out
    }

    /// Substitute parameters into a function-like macro body, handling
    /// `#` stringize and `##` paste.
    #[allow(clippy::too_many_arguments)]
    fn substitute(
        &self,
        body: &[Token],
        params: &[String],
        variadic: bool,
        args: &[Vec<Token>],
        loc: &SourceLoc,
        hide: &mut Vec<String>,
        diags: &mut Diagnostics,
    ) -> Vec<Token> {
        let arg_of = |text: &str| -> Option<Vec<Token>> {
            if let Some(idx) = params.iter().position(|p| p == text) {
                return Some(args.get(idx).cloned().unwrap_or_default());
            }
            if variadic && text == "__VA_ARGS__" {
                let rest: Vec<Token> = args
                    .iter()
                    .skip(params.len())
                    .enumerate()
                    .flat_map(|(k, a)| {
                        let mut a = a.clone();
                        if k > 0 {
                            a.insert(
                                0,
                                Token {
                                    kind: TokenKind::Punct(Punct::Comma),
                                    text: ",".into(),
                                    loc: loc.clone(),
                                    ws_before: false,
                                    at_bol: false,
                                },
                            );
                        }
                        a
                    })
                    .collect();
                return Some(rest);
            }
            None
        };

        let mut out: Vec<Token> = Vec::new();
        let mut i = 0;
        while i < body.len() {
            let tok = &body[i];
            // Stringize: # param
            if tok.kind == TokenKind::Punct(Punct::Hash) {
                if let Some(next) = body.get(i + 1) {
                    if let Some(arg) = arg_of(&next.text) {
                        let text = spell(&arg);
                        out.push(Token {
                            kind: TokenKind::Str {
                                bytes: text.clone().into_bytes(),
                                prefix: StrPrefix::None,
                            },
                            text: format!("\"{}\"", text),
                            loc: loc.clone(),
                            ws_before: tok.ws_before,
                            at_bol: false,
                        });
                        i += 2;
                        continue;
                    }
                }
                diags.error_at(loc, "'#' is not followed by a macro parameter");
                i += 1;
                continue;
            }
            // Paste: token ## token
            if body.get(i + 1).map(|t| &t.kind) == Some(&TokenKind::Punct(Punct::HashHash)) {
                let lhs = match arg_of(&tok.text) {
                    Some(arg) => arg,
                    None => vec![tok.clone()],
                };
                let rhs_tok = match body.get(i + 2) {
                    Some(t) => t,
                    None => {
                        diags.error_at(loc, "'##' cannot appear at the end of a macro body");
                        break;
                    }
                };
                let rhs = match arg_of(&rhs_tok.text) {
                    Some(arg) => arg,
                    None => vec![rhs_tok.clone()],
                };
                out.extend(paste(&lhs, &rhs, loc, self.std, diags));
                i += 3;
                continue;
            }
            // Plain parameter: splice the fully-expanded argument.
            if let Some(arg) = arg_of(&tok.text) {
                let expanded = self.expand_list(&arg, loc, hide, diags);
                splice(expanded, tok, &mut out);
                i += 1;
                continue;
            }
            out.push(tok.clone());
            i += 1;
        }
        out
    }

    /// Evaluate a `#if` expression: process `defined`, expand macros, map
    /// leftover identifiers to 0, then run the token evaluator.
    fn eval_condition(&self, line: &[Token], loc: &SourceLoc, diags: &mut Diagnostics) -> bool {
        // Replace defined X / defined(X) before expansion.
        let mut replaced: Vec<Token> = Vec::new();
        let mut i = 0;
        while i < line.len() {
            let tok = &line[i];
            if tok.is_ident("defined") {
                let (name_tok, next) = if line.get(i + 1).map(|t| &t.kind)
                    == Some(&TokenKind::Punct(Punct::LParen))
                {
                    (line.get(i + 2), i + 4)
                } else {
                    (line.get(i + 1), i + 2)
                };
                let value = match name_tok {
                    Some(t) if matches!(t.kind, TokenKind::Ident | TokenKind::Keyword(_)) => {
                        self.macros.contains_key(&t.text) as u64
                    }
                    _ => {
                        diags.error_at(loc, "macro name missing after 'defined'");
                        0
                    }
                };
                replaced.push(int_token(value, loc));
                i = next;
                continue;
            }
            replaced.push(tok.clone());
            i += 1;
        }
        let expanded = self.expand_list(&replaced, loc, &mut Vec::new(), diags);
        // Remaining names evaluate to 0.
        let mapped: Vec<Token> = expanded
            .into_iter()
            .map(|t| {
                if matches!(t.kind, TokenKind::Ident | TokenKind::Keyword(_)) {
                    int_token(0, loc)
                } else {
                    t
                }
            })
            .collect();
        let mut eval = CondEval {
            tokens: &mapped,
            pos: 0,
            diags,
            loc,
        };
        let value = eval.ternary();
        value != 0
    }
}

/// Append `expanded` to `out`, giving the first token the replaced token's
/// spacing flags so `-E` output stays faithful.
fn splice(expanded: Vec<Token>, origin: &Token, out: &mut Vec<Token>) {
    for (k, mut tok) in expanded.into_iter().enumerate() {
        if k == 0 {
            tok.ws_before = origin.ws_before;
            tok.at_bol = origin.at_bol;
        } else {
            tok.at_bol = false;
        }
        out.push(tok);
    }
}

/// Collect macro call arguments starting at the '(' token. Returns the
/// argument lists and the number of tokens consumed including both parens.
fn collect_args(tokens: &[Token], open: usize) -> Option<(Vec<Vec<Token>>, usize)> {
    let mut args: Vec<Vec<Token>> = vec![Vec::new()];
    let mut depth = 0usize;
    let mut i = open;
    loop {
        let tok = tokens.get(i)?;
        if tok.is_eof() {
            return None;
        }
        match tok.kind {
            TokenKind::Punct(Punct::LParen) => {
                depth += 1;
                if depth > 1 {
                    args.last_mut().unwrap().push(tok.clone());
                }
            }
            TokenKind::Punct(Punct::RParen) => {
                depth -= 1;
                if depth == 0 {
                    let consumed = i - open + 1;
                    return Some((args, consumed));
                }
                args.last_mut().unwrap().push(tok.clone());
            }
            TokenKind::Punct(Punct::Comma) if depth == 1 => args.push(Vec::new()),
            _ => args.last_mut().unwrap().push(tok.clone()),
        }
        i += 1;
    }
}

/// Render a token list back to text (stringize).
fn spell(tokens: &[Token]) -> String {
    let mut out = String::new();
    for (i, tok) in tokens.iter().enumerate() {
        if i > 0 && tok.ws_before {
            out.push(' ');
        }
        // Escape embedded quotes and backslashes per 6.10.3.2.
        for c in tok.text.chars() {
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

/// Paste the last token of `lhs` with the first token of `rhs` by
/// re-lexing the concatenated spelling.
fn paste(
    lhs: &[Token],
    rhs: &[Token],
    loc: &SourceLoc,
    std: Standard,
    diags: &mut Diagnostics,
) -> Vec<Token> {
    let mut out: Vec<Token> = lhs.to_vec();
    let left = out.pop();
    let (right, rest) = match rhs.split_first() {
        Some(found) => found,
        None => {
            out.extend(left);
            return out;
        }
    };
    let joined = format!(
        "{}{}",
        left.as_ref().map(|t| t.text.as_str()).unwrap_or(""),
        right.text
    );
    let mut lexed = Lexer::new(&loc.file, &joined, std).run(diags);
    lexed.pop(); // EOF
    if lexed.len() != 1 {
        diags.error_at(
            loc,
            format!("pasting formed '{}', an invalid preprocessing token", joined),
        );
    }
    for mut tok in lexed {
        tok.loc = loc.clone();
        tok.at_bol = false;
        out.push(tok);
    }
    out.extend(rest.iter().cloned());
    out
}

fn int_token(value: u64, loc: &SourceLoc) -> Token {
    Token {
        kind: TokenKind::Int {
            value,
            suffix: Default::default(),
            decimal: true,
        },
        text: value.to_string(),
        loc: loc.clone(),
        ws_before: true,
        at_bol: false,
    }
}

/// Minimal constant evaluator for `#if` lines. Arithmetic is signed
/// 64-bit with wrap; division by zero is reported and yields 0.
struct CondEval<'a, 'd> {
    tokens: &'a [Token],
    pos: usize,
    diags: &'d mut Diagnostics,
    loc: &'a SourceLoc,
}

impl CondEval<'_, '_> {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn eat(&mut self, p: Punct) -> bool {
        if self.peek() == Some(&TokenKind::Punct(p)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ternary(&mut self) -> i64 {
        let cond = self.binary(0);
        if self.eat(Punct::Question) {
            let then_v = self.ternary();
            if !self.eat(Punct::Colon) {
                self.diags.error_at(self.loc, "expected ':' in #if expression");
            }
            let else_v = self.ternary();
            return if cond != 0 { then_v } else { else_v };
        }
        cond
    }

    fn binary(&mut self, min_prec: u8) -> i64 {
        let mut lhs = self.unary();
        loop {
            let (prec, punct) = match self.peek() {
                Some(TokenKind::Punct(p)) => match p {
                    Punct::PipePipe => (1, *p),
                    Punct::AmpAmp => (2, *p),
                    Punct::Pipe => (3, *p),
                    Punct::Caret => (4, *p),
                    Punct::Amp => (5, *p),
                    Punct::EqEq | Punct::Ne => (6, *p),
                    Punct::Lt | Punct::Gt | Punct::Le | Punct::Ge => (7, *p),
                    Punct::Shl | Punct::Shr => (8, *p),
                    Punct::Plus | Punct::Minus => (9, *p),
                    Punct::Star | Punct::Slash | Punct::Percent => (10, *p),
                    _ => break,
                },
                _ => break,
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(prec + 1);
            lhs = match punct {
                Punct::PipePipe => ((lhs != 0) || (rhs != 0)) as i64,
                Punct::AmpAmp => ((lhs != 0) && (rhs != 0)) as i64,
                Punct::Pipe => lhs | rhs,
                Punct::Caret => lhs ^ rhs,
                Punct::Amp => lhs & rhs,
                Punct::EqEq => (lhs == rhs) as i64,
                Punct::Ne => (lhs != rhs) as i64,
                Punct::Lt => (lhs < rhs) as i64,
                Punct::Gt => (lhs > rhs) as i64,
                Punct::Le => (lhs <= rhs) as i64,
                Punct::Ge => (lhs >= rhs) as i64,
                Punct::Shl => lhs.wrapping_shl(rhs as u32),
                Punct::Shr => lhs.wrapping_shr(rhs as u32),
                Punct::Plus => lhs.wrapping_add(rhs),
                Punct::Minus => lhs.wrapping_sub(rhs),
                Punct::Star => lhs.wrapping_mul(rhs),
                Punct::Slash | Punct::Percent => {
                    if rhs == 0 {
                        self.diags
                            .error_at(self.loc, "division by zero in #if expression");
                        0
                    } else if punct == Punct::Slash {
                        lhs.wrapping_div(rhs)
                    } else {
                        lhs.wrapping_rem(rhs)
                    }
                }
                _ => unreachable!(),
            };
        }
        lhs
    }

    fn unary(&mut self) -> i64 {
        if self.eat(Punct::Minus) {
            return self.unary().wrapping_neg();
        }
        if self.eat(Punct::Plus) {
            return self.unary();
        }
        if self.eat(Punct::Bang) {
            return (self.unary() == 0) as i64;
        }
        if self.eat(Punct::Tilde) {
            return !self.unary();
        }
        if self.eat(Punct::LParen) {
            let v = self.ternary();
            if !self.eat(Punct::RParen) {
                self.diags.error_at(self.loc, "expected ')' in #if expression");
            }
            return v;
        }
        match self.peek() {
            Some(TokenKind::Int { value, .. }) => {
                let v = *value as i64;
                self.pos += 1;
                v
            }
            Some(TokenKind::Char { value, .. }) => {
                let v = *value;
                self.pos += 1;
                v
            }
            _ => {
                self.diags
                    .error_at(self.loc, "invalid token in #if expression");
                self.pos += 1;
                0
            }
        }
    }
}

/// Render a preprocessed token stream for `-E`: file/line markers on file
/// switches, newlines on logical line starts, spaces per the whitespace
/// flag.
pub fn render_preprocessed(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut current_file: Option<&str> = None;
    for tok in tokens {
        if tok.is_eof() {
            break;
        }
        if current_file != Some(tok.loc.file.as_ref()) {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&format!("# {} \"{}\"\n", tok.loc.line, tok.loc.file));
            current_file = Some(tok.loc.file.as_ref());
        } else if tok.at_bol {
            out.push('\n');
        } else if tok.ws_before {
            out.push(' ');
        }
        out.push_str(&tok.text);
    }
    out.push('\n');
    out
}

/// `__DATE__` / `__TIME__` strings in the standard's fixed formats.
fn build_timestamp() -> (String, String) {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = (secs / 86400) as i64;
    let rem = secs % 86400;
    // Civil-from-days (Gregorian), days since 1970-01-01.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };
    let date = format!("{} {:2} {}", MONTHS[(month - 1) as usize], day, year);
    let time = format!(
        "{:02}:{:02}:{:02}",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    );
    (date, time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> (Vec<Token>, Diagnostics) {
        let mut diags = Diagnostics::new(false, false, false);
        let mut pp = Preprocessor::new(Standard::C99);
        pp.define_builtins(&mut diags);
        pp.add_virtual_file("t.c", src);
        let tokens = pp.run("t.c", &mut diags).unwrap();
        (tokens, diags)
    }

    fn texts(tokens: &[Token]) -> Vec<&str> {
        tokens
            .iter()
            .filter(|t| !t.is_eof())
            .map(|t| t.text.as_str())
            .collect()
    }

    #[test]
    fn test_object_macro() {
        let (tokens, diags) = run("#define N 10\nint x = N;");
        assert!(!diags.has_errors());
        assert_eq!(texts(&tokens), vec!["int", "x", "=", "10", ";"]);
    }

    #[test]
    fn test_function_macro() {
        let (tokens, _) = run("#define SQ(x) ((x) * (x))\nSQ(a + 1)");
        assert_eq!(
            texts(&tokens),
            vec!["(", "(", "a", "+", "1", ")", "*", "(", "a", "+", "1", ")", ")"]
        );
    }

    #[test]
    fn test_function_macro_without_args_is_plain() {
        let (tokens, _) = run("#define F(x) x\nint F = 1;");
        assert_eq!(texts(&tokens), vec!["int", "F", "=", "1", ";"]);
    }

    #[test]
    fn test_self_reference_does_not_loop() {
        let (tokens, _) = run("#define X X + 1\nX");
        assert_eq!(texts(&tokens), vec!["X", "+", "1"]);
    }

    #[test]
    fn test_stringize_and_paste() {
        let (tokens, diags) = run("#define STR(x) #x\n#define CAT(a,b) a ## b\nSTR(hi there) CAT(foo, bar)");
        assert!(!diags.has_errors());
        let t = texts(&tokens);
        assert_eq!(t[0], "\"hi there\"");
        assert_eq!(t[1], "foobar");
    }

    #[test]
    fn test_conditionals() {
        let (tokens, _) = run("#define A 1\n#if A\nyes\n#else\nno\n#endif");
        assert_eq!(texts(&tokens), vec!["yes"]);
        let (tokens, _) = run("#ifdef MISSING\nyes\n#elif 2 > 1\nmid\n#else\nno\n#endif");
        assert_eq!(texts(&tokens), vec!["mid"]);
    }

    #[test]
    fn test_defined_operator() {
        let (tokens, _) = run("#define A 0\n#if defined(A) && !defined B\nok\n#endif");
        assert_eq!(texts(&tokens), vec!["ok"]);
    }

    #[test]
    fn test_nested_inactive_blocks() {
        let (tokens, diags) = run("#if 0\n#if 1\nx\n#endif\ny\n#endif\nz");
        assert!(!diags.has_errors());
        assert_eq!(texts(&tokens), vec!["z"]);
    }

    #[test]
    fn test_unterminated_if_reported() {
        let (_, diags) = run("#if 1\nx");
        assert!(diags.contains("unterminated #if"));
    }

    #[test]
    fn test_include_virtual() {
        let mut diags = Diagnostics::new(false, false, false);
        let mut pp = Preprocessor::new(Standard::C99);
        pp.add_virtual_file("header.h", "int from_header;");
        pp.add_virtual_file("t.c", "#include \"header.h\"\nint local;");
        let tokens = pp.run("t.c", &mut diags).unwrap();
        assert_eq!(
            texts(&tokens),
            vec!["int", "from_header", ";", "int", "local", ";"]
        );
    }

    #[test]
    fn test_include_not_found() {
        let (_, diags) = run("#include <no_such_file.h>\n");
        assert!(diags.contains("file not found"));
    }

    #[test]
    fn test_include_guard() {
        let mut diags = Diagnostics::new(false, false, false);
        let mut pp = Preprocessor::new(Standard::C99);
        pp.add_virtual_file(
            "g.h",
            "#ifndef G_H\n#define G_H\nint once;\n#endif",
        );
        pp.add_virtual_file("t.c", "#include \"g.h\"\n#include \"g.h\"\n");
        let tokens = pp.run("t.c", &mut diags).unwrap();
        assert_eq!(texts(&tokens), vec!["int", "once", ";"]);
    }

    #[test]
    fn test_builtin_macros() {
        let (tokens, _) = run("__LINE__\n__FILE__ __STDC__");
        match &tokens[0].kind {
            TokenKind::Int { value, .. } => assert_eq!(*value, 1),
            other => panic!("expected int, got {:?}", other),
        }
        match &tokens[1].kind {
            TokenKind::Str { bytes, .. } => assert_eq!(bytes, b"t.c"),
            other => panic!("expected string, got {:?}", other),
        }
        // __STDC_VERSION__ is defined for C99.
        let (tokens, _) = run("__STDC_VERSION__");
        match &tokens[0].kind {
            TokenKind::Int { value, .. } => assert_eq!(*value, 199901),
            other => panic!("expected int, got {:?}", other),
        }
    }

    #[test]
    fn test_error_directive() {
        let (_, diags) = run("#if 0\n#error never\n#endif\n#error boom now");
        assert!(!diags.contains("never"));
        assert!(diags.contains("#error boom now"));
    }

    #[test]
    fn test_undef() {
        let (tokens, _) = run("#define A 1\n#undef A\nA");
        assert_eq!(texts(&tokens), vec!["A"]);
    }

    #[test]
    fn test_render_preprocessed() {
        let (tokens, _) = run("#define N 3\nint x = N;\nint y;");
        let text = render_preprocessed(&tokens);
        assert!(text.contains("int x = 3;"));
        assert!(text.contains("int y;"));
        assert!(text.starts_with("# "));
    }

    #[test]
    fn test_variadic_macro() {
        let (tokens, _) = run("#define CALL(f, ...) f(__VA_ARGS__)\nCALL(g, 1, 2)");
        assert_eq!(texts(&tokens), vec!["g", "(", "1", ",", "2", ")"]);
    }
}
