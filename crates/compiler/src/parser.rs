//! Parser
//!
//! Recursive descent over the preprocessed token stream, producing the
//! AST. The parser owns the syntactic context the grammar needs:
//!
//! - a typedef-name scope stack (the classic declaration/expression
//!   ambiguity is resolved by knowing which identifiers name types), and
//! - a tag scope stack mapping `struct`/`union`/`enum` tags to their
//!   interned type ids, so member types resolve while the record is still
//!   being defined (`struct S { struct S *next; }`).
//!
//! Enum constant values are folded here (they can appear in array sizes
//! before the analyzer runs); the analyzer re-enters them into the symbol
//! table for expression lookup.
//!
//! Errors are recorded in the diagnostic sink and parsing resumes at the
//! nearest synchronization point (statement or external declaration).

use crate::ast::*;
use crate::const_eval;
use crate::diag::{Diagnostics, SourceLoc};
use crate::lexer::{Keyword, Punct, Token, TokenKind};
use crate::standard::{has_feature, Feature, Standard};
use crate::symbols::StorageClass;
use crate::types::{Field, Quals, RecordKind, TypeId, TypeTable};
use std::collections::HashMap;

/// Parse error: where and what. Recorded in the sink at the recovery
/// point.
pub struct ParseError {
    pub loc: SourceLoc,
    pub msg: String,
}

type PResult<T> = Result<T, ParseError>;

fn err<T>(loc: &SourceLoc, msg: impl Into<String>) -> PResult<T> {
    Err(ParseError {
        loc: loc.clone(),
        msg: msg.into(),
    })
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    std: Standard,
    types: &'a mut TypeTable,
    diags: &'a mut Diagnostics,
    /// name -> typedef target (`None` marks a non-typedef declaration that
    /// shadows an outer typedef), innermost scope last.
    typedef_scopes: Vec<HashMap<String, Option<TypeId>>>,
    /// tag -> type id, per scope.
    tag_scopes: Vec<HashMap<String, TypeId>>,
    /// Enum constant values visible to constant expressions, per scope.
    enum_scopes: Vec<HashMap<String, i64>>,
    /// Parameter declarations of the most recently parsed function
    /// declarator (used when it turns out to be a definition).
    last_fn_params: Vec<ParamDecl>,
}

/// What one run of declaration specifiers produced.
struct DeclSpec {
    base: TypeId,
    storage: StorageClass,
    is_inline: bool,
    is_noreturn: bool,
    /// Set when the specifiers defaulted to `int` with nothing written.
    implicit_int: bool,
    loc: SourceLoc,
}

impl<'a> Parser<'a> {
    pub fn new(
        tokens: Vec<Token>,
        std: Standard,
        types: &'a mut TypeTable,
        diags: &'a mut Diagnostics,
    ) -> Self {
        Parser {
            tokens,
            pos: 0,
            std,
            types,
            diags,
            typedef_scopes: vec![HashMap::new()],
            tag_scopes: vec![HashMap::new()],
            enum_scopes: vec![HashMap::new()],
            last_fn_params: Vec::new(),
        }
    }

    /// Seed file-scope typedefs from an earlier translation unit in the
    /// same session.
    pub fn import_typedefs(&mut self, names: impl IntoIterator<Item = (String, TypeId)>) {
        for (name, ty) in names {
            self.typedef_scopes[0].insert(name, Some(ty));
        }
    }

    /// Typedef names defined at file scope, exported to the session.
    pub fn export_typedefs(&self) -> Vec<(String, TypeId)> {
        self.typedef_scopes[0]
            .iter()
            .filter_map(|(name, ty)| ty.map(|t| (name.clone(), t)))
            .collect()
    }

    // ---- token plumbing --------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at_punct(&self, p: Punct) -> bool {
        self.peek().kind == TokenKind::Punct(p)
    }

    fn at_keyword(&self, kw: Keyword) -> bool {
        self.peek().kind == TokenKind::Keyword(kw)
    }

    fn eat_punct(&mut self, p: Punct) -> bool {
        if self.at_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: Punct, what: &str) -> PResult<Token> {
        if self.at_punct(p) {
            Ok(self.advance())
        } else {
            err(
                &self.peek().loc.clone(),
                format!(
                    "expected '{}' in {}, found '{}'",
                    punct_text(p),
                    what,
                    describe(self.peek())
                ),
            )
        }
    }

    fn loc(&self) -> SourceLoc {
        self.peek().loc.clone()
    }

    fn report(&mut self, e: ParseError) {
        self.diags.error_at(&e.loc, e.msg);
    }

    // ---- scopes ----------------------------------------------------------

    fn push_scope(&mut self) {
        self.typedef_scopes.push(HashMap::new());
        self.tag_scopes.push(HashMap::new());
        self.enum_scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.typedef_scopes.pop();
        self.tag_scopes.pop();
        self.enum_scopes.pop();
    }

    fn note_name(&mut self, name: &str, typedef: Option<TypeId>) {
        self.typedef_scopes
            .last_mut()
            .expect("typedef scope stack empty")
            .insert(name.to_string(), typedef);
    }

    fn lookup_typedef(&self, name: &str) -> Option<TypeId> {
        for scope in self.typedef_scopes.iter().rev() {
            if let Some(entry) = scope.get(name) {
                return *entry;
            }
        }
        None
    }

    fn is_typedef_name(&self, name: &str) -> bool {
        self.lookup_typedef(name).is_some()
    }

    fn lookup_tag(&self, name: &str) -> Option<TypeId> {
        for scope in self.tag_scopes.iter().rev() {
            if let Some(&id) = scope.get(name) {
                return Some(id);
            }
        }
        None
    }

    fn lookup_enum_const(&self, name: &str) -> Option<i64> {
        for scope in self.enum_scopes.iter().rev() {
            if let Some(&v) = scope.get(name) {
                return Some(v);
            }
        }
        None
    }

    // ---- entry -----------------------------------------------------------

    pub fn parse(&mut self) -> TranslationUnit {
        let mut decls = Vec::new();
        while !self.peek().is_eof() {
            let before = self.pos;
            match self.external_decl() {
                Ok(Some(decl)) => decls.push(decl),
                Ok(None) => {}
                Err(e) => {
                    self.report(e);
                    self.synchronize_toplevel();
                }
            }
            if self.pos == before {
                // Defensive: never loop without progress.
                self.advance();
            }
        }
        TranslationUnit { decls }
    }

    /// Skip to the start of the next plausible external declaration.
    fn synchronize_toplevel(&mut self) {
        let mut depth = 0usize;
        while !self.peek().is_eof() {
            match self.peek().kind {
                TokenKind::Punct(Punct::LBrace) => depth += 1,
                TokenKind::Punct(Punct::RBrace) => {
                    self.advance();
                    if depth <= 1 {
                        return;
                    }
                    depth -= 1;
                    continue;
                }
                TokenKind::Punct(Punct::Semi) if depth == 0 => {
                    self.advance();
                    return;
                }
                _ => {}
            }
            self.advance();
        }
    }

    /// Skip to the next statement boundary inside a block.
    fn synchronize_stmt(&mut self) {
        while !self.peek().is_eof() {
            match self.peek().kind {
                TokenKind::Punct(Punct::Semi) => {
                    self.advance();
                    return;
                }
                TokenKind::Punct(Punct::RBrace) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn external_decl(&mut self) -> PResult<Option<ExternalDecl>> {
        if self.at_keyword(Keyword::StaticAssert) {
            let sa = self.static_assert()?;
            return Ok(Some(ExternalDecl::StaticAssert(sa)));
        }
        // Stray semicolon.
        if self.eat_punct(Punct::Semi) {
            return Ok(None);
        }

        let mut enum_constants = Vec::new();
        let spec = self.decl_specifiers(&mut enum_constants)?;

        // Tag-only declaration: `struct S { ... };`
        if self.at_punct(Punct::Semi) {
            self.advance();
            return Ok(Some(ExternalDecl::Declaration(Declaration {
                loc: spec.loc,
                storage: spec.storage,
                is_inline: spec.is_inline,
                is_noreturn: spec.is_noreturn,
                items: Vec::new(),
                enum_constants,
            })));
        }

        let decl_loc = self.loc();
        let (name, ty) = self.declarator(spec.base)?;
        let name = match name {
            Some(n) => n,
            None => return err(&decl_loc, "declarator requires a name"),
        };

        if spec.implicit_int && !has_feature(self.std, Feature::ImplicitInt) {
            self.diags.error_at(
                &decl_loc,
                format!("type specifier missing for '{}'", name),
            );
        } else if spec.implicit_int {
            self.diags.warn(
                "implicit-int",
                &decl_loc,
                format!("type of '{}' defaults to int", name),
            );
        }

        // Function definition: function declarator directly followed by a
        // body.
        if self.types.is_function(ty) && self.at_punct(Punct::LBrace) {
            let params = std::mem::take(&mut self.last_fn_params);
            self.note_name(&name, None);
            self.push_scope();
            let param_names: Vec<String> =
                params.iter().filter_map(|p| p.name.clone()).collect();
            for pname in param_names {
                self.note_name(&pname, None);
            }
            let body = self.compound_stmt(false)?;
            self.pop_scope();
            return Ok(Some(ExternalDecl::Function(FunctionDef {
                name,
                loc: decl_loc,
                ty,
                params,
                storage: spec.storage,
                is_inline: spec.is_inline,
                is_noreturn: spec.is_noreturn,
                body,
                sym: None,
            })));
        }

        // Otherwise an init-declarator list.
        let mut items = Vec::new();
        let mut cur = (name, decl_loc, ty);
        loop {
            let init = if self.eat_punct(Punct::Eq) {
                Some(self.initializer()?)
            } else {
                None
            };
            let typedef = (spec.storage == StorageClass::Typedef).then_some(cur.2);
            self.note_name(&cur.0, typedef);
            items.push(InitDeclarator {
                name: cur.0,
                loc: cur.1,
                ty: cur.2,
                init,
                sym: None,
            });
            if !self.eat_punct(Punct::Comma) {
                break;
            }
            let loc = self.loc();
            let (name, ty) = self.declarator(spec.base)?;
            let name = match name {
                Some(n) => n,
                None => return err(&loc, "declarator requires a name"),
            };
            cur = (name, loc, ty);
        }
        self.expect_punct(Punct::Semi, "declaration")?;
        Ok(Some(ExternalDecl::Declaration(Declaration {
            loc: spec.loc,
            storage: spec.storage,
            is_inline: spec.is_inline,
            is_noreturn: spec.is_noreturn,
            items,
            enum_constants,
        })))
    }

    fn static_assert(&mut self) -> PResult<StaticAssert> {
        let loc = self.loc();
        self.advance(); // _Static_assert
        if !has_feature(self.std, Feature::StaticAssert) {
            self.diags.error_at(
                &loc,
                format!(
                    "_Static_assert requires C11 (current standard is {})",
                    self.std
                ),
            );
        }
        self.expect_punct(Punct::LParen, "_Static_assert")?;
        let cond = self.conditional_expr()?;
        let message = if self.eat_punct(Punct::Comma) {
            match &self.peek().kind {
                TokenKind::Str { bytes, .. } => {
                    let bytes = bytes.clone();
                    self.advance();
                    Some(bytes)
                }
                _ => {
                    return err(
                        &self.loc(),
                        "expected string literal in _Static_assert",
                    )
                }
            }
        } else {
            None
        };
        self.expect_punct(Punct::RParen, "_Static_assert")?;
        self.expect_punct(Punct::Semi, "_Static_assert")?;
        Ok(StaticAssert {
            cond,
            message,
            loc,
        })
    }

    // ---- declaration specifiers -----------------------------------------

    /// True when the current token can begin a declaration.
    fn at_declaration(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Keyword(kw) => matches!(
                kw,
                Keyword::Void
                    | Keyword::Char
                    | Keyword::Short
                    | Keyword::Int
                    | Keyword::Long
                    | Keyword::Float
                    | Keyword::Double
                    | Keyword::Signed
                    | Keyword::Unsigned
                    | Keyword::Bool
                    | Keyword::Struct
                    | Keyword::Union
                    | Keyword::Enum
                    | Keyword::Const
                    | Keyword::Volatile
                    | Keyword::Restrict
                    | Keyword::Atomic
                    | Keyword::Typedef
                    | Keyword::Extern
                    | Keyword::Static
                    | Keyword::Auto
                    | Keyword::Register
                    | Keyword::Inline
                    | Keyword::Noreturn
                    | Keyword::StaticAssert
            ),
            TokenKind::Ident => self.is_typedef_name(&self.peek().text),
            _ => false,
        }
    }

    fn decl_specifiers(&mut self, enum_out: &mut Vec<EnumConstantDef>) -> PResult<DeclSpec> {
        let loc = self.loc();
        let mut storage = StorageClass::None;
        let mut is_inline = false;
        let mut is_noreturn = false;
        let mut quals = Quals::none();

        #[derive(PartialEq, Clone, Copy)]
        enum Base {
            None,
            Void,
            Char,
            Int,
            Float,
            Double,
            Bool,
            Other(TypeId),
        }
        let mut base = Base::None;
        let mut n_long = 0u32;
        let mut has_short = false;
        let mut signedness: Option<bool> = None;

        macro_rules! set_base {
            ($value:expr, $loc:expr) => {{
                if base != Base::None {
                    self.diags
                        .error_at($loc, "two or more data types in declaration specifiers");
                }
                base = $value;
            }};
        }

        loop {
            let tok_loc = self.loc();
            match self.peek().kind.clone() {
                TokenKind::Keyword(kw) => match kw {
                    Keyword::Typedef => {
                        self.set_storage(&mut storage, StorageClass::Typedef, &tok_loc);
                        self.advance();
                    }
                    Keyword::Extern => {
                        self.set_storage(&mut storage, StorageClass::Extern, &tok_loc);
                        self.advance();
                    }
                    Keyword::Static => {
                        self.set_storage(&mut storage, StorageClass::Static, &tok_loc);
                        self.advance();
                    }
                    Keyword::Auto => {
                        self.set_storage(&mut storage, StorageClass::Auto, &tok_loc);
                        self.advance();
                    }
                    Keyword::Register => {
                        self.set_storage(&mut storage, StorageClass::Register, &tok_loc);
                        self.advance();
                    }
                    Keyword::Inline => {
                        is_inline = true;
                        self.advance();
                    }
                    Keyword::Noreturn => {
                        is_noreturn = true;
                        self.advance();
                    }
                    Keyword::Const => {
                        quals.is_const = true;
                        self.advance();
                    }
                    Keyword::Volatile => {
                        quals.is_volatile = true;
                        self.advance();
                    }
                    Keyword::Restrict => {
                        quals.is_restrict = true;
                        self.advance();
                    }
                    Keyword::Atomic => {
                        quals.is_atomic = true;
                        self.advance();
                    }
                    Keyword::Void => {
                        set_base!(Base::Void, &tok_loc);
                        self.advance();
                    }
                    Keyword::Char => {
                        set_base!(Base::Char, &tok_loc);
                        self.advance();
                    }
                    Keyword::Int => {
                        if base == Base::None {
                            base = Base::Int;
                        }
                        self.advance();
                    }
                    Keyword::Float => {
                        set_base!(Base::Float, &tok_loc);
                        self.advance();
                    }
                    Keyword::Double => {
                        set_base!(Base::Double, &tok_loc);
                        self.advance();
                    }
                    Keyword::Bool => {
                        set_base!(Base::Bool, &tok_loc);
                        self.advance();
                    }
                    Keyword::Short => {
                        has_short = true;
                        self.advance();
                    }
                    Keyword::Long => {
                        n_long += 1;
                        if n_long == 2 && !has_feature(self.std, Feature::LongLong) {
                            self.diags.warn(
                                "long-long",
                                &tok_loc,
                                "long long requires C99".to_string(),
                            );
                        }
                        self.advance();
                    }
                    Keyword::Signed => {
                        signedness = Some(true);
                        self.advance();
                    }
                    Keyword::Unsigned => {
                        signedness = Some(false);
                        self.advance();
                    }
                    Keyword::Struct | Keyword::Union => {
                        let id = self.record_specifier(kw == Keyword::Union)?;
                        set_base!(Base::Other(id), &tok_loc);
                    }
                    Keyword::Enum => {
                        let id = self.enum_specifier(enum_out)?;
                        set_base!(Base::Other(id), &tok_loc);
                    }
                    _ => break,
                },
                TokenKind::Ident => {
                    // A typedef name is a type specifier only when nothing
                    // else has established the base type.
                    let name = self.peek().text.clone();
                    if base == Base::None
                        && n_long == 0
                        && !has_short
                        && signedness.is_none()
                    {
                        if let Some(id) = self.lookup_typedef(&name) {
                            base = Base::Other(id);
                            self.advance();
                            continue;
                        }
                    }
                    break;
                }
                _ => break,
            }
        }

        let mut implicit_int = false;
        let ty = match base {
            Base::Void => self.types.void(),
            Base::Bool => self.types.bool_ty(),
            Base::Char => match signedness {
                Some(false) => self.types.unsigned_char(),
                _ => self.types.char_ty(),
            },
            Base::Float => self.types.float(),
            Base::Double => self.types.double(),
            Base::Other(id) => id,
            Base::Int | Base::None => {
                if base == Base::None && n_long == 0 && !has_short && signedness.is_none() {
                    implicit_int = true;
                }
                let signed = signedness.unwrap_or(true);
                if has_short {
                    if signed {
                        self.types.short()
                    } else {
                        self.types.unsigned_short()
                    }
                } else {
                    match (n_long, signed) {
                        (0, true) => self.types.int(),
                        (0, false) => self.types.unsigned_int(),
                        (1, true) => self.types.long(),
                        (1, false) => self.types.unsigned_long(),
                        (_, true) => self.types.long_long(),
                        (_, false) => self.types.unsigned_long_long(),
                    }
                }
            }
        };
        let ty = self.types.qualified(ty, quals);
        Ok(DeclSpec {
            base: ty,
            storage,
            is_inline,
            is_noreturn,
            implicit_int,
            loc,
        })
    }

    fn set_storage(&mut self, slot: &mut StorageClass, sc: StorageClass, loc: &SourceLoc) {
        if *slot != StorageClass::None {
            self.diags
                .error_at(loc, "multiple storage classes in declaration");
        }
        *slot = sc;
    }

    // ---- struct / union / enum ------------------------------------------

    fn record_specifier(&mut self, is_union: bool) -> PResult<TypeId> {
        let kw_loc = self.loc();
        self.advance(); // struct / union
        let kind = if is_union {
            RecordKind::Union
        } else {
            RecordKind::Struct
        };
        let tag = match self.peek().kind {
            TokenKind::Ident => {
                let name = self.peek().text.clone();
                self.advance();
                Some(name)
            }
            _ => None,
        };

        let has_body = self.at_punct(Punct::LBrace);
        let id = match &tag {
            Some(name) => {
                let in_current = self
                    .tag_scopes
                    .last()
                    .map(|s| s.contains_key(name))
                    .unwrap_or(false);
                match self.lookup_tag(name) {
                    Some(found) if !has_body || in_current => {
                        if has_body && self.types.is_complete(found) {
                            self.diags.error_at(
                                &kw_loc,
                                format!("redefinition of '{}'", self.types.display(found)),
                            );
                        }
                        found
                    }
                    _ => {
                        let id = self.types.new_record(kind, Some(name.clone()));
                        self.tag_scopes
                            .last_mut()
                            .expect("tag scope stack empty")
                            .insert(name.clone(), id);
                        id
                    }
                }
            }
            None => self.types.new_record(kind, None),
        };

        if !has_body {
            if tag.is_none() {
                return err(
                    &kw_loc,
                    format!(
                        "anonymous {} requires a body",
                        if is_union { "union" } else { "struct" }
                    ),
                );
            }
            return Ok(id);
        }

        self.advance(); // {
        let mut fields: Vec<Field> = Vec::new();
        while !self.at_punct(Punct::RBrace) && !self.peek().is_eof() {
            self.record_member(&mut fields)?;
        }
        self.expect_punct(Punct::RBrace, "struct body")?;

        // A flexible array member is legal only as the last field.
        let count = fields.len();
        for (i, f) in fields.iter().enumerate() {
            if self.types.is_array(f.ty) && self.types.array_len(f.ty).is_none() {
                if i + 1 != count {
                    self.diags.error_at(
                        &kw_loc,
                        format!("flexible array member '{}' must be the last field", f.name),
                    );
                } else if !has_feature(self.std, Feature::FlexibleArray) {
                    self.diags
                        .error_at(&kw_loc, "flexible array members require C99".to_string());
                }
            }
        }
        self.types.complete_record(id, fields);
        Ok(id)
    }

    fn record_member(&mut self, fields: &mut Vec<Field>) -> PResult<()> {
        if self.at_keyword(Keyword::StaticAssert) {
            // Member-position static assert: fold and move on.
            let sa = self.static_assert()?;
            let value = const_eval::eval(&sa.cond, self.types, None, self.diags);
            if value == Some(0) {
                let msg = sa
                    .message
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_else(|| "static assertion failed".into());
                self.diags
                    .error_at(&sa.loc, format!("static assertion failed: {}", msg));
            }
            return Ok(());
        }
        let mut enum_out = Vec::new();
        let spec = self.decl_specifiers(&mut enum_out)?;
        // Enumerators declared inside a record stay visible in the
        // enclosing scope (C has no member namespace for them).
        for c in &enum_out {
            self.enum_scopes
                .last_mut()
                .expect("enum scope stack empty")
                .insert(c.name.clone(), c.value);
        }
        // Anonymous struct/union member.
        if self.at_punct(Punct::Semi) && self.types.is_record(spec.base) {
            if !has_feature(self.std, Feature::AnonymousStruct) {
                self.diags.error_at(
                    &spec.loc,
                    "anonymous struct/union members require C11".to_string(),
                );
            }
            fields.push(Field::named("", spec.base));
            self.advance();
            return Ok(());
        }
        loop {
            if self.at_punct(Punct::Colon) {
                // Unnamed bit-field.
                self.advance();
                let width = self.const_int_expr("bit-field width")?;
                fields.push(Field {
                    name: String::new(),
                    ty: spec.base,
                    offset: 0,
                    bit_width: Some(width as u32),
                    bit_offset: 0,
                    promoted: false,
                });
            } else {
                let loc = self.loc();
                let (name, ty) = self.declarator(spec.base)?;
                let name = match name {
                    Some(n) => n,
                    None => return err(&loc, "expected member name"),
                };
                let bit_width = if self.eat_punct(Punct::Colon) {
                    let w = self.const_int_expr("bit-field width")?;
                    if !self.types.is_integer(ty) {
                        self.diags.error_at(&loc, "bit-field has non-integer type");
                    }
                    Some(w as u32)
                } else {
                    None
                };
                let incomplete_ok =
                    self.types.is_array(ty) && self.types.array_len(ty).is_none();
                if !self.types.is_complete(ty) && !incomplete_ok {
                    self.diags
                        .error_at(&loc, format!("field '{}' has incomplete type", name));
                }
                fields.push(Field {
                    name,
                    ty,
                    offset: 0,
                    bit_width,
                    bit_offset: 0,
                    promoted: false,
                });
            }
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        self.expect_punct(Punct::Semi, "struct member")?;
        Ok(())
    }

    fn enum_specifier(&mut self, enum_out: &mut Vec<EnumConstantDef>) -> PResult<TypeId> {
        let kw_loc = self.loc();
        self.advance(); // enum
        let tag = match self.peek().kind {
            TokenKind::Ident => {
                let name = self.peek().text.clone();
                self.advance();
                Some(name)
            }
            _ => None,
        };
        let has_body = self.at_punct(Punct::LBrace);
        let id = match &tag {
            Some(name) => {
                let in_current = self
                    .tag_scopes
                    .last()
                    .map(|s| s.contains_key(name))
                    .unwrap_or(false);
                match self.lookup_tag(name) {
                    Some(found) if !has_body || in_current => {
                        if has_body && self.types.is_complete(found) {
                            self.diags
                                .error_at(&kw_loc, format!("redefinition of 'enum {}'", name));
                        }
                        found
                    }
                    _ => {
                        let id = self.types.new_enum(Some(name.clone()));
                        self.tag_scopes
                            .last_mut()
                            .expect("tag scope stack empty")
                            .insert(name.clone(), id);
                        id
                    }
                }
            }
            None => self.types.new_enum(None),
        };
        if !has_body {
            if tag.is_none() {
                return err(&kw_loc, "anonymous enum requires a body");
            }
            return Ok(id);
        }
        self.advance(); // {
        let mut next_value: i64 = 0;
        while !self.at_punct(Punct::RBrace) && !self.peek().is_eof() {
            let loc = self.loc();
            let name = match self.peek().kind {
                TokenKind::Ident => self.advance().text,
                _ => return err(&loc, "expected enumerator name"),
            };
            if self.eat_punct(Punct::Eq) {
                next_value = self.const_int_expr("enumerator value")?;
            }
            self.enum_scopes
                .last_mut()
                .expect("enum scope stack empty")
                .insert(name.clone(), next_value);
            self.note_name(&name, None);
            enum_out.push(EnumConstantDef {
                name,
                value: next_value,
                loc,
                enum_ty: id,
            });
            next_value = next_value.wrapping_add(1);
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        self.expect_punct(Punct::RBrace, "enum body")?;
        self.types.complete_enum(id);
        Ok(id)
    }

    // ---- declarators -----------------------------------------------------

    fn declarator(&mut self, base: TypeId) -> PResult<(Option<String>, TypeId)> {
        let mut ty = base;
        while self.eat_punct(Punct::Star) {
            ty = self.types.pointer_to(ty);
            let mut quals = Quals::none();
            loop {
                if self.eat_keyword(Keyword::Const) {
                    quals.is_const = true;
                } else if self.eat_keyword(Keyword::Volatile) {
                    quals.is_volatile = true;
                } else if self.eat_keyword(Keyword::Restrict) {
                    quals.is_restrict = true;
                } else {
                    break;
                }
            }
            ty = self.types.qualified(ty, quals);
        }

        // Parenthesized declarator: `int (*fp)(void)`. A '(' opens a
        // nested declarator only when it cannot start a parameter list.
        if self.at_punct(Punct::LParen) && self.nested_declarator_ahead() {
            let open = self.pos;
            self.skip_balanced_parens()?;
            let ty = self.declarator_suffixes(ty)?;
            let end = self.pos;
            self.pos = open + 1;
            let inner = self.declarator(ty)?;
            self.expect_punct(Punct::RParen, "declarator")?;
            self.pos = end;
            return Ok(inner);
        }

        let name = match self.peek().kind {
            TokenKind::Ident => Some(self.advance().text),
            _ => None,
        };
        let ty = self.declarator_suffixes(ty)?;
        Ok((name, ty))
    }

    fn nested_declarator_ahead(&self) -> bool {
        match &self.peek_at(1).kind {
            TokenKind::Punct(Punct::Star) | TokenKind::Punct(Punct::LParen) => true,
            TokenKind::Ident => !self.is_typedef_name(&self.peek_at(1).text),
            _ => false,
        }
    }

    fn skip_balanced_parens(&mut self) -> PResult<()> {
        let loc = self.loc();
        let mut depth = 0usize;
        loop {
            if self.peek().is_eof() {
                return err(&loc, "unmatched '('");
            }
            match self.peek().kind {
                TokenKind::Punct(Punct::LParen) => depth += 1,
                TokenKind::Punct(Punct::RParen) => {
                    self.advance();
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                    continue;
                }
                _ => {}
            }
            self.advance();
        }
    }

    fn declarator_suffixes(&mut self, base: TypeId) -> PResult<TypeId> {
        if self.eat_punct(Punct::LBracket) {
            let loc = self.loc();
            let len = if self.at_punct(Punct::RBracket) {
                None
            } else {
                let expr = self.conditional_expr()?;
                match self.fold_const(&expr) {
                    Some(n) if n >= 0 => Some(n as u64),
                    Some(n) => {
                        self.diags
                            .error_at(&loc, format!("array size {} is negative", n));
                        Some(1)
                    }
                    None => {
                        if has_feature(self.std, Feature::Vla) {
                            self.diags
                                .error_at(&loc, "variable length arrays are not supported");
                        } else {
                            self.diags
                                .error_at(&loc, "array size must be a constant expression");
                        }
                        Some(1)
                    }
                }
            };
            self.expect_punct(Punct::RBracket, "array declarator")?;
            let inner = self.declarator_suffixes(base)?;
            return Ok(self.types.array_of(inner, len));
        }
        if self.eat_punct(Punct::LParen) {
            let (params, param_types, variadic, old_style) = self.parameter_list()?;
            let inner = self.declarator_suffixes(base)?;
            let ty = self.types.function(inner, param_types, variadic, old_style);
            self.last_fn_params = params;
            return Ok(ty);
        }
        Ok(base)
    }

    #[allow(clippy::type_complexity)]
    fn parameter_list(&mut self) -> PResult<(Vec<ParamDecl>, Vec<TypeId>, bool, bool)> {
        // `()` is an old-style unchecked declaration.
        if self.eat_punct(Punct::RParen) {
            return Ok((Vec::new(), Vec::new(), false, true));
        }
        // `(void)` declares zero parameters.
        if self.at_keyword(Keyword::Void) && self.peek_at(1).kind == TokenKind::Punct(Punct::RParen)
        {
            self.advance();
            self.advance();
            return Ok((Vec::new(), Vec::new(), false, false));
        }
        let mut params = Vec::new();
        let mut param_types = Vec::new();
        let mut variadic = false;
        loop {
            if self.eat_punct(Punct::Ellipsis) {
                variadic = true;
                break;
            }
            let loc = self.loc();
            if !self.at_declaration() {
                return err(
                    &loc,
                    format!(
                        "expected parameter declaration, found '{}'",
                        describe(self.peek())
                    ),
                );
            }
            let mut enum_out = Vec::new();
            let spec = self.decl_specifiers(&mut enum_out)?;
            let (name, ty) = self.declarator(spec.base)?;
            // Parameters decay: arrays to pointers, functions to pointers.
            let ty = if self.types.is_array(ty) || self.types.is_function(ty) {
                self.types.decay(ty)
            } else {
                ty
            };
            param_types.push(ty);
            params.push(ParamDecl {
                name,
                ty,
                loc,
                sym: None,
            });
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        self.expect_punct(Punct::RParen, "parameter list")?;
        Ok((params, param_types, variadic, false))
    }

    /// Parse a type-name (casts, sizeof): specifiers plus an abstract
    /// declarator.
    fn type_name(&mut self) -> PResult<TypeId> {
        let mut enum_out = Vec::new();
        let spec = self.decl_specifiers(&mut enum_out)?;
        let loc = self.loc();
        let (name, ty) = self.declarator(spec.base)?;
        if let Some(name) = name {
            return err(&loc, format!("unexpected identifier '{}' in type name", name));
        }
        Ok(ty)
    }

    fn fold_const(&mut self, expr: &Expr) -> Option<i64> {
        // The parser's enum scopes substitute for the symbol table here;
        // diagnostics from failed folds surface through the caller.
        let types: &TypeTable = self.types;
        let mut scratch = Diagnostics::new(false, false, false);
        eval_with_enums(
            expr,
            types,
            &|n| {
                for scope in self.enum_scopes.iter().rev() {
                    if let Some(&v) = scope.get(n) {
                        return Some(v);
                    }
                }
                None
            },
            &mut scratch,
        )
    }

    fn const_int_expr(&mut self, what: &str) -> PResult<i64> {
        let loc = self.loc();
        let expr = self.conditional_expr()?;
        match self.fold_const(&expr) {
            Some(v) => Ok(v),
            None => err(&loc, format!("{} must be a constant expression", what)),
        }
    }

    // ---- statements ------------------------------------------------------

    fn compound_stmt(&mut self, scoped: bool) -> PResult<Stmt> {
        let loc = self.loc();
        self.expect_punct(Punct::LBrace, "compound statement")?;
        if scoped {
            self.push_scope();
        }
        let mut items = Vec::new();
        while !self.at_punct(Punct::RBrace) && !self.peek().is_eof() {
            if self.at_keyword(Keyword::StaticAssert) {
                match self.static_assert() {
                    Ok(sa) => items.push(BlockItem::StaticAssert(sa)),
                    Err(e) => {
                        self.report(e);
                        self.synchronize_stmt();
                    }
                }
                continue;
            }
            if self.at_declaration() {
                match self.block_declaration() {
                    Ok(decl) => items.push(BlockItem::Decl(decl)),
                    Err(e) => {
                        self.report(e);
                        self.synchronize_stmt();
                    }
                }
                continue;
            }
            match self.statement() {
                Ok(stmt) => items.push(BlockItem::Stmt(stmt)),
                Err(e) => {
                    self.report(e);
                    self.synchronize_stmt();
                }
            }
        }
        if scoped {
            self.pop_scope();
        }
        self.expect_punct(Punct::RBrace, "compound statement")?;
        Ok(Stmt {
            kind: StmtKind::Compound(items),
            loc,
        })
    }

    fn block_declaration(&mut self) -> PResult<Declaration> {
        let mut enum_constants = Vec::new();
        let spec = self.decl_specifiers(&mut enum_constants)?;
        let mut items = Vec::new();
        if !self.at_punct(Punct::Semi) {
            loop {
                let loc = self.loc();
                let (name, ty) = self.declarator(spec.base)?;
                let name = match name {
                    Some(n) => n,
                    None => return err(&loc, "declarator requires a name"),
                };
                let init = if self.eat_punct(Punct::Eq) {
                    Some(self.initializer()?)
                } else {
                    None
                };
                let typedef = (spec.storage == StorageClass::Typedef).then_some(ty);
                self.note_name(&name, typedef);
                items.push(InitDeclarator {
                    name,
                    loc,
                    ty,
                    init,
                    sym: None,
                });
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect_punct(Punct::Semi, "declaration")?;
        Ok(Declaration {
            loc: spec.loc,
            storage: spec.storage,
            is_inline: spec.is_inline,
            is_noreturn: spec.is_noreturn,
            items,
            enum_constants,
        })
    }

    fn initializer(&mut self) -> PResult<Initializer> {
        if self.at_punct(Punct::LBrace) {
            let loc = self.loc();
            self.advance();
            let mut items = Vec::new();
            while !self.at_punct(Punct::RBrace) && !self.peek().is_eof() {
                if self.at_punct(Punct::Dot) || self.at_punct(Punct::LBracket) {
                    return err(&self.loc(), "designated initializers are not supported");
                }
                items.push(self.initializer()?);
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
            self.expect_punct(Punct::RBrace, "initializer list")?;
            return Ok(Initializer::List { items, loc });
        }
        Ok(Initializer::Expr(self.assignment_expr()?))
    }

    fn statement(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        // Label: identifier ':'
        if self.peek().kind == TokenKind::Ident
            && self.peek_at(1).kind == TokenKind::Punct(Punct::Colon)
        {
            let name = self.advance().text;
            self.advance(); // :
            let body = self.statement()?;
            return Ok(Stmt {
                kind: StmtKind::Label {
                    name,
                    body: Box::new(body),
                    sym: None,
                },
                loc,
            });
        }
        match self.peek().kind.clone() {
            TokenKind::Punct(Punct::LBrace) => self.compound_stmt(true),
            TokenKind::Punct(Punct::Semi) => {
                self.advance();
                Ok(Stmt {
                    kind: StmtKind::Null,
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::If) => {
                self.advance();
                self.expect_punct(Punct::LParen, "if")?;
                let cond = self.expression()?;
                self.expect_punct(Punct::RParen, "if")?;
                let then_branch = Box::new(self.statement()?);
                let else_branch = if self.eat_keyword(Keyword::Else) {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                Ok(Stmt {
                    kind: StmtKind::If {
                        cond,
                        then_branch,
                        else_branch,
                    },
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::While) => {
                self.advance();
                self.expect_punct(Punct::LParen, "while")?;
                let cond = self.expression()?;
                self.expect_punct(Punct::RParen, "while")?;
                let body = Box::new(self.statement()?);
                Ok(Stmt {
                    kind: StmtKind::While { cond, body },
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::Do) => {
                self.advance();
                let body = Box::new(self.statement()?);
                if !self.eat_keyword(Keyword::While) {
                    return err(&self.loc(), "expected 'while' after do body");
                }
                self.expect_punct(Punct::LParen, "do-while")?;
                let cond = self.expression()?;
                self.expect_punct(Punct::RParen, "do-while")?;
                self.expect_punct(Punct::Semi, "do-while")?;
                Ok(Stmt {
                    kind: StmtKind::DoWhile { body, cond },
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::For) => {
                self.advance();
                self.expect_punct(Punct::LParen, "for")?;
                self.push_scope();
                let init = if self.eat_punct(Punct::Semi) {
                    None
                } else if self.at_declaration() {
                    if !has_feature(self.std, Feature::ForDecl) {
                        self.diags.warn(
                            "for-declaration",
                            &loc,
                            "declaration in for-init requires C99".to_string(),
                        );
                    }
                    Some(Box::new(ForInit::Decl(self.block_declaration()?)))
                } else {
                    let e = self.expression()?;
                    self.expect_punct(Punct::Semi, "for")?;
                    Some(Box::new(ForInit::Expr(e)))
                };
                let cond = if self.at_punct(Punct::Semi) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect_punct(Punct::Semi, "for")?;
                let step = if self.at_punct(Punct::RParen) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect_punct(Punct::RParen, "for")?;
                let body = Box::new(self.statement()?);
                self.pop_scope();
                Ok(Stmt {
                    kind: StmtKind::For {
                        init,
                        cond,
                        step,
                        body,
                    },
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::Switch) => {
                self.advance();
                self.expect_punct(Punct::LParen, "switch")?;
                let cond = self.expression()?;
                self.expect_punct(Punct::RParen, "switch")?;
                let body = Box::new(self.statement()?);
                Ok(Stmt {
                    kind: StmtKind::Switch {
                        cond,
                        body,
                        cases: Vec::new(),
                        has_default: false,
                    },
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::Case) => {
                self.advance();
                let value_expr = self.conditional_expr()?;
                self.expect_punct(Punct::Colon, "case label")?;
                let body = Box::new(self.statement()?);
                Ok(Stmt {
                    kind: StmtKind::Case {
                        value_expr,
                        value: 0,
                        body,
                    },
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::Default) => {
                self.advance();
                self.expect_punct(Punct::Colon, "default label")?;
                let body = Box::new(self.statement()?);
                Ok(Stmt {
                    kind: StmtKind::Default(body),
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                self.expect_punct(Punct::Semi, "break")?;
                Ok(Stmt {
                    kind: StmtKind::Break,
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                self.expect_punct(Punct::Semi, "continue")?;
                Ok(Stmt {
                    kind: StmtKind::Continue,
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                let value = if self.at_punct(Punct::Semi) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect_punct(Punct::Semi, "return")?;
                Ok(Stmt {
                    kind: StmtKind::Return(value),
                    loc,
                })
            }
            TokenKind::Keyword(Keyword::Goto) => {
                self.advance();
                let label = match self.peek().kind {
                    TokenKind::Ident => self.advance().text,
                    _ => return err(&self.loc(), "expected label after goto"),
                };
                self.expect_punct(Punct::Semi, "goto")?;
                Ok(Stmt {
                    kind: StmtKind::Goto { label, sym: None },
                    loc,
                })
            }
            _ => {
                let expr = self.expression()?;
                self.expect_punct(Punct::Semi, "expression statement")?;
                Ok(Stmt {
                    kind: StmtKind::Expr(expr),
                    loc,
                })
            }
        }
    }

    // ---- expressions -----------------------------------------------------

    pub fn expression(&mut self) -> PResult<Expr> {
        let mut lhs = self.assignment_expr()?;
        while self.at_punct(Punct::Comma) {
            let loc = self.loc();
            self.advance();
            let rhs = self.assignment_expr()?;
            lhs = Expr::new(
                ExprKind::Comma {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                loc,
            );
        }
        Ok(lhs)
    }

    fn assignment_expr(&mut self) -> PResult<Expr> {
        let lhs = self.conditional_expr()?;
        let op = match self.peek().kind {
            TokenKind::Punct(Punct::Eq) => Some(None),
            TokenKind::Punct(Punct::PlusEq) => Some(Some(BinaryOp::Add)),
            TokenKind::Punct(Punct::MinusEq) => Some(Some(BinaryOp::Sub)),
            TokenKind::Punct(Punct::StarEq) => Some(Some(BinaryOp::Mul)),
            TokenKind::Punct(Punct::SlashEq) => Some(Some(BinaryOp::Div)),
            TokenKind::Punct(Punct::PercentEq) => Some(Some(BinaryOp::Mod)),
            TokenKind::Punct(Punct::ShlEq) => Some(Some(BinaryOp::Shl)),
            TokenKind::Punct(Punct::ShrEq) => Some(Some(BinaryOp::Shr)),
            TokenKind::Punct(Punct::AmpEq) => Some(Some(BinaryOp::BitAnd)),
            TokenKind::Punct(Punct::CaretEq) => Some(Some(BinaryOp::BitXor)),
            TokenKind::Punct(Punct::PipeEq) => Some(Some(BinaryOp::BitOr)),
            _ => None,
        };
        if let Some(op) = op {
            let loc = self.loc();
            self.advance();
            let rhs = self.assignment_expr()?;
            return Ok(Expr::new(
                ExprKind::Assign {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                loc,
            ));
        }
        Ok(lhs)
    }

    fn conditional_expr(&mut self) -> PResult<Expr> {
        let cond = self.binary_expr(0)?;
        if self.at_punct(Punct::Question) {
            let loc = self.loc();
            self.advance();
            let then_expr = self.expression()?;
            self.expect_punct(Punct::Colon, "conditional expression")?;
            let else_expr = self.conditional_expr()?;
            return Ok(Expr::new(
                ExprKind::Ternary {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
                loc,
            ));
        }
        Ok(cond)
    }

    fn binary_op_of(&self) -> Option<(u8, BinaryOp)> {
        let p = match &self.peek().kind {
            TokenKind::Punct(p) => *p,
            _ => return None,
        };
        Some(match p {
            Punct::PipePipe => (1, BinaryOp::LogOr),
            Punct::AmpAmp => (2, BinaryOp::LogAnd),
            Punct::Pipe => (3, BinaryOp::BitOr),
            Punct::Caret => (4, BinaryOp::BitXor),
            Punct::Amp => (5, BinaryOp::BitAnd),
            Punct::EqEq => (6, BinaryOp::Eq),
            Punct::Ne => (6, BinaryOp::Ne),
            Punct::Lt => (7, BinaryOp::Lt),
            Punct::Gt => (7, BinaryOp::Gt),
            Punct::Le => (7, BinaryOp::Le),
            Punct::Ge => (7, BinaryOp::Ge),
            Punct::Shl => (8, BinaryOp::Shl),
            Punct::Shr => (8, BinaryOp::Shr),
            Punct::Plus => (9, BinaryOp::Add),
            Punct::Minus => (9, BinaryOp::Sub),
            Punct::Star => (10, BinaryOp::Mul),
            Punct::Slash => (10, BinaryOp::Div),
            Punct::Percent => (10, BinaryOp::Mod),
            _ => return None,
        })
    }

    fn binary_expr(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.cast_expr()?;
        while let Some((prec, op)) = self.binary_op_of() {
            if prec < min_prec {
                break;
            }
            let loc = self.loc();
            self.advance();
            let rhs = self.binary_expr(prec + 1)?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                loc,
            );
        }
        Ok(lhs)
    }

    fn cast_expr(&mut self) -> PResult<Expr> {
        if self.at_punct(Punct::LParen) {
            let save = self.pos;
            self.pos += 1;
            let is_type = self.at_declaration();
            self.pos = save;
            if is_type {
                let loc = self.loc();
                self.advance(); // (
                let to = self.type_name()?;
                self.expect_punct(Punct::RParen, "cast")?;
                let operand = self.cast_expr()?;
                return Ok(Expr::new(
                    ExprKind::Cast {
                        to,
                        operand: Box::new(operand),
                    },
                    loc,
                ));
            }
        }
        self.unary_expr()
    }

    fn unary_expr(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let op = match self.peek().kind {
            TokenKind::Punct(Punct::PlusPlus) => Some(UnaryOp::PreInc),
            TokenKind::Punct(Punct::MinusMinus) => Some(UnaryOp::PreDec),
            TokenKind::Punct(Punct::Amp) => Some(UnaryOp::AddrOf),
            TokenKind::Punct(Punct::Star) => Some(UnaryOp::Deref),
            TokenKind::Punct(Punct::Plus) => Some(UnaryOp::Plus),
            TokenKind::Punct(Punct::Minus) => Some(UnaryOp::Neg),
            TokenKind::Punct(Punct::Tilde) => Some(UnaryOp::BitNot),
            TokenKind::Punct(Punct::Bang) => Some(UnaryOp::LogNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.cast_expr()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                loc,
            ));
        }
        if self.at_keyword(Keyword::Sizeof) {
            self.advance();
            if self.at_punct(Punct::LParen) {
                let save = self.pos;
                self.pos += 1;
                if self.at_declaration() {
                    let ty = self.type_name()?;
                    self.expect_punct(Punct::RParen, "sizeof")?;
                    return Ok(Expr::new(ExprKind::SizeofType(ty), loc));
                }
                self.pos = save;
            }
            let operand = self.unary_expr()?;
            return Ok(Expr::new(ExprKind::SizeofExpr(Box::new(operand)), loc));
        }
        self.postfix_expr()
    }

    fn postfix_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.primary_expr()?;
        loop {
            let loc = self.loc();
            match self.peek().kind {
                TokenKind::Punct(Punct::LParen) => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.at_punct(Punct::RParen) {
                        loop {
                            args.push(self.assignment_expr()?);
                            if !self.eat_punct(Punct::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect_punct(Punct::RParen, "call")?;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        loc,
                    );
                }
                TokenKind::Punct(Punct::LBracket) => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect_punct(Punct::RBracket, "subscript")?;
                    expr = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        loc,
                    );
                }
                TokenKind::Punct(Punct::Dot) | TokenKind::Punct(Punct::Arrow) => {
                    let arrow = self.at_punct(Punct::Arrow);
                    self.advance();
                    let member = match self.peek().kind {
                        TokenKind::Ident => self.advance().text,
                        _ => {
                            return err(
                                &self.loc(),
                                format!(
                                    "expected member name after '{}'",
                                    if arrow { "->" } else { "." }
                                ),
                            )
                        }
                    };
                    expr = Expr::new(
                        ExprKind::Member {
                            base: Box::new(expr),
                            member,
                            arrow,
                            field_index: None,
                        },
                        loc,
                    );
                }
                TokenKind::Punct(Punct::PlusPlus) => {
                    self.advance();
                    expr = Expr::new(
                        ExprKind::Unary {
                            op: UnaryOp::PostInc,
                            operand: Box::new(expr),
                        },
                        loc,
                    );
                }
                TokenKind::Punct(Punct::MinusMinus) => {
                    self.advance();
                    expr = Expr::new(
                        ExprKind::Unary {
                            op: UnaryOp::PostDec,
                            operand: Box::new(expr),
                        },
                        loc,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary_expr(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        match self.peek().kind.clone() {
            TokenKind::Int {
                value,
                suffix,
                decimal,
            } => {
                self.advance();
                Ok(Expr::new(
                    ExprKind::IntLit {
                        value,
                        suffix,
                        decimal,
                    },
                    loc,
                ))
            }
            TokenKind::Float { value, is_f32 } => {
                self.advance();
                Ok(Expr::new(ExprKind::FloatLit { value, is_f32 }, loc))
            }
            TokenKind::Char { value, .. } => {
                self.advance();
                Ok(Expr::new(ExprKind::CharLit(value), loc))
            }
            TokenKind::Str { bytes, .. } => {
                self.advance();
                // Adjacent string literals concatenate.
                let mut all = bytes;
                loop {
                    let more = match &self.peek().kind {
                        TokenKind::Str { bytes, .. } => Some(bytes.clone()),
                        _ => None,
                    };
                    match more {
                        Some(bytes) => {
                            all.extend_from_slice(&bytes);
                            self.advance();
                        }
                        None => break,
                    }
                }
                Ok(Expr::new(ExprKind::StrLit(all), loc))
            }
            TokenKind::Ident => {
                let name = self.advance().text;
                Ok(Expr::new(ExprKind::Ident { name, sym: None }, loc))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(int_expr(1, loc))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(int_expr(0, loc))
            }
            TokenKind::Keyword(Keyword::Nullptr) => {
                self.advance();
                Ok(int_expr(0, loc))
            }
            TokenKind::Punct(Punct::LParen) => {
                self.advance();
                let expr = self.expression()?;
                self.expect_punct(Punct::RParen, "parenthesized expression")?;
                Ok(expr)
            }
            _ => err(
                &loc,
                format!("unexpected token '{}' in expression", describe(self.peek())),
            ),
        }
    }
}

fn int_expr(value: u64, loc: SourceLoc) -> Expr {
    Expr::new(
        ExprKind::IntLit {
            value,
            suffix: Default::default(),
            decimal: true,
        },
        loc,
    )
}

/// Evaluate with a parser-local enum environment instead of the symbol
/// table.
fn eval_with_enums(
    expr: &Expr,
    types: &TypeTable,
    enums: &dyn Fn(&str) -> Option<i64>,
    diags: &mut Diagnostics,
) -> Option<i64> {
    match &expr.kind {
        ExprKind::Ident { name, .. } => enums(name),
        ExprKind::Unary { op, operand } => {
            let v = eval_with_enums(operand, types, enums, diags)?;
            match op {
                UnaryOp::Plus => Some(v),
                UnaryOp::Neg => Some(v.wrapping_neg()),
                UnaryOp::LogNot => Some((v == 0) as i64),
                UnaryOp::BitNot => Some(!v),
                _ => None,
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let l = eval_with_enums(lhs, types, enums, diags)?;
            let r = eval_with_enums(rhs, types, enums, diags)?;
            fold_binary(*op, l, r)
        }
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            let c = eval_with_enums(cond, types, enums, diags)?;
            if c != 0 {
                eval_with_enums(then_expr, types, enums, diags)
            } else {
                eval_with_enums(else_expr, types, enums, diags)
            }
        }
        ExprKind::Cast { operand, .. } => eval_with_enums(operand, types, enums, diags),
        _ => const_eval::eval(expr, types, None, diags),
    }
}

fn fold_binary(op: BinaryOp, l: i64, r: i64) -> Option<i64> {
    Some(match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::Div => {
            if r == 0 {
                return None;
            }
            l.wrapping_div(r)
        }
        BinaryOp::Mod => {
            if r == 0 {
                return None;
            }
            l.wrapping_rem(r)
        }
        BinaryOp::Shl => l.wrapping_shl(r as u32),
        BinaryOp::Shr => l.wrapping_shr(r as u32),
        BinaryOp::Lt => (l < r) as i64,
        BinaryOp::Gt => (l > r) as i64,
        BinaryOp::Le => (l <= r) as i64,
        BinaryOp::Ge => (l >= r) as i64,
        BinaryOp::Eq => (l == r) as i64,
        BinaryOp::Ne => (l != r) as i64,
        BinaryOp::BitAnd => l & r,
        BinaryOp::BitXor => l ^ r,
        BinaryOp::BitOr => l | r,
        BinaryOp::LogAnd => ((l != 0) && (r != 0)) as i64,
        BinaryOp::LogOr => ((l != 0) || (r != 0)) as i64,
    })
}

fn describe(tok: &Token) -> String {
    if tok.is_eof() {
        "end of file".to_string()
    } else {
        tok.text.clone()
    }
}

fn punct_text(p: Punct) -> &'static str {
    match p {
        Punct::LParen => "(",
        Punct::RParen => ")",
        Punct::LBracket => "[",
        Punct::RBracket => "]",
        Punct::LBrace => "{",
        Punct::RBrace => "}",
        Punct::Semi => ";",
        Punct::Comma => ",",
        Punct::Colon => ":",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::types::{TargetLayout, TypeKind};

    fn parse(src: &str) -> (TranslationUnit, TypeTable, Diagnostics) {
        parse_std(src, Standard::C99)
    }

    fn parse_std(src: &str, std: Standard) -> (TranslationUnit, TypeTable, Diagnostics) {
        let mut diags = Diagnostics::new(false, false, false);
        let mut types = TypeTable::new(TargetLayout::lp64());
        let tokens = Lexer::new("t.c", src, std).run(&mut diags);
        let unit = Parser::new(tokens, std, &mut types, &mut diags).parse();
        (unit, types, diags)
    }

    #[test]
    fn test_parse_hello_world() {
        let (unit, _, diags) = parse("int main(void) { return 0; }");
        assert!(!diags.has_errors(), "{}", diags.render());
        assert_eq!(unit.decls.len(), 1);
        match &unit.decls[0] {
            ExternalDecl::Function(f) => {
                assert_eq!(f.name, "main");
                assert!(matches!(f.body.kind, StmtKind::Compound(_)));
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_declarators() {
        let (unit, types, diags) = parse("int *p; int a[4]; int (*fp)(int, char);");
        assert!(!diags.has_errors(), "{}", diags.render());
        let tys: Vec<String> = unit
            .decls
            .iter()
            .filter_map(|d| match d {
                ExternalDecl::Declaration(d) => Some(types.display(d.items[0].ty)),
                _ => None,
            })
            .collect();
        assert_eq!(tys, vec!["int *", "int[4]", "int (int, char) *"]);
    }

    #[test]
    fn test_parse_struct_with_self_pointer() {
        let (unit, types, diags) =
            parse("struct node { int value; struct node *next; }; struct node n;");
        assert!(!diags.has_errors(), "{}", diags.render());
        match &unit.decls[1] {
            ExternalDecl::Declaration(d) => {
                let ty = d.items[0].ty;
                assert!(types.is_record(ty));
                assert!(types.is_complete(ty));
                let (_, next) = types.find_field(ty, "next").unwrap();
                assert_eq!(types.pointee(next.ty), Some(types.unqualified(ty)));
            }
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_enum_values() {
        let (unit, _, diags) = parse("enum color { RED, GREEN = 5, BLUE };");
        assert!(!diags.has_errors());
        match &unit.decls[0] {
            ExternalDecl::Declaration(d) => {
                let values: Vec<(String, i64)> = d
                    .enum_constants
                    .iter()
                    .map(|c| (c.name.clone(), c.value))
                    .collect();
                assert_eq!(
                    values,
                    vec![
                        ("RED".to_string(), 0),
                        ("GREEN".to_string(), 5),
                        ("BLUE".to_string(), 6)
                    ]
                );
            }
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_enum_constant_in_array_size() {
        let (unit, types, diags) = parse("enum { N = 3 }; int a[N];");
        assert!(!diags.has_errors(), "{}", diags.render());
        match &unit.decls[1] {
            ExternalDecl::Declaration(d) => {
                assert_eq!(types.array_len(d.items[0].ty), Some(3));
            }
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_typedef_disambiguation() {
        let (unit, types, diags) = parse("typedef int myint; myint x; myint *y;");
        assert!(!diags.has_errors(), "{}", diags.render());
        match &unit.decls[1] {
            ExternalDecl::Declaration(d) => {
                assert_eq!(d.items[0].name, "x");
                assert_eq!(d.items[0].ty, types.int());
            }
            other => panic!("expected declaration, got {:?}", other),
        }
        match &unit.decls[2] {
            ExternalDecl::Declaration(d) => {
                assert_eq!(types.pointee(d.items[0].ty), Some(types.int()));
            }
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_expression_precedence() {
        let (unit, _, diags) = parse("int x = 2 + 3 * 4;");
        assert!(!diags.has_errors());
        match &unit.decls[0] {
            ExternalDecl::Declaration(d) => match &d.items[0].init {
                Some(Initializer::Expr(e)) => match &e.kind {
                    ExprKind::Binary { op, rhs, .. } => {
                        assert_eq!(*op, BinaryOp::Add);
                        assert!(matches!(
                            rhs.kind,
                            ExprKind::Binary {
                                op: BinaryOp::Mul,
                                ..
                            }
                        ));
                    }
                    other => panic!("expected binary, got {:?}", other),
                },
                other => panic!("expected expr initializer, got {:?}", other),
            },
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_cast_vs_paren_expr() {
        let (unit, _, diags) = parse("int f(int y) { int x = (int)y; return (y) + 1; }");
        assert!(!diags.has_errors(), "{}", diags.render());
        let _ = unit;
    }

    #[test]
    fn test_sizeof_forms() {
        let (unit, _, diags) = parse("int a = sizeof(int); int f(int b) { return sizeof b; }");
        assert!(!diags.has_errors(), "{}", diags.render());
        match &unit.decls[0] {
            ExternalDecl::Declaration(d) => {
                assert!(matches!(
                    d.items[0].init,
                    Some(Initializer::Expr(Expr {
                        kind: ExprKind::SizeofType(_),
                        ..
                    }))
                ));
            }
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_statements_roundtrip() {
        let src = r#"
int f(int n) {
    int total = 0;
    int i;
    for (i = 0; i < n; i++) {
        if (i % 2 == 0)
            total += i;
        else
            continue;
        while (total > 100) { total /= 2; break; }
    }
    switch (n) {
    case 0: return 0;
    case 1: total++; break;
    default: break;
    }
    do { total--; } while (total > 50);
    goto done;
done:
    return total;
}
"#;
        let (unit, _, diags) = parse(src);
        assert!(!diags.has_errors(), "{}", diags.render());
        assert_eq!(unit.decls.len(), 1);
    }

    #[test]
    fn test_missing_semicolon_recovers() {
        let (unit, _, diags) = parse("int a = 1\nint b = 2;");
        assert!(diags.has_errors());
        // Parsing continued after the recovery point.
        let _ = unit;
    }

    #[test]
    fn test_string_concatenation() {
        let (unit, _, diags) = parse(r#"char *s = "ab" "cd";"#);
        assert!(!diags.has_errors());
        match &unit.decls[0] {
            ExternalDecl::Declaration(d) => match &d.items[0].init {
                Some(Initializer::Expr(Expr {
                    kind: ExprKind::StrLit(bytes),
                    ..
                })) => assert_eq!(bytes, b"abcd"),
                other => panic!("expected string literal, got {:?}", other),
            },
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_old_style_function_decl() {
        let (unit, types, diags) = parse("int f();");
        assert!(!diags.has_errors());
        match &unit.decls[0] {
            ExternalDecl::Declaration(d) => match types.kind(d.items[0].ty) {
                TypeKind::Func { old_style, .. } => assert!(old_style),
                other => panic!("expected function type, got {:?}", other),
            },
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_variadic_function_decl() {
        let (unit, types, diags) = parse("int printf(const char *fmt, ...);");
        assert!(!diags.has_errors());
        match &unit.decls[0] {
            ExternalDecl::Declaration(d) => match types.kind(d.items[0].ty) {
                TypeKind::Func {
                    variadic, params, ..
                } => {
                    assert!(variadic);
                    assert_eq!(params.len(), 1);
                }
                other => panic!("expected function type, got {:?}", other),
            },
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_static_assert_parsing() {
        let (unit, _, diags) = parse_std("_Static_assert(1 == 1, \"ok\");", Standard::C11);
        assert!(!diags.has_errors(), "{}", diags.render());
        assert!(matches!(unit.decls[0], ExternalDecl::StaticAssert(_)));
        // Pre-C11 it is recognized but reported.
        let (_, _, diags) = parse_std("_Static_assert(1, \"x\");", Standard::C99);
        assert!(diags.contains("requires C11"));
    }

    #[test]
    fn test_for_decl_ungated_in_gnu89() {
        let (_, _, diags) = parse_std(
            "int f(void) { for (int i = 0; i < 3; i++) {} return 0; }",
            Standard::Gnu89,
        );
        assert_eq!(diags.warning_count(), 0, "{}", diags.render());
    }

    #[test]
    fn test_flexible_array_member() {
        let (_, _, diags) = parse("struct buf { int len; char data[]; };");
        assert!(!diags.has_errors(), "{}", diags.render());
        // Not last: error.
        let (_, _, diags) = parse("struct bad { char data[]; int len; };");
        assert!(diags.contains("must be the last field"));
    }

    #[test]
    fn test_function_definition_params_captured() {
        let (unit, _, diags) = parse("int add(int a, int b) { return a + b; }");
        assert!(!diags.has_errors(), "{}", diags.render());
        match &unit.decls[0] {
            ExternalDecl::Function(f) => {
                let names: Vec<_> = f.params.iter().map(|p| p.name.clone()).collect();
                assert_eq!(names, vec![Some("a".into()), Some("b".into())]);
            }
            other => panic!("expected function, got {:?}", other),
        }
    }
}
