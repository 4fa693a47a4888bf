//! Semantic analyzer
//!
//! One walk over the AST: every declaration is entered in the symbol
//! table, every expression gets its type, implicit conversions become
//! explicit `ImplicitCast` nodes, and assignability, call arity, loop and
//! switch placement, label resolution, and standard gating are checked.
//!
//! Errors are recorded in the sink and the walk continues with sibling
//! nodes, so one pass can surface several diagnostics. Expressions that
//! fail to type default to `int` to keep downstream checks quiet.

use crate::ast::*;
use crate::const_eval;
use crate::diag::{Diagnostics, SourceLoc};
use crate::standard::{has_feature, Feature, Standard};
use crate::symbols::{ScopeKind, StorageClass, SymbolKind, SymbolTable};
use crate::types::{TypeId, TypeKind, TypeTable};

struct SwitchCtx {
    cond_ty: TypeId,
    values: Vec<i64>,
    has_default: bool,
}

pub struct Sema<'a> {
    types: &'a mut TypeTable,
    symbols: &'a mut SymbolTable,
    diags: &'a mut Diagnostics,
    std: Standard,
    /// Return type of the function being analyzed.
    current_ret: Option<TypeId>,
    current_func: String,
    loop_depth: u32,
    switch_stack: Vec<SwitchCtx>,
}

impl<'a> Sema<'a> {
    pub fn new(
        types: &'a mut TypeTable,
        symbols: &'a mut SymbolTable,
        diags: &'a mut Diagnostics,
        std: Standard,
    ) -> Self {
        Sema {
            types,
            symbols,
            diags,
            std,
            current_ret: None,
            current_func: String::new(),
            loop_depth: 0,
            switch_stack: Vec::new(),
        }
    }

    pub fn run(&mut self, unit: &mut TranslationUnit) {
        for decl in &mut unit.decls {
            match decl {
                ExternalDecl::Function(func) => self.function_def(func),
                ExternalDecl::Declaration(decl) => self.declaration(decl),
                ExternalDecl::StaticAssert(sa) => self.static_assert(sa),
            }
        }
    }

    // ---- declarations ----------------------------------------------------

    fn declaration(&mut self, decl: &mut Declaration) {
        self.enum_constants(&decl.enum_constants);
        for item in &mut decl.items {
            self.init_declarator(item, decl.storage);
        }
    }

    fn enum_constants(&mut self, constants: &[EnumConstantDef]) {
        for c in constants {
            match self.symbols.define(
                &c.name,
                SymbolKind::EnumConstant,
                self.types.int(),
                c.loc.clone(),
                StorageClass::None,
            ) {
                Ok(id) => {
                    self.symbols.symbol_mut(id).enum_value = c.value;
                    self.symbols.symbol_mut(id).defined = true;
                }
                Err(prev) => {
                    let prev_loc = self.symbols.symbol(prev).loc.clone();
                    self.diags.error_at(
                        &c.loc,
                        format!(
                            "redefinition of '{}' (previously defined at {})",
                            c.name, prev_loc
                        ),
                    );
                }
            }
        }
    }

    fn init_declarator(&mut self, item: &mut InitDeclarator, storage: StorageClass) {
        let kind = if storage == StorageClass::Typedef {
            SymbolKind::Typedef
        } else if self.types.is_function(item.ty) {
            SymbolKind::Function
        } else {
            SymbolKind::Variable
        };

        // Object declarations need a complete type unless extern.
        if kind == SymbolKind::Variable
            && storage != StorageClass::Extern
            && !self.types.is_complete(item.ty)
        {
            self.diags.error_at(
                &item.loc,
                format!(
                    "variable '{}' has incomplete type '{}'",
                    item.name,
                    self.types.display(item.ty)
                ),
            );
        }

        let sym = match self.symbols.define(
            &item.name,
            kind,
            item.ty,
            item.loc.clone(),
            storage,
        ) {
            Ok(id) => id,
            Err(prev) => {
                let prev_sym = self.symbols.symbol(prev);
                let compatible = match kind {
                    // Repeated function declarations and extern objects
                    // may be re-declared with the same type.
                    SymbolKind::Function => self.types.is_same(prev_sym.ty, item.ty),
                    SymbolKind::Variable => {
                        self.types.is_same(prev_sym.ty, item.ty)
                            && (prev_sym.storage == StorageClass::Extern
                                || storage == StorageClass::Extern
                                || prev_sym.is_global)
                    }
                    SymbolKind::Typedef => {
                        prev_sym.kind == SymbolKind::Typedef
                            && self.types.is_same(prev_sym.ty, item.ty)
                    }
                    _ => false,
                };
                if !compatible {
                    let prev_loc = prev_sym.loc.clone();
                    self.diags.error_at(
                        &item.loc,
                        format!(
                            "redefinition of '{}' (previously declared at {})",
                            item.name, prev_loc
                        ),
                    );
                }
                prev
            }
        };
        item.sym = Some(sym);

        if let Some(init) = &mut item.init {
            if kind != SymbolKind::Variable {
                self.diags
                    .error_at(&item.loc, format!("'{}' cannot be initialized", item.name));
            } else {
                if self.symbols.symbol(sym).defined {
                    self.diags.error_at(
                        &item.loc,
                        format!("redefinition of '{}'", item.name),
                    );
                }
                let ty = item.ty;
                self.initializer(init, ty, &item.loc.clone());
                self.symbols.symbol_mut(sym).defined = true;

                // File-scope initializers must be constant expressions.
                if self.symbols.symbol(sym).is_global && !self.init_is_constant(init) {
                    self.diags.error_at(
                        &item.loc,
                        format!("initializer of '{}' is not a constant expression", item.name),
                    );
                }
            }
        }
    }

    fn init_is_constant(&mut self, init: &Initializer) -> bool {
        match init {
            Initializer::Expr(e) => {
                matches!(e.kind, ExprKind::StrLit(_))
                    || matches!(
                        &e.kind,
                        ExprKind::Unary {
                            op: UnaryOp::AddrOf,
                            ..
                        }
                    )
                    || {
                        let mut scratch = Diagnostics::new(false, false, false);
                        const_eval::eval(e, self.types, Some(self.symbols), &mut scratch)
                            .is_some()
                    }
                    || matches!(
                        &e.kind,
                        ExprKind::ImplicitCast { operand, .. }
                            if matches!(operand.kind, ExprKind::StrLit(_))
                    )
            }
            Initializer::List { items, .. } => {
                items.iter().all(|i| self.init_is_constant(i))
            }
        }
    }

    fn initializer(&mut self, init: &mut Initializer, ty: TypeId, loc: &SourceLoc) {
        match init {
            Initializer::Expr(e) => {
                // `char s[] = "text"` and `char s[4] = "abc"` initialize
                // the array directly.
                if self.types.is_array(ty) {
                    if let ExprKind::StrLit(_) = &e.kind {
                        let elem = self.types.element(ty).unwrap_or_else(|| self.types.char_ty());
                        if self.types.size_of(elem) == Some(1) {
                            e.ty = Some(ty);
                            return;
                        }
                    }
                    self.diags
                        .error_at(loc, "array initializer must be a brace-enclosed list");
                    self.rvalue(e);
                    return;
                }
                self.rvalue(e);
                self.check_assignment(ty, e, "initialization");
            }
            Initializer::List { items, loc } => {
                let loc = loc.clone();
                if let Some(elem) = self.types.element(ty) {
                    let declared = self.types.array_len(ty);
                    if let Some(n) = declared {
                        if items.len() as u64 > n {
                            self.diags.error_at(
                                &loc,
                                format!(
                                    "too many initializers for array of {} elements",
                                    n
                                ),
                            );
                        }
                    }
                    for item in items {
                        self.initializer(item, elem, &loc);
                    }
                } else if self.types.is_record(ty) {
                    let field_types: Vec<TypeId> = self
                        .types
                        .record_fields(ty)
                        .map(|fs| {
                            fs.iter()
                                .filter(|f| !f.promoted)
                                .map(|f| f.ty)
                                .collect()
                        })
                        .unwrap_or_default();
                    if items.len() > field_types.len() {
                        self.diags.error_at(
                            &loc,
                            format!(
                                "too many initializers for '{}'",
                                self.types.display(ty)
                            ),
                        );
                    }
                    for (item, fty) in items.iter_mut().zip(field_types) {
                        self.initializer(item, fty, &loc);
                    }
                } else if items.len() == 1 {
                    // Scalar in braces.
                    self.initializer(&mut items[0], ty, &loc);
                } else {
                    self.diags.error_at(
                        &loc,
                        format!(
                            "braced initializer for scalar type '{}'",
                            self.types.display(ty)
                        ),
                    );
                }
            }
        }
    }

    fn static_assert(&mut self, sa: &mut StaticAssert) {
        self.check_expr(&mut sa.cond);
        match const_eval::eval(&sa.cond, self.types, Some(self.symbols), self.diags) {
            Some(0) => {
                let msg = sa
                    .message
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_else(|| "assertion failed".into());
                self.diags
                    .error_at(&sa.loc, format!("static assertion failed: {}", msg));
            }
            Some(_) => {}
            None => {
                self.diags.error_at(
                    &sa.loc,
                    "_Static_assert requires a constant expression",
                );
            }
        }
    }

    // ---- functions -------------------------------------------------------

    fn function_def(&mut self, func: &mut FunctionDef) {
        let sym = match self.symbols.define(
            &func.name,
            SymbolKind::Function,
            func.ty,
            func.loc.clone(),
            func.storage,
        ) {
            Ok(id) => id,
            Err(prev) => {
                let prev_sym = self.symbols.symbol(prev);
                if prev_sym.defined {
                    self.diags.error_at(
                        &func.loc,
                        format!("redefinition of function '{}'", func.name),
                    );
                } else if prev_sym.kind == SymbolKind::Function
                    && !self.types.is_same(prev_sym.ty, func.ty)
                    && !self.is_old_style(prev_sym.ty)
                {
                    self.diags.error_at(
                        &func.loc,
                        format!(
                            "conflicting types for '{}' (previously declared at {})",
                            func.name, prev_sym.loc
                        ),
                    );
                }
                // The definition's type wins over an old-style declaration.
                self.symbols.symbol_mut(prev).ty = func.ty;
                prev
            }
        };
        self.symbols.symbol_mut(sym).defined = true;
        func.sym = Some(sym);

        let ret = self
            .types
            .signature(func.ty)
            .map(|(r, _, _, _)| r)
            .unwrap_or_else(|| self.types.int());
        self.current_ret = Some(ret);
        self.current_func = func.name.clone();

        self.symbols.push_scope(ScopeKind::Function);
        for param in &mut func.params {
            let Some(name) = &param.name else {
                self.diags
                    .error_at(&param.loc, "parameter name omitted in function definition");
                continue;
            };
            if !self.types.is_complete(param.ty) && !self.types.is_pointer(param.ty) {
                self.diags.error_at(
                    &param.loc,
                    format!("parameter '{}' has incomplete type", name),
                );
            }
            match self.symbols.define(
                name,
                SymbolKind::Parameter,
                param.ty,
                param.loc.clone(),
                StorageClass::None,
            ) {
                Ok(id) => {
                    self.symbols.symbol_mut(id).defined = true;
                    param.sym = Some(id);
                }
                Err(_) => {
                    self.diags.error_at(
                        &param.loc,
                        format!("redefinition of parameter '{}'", name),
                    );
                }
            }
        }

        self.stmt(&mut func.body);

        // Unused parameter reporting before the scope goes away.
        for param in &func.params {
            if let Some(id) = param.sym {
                let sym = self.symbols.symbol(id);
                if !sym.used && !sym.name.is_empty() {
                    let name = sym.name.clone();
                    let loc = sym.loc.clone();
                    self.diags.warn(
                        "unused-parameter",
                        &loc,
                        format!("parameter '{}' is never used", name),
                    );
                }
            }
        }
        let unresolved = self.symbols.pop_function_scope();
        for id in unresolved {
            let sym = self.symbols.symbol(id);
            let (name, loc) = (sym.name.clone(), sym.loc.clone());
            self.diags.error_at(
                &loc,
                format!("label '{}' used but not defined", name),
            );
        }
        self.current_ret = None;
        self.current_func.clear();
    }

    fn is_old_style(&self, ty: TypeId) -> bool {
        matches!(
            self.types.kind(self.types.unqualified(ty)),
            TypeKind::Func { old_style: true, .. }
        )
    }

    // ---- statements ------------------------------------------------------

    fn stmt(&mut self, stmt: &mut Stmt) {
        match &mut stmt.kind {
            StmtKind::Compound(items) => {
                self.symbols.push_scope(ScopeKind::Block);
                for item in items {
                    match item {
                        BlockItem::Stmt(s) => self.stmt(s),
                        BlockItem::Decl(d) => self.declaration(d),
                        BlockItem::StaticAssert(sa) => self.static_assert(sa),
                    }
                }
                let locals = self.symbols.pop_scope();
                for id in locals {
                    let sym = self.symbols.symbol(id);
                    if sym.kind == SymbolKind::Variable && !sym.used {
                        let (name, loc) = (sym.name.clone(), sym.loc.clone());
                        self.diags.warn(
                            "unused-variable",
                            &loc,
                            format!("variable '{}' is never used", name),
                        );
                    }
                }
            }
            StmtKind::Expr(e) => {
                self.check_expr(e);
            }
            StmtKind::Null => {}
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.condition(cond, "if");
                self.stmt(then_branch);
                if let Some(e) = else_branch {
                    self.stmt(e);
                }
            }
            StmtKind::While { cond, body } => {
                self.condition(cond, "while");
                self.loop_depth += 1;
                self.stmt(body);
                self.loop_depth -= 1;
            }
            StmtKind::DoWhile { body, cond } => {
                self.loop_depth += 1;
                self.stmt(body);
                self.loop_depth -= 1;
                self.condition(cond, "do-while");
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.symbols.push_scope(ScopeKind::Block);
                match init.as_deref_mut() {
                    Some(ForInit::Expr(e)) => {
                        self.check_expr(e);
                    }
                    Some(ForInit::Decl(d)) => self.declaration(d),
                    None => {}
                }
                if let Some(c) = cond {
                    self.condition(c, "for");
                }
                if let Some(s) = step {
                    self.check_expr(s);
                }
                self.loop_depth += 1;
                self.stmt(body);
                self.loop_depth -= 1;
                self.symbols.pop_scope();
            }
            StmtKind::Switch {
                cond,
                body,
                cases,
                has_default,
            } => {
                let cond_ty = self.rvalue(cond);
                if !self.types.is_integer(cond_ty) {
                    self.diags.error_at(
                        &cond.loc,
                        format!(
                            "switch condition has non-integer type '{}'",
                            self.types.display(cond_ty)
                        ),
                    );
                }
                // The controlling expression is promoted.
                self.coerce(cond, self.types.promote(cond_ty));
                self.switch_stack.push(SwitchCtx {
                    cond_ty,
                    values: Vec::new(),
                    has_default: false,
                });
                self.stmt(body);
                let ctx = self.switch_stack.pop().expect("switch stack underflow");
                *cases = ctx.values;
                *has_default = ctx.has_default;
                self.missing_case_check(&stmt.loc, ctx.cond_ty, cases, *has_default);
            }
            StmtKind::Case {
                value_expr,
                value,
                body,
            } => {
                self.check_expr(value_expr);
                let folded =
                    const_eval::eval(value_expr, self.types, Some(self.symbols), self.diags);
                match self.switch_stack.last_mut() {
                    None => {
                        self.diags
                            .error_at(&stmt.loc, "case label outside of switch");
                    }
                    Some(ctx) => match folded {
                        Some(v) => {
                            if ctx.values.contains(&v) {
                                self.diags.error_at(
                                    &stmt.loc,
                                    format!("duplicate case value {}", v),
                                );
                            } else {
                                ctx.values.push(v);
                            }
                            *value = v;
                        }
                        None => {
                            self.diags.error_at(
                                &stmt.loc,
                                "case label is not a constant expression",
                            );
                        }
                    },
                }
                self.stmt(body);
            }
            StmtKind::Default(body) => {
                match self.switch_stack.last_mut() {
                    None => {
                        self.diags
                            .error_at(&stmt.loc, "default label outside of switch");
                    }
                    Some(ctx) => {
                        if ctx.has_default {
                            self.diags
                                .error_at(&stmt.loc, "multiple default labels in one switch");
                        }
                        ctx.has_default = true;
                    }
                }
                self.stmt(body);
            }
            StmtKind::Break => {
                if self.loop_depth == 0 && self.switch_stack.is_empty() {
                    self.diags
                        .error_at(&stmt.loc, "break statement outside of loop or switch");
                }
            }
            StmtKind::Continue => {
                if self.loop_depth == 0 {
                    self.diags
                        .error_at(&stmt.loc, "continue statement outside of loop");
                }
            }
            StmtKind::Return(value) => {
                let ret = self.current_ret.unwrap_or_else(|| self.types.int());
                match value {
                    Some(e) => {
                        let vty = self.rvalue(e);
                        if self.types.is_record(vty) {
                            self.diags.error_at(
                                &stmt.loc,
                                "returning structures by value is not supported; return a pointer",
                            );
                        }
                        if self.types.is_void(ret) {
                            self.diags.error_at(
                                &stmt.loc,
                                "void function cannot return a value",
                            );
                        } else {
                            self.check_assignment(ret, e, "return");
                        }
                    }
                    None => {
                        if !self.types.is_void(ret) {
                            self.diags.error_at(
                                &stmt.loc,
                                format!(
                                    "non-void function '{}' must return a value",
                                    self.current_func
                                ),
                            );
                        }
                    }
                }
            }
            StmtKind::Goto { label, sym } => {
                let void = self.types.void();
                *sym = Some(self.symbols.use_label(label, void, stmt.loc.clone()));
            }
            StmtKind::Label { name, body, sym } => {
                let void = self.types.void();
                match self.symbols.define_label(name, void, stmt.loc.clone()) {
                    Ok(id) => *sym = Some(id),
                    Err(prev) => {
                        let prev_loc = self.symbols.symbol(prev).loc.clone();
                        self.diags.error_at(
                            &stmt.loc,
                            format!(
                                "redefinition of label '{}' (previously defined at {})",
                                name, prev_loc
                            ),
                        );
                        *sym = Some(prev);
                    }
                }
                self.stmt(body);
            }
        }
    }

    /// A permissible-but-suspect switch over an enum with neither all
    /// enumerators nor a default.
    fn missing_case_check(
        &mut self,
        loc: &SourceLoc,
        cond_ty: TypeId,
        _cases: &[i64],
        has_default: bool,
    ) {
        if !has_default && self.types.is_enum(cond_ty) {
            self.diags.warn(
                "missing-case",
                loc,
                format!(
                    "switch over '{}' has no default label",
                    self.types.display(cond_ty)
                ),
            );
        }
    }

    fn condition(&mut self, cond: &mut Expr, what: &str) {
        let ty = self.rvalue(cond);
        if !self.types.is_scalar(ty) {
            self.diags.error_at(
                &cond.loc,
                format!(
                    "{} condition has non-scalar type '{}'",
                    what,
                    self.types.display(ty)
                ),
            );
        }
    }

    // ---- expressions -----------------------------------------------------

    /// Type an expression in an rvalue context: arrays and functions
    /// decay, and the node is annotated.
    fn rvalue(&mut self, e: &mut Expr) -> TypeId {
        let ty = self.check_expr(e);
        let decayed = self.types.decay(ty);
        if decayed != ty {
            self.coerce(e, decayed);
            return decayed;
        }
        ty
    }

    /// Wrap `e` in an implicit cast to `to` unless it already has that
    /// type.
    fn coerce(&mut self, e: &mut Expr, to: TypeId) {
        if e.ty == Some(to) {
            return;
        }
        let loc = e.loc.clone();
        let inner = std::mem::replace(
            e,
            Expr {
                kind: ExprKind::IntLit {
                    value: 0,
                    suffix: Default::default(),
                    decimal: true,
                },
                loc: loc.clone(),
                ty: None,
            },
        );
        *e = Expr {
            kind: ExprKind::ImplicitCast {
                to,
                operand: Box::new(inner),
            },
            loc,
            ty: Some(to),
        };
    }

    fn check_expr(&mut self, e: &mut Expr) -> TypeId {
        // `__func__` rewrites to a string literal carrying the enclosing
        // function's name before the main dispatch.
        let is_func_name = matches!(&e.kind, ExprKind::Ident { name, .. } if name == "__func__")
            && self.symbols.lookup("__func__").is_none();
        if is_func_name {
            if !has_feature(self.std, Feature::FuncName) {
                self.diags
                    .warn("func-name", &e.loc, "__func__ requires C99".to_string());
            }
            e.kind = ExprKind::StrLit(self.current_func.clone().into_bytes());
            let char_ty = self.types.char_ty();
            let cchar = self
                .types
                .qualified(char_ty, crate::types::Quals::const_only());
            let ty = self.types.pointer_to(cchar);
            e.ty = Some(ty);
            return ty;
        }
        let ty = self.check_expr_inner(e);
        e.ty = Some(ty);
        ty
    }

    fn check_expr_inner(&mut self, e: &mut Expr) -> TypeId {
        let loc = e.loc.clone();
        match &mut e.kind {
            ExprKind::IntLit {
                value,
                suffix,
                decimal,
            } => self.int_literal_type(*value, *suffix, *decimal, &loc),
            ExprKind::FloatLit { is_f32, .. } => {
                if *is_f32 {
                    self.types.float()
                } else {
                    self.types.double()
                }
            }
            ExprKind::CharLit(_) => self.types.int(),
            ExprKind::StrLit(_) => {
                // Decayed: string literals read as `char *`.
                let char_ty = self.types.char_ty();
                self.types.pointer_to(char_ty)
            }
            ExprKind::Ident { name, sym } => {
                match self.symbols.lookup(name) {
                    Some(id) => {
                        self.symbols.symbol_mut(id).used = true;
                        *sym = Some(id);
                        let symbol = self.symbols.symbol(id);
                        match symbol.kind {
                            SymbolKind::Typedef => {
                                self.diags.error_at(
                                    &loc,
                                    format!("unexpected type name '{}' in expression", name),
                                );
                                self.types.int()
                            }
                            _ => symbol.ty,
                        }
                    }
                    None => {
                        self.diags.error_at(
                            &loc,
                            format!("use of undeclared identifier '{}'", name),
                        );
                        self.types.int()
                    }
                }
            }
            ExprKind::Unary { op, operand } => {
                let op = *op;
                self.unary(op, operand, &loc)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let op = *op;
                // Work around simultaneous &mut borrows of the boxes.
                let (lty, rty) = {
                    let l = self.rvalue(lhs);
                    let r = self.rvalue(rhs);
                    (l, r)
                };
                self.binary(op, lhs, rhs, lty, rty, &loc)
            }
            ExprKind::Assign { op, lhs, rhs } => {
                let op = *op;
                let lty = self.check_expr(lhs);
                if !lhs.is_lvalue() {
                    self.diags
                        .error_at(&loc, "expression is not assignable (not an lvalue)");
                    self.rvalue(rhs);
                    return lty;
                }
                if self.types.quals(lty).is_const {
                    self.diags.error_at(
                        &loc,
                        "cannot assign to a const-qualified lvalue",
                    );
                }
                if self.types.is_array(lty) {
                    self.diags.error_at(&loc, "array type is not assignable");
                }
                let rty = self.rvalue(rhs);
                if let Some(bin_op) = op {
                    // Compound assignment: the implied binary operation
                    // must type-check with the operand classes of the
                    // plain operator.
                    let unq = self.types.unqualified(lty);
                    if bin_op == BinaryOp::Add || bin_op == BinaryOp::Sub {
                        let ok = (self.types.is_arithmetic(unq)
                            && self.types.is_arithmetic(rty))
                            || (self.types.is_pointer(unq) && self.types.is_integer(rty));
                        if !ok {
                            self.operand_error(bin_op, unq, rty, &loc);
                        }
                    } else if matches!(bin_op, BinaryOp::Mul | BinaryOp::Div) {
                        if !(self.types.is_arithmetic(unq) && self.types.is_arithmetic(rty)) {
                            self.operand_error(bin_op, unq, rty, &loc);
                        }
                    } else if !(self.types.is_integer(unq) && self.types.is_integer(rty)) {
                        self.operand_error(bin_op, unq, rty, &loc);
                    }
                    // The operation runs in the common type; converting
                    // the result back to the target may lose value.
                    if self.types.is_arithmetic(unq) && self.types.is_arithmetic(rty) {
                        let common = self.types.usual_arithmetic(unq, rty);
                        self.warn_narrowing(unq, common, &loc);
                    }
                } else {
                    self.check_assignment(lty, rhs, "assignment");
                }
                self.types.unqualified(lty)
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.condition(cond, "conditional");
                let t = self.rvalue(then_expr);
                let f = self.rvalue(else_expr);
                if self.types.is_arithmetic(t) && self.types.is_arithmetic(f) {
                    let common = self.types.usual_arithmetic(t, f);
                    self.coerce(then_expr, common);
                    self.coerce(else_expr, common);
                    common
                } else if self.types.is_same(t, f) {
                    self.types.unqualified(t)
                } else if self.types.is_pointer(t) && self.is_null_constant(else_expr) {
                    t
                } else if self.types.is_pointer(f) && self.is_null_constant(then_expr) {
                    f
                } else if self.types.is_pointer(t) && self.types.is_pointer(f) {
                    // Mixed pointers collapse to void * either way.
                    t
                } else {
                    self.diags.error_at(
                        &loc,
                        format!(
                            "incompatible operand types in conditional ('{}' and '{}')",
                            self.types.display(t),
                            self.types.display(f)
                        ),
                    );
                    t
                }
            }
            ExprKind::Call { callee, args } => self.call(callee, args, &loc),
            ExprKind::Index { base, index } => {
                let bty = self.rvalue(base);
                let ity = self.rvalue(index);
                // One side must be a pointer, the other an integer.
                let (ptr_ty, ok) = if self.types.is_pointer(bty) {
                    (bty, self.types.is_integer(ity))
                } else if self.types.is_pointer(ity) {
                    (ity, self.types.is_integer(bty))
                } else {
                    (bty, false)
                };
                if !ok {
                    self.diags.error_at(
                        &loc,
                        format!(
                            "subscripted value is not an array or pointer ('{}')",
                            self.types.display(bty)
                        ),
                    );
                    return self.types.int();
                }
                self.types.pointee(ptr_ty).unwrap_or_else(|| self.types.int())
            }
            ExprKind::Member {
                base,
                member,
                arrow,
                field_index,
            } => {
                let arrow = *arrow;
                let base_ty = if arrow {
                    let t = self.rvalue(base);
                    match self.types.pointee(t) {
                        Some(p) => p,
                        None => {
                            self.diags.error_at(
                                &loc,
                                format!(
                                    "'->' requires a pointer to a struct or union ('{}')",
                                    self.types.display(t)
                                ),
                            );
                            return self.types.int();
                        }
                    }
                } else {
                    self.check_expr(base)
                };
                if !self.types.is_record(base_ty) {
                    self.diags.error_at(
                        &loc,
                        format!(
                            "member access on non-struct type '{}'",
                            self.types.display(base_ty)
                        ),
                    );
                    return self.types.int();
                }
                if !self.types.is_complete(base_ty) {
                    self.diags.error_at(
                        &loc,
                        format!(
                            "member access on incomplete type '{}'",
                            self.types.display(base_ty)
                        ),
                    );
                    return self.types.int();
                }
                match self.resolve_member(base_ty, member) {
                    Some((index, ty)) => {
                        *field_index = Some(index);
                        ty
                    }
                    None => {
                        self.diags.error_at(
                            &loc,
                            format!(
                                "no member named '{}' in '{}'",
                                member,
                                self.types.display(base_ty)
                            ),
                        );
                        self.types.int()
                    }
                }
            }
            ExprKind::Cast { to, operand } => {
                let to = *to;
                let from = self.rvalue(operand);
                let castable = self.types.is_void(to)
                    || (self.types.is_scalar(to) && self.types.is_scalar(from));
                if !castable {
                    self.diags.error_at(
                        &loc,
                        format!(
                            "cannot cast '{}' to '{}'",
                            self.types.display(from),
                            self.types.display(to)
                        ),
                    );
                }
                to
            }
            ExprKind::ImplicitCast { to, .. } => *to,
            ExprKind::SizeofExpr(inner) => {
                // The operand is not evaluated and does not decay.
                self.check_expr(inner);
                let ty = inner.ty.expect("operand analyzed");
                if self.types.size_of(ty).is_none() {
                    self.diags.error_at(
                        &loc,
                        format!(
                            "sizeof of incomplete type '{}'",
                            self.types.display(ty)
                        ),
                    );
                }
                self.types.size_type()
            }
            ExprKind::SizeofType(ty) => {
                let ty = *ty;
                // A flexible/incomplete array inside sizeof is an error,
                // except sizeof of a flexible member type is zero-sized
                // and handled by the evaluator.
                if self.types.size_of(ty).is_none()
                    && !(self.types.is_array(ty) && self.types.array_len(ty).is_none())
                {
                    self.diags.error_at(
                        &loc,
                        format!(
                            "sizeof of incomplete type '{}'",
                            self.types.display(ty)
                        ),
                    );
                }
                self.types.size_type()
            }
            ExprKind::Comma { lhs, rhs } => {
                self.check_expr(lhs);
                self.rvalue(rhs)
            }
        }
    }

    /// Integer literal typing: the smallest type in the standard's list
    /// that can represent the value.
    fn int_literal_type(
        &mut self,
        value: u64,
        suffix: crate::lexer::IntSuffix,
        decimal: bool,
        loc: &SourceLoc,
    ) -> TypeId {
        let long_bits = self.types.layout().long_bytes * 8;
        let fits_int = value <= i32::MAX as u64;
        let fits_uint = value <= u32::MAX as u64;
        let fits_long = if long_bits == 64 {
            value <= i64::MAX as u64
        } else {
            fits_int
        };
        let fits_ulong = if long_bits == 64 { true } else { fits_uint };
        let has_ll = has_feature(self.std, Feature::LongLong);

        if suffix.unsigned {
            return match suffix.long {
                0 if fits_uint => self.types.unsigned_int(),
                0 | 1 if fits_ulong => self.types.unsigned_long(),
                _ => self.types.unsigned_long_long(),
            };
        }
        match suffix.long {
            0 => {
                if fits_int {
                    return self.types.int();
                }
                if !decimal && fits_uint {
                    return self.types.unsigned_int();
                }
                if fits_long {
                    return self.types.long();
                }
                if !decimal && fits_ulong {
                    return self.types.unsigned_long();
                }
                if !has_ll {
                    self.diags.error_at(
                        loc,
                        format!("integer constant {} is out of range for this standard", value),
                    );
                    return self.types.long();
                }
                if value <= i64::MAX as u64 {
                    self.types.long_long()
                } else if !decimal {
                    self.types.unsigned_long_long()
                } else {
                    self.diags.error_at(
                        loc,
                        format!("integer constant {} is too large", value),
                    );
                    self.types.unsigned_long_long()
                }
            }
            1 => {
                if fits_long {
                    self.types.long()
                } else {
                    self.types.long_long()
                }
            }
            _ => self.types.long_long(),
        }
    }

    fn unary(&mut self, op: UnaryOp, operand: &mut Expr, loc: &SourceLoc) -> TypeId {
        match op {
            UnaryOp::Plus | UnaryOp::Neg => {
                let ty = self.rvalue(operand);
                if !self.types.is_arithmetic(ty) {
                    self.diags.error_at(
                        loc,
                        format!(
                            "unary '{}' requires an arithmetic operand ('{}')",
                            op.symbol(),
                            self.types.display(ty)
                        ),
                    );
                    return self.types.int();
                }
                let promoted = self.types.promote(ty);
                self.coerce(operand, promoted);
                promoted
            }
            UnaryOp::BitNot => {
                let ty = self.rvalue(operand);
                if !self.types.is_integer(ty) {
                    self.diags.error_at(
                        loc,
                        format!(
                            "unary '~' requires an integer operand ('{}')",
                            self.types.display(ty)
                        ),
                    );
                    return self.types.int();
                }
                let promoted = self.types.promote(ty);
                self.coerce(operand, promoted);
                promoted
            }
            UnaryOp::LogNot => {
                let ty = self.rvalue(operand);
                if !self.types.is_scalar(ty) {
                    self.diags
                        .error_at(loc, "unary '!' requires a scalar operand");
                }
                self.types.int()
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let ty = self.check_expr(operand);
                if !operand.is_lvalue() {
                    self.diags.error_at(
                        loc,
                        format!("operand of '{}' is not an lvalue", op.symbol()),
                    );
                }
                let unq = self.types.unqualified(ty);
                if !self.types.is_scalar(unq) {
                    self.diags.error_at(
                        loc,
                        format!("operand of '{}' is not scalar", op.symbol()),
                    );
                }
                unq
            }
            UnaryOp::Deref => {
                let ty = self.rvalue(operand);
                match self.types.pointee(ty) {
                    Some(p) => p,
                    None => {
                        self.diags.error_at(
                            loc,
                            format!(
                                "cannot dereference non-pointer type '{}'",
                                self.types.display(ty)
                            ),
                        );
                        self.types.int()
                    }
                }
            }
            UnaryOp::AddrOf => {
                let ty = self.check_expr(operand);
                if !operand.is_lvalue() && !self.types.is_function(ty) {
                    self.diags
                        .error_at(loc, "cannot take the address of an rvalue");
                }
                let unq = self.types.unqualified(ty);
                self.types.pointer_to(unq)
            }
        }
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: &mut Box<Expr>,
        rhs: &mut Box<Expr>,
        lty: TypeId,
        rty: TypeId,
        loc: &SourceLoc,
    ) -> TypeId {
        use BinaryOp::*;
        match op {
            Add | Sub => {
                if self.types.is_arithmetic(lty) && self.types.is_arithmetic(rty) {
                    let common = self.types.usual_arithmetic(lty, rty);
                    self.coerce(lhs, common);
                    self.coerce(rhs, common);
                    return common;
                }
                // Pointer arithmetic.
                if self.types.is_pointer(lty) && self.types.is_integer(rty) {
                    return lty;
                }
                if op == Add && self.types.is_integer(lty) && self.types.is_pointer(rty) {
                    return rty;
                }
                if op == Sub && self.types.is_pointer(lty) && self.types.is_pointer(rty) {
                    return self.types.long();
                }
                self.operand_error(op, lty, rty, loc);
                self.types.int()
            }
            Mul | Div => {
                if self.types.is_arithmetic(lty) && self.types.is_arithmetic(rty) {
                    let common = self.types.usual_arithmetic(lty, rty);
                    self.coerce(lhs, common);
                    self.coerce(rhs, common);
                    return common;
                }
                self.operand_error(op, lty, rty, loc);
                self.types.int()
            }
            Mod | BitAnd | BitXor | BitOr => {
                if self.types.is_integer(lty) && self.types.is_integer(rty) {
                    let common = self.types.usual_arithmetic(lty, rty);
                    self.coerce(lhs, common);
                    self.coerce(rhs, common);
                    return common;
                }
                self.operand_error(op, lty, rty, loc);
                self.types.int()
            }
            Shl | Shr => {
                if self.types.is_integer(lty) && self.types.is_integer(rty) {
                    // Shifts promote each operand independently.
                    let promoted = self.types.promote(lty);
                    self.coerce(lhs, promoted);
                    let rp = self.types.promote(rty);
                    self.coerce(rhs, rp);
                    return promoted;
                }
                self.operand_error(op, lty, rty, loc);
                self.types.int()
            }
            Lt | Gt | Le | Ge | Eq | Ne => {
                if self.types.is_arithmetic(lty) && self.types.is_arithmetic(rty) {
                    let common = self.types.usual_arithmetic(lty, rty);
                    self.coerce(lhs, common);
                    self.coerce(rhs, common);
                } else if self.types.is_pointer(lty) && self.types.is_pointer(rty) {
                    // ok, including void* mixes
                } else if self.types.is_pointer(lty) && self.is_null_constant(rhs) {
                    self.coerce(rhs, lty);
                } else if self.types.is_pointer(rty) && self.is_null_constant(lhs) {
                    self.coerce(lhs, rty);
                } else {
                    self.operand_error(op, lty, rty, loc);
                }
                self.types.int()
            }
            LogAnd | LogOr => {
                if !self.types.is_scalar(lty) || !self.types.is_scalar(rty) {
                    self.operand_error(op, lty, rty, loc);
                }
                self.types.int()
            }
        }
    }

    fn operand_error(&mut self, op: BinaryOp, lty: TypeId, rty: TypeId, loc: &SourceLoc) {
        self.diags.error_at(
            loc,
            format!(
                "invalid operands to binary '{}' ('{}' and '{}')",
                op.symbol(),
                self.types.display(lty),
                self.types.display(rty)
            ),
        );
    }

    /// An implicit arithmetic conversion that can lose value: float to
    /// integer, or a narrower destination within the same class.
    fn warn_narrowing(&mut self, to: TypeId, from: TypeId, loc: &SourceLoc) {
        if self.types.is_same(to, from) {
            return;
        }
        let lossy = if self.types.is_float(from) && self.types.is_integer(to) {
            true
        } else if (self.types.is_integer(from) && self.types.is_integer(to))
            || (self.types.is_float(from) && self.types.is_float(to))
        {
            match (self.types.size_of(from), self.types.size_of(to)) {
                (Some(f), Some(t)) => t < f,
                _ => false,
            }
        } else {
            false
        };
        if lossy {
            self.diags.warn(
                "conversion",
                loc,
                format!(
                    "implicit conversion from '{}' to '{}' may change the value",
                    self.types.display(from),
                    self.types.display(to)
                ),
            );
        }
    }

    fn call(&mut self, callee: &mut Expr, args: &mut [Expr], loc: &SourceLoc) -> TypeId {
        // Implicit declaration in C89/GNU89 when the callee is an unknown
        // plain identifier.
        if let ExprKind::Ident { name, sym } = &mut callee.kind {
            if self.symbols.lookup(name).is_none() {
                if has_feature(self.std, Feature::ImplicitFunctionDecl) {
                    self.diags.warn(
                        "implicit-function-declaration",
                        loc,
                        format!("implicit declaration of function '{}'", name),
                    );
                    let int = self.types.int();
                    let fty = self.types.function(int, Vec::new(), false, true);
                    let id = self
                        .symbols
                        .define_global(
                            name,
                            SymbolKind::Function,
                            fty,
                            loc.clone(),
                            StorageClass::Extern,
                        )
                        .unwrap_or_else(|prev| prev);
                    *sym = Some(id);
                    callee.ty = Some(fty);
                } else {
                    self.diags.error_at(
                        loc,
                        format!("implicit declaration of function '{}' is invalid in {}",
                            name, self.std),
                    );
                    let int = self.types.int();
                    let fty = self.types.function(int, Vec::new(), false, true);
                    callee.ty = Some(fty);
                }
            }
        }
        if callee.ty.is_none() {
            self.check_expr(callee);
        }
        let callee_ty = callee.ty.expect("callee analyzed");
        let Some((ret, params, variadic, old_style)) = self
            .types
            .signature(callee_ty)
            .map(|(r, p, v, o)| (r, p.to_vec(), v, o))
        else {
            self.diags.error_at(
                loc,
                format!(
                    "called object has non-function type '{}'",
                    self.types.display(callee_ty)
                ),
            );
            for arg in args.iter_mut() {
                self.rvalue(arg);
            }
            return self.types.int();
        };

        if !old_style {
            if variadic {
                if args.len() < params.len() {
                    self.diags.error_at(
                        loc,
                        format!(
                            "function expects at least {} arguments, got {}",
                            params.len(),
                            args.len()
                        ),
                    );
                }
            } else if args.len() != params.len() {
                self.diags.error_at(
                    loc,
                    format!(
                        "function expects {} arguments, got {}",
                        params.len(),
                        args.len()
                    ),
                );
            }
        }

        for (i, arg) in args.iter_mut().enumerate() {
            let arg_ty = self.rvalue(arg);
            if self.types.is_record(arg_ty) {
                self.diags.error_at(
                    &arg.loc,
                    "passing structures by value is not supported; pass a pointer",
                );
            }
            match params.get(i) {
                Some(&pty) => self.check_assignment(pty, arg, "argument passing"),
                None => {
                    // Default argument promotions for variadic / unchecked
                    // arguments.
                    let ty = arg.ty.expect("argument analyzed");
                    if self.types.is_same(ty, self.types.float()) {
                        self.coerce(arg, self.types.double());
                    } else if self.types.is_integer(ty) {
                        let promoted = self.types.promote(ty);
                        self.coerce(arg, promoted);
                    }
                }
            }
        }
        ret
    }

    fn is_null_constant(&self, e: &Expr) -> bool {
        match &e.kind {
            ExprKind::IntLit { value: 0, .. } => true,
            ExprKind::Cast { to, operand } => {
                self.types.is_pointer(*to)
                    && self
                        .types
                        .pointee(*to)
                        .map(|p| self.types.is_void(p))
                        .unwrap_or(false)
                    && self.is_null_constant(operand)
            }
            ExprKind::ImplicitCast { operand, .. } => self.is_null_constant(operand),
            _ => false,
        }
    }

    /// Assignment compatibility for `lhs = rhs`, initializers, argument
    /// passing, and `return`.
    fn check_assignment(&mut self, to: TypeId, from: &mut Expr, what: &str) {
        let from_ty = match from.ty {
            Some(t) => t,
            None => self.rvalue(from),
        };
        let to_unq = self.types.unqualified(to);
        if self.types.is_same(to, from_ty) {
            return;
        }
        // Arithmetic to arithmetic converts.
        if self.types.is_arithmetic(to_unq) && self.types.is_arithmetic(from_ty) {
            self.warn_narrowing(to_unq, from_ty, &from.loc.clone());
            self.coerce(from, to_unq);
            return;
        }
        // Null pointer constant to any pointer.
        if self.types.is_pointer(to_unq) && self.is_null_constant(from) {
            self.coerce(from, to_unq);
            return;
        }
        // Pointer to pointer: void* on either side, or compatible
        // pointees modulo qualifiers.
        if self.types.is_pointer(to_unq) && self.types.is_pointer(from_ty) {
            let to_p = self.types.pointee(to_unq).expect("pointer");
            let from_p = self.types.pointee(from_ty).expect("pointer");
            if self.types.is_void(to_p)
                || self.types.is_void(from_p)
                || self.types.is_same(to_p, from_p)
            {
                self.coerce(from, to_unq);
                return;
            }
        }
        // Same record type.
        if self.types.is_record(to_unq) && self.types.is_same(to_unq, from_ty) {
            return;
        }
        self.diags.error_at(
            &from.loc,
            format!(
                "incompatible types in {}: '{}' from '{}'",
                what,
                self.types.display(to),
                self.types.display(from_ty)
            ),
        );
    }

    /// Member lookup. Anonymous struct/union members were flattened into
    /// the parent at record-completion time, so a plain field search is
    /// complete.
    fn resolve_member(&mut self, record: TypeId, name: &str) -> Option<(usize, TypeId)> {
        self.types
            .find_field(record, name)
            .map(|(idx, field)| (idx, field.ty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::types::TargetLayout;

    fn analyze(src: &str) -> (TranslationUnit, TypeTable, SymbolTable, Diagnostics) {
        analyze_std(src, Standard::C99)
    }

    fn analyze_std(
        src: &str,
        std: Standard,
    ) -> (TranslationUnit, TypeTable, SymbolTable, Diagnostics) {
        let mut diags = Diagnostics::new(false, false, false);
        let mut types = TypeTable::new(TargetLayout::lp64());
        let mut symbols = SymbolTable::new();
        let tokens = Lexer::new("t.c", src, std).run(&mut diags);
        let mut unit = Parser::new(tokens, std, &mut types, &mut diags).parse();
        Sema::new(&mut types, &mut symbols, &mut diags, std).run(&mut unit);
        (unit, types, symbols, diags)
    }

    #[test]
    fn test_every_expression_is_typed() {
        let (unit, _, _, diags) =
            analyze("int f(int a, int b) { return a + b * 2; }");
        assert!(!diags.has_errors(), "{}", diags.render());
        // Spot-check: the return expression tree is fully typed.
        match &unit.decls[0] {
            ExternalDecl::Function(f) => match &f.body.kind {
                StmtKind::Compound(items) => match &items[0] {
                    BlockItem::Stmt(Stmt {
                        kind: StmtKind::Return(Some(e)),
                        ..
                    }) => assert!(e.ty.is_some()),
                    other => panic!("expected return, got {:?}", other),
                },
                other => panic!("expected compound, got {:?}", other),
            },
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_undeclared_identifier() {
        let (_, _, _, diags) = analyze("int f(void) { return missing; }");
        assert!(diags.contains("use of undeclared identifier 'missing'"));
    }

    #[test]
    fn test_arity_mismatch() {
        let (_, _, _, diags) = analyze("int f(int); int g(void) { return f(1, 2); }");
        assert!(diags.contains("function expects 1 arguments, got 2"));
    }

    #[test]
    fn test_variadic_accepts_extra() {
        let (_, _, _, diags) =
            analyze("int printf(const char *, ...); int g(void) { return printf(\"%d\", 1); }");
        assert!(!diags.has_errors(), "{}", diags.render());
    }

    #[test]
    fn test_implicit_declaration_c89_warns() {
        let (_, _, symbols, diags) =
            analyze_std("int main() { return foo(); }", Standard::C89);
        assert!(!diags.has_errors(), "{}", diags.render());
        assert!(diags.contains("implicit declaration of function 'foo'"));
        // The synthesized declaration landed at file scope.
        assert!(symbols.lookup("foo").is_some());
    }

    #[test]
    fn test_implicit_declaration_c99_errors() {
        let (_, _, _, diags) = analyze("int main(void) { return foo(); }");
        assert!(diags.contains("implicit declaration of function 'foo' is invalid"));
    }

    #[test]
    fn test_assignment_compatibility() {
        let (_, _, _, diags) = analyze(
            "void g(void) { int i; double d; int *p; void *v; \
             i = 3; d = i; p = v; v = p; p = 0; }",
        );
        assert!(!diags.has_errors(), "{}", diags.render());
        let (_, _, _, diags) = analyze("void g(void) { int *p; double d; p = d; }");
        assert!(diags.contains("incompatible types in assignment"));
    }

    #[test]
    fn test_not_lvalue() {
        let (_, _, _, diags) = analyze("void g(void) { 3 = 4; }");
        assert!(diags.contains("not an lvalue"));
    }

    #[test]
    fn test_const_assignment_rejected() {
        let (_, _, _, diags) = analyze("void g(void) { const int c = 1; c = 2; }");
        assert!(diags.contains("const-qualified"));
    }

    #[test]
    fn test_break_continue_placement() {
        let (_, _, _, diags) = analyze("void g(void) { break; }");
        assert!(diags.contains("break statement outside"));
        let (_, _, _, diags) = analyze("void g(void) { continue; }");
        assert!(diags.contains("continue statement outside"));
        let (_, _, _, diags) = analyze("void g(int n) { switch (n) { case 1: break; } }");
        assert!(!diags.has_errors(), "{}", diags.render());
    }

    #[test]
    fn test_case_outside_switch() {
        let (_, _, _, diags) = analyze("void g(void) { case 1: ; }");
        assert!(diags.contains("case label outside of switch"));
    }

    #[test]
    fn test_duplicate_case() {
        let (_, _, _, diags) =
            analyze("void g(int n) { switch (n) { case 1: case 1: break; } }");
        assert!(diags.contains("duplicate case value 1"));
    }

    #[test]
    fn test_switch_cases_collected() {
        let (unit, _, _, diags) = analyze(
            "void g(int n) { switch (n) { case 1: break; case 2: break; default: break; } }",
        );
        assert!(!diags.has_errors(), "{}", diags.render());
        match &unit.decls[0] {
            ExternalDecl::Function(f) => match &f.body.kind {
                StmtKind::Compound(items) => match &items[0] {
                    BlockItem::Stmt(Stmt {
                        kind:
                            StmtKind::Switch {
                                cases, has_default, ..
                            },
                        ..
                    }) => {
                        assert_eq!(cases, &vec![1, 2]);
                        assert!(has_default);
                    }
                    other => panic!("expected switch, got {:?}", other),
                },
                other => panic!("expected compound, got {:?}", other),
            },
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_return_type_checks() {
        let (_, _, _, diags) = analyze("void g(void) { return 1; }");
        assert!(diags.contains("void function cannot return a value"));
        let (_, _, _, diags) = analyze("int g(void) { return; }");
        assert!(diags.contains("must return a value"));
    }

    #[test]
    fn test_goto_forward_and_unresolved() {
        let (_, _, _, diags) =
            analyze("void g(void) { goto out; out: return; }");
        assert!(!diags.has_errors(), "{}", diags.render());
        let (_, _, _, diags) = analyze("void g(void) { goto nowhere; }");
        assert!(diags.contains("label 'nowhere' used but not defined"));
    }

    #[test]
    fn test_static_assert_failure() {
        let (_, _, _, diags) = analyze_std(
            "_Static_assert(1 == 2, \"nope\");",
            Standard::C11,
        );
        assert!(diags.contains("static assertion failed: nope"));
    }

    #[test]
    fn test_func_name_rewrite() {
        let (unit, types, _, diags) =
            analyze("int f(void) { const char *s = __func__; return 0; }");
        assert!(!diags.has_errors(), "{}", diags.render());
        // __func__ became a string literal carrying the function name.
        match &unit.decls[0] {
            ExternalDecl::Function(f) => match &f.body.kind {
                StmtKind::Compound(items) => match &items[0] {
                    BlockItem::Decl(d) => match &d.items[0].init {
                        Some(Initializer::Expr(e)) => {
                            let mut cur = e;
                            while let ExprKind::ImplicitCast { operand, .. } = &cur.kind {
                                cur = operand;
                            }
                            match &cur.kind {
                                ExprKind::StrLit(bytes) => assert_eq!(bytes, b"f"),
                                other => panic!("expected string literal, got {:?}", other),
                            }
                        }
                        other => panic!("expected initializer, got {:?}", other),
                    },
                    other => panic!("expected declaration, got {:?}", other),
                },
                other => panic!("expected compound, got {:?}", other),
            },
            other => panic!("expected function, got {:?}", other),
        }
        let _ = types;
    }

    #[test]
    fn test_string_literal_type() {
        let (_, _, _, diags) = analyze("char *s = \"hello\";");
        assert!(!diags.has_errors(), "{}", diags.render());
    }

    #[test]
    fn test_integer_literal_boundary() {
        // 2147483647 fits int; 2147483648 does not.
        let (unit, types, _, diags) =
            analyze("long a = 2147483647; long b = 2147483648;");
        assert!(!diags.has_errors(), "{}", diags.render());
        let lits: Vec<TypeId> = unit
            .decls
            .iter()
            .filter_map(|d| match d {
                ExternalDecl::Declaration(d) => match &d.items[0].init {
                    Some(Initializer::Expr(e)) => {
                        let mut cur = e;
                        while let ExprKind::ImplicitCast { operand, .. } = &cur.kind {
                            cur = operand;
                        }
                        cur.ty
                    }
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(lits[0], types.int());
        assert_eq!(lits[1], types.long());
    }

    #[test]
    fn test_implicit_conversions_inserted() {
        let (unit, _, _, diags) = analyze("double g(int i) { return i + 1.5; }");
        assert!(!diags.has_errors(), "{}", diags.render());
        // i is wrapped in an implicit cast to double.
        match &unit.decls[0] {
            ExternalDecl::Function(f) => match &f.body.kind {
                StmtKind::Compound(items) => match &items[0] {
                    BlockItem::Stmt(Stmt {
                        kind: StmtKind::Return(Some(e)),
                        ..
                    }) => match &e.kind {
                        ExprKind::Binary { lhs, .. } => {
                            assert!(matches!(lhs.kind, ExprKind::ImplicitCast { .. }));
                        }
                        other => panic!("expected binary, got {:?}", other),
                    },
                    other => panic!("expected return, got {:?}", other),
                },
                other => panic!("expected compound, got {:?}", other),
            },
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_member_access() {
        let (_, _, _, diags) = analyze(
            "struct point { int x; int y; }; \
             int f(struct point p, struct point *q) { return p.x + q->y; }",
        );
        assert!(!diags.has_errors(), "{}", diags.render());
        let (_, _, _, diags) = analyze(
            "struct point { int x; }; int f(struct point p) { return p.z; }",
        );
        assert!(diags.contains("no member named 'z'"));
    }

    #[test]
    fn test_sizeof_types() {
        let (_, _, _, diags) =
            analyze("struct s; int n = sizeof(struct s);");
        assert!(diags.contains("sizeof of incomplete type"));
    }

    #[test]
    fn test_scope_popping() {
        let (_, _, symbols, diags) = analyze(
            "void g(void) { { int inner = 1; inner = inner + 1; } }",
        );
        assert!(!diags.has_errors(), "{}", diags.render());
        assert!(symbols.lookup("inner").is_none());
    }

    #[test]
    fn test_conversion_warning_under_wextra() {
        let std = Standard::C99;
        let src = "void g(void) { int i; double d; d = 1.5; i = d; i += 0.5; }";
        let mut diags = Diagnostics::new(false, true, false);
        let mut types = TypeTable::new(TargetLayout::lp64());
        let mut symbols = SymbolTable::new();
        let tokens = Lexer::new("t.c", src, std).run(&mut diags);
        let mut unit = Parser::new(tokens, std, &mut types, &mut diags).parse();
        Sema::new(&mut types, &mut symbols, &mut diags, std).run(&mut unit);
        assert_eq!(diags.error_count(), 0, "{}", diags.render());
        // Both the plain assignment and the compound one narrow
        // double to int; the widening `d = 1.5` stays quiet.
        assert!(diags.contains("[-Wconversion]"), "{}", diags.render());
        assert_eq!(diags.warning_count(), 2, "{}", diags.render());

        // Off outside -Wextra.
        let (_, _, _, diags) = analyze(src);
        assert!(!diags.contains("[-Wconversion]"), "{}", diags.render());
    }

    #[test]
    fn test_compound_modulo_requires_integers() {
        let (_, _, _, diags) = analyze("void g(void) { int i; i = 1; i %= 2.5; }");
        assert!(diags.contains("invalid operands to binary '%'"), "{}", diags.render());
    }

    #[test]
    fn test_enum_constants_in_expressions() {
        let (_, _, _, diags) = analyze(
            "enum color { RED, GREEN, BLUE }; int f(void) { return GREEN + BLUE; }",
        );
        assert!(!diags.has_errors(), "{}", diags.render());
    }
}
