//! Abstract syntax tree
//!
//! One node family per syntactic construct: external declarations,
//! statements, expressions, initializers. Every node carries its source
//! location; expression nodes carry a `ty` slot that stays `None` until
//! semantic analysis fills it. Symbol references (`sym`, `field_index`)
//! are likewise filled by the analyzer, so code generation never performs
//! name lookup.

use crate::diag::SourceLoc;
use crate::lexer::IntSuffix;
use crate::symbols::{StorageClass, SymbolId};
use crate::types::{TypeId, TypeTable};
use std::fmt::Write as _;

#[derive(Debug)]
pub struct TranslationUnit {
    pub decls: Vec<ExternalDecl>,
}

#[derive(Debug)]
pub enum ExternalDecl {
    Function(FunctionDef),
    Declaration(Declaration),
    StaticAssert(StaticAssert),
}

#[derive(Debug)]
pub struct FunctionDef {
    pub name: String,
    pub loc: SourceLoc,
    /// Function type (return + parameters).
    pub ty: TypeId,
    pub params: Vec<ParamDecl>,
    pub storage: StorageClass,
    pub is_inline: bool,
    pub is_noreturn: bool,
    pub body: Stmt,
    pub sym: Option<SymbolId>,
}

#[derive(Debug)]
pub struct ParamDecl {
    pub name: Option<String>,
    pub ty: TypeId,
    pub loc: SourceLoc,
    pub sym: Option<SymbolId>,
}

/// One declaration statement, possibly declaring several names
/// (`int a, *b, c[3];`).
#[derive(Debug)]
pub struct Declaration {
    pub loc: SourceLoc,
    pub storage: StorageClass,
    pub is_inline: bool,
    pub is_noreturn: bool,
    pub items: Vec<InitDeclarator>,
    /// Enumerators introduced by enum specifiers in this declaration; the
    /// parser folds their values, the analyzer enters them in the symbol
    /// table.
    pub enum_constants: Vec<EnumConstantDef>,
}

#[derive(Debug, Clone)]
pub struct EnumConstantDef {
    pub name: String,
    pub value: i64,
    pub loc: SourceLoc,
    pub enum_ty: TypeId,
}

#[derive(Debug)]
pub struct InitDeclarator {
    pub name: String,
    pub loc: SourceLoc,
    pub ty: TypeId,
    pub init: Option<Initializer>,
    pub sym: Option<SymbolId>,
}

#[derive(Debug)]
pub enum Initializer {
    Expr(Expr),
    List { items: Vec<Initializer>, loc: SourceLoc },
}

#[derive(Debug)]
pub struct StaticAssert {
    pub cond: Expr,
    pub message: Option<Vec<u8>>,
    pub loc: SourceLoc,
}

// ---- statements ----------------------------------------------------------

#[derive(Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub enum BlockItem {
    Stmt(Stmt),
    Decl(Declaration),
    StaticAssert(StaticAssert),
}

#[derive(Debug)]
pub enum ForInit {
    Expr(Expr),
    Decl(Declaration),
}

#[derive(Debug)]
pub enum StmtKind {
    Compound(Vec<BlockItem>),
    Expr(Expr),
    Null,
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
    },
    For {
        init: Option<Box<ForInit>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Switch {
        cond: Expr,
        body: Box<Stmt>,
        /// Distinct case values in document order, filled by the analyzer.
        cases: Vec<i64>,
        has_default: bool,
    },
    Case {
        value_expr: Expr,
        /// Constant-evaluated case value, filled by the analyzer.
        value: i64,
        body: Box<Stmt>,
    },
    Default(Box<Stmt>),
    Break,
    Continue,
    Return(Option<Expr>),
    Goto {
        label: String,
        sym: Option<SymbolId>,
    },
    Label {
        name: String,
        body: Box<Stmt>,
        sym: Option<SymbolId>,
    },
}

// ---- expressions ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    LogAnd,
    LogOr,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::BitOr => "|",
            BinaryOp::LogAnd => "&&",
            BinaryOp::LogOr => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Neg,
    BitNot,
    LogNot,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    Deref,
    AddrOf,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Neg => "-",
            UnaryOp::BitNot => "~",
            UnaryOp::LogNot => "!",
            UnaryOp::PreInc | UnaryOp::PostInc => "++",
            UnaryOp::PreDec | UnaryOp::PostDec => "--",
            UnaryOp::Deref => "*",
            UnaryOp::AddrOf => "&",
        }
    }
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: SourceLoc,
    /// Filled by semantic analysis; always an interned id of the session's
    /// type table afterwards.
    pub ty: Option<TypeId>,
}

impl Expr {
    pub fn new(kind: ExprKind, loc: SourceLoc) -> Self {
        Expr {
            kind,
            loc,
            ty: None,
        }
    }

    /// The analyzed type; only valid after semantic analysis.
    pub fn type_id(&self) -> TypeId {
        self.ty.expect("expression not analyzed")
    }
}

#[derive(Debug)]
pub enum ExprKind {
    IntLit {
        value: u64,
        suffix: IntSuffix,
        decimal: bool,
    },
    FloatLit {
        value: f64,
        is_f32: bool,
    },
    CharLit(i64),
    StrLit(Vec<u8>),
    Ident {
        name: String,
        sym: Option<SymbolId>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `lhs = rhs` or `lhs op= rhs`.
    Assign {
        op: Option<BinaryOp>,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Member {
        base: Box<Expr>,
        member: String,
        arrow: bool,
        /// Field index in the record, filled by the analyzer.
        field_index: Option<usize>,
    },
    Cast {
        to: TypeId,
        operand: Box<Expr>,
    },
    /// Conversion inserted by the analyzer (usual arithmetic conversions,
    /// decay, assignment conversion).
    ImplicitCast {
        to: TypeId,
        operand: Box<Expr>,
    },
    SizeofExpr(Box<Expr>),
    SizeofType(TypeId),
    Comma {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Lvalue-ness is implicit in the node kind.
    pub fn is_lvalue(&self) -> bool {
        match &self.kind {
            ExprKind::Ident { .. }
            | ExprKind::Index { .. }
            | ExprKind::StrLit(_) => true,
            ExprKind::Member { base, arrow, .. } => *arrow || base.is_lvalue(),
            ExprKind::Unary { op, .. } => *op == UnaryOp::Deref,
            _ => false,
        }
    }
}

// ---- dump ----------------------------------------------------------------

/// Pretty-print the tree for `-dump-ast` / `-dump-sema`. Types appear when
/// the analyzer has filled them.
pub fn dump(unit: &TranslationUnit, types: &TypeTable) -> String {
    let mut p = Printer {
        out: String::new(),
        types,
        depth: 0,
    };
    for decl in &unit.decls {
        p.external_decl(decl);
    }
    p.out
}

struct Printer<'a> {
    out: String,
    types: &'a TypeTable,
    depth: usize,
}

impl Printer<'_> {
    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn nested(&mut self, f: impl FnOnce(&mut Self)) {
        self.depth += 1;
        f(self);
        self.depth -= 1;
    }

    fn external_decl(&mut self, decl: &ExternalDecl) {
        match decl {
            ExternalDecl::Function(func) => {
                self.line(format!(
                    "function {} '{}' <{}>",
                    func.name,
                    self.types.display(func.ty),
                    func.loc
                ));
                self.nested(|p| p.stmt(&func.body));
            }
            ExternalDecl::Declaration(decl) => self.declaration(decl),
            ExternalDecl::StaticAssert(sa) => {
                self.line(format!("static-assert <{}>", sa.loc));
                self.nested(|p| p.expr(&sa.cond));
            }
        }
    }

    fn declaration(&mut self, decl: &Declaration) {
        for item in &decl.items {
            self.line(format!(
                "decl {} '{}' <{}>",
                item.name,
                self.types.display(item.ty),
                item.loc
            ));
            if let Some(init) = &item.init {
                self.nested(|p| p.initializer(init));
            }
        }
    }

    fn initializer(&mut self, init: &Initializer) {
        match init {
            Initializer::Expr(e) => self.expr(e),
            Initializer::List { items, .. } => {
                self.line("init-list");
                self.nested(|p| {
                    for item in items {
                        p.initializer(item);
                    }
                });
            }
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Compound(items) => {
                self.line("compound");
                self.nested(|p| {
                    for item in items {
                        match item {
                            BlockItem::Stmt(s) => p.stmt(s),
                            BlockItem::Decl(d) => p.declaration(d),
                            BlockItem::StaticAssert(sa) => {
                                p.line(format!("static-assert <{}>", sa.loc));
                            }
                        }
                    }
                });
            }
            StmtKind::Expr(e) => {
                self.line("expr-stmt");
                self.nested(|p| p.expr(e));
            }
            StmtKind::Null => self.line("null-stmt"),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.line("if");
                self.nested(|p| {
                    p.expr(cond);
                    p.stmt(then_branch);
                    if let Some(e) = else_branch {
                        p.stmt(e);
                    }
                });
            }
            StmtKind::While { cond, body } => {
                self.line("while");
                self.nested(|p| {
                    p.expr(cond);
                    p.stmt(body);
                });
            }
            StmtKind::DoWhile { body, cond } => {
                self.line("do-while");
                self.nested(|p| {
                    p.stmt(body);
                    p.expr(cond);
                });
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.line("for");
                self.nested(|p| {
                    match init.as_deref() {
                        Some(ForInit::Expr(e)) => p.expr(e),
                        Some(ForInit::Decl(d)) => p.declaration(d),
                        None => {}
                    }
                    if let Some(c) = cond {
                        p.expr(c);
                    }
                    if let Some(s) = step {
                        p.expr(s);
                    }
                    p.stmt(body);
                });
            }
            StmtKind::Switch { cond, body, .. } => {
                self.line("switch");
                self.nested(|p| {
                    p.expr(cond);
                    p.stmt(body);
                });
            }
            StmtKind::Case {
                value_expr, body, ..
            } => {
                self.line("case");
                self.nested(|p| {
                    p.expr(value_expr);
                    p.stmt(body);
                });
            }
            StmtKind::Default(body) => {
                self.line("default");
                self.nested(|p| p.stmt(body));
            }
            StmtKind::Break => self.line("break"),
            StmtKind::Continue => self.line("continue"),
            StmtKind::Return(e) => {
                self.line("return");
                if let Some(e) = e {
                    self.nested(|p| p.expr(e));
                }
            }
            StmtKind::Goto { label, .. } => self.line(format!("goto {}", label)),
            StmtKind::Label { name, body, .. } => {
                self.line(format!("label {}", name));
                self.nested(|p| p.stmt(body));
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        let ty = match expr.ty {
            Some(id) => format!(" '{}'", self.types.display(id)),
            None => String::new(),
        };
        match &expr.kind {
            ExprKind::IntLit { value, .. } => self.line(format!("int-lit {}{}", value, ty)),
            ExprKind::FloatLit { value, .. } => self.line(format!("float-lit {}{}", value, ty)),
            ExprKind::CharLit(v) => self.line(format!("char-lit {}{}", v, ty)),
            ExprKind::StrLit(bytes) => {
                let mut repr = String::new();
                for &b in bytes.iter().take(24) {
                    if (0x20..0x7f).contains(&b) {
                        repr.push(b as char);
                    } else {
                        let _ = write!(repr, "\\x{:02x}", b);
                    }
                }
                self.line(format!("str-lit \"{}\"{}", repr, ty));
            }
            ExprKind::Ident { name, .. } => self.line(format!("ident {}{}", name, ty)),
            ExprKind::Unary { op, operand } => {
                self.line(format!("unary {}{}", op.symbol(), ty));
                self.nested(|p| p.expr(operand));
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.line(format!("binary {}{}", op.symbol(), ty));
                self.nested(|p| {
                    p.expr(lhs);
                    p.expr(rhs);
                });
            }
            ExprKind::Assign { op, lhs, rhs } => {
                let op_text = op.map(|o| format!("{}=", o.symbol())).unwrap_or("=".into());
                self.line(format!("assign {}{}", op_text, ty));
                self.nested(|p| {
                    p.expr(lhs);
                    p.expr(rhs);
                });
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.line(format!("ternary{}", ty));
                self.nested(|p| {
                    p.expr(cond);
                    p.expr(then_expr);
                    p.expr(else_expr);
                });
            }
            ExprKind::Call { callee, args } => {
                self.line(format!("call{}", ty));
                self.nested(|p| {
                    p.expr(callee);
                    for a in args {
                        p.expr(a);
                    }
                });
            }
            ExprKind::Index { base, index } => {
                self.line(format!("index{}", ty));
                self.nested(|p| {
                    p.expr(base);
                    p.expr(index);
                });
            }
            ExprKind::Member {
                base,
                member,
                arrow,
                ..
            } => {
                let op = if *arrow { "->" } else { "." };
                self.line(format!("member {}{}{}", op, member, ty));
                self.nested(|p| p.expr(base));
            }
            ExprKind::Cast { to, operand } => {
                self.line(format!("cast to '{}'{}", self.types.display(*to), ty));
                self.nested(|p| p.expr(operand));
            }
            ExprKind::ImplicitCast { to, operand } => {
                self.line(format!(
                    "implicit-cast to '{}'{}",
                    self.types.display(*to),
                    ty
                ));
                self.nested(|p| p.expr(operand));
            }
            ExprKind::SizeofExpr(e) => {
                self.line(format!("sizeof-expr{}", ty));
                self.nested(|p| p.expr(e));
            }
            ExprKind::SizeofType(t) => {
                self.line(format!("sizeof '{}'{}", self.types.display(*t), ty));
            }
            ExprKind::Comma { lhs, rhs } => {
                self.line(format!("comma{}", ty));
                self.nested(|p| {
                    p.expr(lhs);
                    p.expr(rhs);
                });
            }
        }
    }
}
