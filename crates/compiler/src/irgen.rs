//! AST to IR lowering
//!
//! Consumes the semantically-annotated AST and produces the module's
//! functions and globals. Every implicit conversion the analyzer inserted
//! becomes an explicit conversion instruction; control flow becomes basic
//! blocks with a single terminator each; short-circuit operators and the
//! conditional operator merge through φ-nodes.
//!
//! Addressing follows the C lvalue structure: `lvalue_addr` produces a
//! pointer value for anything assignable (locals are `alloca`s, globals
//! are symbol references, members are `struct_gep`s, elements are
//! `gep`s), and `rvalue` loads through it unless the type is an array or
//! function (which decay to the address itself).

use crate::ast::*;
use crate::const_eval;
use crate::diag::Diagnostics;
use crate::ir::*;
use crate::symbols::{StorageClass, SymbolId, SymbolKind, SymbolTable};
use crate::types::{TypeId, TypeKind, TypeTable};
use std::collections::HashMap;
use std::rc::Rc;

pub struct IrGen<'a> {
    types: &'a TypeTable,
    symbols: &'a SymbolTable,
    module: &'a mut Module,
    diags: &'a mut Diagnostics,
    ptr_bytes: u64,
    static_counter: u32,
}

struct SwitchLower {
    case_blocks: HashMap<i64, BlockId>,
    default_block: Option<BlockId>,
    end: BlockId,
}

/// Per-function lowering state.
struct FuncCtx {
    func: Function,
    cur: BlockId,
    /// Whether the current block already has a terminator.
    terminated: bool,
    vars: HashMap<SymbolId, ValueId>,
    labels: HashMap<SymbolId, BlockId>,
    break_stack: Vec<BlockId>,
    continue_stack: Vec<BlockId>,
    switch_stack: Vec<SwitchLower>,
    block_counter: u32,
}

impl FuncCtx {
    fn fresh_block(&mut self, hint: &str) -> BlockId {
        self.block_counter += 1;
        let name = format!("{}_{}", hint, self.block_counter);
        self.func.add_block(name)
    }

    fn switch_to(&mut self, block: BlockId) {
        self.cur = block;
        self.terminated = false;
    }

    fn push(&mut self, inst: Inst, ty: IrType) -> ValueId {
        debug_assert!(!self.terminated, "instruction after terminator");
        let terminates = inst.op.is_terminator();
        let id = self.func.push_inst(self.cur, inst, ty);
        if terminates {
            self.terminated = true;
        }
        id
    }

    fn const_int(&mut self, value: i64, ty: IrType) -> ValueId {
        self.func.add_value(ValueKind::ConstInt(value), ty)
    }

    fn branch(&mut self, target: BlockId) {
        if self.terminated {
            return;
        }
        let mut inst = Inst::simple(Opcode::Br, vec![]);
        inst.blocks = [Some(target), None];
        self.push(inst, IrType::Void);
    }

    fn branch_cond(&mut self, cond: ValueId, t: BlockId, f: BlockId) {
        let mut inst = Inst::simple(Opcode::BrCond, vec![cond]);
        inst.blocks = [Some(t), Some(f)];
        self.push(inst, IrType::Void);
    }
}

impl<'a> IrGen<'a> {
    pub fn new(
        types: &'a TypeTable,
        symbols: &'a SymbolTable,
        module: &'a mut Module,
        diags: &'a mut Diagnostics,
    ) -> Self {
        let ptr_bytes = types.layout().ptr_bytes;
        IrGen {
            types,
            symbols,
            module,
            diags,
            ptr_bytes,
            static_counter: 0,
        }
    }

    pub fn lower_unit(&mut self, unit: &TranslationUnit) {
        for decl in &unit.decls {
            match decl {
                ExternalDecl::Function(func) => self.lower_function(func),
                ExternalDecl::Declaration(decl) => self.lower_global_decl(decl),
                ExternalDecl::StaticAssert(_) => {}
            }
        }
    }

    // ---- type mapping ----------------------------------------------------

    fn ir_type(&self, ty: TypeId) -> IrType {
        let unq = self.types.unqualified(ty);
        match self.types.kind(unq) {
            TypeKind::Void => IrType::Void,
            TypeKind::Bool => IrType::U8,
            TypeKind::Int { bits, signed } => match (bits, signed) {
                (8, true) => IrType::I8,
                (8, false) => IrType::U8,
                (16, true) => IrType::I16,
                (16, false) => IrType::U16,
                (32, true) => IrType::I32,
                (32, false) => IrType::U32,
                (_, true) => IrType::I64,
                (_, false) => IrType::U64,
            },
            TypeKind::Float { bits: 32 } => IrType::F32,
            TypeKind::Float { .. } => IrType::F64,
            TypeKind::Enum { .. } => IrType::I32,
            TypeKind::Ptr(p) => IrType::Ptr(Box::new(self.ir_type(*p))),
            TypeKind::Array { elem, len } => {
                IrType::Array(Box::new(self.ir_type(*elem)), len.unwrap_or(0))
            }
            TypeKind::Record { fields, size, align, .. } => IrType::Struct(Rc::new(StructType {
                fields: fields.iter().map(|f| self.ir_type(f.ty)).collect(),
                offsets: fields.iter().map(|f| f.offset).collect(),
                size: *size,
                align: *align,
            })),
            TypeKind::Func { .. } => IrType::Func(Rc::new(self.func_sig(unq))),
            TypeKind::Qualified { .. } => unreachable!("unqualified above"),
        }
    }

    fn func_sig(&self, ty: TypeId) -> FuncType {
        match self.types.kind(self.types.unqualified(ty)) {
            TypeKind::Func {
                ret,
                params,
                variadic,
                ..
            } => FuncType {
                ret: self.ir_type(*ret),
                params: params.iter().map(|p| self.ir_type(*p)).collect(),
                variadic: *variadic,
            },
            _ => FuncType {
                ret: IrType::I32,
                params: Vec::new(),
                variadic: false,
            },
        }
    }

    // ---- globals ---------------------------------------------------------

    fn lower_global_decl(&mut self, decl: &Declaration) {
        if decl.storage == StorageClass::Typedef {
            return;
        }
        for item in &decl.items {
            let Some(sym) = item.sym else { continue };
            let symbol = self.symbols.symbol(sym);
            match symbol.kind {
                SymbolKind::Function => {
                    // Forward declaration: referenced by name at call
                    // sites, nothing to emit.
                }
                SymbolKind::Variable => {
                    if decl.storage == StorageClass::Extern && item.init.is_none() {
                        continue;
                    }
                    if self.module.globals.iter().any(|g| g.name == item.name) {
                        // Tentative re-declaration in a later unit.
                        continue;
                    }
                    let ty = self.ir_type(item.ty);
                    let align = ty.align(self.ptr_bytes);
                    let init = match &item.init {
                        Some(init) => self.global_init(init, item.ty),
                        None => GlobalInit::Zero,
                    };
                    self.module.globals.push(Global {
                        name: item.name.clone(),
                        ty,
                        init,
                        align,
                        is_static: decl.storage == StorageClass::Static,
                    });
                }
                _ => {}
            }
        }
    }

    fn global_init(&mut self, init: &Initializer, ty: TypeId) -> GlobalInit {
        match init {
            Initializer::Expr(e) => self.global_scalar_init(e, ty),
            Initializer::List { items, .. } => {
                if let Some(elem) = self.types.element(ty) {
                    let declared = self.types.array_len(ty).unwrap_or(items.len() as u64);
                    let mut values: Vec<GlobalInit> = items
                        .iter()
                        .map(|i| self.global_init(i, elem))
                        .collect();
                    while (values.len() as u64) < declared {
                        values.push(GlobalInit::Zero);
                    }
                    GlobalInit::Array(values)
                } else if let Some(fields) = self.types.record_fields(ty) {
                    let field_types: Vec<TypeId> = fields
                        .iter()
                        .filter(|f| !f.promoted)
                        .map(|f| f.ty)
                        .collect();
                    let mut values = Vec::new();
                    for (i, fty) in field_types.iter().enumerate() {
                        match items.get(i) {
                            Some(item) => values.push(self.global_init(item, *fty)),
                            None => values.push(GlobalInit::Zero),
                        }
                    }
                    GlobalInit::Array(values)
                } else if let Some(first) = items.first() {
                    self.global_init(first, ty)
                } else {
                    GlobalInit::Zero
                }
            }
        }
    }

    fn global_scalar_init(&mut self, e: &Expr, ty: TypeId) -> GlobalInit {
        // Strings: either a pointer into the pool or an in-place char
        // array.
        let mut inner = e;
        while let ExprKind::ImplicitCast { operand, .. } = &inner.kind {
            inner = operand;
        }
        if let ExprKind::StrLit(bytes) = &inner.kind {
            if self.types.is_array(ty) {
                let len = self.types.array_len(ty).unwrap_or(bytes.len() as u64 + 1);
                let mut values: Vec<GlobalInit> = bytes
                    .iter()
                    .take(len as usize)
                    .map(|&b| GlobalInit::Int(b as i64))
                    .collect();
                while (values.len() as u64) < len {
                    values.push(GlobalInit::Zero);
                }
                return GlobalInit::Array(values);
            }
            let idx = self.module.intern_string(bytes);
            return GlobalInit::StrPtr(idx);
        }
        if self.types.is_float(ty) {
            if let Some(v) = self.fold_float(e) {
                return GlobalInit::Float(v);
            }
        }
        match const_eval::eval(e, self.types, Some(self.symbols), self.diags) {
            Some(v) => GlobalInit::Int(v),
            None => GlobalInit::Zero,
        }
    }

    fn fold_float(&mut self, e: &Expr) -> Option<f64> {
        match &e.kind {
            ExprKind::FloatLit { value, .. } => Some(*value),
            ExprKind::ImplicitCast { operand, .. } | ExprKind::Cast { operand, .. } => {
                if let Some(v) = self.fold_float(operand) {
                    return Some(v);
                }
                const_eval::eval(operand, self.types, Some(self.symbols), self.diags)
                    .map(|v| v as f64)
            }
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => self.fold_float(operand).map(|v| -v),
            _ => const_eval::eval(e, self.types, Some(self.symbols), self.diags)
                .map(|v| v as f64),
        }
    }

    // ---- functions -------------------------------------------------------

    fn lower_function(&mut self, def: &FunctionDef) {
        let sig = Rc::new(self.func_sig(def.ty));
        let mut func = Function::new(def.name.clone(), sig.clone(), false);
        let entry = func.add_block("entry");
        let mut ctx = FuncCtx {
            func,
            cur: entry,
            terminated: false,
            vars: HashMap::new(),
            labels: HashMap::new(),
            break_stack: Vec::new(),
            continue_stack: Vec::new(),
            switch_stack: Vec::new(),
            block_counter: 0,
        };

        // Parameters land in stack homes immediately; everything after
        // that is loads and stores against the allocas.
        for (i, param) in def.params.iter().enumerate() {
            let Some(sym) = param.sym else { continue };
            let pty = self.ir_type(param.ty);
            let mut alloca = Inst::simple(Opcode::Alloca, vec![]);
            alloca.aux = Some(pty.clone());
            let slot = ctx.push(alloca, IrType::Ptr(Box::new(pty.clone())));
            let arg = ctx.func.add_value(ValueKind::Param(i), pty);
            ctx.push(Inst::simple(Opcode::Store, vec![arg, slot]), IrType::Void);
            ctx.vars.insert(sym, slot);
        }

        self.lower_stmt(&mut ctx, &def.body);

        // Fall off the end: synthesize the return.
        if !ctx.terminated {
            if sig.ret == IrType::Void {
                ctx.push(Inst::simple(Opcode::Ret, vec![]), IrType::Void);
            } else {
                let zero = ctx.const_int(0, sig.ret.clone());
                ctx.push(Inst::simple(Opcode::Ret, vec![zero]), IrType::Void);
            }
        }

        // Replace any earlier declaration of the same function.
        let lowered = ctx.func;
        if let Some(existing) = self
            .module
            .functions
            .iter_mut()
            .find(|f| f.name == lowered.name)
        {
            *existing = lowered;
        } else {
            self.module.functions.push(lowered);
        }
    }

    // ---- statements ------------------------------------------------------

    fn lower_stmt(&mut self, ctx: &mut FuncCtx, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Compound(items) => {
                for item in items {
                    if ctx.terminated {
                        // Dead code after a terminator still needs a home
                        // so the block invariants hold.
                        let dead = ctx.fresh_block("dead");
                        ctx.switch_to(dead);
                    }
                    match item {
                        BlockItem::Stmt(s) => self.lower_stmt(ctx, s),
                        BlockItem::Decl(d) => self.lower_local_decl(ctx, d),
                        BlockItem::StaticAssert(_) => {}
                    }
                }
            }
            StmtKind::Expr(e) => {
                self.rvalue(ctx, e);
            }
            StmtKind::Null => {}
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond_v = self.rvalue(ctx, cond);
                let then_b = ctx.fresh_block("if_then");
                let end_b = ctx.fresh_block("if_end");
                let else_b = match else_branch {
                    Some(_) => ctx.fresh_block("if_else"),
                    None => end_b,
                };
                ctx.branch_cond(cond_v, then_b, else_b);
                ctx.switch_to(then_b);
                self.lower_stmt(ctx, then_branch);
                ctx.branch(end_b);
                if let Some(else_stmt) = else_branch {
                    ctx.switch_to(else_b);
                    self.lower_stmt(ctx, else_stmt);
                    ctx.branch(end_b);
                }
                ctx.switch_to(end_b);
            }
            StmtKind::While { cond, body } => {
                let cond_b = ctx.fresh_block("while_cond");
                let body_b = ctx.fresh_block("while_body");
                let end_b = ctx.fresh_block("while_end");
                ctx.branch(cond_b);
                ctx.switch_to(cond_b);
                let cond_v = self.rvalue(ctx, cond);
                ctx.branch_cond(cond_v, body_b, end_b);
                ctx.break_stack.push(end_b);
                ctx.continue_stack.push(cond_b);
                ctx.switch_to(body_b);
                self.lower_stmt(ctx, body);
                ctx.branch(cond_b);
                ctx.break_stack.pop();
                ctx.continue_stack.pop();
                ctx.switch_to(end_b);
            }
            StmtKind::DoWhile { body, cond } => {
                let body_b = ctx.fresh_block("do_body");
                let cond_b = ctx.fresh_block("do_cond");
                let end_b = ctx.fresh_block("do_end");
                ctx.branch(body_b);
                ctx.break_stack.push(end_b);
                ctx.continue_stack.push(cond_b);
                ctx.switch_to(body_b);
                self.lower_stmt(ctx, body);
                ctx.branch(cond_b);
                ctx.switch_to(cond_b);
                let cond_v = self.rvalue(ctx, cond);
                ctx.branch_cond(cond_v, body_b, end_b);
                ctx.break_stack.pop();
                ctx.continue_stack.pop();
                ctx.switch_to(end_b);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                match init.as_deref() {
                    Some(ForInit::Expr(e)) => {
                        self.rvalue(ctx, e);
                    }
                    Some(ForInit::Decl(d)) => self.lower_local_decl(ctx, d),
                    None => {}
                }
                let cond_b = ctx.fresh_block("for_cond");
                let body_b = ctx.fresh_block("for_body");
                let step_b = ctx.fresh_block("for_step");
                let end_b = ctx.fresh_block("for_end");
                ctx.branch(cond_b);
                ctx.switch_to(cond_b);
                match cond {
                    Some(c) => {
                        let v = self.rvalue(ctx, c);
                        ctx.branch_cond(v, body_b, end_b);
                    }
                    None => ctx.branch(body_b),
                }
                ctx.break_stack.push(end_b);
                ctx.continue_stack.push(step_b);
                ctx.switch_to(body_b);
                self.lower_stmt(ctx, body);
                ctx.branch(step_b);
                ctx.switch_to(step_b);
                if let Some(s) = step {
                    self.rvalue(ctx, s);
                }
                ctx.branch(cond_b);
                ctx.break_stack.pop();
                ctx.continue_stack.pop();
                ctx.switch_to(end_b);
            }
            StmtKind::Switch {
                cond,
                body,
                cases,
                has_default,
            } => {
                let cond_v = self.rvalue(ctx, cond);
                let cond_ty = ctx.func.value(cond_v).ty.clone();
                let end_b = ctx.fresh_block("switch_end");
                let mut case_blocks = HashMap::new();
                for value in cases {
                    case_blocks.insert(*value, ctx.fresh_block("case"));
                }
                let default_block = has_default.then(|| ctx.fresh_block("default"));

                // Dispatch: a compare-and-branch chain in document order.
                for value in cases {
                    let target = case_blocks[value];
                    let next = ctx.fresh_block("switch_test");
                    let cval = ctx.const_int(*value, cond_ty.clone());
                    let cmp = ctx.push(
                        Inst::simple(Opcode::CmpEq, vec![cond_v, cval]),
                        IrType::I32,
                    );
                    ctx.branch_cond(cmp, target, next);
                    ctx.switch_to(next);
                }
                ctx.branch(default_block.unwrap_or(end_b));

                ctx.break_stack.push(end_b);
                ctx.switch_stack.push(SwitchLower {
                    case_blocks,
                    default_block,
                    end: end_b,
                });
                // The body starts unreachable; case labels switch blocks.
                let dead = ctx.fresh_block("switch_body");
                ctx.switch_to(dead);
                ctx.terminated = false;
                self.lower_stmt(ctx, body);
                ctx.branch(end_b);
                ctx.switch_stack.pop();
                ctx.break_stack.pop();
                ctx.switch_to(end_b);
            }
            StmtKind::Case { value, body, .. } => {
                let target = ctx
                    .switch_stack
                    .last()
                    .and_then(|s| s.case_blocks.get(value).copied());
                if let Some(target) = target {
                    // Fallthrough from the previous case.
                    ctx.branch(target);
                    ctx.switch_to(target);
                }
                self.lower_stmt(ctx, body);
            }
            StmtKind::Default(body) => {
                let target = ctx.switch_stack.last().and_then(|s| s.default_block);
                if let Some(target) = target {
                    ctx.branch(target);
                    ctx.switch_to(target);
                }
                self.lower_stmt(ctx, body);
            }
            StmtKind::Break => {
                if let Some(&target) = ctx.break_stack.last() {
                    ctx.branch(target);
                }
            }
            StmtKind::Continue => {
                if let Some(&target) = ctx.continue_stack.last() {
                    ctx.branch(target);
                }
            }
            StmtKind::Return(value) => {
                match value {
                    Some(e) => {
                        let v = self.rvalue(ctx, e);
                        ctx.push(Inst::simple(Opcode::Ret, vec![v]), IrType::Void);
                    }
                    None => {
                        ctx.push(Inst::simple(Opcode::Ret, vec![]), IrType::Void);
                    }
                }
            }
            StmtKind::Goto { sym, .. } => {
                if let Some(sym) = sym {
                    let target = self.label_block(ctx, *sym);
                    ctx.branch(target);
                }
            }
            StmtKind::Label { body, sym, .. } => {
                if let Some(sym) = sym {
                    let target = self.label_block(ctx, *sym);
                    ctx.branch(target);
                    ctx.switch_to(target);
                }
                self.lower_stmt(ctx, body);
            }
        }
    }

    fn label_block(&mut self, ctx: &mut FuncCtx, sym: SymbolId) -> BlockId {
        if let Some(&b) = ctx.labels.get(&sym) {
            return b;
        }
        let name = format!("label_{}", self.symbols.symbol(sym).name);
        let b = ctx.func.add_block(name);
        ctx.labels.insert(sym, b);
        b
    }

    fn lower_local_decl(&mut self, ctx: &mut FuncCtx, decl: &Declaration) {
        if decl.storage == StorageClass::Typedef {
            return;
        }
        for item in &decl.items {
            let Some(sym) = item.sym else { continue };
            let symbol = self.symbols.symbol(sym);
            match symbol.kind {
                SymbolKind::Variable => {
                    if decl.storage == StorageClass::Static {
                        // Function-local static: storage is a module
                        // global under a unit-unique name.
                        self.static_counter += 1;
                        let gname =
                            format!("{}.{}.{}", ctx.func.name, item.name, self.static_counter);
                        let ty = self.ir_type(item.ty);
                        let align = ty.align(self.ptr_bytes);
                        let init = match &item.init {
                            Some(init) => self.global_init(init, item.ty),
                            None => GlobalInit::Zero,
                        };
                        self.module.globals.push(Global {
                            name: gname.clone(),
                            ty: ty.clone(),
                            init,
                            align,
                            is_static: true,
                        });
                        let addr = ctx
                            .func
                            .add_value(ValueKind::Global(gname), IrType::Ptr(Box::new(ty)));
                        ctx.vars.insert(sym, addr);
                        continue;
                    }
                    if decl.storage == StorageClass::Extern {
                        let ty = self.ir_type(item.ty);
                        let addr = ctx.func.add_value(
                            ValueKind::Global(item.name.clone()),
                            IrType::Ptr(Box::new(ty)),
                        );
                        ctx.vars.insert(sym, addr);
                        continue;
                    }
                    let ty = self.ir_type(item.ty);
                    let mut alloca = Inst::simple(Opcode::Alloca, vec![]);
                    alloca.aux = Some(ty.clone());
                    let slot = ctx.push(alloca, IrType::Ptr(Box::new(ty.clone())));
                    ctx.vars.insert(sym, slot);
                    if let Some(init) = &item.init {
                        self.lower_local_init(ctx, slot, init, item.ty);
                    }
                }
                _ => {}
            }
        }
    }

    fn lower_local_init(
        &mut self,
        ctx: &mut FuncCtx,
        slot: ValueId,
        init: &Initializer,
        ty: TypeId,
    ) {
        match init {
            Initializer::Expr(e) => {
                // Char arrays initialized from a string literal copy
                // byte by byte.
                if self.types.is_array(ty) {
                    let mut inner = e;
                    while let ExprKind::ImplicitCast { operand, .. } = &inner.kind {
                        inner = operand;
                    }
                    if let ExprKind::StrLit(bytes) = &inner.kind {
                        let len = self.types.array_len(ty).unwrap_or(bytes.len() as u64 + 1);
                        let elem_ir = IrType::I8;
                        for i in 0..len {
                            let byte = bytes.get(i as usize).copied().unwrap_or(0);
                            let idx = ctx.const_int(i as i64, IrType::I64);
                            let mut gep = Inst::simple(Opcode::Gep, vec![slot, idx]);
                            gep.aux = Some(elem_ir.clone());
                            let addr =
                                ctx.push(gep, IrType::Ptr(Box::new(elem_ir.clone())));
                            let v = ctx.const_int(byte as i64, elem_ir.clone());
                            ctx.push(Inst::simple(Opcode::Store, vec![v, addr]), IrType::Void);
                        }
                        return;
                    }
                }
                let v = self.rvalue(ctx, e);
                ctx.push(Inst::simple(Opcode::Store, vec![v, slot]), IrType::Void);
            }
            Initializer::List { items, .. } => {
                if let Some(elem) = self.types.element(ty) {
                    let elem_ir = self.ir_type(elem);
                    let declared = self.types.array_len(ty).unwrap_or(items.len() as u64);
                    for i in 0..declared {
                        let idx = ctx.const_int(i as i64, IrType::I64);
                        let mut gep = Inst::simple(Opcode::Gep, vec![slot, idx]);
                        gep.aux = Some(elem_ir.clone());
                        let addr = ctx.push(gep, IrType::Ptr(Box::new(elem_ir.clone())));
                        match items.get(i as usize) {
                            Some(item) => self.lower_local_init(ctx, addr, item, elem),
                            None => {
                                let zero = ctx.const_int(0, elem_ir.clone());
                                ctx.push(
                                    Inst::simple(Opcode::Store, vec![zero, addr]),
                                    IrType::Void,
                                );
                            }
                        }
                    }
                } else if self.types.is_record(ty) {
                    let struct_ir = self.ir_type(ty);
                    let fields: Vec<(usize, TypeId)> = self
                        .types
                        .record_fields(ty)
                        .map(|fs| {
                            fs.iter()
                                .enumerate()
                                .filter(|(_, f)| !f.promoted)
                                .map(|(i, f)| (i, f.ty))
                                .collect()
                        })
                        .unwrap_or_default();
                    for (i, fty) in fields {
                        let fty_ir = self.ir_type(fty);
                        let mut gep = Inst::simple(Opcode::StructGep, vec![slot]);
                        gep.aux = Some(struct_ir.clone());
                        gep.field = i as u32;
                        let addr = ctx.push(gep, IrType::Ptr(Box::new(fty_ir.clone())));
                        match items.get(i) {
                            Some(item) => self.lower_local_init(ctx, addr, item, fty),
                            None => {
                                let zero = ctx.const_int(0, fty_ir);
                                ctx.push(
                                    Inst::simple(Opcode::Store, vec![zero, addr]),
                                    IrType::Void,
                                );
                            }
                        }
                    }
                } else if let Some(first) = items.first() {
                    self.lower_local_init(ctx, slot, first, ty);
                }
            }
        }
    }

    // ---- expressions -----------------------------------------------------

    /// Address of an lvalue expression.
    fn lvalue_addr(&mut self, ctx: &mut FuncCtx, e: &Expr) -> ValueId {
        match &e.kind {
            ExprKind::Ident { sym, .. } => {
                let sym = sym.expect("identifier resolved by analysis");
                if let Some(&slot) = ctx.vars.get(&sym) {
                    return slot;
                }
                let symbol = self.symbols.symbol(sym);
                let ty = self.ir_type(symbol.ty);
                match symbol.kind {
                    SymbolKind::Function => ctx
                        .func
                        .add_value(ValueKind::FuncRef(symbol.name.clone()), ty),
                    _ => ctx.func.add_value(
                        ValueKind::Global(symbol.name.clone()),
                        IrType::Ptr(Box::new(ty)),
                    ),
                }
            }
            ExprKind::StrLit(bytes) => {
                let idx = self.module.intern_string(bytes);
                ctx.func.add_value(
                    ValueKind::ConstString(idx),
                    IrType::Ptr(Box::new(IrType::I8)),
                )
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => self.rvalue(ctx, operand),
            ExprKind::Index { base, index } => {
                let base_v = self.rvalue(ctx, base);
                let index_v = self.rvalue(ctx, index);
                let elem = self.ir_type(e.type_id());
                let mut gep = Inst::simple(Opcode::Gep, vec![base_v, index_v]);
                gep.aux = Some(elem.clone());
                ctx.push(gep, IrType::Ptr(Box::new(elem)))
            }
            ExprKind::Member {
                base,
                arrow,
                field_index,
                ..
            } => {
                let field_index = field_index.expect("member resolved by analysis");
                let (base_addr, record_ty) = if *arrow {
                    let v = self.rvalue(ctx, base);
                    let rec = self
                        .types
                        .pointee(base.type_id())
                        .expect("arrow base is a pointer");
                    (v, rec)
                } else {
                    (self.lvalue_addr(ctx, base), base.type_id())
                };
                let struct_ir = self.ir_type(record_ty);
                let fty = self.ir_type(e.type_id());
                let mut gep = Inst::simple(Opcode::StructGep, vec![base_addr]);
                gep.aux = Some(struct_ir);
                gep.field = field_index as u32;
                ctx.push(gep, IrType::Ptr(Box::new(fty)))
            }
            ExprKind::ImplicitCast { operand, .. } | ExprKind::Cast { operand, .. } => {
                self.lvalue_addr(ctx, operand)
            }
            other => {
                // The analyzer rejects non-lvalue assignments; reaching
                // here means expression statements like `*f()` that still
                // need a value.
                debug_assert!(false, "lvalue_addr on non-lvalue {:?}", other);
                let zero = ctx.const_int(0, IrType::I64);
                let mut inst = Inst::simple(Opcode::Inttoptr, vec![zero]);
                inst.aux = None;
                ctx.push(inst, IrType::Ptr(Box::new(IrType::I8)))
            }
        }
    }

    /// Bit-field metadata for a member access, when present.
    fn bitfield_of(&self, e: &Expr) -> Option<(u32, u32, bool)> {
        if let ExprKind::Member {
            base,
            arrow,
            field_index: Some(idx),
            ..
        } = &e.kind
        {
            let rec = if *arrow {
                self.types.pointee(base.type_id())?
            } else {
                base.type_id()
            };
            let field = self.types.record_fields(rec)?.get(*idx)?;
            let width = field.bit_width?;
            let signed = self.types.is_signed(field.ty);
            return Some((field.bit_offset, width, signed));
        }
        None
    }

    /// Load a value through an lvalue, honoring bit-fields.
    fn load_lvalue(&mut self, ctx: &mut FuncCtx, e: &Expr) -> ValueId {
        let addr = self.lvalue_addr(ctx, e);
        let ty = self.ir_type(e.type_id());
        // Arrays and functions do not load; their address is the value.
        if matches!(ty, IrType::Array(..) | IrType::Func(..)) {
            return addr;
        }
        let loaded = ctx.push(Inst::simple(Opcode::Load, vec![addr]), ty.clone());
        if let Some((bit_offset, width, signed)) = self.bitfield_of(e) {
            let unit_bits = (ty.size(self.ptr_bytes) * 8) as i64;
            let up = ctx.const_int(unit_bits - (bit_offset as i64 + width as i64), ty.clone());
            let shifted = ctx.push(Inst::simple(Opcode::Shl, vec![loaded, up]), ty.clone());
            let down = ctx.const_int(unit_bits - width as i64, ty.clone());
            let op = if signed { Opcode::Sar } else { Opcode::Shr };
            return ctx.push(Inst::simple(op, vec![shifted, down]), ty);
        }
        loaded
    }

    /// Store through an lvalue, honoring bit-fields. Returns the stored
    /// value (the assignment's result).
    fn store_lvalue(&mut self, ctx: &mut FuncCtx, e: &Expr, value: ValueId) -> ValueId {
        let addr = self.lvalue_addr(ctx, e);
        let ty = self.ir_type(e.type_id());
        if let Some((bit_offset, width, _)) = self.bitfield_of(e) {
            // Read-modify-write the storage unit.
            let old = ctx.push(Inst::simple(Opcode::Load, vec![addr]), ty.clone());
            let mask = (1i64 << width).wrapping_sub(1);
            let mask_v = ctx.const_int(mask, ty.clone());
            let clipped = ctx.push(Inst::simple(Opcode::And, vec![value, mask_v]), ty.clone());
            let off_v = ctx.const_int(bit_offset as i64, ty.clone());
            let placed = ctx.push(Inst::simple(Opcode::Shl, vec![clipped, off_v]), ty.clone());
            let hole = ctx.const_int(!(mask << bit_offset), ty.clone());
            let cleared = ctx.push(Inst::simple(Opcode::And, vec![old, hole]), ty.clone());
            let merged = ctx.push(Inst::simple(Opcode::Or, vec![cleared, placed]), ty.clone());
            ctx.push(Inst::simple(Opcode::Store, vec![merged, addr]), IrType::Void);
            return clipped;
        }
        ctx.push(Inst::simple(Opcode::Store, vec![value, addr]), IrType::Void);
        value
    }

    fn rvalue(&mut self, ctx: &mut FuncCtx, e: &Expr) -> ValueId {
        match &e.kind {
            ExprKind::IntLit { value, .. } => {
                let ty = self.ir_type(e.type_id());
                ctx.func.add_value(ValueKind::ConstInt(*value as i64), ty)
            }
            ExprKind::CharLit(value) => {
                let ty = self.ir_type(e.type_id());
                ctx.func.add_value(ValueKind::ConstInt(*value), ty)
            }
            ExprKind::FloatLit { value, .. } => {
                let ty = self.ir_type(e.type_id());
                ctx.func.add_value(ValueKind::ConstFloat(*value), ty)
            }
            ExprKind::StrLit(bytes) => {
                let idx = self.module.intern_string(bytes);
                ctx.func.add_value(
                    ValueKind::ConstString(idx),
                    IrType::Ptr(Box::new(IrType::I8)),
                )
            }
            ExprKind::Ident { sym, .. } => {
                // Enum constants are immediate values, not storage.
                if let Some(sym) = sym {
                    let symbol = self.symbols.symbol(*sym);
                    if symbol.kind == SymbolKind::EnumConstant {
                        let ty = self.ir_type(e.type_id());
                        return ctx.func.add_value(ValueKind::ConstInt(symbol.enum_value), ty);
                    }
                }
                self.load_lvalue(ctx, e)
            }
            ExprKind::Index { .. } | ExprKind::Member { .. } => self.load_lvalue(ctx, e),
            ExprKind::Unary { op, operand } => self.lower_unary(ctx, e, *op, operand),
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(ctx, e, *op, lhs, rhs),
            ExprKind::Assign { op, lhs, rhs } => {
                let rhs_v = self.rvalue(ctx, rhs);
                match op {
                    None => self.store_lvalue(ctx, lhs, rhs_v),
                    Some(bin_op) => {
                        let old = self.load_lvalue(ctx, lhs);
                        let lhs_cty = lhs.type_id();
                        let rhs_cty = rhs.type_id();
                        let result = if self.types.is_pointer(lhs_cty) {
                            // Pointers keep their integer offset operand.
                            self.arith(ctx, *bin_op, old, rhs_v, lhs_cty, rhs_cty)
                        } else if matches!(*bin_op, BinaryOp::Shl | BinaryOp::Shr) {
                            // Shift counts convert to the target's type;
                            // the operation stays in the left operand's
                            // type.
                            let rhs_conv = self.convert(ctx, rhs_v, rhs_cty, lhs_cty);
                            self.arith(ctx, *bin_op, old, rhs_conv, lhs_cty, lhs_cty)
                        } else {
                            // `E1 op= E2` computes `E1 op E2` under the
                            // usual arithmetic conversions; only the
                            // result converts back to E1's type.
                            let common = self.types.usual_arithmetic(lhs_cty, rhs_cty);
                            let old_conv = self.convert(ctx, old, lhs_cty, common);
                            let rhs_conv = self.convert(ctx, rhs_v, rhs_cty, common);
                            let wide =
                                self.arith(ctx, *bin_op, old_conv, rhs_conv, common, common);
                            self.convert(ctx, wide, common, lhs_cty)
                        };
                        self.store_lvalue(ctx, lhs, result)
                    }
                }
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond_v = self.rvalue(ctx, cond);
                let then_b = ctx.fresh_block("cond_then");
                let else_b = ctx.fresh_block("cond_else");
                let end_b = ctx.fresh_block("cond_end");
                ctx.branch_cond(cond_v, then_b, else_b);
                ctx.switch_to(then_b);
                let t_v = self.rvalue(ctx, then_expr);
                let t_pred = ctx.cur;
                ctx.branch(end_b);
                ctx.switch_to(else_b);
                let e_v = self.rvalue(ctx, else_expr);
                let e_pred = ctx.cur;
                ctx.branch(end_b);
                ctx.switch_to(end_b);
                let ty = self.ir_type(e.type_id());
                if ty == IrType::Void {
                    let zero = ctx.const_int(0, IrType::I32);
                    return zero;
                }
                let mut phi = Inst::simple(Opcode::Phi, vec![]);
                phi.incoming = vec![(t_v, t_pred), (e_v, e_pred)];
                ctx.push(phi, ty)
            }
            ExprKind::Call { callee, args } => self.lower_call(ctx, e, callee, args),
            ExprKind::Cast { to, operand } => {
                let v = self.rvalue(ctx, operand);
                self.convert(ctx, v, operand.type_id(), *to)
            }
            ExprKind::ImplicitCast { to, operand } => {
                // Decay of arrays and functions: the operand's address is
                // the value.
                if self.types.is_pointer(*to)
                    && (self.types.is_array(operand.type_id())
                        || self.types.is_function(operand.type_id()))
                {
                    let addr = self.lvalue_addr(ctx, operand);
                    let to_ir = self.ir_type(*to);
                    let mut cast = Inst::simple(Opcode::Bitcast, vec![addr]);
                    cast.aux = Some(to_ir.clone());
                    return ctx.push(cast, to_ir);
                }
                let v = self.rvalue(ctx, operand);
                self.convert(ctx, v, operand.type_id(), *to)
            }
            ExprKind::SizeofExpr(inner) => {
                let size = self.types.size_of(inner.type_id()).unwrap_or(0);
                let ty = self.ir_type(e.type_id());
                ctx.func.add_value(ValueKind::ConstInt(size as i64), ty)
            }
            ExprKind::SizeofType(ty) => {
                // A flexible array member measures zero.
                let size = self.types.size_of(*ty).unwrap_or(0);
                let result_ty = self.ir_type(e.type_id());
                ctx.func
                    .add_value(ValueKind::ConstInt(size as i64), result_ty)
            }
            ExprKind::Comma { lhs, rhs } => {
                self.rvalue(ctx, lhs);
                self.rvalue(ctx, rhs)
            }
        }
    }

    fn lower_unary(
        &mut self,
        ctx: &mut FuncCtx,
        e: &Expr,
        op: UnaryOp,
        operand: &Expr,
    ) -> ValueId {
        let ty = self.ir_type(e.type_id());
        match op {
            UnaryOp::Plus => self.rvalue(ctx, operand),
            UnaryOp::Neg => {
                let v = self.rvalue(ctx, operand);
                let opcode = if ty.is_float() {
                    Opcode::Fneg
                } else {
                    Opcode::Neg
                };
                ctx.push(Inst::simple(opcode, vec![v]), ty)
            }
            UnaryOp::BitNot => {
                let v = self.rvalue(ctx, operand);
                ctx.push(Inst::simple(Opcode::Not, vec![v]), ty)
            }
            UnaryOp::LogNot => {
                let v = self.rvalue(ctx, operand);
                let operand_ty = ctx.func.value(v).ty.clone();
                let zero = if operand_ty.is_float() {
                    ctx.func.add_value(ValueKind::ConstFloat(0.0), operand_ty)
                } else {
                    ctx.const_int(0, operand_ty)
                };
                let opcode = if ctx.func.value(v).ty.is_float() {
                    Opcode::Fcmp
                } else {
                    Opcode::CmpEq
                };
                let mut cmp = Inst::simple(opcode, vec![v, zero]);
                if opcode == Opcode::Fcmp {
                    cmp.fpred = Some(FloatPred::Oeq);
                }
                ctx.push(cmp, ty)
            }
            UnaryOp::AddrOf => self.lvalue_addr(ctx, operand),
            UnaryOp::Deref => self.load_lvalue(ctx, e),
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let old = self.load_lvalue(ctx, operand);
                let operand_ty = ctx.func.value(old).ty.clone();
                let is_dec = matches!(op, UnaryOp::PreDec | UnaryOp::PostDec);
                let new = if self.types.is_pointer(operand.type_id()) {
                    // Pointer bump via gep of +/-1 element.
                    let one = ctx.const_int(if is_dec { -1 } else { 1 }, IrType::I64);
                    let elem = operand_ty
                        .pointee()
                        .cloned()
                        .unwrap_or(IrType::I8);
                    let mut gep = Inst::simple(Opcode::Gep, vec![old, one]);
                    gep.aux = Some(elem);
                    ctx.push(gep, operand_ty.clone())
                } else if operand_ty.is_float() {
                    let one = ctx.func.add_value(ValueKind::ConstFloat(1.0), operand_ty.clone());
                    let opcode = if is_dec { Opcode::Fsub } else { Opcode::Fadd };
                    ctx.push(Inst::simple(opcode, vec![old, one]), operand_ty.clone())
                } else {
                    let one = ctx.const_int(1, operand_ty.clone());
                    let opcode = if is_dec { Opcode::Sub } else { Opcode::Add };
                    ctx.push(Inst::simple(opcode, vec![old, one]), operand_ty.clone())
                };
                self.store_lvalue(ctx, operand, new);
                if matches!(op, UnaryOp::PostInc | UnaryOp::PostDec) {
                    old
                } else {
                    new
                }
            }
        }
    }

    /// Arithmetic on already-lowered operands (shared by binary ops and
    /// compound assignment).
    fn arith(
        &mut self,
        ctx: &mut FuncCtx,
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
        lhs_cty: TypeId,
        rhs_cty: TypeId,
    ) -> ValueId {
        let lty = ctx.func.value(lhs).ty.clone();
        // Pointer +/- integer works element-wise.
        if self.types.is_pointer(lhs_cty)
            && matches!(op, BinaryOp::Add | BinaryOp::Sub)
            && self.types.is_integer(rhs_cty)
        {
            let elem = lty.pointee().cloned().unwrap_or(IrType::I8);
            let idx = if op == BinaryOp::Sub {
                ctx.push(Inst::simple(Opcode::Neg, vec![rhs]), IrType::I64)
            } else {
                rhs
            };
            let mut gep = Inst::simple(Opcode::Gep, vec![lhs, idx]);
            gep.aux = Some(elem);
            return ctx.push(gep, lty);
        }
        if self.types.is_integer(lhs_cty) && self.types.is_pointer(rhs_cty) && op == BinaryOp::Add
        {
            let rty = ctx.func.value(rhs).ty.clone();
            let elem = rty.pointee().cloned().unwrap_or(IrType::I8);
            let mut gep = Inst::simple(Opcode::Gep, vec![rhs, lhs]);
            gep.aux = Some(elem);
            return ctx.push(gep, rty);
        }
        // Pointer difference: byte delta divided by element size.
        if self.types.is_pointer(lhs_cty)
            && self.types.is_pointer(rhs_cty)
            && op == BinaryOp::Sub
        {
            let l = ctx.push(Inst::simple(Opcode::Ptrtoint, vec![lhs]), IrType::I64);
            let r = ctx.push(Inst::simple(Opcode::Ptrtoint, vec![rhs]), IrType::I64);
            let diff = ctx.push(Inst::simple(Opcode::Sub, vec![l, r]), IrType::I64);
            let elem_size = self
                .types
                .pointee(lhs_cty)
                .and_then(|p| self.types.size_of(p))
                .unwrap_or(1);
            let size_v = ctx.const_int(elem_size as i64, IrType::I64);
            return ctx.push(Inst::simple(Opcode::Sdiv, vec![diff, size_v]), IrType::I64);
        }

        let float = lty.is_float();
        let signed = lty.is_signed();
        let opcode = match op {
            BinaryOp::Add => {
                if float {
                    Opcode::Fadd
                } else {
                    Opcode::Add
                }
            }
            BinaryOp::Sub => {
                if float {
                    Opcode::Fsub
                } else {
                    Opcode::Sub
                }
            }
            BinaryOp::Mul => {
                if float {
                    Opcode::Fmul
                } else {
                    Opcode::Mul
                }
            }
            BinaryOp::Div => {
                if float {
                    Opcode::Fdiv
                } else if signed {
                    Opcode::Sdiv
                } else {
                    Opcode::Udiv
                }
            }
            BinaryOp::Mod => {
                if signed {
                    Opcode::Smod
                } else {
                    Opcode::Umod
                }
            }
            BinaryOp::Shl => Opcode::Shl,
            BinaryOp::Shr => {
                if signed {
                    Opcode::Sar
                } else {
                    Opcode::Shr
                }
            }
            BinaryOp::BitAnd => Opcode::And,
            BinaryOp::BitXor => Opcode::Xor,
            BinaryOp::BitOr => Opcode::Or,
            _ => unreachable!("comparisons handled by lower_binary"),
        };
        ctx.push(Inst::simple(opcode, vec![lhs, rhs]), lty)
    }

    fn lower_binary(
        &mut self,
        ctx: &mut FuncCtx,
        e: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> ValueId {
        use BinaryOp::*;
        match op {
            LogAnd | LogOr => {
                // Short circuit through control flow plus a phi.
                let rhs_b = ctx.fresh_block("sc_rhs");
                let end_b = ctx.fresh_block("sc_end");
                let lhs_v = self.rvalue(ctx, lhs);
                let lhs_bool = self.truth_value(ctx, lhs_v);
                let lhs_pred = ctx.cur;
                if op == LogAnd {
                    ctx.branch_cond(lhs_bool, rhs_b, end_b);
                } else {
                    ctx.branch_cond(lhs_bool, end_b, rhs_b);
                }
                ctx.switch_to(rhs_b);
                let rhs_v = self.rvalue(ctx, rhs);
                let rhs_bool = self.truth_value(ctx, rhs_v);
                let rhs_pred = ctx.cur;
                ctx.branch(end_b);
                ctx.switch_to(end_b);
                let short_val = ctx.const_int(if op == LogAnd { 0 } else { 1 }, IrType::I32);
                let mut phi = Inst::simple(Opcode::Phi, vec![]);
                phi.incoming = vec![(short_val, lhs_pred), (rhs_bool, rhs_pred)];
                ctx.push(phi, IrType::I32)
            }
            Lt | Gt | Le | Ge | Eq | Ne => {
                let lhs_v = self.rvalue(ctx, lhs);
                let rhs_v = self.rvalue(ctx, rhs);
                let lty = ctx.func.value(lhs_v).ty.clone();
                let result = self.ir_type(e.type_id());
                if lty.is_float() {
                    let pred = match op {
                        Eq => FloatPred::Oeq,
                        Ne => FloatPred::One,
                        Lt => FloatPred::Olt,
                        Le => FloatPred::Ole,
                        Gt => FloatPred::Ogt,
                        _ => FloatPred::Oge,
                    };
                    let mut cmp = Inst::simple(Opcode::Fcmp, vec![lhs_v, rhs_v]);
                    cmp.fpred = Some(pred);
                    return ctx.push(cmp, result);
                }
                let signed = lty.is_signed() || lty.is_pointer();
                let opcode = match (op, signed) {
                    (Eq, _) => Opcode::CmpEq,
                    (Ne, _) => Opcode::CmpNe,
                    (Lt, true) => Opcode::CmpLt,
                    (Le, true) => Opcode::CmpLe,
                    (Gt, true) => Opcode::CmpGt,
                    (Ge, true) => Opcode::CmpGe,
                    (Lt, false) => Opcode::CmpUlt,
                    (Le, false) => Opcode::CmpUle,
                    (Gt, false) => Opcode::CmpUgt,
                    (Ge, false) => Opcode::CmpUge,
                    _ => unreachable!(),
                };
                ctx.push(Inst::simple(opcode, vec![lhs_v, rhs_v]), result)
            }
            _ => {
                let lhs_v = self.rvalue(ctx, lhs);
                let rhs_v = self.rvalue(ctx, rhs);
                self.arith(ctx, op, lhs_v, rhs_v, lhs.type_id(), rhs.type_id())
            }
        }
    }

    /// Normalize a value to 0/1.
    fn truth_value(&mut self, ctx: &mut FuncCtx, v: ValueId) -> ValueId {
        let ty = ctx.func.value(v).ty.clone();
        if ty.is_float() {
            let zero = ctx.func.add_value(ValueKind::ConstFloat(0.0), ty);
            let mut cmp = Inst::simple(Opcode::Fcmp, vec![v, zero]);
            cmp.fpred = Some(FloatPred::One);
            return ctx.push(cmp, IrType::I32);
        }
        let zero = ctx.const_int(0, ty);
        ctx.push(Inst::simple(Opcode::CmpNe, vec![v, zero]), IrType::I32)
    }

    fn lower_call(
        &mut self,
        ctx: &mut FuncCtx,
        e: &Expr,
        callee: &Expr,
        args: &[Expr],
    ) -> ValueId {
        // Direct calls reference the function symbol; everything else is
        // an indirect call through a pointer value.
        let callee_v = match &callee.kind {
            ExprKind::Ident { sym: Some(sym), .. }
                if self.symbols.symbol(*sym).kind == SymbolKind::Function =>
            {
                let symbol = self.symbols.symbol(*sym);
                let fty = self.ir_type(symbol.ty);
                self.declare_function(&symbol.name, symbol.ty);
                ctx.func
                    .add_value(ValueKind::FuncRef(symbol.name.clone()), fty)
            }
            ExprKind::ImplicitCast { operand, .. } => {
                // Function decay produced a pointer; unwrap direct refs.
                if let ExprKind::Ident { sym: Some(sym), .. } = &operand.kind {
                    let symbol = self.symbols.symbol(*sym);
                    if symbol.kind == SymbolKind::Function {
                        let fty = self.ir_type(symbol.ty);
                        self.declare_function(&symbol.name, symbol.ty);
                        ctx.func
                            .add_value(ValueKind::FuncRef(symbol.name.clone()), fty)
                    } else {
                        self.rvalue(ctx, callee)
                    }
                } else {
                    self.rvalue(ctx, callee)
                }
            }
            _ => self.rvalue(ctx, callee),
        };
        let mut call_args = vec![callee_v];
        for arg in args {
            call_args.push(self.rvalue(ctx, arg));
        }
        let ret = self.ir_type(e.type_id());
        ctx.push(Inst::simple(Opcode::Call, call_args), ret)
    }

    /// Make sure a callee exists in the module as at least a declaration.
    fn declare_function(&mut self, name: &str, cty: TypeId) {
        if self.module.functions.iter().any(|f| f.name == name) {
            return;
        }
        let sig = Rc::new(self.func_sig(cty));
        self.module
            .functions
            .push(Function::new(name.to_string(), sig, true));
    }

    /// Scalar conversion between C types, as explicit IR instructions.
    fn convert(&mut self, ctx: &mut FuncCtx, v: ValueId, from: TypeId, to: TypeId) -> ValueId {
        if self.types.is_same(from, to) || self.types.is_void(to) {
            return v;
        }
        let from_ir = ctx.func.value(v).ty.clone();
        let to_ir = self.ir_type(to);
        if from_ir == to_ir {
            return v;
        }
        let from_float = from_ir.is_float();
        let to_float = to_ir.is_float();
        let opcode = if from_float && to_float {
            if to_ir.size(self.ptr_bytes) > from_ir.size(self.ptr_bytes) {
                Opcode::Fpext
            } else {
                Opcode::Fptrunc
            }
        } else if from_float {
            if self.types.is_signed(to) {
                Opcode::Fptosi
            } else {
                Opcode::Fptoui
            }
        } else if to_float {
            if self.types.is_signed(from) {
                Opcode::Sitofp
            } else {
                Opcode::Uitofp
            }
        } else if from_ir.is_pointer() && to_ir.is_pointer() {
            Opcode::Bitcast
        } else if from_ir.is_pointer() {
            Opcode::Ptrtoint
        } else if to_ir.is_pointer() {
            Opcode::Inttoptr
        } else {
            let from_size = from_ir.size(self.ptr_bytes);
            let to_size = to_ir.size(self.ptr_bytes);
            if to_size < from_size {
                Opcode::Trunc
            } else if to_size == from_size {
                Opcode::Bitcast
            } else if from_ir.is_signed() {
                Opcode::Sext
            } else {
                Opcode::Zext
            }
        };
        let mut inst = Inst::simple(opcode, vec![v]);
        inst.aux = Some(to_ir.clone());
        ctx.push(inst, to_ir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::sema::Sema;
    use crate::standard::Standard;
    use crate::types::TargetLayout;

    fn lower(src: &str) -> (Module, Diagnostics) {
        let std = Standard::C99;
        let mut diags = Diagnostics::new(false, false, false);
        let mut types = TypeTable::new(TargetLayout::lp64());
        let mut symbols = SymbolTable::new();
        let tokens = Lexer::new("t.c", src, std).run(&mut diags);
        let mut unit = Parser::new(tokens, std, &mut types, &mut diags).parse();
        Sema::new(&mut types, &mut symbols, &mut diags, std).run(&mut unit);
        assert!(!diags.has_errors(), "{}", diags.render());
        let mut module = Module::new("t.c");
        IrGen::new(&types, &symbols, &mut module, &mut diags).lower_unit(&unit);
        (module, diags)
    }

    #[test]
    fn test_hello_world_shape() {
        let (module, _) = lower("int main(void) { return 0; }");
        let main = module.function("main").unwrap();
        assert!(main.verify().is_ok(), "{:?}", main.verify());
        assert_eq!(main.blocks.len(), 1);
        let term = main.terminator(BlockId(0)).unwrap();
        assert_eq!(main.inst(term).unwrap().op, Opcode::Ret);
    }

    #[test]
    fn test_every_block_terminated() {
        let (module, _) = lower(
            "int f(int n) { int i; int t; t = 0; \
             for (i = 0; i < n; i++) { if (i == 3) continue; t += i; } \
             while (t > 10) t /= 2; return t; }",
        );
        assert!(module.verify().is_ok(), "{:?}", module.verify());
    }

    #[test]
    fn test_short_circuit_has_phi() {
        let (module, _) = lower("int f(int a, int b) { return a && b; }");
        let f = module.function("f").unwrap();
        assert!(f.verify().is_ok());
        let has_phi = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .any(|&v| f.inst(v).map(|i| i.op == Opcode::Phi).unwrap_or(false));
        assert!(has_phi, "&& should lower through a phi");
    }

    #[test]
    fn test_phi_at_block_start_only() {
        let (module, _) = lower(
            "int f(int a, int b, int c) { return (a ? b : c) + (a || b); }",
        );
        assert!(module.verify().is_ok(), "{:?}", module.verify());
    }

    #[test]
    fn test_global_initializer_folded() {
        let (module, _) = lower("int x = 2 + 3 * 4;");
        let g = module.globals.iter().find(|g| g.name == "x").unwrap();
        match &g.init {
            GlobalInit::Int(14) => {}
            other => panic!("expected folded 14, got {:?}", other),
        }
    }

    #[test]
    fn test_string_pool_dedup() {
        let (module, _) = lower(
            "char *a = \"shared\"; char *b = \"shared\"; char *c = \"other\";",
        );
        assert_eq!(module.strings.len(), 2);
    }

    #[test]
    fn test_switch_dispatch() {
        let (module, _) = lower(
            "int f(int n) { switch (n) { case 1: return 10; case 2: return 20; \
             default: return 0; } }",
        );
        let f = module.function("f").unwrap();
        assert!(f.verify().is_ok(), "{:?}", f.verify());
        // Two compare-and-branch tests in the dispatch chain.
        let cmps = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter(|&&v| f.inst(v).map(|i| i.op == Opcode::CmpEq).unwrap_or(false))
            .count();
        assert_eq!(cmps, 2);
    }

    #[test]
    fn test_call_lowering() {
        let (module, _) = lower(
            "int add(int a, int b) { return a + b; } \
             int main(void) { return add(1, 2); }",
        );
        let main = module.function("main").unwrap();
        let call = main
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .find(|&&v| main.inst(v).map(|i| i.op == Opcode::Call).unwrap_or(false));
        assert!(call.is_some());
        // Callee + two arguments.
        let call_inst = main.inst(*call.unwrap()).unwrap();
        assert_eq!(call_inst.args.len(), 3);
    }

    #[test]
    fn test_pointer_arithmetic_scales() {
        let (module, _) = lower("int f(int *p) { return *(p + 2); }");
        let f = module.function("f").unwrap();
        let gep = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .find(|&&v| f.inst(v).map(|i| i.op == Opcode::Gep).unwrap_or(false));
        assert!(gep.is_some(), "pointer addition should lower to gep");
    }

    #[test]
    fn test_goto_blocks() {
        let (module, _) = lower(
            "int f(void) { int x; x = 0; goto skip; x = 1; skip: return x; }",
        );
        assert!(module.verify().is_ok(), "{:?}", module.verify());
    }

    #[test]
    fn test_conversions_emitted() {
        let (module, _) = lower("double f(int i) { return i + 1.5; }");
        let f = module.function("f").unwrap();
        let has_sitofp = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .any(|&v| f.inst(v).map(|i| i.op == Opcode::Sitofp).unwrap_or(false));
        assert!(has_sitofp);
    }

    #[test]
    fn test_compound_assign_runs_in_common_type() {
        // x -= 0.5 computes (int)((double)x - 0.5), not x - (int)0.5.
        let (module, _) = lower("int f(void) { int x; x = 5; x -= 0.5; return x; }");
        let f = module.function("f").unwrap();
        let ops: Vec<Opcode> = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter_map(|&v| f.inst(v).map(|i| i.op))
            .collect();
        assert!(ops.contains(&Opcode::Sitofp), "left operand promotes to double");
        assert!(ops.contains(&Opcode::Fsub), "operation runs in double");
        assert!(ops.contains(&Opcode::Fptosi), "result converts back to int");
    }

    #[test]
    fn test_local_static_becomes_global() {
        let (module, _) = lower("int counter(void) { static int n = 5; return n++; }");
        assert!(module
            .globals
            .iter()
            .any(|g| g.name.contains("counter") && g.name.contains('n')));
    }

    #[test]
    fn test_declared_extern_function() {
        let (module, _) = lower("int puts(const char *s); int main(void) { return puts(\"hi\"); }");
        let decl = module.function("puts").unwrap();
        assert!(decl.is_declaration);
    }
}
