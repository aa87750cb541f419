//! Function bodies: dereference records, call sites, locals and scopes.
//!
//! [`BodyWalker`] visits a body in pre-order. Besides the records below it
//! collects `switch` labels, inline assembly and function addresses stored
//! into record members. Every memory access shape
//! (unary `*`, subscript, member chain, `offsetof`) and every assignment,
//! logic operator, initializer, condition, return value, argument and
//! indirect callee becomes a dereference record. A record that needs a
//! nested one builds the nested record first, so references always point
//! at a lower index. References stay symbolic until [`finalize_function`]
//! binds them to registry ids and folds duplicate records together.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::ast::{
    BinaryOp, DeclId, DeclKind, ExprId, ExprKind, OffsetOfComponent, Stmt, StmtId, StorageKind,
    TranslationUnit, UnaryOp,
};
use crate::consteval;
use crate::db::{
    AsmInfo, CallSite, CaseLabel, CompoundScope, DerefKind, DerefRecord, LocalVar, MemberAccess,
    OffsetRef, RefKind, RefValue, Sign, SwitchInfo,
};
use crate::error::{DbError, Diagnostics, Policy};
use crate::fops::{self, RawStore};
use crate::print;
use crate::registry::Universe;
use crate::resolve::{self, CallResolver, StaticCallee};
use crate::visit::{
    FunctionEntry, RawCallee, RefSets, TraversalContext, resolve_callees, resolve_globals,
};

// ---------------------------------------------------------------------------
// Symbolic records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RefTarget {
    Function(DeclId),
    Unresolved(String),
    Global(DeclId),
    Local { id: u64, parm: bool },
    Record(usize),
    Call(usize),
    IntegerLiteral(i64),
    CharLiteral(u32),
    FloatLiteral(f64),
    StringLiteral(String),
    Integer(i64),
    Address(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawRef {
    target: RefTarget,
    cast: Option<u64>,
    sign: Sign,
    mi: Option<u32>,
}

impl RawRef {
    fn plain(target: RefTarget) -> Self {
        RawRef {
            target,
            cast: None,
            sign: Sign::Plus,
            mi: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RawDeref {
    kind: DerefKind,
    offset: Option<i64>,
    base: Vec<RawRef>,
    refs: Vec<RawRef>,
    member: Vec<i64>,
    access: Vec<MemberAccess>,
    shift: Vec<i64>,
    member_types: Vec<i64>,
    mcall: Vec<Option<usize>>,
    cast: Option<u64>,
    ord: usize,
    expr: String,
    csid: i64,
}

#[derive(Debug)]
pub(crate) struct RawCall {
    callee: Option<RawCallee>,
    deref: Option<usize>,
    args: Vec<usize>,
    ord: usize,
    csid: i64,
    expr: String,
}

#[derive(Debug)]
pub(crate) struct RawAsm {
    csid: i64,
    text: String,
    operands: Vec<RawRef>,
}

/// Everything the walker collected for one function.
#[derive(Debug)]
pub(crate) struct RawFunction {
    decl: DeclId,
    id: u64,
    types: Vec<i64>,
    class: Option<i64>,
    locals: Vec<LocalVar>,
    local_ids: HashMap<DeclId, u64>,
    csmap: Vec<CompoundScope>,
    derefs: Vec<RawDeref>,
    calls: Vec<RawCall>,
    switches: Vec<SwitchInfo>,
    asm: Vec<RawAsm>,
    stores: Vec<RawStore>,
    refs: RefSets,
    declcount: usize,
    body: String,
}

/// A non-constant term of an additive expression.
#[derive(Debug, Clone, Copy)]
struct Operand {
    expr: ExprId,
    sign: Sign,
    cast: Option<u64>,
}

enum Part {
    Stmt(StmtId),
    Expr(ExprId),
    Decl(DeclId),
}

/// Children of a statement in evaluation order.
fn parts(ast: &TranslationUnit, s: StmtId) -> Vec<Part> {
    match ast.stmt(s) {
        Stmt::Compound { body } => body.iter().map(|b| Part::Stmt(*b)).collect(),
        Stmt::Decl { decls } => decls.iter().map(|d| Part::Decl(*d)).collect(),
        Stmt::Expr { expr } => vec![Part::Expr(*expr)],
        Stmt::Return { value } => value.iter().map(|v| Part::Expr(*v)).collect(),
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            let mut v = vec![Part::Expr(*cond), Part::Stmt(*then)];
            v.extend(otherwise.iter().map(|o| Part::Stmt(*o)));
            v
        }
        Stmt::While { cond, body } | Stmt::Switch { cond, body } => {
            vec![Part::Expr(*cond), Part::Stmt(*body)]
        }
        Stmt::Do { body, cond } => vec![Part::Stmt(*body), Part::Expr(*cond)],
        Stmt::For {
            init,
            cond,
            inc,
            body,
        } => {
            let mut v: Vec<Part> = init.iter().map(|i| Part::Stmt(*i)).collect();
            v.extend(cond.iter().map(|c| Part::Expr(*c)));
            v.extend(inc.iter().map(|i| Part::Expr(*i)));
            v.push(Part::Stmt(*body));
            v
        }
        Stmt::Case { value, body } => vec![Part::Expr(*value), Part::Stmt(*body)],
        Stmt::Default { body } | Stmt::Label { body, .. } => vec![Part::Stmt(*body)],
        Stmt::Asm { operands, .. } => operands.iter().map(|o| Part::Expr(*o)).collect(),
        Stmt::Goto { .. }
        | Stmt::Break
        | Stmt::Continue
        | Stmt::Null
        | Stmt::Unsupported { .. } => Vec::new(),
    }
}

/// Enumerator a case label names, through parens and casts.
fn enumerator(ast: &TranslationUnit, mut e: ExprId) -> Option<String> {
    loop {
        match &ast.expr(e).kind {
            ExprKind::Paren { sub } | ExprKind::Cast { sub, .. } => e = *sub,
            ExprKind::DeclRef { decl } => {
                let d = ast.decl(*decl);
                return matches!(d.kind, DeclKind::EnumConstant { .. }).then(|| d.name.clone());
            }
            _ => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

pub(crate) struct BodyWalker<'w, 'a> {
    ctx: &'w mut TraversalContext<'a>,
    ast: &'a TranslationUnit,
    func: RawFunction,
    ords: HashMap<ExprId, usize>,
    csids: HashMap<StmtId, i64>,
    scope: Vec<i64>,
    records: HashMap<ExprId, usize>,
    calls: HashMap<ExprId, usize>,
    /// Inner member expressions already folded into an outer chain.
    consumed: HashSet<ExprId>,
    /// Callee references of direct calls; these are not function references.
    direct: HashSet<ExprId>,
    /// Enclosing `switch` statements, innermost last.
    open_switches: Vec<usize>,
}

impl<'w, 'a> BodyWalker<'w, 'a> {
    pub(crate) fn new(
        ctx: &'w mut TraversalContext<'a>,
        decl: DeclId,
        id: u64,
    ) -> Result<Self, DbError> {
        let ast = ctx.ast;
        if ast.function(decl).is_none() {
            return Err(DbError::UnsupportedDeclKind(format!(
                "`{}` is not a function",
                ast.decl(decl).name
            )));
        }
        Ok(BodyWalker {
            ctx,
            ast,
            func: RawFunction {
                decl,
                id,
                types: Vec::new(),
                class: None,
                locals: Vec::new(),
                local_ids: HashMap::new(),
                csmap: Vec::new(),
                derefs: Vec::new(),
                calls: Vec::new(),
                switches: Vec::new(),
                asm: Vec::new(),
                stores: Vec::new(),
                refs: RefSets::default(),
                declcount: 0,
                body: String::new(),
            },
            ords: HashMap::new(),
            csids: HashMap::new(),
            scope: Vec::new(),
            records: HashMap::new(),
            calls: HashMap::new(),
            consumed: HashSet::new(),
            direct: HashSet::new(),
            open_switches: Vec::new(),
        })
    }

    pub(crate) fn run(mut self) -> Result<RawFunction, DbError> {
        let ast = self.ast;
        let decl = self.func.decl;
        let Some(f) = ast.function(decl) else {
            return Ok(self.func);
        };
        self.func.types = self.ctx.signature_types(f.ty)?;
        if let Some(class) = f.method_of {
            self.func.class = Some(self.ctx.canon().canonicalize(class)? as i64);
        }
        for &p in &f.params {
            let Some(ty) = ast.decl_type(p) else {
                continue;
            };
            let ty = self.ctx.canon().canonicalize(ty)?;
            self.add_local(p, ty, true);
        }
        if let Some(body) = f.body {
            let (mut ord, mut cs) = (0, 0);
            self.number_stmt(body, &mut ord, &mut cs);
            self.walk_stmt(body)?;
            self.func.body = print::stmt(ast, body);
        }
        trace!(
            name = %ast.decl(decl).name,
            derefs = self.func.derefs.len(),
            calls = self.func.calls.len(),
            "walked body"
        );
        Ok(self.func)
    }

    fn current_cs(&self) -> i64 {
        self.scope.last().copied().unwrap_or(-1)
    }

    fn add_local(&mut self, d: DeclId, ty: u64, parm: bool) -> u64 {
        let ast = self.ast;
        let decl = ast.decl(d);
        let id = self.func.locals.len() as u64;
        self.func.locals.push(LocalVar {
            id,
            name: decl.name.clone(),
            ty: ty as i64,
            parm,
            csid: if parm { -1 } else { self.current_cs() },
            location: print::location(ast, &decl.loc),
        });
        self.func.local_ids.insert(d, id);
        id
    }

    // -----------------------------------------------------------------------
    // Numbering
    // -----------------------------------------------------------------------

    fn number_stmt(&mut self, s: StmtId, ord: &mut usize, cs: &mut i64) {
        let ast = self.ast;
        if let Stmt::Compound { .. } = ast.stmt(s) {
            self.csids.insert(s, *cs);
            *cs += 1;
        }
        for part in parts(ast, s) {
            match part {
                Part::Stmt(c) => self.number_stmt(c, ord, cs),
                Part::Expr(e) => self.number_expr(e, ord, cs),
                Part::Decl(d) => {
                    if let Some(v) = ast.var(d)
                        && v.storage == StorageKind::Local
                        && let Some(init) = v.init
                    {
                        self.number_expr(init, ord, cs);
                    }
                }
            }
        }
    }

    fn number_expr(&mut self, e: ExprId, ord: &mut usize, cs: &mut i64) {
        let ast = self.ast;
        self.ords.insert(e, *ord);
        *ord += 1;
        if let ExprKind::StmtExpr { body } = &ast.expr(e).kind {
            self.number_stmt(*body, ord, cs);
        }
        for c in ast.expr_children(e) {
            self.number_expr(c, ord, cs);
        }
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    fn walk_stmt(&mut self, s: StmtId) -> Result<(), DbError> {
        let ast = self.ast;
        let opened = self.csids.get(&s).copied();
        if let Some(cs) = opened {
            let parent = self.current_cs();
            self.func.csmap.push(CompoundScope { id: cs, parent });
            self.scope.push(cs);
        }
        let mut switched = false;
        match ast.stmt(s) {
            Stmt::If { cond, then, .. } => self.cond_record(*cond, *then)?,
            Stmt::While { cond, body } | Stmt::Do { body, cond } => {
                self.cond_record(*cond, *body)?
            }
            Stmt::Switch { cond, body } => {
                self.cond_record(*cond, *body)?;
                self.open_switch(*cond);
                switched = true;
            }
            Stmt::Case { value, .. } => self.case_label(*value),
            Stmt::Asm { text, operands } => self.asm_stmt(text, operands)?,
            Stmt::For {
                cond: Some(cond),
                body,
                ..
            } => self.cond_record(*cond, *body)?,
            Stmt::Return { value: Some(v) } => self.return_record(*v)?,
            Stmt::Unsupported { what } => {
                self.ctx
                    .report(DbError::UnsupportedExpressionKind(format!("statement {what}")))?;
            }
            _ => {}
        }
        for part in parts(ast, s) {
            match part {
                Part::Stmt(c) => self.walk_stmt(c)?,
                Part::Expr(e) => self.walk_expr(e)?,
                Part::Decl(d) => self.visit_local_decl(d)?,
            }
        }
        if switched {
            self.open_switches.pop();
        }
        if opened.is_some() {
            self.scope.pop();
        }
        Ok(())
    }

    fn visit_local_decl(&mut self, d: DeclId) -> Result<(), DbError> {
        let ast = self.ast;
        match &ast.decl(d).kind {
            DeclKind::Var(v) if v.storage == StorageKind::Local => {
                let ty = self.ctx.canon().canonicalize(v.ty)?;
                let id = self.add_local(d, ty, false);
                self.func.declcount += 1;
                if let Some(init) = v.init {
                    self.init_record(d, id, init)?;
                    self.ctx
                        .initializer_stores(v.ty, init, &mut self.func.stores)?;
                    self.walk_expr(init)?;
                }
            }
            DeclKind::Var(_) => {
                self.ctx.visit_global(d)?;
                self.func.refs.globals.insert(ast.canonical(d));
                self.func.declcount += 1;
            }
            DeclKind::Function(_) => self.ctx.declare_function(d)?,
            DeclKind::Record(r) => {
                let t = self.ctx.canon().canonicalize(r.ty)?;
                self.func.refs.types.insert(t);
            }
            DeclKind::Enum(e) => {
                let t = self.ctx.canon().canonicalize(e.ty)?;
                self.func.refs.types.insert(t);
            }
            DeclKind::Typedef { ty, .. } => {
                let t = self.ctx.canon().canonicalize(*ty)?;
                self.func.refs.types.insert(t);
            }
            DeclKind::Unsupported { what } => {
                self.ctx.report(DbError::UnsupportedDeclKind(what.clone()))?;
            }
            _ => {}
        }
        Ok(())
    }

    fn walk_expr(&mut self, e: ExprId) -> Result<(), DbError> {
        let ast = self.ast;
        let direct = self.direct.contains(&e);
        self.ctx.note_expr(&mut self.func.refs, e, direct)?;
        match &ast.expr(e).kind {
            ExprKind::Unary {
                op: UnaryOp::Deref, ..
            }
            | ExprKind::Subscript { .. }
            | ExprKind::OffsetOf { .. } => {
                self.record_for(e)?;
            }
            ExprKind::Member { .. } if !self.consumed.contains(&e) => {
                self.record_for(e)?;
            }
            ExprKind::Binary { op, lhs, rhs } if op.is_assignment() || op.is_logic() => {
                self.record_for(e)?;
                if *op == BinaryOp::Assign {
                    self.ctx
                        .assignment_stores(*lhs, *rhs, &mut self.func.stores)?;
                }
            }
            ExprKind::Call { .. } => {
                self.ensure_call(e)?;
            }
            ExprKind::StmtExpr { body } => self.walk_stmt(*body)?,
            _ => {}
        }
        for c in ast.expr_children(e) {
            self.walk_expr(c)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // References
    // -----------------------------------------------------------------------

    /// Strips parens and casts. The cast reported is the first explicit one,
    /// else the first implicit one that changes the value.
    fn strip(&mut self, e: ExprId) -> Result<(ExprId, Option<u64>), DbError> {
        let ast = self.ast;
        let mut cur = e;
        let mut explicit = None;
        let mut implicit = None;
        loop {
            let expr = ast.expr(cur);
            match &expr.kind {
                ExprKind::Paren { sub } => cur = *sub,
                ExprKind::Cast {
                    sub,
                    cast,
                    explicit: is_explicit,
                } => {
                    if *is_explicit {
                        if explicit.is_none() {
                            explicit = Some(expr.ty);
                        }
                    } else if cast.changes_value() && implicit.is_none() {
                        implicit = Some(expr.ty);
                    }
                    cur = *sub;
                }
                _ => break,
            }
        }
        let cast = match explicit.or(implicit) {
            Some(t) => Some(self.ctx.canon().canonicalize(t)?),
            None => None,
        };
        Ok((cur, cast))
    }

    /// What a stripped expression stands for, if it is a single entity.
    fn reference(&mut self, s: ExprId) -> Result<Option<RefTarget>, DbError> {
        let ast = self.ast;
        let target = match &ast.expr(s).kind {
            ExprKind::IntLit { value } => RefTarget::IntegerLiteral(*value as i64),
            ExprKind::CharLit { value } => RefTarget::CharLiteral(*value),
            ExprKind::FloatLit { value } => RefTarget::FloatLiteral(*value),
            ExprKind::StringLit { value } => RefTarget::StringLiteral(value.clone()),
            ExprKind::DeclRef { decl } => match &ast.decl(*decl).kind {
                DeclKind::Function(_) | DeclKind::FunctionTemplate { .. } => {
                    RefTarget::Function(*decl)
                }
                DeclKind::EnumConstant { value } => RefTarget::Integer(*value),
                DeclKind::Var(_) | DeclKind::Param(_) => {
                    if let Some(&id) = self.func.local_ids.get(decl) {
                        RefTarget::Local {
                            id,
                            parm: matches!(ast.decl(*decl).kind, DeclKind::Param(_)),
                        }
                    } else if ast.is_global_var(*decl) {
                        RefTarget::Global(ast.canonical(*decl))
                    } else {
                        self.ctx.report(DbError::NotRegistered {
                            universe: Universe::Global,
                            what: format!("local `{}`", ast.decl(*decl).name),
                        })?;
                        return Ok(None);
                    }
                }
                _ => return Ok(None),
            },
            ExprKind::UnresolvedName { name } => RefTarget::Unresolved(name.clone()),
            ExprKind::Unary {
                op: UnaryOp::Deref, ..
            }
            | ExprKind::Subscript { .. }
            | ExprKind::Member { .. }
            | ExprKind::OffsetOf { .. } => RefTarget::Record(self.record_for(s)?),
            ExprKind::Binary { op, .. } if op.is_assignment() || op.is_logic() => {
                RefTarget::Record(self.record_for(s)?)
            }
            ExprKind::Call { .. } => RefTarget::Call(self.ensure_call(s)?),
            _ => match consteval::evaluate(ast, s) {
                Some(v) => RefTarget::Integer(v),
                None => return Ok(None),
            },
        };
        Ok(Some(target))
    }

    fn collect_refs(&mut self, e: ExprId, out: &mut Vec<RawRef>) -> Result<(), DbError> {
        let (s, cast) = self.strip(e)?;
        self.collect_stripped(s, cast, out)
    }

    fn collect_stripped(
        &mut self,
        s: ExprId,
        cast: Option<u64>,
        out: &mut Vec<RawRef>,
    ) -> Result<(), DbError> {
        let ast = self.ast;
        if let Some(target) = self.reference(s)? {
            out.push(RawRef {
                target,
                cast,
                sign: Sign::Plus,
                mi: None,
            });
            return Ok(());
        }
        match &ast.expr(s).kind {
            ExprKind::Unary { sub, .. } => self.collect_refs(*sub, out),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.collect_refs(*lhs, out)?;
                self.collect_refs(*rhs, out)
            }
            ExprKind::Conditional {
                then, otherwise, ..
            } => {
                self.collect_refs(*then, out)?;
                self.collect_refs(*otherwise, out)
            }
            ExprKind::InitList { inits } => {
                for i in inits {
                    self.collect_refs(*i, out)?;
                }
                Ok(())
            }
            ExprKind::CompoundLiteral { init } => self.collect_refs(*init, out),
            _ => Ok(()),
        }
    }

    fn push_operand(&mut self, op: Operand, out: &mut Vec<RawRef>) -> Result<(), DbError> {
        let start = out.len();
        self.collect_stripped(op.expr, op.cast, out)?;
        for r in &mut out[start..] {
            r.sign = op.sign;
        }
        Ok(())
    }

    /// Splits an additive expression into its constant sum and the
    /// remaining operands, left to right.
    fn fold(
        &mut self,
        e: ExprId,
        sign: Sign,
        acc: &mut i64,
        out: &mut Vec<Operand>,
    ) -> Result<(), DbError> {
        let ast = self.ast;
        if let Some(v) = consteval::evaluate(ast, e) {
            *acc = match sign {
                Sign::Plus => acc.wrapping_add(v),
                Sign::Minus => acc.wrapping_sub(v),
            };
            return Ok(());
        }
        let (s, cast) = self.strip(e)?;
        match &ast.expr(s).kind {
            ExprKind::Binary {
                op: BinaryOp::Add,
                lhs,
                rhs,
            } => {
                self.fold(*lhs, sign, acc, out)?;
                self.fold(*rhs, sign, acc, out)
            }
            ExprKind::Binary {
                op: BinaryOp::Sub,
                lhs,
                rhs,
            } => {
                self.fold(*lhs, sign, acc, out)?;
                self.fold(*rhs, sign.flip(), acc, out)
            }
            _ => {
                out.push(Operand {
                    expr: s,
                    sign,
                    cast,
                });
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    fn new_record(&self, kind: DerefKind, e: ExprId) -> RawDeref {
        RawDeref {
            kind,
            offset: None,
            base: Vec::new(),
            refs: Vec::new(),
            member: Vec::new(),
            access: Vec::new(),
            shift: Vec::new(),
            member_types: Vec::new(),
            mcall: Vec::new(),
            cast: None,
            ord: self.ords.get(&e).copied().unwrap_or(0),
            expr: print::located_expr(self.ast, e),
            csid: self.current_cs(),
        }
    }

    fn push_record(&mut self, rec: RawDeref) -> usize {
        let idx = self.func.derefs.len();
        trace!(idx, kind = ?rec.kind, expr = %rec.expr, "deref");
        self.func.derefs.push(rec);
        idx
    }

    /// Index of the record for an access expression, building it once.
    fn record_for(&mut self, e: ExprId) -> Result<usize, DbError> {
        if let Some(&idx) = self.records.get(&e) {
            return Ok(idx);
        }
        let ast = self.ast;
        let rec = match &ast.expr(e).kind {
            ExprKind::Unary {
                op: UnaryOp::Deref,
                sub,
            } => self.unary_record(e, *sub)?,
            ExprKind::Subscript { base, index } => self.array_record(e, *base, *index)?,
            ExprKind::Member { .. } => self.member_record(e)?,
            ExprKind::Binary { op, lhs, rhs } if op.is_assignment() => {
                self.operator_record(e, DerefKind::Assign, *op, *lhs, *rhs)?
            }
            ExprKind::Binary { op, lhs, rhs } if op.is_logic() => {
                self.operator_record(e, DerefKind::Logic, *op, *lhs, *rhs)?
            }
            ExprKind::OffsetOf { record, path } => self.offsetof_record(e, *record, path)?,
            _ => {
                return Err(DbError::UnsupportedExpressionKind(print::expr(ast, e)));
            }
        };
        let idx = self.push_record(rec);
        self.records.insert(e, idx);
        Ok(idx)
    }

    fn unary_record(&mut self, e: ExprId, sub: ExprId) -> Result<RawDeref, DbError> {
        let ast = self.ast;
        let mut acc = 0;
        let mut ops = Vec::new();
        self.fold(sub, Sign::Plus, &mut acc, &mut ops)?;
        let mut rec = self.new_record(DerefKind::Unary, e);
        if ops.is_empty() {
            rec.base.push(RawRef::plain(RefTarget::Address(acc)));
            rec.offset = Some(0);
            return Ok(rec);
        }
        let pick = ops
            .iter()
            .position(|o| ast.is_pointer_like(ast.expr(o.expr).ty))
            .unwrap_or(0);
        let subject = ops.remove(pick);
        rec.cast = subject.cast;
        self.push_operand(subject, &mut rec.base)?;
        for o in ops {
            self.push_operand(o, &mut rec.refs)?;
        }
        rec.offset = Some(acc);
        Ok(rec)
    }

    fn array_record(&mut self, e: ExprId, base: ExprId, index: ExprId) -> Result<RawDeref, DbError> {
        let mut base_off = 0;
        let mut base_ops = Vec::new();
        self.fold(base, Sign::Plus, &mut base_off, &mut base_ops)?;
        let mut offset = 0;
        let mut index_ops = Vec::new();
        self.fold(index, Sign::Plus, &mut offset, &mut index_ops)?;

        let mut rec = self.new_record(DerefKind::Array, e);
        if base_ops.is_empty() {
            rec.base.push(RawRef::plain(RefTarget::Address(base_off)));
        } else {
            offset = offset.wrapping_add(base_off);
            rec.cast = base_ops[0].cast;
            for o in base_ops {
                self.push_operand(o, &mut rec.base)?;
            }
        }
        for o in index_ops {
            self.push_operand(o, &mut rec.refs)?;
        }
        rec.offset = Some(offset);
        Ok(rec)
    }

    fn operator_record(
        &mut self,
        e: ExprId,
        kind: DerefKind,
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    ) -> Result<RawDeref, DbError> {
        let mut rec = self.new_record(kind, e);
        rec.offset = Some(op.code());
        let (l, cast) = self.strip(lhs)?;
        rec.cast = cast;
        self.collect_stripped(l, cast, &mut rec.base)?;
        self.collect_refs(rhs, &mut rec.refs)?;
        Ok(rec)
    }

    /// Appends one field step (outer-to-inner) and returns its position.
    fn member_step(
        &mut self,
        rec: &mut RawDeref,
        base: ExprId,
        field: DeclId,
        arrow: bool,
    ) -> Result<usize, DbError> {
        let ast = self.ast;
        let object = ast.expr(base).ty;
        let object = if arrow { ast.pointee(object) } else { Some(object) };
        let record = object.and_then(|t| ast.record_of(t));
        let (ty, index) = match record.and_then(|r| ast.decl_type(r)) {
            Some(rty) => {
                let tid = self.ctx.canon().canonicalize(rty)?;
                match self.ctx.types.field_index(tid, field) {
                    Some(i) => (tid as i64, i as i64),
                    None => {
                        self.ctx.report(DbError::NotRegistered {
                            universe: Universe::Type,
                            what: format!(
                                "field `{}` of `{}`",
                                ast.decl(field).name,
                                ast.ty(rty).spelling
                            ),
                        })?;
                        (tid as i64, -1)
                    }
                }
            }
            None => {
                self.ctx.report(DbError::UnsupportedExpressionKind(format!(
                    "member `{}` of a non-record",
                    ast.decl(field).name
                )))?;
                (-1, -1)
            }
        };
        rec.member.push(index);
        rec.member_types.push(ty);
        rec.access.push(if arrow {
            MemberAccess::Pointer
        } else {
            MemberAccess::Value
        });
        rec.shift.push(0);
        rec.mcall.push(None);
        Ok(rec.member.len() - 1)
    }

    /// One record for a whole member chain such as `a->b.c->d`.
    fn member_record(&mut self, e: ExprId) -> Result<RawDeref, DbError> {
        let ast = self.ast;
        let mut rec = self.new_record(DerefKind::Member, e);
        let mut cur = e;
        while let ExprKind::Member { base, field, arrow } = &ast.expr(cur).kind {
            // Unnamed fields of anonymous members are transparent.
            let step = if ast.anonymous_member(*field).is_some() {
                None
            } else {
                Some(self.member_step(&mut rec, *base, *field, *arrow)?)
            };
            let mut shift = 0;
            let mut ops = Vec::new();
            self.fold(*base, Sign::Plus, &mut shift, &mut ops)?;
            if ops.is_empty() {
                rec.base.push(RawRef::plain(RefTarget::Address(shift)));
                break;
            }
            if let Some(k) = step {
                rec.shift[k] = shift;
            }
            let pick = ops
                .iter()
                .position(|o| matches!(ast.expr(o.expr).kind, ExprKind::Member { .. }))
                .or_else(|| {
                    ops.iter()
                        .position(|o| ast.is_pointer_like(ast.expr(o.expr).ty))
                })
                .unwrap_or(0);
            let next = ops.remove(pick);
            for o in ops {
                let start = rec.refs.len();
                self.push_operand(o, &mut rec.refs)?;
                for r in &mut rec.refs[start..] {
                    r.mi = step.map(|k| k as u32);
                }
            }
            match &ast.expr(next.expr).kind {
                ExprKind::Member { .. } => {
                    self.consumed.insert(next.expr);
                    cur = next.expr;
                }
                ExprKind::Call { .. } => {
                    let call = self.ensure_call(next.expr)?;
                    if let Some(k) = step {
                        rec.mcall[k] = Some(call);
                    }
                    rec.cast = next.cast;
                    rec.base.push(RawRef {
                        target: RefTarget::Call(call),
                        cast: next.cast,
                        sign: next.sign,
                        mi: None,
                    });
                    break;
                }
                _ => {
                    rec.cast = next.cast;
                    self.push_operand(next, &mut rec.base)?;
                    break;
                }
            }
        }
        // Steps were numbered outer-to-inner; `mi` is in source order.
        let n = rec.member.len() as u32;
        for r in &mut rec.refs {
            if let Some(k) = r.mi {
                r.mi = Some(n.saturating_sub(1).saturating_sub(k));
            }
        }
        Ok(rec)
    }

    fn offsetof_record(
        &mut self,
        e: ExprId,
        record: crate::ast::TyId,
        path: &[OffsetOfComponent],
    ) -> Result<RawDeref, DbError> {
        let ast = self.ast;
        let mut rec = self.new_record(DerefKind::OffsetOf, e);
        let mut cur = record;
        let mut acc: i64 = 0;
        let mut constant = true;
        for comp in path {
            match comp {
                OffsetOfComponent::Field(f) => {
                    if ast.anonymous_member(*f).is_some() {
                        if let Some(t) = ast.decl_type(*f) {
                            cur = t;
                        }
                        continue;
                    }
                    let Some(rty) = ast.record_of(cur).and_then(|r| ast.decl_type(r)) else {
                        self.ctx.report(DbError::InvalidOffsetOfChain(format!(
                            "`{}` is not a record",
                            ast.ty(cur).spelling
                        )))?;
                        constant = false;
                        break;
                    };
                    let tid = self.ctx.canon().canonicalize(rty)?;
                    let Some(index) = self.ctx.types.field_index(tid, *f) else {
                        self.ctx.report(DbError::InvalidOffsetOfChain(format!(
                            "no field `{}` in `{}`",
                            ast.decl(*f).name,
                            ast.ty(rty).spelling
                        )))?;
                        constant = false;
                        break;
                    };
                    let field = &self.ctx.types.entry(tid).record.fields[index as usize];
                    acc = acc.wrapping_add(field.offset as i64);
                    rec.member.push(index as i64);
                    rec.member_types.push(tid as i64);
                    match ast.decl_type(*f) {
                        Some(t) => cur = t,
                        None => break,
                    }
                }
                OffsetOfComponent::Index(ix) => {
                    let Some(elem) = ast.pointee(cur) else {
                        self.ctx.report(DbError::InvalidOffsetOfChain(format!(
                            "subscript of non-array `{}`",
                            ast.ty(cur).spelling
                        )))?;
                        constant = false;
                        break;
                    };
                    let position = rec.member.len() as u32;
                    rec.member.push(-1);
                    rec.member_types.push(-1);
                    let size = ast.ty(ast.resolve(elem)).size.unwrap_or(0) as i64;
                    match consteval::evaluate(ast, *ix) {
                        Some(v) => acc = acc.wrapping_add(v.wrapping_mul(size)),
                        None => {
                            constant = false;
                            let start = rec.refs.len();
                            self.collect_refs(*ix, &mut rec.refs)?;
                            for r in &mut rec.refs[start..] {
                                r.mi = Some(position);
                            }
                        }
                    }
                    cur = elem;
                }
            }
        }
        rec.member.reverse();
        rec.member_types.reverse();
        rec.offset = Some(if constant { acc } else { -1 });
        Ok(rec)
    }

    fn init_record(&mut self, var: DeclId, local: u64, init: ExprId) -> Result<(), DbError> {
        let ast = self.ast;
        let mut rec = self.new_record(DerefKind::Init, init);
        if let Some(text) = print::initializer(ast, var) {
            rec.expr = format!("[{}]: {}", print::location(ast, &ast.decl(var).loc), text);
        }
        rec.base.push(RawRef::plain(RefTarget::Local {
            id: local,
            parm: false,
        }));
        rec.offset = Some(match &ast.expr(init).kind {
            ExprKind::InitList { inits } => inits.len() as i64,
            _ => 1,
        });
        self.collect_refs(init, &mut rec.refs)?;
        self.push_record(rec);
        Ok(())
    }

    /// Condition of a control statement; the offset names the scope it guards.
    fn cond_record(&mut self, cond: ExprId, body: StmtId) -> Result<(), DbError> {
        let offset = self
            .csids
            .get(&body)
            .copied()
            .unwrap_or_else(|| self.current_cs());
        let mut rec = self.new_record(DerefKind::Cond, cond);
        rec.offset = Some(offset);
        self.collect_refs(cond, &mut rec.base)?;
        self.push_record(rec);
        Ok(())
    }

    fn return_record(&mut self, value: ExprId) -> Result<(), DbError> {
        let mut rec = self.new_record(DerefKind::Return, value);
        self.collect_refs(value, &mut rec.base)?;
        self.push_record(rec);
        Ok(())
    }

    fn open_switch(&mut self, cond: ExprId) {
        let info = SwitchInfo {
            condition: print::expr(self.ast, cond),
            csid: self.current_cs(),
            cases: Vec::new(),
        };
        self.open_switches.push(self.func.switches.len());
        self.func.switches.push(info);
    }

    /// Adds a label to the innermost enclosing `switch`.
    fn case_label(&mut self, value: ExprId) {
        let ast = self.ast;
        let Some(&sw) = self.open_switches.last() else {
            return;
        };
        self.func.switches[sw].cases.push(CaseLabel {
            value: consteval::evaluate(ast, value),
            enumerator: enumerator(ast, value),
            expr: print::expr(ast, value),
        });
    }

    fn asm_stmt(&mut self, text: &str, operands: &[ExprId]) -> Result<(), DbError> {
        let mut refs = Vec::new();
        for &o in operands {
            self.collect_refs(o, &mut refs)?;
        }
        let csid = self.current_cs();
        self.func.asm.push(RawAsm {
            csid,
            text: text.to_string(),
            operands: refs,
        });
        Ok(())
    }

    /// Index of the call site for `e`, creating it with its argument records.
    fn ensure_call(&mut self, e: ExprId) -> Result<usize, DbError> {
        if let Some(&idx) = self.calls.get(&e) {
            return Ok(idx);
        }
        let ast = self.ast;
        let ExprKind::Call { callee, args } = &ast.expr(e).kind else {
            return Err(DbError::UnsupportedExpressionKind(print::expr(ast, e)));
        };
        let target = resolve::static_callee(ast, *callee).map(|c| match c {
            StaticCallee::Decl(d) => RawCallee::Decl(d),
            StaticCallee::Name(n) => RawCallee::Name(n),
        });
        if target.is_some()
            && let Some(r) = resolve::callee_ref_expr(ast, *callee)
        {
            self.direct.insert(r);
        }
        let idx = self.func.calls.len();
        let indirect = target.is_none();
        self.func.calls.push(RawCall {
            callee: target,
            deref: None,
            args: Vec::new(),
            ord: self.ords.get(&e).copied().unwrap_or(0),
            csid: self.current_cs(),
            expr: print::located_expr(ast, e),
        });
        self.calls.insert(e, idx);

        if indirect {
            let mut rec = self.new_record(DerefKind::Function, e);
            self.collect_refs(*callee, &mut rec.base)?;
            rec.offset = Some(idx as i64);
            let r = self.push_record(rec);
            self.func.calls[idx].deref = Some(r);
        }
        for (i, a) in args.iter().enumerate() {
            let mut rec = self.new_record(DerefKind::Parm, *a);
            self.collect_refs(*a, &mut rec.base)?;
            rec.offset = Some(i as i64);
            let r = self.push_record(rec);
            self.func.calls[idx].args.push(r);
        }
        Ok(idx)
    }
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

struct RefBinder<'b, 'r> {
    resolver: &'b mut CallResolver<'r>,
    diags: &'b mut Diagnostics,
    policy: Policy,
    kinds: Vec<DerefKind>,
    canon: Vec<usize>,
}

impl RefBinder<'_, '_> {
    fn bind(&mut self, r: &RawRef) -> Result<OffsetRef, DbError> {
        let (kind, id) = match &r.target {
            RefTarget::Function(d) => match self.resolver.resolve_decl(*d) {
                Ok(c) => (callee_ref_kind(c.kind), RefValue::Id(c.id as i64)),
                Err(e) => {
                    self.diags.report(self.policy, e)?;
                    (RefKind::Function, RefValue::Id(-1))
                }
            },
            RefTarget::Unresolved(n) => {
                let c = self.resolver.resolve_name(n)?;
                (RefKind::Unresolved, RefValue::Id(c.id as i64))
            }
            RefTarget::Global(d) => match self.resolver.global_id(*d) {
                Ok(id) => (RefKind::Global, RefValue::Id(id as i64)),
                Err(e) => {
                    self.diags.report(self.policy, e)?;
                    (RefKind::Global, RefValue::Id(-1))
                }
            },
            RefTarget::Local { id, parm } => (
                if *parm { RefKind::Parm } else { RefKind::Local },
                RefValue::Id(*id as i64),
            ),
            RefTarget::Record(j) => {
                let kind = self
                    .kinds
                    .get(*j)
                    .and_then(|k| k.referent())
                    .unwrap_or(RefKind::Unary);
                match self.canon.get(*j) {
                    Some(c) => (kind, RefValue::Id(*c as i64)),
                    None => {
                        self.diags.report(
                            self.policy,
                            DbError::NotRegistered {
                                universe: Universe::Function,
                                what: format!("dereference record {j}"),
                            },
                        )?;
                        (kind, RefValue::Id(-1))
                    }
                }
            }
            RefTarget::Call(i) => (RefKind::Callref, RefValue::Id(*i as i64)),
            RefTarget::IntegerLiteral(v) => (RefKind::IntegerLiteral, RefValue::Id(*v)),
            RefTarget::CharLiteral(c) => (RefKind::CharLiteral, RefValue::Id(*c as i64)),
            RefTarget::FloatLiteral(f) => (RefKind::FloatLiteral, RefValue::Float(*f)),
            RefTarget::StringLiteral(s) => (RefKind::StringLiteral, RefValue::Text(s.clone())),
            RefTarget::Integer(v) => (RefKind::Integer, RefValue::Id(*v)),
            RefTarget::Address(v) => (RefKind::Address, RefValue::Id(*v)),
        };
        Ok(OffsetRef {
            kind,
            id,
            cast: r.cast.map(|c| c as i64),
            mi: r.mi,
            sign: r.sign,
        })
    }

    fn bind_all(&mut self, refs: &[RawRef]) -> Result<Vec<OffsetRef>, DbError> {
        refs.iter().map(|r| self.bind(r)).collect()
    }

    fn record(&mut self, d: RawDeref) -> Result<DerefRecord, DbError> {
        let base = self.bind_all(&d.base)?;
        let offsetrefs = self.bind_all(&d.refs)?;
        let mcall = d
            .mcall
            .iter()
            .any(Option::is_some)
            .then(|| d.mcall.iter().map(|c| c.map_or(-1, |c| c as i64)).collect());
        Ok(DerefRecord {
            kind: d.kind,
            offset: d.offset,
            base,
            offsetrefs,
            member: d.member,
            access: d.access,
            shift: d.shift,
            member_types: d.member_types,
            mcall,
            cast: d.cast.map(|c| c as i64),
            ord: vec![d.ord],
            expr: d.expr,
            csid: d.csid,
        })
    }
}

fn callee_ref_kind(kind: crate::db::CalleeKind) -> RefKind {
    match kind {
        crate::db::CalleeKind::Func => RefKind::Function,
        crate::db::CalleeKind::Funcdecl => RefKind::Funcdecl,
        crate::db::CalleeKind::Unresolved => RefKind::Unresolved,
    }
}

fn referenced_records(derefs: &[RawDeref], asm: &[RawAsm]) -> HashSet<usize> {
    derefs
        .iter()
        .flat_map(|d| d.base.iter().chain(d.refs.iter()))
        .chain(asm.iter().flat_map(|a| a.operands.iter()))
        .filter_map(|r| match r.target {
            RefTarget::Record(j) => Some(j),
            _ => None,
        })
        .collect()
}

/// Binds references to ids and folds structurally equal records together.
///
/// A record another record points at is never merged away, so references
/// stay valid. Merged records keep the ordinals of every occurrence.
pub(crate) fn finalize_function(
    ast: &TranslationUnit,
    raw: RawFunction,
    resolver: &mut CallResolver<'_>,
    diags: &mut Diagnostics,
    policy: Policy,
) -> Result<FunctionEntry, DbError> {
    let referenced = referenced_records(&raw.derefs, &raw.asm);
    let mut binder = RefBinder {
        resolver,
        diags,
        policy,
        kinds: raw.derefs.iter().map(|d| d.kind).collect(),
        canon: Vec::with_capacity(raw.derefs.len()),
    };

    let mut derefs: Vec<DerefRecord> = Vec::new();
    let mut seen = HashMap::new();
    for (i, d) in raw.derefs.into_iter().enumerate() {
        let rec = binder.record(d)?;
        let key = rec.dedup_key();
        if !referenced.contains(&i)
            && let Some(&first) = seen.get(&key)
        {
            let target: &mut DerefRecord = &mut derefs[first];
            target.ord.extend(rec.ord);
            binder.canon.push(first);
            continue;
        }
        let idx = derefs.len();
        seen.entry(key).or_insert(idx);
        derefs.push(rec);
        binder.canon.push(idx);
    }

    let mut calls = Vec::with_capacity(raw.calls.len());
    for c in raw.calls {
        let callee = match c.callee {
            Some(RawCallee::Decl(d)) => match binder.resolver.resolve_decl(d) {
                Ok(r) => Some(r),
                Err(e) => {
                    binder.diags.report(policy, e)?;
                    None
                }
            },
            Some(RawCallee::Name(n)) => Some(binder.resolver.resolve_name(&n)?),
            None => None,
        };
        calls.push(CallSite {
            callee,
            deref: c.deref.map(|d| binder.canon[d]),
            args: c.args.iter().map(|a| binder.canon[*a]).collect(),
            ord: c.ord,
            csid: c.csid,
            expr: c.expr,
        });
    }

    let mut asm = Vec::with_capacity(raw.asm.len());
    for a in raw.asm {
        asm.push(AsmInfo {
            csid: a.csid,
            text: a.text,
            operands: binder.bind_all(&a.operands)?,
        });
    }
    let fops = fops::resolve_stores(&raw.stores, binder.resolver, binder.diags, policy)?;

    let funrefs = resolve_callees(&raw.refs.functions, binder.resolver, binder.diags, policy)?;
    let globalrefs = resolve_globals(&raw.refs.globals, binder.resolver, binder.diags, policy)?;

    let decl = ast.decl(raw.decl);
    let f = ast.function(raw.decl);
    let record = crate::db::FuncRecord {
        id: raw.id,
        name: ast.qualified_name(raw.decl),
        linkage: f.map(|f| f.linkage).unwrap_or_default(),
        fid: decl.loc.file.0 as u64,
        location: print::location(ast, &decl.loc),
        hash: String::new(),
        declhash: String::new(),
        signature: f.map(|f| ast.ty(f.ty).spelling.clone()).unwrap_or_default(),
        types: raw.types,
        variadic: f
            .and_then(|f| ast.signature(f.ty))
            .is_some_and(|(_, _, v)| v),
        inline: f.is_some_and(|f| f.is_inline),
        class: raw.class,
        locals: raw.locals,
        csmap: raw.csmap,
        calls,
        derefs,
        switches: raw.switches,
        asm,
        fops,
        refs: raw.refs.types.iter().map(|t| *t as i64).collect(),
        globalrefs,
        funrefs,
        literals: raw.refs.literals,
        declcount: raw.declcount,
        taint: Vec::new(),
        body: raw.body,
    };
    Ok(FunctionEntry {
        decl: raw.decl,
        record,
        local_ids: raw.local_ids,
    })
}
