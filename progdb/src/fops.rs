//! Function addresses stored into record members.
//!
//! Two store shapes are recognized: an initializer list for a record object,
//! where the n-th initializer lands in the n-th field, and a plain assignment
//! to a member expression. The stored value is searched for functions through
//! parens, casts, unary operators, the right operand of a binary operator
//! and both arms of a conditional.

use crate::ast::{DeclId, DeclKind, ExprId, ExprKind, TranslationUnit, TyId};
use crate::db::{MemberStore, StoreKind};
use crate::error::{DbError, Diagnostics, Policy};
use crate::registry::Universe;
use crate::resolve::CallResolver;
use crate::visit::{RawCallee, TraversalContext};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawStore {
    ty: u64,
    member: i64,
    func: RawCallee,
    kind: StoreKind,
}

fn stored_functions(ast: &TranslationUnit, e: ExprId, out: &mut Vec<RawCallee>) {
    match &ast.expr(e).kind {
        ExprKind::Paren { sub } | ExprKind::Cast { sub, .. } | ExprKind::Unary { sub, .. } => {
            stored_functions(ast, *sub, out)
        }
        ExprKind::DeclRef { decl } => {
            if matches!(
                ast.decl(*decl).kind,
                DeclKind::Function(_) | DeclKind::FunctionTemplate { .. }
            ) {
                out.push(RawCallee::Decl(*decl));
            }
        }
        ExprKind::Binary { rhs, .. } => stored_functions(ast, *rhs, out),
        ExprKind::Conditional {
            then, otherwise, ..
        } => {
            stored_functions(ast, *then, out);
            stored_functions(ast, *otherwise, out);
        }
        _ => {}
    }
}

impl TraversalContext<'_> {
    /// Stores made by initializing an object of type `ty` with `init`.
    pub(crate) fn initializer_stores(
        &mut self,
        ty: TyId,
        init: ExprId,
        out: &mut Vec<RawStore>,
    ) -> Result<(), DbError> {
        let ast = self.ast;
        let ExprKind::InitList { inits } = &ast.expr(init).kind else {
            return Ok(());
        };
        let Some(rec) = ast.record_of(ty) else {
            // Arrays of records initialize element by element.
            if let Some(elem) = ast.pointee(ty) {
                for &value in inits {
                    self.initializer_stores(elem, value, out)?;
                }
            }
            return Ok(());
        };
        let (Some((_, def)), Some(rty)) = (ast.record_definition(rec), ast.decl_type(rec)) else {
            return Ok(());
        };
        let record = self.canon().canonicalize(rty)?;
        let fields = def
            .members
            .iter()
            .filter(|m| matches!(ast.decl(**m).kind, DeclKind::Field(_)));
        for (&field, &value) in fields.zip(inits) {
            if let ExprKind::InitList { .. } = ast.expr(value).kind {
                if let Some(fty) = ast.decl_type(field) {
                    self.initializer_stores(fty, value, out)?;
                }
                continue;
            }
            self.member_stores(record, field, value, StoreKind::Init, out)?;
        }
        Ok(())
    }

    /// Stores made by `lhs = rhs` when `lhs` names a record member.
    pub(crate) fn assignment_stores(
        &mut self,
        lhs: ExprId,
        rhs: ExprId,
        out: &mut Vec<RawStore>,
    ) -> Result<(), DbError> {
        let ast = self.ast;
        let mut target = lhs;
        while let ExprKind::Paren { sub } = &ast.expr(target).kind {
            target = *sub;
        }
        let ExprKind::Member { base, field, arrow } = &ast.expr(target).kind else {
            return Ok(());
        };
        let object = ast.expr(*base).ty;
        let object = if *arrow { ast.pointee(object) } else { Some(object) };
        let Some(rty) = object
            .and_then(|t| ast.record_of(t))
            .and_then(|r| ast.decl_type(r))
        else {
            return Ok(());
        };
        let record = self.canon().canonicalize(rty)?;
        self.member_stores(record, *field, rhs, StoreKind::Assign, out)
    }

    fn member_stores(
        &mut self,
        record: u64,
        field: DeclId,
        value: ExprId,
        kind: StoreKind,
        out: &mut Vec<RawStore>,
    ) -> Result<(), DbError> {
        let ast = self.ast;
        let mut funcs = Vec::new();
        stored_functions(ast, value, &mut funcs);
        if funcs.is_empty() {
            return Ok(());
        }
        let member = match self.types.field_index(record, field) {
            Some(i) => i as i64,
            None => {
                self.report(DbError::NotRegistered {
                    universe: Universe::Type,
                    what: format!("field `{}` of a member store", ast.decl(field).name),
                })?;
                -1
            }
        };
        for func in funcs {
            let store = RawStore {
                ty: record,
                member,
                func,
                kind,
            };
            if !out.contains(&store) {
                out.push(store);
            }
        }
        Ok(())
    }
}

pub(crate) fn resolve_stores(
    stores: &[RawStore],
    resolver: &mut CallResolver<'_>,
    diags: &mut Diagnostics,
    policy: Policy,
) -> Result<Vec<MemberStore>, DbError> {
    let mut out = Vec::with_capacity(stores.len());
    for s in stores {
        let func = match &s.func {
            RawCallee::Decl(d) => resolver.resolve_decl(*d),
            RawCallee::Name(n) => resolver.resolve_name(n),
        };
        match func {
            Ok(func) => out.push(MemberStore {
                ty: s.ty as i64,
                member: s.member,
                func,
                kind: s.kind,
            }),
            Err(e) => diags.report(policy, e)?,
        }
    }
    Ok(out)
}
