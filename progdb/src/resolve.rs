//! Call resolution.
//!
//! A callee declaration is bound to exactly one table entry. The first rule
//! that matches wins:
//!
//! 1. a defined function of this unit,
//! 2. a declaration-only function, by canonical declaration,
//! 3. the representative of the compile-time-assert helper family,
//! 4. the primary pattern of a function template,
//! 5. the unresolved-name bucket, keyed by spelling.

use regex::Regex;
use tracing::trace;

use crate::ast::{DeclId, DeclKind, ExprId, ExprKind, TranslationUnit};
use crate::db::{CalleeKind, CalleeRef};
use crate::error::DbError;
use crate::registry::Registries;

pub struct CallResolver<'r> {
    ast: &'r TranslationUnit,
    registries: &'r mut Registries,
    compiletime_assert: Option<&'r Regex>,
    cta_representative: Option<DeclId>,
}

impl<'r> CallResolver<'r> {
    pub fn new(
        ast: &'r TranslationUnit,
        registries: &'r mut Registries,
        compiletime_assert: Option<&'r Regex>,
        cta_representative: Option<DeclId>,
    ) -> Self {
        CallResolver {
            ast,
            registries,
            compiletime_assert,
            cta_representative,
        }
    }

    /// Resolves a callee expression. `None` means the call goes through a
    /// pointer and has no static callee.
    pub fn resolve_callee(&mut self, callee: ExprId) -> Result<Option<CalleeRef>, DbError> {
        match static_callee(self.ast, callee) {
            Some(StaticCallee::Decl(d)) => self.resolve_decl(d).map(Some),
            Some(StaticCallee::Name(n)) => self.resolve_name(&n).map(Some),
            None => Ok(None),
        }
    }

    pub fn resolve_decl(&mut self, decl: DeclId) -> Result<CalleeRef, DbError> {
        let ast = self.ast;
        let d = ast.decl(decl);
        let f = match &d.kind {
            DeclKind::Function(f) => f,
            DeclKind::FunctionTemplate { pattern } if *pattern != decl => {
                return self.resolve_decl(*pattern);
            }
            _ => return Err(DbError::MissingFunctionInMap(d.name.clone())),
        };
        let canonical = ast.canonical(decl);

        if let Some(id) = self.lookup(canonical) {
            return Ok(id);
        }

        if let (Some(re), Some(rep)) = (self.compiletime_assert, self.cta_representative)
            && re.is_match(&d.name)
            && let Some(id) = self.lookup(ast.canonical(rep))
        {
            trace!(name = %d.name, "collapsed compile-time assert helper");
            return Ok(id);
        }

        if let Some(t) = f.template
            && let DeclKind::FunctionTemplate { pattern } = &ast.decl(t).kind
            && ast.canonical(*pattern) != canonical
            && let Some(id) = self.lookup(ast.canonical(*pattern))
        {
            return Ok(id);
        }

        self.resolve_name(&d.name)
    }

    /// Interns `name` into the unresolved bucket.
    pub fn resolve_name(&mut self, name: &str) -> Result<CalleeRef, DbError> {
        if name.is_empty() {
            return Err(DbError::FatalResolution(
                "callee declaration without a name".to_string(),
            ));
        }
        let (id, new) = self.registries.unresolved.register(name.to_string());
        if new {
            trace!(name, id, "new unresolved callee");
        }
        Ok(CalleeRef {
            kind: CalleeKind::Unresolved,
            id,
        })
    }

    /// Id of a variable with static storage, by canonical declaration.
    pub fn global_id(&self, canonical: DeclId) -> Result<u64, DbError> {
        self.registries.globals.lookup(&canonical)
    }

    fn lookup(&self, canonical: DeclId) -> Option<CalleeRef> {
        if let Some(id) = self.registries.funcs.get(&canonical) {
            return Some(CalleeRef {
                kind: CalleeKind::Func,
                id,
            });
        }
        self.registries
            .funcdecls
            .get(&canonical)
            .map(|id| CalleeRef {
                kind: CalleeKind::Funcdecl,
                id,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaticCallee {
    Decl(DeclId),
    Name(String),
}

/// The declaration a call is statically bound to, looking through parens
/// and implicit conversions.
pub fn static_callee(ast: &TranslationUnit, callee: ExprId) -> Option<StaticCallee> {
    let mut e = callee;
    loop {
        match &ast.expr(e).kind {
            ExprKind::Paren { sub } => e = *sub,
            ExprKind::Cast {
                sub,
                explicit: false,
                ..
            } => e = *sub,
            ExprKind::DeclRef { decl } => {
                return match &ast.decl(*decl).kind {
                    DeclKind::Function(_) | DeclKind::FunctionTemplate { .. } => {
                        Some(StaticCallee::Decl(*decl))
                    }
                    _ => None,
                };
            }
            ExprKind::UnresolvedName { name } => return Some(StaticCallee::Name(name.clone())),
            _ => return None,
        }
    }
}

/// Expression node of the callee reference itself, if the call is direct.
pub fn callee_ref_expr(ast: &TranslationUnit, callee: ExprId) -> Option<ExprId> {
    let mut e = callee;
    loop {
        match &ast.expr(e).kind {
            ExprKind::Paren { sub } => e = *sub,
            ExprKind::Cast {
                sub,
                explicit: false,
                ..
            } => e = *sub,
            ExprKind::DeclRef { .. } | ExprKind::UnresolvedName { .. } => return Some(e),
            _ => return None,
        }
    }
}
