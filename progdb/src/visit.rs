//! First pass over one translation unit.
//!
//! [`TraversalContext`] carries everything the visitors need: the unit,
//! the immutable build options, the registries, the type table and the
//! diagnostic buckets. It is created per unit and never shared between
//! workers. After traversal, [`TraversalContext::finish`] reconciles
//! declarations with definitions, resolves every symbolic reference and
//! produces the [`UnitTables`] the later passes work on.

use std::collections::{BTreeSet, HashMap, HashSet};

use regex::Regex;
use tracing::{debug, info};

use crate::ast::{DeclId, DeclKind, ExprId, ExprKind, TranslationUnit};
use crate::db::{
    CalleeRef, Database, FuncDeclRecord, FuncRecord, GlobalRecord, Literals, UnresolvedFunc,
};
use crate::deref::{self, BodyWalker, RawFunction};
use crate::error::{DbError, Diagnostics, Policy};
use crate::fops::{self, RawStore};
use crate::print;
use crate::registry::Registries;
use crate::resolve::CallResolver;
use crate::types::{Canonicalizer, TypeEntry, TypeTable};

/// Default name pattern of compiler-generated compile-time assertion helpers.
pub const DEFAULT_COMPILETIME_ASSERT: &str = r"^__compiletime_assert_\d+$";

/// Immutable per-run options shared by every worker.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub policy: Policy,
    /// Helpers whose names match are collapsed into one representative.
    pub compiletime_assert: Option<Regex>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            policy: Policy::BestEffort,
            compiletime_assert: Regex::new(DEFAULT_COMPILETIME_ASSERT).ok(),
        }
    }
}

impl BuildOptions {
    pub fn strict() -> Self {
        BuildOptions {
            policy: Policy::Strict,
            ..BuildOptions::default()
        }
    }

    /// Options with a custom helper pattern; an empty pattern disables collapsing.
    pub fn with_compiletime_assert(policy: Policy, pattern: &str) -> Result<Self, regex::Error> {
        let compiletime_assert = if pattern.is_empty() {
            None
        } else {
            Some(Regex::new(pattern)?)
        };
        Ok(BuildOptions {
            policy,
            compiletime_assert,
        })
    }
}

// ---------------------------------------------------------------------------
// Reference sets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum RawCallee {
    Decl(DeclId),
    Name(String),
}

/// Types, globals, functions and literals an initializer or body refers to.
#[derive(Debug, Default)]
pub(crate) struct RefSets {
    pub types: BTreeSet<u64>,
    pub globals: BTreeSet<DeclId>,
    pub functions: Vec<RawCallee>,
    pub literals: Literals,
}

impl RefSets {
    fn add_function(&mut self, f: RawCallee) {
        if !self.functions.contains(&f) {
            self.functions.push(f);
        }
    }
}

#[derive(Debug)]
pub(crate) struct RawGlobal {
    decl: DeclId,
    ty: u64,
    defined: bool,
    init: Option<ExprId>,
    init_decl: Option<DeclId>,
    refs: RefSets,
    stores: Vec<RawStore>,
}

#[derive(Debug)]
struct DeclaredFunction {
    canonical: DeclId,
    decl: DeclId,
    types: Vec<i64>,
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

pub struct TraversalContext<'a> {
    pub(crate) ast: &'a TranslationUnit,
    pub(crate) options: &'a BuildOptions,
    pub(crate) registries: Registries,
    pub(crate) types: TypeTable,
    pub(crate) diagnostics: Diagnostics,
    functions: Vec<RawFunction>,
    globals: Vec<RawGlobal>,
    declared: Vec<DeclaredFunction>,
    declared_seen: HashSet<DeclId>,
    cta_representative: Option<DeclId>,
}

impl<'a> TraversalContext<'a> {
    pub fn new(ast: &'a TranslationUnit, options: &'a BuildOptions) -> Self {
        TraversalContext {
            ast,
            options,
            registries: Registries::default(),
            types: TypeTable::default(),
            diagnostics: Diagnostics::default(),
            functions: Vec::new(),
            globals: Vec::new(),
            declared: Vec::new(),
            declared_seen: HashSet::new(),
            cta_representative: None,
        }
    }

    pub(crate) fn canon(&mut self) -> Canonicalizer<'_> {
        Canonicalizer::new(
            self.ast,
            &mut self.types,
            &mut self.diagnostics,
            self.options.policy,
        )
    }

    pub(crate) fn report(&mut self, err: DbError) -> Result<(), DbError> {
        self.diagnostics.report(self.options.policy, err)
    }

    /// Visits every file-scope declaration in source order.
    pub fn traverse(&mut self) -> Result<(), DbError> {
        let ast = self.ast;
        for &d in &ast.top_level {
            self.visit_decl(d)?;
        }
        info!(
            file = %ast.main_path(),
            types = self.types.len(),
            funcs = self.registries.funcs.len(),
            globals = self.registries.globals.len(),
            "traversed unit"
        );
        Ok(())
    }

    fn visit_decl(&mut self, d: DeclId) -> Result<(), DbError> {
        let ast = self.ast;
        let decl = ast.decl(d);
        match &decl.kind {
            DeclKind::Function(f) => {
                if f.body.is_some() {
                    self.define_function(d)
                } else {
                    self.declare_function(d)
                }
            }
            DeclKind::FunctionTemplate { pattern } => match ast.function(*pattern) {
                Some(f) if f.body.is_some() => self.define_function(*pattern),
                Some(_) => self.declare_function(*pattern),
                None => self.report(DbError::UnsupportedDeclKind(format!(
                    "function template `{}` without pattern",
                    decl.name
                ))),
            },
            DeclKind::Var(_) => self.visit_global(d).map(drop),
            DeclKind::Record(r) => {
                if r.complete || r.definition.is_none() {
                    self.canon().canonicalize(r.ty)?;
                }
                Ok(())
            }
            DeclKind::Enum(e) => self.canon().canonicalize(e.ty).map(drop),
            DeclKind::Typedef { ty, .. } => self.canon().canonicalize(*ty).map(drop),
            DeclKind::Param(_) | DeclKind::Field(_) | DeclKind::EnumConstant { .. } => Ok(()),
            DeclKind::Unsupported { what } => {
                self.report(DbError::UnsupportedDeclKind(format!("{what} `{}`", decl.name)))
            }
        }
    }

    /// Notes a declaration without body. Ids are allocated in [`Self::finish`]
    /// for the declarations that never received a definition.
    pub(crate) fn declare_function(&mut self, d: DeclId) -> Result<(), DbError> {
        let ast = self.ast;
        let decl = ast.decl(d);
        let Some(f) = ast.function(d) else {
            return Ok(());
        };
        if decl.implicit {
            return Ok(());
        }
        let canonical = ast.canonical(d);
        if let Some(re) = &self.options.compiletime_assert
            && re.is_match(&decl.name)
        {
            if self.cta_representative.is_some() {
                return Ok(());
            }
            debug!(name = %decl.name, "compile-time assert representative");
            self.cta_representative = Some(canonical);
        }
        let types = self.signature_types(f.ty)?;
        if self.declared_seen.insert(canonical) {
            self.declared.push(DeclaredFunction {
                canonical,
                decl: d,
                types,
            });
        }
        Ok(())
    }

    pub(crate) fn signature_types(&mut self, fn_ty: crate::ast::TyId) -> Result<Vec<i64>, DbError> {
        let ast = self.ast;
        self.canon().canonicalize(fn_ty)?;
        let mut types = Vec::new();
        if let Some((ret, params, _)) = ast.signature(fn_ty) {
            types.push(self.canon().canonicalize(ret)? as i64);
            for p in params {
                types.push(self.canon().canonicalize(*p)? as i64);
            }
        }
        Ok(types)
    }

    fn define_function(&mut self, d: DeclId) -> Result<(), DbError> {
        let ast = self.ast;
        let canonical = ast.canonical(d);
        let (id, new) = self.registries.funcs.register(canonical);
        if !new {
            debug!(name = %ast.decl(d).name, id, "skipping second definition");
            return Ok(());
        }
        debug!(name = %ast.qualified_name(d), id, "function");
        let raw = BodyWalker::new(self, d, id)?.run()?;
        debug_assert_eq!(self.functions.len() as u64, id);
        self.functions.push(raw);
        Ok(())
    }

    /// Registers a variable with static storage; redeclarations merge.
    pub(crate) fn visit_global(&mut self, d: DeclId) -> Result<u64, DbError> {
        let ast = self.ast;
        let Some(v) = ast.var(d) else {
            return Err(DbError::UnsupportedDeclKind(format!(
                "`{}` is not a variable",
                ast.decl(d).name
            )));
        };
        let canonical = ast.canonical(d);
        let (id, new) = self.registries.globals.register(canonical);
        if new {
            let ty = self.canon().canonicalize(v.ty)?;
            debug!(name = %ast.decl(d).name, id, "global");
            self.globals.push(RawGlobal {
                decl: canonical,
                ty,
                defined: false,
                init: None,
                init_decl: None,
                refs: RefSets::default(),
                stores: Vec::new(),
            });
        }
        let idx = id as usize;
        if v.is_definition {
            self.globals[idx].defined = true;
        }
        if let Some(init) = v.init
            && self.globals[idx].init.is_none()
        {
            let mut refs = RefSets::default();
            self.scan_expr(&mut refs, init)?;
            let mut stores = Vec::new();
            self.initializer_stores(v.ty, init, &mut stores)?;
            let g = &mut self.globals[idx];
            g.init = Some(init);
            g.init_decl = Some(d);
            g.refs = refs;
            g.stores = stores;
        }
        Ok(id)
    }

    /// Records what a single expression node refers to.
    pub(crate) fn note_expr(
        &mut self,
        sets: &mut RefSets,
        e: ExprId,
        direct_callee: bool,
    ) -> Result<(), DbError> {
        let ast = self.ast;
        let expr = ast.expr(e);
        match &expr.kind {
            ExprKind::DeclRef { decl } => match &ast.decl(*decl).kind {
                DeclKind::Var(_) if ast.is_global_var(*decl) => {
                    sets.globals.insert(ast.canonical(*decl));
                }
                DeclKind::Function(_) | DeclKind::FunctionTemplate { .. } if !direct_callee => {
                    sets.add_function(RawCallee::Decl(*decl));
                }
                _ => {}
            },
            ExprKind::UnresolvedName { name } if !direct_callee => {
                sets.add_function(RawCallee::Name(name.clone()));
            }
            ExprKind::IntLit { value } => {
                sets.literals.integer.insert(*value as i64);
            }
            ExprKind::CharLit { value } => {
                sets.literals.character.insert(*value);
            }
            ExprKind::FloatLit { value } => sets.literals.add_float(*value),
            ExprKind::StringLit { value } => {
                sets.literals.string.insert(value.clone());
            }
            ExprKind::Cast { explicit: true, .. } | ExprKind::CompoundLiteral { .. } => {
                let t = self.canon().canonicalize(expr.ty)?;
                sets.types.insert(t);
            }
            ExprKind::SizeOf { arg } | ExprKind::AlignOf { arg } => {
                let t = self.canon().canonicalize(*arg)?;
                sets.types.insert(t);
            }
            ExprKind::OffsetOf { record, .. } => {
                let t = self.canon().canonicalize(*record)?;
                sets.types.insert(t);
            }
            ExprKind::Unsupported { what } => {
                self.report(DbError::UnsupportedExpressionKind(what.clone()))?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Scans a whole initializer expression.
    fn scan_expr(&mut self, sets: &mut RefSets, e: ExprId) -> Result<(), DbError> {
        self.note_expr(sets, e, false)?;
        if let ExprKind::StmtExpr { .. } = self.ast.expr(e).kind {
            return self.report(DbError::UnsupportedExpressionKind(
                "statement expression in initializer".to_string(),
            ));
        }
        for c in self.ast.expr_children(e) {
            self.scan_expr(sets, c)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Freezes the registries and resolves every symbolic reference.
    pub fn finish(self) -> Result<UnitTables<'a>, DbError> {
        let TraversalContext {
            ast,
            options,
            mut registries,
            mut types,
            mut diagnostics,
            functions,
            globals,
            declared,
            cta_representative,
            ..
        } = self;
        let policy = options.policy;

        // Declarations whose function got a body in this unit collapse into it.
        let mut funcdecls = Vec::new();
        for d in declared {
            if registries.funcs.get(&d.canonical).is_some() {
                continue;
            }
            let (id, new) = registries.funcdecls.register(d.canonical);
            if new {
                funcdecls.push(funcdecl_record(ast, id, &d));
            }
        }

        let global_ids: Vec<DeclId> = registries.globals.keys().to_vec();
        for entry in types.entries_mut() {
            let mut used = Vec::new();
            for g in &entry.globals {
                match registries.globals.lookup(g) {
                    Ok(id) => used.push(id as i64),
                    Err(e) => {
                        diagnostics.report(policy, e)?;
                        used.push(-1);
                    }
                }
            }
            entry.record.usedrefs = used;
        }

        let mut resolver = CallResolver::new(
            ast,
            &mut registries,
            options.compiletime_assert.as_ref(),
            cta_representative,
        );

        let mut funcs = Vec::with_capacity(functions.len());
        for raw in functions {
            funcs.push(deref::finalize_function(
                ast,
                raw,
                &mut resolver,
                &mut diagnostics,
                policy,
            )?);
        }

        let mut globals_out = Vec::with_capacity(globals.len());
        for (id, g) in globals.into_iter().enumerate() {
            globals_out.push(finalize_global(
                ast,
                id as u64,
                g,
                &mut resolver,
                &mut diagnostics,
                policy,
            )?);
        }
        drop(resolver);

        info!(
            file = %ast.main_path(),
            funcs = funcs.len(),
            funcdecls = funcdecls.len(),
            unresolved = registries.unresolved.len(),
            "resolved unit"
        );

        Ok(UnitTables {
            ast,
            types: types.into_entries(),
            funcs,
            funcdecls,
            globals: globals_out,
            global_decls: global_ids,
            unresolved: registries.unresolved.keys().to_vec(),
            diagnostics,
        })
    }
}

fn funcdecl_record(ast: &TranslationUnit, id: u64, d: &DeclaredFunction) -> FuncDeclRecord {
    let decl = ast.decl(d.decl);
    let (linkage, variadic, signature) = match ast.function(d.decl) {
        Some(f) => (
            f.linkage,
            ast.signature(f.ty).is_some_and(|(_, _, v)| v),
            ast.ty(f.ty).spelling.clone(),
        ),
        None => (Default::default(), false, String::new()),
    };
    FuncDeclRecord {
        id,
        name: ast.qualified_name(d.decl),
        linkage,
        fid: decl.loc.file.0 as u64,
        location: print::location(ast, &decl.loc),
        declhash: String::new(),
        signature,
        types: d.types.clone(),
        variadic,
    }
}

pub(crate) fn resolve_callees(
    callees: &[RawCallee],
    resolver: &mut CallResolver<'_>,
    diags: &mut Diagnostics,
    policy: Policy,
) -> Result<Vec<CalleeRef>, DbError> {
    let mut out: Vec<CalleeRef> = Vec::new();
    for c in callees {
        let r = match c {
            RawCallee::Decl(d) => resolver.resolve_decl(*d),
            RawCallee::Name(n) => resolver.resolve_name(n),
        };
        match r {
            Ok(r) => {
                if !out.contains(&r) {
                    out.push(r);
                }
            }
            Err(e) => diags.report(policy, e)?,
        }
    }
    Ok(out)
}

pub(crate) fn resolve_globals(
    globals: &BTreeSet<DeclId>,
    resolver: &CallResolver<'_>,
    diags: &mut Diagnostics,
    policy: Policy,
) -> Result<Vec<i64>, DbError> {
    let mut out = Vec::with_capacity(globals.len());
    for g in globals {
        match resolver.global_id(*g) {
            Ok(id) => out.push(id as i64),
            Err(e) => {
                diags.report(policy, e)?;
                out.push(-1);
            }
        }
    }
    Ok(out)
}

fn finalize_global(
    ast: &TranslationUnit,
    id: u64,
    g: RawGlobal,
    resolver: &mut CallResolver<'_>,
    diags: &mut Diagnostics,
    policy: Policy,
) -> Result<GlobalRecord, DbError> {
    let decl = ast.decl(g.decl);
    let linkage = ast.var(g.decl).map(|v| v.linkage).unwrap_or_default();
    let funrefs = resolve_callees(&g.refs.functions, resolver, diags, policy)?;
    let globalrefs = resolve_globals(&g.refs.globals, resolver, diags, policy)?;
    let fops = fops::resolve_stores(&g.stores, resolver, diags, policy)?;
    Ok(GlobalRecord {
        id,
        name: decl.name.clone(),
        linkage,
        fid: decl.loc.file.0 as u64,
        location: print::location(ast, &decl.loc),
        hash: String::new(),
        ty: g.ty as i64,
        defined: g.defined,
        init: g.init_decl.and_then(|d| print::initializer(ast, d)),
        refs: g.refs.types.iter().map(|t| *t as i64).collect(),
        globalrefs,
        funrefs,
        literals: g.refs.literals,
        fops,
    })
}

// ---------------------------------------------------------------------------
// Unit tables
// ---------------------------------------------------------------------------

/// A defined function with the context the later passes need.
#[derive(Debug)]
pub struct FunctionEntry {
    pub decl: DeclId,
    pub record: FuncRecord,
    pub local_ids: HashMap<DeclId, u64>,
}

/// Frozen, fully resolved tables of one unit, before hashing and taint.
#[derive(Debug)]
pub struct UnitTables<'a> {
    pub ast: &'a TranslationUnit,
    pub types: Vec<TypeEntry>,
    pub funcs: Vec<FunctionEntry>,
    pub funcdecls: Vec<FuncDeclRecord>,
    pub globals: Vec<GlobalRecord>,
    /// Canonical declaration of each global, indexed by global id.
    pub global_decls: Vec<DeclId>,
    pub unresolved: Vec<String>,
    pub diagnostics: Diagnostics,
}

impl UnitTables<'_> {
    pub fn into_database(self) -> Database {
        Database {
            sources: self.ast.files.clone(),
            types: self.types.into_iter().map(|t| t.record).collect(),
            funcs: self.funcs.into_iter().map(|f| f.record).collect(),
            funcdecls: self.funcdecls,
            unresolvedfuncs: self
                .unresolved
                .into_iter()
                .enumerate()
                .map(|(id, name)| UnresolvedFunc {
                    id: id as u64,
                    name,
                })
                .collect(),
            globals: self.globals,
            diagnostics: self.diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstBuilder;

    #[test]
    fn non_variable_is_not_registered_as_global() {
        let mut b = AstBuilder::new("g.c");
        let int = b.int();
        let f = b.function("f", int, &[]);
        let g = b.global("g", int, None);
        let tu = b.finish();
        let options = BuildOptions::default();
        let mut ctx = TraversalContext::new(&tu, &options);

        let err = ctx.visit_global(f).expect_err("a function is not a global");
        assert!(matches!(err, DbError::UnsupportedDeclKind(_)), "got {err:?}");
        assert_eq!(ctx.registries.globals.len(), 0, "nothing may be registered");
        assert_eq!(ctx.visit_global(g).ok(), Some(0), "first real global gets id 0");
    }
}
