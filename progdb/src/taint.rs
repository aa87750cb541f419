//! Parameter taint propagation.
//!
//! For every parameter the propagator computes, by depth, the locals whose
//! value derives from it. A variable becomes tainted at depth `n + 1` when a
//! depth-`n` variable appears in its initializer, on the right side of an
//! assignment to it, or in a `from` argument of a tracked call whose `to`
//! argument names it. Tracked calls come from a JSON taint database:
//!
//! ```json
//! { "exact_name": { "memcpy": [[1, 2]] }, "regex_name": { "str": [[1, 2]] } }
//! ```
//!
//! Argument positions are 1-based; `0` stands for every variadic argument.
//! `regex_name` keys match as a prefix of the callee name.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::ast::{DeclId, DeclKind, ExprId, ExprKind, StmtId, TranslationUnit};
use crate::db::TaintSet;
use crate::resolve::{self, StaticCallee};
use crate::visit::UnitTables;

/// One `[to, from]` pair of the taint database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "(u32, u32)")]
pub struct TaintRule {
    pub to: u32,
    pub from: u32,
}

impl From<(u32, u32)> for TaintRule {
    fn from((to, from): (u32, u32)) -> Self {
        TaintRule { to, from }
    }
}

impl TaintRule {
    /// Zero-based `(to, from)` argument pairs for a call with `nargs`
    /// arguments to a callee declaring `nparams` parameters.
    pub fn pairs(self, nparams: usize, nargs: usize) -> Vec<(usize, usize)> {
        let variadic = nparams..nargs.max(nparams);
        match (self.to as usize, self.from as usize) {
            (0, 0) => Vec::new(),
            (0, from) => variadic.map(|i| (i, from - 1)).collect(),
            (to, 0) => variadic.map(|i| (to - 1, i)).collect(),
            (to, from) => vec![(to - 1, from - 1)],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TaintFile {
    #[serde(default)]
    exact_name: BTreeMap<String, Vec<TaintRule>>,
    #[serde(default)]
    regex_name: BTreeMap<String, Vec<TaintRule>>,
}

/// Tracked functions, by exact name or by name prefix.
#[derive(Debug, Default)]
pub struct TaintDb {
    exact: HashMap<String, Vec<TaintRule>>,
    prefixes: Vec<(Regex, Vec<TaintRule>)>,
}

impl TaintDb {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let file: TaintFile = serde_json::from_str(text).context("invalid taint database")?;
        let mut prefixes = Vec::with_capacity(file.regex_name.len());
        for (pattern, rules) in file.regex_name {
            let re = Regex::new(&format!("^(?:{pattern})"))
                .with_context(|| format!("invalid regex_name entry `{pattern}`"))?;
            prefixes.push((re, rules));
        }
        Ok(TaintDb {
            exact: file.exact_name.into_iter().collect(),
            prefixes,
        })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading taint database {}", path.display()))?;
        let db = Self::from_json(&text)
            .with_context(|| format!("loading taint database {}", path.display()))?;
        info!(
            path = %path.display(),
            exact = db.exact.len(),
            prefixes = db.prefixes.len(),
            "loaded taint database"
        );
        Ok(db)
    }

    /// Rules for `name`; exact entries win over prefix entries.
    pub fn rules(&self, name: &str) -> Option<&[TaintRule]> {
        if let Some(r) = self.exact.get(name) {
            return Some(r);
        }
        self.prefixes
            .iter()
            .find(|(re, _)| re.is_match(name))
            .map(|(_, r)| r.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}

/// A value flow `target <- sources` found in a body.
#[derive(Debug)]
struct Flow {
    target: DeclId,
    sources: Vec<DeclId>,
}

/// Depth-indexed taint of one parameter.
pub type TaintLevels = BTreeMap<u32, BTreeSet<DeclId>>;

/// Value flows of one function body.
pub struct TaintPropagator<'t> {
    ast: &'t TranslationUnit,
    flows: Vec<Flow>,
}

impl<'t> TaintPropagator<'t> {
    pub fn new(ast: &'t TranslationUnit, function: DeclId, db: &TaintDb) -> Self {
        let mut p = TaintPropagator {
            ast,
            flows: Vec::new(),
        };
        if let Some(body) = ast.function(function).and_then(|f| f.body) {
            p.scan_stmt(body, db);
        }
        p
    }

    /// Locals and parameters are the only taintable variables.
    fn taintable(&self, d: DeclId) -> bool {
        self.ast.is_local_var(d)
    }

    /// Variables directly derived from `var`.
    pub fn successors(&self, var: DeclId) -> BTreeSet<DeclId> {
        self.flows
            .iter()
            .filter(|f| f.sources.contains(&var) && self.taintable(f.target))
            .map(|f| f.target)
            .collect()
    }

    /// Breadth-first propagation from `param` to a fixed point.
    pub fn propagate(&self, param: DeclId) -> TaintLevels {
        let mut levels = TaintLevels::new();
        let mut seen: HashSet<DeclId> = HashSet::from([param]);
        let mut frontier = vec![param];
        let mut depth = 0;
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for &v in &frontier {
                for s in self.successors(v) {
                    if seen.insert(s) {
                        next.push(s);
                    }
                }
            }
            levels.insert(depth, frontier.into_iter().collect());
            frontier = next;
            depth += 1;
        }
        levels
    }

    fn scan_stmt(&mut self, s: StmtId, db: &TaintDb) {
        let ast = self.ast;
        let (stmts, exprs) = ast.stmt_children(s);
        if let crate::ast::Stmt::Decl { decls } = ast.stmt(s) {
            for &d in decls {
                if let Some(init) = ast.var(d).and_then(|v| v.init) {
                    let mut sources = Vec::new();
                    self.variables(init, &mut sources);
                    self.flows.push(Flow { target: d, sources });
                }
            }
        }
        for e in exprs {
            self.scan_expr(e, db);
        }
        for c in stmts {
            self.scan_stmt(c, db);
        }
    }

    fn scan_expr(&mut self, e: ExprId, db: &TaintDb) {
        let ast = self.ast;
        match &ast.expr(e).kind {
            ExprKind::Binary { op, lhs, rhs } if op.is_assignment() => {
                if let Some(target) = self.first_variable(*lhs) {
                    let mut sources = Vec::new();
                    self.variables(*rhs, &mut sources);
                    self.flows.push(Flow { target, sources });
                }
            }
            ExprKind::Call { callee, args } => self.scan_call(*callee, args, db),
            ExprKind::StmtExpr { body } => self.scan_stmt(*body, db),
            _ => {}
        }
        for c in ast.expr_children(e) {
            self.scan_expr(c, db);
        }
    }

    fn scan_call(&mut self, callee: ExprId, args: &[ExprId], db: &TaintDb) {
        let ast = self.ast;
        let (name, nparams) = match resolve::static_callee(ast, callee) {
            Some(StaticCallee::Decl(d)) => {
                let target = match &ast.decl(d).kind {
                    DeclKind::FunctionTemplate { pattern } => *pattern,
                    _ => d,
                };
                let nparams = ast
                    .function(target)
                    .and_then(|f| ast.signature(f.ty))
                    .map_or(0, |(_, p, _)| p.len());
                (ast.decl(d).name.clone(), nparams)
            }
            Some(StaticCallee::Name(n)) => (n, 0),
            None => return,
        };
        let Some(rules) = db.rules(&name) else {
            return;
        };
        for rule in rules {
            for (to, from) in rule.pairs(nparams, args.len()) {
                let (Some(&to_arg), Some(&from_arg)) = (args.get(to), args.get(from)) else {
                    continue;
                };
                let Some(target) = self.first_variable(to_arg) else {
                    continue;
                };
                let mut sources = Vec::new();
                self.variables(from_arg, &mut sources);
                self.flows.push(Flow { target, sources });
            }
        }
    }

    /// First variable referenced in pre-order.
    fn first_variable(&self, e: ExprId) -> Option<DeclId> {
        let ast = self.ast;
        if let ExprKind::DeclRef { decl } = &ast.expr(e).kind
            && matches!(ast.decl(*decl).kind, DeclKind::Var(_) | DeclKind::Param(_))
        {
            return Some(*decl);
        }
        ast.expr_children(e)
            .into_iter()
            .find_map(|c| self.first_variable(c))
    }

    fn variables(&self, e: ExprId, out: &mut Vec<DeclId>) {
        let ast = self.ast;
        if let ExprKind::DeclRef { decl } = &ast.expr(e).kind
            && matches!(ast.decl(*decl).kind, DeclKind::Var(_) | DeclKind::Param(_))
            && !out.contains(decl)
        {
            out.push(*decl);
        }
        for c in ast.expr_children(e) {
            self.variables(c, out);
        }
    }
}

/// Computes the taint sets of every function in a unit.
pub fn propagate(tables: &mut UnitTables<'_>, db: &TaintDb) {
    let ast = tables.ast;
    for f in &mut tables.funcs {
        let Some(func) = ast.function(f.decl) else {
            continue;
        };
        let propagator = TaintPropagator::new(ast, f.decl, db);
        let mut sets = Vec::with_capacity(func.params.len());
        for (index, &param) in func.params.iter().enumerate() {
            let levels = propagator
                .propagate(param)
                .into_iter()
                .map(|(depth, vars)| {
                    let ids = vars
                        .iter()
                        .filter_map(|v| f.local_ids.get(v).copied())
                        .collect();
                    (depth, ids)
                })
                .collect();
            sets.push(TaintSet {
                param: index as u32,
                levels,
            });
        }
        debug!(name = %f.record.name, params = sets.len(), "taint");
        f.record.taint = sets;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_parses_pairs_and_prefixes() {
        let db = TaintDb::from_json(
            r#"{ "exact_name": { "memcpy": [[1, 2]] }, "regex_name": { "str": [[1, 0]] } }"#,
        )
        .unwrap();
        assert_eq!(db.rules("memcpy"), Some(&[TaintRule { to: 1, from: 2 }][..]));
        assert_eq!(db.rules("strcpy"), Some(&[TaintRule { to: 1, from: 0 }][..]));
        assert!(db.rules("xstrcpy").is_none(), "prefix match is anchored");
        assert!(db.rules("memmove").is_none());
    }

    #[test]
    fn variadic_positions_cover_extra_arguments() {
        let to_variadic = TaintRule { to: 0, from: 1 };
        assert_eq!(to_variadic.pairs(2, 4), vec![(2, 0), (3, 0)]);
        let from_variadic = TaintRule { to: 1, from: 0 };
        assert_eq!(from_variadic.pairs(1, 3), vec![(0, 1), (0, 2)]);
        assert!(TaintRule { to: 0, from: 0 }.pairs(0, 3).is_empty());
        assert!(from_variadic.pairs(3, 2).is_empty());
    }

    #[test]
    fn malformed_database_is_an_error() {
        assert!(TaintDb::from_json("{ \"exact_name\": [1] }").is_err());
    }
}
