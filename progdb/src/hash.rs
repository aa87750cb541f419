//! Content hashes.
//!
//! Hashes identify the same type, function or global across translation
//! units, so they only consume data that is stable between units: names,
//! spellings, layouts and the hashes of referenced types, never registry
//! ids. Named types reached through pointers, references and template
//! arguments contribute a shallow identity instead of their full contents,
//! which both breaks cycles and keeps a forward declaration and its
//! definition interchangeable behind a pointer.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::ast::{DeclId, Linkage, StorageKind, TranslationUnit};
use crate::db::TypeClass;
use crate::types::TypeEntry;
use crate::visit::UnitTables;

fn hex(h: Sha256) -> String {
    format!("{:x}", h.finalize())
}

fn feed(h: &mut Sha256, part: &str) {
    h.update(part.as_bytes());
    h.update([0u8]);
}

/// Hash of a function's name and signature.
pub fn declhash(ast: &TranslationUnit, decl: DeclId) -> String {
    let mut h = Sha256::new();
    feed(&mut h, &ast.qualified_name(decl));
    if let Some(f) = ast.function(decl) {
        feed(&mut h, &ast.ty(f.ty).spelling);
    }
    hex(h)
}

/// Variables with static storage that are not visible outside their unit.
fn is_internal_global(ast: &TranslationUnit, decl: DeclId) -> bool {
    ast.var(decl)
        .is_some_and(|v| v.linkage != Linkage::External || v.storage == StorageKind::StaticLocal)
}

/// Disambiguator of a unit-local global: its name and defining file.
fn internal_global_identity(ast: &TranslationUnit, decl: DeclId) -> String {
    let d = ast.decl(decl);
    let mut h = Sha256::new();
    feed(&mut h, &d.name);
    feed(&mut h, ast.file_path(d.loc.file));
    hex(h)
}

fn class_tag(class: TypeClass) -> &'static str {
    match class {
        TypeClass::Record | TypeClass::RecordForward => "record",
        TypeClass::Enum | TypeClass::EnumForward => "enum",
        TypeClass::Typedef => "typedef",
        TypeClass::Builtin => "builtin",
        TypeClass::Pointer => "pointer",
        TypeClass::LvalueReference => "lref",
        TypeClass::RvalueReference => "rref",
        TypeClass::ConstArray => "const_array",
        TypeClass::IncompleteArray => "incomplete_array",
        TypeClass::VariableArray => "variable_array",
        TypeClass::Function => "function",
        TypeClass::TemplateSpecialization => "template",
        TypeClass::Vector => "vector",
        TypeClass::MemberPointer => "member_pointer",
        TypeClass::Unsupported => "unsupported",
    }
}

struct TypeHasher<'h> {
    ast: &'h TranslationUnit,
    entries: &'h [TypeEntry],
    memo: Vec<Option<String>>,
    active: Vec<bool>,
}

impl<'h> TypeHasher<'h> {
    fn new(ast: &'h TranslationUnit, entries: &'h [TypeEntry]) -> Self {
        TypeHasher {
            ast,
            entries,
            memo: vec![None; entries.len()],
            active: vec![false; entries.len()],
        }
    }

    fn is_named(&self, id: u64) -> bool {
        let r = &self.entries[id as usize].record;
        r.name.is_some()
            && matches!(
                r.class,
                TypeClass::Record
                    | TypeClass::RecordForward
                    | TypeClass::Enum
                    | TypeClass::EnumForward
                    | TypeClass::Typedef
            )
    }

    fn scope(&self, h: &mut Sha256, entry: &TypeEntry) {
        if let Some(scope) = entry.scope {
            feed(h, &self.ast.qualified_name(scope));
            feed(h, &declhash(self.ast, scope));
        }
    }

    /// Identity of a named type without its contents.
    fn shallow(&self, id: u64) -> String {
        let e = &self.entries[id as usize];
        let r = &e.record;
        let mut h = Sha256::new();
        feed(&mut h, "shallow");
        feed(&mut h, class_tag(r.class));
        feed(&mut h, if r.union { "union" } else { "" });
        feed(&mut h, &r.qualifiers);
        feed(&mut h, r.name.as_deref().unwrap_or(""));
        self.scope(&mut h, e);
        hex(h)
    }

    /// Hash of a type reached through an indirection.
    fn edge(&mut self, id: u64) -> String {
        if self.is_named(id) {
            self.shallow(id)
        } else {
            self.hash(id)
        }
    }

    fn hash(&mut self, id: u64) -> String {
        let idx = id as usize;
        if let Some(h) = &self.memo[idx] {
            return h.clone();
        }
        if self.active[idx] {
            debug!(id, "type reached again while hashing, using shallow identity");
            return self.shallow(id);
        }
        self.active[idx] = true;

        let entries = self.entries;
        let e = &entries[idx];
        let r = &e.record;
        let mut h = Sha256::new();
        feed(&mut h, class_tag(r.class));
        feed(&mut h, &r.qualifiers);
        match r.class {
            TypeClass::Builtin | TypeClass::Unsupported => {
                feed(&mut h, &r.spelling);
                feed(&mut h, &r.size.to_string());
            }
            TypeClass::Pointer
            | TypeClass::LvalueReference
            | TypeClass::RvalueReference
            | TypeClass::MemberPointer
            | TypeClass::Function => {
                feed(&mut h, if r.variadic { "..." } else { "" });
                for &c in &r.refs {
                    let part = self.edge(c);
                    feed(&mut h, &part);
                }
            }
            TypeClass::ConstArray
            | TypeClass::IncompleteArray
            | TypeClass::VariableArray
            | TypeClass::Vector => {
                feed(&mut h, &r.length.map(|l| l.to_string()).unwrap_or_default());
                for &c in &r.refs {
                    let part = self.hash(c);
                    feed(&mut h, &part);
                }
            }
            TypeClass::Record | TypeClass::RecordForward => {
                feed(&mut h, if r.union { "union" } else { "struct" });
                feed(&mut h, r.name.as_deref().unwrap_or(""));
                feed(&mut h, &r.size.to_string());
                for f in &r.fields {
                    feed(&mut h, &f.name);
                    feed(&mut h, &f.offset.to_string());
                    feed(&mut h, &f.bit_width.map(|w| w.to_string()).unwrap_or_default());
                    let part = self.hash(f.ty);
                    feed(&mut h, &part);
                }
            }
            TypeClass::Enum | TypeClass::EnumForward => {
                feed(&mut h, r.name.as_deref().unwrap_or(""));
                for v in &r.values {
                    feed(&mut h, &v.name);
                    feed(&mut h, &v.value.to_string());
                }
                for &c in &r.refs {
                    let part = self.hash(c);
                    feed(&mut h, &part);
                }
            }
            TypeClass::Typedef => {
                feed(&mut h, r.name.as_deref().unwrap_or(""));
                for &c in &r.refs {
                    let part = self.hash(c);
                    feed(&mut h, &part);
                }
            }
            TypeClass::TemplateSpecialization => {
                feed(&mut h, r.template.as_deref().unwrap_or(""));
                for a in &r.template_args {
                    feed(&mut h, a);
                }
                for &c in &r.refs {
                    let part = self.edge(c);
                    feed(&mut h, &part);
                }
            }
        }
        self.scope(&mut h, e);
        for g in self.reachable_internal_globals(id) {
            feed(&mut h, &internal_global_identity(self.ast, g));
        }

        let out = hex(h);
        self.memo[idx] = Some(out.clone());
        self.active[idx] = false;
        out
    }

    /// Unit-local globals used by `id` or any type it reaches.
    fn reachable_internal_globals(&self, id: u64) -> BTreeSet<DeclId> {
        let mut out = BTreeSet::new();
        let mut seen = vec![false; self.entries.len()];
        let mut stack = vec![id];
        while let Some(t) = stack.pop() {
            let idx = t as usize;
            if seen[idx] {
                continue;
            }
            seen[idx] = true;
            let e = &self.entries[idx];
            out.extend(
                e.globals
                    .iter()
                    .copied()
                    .filter(|g| is_internal_global(self.ast, *g)),
            );
            stack.extend(e.record.refs.iter().copied());
            stack.extend(e.record.fields.iter().map(|f| f.ty));
        }
        out
    }
}

/// Fills in every hash of a unit.
pub fn compute(tables: &mut UnitTables<'_>) {
    let ast = tables.ast;
    let type_hashes: Vec<String> = {
        let mut hasher = TypeHasher::new(ast, &tables.types);
        (0..tables.types.len() as u64).map(|id| hasher.hash(id)).collect()
    };
    for (entry, h) in tables.types.iter_mut().zip(&type_hashes) {
        entry.record.hash = h.clone();
    }
    let type_hash = |id: i64| -> &str {
        usize::try_from(id)
            .ok()
            .and_then(|i| type_hashes.get(i))
            .map_or("", String::as_str)
    };

    for fd in &mut tables.funcdecls {
        let mut h = Sha256::new();
        feed(&mut h, &fd.name);
        feed(&mut h, &fd.signature);
        fd.declhash = hex(h);
    }

    for f in &mut tables.funcs {
        let r = &mut f.record;
        r.declhash = declhash(ast, f.decl);
        let mut h = Sha256::new();
        feed(&mut h, &r.declhash);
        feed(&mut h, &r.body);
        if let Some(class) = r.class {
            feed(&mut h, type_hash(class));
        }
        if r.linkage != Linkage::External {
            feed(&mut h, ast.file_path(ast.decl(f.decl).loc.file));
        }
        for t in &r.types {
            feed(&mut h, type_hash(*t));
        }
        let used: BTreeSet<&str> = r.refs.iter().map(|t| type_hash(*t)).collect();
        for t in used {
            feed(&mut h, t);
        }
        for g in &r.globalrefs {
            if let Some(&decl) = usize::try_from(*g).ok().and_then(|i| tables.global_decls.get(i))
                && is_internal_global(ast, decl)
            {
                feed(&mut h, &internal_global_identity(ast, decl));
            }
        }
        r.hash = hex(h);
    }

    for (g, &decl) in tables.globals.iter_mut().zip(&tables.global_decls) {
        let mut h = Sha256::new();
        feed(&mut h, &g.name);
        feed(&mut h, type_hash(g.ty));
        feed(&mut h, g.init.as_deref().unwrap_or(""));
        if is_internal_global(ast, decl) {
            feed(&mut h, ast.file_path(ast.decl(decl).loc.file));
            if let Some(scope) = ast.decl(decl).parent {
                feed(&mut h, &ast.qualified_name(scope));
            }
        }
        g.hash = hex(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstBuilder, TagKind};
    use crate::visit::{BuildOptions, TraversalContext};

    fn hashes(tu: &TranslationUnit) -> Vec<(String, String)> {
        let options = BuildOptions::default();
        let mut ctx = TraversalContext::new(tu, &options);
        ctx.traverse().unwrap();
        let mut tables = ctx.finish().unwrap();
        compute(&mut tables);
        tables
            .types
            .iter()
            .map(|t| (t.record.spelling.clone(), t.record.hash.clone()))
            .collect()
    }

    fn linked_list(file: &str, forward_first: bool) -> TranslationUnit {
        let mut b = AstBuilder::new(file);
        let int = b.int();
        let (node, nty) = b.record(TagKind::Struct, "node");
        if forward_first {
            b.forward_redeclaration(node);
        }
        let pn = b.pointer(nty);
        b.field(node, "next", pn);
        b.field(node, "value", int);
        b.complete(node);
        b.global("head", pn, None);
        b.finish()
    }

    #[test]
    fn self_referential_record_hash_is_stable() {
        let a = hashes(&linked_list("a.c", false));
        let b = hashes(&linked_list("b.c", true));
        let find = |v: &[(String, String)], s: &str| {
            v.iter()
                .find(|(sp, _)| sp == s)
                .map(|(_, h)| h.clone())
                .unwrap()
        };
        assert_eq!(
            find(&a, "struct node"),
            find(&b, "struct node"),
            "hash must not depend on the unit or on forward declarations"
        );
        assert_eq!(find(&a, "struct node").len(), 64);
    }

    #[test]
    fn declhash_depends_on_signature() {
        let mut b = AstBuilder::new("a.c");
        let int = b.int();
        let long = b.long();
        let f = b.function("f", int, &[("x", int)]);
        let g = b.function("f", int, &[("x", long)]);
        let tu = b.finish();
        assert_ne!(declhash(&tu, f), declhash(&tu, g));
    }
}
