//! Type canonicalization.
//!
//! Every distinct (node, qualifiers) pair is registered exactly once. The id
//! is allocated and a placeholder entry pushed *before* children are visited,
//! so a record that points at itself finds its own id on the way down.
//! Anonymous struct/union members are flattened into the field table of the
//! record that contains them.

use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use crate::ast::{DeclId, DeclKind, ExprId, ExprKind, TagKind, TemplateArg, TranslationUnit, TyId, TypeKind};
use crate::db::{EnumValue, FieldEntry, TypeClass, TypeRecord};
use crate::error::{DbError, Diagnostics, Policy};
use crate::registry::{Registry, TypeKey, Universe};

/// One canonical type plus the context the hash pass needs.
#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub record: TypeRecord,
    /// Enclosing function of a locally declared tag or typedef.
    pub scope: Option<DeclId>,
    /// Tag or typedef declaration behind the type.
    pub decl: Option<DeclId>,
    /// Global variables the type refers to directly.
    pub globals: BTreeSet<DeclId>,
}

#[derive(Debug)]
pub struct TypeTable {
    registry: Registry<TypeKey>,
    entries: Vec<TypeEntry>,
    field_index: HashMap<u64, HashMap<DeclId, u32>>,
}

impl Default for TypeTable {
    fn default() -> Self {
        TypeTable {
            registry: Registry::new(Universe::Type),
            entries: Vec::new(),
            field_index: HashMap::new(),
        }
    }
}

impl TypeTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: u64) -> &TypeEntry {
        &self.entries[id as usize]
    }

    pub fn entries(&self) -> &[TypeEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [TypeEntry] {
        &mut self.entries
    }

    pub fn get(&self, key: &TypeKey) -> Option<u64> {
        self.registry.get(key)
    }

    /// Flattened index of `field` inside the record type `record`.
    pub fn field_index(&self, record: u64, field: DeclId) -> Option<u32> {
        self.field_index.get(&record)?.get(&field).copied()
    }

    pub fn into_entries(self) -> Vec<TypeEntry> {
        self.entries
    }
}

/// Identity of a type: its first non-sugar node plus every qualifier on the way.
pub fn type_key(ast: &TranslationUnit, ty: TyId) -> TypeKey {
    let (node, quals) = ast.desugar(ty);
    TypeKey { node, quals }
}

fn class_of(kind: &TypeKind) -> TypeClass {
    match kind {
        TypeKind::Builtin { .. } => TypeClass::Builtin,
        TypeKind::Pointer { .. } => TypeClass::Pointer,
        TypeKind::LValueReference { .. } => TypeClass::LvalueReference,
        TypeKind::RValueReference { .. } => TypeClass::RvalueReference,
        TypeKind::ConstantArray { .. } => TypeClass::ConstArray,
        TypeKind::IncompleteArray { .. } => TypeClass::IncompleteArray,
        TypeKind::VariableArray { .. } => TypeClass::VariableArray,
        TypeKind::Record { .. } => TypeClass::Record,
        TypeKind::Enum { .. } => TypeClass::Enum,
        TypeKind::Typedef { .. } => TypeClass::Typedef,
        TypeKind::Function { .. } => TypeClass::Function,
        TypeKind::TemplateSpecialization { .. } => TypeClass::TemplateSpecialization,
        TypeKind::Vector { .. } => TypeClass::Vector,
        TypeKind::MemberPointer { .. } => TypeClass::MemberPointer,
        TypeKind::Sugar { .. } | TypeKind::Unsupported { .. } => TypeClass::Unsupported,
    }
}

/// Collects global variables referenced anywhere inside `e`.
pub fn collect_globals(ast: &TranslationUnit, e: ExprId, out: &mut BTreeSet<DeclId>) {
    if let ExprKind::DeclRef { decl } = &ast.expr(e).kind
        && ast.is_global_var(*decl)
    {
        out.insert(ast.canonical(*decl));
    }
    for c in ast.expr_children(e) {
        collect_globals(ast, c, out);
    }
}

/// Borrowed view that canonicalizes types into a [`TypeTable`].
pub struct Canonicalizer<'c> {
    ast: &'c TranslationUnit,
    table: &'c mut TypeTable,
    diags: &'c mut Diagnostics,
    policy: Policy,
}

impl<'c> Canonicalizer<'c> {
    pub fn new(
        ast: &'c TranslationUnit,
        table: &'c mut TypeTable,
        diags: &'c mut Diagnostics,
        policy: Policy,
    ) -> Self {
        Canonicalizer {
            ast,
            table,
            diags,
            policy,
        }
    }

    /// Returns the id of `ty`, registering it and everything it reaches.
    pub fn canonicalize(&mut self, ty: TyId) -> Result<u64, DbError> {
        let ast = self.ast;
        let key = type_key(ast, ty);
        if let Some(id) = self.table.registry.get(&key) {
            return Ok(id);
        }
        let node = ast.ty(key.node);
        let (id, _) = self.table.registry.register(key);
        self.table.entries.push(TypeEntry {
            record: TypeRecord::placeholder(
                id,
                class_of(&node.kind),
                key.quals.code(),
                node.size.unwrap_or(0),
                node.spelling.clone(),
            ),
            scope: None,
            decl: None,
            globals: BTreeSet::new(),
        });
        trace!(id, spelling = %node.spelling, "registered type");
        self.populate(id, key.node)?;
        Ok(id)
    }

    fn entry(&mut self, id: u64) -> &mut TypeEntry {
        &mut self.table.entries[id as usize]
    }

    fn populate(&mut self, id: u64, node: TyId) -> Result<(), DbError> {
        let ast = self.ast;
        match &ast.ty(node).kind {
            TypeKind::Builtin { .. } => {}
            TypeKind::Pointer { pointee }
            | TypeKind::LValueReference { pointee }
            | TypeKind::RValueReference { pointee } => {
                let r = self.canonicalize(*pointee)?;
                self.entry(id).record.refs = vec![r];
            }
            TypeKind::ConstantArray { element, len } => {
                let r = self.canonicalize(*element)?;
                let e = self.entry(id);
                e.record.refs = vec![r];
                e.record.length = Some(*len);
            }
            TypeKind::IncompleteArray { element } => {
                let r = self.canonicalize(*element)?;
                self.entry(id).record.refs = vec![r];
            }
            TypeKind::VariableArray { element, size } => {
                let r = self.canonicalize(*element)?;
                let mut globals = BTreeSet::new();
                if let Some(size) = size {
                    collect_globals(ast, *size, &mut globals);
                }
                let e = self.entry(id);
                e.record.refs = vec![r];
                e.globals = globals;
            }
            TypeKind::Vector { element, count } => {
                let r = self.canonicalize(*element)?;
                let e = self.entry(id);
                e.record.refs = vec![r];
                e.record.length = Some(*count);
            }
            TypeKind::MemberPointer { pointee, class } => {
                let p = self.canonicalize(*pointee)?;
                let c = self.canonicalize(*class)?;
                self.entry(id).record.refs = vec![p, c];
            }
            TypeKind::Function {
                ret,
                params,
                variadic,
            } => {
                let mut refs = vec![self.canonicalize(*ret)?];
                for p in params {
                    refs.push(self.canonicalize(*p)?);
                }
                let e = self.entry(id);
                e.record.refs = refs;
                e.record.variadic = *variadic;
            }
            TypeKind::Typedef { decl } => {
                let d = ast.decl(*decl);
                let DeclKind::Typedef { underlying, .. } = &d.kind else {
                    return self.unsupported(id, format!("typedef without declaration `{}`", d.name));
                };
                let r = self.canonicalize(*underlying)?;
                let scope = self.function_scope(*decl);
                let e = self.entry(id);
                e.record.refs = vec![r];
                e.record.name = Some(d.name.clone());
                e.scope = scope;
                e.decl = Some(*decl);
            }
            TypeKind::Enum { decl } => self.populate_enum(id, *decl)?,
            TypeKind::Record { decl } => self.populate_record(id, *decl)?,
            TypeKind::TemplateSpecialization {
                template,
                args,
                aliased,
            } => {
                let mut refs = Vec::new();
                if let Some(a) = aliased {
                    refs.push(self.canonicalize(*a)?);
                }
                let mut spelled = Vec::new();
                for arg in args {
                    match arg {
                        TemplateArg::Type(t) => {
                            refs.push(self.canonicalize(*t)?);
                            spelled.push(format!("type:{}", ast.ty(*t).spelling));
                        }
                        TemplateArg::Integral(v) => spelled.push(format!("int:{v}")),
                        TemplateArg::Expression(s) => spelled.push(format!("expr:{s}")),
                    }
                }
                let e = self.entry(id);
                e.record.refs = refs;
                e.record.template = Some(template.clone());
                e.record.template_args = spelled;
            }
            TypeKind::Sugar { inner } => {
                // type_key strips sugar, so this only happens on malformed input.
                let r = self.canonicalize(*inner)?;
                self.entry(id).record.refs = vec![r];
            }
            TypeKind::Unsupported { what } => return self.unsupported(id, what.clone()),
        }
        Ok(())
    }

    fn unsupported(&mut self, id: u64, what: String) -> Result<(), DbError> {
        self.entry(id).record.class = TypeClass::Unsupported;
        self.diags
            .report(self.policy, DbError::UnsupportedTypeKind(what))
    }

    fn function_scope(&self, decl: DeclId) -> Option<DeclId> {
        let mut cur = self.ast.decl(decl).parent;
        while let Some(p) = cur {
            match &self.ast.decl(p).kind {
                DeclKind::Function(_) => return Some(p),
                _ => cur = self.ast.decl(p).parent,
            }
        }
        None
    }

    fn populate_enum(&mut self, id: u64, decl: DeclId) -> Result<(), DbError> {
        let ast = self.ast;
        let d = ast.decl(decl);
        let DeclKind::Enum(en) = &d.kind else {
            return self.unsupported(id, format!("enum without declaration `{}`", d.name));
        };
        let underlying = self.canonicalize(en.underlying)?;
        let values = en
            .constants
            .iter()
            .filter_map(|c| match &ast.decl(*c).kind {
                DeclKind::EnumConstant { value } => Some(EnumValue {
                    name: ast.decl(*c).name.clone(),
                    value: *value,
                }),
                _ => None,
            })
            .collect();
        let scope = self.function_scope(decl);
        let e = self.entry(id);
        e.record.refs = vec![underlying];
        e.record.values = values;
        e.record.name = (!d.name.is_empty()).then(|| d.name.clone());
        e.scope = scope;
        e.decl = Some(decl);
        if !en.complete {
            e.record.class = TypeClass::EnumForward;
        }
        Ok(())
    }

    fn populate_record(&mut self, id: u64, decl: DeclId) -> Result<(), DbError> {
        let ast = self.ast;
        let d = ast.decl(decl);
        let Some(rec) = ast.record(decl) else {
            return self.unsupported(id, format!("record without declaration `{}`", d.name));
        };
        let name = if !d.name.is_empty() {
            Some(d.name.clone())
        } else {
            rec.typedef_name.clone()
        };
        let scope = self.function_scope(decl);
        {
            let e = self.entry(id);
            e.record.name = name;
            e.record.union = rec.tag == TagKind::Union;
            e.scope = scope;
            e.decl = Some(decl);
        }

        let Some((def, _)) = ast.record_definition(decl) else {
            self.entry(id).record.class = TypeClass::RecordForward;
            return Ok(());
        };
        if def != decl {
            let size = ast.decl_type(def).and_then(|t| ast.ty(t).size).unwrap_or(0);
            self.entry(id).record.size = size;
        }

        let mut fields = Vec::new();
        let mut index = HashMap::new();
        let mut refs = Vec::new();
        let mut globals = BTreeSet::new();
        self.flatten(def, 0, &mut fields, &mut index, &mut refs, &mut globals)?;
        let e = self.entry(id);
        e.record.fields = fields;
        e.record.refs = refs;
        e.globals = globals;
        self.table.field_index.insert(id, index);
        Ok(())
    }

    /// Appends the fields of `record` to the table of the record being built.
    /// Anonymous members contribute their own fields at consecutive indices.
    fn flatten(
        &mut self,
        record: DeclId,
        base_bits: u64,
        fields: &mut Vec<FieldEntry>,
        index: &mut HashMap<DeclId, u32>,
        refs: &mut Vec<u64>,
        globals: &mut BTreeSet<DeclId>,
    ) -> Result<(), DbError> {
        let ast = self.ast;
        let Some((_, rec)) = ast.record_definition(record) else {
            return Ok(());
        };
        for &m in &rec.members {
            let md = ast.decl(m);
            let DeclKind::Field(f) = &md.kind else {
                continue;
            };
            if let Some(anon) = ast.anonymous_member(m) {
                // The anonymous record is a type of its own as well.
                self.canonicalize(f.ty)?;
                self.flatten(anon, base_bits + f.offset_bits, fields, index, refs, globals)?;
                continue;
            }
            let ty = self.canonicalize(f.ty)?;
            let i = fields.len() as u32;
            fields.push(FieldEntry {
                name: md.name.clone(),
                index: i,
                offset: (base_bits + f.offset_bits) / 8,
                bit_width: f.bit_width,
                ty,
            });
            index.insert(m, i);
            refs.push(ty);
            if let Some(init) = f.init {
                collect_globals(ast, init, globals);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstBuilder, Qualifiers};

    fn canon_all(tu: &TranslationUnit, tys: &[TyId]) -> (TypeTable, Vec<u64>) {
        let mut table = TypeTable::default();
        let mut diags = Diagnostics::default();
        let mut c = Canonicalizer::new(tu, &mut table, &mut diags, Policy::BestEffort);
        let ids = tys
            .iter()
            .map(|t| c.canonicalize(*t).expect("canonicalize"))
            .collect();
        (table, ids)
    }

    #[test]
    fn qualifiers_make_distinct_types() {
        let mut b = AstBuilder::new("t.c");
        let int = b.int();
        let cint = b.qualified(int, Qualifiers::CONST);
        let tu = b.finish();
        let (table, ids) = canon_all(&tu, &[int, cint, int]);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[0], ids[2]);
        assert_eq!(table.entry(ids[1]).record.qualifiers, "c");
    }

    #[test]
    fn self_pointer_record_registers_once() {
        let mut b = AstBuilder::new("t.c");
        let (node, nty) = b.record(TagKind::Struct, "node");
        let pn = b.pointer(nty);
        b.field(node, "next", pn);
        b.complete(node);
        let tu = b.finish();
        let (table, ids) = canon_all(&tu, &[nty]);
        assert_eq!(table.len(), 2);
        let rec = &table.entry(ids[0]).record;
        let ptr = &table.entry(rec.refs[0]).record;
        assert_eq!(ptr.refs, vec![ids[0]]);
    }

    #[test]
    fn anonymous_members_flatten_into_parent() {
        let mut b = AstBuilder::new("t.c");
        let int = b.int();
        let (s, sty) = b.record(TagKind::Struct, "s");
        b.field(s, "a", int);
        let (anon, anon_ty) = b.anonymous_member(s, TagKind::Union);
        let x = b.field(anon, "x", int);
        b.field(anon, "y", int);
        b.complete(anon);
        b.field(s, "", anon_ty);
        let d = b.field(s, "d", int);
        b.complete(s);
        let tu = b.finish();
        let (table, ids) = canon_all(&tu, &[sty]);
        let rec = &table.entry(ids[0]).record;
        let names: Vec<&str> = rec.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a", "x", "y", "d"]);
        assert_eq!(table.field_index(ids[0], x), Some(1));
        assert_eq!(table.field_index(ids[0], d), Some(3));
        assert_eq!(rec.field("y").map(|f| f.offset), Some(4));
    }

    #[test]
    fn incomplete_record_is_forward() {
        let mut b = AstBuilder::new("t.c");
        let (_, opaque) = b.record(TagKind::Struct, "opaque");
        let tu = b.finish();
        let (table, ids) = canon_all(&tu, &[opaque]);
        assert_eq!(table.entry(ids[0]).record.class, TypeClass::RecordForward);
        assert!(table.entry(ids[0]).record.fields.is_empty());
    }

    #[test]
    fn unsupported_kind_is_recorded_in_best_effort() {
        let mut b = AstBuilder::new("t.c");
        let atomic = b.unsupported_type("Atomic");
        let tu = b.finish();
        let mut table = TypeTable::default();
        let mut diags = Diagnostics::default();
        let id = Canonicalizer::new(&tu, &mut table, &mut diags, Policy::BestEffort)
            .canonicalize(atomic)
            .expect("best effort continues");
        assert_eq!(table.entry(id).record.class, TypeClass::Unsupported);
        assert_eq!(diags.count(crate::error::DiagKind::UnsupportedTypeKind), 1);

        let mut table = TypeTable::default();
        let mut diags = Diagnostics::default();
        let r = Canonicalizer::new(&tu, &mut table, &mut diags, Policy::Strict).canonicalize(atomic);
        assert!(matches!(r, Err(DbError::UnsupportedTypeKind(_))));
    }
}
