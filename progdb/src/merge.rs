//! Cross-unit merge.
//!
//! Per-unit databases are folded into one after the workers join. Entries
//! are deduplicated by content: types, functions and globals by hash,
//! declarations by declhash, unresolved callees by name and sources by
//! path. Every id inside a kept record is rewritten to the merged
//! numbering. Forward records are finally linked to the unique complete
//! record of the same name.

use std::collections::HashMap;

use tracing::info;

use crate::db::{
    CalleeKind, CalleeRef, Database, MemberStore, OffsetRef, RefKind, RefValue, TypeClass,
    UnresolvedFunc,
};

fn remap(map: &[u64], id: i64) -> i64 {
    usize::try_from(id)
        .ok()
        .and_then(|i| map.get(i))
        .map_or(-1, |v| *v as i64)
}

/// Unit-local id to merged id, per table.
#[derive(Debug, Default)]
struct UnitMaps {
    sources: Vec<u64>,
    types: Vec<u64>,
    funcs: Vec<u64>,
    funcdecls: Vec<u64>,
    unresolved: Vec<u64>,
    globals: Vec<u64>,
    /// Entries seen for the first time, by unit-local index.
    new_types: Vec<bool>,
    new_funcs: Vec<bool>,
    new_funcdecls: Vec<bool>,
    new_globals: Vec<bool>,
}

impl UnitMaps {
    fn ty(&self, id: i64) -> i64 {
        remap(&self.types, id)
    }

    fn ty_u(&self, id: u64) -> u64 {
        self.types.get(id as usize).copied().unwrap_or(id)
    }

    fn global(&self, id: i64) -> i64 {
        remap(&self.globals, id)
    }

    fn callee(&self, c: &CalleeRef) -> CalleeRef {
        let map = match c.kind {
            CalleeKind::Func => &self.funcs,
            CalleeKind::Funcdecl => &self.funcdecls,
            CalleeKind::Unresolved => &self.unresolved,
        };
        CalleeRef {
            kind: c.kind,
            id: map.get(c.id as usize).copied().unwrap_or(c.id),
        }
    }

    fn offset_ref(&self, r: &mut OffsetRef) {
        let map = match r.kind {
            RefKind::Function => Some(&self.funcs),
            RefKind::Funcdecl => Some(&self.funcdecls),
            RefKind::Unresolved => Some(&self.unresolved),
            RefKind::Global => Some(&self.globals),
            _ => None,
        };
        if let (Some(map), RefValue::Id(id)) = (map, &r.id) {
            r.id = RefValue::Id(remap(map, *id));
        }
        r.cast = r.cast.map(|c| self.ty(c));
    }

    fn store(&self, s: &mut MemberStore) {
        s.ty = self.ty(s.ty);
        s.func = self.callee(&s.func);
    }
}

fn intern(index: &mut HashMap<String, u64>, key: &str, next: &mut u64) -> (u64, bool) {
    if let Some(&id) = index.get(key) {
        return (id, false);
    }
    let id = *next;
    *next += 1;
    index.insert(key.to_string(), id);
    (id, true)
}

#[derive(Debug, Default)]
struct Merger {
    out: Database,
    sources: HashMap<String, u64>,
    types: HashMap<String, u64>,
    funcs: HashMap<String, u64>,
    funcdecls: HashMap<String, u64>,
    unresolved: HashMap<String, u64>,
    globals: HashMap<String, u64>,
}

impl Merger {
    fn maps(&mut self, unit: &Database) -> UnitMaps {
        let mut m = UnitMaps::default();
        let mut next = self.out.sources.len() as u64;
        for s in &unit.sources {
            let (id, new) = intern(&mut self.sources, s, &mut next);
            if new {
                self.out.sources.push(s.clone());
            }
            m.sources.push(id);
        }
        // Records are appended after all maps are known, so count the
        // pending ones explicitly.
        let mut next = self.out.types.len() as u64;
        for t in &unit.types {
            let (id, new) = intern(&mut self.types, &t.hash, &mut next);
            m.types.push(id);
            m.new_types.push(new);
        }
        let mut next = self.out.funcs.len() as u64;
        for f in &unit.funcs {
            let (id, new) = intern(&mut self.funcs, &f.hash, &mut next);
            m.funcs.push(id);
            m.new_funcs.push(new);
        }
        let mut next = self.out.funcdecls.len() as u64;
        for f in &unit.funcdecls {
            let (id, new) = intern(&mut self.funcdecls, &f.declhash, &mut next);
            m.funcdecls.push(id);
            m.new_funcdecls.push(new);
        }
        let mut next = self.out.unresolvedfuncs.len() as u64;
        for u in &unit.unresolvedfuncs {
            let (id, new) = intern(&mut self.unresolved, &u.name, &mut next);
            if new {
                self.out.unresolvedfuncs.push(UnresolvedFunc {
                    id,
                    name: u.name.clone(),
                });
            }
            m.unresolved.push(id);
        }
        let mut next = self.out.globals.len() as u64;
        for g in &unit.globals {
            let (id, new) = intern(&mut self.globals, &g.hash, &mut next);
            m.globals.push(id);
            m.new_globals.push(new);
        }
        m
    }

    fn add(&mut self, unit: Database) {
        let m = self.maps(&unit);
        let fid = |f: u64| m.sources.get(f as usize).copied().unwrap_or(f);

        for (i, mut t) in unit.types.into_iter().enumerate() {
            if !m.new_types[i] {
                continue;
            }
            t.id = m.types[i];
            t.refs = t.refs.iter().map(|r| m.ty_u(*r)).collect();
            for f in &mut t.fields {
                f.ty = m.ty_u(f.ty);
            }
            t.usedrefs = t.usedrefs.iter().map(|g| m.global(*g)).collect();
            t.definition = t.definition.map(|d| m.ty_u(d));
            self.out.types.push(t);
        }

        for (i, mut f) in unit.funcs.into_iter().enumerate() {
            if !m.new_funcs[i] {
                continue;
            }
            f.id = m.funcs[i];
            f.fid = fid(f.fid);
            f.types = f.types.iter().map(|t| m.ty(*t)).collect();
            f.refs = f.refs.iter().map(|t| m.ty(*t)).collect();
            f.class = f.class.map(|c| m.ty(c));
            for l in &mut f.locals {
                l.ty = m.ty(l.ty);
            }
            for c in &mut f.calls {
                c.callee = c.callee.as_ref().map(|c| m.callee(c));
            }
            for d in &mut f.derefs {
                for r in d.base.iter_mut().chain(d.offsetrefs.iter_mut()) {
                    m.offset_ref(r);
                }
                d.member_types = d.member_types.iter().map(|t| m.ty(*t)).collect();
                d.cast = d.cast.map(|c| m.ty(c));
            }
            for a in &mut f.asm {
                for r in &mut a.operands {
                    m.offset_ref(r);
                }
            }
            for s in &mut f.fops {
                m.store(s);
            }
            f.globalrefs = f.globalrefs.iter().map(|g| m.global(*g)).collect();
            f.funrefs = f.funrefs.iter().map(|c| m.callee(c)).collect();
            self.out.funcs.push(f);
        }

        for (i, mut f) in unit.funcdecls.into_iter().enumerate() {
            if !m.new_funcdecls[i] {
                continue;
            }
            f.id = m.funcdecls[i];
            f.fid = fid(f.fid);
            f.types = f.types.iter().map(|t| m.ty(*t)).collect();
            self.out.funcdecls.push(f);
        }

        for (i, mut g) in unit.globals.into_iter().enumerate() {
            if !m.new_globals[i] {
                continue;
            }
            g.id = m.globals[i];
            g.fid = fid(g.fid);
            g.ty = m.ty(g.ty);
            g.refs = g.refs.iter().map(|t| m.ty(*t)).collect();
            g.globalrefs = g.globalrefs.iter().map(|r| m.global(*r)).collect();
            g.funrefs = g.funrefs.iter().map(|c| m.callee(c)).collect();
            for s in &mut g.fops {
                m.store(s);
            }
            self.out.globals.push(g);
        }

        self.out.diagnostics.merge(&unit.diagnostics);
    }

    /// Points each forward record at the unique complete record with its name.
    fn link_forward_records(&mut self) -> usize {
        let mut complete: HashMap<(String, bool), Vec<u64>> = HashMap::new();
        for t in &self.out.types {
            if t.class == TypeClass::Record
                && t.scope.is_none()
                && t.qualifiers.is_empty()
                && let Some(name) = &t.name
            {
                complete
                    .entry((name.clone(), t.union))
                    .or_default()
                    .push(t.id);
            }
        }
        let mut linked = 0;
        for t in &mut self.out.types {
            if t.class != TypeClass::RecordForward || t.definition.is_some() {
                continue;
            }
            let Some(name) = &t.name else {
                continue;
            };
            if let Some([only]) = complete.get(&(name.clone(), t.union)).map(Vec::as_slice) {
                t.definition = Some(*only);
                linked += 1;
            }
        }
        linked
    }
}

/// Merges per-unit databases into one.
pub fn merge(units: Vec<Database>) -> Database {
    let count = units.len();
    let mut merger = Merger::default();
    for unit in units {
        merger.add(unit);
    }
    let linked = merger.link_forward_records();
    let out = merger.out;
    info!(
        units = count,
        types = out.types.len(),
        funcs = out.funcs.len(),
        funcdecls = out.funcdecls.len(),
        globals = out.globals.len(),
        linked,
        "merged databases"
    );
    out
}
