//! End-to-end: parse `basic.c` with libclang and check the database.

use std::path::Path;
use std::sync::LazyLock;

use progdb::ast::Linkage;
use progdb::db::{CalleeKind, Database, DerefKind, MemberAccess, RefKind, TypeClass};

static BASIC_DB: LazyLock<Database> = LazyLock::new(|| {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../tests/fixtures/progdb.toml");
    progdb::generate(&path).expect("generate basic database")
});

#[test]
fn functions_and_declarations_present() {
    let db = &*BASIC_DB;
    let names: Vec<&str> = db.funcs.iter().map(|f| f.name.as_str()).collect();
    assert!(names.contains(&"sum"), "sum missing. Found: {names:?}");
    assert!(names.contains(&"offset"), "offset missing. Found: {names:?}");
    assert!(
        db.funcdecl("helper").is_some(),
        "helper must be a declaration-only function. Found: {:?}",
        db.funcdecls
    );
    assert!(
        db.sources[0].ends_with("basic.c"),
        "main file comes first: {:?}",
        db.sources
    );
}

#[test]
fn record_layout_matches_compiler() {
    let db = &*BASIC_DB;
    let node = db.named_type("node").expect("struct node missing");
    assert_eq!(node.class, TypeClass::Record);
    let fields: Vec<(&str, u64)> = node
        .fields
        .iter()
        .map(|f| (f.name.as_str(), f.offset))
        .collect();
    assert_eq!(fields, [("next", 0), ("pos", 8), ("vals", 16)]);
    assert_eq!(node.size, 32);

    let next = db.ty(node.fields[0].ty).expect("next type");
    assert_eq!(next.class, TypeClass::Pointer);
    assert_eq!(next.refs, vec![node.id], "next points back at struct node");
}

#[test]
fn static_global_is_internal() {
    let db = &*BASIC_DB;
    let counter = db.global("counter").expect("counter missing");
    assert_eq!(counter.linkage, Linkage::Internal);
    assert!(counter.defined);
    assert_eq!(counter.init.as_deref(), Some("counter = 3"));

    let sum = db.func("sum").expect("sum missing");
    assert!(
        sum.globalrefs.contains(&(counter.id as i64)),
        "sum reads counter: {:?}",
        sum.globalrefs
    );
}

#[test]
fn call_resolves_to_declaration() {
    let db = &*BASIC_DB;
    let sum = db.func("sum").expect("sum missing");
    let helper = db.funcdecl("helper").expect("helper missing");
    let call = sum
        .calls
        .iter()
        .find(|c| c.expr.contains("helper"))
        .expect("call to helper missing");
    let callee = call.callee.expect("direct call");
    assert_eq!(callee.kind, CalleeKind::Funcdecl);
    assert_eq!(callee.id, helper.id);
}

#[test]
fn member_chain_through_pointer() {
    let db = &*BASIC_DB;
    let sum = db.func("sum").expect("sum missing");
    let chain = sum
        .derefs
        .iter()
        .find(|d| d.kind == DerefKind::Member && d.member_path() == [1, 0])
        .unwrap_or_else(|| panic!("cur->pos.x missing. Derefs: {:#?}", sum.derefs));
    assert_eq!(chain.access, [MemberAccess::Value, MemberAccess::Pointer]);
    assert_eq!(chain.base[0].kind, RefKind::Local);
}

#[test]
fn subscript_of_member_array() {
    let db = &*BASIC_DB;
    let sum = db.func("sum").expect("sum missing");
    let array = sum
        .derefs
        .iter()
        .find(|d| d.kind == DerefKind::Array)
        .unwrap_or_else(|| panic!("cur->vals[n + 1] missing. Derefs: {:#?}", sum.derefs));
    assert_eq!(array.offset, Some(1));
    assert_eq!(array.base[0].kind, RefKind::Member);
    assert_eq!(array.offsetrefs.len(), 1);
    assert_eq!(array.offsetrefs[0].kind, RefKind::Parm);
}

#[test]
fn offsetof_folds_nested_designator() {
    let db = &*BASIC_DB;
    let f = db.func("offset").expect("offset missing");
    let rec = f
        .derefs
        .iter()
        .find(|d| d.kind == DerefKind::OffsetOf)
        .unwrap_or_else(|| panic!("offsetof record missing. Derefs: {:#?}", f.derefs));
    assert_eq!(rec.offset, Some(12), "pos at 8 plus y at 4");
}

#[test]
fn taint_database_is_applied() {
    let db = &*BASIC_DB;
    let sum = db.func("sum").expect("sum missing");
    assert_eq!(sum.taint.len(), 2, "one set per parameter");
    let head = &sum.taint[0];
    let cur = sum.local("cur").expect("cur missing").id;
    assert!(
        head.levels.get(&1).is_some_and(|l| l.contains(&cur)),
        "cur is initialized from head: {:?}",
        head.levels
    );
}
