//! Type canonicalization and hashing through the full per-unit pipeline.

use std::sync::LazyLock;

use progdb::ast::{AstBuilder, Qualifiers, TagKind, TranslationUnit};
use progdb::db::{Database, TypeClass};
use progdb::visit::BuildOptions;

/// `struct { int a; } x; struct { int a; } y;` plus a pair of mutually
/// recursive records and a typedef'd const pointer.
static TYPES_UNIT: LazyLock<TranslationUnit> = LazyLock::new(|| {
    let mut b = AstBuilder::new("types.c");
    let int = b.int();

    let (anon1, anon1_ty) = b.record(TagKind::Struct, "");
    b.field(anon1, "a", int);
    b.complete(anon1);
    b.global("x", anon1_ty, None);

    let (anon2, anon2_ty) = b.record(TagKind::Struct, "");
    b.field(anon2, "a", int);
    b.complete(anon2);
    b.global("y", anon2_ty, None);

    let (ping, ping_ty) = b.record(TagKind::Struct, "ping");
    let (pong, pong_ty) = b.record(TagKind::Struct, "pong");
    let ping_ptr = b.pointer(ping_ty);
    let pong_ptr = b.pointer(pong_ty);
    b.field(ping, "other", pong_ptr);
    b.field(ping, "n", int);
    b.complete(ping);
    b.field(pong, "other", ping_ptr);
    b.complete(pong);
    b.global("table", ping_ty, None);

    let cint = b.qualified(int, Qualifiers::CONST);
    let cptr = b.pointer(cint);
    let (_, handle) = b.typedef("handle_t", cptr);
    b.global("h", handle, None);
    b.global("plain", int, None);
    b.finish()
});

static TYPES_DB: LazyLock<Database> = LazyLock::new(|| {
    progdb::build_unit(&TYPES_UNIT, &BuildOptions::default(), None).expect("build types unit")
});

fn global_type(db: &Database, name: &str) -> u64 {
    let g = db
        .global(name)
        .unwrap_or_else(|| panic!("global {name} missing. Globals: {:?}", db.globals));
    g.ty as u64
}

#[test]
fn anonymous_records_with_equal_layout_share_hash_not_id() {
    let db = &*TYPES_DB;
    let x = global_type(db, "x");
    let y = global_type(db, "y");
    assert_ne!(x, y, "distinct anonymous records must keep distinct ids");
    let (tx, ty) = (db.ty(x).unwrap(), db.ty(y).unwrap());
    assert_eq!(tx.class, TypeClass::Record);
    assert_eq!(
        tx.hash, ty.hash,
        "anonymous records with the same layout must hash equally"
    );
    assert!(tx.name.is_none(), "anonymous record got a name: {tx:?}");
}

#[test]
fn type_ids_are_dense_and_self_describing() {
    let db = &*TYPES_DB;
    for (i, t) in db.types.iter().enumerate() {
        assert_eq!(t.id, i as u64, "type at position {i} has id {}", t.id);
        for r in &t.refs {
            assert!(
                (*r as usize) < db.types.len(),
                "type {} refers to missing type {r}",
                t.spelling
            );
        }
        assert_eq!(t.hash.len(), 64, "type {} has no hash", t.spelling);
    }
}

#[test]
fn mutually_recursive_records_terminate() {
    let db = &*TYPES_DB;
    let ping = db.named_type("ping").expect("struct ping missing");
    let pong = db.named_type("pong").expect("struct pong missing");
    assert_eq!(ping.class, TypeClass::Record);
    assert_eq!(pong.class, TypeClass::Record);

    let other = ping.field("other").expect("ping.other missing");
    let ptr = db.ty(other.ty).expect("pointer type missing");
    assert_eq!(ptr.class, TypeClass::Pointer);
    assert_eq!(ptr.refs, vec![pong.id], "ping.other must point at pong");
    assert_eq!(ping.field("n").map(|f| f.offset), Some(8));

    let back = pong.field("other").expect("pong.other missing");
    assert_eq!(db.ty(back.ty).map(|t| t.refs.clone()), Some(vec![ping.id]));
    assert_ne!(ping.hash, pong.hash);
}

#[test]
fn hashes_do_not_depend_on_registration_order() {
    // Same declarations, but `pong` is registered before `ping`.
    let mut b = AstBuilder::new("reordered.c");
    let int = b.int();
    let (pong, pong_ty) = b.record(TagKind::Struct, "pong");
    let (ping, ping_ty) = b.record(TagKind::Struct, "ping");
    let ping_ptr = b.pointer(ping_ty);
    b.field(pong, "other", ping_ptr);
    b.complete(pong);
    let pong_ptr = b.pointer(pong_ty);
    b.field(ping, "other", pong_ptr);
    b.field(ping, "n", int);
    b.complete(ping);
    let tu = b.finish();
    let db = progdb::build_unit(&tu, &BuildOptions::default(), None).expect("build reordered");

    let a = &*TYPES_DB;
    for name in ["ping", "pong"] {
        assert_eq!(
            a.named_type(name).map(|t| t.hash.clone()),
            db.named_type(name).map(|t| t.hash.clone()),
            "hash of {name} changed with registration order"
        );
    }
}

#[test]
fn qualifiers_and_typedefs_are_kept() {
    let db = &*TYPES_DB;
    let handle = db.named_type("handle_t").expect("typedef handle_t missing");
    assert_eq!(handle.class, TypeClass::Typedef);
    assert_eq!(global_type(db, "h"), handle.id);

    let ptr = db.ty(handle.refs[0]).expect("typedef target missing");
    assert_eq!(ptr.class, TypeClass::Pointer);
    let pointee = db.ty(ptr.refs[0]).expect("pointee missing");
    assert_eq!(pointee.qualifiers, "c", "pointee must be const int: {pointee:?}");

    let plain = db.ty(global_type(db, "plain")).expect("int missing");
    assert_eq!(plain.qualifiers, "");
    assert_ne!(plain.id, pointee.id, "const int and int must be distinct");
    assert_ne!(plain.hash, pointee.hash);
}
