//! Call resolution across definitions, declarations and unknown callees.

use std::sync::LazyLock;

use progdb::ast::{AstBuilder, TranslationUnit};
use progdb::db::{CalleeKind, CalleeRef, Database, DerefKind, RefKind};
use progdb::error::{DbError, Policy};
use progdb::visit::BuildOptions;

/// ```c
/// int later(int a);
/// void __compiletime_assert_11(void);
/// void __compiletime_assert_42(void);
/// int ext(int);
///
/// int caller(int (*fp)(int)) {
///     later(1);
///     ext(2);
///     __compiletime_assert_11();
///     __compiletime_assert_42();
///     mystery();
///     fp(3);
///     return 0;
/// }
///
/// int later(int a) { return a; }
/// ```
static CALLS_UNIT: LazyLock<TranslationUnit> = LazyLock::new(|| {
    let mut b = AstBuilder::new("calls.c");
    let int = b.int();
    let void = b.void();

    let later = b.function("later", int, &[("a", int)]);
    let cta1 = b.function("__compiletime_assert_11", void, &[]);
    let cta2 = b.function("__compiletime_assert_42", void, &[]);
    let ext = b.function("ext", int, &[("", int)]);

    let fn_ty = b.function_type(int, &[int], false);
    let fp_ty = b.pointer(fn_ty);
    let caller = b.function("caller", int, &[("fp", fp_ty)]);
    let fp = b.params(caller)[0];

    let mut body = Vec::new();
    let one = b.int_lit(1);
    let call = b.call_fn(later, vec![one]);
    body.push(b.expr_stmt(call));
    let two = b.int_lit(2);
    let call = b.call_fn(ext, vec![two]);
    body.push(b.expr_stmt(call));
    for cta in [cta1, cta2] {
        let call = b.call_fn(cta, vec![]);
        body.push(b.expr_stmt(call));
    }
    let name = b.unresolved("mystery");
    let call = b.call(name, vec![]);
    body.push(b.expr_stmt(call));
    let fp_ref = b.var(fp);
    let three = b.int_lit(3);
    let call = b.call(fp_ref, vec![three]);
    body.push(b.expr_stmt(call));
    let zero = b.int_lit(0);
    body.push(b.ret(Some(zero)));
    let block = b.block(body);
    b.set_body(caller, block);

    let def = b.redeclare(later);
    let a = b.params(def)[0];
    let a_ref = b.var(a);
    let ret = b.ret(Some(a_ref));
    let block = b.block(vec![ret]);
    b.set_body(def, block);

    b.finish()
});

static CALLS_DB: LazyLock<Database> = LazyLock::new(|| {
    progdb::build_unit(&CALLS_UNIT, &BuildOptions::default(), None).expect("build calls unit")
});

fn callee(db: &Database, index: usize) -> CalleeRef {
    let caller = db.func("caller").expect("caller missing");
    caller.calls[index]
        .callee
        .unwrap_or_else(|| panic!("call {index} has no static callee: {:?}", caller.calls))
}

#[test]
fn call_to_later_definition_resolves_to_func() {
    let db = &*CALLS_DB;
    let later = db.func("later").expect("later must be a defined function");
    assert_eq!(
        callee(db, 0),
        CalleeRef {
            kind: CalleeKind::Func,
            id: later.id
        },
        "a prior declaration must not shadow the definition"
    );
    assert!(
        db.funcdecl("later").is_none(),
        "later has a body and must not be a funcdecl: {:?}",
        db.funcdecls
    );
}

#[test]
fn declaration_only_callee_is_funcdecl() {
    let db = &*CALLS_DB;
    let ext = db.funcdecl("ext").expect("ext funcdecl missing");
    assert_eq!(
        callee(db, 1),
        CalleeRef {
            kind: CalleeKind::Funcdecl,
            id: ext.id
        }
    );
    assert_eq!(ext.types.len(), 2, "return type plus one parameter");
    assert_eq!(ext.declhash.len(), 64);
}

#[test]
fn compiletime_assert_helpers_collapse() {
    let db = &*CALLS_DB;
    let helpers: Vec<_> = db
        .funcdecls
        .iter()
        .filter(|f| f.name.starts_with("__compiletime_assert_"))
        .collect();
    assert_eq!(helpers.len(), 1, "helpers must collapse: {helpers:?}");
    assert_eq!(helpers[0].name, "__compiletime_assert_11", "first one wins");
    assert_eq!(callee(db, 2), callee(db, 3));
    assert_eq!(callee(db, 2).kind, CalleeKind::Funcdecl);
}

#[test]
fn collapsing_can_be_disabled() {
    let options = BuildOptions::with_compiletime_assert(Policy::BestEffort, "").expect("options");
    let db = progdb::build_unit(&CALLS_UNIT, &options, None).expect("build without collapsing");
    assert_eq!(
        db.funcdecls
            .iter()
            .filter(|f| f.name.starts_with("__compiletime_assert_"))
            .count(),
        2
    );
    assert_ne!(callee(&db, 2), callee(&db, 3));
}

#[test]
fn unknown_callee_goes_to_unresolved_bucket() {
    let db = &*CALLS_DB;
    let c = callee(db, 4);
    assert_eq!(c.kind, CalleeKind::Unresolved);
    let entry = &db.unresolvedfuncs[c.id as usize];
    assert_eq!(entry.name, "mystery");
}

#[test]
fn indirect_call_has_function_record() {
    let db = &*CALLS_DB;
    let caller = db.func("caller").expect("caller missing");
    let call = &caller.calls[5];
    assert!(call.is_indirect(), "fp(3) has no static callee: {call:?}");
    let rec = &caller.derefs[call.deref.expect("indirect call without record")];
    assert_eq!(rec.kind, DerefKind::Function);
    assert_eq!(rec.offset, Some(5), "function record names its call");
    assert_eq!(rec.base[0].kind, RefKind::Parm);

    assert_eq!(call.args.len(), 1);
    let arg = &caller.derefs[call.args[0]];
    assert_eq!(arg.kind, DerefKind::Parm);
    assert_eq!(arg.offset, Some(0));
    assert_eq!(arg.base[0].kind, RefKind::IntegerLiteral);
}

#[test]
fn calls_are_numbered_in_source_order() {
    let caller = CALLS_DB.func("caller").expect("caller missing");
    assert_eq!(caller.calls.len(), 6);
    for w in caller.calls.windows(2) {
        assert!(w[0].ord < w[1].ord, "call ordinals out of order: {:?}", caller.calls);
    }
    assert!(
        caller.funrefs.is_empty(),
        "direct callees are not function references: {:?}",
        caller.funrefs
    );
}

#[test]
fn nameless_callee_is_fatal_even_best_effort() {
    let mut b = AstBuilder::new("fatal.c");
    let int = b.int();
    // Implicit declarations are never registered, so the name is all there is.
    let anon = b.function("", int, &[]);
    b.set_implicit(anon);
    let f = b.function("f", int, &[]);
    let call = b.call_fn(anon, vec![]);
    let ret = b.ret(Some(call));
    let block = b.block(vec![ret]);
    b.set_body(f, block);
    let tu = b.finish();
    let r = progdb::build_unit(&tu, &BuildOptions::default(), None);
    assert!(
        matches!(r, Err(DbError::FatalResolution(_))),
        "expected fatal resolution error, got {r:?}"
    );
}
