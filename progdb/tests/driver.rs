//! Parallel unit processing, merging and the file-level pipeline.

use std::sync::LazyLock;

use progdb::ast::{AstBuilder, TagKind, TranslationUnit};
use progdb::db::{Database, TypeClass};
use progdb::driver;
use progdb::error::{DbError, Policy};
use progdb::visit::BuildOptions;

/// `int <name>(int x) { return x; }` in its own unit.
fn identity_unit(file: &str, name: &str) -> TranslationUnit {
    let mut b = AstBuilder::new(file);
    let int = b.int();
    let f = b.function(name, int, &[("x", int)]);
    let x = b.params(f)[0];
    let xr = b.var(x);
    let ret = b.ret(Some(xr));
    let block = b.block(vec![ret]);
    b.set_body(f, block);
    b.finish()
}

/// `struct node` defined, `struct node *head;` and `shared`.
fn defining_unit() -> TranslationUnit {
    let mut b = AstBuilder::new("list.c");
    let int = b.int();
    let (node, nty) = b.record(TagKind::Struct, "node");
    let pn = b.pointer(nty);
    b.field(node, "next", pn);
    b.field(node, "value", int);
    b.complete(node);
    b.global("head", pn, None);
    let f = b.function("shared", int, &[("x", int)]);
    let x = b.params(f)[0];
    let xr = b.var(x);
    let ret = b.ret(Some(xr));
    let block = b.block(vec![ret]);
    b.set_body(f, block);
    b.finish()
}

/// Only a forward `struct node;`, `void walk(struct node *);` and `shared`.
fn forward_unit() -> TranslationUnit {
    let mut b = AstBuilder::new("walk.c");
    let int = b.int();
    let void = b.void();
    let (_, nty) = b.record(TagKind::Struct, "node");
    let pn = b.pointer(nty);
    let walk = b.function("walk", void, &[("n", pn)]);
    let user = b.function("user", void, &[("n", pn)]);
    let n = b.params(user)[0];
    let nr = b.var(n);
    let call = b.call_fn(walk, vec![nr]);
    let stmt = b.expr_stmt(call);
    let block = b.block(vec![stmt]);
    b.set_body(user, block);
    let f = b.function("shared", int, &[("x", int)]);
    let x = b.params(f)[0];
    let xr = b.var(x);
    let ret = b.ret(Some(xr));
    let block = b.block(vec![ret]);
    b.set_body(f, block);
    b.finish()
}

static MERGED: LazyLock<Database> = LazyLock::new(|| {
    let units = vec![defining_unit(), forward_unit()];
    let results = driver::build_parallel(&units, &BuildOptions::default(), None, 2);
    driver::collect(&units, results, Policy::BestEffort).expect("merge units")
});

#[test]
fn parallel_results_keep_unit_order() {
    let units: Vec<TranslationUnit> = (0..7)
        .map(|i| identity_unit(&format!("u{i}.c"), &format!("f{i}")))
        .collect();
    let results = driver::build_parallel(&units, &BuildOptions::default(), None, 3);
    assert_eq!(results.len(), units.len());
    for (i, r) in results.iter().enumerate() {
        let db = r.as_ref().expect("unit builds");
        assert_eq!(db.sources[0], format!("u{i}.c"), "result {i} out of order");
        assert_eq!(db.funcs[0].name, format!("f{i}"));
    }
}

#[test]
fn single_worker_matches_many() {
    let units: Vec<TranslationUnit> = (0..4)
        .map(|i| identity_unit(&format!("u{i}.c"), &format!("f{i}")))
        .collect();
    let one = driver::build_parallel(&units, &BuildOptions::default(), None, 1);
    let many = driver::build_parallel(&units, &BuildOptions::default(), None, 8);
    assert_eq!(one, many, "worker count must not change results");
}

#[test]
fn merge_deduplicates_by_hash() {
    let db = &*MERGED;
    assert_eq!(db.sources, ["list.c", "walk.c"]);
    let shared = db.funcs.iter().filter(|f| f.name == "shared").count();
    assert_eq!(shared, 1, "identical definitions must merge: {:?}", db.funcs);
    assert_eq!(db.funcs.len(), 2, "shared and user: {:?}", db.funcs);

    let ints = db.types.iter().filter(|t| t.spelling == "int").count();
    assert_eq!(ints, 1, "builtin int must merge");
    let ptrs = db
        .types
        .iter()
        .filter(|t| t.spelling == "struct node *")
        .count();
    assert_eq!(ptrs, 1, "pointer to a named record hashes by name only");

    for (i, t) in db.types.iter().enumerate() {
        assert_eq!(t.id, i as u64, "merged type ids must be dense");
    }
}

#[test]
fn merge_links_forward_record_to_definition() {
    let db = &*MERGED;
    let complete = db.named_type("node").expect("complete struct node");
    let forward: Vec<_> = db
        .types
        .iter()
        .filter(|t| t.class == TypeClass::RecordForward)
        .collect();
    assert_eq!(forward.len(), 1, "one forward record: {forward:?}");
    assert_eq!(forward[0].definition, Some(complete.id));
}

#[test]
fn merge_remaps_callees() {
    let db = &*MERGED;
    let user = db.func("user").expect("user missing");
    let walk = db.funcdecl("walk").expect("walk funcdecl missing");
    let callee = user.calls[0].callee.expect("direct call");
    assert_eq!(callee.id, walk.id);
    assert_eq!(user.fid, 1, "user lives in the second source");
    assert_eq!(
        user.types[1],
        db.types
            .iter()
            .position(|t| t.spelling == "struct node *")
            .map(|p| p as i64)
            .expect("pointer type"),
        "parameter type must use the merged numbering"
    );
}

#[test]
fn strict_collect_fails_on_abandoned_unit() {
    let mut b = AstBuilder::new("bad.c");
    let atomic = b.unsupported_type("Atomic");
    b.global("bad", atomic, None);
    let units = vec![b.finish()];

    let results = driver::build_parallel(&units, &BuildOptions::strict(), None, 1);
    assert!(matches!(results[0], Err(DbError::UnsupportedTypeKind(_))));
    let err = driver::collect(&units, results, Policy::Strict).expect_err("strict must fail");
    assert!(
        format!("{err:#}").contains("bad.c"),
        "error must name the unit: {err:#}"
    );

    let results = driver::build_parallel(&units, &BuildOptions::default(), None, 1);
    let db = driver::collect(&units, results, Policy::BestEffort).expect("best effort");
    assert_eq!(db.diagnostics.count(progdb::error::DiagKind::UnsupportedTypeKind), 1);
    assert!(db.global("bad").is_some(), "best effort keeps the global");
}

#[test]
fn best_effort_collect_skips_failed_units() {
    let units = vec![identity_unit("ok.c", "ok"), identity_unit("gone.c", "gone")];
    let mut results = driver::build_parallel(&units, &BuildOptions::default(), None, 2);
    results[1] = Err(DbError::UnsupportedDeclKind("test".to_string()));
    let db = driver::collect(&units, results, Policy::BestEffort).expect("best effort");
    assert!(db.func("ok").is_some());
    assert!(db.func("gone").is_none());
}

#[test]
fn run_writes_database_for_json_units() {
    let dir = tempfile::tempdir().expect("tempdir");
    let unit = identity_unit("id.c", "id");
    std::fs::write(
        dir.path().join("id.json"),
        serde_json::to_string(&unit).expect("serialize unit"),
    )
    .expect("write unit");
    std::fs::write(
        dir.path().join("progdb.toml"),
        "jobs = 2\n\n[output]\nfile = \"out.json\"\n\n[[unit]]\nast = \"id.json\"\n",
    )
    .expect("write config");

    let written = progdb::run(&dir.path().join("progdb.toml"), None).expect("run pipeline");
    assert_eq!(written, dir.path().join("out.json"));

    let text = std::fs::read_to_string(&written).expect("read output");
    let db: Database = serde_json::from_str(&text).expect("parse output");
    let f = db.func("id").expect("id missing from written database");
    assert_eq!(f.locals.len(), 1);
    assert_eq!(db.sources, ["id.c"]);
}

#[test]
fn unit_must_name_exactly_one_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("progdb.toml"),
        "[[unit]]\nsource = \"a.c\"\nast = \"a.json\"\n",
    )
    .expect("write config");
    let err = progdb::generate(&dir.path().join("progdb.toml")).expect_err("ambiguous unit");
    assert!(format!("{err:#}").contains("exactly one"), "got: {err:#}");
}

const DANGLING_UNIT: &str = r#"{"main_file":0,"files":["dangling.c"],"types":[],"decls":[],"exprs":[],"stmts":[],"top_level":[7]}"#;

#[test]
fn malformed_unit_is_an_error_not_a_panic() {
    let unit: TranslationUnit = serde_json::from_str(DANGLING_UNIT).expect("parse unit");
    let r = progdb::build_unit(&unit, &BuildOptions::default(), None);
    assert!(
        matches!(r, Err(DbError::MalformedUnit(_))),
        "dangling declaration id must be rejected. Found: {r:?}"
    );

    let units = vec![unit, identity_unit("fine.c", "fine")];
    let results = driver::build_parallel(&units, &BuildOptions::default(), None, 2);
    let db = driver::collect(&units, results, Policy::BestEffort).expect("best effort");
    assert_eq!(db.sources, ["fine.c"], "the malformed unit is abandoned");
    assert!(db.func("fine").is_some());
}

#[test]
fn malformed_json_unit_is_skipped_unless_strict() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("bad.json"), DANGLING_UNIT).expect("write bad unit");
    std::fs::write(
        dir.path().join("good.json"),
        serde_json::to_string(&identity_unit("good.c", "good")).expect("serialize unit"),
    )
    .expect("write good unit");
    let units = "[[unit]]\nast = \"bad.json\"\n\n[[unit]]\nast = \"good.json\"\n";

    std::fs::write(dir.path().join("progdb.toml"), units).expect("write config");
    let db = progdb::generate(&dir.path().join("progdb.toml")).expect("best effort run");
    assert_eq!(db.sources, ["good.c"]);
    assert!(db.func("good").is_some());

    std::fs::write(
        dir.path().join("progdb.toml"),
        format!("strict = true\n\n{units}"),
    )
    .expect("write strict config");
    let err = progdb::generate(&dir.path().join("progdb.toml")).expect_err("strict run");
    let msg = format!("{err:#}");
    assert!(msg.contains("bad.json") && msg.contains("malformed"), "got: {msg}");
}
