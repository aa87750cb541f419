//! Dereference extraction: offsets, member chains, offsetof, control flow and dedup.

use std::sync::LazyLock;

use progdb::ast::{AstBuilder, BinaryOp, CastKind, OffsetOfComponent, TagKind, TranslationUnit};
use progdb::db::{Database, DerefKind, FuncRecord, MemberAccess, RefKind, RefValue, Sign};
use progdb::visit::BuildOptions;

/// ```c
/// struct leaf { int pad; int d; };
/// struct mid { struct leaf *c; };
/// struct outer { int x; struct mid b; };
/// struct arr { int items[4]; };
///
/// int access(int *base, int n) {
///     struct outer a;
///     base[3 * 4 + 1];
///     base[n + 1];
///     a.b.c->d;
///     *base;
///     *base;
///     offsetof(struct outer, b.c);
///     offsetof(struct arr, items[n]);
/// }
///
/// void store(int *p, int x) { *p = x + 1; }
/// ```
static DEREF_UNIT: LazyLock<TranslationUnit> = LazyLock::new(|| {
    let mut b = AstBuilder::new("deref.c");
    let int = b.int();
    let void = b.void();
    let int_ptr = b.pointer(int);

    let (leaf, leaf_ty) = b.record(TagKind::Struct, "leaf");
    b.field(leaf, "pad", int);
    let d = b.field(leaf, "d", int);
    b.complete(leaf);
    let leaf_ptr = b.pointer(leaf_ty);
    let (mid, mid_ty) = b.record(TagKind::Struct, "mid");
    let c = b.field(mid, "c", leaf_ptr);
    b.complete(mid);
    let (outer, outer_ty) = b.record(TagKind::Struct, "outer");
    b.field(outer, "x", int);
    let bf = b.field(outer, "b", mid_ty);
    b.complete(outer);
    let (arr, arr_ty) = b.record(TagKind::Struct, "arr");
    let int4 = b.array(int, 4);
    let items = b.field(arr, "items", int4);
    b.complete(arr);

    let f = b.function("access", int, &[("base", int_ptr), ("n", int)]);
    let params = b.params(f);
    let (base, n) = (params[0], params[1]);
    let (a, decl_a) = b.let_local(f, "a", outer_ty, None);

    let mut body = vec![decl_a];

    let three = b.int_lit(3);
    let four = b.int_lit(4);
    let mul = b.binary(BinaryOp::Mul, three, four);
    let one = b.int_lit(1);
    let idx = b.binary(BinaryOp::Add, mul, one);
    let base_ref = b.var(base);
    let sub = b.subscript(base_ref, idx);
    body.push(b.expr_stmt(sub));

    let n_ref = b.var(n);
    let one = b.int_lit(1);
    let idx = b.binary(BinaryOp::Add, n_ref, one);
    let base_ref = b.var(base);
    let sub = b.subscript(base_ref, idx);
    body.push(b.expr_stmt(sub));

    let a_ref = b.var(a);
    let ab = b.member(a_ref, bf, false);
    let abc = b.member(ab, c, false);
    let abcd = b.member(abc, d, true);
    body.push(b.expr_stmt(abcd));

    for _ in 0..2 {
        let base_ref = b.var(base);
        let star = b.deref(base_ref);
        body.push(b.expr_stmt(star));
    }

    let off = b.offset_of(
        outer_ty,
        vec![OffsetOfComponent::Field(bf), OffsetOfComponent::Field(c)],
    );
    body.push(b.expr_stmt(off));

    let n_ref = b.var(n);
    let off = b.offset_of(
        arr_ty,
        vec![OffsetOfComponent::Field(items), OffsetOfComponent::Index(n_ref)],
    );
    body.push(b.expr_stmt(off));

    let block = b.block(body);
    b.set_body(f, block);

    let g = b.function("store", void, &[("p", int_ptr), ("x", int)]);
    let params = b.params(g);
    let p_ref = b.var(params[0]);
    let star = b.deref(p_ref);
    let x_ref = b.var(params[1]);
    let one = b.int_lit(1);
    let sum = b.binary(BinaryOp::Add, x_ref, one);
    let assign = b.assign(star, sum);
    let stmt = b.expr_stmt(assign);
    let block = b.block(vec![stmt]);
    b.set_body(g, block);

    b.finish()
});

static DEREF_DB: LazyLock<Database> = LazyLock::new(|| {
    progdb::build_unit(&DEREF_UNIT, &BuildOptions::default(), None).expect("build deref unit")
});

fn func<'a>(db: &'a Database, name: &str) -> &'a FuncRecord {
    db.func(name)
        .unwrap_or_else(|| panic!("function {name} missing. Funcs: {:?}", db.funcs))
}

#[test]
fn locals_list_parameters_first() {
    let f = func(&DEREF_DB, "access");
    let names: Vec<(&str, bool)> = f.locals.iter().map(|l| (l.name.as_str(), l.parm)).collect();
    assert_eq!(names, [("base", true), ("n", true), ("a", false)]);
    assert_eq!(f.local("base").map(|l| l.csid), Some(-1));
    assert_eq!(f.local("a").map(|l| l.csid), Some(0));
    assert_eq!(f.declcount, 1);
}

#[test]
fn constant_subscript_folds_into_offset() {
    let f = func(&DEREF_DB, "access");
    let rec = &f.derefs[0];
    assert_eq!(rec.kind, DerefKind::Array, "first record: {rec:?}");
    assert_eq!(rec.offset, Some(13), "3*4+1 must fold to 13");
    assert!(rec.offsetrefs.is_empty(), "no variable index terms: {rec:?}");
    assert_eq!(rec.basecnt(), 1);
    assert_eq!(rec.base[0].kind, RefKind::Parm);
    assert_eq!(rec.base[0].index(), Some(0));
}

#[test]
fn variable_subscript_keeps_reference() {
    let f = func(&DEREF_DB, "access");
    let rec = &f.derefs[1];
    assert_eq!(rec.kind, DerefKind::Array, "second record: {rec:?}");
    assert_eq!(rec.offset, Some(1), "constant part of n+1");
    assert_eq!(rec.offsetrefs.len(), 1, "n must stay symbolic: {rec:?}");
    let r = &rec.offsetrefs[0];
    assert_eq!(r.kind, RefKind::Parm);
    assert_eq!(r.id, RefValue::Id(1));
    assert_eq!(r.sign, Sign::Plus);
}

#[test]
fn member_chain_is_one_record() {
    let db = &*DEREF_DB;
    let f = func(db, "access");
    let members: Vec<_> = f
        .derefs
        .iter()
        .filter(|d| d.kind == DerefKind::Member)
        .collect();
    assert_eq!(members.len(), 1, "a.b.c->d must fold into one record: {members:?}");
    let rec = members[0];

    // b is field 1 of outer, c field 0 of mid, d field 1 of leaf.
    assert_eq!(rec.member_path(), vec![1, 0, 1]);
    assert_eq!(
        rec.access,
        vec![MemberAccess::Pointer, MemberAccess::Value, MemberAccess::Value],
        "access kinds are stored outer-to-inner"
    );
    let leaf = db.named_type("leaf").expect("struct leaf").id as i64;
    let outer = db.named_type("outer").expect("struct outer").id as i64;
    assert_eq!(rec.member_types.first(), Some(&leaf));
    assert_eq!(rec.member_types.last(), Some(&outer));
    assert_eq!(rec.shift, vec![0, 0, 0]);

    assert_eq!(rec.basecnt(), 1);
    assert_eq!(rec.base[0].kind, RefKind::Local);
    assert_eq!(rec.base[0].index(), f.local("a").map(|l| l.id as i64));
}

#[test]
fn repeated_dereference_is_deduplicated() {
    let f = func(&DEREF_DB, "access");
    let unary: Vec<_> = f
        .derefs
        .iter()
        .filter(|d| d.kind == DerefKind::Unary)
        .collect();
    assert_eq!(unary.len(), 1, "two `*base` must merge: {unary:?}");
    assert_eq!(unary[0].ord.len(), 2, "merged record keeps both occurrences");
    assert!(unary[0].ord[0] < unary[0].ord[1]);
    assert_eq!(unary[0].offset, Some(0));
}

#[test]
fn offsetof_constant_and_variable() {
    let f = func(&DEREF_DB, "access");
    let offs: Vec<_> = f
        .derefs
        .iter()
        .filter(|d| d.kind == DerefKind::OffsetOf)
        .collect();
    assert_eq!(offs.len(), 2, "offsetof records: {offs:?}");

    // b sits at 8 in outer (mid is pointer aligned), c at 0 in mid.
    assert_eq!(offs[0].offset, Some(8));
    assert_eq!(offs[0].member_path(), vec![1, 0]);
    assert!(offs[0].offsetrefs.is_empty());

    assert_eq!(offs[1].offset, Some(-1), "variable index is not constant");
    assert_eq!(offs[1].offsetrefs.len(), 1);
    assert_eq!(offs[1].offsetrefs[0].kind, RefKind::Parm);
    assert_eq!(offs[1].offsetrefs[0].mi, Some(1));
}

#[test]
fn assignment_points_at_nested_record() {
    let f = func(&DEREF_DB, "store");
    assert_eq!(f.derefs.len(), 2, "unary plus assign: {:?}", f.derefs);
    let (star, assign) = (&f.derefs[0], &f.derefs[1]);
    assert_eq!(star.kind, DerefKind::Unary);
    assert_eq!(assign.kind, DerefKind::Assign);
    assert_eq!(assign.offset, Some(BinaryOp::Assign.code()));
    assert_eq!(assign.base[0].kind, RefKind::Unary);
    assert_eq!(assign.base[0].index(), Some(0), "nested record comes first");

    let kinds: Vec<RefKind> = assign.offsetrefs.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, [RefKind::Parm, RefKind::IntegerLiteral]);
}

#[test]
fn records_never_point_forward() {
    for f in &DEREF_DB.funcs {
        for (i, d) in f.derefs.iter().enumerate() {
            for r in d.base.iter().chain(&d.offsetrefs) {
                if r.kind.is_referent() {
                    let j = r.index().expect("referent id");
                    assert!(
                        (j as usize) < i,
                        "{}: record {i} points at later record {j}",
                        f.name
                    );
                }
            }
        }
    }
}

#[test]
fn build_is_deterministic() {
    let again =
        progdb::build_unit(&DEREF_UNIT, &BuildOptions::default(), None).expect("rebuild deref unit");
    assert_eq!(*DEREF_DB, again, "building the same unit twice must be identical");
}

/// ```c
/// struct node { int x; };
/// struct node *head(void);
///
/// long flow(int *p, int n) {
///     int k = n;
///     if (n && p) {
///         *(p - n - 2);
///         *(char *)p;
///     }
///     return k;
/// }
///
/// int first(void) { return head()->x; }
///
/// void twice(int *p) { *p = 1; *p = 1; *p; }
/// ```
static FLOW_UNIT: LazyLock<TranslationUnit> = LazyLock::new(|| {
    let mut b = AstBuilder::new("flow.c");
    let int = b.int();
    let long = b.long();
    let ch = b.char();
    let void = b.void();
    let int_ptr = b.pointer(int);
    let char_ptr = b.pointer(ch);

    let (node, node_ty) = b.record(TagKind::Struct, "node");
    let x = b.field(node, "x", int);
    b.complete(node);
    let node_ptr = b.pointer(node_ty);
    let head = b.function("head", node_ptr, &[]);

    let f = b.function("flow", long, &[("p", int_ptr), ("n", int)]);
    let params = b.params(f);
    let (p, n) = (params[0], params[1]);
    let n_ref = b.var(n);
    let n_val = b.implicit_cast(n_ref, CastKind::LValueToRValue, int);
    let (k, decl_k) = b.let_local(f, "k", int, Some(n_val));

    let n_ref = b.var(n);
    let p_ref = b.var(p);
    let cond = b.binary(BinaryOp::LAnd, n_ref, p_ref);
    let p_ref = b.var(p);
    let n_ref = b.var(n);
    let diff = b.binary(BinaryOp::Sub, p_ref, n_ref);
    let two = b.int_lit(2);
    let diff = b.binary(BinaryOp::Sub, diff, two);
    let paren = b.paren(diff);
    let star = b.deref(paren);
    let first_stmt = b.expr_stmt(star);
    let p_ref = b.var(p);
    let as_char = b.cast(p_ref, char_ptr);
    let star = b.deref(as_char);
    let second_stmt = b.expr_stmt(star);
    let then = b.block(vec![first_stmt, second_stmt]);
    let if_stmt = b.if_stmt(cond, then, None);

    let k_ref = b.var(k);
    let k_val = b.implicit_cast(k_ref, CastKind::LValueToRValue, int);
    let widened = b.implicit_cast(k_val, CastKind::IntegralCast, long);
    let ret = b.ret(Some(widened));
    let block = b.block(vec![decl_k, if_stmt, ret]);
    b.set_body(f, block);

    let g = b.function("first", int, &[]);
    let call = b.call_fn(head, vec![]);
    let member = b.member(call, x, true);
    let ret = b.ret(Some(member));
    let block = b.block(vec![ret]);
    b.set_body(g, block);

    let h = b.function("twice", void, &[("p", int_ptr)]);
    let p = b.params(h)[0];
    let mut body = Vec::new();
    for _ in 0..2 {
        let p_ref = b.var(p);
        let star = b.deref(p_ref);
        let one = b.int_lit(1);
        let assign = b.assign(star, one);
        body.push(b.expr_stmt(assign));
    }
    let p_ref = b.var(p);
    let star = b.deref(p_ref);
    body.push(b.expr_stmt(star));
    let block = b.block(body);
    b.set_body(h, block);

    b.finish()
});

static FLOW_DB: LazyLock<Database> = LazyLock::new(|| {
    progdb::build_unit(&FLOW_UNIT, &BuildOptions::default(), None).expect("build flow unit")
});

fn spelling(db: &Database, id: Option<i64>) -> Option<&str> {
    id.and_then(|i| db.ty(i as u64)).map(|t| t.spelling.as_str())
}

#[test]
fn flow_records_come_in_walk_order() {
    let f = func(&FLOW_DB, "flow");
    let kinds: Vec<DerefKind> = f.derefs.iter().map(|d| d.kind).collect();
    assert_eq!(
        kinds,
        [
            DerefKind::Init,
            DerefKind::Logic,
            DerefKind::Cond,
            DerefKind::Unary,
            DerefKind::Unary,
            DerefKind::Return,
        ],
        "Found: {:?}",
        f.derefs
    );
}

#[test]
fn initializer_names_the_local_and_its_sources() {
    let f = func(&FLOW_DB, "flow");
    let init = &f.derefs[0];
    assert_eq!(init.offset, Some(1), "scalar initializer has one element");
    assert_eq!(init.base[0].kind, RefKind::Local);
    assert_eq!(init.base[0].index(), f.local("k").map(|l| l.id as i64));
    assert_eq!(init.offsetrefs.len(), 1, "Found: {init:?}");
    assert_eq!(init.offsetrefs[0].kind, RefKind::Parm);
    assert_eq!(init.offsetrefs[0].index(), Some(1));
    assert_eq!(init.offsetrefs[0].cast, None, "lvalue conversion keeps the value");
}

#[test]
fn condition_points_at_logic_record() {
    let f = func(&FLOW_DB, "flow");
    let (logic, cond) = (&f.derefs[1], &f.derefs[2]);
    assert_eq!(logic.offset, Some(BinaryOp::LAnd.code()));
    let operands: Vec<(RefKind, Option<i64>)> = logic
        .base
        .iter()
        .chain(&logic.offsetrefs)
        .map(|r| (r.kind, r.index()))
        .collect();
    assert_eq!(operands, [(RefKind::Parm, Some(1)), (RefKind::Parm, Some(0))]);

    assert_eq!(cond.offset, Some(1), "condition guards the then-block scope");
    assert_eq!(cond.basecnt(), 1, "Found: {cond:?}");
    assert_eq!(cond.base[0].kind, RefKind::Logic);
    assert_eq!(cond.base[0].index(), Some(1));
}

#[test]
fn subtractive_chain_keeps_signs() {
    let f = func(&FLOW_DB, "flow");
    let rec = &f.derefs[3];
    assert_eq!(rec.offset, Some(-2), "Found: {rec:?}");
    assert_eq!(rec.base[0].kind, RefKind::Parm);
    assert_eq!(rec.base[0].index(), Some(0));
    assert_eq!(rec.base[0].sign, Sign::Plus);
    assert_eq!(rec.offsetrefs.len(), 1);
    assert_eq!(rec.offsetrefs[0].index(), Some(1));
    assert_eq!(rec.offsetrefs[0].sign, Sign::Minus);
    assert_eq!(rec.cast, None);
}

#[test]
fn explicit_and_widening_casts_are_annotated() {
    let db = &*FLOW_DB;
    let f = func(db, "flow");
    let star = &f.derefs[4];
    assert_eq!(spelling(db, star.cast), Some("char *"), "Found: {star:?}");
    assert_eq!(star.base[0].cast, star.cast);

    let ret = &f.derefs[5];
    assert_eq!(ret.base[0].kind, RefKind::Local);
    assert_eq!(ret.base[0].index(), f.local("k").map(|l| l.id as i64));
    assert_eq!(spelling(db, ret.base[0].cast), Some("long"), "Found: {ret:?}");
}

#[test]
fn member_of_call_result_records_mcall() {
    let f = func(&FLOW_DB, "first");
    assert_eq!(f.calls.len(), 1);
    let member = &f.derefs[0];
    assert_eq!(member.kind, DerefKind::Member, "Found: {:?}", f.derefs);
    assert_eq!(member.access, vec![MemberAccess::Pointer]);
    assert_eq!(member.mcall, Some(vec![0]), "step 0 is on call 0");
    assert_eq!(member.base[0].kind, RefKind::Callref);
    assert_eq!(member.base[0].index(), Some(0));

    let ret = &f.derefs[1];
    assert_eq!(ret.kind, DerefKind::Return);
    assert_eq!(ret.base[0].kind, RefKind::Member);
    assert_eq!(ret.base[0].index(), Some(0));
}

#[test]
fn referenced_records_are_not_merged() {
    let f = func(&FLOW_DB, "twice");
    let kinds: Vec<DerefKind> = f.derefs.iter().map(|d| d.kind).collect();
    assert_eq!(
        kinds,
        [DerefKind::Unary, DerefKind::Assign, DerefKind::Unary, DerefKind::Assign],
        "both assignment targets stay; the bare `*p` folds into the first. Found: {:?}",
        f.derefs
    );
    assert_eq!(f.derefs[1].base[0].index(), Some(0));
    assert_eq!(f.derefs[3].base[0].index(), Some(2));
    assert_eq!(f.derefs[0].ord.len(), 2, "Found: {:?}", f.derefs[0]);
    assert_eq!(f.derefs[2].ord.len(), 1);
}
