//! Per-function statement tables: switch labels, inline assembly and
//! function addresses stored into record members.

use std::sync::LazyLock;

use progdb::ast::{AstBuilder, BinaryOp, DeclKind, Stmt, TagKind, TranslationUnit};
use progdb::db::{CalleeKind, CalleeRef, Database, FuncRecord, MemberStore, RefKind, StoreKind};
use progdb::visit::BuildOptions;

/// ```c
/// enum mode { OFF, ON = 4 };
/// struct ops { int (*open)(int); int (*close)(int); };
/// int my_open(int);
/// int my_close(int);
/// struct ops global_ops = { my_open, my_close };
///
/// int dispatch(int m, struct ops *o, int *p) {
///     struct ops local = { my_close };
///     switch (m) {
///     case ON: break;
///     case 2 + 3:
///         switch (m) { case 1: break; }
///     case (long)7: break;
///     }
///     o->open = my_open;
///     o->close = m ? my_open : &my_close;
///     *p;
///     asm("nop" : : "r"(*p));
///     return 0;
/// }
/// ```
static STMT_UNIT: LazyLock<TranslationUnit> = LazyLock::new(|| {
    let mut b = AstBuilder::new("stmts.c");
    let int = b.int();
    let long = b.long();
    let int_ptr = b.pointer(int);

    let (mode, _) = b.enumeration("mode", &[("OFF", 0), ("ON", 4)]);
    let on = match &b.unit().decl(mode).kind {
        DeclKind::Enum(e) => e.constants[1],
        other => panic!("not an enum: {other:?}"),
    };

    let fn_ty = b.function_type(int, &[int], false);
    let fp_ty = b.pointer(fn_ty);
    let (ops, ops_ty) = b.record(TagKind::Struct, "ops");
    let open = b.field(ops, "open", fp_ty);
    let close = b.field(ops, "close", fp_ty);
    b.complete(ops);
    let ops_ptr = b.pointer(ops_ty);

    let my_open = b.function("my_open", int, &[("", int)]);
    let my_close = b.function("my_close", int, &[("", int)]);
    let open_ref = b.var(my_open);
    let close_ref = b.var(my_close);
    let init = b.init_list(vec![open_ref, close_ref], ops_ty);
    b.global("global_ops", ops_ty, Some(init));

    let f = b.function(
        "dispatch",
        int,
        &[("m", int), ("o", ops_ptr), ("p", int_ptr)],
    );
    let params = b.params(f);
    let (m, o, p) = (params[0], params[1], params[2]);

    let close_ref = b.var(my_close);
    let init = b.init_list(vec![close_ref], ops_ty);
    let (_, decl_local) = b.let_local(f, "local", ops_ty, Some(init));

    let brk = b.stmt(Stmt::Break);
    let on_ref = b.var(on);
    let case_on = b.case(on_ref, brk);

    let brk = b.stmt(Stmt::Break);
    let one = b.int_lit(1);
    let case_one = b.case(one, brk);
    let inner_body = b.block(vec![case_one]);
    let m_ref = b.var(m);
    let inner = b.switch_stmt(m_ref, inner_body);
    let two = b.int_lit(2);
    let three = b.int_lit(3);
    let sum = b.binary(BinaryOp::Add, two, three);
    let case_sum = b.case(sum, inner);

    let brk = b.stmt(Stmt::Break);
    let seven = b.int_lit(7);
    let seven = b.cast(seven, long);
    let case_seven = b.case(seven, brk);

    let outer_body = b.block(vec![case_on, case_sum, case_seven]);
    let m_ref = b.var(m);
    let outer = b.switch_stmt(m_ref, outer_body);

    let o_ref = b.var(o);
    let target = b.member(o_ref, open, true);
    let open_ref = b.var(my_open);
    let assign = b.assign(target, open_ref);
    let store_open = b.expr_stmt(assign);

    let o_ref = b.var(o);
    let target = b.member(o_ref, close, true);
    let m_ref = b.var(m);
    let open_ref = b.var(my_open);
    let close_ref = b.var(my_close);
    let close_addr = b.addr_of(close_ref);
    let choice = b.conditional(m_ref, open_ref, close_addr);
    let assign = b.assign(target, choice);
    let store_close = b.expr_stmt(assign);

    let p_ref = b.var(p);
    let star = b.deref(p_ref);
    let bare = b.expr_stmt(star);
    let p_ref = b.var(p);
    let star = b.deref(p_ref);
    let asm = b.asm("nop", vec![star]);

    let zero = b.int_lit(0);
    let ret = b.ret(Some(zero));
    let block = b.block(vec![
        decl_local,
        outer,
        store_open,
        store_close,
        bare,
        asm,
        ret,
    ]);
    b.set_body(f, block);

    b.finish()
});

static STMT_DB: LazyLock<Database> = LazyLock::new(|| {
    progdb::build_unit(&STMT_UNIT, &BuildOptions::default(), None).expect("build statement unit")
});

fn dispatch(db: &Database) -> &FuncRecord {
    db.func("dispatch")
        .unwrap_or_else(|| panic!("dispatch missing. Funcs: {:?}", db.funcs))
}

fn decl_ref(db: &Database, name: &str) -> CalleeRef {
    let d = db
        .funcdecl(name)
        .unwrap_or_else(|| panic!("declaration {name} missing. Found: {:?}", db.funcdecls));
    CalleeRef {
        kind: CalleeKind::Funcdecl,
        id: d.id,
    }
}

fn ops_type(db: &Database) -> i64 {
    db.named_type("ops").expect("struct ops").id as i64
}

#[test]
fn switch_cases_fold_to_values() {
    let f = dispatch(&STMT_DB);
    assert_eq!(f.switches.len(), 2, "Found: {:?}", f.switches);
    let outer = &f.switches[0];
    assert_eq!(outer.condition, "m");
    assert_eq!(outer.csid, 0);
    let values: Vec<Option<i64>> = outer.cases.iter().map(|c| c.value).collect();
    assert_eq!(values, [Some(4), Some(5), Some(7)], "Found: {:?}", outer.cases);
    assert_eq!(outer.cases[0].enumerator.as_deref(), Some("ON"));
    assert_eq!(outer.cases[1].enumerator, None);
}

#[test]
fn nested_switch_owns_its_labels() {
    let f = dispatch(&STMT_DB);
    let inner = &f.switches[1];
    assert_eq!(inner.csid, 1, "inner switch sits in the outer body scope");
    let values: Vec<Option<i64>> = inner.cases.iter().map(|c| c.value).collect();
    assert_eq!(values, [Some(1)], "Found: {:?}", inner.cases);
}

#[test]
fn asm_keeps_text_and_operands() {
    let f = dispatch(&STMT_DB);
    assert_eq!(f.asm.len(), 1, "Found: {:?}", f.asm);
    let asm = &f.asm[0];
    assert_eq!(asm.text, "nop");
    assert_eq!(asm.csid, 0);
    assert_eq!(asm.operands.len(), 1);
    let operand = &asm.operands[0];
    assert_eq!(operand.kind, RefKind::Unary);
    let idx = operand.index().expect("record index") as usize;
    let rec = f
        .derefs
        .get(idx)
        .unwrap_or_else(|| panic!("operand points past the records. Found: {operand:?}"));
    assert_eq!(rec.offset, Some(0));
    assert_eq!(rec.base[0].kind, RefKind::Parm);
    assert_eq!(rec.base[0].index(), Some(2));
}

#[test]
fn function_stores_from_initializers_and_assignments() {
    let db = &*STMT_DB;
    let f = dispatch(db);
    let ops = ops_type(db);
    let (open, close) = (decl_ref(db, "my_open"), decl_ref(db, "my_close"));
    let store = |member, func, kind| MemberStore {
        ty: ops,
        member,
        func,
        kind,
    };
    assert_eq!(
        f.fops,
        vec![
            store(0, close, StoreKind::Init),
            store(0, open, StoreKind::Assign),
            store(1, open, StoreKind::Assign),
            store(1, close, StoreKind::Assign),
        ],
        "both arms of the conditional are stored"
    );
}

#[test]
fn global_initializer_stores() {
    let db = &*STMT_DB;
    let g = db.global("global_ops").expect("global_ops");
    let ops = ops_type(db);
    let members: Vec<(i64, i64, CalleeRef, StoreKind)> =
        g.fops.iter().map(|s| (s.ty, s.member, s.func, s.kind)).collect();
    assert_eq!(
        members,
        [
            (ops, 0, decl_ref(db, "my_open"), StoreKind::Init),
            (ops, 1, decl_ref(db, "my_close"), StoreKind::Init),
        ]
    );
}

#[test]
fn stores_survive_merge() {
    let merged = progdb::merge::merge(vec![STMT_DB.clone(), STMT_DB.clone()]);
    let g = merged.global("global_ops").expect("merged global_ops");
    let ops = ops_type(&merged);
    assert_eq!(g.fops.len(), 2, "Found: {:?}", g.fops);
    assert!(g.fops.iter().all(|s| s.ty == ops));
    assert_eq!(g.fops[0].func, decl_ref(&merged, "my_open"));
    let f = dispatch(&merged);
    assert_eq!(f.switches, dispatch(&STMT_DB).switches);
    assert_eq!(f.fops.len(), 4);
}
