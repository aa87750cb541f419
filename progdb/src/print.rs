//! C-like rendering of model statements and expressions.
//!
//! Used for function bodies, initializer text and the `expr` field of
//! dereference records. The output is stable, which matters because it
//! feeds the function hash.

use std::fmt::Write;

use crate::ast::{DeclId, DeclKind, ExprId, ExprKind, OffsetOfComponent, SourceLoc, Stmt, StmtId, TranslationUnit};

pub fn expr(ast: &TranslationUnit, e: ExprId) -> String {
    let mut out = String::new();
    write_expr(ast, e, &mut out);
    out
}

pub fn stmt(ast: &TranslationUnit, s: StmtId) -> String {
    let mut out = String::new();
    write_stmt(ast, s, 0, &mut out);
    out
}

/// `file:line:col` of a location.
pub fn location(ast: &TranslationUnit, loc: &SourceLoc) -> String {
    format!("{}:{}:{}", ast.file_path(loc.file), loc.line, loc.column)
}

/// `[file:line:col]: text` used for dereference and call records.
pub fn located_expr(ast: &TranslationUnit, e: ExprId) -> String {
    format!("[{}]: {}", location(ast, &ast.expr(e).loc), expr(ast, e))
}

fn decl_name(ast: &TranslationUnit, d: DeclId) -> &str {
    &ast.decl(d).name
}

fn write_expr(ast: &TranslationUnit, e: ExprId, out: &mut String) {
    match &ast.expr(e).kind {
        ExprKind::IntLit { value } => {
            let _ = write!(out, "{value}");
        }
        ExprKind::FloatLit { value } => {
            let _ = write!(out, "{value:?}");
        }
        ExprKind::CharLit { value } => match char::from_u32(*value) {
            Some(c) if !c.is_control() => {
                let _ = write!(out, "'{c}'");
            }
            _ => {
                let _ = write!(out, "'\\x{value:x}'");
            }
        },
        ExprKind::StringLit { value } => {
            let _ = write!(out, "{value:?}");
        }
        ExprKind::DeclRef { decl } => out.push_str(decl_name(ast, *decl)),
        ExprKind::UnresolvedName { name } => out.push_str(name),
        ExprKind::Paren { sub } => {
            out.push('(');
            write_expr(ast, *sub, out);
            out.push(')');
        }
        ExprKind::Cast { sub, explicit, .. } => {
            if *explicit {
                let _ = write!(out, "({})", ast.ty(ast.expr(e).ty).spelling);
            }
            write_expr(ast, *sub, out);
        }
        ExprKind::Unary { op, sub } => {
            if op.is_postfix() {
                write_expr(ast, *sub, out);
                out.push_str(op.spelling());
            } else {
                out.push_str(op.spelling());
                write_expr(ast, *sub, out);
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            write_expr(ast, *lhs, out);
            let _ = write!(out, " {} ", op.spelling());
            write_expr(ast, *rhs, out);
        }
        ExprKind::Member { base, field, arrow } => {
            write_expr(ast, *base, out);
            out.push_str(if *arrow { "->" } else { "." });
            out.push_str(decl_name(ast, *field));
        }
        ExprKind::Subscript { base, index } => {
            write_expr(ast, *base, out);
            out.push('[');
            write_expr(ast, *index, out);
            out.push(']');
        }
        ExprKind::Call { callee, args } => {
            write_expr(ast, *callee, out);
            out.push('(');
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(ast, *a, out);
            }
            out.push(')');
        }
        ExprKind::Conditional {
            cond,
            then,
            otherwise,
        } => {
            write_expr(ast, *cond, out);
            out.push_str(" ? ");
            write_expr(ast, *then, out);
            out.push_str(" : ");
            write_expr(ast, *otherwise, out);
        }
        ExprKind::OffsetOf { record, path } => {
            let _ = write!(out, "__builtin_offsetof({}, ", ast.ty(*record).spelling);
            for (i, c) in path.iter().enumerate() {
                match c {
                    OffsetOfComponent::Field(f) => {
                        if i > 0 {
                            out.push('.');
                        }
                        out.push_str(decl_name(ast, *f));
                    }
                    OffsetOfComponent::Index(ix) => {
                        out.push('[');
                        write_expr(ast, *ix, out);
                        out.push(']');
                    }
                }
            }
            out.push(')');
        }
        ExprKind::SizeOf { arg } => {
            let _ = write!(out, "sizeof({})", ast.ty(*arg).spelling);
        }
        ExprKind::AlignOf { arg } => {
            let _ = write!(out, "_Alignof({})", ast.ty(*arg).spelling);
        }
        ExprKind::InitList { inits } => {
            out.push('{');
            for (i, a) in inits.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(ast, *a, out);
            }
            out.push('}');
        }
        ExprKind::CompoundLiteral { init } => {
            let _ = write!(out, "({})", ast.ty(ast.expr(e).ty).spelling);
            write_expr(ast, *init, out);
        }
        ExprKind::StmtExpr { body } => {
            out.push('(');
            write_stmt(ast, *body, 0, out);
            out.push(')');
        }
        ExprKind::Unsupported { what } => {
            let _ = write!(out, "<{what}>");
        }
    }
}

fn indent(level: usize, out: &mut String) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

fn write_var_decl(ast: &TranslationUnit, d: DeclId, out: &mut String) {
    let decl = ast.decl(d);
    match &decl.kind {
        DeclKind::Var(v) => {
            let _ = write!(out, "{} {}", ast.ty(v.ty).spelling, decl.name);
            if let Some(init) = v.init {
                out.push_str(" = ");
                write_expr(ast, init, out);
            }
        }
        DeclKind::Record(r) => {
            let _ = write!(out, "{}", ast.ty(r.ty).spelling);
        }
        DeclKind::Typedef { underlying, .. } => {
            let _ = write!(out, "typedef {} {}", ast.ty(*underlying).spelling, decl.name);
        }
        _ => out.push_str(&decl.name),
    }
}

fn write_stmt(ast: &TranslationUnit, s: StmtId, level: usize, out: &mut String) {
    match ast.stmt(s) {
        Stmt::Compound { body } => {
            out.push_str("{\n");
            for b in body {
                indent(level + 1, out);
                write_stmt(ast, *b, level + 1, out);
                out.push('\n');
            }
            indent(level, out);
            out.push('}');
        }
        Stmt::Decl { decls } => {
            for (i, d) in decls.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_var_decl(ast, *d, out);
                out.push(';');
            }
        }
        Stmt::Expr { expr } => {
            write_expr(ast, *expr, out);
            out.push(';');
        }
        Stmt::Return { value } => {
            out.push_str("return");
            if let Some(v) = value {
                out.push(' ');
                write_expr(ast, *v, out);
            }
            out.push(';');
        }
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            out.push_str("if (");
            write_expr(ast, *cond, out);
            out.push_str(") ");
            write_stmt(ast, *then, level, out);
            if let Some(o) = otherwise {
                out.push_str(" else ");
                write_stmt(ast, *o, level, out);
            }
        }
        Stmt::While { cond, body } => {
            out.push_str("while (");
            write_expr(ast, *cond, out);
            out.push_str(") ");
            write_stmt(ast, *body, level, out);
        }
        Stmt::Do { body, cond } => {
            out.push_str("do ");
            write_stmt(ast, *body, level, out);
            out.push_str(" while (");
            write_expr(ast, *cond, out);
            out.push_str(");");
        }
        Stmt::For {
            init,
            cond,
            inc,
            body,
        } => {
            out.push_str("for (");
            match init {
                Some(i) => write_stmt(ast, *i, level, out),
                None => out.push(';'),
            }
            if let Some(c) = cond {
                out.push(' ');
                write_expr(ast, *c, out);
            }
            out.push(';');
            if let Some(i) = inc {
                out.push(' ');
                write_expr(ast, *i, out);
            }
            out.push_str(") ");
            write_stmt(ast, *body, level, out);
        }
        Stmt::Switch { cond, body } => {
            out.push_str("switch (");
            write_expr(ast, *cond, out);
            out.push_str(") ");
            write_stmt(ast, *body, level, out);
        }
        Stmt::Case { value, body } => {
            out.push_str("case ");
            write_expr(ast, *value, out);
            out.push_str(": ");
            write_stmt(ast, *body, level, out);
        }
        Stmt::Default { body } => {
            out.push_str("default: ");
            write_stmt(ast, *body, level, out);
        }
        Stmt::Label { name, body } => {
            let _ = write!(out, "{name}: ");
            write_stmt(ast, *body, level, out);
        }
        Stmt::Goto { label } => {
            let _ = write!(out, "goto {label};");
        }
        Stmt::Break => out.push_str("break;"),
        Stmt::Continue => out.push_str("continue;"),
        Stmt::Null => out.push(';'),
        Stmt::Asm { text, .. } => {
            let _ = write!(out, "asm({text:?});");
        }
        Stmt::Unsupported { what } => {
            let _ = write!(out, "<{what}>;");
        }
    }
}

/// `name = init` rendering of a variable with an initializer.
pub fn initializer(ast: &TranslationUnit, var: DeclId) -> Option<String> {
    let init = ast.var(var)?.init?;
    Some(format!("{} = {}", ast.decl(var).name, expr(ast, init)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstBuilder, BinaryOp, TagKind};

    #[test]
    fn renders_member_and_subscript_chains() {
        let mut b = AstBuilder::new("t.c");
        let int = b.int();
        let (s, sty) = b.record(TagKind::Struct, "s");
        let arr = b.array(int, 4);
        let f = b.field(s, "v", arr);
        b.complete(s);
        let ps = b.pointer(sty);
        let g = b.global("p", ps, None);
        let p = b.var(g);
        let m = b.member(p, f, true);
        let one = b.int_lit(1);
        let two = b.int_lit(2);
        let idx = b.binary(BinaryOp::Add, one, two);
        let sub = b.subscript(m, idx);
        let tu = b.finish();
        assert_eq!(expr(&tu, sub), "p->v[1 + 2]");
    }
}
