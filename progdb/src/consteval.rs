//! Integer constant evaluation.
//!
//! Values are computed in 64-bit two's complement. Casts truncate and
//! sign- or zero-extend to the width of the target builtin, so results
//! match what the compiler would fold. Floating operands are carried as
//! `f64` until a cast brings them back to an integer, as in `(int)3.7`.

use crate::ast::{
    BinaryOp, BuiltinClass, DeclKind, ExprId, ExprKind, OffsetOfComponent, TranslationUnit, TyId,
    TypeKind, UnaryOp,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    fn truthy(self) -> bool {
        match self {
            Value::Int(v) => v != 0,
            Value::Float(f) => f != 0.0,
        }
    }

    fn as_float(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(f) => f,
        }
    }
}

/// Integer value of a constant expression.
pub fn evaluate(ast: &TranslationUnit, e: ExprId) -> Option<i64> {
    match value(ast, e)? {
        Value::Int(v) => Some(v),
        Value::Float(_) => None,
    }
}

fn value(ast: &TranslationUnit, e: ExprId) -> Option<Value> {
    let expr = ast.expr(e);
    let v = match &expr.kind {
        ExprKind::IntLit { value } => Value::Int(*value as i64),
        ExprKind::CharLit { value } => Value::Int(*value as i64),
        ExprKind::FloatLit { value } => Value::Float(*value),
        ExprKind::Paren { sub } => value(ast, *sub)?,
        ExprKind::Cast { sub, .. } => convert(ast, value(ast, *sub)?, expr.ty)?,
        ExprKind::DeclRef { decl } => match &ast.decl(*decl).kind {
            DeclKind::EnumConstant { value } => Value::Int(*value),
            _ => return None,
        },
        ExprKind::Unary { op, sub } => unary(*op, value(ast, *sub)?)?,
        ExprKind::Binary { op, lhs, rhs } => binary(ast, *op, *lhs, *rhs)?,
        ExprKind::Conditional {
            cond,
            then,
            otherwise,
        } => {
            if value(ast, *cond)?.truthy() {
                value(ast, *then)?
            } else {
                value(ast, *otherwise)?
            }
        }
        ExprKind::SizeOf { arg } => Value::Int(ast.ty(ast.resolve(*arg)).size? as i64),
        ExprKind::OffsetOf { record, path } => Value::Int(offset_of(ast, *record, path)?),
        _ => return None,
    };
    Some(v)
}

fn unary(op: UnaryOp, v: Value) -> Option<Value> {
    let r = match (op, v) {
        (UnaryOp::Plus | UnaryOp::Extension, v) => v,
        (UnaryOp::LNot, v) => Value::Int(!v.truthy() as i64),
        (UnaryOp::Minus, Value::Int(i)) => Value::Int(i.wrapping_neg()),
        (UnaryOp::Minus, Value::Float(f)) => Value::Float(-f),
        (UnaryOp::Not, Value::Int(i)) => Value::Int(!i),
        _ => return None,
    };
    Some(r)
}

fn binary(ast: &TranslationUnit, op: BinaryOp, lhs: ExprId, rhs: ExprId) -> Option<Value> {
    // Short-circuit operators only need the right side when the left does not decide.
    match op {
        BinaryOp::LAnd => {
            let v = value(ast, lhs)?.truthy() && value(ast, rhs)?.truthy();
            return Some(Value::Int(v as i64));
        }
        BinaryOp::LOr => {
            let v = value(ast, lhs)?.truthy() || value(ast, rhs)?.truthy();
            return Some(Value::Int(v as i64));
        }
        _ => {}
    }
    match (value(ast, lhs)?, value(ast, rhs)?) {
        (Value::Int(l), Value::Int(r)) => integer_binary(op, l, r).map(Value::Int),
        (l, r) => floating_binary(op, l.as_float(), r.as_float()),
    }
}

fn integer_binary(op: BinaryOp, l: i64, r: i64) -> Option<i64> {
    let v = match op {
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::Div => l.checked_div(r)?,
        BinaryOp::Rem => l.checked_rem(r)?,
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Shl => l.checked_shl(u32::try_from(r).ok()?)?,
        BinaryOp::Shr => l.checked_shr(u32::try_from(r).ok()?)?,
        BinaryOp::Cmp => l.cmp(&r) as i64,
        BinaryOp::Lt => (l < r) as i64,
        BinaryOp::Gt => (l > r) as i64,
        BinaryOp::Le => (l <= r) as i64,
        BinaryOp::Ge => (l >= r) as i64,
        BinaryOp::Eq => (l == r) as i64,
        BinaryOp::Ne => (l != r) as i64,
        BinaryOp::And => l & r,
        BinaryOp::Xor => l ^ r,
        BinaryOp::Or => l | r,
        _ => return None,
    };
    Some(v)
}

fn floating_binary(op: BinaryOp, l: f64, r: f64) -> Option<Value> {
    let v = match op {
        BinaryOp::Mul => Value::Float(l * r),
        BinaryOp::Div => Value::Float(l / r),
        BinaryOp::Add => Value::Float(l + r),
        BinaryOp::Sub => Value::Float(l - r),
        BinaryOp::Lt => Value::Int((l < r) as i64),
        BinaryOp::Gt => Value::Int((l > r) as i64),
        BinaryOp::Le => Value::Int((l <= r) as i64),
        BinaryOp::Ge => Value::Int((l >= r) as i64),
        BinaryOp::Eq => Value::Int((l == r) as i64),
        BinaryOp::Ne => Value::Int((l != r) as i64),
        _ => return None,
    };
    Some(v)
}

/// Converts `v` to the scalar type `ty`; pointers keep the full width.
fn convert(ast: &TranslationUnit, v: Value, ty: TyId) -> Option<Value> {
    let resolved = ast.resolve(ty);
    let t = ast.ty(resolved);
    match &t.kind {
        TypeKind::Builtin { class } => {
            let bits = t.size.map_or(64, |s| s * 8);
            match class {
                BuiltinClass::Bool => Some(Value::Int(v.truthy() as i64)),
                BuiltinClass::Floating if bits == 32 => Some(Value::Float(v.as_float() as f32 as f64)),
                BuiltinClass::Floating => Some(Value::Float(v.as_float())),
                BuiltinClass::Signed | BuiltinClass::Unsigned => {
                    Some(Value::Int(truncate(to_integer(v)?, bits, !class.is_unsigned())))
                }
                BuiltinClass::Void | BuiltinClass::Other => None,
            }
        }
        TypeKind::Enum { .. } => Some(Value::Int(truncate(
            to_integer(v)?,
            t.size.map_or(32, |s| s * 8),
            true,
        ))),
        TypeKind::Pointer { .. } => Some(Value::Int(to_integer(v)?)),
        _ => None,
    }
}

/// Floating values convert toward zero; NaN has no integer value.
fn to_integer(v: Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(i),
        Value::Float(f) if f.is_nan() => None,
        Value::Float(f) => Some(f.trunc() as i64),
    }
}

/// Keeps the low `bits` bits of `v`, then extends back to 64 bits.
pub fn truncate(v: i64, bits: u64, signed: bool) -> i64 {
    if bits == 0 || bits >= 64 {
        return v;
    }
    let mask = (1u64 << bits) - 1;
    let low = (v as u64) & mask;
    if signed && low & (1u64 << (bits - 1)) != 0 {
        (low | !mask) as i64
    } else {
        low as i64
    }
}

/// Byte offset described by an `offsetof` path, when every index is constant.
pub fn offset_of(ast: &TranslationUnit, record: TyId, path: &[OffsetOfComponent]) -> Option<i64> {
    let mut cur = record;
    let mut offset: i64 = 0;
    for comp in path {
        match comp {
            OffsetOfComponent::Field(f) => {
                let DeclKind::Field(field) = &ast.decl(*f).kind else {
                    return None;
                };
                offset = offset.wrapping_add((field.offset_bits / 8) as i64);
                cur = field.ty;
            }
            OffsetOfComponent::Index(i) => {
                let idx = evaluate(ast, *i)?;
                let elem = ast.pointee(cur)?;
                let size = ast.ty(ast.resolve(elem)).size? as i64;
                offset = offset.wrapping_add(idx.wrapping_mul(size));
                cur = elem;
            }
        }
    }
    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstBuilder;

    #[test]
    fn folds_arithmetic_with_wrapping() {
        let mut b = AstBuilder::new("t.c");
        let three = b.int_lit(3);
        let four = b.int_lit(4);
        let one = b.int_lit(1);
        let mul = b.binary(BinaryOp::Mul, three, four);
        let add = b.binary(BinaryOp::Add, mul, one);
        let neg = b.unary(UnaryOp::Minus, add);
        let tu = b.finish();
        assert_eq!(evaluate(&tu, add), Some(13));
        assert_eq!(evaluate(&tu, neg), Some(-13));
    }

    #[test]
    fn division_by_zero_is_not_constant() {
        let mut b = AstBuilder::new("t.c");
        let one = b.int_lit(1);
        let zero = b.int_lit(0);
        let div = b.binary(BinaryOp::Div, one, zero);
        let tu = b.finish();
        assert_eq!(evaluate(&tu, div), None);
    }

    #[test]
    fn casts_truncate_and_extend() {
        assert_eq!(truncate(300, 8, true), 44);
        assert_eq!(truncate(-1, 32, false), 0xffff_ffff);
        assert_eq!(truncate(0xff, 8, true), -1);

        let mut b = AstBuilder::new("t.c");
        let uchar = b.builtin("unsigned char", 1);
        let big = b.int_lit(0x1ff);
        let cast = b.cast(big, uchar);
        let tu = b.finish();
        assert_eq!(evaluate(&tu, cast), Some(0xff));
    }

    #[test]
    fn float_casts_truncate_toward_zero() {
        let mut b = AstBuilder::new("t.c");
        let int = b.int();
        let uchar = b.builtin("unsigned char", 1);
        let pos = b.float_lit(3.7);
        let neg_lit = b.float_lit(3.7);
        let neg = b.unary(UnaryOp::Minus, neg_lit);
        let wide = b.float_lit(300.5);
        let (to_int, to_neg, to_uchar) = (b.cast(pos, int), b.cast(neg, int), b.cast(wide, uchar));
        let half = b.float_lit(2.5);
        let two = b.int_lit(2);
        let product = b.binary(BinaryOp::Mul, half, two);
        let folded = b.cast(product, int);
        let tu = b.finish();

        assert_eq!(evaluate(&tu, to_int), Some(3));
        assert_eq!(evaluate(&tu, to_neg), Some(-3));
        assert_eq!(evaluate(&tu, to_uchar), Some(44));
        assert_eq!(evaluate(&tu, folded), Some(5), "(int)(2.5 * 2)");
        assert_eq!(evaluate(&tu, pos), None, "a bare float is not an integer constant");
    }

    #[test]
    fn float_comparison_is_integer() {
        let mut b = AstBuilder::new("t.c");
        let l = b.float_lit(1.5);
        let r = b.int_lit(1);
        let gt = b.binary(BinaryOp::Gt, l, r);
        let tu = b.finish();
        assert_eq!(evaluate(&tu, gt), Some(1));
    }

    #[test]
    fn signedness_comes_from_the_builtin_class() {
        let mut b = AstBuilder::new("t.c");
        let u8_signed = b.builtin_of("u8", 1, BuiltinClass::Signed);
        let byte = b.builtin_of("byte", 1, BuiltinClass::Unsigned);
        let v = b.int_lit(0xff);
        let (as_u8, as_byte) = (b.cast(v, u8_signed), b.cast(v, byte));
        let tu = b.finish();
        assert_eq!(evaluate(&tu, as_u8), Some(-1), "the name does not make it unsigned");
        assert_eq!(evaluate(&tu, as_byte), Some(0xff));
        assert_eq!(BuiltinClass::of_spelling("unsigned long"), BuiltinClass::Unsigned);
        assert_eq!(BuiltinClass::of_spelling("uint_fast8"), BuiltinClass::Signed);
    }

    #[test]
    fn variables_are_not_constant() {
        let mut b = AstBuilder::new("t.c");
        let int = b.int();
        let g = b.global("n", int, None);
        let r = b.var(g);
        let tu = b.finish();
        assert_eq!(evaluate(&tu, r), None);
    }
}
