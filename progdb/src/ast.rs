//! Resolved translation-unit model.
//!
//! This is the clang-independent input of the database builder. Every node
//! lives in a per-unit arena and is addressed by a typed index, so node
//! identity is index identity. The front end lowers libclang cursors into
//! this model; tests build it directly through [`AstBuilder`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::DbError;

macro_rules! node_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

node_id!(
    /// Index of a [`Type`] node.
    TyId
);
node_id!(
    /// Index of a [`Decl`] node.
    DeclId
);
node_id!(
    /// Index of an [`Expr`] node.
    ExprId
);
node_id!(
    /// Index of a [`Stmt`] node.
    StmtId
);
node_id!(
    /// Index into [`TranslationUnit::files`].
    FileId
);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub file: FileId,
    pub line: u32,
    pub column: u32,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Qualifiers {
    #[serde(default)]
    pub is_const: bool,
    #[serde(default)]
    pub is_volatile: bool,
    #[serde(default)]
    pub is_restrict: bool,
}

impl Qualifiers {
    pub const NONE: Qualifiers = Qualifiers {
        is_const: false,
        is_volatile: false,
        is_restrict: false,
    };

    pub const CONST: Qualifiers = Qualifiers {
        is_const: true,
        is_volatile: false,
        is_restrict: false,
    };

    pub fn union(self, other: Qualifiers) -> Qualifiers {
        Qualifiers {
            is_const: self.is_const || other.is_const,
            is_volatile: self.is_volatile || other.is_volatile,
            is_restrict: self.is_restrict || other.is_restrict,
        }
    }

    pub fn is_empty(self) -> bool {
        self == Qualifiers::NONE
    }

    /// Compact spelling used in the output tables: `c`, `v`, `r` in that order.
    pub fn code(self) -> String {
        let mut s = String::new();
        if self.is_const {
            s.push('c');
        }
        if self.is_volatile {
            s.push('v');
        }
        if self.is_restrict {
            s.push('r');
        }
        s
    }

    fn prefix(self) -> String {
        let mut s = String::new();
        if self.is_const {
            s.push_str("const ");
        }
        if self.is_volatile {
            s.push_str("volatile ");
        }
        if self.is_restrict {
            s.push_str("restrict ");
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Type {
    pub kind: TypeKind,
    #[serde(default)]
    pub quals: Qualifiers,
    /// Size in bytes; `None` for incomplete and function types.
    pub size: Option<u64>,
    pub spelling: String,
}

/// Arithmetic class of a builtin type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinClass {
    #[default]
    Signed,
    Unsigned,
    Bool,
    Floating,
    Void,
    /// `nullptr_t` and other non-arithmetic builtins.
    Other,
}

impl BuiltinClass {
    /// Class of a standard C or C++ builtin spelling; anything else is signed.
    pub fn of_spelling(name: &str) -> BuiltinClass {
        match name {
            "void" => BuiltinClass::Void,
            "_Bool" | "bool" => BuiltinClass::Bool,
            "float" | "double" | "long double" | "_Float16" | "__fp16" | "__float128" => {
                BuiltinClass::Floating
            }
            "unsigned char" | "unsigned short" | "unsigned int" | "unsigned" | "unsigned long"
            | "unsigned long long" | "unsigned __int128" | "char8_t" | "char16_t" | "char32_t" => {
                BuiltinClass::Unsigned
            }
            "nullptr_t" | "std::nullptr_t" => BuiltinClass::Other,
            _ => BuiltinClass::Signed,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, BuiltinClass::Unsigned | BuiltinClass::Bool)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            BuiltinClass::Signed | BuiltinClass::Unsigned | BuiltinClass::Bool
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeKind {
    Builtin {
        #[serde(default)]
        class: BuiltinClass,
    },
    Pointer {
        pointee: TyId,
    },
    LValueReference {
        pointee: TyId,
    },
    RValueReference {
        pointee: TyId,
    },
    ConstantArray {
        element: TyId,
        len: u64,
    },
    IncompleteArray {
        element: TyId,
    },
    VariableArray {
        element: TyId,
        size: Option<ExprId>,
    },
    Record {
        decl: DeclId,
    },
    Enum {
        decl: DeclId,
    },
    Typedef {
        decl: DeclId,
    },
    Function {
        ret: TyId,
        params: Vec<TyId>,
        variadic: bool,
    },
    TemplateSpecialization {
        template: String,
        args: Vec<TemplateArg>,
        aliased: Option<TyId>,
    },
    Vector {
        element: TyId,
        count: u64,
    },
    MemberPointer {
        pointee: TyId,
        class: TyId,
    },
    /// Parens, elaborated and attributed types. Transparent, but the node's
    /// qualifiers still apply to the inner type.
    Sugar {
        inner: TyId,
    },
    Unsupported {
        what: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TemplateArg {
    Type(TyId),
    Integral(i64),
    Expression(String),
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decl {
    pub name: String,
    #[serde(default)]
    pub loc: SourceLoc,
    /// Enclosing function for locals and local types, owning record for members.
    #[serde(default)]
    pub parent: Option<DeclId>,
    /// Compiler-generated (builtins, implicit declarations).
    #[serde(default)]
    pub implicit: bool,
    pub kind: DeclKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    #[default]
    External,
    Internal,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Global,
    Local,
    StaticLocal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    #[default]
    Struct,
    Union,
    Class,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeclKind {
    Function(FunctionDecl),
    Var(VarDecl),
    Param(ParamDecl),
    Field(FieldDecl),
    Record(RecordDecl),
    Enum(EnumDecl),
    EnumConstant { value: i64 },
    Typedef { underlying: TyId, ty: TyId },
    FunctionTemplate { pattern: DeclId },
    Unsupported { what: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    /// Always a [`TypeKind::Function`] node, possibly behind sugar.
    pub ty: TyId,
    pub params: Vec<DeclId>,
    pub body: Option<StmtId>,
    /// First declaration of this function; `None` when this is it.
    #[serde(default)]
    pub canonical: Option<DeclId>,
    #[serde(default)]
    pub linkage: Linkage,
    #[serde(default)]
    pub is_inline: bool,
    #[serde(default)]
    pub method_of: Option<TyId>,
    /// Set on instantiations and on the pattern itself.
    #[serde(default)]
    pub template: Option<DeclId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub ty: TyId,
    pub init: Option<ExprId>,
    #[serde(default)]
    pub linkage: Linkage,
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default)]
    pub canonical: Option<DeclId>,
    #[serde(default = "default_true")]
    pub is_definition: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub ty: TyId,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub ty: TyId,
    pub offset_bits: u64,
    #[serde(default)]
    pub bit_width: Option<u32>,
    /// C++ default member initializer.
    #[serde(default)]
    pub init: Option<ExprId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDecl {
    pub tag: TagKind,
    pub ty: TyId,
    /// Fields and nested tag declarations in declaration order.
    pub members: Vec<DeclId>,
    pub complete: bool,
    /// The complete redeclaration when this one is a forward declaration.
    #[serde(default)]
    pub definition: Option<DeclId>,
    /// Name given through `typedef struct { ... } name;`.
    #[serde(default)]
    pub typedef_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDecl {
    pub ty: TyId,
    pub underlying: TyId,
    pub constants: Vec<DeclId>,
    pub complete: bool,
}

// ---------------------------------------------------------------------------
// Statements and expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stmt {
    Compound {
        body: Vec<StmtId>,
    },
    Decl {
        decls: Vec<DeclId>,
    },
    Expr {
        expr: ExprId,
    },
    Return {
        value: Option<ExprId>,
    },
    If {
        cond: ExprId,
        then: StmtId,
        otherwise: Option<StmtId>,
    },
    While {
        cond: ExprId,
        body: StmtId,
    },
    Do {
        body: StmtId,
        cond: ExprId,
    },
    For {
        init: Option<StmtId>,
        cond: Option<ExprId>,
        inc: Option<ExprId>,
        body: StmtId,
    },
    Switch {
        cond: ExprId,
        body: StmtId,
    },
    Case {
        value: ExprId,
        body: StmtId,
    },
    Default {
        body: StmtId,
    },
    Label {
        name: String,
        body: StmtId,
    },
    Goto {
        label: String,
    },
    Break,
    Continue,
    Null,
    Asm {
        text: String,
        operands: Vec<ExprId>,
    },
    Unsupported {
        what: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: TyId,
    #[serde(default)]
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastKind {
    NoOp,
    LValueToRValue,
    ArrayToPointerDecay,
    FunctionToPointerDecay,
    IntegralCast,
    IntegralToPointer,
    PointerToIntegral,
    BitCast,
    FloatingCast,
    IntegralToFloating,
    FloatingToIntegral,
    ToVoid,
    Other,
}

impl CastKind {
    /// Whether the conversion produces a value of a different representation.
    pub fn changes_value(self) -> bool {
        !matches!(
            self,
            CastKind::NoOp
                | CastKind::LValueToRValue
                | CastKind::ArrayToPointerDecay
                | CastKind::FunctionToPointerDecay
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Deref,
    AddrOf,
    Plus,
    Minus,
    Not,
    LNot,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    Real,
    Imag,
    Extension,
}

impl UnaryOp {
    pub fn spelling(self) -> &'static str {
        match self {
            UnaryOp::Deref => "*",
            UnaryOp::AddrOf => "&",
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
            UnaryOp::Not => "~",
            UnaryOp::LNot => "!",
            UnaryOp::PreInc | UnaryOp::PostInc => "++",
            UnaryOp::PreDec | UnaryOp::PostDec => "--",
            UnaryOp::Real => "__real ",
            UnaryOp::Imag => "__imag ",
            UnaryOp::Extension => "__extension__ ",
        }
    }

    pub fn is_postfix(self) -> bool {
        matches!(self, UnaryOp::PostInc | UnaryOp::PostDec)
    }
}

/// Binary operators, numbered the way clang numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    PtrMemD = 0,
    PtrMemI = 1,
    Mul = 2,
    Div = 3,
    Rem = 4,
    Add = 5,
    Sub = 6,
    Shl = 7,
    Shr = 8,
    Cmp = 9,
    Lt = 10,
    Gt = 11,
    Le = 12,
    Ge = 13,
    Eq = 14,
    Ne = 15,
    And = 16,
    Xor = 17,
    Or = 18,
    LAnd = 19,
    LOr = 20,
    Assign = 21,
    MulAssign = 22,
    DivAssign = 23,
    RemAssign = 24,
    AddAssign = 25,
    SubAssign = 26,
    ShlAssign = 27,
    ShrAssign = 28,
    AndAssign = 29,
    XorAssign = 30,
    OrAssign = 31,
    Comma = 32,
}

impl BinaryOp {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn is_assignment(self) -> bool {
        (BinaryOp::Assign.code()..=BinaryOp::OrAssign.code()).contains(&self.code())
    }

    /// Comparisons, bitwise and logical connectives.
    pub fn is_logic(self) -> bool {
        (BinaryOp::Cmp.code()..=BinaryOp::LOr.code()).contains(&self.code())
    }

    pub fn is_comparison(self) -> bool {
        (BinaryOp::Cmp.code()..=BinaryOp::Ne.code()).contains(&self.code())
            || matches!(self, BinaryOp::LAnd | BinaryOp::LOr)
    }

    pub fn spelling(self) -> &'static str {
        match self {
            BinaryOp::PtrMemD => ".*",
            BinaryOp::PtrMemI => "->*",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Cmp => "<=>",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&",
            BinaryOp::Xor => "^",
            BinaryOp::Or => "|",
            BinaryOp::LAnd => "&&",
            BinaryOp::LOr => "||",
            BinaryOp::Assign => "=",
            BinaryOp::MulAssign => "*=",
            BinaryOp::DivAssign => "/=",
            BinaryOp::RemAssign => "%=",
            BinaryOp::AddAssign => "+=",
            BinaryOp::SubAssign => "-=",
            BinaryOp::ShlAssign => "<<=",
            BinaryOp::ShrAssign => ">>=",
            BinaryOp::AndAssign => "&=",
            BinaryOp::XorAssign => "^=",
            BinaryOp::OrAssign => "|=",
            BinaryOp::Comma => ",",
        }
    }

    pub fn from_spelling(s: &str) -> Option<BinaryOp> {
        const ALL: [BinaryOp; 33] = [
            BinaryOp::PtrMemD,
            BinaryOp::PtrMemI,
            BinaryOp::Mul,
            BinaryOp::Div,
            BinaryOp::Rem,
            BinaryOp::Add,
            BinaryOp::Sub,
            BinaryOp::Shl,
            BinaryOp::Shr,
            BinaryOp::Cmp,
            BinaryOp::Lt,
            BinaryOp::Gt,
            BinaryOp::Le,
            BinaryOp::Ge,
            BinaryOp::Eq,
            BinaryOp::Ne,
            BinaryOp::And,
            BinaryOp::Xor,
            BinaryOp::Or,
            BinaryOp::LAnd,
            BinaryOp::LOr,
            BinaryOp::Assign,
            BinaryOp::MulAssign,
            BinaryOp::DivAssign,
            BinaryOp::RemAssign,
            BinaryOp::AddAssign,
            BinaryOp::SubAssign,
            BinaryOp::ShlAssign,
            BinaryOp::ShrAssign,
            BinaryOp::AndAssign,
            BinaryOp::XorAssign,
            BinaryOp::OrAssign,
            BinaryOp::Comma,
        ];
        ALL.into_iter().find(|op| op.spelling() == s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OffsetOfComponent {
    Field(DeclId),
    Index(ExprId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExprKind {
    IntLit {
        value: u64,
    },
    FloatLit {
        value: f64,
    },
    CharLit {
        value: u32,
    },
    StringLit {
        value: String,
    },
    DeclRef {
        decl: DeclId,
    },
    /// Callee or operand the front end could not bind to a declaration.
    UnresolvedName {
        name: String,
    },
    Paren {
        sub: ExprId,
    },
    Cast {
        sub: ExprId,
        cast: CastKind,
        explicit: bool,
    },
    Unary {
        op: UnaryOp,
        sub: ExprId,
    },
    Binary {
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Member {
        base: ExprId,
        field: DeclId,
        arrow: bool,
    },
    Subscript {
        base: ExprId,
        index: ExprId,
    },
    Call {
        callee: ExprId,
        args: Vec<ExprId>,
    },
    Conditional {
        cond: ExprId,
        then: ExprId,
        otherwise: ExprId,
    },
    OffsetOf {
        record: TyId,
        path: Vec<OffsetOfComponent>,
    },
    SizeOf {
        arg: TyId,
    },
    AlignOf {
        arg: TyId,
    },
    InitList {
        inits: Vec<ExprId>,
    },
    CompoundLiteral {
        init: ExprId,
    },
    StmtExpr {
        body: StmtId,
    },
    Unsupported {
        what: String,
    },
}

// ---------------------------------------------------------------------------
// Translation unit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslationUnit {
    pub main_file: FileId,
    pub files: Vec<String>,
    pub types: Vec<Type>,
    pub decls: Vec<Decl>,
    pub exprs: Vec<Expr>,
    pub stmts: Vec<Stmt>,
    /// File-scope declarations in source order.
    pub top_level: Vec<DeclId>,
}

impl TranslationUnit {
    pub fn ty(&self, id: TyId) -> &Type {
        &self.types[id.index()]
    }

    pub fn decl(&self, id: DeclId) -> &Decl {
        &self.decls[id.index()]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.index()]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.index()]
    }

    pub fn file_path(&self, id: FileId) -> &str {
        self.files.get(id.index()).map(String::as_str).unwrap_or("")
    }

    pub fn main_path(&self) -> &str {
        self.file_path(self.main_file)
    }

    /// Strips sugar nodes, collecting the qualifiers found on the way.
    pub fn desugar(&self, mut ty: TyId) -> (TyId, Qualifiers) {
        let mut quals = Qualifiers::NONE;
        loop {
            let t = self.ty(ty);
            quals = quals.union(t.quals);
            match &t.kind {
                TypeKind::Sugar { inner } => ty = *inner,
                _ => return (ty, quals),
            }
        }
    }

    /// Strips sugar and typedefs.
    pub fn resolve(&self, ty: TyId) -> TyId {
        let mut cur = self.desugar(ty).0;
        loop {
            match &self.ty(cur).kind {
                TypeKind::Typedef { decl } => match &self.decl(*decl).kind {
                    DeclKind::Typedef { underlying, .. } => cur = self.desugar(*underlying).0,
                    _ => return cur,
                },
                _ => return cur,
            }
        }
    }

    /// Pointee or element type of a pointer, reference or array type.
    pub fn pointee(&self, ty: TyId) -> Option<TyId> {
        match &self.ty(self.resolve(ty)).kind {
            TypeKind::Pointer { pointee }
            | TypeKind::LValueReference { pointee }
            | TypeKind::RValueReference { pointee } => Some(*pointee),
            TypeKind::ConstantArray { element, .. }
            | TypeKind::IncompleteArray { element }
            | TypeKind::VariableArray { element, .. }
            | TypeKind::Vector { element, .. } => Some(*element),
            _ => None,
        }
    }

    pub fn is_pointer_like(&self, ty: TyId) -> bool {
        matches!(
            self.ty(self.resolve(ty)).kind,
            TypeKind::Pointer { .. }
                | TypeKind::ConstantArray { .. }
                | TypeKind::IncompleteArray { .. }
                | TypeKind::VariableArray { .. }
        )
    }

    /// Record declaration behind `ty`, looking through sugar and typedefs.
    pub fn record_of(&self, ty: TyId) -> Option<DeclId> {
        match &self.ty(self.resolve(ty)).kind {
            TypeKind::Record { decl } => Some(*decl),
            _ => None,
        }
    }

    pub fn record(&self, decl: DeclId) -> Option<&RecordDecl> {
        match &self.decl(decl).kind {
            DeclKind::Record(r) => Some(r),
            _ => None,
        }
    }

    /// The complete definition of a record, if this unit has one.
    pub fn record_definition(&self, decl: DeclId) -> Option<(DeclId, &RecordDecl)> {
        let r = self.record(decl)?;
        if r.complete {
            return Some((decl, r));
        }
        let def = r.definition?;
        self.record(def).filter(|d| d.complete).map(|d| (def, d))
    }

    /// A record without identifier and without typedef name.
    pub fn is_anonymous_record(&self, decl: DeclId) -> bool {
        self.decl(decl).name.is_empty()
            && self.record(decl).is_some_and(|r| r.typedef_name.is_none())
    }

    /// The anonymous record an unnamed field stands for.
    pub fn anonymous_member(&self, field: DeclId) -> Option<DeclId> {
        let d = self.decl(field);
        let DeclKind::Field(f) = &d.kind else {
            return None;
        };
        if !d.name.is_empty() {
            return None;
        }
        let rec = match &self.ty(self.desugar(f.ty).0).kind {
            TypeKind::Record { decl } => *decl,
            _ => return None,
        };
        self.is_anonymous_record(rec).then_some(rec)
    }

    pub fn function(&self, decl: DeclId) -> Option<&FunctionDecl> {
        match &self.decl(decl).kind {
            DeclKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn var(&self, decl: DeclId) -> Option<&VarDecl> {
        match &self.decl(decl).kind {
            DeclKind::Var(v) => Some(v),
            _ => None,
        }
    }

    /// First declaration of a function or variable.
    pub fn canonical(&self, decl: DeclId) -> DeclId {
        match &self.decl(decl).kind {
            DeclKind::Function(f) => f.canonical.unwrap_or(decl),
            DeclKind::Var(v) => v.canonical.unwrap_or(decl),
            _ => decl,
        }
    }

    /// Declared type of a value declaration.
    pub fn decl_type(&self, decl: DeclId) -> Option<TyId> {
        match &self.decl(decl).kind {
            DeclKind::Function(f) => Some(f.ty),
            DeclKind::Var(v) => Some(v.ty),
            DeclKind::Param(p) => Some(p.ty),
            DeclKind::Field(f) => Some(f.ty),
            DeclKind::Record(r) => Some(r.ty),
            DeclKind::Enum(e) => Some(e.ty),
            DeclKind::Typedef { ty, .. } => Some(*ty),
            _ => None,
        }
    }

    /// Return and parameter types of a function type.
    pub fn signature(&self, fn_ty: TyId) -> Option<(TyId, &[TyId], bool)> {
        match &self.ty(self.resolve(fn_ty)).kind {
            TypeKind::Function {
                ret,
                params,
                variadic,
            } => Some((*ret, params.as_slice(), *variadic)),
            TypeKind::Pointer { pointee } => self.signature(*pointee),
            _ => None,
        }
    }

    /// Locals live inside a function and have automatic storage.
    pub fn is_local_var(&self, decl: DeclId) -> bool {
        match &self.decl(decl).kind {
            DeclKind::Var(v) => v.storage == StorageKind::Local,
            DeclKind::Param(_) => true,
            _ => false,
        }
    }

    /// Variables with static storage duration.
    pub fn is_global_var(&self, decl: DeclId) -> bool {
        matches!(&self.decl(decl).kind, DeclKind::Var(v) if v.storage != StorageKind::Local)
    }

    /// Direct sub-expressions, in evaluation order.
    pub fn expr_children(&self, e: ExprId) -> Vec<ExprId> {
        match &self.expr(e).kind {
            ExprKind::Paren { sub } | ExprKind::Cast { sub, .. } | ExprKind::Unary { sub, .. } => {
                vec![*sub]
            }
            ExprKind::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            ExprKind::Member { base, .. } => vec![*base],
            ExprKind::Subscript { base, index } => vec![*base, *index],
            ExprKind::Call { callee, args } => {
                let mut v = Vec::with_capacity(args.len() + 1);
                v.push(*callee);
                v.extend(args.iter().copied());
                v
            }
            ExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => vec![*cond, *then, *otherwise],
            ExprKind::OffsetOf { path, .. } => path
                .iter()
                .filter_map(|c| match c {
                    OffsetOfComponent::Index(e) => Some(*e),
                    OffsetOfComponent::Field(_) => None,
                })
                .collect(),
            ExprKind::InitList { inits } => inits.clone(),
            ExprKind::CompoundLiteral { init } => vec![*init],
            _ => Vec::new(),
        }
    }

    /// Direct sub-statements and expressions of a statement.
    pub fn stmt_children(&self, s: StmtId) -> (Vec<StmtId>, Vec<ExprId>) {
        match self.stmt(s) {
            Stmt::Compound { body } => (body.clone(), Vec::new()),
            Stmt::Decl { decls } => (
                Vec::new(),
                decls
                    .iter()
                    .filter_map(|d| self.var(*d).and_then(|v| v.init))
                    .collect(),
            ),
            Stmt::Expr { expr } => (Vec::new(), vec![*expr]),
            Stmt::Return { value } => (Vec::new(), value.iter().copied().collect()),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let mut stmts = vec![*then];
                stmts.extend(otherwise.iter().copied());
                (stmts, vec![*cond])
            }
            Stmt::While { cond, body } | Stmt::Do { body, cond } | Stmt::Switch { cond, body } => {
                (vec![*body], vec![*cond])
            }
            Stmt::For {
                init,
                cond,
                inc,
                body,
            } => {
                let mut stmts: Vec<StmtId> = init.iter().copied().collect();
                stmts.push(*body);
                (stmts, cond.iter().chain(inc.iter()).copied().collect())
            }
            Stmt::Case { value, body } => (vec![*body], vec![*value]),
            Stmt::Default { body } | Stmt::Label { body, .. } => (vec![*body], Vec::new()),
            Stmt::Asm { operands, .. } => (Vec::new(), operands.clone()),
            Stmt::Goto { .. }
            | Stmt::Break
            | Stmt::Continue
            | Stmt::Null
            | Stmt::Unsupported { .. } => (Vec::new(), Vec::new()),
        }
    }

    /// Qualified name of a declaration (`Class::method` for methods).
    pub fn qualified_name(&self, decl: DeclId) -> String {
        let d = self.decl(decl);
        if let DeclKind::Function(f) = &d.kind
            && let Some(class) = f.method_of
            && let Some(rec) = self.record_of(class)
        {
            return format!("{}::{}", self.decl(rec).name, d.name);
        }
        d.name.clone()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl TranslationUnit {
    /// Checks that every index names an existing node of the right kind and
    /// that no chain the passes follow can loop: sugar and typedef chains,
    /// expression and statement nesting, and declaration parents.
    ///
    /// Units built by [`AstBuilder`] or the libclang front end always pass.
    /// Units read from JSON must be checked before any pass indexes them.
    pub fn validate(&self) -> Result<(), DbError> {
        for &d in &self.top_level {
            Refs::new(self, "top level".to_string()).decl(d)?;
        }
        for (i, t) in self.types.iter().enumerate() {
            self.validate_type(i, t)?;
        }
        for (i, d) in self.decls.iter().enumerate() {
            self.validate_decl(i, d)?;
        }
        for (i, e) in self.exprs.iter().enumerate() {
            self.validate_expr(i, e)?;
        }
        for (i, s) in self.stmts.iter().enumerate() {
            self.validate_stmt(i, s)?;
        }

        if let Some(t) = find_cycle(self.types.len(), |i| self.type_edges(TyId(i as u32))) {
            return Err(DbError::MalformedUnit(format!(
                "type {t} `{}` is part of a sugar or typedef cycle",
                self.types[t].spelling
            )));
        }
        let exprs = self.exprs.len();
        if let Some(n) = find_cycle(exprs + self.stmts.len(), |i| self.code_edges(i, exprs)) {
            let what = if n < exprs {
                format!("expression {n}")
            } else {
                format!("statement {}", n - exprs)
            };
            return Err(DbError::MalformedUnit(format!("{what} contains itself")));
        }
        if let Some(d) = find_cycle(self.decls.len(), |i| {
            self.decls[i].parent.iter().map(|p| p.index()).collect()
        }) {
            return Err(DbError::MalformedUnit(format!(
                "declaration {d} `{}` is its own parent",
                self.decls[d].name
            )));
        }
        Ok(())
    }

    fn validate_type(&self, i: usize, t: &Type) -> Result<(), DbError> {
        let r = Refs::new(self, format!("type {i} `{}`", t.spelling));
        match &t.kind {
            TypeKind::Builtin { .. } | TypeKind::Unsupported { .. } => {}
            TypeKind::Pointer { pointee }
            | TypeKind::LValueReference { pointee }
            | TypeKind::RValueReference { pointee } => r.ty(*pointee)?,
            TypeKind::ConstantArray { element, .. }
            | TypeKind::IncompleteArray { element }
            | TypeKind::Vector { element, .. } => r.ty(*element)?,
            TypeKind::VariableArray { element, size } => {
                r.ty(*element)?;
                if let Some(size) = size {
                    r.expr(*size)?;
                }
            }
            TypeKind::Record { decl } => {
                r.nominal(*decl, "record", |k| matches!(k, DeclKind::Record(_)))?
            }
            TypeKind::Enum { decl } => r.nominal(*decl, "enum", |k| matches!(k, DeclKind::Enum(_)))?,
            TypeKind::Typedef { decl } => {
                r.nominal(*decl, "typedef", |k| matches!(k, DeclKind::Typedef { .. }))?
            }
            TypeKind::Function { ret, params, .. } => {
                r.ty(*ret)?;
                for p in params {
                    r.ty(*p)?;
                }
            }
            TypeKind::TemplateSpecialization { args, aliased, .. } => {
                for a in args {
                    if let TemplateArg::Type(t) = a {
                        r.ty(*t)?;
                    }
                }
                if let Some(a) = aliased {
                    r.ty(*a)?;
                }
            }
            TypeKind::MemberPointer { pointee, class } => {
                r.ty(*pointee)?;
                r.ty(*class)?;
            }
            TypeKind::Sugar { inner } => r.ty(*inner)?,
        }
        Ok(())
    }

    fn validate_decl(&self, i: usize, d: &Decl) -> Result<(), DbError> {
        let r = Refs::new(self, format!("declaration {i} `{}`", d.name));
        if let Some(p) = d.parent {
            r.decl(p)?;
        }
        match &d.kind {
            DeclKind::Function(f) => {
                r.ty(f.ty)?;
                r.decls(&f.params)?;
                r.opt_stmt(f.body)?;
                r.opt_decl(f.canonical)?;
                r.opt_decl(f.template)?;
                if let Some(m) = f.method_of {
                    r.ty(m)?;
                }
            }
            DeclKind::Var(v) => {
                r.ty(v.ty)?;
                r.opt_expr(v.init)?;
                r.opt_decl(v.canonical)?;
            }
            DeclKind::Param(p) => r.ty(p.ty)?,
            DeclKind::Field(f) => {
                r.ty(f.ty)?;
                r.opt_expr(f.init)?;
            }
            DeclKind::Record(rd) => {
                r.ty(rd.ty)?;
                r.decls(&rd.members)?;
                r.opt_decl(rd.definition)?;
            }
            DeclKind::Enum(e) => {
                r.ty(e.ty)?;
                r.ty(e.underlying)?;
                r.decls(&e.constants)?;
            }
            DeclKind::Typedef { underlying, ty } => {
                r.ty(*underlying)?;
                r.ty(*ty)?;
            }
            DeclKind::FunctionTemplate { pattern } => r.decl(*pattern)?,
            DeclKind::EnumConstant { .. } | DeclKind::Unsupported { .. } => {}
        }
        Ok(())
    }

    fn validate_expr(&self, i: usize, e: &Expr) -> Result<(), DbError> {
        let r = Refs::new(self, format!("expression {i}"));
        r.ty(e.ty)?;
        match &e.kind {
            ExprKind::DeclRef { decl } => r.decl(*decl)?,
            ExprKind::Member { field, .. } => r.decl(*field)?,
            ExprKind::OffsetOf { record, path } => {
                r.ty(*record)?;
                for c in path {
                    if let OffsetOfComponent::Field(f) = c {
                        r.decl(*f)?;
                    }
                }
            }
            ExprKind::SizeOf { arg } | ExprKind::AlignOf { arg } => r.ty(*arg)?,
            ExprKind::StmtExpr { body } => r.stmt(*body)?,
            _ => {}
        }
        for c in self.expr_children(ExprId(i as u32)) {
            r.expr(c)?;
        }
        Ok(())
    }

    fn validate_stmt(&self, i: usize, s: &Stmt) -> Result<(), DbError> {
        let r = Refs::new(self, format!("statement {i}"));
        // Declaration statements are followed into their initializers below.
        if let Stmt::Decl { decls } = s {
            r.decls(decls)?;
        }
        let (stmts, exprs) = self.stmt_children(StmtId(i as u32));
        for c in stmts {
            r.stmt(c)?;
        }
        for c in exprs {
            r.expr(c)?;
        }
        Ok(())
    }

    /// Type edges that can close a cycle. Records and enums are nominal and
    /// end the walk.
    fn type_edges(&self, ty: TyId) -> Vec<usize> {
        let edges: Vec<TyId> = match &self.ty(ty).kind {
            TypeKind::Pointer { pointee }
            | TypeKind::LValueReference { pointee }
            | TypeKind::RValueReference { pointee } => vec![*pointee],
            TypeKind::ConstantArray { element, .. }
            | TypeKind::IncompleteArray { element }
            | TypeKind::VariableArray { element, .. }
            | TypeKind::Vector { element, .. } => vec![*element],
            TypeKind::Function { ret, params, .. } => {
                std::iter::once(*ret).chain(params.iter().copied()).collect()
            }
            TypeKind::TemplateSpecialization { args, aliased, .. } => args
                .iter()
                .filter_map(|a| match a {
                    TemplateArg::Type(t) => Some(*t),
                    _ => None,
                })
                .chain(aliased.iter().copied())
                .collect(),
            TypeKind::MemberPointer { pointee, class } => vec![*pointee, *class],
            TypeKind::Sugar { inner } => vec![*inner],
            TypeKind::Typedef { decl } => match &self.decl(*decl).kind {
                DeclKind::Typedef { underlying, .. } => vec![*underlying],
                _ => Vec::new(),
            },
            TypeKind::Builtin { .. }
            | TypeKind::Record { .. }
            | TypeKind::Enum { .. }
            | TypeKind::Unsupported { .. } => Vec::new(),
        };
        edges.into_iter().map(TyId::index).collect()
    }

    /// Expressions are nodes `0..exprs`, statements follow.
    fn code_edges(&self, node: usize, exprs: usize) -> Vec<usize> {
        if node < exprs {
            let e = ExprId(node as u32);
            let mut edges: Vec<usize> =
                self.expr_children(e).into_iter().map(ExprId::index).collect();
            if let ExprKind::StmtExpr { body } = &self.expr(e).kind {
                edges.push(exprs + body.index());
            }
            edges
        } else {
            let (stmts, children) = self.stmt_children(StmtId((node - exprs) as u32));
            stmts
                .into_iter()
                .map(|s| exprs + s.index())
                .chain(children.into_iter().map(ExprId::index))
                .collect()
        }
    }
}

/// Range and kind checks for the references of one node.
struct Refs<'a> {
    tu: &'a TranslationUnit,
    owner: String,
}

impl<'a> Refs<'a> {
    fn new(tu: &'a TranslationUnit, owner: String) -> Self {
        Refs { tu, owner }
    }

    fn check(&self, what: &str, index: usize, len: usize) -> Result<(), DbError> {
        if index < len {
            return Ok(());
        }
        Err(DbError::MalformedUnit(format!(
            "{} refers to {what} {index}, but the unit has {len}",
            self.owner
        )))
    }

    fn ty(&self, id: TyId) -> Result<(), DbError> {
        self.check("type", id.index(), self.tu.types.len())
    }

    fn decl(&self, id: DeclId) -> Result<(), DbError> {
        self.check("declaration", id.index(), self.tu.decls.len())
    }

    fn expr(&self, id: ExprId) -> Result<(), DbError> {
        self.check("expression", id.index(), self.tu.exprs.len())
    }

    fn stmt(&self, id: StmtId) -> Result<(), DbError> {
        self.check("statement", id.index(), self.tu.stmts.len())
    }

    fn decls(&self, ids: &[DeclId]) -> Result<(), DbError> {
        ids.iter().try_for_each(|d| self.decl(*d))
    }

    fn opt_decl(&self, id: Option<DeclId>) -> Result<(), DbError> {
        id.map_or(Ok(()), |d| self.decl(d))
    }

    fn opt_expr(&self, id: Option<ExprId>) -> Result<(), DbError> {
        id.map_or(Ok(()), |e| self.expr(e))
    }

    fn opt_stmt(&self, id: Option<StmtId>) -> Result<(), DbError> {
        id.map_or(Ok(()), |s| self.stmt(s))
    }

    fn nominal(&self, decl: DeclId, what: &str, is: fn(&DeclKind) -> bool) -> Result<(), DbError> {
        self.decl(decl)?;
        if is(&self.tu.decl(decl).kind) {
            return Ok(());
        }
        Err(DbError::MalformedUnit(format!(
            "{} names declaration {} as its {what}",
            self.owner,
            decl.index()
        )))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Open,
    Done,
}

/// Depth-first search over `0..len`; returns a node on a cycle, if any.
fn find_cycle(len: usize, edges: impl Fn(usize) -> Vec<usize>) -> Option<usize> {
    let mut marks = vec![Mark::New; len];
    let mut stack: Vec<(usize, Vec<usize>)> = Vec::new();
    for root in 0..len {
        if marks[root] != Mark::New {
            continue;
        }
        marks[root] = Mark::Open;
        stack.push((root, edges(root)));
        while let Some(top) = stack.last_mut() {
            let node = top.0;
            match top.1.pop() {
                Some(next) => match marks[next] {
                    Mark::New => {
                        marks[next] = Mark::Open;
                        stack.push((next, edges(next)));
                    }
                    Mark::Open => return Some(next),
                    Mark::Done => {}
                },
                None => {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Incremental constructor for [`TranslationUnit`].
///
/// Structural types are interned so that spelling the same type twice
/// yields the same node. Records are laid out as fields are appended, and
/// expression types are inferred from their operands.
pub struct AstBuilder {
    tu: TranslationUnit,
    interned: HashMap<Type, TyId>,
    aligns: HashMap<TyId, u64>,
    record_layout: HashMap<DeclId, (u64, u64)>,
    loc: SourceLoc,
}

impl AstBuilder {
    pub fn new(main_file: &str) -> Self {
        let mut b = AstBuilder {
            tu: TranslationUnit::default(),
            interned: HashMap::new(),
            aligns: HashMap::new(),
            record_layout: HashMap::new(),
            loc: SourceLoc::default(),
        };
        let main = b.file(main_file);
        b.tu.main_file = main;
        b.loc.file = main;
        b
    }

    pub fn file(&mut self, path: &str) -> FileId {
        if let Some(i) = self.tu.files.iter().position(|f| f == path) {
            return FileId(i as u32);
        }
        self.tu.files.push(path.to_string());
        FileId((self.tu.files.len() - 1) as u32)
    }

    /// Location stamped on nodes created from now on.
    pub fn at(&mut self, file: FileId, line: u32, column: u32) -> &mut Self {
        self.loc = SourceLoc { file, line, column };
        self
    }

    pub fn unit(&self) -> &TranslationUnit {
        &self.tu
    }

    pub fn finish(self) -> TranslationUnit {
        self.tu
    }

    // -- types --------------------------------------------------------------

    /// Interns a structural type; identical descriptions share a node.
    pub fn intern(&mut self, ty: Type) -> TyId {
        if let Some(id) = self.interned.get(&ty) {
            return *id;
        }
        let id = self.push_type(ty.clone());
        self.interned.insert(ty, id);
        id
    }

    fn push_type(&mut self, ty: Type) -> TyId {
        self.tu.types.push(ty);
        TyId((self.tu.types.len() - 1) as u32)
    }

    /// Pushes a nominal type node without interning it.
    pub(crate) fn nominal(&mut self, ty: Type) -> TyId {
        self.push_type(ty)
    }

    pub(crate) fn decl_mut(&mut self, id: DeclId) -> &mut Decl {
        &mut self.tu.decls[id.index()]
    }

    pub(crate) fn type_mut(&mut self, id: TyId) -> &mut Type {
        &mut self.tu.types[id.index()]
    }

    /// Id the next pushed declaration will get.
    pub(crate) fn next_decl(&self) -> DeclId {
        DeclId(self.tu.decls.len() as u32)
    }

    /// Builtin classified by its spelling.
    pub fn builtin(&mut self, name: &str, size: u64) -> TyId {
        self.builtin_of(name, size, BuiltinClass::of_spelling(name))
    }

    pub fn builtin_of(&mut self, name: &str, size: u64, class: BuiltinClass) -> TyId {
        let id = self.intern(Type {
            kind: TypeKind::Builtin { class },
            quals: Qualifiers::NONE,
            size: (size > 0).then_some(size),
            spelling: name.to_string(),
        });
        self.aligns.insert(id, size.clamp(1, 8));
        id
    }

    pub fn void(&mut self) -> TyId {
        self.builtin("void", 0)
    }

    pub fn int(&mut self) -> TyId {
        self.builtin("int", 4)
    }

    pub fn char(&mut self) -> TyId {
        self.builtin("char", 1)
    }

    pub fn long(&mut self) -> TyId {
        self.builtin("long", 8)
    }

    pub fn unsigned_long(&mut self) -> TyId {
        self.builtin("unsigned long", 8)
    }

    pub fn double(&mut self) -> TyId {
        self.builtin("double", 8)
    }

    pub fn qualified(&mut self, inner: TyId, quals: Qualifiers) -> TyId {
        let spelling = format!("{}{}", quals.prefix(), self.tu.ty(inner).spelling);
        let size = self.tu.ty(inner).size;
        let id = self.intern(Type {
            kind: TypeKind::Sugar { inner },
            quals,
            size,
            spelling,
        });
        let align = self.align_of(inner);
        self.aligns.insert(id, align);
        id
    }

    pub fn pointer(&mut self, pointee: TyId) -> TyId {
        let spelling = format!("{} *", self.tu.ty(pointee).spelling);
        let id = self.intern(Type {
            kind: TypeKind::Pointer { pointee },
            quals: Qualifiers::NONE,
            size: Some(8),
            spelling,
        });
        self.aligns.insert(id, 8);
        id
    }

    pub fn array(&mut self, element: TyId, len: u64) -> TyId {
        let elem = self.tu.ty(element);
        let spelling = format!("{}[{}]", elem.spelling, len);
        let size = elem.size.map(|s| s * len);
        let id = self.intern(Type {
            kind: TypeKind::ConstantArray { element, len },
            quals: Qualifiers::NONE,
            size,
            spelling,
        });
        let align = self.align_of(element);
        self.aligns.insert(id, align);
        id
    }

    pub fn incomplete_array(&mut self, element: TyId) -> TyId {
        let spelling = format!("{}[]", self.tu.ty(element).spelling);
        self.intern(Type {
            kind: TypeKind::IncompleteArray { element },
            quals: Qualifiers::NONE,
            size: None,
            spelling,
        })
    }

    pub fn variable_array(&mut self, element: TyId, size: ExprId) -> TyId {
        let spelling = format!("{}[*]", self.tu.ty(element).spelling);
        self.intern(Type {
            kind: TypeKind::VariableArray {
                element,
                size: Some(size),
            },
            quals: Qualifiers::NONE,
            size: None,
            spelling,
        })
    }

    pub fn function_type(&mut self, ret: TyId, params: &[TyId], variadic: bool) -> TyId {
        let mut args: Vec<String> = params
            .iter()
            .map(|p| self.tu.ty(*p).spelling.clone())
            .collect();
        if variadic {
            args.push("...".to_string());
        }
        let spelling = format!("{} ({})", self.tu.ty(ret).spelling, args.join(", "));
        self.intern(Type {
            kind: TypeKind::Function {
                ret,
                params: params.to_vec(),
                variadic,
            },
            quals: Qualifiers::NONE,
            size: None,
            spelling,
        })
    }

    pub fn unsupported_type(&mut self, what: &str) -> TyId {
        self.intern(Type {
            kind: TypeKind::Unsupported {
                what: what.to_string(),
            },
            quals: Qualifiers::NONE,
            size: None,
            spelling: what.to_string(),
        })
    }

    fn align_of(&self, ty: TyId) -> u64 {
        if let Some(a) = self.aligns.get(&ty) {
            return *a;
        }
        match &self.tu.ty(ty).kind {
            TypeKind::Typedef { decl } => match &self.tu.decl(*decl).kind {
                DeclKind::Typedef { underlying, .. } => self.align_of(*underlying),
                _ => 1,
            },
            TypeKind::Sugar { inner } => self.align_of(*inner),
            _ => self.tu.ty(ty).size.unwrap_or(1).clamp(1, 8),
        }
    }

    // -- declarations -------------------------------------------------------

    pub fn push_decl(&mut self, decl: Decl) -> DeclId {
        self.tu.decls.push(decl);
        DeclId((self.tu.decls.len() - 1) as u32)
    }

    fn decl_here(&self, name: &str, parent: Option<DeclId>, kind: DeclKind) -> Decl {
        Decl {
            name: name.to_string(),
            loc: self.loc.clone(),
            parent,
            implicit: false,
            kind,
        }
    }

    pub fn add_top_level(&mut self, decl: DeclId) {
        self.tu.top_level.push(decl);
    }

    fn new_record(&mut self, tag: TagKind, name: &str, parent: Option<DeclId>) -> (DeclId, TyId) {
        let keyword = match tag {
            TagKind::Struct => "struct",
            TagKind::Union => "union",
            TagKind::Class => "class",
        };
        let spelling = if name.is_empty() {
            format!("{keyword} (anonymous)")
        } else {
            format!("{keyword} {name}")
        };
        let ty = self.push_type(Type {
            kind: TypeKind::Record {
                decl: DeclId(self.tu.decls.len() as u32),
            },
            quals: Qualifiers::NONE,
            size: None,
            spelling,
        });
        let decl = self.push_decl(self.decl_here(
            name,
            parent,
            DeclKind::Record(RecordDecl {
                tag,
                ty,
                members: Vec::new(),
                complete: false,
                definition: None,
                typedef_name: None,
            }),
        ));
        self.record_layout.insert(decl, (0, 1));
        (decl, ty)
    }

    /// File-scope record, incomplete until [`AstBuilder::complete`].
    pub fn record(&mut self, tag: TagKind, name: &str) -> (DeclId, TyId) {
        let (decl, ty) = self.new_record(tag, name, None);
        self.add_top_level(decl);
        (decl, ty)
    }

    /// Record declared inside a function body; reached through a `Decl` statement.
    pub fn local_record(&mut self, function: DeclId, tag: TagKind, name: &str) -> (DeclId, TyId) {
        self.new_record(tag, name, Some(function))
    }

    /// Anonymous struct/union nested into `parent`, with its unnamed member field.
    pub fn anonymous_member(&mut self, parent: DeclId, tag: TagKind) -> (DeclId, TyId) {
        let scope = self.tu.decl(parent).parent;
        let (decl, ty) = self.new_record(tag, "", scope);
        if let DeclKind::Record(r) = &mut self.tu.decls[parent.index()].kind {
            r.members.push(decl);
        }
        (decl, ty)
    }

    /// Second declaration of a record that points at its definition.
    pub fn forward_redeclaration(&mut self, record: DeclId) -> DeclId {
        let d = self.tu.decl(record).clone();
        let DeclKind::Record(r) = d.kind else {
            return record;
        };
        let fwd = self.push_decl(Decl {
            kind: DeclKind::Record(RecordDecl {
                members: Vec::new(),
                complete: false,
                definition: Some(record),
                ..r
            }),
            ..d
        });
        self.add_top_level(fwd);
        fwd
    }

    pub fn field(&mut self, record: DeclId, name: &str, ty: TyId) -> DeclId {
        self.bitfield(record, name, ty, None)
    }

    pub fn bitfield(&mut self, record: DeclId, name: &str, ty: TyId, width: Option<u32>) -> DeclId {
        let tag = self.tu.record(record).map(|r| r.tag).unwrap_or_default();
        let size = self.tu.ty(ty).size.unwrap_or(0);
        let align = self.align_of(ty);
        let (cur, max_align) = self.record_layout.get(&record).copied().unwrap_or((0, 1));
        let offset = match tag {
            TagKind::Union => 0,
            _ => cur.div_ceil(align) * align,
        };
        let end = match tag {
            TagKind::Union => cur.max(size),
            _ => offset + size,
        };
        self.record_layout
            .insert(record, (end, max_align.max(align)));
        let field = self.push_decl(self.decl_here(
            name,
            Some(record),
            DeclKind::Field(FieldDecl {
                ty,
                offset_bits: offset * 8,
                bit_width: width,
                init: None,
            }),
        ));
        if let DeclKind::Record(r) = &mut self.tu.decls[record.index()].kind {
            r.members.push(field);
        }
        field
    }

    /// Marks the record complete and computes its size.
    pub fn complete(&mut self, record: DeclId) {
        let (end, align) = self.record_layout.get(&record).copied().unwrap_or((0, 1));
        let size = end.div_ceil(align) * align;
        if let DeclKind::Record(r) = &mut self.tu.decls[record.index()].kind {
            r.complete = true;
            let ty = r.ty;
            self.tu.types[ty.index()].size = Some(size);
            self.aligns.insert(ty, align);
        }
    }

    /// Named field lookup, descending through anonymous members.
    pub fn field_of(&self, record: DeclId, name: &str) -> Option<DeclId> {
        let r = self.tu.record(record)?;
        for m in &r.members {
            let d = self.tu.decl(*m);
            if let DeclKind::Field(_) = d.kind {
                if d.name == name {
                    return Some(*m);
                }
                if let Some(anon) = self.tu.anonymous_member(*m)
                    && let Some(f) = self.field_of(anon, name)
                {
                    return Some(f);
                }
            }
        }
        None
    }

    /// The unnamed field through which an anonymous member is reached.
    pub fn unnamed_field_of(&self, parent: DeclId, anon: DeclId) -> Option<DeclId> {
        let r = self.tu.record(parent)?;
        r.members
            .iter()
            .copied()
            .find(|m| self.tu.anonymous_member(*m) == Some(anon))
    }

    pub fn typedef(&mut self, name: &str, underlying: TyId) -> (DeclId, TyId) {
        let decl_id = DeclId(self.tu.decls.len() as u32);
        let size = self.tu.ty(underlying).size;
        let ty = self.push_type(Type {
            kind: TypeKind::Typedef { decl: decl_id },
            quals: Qualifiers::NONE,
            size,
            spelling: name.to_string(),
        });
        let decl = self.push_decl(self.decl_here(name, None, DeclKind::Typedef { underlying, ty }));
        if let Some(rec) = self.tu.record_of(underlying)
            && self.tu.decl(rec).name.is_empty()
            && let DeclKind::Record(r) = &mut self.tu.decls[rec.index()].kind
        {
            r.typedef_name = Some(name.to_string());
        }
        let align = self.align_of(underlying);
        self.aligns.insert(ty, align);
        self.add_top_level(decl);
        (decl, ty)
    }

    pub fn enumeration(&mut self, name: &str, constants: &[(&str, i64)]) -> (DeclId, TyId) {
        let underlying = self.builtin("unsigned int", 4);
        let decl_id = DeclId(self.tu.decls.len() as u32);
        let ty = self.push_type(Type {
            kind: TypeKind::Enum { decl: decl_id },
            quals: Qualifiers::NONE,
            size: Some(4),
            spelling: format!("enum {name}"),
        });
        let decl = self.push_decl(self.decl_here(
            name,
            None,
            DeclKind::Enum(EnumDecl {
                ty,
                underlying,
                constants: Vec::new(),
                complete: true,
            }),
        ));
        let mut ids = Vec::new();
        for (n, v) in constants {
            ids.push(self.push_decl(self.decl_here(
                n,
                Some(decl),
                DeclKind::EnumConstant { value: *v },
            )));
        }
        if let DeclKind::Enum(e) = &mut self.tu.decls[decl.index()].kind {
            e.constants = ids;
        }
        self.aligns.insert(ty, 4);
        self.add_top_level(decl);
        (decl, ty)
    }

    /// Declares a file-scope function with external linkage and no body.
    pub fn function(&mut self, name: &str, ret: TyId, params: &[(&str, TyId)]) -> DeclId {
        let ptys: Vec<TyId> = params.iter().map(|(_, t)| *t).collect();
        let ty = self.function_type(ret, &ptys, false);
        self.function_of_type(name, ty, params.iter().map(|(n, _)| *n).collect())
    }

    pub fn variadic_function(&mut self, name: &str, ret: TyId, params: &[(&str, TyId)]) -> DeclId {
        let ptys: Vec<TyId> = params.iter().map(|(_, t)| *t).collect();
        let ty = self.function_type(ret, &ptys, true);
        self.function_of_type(name, ty, params.iter().map(|(n, _)| *n).collect())
    }

    pub fn function_of_type(&mut self, name: &str, ty: TyId, param_names: Vec<&str>) -> DeclId {
        let f = self.push_decl(self.decl_here(
            name,
            None,
            DeclKind::Function(FunctionDecl {
                ty,
                params: Vec::new(),
                body: None,
                canonical: None,
                linkage: Linkage::External,
                is_inline: false,
                method_of: None,
                template: None,
            }),
        ));
        self.attach_params(f, ty, &param_names);
        self.add_top_level(f);
        f
    }

    fn attach_params(&mut self, f: DeclId, ty: TyId, names: &[&str]) {
        let ptys: Vec<TyId> = self
            .tu
            .signature(ty)
            .map(|(_, p, _)| p.to_vec())
            .unwrap_or_default();
        let mut ids = Vec::new();
        for (i, pty) in ptys.iter().enumerate() {
            let name = names.get(i).copied().unwrap_or("");
            ids.push(self.push_decl(self.decl_here(
                name,
                Some(f),
                DeclKind::Param(ParamDecl {
                    ty: *pty,
                    index: i as u32,
                }),
            )));
        }
        if let DeclKind::Function(fd) = &mut self.tu.decls[f.index()].kind {
            fd.params = ids;
        }
    }

    /// Another declaration of an existing function, sharing its canonical decl.
    pub fn redeclare(&mut self, prior: DeclId) -> DeclId {
        let canonical = self.tu.canonical(prior);
        let d = self.tu.decl(prior).clone();
        let DeclKind::Function(fd) = d.kind else {
            return prior;
        };
        let names: Vec<String> = fd
            .params
            .iter()
            .map(|p| self.tu.decl(*p).name.clone())
            .collect();
        let f = self.push_decl(Decl {
            name: d.name,
            loc: self.loc.clone(),
            parent: d.parent,
            implicit: d.implicit,
            kind: DeclKind::Function(FunctionDecl {
                params: Vec::new(),
                body: None,
                canonical: Some(canonical),
                ..fd
            }),
        });
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.attach_params(f, fd.ty, &refs);
        self.add_top_level(f);
        f
    }

    pub fn params(&self, f: DeclId) -> Vec<DeclId> {
        self.tu.function(f).map(|f| f.params.clone()).unwrap_or_default()
    }

    pub fn set_body(&mut self, f: DeclId, body: StmtId) {
        if let DeclKind::Function(fd) = &mut self.tu.decls[f.index()].kind {
            fd.body = Some(body);
        }
    }

    pub fn set_linkage(&mut self, d: DeclId, linkage: Linkage) {
        match &mut self.tu.decls[d.index()].kind {
            DeclKind::Function(f) => f.linkage = linkage,
            DeclKind::Var(v) => v.linkage = linkage,
            _ => {}
        }
    }

    pub fn set_implicit(&mut self, d: DeclId) {
        self.tu.decls[d.index()].implicit = true;
    }

    pub fn set_method_of(&mut self, f: DeclId, class: TyId) {
        if let DeclKind::Function(fd) = &mut self.tu.decls[f.index()].kind {
            fd.method_of = Some(class);
        }
    }

    /// Wraps a pattern function into a function template.
    pub fn function_template(&mut self, pattern: DeclId) -> DeclId {
        let name = self.tu.decl(pattern).name.clone();
        let t = self.push_decl(self.decl_here(&name, None, DeclKind::FunctionTemplate { pattern }));
        if let DeclKind::Function(fd) = &mut self.tu.decls[pattern.index()].kind {
            fd.template = Some(t);
        }
        self.tu.top_level.retain(|d| *d != pattern);
        self.add_top_level(t);
        t
    }

    /// A body-less instantiation of a function template.
    pub fn specialization(&mut self, template: DeclId) -> DeclId {
        let DeclKind::FunctionTemplate { pattern } = self.tu.decl(template).kind else {
            return template;
        };
        let name = self.tu.decl(pattern).name.clone();
        let ty = self.tu.function(pattern).map(|f| f.ty);
        let Some(ty) = ty else {
            return template;
        };
        let f = self.function_of_type(&name, ty, Vec::new());
        self.tu.top_level.retain(|d| *d != f);
        if let DeclKind::Function(fd) = &mut self.tu.decls[f.index()].kind {
            fd.template = Some(template);
        }
        f
    }

    pub fn global(&mut self, name: &str, ty: TyId, init: Option<ExprId>) -> DeclId {
        let g = self.push_decl(self.decl_here(
            name,
            None,
            DeclKind::Var(VarDecl {
                ty,
                init,
                linkage: Linkage::External,
                storage: StorageKind::Global,
                canonical: None,
                is_definition: true,
            }),
        ));
        self.add_top_level(g);
        g
    }

    /// `extern` declaration of a global.
    pub fn extern_global(&mut self, name: &str, ty: TyId) -> DeclId {
        let g = self.global(name, ty, None);
        if let DeclKind::Var(v) = &mut self.tu.decls[g.index()].kind {
            v.is_definition = false;
        }
        g
    }

    /// Redeclaration of a global pointing at the first declaration.
    pub fn redeclare_global(&mut self, prior: DeclId, init: Option<ExprId>) -> DeclId {
        let canonical = self.tu.canonical(prior);
        let d = self.tu.decl(prior).clone();
        let DeclKind::Var(v) = d.kind else {
            return prior;
        };
        let g = self.push_decl(Decl {
            loc: self.loc.clone(),
            kind: DeclKind::Var(VarDecl {
                init,
                canonical: Some(canonical),
                is_definition: true,
                ..v
            }),
            ..d
        });
        self.add_top_level(g);
        g
    }

    pub fn local(&mut self, function: DeclId, name: &str, ty: TyId) -> DeclId {
        self.push_decl(self.decl_here(
            name,
            Some(function),
            DeclKind::Var(VarDecl {
                ty,
                init: None,
                linkage: Linkage::None,
                storage: StorageKind::Local,
                canonical: None,
                is_definition: true,
            }),
        ))
    }

    pub fn static_local(&mut self, function: DeclId, name: &str, ty: TyId) -> DeclId {
        let d = self.local(function, name, ty);
        if let DeclKind::Var(v) = &mut self.tu.decls[d.index()].kind {
            v.storage = StorageKind::StaticLocal;
            v.linkage = Linkage::Internal;
        }
        d
    }

    pub fn set_init(&mut self, var: DeclId, init: ExprId) {
        if let DeclKind::Var(v) = &mut self.tu.decls[var.index()].kind {
            v.init = Some(init);
        }
    }

    // -- expressions --------------------------------------------------------

    pub fn expr(&mut self, kind: ExprKind, ty: TyId) -> ExprId {
        self.tu.exprs.push(Expr {
            kind,
            ty,
            loc: self.loc.clone(),
        });
        ExprId((self.tu.exprs.len() - 1) as u32)
    }

    pub fn int_lit(&mut self, value: u64) -> ExprId {
        let ty = self.int();
        self.expr(ExprKind::IntLit { value }, ty)
    }

    pub fn char_lit(&mut self, value: u32) -> ExprId {
        let ty = self.int();
        self.expr(ExprKind::CharLit { value }, ty)
    }

    pub fn float_lit(&mut self, value: f64) -> ExprId {
        let ty = self.double();
        self.expr(ExprKind::FloatLit { value }, ty)
    }

    pub fn string_lit(&mut self, value: &str) -> ExprId {
        let c = self.char();
        let ty = self.array(c, value.len() as u64 + 1);
        self.expr(
            ExprKind::StringLit {
                value: value.to_string(),
            },
            ty,
        )
    }

    pub fn var(&mut self, decl: DeclId) -> ExprId {
        let ty = match &self.tu.decl(decl).kind {
            DeclKind::EnumConstant { .. } => self.int(),
            _ => match self.tu.decl_type(decl) {
                Some(t) => t,
                None => self.int(),
            },
        };
        self.expr(ExprKind::DeclRef { decl }, ty)
    }

    pub fn unresolved(&mut self, name: &str) -> ExprId {
        let ty = self.int();
        self.expr(
            ExprKind::UnresolvedName {
                name: name.to_string(),
            },
            ty,
        )
    }

    pub fn paren(&mut self, sub: ExprId) -> ExprId {
        let ty = self.tu.expr(sub).ty;
        self.expr(ExprKind::Paren { sub }, ty)
    }

    pub fn cast(&mut self, sub: ExprId, ty: TyId) -> ExprId {
        let from = self.tu.resolve(self.tu.expr(sub).ty);
        let to = self.tu.resolve(ty);
        let cast = if from == to {
            CastKind::NoOp
        } else {
            match (&self.tu.ty(from).kind, &self.tu.ty(to).kind) {
                (TypeKind::Pointer { .. }, TypeKind::Pointer { .. }) => CastKind::BitCast,
                (TypeKind::Builtin { .. }, TypeKind::Pointer { .. }) => CastKind::IntegralToPointer,
                (TypeKind::Pointer { .. }, TypeKind::Builtin { .. }) => CastKind::PointerToIntegral,
                (
                    TypeKind::Builtin { class: from_class },
                    TypeKind::Builtin { class: to_class },
                ) => match (
                    *from_class == BuiltinClass::Floating,
                    *to_class == BuiltinClass::Floating,
                ) {
                    (true, true) => CastKind::FloatingCast,
                    (false, true) => CastKind::IntegralToFloating,
                    (true, false) => CastKind::FloatingToIntegral,
                    (false, false) => CastKind::IntegralCast,
                },
                _ => CastKind::Other,
            }
        };
        self.expr(
            ExprKind::Cast {
                sub,
                cast,
                explicit: true,
            },
            ty,
        )
    }

    pub fn implicit_cast(&mut self, sub: ExprId, cast: CastKind, ty: TyId) -> ExprId {
        self.expr(
            ExprKind::Cast {
                sub,
                cast,
                explicit: false,
            },
            ty,
        )
    }

    pub fn unary(&mut self, op: UnaryOp, sub: ExprId) -> ExprId {
        let sty = self.tu.expr(sub).ty;
        let ty = match op {
            UnaryOp::Deref => match self.tu.pointee(sty) {
                Some(t) => t,
                None => self.int(),
            },
            UnaryOp::AddrOf => self.pointer(sty),
            UnaryOp::LNot => self.int(),
            _ => sty,
        };
        self.expr(ExprKind::Unary { op, sub }, ty)
    }

    pub fn deref(&mut self, sub: ExprId) -> ExprId {
        self.unary(UnaryOp::Deref, sub)
    }

    pub fn addr_of(&mut self, sub: ExprId) -> ExprId {
        self.unary(UnaryOp::AddrOf, sub)
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        let lty = self.tu.expr(lhs).ty;
        let rty = self.tu.expr(rhs).ty;
        let ty = if op.is_comparison() {
            self.int()
        } else if matches!(op, BinaryOp::Add | BinaryOp::Sub) && !self.tu.is_pointer_like(lty) {
            if self.tu.is_pointer_like(rty) { rty } else { lty }
        } else if op == BinaryOp::Comma {
            rty
        } else {
            lty
        };
        self.expr(ExprKind::Binary { op, lhs, rhs }, ty)
    }

    pub fn assign(&mut self, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.binary(BinaryOp::Assign, lhs, rhs)
    }

    pub fn member(&mut self, base: ExprId, field: DeclId, arrow: bool) -> ExprId {
        let ty = match self.tu.decl_type(field) {
            Some(t) => t,
            None => self.int(),
        };
        self.expr(ExprKind::Member { base, field, arrow }, ty)
    }

    pub fn subscript(&mut self, base: ExprId, index: ExprId) -> ExprId {
        let bty = self.tu.expr(base).ty;
        let ty = match self.tu.pointee(bty) {
            Some(t) => t,
            None => self.int(),
        };
        self.expr(ExprKind::Subscript { base, index }, ty)
    }

    pub fn call(&mut self, callee: ExprId, args: Vec<ExprId>) -> ExprId {
        let cty = self.tu.expr(callee).ty;
        let ty = match self.tu.signature(cty) {
            Some((ret, _, _)) => ret,
            None => self.int(),
        };
        self.expr(ExprKind::Call { callee, args }, ty)
    }

    /// Direct call of a declared function.
    pub fn call_fn(&mut self, f: DeclId, args: Vec<ExprId>) -> ExprId {
        let callee = self.var(f);
        self.call(callee, args)
    }

    pub fn conditional(&mut self, cond: ExprId, then: ExprId, otherwise: ExprId) -> ExprId {
        let ty = self.tu.expr(then).ty;
        self.expr(
            ExprKind::Conditional {
                cond,
                then,
                otherwise,
            },
            ty,
        )
    }

    pub fn offset_of(&mut self, record: TyId, path: Vec<OffsetOfComponent>) -> ExprId {
        let ty = self.unsigned_long();
        self.expr(ExprKind::OffsetOf { record, path }, ty)
    }

    pub fn size_of(&mut self, arg: TyId) -> ExprId {
        let ty = self.unsigned_long();
        self.expr(ExprKind::SizeOf { arg }, ty)
    }

    pub fn init_list(&mut self, inits: Vec<ExprId>, ty: TyId) -> ExprId {
        self.expr(ExprKind::InitList { inits }, ty)
    }

    // -- statements ---------------------------------------------------------

    pub fn stmt(&mut self, stmt: Stmt) -> StmtId {
        self.tu.stmts.push(stmt);
        StmtId((self.tu.stmts.len() - 1) as u32)
    }

    pub fn block(&mut self, body: Vec<StmtId>) -> StmtId {
        self.stmt(Stmt::Compound { body })
    }

    pub fn decl_stmt(&mut self, decls: Vec<DeclId>) -> StmtId {
        self.stmt(Stmt::Decl { decls })
    }

    /// Declares a local with an initializer and returns `(var, decl statement)`.
    pub fn let_local(
        &mut self,
        function: DeclId,
        name: &str,
        ty: TyId,
        init: Option<ExprId>,
    ) -> (DeclId, StmtId) {
        let v = self.local(function, name, ty);
        if let Some(init) = init {
            self.set_init(v, init);
        }
        let s = self.decl_stmt(vec![v]);
        (v, s)
    }

    pub fn expr_stmt(&mut self, expr: ExprId) -> StmtId {
        self.stmt(Stmt::Expr { expr })
    }

    pub fn ret(&mut self, value: Option<ExprId>) -> StmtId {
        self.stmt(Stmt::Return { value })
    }

    pub fn if_stmt(&mut self, cond: ExprId, then: StmtId, otherwise: Option<StmtId>) -> StmtId {
        self.stmt(Stmt::If {
            cond,
            then,
            otherwise,
        })
    }

    pub fn while_stmt(&mut self, cond: ExprId, body: StmtId) -> StmtId {
        self.stmt(Stmt::While { cond, body })
    }

    pub fn switch_stmt(&mut self, cond: ExprId, body: StmtId) -> StmtId {
        self.stmt(Stmt::Switch { cond, body })
    }

    pub fn case(&mut self, value: ExprId, body: StmtId) -> StmtId {
        self.stmt(Stmt::Case { value, body })
    }

    pub fn asm(&mut self, text: &str, operands: Vec<ExprId>) -> StmtId {
        self.stmt(Stmt::Asm {
            text: text.to_string(),
            operands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_interns_structural_types() {
        let mut b = AstBuilder::new("a.c");
        let i1 = b.int();
        let i2 = b.int();
        assert_eq!(i1, i2);
        let p1 = b.pointer(i1);
        let p2 = b.pointer(i2);
        assert_eq!(p1, p2);
        assert_eq!(b.unit().ty(p1).spelling, "int *");
    }

    #[test]
    fn record_layout_aligns_fields() {
        let mut b = AstBuilder::new("a.c");
        let c = b.char();
        let i = b.int();
        let (s, sty) = b.record(TagKind::Struct, "s");
        b.field(s, "c", c);
        let fi = b.field(s, "i", i);
        b.complete(s);
        let tu = b.finish();
        match &tu.decl(fi).kind {
            DeclKind::Field(f) => assert_eq!(f.offset_bits, 32),
            other => panic!("not a field: {other:?}"),
        }
        assert_eq!(tu.ty(sty).size, Some(8));
    }

    #[test]
    fn binary_op_codes_follow_clang_numbering() {
        assert_eq!(BinaryOp::Lt.code(), 10);
        assert_eq!(BinaryOp::LOr.code(), 20);
        assert_eq!(BinaryOp::Assign.code(), 21);
        assert_eq!(BinaryOp::OrAssign.code(), 31);
        assert!(BinaryOp::AddAssign.is_assignment());
        assert!(BinaryOp::Xor.is_logic());
        assert!(!BinaryOp::Add.is_logic());
        assert_eq!(BinaryOp::from_spelling("<<="), Some(BinaryOp::ShlAssign));
    }

    fn list_unit() -> TranslationUnit {
        let mut b = AstBuilder::new("list.c");
        let int = b.int();
        let (node, nty) = b.record(TagKind::Struct, "node");
        let pn = b.pointer(nty);
        b.field(node, "next", pn);
        b.complete(node);
        let f = b.function("len", int, &[("n", pn)]);
        let n = b.params(f)[0];
        let nr = b.var(n);
        let ret = b.ret(Some(nr));
        let block = b.block(vec![ret]);
        b.set_body(f, block);
        b.finish()
    }

    #[test]
    fn built_units_validate() {
        assert_eq!(list_unit().validate(), Ok(()));
    }

    #[test]
    fn dangling_top_level_declaration_is_rejected() {
        let json = r#"{"main_file":0,"files":["bad.c"],"types":[],"decls":[],"exprs":[],"stmts":[],"top_level":[7]}"#;
        let tu: TranslationUnit = serde_json::from_str(json).expect("parse unit");
        match tu.validate() {
            Err(DbError::MalformedUnit(msg)) => assert!(msg.contains("declaration 7"), "{msg}"),
            other => panic!("expected malformed unit, got {other:?}"),
        }
    }

    #[test]
    fn dangling_expression_type_is_rejected() {
        let mut tu = list_unit();
        let last = tu.exprs.len() - 1;
        tu.exprs[last].ty = TyId(999);
        assert!(matches!(tu.validate(), Err(DbError::MalformedUnit(_))));
    }

    #[test]
    fn typedef_cycle_is_rejected() {
        let mut b = AstBuilder::new("t.c");
        let int = b.int();
        let (d, ty) = b.typedef("loop_t", int);
        let mut tu = b.finish();
        tu.decls[d.index()].kind = DeclKind::Typedef { underlying: ty, ty };
        match tu.validate() {
            Err(DbError::MalformedUnit(msg)) => assert!(msg.contains("cycle"), "{msg}"),
            other => panic!("expected typedef cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_containing_expression_is_rejected() {
        let mut b = AstBuilder::new("e.c");
        let one = b.int_lit(1);
        let p = b.paren(one);
        let mut tu = b.finish();
        tu.exprs[p.index()].kind = ExprKind::Paren { sub: p };
        match tu.validate() {
            Err(DbError::MalformedUnit(msg)) => assert!(msg.contains("contains itself"), "{msg}"),
            other => panic!("expected expression cycle, got {other:?}"),
        }
    }

    #[test]
    fn record_type_must_name_a_record() {
        let mut tu = list_unit();
        let rec = tu
            .types
            .iter()
            .position(|t| matches!(t.kind, TypeKind::Record { .. }))
            .expect("record type");
        let func = tu
            .decls
            .iter()
            .position(|d| matches!(d.kind, DeclKind::Function(_)))
            .expect("function decl");
        tu.types[rec].kind = TypeKind::Record {
            decl: DeclId(func as u32),
        };
        assert!(matches!(tu.validate(), Err(DbError::MalformedUnit(_))));
    }
}
