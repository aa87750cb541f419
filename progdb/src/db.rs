//! Output database tables.
//!
//! Every cross-reference is an integer index into the matching table of the
//! same [`Database`]. Unresolvable references are written as `-1`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ast::Linkage;
use crate::error::Diagnostics;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub sources: Vec<String>,
    pub types: Vec<TypeRecord>,
    pub funcs: Vec<FuncRecord>,
    pub funcdecls: Vec<FuncDeclRecord>,
    pub unresolvedfuncs: Vec<UnresolvedFunc>,
    pub globals: Vec<GlobalRecord>,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

impl Database {
    pub fn func(&self, name: &str) -> Option<&FuncRecord> {
        self.funcs.iter().find(|f| f.name == name)
    }

    pub fn funcdecl(&self, name: &str) -> Option<&FuncDeclRecord> {
        self.funcdecls.iter().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&GlobalRecord> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Record, enum or typedef type by tag/typedef name.
    pub fn named_type(&self, name: &str) -> Option<&TypeRecord> {
        self.types
            .iter()
            .find(|t| t.name.as_deref() == Some(name) && t.class != TypeClass::RecordForward)
    }

    pub fn ty(&self, id: u64) -> Option<&TypeRecord> {
        self.types.get(id as usize)
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeClass {
    Builtin,
    Pointer,
    LvalueReference,
    RvalueReference,
    ConstArray,
    IncompleteArray,
    VariableArray,
    Record,
    RecordForward,
    Enum,
    EnumForward,
    Typedef,
    Function,
    TemplateSpecialization,
    Vector,
    MemberPointer,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub name: String,
    pub index: u32,
    /// Byte offset from the start of the outermost record.
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_width: Option<u32>,
    #[serde(rename = "type")]
    pub ty: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRecord {
    pub id: u64,
    pub class: TypeClass,
    pub qualifiers: String,
    pub size: u64,
    #[serde(rename = "str")]
    pub spelling: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub hash: String,
    pub refs: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldEntry>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub union: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub variadic: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<EnumValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_args: Vec<String>,
    /// Defining function for locally scoped types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Globals referenced from the type (array bounds, member initializers).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usedrefs: Vec<i64>,
    /// Complete record a forward record was reconciled with during merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<u64>,
}

impl TypeRecord {
    pub fn placeholder(id: u64, class: TypeClass, qualifiers: String, size: u64, spelling: String) -> Self {
        TypeRecord {
            id,
            class,
            qualifiers,
            size,
            spelling,
            name: None,
            hash: String::new(),
            refs: Vec::new(),
            fields: Vec::new(),
            union: false,
            variadic: false,
            values: Vec::new(),
            length: None,
            template: None,
            template_args: Vec::new(),
            scope: None,
            usedrefs: Vec::new(),
            definition: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldEntry> {
        self.fields.iter().find(|f| f.name == name)
    }
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalleeKind {
    Func,
    Funcdecl,
    Unresolved,
}

/// Resolved reference into one of the three function tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalleeRef {
    pub kind: CalleeKind,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVar {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub ty: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parm: bool,
    /// Compound statement the variable is declared in; `-1` for parameters.
    pub csid: i64,
    pub location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundScope {
    pub id: i64,
    pub parent: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSite {
    /// Resolved callee for direct calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee: Option<CalleeRef>,
    /// Function dereference record for calls through pointers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deref: Option<usize>,
    /// Parm dereference records, one per argument.
    pub args: Vec<usize>,
    pub ord: usize,
    pub csid: i64,
    pub expr: String,
}

impl CallSite {
    pub fn is_indirect(&self) -> bool {
        self.callee.is_none()
    }
}

/// A `switch` statement and its case labels in source order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchInfo {
    pub condition: String,
    pub csid: i64,
    pub cases: Vec<CaseLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseLabel {
    /// Folded label value; absent when the label does not fold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    /// Enumerator the label names directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumerator: Option<String>,
    pub expr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsmInfo {
    pub csid: i64,
    #[serde(rename = "str")]
    pub text: String,
    pub operands: Vec<OffsetRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Init,
    Assign,
}

/// A function address stored into a record member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberStore {
    #[serde(rename = "type")]
    pub ty: i64,
    /// Field index within the record; `-1` when the field is unknown.
    pub member: i64,
    pub func: CalleeRef,
    pub kind: StoreKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Literals {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub integer: BTreeSet<i64>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub character: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub floating: Vec<f64>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub string: BTreeSet<String>,
}

impl Literals {
    pub fn add_float(&mut self, v: f64) {
        if !self.floating.iter().any(|f| f.to_bits() == v.to_bits()) {
            self.floating.push(v);
        }
    }
}

/// Taint derived from one parameter: depth to local ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintSet {
    pub param: u32,
    pub levels: BTreeMap<u32, BTreeSet<u64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncRecord {
    pub id: u64,
    pub name: String,
    pub linkage: Linkage,
    pub fid: u64,
    pub location: String,
    pub hash: String,
    pub declhash: String,
    pub signature: String,
    /// Return type first, then parameters.
    pub types: Vec<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub variadic: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<i64>,
    pub locals: Vec<LocalVar>,
    pub csmap: Vec<CompoundScope>,
    pub calls: Vec<CallSite>,
    pub derefs: Vec<DerefRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub switches: Vec<SwitchInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asm: Vec<AsmInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fops: Vec<MemberStore>,
    pub refs: Vec<i64>,
    pub globalrefs: Vec<i64>,
    pub funrefs: Vec<CalleeRef>,
    pub literals: Literals,
    pub declcount: usize,
    pub taint: Vec<TaintSet>,
    pub body: String,
}

impl FuncRecord {
    pub fn local(&self, name: &str) -> Option<&LocalVar> {
        self.locals.iter().find(|l| l.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDeclRecord {
    pub id: u64,
    pub name: String,
    pub linkage: Linkage,
    pub fid: u64,
    pub location: String,
    pub declhash: String,
    pub signature: String,
    pub types: Vec<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub variadic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedFunc {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalRecord {
    pub id: u64,
    pub name: String,
    pub linkage: Linkage,
    pub fid: u64,
    pub location: String,
    pub hash: String,
    #[serde(rename = "type")]
    pub ty: i64,
    pub defined: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    pub refs: Vec<i64>,
    pub globalrefs: Vec<i64>,
    pub funrefs: Vec<CalleeRef>,
    pub literals: Literals,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fops: Vec<MemberStore>,
}

// ---------------------------------------------------------------------------
// Dereference records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerefKind {
    Unary,
    Array,
    Member,
    Function,
    Assign,
    Logic,
    #[serde(rename = "offsetof")]
    OffsetOf,
    Init,
    Return,
    Parm,
    Cond,
}

impl DerefKind {
    /// Reference kind used when another record points at a record of this kind.
    pub fn referent(self) -> Option<RefKind> {
        match self {
            DerefKind::Unary => Some(RefKind::Unary),
            DerefKind::Array => Some(RefKind::Array),
            DerefKind::Member => Some(RefKind::Member),
            DerefKind::Assign => Some(RefKind::Assign),
            DerefKind::Logic => Some(RefKind::Logic),
            DerefKind::OffsetOf => Some(RefKind::OffsetOf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Function,
    Funcdecl,
    Unresolved,
    Global,
    Local,
    Parm,
    StringLiteral,
    CharLiteral,
    IntegerLiteral,
    FloatLiteral,
    Callref,
    Address,
    Integer,
    Unary,
    Array,
    Member,
    Assign,
    #[serde(rename = "offsetof")]
    OffsetOf,
    Logic,
}

impl RefKind {
    /// References that point at another dereference record.
    pub fn is_referent(self) -> bool {
        matches!(
            self,
            RefKind::Unary
                | RefKind::Array
                | RefKind::Member
                | RefKind::Assign
                | RefKind::OffsetOf
                | RefKind::Logic
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Sign {
    #[default]
    #[serde(rename = "+")]
    Plus,
    #[serde(rename = "-")]
    Minus,
}

impl Sign {
    pub fn flip(self) -> Sign {
        match self {
            Sign::Plus => Sign::Minus,
            Sign::Minus => Sign::Plus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefValue {
    Id(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetRef {
    pub kind: RefKind,
    pub id: RefValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast: Option<i64>,
    /// Member step (source order) the reference belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mi: Option<u32>,
    #[serde(default)]
    pub sign: Sign,
}

impl OffsetRef {
    pub fn index(&self) -> Option<i64> {
        match self.id {
            RefValue::Id(i) => Some(i),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberAccess {
    #[serde(rename = ".")]
    Value,
    #[serde(rename = "->")]
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerefRecord {
    pub kind: DerefKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    pub base: Vec<OffsetRef>,
    pub offsetrefs: Vec<OffsetRef>,
    /// Field indices stored outer-to-inner; read from the tail for source order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub member: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access: Vec<MemberAccess>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shift: Vec<i64>,
    #[serde(rename = "type", default, skip_serializing_if = "Vec::is_empty")]
    pub member_types: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcall: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast: Option<i64>,
    pub ord: Vec<usize>,
    pub expr: String,
    pub csid: i64,
}

impl DerefRecord {
    pub fn basecnt(&self) -> usize {
        self.base.len()
    }

    /// Field indices in source order.
    pub fn member_path(&self) -> Vec<i64> {
        self.member.iter().rev().copied().collect()
    }

    /// Structural identity used for deduplication; ignores occurrence data.
    pub fn dedup_key(&self) -> DerefKey {
        DerefKey {
            kind: self.kind,
            offset: self.offset,
            base: self.base.iter().map(KeyRef::from).collect(),
            offsetrefs: self.offsetrefs.iter().map(KeyRef::from).collect(),
            member: self.member.clone(),
            access: self.access.clone(),
            shift: self.shift.clone(),
            member_types: self.member_types.clone(),
            mcall: self.mcall.clone(),
            cast: self.cast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum KeyValue {
    Id(i64),
    Float(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct KeyRef {
    kind: RefKind,
    id: KeyValue,
    cast: Option<i64>,
    mi: Option<u32>,
    sign: Sign,
}

impl From<&OffsetRef> for KeyRef {
    fn from(r: &OffsetRef) -> Self {
        KeyRef {
            kind: r.kind,
            id: match &r.id {
                RefValue::Id(i) => KeyValue::Id(*i),
                RefValue::Float(f) => KeyValue::Float(f.to_bits()),
                RefValue::Text(s) => KeyValue::Text(s.clone()),
            },
            cast: r.cast,
            mi: r.mi,
            sign: r.sign,
        }
    }
}

/// Totally ordered tuple of the fields that make two records equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerefKey {
    kind: DerefKind,
    offset: Option<i64>,
    base: Vec<KeyRef>,
    offsetrefs: Vec<KeyRef>,
    member: Vec<i64>,
    access: Vec<MemberAccess>,
    shift: Vec<i64>,
    member_types: Vec<i64>,
    mcall: Option<Vec<i64>>,
    cast: Option<i64>,
}
