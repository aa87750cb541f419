//! libclang front end: cursors to [`TranslationUnit`].
//!
//! Each configured source is parsed with libclang and lowered into the
//! resolved unit model. Operator kinds, member arrows and `offsetof`
//! designators are not exposed by libclang 10, so they are recovered from
//! the token stream of the expression.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use clang::diagnostic::Severity;
use clang::{
    Clang, Entity, EntityKind, EvaluationResult, Index, Linkage as ClangLinkage, StorageClass,
    Type as ClangType, TypeKind as ClangTypeKind,
};
use tracing::{debug, info, warn};

use crate::ast::*;
use crate::config::{self, Config};

/// libclang allows a single live `Clang` per process.
static CLANG: Mutex<()> = Mutex::new(());

/// A unit to load: a source for libclang or a pre-lowered JSON unit.
#[derive(Debug)]
enum UnitSource {
    Json(PathBuf),
    Source { path: PathBuf, args: Vec<String> },
}

/// Collects every unit named by the configuration, in configuration order:
/// `[[unit]]` entries first, then `compile_commands` entries.
fn unit_sources(cfg: &Config, base_dir: &Path) -> Result<Vec<UnitSource>> {
    let mut common: Vec<String> = cfg.clang_args.clone();
    for inc in &cfg.include_paths {
        let flag = format!("-I{}", config::resolve_path(inc, base_dir).display());
        if !common.contains(&flag) {
            common.push(flag);
        }
    }

    let mut out = Vec::new();
    for (i, unit) in cfg.unit.iter().enumerate() {
        match (&unit.source, &unit.ast) {
            (Some(source), None) => {
                let dir = unit
                    .directory
                    .as_ref()
                    .map(|d| config::resolve_path(d, base_dir))
                    .unwrap_or_else(|| base_dir.to_path_buf());
                let mut args = common.clone();
                args.extend(unit.clang_args.iter().cloned());
                args.push(format!("-working-directory={}", dir.display()));
                out.push(UnitSource::Source {
                    path: config::resolve_path(source, &dir),
                    args,
                });
            }
            (None, Some(ast)) => out.push(UnitSource::Json(config::resolve_path(ast, base_dir))),
            _ => anyhow::bail!("unit #{i} must set exactly one of `source` and `ast`"),
        }
    }

    if let Some(cc) = &cfg.compile_commands {
        for cmd in config::load_compile_commands(&config::resolve_path(cc, base_dir))? {
            let dir = config::resolve_path(&cmd.directory, base_dir);
            let mut args = common.clone();
            args.extend(cmd.flags());
            args.push(format!("-working-directory={}", dir.display()));
            out.push(UnitSource::Source {
                path: config::resolve_path(&cmd.file, &dir),
                args,
            });
        }
    }
    Ok(out)
}

/// Loads and lowers every unit of the configuration.
///
/// Sources are parsed serially on one libclang instance; the lowered units
/// own no libclang state and can be processed on any thread.
pub fn load_units(cfg: &Config, base_dir: &Path) -> Result<Vec<TranslationUnit>> {
    let sources = unit_sources(cfg, base_dir)?;
    let needs_clang = sources
        .iter()
        .any(|s| matches!(s, UnitSource::Source { .. }));

    let _guard = CLANG.lock().unwrap_or_else(PoisonError::into_inner);
    let clang = if needs_clang {
        Some(Clang::new().map_err(|e| anyhow::anyhow!("failed to initialize libclang: {e}"))?)
    } else {
        None
    };
    let index = clang.as_ref().map(|c| Index::new(c, false, false));

    let mut units = Vec::with_capacity(sources.len());
    for source in &sources {
        let loaded = match (source, &index) {
            (UnitSource::Json(path), _) => load_json_unit(path),
            (UnitSource::Source { path, args }, Some(index)) => lower_source(index, path, args),
            (UnitSource::Source { path, .. }, None) => {
                anyhow::bail!("no libclang instance for {}", path.display())
            }
        };
        match loaded {
            Ok(unit) => units.push(unit),
            Err(e) if !cfg.strict => warn!(err = %format!("{e:#}"), "skipping unit"),
            Err(e) => return Err(e),
        }
    }
    info!(units = units.len(), "loaded translation units");
    Ok(units)
}

/// Reads a unit lowered by an external driver.
pub fn load_json_unit(path: &Path) -> Result<TranslationUnit> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading unit {}", path.display()))?;
    let unit: TranslationUnit = serde_json::from_str(&text)
        .with_context(|| format!("parsing unit {}", path.display()))?;
    unit.validate()
        .with_context(|| format!("validating unit {}", path.display()))?;
    debug!(path = %path.display(), decls = unit.decls.len(), "loaded JSON unit");
    Ok(unit)
}

/// Parses `source` with libclang and lowers it.
pub fn lower_source(index: &Index, source: &Path, args: &[String]) -> Result<TranslationUnit> {
    debug!(source = %source.display(), args = ?args, "parsing unit");
    let tu = index
        .parser(source)
        .arguments(args)
        .parse()
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {:?}", source.display(), e))?;

    for d in tu.get_diagnostics() {
        if matches!(d.get_severity(), Severity::Error | Severity::Fatal) {
            warn!(source = %source.display(), diag = %d.get_text(), "clang error");
        }
    }

    let mut lowering = Lowering::new(&source.display().to_string());
    for e in tu.get_entity().get_children() {
        lowering.top_level(e);
    }
    let unit = lowering.b.finish();
    info!(
        source = %source.display(),
        decls = unit.decls.len(),
        exprs = unit.exprs.len(),
        stmts = unit.stmts.len(),
        "lowered unit"
    );
    Ok(unit)
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

struct Lowering<'tu> {
    b: AstBuilder,
    /// Functions and variables by entity; tags and typedefs by canonical entity.
    decls: HashMap<Entity<'tu>, DeclId>,
    top: HashSet<DeclId>,
    /// Function whose body is being lowered.
    function: Option<DeclId>,
}

fn is_record_kind(kind: EntityKind) -> bool {
    matches!(
        kind,
        EntityKind::StructDecl | EntityKind::UnionDecl | EntityKind::ClassDecl
    )
}

fn is_function_kind(kind: EntityKind) -> bool {
    matches!(
        kind,
        EntityKind::FunctionDecl
            | EntityKind::Method
            | EntityKind::Constructor
            | EntityKind::Destructor
            | EntityKind::ConversionFunction
            | EntityKind::FunctionTemplate
    )
}

fn spellings(e: &Entity<'_>) -> Vec<String> {
    e.get_range()
        .map(|r| r.tokenize().iter().map(|t| t.get_spelling()).collect())
        .unwrap_or_default()
}

fn operands<'tu>(e: &Entity<'tu>) -> Vec<Entity<'tu>> {
    e.get_children()
        .into_iter()
        .filter(|c| c.is_expression())
        .collect()
}

fn has_location(e: &Entity<'_>) -> bool {
    e.get_location()
        .and_then(|l| l.get_file_location().file)
        .is_some()
}

fn linkage_of(e: &Entity<'_>) -> Linkage {
    match e.get_linkage() {
        Some(ClangLinkage::External) | Some(ClangLinkage::UniqueExternal) => Linkage::External,
        Some(ClangLinkage::Internal) => Linkage::Internal,
        _ => Linkage::None,
    }
}

/// Spelling without qualifier keywords.
fn unqualified_spelling(ty: &ClangType<'_>) -> String {
    ty.get_display_name()
        .split_whitespace()
        .filter(|w| !matches!(*w, "const" | "volatile" | "restrict" | "__restrict"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn prefix_op(tok: &str) -> Option<UnaryOp> {
    Some(match tok {
        "*" => UnaryOp::Deref,
        "&" => UnaryOp::AddrOf,
        "+" => UnaryOp::Plus,
        "-" => UnaryOp::Minus,
        "~" => UnaryOp::Not,
        "!" => UnaryOp::LNot,
        "++" => UnaryOp::PreInc,
        "--" => UnaryOp::PreDec,
        "__real__" | "__real" => UnaryOp::Real,
        "__imag__" | "__imag" => UnaryOp::Imag,
        "__extension__" => UnaryOp::Extension,
        _ => return None,
    })
}

/// Which of init, condition and increment a `for` header spells out.
/// libclang omits absent parts from the children.
fn for_header(tokens: &[String]) -> (bool, bool, bool) {
    let mut depth = 0i32;
    let mut semis = Vec::new();
    let mut close = tokens.len();
    for (i, t) in tokens.iter().enumerate().skip(1) {
        match t.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => {
                depth -= 1;
                if depth == 0 {
                    close = i;
                    break;
                }
            }
            ";" if depth == 1 => semis.push(i),
            _ => {}
        }
    }
    let [a, b] = semis[..] else {
        return (true, true, true);
    };
    (a > 2, b > a + 1, close > b + 1)
}

/// Splits `A<x, y>` into its top-level template argument spellings.
fn template_arg_spellings(display: &str) -> Vec<String> {
    let (Some(open), Some(close)) = (display.find('<'), display.rfind('>')) else {
        return Vec::new();
    };
    if close <= open {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut cur = String::new();
    for c in display[open + 1..close].chars() {
        match c {
            '<' | '(' => depth += 1,
            '>' | ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(cur.trim().to_string());
                cur.clear();
                continue;
            }
            _ => {}
        }
        cur.push(c);
    }
    out.push(cur.trim().to_string());
    out
}

/// Unnamed fields leading to the first field matching `target`, then that field.
fn field_path(
    tu: &TranslationUnit,
    record: DeclId,
    target: &dyn Fn(DeclId, &Decl) -> bool,
) -> Option<Vec<DeclId>> {
    let (_, r) = tu.record_definition(record)?;
    for &m in &r.members {
        let d = tu.decl(m);
        if !matches!(d.kind, DeclKind::Field(_)) {
            continue;
        }
        if target(m, d) {
            return Some(vec![m]);
        }
        if let Some(anon) = tu.anonymous_member(m)
            && let Some(mut rest) = field_path(tu, anon, target)
        {
            rest.insert(0, m);
            return Some(rest);
        }
    }
    None
}

fn builtin_class(kind: ClangTypeKind) -> BuiltinClass {
    match kind {
        ClangTypeKind::Void => BuiltinClass::Void,
        ClangTypeKind::Bool => BuiltinClass::Bool,
        ClangTypeKind::CharU
        | ClangTypeKind::UChar
        | ClangTypeKind::Char16
        | ClangTypeKind::Char32
        | ClangTypeKind::UShort
        | ClangTypeKind::UInt
        | ClangTypeKind::ULong
        | ClangTypeKind::ULongLong
        | ClangTypeKind::UInt128 => BuiltinClass::Unsigned,
        ClangTypeKind::Float | ClangTypeKind::Double | ClangTypeKind::LongDouble => {
            BuiltinClass::Floating
        }
        ClangTypeKind::Nullptr => BuiltinClass::Other,
        _ => BuiltinClass::Signed,
    }
}

/// Cast kind between two lowered types.
fn cast_kind(tu: &TranslationUnit, from: TyId, to: TyId) -> CastKind {
    let f = tu.resolve(from);
    let t = tu.resolve(to);
    if f == t {
        return CastKind::NoOp;
    }
    let class = |ty: TyId| match tu.ty(ty).kind {
        TypeKind::Builtin { class } => Some(class),
        _ => None,
    };
    if class(t) == Some(BuiltinClass::Void) {
        return CastKind::ToVoid;
    }
    let floating = |ty: TyId| class(ty) == Some(BuiltinClass::Floating);
    match (&tu.ty(f).kind, &tu.ty(t).kind) {
        (
            TypeKind::ConstantArray { .. }
            | TypeKind::IncompleteArray { .. }
            | TypeKind::VariableArray { .. },
            TypeKind::Pointer { .. },
        ) => CastKind::ArrayToPointerDecay,
        (TypeKind::Function { .. }, TypeKind::Pointer { .. }) => CastKind::FunctionToPointerDecay,
        (TypeKind::Pointer { .. }, TypeKind::Pointer { .. }) => CastKind::BitCast,
        (TypeKind::Builtin { .. } | TypeKind::Enum { .. }, TypeKind::Pointer { .. }) => {
            CastKind::IntegralToPointer
        }
        (TypeKind::Pointer { .. }, TypeKind::Builtin { .. }) => CastKind::PointerToIntegral,
        (TypeKind::Builtin { .. }, TypeKind::Builtin { .. }) => match (floating(f), floating(t)) {
            (true, true) => CastKind::FloatingCast,
            (false, true) => CastKind::IntegralToFloating,
            (true, false) => CastKind::FloatingToIntegral,
            (false, false) => CastKind::IntegralCast,
        },
        (TypeKind::Enum { .. }, TypeKind::Builtin { .. })
        | (TypeKind::Builtin { .. }, TypeKind::Enum { .. }) => {
            CastKind::IntegralCast
        }
        _ => CastKind::Other,
    }
}

impl<'tu> Lowering<'tu> {
    fn new(main_file: &str) -> Self {
        Lowering {
            b: AstBuilder::new(main_file),
            decls: HashMap::new(),
            top: HashSet::new(),
            function: None,
        }
    }

    /// Moves the builder to `e` and returns its location.
    fn loc(&mut self, e: &Entity<'tu>) -> SourceLoc {
        let main = self.b.unit().main_file;
        let Some(l) = e.get_location().map(|l| l.get_file_location()) else {
            return SourceLoc {
                file: main,
                line: 0,
                column: 0,
            };
        };
        let file = match l.file {
            Some(f) => self.b.file(&f.get_path().display().to_string()),
            None => main,
        };
        self.b.at(file, l.line, l.column);
        SourceLoc {
            file,
            line: l.line,
            column: l.column,
        }
    }

    fn push_decl(
        &mut self,
        e: &Entity<'tu>,
        name: String,
        parent: Option<DeclId>,
        kind: DeclKind,
    ) -> DeclId {
        let loc = self.loc(e);
        self.b.push_decl(Decl {
            name,
            loc,
            parent,
            implicit: !has_location(e),
            kind,
        })
    }

    fn push_top(&mut self, d: DeclId) {
        if self.top.insert(d) {
            self.b.add_top_level(d);
        }
    }

    /// Enclosing function of a tag declared in a body.
    fn scope_of(&self, e: &Entity<'tu>) -> Option<DeclId> {
        let mut cur = e.get_semantic_parent();
        while let Some(p) = cur {
            if is_function_kind(p.get_kind()) {
                return self.function;
            }
            if p.get_kind() == EntityKind::TranslationUnit {
                return None;
            }
            cur = p.get_semantic_parent();
        }
        None
    }

    fn top_level(&mut self, e: Entity<'tu>) {
        match e.get_kind() {
            EntityKind::Namespace | EntityKind::LinkageSpec | EntityKind::UnexposedDecl => {
                for c in e.get_children() {
                    self.top_level(c);
                }
                return;
            }
            _ => {}
        }
        // System declarations are lowered on first use.
        if e.is_in_system_header() {
            return;
        }
        if let Some(d) = self.declaration(e) {
            self.push_top(d);
        }
    }

    fn declaration(&mut self, e: Entity<'tu>) -> Option<DeclId> {
        match e.get_kind() {
            EntityKind::FunctionTemplate => Some(self.function_template(e)),
            k if is_function_kind(k) => Some(self.function(e)),
            EntityKind::VarDecl => Some(self.variable(e)),
            k if is_record_kind(k) => Some(self.record(e)),
            EntityKind::EnumDecl => Some(self.enumeration(e)),
            EntityKind::TypedefDecl | EntityKind::TypeAliasDecl => Some(self.typedef(e)),
            EntityKind::EnumConstantDecl => {
                if let Some(parent) = e.get_semantic_parent() {
                    self.enumeration(parent);
                }
                self.decls.get(&e).copied()
            }
            EntityKind::FieldDecl => {
                if let Some(parent) = e.get_semantic_parent() {
                    self.record(parent);
                }
                self.decls.get(&e).copied()
            }
            EntityKind::ParmDecl => self.decls.get(&e).copied(),
            _ => None,
        }
    }

    // -- declarations -------------------------------------------------------

    fn function(&mut self, e: Entity<'tu>) -> DeclId {
        if let Some(d) = self.decls.get(&e) {
            return *d;
        }
        let first = e.get_canonical_entity();
        let canonical = (first != e).then(|| self.function(first));
        let ty = match e.get_type() {
            Some(t) => self.ty(t),
            None => self.b.unsupported_type("function without type"),
        };
        let method_of = match e.get_semantic_parent() {
            Some(p) if is_record_kind(p.get_kind()) => {
                let r = self.record(p);
                self.b.unit().record(r).map(|r| r.ty)
            }
            _ => None,
        };
        let id = self.push_decl(
            &e,
            e.get_name().unwrap_or_default(),
            None,
            DeclKind::Function(FunctionDecl {
                ty,
                params: Vec::new(),
                body: None,
                canonical,
                linkage: linkage_of(&e),
                is_inline: e.is_inline_function(),
                method_of,
                template: None,
            }),
        );
        self.decls.insert(e, id);

        let mut params = Vec::new();
        // Templates do not expose their arguments; read the parameter cursors.
        let args = e.get_arguments().unwrap_or_else(|| {
            e.get_children()
                .into_iter()
                .filter(|c| c.get_kind() == EntityKind::ParmDecl)
                .collect()
        });
        for (i, p) in args.into_iter().enumerate() {
            let pty = match p.get_type() {
                Some(t) => self.ty(t),
                None => self.b.int(),
            };
            let pid = self.push_decl(
                &p,
                p.get_name().unwrap_or_default(),
                Some(id),
                DeclKind::Param(ParamDecl {
                    ty: pty,
                    index: i as u32,
                }),
            );
            self.decls.insert(p, pid);
            params.push(pid);
        }
        let template = e.get_template().map(|t| self.function_template(t));
        if let DeclKind::Function(f) = &mut self.b.decl_mut(id).kind {
            f.params = params;
            f.template = template;
        }

        if e.is_definition()
            && let Some(body) = e
                .get_children()
                .into_iter()
                .find(|c| c.get_kind() == EntityKind::CompoundStmt)
        {
            let outer = self.function.replace(id);
            let s = self.stmt(body);
            self.function = outer;
            self.b.set_body(id, s);
        }
        id
    }

    /// A template and its pattern function.
    fn function_template(&mut self, e: Entity<'tu>) -> DeclId {
        if let Some(d) = self.decls.get(&e)
            && matches!(
                self.b.unit().decl(*d).kind,
                DeclKind::FunctionTemplate { .. }
            )
        {
            return *d;
        }
        let pattern = self.function(e);
        let t = self.push_decl(
            &e,
            e.get_name().unwrap_or_default(),
            None,
            DeclKind::FunctionTemplate { pattern },
        );
        if let DeclKind::Function(f) = &mut self.b.decl_mut(pattern).kind {
            f.template = Some(t);
        }
        self.decls.insert(e, t);
        t
    }

    fn variable(&mut self, e: Entity<'tu>) -> DeclId {
        if let Some(d) = self.decls.get(&e) {
            return *d;
        }
        let first = e.get_canonical_entity();
        let canonical = (first != e).then(|| self.variable(first));
        let ty = match e.get_type() {
            Some(t) => self.ty(t),
            None => self.b.int(),
        };
        let in_function = e
            .get_semantic_parent()
            .is_some_and(|p| is_function_kind(p.get_kind()));
        let class = e.get_storage_class();
        let (storage, linkage) = match (in_function, class) {
            (true, Some(StorageClass::Static)) => (StorageKind::StaticLocal, Linkage::Internal),
            (true, Some(StorageClass::Extern)) => (StorageKind::Global, linkage_of(&e)),
            (true, _) => (StorageKind::Local, Linkage::None),
            (false, _) => (StorageKind::Global, linkage_of(&e)),
        };
        let is_definition = e.is_definition() || class != Some(StorageClass::Extern);
        let parent = if in_function { self.function } else { None };
        let id = self.push_decl(
            &e,
            e.get_name().unwrap_or_default(),
            parent,
            DeclKind::Var(VarDecl {
                ty,
                init: None,
                linkage,
                storage,
                canonical,
                is_definition,
            }),
        );
        self.decls.insert(e, id);

        let has_init = spellings(&e).iter().any(|t| t == "=");
        if has_init && let Some(init) = operands(&e).into_iter().last() {
            let init = self.expr(init);
            self.b.set_init(id, init);
        }
        id
    }

    fn record(&mut self, e: Entity<'tu>) -> DeclId {
        let key = e.get_canonical_entity();
        if let Some(d) = self.decls.get(&key) {
            return *d;
        }
        let tag = match e.get_kind() {
            EntityKind::UnionDecl => TagKind::Union,
            EntityKind::ClassDecl => TagKind::Class,
            _ => TagKind::Struct,
        };
        let name = if e.is_anonymous() {
            String::new()
        } else {
            e.get_name().unwrap_or_default()
        };
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
        let def = e.get_definition();
        let site = def.unwrap_or(e);
        let parent = self.scope_of(&e);
        let next = self.b.next_decl();
        let ty = self.b.nominal(Type {
            kind: TypeKind::Record { decl: next },
            quals: Qualifiers::NONE,
            size: None,
            spelling,
        });
        let id = self.push_decl(
            &site,
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
        );
        self.decls.insert(key, id);
        if let Some(def) = def {
            self.members(id, ty, def);
        }
        id
    }

    fn members(&mut self, id: DeclId, ty: TyId, def: Entity<'tu>) {
        let mut members = Vec::new();
        let mut methods = Vec::new();
        for c in def.get_children() {
            match c.get_kind() {
                EntityKind::FieldDecl => {
                    let fty = match c.get_type() {
                        Some(t) => self.ty(t),
                        None => self.b.int(),
                    };
                    let f = self.push_decl(
                        &c,
                        c.get_name().unwrap_or_default(),
                        Some(id),
                        DeclKind::Field(FieldDecl {
                            ty: fty,
                            offset_bits: c.get_offset_of_field().map_or(0, |o| o as u64),
                            bit_width: c.get_bit_field_width().map(|w| w as u32),
                            init: None,
                        }),
                    );
                    self.decls.insert(c, f);
                    members.push(f);
                }
                k if is_record_kind(k) => {
                    let nested = self.record(c);
                    members.push(nested);
                    // The unnamed field of an anonymous member is implicit
                    // and never visited.
                    if c.is_anonymous_record_decl() {
                        let offset_bits = self.anonymous_offset(def, nested);
                        let nty = self
                            .b
                            .unit()
                            .record(nested)
                            .map(|r| r.ty)
                            .unwrap_or(ty);
                        let f = self.push_decl(
                            &c,
                            String::new(),
                            Some(id),
                            DeclKind::Field(FieldDecl {
                                ty: nty,
                                offset_bits,
                                bit_width: None,
                                init: None,
                            }),
                        );
                        members.push(f);
                    }
                }
                EntityKind::EnumDecl => members.push(self.enumeration(c)),
                k if is_function_kind(k) || k == EntityKind::VarDecl => methods.push(c),
                _ => {}
            }
        }
        let size = def.get_type().and_then(|t| t.get_sizeof().ok());
        if let DeclKind::Record(r) = &mut self.b.decl_mut(id).kind {
            r.members = members;
            r.complete = true;
        }
        self.b.type_mut(ty).size = size.map(|s| s as u64);
        for m in methods {
            if let Some(d) = self.declaration(m) {
                self.push_top(d);
            }
        }
    }

    /// Offset of an anonymous member inside `parent`, from its first named field.
    fn anonymous_offset(&self, parent: Entity<'tu>, anon: DeclId) -> u64 {
        let tu = self.b.unit();
        let Some(r) = tu.record(anon) else {
            return 0;
        };
        let first = r.members.iter().find_map(|m| match &tu.decl(*m).kind {
            DeclKind::Field(f) if !tu.decl(*m).name.is_empty() => {
                Some((tu.decl(*m).name.clone(), f.offset_bits))
            }
            _ => None,
        });
        let Some((name, inner)) = first else {
            return 0;
        };
        parent
            .get_type()
            .and_then(|t| t.get_offsetof(&name).ok())
            .map_or(0, |o| (o as u64).saturating_sub(inner))
    }

    fn enumeration(&mut self, e: Entity<'tu>) -> DeclId {
        let key = e.get_canonical_entity();
        if let Some(d) = self.decls.get(&key) {
            return *d;
        }
        let name = if e.is_anonymous() {
            String::new()
        } else {
            e.get_name().unwrap_or_default()
        };
        let def = e.get_definition();
        let site = def.unwrap_or(e);
        let underlying = match site.get_enum_underlying_type() {
            Some(t) => self.ty(t),
            None => self.b.builtin("unsigned int", 4),
        };
        let size = site
            .get_type()
            .and_then(|t| t.get_sizeof().ok())
            .map(|s| s as u64);
        let parent = self.scope_of(&e);
        let spelling = if name.is_empty() {
            "enum (anonymous)".to_string()
        } else {
            format!("enum {name}")
        };
        let next = self.b.next_decl();
        let ty = self.b.nominal(Type {
            kind: TypeKind::Enum { decl: next },
            quals: Qualifiers::NONE,
            size,
            spelling,
        });
        let id = self.push_decl(
            &site,
            name,
            parent,
            DeclKind::Enum(EnumDecl {
                ty,
                underlying,
                constants: Vec::new(),
                complete: def.is_some(),
            }),
        );
        self.decls.insert(key, id);

        let mut constants = Vec::new();
        for c in site.get_children() {
            if c.get_kind() != EntityKind::EnumConstantDecl {
                continue;
            }
            let value = c.get_enum_constant_value().map_or(0, |(v, _)| v);
            let k = self.push_decl(
                &c,
                c.get_name().unwrap_or_default(),
                Some(id),
                DeclKind::EnumConstant { value },
            );
            self.decls.insert(c, k);
            constants.push(k);
        }
        if let DeclKind::Enum(en) = &mut self.b.decl_mut(id).kind {
            en.constants = constants;
        }
        id
    }

    fn typedef(&mut self, e: Entity<'tu>) -> DeclId {
        let key = e.get_canonical_entity();
        if let Some(d) = self.decls.get(&key) {
            return *d;
        }
        let name = e.get_name().unwrap_or_default();
        let underlying = match e.get_typedef_underlying_type() {
            Some(t) => self.ty(t),
            None => self.b.unsupported_type("typedef without underlying type"),
        };
        let size = self.b.unit().ty(underlying).size;
        let parent = self.scope_of(&e);
        let next = self.b.next_decl();
        let ty = self.b.nominal(Type {
            kind: TypeKind::Typedef { decl: next },
            quals: Qualifiers::NONE,
            size,
            spelling: name.clone(),
        });
        let id = self.push_decl(
            &e,
            name.clone(),
            parent,
            DeclKind::Typedef { underlying, ty },
        );
        self.decls.insert(key, id);

        if let Some(rec) = self.b.unit().record_of(underlying)
            && self.b.unit().decl(rec).name.is_empty()
            && let DeclKind::Record(r) = &mut self.b.decl_mut(rec).kind
            && r.typedef_name.is_none()
        {
            r.typedef_name = Some(name);
        }
        id
    }

    fn local_decl(&mut self, c: Entity<'tu>) -> Option<DeclId> {
        match c.get_kind() {
            EntityKind::StaticAssert => None,
            _ => match self.declaration(c) {
                Some(d) => Some(d),
                None => {
                    let what = format!("{:?}", c.get_kind());
                    Some(self.push_decl(
                        &c,
                        c.get_name().unwrap_or_default(),
                        self.function,
                        DeclKind::Unsupported { what },
                    ))
                }
            },
        }
    }

    // -- types --------------------------------------------------------------

    fn ty(&mut self, t: ClangType<'tu>) -> TyId {
        let base = self.ty_unqualified(t);
        let quals = Qualifiers {
            is_const: t.is_const_qualified(),
            is_volatile: t.is_volatile_qualified(),
            is_restrict: t.is_restrict_qualified(),
        };
        if quals.is_empty() {
            base
        } else {
            self.b.qualified(base, quals)
        }
    }

    fn ty_or_unsupported(&mut self, t: Option<ClangType<'tu>>, what: &str) -> TyId {
        match t {
            Some(t) => self.ty(t),
            None => self.b.unsupported_type(what),
        }
    }

    fn ty_unqualified(&mut self, t: ClangType<'tu>) -> TyId {
        match t.get_kind() {
            ClangTypeKind::Void
            | ClangTypeKind::Bool
            | ClangTypeKind::CharS
            | ClangTypeKind::CharU
            | ClangTypeKind::SChar
            | ClangTypeKind::UChar
            | ClangTypeKind::WChar
            | ClangTypeKind::Char16
            | ClangTypeKind::Char32
            | ClangTypeKind::Short
            | ClangTypeKind::UShort
            | ClangTypeKind::Int
            | ClangTypeKind::UInt
            | ClangTypeKind::Long
            | ClangTypeKind::ULong
            | ClangTypeKind::LongLong
            | ClangTypeKind::ULongLong
            | ClangTypeKind::Int128
            | ClangTypeKind::UInt128
            | ClangTypeKind::Float
            | ClangTypeKind::Double
            | ClangTypeKind::LongDouble
            | ClangTypeKind::Nullptr => {
                let size = t.get_sizeof().map_or(0, |s| s as u64);
                self.b
                    .builtin_of(&unqualified_spelling(&t), size, builtin_class(t.get_kind()))
            }
            ClangTypeKind::Pointer => {
                let p = self.ty_or_unsupported(t.get_pointee_type(), "pointer without pointee");
                self.b.pointer(p)
            }
            ClangTypeKind::LValueReference | ClangTypeKind::RValueReference => {
                let pointee =
                    self.ty_or_unsupported(t.get_pointee_type(), "reference without pointee");
                let kind = if t.get_kind() == ClangTypeKind::LValueReference {
                    TypeKind::LValueReference { pointee }
                } else {
                    TypeKind::RValueReference { pointee }
                };
                self.b.intern(Type {
                    kind,
                    quals: Qualifiers::NONE,
                    size: Some(8),
                    spelling: unqualified_spelling(&t),
                })
            }
            ClangTypeKind::ConstantArray => {
                let el = self.ty_or_unsupported(t.get_element_type(), "array without element");
                self.b.array(el, t.get_size().map_or(0, |s| s as u64))
            }
            ClangTypeKind::IncompleteArray => {
                let el = self.ty_or_unsupported(t.get_element_type(), "array without element");
                self.b.incomplete_array(el)
            }
            ClangTypeKind::VariableArray | ClangTypeKind::DependentSizedArray => {
                let element =
                    self.ty_or_unsupported(t.get_element_type(), "array without element");
                let spelling = format!("{}[*]", self.b.unit().ty(element).spelling);
                self.b.intern(Type {
                    kind: TypeKind::VariableArray {
                        element,
                        size: None,
                    },
                    quals: Qualifiers::NONE,
                    size: None,
                    spelling,
                })
            }
            ClangTypeKind::Vector => {
                let element =
                    self.ty_or_unsupported(t.get_element_type(), "vector without element");
                self.b.intern(Type {
                    kind: TypeKind::Vector {
                        element,
                        count: t.get_size().map_or(0, |s| s as u64),
                    },
                    quals: Qualifiers::NONE,
                    size: t.get_sizeof().ok().map(|s| s as u64),
                    spelling: unqualified_spelling(&t),
                })
            }
            ClangTypeKind::Record => match t.get_declaration() {
                Some(d) => {
                    let r = self.record(d);
                    self.b
                        .unit()
                        .record(r)
                        .map(|r| r.ty)
                        .unwrap_or_else(|| self.b.unsupported_type("record"))
                }
                None => self.b.unsupported_type(&unqualified_spelling(&t)),
            },
            ClangTypeKind::Enum => match t.get_declaration() {
                Some(d) => {
                    let en = self.enumeration(d);
                    match &self.b.unit().decl(en).kind {
                        DeclKind::Enum(x) => x.ty,
                        _ => self.b.unsupported_type("enum"),
                    }
                }
                None => self.b.unsupported_type(&unqualified_spelling(&t)),
            },
            ClangTypeKind::Typedef => match t.get_declaration() {
                Some(d) => {
                    let td = self.typedef(d);
                    match &self.b.unit().decl(td).kind {
                        DeclKind::Typedef { ty, .. } => *ty,
                        _ => self.b.unsupported_type("typedef"),
                    }
                }
                None => self.b.unsupported_type(&unqualified_spelling(&t)),
            },
            ClangTypeKind::Elaborated => {
                self.ty_or_unsupported(t.get_elaborated_type(), "elaborated type")
            }
            ClangTypeKind::Attributed => {
                self.ty_or_unsupported(t.get_modified_type(), "attributed type")
            }
            ClangTypeKind::FunctionPrototype | ClangTypeKind::FunctionNoPrototype => {
                let ret = self.ty_or_unsupported(t.get_result_type(), "function without result");
                let params: Vec<TyId> = t
                    .get_argument_types()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| self.ty(a))
                    .collect();
                self.b.function_type(ret, &params, t.is_variadic())
            }
            ClangTypeKind::MemberPointer => {
                let pointee =
                    self.ty_or_unsupported(t.get_pointee_type(), "member pointer without pointee");
                let class = self.ty_or_unsupported(t.get_class_type(), "member pointer class");
                self.b.intern(Type {
                    kind: TypeKind::MemberPointer { pointee, class },
                    quals: Qualifiers::NONE,
                    size: t.get_sizeof().ok().map(|s| s as u64),
                    spelling: unqualified_spelling(&t),
                })
            }
            _ => self.sugar_or_specialization(t),
        }
    }

    /// Template specializations keep their arguments; other unexposed sugar
    /// lowers to its canonical type.
    fn sugar_or_specialization(&mut self, t: ClangType<'tu>) -> TyId {
        let display = unqualified_spelling(&t);
        if let Some(args) = t.get_template_argument_types()
            && !args.is_empty()
        {
            let texts = template_arg_spellings(&display);
            let args = args
                .into_iter()
                .enumerate()
                .map(|(i, a)| match a {
                    Some(a) => TemplateArg::Type(self.ty(a)),
                    None => {
                        let text = texts.get(i).cloned().unwrap_or_default();
                        match text.parse::<i64>() {
                            Ok(v) => TemplateArg::Integral(v),
                            Err(_) => TemplateArg::Expression(text),
                        }
                    }
                })
                .collect();
            let canonical = t.get_canonical_type();
            let aliased = (canonical != t && canonical.get_kind() != t.get_kind())
                .then(|| self.ty(canonical));
            let template = display.split('<').next().unwrap_or("").trim().to_string();
            return self.b.intern(Type {
                kind: TypeKind::TemplateSpecialization {
                    template,
                    args,
                    aliased,
                },
                quals: Qualifiers::NONE,
                size: t.get_sizeof().ok().map(|s| s as u64),
                spelling: display,
            });
        }
        let canonical = t.get_canonical_type();
        if canonical.get_kind() != t.get_kind() {
            return self.ty(canonical);
        }
        self.b.unsupported_type(&format!("{:?} {display}", t.get_kind()))
    }

    // -- expressions --------------------------------------------------------

    fn expr(&mut self, e: Entity<'tu>) -> ExprId {
        let ty = match e.get_type() {
            Some(t) => self.ty(t),
            _ => self.b.int(),
        };
        let kind = self.expr_kind(e, ty);
        self.loc(&e);
        self.b.expr(kind, ty)
    }

    fn unsupported(e: &Entity<'tu>) -> ExprKind {
        ExprKind::Unsupported {
            what: format!("{:?}", e.get_kind()),
        }
    }

    fn expr_kind(&mut self, e: Entity<'tu>, ty: TyId) -> ExprKind {
        let ops = operands(&e);
        match e.get_kind() {
            EntityKind::IntegerLiteral
            | EntityKind::BoolLiteralExpr
            | EntityKind::NullPtrLiteralExpr => ExprKind::IntLit {
                value: match e.evaluate() {
                    Some(EvaluationResult::SignedInteger(v)) => v as u64,
                    Some(EvaluationResult::UnsignedInteger(v)) => v,
                    _ => 0,
                },
            },
            EntityKind::CharacterLiteral => ExprKind::CharLit {
                value: match e.evaluate() {
                    Some(EvaluationResult::SignedInteger(v)) => v as u32,
                    Some(EvaluationResult::UnsignedInteger(v)) => v as u32,
                    _ => 0,
                },
            },
            EntityKind::FloatingLiteral => ExprKind::FloatLit {
                value: match e.evaluate() {
                    Some(EvaluationResult::Float(v)) => v,
                    _ => 0.0,
                },
            },
            EntityKind::StringLiteral => {
                let raw = e.get_display_name().unwrap_or_default();
                let value = match (raw.find('"'), raw.rfind('"')) {
                    (Some(a), Some(b)) if b > a => raw[a + 1..b].to_string(),
                    _ => raw,
                };
                ExprKind::StringLit { value }
            }
            EntityKind::DeclRefExpr => self.decl_ref(e),
            EntityKind::MemberRefExpr => self.member(e, ops.first().copied()),
            EntityKind::CallExpr => {
                let callee = match ops.first() {
                    Some(c) => self.expr(*c),
                    None => self.b.unresolved(&e.get_name().unwrap_or_default()),
                };
                let args = e
                    .get_arguments()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| self.expr(a))
                    .collect();
                ExprKind::Call { callee, args }
            }
            EntityKind::ParenExpr => match ops.first() {
                Some(s) => ExprKind::Paren { sub: self.expr(*s) },
                None => Self::unsupported(&e),
            },
            EntityKind::UnaryOperator => self.unary(&e, &ops),
            EntityKind::UnaryExpr => self.unary_expr(&e, &ops),
            EntityKind::BinaryOperator | EntityKind::CompoundAssignOperator => {
                self.binary(&e, &ops)
            }
            EntityKind::ConditionalOperator => match ops[..] {
                [c, t, o] => ExprKind::Conditional {
                    cond: self.expr(c),
                    then: self.expr(t),
                    otherwise: self.expr(o),
                },
                _ => Self::unsupported(&e),
            },
            EntityKind::CStyleCastExpr
            | EntityKind::StaticCastExpr
            | EntityKind::ReinterpretCastExpr
            | EntityKind::ConstCastExpr
            | EntityKind::FunctionalCastExpr => match ops.last() {
                Some(s) => {
                    let sub = self.expr(*s);
                    let cast = cast_kind(self.b.unit(), self.b.unit().expr(sub).ty, ty);
                    ExprKind::Cast {
                        sub,
                        cast,
                        explicit: true,
                    }
                }
                None => Self::unsupported(&e),
            },
            EntityKind::ArraySubscriptExpr => match ops[..] {
                [base, index] => ExprKind::Subscript {
                    base: self.expr(base),
                    index: self.expr(index),
                },
                _ => Self::unsupported(&e),
            },
            EntityKind::InitListExpr => ExprKind::InitList {
                inits: ops.into_iter().map(|c| self.expr(c)).collect(),
            },
            EntityKind::CompoundLiteralExpr => match ops.last() {
                Some(init) => ExprKind::CompoundLiteral {
                    init: self.expr(*init),
                },
                None => Self::unsupported(&e),
            },
            EntityKind::StmtExpr => match e
                .get_children()
                .into_iter()
                .find(|c| c.get_kind() == EntityKind::CompoundStmt)
            {
                Some(body) => ExprKind::StmtExpr {
                    body: self.stmt(body),
                },
                None => Self::unsupported(&e),
            },
            EntityKind::UnexposedExpr => match ops[..] {
                // Mostly implicit conversions.
                [sub] => {
                    let sub = self.expr(sub);
                    let cast = cast_kind(self.b.unit(), self.b.unit().expr(sub).ty, ty);
                    ExprKind::Cast {
                        sub,
                        cast,
                        explicit: false,
                    }
                }
                _ => match e.evaluate() {
                    Some(EvaluationResult::SignedInteger(v)) => ExprKind::IntLit { value: v as u64 },
                    Some(EvaluationResult::UnsignedInteger(v)) => ExprKind::IntLit { value: v },
                    Some(EvaluationResult::Float(v)) => ExprKind::FloatLit { value: v },
                    _ => Self::unsupported(&e),
                },
            },
            _ => Self::unsupported(&e),
        }
    }

    fn decl_ref(&mut self, e: Entity<'tu>) -> ExprKind {
        let Some(target) = e.get_reference() else {
            return ExprKind::UnresolvedName {
                name: e.get_name().unwrap_or_default(),
            };
        };
        match self.declaration(target) {
            Some(d) => {
                let ast = self.b.unit();
                let file_scope = match &ast.decl(d).kind {
                    DeclKind::Function(_) | DeclKind::FunctionTemplate { .. } => {
                        ast.decl(d).parent.is_none()
                    }
                    DeclKind::Var(v) => v.storage == StorageKind::Global,
                    _ => false,
                };
                // Declarations first seen through a use still need a table entry.
                if file_scope {
                    self.push_top(d);
                }
                ExprKind::DeclRef { decl: d }
            }
            None => ExprKind::UnresolvedName {
                name: target.get_name().unwrap_or_default(),
            },
        }
    }

    fn member(&mut self, e: Entity<'tu>, base: Option<Entity<'tu>>) -> ExprKind {
        let Some(target) = e.get_reference() else {
            return Self::unsupported(&e);
        };
        if target.get_kind() != EntityKind::FieldDecl {
            // Method callee: bound statically to the method declaration.
            return match self.declaration(target) {
                Some(d) => ExprKind::DeclRef { decl: d },
                None => ExprKind::UnresolvedName {
                    name: target.get_name().unwrap_or_default(),
                },
            };
        }
        let Some(field) = self.declaration(target) else {
            return Self::unsupported(&e);
        };
        let Some(base) = base else {
            return ExprKind::Unsupported {
                what: "implicit member access".to_string(),
            };
        };
        let tokens = spellings(&e);
        let arrow = tokens.len() >= 2 && tokens[tokens.len() - 2] == "->";
        let mut base = self.expr(base);

        // Fields of anonymous members are reached through their unnamed fields.
        let ast = self.b.unit();
        let bty = ast.expr(base).ty;
        let outer = if arrow { ast.pointee(bty) } else { Some(bty) }.and_then(|t| ast.record_of(t));
        let path = outer.and_then(|r| field_path(ast, r, &|m: DeclId, _: &Decl| m == field));
        let mut arrow = arrow;
        if let Some(path) = path {
            for step in &path[..path.len() - 1] {
                base = self.b.member(base, *step, arrow);
                arrow = false;
            }
        }
        ExprKind::Member { base, field, arrow }
    }

    fn unary(&mut self, e: &Entity<'tu>, ops: &[Entity<'tu>]) -> ExprKind {
        let Some(sub) = ops.first() else {
            return Self::unsupported(e);
        };
        let tokens = spellings(e);
        let op = match tokens.first().and_then(|t| prefix_op(t)) {
            Some(op) => op,
            None => match tokens.last().map(String::as_str) {
                Some("++") => UnaryOp::PostInc,
                Some("--") => UnaryOp::PostDec,
                _ => return Self::unsupported(e),
            },
        };
        ExprKind::Unary {
            op,
            sub: self.expr(*sub),
        }
    }

    fn binary(&mut self, e: &Entity<'tu>, ops: &[Entity<'tu>]) -> ExprKind {
        let [lhs, rhs] = ops[..] else {
            return Self::unsupported(e);
        };
        let tokens = spellings(e);
        let skip = spellings(&lhs).len();
        let op = tokens
            .iter()
            .skip(skip)
            .find_map(|t| BinaryOp::from_spelling(t));
        let Some(op) = op else {
            return Self::unsupported(e);
        };
        ExprKind::Binary {
            op,
            lhs: self.expr(lhs),
            rhs: self.expr(rhs),
        }
    }

    /// `sizeof`, `alignof` and `offsetof`.
    fn unary_expr(&mut self, e: &Entity<'tu>, ops: &[Entity<'tu>]) -> ExprKind {
        let tokens = spellings(e);
        let keyword = tokens.first().map(String::as_str).unwrap_or("");
        if matches!(keyword, "offsetof" | "__builtin_offsetof") {
            return self.offset_of(e, ops, &tokens);
        }
        let type_ref = e
            .get_children()
            .into_iter()
            .find(|c| c.get_kind() == EntityKind::TypeRef)
            .and_then(|c| c.get_type());
        let arg = match (ops.first().and_then(|o| o.get_type()), type_ref) {
            (Some(t), _) | (None, Some(t)) => Some(self.ty(t)),
            (None, None) => None,
        };
        match (keyword, arg) {
            ("sizeof", Some(arg)) => ExprKind::SizeOf { arg },
            ("_Alignof" | "alignof" | "__alignof__" | "__alignof", Some(arg)) => {
                ExprKind::AlignOf { arg }
            }
            _ => match e.evaluate() {
                Some(EvaluationResult::SignedInteger(v)) => ExprKind::IntLit { value: v as u64 },
                Some(EvaluationResult::UnsignedInteger(v)) => ExprKind::IntLit { value: v },
                _ => Self::unsupported(e),
            },
        }
    }

    fn offset_of(&mut self, e: &Entity<'tu>, ops: &[Entity<'tu>], tokens: &[String]) -> ExprKind {
        let Some(record_ty) = e
            .get_children()
            .into_iter()
            .find(|c| c.get_kind() == EntityKind::TypeRef)
            .and_then(|c| c.get_type())
        else {
            return Self::unsupported(e);
        };
        let record = self.ty(record_ty);

        // The designator follows the first top-level comma.
        let mut depth = 0i32;
        let mut start = None;
        let mut end = tokens.len();
        for (i, t) in tokens.iter().enumerate() {
            match t.as_str() {
                "(" | "[" => depth += 1,
                ")" | "]" => {
                    depth -= 1;
                    if depth == 0 {
                        end = i;
                        break;
                    }
                }
                "," if depth == 1 && start.is_none() => start = Some(i + 1),
                _ => {}
            }
        }
        let Some(start) = start else {
            return Self::unsupported(e);
        };

        let mut indices = ops.iter().copied();
        let mut path = Vec::new();
        let mut cur = Some(record);
        let mut i = start;
        while i < end {
            match tokens[i].as_str() {
                "." => {}
                "[" => {
                    let mut d = 0i32;
                    while i < end {
                        match tokens[i].as_str() {
                            "[" => d += 1,
                            "]" => {
                                d -= 1;
                                if d == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        i += 1;
                    }
                    if let Some(ix) = indices.next() {
                        path.push(OffsetOfComponent::Index(self.expr(ix)));
                    }
                    cur = cur.and_then(|t| self.b.unit().pointee(t));
                }
                name => {
                    let ast = self.b.unit();
                    let Some(steps) = cur
                        .and_then(|t| ast.record_of(t))
                        .and_then(|r| field_path(ast, r, &|_: DeclId, d: &Decl| d.name == name))
                    else {
                        return ExprKind::Unsupported {
                            what: format!("offsetof designator `{name}`"),
                        };
                    };
                    cur = steps.last().and_then(|f| ast.decl_type(*f));
                    path.extend(steps.into_iter().map(OffsetOfComponent::Field));
                }
            }
            i += 1;
        }
        ExprKind::OffsetOf { record, path }
    }

    // -- statements ---------------------------------------------------------

    fn stmt(&mut self, e: Entity<'tu>) -> StmtId {
        let s = self.stmt_kind(e);
        self.loc(&e);
        self.b.stmt(s)
    }

    fn unsupported_stmt(e: &Entity<'tu>) -> Stmt {
        Stmt::Unsupported {
            what: format!("{:?}", e.get_kind()),
        }
    }

    fn stmt_kind(&mut self, e: Entity<'tu>) -> Stmt {
        let children = e.get_children();
        match e.get_kind() {
            EntityKind::CompoundStmt => Stmt::Compound {
                body: children.into_iter().map(|c| self.stmt(c)).collect(),
            },
            EntityKind::DeclStmt => Stmt::Decl {
                decls: children
                    .into_iter()
                    .filter_map(|c| self.local_decl(c))
                    .collect(),
            },
            EntityKind::ReturnStmt => Stmt::Return {
                value: operands(&e).first().map(|v| self.expr(*v)),
            },
            EntityKind::IfStmt => match children[..] {
                [c, t] => Stmt::If {
                    cond: self.expr(c),
                    then: self.stmt(t),
                    otherwise: None,
                },
                [c, t, o] => Stmt::If {
                    cond: self.expr(c),
                    then: self.stmt(t),
                    otherwise: Some(self.stmt(o)),
                },
                _ => Self::unsupported_stmt(&e),
            },
            EntityKind::WhileStmt => match children[..] {
                [c, b] => Stmt::While {
                    cond: self.expr(c),
                    body: self.stmt(b),
                },
                _ => Self::unsupported_stmt(&e),
            },
            EntityKind::DoStmt => match children[..] {
                [b, c] => Stmt::Do {
                    body: self.stmt(b),
                    cond: self.expr(c),
                },
                _ => Self::unsupported_stmt(&e),
            },
            EntityKind::SwitchStmt => match children[..] {
                [c, b] => Stmt::Switch {
                    cond: self.expr(c),
                    body: self.stmt(b),
                },
                _ => Self::unsupported_stmt(&e),
            },
            EntityKind::CaseStmt => match (children.first(), children.last()) {
                (Some(v), Some(b)) if children.len() >= 2 => Stmt::Case {
                    value: self.expr(*v),
                    body: self.stmt(*b),
                },
                _ => Self::unsupported_stmt(&e),
            },
            EntityKind::DefaultStmt => match children.last() {
                Some(b) => Stmt::Default { body: self.stmt(*b) },
                None => Self::unsupported_stmt(&e),
            },
            EntityKind::LabelStmt => match children.last() {
                Some(b) => Stmt::Label {
                    name: e.get_name().unwrap_or_default(),
                    body: self.stmt(*b),
                },
                None => Self::unsupported_stmt(&e),
            },
            EntityKind::GotoStmt => Stmt::Goto {
                label: spellings(&e).get(1).cloned().unwrap_or_default(),
            },
            EntityKind::BreakStmt => Stmt::Break,
            EntityKind::ContinueStmt => Stmt::Continue,
            EntityKind::NullStmt => Stmt::Null,
            EntityKind::ForStmt => self.for_stmt(&e, children),
            EntityKind::AsmStmt => Stmt::Asm {
                text: spellings(&e).join(" "),
                operands: operands(&e).into_iter().map(|o| self.expr(o)).collect(),
            },
            _ if e.is_expression() => Stmt::Expr {
                expr: self.expr(e),
            },
            _ => Self::unsupported_stmt(&e),
        }
    }

    fn for_stmt(&mut self, e: &Entity<'tu>, children: Vec<Entity<'tu>>) -> Stmt {
        let (has_init, has_cond, has_inc) = for_header(&spellings(e));
        let mut it = children.into_iter();
        let init = if has_init {
            it.next().map(|c| self.stmt(c))
        } else {
            None
        };
        let cond = if has_cond {
            it.next().map(|c| self.expr(c))
        } else {
            None
        };
        let inc = if has_inc {
            it.next().map(|c| self.expr(c))
        } else {
            None
        };
        match it.next() {
            Some(body) => Stmt::For {
                init,
                cond,
                inc,
                body: self.stmt(body),
            },
            None => Self::unsupported_stmt(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn for_header_detects_missing_parts() {
        assert_eq!(
            for_header(&toks("for ( i = 0 ; i < n ; i ++ ) { }")),
            (true, true, true)
        );
        assert_eq!(for_header(&toks("for ( ; ; ) ;")), (false, false, false));
        assert_eq!(
            for_header(&toks("for ( ; f ( a , b ) ; ) x ;")),
            (false, true, false)
        );
    }

    #[test]
    fn template_arguments_split_at_top_level() {
        assert_eq!(
            template_arg_spellings("Map<int, Pair<char, 3>>"),
            vec!["int".to_string(), "Pair<char, 3>".to_string()]
        );
        assert!(template_arg_spellings("int").is_empty());
    }

    #[test]
    fn prefix_operators_map_to_unary_ops() {
        assert_eq!(prefix_op("*"), Some(UnaryOp::Deref));
        assert_eq!(prefix_op("++"), Some(UnaryOp::PreInc));
        assert_eq!(prefix_op("x"), None);
    }

    #[test]
    fn implicit_conversions_classify_by_type() {
        let mut b = AstBuilder::new("a.c");
        let i = b.int();
        let d = b.double();
        let c = b.char();
        let arr = b.array(c, 4);
        let pc = b.pointer(c);
        let ci = b.qualified(i, Qualifiers::CONST);
        let tu = b.finish();
        assert_eq!(cast_kind(&tu, arr, pc), CastKind::ArrayToPointerDecay);
        assert_eq!(cast_kind(&tu, i, d), CastKind::IntegralToFloating);
        assert_eq!(cast_kind(&tu, ci, i), CastKind::NoOp);
        assert_eq!(cast_kind(&tu, pc, i), CastKind::PointerToIntegral);
    }
}
