//! progdb: C/C++ translation units to a canonical program database.
//!
//! Parses sources via libclang (or reads pre-lowered units), canonicalizes
//! every type, function and global into integer-indexed tables, extracts
//! dereference records and call sites from each body, hashes everything
//! structurally, optionally propagates parameter taint, and merges the
//! per-unit tables into one JSON database.
//!
//! # Quick start
//!
//! Build a database from a config and write it next to the config:
//!
//! ```no_run
//! use std::path::Path;
//!
//! // Reads config TOML, parses units, writes the JSON database.
//! progdb::run(Path::new("progdb.toml"), None).unwrap();
//! ```
//!
//! Or get the merged database without writing to disk:
//!
//! ```no_run
//! use std::path::Path;
//!
//! let db = progdb::generate(Path::new("progdb.toml")).unwrap();
//! println!("{} functions", db.funcs.len());
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

pub mod ast;
pub mod config;
pub mod consteval;
pub mod db;
mod deref;
pub mod driver;
pub mod error;
mod fops;
pub mod frontend;
pub mod hash;
pub mod merge;
pub mod print;
pub mod registry;
pub mod resolve;
pub mod taint;
pub mod types;
pub mod visit;

use crate::ast::TranslationUnit;
use crate::db::Database;
use crate::error::DbError;
use crate::taint::TaintDb;
use crate::visit::{BuildOptions, TraversalContext};

/// Runs every per-unit pass over one translation unit: traversal and
/// registration, reference resolution, hashing and, when a taint database
/// is given, taint propagation.
///
/// Under the strict policy the first recoverable error abandons the unit.
pub fn build_unit(
    unit: &TranslationUnit,
    options: &BuildOptions,
    taint: Option<&TaintDb>,
) -> Result<Database, DbError> {
    unit.validate()?;
    let mut ctx = TraversalContext::new(unit, options);
    ctx.traverse()?;
    let mut tables = ctx.finish()?;
    hash::compute(&mut tables);
    if let Some(db) = taint {
        taint::propagate(&mut tables, db);
    }
    Ok(tables.into_database())
}

/// Run the full pipeline: load config, parse the units, build and merge the
/// per-unit databases, and write the output file.
///
/// `config_path` is the path to a `progdb.toml` configuration file.
/// `output` optionally overrides the output file path from the config.
///
/// Returns the path the database was written to.
pub fn run(config_path: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let cfg = config::load_config(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    run_config(&cfg, base_dir, output)
}

/// [`run`] for an already-loaded [`config::Config`], e.g. one with command
/// line overrides applied.
pub fn run_config(cfg: &config::Config, base_dir: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let db = generate_from_config(cfg, base_dir)?;

    let output_path = match output {
        Some(p) => p.to_path_buf(),
        None => config::resolve_path(&cfg.output.file, base_dir),
    };
    let json = serde_json::to_string_pretty(&db).context("serializing database")?;
    std::fs::write(&output_path, &json)
        .with_context(|| format!("writing output to {}", output_path.display()))?;

    info!(
        path = %output_path.display(),
        size = json.len(),
        "wrote database"
    );

    Ok(output_path)
}

/// Parse a `progdb.toml` config file, process the referenced units and
/// return the merged database without writing to disk.
pub fn generate(config_path: &Path) -> Result<Database> {
    let cfg = config::load_config(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    generate_from_config(&cfg, base_dir)
}

/// Build the merged database from an already-loaded [`config::Config`].
///
/// `base_dir` is the directory relative to which paths in the config are
/// resolved (typically the parent directory of the TOML file).
pub fn generate_from_config(cfg: &config::Config, base_dir: &Path) -> Result<Database> {
    let options = cfg.build_options()?;
    let jobs = cfg.jobs();
    info!(
        units = cfg.unit.len(),
        strict = cfg.strict,
        jobs,
        "loaded configuration"
    );

    let taint = match &cfg.taint_db {
        Some(p) => Some(TaintDb::load(&config::resolve_path(p, base_dir))?),
        None => None,
    };

    let units = frontend::load_units(cfg, base_dir)?;
    let results = driver::build_parallel(&units, &options, taint.as_ref(), jobs);
    driver::collect(&units, results, options.policy)
}
