//! Work distribution.
//!
//! Lowered units are processed by a fixed pool of scoped threads. Workers
//! share nothing but an atomic cursor into the unit list: each one claims
//! the next index, runs the full per-unit pipeline with private state and
//! keeps its results until the join. Ordering between units is restored
//! afterwards by index.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::ast::TranslationUnit;
use crate::db::Database;
use crate::error::{DbError, Policy};
use crate::taint::TaintDb;
use crate::visit::BuildOptions;
use crate::{build_unit, merge};

/// Runs [`build_unit`] over `units` on `jobs` worker threads.
///
/// The result vector is in unit order, whatever order the workers finished in.
pub fn build_parallel(
    units: &[TranslationUnit],
    options: &BuildOptions,
    taint: Option<&TaintDb>,
    jobs: usize,
) -> Vec<Result<Database, DbError>> {
    let workers = jobs.clamp(1, units.len().max(1));
    let cursor = AtomicUsize::new(0);

    let mut results: Vec<(usize, Result<Database, DbError>)> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let cursor = &cursor;
                s.spawn(move || {
                    let mut done = Vec::new();
                    loop {
                        let idx = cursor.fetch_add(1, Ordering::Relaxed);
                        let Some(unit) = units.get(idx) else {
                            break;
                        };
                        debug!(worker, unit = %unit.main_path(), "claimed unit");
                        done.push((idx, build_unit(unit, options, taint)));
                    }
                    done
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(done) => done,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    });

    results.sort_by_key(|(idx, _)| *idx);
    info!(units = units.len(), workers, "processed units");
    results.into_iter().map(|(_, r)| r).collect()
}

/// Applies the error policy to per-unit results and merges the survivors.
///
/// Under the strict policy the first abandoned unit fails the run. Under
/// best-effort the unit is skipped with a warning.
pub fn collect(
    units: &[TranslationUnit],
    results: Vec<Result<Database, DbError>>,
    policy: Policy,
) -> Result<Database> {
    let mut done = Vec::with_capacity(results.len());
    for (unit, result) in units.iter().zip(results) {
        match result {
            Ok(db) => done.push(db),
            Err(e) if policy == Policy::Strict => {
                return Err(anyhow::Error::new(e).context(format!("building {}", unit.main_path())));
            }
            Err(e) => warn!(unit = %unit.main_path(), err = %e, "abandoned unit"),
        }
    }
    Ok(merge::merge(done))
}
