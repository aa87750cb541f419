//! Configuration types for `progdb.toml`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::Policy;
use crate::visit::{BuildOptions, DEFAULT_COMPILETIME_ASSERT};

/// Root configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    /// Abort a unit on the first recoverable error instead of recording it.
    #[serde(default)]
    pub strict: bool,
    /// Number of worker threads. Defaults to the number of CPUs.
    #[serde(default)]
    pub jobs: Option<usize>,
    /// JSON database of tracked functions for taint propagation.
    #[serde(default)]
    pub taint_db: Option<PathBuf>,
    /// Name pattern of compile-time assertion helpers that collapse into one
    /// callee.  An empty string disables collapsing.
    #[serde(default = "default_compiletime_assert")]
    pub compiletime_assert: String,
    /// Additional directories injected as `-I` flags for clang.
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,
    /// Extra clang arguments applied to **all** units.  Per-unit
    /// `clang_args` are appended after these.
    #[serde(default)]
    pub clang_args: Vec<String>,
    /// A `compile_commands.json` whose entries become units.
    #[serde(default)]
    pub compile_commands: Option<PathBuf>,
    #[serde(default)]
    pub unit: Vec<UnitConfig>,
}

/// Output file settings.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Output file path (e.g. `progdb.json`).
    #[serde(default = "default_output_file")]
    pub file: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            file: default_output_file(),
        }
    }
}

fn default_output_file() -> PathBuf {
    PathBuf::from("progdb.json")
}

fn default_compiletime_assert() -> String {
    DEFAULT_COMPILETIME_ASSERT.to_string()
}

/// A single translation unit: a source file parsed through libclang or a
/// unit already lowered to JSON by an external driver.
#[derive(Debug, Deserialize)]
pub struct UnitConfig {
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub ast: Option<PathBuf>,
    /// Extra clang arguments (e.g. `-DDEBUG`).
    #[serde(default)]
    pub clang_args: Vec<String>,
    /// Working directory for the compiler invocation.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// One entry of a `compile_commands.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompileCommand {
    pub directory: PathBuf,
    pub file: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
}

impl CompileCommand {
    /// Compiler flags, without the compiler itself, `-c`, `-o <out>` and the
    /// source file.
    pub fn flags(&self) -> Vec<String> {
        let args: Vec<String> = if self.arguments.is_empty() {
            self.command
                .as_deref()
                .unwrap_or("")
                .split_whitespace()
                .map(str::to_string)
                .collect()
        } else {
            self.arguments.clone()
        };
        let file = self.file.to_string_lossy();
        let mut out = Vec::new();
        let mut iter = args.into_iter().skip(1);
        while let Some(a) = iter.next() {
            if a == "-o" {
                iter.next();
                continue;
            }
            if a == "-c" || a == *file || self.directory.join(&a) == self.file {
                continue;
            }
            out.push(a);
        }
        out
    }
}

impl Config {
    /// Immutable per-run options derived from this configuration.
    pub fn build_options(&self) -> anyhow::Result<BuildOptions> {
        let policy = if self.strict {
            Policy::Strict
        } else {
            Policy::BestEffort
        };
        BuildOptions::with_compiletime_assert(policy, &self.compiletime_assert).map_err(|e| {
            anyhow::anyhow!(
                "invalid compiletime_assert pattern `{}`: {}",
                self.compiletime_assert,
                e
            )
        })
    }

    pub fn jobs(&self) -> usize {
        self.jobs.filter(|j| *j > 0).unwrap_or_else(num_cpus::get)
    }
}

/// Resolve a path relative to `base_dir`.  Absolute paths are returned as-is.
pub fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Load and parse a `progdb.toml` configuration file.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {}", path.display(), e))?;
    Ok(config)
}

/// Load the entries of a `compile_commands.json`.
pub fn load_compile_commands(path: &Path) -> anyhow::Result<Vec<CompileCommand>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        anyhow::anyhow!("failed to read compile commands {}: {}", path.display(), e)
    })?;
    let commands: Vec<CompileCommand> = serde_json::from_str(&content).map_err(|e| {
        anyhow::anyhow!("failed to parse compile commands {}: {}", path.display(), e)
    })?;
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_an_empty_config() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.output.file, PathBuf::from("progdb.json"));
        assert!(!cfg.strict);
        assert!(cfg.jobs() >= 1);
        let options = cfg.build_options().unwrap();
        assert_eq!(options.policy, Policy::BestEffort);
        assert!(
            options
                .compiletime_assert
                .as_ref()
                .is_some_and(|re| re.is_match("__compiletime_assert_42"))
        );
    }

    #[test]
    fn units_and_policy_parse() {
        let cfg: Config = toml::from_str(
            r#"
            strict = true
            jobs = 2
            compiletime_assert = ""

            [output]
            file = "out.json"

            [[unit]]
            source = "a.c"
            clang_args = ["-DX=1"]

            [[unit]]
            ast = "b.json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.jobs(), 2);
        assert_eq!(cfg.unit.len(), 2);
        assert_eq!(cfg.unit[0].source.as_deref(), Some(Path::new("a.c")));
        assert_eq!(cfg.unit[1].ast.as_deref(), Some(Path::new("b.json")));
        let options = cfg.build_options().unwrap();
        assert_eq!(options.policy, Policy::Strict);
        assert!(options.compiletime_assert.is_none());
    }

    #[test]
    fn compile_command_flags_drop_compiler_and_output() {
        let cmd: CompileCommand = serde_json::from_str(
            r#"{ "directory": "/src", "file": "/src/a.c",
                 "command": "cc -DFOO -Iinc -c -o a.o /src/a.c" }"#,
        )
        .unwrap();
        assert_eq!(cmd.flags(), vec!["-DFOO".to_string(), "-Iinc".to_string()]);
    }
}
