//! Compiler and run-time flag composition.
//!
//! Flags are collected as a [`FlagSet`]: a flat, ordered token vector that
//! can be handed to a process without a shell. Text sources (configuration
//! constants, environment overrides, directives in generated code) are split
//! into tokens with the platform's quoting rules as they are appended.
pub mod macros;
pub mod tokenize;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use indexmap::IndexMap;
use tracing::debug;

use crate::config::{Config, Product, is_msvc};
use crate::error::Result;
use crate::model::{BuildOptions, RunOptions, RunOverrides};
use crate::platform::Platform;
use crate::process::ProcessRunner;

/// Number of leading lines of generated code searched for a `CFLAGS=` directive.
pub const DIRECTIVE_SCAN_LINES: usize = 20;

/// Flags the NVIDIA accelerator compiler rejects but conda's toolchain sets.
pub const ACCELERATOR_INCOMPATIBLE: &[&str] = &[
    "-march=nocona",
    "-ftree-vectorize",
    "-fstack-protector-strong",
    "-fno-plt",
    "-ffunction-sections",
    "-pipe",
];

/// Value-bearing options forwarded to the binary as `--name=value`, in order.
pub const RUN_VALUE_OPTIONS: &[&str] = &[
    "trace",
    "seed",
    "ncount",
    "dir",
    "format",
    "vecsize",
    "numgangs",
    "gpu_innerloop",
    "bufsiz",
    "meta-defined",
    "meta-type",
    "meta-data",
];

/// Boolean options forwarded to the binary as `--name`, in order.
pub const RUN_FLAG_OPTIONS: &[&str] = &["no-output-files", "info", "list-parameters", "meta-list", "yes"];

/// Read access to environment variables.
pub trait Environment {
    fn var(&self, name: &str) -> Option<String>;
}

/// The live process environment.
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl Environment for BTreeMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Ordered command-line tokens. Later tokens may override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSet(Vec<String>);

impl FlagSet {
    pub fn push(&mut self, token: impl Into<String>) {
        self.0.push(token.into());
    }

    /// Tokenize `text` and append the tokens.
    pub fn push_str(&mut self, text: &str, platform: &dyn Platform) -> Result<()> {
        self.0.extend(platform.split_flags(text)?);
        Ok(())
    }

    pub fn remove_all(&mut self, unwanted: &[&str]) {
        self.0.retain(|t| !unwanted.contains(&t.as_str()));
    }

    pub fn any_contains(&self, needle: &str) -> bool {
        self.0.iter().any(|t| t.contains(needle))
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

pub struct FlagCompositor<'a> {
    config: &'a Config,
    platform: &'a dyn Platform,
    runner: &'a dyn ProcessRunner,
    env: &'a dyn Environment,
}

impl<'a> FlagCompositor<'a> {
    pub fn new(
        config: &'a Config,
        platform: &'a dyn Platform,
        runner: &'a dyn ProcessRunner,
        env: &'a dyn Environment,
    ) -> Self {
        Self {
            config,
            platform,
            runner,
            env,
        }
    }

    /// Flags for compiling `generated` into a binary, in final order.
    pub fn compile_flags(&self, opts: &BuildOptions, generated: &Path) -> Result<FlagSet> {
        let comp = &self.config.compilation;
        let cc = opts.cc.as_deref().unwrap_or(&comp.cc);
        let msvc = is_msvc(cc);
        let mut flags = FlagSet::default();

        // ── Base and package-manager environment ─────────────────────────
        if !msvc {
            flags.push("-lm");
        }
        if self.config.conda_package && self.env_set("CONDA_PREFIX") {
            for var in ["LDFLAGS", "CFLAGS"] {
                if let Some(v) = self.env.var(var).filter(|v| !v.is_empty()) {
                    flags.push_str(&v, self.platform)?;
                }
            }
            if opts.openacc && comp.oacc.contains("nvc") {
                flags.remove_all(ACCELERATOR_INCOMPATIBLE);
            }
        }

        // ── Feature flags ────────────────────────────────────────────────
        if opts.mpi.is_some() {
            self.push_evaluated(&mut flags, &comp.mpiflags)?;
        }
        if opts.openacc {
            self.push_evaluated(&mut flags, &comp.oaccflags)?;
        }
        if opts.is_nexus() {
            self.push_evaluated(&mut flags, &comp.nexusflags)?;
        }
        if opts.funnel {
            flags.push("-DFUNNEL");
        }
        for define in opts.defines.iter().flatten() {
            flags.push_str(define, self.platform)?;
        }
        if !opts.openacc {
            if opts.no_cflags {
                flags.push("-O0");
            } else {
                self.push_evaluated(&mut flags, &comp.cflags)?;
            }
        }

        // ── Directive from the generated code ────────────────────────────
        if let Some(directive) = read_directive(generated)? {
            let expanded = self.evaluate(&self.substitute_placeholders(&directive))?;
            debug!("CFLAGS directive in {}: {}", generated.display(), expanded);
            flags.push_str(&expanded, self.platform)?;
        }

        // accelerator and NeXus headers disagree on __GNUC__
        if flags.any_contains("OPENACC") && flags.any_contains("NeXus") {
            flags.push("-D__GNUC__");
        }

        let mut tokens = flags.into_vec();
        if msvc {
            tokens = partition_msvc(tokens);
        }
        Ok(FlagSet(
            tokens
                .into_iter()
                .map(|t| expand_braced_vars(&t, self.env))
                .collect(),
        ))
    }

    /// Arguments for one run of the compiled binary (launcher wrapping excluded).
    pub fn run_flags(
        &self,
        opts: &RunOptions,
        overrides: &RunOverrides,
        params: &IndexMap<String, String>,
    ) -> Vec<String> {
        let mut args = Vec::new();

        for name in RUN_VALUE_OPTIONS {
            if let Some(v) = overrides.resolve_value(opts, name) {
                if !v.is_empty() {
                    args.push(format!("--{name}={v}"));
                }
            }
        }

        let gravitation: &[&str] = match self.config.product {
            Product::McStas => &["gravitation"],
            Product::McXtrace => &[],
        };
        for name in RUN_FLAG_OPTIONS.iter().chain(gravitation) {
            if overrides.resolve_flag(opts, name) {
                args.push(format!("--{name}"));
            }
        }

        args.extend(params.iter().map(|(k, v)| format!("{k}={v}")));
        args
    }

    fn env_set(&self, name: &str) -> bool {
        self.env.var(name).is_some_and(|v| !v.is_empty())
    }

    fn push_evaluated(&self, flags: &mut FlagSet, text: &str) -> Result<()> {
        let expanded = self.evaluate(text)?;
        flags.push_str(&expanded, self.platform)
    }

    fn substitute_placeholders(&self, directive: &str) -> String {
        let comp = &self.config.compilation;
        let libdir = self.config.libdir.display().to_string().replace('\\', "/");
        [
            ("@NEXUSFLAGS@", comp.nexusflags.as_str()),
            ("@MCPLFLAGS@", comp.mcplflags.as_str()),
            ("@NCRYSTALFLAGS@", comp.ncrystalflags.as_str()),
            ("@GSLFLAGS@", comp.gslflags.as_str()),
            ("@XRLFLAGS@", comp.xrlflags.as_str()),
            ("@MCCODE_LIB@", libdir.as_str()),
        ]
        .iter()
        .fold(directive.to_string(), |acc, (key, val)| acc.replace(key, val))
    }
}

/// The value of the first `CFLAGS=` line among the leading lines of
/// `generated`, with backslashes turned into forward slashes.
pub fn read_directive(generated: &Path) -> Result<Option<String>> {
    let reader = BufReader::new(File::open(generated)?);
    for line in reader.split(b'\n').take(DIRECTIVE_SCAN_LINES) {
        let line = String::from_utf8_lossy(&line?).trim_end().replace('\\', "/");
        if let Some(pos) = line.find("CFLAGS=") {
            return Ok(Some(line[pos + "CFLAGS=".len()..].to_string()));
        }
    }
    Ok(None)
}

/// Move link-stage flags behind `/link` and translate Unix-style prefixes
/// for the MSVC-family compiler.
pub fn partition_msvc(tokens: Vec<String>) -> Vec<String> {
    let mut other = Vec::new();
    let mut link = Vec::new();

    for flag in tokens {
        let lower = flag.to_lowercase();
        if lower.starts_with("/l") || lower.ends_with(".lib") {
            if !lower.starts_with("/link") {
                link.push(flag);
            }
        } else {
            other.push(translate_msvc(flag));
        }
    }

    other.push("/link".into());
    other.extend(link);
    other
}

fn translate_msvc(flag: String) -> String {
    for (unix, msvc) in [("-std=", "/std:"), ("-D", "/D"), ("-U", "/U")] {
        if let Some(rest) = flag.strip_prefix(unix) {
            return format!("{msvc}{rest}");
        }
    }
    flag
}

/// Replace `${NAME}` with the environment value, empty when unset.
fn expand_braced_vars(token: &str, env: &dyn Environment) -> String {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&env.var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
