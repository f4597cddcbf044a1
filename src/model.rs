//! Option snapshots handed to the orchestrator for one build/run cycle.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// How many workers the distributed launcher should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpiWorkers {
    /// Let the launcher pick its system default.
    Auto,
    Count(u32),
}

impl FromStr for MpiWorkers {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(MpiWorkers::Auto);
        }
        s.parse::<u32>()
            .map(MpiWorkers::Count)
            .map_err(|_| format!("expected `auto` or a worker count, got `{s}`"))
    }
}

impl fmt::Display for MpiWorkers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MpiWorkers::Auto => f.write_str("auto"),
            MpiWorkers::Count(n) => write!(f, "{n}"),
        }
    }
}

/// Everything that influences code generation and compilation.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Compiler override; the configured one is used otherwise.
    pub cc: Option<String>,
    pub force_compile: bool,
    /// Custom code generator name (forces regeneration).
    pub codegen: Option<String>,
    pub no_trace: bool,
    pub no_main: bool,
    /// Use the minimal optimisation flag instead of the configured set.
    pub no_cflags: bool,
    pub funnel: bool,
    pub mpi: Option<MpiWorkers>,
    pub openacc: bool,
    pub format: String,
    /// Extra include directory for the code generator.
    pub include: Option<PathBuf>,
    /// Raw compiler defines, applied in order.
    pub defines: [Option<String>; 3],
}

impl BuildOptions {
    /// Any of these conditions bypasses the reuse cache.
    pub fn forces_recompile(&self) -> bool {
        self.force_compile
            || self.codegen.is_some()
            || self.defines.iter().any(Option::is_some)
            || self.include.is_some()
    }

    pub fn is_nexus(&self) -> bool {
        self.format.eq_ignore_ascii_case("nexus")
    }
}

/// Options forwarded to the compiled binary.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub trace: Option<String>,
    pub seed: Option<String>,
    pub ncount: Option<String>,
    pub dir: Option<PathBuf>,
    pub format: Option<String>,
    pub vecsize: Option<String>,
    pub numgangs: Option<String>,
    pub gpu_innerloop: Option<String>,
    pub bufsiz: Option<String>,
    pub meta_defined: Option<String>,
    pub meta_type: Option<String>,
    pub meta_data: Option<String>,

    pub no_output_files: bool,
    pub info: bool,
    pub list_parameters: bool,
    pub meta_list: bool,
    pub yes: bool,
    pub gravitation: bool,

    /// Request the metadata (IDF) generator alongside a NeXus run.
    pub idf: bool,
    pub machines: Option<PathBuf>,
    pub mpirun: Option<String>,
}

impl RunOptions {
    /// Stored value of a value-bearing option, by its command-line name.
    pub fn value(&self, name: &str) -> Option<String> {
        let v = match name {
            "trace" => &self.trace,
            "seed" => &self.seed,
            "ncount" => &self.ncount,
            "format" => &self.format,
            "vecsize" => &self.vecsize,
            "numgangs" => &self.numgangs,
            "gpu_innerloop" => &self.gpu_innerloop,
            "bufsiz" => &self.bufsiz,
            "meta-defined" => &self.meta_defined,
            "meta-type" => &self.meta_type,
            "meta-data" => &self.meta_data,
            "dir" => return self.dir.as_ref().map(|d| d.display().to_string()),
            _ => return None,
        };
        v.clone()
    }

    /// Stored value of a boolean flag, by its command-line name.
    pub fn flag(&self, name: &str) -> bool {
        match name {
            "no-output-files" => self.no_output_files,
            "info" => self.info,
            "list-parameters" => self.list_parameters,
            "meta-list" => self.meta_list,
            "yes" => self.yes,
            "gravitation" => self.gravitation,
            _ => false,
        }
    }
}

/// Per-invocation overrides that shadow [`RunOptions`] without mutating them.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    values: HashMap<String, String>,
    flags: HashMap<String, bool>,
}

impl RunOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn flag(mut self, name: &str, on: bool) -> Self {
        self.flags.insert(name.to_string(), on);
        self
    }

    pub(crate) fn resolve_value(&self, opts: &RunOptions, name: &str) -> Option<String> {
        match self.values.get(name) {
            Some(v) => Some(v.clone()),
            None => opts.value(name),
        }
    }

    pub(crate) fn resolve_flag(&self, opts: &RunOptions, name: &str) -> bool {
        self.flags
            .get(name)
            .copied()
            .unwrap_or_else(|| opts.flag(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpi_workers_parse() {
        assert_eq!("auto".parse::<MpiWorkers>(), Ok(MpiWorkers::Auto));
        assert_eq!("4".parse::<MpiWorkers>(), Ok(MpiWorkers::Count(4)));
        assert!("many".parse::<MpiWorkers>().is_err());
    }

    #[test]
    fn force_recompile_conditions() {
        let mut opts = BuildOptions::default();
        assert!(!opts.forces_recompile());

        opts.defines[2] = Some("-DFOO".into());
        assert!(opts.forces_recompile());

        let opts = BuildOptions {
            include: Some("lib".into()),
            ..Default::default()
        };
        assert!(opts.forces_recompile());
    }

    #[test]
    fn overrides_shadow_without_mutation() {
        let opts = RunOptions {
            ncount: Some("1e6".into()),
            info: true,
            ..Default::default()
        };
        let ov = RunOverrides::new().value("ncount", "10").flag("info", false);

        assert_eq!(ov.resolve_value(&opts, "ncount").as_deref(), Some("10"));
        assert!(!ov.resolve_flag(&opts, "info"));
        assert_eq!(opts.ncount.as_deref(), Some("1e6"));
        assert!(opts.info);
    }
}
