//! Build/run orchestration for one instrument.
//!
//! An [`Instrument`] moves through [`Stage`]s:
//!
//! ```text
//! Uninitialized ──prepare──▶ CodeReady ──▶ BinaryReady ──run/info──▶ Executed
//! ```
//!
//! Each stage consumes the previous stage's artifact, so everything is
//! sequential and blocking. The working directory is assumed to be owned
//! exclusively for the duration of a `prepare`/`run` cycle.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::cache;
use crate::config::{Config, Product, is_msvc};
use crate::error::{Error, Result};
use crate::flags::{Environment, FlagCompositor};
use crate::model::{BuildOptions, MpiWorkers, RunOptions, RunOverrides};
use crate::platform::Platform;
use crate::process::{Output, ProcessRunner};
use crate::report::DiagnosticReport;

/// Arguments the metadata generator does not understand.
const METADATA_STRIPPED: &[&str] = &["--trace", "--format", "--dir", "--bufsiz"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Uninitialized,
    CodeReady,
    BinaryReady,
    Executed,
}

/// The external collaborators an instrument is built and run with.
#[derive(Clone, Copy)]
pub struct Toolchain<'a> {
    pub config: &'a Config,
    pub platform: &'a dyn Platform,
    pub runner: &'a dyn ProcessRunner,
    pub env: &'a dyn Environment,
}

impl<'a> Toolchain<'a> {
    fn compositor(&self) -> FlagCompositor<'a> {
        FlagCompositor::new(self.config, self.platform, self.runner, self.env)
    }
}

pub struct Instrument<'a> {
    tools: Toolchain<'a>,
    source: PathBuf,
    name: String,
    workdir: PathBuf,
    cpath: PathBuf,
    binpath: PathBuf,
    version: String,
    params: IndexMap<String, String>,
    stage: Stage,
    build: Option<BuildOptions>,
}

impl<'a> Instrument<'a> {
    /// Fails before anything is spawned when `source` is not a file.
    pub fn new(source: impl AsRef<Path>, workdir: impl Into<PathBuf>, tools: Toolchain<'a>) -> Result<Self> {
        let source = source.as_ref();
        if !source.is_file() {
            return Err(Error::Precondition(format!(
                "No such instrument file: \"{}\"",
                source.display()
            )));
        }
        let name = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Precondition(format!("bad instrument path {}", source.display())))?;

        let workdir: PathBuf = workdir.into();
        let workdir = in_dir(Some(workdir.as_path())).to_path_buf();
        let cpath = workdir.join(format!("{name}.c"));
        let binpath = match tools.config.exe_suffix.as_str() {
            "" => workdir.join(&name),
            suffix => workdir.join(format!("{name}.{suffix}")),
        };

        Ok(Self {
            version: tools.config.version_string(),
            tools,
            source: source.to_path_buf(),
            name,
            workdir,
            cpath,
            binpath,
            params: IndexMap::new(),
            stage: Stage::Uninitialized,
            build: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn generated_path(&self) -> &Path {
        &self.cpath
    }

    pub fn binary_path(&self) -> &Path {
        &self.binpath
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn params(&self) -> &IndexMap<String, String> {
        &self.params
    }

    /// Set an instrument parameter, passed to the binary as `key=value`.
    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    // ─────────────────────────────────────────────────────
    // Build
    // ─────────────────────────────────────────────────────

    /// Make sure generated code and a binary exist and are up to date,
    /// regenerating and recompiling as needed.
    pub fn prepare(&mut self, opts: &BuildOptions) -> Result<()> {
        self.copy_source_into_workdir()?;
        let force = opts.forces_recompile();

        let candidates = [self.cpath.clone(), self.beside_source(&self.cpath)];
        let existing_c = cache::find_reusable(cache::modified(&self.source)?, &candidates);
        match existing_c {
            Some(path) if !force => {
                info!("Using existing c-file: {}", path.display());
                self.cpath = path;
            }
            _ => {
                info!("Regenerating c-file: {}", self.cpath.display());
                self.generate(opts)?;
            }
        }
        self.stage = Stage::CodeReady;
        self.build = Some(opts.clone());

        let candidates = [self.binpath.clone(), self.beside_source(&self.binpath)];
        let existing_bin = cache::find_reusable(cache::modified(&self.cpath)?, &candidates);
        match existing_bin {
            Some(path) if !force => {
                info!("Using existing binary: {}", path.display());
                self.binpath = path;
            }
            _ => {
                info!("Recompiling: {}", self.binpath.display());
                self.compile(opts)?;
            }
        }
        self.stage = Stage::BinaryReady;
        Ok(())
    }

    fn copy_source_into_workdir(&self) -> Result<()> {
        let Some(file_name) = self.source.file_name() else {
            return Ok(());
        };
        let local = self.workdir.join(file_name);
        if local.is_file() {
            return Ok(());
        }
        debug!("copying {} to {}", self.source.display(), local.display());
        fs::copy(&self.source, &local)?;
        File::options()
            .write(true)
            .open(&local)?
            .set_modified(cache::modified(&self.source)?)?;
        Ok(())
    }

    /// Same file name, next to the instrument source.
    fn beside_source(&self, path: &Path) -> PathBuf {
        let dir = in_dir(self.source.parent());
        match path.file_name() {
            Some(name) => dir.join(name),
            None => dir.to_path_buf(),
        }
    }

    fn generate(&self, opts: &BuildOptions) -> Result<()> {
        let codegen = opts.codegen.as_deref().unwrap_or(&self.tools.config.codegen);

        let mut args: Vec<String> = Vec::new();
        if opts.no_main {
            args.push("--no-main".into());
        } else if opts.no_trace {
            args.push("--no-trace".into());
        } else {
            args.push("-t".into());
        }
        args.push("-o".into());
        args.push(self.cpath.display().to_string());
        args.push(self.source.display().to_string());
        if let Some(include) = &opts.include {
            args.push("-I".into());
            args.push(include.display().to_string());
        }

        self.run_tool(&self.tools.config.bindir.join(codegen), &args)?;
        Ok(())
    }

    /// Run a tool by its configured absolute path, falling back to a PATH
    /// lookup of its bare name when the configured file is missing.
    fn run_tool(&self, configured: &Path, args: &[String]) -> Result<String> {
        if configured.exists() {
            let exe = configured.display().to_string();
            return self.tools.runner.run(&exe, args, Output::Inherit);
        }

        let bare = configured
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| configured.display().to_string());
        warn!("Full-path code-generator \"{}\" not found", configured.display());
        warn!("Attempting replacement by \"{}\"", bare);

        match self.tools.runner.run(&bare, args, Output::Inherit) {
            Err(Error::Spawn { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ToolNotFound {
                    configured: configured.to_path_buf(),
                    bare,
                })
            }
            other => other,
        }
    }

    fn compile(&self, opts: &BuildOptions) -> Result<()> {
        let cc = opts
            .cc
            .as_deref()
            .unwrap_or(&self.tools.config.compilation.cc);
        let flags = self
            .tools
            .compositor()
            .compile_flags(opts, &self.cpath)?
            .into_vec();

        let cfile = self.cpath.display().to_string();
        let mut args = if is_msvc(cc) {
            vec![cfile]
        } else {
            vec!["-o".into(), self.binpath.display().to_string(), cfile]
        };
        args.extend(flags);

        self.tools.runner.run(cc, &args, Output::Inherit)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Run
    // ─────────────────────────────────────────────────────

    fn prepared_build(&self) -> Result<&BuildOptions> {
        match (&self.build, self.stage >= Stage::BinaryReady) {
            (Some(build), true) => Ok(build),
            _ => Err(Error::Precondition(format!(
                "instrument {} has not been prepared",
                self.name
            ))),
        }
    }

    /// Run the binary with `opts` shadowed by `overrides`.
    ///
    /// `distributed` forces the launcher on or off; `None` uses the launcher
    /// whenever a worker count was configured at build time.
    pub fn run(
        &mut self,
        opts: &RunOptions,
        output: Output,
        overrides: &RunOverrides,
        distributed: Option<bool>,
    ) -> Result<String> {
        let build = self.prepared_build()?;
        let mut args = self.tools.compositor().run_flags(opts, overrides, &self.params);

        let wants_metadata = self.tools.config.product == Product::McStas
            && !opts.info
            && build.is_nexus()
            && opts.idf;
        if wants_metadata {
            self.generate_metadata(&args, output)?;
            args.push("--IDF".into());
        }

        self.run_distributed(opts, args, output, distributed)
    }

    fn generate_metadata(&self, args: &[String], output: Output) -> Result<()> {
        let mut words = self.tools.platform.split_flags(&self.tools.config.idf_generator)?;
        if words.is_empty() {
            return Err(Error::Config("idf_generator is empty".into()));
        }
        let exe = words.remove(0);
        words.push(self.source.display().to_string());
        words.extend(
            args.iter()
                .filter(|a| !METADATA_STRIPPED.iter().any(|s| a.contains(s)))
                .cloned(),
        );

        info!("Spawning IDF generator: {} {}", exe, words.join(" "));
        self.tools.runner.run(&exe, &words, output)?;
        Ok(())
    }

    /// Dispatch the binary with `args`, directly or through the launcher.
    pub fn run_distributed(
        &mut self,
        opts: &RunOptions,
        args: Vec<String>,
        output: Output,
        distributed: Option<bool>,
    ) -> Result<String> {
        let build = self.prepared_build()?;
        let config = self.tools.config;
        let bin = self.binpath.display().to_string();

        let (exe, argv) = if distributed.unwrap_or(build.mpi.is_some()) {
            debug!("Running via MPI: {}", bin);
            let mut launcher: Vec<String> = match build.mpi {
                Some(MpiWorkers::Auto) => {
                    info!("Using system default number of mpirun -np processes");
                    self.tools.platform.mpi_auto_args()
                }
                Some(MpiWorkers::Count(n)) if n >= 1 => vec!["-np".into(), n.to_string()],
                _ => Vec::new(),
            };
            if let Some(machines) = &opts.machines {
                launcher.push("-machinefile".into());
                launcher.push(machines.display().to_string());
            }
            if build.openacc {
                if let Some(helper) = self.tools.platform.accelerator_bind_helper(config) {
                    launcher.push(helper.display().to_string());
                }
            }
            launcher.push(bin);
            launcher.extend(args);
            let mpirun = opts.mpirun.clone().unwrap_or_else(|| config.mpirun.clone());
            (mpirun, launcher)
        } else {
            (bin, args)
        };

        let out = self.tools.runner.run(&exe, &argv, output)?;
        self.stage = Stage::Executed;
        Ok(out)
    }

    /// Ask the binary to describe itself and parse the report.
    pub fn info(&mut self, opts: &RunOptions) -> Result<DiagnosticReport> {
        let text = self.run_distributed(opts, vec!["--info".into()], Output::Capture, None)?;
        DiagnosticReport::parse(&text)
    }
}

/// A directory that keeps joined file names path-like: an empty parent
/// (bare relative file) becomes `.`, so the result is never looked up on PATH.
fn in_dir(dir: Option<&Path>) -> &Path {
    dir.filter(|d| !d.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}
