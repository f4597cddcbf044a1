use anyhow::bail;
use clap::Parser;
use std::path::PathBuf;

use crate::model::{BuildOptions, MpiWorkers, RunOptions};

/// Compiler defines accepted on the command line.
const MAX_DEFINES: usize = 3;

#[derive(Parser, Debug)]
#[command(author, version, about = "Build and run a McStas/McXtrace instrument")]
pub struct Cli {
    /// Instrument source file (.instr)
    pub instrument: PathBuf,
    /// Instrument parameters, KEY=VALUE
    #[arg(value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// JSON configuration file; built-in defaults otherwise
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Where generated code and binaries are placed
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,
    /// Log every external command
    #[arg(short, long)]
    pub verbose: bool,

    // ── Build ────────────────────────────────────────────────────────
    /// Regenerate and recompile even when outputs are fresh
    #[arg(short = 'c', long)]
    pub force_compile: bool,
    /// C compiler
    #[arg(long)]
    pub cc: Option<String>,
    /// Custom code generator name
    #[arg(long)]
    pub codegen: Option<String>,
    #[arg(long)]
    pub no_trace: bool,
    #[arg(long)]
    pub no_main: bool,
    /// Compile with -O0 instead of the configured flags
    #[arg(long)]
    pub no_cflags: bool,
    #[arg(long)]
    pub funnel: bool,
    /// Extra include directory for the code generator
    #[arg(short = 'I', long = "include")]
    pub include: Option<PathBuf>,
    /// Raw compiler define, e.g. -DFOO=1 (up to three)
    #[arg(short = 'D', long = "define", allow_hyphen_values = true)]
    pub defines: Vec<String>,
    /// Distributed run: `auto` or a worker count
    #[arg(long)]
    pub mpi: Option<MpiWorkers>,
    #[arg(long)]
    pub machines: Option<PathBuf>,
    /// Launcher executable
    #[arg(long)]
    pub mpirun: Option<String>,
    #[arg(long)]
    pub openacc: bool,
    /// Output format, e.g. NeXus
    #[arg(long)]
    pub format: Option<String>,
    /// Generate IDF metadata alongside NeXus output
    #[arg(long = "IDF")]
    pub idf: bool,

    // ── Run ──────────────────────────────────────────────────────────
    #[arg(long)]
    pub trace: Option<String>,
    #[arg(short = 'n', long)]
    pub ncount: Option<String>,
    #[arg(short = 's', long)]
    pub seed: Option<String>,
    /// Output directory for the simulation
    #[arg(short = 'd', long)]
    pub dir: Option<PathBuf>,
    #[arg(long)]
    pub bufsiz: Option<String>,
    #[arg(long)]
    pub vecsize: Option<String>,
    #[arg(long)]
    pub numgangs: Option<String>,
    #[arg(long = "gpu_innerloop")]
    pub gpu_innerloop: Option<String>,
    #[arg(long = "meta-defined")]
    pub meta_defined: Option<String>,
    #[arg(long = "meta-type")]
    pub meta_type: Option<String>,
    #[arg(long = "meta-data")]
    pub meta_data: Option<String>,
    #[arg(long = "meta-list")]
    pub meta_list: bool,
    #[arg(long)]
    pub no_output_files: bool,
    /// Print the instrument's self-description as JSON and exit
    #[arg(long)]
    pub info: bool,
    #[arg(long)]
    pub list_parameters: bool,
    #[arg(long)]
    pub yes: bool,
    #[arg(short = 'g', long)]
    pub gravitation: bool,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

impl Cli {
    pub fn build_options(&self) -> anyhow::Result<BuildOptions> {
        if self.defines.len() > MAX_DEFINES {
            bail!("at most {MAX_DEFINES} -D defines are supported, got {}", self.defines.len());
        }
        let mut defines: [Option<String>; 3] = Default::default();
        for (slot, d) in defines.iter_mut().zip(&self.defines) {
            *slot = Some(d.clone());
        }

        Ok(BuildOptions {
            cc: self.cc.clone(),
            force_compile: self.force_compile,
            codegen: self.codegen.clone(),
            no_trace: self.no_trace,
            no_main: self.no_main,
            no_cflags: self.no_cflags,
            funnel: self.funnel,
            mpi: self.mpi,
            openacc: self.openacc,
            format: self.format.clone().unwrap_or_default(),
            include: self.include.clone(),
            defines,
        })
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            trace: self.trace.clone(),
            seed: self.seed.clone(),
            ncount: self.ncount.clone(),
            dir: self.dir.clone(),
            format: self.format.clone(),
            vecsize: self.vecsize.clone(),
            numgangs: self.numgangs.clone(),
            gpu_innerloop: self.gpu_innerloop.clone(),
            bufsiz: self.bufsiz.clone(),
            meta_defined: self.meta_defined.clone(),
            meta_type: self.meta_type.clone(),
            meta_data: self.meta_data.clone(),
            no_output_files: self.no_output_files,
            info: self.info,
            list_parameters: self.list_parameters,
            meta_list: self.meta_list,
            yes: self.yes,
            gravitation: self.gravitation,
            idf: self.idf,
            machines: self.machines.clone(),
            mpirun: self.mpirun.clone(),
        }
    }
}
