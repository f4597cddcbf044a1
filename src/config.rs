//! Immutable tool-chain configuration.
//!
//! Everything that used to be process-wide state (compiler selection,
//! directories, product variant) lives in one [`Config`] value that is
//! handed to the orchestrator and flag compositor at construction.
//! Every field has a default so a partial JSON file is enough.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Which flavour of the simulation suite produced the tool-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Product {
    McStas,
    McXtrace,
}

impl Product {
    pub fn as_str(self) -> &'static str {
        match self {
            Product::McStas => "mcstas",
            Product::McXtrace => "mcxtrace",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub product: Product,
    pub version: String,
    /// Code generator executable name, looked up in `bindir`.
    pub codegen: String,
    pub bindir: PathBuf,
    /// Runtime library directory, substituted for `@MCCODE_LIB@`.
    pub libdir: PathBuf,
    /// Fallback root for `GETPATH(..)` names that are not aliases.
    pub resourcedir: PathBuf,
    /// Named directories resolvable through `GETPATH(name)`.
    pub directories: BTreeMap<String, PathBuf>,
    /// Tool-chain was installed through a package manager that ships its own
    /// compilers (conda); enables the environment flag overrides.
    pub conda_package: bool,
    pub exe_suffix: String,
    /// Distributed-execution launcher.
    pub mpirun: String,
    /// Metadata (IDF) generator command line.
    pub idf_generator: String,
    pub compilation: Compilation,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Compilation {
    pub cc: String,
    pub cflags: String,
    pub mpiflags: String,
    /// Accelerator compiler, e.g. `nvc`.
    pub oacc: String,
    pub oaccflags: String,
    pub nexusflags: String,
    pub mcplflags: String,
    pub ncrystalflags: String,
    pub gslflags: String,
    pub xrlflags: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            product: Product::McStas,
            version: "3.5".into(),
            codegen: "mcstas".into(),
            bindir: PathBuf::from("/usr/local/bin"),
            libdir: PathBuf::from("/usr/local/share/mcstas/resources"),
            resourcedir: PathBuf::from("/usr/local/share/mcstas/resources"),
            directories: BTreeMap::new(),
            conda_package: false,
            exe_suffix: "out".into(),
            mpirun: "mpirun".into(),
            idf_generator: "mcstas2idf".into(),
            compilation: Compilation::default(),
        }
    }
}

impl Default for Compilation {
    fn default() -> Self {
        Self {
            cc: "gcc".into(),
            cflags: "-g -O2 -lm -std=c99".into(),
            mpiflags: "-DUSE_MPI -lmpi".into(),
            oacc: "nvc".into(),
            oaccflags: "-fast -Minfo=accel -acc=gpu -gpu=managed -DOPENACC".into(),
            nexusflags: "-DUSE_NEXUS -lNeXus".into(),
            mcplflags: "-Wl,-rpath,CMD(mcpl-config --show libdir) -ICMD(mcpl-config --show includedir) -LCMD(mcpl-config --show libdir) -lmcpl".into(),
            ncrystalflags: "CMD(ncrystal-config --show buildflags)".into(),
            gslflags: "-lgsl -lgslcblas".into(),
            xrlflags: "-lxrl".into(),
        }
    }
}

impl Config {
    /// Parse a JSON configuration document.
    pub fn load_from_json(json: &str) -> Result<Config> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a file, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(p) => {
                let json = std::fs::read_to_string(p)?;
                Self::load_from_json(&json)
            }
            None => Ok(Config::default()),
        }
    }

    /// `"<codegen> <version>"`, reported as the instrument's product version.
    pub fn version_string(&self) -> String {
        format!("{} {}", self.codegen, self.version)
    }

    /// Resolve a `GETPATH(name)` alias. Unknown names are taken relative to
    /// the resource directory.
    pub fn resolve_path_alias(&self, name: &str) -> PathBuf {
        match name {
            "bindir" => self.bindir.clone(),
            "libdir" => self.libdir.clone(),
            "resourcedir" => self.resourcedir.clone(),
            other => self
                .directories
                .get(other)
                .cloned()
                .unwrap_or_else(|| self.resourcedir.join(other)),
        }
    }
}

/// The MSVC-family compiler links the math library implicitly and wants
/// link-stage flags after `/link`.
pub fn is_msvc(cc: &str) -> bool {
    cc.to_lowercase().contains("cl.exe")
}
