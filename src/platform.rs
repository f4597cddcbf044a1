//! Operating-system differences behind one capability trait.
//!
//! The orchestrator never asks "are we on Windows?"; it asks the platform
//! for the piece of behaviour that differs.

use std::io;
use std::path::PathBuf;
use std::process::Command;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flags::tokenize;

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Split a flag string into argument tokens using the native quoting rules.
    fn split_flags(&self, flags: &str) -> Result<Vec<String>>;

    /// Launcher arguments meaning "system default number of workers".
    fn mpi_auto_args(&self) -> Vec<String>;

    /// Helper that binds each distributed worker to an accelerator, if the
    /// platform ships one.
    fn accelerator_bind_helper(&self, cfg: &Config) -> Option<PathBuf>;

    /// Ask a running process to terminate. This is a request, not a kill.
    fn request_termination(&self, pid: u32) -> io::Result<()>;
}

pub struct Posix;

pub struct Windows;

impl Platform for Posix {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn split_flags(&self, flags: &str) -> Result<Vec<String>> {
        tokenize::split_posix(flags).map_err(|reason| Error::Flags {
            flags: flags.to_string(),
            reason,
        })
    }

    // openmpi's mpirun accepts `--` as the end of its own options.
    fn mpi_auto_args(&self) -> Vec<String> {
        vec!["--".into()]
    }

    fn accelerator_bind_helper(&self, cfg: &Config) -> Option<PathBuf> {
        Some(
            cfg.bindir
                .join(format!("{}-acc_gpu_bind", cfg.product.as_str())),
        )
    }

    #[cfg(unix)]
    fn request_termination(&self, pid: u32) -> io::Result<()> {
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn request_termination(&self, pid: u32) -> io::Result<()> {
        Command::new("kill").arg(pid.to_string()).status().map(|_| ())
    }
}

impl Platform for Windows {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn split_flags(&self, flags: &str) -> Result<Vec<String>> {
        Ok(tokenize::split_windows(flags))
    }

    // msmpi's mpiexec rejects `--`.
    fn mpi_auto_args(&self) -> Vec<String> {
        Vec::new()
    }

    fn accelerator_bind_helper(&self, _cfg: &Config) -> Option<PathBuf> {
        None
    }

    fn request_termination(&self, pid: u32) -> io::Result<()> {
        Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .status()
            .map(|_| ())
    }
}

/// The platform this binary was built for.
pub fn native() -> &'static dyn Platform {
    if cfg!(windows) { &Windows } else { &Posix }
}
