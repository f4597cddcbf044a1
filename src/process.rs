//! External process invocation.
//!
//! Every external call is `(executable, argument vector)` with no shell in
//! between; the outcome is judged by exit status and captured output.
//! [`ProcessRunner`] is the seam the orchestrator talks to so tests can swap
//! in [`mock::MockRunner`] instead of real tools.

use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::platform::Platform;

/// What to do with the child's output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// Child writes straight to our console; nothing is returned.
    Inherit,
    /// Collect stdout and return it; stderr goes to our console.
    Capture,
    /// Collect stdout and stderr separately.
    Separate,
    /// Collect stdout and stderr into one text, line by line in arrival order.
    Combined,
    /// Echo stdout line by line as it arrives and also return it.
    Tee,
}

/// Text collected from a finished child. For [`Output::Combined`] everything
/// is in `stdout`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

pub trait ProcessRunner {
    /// Run to completion and return whatever `output` asked to collect.
    fn execute(&self, executable: &str, args: &[String], output: Output) -> Result<Captured>;

    /// Run to completion. Returns captured stdout (empty for [`Output::Inherit`]).
    fn run(&self, executable: &str, args: &[String], output: Output) -> Result<String> {
        self.execute(executable, args, output).map(|c| c.stdout)
    }
}

/// Runs real processes through `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn execute(&self, executable: &str, args: &[String], output: Output) -> Result<Captured> {
        debug!("CMD: {} {}", executable, args.join(" "));

        let mut cmd = Command::new(executable);
        cmd.args(args);
        let spawn = |cmd: &mut Command| cmd.spawn().map_err(|e| spawn_error(executable, e));

        let (status, captured) = match output {
            Output::Inherit => (spawn(&mut cmd)?.wait()?, Captured::default()),
            Output::Capture | Output::Separate => {
                let stderr = match output {
                    Output::Separate => Stdio::piped(),
                    _ => Stdio::inherit(),
                };
                let out = cmd
                    .stdout(Stdio::piped())
                    .stderr(stderr)
                    .output()
                    .map_err(|e| spawn_error(executable, e))?;
                let captured = Captured {
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                };
                (out.status, captured)
            }
            Output::Combined => {
                let mut child = spawn(cmd.stdout(Stdio::piped()).stderr(Stdio::piped()))?;
                let merged = merge_streams(&mut child);
                let status = child.wait()?;
                let stdout = merged?;
                (status, Captured { stdout, stderr: String::new() })
            }
            Output::Tee => {
                let mut child = spawn(cmd.stdout(Stdio::piped()))?;
                let mut stdout = String::new();
                let read = match child.stdout.take() {
                    Some(out) => for_each_line(out, |line| {
                        println!("{line}");
                        stdout.push_str(&line);
                        stdout.push('\n');
                    }),
                    None => Ok(()),
                };
                // reap before surfacing a read error
                let status = child.wait()?;
                read?;
                (status, Captured { stdout, stderr: String::new() })
            }
        };

        debug!("CMD: {} finished ({})", executable, status);
        check_status(executable, args, status)?;
        Ok(captured)
    }
}

/// Call `f` with every line of `reader`, decoding invalid UTF-8 lossily.
fn for_each_line<R: Read>(reader: R, mut f: impl FnMut(String)) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        f(String::from_utf8_lossy(&buf).into_owned());
    }
}

/// Drain the child's stdout and stderr on one thread each, interleaving
/// whole lines as they arrive.
fn merge_streams(child: &mut Child) -> io::Result<String> {
    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        let tx = tx.clone();
        readers.push(thread::spawn(move || for_each_line(out, |l| drop(tx.send(l)))));
    }
    if let Some(err) = child.stderr.take() {
        let tx = tx.clone();
        readers.push(thread::spawn(move || for_each_line(err, |l| drop(tx.send(l)))));
    }
    drop(tx);

    let mut merged = String::new();
    for line in rx {
        merged.push_str(&line);
        merged.push('\n');
    }
    for reader in readers {
        reader
            .join()
            .map_err(|_| io::Error::other("output reader thread panicked"))??;
    }
    Ok(merged)
}

fn spawn_error(executable: &str, source: io::Error) -> Error {
    Error::Spawn {
        executable: executable.to_string(),
        source,
    }
}

fn check_status(executable: &str, args: &[String], status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    info!("call to {} failed with {}", executable, status);
    Err(Error::ExternalProcess {
        executable: executable.to_string(),
        args: args.to_vec(),
        code: status.code(),
    })
}

// ─────────────────────────────────────────────────────
// Long-running processes with a supervising thread
// ─────────────────────────────────────────────────────

enum Control {
    Cancel,
    Exited,
}

/// Requests termination of a [`WatchedProcess`] from another thread, e.g.
/// from an interrupt handler.
#[derive(Clone)]
pub struct CancelHandle(Sender<Control>);

impl CancelHandle {
    pub fn cancel(&self) {
        // supervisor already gone means the child already exited
        let _ = self.0.send(Control::Cancel);
    }
}

/// A child whose stdout is consumed line by line while a supervisor thread
/// asks it to terminate after `timeout` or on [`CancelHandle::cancel`].
///
/// Cancellation is cooperative: the supervisor sends a termination request
/// and then waits for the child to exit; a further cancel repeats the request.
/// The child is only ever reaped under its lock, so a request never reaches
/// a recycled pid. Dropping the process stops the supervisor but leaves the
/// child running.
pub struct WatchedProcess {
    executable: String,
    args: Vec<String>,
    child: Arc<Mutex<Child>>,
    lines: io::Lines<BufReader<ChildStdout>>,
    control: Sender<Control>,
    supervisor: Option<JoinHandle<()>>,
}

/// How often [`WatchedProcess::wait`] polls for exit.
const EXIT_POLL: Duration = Duration::from_millis(20);

fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WatchedProcess {
    pub fn spawn(
        executable: &str,
        args: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
        platform: &'static dyn Platform,
    ) -> Result<Self> {
        debug!("CMD (watched): {} {}", executable, args.join(" "));

        let mut cmd = Command::new(executable);
        cmd.args(args).stdout(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|e| spawn_error(executable, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Precondition("child stdout was not captured".into()))?;

        let pid = child.id();
        let child = Arc::new(Mutex::new(child));
        let watched = Arc::clone(&child);
        let (tx, rx) = mpsc::channel::<Control>();
        let supervisor = thread::spawn(move || {
            match rx.recv_timeout(timeout) {
                Ok(Control::Exited) | Err(RecvTimeoutError::Disconnected) => return,
                Ok(Control::Cancel) => info!("termination requested for pid {pid}"),
                Err(RecvTimeoutError::Timeout) => {
                    info!("pid {pid} still running after {timeout:?}, requesting termination")
                }
            }
            loop {
                {
                    let mut child = lock(&watched);
                    match child.try_wait() {
                        Ok(Some(_)) => return,
                        Ok(None) => {
                            if let Err(e) = platform.request_termination(pid) {
                                warn!("could not signal pid {pid}: {e}");
                            }
                        }
                        Err(e) => {
                            warn!("could not poll pid {pid}: {e}");
                            return;
                        }
                    }
                }
                match rx.recv() {
                    Ok(Control::Cancel) => continue,
                    Ok(Control::Exited) | Err(_) => return,
                }
            }
        });

        Ok(Self {
            executable: executable.to_string(),
            args: args.to_vec(),
            child,
            lines: BufReader::new(stdout).lines(),
            control: tx,
            supervisor: Some(supervisor),
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.control.clone())
    }

    /// Read lines until one satisfies `pred`; `None` once stdout closes.
    pub fn scrape_line<F>(&mut self, mut pred: F) -> Option<String>
    where
        F: FnMut(&str) -> bool,
    {
        self.by_ref()
            .map_while(|l| l.ok())
            .find(|l| pred(l.as_str()))
    }

    /// Wait for the child to exit and stop the supervisor.
    ///
    /// A child that ended because termination was requested reports a
    /// failure with no exit code on POSIX.
    pub fn wait(mut self) -> Result<()> {
        let status = loop {
            if let Some(status) = lock(&self.child).try_wait()? {
                break status;
            }
            thread::sleep(EXIT_POLL);
        };
        self.stop_supervisor();
        check_status(&self.executable, &self.args, status)
    }

    fn stop_supervisor(&mut self) {
        let _ = self.control.send(Control::Exited);
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatchedProcess {
    fn drop(&mut self) {
        self.stop_supervisor();
    }
}

impl Iterator for WatchedProcess {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.next()
    }
}

pub mod mock {
    //! Recording stand-in for external tools.
    //!
    //! Available to integration tests as well as unit tests.

    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Scripted outcome of one tool.
    #[derive(Debug, Clone, Default)]
    pub struct MockResponse {
        pub code: i32,
        pub stdout: String,
        /// Written to the path following `-o`, mimicking a generator or compiler.
        pub writes: Option<String>,
    }

    impl MockResponse {
        pub fn ok(stdout: &str) -> Self {
            Self {
                stdout: stdout.to_string(),
                ..Default::default()
            }
        }

        pub fn fail(code: i32) -> Self {
            Self {
                code,
                ..Default::default()
            }
        }

        pub fn writes(content: &str) -> Self {
            Self {
                writes: Some(content.to_string()),
                ..Default::default()
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Call {
        pub executable: String,
        pub args: Vec<String>,
    }

    #[derive(Default, Clone)]
    pub struct MockRunner {
        responses: Arc<Mutex<Vec<(String, MockResponse)>>>,
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Script the outcome for an executable, matched by full string or
        /// by file name. Unscripted tools succeed with empty output.
        pub fn respond(&self, executable: &str, response: MockResponse) {
            self.responses
                .lock()
                .expect("MockRunner responses mutex poisoned")
                .push((executable.to_string(), response));
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls
                .lock()
                .expect("MockRunner calls mutex poisoned")
                .clone()
        }

        fn response_for(&self, executable: &str) -> MockResponse {
            let file_name = Path::new(executable)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
            self.responses
                .lock()
                .expect("MockRunner responses mutex poisoned")
                .iter()
                .find(|(k, _)| k == executable || Some(k) == file_name.as_ref())
                .map(|(_, r)| r.clone())
                .unwrap_or_default()
        }
    }

    impl ProcessRunner for MockRunner {
        fn execute(&self, executable: &str, args: &[String], _output: Output) -> Result<Captured> {
            self.calls
                .lock()
                .expect("MockRunner calls mutex poisoned")
                .push(Call {
                    executable: executable.to_string(),
                    args: args.to_vec(),
                });

            let response = self.response_for(executable);
            if response.code != 0 {
                return Err(Error::ExternalProcess {
                    executable: executable.to_string(),
                    args: args.to_vec(),
                    code: Some(response.code),
                });
            }
            if let Some(content) = &response.writes {
                if let Some(pos) = args.iter().position(|a| a == "-o") {
                    if let Some(out) = args.get(pos + 1) {
                        std::fs::write(PathBuf::from(out), content)?;
                    }
                }
            }
            Ok(Captured {
                stdout: response.stdout,
                stderr: String::new(),
            })
        }
    }
}
