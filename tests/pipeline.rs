use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use mcrun::Error;
use mcrun::config::{Config, Product};
use mcrun::flags::ProcessEnv;
use mcrun::instrument::{Instrument, Stage, Toolchain};
use mcrun::model::{BuildOptions, MpiWorkers, RunOptions, RunOverrides};
use mcrun::platform::Posix;
use mcrun::process::Output;
use mcrun::process::mock::{MockResponse, MockRunner};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    srcdir: PathBuf,
    work: PathBuf,
    bindir: PathBuf,
    source: PathBuf,
    config: Config,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let srcdir = dir.path().join("src");
        let work = dir.path().join("work");
        let bindir = dir.path().join("bin");
        for d in [&srcdir, &work, &bindir] {
            fs::create_dir_all(d).unwrap();
        }
        fs::write(bindir.join("mcstas"), "").unwrap();

        let source = srcdir.join("templateDIFF.instr");
        touch(&source, 300);

        let config = Config {
            bindir: bindir.clone(),
            ..Default::default()
        };
        Self {
            _dir: dir,
            srcdir,
            work,
            bindir,
            source,
            config,
        }
    }

    fn instrument<'a>(&'a self, runner: &'a MockRunner) -> Instrument<'a> {
        let tools = Toolchain {
            config: &self.config,
            platform: &Posix,
            runner,
            env: &ProcessEnv,
        };
        Instrument::new(&self.source, &self.work, tools).unwrap()
    }

    fn c(&self) -> PathBuf {
        self.work.join("templateDIFF.c")
    }

    fn bin(&self) -> PathBuf {
        self.work.join("templateDIFF.out")
    }
}

/// Create `path` with a modification time `age` seconds in the past.
fn touch(path: &Path, age: u64) {
    fs::write(path, "/* test */\n").unwrap();
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(age))
        .unwrap();
}

fn scripted_runner() -> MockRunner {
    let runner = MockRunner::new();
    runner.respond("mcstas", MockResponse::writes("/* generated */\n"));
    runner.respond("gcc", MockResponse::writes("binary"));
    runner
}

fn s(path: &Path) -> String {
    path.display().to_string()
}

// ── Build ────────────────────────────────────────────────────────────

#[test]
fn stale_outputs_are_regenerated_then_compiled() {
    for force_compile in [false, true] {
        let fx = Fixture::new();
        touch(&fx.c(), 400);
        touch(&fx.bin(), 400);
        let runner = scripted_runner();
        let mut inst = fx.instrument(&runner);

        let opts = BuildOptions {
            force_compile,
            ..Default::default()
        };
        inst.prepare(&opts).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].executable, s(&fx.bindir.join("mcstas")));
        assert_eq!(calls[0].args, ["-t".to_string(), "-o".into(), s(&fx.c()), s(&fx.source)]);
        assert_eq!(calls[1].executable, "gcc");
        assert_eq!(calls[1].args[..3], ["-o".to_string(), s(&fx.bin()), s(&fx.c())]);
        assert!(calls[1].args.contains(&"-std=c99".to_string()));
        assert_eq!(inst.stage(), Stage::BinaryReady);
        assert!(fx.work.join("templateDIFF.instr").is_file());
    }
}

#[test]
fn fresh_outputs_are_reused() {
    let fx = Fixture::new();
    touch(&fx.c(), 200);
    touch(&fx.bin(), 100);
    let runner = scripted_runner();
    let mut inst = fx.instrument(&runner);

    inst.prepare(&BuildOptions::default()).unwrap();

    assert!(runner.calls().is_empty());
    assert_eq!(inst.stage(), Stage::BinaryReady);
    assert_eq!(inst.binary_path(), fx.bin());
}

#[test]
fn only_stale_binary_is_recompiled() {
    let fx = Fixture::new();
    touch(&fx.c(), 200);
    touch(&fx.bin(), 250);
    let runner = scripted_runner();
    let mut inst = fx.instrument(&runner);

    inst.prepare(&BuildOptions::default()).unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].executable, "gcc");
}

#[test]
fn outputs_next_to_source_are_reused() {
    let fx = Fixture::new();
    let c = fx.srcdir.join("templateDIFF.c");
    let bin = fx.srcdir.join("templateDIFF.out");
    touch(&c, 200);
    touch(&bin, 100);
    let runner = scripted_runner();
    let mut inst = fx.instrument(&runner);

    inst.prepare(&BuildOptions::default()).unwrap();

    assert!(runner.calls().is_empty());
    assert_eq!(inst.generated_path(), c);
    assert_eq!(inst.binary_path(), bin);
}

#[test]
fn defines_force_a_rebuild() {
    let fx = Fixture::new();
    touch(&fx.c(), 200);
    touch(&fx.bin(), 100);
    let runner = scripted_runner();
    let mut inst = fx.instrument(&runner);

    let opts = BuildOptions {
        defines: [Some("-DSPLIT=1".into()), None, None],
        no_trace: true,
        ..Default::default()
    };
    inst.prepare(&opts).unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].args[0], "--no-trace");
    assert!(calls[1].args.contains(&"-DSPLIT=1".to_string()));
}

#[test]
fn generator_failure_stops_the_build() {
    let fx = Fixture::new();
    let runner = MockRunner::new();
    runner.respond("mcstas", MockResponse::fail(2));
    let mut inst = fx.instrument(&runner);

    let err = inst.prepare(&BuildOptions::default()).unwrap_err();

    assert!(matches!(err, Error::ExternalProcess { code: Some(2), .. }));
    assert_eq!(runner.calls().len(), 1);
    assert_eq!(inst.stage(), Stage::Uninitialized);
}

#[test]
fn missing_generator_falls_back_to_bare_name() {
    let mut fx = Fixture::new();
    fx.config.bindir = fx.bindir.join("nowhere");
    let runner = scripted_runner();
    let mut inst = fx.instrument(&runner);

    let opts = BuildOptions {
        include: Some(PathBuf::from("lib/extra")),
        ..Default::default()
    };
    inst.prepare(&opts).unwrap();

    let calls = runner.calls();
    assert_eq!(calls[0].executable, "mcstas");
    assert_eq!(calls[0].args[4..], ["-I".to_string(), "lib/extra".to_string()]);
}

#[cfg(unix)]
#[test]
fn unresolvable_generator_is_tool_not_found() {
    let mut fx = Fixture::new();
    fx.config.bindir = fx.bindir.join("nowhere");
    let tools = Toolchain {
        config: &fx.config,
        platform: &Posix,
        runner: &mcrun::process::SystemRunner,
        env: &ProcessEnv,
    };
    let mut inst = Instrument::new(&fx.source, &fx.work, tools).unwrap();

    let opts = BuildOptions {
        codegen: Some("mcrun-test-no-such-generator".into()),
        ..Default::default()
    };
    let err = inst.prepare(&opts).unwrap_err();

    assert!(matches!(err, Error::ToolNotFound { ref bare, .. } if bare == "mcrun-test-no-such-generator"));
}

#[test]
fn missing_source_is_rejected_before_spawning() {
    let fx = Fixture::new();
    let runner = MockRunner::new();
    let tools = Toolchain {
        config: &fx.config,
        platform: &Posix,
        runner: &runner,
        env: &ProcessEnv,
    };

    let err = Instrument::new(fx.srcdir.join("nope.instr"), &fx.work, tools).err().unwrap();

    assert!(matches!(err, Error::Precondition(_)));
    assert!(runner.calls().is_empty());
}

// ── Run ──────────────────────────────────────────────────────────────

fn prepared<'a>(fx: &'a Fixture, runner: &'a MockRunner, opts: &BuildOptions) -> Instrument<'a> {
    touch(&fx.c(), 200);
    touch(&fx.bin(), 100);
    let mut inst = fx.instrument(runner);
    inst.set_parameter("lambda", "2.8");
    inst.prepare(opts).unwrap();
    inst
}

#[test]
fn run_before_prepare_is_a_precondition_error() {
    let fx = Fixture::new();
    let runner = MockRunner::new();
    let mut inst = fx.instrument(&runner);

    let err = inst
        .run(&RunOptions::default(), Output::Capture, &RunOverrides::new(), None)
        .unwrap_err();

    assert!(matches!(err, Error::Precondition(_)));
    assert!(inst.info(&RunOptions::default()).is_err());
    assert!(runner.calls().is_empty());
}

#[test]
fn plain_run_invokes_binary_with_args() {
    let fx = Fixture::new();
    let runner = MockRunner::new();
    let mut inst = prepared(&fx, &runner, &BuildOptions::default());

    let opts = RunOptions {
        ncount: Some("1e6".into()),
        seed: Some("42".into()),
        gravitation: true,
        ..Default::default()
    };
    inst.run(&opts, Output::Capture, &RunOverrides::new(), None).unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].executable, s(&fx.bin()));
    assert_eq!(calls[0].args, ["--seed=42", "--ncount=1e6", "--gravitation", "lambda=2.8"]);
    assert_eq!(inst.stage(), Stage::Executed);
}

#[test]
fn overrides_shadow_stored_options() {
    let fx = Fixture::new();
    let runner = MockRunner::new();
    let mut inst = prepared(&fx, &runner, &BuildOptions::default());

    let opts = RunOptions {
        ncount: Some("1e6".into()),
        yes: true,
        ..Default::default()
    };
    let overrides = RunOverrides::new().value("ncount", "10").flag("yes", false);
    inst.run(&opts, Output::Capture, &overrides, None).unwrap();
    inst.run(&opts, Output::Capture, &RunOverrides::new(), None).unwrap();

    let calls = runner.calls();
    assert_eq!(calls[0].args, ["--ncount=10", "lambda=2.8"]);
    assert_eq!(calls[1].args, ["--ncount=1e6", "--yes", "lambda=2.8"]);
}

#[test]
fn distributed_run_wraps_the_launcher() {
    let fx = Fixture::new();
    let runner = MockRunner::new();
    let build = BuildOptions {
        mpi: Some(MpiWorkers::Count(4)),
        openacc: true,
        ..Default::default()
    };
    let mut inst = prepared(&fx, &runner, &build);

    let opts = RunOptions {
        machines: Some(PathBuf::from("hosts.txt")),
        ..Default::default()
    };
    inst.run(&opts, Output::Capture, &RunOverrides::new(), None).unwrap();

    let calls = runner.calls();
    assert_eq!(calls[0].executable, "mpirun");
    assert_eq!(
        calls[0].args,
        [
            "-np".to_string(),
            "4".to_string(),
            "-machinefile".to_string(),
            "hosts.txt".to_string(),
            s(&fx.bindir.join("mcstas-acc_gpu_bind")),
            s(&fx.bin()),
            "lambda=2.8".to_string(),
        ]
    );
}

#[test]
fn launcher_can_be_forced_on_or_off() {
    let fx = Fixture::new();
    let runner = MockRunner::new();
    let build = BuildOptions {
        mpi: Some(MpiWorkers::Auto),
        ..Default::default()
    };
    let mut inst = prepared(&fx, &runner, &build);
    let opts = RunOptions {
        mpirun: Some("/opt/mpi/bin/mpiexec".into()),
        ..Default::default()
    };

    inst.run(&opts, Output::Capture, &RunOverrides::new(), Some(false)).unwrap();
    inst.run(&opts, Output::Capture, &RunOverrides::new(), None).unwrap();

    let calls = runner.calls();
    assert_eq!(calls[0].executable, s(&fx.bin()));
    assert_eq!(calls[1].executable, "/opt/mpi/bin/mpiexec");
    assert_eq!(calls[1].args, ["--".to_string(), s(&fx.bin()), "lambda=2.8".to_string()]);
}

#[test]
fn nexus_run_spawns_metadata_generator_first() {
    let fx = Fixture::new();
    let runner = MockRunner::new();
    let build = BuildOptions {
        format: "NeXus".into(),
        ..Default::default()
    };
    let mut inst = prepared(&fx, &runner, &build);

    let opts = RunOptions {
        ncount: Some("10".into()),
        dir: Some(PathBuf::from("out")),
        format: Some("NeXus".into()),
        idf: true,
        ..Default::default()
    };
    inst.run(&opts, Output::Capture, &RunOverrides::new(), None).unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].executable, "mcstas2idf");
    assert_eq!(calls[0].args, [s(&fx.source), "--ncount=10".into(), "lambda=2.8".into()]);
    assert_eq!(calls[1].executable, s(&fx.bin()));
    assert_eq!(
        calls[1].args,
        ["--ncount=10", "--dir=out", "--format=NeXus", "lambda=2.8", "--IDF"]
    );
}

#[test]
fn metadata_generator_is_mcstas_only() {
    let mut fx = Fixture::new();
    fx.config.product = Product::McXtrace;
    let runner = MockRunner::new();
    let build = BuildOptions {
        format: "NeXus".into(),
        ..Default::default()
    };
    let mut inst = prepared(&fx, &runner, &build);

    let opts = RunOptions {
        idf: true,
        ..Default::default()
    };
    inst.run(&opts, Output::Capture, &RunOverrides::new(), None).unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].args.contains(&"--IDF".to_string()));
}

#[test]
fn info_parses_the_binary_self_description() {
    let fx = Fixture::new();
    let runner = MockRunner::new();
    runner.respond(
        &s(&fx.bin()),
        MockResponse::ok(
            "begin instrument: templateDIFF\n  Name: templateDIFF\n  Parameters: lambda DM\nend instrument\n",
        ),
    );
    let mut inst = prepared(&fx, &runner, &BuildOptions::default());

    let report = inst.info(&RunOptions::default()).unwrap();

    assert_eq!(report.parameters(), ["lambda", "DM"]);
    assert_eq!(runner.calls()[0].args, ["--info"]);
}
