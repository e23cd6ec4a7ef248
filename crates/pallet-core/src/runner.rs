use crate::concurrency::CancellationToken;
use pallet_schema::{Manifest, TestStep};
use pallet_store::InstallLayout;
use serde::Serialize;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Captured output beyond this is not logged.
const MAX_LOGGED_OUTPUT: u64 = 64 * 1024;

/// The first smoke test that did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestFailure {
    pub index: usize,
    pub command: String,
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    pub reason: String,
}

/// Outcome of running a manifest's smoke tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestReport {
    /// Commands that passed, in order.
    pub passed: Vec<String>,
    pub failure: Option<TestFailure>,
    /// Steps not run because an earlier one failed.
    pub skipped: usize,
}

impl TestReport {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Runs smoke tests against an installed prefix.
///
/// Each command runs with the prefix's executable directories at the front
/// of `PATH`, stdin closed, in a scratch working directory and its own
/// process group. Output goes to anonymous temp files and is logged at debug
/// level. A timeout or cancellation kills the whole group, so commands that
/// fork helpers cannot outlive it.
pub struct SmokeTestRunner {
    path_dirs: Vec<PathBuf>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl SmokeTestRunner {
    pub fn new(layout: &InstallLayout) -> Self {
        Self {
            path_dirs: layout.executable_dirs(),
            timeout: DEFAULT_TEST_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// `PATH` for test commands: executable dirs first, then the inherited `PATH`.
    pub fn search_path(&self) -> OsString {
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = self
            .path_dirs
            .iter()
            .cloned()
            .chain(std::env::split_paths(&inherited));
        std::env::join_paths(dirs).unwrap_or(inherited)
    }

    pub fn run(&self, manifest: &Manifest) -> TestReport {
        let steps = manifest.test_steps();
        let mut report = TestReport::default();
        if steps.is_empty() {
            debug!("{}: no smoke tests", manifest.name());
            return report;
        }

        let workdir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => {
                report.failure = Some(TestFailure {
                    index: 0,
                    command: steps[0].display(),
                    exit_code: None,
                    reason: format!("cannot create test working directory: {e}"),
                });
                report.skipped = steps.len() - 1;
                return report;
            }
        };
        let path = self.search_path();

        for (index, step) in steps.iter().enumerate() {
            match self.run_step(index, step, &path, workdir.path()) {
                Ok(()) => report.passed.push(step.display()),
                Err(failure) => {
                    warn!(
                        "{}: smoke test {index} `{}` failed: {}",
                        manifest.name(),
                        failure.command,
                        failure.reason
                    );
                    report.skipped = steps.len() - index - 1;
                    report.failure = Some(failure);
                    return report;
                }
            }
        }
        info!("{}: {} smoke tests passed", manifest.name(), report.passed.len());
        report
    }

    fn run_step(
        &self,
        index: usize,
        step: &TestStep,
        path: &OsStr,
        workdir: &std::path::Path,
    ) -> Result<(), TestFailure> {
        let command = step.display();
        let fail = |exit_code: Option<i32>, reason: String| TestFailure {
            index,
            command: command.clone(),
            exit_code,
            reason,
        };
        if self.cancel.is_cancelled() {
            return Err(fail(None, "cancelled".to_owned()));
        }
        debug!("smoke test {index}: {command}");

        let capture_failed = |e: std::io::Error| fail(None, format!("cannot capture output: {e}"));
        let stdout = tempfile::tempfile().map_err(&capture_failed)?;
        let stderr = tempfile::tempfile().map_err(&capture_failed)?;

        let mut cmd = Command::new(step.program());
        cmd.args(step.args())
            .env("PATH", path)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(stdout.try_clone().map_err(&capture_failed)?)
            .stderr(stderr.try_clone().map_err(&capture_failed)?);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| fail(None, format!("failed to spawn: {e}")))?;

        let waited = self.wait(&mut child);
        log_captured(index, "stdout", stdout);
        log_captured(index, "stderr", stderr);

        let status = waited.map_err(|reason| fail(None, reason))?;
        if status.success() {
            Ok(())
        } else {
            Err(fail(status.code(), describe_status(status)))
        }
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, String> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => return Err(format!("failed to wait for command: {e}")),
            }
            let reason = if started.elapsed() >= self.timeout {
                format!("timed out after {}s", self.timeout.as_secs_f32())
            } else if self.cancel.is_cancelled() {
                "cancelled".to_owned()
            } else {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            };
            kill_group(child);
            let _ = child.kill();
            let _ = child.wait();
            return Err(reason);
        }
    }
}

/// SIGKILL every process in the child's group.
#[cfg(unix)]
fn kill_group(child: &Child) {
    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill() only sends a signal; the negated pid names the group the
    // child leads since spawn.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            warn!("failed to kill process group {pgid}: {errno}");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

fn log_captured(index: usize, stream: &str, mut file: File) {
    let mut buf = Vec::new();
    let read = match file.seek(SeekFrom::Start(0)) {
        Ok(_) => file.take(MAX_LOGGED_OUTPUT).read_to_end(&mut buf),
        Err(e) => Err(e),
    };
    match read {
        Ok(0) => {}
        Ok(_) => debug!("smoke test {index} {stream}:\n{}", String::from_utf8_lossy(&buf)),
        Err(e) => debug!("smoke test {index} {stream} unreadable: {e}"),
    }
}

fn describe_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("command exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(sig) => format!("command killed by signal {sig}"),
            None => "command failed with unknown status".to_owned(),
        }
    }
    #[cfg(not(unix))]
    {
        "command failed with unknown status".to_owned()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pallet_schema::parse_manifest_str;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn manifest_with_tests(tests: &[&[&str]]) -> Manifest {
        let mut toml = format!(
            r#"
name = "git-web"
[source]
url = "https://example.com/git-web/archive/v1.2.tar.gz"
checksum = "sha256:{}"
[[install]]
source = "git-web"
destination = "bin"
"#,
            "0".repeat(64)
        );
        for cmd in tests {
            let quoted: Vec<String> = cmd.iter().map(|a| format!("{a:?}")).collect();
            toml.push_str(&format!("[[test]]\ncommand = [{}]\n", quoted.join(", ")));
        }
        parse_manifest_str(&toml).unwrap()
    }

    fn layout_with_tool(dir: &std::path::Path, script: &str) -> InstallLayout {
        let layout = InstallLayout::with_root(dir.join("prefix"), dir);
        let bin = layout.prefix().join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("git-web"), script).unwrap();
        fs::set_permissions(bin.join("git-web"), fs::Permissions::from_mode(0o755)).unwrap();
        layout
    }

    #[test]
    fn installed_commands_resolve_via_path() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_with_tool(dir.path(), "#!/bin/sh\necho usage: git-web\n");
        let m = manifest_with_tests(&[&["git-web", "-h"], &["git-web", "--version"]]);
        let report = SmokeTestRunner::new(&layout).run(&m);
        assert!(report.success(), "{report:?}");
        assert_eq!(report.passed, vec!["git-web -h", "git-web --version"]);
    }

    #[test]
    fn stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_with_tool(dir.path(), "#!/bin/sh\n[ \"$1\" = -h ] || exit 3\n");
        let m = manifest_with_tests(&[
            &["git-web", "-h"],
            &["git-web", "--broken"],
            &["git-web", "-h"],
        ]);
        let report = SmokeTestRunner::new(&layout).run(&m);
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.index, 1);
        assert_eq!(failure.command, "git-web --broken");
        assert_eq!(failure.exit_code, Some(3));
        assert_eq!(report.passed.len(), 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_with_tool(dir.path(), "#!/bin/sh\n");
        let m = manifest_with_tests(&[&["definitely-not-installed-anywhere"]]);
        let report = SmokeTestRunner::new(&layout).run(&m);
        let failure = report.failure.unwrap();
        assert_eq!(failure.exit_code, None);
        assert!(failure.reason.contains("spawn"), "{}", failure.reason);
    }

    #[test]
    fn hung_test_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_with_tool(dir.path(), "#!/bin/sh\n");
        let m = manifest_with_tests(&[&["sleep", "10"]]);
        let started = Instant::now();
        let report = SmokeTestRunner::new(&layout)
            .with_timeout(Duration::from_millis(200))
            .run(&m);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.failure.unwrap().reason.contains("timed out"));
    }

    #[test]
    fn shell_wrapped_hang_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_with_tool(dir.path(), "#!/bin/sh\n");
        let m = manifest_with_tests(&[&["sh", "-c", "sleep 5"]]);
        let started = Instant::now();
        let report = SmokeTestRunner::new(&layout)
            .with_timeout(Duration::from_millis(200))
            .run(&m);
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        assert!(report.failure.unwrap().reason.contains("timed out"));
    }

    #[test]
    fn background_helper_does_not_hold_up_a_passing_test() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_with_tool(dir.path(), "#!/bin/sh\n");
        let m = manifest_with_tests(&[&["sh", "-c", "sleep 5 & echo started"]]);
        let started = Instant::now();
        let report = SmokeTestRunner::new(&layout).run(&m);
        assert!(report.success(), "{report:?}");
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[test]
    fn output_larger_than_a_pipe_buffer_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_with_tool(dir.path(), "#!/bin/sh\nhead -c 1000000 /dev/zero\n");
        let m = manifest_with_tests(&[&["git-web"]]);
        let report = SmokeTestRunner::new(&layout)
            .with_timeout(Duration::from_secs(10))
            .run(&m);
        assert!(report.success(), "{report:?}");
    }

    #[test]
    fn no_tests_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_with_tool(dir.path(), "#!/bin/sh\n");
        let report = SmokeTestRunner::new(&layout).run(&manifest_with_tests(&[]));
        assert!(report.success());
        assert!(report.passed.is_empty());
    }

    #[test]
    fn search_path_puts_prefix_first() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_with_tool(dir.path(), "#!/bin/sh\n");
        let runner = SmokeTestRunner::new(&layout);
        let path = runner.search_path();
        let first = std::env::split_paths(&path).next().unwrap();
        assert_eq!(first, layout.prefix().join("bin"));
    }
}
