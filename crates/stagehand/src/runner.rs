use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::round::RoundCtx;
use crate::variant::Variant;

/// Exit classification for one build step invocation. A non-zero exit is an
/// expected, recoverable outcome; spawn failures and interruptions surface as
/// `Err` so the caller can re-raise them after checkpointing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Incomplete { code: i32 },
}

pub trait BuildRunner: Send + Sync {
    fn run(&self, variant: &Variant, working_dir: &Path, ctx: &RoundCtx) -> Result<BuildStatus>;
}

/// Invokes the external build executable with the fixed argument contract.
/// Output streams are inherited, never interpreted; the process exit status
/// is the whole contract.
pub struct ProcessRunner {
    program: String,
    script: String,
    parallelism: u32,
    bootstrap: Option<Vec<String>>,
}

impl ProcessRunner {
    pub fn new(
        program: impl Into<String>,
        script: impl Into<String>,
        parallelism: u32,
        bootstrap: Option<Vec<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            parallelism,
            bootstrap: bootstrap.filter(|v| !v.is_empty()),
        }
    }

    // Best-effort dependency bootstrap before the build proper; a failure
    // here is the build's problem to report, not ours.
    fn run_bootstrap(&self, working_dir: &Path, ctx: &RoundCtx) {
        let Some((prog, args)) = self.bootstrap.as_ref().and_then(|p| p.split_first()) else {
            return;
        };
        ctx.log(&format!("bootstrap: {} {}", prog, args.join(" ")));
        let status = Command::new(prog)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => ctx.warn(&format!("bootstrap exited with {s} (continuing)")),
            Err(e) => ctx.warn(&format!("bootstrap could not be started: {e} (continuing)")),
        }
    }
}

impl BuildRunner for ProcessRunner {
    fn run(&self, variant: &Variant, working_dir: &Path, ctx: &RoundCtx) -> Result<BuildStatus> {
        if ctx.cancelled() {
            return Err(Error::msg("build interrupted before start"));
        }
        self.run_bootstrap(working_dir, ctx);

        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.script)
            .args(variant.build_args(self.parallelism))
            .current_dir(working_dir)
            .stdin(Stdio::null());

        // On unix: own process group, so cancellation can kill the whole
        // build subtree, not just the top-level interpreter.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        ctx.log(&format!(
            "build: {} {} {}",
            self.program,
            self.script,
            variant.build_args(self.parallelism).join(" ")
        ));
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::msg(format!("failed to start build process: {e}")))?;
        let pgid = child.id();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return match status.code() {
                        Some(0) => Ok(BuildStatus::Success),
                        Some(code) => Ok(BuildStatus::Incomplete { code }),
                        // Killed by a signal we didn't send: an environment
                        // fault the scheduler should see.
                        None => Err(Error::msg(format!("build terminated abnormally: {status}"))),
                    };
                }
                Ok(None) => {
                    if ctx.cancelled() {
                        kill_pgroup(pgid, false);
                        kill_pgroup(pgid, true);
                        let _ = child.wait();
                        return Err(Error::msg("build interrupted by cancellation"));
                    }
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(e) => {
                    return Err(Error::msg(format!("failed to wait for build process: {e}")));
                }
            }
        }
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::{StageSink, StageEvent};
    use crate::variant::{Arch, Variant};
    use std::sync::Arc;

    struct NullSink;

    impl StageSink for NullSink {
        fn emit(&self, _ev: StageEvent) {}
    }

    fn ctx() -> RoundCtx {
        RoundCtx::new(Arc::new(NullSink))
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let p = dir.join("build.sh");
        std::fs::write(&p, body).expect("write script");
        let mut perm = std::fs::metadata(&p).expect("stat").permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(&p, perm).expect("chmod");
        p
    }

    #[cfg(unix)]
    #[test]
    fn zero_exit_is_success() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let script = write_script(tmp.path(), "#!/bin/sh\nexit 0\n");
        let runner = ProcessRunner::new("sh", script.to_string_lossy(), 2, None);
        let status = runner
            .run(&Variant::new(Arch::X64, None), tmp.path(), &ctx())
            .expect("run");
        assert_eq!(status, BuildStatus::Success);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_incomplete_not_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let script = write_script(tmp.path(), "#!/bin/sh\nexit 3\n");
        let runner = ProcessRunner::new("sh", script.to_string_lossy(), 2, None);
        let status = runner
            .run(&Variant::new(Arch::X64, None), tmp.path(), &ctx())
            .expect("run");
        assert_eq!(status, BuildStatus::Incomplete { code: 3 });
    }

    #[test]
    fn unstartable_program_is_a_launch_fault() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessRunner::new("definitely-not-a-real-binary", "build.py", 2, None);
        let err = runner
            .run(&Variant::new(Arch::X64, None), tmp.path(), &ctx())
            .expect_err("must fail");
        assert!(err.to_string().contains("failed to start build process"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_the_build_and_reports_interruption() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let script = write_script(tmp.path(), "#!/bin/sh\nsleep 30\n");
        let runner = ProcessRunner::new("sh", script.to_string_lossy(), 2, None);
        let ctx = ctx();
        let canceller = ctx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            canceller.request_cancel();
        });
        let err = runner
            .run(&Variant::new(Arch::X64, None), tmp.path(), &ctx)
            .expect_err("must be interrupted");
        assert!(err.to_string().contains("interrupted"), "{err}");
    }
}
