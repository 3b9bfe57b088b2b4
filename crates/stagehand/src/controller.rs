use std::path::{Path, PathBuf};

use crate::archive;
use crate::config::StageConfig;
use crate::error::{Error, Result};
use crate::outputs::{OutputWriter, RoundOutcome};
use crate::round::{Round, RoundCtx, StageEvent};
use crate::runner::{BuildRunner, BuildStatus};
use crate::store::{Resolved, StoreClient};

/// The staging controller: runs one round of a build too long for any single
/// execution slot, resuming from and publishing to the checkpoint store.
///
/// Round flow: entry guard, optional resume (resolve/fetch/unpack, degrading
/// to fresh on any fault), exactly one build invocation, then either package
/// publication or a working-tree checkpoint. Faults never skip the checkpoint
/// step; launch faults are re-raised after it.
pub struct Controller<'a> {
    cfg: &'a StageConfig,
    store: &'a StoreClient,
    runner: &'a dyn BuildRunner,
    outputs: &'a OutputWriter,
}

impl<'a> Controller<'a> {
    pub fn new(
        cfg: &'a StageConfig,
        store: &'a StoreClient,
        runner: &'a dyn BuildRunner,
        outputs: &'a OutputWriter,
    ) -> Self {
        Self {
            cfg,
            store,
            runner,
            outputs,
        }
    }

    pub fn run_round(&self, round: &Round, ctx: &RoundCtx) -> Result<RoundOutcome> {
        // Terminal marker from a prior round: report and do nothing, so the
        // overall multi-round process is idempotent once finished.
        if round.finished {
            ctx.log("already finished; nothing to do");
            return self.finish(ctx, RoundOutcome::completed());
        }

        let working_dir = self.cfg.working_dir_path();
        std::fs::create_dir_all(&working_dir).map_err(|e| {
            Error::msg(format!(
                "failed to create working dir {}: {e}",
                working_dir.display()
            ))
        })?;

        if round.resume_requested {
            self.try_resume(round, &working_dir, ctx);
        }

        if ctx.cancelled() {
            return self.checkpoint_and_raise(
                round,
                &working_dir,
                ctx,
                Error::msg("round cancelled before build start"),
            );
        }

        ctx.step("build");
        match self.runner.run(&round.variant, &working_dir, ctx) {
            Ok(BuildStatus::Success) => {
                self.publish_package(round, ctx);
                self.finish(ctx, RoundOutcome::completed())
            }
            Ok(BuildStatus::Incomplete { code }) => {
                ctx.log(&format!("build incomplete (exit {code}); checkpointing"));
                let resume_ref = self.checkpoint_working_tree(round, &working_dir, ctx)?;
                self.finish(ctx, RoundOutcome::checkpointed(resume_ref))
            }
            Err(fault) => self.checkpoint_and_raise(round, &working_dir, ctx, fault),
        }
    }

    // Resume is strictly best-effort: a missing, stale, or corrupt checkpoint
    // must never block forward progress.
    fn try_resume(&self, round: &Round, working_dir: &Path, ctx: &RoundCtx) {
        ctx.step("resume");
        let name = round.variant.checkpoint_name();
        let resolved = match self
            .store
            .resolve(&name, round.explicit_checkpoint_ref.as_deref())
        {
            Ok(r) => r,
            Err(e) => {
                ctx.warn(&format!("checkpoint resolution failed ({e}); starting fresh"));
                return;
            }
        };
        match resolved {
            Resolved::Ref(ref_id) => {
                match self.store.fetch_into(&ref_id, restore_dest(working_dir)) {
                    Ok(()) => ctx.log(&format!("resumed from checkpoint ref {ref_id}")),
                    Err(e) => ctx.warn(&format!(
                        "checkpoint ref {ref_id} unusable ({e}); starting fresh"
                    )),
                }
            }
            Resolved::RejectedExplicit(raw) => {
                ctx.warn(&format!("malformed checkpoint ref '{raw}'; starting fresh"));
            }
            Resolved::NotFound => {
                ctx.log(&format!("no checkpoint under '{name}'; starting fresh"));
            }
        }
    }

    // A completed build is worth far more than its upload: publish failures
    // are warnings and the round still reports completion.
    fn publish_package(&self, round: &Round, ctx: &RoundCtx) {
        ctx.step("package");
        let files = match self.collect_package_files() {
            Ok(f) => f,
            Err(e) => {
                ctx.warn(&format!("package collection failed ({e}); not published"));
                return;
            }
        };
        if files.is_empty() {
            ctx.warn(&format!(
                "no outputs matched package glob '{}' under {}; not published",
                self.cfg.package.glob,
                self.cfg.package_dir_path().display()
            ));
            return;
        }
        let name = round.variant.package_name();
        match self
            .store
            .publish(&name, &files, self.cfg.package_retention())
        {
            Ok(ref_id) => ctx.log(&format!("published package '{name}' as ref {ref_id}")),
            Err(e) => ctx.warn(&format!("package '{name}' was not durably saved: {e}")),
        }
    }

    fn collect_package_files(&self) -> Result<Vec<PathBuf>> {
        let matcher = self.cfg.package.matcher()?;
        let dir = self.cfg.package_dir_path();
        let mut files = Vec::new();
        // Outputs land directly in the package dir; never descend into the
        // working tree that lives beneath it.
        for entry in walkdir::WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(leaf) = entry.file_name().to_str() else {
                continue;
            };
            if matcher.is_match(leaf) {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Packs the working tree and publishes it under the variant's checkpoint
    /// name. A publish failure only costs the resume ref; a packing failure
    /// propagates (the filesystem is assumed reliable, so that is a real
    /// environment fault).
    fn checkpoint_working_tree(
        &self,
        round: &Round,
        working_dir: &Path,
        ctx: &RoundCtx,
    ) -> Result<Option<String>> {
        ctx.step("checkpoint");
        let settle = self.cfg.settle_delay();
        if !settle.is_zero() {
            // Let in-flight writes from the just-terminated build settle
            // before reading the tree. A mitigation, not a guarantee.
            std::thread::sleep(settle);
        }

        let staging = tempfile::tempdir()
            .map_err(|e| Error::msg(format!("failed to create checkpoint staging dir: {e}")))?;
        let payload = staging.path().join("payload.tar");
        archive::pack(working_dir, &payload)?;

        let name = round.variant.checkpoint_name();
        match self
            .store
            .publish(&name, &[payload], self.cfg.checkpoint_retention())
        {
            Ok(ref_id) => {
                ctx.log(&format!("published checkpoint '{name}' as ref {ref_id}"));
                Ok(Some(ref_id))
            }
            Err(e) => {
                ctx.warn(&format!("checkpoint '{name}' was not durably saved: {e}"));
                Ok(None)
            }
        }
    }

    // Launch faults (process could not start, interruption): checkpoint and
    // report unconditionally, then propagate the original fault so the
    // scheduler sees a hard failure distinct from "not yet done".
    fn checkpoint_and_raise(
        &self,
        round: &Round,
        working_dir: &Path,
        ctx: &RoundCtx,
        fault: Error,
    ) -> Result<RoundOutcome> {
        ctx.warn(&format!("build fault: {fault}"));
        let resume_ref = match self.checkpoint_working_tree(round, working_dir, ctx) {
            Ok(r) => r,
            Err(e) => {
                ctx.warn(&format!("checkpoint after fault failed: {e}"));
                None
            }
        };
        self.finish(ctx, RoundOutcome::checkpointed(resume_ref))?;
        Err(fault)
    }

    fn finish(&self, ctx: &RoundCtx, outcome: RoundOutcome) -> Result<RoundOutcome> {
        self.outputs.write(&outcome)?;
        ctx.sink.emit(StageEvent::RoundFinished {
            completed: outcome.completed,
            resume_ref: outcome.resume_ref.clone(),
        });
        Ok(outcome)
    }
}

fn restore_dest(working_dir: &Path) -> &Path {
    // Checkpoints are packed with the working dir's leaf as the archive root,
    // so restoring into the parent recreates the tree in place.
    working_dir.parent().unwrap_or_else(|| Path::new("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::round::StageSink;
    use crate::store::{BlobEntry, BlobStore, DeleteTarget};
    use crate::variant::{Arch, Variant};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        warns: Mutex<Vec<String>>,
    }

    impl StageSink for RecordingSink {
        fn emit(&self, ev: StageEvent) {
            if let StageEvent::Warn { line } = ev {
                self.warns.lock().unwrap().push(line);
            }
        }
    }

    /// Any store traffic during an entry-guarded round is a bug.
    struct PanickyStore;

    impl BlobStore for PanickyStore {
        fn store(
            &self,
            _name: &str,
            _context: &str,
            _payload: &[PathBuf],
            _retention: Duration,
        ) -> Result<String> {
            panic!("store must not be touched");
        }

        fn fetch(&self, _ref_id: &str, _dest: &Path) -> Result<Vec<PathBuf>> {
            panic!("store must not be touched");
        }

        fn list(&self, _name: &str) -> Result<Vec<BlobEntry>> {
            panic!("store must not be touched");
        }

        fn delete(&self, _target: DeleteTarget<'_>) -> Result<()> {
            panic!("store must not be touched");
        }
    }

    struct PanickyRunner;

    impl BuildRunner for PanickyRunner {
        fn run(&self, _v: &Variant, _wd: &Path, _ctx: &RoundCtx) -> Result<BuildStatus> {
            panic!("build must not run");
        }
    }

    #[test]
    fn finished_round_is_idempotent_and_touches_nothing() {
        let cfg = StageConfig::default();
        let store = StoreClient::new(
            Box::new(PanickyStore),
            "run-1",
            RetryPolicy::new(1, Duration::ZERO),
            Duration::from_secs(60),
        );
        let outputs = OutputWriter::new(None);
        let controller = Controller::new(&cfg, &store, &PanickyRunner, &outputs);
        let mut round = Round::fresh(Variant::new(Arch::X64, None));
        round.finished = true;
        let ctx = RoundCtx::new(Arc::new(RecordingSink::default()));

        for _ in 0..3 {
            let outcome = controller.run_round(&round, &ctx).expect("round");
            assert_eq!(outcome, RoundOutcome::completed());
        }
    }
}
