use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const OUTPUT_FILE_ENV: &str = "STAGEHAND_OUTPUT";

/// The sole contract with the external scheduler: whether the build is done,
/// and the checkpoint ref a follow-up round should resume from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    pub completed: bool,
    pub resume_ref: Option<String>,
}

impl RoundOutcome {
    pub fn completed() -> Self {
        Self {
            completed: true,
            resume_ref: None,
        }
    }

    pub fn checkpointed(resume_ref: Option<String>) -> Self {
        Self {
            completed: false,
            resume_ref,
        }
    }

    /// Scheduler-facing `key=value` lines. `resume_ref` is present but empty
    /// when not applicable.
    pub fn lines(&self) -> [String; 2] {
        [
            format!("finished={}", self.completed),
            format!("resume_ref={}", self.resume_ref.as_deref().unwrap_or("")),
        ]
    }
}

/// Writes round outcomes where the scheduler reads them: stdout always, plus
/// an append-only output file when one is configured (the `STAGEHAND_OUTPUT`
/// convention).
pub struct OutputWriter {
    file: Option<PathBuf>,
}

impl OutputWriter {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self { file }
    }

    pub fn from_env() -> Self {
        let file = std::env::var(OUTPUT_FILE_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        Self { file }
    }

    pub fn write(&self, outcome: &RoundOutcome) -> Result<()> {
        let lines = outcome.lines();
        for line in &lines {
            println!("{line}");
        }
        if let Some(path) = self.file.as_ref() {
            let mut f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    Error::msg(format!("failed to open output file {}: {e}", path.display()))
                })?;
            for line in &lines {
                writeln!(f, "{line}").map_err(|e| {
                    Error::msg(format!(
                        "failed to write output file {}: {e}",
                        path.display()
                    ))
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_outcome_has_empty_resume_ref() {
        let lines = RoundOutcome::completed().lines();
        assert_eq!(lines[0], "finished=true");
        assert_eq!(lines[1], "resume_ref=");
    }

    #[test]
    fn checkpointed_outcome_carries_the_ref() {
        let lines = RoundOutcome::checkpointed(Some("42".into())).lines();
        assert_eq!(lines[0], "finished=false");
        assert_eq!(lines[1], "resume_ref=42");
    }

    #[test]
    fn output_file_accumulates_across_rounds() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("outputs.txt");
        let w = OutputWriter::new(Some(path.clone()));
        w.write(&RoundOutcome::checkpointed(Some("7".into())))
            .expect("write 1");
        w.write(&RoundOutcome::completed()).expect("write 2");
        let body = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(
            body,
            "finished=false\nresume_ref=7\nfinished=true\nresume_ref=\n"
        );
    }
}
