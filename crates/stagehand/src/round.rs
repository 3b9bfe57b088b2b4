use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};

use crate::variant::Variant;

/// Inputs for one controller invocation. Rounds are created at invocation
/// start and never persisted; continuation state lives in the store.
#[derive(Debug, Clone)]
pub struct Round {
    /// Terminal marker carried forward by the scheduler once a prior round
    /// completed the build.
    pub finished: bool,
    pub resume_requested: bool,
    pub variant: Variant,
    /// Caller-supplied override; takes precedence over name-based lookup.
    pub explicit_checkpoint_ref: Option<String>,
}

impl Round {
    pub fn fresh(variant: Variant) -> Self {
        Self {
            finished: false,
            resume_requested: false,
            variant,
            explicit_checkpoint_ref: None,
        }
    }

    pub fn resuming(variant: Variant) -> Self {
        Self {
            resume_requested: true,
            ..Self::fresh(variant)
        }
    }
}

#[derive(Debug, Clone)]
pub enum StageEvent {
    StepStarted {
        step: String,
    },
    Log {
        line: String,
    },
    Warn {
        line: String,
    },
    RoundFinished {
        completed: bool,
        resume_ref: Option<String>,
    },
}

pub trait StageSink: Send + Sync {
    fn emit(&self, ev: StageEvent);
}

#[derive(Default)]
pub struct StdoutSink;

impl StageSink for StdoutSink {
    fn emit(&self, ev: StageEvent) {
        match ev {
            StageEvent::StepStarted { step } => println!("RUN: {step}"),
            StageEvent::Log { line } => println!("{line}"),
            StageEvent::Warn { line } => println!("WARN: {line}"),
            StageEvent::RoundFinished {
                completed,
                resume_ref,
            } => {
                let resume = resume_ref.as_deref().unwrap_or("");
                println!("DONE: completed={completed} resume_ref={resume}");
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<StageEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StageEvent>) -> Self {
        Self { tx }
    }
}

impl StageSink for ChannelSink {
    fn emit(&self, ev: StageEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Execution context for one round: the cancellation token checked at step
/// boundaries and the event sink. Cancellation never aborts mid-step state;
/// the controller's failure path doubles as the cancellation handler.
#[derive(Clone)]
pub struct RoundCtx {
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn StageSink>,
}

impl RoundCtx {
    pub fn new(sink: Arc<dyn StageSink>) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn step(&self, step: impl Into<String>) {
        self.sink.emit(StageEvent::StepStarted { step: step.into() });
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(StageEvent::Log {
            line: msg.to_string(),
        });
    }

    pub fn warn(&self, msg: &str) {
        self.sink.emit(StageEvent::Warn {
            line: msg.to_string(),
        });
    }
}
