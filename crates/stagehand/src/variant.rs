use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X64,
    X86,
    Arm,
}

impl Default for Arch {
    fn default() -> Self {
        Self::X64
    }
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::X86 => "x86",
            Arch::Arm => "arm",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "x64" | "default" => Ok(Arch::X64),
            "x86" => Ok(Arch::X86),
            "arm" => Ok(Arch::Arm),
            other => Err(Error::msg(format!(
                "unknown architecture '{}' (expected x64/x86/arm)",
                other
            ))),
        }
    }
}

/// Architecture x optional feature-level selector. Checkpoint and package
/// names are pure functions of this value so distinct variants never collide
/// and a resuming round always looks up the name a prior round published.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Variant {
    pub arch: Arch,
    pub simd: Option<String>,
}

impl Default for Variant {
    fn default() -> Self {
        Self {
            arch: Arch::X64,
            simd: None,
        }
    }
}

impl Variant {
    pub fn new(arch: Arch, simd: Option<String>) -> Self {
        let simd = simd
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_ascii_lowercase);
        Self { arch, simd }
    }

    pub fn label(&self) -> String {
        match self.simd.as_deref() {
            Some(simd) => format!("{}-{}", self.arch.as_str(), simd),
            None => self.arch.as_str().to_string(),
        }
    }

    pub fn checkpoint_name(&self) -> String {
        format!("build-cache-{}", self.label())
    }

    pub fn package_name(&self) -> String {
        format!("chromium-{}", self.label())
    }

    /// Fixed argument contract for the external build process: ci mode, a
    /// parallelism hint, the architecture selector, and the optional
    /// feature-level flag.
    pub fn build_args(&self, parallelism: u32) -> Vec<String> {
        let mut args = vec!["--ci".to_string(), "-j".to_string(), parallelism.to_string()];
        match self.arch {
            Arch::X64 => {}
            Arch::X86 => args.push("--x86".to_string()),
            Arch::Arm => args.push("--arm".to_string()),
        }
        if let Some(simd) = self.simd.as_deref() {
            args.push("--cpu-level".to_string());
            args.push(simd.to_string());
        }
        args
    }
}
