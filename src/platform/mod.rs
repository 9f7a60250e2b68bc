//! Thin contract over the OS primitives the agent depends on.
//!
//! Everything OS-facing goes through the [`Platform`] trait so the
//! enforcement and session engines can be exercised against scripted
//! implementations. No operation here may panic on denied access; every
//! failure is a recoverable [`PlatformError`].

use std::fmt;

mod windows;

pub use windows::WindowsPlatform;

/// One live process as seen by a single enumeration pass.
///
/// PIDs are reused by the OS; a record is only meaningful within the scan
/// cycle that produced it.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    /// Absent when the kernel denies cheap access to the image path.
    pub image_path: Option<String>,
}

#[derive(Debug)]
pub enum PlatformError {
    /// The OS refused the access right we asked for.
    Denied(String),
    /// The call failed for a reason that may clear up on retry
    /// (process exited, enumeration hiccup, helper unavailable).
    Transient(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Denied(e) => write!(f, "access denied: {}", e),
            PlatformError::Transient(e) => write!(f, "platform error: {}", e),
        }
    }
}

impl std::error::Error for PlatformError {}

pub trait Platform: Send + Sync {
    /// Every currently-live process.
    fn enumerate_processes(&self) -> Result<Vec<ProcessRecord>, PlatformError>;

    /// Full image path for `pid`, or `None` when the process has exited
    /// or the query is denied.
    fn resolve_image_path(&self, pid: u32) -> Option<String>;

    /// Force-terminate `pid` with exit code 1.
    fn terminate(&self, pid: u32) -> Result<(), PlatformError>;

    /// `DOMAIN\user` of the session attached to the physical console, or
    /// the empty string when the console is unattended.
    fn active_console_user(&self) -> Result<String, PlatformError>;

    /// Best-effort elevation of the process token so protected processes
    /// can be opened. Failure is logged by the caller and never aborts
    /// startup.
    fn enable_debug_privilege(&self) -> Result<(), PlatformError>;
}
