//! Typed events flowing from the engines into the core orchestrator.
//!
//! Components never call back into the orchestrator or into each other;
//! everything they have to say travels through this bus.

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A user became the active console user.
    SessionStart { user: String },
    /// The active console user logged out or switched away. When the same
    /// poll also produced a `SessionStart` (a direct switch), `switched`
    /// is true and the heartbeat for the pair rides on the start event.
    SessionEnd { user: String, switched: bool },
    /// An allowed process appeared.
    ProcessOpened { pid: u32, name: String },
    /// A previously-reported process is gone.
    ProcessClosed { pid: u32, name: String },
    /// The enforcer decided to terminate a process.
    PolicyViolation { pid: u32, name: String, path: String },
    /// Termination succeeded.
    ProcessBlocked { pid: u32, name: String, path: String },
    /// Termination failed; the PID stays in the known set and is not
    /// retried.
    KillFailed { pid: u32, name: String, path: String, error: String },
    /// Dry-run stand-in for a termination.
    DryRunBlock { pid: u32, name: String, path: String },
    /// A browser navigation passed the importance filter.
    BrowserVisit { browser: String, action: String },
    /// Activity reported by the managed shell over IPC.
    ShellActivity { program: String, action: String },
}
