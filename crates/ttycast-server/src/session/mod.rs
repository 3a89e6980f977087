//! Sessions: one worker process, its recording and control state, and the
//! connections watching it.

pub mod control;
pub mod crash;
pub mod handler;
pub mod lock;
pub mod moderation;
pub mod pty;
pub mod recorder;
pub mod recording;
pub mod registry;
pub mod signal;

pub use control::{ControlChannel, ControlEvent};
pub use handler::{SessionContext, SessionHandler, SessionState, Watcher, WatcherRole};
pub use recorder::{RecorderEvent, TerminalRecorder};
pub use registry::SessionRegistry;

use std::sync::Arc;

/// Numeric session id, also used as the lobby entry id.
pub type SessionId = u64;

/// Numeric client connection id.
pub type ConnId = u64;

/// Callback through which background tasks report to the broker.
pub type EventSink<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Everything a session handler reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Terminal(RecorderEvent),
    Control(ControlEvent),
    /// Grace period after announcing a stale-process purge ran out.
    PurgeGraceElapsed,
    /// Periodic check on a stale process after SIGHUP.
    PurgeRecheck,
    IdleCheck,
    /// The worker ignored the graceful stop.
    KillTimeout,
}
