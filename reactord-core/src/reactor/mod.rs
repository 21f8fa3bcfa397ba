//! The reactor compares events flowing over the bus against a configured
//! reactor map and executes pre-programmed reactions to the events that
//! match. An incoming event is resolved to a list of reaction files, the
//! files are rendered against the event's tag and payload, the resulting
//! declarations are validated and ordered into chunks, and each chunk is
//! dispatched to one of four execution backends.

pub mod compiler;
pub mod dispatch;
pub mod map;
pub mod process;
pub mod renderer;
pub mod worker_pool;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use process::{start_reactor, ReactorOptions};

/// Identity stamped (as `__user__`) on runner and wheel calls fired by the
/// reactor, and carried in the payload of events published by the bundled
/// clients. Events attributed to this identity are ignored by the reactor so
/// reactions cannot trigger themselves in a loop.
pub const REACTOR_EVENT_USER: &str = "Reactor";

/// Keyword arguments carried by a declaration.
pub type Kwargs = serde_json::Map<String, serde_json::Value>;

/// One executable unit produced by rendering a reaction file. The `state`
/// field names the backend to execute on and is validated (and resolved to a
/// [Backend]) during compilation, so a reaction file with a typo fails
/// validation instead of failing to parse.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Declaration {
    #[serde(default)]
    pub state: String,

    #[serde(default)]
    pub fun: String,

    #[serde(default)]
    pub args: Vec<serde_json::Value>,

    #[serde(default)]
    pub kwargs: Kwargs,

    /// Minion target expression, used by the local backend only.
    #[serde(default, alias = "tgt")]
    pub target: Option<String>,

    /// Names of declarations that must execute before this one.
    #[serde(default)]
    pub require: Vec<String>,

    /// The reaction file this declaration came from. Always overwritten with
    /// the rendered file's path, even when the file set it explicitly, so
    /// validation errors are attributed to the right file.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

/// The execution surfaces a chunk can be dispatched to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Asynchronous minion targeting. Also reachable under the alias `cmd`.
    Local,

    /// Runner module execution, submitted to the worker pool.
    Runner,

    /// Wheel module execution, submitted to the worker pool.
    Wheel,

    /// Synchronous execution in the local calling context.
    Caller,
}

impl Backend {
    pub fn from_state(state: &str) -> Option<Backend> {
        match state {
            "local" | "cmd" => Some(Backend::Local),
            "runner" => Some(Backend::Runner),
            "wheel" => Some(Backend::Wheel),
            "caller" => Some(Backend::Caller),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Runner => "runner",
            Backend::Wheel => "wheel",
            Backend::Caller => "caller",
        }
    }
}

/// A validated, ordered declaration ready for dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub name: String,
    pub backend: Backend,
    pub fun: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: Kwargs,
    pub target: Option<String>,
    pub source: Option<PathBuf>,
}
