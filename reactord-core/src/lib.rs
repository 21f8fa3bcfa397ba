//! reactord is an event-reaction daemon: it subscribes to a process-wide
//! event bus and compares every incoming event against a configured reactor
//! map. When an event's tag matches a map entry, the entry's reaction files
//! are rendered against the event, compiled into an ordered list of execution
//! chunks, and each chunk is dispatched to one of four execution backends
//! (local minion targeting, runner, wheel, or caller).
//!
//! The reactor itself never executes anything; backends are reached through
//! client traits so the daemon can sit in front of whatever remote execution
//! infrastructure the host system provides. The bundled clients publish
//! command events back onto the event bus.

pub mod clients;
pub mod config;
pub mod event_bus;
pub mod reactor;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
