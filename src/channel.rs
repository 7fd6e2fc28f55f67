//! The two directions of the narrow channel between host and page.
//!
//! Call-in: the script invokes a named entry point with one string payload.
//! Call-out: the host submits a snippet of script source for evaluation on
//! the page's own thread. Nothing else crosses.

/// Call-in side, as seen from the script.
pub trait CallIn: Send + Sync {
    /// Whether the host registered `entry`. Unbound entry points must never
    /// be invoked.
    fn is_bound(&self, entry: &str) -> bool;

    fn invoke(&self, entry: &str, payload: String);
}

/// Call-out side, as seen from the host. Safe to use from any thread;
/// evaluation itself always happens on the page thread.
pub trait ScriptSink: Send + Sync {
    fn submit(&self, snippet: String);
}

/// A page's script engine. Only ever touched from its owning thread.
pub trait ScriptEngine: Send {
    fn evaluate(&mut self, snippet: &str);
}
