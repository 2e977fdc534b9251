/// Error type for application-supplied hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// StateMachine is the application's state that committed commands are applied to.
///
/// Commands mutate it through their own `apply()` (see [`Command`](crate::Command)). The raft
/// server only needs to be able to capture and restore it whole, for log compaction and for
/// catching up followers that are too far behind.
pub trait StateMachine: Send + 'static {
    /// Serialize the complete state. Must be deterministic given the same applied entries.
    fn save(&self) -> Result<Vec<u8>, BoxError>;

    /// Replace the complete state with one produced by `save()`. A failure here is fatal to the
    /// server, since it can no longer tell what state it's in.
    fn recovery(&mut self, state: &[u8]) -> Result<(), BoxError>;
}
