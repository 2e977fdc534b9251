use crate::api::state_machine::BoxError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const NOP_COMMAND_NAME: &str = "raft:nop";
pub const JOIN_COMMAND_NAME: &str = "raft:join";
pub const LEAVE_COMMAND_NAME: &str = "raft:leave";

/// A Command is a named state transition. It's serialized (as JSON) into the replicated log when
/// submitted, and every server decodes and applies it once it's committed.
///
/// `apply()` must be deterministic: every server applies the same commands in the same order and
/// must end up in the same state.
pub trait Command<M>: Send + 'static {
    /// Name the command was registered under in the [`CommandRegistry`].
    fn name(&self) -> &str;

    fn apply(&self, context: &mut ApplyContext<'_, M>) -> Result<CommandOutput, BoxError>;
}

/// Output of applying a command, handed back to whoever submitted it.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandOutput {
    Data(Bytes),
    NoData,
}

/// ApplyContext is what a command sees while it's being applied.
pub struct ApplyContext<'a, M> {
    state_machine: &'a mut M,
    server_name: &'a str,
    term: u64,
    index: u64,
    membership_changes: Vec<MembershipChange>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MembershipChange {
    Add(String),
    Remove(String),
}

impl<'a, M> ApplyContext<'a, M> {
    pub(crate) fn new(state_machine: &'a mut M, server_name: &'a str, term: u64, index: u64) -> Self {
        ApplyContext {
            state_machine,
            server_name,
            term,
            index,
            membership_changes: Vec::new(),
        }
    }

    pub fn state_machine(&mut self) -> &mut M {
        &mut *self.state_machine
    }

    /// Name of the server applying the command.
    pub fn server_name(&self) -> &str {
        self.server_name
    }

    /// Term of the log entry being applied.
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Index of the log entry being applied.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Add a voting member once this command has been applied.
    pub fn add_peer(&mut self, name: impl Into<String>) {
        self.membership_changes.push(MembershipChange::Add(name.into()));
    }

    /// Remove a voting member once this command has been applied.
    pub fn remove_peer(&mut self, name: impl Into<String>) {
        self.membership_changes.push(MembershipChange::Remove(name.into()));
    }

    pub(crate) fn into_membership_changes(self) -> Vec<MembershipChange> {
        self.membership_changes
    }
}

type Decoder<M> = Box<dyn Fn(&[u8]) -> Result<Box<dyn Command<M>>, serde_json::Error> + Send + Sync>;

/// CommandRegistry maps command names to decoders. Every server in a cluster must register the
/// same commands under the same names.
///
/// `new()` comes with the built-in `raft:*` commands already registered.
pub struct CommandRegistry<M> {
    decoders: HashMap<String, Decoder<M>>,
}

impl<M: 'static> CommandRegistry<M> {
    pub fn new() -> Self {
        let mut registry = CommandRegistry {
            decoders: HashMap::new(),
        };
        registry.insert::<NopCommand>(NOP_COMMAND_NAME.to_string());
        registry.insert::<JoinCommand>(JOIN_COMMAND_NAME.to_string());
        registry.insert::<LeaveCommand>(LEAVE_COMMAND_NAME.to_string());

        registry
    }

    pub fn register<C>(&mut self, name: impl Into<String>) -> Result<(), CommandError>
    where
        C: Command<M> + DeserializeOwned,
    {
        let name = name.into();
        if self.decoders.contains_key(&name) {
            return Err(CommandError::AlreadyRegistered(name));
        }

        self.insert::<C>(name);
        Ok(())
    }

    fn insert<C>(&mut self, name: String)
    where
        C: Command<M> + DeserializeOwned,
    {
        let decoder: Decoder<M> = Box::new(|payload: &[u8]| {
            serde_json::from_slice::<C>(payload).map(|c| Box::new(c) as Box<dyn Command<M>>)
        });
        self.decoders.insert(name, decoder);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    pub(crate) fn decode(&self, name: &str, payload: &[u8]) -> Result<Box<dyn Command<M>>, CommandError> {
        let decoder = self
            .decoders
            .get(name)
            .ok_or_else(|| CommandError::Unregistered(name.to_string()))?;

        decoder(payload).map_err(|source| CommandError::Decode {
            name: name.to_string(),
            source,
        })
    }
}

impl<M: 'static> Default for CommandRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn encode_command<C: Serialize>(command: &C) -> Result<Vec<u8>, CommandError> {
    serde_json::to_vec(command).map_err(CommandError::Encode)
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Command {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("No command registered under name {0:?}")]
    Unregistered(String),
    #[error("Failed to encode command: {0}")]
    Encode(serde_json::Error),
    #[error("Failed to decode command {name:?}: {source}")]
    Decode { name: String, source: serde_json::Error },
}

// ------- Built-in commands --------

/// Appended by every new leader so entries from earlier terms get committed promptly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NopCommand {}

impl<M> Command<M> for NopCommand {
    fn name(&self) -> &str {
        NOP_COMMAND_NAME
    }

    fn apply(&self, _context: &mut ApplyContext<'_, M>) -> Result<CommandOutput, BoxError> {
        Ok(CommandOutput::NoData)
    }
}

/// Adds a server to the cluster. It counts towards majorities once this entry is applied.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinCommand {
    pub name: String,
}

impl<M> Command<M> for JoinCommand {
    fn name(&self) -> &str {
        JOIN_COMMAND_NAME
    }

    fn apply(&self, context: &mut ApplyContext<'_, M>) -> Result<CommandOutput, BoxError> {
        context.add_peer(self.name.clone());
        Ok(CommandOutput::NoData)
    }
}

/// Removes a server from the cluster. A leader that removes itself steps down.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveCommand {
    pub name: String,
}

impl<M> Command<M> for LeaveCommand {
    fn name(&self) -> &str {
        LEAVE_COMMAND_NAME
    }

    fn apply(&self, context: &mut ApplyContext<'_, M>) -> Result<CommandOutput, BoxError> {
        context.remove_peer(self.name.clone());
        Ok(CommandOutput::NoData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter(i64);

    #[derive(Serialize, Deserialize)]
    struct Add {
        amount: i64,
    }

    impl Command<Counter> for Add {
        fn name(&self) -> &str {
            "add"
        }

        fn apply(&self, context: &mut ApplyContext<'_, Counter>) -> Result<CommandOutput, BoxError> {
            context.state_machine().0 += self.amount;
            Ok(CommandOutput::Data(Bytes::from(context.state_machine().0.to_string())))
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = CommandRegistry::<Counter>::new();
        assert!(registry.contains(NOP_COMMAND_NAME));
        assert!(registry.contains(JOIN_COMMAND_NAME));
        assert!(registry.contains(LEAVE_COMMAND_NAME));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = CommandRegistry::<Counter>::new();
        registry.register::<Add>("add").unwrap();
        assert!(matches!(
            registry.register::<Add>("add"),
            Err(CommandError::AlreadyRegistered(name)) if name == "add"
        ));
        assert!(matches!(
            registry.register::<Add>(JOIN_COMMAND_NAME),
            Err(CommandError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn decode_and_apply() {
        let mut registry = CommandRegistry::<Counter>::new();
        registry.register::<Add>("add").unwrap();

        let payload = encode_command(&Add { amount: 5 }).unwrap();
        let command = registry.decode("add", &payload).unwrap();
        assert_eq!(command.name(), "add");

        let mut counter = Counter(1);
        let mut context = ApplyContext::new(&mut counter, "me", 1, 1);
        let output = command.apply(&mut context).unwrap();
        assert_eq!(output, CommandOutput::Data(Bytes::from("6")));
        assert!(context.into_membership_changes().is_empty());
    }

    #[test]
    fn decode_failures() {
        let registry = CommandRegistry::<Counter>::new();
        assert!(matches!(
            registry.decode("missing", b"{}"),
            Err(CommandError::Unregistered(_))
        ));
        assert!(matches!(
            registry.decode(JOIN_COMMAND_NAME, b"not json"),
            Err(CommandError::Decode { .. })
        ));
    }

    #[test]
    fn join_and_leave_record_membership_changes() {
        let registry = CommandRegistry::<Counter>::new();
        let join = registry
            .decode(JOIN_COMMAND_NAME, &encode_command(&JoinCommand { name: "d".into() }).unwrap())
            .unwrap();
        let leave = registry
            .decode(LEAVE_COMMAND_NAME, &encode_command(&LeaveCommand { name: "a".into() }).unwrap())
            .unwrap();

        let mut counter = Counter::default();
        let mut context = ApplyContext::new(&mut counter, "me", 1, 7);
        join.apply(&mut context).unwrap();
        leave.apply(&mut context).unwrap();

        assert_eq!(
            context.into_membership_changes(),
            vec![
                MembershipChange::Add("d".to_string()),
                MembershipChange::Remove("a".to_string())
            ]
        );
    }
}
