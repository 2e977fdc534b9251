use crate::api::CommandOutput;
use crate::commitlog::Index;
use crate::replica::{CommandApplyError, Term};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

type ApplyResult = Result<CommandOutput, CommandApplyError>;

/// PendingCommands holds the submitters waiting for their entry to be applied. Only a leader
/// registers waiters; they're all failed as soon as it steps down.
pub(crate) struct PendingCommands {
    waiters: BTreeMap<Index, Waiter>,
}

struct Waiter {
    term: Term,
    sender: oneshot::Sender<ApplyResult>,
}

impl PendingCommands {
    pub(crate) fn new() -> Self {
        PendingCommands {
            waiters: BTreeMap::new(),
        }
    }

    pub(crate) fn register(&mut self, index: Index, term: Term) -> oneshot::Receiver<ApplyResult> {
        let (sender, receiver) = oneshot::channel();
        if let Some(replaced) = self.waiters.insert(index, Waiter { term, sender }) {
            // Can only happen if the entry we were waiting on got overwritten.
            let _ = replaced.sender.send(Err(CommandApplyError::TermChanged));
        }

        receiver
    }

    /// The entry at `index` from `term` was applied. A waiter registered for a different term was
    /// waiting on an entry that got overwritten.
    pub(crate) fn complete(&mut self, index: Index, term: Term, result: ApplyResult) {
        if let Some(waiter) = self.waiters.remove(&index) {
            let result = if waiter.term == term {
                result
            } else {
                Err(CommandApplyError::TermChanged)
            };
            // Submitter may have given up already.
            let _ = waiter.sender.send(result);
        }
    }

    /// Fail every waiter at `index` or later; those entries were truncated.
    pub(crate) fn fail_from(&mut self, index: Index) {
        for (_, waiter) in self.waiters.split_off(&index) {
            let _ = waiter.sender.send(Err(CommandApplyError::TermChanged));
        }
    }

    pub(crate) fn fail_all(&mut self, make_error: impl Fn() -> CommandApplyError) {
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.sender.send(Err(make_error()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn complete_resolves_matching_term() {
        let mut pending = PendingCommands::new();
        let mut rx = pending.register(Index::new(3), Term::new(2));

        pending.complete(Index::new(3), Term::new(2), Ok(CommandOutput::Data(Bytes::from("ok"))));

        assert_eq!(rx.try_recv().unwrap().unwrap(), CommandOutput::Data(Bytes::from("ok")));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn complete_with_other_term_is_term_changed() {
        let mut pending = PendingCommands::new();
        let mut rx = pending.register(Index::new(3), Term::new(2));

        pending.complete(Index::new(3), Term::new(3), Ok(CommandOutput::NoData));

        assert!(matches!(rx.try_recv().unwrap(), Err(CommandApplyError::TermChanged)));
    }

    #[test]
    fn fail_from_only_fails_truncated_suffix() {
        let mut pending = PendingCommands::new();
        let mut rx_1 = pending.register(Index::new(1), Term::new(1));
        let mut rx_2 = pending.register(Index::new(2), Term::new(1));
        let mut rx_3 = pending.register(Index::new(3), Term::new(1));

        pending.fail_from(Index::new(2));

        assert!(rx_1.try_recv().is_err());
        assert!(matches!(rx_2.try_recv().unwrap(), Err(CommandApplyError::TermChanged)));
        assert!(matches!(rx_3.try_recv().unwrap(), Err(CommandApplyError::TermChanged)));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn fail_all_uses_given_error() {
        let mut pending = PendingCommands::new();
        let mut rx = pending.register(Index::new(1), Term::new(1));

        pending.fail_all(|| CommandApplyError::Stopped);

        assert!(matches!(rx.try_recv().unwrap(), Err(CommandApplyError::Stopped)));
        assert_eq!(pending.len(), 0);
    }
}
