mod clock;
mod election_timer;

#[cfg(test)]
mod test_utils;

pub(super) use clock::{Clock, RealClock};
pub(super) use election_timer::ElectionTimer;

#[cfg(test)]
pub(super) use clock::ManualClock;
#[cfg(test)]
pub(super) use test_utils::TestUtilActor;
