//! Bidirectional byte relay
//!
//! Two [`RelayPump`]s, one per direction, copy bytes between a pair of
//! streams. The pumps share a [`TerminationFlag`]: whichever exits first sets
//! it, and the other notices at its next read deadline and exits too.

mod flag;
mod pump;

pub use flag::TerminationFlag;
pub use pump::{relay, PumpConfig, PumpExit, PumpReport, RelayPump, RelayReport};
