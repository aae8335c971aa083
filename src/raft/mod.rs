mod log;
mod message;
mod node;
mod server;
mod state;

pub use self::log::{Entry, Index, Log};
pub use message::{Command, Envelope, Message, BROADCAST};
pub use node::{Node, Options, ReplicaId, Term, Ticks};
pub use server::Server;
pub use state::State;

use std::time::Duration;

/// The duration of a logical clock tick. This also bounds the transport
/// receive poll, so timers are evaluated at least this often.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// The number of ticks between leader heartbeats (nominally 150 ms).
const HEARTBEAT_INTERVAL: Ticks = 3;

/// The range of randomized election timeouts, in ticks (nominally 1.0 ± 0.5 s).
/// Randomization must be independent per replica; symmetric timers deadlock
/// the cluster.
const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..30;

/// The range of randomized candidate deadlines, in ticks (nominally
/// 0.5 ± 0.1 s). Past the deadline a stalled election is restarted, and a
/// granted vote goes stale and may be released to a different candidate.
const CANDIDATE_TIMEOUT_RANGE: std::ops::Range<Ticks> = 8..13;

/// The maximum number of entries in a single append message, keeping
/// datagrams within the transport's payload bound.
const MAX_APPEND_ENTRIES: usize = 100;

/// The maximum serialized size of a single client command. A larger command
/// could never be replicated within a single datagram.
const MAX_COMMAND_SIZE: usize = 60 * 1024;
