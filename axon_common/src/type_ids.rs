//! Centralized message type-id registry.
//!
//! Type ids are the wire-level discriminant carried next to every queue
//! element. The registry is append-only: an id, once published, is never
//! reused or renumbered, so an old daemon can always skip payload kinds it
//! does not know. New payloads take the next free id at the end of the list.

/// Diagnostic ping used by the self-test path and the integration suite.
pub const PING: u32 = 1;

/// First message either side sends after attaching; carries pid and
/// protocol revision.
pub const HANDSHAKE_HELLO: u32 = 2;

/// Daemon asks the analytics process for its bundle version at a height.
pub const VERSION_REQUEST: u32 = 3;

/// Analytics reply to [`VERSION_REQUEST`].
pub const VERSION_REPLY: u32 = 4;

/// Daemon requests a node-ranking computation over a block range.
pub const RANKING_REQUEST: u32 = 5;

/// Analytics reply to [`RANKING_REQUEST`].
pub const RANKING_REPLY: u32 = 6;

/// Daemon requests a reward computation for a settlement height.
pub const REWARD_REQUEST: u32 = 7;

/// Analytics reply to [`REWARD_REQUEST`].
pub const REWARD_REPLY: u32 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_dense() {
        let ids = [
            PING,
            HANDSHAKE_HELLO,
            VERSION_REQUEST,
            VERSION_REPLY,
            RANKING_REQUEST,
            RANKING_REPLY,
            REWARD_REQUEST,
            REWARD_REPLY,
        ];
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(*id as usize, i + 1);
        }
    }
}
