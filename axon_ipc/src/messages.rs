//! Typed message payloads carried through the shared segment.
//!
//! Every payload is a `#[repr(C)]` plain-old-data struct small enough for
//! one segment slot; the wire contract is `{type_id, field order}`, with
//! type ids assigned centrally and append-only in
//! `axon_common::type_ids`. Field order within a published struct is frozen
//! for the same reason the ids are.

use axon::consts::DEFAULT_SLOT_SIZE;
use axon::type_ids;
use static_assertions::const_assert;

/// A plain-old-data payload with a registered type id.
///
/// Implementors must be `#[repr(C)]` and contain no pointers or
/// process-local resources; the bytes are copied verbatim across the
/// process boundary.
pub trait Payload: Copy + Send + Sync + 'static {
    /// Registered discriminant from `axon_common::type_ids`.
    const TYPE_ID: u32;
}

/// Diagnostic ping; the integration suite streams these end to end.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Sequence number assigned by the producer.
    pub id: u64,
}

impl Payload for Ping {
    const TYPE_ID: u32 = type_ids::PING;
}

/// First message either side publishes after attaching.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHello {
    /// OS pid of the sender.
    pub pid: u32,
    /// Protocol revision the sender speaks.
    pub protocol: u32,
}

impl Payload for HandshakeHello {
    const TYPE_ID: u32 = type_ids::HANDSHAKE_HELLO;
}

/// Daemon asks for the analytics bundle version active at a height.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRequest {
    /// Block height the query refers to.
    pub height: u64,
}

impl Payload for VersionRequest {
    const TYPE_ID: u32 = type_ids::VERSION_REQUEST;
}

/// Reply to [`VersionRequest`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionReply {
    /// Height echoed from the request.
    pub height: u64,
    /// Semantic version of the active bundle.
    pub major: u32,
    /// Semantic version of the active bundle.
    pub minor: u32,
    /// Semantic version of the active bundle.
    pub patch: u32,
    /// Explicit padding; always zero.
    pub _reserved: u32,
}

impl Payload for VersionReply {
    const TYPE_ID: u32 = type_ids::VERSION_REPLY;
}

/// Daemon requests a node-ranking computation over a block range.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingRequest {
    /// First block of the range, inclusive.
    pub start_block: u64,
    /// Last block of the range, inclusive.
    pub end_block: u64,
}

impl Payload for RankingRequest {
    const TYPE_ID: u32 = type_ids::RANKING_REQUEST;
}

/// Reply to [`RankingRequest`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingReply {
    /// First block of the computed range.
    pub start_block: u64,
    /// Last block of the computed range.
    pub end_block: u64,
    /// Top score in the ranking, scaled by 1000.
    pub top_score_milli: u64,
    /// Number of ranked addresses.
    pub node_count: u32,
    /// 0 = ok, nonzero = computation error code.
    pub status: u32,
}

impl Payload for RankingReply {
    const TYPE_ID: u32 = type_ids::RANKING_REPLY;
}

/// Daemon requests a reward computation for a settlement height.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardRequest {
    /// Settlement height.
    pub height: u64,
}

impl Payload for RewardRequest {
    const TYPE_ID: u32 = type_ids::REWARD_REQUEST;
}

/// Reply to [`RewardRequest`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardReply {
    /// Settlement height echoed from the request.
    pub height: u64,
    /// Total reward in base units.
    pub reward_value: u64,
    /// 0 = ok, nonzero = computation error code.
    pub status: u32,
    /// Explicit padding; always zero.
    pub _reserved: u32,
}

impl Payload for RewardReply {
    const TYPE_ID: u32 = type_ids::REWARD_REPLY;
}

// Every published payload must fit the default slot geometry.
const_assert!(std::mem::size_of::<Ping>() <= DEFAULT_SLOT_SIZE);
const_assert!(std::mem::size_of::<HandshakeHello>() <= DEFAULT_SLOT_SIZE);
const_assert!(std::mem::size_of::<VersionReply>() <= DEFAULT_SLOT_SIZE);
const_assert!(std::mem::size_of::<RankingReply>() <= DEFAULT_SLOT_SIZE);
const_assert!(std::mem::size_of::<RewardReply>() <= DEFAULT_SLOT_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_ids_match_registry() {
        assert_eq!(Ping::TYPE_ID, 1);
        assert_eq!(HandshakeHello::TYPE_ID, 2);
        assert_eq!(VersionRequest::TYPE_ID, 3);
        assert_eq!(VersionReply::TYPE_ID, 4);
        assert_eq!(RankingRequest::TYPE_ID, 5);
        assert_eq!(RankingReply::TYPE_ID, 6);
        assert_eq!(RewardRequest::TYPE_ID, 7);
        assert_eq!(RewardReply::TYPE_ID, 8);
    }

    #[test]
    fn test_layouts_have_no_hidden_padding() {
        assert_eq!(std::mem::size_of::<Ping>(), 8);
        assert_eq!(std::mem::size_of::<HandshakeHello>(), 8);
        assert_eq!(std::mem::size_of::<VersionReply>(), 24);
        assert_eq!(std::mem::size_of::<RankingReply>(), 32);
        assert_eq!(std::mem::size_of::<RewardReply>(), 24);
    }
}
