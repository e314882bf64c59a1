//! Peer message definitions
//!
//! Requests flow in both directions; each request gets exactly one
//! response. Lock forwarding is the only long-lived call: the response
//! is not sent until the lock is granted on the active side.

use extentio_common::{Lba, LockMode, ObjectId, SpId};
use serde::{Deserialize, Serialize};

/// A paged-metadata mutation forwarded from the passive side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PagedOp {
    /// OR `bit_pattern` into `repeat_count` records starting at `chunk_index`
    SetBits {
        chunk_index: u64,
        repeat_count: u64,
        bit_pattern: [u8; 8],
    },
    /// AND-NOT `bit_pattern` out of `repeat_count` records starting at `chunk_index`
    ClearBits {
        chunk_index: u64,
        repeat_count: u64,
        bit_pattern: [u8; 8],
    },
}

/// Request sent to the peer SP.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Push the authoritative copy of an object's non-paged record
    NonpagedMirror { object_id: ObjectId, record: Vec<u8> },

    /// Apply a paged mutation on the active side (sent by the passive side)
    PagedMutate { object_id: ObjectId, op: PagedOp },

    /// Push refreshed paged shadow bytes (sent by the active side)
    PagedShadowPush {
        object_id: ObjectId,
        chunk_index: u64,
        records: Vec<u8>,
    },

    /// Forward a stripe-lock acquire; the response is withheld until granted
    LockAcquire {
        request_id: u64,
        object_id: ObjectId,
        stripe: Lba,
        stripe_count: u64,
        mode: LockMode,
        from: SpId,
    },

    /// Release a previously forwarded lock
    LockRelease { request_id: u64, object_id: ObjectId },

    /// How many forwarded locks does the peer still hold on this object?
    LockHoldCount { object_id: ObjectId },

    /// Ask the peer to surrender the ACTIVE role for an object
    RequestActive { object_id: ObjectId },
}

/// Response from the peer SP.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerResponse {
    /// Generic success
    Ack,
    /// Lock was granted on the active side
    LockGranted { request_id: u64, object_id: ObjectId },
    /// Outstanding forwarded-lock count
    HoldCount(u64),
    /// Active-role handoff decision
    ActiveGranted(bool),
}
