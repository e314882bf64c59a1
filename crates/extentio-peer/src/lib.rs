//! Cross-SP peer link for ExtentIO
//!
//! The two storage processors coordinate through typed request/response
//! messages: non-paged metadata mirroring, paged metadata mutations and
//! shadow pushes, stripe-lock forwarding, and active-role negotiation.
//!
//! The wire mechanism is abstracted behind [`PeerLink`]; the shipped
//! implementation is an in-process duplex channel. Every operation that
//! crosses SPs takes an explicit link handle: there is no ambient
//! "current target" state.

pub mod link;
pub mod messages;

pub use link::{InProcessLink, PeerLink, PeerService};
pub use messages::{PagedOp, PeerRequest, PeerResponse};
