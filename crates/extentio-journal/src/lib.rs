//! Write/rebuild journal ("write log")
//!
//! A reserved region at the tail of every member drive stages full-stripe
//! writes and rekey traffic before the live-stripe write commits. After
//! an unclean restart, or after a member that was absent during journaled
//! I/O returns, the region is scanned: completed intents are invalidated,
//! incomplete ones are replayed to the live stripe first.
//!
//! The single most safety-critical rule lives here: slot data is staged
//! under the encryption key of the **rekey epoch in force at write
//! time**, which is captured in the slot header. Verify and rebuild must
//! use that captured epoch, never the epoch current at recovery time.

pub mod keys;
pub mod writelog;

pub use keys::RekeyCipher;
pub use writelog::{FlushSummary, MemberWrite, SlotState, StripeIntent, TornIntent, WriteLog};
