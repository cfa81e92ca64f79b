//! Switching matrix for mplsim nodes.
//!
//! Every flow crossing a node is described by one [`Entry`]: where it comes
//! in, where it leaves, which label it carries on each side and how far the
//! label distribution for its primary and backup paths has progressed.
//!
//! Entries are stored in a [`SwitchingMatrix`], unique per
//! `(incoming port, label or FEC, entry type)`. Engines copy an entry out,
//! update it and write it back with [`SwitchingMatrix::upsert`]; removal while
//! scanning goes through [`SwitchingMatrix::purge_where`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod error;
pub mod label;
pub mod matrix;

pub use entry::{Entry, EntryId, EntryKey, EntryType, LabelStackOperation, RetryState, Withdrawal};
pub use error::SwitchingError;
pub use label::OutgoingLabel;
pub use matrix::{LabelAllocator, SwitchingMatrix};
