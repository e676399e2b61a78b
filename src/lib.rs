//! ClipTransfer: one-way file transfer over a shared text clipboard.
//!
//! Built for hardened remote-desktop setups where the only channel into the
//! guest is host→guest clipboard synchronization. The sender chunks a file
//! (or a zipped folder) into self-describing JSON packets and publishes
//! them through the clipboard one by one; the receiver polls the clipboard,
//! reassembles the chunks with per-chunk and whole-file MD5 checks, and
//! materializes the result in the download directory.
//!
//! The channel is one-way and lossy by nature — the sender never learns
//! receiver state, and a chunk can be missed if it is replaced before the
//! receiver's next poll. The protocol prefers best-effort continuation:
//! a bad chunk is recorded and skipped, and the receiver reports missing
//! chunks when END arrives so the user can trigger a fresh send.

pub mod core;
pub mod utils;
