#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # Strand
//!
//! Presentation-surface lifecycle management for compositors whose rendering
//! backend presents through per-plane streams.
//!
//! The crate covers the two halves of getting a rendered frame onto a
//! display plane:
//!
//! - [`backend::allocator`] multiplexes buffer requests onto a small pool of
//!   persistent native presentation surfaces
//!   ([`stream`](backend::allocator::stream)), recycles them through a
//!   [`Swapchain`](backend::allocator::Swapchain) with buffer-age tracking,
//!   and keeps the pool alive across privilege loss (dispose/recreate).
//! - [`output`] decides, per output and per commit, which pixel format and
//!   modifier set to render with: it verifies or replaces the swapchain,
//!   attaches the next back buffer, and probes mode-setting commits with a
//!   throwaway cleared buffer, falling back to implicit layouts when the
//!   display rejects a tested configuration.
//!
//! The graphics context itself (display bring-up, extension discovery,
//! image import) is consumed behind the
//! [`StreamContext`](backend::stream::StreamContext) boundary; renderers and
//! display backends plug in through the traits in [`backend::renderer`] and
//! [`output`].
//!
//! All types are meant to be driven from a single compositor thread; there
//! is no internal locking. Logging uses [`tracing`] throughout.

pub mod backend;
pub mod controller;
pub mod output;
