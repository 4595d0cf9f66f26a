//! Unbounded work-stealing deques over recycled fixed-size blocks
//!
//! This crate provides the scheduling primitive of a task-parallel runtime:
//! a lock-free deque where one owner thread pushes and pops task pointers at
//! the bottom while any number of other threads steal from the top. Three
//! layers compose bottom-up:
//!
//! - [`pool`] — a size-classed pool of 128-byte-aligned storage blocks, with
//!   per-thread free lists for small classes and shared lock-free stacks for
//!   large ones.
//! - [`array`] — the "continuous array": an unbounded indexable slot store
//!   made of doubly linked fixed-size blocks, grown on the owner side and
//!   retired on the stealer side as the indices advance.
//! - [`deque`] — the index protocol itself, with the owner/stealer
//!   capability split encoded in the [`Worker`] and [`Stealer`] handle
//!   types.
//!
//! Memory reclamation of retired blocks is deliberately left to the caller:
//! the deque exposes [`Worker::reclaim_retired`] but decides nothing about
//! when it is safe to call. A scheduler that pins stealers with epochs,
//! hazard pointers or quiescent-state barriers calls it from its own safe
//! point.

#![warn(clippy::print_stdout, clippy::print_stderr, clippy::dbg_macro)]

pub mod array;
pub mod deque;
pub mod pool;

pub use deque::{Steal, Stealer, Worker};
pub use pool::PoolAllocator;
