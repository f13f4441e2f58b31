//! Read-logged configuration snapshots.
//!
//! An [`Env`] is a tree-shaped, copy-on-fork snapshot of the resolved task
//! configuration. Every read through the public accessors is logged, so that
//! after a run the tool can flag configuration keys nobody ever looked at.
//!
//! The rules:
//!
//! - An `Env` is never mutated after it has been forked; [`Env::fork`] is the
//!   only way to specialize it for a child.
//! - A fork inherits the read log accumulated by its source up to the fork
//!   point. Afterwards the logs diverge, but reads through the fork stay
//!   visible to [`Env::accessed_keys`] on the source.
//! - A locked `Env` (and, recursively, every nested sub-env) rejects further
//!   forking.

mod context;

pub use context::{Env, EnvError, EnvValue};
