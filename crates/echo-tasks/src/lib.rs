// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Task/Future capability model and graph resolver for Echo.
//!
//! A task graph is built out of [`Future`] values — [`Task`][DynTask]
//! nodes, [`Const`] wrappers, and [`MappedFuture`] projections — and
//! turned into a schedulable DAG by [`resolve`]. Fingerprinting (via
//! `echo-canon`) and id assignment/instance materialization (via
//! `echo-cas`) both happen inside the resolver, so a [`ResolvedGraph`]
//! already carries everything `echo-sched` needs to execute it.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod future;
mod resolver;

pub use future::{project_value, ArgValue, Const, DynTask, Future, MappedFuture, NodeKey};
pub use resolver::{resolve, Binding, ResolveError, ResolvedGraph, ResolvedNode, RootSpec};
