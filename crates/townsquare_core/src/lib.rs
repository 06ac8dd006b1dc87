/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Federation core for Townsquare: actor identities, WebFinger resolution, ownership
//! verification over remote outboxes, signed delivery and two-tier fan-out.

pub mod activity;
pub mod config;
pub mod context;
pub mod db;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod html;
pub mod http_retry;
pub mod http_sig;
pub mod inbox;
pub mod keys;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod transport;
pub mod verification;

#[cfg(test)]
pub(crate) mod testing;

pub use context::Federation;
pub use error::{FedResult, FederationError};
