//! Deferred-task scheduling groups for Tokio.
//!
//! A [`Group`] accepts nullary async callbacks annotated with a deadline,
//! dispatches each one on its own task at (or after) that deadline, and lets
//! a single caller block until either every scheduled callback has completed
//! or a caller-controlled [`CancelToken`] fires.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use fahrplan::{CancelToken, Group};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let group = Group::new(CancelToken::new());
//!
//! group.delay(Duration::from_millis(10), || async {
//!     println!("fired");
//! });
//!
//! group.wait().await.expect("group was not cancelled");
//! # }
//! ```

pub mod cancel;
pub mod error;
pub mod group;
mod task;
mod waitgroup;

pub use cancel::{CancelReason, CancelToken};
pub use error::GroupError;
pub use group::{Group, GroupBuilder};
