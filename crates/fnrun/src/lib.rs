//! # Function Evaluation Runtime
//!
//! A service that evaluates transformation functions over resource bundles.
//! A function is a container image reading an envelope of structured
//! documents on stdin and writing a possibly transformed envelope on
//! stdout; this crate executes them under strict resource bounds and
//! caches recent evaluations.
//!
//! ## Execution modes
//!
//! - **Bundled** ([`exec`]): the image maps to a prebuilt binary shipped
//!   alongside the runtime; evaluation fork-execs it with the envelope on
//!   stdin and a hard timeout.
//! - **Pod** ([`pod`]): a sandboxed wrapper process serving the evaluator
//!   wire protocol is kept warm per image and reached over a persistent
//!   channel; idle sandboxes are reaped after a TTL.
//!
//! The mode is selected per request by [`runner::FunctionRunner`], which
//! also consults the evaluation cache ([`cache`]) before executing
//! anything: evaluations of digest-pinned images are memoized by
//! `sha256(image ‖ input ‖ config)`.
//!
//! ## Wire protocol
//!
//! The runner and the wrapper both speak the unary `Evaluate` RPC defined
//! in [`proto`], plus the standard health service. The `wrapper-server`
//! binary in this crate is what runs inside a function pod, executing a
//! configured entrypoint per request.

pub mod cache;
pub mod error;
pub mod exec;
pub mod pod;
pub mod proto;
pub mod runner;

pub use error::{Error, Result};
