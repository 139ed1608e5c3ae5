//! Node-side validation plumbing.
//!
//! A challenged node streams sampled blocks ([`responder`]) over a framed
//! TCP channel ([`stream`]) to a candidate acting as validator, which
//! recomputes every CID and measures bandwidth ([`block_waiter`]) before
//! reporting to the scheduler. [`node_api`] is the HTTP surface the
//! scheduler calls on a node.

pub mod block_waiter;
pub mod node_api;
pub mod responder;
pub mod stream;

pub use block_waiter::{BlockWaiter, HttpReportSink, ReportSink, WaiterConfig, bandwidth, serve_validation};
pub use node_api::{NodeState, router};
pub use responder::{ResponseOutcome, Responder};
pub use stream::{BlockSender, StreamFrame};
