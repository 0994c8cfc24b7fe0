//! Weft Core - master/worker task distribution
//!
//! A [`Master`] hands out tasks over three channels (task distribution,
//! result collection, announcement broadcast) and returns a [`WorkFuture`]
//! per submission. [`Worker`] processes connect to those channels, run the
//! named handler from their [`HandlerRegistry`], and report each outcome.
//!
//! ```no_run
//! use weft_core::{Master, TaskRequest, WorkManagerConfig};
//!
//! # fn main() -> weft_core::Result<()> {
//! let master = Master::new(WorkManagerConfig::default())?;
//! master.startup()?;
//! let future = master.submit_request(TaskRequest::new("identity").arg(1))?;
//! assert_eq!(future.get_result(false)?, serde_json::json!(1));
//! master.shutdown();
//! master.remove_ipc_endpoints();
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod client;
pub mod config;
pub mod error;
pub mod future;
mod interrupt;
pub mod master;
pub mod protocol;
pub mod report;
pub mod task;
pub mod worker;

pub use builtin::builtin_handlers;
pub use config::{Endpoints, WorkManagerConfig};
pub use error::{Result, WorkManagerError};
pub use future::{AsCompleted, WorkFuture, as_completed, wait_any};
pub use master::{Master, MasterState, SubmitAsCompleted, WorkerInfo};
pub use protocol::{Announcement, Kwargs, RemoteException, Task, TaskId, TaskResult};
pub use task::{HandlerError, HandlerRegistry, Propagator, PropagatorHandler, TaskHandler, TaskRequest};
pub use worker::{Worker, WorkerExit};
pub use weft_common::{Endpoint, EndpointKind, EndpointRegistry};
