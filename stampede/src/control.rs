//! The control surface
//!
//! Remote callers drive a [`Driver`] through [`Control`]. The request and
//! response types serialize with serde so that any request/response transport
//! can carry them; stampede itself binds no transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::Config,
    driver::{self, Driver, Progress, Status},
};

#[async_trait]
/// Lifecycle operations on a workload.
pub trait Control: Send + Sync {
    /// Load a workload.
    async fn load(&self, config: Config) -> Result<(), driver::Error>;
    /// Discard the loaded workload.
    async fn unload(&self) -> Result<(), driver::Error>;
    /// Start the loaded workload.
    async fn start(&self) -> Result<(), driver::Error>;
    /// Hold every worker.
    async fn pause(&self) -> Result<(), driver::Error>;
    /// Release held workers.
    async fn resume(&self) -> Result<(), driver::Error>;
    /// Stop the run.
    async fn stop(&self) -> Result<(), driver::Error>;
    /// Current lifecycle status.
    async fn status(&self) -> Status;
    /// Aggregate progress.
    async fn progress(&self) -> Progress;
}

#[async_trait]
impl Control for Driver {
    async fn load(&self, config: Config) -> Result<(), driver::Error> {
        Driver::load(self, config)
    }

    async fn unload(&self) -> Result<(), driver::Error> {
        Driver::unload(self)
    }

    async fn start(&self) -> Result<(), driver::Error> {
        Driver::start(self)
    }

    async fn pause(&self) -> Result<(), driver::Error> {
        Driver::pause(self)
    }

    async fn resume(&self) -> Result<(), driver::Error> {
        Driver::resume(self)
    }

    async fn stop(&self) -> Result<(), driver::Error> {
        Driver::stop(self)
    }

    async fn status(&self) -> Status {
        Driver::status(self)
    }

    async fn progress(&self) -> Progress {
        Driver::progress(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// A control request.
pub enum Request {
    /// See [`Control::load`].
    Load {
        /// The workload.
        config: Box<Config>,
    },
    /// See [`Control::unload`].
    Unload,
    /// See [`Control::start`].
    Start,
    /// See [`Control::pause`].
    Pause,
    /// See [`Control::resume`].
    Resume,
    /// See [`Control::stop`].
    Stop,
    /// See [`Control::status`].
    Status,
    /// See [`Control::progress`].
    Progress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The answer to a [`Request`].
pub enum Response {
    /// The operation succeeded.
    Ok,
    /// Current status.
    Status(Status),
    /// Current progress.
    Progress(Progress),
    /// The operation failed.
    Error {
        /// Error category: `invalid_state`, `invalid_parameter`,
        /// `protocol_failure`, `io_failure` or `internal`.
        kind: String,
        /// Human readable description.
        message: String,
    },
}

impl From<Result<(), driver::Error>> for Response {
    fn from(result: Result<(), driver::Error>) -> Self {
        match result {
            Ok(()) => Response::Ok,
            Err(err) => Response::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Apply `request` to `control`.
pub async fn dispatch<C>(control: &C, request: Request) -> Response
where
    C: Control + ?Sized,
{
    debug!(?request, "control request");
    match request {
        Request::Load { config } => control.load(*config).await.into(),
        Request::Unload => control.unload().await.into(),
        Request::Start => control.start().await.into(),
        Request::Pause => control.pause().await.into(),
        Request::Resume => control.resume().await.into(),
        Request::Stop => control.stop().await.into(),
        Request::Status => Response::Status(control.status().await),
        Request::Progress => Response::Progress(control.progress().await),
    }
}
