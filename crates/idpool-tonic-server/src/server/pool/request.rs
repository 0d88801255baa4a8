use idpool_tonic_core::{
    Error,
    idpool::{DispatchRequest, DispatchResponse},
};
use tokio::sync::oneshot;

/// A unit of work sent to a dispatch worker.
#[derive(Debug)]
pub enum WorkRequest {
    /// Run one dispatch attempt and report the outcome on `response`.
    Dispatch {
        request: DispatchRequest,
        response: oneshot::Sender<Result<DispatchResponse, Error>>,
    },
    /// Stop the worker once every earlier request has been handled.
    Shutdown { response: oneshot::Sender<()> },
}
