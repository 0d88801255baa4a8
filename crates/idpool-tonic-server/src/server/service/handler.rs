//! gRPC service implementation for quota-aware ID dispatch.
//!
//! [`DispatchService`] implements the [`IdDispatcher`] service from the
//! protobuf schema. Dispatches run on a pool of background workers so every
//! attempt gets the same deadline and shutdown treatment. Searches and
//! allocation reads are read-only and go straight to the store; status
//! updates go straight to the orchestrator but are refused once shutdown
//! starts.

use crate::server::{
    config::ServerConfig,
    pool::{manager::WorkerPool, worker::worker_loop},
    service::backend::Orchestrator,
    telemetry::{
        decrement_dispatches_inflight, increment_dispatch_errors, increment_dispatches_inflight,
        increment_ids_dispatched, increment_requests, record_dispatch_duration,
        record_ids_per_request,
    },
};
use idpool_tonic_core::{
    Error,
    idpool::{
        AllocationQuery, DispatchRequest, MonotonicClock, SearchQuery, StatusUpdate, TimeSource,
    },
    proto::{
        DispatchIdsRequest, DispatchIdsResponse, RequestInfo, SearchIdsRequest,
        SearchIdsResponse, UpdateIdsRequest, UpdateIdsResponse,
        id_dispatcher_server::IdDispatcher,
    },
    types::{
        allocation_response, dispatch_response, search_response, update_response,
        wants_allocation,
    },
};
use std::{sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

/// gRPC front end for the dispatch orchestrator.
#[derive(Clone)]
pub struct DispatchService {
    worker_pool: Arc<WorkerPool>,
    orchestrator: Arc<Orchestrator>,
    clock: MonotonicClock,
}

impl DispatchService {
    /// Creates the service and spawns `config.num_workers` workers, each
    /// sharing `orchestrator` and owning a queue of `config.work_queue_size`.
    pub fn new(config: &ServerConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let mut workers = Vec::with_capacity(config.num_workers);

        for worker_id in 0..config.num_workers {
            let (tx, rx) = mpsc::channel(config.work_queue_size);
            workers.push(tx);
            tokio::spawn(worker_loop(
                worker_id,
                rx,
                Arc::clone(&orchestrator),
                config.dispatch_timeout,
            ));
        }

        let worker_pool = WorkerPool::new(
            workers,
            CancellationToken::new(),
            config.shutdown_timeout,
        );

        Self {
            worker_pool: Arc::new(worker_pool),
            orchestrator,
            clock: MonotonicClock::default(),
        }
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }

    /// Refuses new dispatches, drains in-flight ones and stops the workers.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.worker_pool.shutdown().await
    }

    async fn run_dispatch(
        &self,
        request_info: Option<&RequestInfo>,
        request: DispatchRequest,
    ) -> Result<DispatchIdsResponse, Error> {
        let response = self.worker_pool.dispatch(request).await?;
        increment_ids_dispatched(response.ids.len() as u64);
        Ok(dispatch_response(
            request_info,
            response,
            self.clock.current_millis(),
        ))
    }

    async fn read_allocation(
        &self,
        request_info: Option<&RequestInfo>,
        req: DispatchIdsRequest,
    ) -> Result<DispatchIdsResponse, Error> {
        let query = AllocationQuery::try_from(req)?;
        let allocation = self.orchestrator.fetch_allocated(&query).await?;
        Ok(allocation_response(
            request_info,
            allocation,
            self.clock.current_millis(),
        ))
    }
}

#[tonic::async_trait]
impl IdDispatcher for DispatchService {
    /// Hands out a batch of IDs to the requesting user/device pair, or reads
    /// back the pair's existing IDs when `fetch_allocated_ids` is set.
    ///
    /// If `metrics` is enabled, emits telemetry for request rate, batch size,
    /// in-flight dispatches, duration, IDs dispatched and errors by code.
    /// Every call counts as a request, including ones that fail to decode.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            skip_all,
            fields(count = req.get_ref().user_info.as_ref().map(|u| u.count))
        )
    )]
    async fn dispatch_ids(
        &self,
        req: Request<DispatchIdsRequest>,
    ) -> Result<Response<DispatchIdsResponse>, Status> {
        let start = Instant::now();
        increment_requests();
        let req = req.into_inner();
        let request_info = req.request_info.clone();

        if wants_allocation(&req) {
            return self
                .read_allocation(request_info.as_ref(), req)
                .await
                .map(Response::new)
                .map_err(|e| {
                    increment_dispatch_errors(e.code());
                    e.into()
                });
        }

        let request = DispatchRequest::try_from(req).inspect_err(|e| {
            increment_dispatch_errors(e.code());
        })?;

        record_ids_per_request(request.count as f64);
        increment_dispatches_inflight();

        let result = self.run_dispatch(request_info.as_ref(), request).await;

        decrement_dispatches_inflight();
        record_dispatch_duration(start.elapsed().as_millis() as f64);

        match result {
            Ok(response) => Ok(Response::new(response)),
            Err(e) => {
                increment_dispatch_errors(e.code());
                #[cfg(feature = "tracing")]
                tracing::warn!(code = e.code(), "Dispatch failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Looks up records in the durable store.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn search_ids(
        &self,
        req: Request<SearchIdsRequest>,
    ) -> Result<Response<SearchIdsResponse>, Status> {
        let req = req.into_inner();
        let request_info = req.request_info.clone();
        let query = SearchQuery::try_from(req)?;

        let records = self
            .orchestrator
            .search(&query)
            .await
            .map_err(Error::from)?;

        Ok(Response::new(search_response(
            request_info.as_ref(),
            records,
            self.clock.current_millis(),
        )))
    }

    /// Moves IDs to new statuses and publishes the change.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(skip_all, fields(records = req.get_ref().records.len()))
    )]
    async fn update_ids(
        &self,
        req: Request<UpdateIdsRequest>,
    ) -> Result<Response<UpdateIdsResponse>, Status> {
        if self.worker_pool.is_shutting_down() {
            return Err(Error::ServiceShutdown.into());
        }

        let req = req.into_inner();
        let request_info = req.request_info.clone();
        let update = StatusUpdate::try_from(req)?;

        let records = self
            .orchestrator
            .update_status(update)
            .await
            .map_err(Error::from)
            .inspect_err(|_e| {
                #[cfg(feature = "tracing")]
                tracing::warn!(code = _e.code(), "Status update failed: {_e}");
            })?;

        Ok(Response::new(update_response(
            request_info.as_ref(),
            records,
            self.clock.current_millis(),
        )))
    }
}
