use crate::server::{
    config::{CliArgs, ServerConfig},
    service::{
        backend::{Backends, build_backends, seed_store},
        handler::DispatchService,
    },
    sink::event_sink,
    telemetry::tally,
};
use clap::Parser;
use idpool_tonic_core::{
    error_code,
    idpool::{IdStatus, MemoryStore},
    proto::{
        DispatchIdsRequest, IdRecord, Page, RequestInfo, SearchIdsRequest, UpdateIdsRequest,
        UserInfo, id_dispatcher_server::IdDispatcher,
    },
    types::RESPONSE_STATUS_SUCCESSFUL,
};
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request};

static SEED_FILES: AtomicUsize = AtomicUsize::new(0);

/// A seed file path no other test in this process uses.
fn seed_path(name: &str) -> PathBuf {
    let n = SEED_FILES.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("idpool-{}-{n}-{name}.txt", std::process::id()))
}

async fn service_with(ids: &[&str]) -> (DispatchService, Backends) {
    let path = seed_path("service");
    tokio::fs::write(&path, ids.join("\n")).await.unwrap();

    let mut argv = vec![
        "idpool-tonic-server",
        "--num-workers",
        "2",
        "--dispatch-limit-per-user",
        "5",
        "--lock-retry-attempts",
        "0",
        "--seed-file",
    ];
    let path_arg = path.display().to_string();
    argv.push(&path_arg);

    let config = ServerConfig::try_from(CliArgs::try_parse_from(argv).unwrap()).unwrap();
    let backends = build_backends(&config).await.unwrap();
    let _ = tokio::fs::remove_file(&path).await;

    let service = DispatchService::new(&config, std::sync::Arc::clone(&backends.orchestrator));
    (service, backends)
}

fn dispatch_request(user: &str, count: i32) -> Request<DispatchIdsRequest> {
    Request::new(DispatchIdsRequest {
        request_info: Some(RequestInfo {
            api_id: "idpool".into(),
            ver: "1.0".into(),
            ts: 1,
            msg_id: format!("msg-{user}"),
        }),
        user_info: Some(UserInfo {
            user_uuid: user.into(),
            device_uuid: "device-1".into(),
            count,
            device_info: r#"{"os":"android"}"#.into(),
            fetch_allocated_ids: false,
        }),
        allocated_page: None,
    })
}

fn allocation_request(user: &str, page: Option<Page>) -> Request<DispatchIdsRequest> {
    let mut request = dispatch_request(user, 0);
    request.get_mut().user_info.as_mut().unwrap().fetch_allocated_ids = true;
    request.get_mut().allocated_page = page;
    request
}

fn update_request(user: &str, records: &[(&str, &str)]) -> Request<UpdateIdsRequest> {
    Request::new(UpdateIdsRequest {
        request_info: None,
        user_uuid: user.into(),
        records: records
            .iter()
            .map(|(id, status)| IdRecord {
                id: (*id).into(),
                status: (*status).into(),
            })
            .collect(),
    })
}

/// Runs every buffered event through the sink, as the server does on
/// shutdown.
async fn flush_events(backends: Backends) -> Arc<MemoryStore> {
    let token = CancellationToken::new();
    token.cancel();
    event_sink(backends.events, Arc::clone(&backends.store), token).await;
    backends.store
}

#[tokio::test]
async fn dispatch_ids_returns_ids_and_remaining_quota() {
    let (service, mut backends) = service_with(&["A", "B", "C", "D"]).await;

    let response = service
        .dispatch_ids(dispatch_request("user-1", 3))
        .await
        .unwrap()
        .into_inner();

    let ids: Vec<_> = response.id_responses.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["A", "B", "C"]);
    assert_eq!(response.fetch_limit, 2);
    assert_eq!(response.total_limit, 5);
    assert!(response.id_responses.iter().all(|r| r.status == "DISPATCHED"));

    let info = response.response_info.unwrap();
    assert_eq!(info.res_msg_id, "msg-user-1");
    assert_eq!(info.status, RESPONSE_STATUS_SUCCESSFUL);

    // Pool status update first, then the audit log.
    let first = backends.events.recv().await.unwrap();
    let second = backends.events.recv().await.unwrap();
    assert_eq!(first.topic, "update-id-pool-status");
    assert_eq!(second.topic, "save-id-dispatch-log");
}

#[tokio::test]
async fn quota_errors_carry_a_stable_code() {
    let (service, _backends) = service_with(&["A", "B", "C", "D", "E", "F", "G"]).await;

    service
        .dispatch_ids(dispatch_request("user-1", 4))
        .await
        .unwrap();
    let status = service
        .dispatch_ids(dispatch_request("user-1", 2))
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::ResourceExhausted);
    assert_eq!(error_code(&status), Some("QUOTA_EXCEEDED"));

    // A different device is a different pair.
    let mut other_device = dispatch_request("user-1", 2);
    other_device.get_mut().user_info.as_mut().unwrap().device_uuid = "device-2".into();
    assert!(service.dispatch_ids(other_device).await.is_ok());
}

#[tokio::test]
async fn malformed_requests_are_invalid_arguments() {
    let (service, _backends) = service_with(&["A"]).await;

    for count in [0, -1, 6] {
        let status = service
            .dispatch_ids(dispatch_request("user-1", count))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument, "count {count}");
        assert_eq!(error_code(&status), Some("INVALID_REQUEST"));
    }

    let mut bad_json = dispatch_request("user-1", 1);
    bad_json.get_mut().user_info.as_mut().unwrap().device_info = "{oops".into();
    let status = service.dispatch_ids(bad_json).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn undecodable_requests_still_count_as_requests() {
    let (service, _backends) = service_with(&["A"]).await;
    let requests = tally::requests();
    let errors = tally::dispatch_errors();

    let mut bad_json = dispatch_request("user-1", 1);
    bad_json.get_mut().user_info.as_mut().unwrap().device_info = "{oops".into();
    service.dispatch_ids(bad_json).await.unwrap_err();

    assert_eq!(tally::requests() - requests, 1);
    assert_eq!(tally::dispatch_errors() - errors, 1);

    service
        .dispatch_ids(dispatch_request("user-1", 1))
        .await
        .unwrap();
    assert_eq!(tally::requests() - requests, 2);
    assert_eq!(tally::dispatch_errors() - errors, 1);
}

#[tokio::test]
async fn allocated_ids_are_read_back_without_dispatching() {
    let (service, backends) = service_with(&["A", "B", "C", "D"]).await;
    service
        .dispatch_ids(dispatch_request("user-1", 3))
        .await
        .unwrap();
    let store = flush_events(backends).await;
    assert_eq!(store.count_by_status(IdStatus::Dispatched), 3);

    let response = service
        .dispatch_ids(allocation_request(
            "user-1",
            Some(Page {
                offset: 1,
                limit: 1,
            }),
        ))
        .await
        .unwrap()
        .into_inner();
    let ids: Vec<_> = response.id_responses.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["B"]);
    assert_eq!(response.total_count, 3);
    assert_eq!(response.fetch_limit, 2);
    assert_eq!(response.total_limit, 5);

    // Nothing new was handed out.
    assert_eq!(store.count_by_status(IdStatus::Unassigned), 1);

    // A pair with no history reads back empty.
    let response = service
        .dispatch_ids(allocation_request("user-2", None))
        .await
        .unwrap()
        .into_inner();
    assert!(response.id_responses.is_empty());
    assert_eq!(response.total_count, 0);
    assert_eq!(response.fetch_limit, 5);
}

#[tokio::test]
async fn update_ids_retires_ids_and_reports_them() {
    let (service, backends) = service_with(&["A", "B", "C"]).await;

    let response = service
        .update_ids(update_request("ops", &[("B", "retired"), ("C", "EXPIRED")]))
        .await
        .unwrap()
        .into_inner();
    let records: Vec<_> = response
        .records
        .iter()
        .map(|r| (r.id.as_str(), r.status.as_str()))
        .collect();
    assert_eq!(records, [("B", "RETIRED"), ("C", "EXPIRED")]);
    assert_eq!(
        response.response_info.unwrap().status,
        RESPONSE_STATUS_SUCCESSFUL
    );

    // Withdrawn IDs are never dispatched.
    let dispatched = service
        .dispatch_ids(dispatch_request("user-1", 1))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(dispatched.id_responses[0].id, "A");
    let status = service
        .dispatch_ids(dispatch_request("user-2", 1))
        .await
        .unwrap_err();
    assert_eq!(error_code(&status), Some("NO_IDS_AVAILABLE"));

    let store = flush_events(backends).await;
    assert_eq!(store.count_by_status(IdStatus::Retired), 1);
    assert_eq!(store.count_by_status(IdStatus::Expired), 1);
}

#[tokio::test]
async fn invalid_updates_are_rejected_whole() {
    let (service, backends) = service_with(&["A", "B"]).await;

    for records in [
        vec![("A", "RETIRED"), ("Z", "RETIRED")],
        vec![("A", "UNASSIGNED")],
        vec![("A", "MISPLACED")],
        vec![("A", "RETIRED"), ("A", "EXPIRED")],
        vec![],
    ] {
        let status = service
            .update_ids(update_request("ops", &records))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument, "{records:?}");
        assert_eq!(error_code(&status), Some("INVALID_REQUEST"));
    }

    let status = service
        .update_ids(update_request("", &[("A", "RETIRED")]))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let store = flush_events(backends).await;
    assert_eq!(store.count_by_status(IdStatus::Unassigned), 2);
}

#[tokio::test]
async fn exhausted_pool_is_unavailable() {
    let (service, _backends) = service_with(&["A", "B"]).await;

    let status = service
        .dispatch_ids(dispatch_request("user-1", 3))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(error_code(&status), Some("NO_IDS_AVAILABLE"));
}

#[tokio::test]
async fn search_ids_reads_the_store() {
    let (service, backends) = service_with(&["A", "B", "C"]).await;

    let response = service
        .search_ids(Request::new(SearchIdsRequest {
            ids: vec!["B".into(), "Z".into()],
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.records.len(), 1);
    assert_eq!(response.records[0].id, "B");
    assert_eq!(response.records[0].status, "UNASSIGNED");

    assert_eq!(backends.store.count_by_status(IdStatus::Unassigned), 3);

    let status = service
        .search_ids(Request::new(SearchIdsRequest {
            status: Some("MISPLACED".into()),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn shutdown_turns_dispatches_away() {
    let (service, _backends) = service_with(&["A"]).await;

    service.shutdown().await.unwrap();
    assert!(service.worker_pool().is_shutting_down());

    let status = service
        .dispatch_ids(dispatch_request("user-1", 1))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(error_code(&status), Some("SERVICE_SHUTDOWN"));

    let status = service
        .update_ids(update_request("ops", &[("A", "RETIRED")]))
        .await
        .unwrap_err();
    assert_eq!(error_code(&status), Some("SERVICE_SHUTDOWN"));
}

#[tokio::test]
async fn seed_file_skips_comments_and_duplicates() {
    let path = seed_path("comments");
    tokio::fs::write(&path, "# header\nA\n\n  B  \nA\n# trailing\n")
        .await
        .unwrap();

    let store = MemoryStore::new();
    assert_eq!(seed_store(&store, &path).await.unwrap(), 2);
    assert_eq!(store.len(), 2);
    let _ = tokio::fs::remove_file(&path).await;

    assert!(seed_store(&store, &seed_path("missing")).await.is_err());
}
