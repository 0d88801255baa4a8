//! Conversions between wire messages and `idpool` domain types.
//!
//! Decoding is fallible and reports [`Error::InvalidRequest`]; encoding never
//! fails. `device_info` travels as a JSON string on the wire and as a
//! [`serde_json::Value`] in the domain, with the empty string standing in for
//! "no device info".

use crate::{Error, proto};
use idpool::{
    Allocation, AllocationQuery, DispatchRequest, DispatchResponse, DispatchedIdRecord, IdRecord,
    IdStatus, PoolStatusEntry, SearchQuery, StatusUpdate,
};
use serde_json::Value;

/// `status` reported in [`proto::ResponseInfo`] for successful calls.
pub const RESPONSE_STATUS_SUCCESSFUL: &str = "successful";

impl TryFrom<proto::DispatchIdsRequest> for DispatchRequest {
    type Error = Error;

    fn try_from(req: proto::DispatchIdsRequest) -> Result<Self, Self::Error> {
        let user = req.user_info.ok_or_else(|| Error::InvalidRequest {
            reason: "user_info is required".to_string(),
        })?;

        let device_info = decode_device_info(&user.device_info)?;
        Ok(
            DispatchRequest::new(user.user_uuid, user.device_uuid, i64::from(user.count))
                .with_device_info(device_info),
        )
    }
}

/// Whether the request asks to read back existing IDs rather than dispatch.
pub fn wants_allocation(req: &proto::DispatchIdsRequest) -> bool {
    req.user_info.as_ref().is_some_and(|u| u.fetch_allocated_ids)
}

impl TryFrom<proto::DispatchIdsRequest> for AllocationQuery {
    type Error = Error;

    fn try_from(req: proto::DispatchIdsRequest) -> Result<Self, Self::Error> {
        let user = req.user_info.ok_or_else(|| Error::InvalidRequest {
            reason: "user_info is required".to_string(),
        })?;

        let page = req.allocated_page.unwrap_or_default();
        Ok(
            AllocationQuery::new(user.user_uuid, user.device_uuid).page(
                page.offset as usize,
                (page.limit > 0).then_some(page.limit as usize),
            ),
        )
    }
}

impl TryFrom<proto::UpdateIdsRequest> for StatusUpdate {
    type Error = Error;

    fn try_from(req: proto::UpdateIdsRequest) -> Result<Self, Self::Error> {
        let entries = req
            .records
            .into_iter()
            .map(|record| {
                let status = record.status.parse::<IdStatus>().map_err(|e: idpool::Error| {
                    Error::InvalidRequest {
                        reason: format!("{}: {e}", record.id),
                    }
                })?;
                Ok(PoolStatusEntry::new(record.id, status))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(StatusUpdate::new(req.user_uuid, entries))
    }
}

impl TryFrom<proto::SearchIdsRequest> for SearchQuery {
    type Error = Error;

    fn try_from(req: proto::SearchIdsRequest) -> Result<Self, Self::Error> {
        let status = req
            .status
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<IdStatus>())
            .transpose()
            .map_err(|e: idpool::Error| Error::InvalidRequest {
                reason: e.to_string(),
            })?;

        Ok(SearchQuery {
            ids: (!req.ids.is_empty()).then_some(req.ids),
            status,
            limit: (req.limit > 0).then_some(req.limit as usize),
        })
    }
}

impl From<DispatchedIdRecord> for proto::IdResponse {
    fn from(record: DispatchedIdRecord) -> Self {
        Self {
            id: record.id,
            user_uuid: record.requester_id,
            device_uuid: record.device_id,
            device_info: encode_device_info(&record.device_info),
            status: record.status.to_string(),
        }
    }
}

impl From<IdRecord> for proto::IdRecord {
    fn from(record: IdRecord) -> Self {
        Self {
            id: record.id,
            status: record.status.to_string(),
        }
    }
}

/// Builds the response header, echoing the caller's context when present.
pub fn response_info(request_info: Option<&proto::RequestInfo>, now: u64) -> proto::ResponseInfo {
    let (api_id, ver, res_msg_id) = request_info
        .map(|info| (info.api_id.clone(), info.ver.clone(), info.msg_id.clone()))
        .unwrap_or_default();

    proto::ResponseInfo {
        api_id,
        ver,
        ts: now,
        res_msg_id,
        status: RESPONSE_STATUS_SUCCESSFUL.to_string(),
    }
}

pub fn dispatch_response(
    request_info: Option<&proto::RequestInfo>,
    response: DispatchResponse,
    now: u64,
) -> proto::DispatchIdsResponse {
    proto::DispatchIdsResponse {
        response_info: Some(response_info(request_info, now)),
        id_responses: response.ids.into_iter().map(Into::into).collect(),
        fetch_limit: response.fetch_limit,
        total_limit: response.total_limit,
        total_count: 0,
    }
}

pub fn allocation_response(
    request_info: Option<&proto::RequestInfo>,
    allocation: Allocation,
    now: u64,
) -> proto::DispatchIdsResponse {
    proto::DispatchIdsResponse {
        response_info: Some(response_info(request_info, now)),
        id_responses: allocation.ids.into_iter().map(Into::into).collect(),
        fetch_limit: allocation.fetch_limit,
        total_limit: allocation.total_limit,
        total_count: allocation.total_count,
    }
}

pub fn update_response(
    request_info: Option<&proto::RequestInfo>,
    records: Vec<IdRecord>,
    now: u64,
) -> proto::UpdateIdsResponse {
    proto::UpdateIdsResponse {
        response_info: Some(response_info(request_info, now)),
        records: records.into_iter().map(Into::into).collect(),
    }
}

pub fn search_response(
    request_info: Option<&proto::RequestInfo>,
    records: Vec<IdRecord>,
    now: u64,
) -> proto::SearchIdsResponse {
    proto::SearchIdsResponse {
        response_info: Some(response_info(request_info, now)),
        records: records.into_iter().map(Into::into).collect(),
    }
}

fn decode_device_info(raw: &str) -> Result<Value, Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw).map_err(|e| Error::InvalidRequest {
        reason: format!("device_info is not valid JSON: {e}"),
    })
}

fn encode_device_info(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_request(count: i32, device_info: &str) -> proto::DispatchIdsRequest {
        proto::DispatchIdsRequest {
            request_info: Some(proto::RequestInfo {
                api_id: "idpool".into(),
                ver: "1.0".into(),
                ts: 1,
                msg_id: "msg-7".into(),
            }),
            user_info: Some(proto::UserInfo {
                user_uuid: "user-1".into(),
                device_uuid: "device-1".into(),
                count,
                device_info: device_info.into(),
                fetch_allocated_ids: false,
            }),
            allocated_page: None,
        }
    }

    #[test]
    fn dispatch_request_decodes_device_info() {
        let req = DispatchRequest::try_from(wire_request(3, r#"{"os":"android"}"#)).unwrap();
        assert_eq!(req.requester_id, "user-1");
        assert_eq!(req.device_id, "device-1");
        assert_eq!(req.count, 3);
        assert_eq!(req.device_info["os"], "android");

        let req = DispatchRequest::try_from(wire_request(1, "")).unwrap();
        assert_eq!(req.device_info, Value::Null);
    }

    #[test]
    fn dispatch_request_rejects_bad_payloads() {
        assert!(matches!(
            DispatchRequest::try_from(wire_request(1, "{not json")),
            Err(Error::InvalidRequest { .. })
        ));

        let mut missing_user = wire_request(1, "");
        missing_user.user_info = None;
        assert!(matches!(
            DispatchRequest::try_from(missing_user),
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[test]
    fn negative_counts_reach_the_domain_unchanged() {
        // Range checks belong to the quota guard.
        let req = DispatchRequest::try_from(wire_request(-2, "")).unwrap();
        assert_eq!(req.count, -2);
    }

    #[test]
    fn dispatch_response_echoes_request_context() {
        let response = DispatchResponse {
            ids: vec![DispatchedIdRecord {
                id: "A1".into(),
                requester_id: "user-1".into(),
                device_id: "device-1".into(),
                device_info: serde_json::json!({ "os": "android" }),
                status: IdStatus::Dispatched,
                dispatched_at: 10,
            }],
            fetch_limit: 4,
            total_limit: 5,
        };
        let request = wire_request(1, "");
        let wire = dispatch_response(request.request_info.as_ref(), response, 99);

        let info = wire.response_info.unwrap();
        assert_eq!(info.api_id, "idpool");
        assert_eq!(info.res_msg_id, "msg-7");
        assert_eq!(info.ts, 99);
        assert_eq!(info.status, RESPONSE_STATUS_SUCCESSFUL);

        assert_eq!(wire.fetch_limit, 4);
        assert_eq!(wire.total_limit, 5);
        let id = &wire.id_responses[0];
        assert_eq!(id.id, "A1");
        assert_eq!(id.user_uuid, "user-1");
        assert_eq!(id.status, "DISPATCHED");
        assert_eq!(id.device_info, r#"{"os":"android"}"#);
    }

    #[test]
    fn search_request_maps_empty_fields_to_unset() {
        let query = SearchQuery::try_from(proto::SearchIdsRequest::default()).unwrap();
        assert_eq!(query, SearchQuery::default());

        let query = SearchQuery::try_from(proto::SearchIdsRequest {
            request_info: None,
            ids: vec!["A1".into()],
            status: Some("dispatched".into()),
            limit: 10,
        })
        .unwrap();
        assert_eq!(query.ids, Some(vec!["A1".to_string()]));
        assert_eq!(query.status, Some(IdStatus::Dispatched));
        assert_eq!(query.limit, Some(10));

        assert!(matches!(
            SearchQuery::try_from(proto::SearchIdsRequest {
                status: Some("LOST".into()),
                ..Default::default()
            }),
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[test]
    fn allocation_reads_are_flagged_and_paged() {
        let mut request = wire_request(0, "");
        assert!(!wants_allocation(&request));

        request.user_info.as_mut().unwrap().fetch_allocated_ids = true;
        assert!(wants_allocation(&request));

        let query = AllocationQuery::try_from(request.clone()).unwrap();
        assert_eq!(query, AllocationQuery::new("user-1", "device-1"));

        request.allocated_page = Some(proto::Page {
            offset: 2,
            limit: 3,
        });
        let query = AllocationQuery::try_from(request).unwrap();
        assert_eq!(query.offset, 2);
        assert_eq!(query.limit, Some(3));
    }

    #[test]
    fn allocation_response_carries_the_total() {
        let allocation = Allocation {
            ids: Vec::new(),
            total_count: 4,
            fetch_limit: 1,
            total_limit: 5,
        };
        let wire = allocation_response(None, allocation, 3);
        assert_eq!(wire.total_count, 4);
        assert_eq!(wire.fetch_limit, 1);
        assert!(wire.id_responses.is_empty());
        assert_eq!(wire.response_info.unwrap().res_msg_id, "");
    }

    #[test]
    fn update_request_parses_every_status() {
        let update = StatusUpdate::try_from(proto::UpdateIdsRequest {
            request_info: None,
            user_uuid: "ops".into(),
            records: vec![
                proto::IdRecord {
                    id: "A1".into(),
                    status: "retired".into(),
                },
                proto::IdRecord {
                    id: "A2".into(),
                    status: "DISPATCHED".into(),
                },
            ],
        })
        .unwrap();
        assert_eq!(update.requester_id, "ops");
        assert_eq!(
            update.entries,
            [
                PoolStatusEntry::new("A1", IdStatus::Retired),
                PoolStatusEntry::new("A2", IdStatus::Dispatched),
            ]
        );

        let err = StatusUpdate::try_from(proto::UpdateIdsRequest {
            records: vec![proto::IdRecord {
                id: "A3".into(),
                status: "GONE".into(),
            }],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { ref reason } if reason.starts_with("A3")));
    }
}
