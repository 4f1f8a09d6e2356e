use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde_json::Value;

use super::error_mapping::{map_reqwest_error, map_status};
use super::{FetchError, FetchErrorKind, FetchResponse, RemoteFetcher, RemoteItem};
use crate::build_info;
use crate::config::CategoryTable;
use crate::EntityId;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_GLOBAL_RPS: NonZeroU32 = nonzero!(2u32);

/// Process-wide ceiling on outbound requests, shared by every category.
pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub fn global_rate_limiter(requests_per_second: NonZeroU32) -> GlobalRateLimiter {
    Arc::new(RateLimiter::direct(Quota::per_second(requests_per_second)))
}

struct HttpEndpoint {
    url_template: String,
    participants_pointer: Option<String>,
    participant_field: Option<String>,
}

/// `reqwest` implementation of [`RemoteFetcher`] driven by each category's `url_template`.
///
/// Per-category budgets are the rate governor's job; this fetcher only applies the
/// global requests-per-second ceiling on top.
pub struct HttpFetcher {
    client: reqwest::Client,
    endpoints: HashMap<String, HttpEndpoint>,
    api_token: Option<String>,
    global_rate_limiter: GlobalRateLimiter,
}

impl HttpFetcher {
    pub fn new(
        categories: &CategoryTable,
        api_token: Option<String>,
        global_rate_limiter: GlobalRateLimiter,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("rider_sync/{}", build_info::VERSION))
            .build()?;

        let endpoints = categories
            .iter()
            .filter_map(|category| {
                let url_template = category.url_template.clone()?;
                Some((
                    category.key.clone(),
                    HttpEndpoint {
                        url_template,
                        participants_pointer: category.participants_pointer.clone(),
                        participant_field: category.participant_field.clone(),
                    },
                ))
            })
            .collect();

        Ok(Self {
            client,
            endpoints,
            api_token,
            global_rate_limiter,
        })
    }

    pub fn has_endpoint(&self, category: &str) -> bool {
        self.endpoints.contains_key(category)
    }
}

impl RemoteFetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        category: &'a str,
        key: i64,
    ) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
        Box::pin(async move {
            let endpoint = self.endpoints.get(category).ok_or_else(|| {
                FetchError::new(
                    FetchErrorKind::Other,
                    format!("no url_template configured for category {category}"),
                )
            })?;

            let url = endpoint.url_template.replace("{key}", &key.to_string());
            self.global_rate_limiter.until_ready().await;
            let mut request = self.client.get(&url);
            if let Some(token) = &self.api_token {
                request = request.header(AUTHORIZATION, token);
            }

            let response = request
                .send()
                .await
                .map_err(|err| map_reqwest_error(category, err))?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(FetchResponse::NotFound);
            }
            if !status.is_success() {
                return Err(map_status(category, status.as_u16()));
            }

            let payload: Value = response
                .json()
                .await
                .map_err(|err| map_reqwest_error(category, err))?;
            let participants = extract_participants(
                &payload,
                endpoint.participants_pointer.as_deref(),
                endpoint.participant_field.as_deref(),
            )?;

            Ok(FetchResponse::Found(RemoteItem {
                key,
                participants,
                payload,
            }))
        })
    }
}

/// Reads entity ids from the array at `pointer`. A missing array means no participants.
fn extract_participants(
    payload: &Value,
    pointer: Option<&str>,
    field: Option<&str>,
) -> Result<Vec<EntityId>, FetchError> {
    let Some(pointer) = pointer else {
        return Ok(Vec::new());
    };
    let entries = match payload.pointer(pointer) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            return Err(FetchError::new(
                FetchErrorKind::MalformedResponse,
                format!("expected an array at {pointer}, found {}", json_type(other)),
            ))
        }
    };

    Ok(entries
        .iter()
        .filter_map(|entry| match field {
            Some(field) => entry.get(field).and_then(as_entity_id),
            None => as_entity_id(entry),
        })
        .collect())
}

fn as_entity_id(value: &Value) -> Option<EntityId> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
