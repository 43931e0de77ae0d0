// REST client for presence snapshots, channel enumeration and aggregate
// publication.

pub mod pagination;

use std::future::Future;
use std::time::Duration;

use presence_common::protocol::rest::{ChannelListItem, PublishMessage};
use presence_common::types::ChannelPresence;
use reqwest::header::{ACCEPT, LINK};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use url::Url;

use crate::config::ApiKey;
use crate::engine::resync::SnapshotSource;
use crate::error::RestError;
use crate::publish::AggregatePublisher;

use self::pagination::next_link;

const DEFAULT_MAX_PAGES: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Lists the channels currently active in the application.
pub trait ChannelEnumerator: Send + Sync + 'static {
    fn list_channels(&self) -> impl Future<Output = Result<Vec<String>, RestError>> + Send;
}

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    key: ApiKey,
    max_pages: usize,
}

impl RestClient {
    pub fn new(base_url: Url, key: ApiKey) -> Result<Self, RestError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base_url, key, max_pages: DEFAULT_MAX_PAGES })
    }

    /// Upper bound on pages followed for a single listing.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RestError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RestError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET `first` and every page linked from it, concatenating the items.
    async fn get_paginated<T: DeserializeOwned>(&self, first: Url) -> Result<Vec<T>, RestError> {
        let mut items = Vec::new();
        let mut next = Some(first);
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages == self.max_pages {
                return Err(RestError::TooManyPages { limit: self.max_pages });
            }
            pages += 1;

            trace!(url = %url, page = pages, "GET");
            let response = self
                .http
                .get(url.clone())
                .basic_auth(self.key.name(), Some(self.key.secret()))
                .header(ACCEPT, "application/json")
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(RestError::Status { status: status.as_u16(), body });
            }

            next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| next_link(value, &url));

            let page: Vec<T> = response.json().await?;
            items.extend(page);
        }

        debug!(pages, items = items.len(), "paginated listing complete");
        Ok(items)
    }
}

impl SnapshotSource for RestClient {
    async fn fetch_presence(&self, channels: &[String]) -> Result<Vec<ChannelPresence>, RestError> {
        if channels.is_empty() {
            return Ok(Vec::new());
        }
        let mut url = self.endpoint(&["presence"])?;
        url.query_pairs_mut().append_pair("channels", &channels.join(","));
        self.get_paginated(url).await
    }
}

impl ChannelEnumerator for RestClient {
    async fn list_channels(&self) -> Result<Vec<String>, RestError> {
        let mut url = self.endpoint(&["channels"])?;
        url.query_pairs_mut().append_pair("by", "id");
        let items: Vec<ChannelListItem> = self.get_paginated(url).await?;
        Ok(items.iter().filter_map(ChannelListItem::active_id).map(str::to_string).collect())
    }
}

impl AggregatePublisher for RestClient {
    async fn publish(&self, channel: &str, message: &PublishMessage) -> Result<(), RestError> {
        let url = self.endpoint(&["channels", channel, "messages"])?;
        let response = self
            .http
            .post(url)
            .basic_auth(self.key.name(), Some(self.key.secret()))
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::Status { status: status.as_u16(), body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use presence_common::types::PresenceAction;
    use serde_json::{json, Value};

    use super::*;

    const AUTH: &str = "Basic YXBwLmtleTpzZWNyZXQ=";

    #[derive(Default)]
    struct Recorded {
        published: Mutex<Vec<(String, Value)>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some(AUTH)
    }

    async fn presence(
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let channels = query.get("channels").cloned().unwrap_or_default();
        match query.get("page").map(String::as_str) {
            None => (
                [("link", format!("<./presence?channels={channels}&page=2>; rel=\"next\""))],
                Json(json!([
                    {"channel": "presence:a", "presence": [
                        {"clientId": "x", "connectionId": "1", "action": 1, "timestamp": 10}
                    ]}
                ])),
            )
                .into_response(),
            Some(_) => Json(json!([
                {"channel": "presence:b", "presence": [
                    {"clientId": "y", "connectionId": "2", "action": 1, "timestamp": 20}
                ]}
            ]))
            .into_response(),
        }
    }

    async fn channels(headers: HeaderMap) -> axum::response::Response {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Json(json!([
            "presence:a",
            {"channelId": "presence:b", "status": {"isActive": true}},
            {"channelId": "presence:c", "status": {"isActive": false}}
        ]))
        .into_response()
    }

    async fn looping() -> axum::response::Response {
        ([("link", "<./looping>; rel=\"next\"")], Json(json!([]))).into_response()
    }

    async fn publish(
        State(recorded): State<Arc<Recorded>>,
        Path(channel): Path<String>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        recorded.published.lock().unwrap().push((channel, body));
        StatusCode::CREATED
    }

    async fn serve() -> (Url, Arc<Recorded>) {
        let recorded = Arc::new(Recorded::default());
        let app = Router::new()
            .route("/presence", get(presence))
            .route("/channels", get(channels))
            .route("/looping", get(looping))
            .route("/channels/{channel}/messages", post(publish))
            .with_state(Arc::clone(&recorded));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), recorded)
    }

    fn client(base: Url) -> RestClient {
        RestClient::new(base, ApiKey::parse("app.key:secret").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn snapshot_follows_link_pagination() {
        let (base, _) = serve().await;
        let sets = client(base)
            .fetch_presence(&["presence:a".to_string(), "presence:b".to_string()])
            .await
            .unwrap();

        let channels: Vec<_> = sets.iter().map(|set| set.channel.as_str()).collect();
        assert_eq!(channels, vec!["presence:a", "presence:b"]);
        assert_eq!(sets[1].presence[0].action, PresenceAction::Present);
        assert_eq!(sets[1].presence[0].timestamp, 20);
    }

    #[tokio::test]
    async fn empty_snapshot_request_skips_http() {
        let base = Url::parse("http://127.0.0.1:9/").unwrap();
        assert!(client(base).fetch_presence(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enumeration_keeps_active_channels() {
        let (base, _) = serve().await;
        let channels = client(base).list_channels().await.unwrap();
        assert_eq!(channels, vec!["presence:a", "presence:b"]);
    }

    #[tokio::test]
    async fn bad_credentials_surface_status() {
        let (base, _) = serve().await;
        let client = RestClient::new(base, ApiKey::parse("app.key:wrong").unwrap()).unwrap();
        let err = client.list_channels().await.unwrap_err();
        assert!(matches!(err, RestError::Status { status: 401, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn runaway_pagination_is_bounded() {
        let (base, _) = serve().await;
        let client = client(base.clone()).with_max_pages(3);
        let url = base.join("looping").unwrap();
        let err = client.get_paginated::<Value>(url).await.unwrap_err();
        assert!(matches!(err, RestError::TooManyPages { limit: 3 }));
    }

    #[tokio::test]
    async fn publish_posts_to_encoded_channel_path() {
        let (base, recorded) = serve().await;
        let message = PublishMessage::presence_update(json!({"presence:a": {}}));
        client(base).publish("presencebatch:by-channel", &message).await.unwrap();

        let published = recorded.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "presencebatch:by-channel");
        assert_eq!(published[0].1["name"], "presence-update");
    }

    #[test]
    fn endpoint_appends_segments_to_base_path() {
        let client = client(Url::parse("https://rest.example.test/v1/").unwrap());
        let url = client.endpoint(&["channels", "a/b", "messages"]).unwrap();
        assert_eq!(url.as_str(), "https://rest.example.test/v1/channels/a%2Fb/messages");
    }
}
