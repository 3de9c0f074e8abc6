use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ProxyBackend, ProxyError, RouteEntry, RoutingTable, Upstream};

const ROUTE_ID_PREFIX: &str = "nixopus-route";

/// Caddy admin API. Managed routes carry an `@id` of
/// `nixopus-route:<owner>:<domain>`; routes without it are left alone.
#[derive(Clone, Debug)]
pub struct CaddyProxy {
    client: reqwest::Client,
    admin_url: String,
    server_name: String,
}

impl CaddyProxy {
    #[must_use]
    pub fn new(admin_url: &str, server_name: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            admin_url: admin_url.trim_end_matches('/').to_string(),
            server_name: server_name.to_string(),
        }
    }

    fn server_url(&self) -> String {
        format!("{}/config/apps/http/servers/{}", self.admin_url, self.server_name)
    }

    fn routes_url(&self) -> String {
        format!("{}/routes", self.server_url())
    }

    async fn fetch_routes(&self) -> Result<Vec<Value>, ProxyError> {
        let response = self
            .client
            .get(self.routes_url())
            .send()
            .await
            .map_err(|error| ProxyError::Backend(error.to_string()))?;

        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(ProxyError::Backend(format!(
                "GET routes returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| ProxyError::Backend(error.to_string()))?;
        Ok(match body {
            Value::Array(routes) => routes,
            _ => Vec::new(),
        })
    }

    async fn create_server(&self, routes: Vec<Value>) -> Result<(), ProxyError> {
        let server = json!({ "listen": [":443", ":80"], "routes": routes });
        let response = self
            .client
            .put(self.server_url())
            .json(&server)
            .send()
            .await
            .map_err(|error| ProxyError::Backend(error.to_string()))?;
        if response.status().is_success() {
            info!(server = %self.server_name, "created proxy server");
            return Ok(());
        }

        let http_app = json!({ "servers": { self.server_name.clone(): server } });
        let response = self
            .client
            .put(format!("{}/config/apps/http", self.admin_url))
            .json(&http_app)
            .send()
            .await
            .map_err(|error| ProxyError::Backend(error.to_string()))?;
        if response.status().is_success() {
            info!(server = %self.server_name, "created proxy http app");
            return Ok(());
        }
        Err(ProxyError::Backend(format!(
            "creating server {} returned {}",
            self.server_name,
            response.status()
        )))
    }
}

#[must_use]
pub fn route_json(domain: &str, entry: &RouteEntry) -> Value {
    json!({
        "@id": format!("{ROUTE_ID_PREFIX}:{}:{domain}", entry.owner),
        "match": [{ "host": [domain] }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": entry.upstream.dial() }]
        }],
        "terminal": true
    })
}

/// Reads a managed route back; `None` for routes the control plane does not own.
#[must_use]
pub fn parse_route(route: &Value) -> Option<(String, RouteEntry)> {
    let id = route.get("@id")?.as_str()?;
    let rest = id.strip_prefix(ROUTE_ID_PREFIX)?.strip_prefix(':')?;
    let (owner, domain) = rest.split_once(':')?;

    let dial = route
        .get("handle")?
        .as_array()?
        .iter()
        .find(|handler| handler.get("handler").and_then(Value::as_str) == Some("reverse_proxy"))?
        .get("upstreams")?
        .as_array()?
        .first()?
        .get("dial")?
        .as_str()?;
    let (host, port) = dial.rsplit_once(':')?;

    Some((
        domain.to_string(),
        RouteEntry {
            upstream: Upstream::new(host, port.parse().ok()?),
            owner: owner.to_string(),
        },
    ))
}

#[async_trait]
impl ProxyBackend for CaddyProxy {
    async fn load(&self) -> Result<RoutingTable, ProxyError> {
        Ok(self.fetch_routes().await?.iter().filter_map(parse_route).collect())
    }

    async fn apply(&self, routes: &RoutingTable) -> Result<(), ProxyError> {
        let mut combined: Vec<Value> = self
            .fetch_routes()
            .await?
            .into_iter()
            .filter(|route| parse_route(route).is_none())
            .collect();
        combined.extend(routes.iter().map(|(domain, entry)| route_json(domain, entry)));

        let response = self
            .client
            .patch(self.routes_url())
            .json(&combined)
            .send()
            .await
            .map_err(|error| ProxyError::Backend(error.to_string()))?;

        if response.status().is_success() {
            debug!(routes = routes.len(), "proxy routes applied");
            return Ok(());
        }
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return self.create_server(combined).await;
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ProxyError::Backend(format!("PATCH routes returned {status}: {body}")))
    }
}
