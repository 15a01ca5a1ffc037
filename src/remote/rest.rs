/// Row access over the backend's PostgREST endpoint.
/// Filters become query parameters; change subscriptions are delegated to the
/// realtime socket.

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

use super::{ChangeKind, DataService, Filter, Query, RealtimeClient, Subscription, Table};
use crate::error::{ClientError, Result};

/// Where the backend lives and which keys to present.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: Url,
    pub anon_key: String,
    /// Privileged key, needed only to delete auth identities.
    pub service_key: Option<String>,
}

impl BackendConfig {
    pub fn new(url: &str, anon_key: &str) -> Result<Self> {
        // A trailing slash keeps any base path when joining endpoints.
        let url = Url::parse(&format!("{}/", url.trim().trim_end_matches('/')))?;
        if anon_key.trim().is_empty() {
            return Err(ClientError::Config("anon key must not be empty".to_string()));
        }
        Ok(BackendConfig {
            url,
            anon_key: anon_key.trim().to_string(),
            service_key: None,
        })
    }

    pub fn with_service_key(mut self, key: Option<String>) -> Self {
        self.service_key = key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn rest_url(&self, table: Table) -> Result<Url> {
        Ok(self.url.join(&format!("rest/v1/{}", table.as_str()))?)
    }

    pub fn auth_url(&self, path: &str) -> Result<Url> {
        Ok(self.url.join(&format!("auth/v1/{}", path.trim_start_matches('/')))?)
    }

    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = self.url.join("realtime/v1/websocket")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config(format!("cannot derive websocket URL from {}", self.url)))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

/// The current user's access token, shared between the auth client (writer)
/// and the row and realtime clients (readers).
#[derive(Debug, Clone, Default)]
pub struct TokenSlot(Arc<RwLock<Option<String>>>);

impl TokenSlot {
    pub fn set(&self, token: Option<String>) {
        if let Ok(mut slot) = self.0.write() {
            *slot = token;
        }
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().ok().and_then(|slot| slot.clone())
    }
}

pub struct RestClient {
    config: BackendConfig,
    client: Client,
    tokens: TokenSlot,
    realtime: RealtimeClient,
}

impl RestClient {
    pub fn new(config: BackendConfig, tokens: TokenSlot) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let realtime = RealtimeClient::new(config.realtime_url()?.to_string(), tokens.clone());

        Ok(RestClient {
            config,
            client,
            tokens,
            realtime,
        })
    }

    pub fn realtime(&self) -> &RealtimeClient {
        &self.realtime
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .tokens
            .get()
            .unwrap_or_else(|| self.config.anon_key.clone());
        request
            .header("apikey", &self.config.anon_key)
            .bearer_auth(bearer)
    }
}

impl DataService for RestClient {
    async fn select(&self, table: Table, query: Query) -> Result<Vec<Value>> {
        let mut params = vec![("select".to_string(), query.columns.clone())];
        params.extend(filter_params(&query.filter));
        if let Some(order) = &query.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        let request = self.client.get(self.config.rest_url(table)?).query(&params);
        let response = self.authorize(request).send().await?;
        read_rows(response, &format!("select from {}", table)).await
    }

    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>> {
        let request = self
            .client
            .post(self.config.rest_url(table)?)
            .header("Prefer", "return=representation")
            .json(&rows);
        let response = self.authorize(request).send().await?;
        read_rows(response, &format!("insert into {}", table)).await
    }

    async fn update(&self, table: Table, patch: Value, filter: Filter) -> Result<Vec<Value>> {
        let request = self
            .client
            .patch(self.config.rest_url(table)?)
            .query(&filter_params(&filter))
            .header("Prefer", "return=representation")
            .json(&patch);
        let response = self.authorize(request).send().await?;
        read_rows(response, &format!("update {}", table)).await
    }

    async fn delete(&self, table: Table, filter: Filter) -> Result<usize> {
        let request = self
            .client
            .delete(self.config.rest_url(table)?)
            .query(&filter_params(&filter))
            .header("Prefer", "return=representation");
        let response = self.authorize(request).send().await?;
        let removed = read_rows(response, &format!("delete from {}", table)).await?;
        Ok(removed.len())
    }

    async fn upsert(&self, table: Table, row: Value, conflict_key: &str) -> Result<Value> {
        let request = self
            .client
            .post(self.config.rest_url(table)?)
            .query(&[("on_conflict", conflict_key)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&vec![row]);
        let response = self.authorize(request).send().await?;

        read_rows(response, &format!("upsert into {}", table))
            .await?
            .pop()
            .ok_or_else(|| ClientError::Server(format!("upsert into {} returned no row", table)))
    }

    async fn subscribe(&self, table: Table, kinds: &[ChangeKind]) -> Result<Subscription> {
        self.realtime.subscribe(table, kinds).await
    }
}

async fn read_rows(response: Response, context: &str) -> Result<Vec<Value>> {
    let status = response.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(Vec::new());
    }
    if status.is_success() {
        return Ok(response.json::<Vec<Value>>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(status, &body, context))
}

/// Map a failed response onto the error enum, pulling the backend's own
/// message out of the JSON body when there is one.
pub(crate) fn error_for_status(status: StatusCode, body: &str, context: &str) -> ClientError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        StatusCode::CONFLICT => ClientError::Conflict(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ClientError::Auth(format!("{} rejected: {}", context, message))
        }
        _ => ClientError::Server(format!("{} failed ({}): {}", context, status, message)),
    }
}

/// Render a filter as PostgREST query parameters.
pub fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    match filter {
        Filter::All => Vec::new(),
        Filter::Eq(column, Value::Null) => vec![(column.clone(), "is.null".to_string())],
        Filter::Eq(column, value) => vec![(column.clone(), format!("eq.{}", plain_value(value)))],
        Filter::Neq(column, Value::Null) => vec![(column.clone(), "not.is.null".to_string())],
        Filter::Neq(column, value) => {
            vec![(column.clone(), format!("neq.{}", plain_value(value)))]
        }
        Filter::In(column, values) => vec![(column.clone(), format!("in.({})", render_list(values)))],
        Filter::Or(parts) => vec![("or".to_string(), format!("({})", render_conditions(parts)))],
        Filter::And(parts) => {
            let disjunctions = parts.iter().filter(|p| matches!(p, Filter::Or(_))).count();
            if disjunctions > 1 {
                // Repeated `or` keys would be ambiguous; nest everything instead.
                vec![("and".to_string(), format!("({})", render_conditions(parts)))]
            } else {
                parts.iter().flat_map(filter_params).collect()
            }
        }
    }
}

fn render_conditions(parts: &[Filter]) -> String {
    parts
        .iter()
        .filter(|p| !matches!(p, Filter::All))
        .map(render_condition)
        .collect::<Vec<_>>()
        .join(",")
}

fn render_condition(filter: &Filter) -> String {
    match filter {
        Filter::All => String::new(),
        Filter::Eq(column, Value::Null) => format!("{}.is.null", column),
        Filter::Eq(column, value) => format!("{}.eq.{}", column, render_value(value)),
        Filter::Neq(column, Value::Null) => format!("{}.not.is.null", column),
        Filter::Neq(column, value) => format!("{}.neq.{}", column, render_value(value)),
        Filter::In(column, values) => format!("{}.in.({})", column, render_list(values)),
        Filter::And(parts) => format!("and({})", render_conditions(parts)),
        Filter::Or(parts) => format!("or({})", render_conditions(parts)),
    }
}

fn render_list(values: &[Value]) -> String {
    values.iter().map(render_value).collect::<Vec<_>>().join(",")
}

/// Top-level operators take the value verbatim.
fn plain_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Values inside lists and logic trees are quoted when they contain
/// PostgREST's reserved characters.
fn render_value(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => return "null".to_string(),
        Value::Bool(_) | Value::Number(_) => return value.to_string(),
        other => other.to_string(),
    };

    let reserved = |c: char| matches!(c, ',' | '.' | ':' | '(' | ')' | '"') || c.is_whitespace();
    if text.contains(reserved) {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackendConfig {
        BackendConfig::new("https://demo.example.com/", "anon").unwrap()
    }

    #[test]
    fn test_endpoint_urls() {
        let config = config();
        assert_eq!(
            config.rest_url(Table::FriendRequests).unwrap().as_str(),
            "https://demo.example.com/rest/v1/friend_requests"
        );
        assert_eq!(
            config.auth_url("token?grant_type=password").unwrap().as_str(),
            "https://demo.example.com/auth/v1/token?grant_type=password"
        );
        assert_eq!(
            config.realtime_url().unwrap().as_str(),
            "wss://demo.example.com/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn test_base_path_is_kept() {
        let config = BackendConfig::new("http://localhost:8000/project", "anon").unwrap();
        assert_eq!(
            config.rest_url(Table::Users).unwrap().as_str(),
            "http://localhost:8000/project/rest/v1/users"
        );
    }

    #[test]
    fn test_empty_anon_key_is_rejected() {
        assert!(matches!(
            BackendConfig::new("http://localhost:54321", " "),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_simple_filters() {
        let filter = Filter::eq("receiver_id", "abc").and(Filter::eq("status", "pending"));
        assert_eq!(
            filter_params(&filter),
            vec![
                ("receiver_id".to_string(), "eq.abc".to_string()),
                ("status".to_string(), "eq.pending".to_string()),
            ]
        );

        let filter = Filter::in_list("id", ["a", "b"]);
        assert_eq!(filter_params(&filter), vec![("id".to_string(), "in.(a,b)".to_string())]);

        assert_eq!(
            filter_params(&Filter::Eq("replied_at".into(), Value::Null)),
            vec![("replied_at".to_string(), "is.null".to_string())]
        );
        assert!(filter_params(&Filter::All).is_empty());

        assert_eq!(
            filter_params(&Filter::eq("email", "a@x.com")),
            vec![("email".to_string(), "eq.a@x.com".to_string())]
        );
    }

    #[test]
    fn test_pair_filter_renders_as_or_of_ands() {
        let filter = Filter::pair("user_id", "friend_id", "a", "b");
        assert_eq!(
            filter_params(&filter),
            vec![(
                "or".to_string(),
                "(and(user_id.eq.a,friend_id.eq.b),and(user_id.eq.b,friend_id.eq.a))".to_string()
            )]
        );
    }

    #[test]
    fn test_two_disjunctions_nest_under_and() {
        let filter = Filter::eq("x", 1)
            .or(Filter::eq("y", 2))
            .and(Filter::eq("a", 1).or(Filter::eq("b", 2)));
        assert_eq!(
            filter_params(&filter),
            vec![("and".to_string(), "(or(x.eq.1,y.eq.2),or(a.eq.1,b.eq.2))".to_string())]
        );
    }

    #[test]
    fn test_reserved_characters_are_quoted() {
        assert_eq!(render_value(&Value::String("a@x.com".into())), "\"a@x.com\"");
        assert_eq!(render_value(&Value::String("plain".into())), "plain");
        assert_eq!(render_value(&Value::String("say \"hi\"".into())), "\"say \\\"hi\\\"\"");
        assert_eq!(render_value(&serde_json::json!(42)), "42");
    }

    #[test]
    fn test_status_mapping() {
        let err = error_for_status(
            StatusCode::CONFLICT,
            r#"{"code":"23505","message":"duplicate key value"}"#,
            "insert into friend_requests",
        );
        assert!(matches!(err, ClientError::Conflict(ref m) if m == "duplicate key value"));

        let err = error_for_status(StatusCode::UNAUTHORIZED, "{}", "select from users");
        assert!(matches!(err, ClientError::Auth(_)));

        let err = error_for_status(StatusCode::BAD_GATEWAY, "upstream down", "select from users");
        assert!(err.to_string().contains("upstream down"));
    }

    #[test]
    fn test_token_slot_shared_between_clones() {
        let slot = TokenSlot::default();
        let reader = slot.clone();
        slot.set(Some("jwt".to_string()));
        assert_eq!(reader.get().as_deref(), Some("jwt"));
        slot.set(None);
        assert!(reader.get().is_none());
    }
}
