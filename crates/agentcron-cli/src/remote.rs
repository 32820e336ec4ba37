use anyhow::{Context, Result, bail};
use reqwest::{Method, RequestBuilder};
use serde_json::Value;

/// Thin client for a running gateway.
pub struct RemoteClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        send(self.request(Method::GET, path)).await
    }

    pub async fn post(&self, path: &str) -> Result<Value> {
        send(self.request(Method::POST, path)).await
    }
}

async fn send(builder: RequestBuilder) -> Result<Value> {
    let response = builder
        .send()
        .await
        .context("Failed to reach the gateway")?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        bail!("{}", describe_error(status.as_u16(), &body));
    }
    Ok(body)
}

fn describe_error(status: u16, body: &Value) -> String {
    match (body["code"].as_str(), body["message"].as_str()) {
        (Some(code), Some(message)) => format!("{status} {code}: {message}"),
        _ => format!("gateway returned HTTP {status}"),
    }
}
