use anyhow::{bail, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub fn auth(builder: RequestBuilder, token: Option<&String>) -> RequestBuilder {
    match token {
        Some(t) => builder.bearer_auth(t),
        None => builder,
    }
}

/// Thin wrapper over the scheduler's `/api` surface.
pub struct ForgeClient {
    http: Client,
    base: String,
    token: Option<String>,
}

impl ForgeClient {
    pub fn new(base: &str, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base, path)
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        auth(self.http.get(self.url(path)), self.token.as_ref())
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        auth(self.http.post(self.url(path)), self.token.as_ref())
    }

    pub fn delete(&self, path: &str) -> RequestBuilder {
        auth(self.http.delete(self.url(path)), self.token.as_ref())
    }
}

/// Send and decode a JSON body, turning API errors into a readable message.
pub async fn fetch<T: DeserializeOwned>(req: RequestBuilder, what: &str) -> Result<T> {
    let resp = send(req, what).await?;
    Ok(resp.json().await?)
}

pub async fn send(req: RequestBuilder, what: &str) -> Result<Response> {
    let resp = req.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    bail!("✗ Failed to {what} ({status}): {}", error_message(&text));
}

/// Pull `error.message` out of an API error body, falling back to the raw text.
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_api_urls() {
        let c = ForgeClient::new("http://localhost:8000/", None);
        assert_eq!(c.url("/runs"), "http://localhost:8000/api/runs");
    }

    #[test]
    fn extracts_api_error_message() {
        let body = r#"{"error":{"code":"run_not_found","message":"run 'x' not found","request_id":"req_1"}}"#;
        assert_eq!(error_message(body), "run 'x' not found");
        assert_eq!(error_message("bad gateway"), "bad gateway");
    }
}
