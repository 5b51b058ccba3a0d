///! Callsign lookup service client
///!
///! POSTs `{"key": ..., "callsign": ...}` to a logbook-style lookup endpoint
///! and normalises the (loosely typed) JSON reply into an [`EnrichmentResult`].

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use dxcluster_common::EnrichmentResult;

use crate::config::EnrichmentConfig;
use crate::error::EnrichmentError;

/// Resolves one callsign to its metadata.
#[async_trait]
pub trait LookupClient: Send + Sync {
    async fn lookup(&self, callsign: &str) -> Result<EnrichmentResult, EnrichmentError>;
}

#[derive(Debug, Serialize)]
struct LookupRequest<'a> {
    key: &'a str,
    callsign: &'a str,
}

pub struct HttpLookupClient {
    client: Client,
    url: String,
    key: String,
    timeout: Duration,
}

impl HttpLookupClient {
    pub fn new(config: &EnrichmentConfig) -> Result<Self, EnrichmentError> {
        let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dxcluster-backend/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EnrichmentError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            key: config.key.clone(),
            timeout,
        })
    }

    fn map_error(&self, e: reqwest::Error) -> EnrichmentError {
        if e.is_timeout() {
            EnrichmentError::Timeout(self.timeout)
        } else {
            e.into()
        }
    }
}

#[async_trait]
impl LookupClient for HttpLookupClient {
    async fn lookup(&self, callsign: &str) -> Result<EnrichmentResult, EnrichmentError> {
        let response = self
            .client
            .post(&self.url)
            .json(&LookupRequest {
                key: &self.key,
                callsign,
            })
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            return Err(EnrichmentError::Status(response.status().as_u16()));
        }

        let body: Value = response.json().await.map_err(|e| self.map_error(e))?;
        result_from_json(&body)
    }
}

/// Build a result from the lookup reply. Missing or empty fields become `None`.
pub fn result_from_json(body: &Value) -> Result<EnrichmentResult, EnrichmentError> {
    let object = body
        .as_object()
        .ok_or_else(|| EnrichmentError::Decode(format!("expected a JSON object, got {}", body)))?;
    let field = |name: &str| object.get(name).filter(|v| !v.is_null());

    Ok(EnrichmentResult {
        entity: field("dxcc").and_then(as_text).map(|s| title_case(&s)),
        dxcc_id: field("dxcc_id").and_then(as_text),
        continent: field("cont").and_then(as_text),
        flag: field("dxcc_flag").and_then(as_text),
        cq_zone: field("dxcc_cqz")
            .and_then(as_number)
            .filter(|z| (1.0..=40.0).contains(z))
            .map(|z| z as u8),
        lotw_user: field("lotw_member").and_then(as_flag),
        latitude: field("dxcc_lat").and_then(as_number),
        longitude: field("dxcc_long")
            .or_else(|| field("dxcc_lon"))
            .and_then(as_number),
        resolved_at: Utc::now(),
    })
}

fn as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "y" | "yes" | "true" => Some(true),
            "0" | "n" | "no" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// "FEDERAL REPUBLIC OF GERMANY" → "Federal Republic Of Germany"
fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
