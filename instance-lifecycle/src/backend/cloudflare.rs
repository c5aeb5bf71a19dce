//! DNS updates through the Cloudflare HTTP API

use crate::backend::DnsUpdater;
use crate::config::DnsConfig;
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::info;

/// Environment variable consulted when the config carries no token
pub const API_TOKEN_ENV: &str = "CLOUDFLARE_API_TOKEN";

/// Keeps one `A` record pointed at the instance
pub struct CloudflareDns {
    client: Client,
    config: DnsConfig,
    token: String,
}

#[derive(Debug, Serialize)]
struct RecordBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    proxied: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl CloudflareDns {
    pub fn new(config: DnsConfig) -> Result<Self> {
        let token = config
            .api_token
            .clone()
            .or_else(|| env::var(API_TOKEN_ENV).ok())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "dns.api_token is not set and {} is empty",
                    API_TOKEN_ENV
                ))
            })?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            config,
            token,
        })
    }

    fn record_url(&self) -> String {
        format!(
            "{}/zones/{}/dns_records/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.zone_id,
            self.config.record_id
        )
    }
}

fn describe_errors(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "no error details".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DnsUpdater for CloudflareDns {
    fn update(&self, ip: &str) -> Result<()> {
        let body = RecordBody {
            kind: "A",
            name: &self.config.record_name,
            content: ip,
            ttl: self.config.ttl,
            proxied: false,
        };

        let response = self
            .client
            .put(self.record_url())
            .bearer_auth(&self.token)
            .json(&body)
            .send()?;
        let status = response.status();
        let parsed: ApiResponse = response.json()?;

        if !parsed.success {
            return Err(Error::Upstream(format!(
                "DNS update for {} failed with {}: {}",
                self.config.record_name,
                status,
                describe_errors(&parsed.errors)
            )));
        }

        info!(record = %self.config.record_name, ip, "DNS record updated");
        Ok(())
    }
}
