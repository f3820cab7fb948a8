//! HTTP client for the vehicle command proxy.
//!
//! Every command is a `POST {endpoint}/{vin}/{command}` carrying the proxy
//! password and, when configured, an access token.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{
    default_on_request_failure, default_on_request_success, policies::ExponentialBackoff,
    RetryTransientMiddleware, Retryable, RetryableStrategy,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::CommandsConfig;
use crate::domain::{Command, CommandError, CommandResult, VehicleCommandApi, VehicleData};

/// Retries what the proxy reports as transient. A 500 carries a command
/// error in its body and is never retried.
struct ProxyRetryStrategy;

impl RetryableStrategy for ProxyRetryStrategy {
    fn handle(
        &self,
        res: &Result<reqwest::Response, reqwest_middleware::Error>,
    ) -> Option<Retryable> {
        match res {
            Ok(resp) => match resp.status() {
                StatusCode::INTERNAL_SERVER_ERROR => None,
                StatusCode::METHOD_NOT_ALLOWED
                | StatusCode::REQUEST_TIMEOUT
                | StatusCode::PRECONDITION_FAILED => Some(Retryable::Transient),
                _ => default_on_request_success(resp),
            },
            Err(e) => default_on_request_failure(e),
        }
    }
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct VehicleDataResponse {
    charge_state: VehicleData,
}

#[derive(Clone)]
pub struct CommandProxyClient {
    endpoint: String,
    password: String,
    access_token: Option<String>,
    client: ClientWithMiddleware,
}

impl CommandProxyClient {
    pub fn new(cfg: &CommandsConfig) -> anyhow::Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        let policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(200), Duration::from_secs(5))
            .build_with_max_retries(cfg.retries);
        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                policy,
                ProxyRetryStrategy,
            ))
            .build();
        Ok(Self {
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            password: cfg.password.clone(),
            access_token: cfg.access_token.clone().filter(|t| !t.is_empty()),
            client,
        })
    }

    async fn send(
        &self,
        vin: &str,
        command: Command,
        limit: Option<i32>,
    ) -> CommandResult<reqwest::Response> {
        let url = format!("{}/{}/{}", self.endpoint, vin, command);
        debug!(vin, %command, "sending vehicle command");
        let resp = self
            .client
            .post(url)
            .json(&CommandRequest {
                password: &self.password,
                access_token: self.access_token.as_deref(),
                limit,
            })
            .send()
            .await
            .map_err(|e| CommandError::Transport(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => Ok(resp),
            StatusCode::INTERNAL_SERVER_ERROR => match resp.json::<ErrorResponse>().await {
                Ok(body) => Err(CommandError::from_api_message(&body.error)),
                Err(_) => Err(CommandError::Api(
                    "unexpected response code 500".to_string(),
                )),
            },
            status => Err(CommandError::Api(format!(
                "unexpected response code {}",
                status.as_u16()
            ))),
        }
    }
}

#[async_trait]
impl VehicleCommandApi for CommandProxyClient {
    async fn wakeup(&self, vin: &str) -> CommandResult {
        self.send(vin, Command::Wakeup, None).await.map(|_| ())
    }

    async fn charge_start(&self, vin: &str) -> CommandResult {
        self.send(vin, Command::ChargeStart, None).await.map(|_| ())
    }

    async fn charge_stop(&self, vin: &str) -> CommandResult {
        self.send(vin, Command::ChargeStop, None).await.map(|_| ())
    }

    async fn set_charge_limit(&self, vin: &str, percent: i32) -> CommandResult {
        self.send(vin, Command::SetChargeLimit, Some(percent))
            .await
            .map(|_| ())
    }

    async fn set_charge_amps(&self, vin: &str, amps: i32) -> CommandResult {
        self.send(vin, Command::SetChargeAmps, Some(amps))
            .await
            .map(|_| ())
    }

    async fn vehicle_data(&self, vin: &str) -> CommandResult<VehicleData> {
        let resp = self.send(vin, Command::VehicleData, None).await?;
        let body: VehicleDataResponse = resp
            .json()
            .await
            .map_err(|e| CommandError::Api(format!("malformed vehicle data: {e}")))?;
        Ok(body.charge_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, retries: u32) -> CommandProxyClient {
        CommandProxyClient::new(&CommandsConfig {
            endpoint: format!("{}/", server.uri()),
            password: "secret".into(),
            access_token: Some("tok".into()),
            retries,
            timeout_seconds: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_set_amps_posts_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/VIN1/set_charge_amps"))
            .and(body_json(serde_json::json!({
                "password": "secret",
                "access_token": "tok",
                "limit": 12
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, 0).set_charge_amps("VIN1", 12).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/VIN1/charge_start"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(serde_json::json!({ "error": "is_charging" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, 3).charge_start("VIN1").await.unwrap_err();
        assert_eq!(err, CommandError::AlreadyCharging);
    }

    #[tokio::test]
    async fn test_unexpected_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = client(&server, 0).wakeup("VIN1").await.unwrap_err();
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_precondition_failed_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/VIN1/wakeup"))
            .respond_with(ResponseTemplate::new(412))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/VIN1/wakeup"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        client(&server, 2).wakeup("VIN1").await.unwrap();
    }

    #[tokio::test]
    async fn test_vehicle_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/VIN1/vehicle_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "vin": "VIN1",
                "charge_state": {
                    "battery_level": 61,
                    "charge_amps": 8,
                    "charge_limit_soc": 80,
                    "charging_state": "Charging"
                }
            })))
            .mount(&server)
            .await;

        let data = client(&server, 0).vehicle_data("VIN1").await.unwrap();
        assert_eq!(data.soc, 61);
        assert_eq!(data.amps, 8);
        assert!(data.is_charging());
    }
}
