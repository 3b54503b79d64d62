//! IG REST trading connector
//!
//! Login via `POST /session` (CST + X-SECURITY-TOKEN headers), health check
//! via `GET /accounts`, orders via `POST /positions/otc` and confirmation via
//! `GET /confirms/{dealReference}`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::connector::{
    await_confirmation, log_transition, BrokerConnector, Confirmation, ConnectorProvider,
    DealStatus, ExecutionReport, ExecutionState, SymbolMap,
};
use crate::coordination::{retry_with_backoff, RetryPolicy};
use crate::credentials::BrokerCredentials;
use crate::domain::{BrokerConnection, BrokerType, Side, TradeCommand};
use crate::error::{ExecutionError, RelayError, Result};

pub const IG_LIVE_URL: &str = "https://api.ig.com/gateway/deal";
pub const IG_DEMO_URL: &str = "https://demo-api.ig.com/gateway/deal";

/// IG connector settings
#[derive(Debug, Clone)]
pub struct IgConfig {
    pub live_url: String,
    pub demo_url: String,
    pub request_timeout: Duration,
    pub confirm_interval: Duration,
    pub confirm_timeout: Duration,
    pub retry: RetryPolicy,
    /// Used when the connection metadata has no `currency`
    pub default_currency: String,
}

impl Default for IgConfig {
    fn default() -> Self {
        Self {
            live_url: IG_LIVE_URL.to_string(),
            demo_url: IG_DEMO_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            confirm_interval: Duration::from_millis(500),
            confirm_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            default_currency: "USD".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(default)]
    current_account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<Account>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    account_id: String,
    #[serde(default)]
    preferred: bool,
    balance: Option<AccountBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountBalance {
    balance: Decimal,
    #[serde(default)]
    profit_loss: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenPositionRequest {
    epic: String,
    expiry: &'static str,
    direction: &'static str,
    #[serde(with = "rust_decimal::serde::float")]
    size: Decimal,
    order_type: &'static str,
    #[serde(with = "rust_decimal::serde::float_option", skip_serializing_if = "Option::is_none")]
    level: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option", skip_serializing_if = "Option::is_none")]
    stop_level: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option", skip_serializing_if = "Option::is_none")]
    limit_level: Option<Decimal>,
    guaranteed_stop: bool,
    force_open: bool,
    currency_code: String,
    time_in_force: &'static str,
    /// Client-chosen, so an unanswered submission can be confirmed instead of resent
    deal_reference: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DealReferenceResponse {
    deal_reference: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmResponse {
    deal_status: String,
    #[serde(default)]
    deal_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    level: Option<Decimal>,
}

#[derive(Debug, Clone)]
struct SessionTokens {
    cst: String,
    security_token: String,
    account_id: Option<String>,
}

/// Builds [`IgConnector`]s
#[derive(Debug, Clone, Default)]
pub struct IgProvider {
    config: IgConfig,
}

impl IgProvider {
    pub fn new(config: IgConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectorProvider for IgProvider {
    fn broker_type(&self) -> BrokerType {
        BrokerType::Ig
    }

    async fn create(
        &self,
        connection: &BrokerConnection,
        credentials: Option<BrokerCredentials>,
    ) -> Result<Arc<dyn BrokerConnector>> {
        let credentials = credentials.ok_or_else(|| {
            RelayError::Credentials(format!("IG connection {} has no credentials", connection.id))
        })?;
        let connector = IgConnector::login(connection, credentials, self.config.clone()).await?;
        Ok(Arc::new(connector))
    }
}

pub struct IgConnector {
    http: Client,
    base_url: String,
    tenant_id: String,
    connection_id: Uuid,
    credentials: BrokerCredentials,
    tokens: RwLock<SessionTokens>,
    symbols: SymbolMap,
    currency: String,
    config: IgConfig,
}

impl std::fmt::Debug for IgConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IgConnector")
            .field("base_url", &self.base_url)
            .field("tenant_id", &self.tenant_id)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl IgConnector {
    /// Open a trading session for the connection
    pub async fn login(
        connection: &BrokerConnection,
        credentials: BrokerCredentials,
        config: IgConfig,
    ) -> Result<Self> {
        let base_url = connection
            .metadata
            .get("base_url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                if credentials.demo {
                    config.demo_url.clone()
                } else {
                    config.live_url.clone()
                }
            })
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("signal-relay/0.1")
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RelayError::Internal(format!("failed to build IG HTTP client: {}", e)))?;

        let currency = connection
            .metadata
            .get("currency")
            .and_then(|v| v.as_str())
            .unwrap_or(&config.default_currency)
            .to_string();

        let tokens = Self::open_session(&http, &base_url, &credentials).await?;
        info!(
            tenant = %connection.tenant_id,
            broker_connection = %connection.id,
            account = tokens.account_id.as_deref().unwrap_or("-"),
            "IG session opened"
        );

        Ok(Self {
            http,
            base_url,
            tenant_id: connection.tenant_id.clone(),
            connection_id: connection.id,
            credentials,
            tokens: RwLock::new(tokens),
            symbols: SymbolMap::ig_defaults().with_overrides(connection.symbol_overrides()),
            currency,
            config,
        })
    }

    async fn open_session(
        http: &Client,
        base_url: &str,
        credentials: &BrokerCredentials,
    ) -> Result<SessionTokens> {
        let response = http
            .post(format!("{}/session", base_url))
            .header("X-IG-API-KEY", credentials.api_key.as_str())
            .header("Version", "2")
            .header(ACCEPT, "application/json; charset=UTF-8")
            .header(CONTENT_TYPE, "application/json; charset=UTF-8")
            .json(&LoginRequest {
                identifier: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Auth(format!("IG login failed ({}): {}", status, body)));
        }

        let header = |name: &str| -> Result<String> {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| RelayError::Auth(format!("IG login response missing {} header", name)))
        };
        let cst = header("CST")?;
        let security_token = header("X-SECURITY-TOKEN")?;
        let body: LoginResponse = response.json().await?;

        Ok(SessionTokens {
            cst,
            security_token,
            account_id: credentials.account_id.clone().or(body.current_account_id),
        })
    }

    async fn auth_headers(&self, version: &'static str) -> Result<HeaderMap> {
        let tokens = self.tokens.read().await;
        let value = |raw: &str| {
            HeaderValue::from_str(raw)
                .map_err(|e| RelayError::Credentials(format!("invalid IG header value: {}", e)))
        };

        let mut headers = HeaderMap::new();
        headers.insert("X-IG-API-KEY", value(&self.credentials.api_key)?);
        headers.insert("CST", value(&tokens.cst)?);
        headers.insert("X-SECURITY-TOKEN", value(&tokens.security_token)?);
        headers.insert("Version", HeaderValue::from_static(version));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json; charset=UTF-8"));
        Ok(headers)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        version: &'static str,
    ) -> Result<RequestBuilder> {
        Ok(self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .headers(self.auth_headers(version).await?))
    }

    /// Map non-2xx responses to errors; 5xx is transient
    async fn check(response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                RelayError::Auth(format!("IG {} unauthorized ({}): {}", what, status, body))
            }
            s if s.is_server_error() => {
                RelayError::Timeout(format!("IG {} unavailable ({}): {}", what, status, body))
            }
            _ => RelayError::Validation(format!("IG {} failed ({}): {}", what, status, body)),
        })
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        retry_with_backoff(&self.config.retry, "ig.accounts", || async {
            let response = self.request(Method::GET, "/accounts", "1").await?.send().await?;
            let body: AccountsResponse = Self::check(response, "accounts").await?.json().await?;
            Ok(body.accounts)
        })
        .await
    }

    /// `SR` + connection prefix + correlation prefix; IG allows 30 chars of [A-Za-z0-9_-]
    fn deal_reference_for(&self, command: &TradeCommand) -> String {
        let connection = self.connection_id.simple().to_string();
        let correlation: String = command
            .correlation_id
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(20)
            .collect();
        format!("SR{}{}", &connection[..8], correlation)
    }

    fn build_request(&self, command: &TradeCommand) -> Result<OpenPositionRequest> {
        let epic = self.symbols.resolve(&command.symbol)?.to_string();
        let limit = command.price.is_some();
        Ok(OpenPositionRequest {
            epic,
            expiry: "-",
            direction: match command.side {
                Side::Buy => "BUY",
                Side::Sell => "SELL",
            },
            size: command.units,
            order_type: if limit { "LIMIT" } else { "MARKET" },
            level: command.worst_fill_price(),
            stop_level: command.stop_loss,
            limit_level: command.take_profit,
            guaranteed_stop: false,
            force_open: true,
            currency_code: self.currency.clone(),
            time_in_force: if limit { "FILL_OR_KILL" } else { "EXECUTE_AND_ELIMINATE" },
            deal_reference: self.deal_reference_for(command),
        })
    }

    /// Replace expired CST/X-SECURITY-TOKEN values
    async fn refresh_session(&self) -> Result<()> {
        let fresh = Self::open_session(&self.http, &self.base_url, &self.credentials).await?;
        *self.tokens.write().await = fresh;
        info!(broker_connection = %self.connection_id, "IG session refreshed");
        Ok(())
    }

    /// Post the order exactly once.
    ///
    /// A 401 means IG refused the request unread, so the session is renewed
    /// and the order posted once more. Any other unanswered or 5xx outcome is
    /// ambiguous: the order may be live, so the caller confirms the client
    /// deal reference rather than resubmitting.
    async fn submit(&self, request: &OpenPositionRequest) -> Result<String> {
        let outcome = match self.post_position(request).await {
            Err(RelayError::Auth(reason)) => {
                warn!(
                    broker_connection = %self.connection_id,
                    %reason,
                    "IG session rejected, logging in again"
                );
                self.refresh_session().await?;
                self.post_position(request).await
            }
            other => other,
        };

        match outcome {
            Ok(reference) => Ok(reference),
            Err(RelayError::Http(e)) if e.is_connect() => Err(ExecutionError::Submission(format!(
                "IG unreachable, order not sent: {}",
                e
            ))
            .into()),
            Err(e) if e.is_transient() => {
                warn!(
                    broker_connection = %self.connection_id,
                    deal_reference = %request.deal_reference,
                    error = %e,
                    "IG submission unanswered, confirming by deal reference"
                );
                Ok(request.deal_reference.clone())
            }
            Err(e @ RelayError::Auth(_)) => Err(e),
            Err(e) => Err(ExecutionError::Submission(e.to_string()).into()),
        }
    }

    async fn post_position(&self, request: &OpenPositionRequest) -> Result<String> {
        let response = self
            .request(Method::POST, "/positions/otc", "2")
            .await?
            .header(CONTENT_TYPE, "application/json; charset=UTF-8")
            .json(request)
            .send()
            .await?;
        let response = Self::check(response, "order submission").await?;
        match response.json::<DealReferenceResponse>().await {
            Ok(body) => Ok(body.deal_reference),
            Err(e) => {
                warn!(error = %e, "IG accepted the order with an unreadable body");
                Ok(request.deal_reference.clone())
            }
        }
    }

    async fn fetch_confirmation(&self, deal_reference: &str) -> Result<Option<Confirmation>> {
        let path = format!("/confirms/{}", deal_reference);
        let response = self.request(Method::GET, &path, "1").await?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: ConfirmResponse = Self::check(response, "confirmation").await?.json().await?;

        let status = match body.deal_status.to_ascii_uppercase().as_str() {
            "ACCEPTED" => DealStatus::Accepted,
            "REJECTED" => DealStatus::Rejected,
            other => {
                debug!(deal_reference, status = other, "confirmation not final");
                return Ok(None);
            }
        };
        Ok(Some(Confirmation {
            status,
            deal_id: body.deal_id,
            reason: body.reason,
            level: body.level,
        }))
    }
}

#[async_trait]
impl BrokerConnector for IgConnector {
    fn broker_type(&self) -> BrokerType {
        BrokerType::Ig
    }

    fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    async fn validate_connection(&self) -> Result<()> {
        let accounts = self.accounts().await?;
        if accounts.is_empty() {
            return Err(RelayError::Validation("IG login has no accounts".into()));
        }
        let tokens = self.tokens.read().await;
        if let Some(wanted) = &tokens.account_id {
            if !accounts.iter().any(|a| &a.account_id == wanted) {
                return Err(RelayError::Validation(format!(
                    "IG account {} not available to this login",
                    wanted
                )));
            }
        }
        Ok(())
    }

    #[instrument(
        skip(self, command),
        fields(
            broker_connection = %self.connection_id,
            correlation_id = %command.correlation_id
        )
    )]
    async fn execute(&self, command: &TradeCommand) -> Result<ExecutionReport> {
        let correlation_id = command.correlation_id.as_str();
        let mut state = ExecutionState::BuildingRequest;

        let request = self.build_request(command)?;
        let deal_reference = self.submit(&request).await?;
        state =
            log_transition(self.connection_id, correlation_id, state, ExecutionState::Submitted);
        info!(
            epic = %request.epic,
            %deal_reference,
            order_type = request.order_type,
            "IG order submitted"
        );

        state = log_transition(
            self.connection_id,
            correlation_id,
            state,
            ExecutionState::PollingConfirmation,
        );
        let outcome = await_confirmation(
            &deal_reference,
            self.config.confirm_interval,
            self.config.confirm_timeout,
            |_| self.fetch_confirmation(&deal_reference),
        )
        .await;

        match outcome {
            Ok(confirmation) => {
                let state = log_transition(
                    self.connection_id,
                    correlation_id,
                    state,
                    ExecutionState::Accepted,
                );
                Ok(ExecutionReport {
                    broker_connection_id: self.connection_id,
                    correlation_id: command.correlation_id.clone(),
                    instrument: request.epic,
                    deal_reference,
                    deal_id: confirmation.deal_id,
                    fill_price: confirmation.level,
                    state,
                })
            }
            Err(e) => {
                let terminal = if e.is_confirmation_timeout() {
                    ExecutionState::TimedOut
                } else {
                    ExecutionState::Rejected
                };
                log_transition(self.connection_id, correlation_id, state, terminal);
                warn!(%deal_reference, error = %e, "IG order not accepted");
                Err(e)
            }
        }
    }

    async fn account_equity(&self) -> Result<Decimal> {
        let accounts = self.accounts().await?;
        let wanted = self.tokens.read().await.account_id.clone();
        let account = accounts
            .iter()
            .find(|a| Some(&a.account_id) == wanted.as_ref())
            .or_else(|| accounts.iter().find(|a| a.preferred))
            .or_else(|| accounts.first())
            .ok_or_else(|| RelayError::Validation("IG login has no accounts".into()))?;
        let balance = account.balance.as_ref().ok_or_else(|| {
            RelayError::Validation(format!("IG account {} has no balance", account.account_id))
        })?;
        Ok(balance.balance + balance.profit_loss)
    }
}
