//! JSON-over-HTTP escrow backend.
//!
//! Routes, relative to the configured base URL:
//!
//! | call | route |
//! |---|---|
//! | `create_hold` | `POST /holds` `{amount_sats, expires_at}` -> `{invoice_id}` |
//! | `settle` | `POST /holds/{id}/settle` `{payee_node_id}` |
//! | `cancel` | `POST /holds/{id}/cancel` |
//! | `status` | `GET /holds/{id}` -> `{status}` |
//! | `ping` | `GET /health` |
//!
//! Transport failures and 5xx map to `BackendUnavailable`, 404 to
//! `UnknownInvoice`, 409 to `AlreadyTerminal`.

use std::time::Duration;

use async_trait::async_trait;
use proxy_types::{InvoiceId, NodeId, Sats, Timestamp};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::backend::{EscrowBackend, HoldStatus};
use crate::error::EscrowError;

#[derive(Serialize)]
struct CreateHoldRequest {
    amount_sats: u64,
    expires_at: u64,
}

#[derive(Deserialize)]
struct CreateHoldResponse {
    invoice_id: String,
}

#[derive(Serialize)]
struct SettleRequest {
    payee_node_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: HoldStatus,
}

pub struct HttpEscrowBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpEscrowBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        invoice: Option<&InvoiceId>,
    ) -> Result<reqwest::Response, EscrowError> {
        let resp = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| EscrowError::BackendUnavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let unknown = || InvoiceId::new("<none>");
        Err(match status {
            StatusCode::NOT_FOUND => {
                EscrowError::UnknownInvoice(invoice.cloned().unwrap_or_else(unknown))
            }
            StatusCode::CONFLICT => {
                EscrowError::AlreadyTerminal(invoice.cloned().unwrap_or_else(unknown))
            }
            s if s.is_server_error() => EscrowError::BackendUnavailable(format!("HTTP {s}")),
            s => EscrowError::Rejected(format!("HTTP {s}")),
        })
    }
}

#[async_trait]
impl EscrowBackend for HttpEscrowBackend {
    async fn create_hold(
        &self,
        amount: Sats,
        expires_at: Timestamp,
    ) -> Result<InvoiceId, EscrowError> {
        let body = CreateHoldRequest {
            amount_sats: amount.get(),
            expires_at: expires_at.as_secs(),
        };
        let resp = self
            .send(self.client.post(self.url("/holds")).json(&body), None)
            .await?;
        let parsed: CreateHoldResponse = resp
            .json()
            .await
            .map_err(|e| EscrowError::BackendUnavailable(format!("bad create_hold body: {e}")))?;
        Ok(InvoiceId::new(parsed.invoice_id))
    }

    async fn settle(&self, invoice: &InvoiceId, payee: &NodeId) -> Result<(), EscrowError> {
        let body = SettleRequest {
            payee_node_id: payee.to_hex(),
        };
        let url = self.url(&format!("/holds/{invoice}/settle"));
        self.send(self.client.post(url).json(&body), Some(invoice))
            .await?;
        Ok(())
    }

    async fn cancel(&self, invoice: &InvoiceId) -> Result<(), EscrowError> {
        let url = self.url(&format!("/holds/{invoice}/cancel"));
        self.send(self.client.post(url), Some(invoice)).await?;
        Ok(())
    }

    async fn status(&self, invoice: &InvoiceId) -> Result<HoldStatus, EscrowError> {
        let url = self.url(&format!("/holds/{invoice}"));
        let resp = self.send(self.client.get(url), Some(invoice)).await?;
        let parsed: StatusResponse = resp
            .json()
            .await
            .map_err(|e| EscrowError::BackendUnavailable(format!("bad status body: {e}")))?;
        Ok(parsed.status)
    }

    async fn ping(&self) -> Result<(), EscrowError> {
        self.send(self.client.get(self.url("/health")), None).await?;
        Ok(())
    }
}
