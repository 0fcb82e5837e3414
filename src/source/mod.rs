//! Upstream producer of per-epoch metric rows.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::beacon::BeaconClient;
use crate::config::SourceConfig;
use crate::error::PipelineError;
use crate::schema::{MetricRow, NamedRow};

/// Where the insert pipeline gets its rows.
pub trait EpochSource: Send + Sync {
    /// Every row of the epochs in `[low, high]`.
    fn fetch_epoch_range(
        &self,
        low: u64,
        high: u64,
    ) -> impl Future<Output = Result<Vec<MetricRow>>> + Send;

    /// Highest epoch that will not change anymore.
    fn safe_epoch(&self) -> impl Future<Output = Result<u64>> + Send;
}

/// Rows from an HTTP JSON endpoint, finality from a beacon node.
pub struct RemoteSource<B> {
    http: reqwest::Client,
    endpoint: String,
    beacon: B,
}

#[derive(Deserialize)]
struct EpochsResponse {
    data: Vec<NamedRow>,
}

impl<B: BeaconClient> RemoteSource<B> {
    pub fn new(cfg: &SourceConfig, beacon: B) -> Result<Self> {
        if cfg.endpoint.is_empty() {
            bail!("source endpoint is required");
        }

        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(60)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            beacon,
        })
    }
}

impl<B: BeaconClient> EpochSource for RemoteSource<B> {
    async fn fetch_epoch_range(&self, low: u64, high: u64) -> Result<Vec<MetricRow>> {
        let url = format!("{}/v1/epochs", self.endpoint);
        let response = self
            .http
            .get(&url)
            .query(&[("from", low), ("to", high)])
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting epochs {low}..={high}"))?;

        let status = response.status();
        if is_not_ready_status(status) {
            return Err(PipelineError::SourceNotReady {
                what: format!("epochs {low}..={high}"),
                reason: format!("source answered {status}"),
            }
            .into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} fetching epochs {low}..={high}: {body}");
        }

        let body: EpochsResponse = response
            .json()
            .await
            .with_context(|| format!("decoding epochs {low}..={high}"))?;

        let rows = decode_rows(body.data, low, high)?;
        debug!(low, high, rows = rows.len(), "fetched epoch rows");
        Ok(rows)
    }

    async fn safe_epoch(&self) -> Result<u64> {
        let checkpoints = self.beacon.fetch_finality().await?;
        safe_from_finalized(checkpoints.finalized)
    }
}

fn is_not_ready_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::NOT_FOUND | StatusCode::TOO_EARLY | StatusCode::SERVICE_UNAVAILABLE
    )
}

/// Converts wire rows, rejecting rows outside the requested range.
fn decode_rows(raw: Vec<NamedRow>, low: u64, high: u64) -> Result<Vec<MetricRow>> {
    raw.into_iter()
        .map(|named| {
            if named.epoch < low || named.epoch > high {
                bail!(
                    "source returned epoch {} outside requested {low}..={high}",
                    named.epoch
                );
            }
            MetricRow::try_from(named)
        })
        .collect()
}

/// The finalized checkpoint epoch is the first epoch that is not fully
/// finalized yet.
fn safe_from_finalized(finalized: u64) -> Result<u64> {
    match finalized.checked_sub(1) {
        Some(safe) => Ok(safe),
        None => Err(PipelineError::SourceNotReady {
            what: "finalized epoch".to_string(),
            reason: "chain has not finalized yet".to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    #[test]
    fn test_decode_rows() {
        let body: EpochsResponse = serde_json::from_value(serde_json::json!({
            "data": [
                {"epoch": 10, "entity": 1, "fields": {"attestation_reward": 12, "slashed": 0}},
                {"epoch": 11, "entity": 1, "fields": {"balance_end": 32000000000i64}}
            ]
        }))
        .expect("decode");

        let rows = decode_rows(body.data, 10, 11).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values[Field::AttestationReward], 12);
        assert_eq!(rows[1].values[Field::BalanceEnd], 32_000_000_000);
    }

    #[test]
    fn test_decode_rows_rejects_foreign_epochs_and_columns() {
        let outside = vec![NamedRow {
            epoch: 12,
            entity: 1,
            fields: Default::default(),
        }];
        assert!(decode_rows(outside, 10, 11)
            .expect_err("outside")
            .to_string()
            .contains("outside requested"));

        let unknown = vec![NamedRow {
            epoch: 10,
            entity: 1,
            fields: [("bogus".to_string(), 1)].into_iter().collect(),
        }];
        assert!(decode_rows(unknown, 10, 11)
            .expect_err("unknown")
            .to_string()
            .contains("unknown metric column"));
    }

    #[test]
    fn test_safe_from_finalized() {
        assert_eq!(safe_from_finalized(310).expect("safe"), 309);
        let err = safe_from_finalized(0).expect_err("not finalized");
        assert_eq!(crate::error::classify(&err), "not_ready");
    }

    #[test]
    fn test_not_ready_statuses() {
        assert!(is_not_ready_status(StatusCode::TOO_EARLY));
        assert!(is_not_ready_status(StatusCode::NOT_FOUND));
        assert!(!is_not_ready_status(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
