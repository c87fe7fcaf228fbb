//! NOAA GFS client.
//!
//! Requests cycle analyses (`f000`) from the NOMADS GRIB filter, which cuts
//! the global file down to the configured levels, variables and bounding
//! box. Also hosts the `grib2json` converter used to turn the GRIB payload
//! into the JSON the query server hands out.

pub mod convert;

use std::time::Duration;

use async_trait::async_trait;
use common::config::UpstreamConfig;
use common::{Error, FetchOutcome, Interval, SnapshotSource};
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info};

pub use convert::Grib2JsonConverter;

/// NOMADS filter client with connection pooling and User-Agent header.
#[derive(Debug, Clone)]
pub struct GfsClient {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl GfsClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(2)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build GFS HTTP client: {e}")))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Query string selecting one cycle's analysis from the filter.
    pub fn query_params(&self, interval: &Interval) -> Vec<(String, String)> {
        let hour = interval.hour_label();
        let mut params = vec![(
            "file".to_string(),
            format!("gfs.t{}z.pgrb2.{}.f000", hour, self.config.resolution),
        )];

        for flag in self.config.levels.iter().chain(&self.config.variables) {
            params.push((flag.clone(), "on".to_string()));
        }

        let bbox = &self.config.bbox;
        params.push(("leftlon".into(), bbox.left_lon.to_string()));
        params.push(("rightlon".into(), bbox.right_lon.to_string()));
        params.push(("toplat".into(), bbox.top_lat.to_string()));
        params.push(("bottomlat".into(), bbox.bottom_lat.to_string()));
        params.push((
            "dir".into(),
            format!("/gfs.{}/{}/atmos", interval.date_label(), hour),
        ));

        params
    }
}

#[async_trait]
impl SnapshotSource for GfsClient {
    async fn fetch(&self, interval: &Interval) -> Result<FetchOutcome, Error> {
        let key = interval.key();
        debug!("Requesting GFS cycle {} from {}", key, self.config.base_url);

        let resp = self
            .client
            .get(&self.config.base_url)
            .query(&self.query_params(interval))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("GFS request for {key} failed: {e}")))?;

        let status = resp.status().as_u16();
        info!("response {} | {}", status, key);

        if status != 200 {
            return Ok(FetchOutcome::NotPublished { status });
        }

        let stream = resp
            .bytes_stream()
            .map_err(move |e| Error::Transport(format!("GFS download for {key} broke: {e}")))
            .boxed();

        Ok(FetchOutcome::Found(stream))
    }
}
