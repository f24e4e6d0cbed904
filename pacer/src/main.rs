use std::{net::SocketAddr, path::PathBuf, pin::Pin, time::Duration};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    signal,
    sync::mpsc,
    time,
};
use tokio_pacer::{Completion, Meter, MeteredReader, PacerConfig, RateHandle, ThrottledStream};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Config {
    /// File to read from; stdin when omitted
    #[arg(short = 'i', long)]
    input: Option<PathBuf>,

    /// File to write to; stdout when omitted
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Bytes allowed per `--per-ms` window; 0 disables throttling
    #[arg(short = 'r', long, value_name = "bytes", default_value_t = 0)]
    rate_bytes: u64,

    /// Length of the rate window in milliseconds
    #[arg(long, value_name = "ms", default_value_t = 1000)]
    per_ms: u64,

    /// Canonical tick the rate is smoothed onto, in microseconds
    #[arg(long, value_name = "µs", default_value_t = 100)]
    window_us: u64,

    /// Staging buffer size for bounded reads
    #[arg(long, value_name = "bytes", default_value_t = 8192)]
    buffer_bytes: usize,

    /// How much missed schedule a late reader may catch up on at once, in microseconds
    #[arg(long, value_name = "µs", default_value_t = 1000)]
    max_backlog_us: u64,

    /// Drive the stream from an external quota feed: bytes granted per feed tick
    #[arg(long, value_name = "bytes", requires = "feed_every_ms")]
    feed_quota: Option<u64>,

    /// Interval between feed ticks in milliseconds
    #[arg(long, value_name = "ms", requires = "feed_quota")]
    feed_every_ms: Option<u64>,

    /// Address for the control API, e.g. 127.0.0.1:8888
    #[arg(short = 'a', long)]
    api: Option<SocketAddr>,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.per_ms == 0 {
            anyhow::bail!("--per-ms must be greater than 0");
        }

        if self.feed_quota.is_some() != self.feed_every_ms.is_some() {
            anyhow::bail!("--feed-quota and --feed-every-ms must be given together");
        }

        if self.feed_every_ms == Some(0) {
            anyhow::bail!("--feed-every-ms must be greater than 0");
        }

        if self.feed_quota.is_some() && self.rate_bytes > 0 {
            anyhow::bail!("--rate-bytes and --feed-quota are mutually exclusive");
        }

        self.pacer_config().validate()?;
        Ok(())
    }

    fn pacer_config(&self) -> PacerConfig {
        PacerConfig::default()
            .with_window(Duration::from_micros(self.window_us))
            .with_buffer_size(self.buffer_bytes)
            .with_max_backlog(Duration::from_micros(self.max_backlog_us))
    }
}

#[derive(Debug, Clone, Serialize)]
struct ScheduleStatus {
    quota: u64,
    period_us: u128,
    bytes_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
struct PacerStatus {
    bytes: u64,
    average_bps: Option<f64>,
    finished: bool,
    throttled: bool,
    schedule: Option<ScheduleStatus>,
}

#[derive(Clone)]
struct ApiState {
    rate: RateHandle,
    meter: Meter,
    completion: Completion,
}

impl ApiState {
    fn status(&self) -> PacerStatus {
        PacerStatus {
            bytes: self.meter.total(),
            average_bps: self.meter.rate_bps(),
            finished: self.completion.is_finished(),
            throttled: self.rate.is_throttled(),
            schedule: self.rate.schedule().map(|s| ScheduleStatus {
                quota: s.quota(),
                period_us: s.period().as_micros(),
                bytes_per_sec: s.per_second(),
            }),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum ApiError {
    #[error("per_ms must be greater than 0")]
    BadWindow,
    #[error("stream already finished")]
    Finished,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::BadWindow => StatusCode::BAD_REQUEST,
            ApiError::Finished => StatusCode::CONFLICT,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateReq {
    pub count: u64,
    pub per_ms: u64,
}

async fn get_status(State(state): State<ApiState>) -> Json<PacerStatus> {
    Json(state.status())
}

async fn set_rate(
    State(state): State<ApiState>,
    Json(req): Json<RateReq>,
) -> Result<StatusCode, ApiError> {
    if req.per_ms == 0 {
        return Err(ApiError::BadWindow);
    }
    if state.completion.is_finished() {
        return Err(ApiError::Finished);
    }

    let schedule = state
        .rate
        .set_rate(req.count, Duration::from_millis(req.per_ms));
    info!(count = req.count, per_ms = req.per_ms, ?schedule, "rate updated");
    Ok(StatusCode::ACCEPTED)
}

async fn clear_rate(State(state): State<ApiState>) -> Result<StatusCode, ApiError> {
    if state.completion.is_finished() {
        return Err(ApiError::Finished);
    }

    state.rate.clear_rate();
    info!("rate limit cleared");
    Ok(StatusCode::ACCEPTED)
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(get_status))
        .route("/rate", patch(set_rate).delete(clear_rate))
        .with_state(state)
}

/// Send `quota` every `every` until the stream drops its end of the channel.
fn spawn_feed(quota: u64, every: Duration) -> mpsc::Receiver<u64> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut tick = time::interval(every);
        loop {
            tick.tick().await;
            if tx.send(quota).await.is_err() {
                debug!("quota feed receiver dropped");
                break;
            }
        }
    });
    rx
}

fn install_rate(config: &Config, rate: &RateHandle) {
    if let (Some(quota), Some(every_ms)) = (config.feed_quota, config.feed_every_ms) {
        info!(quota, every_ms, "using external quota feed");
        rate.set_rate_source(spawn_feed(quota, Duration::from_millis(every_ms)));
        return;
    }

    let per = Duration::from_millis(config.per_ms);
    if let Some(schedule) = rate.set_rate(config.rate_bytes, per) {
        info!(
            quota = schedule.quota(),
            period = ?schedule.period(),
            bytes_per_sec = schedule.per_second(),
            "throttling"
        );
    } else {
        info!("unthrottled");
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    let config = Config::parse();
    config.validate()?;

    let input: Pin<Box<dyn AsyncRead + Send>> = match &config.input {
        Some(path) => Box::pin(
            File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => Box::pin(tokio::io::stdin()),
    };
    let mut output: Pin<Box<dyn AsyncWrite + Send>> = match &config.output {
        Some(path) => Box::pin(
            File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::pin(tokio::io::stdout()),
    };

    let input = MeteredReader::new(input);
    let meter = input.meter();
    let mut reader = ThrottledStream::with_config(input, config.pacer_config())?;
    let rate = reader.handle();
    install_rate(&config, &rate);

    let mut completion = reader.completion();
    tokio::spawn(async move {
        if completion.wait().await.is_ok() {
            info!("input exhausted");
        }
    });

    if let Some(api_addr) = config.api {
        let state = ApiState {
            rate: rate.clone(),
            meter: meter.clone(),
            completion: reader.completion(),
        };
        let listener = TcpListener::bind(api_addr)
            .await
            .with_context(|| format!("failed to bind control API on {api_addr}"))?;
        info!(api = %api_addr, "control API listening");

        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router(state)).await {
                error!(error = %err, "control API failed");
            }
        });
    }

    tokio::select! {
        res = tokio::io::copy(&mut reader, &mut output) => {
            let copied = res.context("copy failed")?;
            output.flush().await?;
            info!(
                bytes = copied,
                elapsed = ?meter.elapsed().unwrap_or_default(),
                average_bps = meter.rate_bps().unwrap_or(0.0),
                "copy finished"
            );
        }
        _ = signal::ctrl_c() => {
            info!(bytes = meter.total(), "Received Ctrl-C, shutting down");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (ThrottledStream<tokio::io::Empty>, ApiState) {
        let reader = ThrottledStream::new(tokio::io::empty());
        let state = ApiState {
            rate: reader.handle(),
            meter: Meter::default(),
            completion: reader.completion(),
        };
        (reader, state)
    }

    #[test]
    fn config_defaults_validate() {
        let config = Config::try_parse_from(["pacer", "--rate-bytes", "1024"]).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.pacer_config(), PacerConfig::default());
    }

    #[test]
    fn config_rejects_zero_window_and_mixed_modes() {
        let config = Config::try_parse_from(["pacer", "--per-ms", "0"]).unwrap();
        assert!(config.validate().is_err());

        let config = Config::try_parse_from(["pacer", "--window-us", "0"]).unwrap();
        assert!(config.validate().is_err());

        let config = Config::try_parse_from([
            "pacer",
            "--rate-bytes",
            "10",
            "--feed-quota",
            "5",
            "--feed-every-ms",
            "10",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_requires_both_feed_flags() {
        assert!(Config::try_parse_from(["pacer", "--feed-quota", "5"]).is_err());
        assert!(Config::try_parse_from(["pacer", "--feed-every-ms", "5"]).is_err());
    }

    #[tokio::test]
    async fn set_rate_updates_status() {
        let (_reader, state) = state();

        let status = set_rate(
            State(state.clone()),
            Json(RateReq {
                count: 1000,
                per_ms: 1000,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let Json(status) = get_status(State(state.clone())).await;
        assert!(status.throttled);
        assert!(!status.finished);
        let schedule = status.schedule.unwrap();
        assert_eq!(schedule.quota, 1);
        assert_eq!(schedule.period_us, 1000);

        clear_rate(State(state.clone())).await.unwrap();
        let Json(status) = get_status(State(state)).await;
        assert!(!status.throttled);
        assert!(status.schedule.is_none());
    }

    #[tokio::test]
    async fn install_rate_picks_derived_feed_or_nothing() {
        let (_reader, state) = state();
        let config = Config::try_parse_from(["pacer", "--rate-bytes", "1000"]).unwrap();
        install_rate(&config, &state.rate);
        assert_eq!(state.rate.schedule().unwrap().period(), Duration::from_millis(1));

        let config =
            Config::try_parse_from(["pacer", "--feed-quota", "4", "--feed-every-ms", "10"])
                .unwrap();
        install_rate(&config, &state.rate);
        assert!(state.rate.is_throttled());
        assert!(state.rate.schedule().is_none());

        let config = Config::try_parse_from(["pacer"]).unwrap();
        install_rate(&config, &state.rate);
        assert!(!state.rate.is_throttled());
    }

    #[tokio::test]
    async fn set_rate_rejects_zero_window() {
        let (_reader, state) = state();
        let err = set_rate(
            State(state),
            Json(RateReq {
                count: 1,
                per_ms: 0,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadWindow));
    }

    #[tokio::test(start_paused = true)]
    async fn feed_sends_quota_every_interval() {
        let start = time::Instant::now();
        let mut rx = spawn_feed(7, Duration::from_millis(5));

        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, Some(7));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
