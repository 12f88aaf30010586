//! Application state for the gateway HTTP service.
//!
//! Wraps the core [`Gateway`] so axum handlers can share it through the
//! `State` extractor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use civicgate_lib::{
    BoundsGeocoder, ChannelTelemetry, Error as LibError, Gateway, GatewayConfig, HttpTransport,
    RoutingTable, TelemetryEvent, TelemetrySink, DEFAULT_DEADLINE,
};

/// Default location of the routing configuration.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/civicgate/routing.toml";
/// Default capacity of the telemetry queue.
pub const DEFAULT_TELEMETRY_QUEUE: usize = 1024;
/// Default delay before the first catalog refresh.
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::ZERO;

/// Error during application state initialization.
#[derive(Debug)]
pub enum AppStateError {
    /// Routing configuration file does not exist.
    ConfigNotFound(String),

    /// Routing configuration could not be parsed or failed validation.
    ConfigInvalid(LibError),
}

impl std::fmt::Display for AppStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigNotFound(path) => write!(f, "routing configuration not found: {}", path),
            Self::ConfigInvalid(e) => write!(f, "failed to load routing configuration: {}", e),
        }
    }
}

impl std::error::Error for AppStateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigInvalid(e) => Some(e),
            Self::ConfigNotFound(_) => None,
        }
    }
}

impl From<LibError> for AppStateError {
    fn from(err: LibError) -> Self {
        Self::ConfigInvalid(err)
    }
}

/// Service settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    pub config_path: PathBuf,
    /// Per-target dispatch deadline.
    pub dispatch_timeout: Duration,
    pub telemetry_queue: usize,
    /// Delay before the startup catalog refresh.
    pub refresh_delay: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            dispatch_timeout: DEFAULT_DEADLINE,
            telemetry_queue: DEFAULT_TELEMETRY_QUEUE,
            refresh_delay: DEFAULT_REFRESH_DELAY,
        }
    }
}

impl GatewaySettings {
    /// Read settings from the environment.
    ///
    /// - `GATEWAY_CONFIG`: routing configuration path
    /// - `DISPATCH_TIMEOUT_MS`: per-target deadline (default: 3000)
    /// - `TELEMETRY_QUEUE`: telemetry queue capacity (default: 1024)
    /// - `REFRESH_DELAY_MS`: startup refresh delay (default: 0)
    ///
    /// Unparseable numbers, a zero timeout, and a zero queue fall back to the
    /// default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            config_path: lookup("GATEWAY_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            dispatch_timeout: Some(millis("DISPATCH_TIMEOUT_MS", defaults.dispatch_timeout))
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.dispatch_timeout),
            telemetry_queue: lookup("TELEMETRY_QUEUE")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.telemetry_queue),
            refresh_delay: millis("REFRESH_DELAY_MS", defaults.refresh_delay),
        }
    }
}

/// Shared application state for all axum handlers.
///
/// Cheap to clone; the gateway lives behind an `Arc`.
///
/// # Example
///
/// ```ignore
/// use axum::{Router, routing::get, extract::State};
/// use civicgate_service_shared::{AppState, GatewaySettings};
///
/// async fn handler(State(state): State<AppState>) {
///     let generation = state.gateway().cache().generation();
/// }
///
/// let (state, events) = AppState::load(&GatewaySettings::from_env()).unwrap();
/// let app = Router::new()
///     .route("/api/v1/services", get(handler))
///     .with_state(state);
/// ```
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    gateway: Gateway,
    telemetry: Option<Arc<ChannelTelemetry>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("gateway", &self.inner.gateway)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Build the gateway from the routing configuration at
    /// `settings.config_path`.
    ///
    /// Returns the state and the receiving end of the telemetry queue; the
    /// caller owns draining it.
    pub fn load(
        settings: &GatewaySettings,
    ) -> Result<(Self, mpsc::Receiver<TelemetryEvent>), AppStateError> {
        let path: &Path = &settings.config_path;
        if !path.exists() {
            return Err(AppStateError::ConfigNotFound(path.display().to_string()));
        }

        tracing::info!(path = %path.display(), "loading routing configuration");
        let config = GatewayConfig::from_path(path)?;
        let routing = Arc::new(RoutingTable::from_config(&config)?);
        tracing::info!(
            areas = routing.areas().count(),
            adapters = routing.adapters().count(),
            providers = routing.providers().count(),
            "routing table loaded"
        );

        let (telemetry, events) = ChannelTelemetry::bounded(settings.telemetry_queue);
        let telemetry = Arc::new(telemetry);
        let geocoder = BoundsGeocoder::from_table(&routing);
        let gateway = Gateway::builder(routing)
            .transport(Arc::new(HttpTransport::default()))
            .telemetry(Arc::clone(&telemetry) as Arc<dyn TelemetrySink>)
            .geocoder(Arc::new(geocoder))
            .deadline(settings.dispatch_timeout)
            .build();

        let state = Self {
            inner: Arc::new(AppStateInner {
                gateway,
                telemetry: Some(telemetry),
            }),
        };
        Ok((state, events))
    }

    /// Wrap an already-built gateway. Its telemetry is not queued here.
    pub fn from_gateway(gateway: Gateway) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                gateway,
                telemetry: None,
            }),
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.inner.gateway
    }

    /// Telemetry events dropped because the queue was full.
    pub fn telemetry_dropped(&self) -> u64 {
        self.inner
            .telemetry
            .as_ref()
            .map(|t| t.dropped())
            .unwrap_or(0)
    }

    /// True once a non-empty catalog generation has been published.
    pub fn is_ready(&self) -> bool {
        !self.inner.gateway.cache().snapshot().is_empty()
    }
}
