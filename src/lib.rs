pub use crate::api::{ApiClient, ApiError, AuthSession};
pub use crate::conversation::{
    ConversationController, ConversationOptions, Delivery, MessageEntry, ScreenState,
};
pub use crate::error::{FlechazoError, Result};
pub use crate::realtime::{
    ConnectionState, RealtimeError, RealtimeEvent, RealtimeManager, RealtimeOptions,
};
pub use crate::token_store::TokenStore;
pub use crate::types::{
    ConversationDetail, ConversationSummary, Message, SendMessageRequest, StoredUser, UserSummary,
};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

mod api;
mod conversation;
mod error;
mod realtime;
mod token_store;
mod types;

static TRACING_GUARDS: OnceLock<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("flechazo")
            .filename_suffix("log")
            .build(logs_dir)
            .expect("Failed to create file appender");

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .init();
    });
}

#[derive(Clone, Debug)]
pub struct FlechazoConfig {
    /// Base url of the backend REST api.
    pub api_url: String,

    /// Url of the realtime websocket endpoint.
    pub realtime_url: String,

    /// Directory for the persisted session. `None` keeps it in memory only.
    pub data_dir: Option<PathBuf>,

    /// Directory for application logs. `None` skips file logging setup.
    pub logs_dir: Option<PathBuf>,
}

impl FlechazoConfig {
    /// Build a config from the environment, falling back to a local backend.
    ///
    /// Reads `FLECHAZO_API_URL`, `FLECHAZO_WS_URL`, `FLECHAZO_DATA_DIR` and
    /// `FLECHAZO_LOGS_DIR`, honoring a `.env` file when present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            api_url: std::env::var("FLECHAZO_API_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            realtime_url: std::env::var("FLECHAZO_WS_URL")
                .unwrap_or_else(|_| "ws://localhost:3000/ws/chat".to_string()),
            data_dir: std::env::var("FLECHAZO_DATA_DIR").ok().map(PathBuf::from),
            logs_dir: std::env::var("FLECHAZO_LOGS_DIR").ok().map(PathBuf::from),
        }
    }
}

/// Entry point of the client.
///
/// Holds the persisted session and the REST client, and opens per-match
/// [`ConversationController`]s that each own their realtime session.
#[derive(Debug)]
pub struct Flechazo {
    pub config: FlechazoConfig,
    api: ApiClient,
}

impl Flechazo {
    /// Initialize the client: logging, session storage and the REST client.
    pub fn new(config: FlechazoConfig) -> Result<Self> {
        if let Some(logs_dir) = &config.logs_dir {
            std::fs::create_dir_all(logs_dir)?;
            init_tracing(logs_dir);
        }
        if let Some(data_dir) = &config.data_dir {
            std::fs::create_dir_all(data_dir)?;
        }

        let token_store = Arc::new(TokenStore::new(config.data_dir.as_deref()));
        let api = ApiClient::new(&config.api_url, token_store)
            .map_err(|e| FlechazoError::Configuration(e.to_string()))?;

        tracing::debug!(
            target: "flechazo_client::lib",
            "Client initialized against {}",
            config.api_url
        );
        Ok(Self { config, api })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(FlechazoConfig::from_env())
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Whether a session (an access token) is present locally. The token may
    /// still be stale; the REST layer refreshes it transparently on use.
    pub fn is_authenticated(&self) -> bool {
        self.api.token_store().access_token().is_some()
    }

    /// The persisted user of the current session, if any.
    pub fn current_user_cached(&self) -> Option<StoredUser> {
        self.api.token_store().user()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        Ok(self.api.login(email, password).await?)
    }

    pub async fn logout(&self) -> Result<()> {
        Ok(self.api.logout().await?)
    }

    /// Fetch the authenticated user from the backend.
    pub async fn current_user(&self) -> Result<StoredUser> {
        if !self.is_authenticated() {
            return Err(FlechazoError::NoSession);
        }
        Ok(self.api.current_user().await?)
    }

    /// List the user's conversations, most recently active first.
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        if !self.is_authenticated() {
            return Err(FlechazoError::NoSession);
        }
        Ok(self.api.conversations().await?)
    }

    /// Open the chat screen for one match. The returned controller owns its
    /// realtime session; call [`ConversationController::close`] on teardown.
    pub async fn open_conversation(
        &self,
        match_id: &str,
    ) -> Result<Arc<ConversationController>> {
        if !self.is_authenticated() {
            return Err(FlechazoError::NoSession);
        }
        ConversationController::open(
            self.api.clone(),
            &self.config.realtime_url,
            match_id,
            ConversationOptions::default(),
        )
        .await
    }
}
