use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;

/// Which payment backend handles new purchases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveProvider {
    Stripe,
    Square,
    #[default]
    Simulation,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StripeSettings {
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_webhook_tolerance_seconds")]
    pub webhook_tolerance_seconds: i64,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

impl StripeSettings {
    pub fn is_configured(&self) -> bool {
        !self.secret_key.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SquareSettings {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub location_id: String,
    #[serde(default)]
    pub webhook_signature_key: String,
    /// Exact URL registered with the vendor; their webhook signature is
    /// computed over this URL plus the raw body.
    #[serde(default)]
    pub notification_url: String,
    #[serde(default)]
    pub sandbox: bool,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

impl SquareSettings {
    pub fn is_configured(&self) -> bool {
        !self.access_token.is_empty() && !self.location_id.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub active: ActiveProvider,
    #[serde(default)]
    pub stripe: StripeSettings,
    #[serde(default)]
    pub square: SquareSettings,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub server_port: u16,
    pub database_path: String,
    #[serde(default)]
    pub providers: ProviderSettings,
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8080,
            database_path: "data/gridraise.redb".to_string(),
            providers: ProviderSettings::default(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Config {
    /// Load from config.toml (if present) and environment variables.
    /// Environment variables override file values.
    /// Supported env keys: SERVER_PORT, DATABASE_PATH, ACTIVE_PROVIDER,
    /// STRIPE_SECRET_KEY, STRIPE_WEBHOOK_SECRET, STRIPE_WEBHOOK_TOLERANCE_SECONDS,
    /// STRIPE_TIMEOUT_MS, SQUARE_ACCESS_TOKEN, SQUARE_LOCATION_ID,
    /// SQUARE_WEBHOOK_SIGNATURE_KEY, SQUARE_NOTIFICATION_URL, SQUARE_SANDBOX,
    /// SQUARE_TIMEOUT_MS
    pub fn load() -> Self {
        let base: Config = Default::default();
        let mut fig = Figment::from(Serialized::defaults(base));
        if std::path::Path::new("config.toml").exists() {
            fig = fig.merge(Toml::file("config.toml"));
        }
        let mut cfg: Config = fig.extract().unwrap_or_default();

        if let Ok(v) = std::env::var("SERVER_PORT") {
            cfg.server_port = v.parse().unwrap_or(cfg.server_port);
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            cfg.database_path = v;
        }
        if let Ok(v) = std::env::var("ACTIVE_PROVIDER") {
            cfg.providers.active = match v.to_ascii_lowercase().as_str() {
                "stripe" => ActiveProvider::Stripe,
                "square" => ActiveProvider::Square,
                _ => ActiveProvider::Simulation,
            };
        }
        if let Ok(v) = std::env::var("STRIPE_SECRET_KEY") {
            cfg.providers.stripe.secret_key = v;
        }
        if let Ok(v) = std::env::var("STRIPE_WEBHOOK_SECRET") {
            cfg.providers.stripe.webhook_secret = v;
        }
        if let Ok(v) = std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECONDS") {
            cfg.providers.stripe.webhook_tolerance_seconds = v
                .parse()
                .unwrap_or(cfg.providers.stripe.webhook_tolerance_seconds);
        }
        if let Ok(v) = std::env::var("STRIPE_TIMEOUT_MS") {
            cfg.providers.stripe.timeout_ms = v.parse().unwrap_or(cfg.providers.stripe.timeout_ms);
        }
        if let Ok(v) = std::env::var("SQUARE_ACCESS_TOKEN") {
            cfg.providers.square.access_token = v;
        }
        if let Ok(v) = std::env::var("SQUARE_LOCATION_ID") {
            cfg.providers.square.location_id = v;
        }
        if let Ok(v) = std::env::var("SQUARE_WEBHOOK_SIGNATURE_KEY") {
            cfg.providers.square.webhook_signature_key = v;
        }
        if let Ok(v) = std::env::var("SQUARE_NOTIFICATION_URL") {
            cfg.providers.square.notification_url = v;
        }
        if let Ok(v) = std::env::var("SQUARE_SANDBOX") {
            cfg.providers.square.sandbox =
                matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES");
        }
        if let Ok(v) = std::env::var("SQUARE_TIMEOUT_MS") {
            cfg.providers.square.timeout_ms = v.parse().unwrap_or(cfg.providers.square.timeout_ms);
        }

        cfg
    }
}

/// Shared view of the provider configuration. The admin settings store is an
/// external collaborator; after any settings write it must call `replace`,
/// which is the invalidation hook. Everything else reads through `current`.
pub struct ProviderConfigStore {
    inner: RwLock<ProviderSettings>,
}

impl ProviderConfigStore {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn current(&self) -> ProviderSettings {
        self.inner
            .read()
            .expect("provider config lock poisoned")
            .clone()
    }

    /// Invalidation hook: swap in freshly written settings.
    pub fn replace(&self, settings: ProviderSettings) {
        let mut guard = self.inner.write().expect("provider config lock poisoned");
        *guard = settings;
        tracing::info!(active = ?guard.active, "provider configuration reloaded");
    }
}

fn default_webhook_tolerance_seconds() -> i64 {
    300 // 5 minutes
}

fn default_provider_timeout_ms() -> u64 {
    15_000
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}
