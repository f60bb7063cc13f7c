use anyhow::Context;
use url::Url;

#[derive(Clone, Debug)]
pub struct Config {
    /// GraphQL HTTP endpoint for request-response exchanges.
    pub endpoint: String,
    /// Streaming endpoint for subscriptions. Derived from `endpoint` by
    /// scheme swap when not given explicitly.
    pub subscription_endpoint: String,
    /// Credential refresh endpoint.
    pub refresh_endpoint: String,
    /// Capacity of the streaming-channel writer queue.
    pub ws_send_buffer: usize,
}

impl Config {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let endpoint = endpoint.into();
        let subscription_endpoint = derive_subscription_endpoint(&endpoint)?;
        let refresh_endpoint = derive_refresh_endpoint(&endpoint)?;
        Ok(Self {
            endpoint,
            subscription_endpoint,
            refresh_endpoint,
            ws_send_buffer: 64,
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint =
            std::env::var("QUASAR_GRAPHQL_URL").context("QUASAR_GRAPHQL_URL must be set")?;
        let subscription_endpoint = match std::env::var("QUASAR_SUBSCRIPTIONS_URL") {
            Ok(explicit) => explicit,
            Err(_) => derive_subscription_endpoint(&endpoint)?,
        };
        let refresh_endpoint = match std::env::var("QUASAR_REFRESH_URL") {
            Ok(explicit) => explicit,
            Err(_) => derive_refresh_endpoint(&endpoint)?,
        };
        let ws_send_buffer = std::env::var("QUASAR_WS_SEND_BUFFER")
            .unwrap_or_else(|_| "64".into())
            .parse()
            .context("QUASAR_WS_SEND_BUFFER must be a number")?;

        Ok(Self {
            endpoint,
            subscription_endpoint,
            refresh_endpoint,
            ws_send_buffer,
        })
    }
}

fn derive_subscription_endpoint(endpoint: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(endpoint).context("invalid graphql endpoint url")?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => anyhow::bail!("cannot derive a streaming endpoint from scheme '{other}'"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot rewrite scheme of '{endpoint}'"))?;
    Ok(url.into())
}

fn derive_refresh_endpoint(endpoint: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(endpoint).context("invalid graphql endpoint url")?;
    url.set_path("/auth/refresh");
    url.set_query(None);
    Ok(url.into())
}
