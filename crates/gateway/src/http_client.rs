use std::{sync::OnceLock, time::Duration};

use reqwest::{Client, ClientBuilder, header};

/// Builder shared by the backend and identity provider clients. Both endpoints
/// expect the AWS SDK user agent in `x-amz-user-agent` as well.
pub(crate) fn client_builder(user_agent: &'static str) -> ClientBuilder {
    let mut headers = header::HeaderMap::new();
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("keep-alive"));
    headers.insert("x-amz-user-agent", header::HeaderValue::from_static(user_agent));

    // Idle connections are dropped quickly so DNS changes of the AWS endpoints are picked up.
    Client::builder()
        .user_agent(user_agent)
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
}

/// Client for the identity provider, with a short overall timeout.
pub(crate) fn identity_client(user_agent: &'static str) -> Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            client_builder(user_agent)
                .timeout(Duration::from_secs(15))
                .build()
                .expect("Failed to build identity provider HTTP client")
        })
        .clone()
}
