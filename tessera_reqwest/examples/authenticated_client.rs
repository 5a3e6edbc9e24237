use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::eyre::eyre;
use predicates::prelude::PredicateBooleanExt;
use reqwest_middleware::ClientBuilder;
use tessera_reqwest::{unauthenticated, AuthenticationMiddleware, ForeignHost, PublicEndpoints};
use tessera_tokens::{
    sources::http::AuthApi, store::FileStore, RefreshCoordinator, RefreshTicker,
    DEFAULT_TICK_INTERVAL,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The root URL of the API
    #[arg(short, long, env, default_value = "http://localhost:8080/api")]
    api_url: reqwest::Url,

    /// The user to sign in as, if no session is stored
    #[arg(short, long, env)]
    username: Option<String>,

    /// The password used to sign in
    #[arg(short, long, env, hide_env_values = true)]
    password: Option<String>,

    /// The local file used to persist credentials
    #[arg(short = 'f', long, env, default_value = ".credentials.json")]
    credentials_file: PathBuf,

    /// The API path to poll
    #[arg(long, env, default_value = "collections")]
    resource: String,

    /// Seconds between polls
    #[arg(long, env, default_value_t = 5)]
    poll_secs: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let api = AuthApi::with_default_client(opts.api_url.clone())?;
    let store = FileStore::new(opts.credentials_file);
    let coordinator = RefreshCoordinator::new(Arc::new(store), Arc::new(api.clone()));

    let status = coordinator.restore().await?;
    tracing::info!(?status, "restored session");

    if !status.is_authenticated() {
        let (Some(username), Some(password)) = (opts.username, opts.password) else {
            return Err(eyre!("no stored session; provide --username and --password"));
        };
        api.sign_in(&coordinator, &username, &password).await?;
        tracing::info!(%username, "signed in");
    }

    let mut status_changes = coordinator.subscribe();
    tokio::spawn(async move {
        while status_changes.changed().await.is_ok() {
            let status = *status_changes.borrow_and_update();
            tracing::info!(?status, "session status changed");
        }
    });

    let ticker = RefreshTicker::new(coordinator.clone(), DEFAULT_TICK_INTERVAL);
    ticker.start();

    let api_host =
        ForeignHost::of(api.base_url()).ok_or_else(|| eyre!("API URL must include a host"))?;
    let client = ClientBuilder::new(reqwest::Client::new())
        .with(
            AuthenticationMiddleware::new(coordinator.clone())
                .with_public_endpoints(PublicEndpoints::default().or(api_host)),
        )
        .build();

    let resource = api.endpoint(&opts.resource)?;
    let mut interval = time::interval(Duration::from_secs(opts.poll_secs.max(1)));
    loop {
        interval.tick().await;

        match client.get(resource.clone()).send().await {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await?;
                tracing::info!(status = status.as_u16(), bytes = body.len(), "polled resource");
            }
            Err(error) => {
                if let Some(unauthenticated) = unauthenticated(&error) {
                    tracing::error!(reason = %unauthenticated.reason, "session ended");
                    break;
                }
                tracing::warn!(%error, "request failed");
            }
        }
    }

    ticker.stop().await;
    Ok(())
}
