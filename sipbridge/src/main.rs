use sipbridge::{Config, SipStack, admin};
use tracing_subscriber::EnvFilter;
use util::DnsResolver;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Welcome to sipbridge");

    let resolver = DnsResolver::default();
    let config = match Config::from_env(&resolver).await {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "configuration error");
            std::process::exit(1);
        }
    };

    let stack = match SipStack::start(config).await {
        Ok(stack) => stack,
        Err(err) => {
            tracing::error!(%err, "failed to start SIP stack");
            std::process::exit(2);
        }
    };

    {
        let stack = stack.clone();
        tokio::spawn(async move {
            if let Err(err) = admin::serve(stack).await {
                tracing::error!(%err, "API webserver failed");
            }
        });
    }

    tracing::info!("sipbridge is ready to serve");

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "signal wait failed");
    }
    tracing::info!("shutting down");
}
