use std::error::Error;
use std::sync::Arc;

use salesforce_listener::config::SalesforceSettings;
use salesforce_listener::StreamingSessionManager;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Reads SALESFORCE_BASE_URL, SALESFORCE_CLIENT_ID, SALESFORCE_CLIENT_SECRET,
    // SALESFORCE_LISTENER_ENABLED, SALESFORCE_STREAMING_CHANNEL and SALESFORCE_API_VERSION.
    let settings = SalesforceSettings::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let manager = StreamingSessionManager::new(Arc::new(settings))?;

        let handle = match manager.start(None).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                tracing::info!("listener disabled or no channel configured");
                return Ok(());
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    configuration = err.is_configuration(),
                    "Failed to start Salesforce listener"
                );
                return Err(err.into());
            }
        };

        println!(
            "listening channel={} client_id={} endpoint={}",
            handle.channel(),
            handle.client_id().unwrap_or_default(),
            handle.endpoint()
        );

        tokio::signal::ctrl_c().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
