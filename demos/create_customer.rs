use std::error::Error;

use salesforce_listener::auth::TokenClient;
use salesforce_listener::config::{ConfigSource, SalesforceSettings};
use salesforce_listener::rest::{CustomerClient, CustomerClientOptions, CustomerPayload};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().init();

    let last_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "REPLACE_WITH_LAST_NAME".to_string());
    let settings = SalesforceSettings::from_env()?;
    let credentials = settings.credentials()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let token = TokenClient::new()?.acquire_token(&credentials).await?;

        let client = CustomerClient::with_options(
            credentials.base_url.clone(),
            CustomerClientOptions::default(),
        )?;
        let created = client
            .create_customer(
                &CustomerPayload {
                    last_name: Some(last_name),
                },
                Some(&token.access_token),
            )
            .await?;

        println!(
            "status={} body={}",
            created.status,
            created.body.unwrap_or_default()
        );
        Ok::<(), Box<dyn Error>>(())
    })
}
