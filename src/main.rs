use camera_sentinel::{config, start_app, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env is fine; the real environment still applies.
    dotenvy::dotenv().ok();
    let config = config::get_configuration()?;
    telemetry::init_tracing(&config.log_level);

    tracing::info!("Starting camera sentinel monitoring...");
    start_app(config).await?;

    Ok(())
}
