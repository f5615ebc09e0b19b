use anyhow::Result;
use clap::Parser;
use mce_dsp::{app::App, args::Args};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let args = Args::parse();
    let app = App::new(&args).await.inspect_err(|err| {
        tracing::error!("failed to start: {err:#}");
    })?;
    app.run().await
}
