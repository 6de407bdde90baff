use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tempsink::{
    codec::get_codec,
    envelope::Envelope,
    pipeline::Pipeline,
    producer::EnvelopeProducer,
    settings::Settings,
    store::{postgres::PostgresGateway, SampleGateway},
    telemetry::init_logging,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the consumer group and ingest until interrupted
    Consume,
    /// Publish a single sample
    Publish {
        #[arg(long)]
        city: String,
        #[arg(long)]
        temperature: String,
        /// RFC 3339 observation time (default: now)
        #[arg(long)]
        time: Option<DateTime<Utc>>,
    },
    /// Print the stored samples of a city as JSON
    Query {
        #[arg(long)]
        city: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::new(args.config.as_deref()).context("cannot load config")?;
    init_logging(&settings.log_level, settings.log_format)?;

    match args.command {
        Command::Consume => consume(&settings).await,
        Command::Publish {
            city,
            temperature,
            time,
        } => {
            let producer = EnvelopeProducer::new(
                &settings.kafka,
                get_codec(&settings.codec)?,
                info_span!("producer"),
            )
            .context("creating kafka producer")?;
            let envelope = Envelope::new(city, temperature, time.unwrap_or_else(Utc::now));
            producer.publish(&envelope).await?;
            info!(city = %envelope.city, "sample published");
            Ok(())
        }
        Command::Query { city } => {
            let gateway = PostgresGateway::new(&settings.postgres, info_span!("store"))?;
            let samples = gateway.query(&city).await?;
            println!("{}", serde_json::to_string_pretty(&samples)?);
            Ok(())
        }
    }
}

async fn consume(settings: &Settings) -> Result<()> {
    let pipeline = Pipeline::connect(settings).await?;
    let cancel = CancellationToken::new();
    let supervisor = pipeline.start(cancel.clone())?;
    info!(topic = %settings.kafka.topic, group = %settings.kafka.consumer_group, "pipeline started");

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    cancel.cancel();
                }
                Err(e) => error!(error = %e, "cannot listen for shutdown signal"),
            }
        }
    });

    supervisor.await.context("supervisor task failed")?;
    info!(
        mirrored = pipeline.mirror_snapshot().len(),
        "pipeline stopped"
    );
    Ok(())
}
