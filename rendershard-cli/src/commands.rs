use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rendershard::client::RenderClient;
use rendershard::config::AppConfig;
use rendershard::dispatcher::Dispatcher;
use rendershard::services::ServiceContainer;
use rendershard::store::FsStore;
use rendershard::transport::LocalInvoker;
use serde_json::{Value, json};
use shard_protocol::{Codec, ImageFormat, RenderProgress, StartPayload, StillPayload, VERSION};
use tracing::info;

use crate::cli::{Args, Commands};

/// Workers, store and client wired together in this process.
pub struct CommandExecutor {
    client: RenderClient,
    invoker: Arc<LocalInvoker>,
    services: Arc<ServiceContainer>,
    // Invocations reach the dispatcher through a weak reference.
    _dispatcher: Arc<Dispatcher>,
    json: bool,
}

fn parse_props(props: Option<&str>) -> Result<Value> {
    match props {
        None => Ok(json!({})),
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).context("--props is not valid JSON")?;
            if !value.is_object() {
                bail!("--props must be a JSON object");
            }
            Ok(value)
        }
    }
}

impl CommandExecutor {
    pub fn new(args: &Args, config: AppConfig) -> Self {
        let store = Arc::new(FsStore::new(&args.store_dir));
        let invoker = Arc::new(LocalInvoker::new(config.transport.stream_stall()));
        let function_name = config.function_name.clone();
        let services = Arc::new(ServiceContainer::new(config, store, invoker.clone()));
        let dispatcher = Arc::new(Dispatcher::new(services.clone()));
        invoker.bind(&dispatcher);

        let client = RenderClient::new(invoker.clone(), function_name)
            .with_retry(services.retry.clone())
            .with_poll_interval(Duration::from_millis(250));
        Self {
            client,
            invoker,
            services,
            _dispatcher: dispatcher,
            json: args.json,
        }
    }

    pub async fn execute(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Render {
                serve_url,
                composition,
                codec,
                frames_per_lambda,
                frames,
                every_nth_frame,
                props,
                bucket,
                max_retries,
                no_wait,
            } => {
                let payload: StartPayload = serde_json::from_value(json!({
                    "version": VERSION,
                    "serveUrl": serve_url,
                    "composition": composition,
                    "codec": Codec::from(codec),
                    "framesPerLambda": frames_per_lambda,
                    "frameRange": frames,
                    "everyNthFrame": every_nth_frame,
                    "inputProps": parse_props(props.as_deref())?,
                    "bucketName": bucket,
                    "maxRetries": max_retries,
                }))?;
                let started = self.client.start(payload).await?;
                if no_wait {
                    return self.print(&serde_json::to_value(&started)?, || {
                        format!("Started {} in {}", started.render_id, started.bucket_name)
                    });
                }

                self.invoker.drain().await;
                let progress = self
                    .client
                    .wait_for_render(&started.render_id, &started.bucket_name)
                    .await?;
                self.print_progress(&progress)
            }
            Commands::Still {
                serve_url,
                composition,
                frame,
                image_format,
                props,
                bucket,
            } => {
                let payload: StillPayload = serde_json::from_value(json!({
                    "version": VERSION,
                    "serveUrl": serve_url,
                    "composition": composition,
                    "frame": frame,
                    "imageFormat": ImageFormat::from(image_format),
                    "inputProps": parse_props(props.as_deref())?,
                    "bucketName": bucket,
                }))?;
                let still = self.client.still(payload).await?;
                self.print(&serde_json::to_value(&still)?, || {
                    format!(
                        "Rendered {} ({} bytes, {})",
                        still.output_url, still.size_in_bytes, still.estimated_price.display_cost
                    )
                })
            }
            Commands::Status { render_id, bucket } => {
                let bucket = bucket.unwrap_or_else(|| self.services.config.bucket_name.clone());
                let progress = self.client.status(&render_id, &bucket).await?;
                self.print_progress(&progress)
            }
            Commands::Compositions { serve_url, props } => {
                let compositions = self
                    .client
                    .compositions(&serve_url, parse_props(props.as_deref())?)
                    .await?;
                self.print(&serde_json::to_value(&compositions)?, || {
                    compositions
                        .iter()
                        .map(|c| {
                            format!(
                                "{:<16} {}x{} {}fps {} frames",
                                c.id, c.width, c.height, c.fps, c.duration_in_frames
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            Commands::Info => {
                let info = self.client.info().await?;
                self.print(&serde_json::to_value(&info)?, || info.version.clone())
            }
        }
    }

    fn print(&self, value: &Value, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }

    fn print_progress(&self, progress: &RenderProgress) -> Result<()> {
        self.print(&serde_json::to_value(progress)?, || {
            let mut lines = vec![format!(
                "{} {:.1}% ({} of {} chunks missing)",
                progress.render_id,
                progress.overall_progress * 100.0,
                progress.missing_chunks.len(),
                progress.chunks
            )];
            if let Some(output) = &progress.output_file {
                lines.push(format!("Output: {output}"));
            }
            lines.push(format!("Cost: {}", progress.costs.display_cost));
            for error in &progress.errors {
                lines.push(format!("{}: {}", error.name, error.message));
            }
            lines.join("\n")
        })
    }

    pub async fn shutdown(&self) {
        self.invoker.drain().await;
        self.services.shutdown();
        info!("Workers stopped");
    }
}
