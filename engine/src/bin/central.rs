use std::{
	sync::{atomic::AtomicBool, Arc},
	time::Duration,
};

use clap::Parser;
use futures::FutureExt;
use vf_utilities::{health, task_scope::task_scope};
use voteflow_engine::{
	central,
	settings::{CentralOptions, CentralSettings, VfSettings},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = CentralOptions::parse();
	vf_utilities::logging::init_json_logger();

	let config_path = opts.config_path.clone();
	let settings = CentralSettings::load(config_path.as_deref(), opts)?;
	tracing::info!(
		"Starting central tally {} (data dir {})",
		settings.node.id,
		settings.node.data_dir.display()
	);

	task_scope(|scope| {
		async move {
			let has_completed_initialising = Arc::new(AtomicBool::new(false));
			health::start_if_configured(
				scope,
				settings.health_check.as_ref(),
				has_completed_initialising.clone(),
			)?;

			let handles = central::start(scope, settings).await?;
			has_completed_initialising.store(true, std::sync::atomic::Ordering::Relaxed);

			tokio::signal::ctrl_c().await?;
			tracing::info!("Shutdown signal received");
			handles.shutdown.shutdown(SHUTDOWN_GRACE).await;
			Ok(())
		}
		.boxed()
	})
	.await
}
