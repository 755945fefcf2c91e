//! Layered settings for the three daemons: defaults, then an optional
//! TOML file (`--config`), then environment, then command-line flags.
//!
//! The dedicated `STATION_ID`, `REGION_ID` and `DATA_DIR` variables
//! override file values (but not explicit flags); everything else is
//! reachable through the generic `SECTION__FIELD` environment convention.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use config::{
	builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File, Map, Source,
	Value,
};
use serde::{de::DeserializeOwned, Deserialize};

use vf_primitives::StationId;
use vf_utilities::health::HealthCheck;

use crate::{
	broker::breaker::BreakerConfig,
	broker::scheduler::SchedulerConfig,
	central::tally::TallyConfig,
	station::sender::SendLoopConfig,
};

pub fn insert_command_line_option<V: Clone + Into<Value>>(
	map: &mut HashMap<String, Value>,
	key: &str,
	option: &Option<V>,
) {
	if let Some(value) = option {
		map.insert(key.to_string(), value.clone().into());
	}
}

/// Dedicated environment overrides, ranked between the configuration file
/// and the command line.
#[derive(Clone, Debug)]
pub struct EnvOverrides {
	mappings: &'static [(&'static str, &'static str)],
}

impl Source for EnvOverrides {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new(self.clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: Map<String, Value> = Map::new();
		for (variable, key) in self.mappings {
			if let Ok(value) = std::env::var(variable) {
				map.insert(key.to_string(), value.into());
			}
		}
		Ok(map)
	}
}

pub trait VfSettings: DeserializeOwned + Sized {
	type CommandLineOptions: Source + Clone + Send + Sync + 'static;

	fn set_defaults(
		builder: ConfigBuilder<DefaultState>,
	) -> Result<ConfigBuilder<DefaultState>, ConfigError>;

	/// `(environment variable, settings key)` pairs honored by this tier.
	fn env_overrides() -> &'static [(&'static str, &'static str)];

	fn validate(&self) -> anyhow::Result<()> {
		Ok(())
	}

	fn load(config_path: Option<&str>, opts: Self::CommandLineOptions) -> anyhow::Result<Self> {
		let mut builder = Self::set_defaults(Config::builder())?;
		if let Some(path) = config_path {
			builder = builder.add_source(File::with_name(path));
		}
		let settings: Self = builder
			.add_source(Environment::default().separator("__"))
			.add_source(EnvOverrides { mappings: Self::env_overrides() })
			.add_source(opts)
			.build()?
			.try_deserialize()?;
		settings.validate()?;
		Ok(settings)
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeSettings {
	pub id: String,
	pub port: u16,
	pub admin_port: u16,
	pub data_dir: PathBuf,
}

impl NodeSettings {
	pub fn station_id(&self) -> anyhow::Result<StationId> {
		Ok(StationId::new(self.id.clone())?)
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct EndpointSettings {
	pub ws_endpoint: String,
	pub request_timeout_ms: u64,
}

impl EndpointSettings {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.request_timeout_ms)
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct SenderSettings {
	pub resend_interval_ms: u64,
	pub resend_delay_ms: u64,
	pub base_backoff_ms: u64,
	pub max_backoff_ms: u64,
	pub reconnect_delay_ms: u64,
}

impl SenderSettings {
	pub fn send_loop_config(&self) -> SendLoopConfig {
		SendLoopConfig {
			resend_interval: Duration::from_millis(self.resend_interval_ms),
			resend_delay: Duration::from_millis(self.resend_delay_ms),
			base_backoff: Duration::from_millis(self.base_backoff_ms),
			max_backoff: Duration::from_millis(self.max_backoff_ms),
		}
	}

	pub fn reconnect_delay(&self) -> Duration {
		Duration::from_millis(self.reconnect_delay_ms)
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct StationSettings {
	pub node: NodeSettings,
	pub region_id: Option<String>,
	pub roll_file: PathBuf,
	pub broker: EndpointSettings,
	pub sender: SenderSettings,
	pub health_check: Option<HealthCheck>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct QueueSettings {
	pub capacity: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BreakerSettings {
	pub failure_threshold: u32,
	pub open_timeout_ms: u64,
	pub success_threshold: u32,
}

impl BreakerSettings {
	pub fn config(&self) -> BreakerConfig {
		BreakerConfig {
			failure_threshold: self.failure_threshold,
			open_timeout: Duration::from_millis(self.open_timeout_ms),
			success_threshold: self.success_threshold,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct SchedulerSettings {
	pub interval_ms: u64,
	pub request_timeout_ms: u64,
	pub base_delay_ms: u64,
	pub multiplier: u32,
	pub max_delay_ms: u64,
	pub quarantine_after: u32,
	pub max_in_flight: usize,
}

impl SchedulerSettings {
	pub fn config(&self) -> SchedulerConfig {
		SchedulerConfig {
			interval: Duration::from_millis(self.interval_ms),
			request_timeout: Duration::from_millis(self.request_timeout_ms),
			base_delay: Duration::from_millis(self.base_delay_ms),
			multiplier: self.multiplier,
			max_delay: Duration::from_millis(self.max_delay_ms),
			quarantine_after: self.quarantine_after,
			max_in_flight: self.max_in_flight,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrokerSettings {
	pub node: NodeSettings,
	pub region_id: Option<String>,
	pub central: EndpointSettings,
	pub queue: QueueSettings,
	pub breaker: BreakerSettings,
	pub scheduler: SchedulerSettings,
	pub health_check: Option<HealthCheck>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TallySettings {
	pub checkpoint_every: u32,
	pub checkpoint_interval_ms: u64,
}

impl TallySettings {
	pub fn config(&self) -> TallyConfig {
		TallyConfig {
			checkpoint_every: self.checkpoint_every,
			checkpoint_interval: Duration::from_millis(self.checkpoint_interval_ms),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct CentralSettings {
	pub node: NodeSettings,
	pub region_id: Option<String>,
	pub tally: TallySettings,
	pub health_check: Option<HealthCheck>,
}

#[derive(clap::Parser, Debug, Clone, Default)]
#[clap(version)]
pub struct StationOptions {
	#[clap(long = "config", help = "Path to a TOML settings file.")]
	pub config_path: Option<String>,
	#[clap(long = "id", help = "Station instance identifier.")]
	pub id: Option<String>,
	#[clap(long = "port", help = "Public RPC port. Use 0 for a random port.")]
	pub port: Option<u16>,
	#[clap(long = "admin-port", help = "Local-only admin RPC port.")]
	pub admin_port: Option<u16>,
	#[clap(long = "data-dir", help = "Directory owning the outbox and audit logs.")]
	pub data_dir: Option<String>,
	#[clap(long = "roll-file", help = "Eligibility roll, one voter id per line.")]
	pub roll_file: Option<String>,
	#[clap(long = "broker.ws_endpoint", help = "The broker's RPC endpoint.")]
	pub broker_ws_endpoint: Option<String>,
}

impl Source for StationOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new(self.clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();
		insert_command_line_option(&mut map, "node.id", &self.id);
		insert_command_line_option(&mut map, "node.port", &self.port.map(i64::from));
		insert_command_line_option(&mut map, "node.admin_port", &self.admin_port.map(i64::from));
		insert_command_line_option(&mut map, "node.data_dir", &self.data_dir);
		insert_command_line_option(&mut map, "roll_file", &self.roll_file);
		insert_command_line_option(&mut map, "broker.ws_endpoint", &self.broker_ws_endpoint);
		Ok(map)
	}
}

impl VfSettings for StationSettings {
	type CommandLineOptions = StationOptions;

	fn set_defaults(
		builder: ConfigBuilder<DefaultState>,
	) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
		builder
			.set_default("node.id", "station-01")?
			.set_default("node.port", 9600)?
			.set_default("node.admin_port", 9601)?
			.set_default("node.data_dir", "./data/station")?
			.set_default("roll_file", "./data/station/roll.txt")?
			.set_default("broker.ws_endpoint", "ws://localhost:9610")?
			.set_default("broker.request_timeout_ms", 5_000)?
			.set_default("sender.resend_interval_ms", 1_000)?
			.set_default("sender.resend_delay_ms", 2_000)?
			.set_default("sender.base_backoff_ms", 500)?
			.set_default("sender.max_backoff_ms", 60_000)?
			.set_default("sender.reconnect_delay_ms", 1_000)
	}

	fn env_overrides() -> &'static [(&'static str, &'static str)] {
		&[("STATION_ID", "node.id"), ("REGION_ID", "region_id"), ("DATA_DIR", "node.data_dir")]
	}
}

#[derive(clap::Parser, Debug, Clone, Default)]
#[clap(version)]
pub struct BrokerOptions {
	#[clap(long = "config", help = "Path to a TOML settings file.")]
	pub config_path: Option<String>,
	#[clap(long = "id", help = "Broker instance identifier.")]
	pub id: Option<String>,
	#[clap(long = "port", help = "Public RPC port. Use 0 for a random port.")]
	pub port: Option<u16>,
	#[clap(long = "admin-port", help = "Local-only admin RPC port.")]
	pub admin_port: Option<u16>,
	#[clap(long = "data-dir", help = "Directory owning the pending and audit logs.")]
	pub data_dir: Option<String>,
	#[clap(long = "central.ws_endpoint", help = "Central intake's RPC endpoint.")]
	pub central_ws_endpoint: Option<String>,
}

impl Source for BrokerOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new(self.clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();
		insert_command_line_option(&mut map, "node.id", &self.id);
		insert_command_line_option(&mut map, "node.port", &self.port.map(i64::from));
		insert_command_line_option(&mut map, "node.admin_port", &self.admin_port.map(i64::from));
		insert_command_line_option(&mut map, "node.data_dir", &self.data_dir);
		insert_command_line_option(&mut map, "central.ws_endpoint", &self.central_ws_endpoint);
		Ok(map)
	}
}

impl VfSettings for BrokerSettings {
	type CommandLineOptions = BrokerOptions;

	fn set_defaults(
		builder: ConfigBuilder<DefaultState>,
	) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
		builder
			.set_default("node.id", "broker-01")?
			.set_default("node.port", 9610)?
			.set_default("node.admin_port", 9611)?
			.set_default("node.data_dir", "./data/broker")?
			.set_default("central.ws_endpoint", "ws://localhost:9620")?
			.set_default("central.request_timeout_ms", 5_000)?
			.set_default("queue.capacity", 10_000)?
			.set_default("breaker.failure_threshold", 5)?
			.set_default("breaker.open_timeout_ms", 30_000)?
			.set_default("breaker.success_threshold", 2)?
			.set_default("scheduler.interval_ms", 500)?
			.set_default("scheduler.request_timeout_ms", 5_000)?
			.set_default("scheduler.base_delay_ms", 1_000)?
			.set_default("scheduler.multiplier", 2)?
			.set_default("scheduler.max_delay_ms", 60_000)?
			.set_default("scheduler.quarantine_after", 10)?
			.set_default("scheduler.max_in_flight", 8)
	}

	fn env_overrides() -> &'static [(&'static str, &'static str)] {
		&[("REGION_ID", "region_id"), ("DATA_DIR", "node.data_dir")]
	}
}

#[derive(clap::Parser, Debug, Clone, Default)]
#[clap(version)]
pub struct CentralOptions {
	#[clap(long = "config", help = "Path to a TOML settings file.")]
	pub config_path: Option<String>,
	#[clap(long = "id", help = "Central instance identifier.")]
	pub id: Option<String>,
	#[clap(long = "port", help = "Public RPC port. Use 0 for a random port.")]
	pub port: Option<u16>,
	#[clap(long = "admin-port", help = "Local-only admin RPC port.")]
	pub admin_port: Option<u16>,
	#[clap(long = "data-dir", help = "Directory owning the received log and checkpoint.")]
	pub data_dir: Option<String>,
}

impl Source for CentralOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new(self.clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();
		insert_command_line_option(&mut map, "node.id", &self.id);
		insert_command_line_option(&mut map, "node.port", &self.port.map(i64::from));
		insert_command_line_option(&mut map, "node.admin_port", &self.admin_port.map(i64::from));
		insert_command_line_option(&mut map, "node.data_dir", &self.data_dir);
		Ok(map)
	}
}

impl VfSettings for CentralSettings {
	type CommandLineOptions = CentralOptions;

	fn set_defaults(
		builder: ConfigBuilder<DefaultState>,
	) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
		builder
			.set_default("node.id", "central-01")?
			.set_default("node.port", 9620)?
			.set_default("node.admin_port", 9621)?
			.set_default("node.data_dir", "./data/central")?
			.set_default("tally.checkpoint_every", 100)?
			.set_default("tally.checkpoint_interval_ms", 5_000)
	}

	fn env_overrides() -> &'static [(&'static str, &'static str)] {
		&[("REGION_ID", "region_id"), ("DATA_DIR", "node.data_dir")]
	}
}
