use std::{collections::HashMap, env, net::SocketAddr, path::PathBuf};

use clap::Parser;
use config::{Config, ConfigError, Environment, File, Map, Source, Value};
use serde::Deserialize;

use crate::{
	constants::{CONFIG_ROOT, DEFAULT_CONFIG_ROOT},
	types::ChainId,
};

#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about = "Account-scoped Substrate chain indexer")]
pub struct CommandLineOptions {
	#[clap(short = 'c', long = "config-path", help = "Path to the settings file")]
	pub config_path: Option<String>,
	#[clap(long = "listen", help = "HOST:PORT for the client websocket listener")]
	pub listen: Option<String>,
	#[clap(long = "db", help = "Path of the embedded database file")]
	pub db: Option<String>,
	#[clap(long = "chains", help = "Comma separated chains to serve, e.g. kusama,polkadot")]
	pub chains: Option<String>,
	#[clap(long = "finality-depth", help = "Blocks behind head treated as final")]
	pub finality_depth: Option<u64>,
	#[clap(long = "rpc-url-kusama")]
	pub rpc_url_kusama: Option<String>,
	#[clap(long = "rpc-url-polkadot")]
	pub rpc_url_polkadot: Option<String>,
	#[clap(long = "log-level")]
	pub log_level: Option<String>,
}

#[derive(Clone, Deserialize, Debug)]
pub struct HealthCheck {
	pub hostname: String,
	pub port: u16,
}

#[derive(Clone, Deserialize, Debug, Default)]
pub struct RpcEndpoints {
	#[serde(default)]
	pub kusama: Option<String>,
	#[serde(default)]
	pub polkadot: Option<String>,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Settings {
	pub listen: String,
	pub db: PathBuf,
	/// Comma separated chain list, parsed through [`Settings::chain_ids`].
	pub chains: String,
	#[serde(default)]
	pub finality_depth: Option<u64>,
	#[serde(default)]
	pub rpc: RpcEndpoints,
	pub log_level: String,
	#[serde(default)]
	pub health_check: Option<HealthCheck>,
}

impl Settings {
	/// Defaults, then the settings file, then environment variables, then
	/// command line options; later sources win.
	pub fn new(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let config_root =
			env::var(CONFIG_ROOT).unwrap_or_else(|_| DEFAULT_CONFIG_ROOT.to_string());
		let file = opts
			.config_path
			.clone()
			.unwrap_or_else(|| format!("{config_root}/config/Default.toml"));

		let settings: Self = Config::builder()
			.set_default("listen", "127.0.0.1:9880")?
			.set_default("db", "./portfolio.db")?
			.set_default("chains", "kusama")?
			.set_default("log_level", "info")?
			.add_source(File::with_name(&file).required(false))
			.add_source(Environment::default().separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()?;

		settings.validate()?;
		Ok(settings)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		self.listen.parse::<SocketAddr>().map_err(|e| {
			ConfigError::Message(format!("listen address {} is invalid: {e}", self.listen))
		})?;
		for chain in self.chain_ids()? {
			if self.rpc_url(chain).is_none() {
				return Err(ConfigError::Message(format!(
					"chain {chain} is enabled but has no rpc url configured"
				)))
			}
		}
		Ok(())
	}

	pub fn listen_address(&self) -> SocketAddr {
		self.listen.parse().expect("validated at load time")
	}

	pub fn chain_ids(&self) -> Result<Vec<ChainId>, ConfigError> {
		self.chains
			.split(',')
			.map(str::trim)
			.filter(|chain| !chain.is_empty())
			.map(|chain| {
				chain
					.parse::<ChainId>()
					.map_err(|e| ConfigError::Message(e.to_string()))
			})
			.collect()
	}

	pub fn rpc_url(&self, chain: ChainId) -> Option<&str> {
		match chain {
			ChainId::Kusama => self.rpc.kusama.as_deref(),
			ChainId::Polkadot => self.rpc.polkadot.as_deref(),
		}
	}
}

fn insert_command_line_option<T: Clone + Into<Value>>(
	map: &mut HashMap<String, Value>,
	key: &str,
	option: &Option<T>,
) {
	if let Some(value) = option {
		map.insert(key.to_string(), value.clone().into());
	}
}

impl Source for CommandLineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "listen", &self.listen);
		insert_command_line_option(&mut map, "db", &self.db);
		insert_command_line_option(&mut map, "chains", &self.chains);
		insert_command_line_option(
			&mut map,
			"finality_depth",
			&self.finality_depth.map(|d| d as i64),
		);
		insert_command_line_option(&mut map, "rpc.kusama", &self.rpc_url_kusama);
		insert_command_line_option(&mut map, "rpc.polkadot", &self.rpc_url_polkadot);
		insert_command_line_option(&mut map, "log_level", &self.log_level);

		Ok(map)
	}
}
