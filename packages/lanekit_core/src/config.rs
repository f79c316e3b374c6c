//! Runtime configuration
//!
//! Backend selection and simulator scenario parameters. Values come from
//! `LANEKIT_*` environment variables, optionally replaced wholesale by a
//! JSON config file. Unset values keep their defaults; unparseable values
//! are ignored with a log line rather than failing startup.

use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::backend::afc::AfcBackend;
use crate::backend::mock::{MockBackend, SimulationSpeed};
use crate::backend::FeedBackend;
use crate::transport::CommandTransport;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("AFC backend requires a command transport")]
    MissingTransport,
}

/// Which backend implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Mock,
    Afc,
}

/// Simulator topology scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MockTopology {
    #[default]
    Hub,
    ToolChanger,
    SingleExtruder,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: BackendKind,
    pub mock_lanes: usize,
    pub mock_topology: MockTopology,
    pub sim_speedup: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            backend: BackendKind::Mock,
            mock_lanes: 4,
            mock_topology: MockTopology::Hub,
            sim_speedup: 1.0,
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from `LANEKIT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::default();
        for (key, value) in std::env::vars() {
            config.apply(&key, &value);
        }
        config
    }

    /// Apply one environment entry. Unknown keys are ignored.
    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "LANEKIT_BACKEND" => match value.to_lowercase().as_str() {
                "mock" => self.backend = BackendKind::Mock,
                "afc" => self.backend = BackendKind::Afc,
                other => warn!("[config] unknown backend '{other}', keeping default"),
            },
            "LANEKIT_MOCK_LANES" => match value.parse::<usize>() {
                Ok(count) => self.mock_lanes = count.clamp(1, 16),
                Err(_) => warn!("[config] unparseable LANEKIT_MOCK_LANES '{value}'"),
            },
            "LANEKIT_MOCK_TOPOLOGY" => match value.to_lowercase().as_str() {
                "hub" => self.mock_topology = MockTopology::Hub,
                "toolchanger" | "tool_changer" | "tc" => {
                    self.mock_topology = MockTopology::ToolChanger
                }
                "single" | "single_extruder" => {
                    self.mock_topology = MockTopology::SingleExtruder
                }
                other => warn!("[config] unknown mock topology '{other}', keeping default"),
            },
            "LANEKIT_SIM_SPEEDUP" => match value.parse::<f64>() {
                Ok(factor) if factor > 0.0 => self.sim_speedup = factor,
                _ => warn!("[config] unparseable LANEKIT_SIM_SPEEDUP '{value}'"),
            },
            _ => {}
        }
    }

    /// Load a full configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Construct the backend this configuration selects. The AFC backend needs
/// the command transport; the mock runs free-standing.
pub fn create_backend(
    config: &RuntimeConfig,
    transport: Option<Arc<dyn CommandTransport>>,
) -> Result<Arc<dyn FeedBackend>, ConfigError> {
    match config.backend {
        BackendKind::Mock => {
            let speed = SimulationSpeed::new(config.sim_speedup);
            let backend = match config.mock_topology {
                MockTopology::Hub => MockBackend::hub(config.mock_lanes, speed),
                MockTopology::ToolChanger => {
                    MockBackend::tool_changer(config.mock_lanes, speed)
                }
                MockTopology::SingleExtruder => MockBackend::single_extruder(speed),
            };
            info!(
                "[config] mock backend: {:?}, {} lanes, speedup {}",
                config.mock_topology, config.mock_lanes, config.sim_speedup
            );
            Ok(Arc::new(backend))
        }
        BackendKind::Afc => {
            let transport = transport.ok_or(ConfigError::MissingTransport)?;
            info!("[config] AFC backend over command transport");
            Ok(Arc::new(AfcBackend::new(transport)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyKind;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.backend, BackendKind::Mock);
        assert_eq!(config.mock_lanes, 4);
        assert_eq!(config.mock_topology, MockTopology::Hub);
        assert_eq!(config.sim_speedup, 1.0);
    }

    #[test]
    fn test_apply_env_entries() {
        let mut config = RuntimeConfig::default();
        config.apply("LANEKIT_BACKEND", "AFC");
        config.apply("LANEKIT_MOCK_LANES", "8");
        config.apply("LANEKIT_MOCK_TOPOLOGY", "tool_changer");
        config.apply("LANEKIT_SIM_SPEEDUP", "50");

        assert_eq!(config.backend, BackendKind::Afc);
        assert_eq!(config.mock_lanes, 8);
        assert_eq!(config.mock_topology, MockTopology::ToolChanger);
        assert_eq!(config.sim_speedup, 50.0);
    }

    #[test]
    fn test_apply_ignores_garbage() {
        let mut config = RuntimeConfig::default();
        config.apply("LANEKIT_BACKEND", "teleporter");
        config.apply("LANEKIT_MOCK_LANES", "many");
        config.apply("LANEKIT_SIM_SPEEDUP", "-2");
        config.apply("UNRELATED", "1");
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_lane_count_clamped() {
        let mut config = RuntimeConfig::default();
        config.apply("LANEKIT_MOCK_LANES", "0");
        assert_eq!(config.mock_lanes, 1);
        config.apply("LANEKIT_MOCK_LANES", "99");
        assert_eq!(config.mock_lanes, 16);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backend": "mock", "mock_lanes": 6, "mock_topology": "tool_changer", "sim_speedup": 25.0}}"#
        )
        .unwrap();

        let config = RuntimeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.mock_lanes, 6);
        assert_eq!(config.mock_topology, MockTopology::ToolChanger);
        assert_eq!(config.sim_speedup, 25.0);
    }

    #[test]
    fn test_from_json_file_errors() {
        assert!(matches!(
            RuntimeConfig::from_json_file(Path::new("/nonexistent/lanekit.json")),
            Err(ConfigError::Io(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            RuntimeConfig::from_json_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_create_backend_scenarios() {
        let hub = create_backend(&RuntimeConfig::default(), None).unwrap();
        assert_eq!(hub.topology().kind, TopologyKind::Hub);
        assert_eq!(hub.topology().lanes.len(), 4);

        let config = RuntimeConfig {
            mock_topology: MockTopology::ToolChanger,
            mock_lanes: 3,
            ..RuntimeConfig::default()
        };
        let tc = create_backend(&config, None).unwrap();
        assert_eq!(tc.topology().kind, TopologyKind::ToolChanger);
        assert_eq!(tc.topology().lanes.len(), 3);
    }

    #[test]
    fn test_afc_requires_transport() {
        let config = RuntimeConfig {
            backend: BackendKind::Afc,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            create_backend(&config, None),
            Err(ConfigError::MissingTransport)
        ));
    }
}
