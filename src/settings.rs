use crate::topic::Topics;
use crate::util::error::DynResult;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

fn default_server() -> String {
    "localhost:9092".to_string()
}

fn default_config_name() -> String {
    "Accelerator".to_string()
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_nag_period() -> u64 {
    900
}

fn default_connectivity_check_period() -> u64 {
    5
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_command_suffix() -> String {
    "Command".to_string()
}

fn default_talk_suffix() -> String {
    "Talk".to_string()
}

/// Server settings. Times are in seconds unless the name says otherwise.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_config_name")]
    pub config_name: String,
    /// Wait for the first value of a PV
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Publish the root state when nothing else was published
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Repeat the number of active alarms, 0 to never do so
    #[serde(default = "default_nag_period")]
    pub nag_period: u64,
    #[serde(default = "default_connectivity_check_period")]
    pub connectivity_check_period: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_command_suffix")]
    pub command_suffix: String,
    #[serde(default = "default_talk_suffix")]
    pub talk_suffix: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            server: default_server(),
            config_name: default_config_name(),
            connection_timeout: default_connection_timeout(),
            idle_timeout: default_idle_timeout(),
            nag_period: default_nag_period(),
            connectivity_check_period: default_connectivity_check_period(),
            poll_timeout_ms: default_poll_timeout_ms(),
            command_suffix: default_command_suffix(),
            talk_suffix: default_talk_suffix(),
        }
    }
}

impl ServerSettings {
    pub fn topics(&self) -> Topics {
        Topics::new(&self.config_name, &self.command_suffix, &self.talk_suffix)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn nag_period(&self) -> Option<Duration> {
        if self.nag_period > 0 {
            Some(Duration::from_secs(self.nag_period))
        } else {
            None
        }
    }

    pub fn connectivity_check_period(&self) -> Duration {
        Duration::from_secs(self.connectivity_check_period)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Read settings from a JSON file, or use the defaults if there is none
pub fn read_settings(path: Option<&Path>) -> DynResult<ServerSettings> {
    match path {
        Some(path) => {
            let f = File::open(path)?;
            let settings: ServerSettings = serde_json::from_reader(f)?;
            Ok(settings)
        }
        None => Ok(ServerSettings::default()),
    }
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_settings_defaults() {
    let settings: ServerSettings =
        serde_json::from_str(r#"{"config_name": "Demo", "nag_period": 0}"#).unwrap();
    assert_eq!(settings.server, "localhost:9092");
    assert_eq!(settings.nag_period(), None);
    assert_eq!(settings.idle_timeout(), Duration::from_secs(10));
    let topics = settings.topics();
    assert_eq!(topics.command, "DemoCommand");
    assert_eq!(topics.talk, "DemoTalk");

    assert!(serde_json::from_str::<ServerSettings>(r#"{"bogus": 1}"#).is_err());
    assert_eq!(read_settings(None).unwrap(), ServerSettings::default());
}
