//! Configuration management for the ACL manager daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including the controller endpoint, known peers and queue sizes.

use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
   acl::frame::ChannelId,
   error::{AclError, Result},
   hci::address::Address,
};

/// Main configuration structure for the manager.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// H4-over-TCP controller endpoint
   #[serde(default = "default_controller")]
   pub controller: String,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Channel used by `send` when none is given
   #[serde(default = "default_channel")]
   pub default_channel: ChannelId,

   /// Depth of each subscriber queue and of the per-connection backlog of
   /// unclaimed frames
   #[serde(default = "default_frame_queue_depth")]
   pub frame_queue_depth: usize,

   #[serde(default = "default_channel_buffer_size")]
   pub channel_buffer_size: usize,

   /// Fragment size used until the controller reports its buffers
   #[serde(default = "default_acl_buffer_length")]
   pub acl_buffer_length: u16,

   /// Controller buffer count assumed until the controller reports its buffers
   #[serde(default = "default_acl_buffer_count")]
   pub acl_buffer_count: u16,

   #[serde(default = "default_true")]
   pub reset_on_start: bool,

   #[serde(default = "default_true")]
   pub page_scan: bool,

   /// Only accept incoming connections from known devices
   #[serde(default)]
   pub accept_known_only: bool,

   /// Send every received frame back to its sender
   #[serde(default)]
   pub echo: bool,
}

/// A peer the daemon knows about.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KnownDevice {
   pub address: Address,
   pub name: String,
   /// Connect to this device on start
   #[serde(default)]
   pub connect: bool,
}

fn default_controller() -> String {
   "127.0.0.1:6402".to_string()
}

const fn default_channel() -> ChannelId {
   ChannelId::DYNAMIC_START
}

const fn default_frame_queue_depth() -> usize {
   64
}

const fn default_channel_buffer_size() -> usize {
   1000
}

const fn default_acl_buffer_length() -> u16 {
   27
}

const fn default_acl_buffer_count() -> u16 {
   1
}

const fn default_true() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         controller: default_controller(),
         known_devices: vec![],
         default_channel: default_channel(),
         frame_queue_depth: default_frame_queue_depth(),
         channel_buffer_size: default_channel_buffer_size(),
         acl_buffer_length: default_acl_buffer_length(),
         acl_buffer_count: default_acl_buffer_count(),
         reset_on_start: true,
         page_scan: true,
         accept_known_only: false,
         echo: false,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(acld_home) = env::var("ACLD_HOME") {
         PathBuf::from(acld_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(AclError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("acld").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: Address) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address == address)
         .map(|d| d.name.as_str())
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   #[test]
   fn test_parse_partial_config() {
      let config: Config = toml::from_str(
         r#"
            controller = "10.0.0.2:6402"
            default_channel = 7
            echo = true

            [[known_devices]]
            address = "AA:BB:CC:DD:EE:FF"
            name = "Cert"
            connect = true
         "#,
      )
      .unwrap();

      assert_eq!(config.controller, "10.0.0.2:6402");
      assert_eq!(config.default_channel, ChannelId::SECURITY_MANAGER);
      assert!(config.echo);
      assert_eq!(config.frame_queue_depth, 64);
      assert!(config.page_scan);

      let cert: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
      assert_eq!(config.is_known_device(cert), Some("Cert"));
      assert!(config.known_devices[0].connect);
      assert_eq!(config.is_known_device(Address::any()), None);
   }

   #[test]
   fn test_rejects_bad_address() {
      let result: std::result::Result<Config, _> = toml::from_str(
         r#"
            [[known_devices]]
            address = "not-an-address"
            name = "Broken"
         "#,
      );
      assert!(result.is_err());
   }

   #[test]
   fn test_load_creates_default_then_round_trips() -> Result<()> {
      let temp_dir = TempDir::new()?;
      unsafe {
         env::set_var("ACLD_HOME", temp_dir.path());
      }

      let config = Config::load()?;
      assert!(temp_dir.path().join("acld").join("config.toml").exists());
      assert_eq!(config.controller, "127.0.0.1:6402");

      let mut changed = config.clone();
      changed.frame_queue_depth = 8;
      changed.known_devices.push(KnownDevice {
         address: Address([1, 2, 3, 4, 5, 6]),
         name: "Peer".to_string(),
         connect: false,
      });
      changed.save()?;

      let reloaded = Config::load()?;
      assert_eq!(reloaded.frame_queue_depth, 8);
      assert_eq!(reloaded.known_devices.len(), 1);
      assert_eq!(reloaded.known_devices[0].address, Address([1, 2, 3, 4, 5, 6]));
      Ok(())
   }
}
