use crate::*;

use std::path::PathBuf;

use anyhow::Context;
use uasc_core::config::{ConfigError, UascConfig};
use uasc_core::policy::PolicyError;

/// A scratch directory removed on drop.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("uasc-it-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    fn write(&self, contents: &str) -> PathBuf {
        let path = self.0.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[test]
fn file_limits_reach_the_channel() -> anyhow::Result<()> {
    let dir = ScratchDir::new("limits");
    let path = dir.write(
        r#"
[limits]
max_message_size = 1000
max_pending_messages = 5

[security]
policy_uri = "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
mode = "SignAndEncrypt"
"#,
    );
    let config = UascConfig::load_from(&path).context("load config")?;
    config.validate().context("validate config")?;

    let receiver = Side {
        limits: ChannelLimits::from(&config.limits),
        key_size: 256,
    };
    assert_eq!(receiver.limits.max_pending_messages, 5);
    let mut pair = Pair::open_with(
        config.security_policy()?,
        config.security_mode()?,
        Side::default(),
        receiver,
    );
    let outcome = deliver(&mut pair.server, &pair.client.send_message(1, &pattern(1001))?);
    assert!(matches!(
        outcome.events.as_slice(),
        [ChannelEvent::MessageFailed { request_id: 1, .. }]
    ));
    let outcome = deliver(&mut pair.server, &pair.client.send_message(2, &pattern(1000))?);
    assert_eq!(bodies(&outcome.events), vec![Bytes::from(pattern(1000))]);
    Ok(())
}

#[test]
fn environment_beats_file() {
    let dir = ScratchDir::new("env");
    let path = dir.write("[limits]\nmax_chunk_count = 7\n[network]\nlisten_addr = \"0.0.0.0:4841\"\n");
    let mut config = UascConfig::load_from(&path).unwrap();
    config.apply_overrides(|key| match key {
        "UASC_LIMITS__MAX_CHUNK_COUNT" => Some("9".to_string()),
        _ => None,
    });
    assert_eq!(config.limits.max_chunk_count, 9);
    assert_eq!(config.network.listen_addr, "0.0.0.0:4841");
}

#[test]
fn unknown_policy_is_rejected() {
    let dir = ScratchDir::new("policy");
    let path = dir.write("[security]\npolicy_uri = \"urn:not-a-policy\"\n");
    let config = UascConfig::load_from(&path).unwrap();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Policy(PolicyError::UnknownUri(_)))
    ));
}

#[test]
fn malformed_file_reports_its_path() {
    let dir = ScratchDir::new("malformed");
    let path = dir.write("[limits\n");
    match UascConfig::load_from(&path) {
        Err(ConfigError::ParseFailed(reported, _)) => assert_eq!(reported, path),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn missing_file_yields_defaults() {
    let dir = ScratchDir::new("missing");
    let config = UascConfig::load_from(&dir.0.join("absent.toml")).unwrap();
    assert_eq!(config.network.listen_addr, "127.0.0.1:4840");
    assert!(config.validate().is_ok());
}
