//! BDD Tests for Vigil Core

use std::fs;
use std::path::PathBuf;

use cucumber::{given, then, when, World};
use vigil_core::*;

#[derive(Debug, World)]
#[world(init = Self::new)]
struct CoreWorld {
    root: tempfile::TempDir,
    overrides: IdentityOverrides,
    loaded: Option<Settings>,
    last_error: Option<VigilError>,
}

impl CoreWorld {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("temporary directory");
        fs::create_dir(root.path().join("conf.d")).expect("conf.d directory");
        Self {
            root,
            overrides: IdentityOverrides::default(),
            loaded: None,
            last_error: None,
        }
    }

    fn config_file(&self) -> PathBuf {
        self.root.path().join("config.json")
    }

    fn conf_d(&self) -> PathBuf {
        self.root.path().join("conf.d")
    }
}

#[given(expr = "a config file naming client {string} version {string}")]
async fn given_config_file(world: &mut CoreWorld, name: String, version: String) {
    let body = serde_json::json!({"client": {"name": name, "version": version}});
    fs::write(world.config_file(), body.to_string()).unwrap();
}

#[given(expr = "a config snippet {string} subscribing to {string}")]
async fn given_snippet(world: &mut CoreWorld, file: String, topic: String) {
    let body = serde_json::json!({"client": {"subscriptions": [topic]}});
    fs::write(world.conf_d().join(file), body.to_string()).unwrap();
}

#[given(expr = "the hostname is overridden with {string}")]
async fn given_hostname_override(world: &mut CoreWorld, hostname: String) {
    world.overrides.hostname = Some(hostname);
}

#[when("the settings are loaded")]
async fn when_settings_loaded(world: &mut CoreWorld) {
    let loader = SettingsLoader::new(world.config_file(), vec![world.conf_d()])
        .with_overrides(world.overrides.clone());
    match loader.load() {
        Ok(settings) => world.loaded = Some(settings),
        Err(err) => world.last_error = Some(err),
    }
}

#[then(expr = "the subscriptions should be {string}")]
async fn then_subscriptions(world: &mut CoreWorld, expected: String) {
    let settings = world.loaded.as_ref().expect("settings loaded");
    assert_eq!(settings.client.subscriptions.join(","), expected);
}

#[then(expr = "the queue name should be {string}")]
async fn then_queue_name(world: &mut CoreWorld, expected: String) {
    let settings = world.loaded.as_ref().expect("settings loaded");
    assert_eq!(settings.client.queue_name(), expected);
}

#[then(expr = "loading should fail with a {string}")]
async fn then_loading_fails(world: &mut CoreWorld, kind: String) {
    assert!(world.loaded.is_none());
    let error = world.last_error.as_ref().expect("an error");
    assert!(error.to_string().contains(&kind), "unexpected error: {error}");
}

#[tokio::main]
async fn main() {
    CoreWorld::cucumber().run_and_exit("tests/features").await;
}
