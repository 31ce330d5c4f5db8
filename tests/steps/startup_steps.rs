//! Behavioural steps for server startup.
#![expect(clippy::expect_used, reason = "simplify test failure output")]

use cucumber::{World, given, then, when};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use sw3d::config::{CliArgs, ConfigStore};
use sw3d::protocol::DrainHandler;
use sw3d::store::StoreConnector;
use sw3d::supervisor::{Collaborators, RunOutcome, Supervisor};
use test_support::{FailingConnector, MemoryConnector, temp_config};

#[derive(Debug, Default, World)]
pub struct StartupWorld {
    dir: Option<TempDir>,
    path: Option<PathBuf>,
    store_down: bool,
    listened: Option<bool>,
    outcome: Option<RunOutcome>,
}

impl StartupWorld {
    fn dir(&mut self) -> &TempDir {
        self.dir
            .get_or_insert_with(|| TempDir::new().expect("create temp dir"))
    }
}

#[given("an empty working directory")]
fn empty_working_directory(world: &mut StartupWorld) {
    let path = world.dir().path().join("config.toml");
    world.path = Some(path);
}

#[given("a valid configuration file")]
fn valid_configuration_file(world: &mut StartupWorld) {
    let path = temp_config().write_to(world.dir());
    world.path = Some(path);
}

#[given("the database is unreachable")]
fn database_unreachable(world: &mut StartupWorld) {
    world.store_down = true;
}

#[when("the server starts")]
async fn server_starts(world: &mut StartupWorld) {
    let path = world.path.clone().expect("config path set");
    let connector: Arc<dyn StoreConnector> = if world.store_down {
        Arc::new(FailingConnector::default())
    } else {
        Arc::new(MemoryConnector::default())
    };
    let supervisor = Supervisor::start(
        &CliArgs::for_config(path),
        Collaborators::new(connector, Arc::new(DrainHandler)),
    )
    .await;
    world.listened = Some(supervisor.is_listening());
    supervisor.lifecycle().terminate();
    world.outcome = Some(supervisor.run().await);
}

#[then(regex = r#"^the run ends with "(reconfigure|startup-error|clean)"$"#)]
fn run_ends_with(world: &mut StartupWorld, expected: String) {
    let expected = match expected.as_str() {
        "reconfigure" => RunOutcome::Reconfigure,
        "startup-error" => RunOutcome::StartupError,
        _ => RunOutcome::Clean,
    };
    assert_eq!(world.outcome, Some(expected));
}

#[then("the configuration file holds the defaults")]
fn configuration_holds_defaults(world: &mut StartupWorld) {
    let path = world.path.as_ref().expect("config path set");
    let written = ConfigStore::from_file(path).expect("config written");
    assert_eq!(written, ConfigStore::defaults());
}

#[then("the server never listened")]
fn never_listened(world: &mut StartupWorld) {
    assert_eq!(world.listened, Some(false));
}

#[then("the server was listening")]
fn was_listening(world: &mut StartupWorld) {
    assert_eq!(world.listened, Some(true));
}
