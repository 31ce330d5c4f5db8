//! Startup and shutdown behaviour of the supervisor.

use rstest::rstest;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sw3_lib::Profile;
use sw3d::config::{CliArgs, ConfigStore, ServerMode, keys};
use sw3d::lifecycle::LifecycleSignal;
use sw3d::protocol::DrainHandler;
use sw3d::supervisor::{Collaborators, RunOutcome, StartupError, Supervisor};
use tempfile::tempdir;
use test_support::env_guard::EnvVarGuard;
use test_support::{
    FailingConnector, LogCapture, MemoryConnector, StalledConnector, eventually, temp_config,
};
use tokio::io::AsyncWriteExt;

const RUN_DEADLINE: Duration = Duration::from_secs(5);

fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

#[tokio::test]
#[serial_test::serial]
async fn first_run_writes_defaults_and_exits() {
    let _env = EnvVarGuard::clear_prefixed("SW3D_");
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    let connector = Arc::new(MemoryConnector::default());

    let supervisor = Supervisor::start(
        &CliArgs::for_config(&path),
        Collaborators::new(connector.clone(), Arc::new(DrainHandler)),
    )
    .await;

    assert_eq!(supervisor.lifecycle().get(), LifecycleSignal::NeedsReconfig);
    assert!(!supervisor.is_listening());
    assert!(!supervisor.has_console());
    assert!(supervisor.local_addr().is_none());
    assert_eq!(connector.connects(), 0);

    let lifecycle = supervisor.lifecycle().clone();
    let outcome = tokio::time::timeout(RUN_DEADLINE, supervisor.run())
        .await
        .expect("run returns");
    assert_eq!(outcome, RunOutcome::Reconfigure);
    assert_eq!(lifecycle.get(), LifecycleSignal::Terminate);

    let written = ConfigStore::from_file(&path).expect("defaults written");
    assert_eq!(written, ConfigStore::defaults());
    assert_eq!(written.get(keys::SERVER_PORT).expect("port"), "2093");
    assert_eq!(written.get(keys::SERVER_MODE).expect("mode"), "active");
}

#[tokio::test]
async fn unreachable_store_is_a_startup_error() {
    let tmp = tempdir().expect("tempdir");
    let path = temp_config().write_to(&tmp);
    let connector = Arc::new(FailingConnector::default());
    let logs = LogCapture::start("info");

    let supervisor = Supervisor::start(
        &CliArgs::for_config(&path),
        Collaborators::new(connector.clone(), Arc::new(DrainHandler)),
    )
    .await;

    assert_eq!(connector.attempts(), 1);
    assert_eq!(supervisor.lifecycle().get(), LifecycleSignal::StartupError);
    assert!(matches!(
        supervisor.startup_error(),
        Some(StartupError::Store(_))
    ));
    assert!(!supervisor.is_listening());
    assert!(supervisor.local_addr().is_none());

    let outcome = supervisor.run().await;
    assert_eq!(outcome, RunOutcome::StartupError);
    assert!(logs.contains("An error occurred during startup; the server will now shut down"));
    assert!(logs.contains("Due to a critical startup error, the server will now shut down"));
}

#[tokio::test]
async fn occupied_port_is_a_startup_error() {
    let blocker = tokio::net::TcpListener::bind("0.0.0.0:0")
        .await
        .expect("bind blocker");
    let port = blocker.local_addr().expect("addr").port();
    let tmp = tempdir().expect("tempdir");
    let mut cfg = temp_config();
    cfg.serverport = port;
    let path = cfg.write_to(&tmp);

    let supervisor = Supervisor::start(
        &CliArgs::for_config(&path),
        Collaborators::new(Arc::new(MemoryConnector::default()), Arc::new(DrainHandler)),
    )
    .await;

    assert!(matches!(
        supervisor.startup_error(),
        Some(StartupError::Bind { port: p, .. }) if *p == port
    ));
    assert!(!supervisor.is_listening());
    assert_eq!(supervisor.run().await, RunOutcome::StartupError);
}

#[tokio::test]
async fn malformed_config_is_a_startup_error() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "serverport = [unterminated").expect("write");

    let supervisor = Supervisor::start(
        &CliArgs::for_config(&path),
        Collaborators::new(Arc::new(MemoryConnector::default()), Arc::new(DrainHandler)),
    )
    .await;

    assert!(matches!(
        supervisor.startup_error(),
        Some(StartupError::Config(_))
    ));
    assert_eq!(supervisor.run().await, RunOutcome::StartupError);
}

#[tokio::test]
async fn daemon_serves_until_terminated() {
    let tmp = tempdir().expect("tempdir");
    let path = temp_config().write_to(&tmp);

    let supervisor = Supervisor::start(
        &CliArgs::for_config(&path),
        Collaborators::new(Arc::new(MemoryConnector::default()), Arc::new(DrainHandler)),
    )
    .await;

    assert_eq!(supervisor.lifecycle().get(), LifecycleSignal::Running);
    assert_eq!(supervisor.mode(), ServerMode::Daemon);
    assert!(supervisor.is_listening());
    assert!(!supervisor.has_console());
    let addr = loopback(supervisor.local_addr().expect("bound"));
    tokio::net::TcpStream::connect(addr)
        .await
        .expect("server accepts");

    let lifecycle = supervisor.lifecycle().clone();
    let run = tokio::spawn(supervisor.run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());

    lifecycle.terminate();
    let outcome = tokio::time::timeout(RUN_DEADLINE, run)
        .await
        .expect("run returns")
        .expect("join");
    assert_eq!(outcome, RunOutcome::Clean);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn console_lists_profiles_then_quits() {
    let tmp = tempdir().expect("tempdir");
    let path = temp_config().with_mode("active").write_to(&tmp);
    let connector = Arc::new(MemoryConnector::with_profiles(vec![
        Profile::new(1, "Anna", 6),
        Profile::new(2, "Bo", 11),
    ]));
    let logs = LogCapture::start("info");

    let supervisor = Supervisor::start(
        &CliArgs::for_config(&path),
        Collaborators::new(connector, Arc::new(DrainHandler))
            .with_console_input(&b"profiles\nquit\n"[..]),
    )
    .await;
    assert!(supervisor.has_console());

    let outcome = tokio::time::timeout(RUN_DEADLINE, supervisor.run())
        .await
        .expect("quit ends the run");
    assert_eq!(outcome, RunOutcome::Clean);

    let names: Vec<String> = logs
        .events()
        .iter()
        .filter(|e| e["fields"]["message"] == "Profile")
        .filter_map(|e| e["fields"]["name"].as_str().map(str::to_owned))
        .collect();
    assert_eq!(names, vec!["Anna", "Bo"]);
    assert!(logs.contains("Quit requested from the console"));

    let messages = logs.messages();
    let count = |wanted: &str| messages.iter().filter(|m| *m == wanted).count();
    assert_eq!(count("Shutting down the server"), 1);
    assert_eq!(count("Server shut down"), 1);
}

#[tokio::test]
async fn terminate_interrupts_stalled_console_command() {
    let tmp = tempdir().expect("tempdir");
    let path = temp_config().with_mode("active").write_to(&tmp);
    let (mut operator, input) = tokio::io::duplex(64);
    let logs = LogCapture::start("info");

    let supervisor = Supervisor::start(
        &CliArgs::for_config(&path),
        Collaborators::new(Arc::new(StalledConnector), Arc::new(DrainHandler))
            .with_console_input(tokio::io::BufReader::new(input)),
    )
    .await;
    let lifecycle = supervisor.lifecycle().clone();
    let run = tokio::spawn(supervisor.run());

    operator
        .write_all(b"profiles\n")
        .await
        .expect("write command");
    assert!(eventually(Duration::from_secs(2), || logs.contains("Command received")).await);
    assert!(!run.is_finished());

    lifecycle.terminate();
    let outcome = tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("run returns after terminate")
        .expect("join");
    assert_eq!(outcome, RunOutcome::Clean);
    assert!(logs.contains("Abandoning console command on shutdown"));
    assert!(logs.contains("Server shut down"));
}

#[tokio::test]
async fn closed_console_keeps_serving() {
    let tmp = tempdir().expect("tempdir");
    let path = temp_config().with_mode("active").write_to(&tmp);

    let supervisor = Supervisor::start(
        &CliArgs::for_config(&path),
        Collaborators::new(Arc::new(MemoryConnector::default()), Arc::new(DrainHandler))
            .with_console_input(&b""[..]),
    )
    .await;
    let lifecycle = supervisor.lifecycle().clone();
    let run = tokio::spawn(supervisor.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());
    lifecycle.terminate();
    let outcome = tokio::time::timeout(RUN_DEADLINE, run)
        .await
        .expect("run returns")
        .expect("join");
    assert_eq!(outcome, RunOutcome::Clean);
}

#[rstest]
#[case(Some(ServerMode::Active), true)]
#[case(Some(ServerMode::Daemon), false)]
#[case(None, false)]
#[tokio::test]
async fn cli_mode_overrides_file(#[case] mode: Option<ServerMode>, #[case] console: bool) {
    let tmp = tempdir().expect("tempdir");
    let path = temp_config().write_to(&tmp);
    let args = CliArgs {
        mode,
        ..CliArgs::for_config(&path)
    };

    let supervisor = Supervisor::start(
        &args,
        Collaborators::new(Arc::new(MemoryConnector::default()), Arc::new(DrainHandler))
            .with_console_input(&b""[..]),
    )
    .await;

    assert_eq!(supervisor.has_console(), console);
    supervisor.lifecycle().terminate();
    assert_eq!(supervisor.run().await, RunOutcome::Clean);
}
