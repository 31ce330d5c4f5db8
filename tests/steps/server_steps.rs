//! Behavioural steps for a running server.
#![expect(clippy::expect_used, reason = "simplify test failure output")]

use cucumber::{World, given, then, when};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use sw3d::config::CliArgs;
use sw3d::connections::ActiveConnections;
use sw3d::lifecycle::Lifecycle;
use sw3d::protocol::ConnectionHandler;
use sw3d::supervisor::{Collaborators, RunOutcome, Supervisor};
use test_support::{GatedHandler, MemoryConnector, eventually, temp_config};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default, World)]
pub struct ServerWorld {
    dir: Option<TempDir>,
    handler: Arc<GatedHandler>,
    addr: Option<SocketAddr>,
    lifecycle: Option<Lifecycle>,
    connections: Option<ActiveConnections>,
    run: Option<JoinHandle<RunOutcome>>,
    clients: Vec<TcpStream>,
    operator: Option<DuplexStream>,
}

impl std::fmt::Debug for ServerWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerWorld")
            .field("addr", &self.addr)
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl ServerWorld {
    async fn launch(&mut self, mode: &str, collaborators: Collaborators) {
        let dir = TempDir::new().expect("tempdir");
        let path = temp_config().with_mode(mode).write_to(&dir);
        let supervisor = Supervisor::start(&CliArgs::for_config(path), collaborators).await;
        let port = supervisor.local_addr().expect("server bound").port();
        self.addr = Some(SocketAddr::from(([127, 0, 0, 1], port)));
        self.lifecycle = Some(supervisor.lifecycle().clone());
        self.connections = Some(supervisor.connections().clone());
        self.run = Some(tokio::spawn(supervisor.run()));
        self.dir = Some(dir);
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            Arc::new(MemoryConnector::default()),
            Arc::clone(&self.handler) as Arc<dyn ConnectionHandler>,
        )
    }
}

#[given("a running daemon")]
async fn running_daemon(world: &mut ServerWorld) {
    let collaborators = world.collaborators();
    world.launch("daemon", collaborators).await;
}

#[given("a running server with a console")]
async fn running_server_with_console(world: &mut ServerWorld) {
    let (operator, input) = tokio::io::duplex(256);
    let collaborators = world
        .collaborators()
        .with_console_input(BufReader::new(input));
    world.operator = Some(operator);
    world.launch("active", collaborators).await;
}

#[when(regex = r"^(?:a|another) client connects$")]
async fn client_connects(world: &mut ServerWorld) {
    let addr = world.addr.expect("server running");
    let client = TcpStream::connect(addr).await.expect("connect");
    world.clients.push(client);
}

#[when("the clients disconnect")]
async fn clients_disconnect(world: &mut ServerWorld) {
    for mut client in world.clients.drain(..) {
        client.shutdown().await.expect("shutdown");
    }
    world.handler.release();
}

#[then(regex = r"^(\d+) connections? (?:is|are) active$")]
async fn connections_active(world: &mut ServerWorld, expected: usize) {
    let connections = world.connections.clone().expect("server running");
    assert!(
        eventually(WAIT, || connections.len() == expected).await,
        "expected {expected} active connections, found {}",
        connections.len()
    );
}

#[when(regex = r#"^the operator enters "(.+)"$"#)]
async fn operator_enters(world: &mut ServerWorld, command: String) {
    let operator = world.operator.as_mut().expect("console attached");
    operator
        .write_all(format!("{command}\n").as_bytes())
        .await
        .expect("write command");
}

#[when("the server is terminated")]
fn server_terminated(world: &mut ServerWorld) {
    world.lifecycle.as_ref().expect("server running").terminate();
}

#[then("the server is still running")]
async fn still_running(world: &mut ServerWorld) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    let run = world.run.as_ref().expect("server running");
    assert!(!run.is_finished());
}

#[then("the run ends cleanly")]
async fn run_ends_cleanly(world: &mut ServerWorld) {
    let run = world.run.take().expect("server running");
    let outcome = tokio::time::timeout(WAIT * 2, run)
        .await
        .expect("run finishes")
        .expect("join");
    assert_eq!(outcome, RunOutcome::Clean);
    let addr = world.addr.expect("server ran");
    assert!(TcpStream::connect(addr).await.is_err());
}
