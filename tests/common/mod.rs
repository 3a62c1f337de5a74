//! Common utilities for QuickIM integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quickim::config::MIN_BCRYPT_COST;
use quickim::protocol::{LoginStatus, RegisterStatus};
use quickim::{ImClient, ImServer, InMemoryCredentialStore, ServerConfig, ServerContext};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A server running on an ephemeral localhost port
pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
    task: JoinHandle<quickim::Result<()>>,
}

impl TestServer {
    #[allow(dead_code)]
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start with a cheap bcrypt cost and let the test adjust the config
    pub async fn start_with<F>(adjust: F) -> Self
    where
        F: FnOnce(&mut ServerConfig),
    {
        let mut config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            bcrypt_cost: MIN_BCRYPT_COST,
            ..Default::default()
        };
        adjust(&mut config);

        let store = Arc::new(InMemoryCredentialStore::new(config.bcrypt_cost));
        let server = ImServer::bind(config, store).await.unwrap();
        let addr = server.local_addr().unwrap();
        let ctx = server.context();
        let shutdown = server.shutdown_token();
        let task = tokio::spawn(server.run());

        Self {
            addr,
            ctx,
            shutdown,
            task,
        }
    }

    pub async fn client(&self) -> ImClient {
        ImClient::connect(self.addr).await.unwrap()
    }

    /// Connect, register and log in
    #[allow(dead_code)]
    pub async fn user(&self, username: &str) -> ImClient {
        let mut client = self.client().await;
        let registered = client.register(username, "secret").await.unwrap();
        assert_eq!(registered.status, RegisterStatus::Ok, "{}", registered.message);
        let login = client.login(username, "secret").await.unwrap();
        assert_eq!(login.status, LoginStatus::Ok);
        client
    }

    /// Poll until `online_count` reaches `expected`
    #[allow(dead_code)]
    pub async fn wait_online(&self, expected: usize) {
        let registry = Arc::clone(&self.ctx.registry);
        tokio::time::timeout(TEST_TIMEOUT, async move {
            while registry.online_count().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("online count never reached {}", expected));
    }

    #[allow(dead_code)]
    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(TEST_TIMEOUT, self.task)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server failed");
    }
}

/// Make `owner` list `contact`
#[allow(dead_code)]
pub async fn befriend(owner: &mut ImClient, contact: &str) {
    let response = owner.add_contact(contact).await.unwrap();
    assert_eq!(response.status, quickim::protocol::ContactActionStatus::Ok);
}
