//! In-process wiring for end-to-end tests.
//!
//! The client endpoint's sender hands every packet straight to the server
//! endpoint its connection is routed to, runs that server's handler on
//! the resulting request and returns the reply.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use mrpc_multicast::{
    Endpoint, EndpointConfig, Inbound, ReliableSender, Request, SendOutcome,
};
use mrpc_transport::{codes, ConnHandle, ConnectionParams, Packet, Role, SecurityParams};

pub const CLIENT_ADDR: &str = "10.1.0.1:2432";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

pub fn client_addr() -> SocketAddr {
    CLIENT_ADDR.parse().unwrap()
}

pub type Handler = Arc<dyn Fn(&Request) -> (i32, Vec<u8>) + Send + Sync>;

/// Server-side sender. Servers only ever transmit replies.
#[derive(Default, Clone)]
pub struct ServerOut {
    pub transmitted: Arc<Mutex<Vec<Packet>>>,
}

#[async_trait]
impl ReliableSender for ServerOut {
    async fn send_reliably(
        &self,
        _peer: Option<SocketAddr>,
        _conn: ConnHandle,
        _packet: Packet,
    ) -> SendOutcome {
        SendOutcome::Timeout
    }

    async fn transmit(&self, _peer: Option<SocketAddr>, packet: Packet) {
        self.transmitted.lock().push(packet);
    }
}

pub struct Server {
    pub endpoint: Endpoint<ServerOut>,
    handler: Handler,
    pub seen: Mutex<Vec<Request>>,
}

impl Server {
    /// A server that answers every request with its own body.
    pub fn echo() -> Arc<Self> {
        Self::with_handler(Arc::new(|req: &Request| (codes::SUCCESS, req.body().to_vec())))
    }

    pub fn with_handler(handler: Handler) -> Arc<Self> {
        Arc::new(Self {
            endpoint: Endpoint::new(ServerOut::default(), EndpointConfig::new()),
            handler,
            seen: Mutex::new(Vec::new()),
        })
    }
}

/// Client-side sender routing each connection to one server.
#[derive(Clone)]
pub struct Loopback {
    client_addr: SocketAddr,
    routes: Arc<Mutex<HashMap<ConnHandle, Arc<Server>>>>,
    refused: Arc<Mutex<HashSet<ConnHandle>>>,
}

impl Loopback {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            client_addr,
            routes: Arc::default(),
            refused: Arc::default(),
        }
    }

    pub fn route(&self, conn: ConnHandle, server: Arc<Server>) {
        self.routes.lock().insert(conn, server);
    }

    /// Make the peer of `conn` NAK everything from now on.
    pub fn refuse(&self, conn: ConnHandle) {
        self.refused.lock().insert(conn);
    }
}

#[async_trait]
impl ReliableSender for Loopback {
    async fn send_reliably(
        &self,
        _peer: Option<SocketAddr>,
        conn: ConnHandle,
        packet: Packet,
    ) -> SendOutcome {
        if self.refused.lock().contains(&conn) {
            return SendOutcome::Naked;
        }
        let Some(server) = self.routes.lock().get(&conn).cloned() else {
            return SendOutcome::Timeout;
        };

        match server.endpoint.receive(packet.with_peer(self.client_addr)).await {
            Inbound::Request(request) => {
                let (code, body) = (server.handler)(&request);
                server.seen.lock().push(request.clone());
                match server.endpoint.reply(&request, code, &body).await {
                    Ok(reply) => SendOutcome::Arrived(reply),
                    Err(_) => SendOutcome::Timeout,
                }
            }
            Inbound::Replied { packet, .. } => SendOutcome::Arrived(packet),
            Inbound::Dropped(_) => SendOutcome::Timeout,
        }
    }

    async fn transmit(&self, _peer: Option<SocketAddr>, _packet: Packet) {}
}

pub fn client() -> Endpoint<Loopback> {
    Endpoint::new(Loopback::new(client_addr()), EndpointConfig::new())
}

/// Bind a client connection to `server`. Returns (client conn, server conn).
pub fn connect(
    client: &Endpoint<Loopback>,
    server: &Arc<Server>,
    security: SecurityParams,
) -> (ConnHandle, ConnHandle) {
    connect_with(client, server, security, 0)
}

pub fn connect_with(
    client: &Endpoint<Loopback>,
    server: &Arc<Server>,
    security: SecurityParams,
    subsys_id: u32,
) -> (ConnHandle, ConnHandle) {
    let server_conn = server
        .endpoint
        .open_connection(
            ConnectionParams::new(Role::Server, Some(client_addr()))
                .security(security)
                .subsys_id(subsys_id),
        )
        .unwrap();
    let client_conn = client
        .open_connection(
            ConnectionParams::new(Role::Client, None)
                .peer_handle(server_conn.0)
                .security(security)
                .subsys_id(subsys_id),
        )
        .unwrap();
    server
        .endpoint
        .set_peer_handle(server_conn, client_conn.0)
        .unwrap();
    client.sender().route(client_conn, server.clone());
    (client_conn, server_conn)
}
