//! End-to-end cluster tests: runs a full replica cluster against a UDP hub
//! that emulates the shared datagram transport, and drives it with a client
//! that follows redirects.

use quorumkv::encoding::Value as _;
use quorumkv::raft::{Envelope, Message, BROADCAST};
use quorumkv::{KvStore, Server};

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

/// Overall deadline for cluster convergence.
const TIMEOUT: Duration = Duration::from_secs(10);

/// How long the client waits for a response before retrying.
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Runs a UDP hub emulating the shared transport: datagrams are forwarded by
/// destination id, with "FFFF" fanned out to all known endpoints except the
/// sender. Endpoints are learned from the src id of inbound datagrams (each
/// replica announces itself with a hello at startup). Returns the hub port.
fn spawn_hub() -> u16 {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).expect("hub bind failed");
    let port = socket.local_addr().expect("no local addr").port();
    std::thread::spawn(move || {
        let mut endpoints: HashMap<String, SocketAddr> = HashMap::new();
        let mut buf = vec![0; 65535];
        loop {
            let Ok((len, addr)) = socket.recv_from(&mut buf) else { continue };
            let Ok(msg) = serde_json::from_slice::<serde_json::Value>(&buf[..len]) else {
                continue;
            };
            let (Some(src), Some(dst)) = (msg["src"].as_str(), msg["dst"].as_str()) else {
                continue;
            };
            endpoints.insert(src.to_string(), addr);
            if dst == BROADCAST {
                for (id, endpoint) in &endpoints {
                    if id != src {
                        let _ = socket.send_to(&buf[..len], endpoint);
                    }
                }
            } else if let Some(endpoint) = endpoints.get(dst) {
                let _ = socket.send_to(&buf[..len], endpoint);
            }
        }
    });
    port
}

/// Spawns a replica server for each id, all connected to the hub port.
fn spawn_cluster(port: u16, ids: &[&str]) {
    for id in ids {
        let id = id.to_string();
        let peers = ids.iter().map(|p| p.to_string()).filter(|p| *p != id).collect();
        let server =
            Server::new(id, peers, port, Box::new(KvStore::new())).expect("server failed");
        std::thread::spawn(move || server.serve().expect("server exited"));
    }
}

/// A test client speaking the wire protocol, retrying against the believed
/// leader on redirects.
struct Client {
    socket: UdpSocket,
    id: String,
    ids: Vec<String>,
    leader: Option<String>,
    seq: u64,
}

impl Client {
    fn new(port: u16, ids: &[&str]) -> Self {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).expect("client bind failed");
        socket.connect(("127.0.0.1", port)).expect("client connect failed");
        socket.set_read_timeout(Some(RETRY_INTERVAL)).expect("read timeout failed");
        Self {
            socket,
            id: "cl00".into(),
            ids: ids.iter().map(|id| id.to_string()).collect(),
            leader: None,
            seq: 0,
        }
    }

    /// Sends a request message to the given replica.
    fn send(&self, dst: &str, message: Message) {
        let envelope = Envelope {
            src: self.id.clone(),
            dst: dst.into(),
            leader: self.leader.clone().unwrap_or_else(|| BROADCAST.into()),
            message,
        };
        let bytes = envelope.encode().expect("encode failed");
        self.socket.send(&bytes).expect("send failed");
    }

    /// Receives the response with the given correlation id, or None on
    /// timeout. Unrelated datagrams are discarded.
    fn receive(&self, mid: &str) -> Option<Envelope> {
        let deadline = Instant::now() + RETRY_INTERVAL;
        let mut buf = vec![0; 65535];
        while Instant::now() < deadline {
            let Ok(len) = self.socket.recv(&mut buf) else { return None };
            let Ok(envelope) = Envelope::decode(&buf[..len]) else { continue };
            let found = match &envelope.message {
                Message::Ok { mid: m, .. }
                | Message::Fail { mid: m, .. }
                | Message::Redirect { mid: m, .. } => m == mid,
                _ => false,
            };
            if found && envelope.dst == self.id {
                return Some(envelope);
            }
        }
        None
    }

    /// Executes a request against the cluster, following redirects and
    /// retrying failures until the deadline. Returns the final ok response.
    fn execute(&mut self, make: impl Fn(String) -> Message) -> Envelope {
        let deadline = Instant::now() + TIMEOUT;
        let mut target = 0;
        while Instant::now() < deadline {
            self.seq += 1;
            let mid = format!("m{:08}", self.seq);
            let dst = self
                .leader
                .clone()
                .unwrap_or_else(|| self.ids[target % self.ids.len()].clone());
            self.send(&dst, make(mid.clone()));

            match self.receive(&mid) {
                Some(envelope) => match &envelope.message {
                    Message::Ok { .. } => {
                        self.leader = Some(envelope.src.clone());
                        return envelope;
                    }
                    Message::Redirect { .. } => {
                        if envelope.leader != BROADCAST {
                            self.leader = Some(envelope.leader.clone());
                        } else {
                            self.leader = None;
                            target += 1;
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                    Message::Fail { .. } => {
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    _ => {}
                },
                None => {
                    // No response; try another replica.
                    self.leader = None;
                    target += 1;
                }
            }
        }
        panic!("request timed out after {TIMEOUT:?}");
    }

    /// Puts a key/value pair, waiting for an ok.
    fn put(&mut self, key: &str, value: &str) {
        let (key, value) = (key.to_string(), value.to_string());
        self.execute(|mid| Message::Put {
            key: key.clone(),
            value: value.clone(),
            mid,
            extra: Default::default(),
        });
    }

    /// Gets a key, waiting for an ok and returning its value.
    fn get(&mut self, key: &str) -> String {
        let key = key.to_string();
        let response =
            self.execute(|mid| Message::Get { key: key.clone(), mid, extra: Default::default() });
        match response.message {
            Message::Ok { value, .. } => value.expect("get response without value"),
            message => panic!("unexpected response {message:?}"),
        }
    }
}

/// A cluster elects a leader and serves puts and gets end-to-end, including
/// overwrites and reads of absent keys.
#[test]
fn cluster_serves_puts_and_gets() {
    let ids = ["0000", "0001", "0002"];
    let port = spawn_hub();
    spawn_cluster(port, &ids);
    let mut client = Client::new(port, &ids);

    client.put("k", "v1");
    assert_eq!(client.get("k"), "v1");

    // Overwrites take effect.
    client.put("k", "v2");
    assert_eq!(client.get("k"), "v2");

    // An absent key reads as the empty string.
    assert_eq!(client.get("missing"), "");

    // Multiple keys replicate independently.
    for i in 0..10 {
        client.put(&format!("key{i}"), &format!("value{i}"));
    }
    for i in 0..10 {
        assert_eq!(client.get(&format!("key{i}")), format!("value{i}"));
    }
}

/// Non-leader replicas redirect clients to the leader.
#[test]
fn followers_redirect_to_leader() {
    let ids = ["0100", "0101", "0102"];
    let port = spawn_hub();
    spawn_cluster(port, &ids);
    let mut client = Client::new(port, &ids);

    // Find the leader by executing a put.
    client.put("k", "v");
    let leader = client.leader.clone().expect("no leader learned");

    // Every other replica answers reads with a redirect to it.
    for id in ids.iter().filter(|id| **id != leader) {
        let mid = format!("redir-{id}");
        client.send(id, Message::Get {
            key: "k".into(),
            mid: mid.clone(),
            extra: Default::default(),
        });
        let response = client.receive(&mid).expect("no response from follower");
        assert!(
            matches!(response.message, Message::Redirect { .. }),
            "expected redirect, got {:?}",
            response.message
        );
        assert_eq!(response.leader, leader);
    }
}
