use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mgtd::control::{
    Backoff, ChannelSetup, DigestKind, DispatchHandle, Dispatcher, ListenChannel, Reply,
    ResponseDigest, SessionContext, Status, UplinkChannel, challenge_from_reply,
};
use mgtd::params::collect_params;
use mgtd::secret::Secret;
use mgtd::supervisor::spawn_supervisor;
use mgtd::symbols::SymbolTable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// A dispatcher with no worker program, plus the pieces channels need.
fn start_dispatcher() -> (DispatchHandle, watch::Sender<bool>) {
    let (supervisor, status_rx) = spawn_supervisor(None);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (dispatcher, handle) = Dispatcher::new(
        collect_params().expect("catalogue registers"),
        Arc::new(SymbolTable::default()),
        supervisor,
        status_rx,
        shutdown_rx,
        "banner",
    );
    tokio::spawn(dispatcher.run());
    (handle, shutdown_tx)
}

fn setup(dispatch: DispatchHandle, secret: &[u8], failure_limit: u32) -> ChannelSetup {
    ChannelSetup {
        ctx: Arc::new(SessionContext {
            secret: Arc::new(Secret::new(secret.to_vec())),
            digest: DigestKind::Sandwich.build(),
            failure_limit,
            banner: "welcome to mgtd".to_string(),
        }),
        dispatch,
        line_limit: 256,
    }
}

async fn listen(setup: ChannelSetup) -> SocketAddr {
    let channel = ListenChannel::bind("127.0.0.1:0").await.unwrap();
    let addr = channel.local_addrs()[0];
    channel.spawn(setup);
    addr
}

/// Minimal admin client.
struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self::from_stream(TcpStream::connect(addr).await.unwrap())
    }

    fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn reply(&mut self) -> Option<Reply> {
        loop {
            if let Some((reply, used)) = Reply::decode(&self.buf) {
                self.buf.drain(..used);
                return Some(reply);
            }
            let mut chunk = [0u8; 4096];
            let n = timeout(WAIT, self.stream.read(&mut chunk))
                .await
                .expect("reply in time")
                .unwrap();
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send(&mut self, line: &str) -> Reply {
        self.stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
        self.reply().await.expect("server replied")
    }
}

#[tokio::test]
async fn test_commands_without_secret() {
    let (dispatch, _shutdown) = start_dispatcher();
    let addr = listen(setup(dispatch, b"", 3)).await;

    let mut client = Client::connect(addr).await;
    let greeting = client.reply().await.unwrap();
    assert_eq!(greeting.status, Status::Ok);
    assert!(greeting.body.contains("welcome to mgtd"));

    let pong = client.send("ping").await;
    assert_eq!(pong.status, Status::Ok);
    assert!(pong.body.starts_with("PONG "));

    assert_eq!(client.send("param.set default_ttl 60").await.status, Status::Ok);
    let show = client.send("param.show default_ttl").await;
    assert_eq!(show.status, Status::Ok);
    assert!(show.body.contains("60.000"));

    let bad = client.send("param.set default_ttl soon").await;
    assert_eq!(bad.status, Status::Param);

    assert_eq!(client.send("no.such.command").await.status, Status::Unknown);

    // No worker program in this setup.
    assert_eq!(client.send("start").await.status, Status::Cant);

    let bye = client.send("quit").await;
    assert_eq!(bye.status, Status::Close);
    assert!(client.reply().await.is_none());
}

#[tokio::test]
async fn test_challenge_response_authentication() {
    let secret = b"s3cret\n";
    let (dispatch, _shutdown) = start_dispatcher();
    let addr = listen(setup(dispatch, secret, 3)).await;

    let mut client = Client::connect(addr).await;
    let first = client.reply().await.unwrap();
    assert_eq!(first.status, Status::Auth);
    let challenge = challenge_from_reply(&first).unwrap();

    // Gated commands restate the outstanding challenge.
    let gated = client.send("param.show").await;
    assert_eq!(gated.status, Status::Auth);
    assert_eq!(challenge_from_reply(&gated).unwrap(), challenge);

    // Pre-auth commands still work.
    assert_eq!(client.send("ping").await.status, Status::Ok);

    // A wrong answer burns the challenge.
    let retry = client.send(&format!("auth {}", "0".repeat(64))).await;
    assert_eq!(retry.status, Status::Auth);
    let fresh = challenge_from_reply(&retry).unwrap();
    assert_ne!(fresh, challenge);

    let digest = DigestKind::Sandwich.build();
    let answer = digest.compute(&fresh, &Secret::new(secret.to_vec()));
    let ok = client.send(&format!("auth {}", answer.to_uppercase())).await;
    assert_eq!(ok.status, Status::Ok);
    assert!(ok.body.contains("welcome to mgtd"));

    let status = client.send("status").await;
    assert_eq!(status.status, Status::Ok);
    assert!(status.body.contains("stopped"));
}

#[tokio::test]
async fn test_failure_limit_closes_channel() {
    let (dispatch, _shutdown) = start_dispatcher();
    let addr = listen(setup(dispatch, b"secret", 2)).await;

    let mut client = Client::connect(addr).await;
    assert_eq!(client.reply().await.unwrap().status, Status::Auth);

    assert_eq!(client.send("auth nope").await.status, Status::Auth);
    let closing = client.send("auth nope").await;
    assert_eq!(closing.status, Status::Close);
    assert!(client.reply().await.is_none());

    // Other sessions are unaffected.
    let mut other = Client::connect(addr).await;
    assert_eq!(other.reply().await.unwrap().status, Status::Auth);
}

#[tokio::test]
async fn test_overlong_line_closes_channel() {
    let (dispatch, _shutdown) = start_dispatcher();
    let addr = listen(setup(dispatch, b"", 3)).await;

    let mut client = Client::connect(addr).await;
    client.reply().await.unwrap();

    let long = format!("param.show {}", "x".repeat(400));
    let reply = client.send(&long).await;
    assert_eq!(reply.status, Status::Close);
    assert!(client.reply().await.is_none());
}

#[tokio::test]
async fn test_uplink_redials_until_controller_appears() {
    // Reserve a port, then free it so the first dials are refused.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let target = format!("127.0.0.1:{port}");

    let (dispatch, _shutdown) = start_dispatcher();
    let backoff = Backoff::new(Duration::from_millis(20), Duration::from_millis(80));
    let uplink = UplinkChannel::new(target.clone(), backoff).spawn(setup(dispatch, b"", 3));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let controller = TcpListener::bind(&target).await.unwrap();

    let (stream, _) = timeout(WAIT, controller.accept())
        .await
        .expect("uplink redialed")
        .unwrap();
    let mut client = Client::from_stream(stream);
    assert_eq!(client.reply().await.unwrap().status, Status::Ok);
    assert!(client.send("ping").await.body.starts_with("PONG"));

    // Closing the session makes the uplink dial again.
    drop(client);
    let (again, _) = timeout(WAIT, controller.accept())
        .await
        .expect("uplink redialed after close")
        .unwrap();
    let mut client = Client::from_stream(again);
    assert_eq!(client.reply().await.unwrap().status, Status::Ok);

    uplink.abort();
}
