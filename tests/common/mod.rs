#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use relay::{ClientConfig, CloseReason, Hub, Inbox, Message, Server, ServerConfig, Session, SessionEvent};

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(200);

pub struct TestHub {
    pub hub: Arc<Hub>,
    pub addr: SocketAddr,
    pub accept: JoinHandle<relay::Result<()>>,
}

pub async fn start_hub() -> TestHub {
    let server = Server::bind(ServerConfig::new("127.0.0.1", 0))
        .await
        .expect("bind hub");
    let addr = server.local_addr().expect("local addr");
    let hub = server.hub();
    let accept = tokio::spawn(server.run());
    TestHub { hub, addr, accept }
}

pub async fn connect(addr: SocketAddr) -> (Session, Inbox) {
    Session::connect(&ClientConfig::new("127.0.0.1", addr.port()))
        .await
        .expect("connect to hub")
}

/// Connects and waits until the hub has registered the new peer.
pub async fn join(hub: &TestHub) -> (Session, Inbox) {
    let expected = hub.hub.peer_count() + 1;
    let client = connect(hub.addr).await;
    settle(|| hub.hub.peer_count() == expected).await;
    client
}

pub async fn next_message(inbox: &mut Inbox) -> Message {
    match timeout(WAIT, inbox.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("inbox closed early")
    {
        SessionEvent::Message(message) => message,
        SessionEvent::Closed(reason) => panic!("session closed while waiting: {reason}"),
    }
}

pub async fn next_close(inbox: &mut Inbox) -> CloseReason {
    loop {
        match timeout(WAIT, inbox.recv())
            .await
            .expect("timed out waiting for close")
            .expect("inbox closed without a close event")
        {
            SessionEvent::Message(_) => continue,
            SessionEvent::Closed(reason) => return reason,
        }
    }
}

pub async fn assert_quiet(inbox: &mut Inbox) {
    if let Ok(Some(event)) = timeout(QUIET, inbox.recv()).await {
        panic!("expected no traffic, got {event:?}");
    }
}

pub async fn settle(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}
