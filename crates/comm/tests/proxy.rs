//! Proxy map propagation from the authoritative node to a connected peer.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quartz_comm::{
    Comm, CommAddress, CommConfig, ConnectionHandlerFactory, DispatchHandler,
    DispatchHandlerSynchronizer, Event, EventKind,
};

fn test_comm() -> Comm {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Comm::new(CommConfig { reactor_count: 1 }).expect("comm construction")
}

#[test]
fn proxy_map_update_reaches_connected_peer() {
    let master = test_comm();
    let client = test_comm();

    let mut addr: SocketAddr = "127.0.0.1:38760".parse().unwrap();
    Comm::find_available_tcp_port(&mut addr);

    let factory: Arc<dyn ConnectionHandlerFactory> = Arc::new(|| {
        let handler: Arc<dyn DispatchHandler> = Arc::new(|_event: Arc<Event>| {});
        handler
    });
    master
        .listen(&CommAddress::Inet(addr), factory, None)
        .expect("listen");

    let events = DispatchHandlerSynchronizer::new();
    client
        .connect(&CommAddress::Inet(addr), events.clone())
        .expect("connect");
    let established = events
        .wait_for_event(Duration::from_secs(2))
        .expect("established");
    assert_eq!(established.kind, EventKind::ConnectionEstablished);

    // Nothing loaded yet on the client.
    assert!(!client.wait_for_proxy_load(Duration::from_millis(50)));

    // The master installs a binding and broadcasts the mapping; the update
    // propagates to server-side connections, which here includes the one
    // the client dialed in on.
    let rs_addr: SocketAddr = "10.1.2.3:38060".parse().unwrap();
    master
        .add_proxy("rs1", "node1.example", &rs_addr)
        .expect("add proxy");

    assert!(client.wait_for_proxy_load(Duration::from_secs(2)));
    let map = client.get_proxy_map();
    assert_eq!(map.get("rs1").map(|e| e.addr), Some(rs_addr));
    assert_eq!(map.get("rs1").map(|e| e.hostname.clone()), Some("node1.example".into()));
}

#[test]
fn proxy_load_times_out_without_master() {
    let comm = test_comm();
    assert!(!comm.wait_for_proxy_load(Duration::from_millis(100)));
}
