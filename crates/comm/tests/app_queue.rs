//! Per-group serialization of network requests through the application
//! queue.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quartz_codec::Decoder;
use quartz_comm::{
    ApplicationHandler, ApplicationQueue, Comm, CommAddress, CommBuf, CommConfig, CommHeader,
    ConnectionHandlerFactory, DispatchHandler, DispatchHandlerSynchronizer, Event, EventKind,
};

/// Work item answering one request after simulated processing time.
struct EchoWork {
    comm: Comm,
    event: Arc<Event>,
    completions: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl ApplicationHandler for EchoWork {
    fn run(self: Box<Self>) {
        std::thread::sleep(Duration::from_millis(30));

        let seq = Decoder::new(&self.event.payload).read_u32().unwrap();
        self.completions
            .lock()
            .unwrap()
            .push((self.event.header.gid, seq));

        let header = CommHeader::initialize_from_request(&self.event.header);
        let mut response = CommBuf::new(header, 8);
        response.append_i32(0);
        response.append_u32(seq);
        self.comm
            .send_response(&CommAddress::Inet(self.event.addr.unwrap()), response)
            .ok();
    }

    fn group_id(&self) -> u32 {
        self.event.header.gid
    }

    fn is_urgent(&self) -> bool {
        self.event.header.is_urgent()
    }
}

#[test]
fn requests_with_same_gid_serialize_across_the_queue() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let comm = Comm::new(CommConfig { reactor_count: 2 }).expect("comm");
    let queue = Arc::new(ApplicationQueue::new(4));
    let completions: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut addr: SocketAddr = "127.0.0.1:38780".parse().unwrap();
    Comm::find_available_tcp_port(&mut addr);

    let server_comm = comm.clone();
    let server_queue = queue.clone();
    let server_completions = completions.clone();
    let factory: Arc<dyn ConnectionHandlerFactory> = Arc::new(move || {
        let comm = server_comm.clone();
        let queue = server_queue.clone();
        let completions = server_completions.clone();
        let handler: Arc<dyn DispatchHandler> = Arc::new(move |event: Arc<Event>| {
            if event.kind == EventKind::Message && event.header.is_request() {
                queue
                    .add(Box::new(EchoWork {
                        comm: comm.clone(),
                        event,
                        completions: completions.clone(),
                    }))
                    .ok();
            }
        });
        handler
    });
    comm.listen(&CommAddress::Inet(addr), factory, None)
        .expect("listen");

    let conn_events = DispatchHandlerSynchronizer::new();
    comm.connect(&CommAddress::Inet(addr), conn_events.clone())
        .expect("connect");
    assert_eq!(
        conn_events
            .wait_for_event(Duration::from_secs(2))
            .expect("established")
            .kind,
        EventKind::ConnectionEstablished
    );

    let replies = DispatchHandlerSynchronizer::new();
    for gid in [7u32, 8u32] {
        for seq in 0..5u32 {
            let mut header = CommHeader::new(1);
            header.gid = gid;
            let mut request = CommBuf::new(header, 4);
            request.append_u32(seq);
            comm.send_request(&CommAddress::Inet(addr), 10_000, request, replies.clone())
                .expect("send request");
        }
    }

    for _ in 0..10 {
        let event = replies
            .wait_for_event(Duration::from_secs(5))
            .expect("reply");
        assert_eq!(event.kind, EventKind::Message);
        assert!(event.error.is_none());
    }

    // Each group completed in submission order, never concurrently.
    let completions = completions.lock().unwrap();
    for wanted in [7u32, 8u32] {
        let order: Vec<u32> = completions
            .iter()
            .filter(|(gid, _)| *gid == wanted)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4], "group {wanted} ran out of order");
    }

    queue.join();
}
