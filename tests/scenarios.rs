//! End-to-end scenarios from the engine's design document (S1-S7):
//! real non-blocking sockets over loopback, driven one `poll_once` at a time
//! exactly as a single-threaded event loop would, with no sleeping thread
//! standing in for the multiplexer.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use tcpros::header::{self, Key};
use tcpros::node::MatchStrictness;
use tcpros::wire;
use tcpros::{Node, NodeConfig};

const CHATTER_MD5: &str = "992ce8a1687cec8c8bd883ec73ca41d1";
const SUM_MD5: &str = "abcdef0123456789abcdef0123456789";

fn loopback() -> SocketAddr {
    SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn new_node(id: &str) -> Node {
    init_tracing();
    Node::new(id, NodeConfig::default()).expect("failed to create node")
}

/// Drives a set of nodes round-robin until `done` returns true or `timeout`
/// elapses. Returns whether `done` was satisfied.
fn pump_until(nodes: &mut [&mut Node], timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        for n in nodes.iter_mut() {
            n.poll_once();
        }
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn s1_publish_hello_world() {
    let mut publisher = new_node("/talker");
    let pub_addr = publisher.listen_tcpros(loopback()).unwrap();

    publisher
        .register_publisher(
            "/chatter",
            "std_msgs/String",
            CHATTER_MD5,
            "string data",
            Duration::from_millis(15),
            false,
            Box::new(|buf| {
                buf.extend_from_slice(b"hi");
                Ok(())
            }),
        )
        .unwrap();

    let mut subscriber = new_node("/listener");
    let received: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let received_cb = received.clone();
    let sub_idx = subscriber.register_subscriber(
        "/chatter",
        "std_msgs/String",
        CHATTER_MD5,
        8,
        Box::new(move |payload| {
            received_cb.borrow_mut().push(payload.to_vec());
            Ok(())
        }),
    );
    subscriber.connect_subscriber(sub_idx, pub_addr).unwrap();

    let ok = pump_until(&mut [&mut publisher, &mut subscriber], Duration::from_secs(2), || {
        received.borrow().len() >= 3
    });
    assert!(ok, "subscriber never received 3 messages");
    for payload in received.borrow().iter() {
        assert_eq!(payload.as_slice(), b"hi");
    }
}

#[test]
fn s2_md5_mismatch_blocks_publish() {
    let mut publisher = new_node("/talker");
    let pub_addr = publisher.listen_tcpros(loopback()).unwrap();
    publisher
        .register_publisher(
            "/chatter",
            "std_msgs/String",
            CHATTER_MD5,
            "string data",
            Duration::from_millis(15),
            false,
            Box::new(|buf| {
                buf.extend_from_slice(b"hi");
                Ok(())
            }),
        )
        .unwrap();

    let mut subscriber = new_node("/listener");
    let received: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
    let received_cb = received.clone();
    let sub_idx = subscriber.register_subscriber(
        "/chatter",
        "std_msgs/String",
        "00000000000000000000000000000000",
        8,
        Box::new(move |_payload| {
            *received_cb.borrow_mut() += 1;
            Ok(())
        }),
    );
    subscriber.connect_subscriber(sub_idx, pub_addr).unwrap();

    pump_until(&mut [&mut publisher, &mut subscriber], Duration::from_millis(300), || false);

    assert_eq!(*received.borrow(), 0, "mismatched subscriber must never receive a payload");
    assert!(publisher.take_error().is_some(), "publisher must surface the handshake mismatch");
}

#[test]
fn s3_sum_service() {
    let mut provider = new_node("/sum_server");
    let rpc_addr = provider.listen_rpcros(loopback()).unwrap();
    provider
        .register_service_provider(
            "/sum",
            "test_srvs/Sum",
            "test_srvs/SumRequest",
            "test_srvs/SumResponse",
            SUM_MD5,
            Box::new(|req, resp| {
                let a = i64::from_le_bytes(req[0..8].try_into().unwrap());
                let b = i64::from_le_bytes(req[8..16].try_into().unwrap());
                resp.extend_from_slice(&(a + b).to_le_bytes());
                Ok(())
            }),
        )
        .unwrap();

    let mut caller = new_node("/sum_client");
    let result: Rc<RefCell<Option<i64>>> = Rc::new(RefCell::new(None));
    let result_cb = result.clone();
    let caller_idx = caller.register_service_caller(
        "/sum",
        "test_srvs/Sum",
        "test_srvs/SumRequest",
        "test_srvs/SumResponse",
        SUM_MD5,
        Duration::from_millis(10),
        false,
        Box::new(move |req, resp, is_response| {
            if is_response {
                *result_cb.borrow_mut() = Some(i64::from_le_bytes(resp[0..8].try_into().unwrap()));
            } else {
                req.extend_from_slice(&7i64.to_le_bytes());
                req.extend_from_slice(&5i64.to_le_bytes());
            }
            Ok(())
        }),
    );
    caller.connect_service_caller(caller_idx, rpc_addr).unwrap();

    let ok = pump_until(&mut [&mut provider, &mut caller], Duration::from_secs(2), || result.borrow().is_some());
    assert!(ok, "service call never completed");
    assert_eq!(*result.borrow(), Some(12));
}

#[test]
fn s4_service_probe() {
    let mut provider = new_node("/sum_server");
    let rpc_addr = provider.listen_rpcros(loopback()).unwrap();
    provider
        .register_service_provider(
            "/sum",
            "test_srvs/Sum",
            "test_srvs/SumRequest",
            "test_srvs/SumResponse",
            SUM_MD5,
            Box::new(|_req, _resp| panic!("probe must never invoke the service callback")),
        )
        .unwrap();

    let probe_thread = thread::spawn(move || {
        let mut stream = StdTcpStream::connect(rpc_addr).unwrap();
        let header_bytes = header::encode_header(&[
            (Key::CallerId, "/prober"),
            (Key::Service, "/sum"),
            (Key::Md5sum, "*"),
            (Key::Probe, "1"),
        ]);
        stream.write_all(&header_bytes).unwrap();

        let mut resp = Vec::new();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        stream.read_to_end(&mut resp).unwrap();
        resp
    });

    // Drive only the provider; the probe client is a plain blocking socket.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !probe_thread.is_finished() && Instant::now() < deadline {
        provider.poll_once();
        thread::sleep(Duration::from_millis(1));
    }

    let resp = probe_thread.join().unwrap();
    let mut cursor = tcpros::wire::CursorBuf::new();
    cursor.extend_from_slice(&resp);
    let body = wire::read_frame(&mut cursor).expect("provision header frame");
    let provision = header::decode_header_body(body).unwrap();
    assert_eq!(provision.get(Key::Md5sum), Some(SUM_MD5));
    assert_eq!(provision.get(Key::Type), Some("test_srvs/Sum"));
    assert_eq!(provision.get(Key::RequestType), Some("test_srvs/SumRequest"));
    // the socket must be closed with nothing else on the wire
    assert_eq!(cursor.unread_len(), 0, "no request/response frames may follow a probe reply");
}

#[test]
fn s5_partial_handshake_arrival() {
    let mut publisher = new_node("/talker");
    let pub_addr = publisher.listen_tcpros(loopback()).unwrap();
    publisher
        .register_publisher(
            "/chatter",
            "std_msgs/String",
            CHATTER_MD5,
            "",
            Duration::from_millis(500),
            false,
            Box::new(|buf| {
                buf.extend_from_slice(b"hi");
                Ok(())
            }),
        )
        .unwrap();

    let header_bytes = header::encode_header(&[
        (Key::CallerId, "/listener"),
        (Key::Topic, "/chatter"),
        (Key::Md5sum, CHATTER_MD5),
        (Key::Type, "std_msgs/String"),
    ]);

    let sender = thread::spawn(move || {
        let mut stream = StdTcpStream::connect(pub_addr).unwrap();
        for byte in &header_bytes {
            stream.write_all(std::slice::from_ref(byte)).unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut resp = vec![0u8; 4096];
        let n = stream.read(&mut resp).unwrap();
        resp.truncate(n);
        resp
    });

    let deadline = Instant::now() + Duration::from_secs(3);
    while !sender.is_finished() && Instant::now() < deadline {
        publisher.poll_once();
        thread::sleep(Duration::from_millis(1));
    }

    let resp = sender.join().unwrap();
    let mut cursor = tcpros::wire::CursorBuf::new();
    cursor.extend_from_slice(&resp);
    let body = wire::read_frame(&mut cursor).expect("publication header arrived after the slow handshake");
    let publication = header::decode_header_body(body).unwrap();
    assert_eq!(publication.get(Key::Md5sum), Some(CHATTER_MD5));
}

#[test]
fn s6_fanout_conservation() {
    let mut publisher = new_node("/talker");
    let pub_addr = publisher.listen_tcpros(loopback()).unwrap();
    let counter = Rc::new(RefCell::new(0u32));
    let counter_cb = counter.clone();
    let pub_idx = publisher
        .register_publisher(
            "/chatter",
            "std_msgs/String",
            CHATTER_MD5,
            "",
            Duration::from_millis(40),
            false,
            Box::new(move |buf| {
                let mut c = counter_cb.borrow_mut();
                *c += 1;
                buf.extend_from_slice(format!("msg{}", *c).as_bytes());
                Ok(())
            }),
        )
        .unwrap();

    let mut sub_a = new_node("/listener_a");
    let received_a: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let received_a_cb = received_a.clone();
    let idx_a = sub_a.register_subscriber(
        "/chatter",
        "std_msgs/String",
        CHATTER_MD5,
        8,
        Box::new(move |payload| {
            received_a_cb.borrow_mut().push(payload.to_vec());
            Ok(())
        }),
    );
    sub_a.connect_subscriber(idx_a, pub_addr).unwrap();

    let mut sub_b = new_node("/listener_b");
    let received_b: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let received_b_cb = received_b.clone();
    let idx_b = sub_b.register_subscriber(
        "/chatter",
        "std_msgs/String",
        CHATTER_MD5,
        8,
        Box::new(move |payload| {
            received_b_cb.borrow_mut().push(payload.to_vec());
            Ok(())
        }),
    );
    sub_b.connect_subscriber(idx_b, pub_addr).unwrap();

    let done = pump_until(&mut [&mut publisher, &mut sub_a, &mut sub_b], Duration::from_secs(3), || {
        received_a.borrow().len() >= 3 && received_b.borrow().len() >= 3
    });
    assert!(done, "both subscribers must receive every fanout message");
    assert_eq!(received_a.borrow().len(), received_b.borrow().len());
    assert_eq!(*received_a.borrow(), *received_b.borrow(), "both subscribers see the same 3 messages, in order");
    assert_eq!(publisher.publisher_queue_len(pub_idx), Some(0), "queue must drain once both subscribers got it");
}

#[test]
fn s7_matlab_service_call_variant_is_accepted() {
    let mut provider = new_node("/sum_server");
    let rpc_addr = provider.listen_rpcros(loopback()).unwrap();
    provider
        .register_service_provider(
            "/sum",
            "test_srvs/Sum",
            "test_srvs/SumRequest",
            "test_srvs/SumResponse",
            SUM_MD5,
            Box::new(|req, resp| {
                let a = i64::from_le_bytes(req[0..8].try_into().unwrap());
                let b = i64::from_le_bytes(req[8..16].try_into().unwrap());
                resp.extend_from_slice(&(a + b).to_le_bytes());
                Ok(())
            }),
        )
        .unwrap();

    // The "matlab variant" omits `type` entirely; only callerid/service/md5sum
    // are required on the provider side.
    let header_bytes = header::encode_header(&[(Key::CallerId, "/matlab"), (Key::Service, "/sum"), (Key::Md5sum, SUM_MD5)]);

    let client = thread::spawn(move || {
        let mut stream = StdTcpStream::connect(rpc_addr).unwrap();
        stream.write_all(&header_bytes).unwrap();

        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut provision = vec![0u8; 4096];
        let n = stream.read(&mut provision).unwrap();
        provision.truncate(n);

        let mut request = Vec::new();
        wire::write_payload(&mut request, &[3i64.to_le_bytes(), 4i64.to_le_bytes()].concat());
        stream.write_all(&request).unwrap();

        let mut response = vec![0u8; 4096];
        let n = stream.read(&mut response).unwrap();
        response.truncate(n);
        response
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while !client.is_finished() && Instant::now() < deadline {
        provider.poll_once();
        thread::sleep(Duration::from_millis(1));
    }

    let response = client.join().unwrap();
    assert_eq!(response[0], 1, "ok byte must be 1");
    let len = u32::from_le_bytes(response[1..5].try_into().unwrap()) as usize;
    let sum = i64::from_le_bytes(response[5..5 + len].try_into().unwrap());
    assert_eq!(sum, 7);
}

#[test]
fn s8_subscriber_delivery_overflow_flag() {
    let mut publisher = new_node("/talker");
    let pub_addr = publisher.listen_tcpros(loopback()).unwrap();
    publisher
        .register_publisher(
            "/chatter",
            "std_msgs/String",
            CHATTER_MD5,
            "",
            Duration::from_millis(15),
            false,
            Box::new(|buf| {
                buf.extend_from_slice(b"hi");
                Ok(())
            }),
        )
        .unwrap();

    let mut subscriber = new_node("/listener");
    let received: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
    let received_cb = received.clone();
    // A zero-capacity delivery queue is always "full" the moment a payload
    // arrives; the callback still runs (spec §4.3 overflow edge case).
    let sub_idx = subscriber.register_subscriber(
        "/chatter",
        "std_msgs/String",
        CHATTER_MD5,
        0,
        Box::new(move |_payload| {
            *received_cb.borrow_mut() += 1;
            Ok(())
        }),
    );
    subscriber.connect_subscriber(sub_idx, pub_addr).unwrap();

    let ok = pump_until(&mut [&mut publisher, &mut subscriber], Duration::from_secs(2), || *received.borrow() >= 1);
    assert!(ok, "subscriber never received a message");
    assert_eq!(subscriber.subscriber_overflowed(sub_idx), Some(true));
}

#[test]
fn s7_strict_match_accepts_matching_topic_field() {
    let mut publisher = new_node("/talker");
    let pub_addr = publisher.listen_tcpros(loopback()).unwrap();
    publisher
        .register_publisher(
            "/chatter",
            "std_msgs/String",
            CHATTER_MD5,
            "",
            Duration::from_millis(500),
            false,
            Box::new(|buf| {
                buf.extend_from_slice(b"hi");
                Ok(())
            }),
        )
        .unwrap();

    let mut strict_subscriber =
        Node::new("/strict_listener", NodeConfig::default().with_match_strictness(MatchStrictness::Strict)).unwrap();
    let received = Rc::new(RefCell::new(0));
    let received_cb = received.clone();
    let sub_idx = strict_subscriber.register_subscriber(
        "/chatter",
        "std_msgs/String",
        CHATTER_MD5,
        8,
        Box::new(move |_| {
            *received_cb.borrow_mut() += 1;
            Ok(())
        }),
    );
    strict_subscriber.connect_subscriber(sub_idx, pub_addr).unwrap();

    // The publisher's publication header now carries `topic`, so this
    // exercises the common case head-on: a real match under strictness.
    let ok = pump_until(&mut [&mut publisher, &mut strict_subscriber], Duration::from_secs(2), || {
        *received.borrow() > 0
    });
    assert!(ok, "strict matching must accept a publisher whose `topic` matches the subscriber's");
}

#[test]
fn s7_strict_match_rejects_mismatched_topic_field() {
    let listener = StdTcpListener::bind(loopback()).unwrap();
    let fake_pub_addr = listener.local_addr().unwrap();

    let fake_publisher = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // Drain the subscriber's subscription header; its contents don't
        // matter for this scenario.
        let mut cursor = tcpros::wire::CursorBuf::new();
        let mut scratch = [0u8; 256];
        loop {
            let n = stream.read(&mut scratch).unwrap();
            cursor.extend_from_slice(&scratch[..n]);
            if wire::read_frame(&mut cursor).is_ok() {
                break;
            }
        }
        // Reply with a publication header whose `topic` does not match what
        // the subscriber is registered for.
        let publication = header::encode_header(&[
            (Key::CallerId, "/fake_talker"),
            (Key::Topic, "/not_chatter"),
            (Key::Md5sum, CHATTER_MD5),
            (Key::Type, "std_msgs/String"),
        ]);
        stream.write_all(&publication).unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let mut strict_subscriber =
        Node::new("/strict_listener", NodeConfig::default().with_match_strictness(MatchStrictness::Strict)).unwrap();
    let received = Rc::new(RefCell::new(0));
    let received_cb = received.clone();
    let sub_idx = strict_subscriber.register_subscriber(
        "/chatter",
        "std_msgs/String",
        CHATTER_MD5,
        8,
        Box::new(move |_| {
            *received_cb.borrow_mut() += 1;
            Ok(())
        }),
    );
    strict_subscriber.connect_subscriber(sub_idx, fake_pub_addr).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut observed_error = None;
    while observed_error.is_none() && Instant::now() < deadline {
        strict_subscriber.poll_once();
        observed_error = strict_subscriber.take_error();
        thread::sleep(Duration::from_millis(1));
    }
    fake_publisher.join().unwrap();

    assert!(
        matches!(observed_error, Some(tcpros::Error::Handshake(tcpros::HandshakeError::TopicMismatch(..)))),
        "expected a TopicMismatch error, got {observed_error:?}"
    );
    assert_eq!(*received.borrow(), 0, "a mismatched topic must never deliver a payload under strict matching");
}
