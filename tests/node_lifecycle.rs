//! Restarting a member and the optional DNS front-end.

mod common;

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use common::resource;
use common::start_single;
use common::test_config;
use hickory_proto::op::Message;
use hickory_proto::op::MessageType;
use hickory_proto::op::Query;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::Name;
use hickory_proto::rr::RData;
use hickory_proto::rr::RecordType;
use registry::node::RegistryNode;
use registry::report::Report;
use registry::tree::NodeType;
use tempfile::TempDir;
use tokio::net::UdpSocket;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_keeps_tree_and_report_journal() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.common.persist_report = 1;

    let node = RegistryNode::start(&config, None).await.unwrap();
    node.tree().new_node("kept", "loda", NodeType::Leaf, "").await.unwrap();
    node.reports().agent_report(Report::new("h1", Utc::now())).unwrap();
    let addr = node.addr();
    node.shutdown().await.unwrap();

    // Same address, same raft identity.
    config.data.clusterbind = addr;
    let mut restarted = None;
    for _ in 0..50 {
        match RegistryNode::start(&config, None).await {
            Ok(node) => {
                restarted = Some(node);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    let node = restarted.expect("restart failed");
    assert!(node.tree().get_by_ns("kept.loda").await.is_ok());
    assert!(node.reports().get_report("h1").is_some());
    // Bootstrap on restart does not duplicate built-in groups or nodes.
    assert_eq!(node.tree().all_ns().await.unwrap().iter().filter(|ns| *ns == "pool.loda").count(), 1);

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dns_answers_from_registered_machines() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.dns.enable = true;
    config.dns.port = 0;
    config.dns.ipprefix = "10.".to_string();

    let node = RegistryNode::start(&config, None).await.unwrap();
    node.tree().new_node("web", "loda", NodeType::Leaf, "").await.unwrap();
    node.resources()
        .append_resource("web.loda", "machine", vec![
            resource(&[("hostname", "w1"), ("ip", "10.0.0.1,172.16.0.1")]),
            resource(&[("hostname", "w2"), ("ip", "10.0.0.2")]),
        ])
        .await
        .unwrap();

    let port = node.dns_addr().unwrap().port();
    let server = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let ask = |name: &str| {
        let mut msg = Message::new();
        msg.set_id(9).set_message_type(MessageType::Query);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        msg.to_vec().unwrap()
    };
    let mut buf = vec![0u8; 4096];

    client.send_to(&ask("web.loda."), server).await.unwrap();
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = Message::from_vec(&buf[..len]).unwrap();
    let mut ips: Vec<Ipv4Addr> = reply
        .answers()
        .iter()
        .filter_map(|rec| match rec.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .collect();
    ips.sort();
    assert_eq!(ips, vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]);

    client.send_to(&ask("example.com."), server).await.unwrap();
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Message::from_vec(&buf[..len]).unwrap().response_code(), ResponseCode::NXDomain);

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sessions_and_rate_limiter_are_wired() {
    use registry::auth::session::SessionStore;

    let dir = TempDir::new().unwrap();
    let node = start_single(&dir).await;
    let token = node.sessions().create("root");
    assert_eq!(node.sessions().get(&token).as_deref(), Some("root"));
    node.sessions().remove(&token);
    assert_eq!(node.sessions().get(&token), None);

    let ip = "10.0.0.1".parse().unwrap();
    assert!(node.limiter().allow(ip));
    assert_eq!(node.limiter().visitors(), 1);

    node.shutdown().await.unwrap();
}
