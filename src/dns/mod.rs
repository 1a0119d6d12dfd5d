//! DNS front-end.
//!
//! Answers `A` queries for names under the configured zone. The labels in
//! front of the zone name a node: `api.web.loda` resolves to the `ip`
//! properties of the machines under `api.web.loda`. Addresses are
//! deduplicated and filtered by the configured prefix. Answers are cached
//! per domain until the next purge.
//!
//! ```text
//! UDP packet -> DnsServer -> DnsResolver::answer -> ResourceService
//! ```

mod server;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use hickory_proto::op::Message;
use hickory_proto::op::MessageType;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RData;
use hickory_proto::rr::Record;
use hickory_proto::rr::RecordType;
use hickory_proto::rr::rdata::A;
use parking_lot::Mutex;
use tracing::debug;
use tracing::trace;

pub use self::server::DnsServer;
use crate::constants::DNS_TTL;
use crate::constants::IP_PROPERTY;
use crate::constants::RES_MACHINE;
use crate::constants::ROOT_NAME;
use crate::error::RegistryError;
use crate::error::Result;
use crate::model::ResourceService;

/// Splits a comma separated `ip` property into addresses, skipping anything
/// that is not an IPv4 address.
pub fn parse_ips(value: &str) -> impl Iterator<Item = Ipv4Addr> + '_ {
    value.split(',').filter_map(|s| s.trim().parse().ok())
}

pub struct DnsResolver {
    resources: Arc<ResourceService>,
    zone: String,
    ip_prefix: String,
    cache: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
}

impl DnsResolver {
    pub fn new(resources: Arc<ResourceService>, zone: &str, ip_prefix: &str) -> Self {
        Self {
            resources,
            zone: zone.trim_end_matches('.').to_ascii_lowercase(),
            ip_prefix: ip_prefix.to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// NS named by `domain`, or `None` when the domain is outside the zone.
    pub fn domain_to_ns(&self, domain: &str) -> Option<String> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if domain == self.zone {
            return Some(ROOT_NAME.to_string());
        }
        let labels = domain.strip_suffix(&self.zone)?.strip_suffix('.')?;
        if labels.is_empty() {
            return None;
        }
        Some(format!("{labels}.{ROOT_NAME}"))
    }

    /// Addresses for `domain`. `None` means the name does not exist.
    pub async fn resolve(&self, domain: &str) -> Result<Option<Vec<Ipv4Addr>>> {
        let Some(ns) = self.domain_to_ns(domain) else {
            return Ok(None);
        };
        if let Some(hit) = self.cache.lock().get(&ns) {
            trace!(%ns, "dns cache hit");
            return Ok(Some(hit.clone()));
        }

        let machines = match self.resources.get_resource_list(&ns, RES_MACHINE).await {
            Ok(machines) => machines,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut ips = Vec::new();
        for machine in &machines {
            let Some(value) = machine.get(IP_PROPERTY) else {
                continue;
            };
            for ip in parse_ips(value) {
                if ip.to_string().starts_with(&self.ip_prefix) && !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
        self.cache.lock().insert(ns, ips.clone());
        Ok(Some(ips))
    }

    pub fn purge_cache(&self) -> usize {
        let mut cache = self.cache.lock();
        let n = cache.len();
        cache.clear();
        n
    }

    /// Builds the response to one request.
    ///
    /// Names outside the zone or naming no node get `NXDOMAIN`. Queries for
    /// other record types get an empty answer.
    pub async fn answer(&self, request: &Message) -> Message {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_authoritative(true);
        response.add_queries(request.queries().to_vec());

        let mut code = ResponseCode::NoError;
        for query in request.queries() {
            let name = query.name();
            let domain = name.to_ascii();
            match self.resolve(&domain).await {
                Ok(None) => code = ResponseCode::NXDomain,
                Ok(Some(ips)) if query.query_type() == RecordType::A => {
                    for ip in ips {
                        response.add_answer(Record::from_rdata(name.clone(), DNS_TTL, RData::A(A(ip))));
                    }
                }
                Ok(Some(_)) => {}
                Err(err) => {
                    debug!(%domain, error = %err, "dns lookup failed");
                    code = ResponseCode::ServFail;
                }
            }
        }
        response.set_response_code(code);
        response
    }

    /// Decodes a packet, answers it, and encodes the response.
    pub async fn handle_packet(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let request =
            Message::from_vec(packet).map_err(|e| RegistryError::invalid_format(format!("dns request: {e}")))?;
        let response = self.answer(&request).await;
        response
            .to_vec()
            .map_err(|e| RegistryError::invalid_format(format!("dns response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;

    use super::*;
    use crate::resource::Resource;
    use crate::store::MemoryStore;
    use crate::tree::NodeTree;
    use crate::tree::NodeType;

    fn machine(host: &str, ip: &str) -> Resource {
        [("hostname", host), ("ip", ip)]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn resolver(zone: &str, prefix: &str) -> DnsResolver {
        let tree = Arc::new(NodeTree::new(Arc::new(MemoryStore::new())));
        tree.init().await.unwrap();
        tree.new_node("web", "loda", NodeType::NonLeaf, "").await.unwrap();
        tree.new_node("api", "web.loda", NodeType::Leaf, "").await.unwrap();
        let resources = Arc::new(ResourceService::new(tree));
        resources
            .append_resource("api.web.loda", "machine", vec![
                machine("a", "10.0.0.1,192.168.1.1"),
                machine("b", "10.0.0.2"),
                machine("c", "10.0.0.1"),
            ])
            .await
            .unwrap();
        DnsResolver::new(resources, zone, prefix)
    }

    fn request(name: &str, record_type: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(42).set_message_type(MessageType::Query).set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), record_type));
        msg
    }

    #[test]
    fn test_parse_ips() {
        let ips: Vec<Ipv4Addr> = parse_ips(" 10.0.0.1 ,junk,10.0.0.2").collect();
        assert_eq!(ips, vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]);
    }

    #[tokio::test]
    async fn test_domain_to_ns() {
        let r = resolver("loda", "").await;
        assert_eq!(r.domain_to_ns("api.web.loda.").as_deref(), Some("api.web.loda"));
        assert_eq!(r.domain_to_ns("API.Web.loda").as_deref(), Some("api.web.loda"));
        assert_eq!(r.domain_to_ns("loda").as_deref(), Some("loda"));
        assert_eq!(r.domain_to_ns("example.com"), None);
        assert_eq!(r.domain_to_ns("xloda"), None);

        let r = resolver("loda.example.com", "").await;
        assert_eq!(r.domain_to_ns("api.web.loda.example.com").as_deref(), Some("api.web.loda"));
    }

    #[tokio::test]
    async fn test_resolve_dedupes_and_filters() {
        let r = resolver("loda", "10.").await;
        let ips = r.resolve("api.web.loda").await.unwrap().unwrap();
        assert_eq!(ips, vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]);
        // Non-leaf resolves to every leaf below it.
        assert_eq!(r.resolve("web.loda").await.unwrap().unwrap().len(), 2);
        assert_eq!(r.resolve("nope.loda").await.unwrap(), None);
        assert!(r.purge_cache() >= 2);
    }

    #[tokio::test]
    async fn test_answer_packets() {
        let r = resolver("loda", "").await;
        let response = r.answer(&request("api.web.loda.", RecordType::A)).await;
        assert_eq!(response.id(), 42);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 3);
        assert!(response.answers().iter().all(|rec| rec.ttl() == DNS_TTL));

        let response = r.answer(&request("missing.loda.", RecordType::A)).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);

        let response = r.answer(&request("api.web.loda.", RecordType::AAAA)).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());

        let bytes = request("api.web.loda.", RecordType::A).to_vec().unwrap();
        let decoded = Message::from_vec(&r.handle_packet(&bytes).await.unwrap()).unwrap();
        assert_eq!(decoded.answers().len(), 3);
        assert!(r.handle_packet(&[1, 2, 3]).await.is_err());
    }
}
