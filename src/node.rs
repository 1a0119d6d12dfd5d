//! Daemon composition.
//!
//! [`RegistryNode::start`] brings one registry member up in order:
//!
//! 1. bind the cluster transport and split it into the raft and forwarding channels
//! 2. open the store (bootstrapping a single-member cluster unless joining)
//! 3. start the forwarding service, ask the leader to add us when joining
//! 4. wait for a leader, publish our API address
//! 5. seed the tree and auth buckets on the leader, rehydrate the report journal
//! 6. spawn the control loops and, if enabled, the DNS server
//!
//! [`RegistryNode::shutdown`] stops everything in reverse order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;
use tracing::warn;

use crate::auth::AuthService;
use crate::auth::ratelimit;
use crate::auth::ratelimit::RateLimiter;
use crate::auth::session;
use crate::auth::session::MemorySessionStore;
use crate::auth::session::SessionStore;
use crate::cluster::Cluster;
use crate::cluster::ForwardingClient;
use crate::cluster::ForwardingService;
use crate::cluster::Message;
use crate::config::RegistryConfig;
use crate::constants::API_RATE_BURST;
use crate::constants::API_RATE_LIMIT;
use crate::constants::LEADER_WAIT_TIMEOUT;
use crate::constants::MACHINE_STATUS_INTERVAL;
use crate::constants::SESSION_PURGE_INTERVAL;
use crate::constants::SESSION_TTL;
use crate::dns::DnsResolver;
use crate::dns::DnsServer;
use crate::model::DashboardService;
use crate::model::MachineController;
use crate::model::ResourceService;
use crate::model::machine;
use crate::report;
use crate::report::ReportJournal;
use crate::store::KeyValueStore;
use crate::store::Store;
use crate::store::StoreConfig;
use crate::transport::FORWARD_TAG;
use crate::transport::Multiplexer;
use crate::transport::RAFT_TAG;
use crate::transport::Transport;
use crate::tree::NodeTree;

/// A running registry member and every service hanging off it.
pub struct RegistryNode {
    mux: Arc<Multiplexer>,
    store: Arc<Store>,
    cluster: Arc<Cluster>,
    forwarding: ForwardingService,
    dns: Option<DnsServer>,
    tree: Arc<NodeTree>,
    resources: Arc<ResourceService>,
    machines: Arc<MachineController>,
    dashboards: Arc<DashboardService>,
    auth: Arc<AuthService>,
    reports: Arc<ReportJournal>,
    sessions: Arc<MemorySessionStore>,
    limiter: Arc<RateLimiter>,
    persist_reports: bool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl RegistryNode {
    /// Starts a member. `join` is the cluster address of a member of an
    /// existing cluster; without it this member bootstraps its own cluster.
    pub async fn start(config: &RegistryConfig, join: Option<&str>) -> Result<Self> {
        let join = join.filter(|addr| !addr.is_empty()).or_else(|| {
            Some(config.data.clusterleader.as_str()).filter(|addr| !addr.is_empty())
        });

        let mux = Multiplexer::bind(&config.data.clusterbind)
            .await
            .with_context(|| format!("failed to bind cluster transport on {}", config.data.clusterbind))?;
        let tasks = TaskTracker::new();
        tasks.spawn(Arc::clone(&mux).serve());

        match Self::start_on(config, join, Arc::clone(&mux), tasks).await {
            Ok(node) => Ok(node),
            Err(err) => {
                // Frees the cluster port.
                mux.close();
                Err(err)
            }
        }
    }

    async fn start_on(
        config: &RegistryConfig,
        join: Option<&str>,
        mux: Arc<Multiplexer>,
        tasks: TaskTracker,
    ) -> Result<Self> {
        let addr = mux.addr().to_string();
        let raft_transport: Arc<dyn Transport> = mux.channel(RAFT_TAG);
        let forward_transport: Arc<dyn Transport> = mux.channel(FORWARD_TAG);

        let mut store_config = StoreConfig::new(config.data_dir(), addr.clone(), raft_transport);
        store_config.heartbeat = Duration::from_millis(config.data.heartbeatms);
        store_config.election_timeout = Duration::from_millis(config.data.electiontimeoutms);
        store_config.bootstrap = join.is_none();
        let store = Arc::new(Store::open(store_config).await?);

        let forwarding = ForwardingService::spawn(Arc::clone(&forward_transport), Arc::clone(&store));
        let cluster = Arc::new(Cluster::new(Arc::clone(&store), Arc::clone(&forward_transport)));

        if let Some(leader) = join {
            info!(%leader, %addr, "joining cluster");
            ForwardingClient::new(forward_transport)
                .send(leader, Message::Join { addr: addr.clone() })
                .await
                .with_context(|| format!("failed to join cluster via {leader}"))?;
        }
        let leader = cluster
            .wait_for_leader(LEADER_WAIT_TIMEOUT)
            .await
            .context("no leader elected")?;
        info!(%leader, %addr, "cluster ready");

        let mut api_peers = cluster.api_peers();
        api_peers.insert(addr.clone(), config.common.httpbind.clone());
        cluster.update_api_peers(api_peers).await.context("failed to publish api address")?;

        let kv: Arc<dyn KeyValueStore> = Arc::clone(&cluster) as Arc<dyn KeyValueStore>;
        let tree = Arc::new(NodeTree::new(Arc::clone(&kv)));
        let auth = Arc::new(AuthService::new(Arc::clone(&kv)));
        let reports = Arc::new(ReportJournal::new(Arc::clone(&kv)));
        if cluster.is_leader() {
            tree.init().await.context("failed to initialise node tree")?;
            auth.init(&config.common.admins).await.context("failed to initialise auth")?;
        }
        let loaded = reports.load().await.context("failed to load report journal")?;
        info!(reports = loaded, "report journal loaded");

        let resources = Arc::new(ResourceService::new(Arc::clone(&tree)));
        let machines = Arc::new(MachineController::new(Arc::clone(&resources), Arc::clone(&reports)));
        let dashboards = Arc::new(DashboardService::new(Arc::clone(&tree)));
        let sessions = Arc::new(MemorySessionStore::new(SESSION_TTL));
        let limiter = Arc::new(RateLimiter::new(API_RATE_LIMIT, API_RATE_BURST));
        let cancel = CancellationToken::new();

        if let Some(every) = config.persist_report_interval() {
            tasks.spawn(report::run_persist_loop(Arc::clone(&reports), every, cancel.clone()));
        }
        let leader_check = Arc::clone(&cluster);
        tasks.spawn(machine::run_status_loop(
            Arc::clone(&machines),
            MACHINE_STATUS_INTERVAL,
            move || leader_check.is_leader(),
            cancel.clone(),
        ));
        tasks.spawn(session::run_purge_loop(
            Arc::clone(&sessions) as Arc<dyn SessionStore>,
            SESSION_PURGE_INTERVAL,
            cancel.clone(),
        ));
        tasks.spawn(ratelimit::run_cleanup_loop(Arc::clone(&limiter), cancel.clone()));

        let dns = if config.dns.enable {
            let resolver = Arc::new(DnsResolver::new(
                Arc::clone(&resources),
                config.dns_zone(),
                &config.dns.ipprefix,
            ));
            let bind = format!("0.0.0.0:{}", config.dns.port);
            Some(DnsServer::spawn(&bind, resolver).await?)
        } else {
            None
        };

        info!(%addr, httpbind = %config.common.httpbind, dns = config.dns.enable, "registry node started");
        Ok(Self {
            mux,
            store,
            cluster,
            forwarding,
            dns,
            tree,
            resources,
            machines,
            dashboards,
            auth,
            reports,
            sessions,
            limiter,
            persist_reports: config.persist_report_interval().is_some(),
            cancel,
            tasks,
        })
    }

    /// Cluster address of this member.
    pub fn addr(&self) -> String {
        self.mux.addr().to_string()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn tree(&self) -> &Arc<NodeTree> {
        &self.tree
    }

    pub fn resources(&self) -> &Arc<ResourceService> {
        &self.resources
    }

    pub fn machines(&self) -> &Arc<MachineController> {
        &self.machines
    }

    pub fn dashboards(&self) -> &Arc<DashboardService> {
        &self.dashboards
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    pub fn reports(&self) -> &Arc<ReportJournal> {
        &self.reports
    }

    pub fn sessions(&self) -> &Arc<MemorySessionStore> {
        &self.sessions
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn dns_addr(&self) -> Option<SocketAddr> {
        self.dns.as_ref().map(DnsServer::addr)
    }

    /// Stops the control loops, snapshots the report journal, then tears down
    /// DNS, forwarding, the store, and the transport.
    pub async fn shutdown(self) -> Result<()> {
        info!(addr = %self.addr(), "shutting down registry node");
        self.cancel.cancel();

        if self.persist_reports {
            if let Err(err) = self.reports.persist().await {
                warn!(error = %err, "final report snapshot failed");
            }
        }
        if let Some(dns) = self.dns {
            dns.shutdown().await?;
        }
        self.forwarding.shutdown().await?;
        self.store.close().await?;
        self.mux.close();

        self.tasks.close();
        self.tasks.wait().await;
        info!("registry node stopped");
        Ok(())
    }
}
