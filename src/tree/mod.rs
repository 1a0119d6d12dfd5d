//! The node tree.
//!
//! The whole hierarchy is one JSON blob at `(loda, node)`. Readers parse the
//! latest blob (identical blobs are parsed once); writers take the tree lock,
//! edit a copy, and replace the blob with a single replicated update. Every
//! node owns a bucket named after its id holding its resource lists.

pub mod node;
pub mod template;

use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

pub use self::node::LeafInfo;
pub use self::node::Node;
pub use self::node::NodeType;
pub use self::node::child_ns;
pub use self::node::reverse_ns;
use crate::constants::DEV_ROLE;
use crate::constants::NODE_KEY;
use crate::constants::NO_MATCH_REG;
use crate::constants::NS_SEPARATOR;
use crate::constants::OP_ROLE;
use crate::constants::POOL_NODE;
use crate::constants::RES_ALARM;
use crate::constants::RES_MACHINE;
use crate::constants::ROOT_BUCKET;
use crate::constants::ROOT_ID;
use crate::constants::ROOT_NAME;
use crate::constants::TEMPLATE_PREFIX;
use crate::error::RegistryError;
use crate::error::Result;
use crate::model::alarm;
use crate::resource::codec;
use crate::store::KeyValueStore;
use crate::store::Row;

/// Non-leaf created on first boot to hold the registry's own services.
pub const MONITOR_NODE: &str = "monitor";
/// Leaves under [`MONITOR_NODE`].
pub const MONITOR_LEAVES: &[&str] = &["agent", "alarm", "event", "registry", "router", "tsdb", "ui"];

/// Name of the ops group of `ns`, e.g. `loda.web.api-op`.
pub fn ns_op_group(ns: &str) -> String {
    format!("{}-{OP_ROLE}", reverse_ns(ns))
}

/// Name of the dev group of `ns`.
pub fn ns_dev_group(ns: &str) -> String {
    format!("{}-{DEV_ROLE}", reverse_ns(ns))
}

/// Splits `a.b.loda` into `("a", "b.loda")`. `None` for the root.
pub fn split_ns(ns: &str) -> Option<(&str, &str)> {
    ns.split_once(NS_SEPARATOR)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RegistryError::invalid_param("node name is empty"));
    }
    if name.contains(NS_SEPARATOR) {
        return Err(RegistryError::invalid_param(format!("node name {name} contains '{NS_SEPARATOR}'")));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(RegistryError::invalid_param(format!("node name {name:?} contains whitespace")));
    }
    Ok(())
}

fn validate_machine_reg(reg: &str) -> Result<()> {
    Regex::new(reg)?;
    Ok(())
}

fn bucket_name(id: &str) -> &[u8] {
    id.as_bytes()
}

struct ParsedTree {
    blob: Vec<u8>,
    root: Arc<Node>,
}

pub struct NodeTree {
    store: Arc<dyn KeyValueStore>,
    lock: RwLock<()>,
    parsed: Mutex<Option<ParsedTree>>,
}

impl NodeTree {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: RwLock::new(()),
            parsed: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Creates the root, the pool leaf, and the monitor subtree on an empty
    /// store. A no-op once the tree exists.
    pub async fn init(&self) -> Result<()> {
        self.store.create_bucket_if_not_exist(ROOT_BUCKET.as_bytes()).await?;
        {
            let _guard = self.lock.write().await;
            if self.store.view(ROOT_BUCKET.as_bytes(), NODE_KEY.as_bytes()).await?.is_some() {
                return Ok(());
            }
            self.store.create_bucket_if_not_exist(bucket_name(ROOT_ID)).await?;
            let catalog = template::catalog()?;
            let rows = catalog
                .into_iter()
                .map(|(key, value)| Row::new(ROOT_ID, key, value))
                .collect();
            self.store.batch(rows).await?;
            self.save(&Node::root()).await?;
            info!("created root node");
        }

        self.ensure_node(POOL_NODE, ROOT_NAME, NodeType::Leaf, NO_MATCH_REG).await?;
        self.ensure_node(MONITOR_NODE, ROOT_NAME, NodeType::NonLeaf, NO_MATCH_REG).await?;
        let monitor_ns = child_ns(MONITOR_NODE, ROOT_NAME);
        for leaf in MONITOR_LEAVES {
            self.ensure_node(leaf, &monitor_ns, NodeType::Leaf, NO_MATCH_REG).await?;
        }
        Ok(())
    }

    async fn ensure_node(&self, name: &str, parent_ns: &str, node_type: NodeType, machine_reg: &str) -> Result<()> {
        match self.new_node(name, parent_ns, node_type, machine_reg).await {
            Ok(_) | Err(RegistryError::AlreadyExists { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn parse(&self, blob: Vec<u8>) -> Result<Arc<Node>> {
        if let Some(parsed) = self.parsed.lock().as_ref() {
            if parsed.blob == blob {
                return Ok(Arc::clone(&parsed.root));
            }
        }
        let root: Node = serde_json::from_slice(&blob)
            .map_err(|e| RegistryError::invalid_format(format!("node tree: {e}")))?;
        let root = Arc::new(root);
        *self.parsed.lock() = Some(ParsedTree {
            blob,
            root: Arc::clone(&root),
        });
        Ok(root)
    }

    async fn load(&self) -> Result<Arc<Node>> {
        let blob = self
            .store
            .view(ROOT_BUCKET.as_bytes(), NODE_KEY.as_bytes())
            .await?
            .ok_or_else(|| RegistryError::not_found("node tree is not initialized"))?;
        self.parse(blob)
    }

    async fn save(&self, root: &Node) -> Result<()> {
        let blob =
            serde_json::to_vec(root).map_err(|e| RegistryError::storage(format!("failed to encode node tree: {e}")))?;
        self.store.update(ROOT_BUCKET.as_bytes(), NODE_KEY.as_bytes(), &blob).await
    }

    /// Latest parsed tree.
    pub async fn root(&self) -> Result<Arc<Node>> {
        let _guard = self.lock.read().await;
        self.load().await
    }

    pub async fn get_by_ns(&self, ns: &str) -> Result<Node> {
        let root = self.root().await?;
        root.get_by_ns(ns)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(format!("ns {ns}")))
    }

    /// Node with `id` and its NS.
    pub async fn get_by_id(&self, id: &str) -> Result<(Node, String)> {
        let root = self.root().await?;
        root.get_by_id(id)
            .map(|(node, ns)| (node.clone(), ns))
            .ok_or_else(|| RegistryError::not_found(format!("node id {id}")))
    }

    /// Every leaf at or below `ns`, in depth-first order.
    pub async fn leaves(&self, ns: &str) -> Result<Vec<LeafInfo>> {
        let root = self.root().await?;
        let node = root
            .get_by_ns(ns)
            .ok_or_else(|| RegistryError::not_found(format!("ns {ns}")))?;
        Ok(node.leaves(ns))
    }

    pub async fn leaf_ns(&self, ns: &str) -> Result<Vec<String>> {
        Ok(self.leaves(ns).await?.into_iter().map(|l| l.ns).collect())
    }

    pub async fn leaf_child_ids(&self, ns: &str) -> Result<Vec<String>> {
        Ok(self.leaves(ns).await?.into_iter().map(|l| l.id).collect())
    }

    /// `(leaf ns, machine regex)` for every leaf below `ns`.
    pub async fn leaf_machine_reg(&self, ns: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .leaves(ns)
            .await?
            .into_iter()
            .map(|l| (l.ns, l.machine_reg))
            .collect())
    }

    pub async fn all_ns(&self) -> Result<Vec<String>> {
        let root = self.root().await?;
        Ok(root.all_ns(ROOT_NAME))
    }

    /// Creates `name` under `parent_ns` and returns the new node's id.
    ///
    /// The node's bucket is created right after the tree update and filled
    /// with the parent's templates (prefix stripped for leaves, alarms
    /// rewritten for the new NS). If that fails the node is taken out of the
    /// tree again.
    pub async fn new_node(&self, name: &str, parent_ns: &str, node_type: NodeType, machine_reg: &str) -> Result<String> {
        validate_name(name)?;
        if node_type == NodeType::Root {
            return Err(RegistryError::invalid_param("cannot create another root"));
        }
        let machine_reg = if machine_reg.is_empty() { NO_MATCH_REG } else { machine_reg };
        validate_machine_reg(machine_reg)?;
        let ns = child_ns(name, parent_ns);

        let _guard = self.lock.write().await;
        let mut root = Node::clone(&*self.load().await?);
        let parent = root
            .get_by_ns_mut(parent_ns)
            .ok_or_else(|| RegistryError::not_found(format!("ns {parent_ns}")))?;
        if parent.is_leaf() {
            return Err(RegistryError::not_allowed(format!("cannot create {name} under leaf {parent_ns}")));
        }
        if parent.child(name).is_some() {
            return Err(RegistryError::already_exists(format!("ns {ns}")));
        }
        let parent_id = parent.id.clone();
        let id = Uuid::new_v4().to_string();
        parent.children.push(Node {
            id: id.clone(),
            name: name.to_string(),
            comment: String::new(),
            node_type,
            machine_reg: machine_reg.to_string(),
            children: Vec::new(),
        });
        self.save(&root).await?;

        if let Err(err) = self.populate(&id, &ns, &parent_id, node_type).await {
            warn!(%ns, error = %err, "failed to set up node bucket, rolling back");
            if let Some(parent) = root.get_by_ns_mut(parent_ns) {
                parent.remove_child(name);
            }
            if let Err(e) = self.save(&root).await {
                error!(%ns, error = %e, "failed to roll back node creation");
            }
            if let Err(e) = self.store.remove_bucket(bucket_name(&id)).await {
                if !e.is_not_found() {
                    error!(%ns, error = %e, "failed to remove bucket of rolled back node");
                }
            }
            return Err(err);
        }
        info!(%ns, %id, ?node_type, "created node");
        Ok(id)
    }

    async fn populate(&self, id: &str, ns: &str, parent_id: &str, node_type: NodeType) -> Result<()> {
        self.store.create_bucket(bucket_name(id)).await?;
        let templates = self
            .store
            .views(bucket_name(parent_id), TEMPLATE_PREFIX.as_bytes())
            .await?;
        let mut rows = Vec::with_capacity(templates.len());
        for (key, value) in templates {
            let key = String::from_utf8(key)
                .map_err(|_| RegistryError::invalid_format("template key is not valid UTF-8"))?;
            let resource_type = key.trim_start_matches(TEMPLATE_PREFIX);
            let value = if resource_type == RES_ALARM {
                alarm::rewrite_alarms(&value, ns)?
            } else {
                value
            };
            let target = if node_type == NodeType::Leaf { resource_type.to_string() } else { key.clone() };
            rows.push(Row::new(id, target, value));
        }
        if !rows.is_empty() {
            self.store.batch(rows).await?;
        }
        Ok(())
    }

    /// Removes a leaf without machines, or a non-leaf without children, and
    /// drops its bucket.
    pub async fn remove_node(&self, ns: &str) -> Result<()> {
        let Some((name, parent_ns)) = split_ns(ns) else {
            return Err(RegistryError::not_allowed("cannot remove the root node"));
        };

        let _guard = self.lock.write().await;
        let mut root = Node::clone(&*self.load().await?);
        let node = root
            .get_by_ns(ns)
            .ok_or_else(|| RegistryError::not_found(format!("ns {ns}")))?;
        if !node.is_leaf() && !node.children.is_empty() {
            return Err(RegistryError::not_allowed(format!("ns {ns} still has children")));
        }
        let id = node.id.clone();
        if node.is_leaf() && self.has_machines(&id).await? {
            return Err(RegistryError::not_allowed(format!("ns {ns} still has machines")));
        }

        if let Some(parent) = root.get_by_ns_mut(parent_ns) {
            parent.remove_child(name);
        }
        self.save(&root).await?;
        match self.store.remove_bucket(bucket_name(&id)).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => warn!(%ns, %id, "removed node had no bucket"),
            Err(err) => return Err(err),
        }
        info!(%ns, %id, "removed node");
        Ok(())
    }

    async fn has_machines(&self, id: &str) -> Result<bool> {
        match self.store.view(bucket_name(id), RES_MACHINE.as_bytes()).await {
            Ok(Some(list)) => Ok(codec::count(&list)? > 0),
            Ok(None) => Ok(false),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Renames a node and/or replaces its machine regex. Empty arguments
    /// leave the field unchanged.
    pub async fn update_node(&self, ns: &str, new_name: &str, machine_reg: &str) -> Result<()> {
        if !new_name.is_empty() {
            validate_name(new_name)?;
        }
        if !machine_reg.is_empty() {
            validate_machine_reg(machine_reg)?;
        }

        let _guard = self.lock.write().await;
        let mut root = Node::clone(&*self.load().await?);
        let rename = match split_ns(ns) {
            None if !new_name.is_empty() && new_name != ROOT_NAME => {
                return Err(RegistryError::not_allowed("cannot rename the root node"));
            }
            None => None,
            Some((name, parent_ns)) if !new_name.is_empty() && new_name != name => {
                let parent = root
                    .get_by_ns(parent_ns)
                    .ok_or_else(|| RegistryError::not_found(format!("ns {ns}")))?;
                if parent.child(new_name).is_some() {
                    return Err(RegistryError::already_exists(format!("ns {}", child_ns(new_name, parent_ns))));
                }
                Some(new_name)
            }
            Some(_) => None,
        };

        let node = root
            .get_by_ns_mut(ns)
            .ok_or_else(|| RegistryError::not_found(format!("ns {ns}")))?;
        if let Some(new_name) = rename {
            node.name = new_name.to_string();
        }
        if !machine_reg.is_empty() {
            node.machine_reg = machine_reg.to_string();
        }
        self.save(&root).await?;
        info!(%ns, new_name, machine_reg, "updated node");
        Ok(())
    }
}
