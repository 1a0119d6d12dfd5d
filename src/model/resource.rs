//! Typed resource collections attached to nodes.
//!
//! A list lives at `(node id, resource type)` in the node's bucket. Leaves
//! hold every type; non-leaves only hold `_template_*` lists. Reading a
//! plain type on a non-leaf returns the concatenation of the lists on every
//! leaf below it.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::HOSTNAME_PROPERTY;
use crate::constants::ID_PROPERTY;
use crate::constants::RES_MACHINE;
use crate::constants::ROOT_NAME;
use crate::constants::SEARCH_CONCURRENCY;
use crate::constants::TEMPLATE_PREFIX;
use crate::constants::pk_property;
use crate::error::RegistryError;
use crate::error::Result;
use crate::resource::Resource;
use crate::resource::ResourceList;
use crate::resource::ResourceSearch;
use crate::resource::codec;
use crate::store::KeyValueStore;
use crate::tree::Node;
use crate::tree::NodeTree;

/// Search results keyed by leaf NS.
pub type SearchResult = BTreeMap<String, ResourceList>;

pub fn is_template(resource_type: &str) -> bool {
    resource_type.starts_with(TEMPLATE_PREFIX)
}

fn check_type(resource_type: &str) -> Result<()> {
    if resource_type.is_empty() || resource_type == TEMPLATE_PREFIX {
        return Err(RegistryError::invalid_param("empty resource type"));
    }
    Ok(())
}

/// Resource operations over the node tree.
pub struct ResourceService {
    tree: Arc<NodeTree>,
    /// Serialises local read-modify-write cycles on resource lists.
    write_lock: Mutex<()>,
}

impl ResourceService {
    pub fn new(tree: Arc<NodeTree>) -> Self {
        Self {
            tree,
            write_lock: Mutex::new(()),
        }
    }

    pub fn tree(&self) -> &Arc<NodeTree> {
        &self.tree
    }

    fn store(&self) -> &Arc<dyn KeyValueStore> {
        self.tree.store()
    }

    async fn raw_list(&self, node_id: &str, resource_type: &str) -> Result<Vec<u8>> {
        Ok(self
            .store()
            .view(node_id.as_bytes(), resource_type.as_bytes())
            .await?
            .unwrap_or_default())
    }

    /// Node that may hold `resource_type` for writing.
    async fn writable_node(&self, ns: &str, resource_type: &str) -> Result<Node> {
        check_type(resource_type)?;
        let node = self.tree.get_by_ns(ns).await?;
        if !node.is_leaf() && !is_template(resource_type) {
            return Err(RegistryError::not_allowed(format!(
                "{resource_type} resources can only be set on a leaf, {ns} is not one"
            )));
        }
        Ok(node)
    }

    /// Encoded list of `resource_type` at `ns`.
    pub async fn get_resource_raw(&self, ns: &str, resource_type: &str) -> Result<Vec<u8>> {
        check_type(resource_type)?;
        let node = self.tree.get_by_ns(ns).await?;
        if node.is_leaf() || is_template(resource_type) {
            return self.raw_list(&node.id, resource_type).await;
        }
        let mut out = Vec::new();
        for leaf in node.leaves(ns) {
            let list = self.raw_list(&leaf.id, resource_type).await?;
            out = codec::concat(&out, &list)?;
        }
        Ok(out)
    }

    pub async fn get_resource_list(&self, ns: &str, resource_type: &str) -> Result<ResourceList> {
        let raw = self.get_resource_raw(ns, resource_type).await?;
        Ok(codec::unmarshal(&raw)?)
    }

    /// One resource by id.
    pub async fn get_resource(&self, ns: &str, resource_type: &str, id: &str) -> Result<Resource> {
        let raw = self.get_resource_raw(ns, resource_type).await?;
        codec::get_by_id(&raw, id)?.ok_or_else(|| RegistryError::not_found(format!("{resource_type} {id} in {ns}")))
    }

    /// Replaces the whole list. Resources without an id get a fresh one.
    pub async fn set_resource(&self, ns: &str, resource_type: &str, list: ResourceList) -> Result<()> {
        let node = self.writable_node(ns, resource_type).await?;
        let (data, _) = codec::append_resources(&[], list)?;
        let _guard = self.write_lock.lock().await;
        self.store()
            .update(node.id.as_bytes(), resource_type.as_bytes(), &data)
            .await?;
        debug!(%ns, resource_type, "set resource list");
        Ok(())
    }

    /// Appends to the list and returns the ids of the new resources.
    pub async fn append_resource(&self, ns: &str, resource_type: &str, list: ResourceList) -> Result<Vec<String>> {
        if list.is_empty() {
            return Err(RegistryError::invalid_param("nothing to append"));
        }
        let node = self.writable_node(ns, resource_type).await?;
        let _guard = self.write_lock.lock().await;
        self.append_locked(&node, resource_type, list).await
    }

    /// Caller holds `write_lock`.
    async fn append_locked(&self, node: &Node, resource_type: &str, list: ResourceList) -> Result<Vec<String>> {
        let current = self.raw_list(&node.id, resource_type).await?;
        let (data, ids) = codec::append_resources(&current, list)?;
        self.store()
            .update(node.id.as_bytes(), resource_type.as_bytes(), &data)
            .await?;
        debug!(node = %node.id, resource_type, count = ids.len(), "appended resources");
        Ok(ids)
    }

    /// Reads the list at a writable `ns`, lets `edit` change it, and writes
    /// it back if it changed. The whole cycle runs under the write lock, so
    /// appends and removals on the same list are never lost.
    pub async fn edit_list<T, F>(&self, ns: &str, resource_type: &str, edit: F) -> Result<T>
    where
        F: FnOnce(&mut ResourceList) -> Result<T>,
    {
        let node = self.writable_node(ns, resource_type).await?;
        let _guard = self.write_lock.lock().await;
        let current = self.raw_list(&node.id, resource_type).await?;
        let mut list = codec::unmarshal(&current)?;
        let before = list.clone();
        let out = edit(&mut list)?;
        if list != before {
            let (data, _) = codec::append_resources(&[], list)?;
            self.store()
                .update(node.id.as_bytes(), resource_type.as_bytes(), &data)
                .await?;
            debug!(%ns, resource_type, "edited resource list");
        }
        Ok(out)
    }

    /// Merges `patch` into the resource with `id`.
    pub async fn update_resource(&self, ns: &str, resource_type: &str, id: &str, patch: &Resource) -> Result<()> {
        let node = self.writable_node(ns, resource_type).await?;
        let _guard = self.write_lock.lock().await;
        let current = self.raw_list(&node.id, resource_type).await?;
        let data = codec::update_by_id(&current, id, patch)?;
        self.store()
            .update(node.id.as_bytes(), resource_type.as_bytes(), &data)
            .await
    }

    /// Removes the resources with the given ids. Unknown ids are ignored.
    pub async fn remove_resource(&self, ns: &str, resource_type: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Err(RegistryError::invalid_param("no resource ids given"));
        }
        let node = self.writable_node(ns, resource_type).await?;
        let _guard = self.write_lock.lock().await;
        let current = self.raw_list(&node.id, resource_type).await?;
        let set: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let data = codec::delete_by_ids(&current, &set)?;
        if data.len() == current.len() {
            return Ok(());
        }
        self.store()
            .update(node.id.as_bytes(), resource_type.as_bytes(), &data)
            .await?;
        info!(%ns, resource_type, ?ids, "removed resources");
        Ok(())
    }

    /// Copies resources into `to_ns` under fresh ids. Repeated ids are
    /// copied once.
    ///
    /// Fails with `AlreadyExists` when a copied resource's primary key value
    /// is already present in the target list or repeats within the
    /// selection. The check and the append share one lock acquisition.
    pub async fn copy_resource(
        &self,
        from_ns: &str,
        to_ns: &str,
        resource_type: &str,
        ids: &[String],
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Err(RegistryError::invalid_param("no resource ids given"));
        }
        let mut seen = HashSet::new();
        let ids: Vec<&String> = ids.iter().filter(|id| seen.insert(id.as_str())).collect();
        let target = self.writable_node(to_ns, resource_type).await?;

        let _guard = self.write_lock.lock().await;
        let source = self.get_resource_list(from_ns, resource_type).await?;
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            let resource = source
                .iter()
                .find(|r| r.get(ID_PROPERTY) == Some(id))
                .ok_or_else(|| RegistryError::not_found(format!("{resource_type} {id} in {from_ns}")))?;
            selected.push(resource.clone());
        }

        let pk = pk_property(resource_type);
        if pk != ID_PROPERTY {
            let current = codec::unmarshal(&self.raw_list(&target.id, resource_type).await?)?;
            let mut taken: HashSet<String> = current.iter().filter_map(|r| r.get(pk)).cloned().collect();
            for value in selected.iter().filter_map(|r| r.get(pk)) {
                if !taken.insert(value.clone()) {
                    return Err(RegistryError::already_exists(format!(
                        "{resource_type} with {pk}={value} in {to_ns}"
                    )));
                }
            }
        }

        for resource in &mut selected {
            resource.remove(ID_PROPERTY);
        }
        self.append_locked(&target, resource_type, selected).await
    }

    /// Copy, then remove from `from_ns`. Not atomic: if the removal fails
    /// both copies stay and the error is returned.
    pub async fn move_resource(
        &self,
        from_ns: &str,
        to_ns: &str,
        resource_type: &str,
        ids: &[String],
    ) -> Result<Vec<String>> {
        self.writable_node(from_ns, resource_type).await?;
        let new_ids = self.copy_resource(from_ns, to_ns, resource_type, ids).await?;
        if let Err(err) = self.remove_resource(from_ns, resource_type, ids).await {
            warn!(from_ns, to_ns, resource_type, error = %err, "copied resources but failed to remove the originals");
            return Err(err);
        }
        Ok(new_ids)
    }

    /// Runs `search` on every leaf below `ns`, at most
    /// [`SEARCH_CONCURRENCY`] leaves at a time. The first failing leaf aborts
    /// the whole search. Leaves without matches are left out.
    pub async fn search_resource(&self, ns: &str, resource_type: &str, search: ResourceSearch) -> Result<SearchResult> {
        check_type(resource_type)?;
        let leaves = self.tree.leaves(ns).await?;
        let search = Arc::new(search);
        let semaphore = Arc::new(Semaphore::new(SEARCH_CONCURRENCY));
        let mut tasks = JoinSet::new();

        for leaf in leaves {
            let store = Arc::clone(self.store());
            let search = Arc::clone(&search);
            let semaphore = Arc::clone(&semaphore);
            let resource_type = resource_type.to_string();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| RegistryError::storage("search semaphore closed"))?;
                let data = store
                    .view(leaf.id.as_bytes(), resource_type.as_bytes())
                    .await?
                    .unwrap_or_default();
                let hits = codec::unmarshal(&search.search(&data)?)?;
                Ok::<_, RegistryError>((leaf.ns, hits))
            });
        }

        let mut out = SearchResult::new();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| RegistryError::storage(format!("search worker failed: {e}")))?;
            match result {
                Ok((leaf_ns, hits)) if !hits.is_empty() => {
                    out.insert(leaf_ns, hits);
                }
                Ok(_) => {}
                Err(err) => {
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }
        Ok(out)
    }

    /// [`Self::search_resource`] with a deadline. Outstanding workers are
    /// aborted when it expires.
    pub async fn search_resource_within(
        &self,
        ns: &str,
        resource_type: &str,
        search: ResourceSearch,
        timeout: Duration,
    ) -> Result<SearchResult> {
        match tokio::time::timeout(timeout, self.search_resource(ns, resource_type, search)).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::storage("search timed out")),
        }
    }

    /// Every machine called `hostname`, by leaf NS.
    pub async fn search_machine(&self, hostname: &str) -> Result<SearchResult> {
        if hostname.is_empty() {
            return Err(RegistryError::invalid_param("empty hostname"));
        }
        let search = ResourceSearch::init(HOSTNAME_PROPERTY, vec![hostname.to_string()], false)?;
        self.search_resource(ROOT_NAME, RES_MACHINE, search).await
    }
}
