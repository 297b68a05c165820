use crate::errors::{FetchInconsistency, GatewayError, UserCancelled};
use crate::gateway::ResourceGateway;
use crate::model::{
    NodeId, PageCursor, RemoteResource, ResourceKind, ResourceSummary, TreeRow,
};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One entity in the hierarchy. Parent and children are referenced by id,
/// never by live reference, so refresh can drop a subtree without leaving
/// dangling strong references behind.
#[derive(Debug)]
struct Node {
    label: String,
    kind: ResourceKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    cursor: PageCursor,
    loaded_at: Option<Instant>,
    /// Bumped by every append and every refresh. A fetch that started
    /// against an older generation discards its page instead of applying
    /// it, which is what collapses concurrent loads and protects refresh.
    generation: u64,
    summary: ResourceSummary,
}

impl Node {
    fn new(label: String, kind: ResourceKind, parent: Option<NodeId>) -> Self {
        Self {
            label,
            kind,
            parent,
            children: Vec::new(),
            cursor: PageCursor::Unloaded,
            loaded_at: None,
            generation: 0,
            summary: ResourceSummary::default(),
        }
    }
}

#[derive(Default)]
struct Arena {
    nodes: HashMap<NodeId, Node>,
}

/// Per-node fetch serialization. Callers that were blocked on the lock
/// while a fetch was in flight attach to its outcome, success or failure;
/// the recorded failure is cleared when a fresh fetch starts.
#[derive(Default)]
struct FetchState {
    lock: AsyncMutex<()>,
    last_failure: Mutex<Option<GatewayError>>,
}

impl Arena {
    fn evict_subtree(&mut self, root: &NodeId) {
        let mut stack = match self.nodes.get(root) {
            Some(node) => node.children.clone(),
            None => return,
        };
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                stack.extend(node.children);
            }
        }
    }
}

/// Cache-coherent provider over the remote hierarchy. All mutation happens
/// under one mutex in short critical sections, so readers never observe a
/// half-appended page; remote calls happen outside it, serialized per node
/// by an async fetch lock.
pub struct TreeCache {
    gateway: Arc<dyn ResourceGateway>,
    page_size: usize,
    root: NodeId,
    arena: Mutex<Arena>,
    fetch_states: Mutex<HashMap<NodeId, Arc<FetchState>>>,
}

impl TreeCache {
    pub fn new(gateway: Arc<dyn ResourceGateway>, page_size: usize, account_label: &str) -> Self {
        let root = NodeId::root();
        let mut arena = Arena::default();
        arena.nodes.insert(
            root.clone(),
            Node::new(account_label.to_string(), ResourceKind::Account, None),
        );
        Self {
            gateway,
            page_size,
            root,
            arena: Mutex::new(arena),
            fetch_states: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &NodeId {
        &self.root
    }

    fn resolve<'a>(&'a self, node: Option<&'a NodeId>) -> &'a NodeId {
        node.unwrap_or(&self.root)
    }

    fn fetch_state(&self, id: &NodeId) -> Arc<FetchState> {
        self.fetch_states
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_default()
            .clone()
    }

    /// Currently cached children of `node` (`None` = root), triggering the
    /// initial page fetch if the node was never loaded. A synthetic "load
    /// more" row trails the list while the cursor is not exhausted.
    pub async fn children(
        &self,
        cancel: &CancellationToken,
        node: Option<&NodeId>,
    ) -> Result<Vec<TreeRow>> {
        let id = self.resolve(node).clone();
        let needs_initial = {
            let arena = self.arena.lock().unwrap();
            match arena.nodes.get(&id) {
                Some(node) => node.kind.has_children() && node.cursor.is_unloaded(),
                None => false,
            }
        };
        if needs_initial {
            self.load_more(cancel, &id).await?;
        }
        Ok(self.cached_children(&id))
    }

    /// Snapshot of the cached children without touching the remote source.
    pub fn cached_children(&self, id: &NodeId) -> Vec<TreeRow> {
        let arena = self.arena.lock().unwrap();
        let Some(node) = arena.nodes.get(id) else {
            return Vec::new();
        };
        let mut rows = node
            .children
            .iter()
            .filter_map(|child_id| {
                arena.nodes.get(child_id).map(|child| TreeRow {
                    id: child_id.clone(),
                    label: child.label.clone(),
                    kind: child.kind,
                    depth: 0,
                    expanded: false,
                    summary: child.summary.clone(),
                })
            })
            .collect::<Vec<_>>();
        if matches!(node.cursor, PageCursor::Next(_)) {
            rows.push(load_more_row(id, 0));
        }
        rows
    }

    /// Fetches the next page of children for `node` and appends it to the
    /// cache. No-op when the cursor is exhausted. Concurrent calls on the
    /// same node collapse into one remote fetch: the second caller waits
    /// on the fetch lock, observes the bumped generation, and returns the
    /// first caller's outcome.
    pub async fn load_more(&self, cancel: &CancellationToken, id: &NodeId) -> Result<()> {
        let Some((kind, generation)) = ({
            let arena = self.arena.lock().unwrap();
            arena
                .nodes
                .get(id)
                .map(|node| (node.kind, node.generation))
        }) else {
            debug!("load_more on evicted node {id}");
            return Ok(());
        };
        if !kind.has_children() {
            return Ok(());
        }

        let state = self.fetch_state(id);
        let (_guard, waited) = match state.lock.try_lock() {
            Ok(guard) => (guard, false),
            Err(_) => (state.lock.lock().await, true),
        };
        if cancel.is_cancelled() {
            return Err(UserCancelled.into());
        }

        // Re-read under the fetch lock: another load or a refresh may have
        // completed while we waited, in which case we attach to its result.
        let cursor = {
            let arena = self.arena.lock().unwrap();
            let Some(node) = arena.nodes.get(id) else {
                return Ok(());
            };
            if node.generation != generation {
                return Ok(());
            }
            node.cursor.clone()
        };
        if waited {
            // The fetch we queued behind neither bumped the generation nor
            // got cancelled, so it failed; observe its outcome instead of
            // issuing a duplicate remote call.
            let failed = state.last_failure.lock().unwrap().clone();
            if let Some(source) = failed {
                return Err(FetchInconsistency {
                    node: id.clone(),
                    source,
                }
                .into());
            }
        }
        let cursor_token = match cursor {
            PageCursor::Exhausted => return Ok(()),
            PageCursor::Unloaded => None,
            PageCursor::Next(token) => Some(token),
        };

        state.last_failure.lock().unwrap().take();
        let page = match self
            .gateway
            .list_children(id, kind, cursor_token.as_deref(), self.page_size)
            .await
        {
            Ok(page) => page,
            Err(source) => {
                *state.last_failure.lock().unwrap() = Some(source.clone());
                return Err(FetchInconsistency {
                    node: id.clone(),
                    source,
                }
                .into());
            }
        };
        if cancel.is_cancelled() {
            // Abandon without applying; the cache stays as it was and a
            // later retry re-attempts the same page.
            return Err(UserCancelled.into());
        }

        let mut arena = self.arena.lock().unwrap();
        let Some(node) = arena.nodes.get(id) else {
            return Ok(());
        };
        if node.generation != generation {
            debug!("discarding stale page for {id}");
            return Ok(());
        }
        let parent_id = id.clone();
        let next_cursor = match page.next_cursor {
            Some(token) => PageCursor::Next(token),
            None => PageCursor::Exhausted,
        };
        let mut appended = Vec::new();
        for item in page.items {
            let RemoteResource {
                id: child_id,
                label,
                kind,
                summary,
            } = item;
            match arena.nodes.get_mut(&child_id) {
                Some(existing) => {
                    existing.label = label;
                    existing.summary = summary;
                }
                None => {
                    let mut child = Node::new(label, kind, Some(parent_id.clone()));
                    child.summary = summary;
                    arena.nodes.insert(child_id.clone(), child);
                    appended.push(child_id);
                }
            }
        }
        if let Some(node) = arena.nodes.get_mut(&parent_id) {
            node.children.extend(appended);
            node.cursor = next_cursor;
            node.loaded_at = Some(Instant::now());
            node.generation += 1;
        }
        Ok(())
    }

    /// Discards the cached children and cursor of the subtree rooted at
    /// `node` (`None` = the whole tree). Sibling subtrees are untouched, so
    /// expansion state elsewhere survives. The next `children`/`load_more`
    /// re-fetches from the beginning.
    pub fn refresh(&self, node: Option<&NodeId>) {
        let id = self.resolve(node).clone();
        let mut arena = self.arena.lock().unwrap();
        arena.evict_subtree(&id);
        if let Some(node) = arena.nodes.get_mut(&id) {
            if let Some(loaded_at) = node.loaded_at {
                debug!("refreshing {id}, last loaded {:.1?} ago", loaded_at.elapsed());
            }
            node.children.clear();
            node.cursor = PageCursor::Unloaded;
            node.loaded_at = None;
            node.generation += 1;
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.arena.lock().unwrap().nodes.contains_key(id)
    }

    pub fn parent_of(&self, id: &NodeId) -> Option<NodeId> {
        self.arena.lock().unwrap().nodes.get(id)?.parent.clone()
    }

    pub fn kind_of(&self, id: &NodeId) -> Option<ResourceKind> {
        Some(self.arena.lock().unwrap().nodes.get(id)?.kind)
    }

    pub fn label_of(&self, id: &NodeId) -> Option<String> {
        Some(self.arena.lock().unwrap().nodes.get(id)?.label.clone())
    }

    pub fn summary_of(&self, id: &NodeId) -> Option<ResourceSummary> {
        Some(self.arena.lock().unwrap().nodes.get(id)?.summary.clone())
    }

    /// Depth-first flattening of the loaded tree for rendering: children of
    /// the root at depth zero, descending only into `expanded` nodes, with
    /// a trailing "load more" row wherever a cursor is still open.
    pub fn visible_rows(&self, expanded: &HashSet<NodeId>) -> Vec<TreeRow> {
        let arena = self.arena.lock().unwrap();
        let mut rows = Vec::new();
        Self::flatten(&arena, &self.root, 0, expanded, &mut rows);
        rows
    }

    fn flatten(
        arena: &Arena,
        id: &NodeId,
        depth: usize,
        expanded: &HashSet<NodeId>,
        rows: &mut Vec<TreeRow>,
    ) {
        let Some(node) = arena.nodes.get(id) else {
            return;
        };
        for child_id in &node.children {
            let Some(child) = arena.nodes.get(child_id) else {
                continue;
            };
            let is_expanded = expanded.contains(child_id);
            rows.push(TreeRow {
                id: child_id.clone(),
                label: child.label.clone(),
                kind: child.kind,
                depth,
                expanded: is_expanded,
                summary: child.summary.clone(),
            });
            if is_expanded {
                Self::flatten(arena, child_id, depth + 1, expanded, rows);
            }
        }
        if matches!(node.cursor, PageCursor::Next(_)) {
            rows.push(load_more_row(id, depth));
        }
    }
}

fn load_more_row(parent: &NodeId, depth: usize) -> TreeRow {
    TreeRow {
        id: parent.load_more_child(),
        label: "Load more…".to_string(),
        kind: ResourceKind::LoadMore,
        depth,
        expanded: false,
        summary: ResourceSummary::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::TreeCache;
    use crate::errors::{Classification, classify};
    use crate::gateway::testing::{ScriptedFailure, ScriptedGateway, group, vm_page};
    use crate::model::{NodeId, ResourceKind, ResourcePage};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn tree_with(gateway: Arc<ScriptedGateway>) -> TreeCache {
        TreeCache::new(gateway, 100, "Test Account")
    }

    fn real_rows(rows: &[crate::model::TreeRow]) -> usize {
        rows.iter().filter(|row| !row.is_load_more()).count()
    }

    #[tokio::test]
    async fn paginates_250_items_across_three_pages() {
        let gateway = Arc::new(ScriptedGateway::new());
        let root = NodeId::root();
        gateway.script_page(&root, None, vm_page(&root, 0, 100, Some("p2")));
        gateway.script_page(&root, Some("p2"), vm_page(&root, 100, 100, Some("p3")));
        gateway.script_page(&root, Some("p3"), vm_page(&root, 200, 50, None));
        let tree = tree_with(gateway.clone());
        let cancel = CancellationToken::new();

        let rows = tree.children(&cancel, None).await.unwrap();
        assert_eq!(real_rows(&rows), 100);
        assert!(rows.last().unwrap().is_load_more());
        assert_eq!(rows.len(), 101);

        tree.load_more(&cancel, &root).await.unwrap();
        let rows = tree.cached_children(&root);
        assert_eq!(real_rows(&rows), 200);
        assert!(rows.last().unwrap().is_load_more());

        tree.load_more(&cancel, &root).await.unwrap();
        let rows = tree.cached_children(&root);
        assert_eq!(real_rows(&rows), 250);
        assert!(!rows.last().unwrap().is_load_more());

        tree.refresh(None);
        assert!(tree.cached_children(&root).is_empty());

        // The next read starts over from the first page.
        let rows = tree.children(&cancel, None).await.unwrap();
        assert_eq!(real_rows(&rows), 100);
        assert_eq!(gateway.list_calls().len(), 4);
    }

    #[tokio::test]
    async fn load_more_after_exhaustion_is_a_no_op() {
        let gateway = Arc::new(ScriptedGateway::new());
        let root = NodeId::root();
        gateway.script_page(&root, None, vm_page(&root, 0, 3, None));
        let tree = tree_with(gateway.clone());
        let cancel = CancellationToken::new();

        let before = tree.children(&cancel, None).await.unwrap();
        tree.load_more(&cancel, &root).await.unwrap();
        tree.load_more(&cancel, &root).await.unwrap();
        let after = tree.cached_children(&root);

        assert_eq!(before, after);
        assert_eq!(gateway.list_calls().len(), 1);
    }

    #[tokio::test]
    async fn refresh_leaves_siblings_untouched() {
        let gateway = Arc::new(ScriptedGateway::new());
        let root = NodeId::root();
        let left = NodeId::new("/subscriptions/left");
        let right = NodeId::new("/subscriptions/right");
        gateway.script_page(
            &root,
            None,
            ResourcePage {
                items: vec![group(&left, "left"), group(&right, "right")],
                next_cursor: None,
            },
        );
        gateway.script_page(&left, None, vm_page(&left, 0, 4, None));
        gateway.script_page(&right, None, vm_page(&right, 0, 6, None));
        let tree = tree_with(gateway.clone());
        let cancel = CancellationToken::new();

        tree.children(&cancel, None).await.unwrap();
        tree.children(&cancel, Some(&left)).await.unwrap();
        tree.children(&cancel, Some(&right)).await.unwrap();
        let left_before = tree.cached_children(&left);
        let right_before = tree.cached_children(&right);

        tree.refresh(Some(&left));

        assert!(tree.cached_children(&left).is_empty());
        assert_eq!(tree.cached_children(&right), right_before);

        // Evicted descendants are gone from the arena, siblings are not.
        assert!(!tree.contains(&left_before[0].id));
        assert!(tree.contains(&right_before[0].id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_load_more_issues_one_remote_call() {
        let gateway = Arc::new(ScriptedGateway::new());
        let root = NodeId::root();
        gateway.script_page(&root, None, vm_page(&root, 0, 100, Some("p2")));
        gateway.set_list_delay(Duration::from_millis(40));
        let tree = Arc::new(tree_with(gateway.clone()));
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            tree.load_more(&cancel, &root),
            tree.load_more(&cancel, &root),
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(gateway.list_calls().len(), 1);
        assert_eq!(real_rows(&tree.cached_children(&root)), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_load_more_shares_a_failed_outcome() {
        let gateway = Arc::new(ScriptedGateway::new());
        let root = NodeId::root();
        gateway.script_failure(
            &root,
            None,
            ScriptedFailure::Transport {
                message: "connection reset".to_string(),
            },
        );
        gateway.set_list_delay(Duration::from_millis(40));
        let tree = Arc::new(tree_with(gateway.clone()));
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            tree.load_more(&cancel, &root),
            tree.load_more(&cancel, &root),
        );
        let first = first.unwrap_err();
        let second = second.unwrap_err();

        // One remote call, and both callers observe the same failure.
        assert_eq!(gateway.list_calls().len(), 1);
        assert_eq!(classify(&first), classify(&second));
        assert!(matches!(classify(&first), Classification::Known { .. }));

        // A later retry is not poisoned by the recorded outcome.
        gateway.script_page(&root, None, vm_page(&root, 0, 3, None));
        tree.load_more(&cancel, &root).await.unwrap();
        assert_eq!(real_rows(&tree.cached_children(&root)), 3);
        assert_eq!(gateway.list_calls().len(), 2);
    }

    #[tokio::test]
    async fn failed_page_fetch_leaves_cache_unchanged() {
        let gateway = Arc::new(ScriptedGateway::new());
        let root = NodeId::root();
        gateway.script_page(&root, None, vm_page(&root, 0, 100, Some("p2")));
        gateway.script_failure(
            &root,
            Some("p2"),
            ScriptedFailure::Transport {
                message: "connection reset".to_string(),
            },
        );
        let tree = tree_with(gateway.clone());
        let cancel = CancellationToken::new();

        tree.children(&cancel, None).await.unwrap();
        let error = tree.load_more(&cancel, &root).await.unwrap_err();
        assert!(matches!(classify(&error), Classification::Known { .. }));

        // Neither partially appended nor marked exhausted.
        let rows = tree.cached_children(&root);
        assert_eq!(real_rows(&rows), 100);
        assert!(rows.last().unwrap().is_load_more());

        // A later retry re-attempts the same page.
        gateway.script_page(&root, Some("p2"), vm_page(&root, 100, 100, None));
        tree.load_more(&cancel, &root).await.unwrap();
        assert_eq!(real_rows(&tree.cached_children(&root)), 200);
        assert_eq!(
            gateway
                .list_calls()
                .iter()
                .filter(|(_, cursor)| cursor.as_deref() == Some("p2"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_the_remote_call() {
        let gateway = Arc::new(ScriptedGateway::new());
        let tree = tree_with(gateway.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = tree.load_more(&cancel, &NodeId::root()).await.unwrap_err();
        assert_eq!(classify(&error), Classification::UserCancelled);
        assert!(gateway.list_calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refresh_during_fetch_discards_the_stale_page() {
        let gateway = Arc::new(ScriptedGateway::new());
        let root = NodeId::root();
        gateway.script_page(&root, None, vm_page(&root, 0, 100, Some("p2")));
        gateway.set_list_delay(Duration::from_millis(40));
        let tree = Arc::new(tree_with(gateway.clone()));
        let cancel = CancellationToken::new();

        let fetching = {
            let tree = tree.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tree.load_more(&cancel, &NodeId::root()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tree.refresh(None);
        fetching.await.unwrap().unwrap();

        // The fetch that raced the refresh must not resurrect old children.
        assert!(tree.cached_children(&root).is_empty());
    }

    #[tokio::test]
    async fn visible_rows_descend_only_into_expanded_nodes() {
        let gateway = Arc::new(ScriptedGateway::new());
        let root = NodeId::root();
        let sub = NodeId::new("/subscriptions/s1");
        gateway.script_page(
            &root,
            None,
            ResourcePage {
                items: vec![group(&sub, "s1")],
                next_cursor: None,
            },
        );
        gateway.script_page(&sub, None, vm_page(&sub, 0, 2, Some("more")));
        let tree = tree_with(gateway);
        let cancel = CancellationToken::new();

        tree.children(&cancel, None).await.unwrap();
        tree.children(&cancel, Some(&sub)).await.unwrap();

        let collapsed = tree.visible_rows(&HashSet::new());
        assert_eq!(collapsed.len(), 1);

        let mut expanded = HashSet::new();
        expanded.insert(sub.clone());
        let rows = tree.visible_rows(&expanded);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].depth, 0);
        assert_eq!(rows[1].depth, 1);
        assert!(rows[3].is_load_more());
        assert_eq!(rows[3].id.load_more_parent(), Some(sub));
    }
}
