use std::sync::Arc;
use std::sync::mpsc::Receiver;

use farmcache::cache::{
    AddOptions, AppCache, CacheConfig, CacheDependency, CacheValue, ChannelTransport, KeyBuilder,
    WebFarmTask, WebFarmTaskType,
};
use tempfile::TempDir;

struct Node {
    cache: AppCache,
    outbox: Receiver<WebFarmTask>,
    _dir: TempDir,
}

impl Node {
    fn new(synchronize: bool) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let (transport, outbox) = ChannelTransport::new();
        let config = CacheConfig {
            synchronize,
            ..CacheConfig::with_persistent_dir(dir.path())
        };
        let cache = AppCache::builder(config)
            .transport(Arc::new(transport))
            .build();
        Self {
            cache,
            outbox,
            _dir: dir,
        }
    }
}

/// Deliver every pending task of every node to all other nodes.
fn pump(nodes: &[Node]) -> usize {
    let mut delivered = 0;
    loop {
        let pending: Vec<(usize, WebFarmTask)> = nodes
            .iter()
            .enumerate()
            .flat_map(|(origin, node)| node.outbox.try_iter().map(move |task| (origin, task)))
            .collect();
        if pending.is_empty() {
            return delivered;
        }
        for (origin, task) in pending {
            for (index, node) in nodes.iter().enumerate() {
                if index != origin {
                    node.cache.process_task(&task).expect("replay succeeds");
                    delivered += 1;
                }
            }
        }
    }
}

fn seed_news(cache: &AppCache) {
    cache.ensure_key("news_list", None);
    cache
        .add(
            "news|1",
            CacheValue::object("story".to_string()),
            AddOptions::new().depends_on(CacheDependency::from_keys(["news_list"])),
        )
        .expect("add news item");
}

#[test]
fn touch_on_one_node_invalidates_dependents_everywhere() {
    let nodes = [Node::new(true), Node::new(true), Node::new(true)];
    for node in &nodes {
        seed_news(&node.cache);
    }

    nodes[0].cache.touch("news_list");
    assert_eq!(pump(&nodes), 2);

    for node in &nodes {
        assert!(node.cache.get("news|1", false).is_none());
        assert!(node.cache.contains("news_list", false));
    }
}

#[test]
fn replay_never_rebroadcasts() {
    let nodes = [Node::new(true), Node::new(true)];
    nodes[0].cache.remove("anything", false);
    nodes[0].cache.clear_cache("a.");
    nodes[0].cache.touch_keys(["x", "y"]);

    assert_eq!(pump(&nodes), 3);
    assert_eq!(nodes[1].outbox.try_iter().count(), 0);
}

#[test]
fn remove_follows_the_synchronization_toggle() {
    let node = Node::new(false);
    node.cache
        .add("Item|1", CacheValue::object(1_u8), AddOptions::new().case_sensitive(true))
        .expect("add");

    node.cache.remove("Item|1", true);
    assert!(node.outbox.try_recv().is_err());
    assert!(!node.cache.contains("Item|1", true));

    node.cache.synchronizer().set_enabled(true);
    node.cache.remove("Item|1", true);

    let tasks: Vec<WebFarmTask> = node.outbox.try_iter().collect();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, WebFarmTaskType::RemoveCacheItem);
    assert_eq!(tasks[0].payload, ["Item|1", "true"]);
}

#[test]
fn case_sensitive_remove_replays_with_the_same_flag() {
    let nodes = [Node::new(true), Node::new(true)];
    for node in &nodes {
        node.cache
            .add("Item|1", CacheValue::object(1_u8), AddOptions::new().case_sensitive(true))
            .expect("add");
        node.cache
            .add("item|1", CacheValue::object(2_u8), AddOptions::new())
            .expect("add");
    }

    nodes[0].cache.remove("Item|1", true);
    pump(&nodes);

    for node in &nodes {
        assert!(!node.cache.contains("Item|1", true));
        assert!(node.cache.contains("item|1", false));
    }
}

#[test]
fn full_page_clear_reaches_every_node() {
    let nodes = [Node::new(true), Node::new(true)];
    for node in &nodes {
        for site in ["corp", "shop"] {
            node.cache
                .add(
                    &KeyBuilder::full_page_key(site, "/"),
                    CacheValue::object(site.to_string()),
                    AddOptions::new(),
                )
                .expect("add page");
        }
    }

    nodes[1].cache.clear_full_page_cache(Some("corp"));
    pump(&nodes);

    for node in &nodes {
        assert!(!node.cache.contains(&KeyBuilder::full_page_key("corp", "/"), false));
        assert!(node.cache.contains(&KeyBuilder::full_page_key("shop", "/"), false));
    }
}

#[test]
fn tasks_survive_a_serialized_hop() {
    let nodes = [Node::new(true), Node::new(true)];
    for node in &nodes {
        seed_news(&node.cache);
    }

    nodes[0].cache.touch("news_list");
    let wire: Vec<String> = nodes[0]
        .outbox
        .try_iter()
        .map(|task| serde_json::to_string(&task).expect("serialize task"))
        .collect();
    assert_eq!(wire.len(), 1);

    for payload in wire {
        let task: WebFarmTask = serde_json::from_str(&payload).expect("deserialize task");
        nodes[1]
            .cache
            .process_task_named(task.task_type.as_str(), task.site_name.as_deref(), task.payload)
            .expect("replay");
    }
    assert!(nodes[1].cache.get("news|1", false).is_none());
}
