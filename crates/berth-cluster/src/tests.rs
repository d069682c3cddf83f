//! Tests for the berth-cluster crate.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use berth_net::{ClusterMessage, NetError, Transport};
    use berth_types::{ClusterMember, MembershipEvent, WkaAddress};
    use tokio::sync::broadcast;
    use tokio::time;

    use crate::buffer::{MessageBuffer, ReplayLog};
    use crate::error::{ClusterError, ProviderError};
    use crate::provider::{DiscoveryMode, GroupProvider, LocalProvider, ProviderEvent};
    use crate::registry::{members_map_name, MembershipRegistry, MemoryRegistry, RegistryEvent};
    use crate::resolver::ResolverContext;
    use crate::scheme::{WkaConfig, WkaMembershipScheme};

    // -----------------------------------------------------------------------
    // Test helpers
    // -----------------------------------------------------------------------

    /// A transport that records every delivery instead of dialing.
    #[derive(Default)]
    struct MockTransport {
        sends: Mutex<Vec<(String, ClusterMessage)>>,
    }

    impl MockTransport {
        fn sends(&self) -> Vec<(String, ClusterMessage)> {
            self.sends.lock().unwrap().clone()
        }

        fn send_count(&self) -> usize {
            self.sends.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn send_to(
            &self,
            member: &ClusterMember,
            msg: &ClusterMessage,
        ) -> Result<(), NetError> {
            self.sends
                .lock()
                .unwrap()
                .push((member.socket_address(), msg.clone()));
            Ok(())
        }
    }

    /// A provider whose configuration calls always fail.
    struct FailingProvider {
        local: ClusterMember,
        event_tx: broadcast::Sender<ProviderEvent>,
    }

    impl FailingProvider {
        fn new(local: ClusterMember) -> Self {
            let (event_tx, _) = broadcast::channel(8);
            Self { local, event_tx }
        }
    }

    #[async_trait::async_trait]
    impl GroupProvider for FailingProvider {
        fn local_member(&self) -> ClusterMember {
            self.local.clone()
        }

        async fn set_discovery(&self, _mode: DiscoveryMode) -> Result<(), ProviderError> {
            Err(ProviderError("provider misconfigured".to_string()))
        }

        async fn discovery(&self) -> DiscoveryMode {
            DiscoveryMode::Multicast
        }

        async fn set_connect_timeout(
            &self,
            _timeout: Duration,
        ) -> Result<(), ProviderError> {
            Err(ProviderError("provider misconfigured".to_string()))
        }

        async fn add_address(&self, _address: &WkaAddress) -> Result<bool, ProviderError> {
            Err(ProviderError("provider misconfigured".to_string()))
        }

        async fn addresses(&self) -> Vec<WkaAddress> {
            Vec::new()
        }

        fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
            self.event_tx.subscribe()
        }
    }

    /// Grab a loopback port with nothing listening on it, so seed probes
    /// fail fast with connection-refused.
    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn member(host: &str, port: u16, id: &str) -> ClusterMember {
        let mut m = ClusterMember::new(host, port);
        m.set_id(id);
        m
    }

    /// A scheme wired against in-process collaborators.
    struct TestCluster {
        scheme: WkaMembershipScheme,
        provider: Arc<LocalProvider>,
        registry: Arc<MemoryRegistry>,
        transport: Arc<MockTransport>,
        local: ClusterMember,
    }

    impl TestCluster {
        fn new(seeds: Vec<WkaAddress>) -> Self {
            let local = member("127.0.0.1", dead_port(), "uid-local");
            let provider = Arc::new(LocalProvider::new(local.clone()));
            let registry = Arc::new(MemoryRegistry::for_domain("test"));
            let transport = Arc::new(MockTransport::default());
            let scheme = WkaMembershipScheme::new(
                WkaConfig {
                    domain: "test".to_string(),
                    wka_addresses: seeds,
                    connection_timeout: None,
                },
                provider.clone(),
                registry.clone(),
                transport.clone(),
            );
            Self {
                scheme,
                provider,
                registry,
                transport,
                local,
            }
        }

        async fn init_and_join(&mut self) {
            self.scheme.init().await.unwrap();
            self.scheme.join_group().await.unwrap();
        }
    }

    /// Receive the next membership event, bounded by a deadline.
    async fn next_event(rx: &mut broadcast::Receiver<MembershipEvent>) -> MembershipEvent {
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for membership event")
            .expect("event channel closed")
    }

    // -----------------------------------------------------------------------
    // Resolver
    // -----------------------------------------------------------------------

    #[test]
    fn resolver_applies_env_port_offset() {
        let mut ctx = ResolverContext::default();
        ctx.transports
            .insert("http".to_string(), "9763".to_string());
        ctx.transports
            .insert("https".to_string(), "9443".to_string());
        ctx.env.insert("PORT_OFFSET".to_string(), "3".to_string());

        let m = ctx.local_member("prod", "10.0.0.1", 4000).unwrap();
        assert_eq!(m.property("httpPort"), Some("9766"));
        assert_eq!(m.property("httpsPort"), Some("9446"));
        assert_eq!(m.domain(), Some("prod"));
    }

    #[test]
    fn resolver_skips_offset_when_initiation_avoided() {
        let mut ctx = ResolverContext::default();
        ctx.avoid_initiation = true;
        ctx.transports
            .insert("http".to_string(), "9763".to_string());
        ctx.env.insert("PORT_OFFSET".to_string(), "3".to_string());

        let m = ctx.local_member("prod", "10.0.0.1", 4000).unwrap();
        assert_eq!(m.property("httpPort"), Some("9763"));
    }

    #[test]
    fn resolver_defaults_offset_to_zero_without_env() {
        let mut ctx = ResolverContext::default();
        ctx.transports
            .insert("http".to_string(), "9763".to_string());

        let m = ctx.local_member("prod", "10.0.0.1", 4000).unwrap();
        assert_eq!(m.property("httpPort"), Some("9763"));
    }

    #[test]
    fn resolver_rejects_malformed_ports() {
        let mut ctx = ResolverContext::default();
        ctx.transports
            .insert("http".to_string(), "ninety".to_string());
        let err = ctx.local_member("prod", "10.0.0.1", 4000).unwrap_err();
        assert!(matches!(err, ClusterError::Config(_)));

        let mut ctx = ResolverContext::default();
        ctx.env
            .insert("PORT_OFFSET".to_string(), "three".to_string());
        let err = ctx.local_member("prod", "10.0.0.1", 4000).unwrap_err();
        assert!(matches!(err, ClusterError::Config(_)));
    }

    #[test]
    fn resolver_copies_active_flag() {
        let mut ctx = ResolverContext::default();
        ctx.is_active = Some(false);
        let m = ctx.local_member("prod", "10.0.0.1", 4000).unwrap();
        assert_eq!(m.property("isActive"), Some("false"));
    }

    #[test]
    fn placeholder_resolution_prefers_bag_then_env() {
        let mut ctx = ResolverContext::default();
        ctx.transports
            .insert("http".to_string(), "9763".to_string());
        ctx.env
            .insert("REGION".to_string(), "eu-west".to_string());
        // httpPort exists in the bag; REGION only in the environment;
        // MISSING in neither.
        ctx.properties = vec![
            ("endpoint".to_string(), "${hostName}:${httpPort}".to_string()),
            ("region".to_string(), "${REGION}".to_string()),
            ("broken".to_string(), "${MISSING}".to_string()),
        ];

        let m = ctx.local_member("prod", "10.0.0.1", 4000).unwrap();
        assert_eq!(m.property("endpoint"), Some("10.0.0.1:9763"));
        assert_eq!(m.property("region"), Some("eu-west"));
        assert_eq!(m.property("broken"), Some("${MISSING}"));
    }

    #[test]
    fn placeholder_resolution_prefers_bag_over_env() {
        let mut ctx = ResolverContext::default();
        ctx.env
            .insert("httpPort".to_string(), "1111".to_string());
        ctx.transports
            .insert("http".to_string(), "9763".to_string());
        ctx.properties = vec![("p".to_string(), "${httpPort}".to_string())];

        let m = ctx.local_member("prod", "10.0.0.1", 4000).unwrap();
        assert_eq!(m.property("p"), Some("9763"));
    }

    #[test]
    fn resolver_strips_transient_host_name_key() {
        let mut ctx = ResolverContext::default();
        ctx.properties = vec![("advertised".to_string(), "${hostName}".to_string())];

        let m = ctx.local_member("prod", "10.0.0.1", 4000).unwrap();
        // Usable during substitution, absent from the published bag.
        assert_eq!(m.property("advertised"), Some("10.0.0.1"));
        assert_eq!(m.property("hostName"), None);
    }

    #[test]
    fn earlier_properties_feed_later_substitutions() {
        let mut ctx = ResolverContext::default();
        ctx.properties = vec![
            ("base".to_string(), "cluster-a".to_string()),
            ("name".to_string(), "${base}-node".to_string()),
        ];

        let m = ctx.local_member("prod", "10.0.0.1", 4000).unwrap();
        assert_eq!(m.property("name"), Some("cluster-a-node"));
    }

    // -----------------------------------------------------------------------
    // Buffer and replay log
    // -----------------------------------------------------------------------

    #[test]
    fn buffer_drain_takes_everything_once() {
        let buffer = MessageBuffer::new();
        buffer.push(ClusterMessage::new("a", vec![1]));
        buffer.push(ClusterMessage::new("b", vec![2]));

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, "a");
        assert_eq!(drained[1].id, "b");
        assert!(buffer.drain().is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn buffer_purges_expired_messages() {
        let buffer = MessageBuffer::new();
        let mut old = ClusterMessage::new("old", Vec::new());
        old.timestamp = 0;
        buffer.push(old);
        buffer.push(ClusterMessage::new("fresh", Vec::new()));

        let purged = buffer.purge_expired(Duration::from_secs(60));
        assert_eq!(purged, 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.drain()[0].id, "fresh");
    }

    #[test]
    fn replay_log_detects_duplicates() {
        let log = ReplayLog::new();
        assert!(log.first_seen("m1"));
        assert!(!log.first_seen("m1"));
        assert!(log.first_seen("m2"));
        assert_eq!(log.purge_expired(Duration::from_secs(60)), 0);
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    #[test]
    fn registry_map_name_follows_domain_convention() {
        assert_eq!(members_map_name("prod"), "$prod.members");
        assert_eq!(MemoryRegistry::for_domain("prod").map_name(), "$prod.members");
    }

    #[tokio::test]
    async fn registry_emits_entry_events() {
        let registry = MemoryRegistry::for_domain("test");
        let mut rx = registry.subscribe();

        let m = member("10.0.0.2", 4000, "uid-2");
        registry.put("uid-2", m.clone()).await;
        assert!(matches!(rx.recv().await, Ok(RegistryEvent::EntryAdded(e)) if e == m));

        registry.put("uid-2", m.clone()).await;
        assert!(matches!(rx.recv().await, Ok(RegistryEvent::EntryUpdated(_))));

        registry.remove("uid-2").await;
        assert!(matches!(rx.recv().await, Ok(RegistryEvent::EntryRemoved(_))));
        assert_eq!(registry.member_count().await, 0);
    }

    // -----------------------------------------------------------------------
    // Scheme: init
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn init_configures_address_list_discovery() {
        let seed = WkaAddress::new("127.0.0.1", dead_port());
        let mut cluster = TestCluster::new(vec![seed.clone()]);
        cluster.scheme.init().await.unwrap();

        assert_eq!(cluster.provider.discovery().await, DiscoveryMode::AddressList);
        assert_eq!(cluster.provider.addresses().await, vec![seed]);
    }

    #[tokio::test]
    async fn init_applies_connection_timeout_override() {
        let local = member("127.0.0.1", dead_port(), "uid-local");
        let provider = Arc::new(LocalProvider::new(local));
        let mut scheme = WkaMembershipScheme::new(
            WkaConfig {
                domain: "test".to_string(),
                wka_addresses: Vec::new(),
                connection_timeout: Some(Duration::from_secs(30)),
            },
            provider.clone(),
            Arc::new(MemoryRegistry::for_domain("test")),
            Arc::new(MockTransport::default()),
        );
        scheme.init().await.unwrap();
        assert_eq!(provider.connect_timeout().await, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn init_skips_duplicate_seed_addresses() {
        let seed = WkaAddress::new("127.0.0.1", dead_port());
        let mut cluster = TestCluster::new(vec![seed.clone(), seed.clone()]);
        cluster.scheme.init().await.unwrap();

        assert_eq!(cluster.provider.addresses().await, vec![seed]);
    }

    #[tokio::test]
    async fn init_twice_is_an_error() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.scheme.init().await.unwrap();
        let err = cluster.scheme.init().await.unwrap_err();
        assert!(matches!(err, ClusterError::Init(_)));
    }

    #[tokio::test]
    async fn failed_init_leaves_scheme_unjoinable() {
        let local = member("127.0.0.1", dead_port(), "uid-local");
        let mut scheme = WkaMembershipScheme::new(
            WkaConfig {
                domain: "test".to_string(),
                wka_addresses: Vec::new(),
                connection_timeout: None,
            },
            Arc::new(FailingProvider::new(local)),
            Arc::new(MemoryRegistry::for_domain("test")),
            Arc::new(MockTransport::default()),
        );

        let err = scheme.init().await.unwrap_err();
        assert!(matches!(err, ClusterError::Init(_)));

        // Still uninitialized: joining fails fast.
        let err = scheme.join_group().await.unwrap_err();
        assert!(matches!(err, ClusterError::Join(_)));
    }

    // -----------------------------------------------------------------------
    // Scheme: join
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn join_seeds_address_list_from_registry_excluding_local() {
        let mut cluster = TestCluster::new(Vec::new());
        let local = cluster.local.clone();

        let peer_a = member("10.0.0.2", 4000, "uid-a");
        let peer_b = member("10.0.0.3", 4000, "uid-b");
        cluster.registry.put("uid-a", peer_a).await;
        cluster.registry.put("uid-b", peer_b).await;
        cluster
            .registry
            .put("uid-local", local.clone())
            .await;

        cluster.init_and_join().await;

        let addresses = cluster.provider.addresses().await;
        assert_eq!(addresses.len(), 2);
        assert!(addresses.contains(&WkaAddress::new("10.0.0.2", 4000)));
        assert!(addresses.contains(&WkaAddress::new("10.0.0.3", 4000)));
        assert!(!addresses.contains(&WkaAddress::new(local.host(), local.port())));
    }

    #[tokio::test]
    async fn join_before_init_fails_fast() {
        let mut cluster = TestCluster::new(Vec::new());
        let err = cluster.scheme.join_group().await.unwrap_err();
        assert!(matches!(err, ClusterError::Join(_)));
    }

    #[tokio::test]
    async fn join_twice_is_an_error() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.init_and_join().await;
        let err = cluster.scheme.join_group().await.unwrap_err();
        assert!(matches!(err, ClusterError::Join(_)));
    }

    // -----------------------------------------------------------------------
    // Scheme: provider notifications
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn member_added_forwards_event_and_replays_buffer() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.init_and_join().await;
        let mut events = cluster.scheme.subscribe();

        cluster.scheme.enqueue(ClusterMessage::new("a", vec![1]));
        cluster.scheme.enqueue(ClusterMessage::new("b", vec![2]));

        let joiner = member("10.0.0.5", 4000, "uid-5");
        cluster.provider.announce_member_added(joiner.clone());

        assert_eq!(next_event(&mut events).await, MembershipEvent::Added(joiner));

        // Both buffered messages go to the joiner, exactly once each.
        for _ in 0..200 {
            if cluster.transport.send_count() == 2 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        let sends = cluster.transport.sends();
        assert_eq!(sends.len(), 2);
        assert!(sends.iter().all(|(target, _)| target == "10.0.0.5:4000"));
        let ids: Vec<&str> = sends.iter().map(|(_, m)| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        // A later joiner does not see the drained messages again.
        let late = member("10.0.0.6", 4000, "uid-6");
        cluster.provider.announce_member_added(late.clone());
        assert_eq!(next_event(&mut events).await, MembershipEvent::Added(late));
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.transport.send_count(), 2);
    }

    #[tokio::test]
    async fn self_notification_is_suppressed() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.init_and_join().await;
        let mut events = cluster.scheme.subscribe();

        cluster.scheme.enqueue(ClusterMessage::new("a", vec![1]));

        // The provider echoes our own join back.
        cluster
            .provider
            .announce_member_added(cluster.local.clone());
        time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        // Buffer untouched, nothing sent.
        assert_eq!(cluster.scheme.message_buffer().len(), 1);
        assert_eq!(cluster.transport.send_count(), 0);
    }

    #[tokio::test]
    async fn seed_members_are_retained_on_leave() {
        let seed_port = dead_port();
        let mut cluster = TestCluster::new(vec![WkaAddress::new("127.0.0.1", seed_port)]);
        cluster.init_and_join().await;
        let mut events = cluster.scheme.subscribe();

        let seed_member = member("127.0.0.1", seed_port, "uid-seed");
        cluster
            .registry
            .put("uid-seed", seed_member.clone())
            .await;

        cluster.provider.announce_member_removed(seed_member.clone());
        assert_eq!(
            next_event(&mut events).await,
            MembershipEvent::Removed(seed_member)
        );

        // Retained so reconnection keeps being attempted.
        time::sleep(Duration::from_millis(100)).await;
        assert!(cluster.registry.get("uid-seed").await.is_some());
    }

    #[tokio::test]
    async fn ordinary_members_are_removed_on_leave() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.init_and_join().await;
        let mut events = cluster.scheme.subscribe();

        let peer = member("10.0.0.7", 4000, "uid-7");
        cluster.registry.put("uid-7", peer.clone()).await;

        cluster.provider.announce_member_removed(peer.clone());
        assert_eq!(next_event(&mut events).await, MembershipEvent::Removed(peer));

        for _ in 0..200 {
            if cluster.registry.get("uid-7").await.is_none() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("non-seed member was not removed from the registry");
    }

    #[tokio::test]
    async fn leave_of_unregistered_member_is_a_no_op() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.init_and_join().await;
        let mut events = cluster.scheme.subscribe();

        // Present in neither view beyond the provider's notification.
        let ghost = member("10.0.0.8", 4000, "uid-8");
        cluster.provider.announce_member_removed(ghost.clone());

        // The event is still forwarded; the registry stays empty.
        assert_eq!(next_event(&mut events).await, MembershipEvent::Removed(ghost));
        assert_eq!(cluster.registry.member_count().await, 0);
    }

    // -----------------------------------------------------------------------
    // Scheme: registry notifications
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn registry_entry_added_updates_address_list() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.init_and_join().await;

        // Another process publishes its join through the registry before
        // our provider observes it.
        let remote = member("10.0.0.9", 4000, "uid-9");
        cluster.registry.put("uid-9", remote).await;

        let expected = WkaAddress::new("10.0.0.9", 4000);
        for _ in 0..200 {
            if cluster.provider.addresses().await.contains(&expected) {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry entry was not mirrored into the address list");
    }

    #[tokio::test]
    async fn registry_entry_for_local_member_is_not_mirrored() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.init_and_join().await;

        cluster
            .registry
            .put("uid-local", cluster.local.clone())
            .await;
        time::sleep(Duration::from_millis(100)).await;

        assert!(cluster.provider.addresses().await.is_empty());
    }

    #[tokio::test]
    async fn registry_removal_is_not_handled_by_the_entry_listener() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.init_and_join().await;
        let mut events = cluster.scheme.subscribe();

        let peer = member("10.0.0.10", 4000, "uid-10");
        cluster.registry.put("uid-10", peer).await;
        cluster.registry.remove("uid-10").await;
        time::sleep(Duration::from_millis(100)).await;

        // Entry removal alone produces no membership event; only the
        // provider's view drives removals.
        loop {
            match events.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => break,
                Ok(MembershipEvent::Removed(_)) => {
                    panic!("registry removal leaked a membership event")
                }
                Ok(_) => {}
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scheme: lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn leave_stops_the_listener_task() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.init_and_join().await;
        assert!(cluster.scheme.is_running());

        cluster.scheme.leave();
        for _ in 0..200 {
            if !cluster.scheme.is_running() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("listener task did not stop after leave");
    }

    #[tokio::test]
    async fn alive_member_count_reflects_registry_size() {
        let mut cluster = TestCluster::new(Vec::new());
        cluster.init_and_join().await;
        assert_eq!(cluster.scheme.alive_member_count().await, 0);

        cluster
            .registry
            .put("uid-11", member("10.0.0.11", 4000, "uid-11"))
            .await;
        assert_eq!(cluster.scheme.alive_member_count().await, 1);
    }

    // Property-bag construction for members discovered remotely.
    #[test]
    fn remote_member_property_bags_replace_wholesale() {
        let mut m = member("10.0.0.12", 4000, "uid-12");
        let mut bag = BTreeMap::new();
        bag.insert("subDomain".to_string(), "worker".to_string());
        m.set_properties(bag);
        assert_eq!(m.property("subDomain"), Some("worker"));
    }
}
