//! Load exchange between nodes over the in-memory transport.

mod common;

use common::*;
use peernet_network::{
    EnvelopePayload, ExchangeConfig, MemoryNetwork, NetworkError, NetworkLoadExchangeService,
    NetworkLoadService, LoadServiceConfig,
};
use peernet_types::{Address, CloseReason, NetworkLoad, NetworkLoadExchangeResponse};
use std::sync::Arc;
use std::time::Duration;

fn quick_config(timeout: Duration) -> ExchangeConfig {
    ExchangeConfig {
        initial_delay: Duration::from_secs(3600),
        interval: Duration::from_secs(3600),
        max_idle: Duration::ZERO,
        timeout,
    }
}

#[tokio::test]
async fn test_round_trip_updates_both_sides() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = started_memory_node(&network, 8101).await;
    let b = started_memory_node(&network, 8102).await;

    let exchange_a = NetworkLoadExchangeService::new(Arc::clone(&a), quick_config(Duration::from_secs(2)));
    let exchange_b = NetworkLoadExchangeService::new(Arc::clone(&b), quick_config(Duration::from_secs(2)));
    exchange_a.initialize().unwrap();
    exchange_b.initialize().unwrap();

    // Loads change after the handshake, so only the exchange can carry them.
    let connection = a.connect(&b.my_address()).await.unwrap();
    a.network_load().update(NetworkLoad::new(0.25, 1));
    b.network_load().update(NetworkLoad::new(0.75, 1));
    let peers_load = exchange_a.request(&connection).await.unwrap();

    assert_eq!(peers_load, NetworkLoad::new(0.75, 1));
    assert_eq!(connection.peers_network_load_snapshot().current(), NetworkLoad::new(0.75, 1));
    assert_eq!(connection.network_load_snapshot().current(), NetworkLoad::new(0.25, 1));
    assert_eq!(connection.metrics().snapshot().rtt_samples.len(), 1);
    assert_eq!(exchange_a.num_pending(), 0);

    // The responder learned the requester's load from the request alone.
    let reached = eventually(Duration::from_secs(1), || {
        let b = Arc::clone(&b);
        async move {
            b.connections()
                .await
                .first()
                .map(|c| c.peers_network_load_snapshot().current() == NetworkLoad::new(0.25, 1))
                .unwrap_or(false)
        }
    })
    .await;
    assert!(reached);

    exchange_a.shutdown();
    exchange_b.shutdown();
}

#[tokio::test]
async fn test_wrong_nonce_keeps_exchange_pending_until_timeout() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = started_memory_node(&network, 8111).await;
    // No exchange service on the peer, it answers by hand.
    let b = started_memory_node(&network, 8112).await;

    let exchange = NetworkLoadExchangeService::new(Arc::clone(&a), quick_config(Duration::from_millis(300)));
    exchange.initialize().unwrap();

    let connection = a.connect(&b.my_address()).await.unwrap();
    let request = {
        let exchange = Arc::clone(&exchange);
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { exchange.request(&connection).await })
    };
    assert!(
        eventually(Duration::from_secs(1), || {
            let exchange = Arc::clone(&exchange);
            let id = connection.id().clone();
            async move { exchange.is_pending(&id) }
        })
        .await
    );

    let back = accepted_connection(&b, &a.my_address()).await;
    for nonce in [1, 2, 3] {
        back.send(EnvelopePayload::NetworkLoadExchangeResponse(NetworkLoadExchangeResponse {
            request_nonce: nonce,
            network_load: NetworkLoad::new(0.9, 9),
        }))
        .await
        .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(exchange.is_pending(connection.id()));

    let result = request.await.unwrap();
    assert!(matches!(result, Err(NetworkError::Timeout(_))));
    assert!(!exchange.is_pending(connection.id()));
    assert_ne!(connection.peers_network_load_snapshot().current(), NetworkLoad::new(0.9, 9));
}

#[tokio::test]
async fn test_disconnect_fails_pending_exchange() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = started_memory_node(&network, 8121).await;
    let b = started_memory_node(&network, 8122).await;

    let exchange = NetworkLoadExchangeService::new(Arc::clone(&a), quick_config(Duration::from_secs(30)));
    exchange.initialize().unwrap();

    let connection = a.connect(&b.my_address()).await.unwrap();
    let request = {
        let exchange = Arc::clone(&exchange);
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { exchange.request(&connection).await })
    };
    assert!(
        eventually(Duration::from_secs(1), || {
            let exchange = Arc::clone(&exchange);
            let id = connection.id().clone();
            async move { exchange.is_pending(&id) }
        })
        .await
    );

    let back = accepted_connection(&b, &a.my_address()).await;
    b.close_connection(&back, CloseReason::ManuallyClosed).await;

    let result = tokio::time::timeout(Duration::from_secs(2), request)
        .await
        .expect("disconnect must fail the exchange well before its timeout")
        .unwrap();
    assert!(matches!(result, Err(NetworkError::ConnectionClosed { .. })));
    assert_eq!(exchange.num_pending(), 0);
}

#[tokio::test]
async fn test_duplicate_request_is_rejected() {
    let network = MemoryNetwork::new();
    let a = started_memory_node(&network, 8131).await;
    let b = started_memory_node(&network, 8132).await;

    let exchange = NetworkLoadExchangeService::new(Arc::clone(&a), quick_config(Duration::from_millis(300)));
    exchange.initialize().unwrap();
    let connection = a.connect(&b.my_address()).await.unwrap();

    let first = {
        let exchange = Arc::clone(&exchange);
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { exchange.request(&connection).await })
    };
    assert!(
        eventually(Duration::from_secs(1), || {
            let exchange = Arc::clone(&exchange);
            let id = connection.id().clone();
            async move { exchange.is_pending(&id) }
        })
        .await
    );

    assert!(matches!(
        exchange.request(&connection).await,
        Err(NetworkError::AlreadyPending(_))
    ));
    assert_eq!(exchange.request_from_idle_peers().await, 0);
    assert!(matches!(first.await.unwrap(), Err(NetworkError::Timeout(_))));
}

#[tokio::test]
async fn test_abandoned_request_does_not_block_the_next_one() {
    let network = MemoryNetwork::new();
    let a = started_memory_node(&network, 8181).await;
    // Silent peer: no exchange service answers.
    let b = started_memory_node(&network, 8182).await;

    let exchange = NetworkLoadExchangeService::new(Arc::clone(&a), quick_config(Duration::from_millis(200)));
    exchange.initialize().unwrap();
    let connection = a.connect(&b.my_address()).await.unwrap();

    let abandoned = tokio::time::timeout(Duration::from_millis(20), exchange.request(&connection)).await;
    assert!(abandoned.is_err());
    assert!(!exchange.is_pending(connection.id()));

    let second = exchange.request(&connection).await;
    assert!(matches!(second, Err(NetworkError::Timeout(_))));
    assert_eq!(exchange.num_pending(), 0);
}

#[tokio::test]
async fn test_idle_peers_are_asked() {
    let network = MemoryNetwork::new();
    let a = started_memory_node(&network, 8141).await;
    let b = started_memory_node(&network, 8142).await;
    let c = started_memory_node(&network, 8143).await;
    b.network_load().update(NetworkLoad::new(0.5, 2));
    c.network_load().update(NetworkLoad::new(0.6, 2));

    let exchange_a = NetworkLoadExchangeService::new(Arc::clone(&a), quick_config(Duration::from_secs(2)));
    let exchange_b = NetworkLoadExchangeService::new(Arc::clone(&b), quick_config(Duration::from_secs(2)));
    let exchange_c = NetworkLoadExchangeService::new(Arc::clone(&c), quick_config(Duration::from_secs(2)));
    for exchange in [&exchange_a, &exchange_b, &exchange_c] {
        exchange.initialize().unwrap();
    }

    let to_b = a.connect(&b.my_address()).await.unwrap();
    let to_c = a.connect(&c.my_address()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(exchange_a.request_from_idle_peers().await, 2);
    assert!(
        eventually(Duration::from_secs(2), || {
            let (to_b, to_c) = (Arc::clone(&to_b), Arc::clone(&to_c));
            async move {
                to_b.peers_network_load_snapshot().current() == NetworkLoad::new(0.5, 2)
                    && to_c.peers_network_load_snapshot().current() == NetworkLoad::new(0.6, 2)
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_shutdown_fails_pending_and_rejects_new_requests() {
    let network = MemoryNetwork::new();
    let a = started_memory_node(&network, 8151).await;
    let b = started_memory_node(&network, 8152).await;

    let exchange = NetworkLoadExchangeService::new(Arc::clone(&a), quick_config(Duration::from_secs(30)));
    exchange.initialize().unwrap();
    let connection = a.connect(&b.my_address()).await.unwrap();

    let request = {
        let exchange = Arc::clone(&exchange);
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { exchange.request(&connection).await })
    };
    assert!(
        eventually(Duration::from_secs(1), || {
            let exchange = Arc::clone(&exchange);
            let id = connection.id().clone();
            async move { exchange.is_pending(&id) }
        })
        .await
    );

    exchange.shutdown();
    assert!(matches!(request.await.unwrap(), Err(NetworkError::Shutdown)));
    assert!(matches!(exchange.request(&connection).await, Err(NetworkError::Shutdown)));
}

#[tokio::test]
async fn test_unsupported_transport_is_unavailable() {
    let network = MemoryNetwork::new();
    let a = started_memory_node(&network, 8161).await;

    let err = a.connect(&Address::new("abcdef.i2p", 4444)).await.unwrap_err();
    assert!(matches!(err, NetworkError::TransportUnavailable { .. }));
}

#[tokio::test]
async fn test_load_service_reflects_traffic() {
    let network = MemoryNetwork::new();
    let a = started_memory_node(&network, 8171).await;
    let b = started_memory_node(&network, 8172).await;
    let load_service = NetworkLoadService::new(Arc::clone(&a), None, LoadServiceConfig::default());

    assert_eq!(load_service.update_network_load().await.load(), 0.0);

    a.connect(&b.my_address()).await.unwrap();
    let load = load_service.update_network_load().await;
    assert_eq!(load.num_connections(), 1);
    assert!(load.load() > 0.0);
    assert_eq!(a.network_load().current(), load);
    assert_eq!(a.network_load().previous().map(|l| l.load()), Some(0.0));
}
