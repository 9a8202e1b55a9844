//! Monitoring server and querier over a real Unix socket.

use ploy_live::monitoring::{
    ExecutionProfiler, HealthStatus, HealthView, MonitoringQuerier, MonitoringServer, OrderbookView,
    PnlView, PriceLevel, SharedViewRegistry, Side, Trade,
};
use ploy_live::PloyError;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

struct Running {
    server: Arc<MonitoringServer>,
    task: tokio::task::JoinHandle<ploy_live::Result<()>>,
}

async fn serve(socket_dir: &std::path::Path, id: &str, registry: Arc<SharedViewRegistry>) -> Running {
    let profiler = Arc::new(ExecutionProfiler::default());
    profiler.record("on_tick", Duration::from_micros(120), true);
    profiler.record("on_tick", Duration::from_micros(480), false);

    let server = Arc::new(
        MonitoringServer::new(id, socket_dir, registry)
            .unwrap()
            .with_profiler(profiler),
    );
    let task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };
    for _ in 0..100 {
        if server.socket_path().exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.socket_path().exists());
    Running { server, task }
}

impl Running {
    async fn stop(self) {
        self.server.stop(Duration::from_secs(2)).await.unwrap();
        self.task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn pnl_roundtrip_and_empty_views() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SharedViewRegistry::new());
    registry.set_pnl(PnlView {
        realized: dec!(150.25),
        unrealized: dec!(-20.5),
        total: dec!(129.75),
        ..Default::default()
    });
    let running = serve(dir.path(), "inst-a", registry).await;

    let querier = MonitoringQuerier::new(dir.path());
    assert_eq!(querier.list_instances().await.unwrap(), vec!["inst-a".to_string()]);

    let pnl = querier.query_pnl("inst-a").await.unwrap();
    assert_eq!(pnl.realized, dec!(150.25));
    assert_eq!(pnl.unrealized, dec!(-20.5));
    assert_eq!(pnl.total, dec!(129.75));

    // Absent views decode to their defaults
    let positions = querier.query_positions("inst-a").await.unwrap();
    assert!(positions.positions.is_empty());
    assert!(querier.query_trades("inst-a", Some(5)).await.unwrap().is_empty());
    assert!(querier.query_assets("inst-a").await.unwrap().is_empty());
    assert_eq!(querier.query_health("inst-a").await.unwrap().status, HealthStatus::Unknown);

    running.stop().await;
    assert!(querier.list_instances().await.unwrap().is_empty());
    assert!(matches!(
        querier.query_pnl("inst-a").await,
        Err(PloyError::InstanceNotFound(_))
    ));
}

#[tokio::test]
async fn orderbook_and_trades() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SharedViewRegistry::new());
    registry.set_orderbook(OrderbookView {
        asset: "BTC-UP".into(),
        bids: vec![PriceLevel {
            price: dec!(0.48),
            size: dec!(100),
        }],
        asks: vec![PriceLevel {
            price: dec!(0.52),
            size: dec!(80),
        }],
        ..Default::default()
    });
    for (i, price) in [dec!(0.40), dec!(0.45), dec!(0.50)].into_iter().enumerate() {
        registry.record_trade(Trade {
            trade_id: format!("t{i}"),
            asset: "BTC-UP".into(),
            side: Side::Buy,
            price,
            quantity: dec!(10),
            ..Default::default()
        });
    }
    registry.set_health(HealthView {
        status: HealthStatus::Healthy,
        strategy: "momentum".into(),
        instance_id: "inst-b".into(),
        ..Default::default()
    });
    let running = serve(dir.path(), "inst-b", registry).await;
    let querier = MonitoringQuerier::new(dir.path());

    let book = querier.query_orderbook("inst-b", "BTC-UP").await.unwrap();
    assert_eq!(book.spread(), Some(dec!(0.04)));

    assert!(matches!(
        querier.query_orderbook("inst-b", "ETH-UP").await,
        Err(PloyError::AssetNotFound(ref asset)) if asset == "ETH-UP"
    ));
    assert!(matches!(
        querier.query_orderbook("inst-b", "").await,
        Err(PloyError::QueryStatus { status: 400, .. })
    ));

    let trades = querier.query_trades("inst-b", Some(2)).await.unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0].trade_id, "t2");

    assert_eq!(querier.query_assets("inst-b").await.unwrap(), vec!["BTC-UP".to_string()]);
    assert_eq!(querier.query_health("inst-b").await.unwrap().strategy, "momentum");

    let stats = querier.query_profiling_stats("inst-b").await.unwrap();
    assert_eq!(stats.total_executions, 2);
    assert_eq!(stats.failures, 1);
    let executions = querier.query_executions("inst-b", Some(1)).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].duration_us, 480);

    running.stop().await;
}

#[tokio::test]
async fn unresponsive_instance_times_out() {
    let dir = tempfile::tempdir().unwrap();
    // Accepts connections but never answers
    let listener = tokio::net::UnixListener::bind(dir.path().join("mute.sock")).unwrap();
    let _hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let querier = MonitoringQuerier::new(dir.path()).with_timeout(Duration::from_millis(200));
    let err = querier.query_metrics("mute").await.unwrap_err();
    assert!(matches!(err, PloyError::Timeout(_)), "{err}");
    assert!(err.is_transient());
}
