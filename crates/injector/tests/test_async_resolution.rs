use anyhow::Result;
use injector::{Container, DiError, Domain, ScopeKind};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{sleep, timeout};

#[derive(Debug)]
struct Connection {
    id: usize,
}

struct Session {
    connection: Arc<Connection>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_singleton_constructed_once() -> Result<()> {
    let container = Container::new();
    let constructions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&constructions);
    container.register_async(ScopeKind::Singleton, move |_| {
        let counter = Arc::clone(&counter);
        async move {
            let id = counter.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(30)).await;
            Ok(Connection { id })
        }
    });

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let container = container.clone();
            tokio::spawn(async move { container.resolve_async::<Connection>().await })
        })
        .collect();

    let mut connections = Vec::new();
    for task in tasks {
        connections.push(task.await??);
    }

    assert_eq!(constructions.load(Ordering::SeqCst), 1);
    assert!(connections.iter().all(|c| Arc::ptr_eq(c, &connections[0])));
    assert_eq!(connections[0].id, 0);
    Ok(())
}

#[tokio::test]
async fn test_async_factories_resolve_their_dependencies() -> Result<()> {
    let container = Container::new();
    container.register(|_| Ok(Connection { id: 1 }));
    container.register_async(ScopeKind::Transient, |resolver| async move {
        Ok(Session {
            connection: resolver.resolve_async::<Connection>().await?,
        })
    });

    let a = container.resolve_async::<Session>().await?;
    let b = container.resolve_async::<Session>().await?;
    assert!(!Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a.connection, &b.connection));
    Ok(())
}

#[tokio::test]
async fn test_sync_registration_resolves_asynchronously() -> Result<()> {
    let container = Container::new();
    container.register(|_| Ok(Connection { id: 5 }));

    assert_eq!(container.resolve_async::<Connection>().await?.id, 5);
    assert!(container.resolve_optional_async::<Session>().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_cancelled_construction_lets_next_caller_retry() -> Result<()> {
    let container = Container::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    container.register_async(ScopeKind::Singleton, move |_| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                sleep(Duration::from_secs(3600)).await;
            }
            Ok(Connection { id: attempt })
        }
    });

    let stuck = {
        let container = container.clone();
        tokio::spawn(async move { container.resolve_async::<Connection>().await })
    };
    sleep(Duration::from_millis(20)).await;
    stuck.abort();
    assert!(stuck.await.unwrap_err().is_cancelled());

    let connection = timeout(
        Duration::from_secs(5),
        container.resolve_async::<Connection>(),
    )
    .await??;
    assert_eq!(connection.id, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_dropped_future_releases_slot() -> Result<()> {
    let container = Container::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    container.register_async(ScopeKind::Singleton, move |_| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                sleep(Duration::from_secs(3600)).await;
            }
            Ok(Connection { id: attempt })
        }
    });

    let gave_up = timeout(
        Duration::from_millis(20),
        container.resolve_async::<Connection>(),
    )
    .await;
    assert!(gave_up.is_err());

    assert_eq!(container.resolve_async::<Connection>().await?.id, 1);
    Ok(())
}

#[tokio::test]
async fn test_waiters_time_out() -> Result<()> {
    let container = Container::builder()
        .with_construction_timeout(Duration::from_millis(50))
        .build()?;
    container.register_async(ScopeKind::Singleton, |_| async {
        sleep(Duration::from_millis(500)).await;
        Ok(Connection { id: 0 })
    });

    let builder = {
        let container = container.clone();
        tokio::spawn(async move { container.resolve_async::<Connection>().await })
    };
    sleep(Duration::from_millis(10)).await;

    let err = container.resolve_async::<Connection>().await.unwrap_err();
    assert!(matches!(err, DiError::ConstructionTimeout { .. }));
    assert!(builder.await?.is_ok());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_construction_hops_into_home_domain() -> Result<()> {
    let container = Container::new();
    container.attach_executor(Domain::Background(1), tokio::runtime::Handle::current());

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    container.modify(|store| {
        store
            .bind::<Connection>()
            .scope(ScopeKind::Transient)
            .on_domain(Domain::Background(1))
            .to_async(move |resolver| {
                recorder.lock().push(resolver.domain());
                async { Ok(Connection { id: 0 }) }
            });
    });

    container.on(Domain::Main).resolve_async::<Connection>().await?;
    container
        .on(Domain::Background(1))
        .resolve_async::<Connection>()
        .await?;

    assert_eq!(*seen.lock(), vec![Domain::Background(1), Domain::Background(1)]);

    let usage = container
        .domain_usage(injector::TypeIdentity::of::<Connection>())
        .expect("usage recorded");
    assert_eq!(usage.total, 2);
    assert_eq!(usage.hops, 1);
    Ok(())
}

#[tokio::test]
async fn test_without_executor_construction_stays_with_caller() -> Result<()> {
    let container = Container::new();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    container.modify(|store| {
        store
            .bind::<Connection>()
            .on_domain(Domain::Background(3))
            .to_async(move |resolver| {
                recorder.lock().push(resolver.domain());
                async { Ok(Connection { id: 0 }) }
            });
    });

    container.on(Domain::Main).resolve_async::<Connection>().await?;
    assert_eq!(*seen.lock(), vec![Domain::Main]);
    Ok(())
}

#[tokio::test]
async fn test_periodic_analysis_stops_with_container() -> Result<()> {
    let container = Container::new();
    let analysis = container.spawn_periodic_analysis(Duration::from_millis(5));
    sleep(Duration::from_millis(20)).await;
    assert!(!analysis.is_finished());

    drop(container);
    timeout(Duration::from_secs(2), analysis).await??;
    Ok(())
}

struct Settings {
    endpoint: String,
}

struct Primary;
struct Replica;

#[tokio::test]
async fn test_async_bootstrap_publishes_loaded_store() -> Result<()> {
    let container = Container::new();
    let published = container
        .bootstrap_async(|mut store| async move {
            sleep(Duration::from_millis(5)).await;
            store.register_instance(Settings {
                endpoint: "db://primary".to_string(),
            });
            store.register_scoped(ScopeKind::Transient, |resolver| {
                resolver.resolve::<Settings>()?;
                Ok(Connection { id: 7 })
            });
            Ok(store)
        })
        .await;

    assert!(published);
    assert!(container.is_bootstrapped());
    assert_eq!(container.resolve::<Settings>()?.endpoint, "db://primary");
    assert_eq!(container.resolve::<Connection>()?.id, 7);
    Ok(())
}

#[tokio::test]
async fn test_failed_async_bootstrap_keeps_previous_store() -> Result<()> {
    let container = Container::new();
    container.bootstrap(|store| {
        store.register(|_| Ok(Connection { id: 1 }));
    })?;

    let published = container
        .bootstrap_async(|mut store| async move {
            store.register_instance(Settings {
                endpoint: String::new(),
            });
            if store.is_registered::<Settings>() {
                anyhow::bail!("settings endpoint unreachable");
            }
            Ok(store)
        })
        .await;

    assert!(!published);
    assert!(!container.is_registered::<Settings>());
    assert_eq!(container.resolve::<Connection>()?.id, 1);
    Ok(())
}

#[tokio::test]
async fn test_strict_async_bootstrap_rejects_declared_cycle() -> Result<()> {
    let container = Container::with_configuration(injector::ContainerConfiguration::production());
    container.bootstrap(|store| {
        store.register(|_| Ok(Connection { id: 1 }));
    })?;

    let published = container
        .bootstrap_async(|mut store| async move {
            store
                .bind::<Primary>()
                .depends_on::<Replica>()
                .to_factory(|_| Ok(Primary));
            store
                .bind::<Replica>()
                .depends_on::<Primary>()
                .to_factory(|_| Ok(Replica));
            Ok(store)
        })
        .await;

    assert!(!published);
    assert!(!container.is_registered::<Primary>());
    assert_eq!(container.resolve::<Connection>()?.id, 1);
    Ok(())
}
