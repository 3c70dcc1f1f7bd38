use anyhow::Result;
use injector::{Container, ContainerConfiguration, DiError, ScopeKind, TypeIdentity};
use std::sync::Arc;

#[derive(Debug)]
struct Alpha {
    beta: Option<Arc<Beta>>,
}

#[derive(Debug)]
struct Beta {
    alpha: Option<Arc<Alpha>>,
}

struct Recursive {
    inner: Option<Arc<Recursive>>,
}

struct Leaf;

fn register_mutual_cycle(container: &Container) {
    container.register(|resolver| {
        Ok(Alpha {
            beta: resolver.resolve_optional::<Beta>(),
        })
    });
    container.register(|resolver| {
        Ok(Beta {
            alpha: resolver.resolve_optional::<Alpha>(),
        })
    });
}

#[test]
fn test_two_node_cycle_is_detected() -> Result<()> {
    let container = Container::new();
    register_mutual_cycle(&container);

    let alpha = container.resolve::<Alpha>()?;
    let beta = alpha.beta.as_ref().expect("beta resolved");
    assert!(beta.alpha.is_none(), "re-entrant resolution must not succeed");

    let cycles = container.circular_dependencies();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].len(), 2);
    assert!(cycles[0].contains(TypeIdentity::of::<Alpha>()));
    assert!(cycles[0].contains(TypeIdentity::of::<Beta>()));
    assert_eq!(cycles[0].to_string(), "Alpha -> Beta -> Alpha");
    Ok(())
}

#[test]
fn test_cycle_after_buffer_overflow_is_detected() -> Result<()> {
    let container = Container::with_configuration(ContainerConfiguration::minimal());
    container.register(|_| Ok(Leaf));
    for _ in 0..2_000 {
        container.resolve::<Leaf>()?;
    }

    register_mutual_cycle(&container);
    container.resolve::<Alpha>()?;

    let cycles = container.circular_dependencies();
    assert_eq!(cycles.len(), 1);
    assert!(cycles[0].contains(TypeIdentity::of::<Alpha>()));
    assert!(cycles[0].contains(TypeIdentity::of::<Beta>()));

    let usage = container.usage_stats();
    assert_eq!(usage[&TypeIdentity::of::<Leaf>()].resolution_count, 2_000);
    assert_eq!(container.stats().dropped_events, 0);
    Ok(())
}

#[test]
fn test_self_loop_is_a_one_node_cycle() -> Result<()> {
    let container = Container::new();
    container.register_scoped(ScopeKind::Transient, |resolver| {
        Ok(Recursive {
            inner: resolver.resolve_optional::<Recursive>(),
        })
    });

    let recursive = container.resolve::<Recursive>()?;
    assert!(recursive.inner.is_none());

    let cycles = container.circular_dependencies();
    assert_eq!(cycles.len(), 1);
    assert!(cycles[0].is_self_loop());
    assert_eq!(cycles[0].path, vec![TypeIdentity::of::<Recursive>()]);
    Ok(())
}

#[test]
fn test_throwing_resolution_reports_the_chain() {
    let container = Container::new();
    container.register(|resolver| {
        resolver.resolve::<Beta>()?;
        Ok(Alpha { beta: None })
    });
    container.register(|resolver| {
        resolver.resolve::<Alpha>()?;
        Ok(Beta { alpha: None })
    });

    let err = container.resolve::<Alpha>().unwrap_err();
    let chain = std::iter::successors(Some(err.clone()), |err| {
        err.cause().and_then(|c| c.downcast_ref::<DiError>()).cloned()
    })
    .find_map(|err| match err {
        DiError::CircularDependency { chain } => Some(chain),
        _ => None,
    })
    .expect("cycle in the cause chain");

    assert_eq!(
        chain,
        vec![
            TypeIdentity::of::<Alpha>(),
            TypeIdentity::of::<Beta>(),
            TypeIdentity::of::<Alpha>(),
        ]
    );
}

#[test]
fn test_acyclic_graph_reports_nothing() -> Result<()> {
    let container = Container::new();
    container.register(|_| Ok(Leaf));
    container.register(|resolver| {
        resolver.resolve::<Leaf>()?;
        Ok(Alpha { beta: None })
    });

    container.resolve::<Alpha>()?;
    assert!(container.circular_dependencies().is_empty());
    assert_eq!(
        container
            .dependency_graph()
            .dependencies_of(TypeIdentity::of::<Alpha>()),
        vec![TypeIdentity::of::<Leaf>()]
    );
    Ok(())
}

#[test]
fn test_strict_bootstrap_rejects_declared_cycle() {
    let container = Container::with_configuration(ContainerConfiguration::production());
    container
        .bootstrap(|store| {
            store.register(|_| Ok(Leaf));
        })
        .expect("initial bootstrap");

    let result = container.bootstrap(|store| {
        store
            .bind::<Alpha>()
            .depends_on::<Beta>()
            .to_factory(|_| Ok(Alpha { beta: None }));
        store
            .bind::<Beta>()
            .depends_on::<Alpha>()
            .to_factory(|_| Ok(Beta { alpha: None }));
    });

    assert!(matches!(result, Err(DiError::CircularDependency { .. })));
    assert!(container.is_registered::<Leaf>());
    assert!(!container.is_registered::<Alpha>());
}

#[test]
fn test_lenient_bootstrap_publishes_declared_cycle() -> Result<()> {
    let container = Container::new();
    container.bootstrap(|store| {
        store
            .bind::<Alpha>()
            .depends_on::<Beta>()
            .to_factory(|_| Ok(Alpha { beta: None }));
        store
            .bind::<Beta>()
            .depends_on::<Alpha>()
            .to_factory(|_| Ok(Beta { alpha: None }));
    })?;

    assert!(container.is_registered::<Alpha>());
    assert!(container.is_registered::<Beta>());
    Ok(())
}

#[test]
fn test_dot_export_highlights_cycles() -> Result<()> {
    let container = Container::new();
    register_mutual_cycle(&container);
    container.resolve::<Beta>()?;

    let cycles = container.circular_dependencies();
    let dot = container.dependency_graph().to_dot(&cycles);
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("color=red"));
    Ok(())
}
