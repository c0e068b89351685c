use super::*;

fn svc(name: &str, deps: &[&str]) -> (String, Vec<String>) {
    (
        name.to_string(),
        deps.iter().map(|d| d.to_string()).collect(),
    )
}

#[test]
fn test_no_deps_keeps_registration_order() {
    let services = vec![svc("zebra", &[]), svc("alpha", &[]), svc("mango", &[])];
    let order = get_start_order(&services).unwrap();
    assert_eq!(order, vec!["zebra", "alpha", "mango"]);
}

#[test]
fn test_simple_deps() {
    let services = vec![svc("b", &["a"]), svc("a", &[])];
    assert_eq!(get_start_order(&services).unwrap(), vec!["a", "b"]);
}

#[test]
fn test_chain_deps() {
    let services = vec![svc("c", &["b"]), svc("b", &["a"]), svc("a", &[])];
    assert_eq!(get_start_order(&services).unwrap(), vec!["a", "b", "c"]);
}

#[test]
fn test_default_stack_order() {
    let services = vec![
        svc("ai", &["database", "cache"]),
        svc("database", &[]),
        svc("cache", &[]),
        svc("storage", &[]),
    ];

    let order = get_start_order(&services).unwrap();
    assert_eq!(order, vec!["database", "cache", "ai", "storage"]);
}

#[test]
fn test_tie_break_prefers_earlier_registration_once_ready() {
    // "late" becomes ready after "a"; "b" was registered before it
    let services = vec![svc("a", &[]), svc("late", &["a"]), svc("b", &[])];
    let order = get_start_order(&services).unwrap();
    assert_eq!(order, vec!["a", "late", "b"]);
}

#[test]
fn test_diamond() {
    let services = vec![
        svc("top", &[]),
        svc("left", &["top"]),
        svc("right", &["top"]),
        svc("bottom", &["left", "right"]),
    ];
    let order = get_start_order(&services).unwrap();
    assert_eq!(order, vec!["top", "left", "right", "bottom"]);
}

#[test]
fn test_duplicate_dependency_entries() {
    let services = vec![svc("a", &[]), svc("b", &["a", "a"])];
    assert_eq!(get_start_order(&services).unwrap(), vec!["a", "b"]);
}

#[test]
fn test_stop_order_is_exact_reverse() {
    let services = vec![
        svc("ai", &["database"]),
        svc("database", &[]),
        svc("cache", &[]),
    ];
    let mut start = get_start_order(&services).unwrap();
    let stop = get_stop_order(&services).unwrap();
    start.reverse();
    assert_eq!(stop, start);
}

#[test]
fn test_cycle_detection() {
    let services = vec![
        svc("alpha", &["beta"]),
        svc("beta", &["alpha"]),
        svc("gamma", &[]),
    ];
    let err = get_start_order(&services).unwrap_err();
    match err {
        LifecycleError::DependencyCycle(msg) => {
            assert!(msg.contains("alpha"));
            assert!(msg.contains("beta"));
            assert!(!msg.contains("gamma"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_missing_dep() {
    let services = vec![svc("a", &["nonexistent"])];
    let result = get_start_order(&services);
    assert!(matches!(result, Err(LifecycleError::MissingDependency { .. })));
}

// --- Dependency closure ---

#[test]
fn test_with_dependencies_is_transitive() {
    let services = vec![
        svc("database", &[]),
        svc("vector", &["database"]),
        svc("ai", &["vector"]),
        svc("storage", &[]),
    ];

    let set = with_dependencies(&services, &["ai".to_string()]).unwrap();
    let mut names: Vec<_> = set.into_iter().collect();
    names.sort();
    assert_eq!(names, vec!["ai", "database", "vector"]);
}

#[test]
fn test_with_dependencies_unknown_target() {
    let services = vec![svc("database", &[])];
    let err = with_dependencies(&services, &["ghost".to_string()]).unwrap_err();
    assert!(matches!(err, LifecycleError::ServiceNotFound(_)));
}
