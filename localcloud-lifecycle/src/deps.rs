use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::errors::{LifecycleError, Result};
use crate::state::ServiceDescriptor;

/// A node in the dependency graph: a service name and the names it depends on.
pub trait DependencyNode {
    fn name(&self) -> &str;
    fn depends_on(&self) -> &[String];
}

impl DependencyNode for ServiceDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

impl DependencyNode for (String, Vec<String>) {
    fn name(&self) -> &str {
        &self.0
    }

    fn depends_on(&self) -> &[String] {
        &self.1
    }
}

/// Order in which services should be started (dependencies first).
///
/// `services` must be in registration order; services that become ready at
/// the same time start in that order.
pub fn get_start_order<N: DependencyNode>(services: &[N]) -> Result<Vec<String>> {
    topological_sort(services)
}

/// Order in which services should be stopped (exact reverse of start order)
pub fn get_stop_order<N: DependencyNode>(services: &[N]) -> Result<Vec<String>> {
    let mut order = topological_sort(services)?;
    order.reverse();
    Ok(order)
}

/// `targets` plus everything they transitively depend on.
pub fn with_dependencies<N: DependencyNode>(
    services: &[N],
    targets: &[String],
) -> Result<HashSet<String>> {
    let by_name: HashMap<&str, &N> = services.iter().map(|s| (s.name(), s)).collect();

    let mut result = HashSet::new();
    let mut stack: Vec<String> = targets.to_vec();

    while let Some(name) = stack.pop() {
        if !result.insert(name.clone()) {
            continue;
        }
        let node = by_name
            .get(name.as_str())
            .ok_or_else(|| LifecycleError::ServiceNotFound(name.clone()))?;
        for dep in node.depends_on() {
            if !result.contains(dep) {
                stack.push(dep.clone());
            }
        }
    }

    Ok(result)
}

/// Kahn's algorithm; among ready nodes the lowest registration position wins.
fn topological_sort<N: DependencyNode>(services: &[N]) -> Result<Vec<String>> {
    let position: HashMap<&str, usize> = services
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name(), i))
        .collect();

    for service in services {
        for dep in service.depends_on() {
            if !position.contains_key(dep.as_str()) {
                return Err(LifecycleError::MissingDependency {
                    service: service.name().to_string(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Edge from A -> B means B depends on A
    let mut in_degree = vec![0usize; services.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); services.len()];

    for (i, service) in services.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in service.depends_on() {
            if !seen.insert(dep.as_str()) {
                continue;
            }
            let dep_idx = position[dep.as_str()];
            in_degree[i] += 1;
            dependents[dep_idx].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut result = Vec::with_capacity(services.len());

    while let Some(Reverse(idx)) = ready.pop() {
        result.push(services[idx].name().to_string());
        for &dependent in &dependents[idx] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if result.len() != services.len() {
        let remaining: Vec<_> = services
            .iter()
            .map(|s| s.name())
            .filter(|name| !result.iter().any(|r| r == name))
            .collect();
        return Err(LifecycleError::DependencyCycle(format!(
            "Cycle detected involving: {}",
            remaining.join(", ")
        )));
    }

    Ok(result)
}

#[cfg(test)]
mod tests;
