//! Service dependency ordering

use super::definition::ServiceSpec;
use crate::error::{Result, StackError};
use std::collections::{HashMap, HashSet};

/// Services ordered so that every dependency precedes its dependents.
///
/// Ties keep declaration order. Fails on unknown dependencies and cycles.
pub fn start_order(services: &[ServiceSpec]) -> Result<Vec<String>> {
    let by_name: HashMap<&str, &ServiceSpec> =
        services.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut order = Vec::with_capacity(services.len());
    let mut visited = HashSet::new();
    let mut visiting = HashSet::new();

    for service in services {
        visit(&service.name, &by_name, &mut visited, &mut visiting, &mut order)?;
    }

    Ok(order)
}

/// Reverse of [`start_order`]: dependents stop before their dependencies
pub fn stop_order(services: &[ServiceSpec]) -> Result<Vec<String>> {
    let mut order = start_order(services)?;
    order.reverse();
    Ok(order)
}

fn visit(
    service: &str,
    by_name: &HashMap<&str, &ServiceSpec>,
    visited: &mut HashSet<String>,
    visiting: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    if visited.contains(service) {
        return Ok(());
    }

    if visiting.contains(service) {
        return Err(StackError::InvalidDefinition(format!(
            "circular dependency detected for service '{}'",
            service
        )));
    }

    let spec = by_name.get(service).ok_or_else(|| {
        StackError::InvalidDefinition(format!("unknown service '{}'", service))
    })?;

    visiting.insert(service.to_string());

    for dep in &spec.depends_on {
        if !by_name.contains_key(dep.as_str()) {
            return Err(StackError::InvalidDefinition(format!(
                "service '{}' depends on unknown service '{}'",
                service, dep
            )));
        }
        visit(dep, by_name, visited, visiting, order)?;
    }

    visiting.remove(service);
    visited.insert(service.to_string());
    order.push(service.to_string());

    Ok(())
}
