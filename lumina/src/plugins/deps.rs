//! Dependency-ordered plugin startup: Kahn's topological sort over manifest
//! `dependencies`. A missing dependency flags the dependent plugin; a cycle
//! is a fatal configuration error.

use std::collections::{HashMap, VecDeque};

use super::manifest::PluginManifest;
use super::PluginError;

/// Result of sorting: load order plus plugins excluded for missing
/// dependencies (with the dependency that was missing).
#[derive(Debug, Default)]
pub struct SortOutcome {
    pub ordered: Vec<PluginManifest>,
    pub missing: Vec<(String, String)>,
}

/// Sorts manifests dependencies-first. Plugins whose dependency is not in the
/// set are excluded and reported in `missing`. A dependency cycle returns
/// [`PluginError::DependencyCycle`] naming its members; nothing from the
/// cycle is loaded.
pub fn sort_by_dependencies(manifests: Vec<PluginManifest>) -> Result<SortOutcome, PluginError> {
    let known: HashMap<String, PluginManifest> = manifests
        .into_iter()
        .map(|manifest| (manifest.id.clone(), manifest))
        .collect();

    // Exclude plugins with missing dependencies first (transitively).
    let mut missing: Vec<(String, String)> = Vec::new();
    let mut included: std::collections::HashSet<String> = known.keys().cloned().collect();
    loop {
        let mut excluded_this_round = Vec::new();
        for id in &included {
            let Some(manifest) = known.get(id) else {
                continue;
            };
            for dep in &manifest.dependencies {
                if !included.contains(dep) {
                    excluded_this_round.push((id.clone(), dep.clone()));
                    break;
                }
            }
        }
        if excluded_this_round.is_empty() {
            break;
        }
        for (id, dep) in excluded_this_round {
            included.remove(&id);
            missing.push((id, dep));
        }
    }

    // Kahn's algorithm over the surviving set.
    let mut in_degree: HashMap<String, usize> =
        included.iter().map(|id| (id.clone(), 0)).collect();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for id in &included {
        let Some(manifest) = known.get(id) else {
            continue;
        };
        for dep in &manifest.dependencies {
            *in_degree.entry(id.clone()).or_default() += 1;
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
    }

    let mut queue: VecDeque<String> = {
        let mut roots: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.clone())
            .collect();
        roots.sort();
        roots.into()
    };

    let mut ordered_ids: Vec<String> = Vec::with_capacity(included.len());
    while let Some(id) = queue.pop_front() {
        if let Some(children) = dependents.get(&id) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child.clone());
                    }
                }
            }
        }
        ordered_ids.push(id);
    }

    if ordered_ids.len() != included.len() {
        let mut cycle: Vec<String> = included
            .iter()
            .filter(|id| !ordered_ids.contains(*id))
            .cloned()
            .collect();
        cycle.sort();
        return Err(PluginError::DependencyCycle(cycle));
    }

    let mut known = known;
    let ordered = ordered_ids
        .into_iter()
        .filter_map(|id| known.remove(&id))
        .collect();
    Ok(SortOutcome { ordered, missing })
}
