//! Live dependency graph built from observed nested resolutions.
//!
//! Only used for diagnostics; resolution correctness never depends on it.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    fmt::Write as _,
    time::{Duration, SystemTime},
};
use tracing::debug;

use crate::{events::ResolutionOutcome, identity::TypeIdentity};

/// Directed edge: `from` resolved `to` while being constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub from: TypeIdentity,
    pub to: TypeIdentity,
    pub observed_at: SystemTime,
    pub last_observed_at: SystemTime,
    pub count: u64,
}

/// A loop in the graph, in traversal order, closing node not repeated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircularDependencyRecord {
    pub path: Vec<TypeIdentity>,
}

impl CircularDependencyRecord {
    pub fn len(&self) -> usize {
        self.path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    pub fn is_self_loop(&self) -> bool {
        self.path.len() == 1
    }

    pub fn contains(&self, identity: TypeIdentity) -> bool {
        self.path.contains(&identity)
    }

    /// Rotate so the smallest identity comes first; makes cycles comparable.
    fn normalized(mut path: Vec<TypeIdentity>) -> Self {
        if let Some(min_pos) = path
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.cmp(b.1))
            .map(|(pos, _)| pos)
        {
            path.rotate_left(min_pos);
        }
        Self { path }
    }
}

impl fmt::Display for CircularDependencyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for identity in &self.path {
            write!(f, "{} -> ", identity)?;
        }
        match self.path.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}

/// Per-type usage counters.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageStats {
    pub resolution_count: u64,
    pub construction_count: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub last_access: Option<SystemTime>,
    pub total_time: Duration,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self {
            resolution_count: 0,
            construction_count: 0,
            cache_hits: 0,
            failures: 0,
            last_access: None,
            total_time: Duration::ZERO,
        }
    }
}

/// `total / count`, zero for no samples. Exact for any `u64` count.
pub(crate) fn mean_duration(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    u64::try_from(nanos).map_or(Duration::MAX, Duration::from_nanos)
}

impl UsageStats {
    pub fn average_time(&self) -> Duration {
        mean_duration(self.total_time, self.resolution_count)
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraphStats {
    pub total_types: usize,
    pub total_dependencies: usize,
    pub average_fan_out: f64,
    pub max_outgoing_dependencies: usize,
    pub max_incoming_dependencies: usize,
    pub most_dependent_type: Option<TypeIdentity>,
    pub most_depended_upon_type: Option<TypeIdentity>,
}

/// Read-only copy of the graph handed out by diagnostics.
#[derive(Debug, Clone)]
pub struct DependencyGraphSnapshot {
    pub nodes: Vec<TypeIdentity>,
    pub edges: Vec<GraphEdge>,
}

impl DependencyGraphSnapshot {
    pub fn dependencies_of(&self, identity: TypeIdentity) -> Vec<TypeIdentity> {
        self.edges
            .iter()
            .filter(|edge| edge.from == identity)
            .map(|edge| edge.to)
            .collect()
    }

    pub fn has_edge(&self, from: TypeIdentity, to: TypeIdentity) -> bool {
        self.edges.iter().any(|edge| edge.from == from && edge.to == to)
    }

    /// Graphviz rendering; edges that take part in a cycle are drawn red.
    pub fn to_dot(&self, cycles: &[CircularDependencyRecord]) -> String {
        let mut cyclic: HashSet<(TypeIdentity, TypeIdentity)> = HashSet::new();
        for cycle in cycles {
            for (i, from) in cycle.path.iter().enumerate() {
                let to = cycle.path[(i + 1) % cycle.path.len()];
                cyclic.insert((*from, to));
            }
        }

        let mut dot = String::from("digraph dependencies {\n    rankdir=LR;\n");
        for node in &self.nodes {
            let _ = writeln!(dot, "    \"{}\";", node);
        }
        for edge in &self.edges {
            let style = if cyclic.contains(&(edge.from, edge.to)) {
                " [color=red]"
            } else {
                ""
            };
            let _ = writeln!(dot, "    \"{}\" -> \"{}\"{};", edge.from, edge.to, style);
        }
        dot.push_str("}\n");
        dot
    }
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// from -> (to -> edge)
    adjacency: BTreeMap<TypeIdentity, BTreeMap<TypeIdentity, GraphEdge>>,
    /// Types seen without edges still show up as nodes.
    nodes: BTreeSet<TypeIdentity>,
    usage: HashMap<TypeIdentity, UsageStats>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: TypeIdentity, to: TypeIdentity, at: SystemTime) {
        self.nodes.insert(from);
        self.nodes.insert(to);

        let edges = self.adjacency.entry(from).or_default();
        match edges.get_mut(&to) {
            Some(edge) => {
                edge.count += 1;
                edge.last_observed_at = at;
            }
            None => {
                debug!(from = %from, to = %to, "dependency edge observed");
                edges.insert(
                    to,
                    GraphEdge {
                        from,
                        to,
                        observed_at: at,
                        last_observed_at: at,
                        count: 1,
                    },
                );
            }
        }
    }

    pub fn record_resolution(
        &mut self,
        identity: TypeIdentity,
        outcome: ResolutionOutcome,
        elapsed: Duration,
        at: SystemTime,
    ) {
        self.nodes.insert(identity);
        let stats = self.usage.entry(identity).or_default();
        stats.resolution_count += 1;
        stats.total_time += elapsed;
        stats.last_access = Some(at);
        match outcome {
            ResolutionOutcome::Constructed | ResolutionOutcome::Fallback => {
                stats.construction_count += 1
            }
            ResolutionOutcome::CacheHit | ResolutionOutcome::FastPathHit => stats.cache_hits += 1,
        }
    }

    pub fn record_failure(&mut self, identity: TypeIdentity, at: SystemTime) {
        self.nodes.insert(identity);
        let stats = self.usage.entry(identity).or_default();
        stats.failures += 1;
        stats.last_access = Some(at);
    }

    pub fn dependencies(&self, identity: TypeIdentity) -> Vec<TypeIdentity> {
        self.adjacency
            .get(&identity)
            .map(|edges| edges.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, identity: TypeIdentity) -> Vec<TypeIdentity> {
        self.adjacency
            .iter()
            .filter(|(_, edges)| edges.contains_key(&identity))
            .map(|(from, _)| *from)
            .collect()
    }

    pub fn has_edge(&self, from: TypeIdentity, to: TypeIdentity) -> bool {
        self.adjacency
            .get(&from)
            .map(|edges| edges.contains_key(&to))
            .unwrap_or(false)
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(|edges| edges.len()).sum()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn usage_stats(&self) -> HashMap<TypeIdentity, UsageStats> {
        self.usage.clone()
    }

    pub fn usage_of(&self, identity: TypeIdentity) -> Option<&UsageStats> {
        self.usage.get(&identity)
    }

    /// Types resolved at least `threshold` times, most used first.
    pub fn hot_types(&self, threshold: u64) -> Vec<(TypeIdentity, u64)> {
        let mut hot: Vec<_> = self
            .usage
            .iter()
            .filter(|(_, stats)| stats.resolution_count >= threshold)
            .map(|(identity, stats)| (*identity, stats.resolution_count))
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hot
    }

    pub fn snapshot(&self) -> DependencyGraphSnapshot {
        DependencyGraphSnapshot {
            nodes: self.nodes.iter().copied().collect(),
            edges: self
                .adjacency
                .values()
                .flat_map(|edges| edges.values().cloned())
                .collect(),
        }
    }

    pub fn clear(&mut self) {
        self.adjacency.clear();
        self.nodes.clear();
        self.usage.clear();
    }

    /// Every distinct cycle reachable through a DFS back-edge, at most `limit`.
    ///
    /// Nodes are visited in identity order so the output is deterministic.
    pub fn detect_cycles(&self, limit: usize) -> Vec<CircularDependencyRecord> {
        let mut found: Vec<CircularDependencyRecord> = Vec::new();
        let mut seen: HashSet<CircularDependencyRecord> = HashSet::new();
        let mut visited: HashSet<TypeIdentity> = HashSet::new();
        let mut visiting: HashSet<TypeIdentity> = HashSet::new();
        let mut path: Vec<TypeIdentity> = Vec::new();

        for &start in self.adjacency.keys() {
            if found.len() >= limit {
                break;
            }
            if !visited.contains(&start) {
                self.visit(
                    start,
                    &mut visited,
                    &mut visiting,
                    &mut path,
                    &mut seen,
                    &mut found,
                    limit,
                );
            }
        }

        found
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        node: TypeIdentity,
        visited: &mut HashSet<TypeIdentity>,
        visiting: &mut HashSet<TypeIdentity>,
        path: &mut Vec<TypeIdentity>,
        seen: &mut HashSet<CircularDependencyRecord>,
        found: &mut Vec<CircularDependencyRecord>,
        limit: usize,
    ) {
        visited.insert(node);
        visiting.insert(node);
        path.push(node);

        if let Some(edges) = self.adjacency.get(&node) {
            for &next in edges.keys() {
                if found.len() >= limit {
                    break;
                }
                if visiting.contains(&next) {
                    if let Some(start) = path.iter().position(|&n| n == next) {
                        let record = CircularDependencyRecord::normalized(path[start..].to_vec());
                        if seen.insert(record.clone()) {
                            debug!(cycle = %record, "dependency cycle detected");
                            found.push(record);
                        }
                    }
                } else if !visited.contains(&next) {
                    self.visit(next, visited, visiting, path, seen, found, limit);
                }
            }
        }

        path.pop();
        visiting.remove(&node);
    }

    pub fn stats(&self) -> DependencyGraphStats {
        let total_types = self.nodes.len();
        let total_dependencies = self.edge_count();

        let average_fan_out = if total_types > 0 {
            total_dependencies as f64 / total_types as f64
        } else {
            0.0
        };

        let mut incoming: HashMap<TypeIdentity, usize> = HashMap::new();
        for edges in self.adjacency.values() {
            for to in edges.keys() {
                *incoming.entry(*to).or_default() += 1;
            }
        }

        let most_dependent = self
            .adjacency
            .iter()
            .map(|(from, edges)| (*from, edges.len()))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));
        let most_depended_upon = incoming
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));

        DependencyGraphStats {
            total_types,
            total_dependencies,
            average_fan_out,
            max_outgoing_dependencies: most_dependent.map(|(_, n)| n).unwrap_or(0),
            max_incoming_dependencies: most_depended_upon.map(|(_, n)| n).unwrap_or(0),
            most_dependent_type: most_dependent.map(|(identity, _)| identity),
            most_depended_upon_type: most_depended_upon.map(|(identity, _)| identity),
        }
    }

    pub fn report(&self, limit: usize) -> String {
        let stats = self.stats();
        let cycles = self.detect_cycles(limit);
        let name = |identity: Option<TypeIdentity>| {
            identity
                .map(|identity| identity.to_string())
                .unwrap_or_else(|| "None".to_string())
        };

        let mut report = format!(
            "=== Dependency Graph Report ===\n\
             Total types: {}\n\
             Total dependencies: {}\n\
             Average fan-out: {:.2}\n\
             Max outgoing dependencies: {}\n\
             Max incoming dependencies: {}\n\
             Most dependent type: {}\n\
             Most depended upon type: {}\n\
             Circular dependencies found: {}\n",
            stats.total_types,
            stats.total_dependencies,
            stats.average_fan_out,
            stats.max_outgoing_dependencies,
            stats.max_incoming_dependencies,
            name(stats.most_dependent_type),
            name(stats.most_depended_upon_type),
            cycles.len(),
        );
        for (i, cycle) in cycles.iter().enumerate() {
            let _ = writeln!(report, "Cycle {}: {}", i + 1, cycle);
        }
        report.push_str("===============================");
        report
    }
}
