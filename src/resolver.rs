//! Entity dependency resolution.
//!
//! Edges come from explicit `depends_on`, foreign key parents and every other
//! cross-entity reference (derived sources, append sources, `exists_in` filters).
//! Ordering uses Kahn's algorithm; among ready entities the earliest declared
//! one is emitted first, so identical input always yields identical output.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::{HarmonizeError, Result};
use crate::issues::{IssueCode, ValidationIssue};
use crate::spec::EntitySpec;

/// Directed graph from each entity to the entities it reads
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// dependencies[i] = declaration indices that node i depends on
    dependencies: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph; references to undeclared entities are left out (validators report them).
    pub fn from_specs(specs: &[EntitySpec]) -> Self {
        let nodes: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let mut index = HashMap::new();
        for (i, name) in nodes.iter().enumerate() {
            index.entry(name.clone()).or_insert(i);
        }

        let dependencies = specs
            .iter()
            .map(|spec| {
                let mut deps: Vec<usize> = spec
                    .referenced_entities()
                    .into_iter()
                    .filter_map(|name| index.get(name).copied())
                    .collect();
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect();

        Self {
            nodes,
            index,
            dependencies,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of an entity, in declaration order.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.dependencies[i]
                    .iter()
                    .map(|&d| self.nodes[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entities that directly depend on `name`, in declaration order.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(&target) = self.index.get(name) else {
            return Vec::new();
        };
        self.dependencies
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.contains(&target))
            .map(|(i, _)| self.nodes[i].as_str())
            .collect()
    }

    /// Deterministic topological order, or a configuration error naming the cycles.
    pub fn resolve(&self) -> Result<Vec<String>> {
        let n = self.nodes.len();
        let mut remaining_deps: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in self.dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining_deps[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &child in &dependents[next] {
                remaining_deps[child] -= 1;
                if remaining_deps[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() < n {
            let issues = self.cycle_issues();
            let summary: Vec<&str> = issues.iter().map(|i| i.message.as_str()).collect();
            return Err(HarmonizeError::configuration(summary.join("; "), issues));
        }

        let order: Vec<String> = order.into_iter().map(|i| self.nodes[i].clone()).collect();
        debug!("Resolved processing order: {:?}", order);
        Ok(order)
    }

    /// Entities grouped by dependency depth; entities within a level are independent.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let order = self.resolve()?;
        let mut depth: Vec<usize> = vec![0; self.nodes.len()];
        for name in &order {
            let i = self.index[name];
            depth[i] = self.dependencies[i]
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let max_depth = depth.iter().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<String>> = vec![Vec::new(); if order.is_empty() { 0 } else { max_depth + 1 }];
        // Declaration order within each level.
        for (i, name) in self.nodes.iter().enumerate() {
            if self.index[name] == i {
                levels[depth[i]].push(name.clone());
            }
        }
        Ok(levels)
    }

    /// One issue per cyclic strongly connected component, naming every member.
    fn cycle_issues(&self) -> Vec<ValidationIssue> {
        let mut components = self.strongly_connected_components();
        components.retain(|c| c.len() > 1 || self.dependencies[c[0]].contains(&c[0]));
        components.sort_by_key(|c| c[0]);

        components
            .into_iter()
            .map(|component| {
                let names: Vec<&str> = component.iter().map(|&i| self.nodes[i].as_str()).collect();
                ValidationIssue::error(
                    names[0],
                    IssueCode::DependencyCycle,
                    format!("Dependency cycle among entities: {}", names.join(", ")),
                )
                .with_suggestion("Remove one of the depends_on, foreign key or source references in the cycle")
            })
            .collect()
    }

    /// Tarjan's algorithm; members of each component are sorted by declaration order.
    fn strongly_connected_components(&self) -> Vec<Vec<usize>> {
        struct State {
            counter: usize,
            index: Vec<Option<usize>>,
            lowlink: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            components: Vec<Vec<usize>>,
        }

        fn visit(graph: &DependencyGraph, v: usize, state: &mut State) {
            state.index[v] = Some(state.counter);
            state.lowlink[v] = state.counter;
            state.counter += 1;
            state.stack.push(v);
            state.on_stack[v] = true;

            for &w in &graph.dependencies[v] {
                match state.index[w] {
                    None => {
                        visit(graph, w, state);
                        state.lowlink[v] = state.lowlink[v].min(state.lowlink[w]);
                    }
                    Some(w_index) if state.on_stack[w] => {
                        state.lowlink[v] = state.lowlink[v].min(w_index);
                    }
                    Some(_) => {}
                }
            }

            if Some(state.lowlink[v]) == state.index[v] {
                let mut component = Vec::new();
                while let Some(w) = state.stack.pop() {
                    state.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.sort_unstable();
                state.components.push(component);
            }
        }

        let n = self.nodes.len();
        let mut state = State {
            counter: 0,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        };
        for v in 0..n {
            if state.index[v].is_none() {
                visit(self, v, &mut state);
            }
        }
        state.components
    }
}

/// Convenience wrapper: processing order for a set of specs.
pub fn resolve_order(specs: &[EntitySpec]) -> Result<Vec<String>> {
    DependencyGraph::from_specs(specs).resolve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ForeignKeySpec, FilterSpec};

    fn entity(name: &str, deps: &[&str]) -> EntitySpec {
        let mut spec = EntitySpec::new(name, format!("{}_id", name));
        spec.depends_on = deps.iter().map(|d| d.to_string()).collect();
        spec
    }

    fn assert_topological(specs: &[EntitySpec], order: &[String]) {
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        for spec in specs {
            for dep in spec.referenced_entities() {
                assert!(
                    position[dep] < position[spec.name.as_str()],
                    "{} must come before {}",
                    dep,
                    spec.name
                );
            }
        }
    }

    #[test]
    fn test_order_respects_dependencies() {
        let specs = vec![
            entity("sample", &["site"]),
            entity("analysis", &["sample", "method"]),
            entity("site", &[]),
            entity("method", &[]),
        ];
        let order = resolve_order(&specs).unwrap();
        assert_topological(&specs, &order);
        assert_eq!(order, vec!["site", "sample", "method", "analysis"]);
    }

    #[test]
    fn test_ties_break_by_declaration_order() {
        let specs = vec![entity("c", &[]), entity("a", &[]), entity("b", &[])];
        let first = resolve_order(&specs).unwrap();
        let second = resolve_order(&specs).unwrap();
        assert_eq!(first, vec!["c", "a", "b"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_implicit_edges_from_foreign_keys_and_filters() {
        let mut sample = entity("sample", &[]);
        sample
            .foreign_keys
            .push(ForeignKeySpec::new("site", &["site_name"], &["site_name"]));
        sample.filters.push(FilterSpec {
            kind: "exists_in".to_string(),
            column: Some("method".to_string()),
            values: Vec::new(),
            entity: Some("method".to_string()),
            remote_column: None,
            pattern: None,
            negate: false,
        });
        let specs = vec![sample, entity("method", &[]), entity("site", &[])];

        let order = resolve_order(&specs).unwrap();
        assert_topological(&specs, &order);
        assert_eq!(order.last().map(String::as_str), Some("sample"));
    }

    #[test]
    fn test_cycle_names_every_member() {
        let specs = vec![
            entity("root", &[]),
            entity("a", &["c"]),
            entity("b", &["a"]),
            entity("c", &["b", "root"]),
            entity("tail", &["a"]),
        ];
        let err = resolve_order(&specs).unwrap_err();
        let issues = err.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::DependencyCycle);
        for member in ["a", "b", "c"] {
            assert!(issues[0].message.contains(member), "missing {}", member);
        }
        assert!(!issues[0].message.contains("tail"));
        assert!(matches!(err, HarmonizeError::Configuration { .. }));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let specs = vec![entity("loop", &["loop"])];
        let err = resolve_order(&specs).unwrap_err();
        assert_eq!(err.issues()[0].entity, "loop");
    }

    #[test]
    fn test_levels_group_independent_entities() {
        let specs = vec![
            entity("site", &[]),
            entity("method", &[]),
            entity("sample", &["site"]),
            entity("analysis", &["sample", "method"]),
        ];
        let levels = DependencyGraph::from_specs(&specs).levels().unwrap();
        assert_eq!(
            levels,
            vec![
                vec!["site".to_string(), "method".to_string()],
                vec!["sample".to_string()],
                vec!["analysis".to_string()],
            ]
        );
    }

    #[test]
    fn test_dependents_lookup() {
        let specs = vec![entity("site", &[]), entity("sample", &["site"]), entity("x", &["site"])];
        let graph = DependencyGraph::from_specs(&specs);
        assert_eq!(graph.dependents("site"), vec!["sample", "x"]);
        assert_eq!(graph.dependencies("sample"), vec!["site"]);
    }
}
