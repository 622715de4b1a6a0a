//! Graph builder for declared resources.
//!
//! Builds the dependency graph from a set of resources: materializes the
//! implicit `${kind.name}` attribute references as edges, rejects duplicate
//! identities, and orders the result topologically.

use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::error::ConfigError;
use crate::resource::{Resource, ResourceRef};

use super::dag::DependencyGraph;
use super::sort::order_by_depth;

/// Builder for dependency graphs. Building is a pure function of its input.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds a dependency graph.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateResource`] when two resources share an
    /// identity, [`ConfigError::InvalidReference`] for malformed attribute
    /// references, [`ConfigError::InvalidAttribute`] for numbers that are not
    /// finite, and [`ConfigError::Cycle`] when the edges form a cycle.
    pub fn build(
        &self,
        resources: Vec<Resource>,
    ) -> std::result::Result<DependencyGraph, ConfigError> {
        let mut declared: BTreeMap<ResourceRef, Resource> = BTreeMap::new();
        for resource in resources {
            resource.check_attributes()?;
            let id = resource.id();
            if declared.contains_key(&id) {
                return Err(ConfigError::DuplicateResource { resource: id });
            }
            declared.insert(id, resource);
        }

        let mut edges: Vec<(ResourceRef, BTreeSet<ResourceRef>)> = Vec::with_capacity(declared.len());
        let mut external: BTreeMap<ResourceRef, BTreeSet<ResourceRef>> = BTreeMap::new();

        for (id, resource) in &declared {
            let all = resource.all_dependencies()?;
            if all.contains(id) {
                return Err(ConfigError::Cycle {
                    cycle: vec![id.clone()],
                });
            }

            let (internal, outside): (BTreeSet<ResourceRef>, BTreeSet<ResourceRef>) =
                all.into_iter().partition(|dep| declared.contains_key(dep));
            if !outside.is_empty() {
                external.insert(id.clone(), outside);
            }
            edges.push((id.clone(), internal));
        }

        // Nodes go in (kind, name) order so node indices carry the tie-break.
        let mut graph: DiGraph<Resource, ()> = DiGraph::with_capacity(declared.len(), 0);
        let mut index: HashMap<ResourceRef, NodeIndex> = HashMap::with_capacity(declared.len());
        for (id, resource) in declared {
            index.insert(id, graph.add_node(resource));
        }
        for (id, deps) in &edges {
            for dep in deps {
                if let (Some(&from), Some(&to)) = (index.get(id), index.get(dep)) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let sorted = order_by_depth(&graph).map_err(|cycle| ConfigError::Cycle {
            cycle: cycle.into_iter().map(|node| graph[node].id()).collect(),
        })?;

        debug!(
            "Built dependency graph: {} resources, {} edges, {} with external dependencies",
            graph.node_count(),
            graph.edge_count(),
            external.len()
        );

        Ok(DependencyGraph::from_parts(
            graph,
            index,
            external,
            sorted.depths,
            &sorted.order,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Value;

    fn db() -> Resource {
        Resource::new("database", "main").with_attribute("engine", "postgres")
    }

    fn app() -> Resource {
        Resource::new("app", "web").with_dependency(ResourceRef::new("database", "main"))
    }

    #[test]
    fn test_dependencies_come_first() {
        let graph = GraphBuilder::new().build(vec![app(), db()]).unwrap();

        assert_eq!(
            graph.order(),
            &[ResourceRef::new("database", "main"), ResourceRef::new("app", "web")]
        );
        assert_eq!(graph.depth(&ResourceRef::new("app", "web")), Some(1));
    }

    #[test]
    fn test_independent_roots_sorted_by_kind_then_name() {
        let graph = GraphBuilder::new()
            .build(vec![
                Resource::new("queue", "jobs"),
                Resource::new("bucket", "logs"),
                Resource::new("bucket", "assets"),
            ])
            .unwrap();

        let names: Vec<String> = graph.order().iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["bucket.assets", "bucket.logs", "queue.jobs"]);
    }

    #[test]
    fn test_attribute_references_become_edges() {
        let dns = Resource::new("dns_record", "api").with_attribute("target", "${ingress.public.hostname}");
        let ingress = Resource::new("ingress", "public");

        let graph = GraphBuilder::new().build(vec![dns, ingress]).unwrap();
        let dns_id = ResourceRef::new("dns_record", "api");

        assert_eq!(graph.dependencies(&dns_id), vec![ResourceRef::new("ingress", "public")]);
        assert_eq!(graph.dependents(&ResourceRef::new("ingress", "public")), vec![dns_id]);
    }

    #[test]
    fn test_duplicate_identity_is_rejected() {
        let err = GraphBuilder::new().build(vec![db(), db()]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateResource {
                resource: ResourceRef::new("database", "main")
            }
        );
    }

    #[test]
    fn test_cycle_names_every_member() {
        let a = Resource::new("svc", "a").with_dependency(ResourceRef::new("svc", "b"));
        let b = Resource::new("svc", "b").with_attribute("peer", "${svc.c}");
        let c = Resource::new("svc", "c").with_dependency(ResourceRef::new("svc", "a"));

        let err = GraphBuilder::new().build(vec![c, b, a]).unwrap_err();
        let ConfigError::Cycle { cycle } = err else {
            panic!("expected a cycle error, got {err:?}");
        };
        assert_eq!(
            cycle,
            vec![
                ResourceRef::new("svc", "a"),
                ResourceRef::new("svc", "b"),
                ResourceRef::new("svc", "c"),
            ]
        );
    }

    #[test]
    fn test_non_finite_attribute_is_rejected() {
        let queue = Resource::new("queue", "jobs")
            .with_attribute("ports", Value::List(vec![Value::from(80), Value::Number(f64::INFINITY)]));

        let err = GraphBuilder::new().build(vec![db(), queue]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidAttribute { ref resource, ref attribute, .. }
                if *resource == ResourceRef::new("queue", "jobs") && attribute == "ports[1]"
        ));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let looped = Resource::new("svc", "a").with_attribute("self", "${svc.a.url}");
        let err = GraphBuilder::new().build(vec![looped]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Cycle {
                cycle: vec![ResourceRef::new("svc", "a")]
            }
        );
    }

    #[test]
    fn test_unknown_dependencies_are_kept_as_external() {
        let graph = GraphBuilder::new().build(vec![app()]).unwrap();

        let external: Vec<_> = graph.external_dependencies().collect();
        assert_eq!(
            external,
            vec![(&ResourceRef::new("app", "web"), &ResourceRef::new("database", "main"))]
        );
        assert_eq!(graph.depth(&ResourceRef::new("app", "web")), Some(0));
    }

    #[test]
    fn test_transitive_queries() {
        let net = Resource::new("network", "vpc");
        let db = db().with_dependency(ResourceRef::new("network", "vpc"));
        let graph = GraphBuilder::new().build(vec![app(), db, net]).unwrap();

        let deps = graph.transitive_dependencies(&ResourceRef::new("app", "web"));
        assert!(deps.contains(&ResourceRef::new("network", "vpc")));
        assert!(deps.contains(&ResourceRef::new("database", "main")));

        let dependents = graph.transitive_dependents(&ResourceRef::new("network", "vpc"));
        assert_eq!(dependents.len(), 2);
        assert_eq!(graph.layers().len(), 3);
    }
}
