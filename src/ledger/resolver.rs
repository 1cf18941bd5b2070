//! Dependency resolution against the ledger.
//!
//! A requirement `{resource, offset}` of a consumer due at `due` is mapped
//! onto the producer's schedule: take the producer instant at or before
//! `due`, walk `offset` instants along the producer's schedule, and ask the
//! ledger whether that instant is covered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ResourceLedger;
use crate::core::task::Task;
use crate::core::types::{ResourceName, TaskName};
use crate::core::world::World;

/// One `consumer requires resource from producer` edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub consumer: TaskName,
    pub resource: ResourceName,
    pub producer: TaskName,
    pub offset: i64,
}

/// Explicit requirement edges of a world, built once.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<TaskName, Vec<DependencyEdge>>,
}

impl DependencyGraph {
    /// Build the edges of every task in `world`.
    ///
    /// Requirements whose resource has no producer are dropped; world
    /// validation rejects those before a world is ever built.
    pub fn from_world(world: &World) -> Self {
        let mut edges: BTreeMap<TaskName, Vec<DependencyEdge>> = BTreeMap::new();
        for task in world.tasks() {
            let task_edges = edges.entry(task.name.clone()).or_default();
            for req in &task.requires {
                if let Some(producer) = world.producers().get(&req.resource) {
                    task_edges.push(DependencyEdge {
                        consumer: task.name.clone(),
                        resource: req.resource.clone(),
                        producer: producer.clone(),
                        offset: req.offset,
                    });
                }
            }
        }
        Self { edges }
    }

    /// Edges where `consumer` is the requiring task.
    pub fn requirements_of(&self, consumer: &TaskName) -> &[DependencyEdge] {
        self.edges.get(consumer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks that require something `producer` provides.
    pub fn dependents_of<'a>(&'a self, producer: &'a TaskName) -> impl Iterator<Item = &'a TaskName> {
        self.edges
            .iter()
            .filter(move |(_, es)| es.iter().any(|e| &e.producer == producer))
            .map(|(consumer, _)| consumer)
    }

    /// Every edge in the graph.
    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.values().flatten()
    }
}

/// An unsatisfied requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blocker {
    pub resource: ResourceName,
    pub producer: TaskName,
    pub offset: i64,
    /// Producer instant that must be covered. `None` when the offset walks
    /// outside the producer's window.
    pub needed_at: Option<DateTime<Utc>>,
}

/// Read-only view answering readiness questions for one run.
pub struct Resolver<'a> {
    world: &'a World,
    graph: &'a DependencyGraph,
    ledger: &'a ResourceLedger,
}

impl<'a> Resolver<'a> {
    pub fn new(world: &'a World, graph: &'a DependencyGraph, ledger: &'a ResourceLedger) -> Self {
        Self {
            world,
            graph,
            ledger,
        }
    }

    /// True if `task` has a due instant at or before `instant` and every
    /// requirement of that due instant is covered.
    pub fn is_ready(&self, task: &Task, instant: DateTime<Utc>) -> bool {
        let Some(due) = task.schedule.latest_at_or_before(instant) else {
            return false;
        };
        self.graph
            .requirements_of(&task.name)
            .iter()
            .all(|edge| self.satisfied(edge, due).is_ok())
    }

    /// Requirements of `task` that are unsatisfied at `instant`.
    ///
    /// Empty when the task is not yet due.
    pub fn blockers(&self, task: &Task, instant: DateTime<Utc>) -> Vec<Blocker> {
        let Some(due) = task.schedule.latest_at_or_before(instant) else {
            return Vec::new();
        };
        self.graph
            .requirements_of(&task.name)
            .iter()
            .filter_map(|edge| self.satisfied(edge, due).err())
            .collect()
    }

    fn satisfied(&self, edge: &DependencyEdge, due: DateTime<Utc>) -> Result<(), Blocker> {
        let needed_at = self.world.task(&edge.producer).and_then(|producer| {
            let aligned = producer.schedule.latest_at_or_before(due)?;
            producer.schedule.shift(aligned, edge.offset)
        });

        match needed_at {
            Some(t) if self.ledger.covers(&edge.resource, t) => Ok(()),
            _ => Err(Blocker {
                resource: edge.resource.clone(),
                producer: edge.producer.clone(),
                offset: edge.offset,
                needed_at,
            }),
        }
    }
}
