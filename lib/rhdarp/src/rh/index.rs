//! Bookkeeping between the entities of the current MILP (requests, vertices, arcs) and
//! dense positions plus the model variables standing for them.
use std::hash::Hash;
use anyhow::{bail, Result};
use tracing::*;

use crate::data::Req;
use crate::{Map, Set};
use super::graph::{Arc, EventGraph, Vertex};
use super::milp::VarId;

/// Dense, order-preserving bidirectional map between keys and positions `0..len`.
#[derive(Debug, Clone)]
pub struct IndexMap<K, V = ()> {
  pos: Map<K, usize>,
  entries: Vec<(K, V)>,
}

impl<K, V> Default for IndexMap<K, V> {
  fn default() -> Self {
    IndexMap { pos: Map::default(), entries: Vec::new() }
  }
}

impl<K: Hash + Eq + Clone, V> IndexMap<K, V> {
  pub fn new() -> Self { Self::default() }

  /// Insert or replace, returning the key's position.
  pub fn insert(&mut self, key: K, val: V) -> usize {
    match self.pos.get(&key) {
      Some(&k) => {
        self.entries[k].1 = val;
        k
      }
      None => {
        let k = self.entries.len();
        self.pos.insert(key.clone(), k);
        self.entries.push((key, val));
        k
      }
    }
  }

  pub fn index(&self, key: &K) -> Option<usize> { self.pos.get(key).copied() }

  pub fn get(&self, key: &K) -> Option<&V> { self.pos.get(key).map(|&k| &self.entries[k].1) }

  pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
    match self.pos.get(key) {
      Some(&k) => Some(&mut self.entries[k].1),
      None => None,
    }
  }

  pub fn key(&self, idx: usize) -> Option<&K> { self.entries.get(idx).map(|(k, _)| k) }

  pub fn contains(&self, key: &K) -> bool { self.pos.contains_key(key) }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  pub fn iter(&self) -> impl Iterator<Item=(&K, &V)> { self.entries.iter().map(|(k, v)| (k, v)) }

  pub fn keys(&self) -> impl Iterator<Item=&K> { self.entries.iter().map(|(k, _)| k) }

  pub fn values(&self) -> impl Iterator<Item=&V> { self.entries.iter().map(|(_, v)| v) }

  /// Keep the entries for which `f` holds, closing the gaps left by the others.  Relative
  /// order is preserved.  Returns the removed entries.
  pub fn retain(&mut self, mut f: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)> {
    let mut removed = Vec::new();
    let mut kept = Vec::with_capacity(self.entries.len());
    for (k, v) in self.entries.drain(..) {
      if f(&k, &v) { kept.push((k, v)) } else { removed.push((k, v)) }
    }
    self.entries = kept;
    if !removed.is_empty() {
      self.pos.clear();
      for (i, (k, _)) in self.entries.iter().enumerate() {
        self.pos.insert(k.clone(), i);
      }
    }
    removed
  }

  /// Both directions agree and positions are dense.
  pub fn is_consistent(&self) -> bool {
    self.pos.len() == self.entries.len()
      && self.entries.iter().enumerate().all(|(i, (k, _))| self.pos.get(k) == Some(&i))
  }
}

impl<K: Hash + Eq + Clone, V> std::iter::FromIterator<(K, V)> for IndexMap<K, V> {
  fn from_iter<I: IntoIterator<Item=(K, V)>>(iter: I) -> Self {
    let mut m = IndexMap::new();
    for (k, v) in iter {
      m.insert(k, v);
    }
    m
  }
}

/// Model variables of one request.  `accept` exists while the request is pending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestVars {
  pub accept: Option<VarId>,
  pub pickup_time: VarId,
  pub dropoff_time: VarId,
  pub excess: Option<VarId>,
}

impl RequestVars {
  pub fn vars(&self) -> impl Iterator<Item=VarId> {
    self.accept.into_iter()
      .chain([self.pickup_time, self.dropoff_time])
      .chain(self.excess)
  }
}

/// Changes to the active sets, as reported to [`Maps::update_maps`].
#[derive(Debug, Default)]
pub struct MapUpdate {
  pub new_requests: Vec<(Req, RequestVars)>,
  pub removed_requests: Vec<Req>,
  pub new_vertices: Vec<Vertex>,
  pub removed_vertices: Vec<Vertex>,
  pub new_arcs: Vec<(Arc, VarId)>,
  pub removed_arcs: Vec<Arc>,
}

/// Whatever the maps let go of; its variables are no longer needed by the index layer.
#[derive(Debug, Default)]
pub struct Released {
  pub requests: Vec<(Req, RequestVars)>,
  pub arcs: Vec<(Arc, VarId)>,
}

impl Released {
  pub fn vars(&self) -> impl Iterator<Item=VarId> + '_ {
    self.requests.iter().flat_map(|(_, rv)| rv.vars())
      .chain(self.arcs.iter().map(|(_, v)| *v))
  }
}

#[derive(Debug, Default, Clone)]
pub struct Maps {
  pub rmap: IndexMap<Req, RequestVars>,
  pub vmap: IndexMap<Vertex>,
  /// Pickup vertices.
  pub vinmap: IndexMap<Vertex>,
  /// Drop-off vertices.
  pub voutmap: IndexMap<Vertex>,
  pub amap: IndexMap<Arc, VarId>,
}

impl Maps {
  fn add_vertex(&mut self, v: Vertex) {
    if v.is_depot() {
      self.vmap.insert(v, ());
    } else if v.is_pickup() {
      self.vinmap.insert(v.clone(), ());
      self.vmap.insert(v, ());
    } else {
      self.voutmap.insert(v.clone(), ());
      self.vmap.insert(v, ());
    }
  }

  /// Build every map from scratch.
  pub fn create_maps(
    graph: &EventGraph,
    requests: impl IntoIterator<Item=(Req, RequestVars)>,
    arc_vars: &Map<Arc, VarId>,
  ) -> Result<Maps> {
    let mut maps = Maps::default();
    let mut requests: Vec<_> = requests.into_iter().collect();
    requests.sort_by_key(|&(r, _)| r);
    maps.rmap = requests.into_iter().collect();

    let mut vertices: Vec<&Vertex> = graph.vertices().collect();
    vertices.sort();
    for v in vertices {
      maps.add_vertex(v.clone());
    }

    let mut arcs: Vec<&Arc> = graph.arcs().collect();
    arcs.sort();
    for a in arcs {
      match arc_vars.get(a) {
        Some(&x) => { maps.amap.insert(a.clone(), x); }
        None => bail!("arc {:?} has no variable", a),
      }
    }
    debug!(requests=maps.rmap.len(), vertices=maps.vmap.len(), arcs=maps.amap.len(), "maps created");
    Ok(maps)
  }

  /// Drop removed entities, densify, then append new ones.
  pub fn update_maps(&mut self, update: MapUpdate) -> Released {
    let MapUpdate { new_requests, removed_requests, new_vertices, removed_vertices, new_arcs, removed_arcs } = update;
    let mut released = Released::default();

    if !removed_requests.is_empty() {
      let gone: Set<Req> = removed_requests.into_iter().collect();
      released.requests = self.rmap.retain(|r, _| !gone.contains(r));
    }
    if !removed_vertices.is_empty() {
      let gone: Set<Vertex> = removed_vertices.into_iter().collect();
      self.vmap.retain(|v, _| !gone.contains(v));
      self.vinmap.retain(|v, _| !gone.contains(v));
      self.voutmap.retain(|v, _| !gone.contains(v));
    }
    if !removed_arcs.is_empty() {
      let gone: Set<Arc> = removed_arcs.into_iter().collect();
      released.arcs = self.amap.retain(|a, _| !gone.contains(a));
    }

    for (r, vars) in new_requests {
      self.rmap.insert(r, vars);
    }
    for v in new_vertices {
      self.add_vertex(v);
    }
    for (a, x) in new_arcs {
      self.amap.insert(a, x);
    }
    trace!(requests=self.rmap.len(), vertices=self.vmap.len(), arcs=self.amap.len(),
      released_arcs=released.arcs.len(), "maps updated");
    released
  }

  /// Every map is bidirectional, covers exactly the graph and the active requests, and no
  /// variable stands for two entities.
  pub fn check_consistency(&self, graph: &EventGraph, active: impl IntoIterator<Item=Req>) -> Result<()> {
    if !(self.rmap.is_consistent() && self.vmap.is_consistent() && self.vinmap.is_consistent()
      && self.voutmap.is_consistent() && self.amap.is_consistent()) {
      bail!("index maps are not bidirectional")
    }

    let active: Set<Req> = active.into_iter().collect();
    if active.len() != self.rmap.len() || !active.iter().all(|r| self.rmap.contains(r)) {
      bail!("request map differs from the active requests")
    }
    if graph.num_vertices() != self.vmap.len() || !graph.vertices().all(|v| self.vmap.contains(v)) {
      bail!("vertex map differs from the graph")
    }
    for v in graph.vertices() {
      let (is_in, is_out) = (self.vinmap.contains(v), self.voutmap.contains(v));
      let expected = (v.is_pickup(), !v.is_depot() && !v.is_pickup());
      if (is_in, is_out) != expected {
        bail!("vertex {:?} is in the wrong in/out map", v)
      }
    }
    if self.vinmap.len() + self.voutmap.len() + 1 != self.vmap.len() {
      bail!("in/out maps hold vertices outside the graph")
    }
    if graph.num_arcs() != self.amap.len() || !graph.arcs().all(|a| self.amap.contains(a)) {
      bail!("arc map differs from the graph")
    }

    let mut seen: Set<VarId> = Set::default();
    let all_vars = self.rmap.values().flat_map(|rv| rv.vars()).chain(self.amap.values().copied());
    for x in all_vars {
      if !seen.insert(x) {
        bail!("variable {:?} stands for two entities", x)
      }
    }
    Ok(())
  }
}
