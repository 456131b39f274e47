use std::fmt;
use smallvec::SmallVec;
use rayon::prelude::*;
use tracing::*;

use crate::data::*;
use crate::{Map, Set, EPS};

/// Requests on board, sorted.
pub type Onboard = SmallVec<[Req; 4]>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Event {
  Depot,
  Pickup(Req),
  Dropoff(Req),
}

/// A vehicle state: the event just served and the requests on board afterwards.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Vertex {
  pub event: Event,
  pub onboard: Onboard,
}

pub type Arc = (Vertex, Vertex);

impl fmt::Debug for Vertex {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.event {
      Event::Depot => return f.write_str("depot"),
      Event::Pickup(r) => write!(f, "+{}", r)?,
      Event::Dropoff(r) => write!(f, "-{}", r)?,
    }
    f.debug_list().entries(self.onboard.iter()).finish()
  }
}

impl Vertex {
  pub fn depot() -> Vertex {
    Vertex { event: Event::Depot, onboard: Onboard::new() }
  }

  pub fn pickup(r: Req, mut onboard: Onboard) -> Vertex {
    onboard.sort_unstable();
    debug_assert!(onboard.binary_search(&r).is_ok());
    Vertex { event: Event::Pickup(r), onboard }
  }

  pub fn dropoff(r: Req, mut onboard: Onboard) -> Vertex {
    onboard.sort_unstable();
    debug_assert!(onboard.binary_search(&r).is_err());
    Vertex { event: Event::Dropoff(r), onboard }
  }

  #[inline]
  pub fn is_depot(&self) -> bool { self.event == Event::Depot }

  #[inline]
  pub fn is_pickup(&self) -> bool { matches!(self.event, Event::Pickup(_)) }

  /// Request whose pickup or drop-off this vertex serves.
  #[inline]
  pub fn request(&self) -> Option<Req> {
    match self.event {
      Event::Depot => None,
      Event::Pickup(r) | Event::Dropoff(r) => Some(r),
    }
  }

  /// Node served, given the number of requests.
  #[inline]
  pub fn node(&self, n: Req) -> Loc {
    match self.event {
      Event::Depot => 0,
      Event::Pickup(r) => r,
      Event::Dropoff(r) => r + n,
    }
  }

  pub fn involves(&self, r: Req) -> bool {
    self.request() == Some(r) || self.onboard.binary_search(&r).is_ok()
  }

  /// Every request the vertex refers to, each once.
  pub fn requests(&self) -> impl Iterator<Item=Req> + '_ {
    let extra = match self.event {
      Event::Dropoff(r) => Some(r),
      _ => None,
    };
    self.onboard.iter().copied().chain(extra)
  }

  pub fn num_requests(&self) -> usize {
    self.onboard.len() + matches!(self.event, Event::Dropoff(_)) as usize
  }

  pub fn load(&self, data: &DarpInstance) -> Demand {
    self.onboard.iter().map(|&r| data.node(r).demand).sum()
  }

  /// Requests on board right before the event.
  pub fn pre_state(&self) -> Onboard {
    match self.event {
      Event::Depot => Onboard::new(),
      Event::Pickup(r) => self.onboard.iter().copied().filter(|&i| i != r).collect(),
      Event::Dropoff(r) => {
        let mut o = self.onboard.clone();
        let pos = o.binary_search(&r).unwrap_or_else(|p| p);
        o.insert(pos, r);
        o
      }
    }
  }
}

/// Transitions the onboard sets allow but no vehicle can make: leaving the depot for the
/// depot, or picking up a request right after dropping it off.
fn structurally_valid(u: &Vertex, v: &Vertex) -> bool {
  match (u.event, v.event) {
    (Event::Depot, Event::Depot) => false,
    (Event::Dropoff(a), Event::Pickup(b)) => a != b,
    _ => true,
  }
}

/// Could requests `i` and `j` be on board together?
pub fn compatible(data: &DarpInstance, i: Req, j: Req) -> bool {
  data.node(i).start_tw < data.node(data.dmap(j)).end_tw
    && data.node(j).start_tw < data.node(data.dmap(i)).end_tw
}

/// An arc between two request events is time-feasible if the head can still be served
/// after the tail, given the current service time bounds.  Depot arcs are always feasible.
pub fn arc_time_feasible(data: &DarpInstance, arc: &Arc, bounds: impl Fn(Loc) -> (Time, Time)) -> bool {
  let (u, v) = arc;
  if u.is_depot() || v.is_depot() {
    return true;
  }
  let (a, b) = (u.node(data.n), v.node(data.n));
  let (lb_a, _) = bounds(a);
  let (_, ub_b) = bounds(b);
  lb_a + data.node(a).service_time + data.travel_time(a, b) <= ub_b + EPS
}

/// Every onboard set of requests from `active` which respects capacity and pairwise
/// compatibility, and which contains at least one request from `new`.
fn onboard_sets(data: &DarpInstance, active: &[Req], new: &Set<Req>) -> Vec<Onboard> {
  fn grow(data: &DarpInstance, active: &[Req], start: usize, cur: &mut Onboard, load: Demand, out: &mut Vec<Onboard>) {
    for k in start..active.len() {
      let r = active[k];
      let q = data.node(r).demand;
      if load + q > data.capacity || cur.len() >= data.capacity.max(0) as usize {
        continue;
      }
      if !cur.iter().all(|&o| compatible(data, o, r)) {
        continue;
      }
      cur.push(r);
      out.push(cur.clone());
      grow(data, active, k + 1, cur, load + q, out);
      cur.pop();
    }
  }

  let mut sorted = active.to_vec();
  sorted.sort_unstable();
  let mut out = Vec::new();
  grow(data, &sorted, 0, &mut Onboard::new(), 0, &mut out);
  out.retain(|s| s.iter().any(|r| new.contains(r)));
  out
}

#[derive(Debug, Default, Clone)]
pub struct GraphDelta {
  pub vertices: Vec<Vertex>,
  pub arcs: Vec<Arc>,
}

impl GraphDelta {
  pub fn is_empty(&self) -> bool { self.vertices.is_empty() && self.arcs.is_empty() }

  pub fn append(&mut self, mut other: GraphDelta) {
    self.vertices.append(&mut other.vertices);
    self.arcs.append(&mut other.arcs);
  }
}

/// The event-based graph over the currently active requests.  The depot vertex is always
/// present.
#[derive(Debug, Clone)]
pub struct EventGraph {
  vertices: Set<Vertex>,
  arcs: Set<Arc>,
}

impl Default for EventGraph {
  fn default() -> Self { EventGraph::new() }
}

impl EventGraph {
  pub fn new() -> EventGraph {
    let mut vertices = Set::default();
    vertices.insert(Vertex::depot());
    EventGraph { vertices, arcs: Set::default() }
  }

  pub fn vertices(&self) -> impl Iterator<Item=&Vertex> { self.vertices.iter() }

  pub fn arcs(&self) -> impl Iterator<Item=&Arc> { self.arcs.iter() }

  pub fn num_vertices(&self) -> usize { self.vertices.len() }

  pub fn num_arcs(&self) -> usize { self.arcs.len() }

  pub fn contains_vertex(&self, v: &Vertex) -> bool { self.vertices.contains(v) }

  pub fn contains_arc(&self, a: &Arc) -> bool { self.arcs.contains(a) }

  /// In-arcs and out-arcs of every vertex with at least one of them.
  pub fn adjacency(&self) -> (Map<&Vertex, Vec<&Arc>>, Map<&Vertex, Vec<&Arc>>) {
    let mut inc: Map<&Vertex, Vec<&Arc>> = Map::default();
    let mut out: Map<&Vertex, Vec<&Arc>> = Map::default();
    for a in &self.arcs {
      out.entry(&a.0).or_default().push(a);
      inc.entry(&a.1).or_default().push(a);
    }
    (inc, out)
  }

  /// Add the vertices involving a request of `new` together with their arcs.  Pickup
  /// vertices are only generated for requests in `can_pickup`; arcs are kept if `arc_ok`
  /// accepts them.
  #[instrument(level="debug", skip_all, fields(active=active.len(), new=new.len()))]
  pub fn extend(
    &mut self,
    data: &DarpInstance,
    active: &[Req],
    new: &Set<Req>,
    can_pickup: &Set<Req>,
    arc_ok: impl Fn(&Arc) -> bool + Sync,
  ) -> GraphDelta {
    let mut added = GraphDelta::default();

    for set in onboard_sets(data, active, new) {
      for &r in &set {
        if can_pickup.contains(&r) {
          let v = Vertex::pickup(r, set.clone());
          if self.vertices.insert(v.clone()) {
            added.vertices.push(v);
          }
        }
        let v = Vertex::dropoff(r, set.iter().copied().filter(|&i| i != r).collect());
        if self.vertices.insert(v.clone()) {
          added.vertices.push(v);
        }
      }
    }

    let candidates: Vec<Arc> = {
      let mut by_state: Map<&Onboard, Vec<&Vertex>> = Map::default();
      let mut by_pre_state: Map<Onboard, Vec<&Vertex>> = Map::default();
      for v in &self.vertices {
        by_state.entry(&v.onboard).or_default().push(v);
        by_pre_state.entry(v.pre_state()).or_default().push(v);
      }
      let no_vertices = Vec::new();

      added.vertices.par_iter()
        .flat_map_iter(|v| {
          let pre = v.pre_state();
          let into = by_state.get(&pre).unwrap_or(&no_vertices).iter()
            .filter(move |u| structurally_valid(u, v))
            .map(move |&u| (u.clone(), v.clone()));
          let from = by_pre_state.get(&v.onboard).unwrap_or(&no_vertices).iter()
            .filter(move |w| structurally_valid(v, w))
            .map(move |&w| (v.clone(), w.clone()));
          into.chain(from)
        })
        .filter(|a| arc_ok(a))
        .collect()
    };

    for a in candidates {
      if self.arcs.insert(a.clone()) {
        added.arcs.push(a);
      }
    }
    debug!(vertices=added.vertices.len(), arcs=added.arcs.len(), "graph extended");
    added
  }

  /// Remove the vertices matching `pred` and every arc touching them.  The depot stays.
  pub fn remove_vertices(&mut self, pred: impl Fn(&Vertex) -> bool) -> GraphDelta {
    let mut removed = GraphDelta::default();
    self.vertices.retain(|v| {
      let drop = !v.is_depot() && pred(v);
      if drop { removed.vertices.push(v.clone()) }
      !drop
    });
    if removed.vertices.is_empty() {
      return removed;
    }
    let vertices = &self.vertices;
    self.arcs.retain(|a| {
      let keep = vertices.contains(&a.0) && vertices.contains(&a.1);
      if !keep { removed.arcs.push(a.clone()) }
      keep
    });
    removed
  }

  pub fn remove_arcs(&mut self, pred: impl Fn(&Arc) -> bool) -> Vec<Arc> {
    let mut removed = Vec::new();
    self.arcs.retain(|a| {
      let drop = pred(a);
      if drop { removed.push(a.clone()) }
      !drop
    });
    removed
  }

  /// Remove vertices which do not lie on a depot-to-depot path, unless `keep` holds.
  #[instrument(level="debug", skip_all)]
  pub fn prune(&mut self, keep: impl Fn(&Vertex) -> bool) -> GraphDelta {
    fn reach<'a>(adj: &Map<&'a Vertex, Vec<&'a Arc>>, start: &'a Vertex, forward: bool) -> Set<&'a Vertex> {
      let mut seen: Set<&Vertex> = Set::default();
      let mut stack = vec![start];
      while let Some(v) = stack.pop() {
        for a in adj.get(v).map(|a| a.as_slice()).unwrap_or(&[]) {
          let w = if forward { &a.1 } else { &a.0 };
          if seen.insert(w) {
            stack.push(w);
          }
        }
      }
      seen
    }

    let depot = Vertex::depot();
    let dead: Set<Vertex> = {
      let (inc, out) = self.adjacency();
      let fwd = reach(&out, &depot, true);
      let bwd = reach(&inc, &depot, false);
      self.vertices.iter()
        .filter(|&v| !v.is_depot() && !keep(v) && !(fwd.contains(v) && bwd.contains(v)))
        .cloned()
        .collect()
    };
    let removed = self.remove_vertices(|v| dead.contains(v));
    debug!(vertices=removed.vertices.len(), arcs=removed.arcs.len(), "graph pruned");
    removed
  }
}
