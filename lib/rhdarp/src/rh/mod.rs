use std::time::Duration;
use tracing::*;

use crate::data::*;

pub mod preprocessing;
pub mod dynamic;
pub mod graph;
pub mod index;
pub mod milp;
pub mod solver;
pub mod controller;

pub use controller::{RollingHorizon, RhOutcome, RhSummary, Route};
pub use graph::{Arc, Event, EventGraph, Vertex};
pub use solver::GoodLpSolver;

#[derive(Debug, Clone, PartialEq)]
pub struct DynamicConfig {
  /// Fraction of the requests, taken from the front, which are known from the start.
  pub share_static_requests: f64,
  /// How long before its latest pickup a dynamic request becomes known.
  pub notice: Time,
}

impl Default for DynamicConfig {
  fn default() -> Self {
    DynamicConfig { share_static_requests: 1.0, notice: 60.0 }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RhConfig {
  /// Every known request must be served.
  pub accept_all: bool,
  pub consider_excess_ride_time: bool,
  /// Upper bound on the largest excess ride time.
  pub excess_ride_time_bound: Option<Time>,
  pub excess_ride_time_weight: f64,
  /// Reveal requests over time instead of knowing all of them at the start.
  pub dynamic: bool,
  /// Only generate vertices for newly revealed requests and drop unused pooling vertices
  /// of old ones.
  pub heuristic: bool,
  pub time_limit: Duration,
  /// Weights of accepted requests and saved distance.
  pub weights: [f64; 2],
  /// Once communicated, a pickup may be postponed by at most this much.
  pub max_pickup_delay: Option<Time>,
}

impl Default for RhConfig {
  fn default() -> Self {
    RhConfig {
      accept_all: false,
      consider_excess_ride_time: false,
      excess_ride_time_bound: None,
      excess_ride_time_weight: 1.0,
      dynamic: false,
      heuristic: false,
      time_limit: Duration::from_secs(3600),
      weights: [10.0, 1.0],
      max_pickup_delay: None,
    }
  }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RequestStatus {
  Unrevealed,
  Pending,
  PickedUp,
  DroppedOff,
  Denied,
}

impl RequestStatus {
  /// Part of the current MILP.
  #[inline]
  pub fn is_active(self) -> bool {
    matches!(self, RequestStatus::Pending | RequestStatus::PickedUp)
  }

  #[inline]
  pub fn is_final(self) -> bool {
    matches!(self, RequestStatus::DroppedOff | RequestStatus::Denied)
  }

  pub fn can_become(self, next: RequestStatus) -> bool {
    use RequestStatus::*;
    matches!((self, next),
      (Unrevealed, Pending) | (Pending, PickedUp) | (Pending, Denied) | (PickedUp, DroppedOff))
  }
}

/// Derive and tighten the time windows, then decide when requests become known.
#[instrument(level="info", skip_all, fields(instance=%data.id))]
pub fn prepare(data: &mut DarpInstance, dynamic: Option<&DynamicConfig>) -> anyhow::Result<()> {
  preprocessing::set_time_windows(data)?;
  preprocessing::tighten_time_windows(data)?;
  if let Some(cfg) = dynamic {
    dynamic::transform_dynamic(data, cfg);
  }
  Ok(())
}

pub mod schedule {
  use anyhow::{anyhow, bail, Result};
  use super::*;
  use crate::Map;

  /// Split a solution's used arcs into depot-to-depot routes, ordered by first vertex.
  pub fn routes<'a>(arcs: impl IntoIterator<Item=&'a Arc>) -> Result<Vec<Vec<Vertex>>> {
    let mut starts = Vec::new();
    let mut succ: Map<&Vertex, &Vertex> = Map::default();
    for (u, v) in arcs {
      if u.is_depot() {
        starts.push(v);
      } else if succ.insert(u, v).is_some() {
        bail!("vertex {:?} is left twice", u)
      }
    }
    starts.sort();

    let mut steps = 0;
    let mut routes = Vec::with_capacity(starts.len());
    for first in starts {
      let mut route = vec![Vertex::depot(), first.clone()];
      let mut v = first;
      while !v.is_depot() {
        let w = *succ.get(v).ok_or_else(|| anyhow!("route ends at {:?}", v))?;
        steps += 1;
        if steps > succ.len() {
          bail!("route through {:?} never returns to the depot", w)
        }
        route.push(w.clone());
        v = w;
      }
      routes.push(route);
    }
    if steps != succ.len() {
      bail!("{} arcs are not on a depot-to-depot route", succ.len() - steps)
    }
    Ok(routes)
  }

  /// Write arrival, departure, waiting, ride time and load of every routed node.  Service
  /// starts at `start[i]`; the depot is left just in time for the first node.
  pub fn apply(data: &mut DarpInstance, routes: &[Vec<Vertex>], start: &Map<Loc, Time>) -> Result<()> {
    data.clear_schedule();
    let start_of = |i: Loc| start.get(&i).copied().ok_or_else(|| anyhow!("no service time for node {}", i));

    for route in routes {
      let mut prev: Option<Loc> = None;
      for v in route.iter().filter(|v| !v.is_depot()) {
        let i = v.node(data.n);
        let b = start_of(i)?;
        let arrival = match prev {
          Some(h) => start_of(h)? + data.node(h).service_time + data.travel_time(h, i),
          None => b,
        };
        let ride_time = if data.is_delivery(i) {
          let p = data.pmap(i);
          Some(b - start_of(p)? - data.node(p).service_time)
        } else {
          None
        };
        let schedule = NodeSchedule {
          arrival_time: Some(arrival),
          departure_time: Some(b + data.node(i).service_time),
          beginning_service: Some(b),
          waiting_time: Some(f64::max(0.0, b - arrival)),
          ride_time,
          vehicle_load: Some(v.load(data)),
        };
        trace!(i, ?schedule);
        data.nodes[i as usize].schedule = schedule;
        prev = Some(i);
      }
    }
    Ok(())
  }

  #[cfg(test)]
  mod tests {
    use super::*;
    use smallvec::smallvec;

    fn route_arcs() -> Vec<Arc> {
      let depot = Vertex::depot();
      let p1 = Vertex::pickup(1, smallvec![1]);
      let p2 = Vertex::pickup(2, smallvec![1, 2]);
      let d1 = Vertex::dropoff(1, smallvec![2]);
      let d2 = Vertex::dropoff(2, smallvec![]);
      vec![
        (p2.clone(), d1.clone()),
        (depot.clone(), p1.clone()),
        (d2.clone(), depot),
        (p1, p2),
        (d1, d2),
      ]
    }

    #[test]
    fn single_route() {
      let routes = routes(&route_arcs()).unwrap();
      assert_eq!(routes.len(), 1);
      let nodes: Vec<Loc> = routes[0].iter().map(|v| v.node(2)).collect();
      assert_eq!(nodes, vec![0, 1, 2, 3, 4, 0]);
    }

    #[test]
    fn subtour_rejected() {
      let mut arcs = route_arcs();
      let a = Vertex::pickup(3, smallvec![3]);
      let b = Vertex::dropoff(3, smallvec![]);
      arcs.push((a.clone(), b.clone()));
      arcs.push((b, a));
      assert!(routes(&arcs).is_err());
    }

    #[test]
    fn open_route_rejected() {
      let mut arcs = route_arcs();
      arcs.retain(|(u, _)| u.event != Event::Dropoff(2));
      assert!(routes(&arcs).is_err());
    }
  }
}
