use std::borrow::Cow;
use ndarray::Array2;
use tracing::{debug, warn};
use instances::raw::{FromRaw, darp::RequestFile};
pub use instances::raw::darp::{Time, Demand};
use crate::{Map, DarpError};

/// Node index: `0` is the depot, `1..=n` are pickups and `n+1..=2n` drop-offs.
pub type Loc = u16;
/// Request index, equal to the index of its pickup node.
pub type Req = u16;
pub type Matrix = Array2<f64>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RequestType {
  /// Only an earliest pickup time was given.
  EarliestDeparture,
  /// Only a latest drop-off time was given.
  LatestArrival,
  General,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
  Forward,
  Backward,
}

/// Values written while applying a solved schedule.  `None` until the node is part of a
/// route.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSchedule {
  pub arrival_time: Option<Time>,
  pub departure_time: Option<Time>,
  pub beginning_service: Option<Time>,
  pub waiting_time: Option<Time>,
  /// Drop-off nodes only.
  pub ride_time: Option<Time>,
  /// Load after service.
  pub vehicle_load: Option<Demand>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
  pub id: Loc,
  pub station: usize,
  pub demand: Demand,
  pub service_time: Time,
  pub max_ride_time: Time,
  pub start_tw: Time,
  pub end_tw: Time,
  pub tw_length: Time,
  pub request_type: RequestType,
  pub direction: Direction,
  pub schedule: NodeSchedule,
}

impl Node {
  fn depot(horizon: Time) -> Node {
    Node {
      id: 0,
      station: 0,
      demand: 0,
      service_time: 0.0,
      max_ride_time: 0.0,
      start_tw: 0.0,
      end_tw: horizon,
      tw_length: horizon,
      request_type: RequestType::General,
      direction: Direction::Forward,
      schedule: NodeSchedule::default(),
    }
  }
}

#[allow(non_snake_case)]
#[derive(Debug, Clone)]
pub struct DarpInstance {
  pub id: String,
  pub n: Req,
  pub P: Vec<Loc>,
  pub D: Vec<Loc>,
  pub num_vehicles: usize,
  pub num_stations: usize,
  pub capacity: Demand,
  pub max_route_duration: Time,
  /// Every time window lies in `[0, planning_horizon]`.
  pub planning_horizon: Time,
  pub alpha: f64,
  pub beta: f64,
  /// `2n + 1` nodes, indexed by `Loc`.
  pub nodes: Vec<Node>,
  /// Time information as given in the instance file, before derivation.
  pub raw_earliest_pickup: Map<Req, Option<Time>>,
  pub raw_latest_dropoff: Map<Req, Option<Time>>,
  pub d: Matrix,
  pub tt: Matrix,
  pub d_direct: Map<Req, Time>,
  pub become_known: Map<Req, Time>,
  /// Requests known before the first MILP, in increasing order.
  pub known_at_start: Vec<Req>,
  /// Requests `1..=last_static` are all known at the start.
  pub last_static: Req,
  pub o_depot: Loc,
}

impl FromRaw<RequestFile> for DarpInstance {
  fn from_raw(raw: RequestFile, id: Cow<str>) -> anyhow::Result<DarpInstance> {
    if raw.requests.len() != raw.num_requests {
      return Err(DarpError::Parse(format!(
        "{} request lines given, header announces {}", raw.requests.len(), raw.num_requests
      )).into());
    }
    if 2 * raw.num_requests + 1 > Loc::MAX as usize {
      return Err(DarpError::Parse(format!("too many requests: {}", raw.num_requests)).into());
    }
    let capacity = Demand::try_from(raw.vehicle_capacity)
      .map_err(|_| DarpError::Parse(format!("vehicle capacity too large: {}", raw.vehicle_capacity)))?;

    let n = raw.num_requests as Req;
    let horizon = raw.max_route_duration;
    let mut pickups = Vec::with_capacity(raw.num_requests);
    let mut dropoffs = Vec::with_capacity(raw.num_requests);
    let mut raw_earliest_pickup = Map::default();
    let mut raw_latest_dropoff = Map::default();

    for (k, r) in raw.requests.iter().enumerate() {
      let i = k as Req + 1;
      if r.id != i as usize {
        debug!(line_id=r.id, request=i, "request id differs from its position");
      }
      for station in [r.origin, r.destination] {
        if station < 1 || station > raw.num_stations {
          return Err(DarpError::Parse(format!(
            "request {} uses station {}, valid stations are 1..={}", i, station, raw.num_stations
          )).into());
        }
      }
      if r.service_time < 0.0 || !r.service_time.is_finite() {
        return Err(DarpError::Parse(format!("request {} has service time {}", i, r.service_time)).into());
      }
      if r.demand.unsigned_abs() > capacity.unsigned_abs() {
        return Err(DarpError::InfeasibleInstance(format!(
          "demand {} of request {} exceeds vehicle capacity {}", r.demand, i, capacity
        )).into());
      }

      let direction = if r.origin < r.destination {
        Direction::Forward
      } else if r.origin > r.destination {
        Direction::Backward
      } else {
        warn!(request=i, station=r.origin, "origin and destination coincide, assuming forward travel");
        Direction::Forward
      };

      let node = |id: Loc, station: usize, demand: Demand, start_tw: Time, end_tw: Time| Node {
        id,
        station,
        demand,
        service_time: r.service_time,
        max_ride_time: 0.0,
        start_tw,
        end_tw,
        tw_length: end_tw - start_tw,
        request_type: RequestType::General,
        direction,
        schedule: NodeSchedule::default(),
      };
      pickups.push(node(i, r.origin, r.demand, r.earliest_pickup.unwrap_or(0.0), horizon));
      dropoffs.push(node(i + n, r.destination, -r.demand, 0.0, r.latest_dropoff.unwrap_or(horizon)));
      raw_earliest_pickup.insert(i, r.earliest_pickup);
      raw_latest_dropoff.insert(i, r.latest_dropoff);
    }

    let mut nodes = Vec::with_capacity(2 * raw.num_requests + 1);
    nodes.push(Node::depot(horizon));
    nodes.extend(pickups);
    nodes.extend(dropoffs);

    let num_nodes = nodes.len();
    Ok(DarpInstance {
      id: id.into_owned(),
      n,
      P: (1..=n).collect(),
      D: (n + 1..=2 * n).collect(),
      num_vehicles: raw.num_vehicles,
      num_stations: raw.num_stations,
      capacity,
      max_route_duration: raw.max_route_duration,
      planning_horizon: horizon,
      alpha: raw.alpha,
      beta: raw.beta,
      nodes,
      raw_earliest_pickup,
      raw_latest_dropoff,
      d: Matrix::zeros((num_nodes, num_nodes)),
      tt: Matrix::zeros((num_nodes, num_nodes)),
      d_direct: Map::default(),
      become_known: (1..=n).map(|i| (i, 0.0)).collect(),
      known_at_start: (1..=n).collect(),
      last_static: n,
      o_depot: 0,
    })
  }
}

impl DarpInstance {
  #[inline]
  pub fn is_pickup(&self, i: Loc) -> bool {
    0 < i && i <= self.n
  }

  #[inline]
  pub fn is_delivery(&self, i: Loc) -> bool {
    self.n < i && i <= self.n * 2
  }

  #[inline]
  pub fn dmap(&self, i: Loc) -> Loc {
    debug_assert!(self.is_pickup(i));
    i + self.n
  }

  #[inline]
  pub fn pmap(&self, i: Loc) -> Loc {
    debug_assert!(self.is_delivery(i));
    i - self.n
  }

  /// The request a non-depot node belongs to.
  #[inline]
  pub fn request_of(&self, i: Loc) -> Req {
    if self.is_delivery(i) { self.pmap(i) } else { i }
  }

  pub fn num_nodes(&self) -> usize { self.nodes.len() }

  pub fn requests(&self) -> impl Iterator<Item=Req> {
    1..=self.n
  }

  #[inline]
  pub fn node(&self, i: Loc) -> &Node {
    &self.nodes[i as usize]
  }

  #[inline]
  pub fn travel_time(&self, i: Loc, j: Loc) -> Time {
    self.tt[[i as usize, j as usize]]
  }

  #[inline]
  pub fn distance(&self, i: Loc, j: Loc) -> f64 {
    self.d[[i as usize, j as usize]]
  }

  /// Direct travel time from pickup to drop-off.
  #[inline]
  pub fn direct_travel_time(&self, r: Req) -> Time {
    self.travel_time(r, self.dmap(r))
  }

  /// The latest time request `r` can be picked up, after which a pending request is denied.
  #[inline]
  pub fn pickup_deadline(&self, r: Req) -> Time {
    self.node(r).end_tw
  }

  /// Clear every schedule written by a previous solve.
  pub fn clear_schedule(&mut self) {
    for node in self.nodes.iter_mut() {
      node.schedule = NodeSchedule::default();
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn raw(s: &str) -> RequestFile {
    s.parse().unwrap()
  }

  #[test]
  fn nodes_and_demand() -> anyhow::Result<()> {
    let data = DarpInstance::from_raw(
      raw("2 2 4 100 3 1.5 20\n1 1 3 2 1 0 x\n2 4 2 2 2 x 80\n"),
      "small".into(),
    )?;
    assert_eq!(data.num_nodes(), 5);
    assert_eq!(data.P, vec![1, 2]);
    assert_eq!(data.D, vec![3, 4]);
    assert_eq!(data.node(2).demand, 2);
    assert_eq!(data.node(4).demand, -2);
    assert_eq!(data.node(4).station, 2);
    assert_eq!(data.node(1).direction, Direction::Forward);
    assert_eq!(data.node(2).direction, Direction::Backward);
    assert_eq!(data.raw_earliest_pickup[&2], None);
    assert_eq!(data.raw_latest_dropoff[&2], Some(80.0));
    assert_eq!(data.node(4).end_tw, 80.0);
    assert_eq!(data.node(0).end_tw, 100.0);
    assert_eq!(data.request_of(4), 2);
    assert!(data.is_delivery(3));
    assert!(!data.is_delivery(0));
    Ok(())
  }

  #[test]
  fn demand_exceeds_capacity() {
    let err = DarpInstance::from_raw(raw("1 1 2 100 2 1.5 20\n1 1 2 1 3 0 x\n"), "q".into()).unwrap_err();
    assert!(matches!(err.downcast_ref::<DarpError>(), Some(DarpError::InfeasibleInstance(_))));

    let err = DarpInstance::from_raw(raw("1 1 2 100 2 1.5 20\n1 1 2 1 -3 0 x\n"), "q".into()).unwrap_err();
    assert!(matches!(err.downcast_ref::<DarpError>(), Some(DarpError::InfeasibleInstance(_))));

    let err = DarpInstance::from_raw(raw("1 1 2 100 2 1.5 20\n1 1 2 1 -2147483648 0 x\n"), "q".into()).unwrap_err();
    assert!(matches!(err.downcast_ref::<DarpError>(), Some(DarpError::InfeasibleInstance(_))));
  }

  #[test]
  fn station_out_of_range() {
    let err = DarpInstance::from_raw(raw("1 1 2 100 2 1.5 20\n1 1 5 1 1 0 x\n"), "s".into()).unwrap_err();
    assert!(matches!(err.downcast_ref::<DarpError>(), Some(DarpError::Parse(_))));
  }

  #[test]
  fn negative_service_time() {
    let err = DarpInstance::from_raw(raw("1 1 2 100 2 1.5 20\n1 1 2 -1 1 0 x\n"), "s".into()).unwrap_err();
    assert!(matches!(err.downcast_ref::<DarpError>(), Some(DarpError::Parse(_))));
  }
}
