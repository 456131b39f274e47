use crate::Map;

pub type Time = f64;
pub type Demand = i32;

/// One line of a request file. Missing time information is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRequest {
  pub id: usize,
  pub origin: usize,
  pub destination: usize,
  pub service_time: Time,
  pub demand: Demand,
  pub earliest_pickup: Option<Time>,
  pub latest_dropoff: Option<Time>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestFile {
  pub num_vehicles: usize,
  pub num_requests: usize,
  pub num_stations: usize,
  pub max_route_duration: Time,
  pub vehicle_capacity: usize,
  pub alpha: f64,
  pub beta: f64,
  pub requests: Vec<RawRequest>,
}

/// Station-to-station distances, `matrix[s-1][t-1]` is the distance from station `s` to `t`.
#[derive(Debug, Clone, PartialEq)]
pub struct StationDistances {
  pub matrix: Vec<Vec<f64>>,
}

impl StationDistances {
  pub fn num_stations(&self) -> usize { self.matrix.len() }

  pub fn get(&self, from: usize, to: usize) -> Option<f64> {
    self.matrix.get(from.checked_sub(1)?)?.get(to.checked_sub(1)?).copied()
  }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StationLocations {
  pub coords: Map<usize, (f64, f64)>,
}
