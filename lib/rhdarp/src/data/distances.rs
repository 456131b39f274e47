use std::path::{Path, PathBuf};
use anyhow::Result;
use tracing::{debug, instrument};
use instances::parsers::{ParseInstance, DistanceMatrixFmt, LocationFmt};
use instances::raw::darp::{StationDistances, StationLocations};
use instances::raw::metrics::{Euclidean, Metric};
use super::darp::*;
use crate::DarpError;

/// How travel distances between stations are obtained.  Travel time equals distance.
#[derive(Debug, Clone, PartialEq)]
pub enum DistanceMode {
  /// Stations lie on a line with unit spacing.
  Unit,
  /// A full station-to-station table.
  Matrix(PathBuf),
  /// Station coordinates.  Without shortcuts a vehicle passes every station in between.
  Coordinates { path: PathBuf, shortcuts: bool },
}

impl Default for DistanceMode {
  fn default() -> Self { DistanceMode::Unit }
}

#[inline]
pub fn round2(x: f64) -> f64 {
  (x * 100.0).round() / 100.0
}

fn parse_error(path: &Path, e: anyhow::Error) -> DarpError {
  DarpError::Parse(format!("{}: {:#}", path.display(), e))
}

impl DarpInstance {
  #[instrument(level="debug", skip(self), fields(instance=%self.id))]
  pub fn generate_distances(&mut self, mode: &DistanceMode) -> Result<()> {
    match mode {
      DistanceMode::Unit => self.unit_distances(),
      DistanceMode::Matrix(path) => {
        let m = StationDistances::parse(DistanceMatrixFmt(path)).map_err(|e| parse_error(path, e))?;
        self.matrix_distances(&m)?;
      }
      DistanceMode::Coordinates { path, shortcuts } => {
        let l = StationLocations::parse(LocationFmt(path)).map_err(|e| parse_error(path, e))?;
        self.coordinate_distances(&l, *shortcuts)?;
      }
    }
    debug!(n=self.n, "distances generated");
    Ok(())
  }

  pub fn unit_distances(&mut self) {
    let dist = |a: usize, b: usize| (a as f64 - b as f64).abs();
    self.fill_distances(dist, dist);
  }

  pub fn matrix_distances(&mut self, m: &StationDistances) -> Result<()> {
    if m.num_stations() < self.num_stations {
      return Err(DarpError::Parse(format!(
        "distance matrix covers {} stations, instance uses {}", m.num_stations(), self.num_stations
      )).into());
    }
    // stations are validated on load, so every lookup succeeds
    let dist = |a: usize, b: usize| m.get(a, b).unwrap_or(f64::NAN);
    self.fill_distances(dist, dist);
    Ok(())
  }

  pub fn coordinate_distances(&mut self, l: &StationLocations, shortcuts: bool) -> Result<()> {
    let mut coords = Vec::with_capacity(self.num_stations + 1);
    coords.push((0.0, 0.0));
    for s in 1..=self.num_stations {
      let c = l.coords.get(&s)
        .ok_or_else(|| DarpError::Parse(format!("no coordinates for station {}", s)))?;
      coords.push(*c);
    }
    let euclidean = |a: usize, b: usize| Euclidean::compute(coords[a], coords[b]);

    if shortcuts {
      self.fill_distances(euclidean, euclidean);
    } else {
      // offset[s] is the length of the line 1 -> 2 -> ... -> s
      let mut offset = vec![0.0; self.num_stations + 1];
      for s in 2..=self.num_stations {
        offset[s] = offset[s - 1] + euclidean(s - 1, s);
      }
      let along_line = |a: usize, b: usize| (offset[a] - offset[b]).abs();
      self.fill_distances(along_line, euclidean);
    }
    Ok(())
  }

  /// Populate `d`, `tt` and `d_direct`.  Depot rows and columns are zero.
  fn fill_distances(&mut self, station_dist: impl Fn(usize, usize) -> f64, direct: impl Fn(usize, usize) -> f64) {
    let num_nodes = self.num_nodes();
    let mut d = Matrix::zeros((num_nodes, num_nodes));
    for i in 1..num_nodes {
      for j in 1..num_nodes {
        if i != j {
          d[[i, j]] = round2(station_dist(self.nodes[i].station, self.nodes[j].station));
        }
      }
    }
    self.d_direct = self.requests()
      .map(|r| {
        let p = &self.nodes[r as usize];
        let q = &self.nodes[self.dmap(r) as usize];
        (r, round2(direct(p.station, q.station)))
      })
      .collect();
    self.tt = d.clone();
    self.d = d;
  }
}
