use tracing::*;

use crate::data::*;
use crate::{DarpError, EPS};

fn check_window(data: &DarpInstance, i: Loc) -> Result<(), DarpError> {
  let node = data.node(i);
  if node.end_tw <= node.start_tw {
    error!(i, start=node.start_tw, end=node.end_tw, "empty time window");
    return Err(DarpError::TimeWindow { node: i, start: node.start_tw, end: node.end_tw });
  }
  Ok(())
}

/// Derive pickup and drop-off windows from the partial time information of each request.
///
/// The maximum ride time is `alpha` times the direct travel time.  A request with only an
/// earliest pickup gets a pickup window of length `beta` and a drop-off window implied by
/// the ride time bound; a request with only a latest drop-off is handled symmetrically.
/// In both cases `tw_length` is the length of each node's own window.  When both are given,
/// `tw_length` measures the slack left after the longest allowed ride.
#[instrument(level="debug", skip(data), fields(instance=%data.id))]
pub fn set_time_windows(data: &mut DarpInstance) -> anyhow::Result<()> {
  let horizon = data.planning_horizon;
  let beta = data.beta;

  for r in data.requests() {
    let p = r as usize;
    let d = data.dmap(r) as usize;
    let tt = data.direct_travel_time(r);
    let s = data.nodes[p].service_time;
    let max_ride_time = tt * data.alpha;

    let (request_type, tw_length) = match (data.raw_earliest_pickup[&r], data.raw_latest_dropoff[&r]) {
      (Some(e), None) => {
        let pickup_end = f64::min(horizon, e + beta);
        data.nodes[p].start_tw = e;
        data.nodes[p].end_tw = pickup_end;
        data.nodes[d].start_tw = f64::max(0.0, e + tt + s);
        data.nodes[d].end_tw = f64::min(horizon, pickup_end + max_ride_time);
        (RequestType::EarliestDeparture, None)
      }
      (None, Some(l)) => {
        let dropoff_start = f64::max(0.0, l - beta);
        data.nodes[d].start_tw = dropoff_start;
        data.nodes[d].end_tw = l;
        data.nodes[p].start_tw = f64::max(0.0, dropoff_start - max_ride_time - s);
        data.nodes[p].end_tw = f64::min(horizon, l - tt - s);
        (RequestType::LatestArrival, None)
      }
      (Some(e), Some(l)) => {
        data.nodes[p].start_tw = e;
        data.nodes[p].end_tw = f64::min(horizon, f64::max(0.0, l - tt - s));
        data.nodes[d].start_tw = f64::max(0.0, e + tt + s);
        data.nodes[d].end_tw = l;
        (RequestType::General, Some(l - (e + max_ride_time + s)))
      }
      (None, None) => {
        return Err(DarpError::InfeasibleInstance(format!("request {} has neither pickup nor drop-off time", r)).into());
      }
    };

    for i in [p, d] {
      let node = &mut data.nodes[i];
      node.max_ride_time = max_ride_time;
      node.request_type = request_type;
      node.tw_length = tw_length.unwrap_or(node.end_tw - node.start_tw);
    }
    trace!(r, ?request_type, pickup=?(data.nodes[p].start_tw, data.nodes[p].end_tw),
      dropoff=?(data.nodes[d].start_tw, data.nodes[d].end_tw), "derived time windows");
    check_window(data, r)?;
    check_window(data, data.dmap(r))?;
  }
  Ok(())
}

/// Replace windows spanning the whole horizon by windows implied by the paired node.
#[instrument(level="debug", skip(data), fields(instance=%data.id))]
pub fn tighten_time_windows(data: &mut DarpInstance) -> anyhow::Result<()> {
  let horizon = data.planning_horizon;
  let uninformative = |node: &Node| node.start_tw < EPS && node.end_tw >= horizon - EPS;

  for r in data.requests() {
    let p = r as usize;
    let d = data.dmap(r) as usize;
    let tt = data.direct_travel_time(r);
    let s = data.nodes[p].service_time;
    let max_ride_time = data.nodes[p].max_ride_time;

    if uninformative(&data.nodes[p]) {
      let (e_d, l_d) = (data.nodes[d].start_tw, data.nodes[d].end_tw);
      let node = &mut data.nodes[p];
      node.end_tw = f64::max(0.0, l_d - tt - s);
      node.start_tw = f64::max(0.0, e_d - max_ride_time - s);
      trace!(i=p, start=node.start_tw, end=node.end_tw, "tighten pickup window");
      check_window(data, p as Loc)?;
      if uninformative(&data.nodes[p]) {
        let node = &data.nodes[p];
        return Err(DarpError::TimeWindow { node: p as Loc, start: node.start_tw, end: node.end_tw }.into());
      }
    }

    if uninformative(&data.nodes[d]) {
      let (e_p, l_p) = (data.nodes[p].start_tw, data.nodes[p].end_tw);
      let node = &mut data.nodes[d];
      node.start_tw = e_p + s + tt;
      node.end_tw = f64::min(horizon, l_p + s + max_ride_time);
      trace!(i=d, start=node.start_tw, end=node.end_tw, "tighten drop-off window");
      check_window(data, d as Loc)?;
      if uninformative(&data.nodes[d]) {
        let node = &data.nodes[d];
        return Err(DarpError::TimeWindow { node: d as Loc, start: node.start_tw, end: node.end_tw }.into());
      }
    }
  }
  Ok(())
}


#[cfg(test)]
mod tests {
  use super::*;
  use instances::raw::FromRaw;
  use proptest::prelude::*;

  fn instance(s: &str) -> DarpInstance {
    let mut data = DarpInstance::from_raw(s.parse().unwrap(), "tw".into()).unwrap();
    data.unit_distances();
    data
  }

  #[test]
  fn earliest_departure() -> anyhow::Result<()> {
    // stations 1 and 11 are 10 apart
    let mut data = instance("1 1 11 100 3 1.5 20\n1 1 11 5 1 0 x\n");
    set_time_windows(&mut data)?;
    let (p, d) = (data.node(1), data.node(2));
    assert_eq!(p.max_ride_time, 15.0);
    assert_eq!((p.start_tw, p.end_tw), (0.0, 20.0));
    assert_eq!((d.start_tw, d.end_tw), (15.0, 35.0));
    assert_eq!(p.request_type, RequestType::EarliestDeparture);
    assert_eq!(d.tw_length, 20.0);
    Ok(())
  }

  #[test]
  fn window_lengths_follow_clipped_windows() -> anyhow::Result<()> {
    let mut data = instance("1 1 11 40 3 1.5 20\n1 1 11 0 1 25 x\n");
    set_time_windows(&mut data)?;
    let (p, d) = (data.node(1), data.node(2));
    assert_eq!((p.start_tw, p.end_tw), (25.0, 40.0));
    assert_eq!(p.tw_length, 15.0);
    assert_eq!((d.start_tw, d.end_tw), (35.0, 40.0));
    assert_eq!(d.tw_length, 5.0);
    Ok(())
  }

  #[test]
  fn horizon_caps_dropoff() -> anyhow::Result<()> {
    let mut data = instance("1 1 11 30 3 1.5 20\n1 1 11 5 1 0 x\n");
    set_time_windows(&mut data)?;
    assert_eq!(data.node(2).end_tw, 30.0);
    Ok(())
  }

  #[test]
  fn latest_arrival() -> anyhow::Result<()> {
    let mut data = instance("1 1 11 100 3 1.5 20\n1 1 11 5 1 x 80\n");
    set_time_windows(&mut data)?;
    let (p, d) = (data.node(1), data.node(2));
    assert_eq!((d.start_tw, d.end_tw), (60.0, 80.0));
    assert_eq!((p.start_tw, p.end_tw), (40.0, 65.0));
    assert_eq!(p.request_type, RequestType::LatestArrival);
    assert_eq!(p.tw_length, 25.0);
    assert_eq!(d.tw_length, 20.0);
    Ok(())
  }

  #[test]
  fn both_given() -> anyhow::Result<()> {
    let mut data = instance("1 1 11 100 3 1.5 20\n1 1 11 5 1 10 70\n");
    set_time_windows(&mut data)?;
    let (p, d) = (data.node(1), data.node(2));
    assert_eq!((p.start_tw, p.end_tw), (10.0, 55.0));
    assert_eq!((d.start_tw, d.end_tw), (25.0, 70.0));
    assert_eq!(p.request_type, RequestType::General);
    assert_eq!(p.tw_length, 40.0);
    Ok(())
  }

  #[test]
  fn no_time_information() {
    let mut data = instance("1 1 11 100 3 1.5 20\n1 1 11 5 1 x x\n");
    let err = set_time_windows(&mut data).unwrap_err();
    assert!(matches!(err.downcast_ref::<DarpError>(), Some(DarpError::InfeasibleInstance(_))));
  }

  #[test]
  fn unreachable_deadline() {
    // 10 units of travel cannot fit before 12 when the earliest pickup is 5
    let mut data = instance("1 1 11 100 3 1.5 20\n1 1 11 0 1 5 12\n");
    let err = set_time_windows(&mut data).unwrap_err();
    assert!(matches!(err.downcast_ref::<DarpError>(), Some(DarpError::TimeWindow { node: 1, .. })));
  }

  #[test]
  fn tighten_uninformative_pickup() -> anyhow::Result<()> {
    let mut data = instance("1 1 11 100 3 1.5 20\n1 1 11 5 1 x 80\n");
    set_time_windows(&mut data)?;
    data.nodes[1].start_tw = 0.0;
    data.nodes[1].end_tw = 100.0;
    tighten_time_windows(&mut data)?;
    let p = data.node(1);
    assert_eq!((p.start_tw, p.end_tw), (40.0, 65.0));
    Ok(())
  }

  #[test]
  fn tighten_uninformative_dropoff() -> anyhow::Result<()> {
    let mut data = instance("1 1 11 100 3 1.5 20\n1 1 11 5 1 0 x\n");
    set_time_windows(&mut data)?;
    data.nodes[2].start_tw = 0.0;
    data.nodes[2].end_tw = 100.0;
    tighten_time_windows(&mut data)?;
    let d = data.node(2);
    assert!(d.start_tw > 0.0 || d.end_tw < 100.0);
    assert_eq!((d.start_tw, d.end_tw), (15.0, 40.0));
    Ok(())
  }

  #[test]
  fn tighten_fails_on_empty_window() {
    let mut data = instance("1 1 11 100 3 1.5 20\n1 1 11 5 1 0 x\n");
    set_time_windows(&mut data).unwrap();
    data.nodes[1].start_tw = 0.0;
    data.nodes[1].end_tw = 100.0;
    // drop-off must happen before the vehicle could get there
    data.nodes[2].start_tw = 0.0;
    data.nodes[2].end_tw = 12.0;
    let err = tighten_time_windows(&mut data).unwrap_err();
    assert!(matches!(err.downcast_ref::<DarpError>(), Some(DarpError::TimeWindow { node: 1, .. })));
  }

  proptest! {
    #[test]
    fn derived_windows_are_consistent(
      start in 0.0..200.0f64,
      beta in 1.0..60.0f64,
      alpha in 1.0..3.0f64,
      service in 0.0..5.0f64,
    ) {
      let text = format!("1 1 11 1000 3 {} {}\n1 1 11 {} 1 {} x\n", alpha, beta, service, start);
      let mut data = instance(&text);
      set_time_windows(&mut data).unwrap();
      let (p, d) = (data.node(1).clone(), data.node(2).clone());
      prop_assert!(p.end_tw > p.start_tw);
      prop_assert!(d.end_tw > d.start_tw);
      prop_assert!(d.start_tw >= p.start_tw + 10.0 + service - EPS);
      prop_assert!((p.max_ride_time - 10.0 * alpha).abs() < EPS);
      prop_assert_eq!(p.max_ride_time, d.max_ride_time);
    }
  }
}
