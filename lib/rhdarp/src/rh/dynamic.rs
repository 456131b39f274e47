use tracing::*;

use crate::data::*;
use crate::{Map, EPS};
use super::DynamicConfig;

/// Time at which request `r` becomes known when it is not part of the static share:
/// `notice` before the latest time its pickup could take place.
pub fn reveal_time(data: &DarpInstance, r: Req, notice: Time) -> Time {
  let d = data.dmap(r);
  let latest_pickup = f64::min(
    data.node(r).end_tw,
    data.node(d).end_tw - data.direct_travel_time(r) - data.node(r).service_time,
  );
  f64::max(0.0, latest_pickup - notice)
}

/// Decide when every request becomes known.
///
/// The first `share_static_requests * n` requests are known at time zero, every other
/// request `notice` time units before its latest pickup.  If that leaves nothing known at
/// time zero, the earliest requests are moved there.
#[instrument(level="debug", skip(data), fields(instance=%data.id))]
pub fn transform_dynamic(data: &mut DarpInstance, cfg: &DynamicConfig) {
  let n = data.n;
  if n == 0 {
    data.become_known.clear();
    data.known_at_start.clear();
    data.last_static = 0;
    return;
  }
  let share = cfg.share_static_requests.clamp(0.0, 1.0);
  let num_static = ((share * n as f64 + EPS).floor() as Req).min(n);

  let mut become_known: Map<Req, Time> = data.requests()
    .map(|r| {
      let t = if r <= num_static { 0.0 } else { reveal_time(data, r, cfg.notice) };
      (r, if t < EPS { 0.0 } else { t })
    })
    .collect();

  if become_known.values().all(|&t| t > 0.0) {
    let earliest = become_known.values().copied().fold(f64::INFINITY, f64::min);
    for t in become_known.values_mut() {
      if *t - earliest < EPS {
        *t = 0.0;
      }
    }
    debug!(earliest, "no request known at the start, revealing the earliest");
  }

  let known_at_start: Vec<Req> = data.requests().filter(|r| become_known[r] == 0.0).collect();
  let last_static = known_at_start.iter().enumerate()
    .take_while(|&(k, &r)| r as usize == k + 1)
    .count() as Req;

  info!(num_static, known_at_start=known_at_start.len(), last_static, "request reveal times set");
  data.become_known = become_known;
  data.known_at_start = known_at_start;
  data.last_static = last_static;
}
