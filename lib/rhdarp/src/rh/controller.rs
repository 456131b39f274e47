use std::time::{Duration, Instant};
use anyhow::{anyhow, bail, Result};
use tracing::*;

use crate::data::*;
use crate::{DarpError, Map, Set, EPS};
use super::{schedule, RequestStatus, RhConfig};
use super::graph::{arc_time_feasible, Arc, Event, EventGraph, Vertex};
use super::index::{MapUpdate, Maps, RequestVars};
use super::milp::*;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RhState {
  Initializing,
  Solving,
  ApplyingResult,
  Advancing,
  Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
  pub vehicle: usize,
  /// Starts and ends at the depot.
  pub nodes: Vec<Loc>,
}

#[derive(Debug, Clone)]
pub struct RhOutcome {
  pub instance: String,
  pub routes: Vec<Route>,
  pub status: Map<Req, RequestStatus>,
  pub accepted: usize,
  pub denied: usize,
  pub num_milps: usize,
  pub time_model: Duration,
  pub time_solve: Duration,
  /// Number of fixed arcs after each advance of time.
  pub fixed_arc_history: Vec<usize>,
  pub communicated_pickup: Map<Req, Time>,
  pub objective: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RhSummary {
  pub accepted: usize,
  pub denied: usize,
  pub num_milps: usize,
  pub total_distance: f64,
  pub avg_ride_time: Option<Time>,
  pub avg_excess_ride_time: Option<Time>,
  /// Deviation from the promised time: pickup after the earliest pickup, or drop-off
  /// before the latest drop-off.  Requests with both times given are left out.
  pub avg_waiting_time: Option<Time>,
}

fn mean(values: impl Iterator<Item=f64>) -> Option<f64> {
  let (sum, k) = values.fold((0.0, 0usize), |(s, k), v| (s + v, k + 1));
  if k == 0 { None } else { Some(sum / k as f64) }
}

impl RhOutcome {
  fn consecutive(&self) -> impl Iterator<Item=(Loc, Loc)> + '_ {
    self.routes.iter().flat_map(|r| r.nodes.windows(2).map(|w| (w[0], w[1])))
  }

  /// Successor of every routed request node; the last node of a route maps to the depot.
  pub fn successors(&self) -> Map<Loc, Loc> {
    self.consecutive().filter(|&(i, _)| i != 0).collect()
  }

  pub fn predecessors(&self) -> Map<Loc, Loc> {
    self.consecutive().filter(|&(_, j)| j != 0).map(|(i, j)| (j, i)).collect()
  }

  pub fn total_distance(&self, data: &DarpInstance) -> f64 {
    self.consecutive().map(|(i, j)| data.distance(i, j)).sum()
  }

  pub fn served(&self) -> impl Iterator<Item=Req> + '_ {
    let mut served: Vec<Req> = self.status.iter()
      .filter(|(_, &s)| s == RequestStatus::DroppedOff)
      .map(|(&r, _)| r)
      .collect();
    served.sort_unstable();
    served.into_iter()
  }

  pub fn summary(&self, data: &DarpInstance) -> RhSummary {
    let ride = |r: Req| data.node(data.dmap(r)).schedule.ride_time;
    RhSummary {
      accepted: self.accepted,
      denied: self.denied,
      num_milps: self.num_milps,
      total_distance: self.total_distance(data),
      avg_ride_time: mean(self.served().filter_map(ride)),
      avg_excess_ride_time: mean(self.served().filter_map(|r| Some(ride(r)? - data.direct_travel_time(r)))),
      avg_waiting_time: mean(self.served().filter_map(|r| {
        let (p, d) = (data.node(r), data.node(data.dmap(r)));
        match p.request_type {
          RequestType::EarliestDeparture => Some(p.schedule.beginning_service? - p.start_tw),
          RequestType::LatestArrival => Some(d.end_tw - d.schedule.beginning_service?),
          RequestType::General => None,
        }
      })),
    }
  }
}

/// Committed decisions.  Everything in here only ever grows.
#[derive(Debug, Default)]
struct Fixed {
  /// In the order they were fixed.
  arcs: Vec<Arc>,
  arc_set: Set<Arc>,
  arc_constrs: Map<Arc, ConstrId>,
  /// Non-depot tails of fixed arcs.
  tails: Set<Vertex>,
  heads: Set<Vertex>,
  /// Service start of every executed node.
  times: Map<Loc, Time>,
  time_constrs: Map<Loc, ConstrId>,
}

impl Fixed {
  fn is_fixed_vertex(&self, v: &Vertex) -> bool {
    self.heads.contains(v) || self.tails.contains(v)
  }
}

/// The solved values the next steps are based on.
#[derive(Debug, Clone)]
struct Incumbent {
  used: Vec<Arc>,
  /// Service start of every node of an active request and every executed node.
  times: Map<Loc, Time>,
  accepted: Set<Req>,
  objective: Option<f64>,
}

#[derive(Debug, Default)]
struct StatusChanges {
  picked_up: Vec<Req>,
  dropped_off: Vec<Req>,
  denied: Vec<Req>,
}

struct ArcFilter<'b> {
  data: &'b DarpInstance,
  now: Time,
  fixed: &'b Fixed,
}

impl ArcFilter<'_> {
  fn bounds(&self, i: Loc) -> (Time, Time) {
    match self.fixed.times.get(&i) {
      Some(&b) => (b, b),
      None => {
        let node = self.data.node(i);
        (f64::max(node.start_tw, self.now), node.end_tw)
      }
    }
  }

  /// Fixed arcs stay.  Otherwise an arc may not leave a vertex which is already left by a
  /// fixed arc, nor enter one which is already entered by one, and must be time-feasible.
  fn allows(&self, a: &Arc) -> bool {
    if self.fixed.arc_set.contains(a) {
      return true;
    }
    let (u, v) = a;
    if !u.is_depot() && self.fixed.tails.contains(u) {
      return false;
    }
    if !v.is_depot() && self.fixed.heads.contains(v) {
      return false;
    }
    arc_time_feasible(self.data, a, |i| self.bounds(i))
  }
}

/// Drives the sequence of MILPs for one instance.
///
/// Time only moves forward, to the moment the next request becomes known (or to infinity
/// once everything is known).  Whatever the last solution had started before that moment
/// is fixed for good and the model is rebuilt around it.  The previous solution, with
/// every newly revealed request rejected, stays feasible in the next MILP.
pub struct RollingHorizon<'a, S> {
  data: &'a mut DarpInstance,
  config: RhConfig,
  solver: S,
  state: RhState,
  now: Time,
  model: Model,
  graph: EventGraph,
  maps: Maps,
  status: Map<Req, RequestStatus>,
  fixed: Fixed,
  serve_accepted: Map<Req, ConstrId>,
  /// Rebuilt before every solve.
  volatile: Vec<ConstrId>,
  d_max: Option<VarId>,
  solution: Option<Solution>,
  incumbent: Option<Incumbent>,
  communicated_pickup: Map<Req, Time>,
  num_milps: usize,
  denied: usize,
  time_model: Duration,
  time_solve: Duration,
  fixed_arc_history: Vec<usize>,
}

impl<'a, S: MilpSolver> RollingHorizon<'a, S> {
  pub fn new(data: &'a mut DarpInstance, config: RhConfig, solver: S) -> Self {
    let status = data.requests().map(|r| (r, RequestStatus::Unrevealed)).collect();
    RollingHorizon {
      data,
      config,
      solver,
      state: RhState::Initializing,
      now: 0.0,
      model: Model::new(ObjSense::Maximise),
      graph: EventGraph::new(),
      maps: Maps::default(),
      status,
      fixed: Fixed::default(),
      serve_accepted: Map::default(),
      volatile: Vec::new(),
      d_max: None,
      solution: None,
      incumbent: None,
      communicated_pickup: Map::default(),
      num_milps: 0,
      denied: 0,
      time_model: Duration::ZERO,
      time_solve: Duration::ZERO,
      fixed_arc_history: Vec::new(),
    }
  }

  pub fn state(&self) -> RhState { self.state }

  pub fn now(&self) -> Time { self.now }

  pub fn status(&self, r: Req) -> Option<RequestStatus> { self.status.get(&r).copied() }

  pub fn model(&self) -> &Model { &self.model }

  pub fn graph(&self) -> &EventGraph { &self.graph }

  pub fn maps(&self) -> &Maps { &self.maps }

  pub fn num_fixed_arcs(&self) -> usize { self.fixed.arcs.len() }

  pub fn run(mut self) -> Result<RhOutcome> {
    let span = info_span!("rolling_horizon", instance=%self.data.id);
    let _g = span.enter();
    while self.step()? != RhState::Terminated {}
    self.outcome()
  }

  /// Perform one transition of the state machine.
  pub fn step(&mut self) -> Result<RhState> {
    self.state = match self.state {
      RhState::Initializing => {
        if self.data.n == 0 {
          RhState::Terminated
        } else {
          self.first_milp()?;
          RhState::Solving
        }
      }
      RhState::Solving => {
        self.solve_milp()?;
        RhState::ApplyingResult
      }
      RhState::ApplyingResult => {
        self.query_solution()?;
        RhState::Advancing
      }
      RhState::Advancing => {
        if self.advance()? { RhState::Solving } else { RhState::Terminated }
      }
      RhState::Terminated => RhState::Terminated,
    };
    trace!(state=?self.state, t=self.now);
    Ok(self.state)
  }

  fn set_status(&mut self, r: Req, next: RequestStatus) -> Result<()> {
    let current = self.status.get_mut(&r).ok_or_else(|| anyhow!("unknown request {}", r))?;
    if !current.can_become(next) {
      bail!("request {} cannot go from {:?} to {:?}", r, current, next)
    }
    trace!(r, from=?*current, to=?next, t=self.now, "status change");
    *current = next;
    Ok(())
  }

  fn requests_with(&self, f: impl Fn(RequestStatus) -> bool) -> Vec<Req> {
    let mut reqs: Vec<Req> = self.status.iter().filter(|(_, &s)| f(s)).map(|(&r, _)| r).collect();
    reqs.sort_unstable();
    reqs
  }

  fn executed(&self, b: Time) -> bool {
    b < self.now + EPS
  }

  fn next_event_time(&self) -> Time {
    if !self.config.dynamic {
      return f64::INFINITY;
    }
    self.status.iter()
      .filter(|(_, &s)| s == RequestStatus::Unrevealed)
      .map(|(r, _)| self.data.become_known.get(r).copied().unwrap_or(0.0))
      .fold(f64::INFINITY, f64::min)
  }

  /// Move requests known by now into the pending set.
  fn reveal_due(&mut self) -> Result<Vec<Req>> {
    let due: Vec<Req> = self.requests_with(|s| s == RequestStatus::Unrevealed).into_iter()
      .filter(|r| !self.config.dynamic || self.data.become_known.get(r).copied().unwrap_or(0.0) <= self.now + EPS)
      .collect();
    for &r in &due {
      self.set_status(r, RequestStatus::Pending)?;
    }
    if !due.is_empty() {
      debug!(t=self.now, requests=?due, "requests revealed");
    }
    Ok(due)
  }

  fn time_var(&self, i: Loc) -> Option<VarId> {
    let r = self.data.request_of(i);
    self.maps.rmap.get(&r)
      .map(|rv| if self.data.is_pickup(i) { rv.pickup_time } else { rv.dropoff_time })
  }

  /// Add `coef * B_i` to `expr`, as a constant once `i` has left the model.
  fn add_time(&self, expr: &mut LinExpr, i: Loc, coef: f64) -> Result<()> {
    match self.time_var(i) {
      Some(v) => expr.add_term(v, coef),
      None => match self.fixed.times.get(&i) {
        Some(&b) => expr.add_constant(coef * b),
        None => bail!("node {} has neither a variable nor a fixed service time", i),
      },
    }
    Ok(())
  }

  fn arc_filter(&self) -> ArcFilter<'_> {
    ArcFilter { data: &*self.data, now: self.now, fixed: &self.fixed }
  }

  /// Build the first MILP over the requests known at the start.
  #[instrument(level="info", skip_all)]
  fn first_milp(&mut self) -> Result<()> {
    let t0 = Instant::now();
    if self.config.consider_excess_ride_time {
      let ub = self.config.excess_ride_time_bound.unwrap_or(f64::INFINITY);
      self.d_max = Some(self.model.add_continuous("d_max", 0.0, ub, -self.config.excess_ride_time_weight));
    }

    let revealed = self.reveal_due()?;
    let mut update = MapUpdate::default();
    self.create_new_variables(&revealed, &mut update)?;
    let arc_vars: Map<Arc, VarId> = update.new_arcs.iter().cloned().collect();
    self.maps = Maps::create_maps(&self.graph, update.new_requests, &arc_vars)?;
    self.update_milp()?;

    self.num_milps = 1;
    self.time_model += t0.elapsed();
    info!(requests=revealed.len(), vertices=self.graph.num_vertices(), arcs=self.graph.num_arcs(),
      vars=self.model.num_vars(), constrs=self.model.num_constrs(), "first MILP built");
    Ok(())
  }

  fn solve_milp(&mut self) -> Result<()> {
    let milp = self.num_milps;
    let span = info_span!("solve", milp, t=self.now);
    let _g = span.enter();

    let sol = self.model.solve(&self.solver, self.config.time_limit)
      .map_err(|e| DarpError::SolverFailure { milp, reason: format!("{:#}", e) })?;
    self.time_solve += sol.solve_time;
    match sol.status {
      SolveStatus::Infeasible => {
        error!(milp, "MILP infeasible");
        return Err(DarpError::SolverFailure { milp, reason: "infeasible".to_string() }.into());
      }
      SolveStatus::TimeLimit if !sol.has_values() => {
        error!(milp, "time limit reached without a solution");
        return Err(DarpError::SolverFailure { milp, reason: "time limit reached without a solution".to_string() }.into());
      }
      SolveStatus::TimeLimit => warn!(milp, "time limit reached, using the best solution found"),
      SolveStatus::Optimal => {}
    }
    info!(milp, objective=?sol.objective, solve_time=?sol.solve_time, "MILP solved");
    self.solution = Some(sol);
    Ok(())
  }

  /// Read used arcs, service times and acceptance off the solution and apply the schedule.
  #[instrument(level="debug", skip_all, fields(milp=self.num_milps))]
  fn query_solution(&mut self) -> Result<()> {
    let sol = self.solution.take().ok_or_else(|| anyhow!("no solution to query"))?;

    let mut used = Vec::new();
    for (a, &x) in self.maps.amap.iter() {
      if sol.binary(x)? {
        used.push(a.clone());
      }
    }

    let mut times = self.fixed.times.clone();
    let mut accepted = Set::default();
    let mut newly_accepted = Vec::new();
    for (&r, rv) in self.maps.rmap.iter() {
      for (i, var) in [(r, rv.pickup_time), (self.data.dmap(r), rv.dropoff_time)] {
        if !self.fixed.times.contains_key(&i) {
          times.insert(i, sol.value(var)?);
        }
      }
      let is_accepted = match rv.accept {
        Some(p) => sol.binary(p)?,
        None => true,
      };
      if is_accepted {
        accepted.insert(r);
        if rv.accept.is_some() && !self.serve_accepted.contains_key(&r) {
          newly_accepted.push((r, rv.accept));
        }
      }
    }

    for (r, p) in newly_accepted {
      if let Some(p) = p {
        let c = self.model.fix(p, 1.0)?;
        self.serve_accepted.insert(r, c);
      }
      let b = times.get(&r).copied().ok_or_else(|| anyhow!("no pickup time for request {}", r))?;
      self.communicated_pickup.entry(r).or_insert(b);
      trace!(r, pickup=b, "request accepted");
    }

    let routes = schedule::routes(&used)?;
    schedule::apply(self.data, &routes, &times)?;
    debug!(used=used.len(), accepted=accepted.len(), routes=routes.len(), "solution applied");

    used.sort_by(|a, b| {
      let t = |a: &Arc| times.get(&a.1.node(self.data.n)).copied().unwrap_or(f64::INFINITY);
      t(a).total_cmp(&t(b)).then_with(|| a.cmp(b))
    });
    self.incumbent = Some(Incumbent { used, times, accepted, objective: sol.objective });
    Ok(())
  }

  /// Advance time to the next event and rebuild the model.  Returns `false` once every
  /// request is settled.
  fn advance(&mut self) -> Result<bool> {
    self.now = self.next_event_time();
    let span = info_span!("advance", t=self.now);
    let _g = span.enter();

    let changes = self.update_request_sets()?;
    self.fixed_arc_history.push(self.fixed.arcs.len());
    let revealed = self.reveal_due()?;

    if !self.status.values().any(|&s| s.is_active() || s == RequestStatus::Unrevealed) {
      info!(milps=self.num_milps, denied=self.denied, "rolling horizon finished");
      return Ok(false);
    }

    let t0 = Instant::now();
    self.clear_volatile()?;
    let mut update = MapUpdate::default();
    self.erase_dropped_off(&changes.dropped_off, &mut update)?;
    self.erase_denied(&changes.denied, &mut update)?;
    self.erase_picked_up(&changes.picked_up, &mut update)?;
    self.create_new_variables(&revealed, &mut update)?;

    let released = self.maps.update_maps(update);
    for x in released.vars() {
      self.model.remove_variable(x)?;
    }
    self.update_milp()?;
    self.num_milps += 1;
    self.time_model += t0.elapsed();
    info!(milp=self.num_milps, revealed=revealed.len(), vertices=self.graph.num_vertices(),
      arcs=self.graph.num_arcs(), fixed=self.fixed.arcs.len(), "MILP updated");
    Ok(true)
  }

  /// Classify requests against the current time and fix what has been executed.
  #[instrument(level="debug", skip_all, fields(t=self.now))]
  fn update_request_sets(&mut self) -> Result<StatusChanges> {
    let inc = self.incumbent.take().ok_or_else(|| anyhow!("no solution to advance from"))?;
    let mut changes = StatusChanges::default();
    let time_of = |i: Loc| inc.times.get(&i).copied().ok_or_else(|| anyhow!("no service time for node {}", i));

    for r in self.requests_with(RequestStatus::is_active) {
      let d = self.data.dmap(r);
      let current = self.status[&r];
      match current {
        RequestStatus::Pending => {
          if inc.accepted.contains(&r) {
            if self.executed(time_of(r)?) {
              self.set_status(r, RequestStatus::PickedUp)?;
              changes.picked_up.push(r);
              if self.executed(time_of(d)?) {
                self.set_status(r, RequestStatus::DroppedOff)?;
                changes.dropped_off.push(r);
              }
            }
          } else if self.now >= self.data.pickup_deadline(r) - EPS {
            self.set_status(r, RequestStatus::Denied)?;
            self.denied += 1;
            changes.denied.push(r);
          }
        }
        RequestStatus::PickedUp => {
          if self.executed(time_of(d)?) {
            self.set_status(r, RequestStatus::DroppedOff)?;
            changes.dropped_off.push(r);
          }
        }
        _ => {}
      }
    }

    for a in &inc.used {
      if a.1.is_depot() || self.fixed.arc_set.contains(a) {
        continue;
      }
      let j = a.1.node(self.data.n);
      let b = time_of(j)?;
      if self.executed(b) {
        self.fix_arc(a)?;
        if !a.0.is_depot() {
          let i = a.0.node(self.data.n);
          self.fix_time(i, time_of(i)?)?;
        }
        self.fix_time(j, b)?;
      }
    }

    debug!(picked_up=?changes.picked_up, dropped_off=?changes.dropped_off, denied=?changes.denied,
      fixed=self.fixed.arcs.len(), "request sets updated");
    self.incumbent = Some(inc);
    Ok(changes)
  }

  fn fix_arc(&mut self, a: &Arc) -> Result<()> {
    let x = *self.maps.amap.get(a).ok_or_else(|| anyhow!("used arc {:?} has no variable", a))?;
    let c = self.model.fix(x, 1.0)?;
    trace!(arc=?a, "arc fixed");
    self.fixed.arc_constrs.insert(a.clone(), c);
    self.fixed.arc_set.insert(a.clone());
    self.fixed.arcs.push(a.clone());
    if !a.0.is_depot() {
      self.fixed.tails.insert(a.0.clone());
    }
    self.fixed.heads.insert(a.1.clone());
    Ok(())
  }

  fn fix_time(&mut self, i: Loc, b: Time) -> Result<()> {
    if self.fixed.times.contains_key(&i) {
      return Ok(());
    }
    self.fixed.times.insert(i, b);
    if let Some(v) = self.time_var(i) {
      let c = self.model.fix(v, b)?;
      self.fixed.time_constrs.insert(i, c);
    }
    Ok(())
  }

  fn clear_volatile(&mut self) -> Result<()> {
    for c in self.volatile.drain(..) {
      self.model.remove_constraint(c)?;
    }
    Ok(())
  }

  /// Remove a settled request: its variables, the constraints pinning them, and every
  /// vertex referring to it which is not part of a committed route.
  fn erase_request(&mut self, r: Req, update: &mut MapUpdate) -> Result<()> {
    for i in [r, self.data.dmap(r)] {
      if let Some(c) = self.fixed.time_constrs.remove(&i) {
        self.model.remove_constraint(c)?;
      }
    }
    if let Some(c) = self.serve_accepted.remove(&r) {
      self.model.remove_constraint(c)?;
    }
    let fixed = &self.fixed;
    let removed = self.graph.remove_vertices(|v| v.involves(r) && !fixed.is_fixed_vertex(v));
    update.removed_vertices.extend(removed.vertices);
    update.removed_arcs.extend(removed.arcs);
    update.removed_requests.push(r);
    Ok(())
  }

  fn erase_dropped_off(&mut self, reqs: &[Req], update: &mut MapUpdate) -> Result<()> {
    for &r in reqs {
      self.erase_request(r, update)?;
    }
    Ok(())
  }

  fn erase_denied(&mut self, reqs: &[Req], update: &mut MapUpdate) -> Result<()> {
    for &r in reqs {
      self.erase_request(r, update)?;
    }
    Ok(())
  }

  /// A picked-up request keeps its service time variables; its acceptance is settled and
  /// its other pickup vertices can go.
  fn erase_picked_up(&mut self, reqs: &[Req], update: &mut MapUpdate) -> Result<()> {
    for &r in reqs {
      if self.status[&r] != RequestStatus::PickedUp {
        continue;
      }
      if let Some(c) = self.serve_accepted.remove(&r) {
        self.model.remove_constraint(c)?;
      }
      if let Some(rv) = self.maps.rmap.get_mut(&r) {
        if let Some(p) = rv.accept.take() {
          self.model.remove_variable(p)?;
        }
      }
      let fixed = &self.fixed;
      let removed = self.graph.remove_vertices(|v| v.event == Event::Pickup(r) && !fixed.is_fixed_vertex(v));
      update.removed_vertices.extend(removed.vertices);
      update.removed_arcs.extend(removed.arcs);
    }
    Ok(())
  }

  /// Add revealed requests to the graph and the model, then drop what can no longer be
  /// part of a solution.
  fn create_new_variables(&mut self, revealed: &[Req], update: &mut MapUpdate) -> Result<()> {
    let new: Set<Req> = revealed.iter().copied().collect();

    if self.config.heuristic && !new.is_empty() {
      if let Some(inc) = &self.incumbent {
        let used: Set<&Vertex> = inc.used.iter().flat_map(|(u, v)| [u, v]).collect();
        let fixed = &self.fixed;
        let removed = self.graph.remove_vertices(|v| {
          v.num_requests() >= 2
            && !fixed.is_fixed_vertex(v)
            && !used.contains(v)
            && v.requests().all(|r| !new.contains(&r))
        });
        trace!(vertices=removed.vertices.len(), "unused pooling vertices dropped");
        update.removed_vertices.extend(removed.vertices);
        update.removed_arcs.extend(removed.arcs);
      }
    }

    let active = self.requests_with(RequestStatus::is_active);
    let can_pickup: Set<Req> = self.requests_with(|s| s == RequestStatus::Pending).into_iter().collect();

    let added = if new.is_empty() {
      Default::default()
    } else {
      let filter = ArcFilter { data: &*self.data, now: self.now, fixed: &self.fixed };
      self.graph.extend(&*self.data, &active, &new, &can_pickup, |a| filter.allows(a))
    };
    {
      let filter = ArcFilter { data: &*self.data, now: self.now, fixed: &self.fixed };
      let removed = self.graph.remove_arcs(|a| !filter.allows(a));
      update.removed_arcs.extend(removed);
      let fixed = &self.fixed;
      let pruned = self.graph.prune(|v| fixed.is_fixed_vertex(v));
      update.removed_vertices.extend(pruned.vertices);
      update.removed_arcs.extend(pruned.arcs);
    }

    for &r in revealed {
      let vars = self.request_vars(r);
      update.new_requests.push((r, vars));
    }
    update.new_vertices.extend(added.vertices.into_iter().filter(|v| self.graph.contains_vertex(v)));
    for a in added.arcs {
      if self.graph.contains_arc(&a) {
        let name = format!("x_{:?}_{:?}", a.0, a.1);
        let x = self.model.add_binary(name, 0.0);
        update.new_arcs.push((a, x));
      }
    }
    Ok(())
  }

  fn request_vars(&mut self, r: Req) -> RequestVars {
    let d = self.data.dmap(r);
    let (p_node, d_node) = (self.data.node(r), self.data.node(d));
    let pickup_time = self.model.add_continuous(format!("B_{}", r), p_node.start_tw, p_node.end_tw, 0.0);
    let dropoff_time = self.model.add_continuous(format!("B_{}", d), d_node.start_tw, d_node.end_tw, 0.0);
    let lb = if self.config.accept_all { 1.0 } else { 0.0 };
    let accept = Some(self.model.add_variable(format!("p_{}", r), VarKind::Binary, lb, 1.0, 0.0));
    let excess = if self.config.consider_excess_ride_time {
      Some(self.model.add_continuous(format!("d_{}", r), 0.0, f64::INFINITY, 0.0))
    } else {
      None
    };
    RequestVars { accept, pickup_time, dropoff_time, excess }
  }

  /// Refresh bounds and objective and rebuild every constraint which depends on the
  /// current sets.
  #[instrument(level="debug", skip_all, fields(t=self.now))]
  fn update_milp(&mut self) -> Result<()> {
    let active = self.requests_with(RequestStatus::is_active);
    self.maps.check_consistency(&self.graph, active.iter().copied())?;
    let [w_accept, w_distance] = self.config.weights;

    // bounds and objective
    let mut bounds = Vec::new();
    let mut objective = Vec::new();
    for (&r, rv) in self.maps.rmap.iter() {
      for (i, var) in [(r, rv.pickup_time), (self.data.dmap(r), rv.dropoff_time)] {
        let node = self.data.node(i);
        let (lb, ub) = match self.fixed.times.get(&i) {
          Some(&b) => (f64::min(node.start_tw, b), f64::max(node.end_tw, b)),
          None => (f64::max(node.start_tw, self.now), node.end_tw),
        };
        bounds.push((var, lb, ub));
      }
      if let Some(p) = rv.accept {
        objective.push((p, w_accept + w_distance * self.data.d_direct.get(&r).copied().unwrap_or(0.0)));
      }
    }
    for (a, &x) in self.maps.amap.iter() {
      let (i, j) = (a.0.node(self.data.n), a.1.node(self.data.n));
      objective.push((x, -w_distance * self.data.distance(i, j)));
    }
    for (var, lb, ub) in bounds {
      self.model.set_bounds(var, lb, ub)?;
    }
    for (var, c) in objective {
      self.model.set_obj(var, c)?;
    }

    let constraints = self.volatile_constraints(&active)?;
    for (name, expr, sense, rhs) in constraints {
      let c = self.model.add_constraint(name, expr, sense, rhs)?;
      self.volatile.push(c);
    }
    debug!(vars=self.model.num_vars(), constrs=self.model.num_constrs(), volatile=self.volatile.len());
    Ok(())
  }

  fn volatile_constraints(&self, active: &[Req]) -> Result<Vec<(String, LinExpr, Sense, f64)>> {
    let data = &*self.data;
    let filter = self.arc_filter();
    let mut cons = Vec::new();

    // flow conservation
    let (inc, out) = self.graph.adjacency();
    for (v, _) in self.maps.vmap.iter() {
      if v.is_depot() {
        continue;
      }
      let mut expr = LinExpr::new();
      for a in inc.get(v).into_iter().flatten() {
        expr.add_term(self.maps.amap.get(*a).copied().ok_or_else(|| anyhow!("arc {:?} has no variable", a))?, 1.0);
      }
      for a in out.get(v).into_iter().flatten() {
        expr.add_term(self.maps.amap.get(*a).copied().ok_or_else(|| anyhow!("arc {:?} has no variable", a))?, -1.0);
      }
      cons.push((format!("flow_{:?}", v), expr, Sense::Eq, 0.0));
    }

    // service: arcs into pickup vertices of a pending request carry its acceptance
    let mut into_pickup: Map<Req, Vec<VarId>> = Map::default();
    let mut from_depot = LinExpr::new();
    for (a, &x) in self.maps.amap.iter() {
      if let Event::Pickup(r) = a.1.event {
        into_pickup.entry(r).or_default().push(x);
      }
      if a.0.is_depot() {
        from_depot.add_term(x, 1.0);
      }
    }
    for (&r, rv) in self.maps.rmap.iter() {
      if let Some(p) = rv.accept {
        let mut expr = LinExpr::new().term(p, -1.0);
        for &x in into_pickup.get(&r).into_iter().flatten() {
          expr.add_term(x, 1.0);
        }
        cons.push((format!("serve_{}", r), expr, Sense::Eq, 0.0));
      }
    }
    cons.push(("vehicles".to_string(), from_depot, Sense::Le, data.num_vehicles as f64));

    // service start along arcs
    for (a, &x) in self.maps.amap.iter() {
      if a.0.is_depot() || a.1.is_depot() || self.fixed.arc_set.contains(a) {
        continue;
      }
      let (i, j) = (a.0.node(data.n), a.1.node(data.n));
      let gap = data.node(i).service_time + data.travel_time(i, j);
      let big_m = f64::max(0.0, filter.bounds(i).1 + gap - filter.bounds(j).0);
      let mut expr = LinExpr::new().term(x, -big_m);
      self.add_time(&mut expr, j, 1.0)?;
      self.add_time(&mut expr, i, -1.0)?;
      cons.push((format!("time_{:?}_{:?}", a.0, a.1), expr, Sense::Ge, gap - big_m));
    }

    // ride time
    for &r in active {
      let d = data.dmap(r);
      let node = data.node(r);
      let mut expr = LinExpr::new();
      self.add_time(&mut expr, d, 1.0)?;
      self.add_time(&mut expr, r, -1.0)?;
      cons.push((format!("ride_{}", r), expr, Sense::Le, node.max_ride_time + node.service_time));
    }

    // excess ride time
    if let Some(d_max) = self.d_max {
      for (&r, rv) in self.maps.rmap.iter() {
        let e = match rv.excess {
          Some(e) => e,
          None => continue,
        };
        let d = data.dmap(r);
        let tt = data.direct_travel_time(r);
        let s = data.node(r).service_time;
        let mut expr = LinExpr::new().term(e, 1.0);
        self.add_time(&mut expr, d, -1.0)?;
        self.add_time(&mut expr, r, 1.0)?;
        let rhs = match rv.accept {
          Some(p) => {
            let big_m = f64::max(0.0, data.node(r).max_ride_time - tt);
            expr.add_term(p, -big_m);
            -s - tt - big_m
          }
          None => -s - tt,
        };
        cons.push((format!("excess_{}", r), expr, Sense::Ge, rhs));
        cons.push((format!("excess_max_{}", r), LinExpr::new().term(d_max, 1.0).term(e, -1.0), Sense::Ge, 0.0));
      }
    }

    // promised pickup
    if let Some(delay) = self.config.max_pickup_delay {
      for &r in active {
        if self.status.get(&r) != Some(&RequestStatus::Pending) || self.fixed.times.contains_key(&r) {
          continue;
        }
        if let Some(&promised) = self.communicated_pickup.get(&r) {
          let mut expr = LinExpr::new();
          self.add_time(&mut expr, r, 1.0)?;
          cons.push((format!("pickup_delay_{}", r), expr, Sense::Le, promised + delay));
        }
      }
    }
    Ok(cons)
  }

  fn outcome(&self) -> Result<RhOutcome> {
    let routes = match &self.incumbent {
      Some(inc) => schedule::routes(&inc.used)?
        .into_iter()
        .enumerate()
        .map(|(vehicle, vs)| Route { vehicle, nodes: vs.iter().map(|v| v.node(self.data.n)).collect() })
        .collect(),
      None => Vec::new(),
    };
    let accepted = self.status.values().filter(|&&s| s == RequestStatus::DroppedOff).count();
    Ok(RhOutcome {
      instance: self.data.id.clone(),
      routes,
      status: self.status.clone(),
      accepted,
      denied: self.denied,
      num_milps: self.num_milps,
      time_model: self.time_model,
      time_solve: self.time_solve,
      fixed_arc_history: self.fixed_arc_history.clone(),
      communicated_pickup: self.communicated_pickup.clone(),
      objective: self.incumbent.as_ref().and_then(|inc| inc.objective),
    })
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use instances::raw::FromRaw;
  use crate::init_test_logging;
  use crate::rh::{prepare, DynamicConfig, GoodLpSolver};

  const TWO: &str = "2 2 4 100 3 1.5 20\n1 1 3 2 1 0 x\n2 2 4 2 1 10 x\n";
  /// One vehicle, two requests far apart which both want to leave right away.
  const CONFLICT: &str = "1 2 11 100 3 1.5 1\n1 1 2 0 1 0 x\n2 10 11 0 1 0 x\n";

  fn instance(s: &str, dynamic: Option<&DynamicConfig>) -> DarpInstance {
    let mut data = DarpInstance::from_raw(s.parse().unwrap(), "rh".into()).unwrap();
    data.unit_distances();
    prepare(&mut data, dynamic).unwrap();
    data
  }

  fn dynamic_two() -> DarpInstance {
    instance(TWO, Some(&DynamicConfig { share_static_requests: 0.0, notice: 20.0 }))
  }

  fn dynamic_config() -> RhConfig {
    RhConfig { dynamic: true, ..RhConfig::default() }
  }

  fn check_routes(data: &DarpInstance, outcome: &RhOutcome) {
    let mut seen = Vec::new();
    for route in &outcome.routes {
      assert_eq!(route.nodes.first(), Some(&0));
      assert_eq!(route.nodes.last(), Some(&0));
      seen.extend(route.nodes.iter().copied().filter(|&i| i != 0));
    }
    seen.sort_unstable();
    let mut expected: Vec<Loc> = outcome.served().flat_map(|r| [r, data.dmap(r)]).collect();
    expected.sort_unstable();
    assert_eq!(seen, expected);

    for &i in &seen {
      let node = data.node(i);
      let b = node.schedule.beginning_service.unwrap();
      assert!(node.start_tw - 1e-5 <= b && b <= node.end_tw + 1e-5, "node {} served at {}", i, b);
      if data.is_delivery(i) {
        let p = data.node(data.pmap(i));
        assert!(node.schedule.ride_time.unwrap() <= p.max_ride_time + 1e-5);
      }
    }
  }

  #[test]
  fn static_instance_single_milp() {
    let _g = init_test_logging(None::<&str>);
    let mut data = instance(TWO, None);
    let outcome = RollingHorizon::new(&mut data, RhConfig::default(), GoodLpSolver).run().unwrap();
    assert_eq!(outcome.num_milps, 1);
    assert_eq!(outcome.accepted, 2);
    assert_eq!(outcome.denied, 0);
    assert!(outcome.status.values().all(|&s| s == RequestStatus::DroppedOff));
    // every routed node has exactly one fixed in-arc at the end
    assert_eq!(outcome.fixed_arc_history, vec![4]);
    check_routes(&data, &outcome);

    for r in data.requests() {
      let promised = outcome.communicated_pickup[&r];
      let served = data.node(r).schedule.beginning_service.unwrap();
      assert!((promised - served).abs() < 1e-5);
    }
  }

  #[test]
  fn state_machine() {
    let mut data = instance(TWO, None);
    let mut rh = RollingHorizon::new(&mut data, RhConfig::default(), GoodLpSolver);
    assert_eq!(rh.state(), RhState::Initializing);
    assert_eq!(rh.step().unwrap(), RhState::Solving);
    assert_eq!(rh.status(1), Some(RequestStatus::Pending));
    assert_eq!(rh.maps().rmap.len(), 2);
    assert_eq!(rh.maps().amap.len(), rh.graph().num_arcs());
    assert!(rh.model().check().is_ok());
    assert_eq!(rh.step().unwrap(), RhState::ApplyingResult);
    assert_eq!(rh.step().unwrap(), RhState::Advancing);
    assert_eq!(rh.step().unwrap(), RhState::Terminated);
    assert_eq!(rh.now(), f64::INFINITY);
    assert_eq!(rh.step().unwrap(), RhState::Terminated);
  }

  #[test]
  fn no_requests() {
    let mut data = instance("2 0 4 100 3 1.5 20\n", None);
    let outcome = RollingHorizon::new(&mut data, RhConfig::default(), GoodLpSolver).run().unwrap();
    assert_eq!(outcome.num_milps, 0);
    assert!(outcome.routes.is_empty());
  }

  #[test]
  fn dynamic_reveal() {
    let _g = init_test_logging(None::<&str>);
    let mut data = dynamic_two();
    assert_eq!(data.known_at_start, vec![1]);
    assert!((data.become_known[&2] - 9.0).abs() < 1e-9);

    let mut rh = RollingHorizon::new(&mut data, dynamic_config(), GoodLpSolver);
    rh.step().unwrap();
    assert_eq!(rh.status(2), Some(RequestStatus::Unrevealed));
    let outcome = rh.run().unwrap();
    assert_eq!(outcome.num_milps, 2);
    assert_eq!(outcome.accepted, 2);
    assert_eq!(outcome.fixed_arc_history.len(), 2);
    assert!(outcome.fixed_arc_history.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(outcome.status.len(), 2);
    check_routes(&data, &outcome);
  }

  #[test]
  fn heuristic_mode() {
    let mut data = dynamic_two();
    let config = RhConfig { heuristic: true, ..dynamic_config() };
    let outcome = RollingHorizon::new(&mut data, config, GoodLpSolver).run().unwrap();
    assert_eq!(outcome.num_milps, 2);
    assert_eq!(outcome.accepted, 2);
    check_routes(&data, &outcome);
  }

  #[test]
  fn pickup_delay_is_bounded() {
    let mut data = dynamic_two();
    let config = RhConfig { max_pickup_delay: Some(0.0), ..dynamic_config() };
    let outcome = RollingHorizon::new(&mut data, config, GoodLpSolver).run().unwrap();
    assert_eq!(outcome.accepted, 2);
    for (&r, &promised) in &outcome.communicated_pickup {
      assert!(data.node(r).schedule.beginning_service.unwrap() <= promised + 1e-5);
    }
  }

  #[test]
  fn excess_ride_time() {
    let mut data = instance(TWO, None);
    let config = RhConfig { consider_excess_ride_time: true, ..RhConfig::default() };
    let outcome = RollingHorizon::new(&mut data, config, GoodLpSolver).run().unwrap();
    assert_eq!(outcome.accepted, 2);
    let summary = outcome.summary(&data);
    assert!(summary.avg_excess_ride_time.unwrap() >= -1e-5);
    check_routes(&data, &outcome);
  }

  #[test]
  fn conflicting_requests_one_denied() {
    let mut data = instance(CONFLICT, None);
    let outcome = RollingHorizon::new(&mut data, RhConfig::default(), GoodLpSolver).run().unwrap();
    assert_eq!(outcome.accepted, 1);
    assert_eq!(outcome.denied, 1);
    assert_eq!(outcome.routes.len(), 1);
    assert_eq!(outcome.status.values().filter(|&&s| s == RequestStatus::Denied).count(), 1);
    check_routes(&data, &outcome);
  }

  #[test]
  fn accept_all_fails_when_infeasible() {
    let mut data = instance(CONFLICT, None);
    let config = RhConfig { accept_all: true, ..RhConfig::default() };
    let err = RollingHorizon::new(&mut data, config, GoodLpSolver).run().unwrap_err();
    match err.downcast_ref::<DarpError>() {
      Some(DarpError::SolverFailure { milp, .. }) => assert_eq!(*milp, 1),
      other => panic!("unexpected error: {:?}", other),
    }
  }

  /// Reports every solve as stopped by the time limit, keeping the values found.
  struct StoppedEarly;

  impl MilpSolver for StoppedEarly {
    fn solve(&self, model: &Model, time_limit: Duration) -> Result<Solution> {
      let mut sol = GoodLpSolver.solve(model, time_limit)?;
      sol.status = SolveStatus::TimeLimit;
      Ok(sol)
    }
  }

  /// Runs out of time before finding anything.
  struct NothingFound;

  impl MilpSolver for NothingFound {
    fn solve(&self, _: &Model, time_limit: Duration) -> Result<Solution> {
      Ok(Solution { status: SolveStatus::TimeLimit, objective: None, values: Map::default(), solve_time: time_limit })
    }
  }

  #[test]
  fn time_limit_keeps_best_solution() {
    let _g = init_test_logging(None::<&str>);
    let mut data = dynamic_two();
    let outcome = RollingHorizon::new(&mut data, dynamic_config(), StoppedEarly).run().unwrap();
    assert_eq!(outcome.num_milps, 2);
    assert_eq!(outcome.accepted, 2);
    assert!(outcome.status.values().all(|&s| s == RequestStatus::DroppedOff));
    assert!(outcome.fixed_arc_history.windows(2).all(|w| w[0] <= w[1]));
    check_routes(&data, &outcome);
  }

  #[test]
  fn time_limit_without_solution_fails() {
    let mut data = instance(TWO, None);
    let err = RollingHorizon::new(&mut data, RhConfig::default(), NothingFound).run().unwrap_err();
    match err.downcast_ref::<DarpError>() {
      Some(DarpError::SolverFailure { milp, reason }) => {
        assert_eq!(*milp, 1);
        assert!(reason.contains("time limit"));
      }
      other => panic!("unexpected error: {:?}", other),
    }
  }

  #[test]
  fn summary_of_static_run() {
    let mut data = instance(TWO, None);
    let outcome = RollingHorizon::new(&mut data, RhConfig::default(), GoodLpSolver).run().unwrap();
    let summary = outcome.summary(&data);
    assert_eq!(summary.accepted, 2);
    assert!((summary.total_distance - outcome.total_distance(&data)).abs() < 1e-9);
    assert!(summary.total_distance >= 3.0 - 1e-9);
    assert!(summary.avg_ride_time.unwrap() <= 3.0 + 1e-5);
    assert!(summary.avg_waiting_time.unwrap() >= -1e-5);

    let succ = outcome.successors();
    let pred = outcome.predecessors();
    for (&i, &j) in &succ {
      if j != 0 {
        assert_eq!(pred[&j], i);
      }
    }
    assert_eq!(succ.len(), 4);
  }
}
