use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use anyhow::{anyhow, Result};
use good_lp::{
  constraint, default_solver, variable, Expression, ProblemVariables, ResolutionError, SolverModel,
  Solution as _, Variable,
};
use tracing::*;

use crate::{Map, EPS};
use super::milp::*;

/// Solves through `good_lp` with its default (pure Rust) backend.
///
/// The backend has no time limit of its own, so each solve runs on a worker thread which is
/// abandoned once the limit passes.  No solution is available in that case.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoodLpSolver;

/// Run `job` on its own thread and wait at most `limit` for it.  `None` means the limit
/// passed first; the thread is left to finish in the background.
pub fn run_with_time_limit<T, F>(limit: Duration, job: F) -> Result<Option<T>>
  where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
  let (tx, rx) = mpsc::channel();
  thread::Builder::new()
    .name("milp-worker".into())
    .spawn(move || {
      let _ = tx.send(job());
    })?;
  match rx.recv_timeout(limit) {
    Ok(out) => Ok(Some(out)),
    Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
    Err(mpsc::RecvTimeoutError::Disconnected) => Err(anyhow!("solver thread panicked")),
  }
}

impl MilpSolver for GoodLpSolver {
  #[instrument(level="debug", skip_all, fields(vars=model.num_vars(), constrs=model.num_constrs()))]
  fn solve(&self, model: &Model, time_limit: Duration) -> Result<Solution> {
    let start = Instant::now();
    let model = model.clone();
    match run_with_time_limit(time_limit, move || solve_blocking(&model))? {
      Some(sol) => sol,
      None => {
        warn!(?time_limit, "time limit reached before a solution was found");
        Ok(Solution { status: SolveStatus::TimeLimit, objective: None, values: Map::default(), solve_time: start.elapsed() })
      }
    }
  }
}

fn solve_blocking(model: &Model) -> Result<Solution> {
  let start = Instant::now();
  let mut problem_vars = ProblemVariables::new();
  let mut handles: Map<VarId, Variable> = Map::default();
  let mut objective = Expression::from(0.0);

  for (id, def) in model.variables() {
    let mut v = variable().min(def.lb).max(def.ub);
    if def.kind == VarKind::Binary {
      v = v.integer();
    }
    let h = problem_vars.add(v);
    if def.obj != 0.0 {
      objective += def.obj * h;
    }
    handles.insert(id, h);
  }

  let unsolved = match model.sense {
    ObjSense::Maximise => problem_vars.maximise(objective),
    ObjSense::Minimise => problem_vars.minimise(objective),
  };
  let mut problem = unsolved.using(default_solver);

  for (_, c) in model.constraints() {
    if c.expr.terms.is_empty() {
      if c.is_satisfied(&Map::default(), EPS) {
        continue;
      }
      debug!(name=%c.name, "constant constraint violated");
      return Ok(Solution {
        status: SolveStatus::Infeasible,
        objective: None,
        values: Map::default(),
        solve_time: start.elapsed(),
      });
    }
    let mut lhs = Expression::from(0.0);
    for &(v, coef) in &c.expr.terms {
      let h = handles.get(&v)
        .ok_or_else(|| anyhow!("constraint {} references unknown variable {:?}", c.name, v))?;
      lhs += coef * *h;
    }
    problem = problem.with(match c.sense {
      Sense::Le => constraint::leq(lhs, c.rhs),
      Sense::Ge => constraint::geq(lhs, c.rhs),
      Sense::Eq => constraint::eq(lhs, c.rhs),
    });
  }

  let result = problem.solve();
  let solve_time = start.elapsed();

  match result {
    Ok(sol) => {
      let values: Map<VarId, f64> = handles.iter().map(|(&id, &h)| (id, sol.value(h))).collect();
      let objective = model.objective_value(&values);
      debug!(objective, ?solve_time, "solved");
      Ok(Solution { status: SolveStatus::Optimal, objective: Some(objective), values, solve_time })
    }
    Err(ResolutionError::Infeasible) => {
      debug!(?solve_time, "infeasible");
      Ok(Solution { status: SolveStatus::Infeasible, objective: None, values: Map::default(), solve_time })
    }
    Err(e) => Err(anyhow!("solver error: {}", e)),
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn knapsack() -> Result<()> {
    let mut m = Model::new(ObjSense::Maximise);
    let x = m.add_binary("x", 5.0);
    let y = m.add_binary("y", 4.0);
    let z = m.add_binary("z", 3.0);
    m.add_constraint("cap", LinExpr::new().term(x, 4.0).term(y, 3.0).term(z, 2.0), Sense::Le, 5.0)?;
    let sol = m.solve(&GoodLpSolver, Duration::from_secs(10))?;
    assert_eq!(sol.status, SolveStatus::Optimal);
    assert!(!sol.binary(x)?);
    assert!(sol.binary(y)?);
    assert!(sol.binary(z)?);
    assert!((sol.objective.unwrap() - 7.0).abs() < 1e-6);
    Ok(())
  }

  #[test]
  fn continuous_and_fixed() -> Result<()> {
    let mut m = Model::new(ObjSense::Minimise);
    let a = m.add_continuous("a", 0.0, 100.0, 1.0);
    let b = m.add_continuous("b", 0.0, 100.0, 1.0);
    m.add_constraint("gap", LinExpr::new().term(b, 1.0).term(a, -1.0), Sense::Ge, 7.0)?;
    m.fix(a, 2.0)?;
    let sol = m.solve(&GoodLpSolver, Duration::from_secs(10))?;
    assert!((sol.value(a)? - 2.0).abs() < 1e-6);
    assert!((sol.value(b)? - 9.0).abs() < 1e-6);
    Ok(())
  }

  #[test]
  fn infeasible() -> Result<()> {
    let mut m = Model::new(ObjSense::Minimise);
    let a = m.add_continuous("a", 0.0, 1.0, 1.0);
    m.add_constraint("too_big", LinExpr::new().term(a, 1.0), Sense::Ge, 2.0)?;
    let sol = m.solve(&GoodLpSolver, Duration::from_secs(10))?;
    assert_eq!(sol.status, SolveStatus::Infeasible);
    assert!(!sol.has_values());
    Ok(())
  }

  #[test]
  fn slow_job_hits_time_limit() -> Result<()> {
    let out = run_with_time_limit(Duration::from_millis(10), || {
      thread::sleep(Duration::from_secs(2));
      1
    })?;
    assert_eq!(out, None);
    let out = run_with_time_limit(Duration::from_secs(10), || 1)?;
    assert_eq!(out, Some(1));
    Ok(())
  }

  #[test]
  fn time_limit_without_solution() {
    let sol = Solution { status: SolveStatus::TimeLimit, objective: None, values: Map::default(), solve_time: Duration::ZERO };
    assert!(!sol.has_values());
  }
}
