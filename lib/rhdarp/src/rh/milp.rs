//! The MILP as the rolling horizon sees it: a set of variables and linear constraints
//! which can be edited between solves.  Solver backends implement [`MilpSolver`] and
//! receive the model read-only.
use std::collections::BTreeMap;
use std::time::Duration;
use anyhow::{anyhow, bail, Result};
use tracing::*;

use crate::{define_u32_id_type, Map, UidGen, EPS};

define_u32_id_type!(VarId);
define_u32_id_type!(ConstrId);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VarKind {
  Binary,
  Continuous,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sense {
  Le,
  Ge,
  Eq,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ObjSense {
  Maximise,
  Minimise,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDef {
  pub name: String,
  pub kind: VarKind,
  pub lb: f64,
  pub ub: f64,
  pub obj: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinExpr {
  pub terms: Vec<(VarId, f64)>,
  pub constant: f64,
}

impl LinExpr {
  pub fn new() -> Self { Self::default() }

  pub fn term(mut self, var: VarId, coef: f64) -> Self {
    self.terms.push((var, coef));
    self
  }

  pub fn constant(mut self, c: f64) -> Self {
    self.constant += c;
    self
  }

  pub fn add_term(&mut self, var: VarId, coef: f64) {
    self.terms.push((var, coef));
  }

  pub fn add_constant(&mut self, c: f64) {
    self.constant += c;
  }

  pub fn eval(&self, values: &Map<VarId, f64>) -> f64 {
    self.terms.iter().map(|(v, c)| c * values.get(v).copied().unwrap_or(0.0)).sum::<f64>() + self.constant
  }

  /// Merge repeated variables and drop zero coefficients.
  fn normalise(self) -> LinExpr {
    let mut merged: BTreeMap<VarId, f64> = BTreeMap::new();
    for (v, c) in self.terms {
      *merged.entry(v).or_insert(0.0) += c;
    }
    LinExpr {
      terms: merged.into_iter().filter(|&(_, c)| c != 0.0).collect(),
      constant: self.constant,
    }
  }
}

/// `expr (sense) rhs`, stored with the constant of `expr` moved to the right-hand side.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
  pub name: String,
  pub expr: LinExpr,
  pub sense: Sense,
  pub rhs: f64,
}

impl Constraint {
  pub fn is_satisfied(&self, values: &Map<VarId, f64>, tol: f64) -> bool {
    let lhs = self.expr.eval(values);
    match self.sense {
      Sense::Le => lhs <= self.rhs + tol,
      Sense::Ge => lhs >= self.rhs - tol,
      Sense::Eq => (lhs - self.rhs).abs() <= tol,
    }
  }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SolveStatus {
  Optimal,
  /// Stopped at the time limit.  Values are present only if a solution had been found.
  TimeLimit,
  Infeasible,
}

#[derive(Debug, Clone)]
pub struct Solution {
  pub status: SolveStatus,
  pub objective: Option<f64>,
  pub values: Map<VarId, f64>,
  pub solve_time: Duration,
}

impl Solution {
  pub fn has_values(&self) -> bool {
    match self.status {
      SolveStatus::Optimal => true,
      SolveStatus::TimeLimit => self.objective.is_some(),
      SolveStatus::Infeasible => false,
    }
  }

  pub fn value(&self, var: VarId) -> Result<f64> {
    self.values.get(&var).copied().ok_or_else(|| anyhow!("no value for variable {:?}", var))
  }

  pub fn binary(&self, var: VarId) -> Result<bool> {
    Ok(snap(self.value(var)?))
  }
}

/// Read a binary variable's value.
pub fn snap(value: f64) -> bool {
  if (value - 1.0).abs() < EPS {
    true
  } else if value.abs() < EPS {
    false
  } else {
    warn!(value, "fractional value for a binary variable");
    value >= 0.5
  }
}

pub trait MilpSolver {
  fn solve(&self, model: &Model, time_limit: Duration) -> Result<Solution>;
}

#[derive(Debug, Clone)]
pub struct Model {
  pub sense: ObjSense,
  vars: BTreeMap<VarId, VarDef>,
  constrs: BTreeMap<ConstrId, Constraint>,
  /// Number of constraints referencing each variable.
  refs: Map<VarId, usize>,
  var_ids: UidGen<VarId>,
  constr_ids: UidGen<ConstrId>,
}

impl Model {
  pub fn new(sense: ObjSense) -> Model {
    Model {
      sense,
      vars: BTreeMap::new(),
      constrs: BTreeMap::new(),
      refs: Map::default(),
      var_ids: UidGen::default(),
      constr_ids: UidGen::default(),
    }
  }

  pub fn add_variable(&mut self, name: impl Into<String>, kind: VarKind, lb: f64, ub: f64, obj: f64) -> VarId {
    let id = self.var_ids.next_id();
    self.vars.insert(id, VarDef { name: name.into(), kind, lb, ub, obj });
    self.refs.insert(id, 0);
    id
  }

  pub fn add_binary(&mut self, name: impl Into<String>, obj: f64) -> VarId {
    self.add_variable(name, VarKind::Binary, 0.0, 1.0, obj)
  }

  pub fn add_continuous(&mut self, name: impl Into<String>, lb: f64, ub: f64, obj: f64) -> VarId {
    self.add_variable(name, VarKind::Continuous, lb, ub, obj)
  }

  pub fn add_constraint(&mut self, name: impl Into<String>, expr: LinExpr, sense: Sense, rhs: f64) -> Result<ConstrId> {
    let name = name.into();
    let expr = expr.normalise();
    if let Some((v, _)) = expr.terms.iter().find(|(v, _)| !self.vars.contains_key(v)) {
      bail!("constraint {} references unknown variable {:?}", name, v)
    }
    for (v, _) in &expr.terms {
      *self.refs.entry(*v).or_insert(0) += 1;
    }
    let rhs = rhs - expr.constant;
    let expr = LinExpr { terms: expr.terms, constant: 0.0 };
    let id = self.constr_ids.next_id();
    self.constrs.insert(id, Constraint { name, expr, sense, rhs });
    Ok(id)
  }

  /// Pin `var` to `value` with an equality constraint.
  pub fn fix(&mut self, var: VarId, value: f64) -> Result<ConstrId> {
    let name = match self.vars.get(&var) {
      Some(def) => format!("fix_{}", def.name),
      None => bail!("cannot fix unknown variable {:?}", var),
    };
    self.add_constraint(name, LinExpr::new().term(var, 1.0), Sense::Eq, value)
  }

  pub fn remove_constraint(&mut self, id: ConstrId) -> Result<Constraint> {
    let c = self.constrs.remove(&id).ok_or_else(|| anyhow!("no constraint {:?}", id))?;
    for (v, _) in &c.expr.terms {
      if let Some(k) = self.refs.get_mut(v) {
        *k -= 1;
      }
    }
    Ok(c)
  }

  /// Fails while a constraint still references the variable.
  pub fn remove_variable(&mut self, id: VarId) -> Result<VarDef> {
    match self.refs.get(&id) {
      None => bail!("no variable {:?}", id),
      Some(&k) if k > 0 => {
        let name = self.vars.get(&id).map(|d| d.name.as_str()).unwrap_or("?");
        bail!("variable {} is still referenced by {} constraints", name, k)
      }
      Some(_) => {}
    }
    self.refs.remove(&id);
    self.vars.remove(&id).ok_or_else(|| anyhow!("no variable {:?}", id))
  }

  pub fn set_bounds(&mut self, id: VarId, lb: f64, ub: f64) -> Result<()> {
    let def = self.vars.get_mut(&id).ok_or_else(|| anyhow!("no variable {:?}", id))?;
    def.lb = lb;
    def.ub = ub;
    Ok(())
  }

  pub fn set_obj(&mut self, id: VarId, obj: f64) -> Result<()> {
    let def = self.vars.get_mut(&id).ok_or_else(|| anyhow!("no variable {:?}", id))?;
    def.obj = obj;
    Ok(())
  }

  pub fn var(&self, id: VarId) -> Option<&VarDef> { self.vars.get(&id) }

  pub fn constr(&self, id: ConstrId) -> Option<&Constraint> { self.constrs.get(&id) }

  pub fn contains_var(&self, id: VarId) -> bool { self.vars.contains_key(&id) }

  pub fn variables(&self) -> impl Iterator<Item=(VarId, &VarDef)> {
    self.vars.iter().map(|(&id, def)| (id, def))
  }

  pub fn constraints(&self) -> impl Iterator<Item=(ConstrId, &Constraint)> {
    self.constrs.iter().map(|(&id, c)| (id, c))
  }

  pub fn num_vars(&self) -> usize { self.vars.len() }

  pub fn num_constrs(&self) -> usize { self.constrs.len() }

  pub fn objective_value(&self, values: &Map<VarId, f64>) -> f64 {
    self.vars.iter().map(|(id, def)| def.obj * values.get(id).copied().unwrap_or(0.0)).sum()
  }

  /// Structural checks run before every solve.
  pub fn check(&self) -> Result<()> {
    for (id, def) in &self.vars {
      if def.lb > def.ub + EPS {
        bail!("variable {} ({:?}) has bounds [{}, {}]", def.name, id, def.lb, def.ub)
      }
      if !def.obj.is_finite() || def.lb.is_nan() || def.ub.is_nan() {
        bail!("variable {} ({:?}) has invalid coefficients", def.name, id)
      }
    }
    let mut refs: Map<VarId, usize> = Map::default();
    for c in self.constrs.values() {
      if !c.rhs.is_finite() {
        bail!("constraint {} has right-hand side {}", c.name, c.rhs)
      }
      for (v, coef) in &c.expr.terms {
        if !self.vars.contains_key(v) {
          bail!("constraint {} references removed variable {:?}", c.name, v)
        }
        if !coef.is_finite() {
          bail!("constraint {} has coefficient {} for {:?}", c.name, coef, v)
        }
        *refs.entry(*v).or_insert(0) += 1;
      }
    }
    for (v, &k) in &self.refs {
      if refs.get(v).copied().unwrap_or(0) != k {
        bail!("reference count of {:?} is out of date", v)
      }
    }
    Ok(())
  }

  pub fn solve<S: MilpSolver + ?Sized>(&self, solver: &S, time_limit: Duration) -> Result<Solution> {
    self.check()?;
    solver.solve(self, time_limit)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ids_not_reused() -> Result<()> {
    let mut m = Model::new(ObjSense::Maximise);
    let x = m.add_binary("x", 1.0);
    m.remove_variable(x)?;
    let y = m.add_binary("y", 1.0);
    assert_ne!(x, y);
    assert!(!m.contains_var(x));

    let c = m.add_constraint("c", LinExpr::new().term(y, 1.0), Sense::Le, 1.0)?;
    m.remove_constraint(c)?;
    let d = m.fix(y, 1.0)?;
    assert_ne!(c, d);
    Ok(())
  }

  #[test]
  fn referenced_variable_is_kept() -> Result<()> {
    let mut m = Model::new(ObjSense::Maximise);
    let x = m.add_continuous("x", 0.0, 10.0, 0.0);
    let c = m.fix(x, 3.0)?;
    assert!(m.remove_variable(x).is_err());
    m.remove_constraint(c)?;
    m.remove_variable(x)?;
    m.check()?;
    Ok(())
  }

  #[test]
  fn constant_moves_to_rhs() -> Result<()> {
    let mut m = Model::new(ObjSense::Minimise);
    let x = m.add_continuous("x", 0.0, 10.0, 1.0);
    let c = m.add_constraint("c", LinExpr::new().term(x, 1.0).term(x, 1.0).constant(4.0), Sense::Ge, 10.0)?;
    let c = m.constr(c).unwrap();
    assert_eq!(c.expr.terms, vec![(x, 2.0)]);
    assert_eq!(c.rhs, 6.0);
    let values: Map<VarId, f64> = [(x, 3.0)].into_iter().collect();
    assert!(c.is_satisfied(&values, EPS));
    Ok(())
  }

  #[test]
  fn unknown_variable() {
    let mut m = Model::new(ObjSense::Minimise);
    let x = m.add_continuous("x", 0.0, 1.0, 0.0);
    m.remove_variable(x).unwrap();
    assert!(m.add_constraint("c", LinExpr::new().term(x, 1.0), Sense::Le, 1.0).is_err());
    assert!(m.fix(x, 0.0).is_err());
  }

  #[test]
  fn check_bounds() {
    let mut m = Model::new(ObjSense::Minimise);
    let x = m.add_continuous("x", 0.0, 1.0, 0.0);
    m.set_bounds(x, 2.0, 1.0).unwrap();
    assert!(m.check().is_err());
  }

  #[test]
  fn snapping() {
    assert!(snap(1.0 - 1e-9));
    assert!(!snap(1e-9));
    assert!(!snap(-1e-9));
    assert!(snap(0.7));
  }
}
