use std::borrow::Cow;

pub trait FromRaw<T> where Self: Sized {
  fn from_raw(raw: T, id: Cow<str>) -> crate::Result<Self>;
}


pub mod metrics {
  use num_traits::{AsPrimitive, Num};

  pub trait Metric {
    const SYM: bool = false;

    fn compute<T: Num + AsPrimitive<f64>>(p1: (T, T), p2: (T, T)) -> f64;
  }


  pub struct Euclidean();

  impl Metric for Euclidean {
    const SYM: bool = true;

    fn compute<T: Num + AsPrimitive<f64>>(p1: (T, T), p2: (T, T)) -> f64 {
      let a = p1.0.as_() - p2.0.as_();
      let b = p1.1.as_() - p2.1.as_();
      (a*a + b*b).sqrt()
    }
  }

}

pub mod darp;
