mod requests;
pub use requests::RequestFmt;

mod stations;
pub use stations::{DistanceMatrixFmt, LocationFmt};


mod nom_prelude {
  pub use nom::{
    IResult, Parser,
    error::{
      self,
      ParseError,
      FromExternalError,
      context,
    },
    branch::alt,
    sequence::*,
    multi::*,
    combinator::*,
    character::complete::*,
    bytes::complete::{tag, is_not},
    number::complete::double,
    Finish,
  };
  pub use std::str::FromStr;
  pub use std::num::{ParseIntError, ParseFloatError};
}

mod common;

pub trait ParseInstance<Fmt>: Sized {
  fn parse(inputs: Fmt) -> crate::Result<Self>;
}

fn to_anyhow(input: &str, e: nom::error::VerboseError<&str>) -> anyhow::Error {
  anyhow::Error::msg(nom::error::convert_error(input, e))
}
