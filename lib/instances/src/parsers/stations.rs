use std::path::Path;
use crate::{Result, Map};
use crate::raw::darp::*;
use super::{
  ParseInstance,
  to_anyhow,
  nom_prelude::*
};

#[derive(Debug, Copy, Clone)]
pub struct DistanceMatrixFmt<P>(pub P);

#[derive(Debug, Copy, Clone)]
pub struct LocationFmt<P>(pub P);

impl<P: AsRef<Path>> ParseInstance<DistanceMatrixFmt<P>> for StationDistances {
  fn parse(path: DistanceMatrixFmt<P>) -> Result<StationDistances> {
    let data = std::fs::read_to_string(path.0.as_ref())?;
    data.parse()
  }
}

impl FromStr for StationDistances {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    let matrix = match super::common::number_rows::<error::VerboseError<&str>>(s).finish() {
      Ok((_, rows)) => rows,
      Err(e) => return Err(to_anyhow(s, e)),
    };
    let n = matrix.len();
    if let Some((k, row)) = matrix.iter().enumerate().find(|(_, row)| row.len() != n) {
      anyhow::bail!("distance matrix must be square: row {} has {} entries, expected {}", k + 1, row.len(), n)
    }
    Ok(StationDistances { matrix })
  }
}

impl<P: AsRef<Path>> ParseInstance<LocationFmt<P>> for StationLocations {
  fn parse(path: LocationFmt<P>) -> Result<StationLocations> {
    let data = std::fs::read_to_string(path.0.as_ref())?;
    data.parse()
  }
}

impl FromStr for StationLocations {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    match parsers::locations(s).finish() {
      Ok((_, lines)) => {
        let mut coords = Map::default();
        for (station, x, y) in lines {
          if coords.insert(station, (x, y)).is_some() {
            anyhow::bail!("station {} listed twice", station)
          }
        }
        Ok(StationLocations { coords })
      }
      Err(e) => Err(to_anyhow(s, e)),
    }
  }
}


mod parsers {
  use super::*;
  use crate::parsers::common::*;

  pub fn locations(input: &str) -> IResult<&str, Vec<(usize, f64, f64)>, error::VerboseError<&str>> {
    // 4  10.5  -3.0
    let line = tuple((
      preceded(space0, usize_),
      preceded(space1, double),
      preceded(space1, double),
    ));
    let (input, _) = multispace0(input)?;
    let (input, lines) = many1(terminated(line, line_end))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = eof(input)?;
    Ok((input, lines))
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn matrix() -> Result<()> {
    let m: StationDistances = "0 2.5\n2.5 0\n".parse()?;
    assert_eq!(m.num_stations(), 2);
    assert_eq!(m.get(1, 2), Some(2.5));
    assert_eq!(m.get(0, 2), None);
    assert_eq!(m.get(3, 1), None);
    Ok(())
  }

  #[test]
  fn ragged_matrix() {
    assert!("0 1 2\n1 0\n2 1 0\n".parse::<StationDistances>().is_err());
  }

  #[test]
  fn locations() -> Result<()> {
    let l: StationLocations = "1 0 0\n2 3.0 4.0\n3 -1 2".parse()?;
    assert_eq!(l.coords.len(), 3);
    assert_eq!(l.coords[&2], (3.0, 4.0));
    assert!("1 0 0\n1 3 4\n".parse::<StationLocations>().is_err());
    Ok(())
  }
}
