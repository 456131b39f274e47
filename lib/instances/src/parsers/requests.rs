use std::path::Path;
use crate::Result;
use crate::raw::darp::*;
use super::{
  ParseInstance,
  to_anyhow,
  nom_prelude::*
};

#[derive(Debug, Copy, Clone)]
pub struct RequestFmt<P>(pub P);

impl<P: AsRef<Path>> ParseInstance<RequestFmt<P>> for RequestFile {
  fn parse(path: RequestFmt<P>) -> Result<RequestFile> {
    let path = path.0.as_ref();
    let data = std::fs::read_to_string(path)?;
    data.parse()
  }
}

impl FromStr for RequestFile {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    match parsers::request_file(s).finish() {
      Ok((_, instance)) => Ok(instance),
      Err(e) => Err(to_anyhow(s, e)),
    }
  }
}


mod parsers {
  use super::*;
  use crate::parsers::common::*;

  fn request_line<'a, E>(input: &'a str) -> IResult<&'a str, RawRequest, E>
    where
      E: ParseError<&'a str> + FromExternalError<&'a str, ParseIntError>
  {
    // 3   12  4   2.0  1   540  NaN
    let (input, (id, origin, destination, service_time, demand, earliest_pickup, latest_dropoff)) =
      preceded(multispace0, tuple((
        terminated(usize_, space1),  // id
        terminated(usize_, space1),  // origin station
        terminated(usize_, space1),  // destination station
        terminated(double, space1),  // service time
        terminated(i32_, space1),    // demand
        terminated(opt_time, space1),
        terminated(opt_time, line_end),
      )))(input)?;

    Ok((input, RawRequest {
      id,
      origin,
      destination,
      service_time,
      demand,
      earliest_pickup,
      latest_dropoff,
    }))
  }

  pub fn request_file(input: &str) -> IResult<&str, RequestFile, error::VerboseError<&str>> {
    let usize_space = |i| terminated(usize_, space1)(i);
    let dbl_space = |i| terminated(double, space1)(i);

    let (input, (num_vehicles, num_requests, num_stations, max_route_duration, vehicle_capacity, alpha, beta)) =
      preceded(multispace0, tuple((
        context("number of vehicles", usize_space),
        context("number of requests", usize_space),
        context("number of stations", usize_space),
        context("max route duration", dbl_space),
        context("vehicle capacity", usize_space),
        context("alpha", dbl_space),
        context("beta", terminated(double, line_end)),
      )))(input)?;

    let (input, requests) = context(
      "request lines",
      many_m_n(num_requests, num_requests, request_line)
    )(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = context("end of request list", eof)(input)?;

    Ok((input, RequestFile {
      num_vehicles,
      num_requests,
      num_stations,
      max_route_duration,
      vehicle_capacity,
      alpha,
      beta,
      requests,
    }))
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  const SMALL: &str = "2 2 4 100 3 1.5 20\n1 1 3 2 1 0 x\n2 2 4 2 1 10 NaN\n";

  #[test]
  fn small() -> Result<()> {
    let r: RequestFile = SMALL.parse()?;
    assert_eq!(r.num_vehicles, 2);
    assert_eq!(r.num_requests, 2);
    assert_eq!(r.num_stations, 4);
    assert_eq!(r.max_route_duration, 100.0);
    assert_eq!(r.vehicle_capacity, 3);
    assert_eq!(r.alpha, 1.5);
    assert_eq!(r.beta, 20.0);
    assert_eq!(r.requests[1], RawRequest {
      id: 2,
      origin: 2,
      destination: 4,
      service_time: 2.0,
      demand: 1,
      earliest_pickup: Some(10.0),
      latest_dropoff: None,
    });
    assert_eq!(r.requests[0].latest_dropoff, None);
    Ok(())
  }

  #[test]
  fn no_trailing_newline() -> Result<()> {
    let r: RequestFile = SMALL.trim_end().parse()?;
    assert_eq!(r.requests.len(), 2);
    Ok(())
  }

  #[test]
  fn wrong_request_count() {
    assert!("2 3 4 100 3 1.5 20\n1 1 3 2 1 0 x\n2 2 4 2 1 10 NaN\n".parse::<RequestFile>().is_err());
    assert!("2 1 4 100 3 1.5 20\n1 1 3 2 1 0 x\n2 2 4 2 1 10 NaN\n".parse::<RequestFile>().is_err());
  }

  #[test]
  fn malformed_field() {
    assert!("2 2 4 100 3 1.5 20\n1 1 three 2 1 0 x\n2 2 4 2 1 10 NaN\n".parse::<RequestFile>().is_err());
  }

  #[test]
  fn missing_file() {
    assert!(RequestFile::parse(RequestFmt("/nonexistent/requests.txt")).is_err());
  }
}
