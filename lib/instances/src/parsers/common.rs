use super::nom_prelude::*;
use std::num::ParseIntError;
use std::str::FromStr;

pub fn usize_<'a, E>(input: &'a str) -> IResult<&'a str, usize, E>
  where
    E: ParseError<&'a str> + error::FromExternalError<&'a str, ParseIntError>
{
  map_res(digit1, usize::from_str)(input)
}

pub fn i32_<'a, E>(input: &'a str) -> IResult<&'a str, i32, E>
  where
    E: ParseError<&'a str> + error::FromExternalError<&'a str, ParseIntError>
{
  map_res(
    recognize(
      pair(
        opt(char('-')),
        digit1
      )
    ), i32::from_str)(input)
}

/// Succeeds without consuming input if the next token ends here.
pub fn token_end<'a, E>(input: &'a str) -> IResult<&'a str, (), E>
  where
    E: ParseError<&'a str>
{
  value((), peek(alt((space1, line_ending, eof))))(input)
}

/// Remainder of a line: trailing blanks, then a line break or the end of input.
pub fn line_end<'a, E>(input: &'a str) -> IResult<&'a str, (), E>
  where
    E: ParseError<&'a str>
{
  value((), pair(space0, alt((line_ending, eof))))(input)
}

/// A time value, or `None` for `NaN` and any non-numeric placeholder.
pub fn opt_time<'a, E>(input: &'a str) -> IResult<&'a str, Option<f64>, E>
  where
    E: ParseError<&'a str>
{
  alt((
    map(terminated(double, token_end), |t: f64| if t.is_nan() { None } else { Some(t) }),
    value(None, is_not(" \t\r\n")),
  ))(input)
}

/// Whitespace separated rows of numbers, one row per line.
pub fn number_rows<'a, E>(input: &'a str) -> IResult<&'a str, Vec<Vec<f64>>, E>
  where
    E: ParseError<&'a str>
{
  let row = preceded(space0, separated_list1(space1, double));
  let (input, _) = multispace0(input)?;
  let (input, rows) = many1(terminated(row, line_end))(input)?;
  let (input, _) = multispace0(input)?;
  let (input, _) = eof(input)?;
  Ok((input, rows))
}


#[cfg(test)]
mod tests {
  use super::*;
  use nom::error::VerboseError;

  type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

  #[test]
  fn unknown_time_markers() {
    let r: Res<_> = opt_time("NaN 3");
    assert_eq!(r.unwrap(), (" 3", None));
    let r: Res<_> = opt_time("x\n");
    assert_eq!(r.unwrap(), ("\n", None));
    let r: Res<_> = opt_time("-");
    assert_eq!(r.unwrap(), ("", None));
    let r: Res<_> = opt_time("12.5");
    assert_eq!(r.unwrap(), ("", Some(12.5)));
  }

  #[test]
  fn rows() {
    let r: Res<_> = number_rows("0 1 2\n1 0 3  \n2 3 0");
    assert_eq!(r.unwrap().1, vec![vec![0., 1., 2.], vec![1., 0., 3.], vec![2., 3., 0.]]);
  }

  #[test]
  fn negative_demand() {
    let r: Res<_> = i32_("-2 ");
    assert_eq!(r.unwrap(), (" ", -2));
  }
}
