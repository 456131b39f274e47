use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::path::PathBuf;
use std::io;
use anyhow::Result;
use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
pub struct OutputOptions {
  #[structopt(long="format", short="f", parse(try_from_str), default_value="json-summ", possible_values=&OUTPUT_FORMAT_STRINGS)]
  pub fmt: OutputFormat,
  #[structopt(long="output", short="o")]
  pub file: Option<PathBuf>,
  /// Also write the log as newline-delimited JSON to this file.
  #[structopt(long)]
  pub log: Option<PathBuf>,
}

pub fn clap_range_validator<T>(minval: Option<T>, maxval: Option<T>) -> impl Fn(String) -> Result<(), String>
    where
        T: FromStr + PartialOrd + Display + Copy,
        T::Err: Display
{
    move |val| {
        let x: T = val.parse().map_err(|e: T::Err| e.to_string())?;
        if let Some(y) = minval {
            if x < y { return Err(format!("must be at least {}", y)); }
        }
        if let Some(y) = maxval {
            if x > y { return Err(format!("must be at most {}", y)); }
        }
        Ok(())
    }
}

pub const OUTPUT_FORMAT_STRINGS: [&str; 2] = ["json", "json-summ"];

#[derive(Debug, Copy, Clone)]
pub enum OutputFormat {
    Json,
    JsonSummary,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "json-summ" => Ok(Self::JsonSummary),
            _ => Err(format!("invalid string: {}", s))
        }
    }
}

impl Default for OutputFormat {
  fn default() -> Self { OutputFormat::JsonSummary }
}


pub trait Report {
    fn to_json(&self) -> json::JsonValue;
    fn to_json_summary(&self) -> json::JsonValue;

    fn write(&self, mut buf: impl io::Write, output: OutputFormat) -> Result<()> {
        let root = match output {
            OutputFormat::JsonSummary => self.to_json_summary(),
            OutputFormat::Json => self.to_json(),
        };
        root.write_pretty(&mut buf, 2)?;
        writeln!(buf)?;
        Ok(())
    }
}

pub fn output_report(options: &OutputOptions, report: &impl Report) -> Result<()> {
  match options.file.as_ref() {
    Some(path) => {
      let writer = io::BufWriter::new(std::fs::File::create(path)?);
      report.write(writer, options.fmt)?;
    }
    None => {
      report.write(io::stdout(), options.fmt)?;
    }
  }
  Ok(())
}
