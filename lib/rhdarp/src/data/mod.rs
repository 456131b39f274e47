use std::path::Path;
use anyhow::Result;
use instances::parsers::{ParseInstance, RequestFmt};
use instances::raw::{FromRaw, darp::RequestFile};
use crate::DarpError;

pub mod darp;
pub mod distances;

pub use darp::*;
pub use distances::DistanceMode;

/// Read an instance file and generate its distances.  The instance is named after the
/// file stem.
pub fn load_instance(path: impl AsRef<Path>, mode: &DistanceMode) -> Result<DarpInstance> {
  let path = path.as_ref();
  let raw = RequestFile::parse(RequestFmt(path))
    .map_err(|e| DarpError::Parse(format!("{}: {:#}", path.display(), e)))?;
  let name = path.file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.display().to_string());
  let mut data = DarpInstance::from_raw(raw, name.into())?;
  data.generate_distances(mode)?;
  Ok(data)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_file() {
    let err = load_instance("/nonexistent/instance.txt", &DistanceMode::Unit).unwrap_err();
    assert!(matches!(err.downcast_ref::<DarpError>(), Some(DarpError::Parse(_))));
  }

  #[test]
  fn from_file() -> Result<()> {
    let path = std::env::temp_dir().join(format!("rhdarp-load-{}.txt", std::process::id()));
    std::fs::write(&path, "2 2 4 100 3 1.5 20\n1 1 3 2 1 0 x\n2 2 4 2 1 10 x\n")?;
    let data = load_instance(&path, &DistanceMode::Unit)?;
    std::fs::remove_file(&path)?;
    assert_eq!(data.n, 2);
    assert_eq!(data.d_direct[&2], 2.0);
    assert!(data.id.starts_with("rhdarp-load"));
    Ok(())
  }

  #[test]
  fn bad_station_files() -> Result<()> {
    let dir = std::env::temp_dir();
    let instance = dir.join(format!("rhdarp-stations-{}.txt", std::process::id()));
    let matrix = dir.join(format!("rhdarp-matrix-{}.txt", std::process::id()));
    std::fs::write(&instance, "1 1 4 100 3 1.5 20\n1 1 3 2 1 0 x\n")?;
    std::fs::write(&matrix, "0 1 two\n1 0\n")?;

    let bad_matrix = load_instance(&instance, &DistanceMode::Matrix(matrix.clone()));
    let no_coords = load_instance(&instance, &DistanceMode::Coordinates {
      path: dir.join("rhdarp-no-such-coordinates.txt"),
      shortcuts: false,
    });
    std::fs::remove_file(&instance)?;
    std::fs::remove_file(&matrix)?;

    for err in [bad_matrix.unwrap_err(), no_coords.unwrap_err()] {
      assert!(matches!(err.downcast_ref::<DarpError>(), Some(DarpError::Parse(_))), "{:#}", err);
    }
    Ok(())
  }
}
