use super::*;
use crate::parsers::{ParseInstance, RequestFmt};
use crate::raw::darp::RequestFile;

/// Request files in the whitespace-separated format.
pub enum RequestFiles {}

impl Dataset for DirLayout<RequestFiles> {
  type Instance = RequestFile;

  fn load_instance(&self, idx: usize) -> Result<Self::Instance> {
    self.check_idx(idx)?;
    let path = &self.name_order[idx];
    RequestFile::parse(RequestFmt(path)).with_context(|| format!("failed to load {:?}", path))
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("instances-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  #[test]
  fn directory_dataset() -> Result<()> {
    let dir = scratch_dir("dset");
    std::fs::write(dir.join("b.txt"), "1 1 2 50 2 1.5 10\n1 1 2 1 1 0 x\n")?;
    std::fs::write(dir.join("a.txt"), "1 0 2 50 2 1.5 10\n")?;
    std::fs::write(dir.join("stations.txt"), "0 1\n1 0\n")?;

    let dset = DirLayout::<RequestFiles>::new(&dir, "*.txt", &["stations"])?;
    assert_eq!(dset.len(), 2);
    assert_eq!(dset.index_to_name(0)?, "a");
    assert_eq!(dset.name_to_index("b")?, 1);
    assert!(dset.name_to_index("stations").is_err());
    assert!(dset.index_to_name(2).is_err());

    let b = dset.load_instance(1)?;
    assert_eq!(b.num_requests, 1);
    assert_eq!(b.requests[0].earliest_pickup, Some(0.0));
    std::fs::remove_dir_all(&dir)?;
    Ok(())
  }

  #[test]
  fn missing_directory() {
    assert!(DirLayout::<RequestFiles>::new("/nonexistent/instances", "*.txt", &[]).is_err());
  }
}
