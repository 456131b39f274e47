use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use crate::Error;
use std::borrow::Cow;


pub trait IdxNameMap {
  fn index_to_name(&self, idx: usize) -> Result<Cow<str>>;

  fn name_to_index(&self, name: &str) -> Result<usize>;

  fn len(&self) -> usize;

  fn is_empty(&self) -> bool { self.len() == 0 }

  fn check_idx(&self, idx: usize) -> Result<()> {
    if self.len() <= idx {
      Err(Error::IndexOutOfRange.into())
    } else {
      Ok(())
    }
  }
}


impl<'a, D: IdxNameMap> IdxNameMap for &'a D {
  fn index_to_name(&self, idx: usize) -> Result<Cow<str>> {
    D::index_to_name(self, idx)
  }

  fn name_to_index(&self, name: &str) -> Result<usize> {
    D::name_to_index(self, name)
  }

  fn len(&self) -> usize {
    D::len(self)
  }
}

pub trait Dataset: IdxNameMap + Sync {
  type Instance;
  fn load_instance(&self, idx: usize) -> Result<Self::Instance>;
}


impl<'a, D: Dataset> Dataset for &'a D {
  type Instance = D::Instance;

  fn load_instance(&self, idx: usize) -> Result<Self::Instance> {
    D::load_instance(self, idx)
  }
}


/// A directory of instance files matched by a glob pattern.
/// Instances are named by their file stem and ordered by path.
/// Files whose stem is listed in `exclude` are skipped, which keeps station files that
/// live next to the request files out of the dataset.
pub struct DirLayout<D> {
  _marker: PhantomData<D>,
  name_order: Vec<PathBuf>,
  name_to_idx_map: HashMap<String, usize>,
}

impl<D> DirLayout<D> {
  pub fn new(dir: impl AsRef<Path>, patt: &str, exclude: &[&str]) -> Result<Self> {
    let dir = dir.as_ref();
    let dir = dir.canonicalize().with_context(|| format!("try read directory {:?}", dir))?;

    let mut p = dir.to_string_lossy().into_owned();
    p.push('/');
    p.push_str(patt);

    let names : std::result::Result<Vec<PathBuf>, _> = glob::glob(&p)?.collect();
    let mut name_order = names?;
    name_order.retain(|p| {
      p.is_file() && !p.file_stem().map_or(false, |s| exclude.iter().any(|e| s.to_string_lossy() == *e))
    });
    name_order.sort();

    let name_to_idx_map: Result<HashMap<_, _>> = name_order.iter()
      .enumerate()
      .map(|(k, p)| {
        let n = p.file_stem().ok_or_else(|| anyhow::anyhow!("missing file stem: {:?}", p))?;
        Ok((n.to_string_lossy().into_owned(), k))
      })
      .collect();
    let name_to_idx_map = name_to_idx_map?;
    Ok(DirLayout {
      _marker: Default::default(),
      name_order,
      name_to_idx_map
    })
  }

  pub fn path(&self, idx: usize) -> Option<&Path> {
    self.name_order.get(idx).map(|p| p.as_path())
  }
}

impl<D> IdxNameMap for DirLayout<D> {
  fn index_to_name(&self, idx: usize) -> Result<Cow<str>> {
    self.check_idx(idx)?;
    let name = self.name_order[idx].file_stem()
      .ok_or_else(|| anyhow::anyhow!("missing file stem for idx {}", idx))?;
    Ok(name.to_string_lossy())
  }

  fn name_to_index(&self, name: &str) -> Result<usize> {
    let idx = *self.name_to_idx_map.get(name).ok_or(Error::UnkownInstanceName)?;
    Ok(idx)
  }

  fn len(&self) -> usize { self.name_order.len() }
}

pub mod darp;
