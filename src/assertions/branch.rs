use {
  crate::{
    chain::AssertionCreationInfo,
    error::ValidatorError,
    primitives::AssertionHash,
  },
  serde::{Deserialize, Serialize},
  std::{
    collections::{HashMap, HashSet},
    path::Path,
  },
  tracing::{debug, info},
};

/// The branch of the assertion tree this validator agrees with.
///
/// Grows strictly forward: the only mutation is appending a child
/// of the current tip, so the map always forms a parent chain back
/// to genesis and no two entries share a parent (siblings are
/// collapsed to the one we agreed with). Single writer: the
/// assertion manager task. Everyone else sees snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalBranch {
  genesis: AssertionHash,
  latest_agreed: AssertionHash,
  assertions: HashMap<AssertionHash, AssertionCreationInfo>,

  /// Parents already extended from, to enforce sibling collapse.
  parents_used: HashSet<AssertionHash>,
}

/// Cheap copy of the branch tip published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchSnapshot {
  pub latest_agreed: AssertionHash,
  pub len: usize,
}

impl CanonicalBranch {
  pub fn new(genesis: AssertionCreationInfo) -> Self {
    let hash = genesis.hash;
    let mut assertions = HashMap::new();
    assertions.insert(hash, genesis);
    Self {
      genesis: hash,
      latest_agreed: hash,
      assertions,
      parents_used: HashSet::new(),
    }
  }

  pub fn genesis(&self) -> AssertionHash {
    self.genesis
  }

  pub fn latest_agreed(&self) -> AssertionHash {
    self.latest_agreed
  }

  pub fn contains(&self, hash: &AssertionHash) -> bool {
    self.assertions.contains_key(hash)
  }

  pub fn get(&self, hash: &AssertionHash) -> Option<&AssertionCreationInfo> {
    self.assertions.get(hash)
  }

  pub fn len(&self) -> usize {
    self.assertions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.assertions.is_empty()
  }

  pub fn snapshot(&self) -> BranchSnapshot {
    BranchSnapshot {
      latest_agreed: self.latest_agreed,
      len: self.len(),
    }
  }

  /// Appends an agreed assertion at the tip.
  pub fn extend(
    &mut self,
    info: AssertionCreationInfo,
  ) -> Result<(), ValidatorError> {
    if info.parent != self.latest_agreed {
      return Err(ValidatorError::fatal(format!(
        "extending canonical branch with {:?} whose parent {:?} is not the \
         tip {:?}",
        info.hash, info.parent, self.latest_agreed
      )));
    }
    if !self.parents_used.insert(info.parent) {
      return Err(ValidatorError::fatal(format!(
        "two canonical assertions share parent {:?}",
        info.parent
      )));
    }
    debug!("canonical branch advanced to {:?}", info.hash);
    self.latest_agreed = info.hash;
    self.assertions.insert(info.hash, info);
    Ok(())
  }

  /// Walks parent pointers from the tip back to genesis, checking
  /// every entry is visited exactly once.
  pub fn verify_links(&self) -> bool {
    let mut visited = 0;
    let mut cursor = self.latest_agreed;
    loop {
      let Some(info) = self.assertions.get(&cursor) else {
        return false;
      };
      visited += 1;
      if cursor == self.genesis {
        return visited == self.assertions.len();
      }
      cursor = info.parent;
    }
  }

  /// Persists the branch so a restart can skip re-classifying old
  /// assertions. The system works without this, it is purely a
  /// startup optimization.
  pub fn checkpoint(&self, path: &Path) -> Result<(), std::io::Error> {
    let bytes = bincode::serialize(self).map_err(|e| {
      std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    })?;
    std::fs::write(path, bytes)?;
    debug!("checkpointed {} canonical assertions", self.len());
    Ok(())
  }

  pub fn restore(path: &Path) -> Result<Self, std::io::Error> {
    let bytes = std::fs::read(path)?;
    let branch: Self = bincode::deserialize(&bytes).map_err(|e| {
      std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    })?;
    if !branch.verify_links() {
      return Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "checkpoint does not form a parent chain back to genesis",
      ));
    }
    info!(
      "restored canonical branch with {} assertions, tip {:?}",
      branch.len(),
      branch.latest_agreed
    );
    Ok(branch)
  }
}
