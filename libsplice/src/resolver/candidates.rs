/// Duplicate-free set of addresses a symbol might have.
///
/// Insertion order is kept so diagnostics and search order are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSet {
    vals: Vec<u64>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(val: u64) -> Self {
        Self { vals: vec![val] }
    }

    /// Returns false if `val` was already present
    pub fn add(&mut self, val: u64) -> bool {
        if self.vals.contains(&val) {
            return false;
        }
        self.vals.push(val);
        true
    }

    pub fn remove(&mut self, val: u64) -> bool {
        let before = self.vals.len();
        self.vals.retain(|v| *v != val);
        self.vals.len() != before
    }

    pub fn contains(&self, val: u64) -> bool {
        self.vals.contains(&val)
    }

    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    /// Exactly one member
    pub fn is_singular(&self) -> bool {
        self.vals.len() == 1
    }

    /// The member of a singular set
    pub fn value(&self) -> Option<u64> {
        match self.vals.as_slice() {
            [val] => Some(*val),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.vals.iter().copied()
    }

    pub fn clear(&mut self) {
        self.vals.clear();
    }
}

impl Extend<u64> for CandidateSet {
    fn extend<I: IntoIterator<Item = u64>>(&mut self, iter: I) {
        for val in iter {
            self.add(val);
        }
    }
}

impl FromIterator<u64> for CandidateSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}
